//! The paravirtual port protocol.
//!
//! The guest requests host services by writing a 32-bit guest-physical
//! offset to one of a fixed set of I/O ports. The offset points at an
//! argument structure in guest memory whose layout is part of the wire
//! contract with the guest and must be preserved bit-exactly. Any pointer
//! embedded in an argument structure is a guest-virtual address and must be
//! translated before the host touches it.
//!
//! The port numbers themselves are equally load-bearing: the guest kernel
//! has them compiled in.

use thiserror::Error;
use vm_memory::ByteValued;

// ═══════════════════════════════════════════════════════════════════════
//  Port numbers (wire contract)
// ═══════════════════════════════════════════════════════════════════════

pub const WRITE_PORT: u16 = 0x400;
pub const OPEN_PORT: u16 = 0x440;
pub const CLOSE_PORT: u16 = 0x480;
pub const READ_PORT: u16 = 0x500;
pub const EXIT_PORT: u16 = 0x540;
pub const LSEEK_PORT: u16 = 0x580;
pub const NETINFO_PORT: u16 = 0x600;
pub const NETWRITE_PORT: u16 = 0x640;
pub const NETREAD_PORT: u16 = 0x680;
pub const NETSTAT_PORT: u16 = 0x700;
pub const FREELIST_PORT: u16 = 0x720;
pub const CMDSIZE_PORT: u16 = 0x740;
pub const CMDVAL_PORT: u16 = 0x780;
pub const UART_PORT: u16 = 0x800;

/// Base of the virtual IRQ lines kestrel raises.
pub const IRQ_BASE: u32 = 11;
/// IRQ line for inbound network frames.
pub const NET_IRQ: u32 = IRQ_BASE;
/// IRQ line for the migration trigger.
pub const MIGRATION_IRQ: u32 = IRQ_BASE + 1;

/// Maximum number of forwarded command-line arguments and environment
/// variables; fixed by the guest-side structure layout.
pub const MAX_ARGC_ENVC: usize = 128;

// ═══════════════════════════════════════════════════════════════════════
//  Argument structures (guest memory layout)
// ═══════════════════════════════════════════════════════════════════════

/// `write(fd, buf, len)`. The host stores the transferred byte count back
/// into `len`.
#[derive(Debug, Default, Clone, Copy)]
#[repr(C, packed)]
pub struct WriteArgs {
    pub fd: i32,
    /// Guest-virtual buffer address.
    pub buf: u64,
    pub len: u64,
}
unsafe impl ByteValued for WriteArgs {}

/// `read(fd, buf, len)`. The result lands in `ret`.
#[derive(Debug, Default, Clone, Copy)]
#[repr(C, packed)]
pub struct ReadArgs {
    pub fd: i32,
    /// Guest-virtual buffer address.
    pub buf: u64,
    pub len: u64,
    pub ret: i64,
}
unsafe impl ByteValued for ReadArgs {}

/// `open(name, flags, mode)`.
#[derive(Debug, Default, Clone, Copy)]
#[repr(C, packed)]
pub struct OpenArgs {
    /// Guest-virtual address of the NUL-terminated path.
    pub name: u64,
    pub flags: i32,
    pub mode: i32,
    pub ret: i32,
}
unsafe impl ByteValued for OpenArgs {}

/// `close(fd)`.
#[derive(Debug, Default, Clone, Copy)]
#[repr(C, packed)]
pub struct CloseArgs {
    pub fd: i32,
    pub ret: i32,
}
unsafe impl ByteValued for CloseArgs {}

/// `lseek(fd, offset, whence)`. The resulting offset overwrites `offset`.
#[derive(Debug, Default, Clone, Copy)]
#[repr(C, packed)]
pub struct LseekArgs {
    pub fd: i32,
    pub offset: i64,
    pub whence: i32,
}
unsafe impl ByteValued for LseekArgs {}

/// Guest exit code; the EXIT port's argument points directly at it.
#[derive(Debug, Default, Clone, Copy)]
#[repr(C, packed)]
pub struct ExitArgs {
    pub code: i32,
}
unsafe impl ByteValued for ExitArgs {}

/// NETINFO reply: the NIC MAC as a NUL-terminated string.
#[derive(Debug, Clone, Copy)]
#[repr(C, packed)]
pub struct NetInfoArgs {
    pub mac_str: [u8; 18],
}
unsafe impl ByteValued for NetInfoArgs {}

impl Default for NetInfoArgs {
    fn default() -> Self {
        Self { mac_str: [0; 18] }
    }
}

/// NETWRITE: transmit `len` bytes from the guest-virtual `data` buffer.
#[derive(Debug, Default, Clone, Copy)]
#[repr(C, packed)]
pub struct NetWriteArgs {
    pub data: u64,
    pub len: u64,
    pub ret: i32,
}
unsafe impl ByteValued for NetWriteArgs {}

/// NETREAD: receive into the guest-virtual `data` buffer.
#[derive(Debug, Default, Clone, Copy)]
#[repr(C, packed)]
pub struct NetReadArgs {
    pub data: u64,
    pub len: u64,
    pub ret: i32,
}
unsafe impl ByteValued for NetReadArgs {}

/// NETSTAT reply: nonzero when a network interface is configured.
#[derive(Debug, Default, Clone, Copy)]
#[repr(C, packed)]
pub struct NetStatArgs {
    pub status: i32,
}
unsafe impl ByteValued for NetStatArgs {}

/// CMDSIZE reply: argument and environment counts with per-entry sizes
/// (including NUL terminators).
#[derive(Debug, Clone, Copy)]
#[repr(C, packed)]
pub struct CmdsizeArgs {
    pub argc: i32,
    pub argsz: [i32; MAX_ARGC_ENVC],
    pub envc: i32,
    pub envsz: [i32; MAX_ARGC_ENVC],
}
unsafe impl ByteValued for CmdsizeArgs {}

impl Default for CmdsizeArgs {
    fn default() -> Self {
        Self {
            argc: 0,
            argsz: [0; MAX_ARGC_ENVC],
            envc: 0,
            envsz: [0; MAX_ARGC_ENVC],
        }
    }
}

/// CMDVAL: guest-side pointer arrays to copy the strings into.
#[derive(Debug, Default, Clone, Copy)]
#[repr(C, packed)]
pub struct CmdvalArgs {
    pub argv: u64,
    pub envp: u64,
}
unsafe impl ByteValued for CmdvalArgs {}

/// One node of the guest's free-memory list, advertised through the
/// FREELIST port. `next` and `prev` are guest-virtual addresses.
#[derive(Debug, Default, Clone, Copy)]
#[repr(C, packed)]
pub struct FreeListNode {
    pub start: u64,
    pub end: u64,
    pub next: u64,
    pub prev: u64,
}
unsafe impl ByteValued for FreeListNode {}

// ═══════════════════════════════════════════════════════════════════════
//  Tagged dispatch
// ═══════════════════════════════════════════════════════════════════════

/// A decoded hypercall: which service the guest requested and the
/// guest-physical offset of its argument structure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Hypercall {
    /// One byte for the host's stderr; the port value is the byte itself.
    Uart(u8),
    Write(u64),
    Read(u64),
    Open(u64),
    Close(u64),
    Lseek(u64),
    Exit(u64),
    Netinfo(u64),
    Netwrite(u64),
    Netread(u64),
    Netstat(u64),
    Freelist(u64),
    Cmdsize(u64),
    Cmdval(u64),
}

/// An I/O exit on a port outside the paravirtual set.
#[derive(Error, Debug)]
#[error("unhandled guest I/O at port {port:#x} (value {value:#x})")]
pub struct UnknownPort {
    pub port: u16,
    pub value: u32,
}

impl Hypercall {
    /// Decode a guest port write into a hypercall.
    ///
    /// `value` is the 32-bit datum the guest wrote: the argument offset for
    /// every port except UART, where it is the character itself.
    pub fn decode(port: u16, value: u32) -> Result<Self, UnknownPort> {
        let addr = u64::from(value);
        Ok(match port {
            UART_PORT => Hypercall::Uart(value as u8),
            WRITE_PORT => Hypercall::Write(addr),
            READ_PORT => Hypercall::Read(addr),
            OPEN_PORT => Hypercall::Open(addr),
            CLOSE_PORT => Hypercall::Close(addr),
            LSEEK_PORT => Hypercall::Lseek(addr),
            EXIT_PORT => Hypercall::Exit(addr),
            NETINFO_PORT => Hypercall::Netinfo(addr),
            NETWRITE_PORT => Hypercall::Netwrite(addr),
            NETREAD_PORT => Hypercall::Netread(addr),
            NETSTAT_PORT => Hypercall::Netstat(addr),
            FREELIST_PORT => Hypercall::Freelist(addr),
            CMDSIZE_PORT => Hypercall::Cmdsize(addr),
            CMDVAL_PORT => Hypercall::Cmdval(addr),
            _ => return Err(UnknownPort { port, value }),
        })
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  Tests
// ═══════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;
    use std::mem::size_of;

    #[test]
    fn port_numbers_are_bit_exact() {
        assert_eq!(WRITE_PORT, 0x400);
        assert_eq!(OPEN_PORT, 0x440);
        assert_eq!(CLOSE_PORT, 0x480);
        assert_eq!(READ_PORT, 0x500);
        assert_eq!(EXIT_PORT, 0x540);
        assert_eq!(LSEEK_PORT, 0x580);
        assert_eq!(NETINFO_PORT, 0x600);
        assert_eq!(NETWRITE_PORT, 0x640);
        assert_eq!(NETREAD_PORT, 0x680);
        assert_eq!(NETSTAT_PORT, 0x700);
        assert_eq!(FREELIST_PORT, 0x720);
        assert_eq!(CMDSIZE_PORT, 0x740);
        assert_eq!(CMDVAL_PORT, 0x780);
        assert_eq!(UART_PORT, 0x800);
        assert_eq!(NET_IRQ, 11);
        assert_eq!(MIGRATION_IRQ, 12);
    }

    #[test]
    fn packed_layouts() {
        // The guest compiles these layouts in; a size change breaks the
        // protocol.
        assert_eq!(size_of::<WriteArgs>(), 20);
        assert_eq!(size_of::<ReadArgs>(), 28);
        assert_eq!(size_of::<OpenArgs>(), 20);
        assert_eq!(size_of::<CloseArgs>(), 8);
        assert_eq!(size_of::<LseekArgs>(), 16);
        assert_eq!(size_of::<ExitArgs>(), 4);
        assert_eq!(size_of::<NetInfoArgs>(), 18);
        assert_eq!(size_of::<NetWriteArgs>(), 20);
        assert_eq!(size_of::<NetReadArgs>(), 20);
        assert_eq!(size_of::<NetStatArgs>(), 4);
        assert_eq!(size_of::<CmdsizeArgs>(), 8 + 2 * 4 * MAX_ARGC_ENVC);
        assert_eq!(size_of::<CmdvalArgs>(), 16);
        assert_eq!(size_of::<FreeListNode>(), 32);
    }

    #[test]
    fn decode_known_ports() {
        assert_eq!(
            Hypercall::decode(WRITE_PORT, 0x1234).unwrap(),
            Hypercall::Write(0x1234)
        );
        assert_eq!(
            Hypercall::decode(EXIT_PORT, 0x40).unwrap(),
            Hypercall::Exit(0x40)
        );
        assert_eq!(
            Hypercall::decode(FREELIST_PORT, 0).unwrap(),
            Hypercall::Freelist(0)
        );
    }

    #[test]
    fn decode_uart_takes_the_byte() {
        assert_eq!(Hypercall::decode(UART_PORT, b'A' as u32).unwrap(), Hypercall::Uart(b'A'));
        // Only the low byte matters.
        assert_eq!(Hypercall::decode(UART_PORT, 0x1F41).unwrap(), Hypercall::Uart(0x41));
    }

    #[test]
    fn decode_unknown_port_fails() {
        let err = Hypercall::decode(0x3F8, 0).unwrap_err();
        assert_eq!(err.port, 0x3F8);
    }

    #[test]
    fn args_roundtrip_through_bytes() {
        let args = WriteArgs {
            fd: 1,
            buf: 0xDEAD_0000,
            len: 6,
        };
        let copy = *WriteArgs::from_slice(args.as_slice()).unwrap();
        assert_eq!({ copy.fd }, 1);
        assert_eq!({ copy.buf }, 0xDEAD_0000);
        assert_eq!({ copy.len }, 6);
    }
}
