//! The per-vCPU run loop and hypercall execution.
//!
//! Every vCPU is a host thread that re-enters KVM_RUN in a loop and
//! services the guest's paravirtual port writes in between. Coordination
//! events (checkpoint, migration, shutdown) never preempt the loop from
//! the outside: the coordinator publishes an event, kicks the thread with
//! a real-time signal whose handler flips KVM's immediate-exit flag
//! through a thread-local pointer, and the loop services the event at the
//! next iteration boundary before rendezvousing on the shared barriers.

use std::cell::Cell;
use std::ffi::CString;
use std::io::Write as _;
use std::os::raw::{c_int, c_void};
use std::os::unix::ffi::OsStrExt;
use std::path::Path;
use std::sync::Arc;

use kvm_ioctls::{VcpuExit, VcpuFd};
use libc::siginfo_t;
use log::{debug, info};

use crate::checkpoint;
use crate::cpu;
use crate::hypercall::{
    CloseArgs, CmdsizeArgs, CmdvalArgs, ExitArgs, FreeListNode, Hypercall, LseekArgs, NetInfoArgs,
    NetReadArgs, NetWriteArgs, OpenArgs, ReadArgs, WriteArgs, MAX_ARGC_ENVC,
};
use crate::migration::MemRegion;
use crate::vm::{VmError, VmEvent, VmShared};

/// Signal used to kick a vCPU out of KVM_RUN.
pub fn kick_signal() -> c_int {
    libc::SIGRTMIN()
}

thread_local! {
    /// The running vCPU of this thread, registered for the duration of
    /// the run loop so the kick handler can reach its immediate-exit flag.
    static TLS_VCPU_FD: Cell<*mut VcpuFd> = const { Cell::new(std::ptr::null_mut()) };
}

/// Kick handler: request an immediate exit from the interrupted vCPU.
///
/// Runs in signal context; the only action is one store into the
/// kvm_run mapping of this thread's own vCPU.
pub extern "C" fn kick_handler(_num: c_int, _info: *mut siginfo_t, _ctx: *mut c_void) {
    TLS_VCPU_FD.with(|cell| {
        let ptr = cell.get();
        if !ptr.is_null() {
            unsafe { (*ptr).set_kvm_immediate_exit(1) };
        }
    });
}

/// What a serviced guest action means for the run loop.
enum RunOutcome {
    Continue,
    /// Clean halt of this vCPU.
    Halt,
    /// EXIT hypercall with the guest-supplied code.
    Exit(i32),
}

/// Owned summary of one KVM_RUN exit.
///
/// [`kvm_ioctls::VcpuExit`] borrows the vCPU's run page; copying the
/// relevant fields out releases that borrow before the exit is serviced.
enum Exit {
    /// Port write: the paravirtual protocol, or an MMIO-delivered
    /// equivalent where the address plays the port's role.
    Io { port: u16, value: u32 },
    Hlt,
    FailEntry { reason: u64, cpu: u32 },
    InternalError,
    Shutdown,
    Debug,
    Unknown(String),
    /// Kicked out of KVM_RUN; service the pending event.
    Interrupted,
    /// EFAULT from KVM_RUN.
    TranslationFault,
}

/// One virtual CPU bound to its host thread.
pub struct Vcpu {
    pub id: u32,
    pub fd: VcpuFd,
    shared: Arc<VmShared>,
}

impl Vcpu {
    /// Create vCPU `id` on the shared VM.
    pub fn new(shared: Arc<VmShared>, id: u32) -> Result<Self, VmError> {
        let fd = shared
            .vm
            .create_vcpu(u64::from(id))
            .map_err(|e| VmError::Kvm {
                what: "KVM_CREATE_VCPU",
                source: e,
            })?;
        Ok(Self { id, fd, shared })
    }

    /// Bring the vCPU to its initial state: restored from a checkpoint or
    /// migration image when one is pending, otherwise the long-mode boot
    /// state (which blocks until the guest releases this core).
    ///
    /// Returns `false` when the VM shut down before this core was
    /// released; the thread should end without entering the run loop.
    pub fn init(&self) -> Result<bool, VmError> {
        let pending = self.shared.take_restore_state(self.id);
        if let Some(state) = pending {
            cpu::restore_vcpu_state(
                &self.shared.kvm,
                &self.fd,
                &state,
                self.shared.tsc_deadline,
            )?;
            debug!("vCPU {} restored", self.id);
        } else {
            cpu::prepare_vcpu_boot(&self.shared.kvm, &self.fd, self.shared.tsc_deadline)?;
            // Coordination events must be serviced even while this core
            // waits for its boot turn, or the rendezvous barriers would
            // starve on a guest that boots its cores slowly.
            let released = cpu::wait_for_boot_turn(
                &self.shared.ram,
                self.shared.boot_base,
                self.id,
                || match self.shared.event() {
                    VmEvent::Shutdown => true,
                    VmEvent::Checkpoint => {
                        if let Err(e) = self.service_checkpoint() {
                            eprintln!("[ERROR] vCPU {}: {e}", self.id);
                            std::process::exit(1);
                        }
                        false
                    }
                    VmEvent::Migration => {
                        let _ = self.service_migration();
                        false
                    }
                    VmEvent::None => false,
                },
            )?;
            if !released {
                info!("vCPU {} never booted, VM is shutting down", self.id);
                return Ok(false);
            }
            cpu::enter_long_mode(&self.fd, self.shared.entry)?;
            debug!("vCPU {} initialized for boot", self.id);
        }
        Ok(true)
    }

    /// Run the vCPU until the guest halts it, exits, or the VM shuts
    /// down. Returns the guest exit code (0 for a clean halt).
    pub fn run(&mut self) -> Result<i32, VmError> {
        TLS_VCPU_FD.with(|cell| cell.set(&mut self.fd as *mut VcpuFd));
        let result = self.run_inner();
        TLS_VCPU_FD.with(|cell| cell.set(std::ptr::null_mut()));
        result
    }

    fn run_inner(&mut self) -> Result<i32, VmError> {
        loop {
            match self.shared.event() {
                VmEvent::None => {}
                VmEvent::Checkpoint => self.service_checkpoint()?,
                VmEvent::Migration => self.service_migration()?,
                VmEvent::Shutdown => return Ok(0),
            }

            match self.next_exit()? {
                Exit::Io { port, value } => match self.dispatch(port, value)? {
                    RunOutcome::Continue => {}
                    RunOutcome::Halt => return Ok(0),
                    RunOutcome::Exit(code) => return Ok(code),
                },
                Exit::Hlt => {
                    info!("guest halted vCPU {}, treating as a normal exit", self.id);
                    return Ok(0);
                }
                Exit::Interrupted => {
                    // Kicked; the event check at the loop top services it.
                    self.fd.set_kvm_immediate_exit(0);
                }
                Exit::FailEntry { reason, cpu: which } => {
                    cpu::dump_registers(&self.fd, self.id);
                    return Err(VmError::FatalGuest(format!(
                        "entry failure on cpu {which}: hardware reason {reason:#x}"
                    )));
                }
                Exit::InternalError => {
                    cpu::dump_registers(&self.fd, self.id);
                    return Err(VmError::FatalGuest("internal error exit".into()));
                }
                Exit::Shutdown => {
                    cpu::dump_registers(&self.fd, self.id);
                    return Err(VmError::FatalGuest("guest shutdown (triple fault)".into()));
                }
                Exit::Debug => {
                    // No debug stub is attached, so a debug exit is a bug.
                    cpu::dump_registers(&self.fd, self.id);
                    return Err(VmError::FatalGuest("unexpected debug exit".into()));
                }
                Exit::TranslationFault => {
                    cpu::dump_registers(&self.fd, self.id);
                    return Err(VmError::FatalGuest(
                        "host/guest translation fault in KVM_RUN".into(),
                    ));
                }
                Exit::Unknown(what) => {
                    return Err(VmError::FatalGuest(format!("unhandled exit: {what}")));
                }
            }
        }
    }

    /// Enter KVM_RUN once and summarize the exit.
    fn next_exit(&mut self) -> Result<Exit, VmError> {
        match self.fd.run() {
            Ok(VcpuExit::IoOut(port, data)) => Ok(Exit::Io {
                port,
                value: io_value(data),
            }),
            Ok(VcpuExit::MmioWrite(addr, data)) => Ok(Exit::Io {
                port: addr as u16,
                value: io_value(data),
            }),
            Ok(VcpuExit::Hlt) => Ok(Exit::Hlt),
            Ok(VcpuExit::FailEntry(reason, cpu)) => Ok(Exit::FailEntry { reason, cpu }),
            Ok(VcpuExit::InternalError) => Ok(Exit::InternalError),
            Ok(VcpuExit::Shutdown) => Ok(Exit::Shutdown),
            Ok(VcpuExit::Debug(_)) => Ok(Exit::Debug),
            Ok(exit) => Ok(Exit::Unknown(format!("{exit:?}"))),
            Err(e) if e.errno() == libc::EINTR => Ok(Exit::Interrupted),
            Err(e) if e.errno() == libc::EFAULT => Ok(Exit::TranslationFault),
            Err(e) => Err(VmError::Kvm {
                what: "KVM_RUN",
                source: e,
            }),
        }
    }

    // ─── Coordination events ─────────────────────────────────────────

    /// Checkpoint rendezvous: quiesce, write this vCPU's state file,
    /// wait for the coordinator's memory dump to finish.
    fn service_checkpoint(&self) -> Result<(), VmError> {
        let (dir, round) = self.shared.checkpoint_round();
        self.shared.chk_barrier.wait();

        let state = cpu::save_vcpu_state(&self.fd)?;
        checkpoint::write_core_state(&dir, round, self.id, &state)?;

        self.shared.chk_barrier.wait();
        Ok(())
    }

    /// Migration rendezvous: quiesce with the other vCPUs, deposit this
    /// vCPU's state for the coordinator, then park until the process
    /// exits. The initiator never resumes its vCPUs.
    fn service_migration(&self) -> Result<(), VmError> {
        self.shared.vcpu_quiesce.wait();

        let state = cpu::save_vcpu_state(&self.fd)?;
        self.shared.deposit_state(self.id, state);

        self.shared.mig_barrier.wait();

        loop {
            std::thread::park();
        }
    }

    // ─── Hypercall dispatch ──────────────────────────────────────────

    fn dispatch(&self, port: u16, value: u32) -> Result<RunOutcome, VmError> {
        let call = Hypercall::decode(port, value).map_err(VmError::UnknownPort)?;
        match call {
            Hypercall::Uart(byte) => {
                if self.shared.config.verbose {
                    let _ = std::io::stderr().write_all(&[byte]);
                }
            }
            Hypercall::Write(addr) => self.hc_write(addr)?,
            Hypercall::Read(addr) => self.hc_read(addr)?,
            Hypercall::Open(addr) => self.hc_open(addr)?,
            Hypercall::Close(addr) => self.hc_close(addr)?,
            Hypercall::Lseek(addr) => self.hc_lseek(addr)?,
            Hypercall::Exit(addr) => {
                let args: ExitArgs = self.shared.ram.read_obj(addr)?;
                return if self.id == 0 {
                    Ok(RunOutcome::Exit(args.code))
                } else {
                    // A secondary core only takes itself down.
                    Ok(RunOutcome::Halt)
                };
            }
            Hypercall::Netinfo(addr) => self.hc_netinfo(addr)?,
            Hypercall::Netwrite(addr) => self.hc_netwrite(addr)?,
            Hypercall::Netread(addr) => self.hc_netread(addr)?,
            Hypercall::Netstat(addr) => self.hc_netstat(addr)?,
            Hypercall::Freelist(addr) => self.hc_freelist(addr)?,
            Hypercall::Cmdsize(addr) => self.hc_cmdsize(addr)?,
            Hypercall::Cmdval(addr) => self.hc_cmdval(addr)?,
        }
        Ok(RunOutcome::Continue)
    }

    /// WRITE: the buffer is guest-virtual and may straddle mapping pages,
    /// so transfer page by page; a short host write truncates the count
    /// the guest sees rather than failing the hypercall.
    fn hc_write(&self, addr: u64) -> Result<(), VmError> {
        let ram = &self.shared.ram;
        let mut args: WriteArgs = ram.read_obj(addr)?;
        let (fd, buf, len) = ({ args.fd }, { args.buf }, { args.len });

        let mut written = 0u64;
        while written < len {
            let (pa, pa_end) = ram.virt_to_phys(buf + written, self.shared.entry)?;
            let step = (pa_end - pa).min(len - written) as usize;

            let mut scratch = vec![0u8; step];
            ram.read_bytes(pa, &mut scratch)?;
            let n = unsafe { libc::write(fd, scratch.as_ptr() as *const c_void, step) };
            if n <= 0 {
                break;
            }
            written += n as u64;
            if (n as usize) < step {
                break;
            }
        }

        args.len = written;
        ram.write_obj(addr, args)?;
        Ok(())
    }

    /// READ: mirror of WRITE with the transfer count reported in `ret`.
    fn hc_read(&self, addr: u64) -> Result<(), VmError> {
        let ram = &self.shared.ram;
        let mut args: ReadArgs = ram.read_obj(addr)?;
        let (fd, buf, len) = ({ args.fd }, { args.buf }, { args.len });

        let mut read = 0u64;
        while read < len {
            let (pa, pa_end) = ram.virt_to_phys(buf + read, self.shared.entry)?;
            let step = (pa_end - pa).min(len - read) as usize;

            let mut scratch = vec![0u8; step];
            let n = unsafe { libc::read(fd, scratch.as_mut_ptr() as *mut c_void, step) };
            if n <= 0 {
                break;
            }
            ram.write_bytes(pa, &scratch[..n as usize])?;
            read += n as u64;
            if (n as usize) < step {
                break;
            }
        }

        args.ret = read as i64;
        ram.write_obj(addr, args)?;
        Ok(())
    }

    /// OPEN: resolve the host-real path first and refuse to hand the
    /// guest the virtualization device.
    fn hc_open(&self, addr: u64) -> Result<(), VmError> {
        let ram = &self.shared.ram;
        let mut args: OpenArgs = ram.read_obj(addr)?;

        let name = self.read_guest_cstring({ args.name })?;
        let is_kvm = std::fs::canonicalize(std::ffi::OsStr::from_bytes(&name))
            .map(|p| p == Path::new("/dev/kvm"))
            .unwrap_or(false);

        args.ret = if is_kvm {
            -1
        } else {
            match CString::new(name) {
                Ok(cname) => unsafe {
                    libc::open(cname.as_ptr(), { args.flags }, { args.mode } as libc::c_uint)
                },
                Err(_) => -1,
            }
        };
        ram.write_obj(addr, args)?;
        Ok(())
    }

    /// CLOSE: the standard streams stay open; closing them reports
    /// success without acting.
    fn hc_close(&self, addr: u64) -> Result<(), VmError> {
        let ram = &self.shared.ram;
        let mut args: CloseArgs = ram.read_obj(addr)?;
        args.ret = if { args.fd } > 2 {
            unsafe { libc::close({ args.fd }) }
        } else {
            0
        };
        ram.write_obj(addr, args)?;
        Ok(())
    }

    fn hc_lseek(&self, addr: u64) -> Result<(), VmError> {
        let ram = &self.shared.ram;
        let mut args: LseekArgs = ram.read_obj(addr)?;
        args.offset = unsafe { libc::lseek({ args.fd }, { args.offset }, { args.whence }) };
        ram.write_obj(addr, args)?;
        Ok(())
    }

    /// NETINFO: hand out the MAC string and lazily start the inbound
    /// poll thread; the guest asking for the NIC identity is the signal
    /// that it is configuring the device.
    fn hc_netinfo(&self, addr: u64) -> Result<(), VmError> {
        let Some(net) = self.shared.net.as_ref() else {
            return Ok(());
        };
        let mut args: NetInfoArgs = self.shared.ram.read_obj(addr)?;
        args.mac_str = *net.tap.mac_str();
        self.shared.ram.write_obj(addr, args)?;
        self.shared.start_net_poll();
        Ok(())
    }

    /// NETWRITE: frames are contiguous in guest-physical memory; push the
    /// whole frame out, retrying short writes.
    fn hc_netwrite(&self, addr: u64) -> Result<(), VmError> {
        let ram = &self.shared.ram;
        let mut args: NetWriteArgs = ram.read_obj(addr)?;
        let Some(net) = self.shared.net.as_ref() else {
            args.ret = -1;
            ram.write_obj(addr, args)?;
            return Ok(());
        };

        let len = { args.len } as usize;
        let mut frame = vec![0u8; len];
        ram.read_bytes({ args.data }, &mut frame)?;

        let fd = net.tap.raw_fd();
        let mut sent = 0usize;
        while sent < len {
            let n = unsafe {
                libc::write(fd, frame[sent..].as_ptr() as *const c_void, len - sent)
            };
            if n > 0 {
                sent += n as usize;
            } else if n == 0 {
                break;
            } else {
                let err = std::io::Error::last_os_error();
                match err.raw_os_error() {
                    Some(libc::EAGAIN) | Some(libc::EINTR) => continue,
                    _ => break,
                }
            }
        }

        args.ret = 0;
        args.len = sent as u64;
        ram.write_obj(addr, args)?;
        Ok(())
    }

    /// NETREAD: one frame per call; an empty queue reports failure to the
    /// guest and releases the poll thread to wait for the next frame.
    fn hc_netread(&self, addr: u64) -> Result<(), VmError> {
        let ram = &self.shared.ram;
        let mut args: NetReadArgs = ram.read_obj(addr)?;
        let Some(net) = self.shared.net.as_ref() else {
            args.ret = -1;
            ram.write_obj(addr, args)?;
            return Ok(());
        };

        let len = { args.len } as usize;
        let mut frame = vec![0u8; len];
        let n = unsafe { libc::read(net.tap.raw_fd(), frame.as_mut_ptr() as *mut c_void, len) };
        if n > 0 {
            ram.write_bytes({ args.data }, &frame[..n as usize])?;
            args.len = n as u64;
            args.ret = 0;
        } else {
            args.ret = -1;
            net.drained.post();
        }
        ram.write_obj(addr, args)?;
        Ok(())
    }

    fn hc_netstat(&self, addr: u64) -> Result<(), VmError> {
        let ram = &self.shared.ram;
        let mut args: crate::hypercall::NetStatArgs = ram.read_obj(addr)?;
        args.status = i32::from(self.shared.net.is_some());
        ram.write_obj(addr, args)?;
        Ok(())
    }

    /// FREELIST: the guest advertises its free-memory list; the
    /// complement within guest RAM is what an incremental cold migration
    /// has to move. A malformed list degrades to "everything allocated".
    fn hc_freelist(&self, addr: u64) -> Result<(), VmError> {
        let ram = &self.shared.ram;
        let span = ram.span();

        let mut free: Vec<(u64, u64)> = Vec::new();
        let mut node_addr = addr;
        for _ in 0..4096 {
            let node: FreeListNode = ram.read_obj(node_addr)?;
            let (start, end) = ({ node.start }.min(span), { node.end }.min(span));
            if start < end {
                free.push((start, end));
            }
            if { node.next } == 0 {
                break;
            }
            // Links are guest-virtual; a translation miss ends the walk
            // and keeps whatever was collected.
            match ram.virt_to_phys({ node.next }, self.shared.entry) {
                Ok((pa, _)) => node_addr = pa,
                Err(_) => {
                    free.clear();
                    break;
                }
            }
        }
        free.sort_unstable();

        // Allocated regions are the gaps between free ranges.
        let mut allocated = Vec::new();
        let mut cursor = 0u64;
        for (start, end) in free {
            if start > cursor {
                allocated.push(MemRegion {
                    guest_addr: cursor,
                    size: start - cursor,
                });
            }
            cursor = cursor.max(end);
        }
        if cursor < span {
            allocated.push(MemRegion {
                guest_addr: cursor,
                size: span - cursor,
            });
        }

        debug!(
            "guest advertised free list: {} allocated region(s)",
            allocated.len()
        );
        self.shared.set_mem_mappings(allocated);
        Ok(())
    }

    /// CMDSIZE: first phase of command-line forwarding, the counts and
    /// string sizes.
    fn hc_cmdsize(&self, addr: u64) -> Result<(), VmError> {
        let ram = &self.shared.ram;
        let fwd = &self.shared.forward;

        // Build the arrays locally; the packed destination cannot be
        // indexed in place.
        let mut argsz = [0i32; MAX_ARGC_ENVC];
        for (i, arg) in fwd.args.iter().enumerate() {
            argsz[i] = arg.as_bytes_with_nul().len() as i32;
        }
        let mut envsz = [0i32; MAX_ARGC_ENVC];
        for (i, env) in fwd.envs.iter().enumerate() {
            envsz[i] = env.as_bytes_with_nul().len() as i32;
        }

        let args = CmdsizeArgs {
            argc: fwd.args.len() as i32,
            argsz,
            envc: fwd.envs.len() as i32,
            envsz,
        };
        ram.write_obj(addr, args)?;
        Ok(())
    }

    /// CMDVAL: second phase, copying the strings through the pointer
    /// arrays the guest allocated from the sizes.
    fn hc_cmdval(&self, addr: u64) -> Result<(), VmError> {
        let ram = &self.shared.ram;
        let args: CmdvalArgs = ram.read_obj(addr)?;

        let fwd = &self.shared.forward;
        for (i, arg) in fwd.args.iter().enumerate() {
            let dst = ram.read_u64({ args.argv } + (i as u64) * 8)?;
            ram.write_bytes(dst, arg.as_bytes_with_nul())?;
        }
        for (i, env) in fwd.envs.iter().enumerate() {
            let dst = ram.read_u64({ args.envp } + (i as u64) * 8)?;
            ram.write_bytes(dst, env.as_bytes_with_nul())?;
        }
        Ok(())
    }

    /// Read a NUL-terminated guest string through virtual translation,
    /// chunked at mapping-page boundaries.
    fn read_guest_cstring(&self, va: u64) -> Result<Vec<u8>, VmError> {
        let ram = &self.shared.ram;
        let mut out = Vec::new();
        let mut cursor = va;

        while out.len() < libc::PATH_MAX as usize {
            let (pa, pa_end) = ram.virt_to_phys(cursor, self.shared.entry)?;
            let step = (pa_end - pa).min(256) as usize;
            let mut chunk = vec![0u8; step];
            ram.read_bytes(pa, &mut chunk)?;

            if let Some(nul) = chunk.iter().position(|&b| b == 0) {
                out.extend_from_slice(&chunk[..nul]);
                return Ok(out);
            }
            out.extend_from_slice(&chunk);
            cursor += step as u64;
        }
        Err(VmError::FatalGuest(format!(
            "unterminated guest string at {va:#x}"
        )))
    }
}

/// Collect the forwarded command line: the guest's argv (image path
/// first) and the host environment, both capped at the protocol limit.
pub fn collect_forwarded_cmdline(args: Vec<String>) -> ForwardedCmdline {
    let mut argv: Vec<CString> = args
        .into_iter()
        .filter_map(|a| CString::new(a).ok())
        .collect();
    if argv.len() > MAX_ARGC_ENVC {
        argv.truncate(MAX_ARGC_ENVC);
    }

    let mut envs: Vec<CString> = std::env::vars()
        .filter_map(|(k, v)| CString::new(format!("{k}={v}")).ok())
        .collect();
    if envs.len() > MAX_ARGC_ENVC - 1 {
        envs.truncate(MAX_ARGC_ENVC - 1);
    }

    ForwardedCmdline { args: argv, envs }
}

/// Command line and environment forwarded to the guest on request.
pub struct ForwardedCmdline {
    pub args: Vec<CString>,
    pub envs: Vec<CString>,
}

/// The 32-bit datum of a port write, regardless of access width.
fn io_value(data: &[u8]) -> u32 {
    let mut bytes = [0u8; 4];
    let n = data.len().min(4);
    bytes[..n].copy_from_slice(&data[..n]);
    u32::from_le_bytes(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_value_widths() {
        assert_eq!(io_value(&[0x34, 0x12]), 0x1234);
        assert_eq!(io_value(&[0x78, 0x56, 0x34, 0x12]), 0x1234_5678);
        assert_eq!(io_value(&[0xAB]), 0xAB);
    }

    #[test]
    fn forwarded_cmdline_caps_lengths() {
        let many: Vec<String> = (0..200).map(|i| format!("arg{i}")).collect();
        let fwd = collect_forwarded_cmdline(many);
        assert_eq!(fwd.args.len(), MAX_ARGC_ENVC);
        assert!(fwd.envs.len() <= MAX_ARGC_ENVC - 1);
    }

    #[test]
    fn forwarded_cmdline_keeps_order() {
        let fwd = collect_forwarded_cmdline(vec!["app".into(), "-x".into()]);
        assert_eq!(fwd.args[0].as_bytes(), b"app");
        assert_eq!(fwd.args[1].as_bytes(), b"-x");
    }
}
