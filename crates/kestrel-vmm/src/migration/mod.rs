//! Live and cold migration of a running guest.
//!
//! Migration moves three things, in order, over one TCP connection: guest
//! memory, the architectural state of every vCPU, and the guest clock.
//! The wire protocol:
//!
//! 1. [`MigrationParams`]: type (cold/live), mode (complete/incremental
//!    dump), and fabric options.
//! 2. [`MigrationMetadata`]: core count, guest size, entry point. The
//!    receiver allocates its own hole-aware RAM from these and aborts on
//!    mismatch with its expectations.
//! 3. A region declaration: the guest-physical ranges the memory phase
//!    will cover.
//! 4. Memory. Live migrations send [`MIG_ITERS`] pre-copy rounds of
//!    `(entry, page)` records while the guest keeps running, then one
//!    final quiesced round; cold migrations send the declared regions as
//!    raw byte ranges.
//! 5. One [`VcpuState`](crate::cpu::VcpuState) per core.
//! 6. The guest clock.
//!
//! Pre-copy rounds clear the accessed/dirty watermark as they scan; the
//! final stop-and-copy round leaves the bits in place.

pub mod transport;

use std::fs;
use std::io;

use log::{info, warn};
use thiserror::Error;
use vm_memory::ByteValued;

use crate::checkpoint::GuestClock;
use crate::cpu::VcpuState;
use crate::memory::{GuestRam, MemoryError, PAGE_2M_SIZE, PAGE_SIZE, PG_PSE};
use crate::paging::{dest_offset, scan_page_tables, PageSelector};
use transport::MigrationStream;

/// Number of live pre-copy rounds before the stop-and-copy phase.
pub const MIG_ITERS: u32 = 4;

// ═══════════════════════════════════════════════════════════════════════
//  Error type
// ═══════════════════════════════════════════════════════════════════════

/// Errors from the migration channel and coordinator.
#[derive(Error, Debug)]
pub enum MigrationError {
    #[error("migration I/O failed: {0}")]
    Io(#[from] io::Error),

    #[error("migration channel closed mid-transfer")]
    ShortTransfer,

    #[error("'{0}' is not a valid migration server address")]
    BadAddress(String),

    #[error(
        "migration metadata mismatch: cores {ncores}, guest size {guest_size:#x}, \
         entry {entry_point:#x} do not match this VM"
    )]
    MetadataMismatch {
        ncores: u32,
        guest_size: u64,
        entry_point: u64,
    },

    #[error("guest memory error during migration: {0}")]
    Memory(#[from] MemoryError),
}

// ═══════════════════════════════════════════════════════════════════════
//  Parameters
// ═══════════════════════════════════════════════════════════════════════

/// Cold migrations quiesce first and transfer once; live migrations
/// pre-copy while the guest runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MigrationType {
    #[default]
    Cold,
    Live,
}

/// Which memory a cold migration transfers: everything, or only the
/// regions the guest has advertised as allocated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MigrationMode {
    #[default]
    CompleteDump,
    IncrementalDump,
}

/// Migration tunables, exchanged first on the wire.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MigrationParams {
    pub type_: MigrationType,
    pub mode: MigrationMode,
    /// On-demand paging; meaningful only for fabric transports, carried
    /// for wire compatibility.
    pub use_odp: bool,
    /// Prefetching hint for on-demand paging.
    pub prefetch: bool,
}

impl MigrationParams {
    /// Parse the plain-text parameter file: `mode:`, `type:`, `use-odp:`,
    /// and `prefetch:` lines. Unknown values keep the default and warn
    /// rather than refusing to start.
    pub fn from_file(path: &str) -> Self {
        let mut params = Self::default();
        let Ok(text) = fs::read_to_string(path) else {
            warn!("could not read migration parameter file {path}");
            return params;
        };

        for line in text.lines() {
            let Some((key, value)) = line.split_once(':') else {
                continue;
            };
            let value = value.trim();
            match key.trim() {
                "mode" => match value {
                    "complete-dump" => params.mode = MigrationMode::CompleteDump,
                    "incremental-dump" => params.mode = MigrationMode::IncrementalDump,
                    other => warn!("migration mode '{other}' not supported, keeping default"),
                },
                "type" => match value {
                    "cold" => params.type_ = MigrationType::Cold,
                    "live" => params.type_ = MigrationType::Live,
                    other => warn!("migration type '{other}' not supported, keeping default"),
                },
                "use-odp" => params.use_odp = value != "0",
                "prefetch" => params.prefetch = value != "0",
                _ => {}
            }
        }
        params
    }
}

/// Wire form of [`MigrationParams`].
#[derive(Debug, Default, Clone, Copy)]
#[repr(C)]
pub struct MigrationParamsWire {
    type_: u32,
    mode: u32,
    use_odp: u8,
    prefetch: u8,
    pad: [u8; 2],
}

unsafe impl ByteValued for MigrationParamsWire {}

impl From<MigrationParams> for MigrationParamsWire {
    fn from(p: MigrationParams) -> Self {
        Self {
            type_: matches!(p.type_, MigrationType::Live) as u32,
            mode: matches!(p.mode, MigrationMode::IncrementalDump) as u32,
            use_odp: u8::from(p.use_odp),
            prefetch: u8::from(p.prefetch),
            pad: [0; 2],
        }
    }
}

impl From<MigrationParamsWire> for MigrationParams {
    fn from(w: MigrationParamsWire) -> Self {
        Self {
            type_: if w.type_ != 0 {
                MigrationType::Live
            } else {
                MigrationType::Cold
            },
            mode: if w.mode != 0 {
                MigrationMode::IncrementalDump
            } else {
                MigrationMode::CompleteDump
            },
            use_odp: w.use_odp != 0,
            prefetch: w.prefetch != 0,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  Metadata
// ═══════════════════════════════════════════════════════════════════════

/// VM identity, sent once after the parameters.
///
/// `guest_size` is the configured (gap-free) size; the receiver re-derives
/// the same hole-aware layout from it.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
#[repr(C)]
pub struct MigrationMetadata {
    pub ncores: u32,
    _pad0: u32,
    pub guest_size: u64,
    pub no_checkpoint: u32,
    _pad1: u32,
    pub elf_entry: u64,
    pub full_checkpoint: u8,
    _pad2: [u8; 7],
}

unsafe impl ByteValued for MigrationMetadata {}

impl MigrationMetadata {
    pub fn new(ncores: u32, guest_size: u64, elf_entry: u64, full_checkpoint: bool) -> Self {
        Self {
            ncores,
            guest_size,
            no_checkpoint: 0,
            elf_entry,
            full_checkpoint: u8::from(full_checkpoint),
            ..Default::default()
        }
    }
}

/// One declared guest-physical range.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
#[repr(C)]
pub struct MemRegion {
    pub guest_addr: u64,
    pub size: u64,
}

unsafe impl ByteValued for MemRegion {}

// ═══════════════════════════════════════════════════════════════════════
//  Region declaration
// ═══════════════════════════════════════════════════════════════════════

/// Declare the guest-physical ranges the memory phase will cover.
pub fn send_regions(
    stream: &mut MigrationStream,
    regions: &[MemRegion],
) -> Result<(), MigrationError> {
    stream.send_u64(regions.len() as u64)?;
    for region in regions {
        stream.send_obj(region)?;
    }
    Ok(())
}

/// Receive the region declaration.
pub fn recv_regions(stream: &mut MigrationStream) -> Result<Vec<MemRegion>, MigrationError> {
    let count = stream.recv_u64()? as usize;
    let mut regions = Vec::with_capacity(count);
    for _ in 0..count {
        regions.push(stream.recv_obj::<MemRegion>()?);
    }
    Ok(regions)
}

/// The whole-RAM declaration: one region per chunk.
pub fn chunk_regions(ram: &GuestRam) -> Vec<MemRegion> {
    ram.chunks()
        .iter()
        .map(|c| MemRegion {
            guest_addr: c.guest_addr,
            size: c.size,
        })
        .collect()
}

// ═══════════════════════════════════════════════════════════════════════
//  Memory phases
// ═══════════════════════════════════════════════════════════════════════

/// Transfer size for raw region streaming.
const RAW_CHUNK: usize = 1 << 20;

/// Send one pre-copy or stop-and-copy round as an `(entry, page)` record
/// stream terminated by a zero entry word.
///
/// A zero word cannot collide with a real record because every emitted
/// entry carries at least the present bit.
pub fn send_page_round(
    stream: &mut MigrationStream,
    ram: &GuestRam,
    entry_point: u64,
    selector: PageSelector,
    clear: bool,
) -> Result<u64, MigrationError> {
    let mut buf = vec![0u8; PAGE_2M_SIZE as usize];
    let mut pages = 0u64;

    scan_page_tables(ram, entry_point, selector, clear, |entry, addr, len| {
        let page = &mut buf[..len];
        ram.read_bytes(addr, page)
            .map_err(|e| io::Error::other(e.to_string()))?;
        stream
            .send_u64(entry)
            .and_then(|()| stream.send_all(page))
            .map_err(|e| io::Error::other(e.to_string()))?;
        pages += 1;
        Ok(())
    })?;

    stream.send_u64(0)?;
    Ok(pages)
}

/// Apply one record stream round into guest RAM.
pub fn recv_page_round(
    stream: &mut MigrationStream,
    ram: &GuestRam,
) -> Result<u64, MigrationError> {
    let mut buf = vec![0u8; PAGE_2M_SIZE as usize];
    let mut pages = 0u64;

    loop {
        let entry = stream.recv_u64()?;
        if entry == 0 {
            break;
        }
        let len = if entry & PG_PSE != 0 {
            PAGE_2M_SIZE as usize
        } else {
            PAGE_SIZE as usize
        };
        let page = &mut buf[..len];
        stream.recv_all(page)?;
        ram.write_bytes(dest_offset(entry), page)?;
        pages += 1;
    }
    Ok(pages)
}

/// Send the declared regions as raw byte ranges (cold transfer).
pub fn send_raw_regions(
    stream: &mut MigrationStream,
    ram: &GuestRam,
    regions: &[MemRegion],
) -> Result<(), MigrationError> {
    let mut buf = vec![0u8; RAW_CHUNK];
    for region in regions {
        let mut offset = 0;
        while offset < region.size {
            let len = (region.size - offset).min(RAW_CHUNK as u64) as usize;
            let piece = &mut buf[..len];
            ram.read_bytes(region.guest_addr + offset, piece)?;
            stream.send_all(piece)?;
            offset += len as u64;
        }
    }
    Ok(())
}

/// Receive the declared regions as raw byte ranges.
pub fn recv_raw_regions(
    stream: &mut MigrationStream,
    ram: &GuestRam,
    regions: &[MemRegion],
) -> Result<(), MigrationError> {
    let mut buf = vec![0u8; RAW_CHUNK];
    for region in regions {
        let mut offset = 0;
        while offset < region.size {
            let len = (region.size - offset).min(RAW_CHUNK as u64) as usize;
            let piece = &mut buf[..len];
            stream.recv_all(piece)?;
            ram.write_bytes(region.guest_addr + offset, piece)?;
            offset += len as u64;
        }
    }
    Ok(())
}

// ═══════════════════════════════════════════════════════════════════════
//  vCPU state and clock
// ═══════════════════════════════════════════════════════════════════════

/// Send every vCPU's state record.
pub fn send_cpu_states(
    stream: &mut MigrationStream,
    states: &[VcpuState],
) -> Result<(), MigrationError> {
    for state in states {
        stream.send_obj(state)?;
    }
    info!("CPU state sent ({} cores)", states.len());
    Ok(())
}

/// Receive `ncores` vCPU state records.
pub fn recv_cpu_states(
    stream: &mut MigrationStream,
    ncores: u32,
) -> Result<Vec<VcpuState>, MigrationError> {
    let mut states = Vec::with_capacity(ncores as usize);
    for _ in 0..ncores {
        states.push(stream.recv_obj::<VcpuState>()?);
    }
    info!("CPU state received ({ncores} cores)");
    Ok(states)
}

/// Send the guest clock, the final record on the wire.
pub fn send_clock(stream: &mut MigrationStream, clock: GuestClock) -> Result<(), MigrationError> {
    stream.send_obj(&clock)
}

/// Receive the guest clock.
pub fn recv_clock(stream: &mut MigrationStream) -> Result<GuestClock, MigrationError> {
    stream.recv_obj::<GuestClock>()
}

// ═══════════════════════════════════════════════════════════════════════
//  Tests
// ═══════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{PG_ACCESSED, PG_DIRTY, PG_PRESENT, PG_RW};
    use std::io::Write;
    use std::net::{TcpListener, TcpStream};
    use std::thread;

    const MIB: u64 = 1 << 20;

    fn pair() -> (MigrationStream, MigrationStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = thread::spawn(move || TcpStream::connect(addr).unwrap());
        let (server, _) = listener.accept().unwrap();
        (
            MigrationStream::from(server),
            MigrationStream::from(client.join().unwrap()),
        )
    }

    #[test]
    fn params_file_parsing() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        writeln!(f, "mode: incremental-dump").unwrap();
        writeln!(f, "type: live").unwrap();
        writeln!(f, "use-odp: 1").unwrap();
        writeln!(f, "prefetch: 0").unwrap();
        f.flush().unwrap();

        let params = MigrationParams::from_file(f.path().to_str().unwrap());
        assert_eq!(params.type_, MigrationType::Live);
        assert_eq!(params.mode, MigrationMode::IncrementalDump);
        assert!(params.use_odp);
        assert!(!params.prefetch);
    }

    #[test]
    fn params_default_on_missing_file() {
        let params = MigrationParams::from_file("/nonexistent/mig.params");
        assert_eq!(params.type_, MigrationType::Cold);
        assert_eq!(params.mode, MigrationMode::CompleteDump);
    }

    #[test]
    fn params_wire_roundtrip() {
        let params = MigrationParams {
            type_: MigrationType::Live,
            mode: MigrationMode::IncrementalDump,
            use_odp: true,
            prefetch: true,
        };
        let wire = MigrationParamsWire::from(params);
        assert_eq!(MigrationParams::from(wire), params);
        assert_eq!(std::mem::size_of::<MigrationParamsWire>(), 12);
    }

    #[test]
    fn metadata_roundtrip_on_the_wire() {
        let (mut tx, mut rx) = pair();
        let meta = MigrationMetadata::new(4, 512 * MIB, 0x40_0000, true);
        tx.send_obj(&meta).unwrap();
        let got: MigrationMetadata = rx.recv_obj().unwrap();
        assert_eq!(got, meta);
        assert_eq!(std::mem::size_of::<MigrationMetadata>(), 40);
    }

    #[test]
    fn region_declaration_roundtrip() {
        let (mut tx, mut rx) = pair();
        let regions = vec![
            MemRegion { guest_addr: 0, size: 0xC000_0000 },
            MemRegion { guest_addr: 0xF000_0000, size: 0x4000_0000 },
        ];
        send_regions(&mut tx, &regions).unwrap();
        assert_eq!(recv_regions(&mut rx).unwrap(), regions);
    }

    fn build_tables(ram: &GuestRam, entry: u64) {
        let pml4 = entry + PAGE_SIZE;
        let pdpt = entry + 2 * PAGE_SIZE;
        let pd = entry + 3 * PAGE_SIZE;
        let pt = entry + 4 * PAGE_SIZE;
        ram.write_u64(pml4, pdpt | PG_PRESENT | PG_RW).unwrap();
        ram.write_u64(pdpt, pd | PG_PRESENT | PG_RW).unwrap();
        ram.write_u64(pd, pt | PG_PRESENT | PG_RW).unwrap();
        ram.write_u64(pt, 0x0030_0000 | PG_PRESENT | PG_RW | PG_ACCESSED | PG_DIRTY)
            .unwrap();
        ram.write_u64(pt + 8, 0x0030_1000 | PG_PRESENT | PG_RW | PG_ACCESSED | PG_DIRTY)
            .unwrap();
    }

    #[test]
    fn page_round_transfers_dirty_pages() {
        let src = GuestRam::new(16 * MIB, false, false).unwrap();
        let dst = GuestRam::new(16 * MIB, false, false).unwrap();
        let entry = 0x10_0000;
        build_tables(&src, entry);
        src.write_bytes(0x0030_0000, b"page zero").unwrap();
        src.write_bytes(0x0030_1000, b"page one").unwrap();

        let (mut tx, mut rx) = pair();
        let sender = thread::spawn(move || {
            let sent = send_page_round(&mut tx, &src, entry, PageSelector::Dirty, true).unwrap();
            assert_eq!(sent, 2);
            // The watermark was cleared; a second round is empty.
            let sent = send_page_round(&mut tx, &src, entry, PageSelector::Dirty, true).unwrap();
            assert_eq!(sent, 0);
        });

        assert_eq!(recv_page_round(&mut rx, &dst).unwrap(), 2);
        assert_eq!(recv_page_round(&mut rx, &dst).unwrap(), 0);
        sender.join().unwrap();

        let mut buf = [0u8; 9];
        dst.read_bytes(0x0030_0000, &mut buf).unwrap();
        assert_eq!(&buf, b"page zero");
        let mut buf = [0u8; 8];
        dst.read_bytes(0x0030_1000, &mut buf).unwrap();
        assert_eq!(&buf, b"page one");
    }

    #[test]
    fn raw_regions_copy_bit_identical() {
        let src = GuestRam::new(8 * MIB, false, false).unwrap();
        let dst = GuestRam::new(8 * MIB, false, false).unwrap();

        // Fill a recognizable pattern across more than one raw chunk.
        let pattern: Vec<u8> = (0..3 * MIB).map(|i| (i * 7 % 251) as u8).collect();
        src.write_bytes(MIB, &pattern).unwrap();

        let regions = vec![MemRegion { guest_addr: MIB, size: 3 * MIB }];
        let regions2 = regions.clone();

        let (mut tx, mut rx) = pair();
        let sender = thread::spawn(move || {
            send_raw_regions(&mut tx, &src, &regions2).unwrap();
        });
        recv_raw_regions(&mut rx, &dst, &regions).unwrap();
        sender.join().unwrap();

        let mut got = vec![0u8; pattern.len()];
        dst.read_bytes(MIB, &mut got).unwrap();
        assert_eq!(got, pattern);
    }

    #[test]
    fn cpu_states_and_clock_roundtrip() {
        let (mut tx, mut rx) = pair();

        let mut s0 = VcpuState::default();
        s0.regs.rip = 0x1111;
        let mut s1 = VcpuState::default();
        s1.regs.rip = 0x2222;

        let sender = thread::spawn(move || {
            send_cpu_states(&mut tx, &[s0, s1]).unwrap();
            send_clock(&mut tx, GuestClock { clock: 42, ..Default::default() }).unwrap();
        });

        let states = recv_cpu_states(&mut rx, 2).unwrap();
        assert_eq!(states[0].regs.rip, 0x1111);
        assert_eq!(states[1].regs.rip, 0x2222);
        assert_eq!(recv_clock(&mut rx).unwrap().clock, 42);
        sender.join().unwrap();
    }
}
