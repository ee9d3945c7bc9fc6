//! The on-disk checkpoint store.
//!
//! A checkpoint directory holds, per checkpoint number `n`:
//!
//! - `chk{n}_core{i}.dat`: the raw [`VcpuState`] of vCPU `i`;
//! - `chk{n}_mem.dat`: the guest clock followed by a stream of
//!   `(entry_word, page)` records, terminated by end of file;
//! - `chk_config.txt`: a plain-text manifest describing the whole set.
//!
//! A checkpoint set is only meaningful as a whole: vCPU states are valid
//! exactly for the memory image their round captured. Incremental rounds
//! chain; restoring number `n` with `full checkpoint: 0` replays every
//! round from 0 through `n - 1` in order, while a full round stands alone.
//!
//! The manifest's `checkpoint number` is the count of completed rounds,
//! which is also the number the next round will use.

use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, ErrorKind, Read, Write};
use std::path::{Path, PathBuf};

use kvm_bindings::kvm_clock_data;
use log::{debug, info};
use thiserror::Error;
use vm_memory::ByteValued;

use crate::cpu::VcpuState;
use crate::memory::{GuestRam, MemoryError, PAGE_2M_SIZE, PAGE_SIZE, PG_PSE};
use crate::paging::{dest_offset, scan_page_tables, PageSelector};

/// Default checkpoint directory, relative to the working directory.
pub const CHECKPOINT_DIR: &str = "checkpoint";

// ═══════════════════════════════════════════════════════════════════════
//  Error type
// ═══════════════════════════════════════════════════════════════════════

/// Errors from checkpoint persistence.
#[derive(Error, Debug)]
pub enum CheckpointError {
    #[error("checkpoint I/O failed: {0}")]
    Io(#[from] io::Error),

    #[error("checkpoint file {path} is truncated")]
    ShortFile { path: String },

    #[error("manifest field missing or malformed: {0}")]
    Manifest(&'static str),

    #[error("guest memory error: {0}")]
    Memory(#[from] MemoryError),
}

// ═══════════════════════════════════════════════════════════════════════
//  Guest clock record
// ═══════════════════════════════════════════════════════════════════════

/// Serializable mirror of `kvm_clock_data`, stored at the head of every
/// memory dump and sent during migration.
#[derive(Debug, Default, Clone, Copy)]
#[repr(C)]
pub struct GuestClock {
    pub clock: u64,
    pub flags: u32,
    pub(crate) pad: [u32; 9],
}

unsafe impl ByteValued for GuestClock {}

impl From<kvm_clock_data> for GuestClock {
    fn from(data: kvm_clock_data) -> Self {
        Self {
            clock: data.clock,
            flags: data.flags,
            pad: [0; 9],
        }
    }
}

impl GuestClock {
    /// The record to program back into KVM: only the counter value is
    /// replayed, flags are host-local.
    pub fn to_kvm(self) -> kvm_clock_data {
        kvm_clock_data {
            clock: self.clock,
            ..Default::default()
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  Manifest
// ═══════════════════════════════════════════════════════════════════════

/// The `chk_config.txt` manifest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Manifest {
    pub application_path: String,
    pub ncores: u32,
    pub guest_size: u64,
    /// Count of completed checkpoint rounds.
    pub checkpoint_number: u32,
    pub entry_point: u64,
    pub full: bool,
}

impl Manifest {
    /// Path of the manifest inside a checkpoint directory.
    pub fn path(dir: &Path) -> PathBuf {
        dir.join("chk_config.txt")
    }

    /// Write the manifest, replacing any previous one.
    pub fn store(&self, dir: &Path) -> Result<(), CheckpointError> {
        let mut f = BufWriter::new(File::create(Self::path(dir))?);
        writeln!(f, "application path: {}", self.application_path)?;
        writeln!(f, "number of cores: {}", self.ncores)?;
        writeln!(f, "memory size: {:#x}", self.guest_size)?;
        writeln!(f, "checkpoint number: {}", self.checkpoint_number)?;
        writeln!(f, "entry point: {:#x}", self.entry_point)?;
        writeln!(f, "full checkpoint: {}", i32::from(self.full))?;
        f.flush()?;
        Ok(())
    }

    /// Parse the manifest from a checkpoint directory.
    pub fn load(dir: &Path) -> Result<Self, CheckpointError> {
        let text = fs::read_to_string(Self::path(dir))?;

        fn field<'a>(text: &'a str, key: &str) -> Option<&'a str> {
            text.lines()
                .find_map(|l| l.strip_prefix(key))
                .map(str::trim)
        }

        fn number(s: &str) -> Option<u64> {
            if let Some(hex) = s.strip_prefix("0x") {
                u64::from_str_radix(hex, 16).ok()
            } else {
                s.parse().ok()
            }
        }

        Ok(Self {
            application_path: field(&text, "application path:")
                .ok_or(CheckpointError::Manifest("application path"))?
                .to_string(),
            ncores: field(&text, "number of cores:")
                .and_then(number)
                .ok_or(CheckpointError::Manifest("number of cores"))? as u32,
            guest_size: field(&text, "memory size:")
                .and_then(number)
                .ok_or(CheckpointError::Manifest("memory size"))?,
            checkpoint_number: field(&text, "checkpoint number:")
                .and_then(number)
                .ok_or(CheckpointError::Manifest("checkpoint number"))? as u32,
            entry_point: field(&text, "entry point:")
                .and_then(number)
                .ok_or(CheckpointError::Manifest("entry point"))?,
            full: field(&text, "full checkpoint:")
                .and_then(number)
                .ok_or(CheckpointError::Manifest("full checkpoint"))?
                != 0,
        })
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  File naming
// ═══════════════════════════════════════════════════════════════════════

/// `chk{n}_mem.dat` inside `dir`.
pub fn mem_file(dir: &Path, n: u32) -> PathBuf {
    dir.join(format!("chk{n}_mem.dat"))
}

/// `chk{n}_core{i}.dat` inside `dir`.
pub fn core_file(dir: &Path, n: u32, core: u32) -> PathBuf {
    dir.join(format!("chk{n}_core{core}.dat"))
}

// ═══════════════════════════════════════════════════════════════════════
//  vCPU state files
// ═══════════════════════════════════════════════════════════════════════

/// Write one vCPU's state record for checkpoint round `n`.
pub fn write_core_state(
    dir: &Path,
    n: u32,
    core: u32,
    state: &VcpuState,
) -> Result<(), CheckpointError> {
    let path = core_file(dir, n, core);
    let mut f = BufWriter::new(File::create(&path)?);
    f.write_all(state.as_slice())?;
    f.flush()?;
    debug!("wrote vCPU {core} state to {}", path.display());
    Ok(())
}

/// Read one vCPU's state record from checkpoint round `n`.
pub fn read_core_state(dir: &Path, n: u32, core: u32) -> Result<VcpuState, CheckpointError> {
    let path = core_file(dir, n, core);
    let mut f = File::open(&path)?;
    let mut state = VcpuState::default();
    f.read_exact(state.as_mut_slice())
        .map_err(|_| CheckpointError::ShortFile {
            path: path.display().to_string(),
        })?;
    Ok(state)
}

// ═══════════════════════════════════════════════════════════════════════
//  Memory dumps
// ═══════════════════════════════════════════════════════════════════════

/// Write the memory dump for round `n`: the guest clock, then one
/// `(entry, page)` record per page selected by `selector`.
///
/// Incremental rounds clear the accessed/dirty watermark as they scan.
pub fn dump_memory(
    dir: &Path,
    n: u32,
    ram: &GuestRam,
    entry_point: u64,
    selector: PageSelector,
    clear: bool,
    clock: GuestClock,
) -> Result<(), CheckpointError> {
    let path = mem_file(dir, n);
    let mut f = BufWriter::new(File::create(&path)?);
    f.write_all(clock.as_slice())?;

    let mut buf = vec![0u8; PAGE_2M_SIZE as usize];
    scan_page_tables(ram, entry_point, selector, clear, |entry, addr, len| {
        let page = &mut buf[..len];
        ram.read_bytes(addr, page)
            .map_err(|e| io::Error::other(e.to_string()))?;
        f.write_all(&entry.to_le_bytes())?;
        f.write_all(page)
    })?;

    f.flush()?;
    info!("checkpoint {n}: memory dump written to {}", path.display());
    Ok(())
}

/// Replay one memory dump into guest RAM, returning the clock stored at
/// its head.
pub fn replay_memory(ram: &GuestRam, path: &Path) -> Result<GuestClock, CheckpointError> {
    let mut f = BufReader::new(File::open(path)?);

    let mut clock = GuestClock::default();
    f.read_exact(clock.as_mut_slice())
        .map_err(|_| CheckpointError::ShortFile {
            path: path.display().to_string(),
        })?;

    let mut buf = vec![0u8; PAGE_2M_SIZE as usize];
    loop {
        let mut entry_bytes = [0u8; 8];
        match f.read_exact(&mut entry_bytes) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => break,
            Err(e) => return Err(e.into()),
        }
        let entry = u64::from_le_bytes(entry_bytes);

        let len = if entry & PG_PSE != 0 {
            PAGE_2M_SIZE as usize
        } else {
            PAGE_SIZE as usize
        };
        let page = &mut buf[..len];
        f.read_exact(page).map_err(|_| CheckpointError::ShortFile {
            path: path.display().to_string(),
        })?;

        ram.write_bytes(dest_offset(entry), page)?;
    }

    Ok(clock)
}

/// Replay a whole checkpoint set into guest RAM.
///
/// Full sets replay only the last round; incremental sets replay every
/// round in order. Returns the clock of the last round, which is the one
/// to program back.
pub fn replay_all(
    dir: &Path,
    manifest: &Manifest,
    ram: &GuestRam,
) -> Result<GuestClock, CheckpointError> {
    let count = manifest.checkpoint_number;
    let first = if manifest.full { count.saturating_sub(1) } else { 0 };

    let mut clock = GuestClock::default();
    for n in first..count {
        clock = replay_memory(ram, &mem_file(dir, n))?;
    }

    info!(
        "restored checkpoint rounds {first}..{count} from {}",
        dir.display()
    );
    Ok(clock)
}

// ═══════════════════════════════════════════════════════════════════════
//  Tests
// ═══════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{PG_ACCESSED, PG_DIRTY, PG_PRESENT, PG_RW};

    const MIB: u64 = 1 << 20;

    fn manifest() -> Manifest {
        Manifest {
            application_path: "/opt/apps/demo".into(),
            ncores: 2,
            guest_size: 512 * MIB,
            checkpoint_number: 3,
            entry_point: 0x40_0000,
            full: true,
        }
    }

    #[test]
    fn manifest_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let m = manifest();
        m.store(dir.path()).unwrap();
        assert_eq!(Manifest::load(dir.path()).unwrap(), m);
    }

    #[test]
    fn manifest_text_format() {
        let dir = tempfile::tempdir().unwrap();
        manifest().store(dir.path()).unwrap();
        let text = fs::read_to_string(dir.path().join("chk_config.txt")).unwrap();
        assert!(text.contains("number of cores: 2"));
        assert!(text.contains("memory size: 0x20000000"));
        assert!(text.contains("checkpoint number: 3"));
        assert!(text.contains("entry point: 0x400000"));
        assert!(text.contains("full checkpoint: 1"));
    }

    #[test]
    fn manifest_missing_field_fails() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("chk_config.txt"), "number of cores: 2\n").unwrap();
        assert!(matches!(
            Manifest::load(dir.path()),
            Err(CheckpointError::Manifest(_))
        ));
    }

    #[test]
    fn core_state_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let mut state = VcpuState::default();
        state.regs.rip = 0x1234_5678;
        state.regs.rsp = 0x9ABC;
        state.msr_data.nmsrs = 15;

        write_core_state(dir.path(), 4, 1, &state).unwrap();
        let read = read_core_state(dir.path(), 4, 1).unwrap();
        assert_eq!(read.regs.rip, 0x1234_5678);
        assert_eq!(read.regs.rsp, 0x9ABC);
        assert_eq!(read.msr_data.nmsrs, 15);
    }

    #[test]
    fn truncated_core_state_is_detected() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(core_file(dir.path(), 0, 0), [0u8; 64]).unwrap();
        assert!(matches!(
            read_core_state(dir.path(), 0, 0),
            Err(CheckpointError::ShortFile { .. })
        ));
    }

    /// One 4 KiB page at 0x30_0000 and one 2 MiB page at 0x60_0000, both
    /// dirty, rooted at `entry + 0x1000`.
    fn build_tables(ram: &GuestRam, entry: u64) {
        let pml4 = entry + PAGE_SIZE;
        let pdpt = entry + 2 * PAGE_SIZE;
        let pd = entry + 3 * PAGE_SIZE;
        let pt = entry + 4 * PAGE_SIZE;
        ram.write_u64(pml4, pdpt | PG_PRESENT | PG_RW).unwrap();
        ram.write_u64(pdpt, pd | PG_PRESENT | PG_RW).unwrap();
        ram.write_u64(pd, pt | PG_PRESENT | PG_RW).unwrap();
        ram.write_u64(pd + 8, 0x0060_0000 | PG_PRESENT | PG_RW | PG_PSE | PG_ACCESSED | PG_DIRTY)
            .unwrap();
        ram.write_u64(pt, 0x0030_0000 | PG_PRESENT | PG_RW | PG_ACCESSED | PG_DIRTY)
            .unwrap();
    }

    #[test]
    fn dump_and_replay_restore_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let ram = GuestRam::new(16 * MIB, false, false).unwrap();
        let entry = 0x10_0000;
        build_tables(&ram, entry);

        ram.write_bytes(0x0030_0000, b"small page payload").unwrap();
        ram.write_bytes(0x0060_0000 + 0x1234, b"huge page payload").unwrap();

        let clock = GuestClock {
            clock: 0xDEAD_BEEF,
            ..Default::default()
        };
        dump_memory(dir.path(), 0, &ram, entry, PageSelector::Present, false, clock).unwrap();

        // Scribble over the payloads, then replay.
        ram.write_bytes(0x0030_0000, &[0u8; 32]).unwrap();
        ram.write_bytes(0x0060_0000 + 0x1234, &[0u8; 32]).unwrap();

        let restored = replay_memory(&ram, &mem_file(dir.path(), 0)).unwrap();
        assert_eq!(restored.clock, 0xDEAD_BEEF);

        let mut buf = [0u8; 18];
        ram.read_bytes(0x0030_0000, &mut buf).unwrap();
        assert_eq!(&buf, b"small page payload");
        let mut buf = [0u8; 17];
        ram.read_bytes(0x0060_0000 + 0x1234, &mut buf).unwrap();
        assert_eq!(&buf, b"huge page payload");
    }

    #[test]
    fn incremental_chain_replays_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let ram = GuestRam::new(16 * MIB, false, false).unwrap();
        let entry = 0x10_0000;
        build_tables(&ram, entry);

        // Round 0 captures "old", round 1 captures "new" for the same page.
        ram.write_bytes(0x0030_0000, b"old").unwrap();
        dump_memory(
            dir.path(),
            0,
            &ram,
            entry,
            PageSelector::Present,
            false,
            GuestClock { clock: 1, ..Default::default() },
        )
        .unwrap();

        ram.write_bytes(0x0030_0000, b"new").unwrap();
        dump_memory(
            dir.path(),
            1,
            &ram,
            entry,
            PageSelector::Present,
            false,
            GuestClock { clock: 2, ..Default::default() },
        )
        .unwrap();

        ram.write_bytes(0x0030_0000, &[0u8; 3]).unwrap();

        let m = Manifest {
            checkpoint_number: 2,
            full: false,
            ..manifest()
        };
        let clock = replay_all(dir.path(), &m, &ram).unwrap();
        assert_eq!(clock.clock, 2, "only the last round's clock applies");

        let mut buf = [0u8; 3];
        ram.read_bytes(0x0030_0000, &mut buf).unwrap();
        assert_eq!(&buf, b"new", "later rounds supersede earlier ones");
    }

    #[test]
    fn full_set_replays_last_round_only() {
        let dir = tempfile::tempdir().unwrap();
        let ram = GuestRam::new(16 * MIB, false, false).unwrap();
        let entry = 0x10_0000;
        build_tables(&ram, entry);

        // Round 1 exists but round 0 is deliberately absent: a full
        // restore must not touch it.
        ram.write_bytes(0x0030_0000, b"full").unwrap();
        dump_memory(
            dir.path(),
            1,
            &ram,
            entry,
            PageSelector::Present,
            false,
            GuestClock { clock: 9, ..Default::default() },
        )
        .unwrap();

        ram.write_bytes(0x0030_0000, &[0u8; 4]).unwrap();

        let m = Manifest {
            checkpoint_number: 2,
            full: true,
            ..manifest()
        };
        let clock = replay_all(dir.path(), &m, &ram).unwrap();
        assert_eq!(clock.clock, 9);

        let mut buf = [0u8; 4];
        ram.read_bytes(0x0030_0000, &mut buf).unwrap();
        assert_eq!(&buf, b"full");
    }

    #[test]
    fn truncated_page_record_is_detected() {
        let dir = tempfile::tempdir().unwrap();
        let ram = GuestRam::new(16 * MIB, false, false).unwrap();

        // A clock, an entry word, but only half a page of data.
        let mut bytes = Vec::new();
        bytes.extend_from_slice(GuestClock::default().as_slice());
        bytes.extend_from_slice(&(0x0030_0000u64 | PG_PRESENT).to_le_bytes());
        bytes.extend_from_slice(&[0xAA; 2048]);
        let path = mem_file(dir.path(), 0);
        fs::write(&path, bytes).unwrap();

        assert!(matches!(
            replay_memory(&ram, &path),
            Err(CheckpointError::ShortFile { .. })
        ));
    }
}
