//! Unikernel boot image loading.
//!
//! A kestrel image is a 64-bit ELF executable marked with a dedicated OSABI
//! sentinel byte. The loader validates that signature, copies every
//! `PT_LOAD` segment to its physical load address, and publishes the
//! boot-parameter block at fixed offsets inside the first loaded segment.
//! The guest reads that block during its own boot to learn where RAM ends,
//! how many cores exist, and how to reach the host's paravirtual services.
//!
//! Boot-parameter offsets (relative to the first segment's load address):
//!
//! | Offset | Size | Field |
//! |--------|------|-------|
//! | `0x08` | 8 | physical start address |
//! | `0x10` | 8 | physical memory limit |
//! | `0x18` | 4 | host CPU frequency (MHz) |
//! | `0x20` | 4 | boot counter (spun on by secondary cores) |
//! | `0x24` | 4 | core count |
//! | `0x30` | 4 | current-core slot |
//! | `0x38` | 8 | total image size |
//! | `0x60` | 4 | NUMA node count |
//! | `0x94` | 4 | hypervisor announcement flag |
//! | `0x98` | 8 | UART port (only when verbose) |
//! | `0xB0` | 4 | guest IPv4 address |
//! | `0xB4` | 4 | guest IPv4 gateway |
//! | `0xB8` | 4 | guest IPv4 netmask |
//! | `0xBC` | 8 | host base address of guest RAM |

use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use std::mem;

use log::{debug, info, warn};
use thiserror::Error;
use vm_memory::ByteValued;

use crate::config::VmConfig;
use crate::hypercall::UART_PORT;
use crate::memory::GuestRam;

// ═══════════════════════════════════════════════════════════════════════
//  ELF constants
// ═══════════════════════════════════════════════════════════════════════

const ELFMAG: [u8; 4] = [0x7F, b'E', b'L', b'F'];
const ELFCLASS64: u8 = 2;
/// OSABI sentinel that marks an image as a kestrel-bootable unikernel.
const ELFOSABI_UNIKERNEL: u8 = 0x42;
const ET_EXEC: u16 = 2;
const EM_X86_64: u16 = 62;
const PT_LOAD: u32 = 1;

/// Upper bound on the program-header table; anything larger is treated as
/// a corrupt image rather than an allocation request.
const MAX_PHDR_TABLE_BYTES: u64 = 1 << 20;

// ─── Boot-parameter offsets ─────────────────────────────────────────────

pub const BP_PHYS_START: u64 = 0x08;
pub const BP_MEM_LIMIT: u64 = 0x10;
pub const BP_CPU_FREQ: u64 = 0x18;
pub const BP_BOOT_COUNTER: u64 = 0x20;
pub const BP_CORE_COUNT: u64 = 0x24;
pub const BP_CURRENT_CORE: u64 = 0x30;
pub const BP_IMAGE_SIZE: u64 = 0x38;
pub const BP_NUMA_NODES: u64 = 0x60;
pub const BP_ANNOUNCE: u64 = 0x94;
pub const BP_UART_PORT: u64 = 0x98;
pub const BP_IP: u64 = 0xB0;
pub const BP_GATEWAY: u64 = 0xB4;
pub const BP_NETMASK: u64 = 0xB8;
pub const BP_HOST_BASE: u64 = 0xBC;

// ═══════════════════════════════════════════════════════════════════════
//  ELF header structures
// ═══════════════════════════════════════════════════════════════════════

#[derive(Debug, Default, Clone, Copy)]
#[repr(C)]
struct Elf64Ehdr {
    e_ident: [u8; 16],
    e_type: u16,
    e_machine: u16,
    e_version: u32,
    e_entry: u64,
    e_phoff: u64,
    e_shoff: u64,
    e_flags: u32,
    e_ehsize: u16,
    e_phentsize: u16,
    e_phnum: u16,
    e_shentsize: u16,
    e_shnum: u16,
    e_shstrndx: u16,
}

// Plain-old-data with no padding holes; safe to view as bytes.
unsafe impl ByteValued for Elf64Ehdr {}

#[derive(Debug, Default, Clone, Copy)]
#[repr(C)]
struct Elf64Phdr {
    p_type: u32,
    p_flags: u32,
    p_offset: u64,
    p_vaddr: u64,
    p_paddr: u64,
    p_filesz: u64,
    p_memsz: u64,
    p_align: u64,
}

unsafe impl ByteValued for Elf64Phdr {}

// ═══════════════════════════════════════════════════════════════════════
//  Error type
// ═══════════════════════════════════════════════════════════════════════

/// Errors from boot image loading.
#[derive(Error, Debug)]
pub enum LoadError {
    /// The file is not a kestrel-bootable unikernel image.
    #[error("invalid unikernel image: {0}")]
    InvalidImage(&'static str),

    /// Reading the image failed or ended short.
    #[error("image I/O error: {0}")]
    Io(#[from] io::Error),

    /// The header tables are implausibly large.
    #[error("image header tables exceed {MAX_PHDR_TABLE_BYTES} bytes")]
    OutOfMemory,

    /// A segment does not fit into guest memory.
    #[error("segment at {paddr:#x} ({size:#x} bytes) exceeds guest memory")]
    SegmentOutOfBounds { paddr: u64, size: u64 },
}

// ═══════════════════════════════════════════════════════════════════════
//  Loading
// ═══════════════════════════════════════════════════════════════════════

/// Result of loading an image: where execution starts and where the
/// boot-parameter block lives.
#[derive(Debug, Clone, Copy)]
pub struct LoadedImage {
    /// Guest-physical entry point.
    pub entry: u64,
    /// Load address of the first segment; base of the boot parameters.
    pub boot_base: u64,
}

/// Load a unikernel image from `path` into guest memory and write the
/// boot-parameter block.
pub fn load_image(ram: &GuestRam, path: &str, config: &VmConfig) -> Result<LoadedImage, LoadError> {
    let mut file = File::open(path)?;

    let mut ehdr = Elf64Ehdr::default();
    file.read_exact(ehdr.as_mut_slice())?;

    validate_header(&ehdr)?;

    let table_bytes = u64::from(ehdr.e_phentsize) * u64::from(ehdr.e_phnum);
    if table_bytes > MAX_PHDR_TABLE_BYTES {
        return Err(LoadError::OutOfMemory);
    }
    if usize::from(ehdr.e_phentsize) != mem::size_of::<Elf64Phdr>() {
        return Err(LoadError::InvalidImage("unexpected program header size"));
    }

    file.seek(SeekFrom::Start(ehdr.e_phoff))?;
    let mut phdrs = vec![Elf64Phdr::default(); usize::from(ehdr.e_phnum)];
    for phdr in &mut phdrs {
        file.read_exact(phdr.as_mut_slice())?;
    }

    let mut boot_base = 0u64;
    for phdr in phdrs.iter().filter(|p| p.p_type == PT_LOAD) {
        debug!(
            "segment: paddr {:#x}, file size {:#x}, mem size {:#x}",
            phdr.p_paddr, phdr.p_filesz, phdr.p_memsz,
        );

        let mut data = vec![0u8; phdr.p_filesz as usize];
        file.seek(SeekFrom::Start(phdr.p_offset))?;
        file.read_exact(&mut data)?;
        ram.write_bytes(phdr.p_paddr, &data)
            .map_err(|_| LoadError::SegmentOutOfBounds {
                paddr: phdr.p_paddr,
                size: phdr.p_filesz,
            })?;

        if boot_base == 0 {
            boot_base = phdr.p_paddr;
            write_boot_params(ram, boot_base, config);
        }

        // Running total: distance from the first segment to the end of
        // this one, including zero-filled tail.
        let image_size = phdr.p_paddr + phdr.p_memsz - boot_base;
        let _ = ram.write_u64(boot_base + BP_IMAGE_SIZE, image_size);
    }

    if boot_base == 0 {
        return Err(LoadError::InvalidImage("no loadable segment"));
    }

    info!(
        "loaded image {path}: entry {:#x}, boot parameters at {:#x}",
        ehdr.e_entry, boot_base,
    );

    Ok(LoadedImage {
        entry: ehdr.e_entry,
        boot_base,
    })
}

fn validate_header(ehdr: &Elf64Ehdr) -> Result<(), LoadError> {
    if ehdr.e_ident[..4] != ELFMAG {
        return Err(LoadError::InvalidImage("bad ELF magic"));
    }
    if ehdr.e_ident[4] != ELFCLASS64 {
        return Err(LoadError::InvalidImage("not a 64-bit image"));
    }
    if ehdr.e_ident[7] != ELFOSABI_UNIKERNEL {
        return Err(LoadError::InvalidImage("missing unikernel OSABI marker"));
    }
    if ehdr.e_type != ET_EXEC {
        return Err(LoadError::InvalidImage("not an executable"));
    }
    if ehdr.e_machine != EM_X86_64 {
        return Err(LoadError::InvalidImage("not an x86-64 image"));
    }
    Ok(())
}

/// Write the boot-parameter block at the base of the first segment.
///
/// Failures here would mean the first segment is outside guest RAM, which
/// the segment copy has already ruled out, so the writes are infallible
/// in practice.
fn write_boot_params(ram: &GuestRam, base: u64, config: &VmConfig) {
    let _ = ram.write_u64(base + BP_PHYS_START, base);
    let _ = ram.write_u64(base + BP_MEM_LIMIT, ram.span());
    let _ = ram.write_bytes(base + BP_CPU_FREQ, &host_cpu_mhz().to_le_bytes());
    let _ = ram.write_bytes(base + BP_CORE_COUNT, &config.ncores.to_le_bytes());
    let _ = ram.write_bytes(base + BP_CURRENT_CORE, &0u32.to_le_bytes());
    let _ = ram.write_bytes(base + BP_NUMA_NODES, &1u32.to_le_bytes());
    let _ = ram.write_bytes(base + BP_ANNOUNCE, &1u32.to_le_bytes());
    if config.verbose {
        let _ = ram.write_u64(base + BP_UART_PORT, u64::from(UART_PORT));
    }
    if let Some(ip) = config.ip {
        let _ = ram.write_bytes(base + BP_IP, &ip.octets());
    }
    if let Some(gw) = config.gateway {
        let _ = ram.write_bytes(base + BP_GATEWAY, &gw.octets());
    }
    if let Some(mask) = config.mask {
        let _ = ram.write_bytes(base + BP_NETMASK, &mask.octets());
    }
    let _ = ram.write_u64(base + BP_HOST_BASE, ram.host_base());
}

/// Measured host CPU frequency in MHz.
///
/// Prefers the cpufreq sysfs maximum, falls back to the first "cpu MHz"
/// line of `/proc/cpuinfo`, and reports 0 when neither is available.
pub fn host_cpu_mhz() -> u32 {
    if let Ok(s) = std::fs::read_to_string("/sys/devices/system/cpu/cpu0/cpufreq/cpuinfo_max_freq")
    {
        if let Ok(khz) = s.trim().parse::<u32>() {
            return khz / 1000;
        }
    }
    if let Ok(s) = std::fs::read_to_string("/proc/cpuinfo") {
        for line in s.lines() {
            if line.starts_with("cpu MHz") {
                if let Some(value) = line.split(':').nth(1) {
                    if let Ok(mhz) = value.trim().parse::<f64>() {
                        return mhz as u32;
                    }
                }
            }
        }
    }
    warn!("could not measure the host CPU frequency");
    0
}

// ═══════════════════════════════════════════════════════════════════════
//  Tests
// ═══════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const MIB: u64 = 1 << 20;

    /// Assemble a minimal unikernel ELF with one PT_LOAD segment.
    fn build_image(paddr: u64, payload: &[u8], patch: impl Fn(&mut Elf64Ehdr)) -> Vec<u8> {
        let ehdr_size = mem::size_of::<Elf64Ehdr>() as u64;
        let phdr_size = mem::size_of::<Elf64Phdr>() as u64;
        let payload_off = ehdr_size + phdr_size;

        let mut ehdr = Elf64Ehdr {
            e_type: ET_EXEC,
            e_machine: EM_X86_64,
            e_version: 1,
            e_entry: paddr + 0x100,
            e_phoff: ehdr_size,
            e_ehsize: ehdr_size as u16,
            e_phentsize: phdr_size as u16,
            e_phnum: 1,
            ..Default::default()
        };
        ehdr.e_ident[..4].copy_from_slice(&ELFMAG);
        ehdr.e_ident[4] = ELFCLASS64;
        ehdr.e_ident[7] = ELFOSABI_UNIKERNEL;
        patch(&mut ehdr);

        let phdr = Elf64Phdr {
            p_type: PT_LOAD,
            p_offset: payload_off,
            p_paddr: paddr,
            p_vaddr: paddr,
            p_filesz: payload.len() as u64,
            p_memsz: payload.len() as u64 + 0x800,
            p_align: 0x1000,
            ..Default::default()
        };

        let mut out = Vec::new();
        out.extend_from_slice(ehdr.as_slice());
        out.extend_from_slice(phdr.as_slice());
        out.extend_from_slice(payload);
        out
    }

    fn write_temp(bytes: &[u8]) -> tempfile::NamedTempFile {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(bytes).unwrap();
        f.flush().unwrap();
        f
    }

    fn test_config() -> VmConfig {
        VmConfig {
            ncores: 2,
            verbose: true,
            ip: Some("10.0.5.2".parse().unwrap()),
            gateway: Some("10.0.5.1".parse().unwrap()),
            mask: Some("255.255.255.0".parse().unwrap()),
            ..Default::default()
        }
    }

    #[test]
    fn load_valid_image() {
        let ram = GuestRam::new(16 * MIB, false, false).unwrap();
        let payload = vec![0xCCu8; 0x400];
        let file = write_temp(&build_image(0x20_0000, &payload, |_| {}));

        let image = load_image(&ram, file.path().to_str().unwrap(), &test_config()).unwrap();
        assert_eq!(image.entry, 0x20_0100);
        assert_eq!(image.boot_base, 0x20_0000);

        // Segment bytes landed at the physical load address.
        let mut copied = vec![0u8; payload.len()];
        ram.read_bytes(0x20_0000, &mut copied).unwrap();
        assert_eq!(copied, payload);
    }

    #[test]
    fn boot_params_are_published() {
        let ram = GuestRam::new(16 * MIB, false, false).unwrap();
        let file = write_temp(&build_image(0x20_0000, &[0u8; 0x200], |_| {}));
        let cfg = test_config();

        let image = load_image(&ram, file.path().to_str().unwrap(), &cfg).unwrap();
        let base = image.boot_base;

        assert_eq!(ram.read_u64(base + BP_PHYS_START).unwrap(), base);
        assert_eq!(ram.read_u64(base + BP_MEM_LIMIT).unwrap(), 16 * MIB);

        let mut word = [0u8; 4];
        ram.read_bytes(base + BP_CORE_COUNT, &mut word).unwrap();
        assert_eq!(u32::from_le_bytes(word), 2);

        ram.read_bytes(base + BP_ANNOUNCE, &mut word).unwrap();
        assert_eq!(u32::from_le_bytes(word), 1);

        assert_eq!(ram.read_u64(base + BP_UART_PORT).unwrap(), u64::from(UART_PORT));

        let mut ip = [0u8; 4];
        ram.read_bytes(base + BP_IP, &mut ip).unwrap();
        assert_eq!(ip, [10, 0, 5, 2]);
        ram.read_bytes(base + BP_NETMASK, &mut ip).unwrap();
        assert_eq!(ip, [255, 255, 255, 0]);

        assert_eq!(ram.read_u64(base + BP_HOST_BASE).unwrap(), ram.host_base());

        // memsz exceeds filesz by 0x800 in the fixture.
        assert_eq!(ram.read_u64(base + BP_IMAGE_SIZE).unwrap(), 0x200 + 0x800);
    }

    #[test]
    fn rejects_bad_magic() {
        let ram = GuestRam::new(4 * MIB, false, false).unwrap();
        let file = write_temp(&build_image(0x1000, &[0u8; 16], |e| e.e_ident[0] = 0));
        let err = load_image(&ram, file.path().to_str().unwrap(), &VmConfig::default()).unwrap_err();
        assert!(matches!(err, LoadError::InvalidImage("bad ELF magic")));
    }

    #[test]
    fn rejects_wrong_osabi() {
        let ram = GuestRam::new(4 * MIB, false, false).unwrap();
        let file = write_temp(&build_image(0x1000, &[0u8; 16], |e| e.e_ident[7] = 0));
        let err = load_image(&ram, file.path().to_str().unwrap(), &VmConfig::default()).unwrap_err();
        assert!(matches!(
            err,
            LoadError::InvalidImage("missing unikernel OSABI marker")
        ));
    }

    #[test]
    fn rejects_wrong_machine() {
        let ram = GuestRam::new(4 * MIB, false, false).unwrap();
        let file = write_temp(&build_image(0x1000, &[0u8; 16], |e| e.e_machine = 40));
        let err = load_image(&ram, file.path().to_str().unwrap(), &VmConfig::default()).unwrap_err();
        assert!(matches!(err, LoadError::InvalidImage("not an x86-64 image")));
    }

    #[test]
    fn rejects_shared_object() {
        let ram = GuestRam::new(4 * MIB, false, false).unwrap();
        let file = write_temp(&build_image(0x1000, &[0u8; 16], |e| e.e_type = 3));
        let err = load_image(&ram, file.path().to_str().unwrap(), &VmConfig::default()).unwrap_err();
        assert!(matches!(err, LoadError::InvalidImage("not an executable")));
    }

    #[test]
    fn rejects_huge_phdr_table() {
        let ram = GuestRam::new(4 * MIB, false, false).unwrap();
        let file = write_temp(&build_image(0x1000, &[0u8; 16], |e| e.e_phnum = u16::MAX));
        let err = load_image(&ram, file.path().to_str().unwrap(), &VmConfig::default()).unwrap_err();
        assert!(matches!(err, LoadError::OutOfMemory));
    }

    #[test]
    fn short_file_is_io_error() {
        let ram = GuestRam::new(4 * MIB, false, false).unwrap();
        let image = build_image(0x1000, &[0u8; 64], |_| {});
        let file = write_temp(&image[..image.len() - 32]);
        let err = load_image(&ram, file.path().to_str().unwrap(), &VmConfig::default()).unwrap_err();
        assert!(matches!(err, LoadError::Io(_)));
    }

    #[test]
    fn segment_outside_ram_is_rejected() {
        let ram = GuestRam::new(4 * MIB, false, false).unwrap();
        let file = write_temp(&build_image(64 * MIB, &[0u8; 64], |_| {}));
        let err = load_image(&ram, file.path().to_str().unwrap(), &VmConfig::default()).unwrap_err();
        assert!(matches!(err, LoadError::SegmentOutOfBounds { .. }));
    }
}
