//! Guest physical memory management for kestrel.
//!
//! Guest RAM is a contiguous guest-physical address space with one
//! architectural wrinkle: when the configured size reaches the start of the
//! 32-bit MMIO hole (3 GiB), a 768 MiB gap is inserted just below the 4 GiB
//! boundary and the memory above it is shifted up. The rest of the
//! hypervisor always sees guest RAM as a list of one or two
//! [`MemChunk`]s, never as a single buffer.
//!
//! ```text
//! guest_size < 3 GiB:   [0 ......................... guest_size)
//!
//! guest_size >= 3 GiB:  [0 ........ 0xC000_0000)   gap   [0xF000_0000 ....)
//!                                        ^ 768 MiB MMIO hole ^
//! ```
//!
//! This module also owns the guest-side page-table walk: the unikernel
//! anchors its 4-level hierarchy one page past its entry point, and
//! [`GuestRam::virt_to_phys`] resolves guest-virtual addresses against that
//! hierarchy without ever touching host page tables.

use log::info;
use thiserror::Error;
use vm_memory::{Bytes, GuestAddress, GuestMemory, GuestMemoryMmap};

// ═══════════════════════════════════════════════════════════════════════
//  Layout constants
// ═══════════════════════════════════════════════════════════════════════

/// Top of the 32-bit guest-physical address space.
pub const KVM_32BIT_MAX_MEM_SIZE: u64 = 1 << 32;

/// Size of the MMIO hole below the 4 GiB boundary: 768 MiB.
pub const KVM_32BIT_GAP_SIZE: u64 = 768 << 20;

/// First guest-physical address inside the MMIO hole (3 GiB).
pub const KVM_32BIT_GAP_START: u64 = KVM_32BIT_MAX_MEM_SIZE - KVM_32BIT_GAP_SIZE;

/// Bits in a 4 KiB page offset.
pub const PAGE_BITS: u64 = 12;

/// Bits in a 2 MiB page offset.
pub const PAGE_2M_BITS: u64 = 21;

/// Size of a 4 KiB page.
pub const PAGE_SIZE: u64 = 1 << PAGE_BITS;

/// Size of a 2 MiB page.
pub const PAGE_2M_SIZE: u64 = 1 << PAGE_2M_BITS;

/// Bits translated by one page-table level.
pub const PAGE_MAP_BITS: u64 = 9;

/// Index mask for one page-table level.
pub const PAGE_MAP_MASK: u64 = 0x1FF;

// ─── Page-table entry flags ─────────────────────────────────────────────

/// Entry is present.
pub const PG_PRESENT: u64 = 1 << 0;
/// Entry is writable.
pub const PG_RW: u64 = 1 << 1;
/// Entry is addressable from user mode.
pub const PG_USER: u64 = 1 << 2;
/// Write-through caching.
pub const PG_PWT: u64 = 1 << 3;
/// Caching disabled.
pub const PG_PCD: u64 = 1 << 4;
/// Set by the CPU on access.
pub const PG_ACCESSED: u64 = 1 << 5;
/// Set by the CPU on write.
pub const PG_DIRTY: u64 = 1 << 6;
/// Huge page (2 MiB at level 2). Doubles as the PAT bit in level-1 entries.
pub const PG_PSE: u64 = 1 << 7;
/// Execution disabled.
pub const PG_XD: u64 = 1 << 63;

/// Mask extracting a 4 KiB-aligned frame pointer from an entry.
///
/// The XD bit sits above the physical address and must be masked along with
/// the low flag bits.
pub const PAGE_MASK: u64 = ((!0u64) << PAGE_BITS) & !PG_XD;

/// Mask extracting a 2 MiB-aligned frame pointer from an entry.
pub const PAGE_2M_MASK: u64 = ((!0u64) << PAGE_2M_BITS) & !PG_XD;

// ═══════════════════════════════════════════════════════════════════════
//  Error type
// ═══════════════════════════════════════════════════════════════════════

/// Errors from guest memory setup and translation.
#[derive(Error, Debug)]
pub enum MemoryError {
    /// The mmap-backed guest memory could not be created.
    #[error("failed to allocate {size:#x} bytes of guest memory")]
    Create { size: u64 },

    /// A read from guest physical memory failed.
    #[error("failed to read guest memory at {address:#x}")]
    Read { address: u64 },

    /// A write to guest physical memory failed.
    #[error("failed to write guest memory at {address:#x}")]
    Write { address: u64 },

    /// A guest-virtual address has no present mapping.
    #[error("guest virtual address {address:#x} is not mapped")]
    NotMapped { address: u64 },
}

// ═══════════════════════════════════════════════════════════════════════
//  Chunk model
// ═══════════════════════════════════════════════════════════════════════

/// One contiguous piece of guest RAM.
///
/// `guest_addr` is the guest-physical start, `host_addr` the corresponding
/// host virtual address, `size` the byte length. The decomposition into
/// chunks is fixed for the lifetime of the VM.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemChunk {
    pub guest_addr: u64,
    pub host_addr: u64,
    pub size: u64,
}

/// Compute the guest-physical chunk layout for a configured memory size.
///
/// Returns `(ranges, total_span)` where each range is
/// `(guest_start, length)` and `total_span` is the highest guest-physical
/// address plus one (i.e. the configured size, inflated by the gap when the
/// hole applies).
pub fn chunk_layout(guest_size: u64) -> (Vec<(u64, u64)>, u64) {
    if guest_size < KVM_32BIT_GAP_START {
        (vec![(0, guest_size)], guest_size)
    } else {
        let total = guest_size + KVM_32BIT_GAP_SIZE;
        let high_start = KVM_32BIT_GAP_START + KVM_32BIT_GAP_SIZE;
        (
            vec![
                (0, KVM_32BIT_GAP_START),
                (high_start, total - high_start),
            ],
            total,
        )
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  GuestRam
// ═══════════════════════════════════════════════════════════════════════

/// Owner of the guest physical memory for one VM.
///
/// The backing store is a [`GuestMemoryMmap`] with one region per chunk;
/// the MMIO hole is simply never mapped, so a stray access into it fails as
/// an unmapped guest address. Writes go through interior mutability, so
/// all methods take `&self`, matching the `vm-memory` API.
pub struct GuestRam {
    memory: GuestMemoryMmap,
    chunks: Vec<MemChunk>,
    /// Configured size before gap inflation.
    guest_size: u64,
    /// Highest guest-physical address plus one.
    span: u64,
}

impl GuestRam {
    /// Allocate guest RAM of `guest_size` bytes, inserting the 32-bit MMIO
    /// hole when the size reaches [`KVM_32BIT_GAP_START`].
    ///
    /// `mergeable` and `hugepage` advise the host kernel's KSM and
    /// transparent-huge-page policies for the backing anonymous memory.
    pub fn new(guest_size: u64, mergeable: bool, hugepage: bool) -> Result<Self, MemoryError> {
        let (mut ranges, span) = chunk_layout(guest_size);
        // A guest sized exactly at the gap start produces a degenerate
        // empty high chunk; drop it rather than mapping a zero region.
        ranges.retain(|&(_, len)| len > 0);
        let regions: Vec<(GuestAddress, usize)> = ranges
            .iter()
            .map(|&(start, len)| (GuestAddress(start), len as usize))
            .collect();

        let memory = GuestMemoryMmap::from_ranges(&regions)
            .map_err(|_| MemoryError::Create { size: guest_size })?;

        let chunks = ranges
            .iter()
            .map(|&(start, len)| {
                let host = memory
                    .get_host_address(GuestAddress(start))
                    .map_err(|_| MemoryError::Create { size: guest_size })?;
                Ok(MemChunk {
                    guest_addr: start,
                    host_addr: host as u64,
                    size: len,
                })
            })
            .collect::<Result<Vec<_>, MemoryError>>()?;

        for chunk in &chunks {
            if mergeable {
                // KSM can deduplicate identical guest pages across VMs at
                // the cost of extra host CPU.
                unsafe {
                    libc::madvise(
                        chunk.host_addr as *mut libc::c_void,
                        chunk.size as usize,
                        libc::MADV_MERGEABLE,
                    );
                }
            }
            if hugepage {
                unsafe {
                    libc::madvise(
                        chunk.host_addr as *mut libc::c_void,
                        chunk.size as usize,
                        libc::MADV_HUGEPAGE,
                    );
                }
            }
        }

        info!(
            "guest RAM: {} MiB in {} chunk(s){}",
            guest_size >> 20,
            chunks.len(),
            if chunks.len() == 2 { " (32-bit MMIO hole inserted)" } else { "" },
        );

        Ok(Self {
            memory,
            chunks,
            guest_size,
            span,
        })
    }

    /// The chunk decomposition. One entry below the gap threshold, two
    /// above; stable for the VM's lifetime.
    #[inline]
    pub fn chunks(&self) -> &[MemChunk] {
        &self.chunks
    }

    /// Configured guest memory size before gap inflation.
    #[inline]
    pub fn guest_size(&self) -> u64 {
        self.guest_size
    }

    /// Highest guest-physical address plus one (includes the gap).
    #[inline]
    pub fn span(&self) -> u64 {
        self.span
    }

    /// Host virtual address of guest-physical 0 (the first chunk).
    pub fn host_base(&self) -> u64 {
        self.chunks[0].host_addr
    }

    /// The underlying `vm-memory` mapping.
    #[inline]
    pub fn inner(&self) -> &GuestMemoryMmap {
        &self.memory
    }

    /// Read a plain-old-data value at a guest-physical address.
    pub fn read_obj<T: vm_memory::ByteValued>(&self, addr: u64) -> Result<T, MemoryError> {
        self.memory
            .read_obj(GuestAddress(addr))
            .map_err(|_| MemoryError::Read { address: addr })
    }

    /// Write a plain-old-data value at a guest-physical address.
    pub fn write_obj<T: vm_memory::ByteValued>(&self, addr: u64, value: T) -> Result<(), MemoryError> {
        self.memory
            .write_obj(value, GuestAddress(addr))
            .map_err(|_| MemoryError::Write { address: addr })
    }

    /// Read a `u64` at a guest-physical address.
    pub fn read_u64(&self, addr: u64) -> Result<u64, MemoryError> {
        self.memory
            .read_obj(GuestAddress(addr))
            .map_err(|_| MemoryError::Read { address: addr })
    }

    /// Write a `u64` at a guest-physical address.
    pub fn write_u64(&self, addr: u64, value: u64) -> Result<(), MemoryError> {
        self.memory
            .write_obj(value, GuestAddress(addr))
            .map_err(|_| MemoryError::Write { address: addr })
    }

    /// Copy guest memory at `addr` into `buf`.
    pub fn read_bytes(&self, addr: u64, buf: &mut [u8]) -> Result<(), MemoryError> {
        self.memory
            .read_slice(buf, GuestAddress(addr))
            .map_err(|_| MemoryError::Read { address: addr })
    }

    /// Copy `buf` into guest memory at `addr`.
    pub fn write_bytes(&self, addr: u64, buf: &[u8]) -> Result<(), MemoryError> {
        self.memory
            .write_slice(buf, GuestAddress(addr))
            .map_err(|_| MemoryError::Write { address: addr })
    }

    /// Translate a guest-virtual address through the guest's own 4-level
    /// page hierarchy rooted at `entry_point + PAGE_SIZE`.
    ///
    /// Returns `(physical_address, physical_address_page_end)`. The page
    /// end is the first physical address past the mapping page containing
    /// the translation, which callers use to split I/O at page boundaries:
    /// for a 4 KiB mapping `end - (pa & !0xFFF) == 4096`, for a 2 MiB
    /// mapping the analogous 2 MiB.
    ///
    /// The walk reads guest memory only and never faults; a missing
    /// present bit at any level yields [`MemoryError::NotMapped`].
    pub fn virt_to_phys(&self, virt: u64, entry_point: u64) -> Result<(u64, u64), MemoryError> {
        let mut table = entry_point + PAGE_SIZE;

        for level in (0..4).rev() {
            let index = (virt >> PAGE_BITS >> (level as u64 * PAGE_MAP_BITS)) & PAGE_MAP_MASK;
            let entry = self.read_u64(table + index * 8)?;

            if entry & PG_PRESENT != PG_PRESENT {
                return Err(MemoryError::NotMapped { address: virt });
            }

            // Terminal entry: a level-0 PTE, or a PSE mapping below the
            // PML4 (2 MiB at the page-directory level; these guests never
            // install 1 GiB entries but the walk would honor one).
            if level == 0 || (level < 3 && entry & PG_PSE == PG_PSE) {
                let page_mask = ((!0u64) << PAGE_BITS << (level as u64 * PAGE_MAP_BITS)) & !PG_XD;
                let page_size = PAGE_SIZE << (level as u64 * PAGE_MAP_BITS);
                let frame = entry & page_mask;
                return Ok((frame | (virt & !page_mask), frame + page_size));
            }

            table = entry & PAGE_MASK;
        }

        unreachable!("page walk terminates at level 0");
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  Tests
// ═══════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;

    const MIB: u64 = 1 << 20;

    // ─── Chunk layout ────────────────────────────────────────────────

    #[test]
    fn layout_single_chunk_below_gap() {
        let (ranges, span) = chunk_layout(64 * MIB);
        assert_eq!(ranges, vec![(0, 64 * MIB)]);
        assert_eq!(span, 64 * MIB);
    }

    #[test]
    fn layout_single_chunk_just_below_threshold() {
        let size = KVM_32BIT_GAP_START - PAGE_SIZE;
        let (ranges, _) = chunk_layout(size);
        assert_eq!(ranges.len(), 1);
        assert_eq!(ranges[0], (0, size));
    }

    #[test]
    fn layout_two_chunks_at_threshold() {
        let (ranges, span) = chunk_layout(KVM_32BIT_GAP_START);
        assert_eq!(ranges.len(), 2);
        assert_eq!(ranges[0], (0, KVM_32BIT_GAP_START));
        assert_eq!(
            ranges[1],
            (KVM_32BIT_GAP_START + KVM_32BIT_GAP_SIZE, 0),
            "exactly gap-start sized RAM leaves an empty high chunk"
        );
        assert_eq!(span, KVM_32BIT_GAP_START + KVM_32BIT_GAP_SIZE);
    }

    #[test]
    fn layout_four_gib_guest() {
        // 4 GiB of RAM: low chunk fills up to the hole, the rest lands
        // above it, shifted up by the gap size.
        let (ranges, span) = chunk_layout(4 << 30);
        assert_eq!(ranges[0], (0, 0xC000_0000));
        assert_eq!(ranges[1], (0xC000_0000 + 0x3000_0000, 0x4000_0000));
        assert_eq!(span, (4u64 << 30) + KVM_32BIT_GAP_SIZE);
    }

    #[test]
    fn layout_covers_configured_size() {
        for &size in &[512 * MIB, 3 << 30, 4 << 30, 8u64 << 30] {
            let (ranges, _) = chunk_layout(size);
            let covered: u64 = ranges.iter().map(|&(_, len)| len).sum();
            assert_eq!(covered, size, "chunks must cover {size:#x} bytes");
        }
    }

    // ─── GuestRam ────────────────────────────────────────────────────

    #[test]
    fn allocate_small_ram() {
        let ram = GuestRam::new(16 * MIB, false, false).unwrap();
        assert_eq!(ram.chunks().len(), 1);
        assert_eq!(ram.guest_size(), 16 * MIB);
        assert_eq!(ram.span(), 16 * MIB);
        assert_ne!(ram.host_base(), 0);
    }

    #[test]
    fn read_write_roundtrip() {
        let ram = GuestRam::new(4 * MIB, false, false).unwrap();
        ram.write_u64(0x1000, 0xDEAD_BEEF_CAFE_F00D).unwrap();
        assert_eq!(ram.read_u64(0x1000).unwrap(), 0xDEAD_BEEF_CAFE_F00D);

        ram.write_bytes(0x2000, b"kestrel").unwrap();
        let mut buf = [0u8; 7];
        ram.read_bytes(0x2000, &mut buf).unwrap();
        assert_eq!(&buf, b"kestrel");
    }

    #[test]
    fn read_out_of_range_fails() {
        let ram = GuestRam::new(4 * MIB, false, false).unwrap();
        assert!(ram.read_u64(4 * MIB).is_err());
    }

    // ─── virt_to_phys ────────────────────────────────────────────────

    /// Build a tiny guest hierarchy rooted at `entry + 0x1000`:
    /// identity-map virtual 0x0020_0000 to physical 0x0030_0000 with a
    /// 4 KiB page, and virtual 0x0040_0000 as a 2 MiB page at 0x0060_0000.
    fn build_tables(ram: &GuestRam, entry: u64) {
        let pml4 = entry + PAGE_SIZE;
        let pdpt = entry + 2 * PAGE_SIZE;
        let pd = entry + 3 * PAGE_SIZE;
        let pt = entry + 4 * PAGE_SIZE;

        ram.write_u64(pml4, pdpt | PG_PRESENT | PG_RW).unwrap();
        ram.write_u64(pdpt, pd | PG_PRESENT | PG_RW).unwrap();

        // PD index 1 covers virtual [0x20_0000, 0x40_0000): a page table.
        ram.write_u64(pd + 8, pt | PG_PRESENT | PG_RW).unwrap();
        // PD index 2 covers virtual [0x40_0000, 0x60_0000): a 2 MiB page,
        // with the XD bit set to check the mask.
        ram.write_u64(pd + 16, 0x0060_0000 | PG_PRESENT | PG_RW | PG_PSE | PG_XD)
            .unwrap();

        // PT index 0 maps virtual 0x20_0000 to physical 0x30_0000.
        ram.write_u64(pt, 0x0030_0000 | PG_PRESENT | PG_RW).unwrap();
    }

    #[test]
    fn translate_4k_page() {
        let ram = GuestRam::new(16 * MIB, false, false).unwrap();
        let entry = 0x10_0000;
        build_tables(&ram, entry);

        let (pa, end) = ram.virt_to_phys(0x0020_0123, entry).unwrap();
        assert_eq!(pa, 0x0030_0123);
        assert_eq!(end, 0x0030_1000);
        assert_eq!(end - (pa & !(PAGE_SIZE - 1)), PAGE_SIZE);
    }

    #[test]
    fn translate_2m_page_masks_xd() {
        let ram = GuestRam::new(16 * MIB, false, false).unwrap();
        let entry = 0x10_0000;
        build_tables(&ram, entry);

        let (pa, end) = ram.virt_to_phys(0x0040_1234, entry).unwrap();
        assert_eq!(pa, 0x0060_1234, "XD bit must not leak into the frame");
        assert_eq!(end, 0x0060_0000 + PAGE_2M_SIZE);
    }

    #[test]
    fn translate_unmapped_is_not_mapped() {
        let ram = GuestRam::new(16 * MIB, false, false).unwrap();
        let entry = 0x10_0000;
        build_tables(&ram, entry);

        let err = ram.virt_to_phys(0x0080_0000, entry).unwrap_err();
        assert!(matches!(err, MemoryError::NotMapped { address: 0x0080_0000 }));
    }

    #[test]
    fn translate_page_end_exceeds_address() {
        let ram = GuestRam::new(16 * MIB, false, false).unwrap();
        let entry = 0x10_0000;
        build_tables(&ram, entry);

        for &va in &[0x0020_0000u64, 0x0020_0FFF, 0x0040_0000, 0x005F_FFFF] {
            let (pa, end) = ram.virt_to_phys(va, entry).unwrap();
            assert!(pa < end, "pa {pa:#x} must be below page end {end:#x}");
        }
    }

    // ─── PTE constants ───────────────────────────────────────────────

    #[test]
    fn page_masks_strip_xd() {
        assert_eq!(PAGE_MASK & PG_XD, 0);
        assert_eq!(PAGE_2M_MASK & PG_XD, 0);
        assert_eq!(0xFFFF_8000_0012_3FFFu64 & PAGE_MASK, 0x7FFF_8000_0012_3000);
    }

    #[test]
    fn gap_constants() {
        assert_eq!(KVM_32BIT_GAP_START, 0xC000_0000);
        assert_eq!(KVM_32BIT_GAP_SIZE, 0x3000_0000);
    }
}
