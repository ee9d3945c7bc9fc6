//! Guest page-table scanning for memory dumps.
//!
//! Checkpoints and migration both need to enumerate the guest's pages.
//! The primary backend walks the guest's own 4-level hierarchy (rooted one
//! page past the image entry point) and emits `(entry_word, address, len)`
//! triples for every present page matching a selection predicate; the
//! alternative backend asks KVM for its per-slot dirty bitmaps.
//!
//! Scans are only valid while every vCPU is quiesced. The walk itself is
//! read-only except for the explicit accessed/dirty clearing used to reset
//! the incremental watermark.

use std::io;

use log::debug;

use crate::memory::{
    GuestRam, PAGE_2M_MASK, PAGE_2M_SIZE, PAGE_MAP_BITS, PAGE_MASK, PAGE_SIZE, PG_ACCESSED,
    PG_DIRTY, PG_PRESENT, PG_PSE,
};

/// Which present pages a scan emits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageSelector {
    /// Every present page (full dumps).
    Present,
    /// Present pages with the accessed bit set (first incremental pass).
    Accessed,
    /// Present pages with the dirty bit set (later incremental passes).
    Dirty,
}

impl PageSelector {
    /// The incremental selector for a given pass history: dirty once an
    /// earlier pass has established a baseline, accessed before that.
    pub fn incremental(passes_done: u32) -> Self {
        if passes_done > 0 {
            PageSelector::Dirty
        } else {
            PageSelector::Accessed
        }
    }

    fn matches(self, entry: u64) -> bool {
        match self {
            PageSelector::Present => true,
            PageSelector::Accessed => entry & PG_ACCESSED != 0,
            PageSelector::Dirty => entry & PG_DIRTY != 0,
        }
    }
}

/// Derive the guest-physical destination offset encoded in a dump record's
/// entry word: 2 MiB-aligned when the PSE bit is set, else 4 KiB-aligned.
pub fn dest_offset(entry: u64) -> u64 {
    if entry & PG_PSE != 0 {
        entry & PAGE_2M_MASK
    } else {
        entry & PAGE_MASK
    }
}

/// Walk the guest page tables and emit every page matching `selector`.
///
/// The sink receives `(entry_word, guest_phys, page_len)`. For 4 KiB pages
/// the emitted entry word has the PSE/PAT bit masked so that
/// [`dest_offset`] can distinguish page sizes on replay. When `clear` is
/// set, the accessed and dirty bits of emitted entries are cleared in
/// guest memory after observation.
pub fn scan_page_tables<F>(
    ram: &GuestRam,
    entry_point: u64,
    selector: PageSelector,
    clear: bool,
    mut sink: F,
) -> io::Result<()>
where
    F: FnMut(u64, u64, usize) -> io::Result<()>,
{
    let mut emitted = 0u64;
    let pml4 = entry_point + PAGE_SIZE;

    for i in 0..(1u64 << PAGE_MAP_BITS) {
        let pml4e = match ram.read_u64(pml4 + i * 8) {
            Ok(e) if e & PG_PRESENT != 0 => e,
            _ => continue,
        };
        let pdpt = pml4e & PAGE_MASK;

        for j in 0..(1u64 << PAGE_MAP_BITS) {
            let pdpte = match ram.read_u64(pdpt + j * 8) {
                Ok(e) if e & PG_PRESENT != 0 => e,
                _ => continue,
            };
            let pd = pdpte & PAGE_MASK;

            for k in 0..(1u64 << PAGE_MAP_BITS) {
                let pde_addr = pd + k * 8;
                let pde = match ram.read_u64(pde_addr) {
                    Ok(e) if e & PG_PRESENT != 0 => e,
                    _ => continue,
                };

                if pde & PG_PSE == 0 {
                    let pt = pde & PAGE_MASK;
                    for l in 0..(1u64 << PAGE_MAP_BITS) {
                        let pte_addr = pt + l * 8;
                        let pte = match ram.read_u64(pte_addr) {
                            Ok(e) if e & PG_PRESENT != 0 => e,
                            _ => continue,
                        };
                        if !selector.matches(pte) {
                            continue;
                        }
                        if clear {
                            let _ = ram.write_u64(pte_addr, pte & !(PG_DIRTY | PG_ACCESSED));
                        }
                        // PAT shares the PSE bit position in level-1
                        // entries; mask it so replay sees a 4 KiB record.
                        sink(pte & !PG_PSE, pte & PAGE_MASK, PAGE_SIZE as usize)?;
                        emitted += 1;
                    }
                } else if selector.matches(pde) {
                    if clear {
                        let _ = ram.write_u64(pde_addr, pde & !(PG_DIRTY | PG_ACCESSED));
                    }
                    sink(pde, pde & PAGE_2M_MASK, PAGE_2M_SIZE as usize)?;
                    emitted += 1;
                }
            }
        }
    }

    debug!("page-table scan emitted {emitted} pages ({selector:?}, clear: {clear})");
    Ok(())
}

/// Emit one 4 KiB record per set bit in a dirty-log bitmap.
///
/// `base` is the guest-physical address of the slot's first page. Records
/// carry the page address itself as the entry word, which replays to the
/// same offset.
pub fn for_each_set_bit<F>(words: &[u64], base: u64, mut sink: F) -> io::Result<()>
where
    F: FnMut(u64, u64, usize) -> io::Result<()>,
{
    for (i, &word) in words.iter().enumerate() {
        if word == 0 {
            continue;
        }
        for bit in 0..64 {
            if word & (1u64 << bit) != 0 {
                let addr = base + (i as u64 * 64 + bit) * PAGE_SIZE;
                sink(addr, addr, PAGE_SIZE as usize)?;
            }
        }
    }
    Ok(())
}

/// Dirty-log backend: fetch KVM's per-slot bitmaps and emit every dirty
/// 4 KiB frame. Slots are scanned in chunk order, so the second chunk's
/// frames land above the 32-bit hole.
///
/// Requires the memory slots to be registered with dirty logging enabled.
pub fn scan_dirty_log<F>(vm: &kvm_ioctls::VmFd, ram: &GuestRam, mut sink: F) -> io::Result<()>
where
    F: FnMut(u64, u64, usize) -> io::Result<()>,
{
    for (slot, chunk) in ram.chunks().iter().enumerate() {
        let bitmap = vm
            .get_dirty_log(slot as u32, chunk.size as usize)
            .map_err(|e| io::Error::other(format!("KVM_GET_DIRTY_LOG failed: {e}")))?;
        for_each_set_bit(&bitmap, chunk.guest_addr, &mut sink)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::PG_RW;

    const MIB: u64 = 1 << 20;

    /// Lay out a hierarchy with three 4 KiB pages and one 2 MiB page:
    ///
    /// - 4 KiB at phys 0x30_0000: accessed + dirty
    /// - 4 KiB at phys 0x30_1000: accessed only
    /// - 4 KiB at phys 0x30_2000: neither bit
    /// - 2 MiB at phys 0x60_0000: accessed + dirty
    fn build_fixture(ram: &GuestRam, entry: u64) {
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
        ram.write_u64(pt + 8, 0x0030_1000 | PG_PRESENT | PG_RW | PG_ACCESSED)
            .unwrap();
        ram.write_u64(pt + 16, 0x0030_2000 | PG_PRESENT | PG_RW)
            .unwrap();
    }

    fn collect(ram: &GuestRam, entry: u64, sel: PageSelector, clear: bool) -> Vec<(u64, u64, usize)> {
        let mut out = Vec::new();
        scan_page_tables(ram, entry, sel, clear, |e, a, l| {
            out.push((e, a, l));
            Ok(())
        })
        .unwrap();
        out
    }

    #[test]
    fn full_scan_emits_every_present_page() {
        let ram = GuestRam::new(16 * MIB, false, false).unwrap();
        let entry = 0x10_0000;
        build_fixture(&ram, entry);

        let pages = collect(&ram, entry, PageSelector::Present, false);
        assert_eq!(pages.len(), 4);
        assert!(pages.contains(&(
            0x0030_2000 | PG_PRESENT | PG_RW,
            0x0030_2000,
            PAGE_SIZE as usize
        )));
    }

    #[test]
    fn accessed_scan_skips_untouched_pages() {
        let ram = GuestRam::new(16 * MIB, false, false).unwrap();
        let entry = 0x10_0000;
        build_fixture(&ram, entry);

        let pages = collect(&ram, entry, PageSelector::Accessed, false);
        let addrs: Vec<u64> = pages.iter().map(|&(_, a, _)| a).collect();
        assert_eq!(pages.len(), 3);
        assert!(!addrs.contains(&0x0030_2000));
    }

    #[test]
    fn dirty_scan_selects_written_pages_only() {
        let ram = GuestRam::new(16 * MIB, false, false).unwrap();
        let entry = 0x10_0000;
        build_fixture(&ram, entry);

        let pages = collect(&ram, entry, PageSelector::Dirty, false);
        let addrs: Vec<u64> = pages.iter().map(|&(_, a, _)| a).collect();
        assert_eq!(addrs, vec![0x0030_0000, 0x0060_0000]);
    }

    #[test]
    fn huge_pages_report_their_size() {
        let ram = GuestRam::new(16 * MIB, false, false).unwrap();
        let entry = 0x10_0000;
        build_fixture(&ram, entry);

        let pages = collect(&ram, entry, PageSelector::Dirty, false);
        let huge = pages.iter().find(|&&(_, a, _)| a == 0x0060_0000).unwrap();
        assert_eq!(huge.2, PAGE_2M_SIZE as usize);
        assert_ne!(huge.0 & PG_PSE, 0, "2 MiB records keep the PSE bit");
    }

    #[test]
    fn small_page_records_mask_pse() {
        let ram = GuestRam::new(16 * MIB, false, false).unwrap();
        let entry = 0x10_0000;
        build_fixture(&ram, entry);

        for (e, _, len) in collect(&ram, entry, PageSelector::Present, false) {
            if len == PAGE_SIZE as usize {
                assert_eq!(e & PG_PSE, 0, "4 KiB records must not carry PSE/PAT");
            }
        }
    }

    #[test]
    fn clearing_resets_the_watermark() {
        let ram = GuestRam::new(16 * MIB, false, false).unwrap();
        let entry = 0x10_0000;
        build_fixture(&ram, entry);

        let first = collect(&ram, entry, PageSelector::Dirty, true);
        assert_eq!(first.len(), 2);

        // Every observed dirty bit is gone, so a second pass is empty.
        let second = collect(&ram, entry, PageSelector::Dirty, false);
        assert!(second.is_empty());

        // The accessed bits of the emitted pages were cleared too.
        let accessed = collect(&ram, entry, PageSelector::Accessed, false);
        let addrs: Vec<u64> = accessed.iter().map(|&(_, a, _)| a).collect();
        assert_eq!(addrs, vec![0x0030_1000]);
    }

    #[test]
    fn scan_without_clear_is_read_only() {
        let ram = GuestRam::new(16 * MIB, false, false).unwrap();
        let entry = 0x10_0000;
        build_fixture(&ram, entry);

        let before = collect(&ram, entry, PageSelector::Present, false);
        let _ = collect(&ram, entry, PageSelector::Dirty, false);
        let after = collect(&ram, entry, PageSelector::Present, false);
        assert_eq!(before, after);
    }

    #[test]
    fn selector_history() {
        assert_eq!(PageSelector::incremental(0), PageSelector::Accessed);
        assert_eq!(PageSelector::incremental(1), PageSelector::Dirty);
        assert_eq!(PageSelector::incremental(7), PageSelector::Dirty);
    }

    #[test]
    fn dest_offset_by_page_size() {
        assert_eq!(dest_offset(0x0030_0000 | PG_PRESENT | PG_ACCESSED), 0x0030_0000);
        assert_eq!(
            dest_offset(0x0060_0000 | PG_PRESENT | PG_PSE | 0x1FFF),
            0x0060_0000
        );
        // The XD bit never reaches the offset.
        assert_eq!(dest_offset(0x0030_0000 | crate::memory::PG_XD | PG_PRESENT), 0x0030_0000);
    }

    #[test]
    fn set_bits_become_page_records() {
        let words = vec![0b1001u64, 0, 1 << 63];
        let mut out = Vec::new();
        for_each_set_bit(&words, 0x1_0000, |e, a, l| {
            assert_eq!(e, a);
            assert_eq!(l, PAGE_SIZE as usize);
            out.push(a);
            Ok(())
        })
        .unwrap();
        assert_eq!(
            out,
            vec![
                0x1_0000,
                0x1_0000 + 3 * PAGE_SIZE,
                0x1_0000 + (2 * 64 + 63) * PAGE_SIZE,
            ]
        );
    }
}
