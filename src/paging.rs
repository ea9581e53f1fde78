use bitflags::bitflags;
use log::debug;

use crate::error::Result;
use crate::memory::{GUEST_MEMORY_SIZE, MemoryMap, PAGE_SHIFT, PAGE_SIZE, Prot};

pub const ENTRIES_PER_TABLE: u64 = 512;
const ENTRY_SIZE: u64 = 8;

/// Pages needed to identity-map 1 GiB in 4 KiB pages:
/// 1 PML4 + 1 PDPT + 1 PD + 512 leaf tables.
const PAGE_TABLE_PAGES: u64 = 3 + ENTRIES_PER_TABLE;
pub const PAGE_TABLE_SIZE: u64 = PAGE_TABLE_PAGES * PAGE_SIZE;

/// The page-table region sits at the very top of the guest window.
pub const PML4_BASE: u64 = GUEST_MEMORY_SIZE - PAGE_TABLE_SIZE;
pub const PDPT_BASE: u64 = PML4_BASE + PAGE_SIZE;
pub const PD_BASE: u64 = PDPT_BASE + PAGE_SIZE;
pub const PT_BASE: u64 = PD_BASE + PAGE_SIZE;

// Offsets of each level within the page-table region.
const PDPT_OFFSET: u64 = PAGE_SIZE;
const PD_OFFSET: u64 = 2 * PAGE_SIZE;
const PT_OFFSET: u64 = 3 * PAGE_SIZE;

bitflags! {
    /// Page-table entry bits this builder emits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PteFlags: u64 {
        const PRESENT = 1;
        const WRITABLE = 1 << 1;
        const NO_EXECUTE = 1 << 63;
    }
}

/// Region-relative byte offset of the leaf PTE covering `gfn`.
pub fn leaf_offset(gfn: u64) -> u64 {
    let table = (gfn >> 9) & 0x1FF;
    let entry = gfn & 0x1FF;
    PT_OFFSET + table * PAGE_SIZE + entry * ENTRY_SIZE
}

/// Build identity-mapped 4 KiB page tables covering every region in
/// `memory`.
///
/// The page-table region itself is mapped first, which also makes its own
/// frames visible to the leaf walk below. The memory map must be final at
/// this point: frames mapped later are invisible to the guest unless it
/// edits the tables on its own (TLB consistency is then its problem).
pub fn build(memory: &mut MemoryMap) -> Result<()> {
    let index = memory.map(PML4_BASE, PAGE_TABLE_SIZE, None, Prot::READ | Prot::WRITE)?;
    let tables = memory.region(index);

    // The whole 1 GiB window lives under a single PML4 and PDPT entry.
    tables.write_u64(0, PDPT_BASE | PteFlags::PRESENT.bits())?;
    tables.write_u64(PDPT_OFFSET, PD_BASE | PteFlags::PRESENT.bits())?;

    // Every PD entry points at a leaf table and stays writable; effective
    // protection is decided per 4 KiB page below.
    for i in 0..ENTRIES_PER_TABLE {
        let entry = (PT_BASE + i * PAGE_SIZE) | (PteFlags::PRESENT | PteFlags::WRITABLE).bits();
        tables.write_u64(PD_OFFSET + i * ENTRY_SIZE, entry)?;
    }

    // Leaf tables come from a fresh anonymous mapping, so every entry not
    // written here stays zero (non-present). The guest can install its own
    // mappings into those slots later.
    for region in memory.regions() {
        let mut flags = PteFlags::PRESENT;
        if region.prot().contains(Prot::WRITE) {
            flags |= PteFlags::WRITABLE;
        }
        if !region.prot().contains(Prot::EXEC) {
            flags |= PteFlags::NO_EXECUTE;
        }
        for gfn in region.first_gfn()..=region.last_gfn() {
            tables.write_u64(leaf_offset(gfn), (gfn << PAGE_SHIFT) | flags.bits())?;
        }
    }

    debug!(
        "identity page tables at {PML4_BASE:#x} cover {} regions",
        memory.len() - 1
    );
    Ok(())
}
