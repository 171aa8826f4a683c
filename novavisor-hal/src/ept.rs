//! EPT (Extended Page Table) data structures and raw entry encoding
//! (component J, hardware half). The page-table-tree policy — allocating
//! levels from a per-VM pool, splitting/merging large pages, and the
//! `add_mr`/`modify_mr`/`del_mr` mapping operations — lives in
//! `novavisor-core::ept`; this module only owns the layout of a single
//! 512-entry table and the bit encoding of one entry.

use crate::memory::{get_address_mask, PhysicalAddress, PAGE_SHIFT};

bitflags::bitflags! {
    /// EPT leaf/non-leaf entry permission and memory-type bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct EptFlags: u64 {
        const READ  = 1 << 0;
        const WRITE = 1 << 1;
        const EXEC  = 1 << 2;
        /// Memory type field, bits [5:3]; value 6 is write-back.
        const MEM_TYPE_WB = 6 << 3;
        /// "Ignore PAT" bit, set alongside an explicit memory type.
        const IGNORE_PAT = 1 << 6;
        /// Marks a 2 MiB/1 GiB leaf at a non-leaf level (PD or PDPT entry).
        const LARGE_PAGE = 1 << 7;
        /// Suppress `#VE` on an EPT violation for this entry (unused here;
        /// kept so the bit is documented rather than silently reused).
        const SUPPRESS_VE = 1 << 63;
    }
}

impl EptFlags {
    /// The three architectural permission bits, independent of memory type.
    pub const PERM_MASK: u64 = Self::READ.bits() | Self::WRITE.bits() | Self::EXEC.bits();

    pub fn from_rwx(read: bool, write: bool, exec: bool) -> Self {
        let mut f = Self::empty();
        if read {
            f |= Self::READ;
        }
        if write {
            f |= Self::WRITE;
        }
        if exec {
            f |= Self::EXEC;
        }
        f
    }
}

/// Levels of a 4-level EPT walk, PML4 first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EptLevel {
    Pml4,
    Pdpt,
    Pd,
    Pt,
}

impl EptLevel {
    /// Index into this level's 512-entry table for guest-physical address
    /// `gpa`.
    pub const fn index_of(self, gpa: u64) -> usize {
        let shift = match self {
            EptLevel::Pml4 => 39,
            EptLevel::Pdpt => 30,
            EptLevel::Pd => 21,
            EptLevel::Pt => 12,
        };
        ((gpa >> shift) & 0x1FF) as usize
    }

    /// Size in bytes a single entry at this level covers when used as a
    /// leaf (1 GiB / 2 MiB / 4 KiB for PDPT/PD/PT respectively; PML4
    /// entries are never leaves).
    pub const fn leaf_size(self) -> u64 {
        match self {
            EptLevel::Pml4 => 0,
            EptLevel::Pdpt => 1 << 30,
            EptLevel::Pd => 1 << 21,
            EptLevel::Pt => 1 << PAGE_SHIFT,
        }
    }

    pub const fn next(self) -> Option<EptLevel> {
        match self {
            EptLevel::Pml4 => Some(EptLevel::Pdpt),
            EptLevel::Pdpt => Some(EptLevel::Pd),
            EptLevel::Pd => Some(EptLevel::Pt),
            EptLevel::Pt => None,
        }
    }
}

/// One 512-entry, 4 KiB-aligned EPT table; the same layout serves all four
/// levels.
#[repr(C, align(4096))]
#[derive(Clone, Copy)]
pub struct EptTable {
    entries: [u64; 512],
}

impl EptTable {
    pub const fn zeroed() -> Self {
        Self { entries: [0; 512] }
    }

    #[inline]
    pub fn entry(&self, idx: usize) -> u64 {
        self.entries[idx]
    }

    #[inline]
    pub fn is_present(&self, idx: usize) -> bool {
        (self.entries[idx] & EptFlags::PERM_MASK) != 0
    }

    #[inline]
    pub fn is_large(&self, idx: usize) -> bool {
        (self.entries[idx] & EptFlags::LARGE_PAGE.bits()) != 0
    }

    /// Encodes a non-leaf entry pointing at the next-level table's
    /// physical address.
    pub fn set_table(&mut self, idx: usize, next_table_pa: PhysicalAddress, phys_bits: u8) {
        let mask = get_address_mask(phys_bits);
        self.entries[idx] = (next_table_pa & mask) | EptFlags::READ.bits() | EptFlags::WRITE.bits() | EptFlags::EXEC.bits();
    }

    /// Encodes a leaf entry mapping `hpa` with `flags`, marking it large
    /// when `large` is set (PDPT/PD levels only).
    pub fn set_leaf(&mut self, idx: usize, hpa: PhysicalAddress, flags: EptFlags, large: bool, phys_bits: u8) {
        let mask = get_address_mask(phys_bits);
        let mut bits = (hpa & mask) | flags.bits();
        if large {
            bits |= EptFlags::LARGE_PAGE.bits();
        }
        self.entries[idx] = bits;
    }

    pub fn clear(&mut self, idx: usize) {
        self.entries[idx] = 0;
    }

    /// The next-level table physical address stored in a non-leaf entry.
    pub fn next_table_pa(&self, idx: usize, phys_bits: u8) -> PhysicalAddress {
        self.entries[idx] & get_address_mask(phys_bits)
    }

    pub fn as_phys(&self) -> PhysicalAddress {
        self as *const _ as PhysicalAddress
    }
}

/// The EPT pointer (EPTP) VMCS field value for a given PML4 physical
/// address: write-back memory type, page-walk length 4 (encoded as 3),
/// "accessed/dirty" bit left clear (this design does not use A/D bits).
pub fn build_eptp(pml4_pa: PhysicalAddress) -> u64 {
    const MEM_TYPE_WB: u64 = 6;
    const WALK_LENGTH_4: u64 = 3 << 3;
    pml4_pa | MEM_TYPE_WB | WALK_LENGTH_4
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn level_index_extracts_correct_bit_ranges() {
        let gpa = 0x1234_5678_9000u64;
        assert_eq!(EptLevel::Pt.index_of(gpa), ((gpa >> 12) & 0x1FF) as usize);
        assert_eq!(EptLevel::Pd.index_of(gpa), ((gpa >> 21) & 0x1FF) as usize);
        assert_eq!(EptLevel::Pdpt.index_of(gpa), ((gpa >> 30) & 0x1FF) as usize);
        assert_eq!(EptLevel::Pml4.index_of(gpa), ((gpa >> 39) & 0x1FF) as usize);
    }

    #[test]
    fn leaf_roundtrips_address_and_flags() {
        let mut table = EptTable::zeroed();
        table.set_leaf(5, 0x2000_0000, EptFlags::READ | EptFlags::WRITE, false, 39);
        assert!(table.is_present(5));
        assert!(!table.is_large(5));
        assert_eq!(table.entry(5) & EptFlags::PERM_MASK, (EptFlags::READ | EptFlags::WRITE).bits());
    }

    #[test]
    fn large_leaf_sets_large_page_bit() {
        let mut table = EptTable::zeroed();
        table.set_leaf(0, 0x4000_0000, EptFlags::READ, true, 39);
        assert!(table.is_large(0));
    }

    #[test]
    fn clearing_an_entry_makes_it_not_present() {
        let mut table = EptTable::zeroed();
        table.set_leaf(3, 0x1000, EptFlags::READ, false, 39);
        table.clear(3);
        assert!(!table.is_present(3));
    }

    #[test]
    fn eptp_encodes_write_back_and_walk_length() {
        let eptp = build_eptp(0x1000);
        assert_eq!(eptp & 0x7, 6);
        assert_eq!((eptp >> 3) & 0x7, 3);
        assert_eq!(eptp & !0xFFFu64, 0x1000);
    }
}
