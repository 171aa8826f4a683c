//! Physical address types and the handful of address-width computations
//! the VMX/EPT/VT-d register programming in this crate needs. There is no
//! virtual-memory abstraction here: the hypervisor runs identity-mapped
//! and every guest-visible mapping goes through [`crate::ept`] instead.

use bitflags::bitflags;

/// A host physical address.
pub type PhysicalAddress = u64;

/// 4 KiB, the only page size this design's EPT and IOMMU page tables use.
pub const PAGE_SIZE: u64 = 0x1000;
/// Bits of a physical address covered by one 4 KiB page.
pub const PAGE_SHIFT: u32 = 12;

/// Rounds `addr` down to the containing page boundary.
#[inline]
pub const fn page_align_down(addr: u64) -> u64 {
    addr & !(PAGE_SIZE - 1)
}

/// Rounds `addr` up to the next page boundary.
#[inline]
pub const fn page_align_up(addr: u64) -> u64 {
    (addr + PAGE_SIZE - 1) & !(PAGE_SIZE - 1)
}

/// Computes the mask of physical-address bits implemented by the host, as
/// reported by `CPUID.80000008H:EAX[7:0]`, with the low 12 bits (the page
/// offset) cleared. Used to build EPT PML4/PDPT/PD/PT reserved-bit masks
/// and to size the IOMMU's second-level translation tables.
///
/// `phys_bits` of 0 or greater than 52 is a caller bug (CPUID never reports
/// either on real silicon); both are clamped to keep this function total.
#[inline]
pub const fn get_address_mask(phys_bits: u8) -> u64 {
    let bits = if phys_bits == 0 {
        36
    } else if phys_bits > 52 {
        52
    } else {
        phys_bits
    };
    let full_mask = if bits == 64 { u64::MAX } else { (1u64 << bits) - 1 };
    full_mask & !(PAGE_SIZE - 1)
}

bitflags! {
    /// Caching/permission flags shared by the EPT and IOMMU page table
    /// builders. The two hardware formats don't agree bit-for-bit, so each
    /// of [`crate::ept`] and [`crate::vtd`] translates from this common set
    /// rather than sharing a raw PTE layout.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MemFlags: u32 {
        const READ    = 1 << 0;
        const WRITE   = 1 << 1;
        const EXECUTE = 1 << 2;
        const UNCACHED = 1 << 3;
        const WRITE_BACK = 1 << 4;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn address_mask_matches_expected_widths() {
        assert_eq!(get_address_mask(36), ((1u64 << 36) - 1) & !0xFFF);
        assert_eq!(get_address_mask(39), ((1u64 << 39) - 1) & !0xFFF);
        assert_eq!(get_address_mask(46), ((1u64 << 46) - 1) & !0xFFF);
        assert_eq!(get_address_mask(52), ((1u64 << 52) - 1) & !0xFFF);
    }

    #[test]
    fn address_mask_clears_page_offset_bits() {
        assert_eq!(get_address_mask(39) & 0xFFF, 0);
    }

    #[test]
    fn zero_phys_bits_falls_back_to_36() {
        assert_eq!(get_address_mask(0), get_address_mask(36));
    }

    #[test]
    fn page_align_helpers_round_correctly() {
        assert_eq!(page_align_down(0x1FFF), 0x1000);
        assert_eq!(page_align_up(0x1001), 0x2000);
        assert_eq!(page_align_up(0x1000), 0x1000);
    }
}
