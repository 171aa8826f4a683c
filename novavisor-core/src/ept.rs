//! EPT mapping policy (component J, core half). `novavisor_hal::ept` owns
//! the raw 512-entry table layout and entry encoding; this module owns
//! the tree — allocating levels out of a fixed pool (no `alloc`: pool
//! size is a build-time constant), walking it, and the split/merge
//! behaviour `modify_mr` needs at 2 MiB boundaries.

use novavisor_hal::ept::{EptFlags, EptLevel, EptTable};
use novavisor_hal::memory::{page_align_down, PAGE_SIZE};
use novavisor_hal::primitives::bitops::{bitmap_clear_nolock, bitmap_set_nolock, ffz64_ex};

use crate::error::{HvError, ResourceKind};

/// Page sizes this tree ever installs as a leaf: 4 KiB at the PT level,
/// 2 MiB at the PD level. 1 GiB PDPT leaves are never used — every
/// partition's RAM region is small enough that the extra complexity
/// isn't worth it, and it keeps `modify_mr`'s split/merge logic to one
/// boundary size.
const LARGE_PAGE_SIZE: u64 = 1 << 21;

/// A fixed pool of EPT tables shared by every VM's tree. Indices are
/// stable for the pool's lifetime; `0` is reserved as "no table".
pub struct EptTablePool<const N: usize> {
    tables: [EptTable; N],
    used: [u64; (N + 63) / 64],
}

impl<const N: usize> EptTablePool<N> {
    pub const fn new() -> Self {
        Self { tables: [EptTable::zeroed(); N], used: [0; (N + 63) / 64] }
    }

    fn alloc(&mut self) -> Result<u16, HvError> {
        let idx = ffz64_ex(&self.used, N as u16);
        if idx as usize >= N {
            return Err(ResourceKind::EptTablePoolExhausted.into());
        }
        bitmap_set_nolock(idx, &mut self.used);
        self.tables[idx as usize] = EptTable::zeroed();
        Ok(idx)
    }

    fn free(&mut self, idx: u16) {
        self.tables[idx as usize] = EptTable::zeroed();
        bitmap_clear_nolock(idx, &mut self.used);
    }

    fn table(&self, idx: u16) -> &EptTable {
        &self.tables[idx as usize]
    }

    fn table_mut(&mut self, idx: u16) -> &mut EptTable {
        &mut self.tables[idx as usize]
    }

    /// Count of currently-allocated tables, diagnostic only.
    pub fn used(&self) -> usize {
        self.used.iter().map(|w| w.count_ones() as usize).sum()
    }
}

/// One VM's EPT root. Owns no memory itself beyond the PML4 slot —
/// descendants are allocated from the shared [`EptTablePool`] as mappings
/// are installed.
pub struct VmEpt {
    pml4_idx: u16,
    phys_bits: u8,
}

impl VmEpt {
    pub fn new<const N: usize>(pool: &mut EptTablePool<N>, phys_bits: u8) -> Result<Self, HvError> {
        let pml4_idx = pool.alloc()?;
        Ok(Self { pml4_idx, phys_bits })
    }

    pub fn root_phys<const N: usize>(&self, pool: &EptTablePool<N>) -> u64 {
        pool.table(self.pml4_idx).as_phys()
    }

    fn walk_or_create<const N: usize>(&self, pool: &mut EptTablePool<N>, gpa: u64, down_to: EptLevel) -> Result<u16, HvError> {
        let mut cur = self.pml4_idx;
        let mut level = EptLevel::Pml4;
        loop {
            if level as u8 == down_to as u8 {
                return Ok(cur);
            }
            let idx = level.index_of(gpa);
            if !pool.table(cur).is_present(idx) {
                let child = pool.alloc()?;
                let child_pa = pool.table(child).as_phys();
                pool.table_mut(cur).set_table(idx, child_pa, self.phys_bits);
                cur = child;
            } else {
                let child_pa = pool.table(cur).next_table_pa(idx, self.phys_bits);
                cur = find_table_index(pool, child_pa);
            }
            level = level.next().expect("down_to must be reachable from PML4");
        }
    }

    /// `add_mr`: maps `[gpa, gpa+size)` to `[hpa, hpa+size)` with `flags`.
    /// Refuses to overlap an existing present leaf. `size` must be a
    /// multiple of 4 KiB; ranges that are 2 MiB-aligned on both ends use
    /// large-page leaves, the remainder uses 4 KiB leaves.
    pub fn add_mr<const N: usize>(&self, pool: &mut EptTablePool<N>, gpa: u64, hpa: u64, size: u64, flags: EptFlags) -> Result<(), HvError> {
        let mut offset = 0u64;
        while offset < size {
            let cur_gpa = gpa + offset;
            let cur_hpa = hpa + offset;
            let remaining = size - offset;
            let use_large = cur_gpa % LARGE_PAGE_SIZE == 0 && cur_hpa % LARGE_PAGE_SIZE == 0 && remaining >= LARGE_PAGE_SIZE;
            let (level, step) = if use_large { (EptLevel::Pd, LARGE_PAGE_SIZE) } else { (EptLevel::Pt, PAGE_SIZE) };

            let table_idx = self.walk_or_create(pool, cur_gpa, level)?;
            let entry_idx = level.index_of(cur_gpa);
            if pool.table(table_idx).is_present(entry_idx) {
                return Err(HvError::Bug("add_mr: already mapped"));
            }
            pool.table_mut(table_idx).set_leaf(entry_idx, cur_hpa, flags, use_large, self.phys_bits);
            offset += step;
        }
        Ok(())
    }

    /// `modify_mr`: changes permission bits across `[gpa, gpa+size)`.
    /// Splits a large leaf that straddles a range boundary into 4 KiB
    /// leaves first, applies the change, then tries to remerge a PD's
    /// worth of 4 KiB leaves back into one 2 MiB leaf when they now share
    /// identical attributes.
    pub fn modify_mr<const N: usize>(&self, pool: &mut EptTablePool<N>, gpa: u64, size: u64, set: EptFlags, clear: EptFlags) -> Result<(), HvError> {
        let start = page_align_down(gpa);
        let end = page_align_down(gpa + size + PAGE_SIZE - 1);
        let mut addr = start;
        while addr < end {
            self.split_if_needed(pool, addr)?;
            let table_idx = self.walk_or_create(pool, addr, EptLevel::Pt)?;
            let entry_idx = EptLevel::Pt.index_of(addr);
            if pool.table(table_idx).is_present(entry_idx) {
                let hpa = pool.table(table_idx).entry(entry_idx) & !0xFFFu64;
                let hpa = hpa & novavisor_hal::memory::get_address_mask(self.phys_bits);
                let cur = EptFlags::from_bits_truncate(pool.table(table_idx).entry(entry_idx) & EptFlags::all().bits());
                let new_flags = (cur | set) & !clear;
                pool.table_mut(table_idx).set_leaf(entry_idx, hpa, new_flags, false, self.phys_bits);
            }
            addr += PAGE_SIZE;
        }
        self.try_remerge(pool, start);
        Ok(())
    }

    /// Splits the PD-level large leaf covering `gpa`, if any, into 512
    /// 4 KiB PT leaves with identical attributes.
    fn split_if_needed<const N: usize>(&self, pool: &mut EptTablePool<N>, gpa: u64) -> Result<(), HvError> {
        let pd_idx = self.walk_or_create(pool, gpa, EptLevel::Pd)?;
        let entry_idx = EptLevel::Pd.index_of(gpa);
        if !pool.table(pd_idx).is_present(entry_idx) || !pool.table(pd_idx).is_large(entry_idx) {
            return Ok(());
        }
        let entry = pool.table(pd_idx).entry(entry_idx);
        let base_hpa = entry & novavisor_hal::memory::get_address_mask(self.phys_bits);
        let flags = EptFlags::from_bits_truncate(entry & EptFlags::all().bits() & !EptFlags::LARGE_PAGE.bits());

        let pt_idx = pool.alloc()?;
        for i in 0..512u64 {
            let leaf_hpa = base_hpa + i * PAGE_SIZE;
            pool.table_mut(pt_idx).set_leaf(i as usize, leaf_hpa, flags, false, self.phys_bits);
        }
        let pt_pa = pool.table(pt_idx).as_phys();
        pool.table_mut(pd_idx).set_table(entry_idx, pt_pa, self.phys_bits);
        Ok(())
    }

    /// Attempts to collapse the PD entry covering `gpa` back into one
    /// large leaf if all 512 of its PT's entries are present with
    /// identical attributes and contiguous host-physical addresses.
    fn try_remerge<const N: usize>(&self, pool: &mut EptTablePool<N>, gpa: u64) {
        let Ok(pd_idx) = self.walk_or_create(pool, gpa, EptLevel::Pd) else { return };
        let entry_idx = EptLevel::Pd.index_of(gpa);
        if !pool.table(pd_idx).is_present(entry_idx) || pool.table(pd_idx).is_large(entry_idx) {
            return;
        }
        let mask = novavisor_hal::memory::get_address_mask(self.phys_bits);
        let pt_pa = pool.table(pd_idx).next_table_pa(entry_idx, self.phys_bits);
        let pt_idx = find_table_index(pool, pt_pa);

        let first = pool.table(pt_idx).entry(0);
        if (first & EptFlags::PERM_MASK) == 0 {
            return;
        }
        let flags = first & (EptFlags::all().bits());
        let base_hpa = first & mask;
        for i in 0..512u64 {
            let e = pool.table(pt_idx).entry(i as usize);
            if (e & EptFlags::all().bits()) != flags || (e & mask) != base_hpa + i * PAGE_SIZE {
                return;
            }
        }
        let merged_flags = EptFlags::from_bits_truncate(flags & !EptFlags::LARGE_PAGE.bits());
        pool.table_mut(pd_idx).set_leaf(entry_idx, base_hpa, merged_flags, true, self.phys_bits);
        pool.free(pt_idx);
    }

    /// `del_mr`: unmaps `[gpa, gpa+size)`, splitting any straddled large
    /// leaf first.
    pub fn del_mr<const N: usize>(&self, pool: &mut EptTablePool<N>, gpa: u64, size: u64) -> Result<(), HvError> {
        let start = page_align_down(gpa);
        let end = page_align_down(gpa + size + PAGE_SIZE - 1);
        let mut addr = start;
        while addr < end {
            self.split_if_needed(pool, addr)?;
            let table_idx = self.walk_or_create(pool, addr, EptLevel::Pt)?;
            let entry_idx = EptLevel::Pt.index_of(addr);
            pool.table_mut(table_idx).clear(entry_idx);
            addr += PAGE_SIZE;
        }
        Ok(())
    }

    /// Frees every table this tree owns, including the PML4 root, back to
    /// `pool`. Consumes `self`: the root index would otherwise dangle.
    pub fn destroy<const N: usize>(self, pool: &mut EptTablePool<N>) {
        self.free_level(pool, self.pml4_idx, EptLevel::Pml4);
    }

    fn free_level<const N: usize>(&self, pool: &mut EptTablePool<N>, table_idx: u16, level: EptLevel) {
        if level != EptLevel::Pt {
            for i in 0..512usize {
                if !pool.table(table_idx).is_present(i) || pool.table(table_idx).is_large(i) {
                    continue;
                }
                let child_pa = pool.table(table_idx).next_table_pa(i, self.phys_bits);
                let child_idx = find_table_index(pool, child_pa);
                if let Some(next) = level.next() {
                    self.free_level(pool, child_idx, next);
                }
            }
        }
        pool.free(table_idx);
    }

    /// `walk_ept_table(vm, cb)`: visits every present leaf (gpa, hpa,
    /// size, flags).
    pub fn walk<const N: usize>(&self, pool: &EptTablePool<N>, mut cb: impl FnMut(u64, u64, u64, EptFlags)) {
        self.walk_level(pool, self.pml4_idx, EptLevel::Pml4, 0, &mut cb);
    }

    fn walk_level<const N: usize>(&self, pool: &EptTablePool<N>, table_idx: u16, level: EptLevel, base_gpa: u64, cb: &mut impl FnMut(u64, u64, u64, EptFlags)) {
        let table = pool.table(table_idx);
        let span = match level {
            EptLevel::Pml4 => 1u64 << 39,
            EptLevel::Pdpt => 1u64 << 30,
            EptLevel::Pd => 1u64 << 21,
            EptLevel::Pt => 1u64 << 12,
        };
        for i in 0..512u64 {
            if !table.is_present(i as usize) {
                continue;
            }
            let gpa = base_gpa + i * span;
            if level == EptLevel::Pt || (table.is_large(i as usize) && level != EptLevel::Pml4) {
                let hpa = table.next_table_pa(i as usize, self.phys_bits); // masked address, same field for leaves
                let flags = EptFlags::from_bits_truncate(table.entry(i as usize) & EptFlags::all().bits());
                cb(gpa, hpa, span, flags);
            } else if let Some(next) = level.next() {
                let child_pa = table.next_table_pa(i as usize, self.phys_bits);
                let child_idx = find_table_index(pool, child_pa);
                self.walk_level(pool, child_idx, next, gpa, cb);
            }
        }
    }
}

fn find_table_index<const N: usize>(pool: &EptTablePool<N>, phys: u64) -> u16 {
    for i in 0..N as u16 {
        if pool.table(i).as_phys() == phys {
            return i;
        }
    }
    panic!("EPT table physical address not found in pool; pool corruption");
}

/// The EPT-violation exit handler policy (§4.J): if the exit qualification
/// carries "instruction fetch", extend the 4 KiB page at `gpa & !0xFFF`
/// with execute permission and retain RIP for retry; otherwise this is a
/// guest data fault, for the caller to inject as `#PF` via
/// [`crate::vcpu::Vcpu::inject_pf`].
pub enum EptViolationAction {
    RetryWithExecuteGranted,
    InjectGuestPageFault,
}

pub fn handle_ept_violation<const N: usize>(vm_ept: &VmEpt, pool: &mut EptTablePool<N>, gpa: u64, is_instruction_fetch: bool) -> Result<EptViolationAction, HvError> {
    if is_instruction_fetch {
        let page = page_align_down(gpa);
        vm_ept.modify_mr(pool, page, PAGE_SIZE, EptFlags::EXEC, EptFlags::empty())?;
        Ok(EptViolationAction::RetryWithExecuteGranted)
    } else {
        Ok(EptViolationAction::InjectGuestPageFault)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    type TestPool = EptTablePool<64>;

    #[test]
    fn add_mr_then_walk_reports_the_mapping() {
        let mut pool = TestPool::new();
        let vm_ept = VmEpt::new(&mut pool, 39).unwrap();
        vm_ept.add_mr(&mut pool, 0x10_0000, 0x20_0000, PAGE_SIZE, EptFlags::READ | EptFlags::WRITE).unwrap();

        let mut seen = None;
        vm_ept.walk(&pool, |gpa, hpa, size, flags| {
            seen = Some((gpa, hpa, size, flags));
        });
        assert_eq!(seen, Some((0x10_0000, 0x20_0000, PAGE_SIZE, EptFlags::READ | EptFlags::WRITE)));
    }

    #[test]
    fn add_mr_refuses_overlap() {
        let mut pool = TestPool::new();
        let vm_ept = VmEpt::new(&mut pool, 39).unwrap();
        vm_ept.add_mr(&mut pool, 0x10_0000, 0x20_0000, PAGE_SIZE, EptFlags::READ).unwrap();
        let result = vm_ept.add_mr(&mut pool, 0x10_0000, 0x30_0000, PAGE_SIZE, EptFlags::READ);
        assert!(result.is_err());
    }

    #[test]
    fn large_page_mapping_splits_on_sub_range_modify() {
        let mut pool = TestPool::new();
        let vm_ept = VmEpt::new(&mut pool, 39).unwrap();
        vm_ept.add_mr(&mut pool, 0, 0x1000_0000, LARGE_PAGE_SIZE, EptFlags::READ | EptFlags::WRITE).unwrap();
        vm_ept.modify_mr(&mut pool, 0, PAGE_SIZE, EptFlags::EXEC, EptFlags::empty()).unwrap();

        let mut leaves = heapless::Vec::<(u64, u64, u64, EptFlags), 600>::new();
        vm_ept.walk(&pool, |gpa, hpa, size, flags| {
            let _ = leaves.push((gpa, hpa, size, flags));
        });
        let first = leaves.iter().find(|(gpa, ..)| *gpa == 0).unwrap();
        assert!(first.3.contains(EptFlags::EXEC));
        assert_eq!(first.2, PAGE_SIZE);
        let second = leaves.iter().find(|(gpa, ..)| *gpa == PAGE_SIZE).unwrap();
        assert!(!second.3.contains(EptFlags::EXEC));
    }

    #[test]
    fn ept_violation_on_instruction_fetch_grants_execute_and_retries() {
        let mut pool = TestPool::new();
        let vm_ept = VmEpt::new(&mut pool, 39).unwrap();
        vm_ept.add_mr(&mut pool, 0, 0x1000_0000, PAGE_SIZE, EptFlags::READ | EptFlags::WRITE).unwrap();
        let action = handle_ept_violation(&vm_ept, &mut pool, 0x10, true).unwrap();
        assert!(matches!(action, EptViolationAction::RetryWithExecuteGranted));

        let mut seen_exec = false;
        vm_ept.walk(&pool, |gpa, _, _, flags| {
            if gpa == 0 {
                seen_exec = flags.contains(EptFlags::EXEC);
            }
        });
        assert!(seen_exec);
    }

    #[test]
    fn ept_violation_on_data_access_requests_guest_page_fault() {
        let mut pool = TestPool::new();
        let vm_ept = VmEpt::new(&mut pool, 39).unwrap();
        let action = handle_ept_violation(&vm_ept, &mut pool, 0x5000, false).unwrap();
        assert!(matches!(action, EptViolationAction::InjectGuestPageFault));
    }

    #[test]
    fn destroy_frees_every_table_back_to_the_pool() {
        let mut pool = EptTablePool::<8>::new();
        let vm_ept = VmEpt::new(&mut pool, 39).unwrap();
        // One 4 KiB leaf: PML4 + PDPT + PD + PT, 4 of the pool's 8 slots.
        vm_ept.add_mr(&mut pool, 0, 0x1000_0000, PAGE_SIZE, EptFlags::READ).unwrap();
        vm_ept.destroy(&mut pool);
        for _ in 0..8 {
            pool.alloc().unwrap();
        }
    }

    #[test]
    fn del_mr_clears_the_leaf() {
        let mut pool = TestPool::new();
        let vm_ept = VmEpt::new(&mut pool, 39).unwrap();
        vm_ept.add_mr(&mut pool, 0x4000, 0x5000, PAGE_SIZE, EptFlags::READ).unwrap();
        vm_ept.del_mr(&mut pool, 0x4000, PAGE_SIZE).unwrap();
        let mut any = false;
        vm_ept.walk(&pool, |_, _, _, _| any = true);
        assert!(!any);
    }
}
