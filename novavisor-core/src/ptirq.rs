//! Pass-through IRQ bookkeeping (component G, core half): a fixed pool of
//! `ptirq` entries shared by every VM's assigned interrupt lines and MSI
//! vectors, allocated with the same clear-bit-race pattern the rest of this
//! design uses for shared bitmaps.

use core::sync::atomic::{AtomicBool, Ordering};

use novavisor_hal::primitives::bitops::{bitmap_clear_nolock, ffz64_ex};
use novavisor_hal::primitives::spinlock::IrqSpinLock;

use crate::error::{HvError, ResourceKind};
use crate::irq::{IrqHandler, IrqTable};

/// Upper bound on simultaneously-assigned pass-through interrupt sources
/// (legacy IOAPIC lines plus MSI/MSI-X vectors) across every partition.
pub const MAX_PT_IRQ_ENTRIES: usize = 32;
const BITMAP_WORDS: usize = (MAX_PT_IRQ_ENTRIES + 63) / 64;

pub const INVALID_PTDEV_ENTRY_ID: u16 = u16::MAX;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntrType {
    IoApic,
    Msi,
}

/// One assigned interrupt source: which VM owns it, the source's identity
/// (BDF for MSI, GSI for an IOAPIC line), and the host vector it was bound
/// to while active.
#[derive(Debug, Clone, Copy)]
pub struct PtirqEntry {
    pub id: u16,
    pub vm_id: u16,
    pub intr_type: IntrType,
    pub phys_source: u32,
    pub allocated_vector: Option<u8>,
}

const EMPTY_ENTRY: PtirqEntry = PtirqEntry { id: INVALID_PTDEV_ENTRY_ID, vm_id: 0, intr_type: IntrType::IoApic, phys_source: 0, allocated_vector: None };

struct Slot {
    entry: PtirqEntry,
    active: AtomicBool,
}

/// The fixed pool backing `ptirq_alloc_entry`/`ptirq_release_entry`.
pub struct PtirqPool {
    bitmap: IrqSpinLock<[u64; BITMAP_WORDS]>,
    slots: IrqSpinLock<[PtirqEntry; MAX_PT_IRQ_ENTRIES]>,
    active: [AtomicBool; MAX_PT_IRQ_ENTRIES],
}

impl PtirqPool {
    pub const fn new() -> Self {
        Self {
            bitmap: IrqSpinLock::new([0; BITMAP_WORDS]),
            slots: IrqSpinLock::new([EMPTY_ENTRY; MAX_PT_IRQ_ENTRIES]),
            active: [const { AtomicBool::new(false) }; MAX_PT_IRQ_ENTRIES],
        }
    }

    /// `ptirq_alloc_entry(vm, intr_type)`: claims the lowest free slot via
    /// the same find-then-test-and-set race-break loop the pool's bitmap
    /// is grounded on, so two pCPUs racing the same scan never end up
    /// sharing a slot.
    pub fn alloc_entry(&self, vm_id: u16, intr_type: IntrType, phys_source: u32) -> Result<u16, HvError> {
        loop {
            let id = {
                let bitmap = self.bitmap.lock();
                ffz64_ex(&bitmap[..], MAX_PT_IRQ_ENTRIES as u16)
            };
            if id as usize >= MAX_PT_IRQ_ENTRIES {
                return Err(ResourceKind::PtirqPoolFull.into());
            }
            let already_taken = {
                let mut bitmap = self.bitmap.lock();
                let word = &mut bitmap[(id / 64) as usize];
                let mask = 1u64 << (id % 64);
                let prev = *word & mask;
                *word |= mask;
                prev != 0
            };
            if !already_taken {
                let mut slots = self.slots.lock();
                slots[id as usize] = PtirqEntry { id, vm_id, intr_type, phys_source, allocated_vector: None };
                self.active[id as usize].store(false, Ordering::SeqCst);
                return Ok(id);
            }
        }
    }

    /// `ptirq_release_entry(entry)`: clears the slot and frees its bitmap
    /// bit. The caller must have already deactivated the entry.
    pub fn release_entry(&self, id: u16) {
        {
            let mut slots = self.slots.lock();
            slots[id as usize] = EMPTY_ENTRY;
        }
        let mut bitmap = self.bitmap.lock();
        bitmap_clear_nolock(id & 0x3F, core::slice::from_mut(&mut bitmap[(id >> 6) as usize]));
    }

    /// `ptirq_activate_entry(entry, phys_irq, handler)`: registers the host
    /// ISR for this entry's phys_irq and marks it active.
    pub fn activate_entry(&self, id: u16, irq_table: &IrqTable, handler: IrqHandler) -> Result<(), HvError> {
        let vector = irq_table.request_irq(handler, id as u64)?;
        self.slots.lock()[id as usize].allocated_vector = Some(vector);
        self.active[id as usize].store(true, Ordering::SeqCst);
        Ok(())
    }

    pub fn deactivate_entry(&self, id: u16, irq_table: &IrqTable) {
        self.active[id as usize].store(false, Ordering::SeqCst);
        if let Some(vector) = self.slots.lock()[id as usize].allocated_vector.take() {
            irq_table.free_irq(vector);
        }
    }

    pub fn is_active(&self, id: u16) -> bool {
        self.active[id as usize].load(Ordering::SeqCst)
    }

    pub fn entry(&self, id: u16) -> PtirqEntry {
        self.slots.lock()[id as usize]
    }

    /// `ptdev_release_all_entries(vm)`: sweeps the pool at VM teardown,
    /// deactivating and releasing every entry owned by `vm_id`.
    pub fn release_all_entries(&self, vm_id: u16, irq_table: &IrqTable) {
        for id in 0..MAX_PT_IRQ_ENTRIES as u16 {
            let owned = self.slots.lock()[id as usize].vm_id == vm_id && self.slots.lock()[id as usize].id == id;
            if owned && self.is_active(id) {
                self.deactivate_entry(id, irq_table);
                self.release_entry(id);
            }
        }
    }
}

impl Default for PtirqPool {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop_handler(_vector: u8, _data: u64) {}

    #[test]
    fn alloc_entry_claims_distinct_ids() {
        let pool = PtirqPool::new();
        let a = pool.alloc_entry(0, IntrType::IoApic, 5).unwrap();
        let b = pool.alloc_entry(0, IntrType::Msi, 6).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn pool_exhaustion_is_reported() {
        let pool = PtirqPool::new();
        for i in 0..MAX_PT_IRQ_ENTRIES {
            pool.alloc_entry(0, IntrType::IoApic, i as u32).unwrap();
        }
        assert!(pool.alloc_entry(0, IntrType::IoApic, 99).is_err());
    }

    #[test]
    fn release_entry_makes_the_slot_reusable() {
        let pool = PtirqPool::new();
        let a = pool.alloc_entry(0, IntrType::IoApic, 5).unwrap();
        pool.release_entry(a);
        let b = pool.alloc_entry(0, IntrType::IoApic, 5).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn activate_then_deactivate_round_trips_the_vector() {
        let pool = PtirqPool::new();
        let irq_table = IrqTable::new();
        let id = pool.alloc_entry(0, IntrType::Msi, 0x1234).unwrap();
        pool.activate_entry(id, &irq_table, noop_handler).unwrap();
        assert!(pool.is_active(id));
        assert!(pool.entry(id).allocated_vector.is_some());

        pool.deactivate_entry(id, &irq_table);
        assert!(!pool.is_active(id));
        assert!(pool.entry(id).allocated_vector.is_none());
    }

    #[test]
    fn release_all_entries_only_touches_the_owning_vm() {
        let pool = PtirqPool::new();
        let irq_table = IrqTable::new();
        let vm0_entry = pool.alloc_entry(0, IntrType::Msi, 1).unwrap();
        let vm1_entry = pool.alloc_entry(1, IntrType::Msi, 2).unwrap();
        pool.activate_entry(vm0_entry, &irq_table, noop_handler).unwrap();
        pool.activate_entry(vm1_entry, &irq_table, noop_handler).unwrap();

        pool.release_all_entries(0, &irq_table);
        assert!(!pool.is_active(vm0_entry));
        assert!(pool.is_active(vm1_entry));
    }
}
