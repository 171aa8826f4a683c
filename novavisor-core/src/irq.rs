//! Host interrupt dispatch (component E): a fixed vector-to-handler table,
//! plus the fixed notification vector a pCPU uses to kick a remote pCPU out
//! of non-root mode and to run a deferred cross-pCPU call on it.

use novavisor_hal::lapic::send_ipi;
use novavisor_hal::pcpu::MAX_PCPU_NUM;
use novavisor_hal::primitives::bitops::bitmap_test_and_set_lock;
use novavisor_hal::primitives::spinlock::IrqSpinLock;

use core::sync::atomic::{AtomicU64, Ordering};

use crate::error::{HvError, ResourceKind};

/// One past the highest usable vector; matches the SDM's 256-entry IDT.
pub const NR_MAX_VECTOR: u8 = 0xFF;
/// Vectors below this are CPU exceptions (`#DE`..`#VE`) and never handed
/// out by `request_irq`.
const FIRST_ALLOCATABLE_VECTOR: u16 = 0x20;

/// Kicks a remote pCPU out of non-root mode; doubles as the delivery
/// vector for deferred cross-pCPU calls (`smp_call_function`).
pub const NOTIFY_VECTOR: u8 = 0xF3;
/// Posted-interrupt notification vector. Its ISR is a no-op: the posted
/// interrupt itself is consumed by hardware at the next VM-entry, this
/// vector exists only so the host APIC never logs it as spurious.
pub const POSTED_INTR_NOTIFY_VECTOR: u8 = 0xF4;

pub type IrqHandler = fn(vector: u8, data: u64);

#[derive(Clone, Copy)]
struct IrqAction {
    handler: IrqHandler,
    data: u64,
}

const VECTOR_SLOTS: usize = NR_MAX_VECTOR as usize + 1;

/// `request_irq`/`free_irq`'s backing store: one slot per IDT vector.
pub struct IrqTable {
    actions: IrqSpinLock<[Option<IrqAction>; VECTOR_SLOTS]>,
}

impl IrqTable {
    pub const fn new() -> Self {
        Self { actions: IrqSpinLock::new([None; VECTOR_SLOTS]) }
    }

    /// `request_irq(handler, data)`: claims the first free vector at or
    /// above [`FIRST_ALLOCATABLE_VECTOR`], below the fixed notification
    /// vectors.
    pub fn request_irq(&self, handler: IrqHandler, data: u64) -> Result<u8, HvError> {
        let mut table = self.actions.lock();
        for vector in FIRST_ALLOCATABLE_VECTOR..NOTIFY_VECTOR as u16 {
            if table[vector as usize].is_none() {
                table[vector as usize] = Some(IrqAction { handler, data });
                return Ok(vector as u8);
            }
        }
        Err(ResourceKind::IrqVectorExhausted.into())
    }

    /// `request_fixed_irq(vector, handler, data)`: installs a handler on a
    /// specific vector (used for [`NOTIFY_VECTOR`] and
    /// [`POSTED_INTR_NOTIFY_VECTOR`], each registered once at boot).
    pub fn request_fixed_irq(&self, vector: u8, handler: IrqHandler, data: u64) -> Result<(), HvError> {
        let mut table = self.actions.lock();
        if table[vector as usize].is_some() {
            return Err(HvError::Bug("fixed irq vector already registered"));
        }
        table[vector as usize] = Some(IrqAction { handler, data });
        Ok(())
    }

    pub fn free_irq(&self, vector: u8) {
        self.actions.lock()[vector as usize] = None;
    }

    /// `dispatch_interrupt(vector)`: runs the registered handler, if any.
    /// An unregistered vector firing is a spurious interrupt and is
    /// silently dropped, matching hardware's own spurious-vector handling.
    pub fn dispatch(&self, vector: u8) {
        let action = self.actions.lock()[vector as usize];
        if let Some(action) = action {
            (action.handler)(vector, action.data);
        }
    }
}

impl Default for IrqTable {
    fn default() -> Self {
        Self::new()
    }
}

/// One pending cross-pCPU call: the function to run and an opaque data
/// word, consumed exactly once by the target pCPU's notification handler.
#[derive(Clone, Copy, Default)]
struct SmpCallSlot {
    func: Option<fn(u64)>,
    data: u64,
}

/// The notification hub backing `smp_call_function`: a 64-bit "call
/// pending" mask (one bit per pCPU, [`MAX_PCPU_NUM`] fits exactly in one
/// word) plus a slot per pCPU for the deferred closure.
pub struct NotificationHub {
    pending: AtomicU64,
    slots: IrqSpinLock<[SmpCallSlot; MAX_PCPU_NUM as usize]>,
}

static_assertions::const_assert!(MAX_PCPU_NUM <= 64);

impl NotificationHub {
    pub const fn new() -> Self {
        Self {
            pending: AtomicU64::new(0),
            slots: IrqSpinLock::new([SmpCallSlot { func: None, data: 0 }; MAX_PCPU_NUM as usize]),
        }
    }

    /// `smp_call_function(target_pcpu, target_apic_id, func, data)`:
    /// records the call and sends [`NOTIFY_VECTOR`] to the target. The
    /// target's own `kick_notification` handler — wired through
    /// [`IrqTable::request_fixed_irq`] — runs `func(data)` and clears the
    /// pending bit.
    pub fn smp_call_function(&self, target_pcpu: u16, target_apic_id: u32, func: fn(u64), data: u64) {
        {
            let mut slots = self.slots.lock();
            slots[target_pcpu as usize] = SmpCallSlot { func: Some(func), data };
        }
        bitmap_test_and_set_lock(target_pcpu as u8, &self.pending);
        send_ipi(target_apic_id, NOTIFY_VECTOR);
    }

    /// `kick_notification`: the [`NOTIFY_VECTOR`] ISR body. Runs on the
    /// target pCPU; `local_pcpu_id` identifies which slot belongs to it.
    pub fn kick_notification(&self, local_pcpu_id: u16) {
        let mask = 1u64 << local_pcpu_id;
        if self.pending.fetch_and(!mask, Ordering::AcqRel) & mask != 0 {
            let slot = self.slots.lock()[local_pcpu_id as usize];
            if let Some(func) = slot.func {
                func(slot.data);
            }
        }
    }
}

impl Default for NotificationHub {
    fn default() -> Self {
        Self::new()
    }
}

/// `posted_intr_notification`: the dummy ISR registered on
/// [`POSTED_INTR_NOTIFY_VECTOR`]. Intentionally does nothing — see the
/// vector's own doc comment.
pub fn posted_intr_notification(_vector: u8, _data: u64) {}

#[cfg(test)]
mod tests {
    use super::*;
    use core::sync::atomic::AtomicU32;

    static CALLS: AtomicU32 = AtomicU32::new(0);

    fn counting_handler(_vector: u8, _data: u64) {
        CALLS.fetch_add(1, Ordering::SeqCst);
    }

    #[test]
    fn request_irq_allocates_distinct_vectors() {
        let table = IrqTable::new();
        let v1 = table.request_irq(counting_handler, 0).unwrap();
        let v2 = table.request_irq(counting_handler, 0).unwrap();
        assert_ne!(v1, v2);
        assert!(v1 >= FIRST_ALLOCATABLE_VECTOR as u8);
    }

    #[test]
    fn dispatch_runs_the_registered_handler() {
        CALLS.store(0, Ordering::SeqCst);
        let table = IrqTable::new();
        let v = table.request_irq(counting_handler, 0).unwrap();
        table.dispatch(v);
        assert_eq!(CALLS.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn dispatch_on_unregistered_vector_is_a_no_op() {
        let table = IrqTable::new();
        table.dispatch(0x30);
    }

    #[test]
    fn free_irq_makes_the_vector_reusable() {
        let table = IrqTable::new();
        let v = table.request_irq(counting_handler, 0).unwrap();
        table.free_irq(v);
        let v2 = table.request_irq(counting_handler, 0).unwrap();
        assert_eq!(v, v2);
    }

    #[test]
    fn request_fixed_irq_rejects_double_registration() {
        let table = IrqTable::new();
        table.request_fixed_irq(NOTIFY_VECTOR, counting_handler, 0).unwrap();
        assert!(table.request_fixed_irq(NOTIFY_VECTOR, counting_handler, 0).is_err());
    }

    static SMP_CALL_SEEN: AtomicU64 = AtomicU64::new(0);

    fn record_smp_call(data: u64) {
        SMP_CALL_SEEN.store(data, Ordering::SeqCst);
    }

    #[test]
    fn smp_call_then_kick_runs_the_closure_exactly_once() {
        SMP_CALL_SEEN.store(0, Ordering::SeqCst);
        let hub = NotificationHub::new();
        hub.smp_call_function(2, 2, record_smp_call, 0xBEEF);
        hub.kick_notification(2);
        assert_eq!(SMP_CALL_SEEN.load(Ordering::SeqCst), 0xBEEF);

        // A second kick with nothing pending must not re-run the closure.
        SMP_CALL_SEEN.store(0, Ordering::SeqCst);
        hub.kick_notification(2);
        assert_eq!(SMP_CALL_SEEN.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn kick_notification_on_a_different_pcpu_does_not_consume_the_call() {
        SMP_CALL_SEEN.store(0, Ordering::SeqCst);
        let hub = NotificationHub::new();
        hub.smp_call_function(1, 1, record_smp_call, 7);
        hub.kick_notification(0);
        assert_eq!(SMP_CALL_SEEN.load(Ordering::SeqCst), 0);
        hub.kick_notification(1);
        assert_eq!(SMP_CALL_SEEN.load(Ordering::SeqCst), 7);
    }
}
