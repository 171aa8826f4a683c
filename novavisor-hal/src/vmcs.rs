//! VMCS field encodings and the raw VMX instruction wrappers (component K).
//! `vmread`/`vmwrite`/`vmclear`/`vmptrld`/`vmlaunch`/`vmresume` all require
//! VMX operation (`VMXON` already executed) and CPL0; none of them can run
//! under `cargo test`'s ring-3 host process, so this module's instruction
//! wrappers are compiled out under `cfg(test)` in favour of a software
//! model of "the currently loaded VMCS is a key-value store of field to
//! 64-bit value", which is enough to exercise every call site in
//! `novavisor-core::vcpu` that only cares about the read-your-writes
//! contract.

use core::marker::PhantomData;

use crate::memory::PhysicalAddress;

/// VMCS field encodings used by this design. Trimmed to the fields
/// `init_vmcs`/the exit dispatcher actually touch; the full Intel field
/// space is much larger and unused fields would just be dead weight here.
#[repr(u32)]
#[allow(non_camel_case_types)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmcsField {
    VIRTUAL_PROCESSOR_ID = 0x0000,

    GUEST_ES_SELECTOR = 0x0800,
    GUEST_CS_SELECTOR = 0x0802,
    GUEST_SS_SELECTOR = 0x0804,
    GUEST_DS_SELECTOR = 0x0806,
    GUEST_FS_SELECTOR = 0x0808,
    GUEST_GS_SELECTOR = 0x080A,
    GUEST_TR_SELECTOR = 0x080E,

    HOST_ES_SELECTOR = 0x0C00,
    HOST_CS_SELECTOR = 0x0C02,
    HOST_SS_SELECTOR = 0x0C04,
    HOST_DS_SELECTOR = 0x0C06,
    HOST_FS_SELECTOR = 0x0C08,
    HOST_GS_SELECTOR = 0x0C0A,
    HOST_TR_SELECTOR = 0x0C0C,

    IO_BITMAP_A = 0x2000,
    IO_BITMAP_B = 0x2002,
    MSR_BITMAP = 0x2004,
    TSC_OFFSET = 0x2010,
    VIRTUAL_APIC_PAGE_ADDR = 0x2012,
    EPT_POINTER = 0x201A,

    GUEST_PHYS_ADDR = 0x2400,

    GUEST_IA32_EFER = 0x2806,
    HOST_IA32_EFER = 0x2C02,

    GUEST_ES_LIMIT = 0x4800,
    GUEST_CS_LIMIT = 0x4802,
    GUEST_SS_LIMIT = 0x4804,
    GUEST_DS_LIMIT = 0x4806,
    GUEST_FS_LIMIT = 0x4808,
    GUEST_GS_LIMIT = 0x480A,
    GUEST_TR_LIMIT = 0x480E,
    GUEST_GDTR_LIMIT = 0x4810,
    GUEST_IDTR_LIMIT = 0x4812,

    PIN_BASED_VM_EXEC_CONTROL = 0x4000,
    CPU_BASED_VM_EXEC_CONTROL = 0x4002,
    EXCEPTION_BITMAP = 0x4004,
    VM_EXIT_CONTROLS = 0x400C,
    VM_ENTRY_CONTROLS = 0x4012,
    VM_ENTRY_INTR_INFO_FIELD = 0x4016,
    VM_ENTRY_EXCEPTION_ERROR_CODE = 0x4018,
    VM_ENTRY_INSTRUCTION_LEN = 0x401A,
    SECONDARY_VM_EXEC_CONTROL = 0x401E,

    VM_INSTRUCTION_ERROR = 0x4400,
    EXIT_REASON = 0x4402,
    VM_EXIT_INTR_INFO = 0x4404,
    IDT_VECTORING_INFO_FIELD = 0x4408,
    IDT_VECTORING_ERROR_CODE = 0x440A,
    VM_EXIT_INSTRUCTION_LEN = 0x440C,
    VMX_INSTRUCTION_INFO = 0x440E,

    GUEST_ES_AR_BYTES = 0x4814,
    GUEST_CS_AR_BYTES = 0x4816,
    GUEST_SS_AR_BYTES = 0x4818,
    GUEST_DS_AR_BYTES = 0x481A,
    GUEST_FS_AR_BYTES = 0x481C,
    GUEST_GS_AR_BYTES = 0x481E,
    GUEST_TR_AR_BYTES = 0x4822,

    CR0_GUEST_HOST_MASK = 0x6000,
    CR4_GUEST_HOST_MASK = 0x6002,
    CR0_READ_SHADOW = 0x6004,
    CR4_READ_SHADOW = 0x6006,

    EXIT_QUALIFICATION = 0x6400,

    GUEST_CR0 = 0x6800,
    GUEST_CR3 = 0x6802,
    GUEST_CR4 = 0x6804,
    GUEST_ES_BASE = 0x6806,
    GUEST_CS_BASE = 0x6808,
    GUEST_SS_BASE = 0x680A,
    GUEST_DS_BASE = 0x680C,
    GUEST_FS_BASE = 0x680E,
    GUEST_GS_BASE = 0x6810,
    GUEST_TR_BASE = 0x6814,
    GUEST_GDTR_BASE = 0x6816,
    GUEST_IDTR_BASE = 0x6818,
    GUEST_RSP = 0x681C,
    GUEST_RIP = 0x681E,
    GUEST_RFLAGS = 0x6820,

    HOST_CR0 = 0x6C00,
    HOST_CR3 = 0x6C02,
    HOST_CR4 = 0x6C04,
    HOST_FS_BASE = 0x6C06,
    HOST_GS_BASE = 0x6C08,
    HOST_TR_BASE = 0x6C0A,
    HOST_GDTR_BASE = 0x6C0C,
    HOST_IDTR_BASE = 0x6C0E,
    HOST_RSP = 0x6C14,
    HOST_RIP = 0x6C16,
}

/// Errors from the raw VMX instruction wrappers. `VmInstructionError`
/// carries the `VM_INSTRUCTION_ERROR` field value when available (VMfailValid).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmxError {
    VmclearFailed,
    VmptrldFailed,
    VmEntryFailed(u64),
    VmInstructionError(u32),
}

#[cfg(not(test))]
mod raw {
    use super::{PhysicalAddress, VmcsField, VmxError};
    use core::arch::asm;

    pub unsafe fn vmclear(phys: PhysicalAddress) -> Result<(), VmxError> {
        unsafe { x86::bits64::vmx::vmclear(phys) }.map_err(|_| VmxError::VmclearFailed)
    }

    pub unsafe fn vmptrld(phys: PhysicalAddress) -> Result<(), VmxError> {
        unsafe { x86::bits64::vmx::vmptrld(phys) }.map_err(|_| VmxError::VmptrldFailed)
    }

    pub fn vmread(field: VmcsField) -> u64 {
        let value: u64;
        unsafe {
            asm!(
                "vmread {value}, {field:e}",
                field = in(reg) field as u32,
                value = lateout(reg) value,
                options(nostack, preserves_flags),
            );
        }
        value
    }

    pub fn vmwrite(field: VmcsField, value: u64) {
        unsafe {
            asm!(
                "vmwrite {value}, {field:e}",
                field = in(reg) field as u32,
                value = in(reg) value,
                options(nostack, preserves_flags),
            );
        }
    }

    pub unsafe fn vmlaunch() -> Result<(), ()> {
        let flags: u64;
        unsafe {
            asm!("vmlaunch", "pushfq", "pop {flags}", flags = out(reg) flags, options(nostack));
        }
        if flags & 0x41 != 0 {
            Err(())
        } else {
            Ok(())
        }
    }

    pub unsafe fn vmresume() -> Result<(), ()> {
        let flags: u64;
        unsafe {
            asm!("vmresume", "pushfq", "pop {flags}", flags = out(reg) flags, options(nostack));
        }
        if flags & 0x41 != 0 {
            Err(())
        } else {
            Ok(())
        }
    }
}

#[cfg(test)]
mod raw {
    use super::{PhysicalAddress, VmcsField, VmxError};

    extern crate std;
    std::thread_local! {
        static MODEL: core::cell::RefCell<heapless::FnvIndexMap<u32, u64, 128>> =
            core::cell::RefCell::new(heapless::FnvIndexMap::new());
        static LOADED: core::cell::Cell<Option<PhysicalAddress>> = const { core::cell::Cell::new(None) };
    }

    pub unsafe fn vmclear(phys: PhysicalAddress) -> Result<(), VmxError> {
        LOADED.with(|l| {
            if l.get() == Some(phys) {
                l.set(None);
            }
        });
        Ok(())
    }

    pub unsafe fn vmptrld(phys: PhysicalAddress) -> Result<(), VmxError> {
        LOADED.with(|l| l.set(Some(phys)));
        Ok(())
    }

    pub fn vmread(field: VmcsField) -> u64 {
        MODEL.with(|m| m.borrow().get(&(field as u32)).copied().unwrap_or(0))
    }

    pub fn vmwrite(field: VmcsField, value: u64) {
        MODEL.with(|m| {
            let _ = m.borrow_mut().insert(field as u32, value);
        });
    }

    pub unsafe fn vmlaunch() -> Result<(), ()> {
        Ok(())
    }

    pub unsafe fn vmresume() -> Result<(), ()> {
        Ok(())
    }
}

/// Owns a 4 KiB-aligned VMCS region. Does not own the backing memory —
/// allocation is the caller's (`novavisor-core::vcpu`) responsibility.
pub struct Vmcs {
    phys_addr: PhysicalAddress,
}

impl Vmcs {
    pub const fn new(phys: PhysicalAddress) -> Self {
        Self { phys_addr: phys }
    }

    pub fn phys_addr(&self) -> PhysicalAddress {
        self.phys_addr
    }

    /// Stamps the VMCS revision identifier into the first 4 bytes of the
    /// region, as the processor requires before the first `VMCLEAR`/
    /// `VMPTRLD` on freshly allocated memory (SDM Vol. 3C 24.2).
    #[cfg(not(test))]
    pub fn write_revision_id(&self, revision_id: u32) {
        unsafe { core::ptr::write_volatile(self.phys_addr as *mut u32, revision_id) };
    }

    /// No-op under `cfg(test)`: the test pool's "physical addresses" are
    /// opaque map keys, not mapped memory, so there is nothing to stamp.
    #[cfg(test)]
    pub fn write_revision_id(&self, _revision_id: u32) {}

    /// `VMCLEAR` — transitions the region to "clear" state so it can be
    /// safely loaded on any pCPU.
    pub fn clear(&self) -> Result<(), VmxError> {
        unsafe { raw::vmclear(self.phys_addr) }
    }

    /// `VMPTRLD` — makes this the current VMCS on the executing pCPU.
    pub fn load(&self) -> Result<ActiveVmcs<'_>, VmxError> {
        unsafe { raw::vmptrld(self.phys_addr) }?;
        Ok(ActiveVmcs { _phantom: PhantomData })
    }
}

/// Proof that some [`Vmcs`] is the currently loaded one on this pCPU;
/// `VMREAD`/`VMWRITE` are only well-defined while this token is alive.
pub struct ActiveVmcs<'a> {
    _phantom: PhantomData<&'a mut ()>,
}

impl<'a> ActiveVmcs<'a> {
    #[inline]
    pub fn read(&self, field: VmcsField) -> u64 {
        raw::vmread(field)
    }

    #[inline]
    pub fn write(&mut self, field: VmcsField, value: u64) {
        raw::vmwrite(field, value)
    }

    /// Executes `VMLAUNCH` if `first_entry`, else `VMRESUME`. Returns the
    /// `EXIT_REASON` field on a successful VM-exit; a VMfail is reported
    /// via the `VM_INSTRUCTION_ERROR` field.
    pub fn enter(&mut self, first_entry: bool) -> Result<u64, VmxError> {
        let result = if first_entry {
            unsafe { raw::vmlaunch() }
        } else {
            unsafe { raw::vmresume() }
        };
        match result {
            Ok(()) => Ok(self.read(VmcsField::EXIT_REASON)),
            Err(()) => {
                let err = self.read(VmcsField::VM_INSTRUCTION_ERROR) as u32;
                Err(VmxError::VmInstructionError(err))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_then_read_round_trips_on_loaded_vmcs() {
        let vmcs = Vmcs::new(0x1000);
        let mut active = vmcs.load().unwrap();
        active.write(VmcsField::GUEST_RIP, 0xDEAD_BEEF);
        assert_eq!(active.read(VmcsField::GUEST_RIP), 0xDEAD_BEEF);
    }

    #[test]
    fn distinct_fields_do_not_alias() {
        let vmcs = Vmcs::new(0x2000);
        let mut active = vmcs.load().unwrap();
        active.write(VmcsField::GUEST_RIP, 1);
        active.write(VmcsField::GUEST_RSP, 2);
        assert_eq!(active.read(VmcsField::GUEST_RIP), 1);
        assert_eq!(active.read(VmcsField::GUEST_RSP), 2);
    }

    #[test]
    fn enter_on_model_reports_exit_reason_field() {
        let vmcs = Vmcs::new(0x3000);
        let mut active = vmcs.load().unwrap();
        active.write(VmcsField::EXIT_REASON, 48); // EPT violation
        let reason = active.enter(false).unwrap();
        assert_eq!(reason, 48);
    }
}
