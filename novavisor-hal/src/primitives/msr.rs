//! Model-specific register access.
//!
//! `msr_write_pcpu` is the one cross-pCPU primitive in this module: on real
//! hardware an MSR write only ever affects the executing core, so reaching
//! a *different* pCPU's MSR requires a remote call. The dispatch shim lives
//! in `novavisor-core::irq` (component E); this module only declares the
//! synchronous contract the shim fulfils.

/// Reads a 64-bit MSR by index.
///
/// # Safety
/// The caller must ensure `idx` names an MSR that is architecturally
/// readable in the current privilege mode; reading an unimplemented or
/// privileged-unavailable MSR raises `#GP`.
///
/// `rdmsr` is CPL0-only; a `cargo test` binary runs this crate in ring 3,
/// so the real instruction is swapped for a small in-memory MSR model under
/// `cfg(test)` rather than exercised directly.
#[cfg(not(test))]
#[inline(always)]
pub unsafe fn msr_read(idx: u32) -> u64 {
    let (hi, lo): (u32, u32);
    unsafe {
        core::arch::asm!(
            "rdmsr",
            in("ecx") idx,
            out("eax") lo,
            out("edx") hi,
            options(nomem, nostack, preserves_flags),
        );
    }
    ((hi as u64) << 32) | (lo as u64)
}

/// Writes a 64-bit value to an MSR on the executing pCPU.
///
/// # Safety
/// Same constraints as [`msr_read`]; additionally, writing the wrong value
/// to a control MSR (e.g. `IA32_EFER`, `IA32_VMX_*`) can take down the
/// machine.
#[cfg(not(test))]
#[inline(always)]
pub unsafe fn msr_write(idx: u32, val: u64) {
    let lo = val as u32;
    let hi = (val >> 32) as u32;
    unsafe {
        core::arch::asm!(
            "wrmsr",
            in("ecx") idx,
            in("eax") lo,
            in("edx") hi,
            options(nomem, nostack, preserves_flags),
        );
    }
}

/// Test-only model of the MSR file, one per test thread (the default test
/// harness runs each `#[test]` on its own thread, so a single shared table
/// would let unrelated tests observe each other's writes). Stands in for
/// `rdmsr`/`wrmsr` so the dispatch logic around them (`msr_write_pcpu`) can
/// be exercised without CPL0 instructions.
#[cfg(test)]
extern crate std;

#[cfg(test)]
std::thread_local! {
    static TEST_MSR_MODEL: core::cell::RefCell<heapless::FnvIndexMap<u32, u64, 64>> =
        core::cell::RefCell::new(heapless::FnvIndexMap::new());
}

/// # Safety
/// No real hardware access; safe in spirit, kept `unsafe` to match the
/// real function's signature for call-site compatibility.
#[cfg(test)]
pub unsafe fn msr_read(idx: u32) -> u64 {
    TEST_MSR_MODEL.with(|t| t.borrow().get(&idx).copied().unwrap_or(0))
}

/// # Safety
/// No real hardware access; safe in spirit, kept `unsafe` to match the
/// real function's signature for call-site compatibility.
#[cfg(test)]
pub unsafe fn msr_write(idx: u32, val: u64) {
    TEST_MSR_MODEL.with(|t| {
        let _ = t.borrow_mut().insert(idx, val);
    });
}

/// Writes an MSR on a *different* pCPU, synchronously.
///
/// Implemented by routing through the IPI-backed SMP-call mechanism
/// (component E): the caller blocks until the target pCPU has performed the
/// write and acknowledged it. Calling this for the executing pCPU's own id
/// degrades to a plain local [`msr_write`].
pub fn msr_write_pcpu(idx: u32, val: u64, pcpu_id: u32, local_id: u32, remote_call: impl FnOnce(u32) -> ()) {
    if pcpu_id == local_id {
        unsafe { msr_write(idx, val) };
    } else {
        remote_call(pcpu_id);
    }
}

/// IA32_APIC_BASE.
pub const IA32_APIC_BASE: u32 = 0x0000_001B;
/// IA32_FEATURE_CONTROL (VMX lock/enable bits).
pub const IA32_FEATURE_CONTROL: u32 = 0x0000_003A;
/// IA32_VMX_BASIC.
pub const IA32_VMX_BASIC: u32 = 0x0000_0480;
/// IA32_VMX_EPT_VPID_CAP.
pub const IA32_VMX_EPT_VPID_CAP: u32 = 0x0000_048C;
/// IA32_VMX_PROCBASED_CTLS2.
pub const IA32_VMX_PROCBASED_CTLS2: u32 = 0x0000_048B;
/// IA32_EFER.
pub const IA32_EFER: u32 = 0xC000_0080;

bitflags::bitflags! {
    /// Relevant bits of `IA32_APIC_BASE`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ApicBaseFlags: u64 {
        /// x2APIC enable (bit 10).
        const X2APIC_ENABLE = 1 << 10;
        /// xAPIC global enable (bit 11).
        const XAPIC_ENABLE  = 1 << 11;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn remote_call_only_invoked_for_other_pcpu() {
        let mut called = false;
        msr_write_pcpu(IA32_APIC_BASE, 0, 1, 1, |_| called = true);
        assert!(!called, "writing the local pCPU must not go through the remote shim");
    }

    #[test]
    fn remote_call_invoked_for_other_pcpu() {
        let mut target = None;
        msr_write_pcpu(IA32_APIC_BASE, 0, 3, 1, |id| target = Some(id));
        assert_eq!(target, Some(3));
    }

    #[test]
    fn local_write_is_visible_to_local_read() {
        msr_write_pcpu(IA32_VMX_BASIC, 0x1234_5678, 2, 2, |_| {
            panic!("same-pCPU write must not dispatch remotely")
        });
        assert_eq!(unsafe { msr_read(IA32_VMX_BASIC) }, 0x1234_5678);
    }
}
