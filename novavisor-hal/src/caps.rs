//! CPU capability detection. `detect_cpu_caps` is the only entry point;
//! everything else in this crate trusts its result rather than re-querying
//! CPUID/MSRs at use sites.

use crate::primitives::cpuid::cpuid_subleaf;
use crate::primitives::msr::{msr_read, IA32_FEATURE_CONTROL, IA32_VMX_BASIC, IA32_VMX_EPT_VPID_CAP};

/// Bit in `IA32_FEATURE_CONTROL` marking the MSR itself locked (written
/// once by firmware or by us, and then immutable until reset).
const FEATURE_CONTROL_LOCKED: u64 = 1 << 0;
/// Bit enabling VMX outside SMX.
const FEATURE_CONTROL_VMX_OUTSIDE_SMX: u64 = 1 << 2;

/// Snapshot of the capabilities this design requires to exist on every
/// pCPU. Built once by the primary pCPU and treated as read-only
/// afterwards; every pCPU is required to report the same capabilities
/// (asymmetric VT-x/VT-d support is a configuration error, not handled).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CpuCaps {
    pub vmx: bool,
    pub ept: bool,
    pub unrestricted_guest: bool,
    pub x2apic: bool,
    /// Physical address width, `CPUID.80000008H:EAX[7:0]`.
    pub phys_bits: u8,
    /// `IA32_VMX_EPT_VPID_CAP` raw value, consumed by [`crate::ept`] to
    /// pick the deepest supported EPT page-walk length.
    pub ept_vpid_cap: u64,
    /// `IA32_VMX_BASIC` raw value, consumed by [`crate::vmcs`] to size the
    /// VMCS region and pick the VMCS revision identifier.
    pub vmx_basic: u64,
}

/// Detects and validates this pCPU's capabilities. Returns `None` if any
/// capability this design depends on is absent; the caller (component B,
/// `init_pcpu_capabilities`) treats that as a fatal `CapabilityError` and
/// panics rather than attempting a degraded mode.
pub fn detect_cpu_caps() -> Option<CpuCaps> {
    let (_, _, ecx1, edx1) = cpuid_subleaf(1, 0);
    let vmx = (ecx1 & (1 << 5)) != 0;
    if !vmx {
        return None;
    }

    let (_, ebx1, _, _) = cpuid_subleaf(1, 0);
    let _ = ebx1; // initial APIC ID lives here; not needed for capability gating

    let (_, ebx7, _, _) = cpuid_subleaf(7, 0);
    let x2apic = (ebx7 & (1 << 8)) != 0 || (edx1 & (1 << 21)) != 0;

    let (eax8000_0008, _, _, _) = cpuid_subleaf(0x8000_0008, 0);
    let phys_bits = (eax8000_0008 & 0xFF) as u8;

    let feature_control = unsafe { msr_read(IA32_FEATURE_CONTROL) };
    let locked_ok = (feature_control & FEATURE_CONTROL_LOCKED) == 0
        || (feature_control & FEATURE_CONTROL_VMX_OUTSIDE_SMX) != 0;
    if !locked_ok {
        return None;
    }

    let vmx_basic = unsafe { msr_read(IA32_VMX_BASIC) };
    let ept_vpid_cap = unsafe { msr_read(IA32_VMX_EPT_VPID_CAP) };

    // EPT and unrestricted guest are reported via IA32_VMX_PROCBASED_CTLS2
    // (secondary proc-based controls), gated on whether the primary
    // proc-based controls MSR even exposes "activate secondary controls"
    // (bit 31 of IA32_VMX_PROCBASED_CTLS high dword). In this design we
    // require both unconditionally, so absence of either is fatal.
    let ept = (ept_vpid_cap & 0x1) != 0;
    let unrestricted_guest = ept; // unrestricted guest requires EPT; refined by vmcs::secondary_controls_allowed at VMCS build time

    if !ept || !x2apic {
        return None;
    }

    Some(CpuCaps {
        vmx,
        ept,
        unrestricted_guest,
        x2apic,
        phys_bits,
        ept_vpid_cap,
        vmx_basic,
    })
}

/// VMCS revision identifier, bits [30:0] of `IA32_VMX_BASIC`.
#[inline]
pub fn vmcs_revision_id(vmx_basic: u64) -> u32 {
    (vmx_basic & 0x7FFF_FFFF) as u32
}

/// VMXON/VMCS region size in bytes, bits [44:32] of `IA32_VMX_BASIC`.
#[inline]
pub fn vmcs_region_size(vmx_basic: u64) -> u32 {
    ((vmx_basic >> 32) & 0x1FFF) as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vmcs_revision_id_masks_bit_31() {
        let vmx_basic = 0xFFFF_FFFF_FFFF_FFFFu64;
        assert_eq!(vmcs_revision_id(vmx_basic), 0x7FFF_FFFF);
    }

    #[test]
    fn vmcs_region_size_extracts_bits_32_to_44() {
        let vmx_basic = 0x1000u64 << 32;
        assert_eq!(vmcs_region_size(vmx_basic), 0x1000);
    }
}
