//! Error taxonomy (§7). Every fallible operation in this crate returns
//! one of these variants; there is deliberately no `Recoverable` case in
//! the core — an exit handler either completes or the pCPU panics, there
//! is no "retry later" path for host-level I/O.

/// The five failure classes this design recognizes, each with a fixed
/// propagation policy (see each variant's doc comment).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HvError {
    /// Invalid static VM table: overlapping HPA ranges, overlapping pCPU
    /// affinity masks, a missing kernel/bootargs module tag. Detected at
    /// boot; the caller panics.
    Config(ConfigError),
    /// A required CPU feature is absent (VMX, EPT, x2APIC, unrestricted
    /// guest). Detected by `detect_cpu_caps`; the caller panics.
    Capability,
    /// A fixed-size pool is full or an index space is exhausted: the
    /// ptirq pool, a host IRQ vector, an IRTE index collision. Reported
    /// locally to the caller, which degrades the guest-visible operation
    /// rather than panicking the host.
    ResourceExhausted(ResourceKind),
    /// A guest-induced fault: bad guest pointer causing a data EPT
    /// violation, an illegal MSR access. The caller injects the
    /// architecturally-correct exception into the vCPU; this never
    /// reaches the host.
    GuestFault(GuestFaultKind),
    /// A hypervisor-internal inconsistency: EPT misconfiguration, a
    /// VM-entry failure with `VMX_VMENTRY_FAIL` set, a corrupted control
    /// structure. Fatal: dump the offending pCPU's interrupt/exception
    /// context and halt it.
    Bug(&'static str),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigError {
    OverlappingMemoryRegion,
    OverlappingPcpuAffinity,
    MissingBootModule,
    VmIdOutOfRange,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceKind {
    PtirqPoolFull,
    IrqVectorExhausted,
    IrteIndexCollision,
    EptTablePoolExhausted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuestFaultKind {
    EptViolation,
    IllegalMsr,
    GeneralProtection,
}

impl From<ConfigError> for HvError {
    fn from(e: ConfigError) -> Self {
        HvError::Config(e)
    }
}

impl From<ResourceKind> for HvError {
    fn from(e: ResourceKind) -> Self {
        HvError::ResourceExhausted(e)
    }
}

impl From<GuestFaultKind> for HvError {
    fn from(e: GuestFaultKind) -> Self {
        HvError::GuestFault(e)
    }
}

/// Whether an [`HvError`] is fatal to the host pCPU (panic) or local to
/// the operation that raised it (return a failure up the call chain).
pub fn is_fatal(err: &HvError) -> bool {
    matches!(err, HvError::Config(_) | HvError::Capability | HvError::Bug(_))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_and_capability_and_bug_are_fatal() {
        assert!(is_fatal(&HvError::Config(ConfigError::VmIdOutOfRange)));
        assert!(is_fatal(&HvError::Capability));
        assert!(is_fatal(&HvError::Bug("ept misconfiguration")));
    }

    #[test]
    fn resource_exhausted_and_guest_fault_are_not_fatal() {
        assert!(!is_fatal(&HvError::ResourceExhausted(ResourceKind::PtirqPoolFull)));
        assert!(!is_fatal(&HvError::GuestFault(GuestFaultKind::EptViolation)));
    }
}
