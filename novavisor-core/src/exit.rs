//! VM-exit dispatch (component L). One function per basic exit reason,
//! wired together by [`dispatch`]; the caller (component N's run loop)
//! owns the policy object each handler needs (the VM's [`crate::ept::VmEpt`],
//! its [`crate::config::PtDevConfig`] table, …) and passes it down rather
//! than this module reaching for global state.

use novavisor_hal::vmcs::VmcsField;

use crate::error::{GuestFaultKind, HvError};
use crate::vcpu::{GpReg, Vcpu};

/// Basic VM-exit reasons this design handles, in the encoding the SDM
/// assigns each (Appendix C, "Basic Exit Reasons"). Anything else either
/// cannot occur given this design's fixed VM-execution controls or is
/// intentionally left unhandled and reported as [`HvError::Bug`].
pub mod reasons {
    pub const EXCEPTION_OR_NMI: u16 = 0;
    pub const EXTERNAL_INTERRUPT: u16 = 1;
    pub const TRIPLE_FAULT: u16 = 2;
    pub const INTERRUPT_WINDOW: u16 = 7;
    pub const CPUID: u16 = 10;
    pub const HLT: u16 = 12;
    pub const CR_ACCESS: u16 = 28;
    pub const IO_INSTRUCTION: u16 = 30;
    pub const RDMSR: u16 = 31;
    pub const WRMSR: u16 = 32;
    pub const EPT_VIOLATION: u16 = 48;
    pub const EPT_MISCONFIGURATION: u16 = 49;
}

/// `EXIT_REASON`'s basic-reason field (bits [15:0]).
pub fn basic_reason(raw_exit_reason: u64) -> u16 {
    (raw_exit_reason & 0xFFFF) as u16
}

/// `EXIT_REASON` bit 31: set when the exit represents a failed VM-entry
/// rather than a normal VM-exit (e.g. an invalid guest-state field).
pub fn is_entry_failure(raw_exit_reason: u64) -> bool {
    (raw_exit_reason & (1 << 31)) != 0
}

/// What the run loop should do after a handler returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitDisposition {
    /// Re-enter the guest normally.
    Resume,
    /// A fatal condition was detected on this vCPU; tear its VM down via
    /// `triple_fault_shutdown_vm` (component N).
    Shutdown,
}

/// Decoded `IO_INSTRUCTION` exit qualification (SDM Table 27-5).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IoQualification {
    pub port: u16,
    pub size: novavisor_hal::pio::PioWidth,
    pub is_in: bool,
    pub string: bool,
    pub rep: bool,
}

pub fn decode_io_qualification(qual: u64) -> Option<IoQualification> {
    let size = novavisor_hal::pio::PioWidth::from_exit_qual_size((qual & 0x7) as u8)?;
    Some(IoQualification {
        port: ((qual >> 16) & 0xFFFF) as u16,
        size,
        is_in: (qual >> 3) & 1 != 0,
        string: (qual >> 4) & 1 != 0,
        rep: (qual >> 5) & 1 != 0,
    })
}

/// Decoded `CR_ACCESS` exit qualification (SDM Table 27-3), restricted to
/// the "MOV to/from CR" access types this design ever needs to emulate —
/// CLTS/LMSW never fire because the exception bitmap and CR-read-shadow
/// this design programs never traps them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CrAccessQualification {
    pub cr_number: u8,
    pub is_write: bool,
    pub gpr: GpReg,
}

const GPR_ORDER: [GpReg; 16] = [
    GpReg::Rax,
    GpReg::Rcx,
    GpReg::Rdx,
    GpReg::Rbx,
    GpReg::Rsp,
    GpReg::Rbp,
    GpReg::Rsi,
    GpReg::Rdi,
    GpReg::R8,
    GpReg::R9,
    GpReg::R10,
    GpReg::R11,
    GpReg::R12,
    GpReg::R13,
    GpReg::R14,
    GpReg::R15,
];

pub fn decode_cr_access_qualification(qual: u64) -> CrAccessQualification {
    let access_type = (qual >> 4) & 0x3;
    let gpr_idx = ((qual >> 8) & 0xF) as usize;
    CrAccessQualification { cr_number: (qual & 0xF) as u8, is_write: access_type == 0, gpr: GPR_ORDER[gpr_idx] }
}

/// `vcpu_inject_gp` for an illegal MSR index, the SDM-mandated behaviour
/// for RDMSR/WRMSR on an unimplemented MSR that this design does not
/// emulate.
fn inject_illegal_msr(vcpu: &mut Vcpu) {
    vcpu.inject_gp();
}

/// `CPUID` handler: runs the host instruction (CPUID is never trapped for
/// correctness reasons, only to let this design mask capability bits the
/// guest must not see) and writes the result into the guest's GPRs.
pub fn handle_cpuid(vcpu: &mut Vcpu, mask_leaf: impl Fn(u32, u32, u32, u32, u32) -> (u32, u32, u32, u32)) {
    let leaf = vcpu.vcpu_get_gpreg(GpReg::Rax) as u32;
    let subleaf = vcpu.vcpu_get_gpreg(GpReg::Rcx) as u32;
    let (raw_eax, raw_ebx, raw_ecx, raw_edx) = novavisor_hal::primitives::cpuid_subleaf(leaf, subleaf);
    let (eax, ebx, ecx, edx) = mask_leaf(leaf, raw_eax, raw_ebx, raw_ecx, raw_edx);
    vcpu.vcpu_set_gpreg(GpReg::Rax, eax as u64);
    vcpu.vcpu_set_gpreg(GpReg::Rbx, ebx as u64);
    vcpu.vcpu_set_gpreg(GpReg::Rcx, ecx as u64);
    vcpu.vcpu_set_gpreg(GpReg::Rdx, edx as u64);
}

/// `IO_INSTRUCTION` handler: `port_read`/`port_write` model the VM's
/// pass-through or emulated port devices — a pass-through VM with no
/// virtual PIC/PIT/UART only ever sees ports belonging to its assigned
/// PCI functions, which this design does not intercept at all (only
/// non-passed-through ports reach this handler). String and REP-prefixed
/// accesses are not modeled by a partitioning design with no virtual
/// device backing them and are rejected with `#GP`, matching real
/// hardware's behavior for an unsupported instruction form at this trap.
pub fn handle_io_instruction(
    vcpu: &mut Vcpu,
    qual: IoQualification,
    port_read: impl FnOnce(u16, novavisor_hal::pio::PioWidth) -> u32,
    port_write: impl FnOnce(u16, novavisor_hal::pio::PioWidth, u32),
) {
    if qual.string || qual.rep {
        vcpu.inject_gp();
        return;
    }
    if qual.is_in {
        let value = port_read(qual.port, qual.size);
        let mask = qual.size.mask();
        let rax = vcpu.vcpu_get_gpreg(GpReg::Rax);
        vcpu.vcpu_set_gpreg(GpReg::Rax, (rax & !mask) | (value as u64 & mask));
    } else {
        let rax = vcpu.vcpu_get_gpreg(GpReg::Rax) as u32;
        port_write(qual.port, qual.size, rax & qual.size.mask() as u32);
    }
}

/// `RDMSR`/`WRMSR` handlers: `read`/`write` implement this VM's emulated
/// MSR set; any MSR they refuse (by returning `Err`) is architecturally
/// illegal for the guest to touch and is reported as `#GP`.
pub fn handle_rdmsr(vcpu: &mut Vcpu, read: impl FnOnce(u32) -> Result<u64, ()>) {
    let idx = vcpu.vcpu_get_gpreg(GpReg::Rcx) as u32;
    match read(idx) {
        Ok(value) => {
            vcpu.vcpu_set_gpreg(GpReg::Rax, value & 0xFFFF_FFFF);
            vcpu.vcpu_set_gpreg(GpReg::Rdx, value >> 32);
        }
        Err(()) => inject_illegal_msr(vcpu),
    }
}

pub fn handle_wrmsr(vcpu: &mut Vcpu, write: impl FnOnce(u32, u64) -> Result<(), ()>) {
    let idx = vcpu.vcpu_get_gpreg(GpReg::Rcx) as u32;
    let value = (vcpu.vcpu_get_gpreg(GpReg::Rax) & 0xFFFF_FFFF) | (vcpu.vcpu_get_gpreg(GpReg::Rdx) << 32);
    if write(idx, value).is_err() {
        inject_illegal_msr(vcpu);
    }
}

/// `EPT_VIOLATION`/`EPT_MISCONFIGURATION` handler. A misconfiguration is
/// always this design's own bug (reserved bits set, or a leaf pointing
/// past the physical-address width) — unlike a violation, there is no
/// guest-correctable story for it.
pub fn handle_ept_exit(
    reason: u16,
    vcpu: &mut Vcpu,
    on_violation: impl FnOnce(u64, bool) -> Result<crate::ept::EptViolationAction, HvError>,
) -> Result<ExitDisposition, HvError> {
    if reason == reasons::EPT_MISCONFIGURATION {
        return Err(HvError::Bug("EPT misconfiguration"));
    }
    let (gpa, is_fetch) = vcpu
        .with_active_vmcs(|active| {
            let qual = active.read(VmcsField::EXIT_QUALIFICATION);
            let gpa = active.read(VmcsField::GUEST_PHYS_ADDR);
            (gpa, (qual >> 2) & 1 != 0)
        })
        .map_err(|_| HvError::Bug("vmptrld failed reading EPT violation fields"))?;

    match on_violation(gpa, is_fetch)? {
        crate::ept::EptViolationAction::RetryWithExecuteGranted => {
            vcpu.retain_rip();
            Ok(ExitDisposition::Resume)
        }
        crate::ept::EptViolationAction::InjectGuestPageFault => {
            vcpu.inject_pf(gpa, 0);
            Ok(ExitDisposition::Resume)
        }
    }
}

/// Bit 31 of `IDT_VECTORING_INFO_FIELD`/`VM_EXIT_INTR_INFO`: the field
/// carries a valid event, as opposed to stale contents from a prior exit.
const INFO_VALID: u64 = 1 << 31;
/// Bit 11 of the low 32 bits: the vectoring event carries an error code
/// that must be copied to `VM_ENTRY_EXCEPTION_ERROR_CODE`.
const DELIVER_ERROR_CODE: u32 = 1 << 11;

/// `EXCEPTION_OR_NMI` handler: distinguishes "this fault interrupted
/// delivery of an earlier event" from "this fault originates in host
/// context". The former re-injects the interrupted event so the guest
/// sees it exactly once, delayed by one exit; the latter is a host bug —
/// this design runs no host-context code path that should ever fault.
pub fn handle_exception_or_nmi(vcpu: &mut Vcpu) -> Result<ExitDisposition, HvError> {
    let (idt_info, idt_err, intr_info) = vcpu
        .with_active_vmcs(|active| {
            (
                active.read(VmcsField::IDT_VECTORING_INFO_FIELD),
                active.read(VmcsField::IDT_VECTORING_ERROR_CODE),
                active.read(VmcsField::VM_EXIT_INTR_INFO),
            )
        })
        .map_err(|_| HvError::Bug("vmptrld failed reading exception exit fields"))?;

    if idt_info & INFO_VALID != 0 {
        reinject_pending_event(vcpu, idt_info, idt_err);
        Ok(ExitDisposition::Resume)
    } else {
        host_exception_panic(intr_info)
    }
}

/// Copies the interrupted event's vectoring info straight into the
/// entry-injection fields, carrying its error code along if it has one.
fn reinject_pending_event(vcpu: &mut Vcpu, idt_info: u64, idt_err: u64) {
    let _ = vcpu.with_active_vmcs(|active| {
        active.write(VmcsField::VM_ENTRY_INTR_INFO_FIELD, idt_info);
        if (idt_info as u32) & DELIVER_ERROR_CODE != 0 {
            active.write(VmcsField::VM_ENTRY_EXCEPTION_ERROR_CODE, idt_err);
        }
    });
}

/// A fault with no interrupted event behind it did not originate in
/// guest context reachable through normal emulation — this design has no
/// recovery story for it and reports it as a hypervisor bug.
fn host_exception_panic(_intr_info: u64) -> Result<ExitDisposition, HvError> {
    Err(HvError::Bug("exception exit with no interrupted event to reinject"))
}

/// Top-level dispatch: decodes the basic reason and entry-failure bit,
/// detects triple fault / entry failure as a fatal condition for this
/// vCPU's VM, and otherwise hands off to the per-reason handler the
/// caller supplies through `on_reason`.
pub fn dispatch(raw_exit_reason: u64, on_reason: impl FnOnce(u16) -> Result<ExitDisposition, HvError>) -> Result<ExitDisposition, HvError> {
    if is_entry_failure(raw_exit_reason) {
        return Ok(ExitDisposition::Shutdown);
    }
    let reason = basic_reason(raw_exit_reason);
    if reason == reasons::TRIPLE_FAULT {
        return Ok(ExitDisposition::Shutdown);
    }
    on_reason(reason)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn basic_reason_masks_to_low_sixteen_bits() {
        assert_eq!(basic_reason(0x8000_0030), 0x30);
    }

    #[test]
    fn entry_failure_bit_is_detected() {
        assert!(is_entry_failure(1 << 31));
        assert!(!is_entry_failure(reasons::EPT_VIOLATION as u64));
    }

    #[test]
    fn io_qualification_decodes_port_and_direction() {
        let qual = (0x64u64 << 16) | (1 << 3) | 0; // byte-in from port 0x64
        let decoded = decode_io_qualification(qual).unwrap();
        assert_eq!(decoded.port, 0x64);
        assert!(decoded.is_in);
        assert_eq!(decoded.size, novavisor_hal::pio::PioWidth::Byte);
        assert!(!decoded.string);
    }

    #[test]
    fn cr_access_qualification_decodes_write_and_register() {
        let qual = 0u64 | (3 << 8) | (0 << 4); // mov to cr0 from rbx
        let decoded = decode_cr_access_qualification(qual);
        assert_eq!(decoded.cr_number, 0);
        assert!(decoded.is_write);
        assert_eq!(decoded.gpr, GpReg::Rbx);
    }

    #[test]
    fn dispatch_detects_triple_fault_as_shutdown() {
        let result = dispatch(reasons::TRIPLE_FAULT as u64, |_| Ok(ExitDisposition::Resume)).unwrap();
        assert_eq!(result, ExitDisposition::Shutdown);
    }

    #[test]
    fn dispatch_detects_entry_failure_as_shutdown() {
        let result = dispatch(1 << 31, |_| Ok(ExitDisposition::Resume)).unwrap();
        assert_eq!(result, ExitDisposition::Shutdown);
    }

    #[test]
    fn dispatch_routes_other_reasons_to_the_handler() {
        let result = dispatch(reasons::CPUID as u64, |r| {
            assert_eq!(r, reasons::CPUID);
            Ok(ExitDisposition::Resume)
        })
        .unwrap();
        assert_eq!(result, ExitDisposition::Resume);
    }

    fn vcpu() -> Vcpu {
        Vcpu::create(0, 0, 0, 0x5000)
    }

    #[test]
    fn handle_io_instruction_reads_into_rax_with_width_mask() {
        let mut c = vcpu();
        c.vcpu_set_gpreg(GpReg::Rax, 0xFFFF_FFFF_FFFF_FFFF);
        let qual = IoQualification { port: 0x60, size: novavisor_hal::pio::PioWidth::Byte, is_in: true, string: false, rep: false };
        handle_io_instruction(&mut c, qual, |_, _| 0xAB, |_, _, _| panic!("unexpected write"));
        assert_eq!(c.vcpu_get_gpreg(GpReg::Rax), 0xFFFF_FFFF_FFFF_FFAB);
    }

    #[test]
    fn handle_io_instruction_rejects_string_accesses() {
        let mut c = vcpu();
        let qual = IoQualification { port: 0x60, size: novavisor_hal::pio::PioWidth::Byte, is_in: false, string: true, rep: false };
        handle_io_instruction(&mut c, qual, |_, _| 0, |_, _, _| panic!("must not reach device"));
        let exc = c.take_pending_exception().unwrap();
        assert_eq!(exc.vector, 13); // #GP
    }

    #[test]
    fn handle_cpuid_applies_the_mask_closure_to_the_host_result() {
        let mut c = vcpu();
        c.vcpu_set_gpreg(GpReg::Rax, 0);
        c.vcpu_set_gpreg(GpReg::Rcx, 0);
        handle_cpuid(&mut c, |_leaf, _eax, _ebx, _ecx, _edx| (1, 2, 3, 4));
        assert_eq!(c.vcpu_get_gpreg(GpReg::Rax), 1);
        assert_eq!(c.vcpu_get_gpreg(GpReg::Rbx), 2);
        assert_eq!(c.vcpu_get_gpreg(GpReg::Rcx), 3);
        assert_eq!(c.vcpu_get_gpreg(GpReg::Rdx), 4);
    }

    #[test]
    fn handle_rdmsr_injects_gp_on_illegal_msr() {
        let mut c = vcpu();
        c.vcpu_set_gpreg(GpReg::Rcx, 0xDEAD);
        handle_rdmsr(&mut c, |_| Err(()));
        let exc = c.take_pending_exception().unwrap();
        assert_eq!(exc.vector, 13);
    }

    #[test]
    fn handle_wrmsr_splits_rax_rdx_into_one_value() {
        let mut c = vcpu();
        c.vcpu_set_gpreg(GpReg::Rcx, 0x10);
        c.vcpu_set_gpreg(GpReg::Rax, 0x0000_0001);
        c.vcpu_set_gpreg(GpReg::Rdx, 0x0000_0002);
        let mut seen = None;
        handle_wrmsr(&mut c, |idx, val| {
            seen = Some((idx, val));
            Ok(())
        });
        assert_eq!(seen, Some((0x10, 0x0000_0002_0000_0001)));
    }

    #[test]
    fn exception_or_nmi_reinjects_a_valid_interrupted_event() {
        let mut c = vcpu();
        let idt_info = INFO_VALID | DELIVER_ERROR_CODE as u64 | 0xE; // #PF, valid, has error code
        c.with_active_vmcs(|active| {
            active.write(VmcsField::IDT_VECTORING_INFO_FIELD, idt_info);
            active.write(VmcsField::IDT_VECTORING_ERROR_CODE, 0x4);
        })
        .unwrap();
        let disposition = handle_exception_or_nmi(&mut c).unwrap();
        assert_eq!(disposition, ExitDisposition::Resume);
        let (entry_info, entry_err) = c
            .with_active_vmcs(|active| (active.read(VmcsField::VM_ENTRY_INTR_INFO_FIELD), active.read(VmcsField::VM_ENTRY_EXCEPTION_ERROR_CODE)))
            .unwrap();
        assert_eq!(entry_info, idt_info);
        assert_eq!(entry_err, 0x4);
    }

    #[test]
    fn exception_or_nmi_with_no_interrupted_event_is_a_bug() {
        let mut c = vcpu();
        c.with_active_vmcs(|active| active.write(VmcsField::IDT_VECTORING_INFO_FIELD, 0))
            .unwrap();
        let result = handle_exception_or_nmi(&mut c);
        assert!(result.is_err());
    }
}
