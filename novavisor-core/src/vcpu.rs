//! vCPU and VMCS management (component K).

use novavisor_hal::host_state::HostState;
use novavisor_hal::memory::PhysicalAddress;
use novavisor_hal::vmcs::{ActiveVmcs, Vmcs, VmcsField, VmxError};

use crate::error::HvError;

/// Pin-based controls: exit on external interrupts and NMIs so the
/// scheduler and IPI handling always run in VMX root, never inside a guest.
const PIN_BASED_CTLS: u64 = (1 << 0) | (1 << 3);
/// Processor-based controls: exit on `HLT` (there is no guest idle loop to
/// emulate otherwise) and activate the secondary controls below.
const CPU_BASED_CTLS: u64 = (1 << 7) | (1 << 31);
/// Secondary processor-based controls: EPT plus unrestricted guest, so the
/// bring-up vCPU can start in unpaged protected mode without a monitor trap.
const SECONDARY_CTLS: u64 = (1 << 1) | (1 << 7);
/// VM-exit controls: host runs in 64-bit mode, and `IA32_EFER` is saved on
/// exit and reloaded on entry so the guest's 32-bit mode never leaks into it.
const VM_EXIT_CTLS: u64 = (1 << 9) | (1 << 20) | (1 << 21);
/// VM-entry controls: load `IA32_EFER`; deliberately omits "IA-32e mode
/// guest" since the bring-up guest starts in 32-bit protected mode.
const VM_ENTRY_CTLS: u64 = 1 << 15;
/// Intercept `#MC`, `#DF`, `#GP`, `#PF` and `#UD` unconditionally; every
/// other exception is left to the guest.
const EXCEPTION_BITMAP: u64 = (1 << 18) | (1 << 8) | (1 << 13) | (1 << 14) | (1 << 6);

/// `CR0.PE | CR0.PG`: the hypervisor always owns protected-mode and paging
/// transitions rather than letting the guest flip them without a VM-exit.
const CR0_GUEST_HOST_MASK: u64 = (1 << 0) | (1 << 31);
/// `CR4.VMXE`: hidden from the guest, which never needs to see it set.
const CR4_GUEST_HOST_MASK: u64 = 1 << 13;

/// Initial guest `CR0`: protection enable and "extension type" (always 1 on
/// any CPU new enough to run this hypervisor), paging left disabled.
const GUEST_CR0_INIT: u64 = (1 << 0) | (1 << 4);
/// Flat 32-bit code/data segment limit covering the full linear space.
const FLAT_SEGMENT_LIMIT: u64 = 0xFFFF_FFFF;
/// Guest code segment access rights: present, non-system, execute/read,
/// accessed, 32-bit default size, 4 KiB granularity.
const GUEST_CODE_AR_BYTES: u64 = 0xC09B;
/// Guest data segment access rights: present, non-system, read/write,
/// accessed, 4 KiB granularity.
const GUEST_DATA_AR_BYTES: u64 = 0xC093;
/// Guest `TR` access rights: present, 32-bit busy TSS (type 0xB).
const GUEST_TR_AR_BYTES: u64 = 0x008B;
/// `RFLAGS` bit 1 is reserved and always reads as 1.
const GUEST_RFLAGS_INIT: u64 = 0x2;

/// Everything [`Vcpu::init_vmcs`] needs beyond what the `Vcpu` already
/// carries: the guest's resolved entry point, the VM's EPT root, this
/// pCPU's host-state snapshot, and the revision identifier stamped into
/// the VMCS region before its first `VMCLEAR`.
pub struct VmcsInit {
    pub revision_id: u32,
    pub guest_entry_rip: u64,
    pub ept_pointer: u64,
    pub host_state: HostState,
}

/// `HOST_RIP` target: the processor vectors here on VM-exit. Empty for now;
/// wiring this to the real exit dispatcher (component L) needs a hand-built
/// entry trampoline that saves the exited guest's GPRs before calling into
/// Rust, which doesn't exist anywhere in this codebase yet.
extern "C" fn run_host_resume() {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VcpuState {
    Created,
    Init,
    Running,
    Paused,
    Zombie,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PauseReason {
    VmShutdown,
    HaltEmulation,
    SchedulerSleep,
}

/// Pending-event request bits, §3's "request word".
pub mod request_bits {
    pub const EXCP_INJECT: u32 = 1 << 0;
    pub const EVENT: u32 = 1 << 1;
    pub const FLUSH_EPT: u32 = 1 << 2;
    pub const TRP_FAULT: u32 = 1 << 3;
}

/// A queued exception: `(vector, error_code, has_err)`. Queue depth is 1;
/// queuing a second exception while one is pending collapses to #DF
/// (vector 8, error code 0) per the SDM's double-fault generation rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueuedException {
    pub vector: u8,
    pub error_code: u32,
    pub has_err: bool,
}

const VECTOR_DF: u8 = 8;
const VECTOR_PF: u8 = 14;
const VECTOR_GP: u8 = 13;
const VECTOR_UD: u8 = 6;

/// One guest virtual CPU: a fixed register-snapshot staging area plus the
/// VMCS that backs it while running.
pub struct Vcpu {
    pub vm_id: u16,
    pub vcpu_id: u16,
    pub pcpu_id: u16,
    pub state: VcpuState,
    vmcs: Vmcs,
    /// Set once this vCPU has VM-entered at least once; gates
    /// `VMLAUNCH` vs `VMRESUME` in `enter`.
    has_launched: bool,
    /// Do-not-advance-RIP flag, set by `vcpu_retain_rip` and cleared
    /// after the next successful entry.
    retain_rip: bool,
    pending_exception: Option<QueuedException>,
    request_bits: u32,
    gprs: [u64; 16],
    cr2: u64,
}

/// General-purpose register indices, matching `acrn_vcpu_regs` ordering
/// closely enough for `vcpu_get_gpreg`/`vcpu_set_gpreg` call sites to read
/// naturally (RAX first, R15 last).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum GpReg {
    Rax = 0,
    Rcx = 1,
    Rdx = 2,
    Rbx = 3,
    Rsp = 4,
    Rbp = 5,
    Rsi = 6,
    Rdi = 7,
    R8 = 8,
    R9 = 9,
    R10 = 10,
    R11 = 11,
    R12 = 12,
    R13 = 13,
    R14 = 14,
    R15 = 15,
}

impl Vcpu {
    /// `vcpu_create(vm, vcpu_id, pcpu_id)`: attaches to a pCPU, zeroes the
    /// register slot, and takes ownership of a VMCS region (allocation of
    /// the backing 4 KiB page is the caller's responsibility, matching
    /// this design's no-`alloc` policy).
    pub fn create(vm_id: u16, vcpu_id: u16, pcpu_id: u16, vmcs_phys: PhysicalAddress) -> Self {
        Self {
            vm_id,
            vcpu_id,
            pcpu_id,
            state: VcpuState::Created,
            vmcs: Vmcs::new(vmcs_phys),
            has_launched: false,
            retain_rip: false,
            pending_exception: None,
            request_bits: 0,
            gprs: [0; 16],
            cr2: 0,
        }
    }

    /// `init_vmcs(vcpu, init)`: stamps the revision identifier, VMCLEARs,
    /// loads and populates every guest/host/control field this design's
    /// bring-up vCPU needs. Must run once, before the vCPU's first `enter`.
    ///
    /// The guest starts in flat, unpaged 32-bit protected mode at
    /// `init.guest_entry_rip` with a full 4 GiB code/data segment — the
    /// entry state the Linux/x86 boot protocol's 32-bit entry point and a
    /// freshly relocated Zephyr image both expect.
    pub fn init_vmcs(&mut self, init: VmcsInit) -> Result<(), HvError> {
        self.vmcs.write_revision_id(init.revision_id);
        self.vmcs.clear().map_err(|_| HvError::Bug("vmclear failed"))?;
        let mut active = self.vmcs.load().map_err(|_| HvError::Bug("vmptrld failed"))?;

        active.write(VmcsField::PIN_BASED_VM_EXEC_CONTROL, PIN_BASED_CTLS);
        active.write(VmcsField::CPU_BASED_VM_EXEC_CONTROL, CPU_BASED_CTLS);
        active.write(VmcsField::SECONDARY_VM_EXEC_CONTROL, SECONDARY_CTLS);
        active.write(VmcsField::VM_EXIT_CONTROLS, VM_EXIT_CTLS);
        active.write(VmcsField::VM_ENTRY_CONTROLS, VM_ENTRY_CTLS);
        active.write(VmcsField::EXCEPTION_BITMAP, EXCEPTION_BITMAP);
        active.write(VmcsField::CR0_GUEST_HOST_MASK, CR0_GUEST_HOST_MASK);
        active.write(VmcsField::CR4_GUEST_HOST_MASK, CR4_GUEST_HOST_MASK);
        active.write(VmcsField::CR0_READ_SHADOW, GUEST_CR0_INIT & CR0_GUEST_HOST_MASK);
        active.write(VmcsField::CR4_READ_SHADOW, 0);
        active.write(VmcsField::EPT_POINTER, init.ept_pointer);

        active.write(VmcsField::GUEST_CR0, GUEST_CR0_INIT);
        active.write(VmcsField::GUEST_CR3, 0);
        active.write(VmcsField::GUEST_CR4, 0);
        active.write(VmcsField::GUEST_RIP, init.guest_entry_rip);
        active.write(VmcsField::GUEST_RSP, 0);
        active.write(VmcsField::GUEST_RFLAGS, GUEST_RFLAGS_INIT);
        active.write(VmcsField::GUEST_IA32_EFER, 0);

        for sel in [
            VmcsField::GUEST_ES_SELECTOR,
            VmcsField::GUEST_CS_SELECTOR,
            VmcsField::GUEST_SS_SELECTOR,
            VmcsField::GUEST_DS_SELECTOR,
            VmcsField::GUEST_FS_SELECTOR,
            VmcsField::GUEST_GS_SELECTOR,
            VmcsField::GUEST_TR_SELECTOR,
        ] {
            active.write(sel, 0);
        }
        for base in [
            VmcsField::GUEST_ES_BASE,
            VmcsField::GUEST_CS_BASE,
            VmcsField::GUEST_SS_BASE,
            VmcsField::GUEST_DS_BASE,
            VmcsField::GUEST_FS_BASE,
            VmcsField::GUEST_GS_BASE,
        ] {
            active.write(base, 0);
        }
        for limit in [
            VmcsField::GUEST_ES_LIMIT,
            VmcsField::GUEST_CS_LIMIT,
            VmcsField::GUEST_SS_LIMIT,
            VmcsField::GUEST_DS_LIMIT,
            VmcsField::GUEST_FS_LIMIT,
            VmcsField::GUEST_GS_LIMIT,
        ] {
            active.write(limit, FLAT_SEGMENT_LIMIT);
        }
        active.write(VmcsField::GUEST_CS_AR_BYTES, GUEST_CODE_AR_BYTES);
        for ar in [
            VmcsField::GUEST_ES_AR_BYTES,
            VmcsField::GUEST_SS_AR_BYTES,
            VmcsField::GUEST_DS_AR_BYTES,
            VmcsField::GUEST_FS_AR_BYTES,
            VmcsField::GUEST_GS_AR_BYTES,
        ] {
            active.write(ar, GUEST_DATA_AR_BYTES);
        }
        // No guest GDT/IDT has been loaded yet; zero-base/zero-limit is the
        // documented reset-like state unrestricted guest mode permits.
        active.write(VmcsField::GUEST_GDTR_BASE, 0);
        active.write(VmcsField::GUEST_GDTR_LIMIT, 0xFFFF);
        active.write(VmcsField::GUEST_IDTR_BASE, 0);
        active.write(VmcsField::GUEST_IDTR_LIMIT, 0xFFFF);
        active.write(VmcsField::GUEST_TR_BASE, 0);
        active.write(VmcsField::GUEST_TR_LIMIT, 0xFFFF);
        active.write(VmcsField::GUEST_TR_AR_BYTES, GUEST_TR_AR_BYTES);

        let host = init.host_state;
        active.write(VmcsField::HOST_CR0, host.cr0);
        active.write(VmcsField::HOST_CR3, host.cr3);
        active.write(VmcsField::HOST_CR4, host.cr4);
        active.write(VmcsField::HOST_ES_SELECTOR, host.selectors.data.0 as u64);
        active.write(VmcsField::HOST_CS_SELECTOR, host.selectors.code.0 as u64);
        active.write(VmcsField::HOST_SS_SELECTOR, host.selectors.data.0 as u64);
        active.write(VmcsField::HOST_DS_SELECTOR, host.selectors.data.0 as u64);
        active.write(VmcsField::HOST_FS_SELECTOR, 0);
        active.write(VmcsField::HOST_GS_SELECTOR, 0);
        active.write(VmcsField::HOST_TR_SELECTOR, host.selectors.tss.0 as u64);
        active.write(VmcsField::HOST_FS_BASE, 0);
        active.write(VmcsField::HOST_GS_BASE, 0);
        active.write(VmcsField::HOST_TR_BASE, host.tr_base);
        active.write(VmcsField::HOST_GDTR_BASE, host.gdtr_base);
        active.write(VmcsField::HOST_IDTR_BASE, host.idtr_base);
        active.write(VmcsField::HOST_IA32_EFER, 0);
        active.write(VmcsField::HOST_RIP, run_host_resume as u64);
        active.write(VmcsField::HOST_RSP, novavisor_hal::host_state::current_rsp());

        self.state = VcpuState::Init;
        Ok(())
    }

    pub fn vcpu_get_gpreg(&self, reg: GpReg) -> u64 {
        self.gprs[reg as usize]
    }

    pub fn vcpu_set_gpreg(&mut self, reg: GpReg, val: u64) {
        self.gprs[reg as usize] = val;
    }

    /// `vcpu_retain_rip(vcpu)`: marks "do not advance RIP at next entry",
    /// used on EPT-violation execute-permission retries and re-attempted
    /// emulation.
    pub fn retain_rip(&mut self) {
        self.retain_rip = true;
    }

    pub fn should_advance_rip(&self) -> bool {
        !self.retain_rip
    }

    /// `vcpu_queue_exception(vcpu, vector, err)`. Collapses a second
    /// queued exception to #DF per the double-fault generation rule.
    pub fn queue_exception(&mut self, vector: u8, error_code: u32, has_err: bool) {
        self.pending_exception = Some(match self.pending_exception {
            Some(_) => QueuedException { vector: VECTOR_DF, error_code: 0, has_err: true },
            None => QueuedException { vector, error_code, has_err },
        });
        self.request_bits |= request_bits::EXCP_INJECT;
    }

    /// `vcpu_inject_pf`: #PF specialization that also writes CR2.
    pub fn inject_pf(&mut self, gpa: u64, error_code: u32) {
        self.cr2 = gpa;
        self.queue_exception(VECTOR_PF, error_code, true);
    }

    pub fn inject_gp(&mut self) {
        self.queue_exception(VECTOR_GP, 0, true);
    }

    pub fn inject_ud(&mut self) {
        self.queue_exception(VECTOR_UD, 0, false);
    }

    pub fn take_pending_exception(&mut self) -> Option<QueuedException> {
        self.request_bits &= !request_bits::EXCP_INJECT;
        self.pending_exception.take()
    }

    /// `vcpu_make_request(vcpu, eventid)`: sets a request bit and reports
    /// whether a cross-pCPU notification IPI is needed (the vCPU is
    /// running on a pCPU other than `caller_pcpu_id`).
    pub fn make_request(&mut self, eventid: u32, caller_pcpu_id: u16) -> bool {
        self.request_bits |= eventid;
        self.state == VcpuState::Running && self.pcpu_id != caller_pcpu_id
    }

    pub fn has_request(&self, eventid: u32) -> bool {
        (self.request_bits & eventid) != 0
    }

    /// `pause_vcpu(vcpu, reason)`: idempotent. Paused vCPUs are not
    /// re-entered until resumed by `start_vm`/`wake`.
    pub fn pause(&mut self, _reason: PauseReason) {
        if self.state == VcpuState::Running || self.state == VcpuState::Init {
            self.state = VcpuState::Paused;
        }
    }

    pub fn resume(&mut self) {
        if self.state == VcpuState::Paused {
            self.state = VcpuState::Running;
        }
    }

    pub fn zombify(&mut self) {
        self.state = VcpuState::Zombie;
    }

    /// `load_vmcs(vcpu)`: VMPTRLDs this vCPU's region and hands the
    /// active token to `f`, scoped so the borrow of the VMCS never has to
    /// outlive a single call — the dispatcher (component L) calls this
    /// once per VM-exit tail rather than holding a token across calls.
    pub fn with_active_vmcs<R>(&self, f: impl FnOnce(&mut ActiveVmcs<'_>) -> R) -> Result<R, VmxError> {
        let mut active = self.vmcs.load()?;
        Ok(f(&mut active))
    }

    /// `load_vmcs(vcpu)` + VM-entry: launches on the first entry, resumes
    /// thereafter. Returns the VMCS `EXIT_REASON` field.
    pub fn enter(&mut self) -> Result<u64, HvError> {
        let first = !self.has_launched;
        let result = self
            .with_active_vmcs(|active| active.enter(first))
            .map_err(|_| HvError::Bug("vmptrld failed"))?
            .map_err(|_| HvError::Bug("vm-entry failed"));
        if result.is_ok() {
            self.has_launched = true;
            self.retain_rip = false;
        }
        result
    }

    /// Advances RIP by the VM-exit instruction length, unless
    /// `vcpu_retain_rip` was called for this exit.
    pub fn maybe_advance_rip(&self) {
        if self.should_advance_rip() {
            let _ = self.with_active_vmcs(|active| {
                let rip = active.read(VmcsField::GUEST_RIP);
                let len = active.read(VmcsField::VM_EXIT_INSTRUCTION_LEN);
                active.write(VmcsField::GUEST_RIP, rip + len);
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vcpu() -> Vcpu {
        Vcpu::create(0, 0, 0, 0x1000)
    }

    #[test]
    fn gpreg_round_trips() {
        let mut c = vcpu();
        c.vcpu_set_gpreg(GpReg::Rax, 42);
        assert_eq!(c.vcpu_get_gpreg(GpReg::Rax), 42);
        assert_eq!(c.vcpu_get_gpreg(GpReg::Rbx), 0);
    }

    #[test]
    fn second_queued_exception_collapses_to_double_fault() {
        let mut c = vcpu();
        c.inject_pf(0x2000, 0);
        c.inject_gp();
        let exc = c.take_pending_exception().unwrap();
        assert_eq!(exc.vector, VECTOR_DF);
        assert_eq!(exc.error_code, 0);
    }

    #[test]
    fn single_queued_exception_is_preserved() {
        let mut c = vcpu();
        c.inject_ud();
        let exc = c.take_pending_exception().unwrap();
        assert_eq!(exc.vector, VECTOR_UD);
        assert!(!exc.has_err);
    }

    #[test]
    fn pause_is_idempotent() {
        let mut c = vcpu();
        c.state = VcpuState::Running;
        c.pause(PauseReason::HaltEmulation);
        c.pause(PauseReason::HaltEmulation);
        assert_eq!(c.state, VcpuState::Paused);
    }

    #[test]
    fn make_request_reports_notification_needed_only_when_running_elsewhere() {
        let mut c = vcpu();
        c.pcpu_id = 3;
        c.state = VcpuState::Running;
        assert!(c.make_request(request_bits::EVENT, 1));
        assert!(!c.make_request(request_bits::EVENT, 3));
    }

    #[test]
    fn retain_rip_suppresses_advance_until_next_entry() {
        let mut c = vcpu();
        assert!(c.should_advance_rip());
        c.retain_rip();
        assert!(!c.should_advance_rip());
    }

    #[test]
    fn first_entry_launches_then_resumes() {
        let mut c = vcpu();
        assert!(!c.has_launched);
        let _ = c.enter().unwrap();
        assert!(c.has_launched);
    }

    #[test]
    fn advance_rip_moves_past_the_exiting_instruction() {
        let c = vcpu();
        c.with_active_vmcs(|active| {
            active.write(VmcsField::GUEST_RIP, 0x1000);
            active.write(VmcsField::VM_EXIT_INSTRUCTION_LEN, 3);
        })
        .unwrap();
        c.maybe_advance_rip();
        let rip = c.with_active_vmcs(|active| active.read(VmcsField::GUEST_RIP)).unwrap();
        assert_eq!(rip, 0x1003);
    }
}
