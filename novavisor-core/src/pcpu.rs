//! Per-pCPU context (component B). One instance per physical CPU, fixed
//! at boot; the HAL owns the request-bitmap primitive ([`novavisor_hal::pcpu::PcpuFlag`])
//! and the LAPIC/IOAPIC drivers, this module owns the policy object that
//! ties them to a scheduler control block and records which vCPU, if any,
//! is currently loaded.

use novavisor_hal::gdt::GdtSelectors;
use novavisor_hal::pcpu::{PcpuFlag, PCPU_FLAG_OFFLINE, PCPU_FLAG_SHUTDOWN_VM};

use crate::sched::NoopSchedCtl;

/// Boot-state enum from §3's data model.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootState {
    Halt,
    Running,
}

/// Diagnostic-only back-reference to the last vCPU that ran on this
/// pCPU. Never consulted for correctness — `ever_run_vcpu` in the spec's
/// own words — only surfaced through the logger on a panic path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VcpuRef {
    pub vm_id: u16,
    pub vcpu_id: u16,
}

pub struct PcpuContext {
    pub pcpu_id: u16,
    pub lapic_id: u32,
    pub lapic_ldr: u32,
    pub boot_state: BootState,
    pub flag: PcpuFlag,
    pub sched: NoopSchedCtl,
    /// Set once the first vCPU is created on this pCPU; diagnostics only.
    pub ever_run_vcpu: Option<VcpuRef>,
    /// `shutdown_vm_id` slot consumed by `shutdown_vm_from_idle` when
    /// `PCPU_FLAG_SHUTDOWN_VM` is observed (component N).
    pub shutdown_vm_id: Option<u16>,
    /// This pCPU's GDT/TSS selectors, set once by `init_pcpu`. `None` until
    /// then; every `init_vmcs` call on a vCPU pinned here requires it.
    pub host_gdt: Option<GdtSelectors>,
}

impl PcpuContext {
    pub const fn new(pcpu_id: u16) -> Self {
        Self {
            pcpu_id,
            lapic_id: 0,
            lapic_ldr: 0,
            boot_state: BootState::Halt,
            flag: PcpuFlag::new(),
            sched: NoopSchedCtl::new(),
            ever_run_vcpu: None,
            shutdown_vm_id: None,
            host_gdt: None,
        }
    }

    /// Records a request to tear down `vm_id`'s BSP vCPU the next time
    /// this pCPU reaches its idle loop; see `triple_fault_shutdown_vm`
    /// (component N).
    pub fn request_shutdown(&mut self, vm_id: u16) {
        self.shutdown_vm_id = Some(vm_id);
        self.flag.request(PCPU_FLAG_SHUTDOWN_VM);
    }

    /// Consumes a pending shutdown request, if any, returning the VM id
    /// to shut down. Called only from the idle loop.
    pub fn take_shutdown_request(&mut self) -> Option<u16> {
        if self.flag.take(PCPU_FLAG_SHUTDOWN_VM) {
            self.shutdown_vm_id.take()
        } else {
            None
        }
    }

    pub fn request_offline(&self) {
        self.flag.request(PCPU_FLAG_OFFLINE);
    }

    pub fn is_offline_requested(&self) -> bool {
        self.flag.is_set(PCPU_FLAG_OFFLINE)
    }
}
