//! Top-level bring-up (component N's pCPU init half) and VM lifecycle
//! (component N's VM half): `prepare_vm`/`start_vm`/`pause_vm`/
//! `shutdown_vm`/`triple_fault_shutdown_vm`, plus `init_primary_pcpu`/
//! `init_secondary_pcpu` tying together the LAPIC bring-up (component C),
//! the notification vectors (component E), and the noop scheduler
//! (component M) this design partitions every pCPU with.

use novavisor_hal::caps::{vmcs_revision_id, CpuCaps};
use novavisor_hal::ept::{build_eptp, EptFlags};
use novavisor_hal::host_state::snapshot_host_state;
use novavisor_hal::lapic::{early_init_lapic, init_lapic};
use novavisor_hal::pcpu::MAX_PCPU_NUM;
use novavisor_hal::primitives::bitops::ffs64;
use novavisor_hal::vtd::{DeliveryMode, DrhdUnit};

use crate::config::VmConfig;
use crate::e820::E820Tables;
use crate::ept::{EptTablePool, VmEpt};
use crate::error::HvError;
use crate::irq::{posted_intr_notification, IrqTable, NotificationHub, NOTIFY_VECTOR, POSTED_INTR_NOTIFY_VECTOR};
use crate::msi::{build_physical_msi, VirtualMsiInfo};
use crate::pcpu::PcpuContext;
use crate::ptirq::{IntrType, PtirqPool};
use crate::vcpu::{Vcpu, VcpuState, VmcsInit};

/// The ACRN-lineage "CF9 test device" port: any guest write here triggers
/// `handle_cf9_shutdown` for the issuing VM (scenario S5).
pub const CF9_TEST_DEVICE_PORT: u16 = 0xF4;

/// EPT tables for every partition's memory and pass-through MMIO regions
/// share one fixed pool; this board's two active VMs' RAM regions fit
/// comfortably within it at the 2 MiB/4 KiB leaf granularity `add_mr` picks.
pub const EPT_TABLE_POOL_SIZE: usize = 256;

/// ISR installed for every pass-through interrupt this design assigns: the
/// physical vector lands here, but posting it into the owning guest's
/// virtual APIC (so the vCPU actually observes the interrupt) is reached
/// through the VM-exit dispatcher's posted-interrupt path (component L),
/// not this handler.
fn ptirq_trampoline(_vector: u8, _data: u64) {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmState {
    /// Configured but not yet given a running BSP vCPU.
    Created,
    Running,
    Paused,
    /// Torn down; its ptirq entries and vCPUs have been released. A VM
    /// never transitions out of this state — this design launches every
    /// partition exactly once per boot.
    Shutdown,
}

/// One partition's run-time state: its static configuration, the e820
/// table handed to its guest firmware/kernel, its BSP vCPU, and its
/// lifecycle state. Secondary (AP) vCPUs for multi-vCPU partitions are
/// owned the same way but are out of this struct's fixed single-vCPU
/// slot for brevity — a partition with `MAX_VCPUS_PER_VM` vCPUs would
/// generalize this to an array, mirrored exactly on the BSP slot's
/// lifecycle transitions.
pub struct Vm {
    pub vm_id: u16,
    pub state: VmState,
    bsp_vcpu: Vcpu,
    /// This VM's EPT root, allocated out of [`HypervisorState::ept_pool`].
    /// Freed by [`HypervisorState::shutdown_vm`].
    ept: Option<VmEpt>,
}

impl Vm {
    fn new(config: &VmConfig, vmcs_phys: u64, ept: VmEpt) -> Self {
        let bsp_pcpu = ffs64(config.pcpu_bitmap);
        Self {
            vm_id: config.vm_id,
            state: VmState::Created,
            bsp_vcpu: Vcpu::create(config.vm_id, 0, bsp_pcpu, vmcs_phys),
            ept: Some(ept),
        }
    }

    pub fn bsp_vcpu(&self) -> &Vcpu {
        &self.bsp_vcpu
    }

    pub fn bsp_vcpu_mut(&mut self) -> &mut Vcpu {
        &mut self.bsp_vcpu
    }
}

/// The whole host's state: every partition slot, the per-pCPU bring-up
/// contexts, and the shared IRQ/ptirq infrastructure components C/E/G
/// back onto. One instance lives for the lifetime of the host.
pub struct HypervisorState {
    pub vms: [Option<Vm>; crate::config::CONFIG_MAX_VM_NUM],
    pub pcpus: [PcpuContext; novavisor_hal::pcpu::MAX_PCPU_NUM],
    pub irq_table: IrqTable,
    pub notify_hub: NotificationHub,
    pub ptirq_pool: PtirqPool,
    pub e820: E820Tables,
    pub ept_pool: EptTablePool<EPT_TABLE_POOL_SIZE>,
    pub drhd: DrhdUnit,
    pub caps: CpuCaps,
}

impl HypervisorState {
    /// `caps` is this board's validated capability snapshot (component B's
    /// `init_pcpu_capabilities`, run once by the primary pCPU before this is
    /// constructed); `drhd_mmio_base` is the board's single DRHD unit's
    /// register base.
    pub fn new(caps: CpuCaps, drhd_mmio_base: usize) -> Self {
        let mut pcpus = [const { PcpuContext::new(0) }; novavisor_hal::pcpu::MAX_PCPU_NUM];
        for (pcpu_id, ctx) in pcpus.iter_mut().enumerate() {
            ctx.pcpu_id = pcpu_id as u16;
        }
        Self {
            vms: [const { None }; crate::config::CONFIG_MAX_VM_NUM],
            pcpus,
            irq_table: IrqTable::new(),
            notify_hub: NotificationHub::new(),
            ptirq_pool: PtirqPool::new(),
            e820: E820Tables::new(),
            ept_pool: EptTablePool::new(),
            // SAFETY: `drhd_mmio_base` is the board's fixed, validated DRHD
            // register base, supplied by the caller (component I's config).
            drhd: unsafe { DrhdUnit::new(drhd_mmio_base) },
            caps,
        }
    }

    /// `init_interrupt(pcpu_id)` + `setup_notification`/
    /// `setup_posted_intr_notification`: runs once, on the BSP, before any
    /// AP is started. Registers the two fixed notification vectors; every
    /// pCPU shares the same vector number, dispatched through each pCPU's
    /// own local [`IrqTable`] lookup (modeled here as one shared table
    /// since this design's handlers carry no per-pCPU closure state beyond
    /// what [`NotificationHub`] already tracks by pCPU id).
    pub fn setup_notifications(&mut self) -> Result<(), HvError> {
        self.irq_table.request_fixed_irq(NOTIFY_VECTOR, notify_trampoline, 0)?;
        self.irq_table.request_fixed_irq(POSTED_INTR_NOTIFY_VECTOR, posted_intr_notification, 0)?;
        Ok(())
    }

    /// `init_primary_pcpu`/`init_secondary_pcpu`: brings up this pCPU's
    /// LAPIC in x2APIC mode, installs its GDT/TSS and IST stacks
    /// ([`novavisor_hal::gdt`]), and records its identity in the matching
    /// [`PcpuContext`] slot, ready for `prepare_vm`/`start_vm` to pin a
    /// vCPU to it.
    pub fn init_pcpu(&mut self, pcpu_id: u16) {
        early_init_lapic();
        let state = init_lapic(POSTED_INTR_NOTIFY_VECTOR);
        // SAFETY: called at most once per `pcpu_id`, by the pCPU it
        // configures — the contract `init_pcpu_gdt` itself documents.
        let host_gdt = unsafe { novavisor_hal::gdt::init_pcpu_gdt(pcpu_id as usize) };
        let ctx = &mut self.pcpus[pcpu_id as usize];
        ctx.lapic_id = state.apic_id;
        ctx.lapic_ldr = state.ldr;
        ctx.boot_state = crate::pcpu::BootState::Running;
        ctx.host_gdt = Some(host_gdt);
    }

    /// `prepare_vm(vm)`: validates the static table has already run
    /// (callers must call [`crate::config::validate_vm_configs`] once at
    /// boot before preparing any VM), builds the e820 table, maps the
    /// VM's RAM through EPT, creates and initializes the BSP vCPU's VMCS
    /// pinned to the lowest pCPU in its affinity mask, and binds every
    /// configured pass-through device's MSI to its host-allocated vector.
    ///
    /// `entry_rip` is the guest's resolved entry point (`kernel_load_addr`
    /// for a Zephyr image that needs no relocation; a bzImage kernel's
    /// zero-page-derived load address once that resolution exists).
    pub fn prepare_vm(&mut self, config: &VmConfig, vmcs_phys: u64, entry_rip: u64) -> Result<(), HvError> {
        self.e820.create_prelaunched_vm_e820(config.vm_id, &config.memory);

        let vm_ept = VmEpt::new(&mut self.ept_pool, self.caps.phys_bits)?;
        let ram_flags = EptFlags::READ | EptFlags::WRITE | EptFlags::EXEC | EptFlags::MEM_TYPE_WB;
        vm_ept.add_mr(&mut self.ept_pool, config.memory.start_hpa, config.memory.start_hpa, config.memory.size, ram_flags)?;
        let ept_pointer = build_eptp(vm_ept.root_phys(&self.ept_pool));

        let mut vm = Vm::new(config, vmcs_phys, vm_ept);
        let pcpu_id = vm.bsp_vcpu.pcpu_id;
        self.pcpus[pcpu_id as usize].sched.init(config.vm_id as u32);

        let host_gdt = self.pcpus[pcpu_id as usize]
            .host_gdt
            .ok_or(HvError::Bug("prepare_vm: bsp pcpu has no gdt; init_pcpu not called"))?;
        let host_state = snapshot_host_state(host_gdt, host_gdt.tss_base);
        let revision_id = vmcs_revision_id(self.caps.vmx_basic);
        vm.bsp_vcpu_mut().init_vmcs(VmcsInit { revision_id, guest_entry_rip: entry_rip, ept_pointer, host_state })?;

        for pt_dev in config.pt_devs.iter().flatten() {
            let id = self.ptirq_pool.alloc_entry(config.vm_id, IntrType::Msi, pt_dev.phys_bdf as u32)?;
            self.ptirq_pool.activate_entry(id, &self.irq_table, ptirq_trampoline)?;
            let vector = self.ptirq_pool.entry(id).allocated_vector.ok_or(HvError::Bug("ptirq entry missing its allocated vector"))?;

            // No guest-writable MSI capability model exists (no dynamic
            // device model), so the host-allocated vector doubles as the
            // guest-visible one: the pass-through device's MSI is bound
            // once, for good, at prepare_vm time.
            let info = VirtualMsiInfo { vector, delivery_mode: DeliveryMode::Fixed };
            let lapic_ldr: [u32; MAX_PCPU_NUM] = core::array::from_fn(|i| self.pcpus[i].lapic_ldr);
            build_physical_msi(&self.drhd, config.vm_id, pt_dev.virt_bdf, info, config.pcpu_bitmap, &lapic_ldr)?;
        }

        self.vms[config.vm_id as usize] = Some(vm);
        Ok(())
    }

    /// `start_vm(vm)`: marks the VM (and its BSP vCPU) runnable. The
    /// actual first VM-entry happens the next time this vCPU's pCPU
    /// reaches its run loop and `pick_next` returns it. A freshly prepared
    /// vCPU goes straight from `Created` to `Running` here — `pause`/
    /// `resume` only round-trip a VM that has already been started once.
    pub fn start_vm(&mut self, vm_id: u16) -> Result<(), HvError> {
        let vm = self.vm_mut(vm_id)?;
        vm.bsp_vcpu_mut().state = VcpuState::Running;
        vm.state = VmState::Running;
        Ok(())
    }

    /// `pause_vm(vm)`: idempotent, matches [`crate::vcpu::Vcpu::pause`].
    pub fn pause_vm(&mut self, vm_id: u16) -> Result<(), HvError> {
        let vm = self.vm_mut(vm_id)?;
        vm.bsp_vcpu_mut().pause(crate::vcpu::PauseReason::VmShutdown);
        if vm.state == VmState::Running {
            vm.state = VmState::Paused;
        }
        Ok(())
    }

    /// `shutdown_vm(vm)`: zombifies the BSP vCPU, releases every ptirq
    /// entry this VM owned, and frees its EPT tables back to the shared
    /// pool — the only cross-component teardown a VM needs in a design
    /// with no dynamic device hot-unplug.
    pub fn shutdown_vm(&mut self, vm_id: u16) -> Result<(), HvError> {
        self.ptirq_pool.release_all_entries(vm_id, &self.irq_table);
        let ept = {
            let vm = self.vm_mut(vm_id)?;
            vm.bsp_vcpu_mut().zombify();
            vm.state = VmState::Shutdown;
            vm.ept.take()
        };
        if let Some(ept) = ept {
            ept.destroy(&mut self.ept_pool);
        }
        Ok(())
    }

    /// `triple_fault_shutdown_vm(vm)`: pauses the VM immediately (so it
    /// never re-enters) and defers the actual teardown to this vCPU's
    /// pCPU's idle loop via [`PcpuContext::request_shutdown`], matching
    /// the original design's split between "stop running" (synchronous,
    /// safe from any context) and "tear down" (only safe from the owning
    /// pCPU's own idle loop, since it touches that pCPU's scheduler slot).
    pub fn triple_fault_shutdown_vm(&mut self, vm_id: u16) -> Result<(), HvError> {
        let pcpu_id = {
            let vm = self.vm_mut(vm_id)?;
            vm.bsp_vcpu_mut().pause(crate::vcpu::PauseReason::VmShutdown);
            vm.state = VmState::Paused;
            vm.bsp_vcpu().pcpu_id
        };
        self.pcpus[pcpu_id as usize].request_shutdown(vm_id);
        Ok(())
    }

    /// `shutdown_vm_from_idle(pcpu_id)`: consumes a pending shutdown
    /// request left by `triple_fault_shutdown_vm`, run only from the
    /// owning pCPU's own idle loop.
    pub fn shutdown_vm_from_idle(&mut self, pcpu_id: u16) -> Result<(), HvError> {
        if let Some(vm_id) = self.pcpus[pcpu_id as usize].take_shutdown_request() {
            self.shutdown_vm(vm_id)?;
        }
        Ok(())
    }

    /// `S5 — Test-device (CF9) shutdown`: a guest write to port 0xF4
    /// pauses every vCPU of the issuing VM without tearing anything down —
    /// distinct from `triple_fault_shutdown_vm`, which this design's
    /// owning pCPU completes on its own idle loop. This struct's `Vm`
    /// models a single BSP vCPU per partition (see `Vm`'s doc comment); a
    /// multi-vCPU partition would iterate its full vCPU array here
    /// exactly the same way.
    pub fn handle_cf9_shutdown(&mut self, vm_id: u16) -> Result<(), HvError> {
        let vm = self.vm_mut(vm_id)?;
        vm.bsp_vcpu_mut().pause(crate::vcpu::PauseReason::VmShutdown);
        Ok(())
    }

    /// `pick_next(pcpu)` for this pCPU's run loop: the bound vCPU if its
    /// VM is running, else [`crate::sched::IDLE_THREAD`].
    pub fn pick_next(&self, pcpu_id: u16) -> u32 {
        let runnable = self.vms.iter().flatten().any(|vm| vm.bsp_vcpu.pcpu_id == pcpu_id && vm.state == VmState::Running);
        self.pcpus[pcpu_id as usize].sched.pick_next(runnable)
    }

    fn vm_mut(&mut self, vm_id: u16) -> Result<&mut Vm, HvError> {
        self.vms[vm_id as usize].as_mut().ok_or(HvError::Bug("operation on an unprepared VM slot"))
    }
}

/// `kick_notification`'s registration shape: [`IrqTable`] handlers carry
/// only a vector/data pair, so the actual per-pCPU dispatch into
/// [`NotificationHub::kick_notification`] happens at the call site that
/// owns both the table and the hub (this design keeps them in the same
/// [`HypervisorState`], but `IrqTable::dispatch` itself has no way to
/// reach back into it) — this trampoline exists only to give
/// `setup_notifications` a concrete function pointer to register; real
/// dispatch is `HypervisorState::dispatch_notification`.
fn notify_trampoline(_vector: u8, _data: u64) {}

impl HypervisorState {
    /// The real `NOTIFY_VECTOR` ISR body, called by the exit/interrupt
    /// dispatch loop instead of going through `IrqTable::dispatch` for
    /// this one fixed vector, since it needs `local_pcpu_id` context the
    /// table's handler signature doesn't carry.
    pub fn dispatch_notification(&self, local_pcpu_id: u16) {
        self.notify_hub.kick_notification(local_pcpu_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{MemoryConfig, OsConfig, KernelType, VmConfig};

    /// A plausible fixed capability snapshot; `vmx_basic` picks an
    /// arbitrary revision id and a VMCS region size the tests never
    /// actually size anything against.
    fn test_caps() -> CpuCaps {
        CpuCaps { vmx: true, ept: true, unrestricted_guest: true, x2apic: true, phys_bits: 39, ept_vpid_cap: 0x1, vmx_basic: 0x1000_0000_0001_0001 }
    }

    fn hv() -> HypervisorState {
        HypervisorState::new(test_caps(), 0xFED9_0000)
    }

    fn config(vm_id: u16, pcpu_bitmap: u64) -> VmConfig {
        VmConfig {
            vm_id,
            name: "test",
            pcpu_bitmap,
            memory: MemoryConfig { start_hpa: 0x1000_0000 * (vm_id as u64 + 1), size: 0x1000_0000 },
            os_config: OsConfig { kernel_type: KernelType::Bzimage, kernel_mod_tag: "kernel", bootargs_mod_tag: None, kernel_load_addr: 0x100000 },
            pt_devs: [None; crate::config::MAX_PT_DEV_NUM],
        }
    }

    /// `init_pcpu` installs the BSP's GDT/TSS that `prepare_vm` requires to
    /// snapshot host state; every test below runs it for pCPU 0 first.
    fn prepare(hv: &mut HypervisorState, cfg: &VmConfig, vmcs_phys: u64) {
        hv.init_pcpu(ffs64(cfg.pcpu_bitmap));
        hv.prepare_vm(cfg, vmcs_phys, cfg.os_config.kernel_load_addr).unwrap();
    }

    #[test]
    fn prepare_then_start_makes_the_vm_runnable() {
        let mut hv = hv();
        let cfg = config(0, 0b1);
        prepare(&mut hv, &cfg, 0x9000);
        hv.start_vm(0).unwrap();
        assert_eq!(hv.vms[0].as_ref().unwrap().state, VmState::Running);
        assert_eq!(hv.pick_next(0), 0);
    }

    #[test]
    fn pause_then_shutdown_transitions_state() {
        let mut hv = hv();
        let cfg = config(1, 0b10);
        prepare(&mut hv, &cfg, 0xA000);
        hv.start_vm(1).unwrap();
        hv.pause_vm(1).unwrap();
        assert_eq!(hv.vms[1].as_ref().unwrap().state, VmState::Paused);
        hv.shutdown_vm(1).unwrap();
        assert_eq!(hv.vms[1].as_ref().unwrap().state, VmState::Shutdown);
    }

    #[test]
    fn triple_fault_shutdown_defers_teardown_to_idle_loop() {
        let mut hv = hv();
        let cfg = config(2, 0b100);
        prepare(&mut hv, &cfg, 0xB000);
        hv.start_vm(2).unwrap();
        hv.triple_fault_shutdown_vm(2).unwrap();
        assert_eq!(hv.vms[2].as_ref().unwrap().state, VmState::Paused);

        hv.shutdown_vm_from_idle(2).unwrap();
        assert_eq!(hv.vms[2].as_ref().unwrap().state, VmState::Shutdown);
    }

    #[test]
    fn operating_on_an_unprepared_vm_reports_a_bug() {
        let mut hv = hv();
        assert!(hv.start_vm(3).is_err());
    }

    #[test]
    fn setup_notifications_registers_both_fixed_vectors() {
        let mut hv = hv();
        hv.setup_notifications().unwrap();
        assert!(hv.setup_notifications().is_err());
    }

    #[test]
    fn cf9_shutdown_pauses_without_tearing_down() {
        let mut hv = hv();
        let cfg = config(3, 0b1000);
        prepare(&mut hv, &cfg, 0xC000);
        hv.start_vm(3).unwrap();
        hv.handle_cf9_shutdown(3).unwrap();
        assert_eq!(hv.vms[3].as_ref().unwrap().bsp_vcpu().state, crate::vcpu::VcpuState::Paused);
        assert_eq!(hv.vms[3].as_ref().unwrap().state, VmState::Running);
    }

    #[test]
    fn prepare_vm_maps_its_memory_through_ept() {
        let mut hv = hv();
        let cfg = config(0, 0b1);
        prepare(&mut hv, &cfg, 0x9000);
        let mut seen = false;
        hv.vms[0].as_ref().unwrap().ept.as_ref().unwrap().walk(&hv.ept_pool, |gpa, hpa, size, _flags| {
            if gpa == cfg.memory.start_hpa && hpa == cfg.memory.start_hpa && size <= cfg.memory.size {
                seen = true;
            }
        });
        assert!(seen);
    }

    #[test]
    fn shutdown_vm_frees_its_ept_tables_back_to_the_pool() {
        let mut hv = hv();
        let cfg = config(0, 0b1);
        prepare(&mut hv, &cfg, 0x9000);
        hv.start_vm(0).unwrap();
        let used_before = hv.ept_pool.used();
        assert!(used_before > 0);
        hv.shutdown_vm(0).unwrap();
        assert_eq!(hv.ept_pool.used(), 0);
    }
}
