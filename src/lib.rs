#![no_std]
#![deny(unsafe_op_in_unsafe_fn)]

//! Board-level wiring: the static partition table (component I's config
//! half, § Configuration) and the Multiboot hand-off (§6) a trampoline
//! (out of scope here) is expected to call before jumping into
//! `novavisor-core`'s per-pCPU bring-up.
//!
//! Everything architecture-specific lives in `novavisor-hal`; everything
//! partitioning-policy lives in `novavisor-core`. This crate only owns
//! the board's fixed facts: which VMs exist, and where the bootloader
//! left their kernels.

pub mod boot;
pub mod config;

use novavisor_core::error::{ConfigError, HvError};
use novavisor_core::hypervisor::HypervisorState;
use novavisor_hal::memory::PAGE_SIZE;

impl From<boot::BootError> for HvError {
    fn from(e: boot::BootError) -> Self {
        match e {
            boot::BootError::BadMagic | boot::BootError::NullInfoStruct => HvError::Bug("invalid multiboot hand-off"),
            boot::BootError::ModuleNotFound | boot::BootError::ModuleEmpty => HvError::Config(ConfigError::MissingBootModule),
        }
    }
}

/// Scratch low-memory region this board reserves for VMCS regions, one
/// page per configured VM slot, indexed by `vm_id`. A real board would
/// get this from its physical frame allocator; this design partitions
/// everything statically, so a fixed carve-out is enough.
const VMCS_SCRATCH_BASE: u64 = 0x0009_0000;

fn vmcs_phys_for(vm_id: u16) -> u64 {
    VMCS_SCRATCH_BASE + vm_id as u64 * PAGE_SIZE
}

/// The bootstrap pCPU's bring-up: validates the board's partition table,
/// brings up its own LAPIC and notification vectors, resolves the
/// Multiboot hand-off, and prepares+starts every VM whose affinity mask
/// includes this pCPU.
///
/// Secondary pCPUs call [`novavisor_core::hypervisor::HypervisorState::init_pcpu`]
/// directly; they never touch the boot hand-off or the partition table.
pub fn primary_pcpu_bringup(pcpu_id: u16, boot_regs: boot::BootRegs) -> Result<HypervisorState, HvError> {
    let configs = config::active_configs();
    novavisor_core::config::validate_vm_configs(configs)?;

    let caps = novavisor_hal::caps::detect_cpu_caps().ok_or(HvError::Capability)?;
    let mut state = HypervisorState::new(caps, config::DRHD_MMIO_BASE);
    state.init_pcpu(pcpu_id);
    state.setup_notifications()?;

    let boot_info = boot::BootInfo::from_boot_regs(boot_regs)?;

    for vm_config in configs {
        if vm_config.pcpu_bitmap & (1u64 << pcpu_id) == 0 {
            continue;
        }
        // SAFETY: `boot_info` was validated against the Multiboot magic
        // above; the bootloader guarantees its module list and command
        // lines are mapped for the lifetime of this call.
        let _images = unsafe { boot_info.resolve_os_images(&vm_config.os_config)? };
        state.prepare_vm(vm_config, vmcs_phys_for(vm_config.vm_id), vm_config.os_config.kernel_load_addr)?;
        state.start_vm(vm_config.vm_id)?;
    }

    Ok(state)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vmcs_scratch_addresses_are_page_aligned_and_disjoint() {
        assert_eq!(vmcs_phys_for(0), VMCS_SCRATCH_BASE);
        assert_eq!(vmcs_phys_for(1), VMCS_SCRATCH_BASE + PAGE_SIZE);
        assert_ne!(vmcs_phys_for(0), vmcs_phys_for(1));
    }

    #[test]
    fn bad_boot_regs_surface_as_a_bug_error() {
        let err = boot::BootError::BadMagic;
        assert_eq!(HvError::from(err), HvError::Bug("invalid multiboot hand-off"));
    }

    #[test]
    fn missing_module_surfaces_as_a_config_error() {
        let err = boot::BootError::ModuleNotFound;
        assert_eq!(HvError::from(err), HvError::Config(ConfigError::MissingBootModule));
    }
}
