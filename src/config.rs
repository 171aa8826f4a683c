//! The static partition table a board integrator is expected to replace.
//! `VM_CONFIGS` is the single source of truth `novavisor-core::hypervisor`
//! iterates at boot; nothing downstream of this file ever synthesizes a
//! `VmConfig` at runtime.

use novavisor_core::config::{KernelType, MemoryConfig, OsConfig, PtDevConfig, VmConfig, CONFIG_MAX_VM_NUM, MAX_PT_DEV_NUM};

const NONE_PT_DEV: [Option<PtDevConfig>; MAX_PT_DEV_NUM] = [None; MAX_PT_DEV_NUM];

/// This board's single DRHD unit's register MMIO base. A real board
/// derives this from the ACPI DMAR table; parsing DMAR is out of scope
/// here, so this is the fixed stand-in every pass-through device on this
/// board is assigned through.
pub const DRHD_MMIO_BASE: usize = 0xFED9_0000;

/// VM 0: a single-vCPU Zephyr real-time partition pinned to pCPU 0, no
/// pass-through devices.
const VM0_ZEPHYR: VmConfig = VmConfig {
    vm_id: 0,
    name: "rt-zephyr",
    pcpu_bitmap: 0b0001,
    memory: MemoryConfig { start_hpa: 0x1000_0000, size: 0x0400_0000 },
    os_config: OsConfig {
        kernel_type: KernelType::Zephyr,
        kernel_mod_tag: "zephyr.elf",
        bootargs_mod_tag: None,
        kernel_load_addr: 0x1010_0000,
    },
    pt_devs: NONE_PT_DEV,
};

/// VM 1: a multi-vCPU Linux partition (bzImage) pinned to pCPUs 1-3, with
/// one pass-through NIC function.
const VM1_LINUX: VmConfig = VmConfig {
    vm_id: 1,
    name: "linux-io",
    pcpu_bitmap: 0b1110,
    memory: MemoryConfig { start_hpa: 0x2000_0000, size: 0x8000_0000 },
    os_config: OsConfig {
        kernel_type: KernelType::Bzimage,
        kernel_mod_tag: "bzImage",
        bootargs_mod_tag: Some("linux.bootargs"),
        kernel_load_addr: 0, // derived from the zero-page at load time
    },
    pt_devs: {
        let mut devs = NONE_PT_DEV;
        devs[0] = Some(PtDevConfig { virt_bdf: 0x0300, phys_bdf: 0x1800 });
        devs
    },
};

/// The board's partition table. Validated once at boot by
/// [`novavisor_core::config::validate_vm_configs`] before any VM is
/// prepared.
pub static VM_CONFIGS: [VmConfig; CONFIG_MAX_VM_NUM] = [
    VM0_ZEPHYR,
    VM1_LINUX,
    VmConfig {
        vm_id: 2,
        name: "unused",
        pcpu_bitmap: 0,
        memory: MemoryConfig { start_hpa: 0, size: 0 },
        os_config: OsConfig { kernel_type: KernelType::Zephyr, kernel_mod_tag: "", bootargs_mod_tag: None, kernel_load_addr: 0 },
        pt_devs: NONE_PT_DEV,
    },
    VmConfig {
        vm_id: 3,
        name: "unused",
        pcpu_bitmap: 0,
        memory: MemoryConfig { start_hpa: 0, size: 0 },
        os_config: OsConfig { kernel_type: KernelType::Zephyr, kernel_mod_tag: "", bootargs_mod_tag: None, kernel_load_addr: 0 },
        pt_devs: NONE_PT_DEV,
    },
];

/// The configs this board actually launches; the trailing "unused" slots
/// in [`VM_CONFIGS`] exist only to fill [`CONFIG_MAX_VM_NUM`] and are
/// never passed to `prepare_vm`.
pub fn active_configs() -> &'static [VmConfig] {
    &VM_CONFIGS[..2]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn active_configs_validate() {
        assert!(novavisor_core::config::validate_vm_configs(active_configs()).is_ok());
    }

    #[test]
    fn vm1_carries_its_pass_through_nic() {
        assert_eq!(VM1_LINUX.pt_devs[0], Some(PtDevConfig { virt_bdf: 0x0300, phys_bdf: 0x1800 }));
    }
}
