//! Static VM configuration (component I, config half). `vm_configs` is
//! the single source of truth for the partition layout; nothing in this
//! crate ever allocates a VM at runtime, so every field here is sized and
//! validated once, at link time or at `init_primary_pcpu`, never per-call.

use novavisor_hal::pcpu::PcpuBitmap;

/// Upper bound on configured VMs. Also the width of the `vm_id << 6` IRTE
/// partitioning scheme's usable range — see [`crate::ptirq::irte_index`]
/// and spec §9's collision note.
pub const CONFIG_MAX_VM_NUM: usize = 4;
/// Upper bound on vCPUs per VM.
pub const MAX_VCPUS_PER_VM: usize = 16;
/// Upper bound on pass-through PCI functions per VM.
pub const MAX_PT_DEV_NUM: usize = 8;
/// Upper bound on e820 entries per VM (the template uses 3; headroom for
/// future supplementation without growing the type).
pub const E820_MAX_ENTRIES: usize = 8;

/// The two guest kernel formats this design loads, matching §6.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KernelType {
    Bzimage,
    Zephyr,
}

/// Guest OS boot parameters for one VM.
#[derive(Debug, Clone, Copy)]
pub struct OsConfig {
    pub kernel_type: KernelType,
    /// Matched against a Multiboot module's command line to find the
    /// kernel blob (§6).
    pub kernel_mod_tag: &'static str,
    /// Matched the same way, for the optional bootargs module.
    pub bootargs_mod_tag: Option<&'static str>,
    /// Only consulted for `KernelType::Zephyr`; `Bzimage` derives its
    /// load address from the embedded zero-page instead.
    pub kernel_load_addr: u64,
}

/// One pass-through PCI function assignment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PtDevConfig {
    /// Guest-visible bus:device.function.
    pub virt_bdf: u16,
    /// Physical bus:device.function.
    pub phys_bdf: u16,
}

/// Guest-physical memory region owned by one VM.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryConfig {
    pub start_hpa: u64,
    pub size: u64,
}

/// The full static description of one partition.
#[derive(Debug, Clone, Copy)]
pub struct VmConfig {
    pub vm_id: u16,
    pub name: &'static str,
    pub pcpu_bitmap: PcpuBitmap,
    pub memory: MemoryConfig,
    pub os_config: OsConfig,
    pub pt_devs: [Option<PtDevConfig>; MAX_PT_DEV_NUM],
}

/// Validates the invariants component I's data model requires:
/// pairwise-disjoint memory regions and pairwise-disjoint pCPU affinity
/// masks across every configured VM. A violation is a `ConfigError`
/// detected at boot, before any VM is prepared.
pub fn validate_vm_configs(configs: &[VmConfig]) -> Result<(), crate::error::ConfigError> {
    for (i, a) in configs.iter().enumerate() {
        if a.vm_id as usize != i {
            return Err(crate::error::ConfigError::VmIdOutOfRange);
        }
        for b in configs.iter().skip(i + 1) {
            if memory_overlaps(&a.memory, &b.memory) {
                return Err(crate::error::ConfigError::OverlappingMemoryRegion);
            }
            if (a.pcpu_bitmap & b.pcpu_bitmap) != 0 {
                return Err(crate::error::ConfigError::OverlappingPcpuAffinity);
            }
        }
    }
    Ok(())
}

fn memory_overlaps(a: &MemoryConfig, b: &MemoryConfig) -> bool {
    let a_end = a.start_hpa + a.size;
    let b_end = b.start_hpa + b.size;
    a.start_hpa < b_end && b.start_hpa < a_end
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make(vm_id: u16, start_hpa: u64, size: u64, pcpu_bitmap: PcpuBitmap) -> VmConfig {
        VmConfig {
            vm_id,
            name: "test",
            pcpu_bitmap,
            memory: MemoryConfig { start_hpa, size },
            os_config: OsConfig {
                kernel_type: KernelType::Zephyr,
                kernel_mod_tag: "zephyr",
                bootargs_mod_tag: None,
                kernel_load_addr: 0x1000_0000,
            },
            pt_devs: [None; MAX_PT_DEV_NUM],
        }
    }

    #[test]
    fn disjoint_configs_validate() {
        let configs = [make(0, 0, 0x1000_0000, 0b01), make(1, 0x1000_0000, 0x1000_0000, 0b10)];
        assert!(validate_vm_configs(&configs).is_ok());
    }

    #[test]
    fn overlapping_memory_is_rejected() {
        let configs = [make(0, 0, 0x2000_0000, 0b01), make(1, 0x1000_0000, 0x1000_0000, 0b10)];
        assert_eq!(validate_vm_configs(&configs), Err(crate::error::ConfigError::OverlappingMemoryRegion));
    }

    #[test]
    fn overlapping_pcpu_affinity_is_rejected() {
        let configs = [make(0, 0, 0x1000_0000, 0b11), make(1, 0x1000_0000, 0x1000_0000, 0b10)];
        assert_eq!(validate_vm_configs(&configs), Err(crate::error::ConfigError::OverlappingPcpuAffinity));
    }

    #[test]
    fn mismatched_vm_id_ordering_is_rejected() {
        let configs = [make(1, 0, 0x1000, 0b01)];
        assert_eq!(validate_vm_configs(&configs), Err(crate::error::ConfigError::VmIdOutOfRange));
    }
}
