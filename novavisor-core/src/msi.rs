//! MSI/MSI-X remap (component H): builds the physical IRTE-backed MSI
//! message a pass-through device's capability registers must be
//! reprogrammed with, given the guest's requested virtual MSI message.
//!
//! This design pins every vCPU of a partition to a fixed, disjoint pCPU
//! set at boot (§ partitioning), so there is no vCPU-to-pCPU remap to
//! chase at interrupt-delivery time the way a consolidated hypervisor
//! would: a VM's logical destination mask is simply the OR of its
//! partition's pCPUs' LAPIC LDRs.

use novavisor_hal::primitives::bitops::ffs64;
use novavisor_hal::pcpu::MAX_PCPU_NUM;
use novavisor_hal::vtd::{split_irte_index, DeliveryMode, DestMode, DrhdUnit, Irte};

use crate::error::HvError;

/// The guest's requested MSI message, decoded from its virtual MSI
/// address/data capability registers.
#[derive(Debug, Clone, Copy)]
pub struct VirtualMsiInfo {
    pub vector: u8,
    pub delivery_mode: DeliveryMode,
}

/// The physical MSI address/data pair this design writes back into the
/// device's MSI capability once its IRTE is programmed: remappable
/// format, interrupt-format bit set, no sub-handle (ACRN disables
/// multi-message capable MSI devices, so `shv` is always 0).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PhysicalMsiMessage {
    pub addr: u64,
    pub data: u32,
}

const MSI_ADDR_CONSTANT: u64 = 0xFEE;

fn build_remappable_message(index: u16) -> PhysicalMsiMessage {
    let split = split_irte_index(index);
    let mut addr: u64 = MSI_ADDR_CONSTANT << 12;
    addr |= 1 << 4; // intr_format: remappable
    addr |= (split.index_low as u64) << 5;
    addr |= (split.index_high as u64) << 2;
    PhysicalMsiMessage { addr, data: 0 }
}

/// `calculate_logical_dest_mask(pcpu_mask)`: ORs the LAPIC LDR of every
/// pCPU in `pcpu_mask` into one logical destination.
pub fn calculate_logical_dest_mask(pcpu_mask: u64, lapic_ldr: &[u32]) -> u32 {
    let mut dest_mask = 0u32;
    let mut remaining = pcpu_mask;
    loop {
        let pcpu_id = ffs64(remaining);
        if pcpu_id as usize >= MAX_PCPU_NUM {
            break;
        }
        remaining &= !(1u64 << pcpu_id);
        dest_mask |= lapic_ldr.get(pcpu_id as usize).copied().unwrap_or(0);
    }
    dest_mask
}

/// `ptirq_build_physical_msi` + `dmar_assign_irte`: programs the IRTE for
/// `virt_bdf` in `vm_id`'s partition and returns the message the device's
/// MSI capability must be rewritten with.
///
/// `pcpu_mask` is the VM's static pCPU affinity (every vCPU of a
/// partitioned guest is pinned, so there's no need to compute a
/// per-delivery destination the way a time-shared hypervisor would);
/// `lapic_ldr` is indexed by pCPU id.
pub fn build_physical_msi(
    drhd: &DrhdUnit,
    vm_id: u16,
    virt_bdf: u16,
    info: VirtualMsiInfo,
    pcpu_mask: u64,
    lapic_ldr: &[u32],
) -> Result<PhysicalMsiMessage, HvError> {
    let dest_mask = calculate_logical_dest_mask(pcpu_mask, lapic_ldr);
    let irte = Irte::new_remappable(info.vector, info.delivery_mode, DestMode::Logical, true, dest_mask);

    let index = irte_index(vm_id, virt_bdf);
    drhd.assign_irte(index, irte);
    Ok(build_remappable_message(index))
}

/// `ptirq_remove_msix_remapping` / `dmar_free_irte`.
pub fn free_physical_msi(drhd: &DrhdUnit, vm_id: u16, virt_bdf: u16) {
    drhd.free_irte(irte_index(vm_id, virt_bdf));
}

/// `index = ((virt_bdf & 0x3F) | (vm_id << 6)) & 0xFF` — partitions the
/// 256-entry IRTE table into per-VM regions keyed by the low 6 bits of
/// the guest-visible BDF, exactly as assigned in the static device table
/// (§ partitioning's disjoint-BDF invariant guarantees no collision).
pub fn irte_index(vm_id: u16, virt_bdf: u16) -> u16 {
    ((virt_bdf & 0x3F) | (vm_id << 6)) & 0xFF
}
