//! Snapshot of the host register state a VMCS's host-state area restores on
//! every VM-exit (component K). Read once per pCPU at `init_vmcs` time,
//! after that pCPU's GDT/TSS ([`crate::gdt`]) is already loaded.
//!
//! `CR0`/`CR3`/`CR4` and the descriptor-table bases are read back live
//! rather than assumed, since the boot environment (not this crate) is
//! what first establishes paging and the IDT.

use x86_64::instructions::tables::{sgdt, sidt};

use crate::gdt::GdtSelectors;

/// Everything `Vcpu::init_vmcs` needs to populate the VMCS `HOST_*` fields,
/// beyond `HOST_RSP`/`HOST_RIP` which are set at VM-entry time instead.
#[derive(Debug, Clone, Copy)]
pub struct HostState {
    pub cr0: u64,
    pub cr3: u64,
    pub cr4: u64,
    pub gdtr_base: u64,
    pub idtr_base: u64,
    pub tr_base: u64,
    pub selectors: GdtSelectors,
}

#[cfg(not(test))]
#[inline(always)]
fn read_cr0() -> u64 {
    let value: u64;
    unsafe { core::arch::asm!("mov {}, cr0", out(reg) value, options(nomem, nostack, preserves_flags)) };
    value
}

#[cfg(not(test))]
#[inline(always)]
fn read_cr3() -> u64 {
    let value: u64;
    unsafe { core::arch::asm!("mov {}, cr3", out(reg) value, options(nomem, nostack, preserves_flags)) };
    value
}

#[cfg(not(test))]
#[inline(always)]
fn read_cr4() -> u64 {
    let value: u64;
    unsafe { core::arch::asm!("mov {}, cr4", out(reg) value, options(nomem, nostack, preserves_flags)) };
    value
}

/// Reads this pCPU's live `CR0`/`CR3`/`CR4` and descriptor-table bases and
/// pairs them with the already-loaded GDT/TSS selectors and `tss_base`
/// (the TSS's own flat address, known from [`crate::gdt::init_pcpu_gdt`]
/// without needing to walk the GDT to find it).
#[cfg(not(test))]
pub fn snapshot_host_state(selectors: GdtSelectors, tss_base: u64) -> HostState {
    let gdtr = sgdt();
    let idtr = sidt();
    HostState {
        cr0: read_cr0(),
        cr3: read_cr3(),
        cr4: read_cr4(),
        gdtr_base: gdtr.base.as_u64(),
        idtr_base: idtr.base.as_u64(),
        tr_base: tss_base,
        selectors,
    }
}

/// Fixed, plausible-looking values for `cargo test`'s ring-3 host process,
/// where none of `CR0`/`CR3`/`CR4`/`sgdt`/`sidt` are available.
#[cfg(test)]
pub fn snapshot_host_state(selectors: GdtSelectors, tss_base: u64) -> HostState {
    HostState {
        cr0: 0x8000_0011,
        cr3: 0x1000,
        cr4: 0x0000_2020,
        gdtr_base: 0x2000,
        idtr_base: 0x3000,
        tr_base: tss_base,
        selectors,
    }
}

/// Reads the current stack pointer, used as `HOST_RSP`: this design does
/// not switch to a dedicated VMM stack on VM-entry, so execution resumes
/// on whatever stack was active when `VMLAUNCH`/`VMRESUME` executed.
#[cfg(not(test))]
#[inline(always)]
pub fn current_rsp() -> u64 {
    let value: u64;
    unsafe { core::arch::asm!("mov {}, rsp", out(reg) value, options(nomem, nostack, preserves_flags)) };
    value
}

#[cfg(test)]
#[inline(always)]
pub fn current_rsp() -> u64 {
    0x7000
}
