//! Per-pCPU GDT/TSS and the IST stacks backing the machine-check,
//! double-fault and stack-fault vectors (component K). Every pCPU needs its
//! own TSS because `interrupt_stack_table` entries are per-descriptor, not
//! per-core state the processor saves elsewhere.
//!
//! The GDTs live in a fixed-size static array rather than inside
//! [`crate::pcpu`]'s per-pCPU context: that context is owned by
//! `novavisor-core::HypervisorState`, which is handed back out of the boot
//! sequence by value, and a `TaskStateSegment` descriptor baked with a
//! `'static` reference to a TSS that later moved would be pointing at
//! stale memory. A static array never moves after link time.

use x86_64::instructions::tables::load_tss;
use x86_64::structures::gdt::{Descriptor, GlobalDescriptorTable, SegmentSelector};
use x86_64::structures::tss::TaskStateSegment;
use x86_64::VirtAddr;

use crate::pcpu::MAX_PCPU_NUM;

/// IST index (1-based, per `TaskStateSegment::interrupt_stack_table`) used
/// for `#MC`.
pub const IST_MACHINE_CHECK: u16 = 1;
/// IST index used for `#DF`.
pub const IST_DOUBLE_FAULT: u16 = 2;
/// IST index used for `#SS`.
pub const IST_STACK_FAULT: u16 = 3;

/// Size of each IST stack. These handlers never recurse and do no
/// allocation-heavy work, so two pages is generous headroom over the
/// teacher board's observed worst case.
const IST_STACK_SIZE: usize = 2 * 4096;
const IST_STACK_COUNT: usize = 3;

/// Selectors an entered VMCS's host-state fields need, resolved once per
/// pCPU at bring-up and otherwise static for that pCPU's lifetime.
#[derive(Debug, Clone, Copy)]
pub struct GdtSelectors {
    pub code: SegmentSelector,
    pub data: SegmentSelector,
    pub tss: SegmentSelector,
    /// Flat address of the backing `TaskStateSegment`, for `HOST_TR_BASE`.
    pub tss_base: u64,
}

/// Backing storage for one pCPU's IST stacks. `#[repr(align(16))]` keeps
/// the top-of-stack address 16-byte aligned without relying on the
/// surrounding struct's layout.
#[repr(align(16))]
struct IstStack([u8; IST_STACK_SIZE]);

impl IstStack {
    const fn new() -> Self {
        Self([0u8; IST_STACK_SIZE])
    }

    fn top(&self) -> VirtAddr {
        let base = self.0.as_ptr() as u64;
        VirtAddr::new(base + IST_STACK_SIZE as u64)
    }
}

/// One pCPU's GDT, TSS and IST stacks. Constructed zeroed by [`PcpuGdt::new`]
/// (usable in a `const` static initializer), then wired up by
/// [`PcpuGdt::init`] once its final address is fixed.
pub struct PcpuGdt {
    tss: TaskStateSegment,
    gdt: GlobalDescriptorTable,
    ist_stacks: [IstStack; IST_STACK_COUNT],
    selectors: Option<GdtSelectors>,
}

impl PcpuGdt {
    pub const fn new() -> Self {
        Self {
            tss: TaskStateSegment::new(),
            gdt: GlobalDescriptorTable::new(),
            ist_stacks: [IstStack::new(), IstStack::new(), IstStack::new()],
            selectors: None,
        }
    }

    /// Wires the IST stack addresses into the TSS and builds the GDT
    /// (null, kernel code, kernel data, TSS). Idempotent only in the sense
    /// that calling it twice rebuilds the same tables; callers call it
    /// exactly once per pCPU, before `load`.
    fn init(&mut self) {
        self.tss.interrupt_stack_table[(IST_MACHINE_CHECK - 1) as usize] = self.ist_stacks[0].top();
        self.tss.interrupt_stack_table[(IST_DOUBLE_FAULT - 1) as usize] = self.ist_stacks[1].top();
        self.tss.interrupt_stack_table[(IST_STACK_FAULT - 1) as usize] = self.ist_stacks[2].top();

        // SAFETY: `self` lives in `PCPU_GDTS`, a `'static` array that is
        // never moved or dropped after `primary_pcpu_bringup` populates it,
        // so a reference borrowed for the `'static` lifetime here remains
        // valid for the process's remaining lifetime.
        let tss_ref: &'static TaskStateSegment = unsafe { &*(&self.tss as *const TaskStateSegment) };
        let tss_base = tss_ref as *const TaskStateSegment as u64;

        let code = self.gdt.add_entry(Descriptor::kernel_code_segment());
        let data = self.gdt.add_entry(Descriptor::kernel_data_segment());
        let tss = self.gdt.add_entry(Descriptor::tss_segment(tss_ref));
        self.selectors = Some(GdtSelectors { code, data, tss, tss_base });
    }

    /// Loads this pCPU's GDT, reloads `CS`/`SS`/`DS`/`ES` and loads the TSS.
    /// Compiled out under `cfg(test)`, where there is no real descriptor
    /// table hardware to program.
    #[cfg(not(test))]
    fn load(&self) {
        use x86_64::instructions::segmentation::{Segment, CS, DS, ES, SS};

        let selectors = self.selectors.expect("PcpuGdt::load called before init");
        // SAFETY: `self` lives in `PCPU_GDTS`'s static storage and is never
        // moved or freed again, so a `'static` borrow taken here stays valid.
        let gdt_ref: &'static GlobalDescriptorTable = unsafe { &*(&self.gdt as *const GlobalDescriptorTable) };
        gdt_ref.load();
        unsafe {
            CS::set_reg(selectors.code);
            SS::set_reg(selectors.data);
            DS::set_reg(selectors.data);
            ES::set_reg(selectors.data);
            load_tss(selectors.tss);
        }
    }

    #[cfg(test)]
    fn load(&self) {}

    pub fn selectors(&self) -> GdtSelectors {
        self.selectors.expect("PcpuGdt::selectors called before init")
    }
}

/// One [`PcpuGdt`] per supported pCPU, indexed by pCPU id. `const { }` in
/// the repeat expression forces per-element initialization rather than a
/// `Copy` of one shared value, matching the idiom `novavisor-core::pcpu`
/// already uses for its own per-pCPU array.
static mut PCPU_GDTS: [PcpuGdt; MAX_PCPU_NUM] = [const { PcpuGdt::new() }; MAX_PCPU_NUM];

/// Builds, loads and returns the selectors for `pcpu_id`'s GDT/TSS. Called
/// once per pCPU during bring-up, from the pCPU it configures (so that
/// `load`'s `lgdt`/segment reloads take effect on the right core).
///
/// # Safety
/// Must be called at most once per `pcpu_id`, and only by the pCPU whose
/// descriptor tables are being installed.
pub unsafe fn init_pcpu_gdt(pcpu_id: usize) -> GdtSelectors {
    assert!(pcpu_id < MAX_PCPU_NUM, "pcpu_id out of range");
    // SAFETY: caller guarantees exclusive, one-time access for this `pcpu_id`.
    let entry = unsafe { &mut *core::ptr::addr_of_mut!(PCPU_GDTS[pcpu_id]) };
    entry.init();
    entry.load();
    entry.selectors()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_populates_distinct_ist_stack_tops() {
        let mut gdt = PcpuGdt::new();
        gdt.init();
        let top_mc = gdt.tss.interrupt_stack_table[(IST_MACHINE_CHECK - 1) as usize];
        let top_df = gdt.tss.interrupt_stack_table[(IST_DOUBLE_FAULT - 1) as usize];
        let top_sf = gdt.tss.interrupt_stack_table[(IST_STACK_FAULT - 1) as usize];
        assert_ne!(top_mc, VirtAddr::zero());
        assert_ne!(top_mc, top_df);
        assert_ne!(top_df, top_sf);
    }

    #[test]
    fn init_pcpu_gdt_returns_usable_selectors() {
        let selectors = unsafe { init_pcpu_gdt(0) };
        assert_ne!(selectors.code.0, 0);
        assert_ne!(selectors.tss.0, 0);
    }
}
