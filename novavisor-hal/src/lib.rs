#![no_std]
#![deny(unsafe_op_in_unsafe_fn)]

//! Hardware abstraction layer for novavisor.
//!
//! This crate owns everything that talks directly to silicon: MSR/CPUID
//! access, atomics and spinlocks, the x2APIC and IOAPIC drivers, the VMX
//! VMCS field encodings, the EPT page-table shape, and the VT-d IRTE/DRHD
//! register plumbing. It has no notion of a VM, a vCPU, or a scheduler —
//! those live in `novavisor-core`, which is the only consumer of this crate.
//!
//! Every table in here is fixed-size and allocated statically: this design
//! never creates or destroys VMs at runtime, so there is no `alloc`
//! dependency anywhere in the HAL.

pub mod primitives;
pub mod memory;
pub mod caps;
pub mod pcpu;
pub mod gdt;
pub mod host_state;
pub mod lapic;
pub mod ioapic;
pub mod vmcs;
pub mod ept;
pub mod vtd;
pub mod pio;

pub use memory::PhysicalAddress;
