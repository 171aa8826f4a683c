#![no_std]
#![deny(unsafe_op_in_unsafe_fn)]

//! Architecture-independent hypervisor policy: VM lifecycle, the guest
//! memory model, interrupt remapping, and the per-pCPU bring-up sequence,
//! built on top of `novavisor-hal`'s x86-64/VT-x/VT-d primitives.
//!
//! Nothing in this crate allocates — every object this design needs is
//! sized and owned by a fixed-capacity array declared up front, matching
//! the partitioned, statically-configured nature of the host it runs on.

pub mod config;
pub mod e820;
pub mod ept;
pub mod error;
pub mod exit;
pub mod hypervisor;
pub mod irq;
pub mod log;
pub mod msi;
pub mod pcpu;
pub mod ptirq;
pub mod sched;
pub mod vcpu;
