//! Low-level primitives: MSR/CPUID access, atomics, bit operations and
//! IRQ-safe spinlocks. Every function here is pure with respect to Rust's
//! aliasing rules — the only failure mode is "the instruction faults",
//! which is a hardware-level concern outside what the type system can
//! express, so these are infallible at the Rust boundary.

pub mod atomics;
pub mod bitops;
pub mod cpuid;
pub mod msr;
pub mod spinlock;

pub use atomics::*;
pub use bitops::{ffs64, ffz64_ex};
pub use cpuid::{cpuid, cpuid_subleaf};
pub use msr::{msr_read, msr_write, msr_write_pcpu};
pub use spinlock::{IrqSpinLock, IrqSpinLockGuard};
