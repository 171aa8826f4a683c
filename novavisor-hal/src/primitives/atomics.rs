//! Thin, fully-sequentially-consistent wrappers over the `core::sync::atomic`
//! primitives this design's shared-state paths need. Kept as free functions
//! (rather than re-exporting `core::sync::atomic` types directly) so call
//! sites read the same way the original C `atomic_*` API did, and so the
//! ordering policy is fixed in one place instead of re-decided per call.

use core::sync::atomic::{AtomicU16, AtomicU32, Ordering};

#[inline]
pub fn atomic_load32(a: &AtomicU32) -> u32 {
    a.load(Ordering::SeqCst)
}

#[inline]
pub fn atomic_store32(a: &AtomicU32, val: u32) {
    a.store(val, Ordering::SeqCst)
}

#[inline]
pub fn atomic_set32(a: &AtomicU32, mask: u32) -> u32 {
    a.fetch_or(mask, Ordering::SeqCst)
}

#[inline]
pub fn atomic_clear32(a: &AtomicU32, mask: u32) -> u32 {
    a.fetch_and(!mask, Ordering::SeqCst)
}

#[inline]
pub fn atomic_cmpxchg64(a: &core::sync::atomic::AtomicU64, current: u64, new: u64) -> u64 {
    match a.compare_exchange(current, new, Ordering::SeqCst, Ordering::SeqCst) {
        Ok(prev) => prev,
        Err(prev) => prev,
    }
}

#[inline]
pub fn atomic_inc16(a: &AtomicU16) -> u16 {
    a.fetch_add(1, Ordering::SeqCst)
}

#[inline]
pub fn atomic_dec16(a: &AtomicU16) -> u16 {
    a.fetch_sub(1, Ordering::SeqCst)
}

#[inline]
pub fn atomic_xadd16(a: &AtomicU16, val: u16) -> u16 {
    a.fetch_add(val, Ordering::SeqCst)
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::sync::atomic::AtomicU64;

    #[test]
    fn set_and_clear_32_round_trip() {
        let a = AtomicU32::new(0);
        let prev = atomic_set32(&a, 0b101);
        assert_eq!(prev, 0);
        assert_eq!(atomic_load32(&a), 0b101);
        atomic_clear32(&a, 0b100);
        assert_eq!(atomic_load32(&a), 0b001);
    }

    #[test]
    fn cmpxchg64_succeeds_only_on_match() {
        let a = AtomicU64::new(10);
        assert_eq!(atomic_cmpxchg64(&a, 10, 20), 10);
        assert_eq!(a.load(Ordering::SeqCst), 20);
        assert_eq!(atomic_cmpxchg64(&a, 10, 99), 20);
        assert_eq!(a.load(Ordering::SeqCst), 20);
    }

    #[test]
    fn inc_dec_xadd16() {
        let a = AtomicU16::new(5);
        assert_eq!(atomic_inc16(&a), 5);
        assert_eq!(atomic_dec16(&a), 6);
        assert_eq!(atomic_xadd16(&a, 10), 5);
        assert_eq!(a.load(Ordering::SeqCst), 15);
    }
}
