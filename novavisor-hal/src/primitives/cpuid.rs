//! CPUID access.

use raw_cpuid::native_cpuid::cpuid_count;

/// Result of a CPUID leaf query.
pub type CpuidResult = (u32, u32, u32, u32);

/// Executes `CPUID` for `leaf`, subleaf 0.
#[inline(always)]
pub fn cpuid(leaf: u32) -> CpuidResult {
    cpuid_subleaf(leaf, 0)
}

/// Executes `CPUID` for `(leaf, subleaf)`.
#[inline(always)]
pub fn cpuid_subleaf(leaf: u32, subleaf: u32) -> CpuidResult {
    let r = cpuid_count(leaf, subleaf);
    (r.eax, r.ebx, r.ecx, r.edx)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn leaf_zero_reports_a_nonzero_max_leaf() {
        let (eax, ..) = cpuid(0);
        assert!(eax > 0, "CPUID.0.EAX should report the highest supported basic leaf");
    }
}
