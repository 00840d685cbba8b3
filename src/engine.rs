//! Target abstraction.
//!
//! A loader never touches memory or resolves symbols on its own. Everything goes through
//! two capabilities:
//! - [`TargetMemory`]: a raw address space (reserve, protect, write, read).
//! - [`TargetSystem`]: a `TargetMemory` plus symbol resolution, architecture checks and
//!   the base address placement policy.
//!
//! The target does not have to be the current process. [`native`] maps into the host
//! process; [`vm`] keeps an owned virtual address space that emulators or tests can read
//! back.
//!
//! Implementations are used from a single thread at a time and need no locking.

use std::collections::HashMap;
use std::ops::BitOr;

use crate::arch::Arch;
use crate::binary::{Image, Symbol};
use crate::loader::Loader;
use crate::utils;

#[cfg(unix)]
pub mod native;
pub mod vm;

/// Memory protection flags for [`TargetMemory::mprotect`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Protection(u32);

impl Protection {
    pub const NONE: Protection = Protection(0);
    pub const READ: Protection = Protection(1);
    pub const WRITE: Protection = Protection(2);
    pub const EXEC: Protection = Protection(4);
    pub const ALL: Protection = Protection(7);

    pub fn bits(self) -> u32 {
        self.0
    }

    pub fn contains(self, other: Protection) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for Protection {
    type Output = Protection;

    fn bitor(self, rhs: Protection) -> Protection {
        Protection(self.0 | rhs.0)
    }
}

/// A raw target address space.
pub trait TargetMemory {
    /// Reserves `len` bytes, ideally at `hint` (0 means anywhere).
    ///
    /// Returns 0 on failure; 0 is never a valid mapping.
    fn mmap(&self, hint: u64, len: usize) -> u64;

    /// Changes the permissions of a region. Best effort.
    fn mprotect(&self, addr: u64, len: usize, prot: Protection) -> bool;

    /// Writes `buf` at `addr`.
    ///
    /// This always succeeds for a previously mapped range; implementations must panic
    /// rather than fail silently.
    fn write(&self, addr: u64, buf: &[u8]);

    /// Fills `buf` from `addr`. Same contract as [`TargetMemory::write`].
    fn read(&self, addr: u64, buf: &mut [u8]);

    /// Writes a pointer-sized value using `arch`'s width and byte order.
    fn write_ptr(&self, arch: Arch, addr: u64, value: u64) {
        let mut buf = [0u8; 8];
        let buf = &mut buf[..arch.pointer_size()];
        utils::store(arch.endianness, buf, value);
        self.write(addr, buf);
    }

    /// Reads a pointer-sized value using `arch`'s width and byte order.
    fn read_ptr(&self, arch: Arch, addr: u64) -> u64 {
        let mut buf = [0u8; 8];
        let buf = &mut buf[..arch.pointer_size()];
        self.read(addr, buf);
        utils::load(arch.endianness, buf)
    }
}

/// The system a binary is loaded into.
pub trait TargetSystem {
    /// The memory this system maps binaries into.
    fn mem(&self) -> &dyn TargetMemory;

    /// Resolves an external symbol to an absolute address in the target.
    ///
    /// Returning 0 means "unresolved". Loaders tolerate it and leave the slot at 0.
    fn symlink(&self, loader: &dyn Loader, symbol: &Symbol) -> u64;

    /// Whether this system can run `binary`. Every factory checks this first.
    fn supports(&self, binary: &dyn Image) -> bool;

    /// Preferred base address for an image of `virtual_size` bytes whose headers ask for
    /// `binary_base`. 0 lets the memory pick.
    fn base_address_hint(&self, binary_base: u64, virtual_size: u64) -> u64;

    /// Whether the target memory is the current process, so loaded code can call back
    /// into this crate (required for Mach-O lazy binding).
    fn is_native(&self) -> bool {
        false
    }
}

/// External symbol resolution policy, plugged into the provided target systems.
pub trait Resolver {
    fn resolve(&self, loader: &dyn Loader, symbol: &Symbol) -> u64;
}

impl<F> Resolver for F
where
    F: Fn(&dyn Loader, &Symbol) -> u64,
{
    fn resolve(&self, loader: &dyn Loader, symbol: &Symbol) -> u64 {
        self(loader, symbol)
    }
}

impl Resolver for HashMap<String, u64> {
    fn resolve(&self, _loader: &dyn Loader, symbol: &Symbol) -> u64 {
        self.get(&symbol.name).copied().unwrap_or(0)
    }
}
