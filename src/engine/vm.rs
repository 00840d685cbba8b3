//! Virtual target.
//!
//! An address space backed by owned buffers rather than the host process. Useful to hand a
//! relocated image to an emulator, to inspect the result of a load, or to load binaries
//! built for another architecture.

use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, HashMap};

use tracing::debug;

use super::{Protection, TargetMemory, TargetSystem};
use crate::arch::Arch;
use crate::binary::{Image, Symbol};
use crate::loader::Loader;
use crate::utils::page_align;

/// First address handed out when no usable hint is given.
const DEFAULT_BASE: u64 = 0x1000_0000;

struct Region {
    data: Vec<u8>,
    prot: Protection,
}

/// Sparse address space made of independently allocated regions.
pub struct VmMemory {
    regions: RefCell<BTreeMap<u64, Region>>,
    next: Cell<u64>,
}

impl Default for VmMemory {
    fn default() -> Self {
        Self::new()
    }
}

impl VmMemory {
    pub fn new() -> Self {
        Self {
            regions: RefCell::new(BTreeMap::new()),
            next: Cell::new(DEFAULT_BASE),
        }
    }

    fn overlaps(&self, start: u64, len: u64) -> bool {
        let end = start.saturating_add(len);
        self.regions
            .borrow()
            .iter()
            .any(|(&base, region)| start < base + region.data.len() as u64 && base < end)
    }

    /// Runs `f` on the bytes backing `[addr, addr + len)`.
    ///
    /// Panics if the range is not entirely inside one mapped region.
    fn with_range<T>(&self, addr: u64, len: usize, f: impl FnOnce(&mut [u8]) -> T) -> T {
        let mut regions = self.regions.borrow_mut();
        let found = regions.range_mut(..=addr).next_back().and_then(|(&base, region)| {
            let start = (addr - base) as usize;
            let end = start.checked_add(len)?;
            region.data.get_mut(start..end)
        });
        match found {
            Some(bytes) => f(bytes),
            None => panic!("access to unmapped memory: 0x{:x}+0x{:x}", addr, len),
        }
    }

    /// Protection of the region containing `addr`, if any.
    pub fn protection(&self, addr: u64) -> Option<Protection> {
        let regions = self.regions.borrow();
        let (&base, region) = regions.range(..=addr).next_back()?;
        (addr < base + region.data.len() as u64).then_some(region.prot)
    }

    /// Copies `len` bytes starting at `addr`.
    pub fn read_vec(&self, addr: u64, len: usize) -> Vec<u8> {
        let mut buf = vec![0; len];
        self.read(addr, &mut buf);
        buf
    }
}

impl TargetMemory for VmMemory {
    fn mmap(&self, hint: u64, len: usize) -> u64 {
        if len == 0 {
            return 0;
        }
        let size = page_align(len as u64);
        let addr = if hint != 0 && !self.overlaps(hint, size) {
            hint
        } else {
            let mut addr = self.next.get();
            while self.overlaps(addr, size) {
                addr = page_align(addr + size);
            }
            addr
        };
        self.next.set(self.next.get().max(addr + size));
        self.regions.borrow_mut().insert(
            addr,
            Region {
                data: vec![0; size as usize],
                prot: Protection::ALL,
            },
        );
        debug!("vm: mapped 0x{:x} bytes at 0x{:x}", size, addr);
        addr
    }

    fn mprotect(&self, addr: u64, len: usize, prot: Protection) -> bool {
        let mut regions = self.regions.borrow_mut();
        match regions.get_mut(&addr) {
            Some(region) if len <= region.data.len() => {
                region.prot = prot;
                true
            }
            _ => false,
        }
    }

    fn write(&self, addr: u64, buf: &[u8]) {
        self.with_range(addr, buf.len(), |bytes| bytes.copy_from_slice(buf));
    }

    fn read(&self, addr: u64, buf: &mut [u8]) {
        self.with_range(addr, buf.len(), |bytes| buf.copy_from_slice(bytes));
    }
}

/// A target system over a [`VmMemory`] with a fixed architecture and a static symbol
/// table.
pub struct VmSystem<'m> {
    mem: &'m VmMemory,
    arch: Arch,
    symbols: HashMap<String, u64>,
    base_hint: Option<u64>,
    requests: RefCell<Vec<String>>,
}

impl<'m> VmSystem<'m> {
    pub fn new(mem: &'m VmMemory, arch: Arch) -> Self {
        Self {
            mem,
            arch,
            symbols: HashMap::new(),
            base_hint: None,
            requests: RefCell::new(Vec::new()),
        }
    }

    /// Makes `name` resolve to `addr`.
    pub fn with_symbol(mut self, name: &str, addr: u64) -> Self {
        self.symbols.insert(name.to_string(), addr);
        self
    }

    /// Always place images at `base`. Without it the binary's preferred base is used.
    pub fn with_base_hint(mut self, base: u64) -> Self {
        self.base_hint = Some(base);
        self
    }

    pub fn arch(&self) -> Arch {
        self.arch
    }

    /// Names passed to [`TargetSystem::symlink`], in call order.
    pub fn requests(&self) -> Vec<String> {
        self.requests.borrow().clone()
    }
}

impl TargetSystem for VmSystem<'_> {
    fn mem(&self) -> &dyn TargetMemory {
        self.mem
    }

    fn symlink(&self, _loader: &dyn Loader, symbol: &Symbol) -> u64 {
        self.requests.borrow_mut().push(symbol.name.clone());
        self.symbols.get(&symbol.name).copied().unwrap_or(0)
    }

    fn supports(&self, binary: &dyn Image) -> bool {
        binary.arch() == self.arch
    }

    fn base_address_hint(&self, binary_base: u64, _virtual_size: u64) -> u64 {
        self.base_hint.unwrap_or(binary_base)
    }
}
