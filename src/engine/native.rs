//! Native target.
//!
//! Loads binaries into the current process so they can be called directly. Memory comes
//! from anonymous `mmap` regions, external symbols from the dynamic linker.

use std::cell::RefCell;
use std::collections::HashMap;
use std::ffi::{CStr, CString};
use std::path::PathBuf;
use std::ptr;

use tracing::{debug, warn};

use super::{Protection, Resolver, TargetMemory, TargetSystem};
use crate::arch::Arch;
use crate::binary::{Format, Image, Symbol};
use crate::loader::Loader;

const _: () = assert!(
    std::mem::size_of::<usize>() <= std::mem::size_of::<u64>(),
    "native targets with pointers wider than 64 bits are not supported"
);

fn prot_flags(prot: Protection) -> libc::c_int {
    let mut flags = libc::PROT_NONE;
    if prot.contains(Protection::READ) {
        flags |= libc::PROT_READ;
    }
    if prot.contains(Protection::WRITE) {
        flags |= libc::PROT_WRITE;
    }
    if prot.contains(Protection::EXEC) {
        flags |= libc::PROT_EXEC;
    }
    flags
}

/// The current process' address space.
#[derive(Debug, Default)]
pub struct NativeMemory;

impl NativeMemory {
    pub fn new() -> Self {
        Self
    }
}

impl TargetMemory for NativeMemory {
    fn mmap(&self, hint: u64, len: usize) -> u64 {
        // SAFETY: anonymous private mapping, the hint is only advisory without MAP_FIXED.
        let addr = unsafe {
            libc::mmap(
                hint as usize as *mut libc::c_void,
                len,
                prot_flags(Protection::ALL),
                libc::MAP_PRIVATE | libc::MAP_ANON,
                -1,
                0,
            )
        };
        if addr == libc::MAP_FAILED {
            warn!(
                "mmap(0x{:x}, 0x{:x}) failed: {}",
                hint,
                len,
                std::io::Error::last_os_error()
            );
            return 0;
        }
        addr as usize as u64
    }

    fn mprotect(&self, addr: u64, len: usize, prot: Protection) -> bool {
        // SAFETY: the kernel validates the range; a bad range only makes the call fail.
        unsafe { libc::mprotect(addr as usize as *mut libc::c_void, len, prot_flags(prot)) == 0 }
    }

    fn write(&self, addr: u64, buf: &[u8]) {
        // SAFETY: callers only write inside ranges returned by `mmap`.
        unsafe { ptr::copy_nonoverlapping(buf.as_ptr(), addr as usize as *mut u8, buf.len()) }
    }

    fn read(&self, addr: u64, buf: &mut [u8]) {
        // SAFETY: reads target mapped image memory or symbols returned by the resolver.
        unsafe { ptr::copy_nonoverlapping(addr as usize as *const u8, buf.as_mut_ptr(), buf.len()) }
    }
}

/// The current process as a target system.
///
/// Accepts only binaries built for [`Arch::native`]; external symbols go through `R`.
pub struct NativeSystem<'m, R> {
    mem: &'m NativeMemory,
    resolver: R,
    base_hint: u64,
}

impl<'m, R: Resolver> NativeSystem<'m, R> {
    pub fn new(mem: &'m NativeMemory, resolver: R) -> Self {
        Self {
            mem,
            resolver,
            base_hint: 0,
        }
    }

    /// Asks `mmap` to place images at `base`. 0 (the default) lets the kernel choose.
    pub fn with_base_hint(mut self, base: u64) -> Self {
        self.base_hint = base;
        self
    }
}

impl<R: Resolver> TargetSystem for NativeSystem<'_, R> {
    fn mem(&self) -> &dyn TargetMemory {
        self.mem
    }

    fn symlink(&self, loader: &dyn Loader, symbol: &Symbol) -> u64 {
        self.resolver.resolve(loader, symbol)
    }

    fn supports(&self, binary: &dyn Image) -> bool {
        binary.arch() == Arch::native()
    }

    fn base_address_hint(&self, _binary_base: u64, _virtual_size: u64) -> u64 {
        self.base_hint
    }

    fn is_native(&self) -> bool {
        true
    }
}

/// Resolves symbols through the host dynamic linker.
///
/// Lookup order: the global namespace, then each library imported by the binary, then
/// the extra libraries given to [`DlsymResolver::with_library`]. Opened handles are cached
/// by name.
#[derive(Default)]
pub struct DlsymResolver {
    overrides: HashMap<String, u64>,
    libraries: Vec<PathBuf>,
    handles: RefCell<HashMap<String, usize>>,
}

impl DlsymResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolves `name` to `addr` without asking the dynamic linker.
    pub fn with_override(mut self, name: &str, addr: u64) -> Self {
        self.overrides.insert(name.to_string(), addr);
        self
    }

    /// Searches `path` after the binary's own imports.
    pub fn with_library(mut self, path: impl Into<PathBuf>) -> Self {
        self.libraries.push(path.into());
        self
    }

    fn handle(&self, library: &str) -> Option<usize> {
        if let Some(&handle) = self.handles.borrow().get(library) {
            return (handle != 0).then_some(handle);
        }
        let handle = match CString::new(library) {
            // SAFETY: `name` is a valid NUL-terminated string.
            Ok(name) => (unsafe { libc::dlopen(name.as_ptr(), libc::RTLD_NOW) }) as usize,
            Err(_) => 0,
        };
        if handle == 0 {
            warn!("Can't load {}: {}", library, dlerror());
        }
        self.handles.borrow_mut().insert(library.to_string(), handle);
        (handle != 0).then_some(handle)
    }

    fn lookup(handle: *mut libc::c_void, name: &CStr) -> u64 {
        // SAFETY: `handle` is RTLD_DEFAULT or a live handle returned by dlopen.
        unsafe { libc::dlsym(handle, name.as_ptr()) as usize as u64 }
    }
}

fn dlerror() -> String {
    // SAFETY: dlerror returns NULL or a NUL-terminated string owned by libc.
    let msg = unsafe { libc::dlerror() };
    if msg.is_null() {
        return "unknown error".to_string();
    }
    unsafe { CStr::from_ptr(msg) }.to_string_lossy().into_owned()
}

impl Resolver for DlsymResolver {
    fn resolve(&self, loader: &dyn Loader, symbol: &Symbol) -> u64 {
        if let Some(&addr) = self.overrides.get(&symbol.name) {
            return addr;
        }
        let binary = loader.binary();
        let name = match binary.format() {
            Format::MachO => symbol.name.strip_prefix('_').unwrap_or(&symbol.name),
            _ => symbol.name.as_str(),
        };
        let Ok(cname) = CString::new(name) else {
            return 0;
        };

        let addr = Self::lookup(libc::RTLD_DEFAULT, &cname);
        if addr != 0 {
            return addr;
        }

        let extra = self.libraries.iter().map(|p| p.to_string_lossy().into_owned());
        for library in binary.libraries().iter().cloned().chain(extra) {
            let Some(handle) = self.handle(&library) else {
                continue;
            };
            let addr = Self::lookup(handle as *mut libc::c_void, &cname);
            if addr != 0 {
                debug!("{} found in {}", name, library);
                return addr;
            }
        }

        warn!("Can't resolve {}", symbol.name);
        0
    }
}
