//! Mach-O loader.
//!
//! Segments are mapped relative to `__TEXT`, dyld rebase entries are slid to the new base,
//! and bindings are resolved either all at once or, on a native target, on first call
//! through the stub binder trampolines in [`crate::lazy`].
//!
//! Loaders are boxed: lazy binding stores the loader's address inside the loaded image.

use std::collections::HashMap;
use std::path::Path;

use tracing::{debug, info, info_span, warn, Span};

use super::{check_supported, map_image, BindMode, Loader};
use crate::arch::Arch;
use crate::binary::dyld::{BindClass, BindingInfo, RebaseKind};
use crate::binary::macho::{FatBinary, MachOBinary, RelocationOrigin};
use crate::binary::{rva, Image, Symbol};
use crate::engine::TargetSystem;
use crate::error::{Error, Result};
use crate::lazy;
use crate::utils::page_align;

const STUB_BINDER: &str = "dyld_stub_binder";

pub struct MachOLoader<'a> {
    binary: MachOBinary,
    system: &'a dyn TargetSystem,
    exports: HashMap<String, u64>,
    base_address: u64,
    mem_size: u64,
    span: Span,
}

impl<'a> MachOLoader<'a> {
    /// Detaches the slice of `fat` built for `arch`.
    pub fn take_arch_binary(fat: &mut FatBinary, arch: Arch) -> Option<MachOBinary> {
        fat.take(arch)
    }

    pub fn from_file(
        path: &Path,
        arch: Arch,
        system: &'a dyn TargetSystem,
        bind: BindMode,
    ) -> Result<Box<Self>> {
        info!("Loading {}", path.display());
        let fat = FatBinary::from_file(path)?;
        Self::load_fat(fat, arch, system, bind, &path.display().to_string())
    }

    /// Loads the slice of `fat` built for `arch`.
    pub fn from_fat(
        fat: FatBinary,
        arch: Arch,
        system: &'a dyn TargetSystem,
        bind: BindMode,
    ) -> Result<Box<Self>> {
        Self::load_fat(fat, arch, system, bind, "<memory>")
    }

    pub fn from_binary(
        binary: MachOBinary,
        system: &'a dyn TargetSystem,
        bind: BindMode,
    ) -> Result<Box<Self>> {
        Self::load_binary(binary, system, bind, "<memory>")
    }

    fn load_fat(
        mut fat: FatBinary,
        arch: Arch,
        system: &'a dyn TargetSystem,
        bind: BindMode,
        name: &str,
    ) -> Result<Box<Self>> {
        let Some(binary) = Self::take_arch_binary(&mut fat, arch) else {
            warn!("No slice matches {}", arch);
            return Err(Error::NoMatchingArch(arch));
        };
        Self::load_binary(binary, system, bind, name)
    }

    fn load_binary(
        binary: MachOBinary,
        system: &'a dyn TargetSystem,
        bind: BindMode,
        name: &str,
    ) -> Result<Box<Self>> {
        check_supported(system, &binary)?;
        if bind == BindMode::Lazy && !(system.is_native() && lazy::SUPPORTED) {
            return Err(Error::Unsupported(
                "lazy binding needs a native x86_64 or aarch64 target",
            ));
        }
        let exports = binary
            .symbols
            .iter()
            .map(|s| (s.name.clone(), s.value))
            .collect();
        let mut loader = Box::new(Self {
            binary,
            system,
            exports,
            base_address: 0,
            mem_size: 0,
            span: info_span!("macho", path = %name),
        });
        loader.load(bind)?;
        Ok(loader)
    }

    pub fn macho_binary(&self) -> &MachOBinary {
        &self.binary
    }

    fn load(&mut self, bind: BindMode) -> Result<()> {
        let span = self.span.clone();
        let _guard = span.enter();

        let imagebase = self.binary.imagebase;
        let virtual_size = page_align(self.binary.virtual_size());
        debug!("Virtual size: 0x{:x}", virtual_size);

        let base = map_image(self.system, imagebase, virtual_size)?;
        self.base_address = base;
        self.mem_size = virtual_size;

        let mem = self.system.mem();
        for segment in &self.binary.segments {
            // __PAGEZERO and friends have nothing to copy.
            if segment.file_size == 0 || segment.content.is_empty() {
                continue;
            }
            let offset = rva(imagebase, segment.virtual_address);
            debug!("Mapping {} - 0x{:x}", segment.name, offset);
            mem.write(base + offset, &segment.content);
        }

        self.rebase();

        match bind {
            BindMode::NotBind => {}
            BindMode::Default | BindMode::Now => self.bind_now(),
            BindMode::Lazy => self.bind_lazy(),
        }
        Ok(())
    }

    fn slot(&self, address: u64) -> u64 {
        self.base_address + rva(self.binary.imagebase, address)
    }

    fn rebase(&self) {
        let arch = self.binary.arch;
        let mem = self.system.mem();
        let imagebase = self.binary.imagebase;
        for reloc in &self.binary.relocations {
            if reloc.origin == RelocationOrigin::RelocTable {
                warn!("Relocation at 0x{:x} is not handled", reloc.address);
                continue;
            }
            let slot = self.slot(reloc.address);
            match reloc.kind {
                RebaseKind::Pointer => {
                    let mut value = mem.read_ptr(arch, slot);
                    if value >= imagebase {
                        value -= imagebase;
                    }
                    mem.write_ptr(arch, slot, self.base_address + value);
                }
                RebaseKind::Threaded { target } => {
                    mem.write_ptr(arch, slot, self.base_address + rva(imagebase, target));
                }
                kind => warn!("Rebase {:?} not supported yet", kind),
            }
        }
    }

    /// Resolves one binding and writes it. Unresolved symbols leave the slot untouched.
    fn bind(&self, info: &BindingInfo) -> u64 {
        let addr = self.system.symlink(self, &Symbol::import(info.symbol.as_str()));
        if addr == 0 {
            warn!("Can't resolve {}", info.symbol);
            return 0;
        }
        let slot = self.slot(info.address);
        let value = addr.wrapping_add_signed(info.addend);
        info!(
            "Symbol {} resolves to address 0x{:x}, stored at address 0x{:x}",
            info.symbol, value, slot
        );
        self.system.mem().write_ptr(self.binary.arch, slot, value);
        value
    }

    fn bind_now(&self) {
        for info in &self.binary.bindings {
            if matches!(
                info.class,
                BindClass::Lazy | BindClass::Standard | BindClass::Threaded
            ) {
                self.bind(info);
            }
        }
    }

    fn bind_lazy(&self) {
        let Some(binder) = self.binary.binding(STUB_BINDER) else {
            warn!(
                "{} is not imported, every symbol is bound eagerly",
                STUB_BINDER
            );
            self.bind_now();
            return;
        };

        for info in &self.binary.bindings {
            if matches!(info.class, BindClass::Standard | BindClass::Threaded)
                && info.symbol != STUB_BINDER
            {
                self.bind(info);
            }
        }

        let Some(first) = self.binary.bindings_of(BindClass::Lazy).next() else {
            return;
        };

        let arch = self.binary.arch;
        let mem = self.system.mem();
        let binder_slot = self.slot(binder.address);

        // A lazy pointer initially targets its stub helper entry.
        mem.write_ptr(arch, binder_slot, lazy::dry_call_address());
        let helper = mem.read_ptr(arch, self.slot(first.address));
        let cache = if self.contains_address(helper) {
            // SAFETY: `helper` is inside the mapped image and the binder slot holds the
            // dry call.
            unsafe { lazy::probe_cache_cell(helper) }
        } else {
            0
        };
        if !self.contains_address(cache) {
            warn!(
                "Can't locate the image cache (helper 0x{:x}), binding lazy symbols now",
                helper
            );
            self.bind_lazy_entries_now();
            return;
        }

        debug!("Image cache at 0x{:x}", cache);
        mem.write_ptr(arch, cache, self as *const Self as usize as u64);
        mem.write_ptr(arch, binder_slot, lazy::trampoline_address());
    }

    fn bind_lazy_entries_now(&self) {
        for info in self.binary.bindings_of(BindClass::Lazy) {
            self.bind(info);
        }
    }

    /// Binds the lazy entry recorded at `offset` in the lazy bind stream and returns its
    /// address. `None` if no entry starts there.
    pub fn resolve_lazy(&self, offset: u64) -> Option<u64> {
        let _guard = self.span.enter();
        let info = self
            .binary
            .bindings_of(BindClass::Lazy)
            .find(|info| info.lazy_offset == offset)?;
        Some(self.bind(info))
    }
}

impl Loader for MachOLoader<'_> {
    fn symbol_address(&self, name: &str) -> u64 {
        let value = self
            .exports
            .get(name)
            .or_else(|| self.exports.get(&format!("_{}", name)));
        match value {
            Some(&value) => self.base_address + rva(self.binary.imagebase, value),
            None => 0,
        }
    }

    fn entrypoint(&self) -> u64 {
        self.base_address + rva(self.binary.imagebase, self.binary.entrypoint)
    }

    fn base_address(&self) -> u64 {
        self.base_address
    }

    fn mem_size(&self) -> u64 {
        self.mem_size
    }

    fn binary(&self) -> &dyn Image {
        &self.binary
    }

    fn arch(&self) -> Arch {
        self.binary.arch
    }
}
