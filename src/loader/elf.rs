//! ELF loader.
//!
//! Maps `PT_LOAD` segments, applies the dynamic relocations through the backend selected
//! by `e_machine` (see [`crate::arch::relocator`]) and, unless told otherwise, binds the
//! PLT/GOT eagerly.

use std::collections::HashMap;
use std::ffi::c_void;
use std::path::Path;

use object::elf;
use tracing::{debug, error, info, info_span, warn, Span};

use super::{check_supported, map_image, BindMode, Loader};
use crate::arch::{self, Arch};
use crate::binary::elf::{ElfBinary, ElfRelocation};
use crate::binary::{rva, Image, Symbol};
use crate::engine::TargetSystem;
use crate::error::{Error, Result};
use crate::utils::{page_align, page_offset};

/// Slots at the start of the GOT reserved for the dynamic linker.
const GOT_RESERVED_ENTRIES: u64 = 3;

pub struct ElfLoader<'a> {
    binary: ElfBinary,
    system: &'a dyn TargetSystem,
    /// Symbols the image defines, by name.
    exports: HashMap<String, Symbol>,
    base_address: u64,
    mem_size: u64,
    span: Span,
}

impl<'a> ElfLoader<'a> {
    pub fn from_file(path: &Path, system: &'a dyn TargetSystem, bind: BindMode) -> Result<Self> {
        info!("Loading {}", path.display());
        let binary = ElfBinary::from_file(path)?;
        Self::load_binary(binary, system, bind, &path.display().to_string())
    }

    pub fn from_binary(
        binary: ElfBinary,
        system: &'a dyn TargetSystem,
        bind: BindMode,
    ) -> Result<Self> {
        Self::load_binary(binary, system, bind, "<memory>")
    }

    fn load_binary(
        binary: ElfBinary,
        system: &'a dyn TargetSystem,
        bind: BindMode,
        name: &str,
    ) -> Result<Self> {
        check_supported(system, &binary)?;
        if bind == BindMode::Lazy {
            return Err(Error::Unsupported("lazy binding of ELF images"));
        }
        let mut loader = Self::new(binary, system, name);
        loader.load(bind)?;
        Ok(loader)
    }

    fn new(binary: ElfBinary, system: &'a dyn TargetSystem, name: &str) -> Self {
        let mut exports = HashMap::new();
        for symbol in &binary.dynamic_symbols {
            if symbol.value > 0 && !symbol.name.is_empty() {
                exports.insert(symbol.name.clone(), symbol.clone());
            }
        }
        for symbol in &binary.symbols {
            exports
                .entry(symbol.name.clone())
                .or_insert_with(|| symbol.clone());
        }
        Self {
            binary,
            system,
            exports,
            base_address: 0,
            mem_size: 0,
            span: info_span!("elf", path = %name),
        }
    }

    pub fn elf_binary(&self) -> &ElfBinary {
        &self.binary
    }

    fn load(&mut self, bind: BindMode) -> Result<()> {
        let span = self.span.clone();
        let _guard = span.enter();

        let imagebase = self.binary.imagebase();
        let virtual_size = page_align(self.binary.virtual_size() - page_offset(imagebase));
        debug!("Virtual size: 0x{:x}", virtual_size);

        let base = map_image(self.system, imagebase, virtual_size)?;
        self.base_address = base;
        self.mem_size = virtual_size;

        let mem = self.system.mem();
        for segment in self.binary.load_segments() {
            let offset = rva(imagebase, segment.virtual_address);
            debug!("Mapping PT_LOAD at 0x{:x}", offset);
            if !segment.content.is_empty() {
                mem.write(base + offset, &segment.content);
            }
        }

        let Some(relocate) = arch::relocator(self.binary.machine) else {
            warn!(
                "Relocations are not supported for e_machine {}",
                self.binary.machine
            );
            return Ok(());
        };

        for reloc in &self.binary.dynamic_relocations {
            relocate(self, reloc);
        }

        if bind.is_now() {
            self.bind_now(relocate);
        }
        Ok(())
    }

    fn bind_now(&self, relocate: arch::Relocator) {
        for reloc in &self.binary.pltgot_relocations {
            relocate(self, reloc);
        }
    }

    /// Address of the relocated slot for a link-time address.
    pub(crate) fn slot(&self, address: u64) -> u64 {
        self.base_address + rva(self.binary.imagebase(), address)
    }

    pub(crate) fn write_ptr(&self, addr: u64, value: u64) {
        self.system.mem().write_ptr(self.binary.arch, addr, value);
    }

    pub(crate) fn relocation_symbol(&self, reloc: &ElfRelocation) -> Option<&Symbol> {
        self.binary.symbol(reloc.symbol)
    }

    /// Address of the symbol a relocation refers to, 0 if it has none.
    pub(crate) fn resolve_symbol(&self, reloc: &ElfRelocation) -> u64 {
        match self.relocation_symbol(reloc) {
            Some(symbol) => self.resolve_or_symlink(symbol),
            None => 0,
        }
    }

    /// Looks `symbol` up in the image's own exports before asking the target.
    pub(crate) fn resolve_or_symlink(&self, symbol: &Symbol) -> u64 {
        match self.exports.get(&symbol.name) {
            Some(export) => self.base_address + rva(self.binary.imagebase(), export.value),
            None => self.system.symlink(self, symbol),
        }
    }

    /// Copies an externally defined object into the slot at `slot`.
    pub(crate) fn copy_relocation(&self, reloc: &ElfRelocation, slot: u64) {
        let Some(symbol) = self.relocation_symbol(reloc) else {
            warn!("Copy relocation at 0x{:x} without a symbol", reloc.address);
            return;
        };
        let source = self.system.symlink(self, symbol);
        if source == 0 {
            warn!("Can't resolve {} for a copy relocation", symbol.name);
            return;
        }
        let mem = self.system.mem();
        let mut buf = vec![0u8; symbol.size as usize];
        mem.read(source, &mut buf);
        mem.write(slot, &buf);
    }

    /// Resolves one PLT entry at run time.
    ///
    /// `hint` is what the PLT stub hands to the resolver: the relocation index on x86-64,
    /// the address of the GOT slot on AArch64. The resolved address is written to the GOT
    /// slot and returned so the stub can jump to it. Returns 0 for an unknown entry.
    pub fn dl_resolve(&self, hint: u64) -> u64 {
        let _guard = self.span.enter();

        let mut index = hint;
        if self.binary.machine == elf::EM_AARCH64 {
            let got = self.slot(self.binary.pltgot.unwrap_or(0));
            let pointer_size = self.binary.arch.pointer_size() as u64;
            index = (hint.wrapping_sub(got) / pointer_size).wrapping_sub(GOT_RESERVED_ENTRIES);
        }

        let Some(reloc) = self.binary.pltgot_relocations.get(index as usize) else {
            error!("PLT index out of range: {}", index);
            return 0;
        };
        let Some(symbol) = self.relocation_symbol(reloc) else {
            error!("PLT relocation #{} has no symbol", index);
            return 0;
        };
        let addr = self.system.symlink(self, symbol);
        info!("Address of {}: 0x{:x}", symbol.name, addr);
        self.write_ptr(self.slot(reloc.address), addr);
        addr
    }
}

/// C entry point of [`ElfLoader::dl_resolve`] for PLT trampolines.
///
/// # Safety
///
/// `loader` must be null or point to a live `ElfLoader`.
#[no_mangle]
pub unsafe extern "C" fn xld_elf_dl_resolve(loader: *const c_void, hint: u64) -> u64 {
    // SAFETY: guaranteed by the caller.
    match unsafe { loader.cast::<ElfLoader<'static>>().as_ref() } {
        Some(loader) => loader.dl_resolve(hint),
        None => 0,
    }
}

impl Loader for ElfLoader<'_> {
    fn symbol_address(&self, name: &str) -> u64 {
        match self.exports.get(name) {
            Some(symbol) => self.base_address + rva(self.binary.imagebase(), symbol.value),
            None => 0,
        }
    }

    fn entrypoint(&self) -> u64 {
        self.base_address + rva(self.binary.imagebase(), self.binary.entrypoint)
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
