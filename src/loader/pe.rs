//! PE loader.

use std::collections::HashMap;
use std::path::Path;

use object::pe;
use tracing::{debug, info, info_span, warn, Span};

use super::{check_supported, map_image, BindMode, Loader};
use crate::arch::Arch;
use crate::binary::pe::{PeBinary, PeImportEntry};
use crate::binary::{rva, Image, Symbol};
use crate::engine::TargetSystem;
use crate::error::{Error, Result};
use crate::utils::page_align;

pub struct PeLoader<'a> {
    binary: PeBinary,
    system: &'a dyn TargetSystem,
    /// Exported RVAs, by name.
    exports: HashMap<String, u64>,
    base_address: u64,
    mem_size: u64,
    span: Span,
}

impl<'a> PeLoader<'a> {
    pub fn from_file(path: &Path, system: &'a dyn TargetSystem, bind: BindMode) -> Result<Self> {
        info!("Loading {}", path.display());
        let binary = PeBinary::from_file(path)?;
        Self::load_binary(binary, system, bind, &path.display().to_string())
    }

    pub fn from_binary(
        binary: PeBinary,
        system: &'a dyn TargetSystem,
        bind: BindMode,
    ) -> Result<Self> {
        Self::load_binary(binary, system, bind, "<memory>")
    }

    fn load_binary(
        binary: PeBinary,
        system: &'a dyn TargetSystem,
        bind: BindMode,
        name: &str,
    ) -> Result<Self> {
        check_supported(system, &binary)?;
        if bind == BindMode::Lazy {
            return Err(Error::Unsupported("lazy binding of PE images"));
        }
        let exports = binary
            .exports
            .iter()
            .map(|s| (s.name.clone(), s.value))
            .collect();
        let mut loader = Self {
            binary,
            system,
            exports,
            base_address: 0,
            mem_size: 0,
            span: info_span!("pe", path = %name),
        };
        loader.load(bind)?;
        Ok(loader)
    }

    pub fn pe_binary(&self) -> &PeBinary {
        &self.binary
    }

    fn load(&mut self, bind: BindMode) -> Result<()> {
        let span = self.span.clone();
        let _guard = span.enter();

        let virtual_size = page_align(self.binary.size_of_image);
        debug!("Virtual size: 0x{:x}", virtual_size);

        let base = map_image(self.system, self.binary.imagebase, virtual_size)?;
        self.base_address = base;
        self.mem_size = virtual_size;

        let mem = self.system.mem();
        let headers = &self.binary.headers;
        mem.write(base, &headers[..headers.len().min(virtual_size as usize)]);

        for section in &self.binary.sections {
            let offset = u64::from(section.virtual_address);
            if section.content.is_empty() || offset >= virtual_size {
                continue;
            }
            // Raw data is padded to the file alignment and may run past the section.
            let mut len = section.content.len() as u64;
            if section.virtual_size != 0 {
                len = len.min(u64::from(section.virtual_size));
            }
            len = len.min(virtual_size - offset);
            debug!("Mapping {} - 0x{:x}", section.name, offset);
            mem.write(base + offset, &section.content[..len as usize]);
        }

        self.relocate();

        if bind.is_now() {
            self.bind_imports();
        }
        Ok(())
    }

    fn relocate(&self) {
        let delta = self.base_address.wrapping_sub(self.binary.imagebase);
        if delta == 0 {
            return;
        }
        let mem = self.system.mem();
        let arch = self.binary.arch;
        for reloc in &self.binary.relocations {
            let slot = self.base_address + u64::from(reloc.rva);
            match reloc.kind {
                pe::IMAGE_REL_BASED_ABSOLUTE => {}
                pe::IMAGE_REL_BASED_DIR64 => {
                    let value = mem.read_ptr(arch, slot);
                    mem.write_ptr(arch, slot, value.wrapping_add(delta));
                }
                pe::IMAGE_REL_BASED_HIGHLOW => {
                    let mut buf = [0u8; 4];
                    mem.read(slot, &mut buf);
                    let value = u32::from_le_bytes(buf).wrapping_add(delta as u32);
                    mem.write(slot, &value.to_le_bytes());
                }
                kind => warn!("Base relocation type {} at 0x{:x} not supported", kind, reloc.rva),
            }
        }
    }

    fn bind_imports(&self) {
        for import in &self.binary.imports {
            debug!("Binding imports of {}", import.library);
            for entry in &import.entries {
                self.bind(entry);
            }
        }
    }

    fn bind(&self, entry: &PeImportEntry) {
        let slot = self.base_address + u64::from(entry.iat_rva);
        let addr = match (&entry.name, entry.ordinal) {
            (Some(name), _) => {
                let addr = self.system.symlink(self, &Symbol::import(name.as_str()));
                if addr == 0 {
                    warn!("Can't resolve {}", name);
                }
                addr
            }
            (None, ordinal) => {
                warn!("Import by ordinal {:?} is not supported", ordinal);
                0
            }
        };
        info!("Import resolves to address 0x{:x}, stored at address 0x{:x}", addr, slot);
        self.system.mem().write_ptr(self.binary.arch, slot, addr);
    }
}

impl Loader for PeLoader<'_> {
    fn symbol_address(&self, name: &str) -> u64 {
        match self.exports.get(name) {
            Some(&value) => self.base_address + value,
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
