//! x86_64 relocation backend.
//!
//! Handles the dynamic relocation types a linked x86_64 image carries. Anything else is
//! reported and skipped.

use object::elf;
use tracing::{trace, warn};

use crate::binary::elf::ElfRelocation;
use crate::loader::elf::ElfLoader;
use crate::loader::Loader;

pub fn relocate(loader: &ElfLoader<'_>, reloc: &ElfRelocation) {
    let slot = loader.slot(reloc.address);
    match reloc.kind {
        elf::R_X86_64_NONE => {}

        // S + A
        elf::R_X86_64_64 => {
            let value = loader.resolve_symbol(reloc).wrapping_add_signed(reloc.addend);
            loader.write_ptr(slot, value);
        }

        // B + A
        elf::R_X86_64_RELATIVE => {
            let value = loader.base_address().wrapping_add_signed(reloc.addend);
            loader.write_ptr(slot, value);
        }

        // S
        elf::R_X86_64_GLOB_DAT | elf::R_X86_64_JUMP_SLOT => {
            let value = loader.resolve_symbol(reloc);
            trace!("0x{:x} <- 0x{:x}", slot, value);
            loader.write_ptr(slot, value);
        }

        elf::R_X86_64_COPY => loader.copy_relocation(reloc, slot),

        other => warn!("Relocation type {} is not supported", other),
    }
}
