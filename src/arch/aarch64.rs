//! AArch64 relocation backend.

use object::elf;
use tracing::warn;

use crate::binary::elf::ElfRelocation;
use crate::loader::elf::ElfLoader;
use crate::loader::Loader;

pub fn relocate(loader: &ElfLoader<'_>, reloc: &ElfRelocation) {
    let slot = loader.slot(reloc.address);
    match reloc.kind {
        elf::R_AARCH64_NONE => {}

        elf::R_AARCH64_RELATIVE => {
            let value = loader.base_address().wrapping_add_signed(reloc.addend);
            loader.write_ptr(slot, value);
        }

        // The addend applies to GOT and PLT slots as well.
        elf::R_AARCH64_ABS64 | elf::R_AARCH64_GLOB_DAT | elf::R_AARCH64_JUMP_SLOT => {
            let value = loader.resolve_symbol(reloc).wrapping_add_signed(reloc.addend);
            loader.write_ptr(slot, value);
        }

        elf::R_AARCH64_COPY => loader.copy_relocation(reloc, slot),

        other => warn!("Relocation type {} is not supported", other),
    }
}
