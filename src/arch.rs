//! Architecture abstraction.
//!
//! This module defines the `Arch` value type describing a binary's instruction-set family,
//! byte order and pointer width, and the table of architecture-specific ELF relocation
//! backends. Each backend lives in its own sub-module so the loaders stay generic.

use std::fmt;

use object::{elf, macho, pe, Endianness};

use crate::binary::elf::ElfRelocation;
use crate::loader::elf::ElfLoader;

pub mod aarch64;
pub mod x86_64;

/// Instruction-set family. 32 and 64-bit variants share a family and are told apart by
/// [`Arch::is_64`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Family {
    X86,
    Arm,
    Arm64,
    Mips,
    PowerPc,
    RiscV,
    #[default]
    Unknown,
}

/// A binary architecture: family, byte order and pointer width.
///
/// Two architectures are compatible only if all three fields are equal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Arch {
    pub family: Family,
    pub endianness: Endianness,
    pub is_64: bool,
}

impl Arch {
    pub const X86: Arch = Arch::new(Family::X86, Endianness::Little, false);
    pub const X86_64: Arch = Arch::new(Family::X86, Endianness::Little, true);
    pub const ARM: Arch = Arch::new(Family::Arm, Endianness::Little, false);
    pub const ARM64: Arch = Arch::new(Family::Arm64, Endianness::Little, true);

    pub const fn new(family: Family, endianness: Endianness, is_64: bool) -> Self {
        Self {
            family,
            endianness,
            is_64,
        }
    }

    /// The architecture of the running process.
    pub const fn native() -> Self {
        let family = if cfg!(any(target_arch = "x86", target_arch = "x86_64")) {
            Family::X86
        } else if cfg!(target_arch = "aarch64") {
            Family::Arm64
        } else if cfg!(target_arch = "arm") {
            Family::Arm
        } else if cfg!(any(target_arch = "mips", target_arch = "mips64")) {
            Family::Mips
        } else if cfg!(any(target_arch = "powerpc", target_arch = "powerpc64")) {
            Family::PowerPc
        } else if cfg!(any(target_arch = "riscv32", target_arch = "riscv64")) {
            Family::RiscV
        } else {
            Family::Unknown
        };
        let endianness = if cfg!(target_endian = "little") {
            Endianness::Little
        } else {
            Endianness::Big
        };
        Self::new(family, endianness, cfg!(target_pointer_width = "64"))
    }

    /// Size in bytes of a pointer on this architecture.
    pub fn pointer_size(&self) -> usize {
        if self.is_64 {
            8
        } else {
            4
        }
    }

    pub(crate) fn from_elf_machine(machine: u16, endianness: Endianness, is_64: bool) -> Self {
        let family = match machine {
            elf::EM_386 | elf::EM_X86_64 => Family::X86,
            elf::EM_ARM => Family::Arm,
            elf::EM_AARCH64 => Family::Arm64,
            elf::EM_MIPS => Family::Mips,
            elf::EM_PPC | elf::EM_PPC64 => Family::PowerPc,
            elf::EM_RISCV => Family::RiscV,
            _ => Family::Unknown,
        };
        Self::new(family, endianness, is_64)
    }

    pub(crate) fn from_macho_cputype(cputype: u32, endianness: Endianness) -> Self {
        let is_64 = cputype & macho::CPU_ARCH_ABI64 != 0;
        let family = match cputype {
            macho::CPU_TYPE_X86 | macho::CPU_TYPE_X86_64 => Family::X86,
            macho::CPU_TYPE_ARM => Family::Arm,
            macho::CPU_TYPE_ARM64 | macho::CPU_TYPE_ARM64_32 => Family::Arm64,
            macho::CPU_TYPE_POWERPC | macho::CPU_TYPE_POWERPC64 => Family::PowerPc,
            macho::CPU_TYPE_MIPS => Family::Mips,
            _ => Family::Unknown,
        };
        Self::new(family, endianness, is_64)
    }

    pub(crate) fn from_pe_machine(machine: u16) -> Self {
        match machine {
            pe::IMAGE_FILE_MACHINE_I386 => Arch::X86,
            pe::IMAGE_FILE_MACHINE_AMD64 => Arch::X86_64,
            pe::IMAGE_FILE_MACHINE_ARMNT | pe::IMAGE_FILE_MACHINE_ARM => Arch::ARM,
            pe::IMAGE_FILE_MACHINE_ARM64 => Arch::ARM64,
            _ => Arch::new(Family::Unknown, Endianness::Little, false),
        }
    }
}

impl fmt::Display for Arch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let endian = match self.endianness {
            Endianness::Little => "le",
            Endianness::Big => "be",
        };
        let bits = if self.is_64 { 64 } else { 32 };
        write!(f, "{:?}/{}/{}", self.family, bits, endian)
    }
}

/// Applies one dynamic relocation of an ELF image, writing through the loader's target.
pub type Relocator = fn(&ElfLoader<'_>, &ElfRelocation);

/// Relocation backends keyed by ELF `e_machine`.
const RELOCATORS: &[(u16, Relocator)] = &[
    (elf::EM_X86_64, x86_64::relocate),
    (elf::EM_AARCH64, aarch64::relocate),
];

/// Looks up the relocation backend for an ELF machine type.
pub fn relocator(machine: u16) -> Option<Relocator> {
    RELOCATORS
        .iter()
        .find(|(m, _)| *m == machine)
        .map(|(_, relocate)| *relocate)
}
