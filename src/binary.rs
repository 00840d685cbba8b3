//! Parsed binaries.
//!
//! Loaders consume owned, read-only views of a binary rather than raw bytes. This module
//! builds them with the `object` crate:
//! - `elf`: PT_LOAD segments, dynamic symbols and the dynamic/PLT relocation tables.
//! - `macho`: thin and fat images, segments, dyld rebase and binding info.
//! - `pe`: sections, base relocations, imports and exports.
//!
//! The [`Image`] trait exposes what every format shares; target systems use it to decide
//! whether they accept a binary.

use std::fs::File;
use std::path::Path;

use memmap2::Mmap;

use crate::arch::Arch;
use crate::error::{Error, Result};

pub mod dyld;
pub mod elf;
pub mod macho;
pub mod pe;

/// Binary format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Format {
    Elf,
    MachO,
    Pe,
}

/// A named symbol as seen by resolvers.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Symbol {
    pub name: String,
    /// Link-time value (an address for defined symbols, 0 for imports).
    pub value: u64,
    pub size: u64,
}

impl Symbol {
    pub fn new(name: impl Into<String>, value: u64, size: u64) -> Self {
        Self {
            name: name.into(),
            value,
            size,
        }
    }

    /// An import known only by name.
    pub fn import(name: impl Into<String>) -> Self {
        Self::new(name, 0, 0)
    }
}

/// Format-independent view of a parsed binary.
pub trait Image {
    fn format(&self) -> Format;

    fn arch(&self) -> Arch;

    /// Preferred load address from the headers.
    fn imagebase(&self) -> u64;

    /// Absolute link-time address of the entrypoint.
    fn entrypoint(&self) -> u64;

    /// Size of the image once mapped, segments laid out contiguously from `imagebase`.
    fn virtual_size(&self) -> u64;

    /// Libraries the binary imports symbols from.
    fn libraries(&self) -> &[String];
}

/// Maps a file for parsing.
pub(crate) fn map_file(path: &Path) -> Result<Mmap> {
    let io = |source| Error::Io {
        path: path.to_path_buf(),
        source,
    };
    let file = File::open(path).map_err(io)?;
    // SAFETY: the mapping is only read while parsing and every parsed view owns its bytes.
    unsafe { Mmap::map(&file) }.map_err(io)
}

/// Address relative to `imagebase`. Addresses below it are already relative.
pub fn rva(imagebase: u64, addr: u64) -> u64 {
    if addr >= imagebase {
        addr - imagebase
    } else {
        addr
    }
}
