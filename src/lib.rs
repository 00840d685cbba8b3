//! Userspace binary loader.
//!
//! This library maps ELF, Mach-O and PE images into a target address space, applies their
//! relocations and binds their imports, without the host's dynamic linker doing the work.
//! It is organized into several modules:
//! - `binary`: Parsed, owned views of the supported formats.
//! - `loader`: The per-format loaders and the common `Loader` trait.
//! - `engine`: Target memory and symbol resolution (native process or virtual).
//! - `arch`: Architectures and the ELF relocation backends.
//! - `lazy`: Mach-O lazy binding trampolines.
//! - `config`: CLI configuration of the `xld` runner.

pub mod arch;
pub mod binary;
pub mod config;
pub mod engine;
pub mod error;
pub mod lazy;
pub mod loader;
pub mod utils;

pub use arch::Arch;
pub use binary::{Format, Image, Symbol};
pub use engine::{Resolver, TargetMemory, TargetSystem};
pub use error::{Error, Result};
pub use loader::{BindMode, ElfLoader, Loader, MachOLoader, PeLoader};
