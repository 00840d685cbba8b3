//! Loaders.
//!
//! A loader owns one parsed binary and maps it into a [`TargetSystem`]. Construction goes
//! through a factory (`from_file` / `from_binary`) that either returns a fully loaded
//! image or an error; there is no partially loaded state to observe. Every load runs the
//! same three phases in order: map, relocate, bind.
//!
//! Mapped memory belongs to the target. Dropping a loader does not unmap anything.

use std::ffi::{c_char, c_int, CString};
use std::path::Path;

use object::FileKind;
use tracing::{debug, warn};

use crate::arch::Arch;
use crate::binary::macho::FatBinary;
use crate::binary::{map_file, Format, Image};
use crate::engine::TargetSystem;
use crate::error::{Error, Result};

pub mod elf;
pub mod macho;
pub mod pe;

pub use self::elf::ElfLoader;
pub use self::macho::MachOLoader;
pub use self::pe::PeLoader;

/// When imported symbols get bound.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BindMode {
    /// Whatever the loader does best; currently the same as [`BindMode::Now`].
    #[default]
    Default,
    /// Skip binding. The caller takes care of imports.
    NotBind,
    /// Bind everything during the load.
    Now,
    /// Defer binding to the first call. Only Mach-O on a native target supports it.
    Lazy,
}

impl BindMode {
    pub(crate) fn is_now(self) -> bool {
        matches!(self, BindMode::Default | BindMode::Now)
    }
}

/// Queries common to loaded images of every format.
pub trait Loader {
    /// Absolute address of an exported symbol, or 0 if the image does not export it.
    fn symbol_address(&self, name: &str) -> u64;

    /// Absolute address of `offset` bytes into the image.
    fn offset_address(&self, offset: u64) -> u64 {
        self.base_address() + offset
    }

    /// Absolute address of the entrypoint.
    fn entrypoint(&self) -> u64;

    /// Where the image was mapped.
    fn base_address(&self) -> u64;

    /// Size of the mapping, page aligned.
    fn mem_size(&self) -> u64;

    fn binary(&self) -> &dyn Image;

    fn arch(&self) -> Arch {
        self.binary().arch()
    }

    fn contains_address(&self, addr: u64) -> bool {
        let base = self.base_address();
        base <= addr && addr < base + self.mem_size()
    }
}

/// Rejects binaries the target cannot run.
pub(crate) fn check_supported(system: &dyn TargetSystem, binary: &dyn Image) -> Result<()> {
    if system.supports(binary) {
        return Ok(());
    }
    warn!("{:?} binary for {} is not supported by the target", binary.format(), binary.arch());
    Err(Error::UnsupportedArch(binary.arch()))
}

/// Reserves `size` bytes for an image that prefers to live at `imagebase`.
pub(crate) fn map_image(system: &dyn TargetSystem, imagebase: u64, size: u64) -> Result<u64> {
    let hint = system.base_address_hint(imagebase, size);
    let base = system.mem().mmap(hint, size as usize);
    if base == 0 {
        return Err(Error::MmapFailed { size });
    }
    debug!("Mapped 0x{:x} bytes at 0x{:x} (hint 0x{:x})", size, base, hint);
    Ok(base)
}

/// Detects the format of `path` and loads it.
///
/// `format` overrides detection. For universal Mach-O files the first slice the target
/// supports is used.
pub fn from_file<'a>(
    path: &Path,
    format: Option<Format>,
    system: &'a dyn TargetSystem,
    bind: BindMode,
) -> Result<Box<dyn Loader + 'a>> {
    let format = match format {
        Some(format) => format,
        None => detect(path)?,
    };
    debug!("Loading {} as {:?}", path.display(), format);
    let loader: Box<dyn Loader + 'a> = match format {
        Format::Elf => Box::new(ElfLoader::from_file(path, system, bind)?),
        Format::Pe => Box::new(PeLoader::from_file(path, system, bind)?),
        Format::MachO => {
            let fat = FatBinary::from_file(path)?;
            let arch = fat
                .iter()
                .find(|binary| system.supports(*binary))
                .map(|binary| binary.arch)
                .ok_or_else(|| Error::UnsupportedArch(fat.arches().next().unwrap_or_default()))?;
            MachOLoader::from_fat(fat, arch, system, bind)?
        }
    };
    Ok(loader)
}

/// Calls the code at `addr` as `int main(int argc, char **argv)`.
///
/// `args[0]` is the program name. `argv` is NUL terminated.
///
/// # Safety
///
/// `addr` must point to a function with that signature, mapped and bound in this process.
pub unsafe fn call_main(addr: u64, args: &[String]) -> Result<i32> {
    let args = args
        .iter()
        .map(|arg| CString::new(arg.as_str()))
        .collect::<std::result::Result<Vec<_>, _>>()?;
    let mut argv: Vec<*const c_char> = args.iter().map(|arg| arg.as_ptr()).collect();
    argv.push(std::ptr::null());

    debug!("Calling 0x{:x} with {} arguments", addr, args.len());
    // SAFETY: upheld by the caller.
    let main: extern "C" fn(c_int, *const *const c_char) -> c_int =
        unsafe { std::mem::transmute(addr as usize) };
    Ok(main(args.len() as c_int, argv.as_ptr()))
}

fn detect(path: &Path) -> Result<Format> {
    let data = map_file(path)?;
    match FileKind::parse(&*data)? {
        FileKind::Elf32 | FileKind::Elf64 => Ok(Format::Elf),
        FileKind::MachO32 | FileKind::MachO64 | FileKind::MachOFat32 | FileKind::MachOFat64 => {
            Ok(Format::MachO)
        }
        FileKind::Pe32 | FileKind::Pe64 => Ok(Format::Pe),
        _ => Err(Error::UnsupportedFormat {
            expected: "ELF, Mach-O or PE",
        }),
    }
}
