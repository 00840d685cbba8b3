//! Mach-O images and universal (fat) containers.

use std::path::Path;

use object::macho;
use object::read::macho::{
    FatArch, LoadCommandVariant, MachHeader, MachOFatFile32, MachOFatFile64, Nlist, Section,
    Segment,
};
use object::{Endianness, FileKind};
use tracing::{debug, warn};

use super::dyld::{self, BindClass, BindingInfo, Rebase, RebaseKind, SegmentView};
use super::{map_file, Format, Image, Symbol};
use crate::arch::{Arch, Family};
use crate::error::{Error, Result};

#[derive(Debug, Clone, Default)]
pub struct MachOSection {
    pub name: String,
    pub address: u64,
    pub size: u64,
}

#[derive(Debug, Clone, Default)]
pub struct MachOSegment {
    pub name: String,
    pub virtual_address: u64,
    pub virtual_size: u64,
    pub file_size: u64,
    pub content: Vec<u8>,
    pub sections: Vec<MachOSection>,
}

/// Where a relocation was found.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelocationOrigin {
    /// dyld rebase opcodes (or a threaded pointer chain).
    DyldInfo,
    /// A section relocation table. Only object files should have these.
    RelocTable,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MachORelocation {
    pub address: u64,
    pub kind: RebaseKind,
    pub origin: RelocationOrigin,
}

#[derive(Debug, Clone, Default)]
pub struct MachOBinary {
    pub arch: Arch,
    pub cputype: u32,
    /// vmaddr of `__TEXT`.
    pub imagebase: u64,
    pub entrypoint: u64,
    pub segments: Vec<MachOSegment>,
    /// Defined external symbols.
    pub symbols: Vec<Symbol>,
    pub relocations: Vec<MachORelocation>,
    pub bindings: Vec<BindingInfo>,
    pub libraries: Vec<String>,
    /// Uses `LC_DYLD_CHAINED_FIXUPS`, which is not decoded.
    pub has_chained_fixups: bool,
}

impl MachOBinary {
    /// Parses a thin Mach-O image.
    pub fn parse(data: &[u8]) -> Result<Self> {
        match FileKind::parse(data)? {
            FileKind::MachO32 => parse_macho::<macho::MachHeader32<Endianness>>(data),
            FileKind::MachO64 => parse_macho::<macho::MachHeader64<Endianness>>(data),
            _ => Err(Error::UnsupportedFormat { expected: "Mach-O" }),
        }
    }

    pub fn segment(&self, name: &str) -> Option<&MachOSegment> {
        self.segments.iter().find(|s| s.name == name)
    }

    /// First binding of `symbol`, in any class.
    pub fn binding(&self, symbol: &str) -> Option<&BindingInfo> {
        self.bindings.iter().find(|b| b.symbol == symbol)
    }

    pub fn bindings_of(&self, class: BindClass) -> impl Iterator<Item = &BindingInfo> {
        self.bindings.iter().filter(move |b| b.class == class)
    }
}

impl Image for MachOBinary {
    fn format(&self) -> Format {
        Format::MachO
    }

    fn arch(&self) -> Arch {
        self.arch
    }

    fn imagebase(&self) -> u64 {
        self.imagebase
    }

    fn entrypoint(&self) -> u64 {
        self.entrypoint
    }

    fn virtual_size(&self) -> u64 {
        let end = self
            .segments
            .iter()
            .map(|s| s.virtual_address + s.virtual_size)
            .max()
            .unwrap_or(0);
        end.saturating_sub(self.imagebase)
    }

    fn libraries(&self) -> &[String] {
        &self.libraries
    }
}

/// A universal binary: one [`MachOBinary`] per architecture slice.
///
/// A thin image parses as a container with a single slice.
#[derive(Debug, Default)]
pub struct FatBinary {
    binaries: Vec<MachOBinary>,
}

impl FatBinary {
    pub fn parse(data: &[u8]) -> Result<Self> {
        let binaries = match FileKind::parse(data)? {
            FileKind::MachO32 | FileKind::MachO64 => vec![MachOBinary::parse(data)?],
            FileKind::MachOFat32 => {
                let fat = MachOFatFile32::parse(data)?;
                fat.arches()
                    .iter()
                    .map(|arch| MachOBinary::parse(arch.data(data)?))
                    .collect::<Result<_>>()?
            }
            FileKind::MachOFat64 => {
                let fat = MachOFatFile64::parse(data)?;
                fat.arches()
                    .iter()
                    .map(|arch| MachOBinary::parse(arch.data(data)?))
                    .collect::<Result<_>>()?
            }
            _ => return Err(Error::UnsupportedFormat { expected: "Mach-O" }),
        };
        Ok(Self { binaries })
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let map = map_file(path)?;
        Self::parse(&map)
    }

    pub fn len(&self) -> usize {
        self.binaries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.binaries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &MachOBinary> {
        self.binaries.iter()
    }

    pub fn arches(&self) -> impl Iterator<Item = Arch> + '_ {
        self.binaries.iter().map(|b| b.arch)
    }

    /// Detaches the first slice built for `arch`.
    pub fn take(&mut self, arch: Arch) -> Option<MachOBinary> {
        let index = self.binaries.iter().position(|b| b.arch == arch)?;
        Some(self.binaries.remove(index))
    }
}

impl From<Vec<MachOBinary>> for FatBinary {
    fn from(binaries: Vec<MachOBinary>) -> Self {
        Self { binaries }
    }
}

fn name(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes).into_owned()
}

/// The program counter of an `LC_UNIXTHREAD` state.
fn thread_pc(arch: Arch, endian: Endianness, state: &[u8]) -> Option<u64> {
    let word = |offset: usize, size: usize| -> Option<u64> {
        let bytes = state.get(offset..offset + size)?;
        Some(crate::utils::load(endian, bytes))
    };
    let flavor = word(0, 4)?;
    // Registers start after `flavor` and `count`.
    match (arch.family, arch.is_64, flavor) {
        // x86_THREAD_STATE64: rip follows 16 general purpose registers.
        (Family::X86, true, 4) => word(8 + 16 * 8, 8),
        // i386_THREAD_STATE: eip is register 10.
        (Family::X86, false, 1) => word(8 + 10 * 4, 4),
        // ARM_THREAD_STATE64: x0-x28, fp, lr, sp, pc.
        (Family::Arm64, true, 6) => word(8 + 32 * 8, 8),
        // ARM_THREAD_STATE: r0-r15.
        (Family::Arm, false, 1) => word(8 + 15 * 4, 4),
        _ => None,
    }
}

fn parse_macho<Mach: MachHeader<Endian = Endianness>>(data: &[u8]) -> Result<MachOBinary> {
    let header = Mach::parse(data, 0)?;
    let endian = header.endian()?;
    let cputype = header.cputype(endian);
    let arch = Arch::from_macho_cputype(cputype, endian);

    let mut binary = MachOBinary {
        arch,
        cputype,
        ..Default::default()
    };
    let mut main_offset = None;
    let mut thread_entry = None;
    let mut dyld_info = None;

    let mut commands = header.load_commands(endian, data, 0)?;
    while let Some(command) = commands.next()? {
        if let Some((segment, section_data)) = Mach::Segment::from_command(command)? {
            let mut entry = MachOSegment {
                name: name(segment.name()),
                virtual_address: segment.vmaddr(endian).into(),
                virtual_size: segment.vmsize(endian).into(),
                file_size: segment.filesize(endian).into(),
                content: segment
                    .data(endian, data)
                    .map_err(|()| Error::malformed("segment data outside of file"))?
                    .to_vec(),
                sections: Vec::new(),
            };
            for section in segment.sections(endian, section_data)? {
                let address: u64 = section.addr(endian).into();
                entry.sections.push(MachOSection {
                    name: name(section.name()),
                    address,
                    size: section.size(endian).into(),
                });
                for reloc in section.relocations(endian, data)? {
                    if reloc.r_scattered(endian, cputype) {
                        continue;
                    }
                    let info = reloc.info(endian);
                    binary.relocations.push(MachORelocation {
                        address: address + u64::from(info.r_address),
                        kind: RebaseKind::Other(info.r_type),
                        origin: RelocationOrigin::RelocTable,
                    });
                }
            }
            binary.segments.push(entry);
            continue;
        }

        match command.variant()? {
            LoadCommandVariant::Symtab(symtab) => {
                let symbols = symtab.symbols::<Mach, _>(endian, data)?;
                for nlist in symbols.iter() {
                    let n_type = nlist.n_type();
                    if n_type & macho::N_STAB != 0
                        || n_type & macho::N_EXT == 0
                        || n_type & macho::N_TYPE != macho::N_SECT
                    {
                        continue;
                    }
                    binary.symbols.push(Symbol::new(
                        name(nlist.name(endian, symbols.strings())?),
                        nlist.n_value(endian).into(),
                        0,
                    ));
                }
            }
            LoadCommandVariant::Dylib(dylib) => {
                binary
                    .libraries
                    .push(name(command.string(endian, dylib.dylib.name)?));
            }
            LoadCommandVariant::DyldInfo(info) => dyld_info = Some(*info),
            LoadCommandVariant::EntryPoint(entry) => main_offset = Some(entry.entryoff.get(endian)),
            LoadCommandVariant::Thread(_, state) => thread_entry = thread_pc(arch, endian, state),
            LoadCommandVariant::LinkeditData(_)
                if command.cmd() == macho::LC_DYLD_CHAINED_FIXUPS =>
            {
                binary.has_chained_fixups = true;
            }
            _ => {}
        }
    }

    binary.imagebase = binary
        .segment("__TEXT")
        .or_else(|| binary.segments.iter().find(|s| s.file_size != 0))
        .map(|s| s.virtual_address)
        .unwrap_or(0);
    binary.entrypoint = match (main_offset, thread_entry) {
        (Some(offset), _) => binary.imagebase + offset,
        (None, Some(pc)) => pc,
        (None, None) => 0,
    };

    if let Some(info) = dyld_info {
        read_dyld_info(&mut binary, endian, data, &info)?;
    }
    if binary.has_chained_fixups {
        warn!("LC_DYLD_CHAINED_FIXUPS is not supported, pointers will not be fixed up");
    }

    debug!(
        "Mach-O {}: {} segments, {} relocations, {} bindings",
        arch,
        binary.segments.len(),
        binary.relocations.len(),
        binary.bindings.len()
    );
    Ok(binary)
}

fn read_dyld_info(
    binary: &mut MachOBinary,
    endian: Endianness,
    data: &[u8],
    info: &macho::DyldInfoCommand<Endianness>,
) -> Result<()> {
    let stream = |offset: u32, size: u32| -> Result<&[u8]> {
        let start = offset as usize;
        data.get(start..start + size as usize)
            .ok_or_else(|| Error::malformed("dyld info outside of file"))
    };
    let views: Vec<SegmentView<'_>> = binary
        .segments
        .iter()
        .map(|s| SegmentView {
            address: s.virtual_address,
            size: s.virtual_size,
            content: &s.content,
        })
        .collect();
    let pointer_size = binary.arch.pointer_size() as u64;

    let mut rebases: Vec<Rebase> = dyld::rebases(
        stream(info.rebase_off.get(endian), info.rebase_size.get(endian))?,
        &views,
        pointer_size,
    )?;

    let streams = [
        (BindClass::Standard, info.bind_off, info.bind_size),
        (BindClass::Weak, info.weak_bind_off, info.weak_bind_size),
        (BindClass::Lazy, info.lazy_bind_off, info.lazy_bind_size),
    ];
    let mut bindings = Vec::new();
    for (class, offset, size) in streams {
        let out = dyld::bindings(
            stream(offset.get(endian), size.get(endian))?,
            class,
            &views,
            pointer_size,
            binary.imagebase,
            endian,
        )?;
        bindings.extend(out.bindings);
        rebases.extend(out.rebases);
    }

    binary
        .relocations
        .extend(rebases.into_iter().map(|r| MachORelocation {
            address: r.address,
            kind: r.kind,
            origin: RelocationOrigin::DyldInfo,
        }));
    binary.bindings = bindings;
    Ok(())
}
