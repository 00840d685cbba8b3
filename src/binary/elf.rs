//! ELF images.
//!
//! Only the run-time view is used: program headers and the dynamic section. Relocation
//! tables are located through `DT_RELA` and `DT_JMPREL`, so a stripped binary with no
//! section headers still loads. Symbols come from `.dynsym` (and `.symtab` when present).
//! Without section headers, `DT_SYMTAB` is read instead, sized by `DT_HASH` or
//! `DT_GNU_HASH`.

use std::mem;
use std::path::Path;

use object::elf;
use object::read::elf::{Dyn, FileHeader, ProgramHeader, Rela, Sym};
use object::{Endian, Endianness, FileKind};
use tracing::{debug, warn};

use super::{map_file, Format, Image, Symbol};
use crate::arch::Arch;
use crate::error::{Error, Result};
use crate::utils::{page_align, page_start, read_cstr};

/// A program header and the bytes it maps from the file.
#[derive(Debug, Clone, Default)]
pub struct ElfSegment {
    /// `p_type`.
    pub kind: u32,
    pub flags: u32,
    pub virtual_address: u64,
    pub virtual_size: u64,
    pub content: Vec<u8>,
}

/// A dynamic relocation (`Elf_Rela`).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ElfRelocation {
    /// Link-time address of the slot to patch.
    pub address: u64,
    /// Machine-specific relocation type.
    pub kind: u32,
    pub addend: i64,
    /// Index into [`ElfBinary::dynamic_symbols`]; 0 means no symbol.
    pub symbol: u32,
}

#[derive(Debug, Clone, Default)]
pub struct ElfBinary {
    pub arch: Arch,
    /// `e_machine`.
    pub machine: u16,
    pub entrypoint: u64,
    pub segments: Vec<ElfSegment>,
    /// `.dynsym`, index 0 included so relocation indices line up.
    pub dynamic_symbols: Vec<Symbol>,
    /// Global symbols defined in `.symtab`.
    pub symbols: Vec<Symbol>,
    /// `DT_RELA` entries.
    pub dynamic_relocations: Vec<ElfRelocation>,
    /// `DT_JMPREL` entries, in PLT order.
    pub pltgot_relocations: Vec<ElfRelocation>,
    /// `DT_PLTGOT`.
    pub pltgot: Option<u64>,
    /// `DT_NEEDED`.
    pub libraries: Vec<String>,
}

impl ElfBinary {
    pub fn parse(data: &[u8]) -> Result<Self> {
        match FileKind::parse(data)? {
            FileKind::Elf32 => parse_elf::<elf::FileHeader32<Endianness>>(data),
            FileKind::Elf64 => parse_elf::<elf::FileHeader64<Endianness>>(data),
            _ => Err(Error::UnsupportedFormat { expected: "ELF" }),
        }
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let map = map_file(path)?;
        Self::parse(&map)
    }

    /// `PT_LOAD` segments.
    pub fn load_segments(&self) -> impl Iterator<Item = &ElfSegment> {
        self.segments.iter().filter(|s| s.kind == elf::PT_LOAD)
    }

    /// The dynamic symbol a relocation refers to, if any.
    pub fn symbol(&self, index: u32) -> Option<&Symbol> {
        if index == 0 {
            return None;
        }
        self.dynamic_symbols.get(index as usize)
    }
}

impl Image for ElfBinary {
    fn format(&self) -> Format {
        Format::Elf
    }

    fn arch(&self) -> Arch {
        self.arch
    }

    fn imagebase(&self) -> u64 {
        self.load_segments()
            .map(|s| page_start(s.virtual_address))
            .min()
            .unwrap_or(0)
    }

    fn entrypoint(&self) -> u64 {
        self.entrypoint
    }

    fn virtual_size(&self) -> u64 {
        let end = self
            .load_segments()
            .map(|s| s.virtual_address + s.virtual_size)
            .max()
            .unwrap_or(0);
        page_align(end) - self.imagebase()
    }

    fn libraries(&self) -> &[String] {
        &self.libraries
    }
}

fn parse_elf<Elf: FileHeader<Endian = Endianness>>(data: &[u8]) -> Result<ElfBinary> {
    let header = Elf::parse(data)?;
    let endian = header.endian()?;
    let machine = header.e_machine(endian);
    let program_headers = header.program_headers(endian, data)?;

    let mut binary = ElfBinary {
        arch: Arch::from_elf_machine(machine, endian, header.is_class_64()),
        machine,
        entrypoint: header.e_entry(endian).into(),
        ..Default::default()
    };

    let mut dynamic: &[Elf::Dyn] = &[];
    for ph in program_headers {
        let (offset, size) = ph.file_range(endian);
        let content = offset
            .checked_add(size)
            .and_then(|end| data.get(offset as usize..end as usize))
            .ok_or_else(|| Error::malformed("segment content outside of file"))?;
        if ph.p_type(endian) == elf::PT_DYNAMIC {
            dynamic = ph.dynamic(endian, data)?.unwrap_or(&[]);
        }
        binary.segments.push(ElfSegment {
            kind: ph.p_type(endian),
            flags: ph.p_flags(endian),
            virtual_address: ph.p_vaddr(endian).into(),
            virtual_size: ph.p_memsz(endian).into(),
            content: content.to_vec(),
        });
    }

    let tags: Vec<(u32, u64)> = dynamic
        .iter()
        .filter_map(|d| Some((d.tag32(endian)?, d.d_val(endian).into())))
        .take_while(|(tag, _)| *tag != elf::DT_NULL)
        .collect();
    let tag = |wanted: u32| tags.iter().find(|(t, _)| *t == wanted).map(|(_, v)| *v);
    let offset_of = |addr: u64| file_offset::<Elf>(endian, program_headers, addr);

    binary.pltgot = tag(elf::DT_PLTGOT);

    if let Some(rela) = tag(elf::DT_RELA) {
        let offset = offset_of(rela).ok_or_else(|| Error::malformed("DT_RELA not mapped"))?;
        let size = tag(elf::DT_RELASZ).unwrap_or(0);
        binary.dynamic_relocations = read_relas::<Elf>(endian, data, offset, size)?;
    }
    if tag(elf::DT_REL).is_some() {
        warn!("DT_REL relocations are not supported");
    }

    if let Some(jmprel) = tag(elf::DT_JMPREL) {
        if tag(elf::DT_PLTREL) == Some(u64::from(elf::DT_REL)) {
            warn!("DT_JMPREL uses DT_REL entries, which are not supported");
        } else {
            let offset =
                offset_of(jmprel).ok_or_else(|| Error::malformed("DT_JMPREL not mapped"))?;
            let size = tag(elf::DT_PLTRELSZ).unwrap_or(0);
            binary.pltgot_relocations = read_relas::<Elf>(endian, data, offset, size)?;
        }
    }

    if let Some(strtab) = tag(elf::DT_STRTAB).and_then(offset_of) {
        for (_, name) in tags.iter().filter(|(t, _)| *t == elf::DT_NEEDED) {
            let lib = strtab
                .checked_add(*name as usize)
                .and_then(|offset| read_cstr(data, offset));
            if let Some(lib) = lib {
                binary.libraries.push(String::from_utf8_lossy(lib).into_owned());
            }
        }
    }

    let sections = header.sections(endian, data)?;
    let dynsyms = sections.symbols(endian, data, elf::SHT_DYNSYM)?;
    for sym in dynsyms.iter() {
        let name = sym.name(endian, dynsyms.strings())?;
        binary.dynamic_symbols.push(Symbol::new(
            String::from_utf8_lossy(name),
            sym.st_value(endian).into(),
            sym.st_size(endian).into(),
        ));
    }

    if binary.dynamic_symbols.is_empty() {
        if let Some(symtab) = tag(elf::DT_SYMTAB).and_then(offset_of) {
            let syment = tag(elf::DT_SYMENT).unwrap_or(0);
            if syment != 0 && syment as usize != mem::size_of::<Elf::Sym>() {
                return Err(Error::malformed(format!("DT_SYMENT of {} bytes", syment)));
            }
            let word = if header.is_class_64() { 8 } else { 4 };
            let count = match (
                tag(elf::DT_HASH).and_then(offset_of),
                tag(elf::DT_GNU_HASH).and_then(offset_of),
            ) {
                (Some(hash), _) => hash
                    .checked_add(4)
                    .and_then(|nchain| read_u32(endian, data, nchain))
                    .map(|n| n as usize),
                (None, Some(gnu_hash)) => gnu_hash_count(endian, data, gnu_hash, word),
                (None, None) => {
                    warn!("No section headers and no hash table, dynamic symbols are unknown");
                    None
                }
            };
            if let Some(count) = count {
                let strtab = tag(elf::DT_STRTAB).and_then(offset_of).unwrap_or(0);
                binary.dynamic_symbols =
                    read_dynamic_symbols::<Elf>(endian, data, symtab, strtab, count)?;
            }
        }
    }

    let symtab = sections.symbols(endian, data, elf::SHT_SYMTAB)?;
    for sym in symtab.iter() {
        let global = matches!(sym.st_bind(), elf::STB_GLOBAL | elf::STB_WEAK);
        let value: u64 = sym.st_value(endian).into();
        if !global || sym.is_undefined(endian) || value == 0 {
            continue;
        }
        let name = sym.name(endian, symtab.strings())?;
        binary.symbols.push(Symbol::new(
            String::from_utf8_lossy(name),
            value,
            sym.st_size(endian).into(),
        ));
    }

    debug!(
        "ELF: {} segments, {} dynamic symbols, {} relocations, {} PLT relocations",
        binary.segments.len(),
        binary.dynamic_symbols.len(),
        binary.dynamic_relocations.len(),
        binary.pltgot_relocations.len()
    );
    Ok(binary)
}

/// Converts a link-time address to a file offset through the `PT_LOAD` segments.
fn file_offset<Elf: FileHeader<Endian = Endianness>>(
    endian: Endianness,
    program_headers: &[Elf::ProgramHeader],
    addr: u64,
) -> Option<usize> {
    program_headers
        .iter()
        .filter(|ph| ph.p_type(endian) == elf::PT_LOAD)
        .find_map(|ph| {
            let vaddr: u64 = ph.p_vaddr(endian).into();
            let filesz: u64 = ph.p_filesz(endian).into();
            let offset: u64 = ph.p_offset(endian).into();
            if !(vaddr..vaddr.saturating_add(filesz)).contains(&addr) {
                return None;
            }
            offset.checked_add(addr - vaddr).map(|offset| offset as usize)
        })
}

fn read_u32(endian: Endianness, data: &[u8], offset: usize) -> Option<u32> {
    let bytes = data.get(offset..offset.checked_add(4)?)?;
    Some(endian.read_u32_bytes(bytes.try_into().ok()?))
}

/// Number of `DT_SYMTAB` entries implied by a `DT_GNU_HASH` table.
///
/// The table only indexes symbols from `symoffset` on. The last chain of the highest
/// bucket ends at the last symbol, marked by bit 0.
fn gnu_hash_count(endian: Endianness, data: &[u8], offset: usize, word: usize) -> Option<usize> {
    let field = |index: usize| read_u32(endian, data, offset.checked_add(index * 4)?);
    let nbuckets = field(0)? as usize;
    let symoffset = field(1)? as usize;
    let bloom_size = field(2)? as usize;
    let buckets = offset
        .checked_add(16)?
        .checked_add(bloom_size.checked_mul(word)?)?;
    let chains = buckets.checked_add(nbuckets.checked_mul(4)?)?;

    let last = (0..nbuckets)
        .map(|i| read_u32(endian, data, buckets + i * 4).map(|b| b as usize))
        .collect::<Option<Vec<_>>>()?
        .into_iter()
        .max()
        .unwrap_or(0);
    if last < symoffset {
        return Some(symoffset);
    }
    let mut index = last;
    loop {
        let entry = chains.checked_add((index - symoffset).checked_mul(4)?)?;
        let chain = read_u32(endian, data, entry)?;
        if chain & 1 != 0 {
            return Some(index + 1);
        }
        index += 1;
    }
}

/// Reads `count` symbols at `symtab` with names from the `strtab` offset.
fn read_dynamic_symbols<Elf: FileHeader<Endian = Endianness>>(
    endian: Endianness,
    data: &[u8],
    symtab: usize,
    strtab: usize,
    count: usize,
) -> Result<Vec<Symbol>> {
    let bytes = data
        .get(symtab..)
        .ok_or_else(|| Error::malformed("DT_SYMTAB outside of file"))?;
    let (syms, _) = object::pod::slice_from_bytes::<Elf::Sym>(bytes, count)
        .map_err(|()| Error::malformed("DT_SYMTAB runs past the end of file"))?;
    Ok(syms
        .iter()
        .map(|sym| {
            let name = strtab
                .checked_add(sym.st_name(endian) as usize)
                .and_then(|offset| read_cstr(data, offset))
                .unwrap_or_default();
            Symbol::new(
                String::from_utf8_lossy(name),
                sym.st_value(endian).into(),
                sym.st_size(endian).into(),
            )
        })
        .collect())
}

fn read_relas<Elf: FileHeader<Endian = Endianness>>(
    endian: Endianness,
    data: &[u8],
    offset: usize,
    size: u64,
) -> Result<Vec<ElfRelocation>> {
    let bytes = offset
        .checked_add(size as usize)
        .and_then(|end| data.get(offset..end))
        .ok_or_else(|| Error::malformed("relocation table outside of file"))?;
    let count = bytes.len() / mem::size_of::<Elf::Rela>();
    let (relas, _) = object::pod::slice_from_bytes::<Elf::Rela>(bytes, count)
        .map_err(|()| Error::malformed("invalid relocation table"))?;
    Ok(relas
        .iter()
        .map(|rela| ElfRelocation {
            address: rela.r_offset(endian).into(),
            kind: rela.r_type(endian, false),
            addend: rela.r_addend(endian).into(),
            symbol: rela.r_sym(endian, false),
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn segment(vaddr: u64, memsz: u64) -> ElfSegment {
        ElfSegment {
            kind: elf::PT_LOAD,
            virtual_address: vaddr,
            virtual_size: memsz,
            ..Default::default()
        }
    }

    #[test]
    fn footprint_from_load_segments() {
        let binary = ElfBinary {
            segments: vec![
                segment(0x40_0000, 0x1234),
                ElfSegment {
                    kind: elf::PT_DYNAMIC,
                    virtual_address: 0x90_0000,
                    virtual_size: 0x100,
                    ..Default::default()
                },
                segment(0x40_2010, 0x10),
            ],
            ..Default::default()
        };
        assert_eq!(binary.imagebase(), 0x40_0000);
        assert_eq!(binary.virtual_size(), 0x3000);
        assert_eq!(binary.load_segments().count(), 2);
    }

    #[test]
    fn symbol_zero_is_none() {
        let binary = ElfBinary {
            dynamic_symbols: vec![Symbol::default(), Symbol::new("puts", 0, 0)],
            ..Default::default()
        };
        assert!(binary.symbol(0).is_none());
        assert_eq!(binary.symbol(1).map(|s| s.name.as_str()), Some("puts"));
        assert!(binary.symbol(7).is_none());
    }

    #[test]
    fn gnu_hash_symbol_count() {
        let words: [u32; 12] = [
            2, // nbuckets
            1, // symoffset
            1, // bloom_size
            6, // bloom_shift
            0, 0, // one 64-bit bloom word
            1, 3, // buckets
            0x10, 0x11, 0x20, 0x21, // chains for symbols 1..=4
        ];
        let data: Vec<u8> = words.iter().flat_map(|w| w.to_le_bytes()).collect();
        assert_eq!(gnu_hash_count(Endianness::Little, &data, 0, 8), Some(5));
        assert_eq!(gnu_hash_count(Endianness::Little, &data[..8], 0, 8), None);
    }

    #[test]
    fn gnu_hash_without_hashed_symbols() {
        let words: [u32; 5] = [1, 3, 0, 6, 0];
        let data: Vec<u8> = words.iter().flat_map(|w| w.to_le_bytes()).collect();
        assert_eq!(gnu_hash_count(Endianness::Little, &data, 0, 8), Some(3));
    }

    #[test]
    fn relocation_range_overflow() {
        let data = [0u8; 48];
        let result = read_relas::<elf::FileHeader64<Endianness>>(
            Endianness::Little,
            &data,
            usize::MAX - 8,
            24,
        );
        assert!(matches!(result, Err(Error::Malformed(_))));
        let relas = read_relas::<elf::FileHeader64<Endianness>>(Endianness::Little, &data, 0, 48);
        assert_eq!(relas.unwrap().len(), 2);
    }

    #[test]
    fn rejects_other_formats() {
        let mut pe = vec![0u8; 0x200];
        pe[0] = b'M';
        pe[1] = b'Z';
        assert!(ElfBinary::parse(&pe).is_err());
    }
}
