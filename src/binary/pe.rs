//! PE/COFF images.

use std::mem;
use std::path::Path;

use object::pe;
use object::read::pe::{ExportTarget, ImageNtHeaders, ImageOptionalHeader, Import, PeFile};
use object::{FileKind, LittleEndian as LE};
use tracing::debug;

use super::{map_file, Format, Image, Symbol};
use crate::arch::Arch;
use crate::error::{Error, Result};

#[derive(Debug, Clone, Default)]
pub struct PeSection {
    pub name: String,
    pub virtual_address: u32,
    pub virtual_size: u32,
    pub content: Vec<u8>,
}

/// A base relocation entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeRelocation {
    pub rva: u32,
    /// `IMAGE_REL_BASED_*`.
    pub kind: u16,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PeImportEntry {
    pub name: Option<String>,
    pub ordinal: Option<u16>,
    /// RVA of the import address table slot.
    pub iat_rva: u32,
}

#[derive(Debug, Clone, Default)]
pub struct PeImport {
    pub library: String,
    pub entries: Vec<PeImportEntry>,
}

#[derive(Debug, Clone, Default)]
pub struct PeBinary {
    pub arch: Arch,
    pub machine: u16,
    pub imagebase: u64,
    pub entrypoint: u64,
    pub size_of_image: u64,
    /// The first `SizeOfHeaders` bytes of the file.
    pub headers: Vec<u8>,
    pub sections: Vec<PeSection>,
    pub relocations: Vec<PeRelocation>,
    pub imports: Vec<PeImport>,
    /// Exported symbols, values are RVAs.
    pub exports: Vec<Symbol>,
    pub(crate) libraries: Vec<String>,
}

impl PeBinary {
    pub fn parse(data: &[u8]) -> Result<Self> {
        match FileKind::parse(data)? {
            FileKind::Pe32 => parse_pe::<pe::ImageNtHeaders32>(data),
            FileKind::Pe64 => parse_pe::<pe::ImageNtHeaders64>(data),
            _ => Err(Error::UnsupportedFormat { expected: "PE" }),
        }
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let map = map_file(path)?;
        Self::parse(&map)
    }

    pub fn export(&self, name: &str) -> Option<&Symbol> {
        self.exports.iter().find(|s| s.name == name)
    }

    /// Sets the import list, keeping [`Image::libraries`] in sync.
    pub fn set_imports(&mut self, imports: Vec<PeImport>) {
        self.libraries = imports.iter().map(|i| i.library.clone()).collect();
        self.imports = imports;
    }
}

impl Image for PeBinary {
    fn format(&self) -> Format {
        Format::Pe
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
        self.size_of_image
    }

    fn libraries(&self) -> &[String] {
        &self.libraries
    }
}

fn parse_pe<Pe: ImageNtHeaders>(data: &[u8]) -> Result<PeBinary> {
    let file = PeFile::<Pe>::parse(data)?;
    let nt = file.nt_headers();
    let optional = nt.optional_header();
    let machine = nt.file_header().machine.get(LE);
    let imagebase = optional.image_base();
    let size_of_headers = (optional.size_of_headers() as usize).min(data.len());

    let mut binary = PeBinary {
        arch: Arch::from_pe_machine(machine),
        machine,
        imagebase,
        entrypoint: imagebase + u64::from(optional.address_of_entry_point()),
        size_of_image: u64::from(optional.size_of_image()),
        headers: data[..size_of_headers].to_vec(),
        ..Default::default()
    };

    let sections = file.section_table();
    for section in sections.iter() {
        let raw = section.raw_name();
        let len = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
        binary.sections.push(PeSection {
            name: String::from_utf8_lossy(&raw[..len]).into_owned(),
            virtual_address: section.virtual_address.get(LE),
            virtual_size: section.virtual_size.get(LE),
            content: section.pe_data(data)?.to_vec(),
        });
    }

    if let Some(mut blocks) = file.data_directories().relocation_blocks(data, &sections)? {
        while let Some(block) = blocks.next()? {
            for reloc in block {
                binary.relocations.push(PeRelocation {
                    rva: reloc.virtual_address,
                    kind: reloc.typ,
                });
            }
        }
    }

    let mut imports = Vec::new();
    if let Some(table) = file.import_table()? {
        let mut descriptors = table.descriptors()?;
        while let Some(descriptor) = descriptors.next()? {
            let library = String::from_utf8_lossy(table.name(descriptor.name.get(LE))?);
            let iat = descriptor.first_thunk.get(LE);
            let lookup = match descriptor.original_first_thunk.get(LE) {
                0 => iat,
                rva => rva,
            };
            let mut thunks = table.thunks(lookup)?;
            let mut entries = Vec::new();
            let mut iat_rva = iat;
            while let Some(thunk) = thunks.next::<Pe>()? {
                let entry = match table.import::<Pe>(thunk)? {
                    Import::Name(_hint, name) => PeImportEntry {
                        name: Some(String::from_utf8_lossy(name).into_owned()),
                        ordinal: None,
                        iat_rva,
                    },
                    Import::Ordinal(ordinal) => PeImportEntry {
                        name: None,
                        ordinal: Some(ordinal),
                        iat_rva,
                    },
                };
                entries.push(entry);
                iat_rva += mem::size_of::<Pe::ImageThunkData>() as u32;
            }
            imports.push(PeImport {
                library: library.into_owned(),
                entries,
            });
        }
    }
    binary.set_imports(imports);

    if let Some(table) = file.export_table()? {
        for export in table.exports()? {
            if let (Some(name), ExportTarget::Address(rva)) = (export.name, export.target) {
                binary
                    .exports
                    .push(Symbol::new(String::from_utf8_lossy(name), u64::from(rva), 0));
            }
        }
    }

    debug!(
        "PE {}: {} sections, {} base relocations, {} imported libraries, {} exports",
        binary.arch,
        binary.sections.len(),
        binary.relocations.len(),
        binary.imports.len(),
        binary.exports.len()
    );
    Ok(binary)
}
