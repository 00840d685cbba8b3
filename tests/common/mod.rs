//! Minimal ELF64 x86-64 shared objects for integration tests.
//!
//! Everything sits in one RWX `PT_LOAD` mapped at address 0 with file offsets equal to
//! virtual addresses:
//!
//! | offset | content |
//! |--------|---------|
//! | 0x100  | `.dynsym`: null, `puts` (undefined), `answer`, `counter`, `main` |
//! | 0x180  | `.dynstr` |
//! | 0x200  | `.rela.dyn` |
//! | 0x280  | `.rela.plt` |
//! | 0x300  | `.dynamic` |
//! | 0x400  | `.shstrtab` |
//! | 0x500  | `.hash` |
//! | 0x1000 | `.text`: `answer` returns 42, `main` returns `argc` |
//! | 0x2000 | `.data`: GOT and `counter` |

#![allow(dead_code)]

use std::path::PathBuf;

use object::elf;
use object::endian::{I64, U16, U32, U64};
use object::pod::{bytes_of, Pod};
use object::Endianness;

pub const TEXT: u64 = 0x1000;
pub const DATA: u64 = 0x2000;

/// Slot patched by `R_X86_64_RELATIVE` with addend `TEXT`.
pub const RELATIVE_SLOT: u64 = DATA;
/// Slot patched by `R_X86_64_64` against `answer` + 4.
pub const ABS_SLOT: u64 = DATA + 0x8;
/// Slot patched by `R_X86_64_GLOB_DAT` against `puts`.
pub const GLOB_DAT_SLOT: u64 = DATA + 0x18;
/// Slot patched by `R_X86_64_JUMP_SLOT` against `puts`.
pub const JUMP_SLOT: u64 = DATA + 0x20;
/// Value of `counter`.
pub const COUNTER: u64 = DATA + 0x30;

/// `mov eax, 42; ret`
pub const ANSWER_CODE: [u8; 6] = [0xb8, 0x2a, 0x00, 0x00, 0x00, 0xc3];
/// `int main(int argc, char **argv)`.
pub const MAIN: u64 = TEXT + 0x10;
/// `mov eax, edi; ret`
pub const MAIN_CODE: [u8; 3] = [0x89, 0xf8, 0xc3];

const DYNSYM: u64 = 0x100;
const DYNSTR: u64 = 0x180;
const RELA_DYN: u64 = 0x200;
const RELA_PLT: u64 = 0x280;
const DYNAMIC: u64 = 0x300;
const SHSTRTAB: u64 = 0x400;
const HASH: u64 = 0x500;
const SECTION_HEADERS: u64 = 0x2100;

const DYNSTR_DATA: &[u8] = b"\0puts\0answer\0counter\0main\0libc.so.6\0";
const SHSTRTAB_DATA: &[u8] =
    b"\0.dynsym\0.dynstr\0.rela.dyn\0.rela.plt\0.dynamic\0.text\0.data\0.shstrtab\0.hash\0";
/// SysV hash table with one bucket: nbucket, nchain, bucket[0], chain[0..5].
const HASH_DATA: [u32; 8] = [1, 5, 4, 0, 0, 1, 2, 3];

fn u16(v: u16) -> U16<Endianness> {
    U16::new(Endianness::Little, v)
}
fn u32(v: u32) -> U32<Endianness> {
    U32::new(Endianness::Little, v)
}
fn u64(v: u64) -> U64<Endianness> {
    U64::new(Endianness::Little, v)
}
fn i64(v: i64) -> I64<Endianness> {
    I64::new(Endianness::Little, v)
}

fn offset_of(strings: &[u8], name: &str) -> u32 {
    let needle = format!("\0{}\0", name);
    strings
        .windows(needle.len())
        .position(|w| w == needle.as_bytes())
        .map(|p| p as u32 + 1)
        .unwrap()
}

struct Buffer(Vec<u8>);

impl Buffer {
    fn put(&mut self, offset: u64, bytes: &[u8]) {
        let offset = offset as usize;
        if self.0.len() < offset + bytes.len() {
            self.0.resize(offset + bytes.len(), 0);
        }
        self.0[offset..offset + bytes.len()].copy_from_slice(bytes);
    }

    fn put_all<T: Pod>(&mut self, offset: u64, items: &[T]) -> u64 {
        let size = std::mem::size_of::<T>() as u64;
        for (i, item) in items.iter().enumerate() {
            self.put(offset + i as u64 * size, bytes_of(item));
        }
        size * items.len() as u64
    }
}

fn sym(name: &str, value: u64, size: u64, shndx: u16) -> elf::Sym64<Endianness> {
    let st_name = if name.is_empty() {
        0
    } else {
        offset_of(DYNSTR_DATA, name)
    };
    let st_info = if name.is_empty() {
        0
    } else {
        (elf::STB_GLOBAL << 4) | elf::STT_FUNC
    };
    elf::Sym64 {
        st_name: u32(st_name),
        st_info,
        st_other: 0,
        st_shndx: u16(shndx),
        st_value: u64(value),
        st_size: u64(size),
    }
}

fn rela(offset: u64, symbol: u32, kind: u32, addend: i64) -> elf::Rela64<Endianness> {
    elf::Rela64 {
        r_offset: u64(offset),
        r_info: u64((u64::from(symbol) << 32) | u64::from(kind)),
        r_addend: i64(addend),
    }
}

fn dynamic(tag: u32, value: u64) -> elf::Dyn64<Endianness> {
    elf::Dyn64 {
        d_tag: u64(u64::from(tag)),
        d_val: u64(value),
    }
}

fn section(
    name: &str,
    kind: u32,
    flags: u32,
    offset: u64,
    size: u64,
    link: u32,
    entsize: u64,
) -> elf::SectionHeader64<Endianness> {
    let sh_name = if name.is_empty() {
        0
    } else {
        offset_of(SHSTRTAB_DATA, name)
    };
    elf::SectionHeader64 {
        sh_name: u32(sh_name),
        sh_type: u32(kind),
        sh_flags: u64(u64::from(flags)),
        sh_addr: u64(if flags & elf::SHF_ALLOC != 0 { offset } else { 0 }),
        sh_offset: u64(offset),
        sh_size: u64(size),
        sh_link: u32(link),
        sh_info: u32(0),
        sh_addralign: u64(8),
        sh_entsize: u64(entsize),
    }
}

/// Builds the shared object described in the module docs.
pub fn shared_object() -> Vec<u8> {
    let mut buf = Buffer(Vec::new());

    let syms = [
        sym("", 0, 0, 0),
        sym("puts", 0, 0, 0),
        sym("answer", TEXT, ANSWER_CODE.len() as u64, 6),
        sym("counter", COUNTER, 8, 7),
        sym("main", MAIN, MAIN_CODE.len() as u64, 6),
    ];
    let dynsym_size = buf.put_all(DYNSYM, &syms);
    buf.put(DYNSTR, DYNSTR_DATA);
    let hash_size = buf.put_all(HASH, &HASH_DATA.map(u32));

    let relas = [
        rela(RELATIVE_SLOT, 0, elf::R_X86_64_RELATIVE, TEXT as i64),
        rela(ABS_SLOT, 2, elf::R_X86_64_64, 4),
        rela(GLOB_DAT_SLOT, 1, elf::R_X86_64_GLOB_DAT, 0),
    ];
    let rela_dyn_size = buf.put_all(RELA_DYN, &relas);
    let rela_plt_size = buf.put_all(
        RELA_PLT,
        &[rela(JUMP_SLOT, 1, elf::R_X86_64_JUMP_SLOT, 0)],
    );

    let rela_entsize = std::mem::size_of::<elf::Rela64<Endianness>>() as u64;
    let dyns = [
        dynamic(elf::DT_NEEDED, u64::from(offset_of(DYNSTR_DATA, "libc.so.6"))),
        dynamic(elf::DT_RELA, RELA_DYN),
        dynamic(elf::DT_RELASZ, rela_dyn_size),
        dynamic(elf::DT_RELAENT, rela_entsize),
        dynamic(elf::DT_JMPREL, RELA_PLT),
        dynamic(elf::DT_PLTRELSZ, rela_plt_size),
        dynamic(elf::DT_PLTREL, u64::from(elf::DT_RELA)),
        dynamic(elf::DT_PLTGOT, DATA + 0x8),
        dynamic(elf::DT_STRTAB, DYNSTR),
        dynamic(elf::DT_STRSZ, DYNSTR_DATA.len() as u64),
        dynamic(elf::DT_SYMTAB, DYNSYM),
        dynamic(elf::DT_SYMENT, std::mem::size_of::<elf::Sym64<Endianness>>() as u64),
        dynamic(elf::DT_HASH, HASH),
        dynamic(elf::DT_NULL, 0),
    ];
    let dynamic_size = buf.put_all(DYNAMIC, &dyns);
    buf.put(SHSTRTAB, SHSTRTAB_DATA);

    buf.put(TEXT, &ANSWER_CODE);
    buf.put(MAIN, &MAIN_CODE);
    buf.put(COUNTER, &7u64.to_le_bytes());
    buf.put(DATA + 0x40, &[0]);

    let alloc = elf::SHF_ALLOC;
    let sections = [
        section("", elf::SHT_NULL, 0, 0, 0, 0, 0),
        section(".dynsym", elf::SHT_DYNSYM, alloc, DYNSYM, dynsym_size, 2, 24),
        section(".dynstr", elf::SHT_STRTAB, alloc, DYNSTR, DYNSTR_DATA.len() as u64, 0, 0),
        section(".rela.dyn", elf::SHT_RELA, alloc, RELA_DYN, rela_dyn_size, 1, rela_entsize),
        section(".rela.plt", elf::SHT_RELA, alloc, RELA_PLT, rela_plt_size, 1, rela_entsize),
        section(".dynamic", elf::SHT_DYNAMIC, alloc | elf::SHF_WRITE, DYNAMIC, dynamic_size, 2, 16),
        section(".text", elf::SHT_PROGBITS, alloc | elf::SHF_EXECINSTR, TEXT, MAIN + MAIN_CODE.len() as u64 - TEXT, 0, 0),
        section(".data", elf::SHT_PROGBITS, alloc | elf::SHF_WRITE, DATA, 0x40, 0, 0),
        section(".shstrtab", elf::SHT_STRTAB, 0, SHSTRTAB, SHSTRTAB_DATA.len() as u64, 0, 0),
        section(".hash", elf::SHT_HASH, alloc, HASH, hash_size, 1, 4),
    ];
    let headers_size = buf.put_all(SECTION_HEADERS, &sections);
    let file_size = SECTION_HEADERS + headers_size;

    let phdrs = [
        elf::ProgramHeader64::<Endianness> {
            p_type: u32(elf::PT_LOAD),
            p_flags: u32(elf::PF_R | elf::PF_W | elf::PF_X),
            p_offset: u64(0),
            p_vaddr: u64(0),
            p_paddr: u64(0),
            p_filesz: u64(file_size),
            p_memsz: u64(file_size),
            p_align: u64(0x1000),
        },
        elf::ProgramHeader64::<Endianness> {
            p_type: u32(elf::PT_DYNAMIC),
            p_flags: u32(elf::PF_R | elf::PF_W),
            p_offset: u64(DYNAMIC),
            p_vaddr: u64(DYNAMIC),
            p_paddr: u64(DYNAMIC),
            p_filesz: u64(dynamic_size),
            p_memsz: u64(dynamic_size),
            p_align: u64(8),
        },
    ];

    let file_header = elf::FileHeader64::<Endianness> {
        e_ident: elf::Ident {
            magic: elf::ELFMAG,
            class: elf::ELFCLASS64,
            data: elf::ELFDATA2LSB,
            version: elf::EV_CURRENT,
            os_abi: elf::ELFOSABI_SYSV,
            abi_version: 0,
            padding: [0; 7],
        },
        e_type: u16(elf::ET_DYN),
        e_machine: u16(elf::EM_X86_64),
        e_version: u32(elf::EV_CURRENT as u32),
        e_entry: u64(TEXT),
        e_phoff: u64(64),
        e_shoff: u64(SECTION_HEADERS),
        e_flags: u32(0),
        e_ehsize: u16(64),
        e_phentsize: u16(56),
        e_phnum: u16(phdrs.len() as u16),
        e_shentsize: u16(64),
        e_shnum: u16(sections.len() as u16),
        e_shstrndx: u16(8),
    };
    buf.put(0, bytes_of(&file_header));
    buf.put_all(64, &phdrs);

    buf.0
}

/// The same shared object with its section headers removed, as `strip` leaves
/// some binaries: `e_shoff`, `e_shnum` and `e_shstrndx` are zero.
pub fn stripped_shared_object() -> Vec<u8> {
    let mut data = shared_object();
    data[0x28..0x30].fill(0);
    data[0x3c..0x40].fill(0);
    data
}

/// Writes `bytes` to a fresh file under the temporary directory.
pub fn write_temp(name: &str, bytes: &[u8]) -> PathBuf {
    let path = std::env::temp_dir().join(format!("xld-{}-{}", std::process::id(), name));
    std::fs::write(&path, bytes).unwrap();
    path
}
