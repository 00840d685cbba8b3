use object::endian::{BigEndian as BE, U16, U32, U64};
use object::macho;
use object::pod::bytes_of;
use object::Endianness;

use xld::binary::dyld::{BindClass, RebaseKind};
use xld::binary::macho::{FatBinary, RelocationOrigin};
use xld::engine::vm::{VmMemory, VmSystem};
use xld::{loader, Arch, BindMode, Error, Image, MachOLoader, TargetMemory};

const IMAGEBASE: u64 = 0x1_0000_0000;
const DATA: u64 = IMAGEBASE + 0x1000;
const ENTRY: u64 = 0xf00;
const LIBSYSTEM: &str = "/usr/lib/libSystem.B.dylib";

const BASE: u64 = 0x2000_0000;
const PUTS: u64 = 0x7000_0100;
const MALLOC: u64 = 0x7000_0200;

fn u16(v: u16) -> U16<Endianness> {
    U16::new(Endianness::Little, v)
}
fn u32(v: u32) -> U32<Endianness> {
    U32::new(Endianness::Little, v)
}
fn u64(v: u64) -> U64<Endianness> {
    U64::new(Endianness::Little, v)
}

fn put(buf: &mut Vec<u8>, offset: usize, bytes: &[u8]) {
    if buf.len() < offset + bytes.len() {
        buf.resize(offset + bytes.len(), 0);
    }
    buf[offset..offset + bytes.len()].copy_from_slice(bytes);
}

fn segment(name: &str, vmaddr: u64, vmsize: u64, fileoff: u64, filesize: u64) -> Vec<u8> {
    let mut segname = [0u8; 16];
    segname[..name.len()].copy_from_slice(name.as_bytes());
    let command = macho::SegmentCommand64::<Endianness> {
        cmd: u32(macho::LC_SEGMENT_64),
        cmdsize: u32(72),
        segname,
        vmaddr: u64(vmaddr),
        vmsize: u64(vmsize),
        fileoff: u64(fileoff),
        filesize: u64(filesize),
        maxprot: u32(7),
        initprot: u32(if filesize == 0 { 0 } else { 7 }),
        nsects: u32(0),
        flags: u32(0),
    };
    bytes_of(&command).to_vec()
}

/// A thin x86_64 executable: `__TEXT` holds the header and `_answer` at 0xf00, `__DATA`
/// has one rebased pointer, a `_puts` binding and a lazy `_malloc` binding. Opcode
/// streams and the symbol table follow `__DATA` in the file.
fn executable() -> Vec<u8> {
    const REBASE: usize = 0x2000;
    const BIND: usize = 0x2020;
    const LAZY_BIND: usize = 0x2040;
    const SYMBOLS: usize = 0x2060;
    const STRINGS: usize = 0x2070;

    let rebase: &[u8] = &[0x11, 0x22, 0x10, 0x51, 0x00];
    let bind: &[u8] = &[
        0x11, 0x40, b'_', b'p', b'u', b't', b's', 0, 0x51, 0x72, 0x18, 0x90, 0x00,
    ];
    let lazy_bind: &[u8] = &[
        0x72, 0x20, 0x11, 0x40, b'_', b'm', b'a', b'l', b'l', b'o', b'c', 0, 0x90, 0x00,
    ];
    let strings: &[u8] = b"\0_answer\0";

    let mut commands = Vec::new();
    commands.push(segment("__PAGEZERO", 0, IMAGEBASE, 0, 0));
    commands.push(segment("__TEXT", IMAGEBASE, 0x1000, 0, 0x1000));
    commands.push(segment("__DATA", DATA, 0x1000, 0x1000, 0x1000));
    commands.push(
        bytes_of(&macho::EntryPointCommand::<Endianness> {
            cmd: u32(macho::LC_MAIN),
            cmdsize: u32(24),
            entryoff: u64(ENTRY),
            stacksize: u64(0),
        })
        .to_vec(),
    );
    commands.push(
        bytes_of(&macho::DyldInfoCommand::<Endianness> {
            cmd: u32(macho::LC_DYLD_INFO_ONLY),
            cmdsize: u32(48),
            rebase_off: u32(REBASE as u32),
            rebase_size: u32(rebase.len() as u32),
            bind_off: u32(BIND as u32),
            bind_size: u32(bind.len() as u32),
            weak_bind_off: u32(0),
            weak_bind_size: u32(0),
            lazy_bind_off: u32(LAZY_BIND as u32),
            lazy_bind_size: u32(lazy_bind.len() as u32),
            export_off: u32(0),
            export_size: u32(0),
        })
        .to_vec(),
    );
    commands.push(
        bytes_of(&macho::SymtabCommand::<Endianness> {
            cmd: u32(macho::LC_SYMTAB),
            cmdsize: u32(24),
            symoff: u32(SYMBOLS as u32),
            nsyms: u32(1),
            stroff: u32(STRINGS as u32),
            strsize: u32(strings.len() as u32),
        })
        .to_vec(),
    );
    let mut dylib = bytes_of(&macho::DylibCommand::<Endianness> {
        cmd: u32(macho::LC_LOAD_DYLIB),
        cmdsize: u32(56),
        dylib: macho::Dylib {
            name: macho::LcStr { offset: u32(24) },
            timestamp: u32(0),
            current_version: u32(0),
            compatibility_version: u32(0),
        },
    })
    .to_vec();
    dylib.extend_from_slice(LIBSYSTEM.as_bytes());
    dylib.resize(56, 0);
    commands.push(dylib);

    let sizeofcmds: usize = commands.iter().map(Vec::len).sum();
    let header = macho::MachHeader64::<Endianness> {
        // The magic is read big-endian; a little-endian image stores it byte-swapped.
        magic: U32::new(BE, macho::MH_CIGAM_64),
        cputype: u32(macho::CPU_TYPE_X86_64),
        cpusubtype: u32(3),
        filetype: u32(macho::MH_EXECUTE),
        ncmds: u32(commands.len() as u32),
        sizeofcmds: u32(sizeofcmds as u32),
        flags: u32(macho::MH_PIE),
        reserved: u32(0),
    };

    let mut buf = bytes_of(&header).to_vec();
    for command in &commands {
        buf.extend_from_slice(command);
    }
    put(&mut buf, ENTRY as usize, &[0xb8, 0x2a, 0x00, 0x00, 0x00, 0xc3]);
    put(&mut buf, 0x1010, &(IMAGEBASE + ENTRY).to_le_bytes());
    put(&mut buf, REBASE, rebase);
    put(&mut buf, BIND, bind);
    put(&mut buf, LAZY_BIND, lazy_bind);
    let nlist = macho::Nlist64::<Endianness> {
        n_strx: u32(1),
        n_type: macho::N_SECT | macho::N_EXT,
        n_sect: 1,
        n_desc: u16(0),
        n_value: u64(IMAGEBASE + ENTRY),
    };
    put(&mut buf, SYMBOLS, bytes_of(&nlist));
    put(&mut buf, STRINGS, strings);
    buf
}

/// Wraps `thin` in a single-slice universal binary.
fn universal(thin: &[u8]) -> Vec<u8> {
    let header = macho::FatHeader {
        magic: U32::new(BE, macho::FAT_MAGIC),
        nfat_arch: U32::new(BE, 1),
    };
    let arch = macho::FatArch32 {
        cputype: U32::new(BE, macho::CPU_TYPE_X86_64),
        cpusubtype: U32::new(BE, 3),
        offset: U32::new(BE, 0x1000),
        size: U32::new(BE, thin.len() as u32),
        align: U32::new(BE, 12),
    };
    let mut buf = bytes_of(&header).to_vec();
    buf.extend_from_slice(bytes_of(&arch));
    put(&mut buf, 0x1000, thin);
    buf
}

fn write_temp(name: &str, bytes: &[u8]) -> std::path::PathBuf {
    let path = std::env::temp_dir().join(format!("xld-{}-{}", std::process::id(), name));
    std::fs::write(&path, bytes).unwrap();
    path
}

fn system(mem: &VmMemory) -> VmSystem<'_> {
    VmSystem::new(mem, Arch::X86_64)
        .with_base_hint(BASE)
        .with_symbol("_puts", PUTS)
        .with_symbol("_malloc", MALLOC)
}

#[test]
fn parse_thin() {
    let fat = FatBinary::parse(&executable()).unwrap();
    assert_eq!(fat.len(), 1);
    let binary = fat.iter().next().unwrap();

    assert_eq!(binary.arch, Arch::X86_64);
    assert_eq!(binary.imagebase, IMAGEBASE);
    assert_eq!(binary.entrypoint, IMAGEBASE + ENTRY);
    assert_eq!(binary.virtual_size(), 0x2000);
    assert_eq!(binary.libraries(), [LIBSYSTEM]);
    assert_eq!(binary.symbols.len(), 1);
    assert_eq!(binary.symbols[0].name, "_answer");

    assert_eq!(binary.relocations.len(), 1);
    assert_eq!(binary.relocations[0].address, DATA + 0x10);
    assert_eq!(binary.relocations[0].kind, RebaseKind::Pointer);
    assert_eq!(binary.relocations[0].origin, RelocationOrigin::DyldInfo);

    let puts = binary.binding("_puts").unwrap();
    assert_eq!((puts.class, puts.address), (BindClass::Standard, DATA + 0x18));
    let malloc = binary.binding("_malloc").unwrap();
    assert_eq!(
        (malloc.class, malloc.address, malloc.lazy_offset),
        (BindClass::Lazy, DATA + 0x20, 0)
    );
}

#[test]
fn load_into_vm() {
    let mem = VmMemory::new();
    let system = system(&mem);
    let path = write_temp("macho-load", &executable());
    let loaded = loader::from_file(&path, None, &system, BindMode::Now).unwrap();
    std::fs::remove_file(&path).unwrap();

    assert_eq!(loaded.base_address(), BASE);
    assert_eq!(loaded.mem_size(), 0x2000);
    assert_eq!(loaded.entrypoint(), BASE + ENTRY);
    assert_eq!(loaded.symbol_address("answer"), BASE + ENTRY);
    assert_eq!(mem.read_vec(BASE + ENTRY, 1), [0xb8]);

    let ptr = |offset| mem.read_ptr(Arch::X86_64, BASE + 0x1000 + offset);
    assert_eq!(ptr(0x10), BASE + ENTRY);
    assert_eq!(ptr(0x18), PUTS);
    assert_eq!(ptr(0x20), MALLOC);
    assert_eq!(system.requests(), ["_puts", "_malloc"]);
}

#[test]
fn not_bind_then_resolve_lazily() {
    let mem = VmMemory::new();
    let system = system(&mem);
    let path = write_temp("macho-lazy", &executable());
    let loaded = MachOLoader::from_file(&path, Arch::X86_64, &system, BindMode::NotBind).unwrap();
    std::fs::remove_file(&path).unwrap();

    assert!(system.requests().is_empty());
    assert_eq!(loaded.resolve_lazy(0), Some(MALLOC));
    assert_eq!(mem.read_ptr(Arch::X86_64, BASE + 0x1020), MALLOC);
    assert_eq!(loaded.resolve_lazy(3), None);
}

#[test]
fn universal_binary() {
    let data = universal(&executable());
    let mut fat = FatBinary::parse(&data).unwrap();
    assert_eq!(fat.arches().collect::<Vec<_>>(), [Arch::X86_64]);

    assert!(MachOLoader::take_arch_binary(&mut fat, Arch::ARM64).is_none());
    let slice = MachOLoader::take_arch_binary(&mut fat, Arch::X86_64).unwrap();
    assert_eq!(slice.entrypoint, IMAGEBASE + ENTRY);
    assert!(fat.is_empty());

    let path = write_temp("macho-fat", &data);
    let mem = VmMemory::new();
    let system = system(&mem);
    let arm_mem = VmMemory::new();
    let arm = VmSystem::new(&arm_mem, Arch::ARM64);

    let loaded = loader::from_file(&path, None, &system, BindMode::Now);
    let foreign = loader::from_file(&path, None, &arm, BindMode::Now);
    let no_slice = MachOLoader::from_file(&path, Arch::ARM64, &arm, BindMode::Now);
    std::fs::remove_file(&path).unwrap();

    assert_eq!(loaded.unwrap().entrypoint(), BASE + ENTRY);
    assert!(matches!(foreign, Err(Error::UnsupportedArch(_))));
    assert!(matches!(no_slice, Err(Error::NoMatchingArch(_))));
}
