//! dyld info opcode streams.
//!
//! `LC_DYLD_INFO` describes rebases and bindings as small byte-code programs instead of
//! tables. This module runs those programs and returns the flat list of fixups they
//! describe. Addresses are absolute link-time addresses (segment vmaddr plus offset).

use object::{Endian, Endianness};
use tracing::trace;

use crate::error::{Error, Result};

const REBASE_TYPE_POINTER: u8 = 1;
const REBASE_TYPE_TEXT_ABSOLUTE32: u8 = 2;
const REBASE_TYPE_TEXT_PCREL32: u8 = 3;

const REBASE_OPCODE_DONE: u8 = 0x00;
const REBASE_OPCODE_SET_TYPE_IMM: u8 = 0x10;
const REBASE_OPCODE_SET_SEGMENT_AND_OFFSET_ULEB: u8 = 0x20;
const REBASE_OPCODE_ADD_ADDR_ULEB: u8 = 0x30;
const REBASE_OPCODE_ADD_ADDR_IMM_SCALED: u8 = 0x40;
const REBASE_OPCODE_DO_REBASE_IMM_TIMES: u8 = 0x50;
const REBASE_OPCODE_DO_REBASE_ULEB_TIMES: u8 = 0x60;
const REBASE_OPCODE_DO_REBASE_ADD_ADDR_ULEB: u8 = 0x70;
const REBASE_OPCODE_DO_REBASE_ULEB_TIMES_SKIPPING_ULEB: u8 = 0x80;

const BIND_SYMBOL_FLAGS_WEAK_IMPORT: u8 = 0x1;

const BIND_OPCODE_DONE: u8 = 0x00;
const BIND_OPCODE_SET_DYLIB_ORDINAL_IMM: u8 = 0x10;
const BIND_OPCODE_SET_DYLIB_ORDINAL_ULEB: u8 = 0x20;
const BIND_OPCODE_SET_DYLIB_SPECIAL_IMM: u8 = 0x30;
const BIND_OPCODE_SET_SYMBOL_TRAILING_FLAGS_IMM: u8 = 0x40;
const BIND_OPCODE_SET_TYPE_IMM: u8 = 0x50;
const BIND_OPCODE_SET_ADDEND_SLEB: u8 = 0x60;
const BIND_OPCODE_SET_SEGMENT_AND_OFFSET_ULEB: u8 = 0x70;
const BIND_OPCODE_ADD_ADDR_ULEB: u8 = 0x80;
const BIND_OPCODE_DO_BIND: u8 = 0x90;
const BIND_OPCODE_DO_BIND_ADD_ADDR_ULEB: u8 = 0xA0;
const BIND_OPCODE_DO_BIND_ADD_ADDR_IMM_SCALED: u8 = 0xB0;
const BIND_OPCODE_DO_BIND_ULEB_TIMES_SKIPPING_ULEB: u8 = 0xC0;
const BIND_OPCODE_THREADED: u8 = 0xD0;

const BIND_SUBOPCODE_THREADED_SET_BIND_ORDINAL_TABLE_SIZE_ULEB: u8 = 0x00;
const BIND_SUBOPCODE_THREADED_APPLY: u8 = 0x01;

const OPCODE_MASK: u8 = 0xF0;
const IMMEDIATE_MASK: u8 = 0x0F;

/// What a rebase entry patches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RebaseKind {
    /// A pointer holding a link-time address.
    Pointer,
    TextAbsolute32,
    TextPcrel32,
    /// An arm64e chained pointer; `target` is the decoded link-time address.
    Threaded { target: u64 },
    Other(u8),
}

impl RebaseKind {
    fn from_type(kind: u8) -> Self {
        match kind {
            REBASE_TYPE_POINTER => RebaseKind::Pointer,
            REBASE_TYPE_TEXT_ABSOLUTE32 => RebaseKind::TextAbsolute32,
            REBASE_TYPE_TEXT_PCREL32 => RebaseKind::TextPcrel32,
            other => RebaseKind::Other(other),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rebase {
    pub address: u64,
    pub kind: RebaseKind,
}

/// Which stream a binding came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindClass {
    Standard,
    Weak,
    Lazy,
    /// A bind found while walking an arm64e pointer chain.
    Threaded,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindingInfo {
    pub class: BindClass,
    /// Link-time address of the pointer to bind.
    pub address: u64,
    pub symbol: String,
    pub library_ordinal: i64,
    pub addend: i64,
    /// Offset of the entry in the lazy bind stream, as pushed by the stub helper.
    pub lazy_offset: u64,
    pub weak_import: bool,
}

/// A segment as seen by the opcode programs: its link-time address and file content.
#[derive(Debug, Clone, Copy)]
pub struct SegmentView<'a> {
    pub address: u64,
    /// Size in memory; repeat opcodes may not step past it.
    pub size: u64,
    pub content: &'a [u8],
}

struct Cursor<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn is_empty(&self) -> bool {
        self.pos >= self.data.len()
    }

    fn u8(&mut self) -> Result<u8> {
        let byte = *self.data.get(self.pos).ok_or_else(truncated)?;
        self.pos += 1;
        Ok(byte)
    }

    fn uleb(&mut self) -> Result<u64> {
        let mut value = 0u64;
        let mut shift = 0;
        loop {
            let byte = self.u8()?;
            if shift < 64 {
                value |= u64::from(byte & 0x7f) << shift;
            }
            shift += 7;
            if byte & 0x80 == 0 {
                return Ok(value);
            }
        }
    }

    fn sleb(&mut self) -> Result<i64> {
        let mut value = 0i64;
        let mut shift = 0;
        loop {
            let byte = self.u8()?;
            if shift < 64 {
                value |= i64::from(byte & 0x7f) << shift;
            }
            shift += 7;
            if byte & 0x80 == 0 {
                if shift < 64 && byte & 0x40 != 0 {
                    value |= -1i64 << shift;
                }
                return Ok(value);
            }
        }
    }

    fn cstr(&mut self) -> Result<&'a [u8]> {
        let tail = self.data.get(self.pos..).ok_or_else(truncated)?;
        let len = tail.iter().position(|&b| b == 0).ok_or_else(truncated)?;
        self.pos += len + 1;
        Ok(&tail[..len])
    }
}

fn truncated() -> Error {
    Error::malformed("truncated dyld info")
}

fn segment_address(segments: &[SegmentView<'_>], index: u8, offset: u64) -> Result<u64> {
    segments
        .get(index as usize)
        .map(|s| s.address.wrapping_add(offset))
        .ok_or_else(|| Error::malformed(format!("dyld info refers to segment #{}", index)))
}

/// Rejects a repeat count that would step past the end of `segment`.
fn check_repeat(
    segments: &[SegmentView<'_>],
    segment: u8,
    count: u64,
    stride: u64,
) -> Result<()> {
    let size = segments.get(segment as usize).map_or(0, |s| s.size);
    if count > size / stride.max(1) + 1 {
        return Err(Error::malformed(format!(
            "{} repeats overrun segment #{}",
            count, segment
        )));
    }
    Ok(())
}

/// Runs a rebase opcode stream.
pub fn rebases(
    opcodes: &[u8],
    segments: &[SegmentView<'_>],
    pointer_size: u64,
) -> Result<Vec<Rebase>> {
    let mut cursor = Cursor::new(opcodes);
    let mut out = Vec::new();
    let mut kind = REBASE_TYPE_POINTER;
    let mut segment = 0u8;
    let mut offset = 0u64;

    let mut emit = |segment: u8, offset: u64, kind: u8| -> Result<()> {
        out.push(Rebase {
            address: segment_address(segments, segment, offset)?,
            kind: RebaseKind::from_type(kind),
        });
        Ok(())
    };

    while !cursor.is_empty() {
        let byte = cursor.u8()?;
        let imm = byte & IMMEDIATE_MASK;
        match byte & OPCODE_MASK {
            REBASE_OPCODE_DONE => break,
            REBASE_OPCODE_SET_TYPE_IMM => kind = imm,
            REBASE_OPCODE_SET_SEGMENT_AND_OFFSET_ULEB => {
                segment = imm;
                offset = cursor.uleb()?;
            }
            REBASE_OPCODE_ADD_ADDR_ULEB => offset = offset.wrapping_add(cursor.uleb()?),
            REBASE_OPCODE_ADD_ADDR_IMM_SCALED => {
                offset = offset.wrapping_add(u64::from(imm) * pointer_size)
            }
            REBASE_OPCODE_DO_REBASE_IMM_TIMES => {
                for _ in 0..imm {
                    emit(segment, offset, kind)?;
                    offset = offset.wrapping_add(pointer_size);
                }
            }
            REBASE_OPCODE_DO_REBASE_ULEB_TIMES => {
                let count = cursor.uleb()?;
                check_repeat(segments, segment, count, pointer_size)?;
                for _ in 0..count {
                    emit(segment, offset, kind)?;
                    offset = offset.wrapping_add(pointer_size);
                }
            }
            REBASE_OPCODE_DO_REBASE_ADD_ADDR_ULEB => {
                emit(segment, offset, kind)?;
                offset = offset.wrapping_add(cursor.uleb()?.wrapping_add(pointer_size));
            }
            REBASE_OPCODE_DO_REBASE_ULEB_TIMES_SKIPPING_ULEB => {
                let count = cursor.uleb()?;
                let skip = cursor.uleb()?;
                check_repeat(segments, segment, count, skip.saturating_add(pointer_size))?;
                for _ in 0..count {
                    emit(segment, offset, kind)?;
                    offset = offset.wrapping_add(skip.wrapping_add(pointer_size));
                }
            }
            op => return Err(Error::malformed(format!("unknown rebase opcode 0x{:x}", op))),
        }
    }
    trace!("{} rebases", out.len());
    Ok(out)
}

/// Fixups produced by a bind opcode stream.
#[derive(Debug, Default)]
pub struct Bindings {
    pub bindings: Vec<BindingInfo>,
    /// Rebases found in arm64e pointer chains.
    pub rebases: Vec<Rebase>,
}

#[derive(Clone)]
struct BindState {
    symbol: String,
    library_ordinal: i64,
    addend: i64,
    weak_import: bool,
}

impl BindState {
    fn binding(&self, class: BindClass, address: u64, lazy_offset: u64) -> BindingInfo {
        BindingInfo {
            class,
            address,
            symbol: self.symbol.clone(),
            library_ordinal: self.library_ordinal,
            addend: self.addend,
            lazy_offset,
            weak_import: self.weak_import,
        }
    }
}

/// Runs a bind opcode stream.
///
/// `class` tags the produced entries. In the lazy stream `DONE` only ends one entry and
/// each entry records the offset it starts at.
pub fn bindings(
    opcodes: &[u8],
    class: BindClass,
    segments: &[SegmentView<'_>],
    pointer_size: u64,
    imagebase: u64,
    endian: Endianness,
) -> Result<Bindings> {
    let mut cursor = Cursor::new(opcodes);
    let mut out = Bindings::default();
    let mut state = BindState {
        symbol: String::new(),
        library_ordinal: 0,
        addend: 0,
        weak_import: false,
    };
    let mut segment = 0u8;
    let mut offset = 0u64;
    let mut entry_start = 0u64;
    // Set once BIND_OPCODE_THREADED announces an ordinal table; DO_BIND then fills it.
    let mut ordinal_table: Option<Vec<BindState>> = None;

    while !cursor.is_empty() {
        let start = cursor.pos as u64;
        let byte = cursor.u8()?;
        let imm = byte & IMMEDIATE_MASK;
        let mut bind_at = |segment: u8, offset: u64, out: &mut Bindings| -> Result<()> {
            if let Some(table) = ordinal_table.as_mut() {
                table.push(state.clone());
                return Ok(());
            }
            let address = segment_address(segments, segment, offset)?;
            out.bindings.push(state.binding(class, address, entry_start));
            Ok(())
        };

        match byte & OPCODE_MASK {
            BIND_OPCODE_DONE => {
                if class != BindClass::Lazy {
                    break;
                }
                entry_start = start + 1;
            }
            BIND_OPCODE_SET_DYLIB_ORDINAL_IMM => state.library_ordinal = i64::from(imm),
            BIND_OPCODE_SET_DYLIB_ORDINAL_ULEB => state.library_ordinal = cursor.uleb()? as i64,
            BIND_OPCODE_SET_DYLIB_SPECIAL_IMM => {
                state.library_ordinal = if imm == 0 {
                    0
                } else {
                    i64::from((OPCODE_MASK | imm) as i8)
                };
            }
            BIND_OPCODE_SET_SYMBOL_TRAILING_FLAGS_IMM => {
                state.symbol = String::from_utf8_lossy(cursor.cstr()?).into_owned();
                state.weak_import = imm & BIND_SYMBOL_FLAGS_WEAK_IMPORT != 0;
            }
            BIND_OPCODE_SET_TYPE_IMM => {}
            BIND_OPCODE_SET_ADDEND_SLEB => state.addend = cursor.sleb()?,
            BIND_OPCODE_SET_SEGMENT_AND_OFFSET_ULEB => {
                segment = imm;
                offset = cursor.uleb()?;
            }
            BIND_OPCODE_ADD_ADDR_ULEB => offset = offset.wrapping_add(cursor.uleb()?),
            BIND_OPCODE_DO_BIND => {
                bind_at(segment, offset, &mut out)?;
                offset = offset.wrapping_add(pointer_size);
            }
            BIND_OPCODE_DO_BIND_ADD_ADDR_ULEB => {
                bind_at(segment, offset, &mut out)?;
                offset = offset.wrapping_add(cursor.uleb()?.wrapping_add(pointer_size));
            }
            BIND_OPCODE_DO_BIND_ADD_ADDR_IMM_SCALED => {
                bind_at(segment, offset, &mut out)?;
                offset = offset.wrapping_add(u64::from(imm) * pointer_size + pointer_size);
            }
            BIND_OPCODE_DO_BIND_ULEB_TIMES_SKIPPING_ULEB => {
                let count = cursor.uleb()?;
                let skip = cursor.uleb()?;
                check_repeat(segments, segment, count, skip.saturating_add(pointer_size))?;
                for _ in 0..count {
                    bind_at(segment, offset, &mut out)?;
                    offset = offset.wrapping_add(skip.wrapping_add(pointer_size));
                }
            }
            BIND_OPCODE_THREADED => match imm {
                BIND_SUBOPCODE_THREADED_SET_BIND_ORDINAL_TABLE_SIZE_ULEB => {
                    let size = cursor.uleb()? as usize;
                    ordinal_table = Some(Vec::with_capacity(size.min(0x10000)));
                }
                BIND_SUBOPCODE_THREADED_APPLY => {
                    let table = ordinal_table.as_deref().unwrap_or(&[]);
                    walk_chain(segments, segment, offset, imagebase, endian, table, &mut out)?;
                }
                sub => {
                    return Err(Error::malformed(format!(
                        "unknown threaded bind sub-opcode 0x{:x}",
                        sub
                    )))
                }
            },
            op => return Err(Error::malformed(format!("unknown bind opcode 0x{:x}", op))),
        }
    }
    trace!("{:?}: {} bindings", class, out.bindings.len());
    Ok(out)
}

/// Follows an arm64e pointer chain starting at `segment + offset`.
fn walk_chain(
    segments: &[SegmentView<'_>],
    segment: u8,
    mut offset: u64,
    imagebase: u64,
    endian: Endianness,
    table: &[BindState],
    out: &mut Bindings,
) -> Result<()> {
    let view = segments
        .get(segment as usize)
        .ok_or_else(|| Error::malformed(format!("pointer chain in segment #{}", segment)))?;
    loop {
        let bytes = (offset as usize)
            .checked_add(8)
            .and_then(|end| view.content.get(offset as usize..end))
            .ok_or_else(|| Error::malformed("pointer chain outside of segment"))?;
        let mut raw = [0u8; 8];
        raw.copy_from_slice(bytes);
        let value = endian.read_u64_bytes(raw);
        let address = view.address.wrapping_add(offset);

        let is_auth = value & (1 << 63) != 0;
        let is_bind = value & (1 << 62) != 0;
        if is_bind {
            let ordinal = (value & 0xFFFF) as usize;
            let entry = table.get(ordinal).ok_or_else(|| {
                Error::malformed(format!("chained bind ordinal {} out of range", ordinal))
            })?;
            out.bindings.push(entry.binding(BindClass::Threaded, address, 0));
        } else {
            let target = if is_auth {
                imagebase.wrapping_add(value & 0xFFFF_FFFF)
            } else {
                let top8 = (value >> 43) & 0xFF;
                (value & 0x7FF_FFFF_FFFF) | (top8 << 56)
            };
            out.rebases.push(Rebase {
                address,
                kind: RebaseKind::Threaded { target },
            });
        }

        let delta = (value >> 51) & 0x7FF;
        if delta == 0 {
            return Ok(());
        }
        offset = offset
            .checked_add(delta * 8)
            .ok_or_else(|| Error::malformed("pointer chain outside of segment"))?;
    }
}
