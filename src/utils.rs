//! Utility functions.
//!
//! Page arithmetic and endian-explicit integer loads/stores. Nothing here knows about
//! loaders or targets.

use object::{Endian, Endianness};

pub const PAGE_SIZE: u64 = 0x1000;

/// Aligns an address or size up to the next multiple of `align`.
/// `align` must be a power of two.
pub fn align_up(addr: u64, align: u64) -> u64 {
    debug_assert!(align.is_power_of_two());
    (addr + align - 1) & !(align - 1)
}

pub fn page_mask(page_size: u64) -> u64 {
    !(page_size - 1)
}

/// Start of the page containing `addr`.
pub fn page_start(addr: u64) -> u64 {
    addr & page_mask(PAGE_SIZE)
}

/// Rounds `addr` up to a page boundary.
pub fn page_align(addr: u64) -> u64 {
    align_up(addr, PAGE_SIZE)
}

/// Offset of `addr` within its page.
pub fn page_offset(addr: u64) -> u64 {
    addr & (PAGE_SIZE - 1)
}

/// Reads an unsigned integer of `buf.len()` bytes (4 or 8) in the given byte order.
pub fn load(endian: Endianness, buf: &[u8]) -> u64 {
    match buf.len() {
        4 => {
            let mut bytes = [0u8; 4];
            bytes.copy_from_slice(buf);
            u64::from(endian.read_u32_bytes(bytes))
        }
        8 => {
            let mut bytes = [0u8; 8];
            bytes.copy_from_slice(buf);
            endian.read_u64_bytes(bytes)
        }
        n => panic!("unsupported integer width: {}", n),
    }
}

/// Writes `value` truncated to `buf.len()` bytes (4 or 8) in the given byte order.
pub fn store(endian: Endianness, buf: &mut [u8], value: u64) {
    match buf.len() {
        4 => buf.copy_from_slice(&endian.write_u32_bytes(value as u32)),
        8 => buf.copy_from_slice(&endian.write_u64_bytes(value)),
        n => panic!("unsupported integer width: {}", n),
    }
}

/// Reads a NUL-terminated string starting at `offset`.
pub(crate) fn read_cstr(data: &[u8], offset: usize) -> Option<&[u8]> {
    let tail = data.get(offset..)?;
    let len = tail.iter().position(|&b| b == 0)?;
    Some(&tail[..len])
}
