//! Mach-O lazy binding trampolines.
//!
//! A lazy stub jumps into `__stub_helper`, which pushes two words and jumps through the
//! `dyld_stub_binder` pointer:
//! - x86_64: `[rsp]` is the image cache cell, `[rsp + 8]` the lazy bind offset and
//!   `[rsp + 16]` the return address of the original call.
//! - aarch64: `[sp]` is the lazy bind offset, `[sp + 8]` the image cache cell and `lr`
//!   the return address of the original call.
//!
//! The cache cell (`__dyld_private`) is not described by any load command. It is found by
//! pointing the binder slot at [`dry_call`] and calling a stub helper entry once: the dry
//! call drops the two words and returns the cache cell address. The slot is then pointed
//! at the trampoline, which saves the argument registers, calls [`resolve_lazy_binding`]
//! with `(cache cell, offset)` and tail-jumps to the resolved function with the original
//! arguments and return address.
//!
//! Only the native target can use these: the loaded code has to be able to call into
//! this process.

use std::ffi::c_void;

use tracing::error;

use crate::loader::macho::MachOLoader;

/// Whether the host has trampolines.
pub const SUPPORTED: bool = cfg!(any(target_arch = "x86_64", target_arch = "aarch64"));

/// Called by the trampoline with the cache cell and the lazy bind offset pushed by the
/// stub helper. Returns the address to jump to.
///
/// There is no locking: two threads taking the same stub for the first time both resolve
/// it and write the same value.
#[cfg_attr(not(any(target_arch = "x86_64", target_arch = "aarch64")), allow(dead_code))]
unsafe extern "C" fn resolve_lazy_binding(cache: *const *const c_void, offset: u64) -> u64 {
    // SAFETY: the cache cell was filled with a boxed loader pointer by `MachOLoader`.
    let loader = unsafe {
        cache
            .as_ref()
            .and_then(|cell| cell.cast::<MachOLoader<'static>>().as_ref())
    };
    let Some(loader) = loader else {
        error!("Lazy binding called without a loader (cache cell {:p})", cache);
        std::process::abort();
    };
    match loader.resolve_lazy(offset) {
        Some(addr) if addr != 0 => addr,
        _ => {
            error!("Lazy binding at offset 0x{:x} can't be resolved", offset);
            std::process::abort();
        }
    }
}

#[cfg(target_arch = "x86_64")]
#[unsafe(naked)]
unsafe extern "C" fn dry_call() {
    core::arch::naked_asm!(
        "mov rax, [rsp]",
        "add rsp, 16",
        "ret",
    )
}

#[cfg(target_arch = "x86_64")]
#[unsafe(naked)]
unsafe extern "C" fn trampoline() {
    core::arch::naked_asm!(
        "push rbp",
        "mov rbp, rsp",
        "sub rsp, 0xc0",
        "mov [rsp + 0x00], rdi",
        "mov [rsp + 0x08], rsi",
        "mov [rsp + 0x10], rdx",
        "mov [rsp + 0x18], rcx",
        "mov [rsp + 0x20], r8",
        "mov [rsp + 0x28], r9",
        "mov [rsp + 0x30], rax",
        "movdqu [rsp + 0x40], xmm0",
        "movdqu [rsp + 0x50], xmm1",
        "movdqu [rsp + 0x60], xmm2",
        "movdqu [rsp + 0x70], xmm3",
        "movdqu [rsp + 0x80], xmm4",
        "movdqu [rsp + 0x90], xmm5",
        "movdqu [rsp + 0xa0], xmm6",
        "movdqu [rsp + 0xb0], xmm7",
        "mov rdi, [rbp + 8]",
        "mov rsi, [rbp + 16]",
        "call {resolve}",
        "mov r11, rax",
        "movdqu xmm7, [rsp + 0xb0]",
        "movdqu xmm6, [rsp + 0xa0]",
        "movdqu xmm5, [rsp + 0x90]",
        "movdqu xmm4, [rsp + 0x80]",
        "movdqu xmm3, [rsp + 0x70]",
        "movdqu xmm2, [rsp + 0x60]",
        "movdqu xmm1, [rsp + 0x50]",
        "movdqu xmm0, [rsp + 0x40]",
        "mov rax, [rsp + 0x30]",
        "mov r9, [rsp + 0x28]",
        "mov r8, [rsp + 0x20]",
        "mov rcx, [rsp + 0x18]",
        "mov rdx, [rsp + 0x10]",
        "mov rsi, [rsp + 0x08]",
        "mov rdi, [rsp + 0x00]",
        "mov rsp, rbp",
        "pop rbp",
        // Drop the cache cell and the offset; the original return address is on top.
        "add rsp, 16",
        "jmp r11",
        resolve = sym resolve_lazy_binding,
    )
}

#[cfg(target_arch = "aarch64")]
#[unsafe(naked)]
unsafe extern "C" fn dry_call() {
    core::arch::naked_asm!(
        "ldr x0, [sp, #8]",
        "add sp, sp, #16",
        "ret",
    )
}

#[cfg(target_arch = "aarch64")]
#[unsafe(naked)]
unsafe extern "C" fn trampoline() {
    core::arch::naked_asm!(
        "stp x29, x30, [sp, #-16]!",
        "mov x29, sp",
        "sub sp, sp, #208",
        "stp x0, x1, [sp, #0]",
        "stp x2, x3, [sp, #16]",
        "stp x4, x5, [sp, #32]",
        "stp x6, x7, [sp, #48]",
        "str x8, [sp, #64]",
        "stp q0, q1, [sp, #80]",
        "stp q2, q3, [sp, #112]",
        "stp q4, q5, [sp, #144]",
        "stp q6, q7, [sp, #176]",
        "ldr x0, [x29, #24]",
        "ldr x1, [x29, #16]",
        "bl {resolve}",
        "mov x16, x0",
        "ldp q6, q7, [sp, #176]",
        "ldp q4, q5, [sp, #144]",
        "ldp q2, q3, [sp, #112]",
        "ldp q0, q1, [sp, #80]",
        "ldr x8, [sp, #64]",
        "ldp x6, x7, [sp, #48]",
        "ldp x4, x5, [sp, #32]",
        "ldp x2, x3, [sp, #16]",
        "ldp x0, x1, [sp, #0]",
        "mov sp, x29",
        "ldp x29, x30, [sp], #16",
        // Drop the offset and the cache cell.
        "add sp, sp, #16",
        "br x16",
        resolve = sym resolve_lazy_binding,
    )
}

/// Address to store in the binder slot while probing for the cache cell.
#[cfg(any(target_arch = "x86_64", target_arch = "aarch64"))]
pub(crate) fn dry_call_address() -> u64 {
    dry_call as *const () as usize as u64
}

/// Address to store in the binder slot once the cache cell holds the loader.
#[cfg(any(target_arch = "x86_64", target_arch = "aarch64"))]
pub(crate) fn trampoline_address() -> u64 {
    trampoline as *const () as usize as u64
}

/// Runs the stub helper entry at `helper` with the dry call installed and returns the
/// cache cell address it pushed.
///
/// # Safety
///
/// `helper` must be a mapped `__stub_helper` entry whose binder slot points to
/// [`dry_call_address`].
#[cfg(any(target_arch = "x86_64", target_arch = "aarch64"))]
pub(crate) unsafe fn probe_cache_cell(helper: u64) -> u64 {
    // SAFETY: guaranteed by the caller; the helper returns straight to us through the
    // dry call.
    let entry: unsafe extern "C" fn() -> u64 = unsafe { std::mem::transmute(helper as usize) };
    unsafe { entry() }
}

#[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
pub(crate) fn dry_call_address() -> u64 {
    0
}

#[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
pub(crate) fn trampoline_address() -> u64 {
    0
}

#[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
pub(crate) unsafe fn probe_cache_cell(_helper: u64) -> u64 {
    0
}

#[cfg(all(test, unix, target_arch = "x86_64"))]
mod tests {
    use super::*;
    use crate::arch::Arch;
    use crate::engine::native::NativeMemory;
    use crate::engine::TargetMemory;

    /// A stub helper that pushes `offset` and `cache` the way ld64 lays them out, then
    /// jumps through the binder slot that follows the code.
    fn stub_helper(cache: u64, offset: u32) -> Vec<u8> {
        let mut code = Vec::new();
        // push imm32
        code.push(0x68);
        code.extend_from_slice(&offset.to_le_bytes());
        // movabs r11, cache; push r11
        code.extend_from_slice(&[0x49, 0xbb]);
        code.extend_from_slice(&cache.to_le_bytes());
        code.extend_from_slice(&[0x41, 0x53]);
        // jmp [rip + 0]
        code.extend_from_slice(&[0xff, 0x25, 0, 0, 0, 0]);
        code
    }

    #[test]
    fn dry_call_reports_cache_cell() {
        let mem = NativeMemory::new();
        let page = mem.mmap(0, 0x1000);
        assert_ne!(page, 0);

        let cache = page + 0x800;
        let code = stub_helper(cache, 0x42);
        mem.write(page, &code);
        let binder_slot = page + code.len() as u64;
        mem.write_ptr(Arch::native(), binder_slot, dry_call_address());

        let found = unsafe { probe_cache_cell(page) };
        assert_eq!(found, cache);
    }
}
