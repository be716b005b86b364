// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::ptr;

use crate::pal::Bindings;

/// Size of the byte-length prefix that precedes the payload of an automation string.
const BSTR_PREFIX_BYTES: usize = size_of::<u32>();

/// The UTF-8 code page identifier. Unix platforms have no other "ANSI" code page.
const CP_UTF8: u32 = 65001;

/// FFI bindings that target the real operating system that the build is targeting.
///
/// Both heap families are served by the C runtime allocator. They remain separate families
/// at the API level even though the platform does not distinguish them.
///
/// You would only use different bindings in PAL unit tests that need to use mock bindings.
/// Even then, whenever possible, unit tests should use real bindings for maximum realism.
#[derive(Debug, Default)]
pub struct BuildTargetBindings;

impl Bindings for BuildTargetBindings {
    #[cfg_attr(test, mutants::skip)] // Real PAL behavior is not meaningful to mutate, we try mutations manually via mock PAL.
    fn local_alloc(&self, size: usize) -> *mut u8 {
        // Zero-byte requests are rounded up so that success is never reported as null.
        // SAFETY: No safety requirements.
        unsafe { libc::malloc(size.max(1)) }.cast()
    }

    #[cfg_attr(test, mutants::skip)] // Real PAL behavior is not meaningful to mutate, we try mutations manually via mock PAL.
    unsafe fn local_realloc(&self, ptr: *mut u8, size: usize) -> *mut u8 {
        // SAFETY: We inherit and forward safety requirements from trait.
        unsafe { libc::realloc(ptr.cast(), size.max(1)) }.cast()
    }

    #[cfg_attr(test, mutants::skip)] // Real PAL behavior is not meaningful to mutate, we try mutations manually via mock PAL.
    unsafe fn local_free(&self, ptr: *mut u8) -> Result<(), i32> {
        // SAFETY: We inherit and forward safety requirements from trait.
        unsafe { libc::free(ptr.cast()) };

        // free() has no failure channel.
        Ok(())
    }

    #[cfg_attr(test, mutants::skip)] // Real PAL behavior is not meaningful to mutate, we try mutations manually via mock PAL.
    fn task_alloc(&self, size: usize) -> *mut u8 {
        // SAFETY: No safety requirements.
        unsafe { libc::malloc(size.max(1)) }.cast()
    }

    #[cfg_attr(test, mutants::skip)] // Real PAL behavior is not meaningful to mutate, we try mutations manually via mock PAL.
    unsafe fn task_realloc(&self, ptr: *mut u8, size: usize) -> *mut u8 {
        if size == 0 {
            // realloc(p, 0) is implementation-defined, so we spell out the task heap contract.
            // SAFETY: We inherit and forward safety requirements from trait.
            unsafe { libc::free(ptr.cast()) };
            return ptr::null_mut();
        }

        // SAFETY: We inherit and forward safety requirements from trait.
        unsafe { libc::realloc(ptr.cast(), size) }.cast()
    }

    #[cfg_attr(test, mutants::skip)] // Real PAL behavior is not meaningful to mutate, we try mutations manually via mock PAL.
    unsafe fn task_free(&self, ptr: *mut u8) {
        // SAFETY: We inherit and forward safety requirements from trait.
        unsafe { libc::free(ptr.cast()) };
    }

    #[cfg_attr(test, mutants::skip)] // Real PAL behavior is not meaningful to mutate, we try mutations manually via mock PAL.
    unsafe fn bstr_alloc(&self, units: *const u16, len: u32) -> *mut u16 {
        // Layout: [u32 payload byte length][payload][u16 NUL]. The handle points at the payload.
        let payload_bytes = len as usize * size_of::<u16>();
        let total = BSTR_PREFIX_BYTES + payload_bytes + size_of::<u16>();

        // SAFETY: No safety requirements.
        let block = unsafe { libc::malloc(total) }.cast::<u8>();
        if block.is_null() {
            return ptr::null_mut();
        }

        #[expect(clippy::cast_possible_truncation, reason = "len is a u32 and the caller limits it to fit after doubling")]
        let prefix = payload_bytes as u32;

        // SAFETY: The block is at least BSTR_PREFIX_BYTES long.
        unsafe { block.cast::<u32>().write_unaligned(prefix) };

        // SAFETY: The prefix lies within the block, so the payload start is in bounds.
        let payload = unsafe { block.add(BSTR_PREFIX_BYTES) };

        if !units.is_null() {
            // SAFETY: The caller guarantees `units` is readable for `len` code units and the
            // block has room for exactly that many bytes after the prefix.
            unsafe { ptr::copy_nonoverlapping(units.cast::<u8>(), payload, payload_bytes) };
        }

        // SAFETY: The terminator slot is the last two bytes of the block.
        let terminator = unsafe { payload.add(payload_bytes) };

        // SAFETY: See above.
        unsafe { terminator.cast::<u16>().write_unaligned(0) };

        payload.cast()
    }

    #[cfg_attr(test, mutants::skip)] // Real PAL behavior is not meaningful to mutate, we try mutations manually via mock PAL.
    unsafe fn bstr_free(&self, bstr: *mut u16) {
        if bstr.is_null() {
            return;
        }

        // SAFETY: The caller guarantees this came from bstr_alloc, which returns a pointer
        // exactly BSTR_PREFIX_BYTES past the start of the malloc block.
        let block = unsafe { bstr.cast::<u8>().sub(BSTR_PREFIX_BYTES) };

        // SAFETY: `block` is the pointer malloc returned.
        unsafe { libc::free(block.cast()) };
    }

    #[cfg_attr(test, mutants::skip)] // Real PAL behavior is not meaningful to mutate, we try mutations manually via mock PAL.
    unsafe fn bstr_byte_len(&self, bstr: *const u16) -> u32 {
        if bstr.is_null() {
            return 0;
        }

        // SAFETY: The caller guarantees this came from bstr_alloc, so the prefix precedes it.
        let prefix = unsafe { bstr.cast::<u8>().sub(BSTR_PREFIX_BYTES) };

        // SAFETY: The prefix is a u32 written by bstr_alloc.
        unsafe { prefix.cast::<u32>().read_unaligned() }
    }

    #[cfg_attr(test, mutants::skip)] // Real PAL behavior is not meaningful to mutate, we try mutations manually via mock PAL.
    fn ansi_code_page(&self) -> u32 {
        CP_UTF8
    }
}
