// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use windows_sys::Win32::Foundation::{GetLastError, LocalFree, SysAllocStringLen, SysFreeString, SysStringByteLen};
use windows_sys::Win32::Globalization::GetACP;
use windows_sys::Win32::System::Com::{CoTaskMemAlloc, CoTaskMemFree, CoTaskMemRealloc};
use windows_sys::Win32::System::Memory::{LMEM_FIXED, LMEM_MOVEABLE, LocalAlloc, LocalReAlloc};

use crate::pal::Bindings;

/// FFI bindings that target the real operating system that the build is targeting.
///
/// The local heap is served by `LocalAlloc` and friends, the task heap by the COM task
/// allocator and automation strings by the OLE automation string allocator.
///
/// You would only use different bindings in PAL unit tests that need to use mock bindings.
/// Even then, whenever possible, unit tests should use real bindings for maximum realism.
#[derive(Debug, Default)]
pub struct BuildTargetBindings;

impl Bindings for BuildTargetBindings {
    #[cfg_attr(test, mutants::skip)] // Real PAL behavior is not meaningful to mutate, we try mutations manually via mock PAL.
    fn local_alloc(&self, size: usize) -> *mut u8 {
        // SAFETY: No safety requirements.
        unsafe { LocalAlloc(LMEM_FIXED, size) }.cast()
    }

    #[cfg_attr(test, mutants::skip)] // Real PAL behavior is not meaningful to mutate, we try mutations manually via mock PAL.
    unsafe fn local_realloc(&self, ptr: *mut u8, size: usize) -> *mut u8 {
        // SAFETY: We inherit and forward safety requirements from trait.
        unsafe { LocalReAlloc(ptr.cast(), size, LMEM_MOVEABLE) }.cast()
    }

    #[cfg_attr(test, mutants::skip)] // Real PAL behavior is not meaningful to mutate, we try mutations manually via mock PAL.
    unsafe fn local_free(&self, ptr: *mut u8) -> Result<(), i32> {
        // SAFETY: We inherit and forward safety requirements from trait.
        let remaining = unsafe { LocalFree(ptr.cast()) };

        if remaining.is_null() {
            Ok(())
        } else {
            // SAFETY: Nothing unsafe here, just an FFI call reading thread-local state.
            let code = unsafe { GetLastError() };

            #[expect(clippy::cast_possible_wrap, reason = "Win32 error codes are reported as signed integers")]
            Err(code as i32)
        }
    }

    #[cfg_attr(test, mutants::skip)] // Real PAL behavior is not meaningful to mutate, we try mutations manually via mock PAL.
    fn task_alloc(&self, size: usize) -> *mut u8 {
        // SAFETY: No safety requirements.
        unsafe { CoTaskMemAlloc(size) }.cast()
    }

    #[cfg_attr(test, mutants::skip)] // Real PAL behavior is not meaningful to mutate, we try mutations manually via mock PAL.
    unsafe fn task_realloc(&self, ptr: *mut u8, size: usize) -> *mut u8 {
        // SAFETY: We inherit and forward safety requirements from trait.
        unsafe { CoTaskMemRealloc(ptr.cast_const().cast(), size) }.cast()
    }

    #[cfg_attr(test, mutants::skip)] // Real PAL behavior is not meaningful to mutate, we try mutations manually via mock PAL.
    unsafe fn task_free(&self, ptr: *mut u8) {
        // SAFETY: We inherit and forward safety requirements from trait.
        unsafe { CoTaskMemFree(ptr.cast_const().cast()) };
    }

    #[cfg_attr(test, mutants::skip)] // Real PAL behavior is not meaningful to mutate, we try mutations manually via mock PAL.
    unsafe fn bstr_alloc(&self, units: *const u16, len: u32) -> *mut u16 {
        // SAFETY: We inherit and forward safety requirements from trait.
        unsafe { SysAllocStringLen(units, len) }.cast_mut()
    }

    #[cfg_attr(test, mutants::skip)] // Real PAL behavior is not meaningful to mutate, we try mutations manually via mock PAL.
    unsafe fn bstr_free(&self, bstr: *mut u16) {
        // SAFETY: We inherit and forward safety requirements from trait.
        unsafe { SysFreeString(bstr.cast_const()) };
    }

    #[cfg_attr(test, mutants::skip)] // Real PAL behavior is not meaningful to mutate, we try mutations manually via mock PAL.
    unsafe fn bstr_byte_len(&self, bstr: *const u16) -> u32 {
        // SAFETY: We inherit and forward safety requirements from trait.
        unsafe { SysStringByteLen(bstr) }
    }

    #[cfg_attr(test, mutants::skip)] // Real PAL behavior is not meaningful to mutate, we try mutations manually via mock PAL.
    fn ansi_code_page(&self) -> u32 {
        // SAFETY: No safety requirements.
        unsafe { GetACP() }
    }
}
