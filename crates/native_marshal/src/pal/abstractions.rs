// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::fmt::Debug;

/// Bindings for FFI calls into the native allocators and string primitives of the platform.
///
/// All native memory calls made by this crate must go through this trait, enabling them to be
/// mocked (and counted) in unit tests.
#[cfg_attr(test, mockall::automock)]
pub trait Bindings: Debug + Send + Sync + 'static {
    /// Allocates `size` bytes from the local heap. Returns null on failure.
    fn local_alloc(&self, size: usize) -> *mut u8;

    /// Resizes a local heap block, possibly moving it. Returns null on failure, in which case
    /// the original block is left untouched.
    ///
    /// # Safety
    ///
    /// `ptr` must be a live block obtained from the local heap of these bindings.
    unsafe fn local_realloc(&self, ptr: *mut u8, size: usize) -> *mut u8;

    /// Releases a local heap block. On failure, returns the platform error code.
    ///
    /// # Safety
    ///
    /// `ptr` must be a live block obtained from the local heap of these bindings.
    /// The block must not be used after this call.
    unsafe fn local_free(&self, ptr: *mut u8) -> Result<(), i32>;

    /// Allocates `size` bytes from the task heap. Returns null on failure.
    fn task_alloc(&self, size: usize) -> *mut u8;

    /// Resizes a task heap block, possibly moving it. A zero `size` releases the block and
    /// returns null.
    ///
    /// # Safety
    ///
    /// `ptr` must be null or a live block obtained from the task heap of these bindings.
    unsafe fn task_realloc(&self, ptr: *mut u8, size: usize) -> *mut u8;

    /// Releases a task heap block. The task allocator does not report failures.
    ///
    /// # Safety
    ///
    /// `ptr` must be null or a live block obtained from the task heap of these bindings.
    /// The block must not be used after this call.
    unsafe fn task_free(&self, ptr: *mut u8);

    /// Allocates a length-prefixed automation string holding `len` UTF-16 code units copied
    /// from `units`, followed by a terminating NUL. Returns null on failure.
    ///
    /// # Safety
    ///
    /// `units` must be valid for reads of `len` code units.
    unsafe fn bstr_alloc(&self, units: *const u16, len: u32) -> *mut u16;

    /// Releases an automation string.
    ///
    /// # Safety
    ///
    /// `bstr` must be null or a live string obtained from `bstr_alloc`.
    unsafe fn bstr_free(&self, bstr: *mut u16);

    /// Returns the payload length in bytes stored in the prefix of an automation string.
    ///
    /// # Safety
    ///
    /// `bstr` must be null or a live string obtained from `bstr_alloc`.
    unsafe fn bstr_byte_len(&self, bstr: *const u16) -> u32;

    /// Returns the identifier of the active single-byte ("ANSI") code page.
    fn ansi_code_page(&self) -> u32;
}
