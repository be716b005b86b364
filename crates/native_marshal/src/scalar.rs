// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Unchecked scalar access to native memory and bulk copies between slices and native memory.
//!
//! The scalar accessors perform no bounds or alignment checks. Addresses need not be aligned
//! for the scalar type. The caller guarantees that `ptr + offset` is readable or writable for
//! the size of the scalar.

use std::ptr;

use tracing::{Level, event};

use crate::{Error, Result};

mod sealed {
    pub trait Sealed {}
}

/// A plain scalar type that can be copied to and from native memory byte for byte.
///
/// Every bit pattern of the right size is a valid value of an implementing type. This trait
/// is sealed.
pub trait NativeScalar: sealed::Sealed + Copy + Send + Sync + 'static {}

macro_rules! native_scalar {
    ($($t:ty),* $(,)?) => {
        $(
            impl sealed::Sealed for $t {}
            impl NativeScalar for $t {}
        )*
    };
}

native_scalar!(i8, u8, i16, u16, i32, u32, i64, u64, f32, f64, isize, usize);

/// Reads a `T` at `ptr + offset` bytes.
///
/// # Safety
///
/// `ptr + offset` must be readable for `size_of::<T>()` bytes and stay within the allocation
/// that `ptr` points into.
#[must_use]
pub unsafe fn read_scalar<T: NativeScalar>(ptr: *const u8, offset: isize) -> T {
    // SAFETY: The caller guarantees the offset stays within the allocation.
    let source = unsafe { ptr.offset(offset) };

    // SAFETY: The caller guarantees the bytes are readable. Every bit pattern is a valid T.
    unsafe { source.cast::<T>().read_unaligned() }
}

/// Writes `value` at `ptr + offset` bytes.
///
/// # Safety
///
/// `ptr + offset` must be writable for `size_of::<T>()` bytes and stay within the allocation
/// that `ptr` points into.
pub unsafe fn write_scalar<T: NativeScalar>(ptr: *mut u8, offset: isize, value: T) {
    // SAFETY: The caller guarantees the offset stays within the allocation.
    let target = unsafe { ptr.offset(offset) };

    // SAFETY: The caller guarantees the bytes are writable.
    unsafe { target.cast::<T>().write_unaligned(value) };
}

/// Reads one byte at `ptr + offset`.
///
/// # Safety
///
/// See [`read_scalar()`].
#[must_use]
pub unsafe fn read_byte(ptr: *const u8, offset: isize) -> u8 {
    // SAFETY: Forwarding safety requirements.
    unsafe { read_scalar(ptr, offset) }
}

/// Reads a 16-bit integer at `ptr + offset`.
///
/// # Safety
///
/// See [`read_scalar()`].
#[must_use]
pub unsafe fn read_i16(ptr: *const u8, offset: isize) -> i16 {
    // SAFETY: Forwarding safety requirements.
    unsafe { read_scalar(ptr, offset) }
}

/// Reads a 32-bit integer at `ptr + offset`.
///
/// # Safety
///
/// See [`read_scalar()`].
#[must_use]
pub unsafe fn read_i32(ptr: *const u8, offset: isize) -> i32 {
    // SAFETY: Forwarding safety requirements.
    unsafe { read_scalar(ptr, offset) }
}

/// Reads a 64-bit integer at `ptr + offset`.
///
/// # Safety
///
/// See [`read_scalar()`].
#[must_use]
pub unsafe fn read_i64(ptr: *const u8, offset: isize) -> i64 {
    // SAFETY: Forwarding safety requirements.
    unsafe { read_scalar(ptr, offset) }
}

/// Reads a pointer-sized integer at `ptr + offset`.
///
/// # Safety
///
/// See [`read_scalar()`].
#[cfg(target_pointer_width = "64")]
#[must_use]
#[expect(clippy::cast_possible_truncation, reason = "isize is 64 bits wide on this target")]
pub unsafe fn read_int_ptr(ptr: *const u8, offset: isize) -> isize {
    // SAFETY: Forwarding safety requirements.
    let value = unsafe { read_i64(ptr, offset) };
    value as isize
}

/// Reads a pointer-sized integer at `ptr + offset`.
///
/// # Safety
///
/// See [`read_scalar()`].
#[cfg(target_pointer_width = "32")]
#[must_use]
pub unsafe fn read_int_ptr(ptr: *const u8, offset: isize) -> isize {
    // SAFETY: Forwarding safety requirements.
    let value = unsafe { read_i32(ptr, offset) };
    value as isize
}

/// Writes one byte at `ptr + offset`.
///
/// # Safety
///
/// See [`write_scalar()`].
pub unsafe fn write_byte(ptr: *mut u8, offset: isize, value: u8) {
    // SAFETY: Forwarding safety requirements.
    unsafe { write_scalar(ptr, offset, value) };
}

/// Writes a 16-bit integer at `ptr + offset`.
///
/// # Safety
///
/// See [`write_scalar()`].
pub unsafe fn write_i16(ptr: *mut u8, offset: isize, value: i16) {
    // SAFETY: Forwarding safety requirements.
    unsafe { write_scalar(ptr, offset, value) };
}

/// Writes the low 16 bits of `value` at `ptr + offset`.
///
/// Characters outside the Basic Multilingual Plane do not fit in one UTF-16 code unit and are
/// truncated.
///
/// # Safety
///
/// See [`write_scalar()`].
pub unsafe fn write_char16(ptr: *mut u8, offset: isize, value: char) {
    #[expect(clippy::cast_possible_truncation, reason = "storing the low 16 bits is the contract")]
    let unit = u32::from(value) as u16;

    // SAFETY: Forwarding safety requirements.
    unsafe { write_scalar(ptr, offset, unit) };
}

/// Writes a 32-bit integer at `ptr + offset`.
///
/// # Safety
///
/// See [`write_scalar()`].
pub unsafe fn write_i32(ptr: *mut u8, offset: isize, value: i32) {
    // SAFETY: Forwarding safety requirements.
    unsafe { write_scalar(ptr, offset, value) };
}

/// Writes a 64-bit integer at `ptr + offset`.
///
/// # Safety
///
/// See [`write_scalar()`].
pub unsafe fn write_i64(ptr: *mut u8, offset: isize, value: i64) {
    // SAFETY: Forwarding safety requirements.
    unsafe { write_scalar(ptr, offset, value) };
}

/// Writes a pointer-sized integer at `ptr + offset`.
///
/// # Safety
///
/// See [`write_scalar()`].
#[cfg(target_pointer_width = "64")]
pub unsafe fn write_int_ptr(ptr: *mut u8, offset: isize, value: isize) {
    // SAFETY: Forwarding safety requirements.
    unsafe { write_i64(ptr, offset, value as i64) };
}

/// Writes a pointer-sized integer at `ptr + offset`.
///
/// # Safety
///
/// See [`write_scalar()`].
#[cfg(target_pointer_width = "32")]
#[expect(clippy::cast_possible_truncation, reason = "isize is 32 bits wide on this target")]
pub unsafe fn write_int_ptr(ptr: *mut u8, offset: isize, value: isize) {
    // SAFETY: Forwarding safety requirements.
    unsafe { write_i32(ptr, offset, value as i32) };
}

/// Copies `count` elements of `source`, starting at `start_index`, to `destination`.
///
/// The range is validated before any memory is touched, so on error nothing has been written.
///
/// # Errors
///
/// Returns [`Error::OutOfRange`] if `start_index + count` exceeds the length of `source`, and
/// [`Error::InvalidArgument`] if `destination` is null while `count` is non-zero.
///
/// # Safety
///
/// `destination` must be writable for `count * size_of::<T>()` bytes and must not overlap
/// `source`. It need not be aligned for `T`.
pub unsafe fn copy_to_native<T: NativeScalar>(
    source: &[T],
    start_index: usize,
    destination: *mut T,
    count: usize,
) -> Result<()> {
    check_range(source.len(), start_index, count)?;

    if count == 0 {
        return Ok(());
    }

    if destination.is_null() {
        return Err(Error::InvalidArgument("destination pointer is null".to_string()));
    }

    let range = &source[start_index..start_index + count];

    // SAFETY: The range lies within `source`, the caller guarantees `destination` is writable
    // for the same number of bytes and the two do not overlap. Copying bytes lifts the
    // alignment requirement from `destination`.
    unsafe {
        ptr::copy_nonoverlapping(range.as_ptr().cast::<u8>(), destination.cast::<u8>(), size_of_val(range));
    }

    Ok(())
}

/// Copies `count` elements from `source` into `destination`, starting at `start_index`.
///
/// The range is validated before any memory is touched, so on error `destination` is
/// unchanged.
///
/// # Errors
///
/// Returns [`Error::OutOfRange`] if `start_index + count` exceeds the length of
/// `destination`, and [`Error::InvalidArgument`] if `source` is null while `count` is
/// non-zero.
///
/// # Safety
///
/// `source` must be readable for `count * size_of::<T>()` bytes and must not overlap
/// `destination`. It need not be aligned for `T`.
pub unsafe fn copy_from_native<T: NativeScalar>(
    source: *const T,
    destination: &mut [T],
    start_index: usize,
    count: usize,
) -> Result<()> {
    check_range(destination.len(), start_index, count)?;

    if count == 0 {
        return Ok(());
    }

    if source.is_null() {
        return Err(Error::InvalidArgument("source pointer is null".to_string()));
    }

    let target = &mut destination[start_index..start_index + count];
    let byte_count = size_of_val(target);

    // SAFETY: The target range lies within `destination`, the caller guarantees `source` is
    // readable for the same number of bytes and the two do not overlap. Every bit pattern is a
    // valid T.
    unsafe {
        ptr::copy_nonoverlapping(source.cast::<u8>(), target.as_mut_ptr().cast::<u8>(), byte_count);
    }

    Ok(())
}

fn check_range(len: usize, start_index: usize, count: usize) -> Result<()> {
    match start_index.checked_add(count) {
        Some(end) if end <= len => Ok(()),
        _ => {
            event!(Level::DEBUG, message = "rejected out of range copy", len, start_index, count);
            Err(Error::OutOfRange(format!(
                "start index {start_index} plus count {count} exceeds array length {len}"
            )))
        }
    }
}
