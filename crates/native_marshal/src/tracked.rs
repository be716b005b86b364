// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::{ptr, slice};

use tracing::{Level, event};

use crate::{Error, HeapFamily, NativeBuffer, NativeScalar, Result, read_scalar, write_scalar};

/// A native buffer paired with its length, offering bounds-checked scalar access.
///
/// Created by [`Marshaler::alloc_local_tracked()`][crate::Marshaler::alloc_local_tracked] and
/// [`Marshaler::alloc_task_tracked()`][crate::Marshaler::alloc_task_tracked]. Every byte is
/// initialized at creation. Any access that would touch a byte outside `[0, len)` fails with
/// [`Error::OutOfRange`] and leaves the buffer unchanged.
///
/// Release the memory by passing [`into_inner()`][Self::into_inner] to the free call of the
/// matching heap family.
#[derive(Debug)]
#[must_use = "dropping a tracked buffer leaks the native memory"]
pub struct TrackedBuffer<H: HeapFamily> {
    buffer: NativeBuffer<H>,
    len: usize,
}

impl<H: HeapFamily> TrackedBuffer<H> {
    /// # Safety
    ///
    /// `buffer` must be a live block of at least `len` initialized bytes.
    pub(crate) const unsafe fn new(buffer: NativeBuffer<H>, len: usize) -> Self {
        Self { buffer, len }
    }

    /// Number of bytes in the buffer.
    #[must_use]
    pub const fn len(&self) -> usize {
        self.len
    }

    /// Whether the buffer holds zero bytes.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// The address of the buffer, for handing to native code.
    #[must_use]
    pub const fn as_ptr(&self) -> *mut u8 {
        self.buffer.as_ptr()
    }

    /// The contents of the buffer.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        // SAFETY: The block is live, `len` bytes long and fully initialized. The shared borrow
        // of `self` prevents writes through this handle while the slice exists.
        unsafe { slice::from_raw_parts(self.buffer.as_ptr(), self.len) }
    }

    /// Reads a `T` at byte `offset`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::OutOfRange`] if the value would extend past the end of the buffer.
    pub fn read<T: NativeScalar>(&self, offset: usize) -> Result<T> {
        let offset = self.check(offset, size_of::<T>())?;

        // SAFETY: The range was checked against the length of the live block.
        Ok(unsafe { read_scalar(self.buffer.as_ptr(), offset) })
    }

    /// Writes `value` at byte `offset`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::OutOfRange`] if the value would extend past the end of the buffer.
    pub fn write<T: NativeScalar>(&mut self, offset: usize, value: T) -> Result<()> {
        let offset = self.check(offset, size_of::<T>())?;

        // SAFETY: The range was checked against the length of the live block.
        unsafe { write_scalar(self.buffer.as_ptr(), offset, value) };
        Ok(())
    }

    /// Copies all of `source` into the buffer, starting at byte `offset`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::OutOfRange`] if the data would extend past the end of the buffer.
    pub fn copy_from_slice<T: NativeScalar>(&mut self, offset: usize, source: &[T]) -> Result<()> {
        let byte_count = size_of_val(source);
        let offset = self.check(offset, byte_count)?;

        // SAFETY: The range was checked against the length of the live block.
        let target = unsafe { self.buffer.as_ptr().offset(offset) };

        // SAFETY: `source` is a Rust slice and cannot overlap native memory owned by this handle.
        unsafe { ptr::copy_nonoverlapping(source.as_ptr().cast::<u8>(), target, byte_count) };
        Ok(())
    }

    /// Fills all of `destination` from the buffer, starting at byte `offset`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::OutOfRange`] if the data would extend past the end of the buffer.
    pub fn copy_to_slice<T: NativeScalar>(&self, offset: usize, destination: &mut [T]) -> Result<()> {
        let byte_count = size_of_val(destination);
        let offset = self.check(offset, byte_count)?;

        // SAFETY: The range was checked against the length of the live block.
        let source = unsafe { self.buffer.as_ptr().offset(offset) };

        // SAFETY: The ranges do not overlap and every bit pattern is a valid T.
        unsafe { ptr::copy_nonoverlapping(source, destination.as_mut_ptr().cast::<u8>(), byte_count) };
        Ok(())
    }

    /// Gives up bounds tracking and returns the underlying buffer.
    pub fn into_inner(self) -> NativeBuffer<H> {
        self.buffer
    }

    /// Validates that `[offset, offset + size)` lies within the buffer and returns the offset
    /// in the form the raw accessors take.
    fn check(&self, offset: usize, size: usize) -> Result<isize> {
        let in_bounds = offset.checked_add(size).is_some_and(|end| end <= self.len);

        if !in_bounds {
            event!(Level::DEBUG, message = "rejected out of bounds access", offset, size, len = self.len);
            return Err(Error::OutOfRange(format!(
                "{size} bytes at offset {offset} exceed buffer length {}",
                self.len
            )));
        }

        // Allocations never exceed isize::MAX bytes, so an in-bounds offset always fits.
        isize::try_from(offset).map_err(|e| Error::OutOfRange(e.to_string()))
    }
}
