// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Conversions between Rust strings and NUL-terminated native strings.
//!
//! Conversions to native memory allocate a buffer that the caller owns and must release with
//! the free (or zero-free) call of the matching heap family. Conversions from native memory
//! copy the data and never take ownership of the source.

use std::ffi::CStr;
use std::ptr;
use std::sync::atomic::{Ordering, compiler_fence};

use tracing::{Level, event};

use crate::{
    Error, HeapFamily, LocalBuffer, Marshaler, NativeBuffer, Result, SYSTEM_DEFAULT_CHAR_SIZE, TaskBuffer, TaskHeap,
    is_sentinel_handle,
};

/// Size of one UTF-16 code unit, also the size of a wide terminator.
const WIDE: usize = size_of::<u16>();

/// How a native string marks its end.
#[derive(Clone, Copy, Debug)]
enum Terminator {
    /// A single zero byte (ANSI and UTF-8 strings).
    Narrow,

    /// A zero UTF-16 code unit.
    Wide,
}

impl Marshaler {
    /// Copies `s` into a new local heap buffer, encoded in the ANSI code page of this
    /// marshaler and terminated with a zero byte.
    ///
    /// Characters the code page cannot represent are replaced with `?`. `None` produces a null
    /// buffer.
    ///
    /// # Errors
    ///
    /// Returns [`Error::OutOfRange`] if the buffer size computation overflows, and
    /// [`Error::OutOfMemory`] if the allocation fails.
    pub fn string_to_local_ansi(&self, s: Option<&str>) -> Result<LocalBuffer> {
        self.to_native_ansi(s)
    }

    /// Same as [`string_to_local_ansi()`][Self::string_to_local_ansi] but allocates from the
    /// task heap.
    ///
    /// # Errors
    ///
    /// Returns [`Error::OutOfRange`] if the buffer size computation overflows, and
    /// [`Error::OutOfMemory`] if the allocation fails.
    pub fn string_to_task_ansi(&self, s: Option<&str>) -> Result<TaskBuffer> {
        self.to_native_ansi(s)
    }

    /// Copies `s` into a new local heap buffer as UTF-16, terminated with a zero code unit.
    /// `None` produces a null buffer.
    ///
    /// # Errors
    ///
    /// Returns [`Error::OutOfRange`] if the buffer size computation overflows, and
    /// [`Error::OutOfMemory`] if the allocation fails.
    pub fn string_to_local_unicode(&self, s: Option<&str>) -> Result<LocalBuffer> {
        self.to_native_unicode(s)
    }

    /// Same as [`string_to_local_unicode()`][Self::string_to_local_unicode] but allocates from
    /// the task heap.
    ///
    /// # Errors
    ///
    /// Returns [`Error::OutOfRange`] if the buffer size computation overflows, and
    /// [`Error::OutOfMemory`] if the allocation fails.
    pub fn string_to_task_unicode(&self, s: Option<&str>) -> Result<TaskBuffer> {
        self.to_native_unicode(s)
    }

    /// Copies `s` into a new local heap buffer in the platform's default string encoding:
    /// UTF-16 where [`SYSTEM_DEFAULT_CHAR_SIZE`] is 2, the ANSI code page where it is 1.
    ///
    /// # Errors
    ///
    /// Returns [`Error::OutOfRange`] if the buffer size computation overflows, and
    /// [`Error::OutOfMemory`] if the allocation fails.
    pub fn string_to_local_auto(&self, s: Option<&str>) -> Result<LocalBuffer> {
        if SYSTEM_DEFAULT_CHAR_SIZE == 1 {
            self.to_native_ansi(s)
        } else {
            self.to_native_unicode(s)
        }
    }

    /// Same as [`string_to_local_auto()`][Self::string_to_local_auto] but allocates from the
    /// task heap.
    ///
    /// # Errors
    ///
    /// Returns [`Error::OutOfRange`] if the buffer size computation overflows, and
    /// [`Error::OutOfMemory`] if the allocation fails.
    pub fn string_to_task_auto(&self, s: Option<&str>) -> Result<TaskBuffer> {
        if SYSTEM_DEFAULT_CHAR_SIZE == 1 {
            self.to_native_ansi(s)
        } else {
            self.to_native_unicode(s)
        }
    }

    /// Copies `s` into a new task heap buffer as UTF-8, terminated with a zero byte,
    /// regardless of the ANSI code page. `None` produces a null buffer.
    ///
    /// # Errors
    ///
    /// Returns [`Error::OutOfRange`] if the buffer size computation overflows, and
    /// [`Error::OutOfMemory`] if the allocation fails.
    pub fn string_to_task_utf8(&self, s: Option<&str>) -> Result<TaskBuffer> {
        let Some(s) = s else {
            return Ok(NativeBuffer::null());
        };

        let buffer = self.alloc_string_buffer::<TaskHeap>(s.len(), 1)?;

        // SAFETY: The buffer has room for the payload and one more byte.
        unsafe { write_terminated(buffer.as_ptr(), s.as_bytes(), Terminator::Narrow) };

        Ok(buffer)
    }

    /// Decodes a NUL-terminated string in the ANSI code page of this marshaler.
    ///
    /// Returns `None` for a null or sentinel pointer, without dereferencing it.
    ///
    /// # Safety
    ///
    /// Unless it is a sentinel, `ptr` must be readable up to and including a zero byte.
    #[must_use]
    pub unsafe fn ptr_to_string_ansi(&self, ptr: *const u8) -> Option<String> {
        if is_sentinel_handle(ptr) {
            return None;
        }

        // SAFETY: Forwarding safety requirements.
        let bytes = unsafe { CStr::from_ptr(ptr.cast()) }.to_bytes();
        Some(self.code_page().decode(bytes))
    }

    /// Decodes exactly `len` bytes in the ANSI code page of this marshaler. Zero bytes in the
    /// range are decoded like any other character.
    ///
    /// # Errors
    ///
    /// Returns [`Error::OutOfRange`] if `len` is negative and [`Error::InvalidArgument`] if
    /// `ptr` is null.
    ///
    /// # Safety
    ///
    /// `ptr` must be readable for `len` bytes.
    pub unsafe fn ptr_to_string_ansi_len(&self, ptr: *const u8, len: i32) -> Result<String> {
        let len = checked_len(ptr, len)?;

        // SAFETY: Forwarding safety requirements.
        let bytes = unsafe { read_bytes(ptr, len) };
        Ok(self.code_page().decode(&bytes))
    }

    /// Decodes a UTF-16 string terminated by a zero code unit. Unpaired surrogates become
    /// U+FFFD.
    ///
    /// Returns `None` for a null or sentinel pointer, without dereferencing it. The pointer
    /// need not be aligned.
    ///
    /// # Safety
    ///
    /// Unless it is a sentinel, `ptr` must be readable up to and including a zero code unit.
    #[must_use]
    pub unsafe fn ptr_to_string_unicode(&self, ptr: *const u16) -> Option<String> {
        // SAFETY: Forwarding safety requirements.
        unsafe { self.ptr_to_utf16_units(ptr) }.map(|units| String::from_utf16_lossy(&units))
    }

    /// Decodes exactly `len` UTF-16 code units. Unpaired surrogates become U+FFFD.
    ///
    /// # Errors
    ///
    /// Returns [`Error::OutOfRange`] if `len` is negative and [`Error::InvalidArgument`] if
    /// `ptr` is null.
    ///
    /// # Safety
    ///
    /// `ptr` must be readable for `len` code units. It need not be aligned.
    pub unsafe fn ptr_to_string_unicode_len(&self, ptr: *const u16, len: i32) -> Result<String> {
        let len = checked_len(ptr, len)?;

        // SAFETY: Forwarding safety requirements.
        let units = unsafe { read_units(ptr.cast(), len) };
        Ok(String::from_utf16_lossy(&units))
    }

    /// Copies the code units of a UTF-16 string terminated by a zero code unit, without
    /// decoding them. The terminator is not included.
    ///
    /// Returns `None` for a null or sentinel pointer, without dereferencing it.
    ///
    /// # Safety
    ///
    /// Unless it is a sentinel, `ptr` must be readable up to and including a zero code unit.
    #[must_use]
    pub unsafe fn ptr_to_utf16_units(&self, ptr: *const u16) -> Option<Vec<u16>> {
        if is_sentinel_handle(ptr) {
            return None;
        }

        let ptr = ptr.cast::<u8>();

        // SAFETY: Forwarding safety requirements.
        let len = unsafe { wide_len(ptr) };

        // SAFETY: The scan above proved `len` units readable.
        Some(unsafe { read_units(ptr, len) })
    }

    /// Decodes a string in the platform's default string encoding: UTF-16 where
    /// [`SYSTEM_DEFAULT_CHAR_SIZE`] is 2, the ANSI code page where it is 1.
    ///
    /// Returns `None` for a null or sentinel pointer, without dereferencing it.
    ///
    /// # Safety
    ///
    /// Unless it is a sentinel, `ptr` must be readable up to and including a terminator of
    /// the default character width.
    #[must_use]
    pub unsafe fn ptr_to_string_auto(&self, ptr: *const u8) -> Option<String> {
        if SYSTEM_DEFAULT_CHAR_SIZE == 1 {
            // SAFETY: Forwarding safety requirements.
            unsafe { self.ptr_to_string_ansi(ptr) }
        } else {
            // SAFETY: Forwarding safety requirements. The wide decoder reads unaligned.
            unsafe { self.ptr_to_string_unicode(ptr.cast()) }
        }
    }

    /// Decodes exactly `len` characters of the platform's default character width.
    ///
    /// # Errors
    ///
    /// Returns [`Error::OutOfRange`] if `len` is negative and [`Error::InvalidArgument`] if
    /// `ptr` is null.
    ///
    /// # Safety
    ///
    /// `ptr` must be readable for `len` characters of the default width.
    pub unsafe fn ptr_to_string_auto_len(&self, ptr: *const u8, len: i32) -> Result<String> {
        if SYSTEM_DEFAULT_CHAR_SIZE == 1 {
            // SAFETY: Forwarding safety requirements.
            unsafe { self.ptr_to_string_ansi_len(ptr, len) }
        } else {
            // SAFETY: Forwarding safety requirements. The wide decoder reads unaligned.
            unsafe { self.ptr_to_string_unicode_len(ptr.cast(), len) }
        }
    }

    /// Decodes a NUL-terminated UTF-8 string. Invalid sequences become U+FFFD.
    ///
    /// Returns `None` for a null or sentinel pointer, without dereferencing it.
    ///
    /// # Safety
    ///
    /// Unless it is a sentinel, `ptr` must be readable up to and including a zero byte.
    #[must_use]
    pub unsafe fn ptr_to_string_utf8(&self, ptr: *const u8) -> Option<String> {
        if is_sentinel_handle(ptr) {
            return None;
        }

        // SAFETY: Forwarding safety requirements.
        let bytes = unsafe { CStr::from_ptr(ptr.cast()) }.to_bytes();
        Some(String::from_utf8_lossy(bytes).into_owned())
    }

    /// Decodes exactly `len` bytes of UTF-8. Invalid sequences become U+FFFD.
    ///
    /// # Errors
    ///
    /// Returns [`Error::OutOfRange`] if `len` is negative and [`Error::InvalidArgument`] if
    /// `ptr` is null.
    ///
    /// # Safety
    ///
    /// `ptr` must be readable for `len` bytes.
    pub unsafe fn ptr_to_string_utf8_len(&self, ptr: *const u8, len: i32) -> Result<String> {
        let len = checked_len(ptr, len)?;

        // SAFETY: Forwarding safety requirements.
        let bytes = unsafe { read_bytes(ptr, len) };
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    /// Overwrites an ANSI string and its terminator with zeros, then releases it to the local
    /// heap.
    ///
    /// # Errors
    ///
    /// Same as [`free_local()`][Self::free_local]. On [`Error::HeapMismatch`] nothing is
    /// overwritten.
    ///
    /// # Safety
    ///
    /// Unless it is null or a sentinel, the buffer must hold a string terminated by a zero
    /// byte.
    pub unsafe fn zero_free_local_ansi(&self, buffer: LocalBuffer) -> Result<()> {
        // SAFETY: Forwarding safety requirements.
        unsafe { self.zero_free(buffer, Terminator::Narrow) }
    }

    /// Overwrites a UTF-16 string and its terminator with zeros, then releases it to the
    /// local heap.
    ///
    /// # Errors
    ///
    /// Same as [`free_local()`][Self::free_local]. On [`Error::HeapMismatch`] nothing is
    /// overwritten.
    ///
    /// # Safety
    ///
    /// Unless it is null or a sentinel, the buffer must hold a string terminated by a zero
    /// code unit.
    pub unsafe fn zero_free_local_unicode(&self, buffer: LocalBuffer) -> Result<()> {
        // SAFETY: Forwarding safety requirements.
        unsafe { self.zero_free(buffer, Terminator::Wide) }
    }

    /// Overwrites an ANSI string and its terminator with zeros, then releases it to the task
    /// heap.
    ///
    /// # Errors
    ///
    /// Same as [`free_task()`][Self::free_task]. On [`Error::HeapMismatch`] nothing is
    /// overwritten.
    ///
    /// # Safety
    ///
    /// Unless it is null or a sentinel, the buffer must hold a string terminated by a zero
    /// byte.
    pub unsafe fn zero_free_task_ansi(&self, buffer: TaskBuffer) -> Result<()> {
        // SAFETY: Forwarding safety requirements.
        unsafe { self.zero_free(buffer, Terminator::Narrow) }
    }

    /// Overwrites a UTF-16 string and its terminator with zeros, then releases it to the task
    /// heap.
    ///
    /// # Errors
    ///
    /// Same as [`free_task()`][Self::free_task]. On [`Error::HeapMismatch`] nothing is
    /// overwritten.
    ///
    /// # Safety
    ///
    /// Unless it is null or a sentinel, the buffer must hold a string terminated by a zero
    /// code unit.
    pub unsafe fn zero_free_task_unicode(&self, buffer: TaskBuffer) -> Result<()> {
        // SAFETY: Forwarding safety requirements.
        unsafe { self.zero_free(buffer, Terminator::Wide) }
    }

    /// Overwrites a UTF-8 string and its terminator with zeros, then releases it to the task
    /// heap.
    ///
    /// # Errors
    ///
    /// Same as [`free_task()`][Self::free_task]. On [`Error::HeapMismatch`] nothing is
    /// overwritten.
    ///
    /// # Safety
    ///
    /// Unless it is null or a sentinel, the buffer must hold a string terminated by a zero
    /// byte.
    pub unsafe fn zero_free_task_utf8(&self, buffer: TaskBuffer) -> Result<()> {
        // SAFETY: Forwarding safety requirements.
        unsafe { self.zero_free(buffer, Terminator::Narrow) }
    }

    /// Allocates room for `char_count` characters of `bytes_per_char` bytes plus a terminator
    /// of the same width. Overflow is detected before any allocation is attempted.
    pub(crate) fn alloc_string_buffer<H: HeapFamily>(
        &self,
        char_count: usize,
        bytes_per_char: usize,
    ) -> Result<NativeBuffer<H>> {
        let size = string_byte_len(char_count, bytes_per_char)?;
        self.alloc::<H>(size)
    }

    fn to_native_ansi<H: HeapFamily>(&self, s: Option<&str>) -> Result<NativeBuffer<H>> {
        let Some(s) = s else {
            return Ok(NativeBuffer::null());
        };

        let code_page = self.code_page();
        let char_count = s.encode_utf16().count();
        let buffer = self.alloc_string_buffer::<H>(char_count, code_page.max_bytes_per_char())?;

        let mut encoded = Vec::with_capacity(s.len());
        code_page.encode_into(s, &mut encoded);

        // SAFETY: Every UTF-16 code unit encodes to at most max_bytes_per_char() bytes, so the
        // buffer has room for the payload and the terminator.
        unsafe { write_terminated(buffer.as_ptr(), &encoded, Terminator::Narrow) };

        Ok(buffer)
    }

    fn to_native_unicode<H: HeapFamily>(&self, s: Option<&str>) -> Result<NativeBuffer<H>> {
        let Some(s) = s else {
            return Ok(NativeBuffer::null());
        };

        let encoded: Vec<u8> = s.encode_utf16().flat_map(u16::to_ne_bytes).collect();
        let buffer = self.alloc_string_buffer::<H>(encoded.len() / WIDE, WIDE)?;

        // SAFETY: The buffer has room for every code unit plus a wide terminator.
        unsafe { write_terminated(buffer.as_ptr(), &encoded, Terminator::Wide) };

        Ok(buffer)
    }

    /// # Safety
    ///
    /// Unless it is null or a sentinel, the buffer must hold a string ending in `terminator`.
    unsafe fn zero_free<H: HeapFamily>(&self, buffer: NativeBuffer<H>, terminator: Terminator) -> Result<()> {
        if buffer.is_sentinel() {
            return self.free(buffer);
        }

        // Zeroing a block that will then be refused would destroy data the caller still owns.
        self.verify_family::<H>(buffer.addr())?;

        let ptr = buffer.as_ptr();

        // SAFETY: Forwarding safety requirements.
        let byte_len = unsafe { terminated_byte_len(ptr, terminator) };

        // SAFETY: The measured range, terminator included, lies within the string.
        unsafe { secure_zero(ptr, byte_len) };

        event!(Level::TRACE, message = "zeroed native string", heap = %H::KIND, bytes = byte_len, address = ?ptr);

        self.free(buffer)
    }
}

/// The size in bytes of a buffer holding `char_count` characters of `bytes_per_char` bytes
/// plus a terminator of the same width.
///
/// # Errors
///
/// Returns [`Error::OutOfRange`] if the size overflows or exceeds `isize::MAX`.
pub(crate) fn string_byte_len(char_count: usize, bytes_per_char: usize) -> Result<usize> {
    char_count
        .checked_add(1)
        .and_then(|count| count.checked_mul(bytes_per_char))
        .filter(|&size| size <= isize::MAX.unsigned_abs())
        .ok_or_else(|| {
            event!(
                Level::DEBUG,
                message = "rejected oversized string buffer",
                char_count,
                bytes_per_char
            );

            Error::OutOfRange(format!(
                "a string of {char_count} characters at {bytes_per_char} bytes each does not fit in memory"
            ))
        })
}

/// Overwrites `len` bytes at `ptr` with zeros in a way the optimizer may not elide.
///
/// # Safety
///
/// `ptr` must be writable for `len` bytes.
pub(crate) unsafe fn secure_zero(ptr: *mut u8, len: usize) {
    for index in 0..len {
        // SAFETY: The caller guarantees the range is writable.
        let byte = unsafe { ptr.add(index) };

        // SAFETY: As above.
        unsafe { byte.write_volatile(0) };
    }

    compiler_fence(Ordering::SeqCst);
}

/// Validates a caller-supplied length for the fixed-length decoders.
fn checked_len<T>(ptr: *const T, len: i32) -> Result<usize> {
    if len < 0 {
        return Err(Error::OutOfRange(format!("length must not be negative, got {len}")));
    }

    if ptr.is_null() {
        return Err(Error::InvalidArgument("string pointer is null".to_string()));
    }

    Ok(len.unsigned_abs() as usize)
}

/// Writes `payload` followed by a zero terminator of the given width.
///
/// # Safety
///
/// `ptr` must be writable for `payload.len()` bytes plus the terminator width.
unsafe fn write_terminated(ptr: *mut u8, payload: &[u8], terminator: Terminator) {
    let terminator_len = match terminator {
        Terminator::Narrow => 1,
        Terminator::Wide => WIDE,
    };

    // SAFETY: The caller guarantees room for the payload. A Rust slice never overlaps native
    // memory we exclusively own.
    unsafe { ptr::copy_nonoverlapping(payload.as_ptr(), ptr, payload.len()) };

    // SAFETY: The caller guarantees room for the terminator after the payload.
    let end = unsafe { ptr.add(payload.len()) };

    // SAFETY: As above.
    unsafe { ptr::write_bytes(end, 0, terminator_len) };
}

/// Byte length of a terminated string including its terminator.
///
/// # Safety
///
/// `ptr` must be readable up to and including the terminator.
unsafe fn terminated_byte_len(ptr: *const u8, terminator: Terminator) -> usize {
    match terminator {
        // SAFETY: Forwarding safety requirements.
        Terminator::Narrow => unsafe { CStr::from_ptr(ptr.cast()) }.count_bytes() + 1,
        // SAFETY: Forwarding safety requirements.
        Terminator::Wide => (unsafe { wide_len(ptr) } + 1) * WIDE,
    }
}

/// Number of UTF-16 code units before the first zero unit.
///
/// # Safety
///
/// `ptr` must be readable up to and including a zero code unit. It need not be aligned.
unsafe fn wide_len(ptr: *const u8) -> usize {
    let mut len = 0;

    loop {
        // SAFETY: Every unit up to the terminator is readable.
        let unit = unsafe { ptr.add(len * WIDE) };

        // SAFETY: As above.
        if unsafe { unit.cast::<u16>().read_unaligned() } == 0 {
            return len;
        }

        len += 1;
    }
}

/// # Safety
///
/// `ptr` must be readable for `len` bytes.
unsafe fn read_bytes(ptr: *const u8, len: usize) -> Vec<u8> {
    let mut bytes = vec![0_u8; len];

    // SAFETY: Forwarding safety requirements. The new vector cannot overlap the source.
    unsafe { ptr::copy_nonoverlapping(ptr, bytes.as_mut_ptr(), len) };

    bytes
}

/// # Safety
///
/// `ptr` must be readable for `len` UTF-16 code units. It need not be aligned.
unsafe fn read_units(ptr: *const u8, len: usize) -> Vec<u16> {
    let mut units = vec![0_u16; len];
    let byte_count = size_of_val(units.as_slice());

    // SAFETY: Forwarding safety requirements. Copying bytes lifts any alignment requirement
    // from the source.
    unsafe { ptr::copy_nonoverlapping(ptr, units.as_mut_ptr().cast::<u8>(), byte_count) };

    units
}

#[cfg(test)]
mod tests {
    use std::slice;
    use std::sync::Arc;
    use std::sync::atomic::AtomicBool;

    use rstest::rstest;

    use super::*;
    use crate::pal::MockBindings;
    use crate::{CodePage, LocalHeap};
    use crate::testing::{FakeBlock, mock_marshaler};

    fn windows_1252() -> Marshaler {
        Marshaler::builder()
            .code_page(CodePage::Windows1252)
            .track_heap_families(true)
            .build()
    }

    #[test]
    fn ansi_round_trip() {
        let marshaler = windows_1252();

        for s in ["", "hello", "café €5", "tab\there"] {
            let buffer = marshaler.string_to_local_ansi(Some(s)).unwrap();

            // SAFETY: The buffer holds a terminated ANSI string.
            let decoded = unsafe { marshaler.ptr_to_string_ansi(buffer.as_ptr()) };
            assert_eq!(decoded.as_deref(), Some(s));

            marshaler.free_local(buffer).unwrap();
        }
    }

    #[test]
    fn ansi_unmappable_becomes_question_mark() {
        let marshaler = windows_1252();
        let buffer = marshaler.string_to_task_ansi(Some("a😀b")).unwrap();

        // SAFETY: The buffer holds a terminated ANSI string.
        let decoded = unsafe { marshaler.ptr_to_string_ansi(buffer.as_ptr()) };
        assert_eq!(decoded.as_deref(), Some("a?b"));

        marshaler.free_task(buffer).unwrap();
    }

    #[test]
    fn utf8_code_page_round_trip() {
        let marshaler = Marshaler::builder().code_page(CodePage::Utf8).build();
        let s = "añ😀";

        let buffer = marshaler.string_to_local_ansi(Some(s)).unwrap();

        // SAFETY: The buffer holds a terminated UTF-8 string.
        let decoded = unsafe { marshaler.ptr_to_string_ansi(buffer.as_ptr()) };
        assert_eq!(decoded.as_deref(), Some(s));

        marshaler.free_local(buffer).unwrap();
    }

    #[test]
    fn unicode_round_trip() {
        let marshaler = Marshaler::new();

        for s in ["", "hello", "ñ", "😀 surrogate pair", "日本語"] {
            let buffer = marshaler.string_to_task_unicode(Some(s)).unwrap();

            // SAFETY: The buffer holds a terminated UTF-16 string.
            let decoded = unsafe { marshaler.ptr_to_string_unicode(buffer.as_ptr().cast::<u16>()) };
            assert_eq!(decoded.as_deref(), Some(s));

            marshaler.free_task(buffer).unwrap();
        }
    }

    #[test]
    fn unicode_layout() {
        let marshaler = Marshaler::new();
        let buffer = marshaler.string_to_local_unicode(Some("ab")).unwrap();

        // SAFETY: Two code units plus a terminator were written.
        let bytes = unsafe { slice::from_raw_parts(buffer.as_ptr(), 6) };

        let expected: Vec<u8> = [u16::from(b'a'), u16::from(b'b'), 0]
            .into_iter()
            .flat_map(u16::to_ne_bytes)
            .collect();
        assert_eq!(bytes, expected);

        marshaler.free_local(buffer).unwrap();
    }

    #[rstest]
    #[case::windows_1252(CodePage::Windows1252)]
    #[case::utf8(CodePage::Utf8)]
    fn ansi_layout(#[case] code_page: CodePage) {
        let marshaler = Marshaler::builder().code_page(code_page).build();
        let buffer = marshaler.string_to_local_ansi(Some("hello")).unwrap();

        // SAFETY: Five single-byte characters plus a terminator were written.
        let bytes = unsafe { slice::from_raw_parts(buffer.as_ptr(), 6) };
        assert_eq!(bytes, b"hello\0");

        marshaler.free_local(buffer).unwrap();
    }

    #[test]
    fn utf16_units_are_not_decoded() {
        let marshaler = Marshaler::new();

        // A lone high surrogate followed by 'A'.
        let units = [0xD800_u16, 0x0041, 0];
        let bytes: Vec<u8> = units.iter().flat_map(|u| u.to_ne_bytes()).collect();
        let mut block = FakeBlock::from_bytes(&bytes);

        let ptr = block.as_mut_ptr().cast_const().cast::<u16>();

        // SAFETY: The block holds a terminated UTF-16 sequence.
        let raw = unsafe { marshaler.ptr_to_utf16_units(ptr) };
        assert_eq!(raw.as_deref(), Some(&units[..2]));

        // SAFETY: As above.
        let decoded = unsafe { marshaler.ptr_to_string_unicode(ptr) };
        assert_eq!(decoded.as_deref(), Some("\u{FFFD}A"));
    }

    #[test]
    fn unaligned_unicode_decode() {
        let marshaler = Marshaler::new();

        let mut bytes = vec![0xEE_u8];
        bytes.extend("hi".encode_utf16().chain([0]).flat_map(u16::to_ne_bytes));
        let mut block = FakeBlock::from_bytes(&bytes);

        // SAFETY: Offset 1 is within the block.
        let ptr = unsafe { block.as_mut_ptr().add(1) }.cast_const();

        // SAFETY: The bytes from offset 1 hold a terminated UTF-16 string.
        let decoded = unsafe { marshaler.ptr_to_string_unicode(ptr.cast()) };
        assert_eq!(decoded.as_deref(), Some("hi"));
    }

    #[test]
    fn auto_matches_default_char_size() {
        let marshaler = Marshaler::new();
        let buffer = marshaler.string_to_local_auto(Some("auto")).unwrap();

        // SAFETY: The buffer holds a string in the default encoding.
        let decoded = unsafe { marshaler.ptr_to_string_auto(buffer.as_ptr()) };
        assert_eq!(decoded.as_deref(), Some("auto"));

        // SAFETY: At least 2 characters were written.
        let two = unsafe { marshaler.ptr_to_string_auto_len(buffer.as_ptr(), 2) }.unwrap();
        assert_eq!(two, "au");

        // The second byte is a zero high byte of 'a' only when characters are wide.
        // SAFETY: At least 2 bytes were written.
        let second = unsafe { crate::read_byte(buffer.as_ptr(), 1) };
        assert_eq!(second == 0, SYSTEM_DEFAULT_CHAR_SIZE == 2);

        marshaler.free_local(buffer).unwrap();
    }

    #[test]
    fn utf8_round_trip() {
        let marshaler = Marshaler::builder().code_page(CodePage::Windows1252).build();
        let s = "Ω≈ç√";

        // Ignores the ANSI code page.
        let buffer = marshaler.string_to_task_utf8(Some(s)).unwrap();

        // SAFETY: The buffer holds a terminated UTF-8 string.
        let decoded = unsafe { marshaler.ptr_to_string_utf8(buffer.as_ptr()) };
        assert_eq!(decoded.as_deref(), Some(s));

        // SAFETY: "Ω" is two bytes.
        let first = unsafe { marshaler.ptr_to_string_utf8_len(buffer.as_ptr(), 2) }.unwrap();
        assert_eq!(first, "Ω");

        // SAFETY: The buffer holds a terminated UTF-8 string.
        unsafe { marshaler.zero_free_task_utf8(buffer) }.unwrap();
    }

    #[test]
    fn null_string_gives_null_buffer() {
        let mut bindings = MockBindings::new();
        bindings.expect_local_alloc().never();
        bindings.expect_task_alloc().never();
        bindings.expect_local_free().never();
        bindings.expect_task_free().never();

        let marshaler = mock_marshaler(bindings);

        let ansi = marshaler.string_to_local_ansi(None).unwrap();
        assert!(ansi.is_null());
        marshaler.free_local(ansi).unwrap();

        let unicode = marshaler.string_to_local_unicode(None).unwrap();
        assert!(unicode.is_null());
        marshaler.free_local(unicode).unwrap();

        assert!(marshaler.string_to_task_ansi(None).unwrap().is_null());
        assert!(marshaler.string_to_task_unicode(None).unwrap().is_null());
        assert!(marshaler.string_to_task_auto(None).unwrap().is_null());
        assert!(marshaler.string_to_task_utf8(None).unwrap().is_null());
    }

    #[test]
    fn sentinel_pointers_decode_to_none() {
        let marshaler = Marshaler::new();

        // SAFETY: Sentinels are never dereferenced.
        unsafe {
            assert_eq!(marshaler.ptr_to_string_ansi(ptr::null()), None);
            assert_eq!(marshaler.ptr_to_string_ansi(ptr::without_provenance(0x1234)), None);
            assert_eq!(marshaler.ptr_to_string_unicode(ptr::null()), None);
            assert_eq!(marshaler.ptr_to_string_unicode(ptr::without_provenance(0xFFFE)), None);
            assert_eq!(marshaler.ptr_to_string_auto(ptr::without_provenance(8)), None);
            assert_eq!(marshaler.ptr_to_string_utf8(ptr::null()), None);
            assert_eq!(marshaler.ptr_to_utf16_units(ptr::null()), None);
        }
    }

    #[test]
    fn fixed_length_decoders_validate_arguments() {
        let marshaler = Marshaler::new();
        let byte = 0_u8;

        // SAFETY: Arguments are rejected before any read.
        unsafe {
            assert!(matches!(
                marshaler.ptr_to_string_ansi_len(&raw const byte, -1),
                Err(Error::OutOfRange(_))
            ));
            assert!(matches!(
                marshaler.ptr_to_string_unicode_len(ptr::null(), 3),
                Err(Error::InvalidArgument(_))
            ));
            assert!(matches!(
                marshaler.ptr_to_string_utf8_len(ptr::null(), -5),
                Err(Error::OutOfRange(_))
            ));
            assert_eq!(marshaler.ptr_to_string_ansi_len(&raw const byte, 0).unwrap(), "");
        }
    }

    #[test]
    fn fixed_length_decode_includes_embedded_nul() {
        let marshaler = windows_1252();
        let bytes = *b"a\0b";

        // SAFETY: Reading all three bytes of the array.
        let decoded = unsafe { marshaler.ptr_to_string_ansi_len(bytes.as_ptr(), 3) }.unwrap();
        assert_eq!(decoded, "a\0b");
    }

    #[test]
    fn byte_len_overflow() {
        assert_eq!(string_byte_len(3, 2).unwrap(), 8);
        assert_eq!(string_byte_len(0, 3).unwrap(), 3);

        assert!(matches!(string_byte_len(usize::MAX, 1), Err(Error::OutOfRange(_))));
        assert!(matches!(string_byte_len(usize::MAX / 2, 2), Err(Error::OutOfRange(_))));
        assert!(matches!(string_byte_len(usize::MAX / 4, 3), Err(Error::OutOfRange(_))));
    }

    #[test]
    fn overflow_is_rejected_before_allocation() {
        let mut bindings = MockBindings::new();
        bindings.expect_local_alloc().never();
        bindings.expect_task_alloc().never();

        let marshaler = mock_marshaler(bindings);

        let error = marshaler
            .alloc_string_buffer::<TaskHeap>(usize::MAX / 2, WIDE)
            .unwrap_err();
        assert!(matches!(error, Error::OutOfRange(_)));
        assert!(!error.is_out_of_memory());

        let error = marshaler.alloc_string_buffer::<LocalHeap>(usize::MAX, 1).unwrap_err();
        assert!(matches!(error, Error::OutOfRange(_)));
    }

    #[test]
    fn allocation_failure_is_out_of_memory() {
        let mut bindings = MockBindings::new();
        bindings.expect_task_alloc().times(1).return_const_st(ptr::null_mut());

        let marshaler = mock_marshaler(bindings);

        let error = marshaler.string_to_task_unicode(Some("abc")).unwrap_err();
        assert!(matches!(error, Error::OutOfMemory { requested: 8 }));
    }

    #[test]
    fn zero_free_unicode_clears_payload_before_release() {
        let secret = "hunter2";
        let byte_len = (secret.encode_utf16().count() + 1) * WIDE;

        let mut block = FakeBlock::utf16_terminated(secret, 4);
        let block_ptr = block.as_mut_ptr();
        let block_addr = block.addr();

        let checked = Arc::new(AtomicBool::new(false));
        let checked_in_free = Arc::clone(&checked);

        let mut bindings = MockBindings::new();
        bindings.expect_task_alloc().times(1).return_const_st(block_ptr);
        bindings.expect_task_free().times(1).returning(move |ptr| {
            assert_eq!(ptr.addr(), block_addr);

            // SAFETY: The fake block is still alive; the mock never releases it.
            let payload = unsafe { slice::from_raw_parts(ptr, byte_len) };
            assert!(payload.iter().all(|&b| b == 0), "payload not zeroed: {payload:?}");

            checked_in_free.store(true, Ordering::SeqCst);
        });

        let marshaler = mock_marshaler(bindings);
        let buffer = marshaler.alloc_task(byte_len).unwrap();

        // SAFETY: The buffer holds a terminated UTF-16 string.
        unsafe { marshaler.zero_free_task_unicode(buffer) }.unwrap();

        assert!(checked.load(Ordering::SeqCst));

        // Bytes past the terminator are not part of the string and are left alone.
        assert_eq!(block.bytes()[byte_len..], [0xCD; 4]);
    }

    #[test]
    fn zero_free_ansi_clears_terminator() {
        let mut block = FakeBlock::from_bytes(b"pw\0\xCD");
        let block_ptr = block.as_mut_ptr();

        let mut bindings = MockBindings::new();
        bindings.expect_local_alloc().times(1).return_const_st(block_ptr);
        bindings.expect_local_free().times(1).return_const(Ok(()));

        let marshaler = mock_marshaler(bindings);
        let buffer = marshaler.alloc_local(4).unwrap();

        // SAFETY: The buffer holds a terminated ANSI string.
        unsafe { marshaler.zero_free_local_ansi(buffer) }.unwrap();

        assert_eq!(block.bytes(), [0, 0, 0, 0xCD]);
    }

    #[test]
    fn zero_free_sentinel_is_noop() {
        let mut bindings = MockBindings::new();
        bindings.expect_local_free().never();
        bindings.expect_task_free().never();

        let marshaler = mock_marshaler(bindings);

        // SAFETY: Null buffers are never dereferenced.
        unsafe {
            marshaler.zero_free_local_unicode(LocalBuffer::null()).unwrap();
            marshaler.zero_free_task_ansi(TaskBuffer::null()).unwrap();
        }
    }

    #[test]
    fn zero_free_refuses_foreign_family_without_zeroing() {
        let mut block = FakeBlock::from_bytes(b"key\0");
        let block_ptr = block.as_mut_ptr();

        let mut bindings = MockBindings::new();
        bindings.expect_local_alloc().times(1).return_const_st(block_ptr);
        bindings.expect_task_free().never();

        let marshaler = mock_marshaler(bindings);
        let local = marshaler.alloc_local(4).unwrap();

        // SAFETY: Deliberately mislabeling the block to exercise the registry.
        let disguised = unsafe { TaskBuffer::from_raw(local.into_raw()) };

        // SAFETY: The buffer holds a terminated ANSI string.
        let error = unsafe { marshaler.zero_free_task_ansi(disguised) }.unwrap_err();
        assert!(matches!(error, Error::HeapMismatch { .. }));
        assert_eq!(block.bytes(), b"key\0");
    }

    #[test]
    fn real_zero_free_round_trip() {
        let marshaler = Marshaler::new();

        let local = marshaler.string_to_local_unicode(Some("secret")).unwrap();
        // SAFETY: The buffer holds a terminated UTF-16 string.
        unsafe { marshaler.zero_free_local_unicode(local) }.unwrap();

        let task = marshaler.string_to_task_ansi(Some("secret")).unwrap();
        // SAFETY: The buffer holds a terminated ANSI string.
        unsafe { marshaler.zero_free_task_ansi(task) }.unwrap();
    }

    #[test]
    fn secure_zero_clears_exact_range() {
        let mut bytes = [0xAA_u8; 8];

        // SAFETY: Bytes 2..6 are within the array.
        unsafe { secure_zero(bytes.as_mut_ptr().add(2), 4) };

        assert_eq!(bytes, [0xAA, 0xAA, 0, 0, 0, 0, 0xAA, 0xAA]);
    }
}
