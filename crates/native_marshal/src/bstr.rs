// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::fmt::{self, Debug};
use std::ptr;

use tracing::{Level, event};

use crate::pal::Bindings;
use crate::strings::secure_zero;
use crate::{Error, Marshaler, Result, is_sentinel_handle};

/// An owning handle to a length-prefixed automation string ("BSTR").
///
/// The payload is UTF-16, preceded by a 32-bit byte length and followed by a zero code unit.
/// The handle points at the first code unit. On Windows the string comes from the OLE
/// automation allocator. Elsewhere the same layout is emulated on the C runtime heap.
///
/// Release the string with [`Marshaler::free_bstr()`] or [`Marshaler::zero_free_bstr()`].
/// Dropping the handle leaks it.
#[must_use = "dropping a BSTR handle leaks the native memory"]
#[repr(transparent)]
pub struct Bstr {
    ptr: *mut u16,
}

// SAFETY: Same reasoning as for NativeBuffer: an exclusively owned address whose contents are
// only reachable through `unsafe` code.
unsafe impl Send for Bstr {}

// SAFETY: Shared references only expose the address value.
unsafe impl Sync for Bstr {}

impl Bstr {
    /// A null string. Freeing it is a no-op.
    pub const fn null() -> Self {
        Self { ptr: ptr::null_mut() }
    }

    /// Takes ownership of a raw automation string.
    ///
    /// # Safety
    ///
    /// `ptr` must be null, a sentinel handle, or a live automation string allocated by the
    /// platform's automation string allocator that no other owner will release.
    pub const unsafe fn from_raw(ptr: *mut u16) -> Self {
        Self { ptr }
    }

    /// Gives up ownership and returns the address of the first code unit.
    #[must_use = "the returned address is the only remaining reference to the native memory"]
    pub const fn into_raw(self) -> *mut u16 {
        self.ptr
    }

    /// The address of the first code unit.
    #[must_use]
    pub const fn as_ptr(&self) -> *mut u16 {
        self.ptr
    }

    /// Whether this is a null string.
    #[must_use]
    pub fn is_null(&self) -> bool {
        self.ptr.is_null()
    }
}

impl Debug for Bstr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Bstr").field(&self.ptr).finish()
    }
}

impl Marshaler {
    /// Copies `s` into a new automation string. `None` produces a null string.
    ///
    /// # Errors
    ///
    /// Returns [`Error::OutOfRange`] if the string is too long for the 32-bit length prefix,
    /// and [`Error::OutOfMemory`] if the allocation fails.
    pub fn string_to_bstr(&self, s: Option<&str>) -> Result<Bstr> {
        let Some(s) = s else {
            return Ok(Bstr::null());
        };

        let units: Vec<u16> = s.encode_utf16().collect();
        let len = bstr_units(units.len())?;

        // SAFETY: `units` is readable for `len` code units.
        let ptr = unsafe { self.bindings().bstr_alloc(units.as_ptr(), len) };

        if ptr.is_null() {
            let requested = size_of_val(units.as_slice()) + size_of::<u32>() + size_of::<u16>();
            event!(Level::DEBUG, message = "automation string allocation failed", size = requested);
            return Err(Error::OutOfMemory { requested });
        }

        event!(Level::TRACE, message = "allocated automation string", units = len, address = ?ptr);

        // SAFETY: Freshly allocated by the automation string allocator.
        Ok(unsafe { Bstr::from_raw(ptr) })
    }

    /// Decodes an automation string, using its length prefix rather than scanning for a
    /// terminator. Embedded zero code units are preserved and unpaired surrogates become
    /// U+FFFD.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidArgument`] if `ptr` is null.
    ///
    /// # Safety
    ///
    /// Unless null, `ptr` must be a live automation string.
    pub unsafe fn ptr_to_string_bstr(&self, ptr: *const u16) -> Result<String> {
        if ptr.is_null() {
            return Err(Error::InvalidArgument("automation string pointer is null".to_string()));
        }

        // SAFETY: Forwarding safety requirements.
        let len = unsafe { self.bstr_len(ptr) };

        // SAFETY: The length prefix describes how many code units are readable.
        let units = unsafe { std::slice::from_raw_parts(ptr, len) };
        Ok(String::from_utf16_lossy(units))
    }

    /// The number of UTF-16 code units in an automation string, as recorded in its length
    /// prefix. A null pointer has length 0.
    ///
    /// # Safety
    ///
    /// Unless null, `ptr` must be a live automation string.
    #[must_use]
    pub unsafe fn bstr_len(&self, ptr: *const u16) -> usize {
        // SAFETY: Forwarding safety requirements.
        let bytes = unsafe { self.bindings().bstr_byte_len(ptr) };
        bytes as usize / size_of::<u16>()
    }

    /// Releases an automation string. Null and sentinel handles are ignored without calling
    /// into the platform.
    pub fn free_bstr(&self, bstr: Bstr) {
        if is_sentinel_handle(bstr.as_ptr()) {
            return;
        }

        let ptr = bstr.into_raw();

        // SAFETY: The handle owned the string and was consumed.
        unsafe { self.bindings().bstr_free(ptr) };

        event!(Level::TRACE, message = "released automation string", address = ?ptr);
    }

    /// Overwrites the payload and terminator of an automation string with zeros, then
    /// releases it. The length comes from the string's own prefix. Null and sentinel handles
    /// are ignored.
    pub fn zero_free_bstr(&self, bstr: Bstr) {
        if is_sentinel_handle(bstr.as_ptr()) {
            return;
        }

        let ptr = bstr.as_ptr();

        // SAFETY: The handle guarantees a live automation string.
        let payload_bytes = unsafe { self.bindings().bstr_byte_len(ptr) } as usize;

        // SAFETY: The payload is followed by a zero code unit, all within the allocation.
        unsafe { secure_zero(ptr.cast(), payload_bytes + size_of::<u16>()) };

        self.free_bstr(bstr);
    }
}

/// Validates that a string of `units` code units fits the 32-bit byte-length prefix.
fn bstr_units(units: usize) -> Result<u32> {
    let fits = u32::try_from(units)
        .ok()
        .filter(|len| len.checked_add(1).is_some() && len.checked_mul(2).is_some());

    fits.ok_or_else(|| {
        event!(Level::DEBUG, message = "rejected oversized automation string", units);
        Error::OutOfRange(format!(
            "a string of {units} code units does not fit an automation string length prefix"
        ))
    })
}

#[cfg(test)]
mod tests {
    use static_assertions::{assert_impl_all, assert_not_impl_any};

    use super::*;
    use crate::pal::MockBindings;
    use crate::testing::{FakeBlock, mock_marshaler};

    #[test]
    fn handle_is_move_only_and_thread_safe() {
        assert_impl_all!(Bstr: Send, Sync, Debug);
        assert_not_impl_any!(Bstr: Clone, Copy);
    }

    #[test]
    fn round_trip() {
        let marshaler = Marshaler::new();

        for s in ["", "automation", "with\0nul", "😀"] {
            let bstr = marshaler.string_to_bstr(Some(s)).unwrap();

            // SAFETY: Freshly allocated automation string.
            unsafe {
                assert_eq!(marshaler.bstr_len(bstr.as_ptr()), s.encode_utf16().count());
                assert_eq!(marshaler.ptr_to_string_bstr(bstr.as_ptr()).unwrap(), s);
            }

            marshaler.free_bstr(bstr);
        }
    }

    #[test]
    fn terminated_after_payload() {
        let marshaler = Marshaler::new();
        let bstr = marshaler.string_to_bstr(Some("ab")).unwrap();

        // SAFETY: The payload is 2 units followed by a terminator.
        let terminator = unsafe { bstr.as_ptr().add(2).read() };
        assert_eq!(terminator, 0);

        // SAFETY: The payload is readable as a terminated UTF-16 string too.
        let decoded = unsafe { marshaler.ptr_to_string_unicode(bstr.as_ptr()) };
        assert_eq!(decoded.as_deref(), Some("ab"));

        marshaler.zero_free_bstr(bstr);
    }

    #[test]
    fn null_handling() {
        let mut bindings = MockBindings::new();
        bindings.expect_bstr_alloc().never();
        bindings.expect_bstr_free().never();
        bindings.expect_bstr_byte_len().never();

        let marshaler = mock_marshaler(bindings);

        let bstr = marshaler.string_to_bstr(None).unwrap();
        assert!(bstr.is_null());
        marshaler.free_bstr(bstr);
        marshaler.zero_free_bstr(Bstr::null());

        // SAFETY: Null is rejected before use.
        let error = unsafe { marshaler.ptr_to_string_bstr(ptr::null()) }.unwrap_err();
        assert!(matches!(error, Error::InvalidArgument(_)));
    }

    #[test]
    fn allocation_failure() {
        let mut bindings = MockBindings::new();
        bindings
            .expect_bstr_alloc()
            .times(1)
            .withf(|_, len| *len == 3)
            .return_const_st(ptr::null_mut());

        let marshaler = mock_marshaler(bindings);

        let error = marshaler.string_to_bstr(Some("abc")).unwrap_err();
        assert!(error.is_out_of_memory());
    }

    #[test]
    fn length_limits() {
        assert_eq!(bstr_units(0).unwrap(), 0);
        assert_eq!(bstr_units(0x7FFF_FFFF).unwrap(), 0x7FFF_FFFF);

        // Doubling to a byte count would wrap.
        assert!(matches!(bstr_units(0x8000_0000), Err(Error::OutOfRange(_))));
        assert!(matches!(bstr_units(usize::MAX), Err(Error::OutOfRange(_))));
    }

    #[test]
    fn zero_free_uses_length_prefix() {
        // Payload "k\0y" (embedded NUL) plus terminator, then a canary unit.
        let units = [u16::from(b'k'), 0, u16::from(b'y'), 0, 0xCDCD];
        let bytes: Vec<u8> = units.iter().flat_map(|u| u.to_ne_bytes()).collect();
        let mut block = FakeBlock::from_bytes(&bytes);
        let bstr_ptr = block.as_mut_ptr().cast::<u16>();
        let bstr_addr = block.addr();

        let mut bindings = MockBindings::new();
        bindings.expect_bstr_byte_len().times(1).return_const(6_u32);
        bindings
            .expect_bstr_free()
            .times(1)
            .withf(move |ptr| ptr.addr() == bstr_addr)
            .return_const(());

        let marshaler = mock_marshaler(bindings);

        // SAFETY: The fake block stands in for a live automation string.
        let bstr = unsafe { Bstr::from_raw(bstr_ptr) };
        marshaler.zero_free_bstr(bstr);

        assert_eq!(block.bytes()[..8], [0; 8]);
        assert_eq!(block.bytes()[8..], [0xCD, 0xCD]);
    }
}
