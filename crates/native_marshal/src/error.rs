// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use thiserror::Error;

use crate::HeapKind;

/// `E_OUTOFMEMORY`
const HRESULT_OUT_OF_MEMORY: u32 = 0x8007_000E;
/// `COR_E_ARGUMENTOUTOFRANGE`
const HRESULT_ARGUMENT_OUT_OF_RANGE: u32 = 0x8013_1502;
/// `E_INVALIDARG`
const HRESULT_INVALID_ARGUMENT: u32 = 0x8007_0057;
/// `E_FAIL`, used when a native operation failed without reporting a meaningful code.
const HRESULT_FAIL: u32 = 0x8000_4005;

/// Any error that may arise from allocating, releasing or converting native memory.
///
/// Errors are raised at the point of detection. Nothing in this crate retries an operation,
/// so every error is for the caller to handle.
///
/// # Thread safety
///
/// This type is thread-safe.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// The platform allocator could not satisfy the request.
    ///
    /// This is the only variant for which retrying with a smaller request may succeed.
    #[error("out of memory: the native allocator could not provide {requested} bytes")]
    OutOfMemory {
        /// Number of bytes that were requested.
        requested: usize,
    },

    /// An index, length or size computation was outside the range the operation supports,
    /// including byte-length arithmetic that would overflow.
    #[error("argument out of range: {0}")]
    OutOfRange(String),

    /// A native operation reported failure through the platform's last-error mechanism.
    ///
    /// The code is also recorded as the last platform error of the calling thread.
    #[error("native operation failed with platform error {code}")]
    NativeOperationFailed {
        /// The platform error code.
        code: i32,
    },

    /// A required argument was missing or malformed, e.g. a null pointer passed where a
    /// readable address is required.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// A buffer was passed to an operation of a heap family other than the one that
    /// allocated it. The buffer was not released or resized.
    ///
    /// Only detected when heap family tracking is enabled on the marshaler.
    #[error("buffer at {address:#x} belongs to the {actual} heap but was passed to a {expected} heap operation")]
    HeapMismatch {
        /// Address of the offending buffer.
        address: usize,
        /// The heap family of the operation that was called.
        expected: HeapKind,
        /// The heap family that allocated the buffer.
        actual: HeapKind,
    },
}

impl Error {
    /// Whether this error signals allocator exhaustion, in which case retrying with a smaller
    /// request is a sensible recovery. Range errors never benefit from a retry.
    #[must_use]
    pub const fn is_out_of_memory(&self) -> bool {
        matches!(self, Self::OutOfMemory { .. })
    }

    /// The COM `HRESULT` that corresponds to this error, for reporting across automation
    /// boundaries.
    #[must_use]
    #[expect(clippy::cast_possible_wrap, reason = "HRESULTs are conventionally written as unsigned hex")]
    pub const fn hresult(&self) -> i32 {
        let value = match self {
            Self::OutOfMemory { .. } => HRESULT_OUT_OF_MEMORY,
            Self::OutOfRange(_) => HRESULT_ARGUMENT_OUT_OF_RANGE,
            Self::NativeOperationFailed { code } => hresult_from_platform_error(*code),
            Self::InvalidArgument(_) | Self::HeapMismatch { .. } => HRESULT_INVALID_ARGUMENT,
        };

        value as i32
    }
}

/// Equivalent of `HRESULT_FROM_WIN32`: wraps a positive platform error code in the Win32
/// facility. Values that are already failure HRESULTs pass through unchanged.
#[expect(clippy::cast_sign_loss, reason = "reinterpreting the bit pattern is the intent")]
const fn hresult_from_platform_error(code: i32) -> u32 {
    if code < 0 {
        code as u32
    } else if code == 0 {
        HRESULT_FAIL
    } else {
        ((code as u32) & 0x0000_FFFF) | 0x8007_0000
    }
}

/// A specialized `Result` for use with marshaling operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Represents a marshaling error as a standard I/O error.
/// This is often used when interoperating with other libraries that expect standard I/O errors.
impl From<Error> for std::io::Error {
    fn from(value: Error) -> Self {
        match value {
            Error::OutOfMemory { .. } => Self::new(std::io::ErrorKind::OutOfMemory, value),
            Error::OutOfRange(_) | Error::InvalidArgument(_) | Error::HeapMismatch { .. } => {
                Self::new(std::io::ErrorKind::InvalidInput, value)
            }
            Error::NativeOperationFailed { code } => Self::from_raw_os_error(code),
        }
    }
}
