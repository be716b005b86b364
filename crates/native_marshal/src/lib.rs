// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

#![cfg_attr(coverage_nightly, feature(coverage_attribute))]
#![cfg_attr(docsrs, feature(doc_cfg))]

//! Native memory allocation, scalar access and string marshaling for code that crosses an
//! interop boundary.
//!
//! The crate covers the low-level half of talking to native code:
//!
//! * Allocating, resizing and releasing memory from two independent native heap families, the
//!   [local heap][LocalHeap] and the [task heap][TaskHeap]. Buffers carry their family in their
//!   type, so a buffer cannot be released through the wrong allocator by accident.
//! * Copying [scalar arrays][NativeScalar] between Rust slices and native memory with the
//!   range validated up front, and reading or writing individual scalars at byte offsets.
//! * Converting strings to and from NUL-terminated native strings in the active single-byte
//!   [code page][CodePage], UTF-16, UTF-8 and the platform's default width, plus
//!   length-prefixed [automation strings][Bstr].
//! * Overwriting sensitive strings with zeros before releasing them.
//!
//! Most operations are methods of [`Marshaler`], which binds them to the platform allocators
//! and carries configuration such as the ANSI code page:
//!
//! ```
//! use native_marshal::Marshaler;
//!
//! let marshaler = Marshaler::new();
//!
//! let buffer = marshaler.string_to_task_unicode(Some("hello")).unwrap();
//!
//! // SAFETY: The buffer holds a NUL-terminated UTF-16 string.
//! let text = unsafe { marshaler.ptr_to_string_unicode(buffer.as_ptr().cast::<u16>()) };
//! assert_eq!(text.as_deref(), Some("hello"));
//!
//! marshaler.free_task(buffer).unwrap();
//! ```
//!
//! # Safety model
//!
//! Allocation, release and conversion to native memory are safe: the handle types own their
//! memory and cannot be duplicated. Anything that dereferences an address the crate did not
//! just produce (decoding, zero-free, raw scalar access) is `unsafe` and documents what the
//! caller must guarantee.
//!
//! Small integer values that are not real addresses (null and other "atoms" whose bits above
//! the low 16 are zero) are treated as "nothing there": freeing them is a no-op and decoding
//! them yields `None`. See [`is_sentinel_handle()`].

#[cfg(not(any(unix, windows)))]
compile_error!("native_marshal supports only Unix and Windows targets");

pub(crate) mod pal;

mod bstr;
mod constants;
mod encoding;
mod error;
mod heap;
mod last_error;
mod marshaler;
mod scalar;
mod strings;
mod tracked;
mod tracker;

pub use bstr::*;
pub use encoding::*;
pub use error::*;
pub use heap::*;
pub use last_error::*;
pub use marshaler::*;
pub use scalar::*;
pub use tracked::*;

#[cfg(test)]
mod testing;

#[cfg(doctest)]
#[doc = include_str!("../README.md")]
struct ReadmeDoctests;
