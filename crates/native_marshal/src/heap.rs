// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::fmt::{self, Debug};
use std::marker::PhantomData;
use std::ptr;

use derive_more::Display;

/// Addresses whose bits above this mask are all zero are reserved pseudo-handles ("atoms"),
/// never real allocations.
const SENTINEL_MASK: usize = 0xFFFF;

/// Identifies one of the two independent native heap families.
///
/// A buffer allocated from one family may only be resized or released through operations of
/// the same family.
#[derive(Clone, Copy, Debug, Display, Eq, Hash, PartialEq)]
pub enum HeapKind {
    /// The primary heap, historically the "local/global" heap.
    #[display("local")]
    Local,

    /// The secondary heap, historically the COM task allocator.
    #[display("task")]
    Task,
}

mod sealed {
    pub trait Sealed {}
}

/// Compile-time tag for a heap family, used to parameterize [`NativeBuffer`].
///
/// This trait is sealed; the only families are [`LocalHeap`] and [`TaskHeap`].
pub trait HeapFamily: sealed::Sealed + Debug + Send + Sync + 'static {
    /// The runtime identity of this family.
    const KIND: HeapKind;
}

/// Marker for the primary ("local") heap family.
#[derive(Debug)]
pub enum LocalHeap {}

/// Marker for the secondary ("task") heap family.
#[derive(Debug)]
pub enum TaskHeap {}

impl sealed::Sealed for LocalHeap {}
impl sealed::Sealed for TaskHeap {}

impl HeapFamily for LocalHeap {
    const KIND: HeapKind = HeapKind::Local;
}

impl HeapFamily for TaskHeap {
    const KIND: HeapKind = HeapKind::Task;
}

/// A native buffer allocated from the local heap.
pub type LocalBuffer = NativeBuffer<LocalHeap>;

/// A native buffer allocated from the task heap.
pub type TaskBuffer = NativeBuffer<TaskHeap>;

/// An owning handle to a native memory block allocated from heap family `H`.
///
/// The handle is only an address: the length of the block is tracked by the caller. The
/// type is move-only, so there is exactly one owner at a time, and ownership ends when the
/// handle is passed to the matching free call of a [`Marshaler`][crate::Marshaler]. Because
/// the family is part of the type, a buffer cannot be released through the other family's
/// operations without going through [`from_raw()`][Self::from_raw].
///
/// Dropping a handle without freeing it leaks the block.
///
/// A handle may be null, e.g. when produced from a `None` string. Freeing a null handle is a
/// no-op.
#[must_use = "dropping a native buffer handle leaks the native memory"]
#[repr(transparent)]
pub struct NativeBuffer<H: HeapFamily> {
    ptr: *mut u8,
    _heap: PhantomData<H>,
}

// SAFETY: The handle is an exclusively owned address. It exposes no access to the memory
// behind it except through `unsafe` functions whose callers take responsibility for
// synchronization, same as an owned `Box` would.
unsafe impl<H: HeapFamily> Send for NativeBuffer<H> {}

// SAFETY: Shared references only expose the address value.
unsafe impl<H: HeapFamily> Sync for NativeBuffer<H> {}

impl<H: HeapFamily> NativeBuffer<H> {
    /// A null handle. Freeing it is a no-op.
    pub const fn null() -> Self {
        Self {
            ptr: ptr::null_mut(),
            _heap: PhantomData,
        }
    }

    /// Takes ownership of a raw block address.
    ///
    /// # Safety
    ///
    /// `ptr` must be null, a sentinel handle, or a live block allocated from heap family `H`
    /// that no other owner will release.
    pub const unsafe fn from_raw(ptr: *mut u8) -> Self {
        Self {
            ptr,
            _heap: PhantomData,
        }
    }

    /// Gives up ownership of the block and returns its address. The caller becomes
    /// responsible for releasing it through heap family `H`.
    #[must_use = "the returned address is the only remaining reference to the native memory"]
    pub const fn into_raw(self) -> *mut u8 {
        self.ptr
    }

    /// The address of the block.
    #[must_use]
    pub const fn as_ptr(&self) -> *mut u8 {
        self.ptr
    }

    /// The address of the block as an integer.
    #[must_use]
    pub fn addr(&self) -> usize {
        self.ptr.addr()
    }

    /// Whether this is a null handle.
    #[must_use]
    pub fn is_null(&self) -> bool {
        self.ptr.is_null()
    }

    /// The heap family this buffer belongs to.
    #[must_use]
    pub const fn heap(&self) -> HeapKind {
        H::KIND
    }

    /// Whether the address is a reserved pseudo-handle rather than a real allocation.
    /// Null is a sentinel.
    #[must_use]
    pub fn is_sentinel(&self) -> bool {
        is_sentinel_handle(self.ptr)
    }
}

impl<H: HeapFamily> Debug for NativeBuffer<H> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NativeBuffer")
            .field("heap", &H::KIND)
            .field("ptr", &self.ptr)
            .finish()
    }
}

/// Whether `ptr` is a reserved small-integer pseudo-handle (an "atom") rather than a real
/// address, i.e. all of its bits above the low 16 are zero. Null is a sentinel.
///
/// This is a legacy compatibility test. Operations that would otherwise dereference or release
/// the address treat sentinels as "nothing to do". It says nothing about whether a non-sentinel
/// address is valid.
#[must_use]
pub fn is_sentinel_handle<T>(ptr: *const T) -> bool {
    (ptr.addr() & !SENTINEL_MASK) == 0
}
