// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::ptr;
use std::sync::Arc;

use tracing::{Level, event};

use crate::pal::{Bindings, BindingsFacade};
use crate::tracker::HeapTracker;
use crate::{
    CodePage, Error, HeapFamily, HeapKind, LocalBuffer, LocalHeap, NativeBuffer, Result, TaskBuffer, TaskHeap,
    TrackedBuffer, set_last_platform_error, system_code_page,
};

/// Allocates, resizes and releases native memory and converts strings to and from it.
///
/// Every operation is synchronous and completes (or fails) before returning. Failures are
/// reported immediately; nothing is retried.
///
/// # Ownership
///
/// Buffers returned by this type are owned by the caller until passed to the free call of the
/// matching heap family. Conversions from native memory never take ownership of the source.
///
/// # Thread safety
///
/// This type is thread-safe. Clones share configuration and the heap family registry.
#[derive(Clone, Debug)]
pub struct Marshaler {
    bindings: BindingsFacade,
    code_page: CodePage,
    tracker: Option<Arc<HeapTracker>>,
}

impl Marshaler {
    /// Creates a marshaler over the native allocators of the build target, using the active
    /// code page of the process.
    #[must_use]
    pub fn new() -> Self {
        Self::builder().build()
    }

    /// Starts configuring a marshaler.
    pub fn builder() -> MarshalerBuilder {
        MarshalerBuilder::new()
    }

    /// The single-byte code page used by the ANSI conversions of this marshaler.
    #[must_use]
    pub const fn code_page(&self) -> CodePage {
        self.code_page
    }

    /// The number of allocations recorded by the heap family registry that have not yet been
    /// released, or `None` if heap family tracking is disabled.
    #[must_use]
    pub fn tracked_allocation_count(&self) -> Option<usize> {
        self.tracker.as_ref().map(|tracker| tracker.len())
    }

    /// Allocates `size` bytes from the local heap. The memory is not initialized.
    ///
    /// # Errors
    ///
    /// Returns [`Error::OutOfMemory`] if the allocator cannot satisfy the request.
    pub fn alloc_local(&self, size: usize) -> Result<LocalBuffer> {
        self.alloc::<LocalHeap>(size)
    }

    /// Resizes a local heap buffer, possibly moving it. On success the handle refers to the
    /// resized block; on failure it still refers to the original, untouched block.
    ///
    /// A null handle is given a fresh block of `new_size` bytes, or stays null if `new_size`
    /// is zero.
    ///
    /// # Errors
    ///
    /// Returns [`Error::OutOfMemory`] if the allocator cannot satisfy the request,
    /// [`Error::InvalidArgument`] for a non-null sentinel handle, or [`Error::HeapMismatch`]
    /// if the buffer is known to belong to the task heap.
    pub fn realloc_local(&self, buffer: &mut LocalBuffer, new_size: usize) -> Result<()> {
        self.realloc(buffer, new_size)
    }

    /// Releases a local heap buffer. Null and sentinel handles are ignored without calling
    /// into the platform.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NativeOperationFailed`] if the platform reports failure (the code is
    /// also recorded as the last platform error), or [`Error::HeapMismatch`] if the buffer is
    /// known to belong to the task heap, in which case it is not released.
    pub fn free_local(&self, buffer: LocalBuffer) -> Result<()> {
        self.free(buffer)
    }

    /// Allocates `size` bytes from the task heap. The memory is not initialized.
    ///
    /// # Errors
    ///
    /// Returns [`Error::OutOfMemory`] if the allocator cannot satisfy the request.
    pub fn alloc_task(&self, size: usize) -> Result<TaskBuffer> {
        self.alloc::<TaskHeap>(size)
    }

    /// Resizes a task heap buffer, possibly moving it. On failure the handle still refers to
    /// the original, untouched block.
    ///
    /// Resizing to zero bytes releases the block; the handle becomes null if the platform
    /// reports it that way, which is not an error. A null handle is treated as in
    /// [`Self::realloc_local()`].
    ///
    /// # Errors
    ///
    /// Returns [`Error::OutOfMemory`] if the allocator cannot satisfy a non-zero request,
    /// [`Error::InvalidArgument`] for a non-null sentinel handle, or [`Error::HeapMismatch`]
    /// if the buffer is known to belong to the local heap.
    pub fn realloc_task(&self, buffer: &mut TaskBuffer, new_size: usize) -> Result<()> {
        self.realloc(buffer, new_size)
    }

    /// Releases a task heap buffer. Null and sentinel handles are ignored without calling into
    /// the platform.
    ///
    /// # Errors
    ///
    /// Returns [`Error::HeapMismatch`] if the buffer is known to belong to the local heap, in
    /// which case it is not released.
    pub fn free_task(&self, buffer: TaskBuffer) -> Result<()> {
        self.free(buffer)
    }

    /// Allocates `size` zero-initialized bytes from the local heap, paired with their length
    /// for bounds-checked access.
    ///
    /// # Errors
    ///
    /// Returns [`Error::OutOfMemory`] if the allocator cannot satisfy the request.
    pub fn alloc_local_tracked(&self, size: usize) -> Result<TrackedBuffer<LocalHeap>> {
        self.alloc_tracked(size)
    }

    /// Allocates `size` zero-initialized bytes from the task heap, paired with their length
    /// for bounds-checked access.
    ///
    /// # Errors
    ///
    /// Returns [`Error::OutOfMemory`] if the allocator cannot satisfy the request.
    pub fn alloc_task_tracked(&self, size: usize) -> Result<TrackedBuffer<TaskHeap>> {
        self.alloc_tracked(size)
    }

    pub(crate) fn bindings(&self) -> &BindingsFacade {
        &self.bindings
    }

    /// Fails if the heap family registry knows `address` as belonging to a family other than `H`.
    pub(crate) fn verify_family<H: HeapFamily>(&self, address: usize) -> Result<()> {
        self.tracker
            .as_ref()
            .map_or(Ok(()), |tracker| tracker.check(address, H::KIND))
    }

    /// Removes `address` from the heap family registry ahead of handing it back to the
    /// platform. Fails without touching the registry if it belongs to another family.
    fn unregister<H: HeapFamily>(&self, address: usize) -> Result<bool> {
        self.tracker
            .as_ref()
            .map_or(Ok(false), |tracker| tracker.take(address, H::KIND))
    }

    fn register<H: HeapFamily>(&self, address: usize) {
        if let Some(tracker) = &self.tracker {
            tracker.record(address, H::KIND);
        }
    }

    pub(crate) fn alloc<H: HeapFamily>(&self, size: usize) -> Result<NativeBuffer<H>> {
        let ptr = match H::KIND {
            HeapKind::Local => self.bindings.local_alloc(size),
            HeapKind::Task => self.bindings.task_alloc(size),
        };

        if ptr.is_null() {
            event!(Level::DEBUG, message = "native allocation failed", heap = %H::KIND, size);
            return Err(Error::OutOfMemory { requested: size });
        }

        self.register::<H>(ptr.addr());

        event!(Level::TRACE, message = "allocated native buffer", heap = %H::KIND, size, address = ?ptr);

        // SAFETY: The block was just allocated from family H and has no other owner.
        Ok(unsafe { NativeBuffer::from_raw(ptr) })
    }

    fn alloc_tracked<H: HeapFamily>(&self, size: usize) -> Result<TrackedBuffer<H>> {
        let buffer = self.alloc::<H>(size)?;

        // SAFETY: The block was just allocated with room for `size` bytes.
        unsafe { ptr::write_bytes(buffer.as_ptr(), 0, size) };

        // SAFETY: The block is `size` bytes long and every byte is initialized.
        Ok(unsafe { TrackedBuffer::new(buffer, size) })
    }

    pub(crate) fn realloc<H: HeapFamily>(&self, buffer: &mut NativeBuffer<H>, new_size: usize) -> Result<()> {
        if buffer.is_null() {
            // Resizing nothing behaves like a fresh allocation on every platform.
            if new_size != 0 {
                *buffer = self.alloc::<H>(new_size)?;
            }

            return Ok(());
        }

        if buffer.is_sentinel() {
            event!(Level::DEBUG, message = "rejected resize of sentinel handle", heap = %H::KIND, address = ?buffer.as_ptr());
            return Err(Error::InvalidArgument(format!(
                "{:#x} is a sentinel handle, not a resizable block",
                buffer.addr()
            )));
        }

        let old = buffer.as_ptr();
        let registered = self.unregister::<H>(old.addr())?;

        let new = match H::KIND {
            // SAFETY: The handle type guarantees the block belongs to the local heap.
            HeapKind::Local => unsafe { self.bindings.local_realloc(old, new_size) },
            // SAFETY: The handle type guarantees the block belongs to the task heap.
            HeapKind::Task => unsafe { self.bindings.task_realloc(old, new_size) },
        };

        if new.is_null() {
            if H::KIND == HeapKind::Task && new_size == 0 {
                // The task allocator released the block.
                event!(Level::TRACE, message = "released native buffer via resize", heap = %H::KIND, address = ?old);

                *buffer = NativeBuffer::null();
                return Ok(());
            }

            // The original block is untouched and still ours.
            if registered {
                self.register::<H>(old.addr());
            }

            event!(Level::DEBUG, message = "native reallocation failed", heap = %H::KIND, size = new_size);
            return Err(Error::OutOfMemory { requested: new_size });
        }

        if registered {
            self.register::<H>(new.addr());
        }

        event!(Level::TRACE, message = "reallocated native buffer", heap = %H::KIND, size = new_size, from = ?old, to = ?new);

        // SAFETY: The platform resized the block within family H; the old address is gone.
        *buffer = unsafe { NativeBuffer::from_raw(new) };
        Ok(())
    }

    pub(crate) fn free<H: HeapFamily>(&self, buffer: NativeBuffer<H>) -> Result<()> {
        if buffer.is_sentinel() {
            return Ok(());
        }

        let registered = self.unregister::<H>(buffer.addr())?;
        let ptr = buffer.into_raw();

        match H::KIND {
            HeapKind::Local => {
                // SAFETY: The handle type guarantees the block belongs to the local heap and
                // the handle was consumed, so nothing else will release it.
                if let Err(code) = unsafe { self.bindings.local_free(ptr) } {
                    if registered {
                        self.register::<H>(ptr.addr());
                    }

                    event!(Level::WARN, message = "native free failed", heap = %H::KIND, address = ?ptr, code);
                    set_last_platform_error(code);
                    return Err(Error::NativeOperationFailed { code });
                }
            }
            // SAFETY: The handle type guarantees the block belongs to the task heap and the
            // handle was consumed, so nothing else will release it.
            HeapKind::Task => unsafe { self.bindings.task_free(ptr) },
        }

        event!(Level::TRACE, message = "released native buffer", heap = %H::KIND, address = ?ptr);

        Ok(())
    }
}

impl Default for Marshaler {
    fn default() -> Self {
        Self::new()
    }
}

/// Configures a [`Marshaler`].
///
/// ```
/// use native_marshal::{CodePage, Marshaler};
///
/// let marshaler = Marshaler::builder()
///     .code_page(CodePage::Windows1252)
///     .track_heap_families(true)
///     .build();
///
/// assert_eq!(marshaler.code_page(), CodePage::Windows1252);
/// ```
#[derive(Debug)]
#[must_use]
pub struct MarshalerBuilder {
    bindings: BindingsFacade,
    code_page: Option<CodePage>,
    track_heap_families: bool,
}

impl MarshalerBuilder {
    fn new() -> Self {
        Self {
            bindings: BindingsFacade::real(),
            code_page: None,
            track_heap_families: cfg!(debug_assertions),
        }
    }

    /// Overrides the single-byte code page used by the ANSI conversions. Defaults to the
    /// active code page of the process.
    ///
    /// The Auto conversions still dispatch on the process-wide character width.
    pub const fn code_page(mut self, code_page: CodePage) -> Self {
        self.code_page = Some(code_page);
        self
    }

    /// Enables or disables the heap family registry, which records the family of every
    /// allocation and rejects release or resize through the other family with
    /// [`Error::HeapMismatch`]. Enabled by default in debug builds.
    ///
    /// The registry takes a lock on every allocation and release.
    pub const fn track_heap_families(mut self, enabled: bool) -> Self {
        self.track_heap_families = enabled;
        self
    }

    #[cfg(test)]
    pub(crate) fn bindings(mut self, bindings: BindingsFacade) -> Self {
        self.bindings = bindings;
        self
    }

    /// Creates the configured marshaler.
    #[must_use]
    pub fn build(self) -> Marshaler {
        Marshaler {
            bindings: self.bindings,
            code_page: self.code_page.unwrap_or_else(system_code_page),
            tracker: self.track_heap_families.then(|| Arc::new(HeapTracker::default())),
        }
    }
}
