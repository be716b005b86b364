// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::collections::HashMap;
use std::sync::Mutex;

use tracing::{Level, event};

use crate::constants::ERR_POISONED_LOCK;
use crate::{Error, HeapKind, Result};

/// Remembers which heap family allocated each live buffer so that cross-family release or
/// resize can be rejected instead of handing a foreign block to the wrong allocator.
///
/// Only buffers allocated while tracking is enabled are known. Unknown addresses (e.g. blocks
/// received from foreign code via `from_raw()`) are allowed through unchecked.
#[derive(Debug, Default)]
pub(crate) struct HeapTracker {
    live: Mutex<HashMap<usize, HeapKind>>,
}

impl HeapTracker {
    pub(crate) fn record(&self, address: usize, heap: HeapKind) {
        self.live.lock().expect(ERR_POISONED_LOCK).insert(address, heap);
    }

    /// Fails if `address` is known to belong to a heap family other than `expected`.
    pub(crate) fn check(&self, address: usize, expected: HeapKind) -> Result<()> {
        let live = self.live.lock().expect(ERR_POISONED_LOCK);
        verify(live.get(&address).copied(), address, expected)
    }

    /// Like [`Self::check`], but also removes the entry under the same lock. Returns whether an
    /// entry was removed, so the caller can restore it if the native release fails.
    ///
    /// The entry must be gone before the block goes back to the platform. Once released, the
    /// address may be handed out again and recorded by another thread.
    pub(crate) fn take(&self, address: usize, expected: HeapKind) -> Result<bool> {
        let mut live = self.live.lock().expect(ERR_POISONED_LOCK);
        verify(live.get(&address).copied(), address, expected)?;
        Ok(live.remove(&address).is_some())
    }

    pub(crate) fn len(&self) -> usize {
        self.live.lock().expect(ERR_POISONED_LOCK).len()
    }
}

fn verify(known: Option<HeapKind>, address: usize, expected: HeapKind) -> Result<()> {
    match known {
        Some(actual) if actual != expected => {
            event!(
                Level::WARN,
                message = "rejected cross-heap operation",
                address = format_args!("{address:#x}"),
                %expected,
                %actual
            );

            Err(Error::HeapMismatch {
                address,
                expected,
                actual,
            })
        }
        _ => Ok(()),
    }
}
