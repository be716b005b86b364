// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

// If a lock is poisoned then the heap family registry may be half-updated and can no longer be
// trusted to reject cross-heap operations.
pub const ERR_POISONED_LOCK: &str = "poisoned lock - cannot continue execution because the heap family registry can no longer be trusted";
