// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The last platform error of the calling thread.
//!
//! Native calls that only report failure through the platform's last-error mechanism have their
//! code captured here at the point of failure. Later native calls on the same thread may
//! overwrite the operating system's own last-error slot, but not this one.

use std::cell::Cell;

thread_local! {
    static LAST_PLATFORM_ERROR: Cell<i32> = const { Cell::new(0) };
}

/// Returns the last platform error code recorded on the calling thread, or 0 if none.
#[must_use]
pub fn last_platform_error() -> i32 {
    LAST_PLATFORM_ERROR.with(Cell::get)
}

/// Records `code` as the last platform error of the calling thread.
pub fn set_last_platform_error(code: i32) {
    LAST_PLATFORM_ERROR.with(|e| e.set(code));
}

/// Reads the operating system's last error (`GetLastError` / `errno`) for the calling thread,
/// records it as the last platform error and returns it.
pub fn capture_last_os_error() -> i32 {
    let code = std::io::Error::last_os_error().raw_os_error().unwrap_or(0);
    set_last_platform_error(code);
    code
}
