// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

mod abstractions;
mod facade;
pub use abstractions::*;
pub use facade::*;

#[cfg(windows)]
mod windows;
#[cfg(windows)]
pub use windows::*;

#[cfg(unix)]
mod unix;
#[cfg(unix)]
pub use unix::*;
