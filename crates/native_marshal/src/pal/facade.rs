// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

#[cfg(test)]
use std::sync::Arc;

#[cfg(test)]
use crate::pal::MockBindings;
use crate::pal::{Bindings, BuildTargetBindings};

// Hides the difference between mock and real bindings behind a common facade.
#[derive(Clone, Debug)]
pub enum BindingsFacade {
    Real(&'static BuildTargetBindings),

    #[cfg(test)]
    Mock(Arc<MockBindings>),
}

impl BindingsFacade {
    #[cfg_attr(test, mutants::skip)] // Low-impact layer, waste of time to mutate.
    pub const fn real() -> Self {
        Self::Real(&BuildTargetBindings)
    }

    #[cfg(test)]
    #[cfg_attr(test, mutants::skip)] // Low-impact layer, waste of time to mutate.
    pub fn from_mock(bindings: MockBindings) -> Self {
        Self::Mock(Arc::new(bindings))
    }
}

impl Bindings for BindingsFacade {
    #[cfg_attr(test, mutants::skip)] // Low-impact layer, waste of time to mutate.
    fn local_alloc(&self, size: usize) -> *mut u8 {
        match self {
            Self::Real(real) => real.local_alloc(size),
            #[cfg(test)]
            Self::Mock(mock) => mock.local_alloc(size),
        }
    }

    #[cfg_attr(test, mutants::skip)] // Low-impact layer, waste of time to mutate.
    unsafe fn local_realloc(&self, ptr: *mut u8, size: usize) -> *mut u8 {
        match self {
            // SAFETY: Forwarding safety requirements.
            Self::Real(real) => unsafe { real.local_realloc(ptr, size) },
            #[cfg(test)]
            // SAFETY: Forwarding safety requirements.
            Self::Mock(mock) => unsafe { mock.local_realloc(ptr, size) },
        }
    }

    #[cfg_attr(test, mutants::skip)] // Low-impact layer, waste of time to mutate.
    unsafe fn local_free(&self, ptr: *mut u8) -> Result<(), i32> {
        match self {
            // SAFETY: Forwarding safety requirements.
            Self::Real(real) => unsafe { real.local_free(ptr) },
            #[cfg(test)]
            // SAFETY: Forwarding safety requirements.
            Self::Mock(mock) => unsafe { mock.local_free(ptr) },
        }
    }

    #[cfg_attr(test, mutants::skip)] // Low-impact layer, waste of time to mutate.
    fn task_alloc(&self, size: usize) -> *mut u8 {
        match self {
            Self::Real(real) => real.task_alloc(size),
            #[cfg(test)]
            Self::Mock(mock) => mock.task_alloc(size),
        }
    }

    #[cfg_attr(test, mutants::skip)] // Low-impact layer, waste of time to mutate.
    unsafe fn task_realloc(&self, ptr: *mut u8, size: usize) -> *mut u8 {
        match self {
            // SAFETY: Forwarding safety requirements.
            Self::Real(real) => unsafe { real.task_realloc(ptr, size) },
            #[cfg(test)]
            // SAFETY: Forwarding safety requirements.
            Self::Mock(mock) => unsafe { mock.task_realloc(ptr, size) },
        }
    }

    #[cfg_attr(test, mutants::skip)] // Low-impact layer, waste of time to mutate.
    unsafe fn task_free(&self, ptr: *mut u8) {
        match self {
            // SAFETY: Forwarding safety requirements.
            Self::Real(real) => unsafe { real.task_free(ptr) },
            #[cfg(test)]
            // SAFETY: Forwarding safety requirements.
            Self::Mock(mock) => unsafe { mock.task_free(ptr) },
        }
    }

    #[cfg_attr(test, mutants::skip)] // Low-impact layer, waste of time to mutate.
    unsafe fn bstr_alloc(&self, units: *const u16, len: u32) -> *mut u16 {
        match self {
            // SAFETY: Forwarding safety requirements.
            Self::Real(real) => unsafe { real.bstr_alloc(units, len) },
            #[cfg(test)]
            // SAFETY: Forwarding safety requirements.
            Self::Mock(mock) => unsafe { mock.bstr_alloc(units, len) },
        }
    }

    #[cfg_attr(test, mutants::skip)] // Low-impact layer, waste of time to mutate.
    unsafe fn bstr_free(&self, bstr: *mut u16) {
        match self {
            // SAFETY: Forwarding safety requirements.
            Self::Real(real) => unsafe { real.bstr_free(bstr) },
            #[cfg(test)]
            // SAFETY: Forwarding safety requirements.
            Self::Mock(mock) => unsafe { mock.bstr_free(bstr) },
        }
    }

    #[cfg_attr(test, mutants::skip)] // Low-impact layer, waste of time to mutate.
    unsafe fn bstr_byte_len(&self, bstr: *const u16) -> u32 {
        match self {
            // SAFETY: Forwarding safety requirements.
            Self::Real(real) => unsafe { real.bstr_byte_len(bstr) },
            #[cfg(test)]
            // SAFETY: Forwarding safety requirements.
            Self::Mock(mock) => unsafe { mock.bstr_byte_len(bstr) },
        }
    }

    #[cfg_attr(test, mutants::skip)] // Low-impact layer, waste of time to mutate.
    fn ansi_code_page(&self) -> u32 {
        match self {
            Self::Real(real) => real.ansi_code_page(),
            #[cfg(test)]
            Self::Mock(mock) => mock.ansi_code_page(),
        }
    }
}
