// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Unit test helpers.

use std::io::Write;
use std::sync::{Arc, Mutex};

use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::layer::SubscriberExt;

use crate::Marshaler;
use crate::pal::{BindingsFacade, MockBindings};

/// Captures formatted log output of a thread-local subscriber so tests can inspect it.
#[derive(Clone, Debug, Default)]
pub(crate) struct LogCapture {
    buffer: Arc<Mutex<Vec<u8>>>,
}

impl LogCapture {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn output(&self) -> String {
        String::from_utf8_lossy(&self.buffer.lock().unwrap()).to_string()
    }

    pub(crate) fn assert_contains(&self, expected: &str) {
        let output = self.output();
        assert!(
            output.contains(expected),
            "log output does not contain '{expected}', got:\n{output}"
        );
    }

    /// A subscriber that writes every event, down to TRACE, into this capture.
    /// Use with `tracing::subscriber::with_default()` for thread-local capture.
    pub(crate) fn subscriber(&self) -> impl tracing::Subscriber + Send + Sync + use<> {
        tracing_subscriber::registry().with(
            tracing_subscriber::fmt::layer()
                .with_writer(self.clone())
                .with_ansi(false),
        )
    }
}

impl<'a> MakeWriter<'a> for LogCapture {
    type Writer = LogCaptureWriter;

    fn make_writer(&'a self) -> Self::Writer {
        LogCaptureWriter {
            buffer: Arc::clone(&self.buffer),
        }
    }
}

#[derive(Debug)]
pub(crate) struct LogCaptureWriter {
    buffer: Arc<Mutex<Vec<u8>>>,
}

impl Write for LogCaptureWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.buffer.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

/// A marshaler over mock bindings, with heap family tracking switched on.
pub(crate) fn mock_marshaler(bindings: MockBindings) -> Marshaler {
    Marshaler::builder()
        .bindings(BindingsFacade::from_mock(bindings))
        .track_heap_families(true)
        .build()
}

/// A block of test-owned memory that mock bindings hand out as if it were native memory.
///
/// The mock never really releases anything, so the block stays readable after a "free" and
/// tests can inspect what was written just before the release.
#[derive(Debug)]
pub(crate) struct FakeBlock {
    bytes: Box<[u8]>,
}

impl FakeBlock {
    pub(crate) fn filled(len: usize, value: u8) -> Self {
        Self {
            bytes: vec![value; len].into_boxed_slice(),
        }
    }

    pub(crate) fn from_bytes(bytes: &[u8]) -> Self {
        Self { bytes: bytes.into() }
    }

    /// UTF-16 encoding of `s` with a terminating NUL, followed by `padding` bytes of `0xCD`.
    pub(crate) fn utf16_terminated(s: &str, padding: usize) -> Self {
        let mut bytes: Vec<u8> = s.encode_utf16().chain([0]).flat_map(u16::to_ne_bytes).collect();
        bytes.resize(bytes.len() + padding, 0xCD);
        Self::from_bytes(&bytes)
    }

    pub(crate) fn as_mut_ptr(&mut self) -> *mut u8 {
        self.bytes.as_mut_ptr()
    }

    pub(crate) fn addr(&self) -> usize {
        self.bytes.as_ptr().addr()
    }

    pub(crate) fn bytes(&self) -> &[u8] {
        &self.bytes
    }
}
