// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::sync::LazyLock;

use derive_more::Display;
use tracing::{Level, event};

use crate::pal::{Bindings, BindingsFacade};

/// Code page identifier of Windows-1252 ("Western European").
const CP_WINDOWS_1252: u32 = 1252;

/// Code page identifier of UTF-8.
const CP_UTF8: u32 = 65001;

/// Byte emitted for characters the single-byte code page cannot represent.
const REPLACEMENT_BYTE: u8 = b'?';

/// Windows-1252 assigns printable characters to most of 0x80..=0x9F. Bytes left undefined by
/// the code page (0x81, 0x8D, 0x8F, 0x90, 0x9D) map to the C1 control with the same value.
const WINDOWS_1252_HIGH: [char; 32] = [
    '\u{20AC}', '\u{0081}', '\u{201A}', '\u{0192}', '\u{201E}', '\u{2026}', '\u{2020}', '\u{2021}', // 0x80
    '\u{02C6}', '\u{2030}', '\u{0160}', '\u{2039}', '\u{0152}', '\u{008D}', '\u{017D}', '\u{008F}', // 0x88
    '\u{0090}', '\u{2018}', '\u{2019}', '\u{201C}', '\u{201D}', '\u{2022}', '\u{2013}', '\u{2014}', // 0x90
    '\u{02DC}', '\u{2122}', '\u{0161}', '\u{203A}', '\u{0153}', '\u{009D}', '\u{017E}', '\u{0178}', // 0x98
];

/// The single-byte ("ANSI") encoding used by the ANSI and, on single-byte platforms, the Auto
/// string conversions.
#[derive(Clone, Copy, Debug, Display, Eq, Hash, PartialEq)]
#[non_exhaustive]
pub enum CodePage {
    /// Windows-1252. One byte per character; characters outside the code page become `?`.
    #[display("windows-1252")]
    Windows1252,

    /// UTF-8. Up to three bytes per UTF-16 code unit.
    #[display("utf-8")]
    Utf8,
}

impl CodePage {
    /// The platform identifier of the code page.
    #[must_use]
    pub const fn id(self) -> u32 {
        match self {
            Self::Windows1252 => CP_WINDOWS_1252,
            Self::Utf8 => CP_UTF8,
        }
    }

    /// The conventional name of the code page, as also used by `Display`.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Windows1252 => "windows-1252",
            Self::Utf8 => "utf-8",
        }
    }

    /// Looks up a code page by platform identifier. Returns `None` for code pages this crate
    /// cannot encode.
    #[must_use]
    pub const fn from_id(id: u32) -> Option<Self> {
        match id {
            CP_WINDOWS_1252 => Some(Self::Windows1252),
            CP_UTF8 => Some(Self::Utf8),
            _ => None,
        }
    }

    /// The largest number of bytes a single UTF-16 code unit can encode to.
    ///
    /// A surrogate pair is two code units and encodes to at most four bytes, so sizing a
    /// buffer as `code units * max_bytes_per_char()` is always sufficient.
    #[must_use]
    pub const fn max_bytes_per_char(self) -> usize {
        match self {
            Self::Windows1252 => 1,
            Self::Utf8 => 3,
        }
    }

    /// Appends the encoded form of `s` to `out`, without a terminator.
    pub(crate) fn encode_into(self, s: &str, out: &mut Vec<u8>) {
        match self {
            Self::Utf8 => out.extend_from_slice(s.as_bytes()),
            Self::Windows1252 => out.extend(s.chars().map(encode_windows_1252)),
        }
    }

    /// Decodes `bytes`. Invalid UTF-8 sequences become U+FFFD.
    pub(crate) fn decode(self, bytes: &[u8]) -> String {
        match self {
            Self::Utf8 => String::from_utf8_lossy(bytes).into_owned(),
            Self::Windows1252 => bytes.iter().copied().map(decode_windows_1252).collect(),
        }
    }
}

fn encode_windows_1252(c: char) -> u8 {
    match u32::from(c) {
        0x00..=0x7F | 0xA0..=0xFF => u8::try_from(c).unwrap_or(REPLACEMENT_BYTE),
        _ => WINDOWS_1252_HIGH
            .iter()
            .position(|&mapped| mapped == c)
            .and_then(|index| u8::try_from(index).ok())
            .map_or(REPLACEMENT_BYTE, |offset| 0x80 + offset),
    }
}

fn decode_windows_1252(byte: u8) -> char {
    match byte {
        0x80..=0x9F => WINDOWS_1252_HIGH[usize::from(byte - 0x80)],
        _ => char::from(byte),
    }
}

static SYSTEM_CODE_PAGE: LazyLock<CodePage> = LazyLock::new(|| detect_code_page(&BindingsFacade::real()));

/// Character width, in bytes, of the platform's default string encoding: 2 where the platform
/// speaks UTF-16 natively (Windows), 1 elsewhere.
pub const SYSTEM_DEFAULT_CHAR_SIZE: usize = if cfg!(windows) { 2 } else { 1 };

/// The character width that the Auto string conversions dispatch on. See
/// [`SYSTEM_DEFAULT_CHAR_SIZE`].
#[must_use]
pub const fn system_default_char_size() -> usize {
    SYSTEM_DEFAULT_CHAR_SIZE
}

/// The active single-byte code page of the process.
///
/// Determined once, on first use, from the platform and never recomputed.
#[must_use]
pub fn system_code_page() -> CodePage {
    *SYSTEM_CODE_PAGE
}

/// The maximum number of bytes one character occupies in the active code page.
#[must_use]
pub fn system_max_dbcs_char_size() -> usize {
    system_code_page().max_bytes_per_char()
}

fn detect_code_page(bindings: &impl Bindings) -> CodePage {
    let id = bindings.ansi_code_page();

    let code_page = CodePage::from_id(id).unwrap_or_else(|| {
        event!(
            Level::WARN,
            message = "unsupported active code page, falling back to windows-1252",
            code_page = id
        );
        CodePage::Windows1252
    });

    event!(Level::DEBUG, message = "active code page", %code_page);

    code_page
}
