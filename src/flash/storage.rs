//! Settings file parsing and key lookup.
//!
//! The file is UTF-8 text of `key=value` lines. Parsing is a single
//! forward pass with a five-state machine — no allocation, no line
//! splitting — because on the device the file is read straight out of
//! memory-mapped flash.
//!
//! File rules (bit-exact with the on-flash format):
//! - the file ends at the first `0x00`, `0x1A` or `0xFF` byte, or at the
//!   region size, whichever comes first;
//! - lines end with `\n` or `\r`;
//! - a key matches only when the literal key bytes start the line and are
//!   followed immediately by `=` (leading whitespace defeats the match);
//! - the first occurrence of a key wins;
//! - values may be empty; keys may not.

use crate::error::Result;
use crate::ports::FlashPort;

use super::SETTINGS_FILE_SIZE;

/// Maximum accepted `update_secret` length in bytes.
pub const MAX_SECRET_SIZE: usize = 128;

/// Whether `b` terminates the file (NUL, CP/M EOF, erased flash).
pub const fn is_end_of_file_byte(b: u8) -> bool {
    matches!(b, 0x00 | 0x1A | 0xFF)
}

/// Whether `b` terminates a line. EOF bytes are a subset of EOL bytes.
pub const fn is_end_of_line_byte(b: u8) -> bool {
    matches!(b, b'\r' | b'\n') || is_end_of_file_byte(b)
}

// ── Lookup ───────────────────────────────────────────────────

enum ParseState {
    NewLine,
    Key,
    Separator,
    Value,
    WaitForNewLine,
}

/// Scan `file` for `key` and copy its value into `out`.
///
/// Returns `Some(n)` with the number of bytes copied when the key was
/// found. A value longer than `out` is truncated and reported as
/// `out.len()`; the caller cannot distinguish an exact fit from a
/// truncation without retrying with a larger buffer.
pub fn get_value_for_key_within_file(file: &[u8], key: &str, out: &mut [u8]) -> Option<usize> {
    let key = key.as_bytes();
    if key.is_empty() {
        return None;
    }

    let mut state = ParseState::NewLine;
    let mut key_index = 0;
    let mut value_index = 0;

    for &b in file {
        if is_end_of_file_byte(b) {
            break;
        }
        if b == b'\n' || b == b'\r' {
            if matches!(state, ParseState::Value) {
                return Some(value_index);
            }
            state = ParseState::NewLine;
            continue;
        }

        match state {
            ParseState::NewLine => {
                key_index = 0;
                if key[key_index] == b {
                    key_index += 1;
                    state = if key_index == key.len() {
                        ParseState::Separator
                    } else {
                        ParseState::Key
                    };
                } else {
                    state = ParseState::WaitForNewLine;
                }
            }
            ParseState::Key => {
                if key[key_index] == b {
                    key_index += 1;
                    if key_index == key.len() {
                        state = ParseState::Separator;
                    }
                } else {
                    state = ParseState::WaitForNewLine;
                }
            }
            ParseState::Separator => {
                if b == b'=' {
                    value_index = 0;
                    state = ParseState::Value;
                } else {
                    state = ParseState::WaitForNewLine;
                }
            }
            ParseState::Value => {
                if value_index >= out.len() {
                    // Out of space: the value is reported truncated.
                    return Some(out.len());
                }
                out[value_index] = b;
                value_index += 1;
            }
            ParseState::WaitForNewLine => {}
        }
    }

    if matches!(state, ParseState::Value) {
        // End of file mid-value: what was read so far is the value.
        return Some(value_index);
    }
    None
}

// ── Enumeration ──────────────────────────────────────────────

/// Byte ranges of one `key=value` record inside the file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyValueSpan {
    /// First byte of the key.
    pub key_start: usize,
    /// First byte of the value (one past the `=`).
    pub value_start: usize,
    /// One past the last value byte (the EOL, or the file end).
    pub end: usize,
}

impl KeyValueSpan {
    pub fn key<'a>(&self, file: &'a [u8]) -> &'a [u8] {
        &file[self.key_start..self.value_start - 1]
    }

    pub fn value<'a>(&self, file: &'a [u8]) -> &'a [u8] {
        &file[self.value_start..self.end]
    }
}

/// Find the next `key=value` record at or after byte index `from`.
///
/// Lines without `=`, and lines whose `=` is the first character (an
/// empty key), are skipped. Returns `None` at end of file.
pub fn find_next_key(file: &[u8], from: usize) -> Option<KeyValueSpan> {
    let mut index = from;

    loop {
        // Find the next non-EOL character, i.e. the start of a line.
        loop {
            if index >= file.len() || is_end_of_file_byte(file[index]) {
                return None;
            }
            if !is_end_of_line_byte(file[index]) {
                break;
            }
            index += 1;
        }

        let key_start = index;
        while index < file.len() && file[index] != b'=' && !is_end_of_line_byte(file[index]) {
            index += 1;
        }
        if index >= file.len() {
            return None;
        }

        if file[index] == b'=' && key_start < index {
            let value_start = index + 1;
            index = value_start;
            while index < file.len() && !is_end_of_line_byte(file[index]) {
                index += 1;
            }
            return Some(KeyValueSpan {
                key_start,
                value_start,
                end: index,
            });
        }

        // No key on this line; skip to the end of it and try the next.
        while index < file.len() && !is_end_of_line_byte(file[index]) {
            index += 1;
        }
    }
}

// ── Settings sources ─────────────────────────────────────────

/// Key lookup as consumed by the connection manager and the remote
/// service. The production implementation reads the flash sector; tests
/// substitute an in-memory map.
pub trait SettingsSource {
    /// Look up `key`; copy up to `out.len()` bytes of the value and
    /// return the copied length, or `None` when the key is absent.
    fn lookup(&self, key: &str, out: &mut [u8]) -> Option<usize>;
}

/// A point-in-time snapshot of the on-flash settings file.
///
/// The sector is copied out once at load time, so a concurrent settings
/// update changes nothing under a live snapshot; callers observe either
/// the old or the new file, never a mixture.
pub struct SettingsFile {
    contents: Box<[u8; SETTINGS_FILE_SIZE]>,
}

impl SettingsFile {
    /// Copy the settings sector out of flash.
    pub fn load(flash: &dyn FlashPort) -> Result<Self> {
        let mut contents = Box::new([0u8; SETTINGS_FILE_SIZE]);
        let region = flash.layout().settings_file();
        flash.read(region.start, &mut contents[..])?;
        Ok(Self { contents })
    }

    /// The raw file bytes, up to the region size.
    pub fn bytes(&self) -> &[u8] {
        &self.contents[..]
    }

    /// Enumerate records from byte index `*cursor`, advancing the cursor.
    pub fn next_key(&self, cursor: &mut usize) -> Option<KeyValueSpan> {
        let span = find_next_key(self.bytes(), *cursor)?;
        *cursor = span.end;
        Some(span)
    }
}

impl SettingsSource for SettingsFile {
    fn lookup(&self, key: &str, out: &mut [u8]) -> Option<usize> {
        get_value_for_key_within_file(self.bytes(), key, out)
    }
}
