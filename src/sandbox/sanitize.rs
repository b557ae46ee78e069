//! Option sanitizer
//!
//! Strips shell metacharacters from user-controlled strings before they are
//! interpolated into a generated bash script (compiler options into
//! `compile.sh`, command-line arguments into `run.sh`). Every such string must
//! pass through here.

/// Characters that can terminate or chain a command, redirect, or substitute.
pub const UNSAFE_CHARS: [char; 7] = ['$', '&', ';', '<', '>', '|', '`'];

/// Sanitize raw bytes: invalid UTF-8 sequences are dropped, surrounding
/// whitespace trimmed, and every `UNSAFE_CHARS` character removed.
pub fn sanitize(raw: &[u8]) -> String {
    let mut valid = String::with_capacity(raw.len());
    for chunk in raw.utf8_chunks() {
        valid.push_str(chunk.valid());
    }
    sanitize_str(&valid)
}

/// Sanitize an already valid string.
///
/// Only `UNSAFE_CHARS` are removed. Interior line breaks survive, so a value
/// can still put a second line into the rendered script; that line runs inside
/// the same box under the same limits as the first.
pub fn sanitize_str(raw: &str) -> String {
    let stripped: String = raw
        .trim()
        .chars()
        .filter(|c| !UNSAFE_CHARS.contains(c))
        .collect();

    // Removing a metacharacter can expose whitespace at either end ("a ;").
    stripped.trim().to_string()
}
