//! Symbolic key names and their terminal escape sequences.
//!
//! Callers address keys by name, never by raw bytes; the mapping below is
//! part of the public contract and has to match what interactive programs
//! expect from a real terminal (arrow keys are CSI sequences, enter is a
//! single carriage return, ctrl combinations are the C0 control bytes).

use crate::error::{ApiError, ErrorCode, BridgeResult};

const ESC: u8 = 0x1b;

/// Resolves a symbolic key name to the byte sequence written to the backend.
///
/// Accepted names are lowercase; `+`, `-` and `_` are interchangeable in
/// combinations ("ctrl+c", "ctrl-c" and "ctrl_c" are the same key).
pub fn key_bytes(name: &str) -> BridgeResult<Vec<u8>> {
    let normalized = name.trim().to_ascii_lowercase().replace(['-', '_'], "+");
    if let Some(letter) = normalized.strip_prefix("ctrl+") {
        let mut chars = letter.chars();
        if let (Some(ch), None) = (chars.next(), chars.next())
            && ch.is_ascii_lowercase()
        {
            return Ok(vec![ch as u8 - b'a' + 1]);
        }
        return Err(unknown_key(name));
    }

    let bytes = match normalized.as_str() {
        "enter" | "return" => vec![b'\r'],
        "tab" => vec![b'\t'],
        "escape" | "esc" => vec![ESC],
        "backspace" => vec![0x7f],
        "delete" => vec![ESC, b'[', b'3', b'~'],
        "insert" => vec![ESC, b'[', b'2', b'~'],
        "home" => vec![ESC, b'[', b'H'],
        "end" => vec![ESC, b'[', b'F'],
        "page+up" | "pageup" => vec![ESC, b'[', b'5', b'~'],
        "page+down" | "pagedown" => vec![ESC, b'[', b'6', b'~'],
        "up" | "arrow+up" => vec![ESC, b'[', b'A'],
        "down" | "arrow+down" => vec![ESC, b'[', b'B'],
        "left" | "arrow+left" => vec![ESC, b'[', b'D'],
        "right" | "arrow+right" => vec![ESC, b'[', b'C'],
        "f1" => vec![ESC, b'O', b'P'],
        "f2" => vec![ESC, b'O', b'Q'],
        "f3" => vec![ESC, b'O', b'R'],
        "f4" => vec![ESC, b'O', b'S'],
        "f5" => vec![ESC, b'[', b'1', b'5', b'~'],
        "f6" => vec![ESC, b'[', b'1', b'7', b'~'],
        "f7" => vec![ESC, b'[', b'1', b'8', b'~'],
        "f8" => vec![ESC, b'[', b'1', b'9', b'~'],
        "f9" => vec![ESC, b'[', b'2', b'0', b'~'],
        "f10" => vec![ESC, b'[', b'2', b'1', b'~'],
        "f11" => vec![ESC, b'[', b'2', b'3', b'~'],
        "f12" => vec![ESC, b'[', b'2', b'4', b'~'],
        _ => return Err(unknown_key(name)),
    };
    Ok(bytes)
}

fn unknown_key(name: &str) -> crate::error::BridgeError {
    ApiError::new(
        ErrorCode::InvalidArgument,
        format!("Unknown key name: {name}"),
    )
    .into()
}
