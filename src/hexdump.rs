// com2tcp - Byte Dump Formatter
// Hex rendering of relayed chunks for dump mode

use std::fmt::Write;

/// Formats bytes as lowercase two-digit hex, separated by single spaces.
pub fn format_hex(data: &[u8]) -> String {
    let mut out = String::with_capacity(data.len() * 3);
    for (i, byte) in data.iter().enumerate() {
        if i > 0 {
            out.push(' ');
        }
        let _ = write!(out, "{:02x}", byte);
    }
    out
}
