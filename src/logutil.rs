//! Logging helpers for wire payloads so every log record stays single-line.
//! Escapes control characters that otherwise break log readability.

/// Preview length used for raw envelopes in log lines.
pub const PAYLOAD_PREVIEW: usize = 160;

/// Escape a string for single-line logging:
/// - `\n` => `\\n`
/// - `\r` => `\\r`
/// - `\t` => `\\t`
/// - backslash => `\\\\`
///   Truncates very long strings (over 300 chars) with an ellipsis.
pub fn escape_log(s: &str) -> String {
    escape_preview(s, 300)
}

/// Like [`escape_log`] with a caller-chosen preview length. OTA chunk lines
/// are long base64 blobs; callers log them with [`PAYLOAD_PREVIEW`].
pub fn escape_preview(s: &str, max_preview: usize) -> String {
    let mut out = String::with_capacity(s.len().min(max_preview) + 8);
    for (count, ch) in s.chars().enumerate() {
        if count >= max_preview {
            out.push('…');
            break;
        }
        match ch {
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c if c.is_control() => {
                use std::fmt::Write;
                let _ = write!(&mut out, "\\x{:02X}", c as u32);
            }
            c => out.push(c),
        }
    }
    out
}
