//! Newline framing for the gateway-to-gateway serial link.
//!
//! Every envelope travels as one line of JSON text:
//!
//!   `<json bytes>\n`
//!
//! The receiving side accumulates bytes until `\n` or `\r`, discards empty
//! lines and yields whole lines. Long payloads are written in fixed-size pieces
//! with a short pacing pause between them so the peer UART buffer never
//! overruns; the pieces carry no separators and one newline terminates the lot.
use std::io::Write;
use std::time::Duration;

use bytes::{Buf, BytesMut};

/// Maximum accepted line length (sane upper bound to avoid runaway allocation)
const MAX_LINE_SIZE: usize = 64 * 1024; // 64 KB

/// Pacing parameters for outbound lines, typically sourced from Config
#[derive(Debug, Clone)]
pub struct LinePacing {
    /// Payloads longer than this are written in pieces.
    pub chunk_threshold: usize,
    /// Size of each piece.
    pub piece_size: usize,
    /// Pause between pieces (fixed, non-cancelable).
    pub pause: Duration,
}

impl Default for LinePacing {
    fn default() -> Self {
        Self {
            chunk_threshold: 1000,
            piece_size: 128,
            pause: Duration::from_millis(2),
        }
    }
}

/// Incremental newline framer. Feed arbitrary byte chunks, pull whole lines.
#[derive(Debug)]
pub struct LineFramer {
    buf: BytesMut,
    overflowed: bool,
}

impl Default for LineFramer {
    fn default() -> Self {
        Self::new()
    }
}

impl LineFramer {
    pub fn new() -> Self {
        Self {
            buf: BytesMut::with_capacity(4096),
            overflowed: false,
        }
    }

    pub fn push(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Number of buffered bytes not yet terminated by a newline.
    pub fn pending(&self) -> usize {
        self.buf.len()
    }

    /// Extract the next complete, non-empty line. An oversize line without a
    /// terminator is discarded up to the next terminator (resynchronization).
    pub fn next_line(&mut self) -> Option<String> {
        loop {
            let pos = match self.buf.iter().position(|b| *b == b'\n' || *b == b'\r') {
                Some(p) => p,
                None => {
                    if self.buf.len() > MAX_LINE_SIZE {
                        self.buf.clear();
                        self.overflowed = true;
                    }
                    return None;
                }
            };
            let raw = self.buf.split_to(pos);
            self.buf.advance(1);
            if self.overflowed {
                // tail end of a discarded line
                self.overflowed = false;
                continue;
            }
            if raw.is_empty() {
                continue;
            }
            let text = String::from_utf8_lossy(&raw).trim().to_string();
            if text.is_empty() {
                continue;
            }
            return Some(text);
        }
    }

    /// Drain every complete line currently buffered.
    pub fn drain_lines(&mut self) -> Vec<String> {
        let mut out = Vec::new();
        while let Some(line) = self.next_line() {
            out.push(line);
        }
        out
    }
}

/// Split a line into the byte pieces written to the wire. The final piece
/// always ends with the newline terminator.
pub fn frame_line(line: &str, pacing: &LinePacing) -> Vec<Vec<u8>> {
    let bytes = line.as_bytes();
    if bytes.len() <= pacing.chunk_threshold || pacing.piece_size == 0 {
        let mut single = Vec::with_capacity(bytes.len() + 1);
        single.extend_from_slice(bytes);
        single.push(b'\n');
        return vec![single];
    }
    let mut pieces: Vec<Vec<u8>> = bytes
        .chunks(pacing.piece_size)
        .map(|c| c.to_vec())
        .collect();
    pieces.push(vec![b'\n']);
    pieces
}

/// Write a framed line to a blocking writer, pausing between pieces and
/// flushing after each one.
pub fn write_framed<W: Write + ?Sized>(
    writer: &mut W,
    line: &str,
    pacing: &LinePacing,
) -> std::io::Result<()> {
    let pieces = frame_line(line, pacing);
    let multi = pieces.len() > 1;
    for piece in pieces {
        writer.write_all(&piece)?;
        writer.flush()?;
        if multi && !pacing.pause.is_zero() {
            std::thread::sleep(pacing.pause);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn framer_yields_lines_and_skips_empties() {
        let mut f = LineFramer::new();
        f.push(b"{\"type\":\"a\"}\r\n\n{\"ty");
        assert_eq!(f.next_line().as_deref(), Some("{\"type\":\"a\"}"));
        assert_eq!(f.next_line(), None);
        f.push(b"pe\":\"b\"}\n");
        assert_eq!(f.drain_lines(), vec!["{\"type\":\"b\"}".to_string()]);
        assert_eq!(f.pending(), 0);
    }

    #[test]
    fn long_payload_is_split_without_inner_newlines() {
        let pacing = LinePacing {
            pause: Duration::ZERO,
            ..LinePacing::default()
        };
        let line = "x".repeat(1001);
        let pieces = frame_line(&line, &pacing);
        assert_eq!(pieces.len(), 9); // 8 pieces of <=128 bytes + terminator
        assert!(pieces[..8].iter().all(|p| !p.contains(&b'\n')));
        assert_eq!(pieces.last().unwrap(), &vec![b'\n']);

        let mut out = Vec::new();
        write_framed(&mut out, &line, &pacing).unwrap();
        let mut f = LineFramer::new();
        f.push(&out);
        assert_eq!(f.drain_lines(), vec![line]);
    }

    #[test]
    fn short_payload_is_one_piece() {
        let pieces = frame_line("{}", &LinePacing::default());
        assert_eq!(pieces, vec![b"{}\n".to_vec()]);
    }

    #[test]
    fn oversize_line_is_discarded() {
        let mut f = LineFramer::new();
        f.push(&vec![b'a'; MAX_LINE_SIZE + 10]);
        assert_eq!(f.next_line(), None);
        f.push(b"tail\n{\"ok\":1}\n");
        assert_eq!(f.drain_lines(), vec!["{\"ok\":1}".to_string()]);
    }
}
