//! A streaming reader that makes raw event XML safe to hand to a strict XML parser.
//!
//! Providers occasionally log text containing control characters (for example a stray `ESC`)
//! which are illegal in XML 1.0. [`ControlSafeReader`] rewrites every non-whitespace control
//! code point as the literal text `\uNNNN` and every undecodable byte sequence as `�`.
//! Everything else is copied through unchanged.

use std::io::{self, Read};

const INPUT_BUFFER_SIZE: usize = 4096;
const REPLACEMENT_ESCAPE: &[u8] = b"\\ufffd";

/// Wraps a byte source and escapes control characters while copying.
///
/// A code point whose bytes are split across two reads of the inner source is held back until
/// the rest of it arrives. Reading never fails except when the inner source does.
pub struct ControlSafeReader<R> {
    inner: R,
    inbuf: Box<[u8]>,
    start: usize,
    end: usize,
    eof: bool,
    // Encoded output that did not fit into the caller's buffer.
    pending: Vec<u8>,
    pending_pos: usize,
}

enum Decoded {
    Char(char, usize),
    Invalid(usize),
    Incomplete,
}

fn decode_one(bytes: &[u8]) -> Decoded {
    let need = match bytes[0] {
        0x00..=0x7F => 1,
        0xC2..=0xDF => 2,
        0xE0..=0xEF => 3,
        0xF0..=0xF4 => 4,
        _ => return Decoded::Invalid(1),
    };

    let candidate = &bytes[..need.min(bytes.len())];
    match std::str::from_utf8(candidate) {
        Ok(s) => match s.chars().next() {
            Some(c) => Decoded::Char(c, need),
            None => Decoded::Invalid(1),
        },
        Err(e) => match e.error_len() {
            Some(n) => Decoded::Invalid(n.max(1)),
            None => Decoded::Incomplete,
        },
    }
}

impl<R: Read> ControlSafeReader<R> {
    pub fn new(inner: R) -> Self {
        ControlSafeReader {
            inner,
            inbuf: vec![0; INPUT_BUFFER_SIZE].into_boxed_slice(),
            start: 0,
            end: 0,
            eof: false,
            pending: Vec::with_capacity(8),
            pending_pos: 0,
        }
    }

    pub fn into_inner(self) -> R {
        self.inner
    }

    fn emit(&mut self, bytes: &[u8], out: &mut [u8], written: &mut usize) {
        let room = out.len() - *written;
        let n = room.min(bytes.len());
        out[*written..*written + n].copy_from_slice(&bytes[..n]);
        *written += n;
        if n < bytes.len() {
            self.pending.extend_from_slice(&bytes[n..]);
        }
    }

    fn emit_char(&mut self, c: char, out: &mut [u8], written: &mut usize) {
        if c.is_control() && !c.is_whitespace() {
            let escaped = format!("\\u{:04x}", c as u32);
            self.emit(escaped.as_bytes(), out, written);
        } else {
            let mut utf8 = [0u8; 4];
            let encoded = c.encode_utf8(&mut utf8);
            self.emit(encoded.as_bytes(), out, written);
        }
    }

    fn transcode_into(&mut self, out: &mut [u8]) -> usize {
        let mut written = 0;
        while written < out.len() && self.pending.is_empty() && self.start < self.end {
            match decode_one(&self.inbuf[self.start..self.end]) {
                Decoded::Char(c, n) => {
                    self.start += n;
                    self.emit_char(c, out, &mut written);
                }
                Decoded::Invalid(n) => {
                    self.start += n;
                    self.emit(REPLACEMENT_ESCAPE, out, &mut written);
                }
                Decoded::Incomplete if self.eof => {
                    // The source ended in the middle of a code point.
                    self.start = self.end;
                    self.emit(REPLACEMENT_ESCAPE, out, &mut written);
                }
                Decoded::Incomplete => break,
            }
        }
        written
    }

    fn fill(&mut self) -> io::Result<()> {
        if self.start > 0 {
            self.inbuf.copy_within(self.start..self.end, 0);
            self.end -= self.start;
            self.start = 0;
        }
        let n = self.inner.read(&mut self.inbuf[self.end..])?;
        if n == 0 {
            self.eof = true;
        }
        self.end += n;
        Ok(())
    }
}

impl<R: Read> Read for ControlSafeReader<R> {
    fn read(&mut self, out: &mut [u8]) -> io::Result<usize> {
        if out.is_empty() {
            return Ok(0);
        }

        loop {
            if self.pending_pos < self.pending.len() {
                let tail = &self.pending[self.pending_pos..];
                let n = tail.len().min(out.len());
                out[..n].copy_from_slice(&tail[..n]);
                self.pending_pos += n;
                return Ok(n);
            }
            self.pending.clear();
            self.pending_pos = 0;

            let written = self.transcode_into(out);
            if written > 0 {
                return Ok(written);
            }
            if self.eof && self.start == self.end {
                return Ok(0);
            }
            self.fill()?;
        }
    }
}
