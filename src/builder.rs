//! Chunked construction of a document.
//!
//! Hosts stream input in as chunks of arbitrary size; the builder counts
//! terminator flavors as it goes, strips a leading UTF-8 byte-order mark,
//! and guards the two things a chunk boundary can break: a `\r\n` pair
//! and a multi-byte UTF-8 sequence. A trailing `\r` (or incomplete UTF-8
//! suffix) is held back and prepended to the next chunk, so no buffer is
//! ever published with half a terminator or half a code point at its
//! edge.

use crate::buffer::{normalize_eol_bytes, LineEnding, StringBuffer};
use crate::line_starts::{create_line_starts, create_line_starts_fast};
use crate::piece_tree::PieceTree;

/// The UTF-8 byte-order mark.
pub const UTF8_BOM: &[u8] = &[0xEF, 0xBB, 0xBF];

/// Length of the shortest suffix of `data` that is an unfinished UTF-8
/// sequence, or 0 if `data` ends on a code-point boundary.
fn incomplete_utf8_suffix(data: &[u8]) -> usize {
    let scan = data.len().min(3);
    for back in 1..=scan {
        let byte = data[data.len() - back];
        if (byte & 0xC0) != 0x80 {
            // Found the lead byte; is the sequence it opens complete?
            let expected = match byte {
                b if b & 0x80 == 0x00 => 1,
                b if b & 0xE0 == 0xC0 => 2,
                b if b & 0xF0 == 0xE0 => 3,
                b if b & 0xF8 == 0xF0 => 4,
                _ => return 0, // stray continuation run, nothing to hold
            };
            return if expected > back { back } else { 0 };
        }
    }
    0
}

/// Accumulates input chunks and terminator statistics.
#[derive(Debug, Default)]
pub struct TextBufferBuilder {
    chunks: Vec<StringBuffer>,
    bom: Vec<u8>,
    held: Vec<u8>,
    cr: usize,
    lf: usize,
    crlf: usize,
}

impl TextBufferBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed the next chunk of input.
    pub fn accept_chunk(&mut self, chunk: &[u8]) {
        if chunk.is_empty() {
            return;
        }

        let mut chunk = chunk;
        if self.chunks.is_empty() && self.held.is_empty() && chunk.starts_with(UTF8_BOM) {
            self.bom = UTF8_BOM.to_vec();
            chunk = &chunk[UTF8_BOM.len()..];
            if chunk.is_empty() {
                return;
            }
        }

        // Hold back whatever the next chunk might need to complete.
        let hold = if chunk[chunk.len() - 1] == b'\r' {
            1
        } else {
            incomplete_utf8_suffix(chunk)
        };
        let (body, tail) = chunk.split_at(chunk.len() - hold);
        self.accept_chunk_with_held(body);
        self.held.extend_from_slice(tail);
    }

    fn accept_chunk_with_held(&mut self, chunk: &[u8]) {
        if self.held.is_empty() {
            self.accept_whole_chunk(chunk);
        } else if !chunk.is_empty() {
            let mut combined = std::mem::take(&mut self.held);
            combined.extend_from_slice(chunk);
            self.accept_whole_chunk(&combined);
        }
    }

    fn accept_whole_chunk(&mut self, chunk: &[u8]) {
        if chunk.is_empty() {
            return;
        }
        let scan = create_line_starts(chunk);
        self.cr += scan.cr;
        self.lf += scan.lf;
        self.crlf += scan.crlf;
        self.chunks
            .push(StringBuffer::from_parts(chunk.to_vec(), scan.line_starts));
    }

    /// Seal the builder. Held-back bytes are flushed into the last chunk.
    pub fn finish(mut self, normalize_eol: bool) -> TextBufferFactory {
        if !self.held.is_empty() {
            let held = std::mem::take(&mut self.held);
            let held_cr = held.last() == Some(&b'\r');
            match self.chunks.pop() {
                Some(last) => {
                    let mut bytes = last.bytes().to_vec();
                    bytes.extend_from_slice(&held);
                    let line_starts = create_line_starts_fast(&bytes);
                    self.chunks.push(StringBuffer::from_parts(bytes, line_starts));
                }
                None => {
                    let line_starts = create_line_starts_fast(&held);
                    self.chunks.push(StringBuffer::from_parts(held, line_starts));
                }
            }
            if held_cr {
                self.cr += 1;
            }
        }

        TextBufferFactory {
            chunks: self.chunks,
            bom: self.bom,
            cr: self.cr,
            lf: self.lf,
            crlf: self.crlf,
            normalize_eol,
        }
    }
}

/// Builds [`PieceTree`]s from the accumulated chunks.
#[derive(Debug)]
pub struct TextBufferFactory {
    chunks: Vec<StringBuffer>,
    bom: Vec<u8>,
    cr: usize,
    lf: usize,
    crlf: usize,
    normalize_eol: bool,
}

impl TextBufferFactory {
    /// Pick the document EOL from the tallied terminators: a CR-majority
    /// yields `\r\n`, any other terminator mix yields `\n`, and a
    /// terminator-free document takes the caller's default.
    pub fn eol(&self, default_eol: LineEnding) -> LineEnding {
        let total = self.cr + self.lf + self.crlf;
        if total == 0 {
            return default_eol;
        }
        if self.cr + self.crlf > total / 2 {
            LineEnding::Crlf
        } else {
            LineEnding::Lf
        }
    }

    /// The stripped byte-order mark, empty if none was seen. Hosts hand
    /// it back to `create_snapshot` when serializing.
    pub fn bom(&self) -> &[u8] {
        &self.bom
    }

    /// First line of the input, capped at `limit` bytes.
    pub fn first_line_text(&self, limit: usize) -> Vec<u8> {
        let Some(first) = self.chunks.first() else {
            return Vec::new();
        };
        let bytes = first.bytes();
        let slice = &bytes[..limit.min(bytes.len())];
        let end = slice
            .iter()
            .position(|&b| b == b'\r' || b == b'\n')
            .unwrap_or(slice.len());
        slice[..end].to_vec()
    }

    /// Build the tree. With normalization on and a mixed input, every
    /// chunk is rewritten to the chosen EOL first.
    pub fn create(self, default_eol: LineEnding) -> PieceTree {
        let eol = self.eol(default_eol);
        let mut chunks = self.chunks;

        if self.normalize_eol
            && ((eol == LineEnding::Crlf && (self.cr > 0 || self.lf > 0))
                || (eol == LineEnding::Lf && (self.cr > 0 || self.crlf > 0)))
        {
            for chunk in chunks.iter_mut() {
                let rewritten = normalize_eol_bytes(chunk.bytes(), eol);
                let line_starts = create_line_starts_fast(&rewritten);
                *chunk = StringBuffer::from_parts(rewritten, line_starts);
            }
        }

        PieceTree::new(chunks, eol, self.normalize_eol)
    }
}
