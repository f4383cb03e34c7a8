//! Ergonomic facade over the core.
//!
//! `TextBuffer` hides the builder-and-factory ceremony: construct it
//! empty or from an initial string and call the same operations the core
//! exposes. Every method delegates one-to-one to [`PieceTree`].

use anyhow::Result;

use crate::buffer::LineEnding;
use crate::builder::TextBufferBuilder;
use crate::piece_tree::{PieceTree, Position, Range};
use crate::snapshot::Snapshot;

/// A mutable text document with a plain-method surface.
#[derive(Debug, Clone)]
pub struct TextBuffer {
    tree: PieceTree,
}

impl TextBuffer {
    /// An empty buffer using `default_eol`.
    pub fn new(default_eol: LineEnding) -> Self {
        let builder = TextBufferBuilder::new();
        TextBuffer {
            tree: builder.finish(true).create(default_eol),
        }
    }

    /// A buffer holding `initial_content`, terminators normalized to the
    /// detected or default EOL.
    pub fn from_str(initial_content: &str, default_eol: LineEnding) -> Self {
        Self::from_bytes(initial_content.as_bytes(), default_eol)
    }

    /// Byte-slice variant of [`from_str`](Self::from_str).
    pub fn from_bytes(initial_content: &[u8], default_eol: LineEnding) -> Self {
        let mut builder = TextBufferBuilder::new();
        builder.accept_chunk(initial_content);
        TextBuffer {
            tree: builder.finish(true).create(default_eol),
        }
    }

    pub fn len(&self) -> usize {
        self.tree.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tree.is_empty()
    }

    pub fn line_count(&self) -> usize {
        self.tree.line_count()
    }

    pub fn eol(&self) -> LineEnding {
        self.tree.eol()
    }

    pub fn set_eol(&mut self, eol: LineEnding) {
        self.tree.set_eol(eol)
    }

    pub fn value(&self) -> Vec<u8> {
        self.tree.value()
    }

    pub fn value_in_range(
        &self,
        range: Range,
        requested_eol: Option<LineEnding>,
    ) -> Result<Vec<u8>> {
        self.tree.value_in_range(range, requested_eol)
    }

    pub fn lines_content(&self) -> Vec<Vec<u8>> {
        self.tree.lines_content()
    }

    pub fn line_content(&self, line_number: usize) -> Result<Vec<u8>> {
        self.tree.line_content(line_number)
    }

    pub fn line_length(&self, line_number: usize) -> Result<usize> {
        self.tree.line_length(line_number)
    }

    pub fn line_char_code(&self, line_number: usize, index: usize) -> Result<u8> {
        self.tree.line_char_code(line_number, index)
    }

    pub fn position_at(&self, offset: usize) -> Position {
        self.tree.position_at(offset)
    }

    pub fn offset_at(&self, line_number: usize, column: usize) -> usize {
        self.tree.offset_at(line_number, column)
    }

    pub fn insert(&mut self, offset: usize, text: &str) {
        self.tree.insert(offset, text.as_bytes(), false)
    }

    /// Insert with the caller asserting `text`'s terminators already
    /// match the active EOL.
    pub fn insert_normalized(&mut self, offset: usize, text: &str) {
        self.tree.insert(offset, text.as_bytes(), true)
    }

    pub fn insert_bytes(&mut self, offset: usize, bytes: &[u8]) {
        self.tree.insert(offset, bytes, false)
    }

    pub fn delete(&mut self, offset: usize, count: usize) {
        self.tree.delete(offset, count)
    }

    pub fn create_snapshot(&self, bom: &[u8]) -> Snapshot {
        self.tree.create_snapshot(bom)
    }

    /// Content-wise comparison with another buffer.
    pub fn equal(&self, other: &TextBuffer) -> bool {
        self.tree.equal(&other.tree)
    }

    /// The underlying core, for hosts that need the full surface.
    pub fn piece_tree(&self) -> &PieceTree {
        &self.tree
    }
}

impl Default for TextBuffer {
    fn default() -> Self {
        Self::new(LineEnding::default())
    }
}
