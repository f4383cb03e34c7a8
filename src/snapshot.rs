//! Frozen views of a document.
//!
//! A snapshot captures the piece sequence at one instant. Pieces are
//! immutable and buffers only ever grow, so each piece is resolved to its
//! backing block and byte range at creation time and nothing here touches
//! the live tree again. The `Arc` on each block keeps the captured bytes
//! alive and in place no matter what the writer does afterwards.

use std::ops::Range;
use std::sync::Arc;

/// One captured piece, resolved to its storage.
#[derive(Debug, Clone)]
pub(crate) struct SnapshotChunk {
    block: Arc<Vec<u8>>,
    range: Range<usize>,
}

impl SnapshotChunk {
    pub(crate) fn new(block: Arc<Vec<u8>>, range: Range<usize>) -> Self {
        SnapshotChunk { block, range }
    }

    fn bytes(&self) -> &[u8] {
        &self.block[self.range.clone()]
    }
}

/// A stable view of the document as it was when the snapshot was taken.
#[derive(Debug, Clone)]
pub struct Snapshot {
    chunks: Vec<SnapshotChunk>,
    bom: Vec<u8>,
    index: usize,
}

impl Snapshot {
    pub(crate) fn new(chunks: Vec<SnapshotChunk>, bom: Vec<u8>) -> Self {
        Snapshot {
            chunks,
            bom,
            index: 0,
        }
    }

    /// Next chunk of the captured document. The first chunk carries the
    /// byte-order mark, if one was requested; after the last chunk every
    /// call returns an empty vector.
    pub fn read(&mut self) -> Vec<u8> {
        if self.chunks.is_empty() {
            if self.index == 0 {
                self.index += 1;
                return self.bom.clone();
            }
            return Vec::new();
        }

        if self.index > self.chunks.len() - 1 {
            return Vec::new();
        }

        let mut out = if self.index == 0 {
            self.bom.clone()
        } else {
            Vec::new()
        };
        out.extend_from_slice(self.chunks[self.index].bytes());
        self.index += 1;
        out
    }
}
