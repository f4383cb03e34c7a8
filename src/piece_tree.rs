//! The piece tree core.
//!
//! A document is the in-order concatenation of pieces, each an immutable
//! slice of one backing buffer. Edits never rewrite published bytes:
//! insertions append to the change buffer (or mint whole new buffers for
//! oversized payloads) and splice fresh pieces into the tree, deletions
//! shrink or drop pieces. The tree's augmented sums give O(log n)
//! offset-to-position and line lookups; a tiny search cache and a
//! last-visited-line memo shave repeated descents off the common
//! type-and-read loops.
//!
//! Mixed `\r`/`\n`/`\r\n` terminators are tolerated throughout. The
//! delicate part is keeping a `\r` and a following `\n` inside one piece
//! (or a dedicated two-byte piece) across every structural change, so
//! that line counting never sees the pair as two terminators. Each edit
//! path below carries its repair step for that.

use std::cell::RefCell;

use anyhow::Result;

use crate::buffer::{normalize_eol_bytes, BufferCursor, LineEnding, StringBuffer};
use crate::cache::{CacheEntry, SearchCache};
use crate::error::TextBufferError;
use crate::line_starts::create_line_starts_fast;
use crate::piece::Piece;
use crate::snapshot::{Snapshot, SnapshotChunk};
use crate::tree::{NodeRef, RbTree, SENTINEL};

/// Insertions at or above this size are cut into dedicated buffers
/// instead of growing the change buffer.
pub const AVERAGE_BUFFER_SIZE: usize = 65535;

/// Entries kept by the advisory search cache.
const SEARCH_CACHE_LIMIT: usize = 1;

/// A 1-based (line, column) position on the public surface. Columns are
/// byte offsets within the line, plus one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Position {
    pub line: usize,
    pub column: usize,
}

impl Position {
    pub fn new(line: usize, column: usize) -> Self {
        Position { line, column }
    }
}

/// A span between two positions, end exclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Range {
    pub start: Position,
    pub end: Position,
}

impl Range {
    pub fn new(start_line: usize, start_column: usize, end_line: usize, end_column: usize) -> Self {
        Range {
            start: Position::new(start_line, start_column),
            end: Position::new(end_line, end_column),
        }
    }
}

/// A resolved location: the node covering an offset, the offset's
/// remainder within the node's piece, and the node's document offset.
#[derive(Debug, Clone, Copy)]
struct NodePosition {
    node: NodeRef,
    remainder: usize,
    node_start_offset: usize,
}

fn starts_with_lf(value: &[u8]) -> bool {
    value.first() == Some(&b'\n')
}

fn ends_with_cr(value: &[u8]) -> bool {
    value.last() == Some(&b'\r')
}

/// Length of the trailing bytes that would split a UTF-8 sequence if the
/// text were cut right after them.
fn backoff_utf8(text: &[u8], mut split: usize) -> usize {
    while split > 0 && split < text.len() && (text[split] & 0xC0) == 0x80 {
        split -= 1;
    }
    split
}

/// The mutable text document.
#[derive(Debug, Clone)]
pub struct PieceTree {
    tree: RbTree,
    buffers: Vec<StringBuffer>,
    length: usize,
    line_cnt: usize,
    eol: LineEnding,
    eol_normalized: bool,
    last_change_buffer_pos: BufferCursor,
    search_cache: RefCell<SearchCache>,
    last_visited_line: RefCell<(usize, Vec<u8>)>,
}

impl PieceTree {
    /// Build a tree over `chunks`. `chunks` become buffers 1 and up; the
    /// change buffer is planted at index 0. `eol_normalized` asserts that
    /// every terminator in the chunks already matches `eol`.
    pub fn new(chunks: Vec<StringBuffer>, eol: LineEnding, eol_normalized: bool) -> Self {
        let mut this = PieceTree {
            tree: RbTree::new(),
            buffers: vec![StringBuffer::change_buffer()],
            length: 0,
            line_cnt: 1,
            eol,
            eol_normalized,
            last_change_buffer_pos: BufferCursor::default(),
            search_cache: RefCell::new(SearchCache::new(SEARCH_CACHE_LIMIT)),
            last_visited_line: RefCell::new((0, Vec::new())),
        };
        this.init(chunks, eol, eol_normalized);
        this
    }

    fn init(&mut self, chunks: Vec<StringBuffer>, eol: LineEnding, eol_normalized: bool) {
        let chunk_count = chunks.len();
        self.buffers = vec![StringBuffer::change_buffer()];
        self.last_change_buffer_pos = BufferCursor::default();
        self.tree = RbTree::new();
        self.line_cnt = 1;
        self.length = 0;
        self.eol = eol;
        self.eol_normalized = eol_normalized;

        let mut last_node = SENTINEL;
        for chunk in chunks {
            if chunk.is_empty() {
                continue;
            }
            let last_line_start = chunk.line_starts[chunk.line_starts.len() - 1];
            let piece = Piece::new(
                self.buffers.len(),
                BufferCursor::new(0, 0),
                BufferCursor::new(chunk.line_starts.len() - 1, chunk.len() - last_line_start),
                chunk.line_starts.len() - 1,
                chunk.len(),
            );
            self.buffers.push(chunk);
            last_node = self.tree.insert_right(last_node, piece);
        }

        self.search_cache.borrow_mut().flush();
        *self.last_visited_line.borrow_mut() = (0, Vec::new());
        self.compute_buffer_metadata();
        tracing::debug!(
            chunks = chunk_count,
            bytes = self.length,
            lines = self.line_cnt,
            eol = eol.display_name(),
            normalized = eol_normalized,
            "piece tree built"
        );
    }

    // ------------------------------------------------------------------
    // Totals and EOL state
    // ------------------------------------------------------------------

    /// Total document length in bytes.
    pub fn len(&self) -> usize {
        self.length
    }

    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    /// Number of lines; an empty document has one.
    pub fn line_count(&self) -> usize {
        self.line_cnt
    }

    pub fn eol(&self) -> LineEnding {
        self.eol
    }

    /// Rewrite every terminator in the document to `new_eol` and rebuild
    /// the tree from the normalized chunks.
    pub fn set_eol(&mut self, new_eol: LineEnding) {
        self.eol = new_eol;
        self.normalize_eol(new_eol);
    }

    fn normalize_eol(&mut self, eol: LineEnding) {
        let min = AVERAGE_BUFFER_SIZE - AVERAGE_BUFFER_SIZE / 3;
        let max = min * 2;

        let mut temp: Vec<u8> = Vec::new();
        let mut chunks: Vec<StringBuffer> = Vec::new();

        let mut x = if self.tree.root == SENTINEL {
            SENTINEL
        } else {
            self.tree.leftest(self.tree.root)
        };
        while x != SENTINEL {
            let content = self.node_content(x);
            if temp.len() <= min || temp.len() + content.len() < max {
                temp.extend_from_slice(content);
            } else {
                chunks.push(StringBuffer::new(normalize_eol_bytes(&temp, eol)));
                temp = content.to_vec();
            }
            x = self.tree.next(x);
        }
        if !temp.is_empty() {
            chunks.push(StringBuffer::new(normalize_eol_bytes(&temp, eol)));
        }

        tracing::debug!(
            chunks = chunks.len(),
            eol = eol.display_name(),
            "rebuilding piece tree with normalized terminators"
        );
        self.init(chunks, eol, true);
    }

    fn should_check_crlf(&self) -> bool {
        !(self.eol_normalized && self.eol == LineEnding::Lf)
    }

    fn compute_buffer_metadata(&mut self) {
        let mut x = self.tree.root;
        let mut lf_cnt = 1;
        let mut len = 0;
        while x != SENTINEL {
            lf_cnt += self.tree[x].lf_left + self.tree[x].piece.line_feed_cnt;
            len += self.tree[x].size_left + self.tree[x].piece.length;
            x = self.tree[x].right;
        }
        self.line_cnt = lf_cnt;
        self.length = len;
        self.search_cache.borrow_mut().validate(len);
    }

    // ------------------------------------------------------------------
    // Buffer-local geometry
    // ------------------------------------------------------------------

    fn offset_in_buffer(&self, buffer_index: usize, cursor: BufferCursor) -> usize {
        self.buffers[buffer_index].offset_of(cursor)
    }

    /// Map a remainder within `node`'s piece to a cursor in its buffer,
    /// by binary search over the buffer's line starts restricted to the
    /// piece's line span.
    fn position_in_buffer(&self, node: NodeRef, remainder: usize) -> BufferCursor {
        let piece = self.tree[node].piece;
        let line_starts = &self.buffers[piece.buffer_index].line_starts;

        let start_offset = line_starts[piece.start.line] + piece.start.column;
        let offset = start_offset + remainder;

        let mut low = piece.start.line;
        let mut high = piece.end.line;
        let mut mid = low;
        let mut mid_start = line_starts[mid];

        while low <= high {
            mid = low + (high - low) / 2;
            mid_start = line_starts[mid];
            if mid == high {
                break;
            }
            let mid_stop = line_starts[mid + 1];
            if offset < mid_start {
                high = mid - 1;
            } else if offset >= mid_stop {
                low = mid + 1;
            } else {
                break;
            }
        }

        BufferCursor::new(mid, offset - mid_start)
    }

    /// Terminators wholly contained in `[start, end)` of a buffer. An
    /// `end` cursor sitting between a `\r` and its `\n` counts the pair,
    /// since the piece boundary does not split the terminator logically.
    fn get_line_feed_cnt(
        &self,
        buffer_index: usize,
        start: BufferCursor,
        end: BufferCursor,
    ) -> usize {
        if end.column == 0 {
            return end.line - start.line;
        }
        let line_starts = &self.buffers[buffer_index].line_starts;
        if end.line == line_starts.len() - 1 {
            // No terminator after `end` at all.
            return end.line - start.line;
        }
        let next_line_start = line_starts[end.line + 1];
        let end_offset = line_starts[end.line] + end.column;
        if next_line_start > end_offset + 1 {
            return end.line - start.line;
        }
        // The byte at `end` is a \n; whether it pairs with a preceding \r
        // decides if the cursor sits inside a terminator.
        let previous_char_offset = end_offset - 1;
        let buffer = self.buffers[buffer_index].bytes();
        if buffer[previous_char_offset] == b'\r' {
            end.line - start.line + 1
        } else {
            end.line - start.line
        }
    }

    /// Byte offset, within `node`'s piece, of the first byte after the
    /// `index`-th terminator inside the piece. Negative indexes yield 0,
    /// indexes past the piece's terminators yield the piece length.
    fn get_accumulated_value(&self, node: NodeRef, index: isize) -> usize {
        if index < 0 {
            return 0;
        }
        let piece = self.tree[node].piece;
        let line_starts = &self.buffers[piece.buffer_index].line_starts;
        let expected_line_start_index = piece.start.line + index as usize + 1;
        if expected_line_start_index > piece.end.line {
            line_starts[piece.end.line] + piece.end.column
                - line_starts[piece.start.line]
                - piece.start.column
        } else {
            line_starts[expected_line_start_index]
                - line_starts[piece.start.line]
                - piece.start.column
        }
    }

    /// Within-piece terminator index and line-local remainder for an
    /// offset `accumulated_value` bytes into `node`'s piece.
    fn get_index_of(&self, node: NodeRef, accumulated_value: usize) -> (usize, usize) {
        let piece = self.tree[node].piece;
        let pos = self.position_in_buffer(node, accumulated_value);
        let line_cnt = pos.line - piece.start.line;

        let buffer = &self.buffers[piece.buffer_index];
        if buffer.offset_of(piece.end) - buffer.offset_of(piece.start) == accumulated_value {
            // At the very end of the piece a cursor can sit between a \r
            // and its \n; the terminator count is authoritative there.
            let real_line_cnt = self.get_line_feed_cnt(piece.buffer_index, piece.start, pos);
            if real_line_cnt != line_cnt {
                return (real_line_cnt, 0);
            }
        }
        (line_cnt, pos.column)
    }

    fn node_content(&self, node: NodeRef) -> &[u8] {
        let piece = &self.tree[node].piece;
        let buffer = &self.buffers[piece.buffer_index];
        let start = buffer.offset_of(piece.start);
        let end = buffer.offset_of(piece.end);
        &buffer.bytes()[start..end]
    }

    fn node_char_code_at(&self, node: NodeRef, offset: usize) -> Option<u8> {
        if node == SENTINEL || self.tree[node].piece.line_feed_cnt < 1 {
            return None;
        }
        let piece = self.tree[node].piece;
        let buffer = &self.buffers[piece.buffer_index];
        buffer.bytes().get(buffer.offset_of(piece.start) + offset).copied()
    }

    fn node_starts_with_lf(&self, node: NodeRef) -> bool {
        if node == SENTINEL || self.tree[node].piece.line_feed_cnt == 0 {
            return false;
        }
        let piece = self.tree[node].piece;
        let buffer = &self.buffers[piece.buffer_index];
        let line = piece.start.line;
        let start_offset = buffer.line_starts[line] + piece.start.column;
        if line == buffer.line_starts.len() - 1 {
            return false;
        }
        let next_line_offset = buffer.line_starts[line + 1];
        if next_line_offset > start_offset + 1 {
            return false;
        }
        buffer.bytes()[start_offset] == b'\n'
    }

    fn node_ends_with_cr(&self, node: NodeRef) -> bool {
        if node == SENTINEL || self.tree[node].piece.line_feed_cnt == 0 {
            return false;
        }
        self.node_char_code_at(node, self.tree[node].piece.length - 1) == Some(b'\r')
    }

    // ------------------------------------------------------------------
    // Tree descents
    // ------------------------------------------------------------------

    fn node_at(&self, offset: usize) -> NodePosition {
        let mut offset = offset.min(self.length);
        let mut x = self.tree.root;

        let cache_hit = self.search_cache.borrow().get(offset, &self.tree);
        if let Some(entry) = cache_hit {
            return NodePosition {
                node: entry.node,
                remainder: offset - entry.node_start_offset,
                node_start_offset: entry.node_start_offset,
            };
        }

        let mut node_start_offset = 0;
        while x != SENTINEL {
            let n = &self.tree[x];
            if n.size_left > offset {
                x = n.left;
            } else if n.size_left + n.piece.length >= offset {
                node_start_offset += n.size_left;
                let ret = NodePosition {
                    node: x,
                    remainder: offset - n.size_left,
                    node_start_offset,
                };
                self.search_cache.borrow_mut().set(CacheEntry {
                    node: x,
                    node_start_offset,
                    node_start_line_number: None,
                });
                return ret;
            } else {
                offset -= n.size_left + n.piece.length;
                node_start_offset += n.size_left + n.piece.length;
                x = n.right;
            }
        }

        NodePosition {
            node: SENTINEL,
            remainder: 0,
            node_start_offset: 0,
        }
    }

    fn node_at_position(&self, line_number: usize, column: usize) -> NodePosition {
        let mut line_number = line_number.clamp(1, self.line_cnt.max(1));
        let mut column = column.max(1);
        let mut x = self.tree.root;
        let mut node_start_offset = 0;

        while x != SENTINEL {
            let n = &self.tree[x];
            if n.left != SENTINEL && n.lf_left >= line_number - 1 {
                x = n.left;
            } else if n.lf_left + n.piece.line_feed_cnt > line_number - 1 {
                let prev_accumulated = self
                    .get_accumulated_value(x, line_number as isize - n.lf_left as isize - 2);
                let accumulated =
                    self.get_accumulated_value(x, line_number as isize - n.lf_left as isize - 1);
                node_start_offset += n.size_left;
                return NodePosition {
                    node: x,
                    remainder: (prev_accumulated + column - 1).min(accumulated),
                    node_start_offset,
                };
            } else if n.lf_left + n.piece.line_feed_cnt == line_number - 1 {
                let prev_accumulated = self
                    .get_accumulated_value(x, line_number as isize - n.lf_left as isize - 2);
                node_start_offset += n.size_left;
                if prev_accumulated + column - 1 <= n.piece.length {
                    return NodePosition {
                        node: x,
                        remainder: prev_accumulated + column - 1,
                        node_start_offset,
                    };
                }
                // The line continues into following nodes.
                column -= n.piece.length - prev_accumulated;
                break;
            } else {
                line_number -= n.lf_left + n.piece.line_feed_cnt;
                node_start_offset += n.size_left + n.piece.length;
                x = n.right;
            }
        }

        let mut x = self.tree.next(x);
        while x != SENTINEL {
            let piece = self.tree[x].piece;
            if piece.line_feed_cnt > 0 {
                let accumulated = self.get_accumulated_value(x, 0);
                let node_start_offset = self.offset_of_node(x);
                return NodePosition {
                    node: x,
                    remainder: (column - 1).min(accumulated),
                    node_start_offset,
                };
            }
            if piece.length >= column - 1 {
                let node_start_offset = self.offset_of_node(x);
                return NodePosition {
                    node: x,
                    remainder: column - 1,
                    node_start_offset,
                };
            }
            column -= piece.length;
            x = self.tree.next(x);
        }

        self.node_at(self.length)
    }

    fn offset_of_node(&self, node: NodeRef) -> usize {
        if node == SENTINEL {
            return 0;
        }
        let mut pos = self.tree[node].size_left;
        let mut node = node;
        while node != self.tree.root {
            let parent = self.tree[node].parent;
            if self.tree[parent].right == node {
                pos += self.tree[parent].size_left + self.tree[parent].piece.length;
            }
            node = parent;
        }
        pos
    }

    // ------------------------------------------------------------------
    // Position queries
    // ------------------------------------------------------------------

    /// 1-based (line, column) of a byte offset. Offsets past the end
    /// clamp to the end.
    pub fn position_at(&self, offset: usize) -> Position {
        let original_offset = offset.min(self.length);
        let mut offset = original_offset;
        let mut x = self.tree.root;
        let mut lf_cnt = 0;

        while x != SENTINEL {
            let n = &self.tree[x];
            if n.size_left != 0 && n.size_left >= offset {
                x = n.left;
            } else if n.size_left + n.piece.length >= offset {
                let (index, remainder) = self.get_index_of(x, offset - n.size_left);
                lf_cnt += n.lf_left + index;
                if index == 0 {
                    // The line began in an earlier piece; resolve its
                    // start to get the column.
                    let line_start_offset = self.offset_at(lf_cnt + 1, 1);
                    let column = original_offset - line_start_offset;
                    return Position::new(lf_cnt + 1, column + 1);
                }
                return Position::new(lf_cnt + 1, remainder + 1);
            } else {
                offset -= n.size_left + n.piece.length;
                lf_cnt += n.lf_left + n.piece.line_feed_cnt;
                if n.right == SENTINEL {
                    let line_start_offset = self.offset_at(lf_cnt + 1, 1);
                    let column = original_offset - offset - line_start_offset;
                    return Position::new(lf_cnt + 1, column + 1);
                }
                x = n.right;
            }
        }

        Position::new(1, 1)
    }

    /// Byte offset of a 1-based (line, column).
    pub fn offset_at(&self, line_number: usize, column: usize) -> usize {
        let mut line_number = line_number.max(1);
        let column = column.max(1);
        let mut left_len = 0;
        let mut x = self.tree.root;

        while x != SENTINEL {
            let n = &self.tree[x];
            if n.left != SENTINEL && n.lf_left + 1 >= line_number {
                x = n.left;
            } else if n.lf_left + n.piece.line_feed_cnt + 1 >= line_number {
                left_len += n.size_left;
                let accumulated =
                    self.get_accumulated_value(x, line_number as isize - n.lf_left as isize - 2);
                return left_len + accumulated + column - 1;
            } else {
                line_number -= n.lf_left + n.piece.line_feed_cnt;
                left_len += n.size_left + n.piece.length;
                x = n.right;
            }
        }

        left_len
    }

    // ------------------------------------------------------------------
    // Content extraction
    // ------------------------------------------------------------------

    /// The whole document.
    pub fn value(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.length);
        let mut x = if self.tree.root == SENTINEL {
            SENTINEL
        } else {
            self.tree.leftest(self.tree.root)
        };
        while x != SENTINEL {
            out.extend_from_slice(self.node_content(x));
            x = self.tree.next(x);
        }
        out
    }

    /// Bytes covered by `range`. With `requested_eol`, terminators in the
    /// output are rewritten to it whenever it differs from the active EOL
    /// or the document is not normalized.
    pub fn value_in_range(
        &self,
        range: Range,
        requested_eol: Option<LineEnding>,
    ) -> Result<Vec<u8>> {
        if (range.end.line, range.end.column) < (range.start.line, range.start.column) {
            anyhow::bail!(TextBufferError::InvalidRange {
                start_line: range.start.line,
                start_column: range.start.column,
                end_line: range.end.line,
                end_column: range.end.column,
            });
        }
        if range.start == range.end {
            return Ok(Vec::new());
        }

        let start_position = self.node_at_position(range.start.line, range.start.column);
        let end_position = self.node_at_position(range.end.line, range.end.column);
        let value = self.value_between(start_position, end_position);

        if let Some(eol) = requested_eol {
            if eol != self.eol || !self.eol_normalized {
                return Ok(normalize_eol_bytes(&value, eol));
            }
        }
        Ok(value)
    }

    fn value_between(&self, start: NodePosition, end: NodePosition) -> Vec<u8> {
        if start.node == SENTINEL || end.node == SENTINEL {
            return Vec::new();
        }
        if start.node == end.node {
            let piece = self.tree[start.node].piece;
            let buffer = &self.buffers[piece.buffer_index];
            let start_offset = buffer.offset_of(piece.start);
            return buffer.bytes()[start_offset + start.remainder..start_offset + end.remainder]
                .to_vec();
        }

        let mut x = start.node;
        let piece = self.tree[x].piece;
        let buffer = &self.buffers[piece.buffer_index];
        let start_offset = buffer.offset_of(piece.start);
        let mut out =
            buffer.bytes()[start_offset + start.remainder..start_offset + piece.length].to_vec();

        x = self.tree.next(x);
        while x != SENTINEL {
            let piece = self.tree[x].piece;
            let buffer = &self.buffers[piece.buffer_index];
            let start_offset = buffer.offset_of(piece.start);
            if x == end.node {
                out.extend_from_slice(&buffer.bytes()[start_offset..start_offset + end.remainder]);
                break;
            }
            out.extend_from_slice(&buffer.bytes()[start_offset..start_offset + piece.length]);
            x = self.tree.next(x);
        }
        out
    }

    /// Every line, without terminators. The count always equals
    /// [`line_count`](Self::line_count); a trailing terminator yields a
    /// final empty line.
    pub fn lines_content(&self) -> Vec<Vec<u8>> {
        let content = self.value();
        let mut lines = Vec::with_capacity(self.line_cnt);
        let mut start = 0;
        let mut i = 0;
        while i < content.len() {
            match content[i] {
                b'\r' => {
                    lines.push(content[start..i].to_vec());
                    i += if i + 1 < content.len() && content[i + 1] == b'\n' {
                        2
                    } else {
                        1
                    };
                    start = i;
                }
                b'\n' => {
                    lines.push(content[start..i].to_vec());
                    i += 1;
                    start = i;
                }
                _ => i += 1,
            }
        }
        lines.push(content[start..].to_vec());
        lines
    }

    fn get_line_raw_content(&self, line_number: usize, end_offset: usize) -> Vec<u8> {
        let mut ret: Vec<u8> = Vec::new();
        let mut x;
        let mut line_number = line_number;

        let cache_hit = self
            .search_cache
            .borrow()
            .get_by_line(line_number, &self.tree);
        if let Some((node, node_start_line)) = cache_hit {
            x = node;
            let piece = self.tree[x].piece;
            let buffer = &self.buffers[piece.buffer_index];
            let start_offset = buffer.offset_of(piece.start);
            let prev_accumulated = self
                .get_accumulated_value(x, line_number as isize - node_start_line as isize - 1);
            if node_start_line + piece.line_feed_cnt == line_number {
                // Line tail begins here and spills into later pieces.
                ret = buffer.bytes()[start_offset + prev_accumulated..start_offset + piece.length]
                    .to_vec();
            } else {
                let accumulated = self
                    .get_accumulated_value(x, line_number as isize - node_start_line as isize);
                return buffer.bytes()
                    [start_offset + prev_accumulated..start_offset + accumulated - end_offset]
                    .to_vec();
            }
        } else {
            x = self.tree.root;
            let mut node_start_offset = 0;
            let original_line_number = line_number;
            while x != SENTINEL {
                let n = &self.tree[x];
                if n.left != SENTINEL && n.lf_left >= line_number - 1 {
                    x = n.left;
                } else if n.lf_left + n.piece.line_feed_cnt > line_number - 1 {
                    let prev_accumulated = self
                        .get_accumulated_value(x, line_number as isize - n.lf_left as isize - 2);
                    let accumulated = self
                        .get_accumulated_value(x, line_number as isize - n.lf_left as isize - 1);
                    let piece = n.piece;
                    let lf_left = n.lf_left;
                    let size_left = n.size_left;
                    let buffer = &self.buffers[piece.buffer_index];
                    let start_offset = buffer.offset_of(piece.start);
                    node_start_offset += size_left;
                    self.search_cache.borrow_mut().set(CacheEntry {
                        node: x,
                        node_start_offset,
                        node_start_line_number: Some(
                            original_line_number - (line_number - 1 - lf_left),
                        ),
                    });
                    return buffer.bytes()
                        [start_offset + prev_accumulated..start_offset + accumulated - end_offset]
                        .to_vec();
                } else if n.lf_left + n.piece.line_feed_cnt == line_number - 1 {
                    let prev_accumulated = self
                        .get_accumulated_value(x, line_number as isize - n.lf_left as isize - 2);
                    let piece = n.piece;
                    let buffer = &self.buffers[piece.buffer_index];
                    let start_offset = buffer.offset_of(piece.start);
                    ret = buffer.bytes()
                        [start_offset + prev_accumulated..start_offset + piece.length]
                        .to_vec();
                    break;
                } else {
                    line_number -= n.lf_left + n.piece.line_feed_cnt;
                    node_start_offset += n.size_left + n.piece.length;
                    x = n.right;
                }
            }
        }

        // Accumulate following pieces until the line's terminator.
        let mut x = self.tree.next(x);
        while x != SENTINEL {
            let piece = self.tree[x].piece;
            let buffer = &self.buffers[piece.buffer_index];
            let start_offset = buffer.offset_of(piece.start);
            if piece.line_feed_cnt > 0 {
                let accumulated = self.get_accumulated_value(x, 0);
                ret.extend_from_slice(
                    &buffer.bytes()[start_offset..start_offset + accumulated - end_offset],
                );
                return ret;
            }
            ret.extend_from_slice(&buffer.bytes()[start_offset..start_offset + piece.length]);
            x = self.tree.next(x);
        }
        ret
    }

    /// Content of a 1-based line, without its terminator.
    pub fn line_content(&self, line_number: usize) -> Result<Vec<u8>> {
        if line_number < 1 || line_number > self.line_cnt {
            anyhow::bail!(TextBufferError::OutOfBounds {
                line: line_number,
                line_count: self.line_cnt,
            });
        }

        {
            let memo = self.last_visited_line.borrow();
            if memo.0 == line_number {
                return Ok(memo.1.clone());
            }
        }

        let value = if line_number == self.line_cnt {
            // Last line, no terminator to strip.
            self.get_line_raw_content(line_number, 0)
        } else if self.eol_normalized {
            self.get_line_raw_content(line_number, self.eol.len())
        } else {
            let mut content = self.get_line_raw_content(line_number, 0);
            if content.ends_with(b"\r\n") {
                content.truncate(content.len() - 2);
            } else if matches!(content.last(), Some(b'\n') | Some(b'\r')) {
                content.truncate(content.len() - 1);
            }
            content
        };

        *self.last_visited_line.borrow_mut() = (line_number, value.clone());
        Ok(value)
    }

    /// Byte length of a 1-based line, excluding its terminator.
    pub fn line_length(&self, line_number: usize) -> Result<usize> {
        if line_number < 1 || line_number > self.line_cnt {
            anyhow::bail!(TextBufferError::OutOfBounds {
                line: line_number,
                line_count: self.line_cnt,
            });
        }
        if line_number == self.line_cnt {
            let start_offset = self.offset_at(line_number, 1);
            return Ok(self.length - start_offset);
        }
        if self.eol_normalized {
            return Ok(
                self.offset_at(line_number + 1, 1) - self.offset_at(line_number, 1) - self.eol.len()
            );
        }
        // Mixed terminators; measure the stripped content.
        Ok(self.line_content(line_number)?.len())
    }

    /// Byte at `index` (0-based) of a 1-based line.
    pub fn line_char_code(&self, line_number: usize, index: usize) -> Result<u8> {
        if line_number < 1 || line_number > self.line_cnt {
            anyhow::bail!(TextBufferError::OutOfBounds {
                line: line_number,
                line_count: self.line_cnt,
            });
        }
        let node_pos = self.node_at_position(line_number, index + 1);
        if node_pos.node == SENTINEL {
            anyhow::bail!(TextBufferError::OutOfBounds {
                line: line_number,
                line_count: self.line_cnt,
            });
        }
        if node_pos.remainder == self.tree[node_pos.node].piece.length {
            // The byte sits at the head of the next piece.
            let next = self.tree.next(node_pos.node);
            if next == SENTINEL {
                anyhow::bail!(TextBufferError::OutOfBounds {
                    line: line_number,
                    line_count: self.line_cnt,
                });
            }
            let piece = self.tree[next].piece;
            let buffer = &self.buffers[piece.buffer_index];
            Ok(buffer.bytes()[buffer.offset_of(piece.start)])
        } else {
            let piece = self.tree[node_pos.node].piece;
            let buffer = &self.buffers[piece.buffer_index];
            Ok(buffer.bytes()[buffer.offset_of(piece.start) + node_pos.remainder])
        }
    }

    /// Piecewise content comparison, cheaper than materializing either
    /// document.
    pub fn equal(&self, other: &PieceTree) -> bool {
        if self.length != other.length || self.line_cnt != other.line_cnt {
            return false;
        }

        let mut a_node = if self.tree.root == SENTINEL {
            SENTINEL
        } else {
            self.tree.leftest(self.tree.root)
        };
        let mut b_node = if other.tree.root == SENTINEL {
            SENTINEL
        } else {
            other.tree.leftest(other.tree.root)
        };
        let mut a_off = 0;
        let mut b_off = 0;

        loop {
            while a_node != SENTINEL && a_off == self.tree[a_node].piece.length {
                a_node = self.tree.next(a_node);
                a_off = 0;
            }
            while b_node != SENTINEL && b_off == other.tree[b_node].piece.length {
                b_node = other.tree.next(b_node);
                b_off = 0;
            }
            match (a_node == SENTINEL, b_node == SENTINEL) {
                (true, true) => return true,
                (true, false) | (false, true) => return false,
                _ => {}
            }
            let a_bytes = self.node_content(a_node);
            let b_bytes = other.node_content(b_node);
            let take = (a_bytes.len() - a_off).min(b_bytes.len() - b_off);
            if a_bytes[a_off..a_off + take] != b_bytes[b_off..b_off + take] {
                return false;
            }
            a_off += take;
            b_off += take;
        }
    }

    /// Freeze the current piece sequence. The snapshot keeps yielding the
    /// document as it was here, no matter what later edits do.
    pub fn create_snapshot(&self, bom: &[u8]) -> Snapshot {
        let mut chunks = Vec::new();
        let mut x = if self.tree.root == SENTINEL {
            SENTINEL
        } else {
            self.tree.leftest(self.tree.root)
        };
        while x != SENTINEL {
            let piece = self.tree[x].piece;
            let buffer = &self.buffers[piece.buffer_index];
            chunks.push(SnapshotChunk::new(
                buffer.block().clone(),
                buffer.offset_of(piece.start)..buffer.offset_of(piece.end),
            ));
            x = self.tree.next(x);
        }
        Snapshot::new(chunks, bom.to_vec())
    }

    // ------------------------------------------------------------------
    // Insert
    // ------------------------------------------------------------------

    /// Insert `value` at byte `offset`. Offsets past the end append.
    /// `eol_normalized` asserts that every terminator in `value` matches
    /// the active EOL; passing `false` merely re-enables the lazy checks.
    pub fn insert(&mut self, offset: usize, value: &[u8], eol_normalized: bool) {
        if value.is_empty() {
            return;
        }
        self.eol_normalized = self.eol_normalized && eol_normalized;
        *self.last_visited_line.borrow_mut() = (0, Vec::new());
        let offset = offset.min(self.length);

        if self.tree.root != SENTINEL {
            let NodePosition {
                node,
                remainder,
                node_start_offset,
            } = self.node_at(offset);
            let piece = self.tree[node].piece;
            let buffer_index = piece.buffer_index;
            let insert_pos_in_buffer = self.position_in_buffer(node, remainder);

            if piece.buffer_index == 0
                && piece.end == self.last_change_buffer_pos
                && node_start_offset + piece.length == offset
                && value.len() < AVERAGE_BUFFER_SIZE
            {
                // Typing at the tail of the change buffer; grow in place.
                self.append_to_node(node, value.to_vec());
                self.compute_buffer_metadata();
                return;
            }

            if node_start_offset == offset {
                self.insert_content_to_node_left(value.to_vec(), node);
                self.search_cache.borrow_mut().validate(offset);
            } else if node_start_offset + piece.length > offset {
                // Splitting the piece in two around the insertion.
                let mut nodes_to_del: Vec<NodeRef> = Vec::new();
                let mut value = value.to_vec();

                let mut new_right_piece = Piece::new(
                    piece.buffer_index,
                    insert_pos_in_buffer,
                    piece.end,
                    self.get_line_feed_cnt(piece.buffer_index, insert_pos_in_buffer, piece.end),
                    self.offset_in_buffer(buffer_index, piece.end)
                        - self.offset_in_buffer(buffer_index, insert_pos_in_buffer),
                );

                if self.should_check_crlf() && ends_with_cr(&value) {
                    if self.node_char_code_at(node, remainder) == Some(b'\n') {
                        // Keep the \r we are inserting and the \n to its
                        // right in one piece.
                        let new_start =
                            BufferCursor::new(new_right_piece.start.line + 1, 0);
                        new_right_piece = Piece::new(
                            new_right_piece.buffer_index,
                            new_start,
                            new_right_piece.end,
                            self.get_line_feed_cnt(
                                new_right_piece.buffer_index,
                                new_start,
                                new_right_piece.end,
                            ),
                            new_right_piece.length - 1,
                        );
                        value.push(b'\n');
                    }
                }

                if self.should_check_crlf() && starts_with_lf(&value) {
                    if self.node_char_code_at(node, remainder - 1) == Some(b'\r') {
                        // Pull the \r left of the split into the inserted
                        // run instead of leaving it stranded.
                        let previous_pos = self.position_in_buffer(node, remainder - 1);
                        self.delete_node_tail(node, previous_pos);
                        value.insert(0, b'\r');
                        if self.tree[node].piece.length == 0 {
                            nodes_to_del.push(node);
                        }
                    } else {
                        self.delete_node_tail(node, insert_pos_in_buffer);
                    }
                } else {
                    self.delete_node_tail(node, insert_pos_in_buffer);
                }

                let new_pieces = self.create_new_pieces(&value);
                if new_right_piece.length > 0 {
                    self.tree.insert_right(node, new_right_piece);
                }
                let mut tmp_node = node;
                for p in new_pieces {
                    tmp_node = self.tree.insert_right(tmp_node, p);
                }
                self.delete_nodes(nodes_to_del);
            } else {
                self.insert_content_to_node_right(value.to_vec(), node);
            }
        } else {
            let pieces = self.create_new_pieces(value);
            let mut node = SENTINEL;
            for (k, piece) in pieces.into_iter().enumerate() {
                node = if k == 0 {
                    self.tree.insert_left(SENTINEL, piece)
                } else {
                    self.tree.insert_right(node, piece)
                };
            }
        }

        self.compute_buffer_metadata();
    }

    fn insert_content_to_node_left(&mut self, mut value: Vec<u8>, node: NodeRef) {
        let mut nodes_to_del: Vec<NodeRef> = Vec::new();
        if self.should_check_crlf() && ends_with_cr(&value) && self.node_starts_with_lf(node) {
            // Move the node's leading \n onto the inserted run so it pairs
            // with the trailing \r.
            let piece = self.tree[node].piece;
            let new_start = BufferCursor::new(piece.start.line + 1, 0);
            let n_piece = Piece::new(
                piece.buffer_index,
                new_start,
                piece.end,
                self.get_line_feed_cnt(piece.buffer_index, new_start, piece.end),
                piece.length - 1,
            );
            self.tree[node].piece = n_piece;
            value.push(b'\n');
            self.tree.update_metadata_upward(node, -1, -1);
            if self.tree[node].piece.length == 0 {
                nodes_to_del.push(node);
            }
        }

        let mut new_pieces = self.create_new_pieces(&value);
        let mut new_node = node;
        while let Some(piece) = new_pieces.pop() {
            new_node = self.tree.insert_left(new_node, piece);
        }
        self.validate_crlf_with_prev_node(new_node);
        self.delete_nodes(nodes_to_del);
    }

    fn insert_content_to_node_right(&mut self, mut value: Vec<u8>, node: NodeRef) {
        if self.adjust_carriage_return_from_next(&value, node) {
            value.push(b'\n');
        }

        let new_pieces = self.create_new_pieces(&value);
        let mut first_new_node = SENTINEL;
        let mut tmp_node = node;
        for (k, piece) in new_pieces.into_iter().enumerate() {
            tmp_node = self.tree.insert_right(tmp_node, piece);
            if k == 0 {
                first_new_node = tmp_node;
            }
        }
        self.validate_crlf_with_prev_node(first_new_node);
    }

    /// Grow the node whose piece ends at the change buffer's tail.
    fn append_to_node(&mut self, node: NodeRef, mut value: Vec<u8>) {
        if self.adjust_carriage_return_from_next(&value, node) {
            value.push(b'\n');
        }

        let hit_crlf =
            self.should_check_crlf() && starts_with_lf(&value) && self.node_ends_with_cr(node);
        let start_offset = self.buffers[0].len();
        let mut line_starts = create_line_starts_fast(&value);
        for line_start in line_starts.iter_mut() {
            *line_start += start_offset;
        }
        if hit_crlf {
            // The appended \n joins the buffer's trailing \r; the two
            // lines collapse into one.
            let buffer0 = &mut self.buffers[0];
            let prev_start_offset = buffer0.line_starts[buffer0.line_starts.len() - 2];
            buffer0.line_starts.pop();
            self.last_change_buffer_pos = BufferCursor::new(
                self.last_change_buffer_pos.line - 1,
                start_offset - prev_start_offset,
            );
        }
        {
            let buffer0 = &mut self.buffers[0];
            buffer0.append_bytes(&value);
            buffer0.line_starts.extend_from_slice(&line_starts[1..]);
        }

        let buffer0 = &self.buffers[0];
        let end_index = buffer0.line_starts.len() - 1;
        let end_column = buffer0.len() - buffer0.line_starts[end_index];
        let new_end = BufferCursor::new(end_index, end_column);

        let piece = self.tree[node].piece;
        let new_length = piece.length + value.len();
        let new_line_feed_cnt = self.get_line_feed_cnt(0, piece.start, new_end);
        let lf_delta = new_line_feed_cnt as isize - piece.line_feed_cnt as isize;

        self.tree[node].piece = Piece::new(
            piece.buffer_index,
            piece.start,
            new_end,
            new_line_feed_cnt,
            new_length,
        );
        self.last_change_buffer_pos = new_end;
        self.tree
            .update_metadata_upward(node, value.len() as isize, lf_delta);
    }

    /// Turn `text` into pieces, appending to the change buffer below the
    /// chunking threshold and minting dedicated buffers above it.
    fn create_new_pieces(&mut self, text: &[u8]) -> Vec<Piece> {
        if text.len() > AVERAGE_BUFFER_SIZE {
            tracing::trace!(bytes = text.len(), "chunking oversized insertion");
            let mut new_pieces = Vec::new();
            let mut text = text;
            while text.len() > AVERAGE_BUFFER_SIZE {
                let mut split = AVERAGE_BUFFER_SIZE;
                if text[split - 1] == b'\r' {
                    // Never separate a \r from a possible following \n.
                    split -= 1;
                } else {
                    split = backoff_utf8(text, split);
                    if split == 0 {
                        split = AVERAGE_BUFFER_SIZE;
                    }
                }
                let (split_text, rest) = text.split_at(split);
                text = rest;
                new_pieces.push(self.push_chunk_buffer(split_text));
            }
            new_pieces.push(self.push_chunk_buffer(text));
            return new_pieces;
        }

        let mut start_offset = self.buffers[0].len();
        let mut line_starts = create_line_starts_fast(text);
        let mut start = self.last_change_buffer_pos;

        let last_line_start = self.buffers[0].line_starts[self.buffers[0].line_starts.len() - 1];
        if last_line_start == start_offset
            && start_offset != 0
            && starts_with_lf(text)
            && ends_with_cr(self.buffers[0].bytes())
        {
            // The buffer ends in \r right at a line boundary and the new
            // text opens with \n. A padding byte keeps the new piece's
            // start cursor from landing between the two; the piece begins
            // after it, so the byte is never observable.
            self.last_change_buffer_pos = BufferCursor::new(
                self.last_change_buffer_pos.line,
                self.last_change_buffer_pos.column + 1,
            );
            start = self.last_change_buffer_pos;

            for line_start in line_starts.iter_mut() {
                *line_start += start_offset + 1;
            }
            let buffer0 = &mut self.buffers[0];
            buffer0.line_starts.extend_from_slice(&line_starts[1..]);
            buffer0.push_byte(b'_');
            buffer0.append_bytes(text);
            start_offset += 1;
        } else {
            if start_offset != 0 {
                for line_start in line_starts.iter_mut() {
                    *line_start += start_offset;
                }
            }
            let buffer0 = &mut self.buffers[0];
            buffer0.line_starts.extend_from_slice(&line_starts[1..]);
            buffer0.append_bytes(text);
        }

        let buffer0 = &self.buffers[0];
        let end_offset = buffer0.len();
        let end_index = buffer0.line_starts.len() - 1;
        let end_column = end_offset - buffer0.line_starts[end_index];
        let end_pos = BufferCursor::new(end_index, end_column);
        let piece = Piece::new(
            0,
            start,
            end_pos,
            self.get_line_feed_cnt(0, start, end_pos),
            end_offset - start_offset,
        );
        self.last_change_buffer_pos = end_pos;
        vec![piece]
    }

    fn push_chunk_buffer(&mut self, chunk: &[u8]) -> Piece {
        let line_starts = create_line_starts_fast(chunk);
        let piece = Piece::new(
            self.buffers.len(),
            BufferCursor::new(0, 0),
            BufferCursor::new(
                line_starts.len() - 1,
                chunk.len() - line_starts[line_starts.len() - 1],
            ),
            line_starts.len() - 1,
            chunk.len(),
        );
        self.buffers
            .push(StringBuffer::from_parts(chunk.to_vec(), line_starts));
        piece
    }

    // ------------------------------------------------------------------
    // Delete
    // ------------------------------------------------------------------

    /// Delete `cnt` bytes starting at `offset`. Ranges reaching past the
    /// end clamp; zero counts and empty documents are no-ops.
    pub fn delete(&mut self, offset: usize, cnt: usize) {
        *self.last_visited_line.borrow_mut() = (0, Vec::new());
        if cnt == 0 || self.tree.root == SENTINEL {
            return;
        }
        if offset >= self.length {
            return;
        }
        let cnt = cnt.min(self.length - offset);

        // Very large deletions go piecewise so no single pass collects an
        // unbounded node list.
        let chunk = AVERAGE_BUFFER_SIZE / 2;
        if cnt > chunk && cnt > self.length / 10 {
            tracing::trace!(offset, bytes = cnt, "chunking oversized deletion");
            let mut remaining = cnt;
            while remaining > 0 {
                let step = chunk.min(remaining);
                self.delete_range(offset, step);
                remaining -= step;
            }
            return;
        }

        self.delete_range(offset, cnt);
    }

    fn delete_range(&mut self, offset: usize, cnt: usize) {
        if cnt == 0 || self.tree.root == SENTINEL {
            return;
        }

        let start_position = self.node_at(offset);
        let end_position = self.node_at(offset + cnt);
        let start_node = start_position.node;
        let end_node = end_position.node;
        if start_node == SENTINEL || end_node == SENTINEL {
            return;
        }

        if start_node == end_node {
            let start_split = self.position_in_buffer(start_node, start_position.remainder);
            let end_split = self.position_in_buffer(start_node, end_position.remainder);

            if start_position.node_start_offset == offset {
                if cnt == self.tree[start_node].piece.length {
                    let next = self.tree.next(start_node);
                    self.delete_node(start_node);
                    self.validate_crlf_with_prev_node(next);
                    self.compute_buffer_metadata();
                    return;
                }
                self.delete_node_head(start_node, end_split);
                self.search_cache.borrow_mut().validate(offset);
                self.validate_crlf_with_prev_node(start_node);
                self.compute_buffer_metadata();
                return;
            }

            if start_position.node_start_offset + self.tree[start_node].piece.length
                == offset + cnt
            {
                self.delete_node_tail(start_node, start_split);
                self.validate_crlf_with_next_node(start_node);
                self.compute_buffer_metadata();
                return;
            }

            // Interior range; the node splits around it.
            self.shrink_node(start_node, start_split, end_split);
            self.compute_buffer_metadata();
            return;
        }

        let mut nodes_to_del: Vec<NodeRef> = Vec::new();

        let start_split = self.position_in_buffer(start_node, start_position.remainder);
        self.delete_node_tail(start_node, start_split);
        self.search_cache.borrow_mut().validate(offset);
        if self.tree[start_node].piece.length == 0 {
            nodes_to_del.push(start_node);
        }

        let end_split = self.position_in_buffer(end_node, end_position.remainder);
        self.delete_node_head(end_node, end_split);
        if self.tree[end_node].piece.length == 0 {
            nodes_to_del.push(end_node);
        }

        let mut node = self.tree.next(start_node);
        while node != SENTINEL && node != end_node {
            nodes_to_del.push(node);
            node = self.tree.next(node);
        }

        let prev = if self.tree[start_node].piece.length == 0 {
            self.tree.prev(start_node)
        } else {
            start_node
        };
        self.delete_nodes(nodes_to_del);
        self.validate_crlf_with_next_node(prev);
        self.compute_buffer_metadata();
    }

    fn delete_node(&mut self, node: NodeRef) {
        self.tree.rb_delete(node);
        // Entries may hold recycled handles after this; drop them all.
        self.search_cache.borrow_mut().flush();
    }

    fn delete_nodes(&mut self, nodes: Vec<NodeRef>) {
        for node in nodes {
            self.delete_node(node);
        }
    }

    fn delete_node_tail(&mut self, node: NodeRef, pos: BufferCursor) {
        let piece = self.tree[node].piece;
        let original_end_offset = self.offset_in_buffer(piece.buffer_index, piece.end);

        let new_end = pos;
        let new_end_offset = self.offset_in_buffer(piece.buffer_index, new_end);
        let new_line_feed_cnt = self.get_line_feed_cnt(piece.buffer_index, piece.start, new_end);

        let lf_delta = new_line_feed_cnt as isize - piece.line_feed_cnt as isize;
        let size_delta = new_end_offset as isize - original_end_offset as isize;
        let new_length = (piece.length as isize + size_delta) as usize;

        self.tree[node].piece = Piece::new(
            piece.buffer_index,
            piece.start,
            new_end,
            new_line_feed_cnt,
            new_length,
        );
        self.tree.update_metadata_upward(node, size_delta, lf_delta);
    }

    fn delete_node_head(&mut self, node: NodeRef, pos: BufferCursor) {
        let piece = self.tree[node].piece;
        let original_start_offset = self.offset_in_buffer(piece.buffer_index, piece.start);

        let new_start = pos;
        let new_start_offset = self.offset_in_buffer(piece.buffer_index, new_start);
        let new_line_feed_cnt = self.get_line_feed_cnt(piece.buffer_index, new_start, piece.end);

        let lf_delta = new_line_feed_cnt as isize - piece.line_feed_cnt as isize;
        let size_delta = original_start_offset as isize - new_start_offset as isize;
        let new_length = (piece.length as isize + size_delta) as usize;

        self.tree[node].piece = Piece::new(
            piece.buffer_index,
            new_start,
            piece.end,
            new_line_feed_cnt,
            new_length,
        );
        self.tree.update_metadata_upward(node, size_delta, lf_delta);
    }

    /// Cut `[start, end)` out of the middle of a node: the node keeps the
    /// left remnant, a fresh piece carries the right remnant.
    fn shrink_node(&mut self, node: NodeRef, start: BufferCursor, end: BufferCursor) {
        let piece = self.tree[node].piece;
        let original_start_pos = piece.start;
        let original_end_pos = piece.end;

        let old_length = piece.length;
        let old_lf_cnt = piece.line_feed_cnt;
        let new_end = start;
        let new_line_feed_cnt = self.get_line_feed_cnt(piece.buffer_index, piece.start, new_end);
        let new_length = self.offset_in_buffer(piece.buffer_index, start)
            - self.offset_in_buffer(piece.buffer_index, original_start_pos);

        self.tree[node].piece = Piece::new(
            piece.buffer_index,
            piece.start,
            new_end,
            new_line_feed_cnt,
            new_length,
        );
        self.tree.update_metadata_upward(
            node,
            new_length as isize - old_length as isize,
            new_line_feed_cnt as isize - old_lf_cnt as isize,
        );

        let new_piece = Piece::new(
            piece.buffer_index,
            end,
            original_end_pos,
            self.get_line_feed_cnt(piece.buffer_index, end, original_end_pos),
            self.offset_in_buffer(piece.buffer_index, original_end_pos)
                - self.offset_in_buffer(piece.buffer_index, end),
        );
        let new_node = self.tree.insert_right(node, new_piece);
        self.validate_crlf_with_prev_node(new_node);
    }

    // ------------------------------------------------------------------
    // CRLF repairs
    // ------------------------------------------------------------------

    fn validate_crlf_with_prev_node(&mut self, node: NodeRef) {
        if node == SENTINEL || !self.should_check_crlf() || !self.node_starts_with_lf(node) {
            return;
        }
        let prev = self.tree.prev(node);
        if prev != SENTINEL && self.node_ends_with_cr(prev) {
            self.fix_crlf(prev, node);
        }
    }

    fn validate_crlf_with_next_node(&mut self, node: NodeRef) {
        if node == SENTINEL || !self.should_check_crlf() || !self.node_ends_with_cr(node) {
            return;
        }
        let next = self.tree.next(node);
        if next != SENTINEL && self.node_starts_with_lf(next) {
            self.fix_crlf(node, next);
        }
    }

    /// `prev` ends in \r, `next` starts with \n. Shave both bytes off and
    /// plant a dedicated "\r\n" piece between them.
    fn fix_crlf(&mut self, prev: NodeRef, next: NodeRef) {
        let mut nodes_to_del: Vec<NodeRef> = Vec::new();

        let prev_piece = self.tree[prev].piece;
        let line_starts = &self.buffers[prev_piece.buffer_index].line_starts;
        let new_end = if prev_piece.end.column == 0 {
            // The \r stands alone as a terminator, so stepping over it
            // crosses a line boundary.
            BufferCursor::new(
                prev_piece.end.line - 1,
                line_starts[prev_piece.end.line] - line_starts[prev_piece.end.line - 1] - 1,
            )
        } else {
            BufferCursor::new(prev_piece.end.line, prev_piece.end.column - 1)
        };
        self.tree[prev].piece = Piece::new(
            prev_piece.buffer_index,
            prev_piece.start,
            new_end,
            prev_piece.line_feed_cnt - 1,
            prev_piece.length - 1,
        );
        self.tree.update_metadata_upward(prev, -1, -1);
        if self.tree[prev].piece.length == 0 {
            nodes_to_del.push(prev);
        }

        let next_piece = self.tree[next].piece;
        let new_start = BufferCursor::new(next_piece.start.line + 1, 0);
        let new_length = next_piece.length - 1;
        let new_line_feed_cnt =
            self.get_line_feed_cnt(next_piece.buffer_index, new_start, next_piece.end);
        self.tree[next].piece = Piece::new(
            next_piece.buffer_index,
            new_start,
            next_piece.end,
            new_line_feed_cnt,
            new_length,
        );
        self.tree.update_metadata_upward(next, -1, -1);
        if self.tree[next].piece.length == 0 {
            nodes_to_del.push(next);
        }

        let pieces = self.create_new_pieces(b"\r\n");
        for piece in pieces {
            self.tree.insert_right(prev, piece);
        }
        self.delete_nodes(nodes_to_del);
    }

    /// When inserted text ends in \r and the next piece starts with \n,
    /// steal that \n so the pair stays together. Returns whether the
    /// caller should append the stolen \n to its text.
    fn adjust_carriage_return_from_next(&mut self, value: &[u8], node: NodeRef) -> bool {
        if !self.should_check_crlf() || !ends_with_cr(value) {
            return false;
        }
        let next_node = self.tree.next(node);
        if !self.node_starts_with_lf(next_node) {
            return false;
        }
        if self.tree[next_node].piece.length == 1 {
            self.delete_node(next_node);
        } else {
            let piece = self.tree[next_node].piece;
            let new_start = BufferCursor::new(piece.start.line + 1, 0);
            let new_length = piece.length - 1;
            let new_line_feed_cnt =
                self.get_line_feed_cnt(piece.buffer_index, new_start, piece.end);
            self.tree[next_node].piece = Piece::new(
                piece.buffer_index,
                new_start,
                piece.end,
                new_line_feed_cnt,
                new_length,
            );
            self.tree.update_metadata_upward(next_node, -1, -1);
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tree::NodeColor;

    fn tree_from(content: &[u8]) -> PieceTree {
        PieceTree::new(
            vec![StringBuffer::new(content.to_vec())],
            LineEnding::Lf,
            false,
        )
    }

    /// Count terminators the way the document does: \r\n is one.
    fn count_terminators(content: &[u8]) -> usize {
        let mut count = 0;
        let mut i = 0;
        while i < content.len() {
            match content[i] {
                b'\r' => {
                    count += 1;
                    i += if i + 1 < content.len() && content[i + 1] == b'\n' {
                        2
                    } else {
                        1
                    };
                }
                b'\n' => {
                    count += 1;
                    i += 1;
                }
                _ => i += 1,
            }
        }
        count
    }

    /// Full structural audit: red-black balance, augmented sums, piece
    /// geometry, cached totals.
    pub(crate) fn assert_invariants(tree: &PieceTree) {
        fn audit(tree: &PieceTree, node: NodeRef) -> usize {
            if node == SENTINEL {
                return 1;
            }
            let n = &tree.tree[node];
            if n.color == NodeColor::Red {
                assert_eq!(tree.tree[n.left].color, NodeColor::Black);
                assert_eq!(tree.tree[n.right].color, NodeColor::Black);
            }
            assert_eq!(n.size_left, tree.tree.calculate_size(n.left));
            assert_eq!(n.lf_left, tree.tree.calculate_lf(n.left));

            let piece = &n.piece;
            let buffer = &tree.buffers[piece.buffer_index];
            assert_eq!(
                piece.length,
                buffer.offset_of(piece.end) - buffer.offset_of(piece.start),
                "piece length disagrees with its cursors"
            );
            assert_eq!(
                piece.line_feed_cnt,
                tree.get_line_feed_cnt(piece.buffer_index, piece.start, piece.end),
                "piece terminator count disagrees with its bytes"
            );
            assert!(piece.length > 0, "empty piece left in the tree");

            let lh = audit(tree, n.left);
            let rh = audit(tree, n.right);
            assert_eq!(lh, rh, "unequal black heights");
            lh + usize::from(n.color == NodeColor::Black)
        }
        audit(tree, tree.tree.root);
        assert_eq!(tree.length, tree.tree.calculate_size(tree.tree.root));
        assert_eq!(
            tree.line_cnt,
            tree.tree.calculate_lf(tree.tree.root) + 1
        );
        assert_eq!(tree.line_cnt, count_terminators(&tree.value()) + 1);
    }

    #[test]
    fn test_empty_tree() {
        let tree = PieceTree::new(Vec::new(), LineEnding::Lf, true);
        assert_eq!(tree.len(), 0);
        assert_eq!(tree.line_count(), 1);
        assert_eq!(tree.value(), b"");
        assert_eq!(tree.position_at(0), Position::new(1, 1));
    }

    #[test]
    fn test_basic_insert_and_value() {
        let mut tree = PieceTree::new(Vec::new(), LineEnding::Lf, true);
        tree.insert(0, b"Hello", true);
        tree.insert(5, b" World", true);
        tree.insert(11, b"!", true);
        assert_eq!(tree.value(), b"Hello World!");
        assert_eq!(tree.len(), 12);
        assert_eq!(tree.line_count(), 1);
        assert_invariants(&tree);
    }

    #[test]
    fn test_insert_middle_splits_piece() {
        let mut tree = tree_from(b"abcdef");
        tree.insert(3, b"XYZ", false);
        assert_eq!(tree.value(), b"abcXYZdef");
        assert_invariants(&tree);
    }

    #[test]
    fn test_insert_empty_is_noop() {
        let mut tree = tree_from(b"abc");
        tree.insert(1, b"", false);
        assert_eq!(tree.value(), b"abc");
    }

    #[test]
    fn test_insert_past_end_appends() {
        let mut tree = tree_from(b"abc");
        tree.insert(100, b"def", false);
        assert_eq!(tree.value(), b"abcdef");
        assert_invariants(&tree);
    }

    #[test]
    fn test_typing_hits_append_fast_path() {
        let mut tree = PieceTree::new(Vec::new(), LineEnding::Lf, true);
        for (i, byte) in b"typing one byte at a time".iter().enumerate() {
            tree.insert(i, &[*byte], true);
        }
        assert_eq!(tree.value(), b"typing one byte at a time");
        // Sequential appends coalesce into a single change-buffer piece.
        assert_eq!(tree.tree.calculate_size(tree.tree.root), tree.len());
        assert_eq!(tree.buffers.len(), 1);
        assert_invariants(&tree);
    }

    #[test]
    fn test_delete_within_piece() {
        let mut tree = tree_from(b"Hello World!");
        tree.delete(5, 6);
        assert_eq!(tree.value(), b"Hello!");
        assert_eq!(tree.len(), 6);
        assert_invariants(&tree);
    }

    #[test]
    fn test_delete_across_pieces() {
        let mut tree = tree_from(b"abcdefghijklmnopqrstuvwxyz");
        tree.insert(1, b"-1-", false);
        tree.insert(13, b"-13-", false);
        tree.delete(2, 2);
        tree.delete(10, 5);
        assert_eq!(tree.value(), b"a-bcdefghiklmnopqrstuvwxyz");
        assert_invariants(&tree);
    }

    #[test]
    fn test_delete_everything() {
        let mut tree = tree_from(b"line1\nline2\nline3");
        tree.delete(0, 1000);
        assert_eq!(tree.len(), 0);
        assert_eq!(tree.line_count(), 1);
        assert_eq!(tree.value(), b"");
    }

    #[test]
    fn test_delete_zero_is_noop() {
        let mut tree = tree_from(b"abc");
        tree.delete(1, 0);
        tree.delete(50, 3);
        assert_eq!(tree.value(), b"abc");
    }

    #[test]
    fn test_line_count_with_mixed_terminators() {
        let tree = tree_from(b"a\nb\rc\r\nd");
        assert_eq!(tree.line_count(), 4);
        assert_eq!(tree.len(), 8);
    }

    #[test]
    fn test_line_content_and_memo() {
        let tree = tree_from(b"Line1\nLine2\nLine3");
        assert_eq!(tree.line_content(1).unwrap(), b"Line1");
        assert_eq!(tree.line_content(2).unwrap(), b"Line2");
        // Memo hit returns the same bytes.
        assert_eq!(tree.line_content(2).unwrap(), b"Line2");
        assert_eq!(tree.line_content(3).unwrap(), b"Line3");
        assert!(tree.line_content(0).is_err());
        assert!(tree.line_content(4).is_err());
    }

    #[test]
    fn test_line_content_strips_crlf() {
        let tree = tree_from(b"one\r\ntwo\r\nthree");
        assert_eq!(tree.line_content(1).unwrap(), b"one");
        assert_eq!(tree.line_content(2).unwrap(), b"two");
        assert_eq!(tree.line_content(3).unwrap(), b"three");
    }

    #[test]
    fn test_line_length() {
        let tree = tree_from(b"one\r\ntwo\nthree");
        assert_eq!(tree.line_length(1).unwrap(), 3);
        assert_eq!(tree.line_length(2).unwrap(), 3);
        assert_eq!(tree.line_length(3).unwrap(), 5);
        assert!(tree.line_length(4).is_err());
    }

    #[test]
    fn test_position_offset_round_trip() {
        let mut tree = tree_from(b"alpha\nbeta\ngamma\n");
        tree.insert(6, b"inserted ", false);
        let content = tree.value();
        for offset in 0..=content.len() {
            let pos = tree.position_at(offset);
            assert_eq!(
                tree.offset_at(pos.line, pos.column),
                offset,
                "round trip failed at offset {}",
                offset
            );
        }
    }

    #[test]
    fn test_position_at_line_starts() {
        let tree = tree_from(b"ab\ncd\nef");
        assert_eq!(tree.position_at(0), Position::new(1, 1));
        assert_eq!(tree.position_at(3), Position::new(2, 1));
        assert_eq!(tree.position_at(6), Position::new(3, 1));
        assert_eq!(tree.position_at(8), Position::new(3, 3));
        assert_eq!(tree.offset_at(2, 1), 3);
        assert_eq!(tree.offset_at(3, 3), 8);
    }

    // The four CRLF fusion shapes.

    #[test]
    fn test_crlf_assembled_byte_by_byte() {
        let mut tree = tree_from(b"abc");
        tree.insert(3, b"\r", false);
        assert_eq!(tree.line_count(), 2);
        tree.insert(4, b"\n", false);
        assert_eq!(tree.value(), b"abc\r\n");
        assert_eq!(tree.line_count(), 2, "\\r\\n must count once");
        assert_invariants(&tree);
    }

    #[test]
    fn test_crlf_insert_cr_tail_before_lf() {
        let mut tree = tree_from(b"X\nY");
        tree.insert(1, b"Z\r", false);
        assert_eq!(tree.value(), b"XZ\r\nY");
        assert_eq!(tree.line_count(), 2);
        assert_invariants(&tree);
    }

    #[test]
    fn test_crlf_insert_lf_head_after_cr() {
        let mut tree = tree_from(b"X\rY");
        tree.insert(2, b"\nZ", false);
        assert_eq!(tree.value(), b"X\r\nZY");
        assert_eq!(tree.line_count(), 2);
        assert_invariants(&tree);
    }

    #[test]
    fn test_crlf_left_boundary_fusion() {
        let mut tree = tree_from(b"\nY");
        tree.insert(0, b"X\r", false);
        assert_eq!(tree.value(), b"X\r\nY");
        assert_eq!(tree.line_count(), 2);
        assert_invariants(&tree);
    }

    #[test]
    fn test_crlf_right_boundary_absorbs_successor_lf() {
        let chunks = vec![
            StringBuffer::new(b"A".to_vec()),
            StringBuffer::new(b"\nB".to_vec()),
        ];
        let mut tree = PieceTree::new(chunks, LineEnding::Lf, false);
        tree.insert(1, b"C\r", false);
        assert_eq!(tree.value(), b"AC\r\nB");
        assert_eq!(tree.line_count(), 2);
        assert_invariants(&tree);
    }

    #[test]
    fn test_crlf_join_repair_after_delete() {
        let mut tree = tree_from(b"a\rX\nb");
        assert_eq!(tree.line_count(), 3);
        tree.delete(2, 1);
        assert_eq!(tree.value(), b"a\r\nb");
        assert_eq!(tree.line_count(), 2, "exposed pair must fuse");
        assert_invariants(&tree);
    }

    #[test]
    fn test_delete_one_byte_joins_lines() {
        let mut tree = tree_from(b"Line1\nLine2\nLine3\n");
        assert_eq!(tree.line_count(), 4);
        tree.delete(5, 1);
        assert_eq!(tree.line_count(), 3);
        assert_eq!(tree.line_content(1).unwrap(), b"Line1Line2");
        assert_invariants(&tree);
    }

    #[test]
    fn test_oversized_insert_gets_chunked() {
        let mut tree = PieceTree::new(Vec::new(), LineEnding::Lf, true);
        let mut big = Vec::new();
        for i in 0..(AVERAGE_BUFFER_SIZE * 2 + 100) {
            big.push(if i % 80 == 79 { b'\n' } else { b'x' });
        }
        tree.insert(0, &big, true);
        assert_eq!(tree.len(), big.len());
        assert_eq!(tree.value(), big);
        assert!(tree.buffers.len() > 2, "large payload mints new buffers");
        assert_invariants(&tree);
    }

    #[test]
    fn test_chunk_split_never_divides_crlf() {
        let mut tree = PieceTree::new(Vec::new(), LineEnding::Lf, true);
        // Place a \r exactly at the default split point.
        let mut big = vec![b'x'; AVERAGE_BUFFER_SIZE - 1];
        big.push(b'\r');
        big.push(b'\n');
        big.extend_from_slice(&vec![b'y'; AVERAGE_BUFFER_SIZE]);
        tree.insert(0, &big, false);
        assert_eq!(tree.value(), big);
        assert_eq!(
            tree.line_count(),
            count_terminators(&big) + 1,
            "the split must not cut the pair in two"
        );
        assert_invariants(&tree);
    }

    #[test]
    fn test_chunk_split_respects_utf8() {
        let mut tree = PieceTree::new(Vec::new(), LineEnding::Lf, true);
        let mut big = vec![b'x'; AVERAGE_BUFFER_SIZE - 1];
        big.extend_from_slice("é".as_bytes());
        big.extend_from_slice(&vec![b'y'; AVERAGE_BUFFER_SIZE]);
        tree.insert(0, &big, true);
        assert_eq!(tree.value(), big);
        for buffer in &tree.buffers[1..] {
            assert!(
                std::str::from_utf8(buffer.bytes()).is_ok(),
                "chunk boundary sliced a code point"
            );
        }
    }

    #[test]
    fn test_change_buffer_padding_keeps_content() {
        let mut tree = PieceTree::new(Vec::new(), LineEnding::Lf, true);
        // First insertion leaves the change buffer ending in \r at a line
        // boundary; the next starts with \n, triggering the padding rule.
        tree.insert(0, b"a\r", false);
        tree.insert(0, b"\nb", false);
        assert_eq!(tree.value(), b"\nba\r");
        assert_eq!(tree.line_count(), count_terminators(b"\nba\r") + 1);
        assert_invariants(&tree);
    }

    #[test]
    fn test_value_in_range() {
        let tree = tree_from(b"alpha\nbeta\ngamma");
        let range = Range::new(1, 2, 2, 3);
        assert_eq!(tree.value_in_range(range, None).unwrap(), b"lpha\nbe");
        let empty = Range::new(2, 2, 2, 2);
        assert_eq!(tree.value_in_range(empty, None).unwrap(), b"");
        let backwards = Range::new(2, 1, 1, 1);
        assert!(tree.value_in_range(backwards, None).is_err());
    }

    #[test]
    fn test_value_in_range_rewrites_eol() {
        let tree = tree_from(b"a\r\nb\nc");
        let range = Range::new(1, 1, 3, 2);
        assert_eq!(
            tree.value_in_range(range, Some(LineEnding::Lf)).unwrap(),
            b"a\nb\nc"
        );
        assert_eq!(
            tree.value_in_range(range, Some(LineEnding::Crlf)).unwrap(),
            b"a\r\nb\r\nc"
        );
    }

    #[test]
    fn test_lines_content() {
        let tree = tree_from(b"a\nb\r\nc");
        assert_eq!(tree.lines_content(), vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec()]);
        let tree = tree_from(b"a\nb\n");
        assert_eq!(
            tree.lines_content(),
            vec![b"a".to_vec(), b"b".to_vec(), b"".to_vec()]
        );
        assert_eq!(tree.lines_content().len(), tree.line_count());
    }

    #[test]
    fn test_set_eol_rewrites_terminators() {
        let mut tree = tree_from(b"a\nb\rc\r\nd");
        tree.set_eol(LineEnding::Crlf);
        assert_eq!(tree.value(), b"a\r\nb\r\nc\r\nd");
        assert_eq!(tree.eol(), LineEnding::Crlf);
        assert_eq!(tree.line_count(), 4);
        assert_invariants(&tree);

        // Same flavor twice is a content no-op.
        let before = tree.value();
        tree.set_eol(LineEnding::Crlf);
        assert_eq!(tree.value(), before);

        tree.set_eol(LineEnding::Lf);
        assert_eq!(tree.value(), b"a\nb\nc\nd");
        assert_invariants(&tree);
    }

    #[test]
    fn test_line_char_code() {
        let tree = tree_from(b"ab\ncd");
        assert_eq!(tree.line_char_code(1, 0).unwrap(), b'a');
        assert_eq!(tree.line_char_code(1, 1).unwrap(), b'b');
        assert_eq!(tree.line_char_code(2, 1).unwrap(), b'd');
        assert!(tree.line_char_code(9, 0).is_err());
    }

    #[test]
    fn test_equal() {
        let a = tree_from(b"same content\nhere");
        let mut b = PieceTree::new(Vec::new(), LineEnding::Lf, true);
        b.insert(0, b"here", false);
        b.insert(0, b"same content\n", false);
        assert!(a.equal(&b));
        b.insert(0, b"x", false);
        assert!(!a.equal(&b));
    }

    #[test]
    fn test_snapshot_isolation() {
        let mut tree = tree_from(b"First line\nSecond line\nThird line");
        let mut snapshot = tree.create_snapshot(b"");
        tree.insert(0, b"X", false);
        tree.delete(0, 5);

        let mut restored = Vec::new();
        loop {
            let chunk = snapshot.read();
            if chunk.is_empty() {
                break;
            }
            restored.extend_from_slice(&chunk);
        }
        assert_eq!(restored, b"First line\nSecond line\nThird line");
    }

    #[test]
    fn test_snapshot_survives_change_buffer_growth() {
        let mut tree = PieceTree::new(Vec::new(), LineEnding::Lf, true);
        tree.insert(0, b"abc", true);
        let mut snapshot = tree.create_snapshot(b"");
        // Growing the change buffer must not disturb the pinned block.
        for i in 0..100 {
            tree.insert(3 + i, b"x", true);
        }
        let mut restored = Vec::new();
        loop {
            let chunk = snapshot.read();
            if chunk.is_empty() {
                break;
            }
            restored.extend_from_slice(&chunk);
        }
        assert_eq!(restored, b"abc");
    }

    #[test]
    fn test_random_edit_storm_stays_consistent() {
        // Deterministic mixed workload; the audit after every step is the
        // actual assertion.
        let mut tree = tree_from(b"seed content\nwith lines\r\nand more\r");
        let mut shadow = b"seed content\nwith lines\r\nand more\r".to_vec();
        let mut state: u64 = 0x853c49e6748fea9b;
        for round in 0..400 {
            state = state.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
            let choice = (state >> 33) as usize;
            if choice % 3 == 0 && !shadow.is_empty() {
                let offset = choice % shadow.len();
                let cnt = 1 + (choice / 7) % 5;
                let cnt = cnt.min(shadow.len() - offset);
                tree.delete(offset, cnt);
                shadow.drain(offset..offset + cnt);
            } else {
                let samples: [&[u8]; 6] =
                    [b"a", b"hello", b"\n", b"\r\n", b"x\ny", b"\r"];
                let text = samples[choice % samples.len()];
                let offset = if shadow.is_empty() { 0 } else { choice % (shadow.len() + 1) };
                tree.insert(offset, text, false);
                shadow.splice(offset..offset, text.iter().copied());
            }
            assert_eq!(tree.value(), shadow, "diverged at round {}", round);
            assert_eq!(tree.len(), shadow.len());
            assert_invariants(&tree);
        }
    }
}
