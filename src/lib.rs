//! A piece-tree text buffer.
//!
//! A document is represented as a red-black tree of immutable *pieces*,
//! each describing a slice of an append-only byte buffer. Localized
//! insertions and deletions splice pieces instead of moving text, the
//! tree's augmented subtree sums answer offset and line queries in
//! O(log n), and because published bytes never move, a [`Snapshot`] is
//! just the frozen piece list, readable while edits continue.
//!
//! # Example
//!
//! ```
//! use piece_tree::{LineEnding, TextBuffer};
//!
//! let mut buffer = TextBuffer::from_str("Hello\nWorld", LineEnding::Lf);
//! buffer.insert(5, ", dear");
//! assert_eq!(buffer.value(), b"Hello, dear\nWorld");
//! assert_eq!(buffer.line_count(), 2);
//! assert_eq!(buffer.line_content(2).unwrap(), b"World");
//!
//! let mut snapshot = buffer.create_snapshot(b"");
//! buffer.delete(0, 7);
//! // The snapshot still reads the pre-delete document.
//! let mut restored = Vec::new();
//! loop {
//!     let chunk = snapshot.read();
//!     if chunk.is_empty() {
//!         break;
//!     }
//!     restored.extend_from_slice(&chunk);
//! }
//! assert_eq!(restored, b"Hello, dear\nWorld");
//! ```
//!
//! Streamed construction goes through [`TextBufferBuilder`], which
//! tallies terminator flavors, strips a UTF-8 byte-order mark, and keeps
//! `\r\n` pairs and UTF-8 sequences whole across chunk boundaries.
//!
//! Positions are byte offsets; lines and columns are 1-based at this
//! surface. The structure is single-threaded: queries update internal
//! caches, so share a buffer across threads only behind a lock, or clone
//! it.

mod buffer;
mod builder;
mod cache;
mod error;
mod line_starts;
mod piece;
mod piece_tree;
mod snapshot;
mod text_buffer;
mod tree;

pub use buffer::{normalize_eol_bytes, BufferCursor, LineEnding, StringBuffer};
pub use builder::{TextBufferBuilder, TextBufferFactory, UTF8_BOM};
pub use error::TextBufferError;
pub use line_starts::{create_line_starts, create_line_starts_fast, LineStarts};
pub use piece::Piece;
pub use piece_tree::{PieceTree, Position, Range, AVERAGE_BUFFER_SIZE};
pub use snapshot::Snapshot;
pub use text_buffer::TextBuffer;
