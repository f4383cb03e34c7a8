//! Error types surfaced by the buffer's fallible queries.
//!
//! Most boundary conditions are clamped silently (inserting past the end
//! appends, deleting past the end truncates the count, and so on). The few
//! operations that validate their arguments report one of the variants
//! below through `anyhow::Result`, so callers can downcast when they need
//! to tell the cases apart.

/// Error raised by line-addressed queries and range extraction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TextBufferError {
    /// A line number outside `1..=line_count`.
    OutOfBounds { line: usize, line_count: usize },
    /// A range whose end precedes its start.
    InvalidRange {
        start_line: usize,
        start_column: usize,
        end_line: usize,
        end_column: usize,
    },
}

impl std::fmt::Display for TextBufferError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::OutOfBounds { line, line_count } => {
                write!(
                    f,
                    "line number {} is out of bounds (document has {} lines)",
                    line, line_count
                )
            }
            Self::InvalidRange {
                start_line,
                start_column,
                end_line,
                end_column,
            } => {
                write!(
                    f,
                    "range end ({}, {}) precedes range start ({}, {})",
                    end_line, end_column, start_line, start_column
                )
            }
        }
    }
}

impl std::error::Error for TextBufferError {}
