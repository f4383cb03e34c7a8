//! Advisory cache of recently resolved tree positions.
//!
//! Descending the tree for every query is O(log n); typing and sequential
//! line reads hit the same node over and over, so the last few resolved
//! nodes are kept here keyed by the document range they covered when
//! resolved. Misses and stale entries just fall through to a full
//! descent. Entries hold arena handles, and handles get recycled, so the
//! owning tree flushes the cache whenever nodes are freed.

use crate::tree::{NodeRef, RbTree};

#[derive(Debug, Clone, Copy)]
pub(crate) struct CacheEntry {
    pub(crate) node: NodeRef,
    pub(crate) node_start_offset: usize,
    /// Set only by line-addressed lookups.
    pub(crate) node_start_line_number: Option<usize>,
}

#[derive(Debug, Clone)]
pub(crate) struct SearchCache {
    limit: usize,
    entries: Vec<CacheEntry>,
}

impl SearchCache {
    pub(crate) fn new(limit: usize) -> Self {
        SearchCache {
            limit,
            entries: Vec::new(),
        }
    }

    /// Entry whose piece covered `offset` when it was cached.
    pub(crate) fn get(&self, offset: usize, tree: &RbTree) -> Option<CacheEntry> {
        self.entries.iter().rev().copied().find(|entry| {
            entry.node_start_offset <= offset
                && entry.node_start_offset + tree[entry.node].piece.length >= offset
        })
    }

    /// Node whose piece covered `line_number` (1-based) when cached, with
    /// the line number its first line had at that point.
    pub(crate) fn get_by_line(
        &self,
        line_number: usize,
        tree: &RbTree,
    ) -> Option<(NodeRef, usize)> {
        self.entries.iter().rev().find_map(|entry| {
            let start = entry.node_start_line_number?;
            if start < line_number && start + tree[entry.node].piece.line_feed_cnt >= line_number {
                Some((entry.node, start))
            } else {
                None
            }
        })
    }

    pub(crate) fn set(&mut self, entry: CacheEntry) {
        if self.entries.len() >= self.limit {
            self.entries.remove(0);
        }
        self.entries.push(entry);
    }

    /// Drop entries at or past an edit point; their recorded start
    /// offsets no longer mean anything.
    pub(crate) fn validate(&mut self, offset: usize) {
        self.entries.retain(|entry| entry.node_start_offset < offset);
    }

    pub(crate) fn flush(&mut self) {
        self.entries.clear();
    }
}
