//! Bounded, de-duplicated, recency-ordered working set of feed entries.
use chrono::{DateTime, Utc};
use std::collections::HashSet;
use tracing::debug;

use crate::model::{feed_order, Entry};

#[derive(Debug, Clone)]
pub struct MergeBuffer {
    entries: Vec<Entry>,
    identities: HashSet<String>,
    max_size: usize,
    evicted: usize,
}

impl MergeBuffer {
    pub fn new(max_size: usize) -> Self {
        Self {
            entries: Vec::new(),
            identities: HashSet::new(),
            max_size: max_size.max(1),
            evicted: 0,
        }
    }

    /// Replace the buffer wholesale with a de-duplicated, sorted snapshot.
    pub fn seed(&mut self, entries: Vec<Entry>) -> usize {
        self.reset();
        self.merge(entries)
    }

    /// Merge a page of older entries fetched by pagination.
    pub fn append(&mut self, entries: Vec<Entry>) -> usize {
        self.merge(entries)
    }

    /// Merge newer entries discovered by a refresh.
    pub fn prepend(&mut self, entries: Vec<Entry>) -> usize {
        self.merge(entries)
    }

    /// Drop tail entries until the buffer fits `max_size`.
    pub fn evict_to_capacity(&mut self) -> usize {
        if self.entries.len() <= self.max_size {
            return 0;
        }
        let dropped: Vec<Entry> = self.entries.drain(self.max_size..).collect();
        for entry in &dropped {
            self.identities.remove(&entry.identity);
        }
        self.evicted += dropped.len();
        debug!(dropped = dropped.len(), max_size = self.max_size, "evicted oldest entries");
        dropped.len()
    }

    pub fn reset(&mut self) {
        self.entries.clear();
        self.identities.clear();
        self.evicted = 0;
    }

    pub fn entries(&self) -> &[Entry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn max_size(&self) -> usize {
        self.max_size
    }

    pub fn contains(&self, identity: &str) -> bool {
        self.identities.contains(identity)
    }

    pub fn identities(&self) -> Vec<String> {
        self.entries.iter().map(|e| e.identity.clone()).collect()
    }

    pub fn newest_published_at(&self) -> Option<DateTime<Utc>> {
        self.entries.first().map(|e| e.published_at)
    }

    /// Number of feed positions this buffer has consumed from the server:
    /// live entries plus evicted ones. Pagination anchors its offset here.
    pub fn consumed(&self) -> usize {
        self.entries.len() + self.evicted
    }

    /// Insert every entry whose identity is not yet present, keeping feed
    /// order, then evict. Returns the number of entries that survived dedup.
    fn merge(&mut self, entries: Vec<Entry>) -> usize {
        let mut incoming: Vec<Entry> = Vec::with_capacity(entries.len());
        for entry in entries {
            assert!(
                !entry.identity.is_empty(),
                "entry merged into buffer without identity"
            );
            if self.identities.insert(entry.identity.clone()) {
                incoming.push(entry);
            }
        }
        let inserted = incoming.len();
        if inserted > 0 {
            incoming.sort_by(feed_order);
            let existing = std::mem::take(&mut self.entries);
            self.entries = merge_sorted(existing, incoming);
        }
        self.evict_to_capacity();
        inserted
    }
}

fn merge_sorted(left: Vec<Entry>, right: Vec<Entry>) -> Vec<Entry> {
    let mut out = Vec::with_capacity(left.len() + right.len());
    let mut left = left.into_iter().peekable();
    let mut right = right.into_iter().peekable();
    loop {
        let take_left = match (left.peek(), right.peek()) {
            (Some(l), Some(r)) => feed_order(l, r).is_le(),
            (Some(_), None) => true,
            (None, Some(_)) => false,
            (None, None) => break,
        };
        let next = if take_left { left.next() } else { right.next() };
        out.extend(next);
    }
    out
}
