//! Duplicate suppression: the first-seen cache of message tags.
//!
//! Entries expire by the tag's *embedded* timestamp, not by when the tag
//! was received. A peer whose clock runs behind can therefore have its
//! messages evicted early, and a message delayed past `dup_time` is never
//! suppressed. All nodes age tags the same way, so they agree on what counts
//! as a duplicate.

use std::collections::HashSet;

use crate::message::Tag;

/// Default suppression window in seconds.
pub const DEFAULT_DUP_TIME: f64 = 10.0;

#[derive(Debug)]
pub struct RecentSet {
    seen: HashSet<Tag>,
    dup_time: f64,
}

impl RecentSet {
    pub fn new(dup_time: f64) -> Self {
        Self {
            seen: HashSet::new(),
            dup_time,
        }
    }

    /// Whether `tag` was seen within the window ending at `now`.
    pub fn is_duplicate_at(&mut self, tag: &Tag, now: f64) -> bool {
        self.prune_at(now);
        self.seen.contains(tag)
    }

    /// Record `tag` as seen at `now`.
    pub fn mark_seen_at(&mut self, tag: &Tag, now: f64) {
        self.prune_at(now);
        self.seen.insert(tag.clone());
    }

    /// Drop every tag older than the window.
    pub fn prune_at(&mut self, now: f64) {
        let dup_time = self.dup_time;
        self.seen.retain(|tag| tag.age_at(now) <= dup_time);
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }
}

impl Default for RecentSet {
    fn default() -> Self {
        Self::new(DEFAULT_DUP_TIME)
    }
}
