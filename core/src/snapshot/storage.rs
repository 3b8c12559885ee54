//! Tick-ordered snapshot history.

use std::collections::VecDeque;

/// A stored snapshot with its tick and receive time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredSnapshot {
    pub tick: i32,
    pub tagtime: i64,
    pub snap: Vec<u8>,
    pub alt_snap: Option<Vec<u8>>,
}

/// Snapshots in insertion order, oldest first.
///
/// Callers insert in increasing tick order; lookups scan linearly.
#[derive(Debug, Clone, Default)]
pub struct SnapshotStorage {
    entries: VecDeque<StoredSnapshot>,
}

impl SnapshotStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store copies of `snap` and `alt_snap`; an empty alternate is not kept.
    pub fn add(&mut self, tick: i32, tagtime: i64, snap: &[u8], alt_snap: &[u8]) {
        self.entries.push_back(StoredSnapshot {
            tick,
            tagtime,
            snap: snap.to_vec(),
            alt_snap: (!alt_snap.is_empty()).then(|| alt_snap.to_vec()),
        });
    }

    pub fn get(&self, tick: i32) -> Option<&StoredSnapshot> {
        self.entries.iter().find(|entry| entry.tick == tick)
    }

    /// Drop every snapshot older than `tick`, stopping at the first one
    /// that is not.
    pub fn purge_until(&mut self, tick: i32) {
        while self.entries.front().is_some_and(|entry| entry.tick < tick) {
            self.entries.pop_front();
        }
    }

    pub fn purge_all(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn first(&self) -> Option<&StoredSnapshot> {
        self.entries.front()
    }

    pub fn last(&self) -> Option<&StoredSnapshot> {
        self.entries.back()
    }
}
