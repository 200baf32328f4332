//! Rate-limit record storage
//!
//! The limiter never holds a record across calls; every read-modify-write
//! goes through `RateLimitStore::update`, which the in-memory store runs
//! under the map's per-key entry lock.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

/// Fixed-window counter for one key
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitRecord {
    /// Requests counted in the current window
    pub count: u32,

    /// Window start (Unix ms)
    pub window_start: i64,

    /// Windows in which the ceiling was exceeded; never reset by a new window
    pub violation_count: u32,

    /// Last time the key was seen (Unix ms)
    pub last_seen: i64,
}

impl RateLimitRecord {
    /// First request of a fresh key
    pub fn first(now: i64) -> Self {
        Self {
            count: 1,
            window_start: now,
            violation_count: 0,
            last_seen: now,
        }
    }
}

/// Keyed storage for rate-limit records
pub trait RateLimitStore: Send + Sync {
    /// Atomically read and rewrite one key. Setting the slot to `None`
    /// removes the record.
    fn update(&self, key: &str, f: &mut dyn FnMut(&mut Option<RateLimitRecord>));

    fn get(&self, key: &str) -> Option<RateLimitRecord>;

    fn remove(&self, key: &str) -> Option<RateLimitRecord>;

    /// Keep records for which `keep` returns true; returns how many were dropped
    fn retain(&self, keep: &mut dyn FnMut(&str, &RateLimitRecord) -> bool) -> usize;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// In-memory store backed by a `DashMap`
#[derive(Debug, Default)]
pub struct MemoryRateLimitStore {
    records: DashMap<String, RateLimitRecord>,
}

impl MemoryRateLimitStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl RateLimitStore for MemoryRateLimitStore {
    fn update(&self, key: &str, f: &mut dyn FnMut(&mut Option<RateLimitRecord>)) {
        match self.records.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => {
                let mut slot = Some(*occupied.get());
                f(&mut slot);
                match slot {
                    Some(record) => {
                        occupied.insert(record);
                    }
                    None => {
                        occupied.remove();
                    }
                }
            }
            Entry::Vacant(vacant) => {
                let mut slot = None;
                f(&mut slot);
                if let Some(record) = slot {
                    vacant.insert(record);
                }
            }
        }
    }

    fn get(&self, key: &str) -> Option<RateLimitRecord> {
        self.records.get(key).map(|r| *r)
    }

    fn remove(&self, key: &str) -> Option<RateLimitRecord> {
        self.records.remove(key).map(|(_, r)| r)
    }

    fn retain(&self, keep: &mut dyn FnMut(&str, &RateLimitRecord) -> bool) -> usize {
        let before = self.records.len();
        self.records.retain(|key, record| keep(key, record));
        before.saturating_sub(self.records.len())
    }

    fn len(&self) -> usize {
        self.records.len()
    }
}
