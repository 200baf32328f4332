//! Ban records and storage

use dashmap::DashMap;
use serde::{Deserialize, Serialize};

/// Who placed a ban
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BanSource {
    /// Escalation after repeated rate-limit violations
    Automatic,
    /// Placed by an operator
    Admin,
}

/// An active or expired ban on one limit key
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BanRecord {
    pub reason: String,
    pub banned_at: i64,
    /// `None` for a permanent ban
    pub expires_at: Option<i64>,
    pub source: BanSource,
}

impl BanRecord {
    pub fn is_permanent(&self) -> bool {
        self.expires_at.is_none()
    }

    pub fn is_active(&self, now: i64) -> bool {
        match self.expires_at {
            Some(expires_at) => now < expires_at,
            None => true,
        }
    }
}

/// Keyed storage for bans
pub trait BanStore: Send + Sync {
    fn get(&self, key: &str) -> Option<BanRecord>;

    /// Insert or replace; returns the previous record
    fn insert(&self, key: &str, record: BanRecord) -> Option<BanRecord>;

    fn remove(&self, key: &str) -> Option<BanRecord>;

    /// Remove the record only if `predicate` holds, atomically for that key
    fn remove_if(&self, key: &str, predicate: &dyn Fn(&BanRecord) -> bool) -> Option<BanRecord>;

    fn list(&self) -> Vec<(String, BanRecord)>;

    /// Drop records for which `keep` returns false and return them
    fn retain(&self, keep: &dyn Fn(&BanRecord) -> bool) -> Vec<(String, BanRecord)>;
}

/// In-memory ban store backed by a `DashMap`
#[derive(Debug, Default)]
pub struct MemoryBanStore {
    bans: DashMap<String, BanRecord>,
}

impl MemoryBanStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl BanStore for MemoryBanStore {
    fn get(&self, key: &str) -> Option<BanRecord> {
        self.bans.get(key).map(|r| r.clone())
    }

    fn insert(&self, key: &str, record: BanRecord) -> Option<BanRecord> {
        self.bans.insert(key.to_string(), record)
    }

    fn remove(&self, key: &str) -> Option<BanRecord> {
        self.bans.remove(key).map(|(_, r)| r)
    }

    fn remove_if(&self, key: &str, predicate: &dyn Fn(&BanRecord) -> bool) -> Option<BanRecord> {
        self.bans
            .remove_if(key, |_, record| predicate(record))
            .map(|(_, r)| r)
    }

    fn list(&self) -> Vec<(String, BanRecord)> {
        let mut bans: Vec<_> = self
            .bans
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();
        bans.sort_by(|a, b| a.0.cmp(&b.0));
        bans
    }

    fn retain(&self, keep: &dyn Fn(&BanRecord) -> bool) -> Vec<(String, BanRecord)> {
        let mut removed = Vec::new();
        self.bans.retain(|key, record| {
            if keep(record) {
                true
            } else {
                removed.push((key.clone(), record.clone()));
                false
            }
        });
        removed
    }
}
