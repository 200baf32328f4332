//! Session and snapshot storage
//!
//! A session's history is only mutated inside `SessionStore::update`, which
//! the in-memory store runs under the map's per-key lock.

use crate::{Session, Snapshot};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

/// A session plus its active history of snapshot ids, oldest first
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionEntry {
    pub session: Session,
    pub history: VecDeque<String>,
    /// Snapshots taken off the history by undo or reset, oldest detach first
    #[serde(default)]
    pub detached: VecDeque<String>,
}

impl SessionEntry {
    pub fn new(session: Session) -> Self {
        Self {
            session,
            history: VecDeque::new(),
            detached: VecDeque::new(),
        }
    }

    /// Move `ids` to the detached queue and return the ids pushed past `cap`
    pub fn detach(&mut self, ids: &[String], cap: usize) -> Vec<String> {
        self.detached.extend(ids.iter().cloned());
        let overflow = self.detached.len().saturating_sub(cap);
        self.detached.drain(..overflow).collect()
    }

    /// Nothing was ever recorded against this session
    pub fn is_unused(&self) -> bool {
        self.session.quota.transform_count == 0
            && self.history.is_empty()
            && self.detached.is_empty()
    }
}

pub trait SessionStore: Send + Sync {
    fn get(&self, id: &str) -> Option<SessionEntry>;

    fn insert(&self, entry: SessionEntry);

    /// Mutate one entry in place; returns false if it does not exist
    fn update(&self, id: &str, f: &mut dyn FnMut(&mut SessionEntry)) -> bool;

    fn remove(&self, id: &str) -> Option<SessionEntry>;

    fn remove_if(&self, id: &str, predicate: &dyn Fn(&SessionEntry) -> bool) -> Option<SessionEntry>;

    /// Drop entries for which `keep` returns false and return them
    fn retain(&self, keep: &dyn Fn(&SessionEntry) -> bool) -> Vec<SessionEntry>;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

pub trait SnapshotStore: Send + Sync {
    fn get(&self, id: &str) -> Option<Snapshot>;

    fn insert(&self, snapshot: Snapshot);

    fn remove(&self, id: &str) -> Option<Snapshot>;

    /// Delete every snapshot of a session, attached or detached
    fn remove_by_session(&self, session_id: &str) -> usize;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Default)]
pub struct MemorySessionStore {
    sessions: DashMap<String, SessionEntry>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SessionStore for MemorySessionStore {
    fn get(&self, id: &str) -> Option<SessionEntry> {
        self.sessions.get(id).map(|e| e.clone())
    }

    fn insert(&self, entry: SessionEntry) {
        self.sessions.insert(entry.session.id.clone(), entry);
    }

    fn update(&self, id: &str, f: &mut dyn FnMut(&mut SessionEntry)) -> bool {
        match self.sessions.get_mut(id) {
            Some(mut entry) => {
                f(entry.value_mut());
                true
            }
            None => false,
        }
    }

    fn remove(&self, id: &str) -> Option<SessionEntry> {
        self.sessions.remove(id).map(|(_, e)| e)
    }

    fn remove_if(&self, id: &str, predicate: &dyn Fn(&SessionEntry) -> bool) -> Option<SessionEntry> {
        self.sessions
            .remove_if(id, |_, entry| predicate(entry))
            .map(|(_, e)| e)
    }

    fn retain(&self, keep: &dyn Fn(&SessionEntry) -> bool) -> Vec<SessionEntry> {
        let mut removed = Vec::new();
        self.sessions.retain(|_, entry| {
            if keep(entry) {
                true
            } else {
                removed.push(entry.clone());
                false
            }
        });
        removed
    }

    fn len(&self) -> usize {
        self.sessions.len()
    }
}

#[derive(Debug, Default)]
pub struct MemorySnapshotStore {
    snapshots: DashMap<String, Snapshot>,
}

impl MemorySnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SnapshotStore for MemorySnapshotStore {
    fn get(&self, id: &str) -> Option<Snapshot> {
        self.snapshots.get(id).map(|s| s.clone())
    }

    fn insert(&self, snapshot: Snapshot) {
        self.snapshots.insert(snapshot.id.clone(), snapshot);
    }

    fn remove(&self, id: &str) -> Option<Snapshot> {
        self.snapshots.remove(id).map(|(_, s)| s)
    }

    fn remove_by_session(&self, session_id: &str) -> usize {
        let before = self.snapshots.len();
        self.snapshots.retain(|_, s| s.session_id != session_id);
        before.saturating_sub(self.snapshots.len())
    }

    fn len(&self) -> usize {
        self.snapshots.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Quota, SnapshotMetadata};
    use quill_core::{Change, DslDocument};

    fn entry(id: &str, ttl_at: i64) -> SessionEntry {
        SessionEntry::new(Session {
            id: id.to_string(),
            identity_hash: "h".to_string(),
            created_at: 0,
            ttl_at,
            quota: Quota::default(),
        })
    }

    fn snapshot(id: &str, session_id: &str) -> Snapshot {
        Snapshot {
            id: id.to_string(),
            session_id: session_id.to_string(),
            dsl: DslDocument::new(vec![Change::Toggle {
                selector: "#banner".to_string(),
                visible: true,
            }]),
            metadata: SnapshotMetadata::default(),
            created_at: 0,
        }
    }

    #[test]
    fn test_session_update_in_place() {
        let store = MemorySessionStore::new();
        store.insert(entry("a", 10));

        assert!(store.update("a", &mut |e| e.history.push_back("snap_1".to_string())));
        assert!(!store.update("missing", &mut |_| {}));
        assert_eq!(store.get("a").unwrap().history.len(), 1);
    }

    #[test]
    fn test_session_retain_and_remove_if() {
        let store = MemorySessionStore::new();
        store.insert(entry("a", 10));
        store.insert(entry("b", 100));

        assert!(store.remove_if("b", &|e| e.session.ttl_at < 50).is_none());
        let removed = store.retain(&|e| e.session.ttl_at >= 50);
        assert_eq!(removed.len(), 1);
        assert_eq!(removed[0].session.id, "a");
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_snapshot_remove_by_session() {
        let store = MemorySnapshotStore::new();
        store.insert(snapshot("s1", "a"));
        store.insert(snapshot("s2", "a"));
        store.insert(snapshot("s3", "b"));

        assert_eq!(store.remove_by_session("a"), 2);
        assert!(store.get("s3").is_some());
        assert_eq!(store.len(), 1);
    }
}
