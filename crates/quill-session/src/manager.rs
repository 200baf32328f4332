//! Session & Snapshot Manager

use crate::store::{MemorySessionStore, MemorySnapshotStore, SessionEntry, SessionStore, SnapshotStore};
use crate::{
    Quota, Result, Session, SessionConfig, SessionError, SessionState, SessionStats, Snapshot,
    SnapshotMetadata, UndoOutcome,
};
use quill_core::{duration_ms, identity_hash, new_id, DslDocument, SharedClock};
use quill_security::AuditLog;
use serde_json::json;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Owns session lifecycle and per-session snapshot history
pub struct SessionManager {
    config: SessionConfig,
    sessions: Arc<dyn SessionStore>,
    snapshots: Arc<dyn SnapshotStore>,
    audit: Arc<AuditLog>,
    clock: SharedClock,

    sessions_created: AtomicU64,
    sessions_expired: AtomicU64,
    sessions_destroyed: AtomicU64,
    sessions_discarded: AtomicU64,
    snapshots_created: AtomicU64,
    snapshots_evicted: AtomicU64,
}

/// How `create_or_get` treated a presented session id
enum Lookup {
    Reused(Session),
    Expired,
    Mismatch,
    Missing,
}

impl SessionManager {
    pub fn new(
        config: SessionConfig,
        sessions: Arc<dyn SessionStore>,
        snapshots: Arc<dyn SnapshotStore>,
        audit: Arc<AuditLog>,
        clock: SharedClock,
    ) -> Self {
        Self {
            config,
            sessions,
            snapshots,
            audit,
            clock,
            sessions_created: AtomicU64::new(0),
            sessions_expired: AtomicU64::new(0),
            sessions_destroyed: AtomicU64::new(0),
            sessions_discarded: AtomicU64::new(0),
            snapshots_created: AtomicU64::new(0),
            snapshots_evicted: AtomicU64::new(0),
        }
    }

    /// Manager over fresh in-memory stores
    pub fn in_memory(config: SessionConfig, audit: Arc<AuditLog>, clock: SharedClock) -> Self {
        Self::new(
            config,
            Arc::new(MemorySessionStore::new()),
            Arc::new(MemorySnapshotStore::new()),
            audit,
            clock,
        )
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    fn ttl_ms(&self) -> i64 {
        duration_ms(Duration::from_secs(self.config.ttl_secs))
    }

    /// Reuse a live session presented by the same identity, or start a new one
    pub fn create_or_get(&self, session_id: Option<&str>, ip: &str, user_agent: &str) -> Session {
        let hash = identity_hash(ip, user_agent);
        let now = self.clock.now_ms();

        if let Some(id) = session_id {
            match self.lookup(id, &hash, now) {
                Lookup::Reused(session) => return session,
                Lookup::Expired => self.evict(id, now),
                Lookup::Mismatch => {
                    self.audit.warning(
                        "session_identity_mismatch",
                        Some(id),
                        json!({ "presented_session": id }),
                    );
                }
                Lookup::Missing => {
                    tracing::debug!("Unknown session {} presented, issuing a new one", id);
                }
            }
        }

        self.create(hash, now)
    }

    fn lookup(&self, id: &str, hash: &str, now: i64) -> Lookup {
        let mut lookup = Lookup::Missing;
        self.sessions.update(id, &mut |entry| {
            lookup = if entry.session.is_expired(now) {
                Lookup::Expired
            } else if entry.session.identity_hash != hash {
                Lookup::Mismatch
            } else {
                entry.session.quota.request_count += 1;
                Lookup::Reused(entry.session.clone())
            };
        });
        lookup
    }

    fn create(&self, identity_hash: String, now: i64) -> Session {
        let session = Session {
            id: new_id("sess"),
            identity_hash,
            created_at: now,
            ttl_at: now + self.ttl_ms(),
            quota: Quota {
                request_count: 1,
                transform_count: 0,
            },
        };

        self.sessions.insert(SessionEntry::new(session.clone()));
        self.sessions_created.fetch_add(1, Ordering::Relaxed);
        self.audit.info(
            "session_created",
            Some(&session.id),
            json!({ "ttl_at": session.ttl_at }),
        );
        tracing::info!("Session {} created", session.id);

        session
    }

    /// Run `f` on a live session, evicting it instead if it has expired
    fn with_live<R>(
        &self,
        session_id: &str,
        mut f: impl FnMut(&mut SessionEntry, i64) -> R,
    ) -> Result<R> {
        let now = self.clock.now_ms();
        let mut expired = false;
        let mut result = None;

        let found = self.sessions.update(session_id, &mut |entry| {
            if entry.session.is_expired(now) {
                expired = true;
            } else {
                result = Some(f(entry, now));
            }
        });

        if !found {
            return Err(SessionError::NotFound(session_id.to_string()));
        }
        if expired {
            self.evict(session_id, now);
            return Err(SessionError::Expired(session_id.to_string()));
        }
        result.ok_or_else(|| SessionError::NotFound(session_id.to_string()))
    }

    /// Slide the expiry forward
    pub fn renew(&self, session_id: &str) -> Result<Session> {
        let ttl = self.ttl_ms();
        self.with_live(session_id, |entry, now| {
            entry.session.ttl_at = now + ttl;
            entry.session.clone()
        })
    }

    /// Append an accepted document to the session's history
    pub fn create_snapshot(
        &self,
        session_id: &str,
        dsl: DslDocument,
        note: Option<String>,
    ) -> Result<Snapshot> {
        let now = self.clock.now_ms();
        let snapshot = Snapshot {
            id: new_id("snap"),
            session_id: session_id.to_string(),
            dsl,
            metadata: SnapshotMetadata {
                timestamp: now,
                note,
            },
            created_at: now,
        };

        // Stored before it becomes reachable from the history
        self.snapshots.insert(snapshot.clone());

        let ttl = self.ttl_ms();
        let cap = self.config.max_history;
        let snapshot_id = snapshot.id.clone();
        let evicted = self.with_live(session_id, |entry, now| {
            entry.history.push_back(snapshot_id.clone());
            let mut evicted = Vec::new();
            while entry.history.len() > cap {
                if let Some(oldest) = entry.history.pop_front() {
                    evicted.push(oldest);
                }
            }
            entry.session.ttl_at = now + ttl;
            entry.session.quota.transform_count += 1;
            evicted
        });

        let evicted = match evicted {
            Ok(evicted) => evicted,
            Err(e) => {
                self.snapshots.remove(&snapshot.id);
                return Err(e);
            }
        };

        for id in &evicted {
            self.snapshots.remove(id);
        }
        self.snapshots_created.fetch_add(1, Ordering::Relaxed);
        self.snapshots_evicted
            .fetch_add(evicted.len() as u64, Ordering::Relaxed);

        self.audit.info(
            "snapshot_created",
            Some(session_id),
            json!({
                "snapshot_id": snapshot.id,
                "changes": snapshot.dsl.len(),
                "evicted": evicted,
            }),
        );

        Ok(snapshot)
    }

    /// Detach up to `steps` snapshots from the tail of the history
    pub fn undo(&self, session_id: &str, steps: usize) -> Result<UndoOutcome> {
        let ttl = self.ttl_ms();
        let cap = self.config.max_detached;
        let (removed, purged, current_id) = self.with_live(session_id, |entry, now| {
            let n = steps.min(entry.history.len());
            let removed: Vec<String> = (0..n).filter_map(|_| entry.history.pop_back()).collect();
            let purged = entry.detach(&removed, cap);
            entry.session.ttl_at = now + ttl;
            (removed, purged, entry.history.back().cloned())
        })?;
        self.purge_detached(&purged);

        self.audit.info(
            "snapshot_undone",
            Some(session_id),
            json!({
                "steps": steps,
                "removed": removed,
                "current": current_id,
                "purged": purged,
            }),
        );

        Ok(UndoOutcome {
            removed,
            current: current_id.and_then(|id| self.snapshots.get(&id)),
        })
    }

    /// Detach the whole history
    pub fn reset_to_initial(&self, session_id: &str) -> Result<UndoOutcome> {
        let ttl = self.ttl_ms();
        let cap = self.config.max_detached;
        let (removed, purged) = self.with_live(session_id, |entry, now| {
            let removed: Vec<String> = entry.history.drain(..).rev().collect();
            let purged = entry.detach(&removed, cap);
            entry.session.ttl_at = now + ttl;
            (removed, purged)
        })?;
        self.purge_detached(&purged);

        self.audit.info(
            "session_reset",
            Some(session_id),
            json!({ "removed": removed, "purged": purged }),
        );

        Ok(UndoOutcome {
            removed,
            current: None,
        })
    }

    fn purge_detached(&self, ids: &[String]) {
        for id in ids {
            self.snapshots.remove(id);
        }
        self.snapshots_evicted
            .fetch_add(ids.len() as u64, Ordering::Relaxed);
    }

    pub fn get_state(&self, session_id: &str) -> Result<SessionState> {
        self.with_live(session_id, |entry, now| SessionState {
            session_id: entry.session.id.clone(),
            snapshot_count: entry.history.len(),
            current_snapshot_id: entry.history.back().cloned(),
            ttl_remaining_ms: entry.session.ttl_remaining_ms(now),
            can_undo: !entry.history.is_empty(),
            quota: entry.session.quota,
        })
    }

    /// Live session by id
    pub fn session(&self, session_id: &str) -> Result<Session> {
        self.with_live(session_id, |entry, _| entry.session.clone())
    }

    /// Active history, oldest first
    pub fn history(&self, session_id: &str) -> Result<Vec<Snapshot>> {
        let ids = self.with_live(session_id, |entry, _| {
            entry.history.iter().cloned().collect::<Vec<_>>()
        })?;
        Ok(ids
            .iter()
            .filter_map(|id| self.snapshots.get(id))
            .collect())
    }

    /// Any stored snapshot, including detached ones
    pub fn snapshot(&self, snapshot_id: &str) -> Option<Snapshot> {
        self.snapshots.get(snapshot_id)
    }

    /// Remove a session and all of its snapshots
    pub fn destroy(&self, session_id: &str) -> bool {
        match self.sessions.remove(session_id) {
            Some(_) => {
                let deleted = self.snapshots.remove_by_session(session_id);
                self.sessions_destroyed.fetch_add(1, Ordering::Relaxed);
                self.audit.info(
                    "session_destroyed",
                    Some(session_id),
                    json!({ "snapshots_deleted": deleted }),
                );
                true
            }
            None => false,
        }
    }

    /// Drop a session that never recorded a snapshot
    ///
    /// Used when the request that created it was rejected, so the id was
    /// never handed to a client.
    pub fn discard_unused(&self, session_id: &str) -> bool {
        if self
            .sessions
            .remove_if(session_id, &|entry| entry.is_unused())
            .is_none()
        {
            return false;
        }

        self.sessions_discarded.fetch_add(1, Ordering::Relaxed);
        self.audit
            .info("session_discarded", Some(session_id), json!({}));
        tracing::debug!("Session {} discarded", session_id);
        true
    }

    fn evict(&self, session_id: &str, now: i64) {
        if self
            .sessions
            .remove_if(session_id, &|entry| entry.session.is_expired(now))
            .is_some()
        {
            self.finish_eviction(session_id);
        }
    }

    fn finish_eviction(&self, session_id: &str) {
        let deleted = self.snapshots.remove_by_session(session_id);
        self.sessions_expired.fetch_add(1, Ordering::Relaxed);
        self.audit.info(
            "session_expired",
            Some(session_id),
            json!({ "snapshots_deleted": deleted }),
        );
        tracing::info!("Session {} expired", session_id);
    }

    /// Evict every expired session; returns how many were removed
    pub fn sweep_expired(&self) -> usize {
        let now = self.clock.now_ms();
        let removed = self.sessions.retain(&|entry| !entry.session.is_expired(now));
        for entry in &removed {
            self.finish_eviction(&entry.session.id);
        }
        removed.len()
    }

    pub fn stats(&self) -> SessionStats {
        SessionStats {
            active_sessions: self.sessions.len(),
            stored_snapshots: self.snapshots.len(),
            sessions_created: self.sessions_created.load(Ordering::Relaxed),
            sessions_expired: self.sessions_expired.load(Ordering::Relaxed),
            sessions_destroyed: self.sessions_destroyed.load(Ordering::Relaxed),
            sessions_discarded: self.sessions_discarded.load(Ordering::Relaxed),
            snapshots_created: self.snapshots_created.load(Ordering::Relaxed),
            snapshots_evicted: self.snapshots_evicted.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use quill_core::{Change, Clock, ManualClock};
    use quill_security::AuditConfig;

    const IP: &str = "203.0.113.7";
    const UA: &str = "Mozilla/5.0";

    fn manager(config: SessionConfig) -> (SessionManager, Arc<ManualClock>, Arc<AuditLog>) {
        let clock = Arc::new(ManualClock::new(1_700_000_000_000));
        let audit = Arc::new(AuditLog::new(AuditConfig::default(), clock.clone()));
        let manager = SessionManager::in_memory(config, audit.clone(), clock.clone());
        (manager, clock, audit)
    }

    fn doc(text: &str) -> DslDocument {
        DslDocument::new(vec![Change::SetText {
            selector: "#main-title".to_string(),
            text: text.to_string(),
        }])
    }

    #[test]
    fn test_create_then_reuse() {
        let (manager, _, audit) = manager(SessionConfig::default());

        let session = manager.create_or_get(None, IP, UA);
        assert_eq!(session.quota.request_count, 1);
        assert_eq!(session.ttl_at - session.created_at, 30 * 60 * 1000);

        let again = manager.create_or_get(Some(&session.id), IP, UA);
        assert_eq!(again.id, session.id);
        assert_eq!(again.quota.request_count, 2);
        assert_eq!(audit.by_event("session_created").len(), 1);
    }

    #[test]
    fn test_identity_mismatch_issues_new_session() {
        let (manager, _, audit) = manager(SessionConfig::default());
        let session = manager.create_or_get(None, IP, UA);

        let other = manager.create_or_get(Some(&session.id), "198.51.100.1", UA);
        assert_ne!(other.id, session.id);
        assert_eq!(audit.by_event("session_identity_mismatch").len(), 1);
        assert_eq!(manager.stats().active_sessions, 2);
    }

    #[test]
    fn test_unknown_id_issues_new_session() {
        let (manager, _, _) = manager(SessionConfig::default());
        let session = manager.create_or_get(Some("sess_forged"), IP, UA);
        assert_ne!(session.id, "sess_forged");
    }

    #[test]
    fn test_expired_session_evicted_with_history() {
        let (manager, clock, audit) = manager(SessionConfig::default());
        let session = manager.create_or_get(None, IP, UA);
        let snap = manager.create_snapshot(&session.id, doc("a"), None).unwrap();

        clock.advance(Duration::from_secs(30 * 60));
        assert_eq!(
            manager.get_state(&session.id),
            Err(SessionError::Expired(session.id.clone()))
        );
        assert!(manager.snapshot(&snap.id).is_none());
        assert_eq!(
            manager.get_state(&session.id),
            Err(SessionError::NotFound(session.id.clone()))
        );
        assert_eq!(audit.by_event("session_expired").len(), 1);

        let fresh = manager.create_or_get(Some(&session.id), IP, UA);
        assert_ne!(fresh.id, session.id);
    }

    #[test]
    fn test_renew_slides_expiry() {
        let (manager, clock, _) = manager(SessionConfig::default());
        let session = manager.create_or_get(None, IP, UA);

        clock.advance(Duration::from_secs(20 * 60));
        let renewed = manager.renew(&session.id).unwrap();
        assert_eq!(renewed.ttl_at, clock.now_ms() + 30 * 60 * 1000);

        clock.advance(Duration::from_secs(20 * 60));
        assert!(manager.get_state(&session.id).is_ok());
    }

    #[test]
    fn test_undo_returns_prior_snapshot() {
        let (manager, _, _) = manager(SessionConfig::default());
        let session = manager.create_or_get(None, IP, UA);

        let first = manager.create_snapshot(&session.id, doc("a"), None).unwrap();
        let second = manager
            .create_snapshot(&session.id, doc("b"), Some("second".to_string()))
            .unwrap();

        let outcome = manager.undo(&session.id, 1).unwrap();
        assert_eq!(outcome.removed, vec![second.id.clone()]);
        assert_eq!(outcome.current, Some(first.clone()));

        // Detached but retained
        assert_eq!(manager.snapshot(&second.id), Some(second));

        let outcome = manager.undo(&session.id, 5).unwrap();
        assert_eq!(outcome.removed, vec![first.id]);
        assert_eq!(outcome.current, None);

        let state = manager.get_state(&session.id).unwrap();
        assert!(!state.can_undo);
        assert_eq!(state.snapshot_count, 0);
    }

    #[test]
    fn test_reset_to_initial() {
        let (manager, _, audit) = manager(SessionConfig::default());
        let session = manager.create_or_get(None, IP, UA);
        let a = manager.create_snapshot(&session.id, doc("a"), None).unwrap();
        let b = manager.create_snapshot(&session.id, doc("b"), None).unwrap();

        let outcome = manager.reset_to_initial(&session.id).unwrap();
        assert_eq!(outcome.removed, vec![b.id, a.id]);
        assert!(outcome.current.is_none());
        assert!(manager.history(&session.id).unwrap().is_empty());
        assert_eq!(audit.by_event("session_reset").len(), 1);
    }

    #[test]
    fn test_history_cap_evicts_oldest() {
        let (manager, _, _) = manager(SessionConfig {
            max_history: 2,
            ..Default::default()
        });
        let session = manager.create_or_get(None, IP, UA);

        let a = manager.create_snapshot(&session.id, doc("a"), None).unwrap();
        let b = manager.create_snapshot(&session.id, doc("b"), None).unwrap();
        let c = manager.create_snapshot(&session.id, doc("c"), None).unwrap();

        let history: Vec<_> = manager
            .history(&session.id)
            .unwrap()
            .into_iter()
            .map(|s| s.id)
            .collect();
        assert_eq!(history, vec![b.id, c.id]);
        assert!(manager.snapshot(&a.id).is_none());
        assert_eq!(manager.stats().snapshots_evicted, 1);

        let state = manager.get_state(&session.id).unwrap();
        assert_eq!(state.quota.transform_count, 3);
    }

    #[test]
    fn test_snapshot_on_missing_session_is_discarded() {
        let (manager, _, _) = manager(SessionConfig::default());
        assert_eq!(
            manager.create_snapshot("sess_none", doc("a"), None),
            Err(SessionError::NotFound("sess_none".to_string()))
        );
        assert_eq!(manager.stats().stored_snapshots, 0);
    }

    #[test]
    fn test_destroy_and_sweep() {
        let (manager, clock, _) = manager(SessionConfig::default());
        let a = manager.create_or_get(None, IP, UA);
        let b = manager.create_or_get(None, IP, UA);
        manager.create_snapshot(&b.id, doc("x"), None).unwrap();

        assert!(manager.destroy(&a.id));
        assert!(!manager.destroy(&a.id));

        clock.advance(Duration::from_secs(31 * 60));
        assert_eq!(manager.sweep_expired(), 1);

        let stats = manager.stats();
        assert_eq!(stats.active_sessions, 0);
        assert_eq!(stats.stored_snapshots, 0);
        assert_eq!(stats.sessions_destroyed, 1);
        assert_eq!(stats.sessions_expired, 1);
    }

    #[test]
    fn test_detached_snapshots_are_bounded() {
        let (manager, _, audit) = manager(SessionConfig {
            max_detached: 2,
            ..Default::default()
        });
        let session = manager.create_or_get(None, IP, UA);

        // Alternate transform and undo; only the last two undone survive
        let mut undone = Vec::new();
        for i in 0..6 {
            let snap = manager
                .create_snapshot(&session.id, doc(&i.to_string()), None)
                .unwrap();
            manager.undo(&session.id, 1).unwrap();
            undone.push(snap.id);
        }

        assert_eq!(manager.stats().stored_snapshots, 2);
        assert_eq!(manager.stats().snapshots_evicted, 4);
        assert!(manager.snapshot(&undone[3]).is_none());
        assert!(manager.snapshot(&undone[4]).is_some());
        assert!(manager.snapshot(&undone[5]).is_some());

        let last = audit.by_event("snapshot_undone").pop().unwrap();
        assert_eq!(last.data["purged"], serde_json::json!([undone[3]]));
    }

    #[test]
    fn test_reset_respects_detached_cap() {
        let (manager, _, _) = manager(SessionConfig {
            max_detached: 1,
            ..Default::default()
        });
        let session = manager.create_or_get(None, IP, UA);
        let a = manager.create_snapshot(&session.id, doc("a"), None).unwrap();
        let b = manager.create_snapshot(&session.id, doc("b"), None).unwrap();

        manager.reset_to_initial(&session.id).unwrap();
        // Detached newest first, so the oldest snapshot is the one kept
        assert!(manager.snapshot(&b.id).is_none());
        assert!(manager.snapshot(&a.id).is_some());
    }

    #[test]
    fn test_discard_unused_only_drops_fresh_sessions() {
        let (manager, _, audit) = manager(SessionConfig::default());
        let fresh = manager.create_or_get(None, IP, UA);
        let used = manager.create_or_get(None, IP, UA);
        manager.create_snapshot(&used.id, doc("a"), None).unwrap();
        manager.undo(&used.id, 1).unwrap();

        assert!(manager.discard_unused(&fresh.id));
        assert!(!manager.discard_unused(&fresh.id));
        assert!(!manager.discard_unused(&used.id));

        assert!(manager.session(&used.id).is_ok());
        let stats = manager.stats();
        assert_eq!(stats.active_sessions, 1);
        assert_eq!(stats.sessions_discarded, 1);
        assert_eq!(audit.by_event("session_discarded").len(), 1);
    }

    proptest! {
        #[test]
        fn prop_history_never_exceeds_cap(cap in 1usize..8, pushes in 0usize..20, undo in 0usize..4) {
            let (manager, _, _) = manager(SessionConfig { max_history: cap, ..Default::default() });
            let session = manager.create_or_get(None, IP, UA);

            let mut created = Vec::new();
            for i in 0..pushes {
                let snap = manager.create_snapshot(&session.id, doc(&i.to_string()), None).unwrap();
                created.push(snap.id);
                let state = manager.get_state(&session.id).unwrap();
                prop_assert!(state.snapshot_count <= cap);
            }

            let expected: Vec<_> = created.iter().skip(pushes.saturating_sub(cap)).cloned().collect();
            let history: Vec<_> = manager.history(&session.id).unwrap().into_iter().map(|s| s.id).collect();
            prop_assert_eq!(&history, &expected);

            let outcome = manager.undo(&session.id, undo).unwrap();
            prop_assert_eq!(outcome.removed.len(), undo.min(expected.len()));
            let remaining = expected.len() - outcome.removed.len();
            prop_assert_eq!(
                outcome.current.map(|s| s.id),
                remaining.checked_sub(1).map(|i| expected[i].clone())
            );
        }
    }
}
