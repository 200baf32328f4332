//! Audit Log
//!
//! Bounded, append-only trail of security and session events. Payloads are
//! PII-masked before they are stored, and every entry is mirrored to
//! `tracing` at the matching level.

use crate::pii::PiiMasker;
use parking_lot::RwLock;
use quill_core::{SharedClock, SystemClock};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};

/// Severity of an audit event
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuditLevel {
    Info,
    Warning,
    Critical,
}

impl std::fmt::Display for AuditLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AuditLevel::Info => write!(f, "info"),
            AuditLevel::Warning => write!(f, "warning"),
            AuditLevel::Critical => write!(f, "critical"),
        }
    }
}

/// One stored audit event
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AuditLogEntry {
    /// Strictly increasing across the log's lifetime
    pub id: u64,
    pub level: AuditLevel,
    pub event: String,
    pub session_id: Option<String>,
    /// Redacted payload
    pub data: serde_json::Value,
    pub created_at: i64,
}

/// Audit log settings
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AuditConfig {
    /// Oldest entries are dropped past this size
    pub max_entries: usize,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self { max_entries: 1000 }
    }
}

/// Counts over the retained entries
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditStats {
    pub retained: usize,
    pub info: usize,
    pub warning: usize,
    pub critical: usize,
    /// Entries evicted by the size cap since creation
    pub dropped: u64,
    /// Entries ever recorded
    pub total_recorded: u64,
}

/// Bounded in-memory audit log
pub struct AuditLog {
    entries: RwLock<VecDeque<AuditLogEntry>>,
    config: AuditConfig,
    next_id: AtomicU64,
    dropped: AtomicU64,
    masker: PiiMasker,
    clock: SharedClock,
}

impl AuditLog {
    pub fn new(config: AuditConfig, clock: SharedClock) -> Self {
        Self::with_masker(config, clock, PiiMasker::builtin())
    }

    pub fn with_masker(config: AuditConfig, clock: SharedClock, masker: PiiMasker) -> Self {
        Self {
            entries: RwLock::new(VecDeque::with_capacity(config.max_entries.min(1024))),
            config,
            next_id: AtomicU64::new(1),
            dropped: AtomicU64::new(0),
            masker,
            clock,
        }
    }

    pub fn config(&self) -> &AuditConfig {
        &self.config
    }

    /// Append an event and return its id
    pub fn record(
        &self,
        level: AuditLevel,
        event: &str,
        session_id: Option<&str>,
        data: serde_json::Value,
    ) -> u64 {
        let data = self.masker.mask_json(&data);
        let created_at = self.clock.now_ms();

        let id = {
            let mut entries = self.entries.write();
            // Assigned under the lock so ids follow storage order
            let id = self.next_id.fetch_add(1, Ordering::SeqCst);
            entries.push_back(AuditLogEntry {
                id,
                level,
                event: event.to_string(),
                session_id: session_id.map(str::to_string),
                data: data.clone(),
                created_at,
            });
            while entries.len() > self.config.max_entries {
                entries.pop_front();
                self.dropped.fetch_add(1, Ordering::Relaxed);
            }
            id
        };

        let session = session_id.unwrap_or("-");
        match level {
            AuditLevel::Info => {
                tracing::info!(target: "quill::audit", audit_id = id, session = session, data = %data, "{}", event)
            }
            AuditLevel::Warning => {
                tracing::warn!(target: "quill::audit", audit_id = id, session = session, data = %data, "{}", event)
            }
            AuditLevel::Critical => {
                tracing::error!(target: "quill::audit", audit_id = id, session = session, data = %data, "{}", event)
            }
        }

        id
    }

    pub fn info(&self, event: &str, session_id: Option<&str>, data: serde_json::Value) -> u64 {
        self.record(AuditLevel::Info, event, session_id, data)
    }

    pub fn warning(&self, event: &str, session_id: Option<&str>, data: serde_json::Value) -> u64 {
        self.record(AuditLevel::Warning, event, session_id, data)
    }

    pub fn critical(&self, event: &str, session_id: Option<&str>, data: serde_json::Value) -> u64 {
        self.record(AuditLevel::Critical, event, session_id, data)
    }

    /// The newest `n` entries, oldest first
    pub fn recent(&self, n: usize) -> Vec<AuditLogEntry> {
        let entries = self.entries.read();
        let skip = entries.len().saturating_sub(n);
        entries.iter().skip(skip).cloned().collect()
    }

    pub fn all(&self) -> Vec<AuditLogEntry> {
        self.entries.read().iter().cloned().collect()
    }

    pub fn by_session(&self, session_id: &str) -> Vec<AuditLogEntry> {
        self.filter(|e| e.session_id.as_deref() == Some(session_id))
    }

    pub fn by_event(&self, event: &str) -> Vec<AuditLogEntry> {
        self.filter(|e| e.event == event)
    }

    /// Entries at or above `level`
    pub fn at_least(&self, level: AuditLevel) -> Vec<AuditLogEntry> {
        self.filter(|e| e.level >= level)
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    pub fn stats(&self) -> AuditStats {
        let entries = self.entries.read();
        let mut stats = AuditStats {
            retained: entries.len(),
            dropped: self.dropped.load(Ordering::Relaxed),
            total_recorded: self.next_id.load(Ordering::SeqCst) - 1,
            ..Default::default()
        };
        for entry in entries.iter() {
            match entry.level {
                AuditLevel::Info => stats.info += 1,
                AuditLevel::Warning => stats.warning += 1,
                AuditLevel::Critical => stats.critical += 1,
            }
        }
        stats
    }

    fn filter(&self, pred: impl Fn(&AuditLogEntry) -> bool) -> Vec<AuditLogEntry> {
        self.entries
            .read()
            .iter()
            .filter(|e| pred(e))
            .cloned()
            .collect()
    }
}

impl Default for AuditLog {
    fn default() -> Self {
        Self::new(AuditConfig::default(), SystemClock::shared())
    }
}

impl std::fmt::Debug for AuditLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuditLog")
            .field("len", &self.len())
            .field("config", &self.config)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quill_core::ManualClock;
    use serde_json::json;
    use std::sync::Arc;

    fn log(max_entries: usize) -> AuditLog {
        AuditLog::new(AuditConfig { max_entries }, Arc::new(ManualClock::new(5_000)))
    }

    #[test]
    fn test_record_masks_payload() {
        let log = log(10);
        log.info(
            "transform_rejected",
            Some("sess_1"),
            json!({"input": "call 13812345678", "email": "x@example.com"}),
        );

        let entry = &log.all()[0];
        assert_eq!(entry.data, json!({"input": "call [PHONE]", "email": "[EMAIL]"}));
        assert_eq!(entry.created_at, 5_000);
        assert_eq!(entry.session_id.as_deref(), Some("sess_1"));
    }

    #[test]
    fn test_cap_drops_oldest_and_ids_increase() {
        let log = log(3);
        for i in 0..5 {
            log.info("tick", None, json!({ "i": i }));
        }

        let entries = log.all();
        assert_eq!(entries.len(), 3);
        assert_eq!(entries.iter().map(|e| e.id).collect::<Vec<_>>(), vec![3, 4, 5]);

        let stats = log.stats();
        assert_eq!(stats.dropped, 2);
        assert_eq!(stats.total_recorded, 5);
    }

    #[test]
    fn test_queries() {
        let log = log(100);
        log.info("session_created", Some("a"), json!({}));
        log.warning("rate_limited", Some("a"), json!({}));
        log.critical("ban_created", None, json!({}));
        log.info("session_created", Some("b"), json!({}));

        assert_eq!(log.by_session("a").len(), 2);
        assert_eq!(log.by_event("session_created").len(), 2);
        assert_eq!(log.at_least(AuditLevel::Warning).len(), 2);

        let recent = log.recent(2);
        assert_eq!(recent[0].event, "ban_created");
        assert_eq!(recent[1].session_id.as_deref(), Some("b"));

        let stats = log.stats();
        assert_eq!((stats.info, stats.warning, stats.critical), (2, 1, 1));
    }
}
