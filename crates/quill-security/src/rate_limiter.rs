//! Rate Limiting
//!
//! Fixed-window counters per IP and per session with escalating bans.
//!
//! For each key the limiter consults the ban store first, then advances the
//! window record through `step`. Exceeding the ceiling counts a violation;
//! once violations reach the threshold the key is banned for
//! `ban_duration_secs`. Every decision is returned as a value; the limiter
//! never errors.

use crate::audit::AuditLog;
use crate::ban::{BanRecord, BanSource, BanStore, MemoryBanStore};
use crate::store::{MemoryRateLimitStore, RateLimitRecord, RateLimitStore};
use crate::PolicyError;
use quill_core::{duration_ms, SharedClock};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// What a limit key identifies
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Dimension {
    Ip,
    Session,
}

impl Dimension {
    pub fn as_str(&self) -> &'static str {
        match self {
            Dimension::Ip => "ip",
            Dimension::Session => "session",
        }
    }
}

/// A rate-limited identity, stored as `dimension:value`
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LimitKey {
    pub dimension: Dimension,
    pub value: String,
}

impl LimitKey {
    pub fn ip(value: impl Into<String>) -> Self {
        Self {
            dimension: Dimension::Ip,
            value: value.into(),
        }
    }

    pub fn session(value: impl Into<String>) -> Self {
        Self {
            dimension: Dimension::Session,
            value: value.into(),
        }
    }

    fn session_id(&self) -> Option<&str> {
        match self.dimension {
            Dimension::Session => Some(&self.value),
            Dimension::Ip => None,
        }
    }
}

impl fmt::Display for LimitKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.dimension.as_str(), self.value)
    }
}

impl FromStr for LimitKey {
    type Err = PolicyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once(':') {
            Some(("ip", value)) if !value.is_empty() => Ok(LimitKey::ip(value)),
            Some(("session", value)) if !value.is_empty() => Ok(LimitKey::session(value)),
            _ => Err(PolicyError::InvalidKey(s.to_string())),
        }
    }
}

/// Ceiling for one dimension
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowLimit {
    pub max_requests: u32,
    pub window_secs: u64,
}

impl WindowLimit {
    pub fn new(max_requests: u32, window_secs: u64) -> Self {
        Self {
            max_requests,
            window_secs,
        }
    }

    fn window_ms(&self) -> i64 {
        duration_ms(Duration::from_secs(self.window_secs))
    }
}

/// Rate limiter configuration
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Violations before an automatic ban
    pub ban_threshold: u32,
    /// Length of an automatic ban
    pub ban_duration_secs: u64,
    /// Window records untouched for this long are swept
    pub idle_record_ttl_secs: u64,
    pub ip: WindowLimit,
    pub session: WindowLimit,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            ban_threshold: 3,
            ban_duration_secs: 15 * 60,
            idle_record_ttl_secs: 60 * 60,
            ip: WindowLimit::new(30, 60),
            session: WindowLimit::new(10, 60),
        }
    }
}

impl RateLimitConfig {
    pub fn limit_for(&self, dimension: Dimension) -> WindowLimit {
        match dimension {
            Dimension::Ip => self.ip,
            Dimension::Session => self.session,
        }
    }
}

/// Why a request was refused
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DenialKind {
    RateLimited {
        dimension: Dimension,
        retry_after_ms: i64,
    },
    Banned {
        /// `None` for a permanent ban
        expires_at: Option<i64>,
    },
}

/// A refused request
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Denial {
    /// Limit key in `dimension:value` form
    pub key: String,
    pub kind: DenialKind,
    pub reason: String,
}

impl fmt::Display for Denial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.reason)
    }
}

/// Outcome of a rate-limit check
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum RateDecision {
    Allow { remaining: u32 },
    Deny(Denial),
}

impl RateDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, RateDecision::Allow { .. })
    }

    pub fn into_result(self) -> Result<u32, Denial> {
        match self {
            RateDecision::Allow { remaining } => Ok(remaining),
            RateDecision::Deny(denial) => Err(denial),
        }
    }
}

/// What `sweep` removed
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SweepReport {
    pub expired_bans: usize,
    pub idle_records: usize,
}

/// Limiter counters
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitStats {
    pub allowed: u64,
    pub rate_limited: u64,
    pub banned_rejections: u64,
    pub bans_created: u64,
    pub active_bans: usize,
    pub tracked_keys: usize,
}

#[derive(Debug, PartialEq, Eq)]
enum WindowOutcome {
    Within { remaining: u32 },
    Exceeded { retry_after_ms: i64 },
}

/// Advance one window record by a single request
fn step(
    prev: Option<RateLimitRecord>,
    now: i64,
    limit: &WindowLimit,
) -> (RateLimitRecord, WindowOutcome) {
    let window_ms = limit.window_ms();

    let mut record = match prev {
        Some(prev) if now - prev.window_start < window_ms => RateLimitRecord {
            count: prev.count.saturating_add(1),
            last_seen: now,
            ..prev
        },
        Some(prev) => RateLimitRecord {
            count: 1,
            window_start: now,
            violation_count: prev.violation_count,
            last_seen: now,
        },
        None => RateLimitRecord::first(now),
    };

    if record.count > limit.max_requests {
        record.violation_count = record.violation_count.saturating_add(1);
        let retry_after_ms = (record.window_start + window_ms - now).max(0);
        (record, WindowOutcome::Exceeded { retry_after_ms })
    } else {
        let remaining = limit.max_requests - record.count;
        (record, WindowOutcome::Within { remaining })
    }
}

/// Per-IP and per-session rate limiter with escalating bans
pub struct RateLimiter {
    config: RateLimitConfig,
    store: Arc<dyn RateLimitStore>,
    bans: Arc<dyn BanStore>,
    audit: Arc<AuditLog>,
    clock: SharedClock,

    allowed: AtomicU64,
    rate_limited: AtomicU64,
    banned_rejections: AtomicU64,
    bans_created: AtomicU64,
}

impl RateLimiter {
    pub fn new(
        config: RateLimitConfig,
        store: Arc<dyn RateLimitStore>,
        bans: Arc<dyn BanStore>,
        audit: Arc<AuditLog>,
        clock: SharedClock,
    ) -> Self {
        Self {
            config,
            store,
            bans,
            audit,
            clock,
            allowed: AtomicU64::new(0),
            rate_limited: AtomicU64::new(0),
            banned_rejections: AtomicU64::new(0),
            bans_created: AtomicU64::new(0),
        }
    }

    /// Limiter over fresh in-memory stores
    pub fn in_memory(config: RateLimitConfig, audit: Arc<AuditLog>, clock: SharedClock) -> Self {
        Self::new(
            config,
            Arc::new(MemoryRateLimitStore::new()),
            Arc::new(MemoryBanStore::new()),
            audit,
            clock,
        )
    }

    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    /// Count one request against `key`
    pub fn check(&self, key: &LimitKey) -> RateDecision {
        let now = self.clock.now_ms();
        let storage_key = key.to_string();

        if let Some(denial) = self.check_ban(key, &storage_key, now) {
            return RateDecision::Deny(denial);
        }

        let limit = self.config.limit_for(key.dimension);
        let mut outcome = None;
        let mut violations = 0;
        self.store.update(&storage_key, &mut |slot| {
            let (record, result) = step(*slot, now, &limit);
            violations = record.violation_count;
            outcome = Some(result);
            *slot = Some(record);
        });

        match outcome {
            Some(WindowOutcome::Within { remaining }) => {
                self.allowed.fetch_add(1, Ordering::Relaxed);
                RateDecision::Allow { remaining }
            }
            Some(WindowOutcome::Exceeded { retry_after_ms }) => {
                if violations >= self.config.ban_threshold {
                    RateDecision::Deny(self.escalate(key, &storage_key, violations, now))
                } else {
                    self.deny_rate_limited(key, &storage_key, violations, retry_after_ms)
                }
            }
            None => {
                tracing::error!("Rate limit store skipped update for {}", storage_key);
                RateDecision::Allow { remaining: 0 }
            }
        }
    }

    fn check_ban(&self, key: &LimitKey, storage_key: &str, now: i64) -> Option<Denial> {
        let ban = self.bans.get(storage_key)?;

        if ban.is_active(now) {
            self.banned_rejections.fetch_add(1, Ordering::Relaxed);
            self.audit.warning(
                "banned_request_rejected",
                key.session_id(),
                json!({ "key": storage_key, "expires_at": ban.expires_at }),
            );
            return Some(Denial {
                key: storage_key.to_string(),
                kind: DenialKind::Banned {
                    expires_at: ban.expires_at,
                },
                reason: ban_reason(&ban),
            });
        }

        if let Some(expired) = self.bans.remove_if(storage_key, &|b| !b.is_active(now)) {
            self.audit.info(
                "ban_expired",
                key.session_id(),
                json!({ "key": storage_key, "banned_at": expired.banned_at }),
            );
        }
        None
    }

    fn deny_rate_limited(
        &self,
        key: &LimitKey,
        storage_key: &str,
        violations: u32,
        retry_after_ms: i64,
    ) -> RateDecision {
        self.rate_limited.fetch_add(1, Ordering::Relaxed);
        self.audit.warning(
            "rate_limited",
            key.session_id(),
            json!({
                "key": storage_key,
                "violations": violations,
                "retry_after_ms": retry_after_ms,
            }),
        );

        let retry_secs = (retry_after_ms + 999) / 1000;
        RateDecision::Deny(Denial {
            key: storage_key.to_string(),
            kind: DenialKind::RateLimited {
                dimension: key.dimension,
                retry_after_ms,
            },
            reason: format!(
                "Too many requests for this {}; retry in {}s",
                key.dimension.as_str(),
                retry_secs
            ),
        })
    }

    fn escalate(&self, key: &LimitKey, storage_key: &str, violations: u32, now: i64) -> Denial {
        let expires_at = now + duration_ms(Duration::from_secs(self.config.ban_duration_secs));
        let ban = BanRecord {
            reason: format!("{} rate-limit violations", violations),
            banned_at: now,
            expires_at: Some(expires_at),
            source: BanSource::Automatic,
        };

        self.bans.insert(storage_key, ban.clone());
        // The ban absorbs the violations that caused it
        self.store.update(storage_key, &mut |slot| {
            if let Some(record) = slot.as_mut() {
                record.violation_count = 0;
            }
        });
        self.bans_created.fetch_add(1, Ordering::Relaxed);
        self.audit.critical(
            "ban_created",
            key.session_id(),
            json!({
                "key": storage_key,
                "source": "automatic",
                "violations": violations,
                "expires_at": expires_at,
            }),
        );

        Denial {
            key: storage_key.to_string(),
            kind: DenialKind::Banned {
                expires_at: Some(expires_at),
            },
            reason: ban_reason(&ban),
        }
    }

    /// Place an administrative ban; `None` duration means permanent
    pub fn ban(&self, key: &LimitKey, reason: &str, duration: Option<Duration>) -> BanRecord {
        let now = self.clock.now_ms();
        let record = BanRecord {
            reason: reason.to_string(),
            banned_at: now,
            expires_at: duration.map(|d| now + duration_ms(d)),
            source: BanSource::Admin,
        };

        let storage_key = key.to_string();
        self.bans.insert(&storage_key, record.clone());
        self.bans_created.fetch_add(1, Ordering::Relaxed);
        self.audit.critical(
            "ban_created",
            key.session_id(),
            json!({
                "key": storage_key,
                "source": "admin",
                "reason": reason,
                "expires_at": record.expires_at,
            }),
        );

        record
    }

    /// Lift a ban; returns whether one existed
    pub fn unban(&self, key: &LimitKey) -> bool {
        let storage_key = key.to_string();
        match self.bans.remove(&storage_key) {
            Some(_) => {
                self.audit
                    .info("ban_lifted", key.session_id(), json!({ "key": storage_key }));
                true
            }
            None => false,
        }
    }

    /// The active ban on `key`, if any
    pub fn is_banned(&self, key: &LimitKey) -> Option<BanRecord> {
        let now = self.clock.now_ms();
        self.bans
            .get(&key.to_string())
            .filter(|ban| ban.is_active(now))
    }

    /// All active bans, sorted by key
    pub fn bans(&self) -> Vec<(String, BanRecord)> {
        let now = self.clock.now_ms();
        self.bans
            .list()
            .into_iter()
            .filter(|(_, ban)| ban.is_active(now))
            .collect()
    }

    /// Forget the window record for `key`; bans are untouched
    pub fn reset(&self, key: &LimitKey) {
        self.store.remove(&key.to_string());
    }

    pub fn record(&self, key: &LimitKey) -> Option<RateLimitRecord> {
        self.store.get(&key.to_string())
    }

    /// Drop expired bans and idle window records
    pub fn sweep(&self) -> SweepReport {
        let now = self.clock.now_ms();

        let expired = self.bans.retain(&|ban| ban.is_active(now));
        for (key, ban) in &expired {
            self.audit.info(
                "ban_expired",
                None,
                json!({ "key": key, "banned_at": ban.banned_at }),
            );
        }

        let idle_ms = duration_ms(Duration::from_secs(self.config.idle_record_ttl_secs));
        let config = &self.config;
        let idle_records = self.store.retain(&mut |key, record| {
            let window_ms = match key.split_once(':') {
                Some(("session", _)) => config.session.window_ms(),
                _ => config.ip.window_ms(),
            };
            now - record.last_seen < idle_ms.max(window_ms)
        });

        let report = SweepReport {
            expired_bans: expired.len(),
            idle_records,
        };
        if report.expired_bans > 0 || report.idle_records > 0 {
            tracing::debug!(
                "Rate limiter sweep removed {} bans and {} records",
                report.expired_bans,
                report.idle_records
            );
        }
        report
    }

    pub fn stats(&self) -> RateLimitStats {
        RateLimitStats {
            allowed: self.allowed.load(Ordering::Relaxed),
            rate_limited: self.rate_limited.load(Ordering::Relaxed),
            banned_rejections: self.banned_rejections.load(Ordering::Relaxed),
            bans_created: self.bans_created.load(Ordering::Relaxed),
            active_bans: self.bans().len(),
            tracked_keys: self.store.len(),
        }
    }
}

fn ban_reason(ban: &BanRecord) -> String {
    match ban.expires_at {
        Some(expires_at) => format!("Banned until {} ({})", expires_at, ban.reason),
        None => format!("Banned permanently ({})", ban.reason),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::AuditConfig;
    use quill_core::{Clock, ManualClock};

    fn limiter(config: RateLimitConfig) -> (RateLimiter, Arc<ManualClock>, Arc<AuditLog>) {
        let clock = Arc::new(ManualClock::new(1_000_000));
        let audit = Arc::new(AuditLog::new(AuditConfig::default(), clock.clone()));
        let limiter = RateLimiter::in_memory(config, audit.clone(), clock.clone());
        (limiter, clock, audit)
    }

    fn small() -> RateLimitConfig {
        RateLimitConfig {
            ip: WindowLimit::new(2, 60),
            session: WindowLimit::new(1, 60),
            ..Default::default()
        }
    }

    #[test]
    fn test_step_fresh_window() {
        let limit = WindowLimit::new(3, 60);
        let (record, outcome) = step(None, 10, &limit);
        assert_eq!(record, RateLimitRecord::first(10));
        assert_eq!(outcome, WindowOutcome::Within { remaining: 2 });
    }

    #[test]
    fn test_step_elapsed_window_keeps_violations() {
        let limit = WindowLimit::new(3, 60);
        let prev = RateLimitRecord {
            count: 9,
            window_start: 0,
            violation_count: 2,
            last_seen: 100,
        };
        let (record, outcome) = step(Some(prev), 60_000, &limit);
        assert_eq!(record.count, 1);
        assert_eq!(record.window_start, 60_000);
        assert_eq!(record.violation_count, 2);
        assert_eq!(outcome, WindowOutcome::Within { remaining: 2 });
    }

    #[test]
    fn test_step_exceeded_reports_retry_after() {
        let limit = WindowLimit::new(1, 60);
        let prev = RateLimitRecord::first(0);
        let (record, outcome) = step(Some(prev), 15_000, &limit);
        assert_eq!(record.count, 2);
        assert_eq!(record.violation_count, 1);
        assert_eq!(outcome, WindowOutcome::Exceeded { retry_after_ms: 45_000 });
    }

    #[test]
    fn test_allow_until_ceiling() {
        let (limiter, _, _) = limiter(small());
        let key = LimitKey::ip("10.0.0.1");

        assert_eq!(limiter.check(&key), RateDecision::Allow { remaining: 1 });
        assert_eq!(limiter.check(&key), RateDecision::Allow { remaining: 0 });

        match limiter.check(&key) {
            RateDecision::Deny(Denial {
                kind: DenialKind::RateLimited { dimension, retry_after_ms },
                ..
            }) => {
                assert_eq!(dimension, Dimension::Ip);
                assert_eq!(retry_after_ms, 60_000);
            }
            other => panic!("expected rate limit, got {:?}", other),
        }

        assert!(limiter.check(&LimitKey::ip("10.0.0.2")).is_allowed());
    }

    #[test]
    fn test_window_resets_after_elapsed() {
        let (limiter, clock, _) = limiter(small());
        let key = LimitKey::ip("10.0.0.1");

        limiter.check(&key);
        limiter.check(&key);
        assert!(!limiter.check(&key).is_allowed());

        clock.advance(Duration::from_secs(60));
        assert_eq!(limiter.check(&key), RateDecision::Allow { remaining: 1 });
    }

    #[test]
    fn test_escalates_to_ban_at_threshold() {
        let (limiter, clock, audit) = limiter(small());
        let key = LimitKey::ip("10.0.0.9");

        limiter.check(&key);
        limiter.check(&key);
        assert!(matches!(
            limiter.check(&key),
            RateDecision::Deny(Denial { kind: DenialKind::RateLimited { .. }, .. })
        ));
        assert!(matches!(
            limiter.check(&key),
            RateDecision::Deny(Denial { kind: DenialKind::RateLimited { .. }, .. })
        ));

        let expected_expiry = clock.now_ms() + 15 * 60 * 1000;
        assert_eq!(
            limiter.check(&key),
            RateDecision::Deny(Denial {
                key: "ip:10.0.0.9".to_string(),
                kind: DenialKind::Banned {
                    expires_at: Some(expected_expiry)
                },
                reason: format!("Banned until {} (3 rate-limit violations)", expected_expiry),
            })
        );
        assert_eq!(audit.by_event("ban_created").len(), 1);

        // Still banned after the window elapses
        clock.advance(Duration::from_secs(120));
        assert!(matches!(
            limiter.check(&key),
            RateDecision::Deny(Denial { kind: DenialKind::Banned { .. }, .. })
        ));
        assert_eq!(audit.by_event("banned_request_rejected").len(), 1);
    }

    #[test]
    fn test_violations_start_over_after_ban_expires() {
        let (limiter, clock, audit) = limiter(small());
        let key = LimitKey::ip("10.0.0.7");

        for _ in 0..5 {
            limiter.check(&key);
        }
        assert!(limiter.is_banned(&key).is_some());
        assert_eq!(limiter.record(&key).map(|r| r.violation_count), Some(0));

        clock.advance(Duration::from_secs(16 * 60));
        assert!(limiter.check(&key).is_allowed());
        assert!(limiter.check(&key).is_allowed());

        // First offence after the ban is a plain rate limit again
        assert!(matches!(
            limiter.check(&key),
            RateDecision::Deny(Denial { kind: DenialKind::RateLimited { .. }, .. })
        ));
        assert_eq!(limiter.record(&key).map(|r| r.violation_count), Some(1));
        assert_eq!(audit.by_event("ban_created").len(), 1);
    }

    #[test]
    fn test_expired_ban_is_lazily_evicted() {
        let (limiter, clock, audit) = limiter(small());
        let key = LimitKey::ip("10.0.0.5");

        limiter.ban(&key, "abuse", Some(Duration::from_secs(30)));
        assert!(!limiter.check(&key).is_allowed());

        clock.advance(Duration::from_secs(31));
        assert!(limiter.check(&key).is_allowed());
        assert!(limiter.is_banned(&key).is_none());
        assert_eq!(audit.by_event("ban_expired").len(), 1);
    }

    #[test]
    fn test_admin_ban_and_unban() {
        let (limiter, clock, _) = limiter(small());
        let key = LimitKey::session("sess_abc");

        let ban = limiter.ban(&key, "manual", None);
        assert!(ban.is_permanent());
        assert_eq!(ban.source, BanSource::Admin);

        clock.advance(Duration::from_secs(365 * 24 * 3600));
        assert!(limiter.is_banned(&key).is_some());
        assert_eq!(limiter.bans().len(), 1);

        assert!(limiter.unban(&key));
        assert!(!limiter.unban(&key));
        assert!(limiter.check(&key).is_allowed());
    }

    #[test]
    fn test_sweep_removes_expired_bans_and_idle_records() {
        let config = RateLimitConfig {
            idle_record_ttl_secs: 120,
            ..small()
        };
        let (limiter, clock, _) = limiter(config);

        limiter.check(&LimitKey::ip("a"));
        limiter.ban(&LimitKey::ip("b"), "temp", Some(Duration::from_secs(10)));
        limiter.ban(&LimitKey::ip("c"), "perm", None);

        clock.advance(Duration::from_secs(121));
        let report = limiter.sweep();
        assert_eq!(report, SweepReport { expired_bans: 1, idle_records: 1 });

        let stats = limiter.stats();
        assert_eq!(stats.active_bans, 1);
        assert_eq!(stats.tracked_keys, 0);
        assert_eq!(stats.bans_created, 2);
    }

    #[test]
    fn test_reset_clears_window() {
        let (limiter, _, _) = limiter(small());
        let key = LimitKey::ip("z");
        limiter.check(&key);
        limiter.check(&key);
        limiter.reset(&key);
        assert_eq!(limiter.check(&key), RateDecision::Allow { remaining: 1 });
    }

    #[test]
    fn test_limit_key_parse() {
        assert_eq!("ip:1.2.3.4".parse::<LimitKey>().unwrap(), LimitKey::ip("1.2.3.4"));
        assert_eq!(
            "session:sess_1".parse::<LimitKey>().unwrap(),
            LimitKey::session("sess_1")
        );
        assert!("user:bob".parse::<LimitKey>().is_err());
        assert!("ip:".parse::<LimitKey>().is_err());
        assert_eq!(LimitKey::ip("::1").to_string(), "ip:::1");
    }

    #[test]
    fn test_config_defaults() {
        let config = RateLimitConfig::default();
        assert_eq!(config.ip, WindowLimit::new(30, 60));
        assert_eq!(config.session, WindowLimit::new(10, 60));
        assert_eq!(config.ban_threshold, 3);
        assert_eq!(config.ban_duration_secs, 900);
    }
}
