//! # Quill Security
//!
//! Every request that reaches the engine passes through this crate twice:
//! once as raw text, once as a parsed DSL document.
//!
//! ## Features
//!
//! - **Policy Tables**: versioned allow-lists and deny-lists as typed data
//! - **Policy Engine**: whitelist, dangerous-command, prompt-injection,
//!   prohibited-content, markup and length checks with a risk level
//! - **PII Masking**: idempotent redaction of emails, phones, ids, cards,
//!   API keys and tokens
//! - **Rate Limiting**: sliding windows per IP and per session
//! - **Ban Store**: automatic escalation and administrative bans
//! - **Audit Log**: bounded, redacted, append-only event trail
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      QUILL SECURITY                          │
//! ├─────────────────────────────────────────────────────────────┤
//! │  ┌─────────────┐  ┌─────────────┐  ┌─────────────────────┐  │
//! │  │ RateLimiter │  │ PolicyEngine│  │     PiiMasker       │  │
//! │  │  + BanStore │  │  (tables)   │  │                     │  │
//! │  └──────┬──────┘  └──────┬──────┘  └──────────┬──────────┘  │
//! │         │                │                     │            │
//! │         └────────────────┼─────────────────────┘            │
//! │                          ▼                                  │
//! │              ┌───────────────────────┐                      │
//! │              │       AuditLog        │                      │
//! │              └───────────────────────┘                      │
//! └─────────────────────────────────────────────────────────────┘
//! ```

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod audit;
pub mod ban;
pub mod pii;
pub mod policy;
pub mod rate_limiter;
pub mod store;
pub mod tables;

// Re-exports
pub use audit::{AuditConfig, AuditLevel, AuditLog, AuditLogEntry, AuditStats};
pub use ban::{BanRecord, BanSource, BanStore, MemoryBanStore};
pub use pii::{MaskOutcome, PiiKind, PiiMasker};
pub use policy::{ChangeViolation, CheckKind, DslVerdict, PolicyEngine, TextVerdict};
pub use rate_limiter::{
    Denial, DenialKind, Dimension, LimitKey, RateDecision, RateLimitConfig, RateLimitStats,
    RateLimiter, SweepReport, WindowLimit,
};
pub use store::{MemoryRateLimitStore, RateLimitRecord, RateLimitStore};
pub use tables::{PatternRule, PiiRule, PolicyTables, POLICY_TABLES_VERSION};

/// Risk classification derived from the number of failed checks
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
}

impl RiskLevel {
    /// `low` = 0 failed checks, `medium` = 1, `high` = 2 or more
    pub fn from_failures(failed: usize) -> Self {
        match failed {
            0 => RiskLevel::Low,
            1 => RiskLevel::Medium,
            _ => RiskLevel::High,
        }
    }
}

impl std::fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RiskLevel::Low => write!(f, "low"),
            RiskLevel::Medium => write!(f, "medium"),
            RiskLevel::High => write!(f, "high"),
        }
    }
}

/// Outcome of one independent policy check
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckResult {
    pub safe: bool,
    /// Rule ids or table entries that matched
    pub detected: Vec<String>,
    /// Human-readable reason, never containing the raw input
    pub reason: Option<String>,
}

impl CheckResult {
    pub fn pass() -> Self {
        Self {
            safe: true,
            detected: Vec::new(),
            reason: None,
        }
    }

    pub fn fail(detected: Vec<String>, reason: impl Into<String>) -> Self {
        Self {
            safe: false,
            detected,
            reason: Some(reason.into()),
        }
    }
}

/// Security layer errors
#[derive(Debug, Error)]
pub enum PolicyError {
    #[error("Pattern compilation error in rule {id}: {message}")]
    Pattern { id: String, message: String },

    #[error("Invalid policy tables: {0}")]
    InvalidTables(String),

    #[error("Invalid limit key '{0}', expected ip:<addr> or session:<id>")]
    InvalidKey(String),
}
