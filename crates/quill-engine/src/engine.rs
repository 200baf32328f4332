//! Transform Engine
//!
//! Runs one request through the full pipeline:
//!
//! ```text
//! ip rate check → create_or_get → session rate check → text policy
//!   → intent parse → schema validation → DSL policy → create_snapshot
//! ```
//!
//! Every stage before `create_snapshot` is read-only with respect to
//! session history, so a rejection never leaves a partial change behind.
//! Each rejection and the final acceptance are recorded in the audit log.

use crate::config::EngineConfig;
use crate::error::{EngineError, PolicyStage, TransformError};
use quill_core::{DslDocument, SharedClock, SystemClock};
use quill_dsl::{IntentParser, SchemaValidator};
use quill_security::{
    AuditLog, BanRecord, LimitKey, PiiKind, PolicyEngine, RateDecision, RateLimitStats,
    RateLimiter, RiskLevel, SweepReport, TextVerdict,
};
use quill_session::{SessionManager, SessionState, SessionStats, Snapshot, UndoOutcome};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

/// One editing request and the identity that sent it
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransformRequest {
    pub text: String,
    pub ip: String,
    pub user_agent: String,
    #[serde(default)]
    pub session_id: Option<String>,
}

impl TransformRequest {
    pub fn new(text: impl Into<String>, ip: impl Into<String>, user_agent: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            ip: ip.into(),
            user_agent: user_agent.into(),
            session_id: None,
        }
    }

    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }
}

/// A request that produced a snapshot
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TransformAccepted {
    /// Session the snapshot belongs to; may differ from the one presented
    pub session_id: String,
    pub snapshot: Snapshot,
    pub dsl: DslDocument,
    /// Requests left in the tighter of the two rate windows
    pub remaining: u32,
    pub risk: RiskLevel,
    /// PII categories seen in the request text
    pub pii: Vec<PiiKind>,
}

/// What one sweep removed
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SweepSummary {
    pub sessions_expired: usize,
    pub rate_limit: SweepReport,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EngineStats {
    pub rate_limit: RateLimitStats,
    pub sessions: SessionStats,
    pub audit: quill_security::AuditStats,
}

/// The request pipeline and the state it owns
pub struct TransformEngine {
    config: EngineConfig,
    audit: Arc<AuditLog>,
    policy: PolicyEngine,
    limiter: RateLimiter,
    sessions: SessionManager,
    parser: IntentParser,
    schema: SchemaValidator,
}

impl TransformEngine {
    /// Engine on the system clock
    pub fn new(config: EngineConfig) -> Result<Self, EngineError> {
        Self::with_clock(config, SystemClock::shared())
    }

    /// Engine on an explicit clock, with in-memory stores
    pub fn with_clock(config: EngineConfig, clock: SharedClock) -> Result<Self, EngineError> {
        config.validate()?;

        let audit = Arc::new(AuditLog::new(config.audit.clone(), clock.clone()));
        let policy = PolicyEngine::new(config.policy.tables())?;
        let limiter = RateLimiter::in_memory(config.rate_limit.clone(), audit.clone(), clock.clone());
        let sessions = SessionManager::in_memory(config.session.clone(), audit.clone(), clock);

        tracing::info!(
            "Transform engine ready (policy tables {}, {} selectors)",
            policy.tables().version,
            policy.tables().allowed_selectors.len()
        );

        Ok(Self::from_parts(config, audit, policy, limiter, sessions))
    }

    /// Assemble an engine from prebuilt components sharing one audit log
    pub fn from_parts(
        config: EngineConfig,
        audit: Arc<AuditLog>,
        policy: PolicyEngine,
        limiter: RateLimiter,
        sessions: SessionManager,
    ) -> Self {
        Self {
            config,
            audit,
            policy,
            limiter,
            sessions,
            parser: IntentParser::new(),
            schema: SchemaValidator::new(),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn audit(&self) -> &AuditLog {
        &self.audit
    }

    pub fn policy(&self) -> &PolicyEngine {
        &self.policy
    }

    pub fn rate_limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    pub fn sessions(&self) -> &SessionManager {
        &self.sessions
    }

    /// Run the full pipeline for one request
    ///
    /// A session issued for this request is discarded again if the request
    /// is rejected, since the client never learns its id.
    pub fn transform(&self, request: &TransformRequest) -> Result<TransformAccepted, TransformError> {
        let ip_remaining = self
            .limiter
            .check(&LimitKey::ip(&request.ip))
            .into_result()
            .map_err(TransformError::Quota)?;

        let session = self.sessions.create_or_get(
            request.session_id.as_deref(),
            &request.ip,
            &request.user_agent,
        );
        let issued = request.session_id.as_deref() != Some(session.id.as_str());

        let result = self.run_stages(request, &session.id, ip_remaining);
        if result.is_err() && issued {
            self.sessions.discard_unused(&session.id);
        }
        result
    }

    fn run_stages(
        &self,
        request: &TransformRequest,
        session_id: &str,
        ip_remaining: u32,
    ) -> Result<TransformAccepted, TransformError> {
        let session_remaining = match self.limiter.check(&LimitKey::session(session_id)) {
            RateDecision::Allow { remaining } => remaining,
            RateDecision::Deny(denial) => return Err(TransformError::Quota(denial)),
        };

        let verdict = self.policy.check_text(&request.text);
        if !verdict.safe {
            self.audit.warning(
                "text_rejected",
                Some(session_id),
                json!({
                    "risk": verdict.risk,
                    "failed_checks": verdict.failed_checks,
                    "reasons": verdict.reasons,
                    "input_chars": request.text.chars().count(),
                }),
            );
            tracing::warn!("Request rejected at text policy ({} risk)", verdict.risk);
            return Err(TransformError::PolicyViolation {
                stage: PolicyStage::Text,
                reasons: verdict.reasons,
                risk: verdict.risk,
            });
        }

        let dsl = match self.parser.parse(&request.text) {
            Ok(dsl) => dsl,
            Err(e) => {
                self.audit.info(
                    "intent_unrecognized",
                    Some(session_id),
                    json!({ "input_chars": request.text.chars().count() }),
                );
                return Err(e.into());
            }
        };

        self.check_schema(&dsl, Some(session_id))?;
        self.check_dsl_policy(&dsl, Some(session_id))?;

        let note = self.policy.mask_pii(&request.text).text;
        let snapshot = self
            .sessions
            .create_snapshot(session_id, dsl.clone(), Some(note))?;

        self.audit.info(
            "transform_accepted",
            Some(session_id),
            json!({
                "snapshot_id": snapshot.id,
                "ops": dsl.changes.iter().map(|c| c.op().as_str()).collect::<Vec<_>>(),
                "pii": verdict.pii,
            }),
        );
        tracing::info!(
            "Transform accepted for session {} ({} changes)",
            session_id,
            dsl.len()
        );

        Ok(TransformAccepted {
            session_id: session_id.to_string(),
            snapshot,
            dsl,
            remaining: ip_remaining.min(session_remaining),
            risk: verdict.risk,
            pii: verdict.pii,
        })
    }

    fn check_schema(&self, dsl: &DslDocument, session_id: Option<&str>) -> Result<(), TransformError> {
        let value = dsl
            .to_value()
            .map_err(|e| TransformError::Internal(e.to_string()))?;

        let report = self.schema.validate(&value);
        if report.valid {
            return Ok(());
        }

        let errors = report.messages();
        if session_id.is_some() {
            self.audit.warning(
                "dsl_malformed",
                session_id,
                json!({ "errors": errors }),
            );
        }
        Err(TransformError::Malformed { errors })
    }

    fn check_dsl_policy(&self, dsl: &DslDocument, session_id: Option<&str>) -> Result<(), TransformError> {
        let verdict = self.policy.check_dsl(dsl);
        if verdict.safe {
            return Ok(());
        }

        let reasons = verdict.reasons();
        if session_id.is_some() {
            self.audit.warning(
                "dsl_rejected",
                session_id,
                json!({ "risk": verdict.risk, "reasons": reasons }),
            );
        }
        Err(TransformError::PolicyViolation {
            stage: PolicyStage::Dsl,
            reasons,
            risk: verdict.risk,
        })
    }

    /// Text policy only; no state is touched
    pub fn check_text(&self, text: &str) -> TextVerdict {
        self.policy.check_text(text)
    }

    /// Schema and DSL policy for an untyped document; no state is touched
    pub fn validate_dsl(&self, value: &serde_json::Value) -> Result<DslDocument, TransformError> {
        let dsl = self
            .schema
            .into_document(value.clone())
            .map_err(|report| TransformError::Malformed {
                errors: report.messages(),
            })?;
        self.check_dsl_policy(&dsl, None)?;
        Ok(dsl)
    }

    pub fn undo(&self, session_id: &str, steps: usize) -> Result<UndoOutcome, TransformError> {
        Ok(self.sessions.undo(session_id, steps)?)
    }

    pub fn reset(&self, session_id: &str) -> Result<UndoOutcome, TransformError> {
        Ok(self.sessions.reset_to_initial(session_id)?)
    }

    pub fn state(&self, session_id: &str) -> Result<SessionState, TransformError> {
        Ok(self.sessions.get_state(session_id)?)
    }

    pub fn history(&self, session_id: &str) -> Result<Vec<Snapshot>, TransformError> {
        Ok(self.sessions.history(session_id)?)
    }

    /// Administrative ban; `None` duration means permanent
    pub fn ban(&self, key: &LimitKey, reason: &str, duration: Option<Duration>) -> BanRecord {
        self.limiter.ban(key, reason, duration)
    }

    pub fn unban(&self, key: &LimitKey) -> bool {
        self.limiter.unban(key)
    }

    pub fn bans(&self) -> Vec<(String, BanRecord)> {
        self.limiter.bans()
    }

    /// Evict expired sessions, expired bans and idle rate-limit records
    pub fn sweep(&self) -> SweepSummary {
        SweepSummary {
            sessions_expired: self.sessions.sweep_expired(),
            rate_limit: self.limiter.sweep(),
        }
    }

    pub fn stats(&self) -> EngineStats {
        EngineStats {
            rate_limit: self.limiter.stats(),
            sessions: self.sessions.stats(),
            audit: self.audit.stats(),
        }
    }
}

impl std::fmt::Debug for TransformEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransformEngine")
            .field("config", &self.config)
            .field("audit", &self.audit)
            .finish()
    }
}
