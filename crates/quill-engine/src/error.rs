//! Engine error types

use quill_dsl::IntentError;
use quill_security::{Denial, PolicyError, RiskLevel};
use quill_session::SessionError;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Pipeline stage that rejected a request on policy grounds
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PolicyStage {
    /// Raw request text, before any DSL exists
    Text,
    /// Parsed DSL document
    Dsl,
}

/// Why a transform did not produce a snapshot
#[derive(Debug, Clone, PartialEq, Error)]
pub enum TransformError {
    #[error("Malformed DSL: {}", .errors.join("; "))]
    Malformed { errors: Vec<String> },

    #[error("Policy violation ({risk} risk): {}", .reasons.join("; "))]
    PolicyViolation {
        stage: PolicyStage,
        reasons: Vec<String>,
        risk: RiskLevel,
    },

    #[error("Quota exceeded: {0}")]
    Quota(Denial),

    #[error("{guidance}")]
    Unrecognized { guidance: String },

    #[error("Session expired: {0}")]
    SessionExpired(String),

    #[error("Session not found: {0}")]
    SessionNotFound(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl TransformError {
    /// Stable classification for callers that render different responses
    pub fn kind(&self) -> &'static str {
        match self {
            TransformError::Malformed { .. } => "malformed",
            TransformError::PolicyViolation { .. } => "policy_violation",
            TransformError::Quota(_) => "quota",
            TransformError::Unrecognized { .. } => "unrecognized",
            TransformError::SessionExpired(_) => "session_expired",
            TransformError::SessionNotFound(_) => "session_not_found",
            TransformError::Internal(_) => "internal",
        }
    }

    pub fn risk(&self) -> Option<RiskLevel> {
        match self {
            TransformError::PolicyViolation { risk, .. } => Some(*risk),
            _ => None,
        }
    }
}

impl From<SessionError> for TransformError {
    fn from(e: SessionError) -> Self {
        match e {
            SessionError::NotFound(id) => TransformError::SessionNotFound(id),
            SessionError::Expired(id) => TransformError::SessionExpired(id),
        }
    }
}

impl From<IntentError> for TransformError {
    fn from(e: IntentError) -> Self {
        match e {
            IntentError::Unrecognized { guidance } => TransformError::Unrecognized { guidance },
        }
    }
}

/// Engine construction and configuration errors
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration parse error: {0}")]
    Parse(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Policy error: {0}")]
    Policy(#[from] PolicyError),
}
