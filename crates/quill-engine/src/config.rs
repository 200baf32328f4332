//! Engine configuration
//!
//! Every section falls back to its defaults, so an empty TOML document is a
//! valid configuration.

use crate::error::EngineError;
use quill_security::{AuditConfig, PolicyTables, RateLimitConfig};
use quill_session::SessionConfig;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Complete engine configuration
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Policy table overrides
    #[serde(default)]
    pub policy: PolicyConfig,

    /// Rate limiting and bans
    #[serde(default)]
    pub rate_limit: RateLimitConfig,

    /// Session TTL and history
    #[serde(default)]
    pub session: SessionConfig,

    /// Audit trail
    #[serde(default)]
    pub audit: AuditConfig,

    /// Background sweeper
    #[serde(default)]
    pub sweeper: SweeperConfig,
}

/// Adjustments applied on top of the built-in policy tables
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicyConfig {
    /// Maximum request length in characters
    pub max_input_length: usize,

    /// Appended to the built-in selector allow-list
    pub extra_selectors: Vec<String>,

    /// Appended to the built-in CSS variable allow-list
    pub extra_css_vars: Vec<String>,

    /// Appended to the built-in prohibited keywords
    pub extra_prohibited_keywords: Vec<String>,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            max_input_length: 500,
            extra_selectors: Vec::new(),
            extra_css_vars: Vec::new(),
            extra_prohibited_keywords: Vec::new(),
        }
    }
}

impl PolicyConfig {
    /// Built-in tables with this section's adjustments
    pub fn tables(&self) -> PolicyTables {
        let mut tables = PolicyTables::builtin();
        tables.max_input_length = self.max_input_length;
        extend_unique(&mut tables.allowed_selectors, &self.extra_selectors);
        extend_unique(&mut tables.allowed_css_vars, &self.extra_css_vars);

        let keywords: Vec<String> = self
            .extra_prohibited_keywords
            .iter()
            .map(|k| k.to_lowercase())
            .collect();
        extend_unique(&mut tables.prohibited_keywords, &keywords);
        tables
    }
}

fn extend_unique(target: &mut Vec<String>, extra: &[String]) {
    for item in extra {
        if !target.contains(item) {
            target.push(item.clone());
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SweeperConfig {
    pub enabled: bool,
    pub interval_secs: u64,
}

impl Default for SweeperConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: 60,
        }
    }
}

impl EngineConfig {
    /// Parse and validate a TOML document
    pub fn from_toml_str(content: &str) -> Result<Self, EngineError> {
        let config: EngineConfig =
            toml::from_str(content).map_err(|e| EngineError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from file
    pub fn load(path: &Path) -> Result<Self, EngineError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// Render as TOML
    pub fn to_toml_string(&self) -> Result<String, EngineError> {
        toml::to_string_pretty(self).map_err(|e| EngineError::Parse(e.to_string()))
    }

    /// Reject values that would disable a safeguard outright
    pub fn validate(&self) -> Result<(), EngineError> {
        let invalid = |msg: &str| Err(EngineError::InvalidConfig(msg.to_string()));

        if self.policy.max_input_length == 0 {
            return invalid("policy.max_input_length must be positive");
        }
        for (name, limit) in [("ip", &self.rate_limit.ip), ("session", &self.rate_limit.session)] {
            if limit.max_requests == 0 || limit.window_secs == 0 {
                return Err(EngineError::InvalidConfig(format!(
                    "rate_limit.{} needs a positive max_requests and window_secs",
                    name
                )));
            }
        }
        if self.rate_limit.ban_threshold == 0 {
            return invalid("rate_limit.ban_threshold must be positive");
        }
        if self.session.ttl_secs == 0 {
            return invalid("session.ttl_secs must be positive");
        }
        if self.session.max_history == 0 {
            return invalid("session.max_history must be positive");
        }
        if self.session.max_detached == 0 {
            return invalid("session.max_detached must be positive");
        }
        if self.audit.max_entries == 0 {
            return invalid("audit.max_entries must be positive");
        }
        if self.sweeper.enabled && self.sweeper.interval_secs == 0 {
            return invalid("sweeper.interval_secs must be positive");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_empty_document_is_default() {
        let config = EngineConfig::from_toml_str("").unwrap();
        assert_eq!(config, EngineConfig::default());
        assert_eq!(config.rate_limit.ip.max_requests, 30);
        assert_eq!(config.session.ttl_secs, 1800);
        assert_eq!(config.audit.max_entries, 1000);
    }

    #[test]
    fn test_partial_sections() {
        let config = EngineConfig::from_toml_str(
            r##"
            [rate_limit]
            ban_threshold = 5

            [rate_limit.session]
            max_requests = 20
            window_secs = 30

            [session]
            max_history = 10

            [policy]
            extra_selectors = ["#promo"]
            extra_prohibited_keywords = ["Lottery"]
            "##,
        )
        .unwrap();

        assert_eq!(config.rate_limit.ban_threshold, 5);
        assert_eq!(config.rate_limit.session.max_requests, 20);
        assert_eq!(config.rate_limit.ip.max_requests, 30);
        assert_eq!(config.session.max_history, 10);
        assert_eq!(config.session.ttl_secs, 1800);

        let tables = config.policy.tables();
        assert!(tables.is_selector_allowed("#promo"));
        assert!(tables.prohibited_keywords.contains(&"lottery".to_string()));
    }

    #[test]
    fn test_round_trip_defaults() {
        let rendered = EngineConfig::default().to_toml_string().unwrap();
        assert!(rendered.contains("[rate_limit.ip]"));
        let parsed = EngineConfig::from_toml_str(&rendered).unwrap();
        assert_eq!(parsed, EngineConfig::default());
    }

    #[test]
    fn test_rejects_disabled_safeguards() {
        let err = EngineConfig::from_toml_str("[session]\nmax_history = 0").unwrap_err();
        assert!(matches!(err, EngineError::InvalidConfig(_)));

        let err = EngineConfig::from_toml_str("[session]\nmax_detached = 0").unwrap_err();
        assert!(err.to_string().contains("session.max_detached"));

        let err = EngineConfig::from_toml_str("[rate_limit.ip]\nmax_requests = 0\nwindow_secs = 60")
            .unwrap_err();
        assert!(err.to_string().contains("rate_limit.ip"));

        assert!(matches!(
            EngineConfig::from_toml_str("[session]\nttl_secs = \"soon\""),
            Err(EngineError::Parse(_))
        ));
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[audit]\nmax_entries = 50").unwrap();

        let config = EngineConfig::load(file.path()).unwrap();
        assert_eq!(config.audit.max_entries, 50);

        assert!(matches!(
            EngineConfig::load(Path::new("/nonexistent/quill.toml")),
            Err(EngineError::Io(_))
        ));
    }
}
