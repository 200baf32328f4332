//! Policy Engine
//!
//! Independent, side-effect-free safety checks over raw request text and
//! over parsed DSL documents. The DSL pass re-applies the whitelist and the
//! text checks to every free-text field, independently of schema validation.

use crate::pii::{MaskOutcome, PiiKind, PiiMasker};
use crate::tables::{PatternRule, PolicyTables};
use crate::{CheckResult, PolicyError, RiskLevel};
use quill_core::{Change, DslDocument, OpKind};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Identifies which check failed
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckKind {
    Length,
    DangerousCommand,
    PromptInjection,
    ProhibitedContent,
    UnsafeMarkup,
    SelectorWhitelist,
    VariableWhitelist,
}

/// Aggregate verdict over one piece of text
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TextVerdict {
    pub safe: bool,
    pub risk: RiskLevel,
    /// One reason per failed check
    pub reasons: Vec<String>,
    pub failed_checks: Vec<CheckKind>,
    /// PII categories present; informational, not a failure
    pub pii: Vec<PiiKind>,
}

/// Violations found on one change of a DSL document
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeViolation {
    pub index: usize,
    pub op: OpKind,
    pub reasons: Vec<String>,
    pub failed_checks: Vec<CheckKind>,
}

/// Verdict over a whole DSL document
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DslVerdict {
    pub safe: bool,
    pub risk: RiskLevel,
    pub violations: Vec<ChangeViolation>,
}

impl DslVerdict {
    /// Flattened reasons, prefixed with the change index
    pub fn reasons(&self) -> Vec<String> {
        self.violations
            .iter()
            .flat_map(|v| {
                v.reasons
                    .iter()
                    .map(move |r| format!("changes[{}] ({}): {}", v.index, v.op, r))
            })
            .collect()
    }
}

struct CompiledRule {
    id: String,
    regex: Regex,
}

/// Compiled policy tables
pub struct PolicyEngine {
    tables: PolicyTables,
    selectors: HashSet<String>,
    css_vars: HashSet<String>,
    dangerous: Vec<String>,
    prohibited: Vec<String>,
    injection: Vec<CompiledRule>,
    markup: Vec<CompiledRule>,
    masker: PiiMasker,
}

impl PolicyEngine {
    /// Compile a table set
    pub fn new(tables: PolicyTables) -> Result<Self, PolicyError> {
        if tables.max_input_length == 0 {
            return Err(PolicyError::InvalidTables(
                "max_input_length must be greater than 0".to_string(),
            ));
        }

        let injection = compile_rules(&tables.injection_patterns)?;
        let markup = compile_rules(&tables.markup_patterns)?;
        let masker = PiiMasker::new(&tables.pii_rules)?;

        Ok(Self {
            selectors: tables.allowed_selectors.iter().cloned().collect(),
            css_vars: tables.allowed_css_vars.iter().cloned().collect(),
            dangerous: tables
                .dangerous_commands
                .iter()
                .map(|s| s.to_lowercase())
                .collect(),
            prohibited: tables
                .prohibited_keywords
                .iter()
                .map(|s| s.to_lowercase())
                .collect(),
            injection,
            markup,
            masker,
            tables,
        })
    }

    /// Engine over the built-in tables
    pub fn builtin() -> Result<Self, PolicyError> {
        Self::new(PolicyTables::builtin())
    }

    pub fn tables(&self) -> &PolicyTables {
        &self.tables
    }

    pub fn masker(&self) -> &PiiMasker {
        &self.masker
    }

    // === Whitelists ===

    pub fn check_selector(&self, selector: &str) -> CheckResult {
        if self.selectors.contains(selector) {
            CheckResult::pass()
        } else {
            CheckResult::fail(
                vec![sanitize_token(selector)],
                "selector is not in the allow-list",
            )
        }
    }

    pub fn check_css_var(&self, var: &str) -> CheckResult {
        if self.css_vars.contains(var) {
            CheckResult::pass()
        } else {
            CheckResult::fail(
                vec![sanitize_token(var)],
                "CSS variable is not in the allow-list",
            )
        }
    }

    /// Selector and, for `set_style_var`, variable whitelist
    pub fn check_change_whitelist(&self, change: &Change) -> CheckResult {
        let mut detected = Vec::new();
        let mut reasons = Vec::new();

        for (_, result) in self.whitelist_results(change) {
            if !result.safe {
                detected.extend(result.detected);
                reasons.extend(result.reason);
            }
        }

        if reasons.is_empty() {
            CheckResult::pass()
        } else {
            CheckResult::fail(detected, reasons.join("; "))
        }
    }

    fn whitelist_results(&self, change: &Change) -> Vec<(CheckKind, CheckResult)> {
        let mut results = vec![(
            CheckKind::SelectorWhitelist,
            self.check_selector(change.selector()),
        )];
        if let Some(var) = change.css_var() {
            results.push((CheckKind::VariableWhitelist, self.check_css_var(var)));
        }
        results
    }

    // === Text checks ===

    pub fn detect_dangerous_commands(&self, text: &str) -> CheckResult {
        let lower = text.to_lowercase();
        let detected: Vec<String> = self
            .dangerous
            .iter()
            .filter(|cmd| lower.contains(cmd.as_str()))
            .map(|cmd| cmd.trim().to_string())
            .collect();

        if detected.is_empty() {
            CheckResult::pass()
        } else {
            CheckResult::fail(detected, "dangerous command pattern detected")
        }
    }

    pub fn detect_prompt_injection(&self, text: &str) -> CheckResult {
        let detected = match_rules(&self.injection, text);
        if detected.is_empty() {
            CheckResult::pass()
        } else {
            CheckResult::fail(detected, "prompt injection phrasing detected")
        }
    }

    pub fn detect_prohibited_content(&self, text: &str) -> CheckResult {
        let lower = text.to_lowercase();
        let detected: Vec<String> = self
            .prohibited
            .iter()
            .filter(|kw| lower.contains(kw.as_str()))
            .cloned()
            .collect();

        if detected.is_empty() {
            CheckResult::pass()
        } else {
            CheckResult::fail(detected, "prohibited content detected")
        }
    }

    pub fn detect_unsafe_markup(&self, text: &str) -> CheckResult {
        let detected = match_rules(&self.markup, text);
        if detected.is_empty() {
            CheckResult::pass()
        } else {
            CheckResult::fail(detected, "markup or script content detected")
        }
    }

    pub fn check_length(&self, text: &str) -> CheckResult {
        let length = text.chars().count();
        if length > self.tables.max_input_length {
            CheckResult::fail(
                vec![format!("length={}", length)],
                format!(
                    "input too long: {} > {} characters",
                    length, self.tables.max_input_length
                ),
            )
        } else {
            CheckResult::pass()
        }
    }

    pub fn mask_pii(&self, text: &str) -> MaskOutcome {
        self.masker.mask(text)
    }

    /// Run every text check and combine them into one verdict
    pub fn check_text(&self, text: &str) -> TextVerdict {
        let checks = [
            (CheckKind::Length, self.check_length(text)),
            (CheckKind::DangerousCommand, self.detect_dangerous_commands(text)),
            (CheckKind::PromptInjection, self.detect_prompt_injection(text)),
            (CheckKind::ProhibitedContent, self.detect_prohibited_content(text)),
            (CheckKind::UnsafeMarkup, self.detect_unsafe_markup(text)),
        ];

        let mut reasons = Vec::new();
        let mut failed_checks = Vec::new();
        for (kind, result) in checks {
            if !result.safe {
                failed_checks.push(kind);
                reasons.push(format_reason(&result));
            }
        }

        let verdict = TextVerdict {
            safe: failed_checks.is_empty(),
            risk: RiskLevel::from_failures(failed_checks.len()),
            reasons,
            failed_checks,
            pii: self.masker.mask(text).detected,
        };

        if !verdict.safe {
            tracing::debug!(
                "Text policy failed {} check(s), risk {}",
                verdict.failed_checks.len(),
                verdict.risk
            );
        }

        verdict
    }

    /// Whitelist and text checks over every change of a document
    pub fn check_dsl(&self, dsl: &DslDocument) -> DslVerdict {
        let mut violations = Vec::new();
        let mut failed_kinds: HashSet<CheckKind> = HashSet::new();

        for (index, change) in dsl.changes.iter().enumerate() {
            let mut reasons = Vec::new();
            let mut failed_checks = Vec::new();

            for (kind, result) in self.whitelist_results(change) {
                if !result.safe {
                    failed_checks.push(kind);
                    reasons.push(format_reason(&result));
                }
            }

            for (field, value) in change.text_fields() {
                let verdict = self.check_text(value);
                for (kind, reason) in verdict.failed_checks.iter().zip(verdict.reasons.iter()) {
                    if !failed_checks.contains(kind) {
                        failed_checks.push(*kind);
                    }
                    reasons.push(format!("{}: {}", field, reason));
                }
            }

            if !reasons.is_empty() {
                failed_kinds.extend(failed_checks.iter().copied());
                violations.push(ChangeViolation {
                    index,
                    op: change.op(),
                    reasons,
                    failed_checks,
                });
            }
        }

        DslVerdict {
            safe: violations.is_empty(),
            risk: RiskLevel::from_failures(failed_kinds.len()),
            violations,
        }
    }
}

fn compile_rules(rules: &[PatternRule]) -> Result<Vec<CompiledRule>, PolicyError> {
    rules
        .iter()
        .map(|rule| {
            Regex::new(&rule.pattern)
                .map(|regex| CompiledRule {
                    id: rule.id.clone(),
                    regex,
                })
                .map_err(|e| PolicyError::Pattern {
                    id: rule.id.clone(),
                    message: e.to_string(),
                })
        })
        .collect()
}

fn match_rules(rules: &[CompiledRule], text: &str) -> Vec<String> {
    rules
        .iter()
        .filter(|rule| rule.regex.is_match(text))
        .map(|rule| rule.id.clone())
        .collect()
}

fn format_reason(result: &CheckResult) -> String {
    let reason = result.reason.as_deref().unwrap_or("check failed");
    if result.detected.is_empty() {
        reason.to_string()
    } else {
        format!("{} [{}]", reason, result.detected.join(", "))
    }
}

/// Echo-safe form of a rejected selector or variable name
fn sanitize_token(s: &str) -> String {
    s.chars()
        .take(64)
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '#' | '.' | '-' | '_') {
                c
            } else {
                '?'
            }
        })
        .collect()
}
