//! Policy Tables
//!
//! Allow-lists, deny-lists and detection patterns as one versioned,
//! serializable structure. `PolicyEngine::new` compiles a table set once;
//! every entry can be unit-tested on its own.

use crate::pii::PiiKind;
use serde::{Deserialize, Serialize};

/// Version of the built-in tables
pub const POLICY_TABLES_VERSION: &str = "2025.1";

/// Regex-backed detection rule
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatternRule {
    pub id: String,
    pub pattern: String,
    pub description: String,
}

impl PatternRule {
    pub fn new(id: &str, pattern: &str, description: &str) -> Self {
        Self {
            id: id.to_string(),
            pattern: pattern.to_string(),
            description: description.to_string(),
        }
    }
}

/// PII detection rule; matches are replaced by the kind's placeholder
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PiiRule {
    pub kind: PiiKind,
    pub pattern: String,
}

impl PiiRule {
    pub fn new(kind: PiiKind, pattern: &str) -> Self {
        Self {
            kind,
            pattern: pattern.to_string(),
        }
    }
}

/// Complete policy configuration
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyTables {
    pub version: String,

    /// Selectors a change may target
    pub allowed_selectors: Vec<String>,

    /// CSS custom properties `set_style_var` may write
    pub allowed_css_vars: Vec<String>,

    /// Case-insensitive substrings: shell, script, SQL, traversal, fetch
    pub dangerous_commands: Vec<String>,

    /// Instruction-override phrasing
    pub injection_patterns: Vec<PatternRule>,

    /// Case-insensitive disallowed topical keywords
    pub prohibited_keywords: Vec<String>,

    /// HTML tags, inline handlers and script URLs in free text
    pub markup_patterns: Vec<PatternRule>,

    /// Applied in order; earlier rules win on overlapping text
    pub pii_rules: Vec<PiiRule>,

    /// Maximum input length in characters
    pub max_input_length: usize,
}

impl Default for PolicyTables {
    fn default() -> Self {
        Self::builtin()
    }
}

impl PolicyTables {
    /// Built-in tables
    pub fn builtin() -> Self {
        Self {
            version: POLICY_TABLES_VERSION.to_string(),
            allowed_selectors: strings(&[
                "#main-title",
                "#subtitle",
                "#banner",
                "#nav",
                "#footer",
                "body",
                ".hero",
                ".card-list",
                ".cta-button",
            ]),
            allowed_css_vars: strings(&[
                "--color-primary",
                "--color-secondary",
                "--color-background",
                "--color-text",
                "--font-size-base",
                "--spacing-unit",
                "--radius-base",
            ]),
            dangerous_commands: builtin_dangerous_commands(),
            injection_patterns: builtin_injection_patterns(),
            prohibited_keywords: strings(&[
                "赌博",
                "博彩",
                "色情",
                "毒品",
                "枪支",
                "恐怖袭击",
                "诈骗",
                "casino",
                "gambling",
                "porn",
                "cocaine",
                "heroin",
                "terrorist",
                "bomb making",
                "phishing",
            ]),
            markup_patterns: builtin_markup_patterns(),
            pii_rules: builtin_pii_rules(),
            max_input_length: 500,
        }
    }

    pub fn is_selector_allowed(&self, selector: &str) -> bool {
        self.allowed_selectors.iter().any(|s| s == selector)
    }

    pub fn is_css_var_allowed(&self, var: &str) -> bool {
        self.allowed_css_vars.iter().any(|v| v == var)
    }
}

fn strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

fn builtin_dangerous_commands() -> Vec<String> {
    strings(&[
        // shell
        "rm -rf",
        "sudo ",
        "chmod ",
        "chown ",
        "mkfs",
        "shutdown ",
        "powershell",
        "cmd.exe",
        "/bin/sh",
        "/bin/bash",
        "nc -e",
        "$(",
        // script
        "<script",
        "</script",
        "javascript:",
        "vbscript:",
        "eval(",
        "exec(",
        "system(",
        "alert(",
        "document.cookie",
        "localstorage",
        // sql
        "drop table",
        "delete from",
        "truncate table",
        "insert into",
        "union select",
        "' or '1'='1",
        "; --",
        // traversal
        "../",
        "..\\",
        "/etc/passwd",
        "/etc/shadow",
        // fetch
        "curl ",
        "wget ",
        "fetch(",
        "xmlhttprequest",
        "import(",
    ])
}

fn builtin_injection_patterns() -> Vec<PatternRule> {
    vec![
        PatternRule::new(
            "INJ-001",
            r"(?i)\b(ignore|disregard|skip)\s+(all\s+|any\s+)?(the\s+|your\s+)?(previous|prior|above|earlier|preceding)\s+(instructions?|prompts?|rules?|directions?)",
            "Instruction override",
        ),
        PatternRule::new(
            "INJ-002",
            r"(?i)\bforget\s+(everything|all|your)\b",
            "Context reset request",
        ),
        PatternRule::new(
            "INJ-003",
            r"(?i)\byou\s+are\s+now\b",
            "Role reassignment",
        ),
        PatternRule::new(
            "INJ-004",
            r"(?i)\b(pretend\s+(to\s+be|you\s+are)|act\s+as\s+(if|an?)\b|roleplay\s+as)",
            "Role assumption",
        ),
        PatternRule::new(
            "INJ-005",
            r"(?i)(^|\n)\s*(system|assistant|developer)\s*:|\[(system|inst)\]|<\|?(system|im_start)\|?>",
            "Injected conversation role marker",
        ),
        PatternRule::new(
            "INJ-006",
            r"(?i)\b(jailbreak|dan\s+mode|developer\s+mode|god\s+mode)\b",
            "Known jailbreak phrase",
        ),
        PatternRule::new(
            "INJ-007",
            r"(?i)\b(reveal|print|show)\s+(me\s+)?(your\s+)?(system\s+prompt|hidden\s+instructions)",
            "Prompt exfiltration",
        ),
        PatternRule::new(
            "INJ-008",
            r"(忽略|无视|忘记)(掉)?(之前|以上|上面|前面|所有|全部)(的)?(指令|指示|规则|提示|设定)",
            "Instruction override (zh)",
        ),
        PatternRule::new(
            "INJ-009",
            r"(你现在是|假装你是|扮演(一个|一名)?)",
            "Role assumption (zh)",
        ),
    ]
}

fn builtin_markup_patterns() -> Vec<PatternRule> {
    vec![
        PatternRule::new(
            "MKP-001",
            r"(?i)</?[a-z][a-z0-9-]*(\s[^<>]*)?/?>",
            "HTML tag",
        ),
        PatternRule::new(
            "MKP-002",
            r"(?i)\bon[a-z]{3,}\s*=",
            "Inline event handler",
        ),
        PatternRule::new(
            "MKP-003",
            r"(?i)\b(javascript|vbscript)\s*:",
            "Script URL",
        ),
        PatternRule::new(
            "MKP-004",
            r"(?i)data\s*:\s*text/html",
            "HTML data URL",
        ),
        PatternRule::new(
            "MKP-005",
            r"(?i)\b(expression|url)\s*\(",
            "CSS expression or external resource",
        ),
    ]
}

fn builtin_pii_rules() -> Vec<PiiRule> {
    vec![
        PiiRule::new(
            PiiKind::Email,
            r"[A-Za-z0-9._%+\-]+@[A-Za-z0-9\-]+(\.[A-Za-z0-9\-]+)*\.[A-Za-z]{2,}",
        ),
        PiiRule::new(PiiKind::Token, r"(?i)\bbearer\s+[A-Za-z0-9._~+/\-]+=*"),
        PiiRule::new(
            PiiKind::Token,
            r"\beyJ[A-Za-z0-9_\-]+\.[A-Za-z0-9_\-]+\.[A-Za-z0-9_\-]+",
        ),
        PiiRule::new(
            PiiKind::ApiKey,
            r"\b(sk|pk|rk)[-_](live[-_]|test[-_]|proj[-_])?[A-Za-z0-9]{16,}",
        ),
        PiiRule::new(PiiKind::ApiKey, r"\bAKIA[0-9A-Z]{16}\b"),
        PiiRule::new(
            PiiKind::Token,
            r"\b(ghp|gho|ghs|glpat|xox[abpr])[-_][A-Za-z0-9_\-]{10,}",
        ),
        PiiRule::new(
            PiiKind::NationalId,
            r"[1-9]\d{5}(18|19|20)\d{2}(0[1-9]|1[0-2])(0[1-9]|[12]\d|3[01])\d{3}[\dXx]",
        ),
        PiiRule::new(PiiKind::NationalId, r"\b\d{3}-\d{2}-\d{4}\b"),
        PiiRule::new(
            PiiKind::CreditCard,
            r"\d{4}[ \-]?\d{4}[ \-]?\d{4}[ \-]?\d{1,4}",
        ),
        PiiRule::new(PiiKind::Phone, r"(\+?86[ \-]?)?1[3-9]\d{9}"),
        PiiRule::new(PiiKind::Phone, r"\+\d{1,3}([ \-]?\d{2,4}){2,4}"),
        PiiRule::new(PiiKind::Phone, r"\(\d{3}\)\s?\d{3}-\d{4}"),
        PiiRule::new(PiiKind::Token, r"\b[A-Fa-f0-9]{40,}\b"),
    ]
}
