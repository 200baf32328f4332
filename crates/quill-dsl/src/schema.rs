//! DSL Schema Validation
//!
//! Structural validation of untyped DSL JSON. Every error is collected; the
//! validator never stops at the first one except when the document is not
//! an object or `changes` is not an array.

use quill_core::{DslDocument, OpKind, DSL_VERSION, MAX_CHANGES};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::sync::OnceLock;

/// Maximum characters in a `set_text` payload
pub const MAX_TEXT_LEN: usize = 200;

/// Maximum entries in a `reorder` permutation
pub const MAX_REORDER_ITEMS: usize = 50;

const SELECTOR_PATTERN: &str = r"^([#.][A-Za-z][A-Za-z0-9_-]{0,63}|[a-z][a-z0-9]{0,15})$";
const CSS_VAR_PATTERN: &str = r"^--[a-z][a-z0-9-]{0,62}$";
const CSS_VALUE_PATTERN: &str = r"^[A-Za-z0-9#%. -]+$";

/// One schema violation
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldError {
    /// JSON path such as `changes[1].selector`
    pub path: String,
    pub message: String,
}

impl FieldError {
    fn new(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for FieldError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.path, self.message)
    }
}

/// Result of validating one document
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationReport {
    pub valid: bool,
    pub errors: Vec<FieldError>,
}

impl ValidationReport {
    fn from_errors(errors: Vec<FieldError>) -> Self {
        Self {
            valid: errors.is_empty(),
            errors,
        }
    }

    /// Errors rendered as `path: message`
    pub fn messages(&self) -> Vec<String> {
        self.errors.iter().map(|e| e.to_string()).collect()
    }
}

/// Constraint on one field value
#[derive(Clone, Debug)]
pub enum FieldConstraint {
    /// Exact string
    Const(String),
    Str {
        max_len: usize,
        pattern: Option<Regex>,
        allowed: Option<Vec<String>>,
    },
    Bool,
    Int {
        min: i64,
        max: i64,
    },
    Array {
        max_items: usize,
        item: Box<FieldConstraint>,
    },
    /// Checked by the per-prop schema of `set_prop`
    PropValue,
}

impl FieldConstraint {
    fn check(&self, path: &str, value: &Value, errors: &mut Vec<FieldError>) {
        match self {
            FieldConstraint::Const(expected) => {
                if value.as_str() != Some(expected.as_str()) {
                    errors.push(FieldError::new(path, format!("must be \"{}\"", expected)));
                }
            }
            FieldConstraint::Str {
                max_len,
                pattern,
                allowed,
            } => {
                let Some(s) = value.as_str() else {
                    errors.push(FieldError::new(path, "must be a string"));
                    return;
                };
                if s.chars().count() > *max_len {
                    errors.push(FieldError::new(
                        path,
                        format!("must be at most {} characters", max_len),
                    ));
                }
                if let Some(pattern) = pattern {
                    if !pattern.is_match(s) {
                        errors.push(FieldError::new(path, "has an invalid format"));
                    }
                }
                if let Some(allowed) = allowed {
                    if !allowed.iter().any(|a| a == s) {
                        errors.push(FieldError::new(
                            path,
                            format!("must be one of: {}", allowed.join(", ")),
                        ));
                    }
                }
            }
            FieldConstraint::Bool => {
                if !value.is_boolean() {
                    errors.push(FieldError::new(path, "must be a boolean"));
                }
            }
            FieldConstraint::Int { min, max } => match value.as_i64() {
                Some(n) if n < *min || n > *max => {
                    errors.push(FieldError::new(
                        path,
                        format!("must be between {} and {}", min, max),
                    ));
                }
                Some(_) => {}
                None => errors.push(FieldError::new(path, "must be an integer")),
            },
            FieldConstraint::Array { max_items, item } => {
                let Some(items) = value.as_array() else {
                    errors.push(FieldError::new(path, "must be an array"));
                    return;
                };
                if items.len() > *max_items {
                    errors.push(FieldError::new(
                        path,
                        format!("must contain at most {} items", max_items),
                    ));
                }
                for (i, v) in items.iter().enumerate() {
                    item.check(&format!("{}[{}]", path, i), v, errors);
                }
            }
            FieldConstraint::PropValue => {}
        }
    }
}

/// Required fields of one operation, besides `op`
#[derive(Clone, Debug)]
pub struct OpSchema {
    pub op: OpKind,
    pub fields: Vec<(&'static str, FieldConstraint)>,
}

impl OpSchema {
    fn declares(&self, field: &str) -> bool {
        field == "op" || self.fields.iter().any(|(name, _)| *name == field)
    }
}

/// Schemas for every operation plus the per-prop value schemas of `set_prop`
#[derive(Clone, Debug)]
pub struct SchemaValidator {
    ops: Vec<OpSchema>,
    props: Vec<(&'static str, FieldConstraint)>,
}

impl SchemaValidator {
    /// Built-in schema for the current DSL version
    pub fn new() -> Self {
        let selector = || FieldConstraint::Str {
            max_len: 64,
            pattern: compile(SELECTOR_PATTERN),
            allowed: None,
        };

        let props: Vec<(&'static str, FieldConstraint)> = vec![
            ("opacity", FieldConstraint::Int { min: 0, max: 100 }),
            ("font_size", FieldConstraint::Int { min: 10, max: 72 }),
            (
                "font_weight",
                enum_of(&["normal", "bold", "lighter", "bolder", "400", "700"]),
            ),
            ("border_radius", FieldConstraint::Int { min: 0, max: 48 }),
            ("text_align", enum_of(&["left", "center", "right", "justify"])),
        ];
        let prop_names: Vec<&str> = props.iter().map(|(name, _)| *name).collect();

        let ops = vec![
            OpSchema {
                op: OpKind::SetText,
                fields: vec![
                    ("selector", selector()),
                    (
                        "text",
                        FieldConstraint::Str {
                            max_len: MAX_TEXT_LEN,
                            pattern: None,
                            allowed: None,
                        },
                    ),
                ],
            },
            OpSchema {
                op: OpKind::SetStyleVar,
                fields: vec![
                    ("selector", selector()),
                    (
                        "var",
                        FieldConstraint::Str {
                            max_len: 64,
                            pattern: compile(CSS_VAR_PATTERN),
                            allowed: None,
                        },
                    ),
                    (
                        "value",
                        FieldConstraint::Str {
                            max_len: 64,
                            pattern: compile(CSS_VALUE_PATTERN),
                            allowed: None,
                        },
                    ),
                ],
            },
            OpSchema {
                op: OpKind::Toggle,
                fields: vec![("selector", selector()), ("visible", FieldConstraint::Bool)],
            },
            OpSchema {
                op: OpKind::Reorder,
                fields: vec![
                    ("selector", selector()),
                    (
                        "order",
                        FieldConstraint::Array {
                            max_items: MAX_REORDER_ITEMS,
                            item: Box::new(FieldConstraint::Int {
                                min: 0,
                                max: (MAX_REORDER_ITEMS - 1) as i64,
                            }),
                        },
                    ),
                ],
            },
            OpSchema {
                op: OpKind::SetProp,
                fields: vec![
                    ("selector", selector()),
                    ("prop", enum_of(&prop_names)),
                    ("value", FieldConstraint::PropValue),
                ],
            },
        ];

        Self { ops, props }
    }

    /// Shared validator instance
    pub fn global() -> &'static SchemaValidator {
        static VALIDATOR: OnceLock<SchemaValidator> = OnceLock::new();
        VALIDATOR.get_or_init(SchemaValidator::new)
    }

    pub fn op_schema(&self, op: OpKind) -> Option<&OpSchema> {
        self.ops.iter().find(|s| s.op == op)
    }

    /// Validate an untyped document
    pub fn validate(&self, value: &Value) -> ValidationReport {
        let mut errors = Vec::new();

        let Some(root) = value.as_object() else {
            errors.push(FieldError::new("$", "document must be an object"));
            return ValidationReport::from_errors(errors);
        };

        match root.get("version") {
            None => errors.push(FieldError::new("version", "is required")),
            Some(Value::String(v)) if v == DSL_VERSION => {}
            Some(Value::String(v)) => errors.push(FieldError::new(
                "version",
                format!("unsupported version \"{}\", expected \"{}\"", v, DSL_VERSION),
            )),
            Some(_) => errors.push(FieldError::new("version", "must be a string")),
        }

        for key in root.keys() {
            if key != "version" && key != "changes" {
                errors.push(FieldError::new(key.as_str(), "unknown field"));
            }
        }

        let changes = match root.get("changes") {
            None => {
                errors.push(FieldError::new("changes", "is required"));
                return ValidationReport::from_errors(errors);
            }
            Some(Value::Array(changes)) => changes,
            Some(_) => {
                errors.push(FieldError::new("changes", "must be an array"));
                return ValidationReport::from_errors(errors);
            }
        };

        if changes.is_empty() {
            errors.push(FieldError::new("changes", "must contain at least 1 change"));
        }
        if changes.len() > MAX_CHANGES {
            errors.push(FieldError::new(
                "changes",
                format!("must contain at most {} changes", MAX_CHANGES),
            ));
        }

        for (i, change) in changes.iter().enumerate() {
            self.validate_change(&format!("changes[{}]", i), change, &mut errors);
        }

        ValidationReport::from_errors(errors)
    }

    fn validate_change(&self, path: &str, change: &Value, errors: &mut Vec<FieldError>) {
        let Some(obj) = change.as_object() else {
            errors.push(FieldError::new(path, "change must be an object"));
            return;
        };

        let op_path = format!("{}.op", path);
        let schema = match obj.get("op") {
            None => {
                errors.push(FieldError::new(op_path, "is required"));
                return;
            }
            Some(Value::String(op)) => match op.parse::<OpKind>() {
                Ok(op) => self.op_schema(op),
                Err(_) => None,
            },
            Some(_) => None,
        };
        let Some(schema) = schema else {
            errors.push(FieldError::new(
                op_path,
                format!(
                    "unknown operation {}, expected one of: {}",
                    obj.get("op").map(|v| v.to_string()).unwrap_or_default(),
                    OpKind::ALL.map(|op| op.as_str()).join(", ")
                ),
            ));
            return;
        };

        for (name, constraint) in &schema.fields {
            let field_path = format!("{}.{}", path, name);
            match obj.get(*name) {
                Some(value) => constraint.check(&field_path, value, errors),
                None => errors.push(FieldError::new(field_path, "is required")),
            }
        }

        for key in obj.keys() {
            if !schema.declares(key) {
                errors.push(FieldError::new(format!("{}.{}", path, key), "unknown field"));
            }
        }

        if schema.op == OpKind::SetProp {
            self.validate_prop_value(path, obj, errors);
        }
    }

    fn validate_prop_value(&self, path: &str, obj: &Map<String, Value>, errors: &mut Vec<FieldError>) {
        let (Some(prop), Some(value)) = (obj.get("prop").and_then(Value::as_str), obj.get("value"))
        else {
            return;
        };
        // Unknown props were already reported by the `prop` constraint
        if let Some((_, constraint)) = self.props.iter().find(|(name, _)| *name == prop) {
            constraint.check(&format!("{}.value", path), value, errors);
        }
    }

    /// Validate a typed document
    pub fn validate_document(&self, doc: &DslDocument) -> ValidationReport {
        match doc.to_value() {
            Ok(value) => self.validate(&value),
            Err(e) => ValidationReport::from_errors(vec![FieldError::new("$", e.to_string())]),
        }
    }

    /// Validate, then deserialize into a typed document
    pub fn into_document(&self, value: Value) -> Result<DslDocument, ValidationReport> {
        let report = self.validate(&value);
        if !report.valid {
            return Err(report);
        }
        DslDocument::from_value(value)
            .map_err(|e| ValidationReport::from_errors(vec![FieldError::new("$", e.to_string())]))
    }
}

impl Default for SchemaValidator {
    fn default() -> Self {
        Self::new()
    }
}

/// Validate with the shared validator
pub fn validate(value: &Value) -> ValidationReport {
    SchemaValidator::global().validate(value)
}

/// Validate a typed document with the shared validator
pub fn validate_document(doc: &DslDocument) -> ValidationReport {
    SchemaValidator::global().validate_document(doc)
}

/// Validate and deserialize with the shared validator
pub fn into_document(value: Value) -> Result<DslDocument, ValidationReport> {
    SchemaValidator::global().into_document(value)
}

/// Matches nothing; stands in for a pattern that failed to compile
const REJECT_ALL_PATTERN: &str = r"[^\s\S]";

/// Compile a field pattern; a broken pattern rejects every value
fn compile(pattern: &str) -> Option<Regex> {
    Regex::new(pattern)
        .or_else(|e| {
            tracing::error!("Invalid schema pattern {}: {}", pattern, e);
            Regex::new(REJECT_ALL_PATTERN)
        })
        .ok()
}

fn enum_of(values: &[&str]) -> FieldConstraint {
    FieldConstraint::Str {
        max_len: 32,
        pattern: None,
        allowed: Some(values.iter().map(|s| s.to_string()).collect()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quill_core::Change;
    use serde_json::json;

    fn paths(report: &ValidationReport) -> Vec<&str> {
        report.errors.iter().map(|e| e.path.as_str()).collect()
    }

    #[test]
    fn test_field_patterns_compile() {
        for pattern in [SELECTOR_PATTERN, CSS_VAR_PATTERN, CSS_VALUE_PATTERN] {
            assert!(Regex::new(pattern).is_ok(), "{}", pattern);
            let compiled = compile(pattern).map(|r| r.as_str().to_string());
            assert_eq!(compiled.as_deref(), Some(pattern));
        }
    }

    #[test]
    fn test_broken_pattern_rejects_everything() {
        let regex = compile("([unclosed").unwrap();
        assert!(!regex.is_match("#main-title"));
        assert!(!regex.is_match(""));
    }

    #[test]
    fn test_revalidation_is_stable_and_pure() {
        let value = json!({
            "version": "1.0",
            "changes": [
                {"op": "set_text", "selector": "#subtitle", "text": "新品上市"},
                {"op": "set_prop", "selector": "#main-title", "prop": "font_weight", "value": "bold"}
            ]
        });
        let before = value.clone();

        let first = validate(&value);
        let second = validate(&value);
        assert!(first.valid, "{:?}", first.errors);
        assert_eq!(first, second);
        assert_eq!(value, before);

        let invalid = json!({"version": "1.0", "changes": [{"op": "toggle", "selector": "#x y"}]});
        let invalid_before = invalid.clone();
        assert_eq!(validate(&invalid), validate(&invalid));
        assert_eq!(invalid, invalid_before);
    }

    #[test]
    fn test_valid_document() {
        let report = validate(&json!({
            "version": "1.0",
            "changes": [
                {"op": "set_text", "selector": "#main-title", "text": "欢迎"},
                {"op": "set_style_var", "selector": "body", "var": "--color-primary", "value": "green"},
                {"op": "toggle", "selector": "#banner", "visible": false},
                {"op": "reorder", "selector": ".card-list", "order": [2, 0, 1]},
                {"op": "set_prop", "selector": ".hero", "prop": "opacity", "value": 80}
            ]
        }));
        assert!(report.valid, "{:?}", report.errors);
    }

    #[test]
    fn test_non_object_stops_early() {
        let report = validate(&json!([1, 2]));
        assert!(!report.valid);
        assert_eq!(paths(&report), vec!["$"]);
    }

    #[test]
    fn test_version_and_changes_bounds() {
        let report = validate(&json!({"version": "2.0", "changes": []}));
        assert_eq!(paths(&report), vec!["version", "changes"]);

        let too_many: Vec<_> = (0..21)
            .map(|_| json!({"op": "toggle", "selector": "#banner", "visible": true}))
            .collect();
        let report = validate(&json!({"version": "1.0", "changes": too_many}));
        assert_eq!(report.errors.len(), 1);
        assert!(report.errors[0].message.contains("at most 20"));
    }

    #[test]
    fn test_collects_every_error() {
        let report = validate(&json!({
            "version": "1.0",
            "changes": [
                {"op": "delete_node", "selector": "#x"},
                {"op": "set_text", "selector": "#main-title", "text": 5, "html": "<b>"},
                {"op": "toggle", "visible": "yes"}
            ],
            "extra": true
        }));

        assert_eq!(
            paths(&report),
            vec![
                "extra",
                "changes[0].op",
                "changes[1].text",
                "changes[1].html",
                "changes[2].selector",
                "changes[2].visible",
            ]
        );
    }

    #[test]
    fn test_selector_and_var_formats() {
        let report = validate(&json!({
            "version": "1.0",
            "changes": [
                {"op": "set_style_var", "selector": "div > script", "var": "color", "value": "url(x)"}
            ]
        }));
        assert_eq!(
            paths(&report),
            vec!["changes[0].selector", "changes[0].var", "changes[0].value"]
        );
    }

    #[test]
    fn test_text_length_limit() {
        let long = "字".repeat(MAX_TEXT_LEN + 1);
        let report = validate(&json!({
            "version": "1.0",
            "changes": [{"op": "set_text", "selector": "#subtitle", "text": long}]
        }));
        assert_eq!(report.messages(), vec!["changes[0].text: must be at most 200 characters"]);
    }

    #[test]
    fn test_reorder_items() {
        let report = validate(&json!({
            "version": "1.0",
            "changes": [{"op": "reorder", "selector": ".card-list", "order": [0, -1, "2"]}]
        }));
        assert_eq!(paths(&report), vec!["changes[0].order[1]", "changes[0].order[2]"]);
    }

    #[test]
    fn test_set_prop_value_schemas() {
        let doc = |prop: &str, value: Value| {
            json!({
                "version": "1.0",
                "changes": [{"op": "set_prop", "selector": ".hero", "prop": prop, "value": value}]
            })
        };

        assert!(validate(&doc("font_size", json!(16))).valid);
        assert!(validate(&doc("text_align", json!("center"))).valid);
        assert!(!validate(&doc("font_size", json!(100))).valid);
        assert!(!validate(&doc("opacity", json!(0.5))).valid);
        assert!(!validate(&doc("font_weight", json!("heavy"))).valid);
        assert!(!validate(&doc("border_radius", json!(49))).valid);

        let report = validate(&doc("z_index", json!(9)));
        assert_eq!(paths(&report), vec!["changes[0].prop"]);
    }

    #[test]
    fn test_into_document() {
        let doc = into_document(json!({
            "version": "1.0",
            "changes": [{"op": "toggle", "selector": "#banner", "visible": false}]
        }))
        .unwrap();
        assert_eq!(
            doc.changes,
            vec![Change::Toggle {
                selector: "#banner".to_string(),
                visible: false
            }]
        );

        let err = into_document(json!({"version": "1.0"})).unwrap_err();
        assert_eq!(err.messages(), vec!["changes: is required"]);
    }

    #[test]
    fn test_validate_document() {
        let doc = DslDocument::new(vec![Change::SetText {
            selector: "#main-title".to_string(),
            text: "Hello".to_string(),
        }]);
        assert!(validate_document(&doc).valid);
        assert!(!validate_document(&DslDocument::new(Vec::new())).valid);
    }
}
