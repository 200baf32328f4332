//! DSL Document Model
//!
//! The whitelisted mutation language produced by the intent parser and
//! consumed by the DOM executor. Structural checks live in `quill-dsl`,
//! safety checks in `quill-security`; both inspect these same types.

use crate::error::{CoreError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Supported DSL version
pub const DSL_VERSION: &str = "1.0";

/// Maximum number of changes in one document
pub const MAX_CHANGES: usize = 20;

/// A versioned, ordered list of changes
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DslDocument {
    /// Must equal `DSL_VERSION`
    pub version: String,

    /// Applied in order by the executor
    pub changes: Vec<Change>,
}

impl DslDocument {
    /// Create a document at the supported version
    pub fn new(changes: Vec<Change>) -> Self {
        Self {
            version: DSL_VERSION.to_string(),
            changes,
        }
    }

    /// Number of changes
    pub fn len(&self) -> usize {
        self.changes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    /// Convert into the untyped JSON form the schema validator reads
    pub fn to_value(&self) -> Result<serde_json::Value> {
        serde_json::to_value(self).map_err(|e| CoreError::Serialization(e.to_string()))
    }

    /// Deserialize from the untyped JSON form
    pub fn from_value(value: serde_json::Value) -> Result<Self> {
        serde_json::from_value(value).map_err(|e| CoreError::Serialization(e.to_string()))
    }
}

/// One declarative mutation, tagged by `op`
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case", deny_unknown_fields)]
pub enum Change {
    /// Replace the text content of an element
    SetText { selector: String, text: String },

    /// Set a CSS custom property on an element
    SetStyleVar {
        selector: String,
        var: String,
        value: String,
    },

    /// Show or hide an element
    Toggle { selector: String, visible: bool },

    /// Reorder the children of an element by index
    Reorder { selector: String, order: Vec<u32> },

    /// Set a whitelisted presentation property
    SetProp {
        selector: String,
        prop: String,
        value: serde_json::Value,
    },
}

impl Change {
    /// Operation discriminant
    pub fn op(&self) -> OpKind {
        match self {
            Change::SetText { .. } => OpKind::SetText,
            Change::SetStyleVar { .. } => OpKind::SetStyleVar,
            Change::Toggle { .. } => OpKind::Toggle,
            Change::Reorder { .. } => OpKind::Reorder,
            Change::SetProp { .. } => OpKind::SetProp,
        }
    }

    /// Target selector
    pub fn selector(&self) -> &str {
        match self {
            Change::SetText { selector, .. }
            | Change::SetStyleVar { selector, .. }
            | Change::Toggle { selector, .. }
            | Change::Reorder { selector, .. }
            | Change::SetProp { selector, .. } => selector,
        }
    }

    /// CSS variable name, for `set_style_var`
    pub fn css_var(&self) -> Option<&str> {
        match self {
            Change::SetStyleVar { var, .. } => Some(var),
            _ => None,
        }
    }

    /// Free-text fields that end up on the page, as `(field, value)` pairs
    pub fn text_fields(&self) -> Vec<(&'static str, &str)> {
        match self {
            Change::SetText { text, .. } => vec![("text", text.as_str())],
            Change::SetStyleVar { value, .. } => vec![("value", value.as_str())],
            Change::SetProp { prop, value, .. } => {
                let mut fields = vec![("prop", prop.as_str())];
                if let Some(s) = value.as_str() {
                    fields.push(("value", s));
                }
                fields
            }
            Change::Toggle { .. } | Change::Reorder { .. } => Vec::new(),
        }
    }
}

/// DSL operation names
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OpKind {
    SetText,
    SetStyleVar,
    Toggle,
    Reorder,
    SetProp,
}

impl OpKind {
    /// All operations, in declaration order
    pub const ALL: [OpKind; 5] = [
        OpKind::SetText,
        OpKind::SetStyleVar,
        OpKind::Toggle,
        OpKind::Reorder,
        OpKind::SetProp,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            OpKind::SetText => "set_text",
            OpKind::SetStyleVar => "set_style_var",
            OpKind::Toggle => "toggle",
            OpKind::Reorder => "reorder",
            OpKind::SetProp => "set_prop",
        }
    }
}

impl fmt::Display for OpKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OpKind {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self> {
        OpKind::ALL
            .iter()
            .copied()
            .find(|op| op.as_str() == s)
            .ok_or_else(|| CoreError::UnknownOperation(s.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_change_serializes_with_op_tag() {
        let change = Change::SetStyleVar {
            selector: "body".to_string(),
            var: "--color-primary".to_string(),
            value: "green".to_string(),
        };

        let value = serde_json::to_value(&change).unwrap();
        assert_eq!(
            value,
            json!({"op": "set_style_var", "selector": "body", "var": "--color-primary", "value": "green"})
        );
    }

    #[test]
    fn test_document_from_value() {
        let doc = DslDocument::from_value(json!({
            "version": "1.0",
            "changes": [
                {"op": "toggle", "selector": "#banner", "visible": false},
                {"op": "reorder", "selector": ".card-list", "order": [2, 0, 1]}
            ]
        }))
        .unwrap();

        assert_eq!(doc.len(), 2);
        assert_eq!(doc.changes[0].op(), OpKind::Toggle);
        assert_eq!(doc.changes[1].selector(), ".card-list");
    }

    #[test]
    fn test_from_value_rejects_unknown_fields() {
        let extra_change_field = DslDocument::from_value(json!({
            "version": "1.0",
            "changes": [
                {"op": "set_text", "selector": "#main-title", "text": "x", "html": "<script>"}
            ]
        }));
        assert!(matches!(extra_change_field, Err(CoreError::Serialization(_))));

        let extra_document_field = DslDocument::from_value(json!({
            "version": "1.0",
            "changes": [{"op": "toggle", "selector": "#banner", "visible": true}],
            "script": "alert(1)"
        }));
        assert!(extra_document_field.is_err());
    }

    #[test]
    fn test_text_fields() {
        let change = Change::SetProp {
            selector: "#main-title".to_string(),
            prop: "font_weight".to_string(),
            value: json!("bold"),
        };
        assert_eq!(change.text_fields(), vec![("prop", "font_weight"), ("value", "bold")]);

        let toggle = Change::Toggle {
            selector: "#banner".to_string(),
            visible: true,
        };
        assert!(toggle.text_fields().is_empty());
        assert_eq!(toggle.css_var(), None);
    }

    #[test]
    fn test_op_kind_from_str() {
        assert_eq!("set_prop".parse::<OpKind>().unwrap(), OpKind::SetProp);
        assert!("delete_node".parse::<OpKind>().is_err());
    }
}
