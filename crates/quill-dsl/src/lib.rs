//! # Quill DSL
//!
//! Two halves of getting from a request to a document the engine trusts:
//!
//! - **Intent Parser**: ordered, independent rules that turn short Chinese
//!   or English editing requests into `Change`s
//! - **Schema Validator**: structural validation of untyped DSL JSON that
//!   reports every violation with its path
//!
//! Neither half performs security screening; that belongs to
//! `quill-security`.

pub mod intent;
pub mod schema;

pub use intent::{
    parse, resolve_color, BannerRule, IntentError, IntentParser, IntentRule, NormalizedInput,
    SetTextRule, ThemeColorRule, GUIDANCE, MAX_VALUE_CHARS,
};
pub use schema::{
    into_document, validate, validate_document, FieldConstraint, FieldError, OpSchema,
    SchemaValidator, ValidationReport, MAX_REORDER_ITEMS, MAX_TEXT_LEN,
};
