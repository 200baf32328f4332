//! Error types for Quill core operations

use thiserror::Error;

/// Result type alias for core operations
pub type Result<T> = std::result::Result<T, CoreError>;

/// Errors raised by the core types
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CoreError {
    /// Conversion between typed and untyped DSL failed
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Operation name is not part of the DSL
    #[error("Unknown operation: {0}")]
    UnknownOperation(String),
}
