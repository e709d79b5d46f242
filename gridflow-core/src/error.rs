//! Error types for GridFlow
//!
//! Provides a unified error type for core operations.

use thiserror::Error;

/// Result type alias for core operations
pub type Result<T> = std::result::Result<T, GridFlowError>;

/// Unified error type for GridFlow core primitives
#[derive(Error, Debug)]
pub enum GridFlowError {
    // ===== Expression Errors =====
    #[error("Invalid selection expression: {0}")]
    Expression(String),

    #[error("Unexpected token '{token}' at position {position}")]
    UnexpectedToken { token: String, position: usize },

    #[error("Unbalanced parentheses in expression")]
    UnbalancedParentheses,

    // ===== Identifier Errors =====
    #[error("Invalid data identifier: {0}")]
    InvalidIdentifier(String),

    // ===== Generic Errors =====
    #[error("Internal error: {0}")]
    Internal(String),
}
