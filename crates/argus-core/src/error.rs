//! Error types for rule management.

use thiserror::Error;

use crate::rules::RuleKind;

/// Errors raised when mutating a rule set.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RuleError {
    /// The value is already present for this kind.
    #[error("{kind} rule \"{value}\" already exists")]
    DuplicateRule { kind: RuleKind, value: String },

    /// The value is not present for this kind.
    #[error("{kind} rule \"{value}\" not found")]
    NotFound { kind: RuleKind, value: String },

    /// The value is empty or malformed after normalization.
    #[error("invalid {kind} rule: {reason}")]
    InvalidRule { kind: RuleKind, reason: String },
}
