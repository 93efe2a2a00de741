use std::fmt;

use serde::Serialize;

/// Which constraint a rejected input violated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ValidationRule {
    Empty,
    TooLong { max: usize },
    OutOfRange { min: i64, max: i64 },
}

impl fmt::Display for ValidationRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Empty => f.write_str("must not be empty"),
            Self::TooLong { max } => write!(f, "must be at most {max} characters"),
            Self::OutOfRange { min, max } => write!(f, "must be between {min} and {max}"),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SecretError {
    /// Caller input violates a constraint. Expected, never logged as a failure.
    #[error("invalid {field}: {rule}")]
    Validation {
        field: &'static str,
        rule: ValidationRule,
    },

    /// Never existed, already burned, expired, or an unparseable id.
    /// Deliberately a single variant so callers cannot tell these apart.
    #[error("not found or expired")]
    NotFound,

    #[error("storage failure: {0:#}")]
    Storage(anyhow::Error),

    /// Encryption or decryption failed. No plaintext accompanies this error.
    #[error("crypto failure: {0:#}")]
    Crypto(anyhow::Error),
}

impl SecretError {
    pub(crate) fn validation(field: &'static str, rule: ValidationRule) -> Self {
        Self::Validation { field, rule }
    }

    /// True for failures that indicate a fault in the server rather than the request.
    pub fn is_internal(&self) -> bool {
        matches!(self, Self::Storage(_) | Self::Crypto(_))
    }
}
