use sqlx::Error as SqlxError;
use std::path::PathBuf;
use thiserror::Error as ThisError;

use crate::policy::Operation;

#[derive(Debug, ThisError)]
pub enum WardenError {
    /// Driver errors pass through untouched.
    #[error(transparent)]
    Database(#[from] SqlxError),

    #[error("Configuration error: {0}")]
    Config(#[from] figment::Error),

    #[error("Policy file not found: {}", .0.display())]
    PolicyFileMissing(PathBuf),

    #[error("Access denied: {operation} on `{model}`: {reason}")]
    Denied {
        model: String,
        operation: Operation,
        reason: String,
    },

    #[error("Invalid identifier: {0:?}")]
    InvalidIdentifier(String),

    #[error("Invalid data: {0}")]
    InvalidData(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl WardenError {
    pub fn denied(model: &str, operation: Operation, reason: impl Into<String>) -> Self {
        WardenError::Denied {
            model: model.to_string(),
            operation,
            reason: reason.into(),
        }
    }

    pub fn is_denied(&self) -> bool {
        matches!(self, WardenError::Denied { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn database_errors_display_unmodified() {
        let inner = SqlxError::Configuration("relative URL without a base".into());
        let expected = inner.to_string();
        let err: WardenError = inner.into();
        assert_eq!(err.to_string(), expected);
    }

    #[test]
    fn denied_message_names_model_and_operation() {
        let err = WardenError::denied("post", Operation::Update, "no allow rule matched");
        assert!(err.is_denied());
        assert_eq!(
            err.to_string(),
            "Access denied: update on `post`: no allow rule matched"
        );
    }
}
