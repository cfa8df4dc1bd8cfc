// ⚠️ Error taxonomy for the Doc Inc core
//
// Storage failures are fatal and surface to the caller. "Not found" is
// suppressed to `false` at the verify boundary so callers cannot enumerate
// accounts through the error type.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    /// Malformed identifier or rejected input
    #[error("Validation error: {field}: {message}")]
    Validation { field: String, message: String },

    #[error("Not found: {entity} {id}")]
    NotFound { entity: &'static str, id: String },

    /// Account linked to another user, duplicate registration, ...
    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Permission denied: {reason}")]
    PermissionDenied { reason: String },

    #[error("Storage error: {0}")]
    Storage(String),
}

impl CoreError {
    pub fn validation(field: &str, message: impl Into<String>) -> Self {
        CoreError::Validation {
            field: field.to_string(),
            message: message.into(),
        }
    }

    pub fn not_found(entity: &'static str, id: impl Into<String>) -> Self {
        CoreError::NotFound {
            entity,
            id: id.into(),
        }
    }

    pub fn permission_denied(reason: impl Into<String>) -> Self {
        CoreError::PermissionDenied {
            reason: reason.into(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, CoreError::NotFound { .. })
    }
}

impl From<rusqlite::Error> for CoreError {
    fn from(err: rusqlite::Error) -> Self {
        CoreError::Storage(err.to_string())
    }
}

pub type CoreResult<T> = Result<T, CoreError>;

/// True when a SQLite error is a UNIQUE / PRIMARY KEY violation
pub(crate) fn is_constraint_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _) if e.code == rusqlite::ErrorCode::ConstraintViolation
    )
}
