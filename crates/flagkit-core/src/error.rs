//! Error types for flagkit-core

use thiserror::Error;

use crate::flagging::{FlaggingId, TargetRef};

/// Result type alias for flagkit operations
pub type Result<T> = std::result::Result<T, FlagError>;

/// Main error type for flagkit operations
#[derive(Error, Debug)]
pub enum FlagError {
    /// The operation named a flag id that is not registered
    #[error("Unknown flag definition: {0}")]
    UnknownFlagDefinition(String),

    /// A flag with the same id is already registered
    #[error("Flag already registered: {0}")]
    AlreadyRegistered(String),

    /// A flag definition failed validation
    #[error("Invalid flag definition '{flag_id}': {}", .issues.join("; "))]
    InvalidDefinition { flag_id: String, issues: Vec<String> },

    /// Ledger and counters disagree (e.g. a count would go negative).
    /// The counts for the flag must be rebuilt from the ledger.
    #[error("Invariant violation on flag '{flag_id}': {detail}")]
    InvariantViolation { flag_id: String, detail: String },

    /// A flagging was asked to point at a different target entity
    #[error("Flagging {id} is bound to {bound} and cannot be moved to {requested}")]
    ImmutableRelationViolation {
        id: FlaggingId,
        bound: TargetRef,
        requested: TargetRef,
    },

    /// The target entity type does not match the flag's entity type
    #[error("Flag '{flag_id}' applies to '{expected}' entities, not '{actual}'")]
    TargetTypeMismatch {
        flag_id: String,
        expected: String,
        actual: String,
    },

    /// The target's bundle is not one the flag is limited to
    #[error("Flag '{flag_id}' cannot be used on bundle '{bundle}'")]
    BundleNotAllowed { flag_id: String, bundle: String },

    /// No flagging with this id exists
    #[error("Flagging not found: {0}")]
    FlaggingNotFound(FlaggingId),

    /// The persistence layer did not answer in time (retryable)
    #[error("Persistence timeout: {0}")]
    PersistenceTimeout(String),

    /// A concurrent writer won a race the guarded path did not cover (retryable)
    #[error("Persistence conflict: {0}")]
    PersistenceConflict(String),

    /// Any other storage failure
    #[error("Storage error: {0}")]
    Storage(String),

    /// Configuration could not be loaded or is invalid
    #[error("Configuration error: {0}")]
    Config(String),
}

impl FlagError {
    /// Whether the caller may retry the whole operation.
    ///
    /// flag/unflag are idempotent, so retrying after a transient
    /// persistence failure never duplicates state.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            FlagError::PersistenceTimeout(_) | FlagError::PersistenceConflict(_)
        )
    }

    /// Whether the error means counts must be rebuilt from the ledger.
    pub fn needs_rebuild(&self) -> bool {
        matches!(self, FlagError::InvariantViolation { .. })
    }
}

#[cfg(feature = "sqlite")]
impl From<rusqlite::Error> for FlagError {
    fn from(err: rusqlite::Error) -> Self {
        if let rusqlite::Error::SqliteFailure(ref failure, _) = err {
            match failure.code {
                rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked => {
                    return FlagError::PersistenceTimeout(err.to_string());
                }
                rusqlite::ErrorCode::ConstraintViolation => {
                    return FlagError::PersistenceConflict(err.to_string());
                }
                _ => {}
            }
        }
        FlagError::Storage(err.to_string())
    }
}

impl From<serde_json::Error> for FlagError {
    fn from(err: serde_json::Error) -> Self {
        FlagError::Storage(format!("serialization: {}", err))
    }
}

impl From<toml::de::Error> for FlagError {
    fn from(err: toml::de::Error) -> Self {
        FlagError::Config(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_only_for_transient_persistence() {
        assert!(FlagError::PersistenceTimeout("busy".into()).is_retryable());
        assert!(FlagError::PersistenceConflict("race".into()).is_retryable());
        assert!(!FlagError::UnknownFlagDefinition("bookmark".into()).is_retryable());
        assert!(!FlagError::InvariantViolation {
            flag_id: "bookmark".into(),
            detail: "negative".into(),
        }
        .is_retryable());
    }

    #[test]
    fn invalid_definition_lists_issues() {
        let err = FlagError::InvalidDefinition {
            flag_id: "Bad Id".into(),
            issues: vec!["id must be a machine name".into(), "label is required".into()],
        };
        let msg = err.to_string();
        assert!(msg.contains("machine name"));
        assert!(msg.contains("label is required"));
    }

    #[cfg(feature = "sqlite")]
    #[test]
    fn busy_maps_to_timeout() {
        let err = rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_BUSY),
            Some("database is locked".into()),
        );
        assert!(matches!(FlagError::from(err), FlagError::PersistenceTimeout(_)));
    }
}
