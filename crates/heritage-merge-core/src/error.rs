use crate::merge::MergeState;
use rusqlite::ErrorCode;
use serde::Serialize;
use serde_json::json;
use std::fmt;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Merge(#[from] MergeError),

    #[error("{0}")]
    Other(String),
}

/// The step of a merge (or schema check / duplicate scan) an error was raised in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeStep {
    SchemaCheck,
    Finding,
    Validating,
    Locking,
    Previewing,
    RewritingReferences,
    ReconcilingFields,
    DeletingLosers,
    Verifying,
    Committing,
}

impl MergeStep {
    pub fn as_str(&self) -> &'static str {
        match self {
            MergeStep::SchemaCheck => "schema_check",
            MergeStep::Finding => "finding",
            MergeStep::Validating => "validating",
            MergeStep::Locking => "locking",
            MergeStep::Previewing => "previewing",
            MergeStep::RewritingReferences => "rewriting_references",
            MergeStep::ReconcilingFields => "reconciling_fields",
            MergeStep::DeletingLosers => "deleting_losers",
            MergeStep::Verifying => "verifying",
            MergeStep::Committing => "committing",
        }
    }

    /// Steps that run after the merge transaction has been opened.
    pub fn is_execution(&self) -> bool {
        matches!(
            self,
            MergeStep::RewritingReferences
                | MergeStep::ReconcilingFields
                | MergeStep::DeletingLosers
                | MergeStep::Verifying
                | MergeStep::Committing
        )
    }
}

impl fmt::Display for MergeStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error kinds surfaced to callers of the merge interface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ErrorKind {
    InvalidMergeRequest,
    ReferenceIntegrityError,
    MergeConflictError,
    MergeTimeoutError,
    StoreUnavailable,
}

#[derive(Error, Debug)]
pub enum MergeError {
    #[error("invalid merge request: {reason}")]
    InvalidRequest { step: MergeStep, reason: String },

    #[error("reference integrity error: {reason}")]
    ReferenceIntegrity {
        step: MergeStep,
        table: Option<String>,
        column: Option<String>,
        reason: String,
    },

    #[error("merge conflict: {reason}")]
    Conflict {
        step: MergeStep,
        ids: Vec<String>,
        reason: String,
    },

    #[error("merge timed out during {step} after {elapsed_ms}ms")]
    Timeout { step: MergeStep, elapsed_ms: u64 },

    #[error("store unavailable during {step}: {source}")]
    StoreUnavailable {
        step: MergeStep,
        #[source]
        source: rusqlite::Error,
    },
}

impl MergeError {
    pub fn invalid(step: MergeStep, reason: impl Into<String>) -> Self {
        MergeError::InvalidRequest {
            step,
            reason: reason.into(),
        }
    }

    pub fn integrity(step: MergeStep, reason: impl Into<String>) -> Self {
        MergeError::ReferenceIntegrity {
            step,
            table: None,
            column: None,
            reason: reason.into(),
        }
    }

    pub fn integrity_at(
        step: MergeStep,
        table: &str,
        column: Option<&str>,
        reason: impl Into<String>,
    ) -> Self {
        MergeError::ReferenceIntegrity {
            step,
            table: Some(table.to_string()),
            column: column.map(str::to_string),
            reason: reason.into(),
        }
    }

    /// Wrap a store error raised in `step` as `StoreUnavailable`.
    pub fn store(step: MergeStep) -> impl FnOnce(rusqlite::Error) -> MergeError {
        move |source| MergeError::StoreUnavailable { step, source }
    }

    pub fn step(&self) -> MergeStep {
        match self {
            MergeError::InvalidRequest { step, .. }
            | MergeError::ReferenceIntegrity { step, .. }
            | MergeError::Conflict { step, .. }
            | MergeError::Timeout { step, .. }
            | MergeError::StoreUnavailable { step, .. } => *step,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            MergeError::InvalidRequest { .. } => ErrorKind::InvalidMergeRequest,
            MergeError::ReferenceIntegrity { .. } => ErrorKind::ReferenceIntegrityError,
            MergeError::Conflict { .. } => ErrorKind::MergeConflictError,
            MergeError::Timeout { .. } => ErrorKind::MergeTimeoutError,
            MergeError::StoreUnavailable { .. } => ErrorKind::StoreUnavailable,
        }
    }

    /// Conflicts, timeouts and store outages may succeed on a later attempt.
    /// Request and schema errors need a correction first.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::MergeConflictError | ErrorKind::MergeTimeoutError | ErrorKind::StoreUnavailable
        )
    }

    /// Terminal state of the merge that produced this error.
    pub fn terminal_state(&self) -> MergeState {
        if self.step().is_execution() {
            MergeState::RolledBack
        } else {
            MergeState::Rejected
        }
    }

    pub fn to_error_object(&self) -> ErrorObject {
        let mut details = json!({
            "step": self.step(),
            "state": self.terminal_state(),
            "retryable": self.is_retryable(),
        });
        match self {
            MergeError::ReferenceIntegrity { table, column, .. } => {
                details["table"] = json!(table);
                details["column"] = json!(column);
            }
            MergeError::Conflict { ids, .. } => {
                details["ids"] = json!(ids);
            }
            MergeError::Timeout { elapsed_ms, .. } => {
                details["elapsedMs"] = json!(elapsed_ms);
            }
            MergeError::StoreUnavailable { source, .. } => {
                details["cause"] = json!(source.to_string());
            }
            MergeError::InvalidRequest { .. } => {}
        }
        ErrorObject {
            error_kind: self.kind(),
            message: self.to_string(),
            details,
        }
    }
}

/// Serialized form of a failed merge.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorObject {
    pub error_kind: ErrorKind,
    pub message: String,
    pub details: serde_json::Value,
}

/// True when SQLite could not take a lock within its busy timeout.
pub(crate) fn is_busy(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _)
            if matches!(e.code, ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked)
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validation_errors_are_rejected_and_not_retryable() {
        let err = MergeError::invalid(MergeStep::Validating, "winner listed as loser");
        assert_eq!(err.kind(), ErrorKind::InvalidMergeRequest);
        assert_eq!(err.terminal_state(), MergeState::Rejected);
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_execution_errors_roll_back() {
        let err = MergeError::Timeout {
            step: MergeStep::RewritingReferences,
            elapsed_ms: 1200,
        };
        assert_eq!(err.terminal_state(), MergeState::RolledBack);
        assert!(err.is_retryable());

        let obj = err.to_error_object();
        assert_eq!(obj.error_kind, ErrorKind::MergeTimeoutError);
        assert_eq!(obj.details["step"], "rewriting_references");
        assert_eq!(obj.details["state"], "rolled_back");
        assert_eq!(obj.details["elapsedMs"], 1200);
    }

    #[test]
    fn test_error_object_serializes_kind_names() {
        let err = MergeError::integrity_at(
            MergeStep::SchemaCheck,
            "notes",
            Some("source_id"),
            "unmapped foreign key",
        );
        let value = serde_json::to_value(err.to_error_object()).unwrap();
        assert_eq!(value["errorKind"], "ReferenceIntegrityError");
        assert_eq!(value["details"]["table"], "notes");
        assert_eq!(value["details"]["column"], "source_id");
    }
}
