use std::collections::HashMap;
use std::error::Error as StdError;
use std::fmt;
use std::time::Duration;

use anyhow::Error as AnyhowError;
use serde::{Deserialize, Serialize};
use serde_json::Error as SerdeJsonError;
use sqlx::Error as SqlxError;
use std::io::Error as IoError;

/// A structured error carried through every migration operation.
///
/// Codes are namespaced (`PATTERN/...`, `STORE/...`, `EVENT/...`) so callers
/// can branch on the failure class without string matching on messages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppError {
    /// Machine readable error code.
    pub code: String,
    /// Human readable message.
    pub message: String,
    /// Key/value pairs describing where the failure happened.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub context: HashMap<String, String>,
    /// Optional nested cause that preserves the error chain.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cause: Option<Box<AppError>>,
}

pub type AppResult<T> = std::result::Result<T, AppError>;

impl AppError {
    /// Default code used when an upstream error does not expose a specific code.
    pub const UNKNOWN_CODE: &'static str = "APP/UNKNOWN";
    /// Code used for errors created from free-form messages.
    pub const GENERIC_CODE: &'static str = "APP/GENERIC";

    pub const UNKNOWN_PATTERN: &'static str = "PATTERN/UNKNOWN";
    pub const PREPARE_UNSUPPORTED: &'static str = "PROXY/PREPARE_UNSUPPORTED";
    pub const READ_ONLY_TX: &'static str = "PROXY/READ_ONLY_TX";
    pub const STORE_TIMEOUT: &'static str = "STORE/TIMEOUT";
    pub const INVALID_IDENTIFIER: &'static str = "STORE/INVALID_IDENTIFIER";
    pub const UNKNOWN_EVENT_KIND: &'static str = "EVENT/UNKNOWN_KIND";
    pub const UNKNOWN_DIRECTION: &'static str = "EVENT/UNKNOWN_DIRECTION";
    pub const EVENT_DECODE: &'static str = "EVENT/DECODE";
    pub const TASK_FAILED: &'static str = "VALIDATOR/TASK_FAILED";
    pub const JOB_RUNNING: &'static str = "SCHEDULER/JOB_RUNNING";
    pub const JOB_FAILED: &'static str = "SCHEDULER/JOB_FAILED";

    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        AppError {
            code: code.into(),
            message: message.into(),
            context: HashMap::new(),
            cause: None,
        }
    }

    pub fn unknown_pattern(value: impl Into<String>) -> Self {
        AppError::new(Self::UNKNOWN_PATTERN, "unknown pattern").with_context("pattern", value)
    }

    pub fn timeout(operation: &str, after: Duration) -> Self {
        AppError::new(Self::STORE_TIMEOUT, "store call timed out")
            .with_context("operation", operation)
            .with_context("timeout_ms", after.as_millis().to_string())
    }

    pub fn code(&self) -> &str {
        &self.code
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn context(&self) -> &HashMap<String, String> {
        &self.context
    }

    pub fn cause(&self) -> Option<&AppError> {
        self.cause.as_deref()
    }

    /// True for failures that describe a malformed or unrecognised event.
    /// Redelivering such an event can never succeed.
    pub fn is_poison_event(&self) -> bool {
        self.code.starts_with("EVENT/")
    }

    pub fn with_context(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }

    pub fn with_cause(mut self, cause: impl Into<AppError>) -> Self {
        self.cause = Some(Box::new(cause.into()));
        self
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.context.is_empty() {
            write!(f, "[{}] {}", self.code, self.message)
        } else {
            let mut pairs: Vec<_> = self.context.iter().collect();
            pairs.sort();
            write!(f, "[{}] {} ({:?})", self.code, self.message, pairs)
        }
    }
}

impl std::error::Error for AppError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.cause
            .as_deref()
            .map(|cause| cause as &(dyn std::error::Error + 'static))
    }
}

impl From<&str> for AppError {
    fn from(message: &str) -> Self {
        AppError::new(AppError::GENERIC_CODE, message)
    }
}

impl From<String> for AppError {
    fn from(message: String) -> Self {
        AppError::new(AppError::GENERIC_CODE, message)
    }
}

impl From<AnyhowError> for AppError {
    fn from(error: AnyhowError) -> Self {
        fn convert(err: &(dyn StdError + 'static)) -> AppError {
            if let Some(app) = err.downcast_ref::<AppError>() {
                return app.clone();
            }

            let mut root = AppError::new(AppError::UNKNOWN_CODE, err.to_string());
            if let Some(source) = err.source() {
                root.cause = Some(Box::new(convert(source)));
            }
            root
        }

        convert(error.as_ref())
    }
}

impl From<IoError> for AppError {
    fn from(error: IoError) -> Self {
        let code = format!("IO/{:?}", error.kind());
        let mut app_error = AppError::new(code, error.to_string());
        if let Some(os_code) = error.raw_os_error() {
            app_error = app_error.with_context("os_code", os_code.to_string());
        }
        app_error
    }
}

impl From<SerdeJsonError> for AppError {
    fn from(error: SerdeJsonError) -> Self {
        let code = if error.is_data() {
            "JSON/DATA"
        } else if error.is_syntax() {
            "JSON/SYNTAX"
        } else if error.is_eof() {
            "JSON/EOF"
        } else {
            "JSON/ERROR"
        };
        let mut app_error = AppError::new(code, error.to_string());
        if error.line() > 0 {
            app_error = app_error.with_context("line", error.line().to_string());
        }
        app_error
    }
}

impl From<SqlxError> for AppError {
    fn from(error: SqlxError) -> Self {
        match error {
            SqlxError::RowNotFound => AppError::new("SQLX/ROW_NOT_FOUND", "Record not found"),
            SqlxError::ColumnNotFound(name) => {
                AppError::new("SQLX/COLUMN_NOT_FOUND", format!("Column not found: {name}"))
            }
            SqlxError::PoolTimedOut => AppError::new(
                "SQLX/POOL_TIMEOUT",
                "Timed out acquiring a database connection",
            ),
            SqlxError::PoolClosed => AppError::new("SQLX/POOL_CLOSED", "Database pool is closed"),
            SqlxError::Io(err) => AppError::from(err).with_context("source", "sqlx"),
            SqlxError::Database(db) => {
                let code = db
                    .code()
                    .map(|code| format!("Sqlite/{code}"))
                    .unwrap_or_else(|| "SQLX/DATABASE".to_string());
                let mut app_error = AppError::new(code, db.message().to_string());
                if let Some(constraint) = db.constraint() {
                    app_error = app_error.with_context("constraint", constraint.to_string());
                }
                app_error
            }
            SqlxError::ColumnDecode { index, source } => {
                AppError::new("SQLX/COLUMN_DECODE", source.to_string())
                    .with_context("column", index)
            }
            SqlxError::Decode(decode_err) => AppError::new("SQLX/DECODE", decode_err.to_string()),
            other => AppError::new("SQLX/ERROR", other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Context;

    #[test]
    fn display_includes_code_and_sorted_context() {
        let err = AppError::new("STORE/TIMEOUT", "store call timed out")
            .with_context("timeout_ms", "1000")
            .with_context("operation", "find");
        let rendered = err.to_string();
        assert!(rendered.starts_with("[STORE/TIMEOUT] store call timed out"));
        let op = rendered.find("operation").expect("operation key");
        let ms = rendered.find("timeout_ms").expect("timeout key");
        assert!(op < ms);
    }

    #[test]
    fn unknown_pattern_records_offending_value() {
        let err = AppError::unknown_pattern("Sideways");
        assert_eq!(err.code(), AppError::UNKNOWN_PATTERN);
        assert_eq!(err.context().get("pattern"), Some(&"Sideways".to_string()));
    }

    #[test]
    fn poison_events_are_recognised_by_code() {
        assert!(AppError::new(AppError::UNKNOWN_EVENT_KIND, "x").is_poison_event());
        assert!(AppError::new(AppError::EVENT_DECODE, "x").is_poison_event());
        assert!(!AppError::new(AppError::STORE_TIMEOUT, "x").is_poison_event());
    }

    #[test]
    fn anyhow_chain_becomes_nested_causes() {
        let err = (|| -> anyhow::Result<()> {
            Err(std::io::Error::new(std::io::ErrorKind::Other, "disk full"))
                .context("failed to publish")
        })()
        .unwrap_err();

        let app_error = AppError::from(err);
        assert_eq!(app_error.message(), "failed to publish");
        let cause = app_error.cause().expect("io cause present");
        assert!(cause.message().contains("disk full"));
    }

    #[test]
    fn anyhow_wrapping_app_error_is_unwrapped() {
        let inner = AppError::unknown_pattern("x");
        let converted = AppError::from(AnyhowError::new(inner.clone()));
        assert_eq!(converted, inner);
    }

    #[test]
    fn sqlx_row_not_found_translates_to_specific_code() {
        let app_error = AppError::from(SqlxError::RowNotFound);
        assert_eq!(app_error.code(), "SQLX/ROW_NOT_FOUND");
    }

    #[test]
    fn timeout_carries_operation_and_budget() {
        let err = AppError::timeout("upsert", Duration::from_millis(1500));
        assert_eq!(err.code(), AppError::STORE_TIMEOUT);
        assert_eq!(err.context().get("operation"), Some(&"upsert".to_string()));
        assert_eq!(err.context().get("timeout_ms"), Some(&"1500".to_string()));
    }
}
