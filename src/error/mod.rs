use std::collections::HashMap;
use std::error::Error as StdError;
use std::fmt;

use anyhow::Error as AnyhowError;
use serde::{Deserialize, Serialize};
use serde_json::Error as SerdeJsonError;
use sqlx::Error as SqlxError;
use std::io::Error as IoError;

pub const HOUSE_NOT_FOUND: &str = "HOUSE/NOT_FOUND";
pub const GROUP_NOT_FOUND: &str = "GROUP/NOT_FOUND";
pub const PAYMENT_NOT_FOUND: &str = "PAYMENT/NOT_FOUND";
pub const INCOME_NOT_FOUND: &str = "INCOME/NOT_FOUND";
pub const ROW_NOT_FOUND: &str = "SQLX/ROW_NOT_FOUND";
pub const PIVOTAL_INVARIANT: &str = "PIVOTAL/INVARIANT";
pub const PIVOTAL_INVALID_COLUMN: &str = "PIVOTAL/INVALID_COLUMN";
pub const VALIDATION_AMOUNT: &str = "VALIDATION/AMOUNT";
pub const VALIDATION_SCOPE: &str = "VALIDATION/INCOME_SCOPE";
pub const VALIDATION_DATE: &str = "VALIDATION/DATE";
pub const DB_TX_CLOSED: &str = "DB/TX_CLOSED";
pub const STORE_TRANSIENT: &str = "STORE/TRANSIENT";

/// SQLite primary and extended result codes that signal contention rather
/// than a broken database: BUSY, LOCKED, BUSY_RECOVERY, LOCKED_SHAREDCACHE,
/// BUSY_SNAPSHOT, BUSY_TIMEOUT.
const SQLITE_TRANSIENT_CODES: &[&str] = &["5", "6", "261", "262", "517", "773"];

/// Failure taxonomy shared by the pivotal engine and its callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Source house or group does not exist. Recoverable by the caller.
    NotFound,
    /// Contention or serialization failure. Safe to retry.
    TransientStore,
    /// Schema, connection or constraint failure.
    PermanentStore,
    /// Stored state breaks an invariant (duplicate pivotal rows, ...).
    InvariantViolation,
    /// Validation and everything else.
    Other,
}

/// A structured application error that can be serialized and surfaced to callers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppError {
    /// Machine readable error code.
    pub code: String,
    /// Human friendly message.
    pub message: String,
    /// Arbitrary key/value pairs that provide additional context.
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

    /// Construct a new application error with the provided code and message.
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        AppError {
            code: code.into(),
            message: message.into(),
            context: HashMap::new(),
            cause: None,
        }
    }

    pub fn house_not_found(id: &str) -> Self {
        AppError::new(HOUSE_NOT_FOUND, format!("House {id} not found")).with_context("id", id)
    }

    pub fn group_not_found(id: &str) -> Self {
        AppError::new(GROUP_NOT_FOUND, format!("Group {id} not found")).with_context("id", id)
    }

    pub fn invariant(message: impl Into<String>) -> Self {
        AppError::new(PIVOTAL_INVARIANT, message)
    }

    /// Returns the error code.
    pub fn code(&self) -> &str {
        &self.code
    }

    /// Returns the error message.
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Returns the contextual metadata associated with the error.
    pub fn context(&self) -> &HashMap<String, String> {
        &self.context
    }

    /// Returns the nested cause if one is present.
    pub fn cause(&self) -> Option<&AppError> {
        self.cause.as_deref()
    }

    /// Adds a contextual key/value pair to the error.
    pub fn with_context(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }

    /// Sets the nested cause for the error.
    pub fn with_cause(mut self, cause: impl Into<AppError>) -> Self {
        self.cause = Some(Box::new(cause.into()));
        self
    }

    /// Classifies the error. Wrapped errors inherit the kind of their cause
    /// when their own code is not specific.
    pub fn kind(&self) -> ErrorKind {
        let code = self.code.as_str();
        if code == STORE_TRANSIENT || code == "SQLX/POOL_TIMEOUT" {
            return ErrorKind::TransientStore;
        }
        if let Some(sqlite) = code.strip_prefix("Sqlite/") {
            return if SQLITE_TRANSIENT_CODES.contains(&sqlite) {
                ErrorKind::TransientStore
            } else {
                ErrorKind::PermanentStore
            };
        }
        if code.ends_with("/NOT_FOUND") {
            return ErrorKind::NotFound;
        }
        if code == PIVOTAL_INVARIANT {
            return ErrorKind::InvariantViolation;
        }
        if code.starts_with("SQLX/") || code.starts_with("IO/") || code == DB_TX_CLOSED {
            return ErrorKind::PermanentStore;
        }
        match (code, self.cause()) {
            (AppError::UNKNOWN_CODE, Some(cause)) => cause.kind(),
            _ => ErrorKind::Other,
        }
    }

    pub fn is_not_found(&self) -> bool {
        self.kind() == ErrorKind::NotFound
    }

    pub fn is_transient(&self) -> bool {
        self.kind() == ErrorKind::TransientStore
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.context.is_empty() {
            write!(f, "[{}] {}", self.code, self.message)
        } else {
            write!(f, "[{}] {} ({:?})", self.code, self.message, self.context)
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
        AppError::new(code, error.to_string())
    }
}

impl From<SqlxError> for AppError {
    fn from(error: SqlxError) -> Self {
        match error {
            SqlxError::RowNotFound => AppError::new(ROW_NOT_FOUND, "Record not found"),
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
                    .with_context("column_index", index.to_string())
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
    fn builds_error_with_context_and_cause() {
        let error = AppError::new("TEST/CODE", "Something went wrong")
            .with_context("entity", "house")
            .with_context("id", "1234")
            .with_cause(AppError::from("inner failure"));

        assert_eq!(error.code(), "TEST/CODE");
        assert_eq!(error.message(), "Something went wrong");
        assert_eq!(error.context().get("entity"), Some(&"house".to_string()));
        let cause = error.cause().expect("cause present");
        assert_eq!(cause.message(), "inner failure");
        assert_eq!(cause.code(), AppError::GENERIC_CODE);
    }

    #[test]
    fn not_found_carries_offending_id() {
        let err = AppError::house_not_found("h-42");
        assert_eq!(err.kind(), ErrorKind::NotFound);
        assert!(err.message().contains("h-42"));
        assert_eq!(err.context().get("id").map(String::as_str), Some("h-42"));

        let group = AppError::group_not_found("g-1");
        assert!(group.is_not_found());
    }

    #[test]
    fn sqlite_busy_and_locked_are_transient() {
        for code in ["Sqlite/5", "Sqlite/6", "Sqlite/517"] {
            assert_eq!(AppError::new(code, "busy").kind(), ErrorKind::TransientStore);
        }
        assert_eq!(
            AppError::new("Sqlite/2067", "UNIQUE constraint failed").kind(),
            ErrorKind::PermanentStore
        );
        assert!(AppError::from(SqlxError::PoolTimedOut).is_transient());
    }

    #[test]
    fn invariant_and_generic_kinds() {
        assert_eq!(
            AppError::invariant("two rows").kind(),
            ErrorKind::InvariantViolation
        );
        assert_eq!(AppError::from("plain").kind(), ErrorKind::Other);
        assert_eq!(
            AppError::new(DB_TX_CLOSED, "closed").kind(),
            ErrorKind::PermanentStore
        );
    }

    #[test]
    fn unknown_wrapper_inherits_cause_kind() {
        let err = anyhow::Error::from(AppError::house_not_found("h"))
            .context("while calculating");
        let converted = AppError::from(err);
        assert_eq!(converted.code(), AppError::UNKNOWN_CODE);
        assert_eq!(converted.kind(), ErrorKind::NotFound);
    }

    #[test]
    fn converts_anyhow_error_chain_into_nested_causes() {
        let err = (|| -> anyhow::Result<()> {
            Err(std::io::Error::new(std::io::ErrorKind::Other, "disk full"))
                .context("failed to open database")
        })()
        .unwrap_err();

        let app_error = AppError::from(err);
        assert_eq!(app_error.message(), "failed to open database");
        let cause = app_error.cause().expect("io cause present");
        assert!(cause.message().contains("disk full"));
    }

    #[test]
    fn sqlx_row_not_found_translates_to_specific_code() {
        let app_error = AppError::from(SqlxError::RowNotFound);
        assert_eq!(app_error.code(), ROW_NOT_FOUND);
        assert!(app_error.is_not_found());
    }

    #[test]
    fn json_shape_is_flat_struct() {
        let error = AppError::house_not_found("h1");
        let value = serde_json::to_value(&error).expect("serialize app error");
        assert_eq!(value.get("code").and_then(|v| v.as_str()), Some(HOUSE_NOT_FOUND));
        assert_eq!(
            value
                .get("context")
                .and_then(|c| c.get("id"))
                .and_then(|v| v.as_str()),
            Some("h1")
        );
        assert!(value.get("cause").is_none());
    }
}
