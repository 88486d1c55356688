//! Error types for the site kernel.
//!
//! This module defines all error types using `thiserror` for ergonomic error handling.
//! Configuration errors (unknown connection key, missing driver) are always fatal;
//! driver errors carry a suggestion that helps the operator fix the setup.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum KernelError {
    #[error("The specified database connection is not defined: {key}")]
    ConnectionNotDefined { key: String },

    #[error("Driver not specified for this database connection: {key} (target: {target})")]
    DriverNotSpecified { key: String, target: String },

    #[error("Unknown database driver '{driver}' for connection {key}")]
    UnknownDriver { driver: String, key: String },

    #[error("Connection failed: {message}")]
    Connection { message: String, suggestion: String },

    #[error("Database error: {message}")]
    Database {
        message: String,
        /// e.g., "23505" for unique violation
        sql_state: Option<String>,
        suggestion: String,
    },

    #[error("Transaction error: {message} (connection: {key}.{target})")]
    Transaction {
        message: String,
        key: String,
        target: String,
    },

    #[error("Settings error: {message}")]
    Settings { message: String },

    #[error("Site is not installed: no database configuration found in {path}")]
    NotInstalled { path: String },

    #[error("Invalid input: {message}")]
    InvalidInput { message: String },

    #[error("Internal error: {message}")]
    Internal { message: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl KernelError {
    /// Create a connection-not-defined error.
    pub fn connection_not_defined(key: impl Into<String>) -> Self {
        Self::ConnectionNotDefined { key: key.into() }
    }

    /// Create a driver-not-specified error.
    pub fn driver_not_specified(key: impl Into<String>, target: impl Into<String>) -> Self {
        Self::DriverNotSpecified {
            key: key.into(),
            target: target.into(),
        }
    }

    /// Create an unknown driver error.
    pub fn unknown_driver(driver: impl Into<String>, key: impl Into<String>) -> Self {
        Self::UnknownDriver {
            driver: driver.into(),
            key: key.into(),
        }
    }

    /// Create a connection error with a helpful suggestion.
    pub fn connection(message: impl Into<String>, suggestion: impl Into<String>) -> Self {
        Self::Connection {
            message: message.into(),
            suggestion: suggestion.into(),
        }
    }

    /// Create a database error with optional SQL state.
    pub fn database(
        message: impl Into<String>,
        sql_state: Option<String>,
        suggestion: impl Into<String>,
    ) -> Self {
        Self::Database {
            message: message.into(),
            sql_state,
            suggestion: suggestion.into(),
        }
    }

    /// Create a transaction error.
    pub fn transaction(
        message: impl Into<String>,
        key: impl Into<String>,
        target: impl Into<String>,
    ) -> Self {
        Self::Transaction {
            message: message.into(),
            key: key.into(),
            target: target.into(),
        }
    }

    /// Create a settings error.
    pub fn settings(message: impl Into<String>) -> Self {
        Self::Settings {
            message: message.into(),
        }
    }

    /// Create a not-installed error.
    pub fn not_installed(path: impl Into<String>) -> Self {
        Self::NotInstalled { path: path.into() }
    }

    /// Create an invalid input error.
    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::InvalidInput {
            message: message.into(),
        }
    }

    /// Create an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Get the suggestion for this error, if available.
    pub fn suggestion(&self) -> Option<&str> {
        match self {
            Self::Connection { suggestion, .. } => Some(suggestion),
            Self::Database { suggestion, .. } => Some(suggestion),
            Self::ConnectionNotDefined { .. } => {
                Some("Add the connection to the 'databases' table in settings.json")
            }
            Self::DriverNotSpecified { .. } => {
                Some("Set 'driver' to one of: mysql, pgsql, sqlite")
            }
            _ => None,
        }
    }

    /// Variant name, used as the error type in logs and error pages.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::ConnectionNotDefined { .. } => "ConnectionNotDefined",
            Self::DriverNotSpecified { .. } => "DriverNotSpecified",
            Self::UnknownDriver { .. } => "UnknownDriver",
            Self::Connection { .. } => "ConnectionError",
            Self::Database { .. } => "DatabaseError",
            Self::Transaction { .. } => "TransactionError",
            Self::Settings { .. } => "SettingsError",
            Self::NotInstalled { .. } => "NotInstalled",
            Self::InvalidInput { .. } => "InvalidInput",
            Self::Internal { .. } => "InternalError",
            Self::Io(_) => "IoError",
            Self::Serialization(_) => "SerializationError",
        }
    }

    /// Configuration errors are fatal and never worth retrying.
    pub fn is_configuration_error(&self) -> bool {
        matches!(
            self,
            Self::ConnectionNotDefined { .. }
                | Self::DriverNotSpecified { .. }
                | Self::UnknownDriver { .. }
                | Self::Settings { .. }
                | Self::NotInstalled { .. }
        )
    }

    /// Check whether this is a unique/primary key violation reported by the driver.
    pub fn is_integrity_violation(&self) -> bool {
        match self {
            Self::Database {
                sql_state, message, ..
            } => {
                let state_matches = sql_state
                    .as_deref()
                    .is_some_and(|s| s == "23000" || s == "23505" || s == "1555" || s == "2067");
                let lower = message.to_lowercase();
                state_matches
                    || lower.contains("unique constraint")
                    || lower.contains("duplicate entry")
                    || lower.contains("duplicate key")
            }
            _ => false,
        }
    }
}

/// Convert sqlx errors to KernelError.
impl From<sqlx::Error> for KernelError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::Configuration(msg) => KernelError::connection(
                msg.to_string(),
                "Check the connection options and credentials",
            ),
            sqlx::Error::Database(db_err) => {
                let code = db_err.code().map(|c| c.to_string());
                KernelError::database(
                    db_err.message(),
                    code,
                    "Check the SQL syntax and referenced tables",
                )
            }
            sqlx::Error::RowNotFound => KernelError::database(
                "No rows returned",
                None,
                "Verify the query conditions match existing data",
            ),
            sqlx::Error::PoolTimedOut => KernelError::connection(
                "Timed out acquiring a connection from the pool",
                "Increase acquire_timeout or max_connections",
            ),
            sqlx::Error::PoolClosed => KernelError::connection(
                "Connection pool is closed",
                "The connection was closed; request it again from the registry",
            ),
            sqlx::Error::Io(io_err) => KernelError::connection(
                format!("I/O error: {}", io_err),
                "Check network connectivity and database server status",
            ),
            sqlx::Error::Tls(tls_err) => KernelError::connection(
                format!("TLS error: {}", tls_err),
                "Verify TLS configuration and certificates",
            ),
            sqlx::Error::Protocol(msg) => KernelError::connection(
                format!("Protocol error: {}", msg),
                "Check database server compatibility",
            ),
            sqlx::Error::ColumnNotFound(col) => {
                KernelError::internal(format!("Column not found: {}", col))
            }
            sqlx::Error::ColumnDecode { index, source } => {
                KernelError::internal(format!("Failed to decode column {}: {}", index, source))
            }
            sqlx::Error::Decode(source) => {
                KernelError::internal(format!("Decode error: {}", source))
            }
            sqlx::Error::WorkerCrashed => KernelError::internal("Database worker crashed"),
            _ => KernelError::internal(format!("Unknown database error: {}", err)),
        }
    }
}

/// Result type alias for kernel operations.
pub type KernelResult<T> = Result<T, KernelError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = KernelError::connection("Failed to connect", "Check credentials");
        assert!(err.to_string().contains("Connection failed"));
    }

    #[test]
    fn test_connection_not_defined_message() {
        let err = KernelError::connection_not_defined("missing_key");
        assert_eq!(
            err.to_string(),
            "The specified database connection is not defined: missing_key"
        );
        assert!(err.is_configuration_error());
    }

    #[test]
    fn test_error_suggestion() {
        let err = KernelError::database(
            "Syntax error",
            Some("42601".to_string()),
            "Check SQL syntax",
        );
        assert_eq!(err.suggestion(), Some("Check SQL syntax"));
        assert!(KernelError::internal("x").suggestion().is_none());
    }

    #[test]
    fn test_integrity_violation_detection() {
        let pg = KernelError::database("duplicate key value", Some("23505".to_string()), "");
        let sqlite = KernelError::database(
            "UNIQUE constraint failed: semaphore.name",
            Some("1555".to_string()),
            "",
        );
        let other = KernelError::database("no such table: x", Some("1".to_string()), "");
        assert!(pg.is_integrity_violation());
        assert!(sqlite.is_integrity_violation());
        assert!(!other.is_integrity_violation());
        assert!(!KernelError::internal("x").is_integrity_violation());
    }

    #[test]
    fn test_driver_errors_are_configuration_errors() {
        assert!(KernelError::driver_not_specified("default", "slave").is_configuration_error());
        assert!(KernelError::unknown_driver("oracle", "default").is_configuration_error());
        assert!(!KernelError::connection("a", "b").is_configuration_error());
    }
}
