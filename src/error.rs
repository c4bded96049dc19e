//! Error types
//!
//! Schema and configuration failures are typed so callers can tell fatal
//! conditions apart from retryable ones. Everything else in the crate uses
//! `anyhow` for context-rich reporting.

use rusqlite::ErrorCode;
use thiserror::Error;

/// Failures raised while converging or inspecting the schema
#[derive(Debug, Error)]
pub enum SchemaError {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// A table required by later declarations is absent even after drift repair
    #[error("required table '{table}' does not exist and no step creates it")]
    MissingTable { table: String },

    #[error("database schema v{database_version} is newer than supported v{supported_version}")]
    Incompatible {
        database_version: u32,
        supported_version: u32,
    },

    #[error("migration {version} ({migration}) failed at '{step}': {source}")]
    Step {
        version: u32,
        migration: String,
        step: String,
        #[source]
        source: Box<SchemaError>,
    },

    #[error("schema verification failed: {}", .0.join("; "))]
    Verification(Vec<String>),
}

impl SchemaError {
    /// Whether re-running the whole idempotent pass may succeed.
    ///
    /// Busy/locked databases and "already exists" races between two
    /// initializing processes qualify; structural failures never do.
    pub fn is_retryable(&self) -> bool {
        match self {
            SchemaError::Database(e) => {
                matches!(
                    e.sqlite_error_code(),
                    Some(ErrorCode::DatabaseBusy) | Some(ErrorCode::DatabaseLocked)
                ) || e.to_string().contains("already exists")
            }
            SchemaError::Step { source, .. } => source.is_retryable(),
            _ => false,
        }
    }

    /// The missing table name if this error (or the step it wraps) is fatal
    /// because a canonical table is absent.
    pub fn missing_table(&self) -> Option<&str> {
        match self {
            SchemaError::MissingTable { table } => Some(table),
            SchemaError::Step { source, .. } => source.missing_table(),
            _ => None,
        }
    }
}

/// Whether an error only says that the object being removed is already gone.
///
/// SQLite reports these as `no such table/view/trigger/index: <name>`.
pub fn is_missing_object(err: &rusqlite::Error) -> bool {
    match err {
        rusqlite::Error::SqliteFailure(_, Some(msg)) => msg.starts_with("no such "),
        _ => false,
    }
}

/// Configuration problems detected before any schema or server work
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("missing required configuration: {}", .0.join(", "))]
    Missing(Vec<String>),

    #[error("invalid configuration value for {key}: {reason}")]
    Invalid { key: String, reason: String },
}

pub type Result<T> = std::result::Result<T, SchemaError>;
