// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Error types for the replication engine.
//!
//! Errors are categorized by where they happen (mapping, source, target,
//! feed) and carry enough context (namespace, document id, statement) to
//! find the offending row without re-running the import.
//!
//! # Error Categories
//!
//! | Error Type | Retryable | Description |
//! |------------|-----------|-------------|
//! | `Config` | No | Mapping or configuration invalid |
//! | `Connection` | Yes | Source or target unreachable |
//! | `Source` | Yes | MongoDB command or cursor failure |
//! | `Target` | Depends | PostgreSQL statement failure (see [`TargetError`]) |
//! | `BulkLoad` | No | COPY rejected; callers fall back to row-level writes |
//! | `Row` | No | Single document insert/upsert/delete failed |
//! | `TableInit` | No | A post-import statement failed |
//! | `Import` | No | Namespace import failed (wraps the cause) |
//! | `Reconcile` | No | Deletion reconciliation failed (wraps the cause) |
//! | `Stream` | No | Change feed errored or closed unexpectedly |
//! | `CursorStore` | No | Local SQLite errors (needs operator attention) |
//! | `InvalidState` | No | Engine state machine violation |
//! | `Shutdown` | No | Engine is shutting down |
//! | `Internal` | No | Unexpected internal error |
//!
//! # Cause Chains
//!
//! `Import`, `Reconcile` and `Row` wrap their cause through `#[source]`, so
//! walking [`std::error::Error::source`] from the top-level error reaches the
//! original database error.

use thiserror::Error;

/// Result type alias for replication operations.
pub type Result<T> = std::result::Result<T, ReplicationError>;

/// PostgreSQL `unique_violation`.
pub const UNIQUE_VIOLATION: &str = "23505";

/// Failure reported by the relational target.
///
/// Keeps the SQLSTATE code (when the server supplied one) so callers can
/// tell a benign duplicate key apart from a real failure.
#[derive(Error, Debug)]
#[error("{message}")]
pub struct TargetError {
    /// SQLSTATE code, e.g. `23505`.
    pub code: Option<String>,
    /// Human readable message (server message or driver error).
    pub message: String,
    #[source]
    pub source: Option<sqlx::Error>,
}

impl TargetError {
    /// Create a target error without an underlying driver error.
    pub fn new(code: Option<&str>, message: impl Into<String>) -> Self {
        Self {
            code: code.map(str::to_string),
            message: message.into(),
            source: None,
        }
    }

    /// Whether the server rejected the statement with a uniqueness violation.
    pub fn is_unique_violation(&self) -> bool {
        self.code.as_deref() == Some(UNIQUE_VIOLATION)
    }

    /// Whether the failure looks like a lost connection rather than bad data.
    pub fn is_connection_failure(&self) -> bool {
        matches!(
            self.source,
            Some(sqlx::Error::Io(_))
                | Some(sqlx::Error::PoolTimedOut)
                | Some(sqlx::Error::PoolClosed)
                | Some(sqlx::Error::WorkerCrashed)
        ) || self.code.as_deref().is_some_and(|c| c.starts_with("08"))
    }
}

impl From<sqlx::Error> for TargetError {
    fn from(e: sqlx::Error) -> Self {
        let code = match &e {
            sqlx::Error::Database(db_err) => db_err.code().map(|c| c.into_owned()),
            _ => None,
        };
        Self {
            code,
            message: e.to_string(),
            source: Some(e),
        }
    }
}

/// Errors that can occur during replication.
///
/// Use [`is_retryable()`](Self::is_retryable) to check if the operation
/// should be retried with backoff.
#[derive(Error, Debug)]
pub enum ReplicationError {
    /// Invalid or incomplete mapping/configuration.
    ///
    /// Not retryable - fix the mapping and restart.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Source or target store could not be reached.
    #[error("Connection error ({endpoint}): {message}")]
    Connection { endpoint: String, message: String },

    /// MongoDB command or cursor error.
    #[error("Source error ({operation}): {message}")]
    Source {
        operation: String,
        message: String,
        #[source]
        source: Option<mongodb::error::Error>,
    },

    /// PostgreSQL statement error outside of a per-row context.
    #[error("Target error: {0}")]
    Target(#[from] TargetError),

    /// The target rejected a COPY transfer.
    ///
    /// Importers catch this and retry the batch one document at a time.
    #[error("Bulk load into \"{table}\" failed: {source}")]
    BulkLoad {
        table: String,
        #[source]
        source: TargetError,
    },

    /// A single document could not be written.
    #[error("Row error on {namespace} (document {document_id}): {source}")]
    Row {
        namespace: String,
        document_id: String,
        #[source]
        source: TargetError,
    },

    /// A table initialization statement failed after a full import.
    #[error("Table init statement failed on {namespace} ({statement}): {source}")]
    TableInit {
        namespace: String,
        statement: String,
        #[source]
        source: TargetError,
    },

    /// Import of one namespace failed.
    #[error("Import of {namespace} failed: {source}")]
    Import {
        namespace: String,
        #[source]
        source: Box<ReplicationError>,
    },

    /// Deletion reconciliation of one namespace failed.
    #[error("Reconciliation of {namespace} failed: {source}")]
    Reconcile {
        namespace: String,
        #[source]
        source: Box<ReplicationError>,
    },

    /// Change feed emitted an error or ended.
    #[error("Stream error: {0}")]
    Stream(String),

    /// SQLite error during feed cursor persistence.
    #[error("Cursor store error: {0}")]
    CursorStore(#[from] sqlx::Error),

    /// Engine state machine violation.
    #[error("Invalid state: expected {expected}, got {actual}")]
    InvalidState { expected: String, actual: String },

    /// Shutdown in progress.
    #[error("Shutdown in progress")]
    Shutdown,

    /// Unexpected internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl ReplicationError {
    /// Create a source error from a driver error.
    pub fn mongo(operation: impl Into<String>, source: mongodb::error::Error) -> Self {
        Self::Source {
            operation: operation.into(),
            message: source.to_string(),
            source: Some(source),
        }
    }

    /// Create a source error without a driver error.
    pub fn mongo_msg(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Source {
            operation: operation.into(),
            message: message.into(),
            source: None,
        }
    }

    pub fn connection(endpoint: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Connection {
            endpoint: endpoint.into(),
            message: message.into(),
        }
    }

    /// Attach a namespace and document id to a failed row write.
    pub fn row(
        namespace: impl Into<String>,
        document_id: impl Into<String>,
        source: TargetError,
    ) -> Self {
        Self::Row {
            namespace: namespace.into(),
            document_id: document_id.into(),
            source,
        }
    }

    pub fn import(namespace: impl Into<String>, source: ReplicationError) -> Self {
        Self::Import {
            namespace: namespace.into(),
            source: Box::new(source),
        }
    }

    pub fn reconcile(namespace: impl Into<String>, source: ReplicationError) -> Self {
        Self::Reconcile {
            namespace: namespace.into(),
            source: Box::new(source),
        }
    }

    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Connection { .. } => true,
            Self::Source { .. } => true, // Cursor/network errors
            Self::Target(e) => e.is_connection_failure(),
            Self::BulkLoad { .. } => false, // Handled by row fallback
            Self::Row { .. } => false,
            Self::TableInit { .. } => false,
            Self::Import { source, .. } | Self::Reconcile { source, .. } => source.is_retryable(),
            Self::Stream(_) => false,
            Self::CursorStore(_) => false, // Local DB issues need attention
            Self::Config(_) => false,
            Self::InvalidState { .. } => false,
            Self::Shutdown => false,
            Self::Internal(_) => false,
        }
    }

    /// Whether the innermost target failure is a uniqueness violation.
    pub fn is_unique_violation(&self) -> bool {
        match self {
            Self::Target(e) => e.is_unique_violation(),
            Self::Row { source, .. }
            | Self::BulkLoad { source, .. }
            | Self::TableInit { source, .. } => source.is_unique_violation(),
            Self::Import { source, .. } | Self::Reconcile { source, .. } => {
                source.is_unique_violation()
            }
            _ => false,
        }
    }

    /// Short label for metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Config(_) => "config",
            Self::Connection { .. } => "connection",
            Self::Source { .. } => "source",
            Self::Target(_) => "target",
            Self::BulkLoad { .. } => "bulk_load",
            Self::Row { .. } => "row",
            Self::TableInit { .. } => "table_init",
            Self::Import { .. } => "import",
            Self::Reconcile { .. } => "reconcile",
            Self::Stream(_) => "stream",
            Self::CursorStore(_) => "cursor_store",
            Self::InvalidState { .. } => "invalid_state",
            Self::Shutdown => "shutdown",
            Self::Internal(_) => "internal",
        }
    }
}

impl From<mongodb::error::Error> for ReplicationError {
    fn from(e: mongodb::error::Error) -> Self {
        Self::mongo("unknown", e)
    }
}
