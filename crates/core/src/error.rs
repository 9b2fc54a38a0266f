//! Unified error types for the materializer.
//!
//! Error codes:
//! - SCHEMA_001-003: Introspection errors (missing relation, column, bad type)
//! - QUERY_001-004: Statement execution errors
//! - TXN_001-003: Transaction errors

use thiserror::Error;

/// Result type alias using our Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Schema introspection error codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchemaErrorCode {
    /// SCHEMA_001: Relation does not exist
    RelationNotFound,
    /// SCHEMA_002: Required column is missing
    MissingColumn,
    /// SCHEMA_003: Column type or value cannot be used
    InvalidType,
}

impl SchemaErrorCode {
    /// Get the error code string.
    pub fn code(&self) -> &'static str {
        match self {
            Self::RelationNotFound => "SCHEMA_001",
            Self::MissingColumn => "SCHEMA_002",
            Self::InvalidType => "SCHEMA_003",
        }
    }
}

/// Query execution error codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryErrorCode {
    /// QUERY_001: Statement rejected by the warehouse
    Rejected,
    /// QUERY_002: Missing privilege
    PrivilegeDenied,
    /// QUERY_003: Schema is locked by another run
    LockConflict,
    /// QUERY_004: Identifier cannot be safely quoted
    InvalidIdentifier,
}

impl QueryErrorCode {
    /// Get the error code string.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Rejected => "QUERY_001",
            Self::PrivilegeDenied => "QUERY_002",
            Self::LockConflict => "QUERY_003",
            Self::InvalidIdentifier => "QUERY_004",
        }
    }
}

/// Transaction error codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionErrorCode {
    /// TXN_001: Could not open the transaction
    BeginFailed,
    /// TXN_002: Commit failed
    CommitFailed,
    /// TXN_003: Rollback failed
    RollbackFailed,
}

impl TransactionErrorCode {
    /// Get the error code string.
    pub fn code(&self) -> &'static str {
        match self {
            Self::BeginFailed => "TXN_001",
            Self::CommitFailed => "TXN_002",
            Self::RollbackFailed => "TXN_003",
        }
    }
}

/// Unified error type for the materializer.
#[derive(Debug, Error)]
pub enum Error {
    /// Missing relation or column, or an unusable column type.
    #[error("[{code}] {message}")]
    SchemaIntrospection { code: &'static str, message: String },

    /// Statement rejected: privilege, lock conflict, malformed expression.
    #[error("[{code}] {message}")]
    QueryExecution { code: &'static str, message: String },

    /// Begin, commit or rollback failure.
    #[error("[{code}] {message}")]
    Transaction { code: &'static str, message: String },

    #[error("configuration error: {0}")]
    Config(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create a schema introspection error.
    pub fn schema(code: SchemaErrorCode, msg: impl Into<String>) -> Self {
        Self::SchemaIntrospection {
            code: code.code(),
            message: msg.into(),
        }
    }

    /// Create a query execution error.
    pub fn query(code: QueryErrorCode, msg: impl Into<String>) -> Self {
        Self::QueryExecution {
            code: code.code(),
            message: msg.into(),
        }
    }

    /// Create a transaction error.
    pub fn transaction(code: TransactionErrorCode, msg: impl Into<String>) -> Self {
        Self::Transaction {
            code: code.code(),
            message: msg.into(),
        }
    }

    pub fn relation_not_found(relation: impl std::fmt::Display) -> Self {
        Self::schema(
            SchemaErrorCode::RelationNotFound,
            format!("relation {} does not exist", relation),
        )
    }

    pub fn missing_column(relation: impl std::fmt::Display, column: &str) -> Self {
        Self::schema(
            SchemaErrorCode::MissingColumn,
            format!("relation {} has no column {}", relation, column),
        )
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Get the error code if this is a coded error.
    pub fn error_code(&self) -> Option<&'static str> {
        match self {
            Self::SchemaIntrospection { code, .. } => Some(*code),
            Self::QueryExecution { code, .. } => Some(*code),
            Self::Transaction { code, .. } => Some(*code),
            _ => None,
        }
    }

    /// Materialization never retries on its own; every error surfaces to the caller.
    pub fn is_retryable(&self) -> bool {
        false
    }
}
