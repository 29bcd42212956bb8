//! Error types and HTTP response conversion

use std::any::TypeId;
use std::fmt;
use std::sync::Arc;

use axum::extract::rejection::JsonRejection;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

use crate::middleware::{render_error, EscapedError};

// ============================================================================
// Store Errors
// ============================================================================

/// An entity entry involved in an optimistic concurrency conflict
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConflictEntry {
    /// Rust type of the conflicting entity
    pub type_id: TypeId,
    /// Entity type name (e.g. "Project")
    pub entity: &'static str,
    /// Stringified key of the conflicting row
    pub key: String,
}

impl ConflictEntry {
    /// Create a conflict entry for entity type `E`
    pub fn of<E: crate::entity::Entity>(key: impl Into<String>) -> Self {
        Self {
            type_id: TypeId::of::<E>(),
            entity: E::entity_name(),
            key: key.into(),
        }
    }
}

impl fmt::Display for ConflictEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.entity, self.key)
    }
}

/// Failure raised by a persistence context
#[derive(Debug, Error)]
pub enum StoreError {
    /// A write was rejected because the row changed since it was read
    #[error("optimistic concurrency conflict on {}", format_entries(.entries))]
    Concurrency {
        /// Entries whose stored state no longer matches the tracked state
        entries: Vec<ConflictEntry>,
    },

    /// An insert collided with an existing row
    #[error("{entity} with key {key} already exists")]
    DuplicateKey {
        /// Entity type name
        entity: &'static str,
        /// Stringified key
        key: String,
    },

    /// An insert carried an unset key that the store cannot generate
    #[error("{entity} requires a key and none could be generated")]
    MissingKey {
        /// Entity type name
        entity: &'static str,
    },

    /// A transaction is already open on this context
    #[error("a transaction is already in progress on this context")]
    TransactionInProgress,

    /// A cooperative cancellation was observed before the flush
    #[error("operation was cancelled")]
    Cancelled,

    /// An entity could not be encoded or decoded
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Backend-specific failure (connection, query, driver)
    #[error("store backend error: {0}")]
    Backend(String),
}

impl StoreError {
    /// Whether this is an optimistic concurrency conflict
    pub fn is_concurrency_conflict(&self) -> bool {
        matches!(self, Self::Concurrency { .. })
    }
}

fn format_entries(entries: &[ConflictEntry]) -> String {
    entries
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::Serialization(err.to_string())
    }
}

#[cfg(feature = "database")]
impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        use sqlx::Error as E;
        match err {
            E::Decode(e) => StoreError::Serialization(e.to_string()),
            E::ColumnDecode { index, source } => {
                StoreError::Serialization(format!("failed to decode column {}: {}", index, source))
            }
            other => StoreError::Backend(other.to_string()),
        }
    }
}

// ============================================================================
// Framework Error
// ============================================================================

/// Result type alias using the framework error
pub type Result<T> = std::result::Result<T, Error>;

/// Category of a framework error, used for dispatch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Entity or key absent
    NotFound,
    /// Malformed caller input
    BadRequest,
    /// Missing or empty required argument
    InvalidArgument,
    /// Operation not valid for the current object state
    InvalidOperation,
    /// Resource state conflict
    Conflict,
    /// Access denied
    Unauthorized,
    /// Business-rule violation
    Domain,
    /// One or more validation messages
    Validation,
    /// Persistence context failure
    Store,
    /// Configuration failure
    Config,
    /// Anything else
    Internal,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotFound => write!(f, "not_found"),
            Self::BadRequest => write!(f, "bad_request"),
            Self::InvalidArgument => write!(f, "invalid_argument"),
            Self::InvalidOperation => write!(f, "invalid_operation"),
            Self::Conflict => write!(f, "conflict"),
            Self::Unauthorized => write!(f, "unauthorized"),
            Self::Domain => write!(f, "domain"),
            Self::Validation => write!(f, "validation"),
            Self::Store => write!(f, "store"),
            Self::Config => write!(f, "config"),
            Self::Internal => write!(f, "internal"),
        }
    }
}

/// Main error type for the toolkit
///
/// The `Display` output of each variant is the user-facing message; the
/// request-handling middleware writes it verbatim for classified kinds.
#[derive(Debug, Error)]
pub enum Error {
    /// Entity or key absent
    #[error("{0}")]
    NotFound(String),

    /// Malformed caller input
    #[error("{0}")]
    BadRequest(String),

    /// A required argument was absent or empty
    #[error("{message}")]
    InvalidArgument {
        /// Name of the offending argument
        argument: &'static str,
        /// Human-readable message
        message: String,
    },

    /// The operation is not valid for the object's current state
    #[error("{0}")]
    InvalidOperation(String),

    /// Resource state conflict
    #[error("{0}")]
    Conflict(String),

    /// Access denied
    #[error("{0}")]
    Unauthorized(String),

    /// Business-rule violation with an optional inner cause
    #[error("{message}")]
    Domain {
        /// Human-readable message
        message: String,
        /// Inner cause
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Validation failure carrying individual messages
    #[error("One or more validation errors occurred.")]
    Validation {
        /// Human-readable validation messages
        errors: Vec<String>,
    },

    /// Persistence context failure
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(Box<figment::Error>),

    /// Internal error
    #[error("{0}")]
    Internal(String),
}

impl Error {
    /// Create an invalid-argument error
    pub fn invalid_argument(argument: &'static str, message: impl Into<String>) -> Self {
        Error::InvalidArgument {
            argument,
            message: message.into(),
        }
    }

    /// Create a domain error without an inner cause
    pub fn domain(message: impl Into<String>) -> Self {
        Error::Domain {
            message: message.into(),
            source: None,
        }
    }

    /// Create a domain error wrapping an inner cause
    pub fn domain_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Error::Domain {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Create a validation error from a list of messages
    pub fn validation<I, S>(errors: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Error::Validation {
            errors: errors.into_iter().map(Into::into).collect(),
        }
    }

    /// The dispatch tag of this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::NotFound(_) => ErrorKind::NotFound,
            Error::BadRequest(_) => ErrorKind::BadRequest,
            Error::InvalidArgument { .. } => ErrorKind::InvalidArgument,
            Error::InvalidOperation(_) => ErrorKind::InvalidOperation,
            Error::Conflict(_) => ErrorKind::Conflict,
            Error::Unauthorized(_) => ErrorKind::Unauthorized,
            Error::Domain { .. } => ErrorKind::Domain,
            Error::Validation { .. } => ErrorKind::Validation,
            Error::Store(_) => ErrorKind::Store,
            Error::Config(_) => ErrorKind::Config,
            Error::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Whether this error wraps an optimistic concurrency conflict
    pub fn is_concurrency_conflict(&self) -> bool {
        matches!(self, Error::Store(e) if e.is_concurrency_conflict())
    }
}

/// A body the JSON extractor refused is the client's fault
impl From<JsonRejection> for Error {
    fn from(rejection: JsonRejection) -> Self {
        Error::BadRequest(rejection.body_text())
    }
}

impl From<figment::Error> for Error {
    fn from(err: figment::Error) -> Self {
        Error::Config(Box::new(err))
    }
}

#[cfg(feature = "database")]
impl From<sqlx::Error> for Error {
    fn from(err: sqlx::Error) -> Self {
        Error::Store(StoreError::from(err))
    }
}

/// Handlers return `Err(Error)`; the response carries the error so the
/// request-handling middleware can log it as the escaped failure.
impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let mut response = render_error(&self);
        response
            .extensions_mut()
            .insert(EscapedError(Arc::new(self)));
        response
    }
}
