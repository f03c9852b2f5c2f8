//! # Security Error Handling
//!
//! Unified error type for the entity tree, the ACL evaluator and the activity
//! queue. Only `InvalidArgument` and `EntityNotFound` are caller mistakes; the
//! remaining variants wrap failures of the data and messaging collaborators or
//! internal invariant violations.

use crate::model::{ActivityId, EntityId};
use std::io;
use thiserror::Error;

/// Unified error type for the security engine.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SecurityError {
    /// A zero/default id was passed where a real id is required
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// A structural operation named an entity that does not exist
    #[error("Entity not found: {0}")]
    EntityNotFound(EntityId),

    /// The system was shut down; further calls fail fast
    #[error("Security system is not operational")]
    NotOperational,

    /// Errors raised by the data collaborator
    #[error("Database error: {0}")]
    Database(String),

    /// Errors related to serialization/deserialization
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Errors raised by the messaging collaborator
    #[error("Messaging error: {0}")]
    Messaging(String),

    /// Errors related to configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// A std lock was poisoned by a panicking holder
    #[error("Failed to acquire {0} lock")]
    LockPoisoned(String),

    /// The activity was dropped before it was dispatched
    #[error("Activity {0} was cancelled before execution")]
    Cancelled(ActivityId),

    /// Internal invariant violation (for example a self-wait edge)
    #[error("Internal error: {0}")]
    Internal(String),
}

impl SecurityError {
    /// Shorthand for the `InvalidArgument` variant
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        SecurityError::InvalidArgument(msg.into())
    }

    /// Whether the error is a caller mistake that must not be retried.
    pub fn is_caller_error(&self) -> bool {
        matches!(
            self,
            SecurityError::InvalidArgument(_) | SecurityError::EntityNotFound(_)
        )
    }
}

impl From<sled::Error> for SecurityError {
    fn from(error: sled::Error) -> Self {
        SecurityError::Database(error.to_string())
    }
}

impl From<serde_json::Error> for SecurityError {
    fn from(error: serde_json::Error) -> Self {
        SecurityError::Serialization(error.to_string())
    }
}

impl From<toml::de::Error> for SecurityError {
    fn from(error: toml::de::Error) -> Self {
        SecurityError::Config(error.to_string())
    }
}

impl From<io::Error> for SecurityError {
    fn from(error: io::Error) -> Self {
        SecurityError::Database(error.to_string())
    }
}

/// Result type alias for operations that can result in a SecurityError
pub type SecurityResult<T> = Result<T, SecurityError>;
