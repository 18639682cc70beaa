//! Centralized error types for graph operations.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Main error type for graph store, upsert and batch operations.
#[derive(Error, Debug)]
pub enum GraphError {
    #[error("{entity} not found: {id}")]
    EntityNotFound { entity: &'static str, id: String },

    #[error("Invalid conflict resolution strategy: '{0}'")]
    InvalidStrategy(String),

    #[error("Invalid input for '{field}': {message}")]
    InvalidInput { field: String, message: String },

    #[error("Graph store connection error: {0}")]
    StoreConnection(String),

    #[error("Graph store call '{operation}' timed out after {timeout:?}")]
    StoreTimeout {
        operation: &'static str,
        timeout: Duration,
    },

    #[error("Constraint violation: {0}")]
    ConstraintViolation(String),

    #[error("Graph store query failed: {0}")]
    Query(String),

    #[error("Transaction is no longer active")]
    TransactionClosed,

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("{context}: {source}")]
    Context {
        context: String,
        #[source]
        source: Box<GraphError>,
    },
}

/// Result type for graph operations.
pub type GraphResult<T> = Result<T, GraphError>;

impl GraphError {
    /// Create a node-not-found error.
    pub fn node_not_found(id: impl Into<String>) -> Self {
        Self::EntityNotFound {
            entity: "Node",
            id: id.into(),
        }
    }

    /// Create a relationship-not-found error.
    pub fn relationship_not_found(id: impl Into<String>) -> Self {
        Self::EntityNotFound {
            entity: "Relationship",
            id: id.into(),
        }
    }

    /// Create an invalid input error for a named field.
    pub fn invalid_input(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidInput {
            field: field.into(),
            message: message.into(),
        }
    }

    /// Create a configuration error.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Wrap this error with the name of the operation that produced it.
    ///
    /// The wrapped error keeps its kind: `root()`, `code()` and the
    /// classification helpers look through any number of context layers.
    pub fn context(self, context: impl Into<String>) -> Self {
        Self::Context {
            context: context.into(),
            source: Box::new(self),
        }
    }

    /// The innermost error, skipping context wrappers.
    pub fn root(&self) -> &GraphError {
        match self {
            Self::Context { source, .. } => source.root(),
            other => other,
        }
    }

    /// Stable machine-readable code for this error kind.
    pub fn code(&self) -> &'static str {
        match self.root() {
            Self::EntityNotFound { .. } => "ENTITY_NOT_FOUND",
            Self::InvalidStrategy(_) => "INVALID_STRATEGY",
            Self::InvalidInput { .. } => "INVALID_INPUT",
            Self::StoreConnection(_) => "STORE_CONNECTION",
            Self::StoreTimeout { .. } => "STORE_TIMEOUT",
            Self::ConstraintViolation(_) => "CONSTRAINT_VIOLATION",
            Self::Query(_) => "STORE_QUERY",
            Self::TransactionClosed => "TRANSACTION_CLOSED",
            Self::Serialization(_) => "SERIALIZATION",
            Self::Config(_) => "CONFIG",
            Self::Context { .. } => unreachable!("root() never returns a context wrapper"),
        }
    }

    /// The input field this error refers to, when known.
    pub fn field(&self) -> Option<&str> {
        match self.root() {
            Self::InvalidInput { field, .. } => Some(field.as_str()),
            _ => None,
        }
    }

    /// Transient infrastructure failures. Retrying them is the caller's decision.
    pub fn is_transient(&self) -> bool {
        matches!(
            self.root(),
            Self::StoreConnection(_) | Self::StoreTimeout { .. }
        )
    }

    /// A unique-constraint race or write conflict reported by the store.
    pub fn is_constraint_violation(&self) -> bool {
        matches!(self.root(), Self::ConstraintViolation(_))
    }

    /// Errors raised by local validation before any write happens.
    pub fn is_validation(&self) -> bool {
        matches!(
            self.root(),
            Self::InvalidStrategy(_) | Self::InvalidInput { .. }
        )
    }

    /// Build the serializable descriptor for this error.
    pub fn describe(&self, index: Option<usize>, operation: impl Into<String>) -> ErrorDescriptor {
        ErrorDescriptor {
            index,
            operation: operation.into(),
            code: self.code().to_string(),
            field: self.field().map(str::to_string),
            message: self.to_string(),
        }
    }
}

/// Machine-parsable description of a failed operation.
///
/// Placed in batch and import results so that task runners can do their own
/// partial-failure bookkeeping without string matching.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorDescriptor {
    /// Position of the failed operation or record, if the failure belongs to one.
    pub index: Option<usize>,
    pub operation: String,
    pub code: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub field: Option<String>,
    pub message: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_context_keeps_kind() {
        let err = GraphError::ConstraintViolation("studentId S001".into())
            .context("create node")
            .context("upsert node");

        assert!(err.is_constraint_violation());
        assert_eq!(err.code(), "CONSTRAINT_VIOLATION");
        assert_eq!(
            err.to_string(),
            "upsert node: create node: Constraint violation: studentId S001"
        );
    }

    #[test]
    fn test_classification() {
        let timeout = GraphError::StoreTimeout {
            operation: "find_by_key",
            timeout: Duration::from_millis(10),
        };
        assert!(timeout.is_transient());
        assert!(!timeout.is_validation());

        assert!(GraphError::InvalidStrategy("LATEST".into()).is_validation());
        assert!(!GraphError::node_not_found("n1").is_transient());
    }

    #[test]
    fn test_descriptor_carries_field() {
        let err = GraphError::invalid_input("studentId", "missing business key").context("op");
        let desc = err.describe(Some(2), "create_node");

        assert_eq!(desc.index, Some(2));
        assert_eq!(desc.code, "INVALID_INPUT");
        assert_eq!(desc.field.as_deref(), Some("studentId"));

        let json = serde_json::to_value(&desc).unwrap();
        assert_eq!(json["operation"], "create_node");
        assert_eq!(json["field"], "studentId");
    }
}
