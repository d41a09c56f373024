//! Error Types
//!
//! A single error enum covers every fallible operation in the crate.
//! Admission denial is deliberately absent: a full semaphore is a normal
//! outcome reported through [`CreateResponse`](crate::execution::CreateResponse),
//! not an error.

use thiserror::Error;

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, OrderflowError>;

#[derive(Error, Debug)]
pub enum OrderflowError {
    /// Malformed workflow or semaphore definition, rejected at put time,
    /// or malformed creation parameters.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Unknown workflow or work order.
    #[error("{kind} not found: {uri}")]
    NotFound { kind: &'static str, uri: String },

    /// A work order status change that would move backwards or leave a
    /// terminal state.
    #[error("Work order {uri} cannot move from {from} to {to}")]
    InvalidTransition {
        uri: String,
        from: String,
        to: String,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

impl OrderflowError {
    /// Shorthand for an unknown workflow definition.
    pub fn workflow_not_found(uri: impl Into<String>) -> Self {
        Self::NotFound {
            kind: "Workflow",
            uri: uri.into(),
        }
    }

    /// Shorthand for an unknown work order.
    pub fn work_order_not_found(uri: impl Into<String>) -> Self {
        Self::NotFound {
            kind: "Work order",
            uri: uri.into(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}
