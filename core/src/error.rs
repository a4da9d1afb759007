//! Error definitions for keyseek
//!
//! Ineligibility of a pipeline for DISTINCT_SCAN is not an error; see
//! [`Eligibility`](crate::query::Eligibility). Only conditions the caller cannot
//! recover from by falling back are represented here.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, KeyseekError>;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum KeyseekError {
    /// The group specification violates a structural invariant. This is a caller bug.
    #[error("Malformed group spec: {0}")]
    MalformedGroupSpec(String),

    /// The collection or its catalog changed under a running scan. Re-plan, do not resume.
    #[error(
        "Scan invalidated on index '{index}': catalog epoch moved from {expected_epoch} to {observed_epoch}"
    )]
    ScanInvalidated {
        index: String,
        expected_epoch: u64,
        observed_epoch: u64,
    },

    #[error("Invalid pipeline: {0}")]
    InvalidPipeline(String),

    #[error("Invalid expression: {0}")]
    InvalidExpression(String),

    #[error("Invalid document: {0}")]
    InvalidDocument(String),

    #[error("Index not found: {0}")]
    IndexNotFound(String),

    #[error("Already exists: {0}")]
    AlreadyExists(String),

    #[error("Resource exhausted: {0}")]
    ResourceExhausted(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(String),
}

impl KeyseekError {
    /// Get a short error kind name
    pub fn kind(&self) -> &'static str {
        match self {
            KeyseekError::MalformedGroupSpec(_) => "malformed_group_spec",
            KeyseekError::ScanInvalidated { .. } => "scan_invalidated",
            KeyseekError::InvalidPipeline(_) => "invalid_pipeline",
            KeyseekError::InvalidExpression(_) => "invalid_expression",
            KeyseekError::InvalidDocument(_) => "invalid_document",
            KeyseekError::IndexNotFound(_) => "index_not_found",
            KeyseekError::AlreadyExists(_) => "already_exists",
            KeyseekError::ResourceExhausted(_) => "resource_exhausted",
            KeyseekError::Config(_) => "config_error",
            KeyseekError::Io(_) => "io_error",
        }
    }

    /// Whether the caller should re-run planning and try again.
    pub fn is_replannable(&self) -> bool {
        matches!(self, KeyseekError::ScanInvalidated { .. })
    }
}

impl From<std::io::Error> for KeyseekError {
    fn from(err: std::io::Error) -> Self {
        KeyseekError::Io(err.to_string())
    }
}
