//! Error handling for recon-rs
//!
//! This module defines the crate-wide error type and a Result alias. The
//! variants follow the reconstruction error taxonomy:
//!
//! - **Configuration**: missing or inconsistent options, dimension mismatches.
//!   Fatal, surfaced immediately, never retried.
//! - **Resource**: a compute device or buffer is unavailable. Fatal for the
//!   pipeline instance.
//! - **Data**: a malformed or incomplete message/job. The owning stage drops
//!   the message and keeps running.
//!
//! Solver non-convergence is *not* an error; see
//! [`ConvergenceWarning`](crate::solvers::ConvergenceWarning).

use crate::pipeline::PipelineError;
use thiserror::Error;

/// Main error type for recon-rs operations
#[derive(Error, Debug)]
pub enum ReconError {
    /// Missing/inconsistent options or dimension mismatch
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Device or memory unavailable
    #[error("Resource error: {0}")]
    Resource(String),

    /// Malformed or incomplete input data
    #[error("Data error: {0}")]
    Data(String),

    /// Errors raised by the pipeline runtime (queues, stage lifecycle)
    #[error("Pipeline error: {0}")]
    Pipeline(#[from] PipelineError),

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Generic errors with context
    #[error("{context}: {source}")]
    WithContext {
        context: String,
        #[source]
        source: Box<ReconError>,
    },
}

impl ReconError {
    /// Add context to an error
    pub fn with_context(self, context: impl Into<String>) -> Self {
        ReconError::WithContext {
            context: context.into(),
            source: Box::new(self),
        }
    }

    /// Shorthand for a configuration error
    pub fn config(message: impl Into<String>) -> Self {
        ReconError::Configuration(message.into())
    }

    /// Shorthand for a data error
    pub fn data(message: impl Into<String>) -> Self {
        ReconError::Data(message.into())
    }

    /// Whether the error only invalidates the current message.
    ///
    /// Data errors are absorbed by the owning stage; everything else
    /// invalidates stage state and tears the pipeline down.
    pub fn is_recoverable(&self) -> bool {
        match self {
            ReconError::Data(_) => true,
            ReconError::WithContext { source, .. } => source.is_recoverable(),
            _ => false,
        }
    }
}

/// Result type alias for recon-rs operations
pub type Result<T> = std::result::Result<T, ReconError>;

/// Extension trait for adding context to Results
pub trait ResultExt<T> {
    /// Add context to an error result
    fn context(self, context: impl Into<String>) -> Result<T>;

    /// Add context lazily to an error result
    fn with_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String;
}

impl<T> ResultExt<T> for Result<T> {
    fn context(self, context: impl Into<String>) -> Result<T> {
        self.map_err(|e| e.with_context(context))
    }

    fn with_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String,
    {
        self.map_err(|e| e.with_context(f()))
    }
}

impl From<toml::de::Error> for ReconError {
    fn from(err: toml::de::Error) -> Self {
        ReconError::Serialization(err.to_string())
    }
}

impl From<toml::ser::Error> for ReconError {
    fn from(err: toml::ser::Error) -> Self {
        ReconError::Serialization(err.to_string())
    }
}

impl From<ndarray::ShapeError> for ReconError {
    fn from(err: ndarray::ShapeError) -> Self {
        ReconError::Configuration(format!("array shape: {}", err))
    }
}
