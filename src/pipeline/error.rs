//! Pipeline-specific error types.

use crate::pipeline::stage::StageState;
use thiserror::Error;

/// Errors raised by the pipeline runtime itself.
///
/// Stage logic reports through [`ReconError`](crate::error::ReconError);
/// these cover queues, lifecycle and worker threads.
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Queue closed")]
    QueueClosed,

    #[error("Invalid stage transition {from:?} -> {to:?}")]
    InvalidTransition { from: StageState, to: StageState },

    #[error("Worker thread '{name}' panicked: {message}")]
    WorkerPanicked { name: String, message: String },

    #[error("Pipeline has no stages")]
    EmptyPipeline,
}

pub type PipelineResult<T> = std::result::Result<T, PipelineError>;
