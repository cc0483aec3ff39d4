//! Streaming reconstruction pipeline.
//!
//! Messages flow through a linear chain of stages, each on its own worker
//! thread, joined by bounded FIFO queues:
//!
//! ```text
//! [NoiseAdjust] ──► [Accumulator] ──► [CgSense | GpSense] ──► output
//! ```
//!
//! # Design
//!
//! - **Enum dispatch for built-ins**: `BuiltinStage` covers the shipped
//!   stages; `Stage` trait objects cover plugins.
//! - **Backpressure**: a full queue blocks its producer; closing a queue
//!   wakes both sides.
//! - **Single ownership**: a message is owned by exactly one stage or queue
//!   at a time and moves, never copies, between them.
//! - **Failure cascade**: a fatal stage error closes its input and outputs,
//!   which stops every other stage in turn.

pub mod error;
pub mod executor;
pub mod id;
pub mod message;
pub mod queue;
pub mod stage;
pub mod stage_kind;
pub mod stages;

pub use error::{PipelineError, PipelineResult};
pub use executor::{
    BranchOutput, Pipeline, PipelineBuilder, PipelineReport, QueueReport, RunOutput, RunStatus,
    RunningPipeline, StageReport,
};
pub use id::StageId;
pub use message::{IndexCounters, Message, MessageFlags, MessageHeader, MessageKind, Payload};
pub use queue::{BoundedQueue, QueueEvent, QueueOp};
pub use stage::{AnyStage, BuiltinStage, ConfigureContext, Emitter, Stage, StageState, StageStats};
pub use stage_kind::StageKind;
pub use stages::{AccumulatorStage, CgSenseStage, GpSenseStage, NoiseAdjustStage};
