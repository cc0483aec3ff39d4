//! Stage abstraction for the pipeline.
//!
//! Two-layer design:
//! - **`Stage` trait**: for user-supplied stages plugged into a pipeline.
//! - **`BuiltinStage` enum**: for the built-in stages. Match arms dispatch
//!   statically; only plugins go through a vtable.
//!
//! `AnyStage` wraps either variant so the executor can handle both uniformly.

use crate::config::{ClampPolicy, StageOptions};
use crate::device::DeviceRegistry;
use crate::error::{ReconError, Result};
use crate::pipeline::error::PipelineError;
use crate::pipeline::message::{Message, MessageKind};
use crate::pipeline::queue::BoundedQueue;
use crate::pipeline::stage_kind::StageKind;
use crate::pipeline::stages::{AccumulatorStage, CgSenseStage, GpSenseStage, NoiseAdjustStage};
use serde::Serialize;

/// Everything a stage may look at while configuring.
pub struct ConfigureContext<'a> {
    pub stage_name: &'a str,
    pub options: &'a StageOptions,
    pub devices: &'a DeviceRegistry,
    pub clamp: ClampPolicy,
}

impl<'a> ConfigureContext<'a> {
    pub fn new(stage_name: &'a str, options: &'a StageOptions, devices: &'a DeviceRegistry) -> Self {
        Self {
            stage_name,
            options,
            devices,
            clamp: ClampPolicy::default(),
        }
    }

    pub fn with_clamp(mut self, clamp: ClampPolicy) -> Self {
        self.clamp = clamp;
        self
    }
}

/// Lifecycle of a stage.
///
/// `Unconfigured → Configured → Running → (Draining | Failed) → Stopped`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StageState {
    Unconfigured,
    Configured,
    Running,
    Draining,
    Failed,
    Stopped,
}

impl StageState {
    pub fn can_transition_to(self, next: StageState) -> bool {
        use StageState::*;
        matches!(
            (self, next),
            (Unconfigured, Configured)
                | (Unconfigured, Failed)
                | (Configured, Running)
                | (Configured, Stopped)
                | (Running, Draining)
                | (Running, Failed)
                | (Draining, Stopped)
                | (Draining, Failed)
                | (Failed, Stopped)
        )
    }

    /// Move to `next`, rejecting transitions outside the state machine.
    pub fn transition(&mut self, next: StageState) -> std::result::Result<(), PipelineError> {
        if !self.can_transition_to(next) {
            return Err(PipelineError::InvalidTransition {
                from: *self,
                to: next,
            });
        }
        *self = next;
        Ok(())
    }
}

/// Per-stage message counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StageStats {
    pub received: u64,
    pub emitted: u64,
    /// Messages rejected with a data error
    pub dropped: u64,
    /// Messages consumed without output (noise readouts, filtered data,
    /// buffered data discarded at end of stream)
    pub absorbed: u64,
    pub convergence_warnings: u64,
}

/// Output side of a running stage.
///
/// Messages go to a side branch registered for their kind, or to the
/// default downstream queue.
pub struct Emitter {
    next: BoundedQueue<Message>,
    branches: Vec<(MessageKind, BoundedQueue<Message>)>,
    stats: StageStats,
}

impl Emitter {
    pub fn new(next: BoundedQueue<Message>) -> Self {
        Self {
            next,
            branches: Vec::new(),
            stats: StageStats::default(),
        }
    }

    pub fn with_branch(mut self, kind: MessageKind, queue: BoundedQueue<Message>) -> Self {
        self.branches.push((kind, queue));
        self
    }

    /// Hand `message` downstream, blocking while the target queue is full.
    ///
    /// Fails with [`PipelineError::QueueClosed`] when downstream has stopped;
    /// the message is released.
    pub fn emit(&mut self, message: Message) -> Result<()> {
        let kind = message.kind();
        let queue = self
            .branches
            .iter()
            .find(|(k, _)| *k == kind)
            .map(|(_, q)| q)
            .unwrap_or(&self.next);

        match queue.push(message) {
            Ok(()) => {
                self.stats.emitted += 1;
                Ok(())
            }
            Err(rejected) => {
                rejected.release();
                Err(ReconError::Pipeline(PipelineError::QueueClosed))
            }
        }
    }

    /// Count a message consumed without producing output.
    pub fn absorb(&mut self, message: Message) {
        self.stats.absorbed += 1;
        message.release();
    }

    /// Count `count` messages the stage had buffered and now gives up on.
    pub fn absorb_buffered(&mut self, count: usize) {
        self.stats.absorbed += count as u64;
    }

    pub fn note_convergence_warning(&mut self) {
        self.stats.convergence_warnings += 1;
    }

    pub fn stats(&self) -> &StageStats {
        &self.stats
    }

    pub(crate) fn stats_mut(&mut self) -> &mut StageStats {
        &mut self.stats
    }

    /// Handles to every output queue.
    pub(crate) fn outputs(&self) -> Vec<BoundedQueue<Message>> {
        std::iter::once(self.next.clone())
            .chain(self.branches.iter().map(|(_, q)| q.clone()))
            .collect()
    }
}

/// Trait for pluggable stages.
pub trait Stage: Send {
    /// Human-readable name of this stage.
    fn name(&self) -> &str;

    /// One-time setup from typed options. Fails fast on bad options.
    fn configure(&mut self, ctx: &ConfigureContext) -> Result<()>;

    /// Consume one message, emitting zero or more downstream.
    fn process(&mut self, message: Message, out: &mut Emitter) -> Result<()>;

    /// Called once after the input reached end-of-stream.
    fn drain(&mut self, _out: &mut Emitter) -> Result<()> {
        Ok(())
    }
}

/// Enum dispatch for built-in stages.
pub enum BuiltinStage {
    NoiseAdjust(NoiseAdjustStage),
    Accumulator(AccumulatorStage),
    CgSense(CgSenseStage),
    GpSense(GpSenseStage),
}

impl BuiltinStage {
    /// A fresh, unconfigured stage of `kind`.
    pub fn create(kind: StageKind) -> Self {
        match kind {
            StageKind::NoiseAdjust => BuiltinStage::NoiseAdjust(NoiseAdjustStage::new()),
            StageKind::Accumulator => BuiltinStage::Accumulator(AccumulatorStage::new()),
            StageKind::CgSense => BuiltinStage::CgSense(CgSenseStage::new()),
            StageKind::GpSense => BuiltinStage::GpSense(GpSenseStage::new()),
        }
    }

    pub fn kind(&self) -> StageKind {
        match self {
            BuiltinStage::NoiseAdjust(_) => StageKind::NoiseAdjust,
            BuiltinStage::Accumulator(_) => StageKind::Accumulator,
            BuiltinStage::CgSense(_) => StageKind::CgSense,
            BuiltinStage::GpSense(_) => StageKind::GpSense,
        }
    }

    pub fn name(&self) -> &str {
        match self {
            BuiltinStage::NoiseAdjust(s) => s.name(),
            BuiltinStage::Accumulator(s) => s.name(),
            BuiltinStage::CgSense(s) => s.name(),
            BuiltinStage::GpSense(s) => s.name(),
        }
    }

    pub fn configure(&mut self, ctx: &ConfigureContext) -> Result<()> {
        match self {
            BuiltinStage::NoiseAdjust(s) => s.configure(ctx),
            BuiltinStage::Accumulator(s) => s.configure(ctx),
            BuiltinStage::CgSense(s) => s.configure(ctx),
            BuiltinStage::GpSense(s) => s.configure(ctx),
        }
    }

    #[inline]
    pub fn process(&mut self, message: Message, out: &mut Emitter) -> Result<()> {
        match self {
            BuiltinStage::NoiseAdjust(s) => s.process(message, out),
            BuiltinStage::Accumulator(s) => s.process(message, out),
            BuiltinStage::CgSense(s) => s.process(message, out),
            BuiltinStage::GpSense(s) => s.process(message, out),
        }
    }

    pub fn drain(&mut self, out: &mut Emitter) -> Result<()> {
        match self {
            BuiltinStage::NoiseAdjust(s) => s.drain(out),
            BuiltinStage::Accumulator(s) => s.drain(out),
            BuiltinStage::CgSense(s) => s.drain(out),
            BuiltinStage::GpSense(s) => s.drain(out),
        }
    }
}

/// Wrapper that can hold either a built-in or a plugin stage.
pub enum AnyStage {
    Builtin(BuiltinStage),
    Plugin(Box<dyn Stage>),
}

impl AnyStage {
    pub fn kind(&self) -> Option<StageKind> {
        match self {
            AnyStage::Builtin(s) => Some(s.kind()),
            AnyStage::Plugin(_) => None,
        }
    }

    pub fn name(&self) -> &str {
        match self {
            AnyStage::Builtin(s) => s.name(),
            AnyStage::Plugin(s) => s.name(),
        }
    }

    pub fn configure(&mut self, ctx: &ConfigureContext) -> Result<()> {
        match self {
            AnyStage::Builtin(s) => s.configure(ctx),
            AnyStage::Plugin(s) => s.configure(ctx),
        }
    }

    #[inline]
    pub fn process(&mut self, message: Message, out: &mut Emitter) -> Result<()> {
        match self {
            AnyStage::Builtin(s) => s.process(message, out),
            AnyStage::Plugin(s) => s.process(message, out),
        }
    }

    pub fn drain(&mut self, out: &mut Emitter) -> Result<()> {
        match self {
            AnyStage::Builtin(s) => s.drain(out),
            AnyStage::Plugin(s) => s.drain(out),
        }
    }
}

impl From<BuiltinStage> for AnyStage {
    fn from(stage: BuiltinStage) -> Self {
        AnyStage::Builtin(stage)
    }
}

impl From<StageKind> for AnyStage {
    fn from(kind: StageKind) -> Self {
        AnyStage::Builtin(BuiltinStage::create(kind))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::array;
    use crate::pipeline::message::IndexCounters;

    #[test]
    fn test_state_machine() {
        let mut state = StageState::Unconfigured;
        assert!(state.transition(StageState::Running).is_err());
        state.transition(StageState::Configured).unwrap();
        state.transition(StageState::Running).unwrap();
        state.transition(StageState::Draining).unwrap();
        state.transition(StageState::Stopped).unwrap();
        assert!(state.transition(StageState::Running).is_err());

        assert!(StageState::Running.can_transition_to(StageState::Failed));
        assert!(StageState::Failed.can_transition_to(StageState::Stopped));
        assert!(!StageState::Failed.can_transition_to(StageState::Running));
    }

    #[test]
    fn test_emitter_routes_by_kind() {
        let next = BoundedQueue::new(4);
        let images = BoundedQueue::new(4);
        let mut out = Emitter::new(next.clone()).with_branch(MessageKind::Image, images.clone());

        out.emit(Message::image(IndexCounters::default(), array::create(&[2, 2])))
            .unwrap();
        out.emit(Message::noise(array::create(&[2, 1]), 1.0)).unwrap();

        assert_eq!(images.len(), 1);
        assert_eq!(next.len(), 1);
        assert_eq!(out.stats().emitted, 2);
    }

    #[test]
    fn test_emit_into_closed_queue_fails() {
        let next = BoundedQueue::new(1);
        next.close();
        let mut out = Emitter::new(next);
        let err = out
            .emit(Message::noise(array::create(&[2, 1]), 1.0))
            .unwrap_err();
        assert!(matches!(err, ReconError::Pipeline(PipelineError::QueueClosed)));
        assert!(!err.is_recoverable());
        assert_eq!(out.stats().emitted, 0);
    }

    #[test]
    fn test_builtin_kinds() {
        for kind in StageKind::all() {
            let stage = AnyStage::from(*kind);
            assert_eq!(stage.kind(), Some(*kind));
            assert_eq!(stage.name(), kind.config_key());
        }
    }
}
