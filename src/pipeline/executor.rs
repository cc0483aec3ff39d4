//! Pipeline executor
//!
//! A pipeline is a linear chain of stages joined by bounded queues:
//!
//! ```text
//! input ─▶ [stage 0] ─▶ q1 ─▶ [stage 1] ─▶ ... ─▶ [stage n-1] ─▶ output
//!                 └─▶ side branch (by message kind)
//! ```
//!
//! Every stage runs on its own worker thread. A worker pops until its input
//! is closed and empty, drains the stage, then closes its outputs so the
//! end-of-stream propagates downstream. A fatal error closes the input as
//! well, so upstream producers unblock and the failure cascades to the head
//! of the chain.

use crate::config::{PipelineSettings, ReconConfig, StageOptions};
use crate::device::DeviceRegistry;
use crate::error::{ReconError, Result};
use crate::pipeline::error::PipelineError;
use crate::pipeline::id::StageId;
use crate::pipeline::message::{Message, MessageKind};
use crate::pipeline::queue::{BoundedQueue, QueueEvent};
use crate::pipeline::stage::{AnyStage, ConfigureContext, Emitter, StageState, StageStats};
use crate::pipeline::stage_kind::StageKind;
use chrono::{DateTime, Utc};
use crossbeam_channel::Receiver;
use serde::Serialize;
use std::thread::{self, JoinHandle};

// ==================== Builder ====================

struct StageSlot {
    id: StageId,
    name: String,
    stage: AnyStage,
    options: StageOptions,
    branches: Vec<MessageKind>,
    state: StageState,
}

/// Assembles and configures a pipeline.
pub struct PipelineBuilder {
    settings: PipelineSettings,
    devices: Option<DeviceRegistry>,
    slots: Vec<StageSlot>,
    monitor_queues: bool,
}

impl PipelineBuilder {
    pub fn new(settings: PipelineSettings) -> Self {
        Self {
            settings,
            devices: None,
            slots: Vec::new(),
            monitor_queues: false,
        }
    }

    /// Builder for the stage chain described by `config`.
    pub fn from_config(config: &ReconConfig) -> Self {
        config.stages.iter().fold(
            Self::new(config.pipeline.clone()),
            |builder, stage| {
                builder.add_stage(
                    stage.display_name(),
                    AnyStage::from(stage.kind),
                    stage.options.clone(),
                )
            },
        )
    }

    /// Use an explicit device registry instead of one derived from settings.
    pub fn with_devices(mut self, devices: DeviceRegistry) -> Self {
        self.devices = Some(devices);
        self
    }

    /// Record push/pop events on every inter-stage queue.
    pub fn monitor_queues(mut self, enabled: bool) -> Self {
        self.monitor_queues = enabled;
        self
    }

    pub fn add_stage(
        mut self,
        name: impl Into<String>,
        stage: impl Into<AnyStage>,
        options: StageOptions,
    ) -> Self {
        let id = StageId(self.slots.len() as u32);
        self.slots.push(StageSlot {
            id,
            name: name.into(),
            stage: stage.into(),
            options,
            branches: Vec::new(),
            state: StageState::Unconfigured,
        });
        self
    }

    /// Route messages of `kind` emitted by the last added stage to a
    /// dedicated side output instead of downstream.
    pub fn branch(mut self, kind: MessageKind) -> Self {
        if let Some(slot) = self.slots.last_mut() {
            if !slot.branches.contains(&kind) {
                slot.branches.push(kind);
            }
        }
        self
    }

    /// Configure every stage in order and allocate the queues.
    pub fn build(self) -> Result<Pipeline> {
        if self.slots.is_empty() {
            return Err(PipelineError::EmptyPipeline.into());
        }

        let devices = self.devices.unwrap_or_else(|| {
            let count = self.settings.devices();
            if self.settings.shared_devices {
                DeviceRegistry::pooled(count)
            } else {
                DeviceRegistry::new(count)
            }
        });

        let mut slots = self.slots;
        for slot in &mut slots {
            let ctx = ConfigureContext::new(&slot.name, &slot.options, &devices)
                .with_clamp(self.settings.clamp_policy);
            if let Err(e) = slot.stage.configure(&ctx) {
                slot.state.transition(StageState::Failed)?;
                return Err(e.with_context(format!("Failed to configure stage '{}'", slot.name)));
            }
            slot.state.transition(StageState::Configured)?;
        }

        let capacity = self.settings.queue_capacity;
        let mut queues = Vec::with_capacity(slots.len() + 1);
        let mut events = Vec::with_capacity(slots.len() + 1);
        for _ in 0..=slots.len() {
            if self.monitor_queues {
                let (queue, rx) = BoundedQueue::with_events(capacity);
                queues.push(queue);
                events.push(Some(rx));
            } else {
                queues.push(BoundedQueue::new(capacity));
                events.push(None);
            }
        }

        let side_outputs = slots
            .iter()
            .flat_map(|slot| {
                slot.branches.iter().map(move |&kind| SideOutput {
                    stage: slot.id,
                    kind,
                    queue: BoundedQueue::new(capacity),
                })
            })
            .collect();

        tracing::info!(
            "Pipeline built: {} stages, queue capacity {}, {} devices",
            slots.len(),
            capacity,
            devices.count()
        );

        Ok(Pipeline {
            slots,
            queues,
            events,
            side_outputs,
        })
    }
}

// ==================== Pipeline ====================

struct SideOutput {
    stage: StageId,
    kind: MessageKind,
    queue: BoundedQueue<Message>,
}

/// A configured pipeline, ready to start.
pub struct Pipeline {
    slots: Vec<StageSlot>,
    queues: Vec<BoundedQueue<Message>>,
    events: Vec<Option<Receiver<QueueEvent>>>,
    side_outputs: Vec<SideOutput>,
}

impl Pipeline {
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn stage_names(&self) -> Vec<&str> {
        self.slots.iter().map(|s| s.name.as_str()).collect()
    }

    pub fn states(&self) -> Vec<StageState> {
        self.slots.iter().map(|s| s.state).collect()
    }

    /// Spawn one worker thread per stage.
    pub fn start(self) -> Result<RunningPipeline> {
        let started_at = Utc::now();
        let mut queue_names = Vec::with_capacity(self.queues.len());
        let mut workers = Vec::with_capacity(self.slots.len());

        for (index, slot) in self.slots.into_iter().enumerate() {
            queue_names.push(format!("{}.in", slot.name));

            let input = self.queues[index].clone();
            let mut emitter = Emitter::new(self.queues[index + 1].clone());
            for side in self.side_outputs.iter().filter(|s| s.stage == slot.id) {
                emitter = emitter.with_branch(side.kind, side.queue.clone());
            }

            let id = slot.id;
            let name = slot.name.clone();
            let kind = slot.stage.kind();
            let spawned = thread::Builder::new()
                .name(format!("recon-{}", slot.name))
                .spawn(move || run_stage(slot, input, emitter));

            match spawned {
                Ok(handle) => workers.push(Worker {
                    id,
                    name,
                    kind,
                    handle,
                }),
                Err(e) => {
                    // unblock the workers already running
                    for queue in &self.queues {
                        queue.close();
                    }
                    for side in &self.side_outputs {
                        side.queue.close();
                    }
                    return Err(ReconError::Io(e).with_context(format!(
                        "Failed to spawn worker for stage '{}'",
                        name
                    )));
                }
            }
        }
        queue_names.push("output".to_string());

        tracing::info!("Pipeline started with {} workers", workers.len());

        let queues = queue_names.into_iter().zip(self.queues).collect();
        Ok(RunningPipeline {
            queues,
            events: self.events,
            side_outputs: self.side_outputs,
            workers,
            started_at,
        })
    }
}

// ==================== Worker ====================

struct Worker {
    id: StageId,
    name: String,
    kind: Option<StageKind>,
    handle: JoinHandle<StageReport>,
}

/// Closes the given queues when dropped, including during unwinding.
struct CloseOnExit(Vec<BoundedQueue<Message>>);

impl Drop for CloseOnExit {
    fn drop(&mut self) {
        for queue in &self.0 {
            queue.close();
        }
    }
}

fn advance(state: &mut StageState, next: StageState, name: &str) {
    if let Err(e) = state.transition(next) {
        tracing::warn!("Stage '{}': {}", name, e);
    }
}

/// Handle a processing error. Returns the error back when it is fatal.
fn absorb_recoverable(name: &str, err: ReconError, stats: &mut StageStats) -> Option<ReconError> {
    if err.is_recoverable() {
        tracing::warn!("Stage '{}' dropped a message: {}", name, err);
        stats.dropped += 1;
        None
    } else {
        Some(err)
    }
}

fn run_stage(mut slot: StageSlot, input: BoundedQueue<Message>, mut out: Emitter) -> StageReport {
    let outputs = CloseOnExit(out.outputs());
    let _input_guard = CloseOnExit(vec![input.clone()]);

    advance(&mut slot.state, StageState::Running, &slot.name);
    tracing::info!("Stage '{}' thread started", slot.name);

    let mut failure = None;
    while let Some(message) = input.pop() {
        out.stats_mut().received += 1;
        if let Err(e) = slot.stage.process(message, &mut out) {
            failure = absorb_recoverable(&slot.name, e, out.stats_mut());
            if failure.is_some() {
                break;
            }
        }
    }

    if failure.is_none() {
        advance(&mut slot.state, StageState::Draining, &slot.name);
        if let Err(e) = slot.stage.drain(&mut out) {
            failure = absorb_recoverable(&slot.name, e, out.stats_mut());
        }
    }

    if let Some(e) = &failure {
        tracing::error!("Stage '{}' failed: {}", slot.name, e);
        advance(&mut slot.state, StageState::Failed, &slot.name);
        input.close();
    }

    drop(outputs);
    advance(&mut slot.state, StageState::Stopped, &slot.name);

    let stats = *out.stats();
    tracing::info!(
        "Stage '{}' thread exiting: {} received, {} emitted, {} dropped",
        slot.name,
        stats.received,
        stats.emitted,
        stats.dropped
    );

    StageReport {
        id: slot.id,
        name: slot.name,
        kind: slot.stage.kind(),
        state: slot.state,
        stats,
        error: failure.map(|e| e.to_string()),
        upstream_closed: false,
    }
    .mark_cascade()
}

// ==================== Running pipeline ====================

/// Handle to a started pipeline.
pub struct RunningPipeline {
    queues: Vec<(String, BoundedQueue<Message>)>,
    events: Vec<Option<Receiver<QueueEvent>>>,
    side_outputs: Vec<SideOutput>,
    workers: Vec<Worker>,
    started_at: DateTime<Utc>,
}

impl RunningPipeline {
    /// Head of the chain.
    pub fn input(&self) -> &BoundedQueue<Message> {
        &self.queues[0].1
    }

    /// Tail of the chain.
    pub fn output(&self) -> &BoundedQueue<Message> {
        &self.queues[self.queues.len() - 1].1
    }

    /// Side output registered with [`PipelineBuilder::branch`].
    ///
    /// [`finish`](Self::finish) and [`run`](Self::run) drain it into
    /// [`RunOutput::branches`]; pop it directly only when driving the
    /// outputs by hand.
    pub fn side_output(&self, stage: StageId, kind: MessageKind) -> Option<&BoundedQueue<Message>> {
        self.side_outputs
            .iter()
            .find(|s| s.stage == stage && s.kind == kind)
            .map(|s| &s.queue)
    }

    /// Event log of queue `index` (0 is the input, `len` the output), when
    /// monitoring was enabled.
    pub fn queue_events(&self, index: usize) -> Option<&Receiver<QueueEvent>> {
        self.events.get(index).and_then(|e| e.as_ref())
    }

    /// Push one message into the head of the chain, blocking while it is full.
    pub fn push(&self, message: Message) -> Result<()> {
        self.input().push(message).map_err(|rejected| {
            rejected.release();
            ReconError::Pipeline(PipelineError::QueueClosed)
        })
    }

    /// Signal end-of-stream.
    pub fn close_input(&self) {
        self.input().close();
    }

    /// Wait for every worker to exit.
    pub fn join(self) -> PipelineReport {
        let stages: Vec<StageReport> = self
            .workers
            .into_iter()
            .map(|worker| match worker.handle.join() {
                Ok(report) => report,
                Err(payload) => {
                    let message = panic_message(payload.as_ref());
                    tracing::error!("Stage '{}' panicked: {}", worker.name, message);
                    let error = PipelineError::WorkerPanicked {
                        name: worker.name.clone(),
                        message,
                    };
                    StageReport {
                        id: worker.id,
                        name: worker.name,
                        kind: worker.kind,
                        state: StageState::Failed,
                        stats: StageStats::default(),
                        error: Some(error.to_string()),
                        upstream_closed: false,
                    }
                }
            })
            .collect();

        let queues = self
            .queues
            .iter()
            .map(|(name, queue)| QueueReport {
                name: name.clone(),
                capacity: queue.capacity(),
                high_water_mark: queue.high_water_mark(),
            })
            .collect();

        let report = PipelineReport::new(self.started_at, stages, queues);
        match &report.error {
            Some(e) => tracing::error!("Pipeline failed: {}", e),
            None => tracing::info!("Pipeline completed in {} ms", report.elapsed_ms),
        }
        report
    }

    /// Pop the main output and every side output until end-of-stream.
    ///
    /// Each side branch gets its own collector thread, so a branch filling
    /// up never stalls the stage feeding the main output.
    fn collect_outputs(&self) -> (Vec<Message>, Vec<BranchOutput>) {
        thread::scope(|scope| {
            let collectors: Vec<_> = self
                .side_outputs
                .iter()
                .map(|side| {
                    let spawned = thread::Builder::new()
                        .name(format!("recon-branch-{}-{:?}", side.stage, side.kind))
                        .spawn_scoped(scope, move || drain(&side.queue));
                    if let Err(e) = &spawned {
                        // the owning stage fails on its next branch push
                        tracing::error!(
                            "Failed to spawn collector for {:?} branch of stage {}: {}",
                            side.kind,
                            side.stage,
                            e
                        );
                        side.queue.close();
                    }
                    (side, spawned.ok())
                })
                .collect();

            let output = drain(self.output());
            let branches = collectors
                .into_iter()
                .map(|(side, collector)| BranchOutput {
                    stage: side.stage,
                    kind: side.kind,
                    messages: collector
                        .and_then(|handle| handle.join().ok())
                        .unwrap_or_default(),
                })
                .collect();
            (output, branches)
        })
    }

    /// Close the input, collect everything that reaches the outputs, and join.
    pub fn finish(self) -> RunOutput {
        self.close_input();
        let (output, branches) = self.collect_outputs();
        RunOutput {
            output,
            branches,
            report: self.join(),
        }
    }

    /// Feed `source` from a separate thread while collecting the outputs.
    ///
    /// Feeding and collecting on one thread would deadlock once the chain
    /// backs up to the input.
    pub fn run<I>(self, source: I) -> Result<RunOutput>
    where
        I: IntoIterator<Item = Message>,
        I::IntoIter: Send + 'static,
    {
        let input = self.input().clone();
        let source = source.into_iter();
        let feeder = thread::Builder::new()
            .name("recon-source".to_string())
            .spawn(move || {
                let mut pushed = 0u64;
                for message in source {
                    if let Err(rejected) = input.push(message) {
                        rejected.release();
                        tracing::warn!("Input closed after {} messages, stopping source", pushed);
                        break;
                    }
                    pushed += 1;
                }
                input.close();
                pushed
            })
            .map_err(|e| ReconError::Io(e).with_context("Failed to spawn source thread"))?;

        let (output, branches) = self.collect_outputs();

        let pushed = match feeder.join() {
            Ok(n) => n,
            Err(payload) => {
                self.close_input();
                return Err(PipelineError::WorkerPanicked {
                    name: "source".to_string(),
                    message: panic_message(payload.as_ref()),
                }
                .into());
            }
        };
        tracing::debug!("Source pushed {} messages", pushed);

        Ok(RunOutput {
            output,
            branches,
            report: self.join(),
        })
    }
}

fn drain(queue: &BoundedQueue<Message>) -> Vec<Message> {
    std::iter::from_fn(|| queue.pop()).collect()
}

/// Messages that left the pipeline through one side branch.
#[derive(Debug)]
pub struct BranchOutput {
    pub stage: StageId,
    pub kind: MessageKind,
    pub messages: Vec<Message>,
}

/// Everything a finished run produced.
#[derive(Debug)]
pub struct RunOutput {
    /// Messages that reached the end of the chain, in order
    pub output: Vec<Message>,
    pub branches: Vec<BranchOutput>,
    pub report: PipelineReport,
}

impl RunOutput {
    /// Messages collected from the branch of `stage` for `kind`.
    pub fn branch(&self, stage: StageId, kind: MessageKind) -> Option<&[Message]> {
        self.branches
            .iter()
            .find(|b| b.stage == stage && b.kind == kind)
            .map(|b| b.messages.as_slice())
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

// ==================== Report ====================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Completed,
    Failed,
}

#[derive(Debug, Clone, Serialize)]
pub struct StageReport {
    pub id: StageId,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kind: Option<StageKind>,
    pub state: StageState,
    pub stats: StageStats,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// The stage stopped only because its downstream had gone away.
    pub upstream_closed: bool,
}

impl StageReport {
    fn mark_cascade(mut self) -> Self {
        let closed = PipelineError::QueueClosed.to_string();
        self.upstream_closed = self.error.as_deref().is_some_and(|e| e.contains(&closed));
        self
    }

    pub fn failed(&self) -> bool {
        self.error.is_some()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct QueueReport {
    pub name: String,
    pub capacity: usize,
    pub high_water_mark: usize,
}

/// Summary of one pipeline run.
#[derive(Debug, Clone, Serialize)]
pub struct PipelineReport {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub elapsed_ms: i64,
    pub status: RunStatus,
    /// Root cause of a failed run
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub stages: Vec<StageReport>,
    pub queues: Vec<QueueReport>,
}

impl PipelineReport {
    fn new(started_at: DateTime<Utc>, stages: Vec<StageReport>, queues: Vec<QueueReport>) -> Self {
        let finished_at = Utc::now();
        let root = stages
            .iter()
            .find(|s| s.failed() && !s.upstream_closed)
            .or_else(|| stages.iter().find(|s| s.failed()))
            .map(|s| format!("stage '{}': {}", s.name, s.error.as_deref().unwrap_or_default()));

        Self {
            started_at,
            finished_at,
            elapsed_ms: (finished_at - started_at).num_milliseconds(),
            status: if root.is_some() {
                RunStatus::Failed
            } else {
                RunStatus::Completed
            },
            error: root,
            stages,
            queues,
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == RunStatus::Completed
    }

    pub fn stage(&self, name: &str) -> Option<&StageReport> {
        self.stages.iter().find(|s| s.name == name)
    }

    pub fn convergence_warnings(&self) -> u64 {
        self.stages.iter().map(|s| s.stats.convergence_warnings).sum()
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(|e| ReconError::Serialization(e.to_string()))
    }
}
