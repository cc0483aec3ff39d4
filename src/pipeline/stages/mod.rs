//! Built-in stage implementations.
//!
//! - [`NoiseAdjustStage`]: noise covariance and prewhitening
//! - [`AccumulatorStage`]: readouts to reconstruction jobs
//! - [`CgSenseStage`]: CG-SENSE solver stage
//! - [`GpSenseStage`]: gradient-projection SENSE solver stage

pub mod accumulator;
pub mod cg_sense;
pub mod gp_sense;
pub mod noise_adjust;

pub use accumulator::AccumulatorStage;
pub use cg_sense::CgSenseStage;
pub use gp_sense::GpSenseStage;
pub use noise_adjust::NoiseAdjustStage;

use crate::array::CArray;
use crate::device::DeviceLease;
use crate::error::{ReconError, Result};
use crate::job::ReconJob;
use crate::pipeline::message::{IndexCounters, Message, MessageFlags, MessageHeader, MessageKind};
use crate::pipeline::stage::{ConfigureContext, Emitter};
use crate::operators::{for_oversampling, NufftTransform};
use crate::solvers::{OutputMode, SolveResult, SolverSettings};
use ndarray::Axis;

/// Options shared by the solver stages.
pub(crate) struct SolverStageOptions {
    pub settings: SolverSettings,
    pub oversampling: f64,
    pub kernel_width: f64,
    pub image_series: u32,
    pub pass_on_undesired_data: bool,
    pub device: DeviceLease,
}

impl SolverStageOptions {
    pub const DEFAULT_OVERSAMPLING: f64 = 1.25;
    pub const DEFAULT_KERNEL_WIDTH: f64 = 5.5;

    pub fn parse(ctx: &ConfigureContext, default_iterations: i64) -> Result<Self> {
        let options = ctx.options;
        let clamp = ctx.clamp;

        let iterations = clamp.at_least(
            "iterations",
            options.int_or("iterations", default_iterations)?,
            1,
        )?;
        let tolerance = clamp.at_least(
            "tolerance",
            options.float_or("tolerance", 1e-6)?,
            f64::EPSILON,
        )?;
        let oversampling = clamp.at_least(
            "oversampling",
            options.float_or("oversampling", Self::DEFAULT_OVERSAMPLING)?,
            1.0,
        )?;
        let kernel_width = clamp.at_least(
            "kernel_width",
            options.float_or("kernel_width", Self::DEFAULT_KERNEL_WIDTH)?,
            1.0,
        )?;
        let image_series = clamp.at_least("image_series", options.int_or("image_series", 0)?, 0)?;
        let output_mode = OutputMode::parse(&options.string_or("output_mode", "warnings")?)?;

        let device = ctx.devices.bind(options.int_or("device_id", 0)?, clamp)?;
        tracing::debug!("Stage '{}' bound to device {}", ctx.stage_name, device.id());

        Ok(Self {
            settings: SolverSettings {
                max_iterations: iterations as usize,
                tolerance,
                output_mode,
            },
            oversampling,
            kernel_width,
            image_series: image_series as u32,
            pass_on_undesired_data: options.bool_or("pass_on_undesired_data", true)?,
            device,
        })
    }

    /// Transform service for the configured oversampling.
    pub fn transform(&self) -> Box<dyn NufftTransform> {
        for_oversampling(self.oversampling)
    }
}

/// Forward non-job messages, or absorb them when the stage is told to.
pub(crate) fn pass_on(message: Message, pass: bool, out: &mut Emitter) -> Result<()> {
    if pass {
        out.emit(message)
    } else {
        out.absorb(message);
        Ok(())
    }
}

/// Detach and validate the job of a job message.
pub(crate) fn take_job(message: Message) -> Result<(MessageHeader, Box<ReconJob>)> {
    let (header, job) = message
        .into_job()
        .ok_or_else(|| ReconError::data("job message without a job payload"))?;
    job.validate()?;
    Ok((header, job))
}

/// Split `[nx, ny, frames]` into one image message per frame.
pub(crate) fn emit_frames(
    header: &MessageHeader,
    result: SolveResult,
    image_series: u32,
    out: &mut Emitter,
) -> Result<()> {
    let image: CArray = result.image;
    let frames = image.shape().get(2).copied().unwrap_or(1);
    if result.warning.is_some() {
        out.note_convergence_warning();
    }

    for frame in 0..frames {
        let counters = IndexCounters {
            frame: frame as u32,
            image_index: header.counters.image_index * frames as u32 + frame as u32,
            image_series,
            ..header.counters
        };
        let mut message = Message::image(counters, image.index_axis(Axis(2), frame).to_owned());
        let flags = &mut message.header_mut().flags;
        if !result.converged {
            flags.insert(MessageFlags::NOT_CONVERGED);
        }
        if frame + 1 == frames {
            flags.insert(MessageFlags::LAST_IN_SERIES);
        }
        debug_assert_eq!(message.kind(), MessageKind::Image);
        out.emit(message)?;
    }
    Ok(())
}
