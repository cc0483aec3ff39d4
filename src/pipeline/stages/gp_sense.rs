//! GpSenseStage: gradient-projection SENSE with TV and TV-PICS.
//!
//! The regularization weight λ and mix α split into a TV term with weight
//! `λ(1 − α)` and a prior-image-constrained TV term with weight `λα`. A term
//! is only added when its weight is positive. The prior image (from the job,
//! or the frame-averaged adjoint image) is expanded over frames and doubles
//! as the starting iterate.

use super::{emit_frames, pass_on, take_job, SolverStageOptions};
use crate::array;
use crate::error::{ReconError, Result};
use crate::job::ReconJob;
use crate::operators::{DiagonalPreconditioner, SenseEncoding, TvOperator, TvPicsOperator};
use crate::pipeline::message::{Message, MessageKind};
use crate::pipeline::stage::{ConfigureContext, Emitter, Stage};
use crate::solvers::{GpBbSolver, SolveResult, Solver};

pub const DEFAULT_LAMBDA: f64 = 2e-7;
pub const DEFAULT_ALPHA: f64 = 0.5;
pub const DEFAULT_ITERATIONS: i64 = 50;

pub struct GpSenseStage {
    options: Option<SolverStageOptions>,
    lambda: f64,
    alpha: f64,
    non_negative: bool,
}

impl GpSenseStage {
    pub fn new() -> Self {
        Self {
            options: None,
            lambda: DEFAULT_LAMBDA,
            alpha: DEFAULT_ALPHA,
            non_negative: false,
        }
    }

    /// `(tv, tv_pics)` weights.
    pub fn term_weights(&self) -> (f64, f64) {
        (self.lambda * (1.0 - self.alpha), self.lambda * self.alpha)
    }

    pub fn device_id(&self) -> Option<usize> {
        self.options.as_ref().map(|o| o.device.id())
    }

    pub fn reconstruct(&self, job: &ReconJob) -> Result<SolveResult> {
        let options = self
            .options
            .as_ref()
            .ok_or_else(|| ReconError::config("gp_sense used before configure"))?;
        let dims = job.image_dims();

        let encoding = SenseEncoding::new(
            job,
            options.transform(),
            options.oversampling,
            options.kernel_width,
        )?;
        let b = encoding.weighted_samples(&job.samples)?;

        let prior = match &job.prior {
            Some(p) if p.ndim() == 2 => array::expand(p, job.frames),
            Some(p) => p.clone(),
            None => array::expand(&encoding.prior_image(&b)?, job.frames),
        };

        let (tv_weight, pics_weight) = self.term_weights();
        let mut solver = GpBbSolver::new(options.settings);
        solver.set_encoding_operator(Box::new(encoding));
        solver.set_preconditioner(Box::new(DiagonalPreconditioner::new(&dims)));
        solver.set_non_negativity(self.non_negative);
        if tv_weight > 0.0 {
            solver.add_nonlinear_operator(Box::new(TvOperator::new(&dims).with_weight(tv_weight)));
        }
        if pics_weight > 0.0 {
            let mut pics = TvPicsOperator::new(&dims).with_weight(pics_weight);
            pics.set_prior(&prior)?;
            solver.add_nonlinear_operator(Box::new(pics));
        }
        solver.set_x0(prior.clone());

        let result = solver.solve(&b)?;
        tracing::debug!(
            "GP-SENSE: {} iterations, {} penalty terms, final cost {:?}",
            result.iterations,
            solver.nonlinear_count(),
            result.cost_trace.last()
        );
        Ok(result)
    }
}

impl Default for GpSenseStage {
    fn default() -> Self {
        Self::new()
    }
}

impl Stage for GpSenseStage {
    fn name(&self) -> &str {
        "gp_sense"
    }

    fn configure(&mut self, ctx: &ConfigureContext) -> Result<()> {
        let options = SolverStageOptions::parse(ctx, DEFAULT_ITERATIONS)?;
        self.lambda = ctx.clamp.at_least(
            "regularization_weight",
            ctx.options.float_or("regularization_weight", DEFAULT_LAMBDA)?,
            0.0,
        )?;
        self.alpha = ctx.clamp.within(
            "regularization_mix",
            ctx.options.float_or("regularization_mix", DEFAULT_ALPHA)?,
            0.0,
            1.0,
        )?;
        self.non_negative = ctx.options.bool_or("non_negative", false)?;

        let (tv, pics) = self.term_weights();
        tracing::info!(
            "GP-SENSE: {} iterations, TV weight {:e}, PICS weight {:e}, device {}",
            options.settings.max_iterations,
            tv,
            pics,
            options.device.id()
        );
        self.options = Some(options);
        Ok(())
    }

    fn process(&mut self, message: Message, out: &mut Emitter) -> Result<()> {
        let (pass, series) = match &self.options {
            Some(o) => (o.pass_on_undesired_data, o.image_series),
            None => return Err(ReconError::config("gp_sense used before configure")),
        };
        if message.kind() != MessageKind::Job {
            return pass_on(message, pass, out);
        }

        let (header, job) = take_job(message)?;
        let result = self.reconstruct(&job)?;
        drop(job);
        emit_frames(&header, result, series, out)
    }
}
