//! CgSenseStage: CG-SENSE reconstruction of accumulated jobs.
//!
//! Solves `(EᴴE + κ RᴴR) x = Eᴴb` per job with a Jacobi preconditioner
//! `1/sqrt(Σ|csm|² + κ·diag(RᴴR))`. `R` is the identity, or an image-weight
//! operator derived from the job's prior (the frame-averaged adjoint image
//! when the job carries none).

use super::{emit_frames, pass_on, take_job, SolverStageOptions};
use crate::array::CArray;
use crate::error::{ReconError, Result};
use crate::job::ReconJob;
use crate::operators::{
    DiagonalPreconditioner, IdentityOperator, ImageWeightOperator, LinearOperator, SenseEncoding,
};
use crate::pipeline::message::{Message, MessageKind};
use crate::pipeline::stage::{ConfigureContext, Emitter, Stage};
use crate::solvers::{CgSolver, SolveResult, Solver};
use std::borrow::Cow;

/// Default regularization weight κ.
pub const DEFAULT_KAPPA: f64 = 0.1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Regularizer {
    Identity,
    ImageWeight,
}

impl Regularizer {
    fn parse(s: &str) -> Result<Self> {
        match s {
            "identity" => Ok(Regularizer::Identity),
            "image_weight" => Ok(Regularizer::ImageWeight),
            other => Err(ReconError::config(format!(
                "unknown regularizer '{}' (expected identity or image_weight)",
                other
            ))),
        }
    }
}

pub struct CgSenseStage {
    options: Option<SolverStageOptions>,
    kappa: f64,
    regularizer: Regularizer,
    image_weight_floor: f64,
}

impl CgSenseStage {
    pub fn new() -> Self {
        Self {
            options: None,
            kappa: DEFAULT_KAPPA,
            regularizer: Regularizer::Identity,
            image_weight_floor: ImageWeightOperator::DEFAULT_FLOOR,
        }
    }

    pub fn kappa(&self) -> f64 {
        self.kappa
    }

    pub fn regularizer(&self) -> Regularizer {
        self.regularizer
    }

    /// Bound device, once configured.
    pub fn device_id(&self) -> Option<usize> {
        self.options.as_ref().map(|o| o.device.id())
    }

    /// Run one reconstruction. Everything built here borrows `job` and is
    /// dropped before returning.
    pub fn reconstruct(&self, job: &ReconJob) -> Result<SolveResult> {
        let options = self
            .options
            .as_ref()
            .ok_or_else(|| ReconError::config("cg_sense used before configure"))?;
        let dims = job.image_dims();

        let encoding = SenseEncoding::new(
            job,
            options.transform(),
            options.oversampling,
            options.kernel_width,
        )?;
        let b = encoding.weighted_samples(&job.samples)?;

        let mut solver = CgSolver::new(options.settings);
        if self.kappa > 0.0 {
            let regularizer: Box<dyn LinearOperator> = match self.regularizer {
                Regularizer::Identity => {
                    Box::new(IdentityOperator::new(&dims).with_weight(self.kappa))
                }
                Regularizer::ImageWeight => {
                    let prior: Cow<CArray> = match &job.prior {
                        Some(p) => Cow::Borrowed(p),
                        None => Cow::Owned(encoding.prior_image(&b)?),
                    };
                    Box::new(
                        ImageWeightOperator::from_prior(&prior, job.frames, self.image_weight_floor)?
                            .with_weight(self.kappa),
                    )
                }
            };
            solver.add_regularization_operator(regularizer);
        }
        solver.set_encoding_operator(Box::new(encoding));
        solver.set_preconditioner(Box::new(DiagonalPreconditioner::new(&dims)));

        let result = solver.solve(&b)?;
        tracing::debug!(
            "CG-SENSE: {} iterations, residual {:.3e}, converged {}",
            result.iterations,
            result.final_residual(),
            result.converged
        );
        Ok(result)
    }
}

impl Default for CgSenseStage {
    fn default() -> Self {
        Self::new()
    }
}

impl Stage for CgSenseStage {
    fn name(&self) -> &str {
        "cg_sense"
    }

    fn configure(&mut self, ctx: &ConfigureContext) -> Result<()> {
        let options = SolverStageOptions::parse(ctx, 10)?;
        self.kappa = ctx.clamp.at_least(
            "regularization_weight",
            ctx.options.float_or("regularization_weight", DEFAULT_KAPPA)?,
            0.0,
        )?;
        self.regularizer = Regularizer::parse(&ctx.options.string_or("regularizer", "identity")?)?;
        self.image_weight_floor = ctx.clamp.within(
            "image_weight_floor",
            ctx.options
                .float_or("image_weight_floor", ImageWeightOperator::DEFAULT_FLOOR)?,
            f64::EPSILON,
            1.0,
        )?;

        tracing::info!(
            "CG-SENSE: {} iterations, tolerance {:e}, kappa {}, {:?} regularizer, device {}",
            options.settings.max_iterations,
            options.settings.tolerance,
            self.kappa,
            self.regularizer,
            options.device.id()
        );
        self.options = Some(options);
        Ok(())
    }

    fn process(&mut self, message: Message, out: &mut Emitter) -> Result<()> {
        let (pass, series) = match &self.options {
            Some(o) => (o.pass_on_undesired_data, o.image_series),
            None => return Err(ReconError::config("cg_sense used before configure")),
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
