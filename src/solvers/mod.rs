//! Iterative solvers.
//!
//! Both solvers reconstruct an image `x` from encoded samples `b` given an
//! encoding operator `E` (weight `w_E`), optional linear regularizers `Rᵢ`
//! (weights `wᵢ`) and a preconditioner:
//!
//! - [`CgSolver`] solves the normal equations
//!   `(w_E EᴴE + Σ wᵢ RᵢᴴRᵢ) x = w_E Eᴴb` with preconditioned conjugate gradients.
//! - [`GpBbSolver`] minimises `½w_E‖Ex − b‖² + Σ ½wᵢ‖Rᵢx‖² + Σ λⱼΦⱼ(x)` by
//!   gradient projection with Barzilai–Borwein steps, which also admits the
//!   nonlinear TV penalties `Φⱼ`.
//!
//! Running out of iterations is not an error: the partial result is returned
//! with `converged == false` and a [`ConvergenceWarning`] attached.

pub mod cg;
pub mod gp;

pub use cg::CgSolver;
pub use gp::GpBbSolver;

use crate::array::CArray;
use crate::error::{ReconError, Result};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// How chatty a solver is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputMode {
    Silent,
    /// Only convergence warnings
    #[default]
    Warnings,
    /// Per-iteration progress at debug level
    Verbose,
}

impl OutputMode {
    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "silent" => Ok(OutputMode::Silent),
            "warnings" => Ok(OutputMode::Warnings),
            "verbose" => Ok(OutputMode::Verbose),
            other => Err(ReconError::config(format!(
                "unknown output_mode '{}' (expected silent, warnings or verbose)",
                other
            ))),
        }
    }

    pub(crate) fn iteration(self, solver: &str, iteration: usize, residual: f64) {
        if self == OutputMode::Verbose {
            tracing::debug!("{} iteration {}: relative residual {:.3e}", solver, iteration, residual);
        }
    }

    pub(crate) fn warn(self, solver: &str, warning: &ConvergenceWarning) {
        if self != OutputMode::Silent {
            tracing::warn!("{}: {}", solver, warning);
        }
    }
}

/// Iteration control shared by all solvers.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SolverSettings {
    pub max_iterations: usize,
    /// Relative tolerance
    pub tolerance: f64,
    pub output_mode: OutputMode,
}

impl Default for SolverSettings {
    fn default() -> Self {
        Self {
            max_iterations: 10,
            tolerance: 1e-6,
            output_mode: OutputMode::default(),
        }
    }
}

impl SolverSettings {
    pub fn validate(&self) -> Result<()> {
        if self.max_iterations == 0 {
            return Err(ReconError::config("max_iterations must be positive"));
        }
        if !(self.tolerance > 0.0) || !self.tolerance.is_finite() {
            return Err(ReconError::config(format!(
                "tolerance must be positive and finite, got {}",
                self.tolerance
            )));
        }
        Ok(())
    }
}

/// A solve that ran out of iterations before reaching its tolerance.
#[derive(Error, Debug, Clone, PartialEq, Serialize)]
#[error(
    "not converged after {iterations} iterations: relative residual {residual:.3e} > tolerance {tolerance:.1e}"
)]
pub struct ConvergenceWarning {
    pub iterations: usize,
    pub residual: f64,
    pub tolerance: f64,
}

/// Outcome of one `solve`.
#[derive(Debug, Clone)]
pub struct SolveResult {
    pub image: CArray,
    pub iterations: usize,
    pub converged: bool,
    /// Relative residual (CG) or gradient norm (GP) per iteration, starting at 1.0
    pub residual_trace: Vec<f64>,
    /// Objective value per accepted iterate (GP only)
    pub cost_trace: Vec<f64>,
    pub warning: Option<ConvergenceWarning>,
}

impl SolveResult {
    pub fn final_residual(&self) -> f64 {
        self.residual_trace.last().copied().unwrap_or(0.0)
    }
}

pub trait Solver {
    fn settings(&self) -> &SolverSettings;

    /// Reconstruct from encoded samples `b` (codomain of the encoding operator).
    fn solve(&mut self, b: &CArray) -> Result<SolveResult>;
}
