//! Gradient projection with Barzilai–Borwein step lengths.
//!
//! Each iteration steps along the preconditioned negative gradient, projects
//! onto the feasible set (all images, or non-negative real images) and
//! backtracks by halving until the objective does not increase. The next
//! trial step is the BB2 length `⟨s, y⟩ / ⟨y, M y⟩` measured in the
//! preconditioner metric.

use super::{ConvergenceWarning, SolveResult, Solver, SolverSettings};
use crate::array::{self, CArray, Complex64};
use crate::error::{ReconError, Result};
use crate::operators::{LinearOperator, NonlinearOperator, Preconditioner};

pub struct GpBbSolver<'a> {
    settings: SolverSettings,
    encoding: Option<Box<dyn LinearOperator + 'a>>,
    regularization: Vec<Box<dyn LinearOperator + 'a>>,
    nonlinear: Vec<Box<dyn NonlinearOperator + 'a>>,
    preconditioner: Option<Box<dyn Preconditioner + 'a>>,
    x0: Option<CArray>,
    non_negativity: bool,
    max_backtracks: usize,
}

impl<'a> GpBbSolver<'a> {
    pub const DEFAULT_MAX_BACKTRACKS: usize = 30;

    pub fn new(settings: SolverSettings) -> Self {
        Self {
            settings,
            encoding: None,
            regularization: Vec::new(),
            nonlinear: Vec::new(),
            preconditioner: None,
            x0: None,
            non_negativity: false,
            max_backtracks: Self::DEFAULT_MAX_BACKTRACKS,
        }
    }

    pub fn set_encoding_operator(&mut self, op: Box<dyn LinearOperator + 'a>) {
        self.encoding = Some(op);
    }

    pub fn add_regularization_operator(&mut self, op: Box<dyn LinearOperator + 'a>) {
        self.regularization.push(op);
    }

    pub fn add_nonlinear_operator(&mut self, op: Box<dyn NonlinearOperator + 'a>) {
        self.nonlinear.push(op);
    }

    pub fn set_preconditioner(&mut self, precond: Box<dyn Preconditioner + 'a>) {
        self.preconditioner = Some(precond);
    }

    /// Initial iterate.
    pub fn set_x0(&mut self, x0: CArray) {
        self.x0 = Some(x0);
    }

    /// Restrict the solution to non-negative real images.
    pub fn set_non_negativity(&mut self, enabled: bool) {
        self.non_negativity = enabled;
    }

    pub fn set_max_backtracks(&mut self, n: usize) {
        self.max_backtracks = n;
    }

    pub fn nonlinear_count(&self) -> usize {
        self.nonlinear.len()
    }
}

/// Borrowed view of the objective's terms.
struct Objective<'s, 'a> {
    encoding: &'s (dyn LinearOperator + 'a),
    regularization: &'s [Box<dyn LinearOperator + 'a>],
    nonlinear: &'s [Box<dyn NonlinearOperator + 'a>],
    b: &'s CArray,
}

impl Objective<'_, '_> {
    fn cost(&self, x: &CArray) -> Result<f64> {
        let mut residual = self.encoding.apply(x)?;
        array::axpy(-1.0, self.b, &mut residual);
        let mut cost = 0.5 * self.encoding.weight() * array::nrm2(&residual).powi(2);
        for op in self.regularization {
            cost += 0.5 * op.weight() * array::nrm2(&op.apply(x)?).powi(2);
        }
        for op in self.nonlinear {
            cost += op.weight() * op.cost(x)?;
        }
        Ok(cost)
    }

    fn gradient(&self, x: &CArray) -> Result<CArray> {
        let mut residual = self.encoding.apply(x)?;
        array::axpy(-1.0, self.b, &mut residual);
        let mut grad = self.encoding.apply_adjoint(&residual)?;
        array::scale_inplace(&mut grad, self.encoding.weight());
        for op in self.regularization {
            array::axpy(op.weight(), &op.apply_normal(x)?, &mut grad);
        }
        for op in self.nonlinear {
            array::axpy(op.weight(), &op.gradient(x)?, &mut grad);
        }
        Ok(grad)
    }
}

fn project_non_negative(x: &mut CArray) {
    x.mapv_inplace(|v| Complex64::new(v.re.max(0.0), 0.0));
}

impl GpBbSolver<'_> {
    fn project(&self, x: &mut CArray) {
        if self.non_negativity {
            project_non_negative(x);
        }
    }

    /// `x − P(x − g)`; equals `g` without constraints.
    fn projected_gradient(&self, x: &CArray, g: &CArray) -> CArray {
        if !self.non_negativity {
            return g.clone();
        }
        let mut stepped = x.clone();
        array::axpy(-1.0, g, &mut stepped);
        project_non_negative(&mut stepped);
        let mut pg = x.clone();
        array::axpy(-1.0, &stepped, &mut pg);
        pg
    }

    fn precondition(&self, g: &CArray) -> Result<CArray> {
        match self.preconditioner.as_deref() {
            Some(m) => m.apply(g),
            None => Ok(g.clone()),
        }
    }
}

impl Solver for GpBbSolver<'_> {
    fn settings(&self) -> &SolverSettings {
        &self.settings
    }

    fn solve(&mut self, b: &CArray) -> Result<SolveResult> {
        self.settings.validate()?;
        let encoding = self
            .encoding
            .as_deref()
            .ok_or_else(|| ReconError::config("GP solver has no encoding operator"))?;
        let dims = encoding.domain_dims().to_vec();
        for op in &self.regularization {
            array::check_dims(&dims, op.domain_dims(), op.name())?;
        }
        for op in &self.nonlinear {
            array::check_dims(&dims, op.domain_dims(), op.name())?;
        }
        array::check_dims(encoding.codomain_dims(), b.shape(), "GP right-hand side")?;

        if let Some(precond) = self.preconditioner.as_mut() {
            let mut terms: Vec<(f64, &dyn LinearOperator)> = vec![(encoding.weight(), encoding)];
            terms.extend(
                self.regularization
                    .iter()
                    .map(|op| (op.weight(), op.as_ref() as &dyn LinearOperator)),
            );
            precond.recompute(&terms)?;
        }

        let objective = Objective {
            encoding,
            regularization: &self.regularization,
            nonlinear: &self.nonlinear,
            b,
        };
        let mode = self.settings.output_mode;
        let tolerance = self.settings.tolerance;

        let mut x = match &self.x0 {
            Some(x0) => {
                array::check_dims(&dims, x0.shape(), "GP initial estimate")?;
                x0.clone()
            }
            None => array::create(&dims),
        };
        self.project(&mut x);

        let mut f = objective.cost(&x)?;
        let mut g = objective.gradient(&x)?;
        let g0 = array::nrm2(&self.projected_gradient(&x, &g));
        let mut residual_trace = vec![1.0];
        let mut cost_trace = vec![f];

        if g0 == 0.0 {
            tracing::debug!("GP: initial iterate is stationary");
            return Ok(SolveResult {
                image: x,
                iterations: 0,
                converged: true,
                residual_trace: vec![0.0],
                cost_trace,
                warning: None,
            });
        }

        let mut alpha = 1.0;
        let mut iterations = 0;
        let mut converged = false;

        for iteration in 1..=self.settings.max_iterations {
            let d = self.precondition(&g)?;

            let mut step = alpha;
            let mut accepted = None;
            for _ in 0..self.max_backtracks.max(1) {
                let mut trial = x.clone();
                array::axpy(-step, &d, &mut trial);
                self.project(&mut trial);
                let f_trial = objective.cost(&trial)?;
                if f_trial.is_finite() && f_trial <= f {
                    accepted = Some((trial, f_trial));
                    break;
                }
                step *= 0.5;
            }
            let Some((x_next, f_next)) = accepted else {
                tracing::debug!("GP: no decrease after {} backtracks", self.max_backtracks);
                break;
            };

            let g_next = objective.gradient(&x_next)?;

            // BB2 in the preconditioner metric
            let mut s = x_next.clone();
            array::axpy(-1.0, &x, &mut s);
            let mut y = g_next.clone();
            array::axpy(-1.0, &g, &mut y);
            let sy = array::dot(&s, &y).re;
            let y_my = array::dot(&y, &self.precondition(&y)?).re;
            alpha = if sy > 0.0 && y_my > 0.0 && (sy / y_my).is_finite() {
                sy / y_my
            } else {
                step
            };

            x = x_next;
            f = f_next;
            g = g_next;
            iterations = iteration;

            let relative = array::nrm2(&self.projected_gradient(&x, &g)) / g0;
            residual_trace.push(relative);
            cost_trace.push(f);
            mode.iteration("GP", iteration, relative);
            if relative < tolerance {
                converged = true;
                break;
            }
        }

        let warning = (!converged).then(|| ConvergenceWarning {
            iterations,
            residual: residual_trace.last().copied().unwrap_or(1.0),
            tolerance,
        });
        if let Some(w) = &warning {
            mode.warn("GP", w);
        }

        Ok(SolveResult {
            image: x,
            iterations,
            converged,
            residual_trace,
            cost_trace,
            warning,
        })
    }
}
