//! Preconditioned conjugate gradient on the normal equations.
//!
//! The iteration uses the conjugate-residual recurrence: each step minimises
//! the preconditioned residual norm `sqrt(rᴴ M⁻¹ r)` over the Krylov space, so
//! the recorded residual trace never increases. With no preconditioner that
//! norm is plain `‖r‖₂`.

use super::{ConvergenceWarning, SolveResult, Solver, SolverSettings};
use crate::array::{self, CArray};
use crate::error::{ReconError, Result};
use crate::operators::{LinearOperator, Preconditioner};

pub struct CgSolver<'a> {
    settings: SolverSettings,
    encoding: Option<Box<dyn LinearOperator + 'a>>,
    regularization: Vec<Box<dyn LinearOperator + 'a>>,
    preconditioner: Option<Box<dyn Preconditioner + 'a>>,
    x0: Option<CArray>,
}

impl<'a> CgSolver<'a> {
    pub fn new(settings: SolverSettings) -> Self {
        Self {
            settings,
            encoding: None,
            regularization: Vec::new(),
            preconditioner: None,
            x0: None,
        }
    }

    pub fn set_encoding_operator(&mut self, op: Box<dyn LinearOperator + 'a>) {
        self.encoding = Some(op);
    }

    pub fn add_regularization_operator(&mut self, op: Box<dyn LinearOperator + 'a>) {
        self.regularization.push(op);
    }

    pub fn set_preconditioner(&mut self, precond: Box<dyn Preconditioner + 'a>) {
        self.preconditioner = Some(precond);
    }

    /// Initial estimate; the solve starts from zero otherwise.
    pub fn set_x0(&mut self, x0: CArray) {
        self.x0 = Some(x0);
    }

    pub fn regularization_count(&self) -> usize {
        self.regularization.len()
    }
}

/// `(w_E EᴴE + Σ wᵢ RᵢᴴRᵢ) x`
fn apply_system(
    encoding: &dyn LinearOperator,
    regularization: &[Box<dyn LinearOperator + '_>],
    x: &CArray,
) -> Result<CArray> {
    let mut out = encoding.apply_normal(x)?;
    array::scale_inplace(&mut out, encoding.weight());
    for op in regularization {
        array::axpy(op.weight(), &op.apply_normal(x)?, &mut out);
    }
    Ok(out)
}

impl Solver for CgSolver<'_> {
    fn settings(&self) -> &SolverSettings {
        &self.settings
    }

    fn solve(&mut self, b: &CArray) -> Result<SolveResult> {
        self.settings.validate()?;
        let encoding = self
            .encoding
            .as_deref()
            .ok_or_else(|| ReconError::config("CG solver has no encoding operator"))?;
        let dims = encoding.domain_dims().to_vec();
        for op in &self.regularization {
            array::check_dims(&dims, op.domain_dims(), op.name())?;
        }
        array::check_dims(encoding.codomain_dims(), b.shape(), "CG right-hand side")?;

        if let Some(precond) = self.preconditioner.as_mut() {
            let mut terms: Vec<(f64, &dyn LinearOperator)> = vec![(encoding.weight(), encoding)];
            terms.extend(
                self.regularization
                    .iter()
                    .map(|op| (op.weight(), op.as_ref() as &dyn LinearOperator)),
            );
            precond.recompute(&terms)?;
        }
        let precondition = |r: &CArray| -> Result<CArray> {
            match self.preconditioner.as_deref() {
                Some(m) => m.apply(r),
                None => Ok(r.clone()),
            }
        };

        let mut rhs = encoding.apply_adjoint(b)?;
        array::scale_inplace(&mut rhs, encoding.weight());

        let (mut x, mut r) = match &self.x0 {
            Some(x0) => {
                array::check_dims(&dims, x0.shape(), "CG initial estimate")?;
                let mut r = rhs;
                array::axpy(-1.0, &apply_system(encoding, &self.regularization, x0)?, &mut r);
                (x0.clone(), r)
            }
            None => (array::create(&dims), rhs),
        };

        if array::nrm2(&r) == 0.0 {
            tracing::debug!("CG: initial residual is zero");
            return Ok(SolveResult {
                image: x,
                iterations: 0,
                converged: true,
                residual_trace: vec![0.0],
                cost_trace: Vec::new(),
                warning: None,
            });
        }

        let mode = self.settings.output_mode;
        let tolerance = self.settings.tolerance;
        let mut z = precondition(&r)?;
        let r0 = array::dot(&r, &z).re.max(0.0).sqrt();
        if !(r0 > 0.0) || !r0.is_finite() {
            return Err(ReconError::data(format!(
                "preconditioned initial residual is {}",
                r0
            )));
        }

        // p: search direction, q = A p, w = A z
        let mut w = apply_system(encoding, &self.regularization, &z)?;
        let mut p = z.clone();
        let mut q = w.clone();
        let mut zw = array::dot(&z, &w).re;
        let mut trace = vec![1.0];
        let mut iterations = 0;
        let mut converged = false;

        for iteration in 1..=self.settings.max_iterations {
            let s = precondition(&q)?;
            let qs = array::dot(&q, &s).re;
            if !(zw > 0.0) || !(qs > 0.0) || !qs.is_finite() {
                tracing::warn!(
                    "CG breakdown at iteration {}: <z, Az> = {}, <Ap, M⁻¹Ap> = {}",
                    iteration,
                    zw,
                    qs
                );
                break;
            }

            let alpha = zw / qs;
            array::axpy(alpha, &p, &mut x);
            array::axpy(-alpha, &q, &mut r);
            iterations = iteration;

            z = precondition(&r)?;
            let relative = array::dot(&r, &z).re.max(0.0).sqrt() / r0;
            trace.push(relative);
            mode.iteration("CG", iteration, relative);
            if relative < tolerance {
                converged = true;
                break;
            }

            w = apply_system(encoding, &self.regularization, &z)?;
            let zw_next = array::dot(&z, &w).re;
            let beta = zw_next / zw;
            zw = zw_next;
            array::xpby(&z, beta, &mut p);
            array::xpby(&w, beta, &mut q);
        }

        let warning = (!converged).then(|| ConvergenceWarning {
            iterations,
            residual: trace.last().copied().unwrap_or(1.0),
            tolerance,
        });
        if let Some(w) = &warning {
            mode.warn("CG", w);
        }

        Ok(SolveResult {
            image: x,
            iterations,
            converged,
            residual_trace: trace,
            cost_trace: Vec::new(),
            warning,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::array::{Complex64, RArray};
    use crate::operators::{DiagonalPreconditioner, IdentityOperator, ImageWeightOperator};
    use crate::solvers::OutputMode;
    use ndarray::IxDyn;

    const DIMS: [usize; 3] = [3, 2, 1];

    fn diag() -> RArray {
        RArray::from_shape_vec(IxDyn(&DIMS), vec![0.5, 1.0, 2.0, 4.0, 8.0, 0.0]).unwrap()
    }

    fn rhs() -> CArray {
        let mut b = array::create(&DIMS);
        for (i, v) in b.iter_mut().enumerate() {
            *v = Complex64::new(i as f64 + 1.0, 1.0 - i as f64);
        }
        b
    }

    fn settings(max_iterations: usize) -> SolverSettings {
        SolverSettings {
            max_iterations,
            tolerance: 1e-10,
            output_mode: OutputMode::Silent,
        }
    }

    fn solver<'a>(max_iterations: usize) -> CgSolver<'a> {
        let mut cg = CgSolver::new(settings(max_iterations));
        cg.set_encoding_operator(Box::new(IdentityOperator::new(&DIMS)));
        cg.add_regularization_operator(Box::new(
            ImageWeightOperator::from_weights(diag()).unwrap(),
        ));
        cg
    }

    fn exact() -> CArray {
        let d = diag();
        let mut x = rhs();
        x.zip_mut_with(&d, |v, d| *v /= 1.0 + d);
        x
    }

    #[test]
    fn test_converges_on_identity_plus_diagonal() {
        let result = solver(50).solve(&rhs()).unwrap();
        assert!(result.converged);
        assert!(result.warning.is_none());
        let mut err = result.image.clone();
        array::axpy(-1.0, &exact(), &mut err);
        assert!(array::nrm2(&err) < 1e-6);
        assert_eq!(result.residual_trace[0], 1.0);
    }

    #[test]
    fn test_jacobi_preconditioner_solves_diagonal_system_in_one_step() {
        let mut cg = solver(5);
        cg.set_preconditioner(Box::new(DiagonalPreconditioner::new(&DIMS)));
        let result = cg.solve(&rhs()).unwrap();
        assert!(result.converged);
        assert_eq!(result.iterations, 1);
    }

    #[test]
    fn test_partial_result_is_flagged() {
        let result = solver(1).solve(&rhs()).unwrap();
        assert!(!result.converged);
        let warning = result.warning.unwrap();
        assert_eq!(warning.iterations, 1);
        assert!(warning.residual > 1e-10);
    }

    #[test]
    fn test_exact_x0_returns_immediately() {
        let mut cg = CgSolver::new(settings(10));
        cg.set_encoding_operator(Box::new(IdentityOperator::new(&DIMS)));
        cg.set_x0(rhs());
        let result = cg.solve(&rhs()).unwrap();
        assert!(result.converged);
        assert_eq!(result.iterations, 0);
        assert_eq!(result.image, rhs());
    }

    #[test]
    fn test_regularizer_domain_mismatch() {
        let mut cg = solver(10);
        cg.add_regularization_operator(Box::new(IdentityOperator::new(&[3, 2, 2])));
        let err = cg.solve(&rhs()).unwrap_err();
        assert!(matches!(err, ReconError::Configuration(_)));
    }

    #[test]
    fn test_missing_encoding() {
        let mut cg = CgSolver::new(settings(10));
        assert!(cg.solve(&rhs()).is_err());
    }

    #[test]
    fn test_weights_scale_system() {
        // 2·I x = 2·b  =>  x = b
        let mut cg = CgSolver::new(settings(10));
        cg.set_encoding_operator(Box::new(IdentityOperator::new(&DIMS).with_weight(2.0)));
        let result = cg.solve(&rhs()).unwrap();
        let mut err = result.image;
        array::axpy(-1.0, &rhs(), &mut err);
        assert!(array::nrm2(&err) < 1e-12);
    }
}
