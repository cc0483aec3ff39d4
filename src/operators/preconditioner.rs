//! Preconditioners for the iterative solvers.

use super::LinearOperator;
use crate::array::{self, CArray, RArray};
use crate::error::{ReconError, Result};

/// Elementwise transform applied to residuals and gradients.
pub trait Preconditioner {
    /// Refresh internal state from the weighted operators of the current problem.
    fn recompute(&mut self, terms: &[(f64, &dyn LinearOperator)]) -> Result<()>;

    fn apply(&self, x: &CArray) -> Result<CArray>;
}

/// No preconditioning.
#[derive(Debug, Default, Clone, Copy)]
pub struct IdentityPreconditioner;

impl Preconditioner for IdentityPreconditioner {
    fn recompute(&mut self, _terms: &[(f64, &dyn LinearOperator)]) -> Result<()> {
        Ok(())
    }

    fn apply(&self, x: &CArray) -> Result<CArray> {
        Ok(x.clone())
    }
}

/// Split Jacobi preconditioner.
///
/// Holds weights `w = 1/sqrt(Σ wᵢ·diag(AᵢᴴAᵢ))` and applies `w²` elementwise.
/// Weights are recomputed from the problem's operators at the start of every
/// solve. Weights installed with [`set_weights`] replace the computed ones for
/// the next solve only.
///
/// [`set_weights`]: DiagonalPreconditioner::set_weights
#[derive(Debug, Clone)]
pub struct DiagonalPreconditioner {
    dims: Vec<usize>,
    weights: Option<RArray>,
    installed: bool,
    floor: f64,
}

impl DiagonalPreconditioner {
    /// Relative floor applied to the summed diagonal before the reciprocal root.
    pub const DEFAULT_FLOOR: f64 = 1e-6;

    pub fn new(dims: &[usize]) -> Self {
        Self {
            dims: dims.to_vec(),
            weights: None,
            installed: false,
            floor: Self::DEFAULT_FLOOR,
        }
    }

    pub fn with_floor(mut self, floor: f64) -> Self {
        self.floor = floor;
        self
    }

    /// Install explicit weights. The next `recompute` keeps them and clears the
    /// mark, so any later one derives fresh weights from its operators.
    pub fn set_weights(&mut self, weights: RArray) -> Result<()> {
        array::check_dims(&self.dims, weights.shape(), "preconditioner weights")?;
        if weights.iter().any(|w| !w.is_finite() || *w <= 0.0) {
            return Err(ReconError::config(
                "preconditioner weights must be finite and positive",
            ));
        }
        self.weights = Some(weights);
        self.installed = true;
        Ok(())
    }

    pub fn weights(&self) -> Option<&RArray> {
        self.weights.as_ref()
    }
}

impl Preconditioner for DiagonalPreconditioner {
    fn recompute(&mut self, terms: &[(f64, &dyn LinearOperator)]) -> Result<()> {
        if std::mem::take(&mut self.installed) {
            tracing::trace!("Using installed preconditioner weights for this solve");
            return Ok(());
        }

        let mut diag = array::create_real(&self.dims);
        let mut any = false;
        for (weight, op) in terms {
            if *weight <= 0.0 {
                continue;
            }
            if let Some(d) = op.normal_diagonal() {
                array::check_dims(&self.dims, d.shape(), op.name())?;
                diag.zip_mut_with(&d, |acc, v| *acc += weight * v);
                any = true;
            }
        }

        let weights = if any {
            let peak = diag.iter().cloned().fold(0.0, f64::max);
            if !(peak > 0.0) || !peak.is_finite() {
                return Err(ReconError::data("normal-operator diagonal is zero or not finite"));
            }
            let floor = self.floor * peak;
            diag.mapv_inplace(|v| v.max(floor));
            array::reciprocal_sqrt_inplace(&mut diag);
            diag
        } else {
            RArray::ones(ndarray::IxDyn(&self.dims))
        };

        tracing::trace!("Recomputed preconditioner over {} terms", terms.len());
        self.weights = Some(weights);
        Ok(())
    }

    fn apply(&self, x: &CArray) -> Result<CArray> {
        let weights = self
            .weights
            .as_ref()
            .ok_or_else(|| ReconError::config("preconditioner weights not computed"))?;
        array::check_dims(&self.dims, x.shape(), "preconditioner input")?;
        let mut out = x.clone();
        out.zip_mut_with(weights, |v, w| *v *= w * w);
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::super::{IdentityOperator, ImageWeightOperator};
    use super::*;
    use crate::array::Complex64;
    use ndarray::IxDyn;

    #[test]
    fn test_recompute_from_weighted_diagonals() {
        let dims = [2, 1, 1];
        let a = IdentityOperator::new(&dims);
        let prior = CArray::from_shape_vec(
            IxDyn(&[2, 1]),
            vec![Complex64::new(1.0, 0.0), Complex64::new(0.5, 0.0)],
        )
        .unwrap();
        let r = ImageWeightOperator::from_prior(&prior, 1, 0.01).unwrap();

        let mut m = DiagonalPreconditioner::new(&dims);
        // diag = 3·1 + 0.5·[1, 2] = [3.5, 4]
        m.recompute(&[(3.0, &a as &dyn LinearOperator), (0.5, &r as &dyn LinearOperator)])
            .unwrap();
        let w = m.weights().unwrap();
        assert!((w[[0, 0, 0]] - 1.0 / 3.5f64.sqrt()).abs() < 1e-12);
        assert!((w[[1, 0, 0]] - 0.5).abs() < 1e-12);

        let x = CArray::from_elem(IxDyn(&dims), Complex64::new(4.0, 0.0));
        let z = m.apply(&x).unwrap();
        assert!((z[[1, 0, 0]].re - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_apply_before_recompute_fails() {
        let m = DiagonalPreconditioner::new(&[2]);
        assert!(m.apply(&array::create(&[2])).is_err());
    }

    #[test]
    fn test_weights_track_changed_operator() {
        let dims = [2];
        let mut m = DiagonalPreconditioner::new(&dims);
        m.set_weights(RArray::from_elem(IxDyn(&dims), 2.0)).unwrap();

        // installed weights serve the first solve
        let a = IdentityOperator::new(&dims);
        m.recompute(&[(1.0, &a as &dyn LinearOperator)]).unwrap();
        assert!(m.weights().unwrap().iter().all(|w| *w == 2.0));

        // later solves follow the operator: diag = 4 -> w = 0.5
        m.recompute(&[(4.0, &a as &dyn LinearOperator)]).unwrap();
        assert!(m.weights().unwrap().iter().all(|w| (*w - 0.5).abs() < 1e-12));

        // diag = 0.25 -> w = 2
        m.recompute(&[(0.25, &a as &dyn LinearOperator)]).unwrap();
        assert!(m.weights().unwrap().iter().all(|w| (*w - 2.0).abs() < 1e-12));
    }

    #[test]
    fn test_invalid_weights_rejected() {
        let mut m = DiagonalPreconditioner::new(&[2]);
        let bad = RArray::from_shape_vec(IxDyn(&[2]), vec![1.0, f64::NAN]).unwrap();
        assert!(m.set_weights(bad).is_err());
        assert!(m.set_weights(RArray::ones(IxDyn(&[3]))).is_err());
    }
}
