//! Diagonal regularization operators.

use super::{check_domain, LinearOperator};
use crate::array::{self, CArray, RArray};
use crate::error::{ReconError, Result};

/// `R = I`
#[derive(Debug, Clone)]
pub struct IdentityOperator {
    dims: Vec<usize>,
    weight: f64,
}

impl IdentityOperator {
    pub fn new(dims: &[usize]) -> Self {
        Self {
            dims: dims.to_vec(),
            weight: 1.0,
        }
    }

    pub fn with_weight(mut self, weight: f64) -> Self {
        self.weight = weight;
        self
    }
}

impl LinearOperator for IdentityOperator {
    fn name(&self) -> &str {
        "identity"
    }

    fn weight(&self) -> f64 {
        self.weight
    }

    fn set_weight(&mut self, weight: f64) {
        self.weight = weight;
    }

    fn domain_dims(&self) -> &[usize] {
        &self.dims
    }

    fn codomain_dims(&self) -> &[usize] {
        &self.dims
    }

    fn apply(&self, x: &CArray) -> Result<CArray> {
        check_domain(self.name(), &self.dims, x)?;
        Ok(x.clone())
    }

    fn apply_adjoint(&self, y: &CArray) -> Result<CArray> {
        check_domain(self.name(), &self.dims, y)?;
        Ok(y.clone())
    }

    fn normal_diagonal(&self) -> Option<RArray> {
        Some(RArray::ones(ndarray::IxDyn(&self.dims)))
    }
}

/// Diagonal operator with `RᴴR = diag(w)`, `w = 1/clamp(|prior|/max|prior|, floor, 1)`.
///
/// Penalises energy where the prior image is dark, which suppresses
/// aliasing outside the object in undersampled dynamic series.
#[derive(Debug, Clone)]
pub struct ImageWeightOperator {
    dims: Vec<usize>,
    normal: RArray,
    sqrt_weights: RArray,
    weight: f64,
}

impl ImageWeightOperator {
    /// Default lower bound on the normalised prior magnitude.
    pub const DEFAULT_FLOOR: f64 = 0.01;

    /// Build from a prior `[nx, ny]` (replicated over `frames`) or `[nx, ny, frames]`.
    pub fn from_prior(prior: &CArray, frames: usize, floor: f64) -> Result<Self> {
        if !(floor > 0.0 && floor <= 1.0) {
            return Err(ReconError::config(format!(
                "image weight floor must be in (0, 1], got {}",
                floor
            )));
        }
        let peak = array::amax(prior);
        if !(peak > 0.0) || !peak.is_finite() {
            return Err(ReconError::data("prior image is empty or not finite"));
        }

        let mut magnitude = array::abs(prior);
        magnitude.mapv_inplace(|v| v / peak);
        array::clamp_inplace(&mut magnitude, floor, 1.0);
        array::reciprocal_inplace(&mut magnitude);

        let normal = match prior.ndim() {
            2 => array::expand(&magnitude, frames),
            3 if prior.shape()[2] == frames => magnitude,
            _ => {
                return Err(ReconError::data(format!(
                    "prior {:?} incompatible with {} frames",
                    prior.shape(),
                    frames
                )))
            }
        };
        Self::from_weights(normal)
    }

    /// Install the diagonal of `RᴴR` directly.
    pub fn from_weights(normal: RArray) -> Result<Self> {
        if normal.iter().any(|w| !w.is_finite() || *w < 0.0) {
            return Err(ReconError::config(
                "image weights must be finite and non-negative",
            ));
        }
        let mut sqrt_weights = normal.clone();
        array::sqrt_inplace(&mut sqrt_weights);

        Ok(Self {
            dims: normal.shape().to_vec(),
            normal,
            sqrt_weights,
            weight: 1.0,
        })
    }

    pub fn with_weight(mut self, weight: f64) -> Self {
        self.weight = weight;
        self
    }
}

impl LinearOperator for ImageWeightOperator {
    fn name(&self) -> &str {
        "image_weight"
    }

    fn weight(&self) -> f64 {
        self.weight
    }

    fn set_weight(&mut self, weight: f64) {
        self.weight = weight;
    }

    fn domain_dims(&self) -> &[usize] {
        &self.dims
    }

    fn codomain_dims(&self) -> &[usize] {
        &self.dims
    }

    fn apply(&self, x: &CArray) -> Result<CArray> {
        check_domain(self.name(), &self.dims, x)?;
        Ok(array::mul_real(x, &self.sqrt_weights))
    }

    fn apply_adjoint(&self, y: &CArray) -> Result<CArray> {
        self.apply(y)
    }

    fn normal_diagonal(&self) -> Option<RArray> {
        Some(self.normal.clone())
    }
}
