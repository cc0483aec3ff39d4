//! Linear and nonlinear operators of the reconstruction problem.
//!
//! Operators borrow their large arrays (coil maps, priors) from the
//! [`ReconJob`](crate::job::ReconJob) they were built for, so they carry the
//! job's lifetime and are dropped before it.
//!
//! Weights are stored on each operator but applied by whoever combines them
//! ([`OperatorSum`], the solvers and the preconditioner); `apply` and
//! `apply_adjoint` are always unweighted.

pub mod csm;
pub mod encoding;
pub mod gridding;
pub mod identity;
pub mod preconditioner;
pub mod transform;
pub mod tv;

pub use csm::{CsmProvider, FixedCsm, RssCsmEstimator, UniformCsm};
pub use encoding::SenseEncoding;
pub use gridding::{KaiserBessel, KaiserBesselTransform};
pub use identity::{IdentityOperator, ImageWeightOperator};
pub use preconditioner::{DiagonalPreconditioner, IdentityPreconditioner, Preconditioner};
pub use transform::{
    for_oversampling, CartesianTransform, ConvolutionDirection, NufftTransform, TransformDirection,
};
pub use tv::{TvOperator, TvPicsOperator};

use crate::array::{self, CArray, RArray};
use crate::error::{ReconError, Result};

/// A linear map between complex arrays and its adjoint.
pub trait LinearOperator {
    fn name(&self) -> &str;

    fn weight(&self) -> f64;

    fn set_weight(&mut self, weight: f64);

    fn domain_dims(&self) -> &[usize];

    fn codomain_dims(&self) -> &[usize];

    fn apply(&self, x: &CArray) -> Result<CArray>;

    fn apply_adjoint(&self, y: &CArray) -> Result<CArray>;

    /// `AᴴA x`
    fn apply_normal(&self, x: &CArray) -> Result<CArray> {
        let y = self.apply(x)?;
        self.apply_adjoint(&y)
    }

    /// Diagonal of `AᴴA`, when cheaply available.
    fn normal_diagonal(&self) -> Option<RArray> {
        None
    }
}

/// A differentiable (or sub-differentiable) penalty `Φ(x)`.
pub trait NonlinearOperator {
    fn name(&self) -> &str;

    fn weight(&self) -> f64;

    fn set_weight(&mut self, weight: f64);

    fn domain_dims(&self) -> &[usize];

    /// Unweighted `Φ(x)`.
    fn cost(&self, x: &CArray) -> Result<f64>;

    /// Unweighted (sub-)gradient of `Φ` at `x`.
    fn gradient(&self, x: &CArray) -> Result<CArray>;
}

pub(crate) fn check_domain(name: &str, expected: &[usize], x: &CArray) -> Result<()> {
    array::check_dims(expected, x.shape(), &format!("{} domain", name))
}

/// Weighted sum `Σ wᵢ·Aᵢ` of operators sharing one domain.
pub struct OperatorSum<'a> {
    domain: Vec<usize>,
    operators: Vec<Box<dyn LinearOperator + 'a>>,
    weight: f64,
}

impl<'a> OperatorSum<'a> {
    pub fn new(domain: &[usize]) -> Self {
        Self {
            domain: domain.to_vec(),
            operators: Vec::new(),
            weight: 1.0,
        }
    }

    /// Add a component. Its domain must match the sum's domain.
    pub fn push(&mut self, op: Box<dyn LinearOperator + 'a>) -> Result<()> {
        if op.domain_dims() != self.domain.as_slice() {
            return Err(ReconError::config(format!(
                "operator '{}' has domain {:?}, expected {:?}",
                op.name(),
                op.domain_dims(),
                self.domain
            )));
        }
        self.operators.push(op);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.operators.len()
    }

    pub fn is_empty(&self) -> bool {
        self.operators.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &(dyn LinearOperator + 'a)> {
        self.operators.iter().map(|op| op.as_ref())
    }

    fn common_codomain(&self) -> Result<&[usize]> {
        let first = self
            .operators
            .first()
            .ok_or_else(|| ReconError::config("operator sum has no components"))?;
        let codomain = first.codomain_dims();
        if let Some(op) = self.operators.iter().find(|op| op.codomain_dims() != codomain) {
            return Err(ReconError::config(format!(
                "operator '{}' codomain {:?} differs from {:?}",
                op.name(),
                op.codomain_dims(),
                codomain
            )));
        }
        Ok(codomain)
    }
}

impl LinearOperator for OperatorSum<'_> {
    fn name(&self) -> &str {
        "sum"
    }

    fn weight(&self) -> f64 {
        self.weight
    }

    fn set_weight(&mut self, weight: f64) {
        self.weight = weight;
    }

    fn domain_dims(&self) -> &[usize] {
        &self.domain
    }

    /// Codomain of the first component (empty when the sum is empty).
    fn codomain_dims(&self) -> &[usize] {
        self.operators
            .first()
            .map(|op| op.codomain_dims())
            .unwrap_or(&[])
    }

    fn apply(&self, x: &CArray) -> Result<CArray> {
        check_domain(self.name(), &self.domain, x)?;
        let codomain = self.common_codomain()?;
        let mut out = array::create(codomain);
        for op in &self.operators {
            array::axpy(op.weight(), &op.apply(x)?, &mut out);
        }
        Ok(out)
    }

    fn apply_adjoint(&self, y: &CArray) -> Result<CArray> {
        let codomain = self.common_codomain()?;
        array::check_dims(codomain, y.shape(), "sum codomain")?;
        let mut out = array::create(&self.domain);
        for op in &self.operators {
            array::axpy(op.weight(), &op.apply_adjoint(y)?, &mut out);
        }
        Ok(out)
    }

    /// `Σ wᵢ AᵢᴴAᵢ x`; components may have different codomains here.
    fn apply_normal(&self, x: &CArray) -> Result<CArray> {
        check_domain(self.name(), &self.domain, x)?;
        let mut out = array::create(&self.domain);
        for op in &self.operators {
            array::axpy(op.weight(), &op.apply_normal(x)?, &mut out);
        }
        Ok(out)
    }

    fn normal_diagonal(&self) -> Option<RArray> {
        let mut out = array::create_real(&self.domain);
        for op in &self.operators {
            let diag = op.normal_diagonal()?;
            out.zip_mut_with(&diag, |o, d| *o += op.weight() * d);
        }
        Some(out)
    }
}
