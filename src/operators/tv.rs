//! Total variation penalties.
//!
//! `TV(x) = Σ_p sqrt(Σ_d |D_d x|_p² + ε²)` with periodic forward differences
//! `D_d` along every axis longer than one (spatial axes and, for dynamic
//! series, the frame axis). The ε term makes the penalty differentiable;
//! the gradient is `Σ_d D_dᴴ(D_d x / m)` with `m` the smoothed magnitude.

use super::{check_domain, NonlinearOperator};
use crate::array::{self, CArray, RArray};
use crate::error::{ReconError, Result};
use ndarray::{concatenate, Axis, Slice};
use std::borrow::Cow;

/// `y[i] = x[i + 1]` (periodic)
fn shift_forward(x: &CArray, axis: usize) -> Result<CArray> {
    let ax = Axis(axis);
    Ok(concatenate(
        ax,
        &[
            x.slice_axis(ax, Slice::from(1..)),
            x.slice_axis(ax, Slice::from(..1)),
        ],
    )?)
}

/// `y[i] = x[i - 1]` (periodic)
fn shift_backward(x: &CArray, axis: usize) -> Result<CArray> {
    let ax = Axis(axis);
    let n = x.len_of(ax) as isize;
    Ok(concatenate(
        ax,
        &[
            x.slice_axis(ax, Slice::from(n - 1..)),
            x.slice_axis(ax, Slice::from(..n - 1)),
        ],
    )?)
}

#[derive(Debug, Clone)]
pub struct TvOperator {
    dims: Vec<usize>,
    epsilon: f64,
    weight: f64,
}

impl TvOperator {
    pub const DEFAULT_EPSILON: f64 = 1e-6;

    pub fn new(dims: &[usize]) -> Self {
        Self {
            dims: dims.to_vec(),
            epsilon: Self::DEFAULT_EPSILON,
            weight: 1.0,
        }
    }

    pub fn with_epsilon(mut self, epsilon: f64) -> Self {
        self.epsilon = epsilon;
        self
    }

    pub fn with_weight(mut self, weight: f64) -> Self {
        self.weight = weight;
        self
    }

    fn axes(&self) -> impl Iterator<Item = usize> + '_ {
        self.dims
            .iter()
            .enumerate()
            .filter(|(_, n)| **n > 1)
            .map(|(axis, _)| axis)
    }

    /// Differences along every active axis plus the smoothed magnitude.
    fn differences(&self, x: &CArray) -> Result<(Vec<(usize, CArray)>, RArray)> {
        let mut diffs = Vec::new();
        let mut magnitude = RArray::from_elem(x.raw_dim(), self.epsilon * self.epsilon);
        for axis in self.axes() {
            let d = shift_forward(x, axis)? - x;
            magnitude.zip_mut_with(&d, |m, v| *m += v.norm_sqr());
            diffs.push((axis, d));
        }
        Ok((diffs, magnitude))
    }

    fn tv_cost(&self, x: &CArray) -> Result<f64> {
        let (_, magnitude) = self.differences(x)?;
        Ok(magnitude.iter().map(|m| m.sqrt()).sum())
    }

    fn tv_gradient(&self, x: &CArray) -> Result<CArray> {
        let (diffs, magnitude) = self.differences(x)?;
        let mut grad = array::create(x.shape());
        for (axis, mut d) in diffs {
            d.zip_mut_with(&magnitude, |v, m| *v /= m.sqrt());
            // D_dᴴ v = v[i - 1] - v[i]
            grad += &(shift_backward(&d, axis)? - &d);
        }
        Ok(grad)
    }
}

impl NonlinearOperator for TvOperator {
    fn name(&self) -> &str {
        "tv"
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

    fn cost(&self, x: &CArray) -> Result<f64> {
        check_domain(self.name(), &self.dims, x)?;
        self.tv_cost(x)
    }

    fn gradient(&self, x: &CArray) -> Result<CArray> {
        check_domain(self.name(), &self.dims, x)?;
        self.tv_gradient(x)
    }
}

/// Prior-image-constrained TV: `TV(x - prior)`.
#[derive(Debug, Clone)]
pub struct TvPicsOperator<'a> {
    tv: TvOperator,
    prior: Option<Cow<'a, CArray>>,
}

impl<'a> TvPicsOperator<'a> {
    pub fn new(dims: &[usize]) -> Self {
        Self {
            tv: TvOperator::new(dims),
            prior: None,
        }
    }

    pub fn with_epsilon(mut self, epsilon: f64) -> Self {
        self.tv = self.tv.with_epsilon(epsilon);
        self
    }

    pub fn with_weight(mut self, weight: f64) -> Self {
        self.tv = self.tv.with_weight(weight);
        self
    }

    /// Install the prior. A single-frame prior `[nx, ny]` is replicated over frames.
    pub fn set_prior(&mut self, prior: &'a CArray) -> Result<()> {
        let dims = self.tv.domain_dims();
        let prior = if prior.shape() == dims {
            Cow::Borrowed(prior)
        } else if dims.len() == 3 && prior.shape() == &dims[..2] {
            Cow::Owned(array::expand(prior, dims[2]))
        } else {
            return Err(ReconError::config(format!(
                "prior {:?} does not match domain {:?}",
                prior.shape(),
                dims
            )));
        };
        self.prior = Some(prior);
        Ok(())
    }

    fn difference(&self, x: &CArray) -> Result<CArray> {
        check_domain(self.name(), self.tv.domain_dims(), x)?;
        let prior = self
            .prior
            .as_ref()
            .ok_or_else(|| ReconError::config("TV-PICS operator has no prior image"))?;
        Ok(x - &**prior)
    }
}

impl NonlinearOperator for TvPicsOperator<'_> {
    fn name(&self) -> &str {
        "tv_pics"
    }

    fn weight(&self) -> f64 {
        self.tv.weight()
    }

    fn set_weight(&mut self, weight: f64) {
        self.tv.set_weight(weight);
    }

    fn domain_dims(&self) -> &[usize] {
        self.tv.domain_dims()
    }

    fn cost(&self, x: &CArray) -> Result<f64> {
        self.tv.tv_cost(&self.difference(x)?)
    }

    fn gradient(&self, x: &CArray) -> Result<CArray> {
        self.tv.tv_gradient(&self.difference(x)?)
    }
}
