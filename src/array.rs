//! Array service
//!
//! Thin layer over `ndarray::ArrayD` providing the operations the solver
//! framework relies on: creation, complex inner products and norms, axpy
//! updates, reductions (`sum`, `amax`) and elementwise transforms (`abs`,
//! `sqrt`, `reciprocal`, `clamp`). Functions ending in `_inplace` mutate
//! their argument; the others allocate a new array.
//!
//! All inner products use the conjugate-linear convention
//! `⟨a, b⟩ = Σ conj(aᵢ)·bᵢ`.

use crate::error::{ReconError, Result};
use ndarray::{ArrayD, Axis, IxDyn, Zip};

pub use rustfft::num_complex::Complex64;

/// Complex N-dimensional array (images, samples, coil maps).
pub type CArray = ArrayD<Complex64>;

/// Real N-dimensional array (weights, trajectories, norms).
pub type RArray = ArrayD<f64>;

/// Create a zero-filled complex array with the given extents.
pub fn create(dims: &[usize]) -> CArray {
    CArray::zeros(IxDyn(dims))
}

/// Create a zero-filled real array with the given extents.
pub fn create_real(dims: &[usize]) -> RArray {
    RArray::zeros(IxDyn(dims))
}

/// Fail with a configuration error unless `actual` matches `expected`.
pub fn check_dims(expected: &[usize], actual: &[usize], what: &str) -> Result<()> {
    if expected != actual {
        return Err(ReconError::Configuration(format!(
            "{}: expected dimensions {:?}, got {:?}",
            what, expected, actual
        )));
    }
    Ok(())
}

/// Conjugate inner product `Σ conj(aᵢ)·bᵢ`.
pub fn dot(a: &CArray, b: &CArray) -> Complex64 {
    debug_assert_eq!(a.shape(), b.shape());
    a.iter()
        .zip(b.iter())
        .fold(Complex64::new(0.0, 0.0), |acc, (x, y)| acc + x.conj() * y)
}

/// Euclidean norm.
pub fn nrm2(a: &CArray) -> f64 {
    a.iter().map(|v| v.norm_sqr()).sum::<f64>().sqrt()
}

/// `y += alpha·x`
pub fn axpy(alpha: f64, x: &CArray, y: &mut CArray) {
    debug_assert_eq!(x.shape(), y.shape());
    Zip::from(y).and(x).for_each(|y, &x| *y += x * alpha);
}

/// `y = x + beta·y`
pub fn xpby(x: &CArray, beta: f64, y: &mut CArray) {
    debug_assert_eq!(x.shape(), y.shape());
    Zip::from(y).and(x).for_each(|y, &x| *y = x + *y * beta);
}

/// Scale every element in place.
pub fn scale_inplace(a: &mut CArray, factor: f64) {
    a.mapv_inplace(|v| v * factor);
}

/// Elementwise magnitude.
pub fn abs(a: &CArray) -> RArray {
    a.mapv(|v| v.norm())
}

/// Elementwise squared magnitude.
pub fn abs_square(a: &CArray) -> RArray {
    a.mapv(|v| v.norm_sqr())
}

/// Largest magnitude in the array (0 for empty arrays).
pub fn amax(a: &CArray) -> f64 {
    a.iter().map(|v| v.norm()).fold(0.0, f64::max)
}

/// Sum over the last axis, dropping it.
pub fn sum_last_axis(a: &RArray) -> RArray {
    let last = a.ndim().saturating_sub(1);
    a.sum_axis(Axis(last))
}

/// Mean over the last axis, dropping it.
pub fn mean_last_axis(a: &CArray) -> CArray {
    let last = a.ndim().saturating_sub(1);
    let n = a.shape()[last].max(1) as f64;
    a.sum_axis(Axis(last)).mapv(|v| v / n)
}

pub fn sqrt_inplace(a: &mut RArray) {
    a.mapv_inplace(f64::sqrt);
}

pub fn reciprocal(a: &RArray) -> RArray {
    a.mapv(|v| 1.0 / v)
}

pub fn reciprocal_inplace(a: &mut RArray) {
    a.mapv_inplace(|v| 1.0 / v);
}

/// `a ← 1/sqrt(a)`
pub fn reciprocal_sqrt_inplace(a: &mut RArray) {
    a.mapv_inplace(|v| 1.0 / v.sqrt());
}

pub fn clamp_inplace(a: &mut RArray, min: f64, max: f64) {
    a.mapv_inplace(|v| v.clamp(min, max));
}

/// Promote a real array to complex with zero imaginary part.
pub fn real_to_complex(a: &RArray) -> CArray {
    a.mapv(|v| Complex64::new(v, 0.0))
}

/// Elementwise product of a complex array with a real array of the same shape.
pub fn mul_real(x: &CArray, w: &RArray) -> CArray {
    debug_assert_eq!(x.shape(), w.shape());
    let mut out = x.clone();
    Zip::from(&mut out).and(w).for_each(|o, &w| *o *= w);
    out
}

/// Append a trailing axis of length `n`, replicating `a` along it.
pub fn expand<T: Clone + Default>(a: &ArrayD<T>, n: usize) -> ArrayD<T> {
    let mut dims = a.shape().to_vec();
    dims.push(n);
    let last = dims.len() - 1;
    let mut out = ArrayD::from_elem(IxDyn(&dims), T::default());
    for mut slice in out.axis_iter_mut(Axis(last)) {
        slice.assign(a);
    }
    out
}

/// True when every element is finite.
pub fn all_finite(a: &CArray) -> bool {
    a.iter().all(|v| v.re.is_finite() && v.im.is_finite())
}
