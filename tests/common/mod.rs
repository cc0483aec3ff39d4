//! Common test utilities and helpers

#![allow(dead_code)] // Test utilities may not all be used in every test file

pub mod builders;
pub mod mock_helpers;

use recon_rs::array::CArray;

/// Assert two floats are approximately equal
pub fn assert_float_eq(a: f64, b: f64, epsilon: f64) {
    assert!(
        (a - b).abs() < epsilon,
        "Expected {} to be approximately equal to {} (epsilon: {})",
        a,
        b,
        epsilon
    );
}

/// `‖a − b‖ / ‖b‖`
pub fn relative_error(a: &CArray, b: &CArray) -> f64 {
    assert_eq!(a.shape(), b.shape(), "shape mismatch");
    let diff: f64 = a.iter().zip(b.iter()).map(|(x, y)| (x - y).norm_sqr()).sum();
    let norm: f64 = b.iter().map(|y| y.norm_sqr()).sum();
    (diff / norm.max(f64::MIN_POSITIVE)).sqrt()
}
