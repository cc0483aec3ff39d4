//! Coil sensitivity map providers.
//!
//! The accumulator asks a provider for maps `[nx, ny, channels]` once a job's
//! samples are complete. Estimation quality is not the concern here; any
//! provider that returns maps of the right shape can be plugged in.

use super::transform::{
    extract_centred, CartesianTransform, ConvolutionDirection, NufftTransform, TransformDirection,
};
use crate::array::{self, CArray, Complex64, RArray};
use crate::error::{ReconError, Result};
use ndarray::{Axis, IxDyn, Zip};

pub trait CsmProvider: Send {
    fn name(&self) -> &str;

    fn estimate(
        &self,
        samples: &CArray,
        trajectory: &RArray,
        dcw: &RArray,
        matrix_size: usize,
        frames: usize,
    ) -> Result<CArray>;
}

fn channels_of(samples: &CArray) -> Result<usize> {
    match samples.shape() {
        [_, c] if *c > 0 => Ok(*c),
        other => Err(ReconError::data(format!(
            "samples must be [samples, channels], got {:?}",
            other
        ))),
    }
}

/// Flat maps `1/sqrt(channels)`, so that `Σ|csm|² = 1`.
#[derive(Debug, Default, Clone, Copy)]
pub struct UniformCsm;

impl CsmProvider for UniformCsm {
    fn name(&self) -> &str {
        "uniform"
    }

    fn estimate(
        &self,
        samples: &CArray,
        _trajectory: &RArray,
        _dcw: &RArray,
        matrix_size: usize,
        _frames: usize,
    ) -> Result<CArray> {
        let channels = channels_of(samples)?;
        Ok(CArray::from_elem(
            IxDyn(&[matrix_size, matrix_size, channels]),
            Complex64::new(1.0 / (channels as f64).sqrt(), 0.0),
        ))
    }
}

/// Maps supplied up front (e.g. from a reference scan).
#[derive(Debug, Clone)]
pub struct FixedCsm {
    maps: CArray,
}

impl FixedCsm {
    pub fn new(maps: CArray) -> Self {
        Self { maps }
    }
}

impl CsmProvider for FixedCsm {
    fn name(&self) -> &str {
        "fixed"
    }

    fn estimate(
        &self,
        samples: &CArray,
        _trajectory: &RArray,
        _dcw: &RArray,
        matrix_size: usize,
        _frames: usize,
    ) -> Result<CArray> {
        let expected = [matrix_size, matrix_size, channels_of(samples)?];
        if self.maps.shape() != expected {
            return Err(ReconError::data(format!(
                "fixed coil maps {:?} do not match {:?}",
                self.maps.shape(),
                expected
            )));
        }
        Ok(self.maps.clone())
    }
}

/// Coil images from the frame-averaged gridded data, normalised by their
/// root sum of squares.
#[derive(Debug, Clone)]
pub struct RssCsmEstimator {
    floor: f64,
}

impl Default for RssCsmEstimator {
    fn default() -> Self {
        Self { floor: 1e-3 }
    }
}

impl RssCsmEstimator {
    pub fn new(floor: f64) -> Self {
        Self { floor }
    }
}

impl CsmProvider for RssCsmEstimator {
    fn name(&self) -> &str {
        "rss"
    }

    fn estimate(
        &self,
        samples: &CArray,
        trajectory: &RArray,
        dcw: &RArray,
        matrix_size: usize,
        frames: usize,
    ) -> Result<CArray> {
        let channels = channels_of(samples)?;
        let n = matrix_size;

        let mut transform = CartesianTransform::new();
        transform.setup(&[n, n], &[n, n], 1.0)?;
        transform.preprocess(trajectory, frames)?;

        let mut grid = array::create(&[n, n, frames, channels]);
        let mut data = samples.clone();
        transform.convolve(&mut data, &mut grid, dcw, ConvolutionDirection::NC2C)?;
        transform.fft(&mut grid, TransformDirection::Inverse)?;

        let coil_images = extract_centred(&grid, n, n)
            .sum_axis(Axis(2))
            .mapv(|v| v / frames as f64);
        let rss = array::sum_last_axis(&array::abs_square(&coil_images)).mapv(f64::sqrt);
        let peak = rss.iter().cloned().fold(0.0, f64::max);
        if !(peak > 0.0) {
            return Err(ReconError::data("cannot estimate coil maps from empty data"));
        }
        let floor = self.floor * peak;

        let mut maps = coil_images;
        for mut coil in maps.axis_iter_mut(Axis(2)) {
            Zip::from(&mut coil)
                .and(&rss)
                .for_each(|m, &r| *m /= r.max(floor));
        }
        Ok(maps)
    }
}
