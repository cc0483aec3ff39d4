//! Reconstruction jobs.
//!
//! A `ReconJob` is the unit handed from the accumulator to a solver stage.
//! It owns every large array of one reconstruction; operators built for the
//! solve borrow from it and must be dropped before the job is released.
//!
//! Layout:
//! - samples `[samples, channels]`, frames are contiguous blocks of samples
//! - trajectory `[samples, 2]`, normalised to `[-0.5, 0.5)`
//! - density weights `[samples]`
//! - coil maps `[nx, ny, channels]`
//! - prior `[nx, ny]` or `[nx, ny, frames]`

use crate::array::{CArray, RArray};
use crate::error::{ReconError, Result};

#[derive(Debug, Clone)]
pub struct ReconJob {
    pub samples: CArray,
    pub trajectory: RArray,
    pub dcw: RArray,
    pub csm: CArray,
    pub prior: Option<CArray>,
    pub frames: usize,
    pub matrix_size: usize,
}

impl ReconJob {
    pub fn new(
        samples: CArray,
        trajectory: RArray,
        dcw: RArray,
        csm: CArray,
        frames: usize,
    ) -> Self {
        let matrix_size = csm.shape().first().copied().unwrap_or(0);
        Self {
            samples,
            trajectory,
            dcw,
            csm,
            prior: None,
            frames,
            matrix_size,
        }
    }

    pub fn with_prior(mut self, prior: CArray) -> Self {
        self.prior = Some(prior);
        self
    }

    pub fn sample_count(&self) -> usize {
        self.samples.shape().first().copied().unwrap_or(0)
    }

    pub fn channels(&self) -> usize {
        self.samples.shape().get(1).copied().unwrap_or(0)
    }

    pub fn samples_per_frame(&self) -> usize {
        self.sample_count() / self.frames.max(1)
    }

    /// Solver domain `[nx, ny, frames]`.
    pub fn image_dims(&self) -> Vec<usize> {
        vec![self.matrix_size, self.matrix_size, self.frames]
    }

    /// Check the cross-array invariants. Violations are data errors.
    pub fn validate(&self) -> Result<()> {
        let fail = |msg: String| Err(ReconError::Data(msg));

        if self.samples.ndim() != 2 {
            return fail(format!(
                "samples must be [samples, channels], got {:?}",
                self.samples.shape()
            ));
        }
        let (n, channels) = (self.sample_count(), self.channels());
        if n == 0 || channels == 0 {
            return fail("job contains no samples".into());
        }
        if self.trajectory.shape() != [n, 2] {
            return fail(format!(
                "trajectory {:?} does not match {} samples",
                self.trajectory.shape(),
                n
            ));
        }
        if self.dcw.shape() != [n] {
            return fail(format!(
                "density weights {:?} do not match {} samples",
                self.dcw.shape(),
                n
            ));
        }
        if self.dcw.iter().any(|w| !w.is_finite() || *w < 0.0) {
            return fail("density weights must be finite and non-negative".into());
        }
        if self.matrix_size == 0 {
            return fail("matrix size must be positive".into());
        }
        let csm_dims = [self.matrix_size, self.matrix_size, channels];
        if self.csm.shape() != csm_dims {
            return fail(format!(
                "coil maps {:?} do not match expected {:?}",
                self.csm.shape(),
                csm_dims
            ));
        }
        if self.frames == 0 || n % self.frames != 0 {
            return fail(format!(
                "{} samples cannot be split into {} frames",
                n, self.frames
            ));
        }
        if let Some(prior) = &self.prior {
            let m = self.matrix_size;
            if prior.shape() != [m, m] && prior.shape() != [m, m, self.frames] {
                return fail(format!("prior {:?} does not match the image", prior.shape()));
            }
        }
        Ok(())
    }
}
