//! NoiseAdjustStage: receiver noise prewhitening.
//!
//! Noise readouts (flagged `NOISE_MEASUREMENT`) are absorbed into a channel
//! covariance estimate `Ψ`. Every later imaging readout is whitened per
//! sample with `L⁻¹`, `Ψ = LLᴴ`, and scaled by
//! `sqrt(2 · acq_dwell / noise_dwell · receiver_noise_bandwidth)`.
//! Until noise has been seen, readouts pass through untouched.

use crate::array::{CArray, Complex64};
use crate::error::{ReconError, Result};
use crate::pipeline::message::{Message, MessageFlags, MessageKind};
use crate::pipeline::stage::{ConfigureContext, Emitter, Stage};
use ndarray::{Array2, ArrayView2, Ix2};

/// Default effective noise bandwidth of the receiver chain.
pub const DEFAULT_RECEIVER_NOISE_BANDWIDTH: f64 = 0.793;

pub struct NoiseAdjustStage {
    bandwidth: f64,
    /// Σ x xᴴ over all noise samples
    noise_sum: Option<Array2<Complex64>>,
    noise_samples: usize,
    noise_dwell_us: f32,
    /// Lower Cholesky factor of the normalised covariance
    factor: Option<Array2<Complex64>>,
}

impl NoiseAdjustStage {
    pub fn new() -> Self {
        Self {
            bandwidth: DEFAULT_RECEIVER_NOISE_BANDWIDTH,
            noise_sum: None,
            noise_samples: 0,
            noise_dwell_us: 0.0,
            factor: None,
        }
    }

    pub fn bandwidth(&self) -> f64 {
        self.bandwidth
    }

    /// Number of noise samples folded into the covariance so far.
    pub fn noise_samples(&self) -> usize {
        self.noise_samples
    }

    /// Current covariance estimate `Σ x xᴴ / (N - 1)`.
    pub fn covariance(&self) -> Option<Array2<Complex64>> {
        let sum = self.noise_sum.as_ref()?;
        let norm = self.noise_samples.saturating_sub(1).max(1) as f64;
        Some(sum.mapv(|v| v / norm))
    }

    /// `sqrt(2 · acq_dwell / noise_dwell · bandwidth)`; the dwell ratio is 1
    /// when either dwell time is unknown.
    pub fn scale_factor(&self, acquisition_dwell_us: f32) -> f64 {
        let ratio = if acquisition_dwell_us > 0.0 && self.noise_dwell_us > 0.0 {
            acquisition_dwell_us as f64 / self.noise_dwell_us as f64
        } else {
            1.0
        };
        (2.0 * ratio * self.bandwidth).sqrt()
    }

    fn accumulate(&mut self, samples: ArrayView2<Complex64>, dwell_us: f32) -> Result<()> {
        let channels = samples.ncols();
        let sum = self
            .noise_sum
            .get_or_insert_with(|| Array2::zeros((channels, channels)));
        if sum.nrows() != channels {
            return Err(ReconError::data(format!(
                "noise readout has {} channels, earlier noise had {}",
                channels,
                sum.nrows()
            )));
        }

        for row in samples.outer_iter() {
            for i in 0..channels {
                for j in 0..channels {
                    sum[[i, j]] += row[i] * row[j].conj();
                }
            }
        }
        self.noise_samples += samples.nrows();
        if dwell_us > 0.0 {
            self.noise_dwell_us = dwell_us;
        }
        self.factor = None;
        Ok(())
    }

    fn factor(&mut self) -> Result<&Array2<Complex64>> {
        if self.factor.is_none() {
            let covariance = self
                .covariance()
                .ok_or_else(|| ReconError::data("no noise covariance available"))?;
            let factor = cholesky_lower(&covariance)?;
            tracing::debug!(
                "Noise covariance from {} samples, {} channels",
                self.noise_samples,
                factor.nrows()
            );
            self.factor = Some(factor);
        }
        self.factor
            .as_ref()
            .ok_or_else(|| ReconError::data("no noise covariance available"))
    }

    /// Whiten `samples` `[n, channels]` in place.
    pub fn whiten(&mut self, samples: &mut CArray, dwell_us: f32) -> Result<()> {
        let scale = self.scale_factor(dwell_us);
        let factor = self.factor()?.clone();
        let channels = factor.nrows();
        let mut view = samples
            .view_mut()
            .into_dimensionality::<Ix2>()
            .map_err(|_| ReconError::data("readout samples must be [samples, channels]"))?;
        if view.ncols() != channels {
            return Err(ReconError::data(format!(
                "readout has {} channels, noise covariance has {}",
                view.ncols(),
                channels
            )));
        }

        for mut row in view.outer_iter_mut() {
            // forward substitution L y = x
            for i in 0..channels {
                let mut acc = row[i];
                for k in 0..i {
                    acc -= factor[[i, k]] * row[k];
                }
                row[i] = acc / factor[[i, i]];
            }
            row.mapv_inplace(|v| v * scale);
        }
        Ok(())
    }
}

impl Default for NoiseAdjustStage {
    fn default() -> Self {
        Self::new()
    }
}

/// Cholesky factor `L` of a Hermitian positive-definite matrix, `A = LLᴴ`.
fn cholesky_lower(a: &Array2<Complex64>) -> Result<Array2<Complex64>> {
    let n = a.nrows();
    let mut l = Array2::<Complex64>::zeros((n, n));
    for j in 0..n {
        let mut diag = a[[j, j]].re;
        for k in 0..j {
            diag -= l[[j, k]].norm_sqr();
        }
        if !(diag > 0.0) || !diag.is_finite() {
            return Err(ReconError::data(
                "noise covariance is not positive definite",
            ));
        }
        let d = diag.sqrt();
        l[[j, j]] = Complex64::new(d, 0.0);

        for i in (j + 1)..n {
            let mut v = a[[i, j]];
            for k in 0..j {
                v -= l[[i, k]] * l[[j, k]].conj();
            }
            l[[i, j]] = v / d;
        }
    }
    Ok(l)
}

impl Stage for NoiseAdjustStage {
    fn name(&self) -> &str {
        "noise_adjust"
    }

    fn configure(&mut self, ctx: &ConfigureContext) -> Result<()> {
        let bandwidth = ctx
            .options
            .float_or("receiver_noise_bandwidth", DEFAULT_RECEIVER_NOISE_BANDWIDTH)?;
        self.bandwidth = ctx
            .clamp
            .within("receiver_noise_bandwidth", bandwidth, f64::MIN_POSITIVE, 1.0)?;
        Ok(())
    }

    fn process(&mut self, mut message: Message, out: &mut Emitter) -> Result<()> {
        if message.kind() != MessageKind::Acquisition {
            return out.emit(message);
        }

        if message.is_noise() {
            let dwell = message.header().dwell_time_us;
            let samples = message
                .samples()
                .ok_or_else(|| ReconError::data("noise readout has no samples"))?;
            let view = samples
                .view()
                .into_dimensionality::<Ix2>()
                .map_err(|_| ReconError::data("noise samples must be [samples, channels]"))?;
            self.accumulate(view, dwell)?;
            out.absorb(message);
            return Ok(());
        }

        if self.noise_sum.is_none() {
            tracing::trace!("No noise seen yet, passing readout through");
            return out.emit(message);
        }

        let dwell = message.header().dwell_time_us;
        let samples = message
            .samples_mut()
            .ok_or_else(|| ReconError::data("readout has no samples"))?;
        self.whiten(samples, dwell)?;
        message.header_mut().flags.insert(MessageFlags::PREWHITENED);
        out.emit(message)
    }
}
