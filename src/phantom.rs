//! Synthetic acquisition source.
//!
//! Generates a small multi-coil Cartesian scan of a disc phantom so the
//! pipeline can be exercised without scanner data. Each frame is a set of
//! phase-encode lines; every line becomes one acquisition message. Optional
//! noise-only readouts precede the imaging data.

use crate::array::{self, CArray, Complex64, RArray};
use crate::error::{ReconError, Result};
use crate::job::ReconJob;
use crate::operators::{CartesianTransform, LinearOperator, SenseEncoding};
use crate::pipeline::message::{IndexCounters, Message};
use ndarray::{s, Axis, IxDyn};
use std::f64::consts::PI;

/// Xorshift generator, seeded so runs are reproducible.
#[derive(Debug, Clone)]
pub struct XorShift(u64);

impl XorShift {
    pub fn new(seed: u64) -> Self {
        Self(seed | 1)
    }

    /// Uniform in `(0, 1]`.
    pub fn next_f64(&mut self) -> f64 {
        let mut s = self.0;
        s ^= s << 13;
        s ^= s >> 7;
        s ^= s << 17;
        self.0 = s;
        ((s >> 11) as f64 + 1.0) / (1u64 << 53) as f64
    }

    /// Circular complex Gaussian with standard deviation `std` per component.
    pub fn complex_gaussian(&mut self, std: f64) -> Complex64 {
        let r = (-2.0 * self.next_f64().ln()).sqrt() * std;
        let theta = 2.0 * PI * self.next_f64();
        Complex64::new(r * theta.cos(), r * theta.sin())
    }
}

#[derive(Debug, Clone)]
pub struct PhantomSpec {
    pub matrix_size: usize,
    pub coils: usize,
    pub frames: usize,
    /// Phase-encode lines per frame, spread evenly over k-space
    pub profiles_per_frame: usize,
    pub noise_readouts: usize,
    pub noise_std: f64,
    pub dwell_time_us: f32,
    pub seed: u64,
}

impl Default for PhantomSpec {
    fn default() -> Self {
        Self {
            matrix_size: 16,
            coils: 4,
            frames: 1,
            profiles_per_frame: 16,
            noise_readouts: 4,
            noise_std: 0.0,
            dwell_time_us: 2.0,
            seed: 12345,
        }
    }
}

pub struct Phantom {
    spec: PhantomSpec,
    image: CArray,
    csm: CArray,
}

impl Phantom {
    pub fn new(spec: PhantomSpec) -> Result<Self> {
        let n = spec.matrix_size;
        if n < 2 || spec.coils == 0 || spec.frames == 0 {
            return Err(ReconError::config(format!(
                "phantom needs matrix_size >= 2 and at least one coil and frame, got {:?}",
                spec
            )));
        }
        if spec.profiles_per_frame == 0 || spec.profiles_per_frame > n {
            return Err(ReconError::config(format!(
                "profiles_per_frame must be in 1..={}, got {}",
                n, spec.profiles_per_frame
            )));
        }

        let image = disc_image(n, spec.frames);
        let csm = coil_maps(n, spec.coils);
        Ok(Self { spec, image, csm })
    }

    pub fn spec(&self) -> &PhantomSpec {
        &self.spec
    }

    /// Ground truth `[n, n, frames]`.
    pub fn image(&self) -> &CArray {
        &self.image
    }

    /// Coil maps `[n, n, coils]`, normalised to unit root-sum-of-squares.
    pub fn csm(&self) -> &CArray {
        &self.csm
    }

    /// Sampled phase-encode lines.
    pub fn lines(&self) -> Vec<usize> {
        let n = self.spec.matrix_size;
        let p = self.spec.profiles_per_frame;
        (0..p).map(|i| i * n / p).collect()
    }

    /// Trajectory of every frame, frame blocks in order, line-major.
    pub fn trajectory(&self) -> RArray {
        let n = self.spec.matrix_size;
        let lines = self.lines();
        let per_frame = lines.len() * n;
        let mut traj = array::create_real(&[per_frame * self.spec.frames, 2]);
        for f in 0..self.spec.frames {
            for (p, &line) in lines.iter().enumerate() {
                for j in 0..n {
                    let s = f * per_frame + p * n + j;
                    traj[[s, 0]] = (line as f64 - (n / 2) as f64) / n as f64;
                    traj[[s, 1]] = (j as f64 - (n / 2) as f64) / n as f64;
                }
            }
        }
        traj
    }

    /// Noiseless job carrying the phantom's exact samples.
    pub fn job(&self) -> Result<ReconJob> {
        let traj = self.trajectory();
        let count = traj.shape()[0];
        let mut job = ReconJob::new(
            array::create(&[count, self.spec.coils]),
            traj,
            RArray::ones(IxDyn(&[count])),
            self.csm.clone(),
            self.spec.frames,
        );
        let samples = {
            let encoding = SenseEncoding::new(&job, Box::new(CartesianTransform::new()), 1.0, 5.5)?;
            encoding.apply(&self.image)?
        };
        job.samples = samples;
        Ok(job)
    }

    /// Noise readouts followed by one acquisition message per line.
    pub fn stream(&self) -> Result<Vec<Message>> {
        let n = self.spec.matrix_size;
        let coils = self.spec.coils;
        let mut rng = XorShift::new(self.spec.seed);
        let job = self.job()?;
        let lines = self.lines();

        let mut messages = Vec::with_capacity(self.spec.noise_readouts + lines.len() * self.spec.frames);
        for _ in 0..self.spec.noise_readouts {
            let mut noise = array::create(&[n, coils]);
            noise
                .iter_mut()
                .for_each(|v| *v = rng.complex_gaussian(self.spec.noise_std.max(1e-3)));
            messages.push(Message::noise(noise, self.spec.dwell_time_us));
        }

        let mut scan = 0u32;
        for f in 0..self.spec.frames {
            for (p, &line) in lines.iter().enumerate() {
                let start = (f * lines.len() + p) * n;
                let mut samples = job.samples.slice(s![start..start + n, ..]).to_owned().into_dyn();
                if self.spec.noise_std > 0.0 {
                    samples
                        .iter_mut()
                        .for_each(|v| *v += rng.complex_gaussian(self.spec.noise_std));
                }
                let trajectory = job
                    .trajectory
                    .slice(s![start..start + n, ..])
                    .to_owned()
                    .into_dyn();

                let counters = IndexCounters {
                    scan,
                    profile: line as u32,
                    frame: f as u32,
                    ..Default::default()
                };
                let mut message = Message::acquisition(counters, samples, trajectory, None);
                message.header_mut().dwell_time_us = self.spec.dwell_time_us;
                messages.push(message);
                scan += 1;
            }
        }
        tracing::debug!(
            "Phantom stream: {} noise readouts, {} acquisitions",
            self.spec.noise_readouts,
            scan
        );
        Ok(messages)
    }
}

/// Disc of radius n/3 with a smaller insert that brightens frame by frame.
fn disc_image(n: usize, frames: usize) -> CArray {
    let mut image = array::create(&[n, n, frames]);
    let c = (n as f64 - 1.0) / 2.0;
    let outer = n as f64 / 3.0;
    let inner = n as f64 / 8.0;
    for f in 0..frames {
        let mut frame = image.index_axis_mut(Axis(2), f);
        for ((i, j), v) in frame.indexed_iter_mut().map(|(idx, v)| ((idx[0], idx[1]), v)) {
            let r = ((i as f64 - c).powi(2) + (j as f64 - c).powi(2)).sqrt();
            if r <= inner {
                *v = Complex64::new(1.0 + 0.25 * f as f64, 0.0);
            } else if r <= outer {
                *v = Complex64::new(0.5, 0.0);
            }
        }
    }
    image
}

/// Gaussian coil profiles placed around the field of view.
fn coil_maps(n: usize, coils: usize) -> CArray {
    let mut csm = array::create(&[n, n, coils]);
    let c = (n as f64 - 1.0) / 2.0;
    let sigma = n as f64 / 2.0;
    for k in 0..coils {
        let theta = 2.0 * PI * k as f64 / coils as f64;
        let (cx, cy) = (c + 0.6 * n as f64 * theta.cos(), c + 0.6 * n as f64 * theta.sin());
        let phase = Complex64::from_polar(1.0, theta);
        for i in 0..n {
            for j in 0..n {
                let d2 = (i as f64 - cx).powi(2) + (j as f64 - cy).powi(2);
                csm[[i, j, k]] = phase * (-d2 / (2.0 * sigma * sigma)).exp();
            }
        }
    }

    let rss = array::sum_last_axis(&array::abs_square(&csm)).mapv(f64::sqrt);
    for k in 0..coils {
        let mut map = csm.index_axis_mut(Axis(2), k);
        ndarray::Zip::from(&mut map).and(&rss).for_each(|v, &r| *v /= r);
    }
    csm
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_coil_maps_have_unit_rss() {
        let phantom = Phantom::new(PhantomSpec::default()).unwrap();
        let rss = array::sum_last_axis(&array::abs_square(phantom.csm()));
        assert!(rss.iter().all(|v| (v - 1.0).abs() < 1e-12));
    }

    #[test]
    fn test_stream_layout() {
        let spec = PhantomSpec {
            frames: 2,
            profiles_per_frame: 8,
            noise_readouts: 3,
            ..Default::default()
        };
        let phantom = Phantom::new(spec).unwrap();
        let stream = phantom.stream().unwrap();
        assert_eq!(stream.len(), 3 + 2 * 8);
        assert!(stream[..3].iter().all(|m| m.is_noise()));

        let first = &stream[3];
        assert_eq!(first.samples().unwrap().shape(), &[16, 4]);
        assert_eq!(first.trajectory().unwrap().shape(), &[16, 2]);
        assert_eq!(stream[3 + 8].header().counters.frame, 1);
        assert_eq!(phantom.lines(), vec![0, 2, 4, 6, 8, 10, 12, 14]);
    }

    #[test]
    fn test_rejects_bad_dimensions() {
        assert!(Phantom::new(PhantomSpec {
            profiles_per_frame: 17,
            ..Default::default()
        })
        .is_err());
        assert!(Phantom::new(PhantomSpec {
            coils: 0,
            ..Default::default()
        })
        .is_err());
    }

    #[test]
    fn test_xorshift_is_reproducible() {
        let mut a = XorShift::new(7);
        let mut b = XorShift::new(7);
        for _ in 0..10 {
            let x = a.next_f64();
            assert!(x > 0.0 && x <= 1.0);
            assert_eq!(x, b.next_f64());
        }
    }
}
