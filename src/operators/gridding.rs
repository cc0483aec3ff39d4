//! Kaiser–Bessel gridding onto an oversampled Cartesian grid.
//!
//! Each sample at `k` cycles/pixel sits at fractional grid coordinate
//! `g = k·n_os` and couples to every grid point within `kernel_width / 2`
//! through a separable Kaiser–Bessel kernel. The image is divided by the
//! kernel's Fourier transform before the forward FFT (and after the inverse
//! one), which turns the convolution back into an interpolation of the
//! image's spectrum. `β` follows Beatty et al. for the actual oversampling.

use super::transform::{
    check_convolution, samples_per_frame, signed_position, ConvolutionDirection, GridFft,
    NufftTransform, TransformDirection,
};
use crate::array::{CArray, Complex64, RArray};
use crate::error::{ReconError, Result};
use std::f64::consts::PI;

/// Modified Bessel function of the first kind, order zero.
fn bessel_i0(x: f64) -> f64 {
    let q = x * x / 4.0;
    let mut term = 1.0;
    let mut sum = 1.0;
    for k in 1..200 {
        term *= q / (k * k) as f64;
        sum += term;
        if term < sum * 1e-17 {
            break;
        }
    }
    sum
}

/// Kernel shape for one width and oversampling factor.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct KaiserBessel {
    pub width: f64,
    pub beta: f64,
    norm: f64,
}

impl KaiserBessel {
    pub fn new(width: f64, oversampling: f64) -> Self {
        let a = (width / oversampling) * (oversampling - 0.5);
        let beta = PI * (a * a - 0.8).max(0.0).sqrt();
        Self {
            width,
            beta,
            norm: bessel_i0(beta),
        }
    }

    /// Kernel value at grid distance `u`.
    pub fn value(&self, u: f64) -> f64 {
        let r = 2.0 * u / self.width;
        if r.abs() > 1.0 {
            return 0.0;
        }
        bessel_i0(self.beta * (1.0 - r * r).sqrt()) / self.norm
    }

    /// Continuous Fourier transform at `nu` cycles per grid point.
    pub fn transform(&self, nu: f64) -> f64 {
        let z = self.beta * self.beta - (PI * self.width * nu).powi(2);
        let shape = if z > 1e-12 {
            let r = z.sqrt();
            r.sinh() / r
        } else if z < -1e-12 {
            let r = (-z).sqrt();
            r.sin() / r
        } else {
            1.0
        };
        self.width * shape / self.norm
    }
}

/// Grid points touched by one sample along each axis, with kernel weights.
#[derive(Debug, Clone, Default)]
struct Footprint {
    x: Vec<(usize, f64)>,
    y: Vec<(usize, f64)>,
}

/// Gridding NUFFT with a Kaiser–Bessel kernel.
#[derive(Default)]
pub struct KaiserBesselTransform {
    fft: Option<GridFft>,
    kernel: Option<KaiserBessel>,
    /// Per-axis reciprocal apodization, zero where the kernel transform vanishes
    deapodization: [Vec<f64>; 2],
    footprints: Vec<Footprint>,
    samples_per_frame: usize,
}

impl KaiserBesselTransform {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn kernel(&self) -> Option<KaiserBessel> {
        self.kernel
    }

    fn ready(&self) -> Result<(&GridFft, &KaiserBessel)> {
        match (&self.fft, &self.kernel) {
            (Some(fft), Some(kernel)) => Ok((fft, kernel)),
            _ => Err(ReconError::config("transform used before setup")),
        }
    }

    fn axis_footprint(kernel: &KaiserBessel, g: f64, n_os: usize) -> Vec<(usize, f64)> {
        let half = kernel.width / 2.0;
        let first = (g - half).ceil() as i64;
        let last = (g + half).floor() as i64;
        (first..=last)
            .map(|j| {
                (
                    j.rem_euclid(n_os as i64) as usize,
                    kernel.value(j as f64 - g),
                )
            })
            .collect()
    }
}

impl NufftTransform for KaiserBesselTransform {
    fn setup(&mut self, matrix: &[usize], matrix_os: &[usize], kernel_width: f64) -> Result<()> {
        if matrix.len() != 2 || matrix_os.len() != 2 {
            return Err(ReconError::config("transform supports 2D matrices only"));
        }
        if matrix.iter().zip(matrix_os).any(|(m, os)| *m == 0 || os < m) {
            return Err(ReconError::config(format!(
                "oversampled matrix {:?} smaller than image matrix {:?}",
                matrix_os, matrix
            )));
        }
        if !(kernel_width >= 1.0) {
            return Err(ReconError::config(format!(
                "kernel_width must be at least 1, got {}",
                kernel_width
            )));
        }

        let oversampling = matrix_os
            .iter()
            .zip(matrix)
            .map(|(os, m)| *os as f64 / *m as f64)
            .fold(f64::INFINITY, f64::min);
        let kernel = KaiserBessel::new(kernel_width, oversampling);

        // Per axis: kernel transform scaled by sqrt(n / n_os) so the
        // orthonormal FFT on the larger grid matches the n-point one.
        for axis in 0..2 {
            let (n, n_os) = (matrix[axis], matrix_os[axis]);
            let scale = (n as f64 / n_os as f64).sqrt();
            self.deapodization[axis] = (0..n_os)
                .map(|i| {
                    let a = kernel.transform(signed_position(i, n_os) / n_os as f64) * scale;
                    if a.abs() > 1e-12 {
                        1.0 / a
                    } else {
                        0.0
                    }
                })
                .collect();
        }

        tracing::trace!(
            "Kaiser-Bessel transform set up: {:?} -> {:?}, width {}, beta {:.3}",
            matrix,
            matrix_os,
            kernel_width,
            kernel.beta
        );
        self.fft = Some(GridFft::new(matrix_os));
        self.kernel = Some(kernel);
        Ok(())
    }

    fn preprocess(&mut self, trajectory: &RArray, frames: usize) -> Result<()> {
        let (fft, kernel) = self.ready()?;
        let (nx, ny) = (fft.matrix_os()[0], fft.matrix_os()[1]);
        let per_frame = samples_per_frame(trajectory, frames)?;

        let footprints = trajectory
            .outer_iter()
            .map(|k| Footprint {
                x: Self::axis_footprint(kernel, k[0] * nx as f64, nx),
                y: Self::axis_footprint(kernel, k[1] * ny as f64, ny),
            })
            .collect();
        self.footprints = footprints;
        self.samples_per_frame = per_frame;
        Ok(())
    }

    fn convolve(
        &self,
        samples: &mut CArray,
        grid: &mut CArray,
        weights: &RArray,
        direction: ConvolutionDirection,
    ) -> Result<()> {
        let (fft, _) = self.ready()?;
        fft.check_grid(grid)?;
        check_convolution(
            samples,
            grid,
            weights,
            self.footprints.len(),
            self.samples_per_frame,
        )?;
        let coils = grid.shape()[3];

        match direction {
            ConvolutionDirection::C2NC => {
                for (s, fp) in self.footprints.iter().enumerate() {
                    let f = s / self.samples_per_frame;
                    for c in 0..coils {
                        let mut acc = Complex64::new(0.0, 0.0);
                        for &(ix, wx) in &fp.x {
                            for &(iy, wy) in &fp.y {
                                acc += grid[[ix, iy, f, c]] * (wx * wy);
                            }
                        }
                        samples[[s, c]] = acc * weights[s];
                    }
                }
            }
            ConvolutionDirection::NC2C => {
                grid.fill(Complex64::new(0.0, 0.0));
                for (s, fp) in self.footprints.iter().enumerate() {
                    let f = s / self.samples_per_frame;
                    for c in 0..coils {
                        let v = samples[[s, c]] * weights[s];
                        for &(ix, wx) in &fp.x {
                            for &(iy, wy) in &fp.y {
                                grid[[ix, iy, f, c]] += v * (wx * wy);
                            }
                        }
                    }
                }
            }
        }
        Ok(())
    }

    fn fft(&self, grid: &mut CArray, direction: TransformDirection) -> Result<()> {
        self.ready()?.0.process(grid, direction)
    }

    fn deapodize(&self, grid: &mut CArray) -> Result<()> {
        self.ready()?.0.check_grid(grid)?;
        let [dx, dy] = &self.deapodization;
        for (idx, v) in grid.indexed_iter_mut() {
            *v *= dx[idx[0]] * dy[idx[1]];
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::array::{self, nrm2};
    use crate::operators::transform::{embed_centred, extract_centred};
    use ndarray::IxDyn;

    fn cartesian_trajectory(n: usize) -> RArray {
        let mut traj = RArray::zeros(IxDyn(&[n * n, 2]));
        for i in 0..n {
            for j in 0..n {
                traj[[i * n + j, 0]] = (i as f64 - (n / 2) as f64) / n as f64;
                traj[[i * n + j, 1]] = (j as f64 - (n / 2) as f64) / n as f64;
            }
        }
        traj
    }

    fn test_image(n: usize) -> CArray {
        let mut x = array::create(&[n, n, 1, 1]);
        for (i, v) in x.iter_mut().enumerate() {
            *v = Complex64::new(((i * 7) % 5) as f64 - 2.0, ((i * 3) % 4) as f64 - 1.5);
        }
        x
    }

    /// Gridded forward model: embed, deapodize, FFT, interpolate.
    fn gridded_samples(t: &KaiserBesselTransform, image: &CArray, n_os: usize) -> CArray {
        let n = image.shape()[0];
        let mut grid = embed_centred(image, &[n_os, n_os, 1, 1]);
        t.deapodize(&mut grid).unwrap();
        t.fft(&mut grid, TransformDirection::Forward).unwrap();
        let mut samples = array::create(&[n * n, 1]);
        let weights = RArray::ones(IxDyn(&[n * n]));
        t.convolve(&mut samples, &mut grid, &weights, ConvolutionDirection::C2NC)
            .unwrap();
        samples
    }

    /// `(1/n) Σ ρ(x) exp(-2πi k·(x - n/2))`
    fn exact_samples(image: &CArray, traj: &RArray) -> CArray {
        let n = image.shape()[0];
        let h = (n / 2) as f64;
        let mut out = array::create(&[traj.shape()[0], 1]);
        for (s, k) in traj.outer_iter().enumerate() {
            let mut acc = Complex64::new(0.0, 0.0);
            for x in 0..n {
                for y in 0..n {
                    let phase = -2.0 * PI * (k[0] * (x as f64 - h) + k[1] * (y as f64 - h));
                    acc += image[[x, y, 0, 0]] * Complex64::from_polar(1.0, phase);
                }
            }
            out[[s, 0]] = acc / n as f64;
        }
        out
    }

    #[test]
    fn test_bessel_i0() {
        assert!((bessel_i0(0.0) - 1.0).abs() < 1e-15);
        assert!((bessel_i0(1.0) - 1.266_065_877_752_008_4).abs() < 1e-12);
        assert!((bessel_i0(10.0) / 2_815.716_628_466_254 - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_kernel_shape() {
        let kb = KaiserBessel::new(5.5, 1.25);
        assert!((kb.beta - 9.979).abs() < 1e-2);
        assert!((kb.value(0.0) - 1.0).abs() < 1e-15);
        assert_eq!(kb.value(2.76), 0.0);
        assert!(kb.value(1.0) > kb.value(2.0));
        assert!((kb.value(1.3) - kb.value(-1.3)).abs() < 1e-15);
    }

    #[test]
    fn test_matches_exact_fourier_samples() {
        for &(n, n_os) in &[(8usize, 10usize), (16, 20), (8, 16)] {
            let mut t = KaiserBesselTransform::new();
            t.setup(&[n, n], &[n_os, n_os], 5.5).unwrap();
            let traj = cartesian_trajectory(n);
            t.preprocess(&traj, 1).unwrap();

            let image = test_image(n);
            let gridded = gridded_samples(&t, &image, n_os);
            let exact = exact_samples(&image, &traj);
            let err = nrm2(&(&gridded - &exact)) / nrm2(&exact);
            assert!(err < 5e-3, "n {} n_os {} relative error {}", n, n_os, err);
        }
    }

    #[test]
    fn test_convolution_adjoint() {
        let n = 6;
        let mut t = KaiserBesselTransform::new();
        t.setup(&[n, n], &[8, 8], 4.0).unwrap();
        let mut traj = cartesian_trajectory(n);
        traj.mapv_inplace(|k| k * 0.93 + 0.011);
        t.preprocess(&traj, 1).unwrap();

        let weights = RArray::from_shape_fn(IxDyn(&[n * n]), |i| 0.5 + (i[0] % 3) as f64);
        let mut grid = array::create(&[8, 8, 1, 2]);
        for (i, v) in grid.iter_mut().enumerate() {
            *v = Complex64::new((i % 7) as f64, (i % 2) as f64);
        }
        let mut y = array::create(&[n * n, 2]);
        for (i, v) in y.iter_mut().enumerate() {
            *v = Complex64::new((i % 3) as f64 - 1.0, (i % 5) as f64);
        }

        let mut forward = array::create(&[n * n, 2]);
        let mut g = grid.clone();
        t.convolve(&mut forward, &mut g, &weights, ConvolutionDirection::C2NC)
            .unwrap();
        let mut back = array::create(&[8, 8, 1, 2]);
        let mut yy = y.clone();
        t.convolve(&mut yy, &mut back, &weights, ConvolutionDirection::NC2C)
            .unwrap();

        let lhs = array::dot(&forward, &y);
        let rhs = array::dot(&grid, &back);
        assert!((lhs - rhs).norm() < 1e-10 * nrm2(&grid) * nrm2(&y));
    }

    #[test]
    fn test_deapodization_is_real_and_symmetric() {
        let mut t = KaiserBesselTransform::new();
        t.setup(&[8, 8], &[10, 10], 5.5).unwrap();
        let d = &t.deapodization[0];
        assert_eq!(d.len(), 10);
        assert!(d.iter().all(|v| *v > 0.0));
        for i in 1..5 {
            assert!((d[i] - d[10 - i]).abs() < 1e-12);
        }

        let image = test_image(8);
        let mut grid = embed_centred(&image, &[10, 10, 1, 1]);
        t.deapodize(&mut grid).unwrap();
        assert_eq!(extract_centred(&grid, 8, 8).shape(), &[8, 8, 1, 1]);
    }

    #[test]
    fn test_setup_validation() {
        let mut t = KaiserBesselTransform::new();
        assert!(t.setup(&[8, 8], &[6, 6], 5.5).is_err());
        assert!(t.setup(&[8, 8], &[10, 10], 0.5).is_err());
        let mut grid = array::create(&[10, 10, 1, 1]);
        assert!(t.fft(&mut grid, TransformDirection::Forward).is_err());
    }
}
