//! Transform service used by the SENSE encoding operator.
//!
//! The encoding pipeline only talks to [`NufftTransform`]; gridding kernels
//! and density compensation live behind it. Two implementations ship:
//!
//! - [`CartesianTransform`]: nearest-grid-point sampling with no
//!   oversampling. Exact for trajectories on the image grid.
//! - [`KaiserBesselTransform`](super::gridding::KaiserBesselTransform):
//!   Kaiser–Bessel gridding onto an oversampled grid with matching
//!   deapodization.
//!
//! Grid layout is `[nx_os, ny_os, frames, coils]`; sample layout is
//! `[samples, coils]` with frames stored as contiguous sample blocks. The
//! image centre sits on grid index 0 (see [`embed_centred`]), so a sample at
//! `k` cycles/pixel sees pixel `x` at phase `-2πk(x - n/2)` whatever the
//! oversampling.

use super::gridding::KaiserBesselTransform;
use crate::array::{self, CArray, Complex64, RArray};
use crate::error::{ReconError, Result};
use ndarray::{Axis, Slice};
use rustfft::{Fft, FftPlanner};
use std::ops::Range;
use std::sync::Arc;

/// Direction of the gridding convolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConvolutionDirection {
    /// Cartesian grid to non-Cartesian samples
    C2NC,
    /// Non-Cartesian samples onto the Cartesian grid (accumulating)
    NC2C,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransformDirection {
    Forward,
    Inverse,
}

/// Non-uniform FFT building blocks.
#[cfg_attr(test, mockall::automock)]
pub trait NufftTransform {
    /// Fix image and oversampled grid extents.
    fn setup(&mut self, matrix: &[usize], matrix_os: &[usize], kernel_width: f64) -> Result<()>;

    /// Precompute the sample-to-grid mapping for a trajectory `[samples, 2]`.
    fn preprocess(&mut self, trajectory: &RArray, frames: usize) -> Result<()>;

    /// Convolve between `samples` and `grid`, scaling each sample by `weights`.
    fn convolve(
        &self,
        samples: &mut CArray,
        grid: &mut CArray,
        weights: &RArray,
        direction: ConvolutionDirection,
    ) -> Result<()>;

    /// Orthonormal FFT over the two spatial axes of `grid`.
    fn fft(&self, grid: &mut CArray, direction: TransformDirection) -> Result<()>;

    /// Undo the kernel apodization in image space.
    fn deapodize(&self, grid: &mut CArray) -> Result<()>;
}

/// Transform matching an oversampling factor: nearest-grid sampling when
/// there is none, Kaiser–Bessel gridding otherwise.
pub fn for_oversampling(oversampling: f64) -> Box<dyn NufftTransform> {
    if oversampling > 1.0 {
        Box::new(KaiserBesselTransform::new())
    } else {
        Box::new(CartesianTransform::new())
    }
}

// ==================== Shared grid helpers ====================

/// Source and destination row ranges placing image rows `0..n` at grid rows
/// `(x - n/2) mod n_os`.
fn centred_segments(n: usize, n_os: usize) -> [(Range<usize>, Range<usize>); 2] {
    let h = n / 2;
    [(0..h, n_os - h..n_os), (h..n, 0..n - h)]
}

/// Place `[nx, ny, ...]` coil images into a zeroed grid of `grid_dims`,
/// image centre on grid index 0.
pub fn embed_centred(image: &CArray, grid_dims: &[usize]) -> CArray {
    let (nx, ny) = (image.shape()[0], image.shape()[1]);
    let mut grid = array::create(grid_dims);
    for (sx, dx) in centred_segments(nx, grid_dims[0]) {
        for (sy, dy) in centred_segments(ny, grid_dims[1]) {
            grid.slice_each_axis_mut(|ax| match ax.axis.index() {
                0 => Slice::from(dx.clone()),
                1 => Slice::from(dy.clone()),
                _ => Slice::from(..),
            })
            .assign(&image.slice_each_axis(|ax| match ax.axis.index() {
                0 => Slice::from(sx.clone()),
                1 => Slice::from(sy.clone()),
                _ => Slice::from(..),
            }));
        }
    }
    grid
}

/// Inverse of [`embed_centred`]: cut the `[nx, ny, ...]` image out of a grid.
pub fn extract_centred(grid: &CArray, nx: usize, ny: usize) -> CArray {
    let mut dims = grid.shape().to_vec();
    dims[0] = nx;
    dims[1] = ny;
    let mut image = array::create(&dims);
    for (sx, dx) in centred_segments(nx, grid.shape()[0]) {
        for (sy, dy) in centred_segments(ny, grid.shape()[1]) {
            image
                .slice_each_axis_mut(|ax| match ax.axis.index() {
                    0 => Slice::from(sx.clone()),
                    1 => Slice::from(sy.clone()),
                    _ => Slice::from(..),
                })
                .assign(&grid.slice_each_axis(|ax| match ax.axis.index() {
                    0 => Slice::from(dx.clone()),
                    1 => Slice::from(dy.clone()),
                    _ => Slice::from(..),
                }));
        }
    }
    image
}

/// Signed position of grid row `i` relative to the image centre.
pub(crate) fn signed_position(i: usize, n_os: usize) -> f64 {
    if i >= n_os - n_os / 2 {
        i as f64 - n_os as f64
    } else {
        i as f64
    }
}

/// Orthonormal 2D FFT plans for one oversampled matrix.
pub(crate) struct GridFft {
    matrix_os: Vec<usize>,
    forward: [Arc<dyn Fft<f64>>; 2],
    inverse: [Arc<dyn Fft<f64>>; 2],
}

impl GridFft {
    pub fn new(matrix_os: &[usize]) -> Self {
        let mut planner = FftPlanner::new();
        Self {
            matrix_os: matrix_os.to_vec(),
            forward: [
                planner.plan_fft_forward(matrix_os[0]),
                planner.plan_fft_forward(matrix_os[1]),
            ],
            inverse: [
                planner.plan_fft_inverse(matrix_os[0]),
                planner.plan_fft_inverse(matrix_os[1]),
            ],
        }
    }

    pub fn matrix_os(&self) -> &[usize] {
        &self.matrix_os
    }

    pub fn check_grid(&self, grid: &CArray) -> Result<()> {
        if grid.ndim() != 4 || grid.shape()[..2] != self.matrix_os[..] {
            return Err(ReconError::config(format!(
                "grid {:?} does not match oversampled matrix {:?}",
                grid.shape(),
                self.matrix_os
            )));
        }
        Ok(())
    }

    pub fn process(&self, grid: &mut CArray, direction: TransformDirection) -> Result<()> {
        self.check_grid(grid)?;
        let ffts = match direction {
            TransformDirection::Forward => &self.forward,
            TransformDirection::Inverse => &self.inverse,
        };
        for (axis, fft) in ffts.iter().enumerate() {
            Self::fft_axis(grid, axis, fft);
        }
        Ok(())
    }

    fn fft_axis(grid: &mut CArray, axis: usize, fft: &Arc<dyn Fft<f64>>) {
        let n = grid.shape()[axis];
        let scale = 1.0 / (n as f64).sqrt();
        let mut buffer = vec![Complex64::new(0.0, 0.0); n];
        let mut scratch = vec![Complex64::new(0.0, 0.0); fft.get_inplace_scratch_len()];

        for mut lane in grid.lanes_mut(Axis(axis)) {
            for (b, v) in buffer.iter_mut().zip(lane.iter()) {
                *b = *v;
            }
            fft.process_with_scratch(&mut buffer, &mut scratch);
            for (v, b) in lane.iter_mut().zip(buffer.iter()) {
                *v = *b * scale;
            }
        }
    }
}

/// Validate a `[samples, 2]` trajectory and return samples per frame.
pub(crate) fn samples_per_frame(trajectory: &RArray, frames: usize) -> Result<usize> {
    if trajectory.ndim() != 2 || trajectory.shape()[1] != 2 {
        return Err(ReconError::data(format!(
            "trajectory must be [samples, 2], got {:?}",
            trajectory.shape()
        )));
    }
    let samples = trajectory.shape()[0];
    if frames == 0 || samples % frames != 0 {
        return Err(ReconError::data(format!(
            "{} trajectory points cannot be split into {} frames",
            samples, frames
        )));
    }
    Ok(samples / frames)
}

/// Check convolution operands against `points` preprocessed samples.
pub(crate) fn check_convolution(
    samples: &CArray,
    grid: &CArray,
    weights: &RArray,
    points: usize,
    samples_per_frame: usize,
) -> Result<()> {
    let coils = grid.shape()[3];
    if samples.shape() != [points, coils] || weights.shape() != [points] {
        return Err(ReconError::config(format!(
            "samples {:?} / weights {:?} do not match {} preprocessed points and {} coils",
            samples.shape(),
            weights.shape(),
            points,
            coils
        )));
    }
    let frames = grid.shape()[2];
    if samples_per_frame * frames != points {
        return Err(ReconError::config(format!(
            "grid has {} frames, trajectory was preprocessed for {}",
            frames,
            points / samples_per_frame.max(1)
        )));
    }
    Ok(())
}

// ==================== CartesianTransform ====================

/// Nearest-grid-point NUFFT without oversampling.
#[derive(Default)]
pub struct CartesianTransform {
    fft: Option<GridFft>,
    /// Grid point `(ix, iy)` of every sample
    grid_index: Vec<(usize, usize)>,
    samples_per_frame: usize,
}

impl CartesianTransform {
    pub fn new() -> Self {
        Self::default()
    }

    fn grid_fft(&self) -> Result<&GridFft> {
        self.fft
            .as_ref()
            .ok_or_else(|| ReconError::config("transform used before setup"))
    }
}

impl NufftTransform for CartesianTransform {
    fn setup(&mut self, matrix: &[usize], matrix_os: &[usize], kernel_width: f64) -> Result<()> {
        if matrix.len() != 2 || matrix_os.len() != 2 {
            return Err(ReconError::config("transform supports 2D matrices only"));
        }
        if matrix.iter().any(|m| *m == 0) {
            return Err(ReconError::config(format!("empty image matrix {:?}", matrix)));
        }
        if matrix_os != matrix {
            return Err(ReconError::config(format!(
                "nearest-grid transform cannot oversample ({:?} -> {:?}); use oversampling = 1",
                matrix, matrix_os
            )));
        }

        self.fft = Some(GridFft::new(matrix_os));
        tracing::trace!(
            "Cartesian transform set up: {:?} (kernel width {} unused)",
            matrix,
            kernel_width
        );
        Ok(())
    }

    fn preprocess(&mut self, trajectory: &RArray, frames: usize) -> Result<()> {
        let grid_fft = self.grid_fft()?;
        let (nx, ny) = (grid_fft.matrix_os()[0] as i64, grid_fft.matrix_os()[1] as i64);
        let per_frame = samples_per_frame(trajectory, frames)?;

        self.grid_index = trajectory
            .outer_iter()
            .map(|k| {
                let ix = (k[0] * nx as f64).round() as i64;
                let iy = (k[1] * ny as f64).round() as i64;
                (ix.rem_euclid(nx) as usize, iy.rem_euclid(ny) as usize)
            })
            .collect();
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
        self.grid_fft()?.check_grid(grid)?;
        check_convolution(
            samples,
            grid,
            weights,
            self.grid_index.len(),
            self.samples_per_frame,
        )?;
        let coils = grid.shape()[3];

        match direction {
            ConvolutionDirection::C2NC => {
                for (s, &(ix, iy)) in self.grid_index.iter().enumerate() {
                    let f = s / self.samples_per_frame;
                    for c in 0..coils {
                        samples[[s, c]] = grid[[ix, iy, f, c]] * weights[s];
                    }
                }
            }
            ConvolutionDirection::NC2C => {
                grid.fill(Complex64::new(0.0, 0.0));
                for (s, &(ix, iy)) in self.grid_index.iter().enumerate() {
                    let f = s / self.samples_per_frame;
                    for c in 0..coils {
                        grid[[ix, iy, f, c]] += samples[[s, c]] * weights[s];
                    }
                }
            }
        }
        Ok(())
    }

    fn fft(&self, grid: &mut CArray, direction: TransformDirection) -> Result<()> {
        self.grid_fft()?.process(grid, direction)
    }

    /// Nearest-point interpolation has a flat apodization profile.
    fn deapodize(&self, grid: &mut CArray) -> Result<()> {
        self.grid_fft()?.check_grid(grid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::array::{create, nrm2};
    use ndarray::IxDyn;

    fn full_trajectory(n: usize) -> RArray {
        let mut traj = RArray::zeros(IxDyn(&[n * n, 2]));
        for i in 0..n {
            for j in 0..n {
                traj[[i * n + j, 0]] = (i as f64 - (n / 2) as f64) / n as f64;
                traj[[i * n + j, 1]] = (j as f64 - (n / 2) as f64) / n as f64;
            }
        }
        traj
    }

    #[test]
    fn test_fft_is_orthonormal() {
        let mut t = CartesianTransform::new();
        t.setup(&[4, 4], &[4, 4], 5.5).unwrap();

        let mut grid = create(&[4, 4, 1, 1]);
        grid[[1, 2, 0, 0]] = Complex64::new(1.0, -2.0);
        let original = grid.clone();
        let norm = nrm2(&grid);

        t.fft(&mut grid, TransformDirection::Forward).unwrap();
        assert!((nrm2(&grid) - norm).abs() < 1e-12);

        t.fft(&mut grid, TransformDirection::Inverse).unwrap();
        for (a, b) in grid.iter().zip(original.iter()) {
            assert!((a - b).norm() < 1e-12);
        }
    }

    #[test]
    fn test_convolve_adjoint_scatters_samples() {
        let n = 4;
        let mut t = CartesianTransform::new();
        t.setup(&[n, n], &[n, n], 5.5).unwrap();
        t.preprocess(&full_trajectory(n), 1).unwrap();

        let mut grid = create(&[n, n, 1, 1]);
        grid[[0, 0, 0, 0]] = Complex64::new(3.0, 0.0);
        let weights = RArray::ones(IxDyn(&[n * n]));

        let mut samples = create(&[n * n, 1]);
        t.convolve(&mut samples, &mut grid, &weights, ConvolutionDirection::C2NC)
            .unwrap();
        // k = (0, 0) is sample (n/2)*n + n/2
        assert_eq!(samples[[(n / 2) * n + n / 2, 0]], Complex64::new(3.0, 0.0));

        let mut back = create(&[n, n, 1, 1]);
        t.convolve(&mut samples, &mut back, &weights, ConvolutionDirection::NC2C)
            .unwrap();
        assert_eq!(back, grid);
    }

    #[test]
    fn test_use_before_setup_fails() {
        let t = CartesianTransform::new();
        let mut grid = create(&[2, 2, 1, 1]);
        assert!(t.fft(&mut grid, TransformDirection::Forward).is_err());
    }

    #[test]
    fn test_cartesian_rejects_oversampling() {
        let mut t = CartesianTransform::new();
        let err = t.setup(&[8, 8], &[10, 10], 5.5).unwrap_err();
        assert!(matches!(err, ReconError::Configuration(_)));
    }

    #[test]
    fn test_centred_embedding() {
        let mut image = create(&[4, 3, 1, 1]);
        for (i, v) in image.iter_mut().enumerate() {
            *v = Complex64::new(i as f64 + 1.0, 0.0);
        }
        let grid = embed_centred(&image, &[6, 6, 1, 1]);
        // image centre (2, 1) lands on grid index 0
        assert_eq!(grid[[0, 0, 0, 0]], image[[2, 1, 0, 0]]);
        assert_eq!(grid[[5, 5, 0, 0]], image[[1, 0, 0, 0]]);
        assert_eq!(grid[[1, 1, 0, 0]], image[[3, 2, 0, 0]]);
        assert_eq!(grid[[3, 3, 0, 0]], Complex64::new(0.0, 0.0));
        assert_eq!(extract_centred(&grid, 4, 3), image);

        assert_eq!(signed_position(5, 6), -1.0);
        assert_eq!(signed_position(2, 6), 2.0);
        assert_eq!(signed_position(3, 6), -3.0);
    }

    #[test]
    fn test_for_oversampling_picks_gridding() {
        let mut t = for_oversampling(1.25);
        assert!(t.setup(&[8, 8], &[10, 10], 5.5).is_ok());
        let mut t = for_oversampling(1.0);
        assert!(t.setup(&[8, 8], &[10, 10], 5.5).is_err());
    }

    #[test]
    fn test_preprocess_rejects_bad_frame_split() {
        let mut t = CartesianTransform::new();
        t.setup(&[4, 4], &[4, 4], 5.5).unwrap();
        let err = t.preprocess(&full_trajectory(4), 3).unwrap_err();
        assert!(err.is_recoverable());
    }
}
