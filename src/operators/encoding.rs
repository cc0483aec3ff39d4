//! SENSE encoding operator `E = W·F·P·C`.
//!
//! `C` expands an image `[nx, ny, frames]` into coil images using the coil
//! sensitivity maps, `P` zero-pads to the oversampled grid (image centre on
//! grid index 0), `F` is the
//! transform service (deapodize, FFT, convolution onto the samples) and `W`
//! the square root of the density compensation weights. The adjoint runs
//! the same chain backwards and combines coils with the conjugate maps.

use super::transform::{
    embed_centred, extract_centred, ConvolutionDirection, NufftTransform, TransformDirection,
};
use super::{check_domain, LinearOperator};
use crate::array::{self, CArray, RArray};
use crate::error::{ReconError, Result};
use crate::job::ReconJob;
use ndarray::{Axis, Zip};

/// Oversampled grid size: at least `n`, even once oversampled.
pub fn oversampled_size(n: usize, oversampling: f64) -> usize {
    let m = (n as f64 * oversampling).ceil() as usize;
    if m <= n {
        n
    } else {
        m + m % 2
    }
}

pub struct SenseEncoding<'a> {
    csm: &'a CArray,
    sqrt_dcw: RArray,
    transform: Box<dyn NufftTransform + 'a>,
    domain: Vec<usize>,
    codomain: Vec<usize>,
    grid_dims: Vec<usize>,
    weight: f64,
}

impl<'a> SenseEncoding<'a> {
    /// Build the encoding for `job`, preparing `transform` for its trajectory.
    pub fn new(
        job: &'a ReconJob,
        mut transform: Box<dyn NufftTransform + 'a>,
        oversampling: f64,
        kernel_width: f64,
    ) -> Result<Self> {
        if !(oversampling >= 1.0) {
            return Err(ReconError::config(format!(
                "oversampling must be at least 1, got {}",
                oversampling
            )));
        }
        let n = job.matrix_size;
        let n_os = oversampled_size(n, oversampling);
        transform.setup(&[n, n], &[n_os, n_os], kernel_width)?;
        transform.preprocess(&job.trajectory, job.frames)?;

        Ok(Self {
            csm: &job.csm,
            sqrt_dcw: job.dcw.mapv(f64::sqrt),
            transform,
            domain: job.image_dims(),
            codomain: vec![job.sample_count(), job.channels()],
            grid_dims: vec![n_os, n_os, job.frames, job.channels()],
            weight: 1.0,
        })
    }

    pub fn channels(&self) -> usize {
        self.codomain[1]
    }

    /// Scale raw samples by `sqrt(dcw)` so they live in the codomain of `E`.
    pub fn weighted_samples(&self, samples: &CArray) -> Result<CArray> {
        array::check_dims(&self.codomain, samples.shape(), "samples")?;
        let mut out = samples.clone();
        for (mut row, w) in out.outer_iter_mut().zip(self.sqrt_dcw.iter()) {
            row.mapv_inplace(|v| v * *w);
        }
        Ok(out)
    }

    /// Coil expansion `[nx, ny, frames]` to `[nx, ny, frames, coils]`.
    pub fn mult_csm(&self, x: &CArray) -> CArray {
        let mut dims = self.domain.clone();
        dims.push(self.channels());
        let mut out = array::create(&dims);
        for c in 0..self.channels() {
            let map = self.csm.index_axis(Axis(2), c);
            let mut coil = out.index_axis_mut(Axis(3), c);
            for f in 0..self.domain[2] {
                Zip::from(coil.index_axis_mut(Axis(2), f))
                    .and(x.index_axis(Axis(2), f))
                    .and(&map)
                    .for_each(|o, &v, &s| *o = v * s);
            }
        }
        out
    }

    /// Coil combination `Σ_c conj(csm_c)·y_c`, summed in channel order.
    pub fn mult_csm_conj_sum(&self, y: &CArray) -> CArray {
        let mut out = array::create(&self.domain);
        for c in 0..self.channels() {
            let map = self.csm.index_axis(Axis(2), c);
            let coil = y.index_axis(Axis(3), c);
            for f in 0..self.domain[2] {
                Zip::from(out.index_axis_mut(Axis(2), f))
                    .and(coil.index_axis(Axis(2), f))
                    .and(&map)
                    .for_each(|o, &v, &s| *o += s.conj() * v);
            }
        }
        out
    }

    /// Frame-averaged, coil-combined adjoint image `[nx, ny]` normalised by
    /// `Σ|csm|²`.
    pub fn prior_image(&self, b: &CArray) -> Result<CArray> {
        let combined = self.apply_adjoint(b)?;
        let sens = array::sum_last_axis(&array::abs_square(self.csm));
        let peak = sens.iter().cloned().fold(0.0, f64::max);
        let floor = (peak * 1e-6).max(f64::MIN_POSITIVE);
        let mut averaged = array::mean_last_axis(&combined);
        Zip::from(&mut averaged)
            .and(&sens)
            .for_each(|v, &s| *v /= s.max(floor));
        Ok(averaged)
    }

    fn pad(&self, coil_images: &CArray) -> CArray {
        embed_centred(coil_images, &self.grid_dims)
    }

    fn crop(&self, grid: &CArray) -> CArray {
        extract_centred(grid, self.domain[0], self.domain[1])
    }
}

impl LinearOperator for SenseEncoding<'_> {
    fn name(&self) -> &str {
        "sense_encoding"
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

    fn codomain_dims(&self) -> &[usize] {
        &self.codomain
    }

    fn apply(&self, x: &CArray) -> Result<CArray> {
        check_domain(self.name(), &self.domain, x)?;
        let mut grid = self.pad(&self.mult_csm(x));
        self.transform.deapodize(&mut grid)?;
        self.transform.fft(&mut grid, TransformDirection::Forward)?;
        let mut samples = array::create(&self.codomain);
        self.transform.convolve(
            &mut samples,
            &mut grid,
            &self.sqrt_dcw,
            ConvolutionDirection::C2NC,
        )?;
        Ok(samples)
    }

    fn apply_adjoint(&self, y: &CArray) -> Result<CArray> {
        array::check_dims(&self.codomain, y.shape(), "sense_encoding codomain")?;
        let mut samples = y.clone();
        let mut grid = array::create(&self.grid_dims);
        self.transform.convolve(
            &mut samples,
            &mut grid,
            &self.sqrt_dcw,
            ConvolutionDirection::NC2C,
        )?;
        self.transform.fft(&mut grid, TransformDirection::Inverse)?;
        self.transform.deapodize(&mut grid)?;
        Ok(self.mult_csm_conj_sum(&self.crop(&grid)))
    }

    /// `Σ_c |csm_c|²` replicated over frames.
    fn normal_diagonal(&self) -> Option<RArray> {
        let sens = array::sum_last_axis(&array::abs_square(self.csm));
        Some(array::expand(&sens, self.domain[2]))
    }
}

#[cfg(test)]
mod tests {
    use super::super::gridding::KaiserBesselTransform;
    use super::super::transform::{CartesianTransform, MockNufftTransform};
    use super::*;
    use crate::array::{create_real, nrm2, Complex64};
    use mockall::Sequence;
    use ndarray::IxDyn;

    fn cartesian_job(n: usize, coils: usize, frames: usize) -> ReconJob {
        let mut traj = create_real(&[n * n * frames, 2]);
        for f in 0..frames {
            for i in 0..n {
                for j in 0..n {
                    let s = f * n * n + i * n + j;
                    traj[[s, 0]] = (i as f64 - (n / 2) as f64) / n as f64;
                    traj[[s, 1]] = (j as f64 - (n / 2) as f64) / n as f64;
                }
            }
        }
        let csm = CArray::from_elem(
            IxDyn(&[n, n, coils]),
            Complex64::new(1.0 / (coils as f64).sqrt(), 0.0),
        );
        ReconJob::new(
            array::create(&[n * n * frames, coils]),
            traj,
            RArray::ones(IxDyn(&[n * n * frames])),
            csm,
            frames,
        )
    }

    fn test_image(dims: &[usize]) -> CArray {
        let mut x = array::create(dims);
        for (i, v) in x.iter_mut().enumerate() {
            *v = Complex64::new((i % 5) as f64, (i % 3) as f64 - 1.0);
        }
        x
    }

    #[test]
    fn test_oversampled_size() {
        assert_eq!(oversampled_size(8, 1.0), 8);
        assert_eq!(oversampled_size(8, 1.25), 10);
        assert_eq!(oversampled_size(16, 1.25), 20);
        assert_eq!(oversampled_size(7, 1.5), 12);
    }

    #[test]
    fn test_normal_is_identity_for_full_cartesian_sampling() {
        let job = cartesian_job(4, 3, 2);
        let e = SenseEncoding::new(&job, Box::new(CartesianTransform::new()), 1.0, 5.5).unwrap();
        let x = test_image(&job.image_dims());
        let back = e.apply_adjoint(&e.apply(&x).unwrap()).unwrap();
        for (a, b) in back.iter().zip(x.iter()) {
            assert!((a - b).norm() < 1e-10);
        }
    }

    #[test]
    fn test_adjoint_inner_product_identity() {
        let job = cartesian_job(4, 2, 1);
        let e =
            SenseEncoding::new(&job, Box::new(KaiserBesselTransform::new()), 1.5, 5.5).unwrap();
        let x = test_image(e.domain_dims());
        let y = test_image(e.codomain_dims());
        let lhs = array::dot(&e.apply(&x).unwrap(), &y);
        let rhs = array::dot(&x, &e.apply_adjoint(&y).unwrap());
        assert!((lhs - rhs).norm() < 1e-9 * nrm2(&x) * nrm2(&y));
    }

    #[test]
    fn test_oversampled_gridding_matches_exact_model() {
        let job = cartesian_job(8, 2, 1);
        let exact = SenseEncoding::new(&job, Box::new(CartesianTransform::new()), 1.0, 5.5).unwrap();
        let gridded =
            SenseEncoding::new(&job, Box::new(KaiserBesselTransform::new()), 1.25, 5.5).unwrap();
        let x = test_image(&job.image_dims());

        let y = exact.apply(&x).unwrap();
        let diff = &gridded.apply(&x).unwrap() - &y;
        assert!(nrm2(&diff) < 5e-3 * nrm2(&y));

        let back = gridded.apply_adjoint(&y).unwrap();
        assert!(nrm2(&(&back - &x)) < 5e-3 * nrm2(&x));
    }

    #[test]
    fn test_coil_combination_inverts_uniform_expansion() {
        let job = cartesian_job(2, 4, 1);
        let e = SenseEncoding::new(&job, Box::new(CartesianTransform::new()), 1.0, 5.5).unwrap();
        let x = test_image(&job.image_dims());
        let combined = e.mult_csm_conj_sum(&e.mult_csm(&x));
        for (a, b) in combined.iter().zip(x.iter()) {
            assert!((a - b).norm() < 1e-12);
        }
        let diag = e.normal_diagonal().unwrap();
        assert!(diag.iter().all(|d| (d - 1.0).abs() < 1e-12));
    }

    #[test]
    fn test_prior_image_averages_frames() {
        let job = cartesian_job(4, 2, 2);
        let e = SenseEncoding::new(&job, Box::new(CartesianTransform::new()), 1.0, 5.5).unwrap();
        let mut x = array::create(&job.image_dims());
        for i in 0..4 {
            for j in 0..4 {
                x[[i, j, 0]] = Complex64::new((i + j) as f64, 0.0);
                x[[i, j, 1]] = Complex64::new((i + j) as f64 + 2.0, 1.0);
            }
        }
        let prior = e.prior_image(&e.apply(&x).unwrap()).unwrap();
        assert_eq!(prior.shape(), &[4, 4]);
        for i in 0..4 {
            for j in 0..4 {
                let expected = Complex64::new((i + j) as f64 + 1.0, 0.5);
                assert!((prior[[i, j]] - expected).norm() < 1e-10);
            }
        }
    }

    #[test]
    fn test_domain_mismatch_is_configuration_error() {
        let job = cartesian_job(4, 1, 1);
        let e = SenseEncoding::new(&job, Box::new(CartesianTransform::new()), 1.0, 5.5).unwrap();
        let err = e.apply(&array::create(&[4, 4, 2])).unwrap_err();
        assert!(matches!(err, ReconError::Configuration(_)));
    }

    #[test]
    fn test_transform_call_order() {
        let job = cartesian_job(2, 1, 1);
        let mut seq = Sequence::new();
        let mut mock = MockNufftTransform::new();
        mock.expect_setup()
            .withf(|m, os, kw| m[..] == [2, 2] && os[..] == [4, 4] && *kw == 5.5)
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _, _| Ok(()));
        mock.expect_preprocess()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| Ok(()));
        mock.expect_deapodize()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(()));
        mock.expect_fft()
            .withf(|_, dir| *dir == TransformDirection::Forward)
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| Ok(()));
        mock.expect_convolve()
            .withf(|_, _, _, dir| *dir == ConvolutionDirection::C2NC)
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _, _, _| Ok(()));

        let e = SenseEncoding::new(&job, Box::new(mock), 2.0, 5.5).unwrap();
        let y = e.apply(&array::create(&[2, 2, 1])).unwrap();
        assert_eq!(y.shape(), &[4, 1]);
    }

    #[test]
    fn test_weighted_samples_scale_rows() {
        let mut job = cartesian_job(2, 2, 1);
        job.dcw = RArray::from_shape_vec(IxDyn(&[4]), vec![4.0, 1.0, 0.25, 0.0]).unwrap();
        let e = SenseEncoding::new(&job, Box::new(CartesianTransform::new()), 1.0, 5.5).unwrap();
        let b = CArray::from_elem(IxDyn(&[4, 2]), Complex64::new(1.0, 1.0));
        let wb = e.weighted_samples(&b).unwrap();
        assert_eq!(wb[[0, 1]], Complex64::new(2.0, 2.0));
        assert_eq!(wb[[2, 0]], Complex64::new(0.5, 0.5));
        assert_eq!(wb[[3, 0]], Complex64::new(0.0, 0.0));
    }
}
