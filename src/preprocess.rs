//! Pattern estimation, amplitude scaling and k-space centering applied before the solver runs

use crate::array_utils::{spatial_dims, COIL_DIM, N_SPATIAL};
use crate::error::{ReconError, Result};
use crate::fft::ifftc;
use crate::fftshift::{fftmod, PhaseShiftDir};
use crate::linop::{LinearOperator, ResizeOp};
use cfl::ndarray::{ArrayD, Axis};
use cfl::num_complex::Complex32;
use serde::{Deserialize, Serialize};

/// edge length of the central k-space region used for scaling
const CALIBRATION_SIZE: usize = 20;

/// Marks every spatial location where at least one coil holds a nonzero sample
pub fn estimate_pattern(kspace: &ArrayD<Complex32>) -> ArrayD<f32> {
    kspace.map_axis(Axis(COIL_DIM), |lane| {
        if lane.iter().any(|v| *v != Complex32::ZERO) { 1. } else { 0. }
    })
}

/// Robust amplitude of the image implied by k-space (x, y, z, coil). A low resolution image is
/// computed from the central k-space block and combined over coils by root sum of squares. Its
/// 90th percentile is used unless the distribution has a heavy tail, in which case the maximum is
/// used. The value is rescaled to the amplitude of the full resolution image. Returns 0 for
/// all-zero or empty data.
pub fn estimate_scaling(kspace: &ArrayD<Complex32>) -> Result<f32> {
    if kspace.ndim() != 4 {
        return Err(ReconError::DimensionMismatch {
            what: "k-space rank",
            expected: vec![4],
            found: vec![kspace.ndim()],
        });
    }
    if kspace.is_empty() {
        return Ok(0.);
    }
    let full = spatial_dims(kspace.shape());
    let mut cal_dims = kspace.shape().to_vec();
    (0..N_SPATIAL).for_each(|a| cal_dims[a] = full[a].min(CALIBRATION_SIZE));

    let crop = ResizeOp::new(kspace.shape(), &cal_dims)?;
    let mut cal = crop.forward(kspace);
    ifftc(&mut cal, &[0, 1, 2]);

    let mut rss: Vec<f32> = cal
        .map_axis(Axis(COIL_DIM), |lane| lane.iter().map(|v| v.norm_sqr()).sum::<f32>().sqrt())
        .into_iter()
        .collect();
    rss.sort_by(|a, b| a.total_cmp(b));

    let n = rss.len();
    let max = rss[n - 1];
    if !(max > 0.) {
        return Ok(0.);
    }
    let median = rss[n / 2];
    let p90 = rss[((n as f64 * 0.9) as usize).min(n - 1)];
    let amplitude = if max - p90 < 2. * (p90 - median) { p90 } else { max };

    let n_full: usize = full.iter().product();
    let n_cal: usize = cal_dims[0..N_SPATIAL].iter().product();
    Ok(amplitude * (n_cal as f32 / n_full as f32).sqrt())
}

/// Size, number of samples and acceleration of a sampling pattern
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct SamplingStats {
    pub size: usize,
    /// squared l2 norm of the pattern, the sample count for a binary pattern
    pub samples: f64,
    pub acceleration: f64,
}

impl SamplingStats {
    pub fn from_pattern(pattern: &ArrayD<f32>) -> Self {
        let size = pattern.len();
        let samples: f64 = pattern.iter().map(|&p| (p as f64).powi(2)).sum();
        let acceleration = if samples > 0. { size as f64 / samples } else { f64::INFINITY };
        Self { size, samples, acceleration }
    }
}

/// centers k-space (x, y, z, coil) for the uncentered encoding fft
pub fn fftmod_kspace(kspace: &mut ArrayD<Complex32>) {
    fftmod(kspace, &[0, 1, 2], PhaseShiftDir::Forward);
}

/// applies the same modulation as [fftmod_kspace] to maps (x, y, z, coil, map)
pub fn fftmod_maps(maps: &mut ArrayD<Complex32>) {
    fftmod(maps, &[0, 1, 2], PhaseShiftDir::Forward);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::array_utils::{random_array, zeros};
    use cfl::ndarray::IxDyn;

    #[test]
    fn pattern_support_matches_sampled_locations() {
        let mut ksp = zeros(&[6, 5, 2, 3]);
        let sampled = [(0, 0, 0, 2), (3, 4, 1, 0), (5, 2, 0, 1), (1, 1, 1, 2)];
        for &(x, y, z, c) in &sampled {
            ksp[[x, y, z, c]] = Complex32::new(0.1, -2.);
        }
        let pattern = estimate_pattern(&ksp);
        assert_eq!(pattern.shape(), &[6, 5, 2]);
        for (idx, &p) in pattern.indexed_iter() {
            let expected = sampled.iter().any(|&(x, y, z, _)| [x, y, z] == [idx[0], idx[1], idx[2]]);
            assert_eq!(p, if expected { 1. } else { 0. }, "{:?}", idx);
        }
        let stats = SamplingStats::from_pattern(&pattern);
        assert_eq!(stats.size, 60);
        assert_eq!(stats.samples, 4.);
        assert!((stats.acceleration - 15.).abs() < 1e-6);
    }

    #[test]
    fn tiny_samples_are_detected() {
        let mut ksp = zeros(&[4, 4, 1, 2]);
        ksp[[2, 1, 0, 1]] = Complex32::new(1e-25, 0.);
        ksp[[0, 3, 0, 0]] = Complex32::new(0., -1e-30);
        let pattern = estimate_pattern(&ksp);
        assert_eq!(pattern[[2, 1, 0]], 1.);
        assert_eq!(pattern[[0, 3, 0]], 1.);
        assert_eq!(pattern.sum(), 2.);
    }

    #[test]
    fn weighted_pattern_counts_squared_norm() {
        let mut pattern = ArrayD::zeros(IxDyn(&[4, 4, 2]));
        pattern[[0, 0, 0]] = 1.;
        pattern[[1, 2, 1]] = 0.5;
        pattern[[3, 3, 0]] = 2.;
        let stats = SamplingStats::from_pattern(&pattern);
        assert_eq!(stats.size, 32);
        assert!((stats.samples - 5.25).abs() < 1e-12);
        assert!((stats.acceleration - 32. / 5.25).abs() < 1e-9);
    }

    #[test]
    fn zero_data_has_zero_scale() {
        let ksp = ArrayD::zeros(IxDyn(&[8, 8, 1, 2]));
        assert_eq!(estimate_scaling(&ksp).unwrap(), 0.);
    }

    #[test]
    fn scaling_is_homogeneous() {
        let ksp = random_array(&[24, 16, 1, 2], 1);
        let s = estimate_scaling(&ksp).unwrap();
        assert!(s > 0.);
        let s3 = estimate_scaling(&ksp.mapv(|v| v * 3.)).unwrap();
        assert!((s3 / s - 3.).abs() < 1e-4);
    }

    #[test]
    fn scaling_tracks_image_amplitude() {
        // centered k-space of a constant image of amplitude 2 seen by a single unit coil
        let dims = [32, 32, 1, 1];
        let mut ksp = zeros(&dims);
        ksp[[16, 16, 0, 0]] = Complex32::new(2. * 32., 0.);
        let s = estimate_scaling(&ksp).unwrap();
        assert!((s - 2.).abs() < 1e-3, "scale was {}", s);
    }

    #[test]
    fn empty_kspace_has_zero_scale() {
        let ksp = ArrayD::zeros(IxDyn(&[0, 4, 1, 1]));
        assert_eq!(estimate_scaling(&ksp).unwrap(), 0.);
    }

    #[test]
    fn scaling_rejects_wrong_rank() {
        let ksp = ArrayD::zeros(IxDyn(&[8, 8, 1]));
        assert!(estimate_scaling(&ksp).is_err());
    }
}
