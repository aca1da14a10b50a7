use crate::fftshift::{fftmod, PhaseShiftDir};
use cfl::ndarray::{ArrayD, Axis, Zip};
use cfl::num_complex::Complex32;
use rustfft::FftPlanner;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FftDirection {
    Forward,
    Inverse,
}

impl From<FftDirection> for rustfft::FftDirection {
    fn from(dir: FftDirection) -> Self {
        match dir {
            FftDirection::Forward => rustfft::FftDirection::Forward,
            FftDirection::Inverse => rustfft::FftDirection::Inverse,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NormalizationType {
    None,
    Inverse,
    Unitary,
}

impl Default for NormalizationType {
    fn default() -> Self {
        NormalizationType::Inverse
    }
}

/// Performs an in-place multi-dimensional fft over the given axes. Every 1-D line along an axis
/// is transformed independently and in parallel, so any memory layout is supported. Axes of
/// length 1 are skipped.
pub fn fftn(x: &mut ArrayD<Complex32>, axes: &[usize], direction: FftDirection, norm: NormalizationType) {
    let mut planner = FftPlanner::<f32>::new();
    let mut n_total = 1usize;

    for &ax in axes {
        assert!(ax < x.ndim(), "fft axis {} out of range for rank {}", ax, x.ndim());
        let n = x.len_of(Axis(ax));
        n_total *= n;
        if n == 1 {
            continue;
        }
        let fft = planner.plan_fft(n, direction.into());
        Zip::from(x.lanes_mut(Axis(ax))).par_for_each(|mut lane| {
            if let Some(s) = lane.as_slice_mut() {
                fft.process(s);
                return;
            }
            let mut buf = lane.to_vec();
            fft.process(&mut buf);
            lane.iter_mut().zip(buf).for_each(|(a, b)| *a = b);
        });
    }

    let normalization = match norm {
        NormalizationType::Inverse => {
            if let FftDirection::Inverse = direction {
                Some((1. / n_total as f64) as f32)
            } else {
                None
            }
        }
        NormalizationType::Unitary => Some((1. / (n_total as f64).sqrt()) as f32),
        NormalizationType::None => None,
    };

    if let Some(scale_factor) = normalization {
        x.par_mapv_inplace(|v| v * scale_factor);
    }
}

/// unitary forward fft (DC sample first)
pub fn fftu(x: &mut ArrayD<Complex32>, axes: &[usize]) {
    fftn(x, axes, FftDirection::Forward, NormalizationType::Unitary);
}

/// unitary inverse fft (DC sample first)
pub fn ifftu(x: &mut ArrayD<Complex32>, axes: &[usize]) {
    fftn(x, axes, FftDirection::Inverse, NormalizationType::Unitary);
}

/// unitary forward centered fast fourier transform
pub fn fftc(x: &mut ArrayD<Complex32>, axes: &[usize]) {
    fftmod(x, axes, PhaseShiftDir::Inverse);
    fftu(x, axes);
    fftmod(x, axes, PhaseShiftDir::Forward);
}

/// unitary inverse centered fast fourier transform
pub fn ifftc(x: &mut ArrayD<Complex32>, axes: &[usize]) {
    fftmod(x, axes, PhaseShiftDir::Inverse);
    ifftu(x, axes);
    fftmod(x, axes, PhaseShiftDir::Forward);
}
