//! Periodic orthogonal multi-level wavelet transform over the spatial axes, and the cycle-spun
//! soft-threshold built on top of it.

use crate::array_utils::{zl1norm, N_SPATIAL};
use crate::error::{ReconError, Result};
use crate::fftshift::circshift;
use crate::linop::LinearOperator;
use crate::prox::{soft_thresh_inplace, ProximalOperator};
use cfl::ndarray::{ArrayD, ArrayViewMut1, ArrayViewMutD, Axis, Slice, Zip};
use cfl::num_complex::Complex32;
use dwt::wavelet::{Wavelet, WaveletFilter, WaveletType};
use log::debug;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

/// one analysis step along a lane: lowpass into the first half, highpass into the second
fn analysis_1d(lane: &mut ArrayViewMut1<Complex32>, lo: &[f32], hi: &[f32]) {
    let m = lane.len();
    let half = m / 2;
    let src = lane.to_vec();
    for i in 0..half {
        let mut a = Complex32::ZERO;
        let mut d = Complex32::ZERO;
        for (k, (&h, &g)) in lo.iter().zip(hi).enumerate() {
            let v = src[(2 * i + k) % m];
            a += v * h;
            d += v * g;
        }
        lane[i] = a;
        lane[half + i] = d;
    }
}

/// transpose of [analysis_1d]
fn synthesis_1d(lane: &mut ArrayViewMut1<Complex32>, lo: &[f32], hi: &[f32]) {
    let m = lane.len();
    let half = m / 2;
    let src = lane.to_vec();
    lane.fill(Complex32::ZERO);
    for i in 0..half {
        let a = src[i];
        let d = src[half + i];
        for (k, (&h, &g)) in lo.iter().zip(hi).enumerate() {
            lane[(2 * i + k) % m] += a * h + d * g;
        }
    }
}

/// Multi-level Mallat decomposition stored in place (coefficients have the image shape). At each
/// level an axis is split only if the current coarse length is even and at least twice the
/// minimum block size, so the transform is orthogonal for any image size.
pub struct WaveletOp {
    dims: Vec<usize>,
    lo: Vec<f32>,
    hi: Vec<f32>,
    /// coarse block size entering each level and the axes split at that level
    levels: Vec<([usize; 3], Vec<usize>)>,
    coarse: [usize; 3],
}

impl WaveletOp {
    /// `dims` are (x, y, z, ...) with the transform acting on the first three axes only
    pub fn new(dims: &[usize], min_block: [usize; 3], wavelet_type: WaveletType) -> Result<Self> {
        if dims.len() < N_SPATIAL {
            return Err(ReconError::invalid("wavelet dims", format!("expected at least 3 dimensions, got {:?}", dims)));
        }
        if min_block.iter().any(|&b| b == 0) {
            return Err(ReconError::invalid("min_wavelet_block", "block sizes must be positive"));
        }
        let w: Wavelet<f32> = Wavelet::new(wavelet_type);
        let (lo, hi) = orthogonal_filters(w.lo_d());

        let mut size = [dims[0], dims[1], dims[2]];
        let min_size: [usize; 3] = std::array::from_fn(|i| min_block[i].min(dims[i]));
        let mut levels = vec![];
        loop {
            let split: Vec<usize> = (0..N_SPATIAL).filter(|&a| size[a] % 2 == 0 && size[a] >= 2 * min_size[a]).collect();
            if split.is_empty() {
                break;
            }
            levels.push((size, split.clone()));
            split.iter().for_each(|&a| size[a] /= 2);
        }
        debug!("wavelet decomposition of {:?}: {} levels, coarse band {:?}", &dims[0..N_SPATIAL], levels.len(), size);

        Ok(Self {
            dims: dims.to_vec(),
            lo,
            hi,
            levels,
            coarse: size,
        })
    }

    pub fn n_levels(&self) -> usize {
        self.levels.len()
    }

    /// size of the coarse (scaling) band
    pub fn coarse_size(&self) -> [usize; 3] {
        self.coarse
    }

    /// number of times each spatial axis is halved
    pub fn splits_per_axis(&self) -> [u32; 3] {
        let mut n = [0; 3];
        self.levels.iter().flat_map(|(_, axes)| axes).for_each(|&a| n[a] += 1);
        n
    }

    /// Soft-thresholds the detail coefficients in place. The coarse band is left untouched.
    pub fn threshold_details(&self, coeffs: &mut ArrayD<Complex32>, t: f32) {
        let coarse = coeffs.slice_each_axis(|ax| self.coarse_slice(ax.axis.index())).to_owned();
        soft_thresh_inplace(coeffs, t);
        coeffs.slice_each_axis_mut(|ax| self.coarse_slice(ax.axis.index())).assign(&coarse);
    }

    /// l1 norm of the detail coefficients
    pub fn detail_l1_norm(&self, coeffs: &ArrayD<Complex32>) -> f64 {
        let total = zl1norm(coeffs);
        let coarse = coeffs.slice_each_axis(|ax| self.coarse_slice(ax.axis.index()));
        total - coarse.iter().map(|v| v.norm() as f64).sum::<f64>()
    }

    fn coarse_slice(&self, axis: usize) -> Slice {
        if axis < N_SPATIAL {
            Slice::from(0..self.coarse[axis])
        } else {
            Slice::from(..)
        }
    }

    fn block_mut<'a>(x: &'a mut ArrayD<Complex32>, size: &[usize; 3]) -> ArrayViewMutD<'a, Complex32> {
        x.slice_each_axis_mut(|ax| {
            let a = ax.axis.index();
            if a < N_SPATIAL {
                Slice::from(0..size[a])
            } else {
                Slice::from(..)
            }
        })
    }
}

/// normalizes the lowpass to unit energy and derives the quadrature mirror highpass
/// g[k] = (-1)^k h[L - 1 - k]
fn orthogonal_filters(h: &[f32]) -> (Vec<f32>, Vec<f32>) {
    let energy = h.iter().map(|v| v * v).sum::<f32>().sqrt();
    let lo: Vec<f32> = h.iter().map(|v| v / energy).collect();
    let l = lo.len();
    let hi = (0..l).map(|k| if k % 2 == 0 { lo[l - 1 - k] } else { -lo[l - 1 - k] }).collect();
    (lo, hi)
}

impl LinearOperator for WaveletOp {
    fn domain(&self) -> &[usize] {
        &self.dims
    }

    fn codomain(&self) -> &[usize] {
        &self.dims
    }

    fn forward(&self, x: &ArrayD<Complex32>) -> ArrayD<Complex32> {
        assert_eq!(x.shape(), self.dims.as_slice(), "unexpected wavelet input shape");
        let mut out = x.clone();
        for (size, axes) in &self.levels {
            let mut block = Self::block_mut(&mut out, size);
            for &a in axes {
                Zip::from(block.lanes_mut(Axis(a))).par_for_each(|mut lane| analysis_1d(&mut lane, &self.lo, &self.hi));
            }
        }
        out
    }

    fn adjoint(&self, y: &ArrayD<Complex32>) -> ArrayD<Complex32> {
        assert_eq!(y.shape(), self.dims.as_slice(), "unexpected wavelet coefficient shape");
        let mut out = y.clone();
        for (size, axes) in self.levels.iter().rev() {
            let mut block = Self::block_mut(&mut out, size);
            for &a in axes.iter().rev() {
                Zip::from(block.lanes_mut(Axis(a))).par_for_each(|mut lane| synthesis_1d(&mut lane, &self.lo, &self.hi));
            }
        }
        out
    }

    fn normal(&self, x: &ArrayD<Complex32>) -> ArrayD<Complex32> {
        x.clone()
    }
}

/// Wavelet soft-threshold with optional random cycle spinning. The shift is drawn again on every
/// call and undone after reconstruction, until [ProximalOperator::settle] turns it off.
pub struct WaveletThresh {
    op: WaveletOp,
    lambda: f32,
    rand_shift: AtomicBool,
    rng: Mutex<StdRng>,
}

impl WaveletThresh {
    pub fn new(op: WaveletOp, lambda: f32, rand_shift: bool, seed: Option<u64>) -> Self {
        assert!(lambda >= 0., "threshold weight must be non-negative");
        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_os_rng(),
        };
        Self { op, lambda, rand_shift: AtomicBool::new(rand_shift), rng: Mutex::new(rng) }
    }

    pub fn transform(&self) -> &WaveletOp {
        &self.op
    }

    /// shift per spatial axis, below the decimation factor of that axis
    fn draw_shift(&self) -> [i32; 3] {
        if !self.rand_shift.load(Ordering::Relaxed) {
            return [0; 3];
        }
        let splits = self.op.splits_per_axis();
        let mut rng = self.rng.lock().expect("wavelet rng poisoned");
        std::array::from_fn(|a| rng.random_range(0..(1i32 << splits[a])))
    }
}

impl ProximalOperator for WaveletThresh {
    fn apply(&self, mu: f32, v: &ArrayD<Complex32>) -> ArrayD<Complex32> {
        let t = mu * self.lambda;
        if t <= 0. || self.op.n_levels() == 0 {
            return v.clone();
        }
        let shift = self.draw_shift();
        let mut x = v.clone();
        circshift(&mut x, &shift);
        let mut coeffs = self.op.forward(&x);
        self.op.threshold_details(&mut coeffs, t);
        let mut x = self.op.adjoint(&coeffs);
        circshift(&mut x, &shift.map(|s| -s));
        x
    }

    fn settle(&self) -> bool {
        self.rand_shift.swap(false, Ordering::Relaxed)
    }
}
