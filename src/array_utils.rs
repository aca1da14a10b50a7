// Array utilities for complex-valued N-d arrays with named MRI dimensions

use cfl::ndarray::{ArrayD, IxDyn, ShapeBuilder, Zip};
use cfl::num_complex::{Complex32, Complex64};
use rayon::prelude::*;

/// readout (frequency-encoding) dimension
pub const READ_DIM: usize = 0;
/// first phase-encoding dimension
pub const PHS1_DIM: usize = 1;
/// second phase-encoding dimension
pub const PHS2_DIM: usize = 2;
/// receive coil dimension
pub const COIL_DIM: usize = 3;
/// sensitivity map set dimension (ESPIRiT maps)
pub const MAPS_DIM: usize = 4;

/// number of spatial dimensions (readout, phase1, phase2)
pub const N_SPATIAL: usize = 3;

/// returns the spatial part of an array shape
pub fn spatial_dims(shape: &[usize]) -> [usize; 3] {
    assert!(shape.len() >= N_SPATIAL, "shape must have at least 3 dimensions");
    [shape[READ_DIM], shape[PHS1_DIM], shape[PHS2_DIM]]
}

/// allocates a zero-filled complex array in column-major order
pub fn zeros(dims: &[usize]) -> ArrayD<Complex32> {
    ArrayD::zeros(IxDyn(dims).f())
}

#[inline(always)]
fn widen(x: Complex32) -> Complex64 {
    Complex64::new(x.re as f64, x.im as f64)
}

/// squared l2 norm, accumulated in double precision
pub fn znorm2(x: &ArrayD<Complex32>) -> f64 {
    match x.as_slice_memory_order() {
        Some(s) => s.par_iter().map(|v| v.norm_sqr() as f64).sum(),
        None => x.iter().map(|v| v.norm_sqr() as f64).sum(),
    }
}

/// l2 norm, accumulated in double precision
pub fn znorm(x: &ArrayD<Complex32>) -> f64 {
    znorm2(x).sqrt()
}

/// complex inner product <a, b> = sum(conj(a) * b)
pub fn zdot(a: &ArrayD<Complex32>, b: &ArrayD<Complex32>) -> Complex64 {
    assert_eq!(a.shape(), b.shape(), "inner product requires equal shapes");
    match (a.as_slice_memory_order(), b.as_slice_memory_order()) {
        (Some(sa), Some(sb)) if a.strides() == b.strides() => {
            sa.par_iter().zip(sb.par_iter()).map(|(&x, &y)| widen(x).conj() * widen(y)).sum()
        }
        _ => Zip::from(a).and(b).fold(Complex64::new(0., 0.), |acc, &x, &y| {
            acc + widen(x).conj() * widen(y)
        })
    }
}

/// y <- y + alpha * x
pub fn zaxpy(y: &mut ArrayD<Complex32>, alpha: Complex32, x: &ArrayD<Complex32>) {
    assert_eq!(y.shape(), x.shape(), "axpy requires equal shapes");
    Zip::from(y).and(x).par_for_each(|y, &x| *y += alpha * x);
}

/// y <- x + beta * y
pub fn zxpby(y: &mut ArrayD<Complex32>, x: &ArrayD<Complex32>, beta: Complex32) {
    assert_eq!(y.shape(), x.shape(), "xpby requires equal shapes");
    Zip::from(y).and(x).par_for_each(|y, &x| *y = x + beta * *y);
}

/// l1 norm (sum of magnitudes)
pub fn zl1norm(x: &ArrayD<Complex32>) -> f64 {
    x.iter().map(|v| v.norm() as f64).sum()
}

/// normalized root-mean-square error ||x - reference|| / ||reference||. Returns the plain norm
/// of the difference if the reference is all zeros.
pub fn nrmse(x: &ArrayD<Complex32>, reference: &ArrayD<Complex32>) -> f64 {
    assert_eq!(x.shape(), reference.shape(), "nrmse requires equal shapes");
    let err = Zip::from(x).and(reference).fold(0f64, |acc, &a, &b| acc + (a - b).norm_sqr() as f64);
    let ref_norm = znorm2(reference);
    if ref_norm > 0. {
        (err / ref_norm).sqrt()
    } else {
        err.sqrt()
    }
}

/// projects every sample onto the real axis, zeroing the imaginary part
pub fn real_projection(x: &mut ArrayD<Complex32>) {
    x.par_mapv_inplace(|v| Complex32::new(v.re, 0.));
}

/// column-major complex array with entries uniform in [-1, 1) + i[-1, 1), reproducible from seed
#[cfg(test)]
pub(crate) fn random_array(dims: &[usize], seed: u64) -> ArrayD<Complex32> {
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    let mut rng = StdRng::seed_from_u64(seed);
    let mut x = zeros(dims);
    x.iter_mut().for_each(|v| {
        *v = Complex32::new(rng.random_range(-1.0..1.0), rng.random_range(-1.0..1.0))
    });
    x
}
