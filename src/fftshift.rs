use cfl::ndarray::{ArrayD, Axis, Slice};
use cfl::num_complex::Complex32;
use std::f64::consts::PI;

/// specifies the direction of the pi phase shift. This has the same convention as the DFT
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PhaseShiftDir {
    Forward,
    Inverse,
}

impl PhaseShiftDir {
    fn sign(&self) -> f64 {
        match self {
            PhaseShiftDir::Forward => -1.,
            PhaseShiftDir::Inverse => 1.,
        }
    }
}

#[inline]
/// returns the phase shift associated with the centered fft
fn phase_shift(index: usize, n: usize) -> f64 {
    assert!(index < n, "index out of range");
    PI * (index as f64 - (n as f64 / 2.))
}

/// Modulates an array along the given axes by the linear phase that turns an uncentered fft into
/// a centered one. For even sizes the modulation is a checkerboard of +/-1. All remaining axes
/// (coils, maps, ...) receive the same modulation, so k-space and sensitivity maps that are
/// modulated with this function stay consistent with each other.
pub fn fftmod(x: &mut ArrayD<Complex32>, axes: &[usize], direction: PhaseShiftDir) {
    let sign = direction.sign();
    let shape = x.shape().to_vec();
    for &ax in axes {
        assert!(ax < shape.len(), "fftmod axis {} out of range for rank {}", ax, shape.len());
    }

    // per-axis phase tables
    let tables: Vec<Vec<f64>> = axes.iter().map(|&ax| {
        let n = shape[ax];
        (0..n).map(|i| phase_shift(i, n)).collect()
    }).collect();

    x.indexed_iter_mut().for_each(|(idx, value)| {
        let total_shift: f64 = axes.iter().zip(&tables).map(|(&ax, t)| t[idx[ax]]).sum();
        let total_shift = (sign * total_shift).rem_euclid(2. * PI);
        *value = *value * Complex32::from_polar(1., total_shift as f32);
    });
}

fn roll_axis<T: Clone>(x: &ArrayD<T>, axis: usize, shift: i32) -> ArrayD<T> {
    let n = x.len_of(Axis(axis));
    let s = shift.rem_euclid(n as i32) as usize;
    let mut out = x.clone();
    if s == 0 {
        return out;
    }
    out.slice_axis_mut(Axis(axis), Slice::from(s..)).assign(&x.slice_axis(Axis(axis), Slice::from(..n - s)));
    out.slice_axis_mut(Axis(axis), Slice::from(..s)).assign(&x.slice_axis(Axis(axis), Slice::from(n - s..)));
    out
}

/// Circularly shifts the leading axes of an array (periodic boundary). shift[i] applies to axis i
/// such that result[c] = x[c - shift]. Axes beyond the length of shift are left alone.
pub fn circshift<T: Clone>(x: &mut ArrayD<T>, shift: &[i32]) {
    assert!(shift.len() <= x.ndim(), "the shift must not have more entries than x has dimensions");
    for (axis, &s) in shift.iter().enumerate() {
        if s.rem_euclid(x.len_of(Axis(axis)) as i32) != 0 {
            *x = roll_axis(x, axis, s);
        }
    }
}
