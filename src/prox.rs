//! Proximal operators used by the ADMM splits
//!
//! A proximal operator of a function f with step size mu returns
//! `argmin_z f(z) + 1/(2 mu) ||z - v||^2`.

use crate::array_utils::znorm;
use cfl::ndarray::{ArrayD, Axis, Zip};
use cfl::num_complex::Complex32;
use std::sync::Arc;

pub trait ProximalOperator: Send + Sync {
    fn apply(&self, mu: f32, v: &ArrayD<Complex32>) -> ArrayD<Complex32>;

    /// Stops any randomization between calls, so that `apply` becomes a fixed map. Returns true
    /// if the operator changed.
    fn settle(&self) -> bool {
        false
    }
}

/// complex soft-threshold: shrinks the magnitude by t and keeps the phase
#[inline(always)]
pub fn soft_thresh(x: Complex32, t: f32) -> Complex32 {
    let mag = x.norm();
    if mag <= t {
        Complex32::ZERO
    } else {
        x * ((mag - t) / mag)
    }
}

pub fn soft_thresh_inplace(x: &mut ArrayD<Complex32>, t: f32) {
    x.par_mapv_inplace(|v| soft_thresh(v, t));
}

/// Joint soft-threshold of all entries along `axis`. Each lane is treated as one vector whose l2
/// norm is shrunk by t, preserving its direction.
pub fn group_soft_thresh_inplace(x: &mut ArrayD<Complex32>, axis: usize, t: f32) {
    Zip::from(x.lanes_mut(Axis(axis))).par_for_each(|mut lane| {
        let mag = lane.iter().map(|v| v.norm_sqr()).sum::<f32>().sqrt();
        if mag <= t {
            lane.fill(Complex32::ZERO);
        } else {
            let s = (mag - t) / mag;
            lane.iter_mut().for_each(|v| *v *= s);
        }
    });
}

/// Proximal operator of `lambda * ||x||_1`, or of the mixed l2-l1 norm when `joint_axis` is set
#[derive(Debug, Clone)]
pub struct SoftThresh {
    lambda: f32,
    joint_axis: Option<usize>,
}

impl SoftThresh {
    pub fn new(lambda: f32, joint_axis: Option<usize>) -> Self {
        assert!(lambda >= 0., "threshold weight must be non-negative");
        Self { lambda, joint_axis }
    }
}

impl ProximalOperator for SoftThresh {
    fn apply(&self, mu: f32, v: &ArrayD<Complex32>) -> ArrayD<Complex32> {
        let mut out = v.clone();
        let t = mu * self.lambda;
        if t > 0. {
            match self.joint_axis {
                Some(axis) => group_soft_thresh_inplace(&mut out, axis, t),
                None => soft_thresh_inplace(&mut out, t),
            }
        }
        out
    }
}

/// Projection onto the ball {v : ||v - center|| <= radius}. This is the proximal operator of the
/// ball's indicator function, so the step size has no effect.
pub struct L2BallProj {
    center: Arc<ArrayD<Complex32>>,
    radius: f32,
}

impl L2BallProj {
    pub fn new(center: Arc<ArrayD<Complex32>>, radius: f32) -> Self {
        assert!(radius >= 0., "radius must be non-negative");
        Self { center, radius }
    }
}

impl ProximalOperator for L2BallProj {
    fn apply(&self, _mu: f32, v: &ArrayD<Complex32>) -> ArrayD<Complex32> {
        assert_eq!(v.shape(), self.center.shape(), "projection requires equal shapes");
        let mut d = v - &*self.center;
        let dist = znorm(&d);
        if dist <= self.radius as f64 {
            return v.clone();
        }
        let s = (self.radius as f64 / dist) as f32;
        Zip::from(&mut d).and(&*self.center).par_for_each(|d, &c| *d = c + *d * s);
        d
    }
}
