//! Conjugate gradient for Hermitian positive (semi-)definite systems given as closures

use crate::array_utils::{zaxpy, zdot, znorm, znorm2, zxpby};
use cfl::ndarray::ArrayD;
use cfl::num_complex::Complex32;
use serde::{Deserialize, Serialize};

/// residual growth over the initial residual that is treated as divergence
const DIVERGENCE_FACTOR: f64 = 1e3;

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct CgConf {
    pub max_iter: usize,
    /// stop once ||b - Ax|| <= tol * ||b||
    pub tol: f64,
}

impl Default for CgConf {
    fn default() -> Self {
        Self { max_iter: 10, tol: 1e-3 }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct CgStats {
    pub iterations: usize,
    /// relative residual ||b - Ax|| / ||b|| at exit
    pub residual: f64,
    pub converged: bool,
    /// the residual blew up or the operator was found not to be positive definite. x holds the
    /// last good iterate.
    pub diverged: bool,
}

pub trait LinearSolver: Send + Sync {
    /// solves op(x) = b, using the incoming x as the initial guess
    fn solve(&self, op: &dyn Fn(&ArrayD<Complex32>) -> ArrayD<Complex32>, b: &ArrayD<Complex32>, x: &mut ArrayD<Complex32>) -> CgStats;
}

#[derive(Debug, Clone, Default)]
pub struct ConjugateGradient {
    conf: CgConf,
}

impl ConjugateGradient {
    pub fn new(conf: CgConf) -> Self {
        Self { conf }
    }
}

impl LinearSolver for ConjugateGradient {
    fn solve(&self, op: &dyn Fn(&ArrayD<Complex32>) -> ArrayD<Complex32>, b: &ArrayD<Complex32>, x: &mut ArrayD<Complex32>) -> CgStats {
        assert_eq!(b.shape(), x.shape(), "right hand side and solution must have equal shapes");
        let b_norm = znorm(b);
        let mut stats = CgStats::default();

        if b_norm == 0. {
            x.fill(Complex32::ZERO);
            stats.converged = true;
            return stats;
        }

        // r = b - Ax
        let mut r = op(x);
        zxpby(&mut r, b, Complex32::new(-1., 0.));
        let mut rs = znorm2(&r);
        let r0 = rs.sqrt();
        stats.residual = r0 / b_norm;
        if stats.residual <= self.conf.tol {
            stats.converged = true;
            return stats;
        }

        let mut p = r.clone();
        for it in 0..self.conf.max_iter {
            let ap = op(&p);
            let pap = zdot(&p, &ap).re;
            if !(pap > 0.) || !pap.is_finite() {
                stats.diverged = true;
                break;
            }
            let alpha = (rs / pap) as f32;
            zaxpy(x, Complex32::new(alpha, 0.), &p);
            zaxpy(&mut r, Complex32::new(-alpha, 0.), &ap);
            let rs_new = znorm2(&r);

            if !rs_new.is_finite() || rs_new.sqrt() > DIVERGENCE_FACTOR * r0 {
                // roll back to the last good iterate
                zaxpy(x, Complex32::new(-alpha, 0.), &p);
                stats.diverged = true;
                break;
            }

            stats.iterations = it + 1;
            stats.residual = rs_new.sqrt() / b_norm;
            if stats.residual <= self.conf.tol {
                stats.converged = true;
                break;
            }
            let beta = (rs_new / rs) as f32;
            zxpby(&mut p, &r, Complex32::new(beta, 0.));
            rs = rs_new;
        }
        stats
    }
}
