//! Scaled-form ADMM for problems of the form
//!
//! `min_x (lambda/2) ||x||^2 + sum_i f_i(G_i x)`
//!
//! where every f_i is only accessed through its proximal operator. Basis pursuit denoising uses
//! two splits: the sparsifying transform with an l1 prox, and the encoding operator with a
//! projection onto the data consistency ball.
//!
//! Each iteration
//! 1. solves `(lambda I + rho sum G_i^H G_i) x = rho sum G_i^H (z_i - u_i)` with an injected linear
//!    solver, warm started at the previous x, and optionally projects x onto real images
//! 2. updates `z_i = prox_i(1/rho, G_i x + u_i)`
//! 3. updates the scaled duals `u_i += G_i x - z_i`
//! 4. stops once the primal and dual residuals fall below `sqrt(dim) abs_tol + rel_tol scale`
//!
//! Randomized proximal steps (cycle-spun wavelets) keep moving z, so the primal residual levels off
//! above the tolerance. Once it has not dropped by 10% for [STALL_ITERS] iterations every prox is
//! asked to settle and the remaining iterations run with fixed proximal maps.

use crate::array_utils::{nrmse, real_projection, zaxpy, zeros, znorm, znorm2};
use crate::cg::{CgStats, LinearSolver};
use crate::error::{ReconError, Result};
use crate::linop::LinearOperator;
use crate::prox::ProximalOperator;
use cfl::ndarray::ArrayD;
use cfl::num_complex::Complex32;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// iterations without a 10% drop of the primal residual before randomized proxes are settled
pub const STALL_ITERS: usize = 5;

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct AdmmConf {
    pub rho: f32,
    pub lambda: f32,
    pub max_iter: usize,
    pub abs_tol: f64,
    pub rel_tol: f64,
    pub real_value_constraint: bool,
}

impl Default for AdmmConf {
    fn default() -> Self {
        Self {
            rho: 10.,
            lambda: 0.,
            max_iter: 50,
            abs_tol: 1e-4,
            rel_tol: 1e-3,
            real_value_constraint: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SolverState {
    Initialized,
    Iterating,
    Converged,
    MaxIterReached,
    /// stopped by the progress monitor
    Aborted,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IterationReport {
    pub iteration: usize,
    pub primal_residual: f64,
    pub dual_residual: f64,
    pub eps_primal: f64,
    pub eps_dual: f64,
    pub cg: CgStats,
    /// objective value, if an objective was attached
    pub objective: Option<f64>,
    /// normalized error against the reference image, if one was attached
    pub nrmse: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdmmReport {
    pub state: SolverState,
    pub iterations: usize,
    pub primal_residual: f64,
    pub dual_residual: f64,
    /// number of x-updates whose inner solve diverged
    pub cg_divergences: usize,
    /// iteration after which randomized proximal steps were fixed
    #[serde(default)]
    pub settled_at: Option<usize>,
    pub history: Vec<IterationReport>,
}

impl AdmmReport {
    pub fn converged(&self) -> bool {
        self.state == SolverState::Converged
    }
}

/// One term of the objective: a linear operator and the proximal operator of the function
/// applied to its output.
#[derive(Clone)]
pub struct Split {
    pub op: Arc<dyn LinearOperator>,
    pub prox: Arc<dyn ProximalOperator>,
}

impl Split {
    pub fn new(op: Arc<dyn LinearOperator>, prox: Arc<dyn ProximalOperator>) -> Self {
        Self { op, prox }
    }
}

pub type Objective = Box<dyn Fn(&ArrayD<Complex32>) -> f64 + Send + Sync>;

pub struct Admm {
    conf: AdmmConf,
    splits: Vec<Split>,
    solver: Box<dyn LinearSolver>,
    image_dims: Vec<usize>,
    objective: Option<Objective>,
    truth: Option<ArrayD<Complex32>>,
}

impl Admm {
    pub fn new(conf: AdmmConf, splits: Vec<Split>, solver: Box<dyn LinearSolver>) -> Result<Self> {
        let first = splits.first().ok_or_else(|| ReconError::invalid("splits", "at least one split is required"))?;
        let image_dims = first.op.domain().to_vec();
        for s in &splits[1..] {
            if s.op.domain() != image_dims.as_slice() {
                return Err(ReconError::DimensionMismatch {
                    what: "split operator domain",
                    expected: image_dims.clone(),
                    found: s.op.domain().to_vec(),
                });
            }
        }
        if !(conf.rho > 0.) {
            return Err(ReconError::invalid("rho", format!("must be positive, got {}", conf.rho)));
        }
        if !(conf.lambda >= 0.) {
            return Err(ReconError::invalid("lambda", format!("must be non-negative, got {}", conf.lambda)));
        }
        Ok(Self { conf, splits, solver, image_dims, objective: None, truth: None })
    }

    /// evaluates `objective` on every iterate for reporting
    pub fn with_objective(mut self, objective: Objective) -> Self {
        self.objective = Some(objective);
        self
    }

    /// compares every iterate against `truth` for reporting. This never affects the iteration.
    pub fn with_truth(mut self, truth: ArrayD<Complex32>) -> Result<Self> {
        if truth.shape() != self.image_dims.as_slice() {
            return Err(ReconError::DimensionMismatch {
                what: "reference image",
                expected: self.image_dims.clone(),
                found: truth.shape().to_vec(),
            });
        }
        self.truth = Some(truth);
        Ok(self)
    }

    pub fn solve(&self) -> (ArrayD<Complex32>, AdmmReport) {
        self.solve_with_progress(|_| true)
    }

    /// Runs the iteration from zero. `monitor` is called at the end of every iteration and may
    /// return false to stop early.
    pub fn solve_with_progress<F>(&self, mut monitor: F) -> (ArrayD<Complex32>, AdmmReport)
    where
        F: FnMut(&IterationReport) -> bool,
    {
        let rho = self.conf.rho;
        let lambda = self.conf.lambda;
        let rho_c = Complex32::new(rho, 0.);

        let mut x = zeros(&self.image_dims);
        let mut z: Vec<ArrayD<Complex32>> = self.splits.iter().map(|s| zeros(s.op.codomain())).collect();
        let mut u: Vec<ArrayD<Complex32>> = self.splits.iter().map(|s| zeros(s.op.codomain())).collect();

        let n_primal: usize = self.splits.iter().map(|s| s.op.codomain().iter().product::<usize>()).sum();
        let n_dual: usize = self.image_dims.iter().product();

        // lambda I + rho sum G^H G
        let normal = |v: &ArrayD<Complex32>| {
            let mut out = v.mapv(|a| a * lambda);
            for s in &self.splits {
                zaxpy(&mut out, rho_c, &s.op.normal(v));
            }
            out
        };

        let mut state = SolverState::Initialized;
        let mut report = AdmmReport {
            state,
            iterations: 0,
            primal_residual: 0.,
            dual_residual: 0.,
            cg_divergences: 0,
            settled_at: None,
            history: vec![],
        };
        let mut best_primal = f64::INFINITY;
        let mut stalled = 0;
        let mut settled = false;

        for it in 0..self.conf.max_iter {
            state = SolverState::Iterating;

            // x-update
            let mut rhs = zeros(&self.image_dims);
            for ((s, z), u) in self.splits.iter().zip(&z).zip(&u) {
                zaxpy(&mut rhs, rho_c, &s.op.adjoint(&(z - u)));
            }
            let cg = self.solver.solve(&normal, &rhs, &mut x);
            if self.conf.real_value_constraint {
                real_projection(&mut x);
            }
            if cg.diverged {
                report.cg_divergences += 1;
                warn!("inner linear solve diverged in iteration {} (relative residual {:.3e}), keeping the last stable iterate", it + 1, cg.residual);
            }

            // z and dual updates
            let mut r2 = 0.;
            let mut gx2 = 0.;
            let mut z2 = 0.;
            let mut dz_back = zeros(&self.image_dims);
            let mut u_back = zeros(&self.image_dims);
            for (i, s) in self.splits.iter().enumerate() {
                let gx = s.op.forward(&x);
                let z_new = s.prox.apply(1. / rho, &(&gx + &u[i]));
                let primal = &gx - &z_new;
                u[i] += &primal;
                r2 += znorm2(&primal);
                gx2 += znorm2(&gx);
                z2 += znorm2(&z_new);
                zaxpy(&mut dz_back, Complex32::ONE, &s.op.adjoint(&(&z_new - &z[i])));
                zaxpy(&mut u_back, Complex32::ONE, &s.op.adjoint(&u[i]));
                z[i] = z_new;
            }

            let primal_residual = r2.sqrt();
            let dual_residual = rho as f64 * znorm(&dz_back);
            let eps_primal = (n_primal as f64).sqrt() * self.conf.abs_tol + self.conf.rel_tol * gx2.sqrt().max(z2.sqrt());
            let eps_dual = (n_dual as f64).sqrt() * self.conf.abs_tol + self.conf.rel_tol * rho as f64 * znorm(&u_back);

            let iter_report = IterationReport {
                iteration: it + 1,
                primal_residual,
                dual_residual,
                eps_primal,
                eps_dual,
                cg,
                objective: self.objective.as_ref().map(|f| f(&x)),
                nrmse: self.truth.as_ref().map(|t| nrmse(&x, t)),
            };
            debug!(
                "iter {:3}: r = {:.4e} (eps {:.2e}), s = {:.4e} (eps {:.2e}), cg iters = {}{}",
                it + 1,
                primal_residual,
                eps_primal,
                dual_residual,
                eps_dual,
                cg.iterations,
                iter_report.nrmse.map(|e| format!(", nrmse = {:.4}", e)).unwrap_or_default()
            );

            report.iterations = it + 1;
            report.primal_residual = primal_residual;
            report.dual_residual = dual_residual;
            let keep_going = monitor(&iter_report);
            report.history.push(iter_report);

            if primal_residual <= eps_primal && dual_residual <= eps_dual {
                state = SolverState::Converged;
                break;
            }

            if !settled {
                if primal_residual < 0.9 * best_primal {
                    best_primal = primal_residual;
                    stalled = 0;
                } else {
                    stalled += 1;
                }
                if stalled >= STALL_ITERS {
                    settled = true;
                    let changed = self.splits.iter().fold(false, |acc, s| s.prox.settle() | acc);
                    if changed {
                        report.settled_at = Some(it + 1);
                        info!("primal residual stalled at {:.3e}, proximal steps are fixed from iteration {}", primal_residual, it + 2);
                    }
                }
            }
            if !keep_going {
                state = SolverState::Aborted;
                break;
            }
        }

        if state == SolverState::Iterating {
            state = SolverState::MaxIterReached;
            warn!(
                "reached the iteration limit of {} without converging (r = {:.3e}, s = {:.3e})",
                self.conf.max_iter, report.primal_residual, report.dual_residual
            );
        }
        report.state = state;
        info!("admm finished after {} iterations: {:?}", report.iterations, state);
        (x, report)
    }
}

/// progress monitor that stops the iteration once `timeout` has passed
pub fn deadline_monitor(timeout: Duration) -> impl FnMut(&IterationReport) -> bool {
    let start = Instant::now();
    move |report| {
        let keep_going = start.elapsed() < timeout;
        if !keep_going {
            warn!("time limit of {:?} reached after {} iterations", timeout, report.iteration);
        }
        keep_going
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::array_utils::random_array;
    use crate::cg::{CgConf, ConjugateGradient};
    use crate::linop::Identity;
    use crate::prox::{L2BallProj, SoftThresh};

    /// denoising with an identity measurement: min l1 * ||x||_1 s.t. ||y - x|| <= eps
    fn denoiser(y: &ArrayD<Complex32>, l1: f32, eps: f32, conf: AdmmConf) -> Admm {
        let dims = y.shape().to_vec();
        let splits = vec![
            Split::new(Arc::new(Identity::new(&dims)), Arc::new(SoftThresh::new(l1, None))),
            Split::new(Arc::new(Identity::new(&dims)), Arc::new(L2BallProj::new(Arc::new(y.clone()), eps))),
        ];
        let cg = ConjugateGradient::new(CgConf { max_iter: 10, tol: 1e-4 });
        Admm::new(conf, splits, Box::new(cg)).unwrap()
    }

    #[test]
    fn large_eps_gives_zero_image() {
        let y = random_array(&[8, 8], 1);
        let eps = znorm(&y) as f32 * 1.01;
        let (x, report) = denoiser(&y, 1., eps, AdmmConf::default()).solve();
        assert!(x.iter().all(|v| *v == Complex32::ZERO));
        assert_eq!(report.state, SolverState::Converged);
        assert_eq!(report.iterations, 1);
    }

    #[test]
    fn unregularized_solution_lands_in_the_data_ball() {
        let y = random_array(&[8, 8], 2);
        let conf = AdmmConf { max_iter: 200, ..Default::default() };
        let (x, report) = denoiser(&y, 0., 1e-3, conf).solve();
        assert!(report.converged(), "{:?}", report.state);
        assert!(nrmse(&x, &y) < 1e-2, "nrmse {}", nrmse(&x, &y));
    }

    #[test]
    fn sparse_signal_is_recovered_from_noise() {
        let dims = [16, 16];
        let mut truth = zeros(&dims);
        truth[[3, 4]] = Complex32::new(5., 0.);
        truth[[10, 12]] = Complex32::new(0., -4.);
        let noise = random_array(&dims, 3).mapv(|v| v * 0.05);
        let y = &truth + &noise;
        let eps = znorm(&noise) as f32;
        let conf = AdmmConf { max_iter: 300, ..Default::default() };
        let admm = denoiser(&y, 1., eps, conf).with_truth(truth.clone()).unwrap();
        let (x, report) = admm.solve();
        let final_err = nrmse(&x, &truth);
        assert!(final_err < nrmse(&y, &truth), "the denoised image must beat the noisy one");
        let last = report.history.last().unwrap();
        assert!((last.nrmse.unwrap() - final_err).abs() < 1e-9);
    }

    #[test]
    fn real_value_constraint_projects_iterates() {
        let y = random_array(&[6, 6], 4);
        let conf = AdmmConf { real_value_constraint: true, max_iter: 20, ..Default::default() };
        let (x, _) = denoiser(&y, 0.1, 1e-2, conf).solve();
        assert!(x.iter().all(|v| v.im == 0.));
        assert!(x.iter().any(|v| v.re != 0.));
    }

    #[test]
    fn monitor_can_abort() {
        let y = random_array(&[8, 8], 5);
        let admm = denoiser(&y, 0., 1e-6, AdmmConf::default());
        let mut calls = 0;
        let (_, report) = admm.solve_with_progress(|r| {
            calls += 1;
            r.iteration < 3
        });
        assert_eq!(report.state, SolverState::Aborted);
        assert_eq!(report.iterations, 3);
        assert_eq!(calls, 3);
        assert_eq!(report.history.len(), 3);

        let (_, report) = admm.solve_with_progress(deadline_monitor(Duration::ZERO));
        assert_eq!(report.state, SolverState::Aborted);
        assert_eq!(report.iterations, 1);
    }

    #[test]
    fn max_iterations_are_reported() {
        let y = random_array(&[8, 8], 6);
        let conf = AdmmConf { max_iter: 2, ..Default::default() };
        let (_, report) = denoiser(&y, 1., 1e-3, conf).solve();
        assert_eq!(report.state, SolverState::MaxIterReached);
        assert_eq!(report.iterations, 2);
    }

    /// soft-threshold that adds an alternating offset on every call until it is settled
    struct JitteredThresh {
        inner: SoftThresh,
        jitter: std::sync::atomic::AtomicBool,
        calls: std::sync::atomic::AtomicUsize,
    }

    impl ProximalOperator for JitteredThresh {
        fn apply(&self, mu: f32, v: &ArrayD<Complex32>) -> ArrayD<Complex32> {
            use std::sync::atomic::Ordering;
            let z = self.inner.apply(mu, v);
            if !self.jitter.load(Ordering::Relaxed) {
                return z;
            }
            let sign = if self.calls.fetch_add(1, Ordering::Relaxed) % 2 == 0 { 1. } else { -1. };
            z.mapv(|c| c + Complex32::new(0.1 * sign, 0.))
        }

        fn settle(&self) -> bool {
            self.jitter.swap(false, std::sync::atomic::Ordering::Relaxed)
        }
    }

    #[test]
    fn stalled_randomized_prox_is_settled() {
        let y = random_array(&[8, 8], 7);
        let dims = y.shape().to_vec();
        let jittered = JitteredThresh {
            inner: SoftThresh::new(0., None),
            jitter: true.into(),
            calls: 0.into(),
        };
        let splits = vec![
            Split::new(Arc::new(Identity::new(&dims)), Arc::new(jittered)),
            Split::new(Arc::new(Identity::new(&dims)), Arc::new(L2BallProj::new(Arc::new(y.clone()), 1e-3))),
        ];
        let conf = AdmmConf { max_iter: 300, ..Default::default() };
        let cg = ConjugateGradient::new(CgConf { max_iter: 10, tol: 1e-4 });
        let (x, report) = Admm::new(conf, splits, Box::new(cg)).unwrap().solve();
        let settled = report.settled_at.expect("the jitter should have been settled");
        assert!(settled >= STALL_ITERS);
        assert!(report.converged(), "{:?} after {} iterations", report.state, report.iterations);
        assert!(nrmse(&x, &y) < 1e-2, "nrmse {}", nrmse(&x, &y));
    }

    #[test]
    fn deterministic_proxes_are_never_settled() {
        let y = random_array(&[8, 8], 8);
        let conf = AdmmConf { max_iter: 40, ..Default::default() };
        let (_, report) = denoiser(&y, 1., 1e-3, conf).solve();
        assert_eq!(report.settled_at, None);
    }

    #[test]
    fn split_domains_must_agree() {
        let splits = vec![
            Split::new(Arc::new(Identity::new(&[4, 4])), Arc::new(SoftThresh::new(1., None))),
            Split::new(Arc::new(Identity::new(&[4, 2])), Arc::new(SoftThresh::new(1., None))),
        ];
        let r = Admm::new(AdmmConf::default(), splits, Box::new(ConjugateGradient::default()));
        assert!(matches!(r, Err(ReconError::DimensionMismatch { .. })));
        let r = Admm::new(AdmmConf::default(), vec![], Box::new(ConjugateGradient::default()));
        assert!(r.is_err());
    }
}
