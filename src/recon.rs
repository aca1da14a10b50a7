use crate::admm::{Admm, AdmmConf, AdmmReport, IterationReport, Split};
use crate::array_utils::{spatial_dims, znorm, znorm2, COIL_DIM, MAPS_DIM, N_SPATIAL};
use crate::cg::{CgConf, ConjugateGradient};
use crate::error::{ReconError, Result};
use crate::linop::LinearOperator;
use crate::params::BpSenseParams;
use crate::preprocess::{estimate_pattern, estimate_scaling, fftmod_kspace, fftmod_maps, SamplingStats};
use crate::prox::L2BallProj;
use crate::regularizer::build_regularizer;
use crate::signal_model::EncodingOperator;
use cfl::ndarray::{ArrayD, Axis};
use cfl::num_complex::Complex32;
use log::{info, warn};
use std::sync::Arc;
use std::time::Instant;

pub struct ReconOutput {
    /// reconstructed image (x, y, z, map) in normalized units
    pub image: ArrayD<Complex32>,
    /// amplitude the k-space was divided by, 1 if scaling was skipped
    pub scaling: f32,
    pub sampling: SamplingStats,
    pub report: AdmmReport,
    /// ||y - Ax|| of the final image in normalized units
    pub data_residual: f64,
}

impl ReconOutput {
    /// the image in the units of the input k-space
    pub fn rescaled_image(&self) -> ArrayD<Complex32> {
        let s = self.scaling;
        self.image.mapv(|v| v * s)
    }
}

fn check_inputs(kspace: &ArrayD<Complex32>, maps: &ArrayD<Complex32>) -> Result<()> {
    if kspace.ndim() == 5 && kspace.shape()[MAPS_DIM] != 1 {
        return Err(ReconError::MultipleMapsInKSpace(kspace.shape()[MAPS_DIM]));
    }
    if kspace.ndim() != 4 {
        return Err(ReconError::DimensionMismatch {
            what: "k-space rank",
            expected: vec![4],
            found: vec![kspace.ndim()],
        });
    }
    if maps.ndim() != 5 {
        return Err(ReconError::DimensionMismatch {
            what: "sensitivity map rank",
            expected: vec![5],
            found: vec![maps.ndim()],
        });
    }
    for (what, shape) in [("k-space", kspace.shape()), ("sensitivity maps", maps.shape())] {
        if shape.contains(&0) {
            return Err(ReconError::DimensionMismatch {
                what,
                expected: shape.iter().map(|&d| d.max(1)).collect(),
                found: shape.to_vec(),
            });
        }
    }
    // spatial dims and coils must agree
    if kspace.shape()[0..=COIL_DIM] != maps.shape()[0..=COIL_DIM] {
        return Err(ReconError::DimensionMismatch {
            what: "k-space and sensitivity maps",
            expected: maps.shape()[0..=COIL_DIM].to_vec(),
            found: kspace.shape().to_vec(),
        });
    }
    Ok(())
}

/// Basis pursuit denoising reconstruction
///
/// `kspace` is centered k-space (x, y, z, coil), `maps` are sensitivities (x, y, z, coil, map).
/// A missing pattern is estimated from the nonzero samples of k-space. The optional `truth`
/// (x, y, z, map), given in the units of the input, is only used to report the error per
/// iteration.
pub fn bpsense_recon(
    params: &BpSenseParams,
    kspace: &ArrayD<Complex32>,
    maps: &ArrayD<Complex32>,
    pattern: Option<ArrayD<f32>>,
    truth: Option<&ArrayD<Complex32>>,
) -> Result<ReconOutput> {
    bpsense_recon_with_progress(params, kspace, maps, pattern, truth, |_| true)
}

/// [bpsense_recon] with a monitor that is called after every iteration and may return false to
/// stop early
pub fn bpsense_recon_with_progress<F>(
    params: &BpSenseParams,
    kspace: &ArrayD<Complex32>,
    maps: &ArrayD<Complex32>,
    pattern: Option<ArrayD<f32>>,
    truth: Option<&ArrayD<Complex32>>,
    monitor: F,
) -> Result<ReconOutput>
where
    F: FnMut(&IterationReport) -> bool,
{
    let now = Instant::now();
    params.validate()?;
    check_inputs(kspace, maps)?;

    let n_maps = maps.len_of(Axis(MAPS_DIM));
    if n_maps > 1 {
        info!("ESPIRiT reconstruction using {} maps", n_maps);
    }
    if params.lambda > 0. {
        info!("l2 regularization: {}", params.lambda);
    }
    info!("regularizer: {:?}, l1 weight: {}", params.regularizer, params.l1_weight);

    let image_dims = {
        let [nx, ny, nz] = spatial_dims(kspace.shape());
        vec![nx, ny, nz, n_maps]
    };

    let truth = match truth {
        Some(t) if t.shape() != image_dims.as_slice() => {
            return Err(ReconError::DimensionMismatch {
                what: "reference image",
                expected: image_dims,
                found: t.shape().to_vec(),
            });
        }
        Some(t) => {
            info!("comparing against reference image");
            Some(t)
        }
        None => None,
    };

    let pattern = match pattern {
        Some(p) => {
            if p.shape() != &kspace.shape()[0..N_SPATIAL] {
                return Err(ReconError::DimensionMismatch {
                    what: "sampling pattern",
                    expected: kspace.shape()[0..N_SPATIAL].to_vec(),
                    found: p.shape().to_vec(),
                });
            }
            p
        }
        None => estimate_pattern(kspace),
    };

    let sampling = SamplingStats::from_pattern(&pattern);
    info!("Size: {} Samples: {} Acc: {:.2}", sampling.size, sampling.samples, sampling.acceleration);

    let mut ksp = kspace.clone();
    let mut scaling = 1.;
    if params.scale_data {
        let s = estimate_scaling(kspace)?;
        info!("scaling: {:e}", s);
        if s > 0. {
            scaling = s;
            ksp.par_mapv_inplace(|v| v / s);
        } else {
            warn!("estimated scaling is zero, k-space is left unscaled");
        }
    }

    fftmod_kspace(&mut ksp);
    let mut maps = maps.clone();
    fftmod_maps(&mut maps);

    let encoding = Arc::new(EncodingOperator::new(Arc::new(maps), &pattern)?);
    let ksp = Arc::new(ksp);
    let regularizer = build_regularizer(params, &image_dims)?;

    let splits = vec![
        Split::new(regularizer.split_operator(), regularizer.prox()),
        Split::new(encoding.clone(), Arc::new(L2BallProj::new(ksp.clone(), params.eps))),
    ];
    let conf = AdmmConf {
        rho: params.rho,
        lambda: params.lambda,
        max_iter: params.max_iter,
        abs_tol: params.abs_tol,
        rel_tol: params.rel_tol,
        real_value_constraint: params.real_value_constraint,
    };
    let cg = ConjugateGradient::new(CgConf { max_iter: params.cg_max_iter, tol: params.cg_tol });

    let lambda = params.lambda as f64;
    let objective = Box::new(move |x: &ArrayD<Complex32>| regularizer.l1_norm(x) + 0.5 * lambda * znorm2(x));
    let mut admm = Admm::new(conf, splits, Box::new(cg))?.with_objective(objective);
    if let Some(t) = truth {
        admm = admm.with_truth(t.mapv(|v| v / scaling))?;
    }

    let (image, report) = admm.solve_with_progress(monitor);

    let data_residual = znorm(&(&*ksp - &encoding.forward(&image)));
    info!(
        "{:?} after {} iterations, data residual {:.4e} (eps {})",
        report.state, report.iterations, data_residual, params.eps
    );
    if let Some(e) = report.history.last().and_then(|r| r.nrmse) {
        info!("nrmse against reference: {:.4}", e);
    }
    info!("reconstruction took {} ms", now.elapsed().as_millis());

    Ok(ReconOutput { image, scaling, sampling, report, data_residual })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::admm::SolverState;
    use crate::array_utils::{nrmse, COIL_DIM};
    use crate::params::RegularizerKind;
    use crate::signal_model::simulate_kspace;
    use cfl::ndarray::{IxDyn, ShapeBuilder};

    /// piecewise constant test object (x, y, 1, 1)
    fn phantom(n: usize) -> ArrayD<Complex32> {
        ArrayD::from_shape_fn(IxDyn(&[n, n, 1, 1]).f(), |idx| {
            let (x, y) = (idx[0] as f32 - n as f32 / 2., idx[1] as f32 - n as f32 / 2.);
            let mut v = 0.;
            if x * x + y * y < (0.4 * n as f32).powi(2) {
                v += 1.;
            }
            if x.abs() < 2. && y > -3. && y < 3. {
                v += 0.5;
            }
            Complex32::new(v, 0.)
        })
    }

    fn unit_coil(n: usize) -> ArrayD<Complex32> {
        ArrayD::from_elem(IxDyn(&[n, n, 1, 1, 1]), Complex32::ONE)
    }

    /// smooth complex coil profiles (x, y, 1, coil, map)
    fn coils(n: usize, n_coils: usize, n_maps: usize) -> ArrayD<Complex32> {
        ArrayD::from_shape_fn(IxDyn(&[n, n, 1, n_coils, n_maps]).f(), |idx| {
            let t = 2. * std::f32::consts::PI * idx[COIL_DIM] as f32 / n_coils as f32;
            let (x, y) = (idx[0] as f32 / n as f32 - 0.5, idx[1] as f32 / n as f32 - 0.5);
            let mag = 1. + 0.5 * (x * t.cos() + y * t.sin());
            let phase = 0.3 * (x - y) + t;
            Complex32::from_polar(mag / (1. + idx[MAPS_DIM] as f32), phase)
        })
    }

    /// fully sampled center, every other line elsewhere
    fn undersampled(n: usize) -> ArrayD<f32> {
        ArrayD::from_shape_fn(IxDyn(&[n, n, 1]), |idx| {
            let dy = idx[1] as i64 - n as i64 / 2;
            if idx[1] % 2 == 0 || dy.abs() < 3 { 1. } else { 0. }
        })
    }

    fn test_params() -> BpSenseParams {
        BpSenseParams {
            eps: 1e-3,
            l1_weight: 0.01,
            max_iter: 100,
            min_wavelet_block: [4, 4, 1],
            rand_seed: Some(42),
            ..Default::default()
        }
    }

    #[test]
    fn fully_sampled_data_is_recovered() {
        let truth = phantom(16);
        let maps = unit_coil(16);
        let full = ArrayD::from_elem(IxDyn(&[16, 16, 1]), 1f32);
        let ksp = simulate_kspace(&truth, &maps, &full).unwrap();
        let out = bpsense_recon(&test_params(), &ksp, &maps, None, Some(&truth)).unwrap();
        assert_eq!(out.sampling.samples, 256.);
        let err = nrmse(&out.rescaled_image(), &truth);
        assert!(err < 0.05, "nrmse {}", err);
        assert!(out.report.history.iter().all(|r| r.nrmse.is_some()));
        let first = out.report.history[0].nrmse.unwrap();
        assert!(out.report.history.last().unwrap().nrmse.unwrap() < first);
    }

    #[test]
    fn default_wavelet_recon_meets_data_constraint() {
        let truth = phantom(64);
        let maps = unit_coil(64);
        let full = ArrayD::from_elem(IxDyn(&[64, 64, 1]), 1f32);
        let ksp = simulate_kspace(&truth, &maps, &full).unwrap();
        // cycle spinning is on by default; extra iterations leave room for the settled phase
        let params = BpSenseParams { rand_seed: Some(1), max_iter: 150, ..Default::default() };
        assert!(params.wavelet_rand_shift);
        let out = bpsense_recon(&params, &ksp, &maps, None, None).unwrap();

        assert!(out.report.settled_at.is_some(), "random shifts should have been fixed");
        assert!(out.report.converged(), "{:?} after {} iterations", out.report.state, out.report.iterations);
        let eps_primal = out.report.history.last().unwrap().eps_primal;
        assert!(
            out.data_residual <= params.eps as f64 + eps_primal * 1.01,
            "data residual {} with eps {} and primal tolerance {}",
            out.data_residual,
            params.eps,
            eps_primal
        );
        let err = nrmse(&out.rescaled_image(), &truth);
        assert!(err < 0.05, "nrmse {}", err);
    }

    #[test]
    fn total_variation_recovers_fully_sampled_data() {
        let truth = phantom(16);
        let maps = coils(16, 4, 1);
        let full = ArrayD::from_elem(IxDyn(&[16, 16, 1]), 1f32);
        let ksp = simulate_kspace(&truth, &maps, &full).unwrap();
        let params = BpSenseParams { regularizer: RegularizerKind::TotalVariation, ..test_params() };
        let out = bpsense_recon(&params, &ksp, &maps, Some(full), None).unwrap();
        let err = nrmse(&out.rescaled_image(), &truth);
        assert!(err < 0.05, "nrmse {}", err);
    }

    #[test]
    fn huge_eps_returns_zero_image() {
        let truth = phantom(16);
        let maps = coils(16, 2, 1);
        let ksp = simulate_kspace(&truth, &maps, &undersampled(16)).unwrap();
        let params = BpSenseParams { eps: 1e6, ..test_params() };
        let out = bpsense_recon(&params, &ksp, &maps, None, None).unwrap();
        assert_eq!(out.report.state, SolverState::Converged);
        assert_eq!(out.report.iterations, 1);
        assert!(out.image.iter().all(|v| *v == Complex32::ZERO));
    }

    #[test]
    fn no_regularization_gives_zero_filled_image() {
        let truth = phantom(16);
        let maps = unit_coil(16);
        let pattern = undersampled(16);
        let ksp = simulate_kspace(&truth, &maps, &pattern).unwrap();

        let params = BpSenseParams { l1_weight: 0., lambda: 0., ..test_params() };
        let out = bpsense_recon(&params, &ksp, &maps, Some(pattern.clone()), None).unwrap();

        let mut y = ksp.clone();
        fftmod_kspace(&mut y);
        let mut m = maps.clone();
        fftmod_maps(&mut m);
        let zero_filled = EncodingOperator::new(Arc::new(m), &pattern).unwrap().adjoint(&y);

        let err = nrmse(&out.rescaled_image(), &zero_filled);
        assert!(err < 1e-2, "nrmse against zero filled {}", err);
        assert!(nrmse(&zero_filled, &truth) > 0.05, "the pattern should alias");
    }

    #[test]
    fn real_value_constraint_gives_real_images() {
        let truth = phantom(16);
        let maps = coils(16, 3, 1);
        let ksp = simulate_kspace(&truth, &maps, &undersampled(16)).unwrap();
        let params = BpSenseParams { real_value_constraint: true, max_iter: 20, ..test_params() };
        let out = bpsense_recon(&params, &ksp, &maps, None, None).unwrap();
        assert!(out.rescaled_image().iter().all(|v| v.im.abs() <= 1e-6 * v.re.abs().max(1.)));
    }

    #[test]
    fn reconstruction_is_scale_equivariant() {
        let truth = phantom(16);
        let maps = coils(16, 3, 1);
        let ksp = simulate_kspace(&truth, &maps, &undersampled(16)).unwrap();
        let params = BpSenseParams { max_iter: 30, ..test_params() };
        let a = bpsense_recon(&params, &ksp, &maps, None, None).unwrap();
        let b = bpsense_recon(&params, &ksp.mapv(|v| v * 3.), &maps, None, None).unwrap();
        assert!((b.scaling / a.scaling - 3.).abs() < 1e-3);
        assert!(nrmse(&b.image, &a.image) < 1e-3);
        assert!(nrmse(&b.rescaled_image(), &a.rescaled_image().mapv(|v| v * 3.)) < 1e-3);
    }

    #[test]
    fn multiple_maps_add_an_image_dimension() {
        let truth = phantom(16);
        let maps = coils(16, 4, 2);
        let single = maps.slice_axis(Axis(MAPS_DIM), (0..1).into()).to_owned();
        let ksp = simulate_kspace(&truth, &single, &undersampled(16)).unwrap();
        let params = BpSenseParams { max_iter: 5, ..test_params() };
        let out = bpsense_recon(&params, &ksp, &maps, None, None).unwrap();
        assert_eq!(out.image.shape(), &[16, 16, 1, 2]);
        assert_eq!(out.report.iterations, out.report.history.len());
    }

    #[test]
    fn dimension_errors_are_fatal() {
        let maps = coils(16, 2, 1);
        let params = test_params();

        let ksp = ArrayD::zeros(IxDyn(&[16, 8, 1, 2]));
        assert!(matches!(bpsense_recon(&params, &ksp, &maps, None, None), Err(ReconError::DimensionMismatch { .. })));

        let ksp = ArrayD::zeros(IxDyn(&[16, 16, 1, 3]));
        assert!(matches!(bpsense_recon(&params, &ksp, &maps, None, None), Err(ReconError::DimensionMismatch { .. })));

        let ksp = ArrayD::zeros(IxDyn(&[16, 16, 1, 2, 2]));
        assert!(matches!(bpsense_recon(&params, &ksp, &maps, None, None), Err(ReconError::MultipleMapsInKSpace(2))));

        let empty = ArrayD::zeros(IxDyn(&[0, 16, 1, 2]));
        assert!(matches!(bpsense_recon(&params, &empty, &maps, None, None), Err(ReconError::DimensionMismatch { .. })));
        let empty_maps = ArrayD::zeros(IxDyn(&[0, 16, 1, 2, 1]));
        assert!(matches!(bpsense_recon(&params, &empty, &empty_maps, None, None), Err(ReconError::DimensionMismatch { .. })));

        let ksp = ArrayD::zeros(IxDyn(&[16, 16, 1, 2]));
        let bad_truth = ArrayD::zeros(IxDyn(&[16, 16, 1, 2]));
        assert!(matches!(bpsense_recon(&params, &ksp, &maps, None, Some(&bad_truth)), Err(ReconError::DimensionMismatch { .. })));
    }

    #[test]
    fn zero_data_is_not_scaled() {
        let maps = coils(8, 2, 1);
        let ksp = ArrayD::zeros(IxDyn(&[8, 8, 1, 2]));
        let pattern = ArrayD::from_elem(IxDyn(&[8, 8, 1]), 1f32);
        let out = bpsense_recon(&test_params(), &ksp, &maps, Some(pattern), None).unwrap();
        assert_eq!(out.scaling, 1.);
        assert!(out.image.iter().all(|v| *v == Complex32::ZERO));
    }

    #[test]
    fn monitor_stops_reconstruction() {
        let truth = phantom(16);
        let maps = unit_coil(16);
        let ksp = simulate_kspace(&truth, &maps, &undersampled(16)).unwrap();
        let out = bpsense_recon_with_progress(&test_params(), &ksp, &maps, None, None, |r| r.iteration < 2).unwrap();
        assert_eq!(out.report.state, SolverState::Aborted);
        assert_eq!(out.report.iterations, 2);
    }
}
