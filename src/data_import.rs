use crate::admm::AdmmReport;
use crate::array_utils::{COIL_DIM, MAPS_DIM};
use crate::error::{ReconError, Result};
use cfl::ndarray::{ArrayD, Axis, IxDyn, ShapeBuilder};
use cfl::num_complex::Complex32;
use log::info;
use std::fs::File;
use std::io::BufWriter;
use std::path::Path;

/// reads a cfl/hdr pair
pub fn read_cfl(path: impl AsRef<Path>) -> Result<ArrayD<Complex32>> {
    let path = path.as_ref();
    cfl::to_array(path, true).map_err(|e| ReconError::io(path, format!("{:?}", e)))
}

/// Brings an array to the given rank by appending singleton axes or dropping trailing singleton
/// axes. Fails if a dropped axis is not singleton.
pub fn fit_rank<T>(mut x: ArrayD<T>, rank: usize, what: &'static str) -> Result<ArrayD<T>> {
    while x.ndim() < rank {
        let n = x.ndim();
        x = x.insert_axis(Axis(n));
    }
    if x.shape()[rank..].iter().any(|&d| d != 1) {
        let mut expected = x.shape()[..rank].to_vec();
        expected.resize(x.ndim(), 1);
        return Err(ReconError::DimensionMismatch { what, expected, found: x.shape().to_vec() });
    }
    while x.ndim() > rank {
        let n = x.ndim();
        x = x.remove_axis(Axis(n - 1));
    }
    Ok(x)
}

/// k-space (x, y, z, coil). A k-space file must not carry more than one map.
pub fn load_kspace(path: impl AsRef<Path>) -> Result<ArrayD<Complex32>> {
    let ksp = read_cfl(path)?;
    if ksp.ndim() > MAPS_DIM && ksp.shape()[MAPS_DIM] != 1 {
        return Err(ReconError::MultipleMapsInKSpace(ksp.shape()[MAPS_DIM]));
    }
    fit_rank(ksp, 4, "k-space")
}

/// sensitivity maps (x, y, z, coil, map)
pub fn load_maps(path: impl AsRef<Path>) -> Result<ArrayD<Complex32>> {
    fit_rank(read_cfl(path)?, 5, "sensitivity maps")
}

/// Real sampling pattern (x, y, z) from a complex array. Only the real part is used.
pub fn pattern_from_complex(x: ArrayD<Complex32>) -> Result<ArrayD<f32>> {
    let pattern = fit_rank(x.mapv(|v| v.re), 3, "sampling pattern")?;
    if let Some(bad) = pattern.iter().find(|&&p| !(p >= 0.) || !p.is_finite()) {
        return Err(ReconError::InvalidPattern(format!("pattern values must be finite and non-negative, found {}", bad)));
    }
    Ok(pattern)
}

pub fn load_pattern(path: impl AsRef<Path>) -> Result<ArrayD<f32>> {
    pattern_from_complex(read_cfl(path)?)
}

/// Converts an image stored as (x, y, z, 1, map) to (x, y, z, map)
pub fn image_from_file_layout(x: ArrayD<Complex32>) -> Result<ArrayD<Complex32>> {
    let x = fit_rank(x, 5, "image")?;
    if x.shape()[COIL_DIM] != 1 {
        return Err(ReconError::DimensionMismatch {
            what: "image coil dimension",
            expected: vec![1],
            found: vec![x.shape()[COIL_DIM]],
        });
    }
    Ok(x.remove_axis(Axis(COIL_DIM)))
}

/// reference image, stored like the output image
pub fn load_truth(path: impl AsRef<Path>) -> Result<ArrayD<Complex32>> {
    image_from_file_layout(read_cfl(path)?)
}

/// Writes an image (x, y, z, map) as a column-major (x, y, z, 1, map) cfl so that the map axis
/// lines up with the sensitivity maps
pub fn write_image(path: impl AsRef<Path>, image: &ArrayD<Complex32>) -> Result<()> {
    let path = path.as_ref();
    let view = image.view().insert_axis(Axis(COIL_DIM));
    let mut out = ArrayD::zeros(IxDyn(view.shape()).f());
    out.assign(&view);
    cfl::from_array(path, &out).map_err(|e| ReconError::io(path, format!("{:?}", e)))?;
    info!("wrote {:?} image to {}", image.shape(), path.display());
    Ok(())
}

/// writes the iteration history as pretty printed json
pub fn write_history(path: impl AsRef<Path>, report: &AdmmReport) -> Result<()> {
    let path = path.as_ref().with_extension("json");
    let f = File::create(&path).map_err(|e| ReconError::io(&path, e))?;
    serde_json::to_writer_pretty(BufWriter::new(f), report)?;
    info!("wrote iteration history to {}", path.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::admm::{IterationReport, SolverState};
    use crate::cg::CgStats;
    use cfl::ndarray::ArrayD;

    #[test]
    fn rank_is_fitted() {
        let x = ArrayD::<f32>::zeros(IxDyn(&[4, 3]));
        assert_eq!(fit_rank(x, 4, "x").unwrap().shape(), &[4, 3, 1, 1]);

        let x = ArrayD::<f32>::zeros(IxDyn(&[4, 3, 2, 5, 1, 1, 1]));
        assert_eq!(fit_rank(x, 4, "x").unwrap().shape(), &[4, 3, 2, 5]);

        let x = ArrayD::<f32>::zeros(IxDyn(&[4, 3, 2, 5, 2]));
        assert!(matches!(fit_rank(x, 4, "x"), Err(ReconError::DimensionMismatch { .. })));
    }

    #[test]
    fn pattern_takes_real_part_and_rejects_negatives() {
        let x = ArrayD::from_elem(IxDyn(&[4, 4, 1, 1]), Complex32::new(0.5, 3.));
        let p = pattern_from_complex(x).unwrap();
        assert_eq!(p.shape(), &[4, 4, 1]);
        assert!(p.iter().all(|&v| v == 0.5));

        let mut x = ArrayD::from_elem(IxDyn(&[4, 4, 1]), Complex32::ONE);
        x[[1, 2, 0]] = Complex32::new(-1., 0.);
        assert!(matches!(pattern_from_complex(x), Err(ReconError::InvalidPattern(_))));
    }

    #[test]
    fn image_layout_drops_coil_axis() {
        let x = ArrayD::<Complex32>::zeros(IxDyn(&[8, 8, 2, 1, 2]));
        assert_eq!(image_from_file_layout(x).unwrap().shape(), &[8, 8, 2, 2]);
        let x = ArrayD::<Complex32>::zeros(IxDyn(&[8, 8, 2, 3, 2]));
        assert!(image_from_file_layout(x).is_err());
    }

    #[test]
    fn history_is_written_as_json() {
        let report = AdmmReport {
            state: SolverState::Converged,
            iterations: 1,
            primal_residual: 0.5,
            dual_residual: 0.25,
            cg_divergences: 0,
            settled_at: Some(3),
            history: vec![IterationReport {
                iteration: 1,
                primal_residual: 0.5,
                dual_residual: 0.25,
                eps_primal: 1.,
                eps_dual: 1.,
                cg: CgStats::default(),
                objective: Some(3.),
                nrmse: None,
            }],
        };
        let path = std::env::temp_dir().join(format!("bpsense_history_{}", std::process::id()));
        write_history(&path, &report).unwrap();
        let json = std::fs::read_to_string(path.with_extension("json")).unwrap();
        let back: AdmmReport = serde_json::from_str(&json).unwrap();
        assert_eq!(back.state, SolverState::Converged);
        assert_eq!(back.history.len(), 1);
        assert_eq!(back.settled_at, Some(3));
        std::fs::remove_file(path.with_extension("json")).unwrap();
    }
}
