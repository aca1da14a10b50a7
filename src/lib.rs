pub mod admm;
pub mod array_utils;
pub mod backend;
pub mod cg;
pub mod data_import;
pub mod error;
pub mod fft;
pub mod fftshift;
pub mod linop;
pub mod params;
pub mod preprocess;
pub mod prox;
pub mod recon;
pub mod regularizer;
pub mod signal_model;
pub mod tv;
pub mod wavelet;

use crate::backend::ComputeBackend;
use crate::data_import::{load_kspace, load_maps, load_pattern, load_truth, write_history, write_image};
use log::info;

pub use crate::error::{ReconError, Result};
pub use crate::params::{BpSenseParams, DataSetParams, RegularizerKind};
pub use crate::recon::{bpsense_recon, bpsense_recon_with_progress, ReconOutput};

/// Runs a reconstruction from files. The compute backend is set up before any data is read, so a
/// missing backend fails fast.
pub fn bpsense_exec(ds_params: &DataSetParams) -> Result<ReconOutput> {
    let params = ds_params.resolve_params()?;
    let backend = ComputeBackend::from_params(&params)?;

    info!("loading data ...");
    let kspace = load_kspace(&ds_params.kspace)?;
    let maps = load_maps(&ds_params.sens_maps)?;
    let pattern = ds_params.pattern.as_ref().map(|p| load_pattern(p)).transpose()?;
    let truth = ds_params.truth.as_ref().map(|t| load_truth(t)).transpose()?;

    let output = backend.install(|| bpsense_recon(&params, &kspace, &maps, pattern, truth.as_ref()))?;

    write_image(&ds_params.output, &output.image)?;
    if let Some(history) = &ds_params.history {
        write_history(history, &output.report)?;
    }
    Ok(output)
}
