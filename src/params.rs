use crate::error::{ReconError, Result};
use clap::Parser;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RegularizerKind {
    Wavelet,
    TotalVariation,
}

/// Solver settings. Written as toml by `bpsense-params` and read by `bpsense --recon-params`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BpSenseParams {
    /// radius of the data consistency ball ||y - Ax|| <= eps, in normalized units
    pub eps: f32,
    /// l2 (Tikhonov) weight
    pub lambda: f32,
    /// weight of the l1 term
    pub l1_weight: f32,
    /// ADMM penalty
    pub rho: f32,
    pub max_iter: usize,
    pub cg_max_iter: usize,
    pub cg_tol: f64,
    pub abs_tol: f64,
    pub rel_tol: f64,
    pub real_value_constraint: bool,
    pub regularizer: RegularizerKind,
    /// smallest wavelet block per spatial axis
    pub min_wavelet_block: [usize; 3],
    /// random cycle spinning of the wavelet threshold
    pub wavelet_rand_shift: bool,
    pub rand_seed: Option<u64>,
    /// normalize k-space by the estimated amplitude before solving
    pub scale_data: bool,
    pub accelerator: bool,
    /// worker threads, all cores if unset
    pub n_threads: Option<usize>,
}

impl Default for BpSenseParams {
    fn default() -> Self {
        Self {
            eps: 0.01,
            lambda: 0.,
            l1_weight: 1.,
            rho: 10.,
            max_iter: 50,
            cg_max_iter: 10,
            cg_tol: 1e-3,
            abs_tol: 1e-4,
            rel_tol: 1e-3,
            real_value_constraint: false,
            regularizer: RegularizerKind::Wavelet,
            min_wavelet_block: [16, 16, 16],
            wavelet_rand_shift: true,
            rand_seed: None,
            scale_data: true,
            accelerator: false,
            n_threads: None,
        }
    }
}

fn positive(name: &'static str, value: f64) -> Result<()> {
    if value > 0. && value.is_finite() {
        Ok(())
    } else {
        Err(ReconError::invalid(name, format!("must be positive and finite, got {}", value)))
    }
}

fn non_negative(name: &'static str, value: f64) -> Result<()> {
    if value >= 0. && value.is_finite() {
        Ok(())
    } else {
        Err(ReconError::invalid(name, format!("must be non-negative and finite, got {}", value)))
    }
}

impl BpSenseParams {
    pub fn validate(&self) -> Result<()> {
        positive("eps", self.eps as f64)?;
        positive("rho", self.rho as f64)?;
        non_negative("lambda", self.lambda as f64)?;
        non_negative("l1_weight", self.l1_weight as f64)?;
        positive("cg_tol", self.cg_tol)?;
        non_negative("abs_tol", self.abs_tol)?;
        non_negative("rel_tol", self.rel_tol)?;
        if self.max_iter == 0 {
            return Err(ReconError::invalid("max_iter", "must be at least 1"));
        }
        if self.cg_max_iter == 0 {
            return Err(ReconError::invalid("cg_max_iter", "must be at least 1"));
        }
        if self.min_wavelet_block.iter().any(|&b| b == 0) {
            return Err(ReconError::invalid("min_wavelet_block", format!("block sizes must be positive, got {:?}", self.min_wavelet_block)));
        }
        if self.n_threads == Some(0) {
            return Err(ReconError::invalid("n_threads", "must be at least 1"));
        }
        Ok(())
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().with_extension("toml");
        let mut toml_str = String::new();
        File::open(&path)
            .and_then(|mut f| f.read_to_string(&mut toml_str))
            .map_err(|e| ReconError::io(&path, e))?;
        Ok(toml::from_str(&toml_str)?)
    }

    /// writes the parameters as toml, returning the file name used
    pub fn to_file(&self, path: impl AsRef<Path>) -> Result<PathBuf> {
        let mut toml_string = toml::to_string(self)?;
        toml_string.push('\n');
        let filename = path.as_ref().with_extension("toml");
        File::create(&filename)
            .and_then(|mut f| f.write_all(toml_string.as_bytes()))
            .map_err(|e| ReconError::io(&filename, e))?;
        Ok(filename)
    }
}

/// Basis pursuit denoising reconstruction with SENSE/ESPIRiT coil sensitivities
#[derive(Debug, Parser)]
#[command(name = "bpsense", version)]
pub struct DataSetParams {
    /// k-space cfl (x, y, z, coil)
    pub kspace: PathBuf,
    /// sensitivity map cfl (x, y, z, coil, map)
    pub sens_maps: PathBuf,
    /// output image cfl (x, y, z, map)
    pub output: PathBuf,
    /// data consistency tolerance
    #[arg(short = 'e', long)]
    pub eps: Option<f32>,
    /// l2 regularization weight
    #[arg(short = 'r', long)]
    pub lambda: Option<f32>,
    /// ADMM penalty
    #[arg(short = 'u', long)]
    pub rho: Option<f32>,
    /// maximum number of ADMM iterations
    #[arg(short = 'i', long)]
    pub max_iter: Option<usize>,
    /// constrain the image to be real valued
    #[arg(short = 'c', long)]
    pub real_value_constraint: bool,
    /// use total variation instead of wavelets
    #[arg(short = 't', long)]
    pub tv: bool,
    /// run on the accelerator
    #[arg(short = 'g', long)]
    pub accelerator: bool,
    /// sampling pattern cfl (x, y, z), estimated from k-space if absent
    #[arg(short = 'p', long)]
    pub pattern: Option<PathBuf>,
    /// reference image cfl used to report the error per iteration
    #[arg(short = 'F', long)]
    pub truth: Option<PathBuf>,
    /// toml parameter file (see bpsense-params)
    #[arg(long)]
    pub recon_params: Option<PathBuf>,
    /// number of worker threads
    #[arg(long)]
    pub threads: Option<usize>,
    /// seed for the wavelet shifts
    #[arg(long)]
    pub seed: Option<u64>,
    /// write the iteration history as json
    #[arg(long)]
    pub history: Option<PathBuf>,
}

impl DataSetParams {
    /// Loads the parameter file if one was given and applies the command line overrides
    pub fn resolve_params(&self) -> Result<BpSenseParams> {
        let mut params = match &self.recon_params {
            Some(path) => BpSenseParams::from_file(path)?,
            None => BpSenseParams::default(),
        };
        if let Some(eps) = self.eps {
            params.eps = eps;
        }
        if let Some(lambda) = self.lambda {
            params.lambda = lambda;
        }
        if let Some(rho) = self.rho {
            params.rho = rho;
        }
        if let Some(max_iter) = self.max_iter {
            params.max_iter = max_iter;
        }
        if self.real_value_constraint {
            params.real_value_constraint = true;
        }
        if self.tv {
            params.regularizer = RegularizerKind::TotalVariation;
        }
        if self.accelerator {
            params.accelerator = true;
        }
        if self.threads.is_some() {
            params.n_threads = self.threads;
        }
        if self.seed.is_some() {
            params.rand_seed = self.seed;
        }
        params.validate()?;
        Ok(params)
    }
}
