use std::path::PathBuf;
use thiserror::Error;

/// Errors raised while setting up or running a reconstruction. Everything here is fatal and
/// reported before the solver starts; numerical trouble during iteration is reported through
/// [crate::admm::AdmmReport] instead.
#[derive(Debug, Error)]
pub enum ReconError {
    #[error("dimensions of {what} do not match: expected {expected:?}, found {found:?}")]
    DimensionMismatch {
        what: &'static str,
        expected: Vec<usize>,
        found: Vec<usize>,
    },

    #[error("k-space must not have more than one map, found {0}")]
    MultipleMapsInKSpace(usize),

    #[error("invalid parameter {name}: {reason}")]
    InvalidParameter {
        name: &'static str,
        reason: String,
    },

    #[error("invalid sampling pattern: {0}")]
    InvalidPattern(String),

    #[error("cannot chain operators: codomain {codomain:?} does not match domain {domain:?}")]
    OperatorMismatch {
        codomain: Vec<usize>,
        domain: Vec<usize>,
    },

    #[error("compute backend unavailable: {0}")]
    BackendUnavailable(String),

    #[error("failed to build thread pool: {0}")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),

    #[error("i/o error on {}: {message}", .path.display())]
    Io {
        path: PathBuf,
        message: String,
    },

    #[error("failed to parse parameter file: {0}")]
    ParamsParse(#[from] toml::de::Error),

    #[error("failed to serialize parameters: {0}")]
    ParamsSerialize(#[from] toml::ser::Error),

    #[error("failed to write iteration history: {0}")]
    History(#[from] serde_json::Error),
}

impl ReconError {
    pub(crate) fn invalid(name: &'static str, reason: impl Into<String>) -> Self {
        ReconError::InvalidParameter { name, reason: reason.into() }
    }

    pub(crate) fn io(path: impl Into<PathBuf>, message: impl ToString) -> Self {
        ReconError::Io { path: path.into(), message: message.to_string() }
    }
}

pub type Result<T> = std::result::Result<T, ReconError>;
