use crate::error::{ReconError, Result};
use crate::params::BpSenseParams;
use log::info;
use rayon::{ThreadPool, ThreadPoolBuilder};

/// Execution backend chosen once at startup. Operators and solvers are backend agnostic: all of
/// their data parallel work runs on whichever rayon pool the solve is installed into.
pub struct ComputeBackend {
    pool: ThreadPool,
}

impl ComputeBackend {
    /// Fails immediately if the accelerator is requested, since this build carries no accelerator
    /// implementation
    pub fn new(accelerator: bool, n_threads: Option<usize>) -> Result<Self> {
        if accelerator {
            return Err(ReconError::BackendUnavailable(
                "no accelerator support in this build, run without -g to use the cpu".to_string(),
            ));
        }
        let mut builder = ThreadPoolBuilder::new().thread_name(|i| format!("bpsense-{}", i));
        if let Some(n) = n_threads {
            builder = builder.num_threads(n);
        }
        let pool = builder.build()?;
        info!("cpu backend with {} threads", pool.current_num_threads());
        Ok(Self { pool })
    }

    pub fn from_params(params: &BpSenseParams) -> Result<Self> {
        Self::new(params.accelerator, params.n_threads)
    }

    pub fn n_threads(&self) -> usize {
        self.pool.current_num_threads()
    }

    /// runs `op` with all parallel work confined to this backend
    pub fn install<R, F>(&self, op: F) -> R
    where
        F: FnOnce() -> R + Send,
        R: Send,
    {
        self.pool.install(op)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rayon::prelude::*;

    #[test]
    fn accelerator_is_unavailable() {
        assert!(matches!(ComputeBackend::new(true, None), Err(ReconError::BackendUnavailable(_))));
        let mut params = BpSenseParams::default();
        params.accelerator = true;
        assert!(ComputeBackend::from_params(&params).is_err());
    }

    #[test]
    fn cpu_pool_runs_parallel_work() {
        let backend = ComputeBackend::new(false, Some(2)).unwrap();
        assert_eq!(backend.n_threads(), 2);
        let (sum, threads) = backend.install(|| ((0..1000u64).into_par_iter().sum::<u64>(), rayon::current_num_threads()));
        assert_eq!(sum, 499500);
        assert_eq!(threads, 2);
    }
}
