use anyhow::{bail, Context, Error};
use log::info;

/// Proof that the process-wide worker pool has been configured, carrying its size for the numerical
/// calls that take a thread count explicitly.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ThreadBudget {
    threads: usize,
}

impl ThreadBudget {
    /// Number of worker threads
    pub fn threads(&self) -> usize {
        self.threads
    }
}

/// Configure the global rayon pool with `cpus` threads. Must be called once, before any numerical
/// work; a second call fails because the pool can no longer be resized.
pub fn init_thread_pool(cpus: usize) -> Result<ThreadBudget, Error> {
    if cpus == 0 {
        bail!("thread pool needs at least one thread");
    }
    rayon::ThreadPoolBuilder::new()
        .num_threads(cpus)
        .build_global()
        .context("configuring the global thread pool")?;
    info!("using {cpus} worker threads");
    Ok(ThreadBudget { threads: cpus })
}
