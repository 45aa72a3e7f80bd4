use std::sync::Arc;
use std::thread;

use plenum::{Runtime, RuntimeConfig};
use plenum_transport::MemoryFabric;

/// Thread-per-rank job harness: one OS thread per simulated rank, each
/// owning a [`Runtime`] over a shared in-memory fabric. Mirrors the
/// production model (one single-threaded process per rank); a panic on
/// any rank fails the test.
pub struct Cluster;

impl Cluster {
    /// Runs `body` on every rank of an ordered-delivery fabric.
    pub fn run<F>(num_ranks: u32, config: RuntimeConfig, body: F)
    where
        F: Fn(&mut Runtime) + Send + Sync + 'static,
    {
        Self::launch(MemoryFabric::new(num_ranks), num_ranks, config, body)
    }

    /// Runs `body` on every rank of a fabric that deliberately reorders
    /// delivery; nothing in the runtime may depend on message order.
    pub fn run_scrambled<F>(num_ranks: u32, config: RuntimeConfig, body: F)
    where
        F: Fn(&mut Runtime) + Send + Sync + 'static,
    {
        Self::launch(MemoryFabric::with_scramble(num_ranks), num_ranks, config, body)
    }

    fn launch<F>(fabric: MemoryFabric, num_ranks: u32, config: RuntimeConfig, body: F)
    where
        F: Fn(&mut Runtime) + Send + Sync + 'static,
    {
        let body = Arc::new(body);
        let mut handles = Vec::new();
        for rank in 0..num_ranks {
            let endpoint = fabric.endpoint(rank);
            let config = config.clone();
            let body = body.clone();
            let handle = thread::Builder::new()
                .name(format!("rank-{rank}"))
                .spawn(move || {
                    let mut runtime = Runtime::new(Box::new(endpoint), config);
                    body(&mut runtime);
                })
                .expect("spawn rank thread");
            handles.push(handle);
        }
        let mut failure = None;
        for handle in handles {
            if let Err(panic) = handle.join() {
                failure = Some(panic);
            }
        }
        if let Some(panic) = failure {
            std::panic::resume_unwind(panic);
        }
    }
}
