use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use keepalive_service::computation::{ComputationOptions, Computed};
use keepalive_service::services::SharedServices;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

pub type StressComputed = Computed<u64>;

#[derive(Debug, Deserialize, Serialize)]
pub struct WorkloadsConfig {
    pub workloads: Vec<Workload>,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct Workload {
    pub concurrency: usize,
    /// The number of distinct computations being used.
    pub computations: usize,
    /// Invalidate the used computation on every n-th operation.
    #[serde(default = "default_invalidate_every")]
    pub invalidate_every: u64,
    /// Drop the pin of the used computation on every n-th operation.
    #[serde(default)]
    pub cancel_every: Option<u64>,
    /// Overrides the `defaults` of the service config.
    #[serde(default)]
    pub options: Option<ComputationOptions>,
}

fn default_invalidate_every() -> u64 {
    100
}

/// A fixed number of slots, each holding the current computation for that slot.
///
/// Invalidated computations are replaced by fresh ones.
pub struct ComputationPool {
    options: ComputationOptions,
    slots: Vec<Mutex<Arc<StressComputed>>>,
}

impl ComputationPool {
    pub fn new(size: usize, options: ComputationOptions) -> Self {
        let slots = (0..size.max(1))
            .map(|_| Mutex::new(Arc::new(Computed::new(options, 0))))
            .collect();
        Self { options, slots }
    }

    fn pick(&self) -> (usize, Arc<StressComputed>) {
        let idx = rand::rng().random_range(0..self.slots.len());
        let computed = Arc::clone(&self.slots[idx].lock().unwrap());
        (idx, computed)
    }

    fn replace(&self, idx: usize, value: u64) {
        *self.slots[idx].lock().unwrap() = Arc::new(Computed::new(self.options, value));
    }
}

pub struct PreparedWorkload {
    pub pool: ComputationPool,
    pub invalidate_every: u64,
    pub cancel_every: Option<u64>,
    operations: AtomicU64,
}

pub fn prepare_workload(workload: &Workload, defaults: ComputationOptions) -> PreparedWorkload {
    let options = workload.options.unwrap_or(defaults);
    PreparedWorkload {
        pool: ComputationPool::new(workload.computations, options),
        invalidate_every: workload.invalidate_every.max(1),
        cancel_every: workload.cancel_every.filter(|n| *n > 0),
        operations: AtomicU64::new(0),
    }
}

/// Uses one random computation of the workload, the way a cache hit would.
pub async fn process_operation(
    services: &SharedServices<StressComputed>,
    workload: &PreparedWorkload,
) {
    let op = workload.operations.fetch_add(1, Ordering::Relaxed) + 1;
    let (idx, computed) = workload.pool.pick();

    services.keep_alive(&computed);
    if !computed.has_output() {
        // the output was released, so "recompute" it
        computed.set_output(op);
    }

    if workload.cancel_every.is_some_and(|n| op % n == 0) {
        services.cancel_keep_alive(&computed);
    }

    if op % workload.invalidate_every == 0 {
        let wait = services.when_invalidated(&*computed, CancellationToken::new());
        computed.invalidate();
        workload.pool.replace(idx, op);
        if let Err(error) = wait.await {
            tracing::error!(%error, "invalidation wait failed");
        }
    }
}
