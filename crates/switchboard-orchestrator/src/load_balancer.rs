//! Load balancer for worker selection.
//!
//! Tracks how many executions each worker currently has in flight so the
//! selector can break near-ties in favour of idle workers.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// Active-work counter per worker.
pub struct LoadBalancer {
    /// Current load per worker (number of active executions).
    worker_loads: Arc<Mutex<HashMap<String, usize>>>,
    /// Nominal concurrent executions per worker, used for utilization.
    max_concurrent_per_worker: usize,
}

impl std::fmt::Debug for LoadBalancer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoadBalancer")
            .field("max_concurrent_per_worker", &self.max_concurrent_per_worker)
            .finish_non_exhaustive()
    }
}

impl LoadBalancer {
    /// Creates a new load balancer.
    ///
    /// # Arguments
    /// * `max_concurrent_per_worker` - Nominal capacity of a worker
    #[must_use]
    pub fn new(max_concurrent_per_worker: usize) -> Self {
        Self {
            worker_loads: Arc::new(Mutex::new(HashMap::new())),
            max_concurrent_per_worker: max_concurrent_per_worker.max(1),
        }
    }

    /// Increments the load for a worker.
    pub async fn increment_load(&self, worker_id: &str) {
        let mut loads = self.worker_loads.lock().await;
        let current_load = loads.entry(worker_id.to_string()).or_insert(0);
        *current_load += 1;
        debug!(worker_id = %worker_id, load = *current_load, "Incremented worker load");
    }

    /// Decrements the load for a worker.
    pub async fn decrement_load(&self, worker_id: &str) {
        let mut loads = self.worker_loads.lock().await;
        match loads.get_mut(worker_id) {
            Some(load) if *load > 0 => {
                *load -= 1;
                debug!(worker_id = %worker_id, load = *load, "Decremented worker load");
            }
            Some(_) => warn!(worker_id = %worker_id, "Attempted to decrement load below zero"),
            None => warn!(worker_id = %worker_id, "Attempted to decrement load for unknown worker"),
        }
    }

    /// Gets the current load for a specific worker.
    pub async fn load(&self, worker_id: &str) -> usize {
        self.worker_loads.lock().await.get(worker_id).copied().unwrap_or(0)
    }

    /// Loads of the given workers, read under one lock.
    pub async fn loads_for<'a, I>(&self, worker_ids: I) -> HashMap<String, usize>
    where
        I: IntoIterator<Item = &'a str>,
    {
        let loads = self.worker_loads.lock().await;
        worker_ids
            .into_iter()
            .map(|id| (id.to_string(), loads.get(id).copied().unwrap_or(0)))
            .collect()
    }

    /// Utilization (0.0-1.0) of every worker seen so far.
    pub async fn utilization(&self) -> HashMap<String, f64> {
        let loads = self.worker_loads.lock().await;
        loads
            .iter()
            .map(|(worker_id, load)| {
                let utilization = *load as f64 / self.max_concurrent_per_worker as f64;
                (worker_id.clone(), utilization.min(1.0))
            })
            .collect()
    }
}
