//! Worker registry.
//!
//! Holds the descriptors of every registered worker together with rolling
//! performance statistics. Workers are never removed while registered, only
//! deactivated.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::capability::{CapabilitySet, Category};

/// Default number of outcomes the rolling statistics cover.
pub const DEFAULT_STATS_WINDOW: usize = 50;

/// Result of one execution, fed back into the statistics.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ExecutionOutcome {
    /// Whether the execution succeeded.
    pub success: bool,
    /// How long the execution took.
    pub duration: Duration,
    /// Tokens consumed.
    pub tokens: u64,
}

impl ExecutionOutcome {
    /// A successful outcome.
    #[must_use]
    pub fn success(duration: Duration, tokens: u64) -> Self {
        Self { success: true, duration, tokens }
    }

    /// A failed outcome.
    #[must_use]
    pub fn failure(duration: Duration) -> Self {
        Self { success: false, duration, tokens: 0 }
    }
}

/// Rolling performance statistics over the most recent outcomes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerformanceStats {
    /// Share of successful outcomes; 1.0 before the first outcome.
    pub success_rate: f64,
    /// Mean latency in milliseconds.
    pub avg_latency_ms: f64,
    /// Mean tokens per execution.
    pub avg_token_cost: f64,
    /// Outcomes recorded since registration.
    pub total_executions: u64,
    #[serde(skip, default = "default_window")]
    window: usize,
    #[serde(skip)]
    recent: VecDeque<ExecutionOutcome>,
}

fn default_window() -> usize {
    DEFAULT_STATS_WINDOW
}

impl Default for PerformanceStats {
    fn default() -> Self {
        Self::with_window(DEFAULT_STATS_WINDOW)
    }
}

impl PerformanceStats {
    /// Empty statistics covering the last `window` outcomes.
    #[must_use]
    pub fn with_window(window: usize) -> Self {
        Self {
            success_rate: 1.0,
            avg_latency_ms: 0.0,
            avg_token_cost: 0.0,
            total_executions: 0,
            window: window.max(1),
            recent: VecDeque::new(),
        }
    }

    /// Outcomes currently inside the window.
    #[must_use]
    pub fn sample_count(&self) -> usize {
        self.recent.len()
    }

    /// Folds an outcome in and drops the oldest beyond the window.
    pub fn record(&mut self, outcome: ExecutionOutcome) {
        self.recent.push_back(outcome);
        while self.recent.len() > self.window {
            self.recent.pop_front();
        }
        self.total_executions += 1;

        let n = self.recent.len() as f64;
        let successes = self.recent.iter().filter(|o| o.success).count() as f64;
        self.success_rate = successes / n;
        self.avg_latency_ms = self.recent.iter().map(|o| o.duration.as_secs_f64() * 1000.0).sum::<f64>() / n;
        self.avg_token_cost = self.recent.iter().map(|o| o.tokens as f64).sum::<f64>() / n;
    }
}

/// Static description of a worker plus its live statistics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerDescriptor {
    /// Unique worker id.
    pub id: String,
    /// Display name.
    pub name: String,
    /// Declared capabilities.
    pub capabilities: CapabilitySet,
    /// Domain family.
    #[serde(default)]
    pub category: Category,
    /// Free-form specialization tags.
    #[serde(default)]
    pub specializations: Vec<String>,
    /// Backend model the worker prefers.
    #[serde(default)]
    pub preferred_model: Option<String>,
    /// Persona prompt passed to the backend.
    #[serde(default)]
    pub system_prompt: Option<String>,
    /// Whether the worker takes part in selection.
    #[serde(default = "default_active")]
    pub active: bool,
    /// Rolling statistics.
    #[serde(default)]
    pub stats: PerformanceStats,
}

fn default_active() -> bool {
    true
}

impl WorkerDescriptor {
    /// An active worker with the given capabilities.
    pub fn new(id: impl Into<String>, name: impl Into<String>, capabilities: CapabilitySet) -> Self {
        let category = capabilities.iter().next().map_or(Category::General, |cap| cap.category());
        Self {
            id: id.into(),
            name: name.into(),
            capabilities,
            category,
            specializations: Vec::new(),
            preferred_model: None,
            system_prompt: None,
            active: true,
            stats: PerformanceStats::default(),
        }
    }

    /// Sets the category.
    #[must_use]
    pub fn with_category(mut self, category: Category) -> Self {
        self.category = category;
        self
    }

    /// Sets the preferred backend model.
    #[must_use]
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.preferred_model = Some(model.into());
        self
    }

    /// Sets the persona prompt.
    #[must_use]
    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(prompt.into());
        self
    }

    /// Adds specialization tags.
    #[must_use]
    pub fn with_specializations<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.specializations.extend(tags.into_iter().map(Into::into));
        self
    }
}

/// Registry for managing workers.
pub struct WorkerRegistry {
    /// Map of worker ID to descriptor.
    workers: Arc<RwLock<HashMap<String, WorkerDescriptor>>>,
}

impl fmt::Debug for WorkerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerRegistry")
            .field("worker_count", &self.workers.try_read().map(|w| w.len()).unwrap_or(0))
            .finish_non_exhaustive()
    }
}

impl Default for WorkerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl WorkerRegistry {
    /// Creates a new empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self { workers: Arc::new(RwLock::new(HashMap::new())) }
    }

    /// Registers a worker.
    ///
    /// # Returns
    /// `true` if the worker was newly registered, `false` if it replaced an
    /// existing descriptor (whose statistics are kept).
    pub async fn register(&self, mut worker: WorkerDescriptor) -> bool {
        let id = worker.id.clone();
        let mut workers = self.workers.write().await;

        let was_new = match workers.get(&id) {
            Some(existing) => {
                worker.stats = existing.stats.clone();
                warn!(worker_id = %id, "Worker descriptor replaced in registry");
                false
            }
            None => {
                info!(worker_id = %id, capabilities = %worker.capabilities, "Registered worker");
                true
            }
        };
        workers.insert(id, worker);
        was_new
    }

    /// Retrieves a worker by ID.
    pub async fn get(&self, id: &str) -> Option<WorkerDescriptor> {
        self.workers.read().await.get(id).cloned()
    }

    /// All workers, sorted by id.
    pub async fn list(&self) -> Vec<WorkerDescriptor> {
        let workers = self.workers.read().await;
        let mut list: Vec<WorkerDescriptor> = workers.values().cloned().collect();
        list.sort_by(|a, b| a.id.cmp(&b.id));
        list
    }

    /// Active workers, sorted by id.
    pub async fn active(&self) -> Vec<WorkerDescriptor> {
        let mut list = self.list().await;
        list.retain(|w| w.active);
        list
    }

    /// Marks a worker active or inactive.
    ///
    /// # Returns
    /// `false` if the worker is unknown.
    pub async fn set_active(&self, id: &str, active: bool) -> bool {
        let mut workers = self.workers.write().await;
        match workers.get_mut(id) {
            Some(worker) => {
                worker.active = active;
                info!(worker_id = %id, active, "Worker activity changed");
                true
            }
            None => {
                warn!(worker_id = %id, "Attempted to change activity of unknown worker");
                false
            }
        }
    }

    /// Folds an execution outcome into a worker's statistics.
    ///
    /// # Returns
    /// `false` if the worker is unknown.
    pub async fn record_outcome(&self, id: &str, outcome: ExecutionOutcome) -> bool {
        let mut workers = self.workers.write().await;
        let Some(worker) = workers.get_mut(id) else {
            warn!(worker_id = %id, "Outcome recorded for unknown worker");
            return false;
        };
        worker.stats.record(outcome);
        debug!(
            worker_id = %id,
            success = outcome.success,
            success_rate = worker.stats.success_rate,
            avg_latency_ms = worker.stats.avg_latency_ms,
            "Recorded worker outcome"
        );
        true
    }

    /// Number of registered workers.
    pub async fn count(&self) -> usize {
        self.workers.read().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::Capability;

    fn worker(id: &str) -> WorkerDescriptor {
        WorkerDescriptor::new(id, id.to_uppercase(), CapabilitySet::empty().with(Capability::Research))
    }

    #[test]
    fn test_stats_roll_over_window() {
        let mut stats = PerformanceStats::with_window(3);
        stats.record(ExecutionOutcome::failure(Duration::from_millis(100)));
        stats.record(ExecutionOutcome::success(Duration::from_millis(200), 10));
        stats.record(ExecutionOutcome::success(Duration::from_millis(300), 20));
        assert!((stats.success_rate - 2.0 / 3.0).abs() < 1e-9);

        stats.record(ExecutionOutcome::success(Duration::from_millis(400), 30));
        assert_eq!(stats.sample_count(), 3);
        assert_eq!(stats.total_executions, 4);
        assert!((stats.success_rate - 1.0).abs() < f64::EPSILON);
        assert!((stats.avg_latency_ms - 300.0).abs() < 1e-9);
        assert!((stats.avg_token_cost - 20.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_register_and_replace_keeps_stats() {
        let registry = WorkerRegistry::new();
        assert!(registry.register(worker("a")).await);
        registry.record_outcome("a", ExecutionOutcome::failure(Duration::from_millis(5))).await;

        assert!(!registry.register(worker("a").with_model("large")).await);
        let stored = registry.get("a").await.unwrap();
        assert_eq!(stored.preferred_model.as_deref(), Some("large"));
        assert_eq!(stored.stats.total_executions, 1);
        assert_eq!(registry.count().await, 1);
    }

    #[tokio::test]
    async fn test_deactivated_workers_leave_active_list() {
        let registry = WorkerRegistry::new();
        registry.register(worker("b")).await;
        registry.register(worker("a")).await;
        assert!(registry.set_active("b", false).await);
        assert!(!registry.set_active("ghost", false).await);

        let active: Vec<String> = registry.active().await.into_iter().map(|w| w.id).collect();
        assert_eq!(active, vec!["a".to_string()]);
        assert_eq!(registry.list().await.len(), 2);
    }

    #[tokio::test]
    async fn test_outcome_for_unknown_worker() {
        let registry = WorkerRegistry::new();
        assert!(!registry.record_outcome("nobody", ExecutionOutcome::failure(Duration::ZERO)).await);
    }
}
