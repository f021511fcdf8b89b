//! Request orchestration.
//!
//! [`Orchestrator`] ties the components together: it resolves a session,
//! enriches the prompt from cached context, selects a worker, calls the
//! model backend and feeds the outcome back into the selector, the session
//! and the cache.

use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use switchboard_abstraction::{Model, ModelError, ModelParameters, ModelResponse, ModelUsage};
use switchboard_core::cache::{AdaptiveCache, CacheMaintenance, CachePriority, PutOptions};
use switchboard_core::models::{ExecutionRecord, Session, SessionPatch, TurnOutcome};
use switchboard_core::storage::SessionStore;

use crate::aggregation::{AggregatedResult, AggregationContext, AggregationStrategy, Aggregator, WorkerOutput};
use crate::capability::{CapabilitySet, PriorityTier, RequestAnalyzer, SelectionRequest};
use crate::config::OrchestratorConfig;
use crate::error::{OrchestrationError, Result};
use crate::registry::{ExecutionOutcome, WorkerDescriptor, WorkerRegistry};
use crate::selector::{CapabilitySelector, SelectionError, SelectionResult, SelectionStrategy};
use crate::session::{SessionError, SessionManager};

const ANONYMOUS_USER: &str = "anonymous";

/// Per-request options.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OrchestrationOptions {
    /// Backend model; overrides the worker's preferred model.
    #[serde(default)]
    pub model: Option<String>,
    /// Sampling temperature.
    #[serde(default)]
    pub temperature: Option<f32>,
    /// Completion token limit.
    #[serde(default)]
    pub max_tokens: Option<u32>,
    /// Priority tier, also used for the cached context.
    #[serde(default)]
    pub priority: PriorityTier,
    /// Selection strategy; `None` uses the configured default.
    #[serde(default)]
    pub strategy: Option<SelectionStrategy>,
    /// Pins the request to one worker.
    #[serde(default)]
    pub worker_id: Option<String>,
    /// Forces an aggregation strategy for multi-worker requests.
    #[serde(default)]
    pub aggregation: Option<AggregationStrategy>,
}

/// A free-text work request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrchestrationRequest {
    /// The request text.
    pub prompt: String,
    /// Requesting user.
    #[serde(default = "default_user")]
    pub user_id: String,
    /// Session to continue.
    #[serde(default)]
    pub session_id: Option<String>,
    /// Conversation the request belongs to.
    #[serde(default)]
    pub conversation_id: Option<String>,
    /// Generation and routing options.
    #[serde(default)]
    pub options: OrchestrationOptions,
}

fn default_user() -> String {
    ANONYMOUS_USER.to_string()
}

impl OrchestrationRequest {
    /// An anonymous request with default options.
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            user_id: default_user(),
            session_id: None,
            conversation_id: None,
            options: OrchestrationOptions::default(),
        }
    }

    /// Sets the requesting user.
    #[must_use]
    pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = user_id.into();
        self
    }

    /// Continues the given session.
    #[must_use]
    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    /// Attaches the request to a conversation.
    #[must_use]
    pub fn with_conversation(mut self, conversation_id: impl Into<String>) -> Self {
        self.conversation_id = Some(conversation_id.into());
        self
    }

    /// Sets the options.
    #[must_use]
    pub fn with_options(mut self, options: OrchestrationOptions) -> Self {
        self.options = options;
        self
    }
}

/// Result of a single-worker request.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OrchestrationResponse {
    /// Unique id of this request.
    pub request_id: String,
    /// Backend output.
    pub output: String,
    /// Worker that produced it.
    pub worker_id: String,
    /// Why the worker was chosen.
    pub selection_reason: String,
    /// Selection confidence.
    pub confidence: f64,
    /// Session the request ran in.
    pub session_id: String,
    /// Wall-clock time spent.
    pub elapsed_ms: u64,
    /// Token usage reported by the backend.
    pub usage: Option<ModelUsage>,
    /// Cost reported by the backend.
    pub cost_usd: f64,
}

/// Result of a multi-worker request.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MultiWorkerResponse {
    /// Unique id of this request.
    pub request_id: String,
    /// Session the request ran in.
    pub session_id: String,
    /// Combined output.
    pub result: AggregatedResult,
    /// Workers whose output was aggregated.
    pub worker_ids: Vec<String>,
    /// Workers whose backend call failed.
    pub failed_workers: Vec<String>,
    /// Wall-clock time spent.
    pub elapsed_ms: u64,
    /// Summed backend cost.
    pub cost_usd: f64,
}

/// One prior exchange kept in the context cache.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct ContextTurn {
    prompt: String,
    response: String,
    worker_id: String,
}

/// Backend call result with its bookkeeping.
struct Execution {
    selection: SelectionResult,
    worker: WorkerDescriptor,
    result: std::result::Result<ModelResponse, ModelError>,
    elapsed: Duration,
}

impl Execution {
    fn turn_outcome(&self) -> TurnOutcome {
        match &self.result {
            Ok(response) => TurnOutcome {
                worker_id: self.worker.id.clone(),
                success: true,
                tokens: response.total_tokens(),
                cost_usd: response.cost_usd,
            },
            Err(_) => TurnOutcome { worker_id: self.worker.id.clone(), success: false, tokens: 0, cost_usd: 0.0 },
        }
    }
}

fn cache_priority(tier: PriorityTier) -> CachePriority {
    match tier {
        PriorityTier::Low => CachePriority::Low,
        PriorityTier::Normal => CachePriority::Normal,
        PriorityTier::High | PriorityTier::Critical => CachePriority::High,
    }
}

fn context_key(session_id: &str) -> String {
    format!("context:{session_id}")
}

fn enrich_prompt(prompt: &str, context: &[ContextTurn]) -> String {
    if context.is_empty() {
        return prompt.to_string();
    }
    let mut enriched = String::from("Previous conversation:\n");
    for turn in context {
        enriched.push_str("User: ");
        enriched.push_str(&turn.prompt);
        enriched.push_str("\nAssistant: ");
        enriched.push_str(&turn.response);
        enriched.push('\n');
    }
    enriched.push_str("\nCurrent request:\n");
    enriched.push_str(prompt);
    enriched
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

/// Composes selection, execution, aggregation, sessions and caching.
pub struct Orchestrator {
    config: OrchestratorConfig,
    registry: Arc<WorkerRegistry>,
    selector: CapabilitySelector,
    aggregator: Aggregator,
    sessions: Arc<SessionManager>,
    cache: Arc<AdaptiveCache>,
    backend: Arc<dyn Model>,
    analyzer: RequestAnalyzer,
    maintenance: Mutex<Option<CacheMaintenance>>,
}

impl fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Orchestrator")
            .field("backend", &self.backend.model_id())
            .field("selector", &self.selector)
            .field("sessions", &self.sessions)
            .finish_non_exhaustive()
    }
}

impl Orchestrator {
    /// Creates an orchestrator.
    ///
    /// # Arguments
    /// * `config` - Component settings
    /// * `backend` - Model backend used for every worker
    /// * `store` - Durable session store
    ///
    /// # Errors
    /// Returns an error if any section of the configuration is invalid.
    pub fn new(config: OrchestratorConfig, backend: Arc<dyn Model>, store: Arc<dyn SessionStore>) -> Result<Self> {
        config.validate()?;

        let registry = Arc::new(WorkerRegistry::new());
        let selector =
            CapabilitySelector::new(Arc::clone(&registry), config.selector.clone(), config.circuit_breaker.clone());
        let aggregator = Aggregator::new(config.aggregation.clone());
        let sessions = SessionManager::new(config.session.clone(), store)?;
        let cache = Arc::new(AdaptiveCache::new(config.cache.clone())?);

        Ok(Self {
            config,
            registry,
            selector,
            aggregator,
            sessions,
            cache,
            backend,
            analyzer: RequestAnalyzer::new(),
            maintenance: Mutex::new(None),
        })
    }

    /// Starts the session sweep and the cache maintenance tasks.
    pub fn start(&self) {
        self.sessions.start_cleanup();
        let mut maintenance = self.maintenance.lock().unwrap_or_else(PoisonError::into_inner);
        if maintenance.is_none() {
            *maintenance = Some(self.cache.start_maintenance());
        }
        info!(backend = %self.backend.model_id(), "Orchestrator started");
    }

    /// Registers a worker. Returns `false` when it replaced an existing descriptor.
    pub async fn register_worker(&self, worker: WorkerDescriptor) -> bool {
        self.registry.register(worker).await
    }

    /// Resolves the session a request runs in.
    async fn resolve_session(&self, request: &OrchestrationRequest) -> Result<Session> {
        let mut existing = None;
        if let Some(id) = &request.session_id {
            match self.sessions.get_session(id).await {
                Ok(session) if session.is_active() => existing = Some(session),
                Ok(session) => debug!(session_id = %id, status = %session.status, "Requested session has ended"),
                Err(SessionError::SessionNotFound(_)) => debug!(session_id = %id, "Requested session is unknown"),
                Err(e) => return Err(e.into()),
            }
        }
        let session = match existing {
            Some(session) => session,
            None => {
                self.sessions
                    .get_or_create_session(&request.user_id, request.conversation_id.as_deref(), &request.prompt)
                    .await?
            }
        };

        if let Some(budget) = session.exhausted_budget() {
            warn!(session_id = %session.id, budget, "Session budget exhausted");
            return Err(OrchestrationError::BudgetExhausted { session_id: session.id, budget });
        }
        Ok(session)
    }

    async fn load_context(&self, session_id: &str) -> Vec<ContextTurn> {
        match self.cache.get_as::<Vec<ContextTurn>>(&context_key(session_id)).await {
            Ok(turns) => turns.unwrap_or_default(),
            Err(e) => {
                warn!(session_id = %session_id, error = %e, "Discarding unreadable cached context");
                Vec::new()
            }
        }
    }

    async fn store_context(
        &self,
        session_id: &str,
        mut context: Vec<ContextTurn>,
        turn: ContextTurn,
        priority: PriorityTier,
    ) {
        context.push(turn);
        let excess = context.len().saturating_sub(self.config.context_turns);
        context.drain(..excess);

        let options = PutOptions {
            ttl: Some(Duration::from_secs(self.config.context_ttl_secs)),
            priority: cache_priority(priority),
            compress: false,
        };
        if let Err(e) = self.cache.put(context_key(session_id), &context, options).await {
            warn!(session_id = %session_id, error = %e, "Failed to cache session context");
        }
    }

    fn analyze(&self, request: &OrchestrationRequest) -> SelectionRequest {
        self.analyzer.analyze(&request.prompt).with_priority(request.options.priority)
    }

    /// Calls the backend for one selected worker and records the outcome.
    async fn execute(
        &self,
        selection: SelectionResult,
        session_id: &str,
        prompt: &str,
        options: &OrchestrationOptions,
    ) -> Execution {
        let worker_id = selection.worker_id.clone();
        let worker = self.registry.get(&worker_id).await.unwrap_or_else(|| {
            WorkerDescriptor::new(worker_id.clone(), worker_id.clone(), CapabilitySet::empty())
        });
        let parameters = ModelParameters {
            model: options.model.clone().or_else(|| worker.preferred_model.clone()),
            system_prompt: worker.system_prompt.clone(),
            temperature: options.temperature.or(ModelParameters::default().temperature),
            max_tokens: options.max_tokens.or(ModelParameters::default().max_tokens),
        };

        self.selector.begin_execution(&worker_id).await;
        let started = Instant::now();
        let result = self.backend.generate_text(prompt, Some(parameters)).await;
        let elapsed = started.elapsed();
        self.selector.end_execution(&worker_id).await;

        let mut record = ExecutionRecord::new(session_id, &worker_id, prompt);
        record.duration_ms = millis(elapsed);
        let outcome = match &result {
            Ok(response) => {
                let usage = response.usage.unwrap_or_default();
                record.prompt_tokens = u64::from(usage.prompt_tokens);
                record.completion_tokens = u64::from(usage.completion_tokens);
                record.cost_usd = response.cost_usd;
                debug!(worker_id = %worker_id, elapsed_ms = record.duration_ms, "Backend call succeeded");
                ExecutionOutcome::success(elapsed, response.total_tokens())
            }
            Err(e) => {
                record.success = false;
                record.error = Some(e.to_string());
                warn!(worker_id = %worker_id, error = %e, "Backend call failed");
                ExecutionOutcome::failure(elapsed)
            }
        };
        self.selector.record_outcome(&worker_id, outcome).await;

        if let Err(e) = self.sessions.store().insert_execution(&record).await {
            warn!(session_id = %session_id, worker_id = %worker_id, error = %e, "Failed to record execution");
        }

        Execution { selection, worker, result, elapsed }
    }

    /// Processes a request with a single worker.
    ///
    /// # Errors
    /// Returns `OrchestrationError::BudgetExhausted` when the session's budget
    /// is used up, selection and session errors as they occur, and
    /// `OrchestrationError::Model` when the backend call fails (the failure
    /// is recorded against the worker first).
    pub async fn process(&self, request: OrchestrationRequest) -> Result<OrchestrationResponse> {
        let started = Instant::now();
        let request_id = Uuid::new_v4().to_string();
        let session = self.resolve_session(&request).await?;

        let selection_request = self.analyze(&request);
        let context = self.load_context(&session.id).await;
        let prompt = enrich_prompt(&request.prompt, &context);

        let selection = match &request.options.worker_id {
            Some(worker_id) => self.selector.acquire(worker_id, &selection_request).await?,
            None => self.selector.select(&selection_request, request.options.strategy).await?,
        };

        let execution = self.execute(selection, &session.id, &prompt, &request.options).await;
        let outcome = execution.turn_outcome();

        let response = match execution.result {
            Ok(response) => response,
            Err(e) => {
                let patch = SessionPatch { outcomes: vec![outcome], ..SessionPatch::default() };
                if let Err(update) = self.sessions.update_session(&session.id, patch).await {
                    warn!(session_id = %session.id, error = %update, "Failed to record failed turn");
                }
                return Err(e.into());
            }
        };

        self.sessions.update_session(&session.id, SessionPatch::turn(vec![outcome])).await?;
        let turn = ContextTurn {
            prompt: request.prompt.clone(),
            response: response.content.clone(),
            worker_id: execution.worker.id.clone(),
        };
        self.store_context(&session.id, context, turn, request.options.priority).await;

        let elapsed_ms = millis(started.elapsed());
        info!(
            request_id = %request_id,
            session_id = %session.id,
            worker_id = %execution.worker.id,
            elapsed_ms,
            backend_ms = millis(execution.elapsed),
            "Request processed"
        );

        Ok(OrchestrationResponse {
            request_id,
            output: response.content,
            worker_id: execution.worker.id,
            selection_reason: execution.selection.reason,
            confidence: execution.selection.confidence,
            session_id: session.id,
            elapsed_ms,
            usage: response.usage,
            cost_usd: response.cost_usd,
        })
    }

    /// Selects up to `worker_count` distinct workers in selection order.
    async fn select_distinct(
        &self,
        request: &SelectionRequest,
        strategy: Option<SelectionStrategy>,
        worker_count: usize,
    ) -> Result<Vec<SelectionResult>> {
        let mut chosen: Vec<SelectionResult> = Vec::with_capacity(worker_count);
        let mut exclude: Vec<String> = Vec::with_capacity(worker_count);
        while chosen.len() < worker_count {
            match self.selector.select_excluding(request, strategy, &exclude).await {
                Ok(selection) => {
                    exclude.push(selection.worker_id.clone());
                    chosen.push(selection);
                }
                Err(SelectionError::NoSuitableWorker { .. }) if !chosen.is_empty() => break,
                Err(e) => {
                    for selection in &chosen {
                        self.selector.release(&selection.worker_id);
                    }
                    return Err(e.into());
                }
            }
        }
        Ok(chosen)
    }

    /// Processes a request with several workers and aggregates their outputs.
    ///
    /// Workers run with at most `batch_concurrency` calls in flight. Failed
    /// backend calls are recorded against their workers and left out of the
    /// aggregation; the session is updated once for the whole request.
    ///
    /// # Errors
    /// Returns selection and session errors as they occur, the first backend
    /// error when every worker failed, and aggregation errors.
    pub async fn process_multi(&self, request: OrchestrationRequest, worker_count: usize) -> Result<MultiWorkerResponse> {
        let started = Instant::now();
        let request_id = Uuid::new_v4().to_string();
        let session = self.resolve_session(&request).await?;

        let selection_request = self.analyze(&request);
        let context = self.load_context(&session.id).await;
        let prompt = enrich_prompt(&request.prompt, &context);

        let selections =
            self.select_distinct(&selection_request, request.options.strategy, worker_count.max(1)).await?;
        debug!(request_id = %request_id, workers = selections.len(), "Dispatching to multiple workers");

        let executions: Vec<Execution> = stream::iter(selections)
            .map(|selection| self.execute(selection, &session.id, &prompt, &request.options))
            .buffered(self.config.batch_concurrency)
            .collect()
            .await;

        let outcomes: Vec<TurnOutcome> = executions.iter().map(Execution::turn_outcome).collect();
        let mut outputs = Vec::with_capacity(executions.len());
        let mut failed_workers = Vec::new();
        let mut first_error = None;
        let mut cost_usd = 0.0;
        for execution in executions {
            match execution.result {
                Ok(response) => {
                    cost_usd += response.cost_usd;
                    let tokens = response.total_tokens();
                    outputs.push(
                        WorkerOutput::text(execution.worker.id, response.content)
                            .with_confidence(execution.selection.confidence)
                            .with_capabilities(execution.worker.capabilities)
                            .with_usage(millis(execution.elapsed), tokens),
                    );
                }
                Err(e) => {
                    failed_workers.push(execution.worker.id);
                    if first_error.is_none() {
                        first_error = Some(e);
                    }
                }
            }
        }

        self.sessions.update_session(&session.id, SessionPatch::turn(outcomes)).await?;
        if outputs.is_empty() {
            if let Some(e) = first_error {
                warn!(request_id = %request_id, failed = failed_workers.len(), "Every worker failed");
                return Err(e.into());
            }
        }

        let aggregation_context = AggregationContext {
            keywords: selection_request.keywords.clone(),
            domain: Some(selection_request.category.tag().to_string()),
            requested_capabilities: selection_request.required,
            strategy_override: request.options.aggregation,
            ..AggregationContext::default()
        };
        let result = self.aggregator.aggregate(outputs, &aggregation_context)?;
        let worker_ids: Vec<String> = result.sources.iter().map(|s| s.agent_id.clone()).collect();

        let turn = ContextTurn {
            prompt: request.prompt.clone(),
            response: result.content.to_text(),
            worker_id: worker_ids.join(","),
        };
        self.store_context(&session.id, context, turn, request.options.priority).await;

        let elapsed_ms = millis(started.elapsed());
        info!(
            request_id = %request_id,
            session_id = %session.id,
            strategy = %result.strategy,
            aggregated = worker_ids.len(),
            failed = failed_workers.len(),
            elapsed_ms,
            "Multi-worker request processed"
        );

        Ok(MultiWorkerResponse {
            request_id,
            session_id: session.id,
            result,
            worker_ids,
            failed_workers,
            elapsed_ms,
            cost_usd,
        })
    }

    /// Processes requests with at most `batch_concurrency` in flight.
    ///
    /// # Returns
    /// One result per request, in input order.
    pub async fn process_batch(&self, requests: Vec<OrchestrationRequest>) -> Vec<Result<OrchestrationResponse>> {
        let total = requests.len();
        info!(total, concurrency = self.config.batch_concurrency, "Starting batch");

        let results: Vec<Result<OrchestrationResponse>> = stream::iter(requests)
            .map(|request| self.process(request))
            .buffered(self.config.batch_concurrency)
            .collect()
            .await;

        let failed = results.iter().filter(|r| r.is_err()).count();
        info!(total, failed, "Batch finished");
        results
    }

    /// Flushes session checkpoints and stops background tasks.
    pub async fn shutdown(&self) {
        self.sessions.shutdown().await;
        let maintenance = self.maintenance.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(maintenance) = maintenance {
            maintenance.shutdown().await;
        }
        info!("Orchestrator shut down");
    }

    /// Get the worker registry.
    #[must_use]
    pub fn registry(&self) -> &Arc<WorkerRegistry> {
        &self.registry
    }

    /// Get the selector.
    #[must_use]
    pub fn selector(&self) -> &CapabilitySelector {
        &self.selector
    }

    /// Get the aggregator.
    #[must_use]
    pub fn aggregator(&self) -> &Aggregator {
        &self.aggregator
    }

    /// Get the session manager.
    #[must_use]
    pub fn sessions(&self) -> &Arc<SessionManager> {
        &self.sessions
    }

    /// Get the context cache.
    #[must_use]
    pub fn cache(&self) -> &Arc<AdaptiveCache> {
        &self.cache
    }

    /// Get the configuration.
    #[must_use]
    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn turn(prompt: &str, response: &str) -> ContextTurn {
        ContextTurn { prompt: prompt.into(), response: response.into(), worker_id: "w".into() }
    }

    #[test]
    fn test_prompt_without_context_is_unchanged() {
        assert_eq!(enrich_prompt("fix the bug", &[]), "fix the bug");
    }

    #[test]
    fn test_prompt_enrichment_lists_prior_turns() {
        let enriched = enrich_prompt("and now?", &[turn("hi", "hello"), turn("status", "green")]);
        assert!(enriched.starts_with("Previous conversation:\nUser: hi\nAssistant: hello\n"));
        assert!(enriched.contains("User: status\nAssistant: green\n"));
        assert!(enriched.ends_with("Current request:\nand now?"));
    }

    #[test]
    fn test_priority_maps_to_cache_tier() {
        assert_eq!(cache_priority(PriorityTier::Low), CachePriority::Low);
        assert_eq!(cache_priority(PriorityTier::Normal), CachePriority::Normal);
        assert_eq!(cache_priority(PriorityTier::Critical), CachePriority::High);
    }

    #[test]
    fn test_request_defaults_to_anonymous_user() {
        let request: OrchestrationRequest = serde_json::from_str(r#"{"prompt": "hi"}"#).unwrap();
        assert_eq!(request.user_id, ANONYMOUS_USER);
        assert_eq!(request.options, OrchestrationOptions::default());
        assert_eq!(request, OrchestrationRequest::new("hi"));
    }
}
