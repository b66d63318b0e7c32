//! Workflow engine facade
//!
//! Ties the scheduler to persistence, locking and monitoring. This is the
//! surface request handlers call into.
//!
//! # Example
//!
//! ```no_run
//! use kbflow::engine::{ExecuteOptions, WorkflowEngine};
//! use kbflow::parser::parse_workflow_yaml;
//! use kbflow::state::StateStore;
//! use serde_json::{json, Map};
//!
//! # async fn example() -> anyhow::Result<()> {
//! let engine = WorkflowEngine::builder(StateStore::new("kbflow.db")?).build()?;
//! let definition = parse_workflow_yaml(&std::fs::read_to_string("workflow.yaml")?)?;
//! let input = json!({"query": "hello"}).as_object().cloned().unwrap_or_default();
//!
//! let context = engine
//!     .execute_workflow(&definition, input, ExecuteOptions::default())
//!     .await?;
//! println!("{} -> {:?}", context.execution_id, context.status);
//! # Ok(())
//! # }
//! ```

use crate::budget::{BudgetCapacity, ResourceBudget};
use crate::error::{FlowError, GraphError, Result, StoreError};
use crate::expr::ExpressionRegistry;
use crate::graph::WorkflowGraph;
use crate::lock::{ExecutionLock, Lease};
use crate::logging::execution_span;
use crate::metrics::MetricsServer;
use crate::models::{StepStatus, WorkflowDefinition, WorkflowExecutionContext};
use crate::monitor::{Alert, NodeMetrics, PerformanceMonitor, WorkflowMetrics};
use crate::persist::{PersistenceQueue, DEFAULT_QUEUE_CAPACITY};
use crate::runner::{NodeRegistry, NodeRunner, PortMap};
use crate::scheduler::{CheckpointPolicy, Scheduler, SchedulerOptions};
use crate::settings::EngineSettings;
use crate::state::{ExecutionStats, StateStore};
use chrono::{DateTime, Utc};
use serde_json::json;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn, Instrument};

/// Per-call overrides for an execution
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExecuteOptions {
    /// Log resolved inputs and outputs of every node
    pub debug: bool,
    /// Overrides `global_config.enable_parallel_execution`
    pub enable_parallel: Option<bool>,
    /// Overrides `global_config.max_parallel_workers`
    pub max_workers: Option<usize>,
    /// Overrides the engine's checkpoint policy
    pub checkpoint: Option<CheckpointPolicy>,
}

fn store_error(e: StoreError) -> FlowError {
    match e {
        StoreError::NotFound(key) => FlowError::NotFound(key),
        other => FlowError::Store(other),
    }
}

/// Run a synchronous store call on the blocking pool
async fn blocking<T, F>(f: F) -> Result<T>
where
    F: FnOnce() -> std::result::Result<T, StoreError> + Send + 'static,
    T: Send + 'static,
{
    match tokio::task::spawn_blocking(f).await {
        Ok(result) => result.map_err(store_error),
        Err(e) => Err(FlowError::Other(format!("Store task failed: {}", e))),
    }
}

/// Fresh context for re-running `node_id` and its downstream nodes on top
/// of `base`
fn retry_context(
    definition: &WorkflowDefinition,
    graph: &WorkflowGraph,
    base: &WorkflowExecutionContext,
    node_id: &str,
) -> WorkflowExecutionContext {
    let affected: HashSet<String> = graph.downstream(node_id).into_iter().collect();
    let mut context = WorkflowExecutionContext::new(definition, base.input_data.clone());

    for step in &base.steps {
        if affected.contains(&step.node_id) || !step.status.is_terminal() {
            continue;
        }
        if step.status == StepStatus::Completed {
            for (key, value) in &step.output_data {
                context.global_context.insert(key.clone(), value.clone());
            }
        }
        context.steps.push(step.clone());
    }
    for (edge_id, route) in &base.edge_routes {
        let source_kept = definition
            .edges
            .iter()
            .find(|e| &e.id == edge_id)
            .is_some_and(|e| !affected.contains(&e.source));
        if source_kept {
            context.edge_routes.insert(edge_id.clone(), route.clone());
        }
    }

    context.metrics.insert(
        "retried_from".to_string(),
        json!({"execution_id": base.execution_id, "node_id": node_id}),
    );
    context
}

/// Builder for [`WorkflowEngine`]
pub struct EngineBuilder {
    store: StateStore,
    registry: NodeRegistry,
    expressions: ExpressionRegistry,
    budget: BudgetCapacity,
    lease: Duration,
    queue_capacity: usize,
    max_workers: usize,
    node_timeout: Option<f64>,
    checkpoint: CheckpointPolicy,
    monitor: Option<Arc<PerformanceMonitor>>,
    metrics: Option<Arc<MetricsServer>>,
}

impl EngineBuilder {
    fn new(store: StateStore) -> Self {
        Self {
            store,
            registry: NodeRegistry::with_builtins(),
            expressions: ExpressionRegistry::new(),
            budget: BudgetCapacity::default(),
            lease: crate::lock::DEFAULT_LEASE,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            max_workers: usize::MAX,
            node_timeout: None,
            checkpoint: CheckpointPolicy::default(),
            monitor: None,
            metrics: None,
        }
    }

    /// Apply everything `settings` configures except the database path
    pub fn settings(mut self, settings: &EngineSettings) -> Self {
        self.budget = settings.budget;
        self.lease = settings.lock_lease();
        self.queue_capacity = settings.queue_capacity;
        self.max_workers = settings.max_workers.max(1);
        self.node_timeout = Some(settings.node_timeout_secs);
        self.checkpoint = settings.checkpoint_policy();
        self
    }

    pub fn registry(mut self, registry: NodeRegistry) -> Self {
        self.registry = registry;
        self
    }

    pub fn expressions(mut self, expressions: ExpressionRegistry) -> Self {
        self.expressions = expressions;
        self
    }

    pub fn budget(mut self, capacity: BudgetCapacity) -> Self {
        self.budget = capacity;
        self
    }

    pub fn lease(mut self, lease: Duration) -> Self {
        self.lease = lease;
        self
    }

    pub fn checkpoint(mut self, policy: CheckpointPolicy) -> Self {
        self.checkpoint = policy;
        self
    }

    pub fn monitor(mut self, monitor: Arc<PerformanceMonitor>) -> Self {
        self.monitor = Some(monitor);
        self
    }

    pub fn metrics(mut self, metrics: Arc<MetricsServer>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Build the engine. Must be called from within a Tokio runtime, since
    /// it starts the persistence worker.
    pub fn build(self) -> Result<WorkflowEngine> {
        let lock = ExecutionLock::from_store(&self.store)?.with_lease(self.lease);
        let persistence = PersistenceQueue::spawn(self.store.clone(), self.queue_capacity);
        let monitor = self.monitor.unwrap_or_else(|| Arc::new(PerformanceMonitor::new()));
        let expressions = Arc::new(self.expressions);

        let mut scheduler = Scheduler::new(
            NodeRunner::new(Arc::new(self.registry)),
            Arc::new(ResourceBudget::new(self.budget)),
            Arc::clone(&expressions),
        )
        .with_monitor(Arc::clone(&monitor))
        .with_persistence(persistence.clone());
        if let Some(metrics) = &self.metrics {
            scheduler = scheduler.with_metrics(Arc::clone(metrics));
        }

        Ok(WorkflowEngine {
            store: self.store,
            lock,
            scheduler,
            expressions,
            monitor,
            persistence,
            max_workers: self.max_workers,
            node_timeout: self.node_timeout,
            checkpoint: self.checkpoint,
            active: Mutex::new(HashMap::new()),
        })
    }
}

/// Executes, resumes and reports on workflow executions
pub struct WorkflowEngine {
    store: StateStore,
    lock: ExecutionLock,
    scheduler: Scheduler,
    expressions: Arc<ExpressionRegistry>,
    monitor: Arc<PerformanceMonitor>,
    persistence: PersistenceQueue,
    max_workers: usize,
    node_timeout: Option<f64>,
    checkpoint: CheckpointPolicy,
    active: Mutex<HashMap<String, Arc<watch::Sender<bool>>>>,
}

impl std::fmt::Debug for WorkflowEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkflowEngine")
            .field("store", &self.store)
            .field("scheduler", &self.scheduler)
            .finish_non_exhaustive()
    }
}

impl WorkflowEngine {
    pub fn builder(store: StateStore) -> EngineBuilder {
        EngineBuilder::new(store)
    }

    /// Engine over the database and limits named in `settings`
    pub fn from_settings(settings: &EngineSettings, registry: NodeRegistry) -> Result<Self> {
        let store = StateStore::new(&settings.database_path)?.with_ttl(settings.state_ttl());
        Self::builder(store).settings(settings).registry(registry).build()
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    pub fn monitor(&self) -> &Arc<PerformanceMonitor> {
        &self.monitor
    }

    pub fn budget(&self) -> &Arc<ResourceBudget> {
        self.scheduler.budget()
    }

    pub fn persistence(&self) -> &PersistenceQueue {
        &self.persistence
    }

    /// Validate a definition against this engine's expression registry
    pub fn validate(&self, definition: &WorkflowDefinition) -> std::result::Result<WorkflowGraph, GraphError> {
        WorkflowGraph::build(definition, &self.expressions)
    }

    fn active(&self) -> MutexGuard<'_, HashMap<String, Arc<watch::Sender<bool>>>> {
        self.active.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Run a workflow to completion.
    ///
    /// Only an invalid graph is returned as an error, before any state is
    /// created. Every other outcome is reported through the returned
    /// context's `status` and `error`.
    pub async fn execute_workflow(
        &self,
        definition: &WorkflowDefinition,
        input_data: PortMap,
        options: ExecuteOptions,
    ) -> Result<WorkflowExecutionContext> {
        let graph = self.validate(definition)?;
        let context = WorkflowExecutionContext::new(definition, input_data);
        info!(
            "Starting execution {} of workflow '{}' ({})",
            context.execution_id, definition.id, definition.version
        );

        let lease = self.prepare_fresh(&context.execution_id, definition).await;
        Ok(self.drive(definition, &graph, context, &options, lease).await)
    }

    /// Persist the definition of a new execution and take its lease.
    /// Failures are only logged: a fresh id cannot be contended.
    async fn prepare_fresh(&self, execution_id: &str, definition: &WorkflowDefinition) -> Option<Lease> {
        let store = self.store.clone();
        let id = execution_id.to_string();
        let stored = definition.clone();
        if let Err(e) = blocking(move || store.save_definition(&id, &stored)).await {
            warn!("Failed to persist definition for {}: {}", execution_id, e);
        }

        let lock = self.lock.clone();
        let id = execution_id.to_string();
        match blocking(move || lock.try_acquire(&id)).await {
            Ok(lease) => lease,
            Err(e) => {
                warn!("Failed to lease execution {}: {}", execution_id, e);
                None
            }
        }
    }

    /// Continue an execution from one of its checkpoints.
    ///
    /// Fails with [`FlowError::LockContention`] if another runner holds the
    /// execution, or [`FlowError::NotFound`] for an unknown execution or
    /// checkpoint.
    pub async fn resume_execution(&self, execution_id: &str, checkpoint_index: usize) -> Result<WorkflowExecutionContext> {
        self.resume_execution_with(execution_id, checkpoint_index, ExecuteOptions::default())
            .await
    }

    pub async fn resume_execution_with(
        &self,
        execution_id: &str,
        checkpoint_index: usize,
        options: ExecuteOptions,
    ) -> Result<WorkflowExecutionContext> {
        let lock = self.lock.clone();
        let id = execution_id.to_string();
        let lease = blocking(move || lock.try_acquire(&id))
            .await?
            .ok_or_else(|| FlowError::LockContention(execution_id.to_string()))?;

        let store = self.store.clone();
        let id = execution_id.to_string();
        let loaded = blocking(move || {
            let definition = store.load_definition(&id)?;
            Ok((definition, store.resume_from(&id, checkpoint_index)?))
        })
        .await;
        let (definition, context) = match loaded {
            Ok(loaded) => loaded,
            Err(e) => {
                self.release(execution_id).await;
                return Err(e);
            }
        };

        let graph = match self.validate(&definition) {
            Ok(graph) => graph,
            Err(e) => {
                self.release(execution_id).await;
                return Err(e.into());
            }
        };

        Ok(self
            .drive(&definition, &graph, context, &options, Some(lease))
            .await)
    }

    /// Re-run `node_id` and everything downstream of it as a new execution.
    ///
    /// Terminal steps of the base execution outside that subgraph are carried
    /// over with their outputs and routing, so only the affected part runs
    /// again. The base execution is left untouched.
    pub async fn retry_from_node(&self, execution_id: &str, node_id: &str) -> Result<WorkflowExecutionContext> {
        self.retry_from_node_with(execution_id, node_id, ExecuteOptions::default())
            .await
    }

    pub async fn retry_from_node_with(
        &self,
        execution_id: &str,
        node_id: &str,
        options: ExecuteOptions,
    ) -> Result<WorkflowExecutionContext> {
        let store = self.store.clone();
        let id = execution_id.to_string();
        let (definition, base) = blocking(move || Ok((store.load_definition(&id)?, store.load(&id)?))).await?;

        let graph = self.validate(&definition)?;
        if !graph.contains(node_id) {
            return Err(FlowError::NotFound(format!("node:{}", node_id)));
        }

        let context = retry_context(&definition, &graph, &base, node_id);
        info!(
            "Retrying execution {} from node '{}' as {}",
            execution_id, node_id, context.execution_id
        );

        let lease = self.prepare_fresh(&context.execution_id, &definition).await;
        Ok(self.drive(&definition, &graph, context, &options, lease).await)
    }

    /// Drive under a held lease, persist the final state and release
    async fn drive(
        &self,
        definition: &WorkflowDefinition,
        graph: &WorkflowGraph,
        context: WorkflowExecutionContext,
        options: &ExecuteOptions,
        lease: Option<Lease>,
    ) -> WorkflowExecutionContext {
        let execution_id = context.execution_id.clone();
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let cancel_tx = Arc::new(cancel_tx);
        self.active().insert(execution_id.clone(), Arc::clone(&cancel_tx));

        self.persistence.enqueue_snapshot(&context, None);
        let renewal = lease.map(|lease| self.spawn_renewal(lease, Arc::clone(&cancel_tx)));

        let definition = self.effective_definition(definition);
        let scheduler_options = self.scheduler_options(&definition, options);
        let span = execution_span(&execution_id, &definition.id);
        let context = self
            .scheduler
            .drive(&definition, graph, context, &scheduler_options, cancel_rx)
            .instrument(span)
            .await;

        if let Some(renewal) = renewal {
            renewal.abort();
        }
        self.active().remove(&execution_id);

        // Queued checkpoints land before the final row so they never overwrite it
        self.persistence.flush().await;
        let store = self.store.clone();
        let snapshot = context.clone();
        match tokio::task::spawn_blocking(move || store.write_snapshot(&snapshot, None)).await {
            Ok(Ok(())) => debug!("Persisted final state of {}", execution_id),
            Ok(Err(e)) => warn!("Failed to persist final state of {}: {}", execution_id, e),
            Err(e) => warn!("Final persistence task for {} failed: {}", execution_id, e),
        }

        self.release(&execution_id).await;
        context
    }

    async fn release(&self, execution_id: &str) {
        let lock = self.lock.clone();
        let id = execution_id.to_string();
        if let Err(e) = blocking(move || lock.release(&id)).await {
            warn!("Failed to release lease on {}: {}", execution_id, e);
        }
    }

    /// Renew the lease every third of its duration. Losing it cancels the
    /// execution, since another runner may take over.
    fn spawn_renewal(&self, lease: Lease, cancel: Arc<watch::Sender<bool>>) -> JoinHandle<()> {
        let lock = self.lock.clone();
        let period = (lock.lease_duration() / 3).max(Duration::from_millis(10));

        tokio::spawn(async move {
            let mut lease = lease;
            loop {
                tokio::time::sleep(period).await;
                let renewed = {
                    let lock = lock.clone();
                    let current = lease.clone();
                    tokio::task::spawn_blocking(move || lock.renew(&current)).await
                };
                match renewed {
                    Ok(Ok(Some(next))) => lease = next,
                    Ok(Ok(None)) => {
                        warn!("Lost lease on execution {}, cancelling", lease.execution_id);
                        let _ = cancel.send(true);
                        return;
                    }
                    Ok(Err(e)) => warn!("Failed to renew lease on {}: {}", lease.execution_id, e),
                    Err(e) => warn!("Lease renewal task failed: {}", e),
                }
            }
        })
    }

    /// Definition with the engine's default node timeout filled in
    fn effective_definition(&self, definition: &WorkflowDefinition) -> WorkflowDefinition {
        let mut definition = definition.clone();
        if definition.global_config.node_timeout.is_none() {
            definition.global_config.node_timeout = self.node_timeout;
        }
        definition
    }

    fn scheduler_options(&self, definition: &WorkflowDefinition, options: &ExecuteOptions) -> SchedulerOptions {
        let global = &definition.global_config;
        SchedulerOptions {
            parallel: options.enable_parallel.unwrap_or(global.enable_parallel_execution),
            max_workers: options
                .max_workers
                .unwrap_or(global.max_parallel_workers)
                .min(self.max_workers)
                .max(1),
            debug: options.debug,
            checkpoint: options.checkpoint.clone().unwrap_or_else(|| self.checkpoint.clone()),
        }
    }

    /// Ask a running execution to stop. Returns false if this engine is not
    /// driving it.
    pub fn stop_execution(&self, execution_id: &str) -> bool {
        match self.active().get(execution_id) {
            Some(cancel) => {
                info!("Stop requested for execution {}", execution_id);
                cancel.send(true).is_ok()
            }
            None => false,
        }
    }

    /// Ids of executions this engine is driving
    pub fn active_executions(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.active().keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Latest persisted state of an execution
    pub fn get_execution(&self, execution_id: &str) -> Result<WorkflowExecutionContext> {
        self.store.load(execution_id).map_err(store_error)
    }

    /// Execution ids of a workflow, newest first
    pub fn list_executions(&self, workflow_id: &str, limit: usize) -> Result<Vec<String>> {
        self.store.list_executions(workflow_id, limit).map_err(store_error)
    }

    pub fn get_workflow_metrics(&self, workflow_id: &str) -> Option<WorkflowMetrics> {
        self.monitor.workflow_metrics(workflow_id)
    }

    pub fn get_node_metrics(&self, node_id: &str) -> Option<NodeMetrics> {
        self.monitor.node_metrics(node_id)
    }

    pub fn get_active_alerts(&self) -> Vec<Alert> {
        self.monitor.active_alerts()
    }

    /// Totals and rates over persisted executions started since `since`
    pub fn execution_stats(&self, workflow_id: Option<&str>, since: DateTime<Utc>) -> Result<ExecutionStats> {
        self.store.execution_stats(workflow_id, since).map_err(store_error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ExecutionStatus;
    use crate::runner::MockNodeExecutor;
    use serde_json::json;

    fn definition() -> WorkflowDefinition {
        serde_yaml::from_str(
            r#"
id: echo
name: echo
nodes:
  - id: start
    type: input
  - id: work
    type: work
  - id: finish
    type: output
edges:
  - { id: e1, source: start, target: work, source_output: q, target_input: q }
  - { id: e2, source: work, target: finish, source_output: answer, target_input: answer }
"#,
        )
        .unwrap()
    }

    fn engine_with(executor: MockNodeExecutor) -> WorkflowEngine {
        let mut registry = NodeRegistry::with_builtins();
        registry.register("work", executor);
        WorkflowEngine::builder(StateStore::in_memory().unwrap())
            .registry(registry)
            .build()
            .unwrap()
    }

    fn input() -> PortMap {
        json!({"q": "ping"}).as_object().cloned().unwrap()
    }

    #[tokio::test]
    async fn test_execute_persists_and_reports() {
        let mut executor = MockNodeExecutor::new();
        executor
            .expect_execute()
            .times(1)
            .returning(|call| {
                assert_eq!(call.inputs.get("q"), Some(&json!("ping")));
                Ok(json!({"answer": "pong"}).as_object().cloned().unwrap())
            });
        let engine = engine_with(executor);

        let ctx = engine
            .execute_workflow(&definition(), input(), ExecuteOptions::default())
            .await
            .unwrap();

        assert_eq!(ctx.status, ExecutionStatus::Completed);
        assert_eq!(ctx.output_data.get("answer"), Some(&json!("pong")));

        let stored = engine.get_execution(&ctx.execution_id).unwrap();
        assert_eq!(stored.status, ExecutionStatus::Completed);
        assert_eq!(engine.list_executions("echo", 10).unwrap(), vec![ctx.execution_id.clone()]);
        assert_eq!(engine.get_workflow_metrics("echo").unwrap().stats.count, 1);
        assert_eq!(engine.get_node_metrics("work").unwrap().stats.success_count, 1);
        // The lease is gone once the execution finishes
        assert!(engine.lock.holder(&ctx.execution_id).unwrap().is_none());
        assert!(engine.active_executions().is_empty());
    }

    #[tokio::test]
    async fn test_invalid_graph_is_rejected_before_state() {
        let engine = engine_with(MockNodeExecutor::new());
        let mut def = definition();
        def.edges.push(crate::models::Edge {
            id: "back".to_string(),
            source: "finish".to_string(),
            target: "start".to_string(),
            source_output: "answer".to_string(),
            target_input: "q2".to_string(),
            condition: None,
            transform: None,
        });

        let result = engine.execute_workflow(&def, input(), ExecuteOptions::default()).await;
        assert!(matches!(result, Err(FlowError::Graph(GraphError::CycleDetected(_)))));
        assert!(engine.list_executions("echo", 10).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_out_of_range_workflow_timeout_is_rejected() {
        let engine = engine_with(MockNodeExecutor::new());
        let mut def = definition();
        def.global_config.timeout = Some(1.0e20);

        let result = engine.execute_workflow(&def, input(), ExecuteOptions::default()).await;
        assert!(matches!(
            result,
            Err(FlowError::Graph(GraphError::InvalidTimeout { ref owner, .. })) if owner == "timeout"
        ));
    }

    #[tokio::test]
    async fn test_node_failure_is_reported_in_context() {
        let mut executor = MockNodeExecutor::new();
        executor
            .expect_execute()
            .returning(|_| Err(anyhow::anyhow!("provider unavailable")));
        let engine = engine_with(executor);

        let ctx = engine
            .execute_workflow(&definition(), input(), ExecuteOptions::default())
            .await
            .unwrap();

        assert_eq!(ctx.status, ExecutionStatus::Error);
        assert!(ctx.error.as_deref().unwrap().contains("provider unavailable"));
        let alerts = engine.get_active_alerts();
        assert!(alerts.iter().any(|a| a.rule_name == "node_error_rate"));
    }

    #[tokio::test]
    async fn test_resume_requires_the_lease() {
        let mut executor = MockNodeExecutor::new();
        executor
            .expect_execute()
            .returning(|_| Ok(json!({"answer": "pong"}).as_object().cloned().unwrap()));
        let engine = engine_with(executor);
        let options = ExecuteOptions {
            checkpoint: Some(CheckpointPolicy::every(1)),
            ..ExecuteOptions::default()
        };
        let ctx = engine.execute_workflow(&definition(), input(), options).await.unwrap();

        assert!(engine.lock.acquire(&ctx.execution_id).unwrap());
        let contended = engine.resume_execution(&ctx.execution_id, 0).await;
        assert!(matches!(contended, Err(FlowError::LockContention(_))));

        engine.lock.release(&ctx.execution_id).unwrap();
        let resumed = engine.resume_execution(&ctx.execution_id, 0).await.unwrap();
        assert_eq!(resumed.execution_id, ctx.execution_id);
        assert_eq!(resumed.status, ExecutionStatus::Completed);
    }

    #[tokio::test]
    async fn test_resume_unknown_execution() {
        let engine = engine_with(MockNodeExecutor::new());
        let result = engine.resume_execution("missing", 0).await;
        assert!(matches!(result, Err(FlowError::NotFound(_))));
        // The lease taken for the attempt is released
        assert!(engine.lock.holder("missing").unwrap().is_none());
        assert!(matches!(engine.get_execution("missing"), Err(FlowError::NotFound(_))));
    }

    struct Stalls;

    #[async_trait::async_trait]
    impl crate::runner::NodeExecutor for Stalls {
        async fn execute(&self, _call: crate::runner::NodeCall) -> anyhow::Result<PortMap> {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(PortMap::new())
        }
    }

    #[tokio::test]
    async fn test_stop_execution() {
        let mut registry = NodeRegistry::with_builtins();
        registry.register("work", Stalls);
        let engine = WorkflowEngine::builder(StateStore::in_memory().unwrap())
            .registry(registry)
            .build()
            .unwrap();
        assert!(!engine.stop_execution("not-running"));

        let def = definition();
        let run = engine.execute_workflow(&def, input(), ExecuteOptions::default());
        let stop = async {
            loop {
                if let Some(id) = engine.active_executions().first() {
                    assert!(engine.stop_execution(id));
                    return;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        };

        let (ctx, ()) = tokio::join!(run, stop);
        let ctx = ctx.unwrap();
        assert_eq!(ctx.status, ExecutionStatus::Error);
        assert_eq!(ctx.error.as_deref(), Some(crate::scheduler::ERROR_CANCELLED));
        assert_eq!(engine.get_execution(&ctx.execution_id).unwrap().status, ExecutionStatus::Error);
    }

    #[test]
    fn test_scheduler_options_respect_engine_ceiling() {
        let runtime = tokio::runtime::Runtime::new().unwrap();
        let _guard = runtime.enter();
        let engine = WorkflowEngine::builder(StateStore::in_memory().unwrap())
            .settings(&EngineSettings {
                max_workers: 3,
                ..EngineSettings::default()
            })
            .build()
            .unwrap();

        let def = definition();
        let options = engine.scheduler_options(&def, &ExecuteOptions::default());
        assert!(options.parallel);
        assert_eq!(options.max_workers, 3);

        let serial = engine.scheduler_options(
            &def,
            &ExecuteOptions {
                enable_parallel: Some(false),
                max_workers: Some(1),
                ..ExecuteOptions::default()
            },
        );
        assert!(!serial.parallel);
        assert_eq!(serial.max_workers, 1);

        let effective = engine.effective_definition(&def);
        assert_eq!(effective.global_config.node_timeout, Some(300.0));
    }
}
