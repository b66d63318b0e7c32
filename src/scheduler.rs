//! Execution scheduler
//!
//! Drives one [`WorkflowExecutionContext`] to a terminal status. Readiness is
//! recomputed on every tick from the current step statuses and edge routes
//! rather than from precomputed layers, since an edge that does not fire can
//! change which inputs fall back to defaults.
//!
//! Serial mode runs one node at a time and ignores the budget. Parallel mode
//! runs up to `max_workers` nodes, each admitted by a budget reservation; a
//! node the budget cannot admit yet stays ready for a later tick.

use crate::budget::{ResourceBudget, ResourceCost};
use crate::error::NodeError;
use crate::expr::{ExpressionEnv, ExpressionRegistry};
use crate::graph::{WorkflowGraph, WHOLE_OUTPUT};
use crate::metrics::MetricsServer;
use crate::models::{
    Edge, EdgeRoute, ExecutionStatus, ExecutionStep, GlobalConfig, Node, StepStatus, WorkflowDefinition,
    WorkflowExecutionContext,
};
use crate::monitor::PerformanceMonitor;
use crate::persist::PersistenceQueue;
use crate::runner::{cancelled, clamped_duration, resolve_timeout, NodeRunner, PortMap};
use crate::state::new_checkpoint_descriptor;
use chrono::Utc;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// How often a budget-blocked execution polls for capacity freed elsewhere
const BUDGET_RETRY_INTERVAL: Duration = Duration::from_millis(25);
/// How long in-flight nodes get to observe a cancellation
const CANCEL_GRACE: Duration = Duration::from_secs(5);

pub const ERROR_CANCELLED: &str = "Cancelled";
pub const ERROR_WORKFLOW_TIMEOUT: &str = "WorkflowTimeout";
pub const ERROR_UNRESOLVABLE: &str = "Unresolvable";

/// When the scheduler writes checkpoints
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CheckpointPolicy {
    /// Checkpoint after every N node runs
    #[serde(default)]
    pub every_n_steps: Option<usize>,
    /// Checkpoint after these nodes finish
    #[serde(default)]
    pub after_nodes: Vec<String>,
}

impl CheckpointPolicy {
    pub fn every(n: usize) -> Self {
        Self {
            every_n_steps: Some(n),
            after_nodes: Vec::new(),
        }
    }

    pub fn after<I, S>(nodes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            every_n_steps: None,
            after_nodes: nodes.into_iter().map(Into::into).collect(),
        }
    }

    fn wants(&self, runs: usize, node_id: &str) -> bool {
        let by_count = self.every_n_steps.is_some_and(|n| n > 0 && runs % n == 0);
        by_count || self.after_nodes.iter().any(|n| n == node_id)
    }
}

/// Resolved admission settings for one drive
#[derive(Debug, Clone, PartialEq)]
pub struct SchedulerOptions {
    pub parallel: bool,
    pub max_workers: usize,
    /// Log resolved inputs and outputs of every node
    pub debug: bool,
    pub checkpoint: CheckpointPolicy,
}

impl SchedulerOptions {
    pub fn from_global(config: &GlobalConfig) -> Self {
        Self {
            parallel: config.enable_parallel_execution,
            max_workers: config.max_parallel_workers.max(1),
            debug: false,
            checkpoint: CheckpointPolicy::default(),
        }
    }

    pub fn serial() -> Self {
        Self {
            parallel: false,
            ..Self::default()
        }
    }
}

impl Default for SchedulerOptions {
    fn default() -> Self {
        Self::from_global(&GlobalConfig::default())
    }
}

/// Drives executions. One instance can drive many executions concurrently;
/// all of them share its budget.
#[derive(Clone)]
pub struct Scheduler {
    runner: NodeRunner,
    budget: Arc<ResourceBudget>,
    expressions: Arc<ExpressionRegistry>,
    monitor: Option<Arc<PerformanceMonitor>>,
    metrics: Option<Arc<MetricsServer>>,
    persistence: Option<PersistenceQueue>,
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("runner", &self.runner)
            .field("budget", &self.budget)
            .finish_non_exhaustive()
    }
}

enum Stop {
    Cancelled,
    Timeout,
    Unresolvable,
}

enum Readiness {
    Waiting,
    Skip(String),
    Fail(NodeError),
    Ready(PortMap),
}

#[derive(Default)]
struct Tick {
    progressed: bool,
    deferred: bool,
}

impl Scheduler {
    pub fn new(runner: NodeRunner, budget: Arc<ResourceBudget>, expressions: Arc<ExpressionRegistry>) -> Self {
        Self {
            runner,
            budget,
            expressions,
            monitor: None,
            metrics: None,
            persistence: None,
        }
    }

    /// Report every terminal step and execution to a monitor
    pub fn with_monitor(mut self, monitor: Arc<PerformanceMonitor>) -> Self {
        self.monitor = Some(monitor);
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<MetricsServer>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Queue for checkpoint writes. Without one, checkpoints are not taken.
    pub fn with_persistence(mut self, queue: PersistenceQueue) -> Self {
        self.persistence = Some(queue);
        self
    }

    pub fn budget(&self) -> &Arc<ResourceBudget> {
        &self.budget
    }

    /// Drive `context` until every node is terminal, the execution is
    /// cancelled, or the workflow timeout fires.
    ///
    /// Steps already terminal in `context` are kept as-is; steps left
    /// `running` by an interrupted driver are discarded and run again.
    pub async fn drive(
        &self,
        definition: &WorkflowDefinition,
        graph: &WorkflowGraph,
        context: WorkflowExecutionContext,
        options: &SchedulerOptions,
        mut cancel: watch::Receiver<bool>,
    ) -> WorkflowExecutionContext {
        let mut run = Drive::new(self, definition, graph, options, context);
        run.restore();

        info!(
            "Driving execution {} of workflow '{}' ({} mode, {} nodes)",
            run.ctx.execution_id,
            definition.id,
            if options.parallel { "parallel" } else { "serial" },
            graph.node_count()
        );
        if let Some(metrics) = &self.metrics {
            metrics.inc_active_workflows();
        }

        let deadline = definition
            .global_config
            .timeout
            .filter(|t| t.is_finite() && *t > 0.0)
            .map(|t| Instant::now() + clamped_duration(t));

        let stop = loop {
            if *cancel.borrow() {
                break Some(Stop::Cancelled);
            }
            if deadline.is_some_and(|d| Instant::now() >= d) {
                break Some(Stop::Timeout);
            }

            if run.running.is_empty() {
                run.abandon_running("task ended unexpectedly");
            }

            let tick = run.tick(&cancel);

            if run.running.is_empty() {
                if !run.has_pending() {
                    break None;
                }
                if tick.progressed {
                    continue;
                }
                if !tick.deferred {
                    break Some(Stop::Unresolvable);
                }
            }

            tokio::select! {
                biased;
                _ = cancelled(&mut cancel) => break Some(Stop::Cancelled),
                _ = tokio::time::sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    break Some(Stop::Timeout);
                }
                Some(joined) = run.running.join_next() => run.on_joined(joined),
                _ = tokio::time::sleep(BUDGET_RETRY_INTERVAL), if tick.deferred => {}
            }
        };

        match stop {
            None => run.finalize(),
            Some(Stop::Cancelled) => {
                warn!("Execution {} cancelled", run.ctx.execution_id);
                run.drain_cancelled().await;
                run.skip_pending();
                run.fail(ERROR_CANCELLED.to_string());
            }
            Some(Stop::Timeout) => {
                warn!("Execution {} exceeded its workflow timeout", run.ctx.execution_id);
                run.running.abort_all();
                run.abandon_running("aborted by workflow timeout");
                run.skip_pending();
                run.fail(ERROR_WORKFLOW_TIMEOUT.to_string());
            }
            Some(Stop::Unresolvable) => {
                error!("Execution {} has pending nodes that can never become ready", run.ctx.execution_id);
                run.skip_pending();
                run.fail(ERROR_UNRESOLVABLE.to_string());
            }
        }

        run.finish()
    }
}

/// Per-drive state. Owned by the dispatch loop only.
struct Drive<'a> {
    scheduler: &'a Scheduler,
    definition: &'a WorkflowDefinition,
    graph: &'a WorkflowGraph,
    options: &'a SchedulerOptions,
    ctx: WorkflowExecutionContext,
    status: HashMap<String, StepStatus>,
    reserved: HashMap<String, ResourceCost>,
    running: JoinSet<(String, ExecutionStep)>,
    runs: usize,
}

impl<'a> Drive<'a> {
    fn new(
        scheduler: &'a Scheduler,
        definition: &'a WorkflowDefinition,
        graph: &'a WorkflowGraph,
        options: &'a SchedulerOptions,
        ctx: WorkflowExecutionContext,
    ) -> Self {
        Self {
            scheduler,
            definition,
            graph,
            options,
            ctx,
            status: HashMap::new(),
            reserved: HashMap::new(),
            running: JoinSet::new(),
            runs: 0,
        }
    }

    /// Rebuild node statuses from the steps already in the context
    fn restore(&mut self) {
        let before = self.ctx.steps.len();
        self.ctx.steps.retain(|s| s.status.is_terminal());
        if self.ctx.steps.len() < before {
            info!(
                "Re-running {} node(s) interrupted in execution {}",
                before - self.ctx.steps.len(),
                self.ctx.execution_id
            );
        }

        for step in &self.ctx.steps {
            self.status.insert(step.node_id.clone(), step.status);
        }

        // Routes are normally fixed at completion; fill any the snapshot lacks
        let graph = self.graph;
        let terminal: Vec<(String, StepStatus, PortMap)> = graph
            .node_ids()
            .iter()
            .filter_map(|id| {
                let step = self.ctx.step_for(id)?;
                let missing = graph
                    .outgoing_edges(id)
                    .any(|e| !self.ctx.edge_routes.contains_key(&e.id));
                missing.then(|| (id.clone(), step.status, step.output_data.clone()))
            })
            .collect();
        for (id, status, output) in terminal {
            self.route_outgoing(&id, &output, status);
        }
    }

    fn status_of(&self, node_id: &str) -> StepStatus {
        self.status.get(node_id).copied().unwrap_or(StepStatus::Pending)
    }

    fn has_pending(&self) -> bool {
        self.graph
            .node_ids()
            .iter()
            .any(|id| self.status_of(id) == StepStatus::Pending)
    }

    /// Handle every pending node that can be decided now
    fn tick(&mut self, cancel: &watch::Receiver<bool>) -> Tick {
        let mut tick = Tick::default();
        let graph = self.graph;
        let definition = self.definition;
        let scheduler = self.scheduler;
        let budget = &scheduler.budget;

        for id in graph.node_ids() {
            if self.status_of(id) != StepStatus::Pending {
                continue;
            }
            let Some(node) = definition.node(id) else {
                continue;
            };

            match self.readiness(node) {
                Readiness::Waiting => {}
                Readiness::Skip(reason) => {
                    debug!("Skipping node '{}': {}", node.id, reason);
                    self.record_unrun(node, StepStatus::Skipped, None);
                    tick.progressed = true;
                }
                Readiness::Fail(e) => {
                    error!("{}", e);
                    self.record_unrun(node, StepStatus::Error, Some(e.to_string()));
                    tick.progressed = true;
                }
                Readiness::Ready(inputs) => {
                    let cost = if self.options.parallel {
                        if self.running.len() >= self.options.max_workers.max(1) {
                            continue;
                        }
                        let cost = ResourceCost::for_node(node);
                        if !budget.can_ever_fit(&cost) {
                            let e = NodeError::BudgetExceedsCapacity(node.id.clone());
                            error!("{}", e);
                            self.record_unrun(node, StepStatus::Error, Some(e.to_string()));
                            tick.progressed = true;
                            continue;
                        }
                        if !budget.try_reserve(&cost) {
                            debug!("Budget exhausted, deferring node '{}'", node.id);
                            tick.deferred = true;
                            continue;
                        }
                        Some(cost)
                    } else {
                        if !self.running.is_empty() {
                            continue;
                        }
                        None
                    };

                    self.dispatch(node, inputs, cost, cancel.clone());
                    tick.progressed = true;
                }
            }
        }

        tick
    }

    fn fired<'e>(&'e self, edge: &Edge) -> Option<&'e Value> {
        match self.ctx.edge_routes.get(&edge.id) {
            Some(EdgeRoute::Fired { value }) => Some(value),
            _ => None,
        }
    }

    /// Decide whether a pending node can run, and with which inputs
    fn readiness(&self, node: &Node) -> Readiness {
        let deps_done = self
            .graph
            .dependencies(&node.id)
            .iter()
            .all(|d| self.status_of(d).is_terminal());
        if !deps_done {
            return Readiness::Waiting;
        }
        if !node.enabled {
            return Readiness::Skip("disabled".to_string());
        }

        let incoming: Vec<&Edge> = self.graph.incoming_edges(&node.id).collect();
        if !incoming.is_empty() && incoming.iter().all(|e| self.fired(e).is_none()) {
            return Readiness::Skip("no incoming edge fired".to_string());
        }

        let mut inputs = if node.inputs.is_empty() && incoming.is_empty() {
            self.ctx.input_data.clone()
        } else {
            PortMap::new()
        };

        for edge in &incoming {
            if let Some(value) = self.fired(edge) {
                inputs.insert(edge.target_input.clone(), value.clone());
            }
        }

        for port in &node.inputs {
            let wired = incoming.iter().any(|e| e.target_input == port.name);
            if !wired && !inputs.contains_key(&port.name) {
                if let Some(value) = self.ctx.input_data.get(&port.name) {
                    inputs.insert(port.name.clone(), value.clone());
                }
            }
        }

        if let Some(overrides) = node.overrides() {
            for (key, value) in overrides {
                if inputs.get(key).map_or(true, Value::is_null) {
                    inputs.insert(key.clone(), value.clone());
                }
            }
        }

        for port in &node.inputs {
            if inputs.contains_key(&port.name) {
                continue;
            }
            if let Some(default) = &port.default {
                inputs.insert(port.name.clone(), default.clone());
            } else if port.required {
                if incoming.iter().any(|e| e.target_input == port.name) {
                    return Readiness::Skip(format!("required input '{}' was not routed", port.name));
                }
                return Readiness::Fail(NodeError::MissingInput {
                    node: node.id.clone(),
                    input: port.name.clone(),
                });
            }
        }

        Readiness::Ready(inputs)
    }

    fn dispatch(&mut self, node: &Node, inputs: PortMap, cost: Option<ResourceCost>, cancel: watch::Receiver<bool>) {
        let mut step = ExecutionStep::start(node, inputs);
        if let Some(cost) = cost {
            step.resource_usage = json!({
                "cpu": cost.cpu,
                "memory": cost.memory,
                "network": cost.network,
            })
            .as_object()
            .cloned()
            .unwrap_or_default();
            self.reserved.insert(node.id.clone(), cost);
        }

        if self.options.debug {
            let inputs = Value::Object(step.input_data.clone());
            info!("Node '{}' inputs: {}", node.id, inputs);
        } else {
            debug!("Dispatching node '{}' ({})", node.id, node.node_type);
        }

        self.status.insert(node.id.clone(), StepStatus::Running);
        self.ctx.upsert_step(step.clone());
        if let Some(metrics) = &self.scheduler.metrics {
            metrics.inc_active_nodes();
            metrics.set_budget_utilization(&self.scheduler.budget.utilization());
        }

        let runner = self.scheduler.runner.clone();
        let execution_id = self.ctx.execution_id.clone();
        let timeout = resolve_timeout(node, &self.definition.global_config);
        let node = node.clone();

        self.running.spawn(async move {
            let fallback = step.clone();
            let result = AssertUnwindSafe(runner.run(&execution_id, step, &node, timeout, cancel))
                .catch_unwind()
                .await;
            match result {
                Ok(step) => (node.id, step),
                Err(_) => {
                    let mut step = fallback;
                    step.error = Some(format!("Node '{}' panicked", node.id));
                    step.finish(StepStatus::Error);
                    (node.id, step)
                }
            }
        });
    }

    fn on_joined(&mut self, joined: Result<(String, ExecutionStep), tokio::task::JoinError>) {
        match joined {
            Ok((node_id, step)) => self.on_complete(node_id, step),
            Err(e) => error!("Node task failed to join: {}", e),
        }
    }

    fn release(&mut self, node_id: &str) {
        if let Some(cost) = self.reserved.remove(node_id) {
            self.scheduler.budget.release(&cost);
        }
        if let Some(metrics) = &self.scheduler.metrics {
            metrics.dec_active_nodes();
            metrics.set_budget_utilization(&self.scheduler.budget.utilization());
        }
    }

    fn on_complete(&mut self, node_id: String, step: ExecutionStep) {
        self.release(&node_id);

        if self.options.debug {
            let outputs = Value::Object(step.output_data.clone());
            info!("Node '{}' finished {}: {}", node_id, step.status, outputs);
        }

        self.status.insert(node_id.clone(), step.status);
        if step.status == StepStatus::Completed {
            for (key, value) in &step.output_data {
                self.ctx.global_context.insert(key.clone(), value.clone());
            }
        }
        self.route_outgoing(&node_id, &step.output_data, step.status);
        self.record(step);

        self.runs += 1;
        if self.options.checkpoint.wants(self.runs, &node_id) {
            self.checkpoint();
        }
    }

    /// Fix the route of every edge leaving `source`
    fn route_outgoing(&mut self, source: &str, output: &PortMap, status: StepStatus) {
        let graph = self.graph;
        let routes: Vec<(String, EdgeRoute)> = graph
            .outgoing_edges(source)
            .map(|edge| {
                let route = if status == StepStatus::Completed {
                    self.route(edge, output)
                } else {
                    EdgeRoute::Blocked
                };
                (edge.id.clone(), route)
            })
            .collect();

        for (edge_id, route) in routes {
            debug!("Edge '{}' {}", edge_id, if matches!(route, EdgeRoute::Fired { .. }) { "fired" } else { "blocked" });
            self.ctx.edge_routes.insert(edge_id, route);
        }
    }

    fn route(&self, edge: &Edge, output: &PortMap) -> EdgeRoute {
        let value = if edge.source_output == WHOLE_OUTPUT {
            Value::Object(output.clone())
        } else {
            match output.get(&edge.source_output) {
                Some(value) => value.clone(),
                None => return EdgeRoute::Blocked,
            }
        };

        let expressions = &self.scheduler.expressions;
        let env = ExpressionEnv {
            value: &value,
            output,
            context: &self.ctx.global_context,
            input: &self.ctx.input_data,
        };

        if let Some(condition) = &edge.condition {
            match expressions.evaluate_bool(condition, &env) {
                Ok(true) => {}
                Ok(false) => return EdgeRoute::Blocked,
                Err(e) => {
                    warn!("Condition on edge '{}' failed, not firing: {}", edge.id, e);
                    return EdgeRoute::Blocked;
                }
            }
        }

        let transformed = match &edge.transform {
            Some(transform) => match expressions.evaluate(transform, &env) {
                Ok(v) => Some(v),
                Err(e) => {
                    warn!("Transform on edge '{}' failed, not firing: {}", edge.id, e);
                    return EdgeRoute::Blocked;
                }
            },
            None => None,
        };

        EdgeRoute::Fired {
            value: transformed.unwrap_or(value),
        }
    }

    /// Terminal step for a node that never ran
    fn record_unrun(&mut self, node: &Node, status: StepStatus, error: Option<String>) {
        self.status.insert(node.id.clone(), status);
        self.route_outgoing(&node.id, &PortMap::new(), status);
        self.record(ExecutionStep::terminal(node, status, error));
    }

    fn record(&mut self, step: ExecutionStep) {
        if let Some(monitor) = &self.scheduler.monitor {
            monitor.record_step(&self.ctx.workflow_id, &step);
        }
        if let Some(metrics) = &self.scheduler.metrics {
            metrics.record_node_execution(
                &self.ctx.workflow_id,
                &step.node_id,
                &step.status.to_string(),
                step.duration.unwrap_or(0.0),
            );
        }
        self.ctx.upsert_step(step);
    }

    /// Fire-and-forget checkpoint through the persistence queue
    fn checkpoint(&mut self) {
        let Some(queue) = &self.scheduler.persistence else {
            return;
        };
        let descriptor = new_checkpoint_descriptor(&self.ctx);
        self.ctx.checkpoints.push(descriptor.clone());
        debug!("Checkpoint {} after {} runs", descriptor.key, self.runs);
        queue.enqueue_snapshot(&self.ctx, Some(descriptor));
    }

    /// Fail every node still marked running
    fn abandon_running(&mut self, reason: &str) {
        let stuck: Vec<String> = self
            .status
            .iter()
            .filter(|(_, s)| **s == StepStatus::Running)
            .map(|(id, _)| id.clone())
            .collect();

        for node_id in stuck {
            self.release(&node_id);
            self.status.insert(node_id.clone(), StepStatus::Error);

            if let Some(mut step) = self.ctx.step_for(&node_id).cloned() {
                step.error = Some(format!("Node '{}' {}", node_id, reason));
                step.finish(StepStatus::Error);
                self.record(step);
            }
            self.route_outgoing(&node_id, &PortMap::new(), StepStatus::Error);
        }
    }

    /// Wait for in-flight nodes to observe cancellation. Their results are
    /// recorded but never routed.
    async fn drain_cancelled(&mut self) {
        let grace = tokio::time::sleep(CANCEL_GRACE);
        tokio::pin!(grace);

        loop {
            tokio::select! {
                joined = self.running.join_next() => match joined {
                    Some(Ok((node_id, step))) => {
                        self.release(&node_id);
                        self.status.insert(node_id.clone(), step.status);
                        self.route_outgoing(&node_id, &PortMap::new(), StepStatus::Error);
                        self.record(step);
                    }
                    Some(Err(e)) => error!("Node task failed to join: {}", e),
                    None => break,
                },
                _ = &mut grace => {
                    warn!("Nodes ignored cancellation, aborting them");
                    self.running.abort_all();
                    break;
                }
            }
        }

        self.abandon_running("was cancelled");
    }

    fn skip_pending(&mut self) {
        let graph = self.graph;
        let definition = self.definition;
        for id in graph.node_ids() {
            if self.status_of(id) == StepStatus::Pending {
                if let Some(node) = definition.node(id) {
                    self.record_unrun(node, StepStatus::Skipped, None);
                }
            }
        }
    }

    fn fail(&mut self, message: String) {
        self.ctx.status = ExecutionStatus::Error;
        self.ctx.error = Some(message);
    }

    /// Status from the output nodes once everything is terminal
    fn finalize(&mut self) {
        let mut output_data = PortMap::new();
        let mut any_completed = false;
        let mut failed_output = None;

        for id in self.graph.output_nodes() {
            match self.status_of(id) {
                StepStatus::Completed => {
                    any_completed = true;
                    if let Some(step) = self.ctx.step_for(id) {
                        output_data.extend(step.output_data.clone());
                    }
                }
                StepStatus::Error if failed_output.is_none() => failed_output = Some(id.clone()),
                _ => {}
            }
        }

        let first_error = failed_output.or_else(|| {
            if any_completed {
                return None;
            }
            self.ctx
                .steps
                .iter()
                .find(|s| s.status == StepStatus::Error)
                .map(|s| s.node_id.clone())
        });

        match first_error {
            Some(node_id) => {
                let reason = self
                    .ctx
                    .step_for(&node_id)
                    .and_then(|s| s.error.clone())
                    .unwrap_or_else(|| "unknown error".to_string());
                self.fail(format!("Node '{}' failed: {}", node_id, reason));
            }
            None if any_completed => {
                self.ctx.status = ExecutionStatus::Completed;
                self.ctx.output_data = output_data;
            }
            None => self.fail(ERROR_UNRESOLVABLE.to_string()),
        }
    }

    fn finish(mut self) -> WorkflowExecutionContext {
        self.ctx.end_time = Some(Utc::now());

        let count = |status: StepStatus| self.ctx.steps.iter().filter(|s| s.status == status).count();
        let summary = json!({
            "total_steps": self.ctx.steps.len(),
            "completed_steps": count(StepStatus::Completed),
            "failed_steps": count(StepStatus::Error),
            "skipped_steps": count(StepStatus::Skipped),
            "node_runs": self.runs,
            "duration": self.ctx.duration_secs().unwrap_or(0.0),
        });
        if let Value::Object(summary) = summary {
            self.ctx.metrics.extend(summary);
        }

        if let Some(monitor) = &self.scheduler.monitor {
            monitor.record_execution(&self.ctx);
        }
        if let Some(metrics) = &self.scheduler.metrics {
            metrics.record_workflow_execution(&self.ctx.workflow_id, &self.ctx.status.to_string());
            metrics.dec_active_workflows();
        }

        match &self.ctx.error {
            Some(e) => warn!("Execution {} finished with error: {}", self.ctx.execution_id, e),
            None => info!(
                "Execution {} completed in {:.3}s",
                self.ctx.execution_id,
                self.ctx.duration_secs().unwrap_or(0.0)
            ),
        }

        self.ctx
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::budget::BudgetCapacity;
    use crate::runner::{NodeCall, NodeExecutor, NodeRegistry};
    use crate::state::StateStore;
    use async_trait::async_trait;
    use serde_json::Map;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Sleeper(Duration);

    #[async_trait]
    impl NodeExecutor for Sleeper {
        async fn execute(&self, call: NodeCall) -> anyhow::Result<PortMap> {
            tokio::time::sleep(self.0).await;
            Ok(call.inputs)
        }
    }

    /// Tracks the peak number of concurrent calls
    #[derive(Clone, Default)]
    struct Tracker {
        current: Arc<AtomicUsize>,
        peak: Arc<AtomicUsize>,
        calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl NodeExecutor for Tracker {
        async fn execute(&self, call: NodeCall) -> anyhow::Result<PortMap> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(50)).await;
            self.current.fetch_sub(1, Ordering::SeqCst);
            Ok(call.inputs)
        }
    }

    fn scheduler_with(registry: NodeRegistry, capacity: BudgetCapacity) -> Scheduler {
        Scheduler::new(
            NodeRunner::new(Arc::new(registry)),
            Arc::new(ResourceBudget::new(capacity)),
            Arc::new(ExpressionRegistry::new()),
        )
    }

    fn registry() -> NodeRegistry {
        let mut registry = NodeRegistry::with_builtins();
        registry.register("sleep", Sleeper(Duration::from_millis(200)));
        registry.register("slow", Sleeper(Duration::from_secs(1)));
        registry
    }

    fn definition(yaml: &str) -> (WorkflowDefinition, WorkflowGraph) {
        let def: WorkflowDefinition = serde_yaml::from_str(yaml).unwrap();
        let graph = WorkflowGraph::build(&def, &ExpressionRegistry::new()).unwrap();
        (def, graph)
    }

    fn input(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap()
    }

    fn never_cancelled() -> watch::Receiver<bool> {
        watch::channel(false).1
    }

    async fn drive(
        scheduler: &Scheduler,
        def: &WorkflowDefinition,
        graph: &WorkflowGraph,
        data: Value,
        options: &SchedulerOptions,
    ) -> WorkflowExecutionContext {
        let ctx = WorkflowExecutionContext::new(def, input(data));
        scheduler.drive(def, graph, ctx, options, never_cancelled()).await
    }

    fn step<'c>(ctx: &'c WorkflowExecutionContext, node_id: &str) -> &'c ExecutionStep {
        ctx.step_for(node_id).unwrap()
    }

    const LINEAR: &str = r#"
id: linear
name: linear
nodes:
  - id: start
    type: input
  - id: finish
    type: output
edges:
  - id: e1
    source: start
    target: finish
    source_output: query
    target_input: query
"#;

    #[tokio::test]
    async fn test_linear_serial_run() {
        let scheduler = scheduler_with(registry(), BudgetCapacity::default());
        let (def, graph) = definition(LINEAR);

        let ctx = drive(&scheduler, &def, &graph, json!({"query": "hi"}), &SchedulerOptions::serial()).await;

        assert_eq!(ctx.status, ExecutionStatus::Completed);
        assert_eq!(ctx.output_data, input(json!({"query": "hi"})));
        assert_eq!(ctx.steps.len(), 2);
        assert_eq!(ctx.global_context.get("query"), Some(&json!("hi")));
        assert!(ctx.end_time.is_some());
        assert_eq!(ctx.metrics.get("completed_steps"), Some(&json!(2)));
    }

    #[tokio::test]
    async fn test_debug_mode_logs_ports_without_changing_the_run() {
        let scheduler = scheduler_with(registry(), BudgetCapacity::default());
        let (def, graph) = definition(LINEAR);
        let options = SchedulerOptions {
            debug: true,
            ..SchedulerOptions::serial()
        };

        let ctx = drive(&scheduler, &def, &graph, json!({"query": "hi"}), &options).await;

        assert_eq!(ctx.status, ExecutionStatus::Completed);
        assert_eq!(ctx.output_data, input(json!({"query": "hi"})));
    }

    const FAN_OUT: &str = r#"
id: fan_out
name: fan out
nodes:
  - id: start
    type: input
  - id: a
    type: sleep
  - id: b
    type: sleep
  - id: c
    type: sleep
  - id: join
    type: output
edges:
  - { id: sa, source: start, target: a, source_output: query, target_input: query }
  - { id: sb, source: start, target: b, source_output: query, target_input: query }
  - { id: sc, source: start, target: c, source_output: query, target_input: query }
  - { id: aj, source: a, target: join, source_output: query, target_input: a }
  - { id: bj, source: b, target: join, source_output: query, target_input: b }
  - { id: cj, source: c, target: join, source_output: query, target_input: c }
"#;

    #[tokio::test]
    async fn test_parallel_siblings_overlap() {
        let scheduler = scheduler_with(registry(), BudgetCapacity::default());
        let (def, graph) = definition(FAN_OUT);

        let ctx = drive(&scheduler, &def, &graph, json!({"query": "q"}), &SchedulerOptions::default()).await;

        assert_eq!(ctx.status, ExecutionStatus::Completed);
        assert_eq!(ctx.output_data, input(json!({"a": "q", "b": "q", "c": "q"})));

        let siblings = [step(&ctx, "a"), step(&ctx, "b"), step(&ctx, "c")];
        for x in &siblings {
            for y in &siblings {
                assert!(x.start_time < y.end_time.unwrap());
            }
        }
        assert!(scheduler.budget().ledger().is_balanced());
    }

    #[tokio::test]
    async fn test_serial_mode_never_overlaps() {
        let scheduler = scheduler_with(registry(), BudgetCapacity::default());
        let (def, graph) = definition(FAN_OUT);

        let ctx = drive(&scheduler, &def, &graph, json!({"query": "q"}), &SchedulerOptions::serial()).await;

        assert_eq!(ctx.status, ExecutionStatus::Completed);
        let mut runs: Vec<&ExecutionStep> = ["a", "b", "c"].iter().map(|id| step(&ctx, id)).collect();
        runs.sort_by_key(|s| s.start_time);
        for pair in runs.windows(2) {
            assert!(pair[0].end_time.unwrap() <= pair[1].start_time);
        }
        // Serial mode never touches the budget
        assert_eq!(scheduler.budget().ledger().reservations, 0);
    }

    fn tracked_fan_out(width: usize) -> String {
        let mut yaml = String::from("id: tracked\nname: tracked\nnodes:\n  - id: start\n    type: input\n");
        for i in 0..width {
            yaml.push_str(&format!("  - id: t{}\n    type: track\n", i));
        }
        yaml.push_str("edges:\n");
        for i in 0..width {
            yaml.push_str(&format!(
                "  - {{ id: e{i}, source: start, target: t{i}, source_output: query, target_input: query }}\n"
            ));
        }
        yaml
    }

    #[tokio::test]
    async fn test_worker_ceiling() {
        let tracker = Tracker::default();
        let mut registry = registry();
        registry.register("track", tracker.clone());
        let scheduler = scheduler_with(registry, BudgetCapacity::default());
        let (def, graph) = definition(&tracked_fan_out(6));

        let options = SchedulerOptions {
            max_workers: 2,
            ..SchedulerOptions::default()
        };
        let ctx = drive(&scheduler, &def, &graph, json!({"query": "q"}), &options).await;

        assert_eq!(ctx.status, ExecutionStatus::Completed);
        assert_eq!(tracker.calls.load(Ordering::SeqCst), 6);
        assert!(tracker.peak.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn test_budget_limits_concurrency() {
        let tracker = Tracker::default();
        let mut registry = registry();
        registry.register("track", tracker.clone());
        // Room for two minimal-cost nodes at a time
        let scheduler = scheduler_with(
            registry,
            BudgetCapacity {
                cpu: 2.0,
                ..BudgetCapacity::default()
            },
        );
        let (def, graph) = definition(&tracked_fan_out(5));

        let ctx = drive(&scheduler, &def, &graph, json!({"query": "q"}), &SchedulerOptions::default()).await;

        assert_eq!(ctx.status, ExecutionStatus::Completed);
        assert_eq!(tracker.calls.load(Ordering::SeqCst), 5);
        assert!(tracker.peak.load(Ordering::SeqCst) <= 2);
        let ledger = scheduler.budget().ledger();
        assert!(ledger.is_balanced());
        assert_eq!(ledger.reservations, 6);
    }

    #[tokio::test]
    async fn test_node_larger_than_budget_fails() {
        let scheduler = scheduler_with(
            registry(),
            BudgetCapacity {
                cpu: 0.5,
                ..BudgetCapacity::default()
            },
        );
        let (def, graph) = definition(
            r#"
id: huge
name: huge
nodes:
  - id: start
    type: input
  - id: heavy
    type: sleep
edges:
  - { id: e1, source: start, target: heavy, source_output: query, target_input: query }
"#,
        );

        let ctx = drive(&scheduler, &def, &graph, json!({"query": "q"}), &SchedulerOptions::default()).await;

        assert_eq!(ctx.status, ExecutionStatus::Error);
        let heavy = step(&ctx, "heavy");
        assert_eq!(heavy.status, StepStatus::Error);
        assert!(heavy.error.as_deref().unwrap().contains("more resources"));
    }

    #[tokio::test]
    async fn test_condition_routes_branch() {
        let scheduler = scheduler_with(registry(), BudgetCapacity::default());
        let (def, graph) = definition(
            r#"
id: branch
name: branch
nodes:
  - id: start
    type: input
  - id: big
    type: output
  - id: small
    type: output
edges:
  - { id: to_big, source: start, target: big, source_output: n, target_input: n, condition: "value > 10" }
  - { id: to_small, source: start, target: small, source_output: n, target_input: n, condition: "value <= 10" }
"#,
        );

        let ctx = drive(&scheduler, &def, &graph, json!({"n": 3}), &SchedulerOptions::default()).await;

        assert_eq!(ctx.status, ExecutionStatus::Completed);
        assert_eq!(step(&ctx, "big").status, StepStatus::Skipped);
        assert_eq!(step(&ctx, "small").status, StepStatus::Completed);
        assert_eq!(ctx.output_data, input(json!({"n": 3})));
        assert_eq!(ctx.edge_routes.get("to_big"), Some(&EdgeRoute::Blocked));
    }

    #[tokio::test]
    async fn test_all_paths_blocked_is_unresolvable() {
        let scheduler = scheduler_with(registry(), BudgetCapacity::default());
        let (def, graph) = definition(
            r#"
id: dead_end
name: dead_end
nodes:
  - id: start
    type: input
  - id: out
    type: output
edges:
  - { id: gate, source: start, target: out, source_output: n, target_input: n, condition: "value > 10" }
"#,
        );

        for options in [SchedulerOptions::serial(), SchedulerOptions::default()] {
            let ctx = drive(&scheduler, &def, &graph, json!({"n": 3}), &options).await;

            assert_eq!(ctx.status, ExecutionStatus::Error);
            assert_eq!(ctx.error.as_deref(), Some(ERROR_UNRESOLVABLE));
            assert_eq!(step(&ctx, "start").status, StepStatus::Completed);
            assert_eq!(step(&ctx, "out").status, StepStatus::Skipped);
            assert_eq!(ctx.edge_routes.get("gate"), Some(&EdgeRoute::Blocked));
            assert!(ctx.output_data.is_empty());
            assert!(scheduler.budget().ledger().is_balanced());
        }
    }

    #[tokio::test]
    async fn test_transform_rewrites_value() {
        let scheduler = scheduler_with(registry(), BudgetCapacity::default());
        let (def, graph) = definition(
            r#"
id: shout
name: shout
nodes:
  - id: start
    type: input
  - id: out
    type: output
edges:
  - { id: e1, source: start, target: out, source_output: text, target_input: text, transform: "value|upper" }
"#,
        );

        let ctx = drive(&scheduler, &def, &graph, json!({"text": "hello"}), &SchedulerOptions::default()).await;

        assert_eq!(ctx.output_data, input(json!({"text": "HELLO"})));
    }

    #[tokio::test]
    async fn test_optional_input_falls_back_to_default() {
        let scheduler = scheduler_with(registry(), BudgetCapacity::default());
        let (def, graph) = definition(
            r#"
id: defaults
name: defaults
nodes:
  - id: start
    type: input
  - id: out
    type: output
    inputs:
      - { name: query, required: true }
      - { name: limit, default: 5 }
    config:
      overrides:
        mode: strict
edges:
  - { id: e1, source: start, target: out, source_output: query, target_input: query }
  - { id: e2, source: start, target: out, source_output: limit, target_input: limit, condition: "value > 100" }
"#,
        );

        let ctx = drive(&scheduler, &def, &graph, json!({"query": "q", "limit": 1}), &SchedulerOptions::default()).await;

        assert_eq!(ctx.status, ExecutionStatus::Completed);
        assert_eq!(
            ctx.output_data,
            input(json!({"query": "q", "limit": 5, "mode": "strict"}))
        );
    }

    #[tokio::test]
    async fn test_missing_required_input_is_node_error() {
        let scheduler = scheduler_with(registry(), BudgetCapacity::default());
        let (def, graph) = definition(
            r#"
id: missing
name: missing
nodes:
  - id: out
    type: output
    inputs:
      - { name: query, required: true }
"#,
        );

        let ctx = drive(&scheduler, &def, &graph, json!({}), &SchedulerOptions::default()).await;

        assert_eq!(ctx.status, ExecutionStatus::Error);
        assert!(step(&ctx, "out").error.as_deref().unwrap().contains("missing required input"));
        assert!(ctx.error.as_deref().unwrap().contains("out"));
    }

    #[tokio::test]
    async fn test_disabled_node_is_skipped() {
        let scheduler = scheduler_with(registry(), BudgetCapacity::default());
        let (def, graph) = definition(
            r#"
id: disabled
name: disabled
nodes:
  - id: start
    type: input
  - id: off
    type: sleep
    enabled: false
  - id: out
    type: output
edges:
  - { id: e1, source: start, target: off, source_output: q, target_input: q }
  - { id: e2, source: start, target: out, source_output: q, target_input: q }
"#,
        );

        let ctx = drive(&scheduler, &def, &graph, json!({"q": 1}), &SchedulerOptions::default()).await;

        assert_eq!(ctx.status, ExecutionStatus::Completed);
        assert_eq!(step(&ctx, "off").status, StepStatus::Skipped);
    }

    const SLOW: &str = r#"
id: slow
name: slow
nodes:
  - id: start
    type: input
  - id: slow
    type: slow
    timeout: 0.5
  - id: done
    type: output
edges:
  - { id: e1, source: start, target: slow, source_output: q, target_input: q }
  - { id: e2, source: slow, target: done, source_output: q, target_input: q }
"#;

    #[tokio::test]
    async fn test_node_timeout_marks_step_error() {
        let scheduler = scheduler_with(registry(), BudgetCapacity::default());
        let (def, graph) = definition(SLOW);

        let ctx = drive(&scheduler, &def, &graph, json!({"q": 1}), &SchedulerOptions::default()).await;

        let slow = step(&ctx, "slow");
        assert_eq!(slow.status, StepStatus::Error);
        assert!(slow.error.as_deref().unwrap().contains("timed out"));
        assert_eq!(step(&ctx, "done").status, StepStatus::Skipped);
        assert_eq!(ctx.status, ExecutionStatus::Error);
        assert!(scheduler.budget().ledger().is_balanced());
    }

    #[tokio::test]
    async fn test_workflow_timeout() {
        let scheduler = scheduler_with(registry(), BudgetCapacity::default());
        let (mut def, _) = definition(SLOW);
        def.nodes[1].timeout = None;
        def.global_config.timeout = Some(0.2);
        let graph = WorkflowGraph::build(&def, &ExpressionRegistry::new()).unwrap();

        let ctx = drive(&scheduler, &def, &graph, json!({"q": 1}), &SchedulerOptions::default()).await;

        assert_eq!(ctx.status, ExecutionStatus::Error);
        assert_eq!(ctx.error.as_deref(), Some(ERROR_WORKFLOW_TIMEOUT));
        assert_eq!(step(&ctx, "slow").status, StepStatus::Error);
        assert_eq!(step(&ctx, "done").status, StepStatus::Skipped);
        assert!(scheduler.budget().ledger().is_balanced());
    }

    #[tokio::test]
    async fn test_cancellation_stops_execution() {
        let scheduler = scheduler_with(registry(), BudgetCapacity::default());
        let (def, graph) = definition(SLOW);
        let (tx, rx) = watch::channel(false);
        let ctx = WorkflowExecutionContext::new(&def, input(json!({"q": 1})));
        let opts = SchedulerOptions::default();

        let (ctx, _) = tokio::join!(
            scheduler.drive(&def, &graph, ctx, &opts, rx),
            async {
                tokio::time::sleep(Duration::from_millis(100)).await;
                tx.send(true).unwrap();
            }
        );

        assert_eq!(ctx.status, ExecutionStatus::Error);
        assert_eq!(ctx.error.as_deref(), Some(ERROR_CANCELLED));
        assert!(step(&ctx, "slow").error.as_deref().unwrap().contains("cancelled"));
        assert_eq!(step(&ctx, "done").status, StepStatus::Skipped);
        assert!(scheduler.budget().ledger().is_balanced());
    }

    #[tokio::test]
    async fn test_monitor_sees_every_step() {
        let monitor = Arc::new(PerformanceMonitor::new());
        let scheduler = scheduler_with(registry(), BudgetCapacity::default()).with_monitor(Arc::clone(&monitor));
        let (def, graph) = definition(LINEAR);

        drive(&scheduler, &def, &graph, json!({"query": "hi"}), &SchedulerOptions::default()).await;

        assert_eq!(monitor.node_metrics("start").unwrap().stats.count, 1);
        assert_eq!(monitor.node_metrics("finish").unwrap().stats.success_count, 1);
        assert_eq!(monitor.workflow_metrics("linear").unwrap().stats.count, 1);
    }

    #[tokio::test]
    async fn test_checkpoints_and_resume() {
        let store = StateStore::in_memory().unwrap();
        let queue = PersistenceQueue::spawn(store.clone(), 16);
        let tracker = Tracker::default();
        let mut registry = registry();
        registry.register("track", tracker.clone());
        let scheduler = scheduler_with(registry, BudgetCapacity::default()).with_persistence(queue.clone());

        let (def, graph) = definition(
            r#"
id: chain
name: chain
nodes:
  - id: start
    type: input
  - id: mid
    type: track
  - id: end
    type: output
edges:
  - { id: e1, source: start, target: mid, source_output: q, target_input: q }
  - { id: e2, source: mid, target: end, source_output: q, target_input: q }
"#,
        );
        let options = SchedulerOptions {
            checkpoint: CheckpointPolicy::every(1),
            ..SchedulerOptions::default()
        };

        let first = drive(&scheduler, &def, &graph, json!({"q": "x"}), &options).await;
        queue.flush().await;

        assert_eq!(first.status, ExecutionStatus::Completed);
        assert_eq!(first.checkpoints.len(), 3);
        assert_eq!(store.list_checkpoints(&first.execution_id).unwrap().len(), 3);

        // Checkpoint 0 was taken right after `start` finished
        let resumed = store.resume_from(&first.execution_id, 0).unwrap();
        assert_eq!(resumed.steps.len(), 1);
        let start_step = resumed.steps[0].clone();

        let second = scheduler
            .drive(&def, &graph, resumed, &options, never_cancelled())
            .await;
        queue.flush().await;

        assert_eq!(second.status, ExecutionStatus::Completed);
        assert_eq!(second.steps[0], start_step);
        assert_eq!(tracker.calls.load(Ordering::SeqCst), 2);
        // New checkpoints continue after the stored ones
        assert_eq!(store.list_checkpoints(&first.execution_id).unwrap().len(), 5);
    }

    #[test]
    fn test_checkpoint_policy() {
        let every_two = CheckpointPolicy::every(2);
        assert!(!every_two.wants(1, "a"));
        assert!(every_two.wants(2, "a"));

        let after = CheckpointPolicy::after(["embed"]);
        assert!(after.wants(1, "embed"));
        assert!(!after.wants(1, "other"));
        assert!(!CheckpointPolicy::default().wants(1, "a"));
    }
}
