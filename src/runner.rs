//! Node executors and the node runner
//!
//! Node implementations are external collaborators registered by
//! `node.type`. The runner invokes one under a timeout, retries it per the
//! node's retry block and folds every outcome into an [`ExecutionStep`].
//! Node failures never escape the runner.

use crate::error::NodeError;
use crate::executors::http::HttpNodeExecutor;
use crate::models::{ExecutionStep, GlobalConfig, Node, StepStatus, DEFAULT_NODE_TIMEOUT_SECS, MAX_TIMEOUT_SECS};
use crate::retry::{RetryConfig, RetryState};
use async_trait::async_trait;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, warn};

/// Input or output map of a node
pub type PortMap = Map<String, Value>;

/// Everything a node implementation receives
#[derive(Debug, Clone, PartialEq)]
pub struct NodeCall {
    pub execution_id: String,
    pub node_id: String,
    pub node_type: String,
    pub config: PortMap,
    pub inputs: PortMap,
}

/// A node implementation: `(inputs) -> (outputs, error)`
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait NodeExecutor: Send + Sync {
    async fn execute(&self, call: NodeCall) -> anyhow::Result<PortMap>;
}

/// Returns its inputs as outputs. Backs the `input` and `output` node types.
#[derive(Debug, Clone, Copy, Default)]
pub struct PassthroughExecutor;

#[async_trait]
impl NodeExecutor for PassthroughExecutor {
    async fn execute(&self, call: NodeCall) -> anyhow::Result<PortMap> {
        Ok(call.inputs)
    }
}

/// Node implementations keyed by type
#[derive(Clone, Default)]
pub struct NodeRegistry {
    executors: HashMap<String, Arc<dyn NodeExecutor>>,
}

impl std::fmt::Debug for NodeRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeRegistry")
            .field("types", &self.types())
            .finish()
    }
}

impl NodeRegistry {
    /// Empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with `input`, `output` and `http` node types
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register("input", PassthroughExecutor);
        registry.register("output", PassthroughExecutor);
        registry.register("http", HttpNodeExecutor::new());
        registry
    }

    pub fn register(&mut self, node_type: impl Into<String>, executor: impl NodeExecutor + 'static) {
        self.executors.insert(node_type.into(), Arc::new(executor));
    }

    pub fn register_arc(&mut self, node_type: impl Into<String>, executor: Arc<dyn NodeExecutor>) {
        self.executors.insert(node_type.into(), executor);
    }

    pub fn get(&self, node_type: &str) -> Option<Arc<dyn NodeExecutor>> {
        self.executors.get(node_type).cloned()
    }

    /// Registered types, sorted
    pub fn types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.executors.keys().cloned().collect();
        types.sort();
        types
    }
}

/// Per-node timeout: node value, then `global_config.node_timeout`, then 300s
pub fn resolve_timeout(node: &Node, global: &GlobalConfig) -> Duration {
    let secs = node
        .timeout
        .or(global.node_timeout)
        .filter(|t| t.is_finite() && *t > 0.0)
        .unwrap_or(DEFAULT_NODE_TIMEOUT_SECS);
    clamped_duration(secs)
}

/// Seconds as a `Duration`, capped at [`MAX_TIMEOUT_SECS`]
pub fn clamped_duration(secs: f64) -> Duration {
    let max = Duration::from_secs(MAX_TIMEOUT_SECS as u64);
    Duration::try_from_secs_f64(secs).map_or(max, |d| d.min(max))
}

/// Resolves once the cancel flag is raised. Never resolves if the sender is gone.
pub(crate) async fn cancelled(cancel: &mut watch::Receiver<bool>) {
    loop {
        if *cancel.borrow() {
            return;
        }
        if cancel.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

/// Invokes node implementations
#[derive(Debug, Clone)]
pub struct NodeRunner {
    registry: Arc<NodeRegistry>,
}

impl NodeRunner {
    pub fn new(registry: Arc<NodeRegistry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &NodeRegistry {
        &self.registry
    }

    /// Run `node` for a `running` step and return the terminal step.
    ///
    /// # Arguments
    ///
    /// * `execution_id` - Execution the step belongs to
    /// * `step` - Step created at dispatch, holding the resolved inputs
    /// * `node` - Node definition
    /// * `timeout` - Per-attempt timeout
    /// * `cancel` - Whole-execution cancellation flag
    pub async fn run(
        &self,
        execution_id: &str,
        mut step: ExecutionStep,
        node: &Node,
        timeout: Duration,
        mut cancel: watch::Receiver<bool>,
    ) -> ExecutionStep {
        let outcome = match self.registry.get(&node.node_type) {
            Some(executor) => {
                let retry = node.retry.as_ref().map(RetryConfig::from).unwrap_or_default();
                let mut state = RetryState::new();
                let result = loop {
                    let call = NodeCall {
                        execution_id: execution_id.to_string(),
                        node_id: node.id.clone(),
                        node_type: node.node_type.clone(),
                        config: node.config.clone(),
                        inputs: step.input_data.clone(),
                    };

                    debug!(
                        "Running node '{}' (attempt {}, timeout {:?})",
                        node.id, state.attempt, timeout
                    );

                    let attempt = tokio::select! {
                        biased;
                        _ = cancelled(&mut cancel) => Err(NodeError::Cancelled(node.id.clone())),
                        result = tokio::time::timeout(timeout, executor.execute(call)) => match result {
                            Ok(Ok(outputs)) => Ok(outputs),
                            Ok(Err(e)) => Err(NodeError::Failed {
                                node: node.id.clone(),
                                message: format!("{:#}", e),
                            }),
                            Err(_) => Err(NodeError::Timeout {
                                node: node.id.clone(),
                                timeout_ms: timeout.as_millis() as u64,
                            }),
                        },
                    };

                    let delay = match &attempt {
                        Err(e) => state.on_failure(&retry, e),
                        Ok(_) => None,
                    };
                    match delay {
                        Some(delay) => {
                            tokio::select! {
                                biased;
                                _ = cancelled(&mut cancel) => break Err(NodeError::Cancelled(node.id.clone())),
                                _ = tokio::time::sleep(delay) => {}
                            }
                        }
                        None => break attempt,
                    }
                };
                step.metrics.insert("attempts".to_string(), Value::from(state.attempt));
                result
            }
            None => Err(NodeError::UnknownType(node.node_type.clone())),
        };

        match outcome {
            Ok(outputs) => {
                step.output_data = outputs;
                step.finish(StepStatus::Completed);
            }
            Err(e) if node.ignore_errors() && !matches!(e, NodeError::Cancelled(_)) => {
                warn!("Node '{}' failed with ignore_errors set: {}", node.id, e);
                step.error = Some(e.to_string());
                step.finish(StepStatus::Completed);
            }
            Err(e) => {
                error!("Node '{}' failed: {}", node.id, e);
                step.error = Some(e.to_string());
                step.finish(StepStatus::Error);
            }
        }

        step
    }
}
