//! Core data models for the kbflow workflow engine

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

// Input validation limits
pub const MAX_DEFINITION_SIZE: usize = 1_048_576; // 1 MB
pub const MAX_NODE_COUNT: usize = 1_000;
pub const MAX_EDGE_COUNT: usize = 5_000;
pub const MAX_ID_LEN: usize = 64;
pub const MAX_EXPRESSION_LEN: usize = 1_024;

/// Fallback per-node timeout when neither node nor global config sets one
pub const DEFAULT_NODE_TIMEOUT_SECS: f64 = 300.0;
/// Upper bound on any configured timeout (one week)
pub const MAX_TIMEOUT_SECS: f64 = 604_800.0;
pub const DEFAULT_MAX_PARALLEL_WORKERS: usize = 10;

/// A timeout is positive, finite and at most [`MAX_TIMEOUT_SECS`]
pub fn timeout_in_range(secs: f64) -> bool {
    secs.is_finite() && secs > 0.0 && secs <= MAX_TIMEOUT_SECS
}

/// Timeout of each owner that sets one: `timeout`, `node_timeout`, then every node
pub fn configured_timeouts(definition: &WorkflowDefinition) -> impl Iterator<Item = (&str, f64)> {
    let global = &definition.global_config;
    [("timeout", global.timeout), ("node_timeout", global.node_timeout)]
        .into_iter()
        .chain(definition.nodes.iter().map(|n| (n.id.as_str(), n.timeout)))
        .filter_map(|(owner, timeout)| timeout.map(|secs| (owner, secs)))
}

/// Node type whose completion populates `output_data`
pub const OUTPUT_NODE_TYPE: &str = "output";

/// A workflow definition. Immutable once an execution starts.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkflowDefinition {
    pub id: String,
    pub name: String,
    #[serde(default = "default_version")]
    pub version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub nodes: Vec<Node>,
    #[serde(default)]
    pub edges: Vec<Edge>,
    #[serde(default)]
    pub global_config: GlobalConfig,
}

fn default_version() -> String {
    "1.0.0".to_string()
}

impl WorkflowDefinition {
    pub fn node(&self, id: &str) -> Option<&Node> {
        self.nodes.iter().find(|n| n.id == id)
    }
}

/// Workflow-wide configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GlobalConfig {
    /// Whole-workflow timeout in seconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<f64>,
    /// Default per-node timeout in seconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_timeout: Option<f64>,
    #[serde(default = "default_true")]
    pub enable_parallel_execution: bool,
    #[serde(default = "default_max_parallel_workers")]
    pub max_parallel_workers: usize,
    /// Seed values for `global_context`
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub context: Map<String, Value>,
}

impl Default for GlobalConfig {
    fn default() -> Self {
        Self {
            timeout: None,
            node_timeout: None,
            enable_parallel_execution: true,
            max_parallel_workers: DEFAULT_MAX_PARALLEL_WORKERS,
            context: Map::new(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_max_parallel_workers() -> usize {
    DEFAULT_MAX_PARALLEL_WORKERS
}

/// Declared input or output of a node
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PortSpec {
    pub name: String,
    #[serde(rename = "type", default = "default_data_type")]
    pub data_type: String,
    #[serde(default)]
    pub required: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
}

fn default_data_type() -> String {
    "any".to_string()
}

/// A unit of work in a workflow graph
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Node {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(rename = "type")]
    pub node_type: String,
    #[serde(default)]
    pub inputs: Vec<PortSpec>,
    #[serde(default)]
    pub outputs: Vec<PortSpec>,
    /// Executor config plus engine-level keys (resource hints, `ignore_errors`, `overrides`)
    #[serde(default)]
    pub config: Map<String, Value>,
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Per-node timeout in seconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetryPolicy>,
}

impl Node {
    pub fn display_name(&self) -> &str {
        if self.name.is_empty() {
            &self.id
        } else {
            &self.name
        }
    }

    pub fn ignore_errors(&self) -> bool {
        self.config
            .get("ignore_errors")
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }

    pub fn overrides(&self) -> Option<&Map<String, Value>> {
        self.config.get("overrides").and_then(Value::as_object)
    }

    pub fn is_output(&self) -> bool {
        self.node_type == OUTPUT_NODE_TYPE
    }
}

/// Retry block on a node. Delays are in milliseconds.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetryPolicy {
    #[serde(default)]
    pub max_retries: u32,
    #[serde(default = "default_base_delay")]
    pub base_delay: u64,
    #[serde(default = "default_max_delay")]
    pub max_delay: u64,
}

fn default_base_delay() -> u64 {
    1_000
}

fn default_max_delay() -> u64 {
    30_000
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 0,
            base_delay: default_base_delay(),
            max_delay: default_max_delay(),
        }
    }
}

/// A directed data/condition link between two nodes
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Edge {
    pub id: String,
    pub source: String,
    pub target: String,
    pub source_output: String,
    pub target_input: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transform: Option<String>,
}

/// Per-step status
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    Pending,
    Running,
    Completed,
    Error,
    Skipped,
}

impl StepStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            StepStatus::Completed | StepStatus::Error | StepStatus::Skipped
        )
    }
}

impl std::fmt::Display for StepStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StepStatus::Pending => write!(f, "pending"),
            StepStatus::Running => write!(f, "running"),
            StepStatus::Completed => write!(f, "completed"),
            StepStatus::Error => write!(f, "error"),
            StepStatus::Skipped => write!(f, "skipped"),
        }
    }
}

/// Workflow-level status
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStatus {
    Running,
    Completed,
    Error,
}

impl ExecutionStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, ExecutionStatus::Running)
    }
}

impl std::fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExecutionStatus::Running => write!(f, "running"),
            ExecutionStatus::Completed => write!(f, "completed"),
            ExecutionStatus::Error => write!(f, "error"),
        }
    }
}

/// Record of one node run
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExecutionStep {
    pub step_id: String,
    pub node_id: String,
    pub node_name: String,
    pub status: StepStatus,
    pub start_time: DateTime<Utc>,
    #[serde(default)]
    pub end_time: Option<DateTime<Utc>>,
    /// Seconds
    #[serde(default)]
    pub duration: Option<f64>,
    #[serde(default)]
    pub input_data: Map<String, Value>,
    #[serde(default)]
    pub output_data: Map<String, Value>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub resource_usage: Map<String, Value>,
    #[serde(default)]
    pub metrics: Map<String, Value>,
}

impl ExecutionStep {
    /// A fresh `running` step
    pub fn start(node: &Node, input_data: Map<String, Value>) -> Self {
        Self {
            step_id: new_step_id(),
            node_id: node.id.clone(),
            node_name: node.display_name().to_string(),
            status: StepStatus::Running,
            start_time: Utc::now(),
            end_time: None,
            duration: None,
            input_data,
            output_data: Map::new(),
            error: None,
            resource_usage: Map::new(),
            metrics: Map::new(),
        }
    }

    /// A terminal step that never ran (skipped, or rejected before dispatch)
    pub fn terminal(node: &Node, status: StepStatus, error: Option<String>) -> Self {
        let now = Utc::now();
        Self {
            status,
            end_time: Some(now),
            duration: Some(0.0),
            error,
            start_time: now,
            ..Self::start(node, Map::new())
        }
    }

    /// Mark the step finished now, filling end time and duration
    pub fn finish(&mut self, status: StepStatus) {
        let end = Utc::now();
        self.status = status;
        self.end_time = Some(end);
        self.duration = Some((end - self.start_time).num_microseconds().unwrap_or(0) as f64 / 1e6);
    }
}

fn new_step_id() -> String {
    let id = uuid::Uuid::new_v4().simple().to_string();
    format!("step_{}", &id[..8])
}

/// Descriptor of a persisted checkpoint
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CheckpointDescriptor {
    pub checkpoint_id: String,
    /// Position in the execution's checkpoint sequence. May have gaps when
    /// a checkpoint write was dropped.
    #[serde(default)]
    pub index: usize,
    pub timestamp: DateTime<Utc>,
    pub step_count: usize,
    pub key: String,
}

/// Outcome of an edge, fixed when its source reaches a terminal state
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "route", rename_all = "lowercase")]
pub enum EdgeRoute {
    Fired { value: Value },
    Blocked,
}

/// Full mutable state of one execution
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkflowExecutionContext {
    pub execution_id: String,
    pub workflow_id: String,
    pub status: ExecutionStatus,
    pub start_time: DateTime<Utc>,
    #[serde(default)]
    pub end_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub input_data: Map<String, Value>,
    #[serde(default)]
    pub output_data: Map<String, Value>,
    #[serde(default)]
    pub global_context: Map<String, Value>,
    #[serde(default)]
    pub steps: Vec<ExecutionStep>,
    #[serde(default)]
    pub checkpoints: Vec<CheckpointDescriptor>,
    #[serde(default)]
    pub metrics: Map<String, Value>,
    #[serde(default)]
    pub error: Option<String>,
    /// Routing decisions keyed by edge id
    #[serde(default)]
    pub edge_routes: BTreeMap<String, EdgeRoute>,
}

impl WorkflowExecutionContext {
    pub fn new(definition: &WorkflowDefinition, input_data: Map<String, Value>) -> Self {
        Self {
            execution_id: uuid::Uuid::new_v4().to_string(),
            workflow_id: definition.id.clone(),
            status: ExecutionStatus::Running,
            start_time: Utc::now(),
            end_time: None,
            input_data,
            output_data: Map::new(),
            global_context: definition.global_config.context.clone(),
            steps: Vec::new(),
            checkpoints: Vec::new(),
            metrics: Map::new(),
            error: None,
            edge_routes: BTreeMap::new(),
        }
    }

    /// Latest step recorded for a node
    pub fn step_for(&self, node_id: &str) -> Option<&ExecutionStep> {
        self.steps.iter().rev().find(|s| s.node_id == node_id)
    }

    /// Insert a step, replacing an earlier record with the same step id
    pub fn upsert_step(&mut self, step: ExecutionStep) {
        match self.steps.iter_mut().find(|s| s.step_id == step.step_id) {
            Some(existing) => *existing = step,
            None => self.steps.push(step),
        }
    }

    pub fn duration_secs(&self) -> Option<f64> {
        self.end_time
            .map(|end| (end - self.start_time).num_milliseconds() as f64 / 1000.0)
    }
}
