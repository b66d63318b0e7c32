//! Performance monitor and alert evaluator
//!
//! Aggregates every terminal step per node and every terminal execution per
//! workflow, then checks the configured threshold rules against the fresh
//! aggregate. Alerts are observational: nothing here feeds back into
//! scheduling. State is in-memory only.

use crate::models::{ExecutionStatus, ExecutionStep, StepStatus, WorkflowExecutionContext};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};
use tracing::{info, warn};

/// Durations kept per node for trend analysis
pub const TREND_WINDOW: usize = 100;
/// Resolved alerts kept in history
pub const ALERT_HISTORY_LIMIT: usize = 1_000;
/// Active alerts older than this are resolved on the next sweep
pub const DEFAULT_MAX_ALERT_AGE_SECS: i64 = 3_600;

// Metric names understood by alert rules
pub const METRIC_WORKFLOW_DURATION: &str = "workflow_duration";
pub const METRIC_WORKFLOW_FAILURE_RATE: &str = "workflow_failure_rate";
pub const METRIC_WORKFLOW_STEP_ERROR_RATE: &str = "workflow_step_error_rate";
pub const METRIC_NODE_ERROR_RATE: &str = "node_error_rate";
pub const METRIC_NODE_DURATION: &str = "node_duration";

/// Count, duration and outcome aggregate
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DurationStats {
    pub count: u64,
    pub success_count: u64,
    pub error_count: u64,
    /// Seconds
    pub total_duration: f64,
    pub mean_duration: f64,
    pub min_duration: f64,
    pub max_duration: f64,
    pub success_rate: f64,
    pub error_rate: f64,
    pub last_duration: f64,
}

impl DurationStats {
    fn record(&mut self, duration: f64, success: bool) {
        if self.count == 0 {
            self.min_duration = duration;
            self.max_duration = duration;
        } else {
            self.min_duration = self.min_duration.min(duration);
            self.max_duration = self.max_duration.max(duration);
        }

        self.count += 1;
        if success {
            self.success_count += 1;
        } else {
            self.error_count += 1;
        }
        self.total_duration += duration;
        self.last_duration = duration;

        let count = self.count as f64;
        self.mean_duration = self.total_duration / count;
        self.success_rate = self.success_count as f64 / count;
        self.error_rate = self.error_count as f64 / count;
    }
}

/// Aggregate for one node id
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeMetrics {
    pub node_id: String,
    pub node_name: String,
    #[serde(flatten)]
    pub stats: DurationStats,
    pub skipped_count: u64,
    pub last_updated: DateTime<Utc>,
}

/// Aggregate for one workflow id
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowMetrics {
    pub workflow_id: String,
    #[serde(flatten)]
    pub stats: DurationStats,
    pub step_count: u64,
    pub step_error_count: u64,
    pub step_error_rate: f64,
    pub last_updated: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Comparison {
    #[serde(rename = ">")]
    GreaterThan,
    #[serde(rename = "<")]
    LessThan,
    #[serde(rename = ">=")]
    GreaterOrEqual,
    #[serde(rename = "<=")]
    LessOrEqual,
    #[serde(rename = "==")]
    Equal,
}

impl Comparison {
    pub fn holds(self, value: f64, threshold: f64) -> bool {
        match self {
            Comparison::GreaterThan => value > threshold,
            Comparison::LessThan => value < threshold,
            Comparison::GreaterOrEqual => value >= threshold,
            Comparison::LessOrEqual => value <= threshold,
            Comparison::Equal => (value - threshold).abs() < f64::EPSILON,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Error,
    Critical,
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Severity::Info => write!(f, "info"),
            Severity::Warning => write!(f, "warning"),
            Severity::Error => write!(f, "error"),
            Severity::Critical => write!(f, "critical"),
        }
    }
}

/// Threshold rule over one metric.
///
/// `message` may reference `{value}`, `{threshold}`, `{workflow}` and
/// `{node}`. `labels` restricts the rule to subjects carrying every pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertRule {
    pub name: String,
    pub metric_name: String,
    pub threshold: f64,
    pub comparison: Comparison,
    pub severity: Severity,
    pub message: String,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

impl AlertRule {
    pub fn new(
        name: impl Into<String>,
        metric_name: impl Into<String>,
        comparison: Comparison,
        threshold: f64,
        severity: Severity,
        message: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            metric_name: metric_name.into(),
            threshold,
            comparison,
            severity,
            message: message.into(),
            labels: BTreeMap::new(),
        }
    }

    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    fn applies_to(&self, labels: &BTreeMap<String, String>) -> bool {
        self.labels.iter().all(|(k, v)| labels.get(k) == Some(v))
    }

    /// Alert for `value` if the rule triggers on it
    pub fn evaluate(&self, value: f64, labels: &BTreeMap<String, String>) -> Option<Alert> {
        if !self.applies_to(labels) || !self.comparison.holds(value, self.threshold) {
            return None;
        }

        let label = |key: &str| labels.get(key).map(String::as_str).unwrap_or("");
        let message = self
            .message
            .replace("{value}", &format!("{:.2}", value))
            .replace("{threshold}", &format!("{:.2}", self.threshold))
            .replace("{workflow}", label("workflow"))
            .replace("{node}", label("node"));

        Some(Alert {
            alert_id: uuid::Uuid::new_v4().to_string(),
            rule_name: self.name.clone(),
            metric_name: self.metric_name.clone(),
            severity: self.severity,
            message,
            value,
            threshold: self.threshold,
            labels: labels.clone(),
            timestamp: Utc::now(),
            resolved_at: None,
        })
    }
}

/// The rules a monitor starts with
pub fn default_rules() -> Vec<AlertRule> {
    vec![
        AlertRule::new(
            "slow_workflow",
            METRIC_WORKFLOW_DURATION,
            Comparison::GreaterThan,
            300.0,
            Severity::Warning,
            "Workflow {workflow} took {value}s (threshold {threshold}s)",
        ),
        AlertRule::new(
            "node_error_rate",
            METRIC_NODE_ERROR_RATE,
            Comparison::GreaterThan,
            0.1,
            Severity::Error,
            "Node {node} error rate {value} exceeds {threshold}",
        ),
        AlertRule::new(
            "workflow_failure_rate",
            METRIC_WORKFLOW_FAILURE_RATE,
            Comparison::GreaterThan,
            0.2,
            Severity::Error,
            "Workflow {workflow} failure rate {value} exceeds {threshold}",
        ),
        AlertRule::new(
            "workflow_step_errors",
            METRIC_WORKFLOW_STEP_ERROR_RATE,
            Comparison::GreaterThan,
            0.5,
            Severity::Warning,
            "Workflow {workflow} step error rate {value} exceeds {threshold}",
        ),
    ]
}

/// A triggered rule
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    pub alert_id: String,
    pub rule_name: String,
    pub metric_name: String,
    pub severity: Severity,
    pub message: String,
    pub value: f64,
    pub threshold: f64,
    pub labels: BTreeMap<String, String>,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub resolved_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrendDirection {
    Improving,
    Stable,
    Degrading,
    InsufficientData,
}

/// Duration trend of one node over its recent runs
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerformanceTrend {
    pub node_id: String,
    pub samples: usize,
    pub previous_mean: f64,
    pub recent_mean: f64,
    pub direction: TrendDirection,
}

/// Relative mean change treated as a real trend
const TREND_THRESHOLD: f64 = 0.1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeSummary {
    pub node_id: String,
    pub mean_duration: f64,
    pub error_rate: f64,
    pub count: u64,
}

/// Overview of everything the monitor has seen
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DashboardSummary {
    pub total_workflows: usize,
    pub total_nodes: usize,
    pub total_executions: u64,
    pub slowest_nodes: Vec<NodeSummary>,
    pub most_error_prone_nodes: Vec<NodeSummary>,
    pub active_alerts: usize,
    pub alerts_by_severity: BTreeMap<String, usize>,
}

const DASHBOARD_TOP_N: usize = 5;

#[derive(Debug, Default)]
struct MonitorState {
    nodes: HashMap<String, NodeMetrics>,
    workflows: HashMap<String, WorkflowMetrics>,
    trends: HashMap<String, VecDeque<f64>>,
    rules: Vec<AlertRule>,
    active: BTreeMap<String, Alert>,
    history: VecDeque<Alert>,
}

impl MonitorState {
    /// Check every rule for `metric_name` against one subject
    fn evaluate(&mut self, metric_name: &str, value: f64, labels: &BTreeMap<String, String>) {
        let subject = format!(
            "{}:{}",
            labels.get("workflow").map(String::as_str).unwrap_or(""),
            labels.get("node").map(String::as_str).unwrap_or("")
        );

        let mut fired = Vec::new();
        let mut cleared = Vec::new();
        for rule in self.rules.iter().filter(|r| r.metric_name == metric_name) {
            let key = format!("{}:{}", rule.name, subject);
            match rule.evaluate(value, labels) {
                Some(alert) => fired.push((key, alert)),
                None if rule.applies_to(labels) => cleared.push(key),
                None => {}
            }
        }

        for (key, alert) in fired {
            match self.active.get_mut(&key) {
                Some(existing) => {
                    existing.value = alert.value;
                    existing.message = alert.message;
                }
                None => {
                    warn!("Alert [{}] {}", alert.severity, alert.message);
                    self.active.insert(key, alert);
                }
            }
        }

        for key in cleared {
            if let Some(alert) = self.active.remove(&key) {
                info!("Alert '{}' cleared", alert.rule_name);
                self.archive(alert, Utc::now());
            }
        }
    }

    fn archive(&mut self, mut alert: Alert, now: DateTime<Utc>) {
        alert.resolved_at = Some(now);
        self.history.push_back(alert);
        while self.history.len() > ALERT_HISTORY_LIMIT {
            self.history.pop_front();
        }
    }
}

/// In-memory performance monitor
#[derive(Debug)]
pub struct PerformanceMonitor {
    state: Mutex<MonitorState>,
    max_alert_age: chrono::Duration,
}

impl Default for PerformanceMonitor {
    fn default() -> Self {
        Self::new()
    }
}

impl PerformanceMonitor {
    /// Monitor with the default rule set
    pub fn new() -> Self {
        Self::with_rules(default_rules())
    }

    pub fn with_rules(rules: Vec<AlertRule>) -> Self {
        Self {
            state: Mutex::new(MonitorState {
                rules,
                ..MonitorState::default()
            }),
            max_alert_age: chrono::Duration::seconds(DEFAULT_MAX_ALERT_AGE_SECS),
        }
    }

    pub fn with_max_alert_age(mut self, max_age: chrono::Duration) -> Self {
        self.max_alert_age = max_age;
        self
    }

    // Aggregates stay usable even if a recorder panicked
    fn state(&self) -> MutexGuard<'_, MonitorState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Ingest a terminal step. Non-terminal steps are ignored.
    pub fn record_step(&self, workflow_id: &str, step: &ExecutionStep) {
        if !step.status.is_terminal() {
            return;
        }

        let mut state = self.state();
        let now = Utc::now();

        let node = state
            .nodes
            .entry(step.node_id.clone())
            .or_insert_with(|| NodeMetrics {
                node_id: step.node_id.clone(),
                node_name: step.node_name.clone(),
                stats: DurationStats::default(),
                skipped_count: 0,
                last_updated: now,
            });
        node.last_updated = now;

        if step.status == StepStatus::Skipped {
            node.skipped_count += 1;
            return;
        }

        let duration = step.duration.unwrap_or(0.0);
        let failed = step.status == StepStatus::Error;
        node.stats.record(duration, !failed);
        let error_rate = node.stats.error_rate;

        let trend = state.trends.entry(step.node_id.clone()).or_default();
        trend.push_back(duration);
        while trend.len() > TREND_WINDOW {
            trend.pop_front();
        }

        let workflow = workflow_entry(&mut state.workflows, workflow_id, now);
        workflow.step_count += 1;
        if failed {
            workflow.step_error_count += 1;
        }
        workflow.step_error_rate = workflow.step_error_count as f64 / workflow.step_count as f64;
        let step_error_rate = workflow.step_error_rate;

        let labels = BTreeMap::from([
            ("workflow".to_string(), workflow_id.to_string()),
            ("node".to_string(), step.node_id.clone()),
        ]);
        state.evaluate(METRIC_NODE_ERROR_RATE, error_rate, &labels);
        state.evaluate(METRIC_NODE_DURATION, duration, &labels);

        let labels = BTreeMap::from([("workflow".to_string(), workflow_id.to_string())]);
        state.evaluate(METRIC_WORKFLOW_STEP_ERROR_RATE, step_error_rate, &labels);
    }

    /// Ingest a terminal execution. Running contexts are ignored.
    pub fn record_execution(&self, context: &WorkflowExecutionContext) {
        if !context.status.is_terminal() {
            return;
        }

        let mut state = self.state();
        let now = Utc::now();
        let duration = context.duration_secs().unwrap_or(0.0);

        let workflow = workflow_entry(&mut state.workflows, &context.workflow_id, now);
        workflow
            .stats
            .record(duration, context.status == ExecutionStatus::Completed);
        let failure_rate = workflow.stats.error_rate;

        let labels = BTreeMap::from([("workflow".to_string(), context.workflow_id.clone())]);
        state.evaluate(METRIC_WORKFLOW_DURATION, duration, &labels);
        state.evaluate(METRIC_WORKFLOW_FAILURE_RATE, failure_rate, &labels);
    }

    pub fn node_metrics(&self, node_id: &str) -> Option<NodeMetrics> {
        self.state().nodes.get(node_id).cloned()
    }

    pub fn workflow_metrics(&self, workflow_id: &str) -> Option<WorkflowMetrics> {
        self.state().workflows.get(workflow_id).cloned()
    }

    /// Compare the older and newer half of the node's recent durations
    pub fn node_trend(&self, node_id: &str) -> Option<PerformanceTrend> {
        let state = self.state();
        let samples = state.trends.get(node_id)?;
        let mid = samples.len() / 2;
        let mean = |values: &[f64]| {
            if values.is_empty() {
                0.0
            } else {
                values.iter().sum::<f64>() / values.len() as f64
            }
        };

        let all: Vec<f64> = samples.iter().copied().collect();
        let previous_mean = mean(&all[..mid]);
        let recent_mean = mean(&all[mid..]);

        let direction = if all.len() < 4 {
            TrendDirection::InsufficientData
        } else if previous_mean <= 0.0 {
            TrendDirection::Stable
        } else {
            let change = (recent_mean - previous_mean) / previous_mean;
            if change > TREND_THRESHOLD {
                TrendDirection::Degrading
            } else if change < -TREND_THRESHOLD {
                TrendDirection::Improving
            } else {
                TrendDirection::Stable
            }
        };

        Some(PerformanceTrend {
            node_id: node_id.to_string(),
            samples: all.len(),
            previous_mean,
            recent_mean,
            direction,
        })
    }

    /// Active alerts, most severe first
    pub fn active_alerts(&self) -> Vec<Alert> {
        let mut alerts: Vec<Alert> = self.state().active.values().cloned().collect();
        alerts.sort_by(|a, b| b.severity.cmp(&a.severity).then(b.timestamp.cmp(&a.timestamp)));
        alerts
    }

    /// Resolved alerts, newest first
    pub fn alert_history(&self, limit: usize) -> Vec<Alert> {
        self.state().history.iter().rev().take(limit).cloned().collect()
    }

    /// Resolve active alerts older than the max age. Returns how many.
    pub fn resolve_stale(&self) -> usize {
        self.resolve_stale_at(Utc::now())
    }

    pub fn resolve_stale_at(&self, now: DateTime<Utc>) -> usize {
        let mut state = self.state();
        let cutoff = now - self.max_alert_age;
        let stale: Vec<String> = state
            .active
            .iter()
            .filter(|(_, alert)| alert.timestamp < cutoff)
            .map(|(key, _)| key.clone())
            .collect();

        for key in &stale {
            if let Some(alert) = state.active.remove(key) {
                state.archive(alert, now);
            }
        }
        stale.len()
    }

    pub fn add_rule(&self, rule: AlertRule) {
        let mut state = self.state();
        state.rules.retain(|r| r.name != rule.name);
        state.rules.push(rule);
    }

    /// Remove a rule by name, along with its active alerts
    pub fn remove_rule(&self, name: &str) -> bool {
        let mut state = self.state();
        let before = state.rules.len();
        state.rules.retain(|r| r.name != name);
        state.active.retain(|_, alert| alert.rule_name != name);
        state.rules.len() != before
    }

    pub fn rules(&self) -> Vec<AlertRule> {
        self.state().rules.clone()
    }

    pub fn dashboard(&self) -> DashboardSummary {
        let state = self.state();

        let summaries: Vec<NodeSummary> = state
            .nodes
            .values()
            .filter(|n| n.stats.count > 0)
            .map(|n| NodeSummary {
                node_id: n.node_id.clone(),
                mean_duration: n.stats.mean_duration,
                error_rate: n.stats.error_rate,
                count: n.stats.count,
            })
            .collect();

        let mut slowest = summaries.clone();
        slowest.sort_by(|a, b| b.mean_duration.total_cmp(&a.mean_duration));
        slowest.truncate(DASHBOARD_TOP_N);

        let mut error_prone: Vec<NodeSummary> = summaries.into_iter().filter(|n| n.error_rate > 0.0).collect();
        error_prone.sort_by(|a, b| b.error_rate.total_cmp(&a.error_rate));
        error_prone.truncate(DASHBOARD_TOP_N);

        let mut alerts_by_severity = BTreeMap::new();
        for alert in state.active.values() {
            *alerts_by_severity.entry(alert.severity.to_string()).or_insert(0) += 1;
        }

        DashboardSummary {
            total_workflows: state.workflows.len(),
            total_nodes: state.nodes.len(),
            total_executions: state.workflows.values().map(|w| w.stats.count).sum(),
            slowest_nodes: slowest,
            most_error_prone_nodes: error_prone,
            active_alerts: state.active.len(),
            alerts_by_severity,
        }
    }

    /// Drop all metrics and alerts. Rules are kept.
    pub fn clear_history(&self) {
        let mut state = self.state();
        state.nodes.clear();
        state.workflows.clear();
        state.trends.clear();
        state.active.clear();
        state.history.clear();
    }
}

fn workflow_entry<'a>(
    workflows: &'a mut HashMap<String, WorkflowMetrics>,
    workflow_id: &str,
    now: DateTime<Utc>,
) -> &'a mut WorkflowMetrics {
    let workflow = workflows
        .entry(workflow_id.to_string())
        .or_insert_with(|| WorkflowMetrics {
            workflow_id: workflow_id.to_string(),
            stats: DurationStats::default(),
            step_count: 0,
            step_error_count: 0,
            step_error_rate: 0.0,
            last_updated: now,
        });
    workflow.last_updated = now;
    workflow
}
