//! Prometheus metrics collection and HTTP endpoint
//!
//! Workflow and node counters are exposed in Prometheus text format on
//! `GET /metrics`. Everything here is observational.
//!
//! # Available Metrics
//!
//! - `kbflow_workflow_executions_total{workflow, status}` - Counter of finished executions
//! - `kbflow_node_executions_total{workflow, node, status}` - Counter of terminal steps
//! - `kbflow_node_duration_seconds{workflow, node}` - Histogram of node durations
//! - `kbflow_active_workflows` - Gauge of executions being driven
//! - `kbflow_active_nodes` - Gauge of nodes currently running
//! - `kbflow_budget_utilization{pool}` - Gauge of reserved fraction per resource pool
//!
//! # Example
//!
//! ```no_run
//! use kbflow::metrics::MetricsServer;
//!
//! # async fn example() -> anyhow::Result<()> {
//! let metrics = MetricsServer::new()?;
//! metrics.start(9090).await?;
//! metrics.record_workflow_execution("rag_chat", "completed");
//! metrics.record_node_execution("rag_chat", "generate_embedding", "completed", 0.42);
//! # Ok(())
//! # }
//! ```

use crate::budget::BudgetUtilization;
use prometheus::{
    CounterVec, Encoder, Gauge, GaugeVec, HistogramOpts, HistogramVec, Opts, Registry, TextEncoder,
};
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{error, info};

/// Histogram bucket boundaries for node duration metrics (in seconds)
const NODE_DURATION_BUCKETS: &[f64] = &[0.01, 0.05, 0.1, 0.5, 1.0, 2.0, 5.0, 10.0, 30.0, 60.0, 300.0];

/// Prometheus metrics server
#[derive(Clone)]
pub struct MetricsServer {
    registry: Arc<Registry>,
    workflow_executions: CounterVec,
    node_executions: CounterVec,
    node_duration: HistogramVec,
    active_workflows: Gauge,
    active_nodes: Gauge,
    budget_utilization: GaugeVec,
}

impl std::fmt::Debug for MetricsServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetricsServer").finish_non_exhaustive()
    }
}

impl MetricsServer {
    /// Create the metric families in a fresh registry
    pub fn new() -> prometheus::Result<Self> {
        let registry = Registry::new();

        let workflow_executions = CounterVec::new(
            Opts::new(
                "kbflow_workflow_executions_total",
                "Total number of finished workflow executions",
            ),
            &["workflow", "status"],
        )?;

        let node_executions = CounterVec::new(
            Opts::new("kbflow_node_executions_total", "Total number of terminal node steps"),
            &["workflow", "node", "status"],
        )?;

        let node_duration = HistogramVec::new(
            HistogramOpts::new("kbflow_node_duration_seconds", "Node execution duration in seconds")
                .buckets(NODE_DURATION_BUCKETS.to_vec()),
            &["workflow", "node"],
        )?;

        let active_workflows = Gauge::with_opts(Opts::new("kbflow_active_workflows", "Active workflow executions"))?;
        let active_nodes = Gauge::with_opts(Opts::new("kbflow_active_nodes", "Nodes currently running"))?;

        let budget_utilization = GaugeVec::new(
            Opts::new("kbflow_budget_utilization", "Reserved fraction of each resource pool"),
            &["pool"],
        )?;

        registry.register(Box::new(workflow_executions.clone()))?;
        registry.register(Box::new(node_executions.clone()))?;
        registry.register(Box::new(node_duration.clone()))?;
        registry.register(Box::new(active_workflows.clone()))?;
        registry.register(Box::new(active_nodes.clone()))?;
        registry.register(Box::new(budget_utilization.clone()))?;

        Ok(Self {
            registry: Arc::new(registry),
            workflow_executions,
            node_executions,
            node_duration,
            active_workflows,
            active_nodes,
            budget_utilization,
        })
    }

    /// Start the HTTP metrics server on the specified port
    ///
    /// The listener runs on a background task; this returns once bound.
    pub async fn start(&self, port: u16) -> anyhow::Result<()> {
        let addr = format!("127.0.0.1:{}", port);
        let listener = TcpListener::bind(&addr).await?;
        info!("Metrics server listening on http://{}/metrics", addr);

        let registry = Arc::clone(&self.registry);

        tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, _addr)) => {
                        let registry = Arc::clone(&registry);
                        tokio::spawn(async move {
                            if let Err(e) = Self::handle_request(stream, registry).await {
                                error!("Error handling metrics request: {}", e);
                            }
                        });
                    }
                    Err(e) => {
                        error!("Error accepting connection: {}", e);
                    }
                }
            }
        });

        Ok(())
    }

    async fn handle_request(mut stream: tokio::net::TcpStream, registry: Arc<Registry>) -> anyhow::Result<()> {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let mut buffer = [0; 1024];
        let n = stream.read(&mut buffer).await?;
        let request = String::from_utf8_lossy(&buffer[..n]);

        if request.starts_with("GET /metrics") {
            let body = encode(&registry)?;
            let response = format!(
                "HTTP/1.1 200 OK\r\nContent-Type: text/plain; version=0.0.4\r\nContent-Length: {}\r\n\r\n{}",
                body.len(),
                body
            );
            stream.write_all(response.as_bytes()).await?;
        } else {
            let response = "HTTP/1.1 404 Not Found\r\nContent-Length: 9\r\n\r\nNot Found";
            stream.write_all(response.as_bytes()).await?;
        }

        Ok(())
    }

    /// Current metrics in Prometheus text format
    pub fn render(&self) -> anyhow::Result<String> {
        encode(&self.registry)
    }

    /// Record a finished execution
    pub fn record_workflow_execution(&self, workflow: &str, status: &str) {
        self.workflow_executions.with_label_values(&[workflow, status]).inc();
    }

    /// Record a terminal step
    ///
    /// # Arguments
    ///
    /// * `workflow` - Workflow id
    /// * `node` - Node id
    /// * `status` - Step status ("completed", "error", "skipped")
    /// * `duration_secs` - Step duration in seconds
    pub fn record_node_execution(&self, workflow: &str, node: &str, status: &str, duration_secs: f64) {
        self.node_executions.with_label_values(&[workflow, node, status]).inc();
        self.node_duration
            .with_label_values(&[workflow, node])
            .observe(duration_secs);
    }

    pub fn inc_active_workflows(&self) {
        self.active_workflows.inc();
    }

    pub fn dec_active_workflows(&self) {
        self.active_workflows.dec();
    }

    pub fn inc_active_nodes(&self) {
        self.active_nodes.inc();
    }

    pub fn dec_active_nodes(&self) {
        self.active_nodes.dec();
    }

    pub fn set_budget_utilization(&self, utilization: &BudgetUtilization) {
        self.budget_utilization.with_label_values(&["cpu"]).set(utilization.cpu);
        self.budget_utilization.with_label_values(&["memory"]).set(utilization.memory);
        self.budget_utilization.with_label_values(&["network"]).set(utilization.network);
    }
}

fn encode(registry: &Registry) -> anyhow::Result<String> {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    encoder.encode(&registry.gather(), &mut buffer)?;
    Ok(String::from_utf8(buffer)?)
}
