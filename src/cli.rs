//! CLI interface for kbflow

use crate::engine::{ExecuteOptions, WorkflowEngine};
use crate::logging::init_logging;
use crate::metrics::MetricsServer;
use crate::models::{ExecutionStatus, WorkflowExecutionContext};
use crate::parser::parse_workflow_file;
use crate::runner::{NodeRegistry, PortMap};
use crate::scheduler::CheckpointPolicy;
use crate::settings::EngineSettings;
use crate::state::StateStore;
use crate::sweeper::sweep_once;
use crate::templates;
use chrono::Utc;
use clap::{Parser, Subcommand, ValueEnum};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{error, info};

/// kbflow - DAG workflow execution core for knowledge-base RAG pipelines
#[derive(Parser, Debug)]
#[command(name = "kbflow")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "DAG workflow execution core for knowledge-base RAG pipelines", long_about = None)]
pub struct Cli {
    /// Settings file (TOML, YAML or JSON)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Log level (error, warn, info, debug, trace)
    #[arg(short, long, global = true)]
    pub log_level: Option<String>,

    /// Log format (json or pretty)
    #[arg(long, global = true)]
    pub log_format: Option<String>,

    /// Database path for state persistence
    #[arg(long, global = true)]
    pub db_path: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Execute a workflow once
    Run {
        /// Path to workflow YAML or JSON file
        workflow: PathBuf,

        /// Execution input as a JSON object
        #[arg(short, long, conflicts_with = "input_file")]
        input: Option<String>,

        /// File holding the execution input as a JSON object
        #[arg(long)]
        input_file: Option<PathBuf>,

        /// Run one node at a time
        #[arg(long)]
        serial: bool,

        /// Override max_parallel_workers
        #[arg(long)]
        max_workers: Option<usize>,

        /// Checkpoint after every N node runs
        #[arg(long)]
        checkpoint_every: Option<usize>,

        /// Log resolved node inputs and outputs
        #[arg(long)]
        debug: bool,
    },

    /// Validate a workflow definition and its graph
    Validate {
        /// Path to workflow YAML or JSON file
        workflow: PathBuf,
    },

    /// Continue an execution from a checkpoint
    Resume {
        execution_id: String,

        /// Checkpoint index to resume from
        #[arg(long, default_value = "0")]
        checkpoint: usize,
    },

    /// Re-run a node and everything downstream of it as a new execution
    Retry {
        execution_id: String,

        /// Node to re-run from
        #[arg(long)]
        node: String,
    },

    /// Show the persisted state of an execution
    Status {
        execution_id: String,

        /// Print the full context as JSON
        #[arg(long)]
        json: bool,
    },

    /// List recent executions of a workflow
    List {
        /// Workflow id
        workflow: String,

        /// Number of executions to show
        #[arg(long, default_value = "10")]
        limit: usize,
    },

    /// Show execution statistics
    Metrics {
        /// Workflow id (all workflows if omitted)
        #[arg(short, long)]
        workflow: Option<String>,

        /// Window in hours
        #[arg(long, default_value = "24")]
        hours: i64,
    },

    /// Delete expired executions and checkpoints now
    Sweep,

    /// Generate example workflow YAML templates
    Template {
        /// Template type (omit to list available templates)
        #[arg(short = 't', long = "type")]
        template_type: Option<TemplateType>,

        /// Write output to a file instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

/// Available template types for the `template` subcommand.
#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum TemplateType {
    /// Input passed straight to an output node
    Minimal,
    /// Remote provider call with retry and a status condition
    Http,
    /// Parallel HTTP branches merged by one output node
    Fanout,
    /// Canonical RAG chat pipeline
    Rag,
}

impl TemplateType {
    fn name(self) -> &'static str {
        match self {
            TemplateType::Minimal => "minimal",
            TemplateType::Http => "http",
            TemplateType::Fanout => "fanout",
            TemplateType::Rag => "rag",
        }
    }
}

/// Parse a JSON object into an input map
pub fn parse_input(raw: &str) -> anyhow::Result<PortMap> {
    match serde_json::from_str::<Value>(raw)? {
        Value::Object(map) => Ok(map),
        other => anyhow::bail!("Execution input must be a JSON object, got {}", other),
    }
}

impl Cli {
    /// Settings file and environment, then command line overrides
    pub fn settings(&self) -> anyhow::Result<EngineSettings> {
        let mut settings = EngineSettings::load(self.config.as_deref())?;
        if let Some(path) = &self.db_path {
            settings.database_path = path.clone();
        }
        if let Some(level) = &self.log_level {
            settings.log_level = level.clone();
        }
        if let Some(format) = &self.log_format {
            settings.log_format = format.clone();
        }
        Ok(settings)
    }

    /// Execute the CLI command
    pub async fn execute(&self) -> anyhow::Result<()> {
        let settings = self.settings()?;
        init_logging(&settings.log_config())?;

        match &self.command {
            Commands::Run {
                workflow,
                input,
                input_file,
                serial,
                max_workers,
                checkpoint_every,
                debug,
            } => {
                let input = match (input, input_file) {
                    (Some(raw), _) => parse_input(raw)?,
                    (None, Some(path)) => parse_input(&std::fs::read_to_string(path)?)?,
                    (None, None) => PortMap::new(),
                };
                let options = ExecuteOptions {
                    debug: *debug,
                    enable_parallel: serial.then_some(false),
                    max_workers: *max_workers,
                    checkpoint: checkpoint_every.map(CheckpointPolicy::every),
                };
                self.run_workflow(&settings, workflow, input, options).await?;
            }
            Commands::Validate { workflow } => {
                self.validate_workflow(workflow)?;
            }
            Commands::Resume {
                execution_id,
                checkpoint,
            } => {
                let engine = self.engine(&settings).await?;
                let context = engine.resume_execution(execution_id, *checkpoint).await?;
                report(&context)?;
            }
            Commands::Retry { execution_id, node } => {
                let engine = self.engine(&settings).await?;
                let context = engine.retry_from_node(execution_id, node).await?;
                report(&context)?;
            }
            Commands::Status { execution_id, json } => {
                let store = StateStore::new(&settings.database_path)?;
                let context = store.load(execution_id)?;
                if *json {
                    println!("{}", serde_json::to_string_pretty(&context)?);
                } else {
                    print_status(&context, &store)?;
                }
            }
            Commands::List { workflow, limit } => {
                self.list_executions(&settings, workflow, *limit)?;
            }
            Commands::Metrics { workflow, hours } => {
                let store = StateStore::new(&settings.database_path)?;
                let since = Utc::now() - chrono::Duration::hours(*hours);
                let stats = store.execution_stats(workflow.as_deref(), since)?;
                println!("{}", serde_json::to_string_pretty(&stats)?);
            }
            Commands::Sweep => {
                let store = StateStore::new(&settings.database_path)?.with_ttl(settings.state_ttl());
                let report = sweep_once(&store, None).await?;
                println!(
                    "Removed {} executions and {} checkpoints",
                    report.removed.executions, report.removed.checkpoints
                );
            }
            Commands::Template {
                template_type,
                output,
            } => {
                self.handle_template(*template_type, output.as_deref())?;
            }
        }
        Ok(())
    }

    /// Engine with built-in node types, exporting metrics if a port is configured
    async fn engine(&self, settings: &EngineSettings) -> anyhow::Result<WorkflowEngine> {
        let store = StateStore::new(&settings.database_path)?.with_ttl(settings.state_ttl());
        let mut builder = WorkflowEngine::builder(store)
            .settings(settings)
            .registry(NodeRegistry::with_builtins());

        if let Some(port) = settings.metrics_port {
            let metrics = Arc::new(MetricsServer::new()?);
            metrics.start(port).await?;
            builder = builder.metrics(metrics);
        }

        Ok(builder.build()?)
    }

    /// Run a workflow once
    async fn run_workflow(
        &self,
        settings: &EngineSettings,
        workflow_path: &Path,
        input: PortMap,
        options: ExecuteOptions,
    ) -> anyhow::Result<()> {
        info!("Loading workflow from: {:?}", workflow_path);
        let definition = parse_workflow_file(workflow_path)?;
        info!("Workflow '{}' loaded successfully", definition.id);

        let engine = self.engine(settings).await?;
        let context = engine.execute_workflow(&definition, input, options).await?;
        report(&context)
    }

    /// Validate a workflow without executing
    fn validate_workflow(&self, workflow_path: &Path) -> anyhow::Result<()> {
        info!("Validating workflow: {:?}", workflow_path);

        let definition = parse_workflow_file(workflow_path)?;
        let graph = crate::graph::WorkflowGraph::build(&definition, &crate::expr::ExpressionRegistry::new())?;
        let levels = graph.parallel_levels();

        println!("Workflow '{}' is valid", definition.id);
        println!("Nodes: {}", graph.node_count());
        println!("Edges: {}", definition.edges.len());
        println!("Output nodes: {}", graph.output_nodes().join(", "));
        println!("Execution levels:");
        for (depth, level) in levels.iter().enumerate() {
            println!("  {}: {}", depth, level.join(", "));
        }

        Ok(())
    }

    fn list_executions(&self, settings: &EngineSettings, workflow: &str, limit: usize) -> anyhow::Result<()> {
        let store = StateStore::new(&settings.database_path)?;
        let ids = store.list_executions(workflow, limit)?;

        println!("Workflow: {}", workflow);
        println!("Recent executions (limit {}):", limit);
        println!();

        if ids.is_empty() {
            println!("No executions found");
            return Ok(());
        }

        println!("{:<38} {:<10} {:<26} DURATION", "EXECUTION ID", "STATUS", "STARTED");
        println!("{}", "-".repeat(90));
        for id in ids {
            let context = store.load(&id)?;
            let duration = context
                .duration_secs()
                .map(format_duration)
                .unwrap_or_else(|| "-".to_string());
            println!(
                "{:<38} {:<10} {:<26} {}",
                context.execution_id,
                context.status.to_string(),
                context.start_time.format("%Y-%m-%d %H:%M:%S UTC"),
                duration
            );
        }

        Ok(())
    }

    /// Handle the `template` subcommand.
    fn handle_template(&self, template_type: Option<TemplateType>, output: Option<&Path>) -> anyhow::Result<()> {
        let Some(tt) = template_type else {
            // No type specified, list available templates.
            println!("Available templates:\n");
            let header_type = "TYPE";
            let header_desc = "DESCRIPTION";
            println!("{header_type:<12} {header_desc}");
            println!("{}", "-".repeat(60));
            for info in templates::list_templates() {
                println!("{:<12} {}", info.name, info.description);
            }
            println!();
            println!("Usage: kbflow template --type <TYPE> [-o <FILE>]");
            return Ok(());
        };

        let content = templates::get_template(tt.name())
            .ok_or_else(|| anyhow::anyhow!("Unknown template type: {}", tt.name()))?;

        if let Some(path) = output {
            use std::fs::OpenOptions;
            use std::io::Write as _;
            let mut file = OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(path)
                .map_err(|e| {
                    if e.kind() == std::io::ErrorKind::AlreadyExists {
                        anyhow::anyhow!(
                            "File '{}' already exists. Remove it first or choose a different name.",
                            path.display()
                        )
                    } else {
                        e.into()
                    }
                })?;
            file.write_all(content.as_bytes())?;
            println!("Template written to {}", path.display());
        } else {
            print!("{content}");
        }

        Ok(())
    }
}

/// Print the outcome of a finished execution; an error status fails the command
fn report(context: &WorkflowExecutionContext) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(&context.output_data)?);

    match context.status {
        ExecutionStatus::Completed => {
            info!("Execution {} completed", context.execution_id);
            Ok(())
        }
        _ => {
            let reason = context.error.as_deref().unwrap_or("unknown error");
            error!("Execution {} failed: {}", context.execution_id, reason);
            anyhow::bail!("Execution {} ended with error: {}", context.execution_id, reason)
        }
    }
}

fn print_status(context: &WorkflowExecutionContext, store: &StateStore) -> anyhow::Result<()> {
    println!("Execution ID: {}", context.execution_id);
    println!("Workflow: {}", context.workflow_id);
    println!("Status: {}", context.status);
    println!("Started: {}", context.start_time);
    if let Some(end) = context.end_time {
        println!("Finished: {}", end);
    }
    if let Some(duration) = context.duration_secs() {
        println!("Duration: {}", format_duration(duration));
    }
    if let Some(error) = &context.error {
        println!("Error: {}", error);
    }

    println!("Steps:");
    for step in &context.steps {
        let duration = step
            .duration
            .map(format_duration)
            .unwrap_or_else(|| "-".to_string());
        println!("  - {} [{}] {}", step.node_id, step.status, duration);
        if let Some(error) = &step.error {
            println!("      {}", error);
        }
    }

    let checkpoints = store.list_checkpoints(&context.execution_id)?;
    println!("Checkpoints: {}", checkpoints.len());
    for checkpoint in &checkpoints {
        println!(
            "  {}: {} steps at {}",
            checkpoint.index, checkpoint.step_count, checkpoint.timestamp
        );
    }

    Ok(())
}

/// Format a duration in seconds to a human-readable string
fn format_duration(seconds: f64) -> String {
    if seconds < 60.0 {
        return format!("{:.2}s", seconds);
    }
    let whole = seconds.round() as u64;
    if whole < 3600 {
        format!("{}m {}s", whole / 60, whole % 60)
    } else {
        format!("{}h {}m {}s", whole / 3600, (whole % 3600) / 60, whole % 60)
    }
}
