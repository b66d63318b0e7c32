//! kbflow - DAG workflow execution core for knowledge-base RAG pipelines
//!
//! Workflows are graphs of typed nodes joined by edges that may carry a
//! condition or a transform. The [`engine::WorkflowEngine`] validates a
//! definition, schedules ready nodes under a shared resource budget,
//! checkpoints progress to SQLite and guards each execution with a lease.

pub mod budget;
pub mod cli;
pub mod engine;
pub mod error;
pub mod executors;
pub mod expr;
pub mod graph;
pub mod lock;
pub mod logging;
pub mod metrics;
pub mod models;
pub mod monitor;
pub mod parser;
pub mod persist;
pub mod rag;
pub mod retry;
pub mod runner;
pub mod scheduler;
pub mod settings;
pub mod state;
pub mod sweeper;
pub mod templates;
