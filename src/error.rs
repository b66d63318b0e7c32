//! Error types for kbflow

use thiserror::Error;

/// Definition errors. Fatal at validation time: an execution never starts.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum GraphError {
    /// The edge set contains a cycle
    #[error("Cycle detected in workflow graph: {0}")]
    CycleDetected(String),

    /// An edge references a node id that is not declared
    #[error("Edge '{edge}' references unknown node '{node}'")]
    UnknownNode { edge: String, node: String },

    /// Two nodes share the same id
    #[error("Duplicate node id '{0}'")]
    DuplicateNode(String),

    /// An edge names an input/output the node does not declare
    #[error("Edge '{edge}' references unknown port '{port}' on node '{node}'")]
    UnknownPort {
        edge: String,
        node: String,
        port: String,
    },

    /// More than one edge writes the same target input
    #[error("Edges '{first}' and '{second}' both write input '{input}' of node '{node}'")]
    ConflictingEdges {
        node: String,
        input: String,
        first: String,
        second: String,
    },

    /// A condition or transform does not parse
    #[error("Edge '{edge}' has an invalid expression: {reason}")]
    InvalidExpression { edge: String, reason: String },

    /// A timeout is not a positive number of seconds within bounds
    #[error("Timeout of '{owner}' is out of range: {secs}")]
    InvalidTimeout { owner: String, secs: f64 },

    /// The definition has nodes but none with in-degree 0
    #[error("Workflow has no entry node")]
    NoEntryNode,
}

/// Per-step failure, captured into `ExecutionStep::error` and never fatal to the scheduler
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NodeError {
    #[error("Node '{node}' failed: {message}")]
    Failed { node: String, message: String },

    #[error("Node '{node}' timed out after {timeout_ms} ms")]
    Timeout { node: String, timeout_ms: u64 },

    #[error("Node '{0}' was cancelled")]
    Cancelled(String),

    #[error("No executor registered for node type '{0}'")]
    UnknownType(String),

    #[error("Node '{node}' is missing required input '{input}'")]
    MissingInput { node: String, input: String },

    #[error("Node '{0}' requests more resources than the budget can ever grant")]
    BudgetExceedsCapacity(String),
}

/// State store failures
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("State store connection poisoned")]
    Poisoned,
}

/// kbflow error types
#[derive(Error, Debug)]
pub enum FlowError {
    /// Invalid workflow graph
    #[error(transparent)]
    Graph(#[from] GraphError),

    /// Persistence failures
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Another runner holds the lease for this execution
    #[error("Execution '{0}' is locked by another runner")]
    LockContention(String),

    /// Unknown execution or checkpoint
    #[error("Not found: {0}")]
    NotFound(String),

    /// YAML parsing errors
    #[error("YAML parse error: {0}")]
    YamlParse(#[from] serde_yaml::Error),

    /// JSON parsing errors
    #[error("JSON parse error: {0}")]
    JsonParse(#[from] serde_json::Error),

    /// Definition file exceeded limit
    #[error("Workflow definition exceeds 1MB limit (size: {0} bytes)")]
    DefinitionTooLarge(usize),

    /// Node count exceeded limit
    #[error("Node count {count} exceeds limit of {limit}")]
    NodeCountExceeded { count: usize, limit: usize },

    /// Invalid node id format
    #[error("Invalid node id '{id}': only alphanumeric, underscore, and dash allowed (max {max} chars)")]
    InvalidNodeId { id: String, max: usize },

    /// Settings loading errors
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// HTTP errors
    #[error("HTTP error: {0}")]
    Http(String),

    /// Validation errors
    #[error("Validation error: {0}")]
    Validation(String),

    /// Generic error
    #[error("Error: {0}")]
    Other(String),
}

impl From<rusqlite::Error> for FlowError {
    fn from(e: rusqlite::Error) -> Self {
        FlowError::Store(StoreError::Database(e))
    }
}

/// Result type alias using FlowError
pub type Result<T> = std::result::Result<T, FlowError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_graph_error_display() {
        let err = GraphError::CycleDetected("a -> b -> a".to_string());
        assert_eq!(err.to_string(), "Cycle detected in workflow graph: a -> b -> a");

        let err = GraphError::UnknownNode {
            edge: "e1".to_string(),
            node: "ghost".to_string(),
        };
        assert!(err.to_string().contains("ghost"));
    }

    #[test]
    fn test_node_timeout_mentions_timeout() {
        let err = NodeError::Timeout {
            node: "slow".to_string(),
            timeout_ms: 500,
        };
        assert!(err.to_string().contains("timed out"));
    }

    #[test]
    fn test_graph_error_converts_to_flow_error() {
        let err: FlowError = GraphError::NoEntryNode.into();
        assert!(matches!(err, FlowError::Graph(GraphError::NoEntryNode)));
    }
}
