//! Workflow definition loading with input limits
//!
//! Definitions are YAML or JSON. Parsing enforces the size and count limits
//! from [`crate::models`] and the id format, then fills defaults. Structural
//! checks (cycles, unknown nodes, conflicting edges) belong to
//! [`crate::graph`].

use crate::error::{FlowError, Result};
use crate::models::*;
use std::fs;
use std::path::Path;

/// Largest accepted `max_parallel_workers`
pub const MAX_PARALLEL_WORKERS_LIMIT: usize = 256;

/// Definition file formats
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DefinitionFormat {
    Yaml,
    Json,
}

impl DefinitionFormat {
    /// `.json` files are JSON, everything else is YAML
    pub fn from_path(path: &Path) -> Self {
        match path.extension().and_then(|e| e.to_str()) {
            Some(ext) if ext.eq_ignore_ascii_case("json") => DefinitionFormat::Json,
            _ => DefinitionFormat::Yaml,
        }
    }
}

/// Parse a workflow definition file, picking the format from its extension.
///
/// # Errors
///
/// * `FlowError::Io` - If the file cannot be read
/// * `FlowError::DefinitionTooLarge` - If the file exceeds 1MB
/// * `FlowError::NodeCountExceeded` - If the workflow has more than 1,000 nodes
/// * `FlowError::InvalidNodeId` - If a node, edge or workflow id is malformed
/// * `FlowError::YamlParse` / `FlowError::JsonParse` - If the document is malformed
///
/// # Example
///
/// ```no_run
/// use kbflow::parser::parse_workflow_file;
///
/// let definition = parse_workflow_file("workflow.yaml")?;
/// println!("Loaded workflow: {}", definition.name);
/// # Ok::<(), kbflow::error::FlowError>(())
/// ```
pub fn parse_workflow_file<P: AsRef<Path>>(path: P) -> Result<WorkflowDefinition> {
    let path = path.as_ref();
    let content = fs::read_to_string(path)?;
    parse_workflow_str(&content, DefinitionFormat::from_path(path))
}

/// Parse a YAML definition
///
/// ```
/// use kbflow::parser::parse_workflow_yaml;
///
/// let yaml = r#"
/// id: greet
/// name: Greeting
/// nodes:
///   - id: start
///     type: input
///   - id: finish
///     type: output
/// edges:
///   - { id: e1, source: start, target: finish, source_output: name, target_input: name }
/// "#;
///
/// let definition = parse_workflow_yaml(yaml)?;
/// assert_eq!(definition.nodes.len(), 2);
/// assert_eq!(definition.nodes[0].name, "start");
/// # Ok::<(), kbflow::error::FlowError>(())
/// ```
pub fn parse_workflow_yaml(content: &str) -> Result<WorkflowDefinition> {
    parse_workflow_str(content, DefinitionFormat::Yaml)
}

/// Parse a JSON definition
pub fn parse_workflow_json(content: &str) -> Result<WorkflowDefinition> {
    parse_workflow_str(content, DefinitionFormat::Json)
}

pub fn parse_workflow_str(content: &str, format: DefinitionFormat) -> Result<WorkflowDefinition> {
    if content.len() > MAX_DEFINITION_SIZE {
        return Err(FlowError::DefinitionTooLarge(content.len()));
    }

    let mut definition: WorkflowDefinition = match format {
        DefinitionFormat::Yaml => serde_yaml::from_str(content)?,
        DefinitionFormat::Json => serde_json::from_str(content)?,
    };

    check_limits(&definition)?;
    apply_defaults(&mut definition);
    Ok(definition)
}

/// Check counts, ids and global config of an already deserialized definition
pub fn check_limits(definition: &WorkflowDefinition) -> Result<()> {
    if definition.nodes.len() > MAX_NODE_COUNT {
        return Err(FlowError::NodeCountExceeded {
            count: definition.nodes.len(),
            limit: MAX_NODE_COUNT,
        });
    }
    if definition.edges.len() > MAX_EDGE_COUNT {
        return Err(FlowError::Validation(format!(
            "Edge count {} exceeds limit of {}",
            definition.edges.len(),
            MAX_EDGE_COUNT
        )));
    }

    validate_id(&definition.id)?;
    for node in &definition.nodes {
        validate_id(&node.id)?;
    }
    for edge in &definition.edges {
        validate_id(&edge.id)?;
    }

    let global = &definition.global_config;
    if global.max_parallel_workers == 0 {
        return Err(FlowError::Validation(
            "max_parallel_workers must be at least 1 to avoid deadlock".to_string(),
        ));
    }
    if global.max_parallel_workers > MAX_PARALLEL_WORKERS_LIMIT {
        return Err(FlowError::Validation(format!(
            "max_parallel_workers must be at most {}",
            MAX_PARALLEL_WORKERS_LIMIT
        )));
    }

    for (owner, secs) in configured_timeouts(definition) {
        if !timeout_in_range(secs) {
            return Err(FlowError::Validation(format!(
                "Timeout of '{}' must be between 0 and {} seconds, got {}",
                owner, MAX_TIMEOUT_SECS, secs
            )));
        }
    }

    Ok(())
}

/// Ids are 1-64 characters of alphanumerics, underscore and dash
pub fn validate_id(id: &str) -> Result<()> {
    let valid = !id.is_empty()
        && id.len() <= MAX_ID_LEN
        && id.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');

    if valid {
        Ok(())
    } else {
        Err(FlowError::InvalidNodeId {
            id: id.to_string(),
            max: MAX_ID_LEN,
        })
    }
}

/// Unnamed nodes and workflows take their id as name
fn apply_defaults(definition: &mut WorkflowDefinition) {
    if definition.name.is_empty() {
        definition.name = definition.id.clone();
    }
    for node in &mut definition.nodes {
        if node.name.is_empty() {
            node.name = node.id.clone();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const SIMPLE: &str = r#"
id: simple
name: Simple
global_config:
  node_timeout: 30
nodes:
  - id: start
    type: input
  - id: call
    type: http
    timeout: 5
    retry: { max_retries: 2 }
    config:
      url: https://example.com
  - id: finish
    type: output
edges:
  - { id: e1, source: start, target: call, source_output: query, target_input: query }
  - { id: e2, source: call, target: finish, source_output: "*", target_input: body, condition: "output.status_code == 200" }
"#;

    #[test]
    fn test_parse_simple_workflow() {
        let def = parse_workflow_yaml(SIMPLE).unwrap();
        assert_eq!(def.id, "simple");
        assert_eq!(def.version, "1.0.0");
        assert_eq!(def.nodes.len(), 3);
        assert_eq!(def.nodes[1].timeout, Some(5.0));
        assert_eq!(def.nodes[1].retry.as_ref().unwrap().base_delay, 1_000);
        assert_eq!(def.global_config.node_timeout, Some(30.0));
        assert!(def.global_config.enable_parallel_execution);
        assert_eq!(def.edges[1].condition.as_deref(), Some("output.status_code == 200"));
    }

    #[test]
    fn test_parse_json_matches_yaml() {
        let yaml = parse_workflow_yaml(SIMPLE).unwrap();
        let json = serde_json::to_string(&yaml).unwrap();
        assert_eq!(parse_workflow_json(&json).unwrap(), yaml);
    }

    #[test]
    fn test_parse_file_by_extension() {
        let def = parse_workflow_yaml(SIMPLE).unwrap();
        let mut file = tempfile::Builder::new().suffix(".json").tempfile().unwrap();
        write!(file, "{}", serde_json::to_string(&def).unwrap()).unwrap();

        assert_eq!(parse_workflow_file(file.path()).unwrap(), def);
        assert_eq!(DefinitionFormat::from_path(Path::new("a.yml")), DefinitionFormat::Yaml);
        assert_eq!(DefinitionFormat::from_path(Path::new("a.JSON")), DefinitionFormat::Json);
    }

    #[test]
    fn test_size_limit() {
        let large = "id: big\nname: big\nnodes:\n".to_string() + &"  - { id: x, type: input }\n".repeat(50_000);
        let result = parse_workflow_yaml(&large);
        assert!(matches!(result, Err(FlowError::DefinitionTooLarge(_))));
    }

    #[test]
    fn test_node_count_limit() {
        let mut yaml = "id: many\nname: many\nnodes:\n".to_string();
        for i in 0..1001 {
            yaml.push_str(&format!("  - {{ id: n{}, type: input }}\n", i));
        }
        let result = parse_workflow_yaml(&yaml);
        assert!(matches!(result, Err(FlowError::NodeCountExceeded { count: 1001, .. })));
    }

    #[test]
    fn test_id_validation() {
        assert!(validate_id("node_1").is_ok());
        assert!(validate_id("node-1").is_ok());
        assert!(validate_id("NODE1").is_ok());

        assert!(matches!(validate_id(""), Err(FlowError::InvalidNodeId { .. })));
        assert!(matches!(validate_id("node 1"), Err(FlowError::InvalidNodeId { .. })));
        assert!(matches!(validate_id("node:1"), Err(FlowError::InvalidNodeId { .. })));
        assert!(matches!(validate_id(&"a".repeat(65)), Err(FlowError::InvalidNodeId { .. })));
    }

    #[test]
    fn test_invalid_node_id_in_definition() {
        let yaml = "id: wf\nname: wf\nnodes:\n  - { id: \"bad id\", type: input }\n";
        assert!(matches!(parse_workflow_yaml(yaml), Err(FlowError::InvalidNodeId { .. })));
    }

    #[test]
    fn test_worker_bounds() {
        let zero = "id: wf\nname: wf\nglobal_config: { max_parallel_workers: 0 }\nnodes: [{ id: a, type: input }]\n";
        assert!(matches!(parse_workflow_yaml(zero), Err(FlowError::Validation(_))));

        let huge = "id: wf\nname: wf\nglobal_config: { max_parallel_workers: 1000 }\nnodes: [{ id: a, type: input }]\n";
        assert!(matches!(parse_workflow_yaml(huge), Err(FlowError::Validation(_))));
    }

    #[test]
    fn test_non_positive_timeout_rejected() {
        let yaml = "id: wf\nname: wf\nnodes: [{ id: a, type: input, timeout: 0 }]\n";
        let result = parse_workflow_yaml(yaml);
        assert!(matches!(result, Err(FlowError::Validation(msg)) if msg.contains("'a'")));
    }

    #[test]
    fn test_oversized_timeout_rejected() {
        let yaml = "id: wf\nname: wf\nglobal_config: { timeout: 1.0e20 }\nnodes: [{ id: a, type: input }]\n";
        let result = parse_workflow_yaml(yaml);
        assert!(matches!(result, Err(FlowError::Validation(msg)) if msg.contains("'timeout'")));

        let yaml = "id: wf\nname: wf\nnodes: [{ id: a, type: input, timeout: 604800 }]\n";
        assert!(parse_workflow_yaml(yaml).is_ok());
    }

    #[test]
    fn test_defaults_fill_names() {
        let yaml = "id: wf\nname: \"\"\nnodes: [{ id: a, type: input }]\n";
        let def = parse_workflow_yaml(yaml).unwrap();
        assert_eq!(def.name, "wf");
        assert_eq!(def.nodes[0].name, "a");
    }

    #[test]
    fn test_malformed_yaml() {
        assert!(matches!(parse_workflow_yaml("id: [unclosed"), Err(FlowError::YamlParse(_))));
        assert!(matches!(parse_workflow_json("{"), Err(FlowError::JsonParse(_))));
    }
}
