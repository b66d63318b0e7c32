//! Built-in workflow templates for the `kbflow template` subcommand.

use crate::rag::rag_workflow;

/// Metadata for a template type.
#[derive(Debug, Clone)]
pub struct TemplateInfo {
    /// Template name (matches the CLI `--type` value).
    pub name: &'static str,
    /// Short description shown in the listing table.
    pub description: &'static str,
}

/// Returns metadata for every available template.
pub fn list_templates() -> Vec<TemplateInfo> {
    vec![
        TemplateInfo {
            name: "minimal",
            description: "Input passed straight to an output node",
        },
        TemplateInfo {
            name: "http",
            description: "Remote provider call with retry, timeout and a status condition",
        },
        TemplateInfo {
            name: "fanout",
            description: "Three parallel HTTP branches merged by one output node",
        },
        TemplateInfo {
            name: "rag",
            description: "Canonical RAG chat pipeline with embedding and retrieval fallbacks",
        },
    ]
}

/// Returns the YAML content for a given template type.
///
/// The `template_type` must be one of: `minimal`, `http`, `fanout`, `rag`.
pub fn get_template(template_type: &str) -> Option<String> {
    match template_type {
        "minimal" => Some(TEMPLATE_MINIMAL.to_string()),
        "http" => Some(TEMPLATE_HTTP.to_string()),
        "fanout" => Some(TEMPLATE_FANOUT.to_string()),
        "rag" => serde_yaml::to_string(&rag_workflow())
            .ok()
            .map(|body| format!("{}{}", RAG_HEADER, body)),
        _ => None,
    }
}

const TEMPLATE_MINIMAL: &str = r#"# kbflow workflow: minimal example
# The input node receives the whole execution input and the output node
# returns the `message` field.
id: minimal
name: Minimal workflow
nodes:
  - id: start
    type: input
  - id: finish
    type: output
edges:
  - id: start_to_finish
    source: start
    target: finish
    source_output: message
    target_input: message
"#;

const TEMPLATE_HTTP: &str = r#"# kbflow workflow: remote provider call
# Posts the query to a provider, retrying transient failures, and only
# forwards the response when the provider answered 200.
id: http-call
name: HTTP provider call
global_config:
  timeout: 120
  node_timeout: 30
nodes:
  - id: start
    type: input
  - id: call_provider
    type: http
    timeout: 20
    retry:
      max_retries: 2
      base_delay: 500
      max_delay: 5000
    config:
      url: https://api.example.com/v1/answer
      method: POST
      headers:
        Authorization: Bearer ${API_TOKEN}
      network_intensive: true
  - id: finish
    type: output
edges:
  - id: query_to_provider
    source: start
    target: call_provider
    source_output: query
    target_input: query
  - id: provider_to_finish
    source: call_provider
    target: finish
    source_output: "*"
    target_input: response
    condition: "output.status_code == 200"
"#;

const TEMPLATE_FANOUT: &str = r#"# kbflow workflow: parallel fan-out
# Three independent lookups run concurrently (bounded by the resource
# budget and max_parallel_workers) and are merged by one output node.
id: fanout
name: Parallel fan-out
global_config:
  enable_parallel_execution: true
  max_parallel_workers: 3
nodes:
  - id: start
    type: input
  - id: search_docs
    type: http
    config:
      url: https://search.example.com/docs
  - id: search_faq
    type: http
    config:
      url: https://search.example.com/faq
  - id: search_tickets
    type: http
    config:
      url: https://search.example.com/tickets
      ignore_errors: true
  - id: merge
    type: output
    inputs:
      - { name: docs, required: true }
      - { name: faq, required: true }
      - { name: tickets }
      - { name: topic, default: general }
edges:
  - { id: q_docs, source: start, target: search_docs, source_output: query, target_input: query }
  - { id: q_faq, source: start, target: search_faq, source_output: query, target_input: query }
  - { id: q_tickets, source: start, target: search_tickets, source_output: query, target_input: query }
  - { id: docs_out, source: search_docs, target: merge, source_output: "*", target_input: docs }
  - { id: faq_out, source: search_faq, target: merge, source_output: "*", target_input: faq }
  - { id: tickets_out, source: search_tickets, target: merge, source_output: "*", target_input: tickets }
  - id: topic_out
    source: start
    target: merge
    source_output: topic
    target_input: topic
    transform: "value|lower"
"#;

const RAG_HEADER: &str = "# kbflow workflow: RAG chat\n\
# Register the pipeline node types with kbflow::rag::register_rag_nodes.\n\
# A failed embedding or an empty retrieval routes to fallback_response.\n";

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expr::ExpressionRegistry;
    use crate::graph::WorkflowGraph;
    use crate::parser::parse_workflow_yaml;

    #[test]
    fn test_list_templates_returns_all() {
        let names: Vec<&str> = list_templates().iter().map(|t| t.name).collect();
        assert_eq!(names, vec!["minimal", "http", "fanout", "rag"]);
    }

    #[test]
    fn test_get_template_unknown_returns_none() {
        assert!(get_template("shell").is_none());
    }

    #[test]
    fn test_all_templates_are_valid_workflows() {
        for info in list_templates() {
            let yaml = get_template(info.name).unwrap();
            let def = parse_workflow_yaml(&yaml)
                .unwrap_or_else(|e| panic!("template '{}' does not parse: {}", info.name, e));
            WorkflowGraph::build(&def, &ExpressionRegistry::new())
                .unwrap_or_else(|e| panic!("template '{}' is not a valid graph: {}", info.name, e));
        }
    }

    #[test]
    fn test_rag_template_matches_pipeline() {
        let def = parse_workflow_yaml(&get_template("rag").unwrap()).unwrap();
        assert_eq!(def, rag_workflow());
    }

    #[test]
    fn test_fanout_levels() {
        let def = parse_workflow_yaml(&get_template("fanout").unwrap()).unwrap();
        let graph = WorkflowGraph::build(&def, &ExpressionRegistry::new()).unwrap();
        let levels = graph.parallel_levels();
        assert_eq!(levels.len(), 3);
        assert_eq!(levels[1].len(), 3);
    }

    #[test]
    fn test_template_descriptions_non_empty() {
        for info in list_templates() {
            assert!(!info.description.is_empty());
        }
    }
}
