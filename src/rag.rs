//! Canonical retrieval-augmented chat pipeline
//!
//! ```text
//! analyze_query -> generate_embedding -+-> retrieve_documents -+-> rerank_documents -> generate_response
//!                                      |                       |
//!                                      +---------------------> +-> fallback_response
//! ```
//!
//! Both branches are edge conditions over flags the upstream node writes
//! into the global context (`embedding_generated`, `docs_retrieved`).
//! `fallback_response` is reachable from either branch point and is a sink,
//! so its completion alone resolves the execution.
//!
//! The providers behind the nodes (embedding model, vector and keyword
//! indexes, reranker, chat model) are opaque traits supplied by the caller.

use crate::models::{Edge, GlobalConfig, Node, PortSpec, WorkflowDefinition};
use crate::runner::{NodeCall, NodeExecutor, NodeRegistry, PortMap};
use anyhow::Context;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info, warn};

pub const WORKFLOW_ID: &str = "rag_chat";

pub const TYPE_QUERY_ANALYZER: &str = "query_analyzer";
pub const TYPE_EMBEDDER: &str = "embedder";
pub const TYPE_RETRIEVER: &str = "rag_retriever";
pub const TYPE_RERANKER: &str = "reranker";
pub const TYPE_LLM: &str = "llm";
pub const TYPE_LLM_FALLBACK: &str = "llm_fallback";

pub const DEFAULT_RETRIEVE_TOP_K: usize = 3;
pub const DEFAULT_RERANK_TOP_K: usize = 2;

/// Returned by the fallback node when even plain chat fails
pub const FALLBACK_APOLOGY: &str = "Sorry, no answer is available right now. Please try again later.";

const CONTEXT_SEPARATOR: &str = "\n\n---\n\n";

/// Text embedding model
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    async fn embed(&self, text: &str) -> anyhow::Result<Vec<f32>>;
}

/// Hit from a vector index. Lower distance is closer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VectorHit {
    pub text: String,
    #[serde(default)]
    pub document_name: String,
    pub distance: f64,
}

/// Hit from a keyword index. Higher score is better.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KeywordHit {
    pub text: String,
    #[serde(default)]
    pub document_name: String,
    pub score: f64,
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait VectorSearch: Send + Sync {
    async fn search(&self, embedding: &[f32], top_k: usize) -> anyhow::Result<Vec<VectorHit>>;
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait KeywordSearch: Send + Sync {
    async fn search(&self, query: &str, top_k: usize) -> anyhow::Result<Vec<KeywordHit>>;
}

/// Where a retrieved document came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RetrievalSource {
    Vector,
    Keyword,
}

/// A document as it flows between the retrieval nodes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrievedDocument {
    pub text: String,
    pub score: f64,
    pub source: RetrievalSource,
    #[serde(default)]
    pub document_name: String,
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Reranker: Send + Sync {
    async fn rerank(
        &self,
        query: &str,
        documents: Vec<RetrievedDocument>,
        top_k: usize,
    ) -> anyhow::Result<Vec<RetrievedDocument>>;
}

/// Chat completion model
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ChatModel: Send + Sync {
    async fn complete(&self, prompt: &str) -> anyhow::Result<String>;
}

/// Everything the pipeline talks to
#[derive(Clone)]
pub struct RagProviders {
    pub embedder: Arc<dyn EmbeddingProvider>,
    pub vector: Arc<dyn VectorSearch>,
    /// Keyword search is optional; retrieval is vector-only without it
    pub keyword: Option<Arc<dyn KeywordSearch>>,
    pub reranker: Arc<dyn Reranker>,
    pub chat: Arc<dyn ChatModel>,
}

/// Register the six pipeline node types
pub fn register_rag_nodes(registry: &mut NodeRegistry, providers: RagProviders) {
    registry.register(TYPE_QUERY_ANALYZER, QueryAnalyzer);
    registry.register(TYPE_EMBEDDER, Embedder {
        provider: providers.embedder,
    });
    registry.register(TYPE_RETRIEVER, Retriever {
        vector: providers.vector,
        keyword: providers.keyword,
    });
    registry.register(TYPE_RERANKER, RerankNode {
        reranker: providers.reranker,
    });
    registry.register(TYPE_LLM, Generator {
        chat: Arc::clone(&providers.chat),
    });
    registry.register(TYPE_LLM_FALLBACK, Fallback { chat: providers.chat });
}

fn port(name: &str, data_type: &str, required: bool) -> PortSpec {
    PortSpec {
        name: name.to_string(),
        data_type: data_type.to_string(),
        required,
        default: None,
    }
}

fn node(id: &str, node_type: &str, inputs: Vec<PortSpec>, outputs: Vec<PortSpec>, config: Value) -> Node {
    Node {
        id: id.to_string(),
        name: id.replace('_', " "),
        node_type: node_type.to_string(),
        inputs,
        outputs,
        config: config.as_object().cloned().unwrap_or_default(),
        enabled: true,
        timeout: None,
        retry: None,
    }
}

fn edge(id: &str, from: (&str, &str), to: (&str, &str), condition: Option<&str>) -> Edge {
    Edge {
        id: id.to_string(),
        source: from.0.to_string(),
        source_output: from.1.to_string(),
        target: to.0.to_string(),
        target_input: to.1.to_string(),
        condition: condition.map(str::to_string),
        transform: None,
    }
}

/// The reference pipeline definition
pub fn rag_workflow() -> WorkflowDefinition {
    let embedded = Some("context.embedding_generated");
    let not_embedded = Some("(context.embedding_generated)|not");
    let found = Some("context.docs_retrieved > 0");
    let none_found = Some("context.docs_retrieved == 0");

    let nodes = vec![
        node(
            "analyze_query",
            TYPE_QUERY_ANALYZER,
            vec![port("query", "string", true)],
            vec![port("query", "string", false), port("query_analysis", "object", false)],
            json!({}),
        ),
        node(
            "generate_embedding",
            TYPE_EMBEDDER,
            vec![port("query", "string", true)],
            vec![
                port("query", "string", false),
                port("embedding", "array", false),
                port("embedding_generated", "boolean", false),
            ],
            json!({"network_intensive": true}),
        ),
        node(
            "retrieve_documents",
            TYPE_RETRIEVER,
            vec![port("query", "string", true), port("embedding", "array", true)],
            vec![
                port("query", "string", false),
                port("documents", "array", false),
                port("docs_retrieved", "number", false),
            ],
            json!({"top_k": DEFAULT_RETRIEVE_TOP_K}),
        ),
        node(
            "rerank_documents",
            TYPE_RERANKER,
            vec![port("query", "string", true), port("documents", "array", true)],
            vec![
                port("query", "string", false),
                port("documents", "array", false),
                port("context", "string", false),
            ],
            json!({"top_k": DEFAULT_RERANK_TOP_K}),
        ),
        node(
            "generate_response",
            TYPE_LLM,
            vec![
                port("query", "string", true),
                port("context", "string", true),
                port("documents", "array", false),
            ],
            vec![port("response", "string", false), port("sources", "array", false)],
            json!({}),
        ),
        node(
            "fallback_response",
            TYPE_LLM_FALLBACK,
            vec![port("query", "string", false), port("unanswered_query", "string", false)],
            vec![port("response", "string", false)],
            json!({}),
        ),
    ];

    let edges = vec![
        edge("analyze_to_embed", ("analyze_query", "query"), ("generate_embedding", "query"), None),
        edge("embed_to_retrieve_query", ("generate_embedding", "query"), ("retrieve_documents", "query"), embedded),
        edge(
            "embed_to_retrieve_vector",
            ("generate_embedding", "embedding"),
            ("retrieve_documents", "embedding"),
            embedded,
        ),
        edge("embed_to_fallback", ("generate_embedding", "query"), ("fallback_response", "query"), not_embedded),
        edge("retrieve_to_rerank_query", ("retrieve_documents", "query"), ("rerank_documents", "query"), found),
        edge(
            "retrieve_to_rerank_docs",
            ("retrieve_documents", "documents"),
            ("rerank_documents", "documents"),
            found,
        ),
        edge(
            "retrieve_to_fallback",
            ("retrieve_documents", "query"),
            ("fallback_response", "unanswered_query"),
            none_found,
        ),
        edge("rerank_to_generate_query", ("rerank_documents", "query"), ("generate_response", "query"), None),
        edge(
            "rerank_to_generate_context",
            ("rerank_documents", "context"),
            ("generate_response", "context"),
            None,
        ),
        edge(
            "rerank_to_generate_docs",
            ("rerank_documents", "documents"),
            ("generate_response", "documents"),
            None,
        ),
    ];

    WorkflowDefinition {
        id: WORKFLOW_ID.to_string(),
        name: "RAG chat".to_string(),
        version: "1.0.0".to_string(),
        description: Some("Query analysis, hybrid retrieval, reranking and grounded generation".to_string()),
        nodes,
        edges,
        global_config: GlobalConfig {
            timeout: Some(120.0),
            node_timeout: Some(60.0),
            ..GlobalConfig::default()
        },
    }
}

fn required_str<'a>(inputs: &'a PortMap, name: &str) -> anyhow::Result<&'a str> {
    inputs
        .get(name)
        .and_then(Value::as_str)
        .with_context(|| format!("input '{}' must be a string", name))
}

fn config_usize(config: &PortMap, key: &str, default: usize) -> usize {
    config
        .get(key)
        .and_then(Value::as_u64)
        .map(|n| n as usize)
        .unwrap_or(default)
}

fn outputs(value: Value) -> PortMap {
    match value {
        Value::Object(map) => map,
        _ => Map::new(),
    }
}

/// True if the text contains CJK unified ideographs
fn is_cjk(text: &str) -> bool {
    text.chars().any(|c| ('\u{4e00}'..='\u{9fff}').contains(&c))
}

/// Pure, no I/O
pub struct QueryAnalyzer;

#[async_trait]
impl NodeExecutor for QueryAnalyzer {
    async fn execute(&self, call: NodeCall) -> anyhow::Result<PortMap> {
        let query = required_str(&call.inputs, "query")?.trim();
        let words = query.split_whitespace().count();
        let complexity = match words {
            0..=5 => "low",
            6..=20 => "medium",
            _ => "high",
        };

        debug!("Analyzed query of {} words", words);
        Ok(outputs(json!({
            "query": query,
            "query_analysis": {
                "intent": "question",
                "complexity": complexity,
                "requires_context": true,
                "language": if is_cjk(query) { "zh" } else { "en" },
            },
        })))
    }
}

/// Never fails: a provider error becomes `embedding_generated: false`
pub struct Embedder {
    provider: Arc<dyn EmbeddingProvider>,
}

#[async_trait]
impl NodeExecutor for Embedder {
    async fn execute(&self, call: NodeCall) -> anyhow::Result<PortMap> {
        let query = required_str(&call.inputs, "query")?;
        let (embedding, generated) = match self.provider.embed(query).await {
            Ok(embedding) if !embedding.is_empty() => (json!(embedding), true),
            Ok(_) => {
                warn!("Embedding provider returned an empty vector");
                (Value::Null, false)
            }
            Err(e) => {
                warn!("Embedding generation failed: {:#}", e);
                (Value::Null, false)
            }
        };

        Ok(outputs(json!({
            "query": query,
            "embedding": embedding,
            "embedding_generated": generated,
        })))
    }
}

/// Hybrid retrieval: vector and keyword search run concurrently and merge
pub struct Retriever {
    vector: Arc<dyn VectorSearch>,
    keyword: Option<Arc<dyn KeywordSearch>>,
}

impl Retriever {
    async fn retrieve(&self, query: &str, embedding: &[f32], top_k: usize) -> Vec<RetrievedDocument> {
        let vector = self.vector.search(embedding, top_k);
        let keyword = async {
            match &self.keyword {
                Some(keyword) => keyword.search(query, top_k).await,
                None => Ok(Vec::new()),
            }
        };
        let (vector, keyword) = futures::join!(vector, keyword);

        let vector = vector.unwrap_or_else(|e| {
            warn!("Vector search failed: {:#}", e);
            Vec::new()
        });
        let keyword = keyword.unwrap_or_else(|e| {
            warn!("Keyword search failed: {:#}", e);
            Vec::new()
        });

        merge_hits(vector, keyword)
    }
}

/// Vector hits first, scored `1 / (1 + distance)`, then keyword hits whose
/// text is not already present
pub fn merge_hits(vector: Vec<VectorHit>, keyword: Vec<KeywordHit>) -> Vec<RetrievedDocument> {
    let mut documents: Vec<RetrievedDocument> = vector
        .into_iter()
        .map(|hit| RetrievedDocument {
            score: 1.0 / (1.0 + hit.distance.max(0.0)),
            text: hit.text,
            source: RetrievalSource::Vector,
            document_name: hit.document_name,
        })
        .collect();

    let mut seen: HashSet<String> = documents.iter().map(|d| d.text.clone()).collect();
    for hit in keyword {
        if seen.insert(hit.text.clone()) {
            documents.push(RetrievedDocument {
                text: hit.text,
                score: hit.score,
                source: RetrievalSource::Keyword,
                document_name: hit.document_name,
            });
        }
    }
    documents
}

#[async_trait]
impl NodeExecutor for Retriever {
    async fn execute(&self, call: NodeCall) -> anyhow::Result<PortMap> {
        let query = required_str(&call.inputs, "query")?;
        let embedding: Vec<f32> = call
            .inputs
            .get("embedding")
            .cloned()
            .map(serde_json::from_value)
            .transpose()
            .context("input 'embedding' must be an array of numbers")?
            .unwrap_or_default();
        let top_k = config_usize(&call.config, "top_k", DEFAULT_RETRIEVE_TOP_K);

        let documents = self.retrieve(query, &embedding, top_k).await;
        info!("Retrieved {} documents", documents.len());

        Ok(outputs(json!({
            "query": query,
            "docs_retrieved": documents.len(),
            "documents": documents,
        })))
    }
}

/// Prompt context built from documents, one block per document
pub fn build_context(documents: &[RetrievedDocument]) -> String {
    documents
        .iter()
        .map(|doc| {
            let name = if doc.document_name.is_empty() {
                "unknown"
            } else {
                doc.document_name.as_str()
            };
            format!("Document: {}\n{}", name, doc.text)
        })
        .collect::<Vec<_>>()
        .join(CONTEXT_SEPARATOR)
}

pub struct RerankNode {
    reranker: Arc<dyn Reranker>,
}

#[async_trait]
impl NodeExecutor for RerankNode {
    async fn execute(&self, call: NodeCall) -> anyhow::Result<PortMap> {
        let query = required_str(&call.inputs, "query")?;
        let documents: Vec<RetrievedDocument> = serde_json::from_value(
            call.inputs.get("documents").cloned().unwrap_or(Value::Null),
        )
        .context("input 'documents' must be a list of documents")?;
        let top_k = config_usize(&call.config, "top_k", DEFAULT_RERANK_TOP_K);

        // A failed rerank keeps the retrieval order
        let reranked = match self.reranker.rerank(query, documents.clone(), top_k).await {
            Ok(reranked) => reranked,
            Err(e) => {
                warn!("Reranking failed, keeping retrieval order: {:#}", e);
                documents.into_iter().take(DEFAULT_RETRIEVE_TOP_K).collect()
            }
        };

        Ok(outputs(json!({
            "query": query,
            "context": build_context(&reranked),
            "documents": reranked,
        })))
    }
}

/// Grounded answer prompt
pub fn rag_prompt(query: &str, context: &str) -> String {
    format!(
        "Answer the question using the information below. Use Markdown to structure the answer. \
         If the information does not cover the question, say so.\n\n\
         Information:\n{}\n\nQuestion: {}\n\nAnswer:",
        context, query
    )
}

pub struct Generator {
    chat: Arc<dyn ChatModel>,
}

#[async_trait]
impl NodeExecutor for Generator {
    async fn execute(&self, call: NodeCall) -> anyhow::Result<PortMap> {
        let query = required_str(&call.inputs, "query")?;
        let context = required_str(&call.inputs, "context")?;

        let response = self
            .chat
            .complete(&rag_prompt(query, context))
            .await
            .context("chat model failed to generate a response")?;

        let mut sources: Vec<String> = Vec::new();
        if let Some(Value::Array(documents)) = call.inputs.get("documents") {
            for doc in documents {
                if let Some(name) = doc.get("document_name").and_then(Value::as_str) {
                    if !name.is_empty() && !sources.iter().any(|s| s == name) {
                        sources.push(name.to_string());
                    }
                }
            }
        }

        Ok(outputs(json!({
            "response": response,
            "sources": sources,
        })))
    }
}

/// Plain chat without retrieval. Always completes.
pub struct Fallback {
    chat: Arc<dyn ChatModel>,
}

#[async_trait]
impl NodeExecutor for Fallback {
    async fn execute(&self, call: NodeCall) -> anyhow::Result<PortMap> {
        let query = ["query", "unanswered_query"]
            .iter()
            .find_map(|name| call.inputs.get(*name).and_then(Value::as_str))
            .context("fallback needs a query")?;

        info!("Answering without retrieval");
        let response = match self.chat.complete(query).await {
            Ok(response) => response,
            Err(e) => {
                warn!("Fallback chat failed: {:#}", e);
                FALLBACK_APOLOGY.to_string()
            }
        };

        Ok(outputs(json!({ "response": response })))
    }
}
