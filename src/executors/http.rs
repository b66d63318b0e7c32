//! HTTP node type for calling remote providers
//!
//! A node of type `http` sends its resolved inputs as a JSON body to the
//! configured endpoint and maps the response back into outputs:
//! - a JSON object response becomes the output map
//! - any other JSON value is returned under `response`
//! - a non-JSON body is returned as a string under `body`
//!
//! `status_code` is always added. Non-2xx responses fail the node.
//!
//! # Security
//!
//! - Only `http` and `https` URLs are accepted
//! - Private, loopback and link-local addresses and cloud metadata hosts are
//!   blocked unless the node sets `allow_private_ips: true`
//! - Response bodies are capped at [`MAX_RESPONSE_SIZE`]
//!
//! # Example
//!
//! ```yaml
//! - id: embed
//!   type: http
//!   config:
//!     url: https://embeddings.internal.example/v1/embed
//!     method: POST
//!     headers:
//!       Authorization: Bearer token
//!     timeout: 20
//! ```

use crate::error::{FlowError, Result};
use crate::runner::{NodeCall, NodeExecutor, PortMap};
use async_trait::async_trait;
use reqwest::{Client, Method};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::net::{Ipv4Addr, Ipv6Addr};
use std::time::Duration;
use tracing::{debug, info, warn};
use url::Host;

/// Largest response body kept, in bytes
pub const MAX_RESPONSE_SIZE: usize = 10_485_760; // 10 MB

/// HTTP methods
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    Get,
    #[default]
    Post,
    Put,
    Delete,
}

/// Config block of an `http` node
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HttpNodeConfig {
    pub url: String,
    #[serde(default)]
    pub method: HttpMethod,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    /// Request timeout in seconds
    #[serde(default = "default_timeout")]
    pub timeout: u64,
    #[serde(default)]
    pub allow_private_ips: bool,
}

fn default_timeout() -> u64 {
    30
}

impl HttpNodeConfig {
    /// Extract the HTTP settings from a node config map, ignoring engine-level keys
    pub fn from_node_config(config: &PortMap) -> Result<Self> {
        serde_json::from_value(Value::Object(config.clone()))
            .map_err(|e| FlowError::Validation(format!("Invalid http node config: {}", e)))
    }
}

/// Executor behind the `http` node type
#[derive(Debug, Clone)]
pub struct HttpNodeExecutor {
    /// Reqwest client with connection pooling
    client: Client,
}

impl HttpNodeExecutor {
    pub fn new() -> Self {
        let client = Client::builder()
            .user_agent(format!("kbflow/{}", env!("CARGO_PKG_VERSION")))
            .build()
            .unwrap_or_else(|e| {
                warn!("Falling back to default HTTP client: {}", e);
                Client::new()
            });

        Self { client }
    }

    /// Validate URL for SSRF (Server-Side Request Forgery) protection
    ///
    /// # Arguments
    ///
    /// * `url` - The URL to validate
    /// * `allow_private_ips` - If true, allows requests to private IPs
    fn validate_ssrf(url: &str, allow_private_ips: bool) -> Result<()> {
        let parsed_url = reqwest::Url::parse(url)
            .map_err(|e| FlowError::Validation(format!("Invalid URL for SSRF check: {}", e)))?;

        let scheme = parsed_url.scheme();
        if scheme != "http" && scheme != "https" {
            return Err(FlowError::Validation(format!(
                "Invalid URL scheme '{}': only http and https are allowed",
                scheme
            )));
        }

        let host = parsed_url
            .host()
            .ok_or_else(|| FlowError::Validation("URL must contain a host".to_string()))?;

        if allow_private_ips {
            return Ok(());
        }

        match host {
            Host::Ipv4(ip) => Self::validate_ipv4_not_private(ip),
            Host::Ipv6(ip) => Self::validate_ipv6_not_private(ip),
            Host::Domain(domain) => Self::validate_domain_not_blocked(domain),
        }
    }

    fn validate_ipv4_not_private(ip: Ipv4Addr) -> Result<()> {
        let reason = if ip == Ipv4Addr::new(169, 254, 169, 254) {
            Some("cloud metadata")
        } else if ip.is_private() {
            Some("private")
        } else if ip.is_loopback() {
            Some("loopback")
        } else if ip.is_link_local() {
            Some("link-local")
        } else {
            None
        };

        match reason {
            Some(kind) => Err(FlowError::Http(format!(
                "SSRF protection: requests to {} addresses are blocked ({})",
                kind, ip
            ))),
            None => Ok(()),
        }
    }

    fn validate_ipv6_not_private(ip: Ipv6Addr) -> Result<()> {
        // fc00::/7 is unique local, fe80::/10 link-local
        let unique_local = (ip.segments()[0] & 0xfe00) == 0xfc00;
        let link_local = (ip.segments()[0] & 0xffc0) == 0xfe80;
        if ip.is_loopback() || link_local || unique_local {
            return Err(FlowError::Http(format!(
                "SSRF protection: requests to non-public IPv6 addresses are blocked ({})",
                ip
            )));
        }
        Ok(())
    }

    fn validate_domain_not_blocked(domain: &str) -> Result<()> {
        let blocked_domains = [
            "localhost",
            "metadata.google.internal",
            "metadata",
            "instance-data",
        ];

        let domain_lower = domain.to_lowercase();
        for blocked in &blocked_domains {
            if domain_lower == *blocked || domain_lower.ends_with(&format!(".{}", blocked)) {
                return Err(FlowError::Http(format!(
                    "SSRF protection: requests to '{}' are blocked (metadata service or localhost)",
                    domain
                )));
            }
        }

        Ok(())
    }

    fn validate_config(config: &HttpNodeConfig) -> Result<()> {
        if config.url.is_empty() {
            return Err(FlowError::Validation("HTTP URL cannot be empty".to_string()));
        }

        Self::validate_ssrf(&config.url, config.allow_private_ips)?;

        if config.timeout == 0 || config.timeout > 3600 {
            return Err(FlowError::Validation(format!(
                "HTTP timeout must be between 1 and 3600 seconds, got: {}",
                config.timeout
            )));
        }

        if config.allow_private_ips {
            warn!(
                "allow_private_ips is enabled for URL {} - SSRF protection disabled",
                config.url
            );
        }

        Ok(())
    }

    fn convert_method(method: HttpMethod) -> Method {
        match method {
            HttpMethod::Get => Method::GET,
            HttpMethod::Post => Method::POST,
            HttpMethod::Put => Method::PUT,
            HttpMethod::Delete => Method::DELETE,
        }
    }

    /// Map a response body onto node outputs
    fn outputs_from_body(status_code: u16, body: &[u8]) -> PortMap {
        let mut outputs = match serde_json::from_slice::<Value>(body) {
            Ok(Value::Object(map)) => map,
            Ok(other) => {
                let mut map = PortMap::new();
                map.insert("response".to_string(), other);
                map
            }
            Err(_) => {
                let mut map = PortMap::new();
                map.insert(
                    "body".to_string(),
                    Value::String(String::from_utf8_lossy(body).to_string()),
                );
                map
            }
        };
        outputs.insert("status_code".to_string(), Value::from(status_code));
        outputs
    }

    async fn send(&self, config: &HttpNodeConfig, inputs: &PortMap) -> Result<PortMap> {
        Self::validate_config(config)?;

        info!("Executing HTTP {:?} request to {}", config.method, config.url);

        let mut request = self
            .client
            .request(Self::convert_method(config.method), &config.url)
            .timeout(Duration::from_secs(config.timeout));

        for (key, value) in &config.headers {
            request = request.header(key, value);
        }

        if config.method == HttpMethod::Get {
            let query: Vec<(String, String)> = inputs
                .iter()
                .map(|(k, v)| match v {
                    Value::String(s) => (k.clone(), s.clone()),
                    other => (k.clone(), other.to_string()),
                })
                .collect();
            request = request.query(&query);
        } else {
            request = request.json(inputs);
        }

        let response = request.send().await.map_err(|e| {
            let message = if e.is_timeout() {
                format!("Request timed out after {} seconds", config.timeout)
            } else if e.is_connect() {
                format!("Connection failed: {}", e)
            } else {
                format!("Request failed: {}", e)
            };
            FlowError::Http(message)
        })?;

        let status_code = response.status();
        let bytes = response
            .bytes()
            .await
            .map_err(|e| FlowError::Http(format!("Failed to read response body: {}", e)))?;

        let body = if bytes.len() > MAX_RESPONSE_SIZE {
            warn!(
                "Response body truncated from {} to {} bytes",
                bytes.len(),
                MAX_RESPONSE_SIZE
            );
            &bytes[..MAX_RESPONSE_SIZE]
        } else {
            &bytes[..]
        };

        debug!("HTTP request completed with status code: {}", status_code.as_u16());

        if !status_code.is_success() {
            return Err(FlowError::Http(format!(
                "HTTP request failed with status code: {}",
                status_code.as_u16()
            )));
        }

        Ok(Self::outputs_from_body(status_code.as_u16(), body))
    }
}

#[async_trait]
impl NodeExecutor for HttpNodeExecutor {
    async fn execute(&self, call: NodeCall) -> anyhow::Result<PortMap> {
        let config = HttpNodeConfig::from_node_config(&call.config)?;
        Ok(self.send(&config, &call.inputs).await?)
    }
}

impl Default for HttpNodeExecutor {
    fn default() -> Self {
        Self::new()
    }
}
