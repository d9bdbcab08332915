use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use atelier_contracts::plan::{OperationFamily, WorkflowId};
use atelier_contracts::slots::SlotName;
use reqwest::blocking::Client as HttpClient;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::debug;

use crate::config::{DispatchConfig, DispatchKind};

/// Everything a capability backend needs to run one step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DispatchRequest {
    pub workflow_id: WorkflowId,
    pub operation: OperationFamily,
    pub slot_bindings: BTreeMap<SlotName, String>,
    pub parameters: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchResponse {
    pub artifact_url: String,
}

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("dispatch transport failed: {0}")]
    Transport(String),
    #[error("dispatch timed out after {0:?}")]
    Timeout(Duration),
    #[error("capability rejected the request ({status}): {body}")]
    Rejected { status: u16, body: String },
    #[error("invalid capability response: {0}")]
    InvalidResponse(String),
}

pub trait CapabilityDispatcher: Send + Sync {
    fn name(&self) -> &str;
    fn dispatch(&self, request: &DispatchRequest) -> Result<DispatchResponse, DispatchError>;
}

#[derive(Default)]
pub struct DispatcherRegistry {
    dispatchers: BTreeMap<String, Arc<dyn CapabilityDispatcher>>,
}

impl DispatcherRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<D: CapabilityDispatcher + 'static>(&mut self, dispatcher: D) {
        self.dispatchers
            .insert(dispatcher.name().to_string(), Arc::new(dispatcher));
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn CapabilityDispatcher>> {
        self.dispatchers.get(name).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        self.dispatchers.keys().cloned().collect()
    }

    /// Dryrun is always available; http only once an endpoint is configured.
    pub fn from_config(config: &DispatchConfig) -> Result<Self> {
        let mut registry = Self::new();
        registry.register(DryrunDispatcher);
        if let Some(endpoint) = config.endpoint.as_deref() {
            registry.register(HttpDispatcher::new(
                endpoint,
                Duration::from_secs(config.timeout_secs),
            )?);
        }
        Ok(registry)
    }

    pub fn default_for(&self, config: &DispatchConfig) -> Result<Arc<dyn CapabilityDispatcher>> {
        let name = match config.kind {
            DispatchKind::Dryrun => "dryrun",
            DispatchKind::Http => "http",
        };
        self.get(name).with_context(|| {
            format!(
                "dispatcher '{name}' is not available (registered: {})",
                self.names().join(", ")
            )
        })
    }
}

/// Returns a deterministic fake artifact per request; nothing leaves the process.
pub struct DryrunDispatcher;

impl CapabilityDispatcher for DryrunDispatcher {
    fn name(&self) -> &str {
        "dryrun"
    }

    fn dispatch(&self, request: &DispatchRequest) -> Result<DispatchResponse, DispatchError> {
        let canonical = serde_json::to_vec(request)
            .map_err(|err| DispatchError::InvalidResponse(err.to_string()))?;
        let digest = hex::encode(Sha256::digest(&canonical));
        Ok(DispatchResponse {
            artifact_url: format!("dryrun://{}/{}", request.workflow_id, &digest[..16]),
        })
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireResponse {
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    artifact_url: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

pub struct HttpDispatcher {
    endpoint: String,
    http: HttpClient,
}

impl HttpDispatcher {
    pub fn new(endpoint: &str, timeout: Duration) -> Result<Self> {
        let http = HttpClient::builder()
            .timeout(timeout)
            .build()
            .context("building dispatch http client")?;
        Ok(Self {
            endpoint: endpoint.trim().to_string(),
            http,
        })
    }
}

impl CapabilityDispatcher for HttpDispatcher {
    fn name(&self) -> &str {
        "http"
    }

    fn dispatch(&self, request: &DispatchRequest) -> Result<DispatchResponse, DispatchError> {
        debug!(endpoint = %self.endpoint, workflow = %request.workflow_id, "posting dispatch request");
        let response = self
            .http
            .post(&self.endpoint)
            .json(request)
            .send()
            .map_err(|err| DispatchError::Transport(err.to_string()))?;
        let status = response.status();
        let body = response
            .text()
            .map_err(|err| DispatchError::Transport(err.to_string()))?;
        if !status.is_success() {
            return Err(DispatchError::Rejected {
                status: status.as_u16(),
                body: truncate_text(&body, 512),
            });
        }
        interpret_wire_response(status.as_u16(), &body)
    }
}

fn interpret_wire_response(status: u16, body: &str) -> Result<DispatchResponse, DispatchError> {
    let wire: WireResponse = serde_json::from_str(body)
        .map_err(|err| DispatchError::InvalidResponse(format!("{err}: {}", truncate_text(body, 256))))?;
    let reported = wire
        .status
        .as_deref()
        .map(|value| value.trim().to_ascii_lowercase())
        .unwrap_or_else(|| "success".to_string());
    if !matches!(reported.as_str(), "success" | "ok" | "completed") {
        return Err(DispatchError::Rejected {
            status,
            body: wire.error.unwrap_or(reported),
        });
    }
    match wire.artifact_url.filter(|url| !url.trim().is_empty()) {
        Some(artifact_url) => Ok(DispatchResponse { artifact_url }),
        None => Err(DispatchError::InvalidResponse(
            "success response without artifactUrl".to_string(),
        )),
    }
}

fn truncate_text(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let mut out: String = text.chars().take(max_chars).collect();
    out.push_str("...");
    out
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use atelier_contracts::plan::{OperationFamily, WorkflowId};
    use atelier_contracts::slots::SlotName;
    use serde_json::{json, Map};

    use super::{
        interpret_wire_response, CapabilityDispatcher, DispatchError, DispatchRequest,
        DispatcherRegistry, DryrunDispatcher,
    };
    use crate::config::{DispatchConfig, DispatchKind};

    fn upscale_request(url: &str) -> DispatchRequest {
        DispatchRequest {
            workflow_id: WorkflowId::Upscale,
            operation: OperationFamily::Upscale,
            slot_bindings: BTreeMap::from([(SlotName::Subject, url.to_string())]),
            parameters: Map::new(),
        }
    }

    #[test]
    fn request_serializes_with_wire_field_names() -> anyhow::Result<()> {
        let value = serde_json::to_value(upscale_request("https://cdn/a.png"))?;
        assert_eq!(
            value,
            json!({
                "workflowId": "upscale",
                "operation": "upscale",
                "slotBindings": {"subject": "https://cdn/a.png"},
                "parameters": {}
            })
        );
        Ok(())
    }

    #[test]
    fn dryrun_is_deterministic_per_request() -> anyhow::Result<()> {
        let first = DryrunDispatcher.dispatch(&upscale_request("https://cdn/a.png"))?;
        let again = DryrunDispatcher.dispatch(&upscale_request("https://cdn/a.png"))?;
        let other = DryrunDispatcher.dispatch(&upscale_request("https://cdn/b.png"))?;
        assert_eq!(first, again);
        assert_ne!(first, other);
        assert!(first.artifact_url.starts_with("dryrun://upscale/"));
        Ok(())
    }

    #[test]
    fn wire_response_statuses() {
        let ok = interpret_wire_response(200, r#"{"status":"success","artifactUrl":"https://x/1.png"}"#);
        assert_eq!(ok.map(|r| r.artifact_url).ok().as_deref(), Some("https://x/1.png"));

        let failed = interpret_wire_response(200, r#"{"status":"error","error":"gpu busy"}"#);
        assert!(matches!(failed, Err(DispatchError::Rejected { ref body, .. }) if body == "gpu busy"));

        let missing = interpret_wire_response(200, r#"{"status":"ok"}"#);
        assert!(matches!(missing, Err(DispatchError::InvalidResponse(_))));

        let garbage = interpret_wire_response(200, "<html>");
        assert!(matches!(garbage, Err(DispatchError::InvalidResponse(_))));
    }

    #[test]
    fn registry_requires_endpoint_for_http() -> anyhow::Result<()> {
        let mut config = DispatchConfig::default();
        let registry = DispatcherRegistry::from_config(&config)?;
        assert_eq!(registry.names(), vec!["dryrun"]);
        assert_eq!(registry.default_for(&config)?.name(), "dryrun");

        config.kind = DispatchKind::Http;
        assert!(registry.default_for(&config).is_err());

        config.endpoint = Some("http://127.0.0.1:9/dispatch".to_string());
        let registry = DispatcherRegistry::from_config(&config)?;
        assert_eq!(registry.default_for(&config)?.name(), "http");
        Ok(())
    }
}
