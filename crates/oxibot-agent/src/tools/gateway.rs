//! Gateway tools — proxy calls to a configured remote tool-proxy ("Skillgate")
//! for server-side tool execution.
//!
//! Port of nanobot's `agent/tools/gateway.py`. Each tool definition loaded
//! from [`SkillgateConfig`] becomes a native callable tool so the LLM can
//! invoke it directly; a companion [`CheckApprovalResultTool`] lets the LLM
//! poll for approval outcomes.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::Mutex;
use tracing::warn;

use oxibot_core::config::schema::SkillgateConfig;

use super::base::{require_string, Tool};

const EXECUTE_TIMEOUT_SECS: u64 = 120;
const POLL_TIMEOUT_SECS: u64 = 30;

fn build_client(timeout_secs: u64) -> Client {
    Client::builder()
        .timeout(Duration::from_secs(timeout_secs))
        .build()
        .expect("Failed to build HTTP client")
}

#[derive(Debug, Deserialize, Default)]
struct GatewayResponse {
    #[serde(default)]
    success: bool,
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    pending_approval: bool,
    #[serde(default)]
    request_id: Option<String>,
}

fn stringify(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

// ─────────────────────────────────────────────
// GatewayTool
// ─────────────────────────────────────────────

/// A single server-side tool proxied through the gateway's `execute_tool` endpoint.
///
/// The agent loop calls [`GatewayTool::set_metadata`] before each turn with
/// any opaque approval/context tokens the turn may need to forward.
pub struct GatewayTool {
    name: String,
    description: String,
    parameters: Value,
    base_url: String,
    nanobot_token: String,
    client: Client,
    context_token: Mutex<Option<String>>,
}

impl GatewayTool {
    pub fn new(
        tool_name: impl Into<String>,
        description: impl Into<String>,
        parameters: Value,
        base_url: impl Into<String>,
        nanobot_token: impl Into<String>,
    ) -> Self {
        Self {
            name: tool_name.into(),
            description: description.into(),
            parameters,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            nanobot_token: nanobot_token.into(),
            client: build_client(EXECUTE_TIMEOUT_SECS),
            context_token: Mutex::new(None),
        }
    }

    /// Set the opaque context token carried on the next `execute_tool` call.
    pub async fn set_metadata(&self, metadata: &HashMap<String, String>) {
        let mut ctx = self.context_token.lock().await;
        *ctx = metadata.get("context_token").cloned();
    }
}

#[async_trait]
impl Tool for GatewayTool {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn parameters(&self) -> Value {
        self.parameters.clone()
    }

    async fn execute(&self, params: HashMap<String, Value>) -> anyhow::Result<String> {
        let url = format!("{}/execute_tool", self.base_url);
        let context_token = self.context_token.lock().await.clone();

        let mut body = json!({
            "tool_name": self.name,
            "params": params,
            "nanobot_token": self.nanobot_token,
        });
        if let Some(token) = context_token {
            body["context_token"] = json!(token);
        }

        let resp = match self.client.post(&url).json(&body).send().await {
            Ok(r) => r,
            Err(e) => {
                warn!(tool = %self.name, error = %e, "gateway tool request failed");
                return Ok(format!("Error calling {}: {e}", self.name));
            }
        };

        if !resp.status().is_success() {
            let status = resp.status();
            warn!(tool = %self.name, status = %status, "gateway tool HTTP error");
            return Ok(format!("Error calling {}: HTTP {status}", self.name));
        }

        let body: Value = match resp.json().await {
            Ok(v) => v,
            Err(e) => {
                warn!(tool = %self.name, error = %e, "failed to parse gateway response");
                return Ok(format!("Error calling {}: {e}", self.name));
            }
        };

        let data: GatewayResponse = match serde_json::from_value(body.clone()) {
            Ok(d) => d,
            Err(e) => {
                warn!(tool = %self.name, error = %e, "failed to parse gateway response");
                return Ok(format!("Error calling {}: {e}", self.name));
            }
        };

        if data.pending_approval {
            let request_id = data.request_id.unwrap_or_default();
            let hint = data
                .result
                .as_ref()
                .map(stringify)
                .unwrap_or_else(|| "This tool requires approval.".to_string());
            return Ok(format!(
                "{hint}\n\nApproval pending — request_id: {request_id}\n\
                 Use the check_approval_result tool with this request_id to poll for the outcome."
            ));
        }

        if data.success {
            return Ok(data.result.as_ref().map(stringify).unwrap_or_default());
        }

        Ok(data
            .result
            .as_ref()
            .map(stringify)
            .or(data.error.clone())
            .unwrap_or_else(|| body.to_string()))
    }
}

// ─────────────────────────────────────────────
// CheckApprovalResultTool
// ─────────────────────────────────────────────

#[derive(Debug, Deserialize, Default)]
struct CheckResultResponse {
    #[serde(default)]
    status: String,
    #[serde(default)]
    result: Option<Value>,
}

/// Polls the gateway's `check_result` endpoint for a pending approval's outcome.
pub struct CheckApprovalResultTool {
    base_url: String,
    nanobot_token: String,
    client: Client,
}

impl CheckApprovalResultTool {
    pub fn new(base_url: impl Into<String>, nanobot_token: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            nanobot_token: nanobot_token.into(),
            client: build_client(POLL_TIMEOUT_SECS),
        }
    }
}

#[async_trait]
impl Tool for CheckApprovalResultTool {
    fn name(&self) -> &str {
        "check_approval_result"
    }

    fn description(&self) -> &str {
        "Check the result of a pending tool approval request. \
         Use the request_id returned by a tool that required approval."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "request_id": {
                    "type": "string",
                    "description": "The request_id from the pending approval response."
                }
            },
            "required": ["request_id"]
        })
    }

    async fn execute(&self, params: HashMap<String, Value>) -> anyhow::Result<String> {
        let request_id = require_string(&params, "request_id")?;
        let url = format!("{}/check_result", self.base_url);

        let resp = match self
            .client
            .post(&url)
            .json(&json!({"request_id": request_id, "nanobot_token": self.nanobot_token}))
            .send()
            .await
        {
            Ok(r) => r,
            Err(e) => return Ok(format!("Error checking result: {e}")),
        };

        if !resp.status().is_success() {
            return Ok(format!("Error checking result: HTTP {}", resp.status()));
        }

        let data: CheckResultResponse = match resp.json().await {
            Ok(d) => d,
            Err(e) => return Ok(format!("Error checking result: {e}")),
        };

        let result_str = data.result.as_ref().map(stringify);

        Ok(match data.status.as_str() {
            "Pending" => format!("Request {request_id} is still pending approval. Try again shortly."),
            "Completed" => result_str.unwrap_or_else(|| "Tool executed successfully (no output).".into()),
            "Approved" => result_str.unwrap_or_else(|| {
                format!("Request {request_id} was approved but result is not yet available. Try again.")
            }),
            "Denied" | "Expired" => format!("Request {request_id} was {}.", data.status.to_lowercase()),
            other => other.to_string(),
        })
    }
}

// ─────────────────────────────────────────────
// Loader
// ─────────────────────────────────────────────

/// Build the concrete per-definition `GatewayTool`s from the skillgate
/// config, without the shared `CheckApprovalResultTool`. Exposed
/// separately (rather than only as `Arc<dyn Tool>`) so callers — the
/// agent loop — can reach `GatewayTool::set_metadata` before a turn.
///
/// Returns an empty vec if the config is disabled or missing credentials.
pub fn build_gateway_tools(config: &SkillgateConfig) -> Vec<Arc<GatewayTool>> {
    if !config.is_usable() {
        if config.enabled {
            warn!("skillgate config missing credentials — skipping gateway tools");
        }
        return Vec::new();
    }

    config
        .tools
        .iter()
        .filter(|def| !def.name.is_empty())
        .map(|def| {
            Arc::new(GatewayTool::new(
                def.name.clone(),
                def.description.clone(),
                def.input_schema.clone(),
                config.url.clone(),
                config.api_key.clone(),
            ))
        })
        .collect()
}

/// Build gateway tools (one `GatewayTool` per configured definition, plus
/// one shared `CheckApprovalResultTool`) from the skillgate config, ready
/// to register into a [`super::registry::ToolRegistry`].
///
/// Returns an empty vec if the config is disabled or missing credentials.
pub fn load_gateway_tools(config: &SkillgateConfig) -> Vec<Arc<dyn Tool>> {
    let per_tool = build_gateway_tools(config);
    if per_tool.is_empty() {
        return Vec::new();
    }

    let mut tools: Vec<Arc<dyn Tool>> = per_tool
        .into_iter()
        .map(|t| t as Arc<dyn Tool>)
        .collect();

    tools.push(Arc::new(CheckApprovalResultTool::new(
        config.url.clone(),
        config.api_key.clone(),
    )));

    tools
}

#[cfg(test)]
mod tests {
    use super::*;
    use oxibot_core::config::schema::SkillgateToolDef;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn usable_config(url: &str) -> SkillgateConfig {
        SkillgateConfig {
            enabled: true,
            url: url.to_string(),
            api_key: "key".into(),
            api_secret: "secret".into(),
            tools: vec![SkillgateToolDef {
                name: "do_thing".into(),
                description: "Does a thing".into(),
                input_schema: json!({"type": "object", "properties": {}}),
            }],
        }
    }

    #[test]
    fn test_load_gateway_tools_disabled() {
        let config = SkillgateConfig::default();
        assert!(load_gateway_tools(&config).is_empty());
    }

    #[test]
    fn test_load_gateway_tools_missing_credentials() {
        let mut config = SkillgateConfig::default();
        config.enabled = true;
        config.url = "https://gate.example.com".into();
        assert!(load_gateway_tools(&config).is_empty());
    }

    #[test]
    fn test_build_gateway_tools_returns_concrete_type() {
        let config = usable_config("https://gate.example.com");
        let tools = build_gateway_tools(&config);
        assert_eq!(tools.len(), 1);
        assert_eq!(tools[0].name(), "do_thing");
    }

    #[test]
    fn test_load_gateway_tools_success() {
        let config = usable_config("https://gate.example.com");
        let tools = load_gateway_tools(&config);
        // one GatewayTool + the shared CheckApprovalResultTool
        assert_eq!(tools.len(), 2);
        assert_eq!(tools[0].name(), "do_thing");
        assert_eq!(tools[1].name(), "check_approval_result");
    }

    #[tokio::test]
    async fn test_gateway_tool_success_result() {
        let mock_server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/execute_tool"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "success": true,
                "result": "42"
            })))
            .mount(&mock_server)
            .await;

        let tool = GatewayTool::new(
            "do_thing",
            "desc",
            json!({"type": "object", "properties": {}}),
            mock_server.uri(),
            "tok",
        );

        let result = tool.execute(HashMap::new()).await.unwrap();
        assert_eq!(result, "42");
    }

    #[tokio::test]
    async fn test_gateway_tool_pending_approval() {
        let mock_server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/execute_tool"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "pending_approval": true,
                "request_id": "R1",
                "result": "Needs approval"
            })))
            .mount(&mock_server)
            .await;

        let tool = GatewayTool::new(
            "do_thing",
            "desc",
            json!({"type": "object", "properties": {}}),
            mock_server.uri(),
            "tok",
        );

        let result = tool.execute(HashMap::new()).await.unwrap();
        assert!(result.contains("request_id: R1"));
    }

    #[tokio::test]
    async fn test_gateway_tool_fallback_returns_raw_body() {
        let mock_server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/execute_tool"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "status": "queued"
            })))
            .mount(&mock_server)
            .await;

        let tool = GatewayTool::new(
            "do_thing",
            "desc",
            json!({"type": "object", "properties": {}}),
            mock_server.uri(),
            "tok",
        );

        let result = tool.execute(HashMap::new()).await.unwrap();
        let parsed: Value = serde_json::from_str(&result).unwrap();
        assert_eq!(parsed["status"], "queued");
    }

    #[tokio::test]
    async fn test_check_approval_result_completed() {
        let mock_server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/check_result"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "status": "Completed",
                "result": "done"
            })))
            .mount(&mock_server)
            .await;

        let tool = CheckApprovalResultTool::new(mock_server.uri(), "tok");
        let mut params = HashMap::new();
        params.insert("request_id".into(), json!("R1"));

        let result = tool.execute(params).await.unwrap();
        assert_eq!(result, "done");
    }

    #[tokio::test]
    async fn test_check_approval_result_pending() {
        let mock_server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/check_result"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "status": "Pending",
                "result": null
            })))
            .mount(&mock_server)
            .await;

        let tool = CheckApprovalResultTool::new(mock_server.uri(), "tok");
        let mut params = HashMap::new();
        params.insert("request_id".into(), json!("R1"));

        let result = tool.execute(params).await.unwrap();
        assert!(result.contains("still pending"));
    }

    #[tokio::test]
    async fn test_check_approval_result_missing_request_id() {
        let tool = CheckApprovalResultTool::new("https://gate.example.com", "tok");
        let result = tool.execute(HashMap::new()).await;
        assert!(result.is_err());
    }
}
