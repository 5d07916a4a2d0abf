//! Memory-retrieval client — queries an external memory endpoint for
//! context relevant to the current user message before the turn begins.
//!
//! Failures (timeout, transport error, non-200, malformed body) are
//! swallowed; the turn proceeds with no retrieved memories.

use std::time::Duration;

use reqwest::Client;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::warn;

use oxibot_core::config::schema::MemoryRetrievalConfig;

const TIMEOUT_SECS: u64 = 10;
const DEFAULT_TOP_K: u32 = 5;

/// Thin client for the memory-retrieval endpoint.
pub struct MemoryRetrievalClient {
    url: String,
    token: String,
    client: Client,
}

#[derive(Debug, Deserialize, Default)]
struct RetrievalResponse {
    #[serde(default)]
    memories: Option<String>,
    #[serde(default)]
    message: Option<Value>,
}

impl MemoryRetrievalClient {
    pub fn new(config: &MemoryRetrievalConfig) -> Self {
        Self {
            url: config.url.clone(),
            token: config.api_key.clone(),
            client: Client::builder()
                .timeout(Duration::from_secs(TIMEOUT_SECS))
                .build()
                .expect("Failed to build HTTP client"),
        }
    }

    /// Query for memories relevant to `text`. Returns `None` on any
    /// failure or when the response carries no usable content.
    pub async fn query(&self, text: &str) -> Option<String> {
        let body = json!({
            "query": text,
            "nanobot_token": self.token,
            "top_k": DEFAULT_TOP_K,
        });

        let resp = match self.client.post(&self.url).json(&body).send().await {
            Ok(r) => r,
            Err(e) => {
                warn!(error = %e, "memory retrieval request failed");
                return None;
            }
        };

        if !resp.status().is_success() {
            warn!(status = %resp.status(), "memory retrieval returned non-200");
            return None;
        }

        let data: RetrievalResponse = match resp.json().await {
            Ok(d) => d,
            Err(e) => {
                warn!(error = %e, "failed to parse memory retrieval response");
                return None;
            }
        };

        if let Some(memories) = data.memories {
            if !memories.trim().is_empty() {
                return Some(memories);
            }
        }

        // Some deployments wrap the payload under `message`.
        if let Some(Value::Object(inner)) = data.message {
            if let Some(Value::String(memories)) = inner.get("memories") {
                if !memories.trim().is_empty() {
                    return Some(memories.clone());
                }
            }
        }

        None
    }
}

/// Whether `text` has at least 5 non-whitespace characters — the minimum
/// the turn engine requires before consulting memory retrieval at all.
pub fn meets_retrieval_threshold(text: &str) -> bool {
    text.chars().filter(|c| !c.is_whitespace()).count() >= 5
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path_regex};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn config(url: &str) -> MemoryRetrievalConfig {
        MemoryRetrievalConfig {
            enabled: true,
            url: url.to_string(),
            api_key: "tok".into(),
        }
    }

    #[test]
    fn test_meets_retrieval_threshold() {
        assert!(!meets_retrieval_threshold("hi"));
        assert!(!meets_retrieval_threshold("  a  b "));
        assert!(meets_retrieval_threshold("hello there"));
    }

    #[tokio::test]
    async fn test_query_success() {
        let mock_server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path_regex(".*"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "memories": "User prefers dark mode.",
                "count": 1
            })))
            .mount(&mock_server)
            .await;

        let client = MemoryRetrievalClient::new(&config(&mock_server.uri()));
        let result = client.query("what theme do I like?").await;
        assert_eq!(result.as_deref(), Some("User prefers dark mode."));
    }

    #[tokio::test]
    async fn test_query_wrapped_in_message() {
        let mock_server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path_regex(".*"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "message": {"memories": "likes tea", "count": 1}
            })))
            .mount(&mock_server)
            .await;

        let client = MemoryRetrievalClient::new(&config(&mock_server.uri()));
        let result = client.query("anything").await;
        assert_eq!(result.as_deref(), Some("likes tea"));
    }

    #[tokio::test]
    async fn test_query_non_200_returns_none() {
        let mock_server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path_regex(".*"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&mock_server)
            .await;

        let client = MemoryRetrievalClient::new(&config(&mock_server.uri()));
        assert!(client.query("anything").await.is_none());
    }

    #[tokio::test]
    async fn test_query_network_error_returns_none() {
        let client = MemoryRetrievalClient::new(&config("http://127.0.0.1:1"));
        assert!(client.query("anything").await.is_none());
    }
}
