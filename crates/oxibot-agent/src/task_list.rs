//! Task-list updater — a secondary LLM call that refreshes the session's
//! task list after each turn on server-side channels.
//!
//! Failure at any step (LLM error, no array found, malformed JSON, schema
//! mismatch) is silent: the existing task list is left unchanged.

use regex::Regex;
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;
use tracing::warn;

use oxibot_core::types::{TaskItem, TaskStatus};
use oxibot_providers::traits::{LlmProvider, LlmRequestConfig};

const MAX_TASKS: usize = 10;
const MAX_TASK_CHARS: usize = 80;
const ASSISTANT_PREVIEW_CHARS: usize = 500;

#[derive(Debug, Deserialize)]
struct RawTaskItem {
    task: String,
    #[serde(default)]
    status: String,
}

fn array_regex() -> Regex {
    // Greedy — matches the first `[...]` span, tolerating nested arrays
    // inside individual task objects.
    Regex::new(r"(?s)\[.*\]").expect("static regex is valid")
}

fn build_prompt(
    current_tasks: &[TaskItem],
    user_message: &str,
    tools_used: &str,
    assistant_response: &str,
) -> String {
    let current = current_tasks
        .iter()
        .map(|t| format!("- [{:?}] {}", t.status, t.task))
        .collect::<Vec<_>>()
        .join("\n");
    let preview: String = assistant_response.chars().take(ASSISTANT_PREVIEW_CHARS).collect();

    format!(
        "Update the task list for this conversation based on the latest turn.\n\n\
         Current task list:\n{current}\n\n\
         User message: {user_message}\n\
         Tools used this turn: {tools_used}\n\
         Assistant response (truncated): {preview}\n\n\
         Return ONLY a bare JSON array of objects shaped like \
         {{\"task\": string, \"status\": \"pending\"|\"in_progress\"|\"completed\"}}. \
         No prose, no markdown fences."
    )
}

/// Run the task-list updater: ask the LLM for a refreshed task list,
/// parse/validate it, and return it. Returns `None` on any failure,
/// meaning the caller should leave the existing list untouched.
pub async fn update_task_list(
    provider: &dyn LlmProvider,
    model: &str,
    request_config: &LlmRequestConfig,
    current_tasks: &[TaskItem],
    user_message: &str,
    tools_used: &str,
    assistant_response: &str,
) -> Option<Vec<TaskItem>> {
    let prompt = build_prompt(current_tasks, user_message, tools_used, assistant_response);
    let messages = vec![oxibot_core::types::Message::user(&prompt)];

    let response = match provider.chat(&messages, None, model, request_config).await {
        Ok(r) => r,
        Err(e) => {
            warn!(error = %e, "task list updater LLM call failed");
            return None;
        }
    };

    let content = response.content?;
    let re = array_regex();
    let matched = re.find(&content)?;

    let raw: Vec<RawTaskItem> = match serde_json::from_str(matched.as_str()) {
        Ok(items) => items,
        Err(e) => {
            warn!(error = %e, "task list updater produced unparseable JSON");
            return None;
        }
    };

    let mut items: Vec<TaskItem> = raw
        .into_iter()
        .map(|r| TaskItem {
            task: r.task.chars().take(MAX_TASK_CHARS).collect(),
            status: TaskStatus::coerce(&r.status),
        })
        .collect();

    if items.len() > MAX_TASKS {
        items = items.split_off(items.len() - MAX_TASKS);
    }

    Some(items)
}

/// POST the refreshed task list to the server-side endpoint. Swallows
/// errors — this is best-effort notification, not part of the turn's
/// success/failure path.
pub async fn publish_task_list(client: &Client, endpoint: &str, tasks: &[TaskItem]) {
    let body = json!({ "tasks": tasks });
    if let Err(e) = client.post(endpoint).json(&body).send().await {
        warn!(error = %e, "failed to publish task list to server endpoint");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use oxibot_core::types::{LlmResponse, Message, ToolDefinition};

    struct StubProvider {
        content: String,
    }

    #[async_trait]
    impl LlmProvider for StubProvider {
        async fn chat(
            &self,
            _messages: &[Message],
            _tools: Option<&[ToolDefinition]>,
            _model: &str,
            _config: &LlmRequestConfig,
        ) -> anyhow::Result<LlmResponse> {
            Ok(LlmResponse {
                content: Some(self.content.clone()),
                ..Default::default()
            })
        }
        fn default_model(&self) -> &str {
            "stub"
        }
        fn display_name(&self) -> &str {
            "Stub"
        }
    }

    #[tokio::test]
    async fn test_update_task_list_success() {
        let provider = StubProvider {
            content: r#"Sure, here you go: [{"task": "ship the feature", "status": "in_progress"}, {"task": "write tests", "status": "pending"}]"#.into(),
        };
        let result = update_task_list(
            &provider,
            "stub-model",
            &LlmRequestConfig::default(),
            &[],
            "let's ship it",
            "none",
            "Working on it.",
        )
        .await
        .unwrap();

        assert_eq!(result.len(), 2);
        assert_eq!(result[0].task, "ship the feature");
        assert_eq!(result[0].status, TaskStatus::InProgress);
    }

    #[tokio::test]
    async fn test_update_task_list_truncates_and_caps() {
        let long_task = "x".repeat(200);
        let items: Vec<String> = (0..15)
            .map(|i| format!(r#"{{"task": "{long_task}{i}", "status": "bogus"}}"#))
            .collect();
        let content = format!("[{}]", items.join(","));

        let provider = StubProvider { content };
        let result = update_task_list(
            &provider,
            "stub-model",
            &LlmRequestConfig::default(),
            &[],
            "msg",
            "none",
            "resp",
        )
        .await
        .unwrap();

        assert_eq!(result.len(), MAX_TASKS);
        assert!(result[0].task.chars().count() <= MAX_TASK_CHARS);
        assert_eq!(result[0].status, TaskStatus::Pending);
    }

    #[tokio::test]
    async fn test_update_task_list_no_array_returns_none() {
        let provider = StubProvider {
            content: "I don't think any tasks need updating right now.".into(),
        };
        let result = update_task_list(
            &provider,
            "stub-model",
            &LlmRequestConfig::default(),
            &[],
            "msg",
            "none",
            "resp",
        )
        .await;
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn test_update_task_list_malformed_json_returns_none() {
        let provider = StubProvider {
            content: "[{\"task\": \"broken\", ]".into(),
        };
        let result = update_task_list(
            &provider,
            "stub-model",
            &LlmRequestConfig::default(),
            &[],
            "msg",
            "none",
            "resp",
        )
        .await;
        assert!(result.is_none());
    }
}
