//! Agent loop — the LLM ↔ tool-calling main loop.
//!
//! Port of nanobot's `agent/loop.py`.
//! Receives inbound messages, builds context, calls the LLM, dispatches
//! tool calls, and publishes outbound responses.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use serde_json::Value;
use tracing::{debug, error, info};

use oxibot_core::bus::queue::MessageBus;
use oxibot_core::bus::types::{InboundMessage, OutboundMessage};
use oxibot_core::config::schema::{MemoryRetrievalConfig, SkillgateConfig};
use oxibot_core::session::manager::{SessionManager, StructuredContextConfig};
use oxibot_core::types::{Message, ToolAction, ToolCall};
use oxibot_core::webhook::WebhookEmitter;
use oxibot_providers::traits::{LlmProvider, LlmRequestConfig};

use crate::context::ContextBuilder;
use crate::memory_retrieval::{meets_retrieval_threshold, MemoryRetrievalClient};
use crate::subagent::SubagentManager;
use crate::task_list;
use crate::tools::message::MessageTool;
use crate::tools::registry::ToolRegistry;
use crate::tools::filesystem::{EditFileTool, ListDirTool, ReadFileTool, WriteFileTool};
use crate::tools::gateway::{build_gateway_tools, CheckApprovalResultTool, GatewayTool};
use crate::tools::shell::ExecTool;
use crate::tools::spawn::SpawnTool;
use crate::tools::web::{WebFetchTool, WebSearchTool};

/// Default maximum LLM ↔ tool iterations per user message.
const DEFAULT_MAX_ITERATIONS: usize = 20;

/// Placeholder returned when the loop exhausts `max_iterations` without a
/// terminal assistant message.
const EXHAUSTION_PLACEHOLDER: &str = "I've completed processing but have no response to give.";

/// Channel name identifying the sync HTTP (server-side) channel; turns
/// routed through it get the task list refreshed after they complete.
const SERVER_SIDE_CHANNEL: &str = "api";

/// Configuration for the exec tool.
#[derive(Clone, Debug)]
pub struct ExecToolConfig {
    /// Timeout in seconds (default 60).
    pub timeout: u64,
}

impl Default for ExecToolConfig {
    fn default() -> Self {
        Self { timeout: 60 }
    }
}

/// Token totals accumulated across one turn's LLM calls.
#[derive(Clone, Copy, Debug, Default)]
struct TurnUsage {
    prompt_tokens: u32,
    completion_tokens: u32,
}

/// Everything a single turn needs that isn't carried on `AgentLoop`
/// itself: the resolved routing target, session key, and originating
/// metadata.
struct TurnRequest<'a> {
    channel: String,
    chat_id: String,
    session_key: String,
    content: &'a str,
    media: Vec<String>,
    metadata: HashMap<String, String>,
}

// ─────────────────────────────────────────────
// AgentLoop
// ─────────────────────────────────────────────

/// The main agent loop: polls the message bus, calls the LLM, dispatches tools.
pub struct AgentLoop {
    /// Message bus for inbound/outbound messages.
    bus: Arc<MessageBus>,
    /// LLM provider.
    provider: Arc<dyn LlmProvider>,
    /// Workspace root.
    workspace: PathBuf,
    /// Model to use (overrides provider default if set).
    model: String,
    /// Max LLM ↔ tool iterations per message.
    max_iterations: usize,
    /// LLM request config (temperature, max_tokens).
    request_config: LlmRequestConfig,
    /// Tool registry.
    tools: ToolRegistry,
    /// Context builder.
    context: ContextBuilder,
    /// Session manager.
    sessions: SessionManager,
    /// Structured-context tuning knobs.
    structured_context_config: StructuredContextConfig,
    /// Reference to the message tool (for set_context).
    message_tool: Arc<MessageTool>,
    /// Spawn tool reference (for set_context).
    spawn_tool: Arc<SpawnTool>,
    /// Subagent manager (also held by SpawnTool; kept for direct access).
    #[allow(dead_code)]
    subagent_manager: Arc<SubagentManager>,
    /// Concrete gateway-tool handles (for set_metadata); the dyn versions
    /// are already registered in `tools`.
    gateway_tools: Vec<Arc<GatewayTool>>,
    /// Memory-retrieval client, present only when the endpoint is configured.
    memory_client: Option<MemoryRetrievalClient>,
    /// Lifecycle-event webhook emitter (no-op when unconfigured).
    webhook: WebhookEmitter,
    /// Server-side endpoint the task-list updater posts refreshed lists to.
    task_list_endpoint: Option<String>,
    /// Append a token-usage footer to outbound content.
    debug: bool,
}

impl AgentLoop {
    /// Create a new agent loop.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        bus: Arc<MessageBus>,
        provider: Arc<dyn LlmProvider>,
        workspace: PathBuf,
        model: Option<String>,
        max_iterations: Option<usize>,
        request_config: Option<LlmRequestConfig>,
        brave_api_key: Option<String>,
        exec_config: Option<ExecToolConfig>,
        restrict_to_workspace: bool,
        session_manager: Option<SessionManager>,
        agent_name: Option<String>,
        structured_context_config: Option<StructuredContextConfig>,
        skillgate_config: Option<SkillgateConfig>,
        memory_retrieval_config: Option<MemoryRetrievalConfig>,
        webhook: Option<WebhookEmitter>,
        task_list_endpoint: Option<String>,
        debug: bool,
    ) -> Self {
        let model = model.unwrap_or_else(|| provider.default_model().to_string());
        let max_iterations = max_iterations.unwrap_or(DEFAULT_MAX_ITERATIONS);
        let request_config = request_config.unwrap_or_default();
        let exec_config = exec_config.unwrap_or_default();
        let agent_name = agent_name.unwrap_or_else(|| "Oxibot".into());
        let structured_context_config = structured_context_config.unwrap_or_default();
        let sessions =
            session_manager.unwrap_or_else(|| SessionManager::new(None).expect("failed to create session manager"));

        let context = ContextBuilder::new(&workspace, &agent_name);

        // Build tool registry
        let mut tools = ToolRegistry::new();
        let allowed_dir = if restrict_to_workspace {
            Some(workspace.clone())
        } else {
            None
        };

        tools.register(Arc::new(ReadFileTool::new(allowed_dir.clone())));
        tools.register(Arc::new(WriteFileTool::new(allowed_dir.clone())));
        tools.register(Arc::new(EditFileTool::new(allowed_dir.clone())));
        tools.register(Arc::new(ListDirTool::new(allowed_dir)));
        tools.register(Arc::new(ExecTool::new(
            workspace.clone(),
            Some(exec_config.timeout),
            restrict_to_workspace,
        )));
        tools.register(Arc::new(WebSearchTool::new(brave_api_key.clone())));
        tools.register(Arc::new(WebFetchTool::new()));

        let message_tool = Arc::new(MessageTool::new(None));
        tools.register(message_tool.clone());

        // Subagent manager + spawn tool
        let subagent_manager = Arc::new(SubagentManager::new(
            provider.clone(),
            workspace.clone(),
            bus.clone(),
            model.clone(),
            brave_api_key,
            exec_config,
            restrict_to_workspace,
            request_config.clone(),
        ));

        let spawn_tool = Arc::new(SpawnTool::new(subagent_manager.clone()));
        tools.register(spawn_tool.clone());

        // Remote tool-proxy gateway tools, if configured.
        let skillgate_config = skillgate_config.unwrap_or_default();
        let gateway_tools = build_gateway_tools(&skillgate_config);
        if !gateway_tools.is_empty() {
            for tool in &gateway_tools {
                tools.register(tool.clone());
            }
            tools.register(Arc::new(CheckApprovalResultTool::new(
                skillgate_config.url.clone(),
                skillgate_config.api_key.clone(),
            )));
        }

        let memory_client = memory_retrieval_config
            .filter(|c| c.enabled)
            .map(|c| MemoryRetrievalClient::new(&c));

        let webhook = webhook.unwrap_or_default();

        info!(
            model = %model,
            tools = tools.len(),
            max_iterations = max_iterations,
            "agent loop initialized"
        );

        Self {
            bus,
            provider,
            workspace,
            model,
            max_iterations,
            request_config,
            tools,
            context,
            sessions,
            structured_context_config,
            message_tool,
            spawn_tool,
            subagent_manager,
            gateway_tools,
            memory_client,
            webhook,
            task_list_endpoint,
            debug,
        }
    }

    /// Run the event loop: poll inbound messages and process them.
    ///
    /// This runs indefinitely until the inbound channel is closed.
    pub async fn run(&self) {
        info!("agent loop started, waiting for messages");
        loop {
            match self.bus.consume_inbound().await {
                Some(msg) => {
                    let session_key = msg.session_key();
                    debug!(session_key = %session_key, "received message");

                    // Route system messages (from subagents) vs regular messages
                    let result = if msg.channel == "system" {
                        self.process_system_message(&msg).await
                    } else {
                        self.process_message(&msg).await
                    };

                    match result {
                        Ok(response) => {
                            if let Err(e) = self.bus.publish_outbound(response).await {
                                error!(error = %e, "failed to publish outbound message");
                            }
                        }
                        Err(e) => {
                            error!(error = %e, session_key = %session_key, "message processing error");
                            let mut err_msg = OutboundMessage::new(
                                &msg.channel,
                                &msg.chat_id,
                                &format!("Sorry, I encountered an error: {e}"),
                            );
                            err_msg.metadata.insert("is_final".to_string(), "true".to_string());
                            let _ = self.bus.publish_outbound(err_msg).await;
                        }
                    }
                }
                None => {
                    info!("inbound channel closed, agent loop exiting");
                    break;
                }
            }
        }
    }

    /// Process a single inbound message → outbound response.
    pub async fn process_message(&self, msg: &InboundMessage) -> Result<OutboundMessage> {
        let session_key = msg
            .metadata
            .get("session_id")
            .cloned()
            .unwrap_or_else(|| format!("{}:{}", msg.channel, msg.sender_id));

        let media_paths: Vec<String> = msg.media.iter().map(|m| m.path.clone()).collect();

        let request = TurnRequest {
            channel: msg.channel.clone(),
            chat_id: msg.chat_id.clone(),
            session_key,
            content: &msg.content,
            media: media_paths,
            metadata: msg.metadata.clone(),
        };

        self.run_turn(request).await
    }

    /// Process a system message (from a subagent or cron).
    ///
    /// Parses the original `channel:chat_id` from `msg.chat_id` (falling
    /// back to `("cli", chat_id)` if the separator is missing) and routes
    /// the turn's result back there, resuming the original session.
    async fn process_system_message(&self, msg: &InboundMessage) -> Result<OutboundMessage> {
        info!(
            sender = %msg.sender_id,
            chat_id = %msg.chat_id,
            "processing system message"
        );

        let (origin_channel, origin_chat_id) = match msg.chat_id.split_once(':') {
            Some((ch, cid)) => (ch.to_string(), cid.to_string()),
            None => ("cli".to_string(), msg.chat_id.clone()),
        };

        let session_key = msg
            .metadata
            .get("session_id")
            .cloned()
            .unwrap_or_else(|| format!("{origin_channel}:{origin_chat_id}"));

        let mut metadata = msg.metadata.clone();
        metadata
            .entry("session_id".to_string())
            .or_insert_with(|| session_key.clone());

        let request = TurnRequest {
            channel: origin_channel,
            chat_id: origin_chat_id,
            session_key,
            content: &msg.content,
            media: Vec::new(),
            metadata,
        };

        self.run_turn(request).await
    }

    /// The unified turn engine: tool-context setup, optional memory
    /// retrieval, the bounded LLM ↔ tool loop, session persistence, and
    /// (for server-side-channel turns) the task-list refresh.
    async fn run_turn(&self, request: TurnRequest<'_>) -> Result<OutboundMessage> {
        let TurnRequest {
            channel,
            chat_id,
            session_key,
            content,
            media,
            metadata: _metadata,
        } = request;

        self.message_tool.set_context(&channel, &chat_id).await;
        self.spawn_tool.set_context(&channel, &chat_id).await;
        for tool in &self.gateway_tools {
            tool.set_metadata(&_metadata).await;
        }

        self.webhook.emit(
            "user_message",
            serde_json::json!({
                "session": session_key,
                "channel": channel,
                "chat_id": chat_id,
                "content": content,
            }),
        );

        let retrieved_memories = self.retrieve_memories(&session_key, content).await;

        let structured = self.sessions.get_structured_context(&session_key, self.structured_context_config);
        let mut messages = self.context.build_messages(
            &structured,
            retrieved_memories.as_deref(),
            content,
            &media,
            &channel,
            &chat_id,
        );

        let tool_defs = self.tools.get_definitions();

        let mut final_content: Option<String> = None;
        let mut usage = TurnUsage::default();
        let mut tool_actions: Vec<ToolAction> = Vec::new();

        for iteration in 0..self.max_iterations {
            debug!(iteration = iteration, session_key = %session_key, "LLM call");

            let response = self
                .provider
                .chat(&messages, Some(&tool_defs), &self.model, &self.request_config)
                .await?;

            if let Some(u) = &response.usage {
                usage.prompt_tokens = usage.prompt_tokens.saturating_add(u.prompt_tokens);
                usage.completion_tokens = usage.completion_tokens.saturating_add(u.completion_tokens);
            }

            if response.has_tool_calls() {
                let tool_calls: Vec<ToolCall> = response.tool_calls.clone();
                ContextBuilder::add_assistant_message(
                    &mut messages,
                    response.content.clone(),
                    tool_calls.clone(),
                    response.reasoning_content.clone(),
                );

                for tc in &tool_calls {
                    let params: HashMap<String, Value> =
                        serde_json::from_str(&tc.function.arguments).unwrap_or_default();

                    info!(tool = %tc.function.name, iteration = iteration, "executing tool call");
                    self.webhook.emit(
                        "tool_call",
                        serde_json::json!({
                            "session": session_key,
                            "tool": tc.function.name,
                            "arguments": tc.function.arguments,
                        }),
                    );

                    let result = self.tools.execute(&tc.function.name, params.clone()).await;

                    debug!(tool = %tc.function.name, result_len = result.len(), "tool result");
                    self.webhook.emit(
                        "tool_result",
                        serde_json::json!({
                            "session": session_key,
                            "tool": tc.function.name,
                            "result": result,
                        }),
                    );

                    tool_actions.push(ToolAction::new(
                        tc.function.name.clone(),
                        summarize_tool_args(&params),
                        summarize_tool_outcome(&result),
                    ));

                    ContextBuilder::add_tool_result(&mut messages, &tc.id, &result);
                }
            } else {
                final_content = response.content;
                break;
            }
        }

        let mut content_out = final_content.unwrap_or_else(|| EXHAUSTION_PLACEHOLDER.to_string());

        self.webhook.emit(
            "assistant_message",
            serde_json::json!({
                "session": session_key,
                "content": content_out,
            }),
        );

        if self.debug {
            content_out.push_str(&format!(
                "\n\n_[tokens: prompt={}, completion={}]_",
                usage.prompt_tokens, usage.completion_tokens
            ));
        }

        self.sessions.add_message(&session_key, Message::user(content));
        self.sessions.add_message(
            &session_key,
            Message::assistant(content_out.clone()).with_tool_actions(tool_actions.clone()),
        );

        if channel == SERVER_SIDE_CHANNEL {
            self.refresh_task_list(&session_key, content, &tool_actions, &content_out).await;
        }

        let mut response = OutboundMessage::new(&channel, &chat_id, &content_out);
        response.metadata.insert("is_final".to_string(), "true".to_string());
        Ok(response)
    }

    /// Query the memory-retrieval endpoint when enabled and the message
    /// clears the minimum length threshold. Any failure yields `None`.
    async fn retrieve_memories(&self, session_key: &str, content: &str) -> Option<String> {
        let client = self.memory_client.as_ref()?;
        if !meets_retrieval_threshold(content) {
            return None;
        }
        let result = client.query(content).await;
        self.webhook.emit(
            "memory_retrieval",
            serde_json::json!({
                "session": session_key,
                "query": content,
                "found": result.is_some(),
            }),
        );
        result
    }

    /// Run the task-list updater and persist the result, swallowing any
    /// failure (per §7, a task-list-updater failure is silent).
    async fn refresh_task_list(
        &self,
        session_key: &str,
        user_message: &str,
        tool_actions: &[ToolAction],
        assistant_response: &str,
    ) {
        let current = self.sessions.get_or_create(session_key).task_list();
        let tools_used = if tool_actions.is_empty() {
            "none".to_string()
        } else {
            tool_actions
                .iter()
                .map(|a| a.tool.as_str())
                .collect::<Vec<_>>()
                .join(", ")
        };

        let Some(updated) = task_list::update_task_list(
            self.provider.as_ref(),
            &self.model,
            &self.request_config,
            &current,
            user_message,
            &tools_used,
            assistant_response,
        )
        .await
        else {
            return;
        };

        self.sessions.set_task_list(session_key, updated.clone());

        if let Some(endpoint) = &self.task_list_endpoint {
            let client = reqwest::Client::new();
            task_list::publish_task_list(&client, endpoint, &updated).await;
        }
    }

    /// Direct processing mode (CLI entry point).
    ///
    /// Wraps text into an `InboundMessage` on the "cli" channel and processes.
    pub async fn process_direct(&self, text: &str) -> Result<String> {
        let msg = InboundMessage::new("cli", "user", "direct", text);
        let response = self.process_message(&msg).await?;
        Ok(response.content)
    }

    /// Get a reference to the tool registry (for testing/extension).
    pub fn tools(&self) -> &ToolRegistry {
        &self.tools
    }

    /// Get the model name.
    pub fn model(&self) -> &str {
        &self.model
    }
}

/// Summarize a tool call's arguments for the session's tool-action log.
/// A single string-valued argument is used verbatim (the common case:
/// `{path: "AGENTS.md"}` → `"AGENTS.md"`); anything else falls back to
/// the raw JSON object.
fn summarize_tool_args(params: &HashMap<String, Value>) -> String {
    if params.len() == 1 {
        if let Some(Value::String(s)) = params.values().next() {
            return s.clone();
        }
    }
    serde_json::to_string(params).unwrap_or_default()
}

/// Summarize a tool result for the session's tool-action log: the first
/// line, prefixed `"OK: "` unless the tool already reported an error.
fn summarize_tool_outcome(result: &str) -> String {
    let first_line = result.lines().next().unwrap_or(result);
    if first_line.starts_with("Error") {
        first_line.to_string()
    } else {
        format!("OK: {first_line}")
    }
}

// ─────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────
