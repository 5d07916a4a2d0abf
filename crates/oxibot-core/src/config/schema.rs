//! Configuration schema — typed replacements for nanobot's Pydantic models.
//!
//! Hierarchy: `Config` → `AgentsConfig`, `ProvidersConfig`, `ChannelsConfig`,
//! `ToolsConfig`, `ServerConfig`.
//!
//! JSON on disk uses **camelCase** keys; Rust uses snake_case.
//! We use `#[serde(rename_all = "camelCase")]` to handle the conversion.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

// ─────────────────────────────────────────────
// Root Config
// ─────────────────────────────────────────────

/// Root configuration — loaded from `~/.oxibot/config.json` + env vars.
///
/// Replaces nanobot's `Config(BaseSettings)`.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Config {
    pub agents: AgentsConfig,
    pub providers: ProvidersConfig,
    pub channels: ChannelsConfig,
    pub tools: ToolsConfig,
    /// Inbound webhook/REST listener (was `gateway` — renamed to avoid
    /// colliding with the Skillgate remote-tool-proxy "Gateway Tool").
    pub server: ServerConfig,
    #[serde(default)]
    pub transcription: TranscriptionConfig,
    /// Remote tool-proxy gateway (Skillgate) configuration.
    #[serde(default)]
    pub skillgate: SkillgateConfig,
    /// Sync HTTP (API) channel configuration.
    #[serde(default)]
    pub api_channel: ApiChannelConfig,
    /// Server-push outbound channel configuration.
    #[serde(default)]
    pub push_channel: PushChannelConfig,
    /// Event webhook emitter configuration.
    #[serde(default)]
    pub webhook: WebhookConfig,
    /// Memory-retrieval endpoint configuration.
    #[serde(default)]
    pub memory_retrieval: MemoryRetrievalConfig,
    /// Debug/development toggles.
    #[serde(default)]
    pub debug: DebugConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            agents: AgentsConfig::default(),
            providers: ProvidersConfig::default(),
            channels: ChannelsConfig::default(),
            tools: ToolsConfig::default(),
            server: ServerConfig::default(),
            transcription: TranscriptionConfig::default(),
            skillgate: SkillgateConfig::default(),
            api_channel: ApiChannelConfig::default(),
            push_channel: PushChannelConfig::default(),
            webhook: WebhookConfig::default(),
            memory_retrieval: MemoryRetrievalConfig::default(),
            debug: DebugConfig::default(),
        }
    }
}

// ─────────────────────────────────────────────
// Agents
// ─────────────────────────────────────────────

/// Agent configuration container.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AgentsConfig {
    pub defaults: AgentDefaults,
}

impl Default for AgentsConfig {
    fn default() -> Self {
        Self {
            defaults: AgentDefaults::default(),
        }
    }
}

/// Default agent settings.
///
/// Replaces nanobot's `AgentDefaults`.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AgentDefaults {
    /// Default workspace directory.
    pub workspace: String,
    /// Default LLM model identifier.
    pub model: String,
    /// Maximum tokens to generate per response.
    pub max_tokens: u32,
    /// Sampling temperature (0.0 – 2.0).
    pub temperature: f64,
    /// Maximum tool-calling loop iterations before forcing a response.
    pub max_tool_iterations: u32,
    /// Minimum number of recent user/assistant pairs always kept in
    /// structured context, regardless of age.
    pub min_context_pairs: u32,
    /// Extend the recent-pairs window backwards while a pair's age is
    /// within this many minutes.
    pub context_recency_minutes: i64,
    /// Hard cap on the number of recent pairs kept in structured context.
    pub max_context_pairs: u32,
    /// Hard cap on tool-action log entries kept in structured context.
    pub max_tool_log_entries: u32,
}

impl Default for AgentDefaults {
    fn default() -> Self {
        Self {
            workspace: "~/.oxibot/workspace".to_string(),
            model: "anthropic/claude-sonnet-4-20250514".to_string(),
            max_tokens: 8192,
            temperature: 0.7,
            max_tool_iterations: 20,
            min_context_pairs: 3,
            context_recency_minutes: 30,
            max_context_pairs: 20,
            max_tool_log_entries: 30,
        }
    }
}

// ─────────────────────────────────────────────
// Providers
// ─────────────────────────────────────────────

/// Configuration for a single LLM provider (API key, base URL, headers).
///
/// Replaces nanobot's `ProviderConfig`.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ProviderConfig {
    /// API key for authentication.
    #[serde(default)]
    pub api_key: String,
    /// Custom API base URL (overrides provider default).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_base: Option<String>,
    /// Extra HTTP headers to send with each request.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub extra_headers: Option<HashMap<String, String>>,
}

impl ProviderConfig {
    /// Whether this provider has a configured API key.
    pub fn is_configured(&self) -> bool {
        !self.api_key.is_empty()
    }
}

/// All provider configurations.
///
/// One `ProviderConfig` per supported LLM backend.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ProvidersConfig {
    #[serde(default)]
    pub anthropic: ProviderConfig,
    #[serde(default)]
    pub openai: ProviderConfig,
    #[serde(default)]
    pub openrouter: ProviderConfig,
    #[serde(default)]
    pub deepseek: ProviderConfig,
    #[serde(default)]
    pub groq: ProviderConfig,
    #[serde(default)]
    pub zhipu: ProviderConfig,
    #[serde(default)]
    pub dashscope: ProviderConfig,
    #[serde(default)]
    pub vllm: ProviderConfig,
    #[serde(default)]
    pub gemini: ProviderConfig,
    #[serde(default)]
    pub moonshot: ProviderConfig,
    #[serde(default)]
    pub minimax: ProviderConfig,
    #[serde(default)]
    pub aihubmix: ProviderConfig,
}

impl ProvidersConfig {
    /// Get a provider config by name (e.g. `"anthropic"`).
    pub fn get_by_name(&self, name: &str) -> Option<&ProviderConfig> {
        match name {
            "anthropic" => Some(&self.anthropic),
            "openai" => Some(&self.openai),
            "openrouter" => Some(&self.openrouter),
            "deepseek" => Some(&self.deepseek),
            "groq" => Some(&self.groq),
            "zhipu" => Some(&self.zhipu),
            "dashscope" => Some(&self.dashscope),
            "vllm" => Some(&self.vllm),
            "gemini" => Some(&self.gemini),
            "moonshot" => Some(&self.moonshot),
            "minimax" => Some(&self.minimax),
            "aihubmix" => Some(&self.aihubmix),
            _ => None,
        }
    }

    /// Convert to a HashMap<String, ProviderConfig> for use with the provider registry.
    pub fn to_map(&self) -> HashMap<String, ProviderConfig> {
        let mut map = HashMap::new();
        let entries: &[(&str, &ProviderConfig)] = &[
            ("anthropic", &self.anthropic),
            ("openai", &self.openai),
            ("openrouter", &self.openrouter),
            ("deepseek", &self.deepseek),
            ("groq", &self.groq),
            ("zhipu", &self.zhipu),
            ("dashscope", &self.dashscope),
            ("vllm", &self.vllm),
            ("gemini", &self.gemini),
            ("moonshot", &self.moonshot),
            ("minimax", &self.minimax),
            ("aihubmix", &self.aihubmix),
        ];
        for (name, config) in entries {
            map.insert(name.to_string(), (*config).clone());
        }
        map
    }
}

// ─────────────────────────────────────────────
// Channels
// ─────────────────────────────────────────────

/// All channel configurations.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ChannelsConfig {
    #[serde(default)]
    pub telegram: TelegramConfig,
    #[serde(default)]
    pub discord: DiscordConfig,
    #[serde(default)]
    pub whatsapp: WhatsAppConfig,
    #[serde(default)]
    pub feishu: FeishuConfig,
}

/// Telegram channel config.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TelegramConfig {
    #[serde(default)]
    pub token: String,
    #[serde(default)]
    pub allowed_users: Vec<String>,
}

/// Discord channel config.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DiscordConfig {
    #[serde(default)]
    pub token: String,
    #[serde(default)]
    pub allowed_users: Vec<String>,
}

/// WhatsApp channel config.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct WhatsAppConfig {
    #[serde(default)]
    pub bridge_url: String,
    #[serde(default)]
    pub allowed_users: Vec<String>,
}

/// Feishu/Lark channel config.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct FeishuConfig {
    #[serde(default)]
    pub app_id: String,
    #[serde(default)]
    pub app_secret: String,
    #[serde(default)]
    pub allowed_users: Vec<String>,
}

fn default_true() -> bool {
    true
}

// ─────────────────────────────────────────────
// Tools
// ─────────────────────────────────────────────

/// Tool configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ToolsConfig {
    /// Web tools configuration (search, fetch).
    #[serde(default)]
    pub web: WebToolsConfig,
    /// Shell exec tool configuration.
    #[serde(default)]
    pub exec: ExecToolConfig,
    /// Whether to restrict file/exec operations to the workspace directory.
    #[serde(default)]
    pub restrict_to_workspace: bool,
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            web: WebToolsConfig::default(),
            exec: ExecToolConfig::default(),
            restrict_to_workspace: false,
        }
    }
}

/// Web tools configuration.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct WebToolsConfig {
    #[serde(default)]
    pub search: WebSearchConfig,
}

/// Web search configuration (Brave API).
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct WebSearchConfig {
    /// Brave Search API key.
    #[serde(default)]
    pub api_key: String,
    /// Maximum number of search results to return.
    pub max_results: u32,
}

impl Default for WebSearchConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            max_results: 5,
        }
    }
}

/// Shell exec tool configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ExecToolConfig {
    /// Timeout in seconds for shell commands.
    pub timeout: u64,
}

impl Default for ExecToolConfig {
    fn default() -> Self {
        Self { timeout: 60 }
    }
}

// ─────────────────────────────────────────────
// Transcription + Server
// ─────────────────────────────────────────────

/// Voice transcription configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TranscriptionConfig {
    /// Whether voice transcription is enabled.
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Transcription provider (currently only "groq" supported).
    #[serde(default = "default_groq")]
    pub provider: String,
    /// API key for the transcription provider.
    /// Falls back to GROQ_API_KEY env var if empty.
    #[serde(default)]
    pub api_key: String,
    /// Whisper model name.
    #[serde(default = "default_whisper_model")]
    pub model: String,
}

fn default_groq() -> String { "groq".into() }
fn default_whisper_model() -> String { "whisper-large-v3".into() }

impl Default for TranscriptionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            provider: "groq".into(),
            api_key: String::new(),
            model: "whisper-large-v3".into(),
        }
    }
}

/// HTTP server configuration (for incoming webhooks / REST API).
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerConfig {
    /// Listen address.
    pub host: String,
    /// Listen port.
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 18790,
        }
    }
}

// ─────────────────────────────────────────────
// Skillgate (remote tool-proxy "Gateway Tool")
// ─────────────────────────────────────────────

/// One remotely-proxied tool definition exposed through the Skillgate
/// gateway.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SkillgateToolDef {
    pub name: String,
    pub description: String,
    pub input_schema: serde_json::Value,
}

/// Configuration for the remote tool-proxy gateway tool.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SkillgateConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub api_key: String,
    #[serde(default)]
    pub api_secret: String,
    #[serde(default)]
    pub tools: Vec<SkillgateToolDef>,
}

impl Default for SkillgateConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            url: String::new(),
            api_key: String::new(),
            api_secret: String::new(),
            tools: Vec::new(),
        }
    }
}

impl SkillgateConfig {
    /// Whether the gateway has the minimum settings needed to run.
    pub fn is_usable(&self) -> bool {
        self.enabled && !self.url.is_empty() && !self.api_key.is_empty() && !self.api_secret.is_empty()
    }
}

// ─────────────────────────────────────────────
// Sync HTTP (API) channel
// ─────────────────────────────────────────────

/// Configuration for the synchronous HTTP channel (`POST /chat`).
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ApiChannelConfig {
    #[serde(default)]
    pub enabled: bool,
    pub host: String,
    pub port: u16,
}

impl Default for ApiChannelConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            host: "127.0.0.1".to_string(),
            port: 18791,
        }
    }
}

// ─────────────────────────────────────────────
// Server-push outbound channel
// ─────────────────────────────────────────────

/// Configuration for the server-push outbound channel (generalized from
/// the source's Raven-specific sink).
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PushChannelConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub site_url: String,
    #[serde(default)]
    pub api_key: String,
    #[serde(default)]
    pub api_secret: String,
    /// Sink id used when an outbound's `chat_id` is `"owner"` or empty.
    #[serde(default)]
    pub owner_dm_channel: String,
}

impl Default for PushChannelConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            site_url: String::new(),
            api_key: String::new(),
            api_secret: String::new(),
            owner_dm_channel: String::new(),
        }
    }
}

// ─────────────────────────────────────────────
// Webhook emitter
// ─────────────────────────────────────────────

/// Configuration for the fire-and-forget lifecycle-event webhook.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct WebhookConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auth_header: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            url: None,
            auth_header: None,
            token: None,
        }
    }
}

// ─────────────────────────────────────────────
// Memory-retrieval endpoint
// ─────────────────────────────────────────────

/// Configuration for the external memory-retrieval endpoint consulted
/// at the start of a turn.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MemoryRetrievalConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub api_key: String,
}

impl Default for MemoryRetrievalConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            url: String::new(),
            api_key: String::new(),
        }
    }
}

// ─────────────────────────────────────────────
// Debug
// ─────────────────────────────────────────────

/// Development/troubleshooting toggles.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DebugConfig {
    /// Append token-usage stats to every assistant message.
    #[serde(default)]
    pub show_token_usage: bool,
}

// ─────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.agents.defaults.max_tokens, 8192);
        assert_eq!(config.agents.defaults.temperature, 0.7);
        assert_eq!(config.agents.defaults.max_tool_iterations, 20);
        assert_eq!(config.server.port, 18790);
        assert!(!config.tools.restrict_to_workspace);
    }

    #[test]
    fn test_config_from_json_camel_case() {
        let json = serde_json::json!({
            "agents": {
                "defaults": {
                    "model": "gpt-4o",
                    "maxTokens": 4096,
                    "temperature": 0.5,
                    "maxToolIterations": 10
                }
            },
            "server": {
                "host": "127.0.0.1",
                "port": 9090
            }
        });

        let config: Config = serde_json::from_value(json).unwrap();
        assert_eq!(config.agents.defaults.model, "gpt-4o");
        assert_eq!(config.agents.defaults.max_tokens, 4096);
        assert_eq!(config.agents.defaults.temperature, 0.5);
        assert_eq!(config.agents.defaults.max_tool_iterations, 10);
        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.server.port, 9090);
        // Defaults preserved for missing fields
        assert!(!config.tools.restrict_to_workspace);
        assert_eq!(config.tools.exec.timeout, 60);
    }

    #[test]
    fn test_config_serialization_round_trip() {
        let config = Config::default();
        let json_str = serde_json::to_string_pretty(&config).unwrap();
        let deserialized: Config = serde_json::from_str(&json_str).unwrap();
        assert_eq!(deserialized.agents.defaults.model, config.agents.defaults.model);
        assert_eq!(deserialized.server.port, config.server.port);
    }

    #[test]
    fn test_config_json_uses_camel_case() {
        let config = Config::default();
        let json = serde_json::to_value(&config).unwrap();
        // Should use camelCase keys
        assert!(json["agents"]["defaults"].get("maxTokens").is_some());
        assert!(json["agents"]["defaults"].get("maxToolIterations").is_some());
        assert!(json["tools"].get("restrictToWorkspace").is_some());
        // Should NOT have snake_case keys
        assert!(json["agents"]["defaults"].get("max_tokens").is_none());
    }

    #[test]
    fn test_provider_config_is_configured() {
        let empty = ProviderConfig::default();
        assert!(!empty.is_configured());

        let with_key = ProviderConfig {
            api_key: "sk-123".to_string(),
            ..Default::default()
        };
        assert!(with_key.is_configured());
    }

    #[test]
    fn test_providers_get_by_name() {
        let mut providers = ProvidersConfig::default();
        providers.anthropic.api_key = "sk-ant-123".to_string();

        assert!(providers.get_by_name("anthropic").unwrap().is_configured());
        assert!(!providers.get_by_name("openai").unwrap().is_configured());
        assert!(providers.get_by_name("nonexistent").is_none());
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let json = serde_json::json!({
            "providers": {
                "anthropic": {
                    "apiKey": "sk-ant-test"
                }
            }
        });

        let config: Config = serde_json::from_value(json).unwrap();
        assert_eq!(config.providers.anthropic.api_key, "sk-ant-test");
        // All other providers should have empty defaults
        assert!(!config.providers.openai.is_configured());
        assert!(!config.providers.groq.is_configured());
        // Agent defaults still present
        assert_eq!(config.agents.defaults.max_tokens, 8192);
    }

    #[test]
    fn test_channel_config_from_json() {
        let json = serde_json::json!({
            "channels": {
                "telegram": {
                    "token": "bot123:ABC",
                    "allowedUsers": ["user1", "user2"]
                },
                "feishu": {
                    "appId": "cli_abc",
                    "appSecret": "secret123"
                }
            }
        });

        let config: Config = serde_json::from_value(json).unwrap();
        assert_eq!(config.channels.telegram.token, "bot123:ABC");
        assert_eq!(config.channels.telegram.allowed_users, vec!["user1", "user2"]);
        assert_eq!(config.channels.feishu.app_id, "cli_abc");
        assert_eq!(config.channels.feishu.app_secret, "secret123");
    }

    #[test]
    fn test_tools_config_from_json() {
        let json = serde_json::json!({
            "tools": {
                "web": {
                    "search": {
                        "apiKey": "brave-key-123",
                        "maxResults": 10
                    }
                },
                "exec": {
                    "timeout": 120
                },
                "restrictToWorkspace": true
            }
        });

        let config: Config = serde_json::from_value(json).unwrap();
        assert_eq!(config.tools.web.search.api_key, "brave-key-123");
        assert_eq!(config.tools.web.search.max_results, 10);
        assert_eq!(config.tools.exec.timeout, 120);
        assert!(config.tools.restrict_to_workspace);
    }

    #[test]
    fn test_empty_json_gives_defaults() {
        let config: Config = serde_json::from_str("{}").unwrap();
        assert_eq!(config.agents.defaults.model, "anthropic/claude-sonnet-4-20250514");
        assert_eq!(config.agents.defaults.max_tokens, 8192);
        assert_eq!(config.server.port, 18790);
    }

    #[test]
    fn test_skillgate_config_defaults_and_usable() {
        let config = Config::default();
        assert!(!config.skillgate.enabled);
        assert!(!config.skillgate.is_usable());

        let usable = SkillgateConfig {
            enabled: true,
            url: "https://gate.example.com".into(),
            api_key: "key".into(),
            api_secret: "secret".into(),
            tools: Vec::new(),
        };
        assert!(usable.is_usable());
    }

    #[test]
    fn test_debug_config_defaults_off() {
        let config = Config::default();
        assert!(!config.debug.show_token_usage);
    }

    #[test]
    fn test_new_sections_from_camel_case_json() {
        let json = serde_json::json!({
            "apiChannel": { "enabled": true, "port": 4000 },
            "pushChannel": { "enabled": true, "siteUrl": "https://push.example.com" },
            "webhook": { "url": "https://hooks.example.com/event" },
            "memoryRetrieval": { "enabled": true, "url": "https://mem.example.com" }
        });

        let config: Config = serde_json::from_value(json).unwrap();
        assert!(config.api_channel.enabled);
        assert_eq!(config.api_channel.port, 4000);
        assert!(config.push_channel.enabled);
        assert_eq!(config.push_channel.site_url, "https://push.example.com");
        assert_eq!(config.webhook.url.as_deref(), Some("https://hooks.example.com/event"));
        assert!(config.memory_retrieval.enabled);
    }

    #[test]
    fn test_context_tuning_defaults() {
        let config = Config::default();
        assert_eq!(config.agents.defaults.min_context_pairs, 3);
        assert_eq!(config.agents.defaults.context_recency_minutes, 30);
        assert_eq!(config.agents.defaults.max_context_pairs, 20);
        assert_eq!(config.agents.defaults.max_tool_log_entries, 30);
    }
}
