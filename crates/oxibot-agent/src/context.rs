//! Context builder — constructs the system prompt and conversation messages.
//!
//! Port of nanobot's `agent/context.py`.
//! Builds the system prompt from identity, bootstrap files, memory, and skills,
//! then assembles the full message list for an LLM call out of the
//! structured context rather than the raw transcript.

use std::path::PathBuf;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::Utc;
use oxibot_core::session::manager::StructuredContext;
use oxibot_core::types::{ContentPart, ImageUrl, Message, TaskStatus};
use tracing::debug;

use crate::memory::MemoryStore;
use crate::skills::SkillsLoader;

// ─────────────────────────────────────────────
// Bootstrap / identity files
// ─────────────────────────────────────────────

/// Files that are automatically injected into the system prompt when present
/// in the workspace root.
const BOOTSTRAP_FILES: &[&str] = &[
    "AGENTS.md",
    "SOUL.md",
    "USER.md",
    "TOOLS.md",
    "IDENTITY.md",
];

// ─────────────────────────────────────────────
// Context builder
// ─────────────────────────────────────────────

/// Builds system prompts and conversation message lists for the agent loop.
pub struct ContextBuilder {
    /// Root workspace directory.
    workspace: PathBuf,
    /// Agent identity name (for the system prompt).
    agent_name: String,
    /// Memory store for long-term + daily notes.
    memory: MemoryStore,
    /// Skills loader for discovering and loading skill files.
    skills: SkillsLoader,
}

impl ContextBuilder {
    /// Create a new context builder.
    pub fn new(workspace: impl Into<PathBuf>, agent_name: impl Into<String>) -> Self {
        let workspace = workspace.into();
        let memory = MemoryStore::new_lazy(&workspace);
        let skills = SkillsLoader::new(&workspace, None);
        Self {
            workspace,
            agent_name: agent_name.into(),
            memory,
            skills,
        }
    }

    /// Set the built-in skills directory (builder pattern).
    pub fn with_builtin_skills(mut self, path: PathBuf) -> Self {
        self.skills = SkillsLoader::new(&self.workspace, Some(path));
        self
    }

    /// Get a reference to the memory store.
    pub fn memory(&self) -> &MemoryStore {
        &self.memory
    }

    /// Get a reference to the skills loader.
    pub fn skills(&self) -> &SkillsLoader {
        &self.skills
    }

    // ────────────── System prompt ──────────────

    /// Build the base system prompt: identity, bootstrap files, persisted
    /// memory, and skills. Retrieved memories, the structured-context
    /// recap, and session identifiers are appended afterward by
    /// [`ContextBuilder::build_messages`].
    pub fn build_system_prompt(&self) -> String {
        let mut parts: Vec<String> = Vec::new();

        // 1) Identity
        parts.push(self.build_identity());

        // 2) Bootstrap files
        for filename in BOOTSTRAP_FILES {
            let path = self.workspace.join(filename);
            if path.is_file() {
                if let Ok(content) = std::fs::read_to_string(&path) {
                    debug!(file = filename, "loaded bootstrap file");
                    parts.push(format!("## {filename}\n\n{content}"));
                }
            }
        }

        // 3) Memory context (via MemoryStore)
        if let Some(memory) = self.memory.get_memory_context() {
            parts.push(memory);
        }

        // 4) Always-on skills (full body injected)
        let always_skills = self.skills.get_always_skills();
        if !always_skills.is_empty() {
            let always_content = self.skills.load_skills_for_context(&always_skills);
            if !always_content.is_empty() {
                parts.push(format!("# Active Skills\n\n{always_content}"));
            }
        }

        // 5) Skills summary (XML catalogue — agent uses read_file for on-demand loading)
        let skills_summary = self.skills.build_skills_summary();
        if !skills_summary.is_empty() {
            parts.push(format!(
                "# Skills\n\n\
                 The following skills extend your capabilities. \
                 To use a skill, read its SKILL.md file using the `read_file` tool.\n\
                 Skills with available=\"false\" need dependencies installed first.\n\n\
                 {skills_summary}"
            ));
        }

        parts.join("\n\n---\n\n")
    }

    /// Core identity block.
    fn build_identity(&self) -> String {
        let now = Utc::now().format("%Y-%m-%d %H:%M:%S UTC");
        let os = std::env::consts::OS;
        let arch = std::env::consts::ARCH;
        let workspace = self.workspace.display();
        let memory_file = self.memory.memory_file().display();
        let today = Utc::now().format("%Y-%m-%d");

        format!(
            "# Identity\n\n\
             You are **{name}**, an AI assistant.\n\n\
             - **Date/time**: {now}\n\
             - **Runtime**: Rust on {os}/{arch}\n\
             - **Workspace**: `{workspace}`\n\n\
             You have access to tools. Use them when needed to answer questions, \
             read/write files, run commands, search the web, and more.\n\
             Always prefer using tools over guessing. \
             Be concise and helpful.\n\n\
             ## Memory\n\n\
             When you learn something important about the user or the project, \
             persist it by writing to `{memory_file}` using the `write_file` or `edit_file` tool.\n\
             For daily notes, write to `{workspace}/memory/{today}.md`.",
            name = self.agent_name,
        )
    }

    /// Render the task list and tool-action log as a factual recap block,
    /// folded into the system prompt rather than replayed as fake turns.
    fn build_structured_recap(structured: &StructuredContext) -> Option<String> {
        let mut section = String::new();

        if !structured.task_list.is_empty() {
            section.push_str("## Current Task List\n\n");
            for item in &structured.task_list {
                let marker = match item.status {
                    TaskStatus::Pending => "[ ]",
                    TaskStatus::InProgress => "[~]",
                    TaskStatus::Completed => "[x]",
                };
                section.push_str(&format!("- {marker} {}\n", item.task));
            }
        }

        if !structured.tool_log.is_empty() {
            if !section.is_empty() {
                section.push('\n');
            }
            section.push_str("## Tool Execution History\n\n");
            for action in &structured.tool_log {
                section.push_str(&format!(
                    "- `{}`({}) → {}\n",
                    action.tool, action.args_summary, action.outcome
                ));
            }
        }

        if section.is_empty() {
            None
        } else {
            Some(section.trim_end().to_string())
        }
    }

    // ────────────── Message building ──────────────

    /// Build the full message list for an LLM call from the structured
    /// context rather than the raw transcript.
    ///
    /// 1. System prompt (identity/bootstrap/memory/skills, then retrieved
    ///    memories, the task-list/tool-log recap, and session identifiers)
    /// 2. `structured.recent_pairs` replayed as real user/assistant turns
    /// 3. Current user message
    #[allow(clippy::too_many_arguments)]
    pub fn build_messages(
        &self,
        structured: &StructuredContext,
        retrieved_memories: Option<&str>,
        user_text: &str,
        media: &[String],
        channel: &str,
        chat_id: &str,
    ) -> Vec<Message> {
        let mut messages = Vec::new();

        let mut system = self.build_system_prompt();
        if let Some(retrieved) = retrieved_memories {
            if !retrieved.trim().is_empty() {
                system.push_str("\n\n---\n\n## Retrieved Memories\n\n");
                system.push_str(retrieved);
            }
        }
        if let Some(recap) = Self::build_structured_recap(structured) {
            system.push_str("\n\n---\n\n");
            system.push_str(&recap);
        }
        system.push_str(&format!(
            "\n\n---\n\n## Current Session\nChannel: {channel}\nChat ID: {chat_id}"
        ));
        messages.push(Message::system(system));

        // Recent pairs, replayed as real conversation turns.
        for pair in &structured.recent_pairs {
            messages.push(match pair.role {
                "user" => Message::user(&pair.content),
                _ => Message::assistant(&pair.content),
            });
        }

        // Current user message
        if media.is_empty() {
            messages.push(Message::user(user_text));
        } else {
            messages.push(build_multimodal_user_message(user_text, media));
        }

        messages
    }

    /// Add a tool result to the message list (convenience wrapper).
    pub fn add_tool_result(messages: &mut Vec<Message>, tool_call_id: &str, result: &str) {
        messages.push(Message::tool_result(tool_call_id, result));
    }

    /// Add an assistant message (with optional tool calls and reasoning
    /// content) to the message list. `content` is always preserved
    /// alongside `tool_calls` — a response can carry both in the same turn.
    pub fn add_assistant_message(
        messages: &mut Vec<Message>,
        content: Option<String>,
        tool_calls: Vec<oxibot_core::types::ToolCall>,
        reasoning_content: Option<String>,
    ) {
        let tool_calls = if tool_calls.is_empty() { None } else { Some(tool_calls) };
        messages.push(Message::assistant_full(content, tool_calls, reasoning_content));
    }
}

// ─────────────────────────────────────────────
// Multimodal helpers
// ─────────────────────────────────────────────

/// Build a user message with base64-encoded images.
///
/// A media path is inlined only if it exists, is a regular file, and its
/// guessed MIME type begins with `image/`. Audio files are skipped — their
/// transcription is already in the text content.
fn build_multimodal_user_message(text: &str, media_paths: &[String]) -> Message {
    let mut parts = Vec::new();

    for path in media_paths {
        if is_audio_extension(path) {
            continue;
        }
        let meta = match std::fs::metadata(path) {
            Ok(m) if m.is_file() => m,
            _ => continue,
        };
        let _ = meta;
        let mime = guess_mime(path);
        if !mime.starts_with("image/") {
            continue;
        }
        if let Ok(data) = std::fs::read(path) {
            let b64 = BASE64.encode(&data);
            parts.push(ContentPart::ImageUrl {
                image_url: ImageUrl {
                    url: format!("data:{mime};base64,{b64}"),
                    detail: None,
                },
            });
        }
    }

    parts.push(ContentPart::Text {
        text: text.to_string(),
    });

    Message::user_parts(parts)
}

/// Check if a file path has an audio extension.
fn is_audio_extension(path: &str) -> bool {
    let lower = path.to_lowercase();
    lower.ends_with(".ogg")
        || lower.ends_with(".oga")
        || lower.ends_with(".opus")
        || lower.ends_with(".mp3")
        || lower.ends_with(".m4a")
        || lower.ends_with(".wav")
        || lower.ends_with(".flac")
        || lower.ends_with(".aac")
        || lower.ends_with(".wma")
        || lower.ends_with(".webm")
}

/// Simple MIME guesser based on extension.
fn guess_mime(path: &str) -> &str {
    let lower = path.to_lowercase();
    if lower.ends_with(".png") {
        "image/png"
    } else if lower.ends_with(".gif") {
        "image/gif"
    } else if lower.ends_with(".webp") {
        "image/webp"
    } else if lower.ends_with(".svg") {
        "image/svg+xml"
    } else if lower.ends_with(".jpg") || lower.ends_with(".jpeg") {
        "image/jpeg"
    } else {
        "application/octet-stream"
    }
}
