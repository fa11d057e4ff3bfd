//! LLM interface: subprocess wrapper, conversation/message-trimming
//! policy, context-overflow/rate-limit classification, and sentinel
//! detection (spec §4.5/§4.6/§4.7, §6).
//!
//! `ClaudeProcess` directly reuses the teacher's subprocess-streaming
//! idiom from `agent_executor::run_task` (`claude --print --output-format
//! stream-json`, `BufReader::lines()`), parsing each line with
//! `stream::StreamEvent` instead of the teacher's `OutputParser`.
//! `ConversationDriver` generalizes `planner::Planner`'s iterate-and-retry
//! loop into a reusable message-history manager shared by the Planning,
//! Sequential, and Parallel phases.

use std::path::Path;
use std::process::Stdio;
use std::sync::atomic::{AtomicU32, Ordering};

use anyhow::{Context, Result};
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;

use super::stream::{ContentBlock, StreamEvent};
use super::tool_bridge::ToolCall;

const MAX_MESSAGES: usize = 100;
const KEEP_TAIL: usize = 10;
pub const MAX_CONTEXT_RESETS: u32 = 10;
const RATE_LIMIT_BACKOFF: std::time::Duration = std::time::Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

impl Message {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }
}

/// One turn's parsed result from the LLM stream.
#[derive(Debug, Clone, Default)]
pub struct TurnOutput {
    pub text: String,
    pub tool_calls: Vec<ToolCall>,
    pub stop_reason: Option<String>,
    pub is_error: bool,
    pub error_text: String,
}

impl TurnOutput {
    pub fn has_pending_tool_calls(&self) -> bool {
        !self.tool_calls.is_empty()
    }
}

/// Classification of an LLM-call failure, per spec §6/§7.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LlmErrorClass {
    ContextOverflow,
    RateLimit,
    Other,
}

/// Distinguish context-overflow / rate-limit / other from an error
/// message, per the LLM interface's error taxonomy (§6).
pub fn classify_llm_error(message: &str) -> LlmErrorClass {
    let lower = message.to_lowercase();
    if lower.contains("prompt is too long")
        || lower.contains("context_length")
        || lower.contains("context length")
        || lower.contains("maximum context")
    {
        LlmErrorClass::ContextOverflow
    } else if lower.contains("rate_limit") || lower.contains("rate limit") || lower.contains("429")
    {
        LlmErrorClass::RateLimit
    } else {
        LlmErrorClass::Other
    }
}

/// Bare-token sentinel detection for the Sequential/Parallel executors,
/// grounded in `signals::parser`'s `LazyLock<Regex>` constant-table idiom
/// but adapted to unwrapped tokens instead of `<tag>` XML framing.
pub mod sentinel {
    use regex::Regex;
    use std::sync::LazyLock;

    static BLOCKING_COMPLETE: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r"\bBLOCKING_COMPLETE\b").unwrap());
    static FEATURE_COMPLETE: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r"\bFEATURE_COMPLETE\b").unwrap());

    pub fn contains_blocking_complete(text: &str) -> bool {
        BLOCKING_COMPLETE.is_match(text)
    }

    pub fn contains_feature_complete(text: &str) -> bool {
        FEATURE_COMPLETE.is_match(text)
    }
}

/// Shared context-reset/rate-limit-backoff and message-trimming logic for
/// Planning and Building, per SPEC_FULL.md §4.5's "implemented once"
/// instruction.
pub struct ConversationDriver {
    messages: Vec<Message>,
    resets: AtomicU32,
}

impl ConversationDriver {
    pub fn new(system_prompt: impl Into<String>) -> Self {
        Self {
            messages: vec![Message::new(Role::System, system_prompt)],
            resets: AtomicU32::new(0),
        }
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn push(&mut self, message: Message) {
        self.messages.push(message);
        self.trim();
    }

    /// Message-trimming policy (spec §4.6): if history exceeds 100
    /// messages, keep the first, inject a trim-notice, keep the last 10.
    fn trim(&mut self) {
        if self.messages.len() <= MAX_MESSAGES {
            return;
        }
        let first = self.messages.first().cloned().expect("non-empty");
        let tail_start = self.messages.len() - KEEP_TAIL;
        let tail = self.messages[tail_start..].to_vec();
        let notice = Message::new(
            Role::System,
            format!(
                "[conversation trimmed: {} earlier messages omitted]",
                self.messages.len() - 1 - tail.len()
            ),
        );
        self.messages = std::iter::once(first)
            .chain(std::iter::once(notice))
            .chain(tail)
            .collect();
    }

    pub fn reset_count(&self) -> u32 {
        self.resets.load(Ordering::SeqCst)
    }

    /// Render the full message history into one prompt string. Each
    /// `ClaudeProcess::run_turn` call is a fresh subprocess with no
    /// server-side session, so the whole conversation is re-sent on every
    /// turn; this is that rendering.
    pub fn render_prompt(&self) -> String {
        self.messages
            .iter()
            .map(|m| format!("[{:?}]\n{}", m.role, m.content))
            .collect::<Vec<_>>()
            .join("\n\n")
    }

    /// Discard the current conversation and rebuild a summary prompt
    /// containing `(completed, total)` and the next ten unfinished
    /// feature descriptions, per spec §4.5's context-length recovery.
    /// Returns `Err` once the 11th reset would be triggered.
    pub fn reset_with_summary(
        &mut self,
        system_prompt: impl Into<String>,
        completed: u32,
        total: u32,
        next_unfinished: &[String],
    ) -> Result<u32> {
        let prior = self.resets.fetch_add(1, Ordering::SeqCst) + 1;
        if prior > MAX_CONTEXT_RESETS {
            anyhow::bail!(
                "context reset cap ({}) exceeded after {} resets",
                MAX_CONTEXT_RESETS,
                prior
            );
        }
        let summary = format!(
            "Progress so far: {completed}/{total} features complete.\n\
             Next unfinished features:\n{}",
            next_unfinished
                .iter()
                .take(10)
                .map(|d| format!("- {d}"))
                .collect::<Vec<_>>()
                .join("\n")
        );
        self.messages = vec![
            Message::new(Role::System, system_prompt),
            Message::new(Role::User, summary),
        ];
        Ok(prior)
    }
}

/// Thin subprocess wrapper over `claude --print --output-format
/// stream-json`, directly reusing the teacher's subprocess-streaming
/// idiom.
pub struct ClaudeProcess;

impl ClaudeProcess {
    /// Run one turn: spawn the CLI with `prompt`, parse the stream-json
    /// lines it writes to stdout, and collect text/tool_use blocks.
    pub async fn run_turn(working_dir: &Path, prompt: &str) -> Result<TurnOutput> {
        let claude_cmd = std::env::var("CLAUDE_CMD").unwrap_or_else(|_| "claude".to_string());

        let mut child = Command::new(&claude_cmd)
            .args([
                "--print",
                "--output-format",
                "stream-json",
                "-p",
                prompt,
            ])
            .current_dir(working_dir)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .context("failed to spawn claude process")?;

        let stdout = child.stdout.take().context("claude child has no stdout")?;
        let mut lines = BufReader::new(stdout).lines();

        let mut output = TurnOutput::default();
        while let Some(line) = lines.next_line().await.context("failed to read claude stdout")? {
            if line.trim().is_empty() {
                continue;
            }
            let event: StreamEvent = match serde_json::from_str(&line) {
                Ok(event) => event,
                Err(_) => continue,
            };
            match event {
                StreamEvent::Assistant { message, .. } => {
                    for block in message.content {
                        match block {
                            ContentBlock::Text { text } => {
                                output.text.push_str(&text);
                                output.text.push('\n');
                            }
                            ContentBlock::ToolUse { name, input, id } => {
                                if let Some(call) = tool_call_from_use(&name, &input, &id) {
                                    output.tool_calls.push(call);
                                }
                            }
                        }
                    }
                }
                StreamEvent::Result {
                    subtype,
                    result,
                    is_error,
                } => {
                    output.stop_reason = Some(subtype);
                    output.is_error = is_error;
                    if is_error {
                        output.error_text = result.unwrap_or_default();
                    }
                }
                StreamEvent::User { .. } | StreamEvent::System { .. } => {}
            }
        }

        let status = child.wait().await.context("failed to wait on claude process")?;
        if !status.success() && !output.is_error {
            let mut stderr_buf = String::new();
            if let Some(mut stderr) = child.stderr.take() {
                use tokio::io::AsyncReadExt;
                let _ = stderr.read_to_string(&mut stderr_buf).await;
            }
            output.is_error = true;
            output.error_text = stderr_buf;
        }

        Ok(output)
    }

    /// Back off 60s for a rate-limit error without counting against the
    /// context-reset cap (spec §4.5).
    pub async fn backoff_rate_limit() {
        tokio::time::sleep(RATE_LIMIT_BACKOFF).await;
    }
}

/// Map a locally-known tool name to a `ToolCall`. Unknown tool names
/// (server-tool pass-through, e.g. web search) return `None`; the caller
/// must preserve those blocks verbatim in conversation history rather
/// than dispatching them, per spec §9.
fn tool_call_from_use(name: &str, input: &Value, id: &str) -> Option<ToolCall> {
    match name {
        "bash" | "Bash" => Some(ToolCall::Bash {
            tool_use_id: id.to_string(),
            command: input.get("command")?.as_str()?.to_string(),
        }),
        "read_file" | "Read" => Some(ToolCall::ReadFile {
            tool_use_id: id.to_string(),
            path: input.get("path").or_else(|| input.get("file_path"))?.as_str()?.to_string(),
        }),
        "write_file" | "Write" => Some(ToolCall::WriteFile {
            tool_use_id: id.to_string(),
            path: input.get("path").or_else(|| input.get("file_path"))?.as_str()?.to_string(),
            content: input.get("content")?.as_str()?.to_string(),
        }),
        _ => None,
    }
}
