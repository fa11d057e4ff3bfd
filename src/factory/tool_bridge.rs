//! Tool-call execution bridge (spec §4.4): turns an agent's `bash` /
//! `read_file` / `write_file` calls into `SandboxAdapter` operations and
//! structured `Event`s, truncating command output before it goes back to
//! the model.
//!
//! The match-table shape of `infer_language` follows `stream::tool_emoji`'s
//! match-by-name table; output truncation generalizes the teacher's
//! `truncate_str`/`truncate_thinking` helpers to a single, larger,
//! named limit.

use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Instant;

use anyhow::Result;

use super::models::{Event, EventBody, Severity};
use super::sandbox::SandboxAdapter;

/// Output longer than this is truncated before being shown to the model
/// or persisted in a `command` event, per spec §4.4.
pub const DISPLAY_LIMIT: usize = 10_240;

const GUIDANCE_AFTER_CONSECUTIVE_FAILURES: u32 = 3;

#[derive(Debug, Clone)]
pub enum ToolCall {
    Bash { tool_use_id: String, command: String },
    ReadFile { tool_use_id: String, path: String },
    WriteFile { tool_use_id: String, path: String, content: String },
}

#[derive(Debug, Clone)]
pub struct ToolResult {
    pub tool_use_id: String,
    pub success: bool,
    pub output: String,
    /// Set once the 3-consecutive-failure threshold is crossed during
    /// Planning; callers append this to the next prompt.
    pub guidance: Option<&'static str>,
}

const FORMAT_GUIDANCE: &str =
    "Tool calls must be well-formed: `bash` needs a `command` string, `write_file` needs \
     `path` and `content` strings. Re-check the last call's arguments and retry.";

/// Drives tool-call execution for one build. Tracks consecutive
/// validation failures so Planning-phase agents get corrective guidance
/// after repeated malformed calls, mirroring the retry/backoff counters
/// `planner::Planner::create_plan` keeps elsewhere in the teacher.
pub struct ToolBridge {
    sandbox: std::sync::Arc<dyn SandboxAdapter>,
    consecutive_failures: AtomicU32,
}

impl ToolBridge {
    pub fn new(sandbox: std::sync::Arc<dyn SandboxAdapter>) -> Self {
        Self {
            sandbox,
            consecutive_failures: AtomicU32::new(0),
        }
    }

    /// Execute one tool call, returning both the wire-level `ToolResult`
    /// and the `Event`s it produced (in emission order: `tool_start`,
    /// then any `command`/`file_*`, then `tool_end`).
    pub async fn execute(&self, build_id: uuid::Uuid, call: ToolCall) -> (ToolResult, Vec<Event>) {
        match call {
            ToolCall::Bash { tool_use_id, command } => {
                self.execute_bash(build_id, tool_use_id, command).await
            }
            ToolCall::ReadFile { tool_use_id, path } => {
                self.execute_read_file(build_id, tool_use_id, path).await
            }
            ToolCall::WriteFile { tool_use_id, path, content } => {
                self.execute_write_file(build_id, tool_use_id, path, content).await
            }
        }
    }

    async fn execute_bash(
        &self,
        build_id: uuid::Uuid,
        tool_use_id: String,
        command: String,
    ) -> (ToolResult, Vec<Event>) {
        let mut events = vec![Event::new(
            build_id,
            EventBody::ToolStart {
                tool_use_id: tool_use_id.clone(),
                name: "bash".to_string(),
            },
        )];

        let started = Instant::now();
        let outcome = self.sandbox.exec(&command).await;
        let duration_ms = started.elapsed().as_millis() as u64;

        let result = match outcome {
            Ok(output) => {
                self.record_success();
                let success = output.exit_code == 0;
                events.push(Event::new(
                    build_id,
                    EventBody::Command {
                        tool_use_id: tool_use_id.clone(),
                        command: command.clone(),
                        exit_code: output.exit_code,
                        stdout: truncate(&output.stdout),
                        stderr: truncate(&output.stderr),
                        duration_ms,
                    },
                ));
                events.push(Event::new(
                    build_id,
                    EventBody::ToolEnd {
                        tool_use_id: tool_use_id.clone(),
                        success,
                    },
                ));
                ToolResult {
                    tool_use_id,
                    success,
                    output: format!("{}\n{}", truncate(&output.stdout), truncate(&output.stderr)),
                    guidance: None,
                }
            }
            Err(err) => self.failure_result(build_id, &mut events, tool_use_id, err),
        };

        (result, events)
    }

    async fn execute_read_file(
        &self,
        build_id: uuid::Uuid,
        tool_use_id: String,
        path: String,
    ) -> (ToolResult, Vec<Event>) {
        let mut events = vec![Event::new(
            build_id,
            EventBody::ToolStart {
                tool_use_id: tool_use_id.clone(),
                name: "read_file".to_string(),
            },
        )];

        match self.sandbox.read_file(&path).await {
            Ok(Some(bytes)) => {
                self.record_success();
                let text = String::from_utf8_lossy(&bytes).to_string();
                events.push(Event::new(
                    build_id,
                    EventBody::ToolEnd {
                        tool_use_id: tool_use_id.clone(),
                        success: true,
                    },
                ));
                let result = ToolResult {
                    tool_use_id,
                    success: true,
                    output: truncate(&text),
                    guidance: None,
                };
                (result, events)
            }
            Ok(None) => {
                self.record_success();
                events.push(Event::new(
                    build_id,
                    EventBody::ToolEnd {
                        tool_use_id: tool_use_id.clone(),
                        success: false,
                    },
                ));
                (
                    ToolResult {
                        tool_use_id,
                        success: false,
                        output: format!("file not found: {path}"),
                        guidance: None,
                    },
                    events,
                )
            }
            Err(err) => {
                let result = self.failure_result(build_id, &mut events, tool_use_id, err);
                (result, events)
            }
        }
    }

    async fn execute_write_file(
        &self,
        build_id: uuid::Uuid,
        tool_use_id: String,
        path: String,
        content: String,
    ) -> (ToolResult, Vec<Event>) {
        let mut events = vec![Event::new(
            build_id,
            EventBody::ToolStart {
                tool_use_id: tool_use_id.clone(),
                name: "write_file".to_string(),
            },
        )];

        let existed_before = matches!(self.sandbox.read_file(&path).await, Ok(Some(_)));

        match self.sandbox.write_file(&path, content.as_bytes()).await {
            Ok(()) => {
                self.record_success();
                let bytes = content.len();
                let lines = content.matches('\n').count() + 1;
                let language = infer_language(&path);

                let body = if existed_before {
                    EventBody::FileModified {
                        path: path.clone(),
                        bytes,
                        language: language.to_string(),
                        lines,
                    }
                } else {
                    EventBody::FileCreated {
                        path: path.clone(),
                        bytes,
                        language: language.to_string(),
                        lines,
                    }
                };
                events.push(Event::new(build_id, body));

                if path.ends_with("feature_list.json") {
                    match super::manifest::FeatureManifest::parse(&content) {
                        Ok(manifest) => {
                            let (completed, total) = manifest.progress();
                            events.push(Event::new(
                                build_id,
                                EventBody::FeatureList {
                                    features: manifest.features,
                                    completed,
                                    total,
                                },
                            ));
                        }
                        Err(err) => {
                            tracing::debug!(error = %err, "feature_list.json write did not parse as a manifest");
                        }
                    }
                }

                events.push(Event::new(
                    build_id,
                    EventBody::ToolEnd {
                        tool_use_id: tool_use_id.clone(),
                        success: true,
                    },
                ));
                (
                    ToolResult {
                        tool_use_id,
                        success: true,
                        output: format!("wrote {bytes} bytes to {path}"),
                        guidance: None,
                    },
                    events,
                )
            }
            Err(err) => {
                let result = self.failure_result(build_id, &mut events, tool_use_id, err);
                (result, events)
            }
        }
    }

    fn failure_result(
        &self,
        build_id: uuid::Uuid,
        events: &mut Vec<Event>,
        tool_use_id: String,
        err: anyhow::Error,
    ) -> ToolResult {
        let failures = self.record_failure();
        events.push(Event::new(
            build_id,
            EventBody::Error {
                severity: Severity::Error,
                message: format!("{err:#}"),
                recoverable: true,
            },
        ));
        events.push(Event::new(
            build_id,
            EventBody::ToolEnd {
                tool_use_id: tool_use_id.clone(),
                success: false,
            },
        ));

        let guidance = if failures >= GUIDANCE_AFTER_CONSECUTIVE_FAILURES {
            Some(FORMAT_GUIDANCE)
        } else {
            None
        };

        ToolResult {
            tool_use_id,
            success: false,
            output: format!("{err:#}"),
            guidance,
        }
    }

    fn record_success(&self) {
        self.consecutive_failures.store(0, Ordering::SeqCst);
    }

    fn record_failure(&self) -> u32 {
        self.consecutive_failures.fetch_add(1, Ordering::SeqCst) + 1
    }
}

fn truncate(text: &str) -> String {
    if text.len() <= DISPLAY_LIMIT {
        text.to_string()
    } else {
        let mut end = DISPLAY_LIMIT;
        while !text.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}... [truncated {} bytes]", &text[..end], text.len() - end)
    }
}

/// Infer a human-readable language label from a file extension, for
/// `file_created`/`file_modified` events. Unknown extensions fall back to
/// "text", matching the teacher's catch-all arm convention in
/// `stream::tool_emoji`.
pub fn infer_language(path: &str) -> &'static str {
    let ext = std::path::Path::new(path)
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("")
        .to_lowercase();

    match ext.as_str() {
        "rs" => "rust",
        "ts" | "tsx" => "typescript",
        "js" | "jsx" | "mjs" => "javascript",
        "py" => "python",
        "go" => "go",
        "java" => "java",
        "rb" => "ruby",
        "c" => "c",
        "h" => "c-header",
        "cpp" | "cc" | "cxx" => "cpp",
        "hpp" => "cpp-header",
        "cs" => "csharp",
        "swift" => "swift",
        "kt" | "kts" => "kotlin",
        "php" => "php",
        "sh" | "bash" => "shell",
        "sql" => "sql",
        "html" => "html",
        "css" | "scss" | "sass" => "css",
        "json" => "json",
        "yaml" | "yml" => "yaml",
        "toml" => "toml",
        "md" | "markdown" => "markdown",
        "dockerfile" => "dockerfile",
        _ => "text",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::factory::sandbox::ExecOutput;
    use std::sync::Arc;

    struct FakeSandbox {
        files: tokio::sync::Mutex<std::collections::HashMap<String, Vec<u8>>>,
        exec_result: Result<ExecOutput>,
    }

    #[async_trait::async_trait]
    impl SandboxAdapter for FakeSandbox {
        async fn exec(&self, _command: &str) -> Result<ExecOutput> {
            match &self.exec_result {
                Ok(output) => Ok(output.clone()),
                Err(_) => anyhow::bail!("exec failed"),
            }
        }

        async fn read_file(&self, path: &str) -> Result<Option<Vec<u8>>> {
            Ok(self.files.lock().await.get(path).cloned())
        }

        async fn write_file(&self, path: &str, content: &[u8]) -> Result<()> {
            self.files.lock().await.insert(path.to_string(), content.to_vec());
            Ok(())
        }

        async fn download_dir(&self, _path: &str) -> Result<Vec<u8>> {
            Ok(Vec::new())
        }

        async fn destroy(&self) -> Result<()> {
            Ok(())
        }

        async fn set_timeout(&self, _seconds: u64) {}

        fn get_host(&self) -> Option<String> {
            None
        }
    }

    fn fake_sandbox(exit_code: i32) -> Arc<FakeSandbox> {
        Arc::new(FakeSandbox {
            files: tokio::sync::Mutex::new(std::collections::HashMap::new()),
            exec_result: Ok(ExecOutput {
                exit_code,
                stdout: "ok".to_string(),
                stderr: String::new(),
            }),
        })
    }

    #[tokio::test]
    async fn bash_success_emits_command_and_tool_end() {
        let bridge = ToolBridge::new(fake_sandbox(0));
        let build_id = uuid::Uuid::new_v4();
        let (result, events) = bridge
            .execute(
                build_id,
                ToolCall::Bash { tool_use_id: "t1".into(), command: "echo ok".into() },
            )
            .await;

        assert!(result.success);
        assert_eq!(events.len(), 3);
        assert!(matches!(events[1].body, EventBody::Command { exit_code: 0, .. }));
    }

    #[tokio::test]
    async fn write_file_then_modify_emits_created_then_modified() {
        let bridge = ToolBridge::new(fake_sandbox(0));
        let build_id = uuid::Uuid::new_v4();

        let (r1, e1) = bridge
            .execute(
                build_id,
                ToolCall::WriteFile { tool_use_id: "t1".into(), path: "src/main.rs".into(), content: "fn main() {}".into() },
            )
            .await;
        assert!(r1.success);
        assert!(matches!(e1[1].body, EventBody::FileCreated { .. }));

        let (r2, e2) = bridge
            .execute(
                build_id,
                ToolCall::WriteFile { tool_use_id: "t2".into(), path: "src/main.rs".into(), content: "fn main() {\n}".into() },
            )
            .await;
        assert!(r2.success);
        assert!(matches!(e2[1].body, EventBody::FileModified { .. }));
    }

    #[tokio::test]
    async fn writing_feature_list_json_emits_feature_list_event() {
        let bridge = ToolBridge::new(fake_sandbox(0));
        let build_id = uuid::Uuid::new_v4();
        let content = r#"[{"category":"functional","description":"Login","steps":[]}]"#;

        let (_, events) = bridge
            .execute(
                build_id,
                ToolCall::WriteFile { tool_use_id: "t1".into(), path: "feature_list.json".into(), content: content.into() },
            )
            .await;

        assert!(events.iter().any(|e| matches!(e.body, EventBody::FeatureList { .. })));
    }

    #[tokio::test]
    async fn three_consecutive_failures_trigger_guidance() {
        let sandbox = Arc::new(FakeSandbox {
            files: tokio::sync::Mutex::new(std::collections::HashMap::new()),
            exec_result: Err(anyhow::anyhow!("boom")),
        });
        let bridge = ToolBridge::new(sandbox);
        let build_id = uuid::Uuid::new_v4();

        let mut last_guidance = None;
        for i in 0..3 {
            let (result, _) = bridge
                .execute(
                    build_id,
                    ToolCall::Bash { tool_use_id: format!("t{i}"), command: "x".into() },
                )
                .await;
            last_guidance = result.guidance;
        }
        assert!(last_guidance.is_some());
    }

    #[test]
    fn infer_language_matches_known_extensions() {
        assert_eq!(infer_language("src/main.rs"), "rust");
        assert_eq!(infer_language("app.tsx"), "typescript");
        assert_eq!(infer_language("README"), "text");
    }

    #[test]
    fn truncate_leaves_short_strings_untouched() {
        assert_eq!(truncate("hello"), "hello");
    }

    #[test]
    fn truncate_clips_long_strings() {
        let long = "a".repeat(DISPLAY_LIMIT + 100);
        let truncated = truncate(&long);
        assert!(truncated.len() < long.len());
        assert!(truncated.contains("truncated"));
    }
}
