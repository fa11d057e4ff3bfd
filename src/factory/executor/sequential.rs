//! Sequential Executor (spec §4.6): drives the blocking features one at a
//! time with the whole manifest visible to the agent, polling the
//! manifest after every tool batch to emit progress.
//!
//! Grounded in `pipeline::execute_pipeline_streaming`'s poll-after-each-
//! batch progress loop, applied here to manifest snapshots instead of
//! stdout lines; the retry/backoff shape comes from `planner::Planner`'s
//! iterate-until-valid loop, generalized via `ConversationDriver`.

use anyhow::{Context, Result, bail};

use super::super::context::BuildContext;
use super::super::llm::{
    ClaudeProcess, ConversationDriver, LlmErrorClass, Message, Role, classify_llm_error, sentinel,
};
use super::super::manifest::ManifestWriter;
use super::super::models::{BusItem, EventBody, LogLevel};
use super::super::tool_bridge::ToolBridge;

const MAX_ITERATIONS: u32 = 200;

const SEQUENTIAL_SYSTEM_PROMPT: &str = r#"You are implementing a web application one blocking
feature at a time, in the order given in feature_list.json. Use the bash/read_file/write_file
tools to write and verify code. When a feature is fully implemented and verified, rewrite
feature_list.json setting that feature's "passes" to true before moving to the next one. Once
every blocking feature passes, reply with the single token BLOCKING_COMPLETE and stop."#;

/// Run the blocking slice of `manifest` to completion (or bail past
/// `MAX_ITERATIONS`). A no-op if every blocking feature already passes.
pub async fn run(ctx: &BuildContext, tool_bridge: &ToolBridge, manifest: &ManifestWriter) -> Result<()> {
    let initial = manifest.snapshot().await?;
    if initial.all_blocking_pass() {
        return Ok(());
    }

    let system_prompt = SEQUENTIAL_SYSTEM_PROMPT.to_string();
    let mut driver = ConversationDriver::new(system_prompt.clone());
    driver.push(Message::new(
        Role::User,
        format!("feature_list.json:\n{}", initial.to_json_pretty()?),
    ));

    for _iteration in 0..MAX_ITERATIONS {
        let prompt = driver.render_prompt();
        let turn = ClaudeProcess::run_turn(&ctx.local_dir, &prompt).await?;

        if turn.is_error {
            match classify_llm_error(&turn.error_text) {
                LlmErrorClass::RateLimit => {
                    ClaudeProcess::backoff_rate_limit().await;
                    continue;
                }
                LlmErrorClass::ContextOverflow => {
                    let snapshot = manifest.snapshot().await?;
                    let (completed, total) = snapshot.progress();
                    let next: Vec<String> = snapshot
                        .blocking()
                        .filter(|f| !f.passes)
                        .map(|f| f.description.clone())
                        .collect();
                    driver
                        .reset_with_summary(system_prompt.clone(), completed, total, &next)
                        .context("sequential executor exceeded the context-reset cap")?;
                    continue;
                }
                LlmErrorClass::Other => bail!("sequential executor LLM call failed: {}", turn.error_text),
            }
        }

        let mut blocking_complete_claimed = false;
        if !turn.text.is_empty() {
            blocking_complete_claimed = sentinel::contains_blocking_complete(&turn.text);
            driver.push(Message::new(Role::Assistant, turn.text.clone()));
        }

        for call in turn.tool_calls {
            let (result, events) = tool_bridge.execute(ctx.build_id, call).await;
            for event in events {
                if let EventBody::FeatureList { ref features, .. } = event.body {
                    manifest
                        .replace(super::super::manifest::FeatureManifest {
                            features: features.clone(),
                        })
                        .await?;
                }
                ctx.bus.publish(BusItem::Event(event.clone()));
                ctx.persistence.push_event(event).await;
            }
            driver.push(Message::new(
                Role::User,
                format!("Tool result for {}: {}", result.tool_use_id, result.output),
            ));
            if let Some(guidance) = result.guidance {
                driver.push(Message::new(Role::User, guidance));
            }
        }

        if ctx.checkpoint().await {
            bail!("sequential executor cancelled");
        }

        let snapshot = manifest.snapshot().await?;
        let (completed, total) = snapshot.progress();
        ctx.set_progress(completed, total).await?;

        if snapshot.all_blocking_pass() {
            return Ok(());
        }
        if blocking_complete_claimed {
            ctx.log(
                LogLevel::Warn,
                "agent signaled BLOCKING_COMPLETE but unfinished blocking features remain; continuing",
            )
            .await;
        }
    }

    bail!("sequential executor did not finish blocking features within {MAX_ITERATIONS} iterations")
}
