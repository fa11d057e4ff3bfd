//! Parallel Executor (spec §4.7): wave-schedules the non-blocking
//! features once the Sequential Executor's blocking slice has passed,
//! running up to `MAX_PARALLEL_AGENTS` independent subagents per wave.
//!
//! `ready_features` generalizes `dag::scheduler::DagScheduler::
//! compute_waves`'s ready-set computation from phase numbers to feature
//! descriptions. The concurrent-launch-then-join loop in `run_wave`
//! follows `pipeline::execute_agent_team`'s per-task `tokio::spawn`/
//! `handle.await` shape.

use std::collections::HashSet;
use std::sync::Arc;

use anyhow::Result;

use super::super::config::MAX_PARALLEL_AGENTS;
use super::super::context::BuildContext;
use super::super::llm::{
    ClaudeProcess, ConversationDriver, LlmErrorClass, Message, Role, classify_llm_error, sentinel,
};
use super::super::manifest::ManifestWriter;
use super::super::models::{BusItem, EventBody, Feature, LogLevel};
use super::super::tool_bridge::ToolBridge;

const MAX_FEATURE_ITERATIONS: u32 = 20;

/// Compute the set of non-blocking, not-yet-passing features whose
/// `dependsOn` entries are all satisfied by already-passing features. An
/// empty result while features remain signals a dependency deadlock (a
/// cycle the manifest's DAG validation should already have rejected, but
/// every remaining feature is promoted anyway so one remaining bad edge
/// can't stall the whole build).
fn ready_features(remaining: &[Feature], passed: &HashSet<String>) -> Vec<Feature> {
    let ready: Vec<Feature> = remaining
        .iter()
        .filter(|f| f.depends_on.iter().all(|dep| passed.contains(dep)))
        .cloned()
        .collect();
    if ready.is_empty() { remaining.to_vec() } else { ready }
}

/// Drive every non-blocking feature in `manifest` to `passes = true`,
/// wave by wave, retrying a wave's failures sequentially once before
/// moving on.
pub async fn run(ctx: Arc<BuildContext>, tool_bridge: Arc<ToolBridge>, manifest: Arc<ManifestWriter>) -> Result<()> {
    let mut last_remaining = usize::MAX;

    loop {
        if ctx.control.current() == super::super::context::ControlSignal::Cancelled {
            return Ok(());
        }

        let snapshot = manifest.snapshot().await?;
        let remaining: Vec<Feature> = snapshot.non_blocking().filter(|f| !f.passes).cloned().collect();
        if remaining.is_empty() {
            return Ok(());
        }
        if remaining.len() >= last_remaining {
            ctx.log(
                LogLevel::Warn,
                format!(
                    "parallel executor made no progress on {} remaining non-blocking features; stopping",
                    remaining.len()
                ),
            )
            .await;
            return Ok(());
        }
        last_remaining = remaining.len();

        let passed: HashSet<String> = snapshot
            .non_blocking()
            .filter(|f| f.passes)
            .map(|f| f.description.clone())
            .collect();
        let wave = ready_features(&remaining, &passed);

        run_wave(&ctx, &tool_bridge, &manifest, &wave, MAX_PARALLEL_AGENTS).await;

        let after = manifest.snapshot().await?;
        let still_failing: Vec<Feature> = wave
            .iter()
            .filter(|f| !after.non_blocking().any(|g| g.description == f.description && g.passes))
            .cloned()
            .collect();
        if !still_failing.is_empty() {
            run_wave(&ctx, &tool_bridge, &manifest, &still_failing, 1).await;
        }
    }
}

/// Launch `wave` in chunks of at most `concurrency` concurrent subagents,
/// awaiting each chunk before starting the next.
async fn run_wave(
    ctx: &Arc<BuildContext>,
    tool_bridge: &Arc<ToolBridge>,
    manifest: &Arc<ManifestWriter>,
    wave: &[Feature],
    concurrency: usize,
) {
    for chunk in wave.chunks(concurrency.max(1)) {
        let mut handles = Vec::with_capacity(chunk.len());
        for feature in chunk {
            let ctx = Arc::clone(ctx);
            let tool_bridge = Arc::clone(tool_bridge);
            let manifest = Arc::clone(manifest);
            let feature = feature.clone();
            handles.push(tokio::spawn(async move {
                run_feature(&ctx, &tool_bridge, &manifest, &feature).await
            }));
        }
        for handle in handles {
            match handle.await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => ctx.log(LogLevel::Error, format!("feature agent failed: {err:#}")).await,
                Err(join_err) => ctx.log(LogLevel::Error, format!("feature agent panicked: {join_err}")).await,
            }
        }
    }
}

/// Run one subagent to completion on a single feature: drives its own
/// `ConversationDriver` to a `FEATURE_COMPLETE` sentinel or gives up after
/// `MAX_FEATURE_ITERATIONS`, then records the result in the manifest.
async fn run_feature(
    ctx: &BuildContext,
    tool_bridge: &ToolBridge,
    manifest: &ManifestWriter,
    feature: &Feature,
) -> Result<()> {
    let subagent = format!("agent-{}", uuid::Uuid::new_v4().simple());
    ctx.emit(EventBody::FeatureStart {
        description: feature.description.clone(),
        subagent: Some(subagent.clone()),
    })
    .await;

    let steps = feature.steps.iter().map(|s| format!("- {s}")).collect::<Vec<_>>().join("\n");
    let system_prompt = format!(
        "You are one of several agents implementing a web application in parallel. Your feature: \
         \"{}\".\nSteps:\n{steps}\nUse the bash/read_file/write_file tools. When the feature is fully \
         implemented and verified, reply with the single token FEATURE_COMPLETE and stop.",
        feature.description,
    );
    let mut driver = ConversationDriver::new(system_prompt.clone());
    driver.push(Message::new(Role::User, format!("Begin implementing: {}", feature.description)));

    let mut passed = false;
    for _iteration in 0..MAX_FEATURE_ITERATIONS {
        let prompt = driver.render_prompt();
        let turn = ClaudeProcess::run_turn(&ctx.local_dir, &prompt).await?;

        if turn.is_error {
            match classify_llm_error(&turn.error_text) {
                LlmErrorClass::RateLimit => {
                    ClaudeProcess::backoff_rate_limit().await;
                    continue;
                }
                LlmErrorClass::ContextOverflow => {
                    driver
                        .reset_with_summary(system_prompt.clone(), 0, 1, std::slice::from_ref(&feature.description))?;
                    continue;
                }
                LlmErrorClass::Other => anyhow::bail!("feature agent LLM call failed: {}", turn.error_text),
            }
        }

        if !turn.text.is_empty() {
            if sentinel::contains_feature_complete(&turn.text) {
                passed = true;
            }
            driver.push(Message::new(Role::Assistant, turn.text.clone()));
        }

        for call in turn.tool_calls {
            let (result, events) = tool_bridge.execute(ctx.build_id, call).await;
            for event in events {
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

        if passed || ctx.checkpoint().await {
            break;
        }
    }

    let snapshot = manifest.apply(feature.description.clone(), move |f| f.passes = passed).await?;
    ctx.sandbox
        .write_file("feature_list.json", snapshot.to_json_pretty()?.as_bytes())
        .await?;
    let (completed, total) = snapshot.progress();
    ctx.emit(EventBody::FeatureList {
        features: snapshot.features.clone(),
        completed,
        total,
    })
    .await;
    ctx.set_progress(completed, total).await?;
    ctx.emit(EventBody::FeatureEnd {
        description: feature.description.clone(),
        passed,
        subagent: Some(subagent),
    })
    .await;

    if !passed {
        anyhow::bail!(
            "feature '{}' did not reach FEATURE_COMPLETE within {MAX_FEATURE_ITERATIONS} iterations",
            feature.description
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use super::super::super::models::FeatureCategory;

    fn feature(desc: &str, deps: &[&str]) -> Feature {
        Feature {
            category: FeatureCategory::Functional,
            description: desc.to_string(),
            steps: vec![],
            passes: false,
            blocking: false,
            depends_on: deps.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[test]
    fn ready_features_includes_only_satisfied_deps() {
        let remaining = vec![feature("A", &[]), feature("B", &["A"]), feature("C", &["B"])];
        let passed = HashSet::new();
        let ready = ready_features(&remaining, &passed);
        assert_eq!(ready.len(), 1);
        assert_eq!(ready[0].description, "A");
    }

    #[test]
    fn ready_features_advances_as_deps_pass() {
        let remaining = vec![feature("B", &["A"]), feature("C", &["B"])];
        let mut passed = HashSet::new();
        passed.insert("A".to_string());
        let ready = ready_features(&remaining, &passed);
        assert_eq!(ready.len(), 1);
        assert_eq!(ready[0].description, "B");
    }

    #[test]
    fn ready_features_promotes_everything_on_deadlock() {
        let remaining = vec![feature("A", &["Z"]), feature("B", &["Y"])];
        let passed = HashSet::new();
        let ready = ready_features(&remaining, &passed);
        assert_eq!(ready.len(), 2);
    }
}
