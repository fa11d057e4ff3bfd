//! Planning Phase (spec §4.5): turns an `appSpec` into a validated
//! `feature_list.json`, pausing for review gates along the way.
//!
//! `Planner::run` directly generalizes the teacher's `Planner`/
//! `PlanProvider` iterate-and-retry loop; the three-tier JSON recovery it
//! used for `PlanResponse::parse` now lives in `factory::manifest::
//! FeatureManifest::parse` instead, reused as-is rather than duplicated
//! here.

use std::path::Path;
use std::sync::LazyLock;

use anyhow::{Context, Result, bail};
use regex::Regex;

use super::context::BuildContext;
use super::llm::{ClaudeProcess, ConversationDriver, LlmErrorClass, Message, Role, classify_llm_error};
use super::manifest::FeatureManifest;
use super::models::{ComplexityTier, EventBody, Gate};
use super::tool_bridge::{ToolBridge, ToolCall};

const MAX_PLANNING_ITERATIONS: u32 = 10;
const MAX_SUGGESTED_FEATURES: usize = 80;

static UI_INDICATORS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    ["UI", "frontend", "React", "component", "page", "button", "form", "design", "responsive", "CSS"]
        .iter()
        .map(|word| Regex::new(&format!(r"(?i)\b{}\b", regex::escape(word))).unwrap())
        .collect()
});

/// `>= 2` of a fixed indicator set (case-insensitive substring match)
/// marks a spec as UI-flavored, grounded in `signals::parser`'s
/// `LazyLock<Regex>` constant-table idiom.
pub fn detect_ui_project(spec_text: &str) -> bool {
    UI_INDICATORS.iter().filter(|re| re.is_match(spec_text)).count() >= 2
}

/// Heuristic complexity/feature-count estimate from the same indicator
/// density: more UI/architecture-flavored language suggests a bigger
/// surface.
pub fn estimate_complexity(spec_text: &str) -> (ComplexityTier, usize) {
    let indicator_hits = UI_INDICATORS.iter().filter(|re| re.is_match(spec_text)).count();
    let word_count = spec_text.split_whitespace().count();

    let tier = if word_count < 80 && indicator_hits < 2 {
        ComplexityTier::Simple
    } else if word_count < 400 {
        ComplexityTier::Standard
    } else {
        ComplexityTier::Production
    };

    let suggested = match tier {
        ComplexityTier::Simple => 10,
        ComplexityTier::Standard => 20 + indicator_hits * 2,
        ComplexityTier::Production => 40 + indicator_hits * 4,
    }
    .min(MAX_SUGGESTED_FEATURES);

    (tier, suggested)
}

const DESIGN_RESEARCH_PROMPT: &str = "Produce a short markdown design-research brief (palette, \
    typography, layout conventions) for the application described below. Keep it under 200 words.";

/// Optional design-research pass for UI projects, gated on
/// `FORGE_DISABLE_DESIGN_RESEARCH`. Uses the same one-shot
/// `--output-format text` subprocess idiom the teacher's
/// `Planner::call_claude` used, since this is a single informational call
/// with no tool use to dispatch.
pub async fn run_design_research(spec_text: &str, local_dir: &Path) -> Option<String> {
    if !detect_ui_project(spec_text) {
        return None;
    }
    if std::env::var("FORGE_DISABLE_DESIGN_RESEARCH").is_ok() {
        return None;
    }

    let prompt = format!("{DESIGN_RESEARCH_PROMPT}\n\n{spec_text}");
    match call_claude_text(local_dir, &prompt).await {
        Ok(text) => Some(text),
        Err(err) => {
            tracing::warn!(error = %err, "design research call failed, continuing without it");
            None
        }
    }
}

async fn call_claude_text(working_dir: &Path, prompt: &str) -> Result<String> {
    let claude_cmd = std::env::var("CLAUDE_CMD").unwrap_or_else(|_| "claude".to_string());
    let output = tokio::process::Command::new(&claude_cmd)
        .args(["--print", "--output-format", "text", "-p", prompt])
        .current_dir(working_dir)
        .stdout(std::process::Stdio::piped())
        .stderr(std::process::Stdio::piped())
        .output()
        .await
        .context("failed to run claude CLI for design research")?;

    if !output.status.success() {
        bail!("claude design-research call failed: {}", String::from_utf8_lossy(&output.stderr));
    }
    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

const PLANNING_SYSTEM_PROMPT: &str = r#"You are building a web application from a specification.
First write a DESIGN.md describing the visual and architectural approach, then write a
feature_list.json: a JSON array of features, each with "category" ("functional" or "style"),
"description", "steps" (array of strings), "blocking" (bool — true if sequential execution must
finish this before parallel work starts), and "dependsOn" (array of other features' descriptions,
only meaningful for non-blocking features). Use the bash/read_file/write_file tools to create
these files. Once feature_list.json exists and is non-empty, stop."#;

pub struct Planner;

impl Planner {
    /// Drive the Planning Phase to a validated `FeatureManifest`,
    /// pausing for `AWAITING_DESIGN_REVIEW`/`AWAITING_FEATURE_REVIEW`
    /// gates when the build has review gates enabled.
    pub async fn run(
        ctx: &BuildContext,
        tool_bridge: &ToolBridge,
        app_spec: &str,
        ui_project: bool,
    ) -> Result<FeatureManifest> {
        let design_research = run_design_research(app_spec, &ctx.local_dir).await;

        let mut system_prompt = PLANNING_SYSTEM_PROMPT.to_string();
        if let Some(research) = &design_research {
            system_prompt.push_str("\n\nDesign research:\n");
            system_prompt.push_str(research);
        }

        let mut driver = ConversationDriver::new(system_prompt.clone());
        driver.push(Message::new(Role::User, app_spec));

        let mut design_gate_raised = false;

        for _iteration in 0..MAX_PLANNING_ITERATIONS {
            let prompt = driver.render_prompt();
            let turn = match ClaudeProcess::run_turn(&ctx.local_dir, &prompt).await {
                Ok(turn) => turn,
                Err(err) => {
                    ctx.log(super::models::LogLevel::Error, format!("planning turn failed: {err:#}"))
                        .await;
                    bail!(err);
                }
            };

            if turn.is_error {
                match classify_llm_error(&turn.error_text) {
                    LlmErrorClass::RateLimit => {
                        ClaudeProcess::backoff_rate_limit().await;
                        continue;
                    }
                    LlmErrorClass::ContextOverflow => {
                        driver.reset_with_summary(system_prompt.clone(), 0, 0, &[])
                            .context("planning exceeded the context-reset cap")?;
                        continue;
                    }
                    LlmErrorClass::Other => bail!("planning LLM call failed: {}", turn.error_text),
                }
            }

            if !turn.text.is_empty() {
                driver.push(Message::new(Role::Assistant, turn.text.clone()));
            }

            let mut design_written = false;
            let mut manifest_found: Option<FeatureManifest> = None;

            for call in turn.tool_calls {
                let is_design_write = matches!(&call, ToolCall::WriteFile { path, .. } if path.ends_with("DESIGN.md"));
                let (result, events) = tool_bridge.execute(ctx.build_id, call).await;

                for event in events {
                    if let EventBody::FeatureList { ref features, .. } = event.body {
                        if !features.is_empty() {
                            let manifest = FeatureManifest { features: features.clone() };
                            if manifest.validate().is_ok() {
                                manifest_found = Some(manifest);
                            }
                        }
                    }
                    ctx.bus.publish(super::models::BusItem::Event(event.clone()));
                    ctx.persistence.push_event(event).await;
                }

                if is_design_write {
                    design_written = true;
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
                bail!("planning cancelled");
            }

            if design_written && ui_project && ctx.review_gates_enabled && !design_gate_raised {
                design_gate_raised = true;
                ctx.emit(EventBody::ReviewGate { gate: Gate::Design }).await;
                ctx.transition(super::models::BuildStatus::AwaitingDesignReview).await?;
                ctx.gates.wait_for_approval(Gate::Design).await;
                ctx.transition(super::models::BuildStatus::Running).await?;
            }

            if let Some(manifest) = manifest_found {
                if ctx.review_gates_enabled {
                    ctx.emit(EventBody::ReviewGate { gate: Gate::Feature }).await;
                    ctx.transition(super::models::BuildStatus::AwaitingFeatureReview).await?;
                    ctx.gates.wait_for_approval(Gate::Feature).await;
                    ctx.transition(super::models::BuildStatus::Running).await?;
                }
                return Ok(manifest);
            }
        }

        bail!("planning did not produce a feature_list.json within {MAX_PLANNING_ITERATIONS} iterations")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detect_ui_project_requires_two_indicators() {
        assert!(!detect_ui_project("A command-line tool that parses logs"));
        assert!(detect_ui_project("Build a React frontend with a login form and responsive CSS"));
    }

    #[test]
    fn estimate_complexity_simple_for_short_plain_spec() {
        let (tier, count) = estimate_complexity("A static hello world page");
        assert_eq!(tier, ComplexityTier::Simple);
        assert_eq!(count, 10);
    }

    #[test]
    fn estimate_complexity_scales_with_ui_density() {
        let spec = "Build a React frontend with a component library, a dashboard page, \
            a settings page, a login form, responsive CSS, and a custom design system.";
        let (tier, count) = estimate_complexity(spec);
        assert_ne!(tier, ComplexityTier::Simple);
        assert!(count > 20);
        assert!(count <= MAX_SUGGESTED_FEATURES);
    }

    #[test]
    fn estimate_complexity_caps_at_max_suggested() {
        let long_spec = "React component page button form design responsive CSS ".repeat(200);
        let (_, count) = estimate_complexity(&long_spec);
        assert_eq!(count, MAX_SUGGESTED_FEATURES);
    }
}
