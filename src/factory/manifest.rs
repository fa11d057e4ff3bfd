//! Parsing, validation, and serialized mutation of `feature_list.json`.
//!
//! The parse pipeline (direct parse -> markdown-fence strip -> balanced-
//! brace/bracket extraction) is generalized from
//! `factory::planner::PlanResponse::parse`. The DAG check in `validate`
//! mirrors the dependency-ordering check the teacher runs over
//! `PlanTask.depends_on`, applied here to `Feature.depends_on` restricted
//! to non-blocking features per spec §3.

use std::collections::{HashSet, VecDeque};

use anyhow::{Context, Result, bail};

use super::models::Feature;

/// The full manifest: an ordered, append-only-by-cardinality list of
/// features.
#[derive(Debug, Clone, Default)]
pub struct FeatureManifest {
    pub features: Vec<Feature>,
}

impl FeatureManifest {
    pub fn progress(&self) -> (u32, u32) {
        let total = self.features.len() as u32;
        let completed = self.features.iter().filter(|f| f.passes).count() as u32;
        (completed, total)
    }

    pub fn blocking(&self) -> impl Iterator<Item = &Feature> {
        self.features.iter().filter(|f| f.blocking)
    }

    pub fn non_blocking(&self) -> impl Iterator<Item = &Feature> {
        self.features.iter().filter(|f| !f.blocking)
    }

    pub fn all_blocking_pass(&self) -> bool {
        self.blocking().all(|f| f.passes)
    }

    pub fn all_pass(&self) -> bool {
        self.features.iter().all(|f| f.passes)
    }

    /// Parse a `feature_list.json` body. Tries a direct parse first, then
    /// strips a markdown code fence, then falls back to extracting the
    /// first balanced `[...]` array found in the text - the same
    /// three-step recovery `PlanResponse::parse` uses for `{...}` objects.
    pub fn parse(raw: &str) -> Result<Self> {
        let trimmed = raw.trim();

        if let Ok(features) = serde_json::from_str::<Vec<Feature>>(trimmed) {
            let manifest = Self { features };
            manifest.validate()?;
            return Ok(manifest);
        }

        let stripped = strip_markdown_fence(trimmed);
        if let Ok(features) = serde_json::from_str::<Vec<Feature>>(stripped) {
            let manifest = Self { features };
            manifest.validate()?;
            return Ok(manifest);
        }

        let extracted =
            extract_json_array(stripped).context("no JSON array found in feature_list.json")?;
        let features: Vec<Feature> =
            serde_json::from_str(&extracted).context("failed to parse extracted feature array")?;
        let manifest = Self { features };
        manifest.validate()?;
        Ok(manifest)
    }

    /// Validate structural invariants: unique descriptions, and that
    /// `dependsOn` restricted to non-blocking features forms a DAG.
    pub fn validate(&self) -> Result<()> {
        let mut seen = HashSet::new();
        for feature in &self.features {
            if !seen.insert(feature.description.as_str()) {
                bail!("duplicate feature description: {}", feature.description);
            }
        }

        let non_blocking: HashSet<&str> = self
            .features
            .iter()
            .filter(|f| !f.blocking)
            .map(|f| f.description.as_str())
            .collect();

        // Kahn's algorithm restricted to the non-blocking subgraph.
        let mut indegree: std::collections::HashMap<&str, usize> = non_blocking
            .iter()
            .map(|&description| (description, 0usize))
            .collect();
        let mut edges: std::collections::HashMap<&str, Vec<&str>> = std::collections::HashMap::new();

        for feature in self.features.iter().filter(|f| !f.blocking) {
            for dep in &feature.depends_on {
                if non_blocking.contains(dep.as_str()) {
                    edges
                        .entry(dep.as_str())
                        .or_default()
                        .push(feature.description.as_str());
                    *indegree.get_mut(feature.description.as_str()).unwrap() += 1;
                }
            }
        }

        let mut queue: VecDeque<&str> = indegree
            .iter()
            .filter(|(_, &deg)| deg == 0)
            .map(|(&d, _)| d)
            .collect();
        let mut visited = 0usize;
        while let Some(node) = queue.pop_front() {
            visited += 1;
            if let Some(children) = edges.get(node) {
                for &child in children {
                    let entry = indegree.get_mut(child).unwrap();
                    *entry -= 1;
                    if *entry == 0 {
                        queue.push_back(child);
                    }
                }
            }
        }

        if visited != non_blocking.len() {
            bail!("dependsOn forms a cycle among non-blocking features");
        }

        Ok(())
    }

    /// Mutate a single feature by description, in place. Used by the
    /// serialized `ManifestWriter` task - every write reads the latest
    /// file, mutates, and writes back atomically, so readers always see a
    /// consistent snapshot (spec §5).
    pub fn apply_mutation(&mut self, description: &str, f: impl FnOnce(&mut Feature)) -> Result<()> {
        let feature = self
            .features
            .iter_mut()
            .find(|feat| feat.description == description)
            .with_context(|| format!("feature not found: {description}"))?;
        f(feature);
        Ok(())
    }

    pub fn to_json_pretty(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(&self.features)?)
    }
}

/// Per-build serialized writer for `feature_list.json` mutations. A
/// dedicated task owns the in-memory manifest and applies commands in
/// arrival order, replacing the "feature-list mutex" of spec §5/§9 with
/// a task instead of a lock primitive, per the §9 redesign flag. This
/// task never touches the sandbox itself; callers that need the
/// resulting snapshot reflected in `feature_list.json` (the Parallel
/// Executor, after a feature passes) write it back themselves once
/// `apply` returns, so concurrent subagents still never race on the
/// manifest - they only ever see it serialized through this channel.
pub struct ManifestWriter {
    tx: tokio::sync::mpsc::Sender<WriterCommand>,
}

enum WriterCommand {
    Apply {
        description: String,
        mutate: Box<dyn FnOnce(&mut Feature) + Send>,
        reply: tokio::sync::oneshot::Sender<Result<FeatureManifest>>,
    },
    Snapshot {
        reply: tokio::sync::oneshot::Sender<FeatureManifest>,
    },
    Replace {
        manifest: FeatureManifest,
        reply: tokio::sync::oneshot::Sender<()>,
    },
}

impl ManifestWriter {
    /// Spawn the writer task owning `initial`.
    pub fn spawn(initial: FeatureManifest) -> Self {
        let (tx, mut rx) = tokio::sync::mpsc::channel::<WriterCommand>(64);
        tokio::spawn(async move {
            let mut manifest = initial;
            while let Some(cmd) = rx.recv().await {
                match cmd {
                    WriterCommand::Apply {
                        description,
                        mutate,
                        reply,
                    } => {
                        let result = manifest.apply_mutation(&description, |f| mutate(f));
                        let _ = reply.send(result.map(|()| manifest.clone()));
                    }
                    WriterCommand::Snapshot { reply } => {
                        let _ = reply.send(manifest.clone());
                    }
                    WriterCommand::Replace { manifest: new, reply } => {
                        manifest = new;
                        let _ = reply.send(());
                    }
                }
            }
        });
        Self { tx }
    }

    /// Apply one mutation to the feature named `description`, returning a
    /// snapshot of the manifest after the write.
    pub async fn apply(
        &self,
        description: impl Into<String>,
        mutate: impl FnOnce(&mut Feature) + Send + 'static,
    ) -> Result<FeatureManifest> {
        let (reply_tx, reply_rx) = tokio::sync::oneshot::channel();
        self.tx
            .send(WriterCommand::Apply {
                description: description.into(),
                mutate: Box::new(mutate),
                reply: reply_tx,
            })
            .await
            .map_err(|_| anyhow::anyhow!("manifest writer task has shut down"))?;
        reply_rx
            .await
            .map_err(|_| anyhow::anyhow!("manifest writer task dropped reply"))?
    }

    pub async fn snapshot(&self) -> Result<FeatureManifest> {
        let (reply_tx, reply_rx) = tokio::sync::oneshot::channel();
        self.tx
            .send(WriterCommand::Snapshot { reply: reply_tx })
            .await
            .map_err(|_| anyhow::anyhow!("manifest writer task has shut down"))?;
        reply_rx
            .await
            .map_err(|_| anyhow::anyhow!("manifest writer task dropped reply"))
    }

    /// Replace the whole manifest wholesale (used when the LLM rewrites
    /// `feature_list.json` directly rather than through a targeted
    /// mutation).
    pub async fn replace(&self, manifest: FeatureManifest) -> Result<()> {
        let (reply_tx, reply_rx) = tokio::sync::oneshot::channel();
        self.tx
            .send(WriterCommand::Replace {
                manifest,
                reply: reply_tx,
            })
            .await
            .map_err(|_| anyhow::anyhow!("manifest writer task has shut down"))?;
        reply_rx
            .await
            .map_err(|_| anyhow::anyhow!("manifest writer task dropped reply"))
    }
}

fn strip_markdown_fence(text: &str) -> &str {
    let trimmed = text.trim();
    if let Some(rest) = trimmed.strip_prefix("```json") {
        rest.trim().trim_end_matches("```").trim()
    } else if let Some(rest) = trimmed.strip_prefix("```") {
        rest.trim().trim_end_matches("```").trim()
    } else {
        trimmed
    }
}

/// Extract the first balanced `[...]` array in `text`, honoring nested
/// brackets and escaped/quoted strings - the array-flavored sibling of
/// `planner::extract_json_object`.
fn extract_json_array(text: &str) -> Option<String> {
    let bytes = text.as_bytes();
    let start = text.find('[')?;
    let mut depth = 0i32;
    let mut in_string = false;
    let mut escaped = false;

    for (offset, &byte) in bytes[start..].iter().enumerate() {
        let ch = byte as char;
        if in_string {
            if escaped {
                escaped = false;
            } else if ch == '\\' {
                escaped = true;
            } else if ch == '"' {
                in_string = false;
            }
            continue;
        }
        match ch {
            '"' => in_string = true,
            '[' => depth += 1,
            ']' => {
                depth -= 1;
                if depth == 0 {
                    return Some(text[start..start + offset + 1].to_string());
                }
            }
            _ => {}
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::factory::models::FeatureCategory;

    fn feature(desc: &str, blocking: bool, deps: &[&str]) -> Feature {
        Feature {
            category: FeatureCategory::Functional,
            description: desc.to_string(),
            steps: vec![],
            passes: false,
            blocking,
            depends_on: deps.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[test]
    fn parse_direct_json_array() {
        let raw = r#"[{"category":"functional","description":"Login","steps":[]}]"#;
        let manifest = FeatureManifest::parse(raw).unwrap();
        assert_eq!(manifest.features.len(), 1);
    }

    #[test]
    fn parse_strips_markdown_fence() {
        let raw = "```json\n[{\"category\":\"functional\",\"description\":\"Login\",\"steps\":[]}]\n```";
        let manifest = FeatureManifest::parse(raw).unwrap();
        assert_eq!(manifest.features.len(), 1);
    }

    #[test]
    fn parse_extracts_embedded_array() {
        let raw = "Here is the plan:\n[{\"category\":\"style\",\"description\":\"Dark mode\",\"steps\":[]}]\nThanks!";
        let manifest = FeatureManifest::parse(raw).unwrap();
        assert_eq!(manifest.features.len(), 1);
    }

    #[test]
    fn parse_rejects_duplicate_descriptions() {
        let raw = r#"[
            {"category":"functional","description":"Login","steps":[]},
            {"category":"functional","description":"Login","steps":[]}
        ]"#;
        assert!(FeatureManifest::parse(raw).is_err());
    }

    #[test]
    fn validate_detects_cycle_among_non_blocking() {
        let manifest = FeatureManifest {
            features: vec![
                feature("A", false, &["B"]),
                feature("B", false, &["A"]),
            ],
        };
        assert!(manifest.validate().is_err());
    }

    #[test]
    fn validate_allows_dag_among_non_blocking() {
        let manifest = FeatureManifest {
            features: vec![
                feature("A", true, &[]),
                feature("B", false, &["A"]),
                feature("C", false, &["B"]),
            ],
        };
        assert!(manifest.validate().is_ok());
    }

    #[test]
    fn progress_counts_passing_features() {
        let mut manifest = FeatureManifest {
            features: vec![feature("A", true, &[]), feature("B", true, &[])],
        };
        manifest.features[0].passes = true;
        let (completed, total) = manifest.progress();
        assert_eq!((completed, total), (1, 2));
    }

    #[test]
    fn apply_mutation_sets_passes_true() {
        let mut manifest = FeatureManifest {
            features: vec![feature("A", true, &[])],
        };
        manifest.apply_mutation("A", |f| f.passes = true).unwrap();
        assert!(manifest.features[0].passes);
    }

    #[test]
    fn apply_mutation_errors_on_unknown_description() {
        let mut manifest = FeatureManifest {
            features: vec![feature("A", true, &[])],
        };
        assert!(manifest.apply_mutation("Z", |f| f.passes = true).is_err());
    }

    #[tokio::test]
    async fn manifest_writer_applies_mutation_and_returns_snapshot() {
        let manifest = FeatureManifest {
            features: vec![feature("A", true, &[])],
        };
        let writer = ManifestWriter::spawn(manifest);
        let snapshot = writer.apply("A", |f| f.passes = true).await.unwrap();
        assert!(snapshot.features[0].passes);
        assert!(writer.snapshot().await.unwrap().features[0].passes);
    }

    #[tokio::test]
    async fn manifest_writer_serializes_concurrent_mutations() {
        let manifest = FeatureManifest {
            features: vec![feature("A", true, &[]), feature("B", true, &[])],
        };
        let writer = ManifestWriter::spawn(manifest);
        let a = writer.apply("A", |f| f.passes = true);
        let b = writer.apply("B", |f| f.passes = true);
        let (ra, rb) = tokio::join!(a, b);
        ra.unwrap();
        rb.unwrap();
        let snapshot = writer.snapshot().await.unwrap();
        assert!(snapshot.features.iter().all(|f| f.passes));
    }

    #[tokio::test]
    async fn manifest_writer_replace_swaps_whole_manifest() {
        let writer = ManifestWriter::spawn(FeatureManifest::default());
        writer
            .replace(FeatureManifest {
                features: vec![feature("A", true, &[])],
            })
            .await
            .unwrap();
        assert_eq!(writer.snapshot().await.unwrap().features.len(), 1);
    }

    #[test]
    fn all_blocking_pass_false_until_all_blocking_complete() {
        let mut manifest = FeatureManifest {
            features: vec![feature("A", true, &[]), feature("B", true, &[])],
        };
        assert!(!manifest.all_blocking_pass());
        manifest.features[0].passes = true;
        assert!(!manifest.all_blocking_pass());
        manifest.features[1].passes = true;
        assert!(manifest.all_blocking_pass());
    }
}
