//! Core data model for the build orchestrator: `Build`, the feature
//! manifest, `Event`/`LogEntry`, and the small enums that describe their
//! lifecycle. See `factory::manifest` for manifest file parsing/mutation
//! and `factory::bus` for how `Event`/`LogEntry` flow through the system.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Lifecycle status of a `Build`. Wire value matches spec §3 exactly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BuildStatus {
    Pending,
    Initializing,
    Running,
    Paused,
    AwaitingDesignReview,
    AwaitingFeatureReview,
    Completed,
    Failed,
    Cancelled,
}

impl BuildStatus {
    /// Terminal statuses never transition further.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            BuildStatus::Completed | BuildStatus::Failed | BuildStatus::Cancelled
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComplexityTier {
    Simple,
    Standard,
    Production,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Progress {
    pub completed: u32,
    pub total: u32,
}

impl Progress {
    pub fn zero() -> Self {
        Self {
            completed: 0,
            total: 0,
        }
    }
}

/// The top-level unit of work. See spec §3 for field invariants:
/// `progress.completed <= progress.total`, and a non-null `artifact_key`
/// implies a terminal status.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Build {
    pub id: Uuid,
    pub owner_id: String,
    pub app_spec: String,
    pub status: BuildStatus,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub progress: Progress,
    pub artifact_key: Option<String>,
    pub sandbox_id: Option<String>,
    pub output_url: Option<String>,
    pub review_gates_enabled: bool,
    pub complexity_tier: ComplexityTier,
    pub target_feature_count: u32,
}

impl Build {
    pub fn new(owner_id: impl Into<String>, app_spec: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            owner_id: owner_id.into(),
            app_spec: app_spec.into(),
            status: BuildStatus::Pending,
            created_at: Utc::now(),
            started_at: None,
            progress: Progress::zero(),
            artifact_key: None,
            sandbox_id: None,
            output_url: None,
            review_gates_enabled: false,
            complexity_tier: ComplexityTier::Standard,
            target_feature_count: 20,
        }
    }
}

/// A single testable unit of work tracked in `feature_list.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Feature {
    pub category: FeatureCategory,
    pub description: String,
    #[serde(default)]
    pub steps: Vec<String>,
    #[serde(default)]
    pub passes: bool,
    #[serde(default = "default_blocking")]
    pub blocking: bool,
    #[serde(default)]
    pub depends_on: Vec<String>,
}

fn default_blocking() -> bool {
    true
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FeatureCategory {
    Functional,
    Style,
}

/// Which review checkpoint a gate refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Gate {
    Design,
    Feature,
}

/// Severity attached to `error` events, per spec §7.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Warning,
    Error,
    Fatal,
}

/// The tagged union of structured progress events, one variant per kind
/// in spec §3. Follows the `WsMessage` tagged-enum convention from the
/// teacher's `factory::ws`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventBody {
    Phase {
        name: String,
    },
    Thinking {
        snippet: String,
    },
    Activity {
        description: String,
    },
    ToolStart {
        tool_use_id: String,
        name: String,
    },
    ToolEnd {
        tool_use_id: String,
        success: bool,
    },
    Command {
        tool_use_id: String,
        command: String,
        exit_code: i32,
        stdout: String,
        stderr: String,
        duration_ms: u64,
    },
    FileCreated {
        path: String,
        bytes: usize,
        language: String,
        lines: usize,
    },
    FileModified {
        path: String,
        bytes: usize,
        language: String,
        lines: usize,
    },
    FileDeleted {
        path: String,
    },
    Error {
        severity: Severity,
        message: String,
        recoverable: bool,
    },
    Progress {
        completed: u32,
        total: u32,
    },
    FeatureStart {
        description: String,
        subagent: Option<String>,
    },
    FeatureEnd {
        description: String,
        passed: bool,
        subagent: Option<String>,
    },
    FeatureList {
        features: Vec<Feature>,
        completed: u32,
        total: u32,
    },
    ReviewGate {
        gate: Gate,
    },
}

/// One structured progress event for a build. Ids are globally unique and
/// events within a build are totally ordered by (timestamp, id) per spec.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: Uuid,
    pub build_id: Uuid,
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub body: EventBody,
}

impl Event {
    pub fn new(build_id: Uuid, body: EventBody) -> Self {
        Self {
            id: Uuid::new_v4(),
            build_id,
            timestamp: Utc::now(),
            body,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Info,
    Warn,
    Error,
    Tool,
    Debug,
}

/// The unstructured companion stream to `Event`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    pub id: Uuid,
    pub build_id: Uuid,
    pub level: LogLevel,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

impl LogEntry {
    pub fn new(build_id: Uuid, level: LogLevel, message: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            build_id,
            level,
            message: message.into(),
            timestamp: Utc::now(),
        }
    }
}

/// A single tagged item flowing through the Event Bus / Persistence Buffer.
///
/// `Terminal` is a live-only close signal: the orchestrator publishes it
/// to the bus (never to the Persistence Buffer) the moment a build
/// reaches a terminal status, so an SSE connection already subscribed to
/// the bus's live stream knows to send its own `complete` envelope and
/// close, without polling the durable store.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BusItem {
    Event(Event),
    Log(LogEntry),
    Terminal {
        id: Uuid,
        build_id: Uuid,
        timestamp: DateTime<Utc>,
        status: BuildStatus,
    },
}

impl BusItem {
    pub fn id(&self) -> Uuid {
        match self {
            BusItem::Event(e) => e.id,
            BusItem::Log(l) => l.id,
            BusItem::Terminal { id, .. } => *id,
        }
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            BusItem::Event(e) => e.timestamp,
            BusItem::Log(l) => l.timestamp,
            BusItem::Terminal { timestamp, .. } => *timestamp,
        }
    }

    pub fn terminal(build_id: Uuid, status: BuildStatus) -> Self {
        BusItem::Terminal {
            id: Uuid::new_v4(),
            build_id,
            timestamp: Utc::now(),
            status,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_status_terminal_set() {
        assert!(BuildStatus::Completed.is_terminal());
        assert!(BuildStatus::Failed.is_terminal());
        assert!(BuildStatus::Cancelled.is_terminal());
        assert!(!BuildStatus::Running.is_terminal());
        assert!(!BuildStatus::Paused.is_terminal());
    }

    #[test]
    fn build_status_serializes_to_screaming_snake_case() {
        let json = serde_json::to_string(&BuildStatus::AwaitingDesignReview).unwrap();
        assert_eq!(json, "\"AWAITING_DESIGN_REVIEW\"");
    }

    #[test]
    fn feature_defaults_blocking_true_when_absent() {
        let json = r#"{"category":"functional","description":"Add login","steps":[]}"#;
        let feature: Feature = serde_json::from_str(json).unwrap();
        assert!(feature.blocking);
        assert!(!feature.passes);
        assert!(feature.depends_on.is_empty());
    }

    #[test]
    fn feature_respects_explicit_blocking_false() {
        let json =
            r#"{"category":"style","description":"Dark mode","steps":[],"blocking":false}"#;
        let feature: Feature = serde_json::from_str(json).unwrap();
        assert!(!feature.blocking);
    }

    #[test]
    fn event_new_assigns_unique_id_and_build_id() {
        let build_id = Uuid::new_v4();
        let event = Event::new(
            build_id,
            EventBody::Progress {
                completed: 1,
                total: 10,
            },
        );
        assert_eq!(event.build_id, build_id);
        assert_ne!(event.id, Uuid::nil());
    }

    #[test]
    fn bus_item_id_and_timestamp_delegate() {
        let build_id = Uuid::new_v4();
        let event = Event::new(build_id, EventBody::Phase { name: "plan".into() });
        let expected_id = event.id;
        let expected_ts = event.timestamp;
        let item = BusItem::Event(event);
        assert_eq!(item.id(), expected_id);
        assert_eq!(item.timestamp(), expected_ts);
    }

    #[test]
    fn event_body_round_trips_through_json() {
        let body = EventBody::Command {
            tool_use_id: "tu_1".into(),
            command: "ls -la".into(),
            exit_code: 0,
            stdout: "a.txt".into(),
            stderr: String::new(),
            duration_ms: 42,
        };
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["type"], "command");
        assert_eq!(json["exit_code"], 0);
        let back: EventBody = serde_json::from_value(json).unwrap();
        match back {
            EventBody::Command { command, .. } => assert_eq!(command, "ls -la"),
            _ => panic!("expected Command variant"),
        }
    }
}
