//! SQLite persistence for builds, events, and logs.
//!
//! `FactoryDb` keeps the teacher's synchronous rusqlite style (a single
//! `Connection`, `anyhow::Context`-annotated statements, row-struct ->
//! domain-struct conversion). `DbHandle` is the async-friendly wrapper
//! the rest of the orchestrator talks to: an `Arc<tokio::sync::Mutex<..>>`
//! around `FactoryDb`, mirroring how `factory::ws` shares its state across
//! tasks with `Arc<Mutex<..>>` rather than a connection pool.

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use rusqlite::{Connection, OptionalExtension, params};
use tokio::sync::Mutex;
use uuid::Uuid;

use super::models::*;

pub struct FactoryDb {
    conn: Connection,
}

impl FactoryDb {
    /// Open (or create) a SQLite database at the given path and run migrations.
    pub fn new(path: &Path) -> Result<Self> {
        let conn = Connection::open(path).context("failed to open SQLite database")?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    /// Create an in-memory SQLite database (for testing).
    pub fn new_in_memory() -> Result<Self> {
        let conn =
            Connection::open_in_memory().context("failed to open in-memory SQLite database")?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    fn init(&self) -> Result<()> {
        self.conn
            .execute_batch("PRAGMA foreign_keys = ON; PRAGMA journal_mode = WAL;")
            .context("failed to set pragmas")?;
        self.run_migrations().context("failed to run migrations")?;
        Ok(())
    }

    fn run_migrations(&self) -> Result<()> {
        self.conn
            .execute_batch(
                "
                CREATE TABLE IF NOT EXISTS builds (
                    id TEXT PRIMARY KEY,
                    owner_id TEXT NOT NULL,
                    app_spec TEXT NOT NULL,
                    status TEXT NOT NULL,
                    created_at TEXT NOT NULL,
                    started_at TEXT,
                    progress_completed INTEGER NOT NULL DEFAULT 0,
                    progress_total INTEGER NOT NULL DEFAULT 0,
                    artifact_key TEXT,
                    sandbox_id TEXT,
                    output_url TEXT,
                    review_gates_enabled INTEGER NOT NULL DEFAULT 0,
                    complexity_tier TEXT NOT NULL DEFAULT 'standard',
                    target_feature_count INTEGER NOT NULL DEFAULT 20
                );

                CREATE TABLE IF NOT EXISTS build_events (
                    id TEXT PRIMARY KEY,
                    build_id TEXT NOT NULL REFERENCES builds(id) ON DELETE CASCADE,
                    timestamp TEXT NOT NULL,
                    body TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS build_logs (
                    id TEXT PRIMARY KEY,
                    build_id TEXT NOT NULL REFERENCES builds(id) ON DELETE CASCADE,
                    level TEXT NOT NULL,
                    message TEXT NOT NULL,
                    timestamp TEXT NOT NULL
                );

                CREATE INDEX IF NOT EXISTS idx_build_events_build ON build_events(build_id, timestamp);
                CREATE INDEX IF NOT EXISTS idx_build_logs_build ON build_logs(build_id, timestamp);
                CREATE INDEX IF NOT EXISTS idx_builds_owner ON builds(owner_id);
                ",
            )
            .context("failed to create tables")?;
        Ok(())
    }

    // ── Build CRUD ────────────────────────────────────────────────────

    pub fn create_build(&self, build: &Build) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO builds (
                    id, owner_id, app_spec, status, created_at, started_at,
                    progress_completed, progress_total, artifact_key, sandbox_id,
                    output_url, review_gates_enabled, complexity_tier, target_feature_count
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
                params![
                    build.id.to_string(),
                    build.owner_id,
                    build.app_spec,
                    status_str(build.status),
                    build.created_at.to_rfc3339(),
                    build.started_at.map(|t| t.to_rfc3339()),
                    build.progress.completed,
                    build.progress.total,
                    build.artifact_key,
                    build.sandbox_id,
                    build.output_url,
                    build.review_gates_enabled,
                    tier_str(build.complexity_tier),
                    build.target_feature_count,
                ],
            )
            .context("failed to insert build")?;
        Ok(())
    }

    pub fn get_build(&self, id: Uuid) -> Result<Option<Build>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT id, owner_id, app_spec, status, created_at, started_at,
                        progress_completed, progress_total, artifact_key, sandbox_id,
                        output_url, review_gates_enabled, complexity_tier, target_feature_count
                 FROM builds WHERE id = ?1",
            )
            .context("failed to prepare get_build")?;
        stmt.query_row(params![id.to_string()], row_to_build)
            .optional()
            .context("failed to query build")
    }

    pub fn list_builds(&self, owner_id: &str) -> Result<Vec<Build>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT id, owner_id, app_spec, status, created_at, started_at,
                        progress_completed, progress_total, artifact_key, sandbox_id,
                        output_url, review_gates_enabled, complexity_tier, target_feature_count
                 FROM builds WHERE owner_id = ?1 ORDER BY created_at DESC",
            )
            .context("failed to prepare list_builds")?;
        let rows = stmt
            .query_map(params![owner_id], row_to_build)
            .context("failed to query builds")?;
        let mut builds = Vec::new();
        for row in rows {
            builds.push(row.context("failed to read build row")?);
        }
        Ok(builds)
    }

    pub fn update_build_status(&self, id: Uuid, status: BuildStatus) -> Result<()> {
        self.conn
            .execute(
                "UPDATE builds SET status = ?1 WHERE id = ?2",
                params![status_str(status), id.to_string()],
            )
            .context("failed to update build status")?;
        Ok(())
    }

    pub fn update_build_started_at(&self, id: Uuid, started_at: chrono::DateTime<chrono::Utc>) -> Result<()> {
        self.conn
            .execute(
                "UPDATE builds SET started_at = ?1 WHERE id = ?2",
                params![started_at.to_rfc3339(), id.to_string()],
            )
            .context("failed to update build started_at")?;
        Ok(())
    }

    pub fn update_build_progress(&self, id: Uuid, completed: u32, total: u32) -> Result<()> {
        self.conn
            .execute(
                "UPDATE builds SET progress_completed = ?1, progress_total = ?2 WHERE id = ?3",
                params![completed, total, id.to_string()],
            )
            .context("failed to update build progress")?;
        Ok(())
    }

    pub fn complete_build(
        &self,
        id: Uuid,
        status: BuildStatus,
        artifact_key: Option<&str>,
        output_url: Option<&str>,
    ) -> Result<()> {
        self.conn
            .execute(
                "UPDATE builds SET status = ?1, artifact_key = ?2, output_url = ?3 WHERE id = ?4",
                params![status_str(status), artifact_key, output_url, id.to_string()],
            )
            .context("failed to complete build")?;
        Ok(())
    }

    pub fn update_build_sandbox_id(&self, id: Uuid, sandbox_id: Option<&str>) -> Result<()> {
        self.conn
            .execute(
                "UPDATE builds SET sandbox_id = ?1 WHERE id = ?2",
                params![sandbox_id, id.to_string()],
            )
            .context("failed to update build sandbox_id")?;
        Ok(())
    }

    // ── Event / log batch writes ─────────────────────────────────────

    pub fn create_build_events_batch(&mut self, events: &[Event]) -> Result<()> {
        let tx = self.conn.transaction().context("failed to start transaction")?;
        for event in events {
            let body = serde_json::to_string(&event.body).context("failed to serialize event body")?;
            tx.execute(
                "INSERT OR IGNORE INTO build_events (id, build_id, timestamp, body) VALUES (?1, ?2, ?3, ?4)",
                params![
                    event.id.to_string(),
                    event.build_id.to_string(),
                    event.timestamp.to_rfc3339(),
                    body,
                ],
            )
            .context("failed to insert event")?;
        }
        tx.commit().context("failed to commit event batch")?;
        Ok(())
    }

    pub fn create_build_logs_batch(&mut self, logs: &[LogEntry]) -> Result<()> {
        let tx = self.conn.transaction().context("failed to start transaction")?;
        for log in logs {
            tx.execute(
                "INSERT OR IGNORE INTO build_logs (id, build_id, level, message, timestamp) VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    log.id.to_string(),
                    log.build_id.to_string(),
                    log_level_str(log.level),
                    log.message,
                    log.timestamp.to_rfc3339(),
                ],
            )
            .context("failed to insert log")?;
        }
        tx.commit().context("failed to commit log batch")?;
        Ok(())
    }

    pub fn list_build_events(&self, build_id: Uuid) -> Result<Vec<Event>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT id, build_id, timestamp, body FROM build_events
                 WHERE build_id = ?1 ORDER BY timestamp ASC, id ASC",
            )
            .context("failed to prepare list_build_events")?;
        let rows = stmt
            .query_map(params![build_id.to_string()], |row| {
                let id: String = row.get(0)?;
                let build_id: String = row.get(1)?;
                let timestamp: String = row.get(2)?;
                let body: String = row.get(3)?;
                Ok((id, build_id, timestamp, body))
            })
            .context("failed to query build events")?;

        let mut events = Vec::new();
        for row in rows {
            let (id, build_id, timestamp, body) = row.context("failed to read event row")?;
            events.push(Event {
                id: Uuid::parse_str(&id).context("invalid event id")?,
                build_id: Uuid::parse_str(&build_id).context("invalid build id")?,
                timestamp: chrono::DateTime::parse_from_rfc3339(&timestamp)
                    .context("invalid event timestamp")?
                    .with_timezone(&chrono::Utc),
                body: serde_json::from_str(&body).context("invalid event body")?,
            });
        }
        Ok(events)
    }

    pub fn list_build_logs(&self, build_id: Uuid) -> Result<Vec<LogEntry>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT id, build_id, level, message, timestamp FROM build_logs
                 WHERE build_id = ?1 ORDER BY timestamp ASC, id ASC",
            )
            .context("failed to prepare list_build_logs")?;
        let rows = stmt
            .query_map(params![build_id.to_string()], |row| {
                let id: String = row.get(0)?;
                let build_id: String = row.get(1)?;
                let level: String = row.get(2)?;
                let message: String = row.get(3)?;
                let timestamp: String = row.get(4)?;
                Ok((id, build_id, level, message, timestamp))
            })
            .context("failed to query build logs")?;

        let mut logs = Vec::new();
        for row in rows {
            let (id, build_id, level, message, timestamp) = row.context("failed to read log row")?;
            logs.push(LogEntry {
                id: Uuid::parse_str(&id).context("invalid log id")?,
                build_id: Uuid::parse_str(&build_id).context("invalid build id")?,
                level: parse_log_level(&level)?,
                message,
                timestamp: chrono::DateTime::parse_from_rfc3339(&timestamp)
                    .context("invalid log timestamp")?
                    .with_timezone(&chrono::Utc),
            });
        }
        Ok(logs)
    }
}

fn status_str(status: BuildStatus) -> &'static str {
    match status {
        BuildStatus::Pending => "pending",
        BuildStatus::Initializing => "initializing",
        BuildStatus::Running => "running",
        BuildStatus::Paused => "paused",
        BuildStatus::AwaitingDesignReview => "awaiting_design_review",
        BuildStatus::AwaitingFeatureReview => "awaiting_feature_review",
        BuildStatus::Completed => "completed",
        BuildStatus::Failed => "failed",
        BuildStatus::Cancelled => "cancelled",
    }
}

fn parse_status(s: &str) -> Result<BuildStatus> {
    Ok(match s {
        "pending" => BuildStatus::Pending,
        "initializing" => BuildStatus::Initializing,
        "running" => BuildStatus::Running,
        "paused" => BuildStatus::Paused,
        "awaiting_design_review" => BuildStatus::AwaitingDesignReview,
        "awaiting_feature_review" => BuildStatus::AwaitingFeatureReview,
        "completed" => BuildStatus::Completed,
        "failed" => BuildStatus::Failed,
        "cancelled" => BuildStatus::Cancelled,
        other => anyhow::bail!("unknown build status: {other}"),
    })
}

fn tier_str(tier: ComplexityTier) -> &'static str {
    match tier {
        ComplexityTier::Simple => "simple",
        ComplexityTier::Standard => "standard",
        ComplexityTier::Production => "production",
    }
}

fn parse_tier(s: &str) -> Result<ComplexityTier> {
    Ok(match s {
        "simple" => ComplexityTier::Simple,
        "standard" => ComplexityTier::Standard,
        "production" => ComplexityTier::Production,
        other => anyhow::bail!("unknown complexity tier: {other}"),
    })
}

fn log_level_str(level: LogLevel) -> &'static str {
    match level {
        LogLevel::Info => "info",
        LogLevel::Warn => "warn",
        LogLevel::Error => "error",
        LogLevel::Tool => "tool",
        LogLevel::Debug => "debug",
    }
}

fn parse_log_level(s: &str) -> Result<LogLevel> {
    Ok(match s {
        "info" => LogLevel::Info,
        "warn" => LogLevel::Warn,
        "error" => LogLevel::Error,
        "tool" => LogLevel::Tool,
        "debug" => LogLevel::Debug,
        other => anyhow::bail!("unknown log level: {other}"),
    })
}

fn row_to_build(row: &rusqlite::Row) -> rusqlite::Result<Build> {
    let id: String = row.get(0)?;
    let status: String = row.get(3)?;
    let created_at: String = row.get(4)?;
    let started_at: Option<String> = row.get(5)?;
    let tier: String = row.get(12)?;

    Ok(Build {
        id: Uuid::parse_str(&id).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
        })?,
        owner_id: row.get(1)?,
        app_spec: row.get(2)?,
        status: parse_status(&status).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(3, rusqlite::types::Type::Text, e.into())
        })?,
        created_at: chrono::DateTime::parse_from_rfc3339(&created_at)
            .map_err(|e| {
                rusqlite::Error::FromSqlConversionFailure(4, rusqlite::types::Type::Text, Box::new(e))
            })?
            .with_timezone(&chrono::Utc),
        started_at: started_at
            .map(|s| {
                chrono::DateTime::parse_from_rfc3339(&s).map(|t| t.with_timezone(&chrono::Utc))
            })
            .transpose()
            .map_err(|e| {
                rusqlite::Error::FromSqlConversionFailure(5, rusqlite::types::Type::Text, Box::new(e))
            })?,
        progress: Progress {
            completed: row.get(6)?,
            total: row.get(7)?,
        },
        artifact_key: row.get(8)?,
        sandbox_id: row.get(9)?,
        output_url: row.get(10)?,
        review_gates_enabled: row.get(11)?,
        complexity_tier: parse_tier(&tier).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(12, rusqlite::types::Type::Text, e.into())
        })?,
        target_feature_count: row.get(13)?,
    })
}

/// Async-friendly handle shared across a build's tasks. Cloning shares the
/// same underlying connection; `rusqlite::Connection` is not `Send` across
/// an `.await` point on its own, so every operation locks the async mutex
/// for the duration of one (fast, local) SQLite call rather than holding it
/// across network I/O.
#[derive(Clone)]
pub struct DbHandle {
    inner: Arc<Mutex<FactoryDb>>,
}

impl DbHandle {
    pub fn new(path: &Path) -> Result<Self> {
        Ok(Self {
            inner: Arc::new(Mutex::new(FactoryDb::new(path)?)),
        })
    }

    pub fn new_in_memory() -> Result<Self> {
        Ok(Self {
            inner: Arc::new(Mutex::new(FactoryDb::new_in_memory()?)),
        })
    }

    pub async fn create_build(&self, build: &Build) -> Result<()> {
        self.inner.lock().await.create_build(build)
    }

    pub async fn get_build(&self, id: Uuid) -> Result<Option<Build>> {
        self.inner.lock().await.get_build(id)
    }

    pub async fn list_builds(&self, owner_id: &str) -> Result<Vec<Build>> {
        self.inner.lock().await.list_builds(owner_id)
    }

    pub async fn update_build_status(&self, id: Uuid, status: BuildStatus) -> Result<()> {
        self.inner.lock().await.update_build_status(id, status)
    }

    pub async fn update_build_started_at(
        &self,
        id: Uuid,
        started_at: chrono::DateTime<chrono::Utc>,
    ) -> Result<()> {
        self.inner.lock().await.update_build_started_at(id, started_at)
    }

    pub async fn update_build_progress(&self, id: Uuid, completed: u32, total: u32) -> Result<()> {
        self.inner.lock().await.update_build_progress(id, completed, total)
    }

    pub async fn complete_build(
        &self,
        id: Uuid,
        status: BuildStatus,
        artifact_key: Option<&str>,
        output_url: Option<&str>,
    ) -> Result<()> {
        self.inner.lock().await.complete_build(id, status, artifact_key, output_url)
    }

    pub async fn update_build_sandbox_id(&self, id: Uuid, sandbox_id: Option<&str>) -> Result<()> {
        self.inner.lock().await.update_build_sandbox_id(id, sandbox_id)
    }

    pub async fn create_build_events_batch(&self, _build_id: Uuid, events: Vec<Event>) -> Result<()> {
        self.inner.lock().await.create_build_events_batch(&events)
    }

    pub async fn create_build_logs_batch(&self, _build_id: Uuid, logs: Vec<LogEntry>) -> Result<()> {
        self.inner.lock().await.create_build_logs_batch(&logs)
    }

    pub async fn list_build_events(&self, build_id: Uuid) -> Result<Vec<Event>> {
        self.inner.lock().await.list_build_events(build_id)
    }

    pub async fn list_build_logs(&self, build_id: Uuid) -> Result<Vec<LogEntry>> {
        self.inner.lock().await.list_build_logs(build_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_and_get_build_round_trips() {
        let db = FactoryDb::new_in_memory().unwrap();
        let build = Build::new("owner-1", "a todo app");
        db.create_build(&build).unwrap();

        let fetched = db.get_build(build.id).unwrap().unwrap();
        assert_eq!(fetched.owner_id, "owner-1");
        assert_eq!(fetched.status, BuildStatus::Pending);
    }

    #[test]
    fn get_build_returns_none_for_unknown_id() {
        let db = FactoryDb::new_in_memory().unwrap();
        assert!(db.get_build(Uuid::new_v4()).unwrap().is_none());
    }

    #[test]
    fn update_build_status_persists() {
        let db = FactoryDb::new_in_memory().unwrap();
        let build = Build::new("owner-1", "a todo app");
        db.create_build(&build).unwrap();
        db.update_build_status(build.id, BuildStatus::Running).unwrap();
        let fetched = db.get_build(build.id).unwrap().unwrap();
        assert_eq!(fetched.status, BuildStatus::Running);
    }

    #[test]
    fn list_builds_orders_by_created_at_desc() {
        let db = FactoryDb::new_in_memory().unwrap();
        let first = Build::new("owner-1", "first");
        std::thread::sleep(std::time::Duration::from_millis(2));
        let second = Build::new("owner-1", "second");
        db.create_build(&first).unwrap();
        db.create_build(&second).unwrap();

        let builds = db.list_builds("owner-1").unwrap();
        assert_eq!(builds.len(), 2);
        assert_eq!(builds[0].id, second.id);
    }

    #[test]
    fn event_and_log_batches_round_trip_in_order() {
        let mut db = FactoryDb::new_in_memory().unwrap();
        let build = Build::new("owner-1", "spec");
        db.create_build(&build).unwrap();

        let events = vec![
            Event::new(build.id, EventBody::Phase { name: "plan".into() }),
            Event::new(build.id, EventBody::Progress { completed: 1, total: 5 }),
        ];
        db.create_build_events_batch(&events).unwrap();

        let logs = vec![LogEntry::new(build.id, LogLevel::Info, "starting")];
        db.create_build_logs_batch(&logs).unwrap();

        let stored_events = db.list_build_events(build.id).unwrap();
        assert_eq!(stored_events.len(), 2);
        let stored_logs = db.list_build_logs(build.id).unwrap();
        assert_eq!(stored_logs.len(), 1);
        assert_eq!(stored_logs[0].message, "starting");
    }

    #[tokio::test]
    async fn db_handle_create_and_get_build() {
        let handle = DbHandle::new_in_memory().unwrap();
        let build = Build::new("owner-1", "spec");
        handle.create_build(&build).await.unwrap();
        let fetched = handle.get_build(build.id).await.unwrap().unwrap();
        assert_eq!(fetched.id, build.id);
    }
}
