//! Durable store for goals, plans, steps, and agent logs.
//!
//! SQLite-backed. A plan and its steps are created in one transaction that
//! also deactivates the previous active plan, so the one-active-plan
//! invariant and the no-partial-plan rule hold at the storage layer. All
//! async access goes through [`StoreHandle`], which runs the synchronous
//! SQLite work on tokio's blocking pool.

use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, Result, anyhow};
use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, Row, params};

use crate::model::{AgentLog, AgentRole, Goal, GoalStatus, Plan, Step, StepPriority, StepStatus};

/// Async-safe handle to the store.
///
/// Wraps `Store` behind `Arc<Mutex>` and runs all access on tokio's
/// blocking thread pool via `spawn_blocking`, preventing synchronous SQLite
/// I/O from tying up async worker threads.
#[derive(Clone)]
pub struct StoreHandle {
    inner: Arc<std::sync::Mutex<Store>>,
}

impl StoreHandle {
    pub fn new(store: Store) -> Self {
        Self {
            inner: Arc::new(std::sync::Mutex::new(store)),
        }
    }

    /// Run a closure with access to the store on a blocking thread.
    /// All data passed into `f` must be owned (`'static`).
    pub async fn call<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&Store) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let store = self.inner.clone();
        tokio::task::spawn_blocking(move || {
            let guard = store
                .lock()
                .map_err(|e| anyhow!("Store lock poisoned: {}", e))?;
            f(&guard)
        })
        .await
        .context("Store task panicked")?
    }
}

pub struct Store {
    conn: Connection,
}

impl Store {
    /// Open (or create) a SQLite database at the given path and run
    /// migrations plus the crash recovery sweep.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path).context("Failed to open SQLite database")?;
        let store = Self { conn };
        store.init()?;
        Ok(store)
    }

    /// Create an in-memory database (tests and one-shot runs).
    pub fn open_in_memory() -> Result<Self> {
        let conn =
            Connection::open_in_memory().context("Failed to open in-memory SQLite database")?;
        let store = Self { conn };
        store.init()?;
        Ok(store)
    }

    fn init(&self) -> Result<()> {
        self.conn
            .execute_batch("PRAGMA foreign_keys = ON;")
            .context("Failed to enable foreign keys")?;
        self.run_migrations().context("Failed to run migrations")?;
        Ok(())
    }

    fn run_migrations(&self) -> Result<()> {
        self.conn
            .execute_batch(
                "
                CREATE TABLE IF NOT EXISTS goals (
                    id TEXT PRIMARY KEY,
                    raw_input TEXT NOT NULL,
                    status TEXT NOT NULL DEFAULT 'received',
                    message TEXT,
                    active_plan_id TEXT,
                    created_at TEXT NOT NULL,
                    updated_at TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS plans (
                    id TEXT PRIMARY KEY,
                    goal_id TEXT NOT NULL REFERENCES goals(id) ON DELETE CASCADE,
                    version INTEGER NOT NULL,
                    is_active INTEGER NOT NULL DEFAULT 1,
                    created_at TEXT NOT NULL,
                    UNIQUE(goal_id, version)
                );

                CREATE TABLE IF NOT EXISTS steps (
                    id TEXT PRIMARY KEY,
                    plan_id TEXT NOT NULL REFERENCES plans(id) ON DELETE CASCADE,
                    key TEXT NOT NULL,
                    title TEXT NOT NULL,
                    description TEXT NOT NULL DEFAULT '',
                    expected_outcome TEXT NOT NULL DEFAULT '',
                    rationale TEXT NOT NULL DEFAULT '',
                    priority TEXT NOT NULL DEFAULT 'medium',
                    depends_on TEXT NOT NULL DEFAULT '[]',
                    capabilities TEXT NOT NULL DEFAULT '[]',
                    status TEXT NOT NULL DEFAULT 'pending',
                    result TEXT,
                    error TEXT,
                    retry_count INTEGER NOT NULL DEFAULT 0,
                    max_retries INTEGER NOT NULL DEFAULT 3,
                    started_at TEXT,
                    completed_at TEXT,
                    UNIQUE(plan_id, key)
                );

                CREATE TABLE IF NOT EXISTS agent_logs (
                    id TEXT PRIMARY KEY,
                    goal_id TEXT NOT NULL,
                    plan_id TEXT,
                    step_key TEXT,
                    role TEXT NOT NULL,
                    provider TEXT NOT NULL,
                    model TEXT NOT NULL,
                    prompt_summary TEXT NOT NULL DEFAULT '',
                    response_summary TEXT NOT NULL DEFAULT '',
                    tokens_in INTEGER NOT NULL DEFAULT 0,
                    tokens_out INTEGER NOT NULL DEFAULT 0,
                    latency_ms INTEGER NOT NULL DEFAULT 0,
                    error TEXT,
                    created_at TEXT NOT NULL
                );

                CREATE INDEX IF NOT EXISTS idx_plans_goal ON plans(goal_id);
                CREATE INDEX IF NOT EXISTS idx_steps_plan ON steps(plan_id);
                CREATE INDEX IF NOT EXISTS idx_agent_logs_goal ON agent_logs(goal_id);
                ",
            )
            .context("Failed to create tables")?;
        Ok(())
    }

    // ── Goals ─────────────────────────────────────────────────────────

    pub fn create_goal(&self, goal: &Goal) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO goals (id, raw_input, status, message, active_plan_id, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    goal.id,
                    goal.raw_input,
                    goal.status.as_str(),
                    goal.message,
                    goal.active_plan_id,
                    goal.created_at.to_rfc3339(),
                    goal.updated_at.to_rfc3339(),
                ],
            )
            .context("Failed to insert goal")?;
        Ok(())
    }

    pub fn get_goal(&self, id: &str) -> Result<Option<Goal>> {
        self.conn
            .query_row(
                "SELECT id, raw_input, status, message, active_plan_id, created_at, updated_at
                 FROM goals WHERE id = ?1",
                params![id],
                row_to_goal,
            )
            .optional()
            .context("Failed to query goal")
    }

    pub fn list_goals(&self) -> Result<Vec<Goal>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, raw_input, status, message, active_plan_id, created_at, updated_at
             FROM goals ORDER BY created_at DESC",
        )?;
        let rows = stmt.query_map([], row_to_goal)?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .context("Failed to list goals")
    }

    /// Update a goal's status, message, and (when given) active plan.
    /// The orchestrator is the only caller.
    pub fn update_goal_status(
        &self,
        id: &str,
        status: GoalStatus,
        message: Option<&str>,
        active_plan_id: Option<&str>,
    ) -> Result<Goal> {
        let changed = match active_plan_id {
            Some(plan_id) => self.conn.execute(
                "UPDATE goals SET status = ?2, message = ?3, active_plan_id = ?4, updated_at = ?5
                 WHERE id = ?1",
                params![id, status.as_str(), message, plan_id, Utc::now().to_rfc3339()],
            )?,
            None => self.conn.execute(
                "UPDATE goals SET status = ?2, message = ?3, updated_at = ?4 WHERE id = ?1",
                params![id, status.as_str(), message, Utc::now().to_rfc3339()],
            )?,
        };
        if changed == 0 {
            return Err(anyhow!("Goal {} not found", id));
        }
        self.get_goal(id)?
            .ok_or_else(|| anyhow!("Goal {} disappeared after update", id))
    }

    // ── Plans & steps ─────────────────────────────────────────────────

    /// Next plan version for a goal: strictly increasing from 1, no gaps.
    pub fn next_plan_version(&self, goal_id: &str) -> Result<i64> {
        let max: Option<i64> = self.conn.query_row(
            "SELECT MAX(version) FROM plans WHERE goal_id = ?1",
            params![goal_id],
            |row| row.get(0),
        )?;
        Ok(max.unwrap_or(0) + 1)
    }

    /// Atomically create a plan with all its steps, deactivating the
    /// previous active plan of the same goal. A plan becomes visible only
    /// once all its steps exist.
    pub fn create_plan(&self, plan: &Plan, steps: &[Step]) -> Result<()> {
        let tx = self
            .conn
            .unchecked_transaction()
            .context("Failed to begin plan transaction")?;

        tx.execute(
            "UPDATE plans SET is_active = 0 WHERE goal_id = ?1 AND is_active = 1",
            params![plan.goal_id],
        )?;
        tx.execute(
            "INSERT INTO plans (id, goal_id, version, is_active, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                plan.id,
                plan.goal_id,
                plan.version,
                plan.is_active as i64,
                plan.created_at.to_rfc3339(),
            ],
        )?;
        for step in steps {
            tx.execute(
                "INSERT INTO steps (id, plan_id, key, title, description, expected_outcome,
                                    rationale, priority, depends_on, capabilities, status,
                                    result, error, retry_count, max_retries, started_at, completed_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17)",
                params![
                    step.id,
                    step.plan_id,
                    step.key,
                    step.title,
                    step.description,
                    step.expected_outcome,
                    step.rationale,
                    step.priority.as_str(),
                    serde_json::to_string(&step.depends_on)?,
                    serde_json::to_string(&step.capabilities)?,
                    step.status.as_str(),
                    step.result
                        .as_ref()
                        .map(serde_json::to_string)
                        .transpose()?,
                    step.error,
                    step.retry_count,
                    step.max_retries,
                    step.started_at.map(|t| t.to_rfc3339()),
                    step.completed_at.map(|t| t.to_rfc3339()),
                ],
            )?;
        }

        tx.commit().context("Failed to commit plan transaction")
    }

    pub fn get_plan(&self, plan_id: &str) -> Result<Option<Plan>> {
        self.conn
            .query_row(
                "SELECT id, goal_id, version, is_active, created_at FROM plans WHERE id = ?1",
                params![plan_id],
                row_to_plan,
            )
            .optional()
            .context("Failed to query plan")
    }

    pub fn get_active_plan(&self, goal_id: &str) -> Result<Option<Plan>> {
        self.conn
            .query_row(
                "SELECT id, goal_id, version, is_active, created_at
                 FROM plans WHERE goal_id = ?1 AND is_active = 1",
                params![goal_id],
                row_to_plan,
            )
            .optional()
            .context("Failed to query active plan")
    }

    /// All plan versions for a goal, oldest first (immutable audit trail).
    pub fn plan_history(&self, goal_id: &str) -> Result<Vec<Plan>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, goal_id, version, is_active, created_at
             FROM plans WHERE goal_id = ?1 ORDER BY version ASC",
        )?;
        let rows = stmt.query_map(params![goal_id], row_to_plan)?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .context("Failed to query plan history")
    }

    pub fn get_steps(&self, plan_id: &str) -> Result<Vec<Step>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, plan_id, key, title, description, expected_outcome, rationale,
                    priority, depends_on, capabilities, status, result, error,
                    retry_count, max_retries, started_at, completed_at
             FROM steps WHERE plan_id = ?1 ORDER BY rowid ASC",
        )?;
        let rows = stmt.query_map(params![plan_id], |row| {
            row_to_step(row).map_err(|e| {
                rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, e.into())
            })
        })?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .context("Failed to query steps")
    }

    /// Persist one step transition: status, timestamps, and error/result
    /// fields in a single statement (atomic).
    pub fn update_step(&self, step: &Step) -> Result<()> {
        let changed = self.conn.execute(
            "UPDATE steps SET status = ?3, result = ?4, error = ?5, retry_count = ?6,
                    started_at = ?7, completed_at = ?8
             WHERE plan_id = ?1 AND key = ?2",
            params![
                step.plan_id,
                step.key,
                step.status.as_str(),
                step.result
                    .as_ref()
                    .map(serde_json::to_string)
                    .transpose()?,
                step.error,
                step.retry_count,
                step.started_at.map(|t| t.to_rfc3339()),
                step.completed_at.map(|t| t.to_rfc3339()),
            ],
        )?;
        if changed == 0 {
            return Err(anyhow!(
                "Step {} not found in plan {}",
                step.key,
                step.plan_id
            ));
        }
        Ok(())
    }

    // ── Agent logs ────────────────────────────────────────────────────

    pub fn append_log(&self, log: &AgentLog) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO agent_logs (id, goal_id, plan_id, step_key, role, provider, model,
                                         prompt_summary, response_summary, tokens_in, tokens_out,
                                         latency_ms, error, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
                params![
                    log.id,
                    log.goal_id,
                    log.plan_id,
                    log.step_key,
                    log.role.as_str(),
                    log.provider,
                    log.model,
                    log.prompt_summary,
                    log.response_summary,
                    log.tokens_in,
                    log.tokens_out,
                    log.latency_ms as i64,
                    log.error,
                    log.created_at.to_rfc3339(),
                ],
            )
            .context("Failed to append agent log")?;
        Ok(())
    }

    pub fn logs_for_goal(&self, goal_id: &str) -> Result<Vec<AgentLog>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, goal_id, plan_id, step_key, role, provider, model, prompt_summary,
                    response_summary, tokens_in, tokens_out, latency_ms, error, created_at
             FROM agent_logs WHERE goal_id = ?1 ORDER BY created_at ASC, rowid ASC",
        )?;
        let rows = stmt.query_map(params![goal_id], |row| {
            row_to_log(row).map_err(|e| {
                rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, e.into())
            })
        })?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .context("Failed to query agent logs")
    }

    pub fn count_logs_for_goal(&self, goal_id: &str) -> Result<i64> {
        self.conn
            .query_row(
                "SELECT COUNT(*) FROM agent_logs WHERE goal_id = ?1",
                params![goal_id],
                |row| row.get(0),
            )
            .context("Failed to count agent logs")
    }

    // ── Crash recovery ────────────────────────────────────────────────

    /// Steps left in_progress or evaluating by a previous process life are
    /// failures for retry accounting; a crashed transition must not leave
    /// a step permanently stuck. Returns the number of steps swept.
    pub fn recover_interrupted_steps(&self) -> Result<usize> {
        let swept = self.conn.execute(
            "UPDATE steps SET status = 'failed', error = 'interrupted: no terminal transition recorded before restart'
             WHERE status IN ('in_progress', 'evaluating')",
            [],
        )?;
        Ok(swept)
    }
}

// ── Row mapping ───────────────────────────────────────────────────────

fn parse_timestamp(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .with_context(|| format!("Invalid timestamp: {}", s))
}

fn row_to_goal(row: &Row<'_>) -> rusqlite::Result<Goal> {
    let status_str: String = row.get(2)?;
    let created_at: String = row.get(5)?;
    let updated_at: String = row.get(6)?;
    Ok(Goal {
        id: row.get(0)?,
        raw_input: row.get(1)?,
        status: GoalStatus::from_str(&status_str).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(2, rusqlite::types::Type::Text, e.into())
        })?,
        message: row.get(3)?,
        active_plan_id: row.get(4)?,
        created_at: parse_timestamp(&created_at).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(5, rusqlite::types::Type::Text, e.into())
        })?,
        updated_at: parse_timestamp(&updated_at).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(6, rusqlite::types::Type::Text, e.into())
        })?,
    })
}

fn row_to_plan(row: &Row<'_>) -> rusqlite::Result<Plan> {
    let created_at: String = row.get(4)?;
    Ok(Plan {
        id: row.get(0)?,
        goal_id: row.get(1)?,
        version: row.get(2)?,
        is_active: row.get::<_, i64>(3)? != 0,
        created_at: parse_timestamp(&created_at).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(4, rusqlite::types::Type::Text, e.into())
        })?,
    })
}

fn row_to_step(row: &Row<'_>) -> Result<Step> {
    let priority: String = row.get(7)?;
    let depends_on: String = row.get(8)?;
    let capabilities: String = row.get(9)?;
    let status: String = row.get(10)?;
    let result: Option<String> = row.get(11)?;
    let started_at: Option<String> = row.get(15)?;
    let completed_at: Option<String> = row.get(16)?;

    Ok(Step {
        id: row.get(0)?,
        plan_id: row.get(1)?,
        key: row.get(2)?,
        title: row.get(3)?,
        description: row.get(4)?,
        expected_outcome: row.get(5)?,
        rationale: row.get(6)?,
        priority: StepPriority::from_str(&priority).map_err(|e| anyhow!(e))?,
        depends_on: serde_json::from_str(&depends_on).context("Invalid depends_on column")?,
        capabilities: serde_json::from_str(&capabilities).context("Invalid capabilities column")?,
        status: StepStatus::from_str(&status).map_err(|e| anyhow!(e))?,
        result: result
            .map(|r| serde_json::from_str(&r))
            .transpose()
            .context("Invalid result column")?,
        error: row.get(12)?,
        retry_count: row.get(13)?,
        max_retries: row.get(14)?,
        started_at: started_at.as_deref().map(parse_timestamp).transpose()?,
        completed_at: completed_at.as_deref().map(parse_timestamp).transpose()?,
    })
}

fn row_to_log(row: &Row<'_>) -> Result<AgentLog> {
    let role: String = row.get(4)?;
    let created_at: String = row.get(13)?;
    Ok(AgentLog {
        id: row.get(0)?,
        goal_id: row.get(1)?,
        plan_id: row.get(2)?,
        step_key: row.get(3)?,
        role: AgentRole::from_str(&role).map_err(|e| anyhow!(e))?,
        provider: row.get(5)?,
        model: row.get(6)?,
        prompt_summary: row.get(7)?,
        response_summary: row.get(8)?,
        tokens_in: row.get(9)?,
        tokens_out: row.get(10)?,
        latency_ms: row.get::<_, i64>(11)? as u64,
        error: row.get(12)?,
        created_at: parse_timestamp(&created_at)?,
    })
}
