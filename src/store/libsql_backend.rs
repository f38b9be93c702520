//! libSQL backend — async `Database` trait implementation.
//!
//! Supports local file and in-memory databases. Timestamps are written as
//! fixed-width RFC 3339 UTC strings (microsecond precision, `Z` suffix) so
//! that SQL text comparison orders them chronologically.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, SecondsFormat, Utc};
use libsql::{Connection, Database as LibSqlDatabase, params};
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::DatabaseError;
use crate::jobs::model::{JobRecord, JobRun, JobStatus};
use crate::schedule::model::{TaskInstance, TaskStatus, UserProfile};
use crate::schedule::preferences::WindowSlot;
use crate::store::migrations;
use crate::store::traits::Database;
use crate::streaks::model::{Habit, HabitEntry};

/// libSQL database backend.
///
/// Stores a single connection that is reused for all operations.
/// `libsql::Connection` is `Send + Sync` and safe for concurrent async use.
pub struct LibSqlBackend {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
}

impl LibSqlBackend {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Pool(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to open libSQL database: {e}")))?;

        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;

        let backend = Self {
            db: Arc::new(db),
            conn,
        };
        backend.run_migrations().await?;
        info!(path = %path.display(), "Database opened");
        Ok(backend)
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                DatabaseError::Pool(format!("Failed to create in-memory database: {e}"))
            })?;

        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;

        let backend = Self {
            db: Arc::new(db),
            conn,
        };
        backend.run_migrations().await?;
        Ok(backend)
    }

    /// Get the connection.
    fn conn(&self) -> &Connection {
        &self.conn
    }
}

// ── Helper functions ────────────────────────────────────────────────

/// Canonical timestamp write format.
fn fmt_ts(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn fmt_date(d: NaiveDate) -> String {
    d.format("%Y-%m-%d").to_string()
}

/// Parse an RFC 3339 or SQLite datetime string into DateTime<Utc>.
fn parse_datetime(s: &str) -> DateTime<Utc> {
    // Try RFC 3339 first (our canonical write format)
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return dt.with_timezone(&Utc);
    }
    // Try SQLite datetime() output with fractional seconds
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f") {
        return ndt.and_utc();
    }
    // Try SQLite datetime() output without fractional seconds
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S") {
        return ndt.and_utc();
    }
    DateTime::<Utc>::MIN_UTC
}

fn parse_optional_datetime(s: &Option<String>) -> Option<DateTime<Utc>> {
    s.as_ref().map(|s| parse_datetime(s))
}

fn parse_date(s: &str, ctx: &str) -> Result<NaiveDate, DatabaseError> {
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .map_err(|e| DatabaseError::Serialization(format!("{ctx}: bad date '{s}': {e}")))
}

fn parse_uuid(s: &str, ctx: &str) -> Result<Uuid, DatabaseError> {
    Uuid::parse_str(s).map_err(|e| DatabaseError::Serialization(format!("{ctx}: bad uuid '{s}': {e}")))
}

fn parse_json(s: Option<String>) -> Option<serde_json::Value> {
    s.and_then(|s| serde_json::from_str(&s).ok())
}

/// Convert `Option<&str>` to libsql Value.
fn opt_text(s: Option<&str>) -> libsql::Value {
    match s {
        Some(s) => libsql::Value::Text(s.to_string()),
        None => libsql::Value::Null,
    }
}

fn opt_ts(dt: Option<DateTime<Utc>>) -> libsql::Value {
    match dt {
        Some(dt) => libsql::Value::Text(fmt_ts(dt)),
        None => libsql::Value::Null,
    }
}

fn text(row: &libsql::Row, idx: i32, ctx: &str) -> Result<String, DatabaseError> {
    row.get::<String>(idx)
        .map_err(|e| DatabaseError::Query(format!("{ctx} col {idx}: {e}")))
}

fn int(row: &libsql::Row, idx: i32, ctx: &str) -> Result<i64, DatabaseError> {
    row.get::<i64>(idx)
        .map_err(|e| DatabaseError::Query(format!("{ctx} col {idx}: {e}")))
}

const USER_COLUMNS: &str = "id, house, class, preferences, active, created_at, updated_at";

fn row_to_user(row: &libsql::Row) -> Result<UserProfile, DatabaseError> {
    let created: String = text(row, 5, "user")?;
    let updated: String = text(row, 6, "user")?;
    Ok(UserProfile {
        id: text(row, 0, "user")?,
        house: row.get::<String>(1).ok().filter(|s| !s.is_empty()),
        class: row.get::<String>(2).ok().filter(|s| !s.is_empty()),
        preferences: row.get::<String>(3).ok(),
        active: int(row, 4, "user")? != 0,
        created_at: parse_datetime(&created),
        updated_at: parse_datetime(&updated),
    })
}

const TASK_COLUMNS: &str = "id, user_id, template_key, slot, local_date, scheduled_at, scheduled_end, \
     duration_minutes, personalization, status, forced, started_at, completed_at, created_at, updated_at";

fn row_to_task(row: &libsql::Row) -> Result<TaskInstance, DatabaseError> {
    let id: String = text(row, 0, "task")?;
    let slot: String = text(row, 3, "task")?;
    let local_date: String = text(row, 4, "task")?;
    let scheduled_at: String = text(row, 5, "task")?;
    let scheduled_end: String = text(row, 6, "task")?;
    let status: String = text(row, 9, "task")?;
    let started: Option<String> = row.get(11).ok();
    let completed: Option<String> = row.get(12).ok();
    let created: String = text(row, 13, "task")?;
    let updated: String = text(row, 14, "task")?;

    Ok(TaskInstance {
        id: parse_uuid(&id, "task.id")?,
        user_id: text(row, 1, "task")?,
        template_key: text(row, 2, "task")?,
        slot: slot
            .parse()
            .map_err(|e: String| DatabaseError::Serialization(format!("task.slot: {e}")))?,
        local_date: parse_date(&local_date, "task.local_date")?,
        scheduled_at: parse_datetime(&scheduled_at),
        scheduled_end: parse_datetime(&scheduled_end),
        duration_minutes: int(row, 7, "task")?.max(0) as u32,
        personalization: parse_json(row.get(8).ok()).unwrap_or(serde_json::Value::Null),
        status: status
            .parse()
            .map_err(|e: String| DatabaseError::Serialization(format!("task.status: {e}")))?,
        forced: int(row, 10, "task")? != 0,
        started_at: parse_optional_datetime(&started),
        completed_at: parse_optional_datetime(&completed),
        created_at: parse_datetime(&created),
        updated_at: parse_datetime(&updated),
    })
}

const JOB_COLUMNS: &str =
    "name, status, last_run_at, run_id, run_count, result, error, created_at, updated_at";

fn row_to_job(row: &libsql::Row) -> Result<JobRecord, DatabaseError> {
    let status: String = text(row, 1, "job")?;
    let last_run: Option<String> = row.get(2).ok();
    let run_id: Option<String> = row.get(3).ok();
    let created: String = text(row, 7, "job")?;
    let updated: String = text(row, 8, "job")?;

    Ok(JobRecord {
        name: text(row, 0, "job")?,
        status: status
            .parse()
            .map_err(|e: String| DatabaseError::Serialization(format!("job.status: {e}")))?,
        last_run_at: parse_optional_datetime(&last_run),
        run_id: run_id.map(|s| parse_uuid(&s, "job.run_id")).transpose()?,
        run_count: int(row, 4, "job")?,
        result: parse_json(row.get(5).ok()),
        error: row.get(6).ok(),
        created_at: parse_datetime(&created),
        updated_at: parse_datetime(&updated),
    })
}

const RUN_COLUMNS: &str = "id, job_name, status, started_at, finished_at, result, error";

fn row_to_run(row: &libsql::Row) -> Result<JobRun, DatabaseError> {
    let id: String = text(row, 0, "job_run")?;
    let status: String = text(row, 2, "job_run")?;
    let started: String = text(row, 3, "job_run")?;
    let finished: Option<String> = row.get(4).ok();

    Ok(JobRun {
        id: parse_uuid(&id, "job_run.id")?,
        job_name: text(row, 1, "job_run")?,
        status: status
            .parse()
            .map_err(|e: String| DatabaseError::Serialization(format!("job_run.status: {e}")))?,
        started_at: parse_datetime(&started),
        finished_at: parse_optional_datetime(&finished),
        result: parse_json(row.get(5).ok()),
        error: row.get(6).ok(),
    })
}

const HABIT_COLUMNS: &str = "id, user_id, name, timezone, streak, longest_streak, last_completed_at, \
     active, created_at, updated_at";

fn row_to_habit(row: &libsql::Row) -> Result<Habit, DatabaseError> {
    let id: String = text(row, 0, "habit")?;
    let last: Option<String> = row.get(6).ok();
    let created: String = text(row, 8, "habit")?;
    let updated: String = text(row, 9, "habit")?;

    Ok(Habit {
        id: parse_uuid(&id, "habit.id")?,
        user_id: text(row, 1, "habit")?,
        name: text(row, 2, "habit")?,
        timezone: text(row, 3, "habit")?,
        streak: int(row, 4, "habit")?.max(0) as u32,
        longest_streak: int(row, 5, "habit")?.max(0) as u32,
        last_completed_at: parse_optional_datetime(&last),
        active: int(row, 7, "habit")? != 0,
        created_at: parse_datetime(&created),
        updated_at: parse_datetime(&updated),
    })
}

const ENTRY_COLUMNS: &str = "id, habit_id, entry_date, completed, notes, created_at, updated_at";

fn row_to_entry(row: &libsql::Row) -> Result<HabitEntry, DatabaseError> {
    let id: String = text(row, 0, "habit_entry")?;
    let habit_id: String = text(row, 1, "habit_entry")?;
    let date: String = text(row, 2, "habit_entry")?;
    let created: String = text(row, 5, "habit_entry")?;
    let updated: String = text(row, 6, "habit_entry")?;

    Ok(HabitEntry {
        id: parse_uuid(&id, "habit_entry.id")?,
        habit_id: parse_uuid(&habit_id, "habit_entry.habit_id")?,
        entry_date: parse_date(&date, "habit_entry.entry_date")?,
        completed: int(row, 3, "habit_entry")? != 0,
        notes: row.get(4).ok(),
        created_at: parse_datetime(&created),
        updated_at: parse_datetime(&updated),
    })
}

#[async_trait]
impl Database for LibSqlBackend {
    async fn run_migrations(&self) -> Result<(), DatabaseError> {
        migrations::run_migrations(self.conn()).await
    }

    // ── Users ───────────────────────────────────────────────────────

    async fn upsert_user(&self, user: &UserProfile) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "INSERT INTO users (id, house, class, preferences, active, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                 ON CONFLICT(id) DO UPDATE SET
                    house = excluded.house,
                    class = excluded.class,
                    preferences = excluded.preferences,
                    active = excluded.active,
                    updated_at = excluded.updated_at",
                params![
                    user.id.as_str(),
                    opt_text(user.house.as_deref()),
                    opt_text(user.class.as_deref()),
                    opt_text(user.preferences.as_deref()),
                    user.active as i64,
                    fmt_ts(user.created_at),
                    fmt_ts(user.updated_at),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("upsert_user: {e}")))?;
        debug!(user_id = %user.id, "User upserted");
        Ok(())
    }

    async fn get_user(&self, id: &str) -> Result<Option<UserProfile>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {USER_COLUMNS} FROM users WHERE id = ?1"),
                params![id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_user: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_user(&row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("get_user row: {e}"))),
        }
    }

    async fn list_active_users(&self) -> Result<Vec<UserProfile>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {USER_COLUMNS} FROM users WHERE active = 1 ORDER BY id"),
                (),
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_active_users: {e}")))?;

        let mut users = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("list_active_users row: {e}")))?
        {
            users.push(row_to_user(&row)?);
        }
        Ok(users)
    }

    // ── Task instances ──────────────────────────────────────────────

    async fn task_instance_exists(
        &self,
        user_id: &str,
        slot: WindowSlot,
        local_date: NaiveDate,
    ) -> Result<bool, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT 1 FROM task_instances WHERE user_id = ?1 AND slot = ?2 AND local_date = ?3 LIMIT 1",
                params![user_id, slot.as_str(), fmt_date(local_date)],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("task_instance_exists: {e}")))?;

        rows.next()
            .await
            .map(|row| row.is_some())
            .map_err(|e| DatabaseError::Query(format!("task_instance_exists row: {e}")))
    }

    async fn insert_task_instance(&self, task: &TaskInstance) -> Result<bool, DatabaseError> {
        let personalization = serde_json::to_string(&task.personalization)
            .map_err(|e| DatabaseError::Serialization(format!("task.personalization: {e}")))?;

        let inserted = self
            .conn()
            .execute(
                &format!(
                    "INSERT OR IGNORE INTO task_instances ({TASK_COLUMNS})
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)"
                ),
                params![
                    task.id.to_string(),
                    task.user_id.as_str(),
                    task.template_key.as_str(),
                    task.slot.as_str(),
                    fmt_date(task.local_date),
                    fmt_ts(task.scheduled_at),
                    fmt_ts(task.scheduled_end),
                    task.duration_minutes as i64,
                    personalization,
                    task.status.as_str(),
                    task.forced as i64,
                    opt_ts(task.started_at),
                    opt_ts(task.completed_at),
                    fmt_ts(task.created_at),
                    fmt_ts(task.updated_at),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("insert_task_instance: {e}")))?;

        Ok(inserted > 0)
    }

    async fn get_task_instance(&self, id: Uuid) -> Result<Option<TaskInstance>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {TASK_COLUMNS} FROM task_instances WHERE id = ?1"),
                params![id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_task_instance: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_task(&row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("get_task_instance row: {e}"))),
        }
    }

    async fn list_task_instances(
        &self,
        user_id: &str,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<Vec<TaskInstance>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {TASK_COLUMNS} FROM task_instances
                     WHERE user_id = ?1 AND local_date >= ?2 AND local_date <= ?3
                     ORDER BY scheduled_at ASC, created_at ASC"
                ),
                params![user_id, fmt_date(from), fmt_date(to)],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_task_instances: {e}")))?;

        let mut tasks = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("list_task_instances row: {e}")))?
        {
            tasks.push(row_to_task(&row)?);
        }
        Ok(tasks)
    }

    async fn transition_task_instance(
        &self,
        id: Uuid,
        from: TaskStatus,
        to: TaskStatus,
        at: DateTime<Utc>,
    ) -> Result<bool, DatabaseError> {
        let ts = fmt_ts(at);
        let started = (to == TaskStatus::Started).then(|| ts.clone());
        let completed = (to == TaskStatus::Completed).then(|| ts.clone());

        let changed = self
            .conn()
            .execute(
                "UPDATE task_instances
                 SET status = ?3,
                     started_at = COALESCE(?4, started_at),
                     completed_at = COALESCE(?5, completed_at),
                     updated_at = ?6
                 WHERE id = ?1 AND status = ?2",
                params![
                    id.to_string(),
                    from.as_str(),
                    to.as_str(),
                    opt_text(started.as_deref()),
                    opt_text(completed.as_deref()),
                    ts,
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("transition_task_instance: {e}")))?;

        Ok(changed > 0)
    }

    async fn expire_task_instances(
        &self,
        ended_before: DateTime<Utc>,
        at: DateTime<Utc>,
    ) -> Result<u64, DatabaseError> {
        self.conn()
            .execute(
                "UPDATE task_instances SET status = 'expired', updated_at = ?2
                 WHERE status IN ('scheduled', 'notified') AND scheduled_end <= ?1",
                params![fmt_ts(ended_before), fmt_ts(at)],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("expire_task_instances: {e}")))
    }

    // ── Jobs ────────────────────────────────────────────────────────

    async fn ensure_job_record(&self, name: &str) -> Result<JobRecord, DatabaseError> {
        let now = fmt_ts(Utc::now());
        self.conn()
            .execute(
                "INSERT OR IGNORE INTO job_records (name, status, run_count, created_at, updated_at)
                 VALUES (?1, 'idle', 0, ?2, ?2)",
                params![name, now],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("ensure_job_record: {e}")))?;

        self.get_job_record(name)
            .await?
            .ok_or_else(|| DatabaseError::NotFound {
                entity: "job_record".into(),
                id: name.to_string(),
            })
    }

    async fn get_job_record(&self, name: &str) -> Result<Option<JobRecord>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {JOB_COLUMNS} FROM job_records WHERE name = ?1"),
                params![name],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_job_record: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_job(&row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("get_job_record row: {e}"))),
        }
    }

    async fn try_claim_job(
        &self,
        name: &str,
        run_id: Uuid,
        now: DateTime<Utc>,
        recent_cutoff: DateTime<Utc>,
        stale_cutoff: DateTime<Utc>,
    ) -> Result<bool, DatabaseError> {
        let conn = self.conn();
        let now = fmt_ts(now);

        let claimed = conn
            .execute(
                "UPDATE job_records
                 SET status = 'running', run_id = ?2, last_run_at = ?3,
                     run_count = run_count + 1, error = NULL, updated_at = ?3
                 WHERE name = ?1 AND (
                    status IN ('idle', 'failed')
                    OR (status = 'completed' AND (last_run_at IS NULL OR last_run_at <= ?4))
                    OR (status = 'running' AND (last_run_at IS NULL OR last_run_at <= ?5))
                 )",
                params![
                    name,
                    run_id.to_string(),
                    now.as_str(),
                    fmt_ts(recent_cutoff),
                    fmt_ts(stale_cutoff),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("try_claim_job: {e}")))?;

        if claimed == 0 {
            return Ok(false);
        }

        conn.execute(
            "INSERT INTO job_runs (id, job_name, status, started_at) VALUES (?1, ?2, 'running', ?3)",
            params![run_id.to_string(), name, now],
        )
        .await
        .map_err(|e| DatabaseError::Query(format!("try_claim_job run: {e}")))?;

        Ok(true)
    }

    async fn finish_job(
        &self,
        name: &str,
        run_id: Uuid,
        status: JobStatus,
        result: Option<&serde_json::Value>,
        error: Option<&str>,
        at: DateTime<Utc>,
    ) -> Result<bool, DatabaseError> {
        let conn = self.conn();
        let result = result.map(|v| v.to_string());
        let at = fmt_ts(at);

        let updated = conn
            .execute(
                "UPDATE job_records SET status = ?3, result = ?4, error = ?5, updated_at = ?6
                 WHERE name = ?1 AND run_id = ?2 AND status = 'running'",
                params![
                    name,
                    run_id.to_string(),
                    status.as_str(),
                    opt_text(result.as_deref()),
                    opt_text(error),
                    at.as_str(),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("finish_job: {e}")))?;

        conn.execute(
            "UPDATE job_runs SET status = ?2, finished_at = ?3, result = ?4, error = ?5 WHERE id = ?1",
            params![
                run_id.to_string(),
                status.as_str(),
                at,
                opt_text(result.as_deref()),
                opt_text(error),
            ],
        )
        .await
        .map_err(|e| DatabaseError::Query(format!("finish_job run: {e}")))?;

        Ok(updated > 0)
    }

    async fn list_job_runs(&self, name: &str, limit: u32) -> Result<Vec<JobRun>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {RUN_COLUMNS} FROM job_runs WHERE job_name = ?1
                     ORDER BY started_at DESC LIMIT ?2"
                ),
                params![name, limit as i64],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_job_runs: {e}")))?;

        let mut runs = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("list_job_runs row: {e}")))?
        {
            runs.push(row_to_run(&row)?);
        }
        Ok(runs)
    }

    // ── Habits ──────────────────────────────────────────────────────

    async fn insert_habit(&self, habit: &Habit) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                &format!(
                    "INSERT INTO habits ({HABIT_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)"
                ),
                params![
                    habit.id.to_string(),
                    habit.user_id.as_str(),
                    habit.name.as_str(),
                    habit.timezone.as_str(),
                    habit.streak as i64,
                    habit.longest_streak as i64,
                    opt_ts(habit.last_completed_at),
                    habit.active as i64,
                    fmt_ts(habit.created_at),
                    fmt_ts(habit.updated_at),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("insert_habit: {e}")))?;
        Ok(())
    }

    async fn get_habit(&self, id: Uuid) -> Result<Option<Habit>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {HABIT_COLUMNS} FROM habits WHERE id = ?1"),
                params![id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_habit: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_habit(&row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("get_habit row: {e}"))),
        }
    }

    async fn list_active_habits(&self) -> Result<Vec<Habit>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {HABIT_COLUMNS} FROM habits WHERE active = 1 ORDER BY created_at"),
                (),
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_active_habits: {e}")))?;

        let mut habits = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("list_active_habits row: {e}")))?
        {
            habits.push(row_to_habit(&row)?);
        }
        Ok(habits)
    }

    async fn reset_streak(
        &self,
        id: Uuid,
        expected: u32,
        at: DateTime<Utc>,
    ) -> Result<bool, DatabaseError> {
        let changed = self
            .conn()
            .execute(
                "UPDATE habits SET streak = 0, updated_at = ?3 WHERE id = ?1 AND streak = ?2",
                params![id.to_string(), expected as i64, fmt_ts(at)],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("reset_streak: {e}")))?;
        Ok(changed > 0)
    }

    async fn set_last_completed_at(
        &self,
        id: Uuid,
        last_completed_at: DateTime<Utc>,
        at: DateTime<Utc>,
    ) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "UPDATE habits SET last_completed_at = ?2, updated_at = ?3 WHERE id = ?1",
                params![id.to_string(), fmt_ts(last_completed_at), fmt_ts(at)],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("set_last_completed_at: {e}")))?;
        Ok(())
    }

    async fn update_habit_progress(
        &self,
        id: Uuid,
        streak: u32,
        last_completed_at: Option<DateTime<Utc>>,
        at: DateTime<Utc>,
    ) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "UPDATE habits
                 SET streak = ?2, longest_streak = MAX(longest_streak, ?2),
                     last_completed_at = ?3, updated_at = ?4
                 WHERE id = ?1",
                params![
                    id.to_string(),
                    streak as i64,
                    opt_ts(last_completed_at),
                    fmt_ts(at),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("update_habit_progress: {e}")))?;
        Ok(())
    }

    async fn get_habit_entry(
        &self,
        habit_id: Uuid,
        date: NaiveDate,
    ) -> Result<Option<HabitEntry>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {ENTRY_COLUMNS} FROM habit_entries WHERE habit_id = ?1 AND entry_date = ?2"
                ),
                params![habit_id.to_string(), fmt_date(date)],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_habit_entry: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_entry(&row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("get_habit_entry row: {e}"))),
        }
    }

    async fn insert_habit_entry(&self, entry: &HabitEntry) -> Result<bool, DatabaseError> {
        let inserted = self
            .conn()
            .execute(
                &format!(
                    "INSERT OR IGNORE INTO habit_entries ({ENTRY_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)"
                ),
                params![
                    entry.id.to_string(),
                    entry.habit_id.to_string(),
                    fmt_date(entry.entry_date),
                    entry.completed as i64,
                    opt_text(entry.notes.as_deref()),
                    fmt_ts(entry.created_at),
                    fmt_ts(entry.updated_at),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("insert_habit_entry: {e}")))?;
        Ok(inserted > 0)
    }

    async fn upsert_habit_entry_completion(
        &self,
        habit_id: Uuid,
        date: NaiveDate,
        completed: bool,
        notes: Option<&str>,
        at: DateTime<Utc>,
    ) -> Result<HabitEntry, DatabaseError> {
        let at_str = fmt_ts(at);
        self.conn()
            .execute(
                "INSERT INTO habit_entries (id, habit_id, entry_date, completed, notes, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)
                 ON CONFLICT(habit_id, entry_date) DO UPDATE SET
                    completed = excluded.completed,
                    notes = COALESCE(excluded.notes, habit_entries.notes),
                    updated_at = excluded.updated_at",
                params![
                    Uuid::new_v4().to_string(),
                    habit_id.to_string(),
                    fmt_date(date),
                    completed as i64,
                    opt_text(notes),
                    at_str,
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("upsert_habit_entry_completion: {e}")))?;

        self.get_habit_entry(habit_id, date)
            .await?
            .ok_or_else(|| DatabaseError::NotFound {
                entity: "habit_entry".into(),
                id: format!("{habit_id}/{date}"),
            })
    }

    async fn list_habit_entries(
        &self,
        habit_id: Uuid,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<Vec<HabitEntry>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {ENTRY_COLUMNS} FROM habit_entries
                     WHERE habit_id = ?1 AND entry_date >= ?2 AND entry_date <= ?3
                     ORDER BY entry_date DESC"
                ),
                params![habit_id.to_string(), fmt_date(from), fmt_date(to)],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_habit_entries: {e}")))?;

        let mut entries = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("list_habit_entries row: {e}")))?
        {
            entries.push(row_to_entry(&row)?);
        }
        Ok(entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use serde_json::json;

    async fn test_db() -> LibSqlBackend {
        LibSqlBackend::new_memory().await.unwrap()
    }

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn make_task(user: &str, slot: WindowSlot, day: NaiveDate, forced: bool) -> TaskInstance {
        let start = Utc.from_utc_datetime(&day.and_hms_opt(7, 0, 0).unwrap());
        let id = if forced {
            Uuid::new_v4()
        } else {
            TaskInstance::idempotency_id(user, slot, day)
        };
        TaskInstance {
            id,
            user_id: user.to_string(),
            template_key: "first_breath".into(),
            slot,
            local_date: day,
            scheduled_at: start,
            scheduled_end: start + Duration::hours(1),
            duration_minutes: 5,
            personalization: json!({"house": "MONK"}),
            status: TaskStatus::Scheduled,
            forced,
            started_at: None,
            completed_at: None,
            created_at: start,
            updated_at: start,
        }
    }

    // ── Users ───────────────────────────────────────────────────────

    #[tokio::test]
    async fn upsert_and_list_users() {
        let db = test_db().await;
        db.upsert_user(&UserProfile::new("u1", Some("MONK")).with_class("hermit"))
            .await
            .unwrap();
        let mut inactive = UserProfile::new("u2", None);
        inactive.active = false;
        db.upsert_user(&inactive).await.unwrap();

        let u1 = db.get_user("u1").await.unwrap().unwrap();
        assert_eq!(u1.house.as_deref(), Some("MONK"));
        assert_eq!(u1.class.as_deref(), Some("hermit"));
        assert!(u1.preferences.is_none());

        let active = db.list_active_users().await.unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].id, "u1");

        // Upsert replaces.
        db.upsert_user(&UserProfile::new("u1", Some("SAGE"))).await.unwrap();
        let u1 = db.get_user("u1").await.unwrap().unwrap();
        assert_eq!(u1.house.as_deref(), Some("SAGE"));
        assert!(db.get_user("missing").await.unwrap().is_none());
    }

    // ── Tasks ───────────────────────────────────────────────────────

    #[tokio::test]
    async fn insert_task_is_idempotent_per_key() {
        let db = test_db().await;
        let day = date(2024, 3, 10);
        let task = make_task("u1", WindowSlot::Morning, day, false);

        assert!(db.insert_task_instance(&task).await.unwrap());
        assert!(!db.insert_task_instance(&task).await.unwrap());
        assert!(db.task_instance_exists("u1", WindowSlot::Morning, day).await.unwrap());
        assert!(!db.task_instance_exists("u1", WindowSlot::Evening, day).await.unwrap());

        // A forced row lives alongside.
        let forced = make_task("u1", WindowSlot::Morning, day, true);
        assert!(db.insert_task_instance(&forced).await.unwrap());

        let tasks = db.list_task_instances("u1", day, day).await.unwrap();
        assert_eq!(tasks.len(), 2);

        let fetched = db.get_task_instance(task.id).await.unwrap().unwrap();
        assert_eq!(fetched.scheduled_at, task.scheduled_at);
        assert_eq!(fetched.personalization, json!({"house": "MONK"}));
        assert_eq!(fetched.local_date, day);
        assert!(!fetched.forced);
    }

    #[tokio::test]
    async fn transition_is_compare_and_set() {
        let db = test_db().await;
        let task = make_task("u1", WindowSlot::Morning, date(2024, 3, 10), false);
        db.insert_task_instance(&task).await.unwrap();
        let at = Utc.with_ymd_and_hms(2024, 3, 10, 7, 5, 0).unwrap();

        assert!(db
            .transition_task_instance(task.id, TaskStatus::Scheduled, TaskStatus::Started, at)
            .await
            .unwrap());
        assert!(!db
            .transition_task_instance(task.id, TaskStatus::Scheduled, TaskStatus::Started, at)
            .await
            .unwrap());

        let fetched = db.get_task_instance(task.id).await.unwrap().unwrap();
        assert_eq!(fetched.status, TaskStatus::Started);
        assert_eq!(fetched.started_at, Some(at));
        assert!(fetched.completed_at.is_none());
    }

    #[tokio::test]
    async fn expire_only_touches_open_overdue_tasks() {
        let db = test_db().await;
        let old = make_task("u1", WindowSlot::Morning, date(2024, 3, 9), false);
        let started = make_task("u1", WindowSlot::Evening, date(2024, 3, 9), false);
        let fresh = make_task("u1", WindowSlot::Morning, date(2024, 3, 11), false);
        for t in [&old, &started, &fresh] {
            db.insert_task_instance(t).await.unwrap();
        }
        db.transition_task_instance(started.id, TaskStatus::Scheduled, TaskStatus::Started, Utc::now())
            .await
            .unwrap();

        let cutoff = Utc.with_ymd_and_hms(2024, 3, 10, 0, 0, 0).unwrap();
        let n = db.expire_task_instances(cutoff, Utc::now()).await.unwrap();
        assert_eq!(n, 1);
        let old = db.get_task_instance(old.id).await.unwrap().unwrap();
        assert_eq!(old.status, TaskStatus::Expired);
        let fresh = db.get_task_instance(fresh.id).await.unwrap().unwrap();
        assert_eq!(fresh.status, TaskStatus::Scheduled);
    }

    // ── Jobs ────────────────────────────────────────────────────────

    #[tokio::test]
    async fn claim_guard_respects_interval_and_staleness() {
        let db = test_db().await;
        let record = db.ensure_job_record("nightly").await.unwrap();
        assert_eq!(record.status, JobStatus::Idle);
        assert_eq!(record.run_count, 0);

        let t0 = Utc.with_ymd_and_hms(2024, 3, 10, 0, 0, 0).unwrap();
        let hours = |h: i64| t0 + Duration::hours(h);
        let run1 = Uuid::new_v4();

        assert!(db.try_claim_job("nightly", run1, t0, t0 - Duration::hours(23), t0 - Duration::hours(1)).await.unwrap());

        // Running and fresh: not claimable.
        let run2 = Uuid::new_v4();
        let now = t0 + Duration::minutes(10);
        assert!(!db.try_claim_job("nightly", run2, now, now - Duration::hours(23), now - Duration::hours(1)).await.unwrap());

        // Finish, then too soon.
        assert!(db.finish_job("nightly", run1, JobStatus::Completed, Some(&json!({"n": 1})), None, now).await.unwrap());
        let now = hours(5);
        assert!(!db.try_claim_job("nightly", run2, now, now - Duration::hours(23), now - Duration::hours(1)).await.unwrap());

        // After the interval.
        let now = hours(24);
        assert!(db.try_claim_job("nightly", run2, now, now - Duration::hours(23), now - Duration::hours(1)).await.unwrap());

        // Stale running record is taken over.
        let run3 = Uuid::new_v4();
        let now = hours(26);
        assert!(db.try_claim_job("nightly", run3, now, now - Duration::hours(23), now - Duration::hours(1)).await.unwrap());

        // Superseded run cannot overwrite its successor.
        assert!(!db.finish_job("nightly", run2, JobStatus::Completed, None, None, now).await.unwrap());
        let record = db.get_job_record("nightly").await.unwrap().unwrap();
        assert_eq!(record.status, JobStatus::Running);
        assert_eq!(record.run_id, Some(run3));
        assert_eq!(record.run_count, 3);

        let runs = db.list_job_runs("nightly", 10).await.unwrap();
        assert_eq!(runs.len(), 3);
        assert_eq!(runs[0].id, run3);
        assert_eq!(runs[2].result, Some(json!({"n": 1})));
    }

    #[tokio::test]
    async fn failed_job_is_claimable_immediately() {
        let db = test_db().await;
        db.ensure_job_record("flaky").await.unwrap();
        let now = Utc::now();
        let run = Uuid::new_v4();
        db.try_claim_job("flaky", run, now, now - Duration::hours(23), now - Duration::hours(1)).await.unwrap();
        db.finish_job("flaky", run, JobStatus::Failed, None, Some("boom"), now).await.unwrap();

        let record = db.get_job_record("flaky").await.unwrap().unwrap();
        assert_eq!(record.error.as_deref(), Some("boom"));
        assert!(db.try_claim_job("flaky", Uuid::new_v4(), now, now - Duration::hours(23), now - Duration::hours(1)).await.unwrap());
        let record = db.get_job_record("flaky").await.unwrap().unwrap();
        assert!(record.error.is_none());
    }

    // ── Habits ──────────────────────────────────────────────────────

    #[tokio::test]
    async fn reset_streak_is_conditional() {
        let db = test_db().await;
        let mut habit = Habit::new("u1", "Meditate", "UTC");
        habit.streak = 5;
        habit.longest_streak = 5;
        db.insert_habit(&habit).await.unwrap();

        assert!(!db.reset_streak(habit.id, 4, Utc::now()).await.unwrap());
        assert!(db.reset_streak(habit.id, 5, Utc::now()).await.unwrap());
        let h = db.get_habit(habit.id).await.unwrap().unwrap();
        assert_eq!(h.streak, 0);
        assert_eq!(h.longest_streak, 5);
    }

    #[tokio::test]
    async fn habit_progress_keeps_longest() {
        let db = test_db().await;
        let mut habit = Habit::new("u1", "Read", "UTC");
        habit.longest_streak = 10;
        db.insert_habit(&habit).await.unwrap();

        db.update_habit_progress(habit.id, 3, None, Utc::now()).await.unwrap();
        let h = db.get_habit(habit.id).await.unwrap().unwrap();
        assert_eq!((h.streak, h.longest_streak), (3, 10));

        db.update_habit_progress(habit.id, 12, None, Utc::now()).await.unwrap();
        let h = db.get_habit(habit.id).await.unwrap().unwrap();
        assert_eq!((h.streak, h.longest_streak), (12, 12));
    }

    #[tokio::test]
    async fn habit_entries_unique_per_day() {
        let db = test_db().await;
        let habit = Habit::new("u1", "Walk", "UTC");
        db.insert_habit(&habit).await.unwrap();
        let day = date(2024, 5, 1);

        assert!(db.insert_habit_entry(&HabitEntry::placeholder(habit.id, day)).await.unwrap());
        assert!(!db.insert_habit_entry(&HabitEntry::placeholder(habit.id, day)).await.unwrap());

        let entry = db
            .upsert_habit_entry_completion(habit.id, day, true, Some("felt good"), Utc::now())
            .await
            .unwrap();
        assert!(entry.completed);
        assert_eq!(entry.notes.as_deref(), Some("felt good"));

        // Notes survive a toggle without notes.
        let entry = db
            .upsert_habit_entry_completion(habit.id, day, false, None, Utc::now())
            .await
            .unwrap();
        assert!(!entry.completed);
        assert_eq!(entry.notes.as_deref(), Some("felt good"));

        db.upsert_habit_entry_completion(habit.id, date(2024, 5, 2), true, None, Utc::now())
            .await
            .unwrap();
        let entries = db
            .list_habit_entries(habit.id, date(2024, 4, 1), date(2024, 5, 31))
            .await
            .unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].entry_date, date(2024, 5, 2));
    }

    #[tokio::test]
    async fn on_disk_database_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("practice.db");
        {
            let db = LibSqlBackend::new_local(&path).await.unwrap();
            db.upsert_user(&UserProfile::new("u1", Some("MONK"))).await.unwrap();
        }
        let db = LibSqlBackend::new_local(&path).await.unwrap();
        assert!(db.get_user("u1").await.unwrap().is_some());
    }
}
