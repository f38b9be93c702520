//! Unified `Database` trait — single async interface for all persistence.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use uuid::Uuid;

use crate::error::DatabaseError;
use crate::jobs::model::{JobRecord, JobRun, JobStatus};
use crate::schedule::model::{TaskInstance, TaskStatus, UserProfile};
use crate::schedule::preferences::WindowSlot;
use crate::streaks::model::{Habit, HabitEntry};

/// Backend-agnostic database trait covering users, tasks, jobs, and habits.
#[async_trait]
pub trait Database: Send + Sync {
    /// Run all pending schema migrations.
    async fn run_migrations(&self) -> Result<(), DatabaseError>;

    // ── Users ───────────────────────────────────────────────────────

    /// Insert or replace a user profile.
    async fn upsert_user(&self, user: &UserProfile) -> Result<(), DatabaseError>;

    async fn get_user(&self, id: &str) -> Result<Option<UserProfile>, DatabaseError>;

    async fn list_active_users(&self) -> Result<Vec<UserProfile>, DatabaseError>;

    // ── Task instances ──────────────────────────────────────────────

    /// Whether any instance (forced or not) exists for the idempotency key.
    async fn task_instance_exists(
        &self,
        user_id: &str,
        slot: WindowSlot,
        local_date: NaiveDate,
    ) -> Result<bool, DatabaseError>;

    /// Insert an instance. Returns `false` when the idempotency key was
    /// already taken (lost race), in which case nothing is written.
    async fn insert_task_instance(&self, task: &TaskInstance) -> Result<bool, DatabaseError>;

    async fn get_task_instance(&self, id: Uuid) -> Result<Option<TaskInstance>, DatabaseError>;

    /// Instances for a user whose local date is in `[from, to]`, ordered by start.
    async fn list_task_instances(
        &self,
        user_id: &str,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<Vec<TaskInstance>, DatabaseError>;

    /// Compare-and-set status change. Returns `false` when the stored
    /// status is no longer `from`.
    async fn transition_task_instance(
        &self,
        id: Uuid,
        from: TaskStatus,
        to: TaskStatus,
        at: DateTime<Utc>,
    ) -> Result<bool, DatabaseError>;

    /// Expire every scheduled/notified instance that ended at or before `ended_before`.
    async fn expire_task_instances(
        &self,
        ended_before: DateTime<Utc>,
        at: DateTime<Utc>,
    ) -> Result<u64, DatabaseError>;

    // ── Jobs ────────────────────────────────────────────────────────

    /// Create the record in `idle` if it does not exist yet, then return it.
    async fn ensure_job_record(&self, name: &str) -> Result<JobRecord, DatabaseError>;

    async fn get_job_record(&self, name: &str) -> Result<Option<JobRecord>, DatabaseError>;

    /// Atomically move a job to `running` under `run_id`.
    ///
    /// Succeeds when the record is idle or failed, completed at or before
    /// `recent_cutoff`, or running since at or before `stale_cutoff`.
    /// Records a run history row on success.
    async fn try_claim_job(
        &self,
        name: &str,
        run_id: Uuid,
        now: DateTime<Utc>,
        recent_cutoff: DateTime<Utc>,
        stale_cutoff: DateTime<Utc>,
    ) -> Result<bool, DatabaseError>;

    /// Persist the outcome of `run_id`. Returns `false` if the run was
    /// taken over in the meantime; its history row is finished regardless.
    async fn finish_job(
        &self,
        name: &str,
        run_id: Uuid,
        status: JobStatus,
        result: Option<&serde_json::Value>,
        error: Option<&str>,
        at: DateTime<Utc>,
    ) -> Result<bool, DatabaseError>;

    /// Most recent runs first.
    async fn list_job_runs(&self, name: &str, limit: u32) -> Result<Vec<JobRun>, DatabaseError>;

    // ── Habits ──────────────────────────────────────────────────────

    async fn insert_habit(&self, habit: &Habit) -> Result<(), DatabaseError>;

    async fn get_habit(&self, id: Uuid) -> Result<Option<Habit>, DatabaseError>;

    async fn list_active_habits(&self) -> Result<Vec<Habit>, DatabaseError>;

    /// Zero the streak if it still equals `expected`.
    async fn reset_streak(
        &self,
        id: Uuid,
        expected: u32,
        at: DateTime<Utc>,
    ) -> Result<bool, DatabaseError>;

    async fn set_last_completed_at(
        &self,
        id: Uuid,
        last_completed_at: DateTime<Utc>,
        at: DateTime<Utc>,
    ) -> Result<(), DatabaseError>;

    /// Write a recomputed streak. `longest_streak` never decreases.
    async fn update_habit_progress(
        &self,
        id: Uuid,
        streak: u32,
        last_completed_at: Option<DateTime<Utc>>,
        at: DateTime<Utc>,
    ) -> Result<(), DatabaseError>;

    async fn get_habit_entry(
        &self,
        habit_id: Uuid,
        date: NaiveDate,
    ) -> Result<Option<HabitEntry>, DatabaseError>;

    /// Insert unless an entry already exists for (habit, date).
    async fn insert_habit_entry(&self, entry: &HabitEntry) -> Result<bool, DatabaseError>;

    /// Create or update the entry for (habit, date) and return it.
    async fn upsert_habit_entry_completion(
        &self,
        habit_id: Uuid,
        date: NaiveDate,
        completed: bool,
        notes: Option<&str>,
        at: DateTime<Utc>,
    ) -> Result<HabitEntry, DatabaseError>;

    /// Entries in `[from, to]`, newest first.
    async fn list_habit_entries(
        &self,
        habit_id: Uuid,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<Vec<HabitEntry>, DatabaseError>;
}
