//! Task lifecycle actions: notify, start, complete, skip, expire.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::TaskError;
use crate::schedule::model::{TaskInstance, TaskStatus};
use crate::store::Database;

/// Attempts per transition before reporting a conflict.
const TRANSITION_ATTEMPTS: usize = 2;

/// Applies user and system actions to task instances.
pub struct TaskLifecycle {
    store: Arc<dyn Database>,
}

impl TaskLifecycle {
    pub fn new(store: Arc<dyn Database>) -> Self {
        Self { store }
    }

    async fn load(&self, id: Uuid) -> Result<TaskInstance, TaskError> {
        self.store
            .get_task_instance(id)
            .await?
            .ok_or(TaskError::NotFound { id })
    }

    /// Compare-and-set transition, re-reading once if another writer got in first.
    async fn transition(&self, id: Uuid, target: TaskStatus) -> Result<TaskInstance, TaskError> {
        for _ in 0..TRANSITION_ATTEMPTS {
            let task = self.load(id).await?;
            if task.status == TaskStatus::Completed && target == TaskStatus::Completed {
                return Ok(task);
            }
            if !task.status.can_transition_to(target) {
                return Err(TaskError::InvalidTransition {
                    id,
                    state: task.status.to_string(),
                    target: target.to_string(),
                });
            }
            if self
                .store
                .transition_task_instance(id, task.status, target, Utc::now())
                .await?
            {
                info!(task_id = %id, from = %task.status, to = %target, "Task transitioned");
                return self.load(id).await;
            }
            debug!(task_id = %id, to = %target, "Task changed underneath, re-reading");
        }
        Err(TaskError::Conflict { id })
    }

    /// `SCHEDULED → NOTIFIED`.
    pub async fn mark_notified(&self, id: Uuid) -> Result<TaskInstance, TaskError> {
        self.transition(id, TaskStatus::Notified).await
    }

    /// Only scheduled or notified tasks can be started.
    pub async fn start_task(&self, id: Uuid) -> Result<TaskInstance, TaskError> {
        self.transition(id, TaskStatus::Started).await
    }

    /// Complete from any open state. Completing twice is a no-op.
    pub async fn complete_task(&self, id: Uuid) -> Result<TaskInstance, TaskError> {
        self.transition(id, TaskStatus::Completed).await
    }

    pub async fn skip_task(&self, id: Uuid) -> Result<TaskInstance, TaskError> {
        self.transition(id, TaskStatus::Skipped).await
    }

    /// Expire open tasks whose slot ended more than `grace` before `now`.
    pub async fn expire_overdue(&self, now: DateTime<Utc>, grace: Duration) -> Result<u64, TaskError> {
        let grace = chrono::Duration::from_std(grace).unwrap_or(chrono::Duration::zero());
        let expired = self.store.expire_task_instances(now - grace, now).await?;
        if expired > 0 {
            info!(expired, "Expired overdue tasks");
        }
        Ok(expired)
    }
}

#[cfg(test)]
mod tests {
    use chrono::{Duration as ChronoDuration, NaiveDate, TimeZone};

    use super::*;
    use crate::schedule::preferences::WindowSlot;
    use crate::store::LibSqlBackend;

    async fn setup() -> (Arc<dyn Database>, TaskLifecycle) {
        let db: Arc<dyn Database> = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        (Arc::clone(&db), TaskLifecycle::new(db))
    }

    async fn seed(db: &Arc<dyn Database>, slot: WindowSlot, start: DateTime<Utc>) -> Uuid {
        let day = start.date_naive();
        let task = TaskInstance {
            id: TaskInstance::idempotency_id("u1", slot, day),
            user_id: "u1".into(),
            template_key: "first_breath".into(),
            slot,
            local_date: day,
            scheduled_at: start,
            scheduled_end: start + ChronoDuration::hours(1),
            duration_minutes: 5,
            personalization: serde_json::json!({}),
            status: TaskStatus::Scheduled,
            forced: false,
            started_at: None,
            completed_at: None,
            created_at: start,
            updated_at: start,
        };
        db.insert_task_instance(&task).await.unwrap();
        task.id
    }

    fn at(d: u32, h: u32) -> DateTime<Utc> {
        Utc.from_utc_datetime(&NaiveDate::from_ymd_opt(2024, 3, d).unwrap().and_hms_opt(h, 0, 0).unwrap())
    }

    #[tokio::test]
    async fn start_then_complete() {
        let (db, lifecycle) = setup().await;
        let id = seed(&db, WindowSlot::Morning, at(10, 7)).await;

        let task = lifecycle.mark_notified(id).await.unwrap();
        assert_eq!(task.status, TaskStatus::Notified);
        let task = lifecycle.start_task(id).await.unwrap();
        assert_eq!(task.status, TaskStatus::Started);
        assert!(task.started_at.is_some());

        let err = lifecycle.start_task(id).await.unwrap_err();
        assert!(matches!(err, TaskError::InvalidTransition { .. }));

        let done = lifecycle.complete_task(id).await.unwrap();
        assert_eq!(done.status, TaskStatus::Completed);
        let completed_at = done.completed_at.unwrap();

        // Second completion is a no-op.
        let again = lifecycle.complete_task(id).await.unwrap();
        assert_eq!(again.completed_at, Some(completed_at));
    }

    #[tokio::test]
    async fn complete_directly_from_scheduled() {
        let (db, lifecycle) = setup().await;
        let id = seed(&db, WindowSlot::Evening, at(10, 18)).await;
        let task = lifecycle.complete_task(id).await.unwrap();
        assert_eq!(task.status, TaskStatus::Completed);
        assert!(task.started_at.is_none());
    }

    #[tokio::test]
    async fn skipped_task_cannot_start_or_complete() {
        let (db, lifecycle) = setup().await;
        let id = seed(&db, WindowSlot::Morning, at(10, 7)).await;
        lifecycle.skip_task(id).await.unwrap();
        assert!(matches!(lifecycle.start_task(id).await, Err(TaskError::InvalidTransition { .. })));
        assert!(matches!(lifecycle.complete_task(id).await, Err(TaskError::InvalidTransition { .. })));
    }

    #[tokio::test]
    async fn unknown_task_is_not_found() {
        let (_db, lifecycle) = setup().await;
        let err = lifecycle.start_task(Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(err, TaskError::NotFound { .. }));
    }

    #[tokio::test]
    async fn expire_respects_grace() {
        let (db, lifecycle) = setup().await;
        let id = seed(&db, WindowSlot::Morning, at(10, 7)).await;
        let grace = Duration::from_secs(6 * 3600);

        // Ended 08:00, grace runs to 14:00.
        assert_eq!(lifecycle.expire_overdue(at(10, 13), grace).await.unwrap(), 0);
        assert_eq!(lifecycle.expire_overdue(at(10, 14), grace).await.unwrap(), 1);
        let task = db.get_task_instance(id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Expired);
        assert!(matches!(lifecycle.complete_task(id).await, Err(TaskError::InvalidTransition { .. })));
    }
}
