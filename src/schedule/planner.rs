//! Schedule generation — turns preferences and the template catalog into
//! concrete task instances, one per (user, window, local day).

use std::sync::Arc;

use chrono::{DateTime, Days, Duration, NaiveDate, Utc};
use futures::StreamExt;
use serde::Serialize;
use serde_json::json;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::civil;
use crate::config::ScheduleConfig;
use crate::error::ScheduleError;
use crate::schedule::model::{TaskInstance, TaskStatus, UserProfile};
use crate::schedule::preferences::{LocalTime, SchedulePreferences, WindowSlot, resolve_preferences};
use crate::schedule::templates::TemplateCatalog;
use crate::store::Database;

/// What happened to one (day, window) slot.
#[derive(Debug, Clone, PartialEq)]
pub enum SlotOutcome {
    Created(Box<TaskInstance>),
    /// An instance already holds the idempotency key.
    Exists,
    /// The candidate start fell inside a DND range.
    Suppressed,
    /// No window configured for the slot.
    Unconfigured,
}

/// Result of generating one user's schedule.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationReport {
    pub user_id: String,
    pub start_date: Option<NaiveDate>,
    pub days: u32,
    pub created: Vec<TaskInstance>,
    pub existing: u32,
    pub suppressed: u32,
    pub unconfigured: u32,
    /// Per-day failures that did not abort the run.
    pub errors: Vec<String>,
}

/// Result of the batch job across all active users.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchScheduleReport {
    pub users: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub tasks_created: usize,
    pub existing: u32,
    pub suppressed: u32,
    pub errors: Vec<String>,
}

/// Generates task instances.
pub struct Scheduler {
    store: Arc<dyn Database>,
    catalog: Arc<TemplateCatalog>,
    config: ScheduleConfig,
    max_workers: usize,
}

impl Scheduler {
    pub fn new(
        store: Arc<dyn Database>,
        catalog: Arc<TemplateCatalog>,
        config: ScheduleConfig,
        max_workers: usize,
    ) -> Self {
        Self {
            store,
            catalog,
            config,
            max_workers: max_workers.max(1),
        }
    }

    fn check_days(&self, days: u32) -> Result<(), ScheduleError> {
        if days == 0 || days > self.config.max_days {
            return Err(ScheduleError::InvalidRange(format!(
                "days must be between 1 and {}, got {days}",
                self.config.max_days
            )));
        }
        Ok(())
    }

    /// Generate `days` days of tasks for one user starting at a local date.
    pub async fn generate_schedule(
        &self,
        user_id: &str,
        start_date: NaiveDate,
        days: u32,
        force: bool,
    ) -> Result<GenerationReport, ScheduleError> {
        self.check_days(days)?;
        let user = self
            .store
            .get_user(user_id)
            .await?
            .ok_or_else(|| ScheduleError::UserNotFound {
                user_id: user_id.to_string(),
            })?;
        self.generate_for_user(&user, Some(start_date), days, force)
            .await
    }

    /// Generate for a loaded profile. Without a start date, begins at the
    /// user's local today.
    pub async fn generate_for_user(
        &self,
        user: &UserProfile,
        start_date: Option<NaiveDate>,
        days: u32,
        force: bool,
    ) -> Result<GenerationReport, ScheduleError> {
        self.check_days(days)?;

        let house = user
            .house
            .as_deref()
            .map(str::trim)
            .filter(|h| !h.is_empty())
            .ok_or_else(|| ScheduleError::MissingAssignment {
                user_id: user.id.clone(),
            })?;
        if !self.catalog.has_house(house) {
            return Err(ScheduleError::NoTemplateForArchetype {
                house: house.to_uppercase(),
            });
        }

        let prefs = resolve_preferences(user.preferences.as_deref());
        // Key selection does not depend on the day, so a house that cannot
        // cover a configured window fails the user once.
        for slot in WindowSlot::ALL {
            if prefs.windows.get(slot).is_some() {
                self.catalog.select_key(house, user.class.as_deref(), slot)?;
            }
        }
        let now = Utc::now();
        let start = start_date.unwrap_or_else(|| civil::local_today(prefs.timezone, now));

        let mut report = GenerationReport {
            user_id: user.id.clone(),
            start_date: Some(start),
            days,
            ..Default::default()
        };

        for offset in 0..days {
            let Some(date) = start.checked_add_days(Days::new(offset as u64)) else {
                report.errors.push(format!("date overflow after {start}"));
                break;
            };

            for slot in WindowSlot::ALL {
                match self
                    .plan_slot(user, house, &prefs, date, slot, force, now)
                    .await
                {
                    Ok(SlotOutcome::Created(task)) => report.created.push(*task),
                    Ok(SlotOutcome::Exists) => report.existing += 1,
                    Ok(SlotOutcome::Suppressed) => report.suppressed += 1,
                    Ok(SlotOutcome::Unconfigured) => report.unconfigured += 1,
                    Err(ScheduleError::Database(e)) => return Err(ScheduleError::Database(e)),
                    Err(e) => {
                        warn!(
                            user_id = %user.id,
                            date = %date,
                            slot = %slot,
                            configuration = e.is_configuration(),
                            error = %e,
                            "Slot generation failed"
                        );
                        report.errors.push(format!("{date} {slot}: {e}"));
                    }
                }
            }
        }

        info!(
            user_id = %user.id,
            start = %start,
            days,
            created = report.created.len(),
            existing = report.existing,
            suppressed = report.suppressed,
            errors = report.errors.len(),
            "Schedule generated"
        );
        Ok(report)
    }

    #[allow(clippy::too_many_arguments)]
    async fn plan_slot(
        &self,
        user: &UserProfile,
        house: &str,
        prefs: &SchedulePreferences,
        date: NaiveDate,
        slot: WindowSlot,
        force: bool,
        now: DateTime<Utc>,
    ) -> Result<SlotOutcome, ScheduleError> {
        let Some(window) = prefs.windows.get(slot) else {
            return Ok(SlotOutcome::Unconfigured);
        };

        let template = self.catalog.select(house, user.class.as_deref(), slot)?;

        let tz = prefs.timezone;
        let scheduled_at = civil::local_to_utc(tz, date, window.start.to_naive()).ok_or_else(|| {
            ScheduleError::UnresolvableLocalTime {
                date,
                time: window.start.to_string(),
                timezone: tz.name().to_string(),
            }
        })?;

        // DND is checked against the actual local start, which differs from
        // the window start when it fell in a DST gap.
        let local_start = LocalTime::from_naive(scheduled_at.with_timezone(&tz).time());
        if prefs.in_dnd(local_start) {
            debug!(user_id = %user.id, date = %date, slot = %slot, at = %local_start, "Slot inside DND");
            return Ok(SlotOutcome::Suppressed);
        }

        let exists = self.store.task_instance_exists(&user.id, slot, date).await?;
        if exists && !force {
            return Ok(SlotOutcome::Exists);
        }

        let slot_length = Duration::from_std(self.config.slot_length).unwrap_or(Duration::hours(1));
        let (id, forced) = if exists {
            (Uuid::new_v4(), true)
        } else {
            (TaskInstance::idempotency_id(&user.id, slot, date), false)
        };

        let task = TaskInstance {
            id,
            user_id: user.id.clone(),
            template_key: template.key.clone(),
            slot,
            local_date: date,
            scheduled_at,
            scheduled_end: scheduled_at + slot_length,
            duration_minutes: template.min_duration_minutes,
            personalization: json!({
                "title": template.title,
                "modality": template.modality,
                "house": house.to_uppercase(),
                "class": user.class,
                "window": {"start": window.start, "end": window.end},
                "timezone": tz.name(),
                "localStart": local_start,
            }),
            status: TaskStatus::Scheduled,
            forced,
            started_at: None,
            completed_at: None,
            created_at: now,
            updated_at: now,
        };

        if !self.store.insert_task_instance(&task).await? {
            // Another generator took the key first.
            return Ok(SlotOutcome::Exists);
        }
        debug!(user_id = %user.id, task_id = %task.id, date = %date, slot = %slot, forced, "Task scheduled");
        Ok(SlotOutcome::Created(Box::new(task)))
    }

    /// Generate for every active user, each starting at their own local today.
    ///
    /// Users are processed on a bounded pool. A failure to load the user
    /// list aborts the batch; a failure for one user is reported and the
    /// rest continue.
    pub async fn generate_for_active_users(
        &self,
        days: u32,
        force: bool,
    ) -> Result<BatchScheduleReport, ScheduleError> {
        let days = days.clamp(1, self.config.max_days);
        let users = self.store.list_active_users().await?;

        let mut batch = BatchScheduleReport {
            users: users.len(),
            ..Default::default()
        };

        let results: Vec<(String, Result<GenerationReport, ScheduleError>)> =
            futures::stream::iter(users)
                .map(|user| async move {
                    let result = self.generate_for_user(&user, None, days, force).await;
                    (user.id, result)
                })
                .buffer_unordered(self.max_workers)
                .collect()
                .await;

        for (user_id, result) in results {
            match result {
                Ok(report) => {
                    batch.succeeded += 1;
                    batch.tasks_created += report.created.len();
                    batch.existing += report.existing;
                    batch.suppressed += report.suppressed;
                    batch
                        .errors
                        .extend(report.errors.into_iter().map(|e| format!("{user_id}: {e}")));
                }
                Err(e) => {
                    if e.is_configuration() {
                        warn!(user_id = %user_id, error = %e, "User skipped: catalog misconfigured");
                    } else {
                        warn!(user_id = %user_id, error = %e, "User schedule generation failed");
                    }
                    batch.failed += 1;
                    batch.errors.push(format!("{user_id}: {e}"));
                }
            }
        }

        info!(
            users = batch.users,
            succeeded = batch.succeeded,
            failed = batch.failed,
            tasks_created = batch.tasks_created,
            "Batch schedule generation finished"
        );
        Ok(batch)
    }
}
