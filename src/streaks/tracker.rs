//! Completion toggle — the only writer that increments streaks.
//!
//! Rather than adding one per completion, the streak is recomputed from the
//! stored entries as the run of consecutive completed days ending today (or
//! yesterday, when today is still open). Repeated toggles therefore never
//! double-count.

use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::{DateTime, Days, NaiveDate, Utc};
use serde::Serialize;
use tracing::info;
use uuid::Uuid;

use crate::civil;
use crate::config::StreakConfig;
use crate::error::StreakError;
use crate::notify::{NotificationDispatcher, NotificationEvent, dispatch_logged};
use crate::store::Database;
use crate::streaks::model::HabitEntry;

/// Minimum number of days of history considered when recomputing.
const MIN_LOOKBACK_DAYS: u64 = 31;

/// Result of a completion toggle.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CompletionUpdate {
    pub entry: HabitEntry,
    pub streak: u32,
    pub longest_streak: u32,
    /// Set when this toggle reached a configured milestone.
    pub milestone: Option<u32>,
}

pub struct HabitTracker {
    store: Arc<dyn Database>,
    dispatcher: Arc<dyn NotificationDispatcher>,
    config: StreakConfig,
}

impl HabitTracker {
    pub fn new(
        store: Arc<dyn Database>,
        dispatcher: Arc<dyn NotificationDispatcher>,
        config: StreakConfig,
    ) -> Self {
        Self {
            store,
            dispatcher,
            config,
        }
    }

    /// The habit owner's current local date.
    pub async fn habit_today(&self, habit_id: Uuid) -> Result<NaiveDate, StreakError> {
        let habit = self
            .store
            .get_habit(habit_id)
            .await?
            .ok_or(StreakError::HabitNotFound { id: habit_id })?;
        Ok(civil::local_today(habit.tz(), Utc::now()))
    }

    pub async fn set_completion(
        &self,
        habit_id: Uuid,
        date: NaiveDate,
        completed: bool,
        notes: Option<&str>,
    ) -> Result<CompletionUpdate, StreakError> {
        self.set_completion_at(habit_id, date, completed, notes, Utc::now())
            .await
    }

    /// Mark `date` completed or not and recompute the streak as of `now`.
    pub async fn set_completion_at(
        &self,
        habit_id: Uuid,
        date: NaiveDate,
        completed: bool,
        notes: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<CompletionUpdate, StreakError> {
        let habit = self
            .store
            .get_habit(habit_id)
            .await?
            .ok_or(StreakError::HabitNotFound { id: habit_id })?;
        if !habit.active {
            return Err(StreakError::Inactive { id: habit_id });
        }

        let entry = self
            .store
            .upsert_habit_entry_completion(habit_id, date, completed, notes, now)
            .await?;

        let tz = habit.tz();
        let today = civil::local_today(tz, now);
        let lookback = MIN_LOOKBACK_DAYS.max((habit.longest_streak + habit.streak) as u64 + 2);
        let from = today.checked_sub_days(Days::new(lookback)).unwrap_or(NaiveDate::MIN);

        let done: BTreeSet<NaiveDate> = self
            .store
            .list_habit_entries(habit_id, from, today)
            .await?
            .into_iter()
            .filter(|e| e.completed)
            .map(|e| e.entry_date)
            .collect();

        let streak = consecutive_run(&done, today);
        let last_completed_at = match done.last() {
            Some(day) => civil::local_day_start(tz, *day),
            None => habit
                .last_completed_at
                .filter(|t| civil::local_date_of(tz, *t) < from),
        };

        self.store
            .update_habit_progress(habit_id, streak, last_completed_at, now)
            .await?;

        let milestone = (completed && streak > habit.streak && self.config.milestones.contains(&streak))
            .then_some(streak);
        if let Some(streak) = milestone {
            dispatch_logged(
                self.dispatcher.as_ref(),
                NotificationEvent::StreakMilestone { habit_id, streak },
            )
            .await;
        }

        info!(habit_id = %habit_id, date = %date, completed, streak, "Habit completion recorded");

        Ok(CompletionUpdate {
            entry,
            streak,
            longest_streak: habit.longest_streak.max(streak),
            milestone,
        })
    }
}

/// Length of the run of completed days ending today, or yesterday when
/// today is not completed.
fn consecutive_run(done: &BTreeSet<NaiveDate>, today: NaiveDate) -> u32 {
    let mut cursor = if done.contains(&today) {
        today
    } else {
        match today.pred_opt() {
            Some(y) if done.contains(&y) => y,
            _ => return 0,
        }
    };

    let mut run = 0;
    while done.contains(&cursor) {
        run += 1;
        match cursor.pred_opt() {
            Some(prev) => cursor = prev,
            None => break,
        }
    }
    run
}
