//! Nightly streak continuity pass.
//!
//! For every active habit, in the owner's timezone: reset the streak when
//! yesterday was missed, back-fill `last_completed_at` when yesterday was
//! completed, and make sure today has an entry to toggle.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::StreamExt;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::civil;
use crate::config::StreakConfig;
use crate::error::StreakError;
use crate::notify::{NotificationDispatcher, NotificationEvent, dispatch_logged};
use crate::store::Database;
use crate::streaks::model::{Habit, HabitEntry};

/// Summary of one streak pass.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StreakPassReport {
    pub processed: usize,
    /// Habits whose streak or `last_completed_at` changed.
    pub updated: usize,
    pub broken_streaks: usize,
    pub placeholders_created: usize,
    pub errors: Vec<String>,
}

/// Summary of one reminder round.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReminderReport {
    pub checked: usize,
    pub sent: usize,
    pub errors: Vec<String>,
}

#[derive(Debug, Default, PartialEq, Eq)]
struct HabitOutcome {
    reset: bool,
    backfilled: bool,
    placeholder: bool,
}

pub struct StreakEngine {
    store: Arc<dyn Database>,
    dispatcher: Arc<dyn NotificationDispatcher>,
    config: StreakConfig,
    max_workers: usize,
}

impl StreakEngine {
    pub fn new(
        store: Arc<dyn Database>,
        dispatcher: Arc<dyn NotificationDispatcher>,
        config: StreakConfig,
        max_workers: usize,
    ) -> Self {
        Self {
            store,
            dispatcher,
            config,
            max_workers: max_workers.max(1),
        }
    }

    pub async fn run_streak_pass(&self) -> Result<StreakPassReport, StreakError> {
        self.run_streak_pass_at(Utc::now()).await
    }

    /// Process every active habit as of `now`.
    ///
    /// Loading the habit list is the only fatal step; per-habit failures
    /// are collected in the report.
    pub async fn run_streak_pass_at(&self, now: DateTime<Utc>) -> Result<StreakPassReport, StreakError> {
        let habits = self.store.list_active_habits().await?;

        let results: Vec<(Habit, Result<HabitOutcome, StreakError>)> = futures::stream::iter(habits)
            .map(|habit| async move {
                let result = self.process_habit(&habit, now).await;
                (habit, result)
            })
            .buffer_unordered(self.max_workers)
            .collect()
            .await;

        let mut report = StreakPassReport::default();
        for (habit, result) in results {
            report.processed += 1;
            match result {
                Ok(outcome) => {
                    if outcome.reset || outcome.backfilled {
                        report.updated += 1;
                    }
                    if outcome.reset {
                        report.broken_streaks += 1;
                    }
                    if outcome.placeholder {
                        report.placeholders_created += 1;
                    }
                }
                Err(e) => {
                    warn!(habit_id = %habit.id, error = %e, "Streak update failed");
                    report.errors.push(format!("{}: {e}", habit.id));
                }
            }
        }

        info!(
            processed = report.processed,
            updated = report.updated,
            broken = report.broken_streaks,
            placeholders = report.placeholders_created,
            errors = report.errors.len(),
            "Streak pass finished"
        );
        Ok(report)
    }

    async fn process_habit(&self, habit: &Habit, now: DateTime<Utc>) -> Result<HabitOutcome, StreakError> {
        let tz = habit.tz();
        let today = civil::local_today(tz, now);
        let Some(yesterday) = today.pred_opt() else {
            return Ok(HabitOutcome::default());
        };

        let yesterday_done = self
            .store
            .get_habit_entry(habit.id, yesterday)
            .await?
            .is_some_and(|e| e.completed);
        let today_entry = self.store.get_habit_entry(habit.id, today).await?;

        let mut outcome = HabitOutcome::default();

        if !yesterday_done && habit.streak > 0 {
            if self.store.reset_streak(habit.id, habit.streak, now).await? {
                outcome.reset = true;
                info!(habit_id = %habit.id, previous = habit.streak, "Streak broken");
                if habit.streak >= self.config.broken_notify_threshold {
                    dispatch_logged(
                        self.dispatcher.as_ref(),
                        NotificationEvent::StreakBroken {
                            habit_id: habit.id,
                            previous_streak: habit.streak,
                        },
                    )
                    .await;
                }
            } else {
                // A completion landed between our read and the reset.
                debug!(habit_id = %habit.id, "Streak changed concurrently, reset skipped");
            }
        } else if yesterday_done {
            let day_start = civil::local_day_start(tz, yesterday);
            if let Some(day_start) = day_start.filter(|s| habit.last_completed_at.is_none_or(|t| t < *s)) {
                self.store.set_last_completed_at(habit.id, day_start, now).await?;
                outcome.backfilled = true;
                debug!(habit_id = %habit.id, "Back-filled last completion");
            }
        }

        if today_entry.is_none() {
            outcome.placeholder = self
                .store
                .insert_habit_entry(&HabitEntry::placeholder(habit.id, today))
                .await?;
        }

        Ok(outcome)
    }

    pub async fn send_reminders(&self) -> Result<ReminderReport, StreakError> {
        self.send_reminders_at(Utc::now()).await
    }

    /// Remind owners of habits with a running streak that today is still open.
    pub async fn send_reminders_at(&self, now: DateTime<Utc>) -> Result<ReminderReport, StreakError> {
        let habits = self.store.list_active_habits().await?;
        let mut report = ReminderReport::default();

        for habit in habits.iter().filter(|h| h.streak > 0) {
            report.checked += 1;
            let today = civil::local_today(habit.tz(), now);
            match self.store.get_habit_entry(habit.id, today).await {
                Ok(Some(entry)) if entry.completed => {}
                Ok(_) => {
                    if dispatch_logged(
                        self.dispatcher.as_ref(),
                        NotificationEvent::HabitReminder { habit_id: habit.id },
                    )
                    .await
                    {
                        report.sent += 1;
                    }
                }
                Err(e) => report.errors.push(format!("{}: {e}", habit.id)),
            }
        }

        info!(checked = report.checked, sent = report.sent, "Habit reminders sent");
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use chrono::{NaiveDate, TimeZone};

    use super::*;
    use crate::notify::testing::{FailingDispatcher, RecordingDispatcher};
    use crate::store::LibSqlBackend;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn noon(d: NaiveDate) -> DateTime<Utc> {
        Utc.from_utc_datetime(&d.and_hms_opt(12, 0, 0).unwrap())
    }

    async fn setup() -> (Arc<dyn Database>, Arc<RecordingDispatcher>, StreakEngine) {
        let db: Arc<dyn Database> = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let dispatcher = Arc::new(RecordingDispatcher::default());
        let engine = StreakEngine::new(
            Arc::clone(&db),
            dispatcher.clone(),
            StreakConfig::default(),
            4,
        );
        (db, dispatcher, engine)
    }

    async fn habit_with_streak(db: &Arc<dyn Database>, streak: u32, tz: &str) -> Habit {
        let mut habit = Habit::new("u1", format!("habit-{streak}"), tz);
        habit.streak = streak;
        habit.longest_streak = streak;
        db.insert_habit(&habit).await.unwrap();
        habit
    }

    #[tokio::test]
    async fn missed_day_resets_and_notifies_long_streaks_only() {
        let (db, dispatcher, engine) = setup().await;
        let long = habit_with_streak(&db, 5, "UTC").await;
        let short = habit_with_streak(&db, 2, "UTC").await;

        let report = engine.run_streak_pass_at(noon(date(2024, 5, 10))).await.unwrap();
        assert_eq!(report.processed, 2);
        assert_eq!(report.broken_streaks, 2);
        assert_eq!(report.updated, 2);
        assert!(report.errors.is_empty());

        for id in [long.id, short.id] {
            let h = db.get_habit(id).await.unwrap().unwrap();
            assert_eq!(h.streak, 0);
        }
        assert_eq!(db.get_habit(long.id).await.unwrap().unwrap().longest_streak, 5);

        assert_eq!(
            dispatcher.events(),
            vec![NotificationEvent::StreakBroken {
                habit_id: long.id,
                previous_streak: 5
            }]
        );
    }

    #[tokio::test]
    async fn completed_yesterday_backfills_last_completion() {
        let (db, dispatcher, engine) = setup().await;
        let habit = habit_with_streak(&db, 4, "UTC").await;
        db.upsert_habit_entry_completion(habit.id, date(2024, 5, 9), true, None, Utc::now())
            .await
            .unwrap();

        let report = engine.run_streak_pass_at(noon(date(2024, 5, 10))).await.unwrap();
        assert_eq!(report.broken_streaks, 0);
        assert_eq!(report.updated, 1);

        let h = db.get_habit(habit.id).await.unwrap().unwrap();
        assert_eq!(h.streak, 4);
        assert_eq!(h.last_completed_at, Some(noon(date(2024, 5, 9)) - chrono::Duration::hours(12)));
        assert!(dispatcher.events().is_empty());

        // Already current: nothing to do.
        let report = engine.run_streak_pass_at(noon(date(2024, 5, 10))).await.unwrap();
        assert_eq!(report.updated, 0);
    }

    #[tokio::test]
    async fn placeholder_created_once_for_today() {
        let (db, _dispatcher, engine) = setup().await;
        let habit = habit_with_streak(&db, 0, "UTC").await;
        let now = noon(date(2024, 5, 10));

        let report = engine.run_streak_pass_at(now).await.unwrap();
        assert_eq!(report.placeholders_created, 1);
        assert_eq!(report.broken_streaks, 0);
        let entry = db.get_habit_entry(habit.id, date(2024, 5, 10)).await.unwrap().unwrap();
        assert!(!entry.completed);

        let report = engine.run_streak_pass_at(now).await.unwrap();
        assert_eq!(report.placeholders_created, 0);
    }

    #[tokio::test]
    async fn days_are_counted_in_owner_timezone() {
        let (db, _dispatcher, engine) = setup().await;
        let habit = habit_with_streak(&db, 3, "Pacific/Auckland").await;
        // 20:00Z on June 1 is June 2 in Auckland, so "yesterday" is June 1.
        db.upsert_habit_entry_completion(habit.id, date(2024, 6, 1), true, None, Utc::now())
            .await
            .unwrap();
        let now = Utc.with_ymd_and_hms(2024, 6, 1, 20, 0, 0).unwrap();

        let report = engine.run_streak_pass_at(now).await.unwrap();
        assert_eq!(report.broken_streaks, 0);
        assert!(db.get_habit_entry(habit.id, date(2024, 6, 2)).await.unwrap().is_some());
        assert_eq!(db.get_habit(habit.id).await.unwrap().unwrap().streak, 3);
    }

    #[tokio::test]
    async fn lost_reset_race_is_not_an_error() {
        let (db, dispatcher, engine) = setup().await;
        let stale = habit_with_streak(&db, 5, "UTC").await;
        // A completion moved the streak after the engine read it.
        db.update_habit_progress(stale.id, 6, None, Utc::now()).await.unwrap();

        let outcome = engine.process_habit(&stale, noon(date(2024, 5, 10))).await.unwrap();
        assert!(!outcome.reset);
        assert_eq!(db.get_habit(stale.id).await.unwrap().unwrap().streak, 6);
        assert!(dispatcher.events().is_empty());
    }

    #[tokio::test]
    async fn inactive_habits_are_ignored() {
        let (db, _dispatcher, engine) = setup().await;
        let mut habit = Habit::new("u1", "paused", "UTC");
        habit.streak = 9;
        habit.active = false;
        db.insert_habit(&habit).await.unwrap();

        let report = engine.run_streak_pass_at(noon(date(2024, 5, 10))).await.unwrap();
        assert_eq!(report.processed, 0);
        assert_eq!(db.get_habit(habit.id).await.unwrap().unwrap().streak, 9);
    }

    #[tokio::test]
    async fn dispatch_failure_does_not_fail_the_pass() {
        let db: Arc<dyn Database> = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let engine = StreakEngine::new(
            Arc::clone(&db),
            Arc::new(FailingDispatcher),
            StreakConfig::default(),
            2,
        );
        habit_with_streak(&db, 10, "UTC").await;
        let report = engine.run_streak_pass_at(noon(date(2024, 5, 10))).await.unwrap();
        assert_eq!(report.broken_streaks, 1);
        assert!(report.errors.is_empty());
    }

    #[tokio::test]
    async fn reminders_target_open_running_streaks() {
        let (db, dispatcher, engine) = setup().await;
        let today = date(2024, 5, 10);
        let open = habit_with_streak(&db, 3, "UTC").await;
        let done = habit_with_streak(&db, 2, "UTC").await;
        habit_with_streak(&db, 0, "UTC").await;
        db.upsert_habit_entry_completion(done.id, today, true, None, Utc::now())
            .await
            .unwrap();

        let report = engine.send_reminders_at(noon(today)).await.unwrap();
        assert_eq!(report.checked, 2);
        assert_eq!(report.sent, 1);
        assert_eq!(
            dispatcher.events(),
            vec![NotificationEvent::HabitReminder { habit_id: open.id }]
        );
    }
}
