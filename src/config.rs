//! Configuration types.

use std::path::PathBuf;
use std::time::Duration;

use secrecy::SecretString;

use crate::error::ConfigError;

/// Schedule generation settings.
#[derive(Debug, Clone)]
pub struct ScheduleConfig {
    /// Days generated per user by the batch job (starting at the user's local today).
    pub batch_days: u32,
    /// Upper bound accepted by `generate_schedule`.
    pub max_days: u32,
    /// Length of a scheduled task slot.
    pub slot_length: Duration,
    /// How long after its end a task stays open before it is expired.
    pub expiry_grace: Duration,
    /// Optional JSON catalog replacing the built-in one.
    pub catalog_path: Option<PathBuf>,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            batch_days: 7,
            max_days: 31,
            slot_length: Duration::from_secs(3600), // 1 hour
            expiry_grace: Duration::from_secs(6 * 3600),
            catalog_path: None,
        }
    }
}

/// Job runner settings.
#[derive(Debug, Clone)]
pub struct JobConfig {
    /// Minimum hours between two schedule generation runs.
    pub schedule_min_interval_hours: u32,
    /// Minimum hours between two streak passes.
    pub streak_min_interval_hours: u32,
    /// Minimum hours between two expiry sweeps.
    pub expiry_min_interval_hours: u32,
    /// Minimum hours between two reminder rounds.
    pub reminder_min_interval_hours: u32,
    /// A `running` record older than this can be taken over.
    pub stale_run_threshold: Duration,
    /// Width of the batch worker pool.
    pub max_workers: usize,
}

impl Default for JobConfig {
    fn default() -> Self {
        Self {
            schedule_min_interval_hours: 23,
            streak_min_interval_hours: 23,
            expiry_min_interval_hours: 1,
            reminder_min_interval_hours: 6,
            stale_run_threshold: Duration::from_secs(3600), // 1 hour
            max_workers: 8,
        }
    }
}

/// Streak engine settings.
#[derive(Debug, Clone)]
pub struct StreakConfig {
    /// Broken streaks shorter than this are reset silently.
    pub broken_notify_threshold: u32,
    /// Streak lengths that trigger a milestone notification.
    pub milestones: Vec<u32>,
}

impl Default for StreakConfig {
    fn default() -> Self {
        Self {
            broken_notify_threshold: 3,
            milestones: vec![3, 7, 14, 30, 60, 100, 365],
        }
    }
}

/// Optional in-process timer, for running without an external scheduler.
#[derive(Debug, Clone)]
pub struct LocalTimerConfig {
    pub enabled: bool,
    pub schedule_cron: String,
    pub streak_cron: String,
    pub expiry_cron: String,
    pub reminder_cron: String,
}

impl Default for LocalTimerConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            schedule_cron: "0 0 2 * * *".to_string(),
            streak_cron: "0 5 0 * * *".to_string(),
            expiry_cron: "0 30 * * * *".to_string(),
            reminder_cron: "0 0 18 * * *".to_string(),
        }
    }
}

/// Everything the binary needs.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub db_path: PathBuf,
    pub port: u16,
    pub cron_secret: SecretString,
    pub notify_webhook_url: Option<String>,
    pub log_dir: Option<PathBuf>,
    pub schedule: ScheduleConfig,
    pub jobs: JobConfig,
    pub streaks: StreakConfig,
    pub timer: LocalTimerConfig,
}

impl AppConfig {
    /// Load from `PRACTICE_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let cron_secret = std::env::var("PRACTICE_CRON_SECRET")
            .map_err(|_| ConfigError::MissingEnvVar("PRACTICE_CRON_SECRET".to_string()))?;
        if cron_secret.trim().is_empty() {
            return Err(ConfigError::InvalidValue {
                key: "PRACTICE_CRON_SECRET".to_string(),
                message: "must not be empty".to_string(),
            });
        }

        let schedule_defaults = ScheduleConfig::default();
        let job_defaults = JobConfig::default();
        let timer_defaults = LocalTimerConfig::default();

        let schedule = ScheduleConfig {
            batch_days: env_or("PRACTICE_SCHEDULE_DAYS", schedule_defaults.batch_days),
            max_days: env_or("PRACTICE_SCHEDULE_MAX_DAYS", schedule_defaults.max_days),
            slot_length: schedule_defaults.slot_length,
            expiry_grace: Duration::from_secs(
                60 * env_or(
                    "PRACTICE_EXPIRY_GRACE_MIN",
                    schedule_defaults.expiry_grace.as_secs() / 60,
                ),
            ),
            catalog_path: std::env::var("PRACTICE_CATALOG_PATH").ok().map(PathBuf::from),
        };

        let jobs = JobConfig {
            schedule_min_interval_hours: env_or(
                "PRACTICE_SCHEDULE_MIN_INTERVAL_HOURS",
                job_defaults.schedule_min_interval_hours,
            ),
            streak_min_interval_hours: env_or(
                "PRACTICE_STREAK_MIN_INTERVAL_HOURS",
                job_defaults.streak_min_interval_hours,
            ),
            expiry_min_interval_hours: job_defaults.expiry_min_interval_hours,
            reminder_min_interval_hours: env_or(
                "PRACTICE_REMINDER_MIN_INTERVAL_HOURS",
                job_defaults.reminder_min_interval_hours,
            ),
            stale_run_threshold: Duration::from_secs(
                60 * env_or(
                    "PRACTICE_STALE_RUN_MIN",
                    job_defaults.stale_run_threshold.as_secs() / 60,
                ),
            ),
            max_workers: env_or("PRACTICE_MAX_WORKERS", job_defaults.max_workers).max(1),
        };

        let timer = LocalTimerConfig {
            enabled: std::env::var("PRACTICE_LOCAL_TIMER")
                .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
                .unwrap_or(false),
            schedule_cron: std::env::var("PRACTICE_SCHEDULE_CRON")
                .unwrap_or(timer_defaults.schedule_cron),
            streak_cron: std::env::var("PRACTICE_STREAK_CRON")
                .unwrap_or(timer_defaults.streak_cron),
            expiry_cron: std::env::var("PRACTICE_EXPIRY_CRON")
                .unwrap_or(timer_defaults.expiry_cron),
            reminder_cron: std::env::var("PRACTICE_REMINDER_CRON")
                .unwrap_or(timer_defaults.reminder_cron),
        };

        Ok(Self {
            db_path: std::env::var("PRACTICE_DB_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./data/practice.db")),
            port: env_or("PRACTICE_PORT", 8080),
            cron_secret: SecretString::from(cron_secret),
            notify_webhook_url: std::env::var("PRACTICE_NOTIFY_WEBHOOK_URL")
                .ok()
                .filter(|s| !s.is_empty()),
            log_dir: std::env::var("PRACTICE_LOG_DIR").ok().map(PathBuf::from),
            schedule,
            jobs,
            streaks: StreakConfig::default(),
            timer,
        })
    }
}

/// Parse an env var, falling back to `default` when unset or unparsable.
fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    match std::env::var(key) {
        Ok(raw) => raw.trim().parse().unwrap_or_else(|_| {
            tracing::warn!(key, value = %raw, "Unparsable config value, using default");
            default
        }),
        Err(_) => default,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let jobs = JobConfig::default();
        assert_eq!(jobs.schedule_min_interval_hours, 23);
        assert_eq!(jobs.streak_min_interval_hours, 23);
        assert!(jobs.max_workers > 0);

        let streaks = StreakConfig::default();
        assert_eq!(streaks.broken_notify_threshold, 3);
        assert!(streaks.milestones.windows(2).all(|w| w[0] < w[1]));

        assert!(!LocalTimerConfig::default().enabled);
    }

    #[test]
    fn env_or_falls_back_on_garbage() {
        let value: u32 = env_or("PRACTICE_TEST_SURELY_UNSET_VAR", 42);
        assert_eq!(value, 42);
    }
}
