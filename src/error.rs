//! Error types for the practice scheduler.

use chrono::NaiveDate;
use uuid::Uuid;

/// Top-level error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Schedule error: {0}")]
    Schedule(#[from] ScheduleError),

    #[error("Task error: {0}")]
    Task(#[from] TaskError),

    #[error("Job error: {0}")]
    Job(#[from] JobError),

    #[error("Streak error: {0}")]
    Streak(#[from] StreakError),

    #[error("Notification error: {0}")]
    Notify(#[from] NotifyError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("Failed to parse configuration: {0}")]
    ParseError(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Database-related errors. These are the transient class: a caller may
/// retry the whole operation, the job runner never does.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection pool error: {0}")]
    Pool(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Entity not found: {entity} with id {id}")]
    NotFound { entity: String, id: String },

    #[error("Constraint violation: {0}")]
    Constraint(String),

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Errors raised while generating a user's schedule.
#[derive(Debug, thiserror::Error)]
pub enum ScheduleError {
    #[error("User {user_id} not found")]
    UserNotFound { user_id: String },

    #[error("User {user_id} has no house assignment")]
    MissingAssignment { user_id: String },

    /// Operator must fix the catalog; retrying will not help.
    #[error("No template configured for house {house}")]
    NoTemplateForArchetype { house: String },

    #[error("Template {key} referenced by house {house} is not in the catalog")]
    UnknownTemplate { house: String, key: String },

    #[error("Local time {time} on {date} does not exist in {timezone}")]
    UnresolvableLocalTime {
        date: NaiveDate,
        time: String,
        timezone: String,
    },

    #[error("Invalid day range: {0}")]
    InvalidRange(String),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),
}

impl ScheduleError {
    /// Configuration errors need an operator fix and are never auto-retried.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            Self::NoTemplateForArchetype { .. } | Self::UnknownTemplate { .. }
        )
    }
}

/// Task lifecycle errors.
#[derive(Debug, thiserror::Error)]
pub enum TaskError {
    #[error("Task {id} not found")]
    NotFound { id: Uuid },

    #[error("Task {id} is {state}, cannot transition to {target}")]
    InvalidTransition {
        id: Uuid,
        state: String,
        target: String,
    },

    #[error("Task {id} changed concurrently")]
    Conflict { id: Uuid },

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),
}

/// Job runner errors.
#[derive(Debug, thiserror::Error)]
pub enum JobError {
    #[error("Job {name} failed: {reason}")]
    Failed { name: String, reason: String },

    #[error("Job {name} result could not be serialized: {reason}")]
    Serialization { name: String, reason: String },

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),
}

/// Streak engine errors.
#[derive(Debug, thiserror::Error)]
pub enum StreakError {
    #[error("Habit {id} not found")]
    HabitNotFound { id: Uuid },

    #[error("Habit {id} is inactive")]
    Inactive { id: Uuid },

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),
}

/// Notification dispatch errors. Always logged and swallowed by callers.
#[derive(Debug, thiserror::Error)]
pub enum NotifyError {
    #[error("Dispatcher channel closed")]
    ChannelClosed,

    #[error("Dispatcher buffer full")]
    BufferFull,

    #[error("Webhook request failed: {0}")]
    Http(String),

    #[error("Webhook returned status {0}")]
    Status(u16),
}

/// Result type alias for the crate.
pub type Result<T> = std::result::Result<T, Error>;
