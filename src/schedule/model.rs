//! Task instance and user profile types.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::schedule::preferences::WindowSlot;

/// Namespace for content-addressed task instance ids.
const TASK_NAMESPACE: Uuid = Uuid::from_u128(0x6f1c_2a7e_93d4_4b0a_8c55_0e2f_b1d7_a940);

/// Lifecycle state of a scheduled task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Scheduled,
    Notified,
    Started,
    Completed,
    Skipped,
    Expired,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Scheduled => "scheduled",
            Self::Notified => "notified",
            Self::Started => "started",
            Self::Completed => "completed",
            Self::Skipped => "skipped",
            Self::Expired => "expired",
        }
    }

    pub fn can_transition_to(&self, target: TaskStatus) -> bool {
        use TaskStatus::*;
        matches!(
            (self, target),
            (Scheduled, Notified)
                | (Scheduled | Notified, Started)
                | (Scheduled | Notified | Started, Completed)
                | (Scheduled | Notified, Skipped | Expired)
        )
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "scheduled" => Ok(Self::Scheduled),
            "notified" => Ok(Self::Notified),
            "started" => Ok(Self::Started),
            "completed" => Ok(Self::Completed),
            "skipped" => Ok(Self::Skipped),
            "expired" => Ok(Self::Expired),
            other => Err(format!("unknown task status: {other}")),
        }
    }
}

/// One concrete occurrence of a template for a user on a local day.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskInstance {
    pub id: Uuid,
    pub user_id: String,
    pub template_key: String,
    pub slot: WindowSlot,
    /// Calendar date in the user's timezone.
    pub local_date: NaiveDate,
    pub scheduled_at: DateTime<Utc>,
    pub scheduled_end: DateTime<Utc>,
    pub duration_minutes: u32,
    pub personalization: serde_json::Value,
    pub status: TaskStatus,
    /// Created by a forced regeneration, outside the idempotency key.
    pub forced: bool,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TaskInstance {
    /// Id for the (user, slot, local day) idempotency key.
    pub fn idempotency_id(user_id: &str, slot: WindowSlot, local_date: NaiveDate) -> Uuid {
        let name = format!("{user_id}|{}|{}", slot.as_str(), local_date.format("%Y-%m-%d"));
        Uuid::new_v5(&TASK_NAMESPACE, name.as_bytes())
    }
}

/// A user's profile as far as scheduling is concerned.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserProfile {
    pub id: String,
    /// House (archetype) assignment.
    pub house: Option<String>,
    pub class: Option<String>,
    /// Raw stored preferences document.
    pub preferences: Option<String>,
    pub active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl UserProfile {
    pub fn new(id: impl Into<String>, house: Option<&str>) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            house: house.map(str::to_string),
            class: None,
            preferences: None,
            active: true,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_class(mut self, class: &str) -> Self {
        self.class = Some(class.to_string());
        self
    }

    pub fn with_preferences(mut self, raw: impl Into<String>) -> Self {
        self.preferences = Some(raw.into());
        self
    }
}
