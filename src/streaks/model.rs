//! Habit and habit entry types.

use chrono::{DateTime, NaiveDate, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::civil;

/// A tracked daily habit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Habit {
    pub id: Uuid,
    pub user_id: String,
    pub name: String,
    /// Owner's IANA timezone; days are counted in it.
    pub timezone: String,
    pub streak: u32,
    pub longest_streak: u32,
    pub last_completed_at: Option<DateTime<Utc>>,
    pub active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Habit {
    pub fn new(user_id: impl Into<String>, name: impl Into<String>, timezone: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            user_id: user_id.into(),
            name: name.into(),
            timezone: timezone.into(),
            streak: 0,
            longest_streak: 0,
            last_completed_at: None,
            active: true,
            created_at: now,
            updated_at: now,
        }
    }

    /// Owner timezone, UTC when the stored id is not a known zone.
    pub fn tz(&self) -> Tz {
        civil::parse_tz(&self.timezone).unwrap_or(Tz::UTC)
    }
}

/// A habit's record for one calendar day.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HabitEntry {
    pub id: Uuid,
    pub habit_id: Uuid,
    pub entry_date: NaiveDate,
    pub completed: bool,
    pub notes: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl HabitEntry {
    /// Not-yet-completed entry created ahead of the user's action.
    pub fn placeholder(habit_id: Uuid, entry_date: NaiveDate) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            habit_id,
            entry_date,
            completed: false,
            notes: None,
            created_at: now,
            updated_at: now,
        }
    }
}
