//! Habit streaks — nightly continuity pass and the completion toggle.

pub mod engine;
pub mod model;
pub mod tracker;

pub use engine::{ReminderReport, StreakEngine, StreakPassReport};
pub use model::{Habit, HabitEntry};
pub use tracker::{CompletionUpdate, HabitTracker};
