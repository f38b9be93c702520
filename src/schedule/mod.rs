//! Practice scheduling — preferences, templates, generation, and task lifecycle.

pub mod lifecycle;
pub mod model;
pub mod planner;
pub mod preferences;
pub mod templates;

pub use lifecycle::TaskLifecycle;
pub use model::{TaskInstance, TaskStatus, UserProfile};
pub use planner::{BatchScheduleReport, GenerationReport, Scheduler};
pub use preferences::{SchedulePreferences, WindowSlot, resolve_preferences};
pub use templates::TemplateCatalog;
