//! Notification dispatch — fire-and-forget habit and streak events.
//!
//! Two dispatchers are provided: [`WebhookDispatcher`] POSTs each event as
//! JSON, [`ChannelDispatcher`] hands it to an in-process consumer. Callers
//! go through [`dispatch_logged`], which logs and swallows failures.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::error::NotifyError;

/// Outgoing notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum NotificationEvent {
    HabitReminder {
        habit_id: Uuid,
    },
    StreakMilestone {
        habit_id: Uuid,
        streak: u32,
    },
    StreakBroken {
        habit_id: Uuid,
        previous_streak: u32,
    },
}

impl NotificationEvent {
    pub fn habit_id(&self) -> Uuid {
        match self {
            Self::HabitReminder { habit_id }
            | Self::StreakMilestone { habit_id, .. }
            | Self::StreakBroken { habit_id, .. } => *habit_id,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::HabitReminder { .. } => "habit_reminder",
            Self::StreakMilestone { .. } => "streak_milestone",
            Self::StreakBroken { .. } => "streak_broken",
        }
    }
}

/// Delivery seam for notification events.
#[async_trait]
pub trait NotificationDispatcher: Send + Sync {
    async fn send(&self, event: NotificationEvent) -> Result<(), NotifyError>;

    async fn send_habit_reminder(&self, habit_id: Uuid) -> Result<(), NotifyError> {
        self.send(NotificationEvent::HabitReminder { habit_id }).await
    }

    async fn send_streak_milestone(&self, habit_id: Uuid, streak: u32) -> Result<(), NotifyError> {
        self.send(NotificationEvent::StreakMilestone { habit_id, streak })
            .await
    }

    async fn send_streak_broken(
        &self,
        habit_id: Uuid,
        previous_streak: u32,
    ) -> Result<(), NotifyError> {
        self.send(NotificationEvent::StreakBroken {
            habit_id,
            previous_streak,
        })
        .await
    }
}

/// Send an event, logging instead of propagating failures.
pub async fn dispatch_logged(dispatcher: &dyn NotificationDispatcher, event: NotificationEvent) -> bool {
    let kind = event.kind();
    let habit_id = event.habit_id();
    match dispatcher.send(event).await {
        Ok(()) => {
            tracing::debug!(kind, habit_id = %habit_id, "Notification dispatched");
            true
        }
        Err(e) => {
            tracing::warn!(kind, habit_id = %habit_id, error = %e, "Notification dispatch failed");
            false
        }
    }
}

/// Forwards events to an mpsc consumer.
pub struct ChannelDispatcher {
    tx: mpsc::Sender<NotificationEvent>,
}

impl ChannelDispatcher {
    pub fn new(tx: mpsc::Sender<NotificationEvent>) -> Self {
        Self { tx }
    }

    /// Dispatcher plus the receiving end, with a bounded buffer.
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<NotificationEvent>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self::new(tx), rx)
    }
}

#[async_trait]
impl NotificationDispatcher for ChannelDispatcher {
    async fn send(&self, event: NotificationEvent) -> Result<(), NotifyError> {
        // Never wait on a slow consumer.
        self.tx.try_send(event).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => NotifyError::BufferFull,
            mpsc::error::TrySendError::Closed(_) => NotifyError::ChannelClosed,
        })
    }
}

/// POSTs each event as JSON to a fixed URL.
pub struct WebhookDispatcher {
    client: reqwest::Client,
    url: String,
}

impl WebhookDispatcher {
    pub fn new(url: impl Into<String>) -> Result<Self, NotifyError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(5))
            .build()
            .map_err(|e| NotifyError::Http(e.to_string()))?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

#[async_trait]
impl NotificationDispatcher for WebhookDispatcher {
    async fn send(&self, event: NotificationEvent) -> Result<(), NotifyError> {
        let resp = self
            .client
            .post(&self.url)
            .json(&event)
            .send()
            .await
            .map_err(|e| NotifyError::Http(e.to_string()))?;

        if !resp.status().is_success() {
            return Err(NotifyError::Status(resp.status().as_u16()));
        }
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::sync::Mutex;

    use super::*;

    /// Records every event it is handed.
    #[derive(Default)]
    pub struct RecordingDispatcher {
        events: Mutex<Vec<NotificationEvent>>,
    }

    impl RecordingDispatcher {
        pub fn events(&self) -> Vec<NotificationEvent> {
            self.events.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl NotificationDispatcher for RecordingDispatcher {
        async fn send(&self, event: NotificationEvent) -> Result<(), NotifyError> {
            self.events.lock().unwrap().push(event);
            Ok(())
        }
    }

    /// Fails every send.
    pub struct FailingDispatcher;

    #[async_trait]
    impl NotificationDispatcher for FailingDispatcher {
        async fn send(&self, _event: NotificationEvent) -> Result<(), NotifyError> {
            Err(NotifyError::ChannelClosed)
        }
    }
}
