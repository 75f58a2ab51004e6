//! Notification Sink
//!
//! Fire-and-forget delivery of reports and failure notices to recipient
//! groups. Delivery runs on a spawned task: it never blocks the caller and a
//! failed delivery never affects a committed ledger operation.

use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

/// Who a notification is addressed to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecipientGroup {
    /// Periodic operator reports
    Reporting,
    /// Operation failures worth a human look
    Logging,
    /// Notices about the notifier itself
    Notifier,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub group: RecipientGroup,
    pub subject: String,
    pub payload: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

impl Notification {
    pub fn new(group: RecipientGroup, subject: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            group,
            subject: subject.into(),
            payload,
            created_at: Utc::now(),
        }
    }
}

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("delivery failed: {0}")]
    Delivery(String),

    #[error("sink unavailable")]
    Unavailable,
}

/// Delivery backend
#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn deliver(&self, notification: &Notification) -> Result<(), SinkError>;
}

/// Writes notifications to the log
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingSink;

#[async_trait]
impl NotificationSink for TracingSink {
    async fn deliver(&self, notification: &Notification) -> Result<(), SinkError> {
        info!(
            group = ?notification.group,
            subject = %notification.subject,
            payload = %notification.payload,
            "Notification"
        );
        Ok(())
    }
}

/// Keeps every delivered notification in memory
#[derive(Debug, Default)]
pub struct RecordingSink {
    delivered: Mutex<Vec<Notification>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn notifications(&self) -> Vec<Notification> {
        self.delivered.lock().await.clone()
    }

    pub async fn in_group(&self, group: RecipientGroup) -> Vec<Notification> {
        self.delivered
            .lock()
            .await
            .iter()
            .filter(|n| n.group == group)
            .cloned()
            .collect()
    }

    /// Poll until a matching notification arrives or `timeout` elapses
    pub async fn wait_for<F>(&self, pred: F, timeout: Duration) -> Option<Notification>
    where
        F: Fn(&Notification) -> bool,
    {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if let Some(found) = self.delivered.lock().await.iter().find(|n| pred(n)) {
                return Some(found.clone());
            }
            if tokio::time::Instant::now() >= deadline {
                return None;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }
}

#[async_trait]
impl NotificationSink for RecordingSink {
    async fn deliver(&self, notification: &Notification) -> Result<(), SinkError> {
        self.delivered.lock().await.push(notification.clone());
        Ok(())
    }
}

/// Handle used by the service and scheduler to publish
#[derive(Clone)]
pub struct Notifier {
    sink: Arc<dyn NotificationSink>,
    in_flight: Arc<StdMutex<JoinSet<()>>>,
}

impl std::fmt::Debug for Notifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Notifier").finish_non_exhaustive()
    }
}

impl Notifier {
    pub fn new(sink: Arc<dyn NotificationSink>) -> Self {
        Self {
            sink,
            in_flight: Arc::new(StdMutex::new(JoinSet::new())),
        }
    }

    pub fn tracing() -> Self {
        Self::new(Arc::new(TracingSink))
    }

    /// Spawn delivery and return immediately
    pub fn publish(&self, notification: Notification) {
        let sink = self.sink.clone();
        let mut in_flight = self.in_flight.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        while in_flight.try_join_next().is_some() {}
        in_flight.spawn(async move {
            match sink.deliver(&notification).await {
                Ok(()) => debug!(subject = %notification.subject, "Notification delivered"),
                Err(e) => warn!(
                    group = ?notification.group,
                    subject = %notification.subject,
                    error = %e,
                    "Notification delivery failed"
                ),
            }
        });
    }

    /// Wait for every delivery spawned so far
    pub async fn flush(&self) {
        let mut pending = {
            let mut in_flight = self.in_flight.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            std::mem::take(&mut *in_flight)
        };
        while let Some(joined) = pending.join_next().await {
            if let Err(e) = joined {
                warn!(error = %e, "Notification task ended abnormally");
            }
        }
    }

    pub fn publish_json<T: Serialize>(&self, group: RecipientGroup, subject: impl Into<String>, payload: &T) {
        let subject = subject.into();
        match serde_json::to_value(payload) {
            Ok(value) => self.publish(Notification::new(group, subject, value)),
            Err(e) => warn!(subject = %subject, error = %e, "Notification payload not serializable"),
        }
    }
}
