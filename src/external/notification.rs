//! Outbound notification abstraction
//!
//! Notifications are fire-and-forget: the engine enqueues them after a
//! transition has been written and swallows any failure.

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use thiserror::Error;
use tokio::sync::Mutex;

use crate::model::UserId;

#[cfg(test)]
use mockall::automock;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum NotificationError {
    #[error("Notification queue unavailable: {message}")]
    Unavailable { message: String },
    #[error("Unknown notification template: {template_code}")]
    UnknownTemplate { template_code: String },
}

#[cfg_attr(test, automock)]
#[async_trait]
pub trait NotificationSink: Send + Sync {
    /// Queue a templated notification for delivery to `user_id`
    async fn enqueue(
        &self,
        user_id: &UserId,
        template_code: &str,
        payload: serde_json::Value,
    ) -> Result<(), NotificationError>;
}

#[derive(Debug, Clone, PartialEq)]
pub struct QueuedNotification {
    pub user_id: UserId,
    pub template_code: String,
    pub payload: serde_json::Value,
}

/// Keeps every enqueued notification in memory. Used by the binary when no
/// delivery backend is wired and by integration tests.
#[derive(Debug, Default)]
pub struct RecordingNotificationSink {
    sent: Mutex<Vec<QueuedNotification>>,
    fail: AtomicBool,
}

impl RecordingNotificationSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent `enqueue` fail
    pub fn fail_deliveries(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    pub async fn sent(&self) -> Vec<QueuedNotification> {
        self.sent.lock().await.clone()
    }

    pub async fn sent_with_template(&self, template_code: &str) -> Vec<QueuedNotification> {
        self.sent
            .lock()
            .await
            .iter()
            .filter(|n| n.template_code == template_code)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl NotificationSink for RecordingNotificationSink {
    async fn enqueue(
        &self,
        user_id: &UserId,
        template_code: &str,
        payload: serde_json::Value,
    ) -> Result<(), NotificationError> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(NotificationError::Unavailable {
                message: "delivery disabled".to_string(),
            });
        }
        self.sent.lock().await.push(QueuedNotification {
            user_id: user_id.clone(),
            template_code: template_code.to_string(),
            payload,
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_recording_sink_keeps_order() {
        let sink = RecordingNotificationSink::new();
        let user = UserId::from("c1");
        sink.enqueue(&user, "step_completed", serde_json::json!({"n": 1}))
            .await
            .unwrap();
        sink.enqueue(&user, "step_rejected", serde_json::json!({"n": 2}))
            .await
            .unwrap();

        let sent = sink.sent().await;
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[0].template_code, "step_completed");
        assert_eq!(sink.sent_with_template("step_rejected").await.len(), 1);
    }

    #[tokio::test]
    async fn test_recording_sink_failure_mode() {
        let sink = RecordingNotificationSink::new();
        sink.fail_deliveries(true);
        let result = sink
            .enqueue(&UserId::from("c1"), "step_completed", serde_json::json!({}))
            .await;
        assert!(matches!(result, Err(NotificationError::Unavailable { .. })));
        assert!(sink.sent().await.is_empty());
    }
}
