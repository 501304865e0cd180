//! Notification side channel
//!
//! Fire-and-forget delivery of session events (sign-in mail and the like).
//! Nothing here can fail a turn: delivery runs on its own task and errors
//! are only logged.

use crate::Result;
use serde::Serialize;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum Notification {
    SessionStarted {
        user_id: String,
        companion_id: String,
    },
}

impl Notification {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::SessionStarted { .. } => "session_started",
        }
    }
}

#[async_trait::async_trait]
pub trait NotificationSink: Send + Sync {
    async fn notify(&self, notification: &Notification) -> Result<()>;
}

/// Writes notifications to the log
#[derive(Debug, Default)]
pub struct LogNotifier;

#[async_trait::async_trait]
impl NotificationSink for LogNotifier {
    async fn notify(&self, notification: &Notification) -> Result<()> {
        info!("Notification: {}", serde_json::to_string(notification)?);
        Ok(())
    }
}

/// Deliver `notification` in the background. The handle can be awaited but
/// callers normally drop it.
pub fn dispatch(sink: Arc<dyn NotificationSink>, notification: Notification) -> JoinHandle<()> {
    tokio::spawn(async move {
        if let Err(e) = sink.notify(&notification).await {
            warn!("Notification {} not delivered: {}", notification.kind(), e);
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::CompanionError;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Failing(AtomicUsize);

    #[async_trait::async_trait]
    impl NotificationSink for Failing {
        async fn notify(&self, _notification: &Notification) -> Result<()> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Err(CompanionError::Configuration("smtp unreachable".into()))
        }
    }

    fn started() -> Notification {
        Notification::SessionStarted {
            user_id: "u1".into(),
            companion_id: "luna".into(),
        }
    }

    #[tokio::test]
    async fn test_failed_delivery_is_contained() {
        let sink = Arc::new(Failing(AtomicUsize::new(0)));
        dispatch(sink.clone(), started()).await.unwrap();
        assert_eq!(sink.0.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_log_notifier_accepts() {
        assert!(LogNotifier.notify(&started()).await.is_ok());
    }

    #[test]
    fn test_notification_json() {
        let value = serde_json::to_value(started()).unwrap();
        assert_eq!(value["event"], "session_started");
        assert_eq!(value["user_id"], "u1");
    }
}
