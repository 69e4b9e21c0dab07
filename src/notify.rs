use std::fmt;
use std::io;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Prepared message content. Delivery (email, SMS, ...) is the notifier's business.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    pub subject: String,
    pub recipients: Vec<String>,
    pub body: String,
}

impl Notification {
    pub fn new(subject: impl Into<String>, recipients: Vec<String>, body: impl Into<String>) -> Self {
        Self {
            subject: subject.into(),
            recipients,
            body: body.into(),
        }
    }
}

#[derive(Debug)]
pub enum NotifyError {
    NoRecipients,
    Io(io::Error),
    Rejected(String),
}

impl fmt::Display for NotifyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NotifyError::NoRecipients => write!(f, "notification has no recipients"),
            NotifyError::Io(e) => write!(f, "notification I/O error: {e}"),
            NotifyError::Rejected(msg) => write!(f, "notification rejected: {msg}"),
        }
    }
}

impl std::error::Error for NotifyError {}

impl From<io::Error> for NotifyError {
    fn from(e: io::Error) -> Self {
        NotifyError::Io(e)
    }
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, notification: &Notification) -> Result<(), NotifyError>;
}

/// Fire-and-forget delivery. Failures are logged and counted, never returned.
pub fn dispatch(notifier: Arc<dyn Notifier>, notification: Notification) -> JoinHandle<()> {
    tokio::spawn(async move {
        match notifier.notify(&notification).await {
            Ok(()) => {
                metrics::counter!(crate::observability::NOTIFICATIONS_TOTAL, "status" => "sent")
                    .increment(1);
                debug!("notification sent: {}", notification.subject);
            }
            Err(e) => {
                metrics::counter!(crate::observability::NOTIFICATIONS_TOTAL, "status" => "failed")
                    .increment(1);
                warn!(
                    "notification '{}' to {:?} failed: {e}",
                    notification.subject, notification.recipients
                );
            }
        }
    })
}

/// Writes notifications to the log. Default when no outbox is configured.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, notification: &Notification) -> Result<(), NotifyError> {
        if notification.recipients.is_empty() {
            return Err(NotifyError::NoRecipients);
        }
        info!(
            subject = %notification.subject,
            recipients = ?notification.recipients,
            "notification"
        );
        Ok(())
    }
}

/// Appends each notification as one JSON line, for an external sender to drain.
pub struct OutboxNotifier {
    file: tokio::sync::Mutex<tokio::fs::File>,
}

impl OutboxNotifier {
    pub async fn open(path: &Path) -> io::Result<Self> {
        let file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await?;
        Ok(Self {
            file: tokio::sync::Mutex::new(file),
        })
    }
}

#[async_trait]
impl Notifier for OutboxNotifier {
    async fn notify(&self, notification: &Notification) -> Result<(), NotifyError> {
        if notification.recipients.is_empty() {
            return Err(NotifyError::NoRecipients);
        }
        let mut line = serde_json::to_vec(notification)
            .map_err(|e| NotifyError::Rejected(e.to_string()))?;
        line.push(b'\n');
        let mut file = self.file.lock().await;
        file.write_all(&line).await?;
        file.flush().await?;
        Ok(())
    }
}

/// Keeps everything it is asked to send. Can be switched to fail every call.
#[derive(Debug, Default)]
pub struct MemoryNotifier {
    sent: Mutex<Vec<Notification>>,
    failing: AtomicBool,
    signal: Notify,
}

impl MemoryNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn sent(&self) -> Vec<Notification> {
        self.sent.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Wait until at least `count` notifications were sent or `timeout` passes.
    pub async fn wait_for(&self, count: usize, timeout: Duration) -> Vec<Notification> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let notified = self.signal.notified();
            let sent = self.sent();
            if sent.len() >= count {
                return sent;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return self.sent();
            }
        }
    }
}

#[async_trait]
impl Notifier for MemoryNotifier {
    async fn notify(&self, notification: &Notification) -> Result<(), NotifyError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(NotifyError::Rejected("memory notifier set to fail".into()));
        }
        self.sent
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(notification.clone());
        self.signal.notify_waiters();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn note() -> Notification {
        Notification::new("Reminder", vec!["a@example.com".into()], "see you")
    }

    #[tokio::test]
    async fn dispatch_delivers() {
        let mem = Arc::new(MemoryNotifier::new());
        dispatch(mem.clone(), note()).await.unwrap();
        assert_eq!(mem.sent(), vec![note()]);
    }

    #[tokio::test]
    async fn dispatch_swallows_failures() {
        let mem = Arc::new(MemoryNotifier::new());
        mem.set_failing(true);
        // The spawned task completes without panicking.
        dispatch(mem.clone(), note()).await.unwrap();
        assert!(mem.sent().is_empty());
    }

    #[tokio::test]
    async fn wait_for_times_out_with_what_arrived() {
        let mem = MemoryNotifier::new();
        let got = mem.wait_for(1, Duration::from_millis(20)).await;
        assert!(got.is_empty());
    }

    #[tokio::test]
    async fn log_notifier_requires_recipients() {
        let empty = Notification::new("x", vec![], "y");
        assert!(matches!(
            LogNotifier.notify(&empty).await,
            Err(NotifyError::NoRecipients)
        ));
        assert!(LogNotifier.notify(&note()).await.is_ok());
    }

    #[tokio::test]
    async fn outbox_appends_json_lines() {
        let dir = std::env::temp_dir().join("slotbook_test_outbox");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(format!("{}.jsonl", ulid::Ulid::new()));

        let outbox = OutboxNotifier::open(&path).await.unwrap();
        outbox.notify(&note()).await.unwrap();
        outbox.notify(&note()).await.unwrap();

        let raw = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<Notification> = raw
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(lines, vec![note(), note()]);

        let _ = std::fs::remove_file(&path);
    }
}
