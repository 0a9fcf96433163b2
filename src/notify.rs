//! Notification sink for job progress and delivery.
//!
//! The pipeline only ever writes to a sink; where the messages end up (a chat
//! channel, a log, a test recorder) is up to the implementation.

use std::path::PathBuf;

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::error::NotifyError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AttachmentKind {
    /// Zip of the whole working directory.
    Archive,
    /// Raw output log, sent when the archive could not be delivered.
    OutputLog,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Notification {
    Progress {
        job_id: Uuid,
        text: String,
    },
    Output {
        job_id: Uuid,
        chunk: String,
    },
    Summary {
        job_id: Uuid,
        success: bool,
        elapsed: Option<String>,
        text: String,
    },
    Attachment {
        job_id: Uuid,
        path: PathBuf,
        kind: AttachmentKind,
    },
    Ping {
        job_id: Uuid,
        author: String,
    },
}

impl Notification {
    pub fn job_id(&self) -> Uuid {
        match self {
            Notification::Progress { job_id, .. }
            | Notification::Output { job_id, .. }
            | Notification::Summary { job_id, .. }
            | Notification::Attachment { job_id, .. }
            | Notification::Ping { job_id, .. } => *job_id,
        }
    }
}

#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn send(&self, notification: Notification) -> Result<(), NotifyError>;
}

/// Sink that writes every notification to the tracing log.
#[derive(Debug, Default, Clone)]
pub struct LogSink;

#[async_trait]
impl NotificationSink for LogSink {
    async fn send(&self, notification: Notification) -> Result<(), NotifyError> {
        match &notification {
            Notification::Progress { job_id, text } => {
                tracing::info!(job_id = %job_id, "{}", text);
            }
            Notification::Output { job_id, chunk } => {
                tracing::info!(job_id = %job_id, bytes = chunk.len(), "Output: {}", chunk.trim_end());
            }
            Notification::Summary {
                job_id,
                success,
                elapsed,
                text,
            } => {
                tracing::info!(job_id = %job_id, success, elapsed = ?elapsed, "{}", text);
            }
            Notification::Attachment { job_id, path, kind } => {
                tracing::info!(job_id = %job_id, kind = ?kind, path = %path.display(), "Delivered attachment");
            }
            Notification::Ping { job_id, author } => {
                tracing::info!(job_id = %job_id, author = %author, "Requester pinged");
            }
        }
        Ok(())
    }
}

/// Sink that forwards notifications into an mpsc channel.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<Notification>,
}

impl ChannelSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Notification>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

#[async_trait]
impl NotificationSink for ChannelSink {
    async fn send(&self, notification: Notification) -> Result<(), NotifyError> {
        self.tx.send(notification).map_err(|_| NotifyError::Closed)
    }
}

/// Send without propagating failures. Sink problems must never stop a job.
pub async fn send_best_effort(sink: &dyn NotificationSink, notification: Notification) {
    let job_id = notification.job_id();
    if let Err(e) = sink.send(notification).await {
        tracing::warn!(job_id = %job_id, error = %e, "Failed to deliver notification");
    }
}
