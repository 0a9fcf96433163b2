use std::io::SeekFrom;
use std::path::PathBuf;
use std::time::Duration;

use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::RelayConfig;
use crate::notify::{send_best_effort, Notification, NotificationSink};

const MIN_POLL_INTERVAL: Duration = Duration::from_millis(1);

/// Incremental reader over a file that another process appends to.
#[derive(Debug)]
pub struct OutputTail {
    path: PathBuf,
    offset: u64,
    /// Bytes of a code point split across two reads.
    carry: Vec<u8>,
}

impl OutputTail {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            offset: 0,
            carry: Vec::new(),
        }
    }

    /// Bytes consumed so far.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Read everything appended since the previous call.
    ///
    /// Returns `Ok(None)` when there is nothing new, including when the file
    /// has not been created yet.
    pub async fn read_new(&mut self) -> std::io::Result<Option<String>> {
        let mut file = match File::open(&self.path).await {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e),
        };

        file.seek(SeekFrom::Start(self.offset)).await?;
        let mut appended = Vec::new();
        file.read_to_end(&mut appended).await?;
        if appended.is_empty() {
            return Ok(None);
        }
        self.offset += appended.len() as u64;

        let mut bytes = std::mem::take(&mut self.carry);
        bytes.extend_from_slice(&appended);
        Ok(decode_complete(bytes, &mut self.carry))
    }
}

/// Decode `bytes`, holding back an incomplete trailing UTF-8 sequence in `carry`.
fn decode_complete(mut bytes: Vec<u8>, carry: &mut Vec<u8>) -> Option<String> {
    let keep = bytes.len() - incomplete_tail(&bytes);
    *carry = bytes.split_off(keep);
    if bytes.is_empty() {
        None
    } else {
        Some(String::from_utf8_lossy(&bytes).into_owned())
    }
}

/// Length of a UTF-8 sequence cut off at the end of `bytes`, or 0.
fn incomplete_tail(bytes: &[u8]) -> usize {
    let start = bytes.len().saturating_sub(3);
    for i in (start..bytes.len()).rev() {
        let lead = bytes[i];
        if lead & 0xC0 == 0x80 {
            continue;
        }
        let width = match lead {
            0xC0..=0xDF => 2,
            0xE0..=0xEF => 3,
            0xF0..=0xF7 => 4,
            _ => return 0,
        };
        let have = bytes.len() - i;
        return if have < width { have } else { 0 };
    }
    0
}

/// Split `text` into pieces of at most `max` bytes on char boundaries.
fn split_chunks(text: &str, max: usize) -> Vec<&str> {
    let max = max.max(4);
    let mut chunks = Vec::new();
    let mut rest = text;
    while rest.len() > max {
        let mut cut = max;
        while !rest.is_char_boundary(cut) {
            cut -= 1;
        }
        let (head, tail) = rest.split_at(cut);
        chunks.push(head);
        rest = tail;
    }
    if !rest.is_empty() {
        chunks.push(rest);
    }
    chunks
}

/// Forwards a running job's output log to a notification sink.
#[derive(Debug, Clone)]
pub struct OutputRelay {
    config: RelayConfig,
}

impl OutputRelay {
    pub fn new(config: RelayConfig) -> Self {
        Self { config }
    }

    /// Poll `path` until `stop` is cancelled, sending each batch of new output.
    ///
    /// `stop` is cancelled once the process has exited, while the job still
    /// holds the running slot; whatever was appended since the last tick is
    /// forwarded before returning. Read errors are logged and retried on the
    /// next tick. Returns the number of updates sent.
    pub async fn run(
        &self,
        job_id: Uuid,
        path: PathBuf,
        sink: &dyn NotificationSink,
        stop: CancellationToken,
    ) -> usize {
        let mut tail = OutputTail::new(path);
        let period = self.config.poll_interval.max(MIN_POLL_INTERVAL);
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut sent = 0;

        tracing::debug!(job_id = %job_id, interval = ?self.config.poll_interval, "Output relay started");

        loop {
            tokio::select! {
                biased;
                _ = stop.cancelled() => {
                    sent += self.forward(job_id, &mut tail, sink).await;
                    break;
                }
                _ = ticker.tick() => {}
            }
            sent += self.forward(job_id, &mut tail, sink).await;
        }

        tracing::debug!(job_id = %job_id, updates = sent, bytes = tail.offset(), "Output relay stopped");
        sent
    }

    async fn forward(&self, job_id: Uuid, tail: &mut OutputTail, sink: &dyn NotificationSink) -> usize {
        let text = match tail.read_new().await {
            Ok(Some(text)) => text,
            Ok(None) => return 0,
            Err(e) => {
                tracing::warn!(job_id = %job_id, error = %e, "Failed to read job output, retrying");
                return 0;
            }
        };

        let chunks = split_chunks(&text, self.config.max_update_bytes);
        for chunk in &chunks {
            send_best_effort(
                sink,
                Notification::Output {
                    job_id,
                    chunk: chunk.to_string(),
                },
            )
            .await;
        }
        chunks.len()
    }
}
