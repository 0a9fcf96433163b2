mod test_harness;

use std::io::Write;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use stagehand::config::RelayConfig;
use stagehand::error::NotifyError;
use stagehand::notify::{ChannelSink, Notification, NotificationSink};
use stagehand::worker::{OutputRelay, OutputTail};
use test_harness::{drain, TestMount};

fn append(path: &Path, bytes: &[u8]) {
    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .unwrap();
    file.write_all(bytes).unwrap();
}

fn relay(poll_ms: u64, max_update_bytes: usize) -> OutputRelay {
    OutputRelay::new(RelayConfig {
        poll_interval: Duration::from_millis(poll_ms),
        max_update_bytes,
    })
}

async fn next_chunk(rx: &mut UnboundedReceiver<Notification>) -> String {
    match tokio::time::timeout(Duration::from_secs(2), rx.recv()).await {
        Ok(Some(Notification::Output { chunk, .. })) => chunk,
        other => panic!("expected an output update, got {:?}", other),
    }
}

#[tokio::test]
async fn test_tail_reads_only_new_bytes() {
    let mount = TestMount::new();
    let path = mount.dir.path().join("output.out");
    let mut tail = OutputTail::new(&path);

    assert_eq!(tail.read_new().await.unwrap(), None);

    let body = "x".repeat(100);
    append(&path, body[..40].as_bytes());
    let first = tail.read_new().await.unwrap().unwrap();
    append(&path, body[40..75].as_bytes());
    let second = tail.read_new().await.unwrap().unwrap();
    assert_eq!(tail.read_new().await.unwrap(), None);
    append(&path, body[75..].as_bytes());
    let third = tail.read_new().await.unwrap().unwrap();

    assert_eq!((first.len(), second.len(), third.len()), (40, 35, 25));
    assert_eq!(format!("{}{}{}", first, second, third), body);
    assert_eq!(tail.offset(), 100);
}

#[tokio::test]
async fn test_tail_joins_split_code_points() {
    let mount = TestMount::new();
    let path = mount.dir.path().join("output.out");
    let mut tail = OutputTail::new(&path);
    let text = "Energy: −76.02 Eh\n";
    let bytes = text.as_bytes();
    // split inside the three-byte minus sign
    let cut = text.find('−').unwrap() + 1;

    append(&path, &bytes[..cut]);
    let first = tail.read_new().await.unwrap().unwrap();
    append(&path, &bytes[cut..]);
    let second = tail.read_new().await.unwrap().unwrap();

    assert_eq!(format!("{}{}", first, second), text);
}

#[tokio::test]
async fn test_relay_sends_one_update_per_append() {
    let mount = TestMount::new();
    let path = mount.dir.path().join("output.out");
    let (sink, mut rx) = ChannelSink::new();
    let stop = CancellationToken::new();
    let job_id = Uuid::new_v4();

    let task = {
        let path = path.clone();
        let stop = stop.clone();
        tokio::spawn(async move { relay(20, 1900).run(job_id, path, &sink, stop).await })
    };

    let body = "y".repeat(100);
    append(&path, body[..40].as_bytes());
    let first = next_chunk(&mut rx).await;
    append(&path, body[40..75].as_bytes());
    let second = next_chunk(&mut rx).await;
    append(&path, body[75..].as_bytes());
    let third = next_chunk(&mut rx).await;

    stop.cancel();
    let sent = task.await.unwrap();

    assert_eq!(sent, 3);
    assert_eq!(format!("{}{}{}", first, second, third), body);
    assert!(drain(&mut rx).is_empty());
}

#[tokio::test]
async fn test_relay_splits_large_updates() {
    let mount = TestMount::new();
    let path = mount.dir.path().join("output.out");
    append(&path, "z".repeat(25).as_bytes());

    let (sink, mut rx) = ChannelSink::new();
    let stop = CancellationToken::new();
    let job_id = Uuid::new_v4();
    let task = {
        let stop = stop.clone();
        tokio::spawn(async move { relay(20, 10).run(job_id, path, &sink, stop).await })
    };

    let chunks = vec![
        next_chunk(&mut rx).await,
        next_chunk(&mut rx).await,
        next_chunk(&mut rx).await,
    ];
    stop.cancel();
    assert_eq!(task.await.unwrap(), 3);

    assert!(chunks.iter().all(|c| c.len() <= 10));
    assert_eq!(chunks.concat(), "z".repeat(25));
}

#[tokio::test]
async fn test_relay_sends_nothing_after_stop() {
    let mount = TestMount::new();
    let path = mount.dir.path().join("output.out");
    let (sink, mut rx) = ChannelSink::new();
    let stop = CancellationToken::new();
    let job_id = Uuid::new_v4();

    let task = {
        let path = path.clone();
        let stop = stop.clone();
        tokio::spawn(async move { relay(20, 1900).run(job_id, path, &sink, stop).await })
    };

    append(&path, b"before stop\n");
    assert_eq!(next_chunk(&mut rx).await, "before stop\n");

    stop.cancel();
    let sent = task.await.unwrap();
    append(&path, b"after stop\n");
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(sent, 1);
    assert!(drain(&mut rx).is_empty());
}

#[tokio::test]
async fn test_relay_forwards_output_written_just_before_stop() {
    let mount = TestMount::new();
    let path = mount.dir.path().join("output.out");
    let (sink, mut rx) = ChannelSink::new();
    let stop = CancellationToken::new();
    let job_id = Uuid::new_v4();

    let task = {
        let path = path.clone();
        let stop = stop.clone();
        tokio::spawn(async move { relay(500, 1900).run(job_id, path, &sink, stop).await })
    };

    // the first tick has passed and the next one is far away
    tokio::time::sleep(Duration::from_millis(50)).await;
    append(&path, b"FINAL ENERGY -76.02\n");
    stop.cancel();

    assert_eq!(task.await.unwrap(), 1);
    assert_eq!(next_chunk(&mut rx).await, "FINAL ENERGY -76.02\n");
    assert!(drain(&mut rx).is_empty());
}

#[tokio::test]
async fn test_relay_zero_interval_still_polls() {
    let mount = TestMount::new();
    let path = mount.dir.path().join("output.out");
    let (sink, mut rx) = ChannelSink::new();
    let stop = CancellationToken::new();

    let task = {
        let path = path.clone();
        let stop = stop.clone();
        tokio::spawn(async move { relay(0, 1900).run(Uuid::new_v4(), path, &sink, stop).await })
    };

    append(&path, b"tick\n");
    assert_eq!(next_chunk(&mut rx).await, "tick\n");
    stop.cancel();

    assert_eq!(task.await.expect("relay must not panic"), 1);
}

#[tokio::test]
async fn test_relay_missing_file_sends_nothing() {
    let mount = TestMount::new();
    let (sink, mut rx) = ChannelSink::new();
    let stop = CancellationToken::new();

    let task = {
        let stop = stop.clone();
        let path = mount.dir.path().join("never-written.out");
        tokio::spawn(async move { relay(10, 1900).run(Uuid::new_v4(), path, &sink, stop).await })
    };

    tokio::time::sleep(Duration::from_millis(80)).await;
    stop.cancel();

    assert_eq!(task.await.unwrap(), 0);
    assert!(drain(&mut rx).is_empty());
}

struct FailingSink {
    attempts: Arc<AtomicUsize>,
}

#[async_trait]
impl NotificationSink for FailingSink {
    async fn send(&self, _notification: Notification) -> Result<(), NotifyError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        Err(NotifyError::Delivery("channel unavailable".to_string()))
    }
}

#[tokio::test]
async fn test_relay_keeps_running_when_sink_fails() {
    let mount = TestMount::new();
    let path = mount.dir.path().join("output.out");
    let attempts = Arc::new(AtomicUsize::new(0));
    let sink = FailingSink {
        attempts: Arc::clone(&attempts),
    };
    let stop = CancellationToken::new();

    let task = {
        let path = path.clone();
        let stop = stop.clone();
        tokio::spawn(async move { relay(10, 1900).run(Uuid::new_v4(), path, &sink, stop).await })
    };

    append(&path, b"one\n");
    let saw_first = test_harness::wait_for(Duration::from_secs(2), || {
        let attempts = Arc::clone(&attempts);
        async move { attempts.load(Ordering::SeqCst) >= 1 }
    })
    .await;
    assert!(saw_first);

    append(&path, b"two\n");
    let saw_second = test_harness::wait_for(Duration::from_secs(2), || {
        let attempts = Arc::clone(&attempts);
        async move { attempts.load(Ordering::SeqCst) >= 2 }
    })
    .await;
    assert!(saw_second);

    stop.cancel();
    assert_eq!(task.await.unwrap(), 2);
}
