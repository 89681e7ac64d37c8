//! Admission control and redelivery through the stream consumer.

mod common;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use repobox::consumer::{ConsumerSettings, Disposition, StreamConsumer};
use repobox::pool::{JobHandler, WorkerPool};
use repobox::store::{Delivery, JobQueue, JobStore, MemoryQueue, MemoryStore};
use repobox_common::{JobMessage, JobStatus};
use tokio_util::sync::CancellationToken;

use common::envelope;

/// Records what it was handed; does not ack or release anything.
#[derive(Default)]
struct Recorder {
    seen: Mutex<Vec<JobMessage>>,
}

impl Recorder {
    fn ids(&self) -> Vec<String> {
        self.seen
            .lock()
            .unwrap()
            .iter()
            .map(|m| m.job.id.clone())
            .collect()
    }
}

#[async_trait]
impl JobHandler for Recorder {
    async fn handle(&self, msg: JobMessage) {
        self.seen.lock().unwrap().push(msg);
    }
}

/// Records each message, then blocks until the gate opens.
struct Gated {
    seen: Mutex<Vec<String>>,
    gate: tokio::sync::Semaphore,
}

impl Gated {
    fn new() -> Self {
        Self {
            seen: Mutex::new(Vec::new()),
            gate: tokio::sync::Semaphore::new(0),
        }
    }

    fn ids(&self) -> Vec<String> {
        self.seen.lock().unwrap().clone()
    }

    fn open(&self) {
        self.gate.add_permits(64);
    }
}

#[async_trait]
impl JobHandler for Gated {
    async fn handle(&self, msg: JobMessage) {
        self.seen.lock().unwrap().push(msg.job.id);
        let _permit = self.gate.acquire().await;
    }
}

async fn read_one(queue: &MemoryQueue, job_id: &str, user_id: &str) -> Delivery {
    queue.push(envelope(job_id, user_id, "https://example.com/acme/widgets.git", "p"));
    queue
        .read(1, Duration::from_millis(100))
        .await
        .unwrap()
        .pop()
        .unwrap()
}

async fn wait_for(cond: impl Fn() -> bool) {
    for _ in 0..200 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached");
}

struct Fixture {
    store: Arc<MemoryStore>,
    queue: Arc<MemoryQueue>,
    pool: Arc<WorkerPool>,
    recorder: Arc<Recorder>,
    consumer: StreamConsumer,
}

fn fixture(settings: ConsumerSettings) -> Fixture {
    let store = Arc::new(MemoryStore::new());
    let queue = Arc::new(MemoryQueue::new());
    let recorder = Arc::new(Recorder::default());
    let pool = Arc::new(WorkerPool::start(2, 8, recorder.clone()));
    let consumer = StreamConsumer::new(queue.clone(), store.clone(), pool.clone(), settings);
    Fixture {
        store,
        queue,
        pool,
        recorder,
        consumer,
    }
}

fn settings(limit: u32) -> ConsumerSettings {
    ConsumerSettings {
        per_user_limit: limit,
        job_timeout: Duration::from_secs(60),
        block: Duration::from_millis(50),
        reclaim_interval: Duration::from_millis(100),
        reclaim_idle: Duration::ZERO,
        error_backoff: Duration::from_millis(10),
        ..Default::default()
    }
}

impl Fixture {
    async fn deliver(&self, job_id: &str, user_id: &str) -> Delivery {
        self.queue
            .push(envelope(job_id, user_id, "https://example.com/acme/widgets.git", "p"));
        self.queue
            .read(1, Duration::from_millis(100))
            .await
            .unwrap()
            .pop()
            .unwrap()
    }
}

#[tokio::test]
async fn test_per_user_limit_defers_excess_jobs() {
    let f = fixture(settings(2));
    let mut outcomes = Vec::new();
    for n in 0..3 {
        let d = f.deliver(&format!("job-{}", n), "u1").await;
        outcomes.push(f.consumer.process(d).await);
    }
    let other = f.deliver("job-other", "u2").await;
    outcomes.push(f.consumer.process(other).await);

    assert_eq!(
        outcomes,
        vec![
            Disposition::Dispatched,
            Disposition::Dispatched,
            Disposition::Deferred,
            Disposition::Dispatched,
        ]
    );
    assert_eq!(f.store.running("u1"), 2);
    assert_eq!(f.store.running("u2"), 1);
    // Deferred message stays pending; dispatched ones wait for the executor.
    assert!(f.queue.acked().is_empty());
    assert_eq!(f.queue.pending_ids().len(), 4);

    f.pool.stop().await;
    let mut ids = f.recorder.ids();
    ids.sort();
    assert_eq!(ids, vec!["job-0", "job-1", "job-other"]);
}

#[tokio::test]
async fn test_malformed_envelope_is_acked() {
    let f = fixture(settings(2));
    let mut fields = envelope("job-1", "u1", "https://example.com/a/b.git", "p");
    fields.remove("prompt");
    let id = f.queue.push(fields);
    let d = f.queue.read(1, Duration::from_millis(100)).await.unwrap().pop().unwrap();

    assert_eq!(f.consumer.process(d).await, Disposition::Acked);
    assert_eq!(f.queue.acked(), vec![id]);
    assert_eq!(f.store.running("u1"), 0);
}

#[tokio::test]
async fn test_finished_job_is_acked_as_duplicate() {
    let f = fixture(settings(2));
    f.store.insert_job("job-1", JobStatus::Failed, Some(Utc::now()));
    let d = f.deliver("job-1", "u1").await;
    let id = d.id.clone();

    assert_eq!(f.consumer.process(d).await, Disposition::Acked);
    assert_eq!(f.queue.acked(), vec![id]);
    f.pool.stop().await;
    assert!(f.recorder.ids().is_empty());
}

#[tokio::test]
async fn test_recently_started_job_is_left_pending() {
    let f = fixture(settings(2));
    f.store.insert_job("job-1", JobStatus::Running, Some(Utc::now()));
    let d = f.deliver("job-1", "u1").await;

    assert_eq!(f.consumer.process(d).await, Disposition::Deferred);
    assert_eq!(f.store.running("u1"), 0);
    assert!(f.queue.acked().is_empty());
}

#[tokio::test]
async fn test_stale_running_job_is_recovered() {
    let f = fixture(settings(1));
    f.store.insert_job(
        "job-1",
        JobStatus::Running,
        Some(Utc::now() - chrono::Duration::minutes(10)),
    );
    // The crashed run still holds the user's only slot.
    f.store.set_running("u1", 1);
    let d = f.deliver("job-1", "u1").await;

    assert_eq!(f.consumer.process(d).await, Disposition::Dispatched);
    assert_eq!(f.store.running("u1"), 1);

    f.pool.stop().await;
    let seen = f.recorder.seen.lock().unwrap();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].job.status, JobStatus::Running);
}

#[tokio::test]
async fn test_stopped_pool_releases_slot_and_defers() {
    let f = fixture(settings(2));
    f.pool.stop().await;
    let d = f.deliver("job-1", "u1").await;

    assert_eq!(f.consumer.process(d).await, Disposition::Deferred);
    assert_eq!(f.store.running("u1"), 0);
    assert_eq!(f.queue.pending_ids().len(), 1);
}

#[tokio::test]
async fn test_deferred_job_is_reclaimed_once_slot_frees() {
    let f = fixture(settings(1));
    let first = f.deliver("job-1", "u1").await;
    let second = f.deliver("job-2", "u1").await;
    assert_eq!(f.consumer.process(first).await, Disposition::Dispatched);
    assert_eq!(f.consumer.process(second).await, Disposition::Deferred);

    // Executor finished job-1.
    f.store.release_slot("u1").await.unwrap();
    f.queue.ack("1-0").await.unwrap();

    assert_eq!(f.consumer.reclaim_pending().await, 1);
    f.pool.stop().await;
    let mut ids = f.recorder.ids();
    ids.sort();
    assert_eq!(ids, vec!["job-1", "job-2"]);
}

#[tokio::test]
async fn test_run_dispatches_until_shutdown() {
    // Dispatched messages stay pending until acked; keep reclaim away from them.
    let f = fixture(ConsumerSettings {
        reclaim_idle: Duration::from_secs(60),
        ..settings(5)
    });
    for n in 0..3 {
        f.queue
            .push(envelope(&format!("job-{}", n), "u1", "https://example.com/a/b.git", "p"));
    }
    let shutdown = CancellationToken::new();
    let stopper = shutdown.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(300)).await;
        stopper.cancel();
    });

    tokio::time::timeout(Duration::from_secs(5), f.consumer.run(shutdown))
        .await
        .unwrap()
        .unwrap();
    f.pool.stop().await;

    let mut ids = f.recorder.ids();
    ids.sort();
    assert_eq!(ids, vec!["job-0", "job-1", "job-2"]);
    assert_eq!(f.store.running("u1"), 3);
}

#[tokio::test]
async fn test_reclaim_skips_messages_held_by_pool() {
    let store = Arc::new(MemoryStore::new());
    let queue = Arc::new(MemoryQueue::new());
    let gated = Arc::new(Gated::new());
    // One worker: job-a runs, job-b waits in the pool queue.
    let pool = Arc::new(WorkerPool::start(1, 8, gated.clone()));
    let consumer = StreamConsumer::new(queue.clone(), store.clone(), pool.clone(), settings(3));

    let a = read_one(&queue, "job-a", "u1").await;
    let b = read_one(&queue, "job-b", "u1").await;
    assert_eq!(consumer.process(a).await, Disposition::Dispatched);
    assert_eq!(consumer.process(b.clone()).await, Disposition::Dispatched);
    wait_for(|| gated.ids() == vec!["job-a"]).await;

    assert_eq!(consumer.reclaim_pending().await, 0);
    assert_eq!(consumer.process(b).await, Disposition::Held);
    assert_eq!(store.running("u1"), 2);

    gated.open();
    pool.stop().await;
    assert_eq!(gated.ids(), vec!["job-a", "job-b"]);
    assert_eq!(store.running("u1"), 2);
}

#[tokio::test]
async fn test_keepalive_refreshes_held_messages() {
    let store = Arc::new(MemoryStore::new());
    let queue = Arc::new(MemoryQueue::new());
    let gated = Arc::new(Gated::new());
    let pool = Arc::new(WorkerPool::start(1, 8, gated.clone()));
    let idle = Duration::from_millis(300);
    let consumer = StreamConsumer::new(
        queue.clone(),
        store.clone(),
        pool.clone(),
        ConsumerSettings {
            reclaim_idle: idle,
            ..settings(2)
        },
    );
    let stop = CancellationToken::new();
    let keepalive = consumer.spawn_keepalive(stop.clone());

    let d = read_one(&queue, "job-a", "u1").await;
    assert_eq!(consumer.process(d).await, Disposition::Dispatched);
    tokio::time::sleep(idle * 3).await;

    // Another runner sharing the group would see nothing to take over.
    assert!(queue.reclaim(idle, 10).await.unwrap().is_empty());

    stop.cancel();
    keepalive.await.unwrap();
    gated.open();
    pool.stop().await;
}
