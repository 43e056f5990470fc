use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::Mutex;
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio::time::{self, Duration, Instant};

/// A durable record of a stream entry that exhausted its retry budget.
///
/// Written once, never deleted by the gateway; external operator
/// tooling consumes these for inspection and replay.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetterRecord {
    /// Stream the entry was consumed from
    pub stream: String,
    /// Original payload, verbatim
    pub payload: serde_json::Value,
    /// Delivery attempts made before dead-lettering
    pub retry_count: u32,
    /// Error from the final attempt
    pub last_error: String,
    pub timestamp: DateTime<Utc>,
    /// Consumer that gave up on the entry
    pub consumer: String,
}

#[async_trait]
pub trait DeadLetterSink: Send + Sync + 'static {
    async fn append(&self, record: DeadLetterRecord) -> std::io::Result<()>;
}

/// Policy for when to sync dead-letter data to disk.
#[derive(Debug, Clone)]
pub enum DurabilityPolicy {
    /// Sync after every write
    Always,
    /// Sync at the given interval in milliseconds
    IntervalMs(u64),
    /// Never explicitly sync
    Disabled,
}

/// Configuration for the file-backed sink.
#[derive(Debug, Clone)]
pub struct SinkConfig {
    pub base_dir: PathBuf,
    pub channel_capacity: usize,
    pub batch_max: usize,
    pub flush_interval_ms: u64,
    pub durability: DurabilityPolicy,
}

impl Default for SinkConfig {
    fn default() -> Self {
        Self {
            base_dir: PathBuf::from("data/deadletter"),
            channel_capacity: 1024,
            batch_max: 128,
            flush_interval_ms: 100,
            durability: DurabilityPolicy::IntervalMs(500),
        }
    }
}

/// File-backed dead-letter sink writing JSON Lines, one file per stream.
///
/// Appends flow through a bounded channel to a background writer that
/// batches and flushes on an interval, so dead-lettering never blocks
/// the ingress loop on disk I/O.
#[derive(Clone)]
pub struct FileDeadLetterSink {
    tx: mpsc::Sender<DeadLetterRecord>,
}

impl FileDeadLetterSink {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self::new_with_config(SinkConfig {
            base_dir: base_dir.into(),
            ..SinkConfig::default()
        })
    }

    pub fn new_with_config(cfg: SinkConfig) -> Self {
        let (tx, mut rx) = mpsc::channel::<DeadLetterRecord>(cfg.channel_capacity);
        tokio::spawn(async move {
            let _ = fs::create_dir_all(&cfg.base_dir).await;
            let mut queue: VecDeque<DeadLetterRecord> = VecDeque::with_capacity(cfg.batch_max);
            let mut ticker = time::interval(Duration::from_millis(cfg.flush_interval_ms));
            let mut last_sync = Instant::now();

            loop {
                tokio::select! {
                    maybe = rx.recv() => {
                        match maybe {
                            Some(rec) => queue.push_back(rec),
                            None => {
                                flush_batch(&cfg, &mut queue, &mut last_sync).await.ok();
                                break;
                            }
                        }
                        if queue.len() >= cfg.batch_max {
                            let _ = flush_batch(&cfg, &mut queue, &mut last_sync).await;
                        }
                    }
                    _ = ticker.tick() => {
                        if !queue.is_empty() {
                            let _ = flush_batch(&cfg, &mut queue, &mut last_sync).await;
                        }
                    }
                }
            }
        });
        Self { tx }
    }
}

fn sanitize(s: &str) -> String {
    s.chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect()
}

async fn flush_batch(
    cfg: &SinkConfig,
    queue: &mut VecDeque<DeadLetterRecord>,
    last_sync: &mut Instant,
) -> std::io::Result<()> {
    while let Some(rec) = queue.pop_front() {
        let path = cfg
            .base_dir
            .join(format!("{}.jsonl", sanitize(&rec.stream)));
        let mut f = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        let line = serde_json::to_string(&rec)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        f.write_all(line.as_bytes()).await?;
        f.write_all(b"\n").await?;

        match cfg.durability {
            DurabilityPolicy::Always => {
                let _ = f.sync_data().await;
            }
            DurabilityPolicy::IntervalMs(ms) => {
                if last_sync.elapsed() >= Duration::from_millis(ms) {
                    let _ = f.sync_data().await;
                    *last_sync = Instant::now();
                }
            }
            DurabilityPolicy::Disabled => {}
        }
    }
    Ok(())
}

#[async_trait]
impl DeadLetterSink for FileDeadLetterSink {
    async fn append(&self, record: DeadLetterRecord) -> std::io::Result<()> {
        self.tx.send(record).await.map_err(|_| {
            std::io::Error::new(std::io::ErrorKind::BrokenPipe, "dead-letter channel closed")
        })
    }
}

/// In-memory sink for tests and embedded use.
#[derive(Debug, Default)]
pub struct MemoryDeadLetterSink {
    records: Mutex<Vec<DeadLetterRecord>>,
}

impl MemoryDeadLetterSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<DeadLetterRecord> {
        self.records.lock().expect("sink lock poisoned").clone()
    }
}

#[async_trait]
impl DeadLetterSink for MemoryDeadLetterSink {
    async fn append(&self, record: DeadLetterRecord) -> std::io::Result<()> {
        self.records
            .lock()
            .expect("sink lock poisoned")
            .push(record);
        Ok(())
    }
}
