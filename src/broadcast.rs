use futures::future::join_all;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use crate::config::BroadcastConfig;
use crate::context::ConnId;
use crate::error::Result;
use crate::locks::{LockManager, OrderToken};
use crate::metrics::{GatewayMetrics, RejectReason};
use crate::protocol::OutboundFrame;
use crate::registry::ConnectionRegistry;

/// Result of one completed broadcast, reported to observers.
#[derive(Debug, Clone)]
pub struct BroadcastOutcome {
    pub sent: usize,
    pub failed: usize,
    /// Originating context, e.g. the event type
    pub label: String,
}

/// Metrics collectors notified once per completed broadcast, and
/// separately when a broadcast batch was rejected by backpressure.
pub trait BroadcastObserver: Send + Sync + 'static {
    fn on_broadcast(&self, outcome: &BroadcastOutcome);
    fn on_rejected(&self, label: &str, targets: usize) {
        let _ = (label, targets);
    }
}

type Target = (ConnId, mpsc::Sender<OutboundFrame>);

struct WorkItem {
    targets: Vec<Target>,
    frame: OutboundFrame,
    done: oneshot::Sender<BatchResult>,
}

#[derive(Debug, Default)]
struct BatchResult {
    sent: usize,
    failed: usize,
    dead: Vec<ConnId>,
}

/// Parallel fan-out engine.
///
/// Small target sets (at or below the batch threshold) are sent
/// directly in parallel. Larger sets are split into batches distributed
/// round-robin over a fixed pool of workers, each with a bounded queue,
/// which bounds memory and gives predictable backpressure. A batch that
/// cannot be enqueued within the bounded wait is rejected and every
/// target in it is counted as failed, never silently dropped.
pub struct Broadcaster {
    config: BroadcastConfig,
    registry: Arc<ConnectionRegistry>,
    locks: Arc<LockManager>,
    metrics: Arc<GatewayMetrics>,
    observers: Vec<Arc<dyn BroadcastObserver>>,
    workers: Vec<mpsc::Sender<WorkItem>>,
    next_worker: AtomicUsize,
}

impl Broadcaster {
    pub fn new(
        config: BroadcastConfig,
        registry: Arc<ConnectionRegistry>,
        locks: Arc<LockManager>,
        metrics: Arc<GatewayMetrics>,
        observers: Vec<Arc<dyn BroadcastObserver>>,
    ) -> Self {
        let mut workers = Vec::with_capacity(config.worker_count);
        for worker_id in 0..config.worker_count {
            let (tx, mut rx) = mpsc::channel::<WorkItem>(config.queue_capacity);
            let locks = Arc::clone(&locks);
            tokio::spawn(async move {
                while let Some(item) = rx.recv().await {
                    let result = send_batch(&item.targets, &item.frame).await;
                    report_dead(&locks, &result.dead);
                    let _ = item.done.send(result);
                }
                debug!(worker_id, "broadcast worker stopped");
            });
            workers.push(tx);
        }
        Self {
            config,
            registry,
            locks,
            metrics,
            observers,
            workers,
            next_worker: AtomicUsize::new(0),
        }
    }

    /// Fan a frame out to the target snapshot. The target set was taken
    /// under the registry lock by the router; sending happens entirely
    /// outside it. No ordering is guaranteed across targets.
    pub async fn broadcast(
        &self,
        targets: &[ConnId],
        frame: OutboundFrame,
        label: &str,
    ) -> Result<BroadcastOutcome> {
        let mut resolved: Vec<Target> = Vec::with_capacity(targets.len());
        let mut failed = 0usize;
        for id in targets {
            match self.registry.sender_for(*id) {
                Some(tx) => resolved.push((*id, tx)),
                // Connection vanished between snapshot and send
                None => failed += 1,
            }
        }

        let (sent, batch_failed) = if resolved.len() <= self.config.batch_threshold {
            let result = send_batch(&resolved, &frame).await;
            report_dead(&self.locks, &result.dead);
            (result.sent, result.failed)
        } else {
            self.dispatch_batches(resolved, &frame, label).await
        };
        failed += batch_failed;

        let outcome = BroadcastOutcome {
            sent,
            failed,
            label: label.to_string(),
        };
        self.metrics.broadcast_result(sent as u64, failed as u64);
        for obs in &self.observers {
            obs.on_broadcast(&outcome);
        }
        Ok(outcome)
    }

    async fn dispatch_batches(
        &self,
        resolved: Vec<Target>,
        frame: &OutboundFrame,
        label: &str,
    ) -> (usize, usize) {
        let mut pending = Vec::new();
        let mut sent = 0usize;
        let mut failed = 0usize;

        let mut batches: Vec<Vec<Target>> = Vec::new();
        let mut current = Vec::with_capacity(self.config.batch_threshold);
        for t in resolved {
            current.push(t);
            if current.len() == self.config.batch_threshold {
                batches.push(std::mem::take(&mut current));
            }
        }
        if !current.is_empty() {
            batches.push(current);
        }

        for batch in batches {
            let idx = self.next_worker.fetch_add(1, Ordering::Relaxed) % self.workers.len();
            let (done_tx, done_rx) = oneshot::channel();
            let batch_len = batch.len();
            let item = WorkItem {
                targets: batch,
                frame: frame.clone(),
                done: done_tx,
            };
            match self.workers[idx]
                .send_timeout(item, self.config.enqueue_wait())
                .await
            {
                Ok(()) => pending.push(done_rx),
                Err(_) => {
                    // Queue full past the bounded wait: reject, count, notify
                    failed += batch_len;
                    self.metrics.rejected(RejectReason::QueueFull);
                    warn!(label, targets = batch_len, "broadcast batch rejected, queue full");
                    for obs in &self.observers {
                        obs.on_rejected(label, batch_len);
                    }
                }
            }
        }

        for rx in pending {
            match rx.await {
                Ok(result) => {
                    sent += result.sent;
                    failed += result.failed;
                }
                Err(_) => {}
            }
        }
        (sent, failed)
    }
}

/// Send one frame to every target in parallel with a bounded per-send
/// wait. Closed channels mark the connection dead for async cleanup;
/// the index is never mutated mid-broadcast.
async fn send_batch(targets: &[Target], frame: &OutboundFrame) -> BatchResult {
    let sends = targets.iter().map(|(id, tx)| {
        let frame = frame.clone();
        async move {
            match tx
                .send_timeout(frame, std::time::Duration::from_millis(250))
                .await
            {
                Ok(()) => (Some(()), None),
                Err(mpsc::error::SendTimeoutError::Timeout(_)) => (None, None),
                Err(mpsc::error::SendTimeoutError::Closed(_)) => (None, Some(*id)),
            }
        }
    });

    let mut result = BatchResult::default();
    for (ok, dead) in join_all(sends).await {
        match ok {
            Some(()) => result.sent += 1,
            None => result.failed += 1,
        }
        if let Some(id) = dead {
            result.dead.push(id);
        }
    }
    result
}

fn report_dead(locks: &LockManager, dead: &[ConnId]) {
    if dead.is_empty() {
        return;
    }
    let mut token = OrderToken::new();
    let _ = locks.with_dead_conns(&mut token, |list| list.extend_from_slice(dead));
}
