//! Rate-limited eviction executor
//!
//! Destructive pod deletions triggered by node failure flow through this
//! executor, which bounds them with a token bucket (steady rate plus burst
//! capacity). A burst of simultaneous node failures therefore spreads its
//! deletions over time instead of stampeding the cluster API.
//!
//! Submissions are queued per node; the executor's drain task is the one
//! place that blocks on token availability. A recovery event cancels a
//! node's pending, not-yet-executed deletions without touching other
//! nodes' queues. Deletions that fail against the cluster API are retried
//! on the executor's own timer, still bounded by the bucket.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::api::{PodRef, WorkloadApi};

/// Token-bucket admission state
///
/// Tokens refill continuously at `qps` up to `capacity`; consumption never
/// exceeds capacity and replenishment is monotonic in time.
#[derive(Debug)]
pub struct TokenBucket {
    capacity: f64,
    tokens: f64,
    qps: f64,
    last_refill: Instant,
}

impl TokenBucket {
    /// Create a bucket with the given steady rate and burst capacity
    pub fn new(qps: f64, burst: u32) -> Self {
        let capacity = f64::from(burst).max(1.0);
        Self {
            capacity,
            tokens: capacity,
            qps: qps.max(1e-6),
            last_refill: Instant::now(),
        }
    }

    fn refill(&mut self) {
        let now = Instant::now();
        let elapsed = now.saturating_duration_since(self.last_refill);
        self.tokens = (self.tokens + elapsed.as_secs_f64() * self.qps).min(self.capacity);
        self.last_refill = now;
    }

    /// Take one token if available
    pub fn try_acquire(&mut self) -> bool {
        self.refill();
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    /// Put one token back (an admitted action that was never executed)
    pub fn release(&mut self) {
        self.tokens = (self.tokens + 1.0).min(self.capacity);
    }

    /// Time until the next token becomes available
    pub fn next_available(&self) -> Duration {
        if self.tokens >= 1.0 {
            Duration::ZERO
        } else {
            Duration::from_secs_f64((1.0 - self.tokens) / self.qps)
        }
    }
}

/// Rate-limited executor for node-failure pod deletions
pub struct EvictionExecutor {
    workloads: Arc<dyn WorkloadApi>,
    bucket: Mutex<TokenBucket>,
    /// Per-node queues of pending deletions; an entry exists from first
    /// submission until the node's eviction is cancelled or forgotten
    queues: DashMap<String, VecDeque<PodRef>>,
    /// Delay before a failed deletion is offered again
    retry_interval: Duration,
    /// Wakes the drain task when new work arrives
    wake: Notify,
}

impl EvictionExecutor {
    /// Create an executor deleting through `workloads`, bounded by
    /// (`qps`, `burst`), retrying failed deletions after `retry_interval`
    pub fn new(workloads: Arc<dyn WorkloadApi>, qps: f64, burst: u32, retry_interval: Duration) -> Self {
        Self {
            workloads,
            bucket: Mutex::new(TokenBucket::new(qps, burst)),
            queues: DashMap::new(),
            retry_interval,
            wake: Notify::new(),
        }
    }

    /// Queue deletions for every pod bound to a failed node
    ///
    /// Pods already pending for the node are not queued twice. Returns the
    /// number of newly queued deletions.
    pub fn submit(&self, node: &str, pods: Vec<PodRef>) -> usize {
        let mut queue = self.queues.entry(node.to_string()).or_default();
        let mut queued = 0;
        for pod in pods {
            if !queue.contains(&pod) {
                queue.push_back(pod);
                queued += 1;
            }
        }
        drop(queue);

        if queued > 0 {
            info!(node = %node, queued = queued, "queued pod deletions for eviction");
            self.wake.notify_one();
        }
        queued
    }

    /// Drop a node's pending, not-yet-executed deletions
    ///
    /// Called on recovery and after node removal. Deletions already
    /// executed are not reverted. Returns the number dropped.
    pub fn cancel(&self, node: &str) -> usize {
        let dropped = self
            .queues
            .remove(node)
            .map(|(_, queue)| queue.len())
            .unwrap_or(0);
        if dropped > 0 {
            info!(node = %node, dropped = dropped, "dropped pending evictions after recovery");
        }
        dropped
    }

    /// Whether no deletions remain pending for the node
    pub fn is_drained(&self, node: &str) -> bool {
        self.queues.get(node).map(|q| q.is_empty()).unwrap_or(true)
    }

    /// Number of deletions still pending for the node
    pub fn pending(&self, node: &str) -> usize {
        self.queues.get(node).map(|q| q.len()).unwrap_or(0)
    }

    /// Pick the next pending deletion without removing it
    fn peek(&self) -> Option<(String, PodRef)> {
        self.queues.iter().find_map(|entry| {
            entry
                .value()
                .front()
                .cloned()
                .map(|pod| (entry.key().clone(), pod))
        })
    }

    /// Remove one specific pod from a node's queue; false if it was
    /// cancelled in the meantime
    fn take(&self, node: &str, pod: &PodRef) -> bool {
        match self.queues.get_mut(node) {
            Some(mut queue) => {
                let before = queue.len();
                queue.retain(|p| p != pod);
                queue.len() < before
            }
            None => false,
        }
    }

    /// Re-queue a failed deletion unless the node's eviction was cancelled
    fn requeue(&self, node: &str, pod: PodRef) {
        if let Some(mut queue) = self.queues.get_mut(node) {
            if !queue.contains(&pod) {
                queue.push_back(pod);
            }
            drop(queue);
            self.wake.notify_one();
        }
    }

    /// Drain queued deletions until cancelled
    ///
    /// One deletion is admitted per token; when the bucket is empty the
    /// task sleeps until the next token accrues. This is the only task
    /// that blocks on the bucket.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        info!("eviction executor started");
        loop {
            let (node, pod) = match self.peek() {
                Some(next) => next,
                None => {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = self.wake.notified() => {}
                    }
                    continue;
                }
            };

            // Admission: wait out the bucket before touching the queue so
            // a recovery arriving meanwhile still cancels this deletion
            let wait = {
                let mut bucket = self.bucket.lock().await;
                if bucket.try_acquire() {
                    None
                } else {
                    Some(bucket.next_available())
                }
            };
            if let Some(delay) = wait {
                debug!(delay_ms = delay.as_millis(), "eviction waiting for rate limiter");
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(delay) => {}
                }
                continue;
            }

            if !self.take(&node, &pod) {
                // Superseded by recovery while we waited; return the token
                self.bucket.lock().await.release();
                continue;
            }

            match self.workloads.delete_pod(&pod).await {
                Ok(()) => {
                    info!(node = %node, pod = %pod, "evicted pod from failed node");
                }
                Err(e) => {
                    warn!(
                        node = %node,
                        pod = %pod,
                        error = %e,
                        retry_in = ?self.retry_interval,
                        "pod deletion failed, will retry"
                    );
                    let executor = self.clone();
                    let retry_in = self.retry_interval;
                    tokio::spawn(async move {
                        tokio::time::sleep(retry_in).await;
                        executor.requeue(&node, pod);
                    });
                }
            }
        }
        info!("eviction executor stopped");
    }
}
