//! Priority request queue: bounded, store-backed, with an in-flight set
//! enforcing the (dynamically adjustable) concurrency bound.
//!
//! Two mutexes guard the queue: the heap mutex first, the in-flight mutex
//! second, always in that order when nesting is needed.

use crate::error::Result;
use crate::store::Store;
use crate::types::{now, GatewayRequest, RequestStatus};
use serde::Serialize;
use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering as AtomicOrdering};
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;

/// Heap entry: highest priority first, earliest arrival among equals.
struct QueuedEntry {
    priority: i64,
    created_at: f64,
    seq: u64,
    request: GatewayRequest,
}

impl PartialEq for QueuedEntry {
    fn eq(&self, other: &Self) -> bool {
        self.seq == other.seq
    }
}

impl Eq for QueuedEntry {}

impl PartialOrd for QueuedEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueuedEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // Max-heap: greater = dequeued first.
        self.priority
            .cmp(&other.priority)
            .then_with(|| {
                other
                    .created_at
                    .partial_cmp(&self.created_at)
                    .unwrap_or(Ordering::Equal)
            })
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

/// Snapshot of queue state for ops tooling.
#[derive(Debug, Clone, Serialize)]
pub struct QueueStats {
    pub queue_depth: usize,
    pub processing_count: usize,
    pub max_size: usize,
    pub max_concurrent: usize,
    pub by_provider: HashMap<String, usize>,
    pub by_priority: HashMap<i64, usize>,
}

pub struct RequestQueue {
    store: Arc<Store>,
    max_size: usize,
    max_concurrent: AtomicUsize,
    seq: AtomicU64,
    heap: Mutex<BinaryHeap<QueuedEntry>>,
    processing: Mutex<HashMap<String, GatewayRequest>>,
    /// Woken on enqueue so the drain loop does not need to poll tightly.
    notify: Notify,
}

impl RequestQueue {
    /// Build a queue and replay still-queued requests from the store.
    pub fn new(store: Arc<Store>, max_size: usize, max_concurrent: usize) -> Result<Self> {
        let queue = Self {
            store,
            max_size,
            max_concurrent: AtomicUsize::new(max_concurrent),
            seq: AtomicU64::new(0),
            heap: Mutex::new(BinaryHeap::new()),
            processing: Mutex::new(HashMap::new()),
            notify: Notify::new(),
        };
        let pending = queue.store.get_pending(max_size as i64)?;
        if !pending.is_empty() {
            tracing::info!(count = pending.len(), "replaying queued requests from store");
            let mut heap = queue.heap.lock().unwrap();
            for request in pending {
                let entry = queue.entry_for(request);
                heap.push(entry);
            }
        }
        Ok(queue)
    }

    fn entry_for(&self, request: GatewayRequest) -> QueuedEntry {
        QueuedEntry {
            priority: request.priority,
            created_at: request.created_at,
            seq: self.seq.fetch_add(1, AtomicOrdering::Relaxed),
            request,
        }
    }

    /// Persist and enqueue a request. Returns `false` on overflow (nothing
    /// is persisted in that case).
    pub fn enqueue(&self, request: GatewayRequest) -> Result<bool> {
        let mut heap = self.heap.lock().unwrap();
        if heap.len() >= self.max_size {
            return Ok(false);
        }
        self.store.create_request(&request)?;
        heap.push(self.entry_for(request));
        drop(heap);
        self.notify.notify_one();
        Ok(true)
    }

    /// Pop the highest-priority request that is still queued in the store.
    ///
    /// Returns `None` when the queue is empty or the in-flight set is full.
    /// Entries cancelled out-of-band are skipped and dropped.
    pub fn dequeue(&self) -> Result<Option<GatewayRequest>> {
        let mut batch = self.dequeue_up_to(1)?;
        Ok(batch.pop())
    }

    /// Atomic batch variant of [`dequeue`](Self::dequeue); returns up to `n`
    /// requests, bounded by the free in-flight slots.
    pub fn batch_dequeue(&self, n: usize) -> Result<Vec<GatewayRequest>> {
        self.dequeue_up_to(n)
    }

    fn dequeue_up_to(&self, n: usize) -> Result<Vec<GatewayRequest>> {
        let mut result = Vec::new();
        let mut heap = self.heap.lock().unwrap();
        while result.len() < n {
            let Some(entry) = heap.pop() else {
                break;
            };
            let mut request = entry.request;

            // Skip entries whose store row is no longer queued (cancelled or
            // already picked up before a restart).
            let stored = self.store.get_request(&request.id)?;
            let still_queued = stored
                .map(|r| r.status == RequestStatus::Queued)
                .unwrap_or(false);
            if !still_queued {
                continue;
            }

            let mut processing = self.processing.lock().unwrap();
            if processing.len() >= self.max_concurrent.load(AtomicOrdering::Relaxed) {
                drop(processing);
                heap.push(self.entry_for(request));
                break;
            }
            request.started_at = Some(now());
            processing.insert(request.id.clone(), request.clone());
            drop(processing);
            result.push(request);
        }
        Ok(result)
    }

    /// Persist the transition to processing for a dequeued request.
    pub fn mark_processing(&self, request_id: &str) -> Result<bool> {
        self.store
            .update_status(request_id, RequestStatus::Processing, None)
    }

    /// Release the in-flight slot and persist the terminal state.
    pub fn mark_completed(&self, request_id: &str, error: Option<&str>) -> Result<bool> {
        self.processing.lock().unwrap().remove(request_id);
        let status = if error.is_some() {
            RequestStatus::Failed
        } else {
            RequestStatus::Completed
        };
        self.store.update_status(request_id, status, None)
    }

    /// Release the slot and persist an explicit terminal state (timeout,
    /// cancellation).
    pub fn mark_terminal(&self, request_id: &str, status: RequestStatus) -> Result<bool> {
        self.processing.lock().unwrap().remove(request_id);
        self.store.update_status(request_id, status, None)
    }

    /// Release the in-flight slot without touching the store. Used when
    /// another path (timeout, cancel) already persisted the terminal state.
    pub fn release(&self, request_id: &str) {
        self.processing.lock().unwrap().remove(request_id);
    }

    /// Cancel a request: drop it from the heap and in-flight set, persist the
    /// guarded transition. Returns `false` if the request was already terminal.
    pub fn cancel(&self, request_id: &str) -> Result<bool> {
        {
            let mut heap = self.heap.lock().unwrap();
            let entries: Vec<QueuedEntry> = heap.drain().collect();
            heap.extend(entries.into_iter().filter(|e| e.request.id != request_id));
        }
        self.processing.lock().unwrap().remove(request_id);
        self.store.cancel_request(request_id)
    }

    /// Scan the in-flight set for requests past their deadline, mark them
    /// `TIMEOUT` and free their slots. Returns the timed-out ids.
    pub fn check_timeouts(&self) -> Result<Vec<String>> {
        let ts = now();
        let mut timed_out = Vec::new();
        let mut processing = self.processing.lock().unwrap();
        processing.retain(|id, request| {
            let expired = request
                .started_at
                .map(|started| ts - started > request.timeout_s)
                .unwrap_or(false);
            if expired {
                timed_out.push(id.clone());
            }
            !expired
        });
        drop(processing);
        for id in &timed_out {
            self.store.update_status(id, RequestStatus::Timeout, None)?;
        }
        Ok(timed_out)
    }

    /// Wait until new work may be available or the timeout elapses.
    pub async fn wait_for_work(&self, timeout: std::time::Duration) {
        let _ = tokio::time::timeout(timeout, self.notify.notified()).await;
    }

    pub fn depth(&self) -> usize {
        self.heap.lock().unwrap().len()
    }

    pub fn processing_count(&self) -> usize {
        self.processing.lock().unwrap().len()
    }

    /// Requests currently holding an in-flight slot.
    pub fn processing_requests(&self) -> Vec<GatewayRequest> {
        self.processing.lock().unwrap().values().cloned().collect()
    }

    pub fn max_concurrent(&self) -> usize {
        self.max_concurrent.load(AtomicOrdering::Relaxed)
    }

    /// Resize the concurrency bound; invoked live by the backpressure
    /// controller.
    pub fn set_max_concurrent(&self, limit: usize) {
        self.max_concurrent.store(limit.max(1), AtomicOrdering::Relaxed);
    }

    /// Peek at the next `n` requests in dequeue order without removing them.
    pub fn peek(&self, n: usize) -> Vec<GatewayRequest> {
        let heap = self.heap.lock().unwrap();
        let mut entries: Vec<&QueuedEntry> = heap.iter().collect();
        entries.sort_by(|a, b| b.cmp(a));
        entries
            .into_iter()
            .take(n)
            .map(|e| e.request.clone())
            .collect()
    }

    /// Drop and cancel every queued request. Returns how many were cleared.
    pub fn clear(&self) -> Result<usize> {
        let entries: Vec<QueuedEntry> = {
            let mut heap = self.heap.lock().unwrap();
            heap.drain().collect()
        };
        let count = entries.len();
        for entry in entries {
            self.store.cancel_request(&entry.request.id)?;
        }
        Ok(count)
    }

    pub fn stats(&self) -> QueueStats {
        let heap = self.heap.lock().unwrap();
        let mut by_provider: HashMap<String, usize> = HashMap::new();
        let mut by_priority: HashMap<i64, usize> = HashMap::new();
        for entry in heap.iter() {
            *by_provider.entry(entry.request.provider.clone()).or_default() += 1;
            *by_priority.entry(entry.request.priority).or_default() += 1;
        }
        let queue_depth = heap.len();
        drop(heap);
        QueueStats {
            queue_depth,
            processing_count: self.processing_count(),
            max_size: self.max_size,
            max_concurrent: self.max_concurrent(),
            by_provider,
            by_priority,
        }
    }
}
