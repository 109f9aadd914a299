mod active;
mod demux;
mod executor;
mod pending;
mod worker;

use std::collections::hash_map::Entry;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use futures_util::future::join_all;
use serde_json::{json, Value};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::stats::ProxyStats;
use crate::types::{BatchKey, RequestLine};
use crate::upstream::Upstream;
use crate::utils::task::spawn_supervised;

use active::ActiveBatches;
use pending::PendingResponses;

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Maximum requests per emitted batch.
    pub max_batch_size: usize,
    /// Byte budget for an emitted batch payload. A single request larger
    /// than this is still admitted, alone.
    pub max_batch_bytes: usize,
    /// Maximum time a non-empty buffer is held before it is emitted.
    pub max_hold: Duration,
    /// Cadence of the worker's age/size check.
    pub tick_interval: Duration,
    /// Cadence of the upstream batch status poll.
    pub poll_interval: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_batch_size: 1000,
            max_batch_bytes: 25 * 1024 * 1024,
            max_hold: Duration::from_secs(4),
            tick_interval: Duration::from_millis(200),
            poll_interval: Duration::from_secs(5),
        }
    }
}

/// The request-batching engine: groups in-flight requests by credential and
/// endpoint, emits batches under a count/byte/age admission policy, drives
/// each batch through the upstream lifecycle, and routes every result back
/// to the caller that is blocked on it.
pub struct Engine {
    config: EngineConfig,
    upstream: Arc<dyn Upstream>,
    stats: Arc<ProxyStats>,
    pending: PendingResponses,
    lanes: Mutex<HashMap<BatchKey, mpsc::Sender<RequestLine>>>,
    active: ActiveBatches,
    shutdown: CancellationToken,
}

impl Engine {
    pub fn new(upstream: Arc<dyn Upstream>, config: EngineConfig, stats: Arc<ProxyStats>) -> Self {
        Self {
            config,
            upstream,
            stats,
            pending: PendingResponses::default(),
            lanes: Mutex::new(HashMap::new()),
            active: ActiveBatches::default(),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn stats(&self) -> &Arc<ProxyStats> {
        &self.stats
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Token that trips when `shutdown` is called; the HTTP server uses it
    /// to stop accepting connections.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Number of correlation ids still waiting on a delivery.
    pub fn pending_requests(&self) -> usize {
        self.pending.len()
    }

    /// Number of upstream batches currently in flight.
    pub fn active_batches(&self) -> usize {
        self.active.len()
    }

    /// Removes the request's delivery slot. Called by the handler on its
    /// exit path; a no-op when a delivery already consumed the slot.
    pub fn unregister(&self, request_id: &str) {
        self.pending.unregister(request_id);
    }

    /// Registers the request and hands it to its lane's batching worker,
    /// creating lane and worker on first use of a (credential, endpoint)
    /// pair. The returned channel yields exactly one value: the upstream
    /// response body or a synthesized error document.
    pub async fn enroll(
        self: Arc<Self>,
        request_id: String,
        credential: String,
        endpoint: String,
        body: Value,
    ) -> oneshot::Receiver<Value> {
        let receiver = self.pending.register(&request_id);
        let envelope = RequestLine {
            custom_id: request_id.clone(),
            method: "POST".to_string(),
            url: endpoint.clone(),
            body,
        };
        let key = BatchKey {
            credential,
            endpoint,
        };

        let sender = {
            let mut lanes = lock(&self.lanes);
            match lanes.entry(key.clone()) {
                Entry::Occupied(entry) => entry.get().clone(),
                Entry::Vacant(entry) => {
                    let (tx, rx) = mpsc::channel(1);
                    entry.insert(tx.clone());
                    info!(
                        request_id = %request_id,
                        endpoint = %key.endpoint,
                        "starting batching lane"
                    );
                    let engine = self.clone();
                    let worker_key = key.clone();
                    spawn_supervised("batching-worker", async move {
                        worker::run_lane(engine, worker_key, rx).await;
                    });
                    tx
                }
            }
        };

        if sender.send(envelope).await.is_err() {
            // The lane shut down between the handler's gate check and this
            // send; the caller still gets its one delivery.
            self.synthesize_error(&request_id, "server is shutting down");
        }
        receiver
    }

    /// Broadcasts the shutdown signal, then cancels every upstream batch
    /// that is still registered, in parallel, and waits for the cancel
    /// requests to finish. Workers flush their partial buffers on the
    /// signal; pollers observe the cancellation as a terminal status and
    /// release their callers.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();

        let cancellations = self
            .active
            .snapshot()
            .into_iter()
            .map(|(batch_id, credential)| {
                let upstream = self.upstream.clone();
                async move {
                    info!(batch_id = %batch_id, "cancelling batch");
                    if let Err(err) = upstream.cancel_batch(&credential, &batch_id).await {
                        warn!(batch_id = %batch_id, "failed to cancel batch: {err}");
                    }
                }
            });
        join_all(cancellations).await;
    }

    pub(crate) fn deliver(&self, request_id: &str, value: Value) -> bool {
        self.pending.deliver(request_id, value)
    }

    pub(crate) fn synthesize_error(&self, request_id: &str, message: &str) {
        warn!(request_id, "synthesizing error response: {message}");
        self.pending
            .deliver(request_id, json!({"error": {"message": message}}));
        self.stats.track_synthesized_error();
    }

    pub(crate) fn synthesize_error_all(&self, request_ids: &HashSet<String>, message: &str) {
        for request_id in request_ids {
            self.synthesize_error(request_id, message);
        }
    }

    pub(crate) fn remove_lane(&self, key: &BatchKey) {
        lock(&self.lanes).remove(key);
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
