//! The Consumer: owns the receive loop, dispatches each message through
//! Guard + Heartbeat + compute, writes status transitions to the Store,
//! and acknowledges the queue (spec.md §4.4).
//!
//! Grounded in the teacher's `fc-router::lifecycle::LifecycleManager`
//! (background tasks behind one shared `broadcast::Sender<()>`, started
//! from an explicit `start`/`shutdown` pair rather than object
//! construction) and in the Python original's `consumer.py`, whose nested
//! `with` blocks (heartbeat, ECS protection, processing lock) become the
//! acquire/release scope in `process_one_message` below, released in
//! reverse order on every exit path.
//!
//! The compute-function admission check the Python original performs at
//! construction time (`inspect.signature`) has no counterpart here: a
//! `ComputeFn` implementor already has the right shape by construction
//! (see `tb_common::compute`), so there is nothing left to validate.

pub mod error;

use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use tokio::sync::{broadcast, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tracing::{error, info, info_span, warn, Instrument};

pub use error::{ConsumerError, ProcessingError, Result};

use tb_common::{ComputeFailure, ComputeFn, QueuedMessage};
use tb_guard::ScaleInGuard;
use tb_heartbeat::{Heartbeat, HeartbeatConfig};
use tb_queue::QueueConsumer;
use tb_store::StatusStore;

/// Tuning for one Consumer instance (spec.md §4.4, §6).
#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    /// Long-poll wait for each `poll(1)` call.
    pub queue_wait_time_seconds: u32,
    /// TTL on the IN_PROGRESS row written before compute runs.
    pub in_progress_ttl_seconds: i64,
    pub heartbeat_visibility_timeout_seconds: u32,
    pub heartbeat_interval_seconds: f64,
    /// `ComputeFailure::kind` values that classify as `ConsumerUnretryable`.
    pub non_retryable_error_kinds: Vec<String>,
    pub stop_timeout: Duration,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            queue_wait_time_seconds: 1,
            in_progress_ttl_seconds: 600,
            heartbeat_visibility_timeout_seconds: 30,
            heartbeat_interval_seconds: 10.0,
            non_retryable_error_kinds: Vec::new(),
            stop_timeout: Duration::from_secs(10),
        }
    }
}

struct Inner {
    shutdown_tx: Option<broadcast::Sender<()>>,
    handle: Option<JoinHandle<()>>,
    processing_lock: Option<Arc<AsyncMutex<()>>>,
}

/// Owns the receive loop for one queue. See spec.md §4.4 for the
/// {stopped -> running -> stopping -> stopped} state machine.
pub struct Consumer {
    queue: Arc<dyn QueueConsumer>,
    store: Arc<dyn StatusStore>,
    guard: Arc<dyn ScaleInGuard>,
    compute_fn: Arc<dyn ComputeFn>,
    config: ConsumerConfig,
    inner: StdMutex<Inner>,
}

impl Consumer {
    pub fn new(
        queue: Arc<dyn QueueConsumer>,
        store: Arc<dyn StatusStore>,
        guard: Arc<dyn ScaleInGuard>,
        compute_fn: Arc<dyn ComputeFn>,
        config: ConsumerConfig,
    ) -> Self {
        Self {
            queue,
            store,
            guard,
            compute_fn,
            config,
            inner: StdMutex::new(Inner {
                shutdown_tx: None,
                handle: None,
                processing_lock: None,
            }),
        }
    }

    pub fn is_running(&self) -> bool {
        let inner = self.inner.lock().expect("consumer mutex poisoned");
        inner.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Cheap queue connectivity check, used by the `/ready` probe
    /// (spec.md §4.4: "queue reachable").
    pub async fn ping_queue(&self) -> bool {
        self.queue.ping().await.is_ok()
    }

    /// `is_running` and the processing-lock is currently held.
    pub fn is_processing_message(&self) -> Result<bool> {
        let inner = self.inner.lock().expect("consumer mutex poisoned");
        if !inner.handle.as_ref().is_some_and(|h| !h.is_finished()) {
            return Ok(false);
        }
        let lock = inner
            .processing_lock
            .as_ref()
            .ok_or(ConsumerError::ProcessingLockInvariant)?;
        match lock.try_lock() {
            Ok(_guard) => Ok(false),
            Err(_) => Ok(true),
        }
    }

    pub fn start_consuming(&self) -> Result<()> {
        let mut inner = self.inner.lock().expect("consumer mutex poisoned");
        if inner.handle.as_ref().is_some_and(|h| !h.is_finished()) {
            return Err(ConsumerError::AlreadyConsuming);
        }

        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let processing_lock = Arc::new(AsyncMutex::new(()));

        let queue = self.queue.clone();
        let store = self.store.clone();
        let guard = self.guard.clone();
        let compute_fn = self.compute_fn.clone();
        let config = self.config.clone();
        let lock_for_loop = processing_lock.clone();

        let handle = tokio::spawn(receive_loop(
            queue,
            store,
            guard,
            compute_fn,
            config,
            lock_for_loop,
            shutdown_rx,
        ));

        inner.shutdown_tx = Some(shutdown_tx);
        inner.handle = Some(handle);
        inner.processing_lock = Some(processing_lock);
        info!("consumer started");
        Ok(())
    }

    /// No-op if already stopped.
    pub async fn stop_consuming(&self, timeout: Option<Duration>) -> Result<()> {
        let timeout = timeout.unwrap_or(self.config.stop_timeout);

        let (shutdown_tx, handle) = {
            let mut inner = self.inner.lock().expect("consumer mutex poisoned");
            (inner.shutdown_tx.take(), inner.handle.take())
        };

        let Some(shutdown_tx) = shutdown_tx else {
            return Ok(());
        };
        let _ = shutdown_tx.send(());

        if let Some(handle) = handle {
            match tokio::time::timeout(timeout, handle).await {
                Ok(_) => {}
                Err(_) => return Err(ConsumerError::StopTimeout(timeout)),
            }
        }

        info!("consumer stopped");
        Ok(())
    }
}

async fn receive_loop(
    queue: Arc<dyn QueueConsumer>,
    store: Arc<dyn StatusStore>,
    guard: Arc<dyn ScaleInGuard>,
    compute_fn: Arc<dyn ComputeFn>,
    config: ConsumerConfig,
    processing_lock: Arc<AsyncMutex<()>>,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    loop {
        tokio::select! {
            biased;
            _ = shutdown_rx.recv() => {
                info!("consumer received stop signal");
                break;
            }
            poll_result = queue.poll(1) => {
                match poll_result {
                    Ok(mut messages) => {
                        let Some(queued) = messages.pop() else { continue; };
                        process_one_message(
                            &queue,
                            &store,
                            &guard,
                            &compute_fn,
                            &config,
                            &processing_lock,
                            queued,
                        )
                        .await;
                    }
                    Err(e) => {
                        error!(error = %e, "consumer receive loop terminated by an uncaught queue error");
                        return;
                    }
                }
            }
        }
    }
}

async fn process_one_message(
    queue: &Arc<dyn QueueConsumer>,
    store: &Arc<dyn StatusStore>,
    guard: &Arc<dyn ScaleInGuard>,
    compute_fn: &Arc<dyn ComputeFn>,
    config: &ConsumerConfig,
    processing_lock: &Arc<AsyncMutex<()>>,
    queued: QueuedMessage,
) {
    let message_id = queued.message_id.clone();
    let span = info_span!("process_message", message_id = %message_id);

    async {
        let heartbeat_config = HeartbeatConfig {
            visibility_timeout_seconds: config.heartbeat_visibility_timeout_seconds,
            interval_seconds: config.heartbeat_interval_seconds,
            default_stop_timeout: config.stop_timeout,
            join_on_stop: true,
        };
        let heartbeat = match Heartbeat::new(
            queue.clone(),
            message_id.clone(),
            queued.receipt_handle.clone(),
            heartbeat_config,
        ) {
            Ok(h) => h,
            Err(e) => {
                error!(error = %e, "failed to construct heartbeat for this message");
                return;
            }
        };
        heartbeat.start();

        if let Err(e) = guard.acquire().await {
            warn!(error = %e, "scale-in guard acquire failed, continuing without protection");
        }

        let processing_guard = processing_lock.try_lock();
        match processing_guard {
            Ok(_guard) => {
                process_message_wrapped(queue, store, compute_fn, config, &queued).await;
            }
            Err(_) => {
                error!("processing lock already held on receive (internal invariant violation), skipping message");
            }
        }

        if let Err(e) = guard.release().await {
            warn!(error = %e, "scale-in guard release failed");
        }
        if let Err(e) = heartbeat.stop(None).await {
            warn!(error = %e, "heartbeat did not stop in time");
        }
    }
    .instrument(span)
    .await;
}

/// `process_message_wrapped`: classifies the outcome of `process_message`
/// and decides whether to ack (delete) the message (spec.md §4.4).
async fn process_message_wrapped(
    queue: &Arc<dyn QueueConsumer>,
    store: &Arc<dyn StatusStore>,
    compute_fn: &Arc<dyn ComputeFn>,
    config: &ConsumerConfig,
    queued: &QueuedMessage,
) {
    match process_message(store, compute_fn, config, queued).await {
        Ok(()) => {
            if let Err(e) = queue.ack(&queued.receipt_handle).await {
                warn!(error = %e, "failed to ack successfully-processed message");
            }
        }
        Err(ProcessingError::Unretryable(reason)) => {
            if let Err(e) = store
                .put_error(
                    &queued.message_id,
                    reason.clone(),
                    None,
                    extract_request_id(&queued.message.body),
                    Some(queued.to_serialised_message()),
                )
                .await
            {
                error!(error = %e, "failed to write ERROR row for unretryable failure");
            }
            if let Err(e) = queue.ack(&queued.receipt_handle).await {
                warn!(error = %e, "failed to ack message after writing ERROR row");
            }
        }
        Err(ProcessingError::Retryable(reason)) => {
            warn!(reason = %reason, "leaving message on queue for redelivery");
        }
    }
}

async fn process_message(
    store: &Arc<dyn StatusStore>,
    compute_fn: &Arc<dyn ComputeFn>,
    config: &ConsumerConfig,
    queued: &QueuedMessage,
) -> std::result::Result<(), ProcessingError> {
    let request_id = extract_request_id(&queued.message.body);
    let serialised_message = queued.to_serialised_message();

    if let Err(e) = store
        .put_status(
            tb_common::ResultStatus::InProgress,
            &queued.message_id,
            Some(config.in_progress_ttl_seconds),
            request_id.clone(),
            None,
            Some(serialised_message.clone()),
        )
        .await
    {
        return Err(ProcessingError::Retryable(format!(
            "failed to write IN_PROGRESS row: {e}"
        )));
    }

    let compute_result = compute_fn
        .compute(queued.message.body.clone(), queued.message_id.clone())
        .await;

    let result = match compute_result {
        Ok(value) => value,
        Err(failure) => {
            return Err(classify_compute_failure(config, failure));
        }
    };

    store
        .put_result(&queued.message_id, result, request_id, Some(serialised_message))
        .await
        .map_err(|e| ProcessingError::Retryable(format!("failed to write SUCCESS row: {e}")))
}

fn classify_compute_failure(config: &ConsumerConfig, failure: ComputeFailure) -> ProcessingError {
    if config.non_retryable_error_kinds.iter().any(|k| k == &failure.kind) {
        ProcessingError::Unretryable(failure.to_string())
    } else {
        ProcessingError::Retryable(failure.to_string())
    }
}

fn extract_request_id(body: &serde_json::Value) -> Option<String> {
    body.get("request_id")
        .and_then(|v| v.as_str())
        .map(String::from)
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use serde_json::{json, Value};
    use std::sync::atomic::{AtomicU32 as StdAtomicU32, Ordering as StdOrdering};
    use std::sync::Mutex as StdSyncMutex;
    use tb_common::Message;
    use tb_guard::NoopScaleInGuard;
    use tb_queue::{QueueError, QueueMetrics};
    use tb_store::StoreError;

    struct InMemoryQueue {
        pending: StdSyncMutex<Vec<QueuedMessage>>,
        acked: StdSyncMutex<Vec<String>>,
        extend_calls: StdAtomicU32,
    }

    impl InMemoryQueue {
        fn with_one(message_id: &str, body: Value) -> Self {
            Self {
                pending: StdSyncMutex::new(vec![QueuedMessage {
                    message: Message {
                        body,
                        message_group_id: "g".into(),
                    },
                    message_id: message_id.into(),
                    receipt_handle: format!("receipt-{message_id}"),
                    queue_identifier: "test".into(),
                }]),
                acked: StdSyncMutex::new(Vec::new()),
                extend_calls: StdAtomicU32::new(0),
            }
        }
    }

    #[async_trait]
    impl QueueConsumer for InMemoryQueue {
        fn identifier(&self) -> &str {
            "test-queue"
        }

        async fn poll(&self, _max_messages: u32) -> tb_queue::Result<Vec<QueuedMessage>> {
            let mut pending = self.pending.lock().unwrap();
            Ok(pending.pop().into_iter().collect())
        }

        async fn ack(&self, receipt_handle: &str) -> tb_queue::Result<()> {
            self.acked.lock().unwrap().push(receipt_handle.to_string());
            Ok(())
        }

        async fn nack(&self, _receipt_handle: &str, _delay_seconds: Option<u32>) -> tb_queue::Result<()> {
            Ok(())
        }

        async fn extend_visibility(&self, _receipt_handle: &str, _seconds: u32) -> tb_queue::Result<()> {
            self.extend_calls.fetch_add(1, StdOrdering::Relaxed);
            Ok(())
        }

        async fn ping(&self) -> tb_queue::Result<()> {
            Ok(())
        }

        fn is_healthy(&self) -> bool {
            true
        }

        async fn stop(&self) {}

        async fn get_metrics(&self) -> tb_queue::Result<Option<QueueMetrics>> {
            Ok(None)
        }
    }

    struct InMemoryStore {
        items: StdSyncMutex<std::collections::HashMap<String, tb_common::StoreItem>>,
    }

    impl InMemoryStore {
        fn new() -> Self {
            Self {
                items: StdSyncMutex::new(std::collections::HashMap::new()),
            }
        }
    }

    #[async_trait]
    impl StatusStore for InMemoryStore {
        async fn put_item(&self, item: tb_common::StoreItem, _allow_overwrite: bool) -> tb_store::Result<()> {
            self.items.lock().unwrap().insert(item.message_id.clone(), item);
            Ok(())
        }

        async fn get_item(&self, message_id: &str, _raise_for_expiry: bool) -> tb_store::Result<tb_common::StoreItem> {
            self.items
                .lock()
                .unwrap()
                .get(message_id)
                .cloned()
                .ok_or_else(|| StoreError::KeyNotFound(message_id.to_string()))
        }
    }

    struct EchoCompute;

    #[async_trait]
    impl ComputeFn for EchoCompute {
        async fn compute(&self, body: Value, _message_id: String) -> std::result::Result<Value, ComputeFailure> {
            Ok(json!({"echo": body}))
        }
    }

    struct AlwaysFailsCompute {
        kind: &'static str,
    }

    #[async_trait]
    impl ComputeFn for AlwaysFailsCompute {
        async fn compute(&self, _body: Value, _message_id: String) -> std::result::Result<Value, ComputeFailure> {
            Err(ComputeFailure::new(self.kind, "simulated failure"))
        }
    }

    fn test_config() -> ConsumerConfig {
        ConsumerConfig {
            queue_wait_time_seconds: 1,
            in_progress_ttl_seconds: 60,
            heartbeat_visibility_timeout_seconds: 5,
            heartbeat_interval_seconds: 1.0,
            non_retryable_error_kinds: vec!["ValueError".to_string()],
            stop_timeout: Duration::from_secs(2),
        }
    }

    #[tokio::test]
    async fn process_message_writes_success_row_on_compute_success() {
        let store = Arc::new(InMemoryStore::new());
        let compute = Arc::new(EchoCompute);
        let config = test_config();
        let queued = QueuedMessage {
            message: Message {
                body: json!({"request_id": "r-1", "x": 1}),
                message_group_id: "g".into(),
            },
            message_id: "m-1".into(),
            receipt_handle: "receipt-1".into(),
            queue_identifier: "q".into(),
        };

        process_message(&(store.clone() as Arc<dyn StatusStore>), &(compute as Arc<dyn ComputeFn>), &config, &queued)
            .await
            .unwrap();

        let item = store.get_item("m-1", false).await.unwrap();
        assert_eq!(item.status, tb_common::ResultStatus::Success);
        assert_eq!(item.result.unwrap()["echo"]["x"], 1);
    }

    #[tokio::test]
    async fn compute_failure_with_configured_kind_is_unretryable() {
        let store = Arc::new(InMemoryStore::new());
        let compute = Arc::new(AlwaysFailsCompute { kind: "ValueError" });
        let config = test_config();
        let queued = QueuedMessage {
            message: Message {
                body: json!({}),
                message_group_id: "g".into(),
            },
            message_id: "m-2".into(),
            receipt_handle: "receipt-2".into(),
            queue_identifier: "q".into(),
        };

        let err = process_message(&(store as Arc<dyn StatusStore>), &(compute as Arc<dyn ComputeFn>), &config, &queued)
            .await
            .unwrap_err();
        assert!(matches!(err, ProcessingError::Unretryable(_)));
    }

    #[tokio::test]
    async fn compute_failure_with_unconfigured_kind_is_retryable() {
        let store = Arc::new(InMemoryStore::new());
        let compute = Arc::new(AlwaysFailsCompute { kind: "TransientError" });
        let config = test_config();
        let queued = QueuedMessage {
            message: Message {
                body: json!({}),
                message_group_id: "g".into(),
            },
            message_id: "m-3".into(),
            receipt_handle: "receipt-3".into(),
            queue_identifier: "q".into(),
        };

        let err = process_message(&(store as Arc<dyn StatusStore>), &(compute as Arc<dyn ComputeFn>), &config, &queued)
            .await
            .unwrap_err();
        assert!(matches!(err, ProcessingError::Retryable(_)));
    }

    #[tokio::test]
    async fn start_stop_lifecycle_and_already_consuming() {
        let queue: Arc<dyn QueueConsumer> = Arc::new(InMemoryQueue::with_one("m-4", json!({})));
        let store: Arc<dyn StatusStore> = Arc::new(InMemoryStore::new());
        let guard: Arc<dyn ScaleInGuard> = Arc::new(NoopScaleInGuard);
        let compute: Arc<dyn ComputeFn> = Arc::new(EchoCompute);

        let consumer = Consumer::new(queue, store, guard, compute, test_config());
        consumer.start_consuming().unwrap();
        assert!(matches!(consumer.start_consuming(), Err(ConsumerError::AlreadyConsuming)));
        assert!(consumer.is_running());

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!consumer.is_processing_message().unwrap());

        consumer.stop_consuming(None).await.unwrap();
        assert!(!consumer.is_running());
        consumer.stop_consuming(None).await.unwrap();
    }
}
