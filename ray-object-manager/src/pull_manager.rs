// Copyright 2024 The Ray Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//  http://www.apache.org/licenses/LICENSE-2.0

//! Pull manager: copies sealed objects from remote nodes into the local
//! plasma store.
//!
//! - Objects move in `object_chunk_size` chunks.
//! - Concurrent requests for the same object share one in-flight pull.
//! - Transient failures are retried with exponential backoff up to
//!   `fetch_max_attempts`; then the pull fails with `Unreachable`.
//! - A pull runs on its own task. Callers that stop waiting (for example
//!   on a `get` timeout) do not cancel it, and the copy it produces is
//!   cached for later readers.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use ray_common::id::{NodeID, ObjectID};
use ray_util::backoff::RetryPolicy;
use tokio::sync::watch;

use crate::common::{ObjectManagerConfig, ObjectSource, PlasmaError};
use crate::plasma::store::{PlasmaObjectView, PlasmaStore};
use crate::transport::{ObjectTransport, TransferError};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PullError {
    #[error("object {object_id} unreachable on node {node_id} after {attempts} attempts: {last_error}")]
    Unreachable {
        object_id: ObjectID,
        node_id: NodeID,
        attempts: u32,
        last_error: TransferError,
    },
    #[error("object {object_id} no longer exists on node {node_id}")]
    ObjectLost { object_id: ObjectID, node_id: NodeID },
    #[error("local store rejected object: {0}")]
    Store(#[from] PlasmaError),
    #[error("pull of object {0} was aborted")]
    Aborted(ObjectID),
}

type PullOutcome = Option<Result<PlasmaObjectView, PullError>>;

/// Counters exposed for tests and debugging.
#[derive(Debug, Default)]
pub struct PullStats {
    pub pulls_started: AtomicU64,
    pub pulls_succeeded: AtomicU64,
    pub pulls_failed: AtomicU64,
    pub retries: AtomicU64,
    pub chunks_received: AtomicU64,
    pub bytes_received: AtomicU64,
}

pub struct PullManager {
    self_node_id: NodeID,
    config: ObjectManagerConfig,
    store: Arc<PlasmaStore>,
    transport: Arc<dyn ObjectTransport>,
    in_flight: Arc<Mutex<HashMap<ObjectID, watch::Receiver<PullOutcome>>>>,
    stats: Arc<PullStats>,
}

impl PullManager {
    pub fn new(
        self_node_id: NodeID,
        config: ObjectManagerConfig,
        store: Arc<PlasmaStore>,
        transport: Arc<dyn ObjectTransport>,
    ) -> Self {
        Self {
            self_node_id,
            config,
            store,
            transport,
            in_flight: Arc::new(Mutex::new(HashMap::new())),
            stats: Arc::new(PullStats::default()),
        }
    }

    /// Return a local copy of `object_id`, pulling it from `from` if needed.
    pub async fn pull(
        &self,
        object_id: ObjectID,
        from: NodeID,
    ) -> Result<PlasmaObjectView, PullError> {
        if let Some(view) = self.store.get(&object_id) {
            return Ok(view);
        }
        let mut rx = self.start_or_join(object_id, from);
        loop {
            if let Some(outcome) = rx.borrow_and_update().clone() {
                return outcome;
            }
            rx.changed()
                .await
                .map_err(|_| PullError::Aborted(object_id))?;
        }
    }

    pub fn is_pulling(&self, object_id: &ObjectID) -> bool {
        self.in_flight.lock().contains_key(object_id)
    }

    pub fn num_active_pulls(&self) -> usize {
        self.in_flight.lock().len()
    }

    pub fn stats(&self) -> &PullStats {
        &self.stats
    }

    fn start_or_join(&self, object_id: ObjectID, from: NodeID) -> watch::Receiver<PullOutcome> {
        let mut in_flight = self.in_flight.lock();
        if let Some(rx) = in_flight.get(&object_id) {
            return rx.clone();
        }
        let (tx, rx) = watch::channel(None);
        in_flight.insert(object_id, rx.clone());
        self.stats.pulls_started.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(object_id = %object_id, from = %from, to = %self.self_node_id, "Starting pull");

        let job = PullJob {
            object_id,
            from,
            config: self.config.clone(),
            store: self.store.clone(),
            transport: self.transport.clone(),
            stats: self.stats.clone(),
        };
        let in_flight_map = self.in_flight.clone();
        tokio::spawn(async move {
            let outcome = job.run().await;
            match &outcome {
                Ok(_) => job.stats.pulls_succeeded.fetch_add(1, Ordering::Relaxed),
                Err(err) => {
                    tracing::warn!(object_id = %object_id, error = %err, "Pull failed");
                    job.stats.pulls_failed.fetch_add(1, Ordering::Relaxed)
                }
            };
            // Publish before unregistering so joiners never miss the result.
            let _ = tx.send(Some(outcome));
            in_flight_map.lock().remove(&object_id);
        });
        rx
    }
}

struct PullJob {
    object_id: ObjectID,
    from: NodeID,
    config: ObjectManagerConfig,
    store: Arc<PlasmaStore>,
    transport: Arc<dyn ObjectTransport>,
    stats: Arc<PullStats>,
}

impl PullJob {
    async fn run(&self) -> Result<PlasmaObjectView, PullError> {
        let mut retry = RetryPolicy::new(
            self.config.fetch_max_attempts,
            self.config.fetch_retry_initial_delay,
            self.config.fetch_retry_max_delay,
        );
        loop {
            let err = match self.attempt().await {
                Ok(view) => return Ok(view),
                Err(AttemptError::Local(err)) => return Err(err),
                Err(AttemptError::Transfer(err)) if !err.is_retryable() => {
                    return Err(PullError::ObjectLost {
                        object_id: self.object_id,
                        node_id: self.from,
                    })
                }
                Err(AttemptError::Transfer(err)) => err,
            };
            match retry.on_failure() {
                Some(delay) => {
                    self.stats.retries.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(
                        object_id = %self.object_id,
                        node_id = %self.from,
                        attempt = retry.attempts(),
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "Retrying pull"
                    );
                    tokio::time::sleep(delay).await;
                }
                None => {
                    return Err(PullError::Unreachable {
                        object_id: self.object_id,
                        node_id: self.from,
                        attempts: retry.attempts(),
                        last_error: err,
                    })
                }
            }
        }
    }

    async fn attempt(&self) -> Result<PlasmaObjectView, AttemptError> {
        let info = self
            .transport
            .get_object_info(&self.from, &self.object_id)
            .await?;
        let mut writer = match self
            .store
            .create_object(info.clone(), ObjectSource::ReceivedFromRemoteNode)
        {
            Ok(writer) => writer,
            Err(PlasmaError::ObjectExists) => {
                // Promoted locally while the pull was starting.
                return self
                    .store
                    .get(&self.object_id)
                    .ok_or(AttemptError::Local(PullError::Store(PlasmaError::ObjectNotSealed)));
            }
            Err(err) => return Err(AttemptError::Local(err.into())),
        };

        let total = info.get_object_size();
        let chunk_size = self.config.object_chunk_size.max(1);
        let mut offset = 0;
        while offset < total {
            let len = chunk_size.min(total - offset);
            let chunk = match self
                .transport
                .read_chunk(&self.from, &self.object_id, offset, len)
                .await
            {
                Ok(chunk) if chunk.len() as u64 == len => chunk,
                Ok(chunk) => {
                    self.abort(writer);
                    return Err(AttemptError::Transfer(TransferError::Transient(format!(
                        "short chunk at offset {offset}: expected {len} bytes, got {}",
                        chunk.len()
                    ))));
                }
                Err(err) => {
                    self.abort(writer);
                    return Err(err.into());
                }
            };
            if let Err(err) = writer.write_at(offset, &chunk) {
                self.abort(writer);
                return Err(AttemptError::Local(err.into()));
            }
            self.stats.chunks_received.fetch_add(1, Ordering::Relaxed);
            self.stats.bytes_received.fetch_add(len, Ordering::Relaxed);
            offset += len;
        }
        self.store
            .seal_object(writer)
            .map_err(|err| AttemptError::Local(err.into()))
    }

    fn abort(&self, writer: crate::plasma::store::ObjectWriter) {
        if let Err(err) = self.store.abort_object(writer) {
            tracing::error!(object_id = %self.object_id, error = %err, "Failed to abort partial pull");
        }
    }
}

enum AttemptError {
    Transfer(TransferError),
    Local(PullError),
}

impl From<TransferError> for AttemptError {
    fn from(err: TransferError) -> Self {
        Self::Transfer(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::ObjectInfo;
    use crate::plasma::allocator::PlasmaAllocator;
    use bytes::Bytes;
    use ray_common::id::WorkerID;
    use std::time::Duration;

    /// Serves one fixed object, failing the first `failures` info requests.
    struct ScriptedTransport {
        info: ObjectInfo,
        payload: Bytes,
        failures: Mutex<u32>,
        chunk_reads: AtomicU64,
    }

    #[async_trait::async_trait]
    impl ObjectTransport for ScriptedTransport {
        async fn get_object_info(
            &self,
            node_id: &NodeID,
            _object_id: &ObjectID,
        ) -> Result<ObjectInfo, TransferError> {
            let mut failures = self.failures.lock();
            if *failures > 0 {
                *failures -= 1;
                return Err(TransferError::NodeUnreachable(*node_id));
            }
            Ok(self.info.clone())
        }

        async fn read_chunk(
            &self,
            _node_id: &NodeID,
            _object_id: &ObjectID,
            offset: u64,
            len: u64,
        ) -> Result<Bytes, TransferError> {
            self.chunk_reads.fetch_add(1, Ordering::Relaxed);
            tokio::time::sleep(Duration::from_millis(5)).await;
            Ok(self.payload.slice(offset as usize..(offset + len) as usize))
        }
    }

    fn setup(failures: u32, max_attempts: u32) -> (PullManager, Arc<ScriptedTransport>, ObjectID) {
        let object_id = ObjectID::from_index(&WorkerID::from_random(), 1);
        let payload = Bytes::from((0..1000u32).map(|i| i as u8).collect::<Vec<_>>());
        let transport = Arc::new(ScriptedTransport {
            info: ObjectInfo::new(object_id, 990, 10),
            payload,
            failures: Mutex::new(failures),
            chunk_reads: AtomicU64::new(0),
        });
        let config = ObjectManagerConfig {
            object_store_memory: 1 << 20,
            object_chunk_size: 256,
            fetch_max_attempts: max_attempts,
            fetch_retry_initial_delay: Duration::from_millis(1),
            fetch_retry_max_delay: Duration::from_millis(5),
        };
        let store = Arc::new(PlasmaStore::new(Arc::new(PlasmaAllocator::new(1 << 20))));
        let manager = PullManager::new(NodeID::from_random(), config, store, transport.clone());
        (manager, transport, object_id)
    }

    #[tokio::test]
    async fn test_pull_in_chunks() {
        let (manager, transport, object_id) = setup(0, 3);
        let view = manager.pull(object_id, NodeID::from_random()).await.unwrap();
        assert_eq!(view.data.len(), 990);
        assert_eq!(view.metadata.len(), 10);
        assert_eq!(view.data[300], 300u32 as u8);
        // 1000 bytes in 256-byte chunks.
        assert_eq!(transport.chunk_reads.load(Ordering::Relaxed), 4);
        assert_eq!(manager.stats().bytes_received.load(Ordering::Relaxed), 1000);
    }

    #[tokio::test]
    async fn test_concurrent_pulls_share_transfer() {
        let (manager, transport, object_id) = setup(0, 3);
        let from = NodeID::from_random();
        let (a, b, c) = tokio::join!(
            manager.pull(object_id, from),
            manager.pull(object_id, from),
            manager.pull(object_id, from)
        );
        let (a, b, c) = (a.unwrap(), b.unwrap(), c.unwrap());
        assert_eq!(a.data.as_ptr(), b.data.as_ptr());
        assert_eq!(b.data.as_ptr(), c.data.as_ptr());
        assert_eq!(manager.stats().pulls_started.load(Ordering::Relaxed), 1);
        assert_eq!(transport.chunk_reads.load(Ordering::Relaxed), 4);
        assert_eq!(manager.num_active_pulls(), 0);
    }

    #[tokio::test]
    async fn test_transient_failures_retried() {
        let (manager, _transport, object_id) = setup(2, 3);
        manager.pull(object_id, NodeID::from_random()).await.unwrap();
        assert_eq!(manager.stats().retries.load(Ordering::Relaxed), 2);
    }

    #[tokio::test]
    async fn test_bounded_attempts() {
        let (manager, _transport, object_id) = setup(10, 3);
        let from = NodeID::from_random();
        let err = manager.pull(object_id, from).await.unwrap_err();
        match err {
            PullError::Unreachable {
                attempts, node_id, ..
            } => {
                assert_eq!(attempts, 3);
                assert_eq!(node_id, from);
            }
            other => panic!("unexpected error {other:?}"),
        }
        assert_eq!(manager.stats().pulls_failed.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn test_abandoned_pull_completes_and_caches() {
        let (manager, _transport, object_id) = setup(0, 3);
        let from = NodeID::from_random();
        let waited =
            tokio::time::timeout(Duration::from_millis(1), manager.pull(object_id, from)).await;
        assert!(waited.is_err());
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while manager.is_pulling(&object_id) && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(manager.store.get(&object_id).is_some());
        manager.pull(object_id, from).await.unwrap();
        assert_eq!(manager.stats().pulls_started.load(Ordering::Relaxed), 1);
    }
}
