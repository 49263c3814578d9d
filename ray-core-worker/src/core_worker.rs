// Copyright 2024 The Ray Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//  http://www.apache.org/licenses/LICENSE-2.0

//! The main CoreWorker struct that ties all components together.

use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::task::JoinSet;

use ray_common::config::RayConfig;
use ray_common::id::{NodeID, ObjectID, WorkerID};
use ray_object_manager::common::ObjectInfo;
use ray_object_manager::object_manager::ObjectManager;
use ray_object_manager::plasma::store::PlasmaObjectView;
use ray_util::time::{deadline_after, timeout_from_secs_f64};

use crate::client::{OwnedObjectStatus, OwnerClient, RayletClient};
use crate::context::{OwnerAddress, WorkerContext};
use crate::dependency_resolver::DependencyResolver;
use crate::error::{CoreWorkerError, CoreWorkerResult};
use crate::memory_store::{
    CoreWorkerMemoryStore, ObjectLocation, ObjectRecord, ObjectState, StoredValue,
};
use crate::normal_task_submitter::{NormalTaskSubmitter, TaskReturn};
use crate::object_ref::ObjectRef;
use crate::options::{CoreWorkerOptions, WorkerType};
use crate::reference_counter::{FreedObject, ReferenceCounter};
use crate::serialization::{self, RayObject};
use crate::task_spec::{RemoteFunction, TaskArg, TaskSpec};

fn view_to_object(view: PlasmaObjectView) -> RayObject {
    RayObject::new(view.data, view.metadata)
}

/// The core worker: owns objects, resolves handles and submits tasks.
pub struct CoreWorker {
    context: WorkerContext,
    config: Arc<RayConfig>,
    reference_counter: Arc<ReferenceCounter>,
    memory_store: Arc<CoreWorkerMemoryStore>,
    object_manager: Arc<ObjectManager>,
    owner_client: Arc<dyn OwnerClient>,
    raylet_client: Arc<dyn RayletClient>,
    task_submitter: NormalTaskSubmitter,
}

impl CoreWorker {
    /// Create a worker on the node served by `object_manager`.
    pub fn new(
        options: CoreWorkerOptions,
        object_manager: Arc<ObjectManager>,
        owner_client: Arc<dyn OwnerClient>,
        raylet_client: Arc<dyn RayletClient>,
    ) -> Arc<Self> {
        let context = WorkerContext::new(options.worker_type, options.worker_id, options.node_id);
        let address = context.address();
        let reference_counter = Arc::new(ReferenceCounter::new(
            address,
            options.config.freed_object_tombstone_capacity,
        ));
        let memory_store = Arc::new(CoreWorkerMemoryStore::new(options.node_id));
        reference_counter.set_on_freed(Self::make_freed_callback(
            address,
            memory_store.clone(),
            owner_client.clone(),
            raylet_client.clone(),
        ));
        let task_submitter = NormalTaskSubmitter::new(
            reference_counter.clone(),
            memory_store.clone(),
            raylet_client.clone(),
            options.config.max_pending_tasks,
        );
        tracing::info!(
            worker_id = %options.worker_id,
            node_id = %options.node_id,
            worker_type = options.worker_type.as_str(),
            "Core worker started"
        );
        Arc::new(Self {
            context,
            config: options.config,
            reference_counter,
            memory_store,
            object_manager,
            owner_client,
            raylet_client,
            task_submitter,
        })
    }

    /// Releases the storage of a freed object: its record and shared
    /// copies when owned, or its cached value and borrower registration
    /// when borrowed.
    fn make_freed_callback(
        address: OwnerAddress,
        memory_store: Arc<CoreWorkerMemoryStore>,
        owner_client: Arc<dyn OwnerClient>,
        raylet_client: Arc<dyn RayletClient>,
    ) -> Box<dyn Fn(FreedObject) + Send + Sync> {
        Box::new(move |freed: FreedObject| {
            memory_store.free(&freed.object_id);
            if freed.owned {
                for node_id in &freed.locations {
                    raylet_client.free_objects(node_id, &[freed.object_id]);
                }
            } else if let Err(err) =
                owner_client.remove_borrower(&freed.owner, &freed.object_id, address.worker_id)
            {
                tracing::debug!(
                    object_id = %freed.object_id,
                    owner = %freed.owner.worker_id,
                    error = %err,
                    "Could not unregister borrower"
                );
            }
        })
    }

    // ─── Accessors ───────────────────────────────────────────────────

    pub fn worker_id(&self) -> WorkerID {
        self.context.worker_id()
    }

    pub fn node_id(&self) -> NodeID {
        self.context.node_id()
    }

    pub fn address(&self) -> OwnerAddress {
        self.context.address()
    }

    pub fn worker_type(&self) -> WorkerType {
        self.context.worker_type()
    }

    pub fn is_alive(&self) -> bool {
        self.context.is_alive()
    }

    pub fn config(&self) -> &Arc<RayConfig> {
        &self.config
    }

    pub fn reference_counter(&self) -> &Arc<ReferenceCounter> {
        &self.reference_counter
    }

    pub fn memory_store(&self) -> &Arc<CoreWorkerMemoryStore> {
        &self.memory_store
    }

    pub fn object_manager(&self) -> &Arc<ObjectManager> {
        &self.object_manager
    }

    pub fn num_pending_tasks(&self) -> usize {
        self.task_submitter.num_pending_tasks()
    }

    // ─── Object API ──────────────────────────────────────────────────

    /// Serialize a value and store it, returning an owned handle.
    pub fn put<T: Serialize + ?Sized>(&self, value: &T) -> CoreWorkerResult<ObjectRef> {
        self.put_object(serialization::serialize(value)?)
    }

    /// Store an opaque byte payload without encoding it.
    pub fn put_raw(&self, data: impl Into<Bytes>) -> CoreWorkerResult<ObjectRef> {
        self.put_object(RayObject::from_raw(data))
    }

    /// Store a serialized object. Every call creates a new object, even for
    /// equal values.
    pub fn put_object(&self, object: RayObject) -> CoreWorkerResult<ObjectRef> {
        let object_id = self.context.next_object_id();
        self.reference_counter.add_owned_object(object_id)?;
        let handle = ObjectRef::from_counted(object_id, self.address(), &self.reference_counter);
        self.store_owned_value(object_id, object)?;
        Ok(handle)
    }

    /// Place a value of an owned object by size: below the threshold it
    /// stays in this process, otherwise it moves to the node's shared store
    /// and a placeholder is recorded here.
    fn store_owned_value(&self, object_id: ObjectID, object: RayObject) -> CoreWorkerResult<()> {
        let size = object.size();
        if size < self.config.max_direct_call_object_size {
            tracing::debug!(object_id = %object_id, size, "Placed object in local store");
            return self.memory_store.put_inline(object_id, object);
        }
        self.promote(object_id, &object, self.address())?;
        self.reference_counter
            .add_object_location(&object_id, self.node_id());
        tracing::debug!(object_id = %object_id, size, node_id = %self.node_id(), "Promoted object to shared store");
        self.memory_store
            .put_placeholder(object_id, self.node_id(), size)
    }

    fn promote(
        &self,
        object_id: ObjectID,
        object: &RayObject,
        owner: OwnerAddress,
    ) -> CoreWorkerResult<()> {
        let info = ObjectInfo::new(
            object_id,
            object.data.len() as u64,
            object.metadata.len() as u64,
        )
        .with_owner(owner.node_id, owner.worker_id);
        self.object_manager
            .put_object(info, &object.data, &object.metadata)?;
        Ok(())
    }

    /// Fetch and decode a value. `None` blocks until the value exists.
    pub async fn get<T: DeserializeOwned>(
        &self,
        handle: &ObjectRef,
        timeout: Option<Duration>,
    ) -> CoreWorkerResult<T> {
        let object = self.get_object(handle, timeout).await?;
        serialization::deserialize(&object)
    }

    /// [`CoreWorker::get`] with a timeout in floating seconds, where zero
    /// or a negative value blocks indefinitely.
    pub async fn get_with_timeout_secs<T: DeserializeOwned>(
        &self,
        handle: &ObjectRef,
        timeout_secs: f64,
    ) -> CoreWorkerResult<T> {
        self.get(handle, timeout_from_secs_f64(timeout_secs)).await
    }

    /// Fetch the payload bytes of a value. Promoted values on this node are
    /// returned as views over the shared store, without copying.
    pub async fn get_raw(
        &self,
        handle: &ObjectRef,
        timeout: Option<Duration>,
    ) -> CoreWorkerResult<Bytes> {
        Ok(self.get_object(handle, timeout).await?.data)
    }

    /// Fetch several values under one shared timeout.
    pub async fn get_many<T: DeserializeOwned>(
        &self,
        handles: &[ObjectRef],
        timeout: Option<Duration>,
    ) -> CoreWorkerResult<Vec<T>> {
        let deadline = deadline_after(timeout);
        let mut values = Vec::with_capacity(handles.len());
        for handle in handles {
            let remaining = deadline.map(|d| d.saturating_duration_since(Instant::now()));
            if remaining.is_some_and(|r| r.is_zero()) {
                return Err(CoreWorkerError::GetTimeout(format!(
                    "waiting for object {}",
                    handle.object_id()
                )));
            }
            values.push(self.get(handle, remaining).await?);
        }
        Ok(values)
    }

    /// Fetch the serialized object behind a handle.
    ///
    /// Timing out only abandons this wait: a pull already started keeps
    /// running and a later call may find the value.
    pub async fn get_object(
        &self,
        handle: &ObjectRef,
        timeout: Option<Duration>,
    ) -> CoreWorkerResult<RayObject> {
        let deadline = deadline_after(timeout);
        let fetch = self.fetch_object(handle, deadline);
        let object = match deadline {
            Some(deadline) => {
                tokio::time::timeout_at(tokio::time::Instant::from_std(deadline), fetch)
                    .await
                    .map_err(|_| {
                        CoreWorkerError::GetTimeout(format!(
                            "waiting for object {}",
                            handle.object_id()
                        ))
                    })??
            }
            None => fetch.await?,
        };
        match object.to_error() {
            Some(err) => Err(err),
            None => Ok(object),
        }
    }

    async fn fetch_object(
        &self,
        handle: &ObjectRef,
        deadline: Option<Instant>,
    ) -> CoreWorkerResult<RayObject> {
        let object_id = handle.object_id();
        let owner = handle.owner();
        if owner.worker_id == self.worker_id() {
            if !self.reference_counter.contains(&object_id) {
                return Err(CoreWorkerError::UnknownObject(object_id));
            }
            let record = self.memory_store.get_or_wait(&object_id, deadline).await?;
            return self.materialize(record, owner).await;
        }

        if let Some(record) = self.memory_store.get(&object_id) {
            if record.state != ObjectState::Pending {
                return self.materialize(record, owner).await;
            }
        }
        if let Some(view) = self.object_manager.get_local(&object_id) {
            return Ok(view_to_object(view));
        }
        match self
            .owner_client
            .get_object_status(&owner, &object_id, deadline)
            .await?
        {
            OwnedObjectStatus::Inline(object) => {
                if self.reference_counter.contains(&object_id) {
                    // A concurrent get may have cached it first.
                    let _ = self.memory_store.put_inline(object_id, object.clone());
                }
                Ok(object)
            }
            OwnedObjectStatus::Failed(error) => Ok(error),
            OwnedObjectStatus::Promoted { node_id, .. } => {
                self.read_promoted(object_id, node_id, owner).await
            }
        }
    }

    async fn materialize(
        &self,
        record: ObjectRecord,
        owner: OwnerAddress,
    ) -> CoreWorkerResult<RayObject> {
        let object_id = record.object_id;
        match (record.state, record.value) {
            (ObjectState::Evicted, Some(StoredValue::Placeholder { node_id })) => {
                Err(CoreWorkerError::ObjectEvicted { object_id, node_id })
            }
            (_, Some(StoredValue::Inline(object))) | (_, Some(StoredValue::Error(object))) => {
                Ok(object)
            }
            (_, Some(StoredValue::Placeholder { node_id })) => {
                self.read_promoted(object_id, node_id, owner).await
            }
            (state, None) => Err(CoreWorkerError::Internal(format!(
                "object {object_id} has no value in state {state:?}"
            ))),
        }
    }

    /// Read a promoted value, pulling it to this node first when it lives
    /// elsewhere. The new copy is reported to the owner.
    async fn read_promoted(
        &self,
        object_id: ObjectID,
        node_id: NodeID,
        owner: OwnerAddress,
    ) -> CoreWorkerResult<RayObject> {
        if let Some(view) = self.object_manager.get_local(&object_id) {
            return Ok(view_to_object(view));
        }
        if node_id == self.node_id() {
            return Err(CoreWorkerError::ObjectEvicted { object_id, node_id });
        }
        let view = self
            .object_manager
            .get_or_pull(object_id, node_id)
            .await
            .map_err(|err| CoreWorkerError::from_pull(err, owner.worker_id))?;

        let recorded = if owner.worker_id == self.worker_id() {
            let recorded = self
                .reference_counter
                .add_object_location(&object_id, self.node_id());
            if recorded {
                self.memory_store.relocate(&object_id, self.node_id());
            }
            recorded
        } else {
            self.owner_client
                .add_object_location(&owner, &object_id, self.node_id())
                .is_ok()
        };
        if !recorded {
            // The object was freed while it was being pulled.
            self.object_manager.free_objects(&[object_id]);
        }
        Ok(view_to_object(view))
    }

    /// Split `handles` into those whose values are available and those that
    /// are not, once `num_returns` are available or `timeout` passes. Both
    /// lists keep the input order. Failed objects count as available.
    pub async fn wait(
        self: &Arc<Self>,
        handles: &[ObjectRef],
        num_returns: usize,
        timeout: Option<Duration>,
    ) -> CoreWorkerResult<(Vec<ObjectRef>, Vec<ObjectRef>)> {
        if num_returns > handles.len() {
            return Err(CoreWorkerError::InvalidArgument(format!(
                "num_returns {num_returns} exceeds {} handles",
                handles.len()
            )));
        }
        let mut ready = vec![false; handles.len()];
        let mut num_ready = 0;
        let mut waiters = JoinSet::new();
        for (index, handle) in handles.iter().enumerate() {
            let worker = self.clone();
            let handle = handle.clone();
            waiters.spawn(async move {
                let _ = worker.fetch_object(&handle, None).await;
                index
            });
        }

        let deadline = deadline_after(timeout).map(tokio::time::Instant::from_std);
        while num_ready < num_returns {
            let next = match deadline {
                Some(deadline) => match tokio::time::timeout_at(deadline, waiters.join_next()).await {
                    Ok(next) => next,
                    Err(_) => break,
                },
                None => waiters.join_next().await,
            };
            match next {
                Some(Ok(index)) => {
                    ready[index] = true;
                    num_ready += 1;
                }
                Some(Err(err)) => {
                    return Err(CoreWorkerError::Internal(format!("wait task failed: {err}")))
                }
                None => break,
            }
        }
        waiters.abort_all();

        let (ready_handles, pending_handles): (Vec<_>, Vec<_>) = handles
            .iter()
            .zip(ready)
            .partition(|(_, is_ready)| *is_ready);
        Ok((
            ready_handles.into_iter().map(|(h, _)| h.clone()).collect(),
            pending_handles.into_iter().map(|(h, _)| h.clone()).collect(),
        ))
    }

    /// Where the value of a tracked object lives. `None` while the value is
    /// still being produced.
    pub fn resolve(&self, object_id: &ObjectID) -> CoreWorkerResult<Option<ObjectLocation>> {
        let info = self.reference_counter.resolve(object_id)?;
        if !info.owned && !self.owner_client.is_owner_alive(&info.owner) {
            return Err(CoreWorkerError::OwnerUnreachable {
                object_id: *object_id,
                owner: info.owner.worker_id,
            });
        }
        if let Some(record) = self.memory_store.get(object_id) {
            return match (record.state, record.value) {
                (ObjectState::Pending, _) => Ok(None),
                (ObjectState::Evicted, Some(StoredValue::Placeholder { node_id })) => {
                    Err(CoreWorkerError::ObjectEvicted {
                        object_id: *object_id,
                        node_id,
                    })
                }
                _ => Ok(Some(record.location)),
            };
        }
        if self.object_manager.plasma_store().contains(object_id) {
            return Ok(Some(ObjectLocation::SharedLocal));
        }
        if info.owned {
            return Err(CoreWorkerError::UnknownObject(*object_id));
        }
        Ok(self
            .owner_client
            .peek_object_status(&info.owner, object_id)?
            .map(|status| match status {
                OwnedObjectStatus::Promoted { node_id, .. } if node_id == self.node_id() => {
                    ObjectLocation::SharedLocal
                }
                OwnedObjectStatus::Promoted { node_id, .. } => ObjectLocation::SharedRemote(node_id),
                OwnedObjectStatus::Inline(_) | OwnedObjectStatus::Failed(_) => {
                    ObjectLocation::Local
                }
            }))
    }

    /// Return a reference given up with [`ObjectRef::into_object_id`].
    pub fn release(&self, object_id: &ObjectID) -> CoreWorkerResult<()> {
        self.reference_counter.release(object_id)
    }

    /// Take a handle received from another worker, binding it to this
    /// worker. The first borrowed handle to an object registers this worker
    /// with the owner.
    pub fn borrow(&self, handle: &ObjectRef) -> CoreWorkerResult<ObjectRef> {
        if handle.is_bound_to(&self.reference_counter) {
            return Ok(handle.clone());
        }
        let object_id = handle.object_id();
        let owner = handle.owner();
        if owner.worker_id == self.worker_id() {
            self.reference_counter.acquire(&object_id)?;
            return Ok(ObjectRef::from_counted(object_id, owner, &self.reference_counter));
        }
        let first = self.reference_counter.add_borrowed_object(object_id, owner);
        let local = ObjectRef::from_counted(object_id, owner, &self.reference_counter);
        if first {
            self.owner_client
                .add_borrower(&owner, &object_id, self.worker_id())?;
            tracing::debug!(object_id = %object_id, owner = %owner.worker_id, "Borrowing object");
        }
        Ok(local)
    }

    // ─── Task API ────────────────────────────────────────────────────

    /// Submit a task. The returned handle is owned by this worker and
    /// becomes ready when the task finishes.
    pub fn submit_task(
        &self,
        function: Arc<dyn RemoteFunction>,
        args: Vec<TaskArg>,
    ) -> CoreWorkerResult<ObjectRef> {
        let return_id = self.context.next_object_id();
        self.reference_counter.add_owned_object(return_id)?;
        let handle = ObjectRef::from_counted(return_id, self.address(), &self.reference_counter);
        self.memory_store.add_pending(return_id)?;
        self.task_submitter.submit_task(TaskSpec {
            function,
            args,
            return_id,
            owner: self.address(),
        })?;
        Ok(handle)
    }

    /// Run a task leased to this worker.
    pub async fn execute_task(self: Arc<Self>, spec: &TaskSpec) -> CoreWorkerResult<TaskReturn> {
        if !self.is_alive() {
            return Err(CoreWorkerError::WorkerLost {
                worker: self.worker_id().to_string(),
                message: "worker is shutting down".into(),
            });
        }
        let args = DependencyResolver::resolve_args(&self, &spec.args).await?;
        let output = spec.function.call(self.clone(), args).await?;
        let size = output.size();
        if size < self.config.max_direct_call_object_size {
            return Ok(TaskReturn::Inline(output));
        }
        self.promote(spec.return_id, &output, spec.owner)?;
        Ok(TaskReturn::Promoted {
            node_id: self.node_id(),
            size,
        })
    }

    // ─── Owner-side handlers ─────────────────────────────────────────

    fn owned_status(&self, record: ObjectRecord) -> CoreWorkerResult<Option<OwnedObjectStatus>> {
        let object_id = record.object_id;
        match (record.state, record.value) {
            (ObjectState::Pending, _) => Ok(None),
            (ObjectState::Evicted, Some(StoredValue::Placeholder { node_id })) => {
                Err(CoreWorkerError::ObjectEvicted { object_id, node_id })
            }
            (_, Some(StoredValue::Inline(object))) => Ok(Some(OwnedObjectStatus::Inline(object))),
            (_, Some(StoredValue::Error(object))) => Ok(Some(OwnedObjectStatus::Failed(object))),
            (_, Some(StoredValue::Placeholder { node_id })) => {
                Ok(Some(OwnedObjectStatus::Promoted {
                    node_id,
                    size: record.size,
                }))
            }
            (_, None) => Err(CoreWorkerError::UnknownObject(object_id)),
        }
    }

    fn check_owned(&self, object_id: &ObjectID) -> CoreWorkerResult<()> {
        if self.reference_counter.is_owned(object_id) {
            Ok(())
        } else {
            Err(CoreWorkerError::UnknownObject(*object_id))
        }
    }

    pub async fn handle_get_object_status(
        &self,
        object_id: &ObjectID,
        deadline: Option<Instant>,
    ) -> CoreWorkerResult<OwnedObjectStatus> {
        self.check_owned(object_id)?;
        let record = self.memory_store.get_or_wait(object_id, deadline).await?;
        self.owned_status(record)?
            .ok_or(CoreWorkerError::UnknownObject(*object_id))
    }

    pub fn handle_peek_object_status(
        &self,
        object_id: &ObjectID,
    ) -> CoreWorkerResult<Option<OwnedObjectStatus>> {
        self.check_owned(object_id)?;
        let record = self
            .memory_store
            .get(object_id)
            .ok_or(CoreWorkerError::UnknownObject(*object_id))?;
        self.owned_status(record)
    }

    pub fn handle_add_borrower(&self, object_id: &ObjectID, borrower: WorkerID) -> CoreWorkerResult<()> {
        self.reference_counter.add_borrower(object_id, borrower)
    }

    pub fn handle_remove_borrower(
        &self,
        object_id: &ObjectID,
        borrower: WorkerID,
    ) -> CoreWorkerResult<()> {
        self.reference_counter.remove_borrower(object_id, borrower)
    }

    pub fn handle_add_object_location(
        &self,
        object_id: &ObjectID,
        node_id: NodeID,
    ) -> CoreWorkerResult<()> {
        self.check_owned(object_id)?;
        self.reference_counter.add_object_location(object_id, node_id);
        if self
            .memory_store
            .get(object_id)
            .is_some_and(|record| record.state == ObjectState::Evicted)
        {
            self.memory_store.relocate(object_id, node_id);
        }
        Ok(())
    }

    /// Forget the shared copies on a removed node. Owned objects with
    /// another copy move to it; those without become evicted.
    pub fn handle_node_removed(&self, node_id: &NodeID) {
        let affected = self.reference_counter.owned_objects_at(node_id);
        let mut evicted = Vec::new();
        for object_id in affected {
            self.reference_counter.remove_object_location(&object_id, node_id);
            match self.reference_counter.object_locations(&object_id).first() {
                Some(survivor) => {
                    self.memory_store.relocate(&object_id, *survivor);
                }
                None => evicted.push(object_id),
            }
        }
        if !evicted.is_empty() {
            tracing::warn!(
                worker_id = %self.worker_id(),
                node_id = %node_id,
                num_evicted = evicted.len(),
                "Objects lost with removed node"
            );
            self.memory_store.mark_evicted(&evicted, node_id);
        }
    }

    /// Drop every borrower registration held by a dead worker.
    pub fn handle_worker_died(&self, worker_id: &WorkerID) {
        let released = self.reference_counter.remove_dead_borrower(worker_id);
        if released > 0 {
            tracing::info!(
                worker_id = %self.worker_id(),
                dead_worker = %worker_id,
                released,
                "Released borrows of dead worker"
            );
        }
    }

    /// Stop the worker: fail new tasks and release the shared copies of
    /// every object it owns. Records are dropped so that waiters wake up.
    pub fn shutdown(&self) {
        if !self.context.mark_dead() {
            return;
        }
        let owned = self.reference_counter.owned_objects();
        for object_id in &owned {
            for node_id in self.reference_counter.object_locations(object_id) {
                self.raylet_client.free_objects(&node_id, &[*object_id]);
            }
            self.memory_store.free(object_id);
        }
        tracing::info!(
            worker_id = %self.worker_id(),
            num_owned = owned.len(),
            "Core worker shut down"
        );
    }
}
