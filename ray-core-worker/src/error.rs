// Copyright 2024 The Ray Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//  http://www.apache.org/licenses/LICENSE-2.0

//! Core worker error types.

use ray_common::id::{NodeID, ObjectID, WorkerID};
use ray_common::status::{RayError, StatusCode};
use ray_object_manager::common::PlasmaError;
use ray_object_manager::pull_manager::PullError;

/// Errors specific to the core worker.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CoreWorkerError {
    #[error("object {0} is unknown to this worker or has been freed")]
    UnknownObject(ObjectID),

    #[error("timed out: {0}")]
    GetTimeout(String),

    #[error("owner {owner} of object {object_id} is unreachable")]
    OwnerUnreachable { object_id: ObjectID, owner: WorkerID },

    #[error("object {0} was already freed")]
    DoubleFree(ObjectID),

    #[error("worker {worker} was lost: {message}")]
    WorkerLost { worker: String, message: String },

    #[error("task failed: {message}")]
    TaskFailed { message: String },

    #[error("object {object_id} was evicted with node {node_id}")]
    ObjectEvicted { object_id: ObjectID, node_id: NodeID },

    #[error("object store error: {0}")]
    ObjectStore(#[from] PlasmaError),

    #[error("pull failed: {0}")]
    Pull(PullError),

    #[error("ray status error: {0}")]
    RayStatus(#[from] RayError),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("actor pool is saturated with {0} queued jobs")]
    PoolSaturated(usize),

    #[error("no pending results")]
    NoPendingResults,

    #[error("no workers available")]
    NoAvailableWorkers,

    #[error("internal error: {0}")]
    Internal(String),
}

impl CoreWorkerError {
    pub fn task_failed(message: impl Into<String>) -> Self {
        Self::TaskFailed {
            message: message.into(),
        }
    }

    /// The wire status code this error is reported under when it crosses a
    /// process boundary.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::UnknownObject(_) => StatusCode::ObjectNotFound,
            Self::GetTimeout(_) => StatusCode::TimedOut,
            Self::OwnerUnreachable { .. } => StatusCode::ObjectUnknownOwner,
            Self::DoubleFree(_) | Self::InvalidArgument(_) => StatusCode::InvalidArgument,
            Self::WorkerLost { .. } => StatusCode::UnexpectedSystemExit,
            Self::TaskFailed { .. } | Self::Internal(_) => StatusCode::UnknownError,
            Self::ObjectEvicted { .. } => StatusCode::ObjectNotFound,
            Self::ObjectStore(err) => RayError::from(*err).code,
            Self::Pull(PullError::Store(err)) => RayError::from(*err).code,
            Self::Pull(_) => StatusCode::Disconnected,
            Self::RayStatus(err) => err.code,
            Self::Serialization(_) => StatusCode::TypeError,
            Self::PoolSaturated(_) => StatusCode::OutOfResource,
            Self::NoPendingResults => StatusCode::Invalid,
            Self::NoAvailableWorkers => StatusCode::Disconnected,
        }
    }

    /// Whether the caller may retry the same operation and expect it to
    /// succeed later.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::GetTimeout(_) | Self::PoolSaturated(_) | Self::Pull(PullError::Aborted(_))
        )
    }

    /// Map a failed pull of `object_id` from its owner's node into the
    /// caller-facing taxonomy.
    pub fn from_pull(err: PullError, owner: WorkerID) -> Self {
        match err {
            PullError::Unreachable { object_id, .. } => Self::OwnerUnreachable { object_id, owner },
            PullError::ObjectLost { object_id, node_id } => {
                Self::ObjectEvicted { object_id, node_id }
            }
            other => Self::Pull(other),
        }
    }
}

impl From<rmp_serde::encode::Error> for CoreWorkerError {
    fn from(err: rmp_serde::encode::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<rmp_serde::decode::Error> for CoreWorkerError {
    fn from(err: rmp_serde::decode::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

/// Result type alias for core worker operations.
pub type CoreWorkerResult<T> = Result<T, CoreWorkerError>;
