// Copyright 2024 The Ray Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//  http://www.apache.org/licenses/LICENSE-2.0

//! Task specifications and argument conventions.
//!
//! A handle passed directly as an argument ([`TaskArg::Direct`]) is resolved
//! to its value before the function runs. A handle nested inside a
//! container ([`TaskArg::Nested`]) reaches the function as a handle, and
//! the function decides whether to fetch it.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;

use ray_common::id::ObjectID;

use crate::context::OwnerAddress;
use crate::core_worker::CoreWorker;
use crate::error::{CoreWorkerError, CoreWorkerResult};
use crate::object_ref::ObjectRef;
use crate::serialization::{self, RayObject};

/// A structured argument whose handles are passed by reference.
#[derive(Debug, Clone)]
pub enum ArgContainer {
    Ref(ObjectRef),
    Value(RayObject),
    List(Vec<ArgContainer>),
    Map(BTreeMap<String, ArgContainer>),
}

impl ArgContainer {
    pub fn value<T: Serialize + ?Sized>(value: &T) -> CoreWorkerResult<Self> {
        Ok(Self::Value(serialization::serialize(value)?))
    }

    pub fn list_of_refs(refs: impl IntoIterator<Item = ObjectRef>) -> Self {
        Self::List(refs.into_iter().map(Self::Ref).collect())
    }

    /// Every handle in the container, depth first.
    pub fn refs(&self) -> Vec<&ObjectRef> {
        let mut out = Vec::new();
        self.collect_refs(&mut out);
        out
    }

    fn collect_refs<'a>(&'a self, out: &mut Vec<&'a ObjectRef>) {
        match self {
            Self::Ref(handle) => out.push(handle),
            Self::Value(_) => {}
            Self::List(items) => items.iter().for_each(|item| item.collect_refs(out)),
            Self::Map(entries) => entries.values().for_each(|item| item.collect_refs(out)),
        }
    }

    /// Rebuild the container with every handle transformed by `f`.
    pub fn try_map_refs<F>(&self, f: &mut F) -> CoreWorkerResult<Self>
    where
        F: FnMut(&ObjectRef) -> CoreWorkerResult<ObjectRef>,
    {
        Ok(match self {
            Self::Ref(handle) => Self::Ref(f(handle)?),
            Self::Value(object) => Self::Value(object.clone()),
            Self::List(items) => Self::List(
                items
                    .iter()
                    .map(|item| item.try_map_refs(f))
                    .collect::<CoreWorkerResult<_>>()?,
            ),
            Self::Map(entries) => Self::Map(
                entries
                    .iter()
                    .map(|(key, item)| Ok((key.clone(), item.try_map_refs(f)?)))
                    .collect::<CoreWorkerResult<_>>()?,
            ),
        })
    }

    pub fn as_ref(&self) -> Option<&ObjectRef> {
        match self {
            Self::Ref(handle) => Some(handle),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[ArgContainer]> {
        match self {
            Self::List(items) => Some(items),
            _ => None,
        }
    }

    pub fn get(&self, key: &str) -> Option<&ArgContainer> {
        match self {
            Self::Map(entries) => entries.get(key),
            _ => None,
        }
    }
}

/// One argument of a task, tagged with its passing convention.
#[derive(Debug, Clone)]
pub enum TaskArg {
    /// An inline value.
    Value(RayObject),
    /// A bare handle, resolved by value before the function runs.
    Direct(ObjectRef),
    /// A container whose handles are passed by reference.
    Nested(ArgContainer),
}

impl TaskArg {
    pub fn value<T: Serialize + ?Sized>(value: &T) -> CoreWorkerResult<Self> {
        Ok(Self::Value(serialization::serialize(value)?))
    }

    /// Objects this argument keeps alive while the task is in flight.
    pub fn object_ids(&self) -> Vec<ObjectID> {
        match self {
            Self::Value(_) => Vec::new(),
            Self::Direct(handle) => vec![handle.object_id()],
            Self::Nested(container) => container
                .refs()
                .into_iter()
                .map(ObjectRef::object_id)
                .collect(),
        }
    }
}

/// An argument as the executing function observes it.
#[derive(Debug, Clone)]
pub enum ResolvedArg {
    Value(RayObject),
    Nested(ArgContainer),
}

impl ResolvedArg {
    /// Decode a by-value argument.
    pub fn decode<T: DeserializeOwned>(&self) -> CoreWorkerResult<T> {
        match self {
            Self::Value(object) => serialization::deserialize(object),
            Self::Nested(_) => Err(CoreWorkerError::InvalidArgument(
                "argument was passed by reference".into(),
            )),
        }
    }

    pub fn as_object(&self) -> Option<&RayObject> {
        match self {
            Self::Value(object) => Some(object),
            Self::Nested(_) => None,
        }
    }

    pub fn as_nested(&self) -> Option<&ArgContainer> {
        match self {
            Self::Nested(container) => Some(container),
            Self::Value(_) => None,
        }
    }
}

/// A function that can run as a task on any worker.
///
/// The function receives the executing worker so that it can `get` handles
/// it was passed by reference, or `put` intermediate values.
#[async_trait::async_trait]
pub trait RemoteFunction: Send + Sync {
    fn name(&self) -> &str;

    async fn call(
        &self,
        worker: Arc<CoreWorker>,
        args: Vec<ResolvedArg>,
    ) -> CoreWorkerResult<RayObject>;
}

/// Adapter turning an async closure into a [`RemoteFunction`].
pub struct FnRemoteFunction<F> {
    name: String,
    func: F,
}

#[async_trait::async_trait]
impl<F, Fut> RemoteFunction for FnRemoteFunction<F>
where
    F: Fn(Arc<CoreWorker>, Vec<ResolvedArg>) -> Fut + Send + Sync,
    Fut: Future<Output = CoreWorkerResult<RayObject>> + Send + 'static,
{
    fn name(&self) -> &str {
        &self.name
    }

    async fn call(
        &self,
        worker: Arc<CoreWorker>,
        args: Vec<ResolvedArg>,
    ) -> CoreWorkerResult<RayObject> {
        (self.func)(worker, args).await
    }
}

pub fn remote_fn<F, Fut>(name: impl Into<String>, func: F) -> Arc<dyn RemoteFunction>
where
    F: Fn(Arc<CoreWorker>, Vec<ResolvedArg>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = CoreWorkerResult<RayObject>> + Send + 'static,
{
    Arc::new(FnRemoteFunction {
        name: name.into(),
        func,
    })
}

/// A submitted task.
pub struct TaskSpec {
    pub function: Arc<dyn RemoteFunction>,
    pub args: Vec<TaskArg>,
    pub return_id: ObjectID,
    pub owner: OwnerAddress,
}

impl TaskSpec {
    pub fn name(&self) -> &str {
        self.function.name()
    }

    /// Every object the arguments reference, direct or nested.
    pub fn dependencies(&self) -> Vec<ObjectID> {
        self.args.iter().flat_map(TaskArg::object_ids).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_value_arg_has_no_dependencies() {
        let arg = TaskArg::value(&42u32).unwrap();
        assert!(arg.object_ids().is_empty());
    }

    #[test]
    fn test_container_accessors() {
        let mut entries = BTreeMap::new();
        entries.insert("scale".to_string(), ArgContainer::value(&2.5f64).unwrap());
        entries.insert("items".to_string(), ArgContainer::List(Vec::new()));
        let container = ArgContainer::Map(entries);
        assert!(container.refs().is_empty());
        assert_eq!(container.get("items").and_then(ArgContainer::as_list).map(<[_]>::len), Some(0));
        assert!(container.get("missing").is_none());
        assert!(container.as_ref().is_none());
    }

    #[test]
    fn test_resolved_arg_decode() {
        let by_value = ResolvedArg::Value(serialization::serialize(&"hi").unwrap());
        assert_eq!(by_value.decode::<String>().unwrap(), "hi");
        let by_ref = ResolvedArg::Nested(ArgContainer::List(Vec::new()));
        assert!(matches!(
            by_ref.decode::<String>(),
            Err(CoreWorkerError::InvalidArgument(_))
        ));
        assert!(by_ref.as_nested().is_some());
    }
}
