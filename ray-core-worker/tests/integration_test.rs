// Copyright 2024 The Ray Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//  http://www.apache.org/licenses/LICENSE-2.0

//! Integration tests for object placement, ownership and task dispatch on an
//! in-process cluster.

mod common;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use ray_core_worker::memory_store::StoredValue;
use ray_core_worker::serialization;
use ray_core_worker::{
    remote_fn, ArgContainer, CoreWorker, CoreWorkerError, ObjectLocation, ResolvedArg, TaskArg,
    WorkerType,
};
use ray_test_utils::wait::{wait_for_condition, wait_for_condition_async};

use common::{test_config, TestCluster, TEST_THRESHOLD};

// ─── Placement ───────────────────────────────────────────────────────

#[tokio::test]
async fn test_placement_follows_threshold() {
    let cluster = TestCluster::new(1, 0);
    let driver = &cluster.driver;

    let small = driver.put(&1_234_567_890u64).unwrap();
    assert_eq!(
        driver.resolve(&small.object_id()).unwrap(),
        Some(ObjectLocation::Local)
    );
    assert!(!driver
        .object_manager()
        .plasma_store()
        .contains(&small.object_id()));

    let payload = vec![7u8; 1_000_000];
    let large = driver.put_raw(payload.clone()).unwrap();
    assert_eq!(
        driver.resolve(&large.object_id()).unwrap(),
        Some(ObjectLocation::SharedLocal)
    );
    let record = driver.memory_store().get(&large.object_id()).unwrap();
    assert_eq!(
        record.value,
        Some(StoredValue::Placeholder {
            node_id: driver.node_id()
        })
    );
    assert!(driver
        .object_manager()
        .plasma_store()
        .contains(&large.object_id()));

    assert_eq!(driver.get::<u64>(&small, None).await.unwrap(), 1_234_567_890);
    assert_eq!(driver.get_raw(&large, None).await.unwrap(), payload);
}

#[tokio::test]
async fn test_threshold_is_inclusive_for_promotion() {
    let cluster = TestCluster::new(1, 0);
    let driver = &cluster.driver;
    // Raw objects carry a short metadata tag on top of their data.
    let tag_len = serialization::RayObject::from_raw(Vec::<u8>::new()).size();
    let below = driver
        .put_raw(vec![0u8; (TEST_THRESHOLD - tag_len - 1) as usize])
        .unwrap();
    let at = driver
        .put_raw(vec![0u8; (TEST_THRESHOLD - tag_len) as usize])
        .unwrap();
    assert_eq!(
        driver.resolve(&below.object_id()).unwrap(),
        Some(ObjectLocation::Local)
    );
    assert_eq!(
        driver.resolve(&at.object_id()).unwrap(),
        Some(ObjectLocation::SharedLocal)
    );
}

#[tokio::test]
async fn test_round_trip_and_fresh_ids() {
    let cluster = TestCluster::new(1, 0);
    let driver = &cluster.driver;
    let mut record = BTreeMap::new();
    record.insert("name".to_string(), vec![1.5f64, -2.0]);
    record.insert("empty".to_string(), Vec::new());

    let first = driver.put(&record).unwrap();
    let second = driver.put(&record).unwrap();
    assert_ne!(first.object_id(), second.object_id());
    assert_eq!(
        driver
            .get::<BTreeMap<String, Vec<f64>>>(&first, None)
            .await
            .unwrap(),
        record
    );

    let text = driver.put("hello").unwrap();
    assert_eq!(
        driver.get_with_timeout_secs::<String>(&text, 0.0).await.unwrap(),
        "hello"
    );
    let many = driver
        .get_many::<BTreeMap<String, Vec<f64>>>(&[first, second], Some(Duration::from_secs(5)))
        .await
        .unwrap();
    assert_eq!(many.len(), 2);
}

// ─── Ownership ───────────────────────────────────────────────────────

#[tokio::test]
async fn test_dropping_last_handle_frees_object() {
    let cluster = TestCluster::new(1, 0);
    let driver = &cluster.driver;
    let handle = driver.put_raw(vec![1u8; 500_000]).unwrap();
    let object_id = handle.object_id();
    let copy = handle.clone();
    drop(handle);
    assert!(driver.resolve(&object_id).is_ok());

    drop(copy);
    assert_eq!(
        driver.resolve(&object_id),
        Err(CoreWorkerError::UnknownObject(object_id))
    );
    assert!(!driver.object_manager().plasma_store().contains(&object_id));
}

#[tokio::test]
async fn test_release_twice_is_double_free() {
    let cluster = TestCluster::new(1, 0);
    let driver = &cluster.driver;
    let object_id = driver.put(&42u32).unwrap().into_object_id();
    driver.release(&object_id).unwrap();
    assert_eq!(
        driver.release(&object_id),
        Err(CoreWorkerError::DoubleFree(object_id))
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_clone_and_drop_frees_once() {
    let cluster = TestCluster::new(1, 0);
    let driver = cluster.driver.clone();
    let handle = driver.put_raw(vec![3u8; 200_000]).unwrap();
    let object_id = handle.object_id();

    let mut tasks = Vec::new();
    for _ in 0..8 {
        let handle = handle.clone();
        tasks.push(tokio::spawn(async move {
            for _ in 0..500 {
                let copy = handle.clone();
                drop(copy);
            }
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }
    assert_eq!(driver.reference_counter().local_ref_count(&object_id), 1);
    drop(handle);
    assert!(!driver.reference_counter().contains(&object_id));
    assert!(driver.reference_counter().was_freed(&object_id));
}

#[tokio::test]
async fn test_borrower_keeps_object_alive() {
    let cluster = TestCluster::new(1, 0);
    let driver = &cluster.driver;
    let client = cluster.client_on(0);

    let handle = driver.put(&vec![1u32, 2, 3]).unwrap();
    let object_id = handle.object_id();
    let borrowed = client.borrow(&handle).unwrap();
    drop(handle);
    assert!(driver.reference_counter().contains(&object_id));
    assert_eq!(
        client.get::<Vec<u32>>(&borrowed, None).await.unwrap(),
        vec![1, 2, 3]
    );

    drop(borrowed);
    assert!(!driver.reference_counter().contains(&object_id));
    assert!(!client.reference_counter().contains(&object_id));
}

#[tokio::test]
async fn test_dead_owner_is_unreachable() {
    let cluster = TestCluster::new(1, 0);
    let driver = &cluster.driver;
    let owner = cluster.client_on(0);

    let handle = owner.put(&"owned elsewhere").unwrap();
    let borrowed = driver.borrow(&handle).unwrap();
    let object_id = borrowed.object_id();
    assert!(cluster.runtime.kill_worker(&owner.worker_id()));

    assert!(matches!(
        driver.get::<String>(&borrowed, Some(Duration::from_secs(1))).await,
        Err(CoreWorkerError::OwnerUnreachable { .. })
    ));
    assert!(matches!(
        driver.resolve(&object_id),
        Err(CoreWorkerError::OwnerUnreachable { .. })
    ));
}

#[tokio::test]
async fn test_dead_borrower_is_released() {
    let cluster = TestCluster::new(1, 0);
    let driver = &cluster.driver;
    let borrower = cluster.client_on(0);

    let handle = driver.put(&5u8).unwrap();
    let object_id = handle.object_id();
    let _borrowed = borrower.borrow(&handle).unwrap();
    drop(handle);
    assert!(driver.reference_counter().contains(&object_id));

    cluster.runtime.kill_worker(&borrower.worker_id());
    assert!(!driver.reference_counter().contains(&object_id));
}

// ─── Shared store ────────────────────────────────────────────────────

#[tokio::test]
async fn test_same_node_reads_are_zero_copy() {
    let cluster = TestCluster::new(1, 0);
    let driver = &cluster.driver;
    let reader = cluster.client_on(0);

    let handle = driver.put_raw(vec![9u8; 1_000_000]).unwrap();
    let shared = driver
        .object_manager()
        .get_local(&handle.object_id())
        .unwrap();
    let borrowed = reader.borrow(&handle).unwrap();
    let first = reader.get_raw(&borrowed, None).await.unwrap();
    let second = reader.get_raw(&borrowed, None).await.unwrap();
    assert_eq!(first.as_ptr(), shared.data.as_ptr());
    assert_eq!(second.as_ptr(), shared.data.as_ptr());
    assert_eq!(first.len(), 1_000_000);
}

#[tokio::test]
async fn test_cross_node_get_pulls_and_registers_copy() {
    let cluster = TestCluster::new(2, 0);
    let driver = &cluster.driver;
    let remote = cluster.client_on(1);

    let payload = ray_test_utils::generators::random_payload(300_000);
    let handle = driver.put_raw(payload.clone()).unwrap();
    let object_id = handle.object_id();
    let borrowed = remote.borrow(&handle).unwrap();
    assert_eq!(remote.get_raw(&borrowed, None).await.unwrap(), payload);
    assert!(remote.object_manager().plasma_store().contains(&object_id));

    let mut locations = driver.reference_counter().object_locations(&object_id);
    locations.sort();
    let mut expected = cluster.nodes.clone();
    expected.sort();
    assert_eq!(locations, expected);

    // Freeing the object releases both copies.
    drop(borrowed);
    drop(handle);
    assert!(!driver.object_manager().plasma_store().contains(&object_id));
    assert!(!remote.object_manager().plasma_store().contains(&object_id));
}

// ─── Tasks ───────────────────────────────────────────────────────────

fn sum_fn() -> Arc<dyn ray_core_worker::RemoteFunction> {
    remote_fn(
        "sum",
        |worker: Arc<CoreWorker>, args: Vec<ResolvedArg>| async move {
            let mut total = 0u64;
            for arg in &args {
                match arg {
                    ResolvedArg::Value(_) => total += arg.decode::<u64>()?,
                    ResolvedArg::Nested(container) => {
                        // Handles nested in containers arrive unresolved.
                        for handle in container.refs() {
                            total += worker.get::<u64>(handle, None).await?;
                        }
                    }
                }
            }
            serialization::serialize(&total)
        },
    )
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_direct_args_resolved_nested_args_passed_by_reference() {
    let cluster = TestCluster::new(1, 2);
    let driver = &cluster.driver;

    let direct = driver.put(&10u64).unwrap();
    let nested = driver.put(&100u64).unwrap();
    let observed = remote_fn(
        "inspect",
        |_worker: Arc<CoreWorker>, args: Vec<ResolvedArg>| async move {
            let direct_is_value = args[0].as_object().is_some();
            let nested_is_handle = args[1]
                .as_nested()
                .and_then(|container| container.get("inner"))
                .and_then(ArgContainer::as_ref)
                .is_some();
            serialization::serialize(&(direct_is_value, nested_is_handle))
        },
    );
    let mut inner = BTreeMap::new();
    inner.insert("inner".to_string(), ArgContainer::Ref(nested.clone()));
    let result = driver
        .submit_task(
            observed,
            vec![TaskArg::Direct(direct.clone()), TaskArg::Nested(ArgContainer::Map(inner))],
        )
        .unwrap();
    assert_eq!(
        driver.get::<(bool, bool)>(&result, None).await.unwrap(),
        (true, true)
    );

    let total = driver
        .submit_task(
            sum_fn(),
            vec![
                TaskArg::value(&1u64).unwrap(),
                TaskArg::Direct(direct),
                TaskArg::Nested(ArgContainer::list_of_refs([nested])),
            ],
        )
        .unwrap();
    assert_eq!(driver.get::<u64>(&total, None).await.unwrap(), 111);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_task_chain_forwards_handles() {
    let cluster = TestCluster::new(1, 2);
    let driver = &cluster.driver;
    let first = driver
        .submit_task(sum_fn(), vec![TaskArg::value(&2u64).unwrap()])
        .unwrap();
    let second = driver
        .submit_task(
            sum_fn(),
            vec![TaskArg::Direct(first.clone()), TaskArg::value(&3u64).unwrap()],
        )
        .unwrap();
    assert_eq!(driver.get::<u64>(&second, None).await.unwrap(), 5);
    assert_eq!(driver.get::<u64>(&first, None).await.unwrap(), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_get_timeout_then_retry_succeeds() {
    let cluster = TestCluster::new(1, 1);
    let driver = &cluster.driver;
    let slow = remote_fn(
        "slow",
        |_worker: Arc<CoreWorker>, _args: Vec<ResolvedArg>| async move {
            tokio::time::sleep(Duration::from_millis(300)).await;
            serialization::serialize(&7u32)
        },
    );
    let handle = driver.submit_task(slow, Vec::new()).unwrap();
    assert!(matches!(
        driver.get::<u32>(&handle, Some(Duration::from_millis(20))).await,
        Err(CoreWorkerError::GetTimeout(_))
    ));
    assert_eq!(driver.resolve(&handle.object_id()).unwrap(), None);
    // Short bounded gets keep timing out until the task finishes.
    let pending = &handle;
    assert!(
        wait_for_condition_async(
            || async move {
                matches!(
                    driver.get::<u32>(pending, Some(Duration::from_millis(10))).await,
                    Ok(7)
                )
            },
            Duration::from_secs(5),
        )
        .await
    );
    assert_eq!(driver.get::<u32>(&handle, None).await.unwrap(), 7);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_failed_task_surfaces_message() {
    let cluster = TestCluster::new(1, 1);
    let driver = &cluster.driver;
    let failing = remote_fn(
        "failing",
        |_worker: Arc<CoreWorker>, _args: Vec<ResolvedArg>| async move {
            Err::<serialization::RayObject, _>(CoreWorkerError::task_failed("bad input"))
        },
    );
    let handle = driver.submit_task(failing, Vec::new()).unwrap();
    assert_eq!(
        driver.get::<u32>(&handle, None).await,
        Err(CoreWorkerError::TaskFailed {
            message: "bad input".into()
        })
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_task_without_workers_fails() {
    let cluster = TestCluster::new(1, 0);
    let driver = &cluster.driver;
    let handle = driver
        .submit_task(sum_fn(), vec![TaskArg::value(&1u64).unwrap()])
        .unwrap();
    assert!(matches!(
        driver.get::<u64>(&handle, Some(Duration::from_secs(5))).await,
        Err(CoreWorkerError::TaskFailed { .. })
    ));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_wait_splits_ready_and_pending() {
    let cluster = TestCluster::new(1, 3);
    let driver = &cluster.driver;
    let sleepy = |millis: u64| {
        remote_fn(
            "sleepy",
            move |_worker: Arc<CoreWorker>, _args: Vec<ResolvedArg>| async move {
                tokio::time::sleep(Duration::from_millis(millis)).await;
                serialization::serialize(&millis)
            },
        )
    };
    let handles = vec![
        driver.submit_task(sleepy(10), Vec::new()).unwrap(),
        driver.submit_task(sleepy(2_000), Vec::new()).unwrap(),
        driver.submit_task(sleepy(10), Vec::new()).unwrap(),
    ];
    let (ready, pending) = driver
        .wait(&handles, 2, Some(Duration::from_secs(1)))
        .await
        .unwrap();
    assert_eq!(ready, vec![handles[0].clone(), handles[2].clone()]);
    assert_eq!(pending, vec![handles[1].clone()]);

    assert!(matches!(
        driver.wait(&handles, 4, None).await,
        Err(CoreWorkerError::InvalidArgument(_))
    ));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_large_task_return_stays_on_executor_node() {
    let cluster = TestCluster::with_config(2, 0, test_config(TEST_THRESHOLD));
    let executor = cluster
        .runtime
        .spawn_worker(&cluster.nodes[1], WorkerType::Worker)
        .unwrap();
    let driver = cluster.driver.clone();
    let produce = remote_fn(
        "produce",
        |_worker: Arc<CoreWorker>, _args: Vec<ResolvedArg>| async move {
            Ok(serialization::RayObject::from_raw(vec![4u8; 250_000]))
        },
    );
    let handle = driver.submit_task(produce, Vec::new()).unwrap();
    let object_id = handle.object_id();
    assert!(
        wait_for_condition(
            || driver.resolve(&object_id).is_ok_and(|location| location.is_some()),
            Duration::from_secs(5),
        )
        .await
    );
    assert_eq!(
        driver.resolve(&object_id).unwrap(),
        Some(ObjectLocation::SharedRemote(executor.node_id()))
    );
    assert!(executor.object_manager().plasma_store().contains(&object_id));

    // Losing the only copy evicts the object for its owner.
    assert!(cluster.runtime.remove_node(&cluster.nodes[1]));
    assert!(matches!(
        driver.get_raw(&handle, None).await,
        Err(CoreWorkerError::ObjectEvicted { .. })
    ));
    assert!(matches!(
        driver.resolve(&object_id),
        Err(CoreWorkerError::ObjectEvicted { .. })
    ));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_pulled_copy_survives_node_removal() {
    let cluster = TestCluster::new(2, 0);
    let executor = cluster
        .runtime
        .spawn_worker(&cluster.nodes[1], WorkerType::Worker)
        .unwrap();
    let driver = cluster.driver.clone();
    let produce = remote_fn(
        "produce",
        |_worker: Arc<CoreWorker>, _args: Vec<ResolvedArg>| async move {
            Ok(serialization::RayObject::from_raw(vec![5u8; 250_000]))
        },
    );
    let handle = driver.submit_task(produce, Vec::new()).unwrap();
    let object_id = handle.object_id();
    assert!(
        wait_for_condition(
            || driver.resolve(&object_id).is_ok_and(|location| location.is_some()),
            Duration::from_secs(5),
        )
        .await
    );
    assert_eq!(
        driver.resolve(&object_id).unwrap(),
        Some(ObjectLocation::SharedRemote(executor.node_id()))
    );
    // The first get pulls a copy to the driver's node.
    assert_eq!(driver.get_raw(&handle, None).await.unwrap().len(), 250_000);
    // The owner's record already points at its own copy.
    assert_eq!(
        driver.resolve(&handle.object_id()).unwrap(),
        Some(ObjectLocation::SharedLocal)
    );
    assert!(cluster.runtime.remove_node(&executor.node_id()));
    assert_eq!(
        driver.resolve(&handle.object_id()).unwrap(),
        Some(ObjectLocation::SharedLocal)
    );
    assert_eq!(driver.get_raw(&handle, None).await.unwrap().len(), 250_000);
}

// ─── Global driver ───────────────────────────────────────────────────

#[tokio::test]
async fn test_global_driver_initializes_once() {
    let driver = ray_core_worker::init_global_driver(test_config(TEST_THRESHOLD), 2).unwrap();
    assert_eq!(driver.worker_type(), WorkerType::Driver);
    assert_eq!(
        ray_core_worker::global_driver().map(|d| d.worker_id()),
        Some(driver.worker_id())
    );
    assert_eq!(ray_core_worker::global_cluster().unwrap().num_workers(), 3);
    assert!(matches!(
        ray_core_worker::init_global_driver(test_config(TEST_THRESHOLD), 1),
        Err(CoreWorkerError::InvalidArgument(_))
    ));
}
