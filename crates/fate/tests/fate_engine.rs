// Copyright (c) 2023 - 2025 Tessera Contributors.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

use std::collections::HashSet;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use tessera_coordination::lock::ServiceLock;
use tessera_coordination::memory::ensure_persistent_path;
use tessera_coordination::MemoryCoordination;
use tessera_fate::{
    Fate, FateAdmin, FateOptions, FateStore, MetaFateStore, Ready, Repo, ReservationStatus,
    TxStatus, UserFateStore,
};
use tessera_fate::admin::{AdminFilters, AdminOpOutcome};
use tessera_metadata::MetadataStore;
use tessera_types::{FateId, FateReservation, LockId};

#[derive(Debug, Clone, Serialize, Deserialize)]
enum TestRepo {
    /// Runs `remaining + 1` steps, then completes.
    Countdown { remaining: u32 },
    /// Runs `depth` successful steps, then one that errors.
    ThenFail { depth: u32 },
    /// Waits until the env marks `key` ready, then completes.
    DeferUntil { key: String },
}

#[derive(Default)]
struct TestEnv {
    calls: Mutex<Vec<String>>,
    undone: Mutex<Vec<String>>,
    ready: Mutex<HashSet<String>>,
}

#[async_trait::async_trait]
impl Repo for TestRepo {
    type Env = TestEnv;

    fn name(&self) -> &'static str {
        match self {
            TestRepo::Countdown { .. } => "Countdown",
            TestRepo::ThenFail { .. } => "ThenFail",
            TestRepo::DeferUntil { .. } => "DeferUntil",
        }
    }

    async fn is_ready(&self, _fate_id: FateId, env: &TestEnv) -> anyhow::Result<Ready> {
        match self {
            TestRepo::DeferUntil { key } if !env.ready.lock().contains(key) => {
                Ok(Ready::After(Duration::from_millis(20)))
            }
            _ => Ok(Ready::Now),
        }
    }

    async fn call(&self, _fate_id: FateId, env: &TestEnv) -> anyhow::Result<Option<Self>> {
        match self {
            TestRepo::Countdown { remaining } => {
                env.calls.lock().push(format!("countdown:{remaining}"));
                if *remaining > 0 {
                    Ok(Some(TestRepo::Countdown {
                        remaining: remaining - 1,
                    }))
                } else {
                    Ok(None)
                }
            }
            TestRepo::ThenFail { depth } => {
                if *depth == 0 {
                    anyhow::bail!("step failure requested by test");
                }
                env.calls.lock().push(format!("thenfail:{depth}"));
                Ok(Some(TestRepo::ThenFail { depth: depth - 1 }))
            }
            TestRepo::DeferUntil { key } => {
                env.calls.lock().push(format!("deferred-ran:{key}"));
                Ok(None)
            }
        }
    }

    async fn undo(&self, _fate_id: FateId, env: &TestEnv) -> anyhow::Result<()> {
        let tag = match self {
            TestRepo::Countdown { remaining } => format!("countdown:{remaining}"),
            TestRepo::ThenFail { depth } => format!("thenfail:{depth}"),
            TestRepo::DeferUntil { key } => format!("defer:{key}"),
        };
        env.undone.lock().push(tag);
        Ok(())
    }
}

struct Harness {
    _coordination: MemoryCoordination,
    fate: Fate<TestRepo>,
    env: Arc<TestEnv>,
    lock_id: LockId,
    _lock: tessera_coordination::ServiceLockHandle,
}

async fn harness_with(store: Arc<dyn FateStore<TestRepo>>) -> Harness {
    let coordination = MemoryCoordination::new();
    let client = coordination.client();
    ensure_persistent_path(client.as_ref(), "/locks/manager")
        .await
        .unwrap();
    let lock = ServiceLock::new(client.clone())
        .acquire("/locks/manager", Bytes::new())
        .await
        .unwrap();
    let lock_id = lock.lock_id().clone();
    let env = Arc::new(TestEnv::default());
    let fate = Fate::start(
        store,
        Arc::clone(&env),
        lock_id.clone(),
        client,
        FateOptions {
            workers: NonZeroUsize::new(2).unwrap(),
            poll_interval: Duration::from_millis(20),
            dead_reservation_interval: Duration::from_secs(3600),
        },
    );
    Harness {
        _coordination: coordination,
        fate,
        env,
        lock_id,
        _lock: lock,
    }
}

async fn user_harness() -> (Harness, MetadataStore) {
    let metadata = MetadataStore::new();
    let store = Arc::new(UserFateStore::<TestRepo>::new(metadata.clone()));
    (harness_with(store).await, metadata)
}

async fn meta_harness() -> Harness {
    let coordination = MemoryCoordination::new();
    // build the store against the same coordination service the harness uses
    let client = coordination.client();
    ensure_persistent_path(client.as_ref(), "/locks/manager")
        .await
        .unwrap();
    let lock = ServiceLock::new(client.clone())
        .acquire("/locks/manager", Bytes::new())
        .await
        .unwrap();
    let lock_id = lock.lock_id().clone();
    let store = Arc::new(MetaFateStore::<TestRepo>::new(client.clone()).await.unwrap());
    let env = Arc::new(TestEnv::default());
    let fate = Fate::start(
        store,
        Arc::clone(&env),
        lock_id.clone(),
        client,
        FateOptions {
            workers: NonZeroUsize::new(2).unwrap(),
            poll_interval: Duration::from_millis(20),
            dead_reservation_interval: Duration::from_secs(3600),
        },
    );
    Harness {
        _coordination: coordination,
        fate,
        env,
        lock_id,
        _lock: lock,
    }
}

async fn wait_for_status(
    store: &Arc<dyn FateStore<TestRepo>>,
    fate_id: FateId,
    wanted: TxStatus,
) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let status = store.status(fate_id).await.unwrap();
        if status == wanted {
            return;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for {wanted}, stuck at {status}"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[test_log::test(tokio::test)]
async fn user_store_runs_chain_to_success() {
    let (harness, _metadata) = user_harness().await;
    let fate_id = harness.fate.create().await.unwrap();
    assert!(harness
        .fate
        .seed_transaction("test-op", fate_id, TestRepo::Countdown { remaining: 2 }, false)
        .await
        .unwrap());

    wait_for_status(harness.fate.store(), fate_id, TxStatus::Successful).await;
    assert_eq!(
        *harness.env.calls.lock(),
        vec!["countdown:2", "countdown:1", "countdown:0"]
    );
    // completed transactions stay readable until deleted
    let seen = harness.fate.store().read(fate_id).await.unwrap().unwrap();
    assert_eq!(seen.name.as_deref(), Some("test-op"));
    harness.fate.shutdown().await;
}

#[test_log::test(tokio::test)]
async fn meta_store_runs_chain_to_success() {
    let harness = meta_harness().await;
    let fate_id = harness.fate.create().await.unwrap();
    assert!(harness
        .fate
        .seed_transaction("test-op", fate_id, TestRepo::Countdown { remaining: 1 }, false)
        .await
        .unwrap());
    wait_for_status(harness.fate.store(), fate_id, TxStatus::Successful).await;
    assert_eq!(*harness.env.calls.lock(), vec!["countdown:1", "countdown:0"]);
    harness.fate.shutdown().await;
}

#[test_log::test(tokio::test)]
async fn failure_unwinds_the_step_stack() {
    let (harness, _metadata) = user_harness().await;
    let fate_id = harness.fate.create().await.unwrap();
    harness
        .fate
        .seed_transaction("failing-op", fate_id, TestRepo::ThenFail { depth: 2 }, false)
        .await
        .unwrap();

    wait_for_status(harness.fate.store(), fate_id, TxStatus::Failed).await;
    assert_eq!(*harness.env.calls.lock(), vec!["thenfail:2", "thenfail:1"]);
    // undo runs top-down: the failing step first, then its ancestors
    assert_eq!(
        *harness.env.undone.lock(),
        vec!["thenfail:0", "thenfail:1", "thenfail:2"]
    );
    harness.fate.shutdown().await;
}

#[test_log::test(tokio::test)]
async fn seeding_twice_is_rejected() {
    let (harness, _metadata) = user_harness().await;
    let fate_id = harness.fate.create().await.unwrap();
    assert!(harness
        .fate
        .seed_transaction("op", fate_id, TestRepo::Countdown { remaining: 0 }, false)
        .await
        .unwrap());
    assert!(!harness
        .fate
        .seed_transaction("op", fate_id, TestRepo::Countdown { remaining: 5 }, false)
        .await
        .unwrap());
    harness.fate.shutdown().await;
}

#[test_log::test(tokio::test)]
async fn cancel_new_goes_directly_to_failed() {
    let (harness, _metadata) = user_harness().await;
    let fate_id = harness.fate.create().await.unwrap();

    let admin = FateAdmin::new(vec![Arc::clone(harness.fate.store())], harness.lock_id.clone());
    assert!(admin.cancel(fate_id).await.unwrap());
    assert_eq!(
        harness.fate.store().status(fate_id).await.unwrap(),
        TxStatus::Failed
    );
    // a cancelled transaction cannot be seeded anymore
    assert!(!harness
        .fate
        .seed_transaction("op", fate_id, TestRepo::Countdown { remaining: 0 }, false)
        .await
        .unwrap());
    harness.fate.shutdown().await;
}

#[test_log::test(tokio::test)]
async fn deferred_step_requeues_until_ready() {
    let (harness, _metadata) = user_harness().await;
    let fate_id = harness.fate.create().await.unwrap();
    harness
        .fate
        .seed_transaction(
            "deferred-op",
            fate_id,
            TestRepo::DeferUntil { key: "gate".to_string() },
            false,
        )
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(harness.env.calls.lock().is_empty());
    assert_eq!(
        harness.fate.store().status(fate_id).await.unwrap(),
        TxStatus::InProgress
    );

    harness.env.ready.lock().insert("gate".to_string());
    wait_for_status(harness.fate.store(), fate_id, TxStatus::Successful).await;
    assert_eq!(*harness.env.calls.lock(), vec!["deferred-ran:gate"]);
    harness.fate.shutdown().await;
}

#[test_log::test(tokio::test)]
async fn dead_reservation_is_reclaimed() {
    let (harness, _metadata) = user_harness().await;
    let fate_id = harness.fate.create().await.unwrap();

    // a claim whose lock does not exist anymore: its holder is dead
    let dead_lock = LockId::new("/locks/manager", Uuid::new_v4(), 9_999);
    let dead_reservation = FateReservation::new(dead_lock);
    assert_eq!(
        harness
            .fate
            .store()
            .try_reserve(fate_id, &dead_reservation)
            .await
            .unwrap(),
        ReservationStatus::Accepted
    );

    harness
        .fate
        .seed_transaction("op", fate_id, TestRepo::Countdown { remaining: 0 }, false)
        .await
        .unwrap();

    // stays stuck while the dead reservation is in place
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(
        harness.fate.store().status(fate_id).await.unwrap(),
        TxStatus::Submitted
    );

    harness.fate.reclaim_dead_reservations_now().await;
    wait_for_status(harness.fate.store(), fate_id, TxStatus::Successful).await;
    harness.fate.shutdown().await;
}

#[test_log::test(tokio::test)]
async fn live_reservation_is_not_reclaimed() {
    let (harness, _metadata) = user_harness().await;
    let fate_id = harness.fate.create().await.unwrap();

    // a claim backed by the lock this harness actually holds
    let live_reservation = FateReservation::new(harness.lock_id.clone());
    harness
        .fate
        .store()
        .try_reserve(fate_id, &live_reservation)
        .await
        .unwrap();

    harness.fate.reclaim_dead_reservations_now().await;
    let reservations = harness.fate.store().reservations().await.unwrap();
    assert_eq!(reservations.len(), 1);
    assert_eq!(reservations[0].1, live_reservation);
    harness.fate.shutdown().await;
}

#[test_log::test(tokio::test)]
async fn auto_clean_up_deletes_terminal_txn() {
    let (harness, _metadata) = user_harness().await;
    let fate_id = harness.fate.create().await.unwrap();
    harness
        .fate
        .seed_transaction("op", fate_id, TestRepo::Countdown { remaining: 0 }, true)
        .await
        .unwrap();

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        if harness.fate.store().read(fate_id).await.unwrap().is_none() {
            break;
        }
        assert!(tokio::time::Instant::now() < deadline, "txn was not cleaned up");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    harness.fate.shutdown().await;
}

#[test_log::test(tokio::test)]
async fn summary_reports_vanished_txn_as_unknown() {
    let harness = meta_harness().await;
    let fate_id = harness.fate.create().await.unwrap();

    // the row disappears between enumeration and the probe
    harness.fate.store().delete(fate_id).await.unwrap();

    let admin = FateAdmin::new(vec![Arc::clone(harness.fate.store())], harness.lock_id.clone());
    let report = admin
        .summary(&AdminFilters {
            fate_ids: vec![fate_id],
            ..AdminFilters::default()
        })
        .await
        .unwrap();

    assert_eq!(report.txns.len(), 1);
    assert_eq!(report.txns[0].status, TxStatus::Unknown);
    assert_eq!(report.txns[0].time_created, 0);
    assert!(report.status_counts.is_empty());
    harness.fate.shutdown().await;
}

#[test_log::test(tokio::test)]
async fn fail_of_busy_txn_reports_busy() {
    let (harness, _metadata) = user_harness().await;
    // stop the engine so nothing competes for the reservation
    let fate_id = harness.fate.create().await.unwrap();

    let other_lock = LockId::new("/locks/manager", Uuid::new_v4(), 7);
    let busy_reservation = FateReservation::new(other_lock);
    harness
        .fate
        .store()
        .try_reserve(fate_id, &busy_reservation)
        .await
        .unwrap();

    let admin = FateAdmin::new(vec![Arc::clone(harness.fate.store())], harness.lock_id.clone());
    let outcome = admin.fail(fate_id, Duration::from_millis(300)).await.unwrap();
    assert_eq!(outcome, AdminOpOutcome::Busy);
    harness.fate.shutdown().await;
}

#[test_log::test(tokio::test)]
async fn delete_requires_terminal_status() {
    let (harness, _metadata) = user_harness().await;
    let fate_id = harness.fate.create().await.unwrap();
    harness
        .fate
        .seed_transaction(
            "deferred-op",
            fate_id,
            TestRepo::DeferUntil { key: "never".to_string() },
            false,
        )
        .await
        .unwrap();
    wait_for_status(harness.fate.store(), fate_id, TxStatus::InProgress).await;

    let admin = FateAdmin::new(vec![Arc::clone(harness.fate.store())], harness.lock_id.clone());
    let outcome = admin.delete(fate_id, Duration::from_secs(2)).await.unwrap();
    assert!(matches!(outcome, AdminOpOutcome::WrongStatus(_)));

    // still present
    assert!(harness.fate.store().read(fate_id).await.unwrap().is_some());
    harness.fate.shutdown().await;
}
