// Copyright (c) 2023 - 2025 Tessera Contributors.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use tessera_coordination::wal_marker::WalStateManager;
use tessera_coordination::MemoryCoordination;
use tessera_types::config::WalOptions;
use tessera_types::retries::RetryPolicy;
use tessera_types::{
    Durability, KeyExtent, Mutation, TServerInstance, TableId, WalRef, WalState,
};
use tessera_wal::{Dfs, LocalDfs, LogParticipant, TabletServerLogger};

struct FakeSession {
    extent: KeyExtent,
    tablet_log_id: u64,
    defined_in: Mutex<Option<u32>>,
    published: Mutex<Vec<WalRef>>,
}

impl FakeSession {
    fn new(table: &str, tablet_log_id: u64) -> Self {
        FakeSession {
            extent: KeyExtent::whole_table(TableId::new(table.to_string())),
            tablet_log_id,
            defined_in: Mutex::new(None),
            published: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait::async_trait]
impl LogParticipant for FakeSession {
    fn extent(&self) -> &KeyExtent {
        &self.extent
    }

    fn tablet_log_id(&self) -> u64 {
        self.tablet_log_id
    }

    fn begin_defining(&self, log_seq: u32) -> bool {
        *self.defined_in.lock() != Some(log_seq)
    }

    fn finish_defining(&self, log_seq: u32, defined: bool) {
        if defined {
            *self.defined_in.lock() = Some(log_seq);
        }
    }

    async fn publish_log_association(&self, wal: &WalRef) -> anyhow::Result<()> {
        self.published.lock().push(wal.clone());
        Ok(())
    }
}

struct Setup {
    _dir: tempfile::TempDir,
    dfs: Arc<LocalDfs>,
    server: TServerInstance,
    markers: Arc<WalStateManager>,
    logger: Arc<TabletServerLogger>,
}

fn options(max_size: u64) -> WalOptions {
    WalOptions {
        max_size,
        max_age: Duration::from_secs(3600).into(),
        create_retry: RetryPolicy::fixed_delay(Duration::from_millis(10), Some(3)),
        write_retry: RetryPolicy::fixed_delay(Duration::from_millis(10), Some(3)),
    }
}

async fn setup(max_size: u64) -> Setup {
    let dir = tempfile::tempdir().unwrap();
    let dfs = Arc::new(LocalDfs::new(dir.path()));
    let coordination = MemoryCoordination::new();
    let markers = Arc::new(WalStateManager::new(coordination.client()));
    let server = TServerInstance::new("host1:9997", 42);
    let logger = TabletServerLogger::new(
        dfs.clone(),
        server.clone(),
        options(max_size),
        Arc::clone(&markers),
        None,
        None,
    );
    Setup {
        _dir: dir,
        dfs,
        server,
        markers,
        logger,
    }
}

fn mutation(row: &str) -> Mutation {
    Mutation::new(row.as_bytes().to_vec()).put(
        &b"f"[..],
        &b"q"[..],
        row.as_bytes().to_vec(),
    )
}

#[test_log::test(tokio::test)]
async fn writes_go_to_an_open_marked_log() {
    let setup = setup(1024 * 1024).await;
    let session = FakeSession::new("1a", 1);

    setup
        .logger
        .log(&session, 1, vec![mutation("a")], Durability::Sync)
        .await
        .unwrap();

    let wal = setup.logger.current_wal().await.expect("log open");
    assert_eq!(
        setup.markers.state(&setup.server, &wal.uuid).await.unwrap(),
        Some(WalState::Open)
    );
    assert_eq!(session.published.lock().as_slice(), &[wal]);
    setup.logger.shutdown().await;
}

#[test_log::test(tokio::test)]
async fn tablet_definition_is_written_once_per_log() {
    let setup = setup(1024 * 1024).await;
    let session = FakeSession::new("1a", 1);

    for seq in 1..=3 {
        setup
            .logger
            .log(&session, seq, vec![mutation("a")], Durability::Sync)
            .await
            .unwrap();
    }

    // one published association despite three writes
    assert_eq!(session.published.lock().len(), 1);
    setup.logger.shutdown().await;
}

#[test_log::test(tokio::test)]
async fn size_rotation_closes_prior_log() {
    // tiny cap: the first write already exceeds it
    let setup = setup(16).await;
    let session = FakeSession::new("1a", 1);

    setup
        .logger
        .log(&session, 1, vec![mutation("a")], Durability::Sync)
        .await
        .unwrap();
    let first_wal = session.published.lock()[0].clone();

    setup
        .logger
        .log(&session, 2, vec![mutation("b")], Durability::Sync)
        .await
        .unwrap();
    let second_wal = session.published.lock().last().unwrap().clone();

    assert_ne!(first_wal.uuid, second_wal.uuid);
    assert_eq!(
        setup
            .markers
            .state(&setup.server, &first_wal.uuid)
            .await
            .unwrap(),
        Some(WalState::Closed)
    );
    assert_eq!(
        setup
            .markers
            .state(&setup.server, &second_wal.uuid)
            .await
            .unwrap(),
        Some(WalState::Open)
    );
    setup.logger.shutdown().await;
}

#[test_log::test(tokio::test)]
async fn recovery_replays_unflushed_mutations() {
    let setup = setup(1024 * 1024).await;
    let session = FakeSession::new("1a", 7);

    setup
        .logger
        .log(&session, 1, vec![mutation("a")], Durability::Sync)
        .await
        .unwrap();
    setup
        .logger
        .minor_compaction_started(&session, 2, "/t/1a/f1.rf", Durability::Sync)
        .await
        .unwrap();
    setup
        .logger
        .minor_compaction_finished(&session, 2, Durability::Sync)
        .await
        .unwrap();
    setup
        .logger
        .log(&session, 3, vec![mutation("b"), mutation("c")], Durability::Sync)
        .await
        .unwrap();

    let wal = setup.logger.current_wal().await.unwrap();
    setup.logger.shutdown().await;

    assert!(setup
        .logger
        .needs_recovery(&session.extent, std::slice::from_ref(&wal))
        .await
        .unwrap());

    let mut replayed: Vec<Mutation> = Vec::new();
    let mut sink = |m: Mutation| replayed.push(m);
    setup
        .logger
        .recover(&session.extent, std::slice::from_ref(&wal), &[], &mut sink)
        .await
        .unwrap();

    // mutation "a" was covered by the finished compaction; b and c replay
    assert_eq!(replayed, vec![mutation("b"), mutation("c")]);

    // replaying again produces the same outcome
    let mut again: Vec<Mutation> = Vec::new();
    let mut sink = |m: Mutation| again.push(m);
    setup
        .logger
        .recover(&session.extent, std::slice::from_ref(&wal), &[], &mut sink)
        .await
        .unwrap();
    assert_eq!(again, replayed);
}

#[test_log::test(tokio::test)]
async fn started_compaction_with_surviving_file_counts_as_recovered() {
    let setup = setup(1024 * 1024).await;
    let session = FakeSession::new("1a", 7);

    setup
        .logger
        .log(&session, 1, vec![mutation("a")], Durability::Sync)
        .await
        .unwrap();
    // compaction started and its file landed, but the finish record was lost
    setup
        .logger
        .minor_compaction_started(&session, 2, "/t/1a/f1.rf", Durability::Sync)
        .await
        .unwrap();

    let wal = setup.logger.current_wal().await.unwrap();
    setup.logger.shutdown().await;

    let mut replayed: Vec<Mutation> = Vec::new();
    let mut sink = |m: Mutation| replayed.push(m);
    setup
        .logger
        .recover(
            &session.extent,
            std::slice::from_ref(&wal),
            &["/t/1a/f1.rf".to_string()],
            &mut sink,
        )
        .await
        .unwrap();
    assert!(replayed.is_empty());

    let _ = &setup.dfs;
}
