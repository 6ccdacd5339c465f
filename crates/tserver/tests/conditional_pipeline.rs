// Copyright (c) 2023 - 2025 Tessera Contributors.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Server-side conditional update pipeline against a hosted tablet.

use std::collections::BTreeMap;
use std::sync::Arc;

use bytes::Bytes;

use tessera_coordination::MemoryCoordination;
use tessera_metadata::mutator::ConditionalStatus as RowStatus;
use tessera_metadata::{Ample, MetadataStore};
use tessera_tserver::TabletServer;
use tessera_types::config::{TableOptions, WalOptions};
use tessera_types::rpc::{IngestError, ServerConditionalMutation, TabletIngestService};
use tessera_types::{
    ColumnSet, Condition, ConditionalMutation, ConditionalStatus, Durability, KeyExtent,
    Mutation, TServerInstance, TableId, TabletAvailability,
};
use tessera_wal::LocalDfs;

struct Setup {
    _dir: tempfile::TempDir,
    server: Arc<TabletServer>,
    metadata: MetadataStore,
    extent: KeyExtent,
    table: TableId,
}

async fn hosted_tablet() -> Setup {
    hosted_tablet_with(TableOptions::default()).await
}

async fn hosted_tablet_with(table_options: TableOptions) -> Setup {
    let coordination = MemoryCoordination::new();
    let metadata = MetadataStore::new();
    let dir = tempfile::tempdir().unwrap();
    let dfs = Arc::new(LocalDfs::new(dir.path()));

    let table = TableId::new("1a");
    metadata.bootstrap_table(&table, &[], TabletAvailability::Hosted);
    let extent = KeyExtent::whole_table(table.clone());

    let instance = TServerInstance::new("host1:9997", 11);
    let server = TabletServer::start(
        instance.clone(),
        coordination.client(),
        metadata.clone(),
        dfs,
        WalOptions::default(),
        table_options,
    )
    .await
    .unwrap();

    // grant the future location and let the server take the tablet
    let mut mutator = metadata.conditionally_mutate_tablets();
    mutator
        .mutate_tablet(extent.clone())
        .require_absent_operation()
        .require_absent_location()
        .put_future_location(instance.clone())
        .submit(|_| false, "test future");
    assert_eq!(mutator.process()[&extent].status, RowStatus::Accepted);
    server.load_tablet(&extent).await.unwrap();

    Setup {
        _dir: dir,
        server,
        metadata,
        extent,
        table,
    }
}

fn scm(cmid: u64, row: &str, value: &str) -> ServerConditionalMutation {
    ServerConditionalMutation {
        cmid,
        mutation: ConditionalMutation::new(
            Mutation::new(row.as_bytes().to_vec()).put(
                &b"f"[..],
                &b"q"[..],
                value.as_bytes().to_vec(),
            ),
        )
        .with_condition(Condition::new(&b"f"[..], &b"q"[..])),
    }
}

fn status_of(results: &[tessera_types::rpc::CmResult], cmid: u64) -> ConditionalStatus {
    results
        .iter()
        .find(|r| r.cmid == cmid)
        .expect("result present")
        .status
}

#[test_log::test(tokio::test)]
async fn duplicate_rows_process_one_per_round() {
    let setup = hosted_tablet().await;
    let session = setup
        .server
        .start_conditional_update(setup.table.clone(), Vec::new(), Durability::Log)
        .await
        .unwrap();

    // two mutations for the same row in one request: the second runs in a
    // later round, sees the first's write and gets rejected
    let updates: BTreeMap<_, _> = [(
        setup.extent.clone(),
        vec![scm(1, "dup", "first"), scm(2, "dup", "second")],
    )]
    .into();
    let results = setup
        .server
        .conditional_update(session.session_id, updates, Vec::new())
        .await
        .unwrap();

    assert_eq!(results.len(), 2);
    assert_eq!(status_of(&results, 1), ConditionalStatus::Accepted);
    assert_eq!(status_of(&results, 2), ConditionalStatus::Rejected);
}

#[test_log::test(tokio::test)]
async fn unhosted_extent_is_ignored() {
    let setup = hosted_tablet().await;
    let session = setup
        .server
        .start_conditional_update(setup.table.clone(), Vec::new(), Durability::Log)
        .await
        .unwrap();

    let foreign = KeyExtent::new(
        setup.table.clone(),
        Some(Bytes::from_static(b"zzz-not-a-tablet")),
        None::<Bytes>,
    );
    let updates: BTreeMap<_, _> = [(foreign, vec![scm(1, "row", "v")])].into();
    let results = setup
        .server
        .conditional_update(session.session_id, updates, Vec::new())
        .await
        .unwrap();
    assert_eq!(status_of(&results, 1), ConditionalStatus::Ignored);
}

#[test_log::test(tokio::test)]
async fn too_many_open_files_is_ignored() {
    let setup = hosted_tablet_with(TableOptions {
        scan_max_open_files: 2,
        ..TableOptions::default()
    })
    .await;
    let session = setup
        .server
        .start_conditional_update(setup.table.clone(), Vec::new(), Durability::Log)
        .await
        .unwrap();

    // reading a row view of this tablet would need three open files
    let tablet = setup.server.online_tablet(&setup.extent).unwrap();
    tablet.set_files(vec![
        tessera_types::StoredFile::new("/t/1a/f1.rf"),
        tessera_types::StoredFile::new("/t/1a/f2.rf"),
        tessera_types::StoredFile::new("/t/1a/f3.rf"),
    ]);

    let updates: BTreeMap<_, _> =
        [(setup.extent.clone(), vec![scm(1, "row", "v")])].into();
    let results = setup
        .server
        .conditional_update(session.session_id, updates, Vec::new())
        .await
        .unwrap();
    assert_eq!(status_of(&results, 1), ConditionalStatus::Ignored);

    // nothing was written
    let everyone = tessera_types::visibility::VisibilityEvaluator::new(Vec::<Vec<u8>>::new());
    assert!(tablet.scan_all(&everyone).is_empty());
}

#[test_log::test(tokio::test)]
async fn constraint_violations_report_violated() {
    let setup = hosted_tablet().await;
    // the session has no authorizations, so writing a labeled cell is a
    // constraint violation
    let session = setup
        .server
        .start_conditional_update(setup.table.clone(), Vec::new(), Durability::Log)
        .await
        .unwrap();

    let labeled = ServerConditionalMutation {
        cmid: 1,
        mutation: ConditionalMutation::new(
            Mutation::new(&b"row"[..]).put_visible(
                &b"f"[..],
                &b"q"[..],
                &b"secret"[..],
                &b"v"[..],
            ),
        )
        .with_condition(Condition::new(&b"f"[..], &b"q"[..])),
    };
    let updates: BTreeMap<_, _> = [(setup.extent.clone(), vec![labeled])].into();
    let results = setup
        .server
        .conditional_update(session.session_id, updates, Vec::new())
        .await
        .unwrap();
    assert_eq!(status_of(&results, 1), ConditionalStatus::Violated);
}

#[test_log::test(tokio::test)]
async fn invalidated_session_fences_future_updates() {
    let setup = hosted_tablet().await;
    let session = setup
        .server
        .start_conditional_update(setup.table.clone(), Vec::new(), Durability::Log)
        .await
        .unwrap();

    setup
        .server
        .invalidate_conditional_update(session.session_id)
        .await
        .unwrap();

    let updates: BTreeMap<_, _> =
        [(setup.extent.clone(), vec![scm(1, "row", "v")])].into();
    let err = setup
        .server
        .conditional_update(session.session_id, updates, Vec::new())
        .await
        .unwrap_err();
    assert!(matches!(err, IngestError::NoSuchSession));

    // and nothing from the fenced session is visible
    let everyone = tessera_types::visibility::VisibilityEvaluator::new(Vec::<Vec<u8>>::new());
    let tablet = setup.server.online_tablet(&setup.extent).unwrap();
    assert!(tablet.scan_all(&everyone).is_empty());
}

#[test_log::test(tokio::test)]
async fn accepted_mutations_record_log_association() {
    let setup = hosted_tablet().await;
    let session = setup
        .server
        .start_conditional_update(setup.table.clone(), Vec::new(), Durability::Sync)
        .await
        .unwrap();

    let updates: BTreeMap<_, _> =
        [(setup.extent.clone(), vec![scm(1, "row", "v")])].into();
    let results = setup
        .server
        .conditional_update(session.session_id, updates, Vec::new())
        .await
        .unwrap();
    assert_eq!(status_of(&results, 1), ConditionalStatus::Accepted);

    // the durable write published the log association into the metadata
    let wal = setup.server.logger().current_wal().await.expect("log open");
    let tm = setup
        .metadata
        .read_tablet(&setup.extent, ColumnSet::ALL)
        .expect("tablet row");
    assert!(tm.logs().contains(&wal));
}
