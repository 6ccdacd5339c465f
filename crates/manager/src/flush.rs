// Copyright (c) 2023 - 2025 Tessera Contributors.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! The flush barrier: bump a table's flush id, nudge every hosting server,
//! and wait until no overlapping tablet is behind.

use bytes::Bytes;
use tracing::{debug, warn};

use tessera_coordination::client::{CreateMode, CreatePolicy};
use tessera_coordination::paths;
use tessera_metadata::Ample;
use tessera_types::{ColumnSet, ColumnType, TServerInstance, TableId};

use crate::manager::{ManagerContext, ManagerError};

fn flush_id_path(table: &TableId) -> String {
    format!("{}/{table}/flush-id", paths::TABLES)
}

/// Bumps the table's flush id and returns the new value.
pub async fn initiate_flush(ctx: &ManagerContext, table: &TableId) -> Result<u64, ManagerError> {
    let path = flush_id_path(table);
    ctx.client
        .create(
            &path,
            Bytes::from_static(b"0"),
            CreateMode::Persistent,
            CreatePolicy::SkipIfExists,
        )
        .await?;
    let new_id = parking_lot::Mutex::new(0u64);
    ctx.client
        .mutate_existing(&path, &|raw| {
            let current: u64 = std::str::from_utf8(raw)
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(0);
            *new_id.lock() = current + 1;
            Ok(Bytes::from((current + 1).to_string()))
        })
        .await?;
    let new_id = *new_id.lock();
    Ok(new_id)
}

/// Waits until every overlapping tablet that is hosted or has logs reports
/// `flush_id` or newer. Re-nudges the hosting servers each loop.
pub async fn wait_for_flush(
    ctx: &ManagerContext,
    table: &TableId,
    start_row: Option<Bytes>,
    end_row: Option<Bytes>,
    flush_id: u64,
    max_loops: u64,
) -> Result<(), ManagerError> {
    if let (Some(start), Some(end)) = (&start_row, &end_row) {
        if start >= end {
            return Err(ManagerError::BadFlushRange);
        }
    }

    if *table == TableId::root() {
        // this code does not properly handle the root tablet
        debug!("skipping flush wait for the root table");
        return Ok(());
    }

    let mut servers_to_flush: Vec<TServerInstance> =
        ctx.live_servers.current_servers().await.into_iter().collect();

    for _ in 0..max_loops {
        for server in &servers_to_flush {
            match ctx.connector.connection(server) {
                Some(connection) => {
                    if let Err(err) = connection
                        .flush(
                            ctx.manager_lock.clone(),
                            table.clone(),
                            start_row.clone(),
                            end_row.clone(),
                            flush_id,
                        )
                        .await
                    {
                        warn!(%server, "flush request failed: {err}");
                    }
                }
                None => warn!(%server, "could not connect for flush"),
            }
        }

        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        servers_to_flush.clear();
        let mut tablets_to_wait_for = 0usize;
        let mut tablet_count = 0usize;
        let tablets = ctx
            .metadata
            .read_tablets()
            .for_table(table.clone())
            .overlapping(start_row.clone(), end_row.clone())
            .fetch(ColumnSet::of(&[
                ColumnType::PrevRow,
                ColumnType::FlushId,
                ColumnType::Location,
                ColumnType::Logs,
            ]))
            .build();
        for tm in tablets {
            tablet_count += 1;
            let behind = tm.flush_id().unwrap_or(0) < flush_id;
            // a tablet that is neither hosted nor holding logs has nothing
            // to flush
            if behind && (tm.has_current() || !tm.logs().is_empty()) {
                tablets_to_wait_for += 1;
                if let Some(server) = tm.current() {
                    servers_to_flush.push(server.clone());
                }
            }
        }

        if tablets_to_wait_for == 0 {
            return Ok(());
        }

        if tablet_count == 0
            && !ctx
                .client
                .exists(&format!("{}/{table}", paths::TABLES))
                .await
                .unwrap_or(false)
        {
            return Err(ManagerError::TableNotFound(table.clone()));
        }
    }

    Ok(())
}
