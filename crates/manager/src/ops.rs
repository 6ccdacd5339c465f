// Copyright (c) 2023 - 2025 Tessera Contributors.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! The manager's fate steps, one tagged sum over every multi-tablet
//! administrative operation: table creation, bulk import, table import and
//! tablet-server shutdown. Every step's side effects are idempotent; the
//! engine replays them at-least-once.

use std::collections::BTreeMap;
use std::time::Duration;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use tessera_coordination::client::{CreateMode, CreatePolicy};
use tessera_coordination::memory::ensure_persistent_path;
use tessera_coordination::paths;
use tessera_fate::{Ready, Repo};
use tessera_metadata::mutator::ConditionalStatus as RowStatus;
use tessera_metadata::Ample;
use tessera_types::{
    ColumnSet, ColumnType, FateId, KeyExtent, MetadataTime, StoredFile, TServerInstance,
    TableId, TabletAvailability,
};

use crate::bulk::{check_admission, LoadMapping};
use crate::events::EventScope;
use crate::manager::ManagerContext;

/// Splits plus per-tablet files, as carried by table import.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImportedTablet {
    pub end_row: Option<Bytes>,
    pub prev_end_row: Option<Bytes>,
    pub files: Vec<StoredFile>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ManagerRepo {
    // -- create table --
    PopulateCoordination {
        table: TableId,
        name: String,
        splits: Vec<Bytes>,
        availability: TabletAvailability,
    },
    PopulateMetadata {
        table: TableId,
        splits: Vec<Bytes>,
        availability: TabletAvailability,
    },
    FinishCreateTable {
        table: TableId,
    },

    // -- bulk import --
    LoadFiles {
        table: TableId,
        mapping: LoadMapping,
    },
    RefreshTablets {
        table: TableId,
        extents: Vec<KeyExtent>,
    },
    CleanUpBulkImport {
        table: TableId,
        import_dir: String,
    },

    // -- import table --
    ImportPopulateCoordination {
        table: TableId,
        name: String,
        tablets: Vec<ImportedTablet>,
    },
    ImportPopulateMetadata {
        table: TableId,
        tablets: Vec<ImportedTablet>,
    },
    FinishImportTable {
        table: TableId,
    },

    // -- tablet server shutdown --
    PrepShutdown {
        server: TServerInstance,
    },
    DrainServer {
        server: TServerInstance,
    },
    WaitForUnloads {
        server: TServerInstance,
    },
    FinalizeShutdown {
        server: TServerInstance,
    },
}

impl ManagerRepo {
    async fn create_table_nodes(
        ctx: &ManagerContext,
        table: &TableId,
        name: &str,
    ) -> anyhow::Result<()> {
        let base = format!("{}/{table}", paths::TABLES);
        let conf = paths::table_conf(table);
        let state = paths::table_state(table);
        ensure_persistent_path(ctx.client.as_ref(), &base).await?;
        ctx.client
            .create(
                &format!("{base}/name"),
                Bytes::from(name.to_string()),
                CreateMode::Persistent,
                CreatePolicy::Overwrite,
            )
            .await?;
        ctx.client
            .create(
                &conf,
                Bytes::from_static(b"{}"),
                CreateMode::Persistent,
                CreatePolicy::SkipIfExists,
            )
            .await?;
        ctx.client
            .create(
                &state,
                Bytes::from("Online".to_string()),
                CreateMode::Persistent,
                CreatePolicy::Overwrite,
            )
            .await?;
        Ok(())
    }

    fn tablet_extents(
        table: &TableId,
        splits: &[Bytes],
    ) -> Vec<(KeyExtent, Option<Bytes>)> {
        let mut extents = Vec::with_capacity(splits.len() + 1);
        let mut prev: Option<Bytes> = None;
        let mut boundaries: Vec<Option<Bytes>> = splits.iter().cloned().map(Some).collect();
        boundaries.push(None);
        for end in boundaries {
            extents.push((
                KeyExtent::new(table.clone(), end.clone(), prev.clone()),
                prev.clone(),
            ));
            prev = end;
        }
        extents
    }

    fn create_tablets(
        ctx: &ManagerContext,
        table: &TableId,
        tablets: &[(KeyExtent, Vec<StoredFile>)],
        availability: TabletAvailability,
    ) -> anyhow::Result<()> {
        let mut mutator = ctx.metadata.conditionally_mutate_tablets();
        for (extent, files) in tablets {
            let mut tablet_mutator = mutator
                .mutate_tablet(extent.clone())
                .require_absent_tablet()
                .create_tablet()
                .put_availability(availability)
                .put_time(MetadataTime::Millis(0));
            for file in files {
                tablet_mutator = tablet_mutator.put_file(file.clone());
            }
            // a replayed step finds the tablet already there; that is success
            tablet_mutator.submit(
                move |tm| tm.availability() == availability,
                "create tablet",
            );
        }
        for (extent, result) in mutator.process() {
            if result.status != RowStatus::Accepted {
                anyhow::bail!(
                    "could not create tablet {extent} for table {table}: {}",
                    result.status
                );
            }
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl Repo for ManagerRepo {
    type Env = ManagerContext;

    fn name(&self) -> &'static str {
        match self {
            ManagerRepo::PopulateCoordination { .. } => "PopulateCoordination",
            ManagerRepo::PopulateMetadata { .. } => "PopulateMetadata",
            ManagerRepo::FinishCreateTable { .. } => "FinishCreateTable",
            ManagerRepo::LoadFiles { .. } => "LoadFiles",
            ManagerRepo::RefreshTablets { .. } => "RefreshTablets",
            ManagerRepo::CleanUpBulkImport { .. } => "CleanUpBulkImport",
            ManagerRepo::ImportPopulateCoordination { .. } => "ImportPopulateCoordination",
            ManagerRepo::ImportPopulateMetadata { .. } => "ImportPopulateMetadata",
            ManagerRepo::FinishImportTable { .. } => "FinishImportTable",
            ManagerRepo::PrepShutdown { .. } => "PrepShutdown",
            ManagerRepo::DrainServer { .. } => "DrainServer",
            ManagerRepo::WaitForUnloads { .. } => "WaitForUnloads",
            ManagerRepo::FinalizeShutdown { .. } => "FinalizeShutdown",
        }
    }

    async fn is_ready(&self, _fate_id: FateId, env: &ManagerContext) -> anyhow::Result<Ready> {
        match self {
            ManagerRepo::LoadFiles { mapping, .. } => {
                // a tablet over the pause threshold blocks further bulk
                // loads into it (other bulk transactions, never user writes)
                for (extent, _) in &mapping.tablets {
                    let files = env
                        .metadata
                        .read_tablet(extent, ColumnSet::of(&[ColumnType::Files]))
                        .map(|tm| tm.files().len())
                        .unwrap_or(0);
                    if files > env.table_options.file_pause {
                        debug!(%extent, files, "bulk load paused on busy tablet");
                        return Ok(Ready::After(Duration::from_secs(30)));
                    }
                }
                Ok(Ready::Now)
            }
            ManagerRepo::WaitForUnloads { server } => {
                let still_assigned = env
                    .metadata
                    .read_tablets()
                    .fetch(ColumnSet::of(&[ColumnType::PrevRow, ColumnType::Location]))
                    .build()
                    .any(|tm| {
                        tm.current() == Some(server) || tm.future() == Some(server)
                    });
                if still_assigned {
                    Ok(Ready::After(Duration::from_millis(250)))
                } else {
                    Ok(Ready::Now)
                }
            }
            _ => Ok(Ready::Now),
        }
    }

    async fn call(
        &self,
        fate_id: FateId,
        env: &ManagerContext,
    ) -> anyhow::Result<Option<ManagerRepo>> {
        match self {
            ManagerRepo::PopulateCoordination {
                table,
                name,
                splits,
                availability,
            } => {
                Self::create_table_nodes(env, table, name).await?;
                Ok(Some(ManagerRepo::PopulateMetadata {
                    table: table.clone(),
                    splits: splits.clone(),
                    availability: *availability,
                }))
            }
            ManagerRepo::PopulateMetadata {
                table,
                splits,
                availability,
            } => {
                let tablets: Vec<(KeyExtent, Vec<StoredFile>)> =
                    Self::tablet_extents(table, splits)
                        .into_iter()
                        .map(|(extent, _)| (extent, Vec::new()))
                        .collect();
                Self::create_tablets(env, table, &tablets, *availability)?;
                Ok(Some(ManagerRepo::FinishCreateTable {
                    table: table.clone(),
                }))
            }
            ManagerRepo::FinishCreateTable { table } => {
                info!(%table, "table created");
                env.events
                    .event(EventScope::All, format!("table {table} created"));
                Ok(None)
            }

            ManagerRepo::LoadFiles { table, mapping } => {
                check_admission(&env.metadata, mapping, &env.table_options)?;
                let mut refreshed = Vec::new();
                let mut mutator = env.metadata.conditionally_mutate_tablets();
                let mut submitted = false;
                for (extent, files) in &mapping.tablets {
                    let tm = env
                        .metadata
                        .read_tablet(extent, ColumnSet::of(&[ColumnType::Loaded]))
                        .ok_or_else(|| {
                            anyhow::anyhow!("tablet {extent} disappeared during bulk load")
                        })?;
                    // replaying detects files already loaded by this
                    // transaction and leaves them alone
                    let to_load: Vec<StoredFile> = files
                        .iter()
                        .filter(|file| tm.loaded().get(*file) != Some(&fate_id))
                        .cloned()
                        .collect();
                    refreshed.push(extent.clone());
                    if to_load.is_empty() {
                        continue;
                    }
                    let mut tablet_mutator = mutator
                        .mutate_tablet(extent.clone())
                        .require_absent_operation();
                    for file in &to_load {
                        tablet_mutator = tablet_mutator
                            .require_absent_loaded(file.clone())
                            .put_file(file.clone())
                            .put_loaded(file.clone(), fate_id);
                    }
                    let wanted = to_load.clone();
                    tablet_mutator.submit(
                        move |tm| {
                            wanted
                                .iter()
                                .all(|file| tm.loaded().get(file) == Some(&fate_id))
                        },
                        "bulk load files",
                    );
                    submitted = true;
                }
                if submitted {
                    for (extent, result) in mutator.process() {
                        if result.status != RowStatus::Accepted {
                            anyhow::bail!(
                                "bulk load of {extent} was not accepted: {}",
                                result.status
                            );
                        }
                    }
                }
                Ok(Some(ManagerRepo::RefreshTablets {
                    table: table.clone(),
                    extents: refreshed,
                }))
            }
            ManagerRepo::RefreshTablets { table, extents } => {
                // hosted tablets must observe their new files
                let mut by_server: BTreeMap<TServerInstance, Vec<KeyExtent>> = BTreeMap::new();
                for extent in extents {
                    if let Some(tm) = env
                        .metadata
                        .read_tablet(extent, ColumnSet::of(&[ColumnType::Location]))
                    {
                        if let Some(server) = tm.current() {
                            by_server
                                .entry(server.clone())
                                .or_default()
                                .push(extent.clone());
                        }
                    }
                }
                for (server, extents) in by_server {
                    match env.connector.connection(&server) {
                        Some(connection) => {
                            if let Err(err) = connection.refresh_tablets(extents).await {
                                warn!(%server, "refresh failed: {err}");
                            }
                        }
                        None => warn!(%server, "could not connect for refresh"),
                    }
                }
                Ok(Some(ManagerRepo::CleanUpBulkImport {
                    table: table.clone(),
                    import_dir: String::new(),
                }))
            }
            ManagerRepo::CleanUpBulkImport { table, .. } => {
                info!(%table, %fate_id, "bulk import complete");
                env.events.event(
                    EventScope::Level(tessera_types::DataLevel::User),
                    format!("bulk import into {table} complete"),
                );
                Ok(None)
            }

            ManagerRepo::ImportPopulateCoordination { table, name, tablets } => {
                Self::create_table_nodes(env, table, name).await?;
                Ok(Some(ManagerRepo::ImportPopulateMetadata {
                    table: table.clone(),
                    tablets: tablets.clone(),
                }))
            }
            ManagerRepo::ImportPopulateMetadata { table, tablets } => {
                let with_files: Vec<(KeyExtent, Vec<StoredFile>)> = tablets
                    .iter()
                    .map(|t| {
                        (
                            KeyExtent::new(
                                table.clone(),
                                t.end_row.clone(),
                                t.prev_end_row.clone(),
                            ),
                            t.files.clone(),
                        )
                    })
                    .collect();
                // imported tablets are always on-demand, whatever the
                // source table's availability was
                Self::create_tablets(env, table, &with_files, TabletAvailability::OnDemand)?;
                Ok(Some(ManagerRepo::FinishImportTable {
                    table: table.clone(),
                }))
            }
            ManagerRepo::FinishImportTable { table } => {
                info!(%table, "table imported");
                env.events
                    .event(EventScope::All, format!("table {table} imported"));
                Ok(None)
            }

            ManagerRepo::PrepShutdown { server } => {
                env.add_shutdown_server(server.clone());
                Ok(Some(ManagerRepo::DrainServer {
                    server: server.clone(),
                }))
            }
            ManagerRepo::DrainServer { server } => {
                if let Some(connection) = env.connector.connection(server) {
                    if let Err(err) = connection.drain().await {
                        // a dead server is already as drained as it gets
                        debug!(%server, "drain request failed: {err}");
                    }
                }
                Ok(Some(ManagerRepo::WaitForUnloads {
                    server: server.clone(),
                }))
            }
            ManagerRepo::WaitForUnloads { server } => {
                Ok(Some(ManagerRepo::FinalizeShutdown {
                    server: server.clone(),
                }))
            }
            ManagerRepo::FinalizeShutdown { server } => {
                if let Some(connection) = env.connector.connection(server) {
                    if let Err(err) = connection.halt(env.manager_lock.clone()).await {
                        debug!(%server, "halt request failed: {err}");
                    }
                }
                env.remove_shutdown_server(server);
                info!(%server, "tablet server shut down");
                Ok(None)
            }
        }
    }

    async fn undo(&self, _fate_id: FateId, env: &ManagerContext) -> anyhow::Result<()> {
        match self {
            ManagerRepo::PrepShutdown { server } => {
                // a failed shutdown must not leave the server unschedulable
                env.remove_shutdown_server(server);
                Ok(())
            }
            _ => Ok(()),
        }
    }
}
