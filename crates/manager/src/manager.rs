// Copyright (c) 2023 - 2025 Tessera Contributors.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! The manager process: holds the manager lock, runs one tablet group
//! watcher per data level, and fronts the fate engines that run
//! administrative operations.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use parking_lot::Mutex;
use tracing::info;

use tessera_coordination::client::SharedClient;
use tessera_coordination::lock::{ServiceLock, ServiceLockHandle};
use tessera_coordination::memory::ensure_persistent_path;
use tessera_coordination::paths;
use tessera_coordination::wal_marker::WalStateManager;
use tessera_fate::{Fate, FateOptions, FateStore, MetaFateStore, TxStatus, UserFateStore};
use tessera_metadata::MetadataStore;
use tessera_types::config::{ManagerOptions, TableOptions};
use tessera_types::rpc::AdminRpcError;
use tessera_types::{
    DataLevel, FateId, FateInstanceType, KeyExtent, LockId, SteadyTime, TServerInstance,
    TableId, TableState, TabletAvailability,
};

use crate::balancer::TabletBalancer;
use crate::bulk::{check_admission, compute_load_mapping, BulkError, LoadPlan};
use crate::events::EventCoordinator;
use crate::live_servers::{LiveTServerSet, TServerConnector};
use crate::ops::{ImportedTablet, ManagerRepo};
use crate::watcher::TabletGroupWatcher;

/// Shared state every manager component works from. Created once at
/// startup; all other state is passed explicitly.
pub struct ManagerContext {
    pub client: SharedClient,
    pub metadata: MetadataStore,
    pub live_servers: LiveTServerSet,
    pub connector: Arc<dyn TServerConnector>,
    pub balancer: Arc<dyn TabletBalancer>,
    pub wal_markers: WalStateManager,
    pub events: Arc<EventCoordinator>,
    pub options: ManagerOptions,
    pub table_options: TableOptions,
    pub manager_lock: LockId,
    shutdown_servers: Mutex<BTreeSet<TServerInstance>>,
    volume_replacements: Mutex<BTreeMap<String, String>>,
    started: Instant,
}

impl ManagerContext {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        client: SharedClient,
        metadata: MetadataStore,
        connector: Arc<dyn TServerConnector>,
        balancer: Arc<dyn TabletBalancer>,
        options: ManagerOptions,
        table_options: TableOptions,
        manager_lock: LockId,
    ) -> ManagerContext {
        ManagerContext {
            live_servers: LiveTServerSet::new(Arc::clone(&client)),
            wal_markers: WalStateManager::new(Arc::clone(&client)),
            events: Arc::new(EventCoordinator::default()),
            client,
            metadata,
            connector,
            balancer,
            options,
            table_options,
            manager_lock,
            shutdown_servers: Mutex::new(BTreeSet::new()),
            volume_replacements: Mutex::new(BTreeMap::new()),
            started: Instant::now(),
        }
    }

    pub fn steady_time(&self) -> SteadyTime {
        SteadyTime::from_millis(self.started.elapsed().as_millis() as u64)
    }

    pub fn servers_to_shutdown(&self) -> BTreeSet<TServerInstance> {
        self.shutdown_servers.lock().clone()
    }

    pub fn add_shutdown_server(&self, server: TServerInstance) {
        self.shutdown_servers.lock().insert(server);
    }

    pub fn remove_shutdown_server(&self, server: &TServerInstance) {
        self.shutdown_servers.lock().remove(server);
    }

    pub fn volume_replacements(&self) -> BTreeMap<String, String> {
        self.volume_replacements.lock().clone()
    }

    pub fn set_volume_replacements(&self, replacements: BTreeMap<String, String>) {
        *self.volume_replacements.lock() = replacements;
    }

    /// Table states as recorded in the coordination service.
    pub async fn table_states(&self) -> BTreeMap<TableId, TableState> {
        let mut states = BTreeMap::new();
        let tables = match self.client.get_children(paths::TABLES).await {
            Ok(tables) => tables,
            Err(_) => return states,
        };
        for table in tables {
            let table_id = TableId::new(table);
            let state = match self.client.try_get(&paths::table_state(&table_id)).await {
                Ok(Some(value)) => std::str::from_utf8(&value.data)
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(TableState::Unknown),
                _ => TableState::Unknown,
            };
            states.insert(table_id, state);
        }
        states
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ManagerError {
    #[error(transparent)]
    Bulk(#[from] BulkError),
    #[error("fate error: {0}")]
    Fate(#[from] tessera_fate::StoreError),
    #[error("coordination error: {0}")]
    Coordination(#[from] tessera_coordination::Error),
    #[error("tablet server {server} is unreachable: {reason}")]
    ServerUnreachable { server: TServerInstance, reason: String },
    #[error("start row must be less than end row")]
    BadFlushRange,
    #[error("table {0} does not exist")]
    TableNotFound(TableId),
    #[error("table {0} must be offline")]
    TableNotOffline(TableId),
}

/// Manifest written by a table export and consumed by import.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ExportManifest {
    pub source_table: TableId,
    pub tablets: Vec<ImportedTablet>,
}

pub struct Manager {
    ctx: Arc<ManagerContext>,
    lock: ServiceLockHandle,
    watchers: Vec<Arc<TabletGroupWatcher>>,
    fate_meta: Fate<ManagerRepo>,
    fate_user: Fate<ManagerRepo>,
}

impl Manager {
    /// Starts a manager: acquires the manager lock, then starts the
    /// watchers (user first; each higher level depends on the one below
    /// having drained shutdown servers) and both fate engines.
    pub async fn start(
        client: SharedClient,
        metadata: MetadataStore,
        connector: Arc<dyn TServerConnector>,
        balancer: Arc<dyn TabletBalancer>,
        options: ManagerOptions,
        table_options: TableOptions,
    ) -> anyhow::Result<Manager> {
        ensure_persistent_path(client.as_ref(), paths::MANAGER_LOCK).await?;
        ensure_persistent_path(client.as_ref(), paths::TABLES).await?;
        ensure_persistent_path(client.as_ref(), paths::TSERVER_LOCKS).await?;

        let lock = ServiceLock::new(Arc::clone(&client))
            .acquire(paths::MANAGER_LOCK, Bytes::from_static(b"manager"))
            .await?;
        info!("manager lock acquired");

        let ctx = Arc::new(ManagerContext::new(
            Arc::clone(&client),
            metadata.clone(),
            connector,
            balancer,
            options.clone(),
            table_options,
            lock.lock_id().clone(),
        ));

        let user = TabletGroupWatcher::start(Arc::clone(&ctx), DataLevel::User, None);
        let meta = TabletGroupWatcher::start(
            Arc::clone(&ctx),
            DataLevel::Metadata,
            Some(Arc::clone(&user)),
        );
        let root = TabletGroupWatcher::start(
            Arc::clone(&ctx),
            DataLevel::Root,
            Some(Arc::clone(&meta)),
        );

        let fate_options = FateOptions {
            workers: options.fate_workers,
            poll_interval: Duration::from_millis(100),
            dead_reservation_interval: options.fate_dead_reservation_interval.into(),
        };
        let meta_store: Arc<dyn FateStore<ManagerRepo>> =
            Arc::new(MetaFateStore::new(Arc::clone(&client)).await?);
        let user_store: Arc<dyn FateStore<ManagerRepo>> =
            Arc::new(UserFateStore::new(metadata.clone()));
        let fate_meta = Fate::start(
            meta_store,
            Arc::clone(&ctx),
            lock.lock_id().clone(),
            Arc::clone(&client),
            fate_options.clone(),
        );
        let fate_user = Fate::start(
            user_store,
            Arc::clone(&ctx),
            lock.lock_id().clone(),
            Arc::clone(&client),
            fate_options,
        );

        Ok(Manager {
            ctx,
            lock,
            watchers: vec![user, meta, root],
            fate_meta,
            fate_user,
        })
    }

    pub fn context(&self) -> &Arc<ManagerContext> {
        &self.ctx
    }

    pub fn lock_id(&self) -> &LockId {
        self.lock.lock_id()
    }

    fn fate_for(&self, instance_type: FateInstanceType) -> &Fate<ManagerRepo> {
        match instance_type {
            FateInstanceType::Meta => &self.fate_meta,
            FateInstanceType::User => &self.fate_user,
        }
    }

    pub fn fate_stores(&self) -> Vec<Arc<dyn FateStore<ManagerRepo>>> {
        vec![
            Arc::clone(self.fate_meta.store()),
            Arc::clone(self.fate_user.store()),
        ]
    }

    fn user_watcher(&self) -> &Arc<TabletGroupWatcher> {
        &self.watchers[0]
    }

    /// Creates a table as a fate transaction and returns its id.
    pub async fn create_table(
        &self,
        table: TableId,
        name: &str,
        splits: Vec<Bytes>,
        availability: TabletAvailability,
    ) -> Result<FateId, ManagerError> {
        let fate = self.fate_for(FateInstanceType::User);
        let fate_id = fate.create().await?;
        fate.seed_transaction(
            "CreateTable",
            fate_id,
            ManagerRepo::PopulateCoordination {
                table,
                name: name.to_string(),
                splits,
                availability,
            },
            false,
        )
        .await?;
        Ok(fate_id)
    }

    /// Plans and seeds a bulk import. Validation and the admission check
    /// run before anything is seeded; a refused import changes nothing.
    pub async fn bulk_import(
        &self,
        table: TableId,
        import_dir: &str,
        files_in_dir: &[String],
        plan: &LoadPlan,
    ) -> Result<FateId, ManagerError> {
        let mapping = compute_load_mapping(
            &self.ctx.metadata,
            &table,
            import_dir,
            files_in_dir,
            plan,
            &self.ctx.table_options,
        )?;
        check_admission(&self.ctx.metadata, &mapping, &self.ctx.table_options)?;

        let fate = self.fate_for(FateInstanceType::User);
        let fate_id = fate.create().await?;
        fate.seed_transaction(
            "BulkImport",
            fate_id,
            ManagerRepo::LoadFiles { table, mapping },
            false,
        )
        .await?;
        Ok(fate_id)
    }

    /// Seeds a shutdown of one tablet server. Without `force`, an
    /// unreachable server refuses the shutdown up front.
    pub async fn shutdown_server(
        &self,
        server: TServerInstance,
        force: bool,
    ) -> Result<FateId, ManagerError> {
        if !force {
            match self.ctx.connector.connection(&server) {
                Some(connection) => {
                    connection.ping().await.map_err(|err| {
                        ManagerError::ServerUnreachable {
                            server: server.clone(),
                            reason: err.to_string(),
                        }
                    })?;
                }
                None => {
                    return Err(ManagerError::ServerUnreachable {
                        server,
                        reason: "no connection".to_string(),
                    })
                }
            }
        }

        let fate = self.fate_for(FateInstanceType::Meta);
        let fate_id = fate.create().await?;
        fate.seed_transaction(
            "ShutdownTServer",
            fate_id,
            ManagerRepo::PrepShutdown { server },
            false,
        )
        .await?;
        Ok(fate_id)
    }

    /// Marks on-demand tablets as hosting-requested.
    pub async fn host_ondemand(&self, extents: Vec<KeyExtent>) {
        self.user_watcher().host_ondemand(extents).await;
    }

    /// Bumps and returns the table's flush id.
    pub async fn initiate_flush(&self, table: &TableId) -> Result<u64, ManagerError> {
        crate::flush::initiate_flush(&self.ctx, table).await
    }

    /// Waits until every overlapping tablet has caught up to `flush_id`.
    pub async fn wait_for_flush(
        &self,
        table: &TableId,
        start_row: Option<Bytes>,
        end_row: Option<Bytes>,
        flush_id: u64,
        max_loops: u64,
    ) -> Result<(), ManagerError> {
        crate::flush::wait_for_flush(&self.ctx, table, start_row, end_row, flush_id, max_loops)
            .await
    }

    /// Offline export: the manifest a new instance needs to import the
    /// table bitwise-equal.
    pub async fn export_table(&self, table: &TableId) -> Result<ExportManifest, ManagerError> {
        let states = self.ctx.table_states().await;
        match states.get(table) {
            None => return Err(ManagerError::TableNotFound(table.clone())),
            Some(TableState::Offline) => {}
            Some(_) => return Err(ManagerError::TableNotOffline(table.clone())),
        }
        use tessera_metadata::Ample;
        use tessera_types::ColumnSet;
        let tablets = self
            .ctx
            .metadata
            .read_tablets()
            .for_table(table.clone())
            .fetch(ColumnSet::ALL)
            .build()
            .map(|tm| ImportedTablet {
                end_row: tm.extent().end_row().map(Bytes::copy_from_slice),
                prev_end_row: tm.extent().prev_end_row().map(Bytes::copy_from_slice),
                files: tm.files().iter().cloned().collect(),
            })
            .collect();
        Ok(ExportManifest {
            source_table: table.clone(),
            tablets,
        })
    }

    /// Imports a previously exported table under a new id. All imported
    /// tablets come up on-demand.
    pub async fn import_table(
        &self,
        table: TableId,
        name: &str,
        manifest: ExportManifest,
    ) -> Result<FateId, ManagerError> {
        let fate = self.fate_for(FateInstanceType::User);
        let fate_id = fate.create().await?;
        fate.seed_transaction(
            "ImportTable",
            fate_id,
            ManagerRepo::ImportPopulateCoordination {
                table,
                name: name.to_string(),
                tablets: manifest.tablets,
            },
            false,
        )
        .await?;
        Ok(fate_id)
    }

    /// Waits (bounded) for a fate transaction to reach a terminal status.
    pub async fn wait_for_fate(
        &self,
        fate_id: FateId,
        timeout: Duration,
    ) -> Result<TxStatus, ManagerError> {
        let store = self.fate_for(fate_id.instance_type).store();
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let status = store.status(fate_id).await?;
            if status.is_terminal() || tokio::time::Instant::now() >= deadline {
                return Ok(status);
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    pub async fn stop(self) {
        for watcher in &self.watchers {
            watcher.stop();
        }
        self.fate_meta.shutdown().await;
        self.fate_user.shutdown().await;
        let _ = self.lock.release().await;
    }
}

impl From<AdminRpcError> for ManagerError {
    fn from(err: AdminRpcError) -> Self {
        ManagerError::ServerUnreachable {
            server: TServerInstance::new("unknown", 0),
            reason: err.to_string(),
        }
    }
}
