// Copyright (c) 2023 - 2025 Tessera Contributors.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! The tablet group watcher: one per data level. A full-scan loop and an
//! event-driven partial-scan loop run the same core routine; buffered
//! changes are flushed through a single lock because the balancer and the
//! dead-log handling are not safe for concurrent callers.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{mpsc, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use tessera_metadata::mutator::ConditionalStatus as RowStatus;
use tessera_metadata::Ample;
use tessera_types::{
    ColumnSet, ColumnType, DataLevel, KeyExtent, Location, LocationKind, StoredFile, Suspension,
    TServerInstance, TableState, TabletAvailability, TabletGoalState, TabletMetadata,
    TabletState, WalRef,
};

use crate::manager::ManagerContext;
use crate::state::{TabletGoalStateExt, TabletManagementParameters};

const EVENT_QUEUE_CAPACITY: usize = 10_000;
const MAX_VOLUME_REPLACEMENTS_PER_FLUSH: usize = 1_000;

struct Assignment {
    extent: KeyExtent,
    server: TServerInstance,
}

struct VolumeReplacement {
    tm: TabletMetadata,
    files_to_remove: Vec<StoredFile>,
    files_to_add: Vec<StoredFile>,
    logs_to_remove: Vec<WalRef>,
    logs_to_add: Vec<WalRef>,
}

/// Buffers of work accumulated over one scan, applied by `flush_changes`.
#[derive(Default)]
struct TabletLists {
    /// Fresh assignments that need a future location and an RPC.
    unassigned: BTreeMap<KeyExtent, Option<TServerInstance>>,
    /// Reminders for tablets that already have a future location.
    assigned: Vec<Assignment>,
    assigned_to_dead_servers: Vec<TabletMetadata>,
    suspended_to_gone_servers: Vec<TabletMetadata>,
    volume_replacements: Vec<VolumeReplacement>,
}

impl TabletLists {
    fn reset(&mut self) {
        self.unassigned.clear();
        self.assigned.clear();
        self.assigned_to_dead_servers.clear();
        self.suspended_to_gone_servers.clear();
        self.volume_replacements.clear();
    }
}

#[derive(Default, Debug)]
struct ScanStats {
    unloaded: usize,
    volume_replacements_seen: usize,
    errors: usize,
}

pub struct TabletGroupWatcher {
    ctx: Arc<ManagerContext>,
    level: DataLevel,
    /// The watcher of the level below; its view of which shutdown servers
    /// still hold tablets gates this level's shutdown work.
    dependent: Option<Arc<TabletGroupWatcher>>,
    flush_lock: tokio::sync::Mutex<()>,
    needs_full_scan: AtomicBool,
    full_scan_nudge: Notify,
    ranges_tx: mpsc::Sender<KeyExtent>,
    filtered_servers_to_shutdown: Mutex<BTreeSet<TServerInstance>>,
    hosting_request_in_progress: Mutex<BTreeSet<KeyExtent>>,
    cancel: CancellationToken,
}

impl TabletGroupWatcher {
    pub fn start(
        ctx: Arc<ManagerContext>,
        level: DataLevel,
        dependent: Option<Arc<TabletGroupWatcher>>,
    ) -> Arc<TabletGroupWatcher> {
        let (ranges_tx, ranges_rx) = mpsc::channel(EVENT_QUEUE_CAPACITY);
        let watcher = Arc::new(TabletGroupWatcher {
            ctx,
            level,
            dependent,
            flush_lock: tokio::sync::Mutex::new(()),
            // unknown history before this watcher existed: start with a full scan
            needs_full_scan: AtomicBool::new(true),
            full_scan_nudge: Notify::new(),
            ranges_tx,
            filtered_servers_to_shutdown: Mutex::new(BTreeSet::new()),
            hosting_request_in_progress: Mutex::new(BTreeSet::new()),
            cancel: CancellationToken::new(),
        });

        {
            let watcher = Arc::clone(&watcher);
            watcher.ctx.events.add_listener(
                Some(level),
                Arc::new({
                    let watcher = Arc::clone(&watcher);
                    move |event| watcher.on_event(event)
                }),
            );
        }
        {
            let watcher = Arc::clone(&watcher);
            tokio::spawn(async move { watcher.run_full_scans().await });
        }
        {
            let watcher = Arc::clone(&watcher);
            tokio::spawn(async move { watcher.run_range_processor(ranges_rx).await });
        }
        watcher
    }

    pub fn level(&self) -> DataLevel {
        self.level
    }

    pub fn stop(&self) {
        self.cancel.cancel();
    }

    /// Shutdown-listed servers that this watcher observed holding no
    /// tablets in its last full scan.
    pub fn filtered_servers_to_shutdown(&self) -> BTreeSet<TServerInstance> {
        self.filtered_servers_to_shutdown.lock().clone()
    }

    fn set_needs_full_scan(&self) {
        self.needs_full_scan.store(true, Ordering::SeqCst);
        self.full_scan_nudge.notify_waiters();
    }

    fn on_event(&self, event: &crate::events::Event) {
        match &event.scope {
            crate::events::EventScope::All | crate::events::EventScope::Level(_) => {
                self.set_needs_full_scan();
            }
            crate::events::EventScope::TabletRange(extent) => {
                if self.ranges_tx.try_send(extent.clone()).is_err() {
                    debug!(level = %self.level, "event queue full, demoting to full scan");
                    self.set_needs_full_scan();
                }
            }
        }
    }

    async fn run_range_processor(&self, mut ranges_rx: mpsc::Receiver<KeyExtent>) {
        loop {
            let first = tokio::select! {
                _ = self.cancel.cancelled() => return,
                range = ranges_rx.recv() => match range {
                    Some(range) => range,
                    None => return,
                },
            };
            let mut ranges = vec![first];
            while let Ok(range) = ranges_rx.try_recv() {
                ranges.push(range);
            }
            if !self.process_ranges(ranges).await {
                self.set_needs_full_scan();
            }
        }
    }

    /// Partial scan over specific tablet ranges. Returns false when the
    /// work could not be done and a full scan should cover for it.
    pub async fn process_ranges(&self, ranges: Vec<KeyExtent>) -> bool {
        let Some(params) = self.management_parameters().await else {
            return false;
        };
        let current_servers = params.online_servers.clone();
        if current_servers.is_empty() {
            return false;
        }

        let mut tablets = Vec::with_capacity(ranges.len());
        for range in &ranges {
            if let Some(tm) = self.ctx.metadata.read_tablet(range, ColumnSet::ALL) {
                tablets.push(tm);
            }
        }
        match self
            .manage_tablets(tablets, &params, &current_servers, false)
            .await
        {
            Ok(_) => {
                trace!(level = %self.level, ranges = ranges.len(), "partial scan done");
                true
            }
            Err(err) => {
                error!(level = %self.level, "error processing ranges: {err:#}");
                false
            }
        }
    }

    async fn management_parameters(&self) -> Option<TabletManagementParameters> {
        let servers_to_shutdown = match (&self.dependent, self.level) {
            (_, DataLevel::User) => self.ctx.servers_to_shutdown(),
            // higher levels only act once the dependent level has drained
            // the server
            (Some(dependent), _) => dependent.filtered_servers_to_shutdown(),
            (None, _) => self.ctx.servers_to_shutdown(),
        };
        Some(TabletManagementParameters {
            level: self.level,
            table_states: self.ctx.table_states().await,
            online_servers: self.ctx.live_servers.current_servers().await,
            servers_to_shutdown,
            can_suspend_tablets: self.level == DataLevel::User
                && self.ctx.table_options.suspend_duration() > Duration::ZERO,
            volume_replacements: self.ctx.volume_replacements(),
            steady_time: self.ctx.steady_time(),
        })
    }

    async fn run_full_scans(&self) {
        while !self.cancel.is_cancelled() {
            if !self.needs_full_scan.load(Ordering::SeqCst) {
                tokio::select! {
                    _ = self.cancel.cancelled() => return,
                    _ = self.full_scan_nudge.notified() => {}
                    _ = tokio::time::sleep(self.ctx.options.tablet_group_watcher_interval.into()) => {}
                }
            }

            let Some(params) = self.management_parameters().await else {
                continue;
            };
            let current_servers = params.online_servers.clone();
            if current_servers.is_empty() {
                tokio::time::sleep(Duration::from_millis(100)).await;
                continue;
            }

            // cleared before the scan so events during it re-trigger
            self.needs_full_scan.store(false, Ordering::SeqCst);

            let tablets: Vec<TabletMetadata> = self
                .ctx
                .metadata
                .read_tablets()
                .for_level(self.level)
                .fetch(ColumnSet::ALL)
                .build()
                .collect();

            match self
                .manage_tablets(tablets, &params, &current_servers, true)
                .await
            {
                Ok(stats) => {
                    trace!(level = %self.level, ?stats, "full scan complete");
                }
                Err(err) => {
                    error!(level = %self.level, "error in full scan: {err:#}");
                    tokio::time::sleep(self.ctx.options.wait_between_errors.into()).await;
                }
            }
        }
    }

    /// The core routine shared by full and partial scans.
    async fn manage_tablets(
        &self,
        tablets: Vec<TabletMetadata>,
        params: &TabletManagementParameters,
        current_servers: &BTreeSet<TServerInstance>,
        is_full_scan: bool,
    ) -> anyhow::Result<ScanStats> {
        let mut stats = ScanStats::default();
        let mut lists = TabletLists::default();
        let mut filtered_shutdown = params.servers_to_shutdown.clone();

        for tm in tablets {
            // tables that vanished from the coordination service are skipped
            if params.table_state(tm.extent().table()) == TableState::Unknown {
                continue;
            }

            // don't overwhelm the tablet servers with buffered work
            if lists.unassigned.len() + stats.unloaded
                > self.ctx.options.max_tserver_work_chunk * current_servers.len()
                || lists.volume_replacements.len() > MAX_VOLUME_REPLACEMENTS_PER_FLUSH
            {
                self.flush_changes(&mut lists, params).await;
                lists.reset();
                stats.unloaded = 0;
            }

            let mut state = TabletState::compute(&tm, current_servers);
            if state == TabletState::AssignedToDeadServer {
                // the full and partial scans race: this scan may have read
                // its server set before a concurrent scan hosted the tablet
                // on a server this scan has not observed yet. Recompute with
                // the freshest set before declaring the server dead.
                let freshest = self.ctx.live_servers.current_servers().await;
                let new_state = TabletState::compute(&tm, &freshest);
                if new_state != state {
                    debug!(extent = %tm.extent(), ?state, ?new_state,
                        "tablet state changed with latest servers");
                    state = new_state;
                }
            }

            // the goal is the single source of truth; nothing below this
            // line may change it
            let goal = TabletGoalState::compute(&tm, state, params);

            if tm.is_future_and_current_set() {
                error!(extent = %tm.extent(),
                    "tablet has both current and future locations, taking no action");
                stats.errors += 1;
                continue;
            }

            if tm.operation_id().is_some() {
                // exclusive operations own the tablet; nothing to do here
                continue;
            }

            if let Some(location) = tm.location() {
                filtered_shutdown.remove(&location.server);
            }

            self.consider_volume_replacement(&tm, state, params, &mut lists, &mut stats);

            if goal == TabletGoalState::Hosted {
                match state {
                    TabletState::AssignedToDeadServer => {
                        lists.assigned_to_dead_servers.push(tm);
                    }
                    TabletState::Suspended => self.host_suspended(&tm, params, &mut lists),
                    TabletState::Unassigned => self.host_unassigned(&tm, &mut lists),
                    TabletState::Assigned => {
                        if let Some(Location {
                            server,
                            kind: LocationKind::Future,
                        }) = tm.location()
                        {
                            // send another reminder
                            lists.assigned.push(Assignment {
                                extent: tm.extent().clone(),
                                server,
                            });
                        }
                    }
                    TabletState::Hosted => {}
                }
            } else {
                match state {
                    TabletState::Suspended => {
                        // move to unassigned so balancing can continue
                        lists.suspended_to_gone_servers.push(tm);
                    }
                    TabletState::AssignedToDeadServer => {
                        lists.assigned_to_dead_servers.push(tm);
                    }
                    TabletState::Hosted => {
                        let location = tm.location().expect("hosted tablet has a location");
                        match self.ctx.connector.connection(&location.server) {
                            Some(connection) => {
                                trace!(extent = %tm.extent(), server = %location.server,
                                    how = %goal.how_unload(), "requesting unload");
                                if let Err(err) = connection
                                    .unload_tablet(
                                        self.ctx.manager_lock.clone(),
                                        tm.extent().clone(),
                                        goal.how_unload(),
                                        params.steady_time,
                                    )
                                    .await
                                {
                                    warn!(server = %location.server,
                                        "could not request unload: {err}");
                                } else {
                                    stats.unloaded += 1;
                                }
                            }
                            None => {
                                warn!(server = %location.server, "could not connect to server");
                            }
                        }
                    }
                    TabletState::Assigned | TabletState::Unassigned => {}
                }
            }
        }

        self.flush_changes(&mut lists, params).await;

        if is_full_scan {
            *self.filtered_servers_to_shutdown.lock() = filtered_shutdown;
        }
        Ok(stats)
    }

    fn host_unassigned(&self, tm: &TabletMetadata, lists: &mut TabletLists) {
        // a pinned migration wins over the balancer while its target lives
        if let Some(dest) = tm.migration() {
            lists.assigned.push(Assignment {
                extent: tm.extent().clone(),
                server: dest.clone(),
            });
            return;
        }
        lists
            .unassigned
            .insert(tm.extent().clone(), tm.last().cloned());
    }

    fn host_suspended(
        &self,
        tm: &TabletMetadata,
        params: &TabletManagementParameters,
        lists: &mut TabletLists,
    ) {
        let Some(suspension) = tm.suspend() else {
            lists
                .unassigned
                .insert(tm.extent().clone(), tm.last().cloned());
            return;
        };
        let waited = params
            .steady_time
            .saturating_elapsed_since(suspension.suspension_time);
        if waited < self.ctx.table_options.suspend_duration() {
            // see if the previous owner came back under a new session
            let returned = params
                .online_servers
                .iter()
                .find(|server| server.host_port() == suspension.server_host_port);
            if let Some(server) = returned {
                lists.assigned.push(Assignment {
                    extent: tm.extent().clone(),
                    server: server.clone(),
                });
            }
            // not back yet: keep waiting, do not reassign
        } else {
            lists
                .unassigned
                .insert(tm.extent().clone(), tm.last().cloned());
        }
    }

    fn consider_volume_replacement(
        &self,
        tm: &TabletMetadata,
        state: TabletState,
        params: &TabletManagementParameters,
        lists: &mut TabletLists,
        stats: &mut ScanStats,
    ) {
        if params.volume_replacements.is_empty() {
            return;
        }
        let replace = |path: &str| -> Option<String> {
            params
                .volume_replacements
                .iter()
                .find(|(old, _)| path.starts_with(old.as_str()))
                .map(|(old, new)| format!("{new}{}", &path[old.len()..]))
        };

        let mut files_to_remove = Vec::new();
        let mut files_to_add = Vec::new();
        for file in tm.files() {
            if let Some(new_path) = replace(&file.path) {
                files_to_remove.push(file.clone());
                files_to_add.push(StoredFile::fenced(new_path, file.fenced.clone()));
            }
        }
        let mut logs_to_remove = Vec::new();
        let mut logs_to_add = Vec::new();
        for wal in tm.logs() {
            if let Some(new_path) = replace(&wal.path) {
                logs_to_remove.push(wal.clone());
                let mut replacement = wal.clone();
                replacement.path = new_path.into();
                logs_to_add.push(replacement);
            }
        }
        if files_to_remove.is_empty() && logs_to_remove.is_empty() {
            return;
        }

        stats.volume_replacements_seen += 1;
        if !matches!(state, TabletState::Unassigned | TabletState::Suspended) {
            debug!(extent = %tm.extent(), ?state,
                "volume replacement needed but tablet state does not allow it yet");
            return;
        }
        if tm.location().is_some() {
            debug!(extent = %tm.extent(), "volume replacement deferred: tablet has a location");
            return;
        }
        if tm.operation_id().is_some() {
            debug!(extent = %tm.extent(), "volume replacement deferred: active operation");
            return;
        }
        lists.volume_replacements.push(VolumeReplacement {
            tm: tm.clone(),
            files_to_remove,
            files_to_add,
            logs_to_remove,
            logs_to_add,
        });
    }

    /// Applies buffered changes. Serialized across the full and partial
    /// scans because the balancer and dead-log handling are not safe for
    /// concurrent callers.
    async fn flush_changes(&self, lists: &mut TabletLists, params: &TabletManagementParameters) {
        let assignments = {
            let _guard = self.flush_lock.lock().await;

            self.handle_dead_tablets(lists, params).await;

            let mut destinations = params.online_servers.clone();
            for server in &params.servers_to_shutdown {
                destinations.remove(server);
            }
            let mut assignments = Vec::new();
            if !destinations.is_empty() && !lists.unassigned.is_empty() {
                let chosen = self.ctx.balancer.get_assignments(
                    &destinations,
                    &BTreeMap::new(),
                    &lists.unassigned,
                );
                for (extent, server) in chosen {
                    if !lists.unassigned.contains_key(&extent) {
                        warn!(%extent, "balancer assigned a tablet that was not nominated");
                        continue;
                    }
                    if !destinations.contains(&server) {
                        warn!(%extent, %server, "balancer chose a server that is not current");
                        continue;
                    }
                    assignments.push(Assignment { extent, server });
                }
                if assignments.is_empty() {
                    warn!("load balancer failed to assign any tablets");
                }
            }
            assignments
        };

        // set future locations; skip the RPC for any that failed
        let mut failed_future: BTreeSet<KeyExtent> = BTreeSet::new();
        if !assignments.is_empty() {
            info!(level = %self.level, count = assignments.len(), "assigning tablets");
            let mut mutator = self.ctx.metadata.conditionally_mutate_tablets();
            for assignment in &assignments {
                let server = assignment.server.clone();
                let accepted_server = server.clone();
                mutator
                    .mutate_tablet(assignment.extent.clone())
                    .require_absent_operation()
                    .require_absent_location()
                    .put_future_location(server)
                    .submit(
                        move |tm| tm.future() == Some(&accepted_server),
                        "set future location",
                    );
            }
            for (extent, result) in mutator.process() {
                if result.status != RowStatus::Accepted {
                    debug!(%extent, status = %result.status, "future location not set");
                    failed_future.insert(extent);
                }
            }
        }

        let mut rpc_targets: Vec<&Assignment> = Vec::new();
        rpc_targets.extend(assignments.iter().filter(|a| !failed_future.contains(&a.extent)));
        rpc_targets.extend(lists.assigned.iter());
        for assignment in rpc_targets {
            match self.ctx.connector.connection(&assignment.server) {
                Some(connection) => {
                    if let Err(err) = connection
                        .assign_tablet(self.ctx.manager_lock.clone(), assignment.extent.clone())
                        .await
                    {
                        warn!(server = %assignment.server, extent = %assignment.extent,
                            "could not send assignment: {err}");
                    }
                }
                None => warn!(server = %assignment.server,
                    extent = %assignment.extent, "could not connect for assignment"),
            }
        }

        self.replace_volumes(&lists.volume_replacements).await;
    }

    async fn handle_dead_tablets(
        &self,
        lists: &mut TabletLists,
        params: &TabletManagementParameters,
    ) {
        if !lists.assigned_to_dead_servers.is_empty() {
            debug!(count = lists.assigned_to_dead_servers.len(), "tablets on dead servers");
            let mut dead_logs: BTreeMap<TServerInstance, Vec<WalRef>> = BTreeMap::new();
            for tm in &lists.assigned_to_dead_servers {
                let Some(location) = tm.location() else { continue };
                if !dead_logs.contains_key(&location.server) {
                    let wals = self
                        .ctx
                        .wal_markers
                        .wals_in_use(&location.server)
                        .await
                        .unwrap_or_default();
                    dead_logs.insert(location.server.clone(), wals);
                }
            }

            let mut mutator = self.ctx.metadata.conditionally_mutate_tablets();
            for tm in &lists.assigned_to_dead_servers {
                let Some(location) = tm.location() else { continue };
                let wals = dead_logs.get(&location.server).cloned().unwrap_or_default();
                let mut tablet_mutator = mutator
                    .mutate_tablet(tm.extent().clone())
                    .require_absent_operation();
                tablet_mutator = match location.kind {
                    LocationKind::Current => tablet_mutator
                        .require_current_location(location.server.clone())
                        .delete_current_location(location.server.clone()),
                    LocationKind::Future => tablet_mutator
                        .require_future_location(location.server.clone())
                        .delete_future_location(location.server.clone()),
                };
                tablet_mutator = tablet_mutator.put_last_location(location.server.clone());
                // the dead server's logs must be replayed wherever this
                // tablet lands next
                for wal in &wals {
                    tablet_mutator = tablet_mutator.put_wal(wal.clone());
                }
                if params.can_suspend_tablets {
                    tablet_mutator = tablet_mutator.put_suspension(Suspension {
                        server_host_port: location.server.host_port().to_string(),
                        suspension_time: params.steady_time,
                    });
                }
                tablet_mutator.submit(|tm| tm.location().is_none(), "dead server location");
            }
            for (extent, result) in mutator.process() {
                if result.status != RowStatus::Accepted {
                    debug!(%extent, status = %result.status,
                        "dead-server cleanup mutation not accepted");
                }
            }

            // all of a dead server's logs move to closed before recovery
            // reads them
            for (server, wals) in &dead_logs {
                for wal in wals {
                    if let Err(err) = self.ctx.wal_markers.close_wal(server, &wal.uuid).await {
                        warn!(%server, %wal, "could not close dead server log: {err}");
                    }
                }
            }

            self.ctx.events.event(
                crate::events::EventScope::Level(self.level),
                format!(
                    "marked {} tablets for reassignment from dead servers",
                    lists.assigned_to_dead_servers.len()
                ),
            );
        }

        if !lists.suspended_to_gone_servers.is_empty() {
            let mut mutator = self.ctx.metadata.conditionally_mutate_tablets();
            for tm in &lists.suspended_to_gone_servers {
                mutator
                    .mutate_tablet(tm.extent().clone())
                    .require_absent_operation()
                    .delete_suspension()
                    .submit(|tm| tm.suspend().is_none(), "unsuspend");
            }
            mutator.process();
        }
    }

    async fn replace_volumes(&self, replacements: &[VolumeReplacement]) {
        if replacements.is_empty() {
            return;
        }
        let mut mutator = self.ctx.metadata.conditionally_mutate_tablets();
        for vr in replacements {
            let mut tablet_mutator = mutator
                .mutate_tablet(vr.tm.extent().clone())
                .require_absent_operation()
                .require_absent_location()
                .require_same(&vr.tm, &[ColumnType::Files, ColumnType::Logs]);
            for file in &vr.files_to_remove {
                tablet_mutator = tablet_mutator.delete_file(file.clone());
            }
            for file in &vr.files_to_add {
                tablet_mutator = tablet_mutator.put_file(file.clone());
            }
            for wal in &vr.logs_to_remove {
                tablet_mutator = tablet_mutator.delete_wal(wal.clone());
            }
            for wal in &vr.logs_to_add {
                tablet_mutator = tablet_mutator.put_wal(wal.clone());
            }
            let removed_files = vr.files_to_remove.clone();
            let removed_logs = vr.logs_to_remove.clone();
            tablet_mutator.submit(
                move |tm| {
                    // verify the old entries are gone. Checking for the new
                    // entries instead would race a compaction that removes a
                    // new file before this check runs; once the old volume
                    // entries are removed nothing ever adds them back.
                    removed_files.iter().all(|f| !tm.files().contains(f))
                        && removed_logs.iter().all(|l| !tm.logs().contains(l))
                },
                "replace volume",
            );
        }
        for (extent, result) in mutator.process() {
            if result.status == RowStatus::Rejected {
                debug!(%extent, "volume replacement rejected, will retry later");
            }
        }
    }

    /// Marks `hosting_requested` on on-demand tablets so the next scan
    /// hosts them. An in-process set keeps concurrent requests for the same
    /// extent from stacking up.
    pub async fn host_ondemand(&self, extents: Vec<KeyExtent>) {
        assert_eq!(self.level, DataLevel::User, "on-demand hosting is user-level");

        let in_progress: Vec<KeyExtent> = {
            let mut guard = self.hosting_request_in_progress.lock();
            extents
                .into_iter()
                .filter(|extent| guard.insert(extent.clone()))
                .collect()
        };
        if in_progress.is_empty() {
            return;
        }

        let mut accepted_ranges = Vec::new();
        {
            let mut mutator = self.ctx.metadata.conditionally_mutate_tablets();
            for extent in &in_progress {
                info!(%extent, "tablet hosting requested");
                mutator
                    .mutate_tablet(extent.clone())
                    .require_absent_operation()
                    .require_availability(TabletAvailability::OnDemand)
                    .require_absent_location()
                    .set_hosting_requested()
                    .submit(|tm| tm.hosting_requested(), "host ondemand");
            }
            for (extent, result) in mutator.process() {
                if result.status == RowStatus::Accepted {
                    accepted_ranges.push(extent);
                } else {
                    trace!(%extent, metadata = ?result.read_metadata(),
                        "hosting request not accepted");
                }
            }
        }

        if !accepted_ranges.is_empty() {
            self.process_ranges(accepted_ranges).await;
        }

        let mut guard = self.hosting_request_in_progress.lock();
        for extent in &in_progress {
            guard.remove(extent);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    use bytes::Bytes;

    use tessera_coordination::lock::ServiceLock;
    use tessera_coordination::memory::{ensure_persistent_path, MemoryCoordination};
    use tessera_coordination::paths;
    use tessera_metadata::MetadataStore;
    use tessera_types::config::{ManagerOptions, TableOptions};
    use tessera_types::rpc::{AdminRpcError, TServerAdminService};
    use tessera_types::{LockId, SteadyTime, TableId, UnloadGoal};

    use crate::balancer::SimpleBalancer;
    use crate::live_servers::ConnectorRegistry;
    use crate::manager::ManagerContext;

    /// Records administrative RPCs instead of acting on them.
    #[derive(Default)]
    struct RecordingServer {
        unloads: AtomicUsize,
        assigns: AtomicUsize,
    }

    #[async_trait::async_trait]
    impl TServerAdminService for RecordingServer {
        async fn assign_tablet(
            &self,
            _lock: LockId,
            _extent: KeyExtent,
        ) -> Result<(), AdminRpcError> {
            self.assigns.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn unload_tablet(
            &self,
            _lock: LockId,
            _extent: KeyExtent,
            _goal: UnloadGoal,
            _time: SteadyTime,
        ) -> Result<(), AdminRpcError> {
            self.unloads.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn flush(
            &self,
            _lock: LockId,
            _table: TableId,
            _start: Option<Bytes>,
            _end: Option<Bytes>,
            _flush_id: u64,
        ) -> Result<(), AdminRpcError> {
            Ok(())
        }

        async fn refresh_tablets(&self, _extents: Vec<KeyExtent>) -> Result<(), AdminRpcError> {
            Ok(())
        }

        async fn drain(&self) -> Result<(), AdminRpcError> {
            Ok(())
        }

        async fn halt(&self, _lock: LockId) -> Result<(), AdminRpcError> {
            Ok(())
        }

        async fn ping(&self) -> Result<(), AdminRpcError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn stale_server_snapshot_does_not_unassign_a_live_host() {
        let coordination = MemoryCoordination::new();
        let manager_client = coordination.client();
        ensure_persistent_path(manager_client.as_ref(), paths::MANAGER_LOCK)
            .await
            .unwrap();
        let manager_lock = ServiceLock::new(manager_client.clone())
            .acquire(paths::MANAGER_LOCK, Bytes::new())
            .await
            .unwrap();

        // TS1 holds a live lock while this scan's snapshot predates it
        let instance = TServerInstance::new("host1:9997", 7);
        let server_client = coordination.client();
        ensure_persistent_path(server_client.as_ref(), &paths::tserver_lock("host1:9997"))
            .await
            .unwrap();
        let _server_lock = ServiceLock::new(server_client.clone())
            .acquire(
                &paths::tserver_lock("host1:9997"),
                Bytes::from(instance.to_string()),
            )
            .await
            .unwrap();

        let metadata = MetadataStore::new();
        let table = TableId::new("1a");
        metadata.bootstrap_table(&table, &[], TabletAvailability::Hosted);
        let extent = KeyExtent::whole_table(table.clone());

        let recording = Arc::new(RecordingServer::default());
        let registry = Arc::new(ConnectorRegistry::default());
        registry.register(instance.clone(), recording.clone());

        // the concurrent partial scan hosted the tablet on TS1
        {
            let mut mutator = metadata.conditionally_mutate_tablets();
            mutator
                .mutate_tablet(extent.clone())
                .require_absent_operation()
                .put_current_location(instance.clone())
                .submit(|_| false, "test host");
            mutator.process();
        }

        let ctx = Arc::new(ManagerContext::new(
            manager_client,
            metadata.clone(),
            registry,
            Arc::new(SimpleBalancer),
            ManagerOptions::default(),
            TableOptions::default(),
            manager_lock.lock_id().clone(),
        ));
        // write the table's coordination nodes so its state reads Online
        tessera_coordination::memory::ensure_persistent_path(
            ctx.client.as_ref(),
            &format!("{}/{table}", paths::TABLES),
        )
        .await
        .unwrap();
        ctx.client
            .create(
                &paths::table_state(&table),
                Bytes::from_static(b"Online"),
                tessera_coordination::client::CreateMode::Persistent,
                tessera_coordination::client::CreatePolicy::Overwrite,
            )
            .await
            .unwrap();

        let watcher = TabletGroupWatcher::start(Arc::clone(&ctx), DataLevel::User, None);

        // this scan read an empty server set before TS1 appeared
        let stale_params = TabletManagementParameters {
            level: DataLevel::User,
            table_states: ctx.table_states().await,
            online_servers: BTreeSet::new(),
            servers_to_shutdown: BTreeSet::new(),
            can_suspend_tablets: false,
            volume_replacements: BTreeMap::new(),
            steady_time: ctx.steady_time(),
        };
        let tablets = vec![metadata.read_tablet(&extent, ColumnSet::ALL).unwrap()];
        watcher
            .manage_tablets(tablets, &stale_params, &BTreeSet::new(), false)
            .await
            .unwrap();

        // the recompute against the fresh server set kept the tablet hosted
        let tm = metadata.read_tablet(&extent, ColumnSet::ALL).unwrap();
        assert_eq!(tm.current(), Some(&instance));
        assert_eq!(recording.unloads.load(Ordering::SeqCst), 0);

        // once the server really dies, the same path unassigns it
        coordination.expire_session(server_client.session_id());
        let tablets = vec![metadata.read_tablet(&extent, ColumnSet::ALL).unwrap()];
        watcher
            .manage_tablets(tablets, &stale_params, &BTreeSet::new(), false)
            .await
            .unwrap();
        let tm = metadata.read_tablet(&extent, ColumnSet::ALL).unwrap();
        assert!(tm.current().is_none());
        assert_eq!(tm.last(), Some(&instance));

        watcher.stop();
    }
}
