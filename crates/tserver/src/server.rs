// Copyright (c) 2023 - 2025 Tessera Contributors.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! The tablet server process: hosts tablets, serves the ingest surface
//! (including the conditional-update pipeline) and the manager-facing
//! administrative surface.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::RwLock;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};
use uuid::Uuid;

use tessera_coordination::client::SharedClient;
use tessera_coordination::lock::{is_lock_held, ServiceLock, ServiceLockHandle};
use tessera_coordination::memory::ensure_persistent_path;
use tessera_coordination::paths;
use tessera_coordination::wal_marker::WalStateManager;
use tessera_metadata::mutator::ConditionalStatus as RowStatus;
use tessera_metadata::{Ample, MetadataStore};
use tessera_types::config::{TableOptions, WalOptions};
use tessera_types::rpc::{
    AdminRpcError, CmResult, ConditionalSessionInfo, IngestError, ServerConditionalMutation,
    TabletIngestService, TServerAdminService,
};
use tessera_types::visibility::VisibilityEvaluator;
use tessera_types::{
    ColumnSet, ColumnType, ConditionalStatus, Durability, KeyExtent, LockId, Mutation,
    StoredFile, Suspension, SteadyTime, TServerInstance, TableId, UnloadGoal, WalRef,
};
use tessera_wal::{Dfs, LogParticipant, TabletServerLogger};

use crate::constraints::{Constraint, ConstraintEnv, VisibilityConstraint};
use crate::row_locks::RowLocks;
use crate::session::{ConditionalSession, SessionManager};
use crate::tablet::{CommitSession, Tablet, WalPublisher};

const CONDITIONAL_PERMITS_PER_TABLE: usize = 4;
const SESSION_MAX_IDLE: Duration = Duration::from_secs(60);

struct MetadataWalPublisher {
    metadata: MetadataStore,
    instance: TServerInstance,
}

#[async_trait::async_trait]
impl WalPublisher for MetadataWalPublisher {
    async fn publish(&self, extent: &KeyExtent, wal: &WalRef) -> anyhow::Result<()> {
        let mut mutator = self.metadata.conditionally_mutate_tablets();
        let wanted = wal.clone();
        mutator
            .mutate_tablet(extent.clone())
            .require_absent_operation()
            .require_current_location(self.instance.clone())
            .put_wal(wal.clone())
            .submit(
                move |tm| tm.logs().contains(&wanted),
                "publish log association",
            );
        let results = mutator.process();
        match results.values().next().map(|r| r.status) {
            Some(RowStatus::Accepted) => Ok(()),
            other => anyhow::bail!("could not record log for {extent}: {other:?}"),
        }
    }
}

/// One tablet server process.
pub struct TabletServer {
    instance: TServerInstance,
    client: SharedClient,
    metadata: MetadataStore,
    logger: Arc<TabletServerLogger>,
    lock: Arc<ServiceLockHandle>,
    sessions: SessionManager,
    row_locks: RowLocks,
    tablets: RwLock<HashMap<KeyExtent, Arc<Tablet>>>,
    table_permits: parking_lot::Mutex<HashMap<TableId, Arc<Semaphore>>>,
    constraints: Vec<Arc<dyn Constraint>>,
    table_options: TableOptions,
    next_tablet_log_id: AtomicU64,
    draining: AtomicBool,
    /// Test hook: simulate the process dying after WAL durability but
    /// before commit visibility.
    crash_after_wal: AtomicBool,
    crashed: AtomicBool,
}

impl TabletServer {
    /// Starts a tablet server: acquires its service lock and opens its log
    /// stream.
    pub async fn start(
        instance: TServerInstance,
        client: SharedClient,
        metadata: MetadataStore,
        dfs: Arc<dyn Dfs>,
        wal_options: WalOptions,
        table_options: TableOptions,
    ) -> anyhow::Result<Arc<TabletServer>> {
        let lock_path = paths::tserver_lock(instance.host_port());
        ensure_persistent_path(client.as_ref(), &lock_path).await?;
        let lock = Arc::new(
            ServiceLock::new(Arc::clone(&client))
                .acquire(&lock_path, Bytes::from(instance.to_string()))
                .await?,
        );
        info!(instance = %instance, "tablet server lock acquired");

        let markers = Arc::new(WalStateManager::new(Arc::clone(&client)));
        let logger = TabletServerLogger::new(
            dfs,
            instance.clone(),
            wal_options,
            markers,
            Some(Arc::clone(&lock)),
            None,
        );

        Ok(Arc::new(TabletServer {
            instance,
            client,
            metadata,
            logger,
            lock,
            sessions: SessionManager::new(SESSION_MAX_IDLE),
            row_locks: RowLocks::default(),
            tablets: RwLock::new(HashMap::new()),
            table_permits: parking_lot::Mutex::new(HashMap::new()),
            constraints: vec![Arc::new(VisibilityConstraint)],
            table_options,
            next_tablet_log_id: AtomicU64::new(1),
            draining: AtomicBool::new(false),
            crash_after_wal: AtomicBool::new(false),
            crashed: AtomicBool::new(false),
        }))
    }

    pub fn instance(&self) -> &TServerInstance {
        &self.instance
    }

    pub fn lock_id(&self) -> &LockId {
        self.lock.lock_id()
    }

    pub fn logger(&self) -> &Arc<TabletServerLogger> {
        &self.logger
    }

    /// Arms the crash-between-log-and-commit test hook.
    pub fn arm_crash_after_wal(&self) {
        self.crash_after_wal.store(true, Ordering::SeqCst);
    }

    pub fn online_tablet(&self, extent: &KeyExtent) -> Option<Arc<Tablet>> {
        self.tablets.read().get(extent).cloned()
    }

    fn check_alive(&self) -> Result<(), IngestError> {
        if self.crashed.load(Ordering::SeqCst) {
            return Err(IngestError::Connection("server is down".to_string()));
        }
        Ok(())
    }

    fn table_permit(&self, table: &TableId) -> Arc<Semaphore> {
        Arc::clone(
            self.table_permits
                .lock()
                .entry(table.clone())
                .or_insert_with(|| Arc::new(Semaphore::new(CONDITIONAL_PERMITS_PER_TABLE))),
        )
    }

    fn new_file_for(&self, table: &TableId) -> StoredFile {
        StoredFile::new(format!("/tables/{table}/F-{}.rf", Uuid::new_v4()))
    }

    /// Loads a tablet this server has a future location for, recovering
    /// from its write-ahead logs first when any are referenced.
    pub async fn load_tablet(&self, extent: &KeyExtent) -> Result<(), AdminRpcError> {
        let tm = self
            .metadata
            .read_tablet(extent, ColumnSet::ALL)
            .ok_or_else(|| AdminRpcError::NoSuchTablet(extent.clone()))?;

        if tm.future() != Some(&self.instance) {
            // the manager moved on; loading now would create a second owner
            warn!(%extent, "asked to load tablet without a future location here");
            return Err(AdminRpcError::NoSuchTablet(extent.clone()));
        }

        let tablet = Tablet::new(
            extent.clone(),
            self.next_tablet_log_id.fetch_add(1, Ordering::Relaxed),
            *tm.time(),
            self.table_options.durability,
            tm.files().iter().cloned().collect(),
            Arc::new(MetadataWalPublisher {
                metadata: self.metadata.clone(),
                instance: self.instance.clone(),
            }),
        );

        if !tm.logs().is_empty() {
            let logs: Vec<WalRef> = tm.logs().to_vec();
            let files: Vec<String> =
                tm.files().iter().map(|f| f.path.to_string()).collect();
            let mut recovered: Vec<Mutation> = Vec::new();
            let mut sink = |m: Mutation| recovered.push(m);
            self.logger
                .recover(extent, &logs, &files, &mut sink)
                .await
                .map_err(|err| AdminRpcError::Server(err.to_string()))?;
            if !recovered.is_empty() {
                info!(%extent, mutations = recovered.len(), "recovered mutations from logs");
                let prepared = tablet.prepare_mutations_for_commit(
                    &ConstraintEnv::new(Vec::new()),
                    recovered,
                    &[],
                );
                if let Some(session) = prepared.commit_session {
                    session.commit(&prepared.non_violators);
                }
            }
        }

        let mut mutator = self.metadata.conditionally_mutate_tablets();
        let me = self.instance.clone();
        let accepted_me = me.clone();
        mutator
            .mutate_tablet(extent.clone())
            .require_absent_operation()
            .require_future_location(me.clone())
            .delete_future_location(me.clone())
            .put_current_location(me.clone())
            .put_last_location(me.clone())
            .delete_suspension()
            .submit(
                move |tm| tm.current() == Some(&accepted_me),
                "tablet loaded",
            );
        let results = mutator.process();
        if results.values().next().map(|r| r.status) != Some(RowStatus::Accepted) {
            return Err(AdminRpcError::Server(format!(
                "could not take current location for {extent}"
            )));
        }

        self.tablets.write().insert(extent.clone(), tablet);
        info!(%extent, "tablet loaded");
        Ok(())
    }

    async fn unload(&self, extent: &KeyExtent, goal: UnloadGoal, request_time: SteadyTime) {
        let Some(tablet) = self.tablets.write().remove(extent) else {
            return;
        };
        tablet.close();

        // flush memory so the logs are no longer needed for this tablet
        let mut flushed_file = None;
        if tablet
            .minor_compact_into(&self.new_file_for(extent.table()), tablet.flush_id())
        {
            flushed_file = tablet.files().last().cloned();
            let session = CommitSession::for_seq(Arc::clone(&tablet), tablet.next_wal_seq());
            if let Some(file) = &flushed_file {
                let seq = session.wal_seq();
                if let Err(err) = self
                    .logger
                    .minor_compaction_started(session.as_ref(), seq, &file.path, Durability::Sync)
                    .await
                {
                    warn!(%extent, "could not log unload compaction start: {err}");
                }
                if let Err(err) = self
                    .logger
                    .minor_compaction_finished(session.as_ref(), seq, Durability::Sync)
                    .await
                {
                    warn!(%extent, "could not log unload compaction finish: {err}");
                }
            }
        }

        let tm = self.metadata.read_tablet(extent, ColumnSet::ALL);
        let mut mutator = self.metadata.conditionally_mutate_tablets();
        let me = self.instance.clone();
        let mut tablet_mutator = mutator
            .mutate_tablet(extent.clone())
            .require_absent_operation()
            .require_current_location(me.clone())
            .delete_current_location(me.clone())
            .put_last_location(me.clone());
        if let Some(file) = flushed_file {
            tablet_mutator = tablet_mutator.put_file(file);
        }
        if let Some(tm) = &tm {
            for wal in tm.logs() {
                tablet_mutator = tablet_mutator.delete_wal(wal.clone());
            }
        }
        if goal == UnloadGoal::Suspended {
            tablet_mutator = tablet_mutator.put_suspension(Suspension {
                server_host_port: self.instance.host_port().to_string(),
                suspension_time: request_time,
            });
        }
        tablet_mutator.submit(|tm| tm.current().is_none(), "tablet unloaded");
        for (_, result) in mutator.process() {
            if result.status != RowStatus::Accepted {
                warn!(%extent, status = %result.status, "unload metadata update not accepted");
            }
        }
        info!(%extent, %goal, "tablet unloaded");
    }

    // ---- conditional update pipeline ----

    fn evaluator_for(auths: &[Bytes]) -> VisibilityEvaluator {
        VisibilityEvaluator::new(auths.iter().map(|a| a.to_vec()))
    }

    fn conditions_hold(
        tablet: &Tablet,
        scm: &ServerConditionalMutation,
        evaluator: &VisibilityEvaluator,
    ) -> bool {
        scm.mutation.conditions.iter().all(|cond| {
            let found = tablet.lookup(
                scm.mutation.row(),
                &cond.family,
                &cond.qualifier,
                &cond.visibility,
                cond.timestamp,
                evaluator,
            );
            match &cond.value {
                Some(expected) => found.as_ref() == Some(expected),
                None => found.is_none(),
            }
        })
    }

    /// One round of the conditional pipeline: sort, defer duplicate rows,
    /// lock rows without blocking, check conditions under the locks, then
    /// log and commit the survivors, still under the locks. Returns the
    /// deferred mutations for the next round.
    async fn conditional_update_round(
        &self,
        cs: &ConditionalSession,
        mut updates: BTreeMap<KeyExtent, Vec<ServerConditionalMutation>>,
        results: &mut Vec<CmResult>,
    ) -> Result<BTreeMap<KeyExtent, Vec<ServerConditionalMutation>>, IngestError> {
        let mut deferred: BTreeMap<KeyExtent, Vec<ServerConditionalMutation>> = BTreeMap::new();

        // one mutation per row per round, so a writer only observes the
        // effects of earlier rounds
        for (extent, mutations) in updates.iter_mut() {
            mutations.sort_by(|a, b| a.mutation.row().cmp(b.mutation.row()));
            let mut seen_rows: BTreeSet<Bytes> = BTreeSet::new();
            let mut keep = Vec::with_capacity(mutations.len());
            for scm in mutations.drain(..) {
                if seen_rows.insert(scm.mutation.row().clone()) {
                    keep.push(scm);
                } else {
                    deferred.entry(extent.clone()).or_default().push(scm);
                }
            }
            *mutations = keep;
        }

        let all_rows: BTreeSet<Bytes> = updates
            .values()
            .flatten()
            .map(|scm| scm.mutation.row().clone())
            .collect();
        let (locks, contended) = self.row_locks.try_acquire(all_rows);
        let contended: BTreeSet<Bytes> = contended.into_iter().collect();
        if !contended.is_empty() {
            for (extent, mutations) in updates.iter_mut() {
                let (defer, keep): (Vec<_>, Vec<_>) = mutations
                    .drain(..)
                    .partition(|scm| contended.contains(scm.mutation.row()));
                *mutations = keep;
                deferred.entry(extent.clone()).or_default().extend(defer);
            }
        }

        let evaluator = Self::evaluator_for(&cs.auths);
        let mut to_write: BTreeMap<KeyExtent, Vec<ServerConditionalMutation>> = BTreeMap::new();
        for (extent, mutations) in updates {
            if mutations.is_empty() {
                continue;
            }
            let tablet = self.online_tablet(&extent);
            let interrupted = cs.interrupt.load(Ordering::SeqCst);
            match tablet {
                None => {
                    results.extend(mutations.iter().map(|scm| CmResult {
                        cmid: scm.cmid,
                        status: ConditionalStatus::Ignored,
                    }));
                }
                Some(tablet) if tablet.is_closed() || interrupted => {
                    results.extend(mutations.iter().map(|scm| CmResult {
                        cmid: scm.cmid,
                        status: ConditionalStatus::Ignored,
                    }));
                }
                Some(tablet)
                    if tablet.files().len() > self.table_options.scan_max_open_files =>
                {
                    // evaluating conditions would open more files than the
                    // per-scan budget allows; the client re-locates the
                    // tablet and retries for as long as it takes
                    results.extend(mutations.iter().map(|scm| CmResult {
                        cmid: scm.cmid,
                        status: ConditionalStatus::Ignored,
                    }));
                }
                Some(tablet) => {
                    let mut ok = Vec::with_capacity(mutations.len());
                    for scm in mutations {
                        if Self::conditions_hold(&tablet, &scm, &evaluator) {
                            ok.push(scm);
                        } else {
                            results.push(CmResult {
                                cmid: scm.cmid,
                                status: ConditionalStatus::Rejected,
                            });
                        }
                    }
                    if !ok.is_empty() {
                        to_write.insert(extent, ok);
                    }
                }
            }
        }

        self.write_conditional_mutations(cs, to_write, results).await?;
        drop(locks);
        self.row_locks.prune();
        Ok(deferred)
    }

    async fn write_conditional_mutations(
        &self,
        cs: &ConditionalSession,
        to_write: BTreeMap<KeyExtent, Vec<ServerConditionalMutation>>,
        results: &mut Vec<CmResult>,
    ) -> Result<(), IngestError> {
        let env = ConstraintEnv::new(cs.auths.clone());
        let mut loggables: Vec<(Arc<CommitSession>, Vec<Mutation>, Durability)> = Vec::new();
        let mut sendables: Vec<(Arc<CommitSession>, Vec<Mutation>)> = Vec::new();

        for (extent, mutations) in to_write {
            let Some(tablet) = self.online_tablet(&extent) else {
                results.extend(mutations.iter().map(|scm| CmResult {
                    cmid: scm.cmid,
                    status: ConditionalStatus::Ignored,
                }));
                continue;
            };

            let by_cmid: Vec<(u64, Mutation)> = mutations
                .into_iter()
                .map(|scm| (scm.cmid, scm.mutation.mutation))
                .collect();
            let prepared = tablet.prepare_mutations_for_commit(
                &env,
                by_cmid.iter().map(|(_, m)| m.clone()).collect(),
                &self.constraints,
            );

            if prepared.tablet_closed {
                results.extend(by_cmid.iter().map(|(cmid, _)| CmResult {
                    cmid: *cmid,
                    status: ConditionalStatus::Ignored,
                }));
                continue;
            }

            for (cmid, mutation) in &by_cmid {
                let status = if prepared.violators.iter().any(|(m, _)| m == mutation) {
                    ConditionalStatus::Violated
                } else {
                    ConditionalStatus::Accepted
                };
                results.push(CmResult {
                    cmid: *cmid,
                    status,
                });
            }

            if let Some(session) = prepared.commit_session {
                let durability =
                    Durability::resolve(cs.durability, tablet.default_durability());
                if durability != Durability::None {
                    loggables.push((
                        Arc::clone(&session),
                        prepared.non_violators.clone(),
                        durability,
                    ));
                }
                sendables.push((session, prepared.non_violators));
            }
        }

        if !loggables.is_empty() {
            let batches: Vec<(&dyn LogParticipant, u64, Vec<Mutation>, Durability)> = loggables
                .iter()
                .map(|(session, mutations, durability)| {
                    (
                        session.as_ref() as &dyn LogParticipant,
                        session.wal_seq(),
                        mutations.clone(),
                        *durability,
                    )
                })
                .collect();
            self.logger
                .log_many(&batches)
                .await
                .map_err(|err| IngestError::Server(err.to_string()))?;
        }

        if self.crash_after_wal.swap(false, Ordering::SeqCst) {
            // the moment under test: durability established, commit not yet
            // visible, process gone
            self.crashed.store(true, Ordering::SeqCst);
            for (_, tablet) in self.tablets.write().drain() {
                tablet.close();
            }
            return Err(IngestError::Connection(
                "server crashed after log write".to_string(),
            ));
        }

        for (session, mutations) in sendables {
            session.commit(&mutations);
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl TabletIngestService for TabletServer {
    async fn start_conditional_update(
        &self,
        table: TableId,
        auths: Vec<Bytes>,
        durability: Durability,
    ) -> Result<ConditionalSessionInfo, IngestError> {
        self.check_alive()?;
        let session_id = self.sessions.create(ConditionalSession {
            table,
            auths,
            durability,
            interrupt: AtomicBool::new(false),
        });
        Ok(ConditionalSessionInfo {
            session_id,
            lock_id: self.lock.lock_id().clone(),
            ttl_millis: self.sessions.max_idle_millis(),
        })
    }

    async fn conditional_update(
        &self,
        session_id: u64,
        updates: BTreeMap<KeyExtent, Vec<ServerConditionalMutation>>,
        _symbols: Vec<String>,
    ) -> Result<Vec<CmResult>, IngestError> {
        self.check_alive()?;
        let cs = self
            .sessions
            .try_reserve(session_id)
            .ok_or(IngestError::NoSuchSession)?;
        if cs.interrupt.load(Ordering::SeqCst) {
            self.sessions.unreserve(session_id);
            return Err(IngestError::NoSuchSession);
        }

        for extent in updates.keys() {
            if extent.table() != &cs.table {
                self.sessions.unreserve(session_id);
                return Err(IngestError::WrongTable(extent.table().clone()));
            }
        }

        // conditional updates read, evaluate and write; the per-table
        // permit bounds their cpu and memory use
        let permit_holder = self.table_permit(&cs.table);
        let _permit = permit_holder
            .acquire()
            .await
            .map_err(|_| IngestError::Server("server shutting down".to_string()))?;

        let mut results = Vec::new();
        let mut remaining = updates;
        loop {
            match self.conditional_update_round(&cs, remaining, &mut results).await {
                Ok(deferred) if deferred.is_empty() => break,
                Ok(deferred) => remaining = deferred,
                Err(err) => {
                    if !self.crashed.load(Ordering::SeqCst) {
                        self.sessions.unreserve(session_id);
                    }
                    return Err(err);
                }
            }
        }

        self.sessions.unreserve(session_id);
        Ok(results)
    }

    async fn invalidate_conditional_update(
        &self,
        session_id: u64,
    ) -> Result<(), IngestError> {
        self.check_alive()?;
        // setting the flag fails anything running and blocks anything new
        if let Some(cs) = self.sessions.get(session_id) {
            cs.interrupt.store(true, Ordering::SeqCst);
        }
        // wait out a running update, then drop the session for good
        if self.sessions.reserve_wait(session_id).await.is_some() {
            self.sessions.remove(session_id);
        }
        Ok(())
    }

    async fn close_conditional_update(&self, session_id: u64) -> Result<(), IngestError> {
        self.sessions.remove(session_id);
        Ok(())
    }

    async fn apply_mutations(
        &self,
        extent: KeyExtent,
        mutations: Vec<Mutation>,
        durability: Durability,
    ) -> Result<(), IngestError> {
        self.check_alive()?;
        let tablet = self
            .online_tablet(&extent)
            .ok_or_else(|| IngestError::Server(format!("tablet {extent} is not hosted")))?;

        let prepared = tablet.prepare_mutations_for_commit(
            &ConstraintEnv::new(Vec::new()),
            mutations,
            &self.constraints,
        );
        if prepared.tablet_closed {
            return Err(IngestError::Server(format!("tablet {extent} is closed")));
        }
        if !prepared.violators.is_empty() {
            return Err(IngestError::Server(format!(
                "constraint violation: {}",
                prepared.violators[0].1[0].description
            )));
        }
        let Some(session) = prepared.commit_session else {
            return Ok(());
        };

        let resolved = Durability::resolve(durability, tablet.default_durability());
        if resolved != Durability::None {
            self.logger
                .log(
                    session.as_ref(),
                    session.wal_seq(),
                    prepared.non_violators.clone(),
                    resolved,
                )
                .await
                .map_err(|err| IngestError::Server(err.to_string()))?;
        }
        session.commit(&prepared.non_violators);
        Ok(())
    }
}

#[async_trait::async_trait]
impl TServerAdminService for TabletServer {
    async fn assign_tablet(
        &self,
        manager_lock: LockId,
        extent: KeyExtent,
    ) -> Result<(), AdminRpcError> {
        if self.crashed.load(Ordering::SeqCst) {
            return Err(AdminRpcError::Connection("server is down".to_string()));
        }
        if !is_lock_held(self.client.as_ref(), &manager_lock)
            .await
            .unwrap_or(false)
        {
            return Err(AdminRpcError::BadManagerLock);
        }
        if self.draining.load(Ordering::SeqCst) {
            return Err(AdminRpcError::Server("server is draining".to_string()));
        }
        self.load_tablet(&extent).await
    }

    async fn unload_tablet(
        &self,
        manager_lock: LockId,
        extent: KeyExtent,
        goal: UnloadGoal,
        request_time: SteadyTime,
    ) -> Result<(), AdminRpcError> {
        if self.crashed.load(Ordering::SeqCst) {
            return Err(AdminRpcError::Connection("server is down".to_string()));
        }
        if !is_lock_held(self.client.as_ref(), &manager_lock)
            .await
            .unwrap_or(false)
        {
            return Err(AdminRpcError::BadManagerLock);
        }
        self.unload(&extent, goal, request_time).await;
        Ok(())
    }

    async fn flush(
        &self,
        manager_lock: LockId,
        table: TableId,
        start_row: Option<Bytes>,
        end_row: Option<Bytes>,
        flush_id: u64,
    ) -> Result<(), AdminRpcError> {
        if self.crashed.load(Ordering::SeqCst) {
            return Err(AdminRpcError::Connection("server is down".to_string()));
        }
        if !is_lock_held(self.client.as_ref(), &manager_lock)
            .await
            .unwrap_or(false)
        {
            return Err(AdminRpcError::BadManagerLock);
        }

        let targets: Vec<Arc<Tablet>> = self
            .tablets
            .read()
            .values()
            .filter(|tablet| {
                tablet.extent().table() == &table
                    && tablet
                        .extent()
                        .overlaps(start_row.as_deref(), end_row.as_deref())
                    && tablet.flush_id() < flush_id
            })
            .cloned()
            .collect();

        for tablet in targets {
            let extent = tablet.extent().clone();
            let file = self.new_file_for(&table);
            let seq = tablet.next_wal_seq();
            let session = CommitSession::for_seq(Arc::clone(&tablet), seq);

            self.logger
                .minor_compaction_started(session.as_ref(), seq, &file.path, Durability::Sync)
                .await
                .map_err(|err| AdminRpcError::Server(err.to_string()))?;
            let wrote_file = tablet.minor_compact_into(&file, flush_id);
            self.logger
                .minor_compaction_finished(session.as_ref(), seq, Durability::Sync)
                .await
                .map_err(|err| AdminRpcError::Server(err.to_string()))?;

            let tm = self.metadata.read_tablet(&extent, ColumnSet::ALL);
            let mut mutator = self.metadata.conditionally_mutate_tablets();
            let mut tablet_mutator = mutator
                .mutate_tablet(extent.clone())
                .require_absent_operation()
                .require_current_location(self.instance.clone())
                .put_flush_id(flush_id);
            if wrote_file {
                tablet_mutator = tablet_mutator.put_file(file);
            }
            if let Some(tm) = &tm {
                // flushed memory means these logs are no longer needed here
                for wal in tm.logs() {
                    tablet_mutator = tablet_mutator.delete_wal(wal.clone());
                }
            }
            tablet_mutator.submit(
                move |tm| tm.flush_id() == Some(flush_id),
                "tablet flushed",
            );
            for (_, result) in mutator.process() {
                if result.status != RowStatus::Accepted {
                    debug!(%extent, status = %result.status, "flush metadata update not accepted");
                }
            }
        }
        Ok(())
    }

    async fn refresh_tablets(&self, extents: Vec<KeyExtent>) -> Result<(), AdminRpcError> {
        for extent in extents {
            let Some(tablet) = self.online_tablet(&extent) else {
                continue;
            };
            if let Some(tm) = self
                .metadata
                .read_tablet(&extent, ColumnSet::of(&[ColumnType::Files]))
            {
                tablet.set_files(tm.files().iter().cloned().collect());
                debug!(%extent, "tablet refreshed");
            }
        }
        Ok(())
    }

    async fn drain(&self) -> Result<(), AdminRpcError> {
        self.draining.store(true, Ordering::SeqCst);
        info!(instance = %self.instance, "draining");
        Ok(())
    }

    async fn halt(&self, manager_lock: LockId) -> Result<(), AdminRpcError> {
        if !is_lock_held(self.client.as_ref(), &manager_lock)
            .await
            .unwrap_or(false)
        {
            return Err(AdminRpcError::BadManagerLock);
        }
        info!(instance = %self.instance, "halting on manager request");
        self.crashed.store(true, Ordering::SeqCst);
        for (_, tablet) in self.tablets.write().drain() {
            tablet.close();
        }
        self.logger.shutdown().await;
        self.lock
            .release_in_place()
            .await
            .map_err(|err| AdminRpcError::Server(err.to_string()))?;
        Ok(())
    }

    async fn ping(&self) -> Result<(), AdminRpcError> {
        if self.crashed.load(Ordering::SeqCst) {
            return Err(AdminRpcError::Connection("server is down".to_string()));
        }
        Ok(())
    }
}
