// Copyright (c) 2023 - 2025 Tessera Contributors.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! The tablet server's central logging facility: one shared current log,
//! a pre-created next log, rotation on size or age, bounded write retries
//! and a self-halt when retries are exhausted without the service lock.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{mpsc, RwLock};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use tessera_coordination::lock::ServiceLockHandle;
use tessera_coordination::wal_marker::WalStateManager;
use tessera_types::config::WalOptions;
use tessera_types::{Durability, KeyExtent, Mutation, TServerInstance, WalRef};

use crate::dfs::Dfs;
use crate::dfs_logger::DfsLogger;
use crate::format::LogEvent;
use crate::recovery::{MutationSink, ResolvedSortedLog, SortedLogRecovery};
use crate::{Result, WalError};

const RESOLVE_CACHE_TTL: Duration = Duration::from_secs(3);

/// A tablet-side party to the log: typically a commit session. The logger
/// writes a tablet-definition record (and publishes the log-to-tablet
/// association) once per participant per log generation.
#[async_trait::async_trait]
pub trait LogParticipant: Send + Sync {
    fn extent(&self) -> &KeyExtent;

    /// Stable id used to tag this tablet's records within logs.
    fn tablet_log_id(&self) -> u64;

    /// True if this participant still needs its definition record in log
    /// generation `log_seq`. Claims the slot; the caller reports back
    /// through [`LogParticipant::finish_defining`].
    fn begin_defining(&self, log_seq: u32) -> bool;

    /// Reports whether the definition for the claimed generation landed.
    fn finish_defining(&self, log_seq: u32, defined: bool);

    /// Publishes the log-to-tablet association in tablet metadata, so recovery
    /// knows this log may hold the tablet's mutations.
    async fn publish_log_association(&self, wal: &WalRef) -> anyhow::Result<()>;
}

type Halt = Arc<dyn Fn(&str) + Send + Sync>;

struct CurrentLog {
    log: Option<Arc<DfsLogger>>,
    create_time: Instant,
}

/// Central logging facility for one tablet server. Writer tasks share the
/// current log under the read side of a lock; swapping logs takes the write
/// side.
pub struct TabletServerLogger {
    dfs: Arc<dyn Dfs>,
    server: TServerInstance,
    options: WalOptions,
    markers: Arc<WalStateManager>,
    lock: Option<Arc<ServiceLockHandle>>,
    halt: Halt,
    state: RwLock<CurrentLog>,
    /// Generation counter: bumped whenever a fresh log becomes current, so
    /// writers can detect the log changing under them.
    log_seq: AtomicU32,
    next_log: tokio::sync::Mutex<mpsc::Receiver<Result<Arc<DfsLogger>, String>>>,
    maker_task: Mutex<Option<tokio::task::JoinHandle<()>>>,
    resolve_cache: Mutex<HashMap<WalRef, (Instant, Arc<ResolvedSortedLog>)>>,
}

impl TabletServerLogger {
    pub fn new(
        dfs: Arc<dyn Dfs>,
        server: TServerInstance,
        options: WalOptions,
        markers: Arc<WalStateManager>,
        lock: Option<Arc<ServiceLockHandle>>,
        halt: Option<Halt>,
    ) -> Arc<Self> {
        let (tx, rx) = mpsc::channel(1);
        let logger = Arc::new(TabletServerLogger {
            dfs: Arc::clone(&dfs),
            server: server.clone(),
            options,
            markers: Arc::clone(&markers),
            lock,
            halt: halt.unwrap_or_else(|| Arc::new(|msg| panic!("{msg}"))),
            state: RwLock::new(CurrentLog {
                log: None,
                create_time: Instant::now(),
            }),
            log_seq: AtomicU32::new(0),
            next_log: tokio::sync::Mutex::new(rx),
            maker_task: Mutex::new(None),
            resolve_cache: Mutex::new(HashMap::new()),
        });
        let task = tokio::spawn(Self::run_next_log_maker(dfs, server, markers, tx));
        *logger.maker_task.lock() = Some(task);
        logger
    }

    /// Continuously prepares the next log: create the file, advertise the
    /// marker, then park it in the single-slot handoff until a rotation
    /// consumes it.
    async fn run_next_log_maker(
        dfs: Arc<dyn Dfs>,
        server: TServerInstance,
        markers: Arc<WalStateManager>,
        tx: mpsc::Sender<Result<Arc<DfsLogger>, String>>,
    ) {
        loop {
            debug!("creating next write-ahead log");
            let log = match DfsLogger::create(Arc::clone(&dfs), &server).await {
                Ok(log) => log,
                Err(err) => {
                    error!("failed to create next log: {err}");
                    if tx.send(Err(err.to_string())).await.is_err() {
                        return;
                    }
                    continue;
                }
            };

            if let Err(err) = markers.add_new_marker(&server, log.wal_ref()).await {
                error!(wal = %log.wal_ref(), "failed to advertise log marker: {err}");
                log.close().await;
                // the marker may have been created despite the error; mark it
                // closed so it gets reaped either way
                if let Err(close_err) = markers.close_wal(&server, &log.wal_ref().uuid).await {
                    warn!(wal = %log.wal_ref(), "failed to close unadvertised log: {close_err}");
                }
                if tx.send(Err(err.to_string())).await.is_err() {
                    return;
                }
                continue;
            }

            debug!(wal = %log.wal_ref(), "next log ready");
            if tx.send(Ok(log)).await.is_err() {
                return;
            }
        }
    }

    /// The current log and its generation, creating one from the handoff if
    /// none is open. Halts the process when log creation keeps failing.
    async fn current_log(&self) -> Result<(Arc<DfsLogger>, u32)> {
        {
            let state = self.state.read().await;
            if let Some(log) = &state.log {
                return Ok((Arc::clone(log), self.log_seq.load(Ordering::Acquire)));
            }
        }

        let mut state = self.state.write().await;
        if state.log.is_none() {
            let mut create_retry = self.options.create_retry.iter();
            loop {
                let next = self.next_log.lock().await.recv().await;
                match next {
                    None => return Err(WalError::WriterGone),
                    Some(Ok(log)) => {
                        info!(wal = %log.wal_ref(), "using next log");
                        state.log = Some(log);
                        state.create_time = Instant::now();
                        self.log_seq.fetch_add(1, Ordering::AcqRel);
                        break;
                    }
                    Some(Err(reason)) => match create_retry.next() {
                        Some(pause) => {
                            warn!("log creation failed ({reason}), backing off");
                            tokio::time::sleep(pause).await;
                        }
                        None => {
                            (self.halt)("too many errors creating write-ahead logs, giving up");
                            return Err(WalError::WriterGone);
                        }
                    },
                }
            }
        }
        let log = state.log.as_ref().expect("set above");
        Ok((Arc::clone(log), self.log_seq.load(Ordering::Acquire)))
    }

    /// Closes the current log if it is still generation `seen_seq`. Used by
    /// failing writers; only the first one actually closes.
    async fn close_current_if(&self, seen_seq: u32) {
        if self.log_seq.load(Ordering::Acquire) != seen_seq {
            return;
        }
        let mut state = self.state.write().await;
        if self.log_seq.load(Ordering::Acquire) != seen_seq {
            return;
        }
        self.close_locked(&mut state).await;
    }

    async fn close_locked(&self, state: &mut CurrentLog) {
        if let Some(log) = state.log.take() {
            log.close().await;
            if let Err(err) = self.markers.close_wal(&self.server, &log.wal_ref().uuid).await {
                warn!(wal = %log.wal_ref(), "failed to mark log closed: {err}");
            }
            info!(wal = %log.wal_ref(), "closed log");
        }
    }

    /// Rotates when the current log is too big or too old.
    async fn rotate_if_needed(&self) {
        let needs_rotation = {
            let state = self.state.read().await;
            match &state.log {
                None => false,
                Some(log) => {
                    log.size_estimate() > self.options.max_size
                        || state.create_time.elapsed() > self.options.max_age()
                }
            }
        };
        if !needs_rotation {
            return;
        }
        let mut state = self.state.write().await;
        // re-check: another writer may have rotated while we waited
        let still_needed = match &state.log {
            None => false,
            Some(log) => {
                log.size_estimate() > self.options.max_size
                    || state.create_time.elapsed() > self.options.max_age()
            }
        };
        if still_needed {
            self.close_locked(&mut state).await;
        }
    }

    /// Core write loop: pin the current log, write tablet definitions for
    /// first-time participants, append the events, then verify the log did
    /// not change underneath. Retries on failure per the write policy; on
    /// exhaustion the service lock is verified and the process halts if it
    /// is gone.
    async fn write(
        &self,
        participants: &[&dyn LogParticipant],
        events: Vec<LogEvent>,
        durability: Durability,
    ) -> Result<()> {
        assert!(
            durability != Durability::None,
            "durability None must not reach the log"
        );

        let mut write_retry = self.options.write_retry.iter();
        loop {
            let mut saw_failure: Option<WalError> = None;
            let (log, seq) = self.current_log().await?;

            let mut defined = true;
            for participant in participants {
                if participant.begin_defining(seq) {
                    let result = async {
                        log.append(
                            vec![LogEvent::DefineTablet {
                                tablet_log_id: participant.tablet_log_id(),
                                extent: participant.extent().clone(),
                            }],
                            Durability::Flush,
                        )
                        .await?;
                        participant
                            .publish_log_association(log.wal_ref())
                            .await
                            .map_err(|err| {
                                WalError::Io(std::io::Error::other(err.to_string()))
                            })
                    }
                    .await;
                    match result {
                        Ok(()) => participant.finish_defining(seq, true),
                        Err(err) => {
                            participant.finish_defining(seq, false);
                            saw_failure = Some(err);
                            defined = false;
                            break;
                        }
                    }
                }
            }

            if defined && seq == self.log_seq.load(Ordering::Acquire) {
                match log.append(events.clone(), durability).await {
                    Ok(()) => {
                        // a rotation during the write means durability is not
                        // established in the log recovery will read
                        if seq == self.log_seq.load(Ordering::Acquire) {
                            self.rotate_if_needed().await;
                            return Ok(());
                        }
                    }
                    Err(WalError::LogClosed) => {
                        debug!("log closed while writing, retrying");
                    }
                    Err(err) => {
                        warn!("failed to write to log: {err}");
                        saw_failure = Some(err);
                    }
                }
            }

            if saw_failure.is_some() {
                // a writer that lost its lock must not keep appending;
                // halting preserves the single-writer guarantee
                if let Some(lock) = &self.lock {
                    let held = lock.verify_lock_at_source().await.unwrap_or(false);
                    if !held {
                        (self.halt)(
                            "writing to the log has failed and the service lock is gone",
                        );
                        return Err(WalError::WriterGone);
                    }
                }
            }

            self.close_current_if(seq).await;

            if let Some(err) = saw_failure {
                match write_retry.next() {
                    Some(pause) => tokio::time::sleep(pause).await,
                    None => return Err(err),
                }
            }
        }
    }

    /// The marker of the log currently accepting writes, if one is open.
    pub async fn current_wal(&self) -> Option<WalRef> {
        let state = self.state.read().await;
        state.log.as_ref().map(|log| log.wal_ref().clone())
    }

    /// Logs one tablet's mutation batch.
    pub async fn log(
        &self,
        participant: &dyn LogParticipant,
        seq: u64,
        mutations: Vec<Mutation>,
        durability: Durability,
    ) -> Result<()> {
        let event = LogEvent::Mutations {
            tablet_log_id: participant.tablet_log_id(),
            seq,
            mutations,
            durability,
        };
        self.write(&[participant], vec![event], durability).await
    }

    /// Logs mutation batches for many tablets in one group commit.
    pub async fn log_many(
        &self,
        batches: &[(&dyn LogParticipant, u64, Vec<Mutation>, Durability)],
    ) -> Result<()> {
        if batches.is_empty() {
            return Ok(());
        }
        let mut strongest = Durability::Log;
        let mut events = Vec::with_capacity(batches.len());
        let mut participants = Vec::with_capacity(batches.len());
        for (participant, seq, mutations, durability) in batches {
            assert!(!mutations.is_empty(), "logging empty mutation list");
            events.push(LogEvent::Mutations {
                tablet_log_id: participant.tablet_log_id(),
                seq: *seq,
                mutations: mutations.clone(),
                durability: *durability,
            });
            participants.push(*participant);
            strongest = strongest.max(*durability);
        }
        self.write(&participants, events, strongest).await
    }

    pub async fn minor_compaction_started(
        &self,
        participant: &dyn LogParticipant,
        seq: u64,
        file: &str,
        durability: Durability,
    ) -> Result<()> {
        let event = LogEvent::MinorCompactionStarted {
            tablet_log_id: participant.tablet_log_id(),
            seq,
            file: file.to_string(),
        };
        self.write(&[participant], vec![event], durability).await
    }

    pub async fn minor_compaction_finished(
        &self,
        participant: &dyn LogParticipant,
        seq: u64,
        durability: Durability,
    ) -> Result<()> {
        let event = LogEvent::MinorCompactionFinished {
            tablet_log_id: participant.tablet_log_id(),
            seq,
        };
        self.write(&[participant], vec![event], durability).await
    }

    /// Resolves logs to their sorted recovery artifacts, collapsing
    /// duplicate resolution within a recovery batch through a short cache.
    async fn resolve(&self, walogs: &[WalRef]) -> Result<Vec<Arc<ResolvedSortedLog>>> {
        let mut resolved = Vec::with_capacity(walogs.len());
        for wal in walogs {
            let cached = {
                let cache = self.resolve_cache.lock();
                cache
                    .get(wal)
                    .filter(|(at, _)| at.elapsed() < RESOLVE_CACHE_TTL)
                    .map(|(_, log)| Arc::clone(log))
            };
            let log = match cached {
                Some(log) => log,
                None => {
                    let log = Arc::new(
                        ResolvedSortedLog::resolve(wal.clone(), self.dfs.as_ref()).await?,
                    );
                    self.resolve_cache
                        .lock()
                        .insert(wal.clone(), (Instant::now(), Arc::clone(&log)));
                    log
                }
            };
            resolved.push(log);
        }
        Ok(resolved)
    }

    /// True if any of `walogs` holds mutations for `extent` that are not
    /// yet in the tablet's files.
    pub async fn needs_recovery(&self, extent: &KeyExtent, walogs: &[WalRef]) -> Result<bool> {
        let resolved = self.resolve(walogs).await?;
        SortedLogRecovery::new(resolved).needs_recovery(extent)
    }

    /// Replays unrecovered mutations for `extent` into `sink`. Idempotent:
    /// mutations already captured by a finished minor compaction (or whose
    /// compaction file is in `tablet_files`) are skipped.
    pub async fn recover(
        &self,
        extent: &KeyExtent,
        walogs: &[WalRef],
        tablet_files: &[String],
        sink: &mut dyn MutationSink,
    ) -> Result<()> {
        let resolved = self.resolve(walogs).await?;
        SortedLogRecovery::new(resolved).recover(extent, tablet_files, sink)
    }

    /// Closes the current log and stops the next-log maker.
    pub async fn shutdown(&self) {
        let mut state = self.state.write().await;
        self.close_locked(&mut state).await;
        if let Some(task) = self.maker_task.lock().take() {
            task.abort();
        }
    }
}
