// Copyright (c) 2023 - 2025 Tessera Contributors.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! The conditional writer. Mutations are binned by tablet location and sent
//! through per-server sessions; `Ignored` results retry after locator
//! invalidation, and an indeterminate failure is only ever reported as
//! `Unknown` after the server has been fenced from applying the session's
//! mutations later.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use ahash::HashMap;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use tessera_coordination::client::SharedClient;
use tessera_coordination::lock::is_lock_held;
use tessera_metadata::MetadataStore;
use tessera_types::config::ClientOptions;
use tessera_types::rpc::{
    CmResult, ConditionalSessionInfo, IngestError, ServerConditionalMutation,
    TabletIngestService,
};
use tessera_types::visibility::VisibilityEvaluator;
use tessera_types::mutation::condition_order;
use tessera_types::{ConditionalMutation, ConditionalStatus, Durability, KeyExtent, TableId};

use crate::locator::TabletLocator;

const MAX_RETRY_SLEEP: Duration = Duration::from_secs(30);

/// Resolves a server address to its ingest service. In-process deployments
/// return the server object directly; a networked deployment would dial.
pub trait Connector: Send + Sync {
    fn connect(&self, host_port: &str) -> Option<Arc<dyn TabletIngestService>>;
}

/// Final outcome of one conditional mutation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Status(ConditionalStatus),
    /// The writer's timeout elapsed before a definite outcome.
    TimedOut { server: Option<String> },
    Error(String),
}

#[derive(Debug)]
pub struct WriteResult {
    pub mutation: ConditionalMutation,
    pub outcome: Outcome,
}

#[derive(Debug, thiserror::Error)]
pub enum WriterError {
    #[error("conditional mutation for row {0:?} has no conditions")]
    NoConditions(String),
}

pub struct ConditionalWriterConfig {
    pub auths: Vec<Bytes>,
    pub durability: Durability,
    pub options: ClientOptions,
}

struct CachedSession {
    info: ConditionalSessionInfo,
    reserved: bool,
    last_access: Instant,
}

impl CachedSession {
    fn is_active(&self) -> bool {
        let ttl = Duration::from_millis(self.info.ttl_millis);
        self.last_access.elapsed() < ttl.mul_f64(0.95)
    }
}

struct Pending {
    cmid: u64,
    mutation: ConditionalMutation,
    entry_time: Instant,
    delay: Duration,
}

/// Writes conditional mutations to one table.
pub struct ConditionalWriter {
    table: TableId,
    locator: TabletLocator,
    connector: Arc<dyn Connector>,
    coordination: SharedClient,
    config: ConditionalWriterConfig,
    sessions: Mutex<HashMap<String, CachedSession>>,
}

impl ConditionalWriter {
    pub fn new(
        table: TableId,
        metadata: MetadataStore,
        connector: Arc<dyn Connector>,
        coordination: SharedClient,
        config: ConditionalWriterConfig,
    ) -> Self {
        ConditionalWriter {
            locator: TabletLocator::new(metadata, table.clone()),
            table,
            connector,
            coordination,
            config,
            sessions: Mutex::new(HashMap::default()),
        }
    }

    /// Writes a batch and returns one result per mutation, in input order.
    pub async fn write(
        &self,
        mutations: Vec<ConditionalMutation>,
    ) -> Result<Vec<WriteResult>, WriterError> {
        let evaluator =
            VisibilityEvaluator::new(self.config.auths.iter().map(|a| a.to_vec()));
        let mut outcomes: BTreeMap<u64, Outcome> = BTreeMap::new();
        let mut pending: Vec<Pending> = Vec::new();
        let entry_time = Instant::now();

        let mut originals: Vec<ConditionalMutation> = Vec::with_capacity(mutations.len());
        'mutations: for (index, mut mutation) in mutations.into_iter().enumerate() {
            if mutation.conditions.is_empty() {
                return Err(WriterError::NoConditions(
                    String::from_utf8_lossy(mutation.row()).into_owned(),
                ));
            }
            let cmid = index as u64;
            for condition in &mutation.conditions {
                if !evaluator.can_access(&condition.visibility).unwrap_or(false) {
                    outcomes.insert(
                        cmid,
                        Outcome::Status(ConditionalStatus::InvisibleVisibility),
                    );
                    originals.push(mutation);
                    continue 'mutations;
                }
            }
            // sorted client-side so the server probes columns sequentially
            mutation.conditions.sort_by(condition_order);
            originals.push(mutation.clone());
            pending.push(Pending {
                cmid,
                mutation,
                entry_time,
                delay: Duration::from_millis(50),
            });
        }

        while !pending.is_empty() {
            pending = self.write_round(pending, &mut outcomes).await;
        }

        Ok(originals
            .into_iter()
            .enumerate()
            .map(|(index, mutation)| WriteResult {
                mutation,
                outcome: outcomes
                    .remove(&(index as u64))
                    .unwrap_or(Outcome::Error("mutation lost by writer".to_string())),
            })
            .collect())
    }

    /// Bins pending mutations by location and sends one request per server.
    /// Returns the mutations that still need another round.
    async fn write_round(
        &self,
        pending: Vec<Pending>,
        outcomes: &mut BTreeMap<u64, Outcome>,
    ) -> Vec<Pending> {
        let timeout = self.config.options.conditional_timeout();
        let mut binned: BTreeMap<String, BTreeMap<KeyExtent, Vec<Pending>>> = BTreeMap::new();
        let mut retry_later: Vec<Pending> = Vec::new();

        for entry in pending {
            if entry.entry_time.elapsed() > timeout {
                outcomes.insert(entry.cmid, Outcome::TimedOut { server: None });
                continue;
            }
            match self.locator.locate(entry.mutation.row()) {
                Some((extent, Some(server))) => binned
                    .entry(server.host_port().to_string())
                    .or_default()
                    .entry(extent)
                    .or_default()
                    .push(entry),
                Some((extent, None)) => {
                    // not hosted yet; give the manager a moment
                    trace!(%extent, "tablet has no location, retrying");
                    self.locator.invalidate(&extent);
                    retry_later.push(entry);
                }
                None => {
                    self.locator.invalidate_all();
                    retry_later.push(entry);
                }
            }
        }

        if !retry_later.is_empty() {
            // one pause per round, paced by the soonest-due entry
            let pause = retry_later.iter().map(|e| e.delay).min().unwrap_or_default();
            tokio::time::sleep(pause).await;
            for entry in &mut retry_later {
                entry.delay = (entry.delay * 2).min(MAX_RETRY_SLEEP);
            }
        }

        for (server, extents) in binned {
            let mut returned = self.send_to_server(&server, extents, outcomes).await;
            retry_later.append(&mut returned);
        }
        retry_later
    }

    async fn send_to_server(
        &self,
        server: &str,
        extents: BTreeMap<KeyExtent, Vec<Pending>>,
        outcomes: &mut BTreeMap<u64, Outcome>,
    ) -> Vec<Pending> {
        let mut by_cmid: HashMap<u64, Pending> = HashMap::default();
        let mut updates: BTreeMap<KeyExtent, Vec<ServerConditionalMutation>> = BTreeMap::new();
        for (extent, entries) in extents {
            let list = updates.entry(extent).or_default();
            for entry in entries {
                list.push(ServerConditionalMutation {
                    cmid: entry.cmid,
                    mutation: entry.mutation.clone(),
                });
                by_cmid.insert(entry.cmid, entry);
            }
        }

        let Some(service) = self.connector.connect(server) else {
            // cannot even dial: re-locate everything after a pause
            warn!(server, "could not connect for conditional update");
            self.locator.invalidate_all();
            return self.requeue_all(by_cmid).await;
        };

        // reserve or open a session; a session rejected as unknown on the
        // server is discarded and reopened
        let results = loop {
            let session = match self.reserve_session(server, service.as_ref()).await {
                Ok(session) => session,
                Err(err) => {
                    warn!(server, "could not open conditional session: {err}");
                    self.locator.invalidate_all();
                    return self.requeue_all(by_cmid).await;
                }
            };

            match service
                .conditional_update(
                    session.session_id,
                    updates.clone(),
                    Vec::new(),
                )
                .await
            {
                Ok(results) => {
                    self.unreserve_session(server);
                    break results;
                }
                Err(IngestError::NoSuchSession) => {
                    debug!(server, "session gone, reopening");
                    self.invalidate_cached_session(server);
                    continue;
                }
                Err(IngestError::Connection(reason)) => {
                    debug!(server, reason, "indeterminate conditional update");
                    return self
                        .handle_indeterminate(server, session, by_cmid, outcomes)
                        .await;
                }
                Err(err) => {
                    self.unreserve_session(server);
                    for (cmid, _) in by_cmid {
                        outcomes.insert(cmid, Outcome::Error(err.to_string()));
                    }
                    return Vec::new();
                }
            }
        };

        let mut requeue = Vec::new();
        for CmResult { cmid, status } in results {
            let Some(entry) = by_cmid.remove(&cmid) else {
                continue;
            };
            if status == ConditionalStatus::Ignored {
                // the tablet was closed or moving; find it again and retry
                if let Some((extent, _)) = self.locator.locate(entry.mutation.row()) {
                    self.locator.invalidate(&extent);
                }
                requeue.push(entry);
            } else {
                outcomes.insert(cmid, Outcome::Status(status));
            }
        }
        for (cmid, _) in by_cmid {
            outcomes.insert(cmid, Outcome::Error("server returned no result".to_string()));
        }
        requeue
    }

    async fn requeue_all(&self, by_cmid: HashMap<u64, Pending>) -> Vec<Pending> {
        let mut requeued: Vec<Pending> = by_cmid.into_values().collect();
        if let Some(pause) = requeued.iter().map(|e| e.delay).min() {
            tokio::time::sleep(pause).await;
        }
        for entry in &mut requeued {
            entry.delay = (entry.delay * 2).min(MAX_RETRY_SLEEP);
        }
        requeued
    }

    /// The correctness hinge for `Unknown`: before reporting an
    /// indeterminate outcome, either establish that the server's lock is
    /// gone (it can never apply the session's mutations) or make the server
    /// invalidate the session so nothing from it applies later.
    async fn handle_indeterminate(
        &self,
        server: &str,
        session: ConditionalSessionInfo,
        by_cmid: HashMap<u64, Pending>,
        outcomes: &mut BTreeMap<u64, Outcome>,
    ) -> Vec<Pending> {
        self.invalidate_cached_session(server);
        let timeout = self.config.options.conditional_timeout();
        let started = Instant::now();
        let mut sleep = Duration::from_millis(50);

        loop {
            match is_lock_held(self.coordination.as_ref(), &session.lock_id).await {
                Ok(false) => {
                    debug!(server, "server lock gone, session can never apply");
                    break;
                }
                Ok(true) => {
                    match self.connector.connect(server) {
                        Some(service) => {
                            match service
                                .invalidate_conditional_update(session.session_id)
                                .await
                            {
                                Ok(()) => {
                                    debug!(server, session = session.session_id, "session fenced");
                                    break;
                                }
                                Err(err) => {
                                    trace!(server, "invalidate failed, retrying: {err}")
                                }
                            }
                        }
                        None => trace!(server, "cannot reach server to invalidate"),
                    }
                }
                Err(err) => trace!(server, "cannot verify server lock: {err}"),
            }

            if started.elapsed() + sleep > timeout {
                for (cmid, _) in by_cmid {
                    outcomes.insert(
                        cmid,
                        Outcome::TimedOut {
                            server: Some(server.to_string()),
                        },
                    );
                }
                return Vec::new();
            }
            tokio::time::sleep(sleep).await;
            sleep = (sleep * 2).min(MAX_RETRY_SLEEP);
        }

        // only now is Unknown safe to report
        for (cmid, _) in by_cmid {
            outcomes.insert(cmid, Outcome::Status(ConditionalStatus::Unknown));
        }
        Vec::new()
    }

    async fn reserve_session(
        &self,
        server: &str,
        service: &dyn TabletIngestService,
    ) -> Result<ConditionalSessionInfo, IngestError> {
        {
            let mut sessions = self.sessions.lock();
            if let Some(cached) = sessions.get_mut(server) {
                assert!(!cached.reserved, "conditional sessions are single-threaded");
                if cached.is_active() {
                    cached.reserved = true;
                    return Ok(cached.info.clone());
                }
                sessions.remove(server);
            }
        }

        let info = service
            .start_conditional_update(
                self.table.clone(),
                self.config.auths.clone(),
                self.config.durability,
            )
            .await?;
        self.sessions.lock().insert(
            server.to_string(),
            CachedSession {
                info: info.clone(),
                reserved: true,
                last_access: Instant::now(),
            },
        );
        Ok(info)
    }

    fn unreserve_session(&self, server: &str) {
        if let Some(cached) = self.sessions.lock().get_mut(server) {
            cached.reserved = false;
            cached.last_access = Instant::now();
        }
    }

    fn invalidate_cached_session(&self, server: &str) {
        self.sessions.lock().remove(server);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use googletest::prelude::*;
    use tessera_coordination::MemoryCoordination;
    use tessera_metadata::MetadataStore;
    use tessera_types::{Condition, Mutation, TabletAvailability};

    struct NoConnector;

    impl Connector for NoConnector {
        fn connect(&self, _host_port: &str) -> Option<Arc<dyn TabletIngestService>> {
            None
        }
    }

    fn writer(auths: Vec<Bytes>) -> ConditionalWriter {
        let metadata = MetadataStore::new();
        metadata.bootstrap_table(
            &TableId::new("1a"),
            &[],
            TabletAvailability::Hosted,
        );
        ConditionalWriter::new(
            TableId::new("1a"),
            metadata,
            Arc::new(NoConnector),
            MemoryCoordination::new().client(),
            ConditionalWriterConfig {
                auths,
                durability: Durability::Sync,
                options: ClientOptions::default(),
            },
        )
    }

    #[tokio::test]
    async fn zero_conditions_is_an_argument_error() {
        let writer = writer(Vec::new());
        let unconditional = ConditionalMutation::new(
            Mutation::new(&b"row"[..]).put(&b"f"[..], &b"q"[..], &b"v"[..]),
        );
        let err = writer.write(vec![unconditional]).await.unwrap_err();
        assert_that!(err, matches_pattern!(WriterError::NoConditions(anything())));
    }

    #[tokio::test]
    async fn inaccessible_condition_visibility_is_reported_not_sent() {
        let writer = writer(Vec::new());
        let mutation = ConditionalMutation::new(
            Mutation::new(&b"row"[..]).put(&b"f"[..], &b"q"[..], &b"v"[..]),
        )
        .with_condition(
            Condition::new(&b"f"[..], &b"q"[..]).with_visibility(&b"secret"[..]),
        );
        let results = writer.write(vec![mutation]).await.unwrap();
        assert_that!(
            results[0].outcome.clone(),
            eq(&Outcome::Status(ConditionalStatus::InvisibleVisibility))
        );
    }

    #[test]
    fn sessions_expire_just_before_their_ttl() {
        let fresh = CachedSession {
            info: ConditionalSessionInfo {
                session_id: 1,
                lock_id: tessera_types::LockId::new(
                    "/locks/tservers/h",
                    uuid::Uuid::new_v4(),
                    1,
                ),
                ttl_millis: 60_000,
            },
            reserved: false,
            last_access: Instant::now(),
        };
        assert_that!(fresh.is_active(), eq(true));
    }
}
