// Copyright (c) 2023 - 2025 Tessera Contributors.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Service interfaces between the client, the tablet servers and the
//! manager. The wire encoding behind these traits is out of scope; in-process
//! deployments and tests wire them up directly.

use std::collections::BTreeMap;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::extent::KeyExtent;
use crate::lock::LockId;
use crate::mutation::{ConditionalMutation, ConditionalStatus, Durability, Mutation};
use crate::table::TableId;
use crate::tablet::{StoredFile, UnloadGoal};
use crate::time::SteadyTime;

/// A conditional mutation as shipped to a server, tagged with the client's
/// correlation id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConditionalMutation {
    pub cmid: u64,
    pub mutation: ConditionalMutation,
}

/// Per-mutation outcome of a conditional update round.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CmResult {
    pub cmid: u64,
    pub status: ConditionalStatus,
}

/// Returned when a conditional session is opened.
#[derive(Debug, Clone)]
pub struct ConditionalSessionInfo {
    pub session_id: u64,
    /// The server's service lock; the client verifies it when deciding
    /// whether an unreachable server is dead.
    pub lock_id: LockId,
    /// How long an idle session survives, in milliseconds.
    pub ttl_millis: u64,
}

#[derive(Debug, thiserror::Error)]
pub enum IngestError {
    /// The session does not exist or was invalidated; the client must open
    /// a fresh one.
    #[error("no such session")]
    NoSuchSession,
    #[error("permission denied")]
    PermissionDenied,
    #[error("unexpected table {0}")]
    WrongTable(TableId),
    #[error("server error: {0}")]
    Server(String),
    /// Transport-level failure: the request may or may not have executed.
    #[error("connection failure: {0}")]
    Connection(String),
}

/// Ingest surface of a tablet server, as used by clients.
#[async_trait::async_trait]
pub trait TabletIngestService: Send + Sync {
    async fn start_conditional_update(
        &self,
        table: TableId,
        auths: Vec<Bytes>,
        durability: Durability,
    ) -> Result<ConditionalSessionInfo, IngestError>;

    /// Runs one round of conditional updates in a session. Deferred
    /// mutations are retried internally until none remain; the result list
    /// covers every submitted mutation.
    async fn conditional_update(
        &self,
        session_id: u64,
        updates: BTreeMap<KeyExtent, Vec<ServerConditionalMutation>>,
        symbols: Vec<String>,
    ) -> Result<Vec<CmResult>, IngestError>;

    /// Fences a session: once this returns, no mutation from the session
    /// will ever be applied.
    async fn invalidate_conditional_update(&self, session_id: u64)
        -> Result<(), IngestError>;

    async fn close_conditional_update(&self, session_id: u64) -> Result<(), IngestError>;

    /// Non-conditional write path.
    async fn apply_mutations(
        &self,
        extent: KeyExtent,
        mutations: Vec<Mutation>,
        durability: Durability,
    ) -> Result<(), IngestError>;
}

#[derive(Debug, thiserror::Error)]
pub enum AdminRpcError {
    #[error("caller does not hold the manager lock")]
    BadManagerLock,
    #[error("tablet {0} is not here")]
    NoSuchTablet(KeyExtent),
    #[error("server error: {0}")]
    Server(String),
    #[error("connection failure: {0}")]
    Connection(String),
}

/// Administrative surface of a tablet server, as used by the manager.
#[async_trait::async_trait]
pub trait TServerAdminService: Send + Sync {
    /// Asks the server to load a tablet it has a future location for.
    async fn assign_tablet(
        &self,
        manager_lock: LockId,
        extent: KeyExtent,
    ) -> Result<(), AdminRpcError>;

    async fn unload_tablet(
        &self,
        manager_lock: LockId,
        extent: KeyExtent,
        goal: UnloadGoal,
        request_time: SteadyTime,
    ) -> Result<(), AdminRpcError>;

    /// Flushes every hosted tablet of `table` overlapping the range whose
    /// recorded flush id is below `flush_id`.
    async fn flush(
        &self,
        manager_lock: LockId,
        table: TableId,
        start_row: Option<Bytes>,
        end_row: Option<Bytes>,
        flush_id: u64,
    ) -> Result<(), AdminRpcError>;

    /// Makes hosted tablets re-read their metadata so freshly bulk-loaded
    /// files become visible.
    async fn refresh_tablets(&self, extents: Vec<KeyExtent>) -> Result<(), AdminRpcError>;

    /// Stops accepting new work ahead of a shutdown.
    async fn drain(&self) -> Result<(), AdminRpcError>;

    /// Terminates the server process, releasing its service lock.
    async fn halt(&self, manager_lock: LockId) -> Result<(), AdminRpcError>;

    /// Liveness probe.
    async fn ping(&self) -> Result<(), AdminRpcError>;
}

/// Files bulk-loaded into one tablet, as sent to its hosting server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TabletFiles {
    pub extent: KeyExtent,
    pub files: Vec<StoredFile>,
}
