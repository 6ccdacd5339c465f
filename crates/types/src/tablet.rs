// Copyright (c) 2023 - 2025 Tessera Contributors.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

use std::collections::{BTreeMap, BTreeSet};

use bytes::Bytes;
use bytestring::ByteString;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::extent::KeyExtent;
use crate::fate::FateId;
use crate::server::TServerInstance;
use crate::time::{MetadataTime, SteadyTime};

/// The sub-range of a data file that counts for a tablet. After a split both
/// children may reference the parent's file, each fenced to its own range.
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct FencedRange {
    /// Exclusive lower bound; `None` is -infinity.
    pub start: Option<Bytes>,
    /// Inclusive upper bound; `None` is +infinity.
    pub end: Option<Bytes>,
}

impl FencedRange {
    pub fn infinite() -> Self {
        FencedRange::default()
    }

    pub fn new(start: Option<impl Into<Bytes>>, end: Option<impl Into<Bytes>>) -> Self {
        FencedRange {
            start: start.map(Into::into),
            end: end.map(Into::into),
        }
    }

    pub fn is_infinite(&self) -> bool {
        self.start.is_none() && self.end.is_none()
    }
}

/// Reference to a sorted data file, fenced to the range that counts.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct StoredFile {
    pub path: ByteString,
    pub fenced: FencedRange,
}

impl StoredFile {
    pub fn new(path: impl Into<ByteString>) -> Self {
        StoredFile {
            path: path.into(),
            fenced: FencedRange::infinite(),
        }
    }

    pub fn fenced(path: impl Into<ByteString>, range: FencedRange) -> Self {
        StoredFile {
            path: path.into(),
            fenced: range,
        }
    }
}

impl std::fmt::Display for StoredFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.path)
    }
}

/// Reference to a write-ahead log still needed by a tablet for recovery.
#[derive(
    Debug,
    Clone,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
    derive_more::Display,
)]
#[display("{server_host_port}/{uuid}")]
pub struct WalRef {
    pub server_host_port: String,
    pub uuid: Uuid,
    pub path: ByteString,
}

/// Lifecycle of a write-ahead log as advertised in the coordination service.
/// A log is only eligible for recovery reads once it is `Closed`; a `Closed`
/// log is never appended to again.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
pub enum WalState {
    Open,
    Closed,
    Unreferenced,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
pub enum LocationKind {
    Current,
    Future,
}

/// A location marker on a tablet: the server hosting it (`Current`) or the
/// server that was asked to host it (`Future`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Location {
    pub server: TServerInstance,
    pub kind: LocationKind,
}

impl Location {
    pub fn current(server: TServerInstance) -> Self {
        Location {
            server,
            kind: LocationKind::Current,
        }
    }

    pub fn future(server: TServerInstance) -> Self {
        Location {
            server,
            kind: LocationKind::Future,
        }
    }
}

/// Per-tablet hosting policy.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
pub enum TabletAvailability {
    /// The tablet must always have a location.
    Hosted,
    /// The tablet is hosted only while something asks for it.
    OnDemand,
    /// The tablet is never hosted; only scans of written files can see it.
    Unhosted,
}

/// Records that a tablet was unloaded because its server died, along with
/// when, so the watcher can hand it back if the server returns soon enough.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Suspension {
    pub server_host_port: String,
    pub suspension_time: SteadyTime,
}

/// Whether the system may fold this tablet into a neighbor.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Default,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
pub enum TabletMergeability {
    #[default]
    Never,
    Always,
}

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
pub enum OperationKind {
    Splitting,
    Merging,
    Deleting,
}

/// An exclusive multi-step operation active on a tablet. While set, the
/// tablet is not assigned and the watcher leaves it alone.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, derive_more::Display)]
#[display("{kind}:{fate_id}")]
pub struct OperationId {
    pub kind: OperationKind,
    pub fate_id: FateId,
}

impl OperationId {
    pub fn new(kind: OperationKind, fate_id: FateId) -> Self {
        OperationId { kind, fate_id }
    }
}

/// The columns of a tablet's metadata row. Reads fetch a subset; accessors
/// panic when asked for a column the read did not fetch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, strum::EnumIter)]
pub enum ColumnType {
    PrevRow,
    Files,
    Loaded,
    Location,
    Last,
    Suspend,
    Logs,
    OpId,
    Availability,
    HostingRequested,
    FlushId,
    Time,
    Mergeability,
    Migration,
}

/// A set of [`ColumnType`]s, kept as a bitmask.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ColumnSet(u32);

impl ColumnSet {
    pub const ALL: ColumnSet = ColumnSet(u32::MAX);

    pub fn of(columns: &[ColumnType]) -> Self {
        let mut set = ColumnSet::default();
        for c in columns {
            set = set.with(*c);
        }
        set
    }

    pub fn with(self, column: ColumnType) -> Self {
        ColumnSet(self.0 | (1 << column as u32))
    }

    pub fn contains(&self, column: ColumnType) -> bool {
        self.0 & (1 << column as u32) != 0
    }
}

/// A snapshot of one tablet's metadata row.
///
/// `current` and `future` are stored separately because observing both set is
/// a hard anomaly that readers must be able to diagnose rather than have
/// papered over by a single-location representation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TabletMetadata {
    extent: KeyExtent,
    fetched: ColumnSet,
    files: BTreeSet<StoredFile>,
    loaded: BTreeMap<StoredFile, FateId>,
    current: Option<TServerInstance>,
    future: Option<TServerInstance>,
    last: Option<TServerInstance>,
    suspend: Option<Suspension>,
    logs: Vec<WalRef>,
    operation: Option<OperationId>,
    availability: TabletAvailability,
    hosting_requested: bool,
    flush_id: Option<u64>,
    time: MetadataTime,
    mergeability: TabletMergeability,
    migration: Option<TServerInstance>,
}

impl TabletMetadata {
    pub fn builder(extent: KeyExtent) -> TabletMetadataBuilder {
        TabletMetadataBuilder {
            inner: TabletMetadata {
                extent,
                fetched: ColumnSet::ALL,
                files: BTreeSet::new(),
                loaded: BTreeMap::new(),
                current: None,
                future: None,
                last: None,
                suspend: None,
                logs: Vec::new(),
                operation: None,
                availability: TabletAvailability::OnDemand,
                hosting_requested: false,
                flush_id: None,
                time: MetadataTime::default(),
                mergeability: TabletMergeability::default(),
                migration: None,
            },
        }
    }

    fn check_fetched(&self, column: ColumnType) {
        assert!(
            self.fetched.contains(column),
            "column {column:?} was not fetched for {}",
            self.extent
        );
    }

    pub fn extent(&self) -> &KeyExtent {
        &self.extent
    }

    pub fn fetched_columns(&self) -> ColumnSet {
        self.fetched
    }

    /// Restricts the visible columns, modeling a partial fetch.
    pub fn with_fetched(mut self, fetched: ColumnSet) -> Self {
        self.fetched = fetched;
        self
    }

    pub fn files(&self) -> &BTreeSet<StoredFile> {
        self.check_fetched(ColumnType::Files);
        &self.files
    }

    pub fn loaded(&self) -> &BTreeMap<StoredFile, FateId> {
        self.check_fetched(ColumnType::Loaded);
        &self.loaded
    }

    pub fn has_current(&self) -> bool {
        self.check_fetched(ColumnType::Location);
        self.current.is_some()
    }

    pub fn current(&self) -> Option<&TServerInstance> {
        self.check_fetched(ColumnType::Location);
        self.current.as_ref()
    }

    pub fn future(&self) -> Option<&TServerInstance> {
        self.check_fetched(ColumnType::Location);
        self.future.as_ref()
    }

    /// The single location marker, preferring `current`. Callers that need to
    /// distinguish the anomalous both-set state check
    /// [`TabletMetadata::is_future_and_current_set`] first.
    pub fn location(&self) -> Option<Location> {
        self.check_fetched(ColumnType::Location);
        match (&self.current, &self.future) {
            (Some(server), _) => Some(Location::current(server.clone())),
            (None, Some(server)) => Some(Location::future(server.clone())),
            (None, None) => None,
        }
    }

    pub fn is_future_and_current_set(&self) -> bool {
        self.check_fetched(ColumnType::Location);
        self.current.is_some() && self.future.is_some()
    }

    pub fn last(&self) -> Option<&TServerInstance> {
        self.check_fetched(ColumnType::Last);
        self.last.as_ref()
    }

    pub fn suspend(&self) -> Option<&Suspension> {
        self.check_fetched(ColumnType::Suspend);
        self.suspend.as_ref()
    }

    pub fn logs(&self) -> &[WalRef] {
        self.check_fetched(ColumnType::Logs);
        &self.logs
    }

    pub fn operation_id(&self) -> Option<&OperationId> {
        self.check_fetched(ColumnType::OpId);
        self.operation.as_ref()
    }

    pub fn availability(&self) -> TabletAvailability {
        self.check_fetched(ColumnType::Availability);
        self.availability
    }

    pub fn hosting_requested(&self) -> bool {
        self.check_fetched(ColumnType::HostingRequested);
        self.hosting_requested
    }

    pub fn flush_id(&self) -> Option<u64> {
        self.check_fetched(ColumnType::FlushId);
        self.flush_id
    }

    pub fn time(&self) -> &MetadataTime {
        self.check_fetched(ColumnType::Time);
        &self.time
    }

    pub fn mergeability(&self) -> TabletMergeability {
        self.check_fetched(ColumnType::Mergeability);
        self.mergeability
    }

    pub fn migration(&self) -> Option<&TServerInstance> {
        self.check_fetched(ColumnType::Migration);
        self.migration.as_ref()
    }
}

/// Builder for [`TabletMetadata`] snapshots, used by the metadata store when
/// materializing rows and by tests when faking them.
pub struct TabletMetadataBuilder {
    inner: TabletMetadata,
}

impl TabletMetadataBuilder {
    pub fn put_file(mut self, file: StoredFile) -> Self {
        self.inner.files.insert(file);
        self
    }

    pub fn put_loaded(mut self, file: StoredFile, fate_id: FateId) -> Self {
        self.inner.loaded.insert(file, fate_id);
        self
    }

    pub fn put_current(mut self, server: TServerInstance) -> Self {
        self.inner.current = Some(server);
        self
    }

    pub fn put_future(mut self, server: TServerInstance) -> Self {
        self.inner.future = Some(server);
        self
    }

    pub fn put_last(mut self, server: TServerInstance) -> Self {
        self.inner.last = Some(server);
        self
    }

    pub fn put_suspension(mut self, suspension: Suspension) -> Self {
        self.inner.suspend = Some(suspension);
        self
    }

    pub fn put_wal(mut self, wal: WalRef) -> Self {
        self.inner.logs.push(wal);
        self
    }

    pub fn put_operation(mut self, operation: OperationId) -> Self {
        self.inner.operation = Some(operation);
        self
    }

    pub fn put_availability(mut self, availability: TabletAvailability) -> Self {
        self.inner.availability = availability;
        self
    }

    pub fn put_hosting_requested(mut self, requested: bool) -> Self {
        self.inner.hosting_requested = requested;
        self
    }

    pub fn put_flush_id(mut self, flush_id: u64) -> Self {
        self.inner.flush_id = Some(flush_id);
        self
    }

    pub fn put_time(mut self, time: MetadataTime) -> Self {
        self.inner.time = time;
        self
    }

    pub fn put_mergeability(mut self, mergeability: TabletMergeability) -> Self {
        self.inner.mergeability = mergeability;
        self
    }

    pub fn put_migration(mut self, server: TServerInstance) -> Self {
        self.inner.migration = Some(server);
        self
    }

    pub fn build(self) -> TabletMetadata {
        self.inner
    }
}

/// The observed state of a tablet, computed from its metadata row and the
/// set of live tablet servers. Never stored.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumIter,
)]
pub enum TabletState {
    Unassigned,
    Assigned,
    Hosted,
    AssignedToDeadServer,
    Suspended,
}

impl TabletState {
    pub fn compute<'a>(
        tm: &TabletMetadata,
        live_servers: impl IntoIterator<Item = &'a TServerInstance>,
    ) -> TabletState {
        match tm.location() {
            None => {
                if tm.suspend().is_some() {
                    TabletState::Suspended
                } else {
                    TabletState::Unassigned
                }
            }
            Some(location) => {
                let alive = live_servers.into_iter().any(|s| *s == location.server);
                match (location.kind, alive) {
                    (LocationKind::Current, true) => TabletState::Hosted,
                    (LocationKind::Future, true) => TabletState::Assigned,
                    (_, false) => TabletState::AssignedToDeadServer,
                }
            }
        }
    }
}

/// What the manager wants for a tablet. Computed in one place only, so every
/// part of the system reasons from the same goal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
pub enum TabletGoalState {
    Hosted,
    Unassigned,
    Suspended,
    Deleted,
}

/// How a tablet server should dispose of a tablet it is asked to unload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
pub enum UnloadGoal {
    Unassigned,
    Suspended,
    Deleted,
}

impl TabletGoalState {
    pub fn how_unload(&self) -> UnloadGoal {
        match self {
            TabletGoalState::Suspended => UnloadGoal::Suspended,
            TabletGoalState::Deleted => UnloadGoal::Deleted,
            TabletGoalState::Hosted | TabletGoalState::Unassigned => UnloadGoal::Unassigned,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::table::TableId;

    fn tm() -> TabletMetadataBuilder {
        TabletMetadata::builder(KeyExtent::whole_table(TableId::new("1")))
    }

    fn ts(host: &str, session: u64) -> TServerInstance {
        TServerInstance::new(host, session)
    }

    #[test]
    fn state_of_unassigned() {
        let meta = tm().build();
        assert_eq!(TabletState::compute(&meta, []), TabletState::Unassigned);
    }

    #[test]
    fn state_of_suspended() {
        let meta = tm()
            .put_suspension(Suspension {
                server_host_port: "host1:9997".to_string(),
                suspension_time: SteadyTime::from_millis(42),
            })
            .build();
        assert_eq!(TabletState::compute(&meta, []), TabletState::Suspended);
    }

    #[test]
    fn state_follows_location_liveness() {
        let live = ts("host1:9997", 7);
        let hosted = tm().put_current(live.clone()).build();
        assert_eq!(TabletState::compute(&hosted, [&live]), TabletState::Hosted);
        assert_eq!(
            TabletState::compute(&hosted, []),
            TabletState::AssignedToDeadServer
        );

        let assigned = tm().put_future(live.clone()).build();
        assert_eq!(
            TabletState::compute(&assigned, [&live]),
            TabletState::Assigned
        );
        // same host, different session: the process the location points at is gone
        let restarted = ts("host1:9997", 8);
        assert_eq!(
            TabletState::compute(&assigned, [&restarted]),
            TabletState::AssignedToDeadServer
        );
    }

    #[test]
    fn both_locations_is_detectable() {
        let meta = tm()
            .put_current(ts("host1:9997", 1))
            .put_future(ts("host2:9997", 1))
            .build();
        assert!(meta.is_future_and_current_set());
    }

    #[test]
    #[should_panic(expected = "not fetched")]
    fn unfetched_column_panics() {
        let meta = tm().build().with_fetched(ColumnSet::of(&[ColumnType::Files]));
        let _ = meta.logs();
    }
}
