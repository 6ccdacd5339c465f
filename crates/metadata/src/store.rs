// Copyright (c) 2023 - 2025 Tessera Contributors.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! The backing store for the system metadata table: one sorted row per
//! tablet, plus the user-fate rows that live in the same table.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use tracing::trace;
use uuid::Uuid;

use tessera_types::{
    ColumnSet, FateId, KeyExtent, MetadataTime, OperationId, StoredFile, Suspension,
    TServerInstance, TableId, TabletAvailability, TabletMergeability, TabletMetadata, WalRef,
};

/// Everything stored in one tablet's metadata row.
#[derive(Debug, Clone)]
pub(crate) struct TabletRow {
    pub prev_end_row: Option<Bytes>,
    pub files: BTreeSet<StoredFile>,
    pub loaded: BTreeMap<StoredFile, FateId>,
    pub current: Option<TServerInstance>,
    pub future: Option<TServerInstance>,
    pub last: Option<TServerInstance>,
    pub suspend: Option<Suspension>,
    pub logs: Vec<WalRef>,
    pub operation: Option<OperationId>,
    pub availability: TabletAvailability,
    pub hosting_requested: bool,
    pub flush_id: Option<u64>,
    pub time: MetadataTime,
    pub mergeability: TabletMergeability,
    pub migration: Option<TServerInstance>,
}

impl TabletRow {
    pub(crate) fn new(prev_end_row: Option<Bytes>) -> Self {
        TabletRow {
            prev_end_row,
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
        }
    }

    pub(crate) fn to_metadata(&self, extent: KeyExtent, fetch: ColumnSet) -> TabletMetadata {
        let mut builder = TabletMetadata::builder(extent);
        for file in &self.files {
            builder = builder.put_file(file.clone());
        }
        for (file, fate_id) in &self.loaded {
            builder = builder.put_loaded(file.clone(), *fate_id);
        }
        if let Some(server) = &self.current {
            builder = builder.put_current(server.clone());
        }
        if let Some(server) = &self.future {
            builder = builder.put_future(server.clone());
        }
        if let Some(server) = &self.last {
            builder = builder.put_last(server.clone());
        }
        if let Some(suspension) = &self.suspend {
            builder = builder.put_suspension(suspension.clone());
        }
        for wal in &self.logs {
            builder = builder.put_wal(wal.clone());
        }
        if let Some(operation) = &self.operation {
            builder = builder.put_operation(operation.clone());
        }
        if let Some(flush_id) = self.flush_id {
            builder = builder.put_flush_id(flush_id);
        }
        if let Some(server) = &self.migration {
            builder = builder.put_migration(server.clone());
        }
        builder
            .put_availability(self.availability)
            .put_hosting_requested(self.hosting_requested)
            .put_time(self.time)
            .put_mergeability(self.mergeability)
            .build()
            .with_fetched(fetch)
    }
}

/// One user-fate row: the columns the fate store keeps per transaction.
#[derive(Debug, Clone, Default)]
pub struct FateRow {
    pub status: Option<String>,
    pub created: Option<u64>,
    pub name: Option<String>,
    pub reservation: Option<String>,
    pub auto_clean_up: bool,
    pub repos: BTreeMap<u32, Bytes>,
}

/// Predicates a fate-row mutation may require.
#[derive(Debug, Clone)]
pub enum FateRequire {
    /// Status must be one of these; an empty list requires the status column
    /// to be absent.
    StatusIn(Vec<String>),
    /// Reservation column must equal this value (`None`: must be absent).
    ReservationIs(Option<String>),
    /// No repo may occupy this position yet.
    RepoAbsent(u32),
    RowAbsent,
    RowPresent,
}

/// Column writes a fate-row mutation may carry.
#[derive(Debug, Clone)]
pub enum FateOp {
    PutStatus(String),
    PutCreated(u64),
    PutName(String),
    PutAutoCleanUp(bool),
    PutReservation(String),
    DeleteReservation,
    PutRepo(u32, Bytes),
    DeleteRepo(u32),
    DeleteRow,
}

/// Outcome of a single conditional row mutation at the store level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
pub enum RowStatus {
    Accepted,
    Rejected,
    /// The write's fate could not be reported. Test-injected only; the store
    /// itself never loses acknowledgements.
    Unknown,
}

pub(crate) struct StoreState {
    pub tablets: BTreeMap<Bytes, (TableId, Option<Bytes>, TabletRow)>,
    pub fate_rows: BTreeMap<Uuid, FateRow>,
    /// Extents whose next conditional mutation applies but reports Unknown.
    pub unknown_injections: HashSet<KeyExtent>,
}

/// In-memory metadata table. Rows are keyed `<table>;<end_row>` and sorted,
/// so scans see tablets in extent order.
#[derive(Clone)]
pub struct MetadataStore {
    pub(crate) state: Arc<Mutex<StoreState>>,
}

impl Default for MetadataStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MetadataStore {
    pub fn new() -> Self {
        MetadataStore {
            state: Arc::new(Mutex::new(StoreState {
                tablets: BTreeMap::new(),
                fate_rows: BTreeMap::new(),
                unknown_injections: HashSet::new(),
            })),
        }
    }

    /// Creates the initial tablets of a table from its split points,
    /// bypassing the conditional pipeline. Used at table bootstrap and by
    /// tests; everything after creation goes through the mutator.
    pub fn bootstrap_table(
        &self,
        table: &TableId,
        splits: &[Bytes],
        availability: TabletAvailability,
    ) {
        let mut state = self.state.lock();
        let mut prev: Option<Bytes> = None;
        let mut boundaries: Vec<Option<Bytes>> =
            splits.iter().cloned().map(Some).collect();
        boundaries.push(None);
        for end in boundaries {
            let extent = KeyExtent::new(table.clone(), end.clone(), prev.clone());
            let mut row = TabletRow::new(prev.clone());
            row.availability = availability;
            state
                .tablets
                .insert(extent.meta_row(), (table.clone(), end.clone(), row));
            prev = end;
        }
        trace!(%table, tablets = splits.len() + 1, "bootstrapped table");
    }

    /// Arms the next conditional mutation of `extent` to apply but report
    /// `Unknown`, modeling a lost acknowledgement.
    pub fn inject_unknown(&self, extent: KeyExtent) {
        self.state.lock().unknown_injections.insert(extent);
    }

    /// Conditionally mutates one user-fate row: all `requires` are checked
    /// against the row under the store lock, and `ops` apply only if every
    /// one of them holds.
    pub fn fate_mutate(&self, uuid: Uuid, requires: &[FateRequire], ops: &[FateOp]) -> RowStatus {
        let mut state = self.state.lock();
        let row = state.fate_rows.get(&uuid);

        for require in requires {
            let holds = match (require, row) {
                (FateRequire::RowAbsent, row) => row.is_none(),
                (FateRequire::RowPresent, row) => row.is_some(),
                (FateRequire::StatusIn(allowed), row) => {
                    let status = row.and_then(|r| r.status.as_ref());
                    match status {
                        None => allowed.is_empty(),
                        Some(status) => allowed.iter().any(|s| s == status),
                    }
                }
                (FateRequire::ReservationIs(expected), row) => {
                    row.and_then(|r| r.reservation.as_ref()) == expected.as_ref()
                }
                (FateRequire::RepoAbsent(position), row) => {
                    row.map_or(true, |r| !r.repos.contains_key(position))
                }
            };
            if !holds {
                return RowStatus::Rejected;
            }
        }

        if ops.iter().any(|op| matches!(op, FateOp::DeleteRow)) {
            state.fate_rows.remove(&uuid);
            return RowStatus::Accepted;
        }

        let row = state.fate_rows.entry(uuid).or_default();
        for op in ops {
            match op {
                FateOp::PutStatus(status) => row.status = Some(status.clone()),
                FateOp::PutCreated(created) => row.created = Some(*created),
                FateOp::PutName(name) => row.name = Some(name.clone()),
                FateOp::PutAutoCleanUp(auto) => row.auto_clean_up = *auto,
                FateOp::PutReservation(reservation) => {
                    row.reservation = Some(reservation.clone())
                }
                FateOp::DeleteReservation => row.reservation = None,
                FateOp::PutRepo(position, repo) => {
                    row.repos.insert(*position, repo.clone());
                }
                FateOp::DeleteRepo(position) => {
                    row.repos.remove(position);
                }
                FateOp::DeleteRow => unreachable!("handled above"),
            }
        }
        RowStatus::Accepted
    }

    pub fn fate_read(&self, uuid: Uuid) -> Option<FateRow> {
        self.state.lock().fate_rows.get(&uuid).cloned()
    }

    pub fn fate_list(&self) -> Vec<Uuid> {
        self.state.lock().fate_rows.keys().copied().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bootstrap_creates_partitioning_tablets() {
        let store = MetadataStore::new();
        let table = TableId::new("1a");
        store.bootstrap_table(
            &table,
            &[Bytes::from_static(b"g"), Bytes::from_static(b"p")],
            TabletAvailability::Hosted,
        );
        let state = store.state.lock();
        assert_eq!(state.tablets.len(), 3);
        let prevs: Vec<_> = state
            .tablets
            .values()
            .map(|(_, _, row)| row.prev_end_row.clone())
            .collect();
        assert_eq!(
            prevs,
            vec![None, Some(Bytes::from_static(b"g")), Some(Bytes::from_static(b"p"))]
        );
    }

    #[test]
    fn fate_requires_are_conjunctive() {
        let store = MetadataStore::new();
        let uuid = Uuid::new_v4();

        // status absent is required by passing no allowed statuses
        let status = store.fate_mutate(
            uuid,
            &[FateRequire::StatusIn(vec![])],
            &[FateOp::PutStatus("NEW".into())],
        );
        assert_eq!(status, RowStatus::Accepted);

        let status = store.fate_mutate(
            uuid,
            &[FateRequire::StatusIn(vec![])],
            &[FateOp::PutStatus("NEW".into())],
        );
        assert_eq!(status, RowStatus::Rejected);

        let status = store.fate_mutate(
            uuid,
            &[FateRequire::StatusIn(vec!["NEW".into(), "UNKNOWN".into()])],
            &[FateOp::PutStatus("SUBMITTED".into())],
        );
        assert_eq!(status, RowStatus::Accepted);
        assert_eq!(
            store.fate_read(uuid).unwrap().status.as_deref(),
            Some("SUBMITTED")
        );
    }

    #[test]
    fn fate_repo_positions_are_write_once() {
        let store = MetadataStore::new();
        let uuid = Uuid::new_v4();
        let put = |pos: u32| {
            store.fate_mutate(
                uuid,
                &[FateRequire::RepoAbsent(pos)],
                &[FateOp::PutRepo(pos, Bytes::from_static(b"step"))],
            )
        };
        assert_eq!(put(100), RowStatus::Accepted);
        assert_eq!(put(99), RowStatus::Accepted);
        assert_eq!(put(99), RowStatus::Rejected);
    }
}
