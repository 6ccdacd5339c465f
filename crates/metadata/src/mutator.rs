// Copyright (c) 2023 - 2025 Tessera Contributors.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Conditional tablet mutations: the only write path to tablet metadata.
//!
//! A batch is built one tablet at a time; each tablet's requirements are
//! checked and its writes applied atomically under the store lock. Nothing
//! here is atomic across tablets.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use bytes::Bytes;
use tracing::{debug, trace};

use tessera_types::{
    ColumnSet, ColumnType, FateId, KeyExtent, MetadataTime, OperationId, StoredFile, Suspension,
    TServerInstance, TabletAvailability, TabletMergeability, TabletMetadata, WalRef,
};

use crate::store::{MetadataStore, TabletRow};

#[derive(Debug, Clone)]
enum Require {
    AbsentOperation,
    Operation(OperationId),
    AbsentLocation,
    CurrentLocation(TServerInstance),
    FutureLocation(TServerInstance),
    Availability(TabletAvailability),
    AbsentTablet,
    AbsentLoaded(StoredFile),
    Same(Box<TabletMetadata>, ColumnSet),
}

#[derive(Debug, Clone)]
enum Op {
    PutFile(StoredFile),
    DeleteFile(StoredFile),
    PutLoaded(StoredFile, FateId),
    DeleteLoaded(StoredFile),
    PutCurrent(TServerInstance),
    DeleteCurrent(TServerInstance),
    PutFuture(TServerInstance),
    DeleteFuture(TServerInstance),
    PutLast(TServerInstance),
    PutSuspension(Suspension),
    DeleteSuspension,
    PutWal(WalRef),
    DeleteWal(WalRef),
    PutOperation(OperationId),
    DeleteOperation,
    PutAvailability(TabletAvailability),
    SetHostingRequested,
    DeleteHostingRequested,
    PutFlushId(u64),
    PutTime(MetadataTime),
    PutMergeability(TabletMergeability),
    PutMigration(TServerInstance),
    DeleteMigration,
    CreateTablet { prev_end_row: Option<Bytes> },
    DeleteTablet,
}

type RejectionHandler = Arc<dyn Fn(&TabletMetadata) -> bool + Send + Sync>;

struct PendingMutation {
    extent: KeyExtent,
    requires: Vec<Require>,
    ops: Vec<Op>,
    /// Re-checked against a fresh read when the raw outcome is rejected or
    /// unknown; a pass means the intended state is in place and the mutation
    /// reports `Accepted`.
    accepted_when: RejectionHandler,
    description: String,
}

/// Status of one conditional tablet mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
pub enum ConditionalStatus {
    Accepted,
    Rejected,
    Unknown,
}

/// Outcome of one conditional tablet mutation, with the row as it looked
/// when the mutation was not accepted outright.
#[derive(Debug, Clone)]
pub struct ConditionalResult {
    pub extent: KeyExtent,
    pub status: ConditionalStatus,
    read_metadata: Option<TabletMetadata>,
}

impl ConditionalResult {
    /// The row observed when diagnosing a rejection, if the row existed.
    pub fn read_metadata(&self) -> Option<&TabletMetadata> {
        self.read_metadata.as_ref()
    }
}

/// Batch builder for conditional mutations across tablets.
pub struct ConditionalTabletsMutator {
    store: MetadataStore,
    pending: Vec<PendingMutation>,
}

impl ConditionalTabletsMutator {
    pub(crate) fn new(store: MetadataStore) -> Self {
        ConditionalTabletsMutator {
            store,
            pending: Vec::new(),
        }
    }

    pub fn mutate_tablet(&mut self, extent: KeyExtent) -> ConditionalTabletMutator<'_> {
        ConditionalTabletMutator {
            parent: self,
            extent,
            requires: Vec::new(),
            ops: Vec::new(),
        }
    }

    /// Runs the batch. Each tablet's mutation is atomic; the batch as a
    /// whole is not.
    pub fn process(self) -> BTreeMap<KeyExtent, ConditionalResult> {
        let mut results = BTreeMap::new();
        for pending in self.pending {
            let result = self.store.apply_conditional(&pending);
            trace!(
                extent = %result.extent,
                status = %result.status,
                description = %pending.description,
                "conditional tablet mutation"
            );
            if result.status == ConditionalStatus::Rejected {
                debug!(
                    extent = %result.extent,
                    description = %pending.description,
                    "conditional tablet mutation rejected"
                );
            }
            results.insert(result.extent.clone(), result);
        }
        results
    }
}

/// Builder for a single tablet's conditional mutation.
///
/// Every mutation must either require the absence of an operation, require a
/// specific operation, or itself set or clear the operation column; this is
/// how exclusive multi-step operations keep everyone else's hands off a
/// tablet.
pub struct ConditionalTabletMutator<'a> {
    parent: &'a mut ConditionalTabletsMutator,
    extent: KeyExtent,
    requires: Vec<Require>,
    ops: Vec<Op>,
}

impl<'a> ConditionalTabletMutator<'a> {
    pub fn require_absent_operation(mut self) -> Self {
        self.requires.push(Require::AbsentOperation);
        self
    }

    pub fn require_operation(mut self, operation: OperationId) -> Self {
        self.requires.push(Require::Operation(operation));
        self
    }

    pub fn require_absent_location(mut self) -> Self {
        self.requires.push(Require::AbsentLocation);
        self
    }

    pub fn require_current_location(mut self, server: TServerInstance) -> Self {
        self.requires.push(Require::CurrentLocation(server));
        self
    }

    pub fn require_future_location(mut self, server: TServerInstance) -> Self {
        self.requires.push(Require::FutureLocation(server));
        self
    }

    pub fn require_availability(mut self, availability: TabletAvailability) -> Self {
        self.requires.push(Require::Availability(availability));
        self
    }

    pub fn require_absent_tablet(mut self) -> Self {
        self.requires.push(Require::AbsentTablet);
        self
    }

    pub fn require_absent_loaded(mut self, file: StoredFile) -> Self {
        self.requires.push(Require::AbsentLoaded(file));
        self
    }

    /// Requires the listed columns to be unchanged from `snapshot`.
    pub fn require_same(mut self, snapshot: &TabletMetadata, columns: &[ColumnType]) -> Self {
        self.requires.push(Require::Same(
            Box::new(snapshot.clone()),
            ColumnSet::of(columns),
        ));
        self
    }

    pub fn put_file(mut self, file: StoredFile) -> Self {
        self.ops.push(Op::PutFile(file));
        self
    }

    pub fn delete_file(mut self, file: StoredFile) -> Self {
        self.ops.push(Op::DeleteFile(file));
        self
    }

    pub fn put_loaded(mut self, file: StoredFile, fate_id: FateId) -> Self {
        self.ops.push(Op::PutLoaded(file, fate_id));
        self
    }

    pub fn delete_loaded(mut self, file: StoredFile) -> Self {
        self.ops.push(Op::DeleteLoaded(file));
        self
    }

    pub fn put_current_location(mut self, server: TServerInstance) -> Self {
        self.ops.push(Op::PutCurrent(server));
        self
    }

    pub fn delete_current_location(mut self, server: TServerInstance) -> Self {
        self.ops.push(Op::DeleteCurrent(server));
        self
    }

    pub fn put_future_location(mut self, server: TServerInstance) -> Self {
        self.ops.push(Op::PutFuture(server));
        self
    }

    pub fn delete_future_location(mut self, server: TServerInstance) -> Self {
        self.ops.push(Op::DeleteFuture(server));
        self
    }

    pub fn put_last_location(mut self, server: TServerInstance) -> Self {
        self.ops.push(Op::PutLast(server));
        self
    }

    pub fn put_suspension(mut self, suspension: Suspension) -> Self {
        self.ops.push(Op::PutSuspension(suspension));
        self
    }

    pub fn delete_suspension(mut self) -> Self {
        self.ops.push(Op::DeleteSuspension);
        self
    }

    pub fn put_wal(mut self, wal: WalRef) -> Self {
        self.ops.push(Op::PutWal(wal));
        self
    }

    pub fn delete_wal(mut self, wal: WalRef) -> Self {
        self.ops.push(Op::DeleteWal(wal));
        self
    }

    pub fn put_operation(mut self, operation: OperationId) -> Self {
        self.ops.push(Op::PutOperation(operation));
        self
    }

    pub fn delete_operation(mut self) -> Self {
        self.ops.push(Op::DeleteOperation);
        self
    }

    pub fn put_availability(mut self, availability: TabletAvailability) -> Self {
        self.ops.push(Op::PutAvailability(availability));
        self
    }

    pub fn set_hosting_requested(mut self) -> Self {
        self.ops.push(Op::SetHostingRequested);
        self
    }

    pub fn delete_hosting_requested(mut self) -> Self {
        self.ops.push(Op::DeleteHostingRequested);
        self
    }

    pub fn put_flush_id(mut self, flush_id: u64) -> Self {
        self.ops.push(Op::PutFlushId(flush_id));
        self
    }

    pub fn put_time(mut self, time: MetadataTime) -> Self {
        self.ops.push(Op::PutTime(time));
        self
    }

    pub fn put_mergeability(mut self, mergeability: TabletMergeability) -> Self {
        self.ops.push(Op::PutMergeability(mergeability));
        self
    }

    pub fn put_migration(mut self, server: TServerInstance) -> Self {
        self.ops.push(Op::PutMigration(server));
        self
    }

    pub fn delete_migration(mut self) -> Self {
        self.ops.push(Op::DeleteMigration);
        self
    }

    /// Creates the tablet row; pair with `require_absent_tablet`.
    pub fn create_tablet(mut self) -> Self {
        let prev_end_row = self.extent.prev_end_row().map(Bytes::copy_from_slice);
        self.ops.push(Op::CreateTablet { prev_end_row });
        self
    }

    pub fn delete_tablet(mut self) -> Self {
        self.ops.push(Op::DeleteTablet);
        self
    }

    /// Queues the mutation. `accepted_when` resolves rejected/unknown
    /// outcomes by inspecting a fresh read; `description` labels the
    /// mutation in logs.
    pub fn submit(
        self,
        accepted_when: impl Fn(&TabletMetadata) -> bool + Send + Sync + 'static,
        description: impl Into<String>,
    ) {
        let guards_operation = self.requires.iter().any(|require| {
            matches!(
                require,
                Require::AbsentOperation | Require::Operation(_) | Require::AbsentTablet
            )
        }) || self
            .ops
            .iter()
            .any(|op| matches!(op, Op::PutOperation(_) | Op::DeleteOperation));
        assert!(
            guards_operation,
            "conditional mutation on {} must guard the operation column",
            self.extent
        );

        self.parent.pending.push(PendingMutation {
            extent: self.extent,
            requires: self.requires,
            ops: self.ops,
            accepted_when: Arc::new(accepted_when),
            description: description.into(),
        });
    }
}

impl MetadataStore {
    pub(crate) fn conditional_mutator(&self) -> ConditionalTabletsMutator {
        ConditionalTabletsMutator::new(self.clone())
    }

    fn same_columns(row: &TabletRow, snapshot: &TabletMetadata, columns: ColumnSet) -> bool {
        let mut same = true;
        if columns.contains(ColumnType::Files) {
            same &= row.files == *snapshot.files();
        }
        if columns.contains(ColumnType::Loaded) {
            same &= row.loaded == *snapshot.loaded();
        }
        if columns.contains(ColumnType::Location) {
            same &= row.current.as_ref() == snapshot.current()
                && row.future.as_ref() == snapshot.future();
        }
        if columns.contains(ColumnType::Last) {
            same &= row.last.as_ref() == snapshot.last();
        }
        if columns.contains(ColumnType::Suspend) {
            same &= row.suspend.as_ref() == snapshot.suspend();
        }
        if columns.contains(ColumnType::Logs) {
            let mine: BTreeSet<_> = row.logs.iter().collect();
            let theirs: BTreeSet<_> = snapshot.logs().iter().collect();
            same &= mine == theirs;
        }
        if columns.contains(ColumnType::OpId) {
            same &= row.operation.as_ref() == snapshot.operation_id();
        }
        if columns.contains(ColumnType::Availability) {
            same &= row.availability == snapshot.availability();
        }
        if columns.contains(ColumnType::HostingRequested) {
            same &= row.hosting_requested == snapshot.hosting_requested();
        }
        if columns.contains(ColumnType::FlushId) {
            same &= row.flush_id == snapshot.flush_id();
        }
        if columns.contains(ColumnType::Time) {
            same &= row.time == *snapshot.time();
        }
        if columns.contains(ColumnType::Mergeability) {
            same &= row.mergeability == snapshot.mergeability();
        }
        if columns.contains(ColumnType::Migration) {
            same &= row.migration.as_ref() == snapshot.migration();
        }
        same
    }

    fn requires_hold(row: Option<&TabletRow>, requires: &[Require]) -> bool {
        requires.iter().all(|require| match (require, row) {
            (Require::AbsentTablet, row) => row.is_none(),
            (_, None) => false,
            (Require::AbsentOperation, Some(row)) => row.operation.is_none(),
            (Require::Operation(operation), Some(row)) => {
                row.operation.as_ref() == Some(operation)
            }
            (Require::AbsentLocation, Some(row)) => {
                row.current.is_none() && row.future.is_none()
            }
            (Require::CurrentLocation(server), Some(row)) => {
                row.current.as_ref() == Some(server)
            }
            (Require::FutureLocation(server), Some(row)) => {
                row.future.as_ref() == Some(server)
            }
            (Require::Availability(availability), Some(row)) => {
                row.availability == *availability
            }
            (Require::AbsentLoaded(file), Some(row)) => !row.loaded.contains_key(file),
            (Require::Same(snapshot, columns), Some(row)) => {
                Self::same_columns(row, snapshot, *columns)
            }
        })
    }

    fn apply_ops(row: &mut TabletRow, ops: &[Op]) {
        for op in ops {
            match op {
                Op::PutFile(file) => {
                    row.files.insert(file.clone());
                }
                Op::DeleteFile(file) => {
                    row.files.remove(file);
                }
                Op::PutLoaded(file, fate_id) => {
                    row.loaded.insert(file.clone(), *fate_id);
                }
                Op::DeleteLoaded(file) => {
                    row.loaded.remove(file);
                }
                Op::PutCurrent(server) => row.current = Some(server.clone()),
                Op::DeleteCurrent(server) => {
                    if row.current.as_ref() == Some(server) {
                        row.current = None;
                    }
                }
                Op::PutFuture(server) => row.future = Some(server.clone()),
                Op::DeleteFuture(server) => {
                    if row.future.as_ref() == Some(server) {
                        row.future = None;
                    }
                }
                Op::PutLast(server) => row.last = Some(server.clone()),
                Op::PutSuspension(suspension) => row.suspend = Some(suspension.clone()),
                Op::DeleteSuspension => row.suspend = None,
                Op::PutWal(wal) => {
                    if !row.logs.contains(wal) {
                        row.logs.push(wal.clone());
                    }
                }
                Op::DeleteWal(wal) => row.logs.retain(|existing| existing != wal),
                Op::PutOperation(operation) => row.operation = Some(operation.clone()),
                Op::DeleteOperation => row.operation = None,
                Op::PutAvailability(availability) => row.availability = *availability,
                Op::SetHostingRequested => row.hosting_requested = true,
                Op::DeleteHostingRequested => row.hosting_requested = false,
                Op::PutFlushId(flush_id) => row.flush_id = Some(*flush_id),
                Op::PutTime(time) => row.time = *time,
                Op::PutMergeability(mergeability) => row.mergeability = *mergeability,
                Op::PutMigration(server) => row.migration = Some(server.clone()),
                Op::DeleteMigration => row.migration = None,
                Op::CreateTablet { .. } | Op::DeleteTablet => {}
            }
        }
    }

    fn apply_conditional(&self, pending: &PendingMutation) -> ConditionalResult {
        let extent = &pending.extent;
        let meta_row = extent.meta_row();

        let raw_status = {
            let mut state = self.state.lock();

            // a row whose prev-end-row no longer matches belongs to a
            // different tablet (split or merge won); treat it as absent
            let row_matches = state.tablets.get(&meta_row).is_some_and(|(_, _, row)| {
                row.prev_end_row.as_deref() == extent.prev_end_row()
            });
            let row = if row_matches {
                state.tablets.get(&meta_row).map(|(_, _, row)| row)
            } else {
                None
            };

            if !Self::requires_hold(row, &pending.requires) {
                ConditionalStatus::Rejected
            } else {
                let creates = pending
                    .ops
                    .iter()
                    .any(|op| matches!(op, Op::CreateTablet { .. }));
                let deletes = pending.ops.iter().any(|op| matches!(op, Op::DeleteTablet));

                if deletes {
                    state.tablets.remove(&meta_row);
                } else {
                    if creates && !row_matches {
                        state.tablets.insert(
                            meta_row.clone(),
                            (
                                extent.table().clone(),
                                extent.end_row().map(Bytes::copy_from_slice),
                                TabletRow::new(
                                    extent.prev_end_row().map(Bytes::copy_from_slice),
                                ),
                            ),
                        );
                    }
                    if let Some((_, _, row)) = state.tablets.get_mut(&meta_row) {
                        Self::apply_ops(row, &pending.ops);
                    }
                }

                if state.unknown_injections.remove(extent) {
                    ConditionalStatus::Unknown
                } else {
                    ConditionalStatus::Accepted
                }
            }
        };

        match raw_status {
            ConditionalStatus::Accepted => ConditionalResult {
                extent: extent.clone(),
                status: ConditionalStatus::Accepted,
                read_metadata: None,
            },
            status => {
                // resolve by re-reading: the intended state may already be in
                // place, either from this write (unknown) or a prior attempt
                let fresh = self.read_tablet_metadata(extent, ColumnSet::ALL);
                let resolved = match &fresh {
                    Some(tm) if (pending.accepted_when)(tm) => ConditionalStatus::Accepted,
                    _ => status,
                };
                ConditionalResult {
                    extent: extent.clone(),
                    status: resolved,
                    read_metadata: fresh,
                }
            }
        }
    }

    pub(crate) fn read_tablet_metadata(
        &self,
        extent: &KeyExtent,
        columns: ColumnSet,
    ) -> Option<TabletMetadata> {
        let state = self.state.lock();
        let (_, _, row) = state.tablets.get(&extent.meta_row())?;
        if row.prev_end_row.as_deref() != extent.prev_end_row() {
            return None;
        }
        Some(row.to_metadata(extent.clone(), columns))
    }
}
