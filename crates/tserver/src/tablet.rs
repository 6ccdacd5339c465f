// Copyright (c) 2023 - 2025 Tessera Contributors.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! One hosted tablet: the in-memory sorted map for recent writes, frozen
//! file contents from minor compactions and bulk imports, commit sessions,
//! and the invariants tying them together. A mutation that enters a commit
//! session is either applied and durably logged, or reported failed; there
//! is no partial state.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use bytestring::ByteString;
use parking_lot::Mutex;
use tracing::debug;

use tessera_types::visibility::VisibilityEvaluator;
use tessera_types::{
    ColumnUpdate, Durability, Key, KeyExtent, MetadataTime, Mutation, StoredFile, WalRef,
};
use tessera_wal::LogParticipant;

use crate::constraints::{Constraint, ConstraintEnv, Violation};

/// Publishes log-to-tablet associations into tablet metadata. Implemented by
/// the tablet server against the metadata table.
#[async_trait::async_trait]
pub trait WalPublisher: Send + Sync {
    async fn publish(&self, extent: &KeyExtent, wal: &WalRef) -> anyhow::Result<()>;
}

struct TabletMemory {
    memory: BTreeMap<Key, Option<Bytes>>,
    /// Frozen contents of files written by minor compactions or placed by
    /// bulk imports. The file format itself lives outside the core; these
    /// maps stand in for reading those files back.
    file_data: BTreeMap<ByteString, BTreeMap<Key, Option<Bytes>>>,
    files: Vec<StoredFile>,
    time: MetadataTime,
    /// Write-ahead-log sequence, bumped per commit session and compaction.
    seq: u64,
    flush_id: u64,
}

/// A hosted tablet.
pub struct Tablet {
    extent: KeyExtent,
    tablet_log_id: u64,
    default_durability: Durability,
    closed: AtomicBool,
    state: Mutex<TabletMemory>,
    /// Log generation this tablet has written its definition record into.
    defined_log: Mutex<Option<u32>>,
    wal_publisher: Arc<dyn WalPublisher>,
}

/// Outcome of preparing a mutation batch for commit.
pub struct PreparedMutations {
    pub commit_session: Option<Arc<CommitSession>>,
    pub non_violators: Vec<Mutation>,
    pub violators: Vec<(Mutation, Vec<Violation>)>,
    pub tablet_closed: bool,
}

impl PreparedMutations {
    fn closed() -> Self {
        PreparedMutations {
            commit_session: None,
            non_violators: Vec::new(),
            violators: Vec::new(),
            tablet_closed: true,
        }
    }
}

impl Tablet {
    pub fn new(
        extent: KeyExtent,
        tablet_log_id: u64,
        time: MetadataTime,
        default_durability: Durability,
        files: Vec<StoredFile>,
        wal_publisher: Arc<dyn WalPublisher>,
    ) -> Arc<Tablet> {
        Arc::new(Tablet {
            extent,
            tablet_log_id,
            default_durability,
            closed: AtomicBool::new(false),
            state: Mutex::new(TabletMemory {
                memory: BTreeMap::new(),
                file_data: BTreeMap::new(),
                files,
                time,
                seq: 0,
                flush_id: 0,
            }),
            defined_log: Mutex::new(None),
            wal_publisher,
        })
    }

    pub fn extent(&self) -> &KeyExtent {
        &self.extent
    }

    pub fn default_durability(&self) -> Durability {
        self.default_durability
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Closes the tablet: no further commit sessions are handed out.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }

    pub fn files(&self) -> Vec<StoredFile> {
        self.state.lock().files.clone()
    }

    pub fn set_files(&self, files: Vec<StoredFile>) {
        self.state.lock().files = files;
    }

    pub fn flush_id(&self) -> u64 {
        self.state.lock().flush_id
    }

    pub fn time(&self) -> MetadataTime {
        self.state.lock().time
    }

    /// Runs constraints and opens a commit session for the survivors.
    pub fn prepare_mutations_for_commit(
        self: &Arc<Self>,
        env: &ConstraintEnv,
        mutations: Vec<Mutation>,
        constraints: &[Arc<dyn Constraint>],
    ) -> PreparedMutations {
        if self.is_closed() {
            return PreparedMutations::closed();
        }

        let mut non_violators = Vec::with_capacity(mutations.len());
        let mut violators = Vec::new();
        for mutation in mutations {
            let violations: Vec<Violation> = constraints
                .iter()
                .flat_map(|c| c.check(env, &mutation))
                .collect();
            if violations.is_empty() {
                non_violators.push(mutation);
            } else {
                violators.push((mutation, violations));
            }
        }

        let commit_session = if non_violators.is_empty() {
            None
        } else {
            let wal_seq = {
                let mut state = self.state.lock();
                state.seq += 1;
                state.seq
            };
            Some(Arc::new(CommitSession {
                tablet: Arc::clone(self),
                wal_seq,
            }))
        };

        PreparedMutations {
            commit_session,
            non_violators,
            violators,
            tablet_closed: false,
        }
    }

    fn next_timestamp(state: &mut TabletMemory) -> i64 {
        match &mut state.time {
            MetadataTime::Logical(counter) => {
                *counter += 1;
                *counter as i64
            }
            MetadataTime::Millis(high_water) => {
                let now = std::time::SystemTime::now()
                    .duration_since(std::time::UNIX_EPOCH)
                    .expect("clock after epoch")
                    .as_millis() as u64;
                *high_water = (*high_water + 1).max(now);
                *high_water as i64
            }
        }
    }

    fn apply(&self, mutations: &[Mutation]) {
        let mut state = self.state.lock();
        for mutation in mutations {
            let timestamp = Self::next_timestamp(&mut state);
            for update in mutation.updates() {
                let ColumnUpdate {
                    family,
                    qualifier,
                    visibility,
                    timestamp: explicit,
                    value,
                } = update;
                let key = Key {
                    row: mutation.row().clone(),
                    family: family.clone(),
                    qualifier: qualifier.clone(),
                    visibility: visibility.clone(),
                    timestamp: explicit.unwrap_or(timestamp),
                };
                state.memory.insert(key, value.clone());
            }
        }
    }

    /// Freezes the in-memory data into `file`, recording the new flush id.
    /// Returns false when there was nothing to flush (the flush id still
    /// advances).
    pub fn minor_compact_into(&self, file: &StoredFile, flush_id: u64) -> bool {
        let mut state = self.state.lock();
        state.flush_id = state.flush_id.max(flush_id);
        if state.memory.is_empty() {
            return false;
        }
        let frozen = std::mem::take(&mut state.memory);
        state.file_data.insert(file.path.clone(), frozen);
        state.files.push(file.clone());
        debug!(extent = %self.extent, file = %file.path, "minor compaction");
        true
    }

    /// Registers bulk-loaded file contents.
    pub fn add_bulk_file(&self, file: StoredFile, contents: BTreeMap<Key, Option<Bytes>>) {
        let mut state = self.state.lock();
        state.file_data.insert(file.path.clone(), contents);
        state.files.push(file);
    }

    /// Reserves the next write-ahead-log sequence (used for compaction
    /// records).
    pub fn next_wal_seq(&self) -> u64 {
        let mut state = self.state.lock();
        state.seq += 1;
        state.seq
    }

    /// The newest visible cell for one column coordinate. With `timestamp`
    /// set, only a version at exactly that timestamp counts.
    pub fn lookup(
        &self,
        row: &Bytes,
        family: &Bytes,
        qualifier: &Bytes,
        visibility: &Bytes,
        timestamp: Option<i64>,
        evaluator: &VisibilityEvaluator,
    ) -> Option<Bytes> {
        if !evaluator.can_access(visibility).unwrap_or(false) {
            return None;
        }
        let state = self.state.lock();
        let mut newest: Option<(i64, Option<Bytes>)> = None;
        let mut consider = |key: &Key, value: &Option<Bytes>| {
            if key.row != *row
                || key.family != *family
                || key.qualifier != *qualifier
                || key.visibility != *visibility
            {
                return;
            }
            if let Some(wanted) = timestamp {
                if key.timestamp != wanted {
                    return;
                }
            }
            if newest.as_ref().is_none_or(|(ts, _)| key.timestamp > *ts) {
                newest = Some((key.timestamp, value.clone()));
            }
        };
        for (key, value) in &state.memory {
            consider(key, value);
        }
        for file in state.file_data.values() {
            for (key, value) in file {
                consider(key, value);
            }
        }
        newest.and_then(|(_, value)| value)
    }

    /// Every visible cell of one row, newest version per column, for the
    /// given authorizations.
    pub fn scan_row(&self, row: &Bytes, evaluator: &VisibilityEvaluator) -> Vec<(Key, Bytes)> {
        self.scan(Some(row), evaluator)
    }

    /// Every visible cell of the tablet.
    pub fn scan_all(&self, evaluator: &VisibilityEvaluator) -> Vec<(Key, Bytes)> {
        self.scan(None, evaluator)
    }

    fn scan(&self, row: Option<&Bytes>, evaluator: &VisibilityEvaluator) -> Vec<(Key, Bytes)> {
        let state = self.state.lock();
        // merge memory and files; Key sorts newest-first within a column
        let mut merged: BTreeMap<Key, Option<Bytes>> = BTreeMap::new();
        let mut absorb = |source: &BTreeMap<Key, Option<Bytes>>| {
            for (key, value) in source {
                if row.is_some_and(|r| key.row != *r) {
                    continue;
                }
                merged.entry(key.clone()).or_insert_with(|| value.clone());
            }
        };
        absorb(&state.memory);
        for file in state.file_data.values() {
            absorb(file);
        }

        let mut result = Vec::new();
        let mut last_column: Option<(Bytes, Bytes, Bytes, Bytes)> = None;
        for (key, value) in merged {
            let column = (
                key.row.clone(),
                key.family.clone(),
                key.qualifier.clone(),
                key.visibility.clone(),
            );
            if last_column.as_ref() == Some(&column) {
                continue;
            }
            last_column = Some(column);
            if !evaluator.can_access(&key.visibility).unwrap_or(false) {
                continue;
            }
            if let Some(value) = value {
                result.push((key, value));
            }
        }
        result
    }
}

/// Write access to one tablet granted by
/// [`Tablet::prepare_mutations_for_commit`]. Commits apply in the order
/// sessions were granted; the session doubles as the tablet's party to the
/// write-ahead log.
pub struct CommitSession {
    tablet: Arc<Tablet>,
    wal_seq: u64,
}

impl CommitSession {
    /// A session for log records not tied to a mutation batch (compaction
    /// markers, unload flushes).
    pub(crate) fn for_seq(tablet: Arc<Tablet>, wal_seq: u64) -> Arc<CommitSession> {
        Arc::new(CommitSession { tablet, wal_seq })
    }

    pub fn wal_seq(&self) -> u64 {
        self.wal_seq
    }

    pub fn tablet(&self) -> &Arc<Tablet> {
        &self.tablet
    }

    /// Merges the mutations into the tablet's in-memory data. Durability
    /// must already be established at the caller's chosen level.
    pub fn commit(&self, mutations: &[Mutation]) {
        self.tablet.apply(mutations);
    }
}

#[async_trait::async_trait]
impl LogParticipant for CommitSession {
    fn extent(&self) -> &KeyExtent {
        self.tablet.extent()
    }

    fn tablet_log_id(&self) -> u64 {
        self.tablet.tablet_log_id
    }

    fn begin_defining(&self, log_seq: u32) -> bool {
        *self.tablet.defined_log.lock() != Some(log_seq)
    }

    fn finish_defining(&self, log_seq: u32, defined: bool) {
        if defined {
            *self.tablet.defined_log.lock() = Some(log_seq);
        }
    }

    async fn publish_log_association(&self, wal: &WalRef) -> anyhow::Result<()> {
        self.tablet
            .wal_publisher
            .publish(self.tablet.extent(), wal)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tessera_types::TableId;

    struct NoopPublisher;

    #[async_trait::async_trait]
    impl WalPublisher for NoopPublisher {
        async fn publish(&self, _extent: &KeyExtent, _wal: &WalRef) -> anyhow::Result<()> {
            Ok(())
        }
    }

    fn tablet() -> Arc<Tablet> {
        Tablet::new(
            KeyExtent::whole_table(TableId::new("1a")),
            1,
            MetadataTime::Logical(0),
            Durability::Sync,
            Vec::new(),
            Arc::new(NoopPublisher),
        )
    }

    fn everyone() -> VisibilityEvaluator {
        VisibilityEvaluator::new(Vec::<Vec<u8>>::new())
    }

    #[test]
    fn committed_mutations_are_visible() {
        let tablet = tablet();
        let env = ConstraintEnv::new(Vec::new());
        let mutation = Mutation::new(&b"r1"[..]).put(&b"f"[..], &b"q"[..], &b"v1"[..]);

        let prepared = tablet.prepare_mutations_for_commit(&env, vec![mutation], &[]);
        assert!(!prepared.tablet_closed);
        let session = prepared.commit_session.expect("session granted");
        session.commit(&prepared.non_violators);

        let value = tablet.lookup(
            &Bytes::from_static(b"r1"),
            &Bytes::from_static(b"f"),
            &Bytes::from_static(b"q"),
            &Bytes::new(),
            None,
            &everyone(),
        );
        assert_eq!(value, Some(Bytes::from_static(b"v1")));
    }

    #[test]
    fn newest_version_wins_and_deletes_hide() {
        let tablet = tablet();
        let env = ConstraintEnv::new(Vec::new());
        let put = Mutation::new(&b"r"[..]).put(&b"f"[..], &b"q"[..], &b"old"[..]);
        let overwrite = Mutation::new(&b"r"[..]).put(&b"f"[..], &b"q"[..], &b"new"[..]);
        let delete = Mutation::new(&b"r"[..]).delete(&b"f"[..], &b"q"[..]);

        for mutation in [put, overwrite] {
            let prepared = tablet.prepare_mutations_for_commit(&env, vec![mutation], &[]);
            prepared
                .commit_session
                .unwrap()
                .commit(&prepared.non_violators);
        }
        let row = Bytes::from_static(b"r");
        assert_eq!(
            tablet.lookup(
                &row,
                &Bytes::from_static(b"f"),
                &Bytes::from_static(b"q"),
                &Bytes::new(),
                None,
                &everyone()
            ),
            Some(Bytes::from_static(b"new"))
        );

        let prepared = tablet.prepare_mutations_for_commit(&env, vec![delete], &[]);
        prepared
            .commit_session
            .unwrap()
            .commit(&prepared.non_violators);
        assert_eq!(
            tablet.lookup(
                &row,
                &Bytes::from_static(b"f"),
                &Bytes::from_static(b"q"),
                &Bytes::new(),
                None,
                &everyone()
            ),
            None
        );
    }

    #[test]
    fn closed_tablet_grants_no_sessions() {
        let tablet = tablet();
        tablet.close();
        let prepared = tablet.prepare_mutations_for_commit(
            &ConstraintEnv::new(Vec::new()),
            vec![Mutation::new(&b"r"[..]).put(&b"f"[..], &b"q"[..], &b"v"[..])],
            &[],
        );
        assert!(prepared.tablet_closed);
        assert!(prepared.commit_session.is_none());
    }

    #[test]
    fn minor_compaction_keeps_data_readable() {
        let tablet = tablet();
        let env = ConstraintEnv::new(Vec::new());
        let mutation = Mutation::new(&b"r"[..]).put(&b"f"[..], &b"q"[..], &b"v"[..]);
        let prepared = tablet.prepare_mutations_for_commit(&env, vec![mutation], &[]);
        prepared
            .commit_session
            .unwrap()
            .commit(&prepared.non_violators);

        assert!(tablet.minor_compact_into(&StoredFile::new("/t/1a/f1.rf"), 1));
        assert_eq!(tablet.flush_id(), 1);
        assert_eq!(tablet.files().len(), 1);
        assert_eq!(tablet.scan_all(&everyone()).len(), 1);

        // nothing left in memory: flushing again is a no-op
        assert!(!tablet.minor_compact_into(&StoredFile::new("/t/1a/f2.rf"), 2));
        assert_eq!(tablet.flush_id(), 2);
    }

    #[test]
    fn scan_respects_visibility() {
        let tablet = tablet();
        let env = ConstraintEnv::new(vec![Bytes::from_static(b"secret")]);
        let mutation = Mutation::new(&b"r"[..]).put_visible(
            &b"f"[..],
            &b"q"[..],
            &b"secret"[..],
            &b"v"[..],
        );
        let prepared = tablet.prepare_mutations_for_commit(&env, vec![mutation], &[]);
        prepared
            .commit_session
            .unwrap()
            .commit(&prepared.non_violators);

        assert!(tablet.scan_all(&everyone()).is_empty());
        let cleared = VisibilityEvaluator::new([&b"secret"[..]]);
        assert_eq!(tablet.scan_all(&cleared).len(), 1);
    }
}
