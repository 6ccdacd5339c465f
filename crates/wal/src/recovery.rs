// Copyright (c) 2023 - 2025 Tessera Contributors.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Recovery reads of closed logs. A raw log interleaves records of many
//! tablets in arrival order; resolution sorts them per tablet so recovery
//! can replay one tablet's mutations in sequence order and skip everything
//! a minor compaction already persisted.

use std::collections::HashMap;

use tracing::debug;

use tessera_types::{KeyExtent, Mutation, WalRef};

use crate::dfs::Dfs;
use crate::format::{read_frames, LogEvent};
use crate::Result;

/// Receives replayed mutations during recovery.
pub trait MutationSink: Send {
    fn receive(&mut self, mutation: Mutation);
}

impl<F: FnMut(Mutation) + Send> MutationSink for F {
    fn receive(&mut self, mutation: Mutation) {
        self(mutation)
    }
}

/// One log's records, grouped per tablet and ordered by sequence number:
/// the sorted artifact recovery actually reads.
#[derive(Debug)]
pub struct ResolvedSortedLog {
    wal: WalRef,
    /// Tablet definitions seen in this log.
    tablets: HashMap<KeyExtent, u64>,
    /// Per tablet-log-id, events sorted by sequence number.
    by_tablet: HashMap<u64, Vec<LogEvent>>,
}

impl ResolvedSortedLog {
    /// Reads and sorts one closed log. Tolerates a torn tail (crash during
    /// the final append).
    pub async fn resolve(wal: WalRef, dfs: &dyn Dfs) -> Result<ResolvedSortedLog> {
        let raw = dfs.read_all(&wal.path).await?;
        let events = read_frames(&wal.path, &raw)?;

        let mut tablets = HashMap::new();
        let mut by_tablet: HashMap<u64, Vec<LogEvent>> = HashMap::new();
        for event in events {
            if let LogEvent::DefineTablet {
                tablet_log_id,
                extent,
            } = &event
            {
                tablets.insert(extent.clone(), *tablet_log_id);
                continue;
            }
            by_tablet.entry(event.tablet_log_id()).or_default().push(event);
        }
        for events in by_tablet.values_mut() {
            events.sort_by_key(event_seq);
        }
        debug!(wal = %wal, tablets = tablets.len(), "resolved log for recovery");
        Ok(ResolvedSortedLog {
            wal,
            tablets,
            by_tablet,
        })
    }

    pub fn wal_ref(&self) -> &WalRef {
        &self.wal
    }

    fn events_for(&self, extent: &KeyExtent) -> &[LogEvent] {
        self.tablets
            .get(extent)
            .and_then(|id| self.by_tablet.get(id))
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }
}

fn event_seq(event: &LogEvent) -> u64 {
    match event {
        LogEvent::DefineTablet { .. } => 0,
        LogEvent::Mutations { seq, .. }
        | LogEvent::MinorCompactionStarted { seq, .. }
        | LogEvent::MinorCompactionFinished { seq, .. } => *seq,
    }
}

/// Replays one tablet's unrecovered mutations out of a set of resolved
/// logs. Both entry points are idempotent: they only consider mutations
/// newer than the last completed minor compaction.
pub struct SortedLogRecovery {
    logs: Vec<std::sync::Arc<ResolvedSortedLog>>,
}

impl SortedLogRecovery {
    pub fn new(logs: Vec<std::sync::Arc<ResolvedSortedLog>>) -> Self {
        SortedLogRecovery { logs }
    }

    /// The highest sequence number known to be safely persisted for
    /// `extent`: either a finished compaction, or a started one whose
    /// output file the tablet already references.
    fn recovered_floor(&self, extent: &KeyExtent, tablet_files: &[String]) -> u64 {
        let mut floor = 0;
        for log in &self.logs {
            for event in log.events_for(extent) {
                match event {
                    LogEvent::MinorCompactionFinished { seq, .. } => {
                        floor = floor.max(*seq);
                    }
                    LogEvent::MinorCompactionStarted { seq, file, .. }
                        if tablet_files.iter().any(|f| f == file) =>
                    {
                        floor = floor.max(*seq);
                    }
                    _ => {}
                }
            }
        }
        floor
    }

    pub fn needs_recovery(&self, extent: &KeyExtent) -> Result<bool> {
        let floor = self.recovered_floor(extent, &[]);
        for log in &self.logs {
            for event in log.events_for(extent) {
                if let LogEvent::Mutations { seq, .. } = event {
                    if *seq > floor {
                        return Ok(true);
                    }
                }
            }
        }
        Ok(false)
    }

    pub fn recover(
        &self,
        extent: &KeyExtent,
        tablet_files: &[String],
        sink: &mut dyn MutationSink,
    ) -> Result<()> {
        let floor = self.recovered_floor(extent, tablet_files);

        // merge all logs' mutation batches in sequence order
        let mut batches: Vec<(u64, &Vec<Mutation>)> = Vec::new();
        for log in &self.logs {
            for event in log.events_for(extent) {
                if let LogEvent::Mutations { seq, mutations, .. } = event {
                    if *seq > floor {
                        batches.push((*seq, mutations));
                    }
                }
            }
        }
        batches.sort_by_key(|(seq, _)| *seq);

        let mut replayed = 0usize;
        for (_, mutations) in batches {
            for mutation in mutations {
                sink.receive(mutation.clone());
                replayed += 1;
            }
        }
        debug!(%extent, replayed, floor, "log recovery replayed mutations");
        Ok(())
    }
}
