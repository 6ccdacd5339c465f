// Copyright (c) 2023 - 2025 Tessera Contributors.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

use bytes::Bytes;

use tessera_types::{ColumnSet, DataLevel, KeyExtent, TableId, TabletMetadata};

use crate::mutator::ConditionalTabletsMutator;
use crate::store::MetadataStore;

/// Typed access to tablet metadata. One implementation reads the real store;
/// tests fake it by building scans from canned snapshots.
pub trait Ample: Send + Sync {
    /// One tablet's metadata, or `None` if no tablet with exactly this
    /// extent exists.
    fn read_tablet(&self, extent: &KeyExtent, columns: ColumnSet) -> Option<TabletMetadata>;

    /// Scan builder over many tablets.
    fn read_tablets(&self) -> TabletsMetadataBuilder;

    /// Batch builder for conditional mutations.
    fn conditionally_mutate_tablets(&self) -> ConditionalTabletsMutator;
}

impl Ample for MetadataStore {
    fn read_tablet(&self, extent: &KeyExtent, columns: ColumnSet) -> Option<TabletMetadata> {
        self.read_tablet_metadata(extent, columns)
    }

    fn read_tablets(&self) -> TabletsMetadataBuilder {
        TabletsMetadataBuilder {
            source: Source::Store(self.clone()),
            table: None,
            level: None,
            overlapping: None,
            fetch: ColumnSet::ALL,
        }
    }

    fn conditionally_mutate_tablets(&self) -> ConditionalTabletsMutator {
        self.conditional_mutator()
    }
}

enum Source {
    Store(MetadataStore),
    /// Canned rows for Ample fakes in tests.
    Snapshot(Vec<TabletMetadata>),
}

/// Builds a scan over tablet metadata. The result iterates tablets in extent
/// order; it is finite, consumed lazily and cannot be restarted.
pub struct TabletsMetadataBuilder {
    source: Source,
    table: Option<TableId>,
    level: Option<DataLevel>,
    overlapping: Option<(Option<Bytes>, Option<Bytes>)>,
    fetch: ColumnSet,
}

impl TabletsMetadataBuilder {
    /// Scan builder over a canned snapshot, for Ample fakes.
    pub fn from_snapshot(rows: Vec<TabletMetadata>) -> Self {
        TabletsMetadataBuilder {
            source: Source::Snapshot(rows),
            table: None,
            level: None,
            overlapping: None,
            fetch: ColumnSet::ALL,
        }
    }

    pub fn for_table(mut self, table: TableId) -> Self {
        self.table = Some(table);
        self
    }

    pub fn for_level(mut self, level: DataLevel) -> Self {
        self.level = Some(level);
        self
    }

    /// Restrict to tablets whose range intersects `(start, end]`.
    pub fn overlapping(
        mut self,
        start: Option<impl Into<Bytes>>,
        end: Option<impl Into<Bytes>>,
    ) -> Self {
        self.overlapping = Some((start.map(Into::into), end.map(Into::into)));
        self
    }

    pub fn fetch(mut self, columns: ColumnSet) -> Self {
        self.fetch = columns;
        self
    }

    pub fn build(self) -> TabletsMetadata {
        let rows = match self.source {
            Source::Snapshot(rows) => rows,
            Source::Store(store) => {
                let state = store.state.lock();
                state
                    .tablets
                    .iter()
                    .map(|(_, (table, end, row))| {
                        let extent = KeyExtent::new(
                            table.clone(),
                            end.clone(),
                            row.prev_end_row.clone(),
                        );
                        row.to_metadata(extent, self.fetch)
                    })
                    .collect()
            }
        };

        let table = self.table;
        let level = self.level;
        let overlapping = self.overlapping;
        let filtered: Vec<TabletMetadata> = rows
            .into_iter()
            .filter(|tm| {
                if let Some(table) = &table {
                    if tm.extent().table() != table {
                        return false;
                    }
                }
                if let Some(level) = level {
                    if DataLevel::of(tm.extent().table()) != level {
                        return false;
                    }
                }
                if let Some((start, end)) = &overlapping {
                    if !tm.extent().overlaps(start.as_deref(), end.as_deref()) {
                        return false;
                    }
                }
                true
            })
            .collect();

        TabletsMetadata {
            rows: filtered.into_iter(),
        }
    }
}

/// A finite, non-restartable stream of tablet metadata in extent order.
pub struct TabletsMetadata {
    rows: std::vec::IntoIter<TabletMetadata>,
}

impl Iterator for TabletsMetadata {
    type Item = TabletMetadata;

    fn next(&mut self) -> Option<TabletMetadata> {
        self.rows.next()
    }
}
