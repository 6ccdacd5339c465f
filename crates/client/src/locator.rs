// Copyright (c) 2023 - 2025 Tessera Contributors.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Caches which server currently hosts which tablet. Lookups miss into the
//! metadata table; invalidation is the client's lever whenever a server
//! disagrees about hosting a tablet.

use std::collections::BTreeMap;

use bytes::Bytes;
use parking_lot::Mutex;
use tracing::trace;

use tessera_metadata::{Ample, MetadataStore};
use tessera_types::{ColumnSet, ColumnType, KeyExtent, TServerInstance, TableId};

#[derive(Clone)]
struct CachedTablet {
    extent: KeyExtent,
    /// The current location at cache-fill time; tablets without one cannot
    /// take writes yet.
    location: Option<TServerInstance>,
}

/// Per-table cache of tablet locations.
pub struct TabletLocator {
    metadata: MetadataStore,
    table: TableId,
    /// Keyed by the tablet's metadata row key, so range lookups find the
    /// owning tablet with one `range` probe.
    cache: Mutex<BTreeMap<Bytes, CachedTablet>>,
}

impl TabletLocator {
    pub fn new(metadata: MetadataStore, table: TableId) -> Self {
        TabletLocator {
            metadata,
            table,
            cache: Mutex::new(BTreeMap::new()),
        }
    }

    fn fill_cache(&self) {
        let tablets = self
            .metadata
            .read_tablets()
            .for_table(self.table.clone())
            .fetch(ColumnSet::of(&[
                ColumnType::PrevRow,
                ColumnType::Location,
            ]))
            .build();
        let mut cache = self.cache.lock();
        cache.clear();
        for tm in tablets {
            cache.insert(
                tm.extent().meta_row(),
                CachedTablet {
                    extent: tm.extent().clone(),
                    location: tm.current().cloned(),
                },
            );
        }
        trace!(table = %self.table, tablets = cache.len(), "locator cache filled");
    }

    /// The tablet owning `row` and its current server, if it has one.
    /// Returns `None` when no tablet is known for the row.
    pub fn locate(&self, row: &[u8]) -> Option<(KeyExtent, Option<TServerInstance>)> {
        let lookup = |cache: &BTreeMap<Bytes, CachedTablet>| {
            // the owning tablet has the smallest meta row key >= <table>;<row>
            let mut probe = Vec::with_capacity(self.table.as_str().len() + 1 + row.len());
            probe.extend_from_slice(self.table.as_str().as_bytes());
            probe.push(b';');
            probe.extend_from_slice(row);
            let probe = Bytes::from(probe);
            cache
                .range(probe..)
                .next()
                .map(|(_, cached)| cached.clone())
                .filter(|cached| cached.extent.contains_row(row))
        };

        if let Some(cached) = lookup(&self.cache.lock()) {
            return Some((cached.extent, cached.location));
        }
        self.fill_cache();
        lookup(&self.cache.lock()).map(|cached| (cached.extent, cached.location))
    }

    pub fn invalidate(&self, extent: &KeyExtent) {
        self.cache.lock().remove(&extent.meta_row());
    }

    pub fn invalidate_all(&self) {
        self.cache.lock().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tessera_metadata::mutator::ConditionalStatus;
    use tessera_types::TabletAvailability;

    fn setup() -> (MetadataStore, TableId) {
        let store = MetadataStore::new();
        let table = TableId::new("1a");
        store.bootstrap_table(
            &table,
            &[Bytes::from_static(b"g"), Bytes::from_static(b"p")],
            TabletAvailability::Hosted,
        );
        (store, table)
    }

    fn host(store: &MetadataStore, extent: &KeyExtent, server: &TServerInstance) {
        let mut mutator = store.conditionally_mutate_tablets();
        mutator
            .mutate_tablet(extent.clone())
            .require_absent_operation()
            .put_current_location(server.clone())
            .submit(|_| false, "test host");
        assert_eq!(
            mutator.process()[extent].status,
            ConditionalStatus::Accepted
        );
    }

    #[test]
    fn locates_owning_tablet_and_location() {
        let (store, table) = setup();
        let server = TServerInstance::new("host1:9997", 1);
        let middle = KeyExtent::new(
            table.clone(),
            Some(Bytes::from_static(b"p")),
            Some(Bytes::from_static(b"g")),
        );
        host(&store, &middle, &server);

        let locator = TabletLocator::new(store, table.clone());
        let (extent, location) = locator.locate(b"h").unwrap();
        assert_eq!(extent, middle);
        assert_eq!(location, Some(server));

        // first tablet has no location yet
        let (_, location) = locator.locate(b"a").unwrap();
        assert_eq!(location, None);

        // last tablet (infinite end row)
        let (extent, _) = locator.locate(b"zzz").unwrap();
        assert_eq!(extent.end_row(), None);
    }

    #[test]
    fn invalidation_forces_a_fresh_read() {
        let (store, table) = setup();
        let server = TServerInstance::new("host1:9997", 1);
        let first = KeyExtent::new(
            table.clone(),
            Some(Bytes::from_static(b"g")),
            None::<Bytes>,
        );

        let locator = TabletLocator::new(store.clone(), table.clone());
        let (_, location) = locator.locate(b"a").unwrap();
        assert_eq!(location, None);

        host(&store, &first, &server);
        // stale until invalidated
        let (_, location) = locator.locate(b"a").unwrap();
        assert_eq!(location, None);

        locator.invalidate(&first);
        let (_, location) = locator.locate(b"a").unwrap();
        assert_eq!(location, Some(server));
    }
}
