// Copyright (c) 2023 - 2025 Tessera Contributors.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use tessera_types::{KeyExtent, TServerInstance};

/// Picks destinations for unassigned tablets. Implementations are not
/// expected to be thread-safe; the watcher serializes calls through its
/// flush lock.
pub trait TabletBalancer: Send + Sync {
    /// Chooses a destination for each unassigned tablet. `unassigned` maps
    /// each tablet to its last known location, if any. Tablets left out of
    /// the result stay unassigned until a later pass.
    fn get_assignments(
        &self,
        destinations: &BTreeSet<TServerInstance>,
        current_load: &BTreeMap<TServerInstance, usize>,
        unassigned: &BTreeMap<KeyExtent, Option<TServerInstance>>,
    ) -> HashMap<KeyExtent, TServerInstance>;
}

/// Default balancer: send a tablet back to its last server when that server
/// is a candidate, otherwise to the least-loaded candidate.
#[derive(Default)]
pub struct SimpleBalancer;

impl TabletBalancer for SimpleBalancer {
    fn get_assignments(
        &self,
        destinations: &BTreeSet<TServerInstance>,
        current_load: &BTreeMap<TServerInstance, usize>,
        unassigned: &BTreeMap<KeyExtent, Option<TServerInstance>>,
    ) -> HashMap<KeyExtent, TServerInstance> {
        let mut load: BTreeMap<&TServerInstance, usize> = destinations
            .iter()
            .map(|server| (server, current_load.get(server).copied().unwrap_or(0)))
            .collect();
        let mut assignments = HashMap::new();
        if load.is_empty() {
            return assignments;
        }

        for (extent, last) in unassigned {
            let destination: TServerInstance =
                match last.as_ref().filter(|l| destinations.contains(*l)) {
                    Some(last) => last.clone(),
                    None => load
                        .iter()
                        .min_by_key(|(server, count)| (**count, (**server).clone()))
                        .map(|(server, _)| (**server).clone())
                        .expect("candidates not empty"),
                };
            *load.get_mut(&destination).expect("destination tracked") += 1;
            assignments.insert(extent.clone(), destination);
        }
        assignments
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tessera_types::TableId;

    fn extent(end: &str) -> KeyExtent {
        KeyExtent::new(
            TableId::new("1"),
            Some(end.as_bytes().to_vec()),
            None::<Vec<u8>>,
        )
    }

    #[test]
    fn prefers_last_location_when_live() {
        let a = TServerInstance::new("a:9997", 1);
        let b = TServerInstance::new("b:9997", 1);
        let destinations: BTreeSet<_> = [a.clone(), b.clone()].into();
        let unassigned: BTreeMap<_, _> = [(extent("m"), Some(b.clone()))].into();

        let assignments = SimpleBalancer.get_assignments(
            &destinations,
            &BTreeMap::new(),
            &unassigned,
        );
        assert_eq!(assignments[&extent("m")], b);
    }

    #[test]
    fn spreads_by_load() {
        let a = TServerInstance::new("a:9997", 1);
        let b = TServerInstance::new("b:9997", 1);
        let destinations: BTreeSet<_> = [a.clone(), b.clone()].into();
        let current_load: BTreeMap<_, _> = [(a.clone(), 5)].into();
        let unassigned: BTreeMap<_, _> = [
            (extent("c"), None),
            (extent("f"), None),
            (extent("m"), None),
        ]
        .into();

        let assignments =
            SimpleBalancer.get_assignments(&destinations, &current_load, &unassigned);
        // with a at 5 and b at 0, b absorbs the first assignments
        let to_b = assignments.values().filter(|s| **s == b).count();
        assert_eq!(to_b, 3);
    }

    #[test]
    fn no_candidates_means_no_assignments() {
        let unassigned: BTreeMap<_, _> = [(extent("c"), None)].into();
        let assignments = SimpleBalancer.get_assignments(
            &BTreeSet::new(),
            &BTreeMap::new(),
            &unassigned,
        );
        assert!(assignments.is_empty());
    }
}
