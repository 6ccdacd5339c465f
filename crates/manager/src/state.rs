// Copyright (c) 2023 - 2025 Tessera Contributors.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Goal-state computation. Everything the watcher needs to decide what a
//! tablet *should* be doing is computed here and nowhere else, so every
//! code path reasons from the same goal.

use std::collections::{BTreeMap, BTreeSet};

use tessera_types::{
    DataLevel, SteadyTime, TServerInstance, TableId, TableState, TabletAvailability,
    TabletGoalState, TabletMetadata, TabletState,
};

/// Immutable snapshot of the cluster facts one scan pass works from.
#[derive(Clone)]
pub struct TabletManagementParameters {
    pub level: DataLevel,
    pub table_states: BTreeMap<TableId, TableState>,
    pub online_servers: BTreeSet<TServerInstance>,
    pub servers_to_shutdown: BTreeSet<TServerInstance>,
    pub can_suspend_tablets: bool,
    /// Volume replacements in effect: old path prefix to new path prefix.
    pub volume_replacements: BTreeMap<String, String>,
    pub steady_time: SteadyTime,
}

impl TabletManagementParameters {
    pub fn table_state(&self, table: &TableId) -> TableState {
        if table.is_system() {
            return TableState::Online;
        }
        self.table_states
            .get(table)
            .copied()
            .unwrap_or(TableState::Unknown)
    }
}

/// Computation of [`TabletGoalState`]; lives here so the enum in the data
/// model stays policy-free.
pub trait TabletGoalStateExt {
    fn compute(
        tm: &TabletMetadata,
        state: TabletState,
        params: &TabletManagementParameters,
    ) -> TabletGoalState;
}

impl TabletGoalStateExt for TabletGoalState {
    fn compute(
        tm: &TabletMetadata,
        state: TabletState,
        params: &TabletManagementParameters,
    ) -> TabletGoalState {
        match params.table_state(tm.extent().table()) {
            TableState::Deleting => return TabletGoalState::Deleted,
            TableState::Offline | TableState::New => return TabletGoalState::Unassigned,
            TableState::Unknown => return TabletGoalState::Unassigned,
            TableState::Online => {}
        }

        // tablets under an exclusive operation are left exactly as they are
        if tm.operation_id().is_some() {
            return TabletGoalState::Unassigned;
        }

        let wants_hosting = match tm.availability() {
            TabletAvailability::Hosted => true,
            TabletAvailability::OnDemand => tm.hosting_requested(),
            TabletAvailability::Unhosted => false,
        };
        if !wants_hosting {
            return TabletGoalState::Unassigned;
        }

        // hosted on a server that is being shut down: get it off, keeping
        // the suspension claim when this level supports it
        if let Some(location) = tm.location() {
            if params.servers_to_shutdown.contains(&location.server) {
                return if params.can_suspend_tablets {
                    TabletGoalState::Suspended
                } else {
                    TabletGoalState::Unassigned
                };
            }
        }

        // a pinned migration moves the tablet by unloading it from its
        // current server; assignment will honor the migration column
        if let (Some(migration), TabletState::Hosted) = (tm.migration(), state) {
            if tm.current() != Some(migration) {
                return TabletGoalState::Unassigned;
            }
        }

        TabletGoalState::Hosted
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use googletest::prelude::*;
    use tessera_types::{FateId, FateInstanceType, KeyExtent, OperationId, OperationKind};

    fn params() -> TabletManagementParameters {
        TabletManagementParameters {
            level: DataLevel::User,
            table_states: BTreeMap::from([(TableId::new("1a"), TableState::Online)]),
            online_servers: BTreeSet::new(),
            servers_to_shutdown: BTreeSet::new(),
            can_suspend_tablets: true,
            volume_replacements: BTreeMap::new(),
            steady_time: SteadyTime::from_millis(0),
        }
    }

    fn tm() -> tessera_types::TabletMetadataBuilder {
        TabletMetadata::builder(KeyExtent::whole_table(TableId::new("1a")))
    }

    #[test]
    fn hosted_availability_wants_hosting() {
        let meta = tm().put_availability(TabletAvailability::Hosted).build();
        let goal = TabletGoalState::compute(&meta, TabletState::Unassigned, &params());
        assert_that!(goal, eq(TabletGoalState::Hosted));
    }

    #[test]
    fn ondemand_needs_a_request() {
        let meta = tm().put_availability(TabletAvailability::OnDemand).build();
        assert_that!(
            TabletGoalState::compute(&meta, TabletState::Unassigned, &params()),
            eq(TabletGoalState::Unassigned)
        );

        let requested = tm()
            .put_availability(TabletAvailability::OnDemand)
            .put_hosting_requested(true)
            .build();
        assert_that!(
            TabletGoalState::compute(&requested, TabletState::Unassigned, &params()),
            eq(TabletGoalState::Hosted)
        );
    }

    #[test]
    fn unhosted_never_hosts() {
        let meta = tm()
            .put_availability(TabletAvailability::Unhosted)
            .put_hosting_requested(true)
            .build();
        assert_that!(
            TabletGoalState::compute(&meta, TabletState::Unassigned, &params()),
            eq(TabletGoalState::Unassigned)
        );
    }

    #[test]
    fn operation_blocks_hosting() {
        let meta = tm()
            .put_availability(TabletAvailability::Hosted)
            .put_operation(OperationId::new(
                OperationKind::Merging,
                FateId::random(FateInstanceType::User),
            ))
            .build();
        assert_that!(
            TabletGoalState::compute(&meta, TabletState::Unassigned, &params()),
            eq(TabletGoalState::Unassigned)
        );
    }

    #[test]
    fn shutdown_server_goal_depends_on_suspendability() {
        let server = TServerInstance::new("host1:9997", 1);
        let meta = tm()
            .put_availability(TabletAvailability::Hosted)
            .put_current(server.clone())
            .build();
        let mut p = params();
        p.servers_to_shutdown.insert(server);

        assert_that!(
            TabletGoalState::compute(&meta, TabletState::Hosted, &p),
            eq(TabletGoalState::Suspended)
        );
        p.can_suspend_tablets = false;
        assert_that!(
            TabletGoalState::compute(&meta, TabletState::Hosted, &p),
            eq(TabletGoalState::Unassigned)
        );
    }

    #[test]
    fn deleting_table_wants_deleted() {
        let meta = tm().put_availability(TabletAvailability::Hosted).build();
        let mut p = params();
        p.table_states.insert(TableId::new("1a"), TableState::Deleting);
        assert_that!(
            TabletGoalState::compute(&meta, TabletState::Hosted, &p),
            eq(TabletGoalState::Deleted)
        );
    }
}
