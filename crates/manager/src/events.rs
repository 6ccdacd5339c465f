// Copyright (c) 2023 - 2025 Tessera Contributors.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Event bus between the manager's components and the per-level watchers.
//! Tablet load/unload and table-state changes nudge the right watcher to
//! rescan instead of waiting out its full-scan interval.

use std::sync::Arc;

use parking_lot::Mutex;

use tessera_types::{DataLevel, KeyExtent};

#[derive(Debug, Clone)]
pub enum EventScope {
    All,
    Level(DataLevel),
    /// One tablet's range needs a look.
    TabletRange(KeyExtent),
}

#[derive(Debug, Clone)]
pub struct Event {
    pub scope: EventScope,
    pub reason: String,
}

impl Event {
    pub fn level(&self) -> Option<DataLevel> {
        match &self.scope {
            EventScope::All => None,
            EventScope::Level(level) => Some(*level),
            EventScope::TabletRange(extent) => Some(DataLevel::of(extent.table())),
        }
    }
}

type Listener = Arc<dyn Fn(&Event) + Send + Sync>;

#[derive(Default)]
pub struct EventCoordinator {
    listeners: Mutex<Vec<(Option<DataLevel>, Listener)>>,
}

impl EventCoordinator {
    /// Registers a listener; `level: None` hears everything.
    pub fn add_listener(&self, level: Option<DataLevel>, listener: Listener) {
        self.listeners.lock().push((level, listener));
    }

    pub fn event(&self, scope: EventScope, reason: impl Into<String>) {
        let event = Event {
            scope,
            reason: reason.into(),
        };
        let listeners = self.listeners.lock().clone();
        for (level, listener) in listeners {
            let wants = match (level, event.level()) {
                (None, _) => true,
                (Some(_), None) => true,
                (Some(mine), Some(theirs)) => mine == theirs,
            };
            if wants {
                listener(&event);
            }
        }
    }
}
