// Copyright (c) 2023 - 2025 Tessera Contributors.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! The manager: watches every tablet of every data level, drives tablets
//! toward their goal state, balances them across live tablet servers, and
//! runs multi-tablet administrative work as fate transactions.

pub mod balancer;
pub mod bulk;
pub mod events;
pub mod flush;
pub mod live_servers;
pub mod manager;
pub mod ops;
pub mod state;
pub mod upgrade;
pub mod watcher;

pub use balancer::{SimpleBalancer, TabletBalancer};
pub use bulk::{BulkError, LoadPlan, LoadPlanEntry, RangeType};
pub use events::{Event, EventCoordinator, EventScope};
pub use live_servers::{ConnectorRegistry, LiveTServerSet, TServerConnector};
pub use manager::{ExportManifest, Manager, ManagerContext, ManagerError};
pub use ops::ManagerRepo;
pub use state::{TabletGoalStateExt, TabletManagementParameters};
pub use upgrade::{prepare_upgrade, UpgradeError};
pub use watcher::TabletGroupWatcher;
