// Copyright (c) 2023 - 2025 Tessera Contributors.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Core data model shared by every Tessera component: table and tablet
//! identity, tablet metadata columns, mutations, durability, fate ids,
//! service-lock ids, retry policies and configuration options.

pub mod config;
pub mod extent;
pub mod fate;
pub mod lock;
pub mod mutation;
pub mod retries;
pub mod rpc;
pub mod server;
pub mod table;
pub mod tablet;
pub mod time;
pub mod visibility;

pub use extent::{DataLevel, KeyExtent};
pub use fate::{FateId, FateInstanceType, FateReservation};
pub use lock::{LockId, ZLOCK_PREFIX};
pub use mutation::{
    ColumnUpdate, Condition, ConditionalMutation, ConditionalStatus, Durability, IterConfig, Key,
    Mutation,
};
pub use server::TServerInstance;
pub use table::{NamespaceId, TableId, TableState};
pub use tablet::{
    ColumnSet, ColumnType, FencedRange, Location, LocationKind, OperationId, OperationKind,
    StoredFile, Suspension, TabletAvailability, TabletGoalState, TabletMergeability, TabletMetadata,
    TabletMetadataBuilder, TabletState, UnloadGoal, WalRef, WalState,
};
pub use time::{MetadataTime, SteadyTime};
