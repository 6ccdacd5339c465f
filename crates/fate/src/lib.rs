// Copyright (c) 2023 - 2025 Tessera Contributors.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! The fault-tolerant transaction engine.
//!
//! Multi-tablet administrative work (create, flush, bulk import, shutdown)
//! runs as a durable, replayable stack of steps. Workers claim transactions
//! with a reservation tied to their service lock; claims of dead processes
//! are reclaimed, so a transaction survives any single process.

pub mod admin;
pub mod engine;
pub mod meta_store;
pub mod repo;
pub mod store;
pub mod user_store;

pub use admin::{FateAdmin, FateSummaryReport, TxnDetails};
pub use engine::{Fate, FateOptions};
pub use meta_store::MetaFateStore;
pub use repo::{Ready, Repo};
pub use store::{FateStore, ReservationStatus, SeenTxn, StoreError, TxStatus};
pub use user_store::UserFateStore;
