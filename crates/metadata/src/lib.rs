// Copyright (c) 2023 - 2025 Tessera Contributors.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Typed, conditional access to tablet metadata.
//!
//! Every mutation of tablet state in the whole system funnels through the
//! conditional mutator in this crate: atomic per tablet row, serialized
//! against concurrent mutations of the same row, never atomic across rows.
//! Multi-row changes are coordinated by fate transactions on top.

pub mod ample;
pub mod mutator;
pub mod store;

pub use ample::{Ample, TabletsMetadataBuilder};
pub use mutator::{
    ConditionalResult, ConditionalStatus, ConditionalTabletMutator, ConditionalTabletsMutator,
};
pub use store::MetadataStore;
