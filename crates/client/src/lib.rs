// Copyright (c) 2023 - 2025 Tessera Contributors.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Client-side write paths: the tablet locator cache and the conditional
//! writer, including the session-invalidation protocol that turns
//! indeterminate failures into a safe `Unknown`.

pub mod conditional_writer;
pub mod locator;

pub use conditional_writer::{
    ConditionalWriter, ConditionalWriterConfig, Connector, Outcome, WriteResult,
};
pub use locator::TabletLocator;
