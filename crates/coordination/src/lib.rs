// Copyright (c) 2023 - 2025 Tessera Contributors.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Typed access to the hierarchical coordination service: node CRUD with
//! version preconditions, watches, a read-mostly cache, the service-lock
//! primitive, write-ahead-log markers, auth records and property bundles.

pub mod auth;
pub mod cache;
pub mod client;
pub mod lock;
pub mod memory;
pub mod paths;
pub mod props;
pub mod wal_marker;

use bytes::Bytes;

pub use cache::CoordinationCache;
pub use client::{CoordinationClient, CreateMode, CreatePolicy, WatchEvent, WatchListener};
pub use lock::{LockLossReason, ServiceLock, ServiceLockHandle};
pub use memory::MemoryCoordination;

/// A node's payload together with the version that read observed. Writes that
/// carry the version back act only if nobody else wrote in between.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionedValue {
    pub data: Bytes,
    pub version: u64,
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("node not found: {0}")]
    NotFound(String),
    #[error("node already exists: {0}")]
    AlreadyExists(String),
    #[error("version mismatch on {path}: expected {expected}, found {actual}")]
    VersionMismatch {
        path: String,
        expected: u64,
        actual: u64,
    },
    #[error("disconnected from coordination service")]
    Disconnected,
    #[error("coordination node {path} holds an undecodable value: {reason}")]
    Corrupt { path: String, reason: String },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
