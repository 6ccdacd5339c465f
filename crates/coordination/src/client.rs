// Copyright (c) 2023 - 2025 Tessera Contributors.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

use std::sync::Arc;

use bytes::Bytes;

use crate::{Error, Result, VersionedValue};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateMode {
    Persistent,
    /// Deleted automatically when the creating session ends.
    Ephemeral,
    /// Ephemeral, with a server-assigned monotonic sequence suffix appended
    /// to the requested path.
    EphemeralSequential,
}

/// What to do when the node to create already exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreatePolicy {
    FailIfExists,
    Overwrite,
    SkipIfExists,
}

/// Events delivered to watch listeners. Listeners run on the adapter's
/// dispatch context; they must not block on coordination calls of their own.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchEvent {
    DataChanged(String),
    Deleted(String),
    ChildrenChanged(String),
    Disconnected,
    SessionExpired,
}

pub type WatchListener = Arc<dyn Fn(&WatchEvent) + Send + Sync>;

/// Adapter over the coordination service. One instance is bound to one
/// session; ephemeral nodes it creates die with that session.
///
/// Read operations ride out disconnects internally; mutations surface
/// [`Error::Disconnected`] so callers can decide whether a retry is safe.
#[async_trait::async_trait]
pub trait CoordinationClient: Send + Sync + 'static {
    /// Creates a node. Returns the final path, which differs from the
    /// requested one for sequential nodes.
    async fn create(
        &self,
        path: &str,
        data: Bytes,
        mode: CreateMode,
        policy: CreatePolicy,
    ) -> Result<String>;

    /// Reads a node and the version of what was read.
    async fn get(&self, path: &str) -> Result<VersionedValue>;

    /// Like [`CoordinationClient::get`] but absent nodes are `None` rather
    /// than an error.
    async fn try_get(&self, path: &str) -> Result<Option<VersionedValue>> {
        match self.get(path).await {
            Ok(value) => Ok(Some(value)),
            Err(Error::NotFound(_)) => Ok(None),
            Err(err) => Err(err),
        }
    }

    /// Child node names (not full paths) of `path`, unsorted.
    async fn get_children(&self, path: &str) -> Result<Vec<String>>;

    async fn exists(&self, path: &str) -> Result<bool>;

    /// Overwrites a node's data. With `expected_version` set the write only
    /// happens if the node is still at that version.
    async fn put(&self, path: &str, data: Bytes, expected_version: Option<u64>) -> Result<u64>;

    /// Deletes a node, optionally conditional on its version. Deleting an
    /// absent node is not an error.
    async fn delete(&self, path: &str, expected_version: Option<u64>) -> Result<()>;

    /// Registers a persistent listener for changes to `path`.
    async fn watch(&self, path: &str, listener: WatchListener) -> Result<()>;

    /// Registers a persistent listener for changes to any path starting with
    /// `prefix`. This is what the cache layer builds its invalidation on.
    async fn watch_prefix(&self, prefix: &str, listener: WatchListener) -> Result<()>;

    /// Applies `f` to the node's current data and writes the result back,
    /// conditional on the data not having changed in between. Retries the
    /// read-modify-write until it wins; use
    /// [`CoordinationClient::try_mutate_existing`] for a single attempt.
    async fn mutate_existing(
        &self,
        path: &str,
        f: &(dyn for<'a> Fn(&'a [u8]) -> Result<Bytes> + Sync),
    ) -> Result<u64> {
        loop {
            match self.try_mutate_existing(path, f).await {
                Err(Error::VersionMismatch { .. }) => continue,
                other => return other,
            }
        }
    }

    async fn try_mutate_existing(
        &self,
        path: &str,
        f: &(dyn for<'a> Fn(&'a [u8]) -> Result<Bytes> + Sync),
    ) -> Result<u64> {
        let current = self.get(path).await?;
        let new_data = f(&current.data)?;
        self.put(path, new_data, Some(current.version)).await
    }
}

/// Shorthand used throughout the server crates.
pub type SharedClient = Arc<dyn CoordinationClient>;
