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

use ahash::HashMap;
use parking_lot::RwLock;
use tracing::trace;

use crate::client::{SharedClient, WatchEvent};
use crate::{Result, VersionedValue};

#[derive(Debug, Clone, Default)]
struct CachedPath {
    value: Option<Option<VersionedValue>>,
    children: Option<Vec<String>>,
}

#[derive(Default)]
struct CacheState {
    paths: HashMap<String, CachedPath>,
}

/// Read-through cache over the coordination adapter, authoritative for
/// read-mostly configuration.
///
/// Entries are dropped when a watch event touches their path and when a
/// writer calls [`CoordinationCache::invalidate_if`]. Any code that mutates a
/// cached path must invalidate it; the watch wiring is a safety net for
/// out-of-process writers, not a substitute.
pub struct CoordinationCache {
    client: SharedClient,
    state: Arc<RwLock<CacheState>>,
}

impl CoordinationCache {
    pub async fn new(client: SharedClient) -> Result<Arc<Self>> {
        let cache = Arc::new(CoordinationCache {
            client: Arc::clone(&client),
            state: Arc::new(RwLock::new(CacheState::default())),
        });

        let state = Arc::clone(&cache.state);
        client
            .watch_prefix(
                "/",
                Arc::new(move |event| {
                    // runs on the adapter's dispatch context: only map surgery
                    match event {
                        WatchEvent::DataChanged(path) | WatchEvent::Deleted(path) => {
                            let mut state = state.write();
                            state.paths.remove(path);
                            let parent = crate::memory::parent_path(path);
                            if let Some(cached) = state.paths.get_mut(parent) {
                                cached.children = None;
                            }
                        }
                        WatchEvent::ChildrenChanged(path) => {
                            if let Some(cached) = state.write().paths.get_mut(path) {
                                cached.children = None;
                            }
                        }
                        WatchEvent::Disconnected | WatchEvent::SessionExpired => {
                            state.write().paths.clear();
                        }
                    }
                }),
            )
            .await?;

        Ok(cache)
    }

    pub fn client(&self) -> &SharedClient {
        &self.client
    }

    pub async fn get(&self, path: &str) -> Result<Option<VersionedValue>> {
        if let Some(cached) = self.state.read().paths.get(path) {
            if let Some(value) = &cached.value {
                return Ok(value.clone());
            }
        }
        let value = self.client.try_get(path).await?;
        self.state
            .write()
            .paths
            .entry(path.to_string())
            .or_default()
            .value = Some(value.clone());
        Ok(value)
    }

    pub async fn get_children(&self, path: &str) -> Result<Vec<String>> {
        if let Some(cached) = self.state.read().paths.get(path) {
            if let Some(children) = &cached.children {
                return Ok(children.clone());
            }
        }
        let children = self.client.get_children(path).await?;
        self.state
            .write()
            .paths
            .entry(path.to_string())
            .or_default()
            .children = Some(children.clone());
        Ok(children)
    }

    pub async fn exists(&self, path: &str) -> Result<bool> {
        Ok(self.get(path).await?.is_some())
    }

    /// Drops every cached entry whose path satisfies `predicate`.
    pub fn invalidate_if(&self, predicate: impl Fn(&str) -> bool) {
        let mut state = self.state.write();
        let before = state.paths.len();
        state.paths.retain(|path, _| !predicate(path));
        trace!(dropped = before - state.paths.len(), "cache invalidation");
    }

    pub fn invalidate_prefix(&self, prefix: &str) {
        self.invalidate_if(|path| path.starts_with(prefix));
    }

    pub fn clear(&self) {
        self.state.write().paths.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{CoordinationClient, CreateMode, CreatePolicy};
    use crate::memory::MemoryCoordination;
    use bytes::Bytes;

    #[tokio::test]
    async fn serves_cached_reads_until_invalidated() {
        let coordination = MemoryCoordination::new();
        let writer = coordination.client();
        writer
            .create(
                "/config",
                Bytes::from_static(b"v0"),
                CreateMode::Persistent,
                CreatePolicy::FailIfExists,
            )
            .await
            .unwrap();

        let cache = CoordinationCache::new(coordination.client()).await.unwrap();
        assert_eq!(
            cache.get("/config").await.unwrap().unwrap().data,
            Bytes::from_static(b"v0")
        );

        // the write fires a watch event which drops the entry
        writer
            .put("/config", Bytes::from_static(b"v1"), None)
            .await
            .unwrap();
        assert_eq!(
            cache.get("/config").await.unwrap().unwrap().data,
            Bytes::from_static(b"v1")
        );
    }

    #[tokio::test]
    async fn negative_entries_are_cached_and_invalidated_by_prefix() {
        let coordination = MemoryCoordination::new();
        let writer = coordination.client();
        let cache = CoordinationCache::new(coordination.client()).await.unwrap();

        assert!(cache.get("/tables/5/conf").await.unwrap().is_none());

        crate::memory::ensure_persistent_path(writer.as_ref(), "/tables/5").await.unwrap();
        writer
            .create(
                "/tables/5/conf",
                Bytes::from_static(b"{}"),
                CreateMode::Persistent,
                CreatePolicy::FailIfExists,
            )
            .await
            .unwrap();

        cache.invalidate_prefix("/tables/5");
        assert!(cache.get("/tables/5/conf").await.unwrap().is_some());
    }
}
