// Copyright (c) 2023 - 2025 Tessera Contributors.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Versioned property bundles: the system bundle at `/config`, one bundle
//! per table and one per namespace. Reads go through the coordination cache;
//! writers mutate with a version precondition and invalidate the cache.

use std::collections::BTreeMap;
use std::sync::Arc;

use bytes::Bytes;

use tessera_types::{NamespaceId, TableId};

use crate::cache::CoordinationCache;
use crate::client::{CreateMode, CreatePolicy};
use crate::paths;
use crate::{Error, Result};

/// Addresses one property bundle.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum PropKey {
    System,
    Table(TableId),
    Namespace(NamespaceId),
}

impl PropKey {
    pub fn path(&self) -> String {
        match self {
            PropKey::System => paths::CONFIG.to_string(),
            PropKey::Table(table) => paths::table_conf(table),
            PropKey::Namespace(namespace) => paths::namespace_conf(namespace),
        }
    }
}

pub type PropBundle = BTreeMap<String, String>;

pub struct PropStore {
    cache: Arc<CoordinationCache>,
}

impl PropStore {
    pub fn new(cache: Arc<CoordinationCache>) -> Self {
        PropStore { cache }
    }

    fn decode(path: &str, data: &[u8]) -> Result<PropBundle> {
        serde_json::from_slice(data).map_err(|err| Error::Corrupt {
            path: path.to_string(),
            reason: err.to_string(),
        })
    }

    fn encode(bundle: &PropBundle) -> Bytes {
        Bytes::from(serde_json::to_vec(bundle).expect("bundle serializes"))
    }

    /// The bundle for `key`, empty if none was ever written. Served from the
    /// cache; freshness is bounded by cache invalidation.
    pub async fn get(&self, key: &PropKey) -> Result<PropBundle> {
        let path = key.path();
        match self.cache.get(&path).await? {
            None => Ok(PropBundle::new()),
            Some(value) => Self::decode(&path, &value.data),
        }
    }

    pub async fn get_property(&self, key: &PropKey, name: &str) -> Result<Option<String>> {
        Ok(self.get(key).await?.get(name).cloned())
    }

    /// Applies `mutate` to the current bundle under a version precondition
    /// and invalidates the cached copy.
    pub async fn mutate(
        &self,
        key: &PropKey,
        mutate: impl Fn(&mut PropBundle) + Sync,
    ) -> Result<()> {
        let path = key.path();
        let client = self.cache.client();
        crate::memory::ensure_persistent_path(
            client.as_ref(),
            crate::memory::parent_path(&path),
        )
        .await?;
        client
            .create(
                &path,
                Self::encode(&PropBundle::new()),
                CreateMode::Persistent,
                CreatePolicy::SkipIfExists,
            )
            .await?;
        let decode_path = path.clone();
        client
            .mutate_existing(&path, &move |data| {
                let mut bundle = Self::decode(&decode_path, data)?;
                mutate(&mut bundle);
                Ok(Self::encode(&bundle))
            })
            .await?;
        self.cache.invalidate_prefix(&path);
        Ok(())
    }

    pub async fn set_property(&self, key: &PropKey, name: &str, value: &str) -> Result<()> {
        self.mutate(key, |bundle| {
            bundle.insert(name.to_string(), value.to_string());
        })
        .await
    }

    pub async fn remove_property(&self, key: &PropKey, name: &str) -> Result<()> {
        self.mutate(key, |bundle| {
            bundle.remove(name);
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryCoordination;

    #[tokio::test]
    async fn set_and_read_through_cache() {
        let coordination = MemoryCoordination::new();
        let cache = CoordinationCache::new(coordination.client()).await.unwrap();
        let props = PropStore::new(cache);

        let key = PropKey::Table(TableId::new("2b"));
        assert!(props.get(&key).await.unwrap().is_empty());

        props
            .set_property(&key, "table.bulk.max.tablet.files", "5")
            .await
            .unwrap();
        assert_eq!(
            props
                .get_property(&key, "table.bulk.max.tablet.files")
                .await
                .unwrap()
                .as_deref(),
            Some("5")
        );

        props
            .remove_property(&key, "table.bulk.max.tablet.files")
            .await
            .unwrap();
        assert!(props.get(&key).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn bundles_are_scoped() {
        let coordination = MemoryCoordination::new();
        let cache = CoordinationCache::new(coordination.client()).await.unwrap();
        let props = PropStore::new(cache);

        props
            .set_property(&PropKey::System, "wal.max.size", "1g")
            .await
            .unwrap();
        let table_key = PropKey::Table(TableId::new("2b"));
        assert!(props
            .get_property(&table_key, "wal.max.size")
            .await
            .unwrap()
            .is_none());
    }
}
