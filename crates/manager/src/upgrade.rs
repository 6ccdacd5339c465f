// Copyright (c) 2023 - 2025 Tessera Contributors.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Upgrade preparation: a singleton marker that must only be written with
//! no manager running and no fate transactions outstanding, so the next
//! version never replays steps it does not understand.

use bytes::Bytes;

use tessera_coordination::client::{CoordinationClient, CreateMode, CreatePolicy};
use tessera_coordination::lock::validate_and_sort;
use tessera_coordination::paths;
use tessera_metadata::MetadataStore;

#[derive(Debug, thiserror::Error)]
pub enum UpgradeError {
    #[error("cannot prepare for upgrade: the manager is running")]
    ManagerRunning,
    #[error("cannot prepare for upgrade: fate transactions exist")]
    FateNotEmpty,
    #[error("already prepared for upgrade")]
    AlreadyPrepared,
    #[error(transparent)]
    Coordination(#[from] tessera_coordination::Error),
}

/// Writes the `/prepare-for-upgrade` marker after verifying the
/// preconditions.
pub async fn prepare_upgrade(
    client: &dyn CoordinationClient,
    metadata: &MetadataStore,
) -> Result<(), UpgradeError> {
    match client.get_children(paths::MANAGER_LOCK).await {
        Ok(children) if !validate_and_sort(children.clone()).is_empty() => {
            return Err(UpgradeError::ManagerRunning);
        }
        _ => {}
    }

    match client.get_children(paths::FATE).await {
        Ok(children) if !children.is_empty() => return Err(UpgradeError::FateNotEmpty),
        _ => {}
    }
    if !metadata.fate_list().is_empty() {
        return Err(UpgradeError::FateNotEmpty);
    }

    match client
        .create(
            paths::PREPARE_FOR_UPGRADE,
            Bytes::new(),
            CreateMode::Persistent,
            CreatePolicy::FailIfExists,
        )
        .await
    {
        Ok(_) => Ok(()),
        Err(tessera_coordination::Error::AlreadyExists(_)) => {
            Err(UpgradeError::AlreadyPrepared)
        }
        Err(err) => Err(err.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tessera_coordination::lock::ServiceLock;
    use tessera_coordination::memory::{ensure_persistent_path, MemoryCoordination};
    use tessera_types::{FateId, FateInstanceType};

    #[tokio::test]
    async fn refuses_while_manager_runs() {
        let coordination = MemoryCoordination::new();
        let client = coordination.client();
        ensure_persistent_path(client.as_ref(), paths::MANAGER_LOCK)
            .await
            .unwrap();
        let lock = ServiceLock::new(client.clone())
            .acquire(paths::MANAGER_LOCK, Bytes::new())
            .await
            .unwrap();

        let metadata = MetadataStore::new();
        let err = prepare_upgrade(client.as_ref(), &metadata).await.unwrap_err();
        assert!(matches!(err, UpgradeError::ManagerRunning));

        lock.release().await.unwrap();
        prepare_upgrade(client.as_ref(), &metadata).await.unwrap();
        assert!(client.exists(paths::PREPARE_FOR_UPGRADE).await.unwrap());
    }

    #[tokio::test]
    async fn refuses_with_outstanding_fate_txns() {
        let coordination = MemoryCoordination::new();
        let client = coordination.client();
        let metadata = MetadataStore::new();

        let fate_id = FateId::random(FateInstanceType::User);
        metadata.fate_mutate(
            fate_id.uuid,
            &[],
            &[tessera_metadata::store::FateOp::PutStatus("NEW".to_string())],
        );

        let err = prepare_upgrade(client.as_ref(), &metadata).await.unwrap_err();
        assert!(matches!(err, UpgradeError::FateNotEmpty));
    }

    #[tokio::test]
    async fn preparing_twice_is_reported() {
        let coordination = MemoryCoordination::new();
        let client = coordination.client();
        let metadata = MetadataStore::new();
        prepare_upgrade(client.as_ref(), &metadata).await.unwrap();
        let err = prepare_upgrade(client.as_ref(), &metadata).await.unwrap_err();
        assert!(matches!(err, UpgradeError::AlreadyPrepared));
    }
}
