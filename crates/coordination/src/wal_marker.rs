// Copyright (c) 2023 - 2025 Tessera Contributors.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Write-ahead-log markers: every log a tablet server opens is advertised
//! under `/wals/<server>/<uuid>` with its lifecycle state. The manager drives
//! a dead server's markers to `Closed` before recovery reads the logs, and
//! the garbage collector reaps `Unreferenced` ones.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use tessera_types::{TServerInstance, WalRef, WalState};

use crate::client::{CreateMode, CreatePolicy, SharedClient};
use crate::paths;
use crate::{Error, Result};

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Marker {
    state: WalState,
    path: String,
}

pub struct WalStateManager {
    client: SharedClient,
}

impl WalStateManager {
    pub fn new(client: SharedClient) -> Self {
        WalStateManager { client }
    }

    fn marker_path(server: &TServerInstance, uuid: &Uuid) -> String {
        format!("{}/{uuid}", paths::wals_for(server))
    }

    fn encode(marker: &Marker) -> Bytes {
        Bytes::from(serde_json::to_vec(marker).expect("marker serializes"))
    }

    fn decode(path: &str, data: &[u8]) -> Result<Marker> {
        serde_json::from_slice(data).map_err(|err| Error::Corrupt {
            path: path.to_string(),
            reason: err.to_string(),
        })
    }

    /// Advertises a fresh log as `Open`. Called before the log takes its
    /// first write.
    pub async fn add_new_marker(&self, server: &TServerInstance, wal: &WalRef) -> Result<()> {
        crate::memory::ensure_persistent_path(self.client.as_ref(), &paths::wals_for(server))
            .await?;
        let marker = Marker {
            state: WalState::Open,
            path: wal.path.to_string(),
        };
        self.client
            .create(
                &Self::marker_path(server, &wal.uuid),
                Self::encode(&marker),
                CreateMode::Persistent,
                CreatePolicy::Overwrite,
            )
            .await?;
        Ok(())
    }

    async fn transition(
        &self,
        server: &TServerInstance,
        uuid: &Uuid,
        state: WalState,
    ) -> Result<()> {
        let path = Self::marker_path(server, uuid);
        let decode_path = path.clone();
        self.client
            .mutate_existing(&path, &move |data| {
                let mut marker = Self::decode(&decode_path, data)?;
                marker.state = state;
                Ok(Self::encode(&marker))
            })
            .await?;
        Ok(())
    }

    /// Marks a log `Closed`: no further appends will ever happen to it, and
    /// recovery readers may consume it.
    pub async fn close_wal(&self, server: &TServerInstance, uuid: &Uuid) -> Result<()> {
        self.transition(server, uuid, WalState::Closed).await
    }

    /// Marks a log `Unreferenced`: no tablet needs it for recovery anymore.
    pub async fn wal_unreferenced(&self, server: &TServerInstance, uuid: &Uuid) -> Result<()> {
        self.transition(server, uuid, WalState::Unreferenced).await
    }

    pub async fn state(&self, server: &TServerInstance, uuid: &Uuid) -> Result<Option<WalState>> {
        let path = Self::marker_path(server, uuid);
        match self.client.try_get(&path).await? {
            None => Ok(None),
            Some(value) => Ok(Some(Self::decode(&path, &value.data)?.state)),
        }
    }

    /// The logs a server still has open or closed-but-referenced. These are
    /// the logs that must be accounted for when the server dies.
    pub async fn wals_in_use(&self, server: &TServerInstance) -> Result<Vec<WalRef>> {
        let base = paths::wals_for(server);
        let children = match self.client.get_children(&base).await {
            Ok(children) => children,
            Err(Error::NotFound(_)) => return Ok(Vec::new()),
            Err(err) => return Err(err),
        };
        let mut wals = Vec::new();
        for child in children {
            let path = format!("{base}/{child}");
            let Some(value) = self.client.try_get(&path).await? else {
                continue;
            };
            let marker = Self::decode(&path, &value.data)?;
            if marker.state == WalState::Unreferenced {
                continue;
            }
            let uuid = child.parse::<Uuid>().map_err(|err| Error::Corrupt {
                path: path.clone(),
                reason: err.to_string(),
            })?;
            wals.push(WalRef {
                server_host_port: server.host_port().to_string(),
                uuid,
                path: marker.path.into(),
            });
        }
        Ok(wals)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryCoordination;

    fn wal(server: &TServerInstance) -> WalRef {
        let uuid = Uuid::new_v4();
        WalRef {
            server_host_port: server.host_port().to_string(),
            uuid,
            path: format!("/wal/{}/{uuid}", server.host_port()).into(),
        }
    }

    #[tokio::test]
    async fn marker_lifecycle() {
        let coordination = MemoryCoordination::new();
        let mgr = WalStateManager::new(coordination.client());
        let server = TServerInstance::new("host1:9997", 3);
        let wal_ref = wal(&server);

        mgr.add_new_marker(&server, &wal_ref).await.unwrap();
        assert_eq!(
            mgr.state(&server, &wal_ref.uuid).await.unwrap(),
            Some(WalState::Open)
        );
        assert_eq!(mgr.wals_in_use(&server).await.unwrap(), vec![wal_ref.clone()]);

        mgr.close_wal(&server, &wal_ref.uuid).await.unwrap();
        assert_eq!(
            mgr.state(&server, &wal_ref.uuid).await.unwrap(),
            Some(WalState::Closed)
        );
        // closed logs still count as in use until recovery is done with them
        assert_eq!(mgr.wals_in_use(&server).await.unwrap().len(), 1);

        mgr.wal_unreferenced(&server, &wal_ref.uuid).await.unwrap();
        assert!(mgr.wals_in_use(&server).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn markers_are_scoped_per_server_incarnation() {
        let coordination = MemoryCoordination::new();
        let mgr = WalStateManager::new(coordination.client());
        let old = TServerInstance::new("host1:9997", 1);
        let new = TServerInstance::new("host1:9997", 2);

        mgr.add_new_marker(&old, &wal(&old)).await.unwrap();
        assert!(mgr.wals_in_use(&new).await.unwrap().is_empty());
        assert_eq!(mgr.wals_in_use(&old).await.unwrap().len(), 1);
    }
}
