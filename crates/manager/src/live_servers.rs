// Copyright (c) 2023 - 2025 Tessera Contributors.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Tracks which tablet servers are alive by watching their service locks,
//! and resolves a live server to its administrative connection.

use std::collections::BTreeSet;
use std::sync::Arc;

use ahash::HashMap;
use parking_lot::Mutex;
use tracing::warn;

use tessera_coordination::client::SharedClient;
use tessera_coordination::lock::validate_and_sort;
use tessera_coordination::paths;
use tessera_coordination::Error as CoordError;
use tessera_types::rpc::TServerAdminService;
use tessera_types::TServerInstance;

/// Resolves a tablet server instance to its admin service. In-process
/// deployments register server objects directly.
pub trait TServerConnector: Send + Sync {
    fn connection(&self, server: &TServerInstance) -> Option<Arc<dyn TServerAdminService>>;
}

/// Registry-backed connector for in-process clusters and tests.
#[derive(Default)]
pub struct ConnectorRegistry {
    connections: Mutex<HashMap<TServerInstance, Arc<dyn TServerAdminService>>>,
}

impl ConnectorRegistry {
    pub fn register(&self, server: TServerInstance, service: Arc<dyn TServerAdminService>) {
        self.connections.lock().insert(server, service);
    }

    pub fn deregister(&self, server: &TServerInstance) {
        self.connections.lock().remove(server);
    }
}

impl TServerConnector for ConnectorRegistry {
    fn connection(&self, server: &TServerInstance) -> Option<Arc<dyn TServerAdminService>> {
        self.connections.lock().get(server).cloned()
    }
}

/// The set of live tablet servers, computed from held service locks under
/// `/locks/tservers/<host>`.
pub struct LiveTServerSet {
    client: SharedClient,
}

impl LiveTServerSet {
    pub fn new(client: SharedClient) -> Self {
        LiveTServerSet { client }
    }

    /// Snapshot of currently live servers. A server is live while the
    /// lowest valid lock child under its host node exists; the node data
    /// carries the instance identity.
    pub async fn current_servers(&self) -> BTreeSet<TServerInstance> {
        let mut servers = BTreeSet::new();
        let hosts = match self.client.get_children(paths::TSERVER_LOCKS).await {
            Ok(hosts) => hosts,
            Err(CoordError::NotFound(_)) => return servers,
            Err(err) => {
                warn!("could not list tablet server locks: {err}");
                return servers;
            }
        };
        for host in hosts {
            let lock_path = paths::tserver_lock(&host);
            let children = match self.client.get_children(&lock_path).await {
                Ok(children) => children,
                Err(_) => continue,
            };
            let sorted = validate_and_sort(children);
            let Some(holder) = sorted.first() else {
                continue;
            };
            let node_path = format!("{lock_path}/{holder}");
            match self.client.try_get(&node_path).await {
                Ok(Some(value)) => {
                    match parse_instance(&value.data) {
                        Some(instance) => {
                            servers.insert(instance);
                        }
                        None => warn!(%node_path, "undecodable tserver lock data"),
                    }
                }
                _ => continue,
            }
        }
        servers
    }
}

fn parse_instance(data: &[u8]) -> Option<TServerInstance> {
    // lock data is "<host:port>[<hex session>]"
    let text = std::str::from_utf8(data).ok()?;
    let (host_port, rest) = text.split_once('[')?;
    let session = rest.strip_suffix(']')?;
    let session = u64::from_str_radix(session, 16).ok()?;
    Some(TServerInstance::new(host_port, session))
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use tessera_coordination::lock::ServiceLock;
    use tessera_coordination::memory::{ensure_persistent_path, MemoryCoordination};

    #[tokio::test]
    async fn live_set_follows_lock_lifecycle() {
        let coordination = MemoryCoordination::new();
        let manager_client = coordination.client();
        let live = LiveTServerSet::new(manager_client.clone());
        assert!(live.current_servers().await.is_empty());

        let instance = TServerInstance::new("host1:9997", 0xab);
        let server_client = coordination.client();
        ensure_persistent_path(server_client.as_ref(), &paths::tserver_lock("host1:9997"))
            .await
            .unwrap();
        let _lock = ServiceLock::new(server_client.clone())
            .acquire(
                &paths::tserver_lock("host1:9997"),
                Bytes::from(instance.to_string()),
            )
            .await
            .unwrap();

        let servers = live.current_servers().await;
        assert_eq!(servers.into_iter().collect::<Vec<_>>(), vec![instance]);

        coordination.expire_session(server_client.session_id());
        assert!(live.current_servers().await.is_empty());
    }
}
