// Copyright (c) 2023 - 2025 Tessera Contributors.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! In-memory coordination service with the session and watch semantics the
//! adapter expects. Backs single-process deployments and every test that
//! needs locks, markers or fate metadata without an external service.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use tracing::trace;

use crate::client::{
    CoordinationClient, CreateMode, CreatePolicy, WatchEvent, WatchListener,
};
use crate::{Error, Result, VersionedValue};

#[derive(Debug, Clone)]
struct Node {
    data: Bytes,
    version: u64,
    /// Session that owns this node if it is ephemeral.
    owner: Option<u64>,
    /// Counter handing out sequence suffixes to sequential children.
    seq_counter: u64,
}

struct Watch {
    owner_session: u64,
    target: WatchTarget,
    listener: WatchListener,
}

enum WatchTarget {
    Path(String),
    Prefix(String),
}

#[derive(Default)]
struct SessionState {
    ephemerals: HashSet<String>,
}

struct State {
    nodes: BTreeMap<String, Node>,
    sessions: HashMap<u64, SessionState>,
    watches: Vec<Watch>,
    next_session: u64,
    connected: bool,
}

/// The shared in-memory service. Hand out one [`MemoryClient`] per logical
/// process; expiring a client's session drops its ephemeral nodes exactly
/// like a real session expiry would.
#[derive(Clone)]
pub struct MemoryCoordination {
    state: Arc<Mutex<State>>,
}

impl Default for MemoryCoordination {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryCoordination {
    pub fn new() -> Self {
        let mut nodes = BTreeMap::new();
        nodes.insert(
            "/".to_string(),
            Node {
                data: Bytes::new(),
                version: 0,
                owner: None,
                seq_counter: 0,
            },
        );
        MemoryCoordination {
            state: Arc::new(Mutex::new(State {
                nodes,
                sessions: HashMap::new(),
                watches: Vec::new(),
                next_session: 1,
                connected: true,
            })),
        }
    }

    /// Opens a new session and returns a client bound to it.
    pub fn client(&self) -> Arc<MemoryClient> {
        let session = {
            let mut state = self.state.lock();
            let session = state.next_session;
            state.next_session += 1;
            state.sessions.insert(session, SessionState::default());
            session
        };
        Arc::new(MemoryClient {
            coordination: self.clone(),
            session,
        })
    }

    /// Ends a session: its ephemeral nodes are deleted (with watch events
    /// for other sessions) and its own listeners see `SessionExpired`.
    pub fn expire_session(&self, session: u64) {
        let mut pending = Vec::new();
        {
            let mut state = self.state.lock();
            let Some(session_state) = state.sessions.remove(&session) else {
                return;
            };
            let mut paths: Vec<_> = session_state.ephemerals.into_iter().collect();
            // deepest first so parents outlive children during removal
            paths.sort_by_key(|p| std::cmp::Reverse(p.len()));
            for path in paths {
                if state.nodes.remove(&path).is_some() {
                    trace!(%path, session, "ephemeral node removed by session expiry");
                    collect_watch_events(
                        &state.watches,
                        &mut pending,
                        &WatchEvent::Deleted(path.clone()),
                        Some(session),
                    );
                    collect_watch_events(
                        &state.watches,
                        &mut pending,
                        &WatchEvent::ChildrenChanged(parent_path(&path).to_string()),
                        Some(session),
                    );
                }
            }
            let expired = WatchEvent::SessionExpired;
            for watch in state.watches.iter().filter(|w| w.owner_session == session) {
                pending.push((watch.listener.clone(), expired.clone()));
            }
            state.watches.retain(|w| w.owner_session != session);
        }
        fire(pending);
    }

    /// Simulates losing the connection: mutations fail until
    /// [`MemoryCoordination::reconnect`], reads keep working.
    pub fn disconnect(&self) {
        let mut pending = Vec::new();
        {
            let mut state = self.state.lock();
            state.connected = false;
            for watch in &state.watches {
                pending.push((watch.listener.clone(), WatchEvent::Disconnected));
            }
        }
        fire(pending);
    }

    pub fn reconnect(&self) {
        self.state.lock().connected = true;
    }
}

/// One session's view of the [`MemoryCoordination`] service.
pub struct MemoryClient {
    coordination: MemoryCoordination,
    session: u64,
}

impl MemoryClient {
    pub fn session_id(&self) -> u64 {
        self.session
    }

    pub fn expire(&self) {
        self.coordination.expire_session(self.session);
    }
}

pub(crate) fn parent_path(path: &str) -> &str {
    match path.rfind('/') {
        Some(0) => "/",
        Some(idx) => &path[..idx],
        None => "/",
    }
}

fn collect_watch_events(
    watches: &[Watch],
    pending: &mut Vec<(WatchListener, WatchEvent)>,
    event: &WatchEvent,
    skip_session: Option<u64>,
) {
    let path = match event {
        WatchEvent::DataChanged(p) | WatchEvent::Deleted(p) | WatchEvent::ChildrenChanged(p) => p,
        WatchEvent::Disconnected | WatchEvent::SessionExpired => return,
    };
    for watch in watches {
        if Some(watch.owner_session) == skip_session {
            continue;
        }
        let matches = match &watch.target {
            WatchTarget::Path(watched) => watched == path,
            WatchTarget::Prefix(prefix) => path.starts_with(prefix.as_str()),
        };
        if matches {
            pending.push((watch.listener.clone(), event.clone()));
        }
    }
}

fn fire(pending: Vec<(WatchListener, WatchEvent)>) {
    for (listener, event) in pending {
        listener(&event);
    }
}

impl State {
    fn check_connected(&self) -> Result<()> {
        if self.connected {
            Ok(())
        } else {
            Err(Error::Disconnected)
        }
    }
}

#[async_trait::async_trait]
impl CoordinationClient for MemoryClient {
    async fn create(
        &self,
        path: &str,
        data: Bytes,
        mode: CreateMode,
        policy: CreatePolicy,
    ) -> Result<String> {
        let mut pending = Vec::new();
        let result = {
            let mut state = self.coordination.state.lock();
            state.check_connected()?;

            let parent = parent_path(path).to_string();
            if !state.nodes.contains_key(&parent) {
                return Err(Error::NotFound(parent));
            }

            let final_path = if mode == CreateMode::EphemeralSequential {
                let seq = {
                    let parent_node = state.nodes.get_mut(&parent).expect("parent checked");
                    let seq = parent_node.seq_counter;
                    parent_node.seq_counter += 1;
                    seq
                };
                format!("{path}{seq:010}")
            } else {
                path.to_string()
            };

            if state.nodes.contains_key(&final_path) {
                match policy {
                    CreatePolicy::FailIfExists => {
                        return Err(Error::AlreadyExists(final_path));
                    }
                    CreatePolicy::SkipIfExists => return Ok(final_path),
                    CreatePolicy::Overwrite => {
                        let node = state.nodes.get_mut(&final_path).expect("checked");
                        node.data = data;
                        node.version += 1;
                        collect_watch_events(
                            &state.watches,
                            &mut pending,
                            &WatchEvent::DataChanged(final_path.clone()),
                            None,
                        );
                        return Ok(final_path);
                    }
                }
            }

            let owner = match mode {
                CreateMode::Persistent => None,
                CreateMode::Ephemeral | CreateMode::EphemeralSequential => Some(self.session),
            };
            state.nodes.insert(
                final_path.clone(),
                Node {
                    data,
                    version: 0,
                    owner,
                    seq_counter: 0,
                },
            );
            if let Some(session) = owner {
                state
                    .sessions
                    .get_mut(&session)
                    .expect("live session")
                    .ephemerals
                    .insert(final_path.clone());
            }
            collect_watch_events(
                &state.watches,
                &mut pending,
                &WatchEvent::DataChanged(final_path.clone()),
                None,
            );
            collect_watch_events(
                &state.watches,
                &mut pending,
                &WatchEvent::ChildrenChanged(parent),
                None,
            );
            Ok(final_path)
        };
        fire(pending);
        result
    }

    async fn get(&self, path: &str) -> Result<VersionedValue> {
        let state = self.coordination.state.lock();
        state
            .nodes
            .get(path)
            .map(|node| VersionedValue {
                data: node.data.clone(),
                version: node.version,
            })
            .ok_or_else(|| Error::NotFound(path.to_string()))
    }

    async fn get_children(&self, path: &str) -> Result<Vec<String>> {
        let state = self.coordination.state.lock();
        if !state.nodes.contains_key(path) {
            return Err(Error::NotFound(path.to_string()));
        }
        let prefix = if path == "/" {
            "/".to_string()
        } else {
            format!("{path}/")
        };
        Ok(state
            .nodes
            .range(prefix.clone()..)
            .take_while(|(p, _)| p.starts_with(&prefix))
            .filter(|(p, _)| p.len() > prefix.len() && !p[prefix.len()..].contains('/'))
            .map(|(p, _)| p[prefix.len()..].to_string())
            .collect())
    }

    async fn exists(&self, path: &str) -> Result<bool> {
        Ok(self.coordination.state.lock().nodes.contains_key(path))
    }

    async fn put(&self, path: &str, data: Bytes, expected_version: Option<u64>) -> Result<u64> {
        let mut pending = Vec::new();
        let result = {
            let mut state = self.coordination.state.lock();
            state.check_connected()?;
            let watches_event = WatchEvent::DataChanged(path.to_string());
            let node = state
                .nodes
                .get_mut(path)
                .ok_or_else(|| Error::NotFound(path.to_string()))?;
            if let Some(expected) = expected_version {
                if node.version != expected {
                    return Err(Error::VersionMismatch {
                        path: path.to_string(),
                        expected,
                        actual: node.version,
                    });
                }
            }
            node.data = data;
            node.version += 1;
            let version = node.version;
            collect_watch_events(&state.watches, &mut pending, &watches_event, None);
            Ok(version)
        };
        fire(pending);
        result
    }

    async fn delete(&self, path: &str, expected_version: Option<u64>) -> Result<()> {
        let mut pending = Vec::new();
        let result = {
            let mut state = self.coordination.state.lock();
            state.check_connected()?;
            let Some(node) = state.nodes.get(path) else {
                return Ok(());
            };
            if let Some(expected) = expected_version {
                if node.version != expected {
                    return Err(Error::VersionMismatch {
                        path: path.to_string(),
                        expected,
                        actual: node.version,
                    });
                }
            }
            // removes the whole subtree; nothing in tessera deletes a node it
            // expects to still have children
            let subtree_prefix = format!("{path}/");
            let to_remove: Vec<String> = state
                .nodes
                .keys()
                .filter(|p| *p == path || p.starts_with(&subtree_prefix))
                .cloned()
                .collect();
            for p in to_remove.into_iter().rev() {
                if let Some(node) = state.nodes.remove(&p) {
                    if let Some(owner) = node.owner {
                        if let Some(session) = state.sessions.get_mut(&owner) {
                            session.ephemerals.remove(&p);
                        }
                    }
                    collect_watch_events(
                        &state.watches,
                        &mut pending,
                        &WatchEvent::Deleted(p.clone()),
                        None,
                    );
                    collect_watch_events(
                        &state.watches,
                        &mut pending,
                        &WatchEvent::ChildrenChanged(parent_path(&p).to_string()),
                        None,
                    );
                }
            }
            Ok(())
        };
        fire(pending);
        result
    }

    async fn watch(&self, path: &str, listener: WatchListener) -> Result<()> {
        self.coordination.state.lock().watches.push(Watch {
            owner_session: self.session,
            target: WatchTarget::Path(path.to_string()),
            listener,
        });
        Ok(())
    }

    async fn watch_prefix(&self, prefix: &str, listener: WatchListener) -> Result<()> {
        self.coordination.state.lock().watches.push(Watch {
            owner_session: self.session,
            target: WatchTarget::Prefix(prefix.to_string()),
            listener,
        });
        Ok(())
    }
}

/// Creates every segment of `path` as a persistent node, skipping segments
/// that already exist.
pub async fn ensure_persistent_path(client: &dyn CoordinationClient, path: &str) -> Result<()> {
    let mut current = String::new();
    for segment in path.split('/').filter(|s| !s.is_empty()) {
        current.push('/');
        current.push_str(segment);
        client
            .create(
                &current,
                Bytes::new(),
                CreateMode::Persistent,
                CreatePolicy::SkipIfExists,
            )
            .await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn create_get_round_trip() {
        let coordination = MemoryCoordination::new();
        let client = coordination.client();
        client
            .create(
                "/a",
                Bytes::from_static(b"one"),
                CreateMode::Persistent,
                CreatePolicy::FailIfExists,
            )
            .await
            .unwrap();
        let value = client.get("/a").await.unwrap();
        assert_eq!(value.data, Bytes::from_static(b"one"));
        assert_eq!(value.version, 0);

        let err = client
            .create(
                "/a",
                Bytes::new(),
                CreateMode::Persistent,
                CreatePolicy::FailIfExists,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::AlreadyExists(_)));
    }

    #[tokio::test]
    async fn versioned_put_detects_interleaving() {
        let coordination = MemoryCoordination::new();
        let client = coordination.client();
        client
            .create(
                "/a",
                Bytes::from_static(b"v0"),
                CreateMode::Persistent,
                CreatePolicy::FailIfExists,
            )
            .await
            .unwrap();
        let read = client.get("/a").await.unwrap();
        client
            .put("/a", Bytes::from_static(b"other"), None)
            .await
            .unwrap();
        let err = client
            .put("/a", Bytes::from_static(b"mine"), Some(read.version))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::VersionMismatch { .. }));
    }

    #[tokio::test]
    async fn sequential_nodes_get_increasing_suffixes() {
        let coordination = MemoryCoordination::new();
        let client = coordination.client();
        ensure_persistent_path(client.as_ref(), "/locks/x").await.unwrap();
        let first = client
            .create(
                "/locks/x/zlock#u#",
                Bytes::new(),
                CreateMode::EphemeralSequential,
                CreatePolicy::FailIfExists,
            )
            .await
            .unwrap();
        let second = client
            .create(
                "/locks/x/zlock#u#",
                Bytes::new(),
                CreateMode::EphemeralSequential,
                CreatePolicy::FailIfExists,
            )
            .await
            .unwrap();
        assert_eq!(first, "/locks/x/zlock#u#0000000000");
        assert_eq!(second, "/locks/x/zlock#u#0000000001");
    }

    #[tokio::test]
    async fn session_expiry_removes_ephemerals_and_notifies() {
        let coordination = MemoryCoordination::new();
        let owner = coordination.client();
        let observer = coordination.client();
        ensure_persistent_path(owner.as_ref(), "/locks").await.unwrap();
        owner
            .create(
                "/locks/e",
                Bytes::new(),
                CreateMode::Ephemeral,
                CreatePolicy::FailIfExists,
            )
            .await
            .unwrap();

        let deletions = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&deletions);
        observer
            .watch(
                "/locks/e",
                Arc::new(move |event| {
                    if matches!(event, WatchEvent::Deleted(_)) {
                        counter.fetch_add(1, Ordering::SeqCst);
                    }
                }),
            )
            .await
            .unwrap();

        owner.expire();
        assert!(!observer.exists("/locks/e").await.unwrap());
        assert_eq!(deletions.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn children_listing_is_single_level() {
        let coordination = MemoryCoordination::new();
        let client = coordination.client();
        ensure_persistent_path(client.as_ref(), "/t/a/deep").await.unwrap();
        ensure_persistent_path(client.as_ref(), "/t/b").await.unwrap();
        let children = client.get_children("/t").await.unwrap();
        assert_eq!(children, vec!["a".to_string(), "b".to_string()]);
    }

    #[tokio::test]
    async fn disconnect_fails_mutations_only() {
        let coordination = MemoryCoordination::new();
        let client = coordination.client();
        client
            .create(
                "/a",
                Bytes::from_static(b"x"),
                CreateMode::Persistent,
                CreatePolicy::FailIfExists,
            )
            .await
            .unwrap();
        coordination.disconnect();
        assert!(matches!(
            client.put("/a", Bytes::new(), None).await,
            Err(Error::Disconnected)
        ));
        assert!(client.get("/a").await.is_ok());
        coordination.reconnect();
        client.put("/a", Bytes::new(), None).await.unwrap();
    }
}
