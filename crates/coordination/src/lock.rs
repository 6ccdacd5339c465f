// Copyright (c) 2023 - 2025 Tessera Contributors.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! The service lock: a mutually exclusive, fair, failure-detecting lock
//! built from sequential-ephemeral children of a lock path.
//!
//! Every candidate creates a `zlock#<uuid>#<seq>` child and watches the
//! candidate queued before it. Holding the lowest child means holding the
//! lock; losing the child (or the session) means the lock is gone and any
//! lock-guarded work must stop.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use bytes::Bytes;
use tokio::sync::Notify;
use tracing::{debug, info, warn};
use uuid::Uuid;

use tessera_types::{LockId, ZLOCK_PREFIX};

use crate::client::{CreateMode, CreatePolicy, SharedClient, WatchEvent};
use crate::{Error, Result};

/// Why a held lock stopped being held.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockLossReason {
    /// The lock node was deleted out from under the holder.
    NodeDeleted,
    /// The session backing the ephemeral node expired.
    SessionExpired,
}

fn parse_child(name: &str) -> Option<(&str, u64)> {
    let rest = name.strip_prefix(ZLOCK_PREFIX)?;
    let (uuid_str, seq_str) = rest.split_once('#')?;
    if seq_str.len() != 10 || seq_str.contains('#') {
        return None;
    }
    let uuid = Uuid::parse_str(uuid_str).ok()?;
    // round-trip equality rejects shorthand spellings that merely parse
    if uuid.to_string() != uuid_str {
        return None;
    }
    let seq: u64 = seq_str.parse().ok()?;
    Some((uuid_str, seq))
}

/// Filters `children` down to well-formed lock entries and sorts them by
/// their sequence number ascending.
pub fn validate_and_sort(children: impl IntoIterator<Item = String>) -> Vec<String> {
    let mut valid: Vec<(u64, String)> = children
        .into_iter()
        .filter_map(|name| {
            let seq = parse_child(&name)?.1;
            Some((seq, name))
        })
        .collect();
    valid.sort();
    valid.into_iter().map(|(_, name)| name).collect()
}

/// The entry a candidate must watch: the *lowest*-sequence entry sharing the
/// `zlock#<uuid>` prefix of the entry immediately before `own` in `sorted`.
///
/// Watching the lowest entry of the predecessor's prefix (rather than the
/// predecessor itself) keeps a candidate from being woken by churn among a
/// peer's retries. Returns `None` when `own` is first or not present.
pub fn find_lowest_prev_prefix<'a>(sorted: &'a [String], own: &str) -> Option<&'a str> {
    let position = sorted.iter().position(|child| child == own)?;
    let prev = sorted.get(position.checked_sub(1)?)?;
    let prefix_end = prev.rfind('#')? + 1;
    let prefix = &prev[..prefix_end];
    sorted
        .iter()
        .find(|child| child.starts_with(prefix))
        .map(String::as_str)
}

/// Entry point for acquiring service locks against one coordination client.
pub struct ServiceLock {
    client: SharedClient,
}

impl ServiceLock {
    pub fn new(client: SharedClient) -> Self {
        ServiceLock { client }
    }

    /// Queues for the lock at `path` and waits until it is held. `data` is
    /// stored in the lock node for observers (typically the holder's
    /// advertised address).
    pub async fn acquire(&self, path: &str, data: Bytes) -> Result<ServiceLockHandle> {
        let uuid = Uuid::new_v4();
        let requested = format!("{path}/{ZLOCK_PREFIX}{uuid}#");
        let node_path = self
            .client
            .create(
                &requested,
                data,
                CreateMode::EphemeralSequential,
                CreatePolicy::FailIfExists,
            )
            .await?;
        let node_name = node_path
            .rsplit('/')
            .next()
            .expect("created node has a name")
            .to_string();
        let (_, sequence) = parse_child(&node_name)
            .ok_or_else(|| Error::Corrupt {
                path: node_path.clone(),
                reason: "created lock node does not match the lock pattern".to_string(),
            })?;

        debug!(%path, %node_name, "queued for service lock");

        loop {
            let children = self.client.get_children(path).await?;
            let sorted = validate_and_sort(children);
            match sorted.first() {
                Some(first) if *first == node_name => break,
                _ => {
                    if !sorted.iter().any(|c| *c == node_name) {
                        // our node vanished while queued; the session is gone
                        return Err(Error::NotFound(node_path));
                    }
                }
            }

            let watch_target = find_lowest_prev_prefix(&sorted, &node_name)
                .expect("non-first entry has a predecessor")
                .to_string();
            let notify = Arc::new(Notify::new());
            let notify_on_event = Arc::clone(&notify);
            let watched_path = format!("{path}/{watch_target}");
            self.client
                .watch(
                    &watched_path,
                    Arc::new(move |event| {
                        if matches!(
                            event,
                            WatchEvent::Deleted(_) | WatchEvent::SessionExpired
                        ) {
                            notify_on_event.notify_one();
                        }
                    }),
                )
                .await?;
            if self.client.exists(&watched_path).await? {
                debug!(%node_name, watching = %watch_target, "waiting for predecessor");
                notify.notified().await;
            }
        }

        info!(%path, %node_name, "service lock acquired");

        let lost = Arc::new(AtomicBool::new(false));
        let lost_flag = Arc::clone(&lost);
        let (loss_tx, loss_rx) = tokio::sync::watch::channel(None);
        self.client
            .watch(
                &node_path,
                Arc::new(move |event| {
                    let reason = match event {
                        WatchEvent::Deleted(_) => Some(LockLossReason::NodeDeleted),
                        WatchEvent::SessionExpired => Some(LockLossReason::SessionExpired),
                        _ => None,
                    };
                    if let Some(reason) = reason {
                        if !lost_flag.swap(true, Ordering::SeqCst) {
                            warn!(?reason, "service lock lost");
                            let _ = loss_tx.send(Some(reason));
                        }
                    }
                }),
            )
            .await?;

        Ok(ServiceLockHandle {
            client: Arc::clone(&self.client),
            lock_id: LockId::new(path, uuid, sequence),
            node_path,
            lost,
            loss_rx,
        })
    }
}

/// A held service lock.
pub struct ServiceLockHandle {
    client: SharedClient,
    lock_id: LockId,
    node_path: String,
    lost: Arc<AtomicBool>,
    loss_rx: tokio::sync::watch::Receiver<Option<LockLossReason>>,
}

impl ServiceLockHandle {
    pub fn lock_id(&self) -> &LockId {
        &self.lock_id
    }

    /// Cheap local check: has a loss event been observed?
    pub fn was_lost(&self) -> bool {
        self.lost.load(Ordering::SeqCst)
    }

    /// Watch stream that yields once when the lock is lost.
    pub fn loss_watch(&self) -> tokio::sync::watch::Receiver<Option<LockLossReason>> {
        self.loss_rx.clone()
    }

    /// Confirms against the coordination service that the lock node still
    /// exists. Lock-guarded work that is about to do something irreversible
    /// verifies here first rather than trusting local state.
    pub async fn verify_lock_at_source(&self) -> Result<bool> {
        if self.was_lost() {
            return Ok(false);
        }
        self.client.exists(&self.node_path).await
    }

    /// Releases the lock by deleting its node.
    pub async fn release(self) -> Result<()> {
        self.client.delete(&self.node_path, None).await
    }

    /// Releases the lock from behind a shared reference, for holders that
    /// keep the handle in an `Arc`. Idempotent.
    pub async fn release_in_place(&self) -> Result<()> {
        self.client.delete(&self.node_path, None).await
    }
}

/// True if `lock_id` names the currently held lock under its path.
pub async fn is_lock_held(client: &dyn crate::client::CoordinationClient, lock_id: &LockId) -> Result<bool> {
    let children = match client.get_children(lock_id.path()).await {
        Ok(children) => children,
        Err(Error::NotFound(_)) => return Ok(false),
        Err(err) => return Err(err),
    };
    let sorted = validate_and_sort(children);
    Ok(sorted.first().map(String::as_str) == Some(lock_id.node_name().as_str()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{ensure_persistent_path, MemoryCoordination};
    use googletest::prelude::*;
    use std::time::Duration;

    #[test]
    fn sort_and_find_lowest_prev_prefix() {
        let children = vec![
            "zlock#00000000-0000-0000-0000-ffffffffffff#0000000007".to_string(),
            "zlock#00000000-0000-0000-0000-eeeeeeeeeeee#0000000010".to_string(),
            "zlock#00000000-0000-0000-0000-bbbbbbbbbbbb#0000000006".to_string(),
            "zlock#00000000-0000-0000-0000-dddddddddddd#0000000008".to_string(),
            "zlock#00000000-0000-0000-0000-bbbbbbbbbbbb#0000000004".to_string(),
            "zlock-123456789".to_string(),
            "zlock#00000000-0000-0000-0000-cccccccccccc#0000000003".to_string(),
            "zlock#00000000-0000-0000-0000-aaaaaaaaaaaa#0000000002".to_string(),
            "zlock#987654321".to_string(),
            "zlock#00000000-0000-0000-0000-aaaaaaaaaaaa#0000000001".to_string(),
        ];

        let valid = validate_and_sort(children);
        let expected: Vec<String> = [
            "zlock#00000000-0000-0000-0000-aaaaaaaaaaaa#0000000001",
            "zlock#00000000-0000-0000-0000-aaaaaaaaaaaa#0000000002",
            "zlock#00000000-0000-0000-0000-cccccccccccc#0000000003",
            "zlock#00000000-0000-0000-0000-bbbbbbbbbbbb#0000000004",
            "zlock#00000000-0000-0000-0000-bbbbbbbbbbbb#0000000006",
            "zlock#00000000-0000-0000-0000-ffffffffffff#0000000007",
            "zlock#00000000-0000-0000-0000-dddddddddddd#0000000008",
            "zlock#00000000-0000-0000-0000-eeeeeeeeeeee#0000000010",
        ]
        .map(str::to_string)
        .into();
        assert_that!(valid.clone(), container_eq(expected));

        // predecessor of #07 is #06 (prefix bbbb...), whose lowest entry is #04
        assert_that!(
            find_lowest_prev_prefix(
                &valid,
                "zlock#00000000-0000-0000-0000-ffffffffffff#0000000007"
            ),
            some(eq("zlock#00000000-0000-0000-0000-bbbbbbbbbbbb#0000000004"))
        );
        assert_that!(
            find_lowest_prev_prefix(
                &valid,
                "zlock#00000000-0000-0000-0000-cccccccccccc#0000000003"
            ),
            some(eq("zlock#00000000-0000-0000-0000-aaaaaaaaaaaa#0000000001"))
        );
        assert_that!(
            find_lowest_prev_prefix(
                &valid,
                "zlock#00000000-0000-0000-0000-eeeeeeeeeeee#0000000010"
            ),
            some(eq("zlock#00000000-0000-0000-0000-dddddddddddd#0000000008"))
        );
        // the lowest entry has no predecessor
        assert_that!(
            find_lowest_prev_prefix(
                &valid,
                "zlock#00000000-0000-0000-0000-aaaaaaaaaaaa#0000000001"
            ),
            none()
        );
        // unknown entries have no predecessor either
        assert_that!(
            find_lowest_prev_prefix(
                &valid,
                "zlock#00000000-0000-0000-0000-111111111111#0000000099"
            ),
            none()
        );
    }

    #[test]
    fn rejects_shorthand_uuid() {
        // parses as a uuid but fails round-trip string equality
        let children = vec!["zlock#1-1-1-1-1#1234567891".to_string()];
        assert_that!(
            Uuid::parse_str("1-1-1-1-1").unwrap().to_string(),
            eq("00000001-0001-0001-0001-000000000001")
        );
        assert_that!(validate_and_sort(children), empty());
    }

    #[test]
    fn accepts_canonical_uuid() {
        let uuid = "219ad0f6-ebe0-416e-a20f-c0f32922841d";
        let children = vec![format!("zlock#{uuid}#1234567891")];
        let valid = validate_and_sort(children);
        assert_that!(valid.len(), eq(1));
        assert_that!(valid[0].as_str(), contains_substring(uuid));
        assert_that!(valid[0].as_str(), contains_substring("1234567891"));
    }

    #[tokio::test]
    async fn election_hands_over_on_release() {
        let coordination = MemoryCoordination::new();
        let client_a = coordination.client();
        let client_b = coordination.client();
        ensure_persistent_path(client_a.as_ref(), "/locks/manager")
            .await
            .unwrap();

        let held = ServiceLock::new(client_a.clone())
            .acquire("/locks/manager", Bytes::from_static(b"a"))
            .await
            .unwrap();
        assert!(held.verify_lock_at_source().await.unwrap());
        assert!(is_lock_held(client_b.as_ref(), held.lock_id()).await.unwrap());

        let waiter = {
            let client_b = client_b.clone();
            tokio::spawn(async move {
                ServiceLock::new(client_b)
                    .acquire("/locks/manager", Bytes::from_static(b"b"))
                    .await
                    .unwrap()
            })
        };
        // the waiter must not get the lock while it is held
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!waiter.is_finished());

        held.release().await.unwrap();
        let second = tokio::time::timeout(Duration::from_secs(5), waiter)
            .await
            .expect("waiter acquires after release")
            .unwrap();
        assert!(second.verify_lock_at_source().await.unwrap());
    }

    #[tokio::test]
    async fn session_expiry_loses_the_lock() {
        let coordination = MemoryCoordination::new();
        let client = coordination.client();
        ensure_persistent_path(client.as_ref(), "/locks/tservers/h1")
            .await
            .unwrap();

        let held = ServiceLock::new(client.clone())
            .acquire("/locks/tservers/h1", Bytes::new())
            .await
            .unwrap();
        let lock_id = held.lock_id().clone();

        let observer = coordination.client();
        assert!(is_lock_held(observer.as_ref(), &lock_id).await.unwrap());

        coordination.expire_session(client.session_id());
        assert!(held.was_lost());
        assert!(!held.verify_lock_at_source().await.unwrap());
        assert!(!is_lock_held(observer.as_ref(), &lock_id).await.unwrap());
    }
}
