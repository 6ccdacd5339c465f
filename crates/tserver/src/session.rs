// Copyright (c) 2023 - 2025 Tessera Contributors.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Conditional-update sessions. A session is strictly single-threaded: it
//! is reserved for the duration of one update, and invalidation waits for
//! the running update to finish before it fences the session for good.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::debug;

use tessera_types::{Durability, TableId};

/// State of one conditional-update session.
pub struct ConditionalSession {
    pub table: TableId,
    pub auths: Vec<Bytes>,
    pub durability: Durability,
    /// Once set, running updates abandon their work and nothing new starts.
    pub interrupt: AtomicBool,
}

struct SessionSlot {
    session: Arc<ConditionalSession>,
    reserved: bool,
    last_access: Instant,
}

/// Registry of sessions with reserve/unreserve semantics and idle expiry.
pub struct SessionManager {
    slots: Mutex<HashMap<u64, SessionSlot>>,
    released: Notify,
    next_id: AtomicU64,
    max_idle: Duration,
}

impl SessionManager {
    pub fn new(max_idle: Duration) -> Self {
        SessionManager {
            slots: Mutex::new(HashMap::new()),
            released: Notify::new(),
            next_id: AtomicU64::new(1),
            max_idle,
        }
    }

    pub fn max_idle_millis(&self) -> u64 {
        self.max_idle.as_millis() as u64
    }

    pub fn create(&self, session: ConditionalSession) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.slots.lock().insert(
            id,
            SessionSlot {
                session: Arc::new(session),
                reserved: false,
                last_access: Instant::now(),
            },
        );
        id
    }

    pub fn get(&self, id: u64) -> Option<Arc<ConditionalSession>> {
        self.slots.lock().get(&id).map(|slot| Arc::clone(&slot.session))
    }

    /// Claims the session for one update. Fails when the session does not
    /// exist, has idled out, or is already claimed by a concurrent update.
    pub fn try_reserve(&self, id: u64) -> Option<Arc<ConditionalSession>> {
        let mut slots = self.slots.lock();
        let slot = slots.get_mut(&id)?;
        if slot.reserved || slot.last_access.elapsed() > self.max_idle {
            return None;
        }
        slot.reserved = true;
        Some(Arc::clone(&slot.session))
    }

    /// Claims the session, waiting for a running update to release it.
    /// Returns `None` once the session is gone.
    pub async fn reserve_wait(&self, id: u64) -> Option<Arc<ConditionalSession>> {
        loop {
            {
                let mut slots = self.slots.lock();
                let slot = slots.get_mut(&id)?;
                if !slot.reserved {
                    slot.reserved = true;
                    return Some(Arc::clone(&slot.session));
                }
            }
            self.released.notified().await;
        }
    }

    pub fn unreserve(&self, id: u64) {
        let mut slots = self.slots.lock();
        if let Some(slot) = slots.get_mut(&id) {
            slot.reserved = false;
            slot.last_access = Instant::now();
        }
        drop(slots);
        self.released.notify_waiters();
    }

    /// Removes the session; the caller must hold the reservation (or know
    /// nobody does).
    pub fn remove(&self, id: u64) {
        if self.slots.lock().remove(&id).is_some() {
            debug!(session = id, "session removed");
        }
        self.released.notify_waiters();
    }

    /// Drops idle sessions past their ttl.
    pub fn expire_idle(&self) {
        let max_idle = self.max_idle;
        self.slots
            .lock()
            .retain(|_, slot| slot.reserved || slot.last_access.elapsed() <= max_idle);
    }
}
