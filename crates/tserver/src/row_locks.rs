// Copyright (c) 2023 - 2025 Tessera Contributors.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Per-row locks for the conditional-update path. Acquisition never blocks:
//! a contended row's mutations are deferred to the next round instead, so a
//! slow row cannot stall a whole request.

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::OwnedMutexGuard;

#[derive(Default)]
pub struct RowLocks {
    locks: Mutex<HashMap<Bytes, Arc<tokio::sync::Mutex<()>>>>,
}

/// A held row lock. Dropping it releases the row.
pub struct RowLock {
    _guard: OwnedMutexGuard<()>,
    row: Bytes,
}

impl RowLock {
    pub fn row(&self) -> &Bytes {
        &self.row
    }
}

impl RowLocks {
    /// Tries to lock every row in `rows` (callers pass them sorted).
    /// Returns the acquired locks and the rows that were contended.
    pub fn try_acquire(&self, rows: impl IntoIterator<Item = Bytes>) -> (Vec<RowLock>, Vec<Bytes>) {
        let mut acquired = Vec::new();
        let mut contended = Vec::new();
        for row in rows {
            let lock = {
                let mut locks = self.locks.lock();
                Arc::clone(locks.entry(row.clone()).or_default())
            };
            match lock.try_lock_owned() {
                Ok(guard) => acquired.push(RowLock {
                    _guard: guard,
                    row,
                }),
                Err(_) => contended.push(row),
            }
        }
        (acquired, contended)
    }

    /// Drops lock entries nobody holds, keeping the table bounded.
    pub fn prune(&self) {
        self.locks
            .lock()
            .retain(|_, lock| Arc::strong_count(lock) > 1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(name: &str) -> Bytes {
        Bytes::copy_from_slice(name.as_bytes())
    }

    #[test]
    fn second_acquisition_of_held_row_is_deferred() {
        let locks = RowLocks::default();
        let (held, contended) = locks.try_acquire([row("a"), row("b")]);
        assert_eq!(held.len(), 2);
        assert!(contended.is_empty());

        let (held2, contended2) = locks.try_acquire([row("a"), row("c")]);
        assert_eq!(held2.len(), 1);
        assert_eq!(held2[0].row(), &row("c"));
        assert_eq!(contended2, vec![row("a")]);

        drop(held);
        let (held3, contended3) = locks.try_acquire([row("a")]);
        assert_eq!(held3.len(), 1);
        assert!(contended3.is_empty());
    }

    #[test]
    fn prune_drops_unheld_rows() {
        let locks = RowLocks::default();
        {
            let _held = locks.try_acquire([row("a")]);
        }
        locks.prune();
        assert!(locks.locks.lock().is_empty());
    }
}
