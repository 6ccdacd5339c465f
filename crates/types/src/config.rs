// Copyright (c) 2023 - 2025 Tessera Contributors.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Configuration options for the core subsystems. Options structs are plain
//! serde types with sensible defaults; processes load them once at startup
//! and pass them down explicitly.

use std::num::NonZeroUsize;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_with::serde_as;

use crate::mutation::Durability;
use crate::retries::RetryPolicy;

#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct WalOptions {
    /// Roll to a fresh log once the current one is estimated to be this big.
    pub max_size: u64,
    /// Roll to a fresh log once the current one is this old.
    #[serde_as(as = "serde_with::DisplayFromStr")]
    pub max_age: humantime::Duration,
    /// Policy for creating a new log file.
    pub create_retry: RetryPolicy,
    /// Policy for an individual write to the current log.
    pub write_retry: RetryPolicy,
}

impl Default for WalOptions {
    fn default() -> Self {
        WalOptions {
            max_size: 1024 * 1024 * 1024,
            max_age: Duration::from_secs(24 * 60 * 60).into(),
            create_retry: RetryPolicy::exponential(
                Duration::from_millis(250),
                2.0,
                Some(10),
                Some(Duration::from_secs(30)),
            ),
            write_retry: RetryPolicy::exponential(
                Duration::from_millis(100),
                2.0,
                Some(8),
                Some(Duration::from_secs(10)),
            ),
        }
    }
}

impl WalOptions {
    pub fn max_age(&self) -> Duration {
        self.max_age.into()
    }
}

#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct ManagerOptions {
    /// Pause between full scans of a data level when nothing is happening.
    #[serde_as(as = "serde_with::DisplayFromStr")]
    pub tablet_group_watcher_interval: humantime::Duration,
    /// Cap on outstanding assignment/unassignment work per live tablet
    /// server within one scan; exceeding it flushes buffered changes.
    pub max_tserver_work_chunk: usize,
    /// Pause between scans after an error.
    #[serde_as(as = "serde_with::DisplayFromStr")]
    pub wait_between_errors: humantime::Duration,
    /// Number of fate worker tasks per store.
    pub fate_workers: NonZeroUsize,
    /// How often dead fate reservations are reclaimed.
    #[serde_as(as = "serde_with::DisplayFromStr")]
    pub fate_dead_reservation_interval: humantime::Duration,
}

impl Default for ManagerOptions {
    fn default() -> Self {
        ManagerOptions {
            tablet_group_watcher_interval: Duration::from_secs(5).into(),
            max_tserver_work_chunk: 5_000,
            wait_between_errors: Duration::from_secs(1).into(),
            fate_workers: NonZeroUsize::new(4).expect("non-zero"),
            fate_dead_reservation_interval: Duration::from_secs(30).into(),
        }
    }
}

#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct TableOptions {
    /// Reject a bulk import that would push any tablet past this many files.
    pub bulk_max_tablet_files: usize,
    /// Reject a bulk import in which one file maps to more than this many
    /// tablets.
    pub bulk_max_tablets: usize,
    /// Pause further bulk loads into a tablet once it holds more than this
    /// many files. Blocks other bulk transactions, not user writes.
    pub file_pause: usize,
    /// Stop evaluating conditions against a tablet whose row view would
    /// need more open files than this. Affected mutations are ignored and
    /// the client retries after re-locating the tablet.
    pub scan_max_open_files: usize,
    /// How long an unloaded tablet waits for its dead server to return
    /// before being reassigned elsewhere.
    #[serde_as(as = "serde_with::DisplayFromStr")]
    pub suspend_duration: humantime::Duration,
    /// Durability applied when a write does not request a stronger one.
    pub durability: Durability,
}

impl Default for TableOptions {
    fn default() -> Self {
        TableOptions {
            bulk_max_tablet_files: 1_000,
            bulk_max_tablets: 100,
            file_pause: 30,
            scan_max_open_files: 100,
            suspend_duration: Duration::from_secs(0).into(),
            durability: Durability::Sync,
        }
    }
}

impl TableOptions {
    pub fn suspend_duration(&self) -> Duration {
        self.suspend_duration.into()
    }
}

#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct ClientOptions {
    /// Give up on a conditional mutation once this much time has passed
    /// since it entered the writer.
    #[serde_as(as = "serde_with::DisplayFromStr")]
    pub conditional_timeout: humantime::Duration,
    /// Maximum number of concurrent server sends per conditional writer.
    pub conditional_write_threads: NonZeroUsize,
}

impl Default for ClientOptions {
    fn default() -> Self {
        ClientOptions {
            conditional_timeout: Duration::from_secs(u64::MAX / 1_000_000).into(),
            conditional_write_threads: NonZeroUsize::new(3).expect("non-zero"),
        }
    }
}

impl ClientOptions {
    pub fn conditional_timeout(&self) -> Duration {
        self.conditional_timeout.into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_round_trip_through_serde() {
        let opts = WalOptions::default();
        let json = serde_json::to_string(&opts).unwrap();
        let back: WalOptions = serde_json::from_str(&json).unwrap();
        assert_eq!(back.max_size, opts.max_size);

        let opts = TableOptions::default();
        let json = serde_json::to_string(&opts).unwrap();
        let back: TableOptions = serde_json::from_str(&json).unwrap();
        assert_eq!(back.bulk_max_tablet_files, opts.bulk_max_tablet_files);
    }
}
