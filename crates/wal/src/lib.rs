// Copyright (c) 2023 - 2025 Tessera Contributors.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! The write-ahead log subsystem: framed log files on the distributed
//! filesystem, a rotating per-server current log fed by a background
//! next-log maker, and recovery resolution for replaying closed logs.

pub mod dfs;
pub mod dfs_logger;
pub mod format;
pub mod logger;
pub mod recovery;

pub use dfs::{Dfs, LocalDfs};
pub use dfs_logger::DfsLogger;
pub use format::LogEvent;
pub use logger::{LogParticipant, TabletServerLogger};
pub use recovery::{ResolvedSortedLog, SortedLogRecovery};

#[derive(Debug, thiserror::Error)]
pub enum WalError {
    #[error("log is closed")]
    LogClosed,
    #[error("wal i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("wal marker error: {0}")]
    Marker(#[from] tessera_coordination::Error),
    #[error("corrupt wal frame in {path} at offset {offset}")]
    CorruptFrame { path: String, offset: u64 },
    #[error("wal writer is gone")]
    WriterGone,
}

pub type Result<T, E = WalError> = std::result::Result<T, E>;
