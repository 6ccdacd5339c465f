// Copyright (c) 2023 - 2025 Tessera Contributors.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Framed log records. Each frame is `[len u32][crc32c u32][payload]`, so a
//! reader can walk a log front to back and stop cleanly at a torn tail.

use bytes::{Buf, BufMut, BytesMut};
use serde::{Deserialize, Serialize};

use tessera_types::{Durability, KeyExtent, Mutation};

use crate::{Result, WalError};

const FRAME_HEADER_LEN: usize = 8;

/// One record in a write-ahead log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum LogEvent {
    /// Binds a tablet to this log: every later event for `tablet_log_id`
    /// belongs to `extent`. Written once per tablet per log, before the
    /// tablet's first mutation in it.
    DefineTablet {
        tablet_log_id: u64,
        extent: KeyExtent,
    },
    /// A batch of mutations committed to one tablet.
    Mutations {
        tablet_log_id: u64,
        seq: u64,
        mutations: Vec<Mutation>,
        durability: Durability,
    },
    /// A minor compaction of the tablet's in-memory data into `file` began.
    MinorCompactionStarted {
        tablet_log_id: u64,
        seq: u64,
        file: String,
    },
    /// The minor compaction for `seq` completed; mutations at or below it
    /// are safe in files.
    MinorCompactionFinished { tablet_log_id: u64, seq: u64 },
}

impl LogEvent {
    pub fn tablet_log_id(&self) -> u64 {
        match self {
            LogEvent::DefineTablet { tablet_log_id, .. }
            | LogEvent::Mutations { tablet_log_id, .. }
            | LogEvent::MinorCompactionStarted { tablet_log_id, .. }
            | LogEvent::MinorCompactionFinished { tablet_log_id, .. } => *tablet_log_id,
        }
    }
}

/// Appends one framed event to `buf`.
pub fn write_frame(buf: &mut BytesMut, event: &LogEvent) {
    let payload = bincode::serialize(event).expect("log event serializes");
    buf.put_u32_le(payload.len() as u32);
    buf.put_u32_le(crc32c::crc32c(&payload));
    buf.put_slice(&payload);
}

/// Reads every complete frame from `data`. A truncated final frame is
/// ignored (a crash mid-append); a checksum mismatch in the middle is an
/// error.
pub fn read_frames(path: &str, data: &[u8]) -> Result<Vec<LogEvent>> {
    let mut events = Vec::new();
    let mut cursor = data;
    let mut offset: u64 = 0;

    while cursor.len() >= FRAME_HEADER_LEN {
        let mut header = &cursor[0..FRAME_HEADER_LEN];
        let len = header.get_u32_le() as usize;
        let checksum = header.get_u32_le();
        if cursor.len() < FRAME_HEADER_LEN + len {
            // torn tail from a crash mid-append
            break;
        }
        let payload = &cursor[FRAME_HEADER_LEN..FRAME_HEADER_LEN + len];
        if crc32c::crc32c(payload) != checksum {
            let is_tail = cursor.len() == FRAME_HEADER_LEN + len;
            if is_tail {
                break;
            }
            return Err(WalError::CorruptFrame {
                path: path.to_string(),
                offset,
            });
        }
        let event = bincode::deserialize(payload).map_err(|_| WalError::CorruptFrame {
            path: path.to_string(),
            offset,
        })?;
        events.push(event);
        cursor = &cursor[FRAME_HEADER_LEN + len..];
        offset += (FRAME_HEADER_LEN + len) as u64;
    }
    Ok(events)
}

/// Serialized size of one event's frame, for log-size accounting.
pub fn frame_len(event: &LogEvent) -> usize {
    bincode::serialized_size(event).expect("log event serializes") as usize + FRAME_HEADER_LEN
}

#[cfg(test)]
mod tests {
    use super::*;
    use tessera_types::TableId;

    fn event(seq: u64) -> LogEvent {
        LogEvent::Mutations {
            tablet_log_id: 7,
            seq,
            mutations: vec![Mutation::new(&b"row1"[..]).put(&b"f"[..], &b"q"[..], &b"v"[..])],
            durability: Durability::Sync,
        }
    }

    #[test]
    fn frames_round_trip() {
        let mut buf = BytesMut::new();
        let define = LogEvent::DefineTablet {
            tablet_log_id: 7,
            extent: KeyExtent::whole_table(TableId::new("1")),
        };
        write_frame(&mut buf, &define);
        write_frame(&mut buf, &event(1));
        write_frame(&mut buf, &event(2));

        let events = read_frames("/wal/x", &buf).unwrap();
        assert_eq!(events.len(), 3);
        assert_eq!(events[0], define);
        assert_eq!(events[2], event(2));
    }

    #[test]
    fn torn_tail_is_ignored() {
        let mut buf = BytesMut::new();
        write_frame(&mut buf, &event(1));
        let full_len = buf.len();
        write_frame(&mut buf, &event(2));
        // crash mid-append of the second frame
        let torn = &buf[..full_len + 5];

        let events = read_frames("/wal/x", torn).unwrap();
        assert_eq!(events, vec![event(1)]);
    }

    #[test]
    fn mid_log_corruption_is_an_error() {
        let mut buf = BytesMut::new();
        write_frame(&mut buf, &event(1));
        write_frame(&mut buf, &event(2));
        let mut bytes = buf.to_vec();
        // flip a payload byte in the first frame
        bytes[10] ^= 0xff;
        assert!(matches!(
            read_frames("/wal/x", &bytes),
            Err(WalError::CorruptFrame { .. })
        ));
    }
}
