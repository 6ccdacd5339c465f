// Copyright (c) 2023 - 2025 Tessera Contributors.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Prefix of every service-lock child node.
pub const ZLOCK_PREFIX: &str = "zlock#";

/// Identifies one held service lock: the lock path, the holder's uuid and the
/// sequence number the coordination service assigned to the holder's child
/// node.
///
/// The serialized form is `<path>#<uuid>#<seq>`; remote observers verify a
/// `LockId` is still held by listing the lock path and matching the child
/// node it names.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LockId {
    path: String,
    uuid: Uuid,
    sequence: u64,
}

impl LockId {
    pub fn new(path: impl Into<String>, uuid: Uuid, sequence: u64) -> Self {
        let path = path.into();
        assert!(
            !path.contains('#'),
            "lock paths must not contain '#': {path}"
        );
        LockId {
            path,
            uuid,
            sequence,
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn uuid(&self) -> Uuid {
        self.uuid
    }

    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    /// The child node name this lock id refers to, e.g.
    /// `zlock#<uuid>#0000000042`.
    pub fn node_name(&self) -> String {
        format!("{ZLOCK_PREFIX}{}#{:010}", self.uuid, self.sequence)
    }

    /// The full coordination-service path of the child node.
    pub fn node_path(&self) -> String {
        format!("{}/{}", self.path, self.node_name())
    }
}

impl fmt::Display for LockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}#{:010}", self.path, self.uuid, self.sequence)
    }
}

#[derive(Debug, thiserror::Error)]
#[error("malformed lock id '{0}'")]
pub struct MalformedLockId(String);

impl FromStr for LockId {
    type Err = MalformedLockId;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let malformed = || MalformedLockId(s.to_string());
        let mut parts = s.split('#');
        let path = parts.next().ok_or_else(malformed)?;
        let uuid_str = parts.next().ok_or_else(malformed)?;
        let seq = parts.next().ok_or_else(malformed)?;
        if parts.next().is_some() || path.is_empty() {
            return Err(malformed());
        }
        let uuid = Uuid::parse_str(uuid_str).map_err(|_| malformed())?;
        // round-trip equality rejects shorthand uuid spellings
        if uuid.to_string() != uuid_str {
            return Err(malformed());
        }
        let sequence: u64 = seq.parse().map_err(|_| malformed())?;
        Ok(LockId {
            path: path.to_string(),
            uuid,
            sequence,
        })
    }
}

impl Serialize for LockId {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for LockId {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serialize_round_trip() {
        let uuid = Uuid::new_v4();
        let lock = LockId::new("/tessera/locks/tservers/host1:9997", uuid, 42);
        let serialized = lock.to_string();
        let parsed: LockId = serialized.parse().unwrap();
        assert_eq!(lock, parsed);
        assert_eq!(parsed.to_string(), serialized);
    }

    #[test]
    fn rejects_shorthand_uuid() {
        // parses as a uuid but does not round-trip to the same string
        let err = "/locks#1-1-1-1-1#0000000001".parse::<LockId>();
        assert!(err.is_err());
    }

    #[test]
    fn node_name_matches_lock_pattern() {
        let uuid = Uuid::new_v4();
        let lock = LockId::new("/locks/managers", uuid, 7);
        assert_eq!(lock.node_name(), format!("zlock#{uuid}#0000000007"));
    }
}
