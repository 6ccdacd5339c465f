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

use crate::lock::LockId;

/// Which fate store a transaction lives in: `Meta` transactions are kept in
/// the coordination service and may touch metadata-level tablets; `User`
/// transactions are kept in the metadata table itself.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
    strum::EnumIter,
)]
#[strum(serialize_all = "UPPERCASE")]
pub enum FateInstanceType {
    Meta,
    User,
}

/// Identifies one fault-tolerant transaction. The canonical form is
/// `FATE:<type>:<uuid>`, which is what operators pass to the admin tool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct FateId {
    pub instance_type: FateInstanceType,
    pub uuid: Uuid,
}

impl FateId {
    pub fn new(instance_type: FateInstanceType, uuid: Uuid) -> Self {
        FateId {
            instance_type,
            uuid,
        }
    }

    pub fn random(instance_type: FateInstanceType) -> Self {
        FateId {
            instance_type,
            uuid: Uuid::new_v4(),
        }
    }

    pub fn canonical(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for FateId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FATE:{}:{}", self.instance_type, self.uuid)
    }
}

#[derive(Debug, thiserror::Error)]
#[error("malformed fate id '{0}'")]
pub struct MalformedFateId(String);

impl FromStr for FateId {
    type Err = MalformedFateId;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.splitn(3, ':');
        let (prefix, itype, uuid) = (parts.next(), parts.next(), parts.next());
        match (prefix, itype, uuid) {
            (Some("FATE"), Some(itype), Some(uuid)) => {
                let instance_type = itype
                    .parse::<FateInstanceType>()
                    .map_err(|_| MalformedFateId(s.to_string()))?;
                let uuid = Uuid::parse_str(uuid).map_err(|_| MalformedFateId(s.to_string()))?;
                Ok(FateId {
                    instance_type,
                    uuid,
                })
            }
            _ => Err(MalformedFateId(s.to_string())),
        }
    }
}

/// Marks a transaction as claimed by one worker. The `lock_id` ties the claim
/// to the holder's service lock, so claims of dead processes can be detected
/// and reclaimed; the `uuid` distinguishes claims made under the same lock.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, derive_more::Display)]
#[display("{lock_id}:{uuid}")]
pub struct FateReservation {
    pub lock_id: LockId,
    pub uuid: Uuid,
}

impl FateReservation {
    pub fn new(lock_id: LockId) -> Self {
        FateReservation {
            lock_id,
            uuid: Uuid::new_v4(),
        }
    }

    pub fn from_parts(lock_id: LockId, uuid: Uuid) -> Self {
        FateReservation { lock_id, uuid }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonical_round_trip() {
        let id = FateId::random(FateInstanceType::User);
        let parsed: FateId = id.canonical().parse().unwrap();
        assert_eq!(id, parsed);
        assert!(id.canonical().starts_with("FATE:USER:"));
    }

    #[test]
    fn rejects_malformed() {
        assert!("FATE:USER:not-a-uuid".parse::<FateId>().is_err());
        assert!("FATE:OTHER:11111111-1111-1111-1111-111111111111"
            .parse::<FateId>()
            .is_err());
        assert!("11111111-1111-1111-1111-111111111111"
            .parse::<FateId>()
            .is_err());
    }
}
