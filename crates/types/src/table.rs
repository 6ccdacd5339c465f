// Copyright (c) 2023 - 2025 Tessera Contributors.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

use bytestring::ByteString;
use serde::{Deserialize, Serialize};

/// Identifies a table. Table ids are short, stable strings assigned at table
/// creation time and never reused; table *names* can be renamed without
/// touching any tablet metadata.
#[derive(
    Debug,
    Clone,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
    derive_more::Display,
)]
#[serde(transparent)]
pub struct TableId(ByteString);

impl TableId {
    pub fn new(id: impl Into<ByteString>) -> Self {
        TableId(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The id of the root metadata table.
    pub fn root() -> Self {
        TableId(ByteString::from_static("+r"))
    }

    /// The id of the system metadata table.
    pub fn metadata() -> Self {
        TableId(ByteString::from_static("!0"))
    }

    pub fn is_system(&self) -> bool {
        *self == Self::root() || *self == Self::metadata()
    }
}

impl From<&str> for TableId {
    fn from(value: &str) -> Self {
        TableId(ByteString::from(value))
    }
}

/// Identifies a namespace, the unit of grouping for tables.
#[derive(
    Debug,
    Clone,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
    derive_more::Display,
)]
#[serde(transparent)]
pub struct NamespaceId(ByteString);

impl NamespaceId {
    pub fn new(id: impl Into<ByteString>) -> Self {
        NamespaceId(id.into())
    }

    pub fn default_namespace() -> Self {
        NamespaceId(ByteString::from_static("+default"))
    }
}

/// The lifecycle state of a table as recorded in the coordination service.
///
/// `Unknown` is reported for tables that have no node in the coordination
/// service, for example because the table was deleted while a scan over its
/// tablets was in flight. Tablets of unknown tables are skipped, never acted
/// on.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display, strum::EnumString,
)]
pub enum TableState {
    Online,
    Offline,
    Deleting,
    New,
    Unknown,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn system_table_ids() {
        assert!(TableId::root().is_system());
        assert!(TableId::metadata().is_system());
        assert!(!TableId::new("1a").is_system());
    }
}
