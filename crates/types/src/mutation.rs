// Copyright (c) 2023 - 2025 Tessera Contributors.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

use std::cmp::Ordering;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// The full coordinate of a cell: row, column family, column qualifier,
/// visibility expression and timestamp.
///
/// Keys sort by row, family, qualifier, visibility ascending and then by
/// timestamp *descending*, so the newest version of a cell comes first.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Key {
    pub row: Bytes,
    pub family: Bytes,
    pub qualifier: Bytes,
    pub visibility: Bytes,
    pub timestamp: i64,
}

impl Ord for Key {
    fn cmp(&self, other: &Self) -> Ordering {
        self.row
            .cmp(&other.row)
            .then_with(|| self.family.cmp(&other.family))
            .then_with(|| self.qualifier.cmp(&other.qualifier))
            .then_with(|| self.visibility.cmp(&other.visibility))
            .then_with(|| other.timestamp.cmp(&self.timestamp))
    }
}

impl PartialOrd for Key {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// One column change carried by a [`Mutation`]. A `None` value is a delete.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnUpdate {
    pub family: Bytes,
    pub qualifier: Bytes,
    pub visibility: Bytes,
    /// When unset, the server assigns the tablet's current time.
    pub timestamp: Option<i64>,
    pub value: Option<Bytes>,
}

/// A batch of column changes to a single row, applied atomically by the
/// owning tablet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mutation {
    row: Bytes,
    updates: Vec<ColumnUpdate>,
}

impl Mutation {
    pub fn new(row: impl Into<Bytes>) -> Self {
        Mutation {
            row: row.into(),
            updates: Vec::new(),
        }
    }

    pub fn row(&self) -> &Bytes {
        &self.row
    }

    pub fn updates(&self) -> &[ColumnUpdate] {
        &self.updates
    }

    pub fn put(
        mut self,
        family: impl Into<Bytes>,
        qualifier: impl Into<Bytes>,
        value: impl Into<Bytes>,
    ) -> Self {
        self.updates.push(ColumnUpdate {
            family: family.into(),
            qualifier: qualifier.into(),
            visibility: Bytes::new(),
            timestamp: None,
            value: Some(value.into()),
        });
        self
    }

    pub fn put_visible(
        mut self,
        family: impl Into<Bytes>,
        qualifier: impl Into<Bytes>,
        visibility: impl Into<Bytes>,
        value: impl Into<Bytes>,
    ) -> Self {
        self.updates.push(ColumnUpdate {
            family: family.into(),
            qualifier: qualifier.into(),
            visibility: visibility.into(),
            timestamp: None,
            value: Some(value.into()),
        });
        self
    }

    pub fn delete(mut self, family: impl Into<Bytes>, qualifier: impl Into<Bytes>) -> Self {
        self.updates.push(ColumnUpdate {
            family: family.into(),
            qualifier: qualifier.into(),
            visibility: Bytes::new(),
            timestamp: None,
            value: None,
        });
        self
    }

    /// Estimate used for write-ahead log size accounting.
    pub fn num_bytes(&self) -> usize {
        self.row.len()
            + self
                .updates
                .iter()
                .map(|u| {
                    u.family.len()
                        + u.qualifier.len()
                        + u.visibility.len()
                        + u.value.as_ref().map(Bytes::len).unwrap_or(0)
                        + 16
                })
                .sum::<usize>()
    }
}

/// A condition a [`ConditionalMutation`] requires of the current row state.
///
/// With `value: Some(v)` the referenced cell must exist and equal `v`; with
/// `value: None` the cell must be absent. `iterators` name the server-side
/// iterator stack to apply to the row view before checking.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Condition {
    pub family: Bytes,
    pub qualifier: Bytes,
    pub visibility: Bytes,
    pub timestamp: Option<i64>,
    pub value: Option<Bytes>,
    pub iterators: Vec<IterConfig>,
}

impl Condition {
    pub fn new(family: impl Into<Bytes>, qualifier: impl Into<Bytes>) -> Self {
        Condition {
            family: family.into(),
            qualifier: qualifier.into(),
            visibility: Bytes::new(),
            timestamp: None,
            value: None,
            iterators: Vec::new(),
        }
    }

    pub fn with_value(mut self, value: impl Into<Bytes>) -> Self {
        self.value = Some(value.into());
        self
    }

    pub fn with_visibility(mut self, visibility: impl Into<Bytes>) -> Self {
        self.visibility = visibility.into();
        self
    }

    pub fn with_timestamp(mut self, ts: i64) -> Self {
        self.timestamp = Some(ts);
        self
    }
}

/// Sort order used for a mutation's conditions before they are shipped:
/// `(family, qualifier, visibility, timestamp desc)`, giving the server
/// sequential locality when probing the row.
pub fn condition_order(a: &Condition, b: &Condition) -> Ordering {
    a.family
        .cmp(&b.family)
        .then_with(|| a.qualifier.cmp(&b.qualifier))
        .then_with(|| a.visibility.cmp(&b.visibility))
        .then_with(|| match (a.timestamp, b.timestamp) {
            (None, None) => Ordering::Equal,
            (None, Some(_)) => Ordering::Less,
            (Some(_), None) => Ordering::Greater,
            (Some(x), Some(y)) => y.cmp(&x),
        })
}

/// Named server-side iterator with options, applied to the row view during
/// condition evaluation. The iterator implementations themselves live
/// outside the core.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IterConfig {
    pub name: String,
    pub options: Vec<(String, String)>,
}

/// A mutation that only applies if all of its conditions hold.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConditionalMutation {
    pub mutation: Mutation,
    pub conditions: Vec<Condition>,
}

impl ConditionalMutation {
    pub fn new(mutation: Mutation) -> Self {
        ConditionalMutation {
            mutation,
            conditions: Vec::new(),
        }
    }

    pub fn with_condition(mut self, condition: Condition) -> Self {
        self.conditions.push(condition);
        self
    }

    pub fn row(&self) -> &Bytes {
        self.mutation.row()
    }
}

/// Outcome of one conditional mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, strum::Display)]
pub enum ConditionalStatus {
    /// Conditions held; the mutation was durably applied.
    Accepted,
    /// At least one condition did not hold.
    Rejected,
    /// The mutation violated a constraint.
    Violated,
    /// The tablet could not process the mutation (closed, interrupted, too
    /// many open files, session invalidated); the client retries.
    Ignored,
    /// It cannot be determined whether the mutation was applied. Only
    /// reported after the session-invalidation fence has run.
    Unknown,
    /// A condition carries a visibility the submitter cannot read.
    InvisibleVisibility,
}

/// Durability required before a write is acknowledged, strongest last.
/// A request's durability combines with the tablet's default by taking the
/// stronger of the two.
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
)]
pub enum Durability {
    /// Do not write to the write-ahead log at all.
    None,
    /// Write to the log, do not wait for it to reach the device.
    Log,
    /// Write to the log and flush the stream.
    Flush,
    /// Write to the log and sync to the device.
    Sync,
}

impl Durability {
    pub fn resolve(request: Durability, tablet_default: Durability) -> Durability {
        request.max(tablet_default)
    }
}
