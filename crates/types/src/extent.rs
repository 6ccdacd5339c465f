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
use std::fmt;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::table::TableId;

/// Identifies a tablet: a contiguous key range of one table.
///
/// A row `r` belongs to the tablet where `prev_end_row < r <= end_row`, with
/// `None` meaning -infinity for `prev_end_row` and +infinity for `end_row`.
/// The live tablets of a table partition its key space; no two may overlap.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct KeyExtent {
    table: TableId,
    end_row: Option<Bytes>,
    prev_end_row: Option<Bytes>,
}

impl KeyExtent {
    pub fn new(
        table: TableId,
        end_row: Option<impl Into<Bytes>>,
        prev_end_row: Option<impl Into<Bytes>>,
    ) -> Self {
        let end_row = end_row.map(Into::into);
        let prev_end_row = prev_end_row.map(Into::into);
        if let (Some(end), Some(prev)) = (&end_row, &prev_end_row) {
            assert!(prev < end, "prev_end_row must sort before end_row");
        }
        KeyExtent {
            table,
            end_row,
            prev_end_row,
        }
    }

    /// The whole-range extent of a table, used before any split exists.
    pub fn whole_table(table: TableId) -> Self {
        KeyExtent {
            table,
            end_row: None,
            prev_end_row: None,
        }
    }

    pub fn table(&self) -> &TableId {
        &self.table
    }

    pub fn end_row(&self) -> Option<&[u8]> {
        self.end_row.as_deref()
    }

    pub fn prev_end_row(&self) -> Option<&[u8]> {
        self.prev_end_row.as_deref()
    }

    pub fn is_root(&self) -> bool {
        *self.table() == TableId::root()
    }

    pub fn contains_row(&self, row: &[u8]) -> bool {
        let above_prev = match &self.prev_end_row {
            None => true,
            Some(prev) => row > prev.as_ref(),
        };
        let at_or_below_end = match &self.end_row {
            None => true,
            Some(end) => row <= end.as_ref(),
        };
        above_prev && at_or_below_end
    }

    /// True if this extent's range `(prev_end_row, end_row]` intersects the
    /// range `(start, end]`.
    pub fn overlaps(&self, start: Option<&[u8]>, end: Option<&[u8]>) -> bool {
        let starts_before_end = match (self.prev_end_row.as_deref(), end) {
            (Some(prev), Some(end)) => prev < end,
            _ => true,
        };
        let ends_after_start = match (self.end_row.as_deref(), start) {
            (Some(my_end), Some(start)) => my_end > start,
            _ => true,
        };
        starts_before_end && ends_after_start
    }

    /// The metadata-table row key for this tablet: `<table>;<end_row>`, with
    /// `<` sorting the infinite-end tablet after every bounded one.
    pub fn meta_row(&self) -> Bytes {
        let mut key = Vec::with_capacity(self.table.as_str().len() + 1 + 24);
        key.extend_from_slice(self.table.as_str().as_bytes());
        match &self.end_row {
            Some(end) => {
                key.push(b';');
                key.extend_from_slice(end);
            }
            None => key.push(b'<'),
        }
        Bytes::from(key)
    }
}

fn fmt_row(f: &mut fmt::Formatter<'_>, row: Option<&[u8]>, infinity: &str) -> fmt::Result {
    match row {
        None => f.write_str(infinity),
        Some(row) => {
            for b in row {
                if b.is_ascii_graphic() {
                    write!(f, "{}", *b as char)?;
                } else {
                    write!(f, "\\x{b:02x}")?;
                }
            }
            Ok(())
        }
    }
}

impl fmt::Display for KeyExtent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{};", self.table)?;
        fmt_row(f, self.end_row(), "+inf")?;
        f.write_str(";")?;
        fmt_row(f, self.prev_end_row(), "-inf")
    }
}

impl fmt::Debug for KeyExtent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl Ord for KeyExtent {
    fn cmp(&self, other: &Self) -> Ordering {
        // None end rows sort last within a table, matching meta_row() order.
        self.table
            .cmp(&other.table)
            .then_with(|| match (&self.end_row, &other.end_row) {
                (None, None) => Ordering::Equal,
                (None, Some(_)) => Ordering::Greater,
                (Some(_), None) => Ordering::Less,
                (Some(a), Some(b)) => a.cmp(b),
            })
            .then_with(|| match (&self.prev_end_row, &other.prev_end_row) {
                (None, None) => Ordering::Equal,
                (None, Some(_)) => Ordering::Less,
                (Some(_), None) => Ordering::Greater,
                (Some(a), Some(b)) => a.cmp(b),
            })
    }
}

impl PartialOrd for KeyExtent {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// The tier a table's metadata lives in. Each level's tablet metadata is
/// stored one level up; the root level lives in the coordination service.
/// A level is only serviced once the level above it is stable.
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
    strum::EnumIter,
)]
pub enum DataLevel {
    Root,
    Metadata,
    User,
}

impl DataLevel {
    pub fn of(table: &TableId) -> DataLevel {
        if *table == TableId::root() {
            DataLevel::Root
        } else if *table == TableId::metadata() {
            DataLevel::Metadata
        } else {
            DataLevel::User
        }
    }

    /// The table holding this level's tablet metadata, or `None` for the root
    /// level whose single tablet is tracked in the coordination service.
    pub fn meta_table(&self) -> Option<TableId> {
        match self {
            DataLevel::Root => None,
            DataLevel::Metadata => Some(TableId::root()),
            DataLevel::User => Some(TableId::metadata()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn extent(end: Option<&str>, prev: Option<&str>) -> KeyExtent {
        KeyExtent::new(
            TableId::new("1"),
            end.map(|r| r.as_bytes().to_vec()),
            prev.map(|r| r.as_bytes().to_vec()),
        )
    }

    #[test]
    fn row_membership() {
        let e = extent(Some("m"), Some("c"));
        assert!(!e.contains_row(b"c"));
        assert!(e.contains_row(b"d"));
        assert!(e.contains_row(b"m"));
        assert!(!e.contains_row(b"n"));

        let first = extent(Some("c"), None);
        assert!(first.contains_row(b""));
        assert!(first.contains_row(b"c"));
        assert!(!first.contains_row(b"d"));

        let last = extent(None, Some("m"));
        assert!(!last.contains_row(b"m"));
        assert!(last.contains_row(b"zzzz"));
    }

    #[test]
    fn overlap() {
        let e = extent(Some("m"), Some("c"));
        assert!(e.overlaps(None, None));
        assert!(e.overlaps(Some(b"a"), Some(b"d")));
        assert!(e.overlaps(Some(b"l"), None));
        assert!(!e.overlaps(Some(b"m"), None));
        assert!(!e.overlaps(None, Some(b"c")));
        assert!(e.overlaps(None, Some(b"d")));
    }

    #[test]
    fn meta_row_ordering() {
        let bounded = extent(Some("m"), None).meta_row();
        let unbounded = extent(None, Some("m")).meta_row();
        assert!(bounded < unbounded);
    }

    #[test]
    fn extent_ordering_matches_split_order() {
        let a = extent(Some("c"), None);
        let b = extent(Some("m"), Some("c"));
        let c = extent(None, Some("m"));
        assert!(a < b && b < c);
    }
}
