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
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// A tablet's time column: either a logical counter bumped per mutation
/// batch, or a wall-clock high-water mark in milliseconds. The serialized
/// forms are `L<n>` and `M<ms>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MetadataTime {
    Logical(u64),
    Millis(u64),
}

impl Default for MetadataTime {
    fn default() -> Self {
        MetadataTime::Millis(0)
    }
}

impl MetadataTime {
    pub fn value(&self) -> u64 {
        match self {
            MetadataTime::Logical(n) | MetadataTime::Millis(n) => *n,
        }
    }
}

impl fmt::Display for MetadataTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MetadataTime::Logical(n) => write!(f, "L{n}"),
            MetadataTime::Millis(ms) => write!(f, "M{ms}"),
        }
    }
}

#[derive(Debug, thiserror::Error)]
#[error("malformed metadata time '{0}'")]
pub struct MalformedTime(String);

impl FromStr for MetadataTime {
    type Err = MalformedTime;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let malformed = || MalformedTime(s.to_string());
        let (kind, value) = s.split_at(s.len().min(1));
        let value: u64 = value.parse().map_err(|_| malformed())?;
        match kind {
            "L" => Ok(MetadataTime::Logical(value)),
            "M" => Ok(MetadataTime::Millis(value)),
            _ => Err(malformed()),
        }
    }
}

/// A monotonic timestamp that survives comparisons across manager restarts
/// well enough for suspension bookkeeping. Unlike wall-clock time it never
/// moves backwards within a process.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct SteadyTime(u64);

impl SteadyTime {
    pub fn from_millis(millis: u64) -> Self {
        SteadyTime(millis)
    }

    pub fn as_millis(&self) -> u64 {
        self.0
    }

    pub fn saturating_elapsed_since(&self, earlier: SteadyTime) -> Duration {
        Duration::from_millis(self.0.saturating_sub(earlier.0))
    }

    pub fn plus(&self, d: Duration) -> SteadyTime {
        SteadyTime(self.0 + d.as_millis() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metadata_time_round_trip() {
        for s in ["L42", "M1700000000000", "L0"] {
            let t: MetadataTime = s.parse().unwrap();
            assert_eq!(t.to_string(), s);
        }
        assert!("X42".parse::<MetadataTime>().is_err());
        assert!("L".parse::<MetadataTime>().is_err());
        assert!("".parse::<MetadataTime>().is_err());
    }

    #[test]
    fn steady_time_elapsed() {
        let t0 = SteadyTime::from_millis(1_000);
        let t1 = SteadyTime::from_millis(4_500);
        assert_eq!(t1.saturating_elapsed_since(t0), Duration::from_millis(3_500));
        assert_eq!(t0.saturating_elapsed_since(t1), Duration::ZERO);
    }
}
