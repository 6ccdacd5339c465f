// Copyright (c) 2023 - 2025 Tessera Contributors.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

use serde::{Deserialize, Serialize};

/// Identifies one incarnation of a tablet server process.
///
/// The `session` distinguishes restarts of a server on the same host and
/// port; equality therefore means "the exact same process", which is what
/// liveness and ownership checks need. Comparisons of only the host/port pair
/// go through [`TServerInstance::host_port`].
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
#[display("{host_port}[{session:x}]")]
pub struct TServerInstance {
    host_port: String,
    session: u64,
}

impl TServerInstance {
    pub fn new(host_port: impl Into<String>, session: u64) -> Self {
        TServerInstance {
            host_port: host_port.into(),
            session,
        }
    }

    pub fn host_port(&self) -> &str {
        &self.host_port
    }

    pub fn session(&self) -> u64 {
        self.session
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn restart_is_a_different_instance() {
        let a = TServerInstance::new("host1:9997", 1);
        let b = TServerInstance::new("host1:9997", 2);
        assert_ne!(a, b);
        assert_eq!(a.host_port(), b.host_port());
    }
}
