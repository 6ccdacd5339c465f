// Copyright (c) 2023 - 2025 Tessera Contributors.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

use std::time::Duration;

use serde::Serialize;
use serde::de::DeserializeOwned;

use tessera_types::FateId;

/// Whether a step can run now or wants to be retried later.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ready {
    Now,
    /// Requeue the transaction after at least this long.
    After(Duration),
}

impl Ready {
    pub fn delay(&self) -> Duration {
        match self {
            Ready::Now => Duration::ZERO,
            Ready::After(delay) => *delay,
        }
    }
}

/// One step of a fault-tolerant transaction.
///
/// Implementations are tagged sums: one enum per subsystem, each variant one
/// step kind with its typed payload, serialized by tag. The engine invokes
/// `call` at-least-once, so every side effect in it must be idempotent:
/// replaying a step against state it already produced has to no-op.
#[async_trait::async_trait]
pub trait Repo:
    Clone + std::fmt::Debug + Serialize + DeserializeOwned + Send + Sync + 'static
{
    /// The environment steps execute against (metadata access, RPC
    /// connections, configuration).
    type Env: Send + Sync + 'static;

    /// Short name of this step for operator output.
    fn name(&self) -> &'static str;

    /// Can the step run right now? Returning a delay requeues the
    /// transaction without consuming the step.
    async fn is_ready(&self, fate_id: FateId, env: &Self::Env) -> anyhow::Result<Ready> {
        let _ = (fate_id, env);
        Ok(Ready::Now)
    }

    /// Performs the step and returns the next one, or `None` when the
    /// transaction is complete.
    async fn call(&self, fate_id: FateId, env: &Self::Env) -> anyhow::Result<Option<Self>>;

    /// Compensates for this step while a failed transaction unwinds.
    async fn undo(&self, fate_id: FateId, env: &Self::Env) -> anyhow::Result<()> {
        let _ = (fate_id, env);
        Ok(())
    }
}
