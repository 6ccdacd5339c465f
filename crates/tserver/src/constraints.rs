// Copyright (c) 2023 - 2025 Tessera Contributors.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Constraints run against every mutation before it enters a commit
//! session. A violated mutation is reported to the caller and never
//! retried.

use bytes::Bytes;

use tessera_types::visibility::VisibilityEvaluator;
use tessera_types::Mutation;

/// One constraint violation: a short code plus a human-readable reason.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Violation {
    pub code: u16,
    pub description: String,
}

/// What a constraint may look at while checking a mutation.
pub struct ConstraintEnv {
    /// Authorizations of the writing principal.
    pub auths: Vec<Bytes>,
}

impl ConstraintEnv {
    pub fn new(auths: Vec<Bytes>) -> Self {
        ConstraintEnv { auths }
    }
}

pub trait Constraint: Send + Sync {
    /// Violations this mutation would cause, empty when it is acceptable.
    fn check(&self, env: &ConstraintEnv, mutation: &Mutation) -> Vec<Violation>;
}

/// Rejects writes labeled with a visibility the writer cannot itself read,
/// and writes with malformed visibility expressions.
pub struct VisibilityConstraint;

impl Constraint for VisibilityConstraint {
    fn check(&self, env: &ConstraintEnv, mutation: &Mutation) -> Vec<Violation> {
        let evaluator =
            VisibilityEvaluator::new(env.auths.iter().map(|a| a.to_vec()));
        let mut violations = Vec::new();
        for update in mutation.updates() {
            if update.visibility.is_empty() {
                continue;
            }
            match evaluator.can_access(&update.visibility) {
                Ok(true) => {}
                Ok(false) => violations.push(Violation {
                    code: 2,
                    description: format!(
                        "user does not have authorization on column visibility {}",
                        String::from_utf8_lossy(&update.visibility)
                    ),
                }),
                Err(err) => violations.push(Violation {
                    code: 1,
                    description: format!("malformed column visibility: {err}"),
                }),
            }
        }
        violations
    }
}
