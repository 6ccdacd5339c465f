// Copyright (c) 2023 - 2025 Tessera Contributors.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! The tablet server: in-memory tablets, the per-tablet write path with
//! commit sessions and constraint checking, and the server side of the
//! conditional-write pipeline with row locks and sessions.

pub mod constraints;
pub mod row_locks;
pub mod server;
pub mod session;
pub mod tablet;

pub use constraints::{Constraint, ConstraintEnv, VisibilityConstraint, Violation};
pub use row_locks::RowLocks;
pub use server::TabletServer;
pub use session::{ConditionalSession, SessionManager};
pub use tablet::{CommitSession, PreparedMutations, Tablet};
