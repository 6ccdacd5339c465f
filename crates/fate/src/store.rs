// Copyright (c) 2023 - 2025 Tessera Contributors.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use tessera_types::{FateId, FateInstanceType, FateReservation};

use crate::repo::Repo;

/// Lifecycle of a fault-tolerant transaction. Transitions are monotone,
/// except that a `New` transaction can be cancelled straight to `Failed`.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
    strum::EnumIter,
)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum TxStatus {
    New,
    Submitted,
    InProgress,
    FailedInProgress,
    Failed,
    Successful,
    /// Reported for transactions that vanished between being listed and
    /// being probed. Never stored.
    Unknown,
}

impl TxStatus {
    /// Statuses from which a worker may pick the transaction up.
    pub fn is_runnable(&self) -> bool {
        matches!(
            self,
            TxStatus::Submitted | TxStatus::InProgress | TxStatus::FailedInProgress
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, TxStatus::Failed | TxStatus::Successful)
    }
}

/// Outcome of a reservation attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReservationStatus {
    Accepted,
    Rejected,
}

/// One transaction as seen by a listing scan.
#[derive(Debug, Clone)]
pub struct SeenTxn {
    pub fate_id: FateId,
    pub status: TxStatus,
    pub created_millis: u64,
    pub name: Option<String>,
    pub top_step: Option<String>,
    pub reservation: Option<FateReservation>,
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("fate transaction {0} does not exist")]
    NoSuchTxn(FateId),
    #[error("fate store unavailable: {0}")]
    Unavailable(String),
    #[error("fate store holds undecodable data for {fate_id}: {reason}")]
    Corrupt { fate_id: FateId, reason: String },
}

pub type StoreResult<T> = Result<T, StoreError>;

pub(crate) fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("clock after epoch")
        .as_millis() as u64
}

/// Durable storage for fault-tolerant transactions.
///
/// Two implementations share these semantics: the meta store keeps
/// transactions in the coordination service, the user store keeps them in
/// the metadata table. All conditional operations are atomic per
/// transaction.
#[async_trait::async_trait]
pub trait FateStore<R: Repo>: Send + Sync + 'static {
    fn instance_type(&self) -> FateInstanceType;

    /// Allocates a new transaction in status `New`.
    async fn create(&self) -> StoreResult<FateId>;

    /// Sets the first step and moves `New` to `Submitted`. Returns false if
    /// the transaction was not `New` (already seeded, cancelled, gone).
    async fn seed(
        &self,
        fate_id: FateId,
        name: &str,
        repo: R,
        auto_clean_up: bool,
    ) -> StoreResult<bool>;

    /// Claims the transaction under the predicate "no reservation, or this
    /// exact reservation".
    async fn try_reserve(
        &self,
        fate_id: FateId,
        reservation: &FateReservation,
    ) -> StoreResult<ReservationStatus>;

    /// Releases the claim, conditional on it being exactly `reservation`.
    async fn unreserve(
        &self,
        fate_id: FateId,
        reservation: &FateReservation,
    ) -> StoreResult<()>;

    /// Clears a claim that is known dead, conditional on it being exactly
    /// `reservation`.
    async fn reclaim_reservation(
        &self,
        fate_id: FateId,
        reservation: &FateReservation,
    ) -> StoreResult<ReservationStatus>;

    /// The status, `Unknown` if the transaction does not exist.
    async fn status(&self, fate_id: FateId) -> StoreResult<TxStatus>;

    /// Moves the status to `to` if it currently is one of `from`.
    async fn set_status(
        &self,
        fate_id: FateId,
        from: &[TxStatus],
        to: TxStatus,
    ) -> StoreResult<bool>;

    /// The top of the step stack.
    async fn top(&self, fate_id: FateId) -> StoreResult<Option<R>>;

    /// Pushes `repo` onto the step stack.
    async fn push(&self, fate_id: FateId, repo: R) -> StoreResult<()>;

    /// Pops the top of the step stack.
    async fn pop(&self, fate_id: FateId) -> StoreResult<()>;

    /// Whether the transaction asked to be deleted once terminal.
    async fn auto_clean_up(&self, fate_id: FateId) -> StoreResult<bool>;

    /// All transaction ids present at scan time. Any of them may be gone by
    /// the time it is probed; probing must tolerate that.
    async fn list_ids(&self) -> StoreResult<Vec<FateId>>;

    /// All transactions, without failing on concurrent deletions.
    async fn list(&self) -> StoreResult<Vec<SeenTxn>>;

    /// One transaction's listing view, `None` if it no longer exists.
    async fn read(&self, fate_id: FateId) -> StoreResult<Option<SeenTxn>>;

    /// Removes the transaction unconditionally. Admin-level guards (status
    /// terminal, unreserved) live above the store.
    async fn delete(&self, fate_id: FateId) -> StoreResult<()>;

    /// Every live reservation in the store.
    async fn reservations(&self) -> StoreResult<Vec<(FateId, FateReservation)>>;
}
