// Copyright (c) 2023 - 2025 Tessera Contributors.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Operator-facing fate operations: summary, print, cancel, fail, delete.
//! Everything here tolerates transactions vanishing mid-operation; operators
//! run these against live systems.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, info};

use tessera_types::{FateId, FateInstanceType, FateReservation, LockId};

use crate::repo::Repo;
use crate::store::{FateStore, ReservationStatus, StoreResult, TxStatus};

/// Filters shared by summary and print.
#[derive(Debug, Clone, Default)]
pub struct AdminFilters {
    /// Keep only these statuses; empty keeps all.
    pub statuses: Vec<TxStatus>,
    /// Keep only these store types; empty keeps all.
    pub instance_types: Vec<FateInstanceType>,
    /// Probe exactly these transactions; empty scans the stores.
    pub fate_ids: Vec<FateId>,
}

/// One transaction as reported to the operator.
#[derive(Debug, Clone, Serialize)]
pub struct TxnDetails {
    pub fate_id: String,
    pub instance_type: FateInstanceType,
    pub status: TxStatus,
    pub time_created: u64,
    pub name: Option<String>,
    pub top_step: Option<String>,
    pub reservation: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct FateSummaryReport {
    /// Counts of transactions per status, over transactions that were
    /// actually found; vanished transactions are not counted.
    pub status_counts: BTreeMap<String, usize>,
    pub txns: Vec<TxnDetails>,
}

/// Outcome of a fail/delete request against a possibly-busy transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdminOpOutcome {
    Done,
    /// The transaction stayed reserved for the whole wait.
    Busy,
    /// The transaction's status does not allow the operation.
    WrongStatus(TxStatus),
}

pub struct FateAdmin<R: Repo> {
    stores: Vec<Arc<dyn FateStore<R>>>,
    lock_id: LockId,
}

impl<R: Repo> FateAdmin<R> {
    /// `lock_id` backs the short-lived reservations admin operations take;
    /// it must refer to a lock this process holds.
    pub fn new(stores: Vec<Arc<dyn FateStore<R>>>, lock_id: LockId) -> Self {
        FateAdmin { stores, lock_id }
    }

    fn stores_for(&self, filters: &AdminFilters) -> Vec<&Arc<dyn FateStore<R>>> {
        self.stores
            .iter()
            .filter(|store| {
                filters.instance_types.is_empty()
                    || filters.instance_types.contains(&store.instance_type())
            })
            .collect()
    }

    fn store_of(&self, fate_id: FateId) -> Option<&Arc<dyn FateStore<R>>> {
        self.stores
            .iter()
            .find(|store| store.instance_type() == fate_id.instance_type)
    }

    /// Collects transaction details, probing ids one by one. A transaction
    /// that disappears between enumeration and its probe is reported with
    /// status `Unknown` and a zero creation time rather than failing the
    /// whole report.
    pub async fn collect(&self, filters: &AdminFilters) -> StoreResult<Vec<TxnDetails>> {
        let mut details = Vec::new();
        for store in self.stores_for(filters) {
            let ids = if filters.fate_ids.is_empty() {
                store.list_ids().await?
            } else {
                filters
                    .fate_ids
                    .iter()
                    .copied()
                    .filter(|id| id.instance_type == store.instance_type())
                    .collect()
            };

            for fate_id in ids {
                let detail = match store.read(fate_id).await? {
                    Some(txn) => TxnDetails {
                        fate_id: fate_id.canonical(),
                        instance_type: store.instance_type(),
                        status: txn.status,
                        time_created: txn.created_millis,
                        name: txn.name,
                        top_step: txn.top_step,
                        reservation: txn.reservation.map(|r| r.to_string()),
                    },
                    None => TxnDetails {
                        fate_id: fate_id.canonical(),
                        instance_type: store.instance_type(),
                        status: TxStatus::Unknown,
                        time_created: 0,
                        name: None,
                        top_step: None,
                        reservation: None,
                    },
                };
                details.push(detail);
            }
        }

        if !filters.statuses.is_empty() {
            details.retain(|d| filters.statuses.contains(&d.status));
        }
        Ok(details)
    }

    pub async fn summary(&self, filters: &AdminFilters) -> StoreResult<FateSummaryReport> {
        let txns = self.collect(filters).await?;
        let mut status_counts = BTreeMap::new();
        for txn in &txns {
            if txn.status != TxStatus::Unknown {
                *status_counts.entry(txn.status.to_string()).or_insert(0) += 1;
            }
        }
        Ok(FateSummaryReport {
            status_counts,
            txns,
        })
    }

    /// Cancels a transaction that has not started executing.
    pub async fn cancel(&self, fate_id: FateId) -> StoreResult<bool> {
        let Some(store) = self.store_of(fate_id) else {
            return Ok(false);
        };
        let cancelled = store
            .set_status(
                fate_id,
                &[TxStatus::New, TxStatus::Submitted],
                TxStatus::Failed,
            )
            .await?;
        if cancelled {
            info!(%fate_id, "cancelled transaction");
        }
        Ok(cancelled)
    }

    async fn reserve_within(
        &self,
        store: &Arc<dyn FateStore<R>>,
        fate_id: FateId,
        wait: Duration,
    ) -> StoreResult<Option<FateReservation>> {
        let deadline = tokio::time::Instant::now() + wait;
        let reservation = FateReservation::new(self.lock_id.clone());
        loop {
            match store.try_reserve(fate_id, &reservation).await? {
                ReservationStatus::Accepted => return Ok(Some(reservation)),
                ReservationStatus::Rejected => {
                    if tokio::time::Instant::now() >= deadline {
                        return Ok(None);
                    }
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
        }
    }

    /// Forces a transaction onto the failure path so workers unwind it.
    /// Waits up to `wait` for the transaction to become unreserved.
    pub async fn fail(&self, fate_id: FateId, wait: Duration) -> StoreResult<AdminOpOutcome> {
        let Some(store) = self.store_of(fate_id) else {
            return Ok(AdminOpOutcome::WrongStatus(TxStatus::Unknown));
        };
        if store.read(fate_id).await?.is_none() {
            return Ok(AdminOpOutcome::WrongStatus(TxStatus::Unknown));
        }
        let Some(reservation) = self.reserve_within(store, fate_id, wait).await? else {
            return Ok(AdminOpOutcome::Busy);
        };

        let failed = store
            .set_status(
                fate_id,
                &[TxStatus::New, TxStatus::Submitted, TxStatus::InProgress],
                TxStatus::FailedInProgress,
            )
            .await?;
        let outcome = if failed {
            info!(%fate_id, "marked transaction failed-in-progress");
            AdminOpOutcome::Done
        } else {
            AdminOpOutcome::WrongStatus(store.status(fate_id).await?)
        };
        store.unreserve(fate_id, &reservation).await?;
        Ok(outcome)
    }

    /// Deletes a transaction that is unreserved and in a deletable status.
    pub async fn delete(&self, fate_id: FateId, wait: Duration) -> StoreResult<AdminOpOutcome> {
        let Some(store) = self.store_of(fate_id) else {
            return Ok(AdminOpOutcome::WrongStatus(TxStatus::Unknown));
        };
        if store.read(fate_id).await?.is_none() {
            return Ok(AdminOpOutcome::WrongStatus(TxStatus::Unknown));
        }
        let Some(reservation) = self.reserve_within(store, fate_id, wait).await? else {
            return Ok(AdminOpOutcome::Busy);
        };

        let status = store.status(fate_id).await?;
        let outcome = match status {
            TxStatus::New | TxStatus::Failed | TxStatus::Successful => {
                store.delete(fate_id).await?;
                debug!(%fate_id, "deleted transaction");
                AdminOpOutcome::Done
            }
            other => {
                store.unreserve(fate_id, &reservation).await?;
                AdminOpOutcome::WrongStatus(other)
            }
        };
        Ok(outcome)
    }

    /// True when no store holds any transaction; the upgrade preparation
    /// check uses this.
    pub async fn is_empty(&self) -> StoreResult<bool> {
        for store in &self.stores {
            if !store.list_ids().await?.is_empty() {
                return Ok(false);
            }
        }
        Ok(true)
    }
}
