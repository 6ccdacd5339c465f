// Copyright (c) 2023 - 2025 Tessera Contributors.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! The USER fate store: transactions kept as rows of the metadata table,
//! mutated through the same conditional machinery as everything else in
//! that table.

use std::marker::PhantomData;

use bytes::Bytes;

use tessera_metadata::store::{FateOp, FateRequire, FateRow, RowStatus};
use tessera_metadata::MetadataStore;
use tessera_types::{FateId, FateInstanceType, FateReservation};

use crate::repo::Repo;
use crate::store::{
    now_millis, FateStore, ReservationStatus, SeenTxn, StoreError, StoreResult, TxStatus,
};

pub struct UserFateStore<R> {
    store: MetadataStore,
    _repo: PhantomData<fn() -> R>,
}

impl<R: Repo> UserFateStore<R> {
    pub fn new(store: MetadataStore) -> Self {
        UserFateStore {
            store,
            _repo: PhantomData,
        }
    }

    fn parse_status(fate_id: FateId, raw: &str) -> StoreResult<TxStatus> {
        raw.parse().map_err(|_| StoreError::Corrupt {
            fate_id,
            reason: format!("bad status '{raw}'"),
        })
    }

    fn encode_reservation(reservation: &FateReservation) -> String {
        serde_json::to_string(reservation).expect("reservation serializes")
    }

    fn decode_repo(fate_id: FateId, raw: &[u8]) -> StoreResult<R> {
        serde_json::from_slice(raw).map_err(|err| StoreError::Corrupt {
            fate_id,
            reason: err.to_string(),
        })
    }

    fn top_position(row: &FateRow) -> Option<u32> {
        row.repos.keys().next_back().copied()
    }

    fn to_seen(fate_id: FateId, row: &FateRow) -> StoreResult<SeenTxn> {
        let status = match &row.status {
            None => TxStatus::Unknown,
            Some(raw) => Self::parse_status(fate_id, raw)?,
        };
        let top_step = match Self::top_position(row) {
            None => None,
            Some(position) => Some(
                Self::decode_repo(fate_id, &row.repos[&position])?
                    .name()
                    .to_string(),
            ),
        };
        let reservation = match &row.reservation {
            None => None,
            Some(raw) => Some(serde_json::from_str(raw).map_err(|err| StoreError::Corrupt {
                fate_id,
                reason: err.to_string(),
            })?),
        };
        Ok(SeenTxn {
            fate_id,
            status,
            created_millis: row.created.unwrap_or(0),
            name: row.name.clone(),
            top_step,
            reservation,
        })
    }
}

#[async_trait::async_trait]
impl<R: Repo> FateStore<R> for UserFateStore<R> {
    fn instance_type(&self) -> FateInstanceType {
        FateInstanceType::User
    }

    async fn create(&self) -> StoreResult<FateId> {
        let fate_id = FateId::random(FateInstanceType::User);
        let status = self.store.fate_mutate(
            fate_id.uuid,
            &[FateRequire::RowAbsent],
            &[
                FateOp::PutStatus(TxStatus::New.to_string()),
                FateOp::PutCreated(now_millis()),
            ],
        );
        match status {
            RowStatus::Accepted => Ok(fate_id),
            _ => Err(StoreError::Unavailable(format!(
                "could not create fate row for {fate_id}"
            ))),
        }
    }

    async fn seed(
        &self,
        fate_id: FateId,
        name: &str,
        repo: R,
        auto_clean_up: bool,
    ) -> StoreResult<bool> {
        let serialized = serde_json::to_vec(&repo).expect("repo serializes");
        let status = self.store.fate_mutate(
            fate_id.uuid,
            &[
                FateRequire::StatusIn(vec![TxStatus::New.to_string()]),
                FateRequire::RepoAbsent(1),
            ],
            &[
                FateOp::PutStatus(TxStatus::Submitted.to_string()),
                FateOp::PutName(name.to_string()),
                FateOp::PutAutoCleanUp(auto_clean_up),
                FateOp::PutRepo(1, Bytes::from(serialized)),
            ],
        );
        Ok(status == RowStatus::Accepted)
    }

    async fn try_reserve(
        &self,
        fate_id: FateId,
        reservation: &FateReservation,
    ) -> StoreResult<ReservationStatus> {
        let encoded = Self::encode_reservation(reservation);
        let status = self.store.fate_mutate(
            fate_id.uuid,
            &[
                FateRequire::RowPresent,
                FateRequire::ReservationIs(None),
            ],
            &[FateOp::PutReservation(encoded.clone())],
        );
        if status == RowStatus::Accepted {
            return Ok(ReservationStatus::Accepted);
        }
        // "no reservation or this exact reservation" accepts re-reservation
        let already_ours = self.store.fate_mutate(
            fate_id.uuid,
            &[FateRequire::ReservationIs(Some(encoded))],
            &[],
        );
        Ok(match already_ours {
            RowStatus::Accepted => ReservationStatus::Accepted,
            _ => ReservationStatus::Rejected,
        })
    }

    async fn unreserve(
        &self,
        fate_id: FateId,
        reservation: &FateReservation,
    ) -> StoreResult<()> {
        self.store.fate_mutate(
            fate_id.uuid,
            &[FateRequire::ReservationIs(Some(Self::encode_reservation(
                reservation,
            )))],
            &[FateOp::DeleteReservation],
        );
        Ok(())
    }

    async fn reclaim_reservation(
        &self,
        fate_id: FateId,
        reservation: &FateReservation,
    ) -> StoreResult<ReservationStatus> {
        let status = self.store.fate_mutate(
            fate_id.uuid,
            &[FateRequire::ReservationIs(Some(Self::encode_reservation(
                reservation,
            )))],
            &[FateOp::DeleteReservation],
        );
        Ok(match status {
            RowStatus::Accepted => ReservationStatus::Accepted,
            _ => ReservationStatus::Rejected,
        })
    }

    async fn status(&self, fate_id: FateId) -> StoreResult<TxStatus> {
        match self.store.fate_read(fate_id.uuid) {
            None => Ok(TxStatus::Unknown),
            Some(row) => match row.status {
                None => Ok(TxStatus::Unknown),
                Some(raw) => Self::parse_status(fate_id, &raw),
            },
        }
    }

    async fn set_status(
        &self,
        fate_id: FateId,
        from: &[TxStatus],
        to: TxStatus,
    ) -> StoreResult<bool> {
        let allowed: Vec<String> = from.iter().map(|s| s.to_string()).collect();
        let status = self.store.fate_mutate(
            fate_id.uuid,
            &[
                FateRequire::RowPresent,
                FateRequire::StatusIn(allowed),
            ],
            &[FateOp::PutStatus(to.to_string())],
        );
        Ok(status == RowStatus::Accepted)
    }

    async fn top(&self, fate_id: FateId) -> StoreResult<Option<R>> {
        match self.store.fate_read(fate_id.uuid) {
            None => Ok(None),
            Some(row) => match Self::top_position(&row) {
                None => Ok(None),
                Some(position) => Ok(Some(Self::decode_repo(fate_id, &row.repos[&position])?)),
            },
        }
    }

    async fn push(&self, fate_id: FateId, repo: R) -> StoreResult<()> {
        let row = self
            .store
            .fate_read(fate_id.uuid)
            .ok_or(StoreError::NoSuchTxn(fate_id))?;
        let position = Self::top_position(&row).map(|p| p + 1).unwrap_or(1);
        let serialized = serde_json::to_vec(&repo).expect("repo serializes");
        let status = self.store.fate_mutate(
            fate_id.uuid,
            &[FateRequire::RepoAbsent(position)],
            &[FateOp::PutRepo(position, Bytes::from(serialized))],
        );
        match status {
            RowStatus::Accepted => Ok(()),
            _ => Err(StoreError::Unavailable(format!(
                "repo position {position} for {fate_id} already occupied"
            ))),
        }
    }

    async fn pop(&self, fate_id: FateId) -> StoreResult<()> {
        let row = self
            .store
            .fate_read(fate_id.uuid)
            .ok_or(StoreError::NoSuchTxn(fate_id))?;
        if let Some(position) = Self::top_position(&row) {
            self.store.fate_mutate(
                fate_id.uuid,
                &[FateRequire::RowPresent],
                &[FateOp::DeleteRepo(position)],
            );
        }
        Ok(())
    }

    async fn auto_clean_up(&self, fate_id: FateId) -> StoreResult<bool> {
        Ok(self
            .store
            .fate_read(fate_id.uuid)
            .map(|row| row.auto_clean_up)
            .unwrap_or(false))
    }

    async fn list_ids(&self) -> StoreResult<Vec<FateId>> {
        Ok(self
            .store
            .fate_list()
            .into_iter()
            .map(|uuid| FateId::new(FateInstanceType::User, uuid))
            .collect())
    }

    async fn list(&self) -> StoreResult<Vec<SeenTxn>> {
        let mut seen = Vec::new();
        for uuid in self.store.fate_list() {
            let fate_id = FateId::new(FateInstanceType::User, uuid);
            // rows can vanish between the listing and this read
            if let Some(row) = self.store.fate_read(uuid) {
                seen.push(Self::to_seen(fate_id, &row)?);
            }
        }
        Ok(seen)
    }

    async fn read(&self, fate_id: FateId) -> StoreResult<Option<SeenTxn>> {
        match self.store.fate_read(fate_id.uuid) {
            None => Ok(None),
            Some(row) => Ok(Some(Self::to_seen(fate_id, &row)?)),
        }
    }

    async fn delete(&self, fate_id: FateId) -> StoreResult<()> {
        self.store.fate_mutate(
            fate_id.uuid,
            &[],
            &[FateOp::DeleteRow],
        );
        Ok(())
    }

    async fn reservations(&self) -> StoreResult<Vec<(FateId, FateReservation)>> {
        Ok(self
            .list()
            .await?
            .into_iter()
            .filter_map(|txn| txn.reservation.map(|r| (txn.fate_id, r)))
            .collect())
    }
}
