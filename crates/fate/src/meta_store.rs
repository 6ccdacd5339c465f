// Copyright (c) 2023 - 2025 Tessera Contributors.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! The META fate store: transactions kept in the coordination service at
//! `/fate/<uuid>`, one node per transaction, updated with version
//! preconditions.

use std::marker::PhantomData;

use bytes::Bytes;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use tessera_coordination::client::{CreateMode, CreatePolicy, SharedClient};
use tessera_coordination::memory::ensure_persistent_path;
use tessera_coordination::paths;
use tessera_coordination::Error as CoordError;
use tessera_types::{FateId, FateInstanceType, FateReservation};

use crate::repo::Repo;
use crate::store::{
    now_millis, FateStore, ReservationStatus, SeenTxn, StoreError, StoreResult, TxStatus,
};

#[derive(Debug, Clone, Serialize, Deserialize)]
struct FateData {
    status: TxStatus,
    created_millis: u64,
    name: Option<String>,
    auto_clean_up: bool,
    reservation: Option<FateReservation>,
    /// Step stack, bottom first; the last element is the top.
    repos: Vec<serde_json::Value>,
}

pub struct MetaFateStore<R> {
    client: SharedClient,
    _repo: PhantomData<fn() -> R>,
}

impl<R: Repo> MetaFateStore<R> {
    pub async fn new(client: SharedClient) -> StoreResult<Self> {
        ensure_persistent_path(client.as_ref(), paths::FATE)
            .await
            .map_err(|err| StoreError::Unavailable(err.to_string()))?;
        Ok(MetaFateStore {
            client,
            _repo: PhantomData,
        })
    }

    fn encode(data: &FateData) -> Bytes {
        Bytes::from(serde_json::to_vec(data).expect("fate data serializes"))
    }

    fn decode(fate_id: FateId, raw: &[u8]) -> StoreResult<FateData> {
        serde_json::from_slice(raw).map_err(|err| StoreError::Corrupt {
            fate_id,
            reason: err.to_string(),
        })
    }

    fn decode_repo(fate_id: FateId, value: &serde_json::Value) -> StoreResult<R> {
        serde_json::from_value(value.clone()).map_err(|err| StoreError::Corrupt {
            fate_id,
            reason: err.to_string(),
        })
    }

    fn map_err(fate_id: FateId, err: CoordError) -> StoreError {
        match err {
            CoordError::NotFound(_) => StoreError::NoSuchTxn(fate_id),
            other => StoreError::Unavailable(other.to_string()),
        }
    }

    /// Applies `f` to the transaction node under a version precondition.
    /// `f` returns whether to write and what to answer.
    async fn update<T: Clone + Send>(
        &self,
        fate_id: FateId,
        f: impl Fn(&mut FateData) -> (bool, T) + Sync,
    ) -> StoreResult<T> {
        let path = paths::fate_txn(&fate_id.uuid);
        let outcome: Mutex<Option<T>> = Mutex::new(None);
        let result = self
            .client
            .mutate_existing(&path, &|raw| {
                let mut data =
                    Self::decode(fate_id, raw).map_err(|err| CoordError::Corrupt {
                        path: path.clone(),
                        reason: err.to_string(),
                    })?;
                let (apply, answer) = f(&mut data);
                *outcome.lock() = Some(answer);
                if apply {
                    Ok(Self::encode(&data))
                } else {
                    Ok(Bytes::copy_from_slice(raw))
                }
            })
            .await;
        match result {
            Ok(_) => Ok(outcome.lock().clone().expect("closure ran")),
            Err(err) => Err(Self::map_err(fate_id, err)),
        }
    }

    async fn read_data(&self, fate_id: FateId) -> StoreResult<Option<FateData>> {
        let path = paths::fate_txn(&fate_id.uuid);
        match self.client.try_get(&path).await {
            Ok(None) => Ok(None),
            Ok(Some(value)) => Ok(Some(Self::decode(fate_id, &value.data)?)),
            Err(err) => Err(Self::map_err(fate_id, err)),
        }
    }

    fn to_seen(fate_id: FateId, data: &FateData) -> StoreResult<SeenTxn> {
        let top_step = match data.repos.last() {
            None => None,
            Some(value) => Some(Self::decode_repo(fate_id, value)?.name().to_string()),
        };
        Ok(SeenTxn {
            fate_id,
            status: data.status,
            created_millis: data.created_millis,
            name: data.name.clone(),
            top_step,
            reservation: data.reservation.clone(),
        })
    }
}

#[async_trait::async_trait]
impl<R: Repo> FateStore<R> for MetaFateStore<R> {
    fn instance_type(&self) -> FateInstanceType {
        FateInstanceType::Meta
    }

    async fn create(&self) -> StoreResult<FateId> {
        let fate_id = FateId::random(FateInstanceType::Meta);
        let data = FateData {
            status: TxStatus::New,
            created_millis: now_millis(),
            name: None,
            auto_clean_up: false,
            reservation: None,
            repos: Vec::new(),
        };
        self.client
            .create(
                &paths::fate_txn(&fate_id.uuid),
                Self::encode(&data),
                CreateMode::Persistent,
                CreatePolicy::FailIfExists,
            )
            .await
            .map_err(|err| Self::map_err(fate_id, err))?;
        Ok(fate_id)
    }

    async fn seed(
        &self,
        fate_id: FateId,
        name: &str,
        repo: R,
        auto_clean_up: bool,
    ) -> StoreResult<bool> {
        let repo_value = serde_json::to_value(&repo).expect("repo serializes");
        let name = name.to_string();
        self.update(fate_id, move |data| {
            if data.status != TxStatus::New || !data.repos.is_empty() {
                return (false, false);
            }
            data.status = TxStatus::Submitted;
            data.name = Some(name.clone());
            data.auto_clean_up = auto_clean_up;
            data.repos.push(repo_value.clone());
            (true, true)
        })
        .await
    }

    async fn try_reserve(
        &self,
        fate_id: FateId,
        reservation: &FateReservation,
    ) -> StoreResult<ReservationStatus> {
        let reservation = reservation.clone();
        match self
            .update(fate_id, move |data| match &data.reservation {
                None => {
                    data.reservation = Some(reservation.clone());
                    (true, ReservationStatus::Accepted)
                }
                Some(existing) if *existing == reservation => {
                    (false, ReservationStatus::Accepted)
                }
                Some(_) => (false, ReservationStatus::Rejected),
            })
            .await
        {
            Ok(status) => Ok(status),
            // racing a deletion: nothing to reserve
            Err(StoreError::NoSuchTxn(_)) => Ok(ReservationStatus::Rejected),
            Err(err) => Err(err),
        }
    }

    async fn unreserve(
        &self,
        fate_id: FateId,
        reservation: &FateReservation,
    ) -> StoreResult<()> {
        let reservation = reservation.clone();
        match self
            .update(fate_id, move |data| {
                if data.reservation.as_ref() == Some(&reservation) {
                    data.reservation = None;
                    (true, ())
                } else {
                    (false, ())
                }
            })
            .await
        {
            Ok(()) => Ok(()),
            Err(StoreError::NoSuchTxn(_)) => Ok(()),
            Err(err) => Err(err),
        }
    }

    async fn reclaim_reservation(
        &self,
        fate_id: FateId,
        reservation: &FateReservation,
    ) -> StoreResult<ReservationStatus> {
        let reservation = reservation.clone();
        match self
            .update(fate_id, move |data| {
                if data.reservation.as_ref() == Some(&reservation) {
                    data.reservation = None;
                    (true, ReservationStatus::Accepted)
                } else {
                    (false, ReservationStatus::Rejected)
                }
            })
            .await
        {
            Ok(status) => Ok(status),
            Err(StoreError::NoSuchTxn(_)) => Ok(ReservationStatus::Rejected),
            Err(err) => Err(err),
        }
    }

    async fn status(&self, fate_id: FateId) -> StoreResult<TxStatus> {
        Ok(self
            .read_data(fate_id)
            .await?
            .map(|data| data.status)
            .unwrap_or(TxStatus::Unknown))
    }

    async fn set_status(
        &self,
        fate_id: FateId,
        from: &[TxStatus],
        to: TxStatus,
    ) -> StoreResult<bool> {
        let from = from.to_vec();
        self.update(fate_id, move |data| {
            if from.contains(&data.status) {
                data.status = to;
                (true, true)
            } else {
                (false, false)
            }
        })
        .await
    }

    async fn top(&self, fate_id: FateId) -> StoreResult<Option<R>> {
        match self.read_data(fate_id).await? {
            None => Ok(None),
            Some(data) => match data.repos.last() {
                None => Ok(None),
                Some(value) => Ok(Some(Self::decode_repo(fate_id, value)?)),
            },
        }
    }

    async fn push(&self, fate_id: FateId, repo: R) -> StoreResult<()> {
        let value = serde_json::to_value(&repo).expect("repo serializes");
        self.update(fate_id, move |data| {
            data.repos.push(value.clone());
            (true, ())
        })
        .await
    }

    async fn pop(&self, fate_id: FateId) -> StoreResult<()> {
        self.update(fate_id, |data| {
            data.repos.pop();
            (true, ())
        })
        .await
    }

    async fn auto_clean_up(&self, fate_id: FateId) -> StoreResult<bool> {
        Ok(self
            .read_data(fate_id)
            .await?
            .map(|data| data.auto_clean_up)
            .unwrap_or(false))
    }

    async fn list_ids(&self) -> StoreResult<Vec<FateId>> {
        let children = match self.client.get_children(paths::FATE).await {
            Ok(children) => children,
            Err(CoordError::NotFound(_)) => return Ok(Vec::new()),
            Err(err) => return Err(StoreError::Unavailable(err.to_string())),
        };
        Ok(children
            .into_iter()
            .filter_map(|child| child.parse::<Uuid>().ok())
            .map(|uuid| FateId::new(FateInstanceType::Meta, uuid))
            .collect())
    }

    async fn list(&self) -> StoreResult<Vec<SeenTxn>> {
        let mut seen = Vec::new();
        for fate_id in self.list_ids().await? {
            // a child may vanish between the listing and this read
            if let Some(data) = self.read_data(fate_id).await? {
                seen.push(Self::to_seen(fate_id, &data)?);
            }
        }
        Ok(seen)
    }

    async fn read(&self, fate_id: FateId) -> StoreResult<Option<SeenTxn>> {
        match self.read_data(fate_id).await? {
            None => Ok(None),
            Some(data) => Ok(Some(Self::to_seen(fate_id, &data)?)),
        }
    }

    async fn delete(&self, fate_id: FateId) -> StoreResult<()> {
        self.client
            .delete(&paths::fate_txn(&fate_id.uuid), None)
            .await
            .map_err(|err| Self::map_err(fate_id, err))
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
