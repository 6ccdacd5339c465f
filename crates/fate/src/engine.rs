// Copyright (c) 2023 - 2025 Tessera Contributors.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use tessera_coordination::client::SharedClient;
use tessera_coordination::lock::is_lock_held;
use tessera_types::retries::with_jitter;
use tessera_types::{FateId, FateReservation, LockId};

use crate::repo::{Ready, Repo};
use crate::store::{FateStore, ReservationStatus, StoreError, TxStatus};

#[derive(Debug, Clone)]
pub struct FateOptions {
    pub workers: NonZeroUsize,
    /// How often the work finder rescans the store for runnable
    /// transactions.
    pub poll_interval: Duration,
    /// How often reservations of dead lock holders are reclaimed.
    pub dead_reservation_interval: Duration,
}

impl Default for FateOptions {
    fn default() -> Self {
        FateOptions {
            workers: NonZeroUsize::new(4).expect("non-zero"),
            poll_interval: Duration::from_millis(100),
            dead_reservation_interval: Duration::from_secs(30),
        }
    }
}

struct Inner<R: Repo> {
    store: Arc<dyn FateStore<R>>,
    env: Arc<R::Env>,
    /// The service lock this process holds; reservations carry it so other
    /// processes can tell whether a claim is still backed by a live holder.
    lock_id: LockId,
    coordination: SharedClient,
    /// Transactions a step asked to requeue later, with their wake time.
    deferred: Mutex<HashMap<FateId, Instant>>,
}

impl<R: Repo> Inner<R> {
    fn is_deferred(&self, fate_id: FateId) -> bool {
        let mut deferred = self.deferred.lock();
        match deferred.get(&fate_id) {
            None => false,
            Some(wake) if *wake <= Instant::now() => {
                deferred.remove(&fate_id);
                false
            }
            Some(_) => true,
        }
    }

    fn defer(&self, fate_id: FateId, delay: Duration) {
        self.deferred.lock().insert(fate_id, Instant::now() + delay);
    }

    async fn run_transaction(&self, fate_id: FateId, cancel: &CancellationToken) {
        let reservation = FateReservation::new(self.lock_id.clone());
        match self.store.try_reserve(fate_id, &reservation).await {
            Ok(ReservationStatus::Accepted) => {}
            Ok(ReservationStatus::Rejected) => return,
            Err(err) => {
                warn!(%fate_id, "failed to reserve: {err}");
                return;
            }
        }

        if let Err(err) = self.execute_reserved(fate_id, cancel).await {
            warn!(%fate_id, "transaction execution error: {err}");
        }

        if let Err(err) = self.store.unreserve(fate_id, &reservation).await {
            warn!(%fate_id, "failed to unreserve: {err}");
        }
    }

    async fn execute_reserved(
        &self,
        fate_id: FateId,
        cancel: &CancellationToken,
    ) -> Result<(), StoreError> {
        while !cancel.is_cancelled() {
            match self.store.status(fate_id).await? {
                TxStatus::Submitted => {
                    self.store
                        .set_status(fate_id, &[TxStatus::Submitted], TxStatus::InProgress)
                        .await?;
                }
                TxStatus::InProgress => {
                    let Some(repo) = self.store.top(fate_id).await? else {
                        // empty step stack: nothing left to run
                        self.store
                            .set_status(fate_id, &[TxStatus::InProgress], TxStatus::Successful)
                            .await?;
                        self.clean_up_if_requested(fate_id).await?;
                        return Ok(());
                    };

                    match repo.is_ready(fate_id, &self.env).await {
                        Ok(Ready::Now) => {}
                        Ok(Ready::After(delay)) => {
                            trace!(%fate_id, step = repo.name(), ?delay, "step deferred");
                            self.defer(fate_id, delay);
                            return Ok(());
                        }
                        Err(err) => {
                            warn!(%fate_id, step = repo.name(), "is_ready failed: {err:#}");
                            self.store
                                .set_status(
                                    fate_id,
                                    &[TxStatus::InProgress],
                                    TxStatus::FailedInProgress,
                                )
                                .await?;
                            continue;
                        }
                    }

                    debug!(%fate_id, step = repo.name(), "executing step");
                    match repo.call(fate_id, &self.env).await {
                        Ok(Some(next)) => {
                            self.store.push(fate_id, next).await?;
                        }
                        Ok(None) => {
                            self.store
                                .set_status(fate_id, &[TxStatus::InProgress], TxStatus::Successful)
                                .await?;
                            info!(%fate_id, "transaction successful");
                            self.clean_up_if_requested(fate_id).await?;
                            return Ok(());
                        }
                        Err(err) => {
                            warn!(%fate_id, step = repo.name(), "step failed: {err:#}");
                            self.store
                                .set_status(
                                    fate_id,
                                    &[TxStatus::InProgress],
                                    TxStatus::FailedInProgress,
                                )
                                .await?;
                        }
                    }
                }
                TxStatus::FailedInProgress => {
                    // unwind: undo every step from the top down
                    while let Some(repo) = self.store.top(fate_id).await? {
                        if let Err(err) = repo.undo(fate_id, &self.env).await {
                            // keep unwinding; undo must tolerate partial state
                            error!(%fate_id, step = repo.name(), "undo failed: {err:#}");
                        }
                        self.store.pop(fate_id).await?;
                    }
                    self.store
                        .set_status(fate_id, &[TxStatus::FailedInProgress], TxStatus::Failed)
                        .await?;
                    info!(%fate_id, "transaction failed and unwound");
                    self.clean_up_if_requested(fate_id).await?;
                    return Ok(());
                }
                TxStatus::New
                | TxStatus::Failed
                | TxStatus::Successful
                | TxStatus::Unknown => return Ok(()),
            }
        }
        Ok(())
    }

    async fn clean_up_if_requested(&self, fate_id: FateId) -> Result<(), StoreError> {
        if self.store.auto_clean_up(fate_id).await? {
            debug!(%fate_id, "auto cleanup");
            self.store.delete(fate_id).await?;
        }
        Ok(())
    }

    async fn reclaim_dead_reservations(&self) {
        let reservations = match self.store.reservations().await {
            Ok(reservations) => reservations,
            Err(err) => {
                warn!("could not list reservations: {err}");
                return;
            }
        };
        for (fate_id, reservation) in reservations {
            if reservation.lock_id == self.lock_id {
                continue;
            }
            match is_lock_held(self.coordination.as_ref(), &reservation.lock_id).await {
                Ok(true) => {}
                Ok(false) => {
                    // conditional on the exact dead reservation, so a racing
                    // new claim is never clobbered
                    match self.store.reclaim_reservation(fate_id, &reservation).await {
                        Ok(ReservationStatus::Accepted) => {
                            info!(%fate_id, %reservation, "reclaimed dead reservation");
                        }
                        Ok(ReservationStatus::Rejected) => {}
                        Err(err) => warn!(%fate_id, "reclaim failed: {err}"),
                    }
                }
                Err(err) => warn!(%fate_id, "could not verify lock: {err}"),
            }
        }
    }
}

/// The fate engine: a worker pool executing transactions from one store.
pub struct Fate<R: Repo> {
    inner: Arc<Inner<R>>,
    tasks: Vec<JoinHandle<()>>,
    cancel: CancellationToken,
}

impl<R: Repo> Fate<R> {
    /// Starts workers, the work finder and the dead-reservation reclaimer.
    /// `lock_id` must refer to a service lock this process holds.
    pub fn start(
        store: Arc<dyn FateStore<R>>,
        env: Arc<R::Env>,
        lock_id: LockId,
        coordination: SharedClient,
        options: FateOptions,
    ) -> Self {
        let inner = Arc::new(Inner {
            store,
            env,
            lock_id,
            coordination,
            deferred: Mutex::new(HashMap::new()),
        });
        let cancel = CancellationToken::new();
        let mut tasks = Vec::new();

        let (work_tx, work_rx) = mpsc::channel::<FateId>(options.workers.get() * 2);
        let work_rx = Arc::new(tokio::sync::Mutex::new(work_rx));

        for worker in 0..options.workers.get() {
            let inner = Arc::clone(&inner);
            let cancel = cancel.clone();
            let work_rx = Arc::clone(&work_rx);
            tasks.push(tokio::spawn(async move {
                trace!(worker, "fate worker started");
                loop {
                    let fate_id = {
                        let mut rx = work_rx.lock().await;
                        tokio::select! {
                            _ = cancel.cancelled() => break,
                            fate_id = rx.recv() => fate_id,
                        }
                    };
                    let Some(fate_id) = fate_id else { break };
                    inner.run_transaction(fate_id, &cancel).await;
                }
                trace!(worker, "fate worker finished");
            }));
        }

        {
            let inner = Arc::clone(&inner);
            let cancel = cancel.clone();
            let poll_interval = options.poll_interval;
            tasks.push(tokio::spawn(async move {
                loop {
                    match inner.store.list().await {
                        Ok(txns) => {
                            for txn in txns {
                                if !txn.status.is_runnable()
                                    || txn.reservation.is_some()
                                    || inner.is_deferred(txn.fate_id)
                                {
                                    continue;
                                }
                                // a full queue just means workers are busy;
                                // the next scan will offer the id again
                                let _ = work_tx.try_send(txn.fate_id);
                            }
                        }
                        Err(err) => warn!("work finder could not list store: {err}"),
                    }
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(with_jitter(poll_interval, 0.3)) => {}
                    }
                }
            }));
        }

        {
            let inner = Arc::clone(&inner);
            let cancel = cancel.clone();
            let interval = options.dead_reservation_interval;
            tasks.push(tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(with_jitter(interval, 0.3)) => {}
                    }
                    inner.reclaim_dead_reservations().await;
                }
            }));
        }

        Fate {
            inner,
            tasks,
            cancel,
        }
    }

    pub fn store(&self) -> &Arc<dyn FateStore<R>> {
        &self.inner.store
    }

    /// Allocates a transaction id without seeding it. The caller can hand
    /// the id out (for progress tracking) before committing to run it.
    pub async fn create(&self) -> Result<FateId, StoreError> {
        self.inner.store.create().await
    }

    /// Seeds a created transaction with its first step. Returns false when
    /// the transaction was already seeded or cancelled.
    pub async fn seed_transaction(
        &self,
        op_name: &str,
        fate_id: FateId,
        repo: R,
        auto_clean_up: bool,
    ) -> Result<bool, StoreError> {
        let seeded = self
            .inner
            .store
            .seed(fate_id, op_name, repo, auto_clean_up)
            .await?;
        if seeded {
            debug!(%fate_id, op_name, "seeded transaction");
        }
        Ok(seeded)
    }

    /// Runs one reclaim pass immediately, for callers that do not want to
    /// wait out the timer.
    pub async fn reclaim_dead_reservations_now(&self) {
        self.inner.reclaim_dead_reservations().await;
    }

    pub async fn shutdown(self) {
        self.cancel.cancel();
        for task in self.tasks {
            let _ = task.await;
        }
    }
}
