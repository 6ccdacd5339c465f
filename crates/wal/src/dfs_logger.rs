// Copyright (c) 2023 - 2025 Tessera Contributors.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! One open write-ahead log. Appends from many writer tasks funnel into a
//! single owner task that batches frames, applies the strongest durability
//! in the batch once, and acknowledges every participant (group commit).

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use bytes::BytesMut;
use metrics::histogram;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, trace};
use uuid::Uuid;

use tessera_types::{Durability, TServerInstance, WalRef};

use crate::dfs::{Dfs, LogWriter};
use crate::format::{frame_len, write_frame, LogEvent};
use crate::{Result, WalError};

const WAL_WRITE_BATCH_LEN: &str = "tessera.wal.write.batch.length";

type Ack = oneshot::Sender<Result<(), WalError>>;

struct WriteCommand {
    frames: Vec<LogEvent>,
    durability: Durability,
    ack: Ack,
}

/// A single open log file on the distributed filesystem.
pub struct DfsLogger {
    wal: WalRef,
    sender: mpsc::Sender<WriteCommand>,
    size_estimate: AtomicU64,
    closed: AtomicBool,
    writer_task: parking_lot::Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl DfsLogger {
    /// Creates the log file and starts its owner task. The log is not
    /// advertised anywhere; the caller publishes the marker.
    pub async fn create(dfs: Arc<dyn Dfs>, server: &TServerInstance) -> Result<Arc<DfsLogger>> {
        let uuid = Uuid::new_v4();
        let path = format!("/wal/{}/{uuid}", server.host_port());
        let file = dfs.create(&path).await?;
        debug!(%path, "created write-ahead log");

        let (sender, receiver) = mpsc::channel(128);
        let writer_task = tokio::spawn(Self::run_writer(file, receiver, path.clone()));

        Ok(Arc::new(DfsLogger {
            wal: WalRef {
                server_host_port: server.host_port().to_string(),
                uuid,
                path: path.into(),
            },
            sender,
            size_estimate: AtomicU64::new(0),
            closed: AtomicBool::new(false),
            writer_task: parking_lot::Mutex::new(Some(writer_task)),
        }))
    }

    async fn run_writer(
        mut file: Box<dyn LogWriter>,
        mut receiver: mpsc::Receiver<WriteCommand>,
        path: String,
    ) {
        let mut buffer = BytesMut::new();
        let mut acks: Vec<Ack> = Vec::new();

        while let Some(first) = receiver.recv().await {
            buffer.clear();
            acks.clear();
            let mut strongest = Durability::Log;

            let mut batch = vec![first];
            // opportunistically drain whatever queued while we were busy
            while let Ok(next) = receiver.try_recv() {
                batch.push(next);
            }
            histogram!(WAL_WRITE_BATCH_LEN).record(batch.len() as f64);

            for command in &batch {
                for event in &command.frames {
                    write_frame(&mut buffer, event);
                }
                strongest = strongest.max(command.durability);
            }
            acks.extend(batch.into_iter().map(|c| c.ack));

            let result = Self::write_batch(&mut file, &buffer, strongest).await;
            if let Err(err) = &result {
                error!(%path, "wal write failed: {err}");
            }
            for ack in acks.drain(..) {
                let _ = ack.send(result.as_ref().map(|_| ()).map_err(clone_io_error));
            }
        }
        trace!(%path, "wal writer task finished");
    }

    async fn write_batch(
        file: &mut Box<dyn LogWriter>,
        buffer: &[u8],
        durability: Durability,
    ) -> Result<(), WalError> {
        file.append(buffer).await?;
        match durability {
            Durability::None | Durability::Log => {}
            Durability::Flush => file.flush().await?,
            Durability::Sync => file.sync().await?,
        }
        Ok(())
    }

    pub fn wal_ref(&self) -> &WalRef {
        &self.wal
    }

    pub fn size_estimate(&self) -> u64 {
        self.size_estimate.load(Ordering::Relaxed)
    }

    /// Appends events and waits for the requested durability. Fails with
    /// [`WalError::LogClosed`] once the log has been closed.
    pub async fn append(
        &self,
        frames: Vec<LogEvent>,
        durability: Durability,
    ) -> Result<(), WalError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(WalError::LogClosed);
        }
        let frame_bytes: u64 = frames.iter().map(|e| frame_len(e) as u64).sum();
        let (ack, ack_rx) = oneshot::channel();
        self.sender
            .send(WriteCommand {
                frames,
                durability,
                ack,
            })
            .await
            .map_err(|_| WalError::WriterGone)?;
        ack_rx.await.map_err(|_| WalError::WriterGone)??;
        self.size_estimate.fetch_add(frame_bytes, Ordering::Relaxed);
        Ok(())
    }

    /// Closes the log: no further appends are accepted. Idempotent.
    pub async fn close(&self) {
        self.closed.store(true, Ordering::Release);
        let task = self.writer_task.lock().take();
        if let Some(task) = task {
            // dropping the sender side is not possible from &self; instead
            // wait for queued work by sending a final sync barrier
            let (ack, ack_rx) = oneshot::channel();
            let _ = self
                .sender
                .send(WriteCommand {
                    frames: Vec::new(),
                    durability: Durability::Sync,
                    ack,
                })
                .await;
            let _ = ack_rx.await;
            task.abort();
        }
    }
}

// the writer task only produces i/o errors; this fans one result out to
// every ack in a batch
fn clone_io_error(err: &WalError) -> WalError {
    match err {
        WalError::LogClosed => WalError::LogClosed,
        WalError::Io(io) => WalError::Io(std::io::Error::new(io.kind(), io.to_string())),
        WalError::CorruptFrame { path, offset } => WalError::CorruptFrame {
            path: path.clone(),
            offset: *offset,
        },
        WalError::WriterGone | WalError::Marker(_) => WalError::WriterGone,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dfs::LocalDfs;
    use crate::format::read_frames;
    use tessera_types::{KeyExtent, Mutation, TableId};

    fn event(seq: u64) -> LogEvent {
        LogEvent::Mutations {
            tablet_log_id: 1,
            seq,
            mutations: vec![Mutation::new(&b"r"[..]).put(&b"f"[..], &b"q"[..], &b"v"[..])],
            durability: Durability::Sync,
        }
    }

    #[tokio::test]
    async fn appended_events_are_durable_and_readable() {
        let dir = tempfile::tempdir().unwrap();
        let dfs: Arc<dyn Dfs> = Arc::new(LocalDfs::new(dir.path()));
        let server = TServerInstance::new("host1:9997", 5);

        let log = DfsLogger::create(Arc::clone(&dfs), &server).await.unwrap();
        log.append(
            vec![LogEvent::DefineTablet {
                tablet_log_id: 1,
                extent: KeyExtent::whole_table(TableId::new("1")),
            }],
            Durability::Sync,
        )
        .await
        .unwrap();
        log.append(vec![event(1), event(2)], Durability::Flush)
            .await
            .unwrap();
        assert!(log.size_estimate() > 0);
        log.close().await;

        let raw = dfs.read_all(&log.wal_ref().path).await.unwrap();
        let events = read_frames(&log.wal_ref().path, &raw).unwrap();
        assert_eq!(events.len(), 3);
    }

    #[tokio::test]
    async fn closed_log_rejects_appends() {
        let dir = tempfile::tempdir().unwrap();
        let dfs: Arc<dyn Dfs> = Arc::new(LocalDfs::new(dir.path()));
        let server = TServerInstance::new("host1:9997", 5);

        let log = DfsLogger::create(dfs, &server).await.unwrap();
        log.close().await;
        assert!(matches!(
            log.append(vec![event(1)], Durability::Sync).await,
            Err(WalError::LogClosed)
        ));
    }
}
