// Copyright (c) 2023 - 2025 Tessera Contributors.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

use std::path::PathBuf;

use tokio::fs;
use tokio::io::AsyncWriteExt;

use crate::Result;

/// The slice of distributed-filesystem behavior the log subsystem needs:
/// append-only files that can be synced, listed and removed. The local
/// implementation backs tests and single-node deployments.
#[async_trait::async_trait]
pub trait Dfs: Send + Sync + 'static {
    async fn create(&self, path: &str) -> Result<Box<dyn LogWriter>>;

    async fn read_all(&self, path: &str) -> Result<Vec<u8>>;

    async fn exists(&self, path: &str) -> Result<bool>;

    async fn delete(&self, path: &str) -> Result<()>;

    async fn list(&self, dir: &str) -> Result<Vec<String>>;
}

/// An open, append-only log file.
#[async_trait::async_trait]
pub trait LogWriter: Send {
    async fn append(&mut self, data: &[u8]) -> Result<()>;

    /// Pushes buffered bytes to the stream.
    async fn flush(&mut self) -> Result<()>;

    /// Forces written bytes to the device.
    async fn sync(&mut self) -> Result<()>;
}

/// Local-filesystem implementation rooted at a directory.
pub struct LocalDfs {
    root: PathBuf,
}

impl LocalDfs {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        LocalDfs { root: root.into() }
    }

    fn resolve(&self, path: &str) -> PathBuf {
        self.root.join(path.trim_start_matches('/'))
    }
}

struct LocalLogWriter {
    file: fs::File,
}

#[async_trait::async_trait]
impl LogWriter for LocalLogWriter {
    async fn append(&mut self, data: &[u8]) -> Result<()> {
        self.file.write_all(data).await?;
        Ok(())
    }

    async fn flush(&mut self) -> Result<()> {
        self.file.flush().await?;
        Ok(())
    }

    async fn sync(&mut self) -> Result<()> {
        self.file.flush().await?;
        self.file.sync_data().await?;
        Ok(())
    }
}

#[async_trait::async_trait]
impl Dfs for LocalDfs {
    async fn create(&self, path: &str) -> Result<Box<dyn LogWriter>> {
        let resolved = self.resolve(path);
        if let Some(parent) = resolved.parent() {
            fs::create_dir_all(parent).await?;
        }
        let file = fs::OpenOptions::new()
            .create_new(true)
            .append(true)
            .open(&resolved)
            .await?;
        Ok(Box::new(LocalLogWriter { file }))
    }

    async fn read_all(&self, path: &str) -> Result<Vec<u8>> {
        Ok(fs::read(self.resolve(path)).await?)
    }

    async fn exists(&self, path: &str) -> Result<bool> {
        Ok(fs::try_exists(self.resolve(path)).await?)
    }

    async fn delete(&self, path: &str) -> Result<()> {
        match fs::remove_file(self.resolve(path)).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    async fn list(&self, dir: &str) -> Result<Vec<String>> {
        let resolved = self.resolve(dir);
        let mut entries = Vec::new();
        let mut reader = match fs::read_dir(&resolved).await {
            Ok(reader) => reader,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(entries),
            Err(err) => return Err(err.into()),
        };
        while let Some(entry) = reader.next_entry().await? {
            if let Some(name) = entry.file_name().to_str() {
                entries.push(name.to_string());
            }
        }
        entries.sort();
        Ok(entries)
    }
}
