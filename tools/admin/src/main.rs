// Copyright (c) 2023 - 2025 Tessera Contributors.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

mod app;

use std::sync::Arc;

use clap::Parser;

use tessera_coordination::lock::ServiceLock;
use tessera_coordination::memory::ensure_persistent_path;
use tessera_coordination::paths;
use tessera_coordination::MemoryCoordination;
use tessera_fate::{FateStore, MetaFateStore, UserFateStore};
use tessera_manager::ManagerRepo;
use tessera_metadata::MetadataStore;

use app::{run, AdminEnv, Cli};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .init();

    let cli = Cli::parse();

    // Connects to the instance's coordination service and metadata table.
    // The in-memory backends stand in until a networked coordination client
    // is wired up here; the command logic above them is identical.
    let coordination = MemoryCoordination::new();
    let client = coordination.client();
    ensure_persistent_path(client.as_ref(), paths::MANAGER_LOCK).await?;
    let admin_lock = ServiceLock::new(client.clone())
        .acquire(paths::MANAGER_LOCK, bytes::Bytes::from_static(b"admin"))
        .await?;
    let metadata = MetadataStore::new();

    let meta_store: Arc<dyn FateStore<ManagerRepo>> =
        Arc::new(MetaFateStore::new(client.clone()).await?);
    let user_store: Arc<dyn FateStore<ManagerRepo>> =
        Arc::new(UserFateStore::new(metadata.clone()));
    let env = AdminEnv::new(
        client,
        metadata,
        vec![meta_store, user_store],
        admin_lock.lock_id().clone(),
    );

    let mut out = std::io::stdout();
    let code = run(&cli, &env, &mut out).await?;
    let _ = admin_lock.release().await;
    std::process::exit(code);
}
