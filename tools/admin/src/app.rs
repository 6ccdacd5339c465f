// Copyright (c) 2023 - 2025 Tessera Contributors.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};

use tessera_coordination::client::SharedClient;
use tessera_fate::admin::{AdminFilters, AdminOpOutcome};
use tessera_fate::{FateAdmin, FateStore, TxStatus};
use tessera_manager::upgrade::prepare_upgrade;
use tessera_manager::ManagerRepo;
use tessera_metadata::MetadataStore;
use tessera_types::{FateId, FateInstanceType};


#[derive(Debug, Parser)]
#[command(name = "tessera-admin", about = "Tessera administrative operations")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Inspect or act on fault-tolerant transactions.
    Fate(FateArgs),
    /// Upgrade management.
    Upgrade(UpgradeArgs),
}

#[derive(Debug, Args)]
pub struct FateArgs {
    /// Specific transactions (canonical `FATE:<type>:<uuid>` form).
    pub fate_ids: Vec<String>,

    /// Print counts plus one line per transaction.
    #[arg(long)]
    pub summary: bool,

    /// Emit json instead of text (with --summary).
    #[arg(short = 'j', long)]
    pub json: bool,

    /// Print one detailed line per transaction.
    #[arg(long)]
    pub print: bool,

    /// Keep only transactions in these states.
    #[arg(short = 's', long = "state")]
    pub states: Vec<String>,

    /// Keep only transactions in this store (META or USER).
    #[arg(short = 't', long = "type")]
    pub instance_type: Option<String>,

    /// Cancel transactions that have not started running.
    #[arg(long)]
    pub cancel: bool,

    /// Force transactions onto the failure path.
    #[arg(long)]
    pub fail: bool,

    /// Delete finished transactions.
    #[arg(long)]
    pub delete: bool,

    /// How long --fail/--delete wait for a busy transaction before giving
    /// up with a notice.
    #[arg(long, default_value = "30")]
    pub wait_seconds: u64,
}

#[derive(Debug, Args)]
pub struct UpgradeArgs {
    /// Write the prepare-for-upgrade marker; refuses while a manager runs
    /// or fate transactions exist.
    #[arg(long)]
    pub prepare: bool,
}

/// Everything the commands need to talk to an instance.
pub struct AdminEnv {
    pub client: SharedClient,
    pub metadata: MetadataStore,
    pub fate_admin: FateAdmin<ManagerRepo>,
}

impl AdminEnv {
    pub fn new(
        client: SharedClient,
        metadata: MetadataStore,
        stores: Vec<Arc<dyn FateStore<ManagerRepo>>>,
        lock_id: tessera_types::LockId,
    ) -> Self {
        AdminEnv {
            client,
            metadata,
            fate_admin: FateAdmin::new(stores, lock_id),
        }
    }
}

fn parse_filters(args: &FateArgs, out: &mut impl std::io::Write) -> anyhow::Result<AdminFilters> {
    let mut filters = AdminFilters::default();
    for state in &args.states {
        match TxStatus::from_str(state) {
            Ok(status) => filters.statuses.push(status),
            Err(_) => {
                writeln!(out, "unknown state: {state}")?;
                anyhow::bail!("unknown state {state}");
            }
        }
    }
    if let Some(instance_type) = &args.instance_type {
        match FateInstanceType::from_str(instance_type) {
            Ok(instance_type) => filters.instance_types.push(instance_type),
            Err(_) => {
                writeln!(out, "unknown fate instance type: {instance_type}")?;
                anyhow::bail!("unknown instance type {instance_type}");
            }
        }
    }
    for raw in &args.fate_ids {
        filters.fate_ids.push(raw.parse::<FateId>()?);
    }
    Ok(filters)
}

async fn run_fate(
    args: &FateArgs,
    env: &AdminEnv,
    out: &mut impl std::io::Write,
) -> anyhow::Result<i32> {
    let filters = parse_filters(args, out)?;

    if args.cancel || args.fail || args.delete {
        let wait = Duration::from_secs(args.wait_seconds);
        for fate_id in &filters.fate_ids {
            if args.cancel {
                if env.fate_admin.cancel(*fate_id).await? {
                    writeln!(out, "cancelled {fate_id}")?;
                } else {
                    writeln!(out, "could not cancel {fate_id}; it may already be running")?;
                }
            }
            if args.fail {
                match env.fate_admin.fail(*fate_id, wait).await? {
                    AdminOpOutcome::Done => writeln!(out, "failed {fate_id}")?,
                    AdminOpOutcome::Busy => {
                        writeln!(out, "Could not fail {fate_id} in a reasonable time")?
                    }
                    AdminOpOutcome::WrongStatus(status) => {
                        writeln!(out, "could not fail {fate_id} in status {status}")?
                    }
                }
            }
            if args.delete {
                match env.fate_admin.delete(*fate_id, wait).await? {
                    AdminOpOutcome::Done => writeln!(out, "deleted {fate_id}")?,
                    AdminOpOutcome::Busy => {
                        writeln!(out, "Could not delete {fate_id} in a reasonable time")?
                    }
                    AdminOpOutcome::WrongStatus(status) => {
                        writeln!(out, "could not delete {fate_id} in status {status}")?
                    }
                }
            }
        }
        return Ok(0);
    }

    if args.summary {
        let report = env.fate_admin.summary(&filters).await?;
        if args.json {
            writeln!(out, "{}", serde_json::to_string_pretty(&report)?)?;
        } else {
            writeln!(out, "status counts:")?;
            for (status, count) in &report.status_counts {
                writeln!(out, "  {status}: {count}")?;
            }
            for txn in &report.txns {
                writeln!(
                    out,
                    "{} {} created {} step {}",
                    txn.fate_id,
                    txn.status,
                    txn.time_created,
                    txn.top_step.as_deref().unwrap_or("-"),
                )?;
            }
        }
        return Ok(0);
    }

    // --print (also the default when nothing else was asked)
    let txns = env.fate_admin.collect(&filters).await?;
    for txn in txns {
        writeln!(
            out,
            "txid: {} status: {} op: {} created: {} step: {} reservation: {}",
            txn.fate_id,
            txn.status,
            txn.name.as_deref().unwrap_or("?"),
            txn.time_created,
            txn.top_step.as_deref().unwrap_or("-"),
            txn.reservation.as_deref().unwrap_or("-"),
        )?;
    }
    Ok(0)
}

async fn run_upgrade(
    args: &UpgradeArgs,
    env: &AdminEnv,
    out: &mut impl std::io::Write,
) -> anyhow::Result<i32> {
    if !args.prepare {
        writeln!(out, "nothing to do; try --prepare")?;
        return Ok(1);
    }
    match prepare_upgrade(env.client.as_ref(), &env.metadata).await {
        Ok(()) => {
            writeln!(out, "instance prepared for upgrade")?;
            Ok(0)
        }
        Err(err) => {
            writeln!(out, "{err}")?;
            Ok(1)
        }
    }
}

/// Runs one parsed command; returns the process exit code.
pub async fn run(
    cli: &Cli,
    env: &AdminEnv,
    out: &mut impl std::io::Write,
) -> anyhow::Result<i32> {
    match &cli.command {
        Command::Fate(args) => run_fate(args, env, out).await,
        Command::Upgrade(args) => run_upgrade(args, env, out).await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use tessera_coordination::lock::ServiceLock;
    use tessera_coordination::memory::{ensure_persistent_path, MemoryCoordination};
    use tessera_fate::UserFateStore;
    use tessera_types::LockId;
    use uuid::Uuid;

    async fn env() -> (
        AdminEnv,
        Arc<dyn FateStore<ManagerRepo>>,
        tessera_coordination::ServiceLockHandle,
    ) {
        let coordination = MemoryCoordination::new();
        let client = coordination.client();
        ensure_persistent_path(client.as_ref(), "/locks/manager")
            .await
            .unwrap();
        // admin reservations need a real lock to hang off
        let lock = ServiceLock::new(client.clone())
            .acquire("/locks/manager", Bytes::new())
            .await
            .unwrap();
        let lock_id = lock.lock_id().clone();

        let metadata = MetadataStore::new();
        let store: Arc<dyn FateStore<ManagerRepo>> =
            Arc::new(UserFateStore::new(metadata.clone()));
        (
            AdminEnv::new(client, metadata, vec![Arc::clone(&store)], lock_id),
            store,
            lock,
        )
    }

    fn parse(line: &[&str]) -> Cli {
        Cli::try_parse_from(line).unwrap()
    }

    #[tokio::test]
    async fn summary_of_missing_txn_reports_unknown_and_exits_zero() {
        let (env, _store, _lock) = env().await;
        let fake = FateId::new(FateInstanceType::User, Uuid::new_v4());
        let cli = parse(&[
            "tessera-admin",
            "fate",
            &fake.canonical(),
            "--summary",
            "-j",
        ]);
        let mut out = Vec::new();
        let code = run(&cli, &env, &mut out).await.unwrap();
        assert_eq!(code, 0);
        let text = String::from_utf8(out).unwrap();
        assert!(text.contains("UNKNOWN"), "{text}");
        assert!(text.contains("\"time_created\": 0"), "{text}");
    }

    #[tokio::test]
    async fn cancel_moves_new_txn_to_failed() {
        let (env, store, _lock) = env().await;
        let fate_id = store.create().await.unwrap();
        let cli = parse(&["tessera-admin", "fate", &fate_id.canonical(), "--cancel"]);
        let mut out = Vec::new();
        let code = run(&cli, &env, &mut out).await.unwrap();
        assert_eq!(code, 0);
        assert_eq!(store.status(fate_id).await.unwrap(), TxStatus::Failed);
    }

    #[tokio::test]
    async fn fail_of_busy_txn_prints_notice_and_exits_zero() {
        let (env, store, _lock) = env().await;
        let fate_id = store.create().await.unwrap();
        // a foreign reservation keeps the transaction busy
        let busy = tessera_types::FateReservation::new(LockId::new(
            "/locks/manager",
            Uuid::new_v4(),
            5,
        ));
        store.try_reserve(fate_id, &busy).await.unwrap();

        let cli = parse(&[
            "tessera-admin",
            "fate",
            &fate_id.canonical(),
            "--fail",
            "--wait-seconds",
            "1",
        ]);
        let mut out = Vec::new();
        let code = run(&cli, &env, &mut out).await.unwrap();
        assert_eq!(code, 0);
        let text = String::from_utf8(out).unwrap();
        assert!(
            text.contains(&format!("Could not fail {fate_id} in a reasonable time")),
            "{text}"
        );
    }

    #[tokio::test]
    async fn delete_requires_terminal_state() {
        let (env, store, _lock) = env().await;
        let fate_id = store.create().await.unwrap();
        store
            .set_status(fate_id, &[TxStatus::New], TxStatus::Submitted)
            .await
            .unwrap();

        let cli = parse(&[
            "tessera-admin",
            "fate",
            &fate_id.canonical(),
            "--delete",
            "--wait-seconds",
            "1",
        ]);
        let mut out = Vec::new();
        assert_eq!(run(&cli, &env, &mut out).await.unwrap(), 0);
        let text = String::from_utf8(out).unwrap();
        assert!(text.contains("could not delete"), "{text}");
        assert!(store.read(fate_id).await.unwrap().is_some());

        store
            .set_status(fate_id, &[TxStatus::Submitted], TxStatus::Failed)
            .await
            .unwrap();
        let mut out = Vec::new();
        assert_eq!(run(&cli, &env, &mut out).await.unwrap(), 0);
        assert!(store.read(fate_id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn state_filter_limits_summary() {
        let (env, store, _lock) = env().await;
        let keep = store.create().await.unwrap();
        let drop = store.create().await.unwrap();
        store
            .set_status(drop, &[TxStatus::New], TxStatus::Failed)
            .await
            .unwrap();

        let cli = parse(&["tessera-admin", "fate", "--summary", "-s", "NEW"]);
        let mut out = Vec::new();
        run(&cli, &env, &mut out).await.unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.contains(&keep.canonical()), "{text}");
        assert!(!text.contains(&drop.canonical()), "{text}");
    }
}
