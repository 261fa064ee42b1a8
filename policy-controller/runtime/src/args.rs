use crate::{
    index::{Dispatch, Reconciler},
    k8s,
    kernel::{FilterStore, Ipset, Iptables, SetStore},
};
use anyhow::{bail, Result};
use clap::Parser;
use kube::runtime::watcher;
use parking_lot::RwLock;
use std::{path::PathBuf, sync::Arc};
use tokio::time::{self, Duration};
use tracing::{info, info_span, warn, Instrument};

#[derive(Debug, Parser)]
#[clap(name = "netpol", about = "A node-local network policy controller")]
pub struct Args {
    #[clap(
        long,
        default_value = "netpol=info,warn",
        env = "NETPOL_CONTROLLER_LOG"
    )]
    log_level: kubert::LogFilter,

    #[clap(long, default_value = "plain", env = "NETPOL_CONTROLLER_LOG_FORMAT")]
    log_format: kubert::LogFormat,

    #[clap(flatten)]
    client: kubert::ClientArgs,

    #[clap(flatten)]
    admin: kubert::AdminArgs,

    /// The `ipset` binary.
    #[clap(long, default_value = "ipset", env = "NETPOL_IPSET")]
    ipset_path: PathBuf,

    /// The `iptables-save` binary.
    #[clap(long, default_value = "iptables-save", env = "NETPOL_IPTABLES_SAVE")]
    iptables_save_path: PathBuf,

    /// The `iptables-restore` binary.
    #[clap(long, default_value = "iptables-restore", env = "NETPOL_IPTABLES_RESTORE")]
    iptables_restore_path: PathBuf,

    /// Where kernel state is persisted on shutdown and read on startup.
    #[clap(
        long,
        default_value = "/var/lib/netpol-controller",
        env = "NETPOL_SNAPSHOT_DIR"
    )]
    snapshot_dir: PathBuf,

    /// How often failed events are redelivered.
    #[clap(long, default_value = "1000", env = "NETPOL_RETRY_INTERVAL_MS")]
    retry_interval_ms: u64,

    /// How long to wait after startup, for watches to sync, before removing state that no
    /// watched resource accounts for.
    #[clap(long, default_value = "30", env = "NETPOL_PRUNE_DELAY_SECS")]
    prune_delay_secs: u64,
}

impl Args {
    #[inline]
    pub async fn parse_and_run() -> Result<()> {
        Self::parse().run().await
    }

    pub async fn run(self) -> Result<()> {
        let Self {
            admin,
            client,
            log_level,
            log_format,
            ipset_path,
            iptables_save_path,
            iptables_restore_path,
            snapshot_dir,
            retry_interval_ms,
            prune_delay_secs,
        } = self;

        let mut runtime = kubert::Runtime::builder()
            .with_log(log_level, log_format)
            .with_admin(admin.into_builder())
            .with_client(client)
            .build()
            .await?;

        // Seed the kernel from the last run's snapshot, then install the base rules.
        let sets = SetStore::new(Ipset::new(ipset_path));
        let filters = FilterStore::new(Iptables::new(iptables_save_path, iptables_restore_path));
        let reconciler = Arc::new(Reconciler::load(sets, filters, &snapshot_dir)?);
        let dispatch = Dispatch::new(reconciler.clone());
        let index = Arc::new(RwLock::new(dispatch.clone()));

        // Spawn resource watches.

        let namespaces = runtime.watch_all::<k8s::Namespace>(watcher::Config::default());
        tokio::spawn(
            kubert::index::cluster(index.clone(), namespaces)
                .instrument(info_span!("namespaces")),
        );

        let pods = runtime.watch_all::<k8s::Pod>(watcher::Config::default());
        tokio::spawn(kubert::index::namespaced(index.clone(), pods).instrument(info_span!("pods")));

        let policies = runtime.watch_all::<k8s::NetworkPolicy>(watcher::Config::default());
        tokio::spawn(
            kubert::index::namespaced(index, policies).instrument(info_span!("networkpolicies")),
        );

        tokio::spawn(
            dispatch
                .retry_pending(Duration::from_millis(retry_interval_ms))
                .instrument(info_span!("retry")),
        );

        tokio::spawn(
            prune(reconciler.clone(), Duration::from_secs(prune_delay_secs))
                .instrument(info_span!("prune")),
        );

        // Block the main thread on the shutdown signal. Once it fires, persist the kernel state
        // for the next run.
        let res = runtime.run().await;
        if let Err(error) = reconciler.persist(&snapshot_dir) {
            warn!(%error, "Failed to persist snapshot");
        }
        if res.is_err() {
            bail!("Aborted");
        }

        Ok(())
    }
}

/// Removes state left behind by a previous run once the watches have had time to sync.
async fn prune(reconciler: Arc<Reconciler>, delay: Duration) {
    time::sleep(delay).await;
    match reconciler.prune() {
        Ok(()) => info!("Pruned stale kernel state"),
        Err(error) => warn!(%error, "Failed to prune stale kernel state"),
    }
}
