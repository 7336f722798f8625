//! The `wigglenet` agent binary: wires environment configuration, the
//! node-registry watcher, the controller worker, and the firewall worker
//! into one long-lived process.

mod localaddrs;
mod nodespec;
mod privkey;

use std::sync::Arc;
use std::time::Duration;

use controller::{self, KubeNodeRecordStore, SharedNodeCache, WorkQueue};
use k8s_openapi::api::core::v1::Node;
use kube::{Api, Client};
use miette::{Context, IntoDiagnostic};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::layer::SubscriberExt;

const CACHE_SYNC_TIMEOUT: Duration = Duration::from_secs(30);
const FIREWALL_CHANNEL_CAPACITY: usize = 10;
const WORK_QUEUE_CAPACITY: usize = 64;

#[derive(Debug, Error)]
enum StartupError {
    #[error("configuration error: {0}")]
    Config(#[from] config::ConfigError),
    #[error(transparent)]
    PrivateKey(#[from] privkey::PrivateKeyError),
    #[error("failed to build a kubernetes client: {0}")]
    Client(#[from] kube::Error),
    #[error("failed to read own node record: {0}")]
    SelfSetup(#[from] controller::SelfSetupError),
    #[error("timed out waiting for the node cache to sync")]
    CacheSyncTimeout,
    #[error("node watcher exited before the cache synced: {0}")]
    WatcherExited(String),
    #[error("initial reconciliation failed: {0}")]
    InitialReconcile(String),
}

fn early_init() {
    let subscriber = tracing_subscriber::fmt()
        .with_ansi(true)
        .with_thread_ids(true)
        .with_file(true)
        .with_level(true)
        .with_line_number(true)
        .finish()
        .with(tracing_error::ErrorLayer::default());
    tracing::subscriber::set_global_default(subscriber)
        .into_diagnostic()
        .wrap_err("failed to set tracing subscriber")
        .unwrap();
    color_eyre::install().expect("failed to install color-eyre");
}

#[tokio::main]
async fn main() {
    early_init();

    match run().await {
        Ok(()) => std::process::exit(0),
        Err(err) => {
            tracing::error!(%err, "agent exited on startup failure");
            std::process::exit(1);
        }
    }
}

async fn run() -> Result<(), StartupError> {
    let cfg = config::Config::from_env().map_err(StartupError::from)?;
    tracing::info!(node = cfg.node_name, "starting wigglenet agent");

    let private_key = privkey::load_or_create(&cfg.privkey_path).map_err(StartupError::from)?;
    let public_key = privkey::public_key(&private_key);

    let client = Client::try_default().await.map_err(StartupError::from)?;
    let node_store = KubeNodeRecordStore::new(client.clone());

    let own_node: Api<Node> = Api::all(client.clone());
    let node = own_node.get(&cfg.node_name).await.map_err(StartupError::Client)?;
    let (spec_v4, spec_v6) = nodespec::spec_pod_cidrs(&node);

    let pod_cidrs_v4 =
        controller::resolve_pod_cidrs(cfg.pod_cidr_source_v4, &spec_v4, cfg.pod_cidr_source_path.as_deref());
    let pod_cidrs_v6 =
        controller::resolve_pod_cidrs(cfg.pod_cidr_source_v6, &spec_v6, cfg.pod_cidr_source_path.as_deref());
    let pod_cidrs: Vec<net::Prefix> = pod_cidrs_v4.into_iter().chain(pod_cidrs_v6).collect();

    let node_ips = localaddrs::local_addresses(&cfg.node_ip_interfaces);

    controller::self_setup(&node_store, &cfg, &public_key, node_ips, pod_cidrs)
        .await
        .map_err(StartupError::from)?;

    let cache = SharedNodeCache::default();
    let (changed_tx, mut changed_rx) = mpsc::channel::<String>(WORK_QUEUE_CAPACITY);
    let (synced_tx, synced_rx) = oneshot::channel();

    let watcher_cache = cache.clone();
    tokio::spawn(async move {
        if let Err(err) = controller::run_watcher(watcher_cache, changed_tx, Some(synced_tx)).await {
            tracing::error!(%err, "node watcher exited");
        }
    });

    match tokio::time::timeout(CACHE_SYNC_TIMEOUT, synced_rx).await {
        Ok(Ok(())) => {}
        Ok(Err(_)) => return Err(StartupError::WatcherExited("sync signal dropped".to_string())),
        Err(_) => return Err(StartupError::CacheSyncTimeout),
    }
    tracing::info!("node cache synced");

    let mut queue = WorkQueue::new(WORK_QUEUE_CAPACITY);
    let queue_handle = queue.handle();
    tokio::spawn(async move {
        while let Some(key) = changed_rx.recv().await {
            queue_handle.enqueue(key).await;
        }
    });

    let (firewall_tx, firewall_rx) = mpsc::channel(FIREWALL_CHANNEL_CAPACITY);
    let cancel = CancellationToken::new();

    let (rt_connection, rt_handle, _) = rtnetlink::new_connection().map_err(|e| {
        StartupError::InitialReconcile(format!("failed to open netlink socket: {e}"))
    })?;
    tokio::spawn(rt_connection);
    let vpn_backend = vpn::KernelBackend::new(rt_handle);

    let mut cni_writer = cni::CniConfigWriter::new(cfg.cni_config_path.clone());
    let mut vpn_last_applied: Option<vpn::VpnConfig> = None;

    if !cfg.skip_vpn() {
        controller::reconcile_once(
            &cache,
            &cfg,
            &private_key,
            &vpn_backend,
            &mut vpn_last_applied,
            &firewall_tx,
            &mut cni_writer,
        )
        .await
        .map_err(StartupError::InitialReconcile)?;
    }

    let firewall_cfg = Arc::new(cfg.clone());
    let firewall_cancel = cancel.clone();
    let firewall_task = tokio::spawn(async move {
        firewall::run(firewall_rx, firewall::ShellBackend, &firewall_cfg, firewall_cancel).await;
    });

    let controller_task = tokio::spawn(controller::run_worker(
        queue,
        cache,
        cfg,
        private_key,
        vpn_backend,
        firewall_tx,
        cni_writer,
        vpn_last_applied,
        cancel.clone(),
    ));

    wait_for_shutdown_signal().await;
    tracing::info!("shutdown signal received, draining workers");
    cancel.cancel();

    let _ = controller_task.await;
    let _ = firewall_task.await;
    tracing::info!("shutdown complete");
    Ok(())
}

async fn wait_for_shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate()).expect("failed to register SIGTERM handler");
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = sigterm.recv() => {}
    }
}
