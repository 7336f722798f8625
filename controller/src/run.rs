//! The production `NodeRecordStore`, and the top-level loop that wires the
//! node watcher, the work queue, and the two reconcilers together.

use std::sync::Mutex;

use k8s_openapi::api::core::v1::Node;
use kube::api::{Patch, PatchParams};
use kube::{Api, Client};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use config::Config;
use peer::NodeRecord;

use crate::desired_state;
use crate::queue::WorkQueue;
use crate::selfsetup::{NodeRecordStore, SelfSetupError};
use crate::watcher::{self, SharedNodeCache};

pub struct KubeNodeRecordStore {
    api: Api<Node>,
    last_resource_version: Mutex<Option<String>>,
}

impl KubeNodeRecordStore {
    pub fn new(client: Client) -> Self {
        Self { api: Api::all(client), last_resource_version: Mutex::new(None) }
    }
}

impl NodeRecordStore for KubeNodeRecordStore {
    async fn get(&self, name: &str) -> Result<NodeRecord, SelfSetupError> {
        let node = self.api.get(name).await.map_err(|e| SelfSetupError::Store(e.to_string()))?;
        *self.last_resource_version.lock().unwrap() = node.metadata.resource_version.clone();
        Ok(NodeRecord {
            name: node.metadata.name.clone().unwrap_or_default(),
            annotations: node.metadata.annotations.clone().unwrap_or_default(),
        })
    }

    async fn compare_and_swap(&self, record: &NodeRecord) -> Result<bool, SelfSetupError> {
        let expected_version = self.last_resource_version.lock().unwrap().clone();
        let current = self
            .api
            .get(&record.name)
            .await
            .map_err(|e| SelfSetupError::Store(e.to_string()))?;
        if current.metadata.resource_version != expected_version {
            return Ok(false);
        }

        let patch = serde_json::json!({
            "metadata": { "annotations": record.annotations }
        });
        match self
            .api
            .patch(&record.name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
        {
            Ok(_) => Ok(true),
            Err(kube::Error::Api(e)) if e.code == 409 => Ok(false),
            Err(e) => Err(SelfSetupError::Store(e.to_string())),
        }
    }
}

/// One reconciliation pass: recompute desired state from the cache and
/// apply it to both reconcilers (and, unless firewall-only, the plugin
/// descriptor).
pub async fn reconcile_once(
    cache: &SharedNodeCache,
    cfg: &Config,
    private_key: &[u8; 32],
    vpn_backend: &impl vpn::VpnBackend,
    vpn_last_applied: &mut Option<vpn::VpnConfig>,
    firewall_tx: &mpsc::Sender<firewall::FirewallConfig>,
    cni_writer: &mut cni::CniConfigWriter,
) -> Result<(), String> {
    use crate::watcher::NodeCache;

    let nodes = cache.snapshot();
    let Some(self_node) = cache.get(&cfg.node_name) else {
        return Err(format!("{} not yet present in the node cache", cfg.node_name));
    };

    let desired = desired_state::compute(&nodes, &self_node, cfg);

    if let Err(err) = firewall_tx.try_send(desired.firewall) {
        tracing::warn!(%err, "firewall channel full or closed, dropping update");
    }

    if !cfg.skip_vpn() {
        vpn::apply(vpn_backend, cfg, private_key, &desired.vpn, vpn_last_applied)
            .await
            .map_err(|e| e.to_string())?;

        cni_writer
            .write(cni::CniConfig { pod_cidrs: desired.pod_cidrs })
            .map_err(|e| e.to_string())?;
    }

    Ok(())
}

/// Drives the controller worker: recomputes and applies desired state for
/// every key the queue delivers, retrying transient failures with
/// rate-limited backoff and dropping a key after too many.
pub async fn run_worker(
    mut queue: WorkQueue,
    cache: SharedNodeCache,
    cfg: Config,
    private_key: [u8; 32],
    vpn_backend: impl vpn::VpnBackend,
    firewall_tx: mpsc::Sender<firewall::FirewallConfig>,
    mut cni_writer: cni::CniConfigWriter,
    mut vpn_last_applied: Option<vpn::VpnConfig>,
    cancel: CancellationToken,
) {
    loop {
        let key = tokio::select! {
            () = cancel.cancelled() => return,
            key = queue.recv() => match key {
                Some(k) => k,
                None => return,
            },
        };

        let result = reconcile_once(
            &cache,
            &cfg,
            &private_key,
            &vpn_backend,
            &mut vpn_last_applied,
            &firewall_tx,
            &mut cni_writer,
        )
        .await;

        if let Err(err) = result {
            tracing::warn!(%key, %err, "reconciliation failed");
            if !queue.retry(key.clone()).await {
                tracing::error!(%key, "dropping key after exhausting retries");
            }
        }
    }
}
