//! The node cache: a snapshot the controller reads on every pass, kept
//! current by a background watch of the orchestrator's node registry. The
//! watch itself sits outside the reconciliation core — it only has to
//! publish "this key changed" so the worker can re-admit it to the queue.

use std::collections::BTreeMap;
use std::sync::Arc;

use futures::{StreamExt, TryStreamExt};
use k8s_openapi::api::core::v1::Node;
use kube::runtime::watcher;
use kube::runtime::WatchStreamExt;
use kube::{Api, Client};
use parking_lot::RwLock;
use tokio::sync::{mpsc, oneshot};

use peer::NodeRecord;

#[derive(Debug, thiserror::Error)]
pub enum WatchError {
    #[error("kubernetes client error: {0}")]
    Client(#[from] kube::Error),
}

/// A read-only view over the live node cache.
pub trait NodeCache: Send + Sync {
    fn snapshot(&self) -> Vec<NodeRecord>;
    fn get(&self, name: &str) -> Option<NodeRecord>;
}

#[derive(Clone, Default)]
pub struct SharedNodeCache {
    nodes: Arc<RwLock<BTreeMap<String, NodeRecord>>>,
}

impl NodeCache for SharedNodeCache {
    fn snapshot(&self) -> Vec<NodeRecord> {
        self.nodes.read().values().cloned().collect()
    }

    fn get(&self, name: &str) -> Option<NodeRecord> {
        self.nodes.read().get(name).cloned()
    }
}

impl SharedNodeCache {
    fn upsert(&self, record: NodeRecord) {
        self.nodes.write().insert(record.name.clone(), record);
    }

    fn remove(&self, name: &str) {
        self.nodes.write().remove(name);
    }
}

fn node_record(node: &Node) -> NodeRecord {
    NodeRecord {
        name: node.metadata.name.clone().unwrap_or_default(),
        annotations: node.metadata.annotations.clone().unwrap_or_default(),
    }
}

/// Runs the watch loop against the cluster's node registry, keeping
/// `cache` current and sending the name of every node that changed on
/// `changed`. `synced` fires once, the first time the initial relist
/// completes, so the caller can hold the worker back until the cache
/// reflects the full node set. Runs until the watch stream ends (which,
/// with the default backoff, means the process is shutting down).
pub async fn run(
    cache: SharedNodeCache,
    changed: mpsc::Sender<String>,
    mut synced: Option<oneshot::Sender<()>>,
) -> Result<(), WatchError> {
    let client = Client::try_default().await?;
    let nodes: Api<Node> = Api::all(client);

    let mut stream = watcher(nodes, watcher::Config::default()).default_backoff().boxed();

    loop {
        match stream.try_next().await {
            Ok(Some(event)) => match event {
                watcher::Event::Apply(node) | watcher::Event::InitApply(node) => {
                    let record = node_record(&node);
                    let name = record.name.clone();
                    cache.upsert(record);
                    let _ = changed.send(name).await;
                }
                watcher::Event::Delete(node) => {
                    let name = node.metadata.name.clone().unwrap_or_default();
                    cache.remove(&name);
                    let _ = changed.send(name).await;
                }
                watcher::Event::Init => {}
                watcher::Event::InitDone => {
                    if let Some(tx) = synced.take() {
                        let _ = tx.send(());
                    }
                }
            },
            Ok(None) => return Ok(()),
            Err(err) => {
                tracing::error!(%err, "node watch error");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_reflects_upserts_and_removals() {
        let cache = SharedNodeCache::default();
        cache.upsert(NodeRecord::new("a"));
        cache.upsert(NodeRecord::new("b"));
        assert_eq!(cache.snapshot().len(), 2);

        cache.remove("a");
        assert_eq!(cache.snapshot().len(), 1);
        assert!(cache.get("a").is_none());
        assert!(cache.get("b").is_some());
    }
}
