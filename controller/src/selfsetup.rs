//! Publishes this node's own `public-key`, `node-ips`, and `pod-cidrs`
//! annotations before the controller starts watching for peers, retrying
//! on optimistic-concurrency conflict.

use std::future::Future;
use std::net::IpAddr;

use config::{Config, PodCidrSource};
use net::Prefix;
use peer::NodeRecord;
use thiserror::Error;

const MAX_CONFLICT_RETRIES: u8 = 5;

#[derive(Debug, Error)]
pub enum SelfSetupError {
    #[error("failed to read or update own node record: {0}")]
    Store(String),
    #[error("exceeded {MAX_CONFLICT_RETRIES} optimistic-concurrency retries updating own node record")]
    ConflictRetriesExhausted,
}

/// Narrow capability interface over the node registry's read/compare-and-
/// swap surface, so self-setup is testable without a live API server.
pub trait NodeRecordStore: Send + Sync {
    fn get(&self, name: &str) -> impl Future<Output = Result<NodeRecord, SelfSetupError>> + Send;

    /// Writes `record` back iff it has not changed since it was read.
    /// Returns `false` on a conflict so the caller can re-read and retry.
    fn compare_and_swap(
        &self,
        record: &NodeRecord,
    ) -> impl Future<Output = Result<bool, SelfSetupError>> + Send;
}

/// Resolves this node's own pod prefixes for one family per the configured
/// source: the prefixes already on the record, a local file, or none.
pub fn resolve_pod_cidrs(
    source: PodCidrSource,
    spec_cidrs: &[Prefix],
    file_path: Option<&std::path::Path>,
) -> Vec<Prefix> {
    match source {
        PodCidrSource::Spec => spec_cidrs.to_vec(),
        PodCidrSource::None => Vec::new(),
        PodCidrSource::File => {
            let Some(path) = file_path else {
                tracing::warn!("POD_CIDR_SOURCE_PATH not set, treating as no pod prefixes");
                return Vec::new();
            };
            match std::fs::read_to_string(path) {
                Ok(contents) => contents
                    .lines()
                    .map(str::trim)
                    .filter(|l| !l.is_empty())
                    .filter_map(|l| match l.parse() {
                        Ok(p) => Some(p),
                        Err(err) => {
                            tracing::warn!(line = l, %err, "skipping malformed pod prefix line");
                            None
                        }
                    })
                    .collect(),
                Err(err) => {
                    tracing::warn!(?path, %err, "failed to read pod CIDR source file");
                    Vec::new()
                }
            }
        }
    }
}

pub async fn self_setup(
    store: &impl NodeRecordStore,
    cfg: &Config,
    public_key: &[u8; 32],
    node_ips: Vec<IpAddr>,
    pod_cidrs: Vec<Prefix>,
) -> Result<(), SelfSetupError> {
    let pod_cidrs = net::summarise(&pod_cidrs);

    for attempt in 0..MAX_CONFLICT_RETRIES {
        let mut record = store.get(&cfg.node_name).await?;
        record
            .annotations
            .insert(annotation::PUBLIC_KEY.to_string(), annotation::encode_public_key(public_key));
        record
            .annotations
            .insert(annotation::NODE_IPS.to_string(), annotation::encode_node_ips(&node_ips));
        record
            .annotations
            .insert(annotation::POD_CIDRS.to_string(), annotation::encode_pod_cidrs(&pod_cidrs));

        if store.compare_and_swap(&record).await? {
            tracing::info!(attempt, "published self node-record annotations");
            return Ok(());
        }
        tracing::warn!(attempt, "conflict updating own node record, retrying");
    }

    Err(SelfSetupError::ConflictRetriesExhausted)
}
