use std::fmt::Write as _;
use std::time::Duration;

use config::Config;
use net::Prefix;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::backend::{Family, IpTablesBackend};
use crate::{FILTER_CHAIN, FirewallConfig, NAT_CHAIN};

const SYNC_INTERVAL: Duration = Duration::from_secs(60);

/// Drives the packet-filter reconciler: applies a new config as soon as it
/// arrives, and otherwise re-applies the last one at least once every
/// [`SYNC_INTERVAL`] in case something else flushed the kernel rules.
pub async fn run(
    mut updates: mpsc::Receiver<FirewallConfig>,
    backend: impl IpTablesBackend,
    cfg: &Config,
    cancel: CancellationToken,
) {
    info!("started syncing firewall rules");

    let mut last_applied: Option<FirewallConfig> = None;
    let mut deadline = Instant::now() + SYNC_INTERVAL;

    loop {
        tokio::select! {
            () = cancel.cancelled() => {
                info!("firewall worker shutting down");
                return;
            }
            () = tokio::time::sleep_until(deadline) => {
                deadline = Instant::now() + SYNC_INTERVAL;
            }
            received = updates.recv() => {
                match received {
                    None => return,
                    Some(new_cfg) => {
                        if last_applied.as_ref() != Some(&new_cfg) {
                            info!("received new firewall configuration");
                            last_applied = Some(new_cfg);
                            deadline = Instant::now() + SYNC_INTERVAL;
                        }
                        // An unchanged config does not reset the timer: we still
                        // want to resync periodically even under a storm of
                        // no-op updates.
                    }
                }
            }
        }

        if let Some(applied) = &last_applied {
            if let Err(err) = sync_rules(&backend, cfg, applied).await {
                error!(%err, "failed to sync firewall rules");
            }
        }
    }
}

async fn sync_rules(
    backend: &impl IpTablesBackend,
    cfg: &Config,
    firewall: &FirewallConfig,
) -> Result<(), crate::BackendError> {
    let (v6, v4): (Vec<Prefix>, Vec<Prefix>) =
        firewall.pod_cidrs.iter().cloned().partition(Prefix::is_ipv6);

    if cfg.filter_v6 {
        sync_filter_rules(backend, Family::V6, &v6, true).await?;
    }
    if cfg.filter_v4 {
        sync_filter_rules(backend, Family::V4, &v4, false).await?;
    }
    if cfg.masquerade_v6 {
        sync_masquerade_rules(backend, Family::V6, &v6).await?;
    }
    if cfg.masquerade_v4 {
        sync_masquerade_rules(backend, Family::V4, &v4).await?;
    }
    Ok(())
}

async fn sync_masquerade_rules(
    backend: &impl IpTablesBackend,
    family: Family,
    non_masq_cidrs: &[Prefix],
) -> Result<(), crate::BackendError> {
    backend.ensure_chain(family, "nat", NAT_CHAIN).await?;
    backend
        .ensure_jump(
            family,
            "nat",
            "POSTROUTING",
            &[
                "-m",
                "addrtype",
                "!",
                "--dst-type",
                "LOCAL",
                "-j",
                NAT_CHAIN,
                "-m",
                "comment",
                "--comment",
                "masquerade non-LOCAL traffic",
            ],
        )
        .await?;

    let mut buf = String::new();
    writeln!(buf, "*nat").unwrap();
    writeln!(buf, "-F {NAT_CHAIN}").unwrap();
    writeln!(buf, ":{NAT_CHAIN} - [0:0]").unwrap();
    for cidr in non_masq_cidrs {
        writeln!(buf, "-A {NAT_CHAIN} -d {cidr} -j RETURN").unwrap();
    }
    writeln!(buf, "-A {NAT_CHAIN} -j MASQUERADE").unwrap();
    writeln!(buf, "COMMIT").unwrap();

    backend.restore(family, buf).await
}

async fn sync_filter_rules(
    backend: &impl IpTablesBackend,
    family: Family,
    non_filter_cidrs: &[Prefix],
    is_ipv6: bool,
) -> Result<(), crate::BackendError> {
    backend.ensure_chain(family, "filter", FILTER_CHAIN).await?;
    backend
        .ensure_jump(
            family,
            "filter",
            "FORWARD",
            &[
                "-m",
                "comment",
                "--comment",
                "prevent direct ingress traffic to pods",
                "-j",
                FILTER_CHAIN,
            ],
        )
        .await?;

    let mut buf = String::new();
    writeln!(buf, "*filter").unwrap();
    writeln!(buf, "-F {FILTER_CHAIN}").unwrap();
    writeln!(buf, ":{FILTER_CHAIN} - [0:0]").unwrap();
    writeln!(
        buf,
        "-A {FILTER_CHAIN} -m conntrack --ctstate ESTABLISHED,RELATED -j RETURN"
    )
    .unwrap();
    if is_ipv6 {
        // Path MTU discovery and diagnostics rely on ICMPv6 getting through; see RFC 4890.
        writeln!(buf, "-A {FILTER_CHAIN} -p ipv6-icmp -j RETURN").unwrap();
    }
    for cidr in non_filter_cidrs {
        writeln!(buf, "-A {FILTER_CHAIN} -s {cidr} -j RETURN").unwrap();
    }
    writeln!(buf, "-A {FILTER_CHAIN} -j DROP").unwrap();
    writeln!(buf, "COMMIT").unwrap();

    backend.restore(family, buf).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct FakeBackend {
        restores: Mutex<Vec<(Family, String)>>,
    }

    impl IpTablesBackend for FakeBackend {
        async fn ensure_chain(
            &self,
            _family: Family,
            _table: &str,
            _chain: &str,
        ) -> Result<(), crate::BackendError> {
            Ok(())
        }

        async fn ensure_jump(
            &self,
            _family: Family,
            _table: &str,
            _parent_chain: &str,
            _jump_args: &[&str],
        ) -> Result<(), crate::BackendError> {
            Ok(())
        }

        async fn restore(&self, family: Family, buffer: String) -> Result<(), crate::BackendError> {
            self.restores.lock().unwrap().push((family, buffer));
            Ok(())
        }
    }

    fn test_config(node_name: &str) -> Config {
        Config::from_source(&move |name| {
            if name == "NODE_NAME" {
                Ok(node_name.to_string())
            } else {
                Err(std::env::VarError::NotPresent)
            }
        })
        .unwrap()
    }

    #[tokio::test]
    async fn masquerade_rules_return_on_pod_cidrs_then_masquerade() {
        let backend = FakeBackend::default();
        let cidrs = vec!["10.0.0.0/24".parse().unwrap()];
        sync_masquerade_rules(&backend, Family::V4, &cidrs).await.unwrap();

        let restores = backend.restores.lock().unwrap();
        assert_eq!(restores.len(), 1);
        let (family, buf) = &restores[0];
        assert_eq!(*family, Family::V4);
        assert!(buf.contains("-A WIGGLENET-MASQ -d 10.0.0.0/24 -j RETURN"));
        assert!(buf.contains("-A WIGGLENET-MASQ -j MASQUERADE"));
        assert!(buf.trim_end().ends_with("COMMIT"));
    }

    #[tokio::test]
    async fn filter_rules_allow_icmpv6_only_for_v6() {
        let backend = FakeBackend::default();
        sync_filter_rules(&backend, Family::V6, &[], true).await.unwrap();
        let restores = backend.restores.lock().unwrap();
        assert!(restores[0].1.contains("-p ipv6-icmp -j RETURN"));
    }

    #[tokio::test]
    async fn sync_rules_is_gated_by_config_flags() {
        let mut cfg = test_config("self");
        cfg.masquerade_v4 = false;
        cfg.masquerade_v6 = false;
        cfg.filter_v4 = false;
        cfg.filter_v6 = false;

        let backend = FakeBackend::default();
        let firewall = FirewallConfig { pod_cidrs: vec!["10.0.0.0/24".parse().unwrap()] };
        sync_rules(&backend, &cfg, &firewall).await.unwrap();
        assert!(backend.restores.lock().unwrap().is_empty());
    }
}
