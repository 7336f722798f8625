//! Drives one `VpnBackend` to the state described by a [`VpnConfig`]:
//! peers first, then local addresses, then routes — the order in which a
//! half-applied update is least likely to black-hole traffic that was
//! already flowing.

use std::collections::HashSet;
use std::net::IpAddr;

use config::Config;
use net::Prefix;

use crate::backend::{Route, RouteScope, VpnBackend, VpnError};
use crate::changeset::compute_changes;
use crate::VpnConfig;

/// Brings `backend` to `desired`, skipping the whole update if it is
/// identical to the last config successfully applied.
pub async fn apply(
    backend: &impl VpnBackend,
    cfg: &Config,
    private_key: &[u8; 32],
    desired: &VpnConfig,
    last_applied: &mut Option<VpnConfig>,
) -> Result<(), VpnError> {
    if last_applied.as_ref() == Some(desired) {
        return Ok(());
    }

    backend.ensure_link(&cfg.iface_name).await?;

    let live_peers = backend.device_peers(&cfg.iface_name).await?;
    let changes = compute_changes(&live_peers, &desired.peers, cfg.wg_port);
    if !changes.is_empty() {
        backend.configure_device(&cfg.iface_name, private_key, cfg.wg_port, changes).await?;
    }

    reconcile_addresses(backend, &cfg.iface_name, &desired.local_addresses).await?;
    reconcile_routes(backend, cfg, desired).await?;

    *last_applied = Some(desired.clone());
    Ok(())
}

async fn reconcile_addresses(
    backend: &impl VpnBackend,
    iface: &str,
    desired: &[IpAddr],
) -> Result<(), VpnError> {
    let live: HashSet<Prefix> = backend.list_addresses(iface).await?.into_iter().collect();
    let desired: HashSet<Prefix> = desired.iter().map(|a| Prefix::host(*a)).collect();

    for stale in live.difference(&desired) {
        backend.del_address(iface, *stale).await?;
    }
    for missing in desired.difference(&live) {
        backend.add_address(iface, *missing).await?;
    }
    Ok(())
}

/// Routes are reconciled per family, and only for a family the agent is
/// actually responsible for routing (native-routed families are left to
/// whatever put those routes there in the first place). Only pod prefixes
/// become UNIVERSE-scope routes, summarised across all peers first — a
/// peer's node prefixes (its own endpoint addresses) stay in the device's
/// `AllowedIPs` but never become a kernel route, or every peer's endpoint
/// would get pulled into the tunnel and risk a routing loop.
async fn reconcile_routes(
    backend: &impl VpnBackend,
    cfg: &Config,
    desired: &VpnConfig,
) -> Result<(), VpnError> {
    let mut wanted: HashSet<Route> = HashSet::new();

    for addr in &desired.local_addresses {
        let is_v6 = addr.is_ipv6();
        if (is_v6 && cfg.native_routing_v6) || (!is_v6 && cfg.native_routing_v4) {
            continue;
        }
        wanted.insert(Route { dst: Prefix::host(*addr), scope: RouteScope::Host });
    }

    let pod_cidrs: Vec<Prefix> =
        desired.peers.iter().flat_map(|p| p.pod_cidrs.iter().copied()).collect();
    for cidr in net::summarise(&pod_cidrs) {
        let is_v6 = cidr.is_ipv6();
        if (is_v6 && cfg.native_routing_v6) || (!is_v6 && cfg.native_routing_v4) {
            continue;
        }
        wanted.insert(Route { dst: cidr, scope: RouteScope::Universe });
    }

    let live: HashSet<Route> = backend.list_routes(&cfg.iface_name).await?.into_iter().collect();

    for extra in live.difference(&wanted) {
        backend.del_route(&cfg.iface_name, extra.dst).await?;
    }
    for missing in wanted.difference(&live) {
        backend.add_route(&cfg.iface_name, missing.clone()).await?;
    }
    Ok(())
}
