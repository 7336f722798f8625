//! Pure projection from the node cache to the three desired states the
//! controller hands to its reconcilers: the packet-filter config, the VPN
//! config, and (when not firewall-only) the plugin descriptor.

use std::net::IpAddr;

use config::Config;
use firewall::FirewallConfig;
use net::Prefix;
use peer::{make_peer, NodeRecord};
use vpn::VpnConfig;

/// Everything the controller derives from one pass over the live node
/// cache. `self_node` is this node's own record, used to read back its own
/// `pod-cidrs` (to derive the tunnel device's local addresses) and to
/// include those same prefixes in the plugin descriptor.
pub struct DesiredState {
    pub firewall: FirewallConfig,
    pub vpn: VpnConfig,
    pub pod_cidrs: Vec<Prefix>,
}

fn pod_cidrs_of(node: &NodeRecord) -> Vec<Prefix> {
    node.annotations
        .get(annotation::POD_CIDRS)
        .and_then(|raw| annotation::decode_pod_cidrs(raw).ok())
        .unwrap_or_default()
}

pub fn compute(nodes: &[NodeRecord], self_node: &NodeRecord, cfg: &Config) -> DesiredState {
    let peers: Vec<peer::Peer> = nodes
        .iter()
        .filter_map(|n| make_peer(n, &cfg.node_name, cfg.wg_ip_family))
        .collect();

    let self_pod_cidrs = pod_cidrs_of(self_node);

    let all_pod_cidrs: Vec<Prefix> = self_pod_cidrs
        .iter()
        .copied()
        .chain(
            nodes
                .iter()
                .filter(|n| n.name != cfg.node_name)
                .flat_map(pod_cidrs_of),
        )
        .collect();
    let pod_cidrs = net::summarise(&all_pod_cidrs);

    // "Host index 1": the address the IPAM plugin assigns to the node end
    // of every pod veth on this node's own prefixes.
    let local_addresses: Vec<IpAddr> =
        self_pod_cidrs.iter().map(peer::pod_network_local_address).collect();

    let vpn = VpnConfig { local_addresses, peers }.canonicalize();
    let firewall = FirewallConfig { pod_cidrs: pod_cidrs.clone() };

    DesiredState { firewall, vpn, pod_cidrs }
}
