//! Diffs the desired peer set against the peers a live WireGuard device
//! actually reports, producing the minimal set of add/update/remove entries.

use std::collections::HashMap;
use std::net::SocketAddr;

use net::Prefix;
use peer::Peer;

/// A peer exactly as the kernel device currently reports it.
#[derive(Clone, Debug)]
pub struct LivePeer {
    pub public_key: [u8; 32],
    pub endpoint: Option<SocketAddr>,
    pub allowed_ips: Vec<Prefix>,
}

/// One entry in a change-set: either drop a peer the device no longer
/// needs, or push an add/update with the full desired allowed-IP list.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PeerChange {
    pub public_key: [u8; 32],
    pub remove: bool,
    /// Set when this is an update to a peer that already exists on the
    /// device (as opposed to a brand new peer being added).
    pub update_only: bool,
    pub endpoint: Option<SocketAddr>,
    pub allowed_ips: Vec<Prefix>,
}

/// True if a live peer's configuration has drifted from what it should be:
/// a different allowed-IP list (order matters: pod prefixes then node
/// prefixes, the order [`Peer::allowed_ips`] produces), a missing endpoint,
/// or an endpoint whose address or port no longer matches.
fn needs_update(live: &LivePeer, desired_endpoint: SocketAddr, desired_allowed_ips: &[Prefix]) -> bool {
    live.allowed_ips != desired_allowed_ips || live.endpoint != Some(desired_endpoint)
}

/// Computes the change-set that takes a device's live peers to the desired
/// set. Peers present live but absent from `desired` are queued for
/// removal; peers absent live are queued as adds; peers present in both
/// whose configuration has drifted are queued as updates. Peers that are
/// already correct are dropped from the output entirely.
pub fn compute_changes(live: &[LivePeer], desired: &[Peer], listen_port: u16) -> Vec<PeerChange> {
    let mut working: HashMap<[u8; 32], PeerChange> = live
        .iter()
        .map(|p| {
            (
                p.public_key,
                PeerChange {
                    public_key: p.public_key,
                    remove: true,
                    update_only: false,
                    endpoint: p.endpoint,
                    allowed_ips: p.allowed_ips.clone(),
                },
            )
        })
        .collect();

    let live_by_key: HashMap<[u8; 32], &LivePeer> =
        live.iter().map(|p| (p.public_key, p)).collect();

    for d in desired {
        let desired_endpoint = SocketAddr::new(d.endpoint, listen_port);
        let desired_allowed_ips = d.allowed_ips();

        match live_by_key.get(&d.public_key) {
            None => {
                working.insert(
                    d.public_key,
                    PeerChange {
                        public_key: d.public_key,
                        remove: false,
                        update_only: false,
                        endpoint: Some(desired_endpoint),
                        allowed_ips: desired_allowed_ips,
                    },
                );
            }
            Some(live_peer) => {
                if needs_update(live_peer, desired_endpoint, &desired_allowed_ips) {
                    working.insert(
                        d.public_key,
                        PeerChange {
                            public_key: d.public_key,
                            remove: false,
                            update_only: true,
                            endpoint: Some(desired_endpoint),
                            allowed_ips: desired_allowed_ips,
                        },
                    );
                } else {
                    working.remove(&d.public_key);
                }
            }
        }
    }

    let mut changes: Vec<PeerChange> = working.into_values().collect();
    changes.sort_by_key(|c| c.public_key);
    changes
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(byte: u8) -> [u8; 32] {
        let mut k = [0u8; 32];
        k[0] = byte;
        k
    }

    fn prefixes(strs: &[&str]) -> Vec<Prefix> {
        strs.iter().map(|s| s.parse().unwrap()).collect()
    }

    #[test]
    fn no_op_when_live_already_matches_desired() {
        let k = key(1);
        let live = vec![LivePeer {
            public_key: k,
            endpoint: Some("192.168.0.1:24601".parse().unwrap()),
            allowed_ips: prefixes(&["192.168.0.0/24", "2001:db8:0:1::/64"]),
        }];
        let desired = vec![Peer {
            public_key: k,
            endpoint: "192.168.0.1".parse().unwrap(),
            pod_cidrs: prefixes(&["192.168.0.0/24", "2001:db8:0:1::/64"]),
            node_cidrs: vec![],
        }];

        let changes = compute_changes(&live, &desired, 24601);
        assert!(changes.is_empty());
    }

    #[test]
    fn additional_node_cidr_produces_a_single_update_entry() {
        let k = key(1);
        let live = vec![LivePeer {
            public_key: k,
            endpoint: Some("192.168.0.1:24601".parse().unwrap()),
            allowed_ips: prefixes(&["192.168.0.0/24", "2001:db8:0:1::/64"]),
        }];
        let desired = vec![Peer {
            public_key: k,
            endpoint: "192.168.0.1".parse().unwrap(),
            pod_cidrs: prefixes(&["192.168.0.0/24", "2001:db8:0:1::/64"]),
            node_cidrs: prefixes(&["2001:db8:1::1/128"]),
        }];

        let changes = compute_changes(&live, &desired, 24601);
        assert_eq!(
            changes,
            vec![PeerChange {
                public_key: k,
                remove: false,
                update_only: true,
                endpoint: Some("192.168.0.1:24601".parse().unwrap()),
                allowed_ips: prefixes(&[
                    "192.168.0.0/24",
                    "2001:db8:0:1::/64",
                    "2001:db8:1::1/128"
                ]),
            }]
        );
    }

    #[test]
    fn peer_missing_from_desired_is_removed() {
        let k = key(1);
        let live = vec![LivePeer {
            public_key: k,
            endpoint: Some("192.168.0.1:24601".parse().unwrap()),
            allowed_ips: prefixes(&["192.168.0.0/24"]),
        }];

        let changes = compute_changes(&live, &[], 24601);
        assert_eq!(changes.len(), 1);
        assert!(changes[0].remove);
    }

    #[test]
    fn peer_absent_live_is_added() {
        let k = key(1);
        let desired = vec![Peer {
            public_key: k,
            endpoint: "192.168.0.1".parse().unwrap(),
            pod_cidrs: prefixes(&["192.168.0.0/24"]),
            node_cidrs: vec![],
        }];

        let changes = compute_changes(&[], &desired, 24601);
        assert_eq!(changes.len(), 1);
        assert!(!changes[0].remove);
        assert!(!changes[0].update_only);
        assert_eq!(changes[0].endpoint, Some("192.168.0.1:24601".parse().unwrap()));
    }

    #[test]
    fn port_mismatch_alone_triggers_an_update() {
        let k = key(1);
        let live = vec![LivePeer {
            public_key: k,
            endpoint: Some("192.168.0.1:9999".parse().unwrap()),
            allowed_ips: prefixes(&["192.168.0.0/24"]),
        }];
        let desired = vec![Peer {
            public_key: k,
            endpoint: "192.168.0.1".parse().unwrap(),
            pod_cidrs: prefixes(&["192.168.0.0/24"]),
            node_cidrs: vec![],
        }];

        let changes = compute_changes(&live, &desired, 24601);
        assert_eq!(changes.len(), 1);
        assert!(changes[0].update_only);
    }
}
