//! Projects a node record into a VPN peer descriptor.

use std::collections::BTreeMap;
use std::net::{IpAddr, Ipv4Addr};

use config::TunnelFamily;
use net::Prefix;

fn accepts(family: TunnelFamily, addr: &IpAddr) -> bool {
    match family {
        TunnelFamily::Ipv4 => addr.is_ipv4(),
        TunnelFamily::Ipv6 => addr.is_ipv6(),
        TunnelFamily::Dual => true,
    }
}

/// A node's identity plus its recognised annotations, as read from the
/// cluster's node registry. The controller builds these from the live node
/// cache; this crate never talks to the registry itself.
#[derive(Clone, Debug, Default)]
pub struct NodeRecord {
    pub name: String,
    pub annotations: BTreeMap<String, String>,
}

impl NodeRecord {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into(), annotations: BTreeMap::new() }
    }

    pub fn with_annotation(mut self, key: &str, value: impl Into<String>) -> Self {
        self.annotations.insert(key.to_string(), value.into());
        self
    }

    fn annotation(&self, key: &str) -> Option<&str> {
        self.annotations.get(key).map(String::as_str)
    }
}

/// The projection of one non-self `NodeRecord`.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct Peer {
    pub public_key: [u8; 32],
    pub endpoint: IpAddr,
    pub node_cidrs: Vec<Prefix>,
    pub pod_cidrs: Vec<Prefix>,
}

impl Peer {
    /// All allowed-IPs this peer should be granted: pod prefixes followed by
    /// node prefixes, in that order (the order the VPN reconciler's
    /// change-set algorithm keys its comparisons on).
    pub fn allowed_ips(&self) -> Vec<Prefix> {
        let mut v = Vec::with_capacity(self.pod_cidrs.len() + self.node_cidrs.len());
        v.extend_from_slice(&self.pod_cidrs);
        v.extend_from_slice(&self.node_cidrs);
        v
    }
}

/// Folds an IPv4-mapped IPv6 address (`::ffff:a.b.c.d`) down to its IPv4
/// form; any other address is returned unchanged.
fn canonicalize(addr: IpAddr) -> IpAddr {
    match addr {
        IpAddr::V6(v6) => match v6.to_ipv4_mapped() {
            Some(v4) => IpAddr::V4(v4),
            None => IpAddr::V6(v6),
        },
        v4 => v4,
    }
}

fn single_host(addr: IpAddr) -> Prefix {
    Prefix::host(canonicalize(addr))
}

/// Projects `node` into a `Peer`, or `None` if it is not (yet) usable.
///
/// `self_name` identifies this agent's own node; callers are expected to
/// skip the self record before calling this (kept here only so callers
/// don't have to duplicate the early-return).
pub fn make_peer(node: &NodeRecord, self_name: &str, family: TunnelFamily) -> Option<Peer> {
    if node.name == self_name {
        return None;
    }

    let public_key = match node.annotation(annotation::PUBLIC_KEY) {
        None => return None,
        Some(raw) => match annotation::decode_public_key(raw) {
            Ok(bytes) => match <[u8; 32]>::try_from(bytes) {
                Ok(arr) => arr,
                Err(bytes) => {
                    tracing::warn!(
                        node = node.name,
                        len = bytes.len(),
                        "public key has the wrong length, ignoring peer"
                    );
                    return None;
                }
            },
            Err(err) => {
                tracing::warn!(node = node.name, %err, "malformed public key annotation, ignoring peer");
                return None;
            }
        },
    };

    let node_ips = match node.annotation(annotation::NODE_IPS) {
        None => {
            tracing::warn!(node = node.name, "missing node-ips annotation, ignoring peer");
            return None;
        }
        Some(raw) => match annotation::decode_node_ips(raw) {
            Ok(ips) if !ips.is_empty() => ips,
            Ok(_) => {
                tracing::warn!(node = node.name, "empty node-ips annotation, ignoring peer");
                return None;
            }
            Err(err) => {
                tracing::warn!(node = node.name, %err, "malformed node-ips annotation, ignoring peer");
                return None;
            }
        },
    };

    let pod_cidrs = match node.annotation(annotation::POD_CIDRS) {
        None => {
            tracing::warn!(node = node.name, "missing pod-cidrs annotation, ignoring peer");
            return None;
        }
        Some(raw) => match annotation::decode_pod_cidrs(raw) {
            Ok(cidrs) if !cidrs.is_empty() => cidrs,
            Ok(_) => {
                tracing::warn!(node = node.name, "empty pod-cidrs annotation, ignoring peer");
                return None;
            }
            Err(err) => {
                tracing::warn!(node = node.name, %err, "malformed pod-cidrs annotation, ignoring peer");
                return None;
            }
        },
    };

    let endpoint = *node_ips.iter().find(|ip| accepts(family, ip))?;
    let mut node_cidrs: Vec<Prefix> = node_ips.into_iter().map(single_host).collect();
    // Canonical order throughout this codebase is IPv6 before IPv4, by
    // address within a family — the same convention `net::summarise` uses.
    node_cidrs.sort_by_key(|p| (!p.is_ipv6(), p.address()));

    Some(Peer { public_key, endpoint, node_cidrs, pod_cidrs })
}

/// `SingleHostCIDR`-equivalent used by the controller to build this node's
/// own local addresses; exposed here since it shares `canonicalize`.
pub fn host_prefix(addr: IpAddr) -> Prefix {
    single_host(addr)
}

/// The address the host-local IPAM plugin assigns to the node end of every
/// pod veth: the pod prefix's network address with the low bit of the last
/// octet set.
pub fn pod_network_local_address(pod_cidr: &Prefix) -> IpAddr {
    match pod_cidr.address() {
        IpAddr::V4(a) => {
            let mut octets = a.octets();
            let last = octets.len() - 1;
            octets[last] |= 1;
            IpAddr::V4(Ipv4Addr::from(octets))
        }
        IpAddr::V6(a) => {
            let mut octets = a.octets();
            let last = octets.len() - 1;
            octets[last] |= 1;
            IpAddr::V6(octets.into())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node_with(public_key: &str, node_ips: &str, pod_cidrs: &str) -> NodeRecord {
        NodeRecord::new("peer-1")
            .with_annotation(annotation::PUBLIC_KEY, public_key)
            .with_annotation(annotation::NODE_IPS, node_ips)
            .with_annotation(annotation::POD_CIDRS, pod_cidrs)
    }

    #[test]
    fn happy_path_projection() {
        let node = node_with(
            "AAECAwQFBgcICQoLDA0ODxAREhMUFRYXGBkaGxwdHh8=",
            r#"["192.168.0.1","2001:db8::1234"]"#,
            r#"["2001:db8::/64","10.0.0.0/24"]"#,
        );

        let peer = make_peer(&node, "self", TunnelFamily::Dual).unwrap();
        assert_eq!(peer.endpoint, "2001:db8::1234".parse::<IpAddr>().unwrap());
        assert_eq!(
            peer.node_cidrs,
            vec!["2001:db8::1234/128".parse().unwrap(), "192.168.0.1/32".parse().unwrap()]
        );
        assert_eq!(
            peer.pod_cidrs,
            vec!["2001:db8::/64".parse().unwrap(), "10.0.0.0/24".parse().unwrap()]
        );
        assert_eq!(peer.public_key.to_vec(), (0u8..32).collect::<Vec<_>>());
    }

    #[test]
    fn bad_key_length_yields_no_peer() {
        let node = node_with(
            "AAECAwQFBgcICQoLwdHh8=",
            r#"["192.168.0.1"]"#,
            r#"["10.0.0.0/24"]"#,
        );
        assert!(make_peer(&node, "self", TunnelFamily::Dual).is_none());
    }

    #[test]
    fn missing_public_key_is_silently_absent() {
        let node = NodeRecord::new("peer-1")
            .with_annotation(annotation::NODE_IPS, r#"["192.168.0.1"]"#)
            .with_annotation(annotation::POD_CIDRS, r#"["10.0.0.0/24"]"#);
        assert!(make_peer(&node, "self", TunnelFamily::Dual).is_none());
    }

    #[test]
    fn self_record_is_never_a_peer() {
        let node = node_with(
            "AAECAwQFBgcICQoLDA0ODxAREhMUFRYXGBkaGxwdHh8=",
            r#"["192.168.0.1"]"#,
            r#"["10.0.0.0/24"]"#,
        );
        let node = NodeRecord { name: "self".to_string(), ..node };
        assert!(make_peer(&node, "self", TunnelFamily::Dual).is_none());
    }

    #[test]
    fn endpoint_family_selection() {
        let node = node_with(
            "AAECAwQFBgcICQoLDA0ODxAREhMUFRYXGBkaGxwdHh8=",
            r#"["192.168.0.1","2001:db8::1234"]"#,
            r#"["10.0.0.0/24"]"#,
        );
        let peer = make_peer(&node, "self", TunnelFamily::Ipv6).unwrap();
        assert_eq!(peer.endpoint, "2001:db8::1234".parse::<IpAddr>().unwrap());

        let peer = make_peer(&node, "self", TunnelFamily::Ipv4).unwrap();
        assert_eq!(peer.endpoint, "192.168.0.1".parse::<IpAddr>().unwrap());
    }

    #[test]
    fn ipv4_mapped_ipv6_node_ip_canonicalizes_in_node_cidrs() {
        let node = node_with(
            "AAECAwQFBgcICQoLDA0ODxAREhMUFRYXGBkaGxwdHh8=",
            r#"["::ffff:10.0.0.1"]"#,
            r#"["10.0.0.0/24"]"#,
        );
        let peer = make_peer(&node, "self", TunnelFamily::Dual).unwrap();
        assert_eq!(peer.node_cidrs, vec!["10.0.0.1/32".parse().unwrap()]);
    }

    #[test]
    fn pod_network_local_address_sets_host_index_one() {
        let cidr: Prefix = "10.1.2.0/24".parse().unwrap();
        assert_eq!(pod_network_local_address(&cidr), "10.1.2.1".parse::<IpAddr>().unwrap());
    }
}
