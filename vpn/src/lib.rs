//! VPN reconciler: programs a WireGuard tunnel device's peers, and the
//! kernel addresses/routes layered on top of it, from a desired
//! [`VpnConfig`] snapshot.

mod backend;
mod changeset;
mod reconcile;

pub use backend::{KernelBackend, Route, RouteScope, VpnBackend, VpnError};
pub use changeset::{compute_changes, LivePeer, PeerChange};
pub use reconcile::apply;

use std::net::IpAddr;

use peer::Peer;

/// Desired VPN state for this node: the tunnel's own addresses plus every
/// peer it should have a session with. Two configs with the same addresses
/// and peers (irrespective of order) are equal, since canonicalising a
/// freshly-built one is always done through [`VpnConfig::canonicalize`]
/// before comparison.
#[derive(Clone, PartialEq, Eq, Debug, Default)]
pub struct VpnConfig {
    pub local_addresses: Vec<IpAddr>,
    pub peers: Vec<Peer>,
}

impl VpnConfig {
    /// Sorts `local_addresses` by octets and `peers` by public key, so that
    /// two configs built from the same underlying set compare equal
    /// regardless of node-cache iteration order.
    pub fn canonicalize(mut self) -> Self {
        self.local_addresses.sort_by_key(ip_sort_key);
        self.peers.sort_by_key(|p| p.public_key);
        self
    }
}

fn ip_sort_key(addr: &IpAddr) -> Vec<u8> {
    match addr {
        IpAddr::V4(a) => a.octets().to_vec(),
        IpAddr::V6(a) => a.octets().to_vec(),
    }
}
