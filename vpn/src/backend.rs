//! The capability interface the reconciler drives: WireGuard device
//! configuration plus the handful of rtnetlink objects (link, addresses,
//! routes) a tunnel interface needs. Kept as one trait, since a production
//! implementation naturally shares one netlink/device handle across all of
//! it; tests get an in-memory fake instead.

use std::future::Future;
use std::hash::{Hash, Hasher};
use std::net::SocketAddr;

use net::Prefix;
use thiserror::Error;

use crate::changeset::{LivePeer, PeerChange};

#[derive(Debug, Error)]
pub enum VpnError {
    #[error("netlink request failed: {0}")]
    Netlink(String),
    #[error("wireguard device error: {0}")]
    Device(String),
}

/// A kernel route's scope, as rtnetlink reports it. The reconciler only
/// ever installs these two: a host route per local address and a
/// universe-scope route per peer prefix.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum RouteScope {
    Host,
    Universe,
}

/// A route on the tunnel device. Equality and hashing are keyed on `dst`
/// alone, matching how the reconciler diffs the live route table against
/// the desired one (by destination prefix, the same thing the Go original
/// compared via each route's stringified destination).
#[derive(Clone, Debug)]
pub struct Route {
    pub dst: Prefix,
    pub scope: RouteScope,
}

impl PartialEq for Route {
    fn eq(&self, other: &Self) -> bool {
        self.dst == other.dst
    }
}

impl Eq for Route {}

impl Hash for Route {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.dst.hash(state);
    }
}

pub trait VpnBackend: Send + Sync {
    /// Creates the tunnel link if absent. If a device already answers to
    /// this name, relies on `Device::get`'s own wireguard-specific netlink
    /// query to confirm it — that query only succeeds against a real
    /// WireGuard device, so anything else claiming the name surfaces here
    /// as a failure to create rather than a silent false positive.
    fn ensure_link(&self, iface: &str) -> impl Future<Output = Result<(), VpnError>> + Send;

    /// The device's own listening port and peer table, as the kernel
    /// currently has it configured.
    fn device_peers(&self, iface: &str) -> impl Future<Output = Result<Vec<LivePeer>, VpnError>> + Send;

    /// Applies a private key, listen port, and peer change-set to the
    /// device in one update.
    fn configure_device(
        &self,
        iface: &str,
        private_key: &[u8; 32],
        listen_port: u16,
        changes: Vec<PeerChange>,
    ) -> impl Future<Output = Result<(), VpnError>> + Send;

    fn list_addresses(&self, iface: &str) -> impl Future<Output = Result<Vec<Prefix>, VpnError>> + Send;
    fn add_address(&self, iface: &str, addr: Prefix) -> impl Future<Output = Result<(), VpnError>> + Send;
    fn del_address(&self, iface: &str, addr: Prefix) -> impl Future<Output = Result<(), VpnError>> + Send;

    fn list_routes(&self, iface: &str) -> impl Future<Output = Result<Vec<Route>, VpnError>> + Send;
    fn add_route(&self, iface: &str, route: Route) -> impl Future<Output = Result<(), VpnError>> + Send;
    fn del_route(&self, iface: &str, dst: Prefix) -> impl Future<Output = Result<(), VpnError>> + Send;
}

/// Production backend: `rtnetlink` for the link/address/route surface and
/// `wireguard-control` for the device itself.
pub struct KernelBackend {
    handle: rtnetlink::Handle,
}

impl KernelBackend {
    pub fn new(handle: rtnetlink::Handle) -> Self {
        Self { handle }
    }

    async fn link_index(&self, iface: &str) -> Result<Option<u32>, VpnError> {
        use futures::TryStreamExt;
        let mut links = self.handle.link().get().match_name(iface.to_string()).execute();
        match links.try_next().await {
            Ok(Some(msg)) => Ok(Some(msg.header.index)),
            Ok(None) => Ok(None),
            Err(rtnetlink::Error::NetlinkError(e)) if e.code.map(|c| c.get()) == Some(-19) => {
                // ENODEV: no such link.
                Ok(None)
            }
            Err(e) => Err(VpnError::Netlink(e.to_string())),
        }
    }
}

impl VpnBackend for KernelBackend {
    async fn ensure_link(&self, iface: &str) -> Result<(), VpnError> {
        use wireguard_control::{Backend, Device, InterfaceName};

        let name: InterfaceName = iface
            .parse()
            .map_err(|_| VpnError::Device(format!("{iface} is not a valid interface name")))?;

        match Device::get(&name, Backend::Kernel) {
            Ok(_) => Ok(()),
            Err(_) => {
                use rtnetlink::packet_route::link::InfoKind;
                use rtnetlink::{LinkMessageBuilder, LinkUnspec};

                let message = LinkMessageBuilder::<LinkUnspec>::new_with_info_kind(InfoKind::Other(
                    "wireguard".to_string(),
                ))
                .name(iface.to_string())
                .build();

                self.handle
                    .link()
                    .add(message)
                    .execute()
                    .await
                    .map_err(|e| VpnError::Netlink(e.to_string()))?;
                if let Some(index) = self.link_index(iface).await? {
                    self.handle
                        .link()
                        .set(index)
                        .up()
                        .execute()
                        .await
                        .map_err(|e| VpnError::Netlink(e.to_string()))?;
                }
                Ok(())
            }
        }
    }

    async fn device_peers(&self, iface: &str) -> Result<Vec<LivePeer>, VpnError> {
        use wireguard_control::{Backend, Device, InterfaceName};

        let name: InterfaceName = iface
            .parse()
            .map_err(|_| VpnError::Device(format!("{iface} is not a valid interface name")))?;
        let device = Device::get(&name, Backend::Kernel).map_err(|e| VpnError::Device(e.to_string()))?;

        Ok(device
            .peers
            .into_iter()
            .map(|info| LivePeer {
                public_key: *info.config.public_key.as_bytes(),
                endpoint: info.config.endpoint,
                allowed_ips: info
                    .config
                    .allowed_ips
                    .iter()
                    .filter_map(|ip| Prefix::new(ip.address, ip.cidr).ok())
                    .collect(),
            })
            .collect())
    }

    async fn configure_device(
        &self,
        iface: &str,
        private_key: &[u8; 32],
        listen_port: u16,
        changes: Vec<PeerChange>,
    ) -> Result<(), VpnError> {
        use wireguard_control::{Backend, DeviceUpdate, InterfaceName, Key, PeerConfigBuilder};

        let name: InterfaceName = iface
            .parse()
            .map_err(|_| VpnError::Device(format!("{iface} is not a valid interface name")))?;

        let mut peer_updates = Vec::with_capacity(changes.len());
        for change in changes {
            let key = Key::from_raw(change.public_key);
            let mut builder = PeerConfigBuilder::new(&key);
            if change.remove {
                builder = builder.remove();
            } else {
                builder = builder.replace_allowed_ips();
                for cidr in &change.allowed_ips {
                    builder = builder.add_allowed_ip(cidr.address(), cidr.len());
                }
                if let Some(endpoint) = change.endpoint {
                    builder = builder.set_endpoint(endpoint);
                }
            }
            peer_updates.push(builder);
        }

        DeviceUpdate::new()
            .set_private_key(Key::from_raw(*private_key))
            .set_listen_port(listen_port)
            .add_peers(&peer_updates)
            .apply(&name, Backend::Kernel)
            .map_err(|e| VpnError::Device(e.to_string()))
    }

    async fn list_addresses(&self, iface: &str) -> Result<Vec<Prefix>, VpnError> {
        use futures::TryStreamExt;
        let Some(index) = self.link_index(iface).await? else {
            return Ok(Vec::new());
        };
        let mut addrs = self.handle.address().get().set_link_index_filter(index).execute();
        let mut out = Vec::new();
        while let Some(msg) = addrs.try_next().await.map_err(|e| VpnError::Netlink(e.to_string()))? {
            if let Some(prefix) = address_message_to_prefix(&msg) {
                out.push(prefix);
            }
        }
        Ok(out)
    }

    async fn add_address(&self, iface: &str, addr: Prefix) -> Result<(), VpnError> {
        let Some(index) = self.link_index(iface).await? else {
            return Err(VpnError::Netlink(format!("{iface} has no link")));
        };
        self.handle
            .address()
            .add(index, addr.address(), addr.len())
            .execute()
            .await
            .map_err(|e| VpnError::Netlink(e.to_string()))
    }

    async fn del_address(&self, iface: &str, addr: Prefix) -> Result<(), VpnError> {
        use futures::TryStreamExt;
        let Some(index) = self.link_index(iface).await? else {
            return Ok(());
        };
        let mut addrs = self.handle.address().get().set_link_index_filter(index).execute();
        while let Some(msg) = addrs.try_next().await.map_err(|e| VpnError::Netlink(e.to_string()))? {
            if address_message_to_prefix(&msg) == Some(addr) {
                self.handle
                    .address()
                    .del(msg)
                    .execute()
                    .await
                    .map_err(|e| VpnError::Netlink(e.to_string()))?;
                return Ok(());
            }
        }
        Ok(())
    }

    async fn list_routes(&self, iface: &str) -> Result<Vec<Route>, VpnError> {
        use futures::TryStreamExt;
        let Some(index) = self.link_index(iface).await? else {
            return Ok(Vec::new());
        };

        let mut out = Vec::new();
        for version in [rtnetlink::IpVersion::V4, rtnetlink::IpVersion::V6] {
            let mut routes = self.handle.route().get(version).execute();
            while let Some(msg) =
                routes.try_next().await.map_err(|e| VpnError::Netlink(e.to_string()))?
            {
                if route_output_interface(&msg) != Some(index) {
                    continue;
                }
                if let Some(route) = route_message_to_route(&msg) {
                    out.push(route);
                }
            }
        }
        Ok(out)
    }

    async fn add_route(&self, iface: &str, route: Route) -> Result<(), VpnError> {
        let Some(index) = self.link_index(iface).await? else {
            return Err(VpnError::Netlink(format!("{iface} has no link")));
        };
        let scope = match route.scope {
            RouteScope::Host => rtnetlink::packet_route::route::RouteScope::Host,
            RouteScope::Universe => rtnetlink::packet_route::route::RouteScope::Universe,
        };
        match route.dst.address() {
            std::net::IpAddr::V4(addr) => self
                .handle
                .route()
                .add()
                .v4()
                .destination_prefix(addr, route.dst.len())
                .output_interface(index)
                .scope(scope)
                .execute()
                .await
                .map_err(|e| VpnError::Netlink(e.to_string())),
            std::net::IpAddr::V6(addr) => self
                .handle
                .route()
                .add()
                .v6()
                .destination_prefix(addr, route.dst.len())
                .output_interface(index)
                .scope(scope)
                .execute()
                .await
                .map_err(|e| VpnError::Netlink(e.to_string())),
        }
    }

    async fn del_route(&self, iface: &str, dst: Prefix) -> Result<(), VpnError> {
        use futures::TryStreamExt;
        let Some(index) = self.link_index(iface).await? else {
            return Ok(());
        };

        let version = if dst.is_ipv6() { rtnetlink::IpVersion::V6 } else { rtnetlink::IpVersion::V4 };
        let mut routes = self.handle.route().get(version).execute();
        while let Some(msg) = routes.try_next().await.map_err(|e| VpnError::Netlink(e.to_string()))? {
            if route_output_interface(&msg) != Some(index) {
                continue;
            }
            if route_message_to_route(&msg).map(|r| r.dst) == Some(dst) {
                self.handle.route().del(msg).execute().await.map_err(|e| VpnError::Netlink(e.to_string()))?;
                return Ok(());
            }
        }
        Ok(())
    }
}

fn route_message_to_route(msg: &rtnetlink::packet_route::route::RouteMessage) -> Option<Route> {
    use rtnetlink::packet_route::route::RouteAttribute;

    let dst = msg.attributes.iter().find_map(|attr| match attr {
        RouteAttribute::Destination(addr) => Some(route_address_to_ip(addr)),
        _ => None,
    })?;
    let prefix = Prefix::new(dst, msg.header.destination_prefix_length).ok()?;
    let scope = if msg.header.scope == rtnetlink::packet_route::route::RouteScope::Host {
        RouteScope::Host
    } else {
        RouteScope::Universe
    };
    Some(Route { dst: prefix, scope })
}

fn route_output_interface(msg: &rtnetlink::packet_route::route::RouteMessage) -> Option<u32> {
    use rtnetlink::packet_route::route::RouteAttribute;
    msg.attributes.iter().find_map(|attr| match attr {
        RouteAttribute::Oif(index) => Some(*index),
        _ => None,
    })
}

fn route_address_to_ip(addr: &rtnetlink::packet_route::route::RouteAddress) -> std::net::IpAddr {
    use rtnetlink::packet_route::route::RouteAddress;
    match addr {
        RouteAddress::Inet(a) => std::net::IpAddr::V4(*a),
        RouteAddress::Inet6(a) => std::net::IpAddr::V6(*a),
        _ => std::net::IpAddr::V4(std::net::Ipv4Addr::UNSPECIFIED),
    }
}

fn address_message_to_prefix(
    msg: &rtnetlink::packet_route::address::AddressMessage,
) -> Option<Prefix> {
    use rtnetlink::packet_route::address::AddressAttribute;
    let addr = msg.attributes.iter().find_map(|attr| match attr {
        AddressAttribute::Address(a) => Some(*a),
        _ => None,
    })?;
    Prefix::new(addr, msg.header.prefix_len).ok()
}
