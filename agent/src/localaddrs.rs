//! Collects this node's own external addresses from the configured set of
//! host interfaces, for publication in the `node-ips` annotation.

use std::net::IpAddr;

fn is_global_unicast(addr: &IpAddr) -> bool {
    match addr {
        IpAddr::V4(v4) => {
            !v4.is_loopback()
                && !v4.is_link_local()
                && !v4.is_multicast()
                && !v4.is_unspecified()
                && !v4.is_broadcast()
        }
        IpAddr::V6(v6) => {
            !v6.is_loopback()
                && !v6.is_multicast()
                && !v6.is_unspecified()
                && !v6.is_unicast_link_local()
        }
    }
}

/// Returns the global-unicast addresses bound to any of `interfaces` (by
/// name). An interface named but not present on the host is skipped with a
/// warning rather than failing the whole collection.
pub fn local_addresses(interfaces: &[String]) -> Vec<IpAddr> {
    if interfaces.is_empty() {
        return Vec::new();
    }

    let kernel_interfaces = netdev::get_interfaces();
    interfaces
        .iter()
        .filter_map(|name| {
            let found = kernel_interfaces.iter().find(|i| &i.name == name);
            if found.is_none() {
                tracing::warn!(interface = name, "configured host interface not found, skipping");
            }
            found
        })
        .flat_map(|iface| {
            let v4 = iface.ipv4.iter().map(|net| IpAddr::V4(net.addr));
            let v6 = iface.ipv6.iter().map(|net| IpAddr::V6(net.addr));
            v4.chain(v6)
        })
        .filter(is_global_unicast)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_loopback_link_local_and_multicast() {
        assert!(!is_global_unicast(&"127.0.0.1".parse().unwrap()));
        assert!(!is_global_unicast(&"169.254.1.1".parse().unwrap()));
        assert!(!is_global_unicast(&"224.0.0.1".parse().unwrap()));
        assert!(!is_global_unicast(&"::1".parse().unwrap()));
        assert!(!is_global_unicast(&"fe80::1".parse().unwrap()));
        assert!(is_global_unicast(&"10.0.0.5".parse().unwrap()));
        assert!(is_global_unicast(&"2001:db8::1".parse().unwrap()));
    }

    #[test]
    fn unconfigured_interfaces_yield_no_addresses() {
        assert!(local_addresses(&[]).is_empty());
        assert!(local_addresses(&["definitely-not-a-real-iface-xyz".to_string()]).is_empty());
    }
}
