//! Parses the agent's environment-variable configuration into an immutable
//! snapshot, built once at startup and passed explicitly rather than read
//! through scattered `env::var` calls.

use std::env::VarError;
use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{0} must be set")]
    Missing(&'static str),
    #[error("{0}={1:?} is not a valid integer")]
    InvalidInt(&'static str, String),
    #[error("{0}={1:?} is not a valid boolean")]
    InvalidBool(&'static str, String),
    #[error("{0}={1:?} is not one of ipv4, ipv6, dual")]
    InvalidTunnelFamily(&'static str, String),
    #[error("{0}={1:?} is not one of spec, file, none")]
    InvalidPodCidrSource(&'static str, String),
}

/// Which tunnel endpoint family the VPN reconciler prefers when a peer
/// advertises addresses of both families.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum TunnelFamily {
    Ipv4,
    Ipv6,
    Dual,
}

/// Where this node's own pod prefixes for one address family come from.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum PodCidrSource {
    /// The prefixes the orchestrator already assigned to this node's record.
    Spec,
    /// One prefix per line in `pod_cidr_source_path`.
    File,
    /// This node owns no pod prefixes of this family.
    None,
}

/// The agent's full configuration, parsed once at startup.
#[derive(Clone, Debug)]
pub struct Config {
    pub node_name: String,
    pub iface_name: String,
    pub wg_port: u16,
    pub privkey_path: PathBuf,
    pub wg_ip_family: TunnelFamily,
    pub cni_config_path: PathBuf,
    pub masquerade_v4: bool,
    pub masquerade_v6: bool,
    pub filter_v4: bool,
    pub filter_v6: bool,
    pub node_ip_interfaces: Vec<String>,
    pub firewall_only: bool,
    pub native_routing_v4: bool,
    pub native_routing_v6: bool,
    pub pod_cidr_source_v4: PodCidrSource,
    pub pod_cidr_source_v6: PodCidrSource,
    pub pod_cidr_source_path: Option<PathBuf>,
}

impl Config {
    /// Parses the recognised environment variables, applying the documented
    /// defaults for everything but `NODE_NAME`.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_source(&std::env::var)
    }

    /// Same as [`Config::from_env`] but reading through a caller-supplied
    /// lookup function, so tests don't have to mutate process environment.
    pub fn from_source(
        lookup: &dyn Fn(&str) -> Result<String, VarError>,
    ) -> Result<Self, ConfigError> {
        let required = |name: &'static str| -> Result<String, ConfigError> {
            lookup(name).map_err(|_| ConfigError::Missing(name))
        };
        let default = |name: &'static str, default: &str| -> String {
            lookup(name).unwrap_or_else(|_| default.to_string())
        };
        let parse_int = |name: &'static str, default: u16| -> Result<u16, ConfigError> {
            match lookup(name) {
                Err(_) => Ok(default),
                Ok(raw) => raw
                    .parse()
                    .map_err(|_| ConfigError::InvalidInt(name, raw)),
            }
        };
        let parse_bool = |name: &'static str, default: bool| -> Result<bool, ConfigError> {
            match lookup(name) {
                Err(_) => Ok(default),
                Ok(raw) => match raw.to_ascii_lowercase().as_str() {
                    "true" | "1" | "yes" => Ok(true),
                    "false" | "0" | "no" => Ok(false),
                    _ => Err(ConfigError::InvalidBool(name, raw)),
                },
            }
        };
        let parse_family = |name: &'static str,
                             default: TunnelFamily|
         -> Result<TunnelFamily, ConfigError> {
            match lookup(name) {
                Err(_) => Ok(default),
                Ok(raw) => match raw.as_str() {
                    "ipv4" => Ok(TunnelFamily::Ipv4),
                    "ipv6" => Ok(TunnelFamily::Ipv6),
                    "dual" => Ok(TunnelFamily::Dual),
                    _ => Err(ConfigError::InvalidTunnelFamily(name, raw)),
                },
            }
        };
        let parse_pod_cidr_source = |name: &'static str| -> Result<PodCidrSource, ConfigError> {
            match lookup(name).unwrap_or_else(|_| "spec".to_string()).as_str() {
                "spec" => Ok(PodCidrSource::Spec),
                "file" => Ok(PodCidrSource::File),
                "none" => Ok(PodCidrSource::None),
                other => Err(ConfigError::InvalidPodCidrSource(name, other.to_string())),
            }
        };

        let node_ip_interfaces = match lookup("NODE_IP_INTERFACES") {
            Err(_) => Vec::new(),
            Ok(raw) if raw.is_empty() => Vec::new(),
            Ok(raw) => raw.split(',').map(str::to_string).collect(),
        };

        Ok(Config {
            node_name: required("NODE_NAME")?,
            iface_name: default("WIGGLENET_IFACE_NAME", "wigglenet"),
            wg_port: parse_int("WIGGLENET_WG_PORT", 24601)?,
            privkey_path: PathBuf::from(default(
                "WIGGLENET_PRIVKEY_PATH",
                "/etc/wigglenet/private.key",
            )),
            wg_ip_family: parse_family("WG_IP_FAMILY", TunnelFamily::Dual)?,
            cni_config_path: PathBuf::from(default(
                "CNI_CONFIG_PATH",
                "/etc/cni/net.d/10-wigglenet.conflist",
            )),
            masquerade_v4: parse_bool("MASQUERADE_IPV4", true)?,
            masquerade_v6: parse_bool("MASQUERADE_IPV6", true)?,
            filter_v4: parse_bool("FILTER_IPV4", false)?,
            filter_v6: parse_bool("FILTER_IPV6", false)?,
            node_ip_interfaces,
            firewall_only: parse_bool("FIREWALL_ONLY", false)?,
            native_routing_v4: parse_bool("NATIVE_ROUTING_IPV4", false)?,
            native_routing_v6: parse_bool("NATIVE_ROUTING_IPV6", false)?,
            pod_cidr_source_v4: parse_pod_cidr_source("POD_CIDR_SOURCE_IPV4")?,
            pod_cidr_source_v6: parse_pod_cidr_source("POD_CIDR_SOURCE_IPV6")?,
            pod_cidr_source_path: lookup("POD_CIDR_SOURCE_PATH").ok().map(PathBuf::from),
        })
    }

    /// True when both families are native-routed: the VPN reconciler and
    /// the plugin descriptor are both skipped entirely.
    pub fn skip_vpn(&self) -> bool {
        self.firewall_only || (self.native_routing_v4 && self.native_routing_v6)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &HashMap<&str, &str>) -> impl Fn(&str) -> Result<String, VarError> + '_ {
        move |name| vars.get(name).map(|v| v.to_string()).ok_or(VarError::NotPresent)
    }

    #[test]
    fn requires_node_name() {
        let vars = HashMap::new();
        let err = Config::from_source(&lookup(&vars)).unwrap_err();
        assert!(matches!(err, ConfigError::Missing("NODE_NAME")));
    }

    #[test]
    fn applies_documented_defaults() {
        let mut vars = HashMap::new();
        vars.insert("NODE_NAME", "node-a");
        let cfg = Config::from_source(&lookup(&vars)).unwrap();
        assert_eq!(cfg.iface_name, "wigglenet");
        assert_eq!(cfg.wg_port, 24601);
        assert_eq!(cfg.privkey_path, PathBuf::from("/etc/wigglenet/private.key"));
        assert_eq!(cfg.wg_ip_family, TunnelFamily::Dual);
        assert!(cfg.masquerade_v4);
        assert!(cfg.masquerade_v6);
        assert!(!cfg.filter_v4);
        assert!(!cfg.filter_v6);
        assert!(!cfg.firewall_only);
        assert_eq!(cfg.pod_cidr_source_v4, PodCidrSource::Spec);
    }

    #[test]
    fn parses_overrides_and_rejects_garbage() {
        let mut vars = HashMap::new();
        vars.insert("NODE_NAME", "node-a");
        vars.insert("WIGGLENET_WG_PORT", "not-a-number");
        let err = Config::from_source(&lookup(&vars)).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidInt("WIGGLENET_WG_PORT", _)));
    }

    #[test]
    fn native_routing_both_families_skips_vpn() {
        let mut vars = HashMap::new();
        vars.insert("NODE_NAME", "node-a");
        vars.insert("NATIVE_ROUTING_IPV4", "true");
        vars.insert("NATIVE_ROUTING_IPV6", "true");
        let cfg = Config::from_source(&lookup(&vars)).unwrap();
        assert!(cfg.skip_vpn());
    }

    #[test]
    fn node_ip_interfaces_splits_on_comma() {
        let mut vars = HashMap::new();
        vars.insert("NODE_NAME", "node-a");
        vars.insert("NODE_IP_INTERFACES", "eth0,eth1");
        let cfg = Config::from_source(&lookup(&vars)).unwrap();
        assert_eq!(cfg.node_ip_interfaces, vec!["eth0", "eth1"]);
    }
}
