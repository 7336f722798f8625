//! Writes the CNI plugin descriptor consumed by the container runtime: a
//! `ptp` network chained with `host-local` IPAM (ranges and default routes
//! derived from this node's pod prefixes) and `portmap`.

use std::fs::File;
use std::io::Write as _;
use std::path::{Path, PathBuf};

use net::Prefix;
use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CniError {
    #[error("failed to write {path}: {source}")]
    Io { path: PathBuf, #[source] source: std::io::Error },
}

/// The pod prefixes this node owns; the only input the descriptor depends on.
#[derive(Clone, PartialEq, Eq, Debug, Default)]
pub struct CniConfig {
    pub pod_cidrs: Vec<Prefix>,
}

#[derive(Serialize)]
struct NetConfList {
    #[serde(rename = "cniVersion")]
    cni_version: &'static str,
    name: &'static str,
    plugins: Vec<PluginConf>,
}

#[derive(Serialize)]
#[serde(untagged)]
enum PluginConf {
    Ptp(PtpNetConf),
    Portmap(PortMapNetConf),
}

#[derive(Serialize)]
struct PtpNetConf {
    #[serde(rename = "type")]
    kind: &'static str,
    ipam: IpamConfig,
}

#[derive(Serialize)]
struct PortMapNetConf {
    #[serde(rename = "type")]
    kind: &'static str,
    capabilities: std::collections::BTreeMap<&'static str, bool>,
}

#[derive(Serialize)]
struct IpamConfig {
    #[serde(rename = "type")]
    kind: &'static str,
    #[serde(rename = "dataDir")]
    data_dir: &'static str,
    routes: Vec<RouteConf>,
    ranges: Vec<Vec<RangeConf>>,
}

#[derive(Serialize)]
struct RouteConf {
    dst: &'static str,
}

#[derive(Serialize)]
struct RangeConf {
    subnet: String,
}

fn build_descriptor(cfg: &CniConfig) -> NetConfList {
    let mut routes = Vec::with_capacity(2);
    // Canonical order throughout this codebase is IPv6 before IPv4.
    if cfg.pod_cidrs.iter().any(Prefix::is_ipv6) {
        routes.push(RouteConf { dst: "::/0" });
    }
    if cfg.pod_cidrs.iter().any(|p| !p.is_ipv6()) {
        routes.push(RouteConf { dst: "0.0.0.0/0" });
    }

    let ranges = cfg
        .pod_cidrs
        .iter()
        .map(|cidr| vec![RangeConf { subnet: cidr.to_string() }])
        .collect();

    let mut capabilities = std::collections::BTreeMap::new();
    capabilities.insert("portMappings", true);

    NetConfList {
        cni_version: "0.3.1",
        name: "wigglenet",
        plugins: vec![
            PluginConf::Ptp(PtpNetConf {
                kind: "ptp",
                ipam: IpamConfig {
                    kind: "host-local",
                    data_dir: "/run/cni-ipam-state",
                    routes,
                    ranges,
                },
            }),
            PluginConf::Portmap(PortMapNetConf { kind: "portmap", capabilities }),
        ],
    }
}

/// Writes the descriptor to `path`, skipping the write entirely when the
/// last-written config is unchanged (the idempotence property this plugin
/// descriptor is expected to have: the file's mtime shouldn't churn on
/// every no-op reconciliation).
pub struct CniConfigWriter {
    path: PathBuf,
    last_written: Option<CniConfig>,
}

impl CniConfigWriter {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into(), last_written: None }
    }

    pub fn write(&mut self, cfg: CniConfig) -> Result<(), CniError> {
        if self.last_written.as_ref() == Some(&cfg) {
            return Ok(());
        }

        tracing::info!(pod_cidrs = cfg.pod_cidrs.len(), "applying new CNI configuration");
        let descriptor = build_descriptor(&cfg);
        let body = serde_json::to_vec_pretty(&descriptor)
            .expect("descriptor serialization is infallible");

        write_atomically(&self.path, &body)?;
        self.last_written = Some(cfg);
        Ok(())
    }
}

fn write_atomically(path: &Path, body: &[u8]) -> Result<(), CniError> {
    let tmp_path = path.with_extension("temp");
    let write_result = (|| -> std::io::Result<()> {
        let mut f = File::create(&tmp_path)?;
        f.write_all(body)?;
        f.sync_all()?;
        drop(f);
        std::fs::rename(&tmp_path, path)?;
        Ok(())
    })();

    write_result.map_err(|source| {
        let _ = std::fs::remove_file(&tmp_path);
        CniError::Io { path: path.to_path_buf(), source }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn descriptor_includes_a_default_route_per_family_present() {
        let cfg = CniConfig {
            pod_cidrs: vec!["10.0.0.0/24".parse().unwrap(), "2001:db8::/64".parse().unwrap()],
        };
        let descriptor = build_descriptor(&cfg);
        let PluginConf::Ptp(ptp) = &descriptor.plugins[0] else { panic!("expected ptp first") };
        assert_eq!(ptp.ipam.routes.len(), 2);
        assert_eq!(ptp.ipam.routes[0].dst, "::/0");
        assert_eq!(ptp.ipam.routes[1].dst, "0.0.0.0/0");
        assert_eq!(ptp.ipam.ranges.len(), 2);
    }

    #[test]
    fn single_family_input_yields_a_single_default_route() {
        let cfg = CniConfig { pod_cidrs: vec!["10.0.0.0/24".parse().unwrap()] };
        let descriptor = build_descriptor(&cfg);
        let PluginConf::Ptp(ptp) = &descriptor.plugins[0] else { panic!("expected ptp first") };
        assert_eq!(ptp.ipam.routes.len(), 1);
        assert_eq!(ptp.ipam.routes[0].dst, "0.0.0.0/0");
    }

    #[test]
    fn repeated_write_of_the_same_config_skips_the_file_write() {
        let dir = std::env::temp_dir().join(format!("wigglenet-cni-test-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("10-wigglenet.conflist");

        let mut writer = CniConfigWriter::new(&path);
        let cfg = CniConfig { pod_cidrs: vec!["10.0.0.0/24".parse().unwrap()] };
        writer.write(cfg.clone()).unwrap();
        let first_mtime = std::fs::metadata(&path).unwrap().modified().unwrap();

        std::thread::sleep(std::time::Duration::from_millis(10));
        writer.write(cfg).unwrap();
        let second_mtime = std::fs::metadata(&path).unwrap().modified().unwrap();

        assert_eq!(first_mtime, second_mtime);
        let _ = std::fs::remove_dir_all(&dir);
    }
}
