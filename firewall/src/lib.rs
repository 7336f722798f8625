//! Packet-filter / NAT reconciler: programs two rule tables (filter, nat)
//! per address family from an aggregated list of pod prefixes.

mod backend;
mod worker;

pub use backend::{BackendError, Family, IpTablesBackend, ShellBackend};
pub use worker::run;

use net::Prefix;

pub const FILTER_CHAIN: &str = "WIGGLENET-FIREWALL";
pub const NAT_CHAIN: &str = "WIGGLENET-MASQ";

/// Desired packet-filter state: the summarised union of all observed pod
/// prefixes, split per family by the reconciler.
#[derive(Clone, PartialEq, Eq, Debug, Default)]
pub struct FirewallConfig {
    pub pod_cidrs: Vec<Prefix>,
}
