//! Reads this node's orchestrator-assigned pod prefixes, the input to the
//! `spec` pod-CIDR source.

use k8s_openapi::api::core::v1::Node;
use net::Prefix;

/// The prefixes the orchestrator assigned to this node, split by family.
/// Malformed entries are skipped with a warning rather than failing
/// startup over one bad string.
pub fn spec_pod_cidrs(node: &Node) -> (Vec<Prefix>, Vec<Prefix>) {
    let raw: Vec<String> = node
        .spec
        .as_ref()
        .and_then(|spec| spec.pod_cidrs.clone())
        .filter(|cidrs| !cidrs.is_empty())
        .or_else(|| {
            node.spec
                .as_ref()
                .and_then(|spec| spec.pod_cidr.clone())
                .map(|cidr| vec![cidr])
        })
        .unwrap_or_default();

    let parsed: Vec<Prefix> = raw
        .iter()
        .filter_map(|s| match s.parse() {
            Ok(p) => Some(p),
            Err(err) => {
                tracing::warn!(cidr = s, %err, "skipping malformed node.spec pod CIDR");
                None
            }
        })
        .collect();

    let (v6, v4) = parsed.into_iter().partition(Prefix::is_ipv6);
    (v4, v6)
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::NodeSpec;

    #[test]
    fn splits_by_family_and_skips_malformed_entries() {
        let node = Node {
            spec: Some(NodeSpec {
                pod_cidrs: Some(vec![
                    "10.0.1.0/24".to_string(),
                    "garbage".to_string(),
                    "2001:db8::/64".to_string(),
                ]),
                ..Default::default()
            }),
            ..Default::default()
        };

        let (v4, v6) = spec_pod_cidrs(&node);
        assert_eq!(v4, vec!["10.0.1.0/24".parse().unwrap()]);
        assert_eq!(v6, vec!["2001:db8::/64".parse().unwrap()]);
    }

    #[test]
    fn falls_back_to_the_singular_pod_cidr_field() {
        let node = Node {
            spec: Some(NodeSpec {
                pod_cidr: Some("10.0.2.0/24".to_string()),
                ..Default::default()
            }),
            ..Default::default()
        };

        let (v4, v6) = spec_pod_cidrs(&node);
        assert_eq!(v4, vec!["10.0.2.0/24".parse().unwrap()]);
        assert!(v6.is_empty());
    }
}
