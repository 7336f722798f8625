//! Node-record annotation keys and their (de)serialization.
//!
//! All coordination between agent instances happens through three
//! annotations on the node record: the node's WireGuard public key, the
//! addresses it is reachable at, and the pod CIDRs it owns.

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use net::Prefix;
use std::net::IpAddr;
use thiserror::Error;

pub const PUBLIC_KEY: &str = "wigglenet/public-key";
pub const NODE_IPS: &str = "wigglenet/node-ips";
pub const POD_CIDRS: &str = "wigglenet/pod-cidrs";

#[derive(Debug, Error)]
pub enum AnnotationError {
    #[error("invalid base64 in {0}: {1}")]
    Base64(&'static str, base64::DecodeError),
    #[error("invalid JSON in {0}: {1}")]
    Json(&'static str, serde_json::Error),
    #[error("invalid IP address {0:?} in {1}")]
    Address(String, &'static str),
    #[error("invalid prefix in {0}: {1}")]
    Prefix(&'static str, net::PrefixError),
}

pub fn encode_public_key(key: &[u8]) -> String {
    BASE64.encode(key)
}

pub fn decode_public_key(value: &str) -> Result<Vec<u8>, AnnotationError> {
    BASE64
        .decode(value)
        .map_err(|e| AnnotationError::Base64(PUBLIC_KEY, e))
}

pub fn encode_node_ips(ips: &[IpAddr]) -> String {
    let strings: Vec<String> = ips.iter().map(IpAddr::to_string).collect();
    serde_json::to_string(&strings).expect("string vec always serializes")
}

pub fn decode_node_ips(value: &str) -> Result<Vec<IpAddr>, AnnotationError> {
    let strings: Vec<String> =
        serde_json::from_str(value).map_err(|e| AnnotationError::Json(NODE_IPS, e))?;
    strings
        .into_iter()
        .map(|s| {
            s.parse()
                .map_err(|_| AnnotationError::Address(s.clone(), NODE_IPS))
        })
        .collect()
}

pub fn encode_pod_cidrs(cidrs: &[Prefix]) -> String {
    let strings: Vec<String> = cidrs.iter().map(Prefix::to_string).collect();
    serde_json::to_string(&strings).expect("string vec always serializes")
}

pub fn decode_pod_cidrs(value: &str) -> Result<Vec<Prefix>, AnnotationError> {
    let strings: Vec<String> =
        serde_json::from_str(value).map_err(|e| AnnotationError::Json(POD_CIDRS, e))?;
    strings
        .into_iter()
        .map(|s| s.parse().map_err(|e| AnnotationError::Prefix(POD_CIDRS, e)))
        .collect()
}
