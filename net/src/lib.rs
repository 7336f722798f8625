//! IP prefix algebra: the `Prefix` type and subnet summarisation.
//!
//! This crate has no I/O. It is shared by every other `wigglenet` crate that
//! needs to move CIDR prefixes through JSON, text rule files, or netlink
//! route tables.

mod prefix;
mod summarize;

pub use prefix::{Prefix, PrefixError};
pub use summarize::summarise;
