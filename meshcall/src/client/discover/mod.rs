// Copyright Andeya Lee 2024
//
// Use of this source code is governed by an MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT.
//!
//! Client-side service discovery: which nodes are alive and which one serves the next connection.

use crate::client::pool::Invalidate;
use crate::client::ClientError;
use async_broadcast::Receiver;
use faststr::FastStr;
use std::fmt;
use std::future::Future;
use std::str::FromStr;
use std::sync::{Arc, Weak};

pub use fixed::FixedDiscover;
pub use registry::RegistryDiscover;

mod fixed;
mod registry;

/// Weight of a node whose entry carries none.
pub const DEFAULT_WEIGHT: u32 = 1;
/// Largest accepted weight; balancers keep one slot per unit of weight.
pub const MAX_WEIGHT: u32 = 100;

/// [`Discover`] is the most basic trait for Discover.
pub trait Discover: Send + Sync + 'static {
    /// Picks the node the next connection should go to.
    fn select(&self) -> Result<Arc<Node>, ClientError>;
    /// Returns the live node set as last observed.
    fn nodes(&self) -> impl Future<Output = Vec<Arc<Node>>> + Send;
    /// Installs the pool that must be invalidated on every membership change.
    fn set_invalidator(&self, invalidator: Weak<dyn Invalidate>);
    /// Loads the initial membership and starts watching for changes.
    fn start(self: Arc<Self>) -> impl Future<Output = ()> + Send;
    /// Stops watching for changes.
    fn stop(&self);
    /// `watch` should return a [`async_broadcast::Receiver`] which can be used to subscribe [`Discovery`].
    fn watch(&self) -> Option<Receiver<Discovery>>;
}

/// Discovery carries the live node set applied after a membership change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Discovery {
    /// The registration path the nodes were listed from.
    pub key: FastStr,
    /// The new live node set.
    pub nodes: Vec<Arc<Node>>,
}

/// [`Node`] is one addressable server replica with a relative selection weight.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Node {
    /// Host name or IP address.
    pub address: FastStr,
    /// Service port.
    pub port: u16,
    /// Relative selection weight, in `1..=MAX_WEIGHT`.
    pub weight: u32,
}

impl Node {
    /// Creates a node; the weight is clamped to `1..=MAX_WEIGHT`.
    pub fn new(address: impl Into<FastStr>, port: u16, weight: u32) -> Self {
        Self {
            address: address.into(),
            port,
            weight: weight.clamp(1, MAX_WEIGHT),
        }
    }

    /// The node identity, `address:port`, usable as a connect target.
    pub fn host_port(&self) -> String {
        if self.address.contains(':') {
            format!("[{}]:{}", self.address, self.port)
        } else {
            format!("{}:{}", self.address, self.port)
        }
    }

    /// Parses a comma-separated `address:port[:weight]` list, skipping empty segments.
    pub fn parse_list(list: &str) -> Result<Vec<Arc<Node>>, ClientError> {
        list.split(',').map(str::trim).filter(|s| !s.is_empty()).map(|s| s.parse().map(Arc::new)).collect()
    }
}

/// Formats as the registry leaf name `address:port:weight`.
impl fmt::Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host_port(), self.weight)
    }
}

impl FromStr for Node {
    type Err = ClientError;

    /// Parses `address:port` or `address:port:weight`; IPv6 hosts are bracketed, as in `[::1]:8080:2`.
    fn from_str(entry: &str) -> Result<Self, Self::Err> {
        let invalid = |reason: &'static str| ClientError::InvalidNode {
            entry: FastStr::new(entry),
            reason: FastStr::from_static_str(reason),
        };
        let (address, rest) = if let Some(bracketed) = entry.strip_prefix('[') {
            let (host, rest) = bracketed.split_once(']').ok_or_else(|| invalid("unclosed `[`"))?;
            (host, rest.strip_prefix(':').ok_or_else(|| invalid("missing port"))?)
        } else {
            entry.split_once(':').ok_or_else(|| invalid("missing port"))?
        };
        if address.is_empty() {
            return Err(invalid("empty address"));
        }
        let (port, weight) = match rest.split_once(':') {
            Some((port, weight)) => (port, Some(weight)),
            None => (rest, None),
        };
        let port = port.parse::<u16>().map_err(|_| invalid("port is not a valid u16"))?;
        let weight = match weight {
            Some(weight) => match weight.parse::<u32>() {
                Ok(0) => return Err(invalid("weight must be positive")),
                Ok(weight) if weight > MAX_WEIGHT => return Err(invalid("weight exceeds the maximum of 100")),
                Ok(weight) => weight,
                Err(_) => return Err(invalid("weight is not a valid integer")),
            },
            None => DEFAULT_WEIGHT,
        };
        Ok(Node {
            address: FastStr::new(address),
            port,
            weight,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn parse_with_and_without_weight() {
        let node: Node = "10.0.0.1:9000:2".parse().unwrap();
        assert_eq!(node, Node::new("10.0.0.1", 9000, 2));
        let node: Node = "10.0.0.2:9000".parse().unwrap();
        assert_eq!(node.weight, DEFAULT_WEIGHT);
        assert_eq!(node.host_port(), "10.0.0.2:9000");
        assert_eq!(node.to_string(), "10.0.0.2:9000:1");
    }

    #[test]
    fn weight_bounds() {
        let node: Node = "10.0.0.1:9000:100".parse().unwrap();
        assert_eq!(node.weight, MAX_WEIGHT);
        assert_eq!(Node::new("10.0.0.1", 9000, 0).weight, 1);
        assert_eq!(Node::new("10.0.0.1", 9000, u32::MAX).weight, MAX_WEIGHT);
    }

    #[test]
    fn parse_ipv6() {
        let node: Node = "[::1]:8080:3".parse().unwrap();
        assert_eq!(node.address.as_str(), "::1");
        assert_eq!(node.port, 8080);
        assert_eq!(node.weight, 3);
        assert_eq!(node.to_string(), "[::1]:8080:3");
    }

    #[test]
    fn parse_rejects_malformed_entries() {
        for entry in ["10.0.0.1", ":9000", "10.0.0.1:http", "10.0.0.1:9000:0", "10.0.0.1:9000:x", "[::1:9000", "10.0.0.1:9000:1:1", "10.0.0.1:9000:101", "10.0.0.1:9000:4294967295"] {
            assert_matches!(entry.parse::<Node>(), Err(ClientError::InvalidNode { .. }), "{entry}");
        }
    }

    #[test]
    fn parse_list_skips_empty_segments() {
        let nodes = Node::parse_list("A:1:1, B:2 ,").unwrap();
        assert_eq!(nodes.len(), 2);
        assert_eq!(nodes[1].address.as_str(), "B");
        assert_eq!(nodes[1].port, 2);
    }
}
