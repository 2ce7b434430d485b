// Copyright Andeya Lee 2024
//
// Use of this source code is governed by an MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT.
//!
//! load balance over the live node set.

pub mod random;
pub mod round_robin;

use crate::client::discover::{Node, MAX_WEIGHT};
use crate::client::ClientError;
use rand::seq::SliceRandom;
pub use random::RandomBalance;
pub use round_robin::RoundRobinBalance;
use std::sync::Arc;

/// [`LoadBalance`] promise the feature of the load balance policy.
pub trait LoadBalance: Send + Sync + 'static {
    /// Replaces the selection universe.
    fn set_nodes(&self, nodes: &[Arc<Node>]);
    /// Returns the next node, or [`ClientError::NoNodesAvailable`] when the universe is empty.
    fn get_node(&self) -> Result<Arc<Node>, ClientError>;
}

/// Load balance type
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LoadBalanceKind {
    /// uniform random strategy
    #[default]
    Random,
    /// round-robin strategy
    RoundRobin,
}

impl LoadBalanceKind {
    /// Creates an empty balancer of this kind.
    pub fn build(self) -> Arc<dyn LoadBalance> {
        match self {
            LoadBalanceKind::Random => Arc::new(RandomBalance::new()),
            LoadBalanceKind::RoundRobin => Arc::new(RoundRobinBalance::new()),
        }
    }
}

fn slots(node: &Node) -> u32 {
    node.weight.clamp(1, MAX_WEIGHT)
}

/// Replicates every node `weight` times and shuffles the result, so selection
/// frequency is proportional to weight. Weights are clamped to `1..=MAX_WEIGHT`.
pub(crate) fn expand_by_weight(nodes: &[Arc<Node>]) -> Vec<Arc<Node>> {
    let mut expanded = Vec::with_capacity(nodes.iter().map(|n| slots(n) as usize).sum());
    for node in nodes {
        for _ in 0..slots(node) {
            expanded.push(node.clone());
        }
    }
    expanded.shuffle(&mut rand::thread_rng());
    expanded
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expansion_length_is_sum_of_weights() {
        let nodes = Node::parse_list("A:1:3,B:1:1,C:1:2").unwrap();
        let expanded = expand_by_weight(&nodes);
        assert_eq!(expanded.len(), 6);
        for node in &nodes {
            assert_eq!(expanded.iter().filter(|n| *n == node).count(), node.weight as usize);
        }
    }

    #[test]
    fn oversized_weights_are_clamped() {
        let heavy = Arc::new(Node {
            address: "A".into(),
            port: 1,
            weight: u32::MAX,
        });
        assert_eq!(expand_by_weight(&[heavy]).len(), MAX_WEIGHT as usize);
    }

    #[test]
    fn build_each_kind() {
        for kind in [LoadBalanceKind::Random, LoadBalanceKind::RoundRobin] {
            let lb = kind.build();
            assert_eq!(lb.get_node(), Err(ClientError::NoNodesAvailable));
            lb.set_nodes(&Node::parse_list("A:1").unwrap());
            assert_eq!(lb.get_node().unwrap().address.as_str(), "A");
        }
    }
}
