// Copyright Andeya Lee 2024
//
// Use of this source code is governed by an MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT.
//! Round-robin load balance implemention

use super::{expand_by_weight, LoadBalance};
use crate::client::discover::Node;
use crate::client::ClientError;
use std::sync::{Arc, Mutex, PoisonError};

/// Round-robin load balance implemention.
///
/// The node list is expanded by weight and shuffled once per [`LoadBalance::set_nodes`];
/// `get_node` then walks it with a cursor that is reset on every reseed.
#[derive(Debug, Default)]
pub struct RoundRobinBalance {
    state: Mutex<Cursor>,
}

#[derive(Debug, Default)]
struct Cursor {
    nodes: Vec<Arc<Node>>,
    pos: usize,
}

impl RoundRobinBalance {
    /// Returns a empty [`RoundRobinBalance`]
    pub fn new() -> Self {
        Self::default()
    }
}

impl LoadBalance for RoundRobinBalance {
    fn set_nodes(&self, nodes: &[Arc<Node>]) {
        let expanded = expand_by_weight(nodes);
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.nodes = expanded;
        state.pos = 0;
    }

    fn get_node(&self) -> Result<Arc<Node>, ClientError> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if state.nodes.is_empty() {
            return Err(ClientError::NoNodesAvailable);
        }
        if state.pos >= state.nodes.len() {
            state.pos = 0;
        }
        let node = state.nodes[state.pos].clone();
        state.pos += 1;
        Ok(node)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn two_equal_nodes_alternate() {
        let lb = RoundRobinBalance::new();
        lb.set_nodes(&Node::parse_list("A:1:1,B:1:1").unwrap());
        let picks: Vec<_> = (0..4).map(|_| lb.get_node().unwrap()).collect();
        assert_ne!(picks[0], picks[1]);
        assert_eq!(picks[0], picks[2]);
        assert_eq!(picks[1], picks[3]);
    }

    #[test]
    fn one_cycle_visits_every_slot_once() {
        let lb = RoundRobinBalance::new();
        let nodes = Node::parse_list("A:1:3,B:1:1,C:1:2").unwrap();
        lb.set_nodes(&nodes);
        let len = 6;
        let first: Vec<_> = (0..len).map(|_| lb.get_node().unwrap()).collect();
        let second: Vec<_> = (0..len).map(|_| lb.get_node().unwrap()).collect();
        assert_eq!(first, second);
        for node in &nodes {
            assert_eq!(first.iter().filter(|n| *n == node).count(), node.weight as usize);
        }
    }

    #[test]
    fn reseed_resets_cursor() {
        let lb = RoundRobinBalance::new();
        lb.set_nodes(&Node::parse_list("A:1,B:1,C:1").unwrap());
        lb.get_node().unwrap();
        lb.set_nodes(&Node::parse_list("D:1").unwrap());
        assert_eq!(lb.get_node().unwrap().address.as_str(), "D");
        lb.set_nodes(&[]);
        assert_eq!(lb.get_node(), Err(ClientError::NoNodesAvailable));
    }
}
