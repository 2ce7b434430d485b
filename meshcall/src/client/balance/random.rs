// Copyright Andeya Lee 2024
//
// Use of this source code is governed by an MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT.
//! Random load balance implemention

use super::{expand_by_weight, LoadBalance};
use crate::client::discover::Node;
use crate::client::ClientError;
use rand::Rng;
use std::sync::{Arc, PoisonError, RwLock};

/// Random load balance implemention.
///
/// The weight-expanded node list is swapped whole on [`LoadBalance::set_nodes`], so a
/// concurrent [`LoadBalance::get_node`] sees either the old or the new universe.
#[derive(Debug, Default)]
pub struct RandomBalance {
    nodes: RwLock<Arc<Vec<Arc<Node>>>>,
}

impl RandomBalance {
    /// Returns a empty [`RandomBalance`]
    pub fn new() -> Self {
        Self::default()
    }
}

impl LoadBalance for RandomBalance {
    fn set_nodes(&self, nodes: &[Arc<Node>]) {
        let expanded = Arc::new(expand_by_weight(nodes));
        *self.nodes.write().unwrap_or_else(PoisonError::into_inner) = expanded;
    }

    fn get_node(&self) -> Result<Arc<Node>, ClientError> {
        let nodes = self.nodes.read().unwrap_or_else(PoisonError::into_inner).clone();
        if nodes.is_empty() {
            return Err(ClientError::NoNodesAvailable);
        }
        Ok(nodes[rand::thread_rng().gen_range(0..nodes.len())].clone())
    }
}
