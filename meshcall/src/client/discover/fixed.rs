// Copyright Andeya Lee 2024
//
// Use of this source code is governed by an MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT.

use super::{Discover, Discovery, Node};
use crate::client::balance::{LoadBalance, LoadBalanceKind};
use crate::client::pool::Invalidate;
use crate::client::ClientError;
use async_broadcast::Receiver;
use std::future::{self, Future};
use std::sync::{Arc, Weak};

/// [`FixedDiscover`] serves a static node list parsed once at construction and never watches.
pub struct FixedDiscover {
    nodes: Vec<Arc<Node>>,
    balance: Arc<dyn LoadBalance>,
}

impl FixedDiscover {
    /// Parses a comma-separated `address:port[:weight]` list and seeds a balancer of `kind` with it.
    pub fn new(list: &str, kind: LoadBalanceKind) -> Result<Self, ClientError> {
        Ok(Self::from_nodes(Node::parse_list(list)?, kind))
    }

    /// Seeds a balancer of `kind` with `nodes`.
    pub fn from_nodes(nodes: Vec<Arc<Node>>, kind: LoadBalanceKind) -> Self {
        let balance = kind.build();
        balance.set_nodes(&nodes);
        Self { nodes, balance }
    }
}

impl Discover for FixedDiscover {
    fn select(&self) -> Result<Arc<Node>, ClientError> {
        self.balance.get_node()
    }

    fn nodes(&self) -> impl Future<Output = Vec<Arc<Node>>> + Send {
        future::ready(self.nodes.clone())
    }

    fn set_invalidator(&self, _invalidator: Weak<dyn Invalidate>) {}

    fn start(self: Arc<Self>) -> impl Future<Output = ()> + Send {
        future::ready(())
    }

    fn stop(&self) {}

    fn watch(&self) -> Option<Receiver<Discovery>> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[tokio::test]
    async fn serves_the_static_list() {
        let discover = FixedDiscover::new("127.0.0.1:8000:2, 127.0.0.1:8001", LoadBalanceKind::RoundRobin).unwrap();
        assert_eq!(discover.nodes().await.len(), 2);
        let picks: Vec<_> = (0..3).map(|_| discover.select().unwrap().port).collect();
        assert_eq!(picks.iter().filter(|port| **port == 8000).count(), 2);
        assert!(discover.watch().is_none());
    }

    #[test]
    fn rejects_malformed_lists() {
        assert_matches!(FixedDiscover::new("127.0.0.1", LoadBalanceKind::Random).err(), Some(ClientError::InvalidNode { .. }));
        let empty = FixedDiscover::new("", LoadBalanceKind::Random).unwrap();
        assert_eq!(empty.select(), Err(ClientError::NoNodesAvailable));
    }
}
