// Copyright Andeya Lee 2024
//
// Use of this source code is governed by an MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT.
//! The connection factory the client pool creates entries with.

use crate::client::discover::Discover;
use crate::client::pool::Factory;
use crate::client::service::{Handle, ServiceTable};
use crate::client::ClientError;
use faststr::FastStr;
use std::future::Future;
use std::sync::Arc;
use tracing::debug;

/// Asks the discovery provider for a node, then opens a client to it with the
/// connector registered for the pool key.
pub struct ClientFactory<D: Discover> {
    discover: Arc<D>,
    services: ServiceTable,
}

impl<D: Discover> ClientFactory<D> {
    /// Creates a factory.
    pub fn new(discover: Arc<D>, services: ServiceTable) -> Self {
        Self { discover, services }
    }

    /// The registered services.
    pub fn services(&self) -> &ServiceTable {
        &self.services
    }
}

impl<D: Discover> Factory for ClientFactory<D> {
    type Entry = Box<dyn Handle>;

    fn create<'a>(&'a self, key: &'a str) -> impl Future<Output = Result<Self::Entry, ClientError>> + Send + 'a {
        async move {
            let service = self.services.get(key).ok_or_else(|| ClientError::UnknownService(FastStr::new(key)))?;
            let node = self.discover.select()?;
            debug!("[MESHCALL] connecting `{key}` to {}", node.host_port());
            service.connect(node).await
        }
    }

    fn destroy(entry: Self::Entry) -> impl Future<Output = ()> + Send + 'static {
        entry.close()
    }
}
