// Copyright Andeya Lee 2024
//
// Use of this source code is governed by an MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT.
//!
//! Provides a client that pools connections to discovered server nodes and dispatches calls by method name.

pub mod balance;
pub mod config;
pub mod discover;
pub mod factory;
pub mod pool;
pub mod proxy;
pub mod service;

use crate::client::config::ClientConfig;
use crate::client::discover::Discover;
use crate::client::factory::ClientFactory;
use crate::client::pool::{Invalidate, KeyedPool};
use crate::client::proxy::ServiceProxy;
use crate::client::service::{Args, Connector, ErasedService, Service, ServiceTable, Value};
use faststr::FastStr;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tracing::info;

/// Errors surfaced by the client runtime.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ClientError {
    /// The registry or load balancer holds no live node.
    #[error("no server nodes available")]
    NoNodesAvailable,
    /// The connection factory or transport failed to open a connection.
    #[error("failed to create connection to {node}: {reason}")]
    ConnectionCreateFailed {
        /// `address:port` of the selected node.
        node: FastStr,
        /// Transport error message.
        reason: FastStr,
    },
    /// No pooled connection became available before the wait timeout.
    #[error("pool for `{key}` exhausted after waiting {timeout:?}")]
    PoolExhausted {
        /// Service key of the exhausted pool block.
        key: FastStr,
        /// The configured wait timeout.
        timeout: Duration,
    },
    /// The method is not registered for the service.
    #[error("unknown method `{method}` on service `{service}`")]
    UnknownMethod {
        /// Service name.
        service: FastStr,
        /// Requested method name.
        method: FastStr,
    },
    /// No service is registered under this name.
    #[error("unknown service `{0}`")]
    UnknownService(FastStr),
    /// The call executed but the remote side returned an error.
    #[error("remote invocation failed: {0}")]
    RemoteInvocation(FastStr),
    /// An argument could not be decoded into the type the invoker expects.
    #[error("invalid argument: {0}")]
    InvalidArgument(FastStr),
    /// A registry entry is not of the form `address:port[:weight]`.
    #[error("invalid node `{entry}`: {reason}")]
    InvalidNode {
        /// The raw entry.
        entry: FastStr,
        /// Why it was rejected.
        reason: FastStr,
    },
    /// Listing or watching the registry failed.
    #[error("service discovery failed: {0}")]
    DiscoveryWatch(FastStr),
}

impl ClientError {
    /// Wraps an error returned by the remote side of a call.
    pub fn remote(err: impl std::fmt::Display) -> Self {
        ClientError::RemoteInvocation(err.to_string().into())
    }

    /// Returns true for failures on the connection-acquisition path, which the
    /// invocation proxy retries.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ClientError::NoNodesAvailable | ClientError::ConnectionCreateFailed { .. } | ClientError::PoolExhausted { .. })
    }
}

/// A strongly-typed call descriptor.
#[derive(Debug, Clone)]
pub struct Request {
    /// Service name, the pool key.
    pub service: FastStr,
    /// Method name, resolved against the service's method table.
    pub method: FastStr,
    /// Call arguments.
    pub args: Args,
}

impl Request {
    /// Creates a request.
    pub fn new(service: impl Into<FastStr>, method: impl Into<FastStr>, args: Args) -> Self {
        Self {
            service: service.into(),
            method: method.into(),
            args,
        }
    }
}

/// A client builder.
#[must_use]
pub struct Builder<D: Discover> {
    discover: Arc<D>,
    services: Vec<Arc<dyn ErasedService>>,
    config: ClientConfig,
}

impl<D: Discover> Builder<D> {
    /// Registers a service and its method table.
    pub fn service<K: Connector>(mut self, service: Service<K>) -> Self {
        self.services.push(Arc::new(service));
        self
    }
    /// Set the whole client configuration.
    pub fn with_config(mut self, config: ClientConfig) -> Self {
        self.config = config;
        self
    }
    /// Set the number of attempts per call, zero means 3.
    pub fn with_retry(mut self, retry: u32) -> Self {
        self.config = self.config.with_retry(retry);
        self
    }
    /// Set the sleep between attempts, zero means 200ms.
    pub fn with_retry_interval(mut self, retry_interval: Duration) -> Self {
        self.config = self.config.with_retry_interval(retry_interval);
        self
    }
    /// Builds the client, loads the initial membership and starts watching for changes.
    pub async fn build(self) -> Result<Client<D>, ClientError> {
        let services = ServiceTable::new(self.services);
        let factory = ClientFactory::new(self.discover.clone(), services.clone());
        let pool = Arc::new(KeyedPool::new(factory, self.config.pool.clone()));
        let invalidator: Weak<dyn Invalidate> = Arc::downgrade(&pool) as Weak<dyn Invalidate>;
        self.discover.set_invalidator(invalidator);
        self.discover.clone().start().await;

        let proxies = services
            .names()
            .map(|name| (name.clone(), ServiceProxy::new(name.clone(), pool.clone(), self.config.retry, self.config.retry_interval)))
            .collect::<HashMap<_, _>>();
        info!("[MESHCALL] client ready with {} service(s)", proxies.len());
        Ok(Client {
            discover: self.discover,
            pool,
            proxies,
        })
    }
}

/// The entry point applications hold: one [`ServiceProxy`] per registered service.
pub struct Client<D: Discover> {
    discover: Arc<D>,
    pool: Arc<KeyedPool<ClientFactory<D>>>,
    proxies: HashMap<FastStr, ServiceProxy<D>>,
}

impl<D: Discover> Client<D> {
    /// Create a client builder over a discovery provider.
    pub fn builder(discover: D) -> Builder<D> {
        Builder {
            discover: Arc::new(discover),
            services: Vec::new(),
            config: ClientConfig::default(),
        }
    }

    /// Returns the invocation proxy for a service.
    pub fn get_client(&self, key: &str) -> Result<ServiceProxy<D>, ClientError> {
        self.proxies.get(key).cloned().ok_or_else(|| ClientError::UnknownService(FastStr::new(key)))
    }

    /// Routes a request to its service proxy.
    pub async fn call(&self, request: Request) -> Result<Value, ClientError> {
        let proxy = self.proxies.get(&request.service).ok_or_else(|| ClientError::UnknownService(request.service.clone()))?;
        proxy.call(&request.method, request.args).await
    }

    /// The discovery provider.
    pub fn discover(&self) -> &Arc<D> {
        &self.discover
    }

    /// The shared connection pool.
    pub fn pool(&self) -> &Arc<KeyedPool<ClientFactory<D>>> {
        &self.pool
    }

    /// Stops watching the registry and closes every idle connection.
    pub async fn close(&self) {
        self.discover.stop();
        self.pool.clear().await;
    }
}
