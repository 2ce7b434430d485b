// Copyright Andeya Lee 2024
//
// Use of this source code is governed by an MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT.
//!
//! Service registration: how to connect to a service and which methods it exposes.
//!
//! Each [`Service`] binds a name to a [`Connector`] that opens transport-level clients and a
//! method table built at registration time. A call names its method as a string; the
//! method table resolves it to a typed invoker, or fails with [`ClientError::UnknownMethod`].

use crate::client::discover::Node;
use crate::client::ClientError;
use faststr::FastStr;
use futures::future::{self, BoxFuture};
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use tracing::{trace, warn};

/// The dynamically-typed payload of call arguments and results.
pub type Value = serde_json::Value;

/// A typed invoker: runs one method on a connected client.
pub type Invoker<C> = Arc<dyn for<'a> Fn(&'a mut C, Args) -> BoxFuture<'a, Result<Value, ClientError>> + Send + Sync>;

/// Opens transport-level clients for one service.
pub trait Connector: Send + Sync + 'static {
    /// The transport-level client.
    type Conn: Send + 'static;
    /// Opens a client to `node`. Transport failures should map to [`ClientError::ConnectionCreateFailed`].
    fn connect<'a>(&'a self, node: &'a Node) -> impl Future<Output = Result<Self::Conn, ClientError>> + Send + 'a;
    /// Closes a client. Dropping it is enough unless the transport needs a goodbye.
    fn close(conn: Self::Conn) -> impl Future<Output = ()> + Send + 'static {
        async move { drop(conn) }
    }
}

/// Positional call arguments.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Args(Vec<Value>);

impl Args {
    /// Creates an empty argument list.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends an argument.
    pub fn push(mut self, value: impl Into<Value>) -> Self {
        self.0.push(value.into());
        self
    }

    /// Number of arguments.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether there is no argument.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Decodes the argument at `index`.
    pub fn get<T: DeserializeOwned>(&self, index: usize) -> Result<T, ClientError> {
        let value = self.0.get(index).ok_or_else(|| ClientError::InvalidArgument(format!("missing argument #{index}").into()))?;
        T::deserialize(value).map_err(|e| ClientError::InvalidArgument(format!("argument #{index}: {e}").into()))
    }

    /// Returns the raw values.
    pub fn into_inner(self) -> Vec<Value> {
        self.0
    }
}

impl From<Vec<Value>> for Args {
    fn from(values: Vec<Value>) -> Self {
        Self(values)
    }
}

/// A service definition: name, connector and method table.
pub struct Service<K: Connector> {
    inner: Arc<ServiceInner<K>>,
}

struct ServiceInner<K: Connector> {
    name: FastStr,
    connector: K,
    methods: HashMap<FastStr, Invoker<K::Conn>>,
}

impl<K: Connector> Service<K> {
    /// Creates a service with an empty method table.
    pub fn new(name: impl Into<FastStr>, connector: K) -> Self {
        Self {
            inner: Arc::new(ServiceInner {
                name: name.into(),
                connector,
                methods: HashMap::new(),
            }),
        }
    }

    /// Registers a method.
    ///
    /// # Example:
    /// ```
    /// use meshcall::client::discover::Node;
    /// use meshcall::client::service::{Connector, Service};
    /// use meshcall::{ClientError, Value};
    /// use std::future::Future;
    ///
    /// struct Echo;
    ///
    /// impl Connector for Echo {
    ///     type Conn = String;
    ///     fn connect<'a>(&'a self, node: &'a Node) -> impl Future<Output = Result<String, ClientError>> + Send + 'a {
    ///         async move { Ok(node.host_port()) }
    ///     }
    /// }
    ///
    /// let service = Service::new("Echo", Echo).method("echo", |conn: &mut String, args| {
    ///     Box::pin(async move { Ok(Value::from(format!("{conn}: {}", args.get::<String>(0)?))) })
    /// });
    /// assert!(service.has_method("echo"));
    /// ```
    pub fn method<F>(mut self, name: impl Into<FastStr>, invoker: F) -> Self
    where
        F: for<'a> Fn(&'a mut K::Conn, Args) -> BoxFuture<'a, Result<Value, ClientError>> + Send + Sync + 'static,
    {
        match Arc::get_mut(&mut self.inner) {
            Some(inner) => {
                inner.methods.insert(name.into(), Arc::new(invoker));
            },
            None => warn!("[MESHCALL] service `{}` is shared, method ignored", self.inner.name),
        }
        self
    }

    /// The service name.
    pub fn name(&self) -> &FastStr {
        &self.inner.name
    }

    /// Whether `method` is registered.
    pub fn has_method(&self, method: &str) -> bool {
        self.inner.methods.contains_key(method)
    }
}

/// A connected, per-connection client through which calls are dispatched.
pub trait Handle: Send + 'static {
    /// The service this handle belongs to.
    fn service(&self) -> &FastStr;
    /// The node this handle is connected to.
    fn node(&self) -> &Arc<Node>;
    /// Resolves `method` and runs it.
    fn invoke<'a>(&'a mut self, method: &'a str, args: Args) -> BoxFuture<'a, Result<Value, ClientError>>;
    /// Closes the underlying connection.
    fn close(self: Box<Self>) -> BoxFuture<'static, ()>;
}

impl fmt::Debug for dyn Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Handle").field("service", self.service()).field("node", self.node()).finish()
    }
}

struct TypedHandle<K: Connector> {
    conn: K::Conn,
    node: Arc<Node>,
    service: Arc<ServiceInner<K>>,
}

impl<K: Connector> Handle for TypedHandle<K> {
    fn service(&self) -> &FastStr {
        &self.service.name
    }

    fn node(&self) -> &Arc<Node> {
        &self.node
    }

    fn invoke<'a>(&'a mut self, method: &'a str, args: Args) -> BoxFuture<'a, Result<Value, ClientError>> {
        match self.service.methods.get(method) {
            Some(invoker) => invoker(&mut self.conn, args),
            None => Box::pin(future::ready(Err(ClientError::UnknownMethod {
                service: self.service.name.clone(),
                method: FastStr::new(method),
            }))),
        }
    }

    fn close(self: Box<Self>) -> BoxFuture<'static, ()> {
        trace!("[MESHCALL] closing `{}` client to {}", self.service.name, self.node.host_port());
        Box::pin(K::close(self.conn))
    }
}

/// A [`Service`] with its connection type erased.
pub trait ErasedService: Send + Sync + 'static {
    /// The service name.
    fn name(&self) -> &FastStr;
    /// Opens a handle to `node`.
    fn connect(&self, node: Arc<Node>) -> BoxFuture<'static, Result<Box<dyn Handle>, ClientError>>;
}

impl<K: Connector> ErasedService for Service<K> {
    fn name(&self) -> &FastStr {
        &self.inner.name
    }

    fn connect(&self, node: Arc<Node>) -> BoxFuture<'static, Result<Box<dyn Handle>, ClientError>> {
        let service = self.inner.clone();
        Box::pin(async move {
            let conn = service.connector.connect(&node).await?;
            Ok(Box::new(TypedHandle { conn, node, service }) as Box<dyn Handle>)
        })
    }
}

/// The service registration table: service name to connection factory.
///
/// Built once when the client is built and read-only afterwards.
#[derive(Clone, Default)]
pub struct ServiceTable {
    services: Arc<HashMap<FastStr, Arc<dyn ErasedService>>>,
}

impl ServiceTable {
    /// Creates the table; a later registration replaces an earlier one with the same name.
    pub fn new(services: Vec<Arc<dyn ErasedService>>) -> Self {
        let mut table = HashMap::with_capacity(services.len());
        for service in services {
            if let Some(previous) = table.insert(service.name().clone(), service) {
                warn!("[MESHCALL] service `{}` registered twice, keeping the last one", previous.name());
            }
        }
        Self { services: Arc::new(table) }
    }

    /// Looks up a service.
    pub fn get(&self, name: &str) -> Option<&Arc<dyn ErasedService>> {
        self.services.get(name)
    }

    /// Registered service names.
    pub fn names(&self) -> impl Iterator<Item = &FastStr> {
        self.services.keys()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    struct Upper;

    impl Connector for Upper {
        type Conn = Vec<String>;

        fn connect<'a>(&'a self, _node: &'a Node) -> impl Future<Output = Result<Self::Conn, ClientError>> + Send + 'a {
            async { Ok(Vec::new()) }
        }
    }

    fn upper() -> Service<Upper> {
        Service::new("Upper", Upper).method("upper", |seen: &mut Vec<String>, args| {
            Box::pin(async move {
                let text: String = args.get(0)?;
                seen.push(text.clone());
                Ok(Value::from(text.to_uppercase()))
            })
        })
    }

    #[tokio::test]
    async fn invoke_resolves_methods_by_name() {
        let service = upper();
        let mut handle = service.connect(Arc::new(Node::new("A", 1, 1))).await.unwrap();
        assert_eq!(handle.service().as_str(), "Upper");
        assert_eq!(handle.invoke("upper", crate::args!["abc"]).await, Ok(Value::from("ABC")));
        assert_matches!(handle.invoke("lower", crate::args!["abc"]).await, Err(ClientError::UnknownMethod { method, .. }) if method.as_str() == "lower");
        assert_matches!(handle.invoke("upper", Args::new()).await, Err(ClientError::InvalidArgument(_)));
        assert_matches!(handle.invoke("upper", Args::new().push(1)).await, Err(ClientError::InvalidArgument(_)));
        handle.close().await;
    }

    #[test]
    fn table_lookup() {
        let table = ServiceTable::new(vec![Arc::new(upper())]);
        assert!(table.get("Upper").is_some());
        assert!(table.get("Lower").is_none());
        assert_eq!(table.names().count(), 1);
    }
}
