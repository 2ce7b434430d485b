// Copyright Andeya Lee 2024
//
// Use of this source code is governed by an MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT.
//!
//! The coordination service interface: a hierarchical namespace of paths with
//! one-shot child watches and session-bound ephemeral nodes.
//!
//! Servers register an ephemeral leaf named `address:port:weight` under a
//! [`ServicePath`]; clients list and watch the children of that path.

pub mod memory;

use crate::client::discover::Node;
use crate::client::ClientError;
use async_broadcast::Receiver;
use faststr::FastStr;
use std::fmt;
use std::future::Future;
use tokio::sync::oneshot;

pub use memory::MemoryCoordinator;

/// Root path segment used when none is configured.
pub const DEFAULT_ROOT: &str = "meshcall";
/// Version path segment used when none is configured.
pub const DEFAULT_VERSION: &str = "1.0.0";

/// A one-shot watch on a path; fires at most once and must be re-armed by listing again.
///
/// The sender is dropped without firing when the watch can never fire, for example
/// when the coordinator shuts down.
pub type Watch = oneshot::Receiver<WatchEvent>;

/// What happened to a watched path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchEvent {
    /// The path was created.
    Created,
    /// The path was deleted.
    Deleted,
    /// A child was added to or removed from the path.
    ChildrenChanged,
}

impl fmt::Display for WatchEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WatchEvent::Created => f.write_str("created"),
            WatchEvent::Deleted => f.write_str("deleted"),
            WatchEvent::ChildrenChanged => f.write_str("children changed"),
        }
    }
}

/// Node kinds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum CreateMode {
    /// Lives until deleted.
    #[default]
    Persistent,
    /// Deleted automatically when the creating session ends.
    Ephemeral,
}

/// Session state transitions a coordinator publishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// The session is (re)connected; ephemeral registrations may need to be recreated.
    Connected,
    /// The connection dropped; the session may still come back.
    Disconnected,
    /// The session ended and its ephemeral nodes are gone.
    Expired,
}

/// Errors returned by a [`Coordinator`].
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    /// The path, or the parent of the path to create, does not exist.
    #[error("no node at `{0}`")]
    NoNode(FastStr),
    /// The path to create already exists.
    #[error("node `{0}` already exists")]
    NodeExists(FastStr),
    /// The path to delete still has children.
    #[error("node `{0}` has children")]
    NotEmpty(FastStr),
    /// The session is expired.
    #[error("session expired")]
    SessionExpired,
    /// Any other backend failure.
    #[error("coordination backend: {0}")]
    Backend(FastStr),
}

impl From<RegistryError> for ClientError {
    fn from(err: RegistryError) -> Self {
        ClientError::DiscoveryWatch(err.to_string().into())
    }
}

/// [`Coordinator`] is the interface to a hierarchical coordination service.
pub trait Coordinator: Send + Sync + 'static {
    /// Lists the child names of `path` and arms a one-shot watch on it.
    fn list_children<'a>(&'a self, path: &'a str) -> impl Future<Output = Result<(Vec<String>, Watch), RegistryError>> + Send + 'a;
    /// Whether `path` exists.
    fn exists<'a>(&'a self, path: &'a str) -> impl Future<Output = Result<bool, RegistryError>> + Send + 'a;
    /// Creates `path`; its parent must exist.
    fn create<'a>(&'a self, path: &'a str, mode: CreateMode) -> impl Future<Output = Result<(), RegistryError>> + Send + 'a;
    /// Deletes `path`; it must have no children.
    fn delete<'a>(&'a self, path: &'a str) -> impl Future<Output = Result<(), RegistryError>> + Send + 'a;

    /// Creates every missing ancestor of `path`, and `path` itself, as persistent nodes.
    fn ensure_path<'a>(&'a self, path: &'a str) -> impl Future<Output = Result<(), RegistryError>> + Send + 'a {
        async move {
            let mut current = String::with_capacity(path.len());
            for segment in path.split('/').filter(|s| !s.is_empty()) {
                current.push('/');
                current.push_str(segment);
                if self.exists(&current).await? {
                    continue;
                }
                match self.create(&current, CreateMode::Persistent).await {
                    Ok(()) | Err(RegistryError::NodeExists(_)) => {},
                    Err(err) => return Err(err),
                }
            }
            Ok(())
        }
    }

    /// Subscribes to session state transitions, if the backend reports them.
    fn session_events(&self) -> Option<Receiver<SessionState>> {
        None
    }
}

/// The registration path layout: `/{root}[/{namespace}][/{global_service_name}]/{version}`.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub struct ServicePath {
    /// Top-level segment.
    pub root: FastStr,
    /// Optional namespace segment.
    pub namespace: Option<FastStr>,
    /// Optional global service name segment.
    pub global_service_name: Option<FastStr>,
    /// Version segment.
    pub version: FastStr,
}

impl Default for ServicePath {
    fn default() -> Self {
        Self {
            root: FastStr::from_static_str(DEFAULT_ROOT),
            namespace: None,
            global_service_name: None,
            version: FastStr::from_static_str(DEFAULT_VERSION),
        }
    }
}

impl ServicePath {
    /// Set the root segment, empty means "meshcall".
    pub fn with_root(mut self, root: impl Into<FastStr>) -> Self {
        let root: FastStr = root.into();
        self.root = if root.is_empty() { FastStr::from_static_str(DEFAULT_ROOT) } else { root };
        self
    }
    /// Set the namespace segment, empty means none.
    pub fn with_namespace(mut self, namespace: impl Into<FastStr>) -> Self {
        let namespace: FastStr = namespace.into();
        self.namespace = Some(namespace).filter(|s| !s.is_empty());
        self
    }
    /// Set the global service name segment, empty means none.
    pub fn with_global_service_name(mut self, name: impl Into<FastStr>) -> Self {
        let name: FastStr = name.into();
        self.global_service_name = Some(name).filter(|s| !s.is_empty());
        self
    }
    /// Set the version segment, empty means "1.0.0".
    pub fn with_version(mut self, version: impl Into<FastStr>) -> Self {
        let version: FastStr = version.into();
        self.version = if version.is_empty() { FastStr::from_static_str(DEFAULT_VERSION) } else { version };
        self
    }

    /// The path whose children are the registered nodes.
    pub fn parent(&self) -> String {
        let mut path = format!("/{}", self.root);
        for segment in [&self.namespace, &self.global_service_name].into_iter().flatten() {
            path.push('/');
            path.push_str(segment);
        }
        path.push('/');
        path.push_str(&self.version);
        path
    }

    /// The registration path of one node.
    pub fn leaf(&self, node: &Node) -> String {
        format!("{}/{}", self.parent(), node)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn path_layout() {
        let path = ServicePath::default();
        assert_eq!(path.parent(), "/meshcall/1.0.0");
        let path = path.with_namespace("prod").with_global_service_name("sms").with_version("2.1");
        assert_eq!(path.parent(), "/meshcall/prod/sms/2.1");
        assert_eq!(path.leaf(&Node::new("10.0.0.1", 3068, 2)), "/meshcall/prod/sms/2.1/10.0.0.1:3068:2");
        let path = path.with_namespace("").with_version("");
        assert_eq!(path.parent(), "/meshcall/sms/1.0.0");
    }

    #[test]
    fn registry_errors_surface_as_discovery_failures() {
        let err: ClientError = RegistryError::NoNode("/meshcall".into()).into();
        assert_eq!(err, ClientError::DiscoveryWatch("no node at `/meshcall`".into()));
    }
}
