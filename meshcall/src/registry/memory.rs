// Copyright Andeya Lee 2024
//
// Use of this source code is governed by an MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT.
//! An in-process coordination service.

use super::{Coordinator, CreateMode, RegistryError, SessionState, Watch, WatchEvent};
use async_broadcast::{broadcast, InactiveReceiver, Receiver, Sender, TrySendError};
use faststr::FastStr;
use std::collections::{BTreeMap, HashMap};
use std::future::{self, Future};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::oneshot;
use tracing::{debug, trace};

const SESSION_EVENTS_CAPACITY: usize = 16;

/// An in-process tree of paths with sessions, ephemeral nodes and one-shot child watches.
///
/// Every handle carries one session; clones share it and [`MemoryCoordinator::new_session`]
/// opens another one on the same tree. Useful for tests and single-process deployments.
#[derive(Clone)]
pub struct MemoryCoordinator {
    shared: Arc<Shared>,
    session: u64,
}

struct Shared {
    tree: Mutex<Tree>,
    next_session: AtomicU64,
}

#[derive(Default)]
struct Tree {
    nodes: BTreeMap<String, Owner>,
    watches: HashMap<String, Vec<oneshot::Sender<WatchEvent>>>,
    sessions: HashMap<u64, Session>,
}

/// The session owning an ephemeral node; `None` for persistent ones.
type Owner = Option<u64>;

struct Session {
    expired: bool,
    events: Sender<SessionState>,
    _keep_open: InactiveReceiver<SessionState>,
}

impl Session {
    fn new() -> Self {
        let (mut events, receiver) = broadcast(SESSION_EVENTS_CAPACITY);
        events.set_overflow(true);
        Self {
            expired: false,
            events,
            _keep_open: receiver.deactivate(),
        }
    }

    fn publish(&self, state: SessionState) {
        match self.events.try_broadcast(state) {
            Ok(_) | Err(TrySendError::Inactive(_)) => {},
            Err(TrySendError::Closed(_)) => trace!("[MESHCALL] session event {state:?} dropped, channel closed"),
            Err(TrySendError::Full(_)) => trace!("[MESHCALL] session event {state:?} dropped, channel full"),
        }
    }
}

fn parent_of(path: &str) -> &str {
    match path.rsplit_once('/') {
        Some(("", _)) | None => "/",
        Some((parent, _)) => parent,
    }
}

fn child_name<'a>(parent: &str, path: &'a str) -> Option<&'a str> {
    if parent_of(path) != parent {
        return None;
    }
    path.rsplit_once('/').map(|(_, name)| name)
}

impl Tree {
    fn exists(&self, path: &str) -> bool {
        path == "/" || self.nodes.contains_key(path)
    }

    fn children(&self, path: &str) -> Vec<String> {
        self.nodes.keys().filter_map(|key| child_name(path, key)).map(str::to_owned).collect()
    }

    fn fire(&mut self, path: &str, event: WatchEvent) {
        for watch in self.watches.remove(path).unwrap_or_default() {
            if watch.send(event).is_err() {
                trace!("[MESHCALL] watch on `{path}` was dropped before it fired");
            }
        }
    }

    fn remove(&mut self, path: &str) {
        self.nodes.remove(path);
        self.fire(path, WatchEvent::Deleted);
        self.fire(parent_of(path), WatchEvent::ChildrenChanged);
    }

    fn check_session(&self, session: u64) -> Result<(), RegistryError> {
        match self.sessions.get(&session) {
            Some(s) if !s.expired => Ok(()),
            _ => Err(RegistryError::SessionExpired),
        }
    }
}

impl Default for MemoryCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryCoordinator {
    /// Creates an empty tree and a first session on it.
    pub fn new() -> Self {
        let shared = Arc::new(Shared {
            tree: Mutex::new(Tree::default()),
            next_session: AtomicU64::new(0),
        });
        Self::open(shared)
    }

    fn open(shared: Arc<Shared>) -> Self {
        let session = shared.next_session.fetch_add(1, Ordering::Relaxed);
        shared.tree.lock().unwrap_or_else(PoisonError::into_inner).sessions.insert(session, Session::new());
        Self { shared, session }
    }

    fn tree(&self) -> std::sync::MutexGuard<'_, Tree> {
        self.shared.tree.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Opens another session on the same tree.
    pub fn new_session(&self) -> Self {
        Self::open(self.shared.clone())
    }

    /// The session id of this handle.
    pub fn session_id(&self) -> u64 {
        self.session
    }

    /// Ends this session: its ephemeral nodes are deleted, watches on them fire and
    /// [`SessionState::Expired`] is published. Every operation fails with
    /// [`RegistryError::SessionExpired`] until [`MemoryCoordinator::restore_session`].
    pub fn expire_session(&self) {
        let mut tree = self.tree();
        let owned: Vec<String> = tree.nodes.iter().filter(|(_, owner)| **owner == Some(self.session)).map(|(path, _)| path.clone()).collect();
        debug!("[MESHCALL] memory session {} expired, dropping {} ephemeral node(s)", self.session, owned.len());
        for path in owned {
            tree.remove(&path);
        }
        if let Some(session) = tree.sessions.get_mut(&self.session) {
            session.expired = true;
            session.publish(SessionState::Expired);
        }
    }

    /// Reconnects this session and publishes [`SessionState::Connected`].
    pub fn restore_session(&self) {
        let mut tree = self.tree();
        if let Some(session) = tree.sessions.get_mut(&self.session) {
            session.expired = false;
            session.publish(SessionState::Connected);
        }
    }

    fn list_now(&self, path: &str) -> Result<(Vec<String>, Watch), RegistryError> {
        let mut tree = self.tree();
        tree.check_session(self.session)?;
        if !tree.exists(path) {
            return Err(RegistryError::NoNode(FastStr::new(path)));
        }
        let children = tree.children(path);
        let (tx, rx) = oneshot::channel();
        tree.watches.entry(path.to_owned()).or_default().push(tx);
        Ok((children, rx))
    }

    fn exists_now(&self, path: &str) -> Result<bool, RegistryError> {
        let tree = self.tree();
        tree.check_session(self.session)?;
        Ok(tree.exists(path))
    }

    fn create_now(&self, path: &str, mode: CreateMode) -> Result<(), RegistryError> {
        if !path.starts_with('/') || path == "/" || path.ends_with('/') {
            return Err(RegistryError::Backend(format!("invalid path `{path}`").into()));
        }
        let mut tree = self.tree();
        tree.check_session(self.session)?;
        if tree.exists(path) {
            return Err(RegistryError::NodeExists(FastStr::new(path)));
        }
        let parent = parent_of(path);
        if !tree.exists(parent) {
            return Err(RegistryError::NoNode(FastStr::new(parent)));
        }
        let owner = match mode {
            CreateMode::Persistent => None,
            CreateMode::Ephemeral => Some(self.session),
        };
        tree.nodes.insert(path.to_owned(), owner);
        tree.fire(path, WatchEvent::Created);
        tree.fire(parent, WatchEvent::ChildrenChanged);
        Ok(())
    }

    fn delete_now(&self, path: &str) -> Result<(), RegistryError> {
        let mut tree = self.tree();
        tree.check_session(self.session)?;
        if !tree.nodes.contains_key(path) {
            return Err(RegistryError::NoNode(FastStr::new(path)));
        }
        if !tree.children(path).is_empty() {
            return Err(RegistryError::NotEmpty(FastStr::new(path)));
        }
        tree.remove(path);
        Ok(())
    }
}

impl Coordinator for MemoryCoordinator {
    fn list_children<'a>(&'a self, path: &'a str) -> impl Future<Output = Result<(Vec<String>, Watch), RegistryError>> + Send + 'a {
        future::ready(self.list_now(path))
    }

    fn exists<'a>(&'a self, path: &'a str) -> impl Future<Output = Result<bool, RegistryError>> + Send + 'a {
        future::ready(self.exists_now(path))
    }

    fn create<'a>(&'a self, path: &'a str, mode: CreateMode) -> impl Future<Output = Result<(), RegistryError>> + Send + 'a {
        future::ready(self.create_now(path, mode))
    }

    fn delete<'a>(&'a self, path: &'a str) -> impl Future<Output = Result<(), RegistryError>> + Send + 'a {
        future::ready(self.delete_now(path))
    }

    fn session_events(&self) -> Option<Receiver<SessionState>> {
        self.tree().sessions.get(&self.session).map(|session| session.events.new_receiver())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[tokio::test]
    async fn create_list_delete() -> anyhow::Result<()> {
        let zk = MemoryCoordinator::new();
        assert_matches!(zk.create("/a/b", CreateMode::Persistent).await, Err(RegistryError::NoNode(_)));
        zk.ensure_path("/a/b").await?;
        zk.ensure_path("/a/b").await?;
        zk.create("/a/b/n1", CreateMode::Ephemeral).await?;
        zk.create("/a/b/n2", CreateMode::Persistent).await?;
        assert_matches!(zk.create("/a/b/n1", CreateMode::Ephemeral).await, Err(RegistryError::NodeExists(_)));

        let (mut children, _) = zk.list_children("/a/b").await?;
        children.sort();
        assert_eq!(children, ["n1", "n2"]);
        assert_eq!(zk.list_children("/a").await?.0, ["b"]);
        assert_matches!(zk.list_children("/x").await, Err(RegistryError::NoNode(_)));

        assert_matches!(zk.delete("/a/b").await, Err(RegistryError::NotEmpty(_)));
        zk.delete("/a/b/n1").await?;
        assert!(!zk.exists("/a/b/n1").await?);
        assert_matches!(zk.delete("/a/b/n1").await, Err(RegistryError::NoNode(_)));
        Ok(())
    }

    #[tokio::test]
    async fn watch_fires_once_per_arm() -> anyhow::Result<()> {
        let zk = MemoryCoordinator::new();
        zk.ensure_path("/svc").await?;
        let (_, watch) = zk.list_children("/svc").await?;
        zk.create("/svc/a", CreateMode::Ephemeral).await?;
        assert_eq!(watch.await?, WatchEvent::ChildrenChanged);

        let (_, mut watch) = zk.list_children("/svc").await?;
        assert!(watch.try_recv().is_err());
        zk.delete("/svc/a").await?;
        assert_eq!(watch.await?, WatchEvent::ChildrenChanged);
        Ok(())
    }

    #[tokio::test]
    async fn dropped_watches_and_absent_subscribers_are_tolerated() -> anyhow::Result<()> {
        let zk = MemoryCoordinator::new();
        zk.ensure_path("/svc").await?;
        let (_, watch) = zk.list_children("/svc").await?;
        drop(watch);
        zk.create("/svc/a", CreateMode::Ephemeral).await?;
        // nobody subscribed to session events
        zk.expire_session();
        zk.restore_session();
        let (children, watch) = zk.list_children("/svc").await?;
        assert!(children.is_empty());
        zk.create("/svc/b", CreateMode::Persistent).await?;
        assert_eq!(watch.await?, WatchEvent::ChildrenChanged);
        Ok(())
    }

    #[tokio::test]
    async fn expiry_drops_ephemeral_nodes_of_that_session_only() -> anyhow::Result<()> {
        let server = MemoryCoordinator::new();
        let observer = server.new_session();
        assert_ne!(server.session_id(), observer.session_id());
        server.ensure_path("/svc").await?;
        server.create("/svc/eph", CreateMode::Ephemeral).await?;
        observer.create("/svc/other", CreateMode::Ephemeral).await?;
        let mut events = server.session_events().expect("memory sessions report events");
        let (_, watch) = observer.list_children("/svc").await?;

        server.expire_session();
        assert_eq!(watch.await?, WatchEvent::ChildrenChanged);
        assert_eq!(observer.list_children("/svc").await?.0, ["other"]);
        assert!(observer.exists("/svc").await?);
        assert_eq!(events.recv().await?, SessionState::Expired);
        assert_matches!(server.exists("/svc").await, Err(RegistryError::SessionExpired));

        server.restore_session();
        assert_eq!(events.recv().await?, SessionState::Connected);
        assert!(server.exists("/svc").await?);
        Ok(())
    }
}
