// Copyright Andeya Lee 2024
//
// Use of this source code is governed by an MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT.
//!
//! Service discovery based on a coordination service.

use super::{Discover, Discovery, Node};
use crate::client::balance::{LoadBalance, LoadBalanceKind};
use crate::client::pool::Invalidate;
use crate::client::ClientError;
use crate::registry::{Coordinator, ServicePath, Watch};
use async_broadcast::{broadcast, InactiveReceiver, Receiver, Sender, TrySendError};
use faststr::FastStr;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

/// Default period between listings while the registry path cannot be listed.
pub const DEFAULT_WATCH_RETRY_INTERVAL: Duration = Duration::from_millis(1000);

const DISCOVERY_CHANNEL_CAPACITY: usize = 16;

/// [`RegistryDiscover`] keeps the live node set in sync with the children of a registration path.
///
/// Every refresh lists the path, parses each child as `address:port[:weight]`, replaces the
/// live set, reseeds the load balancer, invalidates the connection pool and re-arms a
/// one-shot watch. The whole sequence, listing included, runs under one lock;
/// [`Discover::select`] never takes it, and only ever sees a balancer before or after a reseed.
pub struct RegistryDiscover<C: Coordinator> {
    coordinator: Arc<C>,
    path: FastStr,
    balance: Arc<dyn LoadBalance>,
    history_balance: Arc<dyn LoadBalance>,
    state: Mutex<State>,
    invalidator: OnceLock<Weak<dyn Invalidate>>,
    sender: Sender<Discovery>,
    _receiver: InactiveReceiver<Discovery>,
    started: AtomicBool,
    cancel: CancellationToken,
    watch_retry_interval: Duration,
    history_fallback: bool,
}

#[derive(Default)]
struct State {
    live: Vec<Arc<Node>>,
    history: HashMap<String, Arc<Node>>,
}

impl<C: Coordinator> RegistryDiscover<C> {
    /// Creates a provider watching `path.parent()` and balancing with `kind`.
    pub fn new(coordinator: C, path: &ServicePath, kind: LoadBalanceKind) -> Self {
        let (mut sender, receiver) = broadcast(DISCOVERY_CHANNEL_CAPACITY);
        sender.set_overflow(true);
        Self {
            coordinator: Arc::new(coordinator),
            path: path.parent().into(),
            balance: kind.build(),
            history_balance: kind.build(),
            state: Mutex::new(State::default()),
            invalidator: OnceLock::new(),
            sender,
            _receiver: receiver.deactivate(),
            started: AtomicBool::new(false),
            cancel: CancellationToken::new(),
            watch_retry_interval: DEFAULT_WATCH_RETRY_INTERVAL,
            history_fallback: false,
        }
    }

    /// Set the period between listings after a failed one, zero means 1s.
    pub fn with_watch_retry_interval(mut self, interval: Duration) -> Self {
        self.watch_retry_interval = if interval.is_zero() { DEFAULT_WATCH_RETRY_INTERVAL } else { interval };
        self
    }

    /// Whether [`Discover::select`] falls back to every node ever observed while the live set is empty.
    pub fn with_history_fallback(mut self, enabled: bool) -> Self {
        self.history_fallback = enabled;
        self
    }

    /// The watched registration path.
    pub fn path(&self) -> &FastStr {
        &self.path
    }

    /// The coordination service.
    pub fn coordinator(&self) -> &Arc<C> {
        &self.coordinator
    }

    /// Lists the registration path, applies the result and returns the re-armed watch.
    ///
    /// Concurrent refreshes are serialized from the listing on, so a slow listing can never
    /// overwrite the result of a later one.
    pub async fn refresh(&self) -> Result<Watch, ClientError> {
        let mut state = self.state.lock().await;
        let (children, watch) = self.coordinator.list_children(&self.path).await?;
        let nodes = children
            .iter()
            .filter_map(|entry| match entry.parse::<Node>() {
                Ok(node) => Some(Arc::new(node)),
                Err(err) => {
                    warn!("[MESHCALL] skipping registry entry under `{}`: {err}", self.path);
                    None
                },
            })
            .collect::<Vec<_>>();
        self.apply(&mut state, nodes).await;
        Ok(watch)
    }

    async fn apply(&self, state: &mut State, nodes: Vec<Arc<Node>>) {
        self.balance.set_nodes(&nodes);
        if self.history_fallback {
            for node in &nodes {
                state.history.insert(node.host_port(), node.clone());
            }
            let history = state.history.values().cloned().collect::<Vec<_>>();
            self.history_balance.set_nodes(&history);
        }
        state.live = nodes.clone();
        if let Some(pool) = self.invalidator.get().and_then(Weak::upgrade) {
            pool.invalidate().await;
        }
        info!("[MESHCALL] `{}` now has {} live node(s)", self.path, nodes.len());
        match self.sender.try_broadcast(Discovery { key: self.path.clone(), nodes }) {
            Ok(_) | Err(TrySendError::Inactive(_)) => {},
            Err(TrySendError::Closed(_)) => trace!("[MESHCALL] discovery channel of `{}` is closed", self.path),
            Err(TrySendError::Full(_)) => trace!("[MESHCALL] discovery channel of `{}` is full", self.path),
        }
    }

    async fn watch_loop(this: Weak<Self>, cancel: CancellationToken, mut watch: Option<Watch>, retry_interval: Duration) {
        loop {
            let event = match watch.take() {
                Some(watch) => tokio::select! {
                    _ = cancel.cancelled() => return,
                    event = watch => event.ok(),
                },
                None => None,
            };
            if event.is_none() {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = tokio::time::sleep(retry_interval) => {},
                }
            }
            let Some(discover) = this.upgrade() else { return };
            match event {
                Some(event) => info!("[MESHCALL] `{}` {event}, refreshing", discover.path),
                None => debug!("[MESHCALL] re-listing `{}`", discover.path),
            }
            watch = match discover.refresh().await {
                Ok(watch) => Some(watch),
                Err(err) => {
                    warn!("[MESHCALL] watching `{}` failed, retrying in {retry_interval:?}: {err}", discover.path);
                    None
                },
            };
        }
    }
}

impl<C: Coordinator> Discover for RegistryDiscover<C> {
    fn select(&self) -> Result<Arc<Node>, ClientError> {
        match self.balance.get_node() {
            Err(ClientError::NoNodesAvailable) if self.history_fallback => {
                debug!("[MESHCALL] `{}` has no live node, falling back to history", self.path);
                self.history_balance.get_node()
            },
            selected => selected,
        }
    }

    fn nodes(&self) -> impl Future<Output = Vec<Arc<Node>>> + Send {
        async move { self.state.lock().await.live.clone() }
    }

    fn set_invalidator(&self, invalidator: Weak<dyn Invalidate>) {
        if self.invalidator.set(invalidator).is_err() {
            warn!("[MESHCALL] `{}` already has a pool to invalidate", self.path);
        }
    }

    fn start(self: Arc<Self>) -> impl Future<Output = ()> + Send {
        async move {
            if self.started.swap(true, Ordering::AcqRel) {
                return;
            }
            let watch = match self.refresh().await {
                Ok(watch) => Some(watch),
                Err(err) => {
                    warn!("[MESHCALL] initial listing of `{}` failed: {err}", self.path);
                    None
                },
            };
            tokio::spawn(Self::watch_loop(Arc::downgrade(&self), self.cancel.clone(), watch, self.watch_retry_interval));
        }
    }

    fn stop(&self) {
        self.cancel.cancel();
    }

    fn watch(&self) -> Option<Receiver<Discovery>> {
        Some(self.sender.new_receiver())
    }
}

impl<C: Coordinator> Drop for RegistryDiscover<C> {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{CreateMode, MemoryCoordinator, RegistryError};

    async fn seeded() -> anyhow::Result<(MemoryCoordinator, ServicePath)> {
        let zk = MemoryCoordinator::new();
        let path = ServicePath::default();
        zk.ensure_path(&path.parent()).await?;
        Ok((zk, path))
    }

    /// Holds on to the result of its first listing for a while before handing it over.
    struct Stalling {
        inner: MemoryCoordinator,
        stalled: AtomicBool,
    }

    impl Coordinator for Stalling {
        fn list_children<'a>(&'a self, path: &'a str) -> impl Future<Output = Result<(Vec<String>, Watch), RegistryError>> + Send + 'a {
            async move {
                let listed = self.inner.list_children(path).await;
                if !self.stalled.swap(true, Ordering::SeqCst) {
                    tokio::time::sleep(Duration::from_millis(200)).await;
                }
                listed
            }
        }

        fn exists<'a>(&'a self, path: &'a str) -> impl Future<Output = Result<bool, RegistryError>> + Send + 'a {
            self.inner.exists(path)
        }

        fn create<'a>(&'a self, path: &'a str, mode: CreateMode) -> impl Future<Output = Result<(), RegistryError>> + Send + 'a {
            self.inner.create(path, mode)
        }

        fn delete<'a>(&'a self, path: &'a str) -> impl Future<Output = Result<(), RegistryError>> + Send + 'a {
            self.inner.delete(path)
        }
    }

    #[tokio::test(start_paused = true)]
    async fn slow_listing_never_overwrites_a_later_one() -> anyhow::Result<()> {
        let (zk, path) = seeded().await?;
        let departed = path.leaf(&Node::new("10.0.0.1", 9000, 1));
        zk.create(&departed, CreateMode::Ephemeral).await?;
        let coordinator = Stalling {
            inner: zk.clone(),
            stalled: AtomicBool::new(false),
        };
        let discover = Arc::new(RegistryDiscover::new(coordinator, &path, LoadBalanceKind::RoundRobin));

        let slow = tokio::spawn({
            let discover = discover.clone();
            async move { discover.refresh().await.map(drop) }
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        zk.delete(&departed).await?;
        zk.create(&path.leaf(&Node::new("10.0.0.2", 9000, 1)), CreateMode::Ephemeral).await?;
        discover.refresh().await?;
        slow.await??;

        assert_eq!(discover.nodes().await, vec![Arc::new(Node::new("10.0.0.2", 9000, 1))]);
        assert_eq!(discover.select()?.address.as_str(), "10.0.0.2");
        Ok(())
    }

    #[tokio::test]
    async fn refresh_skips_malformed_entries() -> anyhow::Result<()> {
        let (zk, path) = seeded().await?;
        zk.create(&path.leaf(&Node::new("10.0.0.1", 9000, 2)), CreateMode::Ephemeral).await?;
        zk.create(&format!("{}/garbage", path.parent()), CreateMode::Ephemeral).await?;
        let discover = RegistryDiscover::new(zk, &path, LoadBalanceKind::Random);
        assert_eq!(discover.select(), Err(ClientError::NoNodesAvailable));
        discover.refresh().await?;
        assert_eq!(discover.nodes().await, vec![Arc::new(Node::new("10.0.0.1", 9000, 2))]);
        assert_eq!(discover.select()?.port, 9000);
        Ok(())
    }

    #[tokio::test]
    async fn history_fallback_serves_departed_nodes() -> anyhow::Result<()> {
        let (zk, path) = seeded().await?;
        let leaf = path.leaf(&Node::new("10.0.0.1", 9000, 1));
        zk.create(&leaf, CreateMode::Ephemeral).await?;
        let strict = RegistryDiscover::new(zk.clone(), &path, LoadBalanceKind::Random);
        let lenient = RegistryDiscover::new(zk.clone(), &path, LoadBalanceKind::Random).with_history_fallback(true);
        strict.refresh().await?;
        lenient.refresh().await?;

        zk.delete(&leaf).await?;
        strict.refresh().await?;
        lenient.refresh().await?;
        assert!(lenient.nodes().await.is_empty());
        assert_eq!(strict.select(), Err(ClientError::NoNodesAvailable));
        assert_eq!(lenient.select()?.address.as_str(), "10.0.0.1");
        Ok(())
    }

    #[tokio::test]
    async fn listing_failure_surfaces_as_discovery_error() -> anyhow::Result<()> {
        let zk = MemoryCoordinator::new();
        let discover = RegistryDiscover::new(zk, &ServicePath::default(), LoadBalanceKind::RoundRobin);
        assert!(matches!(discover.refresh().await, Err(ClientError::DiscoveryWatch(_))));
        Ok(())
    }
}
