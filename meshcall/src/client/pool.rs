// Copyright Andeya Lee 2024
//
// Use of this source code is governed by an MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT.
//!
//! A keyed pool of connections.
//!
//! Every key owns a block: a queue of idle entries plus a live count of every entry the
//! block created that has not been destroyed yet. For every key, at any time:
//!
//! - `live <= max_size`
//! - `idle <= live`
//! - checked-out entries are `live - idle`
//!
//! A borrower waiting for capacity parks on the block's [`Notify`] until an entry is
//! returned, destroyed or the block is cleared, or until the wait timeout expires.

use crate::client::config::PoolConfig;
use crate::client::ClientError;
use dashmap::DashMap;
use faststr::FastStr;
use futures::future::BoxFuture;
use std::collections::VecDeque;
use std::fmt;
use std::future::Future;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use tokio::sync::{Mutex, Notify};
use tokio::time::{timeout_at, Instant};
use tracing::{debug, info, trace};

/// Creates and closes the entries a [`KeyedPool`] caches.
pub trait Factory: Send + Sync + 'static {
    /// The pooled resource, typically one live connection.
    type Entry: Send + 'static;
    /// Creates a fresh entry for `key`.
    fn create<'a>(&'a self, key: &'a str) -> impl Future<Output = Result<Self::Entry, ClientError>> + Send + 'a;
    /// Closes an entry. The pool runs the returned future on a background task.
    fn destroy(entry: Self::Entry) -> impl Future<Output = ()> + Send + 'static;
}

/// Something that drops every cached resource when cluster membership changes.
pub trait Invalidate: Send + Sync + 'static {
    /// Drops every cached resource.
    fn invalidate(&self) -> BoxFuture<'_, ()>;
}

/// A snapshot of one key's accounting.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Entries created and not yet destroyed.
    pub live: usize,
    /// Entries sitting in the idle queue.
    pub idle: usize,
}

impl PoolStats {
    /// Entries currently held by borrowers.
    pub fn checked_out(&self) -> usize {
        self.live - self.idle
    }
}

struct Block<T> {
    state: Mutex<BlockState<T>>,
    available: Notify,
}

struct BlockState<T> {
    idle: VecDeque<T>,
    live: usize,
    generation: u64,
}

impl<T> Block<T> {
    fn new() -> Self {
        Self {
            state: Mutex::new(BlockState {
                idle: VecDeque::new(),
                live: 0,
                generation: 0,
            }),
            available: Notify::new(),
        }
    }

    /// Forgets one live entry of `generation`; entries from before the last clear are not counted anymore.
    async fn forget(&self, generation: u64) {
        let mut state = self.state.lock().await;
        if state.generation == generation && state.live > 0 {
            state.live -= 1;
        }
        drop(state);
        self.available.notify_one();
    }
}

/// A checked-out entry.
///
/// Hand it back with [`KeyedPool::release`] or [`KeyedPool::destroy`]. An entry dropped
/// otherwise, for example by a cancelled call, is destroyed on a background task.
pub struct Pooled<F: Factory> {
    entry: Option<F::Entry>,
    key: FastStr,
    generation: u64,
    block: Arc<Block<F::Entry>>,
}

impl<F: Factory> Pooled<F> {
    /// The key this entry was borrowed for.
    pub fn key(&self) -> &FastStr {
        &self.key
    }

    fn take(&mut self) -> Option<F::Entry> {
        self.entry.take()
    }
}

impl<F: Factory> Deref for Pooled<F> {
    type Target = F::Entry;

    fn deref(&self) -> &Self::Target {
        self.entry.as_ref().expect("pooled entry is present until handed back")
    }
}

impl<F: Factory> DerefMut for Pooled<F> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.entry.as_mut().expect("pooled entry is present until handed back")
    }
}

impl<F: Factory> fmt::Debug for Pooled<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pooled").field("key", &self.key).field("generation", &self.generation).finish()
    }
}

impl<F: Factory> Drop for Pooled<F> {
    fn drop(&mut self) {
        let Some(entry) = self.entry.take() else { return };
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                debug!("[MESHCALL] pooled entry for `{}` dropped without release, destroying it", self.key);
                let block = self.block.clone();
                let generation = self.generation;
                runtime.spawn(async move {
                    block.forget(generation).await;
                    F::destroy(entry).await;
                });
            },
            Err(_) => drop(entry),
        }
    }
}

/// A pool of entries segmented by key.
pub struct KeyedPool<F: Factory> {
    factory: F,
    config: PoolConfig,
    blocks: DashMap<FastStr, Arc<Block<F::Entry>>>,
}

impl<F: Factory> KeyedPool<F> {
    /// Creates an empty pool.
    pub fn new(factory: F, config: PoolConfig) -> Self {
        Self {
            factory,
            config,
            blocks: DashMap::new(),
        }
    }

    /// The pool settings.
    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// The entry factory.
    pub fn factory(&self) -> &F {
        &self.factory
    }

    fn block(&self, key: &str) -> Arc<Block<F::Entry>> {
        if let Some(block) = self.blocks.get(key) {
            return block.clone();
        }
        self.blocks.entry(FastStr::new(key)).or_insert_with(|| Arc::new(Block::new())).clone()
    }

    /// Borrows an entry for `key`.
    ///
    /// Pops an idle entry if there is one; otherwise creates a fresh entry while the key's
    /// live count is below `max_size`; otherwise waits up to `wait_timeout` for capacity and
    /// fails with [`ClientError::PoolExhausted`]. Creation runs while the key's block is
    /// locked, so cold starts for one key are serialized. Factory errors are returned as is.
    pub async fn borrow(&self, key: &str) -> Result<Pooled<F>, ClientError> {
        let block = self.block(key);
        let deadline = Instant::now() + self.config.wait_timeout;
        loop {
            let notified = block.available.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let mut state = block.state.lock().await;
                if let Some(entry) = state.idle.pop_front() {
                    trace!("[MESHCALL] reuse idle entry for `{key}`");
                    return Ok(self.checked_out(key, entry, state.generation, &block));
                }
                if state.live < self.config.max_size {
                    let entry = self.factory.create(key).await?;
                    state.live += 1;
                    trace!("[MESHCALL] created entry for `{key}`, live={}", state.live);
                    return Ok(self.checked_out(key, entry, state.generation, &block));
                }
            }
            if timeout_at(deadline, notified).await.is_err() {
                return Err(ClientError::PoolExhausted {
                    key: FastStr::new(key),
                    timeout: self.config.wait_timeout,
                });
            }
        }
    }

    fn checked_out(&self, key: &str, entry: F::Entry, generation: u64, block: &Arc<Block<F::Entry>>) -> Pooled<F> {
        Pooled {
            entry: Some(entry),
            key: FastStr::new(key),
            generation,
            block: block.clone(),
        }
    }

    /// Hands an entry back.
    ///
    /// The entry goes back to the idle queue if the key's checked-out count stays within
    /// `max_active_size` afterwards; otherwise it is destroyed. Entries borrowed before the
    /// last [`KeyedPool::clear`] are always closed.
    pub async fn release(&self, mut pooled: Pooled<F>) {
        let Some(entry) = pooled.take() else { return };
        let block = pooled.block.clone();
        let mut state = block.state.lock().await;
        if state.generation != pooled.generation {
            drop(state);
            trace!("[MESHCALL] closing entry for `{}` borrowed before the last clear", pooled.key);
            tokio::spawn(F::destroy(entry));
            return;
        }
        let checked_out_after = state.live.saturating_sub(state.idle.len() + 1);
        if checked_out_after <= self.config.max_active_size {
            state.idle.push_back(entry);
            drop(state);
            block.available.notify_one();
        } else {
            state.live = state.live.saturating_sub(1);
            drop(state);
            debug!("[MESHCALL] `{}` is over its active budget, destroying returned entry", pooled.key);
            block.available.notify_one();
            tokio::spawn(F::destroy(entry));
        }
    }

    /// Closes an entry in the background and frees its slot.
    pub async fn destroy(&self, mut pooled: Pooled<F>) {
        let Some(entry) = pooled.take() else { return };
        pooled.block.forget(pooled.generation).await;
        tokio::spawn(F::destroy(entry));
    }

    /// Closes every idle entry of every key in the background and resets every live count to 0.
    ///
    /// Entries checked out at that moment stay valid for their borrowers but are closed
    /// when handed back.
    pub async fn clear(&self) {
        let blocks: Vec<_> = self.blocks.iter().map(|block| block.value().clone()).collect();
        let mut closed = 0usize;
        for block in blocks {
            let mut state = block.state.lock().await;
            let idle = std::mem::take(&mut state.idle);
            state.live = 0;
            state.generation = state.generation.wrapping_add(1);
            drop(state);
            closed += idle.len();
            for entry in idle {
                tokio::spawn(F::destroy(entry));
            }
            block.available.notify_waiters();
        }
        info!("[MESHCALL] client pool cleared, {closed} idle connection(s) closed");
    }

    /// Returns the accounting of one key.
    pub async fn stats(&self, key: &str) -> PoolStats {
        let Some(block) = self.blocks.get(key).map(|block| block.value().clone()) else {
            return PoolStats::default();
        };
        let state = block.state.lock().await;
        PoolStats {
            live: state.live,
            idle: state.idle.len(),
        }
    }
}

impl<F: Factory> Invalidate for KeyedPool<F> {
    fn invalidate(&self) -> BoxFuture<'_, ()> {
        Box::pin(self.clear())
    }
}
