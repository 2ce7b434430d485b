// Copyright Andeya Lee 2024
//
// Use of this source code is governed by an MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT.
//!
//! Server component: announces a server node to the coordination service.
//!
//! A server registers one ephemeral leaf `address:port:weight` under its [`ServicePath`].
//! The leaf disappears with the server's session; [`Registrar::spawn_keepalive`] puts it
//! back whenever the session reconnects.

use crate::client::discover::{Node, DEFAULT_WEIGHT, MAX_WEIGHT};
use crate::net::local_ip;
use crate::registry::{Coordinator, CreateMode, RegistryError, ServicePath, SessionState};
use async_broadcast::RecvError;
use faststr::FastStr;
use std::net::IpAddr;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Port registered when none is configured.
pub const DEFAULT_PORT: u16 = 3068;

/// Registration config.
#[derive(Clone, Debug, PartialEq, Eq)]
#[non_exhaustive]
pub struct RegisterConfig {
    /// Where the leaf is created.
    pub(crate) path: ServicePath,
    /// Registered address, default is the detected local IPv4.
    pub(crate) ip: Option<IpAddr>,
    /// Registered port, default is 3068.
    pub(crate) port: u16,
    /// Registered weight, default is 1.
    pub(crate) weight: u32,
}

impl Default for RegisterConfig {
    fn default() -> Self {
        Self {
            path: ServicePath::default(),
            ip: None,
            port: DEFAULT_PORT,
            weight: DEFAULT_WEIGHT,
        }
    }
}

impl RegisterConfig {
    /// Set the registration path layout.
    pub fn with_path(mut self, path: ServicePath) -> Self {
        self.path = path;
        self
    }
    /// Set the version segment, empty means "1.0.0".
    pub fn with_version(mut self, version: impl Into<FastStr>) -> Self {
        self.path = self.path.with_version(version);
        self
    }
    /// Set the registered address, default is the detected local IPv4.
    pub fn with_ip(mut self, ip: IpAddr) -> Self {
        self.ip = Some(ip);
        self
    }
    /// Set the registered port, zero means 3068.
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = if port == 0 { DEFAULT_PORT } else { port };
        self
    }
    /// Set the registered weight, zero means 1, capped at 100.
    pub fn with_weight(mut self, weight: u32) -> Self {
        self.weight = if weight == 0 { DEFAULT_WEIGHT } else { weight.min(MAX_WEIGHT) };
        self
    }
    /// The registration path layout.
    pub fn path(&self) -> &ServicePath {
        &self.path
    }
    /// The registered port.
    pub fn port(&self) -> u16 {
        self.port
    }
    /// The registered weight.
    pub fn weight(&self) -> u32 {
        self.weight
    }
}

/// Registers a server node and keeps it registered.
pub struct Registrar<C: Coordinator> {
    coordinator: Arc<C>,
    config: RegisterConfig,
    registered: Mutex<Option<String>>,
    cancel: CancellationToken,
}

impl<C: Coordinator> Registrar<C> {
    /// Creates a registrar; nothing is registered until [`Registrar::register`].
    pub fn new(coordinator: C, config: RegisterConfig) -> Self {
        Self {
            coordinator: Arc::new(coordinator),
            config,
            registered: Mutex::new(None),
            cancel: CancellationToken::new(),
        }
    }

    /// The node this server announces, with the IP resolved now.
    pub fn node(&self) -> Node {
        let ip = self.config.ip.unwrap_or_else(local_ip);
        Node::new(ip.to_string(), self.config.port, self.config.weight)
    }

    /// Creates the ephemeral leaf if it does not exist and returns its path.
    ///
    /// Missing ancestors are created first. A leaf registered earlier under another
    /// address, because the local IP changed, is deleted.
    pub async fn register(&self) -> Result<String, RegistryError> {
        self.coordinator.ensure_path(&self.config.path.parent()).await?;
        let leaf = self.config.path.leaf(&self.node());
        let mut registered = self.registered.lock().await;
        if let Some(previous) = registered.as_deref().filter(|previous| *previous != leaf) {
            info!("[MESHCALL] local address changed, removing `{previous}`");
            match self.coordinator.delete(previous).await {
                Ok(()) | Err(RegistryError::NoNode(_)) => {},
                Err(err) => return Err(err),
            }
        }
        if !self.coordinator.exists(&leaf).await? {
            match self.coordinator.create(&leaf, CreateMode::Ephemeral).await {
                Ok(()) | Err(RegistryError::NodeExists(_)) => {},
                Err(err) => return Err(err),
            }
            info!("[MESHCALL] registered `{leaf}`");
        }
        *registered = Some(leaf.clone());
        Ok(leaf)
    }

    /// Deletes the leaf created by the last [`Registrar::register`].
    pub async fn deregister(&self) -> Result<(), RegistryError> {
        let Some(leaf) = self.registered.lock().await.take() else {
            return Ok(());
        };
        match self.coordinator.delete(&leaf).await {
            Ok(()) | Err(RegistryError::NoNode(_)) => {
                info!("[MESHCALL] deregistered `{leaf}`");
                Ok(())
            },
            Err(err) => Err(err),
        }
    }

    /// Re-registers on every [`SessionState::Connected`] event until [`Registrar::stop`].
    ///
    /// Returns `None` when the coordinator reports no session events.
    pub fn spawn_keepalive(self: &Arc<Self>) -> Option<JoinHandle<()>> {
        let mut events = self.coordinator.session_events()?;
        let this = Arc::downgrade(self);
        let cancel = self.cancel.clone();
        Some(tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    _ = cancel.cancelled() => return,
                    event = events.recv() => event,
                };
                match event {
                    Ok(SessionState::Connected) => {
                        let Some(registrar) = this.upgrade() else { return };
                        if let Err(err) = registrar.register().await {
                            warn!("[MESHCALL] re-registration failed: {err}");
                        }
                    },
                    Ok(state) => debug!("[MESHCALL] registry session {state:?}"),
                    Err(RecvError::Overflowed(skipped)) => warn!("[MESHCALL] missed {skipped} session event(s)"),
                    Err(RecvError::Closed) => return,
                }
            }
        }))
    }

    /// Stops the keepalive task.
    pub fn stop(&self) {
        self.cancel.cancel();
    }
}

impl<C: Coordinator> Drop for Registrar<C> {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
