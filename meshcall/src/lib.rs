// Copyright Andeya Lee 2024
//
// Use of this source code is governed by an MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT.
//!
//! meshcall is a client runtime that turns a set of dynamically discovered, weighted
//! server nodes into a pool of ready-to-use connections and a load-balanced, retrying
//! invocation path for remote calls.
//!
//! The pieces, leaves first:
//! - [`client::discover::Node`]: one addressable server replica with a relative weight.
//! - [`client::balance`]: random and round-robin selection over the live node set.
//! - [`client::factory::ClientFactory`]: opens one connection to a selected node.
//! - [`client::pool::KeyedPool`]: caches idle connections per service key.
//! - [`client::discover::RegistryDiscover`]: keeps the balancer and pool in sync with a [`registry::Coordinator`].
//! - [`client::proxy::ServiceProxy`]: borrows, invokes by method name, returns, retries.
#![deny(missing_docs)]
#![allow(clippy::type_complexity)]
#![cfg_attr(docsrs, feature(doc_cfg))]

pub mod client;
pub mod net;
pub mod registry;
pub mod server;

#[doc(hidden)]
pub use ::serde_json;
pub use client::service::{Args, Value};
pub use client::{Client, ClientError, Request};

/// Builds an [`Args`] list from values accepted by [`serde_json::json!`].
///
/// # Example:
/// ```
/// let args = meshcall::args!["110", "hello, world", 3];
/// assert_eq!(args.len(), 3);
/// ```
#[macro_export]
macro_rules! args {
    ($($arg:expr),* $(,)?) => {
        $crate::Args::from(::std::vec![$($crate::serde_json::json!($arg)),*])
    };
}
