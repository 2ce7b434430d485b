// Copyright Andeya Lee 2024
//
// Use of this source code is governed by an MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT.
//!
//! The invocation proxy: a per-service handle that dispatches calls by method name.
//!
//! Only connection acquisition is retried. Once a connection is in hand the call runs
//! exactly once and its outcome, success or failure, is what the caller sees.

use crate::client::discover::Discover;
use crate::client::factory::ClientFactory;
use crate::client::pool::KeyedPool;
use crate::client::service::{Args, Value};
use crate::client::ClientError;
use faststr::FastStr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{trace, warn};

/// Dispatches calls to one service over pooled connections.
pub struct ServiceProxy<D: Discover> {
    service: FastStr,
    pool: Arc<KeyedPool<ClientFactory<D>>>,
    retry: u32,
    retry_interval: Duration,
}

impl<D: Discover> Clone for ServiceProxy<D> {
    fn clone(&self) -> Self {
        Self {
            service: self.service.clone(),
            pool: self.pool.clone(),
            retry: self.retry,
            retry_interval: self.retry_interval,
        }
    }
}

impl<D: Discover> ServiceProxy<D> {
    /// Creates a proxy; `retry` is the total number of acquisition attempts and is at least 1.
    pub fn new(service: FastStr, pool: Arc<KeyedPool<ClientFactory<D>>>, retry: u32, retry_interval: Duration) -> Self {
        Self {
            service,
            pool,
            retry: retry.max(1),
            retry_interval,
        }
    }

    /// The service this proxy calls.
    pub fn service(&self) -> &FastStr {
        &self.service
    }

    /// Calls `method` with `args`.
    ///
    /// Borrowing a connection is attempted up to `retry` times, sleeping `retry_interval`
    /// between attempts; the last acquisition error is returned when every attempt fails.
    /// Borrow errors that are not [retryable](ClientError::is_retryable) end the call at once.
    /// After a successful borrow the connection is handed back to the pool whatever the
    /// call outcome, and the outcome is returned without retrying.
    pub async fn call(&self, method: &str, args: Args) -> Result<Value, ClientError> {
        let mut last_err = ClientError::NoNodesAvailable;
        for attempt in 1..=self.retry {
            match self.pool.borrow(&self.service).await {
                Ok(mut handle) => {
                    trace!("[MESHCALL] `{}.{method}` on {}", self.service, handle.node().host_port());
                    let result = handle.invoke(method, args).await;
                    self.pool.release(handle).await;
                    return result;
                },
                Err(err) if !err.is_retryable() => return Err(err),
                Err(err) => {
                    warn!("[MESHCALL] `{}.{method}` attempt {attempt}/{} failed to get a connection: {err}", self.service, self.retry);
                    last_err = err;
                    if attempt < self.retry {
                        tokio::time::sleep(self.retry_interval).await;
                    }
                },
            }
        }
        Err(last_err)
    }
}
