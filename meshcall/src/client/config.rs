// Copyright Andeya Lee 2024
//
// Use of this source code is governed by an MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT.
//! Client and pool settings.

use std::time::Duration;

/// Default number of attempts per call.
pub const DEFAULT_RETRY: u32 = 3;
/// Default sleep between attempts.
pub const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_millis(200);
/// Default maximum number of live connections per key.
pub const DEFAULT_POOL_MAX_SIZE: usize = 8;
/// Default checked-out budget per key.
pub const DEFAULT_POOL_MAX_ACTIVE_SIZE: usize = 4;
/// Default time a borrower waits for a connection.
pub const DEFAULT_POOL_WAIT_TIMEOUT: Duration = Duration::from_millis(10000);

/// Settings that control the keyed connection pool.
#[derive(Clone, Debug, PartialEq, Eq)]
#[non_exhaustive]
pub struct PoolConfig {
    /// Maximum number of live connections per key.
    /// Default is 8.
    pub max_size: usize,
    /// A returned connection goes back to the idle queue only while the key's
    /// checked-out count stays within this budget; otherwise it is destroyed.
    /// Default is 4.
    pub max_active_size: usize,
    /// How long `borrow` waits for a connection once `max_size` is reached.
    /// Default is 10s.
    pub wait_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_size: DEFAULT_POOL_MAX_SIZE,
            max_active_size: DEFAULT_POOL_MAX_ACTIVE_SIZE,
            wait_timeout: DEFAULT_POOL_WAIT_TIMEOUT,
        }
    }
}

impl PoolConfig {
    /// Set maximum number of live connections per key, zero means 8.
    pub fn with_max_size(mut self, max_size: usize) -> Self {
        self.max_size = if max_size == 0 { DEFAULT_POOL_MAX_SIZE } else { max_size };
        self
    }
    /// Set the checked-out budget per key, zero means 4.
    pub fn with_max_active_size(mut self, max_active_size: usize) -> Self {
        self.max_active_size = if max_active_size == 0 { DEFAULT_POOL_MAX_ACTIVE_SIZE } else { max_active_size };
        self
    }
    /// Set the borrow wait timeout, zero means 10s.
    pub fn with_wait_timeout(mut self, wait_timeout: Duration) -> Self {
        self.wait_timeout = if wait_timeout.is_zero() { DEFAULT_POOL_WAIT_TIMEOUT } else { wait_timeout };
        self
    }
}

/// Settings that control the behavior of the client.
#[derive(Clone, Debug, PartialEq, Eq)]
#[non_exhaustive]
pub struct ClientConfig {
    /// Number of attempts per call; only connection-acquisition failures are retried.
    /// Default is 3.
    pub retry: u32,
    /// Fixed sleep between attempts.
    /// Default is 200ms.
    pub retry_interval: Duration,
    /// Settings of the shared connection pool.
    pub pool: PoolConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            retry: DEFAULT_RETRY,
            retry_interval: DEFAULT_RETRY_INTERVAL,
            pool: PoolConfig::default(),
        }
    }
}

impl ClientConfig {
    /// Set the number of attempts per call, zero means 3.
    pub fn with_retry(mut self, retry: u32) -> Self {
        self.retry = if retry == 0 { DEFAULT_RETRY } else { retry };
        self
    }
    /// Set the sleep between attempts, zero means 200ms.
    pub fn with_retry_interval(mut self, retry_interval: Duration) -> Self {
        self.retry_interval = if retry_interval.is_zero() { DEFAULT_RETRY_INTERVAL } else { retry_interval };
        self
    }
    /// Set the pool settings.
    pub fn with_pool(mut self, pool: PoolConfig) -> Self {
        self.pool = pool;
        self
    }
}
