// Copyright 2024 RustFS Team
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::{LockError, Result};

/// Environment variable overriding [`LockConfig::grace_period`] (milliseconds)
pub const ENV_GRACE_PERIOD_MS: &str = "TURNSTILE_LOCK_GRACE_PERIOD_MS";
/// Environment variable overriding [`LockConfig::retry_interval`] (milliseconds)
pub const ENV_RETRY_INTERVAL_MS: &str = "TURNSTILE_LOCK_RETRY_INTERVAL_MS";
/// Environment variable overriding [`LeaseConfig::ttl`] (milliseconds)
pub const ENV_LEASE_TTL_MS: &str = "TURNSTILE_LOCK_LEASE_TTL_MS";
/// Environment variable overriding [`LeaseConfig::renew_interval`] (milliseconds)
pub const ENV_LEASE_RENEW_INTERVAL_MS: &str = "TURNSTILE_LOCK_LEASE_RENEW_INTERVAL_MS";
/// Environment variable overriding [`QueueConfig::root`]
pub const ENV_QUEUE_ROOT: &str = "TURNSTILE_LOCK_QUEUE_ROOT";

/// Lock manager configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockConfig {
    /// How long an idle, unreferenced entry stays cached after its last release
    #[serde(default = "default_grace_period")]
    pub grace_period: Duration,

    /// Backoff before retrying an acquisition whose handle vanished; also the first lease poll delay
    #[serde(default = "default_retry_interval")]
    pub retry_interval: Duration,

    /// Lease backend configuration
    #[serde(default)]
    pub lease: LeaseConfig,

    /// Queue backend configuration
    #[serde(default)]
    pub queue: QueueConfig,
}

/// Lease backend configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeaseConfig {
    /// Lease time-to-live in the store
    #[serde(default = "default_lease_ttl")]
    pub ttl: Duration,

    /// Heartbeat period of the lease observer
    #[serde(default = "default_renew_interval")]
    pub renew_interval: Duration,

    /// Upper bound of the contention poll backoff
    #[serde(default = "default_max_poll_interval")]
    pub max_poll_interval: Duration,

    /// Prefix of every lease key written to the store
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,
}

/// Queue backend configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Parent node under which waiters create their sequential nodes
    #[serde(default = "default_queue_root")]
    pub root: String,

    /// Reserved token between key and sequence in node names
    #[serde(default = "default_separator")]
    pub separator: String,

    /// How often the observer verifies that held nodes still exist
    #[serde(default = "default_check_interval")]
    pub check_interval: Duration,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            grace_period: default_grace_period(),
            retry_interval: default_retry_interval(),
            lease: LeaseConfig::default(),
            queue: QueueConfig::default(),
        }
    }
}

impl Default for LeaseConfig {
    fn default() -> Self {
        Self {
            ttl: default_lease_ttl(),
            renew_interval: default_renew_interval(),
            max_poll_interval: default_max_poll_interval(),
            key_prefix: default_key_prefix(),
        }
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            root: default_queue_root(),
            separator: default_separator(),
            check_interval: default_check_interval(),
        }
    }
}

// Default value functions
fn default_grace_period() -> Duration {
    Duration::from_secs(30)
}

fn default_retry_interval() -> Duration {
    Duration::from_millis(50)
}

fn default_lease_ttl() -> Duration {
    Duration::from_secs(10)
}

fn default_renew_interval() -> Duration {
    Duration::from_secs(3)
}

fn default_max_poll_interval() -> Duration {
    Duration::from_secs(1)
}

fn default_key_prefix() -> String {
    "lock".to_string()
}

fn default_queue_root() -> String {
    "/locks".to_string()
}

fn default_separator() -> String {
    "_lock_".to_string()
}

fn default_check_interval() -> Duration {
    Duration::from_secs(5)
}

impl LockConfig {
    /// Short timings for tests and single-process tools
    pub fn minimal() -> Self {
        Self {
            grace_period: Duration::from_millis(200),
            retry_interval: Duration::from_millis(10),
            lease: LeaseConfig {
                ttl: Duration::from_millis(600),
                renew_interval: Duration::from_millis(150),
                max_poll_interval: Duration::from_millis(50),
                key_prefix: default_key_prefix(),
            },
            queue: QueueConfig {
                check_interval: Duration::from_millis(100),
                ..QueueConfig::default()
            },
        }
    }

    /// Tighter polling for latency-sensitive callers, at the cost of store traffic
    pub fn low_latency() -> Self {
        Self {
            grace_period: Duration::from_secs(60),
            retry_interval: Duration::from_millis(5),
            lease: LeaseConfig {
                ttl: Duration::from_secs(5),
                renew_interval: Duration::from_millis(1500),
                max_poll_interval: Duration::from_millis(100),
                key_prefix: default_key_prefix(),
            },
            queue: QueueConfig {
                check_interval: Duration::from_secs(2),
                ..QueueConfig::default()
            },
        }
    }

    /// Parse a JSON document; absent fields take their defaults
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Defaults overridden by `TURNSTILE_LOCK_*` environment variables
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        config.apply_env_overrides(|name| std::env::var(name).ok())?;
        config.validate()?;
        Ok(config)
    }

    fn apply_env_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        let millis = |name: &str| -> Result<Option<Duration>> {
            match lookup(name) {
                Some(raw) => raw
                    .trim()
                    .parse::<u64>()
                    .map(|ms| Some(Duration::from_millis(ms)))
                    .map_err(|e| LockError::configuration(format!("{name}={raw:?} is not a millisecond count: {e}"))),
                None => Ok(None),
            }
        };

        if let Some(d) = millis(ENV_GRACE_PERIOD_MS)? {
            self.grace_period = d;
        }
        if let Some(d) = millis(ENV_RETRY_INTERVAL_MS)? {
            self.retry_interval = d;
        }
        if let Some(d) = millis(ENV_LEASE_TTL_MS)? {
            self.lease.ttl = d;
        }
        if let Some(d) = millis(ENV_LEASE_RENEW_INTERVAL_MS)? {
            self.lease.renew_interval = d;
        }
        if let Some(root) = lookup(ENV_QUEUE_ROOT) {
            self.queue.root = root;
        }
        Ok(())
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.retry_interval.is_zero() {
            return Err(LockError::configuration("Retry interval must be greater than zero"));
        }

        if self.lease.ttl.is_zero() {
            return Err(LockError::configuration("Lease TTL must be greater than zero"));
        }

        if self.lease.renew_interval.is_zero() || self.lease.renew_interval >= self.lease.ttl {
            return Err(LockError::configuration("Lease renew interval must be non-zero and shorter than the lease TTL"));
        }

        if self.lease.max_poll_interval < self.retry_interval {
            return Err(LockError::configuration("Maximum poll interval must not be shorter than the retry interval"));
        }

        if !self.queue.root.starts_with('/') || (self.queue.root.len() > 1 && self.queue.root.ends_with('/')) {
            return Err(LockError::configuration(format!(
                "Queue root '{}' must be an absolute path without a trailing slash",
                self.queue.root
            )));
        }

        if self.queue.separator.is_empty() || self.queue.separator.contains('/') {
            return Err(LockError::configuration("Queue separator must be non-empty and must not contain '/'"));
        }

        if self.queue.check_interval.is_zero() {
            return Err(LockError::configuration("Queue check interval must be greater than zero"));
        }

        Ok(())
    }
}
