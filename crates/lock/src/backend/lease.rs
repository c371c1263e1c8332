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

use async_trait::async_trait;
use dashmap::DashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{Instant, MissedTickBehavior, interval, sleep};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::{HeldToken, LockBackend, remaining, validate_common};
use crate::{
    config::{LeaseConfig, LockConfig},
    entry::LockEntry,
    error::{LockError, Result, StoreResult},
    types::LockKey,
};

/// Atomic key-value store with expiring entries
#[async_trait]
pub trait LeaseStore: Send + Sync + fmt::Debug {
    /// Store `token` under `key` with `ttl` only if `key` is absent or expired
    async fn set_if_absent(&self, key: &str, token: &str, ttl: Duration) -> StoreResult<bool>;

    /// Reset the TTL of `key` if it still holds `token`
    async fn extend(&self, key: &str, token: &str, ttl: Duration) -> StoreResult<bool>;

    /// Delete `key` if it still holds `token`
    async fn delete_if_owner(&self, key: &str, token: &str) -> StoreResult<bool>;
}

/// Heartbeat for held leases
#[derive(Debug)]
pub struct LeaseObserver {
    store: Arc<dyn LeaseStore>,
    ttl: Duration,
    renew_interval: Duration,
    /// store key -> token of every lease this process holds
    held: DashMap<String, String>,
}

impl LeaseObserver {
    pub fn new(store: Arc<dyn LeaseStore>, config: &LeaseConfig) -> Self {
        Self {
            store,
            ttl: config.ttl,
            renew_interval: config.renew_interval,
            held: DashMap::new(),
        }
    }

    pub fn register(&self, store_key: String, token: String) {
        self.held.insert(store_key, token);
    }

    /// Stop renewing `store_key` if it still maps to `token`
    pub fn forget(&self, store_key: &str, token: &str) {
        self.held.remove_if(store_key, |_, current| current == token);
    }

    pub fn held_count(&self) -> usize {
        self.held.len()
    }

    /// Extend every held lease once; returns how many were found lost
    pub async fn renew_all(&self) -> usize {
        let snapshot: Vec<(String, String)> = self
            .held
            .iter()
            .map(|lease| (lease.key().clone(), lease.value().clone()))
            .collect();

        let mut lost = 0;
        for (store_key, token) in snapshot {
            match self.store.extend(&store_key, &token, self.ttl).await {
                Ok(true) => {}
                Ok(false) => {
                    error!("Lease {} expired or was taken over before renewal, mutual exclusion is no longer guaranteed", store_key);
                    self.forget(&store_key, &token);
                    lost += 1;
                }
                Err(err) => {
                    warn!("Failed to renew lease {}: {}", store_key, err);
                }
            }
        }
        lost
    }

    pub async fn run(&self, cancel: CancellationToken) {
        let mut ticker = interval(self.renew_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // first tick completes immediately
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("Lease observer stopped with {} leases held", self.held.len());
                    break;
                }
                _ = ticker.tick() => {
                    let lost = self.renew_all().await;
                    if lost > 0 {
                        debug!("Lease renewal round finished, {} leases lost", lost);
                    }
                }
            }
        }
    }
}

/// Lease-and-refcount strategy: a lock is a key holding this process's random token.
#[derive(Debug)]
pub struct LeaseBackend {
    namespace: String,
    store: Arc<dyn LeaseStore>,
    config: LeaseConfig,
    retry_interval: Duration,
    observer: Arc<LeaseObserver>,
}

impl LeaseBackend {
    pub fn new(namespace: &str, store: Arc<dyn LeaseStore>, config: &LockConfig) -> Self {
        let observer = Arc::new(LeaseObserver::new(store.clone(), &config.lease));
        Self {
            namespace: namespace.to_string(),
            store,
            config: config.lease.clone(),
            retry_interval: config.retry_interval,
            observer,
        }
    }

    /// Key under which the lease for `key` lives in the store
    pub fn store_key(&self, key: &LockKey) -> String {
        format!("{}:{}:{}", self.config.key_prefix, self.namespace, key)
    }

    pub fn observer(&self) -> &Arc<LeaseObserver> {
        &self.observer
    }
}

#[async_trait]
impl LockBackend for LeaseBackend {
    fn name(&self) -> &'static str {
        "lease"
    }

    fn validate_key(&self, key: &LockKey) -> Result<()> {
        validate_common(key)
    }

    async fn try_acquire(&self, key: &LockKey, deadline: Option<Instant>, entry: &LockEntry) -> Result<Option<HeldToken>> {
        let store_key = self.store_key(key);
        let token = Uuid::new_v4().to_string();
        let mut delay = self.retry_interval;

        loop {
            // Registered before the attempt so a local release in between is not missed
            let released = entry.released();

            match self.store.set_if_absent(&store_key, &token, self.config.ttl).await {
                Ok(true) => {
                    self.observer.register(store_key.clone(), token.clone());
                    debug!("Acquired lease {}", store_key);
                    return Ok(Some(HeldToken::Lease { store_key, token }));
                }
                Ok(false) => {}
                Err(err) => {
                    // The write may have landed before the connection dropped
                    if let Err(cleanup_err) = self.store.delete_if_owner(&store_key, &token).await {
                        warn!("Best-effort cleanup of lease {} failed: {}", store_key, cleanup_err);
                    }
                    return Err(LockError::from_store(key.as_str(), err));
                }
            }

            let wait = match remaining(deadline) {
                Some(left) if left.is_zero() => return Ok(None),
                Some(left) => delay.min(left),
                None => delay,
            };
            tokio::select! {
                _ = sleep(wait) => {}
                _ = released => {}
            }
            delay = (delay * 2).min(self.config.max_poll_interval);
        }
    }

    async fn release(&self, key: &LockKey, token: HeldToken) -> Result<()> {
        let (store_key, token) = match token {
            HeldToken::Lease { store_key, token } => (store_key, token),
            other => return Err(LockError::internal(format!("lease backend cannot release {other:?} for key {key}"))),
        };
        self.observer.forget(&store_key, &token);

        match self.store.delete_if_owner(&store_key, &token).await {
            Ok(true) => Ok(()),
            Ok(false) => {
                warn!("Lease {} was already gone at release", store_key);
                Ok(())
            }
            Err(err) if err.is_vanished() => {
                warn!("Lease {} vanished before release: {}", store_key, err);
                Ok(())
            }
            Err(err) => Err(LockError::from_store(key.as_str(), err)),
        }
    }

    async fn run_observer(&self, cancel: CancellationToken) {
        self.observer.run(cancel).await;
    }
}
