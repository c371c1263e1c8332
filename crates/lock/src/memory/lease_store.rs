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
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tokio::time::Instant;

use crate::{
    backend::LeaseStore,
    error::{StoreError, StoreResult},
};

#[derive(Debug, Clone)]
struct Lease {
    token: String,
    expires_at: Instant,
}

impl Lease {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at > now
    }
}

/// In-process [`LeaseStore`] with TTL semantics.
///
/// Share one instance (behind an `Arc`) between registries to simulate several
/// processes talking to the same store.
#[derive(Debug, Default)]
pub struct MemoryLeaseStore {
    leases: Mutex<HashMap<String, Lease>>,
    offline: AtomicBool,
    operations: AtomicU64,
}

impl MemoryLeaseStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every following call fail with a connection error
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Number of store calls served so far
    pub fn operation_count(&self) -> u64 {
        self.operations.load(Ordering::SeqCst)
    }

    /// Token of the live lease under `key`
    pub fn holder(&self, key: &str) -> Option<String> {
        let now = Instant::now();
        self.leases
            .lock()
            .get(key)
            .filter(|lease| lease.is_live(now))
            .map(|lease| lease.token.clone())
    }

    /// Overwrite `key` unconditionally, as a foreign writer would
    pub fn force_set(&self, key: &str, token: &str, ttl: Duration) {
        self.leases.lock().insert(
            key.to_string(),
            Lease {
                token: token.to_string(),
                expires_at: Instant::now() + ttl,
            },
        );
    }

    /// Live leases
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.leases.lock().values().filter(|lease| lease.is_live(now)).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn begin(&self) -> StoreResult<()> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(StoreError::Connection("lease store is offline".to_string()));
        }
        self.operations.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[async_trait]
impl LeaseStore for MemoryLeaseStore {
    async fn set_if_absent(&self, key: &str, token: &str, ttl: Duration) -> StoreResult<bool> {
        self.begin()?;
        let now = Instant::now();
        let mut leases = self.leases.lock();
        if leases.get(key).is_some_and(|lease| lease.is_live(now)) {
            return Ok(false);
        }
        leases.insert(
            key.to_string(),
            Lease {
                token: token.to_string(),
                expires_at: now + ttl,
            },
        );
        Ok(true)
    }

    async fn extend(&self, key: &str, token: &str, ttl: Duration) -> StoreResult<bool> {
        self.begin()?;
        let now = Instant::now();
        let mut leases = self.leases.lock();
        match leases.get_mut(key) {
            Some(lease) if lease.is_live(now) && lease.token == token => {
                lease.expires_at = now + ttl;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn delete_if_owner(&self, key: &str, token: &str) -> StoreResult<bool> {
        self.begin()?;
        let now = Instant::now();
        let mut leases = self.leases.lock();
        let owned = leases.get(key).filter(|lease| lease.token == token).map(|lease| lease.is_live(now));
        match owned {
            Some(live) => {
                leases.remove(key);
                Ok(live)
            }
            None => Ok(false),
        }
    }
}
