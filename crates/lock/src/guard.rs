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

use once_cell::sync::Lazy;
use std::sync::Arc;
use std::thread;
use tokio::runtime::{Builder, Handle};
use tokio::sync::mpsc;

use crate::{
    error::Result,
    namespace::Namespace,
    types::{LockKey, LockStatus, OwnerId, ReleaseOutcome},
};

#[derive(Debug)]
struct UnlockJob {
    namespace: Arc<Namespace>,
    key: LockKey,
    owner: OwnerId,
}

impl UnlockJob {
    async fn run(self) {
        match self
            .namespace
            .unlock(self.key.clone(), &self.owner, Some(LockStatus::Acquired), false)
            .await
        {
            Ok(outcome) => tracing::debug!("LockGuard released {} ({:?})", self.key, outcome),
            Err(err) => tracing::warn!("LockGuard background release of {} failed: {}", self.key, err),
        }
    }
}

// Guards dropped outside any tokio runtime are released by a worker thread with its own runtime.
static UNLOCK_TX: Lazy<Option<mpsc::UnboundedSender<UnlockJob>>> = Lazy::new(|| {
    let (tx, mut rx) = mpsc::unbounded_channel::<UnlockJob>();

    let spawned = thread::Builder::new().name("turnstile-lock-unlocker".to_string()).spawn(move || {
        let rt = match Builder::new_current_thread().enable_all().build() {
            Ok(rt) => rt,
            Err(err) => {
                tracing::error!("Failed to build runtime for background unlock jobs: {}", err);
                return;
            }
        };
        rt.block_on(async move {
            while let Some(job) = rx.recv().await {
                job.run().await;
            }
        });
    });

    match spawned {
        Ok(_) => Some(tx),
        Err(err) => {
            tracing::error!("Failed to spawn unlock worker thread: {}", err);
            None
        }
    }
});

/// A RAII guard that releases the lock when dropped.
///
/// Created by [`Namespace::lock_guard`]. A guard from a reentrant acquisition
/// (`NoActionNeeded`) is disarmed from the start: the outer hold stays in place.
#[derive(Debug)]
pub struct LockGuard {
    namespace: Arc<Namespace>,
    key: LockKey,
    owner: OwnerId,
    status: LockStatus,
    /// If true, Drop will not try to release
    disarmed: bool,
}

impl LockGuard {
    pub(crate) fn new(namespace: Arc<Namespace>, key: LockKey, owner: OwnerId, status: LockStatus) -> Self {
        Self {
            namespace,
            key,
            owner,
            status,
            disarmed: status != LockStatus::Acquired,
        }
    }

    pub fn key(&self) -> &LockKey {
        &self.key
    }

    pub fn owner(&self) -> &OwnerId {
        &self.owner
    }

    pub fn status(&self) -> LockStatus {
        self.status
    }

    pub fn namespace(&self) -> &str {
        self.namespace.name()
    }

    /// Release now and wait for the backend
    pub async fn release(self) -> Result<ReleaseOutcome> {
        self.release_with(false).await
    }

    /// Release now, keeping the entry cached when `keepalive` is set
    pub async fn release_with(mut self, keepalive: bool) -> Result<ReleaseOutcome> {
        self.disarmed = true;
        self.namespace
            .unlock(self.key.clone(), &self.owner, Some(self.status), keepalive)
            .await
    }

    /// Manually disarm the guard so dropping it won't release the lock.
    /// Call this if you explicitly released the lock elsewhere.
    pub fn disarm(&mut self) {
        self.disarmed = true;
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if self.disarmed {
            return;
        }

        let job = UnlockJob {
            namespace: self.namespace.clone(),
            key: self.key.clone(),
            owner: self.owner.clone(),
        };

        if let Ok(handle) = Handle::try_current() {
            handle.spawn(job.run());
            return;
        }

        match UNLOCK_TX.as_ref() {
            Some(tx) => {
                if let Err(err) = tx.send(job) {
                    tracing::warn!("Unlock worker is gone, lock {} stays held: {}", self.key, err.0.key);
                }
            }
            None => tracing::warn!("No unlock worker available, lock {} stays held", self.key),
        }
    }
}
