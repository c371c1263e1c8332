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

use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    backend::LockBackend,
    cache::LockEntryCache,
    config::LockConfig,
    entry::{EntryRelease, LockEntry},
    error::{LockError, Result},
    guard::LockGuard,
    reaper::CleanupReaper,
    types::{LockCounters, LockKey, LockStats, LockStatus, OwnerId, ReleaseOutcome},
};

/// Independent lock manager for one namespace.
///
/// Owns the entry cache, the cleanup reaper and the backend observer. Keys in
/// different namespaces never interfere.
#[derive(Debug)]
pub struct Namespace {
    name: String,
    config: LockConfig,
    cache: Arc<LockEntryCache>,
    backend: Arc<dyn LockBackend>,
    reaper: CleanupReaper,
    counters: Arc<LockCounters>,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Namespace {
    /// Start a namespace and its background tasks on the current tokio runtime
    pub(crate) fn start(name: String, config: LockConfig, backend: Arc<dyn LockBackend>) -> Result<Arc<Self>> {
        let runtime = Handle::try_current()
            .map_err(|_| LockError::configuration(format!("namespace '{name}' must be created inside a tokio runtime")))?;

        let cancel = CancellationToken::new();
        let cache = Arc::new(LockEntryCache::new());
        let counters = Arc::new(LockCounters::default());
        let (reaper, reaper_task) = CleanupReaper::spawn(&runtime, name.clone(), cache.clone(), counters.clone(), cancel.child_token());

        let observer_task = {
            let backend = backend.clone();
            let cancel = cancel.child_token();
            runtime.spawn(async move { backend.run_observer(cancel).await })
        };

        info!("Lock namespace '{}' started with {} backend", name, backend.name());
        Ok(Arc::new(Self {
            name,
            config,
            cache,
            backend,
            reaper,
            counters,
            cancel,
            tasks: Mutex::new(vec![reaper_task, observer_task]),
        }))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    pub fn config(&self) -> &LockConfig {
        &self.config
    }

    /// Acquire `key` for `owner`.
    ///
    /// `timeout` of `None` waits indefinitely; `Some(Duration::ZERO)` makes a single attempt.
    ///
    /// # Returns
    /// - Ok(Acquired): release later with the same status
    /// - Ok(NoActionNeeded): `owner` already held the key
    /// - Ok(TimedOut): the deadline passed
    /// - Err(_): invalid key or backend failure
    pub async fn lock(&self, key: impl Into<LockKey>, owner: &OwnerId, timeout: Option<Duration>) -> Result<LockStatus> {
        let key = key.into();
        self.backend.validate_key(&key)?;
        let deadline = timeout.map(|t| Instant::now() + t);

        loop {
            let reference = EntryReference::take(self, &key);
            let entry = reference.entry.clone();

            if entry.is_owner(owner) {
                LockCounters::bump(&self.counters.no_action_needed);
                return Ok(LockStatus::NoActionNeeded);
            }

            match self.backend.try_acquire(&key, deadline, &entry).await {
                Ok(Some(token)) => {
                    if let Err(token) = entry.mark_acquired(owner.clone(), token) {
                        // The backend granted a key that is already held locally.
                        if let Err(err) = self.backend.release(&key, token).await {
                            warn!("Failed to hand back conflicting grant for {}: {}", key, err);
                        }
                        if entry.is_owner(owner) {
                            LockCounters::bump(&self.counters.no_action_needed);
                            return Ok(LockStatus::NoActionNeeded);
                        }
                        LockCounters::bump(&self.counters.failed);
                        return Err(LockError::internal(format!(
                            "backend granted '{key}' in namespace '{}' while it is held locally by {:?}",
                            self.name,
                            entry.holder()
                        )));
                    }
                    // the owner's reference lives until unlock
                    reference.keep();
                    LockCounters::bump(&self.counters.acquired);
                    debug!("Lock '{}' acquired by {} in namespace '{}'", key, owner, self.name);
                    return Ok(LockStatus::Acquired);
                }
                Ok(None) => {
                    LockCounters::bump(&self.counters.timed_out);
                    debug!("Lock '{}' timed out for {} in namespace '{}'", key, owner, self.name);
                    return Ok(LockStatus::TimedOut);
                }
                Err(err) if err.is_retryable() => {
                    drop(reference);
                    LockCounters::bump(&self.counters.vanished_retries);
                    warn!("Lock handle for '{}' vanished while acquiring, retrying: {}", key, err);

                    let pause = match deadline {
                        Some(deadline) => {
                            let left = deadline.saturating_duration_since(Instant::now());
                            if left.is_zero() {
                                LockCounters::bump(&self.counters.timed_out);
                                return Ok(LockStatus::TimedOut);
                            }
                            self.config.retry_interval.min(left)
                        }
                        None => self.config.retry_interval,
                    };
                    sleep(pause).await;
                }
                Err(err) => {
                    LockCounters::bump(&self.counters.failed);
                    return Err(err);
                }
            }
        }
    }

    /// Release a hold obtained by [`lock`](Self::lock).
    ///
    /// Only `Some(LockStatus::Acquired)` from the current owner releases anything; every
    /// other status is a no-op. With `keepalive` the entry stays cached after release.
    pub async fn unlock(
        &self,
        key: impl Into<LockKey>,
        owner: &OwnerId,
        status: Option<LockStatus>,
        keepalive: bool,
    ) -> Result<ReleaseOutcome> {
        if status != Some(LockStatus::Acquired) {
            return Ok(ReleaseOutcome::NotHeld);
        }
        let key = key.into();
        let Some(entry) = self.cache.get(&key) else {
            warn!("Unlock of '{}' in namespace '{}' found no cached entry", key, self.name);
            return Ok(ReleaseOutcome::NotHeld);
        };

        match entry.release(owner) {
            EntryRelease::NotOwner => {
                warn!("{} tried to unlock '{}' without holding it", owner, key);
                Ok(ReleaseOutcome::NotHeld)
            }
            EntryRelease::StillHeld => Ok(ReleaseOutcome::StillHeld),
            EntryRelease::Released { token, idle } => {
                LockCounters::bump(&self.counters.released);
                let _completion = ReleaseCompletion {
                    namespace: self,
                    entry: &entry,
                    schedule_cleanup: idle && !keepalive,
                };
                let result = match token {
                    Some(token) => self.backend.release(&key, token).await,
                    None => Ok(()),
                };
                debug!("Lock '{}' released by {} in namespace '{}'", key, owner, self.name);
                result.map(|_| ReleaseOutcome::Released)
            }
        }
    }

    /// Acquire `key` and wrap the hold in a guard that releases on drop.
    ///
    /// Returns `None` on timeout. A reentrant call yields a guard that releases nothing.
    pub async fn lock_guard(self: &Arc<Self>, key: impl Into<LockKey>, owner: &OwnerId, timeout: Option<Duration>) -> Result<Option<LockGuard>> {
        let key = key.into();
        let status = self.lock(key.clone(), owner, timeout).await?;
        Ok(status
            .is_held()
            .then(|| LockGuard::new(self.clone(), key, owner.clone(), status)))
    }

    /// Force-release every hold in this namespace; returns how many were released
    pub async fn reset_all(&self) -> usize {
        let mut released = 0;
        for entry in self.cache.entries() {
            let Some((token, idle)) = entry.force_release() else {
                continue;
            };
            released += 1;
            if let Some(token) = token
                && let Err(err) = self.backend.release(entry.key(), token).await
            {
                warn!("Failed to release '{}' during reset: {}", entry.key(), err);
            }
            entry.notify_released();
            if idle {
                self.schedule_cleanup(&entry);
            }
        }
        info!("Reset namespace '{}', released {} locks", self.name, released);
        released
    }

    pub fn is_locked(&self, key: impl Into<LockKey>) -> bool {
        self.cache.get(&key.into()).is_some_and(|entry| entry.is_held())
    }

    /// Local owner currently holding `key`
    pub fn holder(&self, key: impl Into<LockKey>) -> Option<OwnerId> {
        self.cache.get(&key.into()).and_then(|entry| entry.holder())
    }

    /// Cached entry for `key`, if any
    pub fn entry(&self, key: impl Into<LockKey>) -> Option<Arc<LockEntry>> {
        self.cache.get(&key.into())
    }

    pub fn stats(&self) -> LockStats {
        let entries = self.cache.entries();
        let mut stats = LockStats {
            cached_entries: entries.len(),
            held_entries: entries.iter().filter(|entry| entry.is_held()).count(),
            pending_cleanup: self.reaper.pending(),
            ..Default::default()
        };
        self.counters.fill(&mut stats);
        stats
    }

    pub fn is_shutdown(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Stop the reaper and the observer. Held locks are not released.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let tasks: Vec<JoinHandle<()>> = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            if let Err(err) = task.await {
                warn!("Background task of namespace '{}' ended abnormally: {}", self.name, err);
            }
        }
        info!("Lock namespace '{}' shut down", self.name);
    }

    fn drop_reference(&self, entry: &Arc<LockEntry>) {
        if entry.dec_ref() {
            self.schedule_cleanup(entry);
        }
    }

    fn schedule_cleanup(&self, entry: &Arc<LockEntry>) {
        if entry.schedule_clear(self.config.grace_period) {
            self.reaper.schedule(entry.clone());
        }
    }
}

/// Reference held on an entry while one acquisition attempt is in flight.
///
/// Dropped on every exit path, including a cancelled `lock()` future.
struct EntryReference<'a> {
    namespace: &'a Namespace,
    entry: Arc<LockEntry>,
    armed: bool,
}

impl<'a> EntryReference<'a> {
    fn take(namespace: &'a Namespace, key: &LockKey) -> Self {
        Self {
            namespace,
            entry: namespace.cache.get_or_create(key, true),
            armed: true,
        }
    }

    fn keep(mut self) {
        self.armed = false;
    }
}

impl Drop for EntryReference<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.namespace.drop_reference(&self.entry);
        }
    }
}

/// Wakes local waiters and schedules cleanup once a release ends, even if the
/// `unlock()` future is dropped while the backend call is in flight.
struct ReleaseCompletion<'a> {
    namespace: &'a Namespace,
    entry: &'a Arc<LockEntry>,
    schedule_cleanup: bool,
}

impl Drop for ReleaseCompletion<'_> {
    fn drop(&mut self) {
        self.entry.notify_released();
        if self.schedule_cleanup {
            self.namespace.schedule_cleanup(self.entry);
        }
    }
}

impl Drop for Namespace {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[cfg(test)]
mod tests;
