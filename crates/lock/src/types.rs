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
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use uuid::Uuid;

/// Name of a contended resource inside a namespace
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LockKey(Arc<str>);

impl LockKey {
    pub fn new(key: impl Into<Arc<str>>) -> Self {
        Self(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for LockKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for LockKey {
    fn from(key: &str) -> Self {
        Self::new(key)
    }
}

impl From<String> for LockKey {
    fn from(key: String) -> Self {
        Self::new(key)
    }
}

/// Identity of a local caller; reentrancy and ownership are tracked per owner
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct OwnerId(Arc<str>);

impl OwnerId {
    /// Generate a random owner identity
    pub fn new() -> Self {
        Self(Arc::from(Uuid::new_v4().to_string()))
    }

    pub fn named(name: impl Into<Arc<str>>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for OwnerId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for OwnerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for OwnerId {
    fn from(name: &str) -> Self {
        Self::named(name)
    }
}

/// Outcome of a lock attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LockStatus {
    /// The caller now holds the lock and must release it with this status
    Acquired,
    /// The caller already held the lock; nothing to release for this call
    NoActionNeeded,
    /// The lock could not be obtained before the deadline
    TimedOut,
}

impl LockStatus {
    /// Whether the status represents a hold the caller owns (either fresh or pre-existing)
    pub fn is_held(&self) -> bool {
        matches!(self, Self::Acquired | Self::NoActionNeeded)
    }
}

/// Outcome of an unlock call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReleaseOutcome {
    /// The hold count reached zero and the distributed lock was released
    Released,
    /// The caller still holds an outer layer of a reentrant sequence
    StillHeld,
    /// Nothing to release (status without a hold, unknown key, or caller is not the owner)
    NotHeld,
}

/// Namespace statistics snapshot
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockStats {
    /// Entries currently cached
    pub cached_entries: usize,
    /// Cached entries currently held by some local owner
    pub held_entries: usize,
    /// Entries waiting in the cleanup queue
    pub pending_cleanup: usize,
    pub acquired: u64,
    pub no_action_needed: u64,
    pub timed_out: u64,
    pub failed: u64,
    pub released: u64,
    /// Acquisitions retried because their distributed handle vanished
    pub vanished_retries: u64,
    /// Entries evicted by the cleanup reaper
    pub evicted: u64,
}

/// Monotonic counters shared by a namespace, its cache and its reaper
#[derive(Debug, Default)]
pub(crate) struct LockCounters {
    pub acquired: AtomicU64,
    pub no_action_needed: AtomicU64,
    pub timed_out: AtomicU64,
    pub failed: AtomicU64,
    pub released: AtomicU64,
    pub vanished_retries: AtomicU64,
    pub evicted: AtomicU64,
}

impl LockCounters {
    pub fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn fill(&self, stats: &mut LockStats) {
        stats.acquired = self.acquired.load(Ordering::Relaxed);
        stats.no_action_needed = self.no_action_needed.load(Ordering::Relaxed);
        stats.timed_out = self.timed_out.load(Ordering::Relaxed);
        stats.failed = self.failed.load(Ordering::Relaxed);
        stats.released = self.released.load(Ordering::Relaxed);
        stats.vanished_retries = self.vanished_retries.load(Ordering::Relaxed);
        stats.evicted = self.evicted.load(Ordering::Relaxed);
    }
}
