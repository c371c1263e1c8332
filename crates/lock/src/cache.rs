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

use dashmap::DashMap;
use std::sync::Arc;
use tracing::debug;

use crate::{entry::LockEntry, keyed_mutex::KeyedMutexRegistry, types::LockKey};

/// Per-namespace map from key to its shared [`LockEntry`].
///
/// At most one live entry exists per key; creation and removal both happen under
/// the key's private mutex.
#[derive(Debug, Default)]
pub struct LockEntryCache {
    entries: DashMap<LockKey, Arc<LockEntry>>,
    mutexes: KeyedMutexRegistry,
}

impl LockEntryCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &LockKey) -> Option<Arc<LockEntry>> {
        self.entries.get(key).map(|entry| entry.value().clone())
    }

    /// Return the live entry for `key`, creating it on first use.
    ///
    /// With `wants_reference` the returned entry already carries one extra
    /// reference, taken before any other task can tear it down.
    pub fn get_or_create(&self, key: &LockKey, wants_reference: bool) -> Arc<LockEntry> {
        let entry = match self.get(key) {
            Some(entry) => entry,
            None => self.create(key),
        };
        if !wants_reference || entry.inc_ref() {
            return entry;
        }

        // Lost the race with the reaper: the entry was torn down between lookup and reference.
        let mutex = self.mutexes.mutex_for(key);
        let _guard = mutex.lock();
        if let Some(current) = self.get(key)
            && current.inc_ref()
        {
            return current;
        }
        let fresh = Arc::new(LockEntry::new(key.clone()));
        fresh.inc_ref();
        self.entries.insert(key.clone(), fresh.clone());
        debug!("Replaced torn-down lock entry for key: {}", key);
        fresh
    }

    fn create(&self, key: &LockKey) -> Arc<LockEntry> {
        let mutex = self.mutexes.mutex_for(key);
        let _guard = mutex.lock();
        // Double check under the key mutex
        if let Some(existing) = self.get(key) {
            return existing;
        }
        let entry = Arc::new(LockEntry::new(key.clone()));
        self.entries.insert(key.clone(), entry.clone());
        debug!("Created lock entry for key: {}", key);
        entry
    }

    /// Remove `entry` if it is still the live entry for its key.
    ///
    /// The key's mutex is pruned afterwards when nobody else holds it.
    pub fn remove_if_same(&self, entry: &Arc<LockEntry>) -> bool {
        let key = entry.key();
        let removed = {
            let mutex = self.mutexes.mutex_for(key);
            let _guard = mutex.lock();
            self.entries.remove_if(key, |_, current| Arc::ptr_eq(current, entry)).is_some()
        };
        self.mutexes.forget_if_unused(key);
        removed
    }

    /// Snapshot of every cached key
    pub fn keys(&self) -> Vec<LockKey> {
        self.entries.iter().map(|entry| entry.key().clone()).collect()
    }

    /// Snapshot of every cached entry
    pub fn entries(&self) -> Vec<Arc<LockEntry>> {
        self.entries.iter().map(|entry| entry.value().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Number of key mutexes still allocated
    pub fn mutex_count(&self) -> usize {
        self.mutexes.len()
    }
}
