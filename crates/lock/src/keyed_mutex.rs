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
use parking_lot::Mutex;
use std::sync::Arc;

use crate::types::LockKey;

/// One private mutex per key, guarding creation and removal of that key's cache entry.
///
/// Guards are never held across an await point.
#[derive(Debug, Default)]
pub struct KeyedMutexRegistry {
    mutexes: DashMap<LockKey, Arc<Mutex<()>>>,
}

impl KeyedMutexRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mutex for `key`, created on first use
    pub fn mutex_for(&self, key: &LockKey) -> Arc<Mutex<()>> {
        if let Some(mutex) = self.mutexes.get(key) {
            return mutex.value().clone();
        }
        self.mutexes
            .entry(key.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .value()
            .clone()
    }

    /// Drop the mutex for `key` unless someone else still holds a handle to it
    pub fn forget_if_unused(&self, key: &LockKey) -> bool {
        self.mutexes.remove_if(key, |_, mutex| Arc::strong_count(mutex) == 1).is_some()
    }

    pub fn len(&self) -> usize {
        self.mutexes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.mutexes.is_empty()
    }
}
