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

//! Acquisition strategies.
//!
//! A namespace delegates the distributed half of every acquisition to one
//! [`LockBackend`]. Both strategies share the entry, cache and reaper machinery;
//! they differ only in how a hold is obtained from the external store and how
//! held state is kept alive in the background.

pub mod lease;
pub mod queue;

use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::{
    config::LockConfig,
    entry::LockEntry,
    error::{LockError, Result},
    types::LockKey,
};

pub use lease::{LeaseBackend, LeaseObserver, LeaseStore};
pub use queue::{CoordinationService, NodeWatch, QueueBackend};

/// Distributed state backing one hold, returned by `try_acquire` and consumed by `release`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HeldToken {
    /// Lease token written under `store_key`
    Lease { store_key: String, token: String },
    /// Ephemeral sequential node owned by this process
    Queue { node_path: String },
}

/// Acquisition strategy trait
#[async_trait]
pub trait LockBackend: Send + Sync + fmt::Debug {
    /// Short backend name for logs and stats
    fn name(&self) -> &'static str;

    /// Reject keys this backend cannot represent. Called before any distributed call.
    fn validate_key(&self, key: &LockKey) -> Result<()>;

    /// Try to obtain the distributed lock for `key`.
    ///
    /// # Returns
    /// - Ok(Some(token)): acquired
    /// - Ok(None): `deadline` passed without acquiring; no distributed state is left behind
    /// - Err(LockError::HandleVanished): the handle disappeared mid-attempt, caller may retry
    /// - Err: any other failure
    async fn try_acquire(&self, key: &LockKey, deadline: Option<Instant>, entry: &LockEntry) -> Result<Option<HeldToken>>;

    /// Release a hold previously returned by `try_acquire`
    async fn release(&self, key: &LockKey, token: HeldToken) -> Result<()>;

    /// Background maintenance of held state; runs until `cancel` fires
    async fn run_observer(&self, cancel: CancellationToken);
}

/// External store a registry builds its namespaces' backends from
#[derive(Debug, Clone)]
pub enum BackendProvider {
    /// Lease-and-refcount strategy over an atomic key-value store
    Lease(Arc<dyn LeaseStore>),
    /// Ordered-queue strategy over a hierarchical coordination service
    Queue(Arc<dyn CoordinationService>),
}

impl BackendProvider {
    pub(crate) fn build(&self, namespace: &str, config: &LockConfig) -> Result<Arc<dyn LockBackend>> {
        match self {
            Self::Lease(store) => Ok(Arc::new(LeaseBackend::new(namespace, store.clone(), config))),
            Self::Queue(service) => Ok(Arc::new(QueueBackend::new(namespace, service.clone(), config)?)),
        }
    }
}

/// Rule shared by every backend
pub(crate) fn validate_common(key: &LockKey) -> Result<()> {
    if key.as_str().is_empty() {
        return Err(LockError::invalid_key("", "key must not be empty"));
    }
    Ok(())
}

/// Time left before `deadline`; `None` means wait forever
pub(crate) fn remaining(deadline: Option<Instant>) -> Option<Duration> {
    deadline.map(|d| d.saturating_duration_since(Instant::now()))
}
