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

use futures::future::join_all;
use once_cell::sync::OnceCell;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use crate::{
    backend::BackendProvider,
    config::LockConfig,
    error::{LockError, Result},
    namespace::Namespace,
    types::{LockKey, LockStatus, OwnerId, ReleaseOutcome},
};

/// Process-wide map from namespace name to its [`Namespace`] manager
#[derive(Debug)]
pub struct LockRegistry {
    config: LockConfig,
    provider: BackendProvider,
    namespaces: RwLock<HashMap<String, Arc<Namespace>>>,
    /// Serializes namespace construction
    creation: Mutex<()>,
}

impl LockRegistry {
    pub fn new(config: LockConfig, provider: BackendProvider) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            provider,
            namespaces: RwLock::new(HashMap::new()),
            creation: Mutex::new(()),
        })
    }

    pub fn config(&self) -> &LockConfig {
        &self.config
    }

    /// Namespace manager for `name`, started on first use.
    ///
    /// Must be called from inside a tokio runtime the first time a name is used.
    pub fn get(&self, name: &str) -> Result<Arc<Namespace>> {
        if let Some(namespace) = self.namespaces.read().get(name) {
            return Ok(namespace.clone());
        }

        let _creation = self.creation.lock();
        // Double check under the creation lock
        if let Some(namespace) = self.namespaces.read().get(name) {
            return Ok(namespace.clone());
        }

        if name.is_empty() {
            return Err(LockError::configuration("namespace name must not be empty"));
        }
        let backend = self.provider.build(name, &self.config)?;
        let namespace = Namespace::start(name.to_string(), self.config.clone(), backend)?;
        self.namespaces.write().insert(name.to_string(), namespace.clone());
        Ok(namespace)
    }

    /// Names of the namespaces started so far
    pub fn namespaces(&self) -> Vec<String> {
        let mut names: Vec<String> = self.namespaces.read().keys().cloned().collect();
        names.sort();
        names
    }

    pub async fn acquire(&self, namespace: &str, key: impl Into<LockKey>, owner: &OwnerId, timeout: Option<Duration>) -> Result<LockStatus> {
        self.get(namespace)?.lock(key, owner, timeout).await
    }

    pub async fn release(
        &self,
        namespace: &str,
        key: impl Into<LockKey>,
        owner: &OwnerId,
        status: Option<LockStatus>,
        keepalive: bool,
    ) -> Result<ReleaseOutcome> {
        self.get(namespace)?.unlock(key, owner, status, keepalive).await
    }

    pub async fn reset_all(&self, namespace: &str) -> Result<usize> {
        Ok(self.get(namespace)?.reset_all().await)
    }

    /// Stop every namespace's background tasks and forget them
    pub async fn shutdown(&self) {
        let namespaces: Vec<Arc<Namespace>> = self.namespaces.write().drain().map(|(_, ns)| ns).collect();
        join_all(namespaces.iter().map(|namespace| namespace.shutdown())).await;
        info!("Lock registry shut down, {} namespaces stopped", namespaces.len());
    }
}

static GLOBAL_REGISTRY: OnceCell<Arc<LockRegistry>> = OnceCell::new();

/// Install the process-wide registry. Fails if one is already installed.
pub fn init_global_registry(config: LockConfig, provider: BackendProvider) -> Result<Arc<LockRegistry>> {
    let registry = Arc::new(LockRegistry::new(config, provider)?);
    GLOBAL_REGISTRY
        .set(registry.clone())
        .map_err(|_| LockError::configuration("global lock registry is already initialized"))?;
    Ok(registry)
}

/// The process-wide registry, if installed
pub fn global_registry() -> Option<Arc<LockRegistry>> {
    GLOBAL_REGISTRY.get().cloned()
}
