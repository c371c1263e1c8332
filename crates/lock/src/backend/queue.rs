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
use tokio::runtime::Handle;
use tokio::sync::{OnceCell, oneshot};
use tokio::time::{Instant, MissedTickBehavior, interval, timeout_at};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{HeldToken, LockBackend, validate_common};
use crate::{
    config::LockConfig,
    entry::LockEntry,
    error::{LockError, Result, StoreError, StoreResult},
    types::LockKey,
};

/// Fires once when the watched node is deleted. A dropped sender (session loss) also wakes the waiter.
pub type NodeWatch = oneshot::Receiver<()>;

/// Hierarchical coordination service with ephemeral sequential nodes
#[async_trait]
pub trait CoordinationService: Send + Sync + fmt::Debug {
    /// Create `path` and its missing ancestors as persistent nodes
    async fn ensure_path(&self, path: &str) -> StoreResult<()>;

    /// Create an ephemeral node named `prefix` + zero-padded sequence; returns the full path
    async fn create_ephemeral_sequential(&self, prefix: &str) -> StoreResult<String>;

    /// Names (not paths) of the direct children of `path`
    async fn children(&self, path: &str) -> StoreResult<Vec<String>>;

    async fn exists(&self, path: &str) -> StoreResult<bool>;

    /// Watch `path` for deletion; `None` if it is already gone
    async fn watch_deletion(&self, path: &str) -> StoreResult<Option<NodeWatch>>;

    async fn delete(&self, path: &str) -> StoreResult<()>;
}

/// Split a node name into its key and sequence number
pub(crate) fn parse_node_name<'a>(name: &'a str, separator: &str) -> Option<(&'a str, u64)> {
    let (key, seq) = name.split_once(separator)?;
    Some((key, seq.parse().ok()?))
}

/// Ordered-queue strategy: waiters line up as sequential nodes and the lowest sequence holds the lock.
#[derive(Debug)]
pub struct QueueBackend {
    namespace: String,
    service: Arc<dyn CoordinationService>,
    root: String,
    separator: String,
    check_interval: Duration,
    root_ready: OnceCell<()>,
    /// node path -> key, for every node this process holds
    held: DashMap<String, LockKey>,
}

impl QueueBackend {
    pub fn new(namespace: &str, service: Arc<dyn CoordinationService>, config: &LockConfig) -> Result<Self> {
        if namespace.is_empty() || namespace.contains('/') {
            return Err(LockError::configuration(format!(
                "namespace '{namespace}' cannot be used as a queue node name"
            )));
        }
        let root = if config.queue.root == "/" {
            format!("/{namespace}")
        } else {
            format!("{}/{}", config.queue.root, namespace)
        };
        Ok(Self {
            namespace: namespace.to_string(),
            service,
            root,
            separator: config.queue.separator.clone(),
            check_interval: config.queue.check_interval,
            root_ready: OnceCell::new(),
            held: DashMap::new(),
        })
    }

    /// Parent node of this namespace's queues
    pub fn root(&self) -> &str {
        &self.root
    }

    pub fn held_count(&self) -> usize {
        self.held.len()
    }

    async fn create_root(&self) -> Result<()> {
        match self.service.ensure_path(&self.root).await {
            // lost a creation race with another process
            Ok(()) | Err(StoreError::AlreadyExists(_)) => Ok(()),
            Err(err) => Err(LockError::from_store(&self.root, err)),
        }
    }

    async fn ensure_root(&self) -> Result<()> {
        self.root_ready.get_or_try_init(|| self.create_root()).await?;
        Ok(())
    }

    /// Create this attempt's node, recreating the root once if it was removed since startup
    async fn create_node(&self, key: &LockKey, prefix: &str) -> Result<String> {
        match self.service.create_ephemeral_sequential(prefix).await {
            Ok(path) => Ok(path),
            Err(StoreError::NotFound(_)) => {
                warn!("Queue root {} disappeared, recreating it", self.root);
                self.create_root().await?;
                self.service
                    .create_ephemeral_sequential(prefix)
                    .await
                    .map_err(|err| LockError::from_store(key.as_str(), err))
            }
            Err(err) => Err(LockError::from_store(key.as_str(), err)),
        }
    }

    /// This key's waiters, ordered by sequence
    async fn waiters(&self, key: &LockKey) -> Result<Vec<(u64, String)>> {
        let children = self
            .service
            .children(&self.root)
            .await
            .map_err(|err| LockError::from_store(key.as_str(), err))?;
        let mut queue: Vec<(u64, String)> = children
            .into_iter()
            .filter_map(|name| {
                let (owner_key, seq) = parse_node_name(&name, &self.separator)?;
                (owner_key == key.as_str()).then_some((seq, name))
            })
            .collect();
        queue.sort_unstable_by_key(|(seq, _)| *seq);
        Ok(queue)
    }

    /// Wait until `my_seq` heads the queue. Ok(false) when `deadline` passes first.
    async fn wait_for_turn(&self, key: &LockKey, my_seq: u64, deadline: Option<Instant>) -> Result<bool> {
        loop {
            let queue = self.waiters(key).await?;
            let Some(rank) = queue.iter().position(|(seq, _)| *seq == my_seq) else {
                return Err(LockError::handle_vanished(key.as_str()));
            };
            if rank == 0 {
                return Ok(true);
            }
            if deadline.is_some_and(|d| d <= Instant::now()) {
                return Ok(false);
            }

            let predecessor = format!("{}/{}", self.root, queue[rank - 1].1);
            let watch = match self.service.watch_deletion(&predecessor).await {
                Ok(Some(watch)) => watch,
                Ok(None) | Err(StoreError::NotFound(_)) => continue,
                Err(err) => return Err(LockError::from_store(key.as_str(), err)),
            };

            match deadline {
                None => {
                    let _ = watch.await;
                }
                Some(deadline) => {
                    if timeout_at(deadline, watch).await.is_err() {
                        // One last look before giving up
                        let queue = self.waiters(key).await?;
                        return Ok(queue.first().is_some_and(|(seq, _)| *seq == my_seq));
                    }
                }
            }
        }
    }
}

/// Deletes a node unless disarmed; covers dropped acquire and release futures
struct NodeCleanup {
    service: Arc<dyn CoordinationService>,
    path: String,
    armed: bool,
}

impl NodeCleanup {
    fn new(service: Arc<dyn CoordinationService>, path: String) -> Self {
        Self { service, path, armed: true }
    }

    fn disarm(&mut self) {
        self.armed = false;
    }

    async fn delete_now(mut self) {
        self.armed = false;
        match self.service.delete(&self.path).await {
            Ok(()) | Err(StoreError::NotFound(_)) | Err(StoreError::SessionExpired(_)) => {}
            Err(err) => warn!("Failed to delete abandoned queue node {}: {}", self.path, err),
        }
    }
}

impl Drop for NodeCleanup {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let service = self.service.clone();
        let path = std::mem::take(&mut self.path);
        match Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(err) = service.delete(&path).await
                        && !err.is_vanished()
                    {
                        warn!("Failed to delete abandoned queue node {}: {}", path, err);
                    }
                });
            }
            Err(_) => {
                warn!("No runtime available to delete abandoned queue node {}", path);
            }
        }
    }
}

#[async_trait]
impl LockBackend for QueueBackend {
    fn name(&self) -> &'static str {
        "queue"
    }

    fn validate_key(&self, key: &LockKey) -> Result<()> {
        validate_common(key)?;
        if key.as_str().contains(self.separator.as_str()) {
            return Err(LockError::invalid_key(
                key.as_str(),
                format!("must not contain the reserved separator '{}'", self.separator),
            ));
        }
        if key.as_str().contains('/') {
            return Err(LockError::invalid_key(key.as_str(), "must not contain '/'"));
        }
        Ok(())
    }

    async fn try_acquire(&self, key: &LockKey, deadline: Option<Instant>, _entry: &LockEntry) -> Result<Option<HeldToken>> {
        self.ensure_root().await?;

        let prefix = format!("{}/{}{}", self.root, key, self.separator);
        let node_path = self.create_node(key, &prefix).await?;
        let mut cleanup = NodeCleanup::new(self.service.clone(), node_path.clone());

        let node_name = node_path.rsplit('/').next().unwrap_or_default();
        let Some((_, my_seq)) = parse_node_name(node_name, &self.separator) else {
            cleanup.delete_now().await;
            return Err(LockError::internal(format!("coordination service returned malformed node {node_path}")));
        };

        match self.wait_for_turn(key, my_seq, deadline).await {
            Ok(true) => {
                cleanup.disarm();
                self.held.insert(node_path.clone(), key.clone());
                debug!("Acquired queue lock {} in namespace {}", node_path, self.namespace);
                Ok(Some(HeldToken::Queue { node_path }))
            }
            Ok(false) => {
                cleanup.delete_now().await;
                Ok(None)
            }
            Err(err) => {
                cleanup.delete_now().await;
                Err(err)
            }
        }
    }

    async fn release(&self, key: &LockKey, token: HeldToken) -> Result<()> {
        let node_path = match token {
            HeldToken::Queue { node_path } => node_path,
            other => return Err(LockError::internal(format!("queue backend cannot release {other:?} for key {key}"))),
        };
        self.held.remove(&node_path);

        let mut cleanup = NodeCleanup::new(self.service.clone(), node_path.clone());
        let deleted = self.service.delete(&node_path).await;
        cleanup.disarm();

        match deleted {
            Ok(()) => Ok(()),
            Err(err) if err.is_vanished() => {
                warn!("Queue node {} vanished before release: {}", node_path, err);
                Ok(())
            }
            Err(err) => Err(LockError::from_store(key.as_str(), err)),
        }
    }

    async fn run_observer(&self, cancel: CancellationToken) {
        let mut ticker = interval(self.check_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("Queue observer for namespace {} stopped", self.namespace);
                    break;
                }
                _ = ticker.tick() => {
                    let snapshot: Vec<(String, LockKey)> =
                        self.held.iter().map(|node| (node.key().clone(), node.value().clone())).collect();
                    for (path, key) in snapshot {
                        match self.service.exists(&path).await {
                            Ok(true) => {}
                            Ok(false) => {
                                error!("Queue node {} for key {} disappeared while held, mutual exclusion is no longer guaranteed", path, key);
                                self.held.remove(&path);
                            }
                            Err(err) => warn!("Failed to check queue node {}: {}", path, err),
                        }
                    }
                }
            }
        }
    }
}
