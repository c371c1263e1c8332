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
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tokio::sync::oneshot;
use tracing::debug;

use crate::{
    backend::{CoordinationService, NodeWatch},
    error::{StoreError, StoreResult},
};

/// In-process coordination tree.
///
/// This is the server side. Each [`MemorySession`] obtained from [`connect`](Self::connect)
/// behaves like one client connection: its ephemeral nodes and watches die with its session.
#[derive(Debug, Clone, Default)]
pub struct MemoryCoordinationService {
    inner: Arc<Inner>,
}

#[derive(Debug, Default)]
struct Inner {
    tree: Mutex<Tree>,
    offline: AtomicBool,
    operations: AtomicU64,
    next_session: AtomicU64,
}

#[derive(Debug, Default)]
struct Tree {
    nodes: BTreeMap<String, Node>,
    /// parent path -> next sequence number
    sequences: HashMap<String, u64>,
    watches: HashMap<String, Vec<Watcher>>,
    expired: HashSet<u64>,
}

#[derive(Debug)]
struct Node {
    ephemeral_owner: Option<u64>,
}

#[derive(Debug)]
struct Watcher {
    session: u64,
    tx: oneshot::Sender<()>,
}

fn parent_of(path: &str) -> &str {
    match path.rfind('/') {
        Some(0) | None => "/",
        Some(idx) => &path[..idx],
    }
}

impl Tree {
    fn exists(&self, path: &str) -> bool {
        path == "/" || self.nodes.contains_key(path)
    }

    fn child_names(&self, path: &str) -> Vec<String> {
        let prefix = if path == "/" { "/".to_string() } else { format!("{path}/") };
        self.nodes
            .range(prefix.clone()..)
            .take_while(|(candidate, _)| candidate.starts_with(&prefix))
            .filter_map(|(candidate, _)| {
                let rest = &candidate[prefix.len()..];
                (!rest.is_empty() && !rest.contains('/')).then(|| rest.to_string())
            })
            .collect()
    }

    fn remove(&mut self, path: &str) -> bool {
        if self.nodes.remove(path).is_none() {
            return false;
        }
        for watcher in self.watches.remove(path).unwrap_or_default() {
            let _ = watcher.tx.send(());
        }
        true
    }
}

impl MemoryCoordinationService {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a client session
    pub fn connect(&self) -> MemorySession {
        MemorySession {
            server: self.clone(),
            session: AtomicU64::new(self.open_session()),
        }
    }

    fn open_session(&self) -> u64 {
        self.inner.next_session.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// End `session`: its ephemeral nodes are deleted and its watches fire.
    ///
    /// The client reconnects with a fresh session on its next call.
    pub fn expire_session(&self, session: u64) -> usize {
        let mut tree = self.inner.tree.lock();
        tree.expired.insert(session);

        let doomed: Vec<String> = tree
            .nodes
            .iter()
            .filter(|(_, node)| node.ephemeral_owner == Some(session))
            .map(|(path, _)| path.clone())
            .collect();
        for path in &doomed {
            tree.remove(path);
        }
        // Dropping the senders wakes the session's own waiters
        for watchers in tree.watches.values_mut() {
            watchers.retain(|watcher| watcher.session != session);
        }
        debug!("Expired coordination session {}, removed {} ephemeral nodes", session, doomed.len());
        doomed.len()
    }

    /// Make every following call fail with a connection error
    pub fn set_offline(&self, offline: bool) {
        self.inner.offline.store(offline, Ordering::SeqCst);
    }

    pub fn operation_count(&self) -> u64 {
        self.inner.operations.load(Ordering::SeqCst)
    }

    pub fn node_exists(&self, path: &str) -> bool {
        self.inner.tree.lock().exists(path)
    }

    pub fn children_of(&self, path: &str) -> Vec<String> {
        self.inner.tree.lock().child_names(path)
    }

    /// Delete a node out from under its owner, as an operator or a failed session would
    pub fn remove_node(&self, path: &str) -> bool {
        self.inner.tree.lock().remove(path)
    }

    fn is_expired(&self, session: u64) -> bool {
        self.inner.tree.lock().expired.contains(&session)
    }

    fn begin(&self) -> StoreResult<()> {
        if self.inner.offline.load(Ordering::SeqCst) {
            return Err(StoreError::Connection("coordination service is offline".to_string()));
        }
        self.inner.operations.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Client session on a [`MemoryCoordinationService`]
#[derive(Debug)]
pub struct MemorySession {
    server: MemoryCoordinationService,
    session: AtomicU64,
}

impl MemorySession {
    pub fn session_id(&self) -> u64 {
        self.session.load(Ordering::SeqCst)
    }

    pub fn server(&self) -> &MemoryCoordinationService {
        &self.server
    }

    /// Current session, re-established if the previous one expired
    fn live_session(&self) -> u64 {
        let current = self.session.load(Ordering::SeqCst);
        if !self.server.is_expired(current) {
            return current;
        }
        let fresh = self.server.open_session();
        self.session.store(fresh, Ordering::SeqCst);
        debug!("Coordination session {} expired, reconnected as {}", current, fresh);
        fresh
    }
}

#[async_trait]
impl CoordinationService for MemorySession {
    async fn ensure_path(&self, path: &str) -> StoreResult<()> {
        self.server.begin()?;
        let mut tree = self.server.inner.tree.lock();
        let mut current = String::new();
        for segment in path.split('/').filter(|s| !s.is_empty()) {
            current.push('/');
            current.push_str(segment);
            tree.nodes
                .entry(current.clone())
                .or_insert(Node { ephemeral_owner: None });
        }
        Ok(())
    }

    async fn create_ephemeral_sequential(&self, prefix: &str) -> StoreResult<String> {
        self.server.begin()?;
        let session = self.live_session();
        let mut tree = self.server.inner.tree.lock();
        let parent = parent_of(prefix);
        if !tree.exists(parent) {
            return Err(StoreError::NotFound(parent.to_string()));
        }
        if tree.nodes.get(parent).is_some_and(|node| node.ephemeral_owner.is_some()) {
            return Err(StoreError::Protocol(format!("ephemeral node {parent} cannot have children")));
        }

        let counter = tree.sequences.entry(parent.to_string()).or_insert(0);
        let seq = *counter;
        *counter += 1;

        let path = format!("{prefix}{seq:010}");
        tree.nodes.insert(
            path.clone(),
            Node {
                ephemeral_owner: Some(session),
            },
        );
        Ok(path)
    }

    async fn children(&self, path: &str) -> StoreResult<Vec<String>> {
        self.server.begin()?;
        let tree = self.server.inner.tree.lock();
        if !tree.exists(path) {
            return Err(StoreError::NotFound(path.to_string()));
        }
        Ok(tree.child_names(path))
    }

    async fn exists(&self, path: &str) -> StoreResult<bool> {
        self.server.begin()?;
        Ok(self.server.inner.tree.lock().exists(path))
    }

    async fn watch_deletion(&self, path: &str) -> StoreResult<Option<NodeWatch>> {
        self.server.begin()?;
        let session = self.live_session();
        let mut tree = self.server.inner.tree.lock();
        if !tree.exists(path) {
            return Ok(None);
        }
        let (tx, rx) = oneshot::channel();
        tree.watches.entry(path.to_string()).or_default().push(Watcher { session, tx });
        Ok(Some(rx))
    }

    async fn delete(&self, path: &str) -> StoreResult<()> {
        self.server.begin()?;
        let mut tree = self.server.inner.tree.lock();
        if !tree.exists(path) || path == "/" {
            return Err(StoreError::NotFound(path.to_string()));
        }
        if !tree.child_names(path).is_empty() {
            return Err(StoreError::Protocol(format!("node {path} has children")));
        }
        tree.remove(path);
        Ok(())
    }
}
