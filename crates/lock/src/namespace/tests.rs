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

use super::*;
use crate::backend::{BackendProvider, CoordinationService, NodeWatch};
use crate::error::{StoreError, StoreResult};
use crate::memory::{MemoryCoordinationService, MemoryLeaseStore, MemorySession};
use crate::registry::LockRegistry;
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

fn lease_registry() -> (LockRegistry, Arc<MemoryLeaseStore>) {
    let store = Arc::new(MemoryLeaseStore::new());
    let registry = LockRegistry::new(LockConfig::minimal(), BackendProvider::Lease(store.clone())).unwrap();
    (registry, store)
}

fn queue_registry(server: &MemoryCoordinationService) -> LockRegistry {
    LockRegistry::new(LockConfig::minimal(), BackendProvider::Queue(Arc::new(server.connect()))).unwrap()
}

/// Memory session with a slow delete and an optional expired child listing
#[derive(Debug)]
struct ScriptedSession {
    inner: MemorySession,
    delete_delay: Duration,
    expire_next_listing: AtomicBool,
}

impl ScriptedSession {
    fn new(inner: MemorySession) -> Self {
        Self {
            inner,
            delete_delay: Duration::ZERO,
            expire_next_listing: AtomicBool::new(false),
        }
    }

    fn with_delete_delay(mut self, delay: Duration) -> Self {
        self.delete_delay = delay;
        self
    }

    fn expire_next_listing(&self) {
        self.expire_next_listing.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl CoordinationService for ScriptedSession {
    async fn ensure_path(&self, path: &str) -> StoreResult<()> {
        self.inner.ensure_path(path).await
    }

    async fn create_ephemeral_sequential(&self, prefix: &str) -> StoreResult<String> {
        self.inner.create_ephemeral_sequential(prefix).await
    }

    async fn children(&self, path: &str) -> StoreResult<Vec<String>> {
        if self.expire_next_listing.swap(false, Ordering::SeqCst) {
            return Err(StoreError::SessionExpired(format!("session {}", self.inner.session_id())));
        }
        self.inner.children(path).await
    }

    async fn exists(&self, path: &str) -> StoreResult<bool> {
        self.inner.exists(path).await
    }

    async fn watch_deletion(&self, path: &str) -> StoreResult<Option<NodeWatch>> {
        self.inner.watch_deletion(path).await
    }

    async fn delete(&self, path: &str) -> StoreResult<()> {
        sleep(self.delete_delay).await;
        self.inner.delete(path).await
    }
}

#[tokio::test]
async fn test_reentrant_lock() {
    let (registry, _store) = lease_registry();
    let ns = registry.get("orders").unwrap();
    let owner = OwnerId::new();

    let outer = ns.lock("k", &owner, None).await.unwrap();
    assert_eq!(outer, LockStatus::Acquired);
    let inner = ns.lock("k", &owner, None).await.unwrap();
    assert_eq!(inner, LockStatus::NoActionNeeded);

    assert_eq!(ns.unlock("k", &owner, Some(inner), false).await.unwrap(), ReleaseOutcome::NotHeld);
    assert_eq!(ns.holder("k"), Some(owner.clone()));

    assert_eq!(ns.unlock("k", &owner, Some(outer), false).await.unwrap(), ReleaseOutcome::Released);
    assert!(!ns.is_locked("k"));

    let stats = ns.stats();
    assert_eq!(stats.acquired, 1);
    assert_eq!(stats.no_action_needed, 1);
    assert_eq!(stats.released, 1);
}

#[tokio::test]
async fn test_release_without_hold_makes_no_store_call() {
    let (registry, store) = lease_registry();
    let ns = registry.get("orders").unwrap();
    let owner = OwnerId::new();

    let before = store.operation_count();
    for status in [None, Some(LockStatus::TimedOut), Some(LockStatus::NoActionNeeded)] {
        assert_eq!(ns.unlock("k", &owner, status, false).await.unwrap(), ReleaseOutcome::NotHeld);
    }
    assert_eq!(store.operation_count(), before);
}

#[tokio::test]
async fn test_unlock_by_other_owner_is_ignored() {
    let (registry, _store) = lease_registry();
    let ns = registry.get("orders").unwrap();
    let owner = OwnerId::new();

    let status = ns.lock("k", &owner, None).await.unwrap();
    let outcome = ns.unlock("k", &OwnerId::new(), Some(status), false).await.unwrap();
    assert_eq!(outcome, ReleaseOutcome::NotHeld);
    assert_eq!(ns.holder("k"), Some(owner));
}

#[tokio::test]
async fn test_local_contention_times_out_then_succeeds() {
    let (registry, _store) = lease_registry();
    let ns = registry.get("orders").unwrap();
    let a = OwnerId::from("a");
    let b = OwnerId::from("b");

    let held = ns.lock("k", &a, None).await.unwrap();
    let status = ns.lock("k", &b, Some(Duration::from_millis(50))).await.unwrap();
    assert_eq!(status, LockStatus::TimedOut);
    assert_eq!(ns.stats().timed_out, 1);

    let waiter = {
        let ns = ns.clone();
        let b = b.clone();
        tokio::spawn(async move { ns.lock("k", &b, Some(Duration::from_secs(5))).await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;
    ns.unlock("k", &a, Some(held), false).await.unwrap();

    assert_eq!(waiter.await.unwrap().unwrap(), LockStatus::Acquired);
    assert_eq!(ns.holder("k"), Some(b));
}

#[tokio::test(start_paused = true)]
async fn test_entry_reused_within_grace_and_evicted_after() {
    let (registry, _store) = lease_registry();
    let ns = registry.get("orders").unwrap();
    let owner = OwnerId::new();

    let status = ns.lock("k", &owner, None).await.unwrap();
    let first = ns.entry("k").unwrap();
    ns.unlock("k", &owner, Some(status), false).await.unwrap();

    tokio::time::sleep(Duration::from_millis(100)).await;
    let status = ns.lock("k", &owner, None).await.unwrap();
    assert!(Arc::ptr_eq(&first, &ns.entry("k").unwrap()));
    ns.unlock("k", &owner, Some(status), false).await.unwrap();
    assert_eq!(ns.stats().pending_cleanup, 1);

    // grace period is 200ms in the minimal preset
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(ns.entry("k").is_none());
    assert!(first.is_torn_down());

    let stats = ns.stats();
    assert_eq!(stats.evicted, 1);
    assert_eq!(stats.cached_entries, 0);
    assert_eq!(stats.pending_cleanup, 0);

    // a later lock builds a fresh entry
    let status = ns.lock("k", &owner, None).await.unwrap();
    assert_eq!(status, LockStatus::Acquired);
    assert!(!Arc::ptr_eq(&first, &ns.entry("k").unwrap()));
}

#[tokio::test(start_paused = true)]
async fn test_keepalive_release_stays_cached() {
    let (registry, _store) = lease_registry();
    let ns = registry.get("orders").unwrap();
    let owner = OwnerId::new();

    let status = ns.lock("k", &owner, None).await.unwrap();
    ns.unlock("k", &owner, Some(status), true).await.unwrap();

    tokio::time::sleep(Duration::from_secs(1)).await;
    assert!(ns.entry("k").is_some());
    assert_eq!(ns.stats().evicted, 0);
}

#[tokio::test(start_paused = true)]
async fn test_timed_out_attempt_schedules_cleanup() {
    let (registry, store) = lease_registry();
    let ns = registry.get("orders").unwrap();
    // another process holds the lease
    store.force_set("lock:orders:k", "foreign", Duration::from_secs(60));

    let status = ns.lock("k", &OwnerId::new(), Some(Duration::ZERO)).await.unwrap();
    assert_eq!(status, LockStatus::TimedOut);
    assert_eq!(ns.entry("k").unwrap().ref_count(), 0);

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(ns.entry("k").is_none());
}

#[tokio::test]
async fn test_backend_failure_is_reported() {
    let (registry, store) = lease_registry();
    let ns = registry.get("orders").unwrap();
    store.set_offline(true);

    let err = ns.lock("k", &OwnerId::new(), Some(Duration::from_secs(1))).await.unwrap_err();
    assert!(matches!(err, LockError::Backend { .. }));
    assert_eq!(ns.stats().failed, 1);
    assert_eq!(ns.entry("k").unwrap().ref_count(), 0);

    store.set_offline(false);
    assert_eq!(ns.lock("k", &OwnerId::new(), None).await.unwrap(), LockStatus::Acquired);
}

#[tokio::test]
async fn test_reset_all_releases_every_hold() {
    let store = Arc::new(MemoryLeaseStore::new());
    let first = LockRegistry::new(LockConfig::minimal(), BackendProvider::Lease(store.clone())).unwrap();
    let second = LockRegistry::new(LockConfig::minimal(), BackendProvider::Lease(store.clone())).unwrap();
    let ns = first.get("orders").unwrap();

    ns.lock("a", &OwnerId::new(), None).await.unwrap();
    ns.lock("b", &OwnerId::new(), None).await.unwrap();
    assert_eq!(ns.stats().held_entries, 2);

    assert_eq!(ns.reset_all().await, 2);
    assert_eq!(ns.stats().held_entries, 0);
    assert!(store.is_empty());

    let other = second.get("orders").unwrap();
    assert_eq!(other.lock("a", &OwnerId::new(), Some(Duration::ZERO)).await.unwrap(), LockStatus::Acquired);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_local_owners_are_mutually_exclusive() {
    let (registry, _store) = lease_registry();
    let ns = registry.get("orders").unwrap();
    let inside = Arc::new(AtomicUsize::new(0));
    let max_inside = Arc::new(AtomicUsize::new(0));

    let tasks: Vec<_> = (0..8)
        .map(|_| {
            let ns = ns.clone();
            let inside = inside.clone();
            let max_inside = max_inside.clone();
            tokio::spawn(async move {
                let owner = OwnerId::new();
                for _ in 0..5 {
                    let status = ns.lock("shared", &owner, None).await.unwrap();
                    assert_eq!(status, LockStatus::Acquired);
                    let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
                    max_inside.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(1)).await;
                    inside.fetch_sub(1, Ordering::SeqCst);
                    ns.unlock("shared", &owner, Some(status), false).await.unwrap();
                }
            })
        })
        .collect();
    futures::future::join_all(tasks).await.into_iter().for_each(|r| r.unwrap());

    assert_eq!(max_inside.load(Ordering::SeqCst), 1);
    assert_eq!(ns.stats().acquired, 40);
}

#[tokio::test(start_paused = true)]
async fn test_lease_renewal_keeps_lock_past_ttl() {
    let store = Arc::new(MemoryLeaseStore::new());
    let holder = LockRegistry::new(LockConfig::minimal(), BackendProvider::Lease(store.clone())).unwrap();
    let rival = LockRegistry::new(LockConfig::minimal(), BackendProvider::Lease(store.clone())).unwrap();
    let held_ns = holder.get("orders").unwrap();
    let rival_ns = rival.get("orders").unwrap();

    assert_eq!(held_ns.lock("k", &OwnerId::new(), None).await.unwrap(), LockStatus::Acquired);

    // TTL is 600ms; renewal every 150ms keeps it alive
    tokio::time::sleep(Duration::from_millis(1500)).await;
    assert_eq!(rival_ns.lock("k", &OwnerId::new(), Some(Duration::ZERO)).await.unwrap(), LockStatus::TimedOut);

    // without renewal the lease lapses within one TTL
    held_ns.shutdown().await;
    tokio::time::sleep(Duration::from_millis(700)).await;
    assert_eq!(rival_ns.lock("k", &OwnerId::new(), Some(Duration::ZERO)).await.unwrap(), LockStatus::Acquired);
}

#[tokio::test]
async fn test_queue_rejects_separator_before_any_call() {
    let server = MemoryCoordinationService::new();
    let registry = queue_registry(&server);
    let ns = registry.get("jobs").unwrap();

    let err = ns.lock("report_lock_2024", &OwnerId::new(), None).await.unwrap_err();
    assert!(matches!(err, LockError::InvalidKey { .. }));
    assert_eq!(server.operation_count(), 0);
    assert!(ns.entry("report_lock_2024").is_none());
}

#[tokio::test(start_paused = true)]
async fn test_queue_grants_in_arrival_order() {
    let server = MemoryCoordinationService::new();
    let registries: Vec<LockRegistry> = (0..3).map(|_| queue_registry(&server)).collect();
    let namespaces: Vec<Arc<Namespace>> = registries.iter().map(|r| r.get("jobs").unwrap()).collect();
    let order = Arc::new(Mutex::new(Vec::new()));

    let a = OwnerId::from("a");
    let held = namespaces[0].lock("k", &a, None).await.unwrap();
    assert_eq!(held, LockStatus::Acquired);

    let mut waiters = Vec::new();
    for (idx, name) in [(1, "b"), (2, "c")] {
        let ns = namespaces[idx].clone();
        let order = order.clone();
        waiters.push(tokio::spawn(async move {
            let owner = OwnerId::from(name);
            let status = ns.lock("k", &owner, None).await.unwrap();
            order.lock().push(name);
            tokio::time::sleep(Duration::from_millis(10)).await;
            ns.unlock("k", &owner, Some(status), false).await.unwrap();
        }));
        // let each waiter enqueue before the next arrives
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(server.children_of("/locks/jobs").len(), 3);

    namespaces[0].unlock("k", &a, Some(held), false).await.unwrap();
    for waiter in waiters {
        waiter.await.unwrap();
    }

    assert_eq!(*order.lock(), vec!["b", "c"]);
    assert!(server.children_of("/locks/jobs").is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_queue_timed_out_waiter_leaves_no_node() {
    let server = MemoryCoordinationService::new();
    let holder = queue_registry(&server);
    let waiter = queue_registry(&server);

    let status = holder.acquire("jobs", "k", &OwnerId::new(), None).await.unwrap();
    assert_eq!(status, LockStatus::Acquired);

    let status = waiter
        .acquire("jobs", "k", &OwnerId::new(), Some(Duration::from_millis(100)))
        .await
        .unwrap();
    assert_eq!(status, LockStatus::TimedOut);
    assert_eq!(server.children_of("/locks/jobs").len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_queue_session_expiry_is_retried() {
    let server = MemoryCoordinationService::new();
    let holder = queue_registry(&server);
    let session = server.connect();
    let expired_id = session.session_id();
    let waiter = LockRegistry::new(LockConfig::minimal(), BackendProvider::Queue(Arc::new(session))).unwrap();

    let a = OwnerId::new();
    let held = holder.acquire("jobs", "k", &a, None).await.unwrap();

    let waiter_ns = waiter.get("jobs").unwrap();
    let task = {
        let ns = waiter_ns.clone();
        tokio::spawn(async move { ns.lock("k", &OwnerId::new(), Some(Duration::from_secs(5))).await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(server.expire_session(expired_id), 1);

    // the waiter re-enqueues under a fresh session
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(server.children_of("/locks/jobs").len(), 2);

    holder.release("jobs", "k", &a, Some(held), false).await.unwrap();
    assert_eq!(task.await.unwrap().unwrap(), LockStatus::Acquired);
    assert!(waiter_ns.stats().vanished_retries >= 1);
}

#[tokio::test]
async fn test_queue_connection_failure_is_backend_error() {
    let server = MemoryCoordinationService::new();
    let registry = queue_registry(&server);
    let ns = registry.get("jobs").unwrap();
    server.set_offline(true);

    let err = ns.lock("k", &OwnerId::new(), None).await.unwrap_err();
    assert!(matches!(err, LockError::Backend { .. }));
    assert!(!err.is_retryable());
}

#[tokio::test]
async fn test_namespace_start_inside_runtime() {
    let backend = BackendProvider::Lease(Arc::new(MemoryLeaseStore::new()))
        .build("ns", &LockConfig::minimal())
        .unwrap();
    let started = Namespace::start("ns".to_string(), LockConfig::minimal(), backend).unwrap();
    assert_eq!(started.name(), "ns");
    assert_eq!(started.backend_name(), "lease");
    assert!(!started.is_shutdown());
}

#[tokio::test(start_paused = true)]
async fn test_cancelled_waiter_cleans_up() {
    let server = MemoryCoordinationService::new();
    let holder = queue_registry(&server);
    let waiter = queue_registry(&server);

    let status = holder.acquire("jobs", "k", &OwnerId::new(), None).await.unwrap();
    assert_eq!(status, LockStatus::Acquired);

    let waiter_ns = waiter.get("jobs").unwrap();
    let task = {
        let ns = waiter_ns.clone();
        tokio::spawn(async move { ns.lock("k", &OwnerId::new(), None).await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(server.children_of("/locks/jobs").len(), 2);
    assert_eq!(waiter_ns.entry("k").unwrap().ref_count(), 1);

    task.abort();
    assert!(task.await.unwrap_err().is_cancelled());
    tokio::time::sleep(Duration::from_millis(20)).await;

    assert_eq!(server.children_of("/locks/jobs").len(), 1);
    assert_eq!(waiter_ns.entry("k").unwrap().ref_count(), 0);
}

#[tokio::test]
async fn test_queue_local_contention_times_out_then_succeeds() {
    let server = MemoryCoordinationService::new();
    let registry = queue_registry(&server);
    let ns = registry.get("jobs").unwrap();
    let a = OwnerId::from("a");
    let b = OwnerId::from("b");

    let held = ns.lock("k", &a, None).await.unwrap();
    let status = ns.lock("k", &b, Some(Duration::from_millis(50))).await.unwrap();
    assert_eq!(status, LockStatus::TimedOut);
    assert_eq!(server.children_of("/locks/jobs").len(), 1);

    let waiter = {
        let ns = ns.clone();
        let b = b.clone();
        tokio::spawn(async move { ns.lock("k", &b, Some(Duration::from_secs(5))).await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(server.children_of("/locks/jobs").len(), 2);
    ns.unlock("k", &a, Some(held), false).await.unwrap();

    assert_eq!(waiter.await.unwrap().unwrap(), LockStatus::Acquired);
    assert_eq!(ns.holder("k"), Some(b));
    assert_eq!(server.children_of("/locks/jobs").len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_queue_local_owners_are_mutually_exclusive() {
    let server = MemoryCoordinationService::new();
    let registry = queue_registry(&server);
    let ns = registry.get("jobs").unwrap();
    let inside = Arc::new(AtomicUsize::new(0));
    let max_inside = Arc::new(AtomicUsize::new(0));

    let tasks: Vec<_> = (0..4)
        .map(|_| {
            let ns = ns.clone();
            let inside = inside.clone();
            let max_inside = max_inside.clone();
            tokio::spawn(async move {
                let owner = OwnerId::new();
                for _ in 0..3 {
                    let status = ns.lock("shared", &owner, None).await.unwrap();
                    assert_eq!(status, LockStatus::Acquired);
                    let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
                    max_inside.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(1)).await;
                    inside.fetch_sub(1, Ordering::SeqCst);
                    ns.unlock("shared", &owner, Some(status), false).await.unwrap();
                }
            })
        })
        .collect();
    futures::future::join_all(tasks).await.into_iter().for_each(|r| r.unwrap());

    assert_eq!(max_inside.load(Ordering::SeqCst), 1);
    assert_eq!(ns.stats().acquired, 12);
    assert!(server.children_of("/locks/jobs").is_empty());
}

#[tokio::test]
async fn test_lost_lease_grant_to_second_owner_is_handed_back() {
    let (registry, store) = lease_registry();
    let ns = registry.get("orders").unwrap();
    let a = OwnerId::from("a");

    ns.lock("k", &a, None).await.unwrap();
    // the lease lapsed in the store while still held here
    store.force_set("lock:orders:k", "lapsed", Duration::ZERO);

    let err = ns.lock("k", &OwnerId::from("b"), Some(Duration::ZERO)).await.unwrap_err();
    assert!(matches!(err, LockError::Internal { .. }));
    assert_eq!(ns.holder("k"), Some(a));
    assert!(store.holder("lock:orders:k").is_none());
    assert_eq!(ns.entry("k").unwrap().ref_count(), 1);
    assert_eq!(ns.stats().failed, 1);
}

#[tokio::test]
async fn test_lost_queue_node_grant_to_second_owner_is_handed_back() {
    let server = MemoryCoordinationService::new();
    let registry = queue_registry(&server);
    let ns = registry.get("jobs").unwrap();
    let a = OwnerId::from("a");

    ns.lock("k", &a, None).await.unwrap();
    assert!(server.remove_node("/locks/jobs/k_lock_0000000000"));

    let err = ns.lock("k", &OwnerId::from("b"), Some(Duration::ZERO)).await.unwrap_err();
    assert!(matches!(err, LockError::Internal { .. }));
    assert_eq!(ns.holder("k"), Some(a));
    assert!(server.children_of("/locks/jobs").is_empty());
    assert_eq!(ns.entry("k").unwrap().ref_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_same_owner_second_grant_is_handed_back() {
    let (registry, store) = lease_registry();
    let ns = registry.get("orders").unwrap();
    let a = OwnerId::from("a");
    store.force_set("lock:orders:k", "foreign", Duration::from_secs(60));

    // two tasks of one owner start waiting before either holds the key
    let tasks: Vec<_> = (0..2)
        .map(|_| {
            let ns = ns.clone();
            let a = a.clone();
            tokio::spawn(async move { ns.lock("k", &a, None).await })
        })
        .collect();
    tokio::time::sleep(Duration::from_millis(20)).await;
    store.force_set("lock:orders:k", "foreign", Duration::ZERO);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(ns.holder("k"), Some(a.clone()));

    // the winner's lease is lost, so the other task's poll succeeds
    store.force_set("lock:orders:k", "foreign", Duration::ZERO);
    let mut statuses: Vec<LockStatus> = futures::future::join_all(tasks)
        .await
        .into_iter()
        .map(|r| r.unwrap().unwrap())
        .collect();
    statuses.sort_by_key(|status| *status == LockStatus::NoActionNeeded);
    assert_eq!(statuses, vec![LockStatus::Acquired, LockStatus::NoActionNeeded]);

    let entry = ns.entry("k").unwrap();
    assert_eq!(entry.hold_count(), 1);
    assert_eq!(entry.ref_count(), 1);
    assert!(store.holder("lock:orders:k").is_none());
}

#[tokio::test(start_paused = true)]
async fn test_cancelled_queue_unlock_still_frees_key() {
    let server = MemoryCoordinationService::new();
    let session = ScriptedSession::new(server.connect()).with_delete_delay(Duration::from_millis(100));
    let registry = LockRegistry::new(LockConfig::minimal(), BackendProvider::Queue(Arc::new(session))).unwrap();
    let ns = registry.get("jobs").unwrap();
    let a = OwnerId::from("a");

    let status = ns.lock("k", &a, None).await.unwrap();
    let cancelled = tokio::time::timeout(Duration::from_millis(10), ns.unlock("k", &a, Some(status), false)).await;
    assert!(cancelled.is_err());
    assert!(!ns.is_locked("k"));

    tokio::time::sleep(Duration::from_millis(150)).await;
    assert!(server.children_of("/locks/jobs").is_empty());

    // the release still scheduled eviction (grace is 200ms)
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(ns.entry("k").is_none());

    let other = queue_registry(&server);
    let status = other.acquire("jobs", "k", &OwnerId::new(), Some(Duration::ZERO)).await.unwrap();
    assert_eq!(status, LockStatus::Acquired);
}

#[tokio::test(start_paused = true)]
async fn test_queue_expired_listing_is_retried() {
    let server = MemoryCoordinationService::new();
    let session = ScriptedSession::new(server.connect());
    session.expire_next_listing();
    let registry = LockRegistry::new(LockConfig::minimal(), BackendProvider::Queue(Arc::new(session))).unwrap();
    let ns = registry.get("jobs").unwrap();

    let status = ns.lock("k", &OwnerId::new(), Some(Duration::from_secs(1))).await.unwrap();
    assert_eq!(status, LockStatus::Acquired);
    assert_eq!(ns.stats().vanished_retries, 1);
    assert_eq!(server.children_of("/locks/jobs").len(), 1);
}
