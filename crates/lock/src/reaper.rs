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

use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep_until};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    cache::LockEntryCache,
    entry::{ClearCheck, LockEntry},
    types::LockCounters,
};

/// Background task evicting idle entries once their grace period has passed.
///
/// Entries arrive through an unbounded channel and wait in a min-heap ordered by
/// deadline. Every due entry is re-validated before eviction, so a reference taken
/// in the meantime keeps it alive.
#[derive(Debug)]
pub struct CleanupReaper {
    tx: mpsc::UnboundedSender<Arc<LockEntry>>,
    pending: Arc<AtomicUsize>,
}

struct Scheduled {
    deadline: Instant,
    seq: u64,
    entry: Arc<LockEntry>,
}

impl PartialEq for Scheduled {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.seq == other.seq
    }
}

impl Eq for Scheduled {}

impl PartialOrd for Scheduled {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Scheduled {
    fn cmp(&self, other: &Self) -> Ordering {
        self.deadline.cmp(&other.deadline).then(self.seq.cmp(&other.seq))
    }
}

impl CleanupReaper {
    /// Start the reaper task on `runtime`; it stops when `cancel` fires
    pub(crate) fn spawn(
        runtime: &Handle,
        namespace: String,
        cache: Arc<LockEntryCache>,
        counters: Arc<LockCounters>,
        cancel: CancellationToken,
    ) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let pending = Arc::new(AtomicUsize::new(0));
        let worker = ReaperWorker {
            namespace,
            cache,
            counters,
            pending: pending.clone(),
            queue: BinaryHeap::new(),
            seq: 0,
        };
        let handle = runtime.spawn(worker.run(rx, cancel));
        (Self { tx, pending }, handle)
    }

    /// Hand an idle entry to the reaper
    pub fn schedule(&self, entry: Arc<LockEntry>) {
        if let Err(err) = self.tx.send(entry) {
            warn!("Cleanup reaper stopped, lock entry for key {} stays cached", err.0.key());
        }
    }

    /// Entries currently queued
    pub fn pending(&self) -> usize {
        self.pending.load(AtomicOrdering::Relaxed)
    }
}

struct ReaperWorker {
    namespace: String,
    cache: Arc<LockEntryCache>,
    counters: Arc<LockCounters>,
    pending: Arc<AtomicUsize>,
    queue: BinaryHeap<Reverse<Scheduled>>,
    seq: u64,
}

impl ReaperWorker {
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<Arc<LockEntry>>, cancel: CancellationToken) {
        debug!("Cleanup reaper started for namespace {}", self.namespace);
        loop {
            let next_due = self.queue.peek().map(|Reverse(item)| item.deadline);
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    info!("Cleanup reaper for namespace {} stopped, {} entries pending", self.namespace, self.queue.len());
                    break;
                }
                received = rx.recv() => match received {
                    Some(entry) => {
                        // A missing deadline means the entry was referenced again; the due check skips it.
                        let deadline = entry.clear_deadline().unwrap_or_else(Instant::now);
                        self.push(deadline, entry);
                    }
                    None => break,
                },
                _ = sleep_until(next_due.unwrap_or_else(Instant::now)), if next_due.is_some() => {
                    self.drain_due(Instant::now());
                }
            }
        }
    }

    fn push(&mut self, deadline: Instant, entry: Arc<LockEntry>) {
        self.seq = self.seq.wrapping_add(1);
        self.queue.push(Reverse(Scheduled {
            deadline,
            seq: self.seq,
            entry,
        }));
        self.pending.store(self.queue.len(), AtomicOrdering::Relaxed);
    }

    fn drain_due(&mut self, now: Instant) {
        while self.queue.peek().is_some_and(|Reverse(item)| item.deadline <= now) {
            let Some(Reverse(item)) = self.queue.pop() else {
                break;
            };
            match item.entry.try_clear(now) {
                ClearCheck::Clear => {
                    if self.cache.remove_if_same(&item.entry) {
                        LockCounters::bump(&self.counters.evicted);
                        debug!("Evicted idle lock entry {} from namespace {}", item.entry.key(), self.namespace);
                    }
                }
                ClearCheck::Requeue(deadline) => self.push(deadline, item.entry),
                ClearCheck::Skip => {}
            }
        }
        self.pending.store(self.queue.len(), AtomicOrdering::Relaxed);
    }
}
