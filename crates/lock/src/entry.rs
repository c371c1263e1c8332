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
use std::time::Duration;
use tokio::sync::Notify;
use tokio::sync::futures::Notified;
use tokio::time::Instant;

use crate::{
    backend::HeldToken,
    types::{LockKey, OwnerId},
};

/// Shared, reentrant lock record for one key.
///
/// One instance is shared by every local caller contending the key. Ownership,
/// hold count, reference count and the cleanup deadline only change under the
/// entry's own mutex.
#[derive(Debug)]
pub struct LockEntry {
    key: LockKey,
    state: Mutex<EntryState>,
    /// Wakes local waiters polling the store when a local holder lets go
    released: Notify,
}

#[derive(Debug, Default)]
struct EntryState {
    owner: Option<OwnerId>,
    hold_count: u32,
    ref_count: u32,
    clear_deadline: Option<Instant>,
    /// Sitting in the reaper's queue
    scheduled: bool,
    /// Evicted (or being evicted); refuses new references
    torn_down: bool,
    token: Option<HeldToken>,
}

impl EntryState {
    fn is_idle(&self) -> bool {
        self.ref_count == 0 && self.hold_count == 0
    }
}

/// Result of [`LockEntry::release`]
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum EntryRelease {
    NotOwner,
    StillHeld,
    Released { token: Option<HeldToken>, idle: bool },
}

/// Reaper decision for a due entry
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum ClearCheck {
    /// Evict now; the entry is torn down
    Clear,
    /// Still idle but the deadline moved; requeue
    Requeue(Instant),
    /// Referenced again; drop from the queue
    Skip,
}

impl LockEntry {
    pub(crate) fn new(key: LockKey) -> Self {
        Self {
            key,
            state: Mutex::new(EntryState::default()),
            released: Notify::new(),
        }
    }

    pub fn key(&self) -> &LockKey {
        &self.key
    }

    /// Current holder, if any
    pub fn holder(&self) -> Option<OwnerId> {
        let state = self.state.lock();
        if state.hold_count > 0 { state.owner.clone() } else { None }
    }

    pub fn hold_count(&self) -> u32 {
        self.state.lock().hold_count
    }

    pub fn ref_count(&self) -> u32 {
        self.state.lock().ref_count
    }

    pub fn is_held(&self) -> bool {
        self.state.lock().hold_count > 0
    }

    pub fn is_torn_down(&self) -> bool {
        self.state.lock().torn_down
    }

    pub fn clear_deadline(&self) -> Option<Instant> {
        self.state.lock().clear_deadline
    }

    pub fn is_owner(&self, owner: &OwnerId) -> bool {
        let state = self.state.lock();
        state.hold_count > 0 && state.owner.as_ref() == Some(owner)
    }

    /// Take a reference. Fails once the entry has been torn down.
    pub(crate) fn inc_ref(&self) -> bool {
        let mut state = self.state.lock();
        if state.torn_down {
            return false;
        }
        state.ref_count += 1;
        state.clear_deadline = None;
        true
    }

    /// Drop a reference; returns true when the entry became idle
    pub(crate) fn dec_ref(&self) -> bool {
        let mut state = self.state.lock();
        state.ref_count = state.ref_count.saturating_sub(1);
        state.is_idle()
    }

    /// Record a successful distributed acquisition by `owner`.
    ///
    /// Hands the token back if the entry is already held, by any owner; the held
    /// token is never replaced.
    pub(crate) fn mark_acquired(&self, owner: OwnerId, token: HeldToken) -> Result<(), HeldToken> {
        let mut state = self.state.lock();
        if state.hold_count > 0 {
            return Err(token);
        }
        state.hold_count += 1;
        state.owner = Some(owner);
        state.token = Some(token);
        Ok(())
    }

    /// Release one hold layer on behalf of `owner`.
    ///
    /// On the last layer the owner's reference is dropped along with the hold.
    pub(crate) fn release(&self, owner: &OwnerId) -> EntryRelease {
        let mut state = self.state.lock();
        if state.hold_count == 0 || state.owner.as_ref() != Some(owner) {
            return EntryRelease::NotOwner;
        }
        state.hold_count -= 1;
        if state.hold_count > 0 {
            return EntryRelease::StillHeld;
        }
        state.owner = None;
        state.ref_count = state.ref_count.saturating_sub(1);
        EntryRelease::Released {
            token: state.token.take(),
            idle: state.is_idle(),
        }
    }

    /// Drop every hold layer regardless of owner; `None` when nothing was held
    pub(crate) fn force_release(&self) -> Option<(Option<HeldToken>, bool)> {
        let mut state = self.state.lock();
        if state.hold_count == 0 {
            return None;
        }
        state.hold_count = 0;
        state.owner = None;
        state.ref_count = state.ref_count.saturating_sub(1);
        Some((state.token.take(), state.is_idle()))
    }

    /// Set a fresh cleanup deadline.
    ///
    /// Returns true when the caller must enqueue the entry; false when it is not
    /// idle or already queued (the reaper picks up the new deadline on dequeue).
    pub(crate) fn schedule_clear(&self, grace: Duration) -> bool {
        let mut state = self.state.lock();
        if !state.is_idle() || state.torn_down {
            return false;
        }
        state.clear_deadline = Some(Instant::now() + grace);
        if state.scheduled {
            return false;
        }
        state.scheduled = true;
        true
    }

    /// Re-validate a dequeued entry at `now`
    pub(crate) fn try_clear(&self, now: Instant) -> ClearCheck {
        let mut state = self.state.lock();
        match state.clear_deadline {
            Some(deadline) if state.is_idle() && !state.torn_down => {
                if deadline > now {
                    ClearCheck::Requeue(deadline)
                } else {
                    state.torn_down = true;
                    state.scheduled = false;
                    state.clear_deadline = None;
                    ClearCheck::Clear
                }
            }
            _ => {
                state.scheduled = false;
                state.clear_deadline = None;
                ClearCheck::Skip
            }
        }
    }

    /// Future resolving at the next local release of this entry
    pub(crate) fn released(&self) -> Notified<'_> {
        self.released.notified()
    }

    pub(crate) fn notify_released(&self) {
        self.released.notify_waiters();
    }
}
