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

//! Reentrant distributed mutual exclusion.
//!
//! Callers in one process share a single [`entry::LockEntry`] per key; the entry
//! tracks the local owner and reentrancy, while a [`backend::LockBackend`] obtains
//! the cross-process lock from either a lease store or an ordered queue on a
//! coordination service. Idle entries stay cached for a grace period and are then
//! evicted by a background reaper.

// ============================================================================
// Core Module Declarations
// ============================================================================

// Application Layer Modules
pub mod guard;
pub mod namespace;
pub mod registry;

// Backend Layer Modules
pub mod backend;
pub mod memory;

// Local Layer Modules
pub mod cache;
pub mod entry;
pub mod keyed_mutex;
pub mod reaper;

// Core Modules
pub mod config;
pub mod error;
pub mod types;

// ============================================================================
// Public API Exports
// ============================================================================

pub use crate::{
    backend::{BackendProvider, CoordinationService, HeldToken, LeaseStore, LockBackend},
    config::{LeaseConfig, LockConfig, QueueConfig},
    error::{LockError, Result, StoreError, StoreResult},
    guard::LockGuard,
    namespace::Namespace,
    registry::{LockRegistry, global_registry, init_global_registry},
    types::{LockKey, LockStats, LockStatus, OwnerId, ReleaseOutcome},
};

// ============================================================================
// Version Information
// ============================================================================

/// Current version of the lock crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
