//! Generational request cache with offline support.
//!
//! This module provides:
//! - Named cache generations persisted in SQLite
//! - A policy engine with an always-network lane and a cache-first lane
//! - Stale-entry fallback and a synthesized 503 when the network is down

mod policy;
mod storage;
mod traits;

pub use policy::{PolicyEngine, PolicyRules};
pub use storage::{CacheStorage, SqliteStorage};
pub use traits::{CacheEntry, CacheResult, CacheSource, Clock, SystemClock};
