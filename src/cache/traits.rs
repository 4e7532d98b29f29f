//! Core types for the request cache.

use chrono::{DateTime, Duration, Utc};

use crate::http::Response;

/// A stored response together with the moment it was captured.
#[derive(Debug, Clone)]
pub struct CacheEntry {
  pub response: Response,
  /// None for entries with no recorded capture time; those are never fresh
  pub captured_at: Option<DateTime<Utc>>,
}

impl CacheEntry {
  /// Entries captured in the future (the clock went backwards) are expired.
  pub fn is_fresh(&self, now: DateTime<Utc>, expiry: Duration) -> bool {
    match self.captured_at {
      Some(captured_at) => captured_at <= now && now - captured_at < expiry,
      None => false,
    }
  }
}

/// Result from a cache operation, including data and metadata about the source.
#[derive(Debug, Clone)]
pub struct CacheResult<T> {
  /// The actual data
  pub data: T,
  /// Where the data came from
  pub source: CacheSource,
  /// When the data was cached (if from cache)
  pub cached_at: Option<DateTime<Utc>>,
}

impl<T> CacheResult<T> {
  /// Create a new cache result from fresh network data.
  pub fn from_network(data: T) -> Self {
    Self {
      data,
      source: CacheSource::Network,
      cached_at: None,
    }
  }

  /// Create a new cache result from cached data.
  pub fn from_cache(data: T, cached_at: Option<DateTime<Utc>>) -> Self {
    Self {
      data,
      source: CacheSource::CacheFresh,
      cached_at,
    }
  }

  /// Create a new cache result for offline mode.
  pub fn offline(data: T, cached_at: Option<DateTime<Utc>>) -> Self {
    Self {
      data,
      source: CacheSource::Offline,
      cached_at,
    }
  }

  /// Built locally because neither network nor cache could answer.
  pub fn unavailable(data: T) -> Self {
    Self {
      data,
      source: CacheSource::Unavailable,
      cached_at: None,
    }
  }
}

/// Indicates where a response came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheSource {
  /// Fresh data from network
  Network,
  /// Data from cache, still considered fresh
  CacheFresh,
  /// Offline mode - network unavailable, serving cached data
  Offline,
  /// Offline with nothing cached
  Unavailable,
}

impl std::fmt::Display for CacheSource {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    let s = match self {
      Self::Network => "network",
      Self::CacheFresh => "cache",
      Self::Offline => "offline (stale cache)",
      Self::Unavailable => "offline (no cache)",
    };
    f.write_str(s)
  }
}

/// Source of the current time, injectable for expiry tests.
pub trait Clock: Send + Sync {
  fn now(&self) -> DateTime<Utc>;
}

pub struct SystemClock;

impl Clock for SystemClock {
  fn now(&self) -> DateTime<Utc> {
    Utc::now()
  }
}
