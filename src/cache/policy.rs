//! Policy engine that decides between the store and the network per request.

use chrono::Duration;
use color_eyre::Result;
use std::sync::Arc;
use tracing::{debug, warn};

use super::storage::CacheStorage;
use super::traits::{CacheEntry, CacheResult, Clock};
use crate::config::Config;
use crate::http::{Request, Response};
use crate::network::Network;

/// Which strategy a request is served with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lane {
  /// Live data endpoint: always revalidated, never written to the store
  NetworkOnly,
  /// App shell and other static assets
  CacheFirst,
}

/// Fixed parameters of the policy, taken from configuration.
#[derive(Debug, Clone)]
pub struct PolicyRules {
  /// Host substring that routes a request to the network-only lane
  pub network_only_host: String,
  /// Age after which a cache-first entry is refreshed
  pub expiry: Duration,
  /// `max-age` stamped onto network-only responses
  pub network_only_max_age_secs: u64,
}

impl PolicyRules {
  pub fn from_config(config: &Config) -> Self {
    Self {
      network_only_host: config.network_only_host.clone(),
      expiry: config.expiry(),
      network_only_max_age_secs: config.network_only_max_age_secs,
    }
  }

  pub fn classify(&self, request: &Request) -> Lane {
    if request.host().contains(&self.network_only_host) {
      Lane::NetworkOnly
    } else {
      Lane::CacheFirst
    }
  }

  fn cache_control_override(&self) -> String {
    format!("public, max-age={}", self.network_only_max_age_secs)
  }
}

/// Serves requests from the store or the network according to [`PolicyRules`].
///
/// The engine never owns a generation; callers pass the generation that
/// currently controls them (or None before the first activation, in which
/// case nothing is read or written).
pub struct PolicyEngine<S: CacheStorage, N: Network> {
  storage: Arc<S>,
  network: Arc<N>,
  clock: Arc<dyn Clock>,
  rules: PolicyRules,
}

impl<S: CacheStorage, N: Network> PolicyEngine<S, N> {
  pub fn new(storage: Arc<S>, network: Arc<N>, clock: Arc<dyn Clock>, rules: PolicyRules) -> Self {
    Self {
      storage,
      network,
      clock,
      rules,
    }
  }

  /// Answer a request.
  ///
  /// Only the network-only lane can return `Err`, when the network fails and
  /// no stored entry exists for the key.
  pub async fn handle(
    &self,
    generation: Option<&str>,
    request: &Request,
  ) -> Result<CacheResult<Response>> {
    match self.rules.classify(request) {
      Lane::NetworkOnly => self.network_only(generation, request).await,
      Lane::CacheFirst => Ok(self.cache_first(generation, request).await),
    }
  }

  /// Always-network lane.
  ///
  /// 1. Fetch from network, rewrite Cache-Control, never touch the store
  /// 2. On network failure, fall back to a stored entry for the key
  /// 3. Otherwise propagate the network error
  async fn network_only(
    &self,
    generation: Option<&str>,
    request: &Request,
  ) -> Result<CacheResult<Response>> {
    debug!("network-only: {}", request);
    match self.network.fetch(request).await {
      Ok(response) => {
        let response =
          response.with_header("Cache-Control", &self.rules.cache_control_override());
        Ok(CacheResult::from_network(response))
      }
      Err(err) => match self.lookup(generation, request) {
        Some(entry) => {
          warn!("Network failed for {}, serving stored copy: {}", request, err);
          Ok(CacheResult::offline(entry.response, entry.captured_at))
        }
        None => Err(err),
      },
    }
  }

  /// Cache-first-with-expiry lane.
  ///
  /// 1. Check cache - if fresh, return immediately
  /// 2. If stale/missing, fetch from network
  /// 3. Store cacheable responses, pass the rest through
  /// 4. On network failure, return stale cache or a synthesized 503
  async fn cache_first(&self, generation: Option<&str>, request: &Request) -> CacheResult<Response> {
    let cached = self.lookup(generation, request);

    if let Some(entry) = &cached {
      if entry.is_fresh(self.clock.now(), self.rules.expiry) {
        debug!("cache hit: {}", request);
        return CacheResult::from_cache(entry.response.clone(), entry.captured_at);
      }
      debug!("cache expired: {}", request);
    } else {
      debug!("cache miss: {}", request);
    }

    match self.network.fetch(request).await {
      Ok(response) => {
        if response.is_cacheable() {
          if let Some(generation) = generation {
            self.store(generation, request, &response);
          }
        } else {
          debug!(
            "not caching {} (status {}, {})",
            request,
            response.status,
            response.kind.as_str()
          );
        }
        CacheResult::from_network(response)
      }
      Err(err) => match cached {
        Some(entry) => {
          warn!("Network failed for {}, serving stale cache: {}", request, err);
          CacheResult::offline(entry.response, entry.captured_at)
        }
        None => {
          warn!("Network failed for {} with nothing cached: {}", request, err);
          CacheResult::unavailable(Response::offline())
        }
      },
    }
  }

  /// Read an entry from the controlling generation; storage errors count as a miss.
  fn lookup(&self, generation: Option<&str>, request: &Request) -> Option<CacheEntry> {
    let generation = generation?;
    match self.storage.get(generation, &request.cache_key()) {
      Ok(entry) => entry,
      Err(err) => {
        warn!("Cache read failed for {}: {}", request, err);
        None
      }
    }
  }

  /// Write a cacheable response; storage errors skip the write.
  fn store(&self, generation: &str, request: &Request, response: &Response) {
    let captured_at = Some(self.clock.now());
    match self
      .storage
      .put(generation, &request.cache_key(), response, captured_at)
    {
      Ok(true) => {}
      Ok(false) => debug!("{} was deleted, not caching {}", generation, request),
      Err(err) => warn!("Cache write failed for {}: {}", request, err),
    }
  }
}
