//! Cache generation lifecycle: install, activate, claim.

use color_eyre::{eyre::eyre, Result};
use std::sync::Arc;
use tokio::sync::{watch, Mutex};
use tracing::{error, info, warn};
use url::Url;

use crate::cache::{CacheStorage, Clock};
use crate::http::{Request, Response};
use crate::network::Network;

const CURRENT_STATE: &str = "current_generation";
const WAITING_STATE: &str = "waiting_generation";

/// What happened after a successful install.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InstallOutcome {
  /// The generation was activated right away
  Activated(ActivationReport),
  /// The generation is installed and waits for activation
  Waiting,
}

/// Result of an activation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ActivationReport {
  pub current: String,
  /// Stale generations that were deleted
  pub deleted: Vec<String>,
  /// Stale generations whose deletion failed
  pub failed: Vec<String>,
}

/// Owns generation identity and the timing of transitions between them.
///
/// A generation only becomes visible to request serving through
/// [`Lifecycle::activate`]; an install that fails never touches the current
/// generation.
pub struct Lifecycle<S: CacheStorage, N: Network> {
  storage: Arc<S>,
  network: Arc<N>,
  clock: Arc<dyn Clock>,
  origin: Url,
  /// Generation controlling clients; updated on claim
  controller: watch::Sender<Option<String>>,
  /// Serializes install and activate
  transition: Mutex<()>,
}

impl<S: CacheStorage, N: Network> Lifecycle<S, N> {
  /// Create the manager, resuming the persisted current generation.
  pub fn new(storage: Arc<S>, network: Arc<N>, clock: Arc<dyn Clock>, origin: Url) -> Result<Self> {
    let current = storage.get_state(CURRENT_STATE)?;
    let (controller, _) = watch::channel(current);

    Ok(Self {
      storage,
      network,
      clock,
      origin,
      controller,
      transition: Mutex::new(()),
    })
  }

  /// Generation currently serving requests.
  pub fn current(&self) -> Option<String> {
    self.controller.borrow().clone()
  }

  /// Generation installed but not yet activated.
  pub fn waiting(&self) -> Result<Option<String>> {
    self.storage.get_state(WAITING_STATE)
  }

  /// Every stored generation with its entry count.
  pub fn inventory(&self) -> Result<Vec<(String, usize)>> {
    self
      .storage
      .generations()?
      .into_iter()
      .map(|name| {
        let count = self.storage.entry_count(&name)?;
        Ok((name, count))
      })
      .collect()
  }

  /// Watch controller changes (every claim publishes the new generation).
  #[allow(dead_code)]
  pub fn subscribe(&self) -> watch::Receiver<Option<String>> {
    self.controller.subscribe()
  }

  /// Install a generation by fetching every manifest resource.
  ///
  /// All resources are fetched before anything is written, and then written
  /// in a single transaction. Any transport failure or non-2xx status aborts
  /// the install with nothing stored.
  pub async fn install(
    &self,
    generation: &str,
    manifest: &[String],
    skip_waiting: bool,
  ) -> Result<InstallOutcome> {
    {
      let _guard = self.transition.lock().await;

      let requests = manifest
        .iter()
        .map(|target| Request::parse("GET", target, &self.origin))
        .collect::<Result<Vec<_>>>()?;

      self.storage.open_generation(generation)?;
      info!("Caching app shell for {} ({} resources)", generation, requests.len());

      let responses = futures::future::join_all(
        requests
          .iter()
          .map(|request| async move { (request, self.network.fetch(request).await) }),
      )
      .await;

      let mut entries: Vec<(String, Response)> = Vec::with_capacity(responses.len());
      for (request, result) in responses {
        let response = result.map_err(|e| {
          error!("Cache failed for {}: {}", generation, e);
          eyre!("Install of {} failed: {}", generation, e)
        })?;
        if !response.is_ok() {
          error!(
            "Cache failed for {}: {} returned {}",
            generation, request, response.status
          );
          return Err(eyre!(
            "Install of {} failed: {} returned {}",
            generation,
            request,
            response.status
          ));
        }
        entries.push((request.cache_key(), response));
      }

      self
        .storage
        .put_all(generation, &entries, self.clock.now())?;
      self.storage.set_state(WAITING_STATE, Some(generation))?;
      info!("Cache complete for {}", generation);
    }

    if skip_waiting {
      let report = self.activate().await?;
      return Ok(InstallOutcome::Activated(report));
    }

    Ok(InstallOutcome::Waiting)
  }

  /// Make the waiting generation current, evict every other generation and
  /// claim clients.
  ///
  /// The new generation is persisted before anything is deleted, so an
  /// activation that fails leaves the previous generation serving. Eviction
  /// is best-effort.
  ///
  /// With nothing waiting, re-activates the current generation (which still
  /// evicts leftovers). Fails if there is no generation at all.
  pub async fn activate(&self) -> Result<ActivationReport> {
    let _guard = self.transition.lock().await;

    let target = match self.waiting()? {
      Some(waiting) => waiting,
      None => self
        .current()
        .ok_or_else(|| eyre!("No installed generation to activate"))?,
    };

    self.storage.set_state(CURRENT_STATE, Some(&target))?;
    self.storage.set_state(WAITING_STATE, None)?;

    let mut report = ActivationReport {
      current: target.clone(),
      ..Default::default()
    };

    let stale = self.storage.generations().unwrap_or_else(|err| {
      warn!("Failed to list caches, skipping cleanup: {}", err);
      Vec::new()
    });
    for name in stale {
      if name == target {
        continue;
      }
      info!("Deleting old cache {}", name);
      match self.storage.delete_generation(&name) {
        Ok(_) => report.deleted.push(name),
        Err(err) => {
          warn!("Failed to delete old cache {}: {}", name, err);
          report.failed.push(name);
        }
      }
    }

    info!("Activated {}", target);
    self.claim(target);
    Ok(report)
  }

  /// Activate only if a generation is waiting.
  pub async fn force_activate(&self) -> Result<Option<ActivationReport>> {
    if self.waiting()?.is_none() {
      return Ok(None);
    }
    self.activate().await.map(Some)
  }

  /// Delete the current generation's store. The generation stays current
  /// with an empty store that later requests repopulate.
  pub fn clear_current(&self) -> Result<bool> {
    let Some(current) = self.current() else {
      return Ok(false);
    };
    let deleted = self.storage.delete_generation(&current)?;
    self.storage.open_generation(&current)?;
    Ok(deleted)
  }

  fn claim(&self, generation: String) {
    self.controller.send_replace(Some(generation));
  }
}
