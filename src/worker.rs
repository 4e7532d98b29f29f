//! The cache worker: every entry point the hosting runtime can call.

use color_eyre::Result;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::cache::{CacheResult, CacheStorage, Clock, PolicyEngine, PolicyRules, SystemClock};
use crate::config::Config;
use crate::control::{Command, ControlMessage, CLEARED_REPLY};
use crate::hooks::{Hooks, Notification, Notifier, SyncQueue, SyncReport};
use crate::http::{Request, Response};
use crate::lifecycle::{ActivationReport, InstallOutcome, Lifecycle};
use crate::network::Network;

/// Request-interception cache for one namespace.
///
/// Cloning is cheap; clones share storage, network and lifecycle state.
pub struct CacheWorker<S: CacheStorage + SyncQueue, N: Network> {
  config: Arc<Config>,
  lifecycle: Arc<Lifecycle<S, N>>,
  policy: Arc<PolicyEngine<S, N>>,
  hooks: Arc<Hooks<S, N>>,
}

impl<S: CacheStorage + SyncQueue, N: Network> CacheWorker<S, N> {
  pub fn new(config: Config, storage: S, network: N, notifier: Arc<dyn Notifier>) -> Result<Self> {
    Self::with_clock(config, storage, network, notifier, Arc::new(SystemClock))
  }

  pub fn with_clock(
    config: Config,
    storage: S,
    network: N,
    notifier: Arc<dyn Notifier>,
    clock: Arc<dyn Clock>,
  ) -> Result<Self> {
    let storage = Arc::new(storage);
    let network = Arc::new(network);

    let lifecycle = Lifecycle::new(
      Arc::clone(&storage),
      Arc::clone(&network),
      Arc::clone(&clock),
      config.origin.clone(),
    )?;
    let policy = PolicyEngine::new(
      Arc::clone(&storage),
      Arc::clone(&network),
      Arc::clone(&clock),
      PolicyRules::from_config(&config),
    );
    let hooks = Hooks::new(
      storage,
      network,
      notifier,
      clock,
      config.sync_tag.clone(),
      config.notification.clone(),
      config.origin.clone(),
    );

    Ok(Self {
      config: Arc::new(config),
      lifecycle: Arc::new(lifecycle),
      policy: Arc::new(policy),
      hooks: Arc::new(hooks),
    })
  }

  pub fn config(&self) -> &Config {
    &self.config
  }

  pub fn lifecycle(&self) -> &Lifecycle<S, N> {
    &self.lifecycle
  }

  /// Install the configured generation and manifest.
  pub async fn install(&self) -> Result<InstallOutcome> {
    let result = self
      .lifecycle
      .install(
        &self.config.generation,
        &self.config.manifest,
        self.config.skip_waiting,
      )
      .await;

    if let Err(err) = &result {
      error!("Install of {} failed: {}", self.config.generation, err);
    }
    result
  }

  pub async fn activate(&self) -> Result<ActivationReport> {
    self.lifecycle.activate().await
  }

  /// Answer an intercepted request, reporting where the answer came from.
  pub async fn fetch(&self, request: &Request) -> Result<CacheResult<Response>> {
    let generation = self.lifecycle.current();
    self.policy.handle(generation.as_deref(), request).await
  }

  /// Answer an intercepted request.
  #[allow(dead_code)]
  pub async fn handle_fetch(&self, request: &Request) -> Result<Response> {
    Ok(self.fetch(request).await?.data)
  }

  /// Process one control message. Never fails; problems are logged.
  pub async fn handle_control(&self, message: ControlMessage) {
    debug!("control message: {:?}", message.command);
    match message.command {
      Command::ForceActivate => match self.lifecycle.force_activate().await {
        Ok(Some(report)) => info!("Force-activated {}", report.current),
        Ok(None) => debug!("no waiting generation to activate"),
        Err(err) => error!("Force activation failed: {}", err),
      },
      Command::Clear => match self.lifecycle.clear_current() {
        Ok(_) => {
          if let Some(reply) = message.reply {
            let _ = reply.send(CLEARED_REPLY.to_string());
          }
        }
        Err(err) => error!("Cache clear failed: {}", err),
      },
    }
  }

  /// Defer a request to the next background sync.
  pub fn queue_sync(&self, request: Request) -> Result<()> {
    self.hooks.queue(request)
  }

  pub fn on_notification_click(&self, notification: &Notification) -> Result<()> {
    self.hooks.on_notification_click(notification)
  }
}

impl<S, N> CacheWorker<S, N>
where
  S: CacheStorage + SyncQueue + 'static,
  N: Network + 'static,
{
  /// Run a background sync without blocking the caller.
  ///
  /// The handle may be dropped; failures are logged, not returned.
  pub fn dispatch_sync(&self, tag: String) -> JoinHandle<Option<SyncReport>> {
    let hooks = Arc::clone(&self.hooks);
    tokio::spawn(async move {
      match hooks.on_sync(&tag).await {
        Ok(report) => {
          debug!("sync {} finished: {:?}", tag, report);
          Some(report)
        }
        Err(err) => {
          warn!("Background sync {} failed: {}", tag, err);
          None
        }
      }
    })
  }

  /// Handle a push payload without blocking the caller.
  pub fn dispatch_push(&self, payload: Option<Vec<u8>>) -> JoinHandle<Option<Notification>> {
    let hooks = Arc::clone(&self.hooks);
    tokio::spawn(async move {
      hooks.on_push(payload.as_deref()).unwrap_or_else(|err| {
        warn!("Push notification failed: {}", err);
        None
      })
    })
  }
}

impl<S: CacheStorage + SyncQueue, N: Network> Clone for CacheWorker<S, N> {
  fn clone(&self) -> Self {
    Self {
      config: Arc::clone(&self.config),
      lifecycle: Arc::clone(&self.lifecycle),
      policy: Arc::clone(&self.policy),
      hooks: Arc::clone(&self.hooks),
    }
  }
}
