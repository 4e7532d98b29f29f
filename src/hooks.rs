//! Background sync and push notification hooks.
//!
//! These run outside the request path. The runtime spawns them and does not
//! wait for the result; errors are logged by the caller.

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use std::sync::Arc;
use tracing::{debug, info, warn};
use url::Url;

use crate::cache::Clock;
use crate::config::NotificationConfig;
use crate::http::Request;
use crate::network::Network;

/// A request deferred until connectivity returns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncTask {
  pub request: Request,
  pub queued_at: DateTime<Utc>,
}

/// Durable queue of deferred requests.
///
/// Tasks stay queued until acknowledged, so a replay interrupted at any point
/// loses nothing.
pub trait SyncQueue: Send + Sync {
  fn enqueue(&self, task: &SyncTask) -> Result<()>;

  /// Every queued task with its queue id, oldest first. Nothing is removed.
  fn pending(&self) -> Result<Vec<(i64, SyncTask)>>;

  /// Remove a task after it has been delivered.
  fn ack(&self, id: i64) -> Result<()>;
}

/// A locally displayed notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
  pub title: String,
  pub body: String,
  pub icon: String,
  pub badge: String,
}

/// Where notifications end up.
pub trait Notifier: Send + Sync {
  fn show(&self, notification: &Notification) -> Result<()>;

  fn close(&self, notification: &Notification);

  fn open_window(&self, url: &Url) -> Result<()>;
}

/// Notifier for headless runs: notifications go to the log.
pub struct LogNotifier;

impl Notifier for LogNotifier {
  fn show(&self, notification: &Notification) -> Result<()> {
    info!(
      title = %notification.title,
      icon = %notification.icon,
      badge = %notification.badge,
      "notification: {}",
      notification.body
    );
    Ok(())
  }

  fn close(&self, notification: &Notification) {
    debug!("notification closed: {}", notification.title);
  }

  fn open_window(&self, url: &Url) -> Result<()> {
    info!("open window: {}", url);
    Ok(())
  }
}

/// Outcome of a background sync.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncReport {
  /// Tasks that reached the server
  pub replayed: usize,
  /// Tasks left on the queue after a network failure
  pub pending: usize,
}

pub struct Hooks<Q: SyncQueue, N: Network> {
  queue: Arc<Q>,
  network: Arc<N>,
  notifier: Arc<dyn Notifier>,
  clock: Arc<dyn Clock>,
  sync_tag: String,
  notification: NotificationConfig,
  origin: Url,
}

impl<Q: SyncQueue, N: Network> Hooks<Q, N> {
  pub fn new(
    queue: Arc<Q>,
    network: Arc<N>,
    notifier: Arc<dyn Notifier>,
    clock: Arc<dyn Clock>,
    sync_tag: String,
    notification: NotificationConfig,
    origin: Url,
  ) -> Self {
    Self {
      queue,
      network,
      notifier,
      clock,
      sync_tag,
      notification,
      origin,
    }
  }

  /// Defer a request until the next background sync.
  pub fn queue(&self, request: Request) -> Result<()> {
    let task = SyncTask {
      request,
      queued_at: self.clock.now(),
    };
    self.queue.enqueue(&task)?;
    info!("Queued {} for background sync", task.request);
    Ok(())
  }

  /// Replay queued work for the recognized tag; other tags are ignored.
  pub async fn on_sync(&self, tag: &str) -> Result<SyncReport> {
    info!("Background sync triggered: {}", tag);
    if tag != self.sync_tag {
      debug!("ignoring sync tag {}", tag);
      return Ok(SyncReport::default());
    }

    let tasks = self.queue.pending()?;
    let mut report = SyncReport::default();

    for (id, task) in tasks {
      match self.network.fetch(&task.request).await {
        Ok(response) => {
          if !response.is_ok() {
            warn!("Replayed {} got status {}", task.request, response.status);
          }
          // Left queued on failure; replayed again next sync
          if let Err(err) = self.queue.ack(id) {
            warn!("Failed to dequeue replayed {}: {}", task.request, err);
          }
          report.replayed += 1;
        }
        Err(err) => {
          warn!("Replay of {} failed, keeping it queued: {}", task.request, err);
          report.pending += 1;
        }
      }
    }

    Ok(report)
  }

  /// Show a notification for a push payload. No payload is a silent no-op.
  pub fn on_push(&self, payload: Option<&[u8]>) -> Result<Option<Notification>> {
    let Some(payload) = payload else {
      return Ok(None);
    };

    let notification = Notification {
      title: self.notification.title.clone(),
      body: String::from_utf8_lossy(payload).into_owned(),
      icon: self.notification.icon.clone(),
      badge: self.notification.badge.clone(),
    };
    self.notifier.show(&notification)?;

    Ok(Some(notification))
  }

  /// Close the clicked notification and open the app.
  pub fn on_notification_click(&self, notification: &Notification) -> Result<()> {
    self.notifier.close(notification);
    let url = self.origin.join(&self.notification.open_url).map_err(|e| {
      eyre!(
        "Invalid notification URL '{}': {}",
        self.notification.open_url,
        e
      )
    })?;
    self.notifier.open_window(&url)
  }
}
