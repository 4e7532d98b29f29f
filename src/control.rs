//! Out-of-band control messages from the hosting application.

use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::debug;

use crate::cache::CacheStorage;
use crate::hooks::SyncQueue;
use crate::network::Network;
use crate::worker::CacheWorker;

/// Reply sent once a CLEAR has completed.
pub const CLEARED_REPLY: &str = "Cache cleared";

/// Commands understood by the control channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(tag = "type")]
pub enum Command {
  /// Adopt the waiting generation without waiting for clients to close
  #[serde(rename = "FORCE_ACTIVATE", alias = "SKIP_WAITING")]
  ForceActivate,
  /// Delete the current generation's store
  #[serde(rename = "CLEAR", alias = "CLEAR_CACHE")]
  Clear,
}

impl Command {
  /// Parse a raw JSON message; anything malformed or unknown yields None.
  pub fn parse(raw: &str) -> Option<Self> {
    serde_json::from_str(raw).ok()
  }
}

/// A command plus the optional channel to answer on. Consumed exactly once.
#[derive(Debug)]
pub struct ControlMessage {
  pub command: Command,
  pub reply: Option<oneshot::Sender<String>>,
}

/// Sending half of the control channel, held by the hosting application.
#[derive(Clone)]
pub struct ControlHandle {
  tx: mpsc::UnboundedSender<ControlMessage>,
}

impl ControlHandle {
  /// Spawn the control loop for a worker.
  ///
  /// The loop ends when every handle has been dropped.
  pub fn spawn<S, N>(worker: CacheWorker<S, N>) -> (Self, JoinHandle<()>)
  where
    S: CacheStorage + SyncQueue + 'static,
    N: Network + 'static,
  {
    let (tx, mut rx) = mpsc::unbounded_channel::<ControlMessage>();

    let task = tokio::spawn(async move {
      while let Some(message) = rx.recv().await {
        worker.handle_control(message).await;
      }
    });

    (Self { tx }, task)
  }

  /// Post a command without waiting for it to be processed.
  pub fn post(&self, command: Command, reply: Option<oneshot::Sender<String>>) {
    if self.tx.send(ControlMessage { command, reply }).is_err() {
      debug!("control loop stopped, dropping {:?}", command);
    }
  }

  /// Post a raw JSON message. Malformed messages are ignored.
  pub fn post_raw(&self, raw: &str, reply: Option<oneshot::Sender<String>>) {
    match Command::parse(raw) {
      Some(command) => self.post(command, reply),
      None => debug!("ignoring control message: {}", raw),
    }
  }

  /// Send CLEAR and wait for the completion reply.
  pub async fn clear(&self) -> Result<String> {
    let (tx, rx) = oneshot::channel();
    self.post(Command::Clear, Some(tx));
    rx.await
      .map_err(|_| eyre!("Cache clear did not complete"))
  }
}
