//! Test doubles shared by the unit tests.

use chrono::{DateTime, Duration, Utc};
use color_eyre::{eyre::eyre, Result};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use url::Url;

use crate::cache::{CacheEntry, CacheStorage, Clock, SqliteStorage};
use crate::hooks::{Notification, Notifier, SyncQueue, SyncTask};
use crate::http::{Request, Response};
use crate::network::Network;

/// Scripted network: each URL either answers with a fixed response or fails.
/// Unscripted URLs fail like an unreachable host.
#[derive(Default)]
pub struct FakeNetwork {
  routes: Mutex<HashMap<String, Option<Response>>>,
  calls: Mutex<Vec<String>>,
}

impl FakeNetwork {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn respond(&self, url: &str, response: Response) {
    self
      .routes
      .lock()
      .unwrap()
      .insert(url.to_string(), Some(response));
  }

  pub fn fail(&self, url: &str) {
    self.routes.lock().unwrap().insert(url.to_string(), None);
  }

  pub fn calls(&self, url: &str) -> usize {
    self.calls.lock().unwrap().iter().filter(|u| *u == url).count()
  }

  pub fn total_calls(&self) -> usize {
    self.calls.lock().unwrap().len()
  }
}

impl Network for FakeNetwork {
  async fn fetch(&self, request: &Request) -> Result<Response> {
    let url = request.url.as_str().to_string();
    self.calls.lock().unwrap().push(url.clone());
    let route = self.routes.lock().unwrap().get(&url).cloned();
    match route {
      Some(Some(response)) => Ok(response),
      _ => Err(eyre!("Failed to fetch {}: connection refused", request)),
    }
  }
}

/// Clock that only moves when told to.
pub struct ManualClock {
  now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
  pub fn new(now: DateTime<Utc>) -> Self {
    Self {
      now: Mutex::new(now),
    }
  }

  pub fn advance(&self, by: Duration) {
    *self.now.lock().unwrap() += by;
  }
}

impl Clock for ManualClock {
  fn now(&self) -> DateTime<Utc> {
    *self.now.lock().unwrap()
  }
}

/// Notifier that records what it was asked to do.
#[derive(Default)]
pub struct RecordingNotifier {
  shown: Mutex<Vec<Notification>>,
  closed: Mutex<usize>,
  opened: Mutex<Vec<Url>>,
}

impl RecordingNotifier {
  pub fn shown(&self) -> Vec<Notification> {
    self.shown.lock().unwrap().clone()
  }

  pub fn closed(&self) -> usize {
    *self.closed.lock().unwrap()
  }

  pub fn opened(&self) -> Vec<Url> {
    self.opened.lock().unwrap().clone()
  }
}

impl Notifier for RecordingNotifier {
  fn show(&self, notification: &Notification) -> Result<()> {
    self.shown.lock().unwrap().push(notification.clone());
    Ok(())
  }

  fn close(&self, _notification: &Notification) {
    *self.closed.lock().unwrap() += 1;
  }

  fn open_window(&self, url: &Url) -> Result<()> {
    self.opened.lock().unwrap().push(url.clone());
    Ok(())
  }
}

/// In-memory storage that fails selected operations on request.
pub struct FlakyStorage {
  inner: SqliteStorage,
  fail_get: AtomicBool,
  fail_put: AtomicBool,
  fail_ack: AtomicBool,
  fail_state: Mutex<Option<String>>,
  fail_delete: Mutex<Option<String>>,
}

impl FlakyStorage {
  pub fn new() -> Self {
    Self {
      inner: SqliteStorage::open_in_memory().unwrap(),
      fail_get: AtomicBool::new(false),
      fail_put: AtomicBool::new(false),
      fail_ack: AtomicBool::new(false),
      fail_state: Mutex::new(None),
      fail_delete: Mutex::new(None),
    }
  }

  pub fn fail_get(&self) {
    self.fail_get.store(true, Ordering::SeqCst);
  }

  pub fn fail_put(&self) {
    self.fail_put.store(true, Ordering::SeqCst);
  }

  pub fn fail_ack(&self) {
    self.fail_ack.store(true, Ordering::SeqCst);
  }

  /// Make writes of the named state value fail.
  pub fn fail_state_write(&self, name: &str) {
    *self.fail_state.lock().unwrap() = Some(name.to_string());
  }

  /// Make deleting the named generation fail.
  pub fn fail_delete(&self, generation: &str) {
    *self.fail_delete.lock().unwrap() = Some(generation.to_string());
  }
}

impl CacheStorage for FlakyStorage {
  fn open_generation(&self, generation: &str) -> Result<()> {
    self.inner.open_generation(generation)
  }

  fn generations(&self) -> Result<Vec<String>> {
    self.inner.generations()
  }

  fn delete_generation(&self, generation: &str) -> Result<bool> {
    if self.fail_delete.lock().unwrap().as_deref() == Some(generation) {
      return Err(eyre!("Failed to delete generation {}: disk I/O error", generation));
    }
    self.inner.delete_generation(generation)
  }

  fn get(&self, generation: &str, key: &str) -> Result<Option<CacheEntry>> {
    if self.fail_get.load(Ordering::SeqCst) {
      return Err(eyre!("Failed to read entry {}: database is locked", key));
    }
    self.inner.get(generation, key)
  }

  fn put(
    &self,
    generation: &str,
    key: &str,
    response: &Response,
    captured_at: Option<DateTime<Utc>>,
  ) -> Result<bool> {
    if self.fail_put.load(Ordering::SeqCst) {
      return Err(eyre!("Failed to store entry {}: disk full", key));
    }
    self.inner.put(generation, key, response, captured_at)
  }

  fn put_all(
    &self,
    generation: &str,
    entries: &[(String, Response)],
    captured_at: DateTime<Utc>,
  ) -> Result<()> {
    self.inner.put_all(generation, entries, captured_at)
  }

  fn entry_count(&self, generation: &str) -> Result<usize> {
    self.inner.entry_count(generation)
  }

  fn get_state(&self, name: &str) -> Result<Option<String>> {
    self.inner.get_state(name)
  }

  fn set_state(&self, name: &str, value: Option<&str>) -> Result<()> {
    if self.fail_state.lock().unwrap().as_deref() == Some(name) {
      return Err(eyre!("Failed to write state {}: disk full", name));
    }
    self.inner.set_state(name, value)
  }
}

impl SyncQueue for FlakyStorage {
  fn enqueue(&self, task: &SyncTask) -> Result<()> {
    self.inner.enqueue(task)
  }

  fn pending(&self) -> Result<Vec<(i64, SyncTask)>> {
    self.inner.pending()
  }

  fn ack(&self, id: i64) -> Result<()> {
    if self.fail_ack.load(Ordering::SeqCst) {
      return Err(eyre!("Failed to remove sync task {}: database is locked", id));
    }
    self.inner.ack(id)
  }
}
