//! Store wrapper with call counting and failure injection, for tests.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use tokio::sync::Semaphore;

use super::{
  ChangeStream, DocumentStore, RawChange, Since, Snapshot, SqliteStore, StoreError, StoreResult,
};
use crate::document::Document;

pub(crate) struct FlakyStore {
  inner: SqliteStore,
  read_calls: AtomicUsize,
  fail_reads: AtomicBool,
  fail_applies: AtomicUsize,
  fail_subscribes: AtomicBool,
  gated: AtomicBool,
  gate: Semaphore,
}

impl FlakyStore {
  pub fn new() -> Self {
    Self {
      inner: SqliteStore::open_in_memory().expect("in-memory store should open"),
      read_calls: AtomicUsize::new(0),
      fail_reads: AtomicBool::new(false),
      fail_applies: AtomicUsize::new(0),
      fail_subscribes: AtomicBool::new(false),
      gated: AtomicBool::new(false),
      gate: Semaphore::new(0),
    }
  }

  /// Reads block until [`FlakyStore::open_gate`] is called.
  pub fn gated() -> Self {
    let store = Self::new();
    store.gated.store(true, Ordering::SeqCst);
    store
  }

  pub fn open_gate(&self) {
    self.gate.add_permits(Semaphore::MAX_PERMITS / 2);
  }

  pub fn read_calls(&self) -> usize {
    self.read_calls.load(Ordering::SeqCst)
  }

  pub fn fail_reads(&self, fail: bool) {
    self.fail_reads.store(fail, Ordering::SeqCst);
  }

  pub fn fail_next_applies(&self, count: usize) {
    self.fail_applies.store(count, Ordering::SeqCst);
  }

  pub fn fail_subscribes(&self, fail: bool) {
    self.fail_subscribes.store(fail, Ordering::SeqCst);
  }

  pub fn inner(&self) -> &SqliteStore {
    &self.inner
  }
}

impl DocumentStore for FlakyStore {
  async fn read_all(&self) -> StoreResult<Snapshot> {
    self.read_calls.fetch_add(1, Ordering::SeqCst);
    if self.gated.load(Ordering::SeqCst) {
      let _permit = self.gate.acquire().await.map_err(|_| StoreError::Closed)?;
    }
    if self.fail_reads.load(Ordering::SeqCst) {
      return Err(StoreError::Database("connection refused".to_string()));
    }
    self.inner.read_all().await
  }

  async fn write(&self, doc: Document) -> StoreResult<Document> {
    self.inner.write(doc).await
  }

  async fn remove(&self, doc: &Document) -> StoreResult<()> {
    self.inner.remove(doc).await
  }

  fn subscribe_changes(&self, since: Since) -> StoreResult<ChangeStream> {
    if self.fail_subscribes.load(Ordering::SeqCst) {
      return Err(StoreError::Database("change feed unavailable".to_string()));
    }
    self.inner.subscribe_changes(since)
  }

  async fn apply_replicated(&self, change: &RawChange) -> StoreResult<bool> {
    let remaining = self.fail_applies.load(Ordering::SeqCst);
    if remaining > 0 {
      self.fail_applies.store(remaining - 1, Ordering::SeqCst);
      return Err(StoreError::Database("remote unavailable".to_string()));
    }
    self.inner.apply_replicated(change).await
  }
}
