//! Document store capability.
//!
//! The cache and the replicator only ever talk to a store through
//! [`DocumentStore`]: a full snapshot read, a write, a remove and an ordered
//! change stream. [`SqliteStore`] is the persisted local implementation.

mod sqlite;
#[cfg(test)]
pub(crate) mod testing;

pub use sqlite::SqliteStore;

use futures::Stream;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::sync::mpsc;

use crate::document::{Document, DocumentId, Revision};

pub type StoreResult<T> = Result<T, StoreError>;

/// Errors reported by a document store.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
  /// Stale or missing revision, the write would lose an update
  #[error("Document update conflict: {0}")]
  Conflict(DocumentId),

  #[error("Document not found: {0}")]
  NotFound(DocumentId),

  #[error("Document has no id")]
  MissingId,

  #[error("Database error: {0}")]
  Database(String),

  #[error("Serialization error: {0}")]
  Serialization(String),

  #[error("Change feed closed")]
  Closed,
}

impl StoreError {
  pub fn is_conflict(&self) -> bool {
    matches!(self, StoreError::Conflict(_))
  }
}

impl From<rusqlite::Error> for StoreError {
  fn from(e: rusqlite::Error) -> Self {
    StoreError::Database(e.to_string())
  }
}

impl From<serde_json::Error> for StoreError {
  fn from(e: serde_json::Error) -> Self {
    StoreError::Serialization(e.to_string())
  }
}

/// Where a change subscription starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Since {
  /// Only changes committed after the subscription is registered
  Now,
  /// Changes with a sequence number strictly greater than this one
  Seq(u64),
}

/// Full read of the store, tagged with the change sequence it reflects.
#[derive(Debug, Clone, Default)]
pub struct Snapshot {
  pub documents: Vec<Document>,
  /// Sequence of the last change included in `documents`
  pub last_seq: u64,
}

/// A change exactly as the store commits it.
#[derive(Debug, Clone, PartialEq)]
pub struct RawChange {
  pub seq: u64,
  pub id: DocumentId,
  pub revision: Revision,
  pub deleted: bool,
  /// Document as of this change; absent for deletions
  pub document: Option<Document>,
}

/// Lazy, infinite, non-restartable sequence of committed changes.
///
/// Changes arrive in commit order. The stream ends only when the store that
/// produced it is dropped.
#[derive(Debug)]
pub struct ChangeStream {
  rx: mpsc::UnboundedReceiver<RawChange>,
}

impl ChangeStream {
  pub fn new(rx: mpsc::UnboundedReceiver<RawChange>) -> Self {
    Self { rx }
  }

  /// Wait for the next change.
  pub async fn next(&mut self) -> Option<RawChange> {
    self.rx.recv().await
  }

  /// Take a change that is already delivered, without waiting.
  pub fn try_next(&mut self) -> Option<RawChange> {
    self.rx.try_recv().ok()
  }
}

impl Stream for ChangeStream {
  type Item = RawChange;

  fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
    self.rx.poll_recv(cx)
  }
}

/// Capability exposed by a document store.
///
/// Every committed write or remove must be echoed to all live change streams,
/// including the ones opened by the writer itself. The cache relies on this to
/// see its own writes.
pub trait DocumentStore: Send + Sync + 'static {
  /// Read every live document.
  fn read_all(&self) -> impl Future<Output = StoreResult<Snapshot>> + Send;

  /// Create (`id` or `revision` absent) or update a document.
  ///
  /// Returns the stored document carrying its assigned id and new revision.
  fn write(&self, doc: Document) -> impl Future<Output = StoreResult<Document>> + Send;

  /// Remove a document at the given revision.
  fn remove(&self, doc: &Document) -> impl Future<Output = StoreResult<()>> + Send;

  /// Open a change stream starting after `since`.
  fn subscribe_changes(&self, since: Since) -> StoreResult<ChangeStream>;

  /// Apply a change replicated from another store, keeping its revision.
  ///
  /// Returns `false` when the change was already present or is superseded by
  /// the local revision.
  fn apply_replicated(&self, change: &RawChange)
    -> impl Future<Output = StoreResult<bool>> + Send;
}
