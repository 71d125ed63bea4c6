//! Locally cached, always sorted view of every document in a store.
//!
//! The cache is populated lazily by the first [`DocumentCache::get_all`] and
//! from then on only changes through reconciliation of the store's change
//! feed. Local writes go straight to the store and reach the cache when the
//! store echoes them back, so a rejected write never touches the cache.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use tokio::sync::{watch, OnceCell};
use tracing::{debug, info, warn};

use crate::document::{sort_newest_first, ChangeEvent, Document};
use crate::feed::{ChangeFeed, Subscription};
use crate::store::{DocumentStore, Since, StoreError};

/// Lifecycle of the cache. There is no way back from `Ready`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheState {
  Uninitialized,
  Loading,
  Ready,
}

#[derive(Debug, thiserror::Error)]
pub enum CacheError {
  /// The initial full read failed; the cache stays uninitialized
  #[error("Failed to load documents: {0}")]
  Load(#[source] StoreError),

  #[error("Failed to subscribe to changes: {0}")]
  Subscribe(#[source] StoreError),

  /// The store rejected a create, update or delete
  #[error("Write rejected: {0}")]
  Write(#[source] StoreError),
}

impl CacheError {
  /// Whether a write was rejected for a stale revision rather than a
  /// transport failure.
  pub fn is_conflict(&self) -> bool {
    matches!(self, CacheError::Write(e) if e.is_conflict())
  }

  pub fn store_error(&self) -> &StoreError {
    match self {
      CacheError::Load(e) | CacheError::Subscribe(e) | CacheError::Write(e) => e,
    }
  }
}

/// Sorted documents shared between readers and the change subscription.
struct Entries {
  docs: RwLock<Vec<Document>>,
  version: watch::Sender<u64>,
}

impl Entries {
  fn new() -> Self {
    let (version, _) = watch::channel(0);
    Self {
      docs: RwLock::new(Vec::new()),
      version,
    }
  }

  fn snapshot(&self) -> Vec<Document> {
    self
      .docs
      .read()
      .unwrap_or_else(PoisonError::into_inner)
      .clone()
  }

  /// Swap in a new collection without notifying watchers.
  fn fill(&self, documents: Vec<Document>) {
    *self.docs.write().unwrap_or_else(PoisonError::into_inner) = documents;
  }

  fn notify(&self) {
    self.version.send_modify(|v| *v += 1);
  }

  fn reconcile(&self, event: ChangeEvent) {
    debug!(id = %event.id(), deleted = event.is_deleted(), "Reconciling change");
    {
      let mut docs = self.docs.write().unwrap_or_else(PoisonError::into_inner);
      apply_change(&mut docs, event);
    }
    self.notify();
  }
}

/// Marks the cache as loading until dropped, including when the load future
/// is dropped before it completes.
struct LoadingGuard<'a>(&'a AtomicBool);

impl<'a> LoadingGuard<'a> {
  fn enter(flag: &'a AtomicBool) -> Self {
    flag.store(true, Ordering::SeqCst);
    Self(flag)
  }
}

impl Drop for LoadingGuard<'_> {
  fn drop(&mut self) {
    self.0.store(false, Ordering::SeqCst);
  }
}

/// Apply one change to a sorted collection and restore the ordering.
///
/// Deleting an id that is not present is a no-op, so duplicate delete
/// notifications are harmless. An upsert replaces the entry with the same id
/// or appends a new one; ids are never duplicated.
pub(crate) fn apply_change(docs: &mut Vec<Document>, event: ChangeEvent) {
  let position = docs
    .iter()
    .position(|doc| doc.id.as_ref() == Some(event.id()));

  match (position, event.into_document()) {
    (Some(index), None) => {
      docs.remove(index);
    }
    (None, None) => {}
    (Some(index), Some(document)) => docs[index] = document,
    (None, Some(document)) => docs.push(document),
  }

  sort_newest_first(docs);
}

struct Inner<S: DocumentStore> {
  store: Arc<S>,
  feed: ChangeFeed<S>,
  entries: Arc<Entries>,
  /// Set once the first load has completed and the feed is subscribed
  subscription: OnceCell<Subscription>,
  loading: AtomicBool,
}

/// Cached, sorted document collection kept in sync with a store.
///
/// Cloning is cheap; clones share the same cache.
pub struct DocumentCache<S: DocumentStore> {
  inner: Arc<Inner<S>>,
}

impl<S: DocumentStore> DocumentCache<S> {
  pub fn new(store: Arc<S>) -> Self {
    Self {
      inner: Arc::new(Inner {
        feed: ChangeFeed::new(Arc::clone(&store)),
        store,
        entries: Arc::new(Entries::new()),
        subscription: OnceCell::new(),
        loading: AtomicBool::new(false),
      }),
    }
  }

  pub fn state(&self) -> CacheState {
    if self.inner.subscription.initialized() {
      CacheState::Ready
    } else if self.inner.loading.load(Ordering::SeqCst) {
      CacheState::Loading
    } else {
      CacheState::Uninitialized
    }
  }

  /// All documents, newest first.
  ///
  /// The first call loads the store and subscribes to its changes. Callers
  /// arriving while that load is in flight wait for it instead of starting
  /// another one. A failed load leaves the cache uninitialized so a later
  /// call can retry.
  pub async fn get_all(&self) -> Result<Vec<Document>, CacheError> {
    if !self.inner.subscription.initialized() {
      self
        .inner
        .subscription
        .get_or_try_init(|| self.load())
        .await?;
    }

    Ok(self.inner.entries.snapshot())
  }

  /// Send a new document to the store.
  ///
  /// Any revision on `doc` is ignored. The cache picks the document up from
  /// the change feed; the returned copy carries the assigned id and revision.
  pub async fn create(&self, mut doc: Document) -> Result<Document, CacheError> {
    doc.revision = None;
    self.inner.store.write(doc).await.map_err(|e| {
      warn!(error = %e, "Create rejected");
      CacheError::Write(e)
    })
  }

  /// Send an edited document, at its current revision, to the store.
  pub async fn update(&self, doc: Document) -> Result<Document, CacheError> {
    let id = doc
      .id
      .clone()
      .ok_or(CacheError::Write(StoreError::MissingId))?;
    if doc.revision.is_none() {
      return Err(CacheError::Write(StoreError::Conflict(id)));
    }

    self.inner.store.write(doc).await.map_err(|e| {
      warn!(id = %id, error = %e, "Update rejected");
      CacheError::Write(e)
    })
  }

  /// Remove a document, at its current revision, from the store.
  pub async fn delete(&self, doc: &Document) -> Result<(), CacheError> {
    self.inner.store.remove(doc).await.map_err(|e| {
      warn!(id = ?doc.id, error = %e, "Delete rejected");
      CacheError::Write(e)
    })
  }

  /// Watch channel bumped after every change to the cached collection.
  pub fn updates(&self) -> watch::Receiver<u64> {
    self.inner.entries.version.subscribe()
  }

  async fn load(&self) -> Result<Subscription, CacheError> {
    let _loading = LoadingGuard::enter(&self.inner.loading);
    self.load_and_subscribe().await
  }

  async fn load_and_subscribe(&self) -> Result<Subscription, CacheError> {
    let snapshot = self.inner.store.read_all().await.map_err(|e| {
      warn!(error = %e, "Initial load failed");
      CacheError::Load(e)
    })?;

    let mut documents = snapshot.documents;
    sort_newest_first(&mut documents);
    let count = documents.len();
    // Filled before subscribing so replayed changes land on top of the snapshot
    self.inner.entries.fill(documents);

    // Follow on from exactly the point the snapshot reflects
    let entries = Arc::clone(&self.inner.entries);
    let subscription = self
      .inner
      .feed
      .subscribe(Since::Seq(snapshot.last_seq), move |event| {
        entries.reconcile(event)
      })
      .map_err(|e| {
        warn!(error = %e, "Change subscription failed");
        self.inner.entries.fill(Vec::new());
        CacheError::Subscribe(e)
      })?;
    self.inner.entries.notify();

    info!(count, last_seq = snapshot.last_seq, "Document cache ready");
    Ok(subscription)
  }
}

impl<S: DocumentStore> Clone for DocumentCache<S> {
  fn clone(&self) -> Self {
    Self {
      inner: Arc::clone(&self.inner),
    }
  }
}
