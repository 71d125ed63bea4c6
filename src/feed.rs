//! Change feed subscriber.
//!
//! Turns the store's raw change stream into normalized [`ChangeEvent`]s,
//! either as an ordered single-consumer stream ([`ChangeFeed::stream`]) or by
//! driving a callback from a background task ([`ChangeFeed::subscribe`]).
//! Events are passed through in the order the store delivers them; nothing is
//! buffered beyond the channel, reordered or coalesced.

use futures::{Stream, StreamExt};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{ready, Context, Poll};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::document::ChangeEvent;
use crate::store::{ChangeStream, DocumentStore, RawChange, Since, StoreResult};

/// Normalize a raw change into a change event.
///
/// Returns `None` for a malformed change that claims a live document but
/// carries no snapshot of it.
pub fn normalize(raw: RawChange) -> Option<ChangeEvent> {
  if raw.deleted {
    return Some(ChangeEvent::deleted(raw.id));
  }

  match raw.document {
    Some(document) => Some(ChangeEvent::upserted(raw.id, document)),
    None => {
      warn!(id = %raw.id, seq = raw.seq, "Skipping change without a document");
      None
    }
  }
}

/// Ordered stream of normalized change events.
#[derive(Debug)]
pub struct ChangeEvents {
  inner: ChangeStream,
  last_seq: Option<u64>,
}

impl ChangeEvents {
  /// Sequence of the last raw change pulled from the store.
  pub fn last_seq(&self) -> Option<u64> {
    self.last_seq
  }
}

impl Stream for ChangeEvents {
  type Item = ChangeEvent;

  fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
    loop {
      match ready!(self.inner.poll_next_unpin(cx)) {
        Some(raw) => {
          self.last_seq = Some(raw.seq);
          if let Some(event) = normalize(raw) {
            return Poll::Ready(Some(event));
          }
        }
        None => return Poll::Ready(None),
      }
    }
  }
}

/// A standing change subscription.
///
/// Dropping the handle leaves the subscription running; call
/// [`Subscription::cancel`] to stop it.
#[derive(Debug)]
pub struct Subscription {
  task: JoinHandle<()>,
}

impl Subscription {
  /// Stop delivering events.
  pub fn cancel(&self) {
    self.task.abort();
  }

  pub fn is_active(&self) -> bool {
    !self.task.is_finished()
  }
}

/// Change feed over a document store.
pub struct ChangeFeed<S: DocumentStore> {
  store: Arc<S>,
}

impl<S: DocumentStore> ChangeFeed<S> {
  pub fn new(store: Arc<S>) -> Self {
    Self { store }
  }

  /// Open an ordered stream of change events after `since`.
  pub fn stream(&self, since: Since) -> StoreResult<ChangeEvents> {
    let inner = self.store.subscribe_changes(since)?;
    Ok(ChangeEvents {
      inner,
      last_seq: None,
    })
  }

  /// Deliver every change after `since` to `on_change`, one at a time.
  ///
  /// The callback runs on a background task and is invoked synchronously for
  /// each event, so no two events are ever processed concurrently.
  pub fn subscribe<F>(&self, since: Since, mut on_change: F) -> StoreResult<Subscription>
  where
    F: FnMut(ChangeEvent) + Send + 'static,
  {
    let mut events = self.stream(since)?;

    let task = tokio::spawn(async move {
      while let Some(event) = events.next().await {
        on_change(event);
      }
      debug!(last_seq = ?events.last_seq(), "Change feed ended");
    });

    Ok(Subscription { task })
  }
}

impl<S: DocumentStore> Clone for ChangeFeed<S> {
  fn clone(&self) -> Self {
    Self {
      store: Arc::clone(&self.store),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::document::{Document, DocumentId, Revision};
  use crate::store::SqliteStore;
  use chrono::{TimeZone, Utc};
  use serde_json::json;
  use std::sync::Mutex;
  use std::time::Duration;

  fn doc(secs: i64) -> Document {
    Document::new(Utc.timestamp_opt(secs, 0).unwrap(), json!({}))
  }

  #[test]
  fn test_normalize_delete_drops_document() {
    let event = normalize(RawChange {
      seq: 3,
      id: DocumentId::new("a"),
      revision: Revision::new("2-x"),
      deleted: true,
      document: Some(doc(1)),
    })
    .unwrap();

    assert!(event.is_deleted());
    assert_eq!(event.id().as_str(), "a");
  }

  #[test]
  fn test_normalize_skips_live_change_without_document() {
    let raw = RawChange {
      seq: 1,
      id: DocumentId::new("a"),
      revision: Revision::new("1-x"),
      deleted: false,
      document: None,
    };
    assert!(normalize(raw).is_none());
  }

  #[tokio::test]
  async fn test_stream_yields_events_in_commit_order() {
    let store = Arc::new(SqliteStore::open_in_memory().unwrap());
    let feed = ChangeFeed::new(Arc::clone(&store));
    let mut events = feed.stream(Since::Now).unwrap();

    let first = store.write(doc(1)).await.unwrap();
    let second = store.write(doc(2)).await.unwrap();
    store.remove(&first).await.unwrap();

    let a = events.next().await.unwrap();
    let b = events.next().await.unwrap();
    let c = events.next().await.unwrap();

    assert_eq!(Some(a.id()), first.id.as_ref());
    assert_eq!(Some(b.id()), second.id.as_ref());
    assert_eq!(Some(c.id()), first.id.as_ref());
    assert!(c.is_deleted());
    assert_eq!(events.last_seq(), Some(3));
  }

  #[tokio::test]
  async fn test_subscribe_invokes_callback_per_event() {
    let store = Arc::new(SqliteStore::open_in_memory().unwrap());
    let feed = ChangeFeed::new(Arc::clone(&store));
    let seen = Arc::new(Mutex::new(Vec::new()));

    let sink = Arc::clone(&seen);
    let subscription = feed
      .subscribe(Since::Now, move |event| {
        sink.lock().unwrap().push(event.id().clone());
      })
      .unwrap();

    let mut written = Vec::new();
    for secs in 0..5 {
      written.push(store.write(doc(secs)).await.unwrap().id.unwrap());
    }
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(*seen.lock().unwrap(), written);
    assert!(subscription.is_active());
  }

  #[tokio::test]
  async fn test_cancelled_subscription_stops_delivery() {
    let store = Arc::new(SqliteStore::open_in_memory().unwrap());
    let feed = ChangeFeed::new(Arc::clone(&store));
    let count = Arc::new(Mutex::new(0usize));

    let sink = Arc::clone(&count);
    let subscription = feed
      .subscribe(Since::Now, move |_| *sink.lock().unwrap() += 1)
      .unwrap();

    store.write(doc(1)).await.unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;
    subscription.cancel();
    tokio::time::sleep(Duration::from_millis(20)).await;
    store.write(doc(2)).await.unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;

    assert_eq!(*count.lock().unwrap(), 1);
    assert!(!subscription.is_active());
    assert_eq!(store.subscriber_count(), 0);
  }
}
