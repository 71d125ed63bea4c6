//! Continuous bidirectional replication between two document stores.
//!
//! One task per direction follows the source's change stream from a
//! checkpoint and applies every change to the target with
//! [`DocumentStore::apply_replicated`]. Re-applying a revision the target
//! already has is a no-op, which is what stops a change from bouncing back and
//! forth between the two stores forever.

use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::store::{DocumentStore, Since, StoreError, StoreResult};

/// How replication behaves.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplicationConfig {
  /// Keep following changes after catching up
  pub live: bool,
  /// Retry with backoff after a failure instead of stopping
  pub retry: bool,
  pub initial_backoff: Duration,
  pub max_backoff: Duration,
}

impl Default for ReplicationConfig {
  fn default() -> Self {
    Self {
      live: true,
      retry: true,
      initial_backoff: Duration::from_secs(1),
      max_backoff: Duration::from_secs(60),
    }
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
  Push,
  Pull,
}

impl Direction {
  fn as_str(self) -> &'static str {
    match self {
      Direction::Push => "push",
      Direction::Pull => "pull",
    }
  }
}

/// Running replication; both directions stop when cancelled.
#[derive(Debug)]
pub struct ReplicationHandle {
  push: JoinHandle<StoreResult<()>>,
  pull: JoinHandle<StoreResult<()>>,
}

impl ReplicationHandle {
  pub fn cancel(&self) {
    self.push.abort();
    self.pull.abort();
  }

  pub fn is_finished(&self) -> bool {
    self.push.is_finished() && self.pull.is_finished()
  }

  /// Wait for both directions to stop.
  ///
  /// Only returns on its own for one-shot replication, or when a direction
  /// gives up after a failure with retry disabled.
  pub async fn join(self) -> StoreResult<()> {
    let push = self.push.await.map_err(|_| StoreError::Closed)?;
    let pull = self.pull.await.map_err(|_| StoreError::Closed)?;
    push.and(pull)
  }
}

pub struct Replicator;

impl Replicator {
  /// Start replicating `local` to `remote` and `remote` to `local`.
  pub fn start<L, R>(local: Arc<L>, remote: Arc<R>, config: ReplicationConfig) -> ReplicationHandle
  where
    L: DocumentStore,
    R: DocumentStore,
  {
    info!(live = config.live, retry = config.retry, "Starting replication");

    let push = tokio::spawn(replicate(
      Direction::Push,
      Arc::clone(&local),
      Arc::clone(&remote),
      config.clone(),
    ));
    let pull = tokio::spawn(replicate(Direction::Pull, remote, local, config));

    ReplicationHandle { push, pull }
  }

  /// Replicate the backlog both ways once, without retrying.
  ///
  /// A failure is logged and reported as `false`; the local store keeps
  /// working offline and the next catch-up resumes from scratch.
  pub async fn catch_up<L, R>(local: Arc<L>, remote: Arc<R>, config: &ReplicationConfig) -> bool
  where
    L: DocumentStore,
    R: DocumentStore,
  {
    let config = ReplicationConfig {
      live: false,
      retry: false,
      ..config.clone()
    };

    match Self::start(local, remote, config).join().await {
      Ok(()) => true,
      Err(e) => {
        warn!(error = %e, "Remote unavailable, continuing offline");
        false
      }
    }
  }
}

async fn replicate<S, T>(
  direction: Direction,
  source: Arc<S>,
  target: Arc<T>,
  config: ReplicationConfig,
) -> StoreResult<()>
where
  S: DocumentStore,
  T: DocumentStore,
{
  let mut checkpoint = 0u64;
  let mut backoff = config.initial_backoff;

  loop {
    let before = checkpoint;
    let result = replicate_from(&*source, &*target, &mut checkpoint, config.live).await;

    // Progress since the last failure resets the backoff
    if checkpoint > before {
      backoff = config.initial_backoff;
    }

    match result {
      Ok(()) => {
        debug!(direction = direction.as_str(), checkpoint, "Replication finished");
        return Ok(());
      }
      Err(e) if config.retry => {
        warn!(
          direction = direction.as_str(),
          checkpoint,
          error = %e,
          retry_in_ms = backoff.as_millis() as u64,
          "Replication failed, retrying"
        );
        tokio::time::sleep(backoff).await;
        backoff = (backoff * 2).min(config.max_backoff);
      }
      Err(e) => {
        error!(direction = direction.as_str(), checkpoint, error = %e, "Replication failed");
        return Err(e);
      }
    }
  }
}

/// Apply changes after `checkpoint`, advancing it past every applied change.
///
/// In live mode this only returns when the source stream closes or a change
/// fails to apply. Otherwise it returns once the backlog is drained.
async fn replicate_from<S, T>(
  source: &S,
  target: &T,
  checkpoint: &mut u64,
  live: bool,
) -> StoreResult<()>
where
  S: DocumentStore,
  T: DocumentStore,
{
  let mut changes = source.subscribe_changes(Since::Seq(*checkpoint))?;

  loop {
    let change = if live {
      match changes.next().await {
        Some(change) => change,
        None => return Ok(()),
      }
    } else {
      match changes.try_next() {
        Some(change) => change,
        None => return Ok(()),
      }
    };

    let applied = target.apply_replicated(&change).await?;
    if applied {
      debug!(id = %change.id, rev = %change.revision, seq = change.seq, "Replicated change");
    }
    *checkpoint = change.seq;
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::document::Document;
  use crate::store::testing::FlakyStore;
  use crate::store::SqliteStore;
  use chrono::{TimeZone, Utc};
  use serde_json::json;

  fn doc(secs: i64) -> Document {
    Document::new(Utc.timestamp_opt(secs, 0).unwrap(), json!({"amount": secs}))
  }

  fn fast() -> ReplicationConfig {
    ReplicationConfig {
      initial_backoff: Duration::from_millis(5),
      max_backoff: Duration::from_millis(20),
      ..ReplicationConfig::default()
    }
  }

  async fn documents<S: DocumentStore>(store: &S) -> Vec<Document> {
    store.read_all().await.unwrap().documents
  }

  #[tokio::test]
  async fn test_one_shot_copies_both_ways() {
    let local = Arc::new(SqliteStore::open_in_memory().unwrap());
    let remote = Arc::new(SqliteStore::open_in_memory().unwrap());
    local.write(doc(1)).await.unwrap();
    remote.write(doc(2)).await.unwrap();

    let config = ReplicationConfig {
      live: false,
      ..fast()
    };
    Replicator::start(Arc::clone(&local), Arc::clone(&remote), config)
      .join()
      .await
      .unwrap();

    let local_docs = documents(&*local).await;
    assert_eq!(local_docs.len(), 2);
    assert_eq!(local_docs, documents(&*remote).await);
  }

  #[tokio::test]
  async fn test_live_replication_follows_changes_and_settles() {
    let local = Arc::new(SqliteStore::open_in_memory().unwrap());
    let remote = Arc::new(SqliteStore::open_in_memory().unwrap());
    let handle = Replicator::start(Arc::clone(&local), Arc::clone(&remote), fast());

    let created = local.write(doc(1)).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(documents(&*remote).await, vec![created.clone()]);

    // An edit made on the remote side flows back
    let mut edit = created.clone();
    edit.payload = json!({"amount": 99});
    let updated = remote.write(edit).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(documents(&*local).await, vec![updated.clone()]);

    remote.remove(&updated).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(documents(&*local).await.is_empty());

    // Echoes stop once both sides agree
    let seq = local.read_all().await.unwrap().last_seq;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(local.read_all().await.unwrap().last_seq, seq);

    handle.cancel();
  }

  #[tokio::test]
  async fn test_failures_are_retried_until_applied() {
    let local = Arc::new(SqliteStore::open_in_memory().unwrap());
    let remote = Arc::new(FlakyStore::new());
    remote.fail_next_applies(3);
    local.write(doc(1)).await.unwrap();

    let handle = Replicator::start(Arc::clone(&local), Arc::clone(&remote), fast());
    tokio::time::sleep(Duration::from_millis(200)).await;

    assert_eq!(documents(remote.inner()).await.len(), 1);
    assert!(!handle.is_finished());
    handle.cancel();
  }

  #[tokio::test]
  async fn test_failure_without_retry_stops() {
    let local = Arc::new(SqliteStore::open_in_memory().unwrap());
    let remote = Arc::new(FlakyStore::new());
    remote.fail_next_applies(1);
    local.write(doc(1)).await.unwrap();

    let config = ReplicationConfig {
      live: false,
      retry: false,
      ..fast()
    };
    let err = Replicator::start(Arc::clone(&local), Arc::clone(&remote), config)
      .join()
      .await
      .unwrap_err();

    assert!(matches!(err, StoreError::Database(_)));
    assert!(documents(remote.inner()).await.is_empty());
  }

  #[tokio::test]
  async fn test_catch_up_failure_keeps_local_store_usable() {
    let local = Arc::new(SqliteStore::open_in_memory().unwrap());
    let remote = Arc::new(FlakyStore::new());
    remote.fail_next_applies(1);
    local.write(doc(1)).await.unwrap();

    assert!(!Replicator::catch_up(Arc::clone(&local), Arc::clone(&remote), &fast()).await);
    assert!(documents(remote.inner()).await.is_empty());

    local.write(doc(2)).await.unwrap();
    assert_eq!(documents(&*local).await.len(), 2);

    assert!(Replicator::catch_up(Arc::clone(&local), Arc::clone(&remote), &fast()).await);
    assert_eq!(documents(remote.inner()).await.len(), 2);
  }
}
