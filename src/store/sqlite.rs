//! SQLite document store with a persisted change log.

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension, Transaction};
use serde_json::Value;
use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc;
use tracing::{debug, info};

use super::{ChangeStream, DocumentStore, RawChange, Since, Snapshot, StoreError, StoreResult};
use crate::document::{Document, DocumentId, Revision};

/// Schema for the store tables.
const STORE_SCHEMA: &str = r#"
-- Current state of every document. Removed documents stay as tombstones
-- so a stale replicated write cannot bring them back.
CREATE TABLE IF NOT EXISTS documents (
    id TEXT PRIMARY KEY,
    rev TEXT NOT NULL,
    date TEXT NOT NULL,
    deleted INTEGER NOT NULL DEFAULT 0,
    data BLOB
);

CREATE INDEX IF NOT EXISTS idx_documents_date ON documents(deleted, date);

-- Append-only change log, one row per committed write or remove
CREATE TABLE IF NOT EXISTS changes (
    seq INTEGER PRIMARY KEY AUTOINCREMENT,
    doc_id TEXT NOT NULL,
    rev TEXT NOT NULL,
    deleted INTEGER NOT NULL DEFAULT 0,
    data BLOB
);
"#;

/// Stored revision of a document and whether it is a tombstone.
struct Current {
  revision: Revision,
  deleted: bool,
}

/// SQLite-based document store.
///
/// Every commit happens under the connection lock and is fanned out to the
/// change subscribers before the lock is released, so subscribers observe
/// changes in commit order.
pub struct SqliteStore {
  conn: Mutex<Connection>,
  subscribers: Mutex<Vec<mpsc::UnboundedSender<RawChange>>>,
}

impl SqliteStore {
  /// Open or create a store at the given path.
  pub fn open(path: &Path) -> StoreResult<Self> {
    if let Some(parent) = path.parent() {
      if !parent.as_os_str().is_empty() {
        std::fs::create_dir_all(parent)
          .map_err(|e| StoreError::Database(format!("Failed to create store directory: {}", e)))?;
      }
    }

    let conn = Connection::open(path).map_err(|e| {
      StoreError::Database(format!(
        "Failed to open store at {}: {}",
        path.display(),
        e
      ))
    })?;

    info!(path = %path.display(), "Opened document store");
    Self::with_connection(conn)
  }

  /// Open a store that lives only as long as this value.
  pub fn open_in_memory() -> StoreResult<Self> {
    Self::with_connection(Connection::open_in_memory()?)
  }

  fn with_connection(conn: Connection) -> StoreResult<Self> {
    conn
      .execute_batch(STORE_SCHEMA)
      .map_err(|e| StoreError::Database(format!("Failed to run store migrations: {}", e)))?;

    Ok(Self {
      conn: Mutex::new(conn),
      subscribers: Mutex::new(Vec::new()),
    })
  }

  /// Number of change streams that are still being consumed.
  pub fn subscriber_count(&self) -> usize {
    self
      .subscribers
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
      .iter()
      .filter(|tx| !tx.is_closed())
      .count()
  }

  fn lock(&self) -> StoreResult<MutexGuard<'_, Connection>> {
    self
      .conn
      .lock()
      .map_err(|e| StoreError::Database(format!("Lock poisoned: {}", e)))
  }

  /// Deliver a committed change. Must be called with the connection locked.
  fn notify(&self, change: RawChange) {
    let mut subscribers = self
      .subscribers
      .lock()
      .unwrap_or_else(PoisonError::into_inner);
    subscribers.retain(|tx| tx.send(change.clone()).is_ok());
  }

  fn snapshot(&self) -> StoreResult<Snapshot> {
    let conn = self.lock()?;

    let mut stmt =
      conn.prepare("SELECT data FROM documents WHERE deleted = 0 ORDER BY date DESC, id ASC")?;
    let documents = stmt
      .query_map([], |row| row.get::<_, Vec<u8>>(0))?
      .map(|data| -> StoreResult<Document> { Ok(serde_json::from_slice(&data?)?) })
      .collect::<StoreResult<Vec<_>>>()?;

    let last_seq: i64 =
      conn.query_row("SELECT COALESCE(MAX(seq), 0) FROM changes", [], |row| row.get(0))?;

    Ok(Snapshot {
      documents,
      last_seq: last_seq as u64,
    })
  }

  fn put_document(&self, doc: Document) -> StoreResult<Document> {
    let mut conn = self.lock()?;
    let tx = conn.transaction()?;

    let (id, previous) = match doc.id.clone() {
      None => (DocumentId::generate(), None),
      Some(id) => match (current(&tx, &id)?, doc.revision.as_ref()) {
        // Caller-chosen id for a brand new document
        (None, None) => (id, None),
        // Recreating a removed document continues its revision history
        (Some(cur), None) if cur.deleted => (id, Some(cur.revision)),
        (Some(cur), Some(rev)) if !cur.deleted && cur.revision == *rev => (id, Some(cur.revision)),
        _ => return Err(StoreError::Conflict(id)),
      },
    };

    let revision = Revision::next(previous.as_ref(), &id, &doc.date, &doc.payload);
    let stored = Document {
      id: Some(id.clone()),
      revision: Some(revision.clone()),
      ..doc
    };

    let seq = put(&tx, &id, &revision, &stored)?;
    tx.commit()?;

    debug!(id = %id, rev = %revision, seq, "Document written");
    self.notify(RawChange {
      seq,
      id,
      revision,
      deleted: false,
      document: Some(stored.clone()),
    });

    Ok(stored)
  }

  fn remove_document(&self, doc: &Document) -> StoreResult<()> {
    let id = doc.id.clone().ok_or(StoreError::MissingId)?;

    let mut conn = self.lock()?;
    let tx = conn.transaction()?;

    let cur = match current(&tx, &id)? {
      Some(cur) if !cur.deleted => cur,
      _ => return Err(StoreError::NotFound(id)),
    };
    if doc.revision.as_ref() != Some(&cur.revision) {
      return Err(StoreError::Conflict(id));
    }

    let revision = Revision::next(Some(&cur.revision), &id, &doc.date, &Value::Null);
    let seq = tombstone(&tx, &id, &revision)?;
    tx.commit()?;

    debug!(id = %id, rev = %revision, seq, "Document removed");
    self.notify(RawChange {
      seq,
      id,
      revision,
      deleted: true,
      document: None,
    });

    Ok(())
  }

  fn apply_change(&self, change: &RawChange) -> StoreResult<bool> {
    let mut conn = self.lock()?;
    let tx = conn.transaction()?;

    if let Some(cur) = current(&tx, &change.id)? {
      if !change.revision.supersedes(&cur.revision) {
        return Ok(false);
      }
    }

    let (seq, document) = if change.deleted {
      (tombstone(&tx, &change.id, &change.revision)?, None)
    } else {
      let mut doc = change.document.clone().ok_or_else(|| {
        StoreError::Serialization(format!(
          "Replicated change for {} carries no document",
          change.id
        ))
      })?;
      doc.id = Some(change.id.clone());
      doc.revision = Some(change.revision.clone());
      (put(&tx, &change.id, &change.revision, &doc)?, Some(doc))
    };
    tx.commit()?;

    debug!(id = %change.id, rev = %change.revision, seq, "Replicated change applied");
    self.notify(RawChange {
      seq,
      id: change.id.clone(),
      revision: change.revision.clone(),
      deleted: change.deleted,
      document,
    });

    Ok(true)
  }

  fn open_stream(&self, since: Since) -> StoreResult<ChangeStream> {
    // Holding the connection keeps writers out until the sender is registered
    let conn = self.lock()?;
    let (tx, rx) = mpsc::unbounded_channel();

    if let Since::Seq(after) = since {
      let mut stmt = conn.prepare(
        "SELECT seq, doc_id, rev, deleted, data FROM changes
         WHERE seq > ?1
         ORDER BY seq",
      )?;
      let rows = stmt.query_map(params![after as i64], |row| {
        Ok((
          row.get::<_, i64>(0)?,
          row.get::<_, String>(1)?,
          row.get::<_, String>(2)?,
          row.get::<_, bool>(3)?,
          row.get::<_, Option<Vec<u8>>>(4)?,
        ))
      })?;

      for row in rows {
        let (seq, id, rev, deleted, data) = row?;
        let document = data
          .map(|data| serde_json::from_slice::<Document>(&data))
          .transpose()?;
        // The receiver is still in hand, so this cannot fail
        let _ = tx.send(RawChange {
          seq: seq as u64,
          id: DocumentId::new(id),
          revision: Revision::new(rev),
          deleted,
          document,
        });
      }
    }

    self
      .subscribers
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
      .push(tx);
    debug!(?since, "Change subscription registered");

    Ok(ChangeStream::new(rx))
  }
}

impl DocumentStore for SqliteStore {
  async fn read_all(&self) -> StoreResult<Snapshot> {
    self.snapshot()
  }

  async fn write(&self, doc: Document) -> StoreResult<Document> {
    self.put_document(doc)
  }

  async fn remove(&self, doc: &Document) -> StoreResult<()> {
    self.remove_document(doc)
  }

  fn subscribe_changes(&self, since: Since) -> StoreResult<ChangeStream> {
    self.open_stream(since)
  }

  async fn apply_replicated(&self, change: &RawChange) -> StoreResult<bool> {
    self.apply_change(change)
  }
}

fn current(tx: &Transaction<'_>, id: &DocumentId) -> StoreResult<Option<Current>> {
  let row = tx
    .query_row(
      "SELECT rev, deleted FROM documents WHERE id = ?1",
      params![id.as_str()],
      |row| Ok((row.get::<_, String>(0)?, row.get::<_, bool>(1)?)),
    )
    .optional()?;

  Ok(row.map(|(rev, deleted)| Current {
    revision: Revision::new(rev),
    deleted,
  }))
}

/// Store a live document and log the change. Returns the change sequence.
fn put(
  tx: &Transaction<'_>,
  id: &DocumentId,
  revision: &Revision,
  doc: &Document,
) -> StoreResult<u64> {
  let data = serde_json::to_vec(doc)?;

  tx.execute(
    "INSERT INTO documents (id, rev, date, deleted, data) VALUES (?1, ?2, ?3, 0, ?4)
     ON CONFLICT(id) DO UPDATE SET
       rev = excluded.rev, date = excluded.date, deleted = 0, data = excluded.data",
    params![id.as_str(), revision.as_str(), date_key(&doc.date), data],
  )?;

  log_change(tx, id, revision, false, Some(data.as_slice()))
}

/// Mark a document removed and log the change. Returns the change sequence.
fn tombstone(tx: &Transaction<'_>, id: &DocumentId, revision: &Revision) -> StoreResult<u64> {
  tx.execute(
    "INSERT INTO documents (id, rev, date, deleted, data) VALUES (?1, ?2, '', 1, NULL)
     ON CONFLICT(id) DO UPDATE SET rev = excluded.rev, deleted = 1, data = NULL",
    params![id.as_str(), revision.as_str()],
  )?;

  log_change(tx, id, revision, true, None)
}

fn log_change(
  tx: &Transaction<'_>,
  id: &DocumentId,
  revision: &Revision,
  deleted: bool,
  data: Option<&[u8]>,
) -> StoreResult<u64> {
  tx.execute(
    "INSERT INTO changes (doc_id, rev, deleted, data) VALUES (?1, ?2, ?3, ?4)",
    params![id.as_str(), revision.as_str(), deleted, data],
  )?;

  Ok(tx.last_insert_rowid() as u64)
}

/// Fixed-width, lexicographically sortable form of a date.
fn date_key(date: &DateTime<Utc>) -> String {
  date.to_rfc3339_opts(SecondsFormat::Micros, true)
}
