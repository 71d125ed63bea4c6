//! Document envelope, change events and the cache ordering rule.
//!
//! A document is a fixed envelope (`_id`, `_rev`, `date`) around an opaque
//! JSON payload. Nothing outside the store and the caller ever looks inside
//! the payload.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::cmp::Ordering;
use std::fmt;

/// Stable identifier assigned by the store on creation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DocumentId(String);

impl DocumentId {
  pub fn new(id: impl Into<String>) -> Self {
    Self(id.into())
  }

  /// Generate a fresh random id.
  pub fn generate() -> Self {
    Self(uuid::Uuid::new_v4().simple().to_string())
  }

  pub fn as_str(&self) -> &str {
    &self.0
  }
}

impl fmt::Display for DocumentId {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(&self.0)
  }
}

impl From<&str> for DocumentId {
  fn from(value: &str) -> Self {
    Self::new(value)
  }
}

impl From<String> for DocumentId {
  fn from(value: String) -> Self {
    Self(value)
  }
}

/// Opaque version token of the form `<generation>-<digest>`.
///
/// Required on update and delete so the store can reject lost updates.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Revision(String);

impl Revision {
  pub fn new(rev: impl Into<String>) -> Self {
    Self(rev.into())
  }

  /// Derive the revision that follows `previous` for the given content.
  pub fn next(
    previous: Option<&Revision>,
    id: &DocumentId,
    date: &DateTime<Utc>,
    payload: &Value,
  ) -> Self {
    let generation = previous.map(Revision::generation).unwrap_or(0) + 1;

    let mut hasher = Sha256::new();
    hasher.update(previous.map(Revision::as_str).unwrap_or("").as_bytes());
    hasher.update(id.as_str().as_bytes());
    hasher.update(date.to_rfc3339_opts(SecondsFormat::Micros, true).as_bytes());
    hasher.update(payload.to_string().as_bytes());
    let digest = hasher.finalize();

    Self(format!("{}-{}", generation, hex::encode(&digest[..16])))
  }

  /// Generation counter; 0 when the token is malformed.
  pub fn generation(&self) -> u64 {
    self
      .0
      .split_once('-')
      .and_then(|(generation, _)| generation.parse().ok())
      .unwrap_or(0)
  }

  /// Higher generation wins; equal generations fall back to the larger token.
  pub fn supersedes(&self, other: &Revision) -> bool {
    (self.generation(), self.as_str()) > (other.generation(), other.as_str())
  }

  pub fn as_str(&self) -> &str {
    &self.0
  }
}

impl fmt::Display for Revision {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(&self.0)
  }
}

/// The unit of record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
  /// Assigned by the store on create; `None` only for unsaved documents
  #[serde(rename = "_id", default, skip_serializing_if = "Option::is_none")]
  pub id: Option<DocumentId>,
  /// Current revision as last seen from the store
  #[serde(rename = "_rev", default, skip_serializing_if = "Option::is_none")]
  pub revision: Option<Revision>,
  /// Sole sort key
  pub date: DateTime<Utc>,
  /// Domain fields, never inspected by the cache
  #[serde(default)]
  pub payload: Value,
}

impl Document {
  /// A new, unsaved document.
  pub fn new(date: DateTime<Utc>, payload: Value) -> Self {
    Self {
      id: None,
      revision: None,
      date,
      payload,
    }
  }

  pub fn with_id(mut self, id: impl Into<DocumentId>) -> Self {
    self.id = Some(id.into());
    self
  }

  pub fn with_revision(mut self, revision: Revision) -> Self {
    self.revision = Some(revision);
    self
  }
}

/// Cache ordering: newest `date` first, equal dates ordered by id ascending.
pub fn newest_first(a: &Document, b: &Document) -> Ordering {
  b.date.cmp(&a.date).then_with(|| a.id.cmp(&b.id))
}

/// Sort documents in place by [`newest_first`].
pub fn sort_newest_first(documents: &mut [Document]) {
  documents.sort_by(newest_first);
}

/// A single state transition the store has already committed.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeEvent {
  id: DocumentId,
  document: Option<Document>,
}

impl ChangeEvent {
  /// The document was created or updated.
  pub fn upserted(id: DocumentId, mut document: Document) -> Self {
    document.id = Some(id.clone());
    Self {
      id,
      document: Some(document),
    }
  }

  /// The document was removed.
  pub fn deleted(id: DocumentId) -> Self {
    Self { id, document: None }
  }

  pub fn id(&self) -> &DocumentId {
    &self.id
  }

  /// Snapshot of the document; `None` when deleted.
  pub fn document(&self) -> Option<&Document> {
    self.document.as_ref()
  }

  pub fn is_deleted(&self) -> bool {
    self.document.is_none()
  }

  pub fn into_document(self) -> Option<Document> {
    self.document
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use chrono::TimeZone;
  use serde_json::json;

  fn at(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(secs, 0).unwrap()
  }

  #[test]
  fn test_newest_first_orders_by_date_descending() {
    let mut docs = vec![
      Document::new(at(5), json!({})).with_id("a"),
      Document::new(at(20), json!({})).with_id("b"),
      Document::new(at(10), json!({})).with_id("c"),
    ];
    sort_newest_first(&mut docs);

    let ids: Vec<_> = docs
      .iter()
      .map(|d| d.id.as_ref().unwrap().as_str())
      .collect();
    assert_eq!(ids, vec!["b", "c", "a"]);
  }

  #[test]
  fn test_equal_dates_break_ties_by_id() {
    let mut docs = vec![
      Document::new(at(7), json!({})).with_id("zulu"),
      Document::new(at(7), json!({})).with_id("alpha"),
      Document::new(at(7), json!({})).with_id("mike"),
    ];
    sort_newest_first(&mut docs);

    let ids: Vec<_> = docs
      .iter()
      .map(|d| d.id.as_ref().unwrap().as_str())
      .collect();
    assert_eq!(ids, vec!["alpha", "mike", "zulu"]);
  }

  #[test]
  fn test_revision_generation_increments() {
    let id = DocumentId::new("tx-1");
    let first = Revision::next(None, &id, &at(1), &json!({"amount": 1}));
    let second = Revision::next(Some(&first), &id, &at(1), &json!({"amount": 2}));

    assert_eq!(first.generation(), 1);
    assert_eq!(second.generation(), 2);
    assert_ne!(first, second);
  }

  #[test]
  fn test_supersedes_prefers_generation_then_token() {
    assert!(Revision::new("3-aaa").supersedes(&Revision::new("2-fff")));
    assert!(Revision::new("2-bbb").supersedes(&Revision::new("2-aaa")));
    assert!(!Revision::new("2-aaa").supersedes(&Revision::new("2-aaa")));
    assert!(!Revision::new("10-aaa").supersedes(&Revision::new("11-aaa")));
  }

  #[test]
  fn test_malformed_revision_has_generation_zero() {
    assert_eq!(Revision::new("garbage").generation(), 0);
    assert_eq!(Revision::new("x-abc").generation(), 0);
  }

  #[test]
  fn test_document_serializes_with_envelope_names() {
    let doc = Document::new(at(0), json!({"amount": 3}))
      .with_id("tx-1")
      .with_revision(Revision::new("1-abc"));
    let value = serde_json::to_value(&doc).unwrap();

    assert_eq!(value["_id"], "tx-1");
    assert_eq!(value["_rev"], "1-abc");
    assert_eq!(value["payload"]["amount"], 3);
  }

  #[test]
  fn test_change_event_stamps_id_on_document() {
    let event = ChangeEvent::upserted("tx-9".into(), Document::new(at(0), json!({})));
    assert!(!event.is_deleted());
    assert_eq!(event.document().unwrap().id, Some("tx-9".into()));

    let event = ChangeEvent::deleted("tx-9".into());
    assert!(event.is_deleted());
    assert!(event.document().is_none());
  }
}
