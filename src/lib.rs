//! Locally cached transaction ledger kept in sync with a remote store.
//!
//! - [`store`]: the document store capability and its SQLite implementation
//! - [`feed`]: ordered change events from a store
//! - [`cache`]: the sorted in-memory view, reconciled from the change feed
//! - [`sync`]: continuous replication between a local and a remote store

pub mod cache;
pub mod config;
pub mod document;
pub mod feed;
pub mod logging;
pub mod store;
pub mod sync;

pub use cache::{CacheError, CacheState, DocumentCache};
pub use document::{ChangeEvent, Document, DocumentId, Revision};
pub use feed::{ChangeFeed, ChangeEvents, Subscription};
pub use store::{DocumentStore, Since, Snapshot, SqliteStore, StoreError};
pub use sync::{ReplicationConfig, ReplicationHandle, Replicator};
