use chrono::{DateTime, SecondsFormat, Utc};
use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use serde_json::Value;
use std::path::PathBuf;
use std::sync::Arc;

use txsync::config::Config;
use txsync::{logging, Document, DocumentCache, Replicator, Revision, SqliteStore};

#[derive(Parser, Debug)]
#[command(name = "txsync")]
#[command(about = "A locally cached, live-synced transaction ledger")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/txsync/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// List transactions, newest first
  List,
  /// Record a new transaction
  Add {
    /// Transaction date (RFC 3339, defaults to now)
    #[arg(long)]
    date: Option<DateTime<Utc>>,
    /// Transaction fields as a JSON object
    #[arg(long, default_value = "{}")]
    payload: String,
  },
  /// Replace a transaction at its current revision
  Update {
    id: String,
    #[arg(long)]
    rev: String,
    #[arg(long)]
    date: DateTime<Utc>,
    #[arg(long, default_value = "{}")]
    payload: String,
  },
  /// Delete a transaction at its current revision
  Delete {
    id: String,
    #[arg(long)]
    rev: String,
  },
  /// Print the ledger every time it changes, until interrupted
  Watch,
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();

  // Load configuration
  let config = Config::load(args.config.as_deref())?;
  logging::init(&config.log)?;

  let local = Arc::new(SqliteStore::open(&config.store.resolved_path()?)?);
  let remote = match &config.remote {
    Some(remote) => Some((Arc::new(SqliteStore::open(&remote.path)?), remote.replication())),
    None => None,
  };
  let cache = DocumentCache::new(Arc::clone(&local));

  // One-shot commands catch up with the remote before and after running,
  // falling back to the local store alone when the remote is unavailable
  let one_shot = !matches!(args.command, Command::Watch);
  if one_shot {
    if let Some((store, replication)) = &remote {
      Replicator::catch_up(Arc::clone(&local), Arc::clone(store), replication).await;
    }
  }

  match args.command {
    Command::List => print_ledger(&cache.get_all().await?),
    Command::Add { date, payload } => {
      let doc = Document::new(date.unwrap_or_else(Utc::now), parse_payload(&payload)?);
      let stored = cache.create(doc).await?;
      print_saved(&stored);
    }
    Command::Update {
      id,
      rev,
      date,
      payload,
    } => {
      let doc = Document::new(date, parse_payload(&payload)?)
        .with_id(id)
        .with_revision(Revision::new(rev));
      let stored = cache.update(doc).await?;
      print_saved(&stored);
    }
    Command::Delete { id, rev } => {
      let current = cache
        .get_all()
        .await?
        .into_iter()
        .find(|doc| doc.id.as_ref().map(|d| d.as_str()) == Some(id.as_str()))
        .ok_or_else(|| eyre!("No transaction with id {}", id))?;
      cache.delete(&current.with_revision(Revision::new(rev))).await?;
      println!("deleted {}", id);
    }
    Command::Watch => {
      let replication = remote.as_ref().map(|(store, replication)| {
        Replicator::start(Arc::clone(&local), Arc::clone(store), replication.clone())
      });
      let result = watch(&cache).await;
      if let Some(handle) = replication {
        handle.cancel();
      }
      result?;
    }
  }

  if one_shot {
    if let Some((store, replication)) = &remote {
      Replicator::catch_up(Arc::clone(&local), Arc::clone(store), replication).await;
    }
  }

  Ok(())
}

async fn watch(cache: &DocumentCache<SqliteStore>) -> Result<()> {
  let mut updates = cache.updates();
  cache.get_all().await?;
  // The initial load already counts as seen
  updates.borrow_and_update();
  print_ledger(&cache.get_all().await?);

  loop {
    tokio::select! {
      _ = tokio::signal::ctrl_c() => break,
      changed = updates.changed() => {
        if changed.is_err() {
          break;
        }
        println!();
        print_ledger(&cache.get_all().await?);
      }
    }
  }

  Ok(())
}

fn parse_payload(payload: &str) -> Result<Value> {
  let value: Value =
    serde_json::from_str(payload).map_err(|e| eyre!("Invalid payload JSON: {}", e))?;
  if !value.is_object() {
    return Err(eyre!("Payload must be a JSON object"));
  }
  Ok(value)
}

fn print_saved(doc: &Document) {
  println!(
    "saved {} at {}",
    doc.id.as_ref().map(|id| id.as_str()).unwrap_or("-"),
    doc.revision.as_ref().map(|rev| rev.as_str()).unwrap_or("-")
  );
}

fn print_ledger(docs: &[Document]) {
  if docs.is_empty() {
    println!("(no transactions)");
    return;
  }

  for doc in docs {
    println!(
      "{}  {}  {}  {}",
      doc.date.to_rfc3339_opts(SecondsFormat::Secs, true),
      doc.id.as_ref().map(|id| id.as_str()).unwrap_or("-"),
      doc.revision.as_ref().map(|rev| rev.as_str()).unwrap_or("-"),
      doc.payload
    );
  }
}
