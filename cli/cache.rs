// Copyright 2025 the modcdn authors. MIT license.

use std::path::Path;
use std::sync::Arc;

use parking_lot::Mutex;
use rusqlite::params;
use rusqlite::Connection;
use rusqlite::OptionalExtension;

use crate::errors::AnyError;

const TABLE_INITIALIZER: &str = "
  CREATE TABLE IF NOT EXISTS modulecache (
    url TEXT PRIMARY KEY,
    data BLOB NOT NULL
  );
  CREATE TABLE IF NOT EXISTS info (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
  );
";

/// Transformed sources keyed by canonical URL path. The store has no TTL:
/// entries are only ever invalidated wholesale when the build string in
/// the canonical grammar changes, which happens here by clearing the
/// table on open.
#[derive(Clone)]
pub struct ModuleCache {
  conn: Arc<Mutex<Connection>>,
}

impl ModuleCache {
  pub fn from_path(path: &Path, build: &str) -> Result<Self, AnyError> {
    let conn = Connection::open(path)?;
    Self::initialize(&conn, build)?;
    Ok(Self {
      conn: Arc::new(Mutex::new(conn)),
    })
  }

  pub fn in_memory(build: &str) -> Result<Self, AnyError> {
    let conn = Connection::open_in_memory()?;
    Self::initialize(&conn, build)?;
    Ok(Self {
      conn: Arc::new(Mutex::new(conn)),
    })
  }

  fn initialize(conn: &Connection, build: &str) -> Result<(), AnyError> {
    // journal_mode returns its new value as a row
    conn.query_row("PRAGMA journal_mode=WAL", [], |_| Ok(()))?;
    conn.execute_batch(TABLE_INITIALIZER)?;
    let stored: Option<String> = conn
      .query_row("SELECT value FROM info WHERE key='CDNV'", [], |row| {
        row.get(0)
      })
      .optional()?;
    if stored.as_deref() != Some(build) {
      conn.execute("DELETE FROM modulecache", [])?;
      conn.execute(
        "INSERT OR REPLACE INTO info (key, value) VALUES ('CDNV', ?1)",
        params![build],
      )?;
    }
    Ok(())
  }

  pub fn get(&self, url: &str) -> Option<Vec<u8>> {
    let result = self
      .conn
      .lock()
      .query_row(
        "SELECT data FROM modulecache WHERE url=?1 LIMIT 1",
        params![url],
        |row| row.get::<_, Vec<u8>>(0),
      )
      .optional();
    match result {
      Ok(maybe_data) => maybe_data,
      Err(err) => {
        log::debug!("module cache read failed for {}: {:#}", url, err);
        None
      }
    }
  }

  /// Upsert, last writer wins. Failures are logged and swallowed: a lost
  /// write only costs a recomputation on the next request.
  pub fn set(&self, url: &str, data: &[u8]) {
    let result = self.conn.lock().execute(
      "INSERT OR REPLACE INTO modulecache (url, data) VALUES (?1, ?2)",
      params![url, data],
    );
    if let Err(err) = result {
      log::debug!("module cache write failed for {}: {:#}", url, err);
    }
  }
}
