// Copyright 2025 Vessel project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

#![deny(warnings)]
// Enable all clippy lints except for many of the pedantic ones. It's a shame this needs to be copied and pasted across crates, but there doesn't appear to be a way to include inner attributes from a common source.
#![deny(
    clippy::all,
    clippy::default_trait_access,
    clippy::expl_impl_clone_on_copy,
    clippy::if_not_else,
    clippy::needless_continue,
    clippy::unseparated_literal_suffix,
    clippy::used_underscore_binding
)]
// It is often more clear to show that nothing is being moved.
#![allow(clippy::match_ref_pats)]
// Subjective style.
#![allow(
    clippy::len_without_is_empty,
    clippy::redundant_field_names,
    clippy::too_many_arguments
)]
// Default isn't as big a deal as people seem to think it is.
#![allow(clippy::new_without_default, clippy::new_ret_no_self)]
// Arc<Mutex> can be more clear than needing to grok Orderings:
#![allow(clippy::mutex_atomic)]

use std::path::Path;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use regex::Regex;
use rusqlite::types::Value as SqlValue;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value as JsonValue;
use tokio::task::JoinHandle;

use protocol::{Error, Result};

/// How often the background retention sweep runs. The first sweep happens
/// immediately after open.
const SWEEP_INTERVAL: Duration = Duration::from_secs(24 * 60 * 60);

const DEFAULT_TRAVERSAL_LIMIT: u32 = 50;

const SCHEMA: &str = "
  CREATE TABLE IF NOT EXISTS cache (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    kind TEXT NOT NULL,
    key TEXT NOT NULL,
    parent_id INTEGER,
    data TEXT NOT NULL,
    created_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP NOT NULL,
    updated_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP NOT NULL,
    UNIQUE(kind, key),
    FOREIGN KEY (parent_id) REFERENCES cache(id)
  );
  CREATE INDEX IF NOT EXISTS idx_cache_kind ON cache(kind);
  CREATE INDEX IF NOT EXISTS idx_cache_parent ON cache(parent_id);
  CREATE INDEX IF NOT EXISTS idx_cache_created ON cache(created_at);
";

const ENTRY_COLUMNS: &str = "id, kind, key, parent_id, data, created_at, updated_at";

/// Filter keys are interpolated into `json_extract` paths, so only plain
/// identifier/dot paths are accepted. This is a security invariant, enforced
/// at the API boundary rather than in the engine.
fn safe_field_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_.]*$").unwrap())
}

/// One row of the general cache: a JSON payload addressed by `(kind, key)`,
/// with an optional self-referential parent edge.
#[derive(Clone, Debug, PartialEq)]
pub struct CacheEntry {
    pub id: i64,
    pub kind: String,
    pub key: String,
    pub parent_id: Option<i64>,
    pub data: JsonValue,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl CacheEntry {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<CacheEntry> {
        let data: String = row.get(4)?;
        let data = serde_json::from_str(&data).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(4, rusqlite::types::Type::Text, Box::new(e))
        })?;
        Ok(CacheEntry {
            id: row.get(0)?,
            kind: row.get(1)?,
            key: row.get(2)?,
            parent_id: row.get(3)?,
            data,
            created_at: row.get(5)?,
            updated_at: row.get(6)?,
        })
    }

    /// Decode the stored payload into a typed value.
    pub fn data_as<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_value(self.data.clone())?)
    }

    pub fn data_str(&self, field: &str) -> Option<&str> {
        self.data.get(field).and_then(JsonValue::as_str)
    }

    pub fn data_bool(&self, field: &str) -> bool {
        self.data
            .get(field)
            .and_then(JsonValue::as_bool)
            .unwrap_or(false)
    }
}

///
/// A process-local persistent KV store with kind-partitioned keys and a
/// single parent edge per row. Doubles as the response cache of the remote
/// client and as the backing store of the image lineage graph.
///
/// All statements run on blocking worker threads; a mutex around the single
/// WAL-mode connection serializes access.
///
#[derive(Clone)]
pub struct Cache {
    conn: Arc<Mutex<Connection>>,
    retention_days: i64,
    sweep_task: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl Cache {
    /// Open (creating if necessary) the cache at `db_path` and start the
    /// background retention sweep. `retention_days <= 0` disables deletion.
    pub async fn open(db_path: &Path, retention_days: i64) -> Result<Cache> {
        if let Some(parent) = db_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let db_path = db_path.to_owned();
        let conn = tokio::task::spawn_blocking(move || -> Result<Connection> {
            let conn = Connection::open(&db_path)
                .map_err(|e| Error::Persistence(format!("failed to open {db_path:?}: {e}")))?;
            conn.pragma_update(None, "journal_mode", "WAL")
                .map_err(persistence)?;
            conn.execute_batch(SCHEMA).map_err(persistence)?;
            Ok(conn)
        })
        .await
        .map_err(join_error)??;

        let cache = Cache {
            conn: Arc::new(Mutex::new(conn)),
            retention_days,
            sweep_task: Arc::new(Mutex::new(None)),
        };

        let sweeper = cache.clone();
        let task = tokio::spawn(async move {
            let mut interval = tokio::time::interval(SWEEP_INTERVAL);
            loop {
                // The first tick completes immediately, giving a sweep at open.
                interval.tick().await;
                match sweeper.retain().await {
                    Ok(0) => {}
                    Ok(deleted) => log::debug!("Retention sweep deleted {deleted} cache entries"),
                    Err(e) => log::warn!("Retention sweep failed: {e}"),
                }
            }
        });
        *cache.sweep_task.lock() = Some(task);

        Ok(cache)
    }

    /// Cancel and await the background sweep. The connection itself closes
    /// when the last clone is dropped.
    pub async fn close(&self) {
        let task = self.sweep_task.lock().take();
        if let Some(task) = task {
            task.abort();
            let _ = task.await;
        }
    }

    async fn with_conn<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> rusqlite::Result<T> + Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let conn = conn.lock();
            f(&conn).map_err(persistence)
        })
        .await
        .map_err(join_error)?
    }

    /// Upsert `(kind, key)`. A pre-existing row keeps its `id` and
    /// `created_at`; `data`, `parent_id` and `updated_at` are replaced.
    pub async fn put<D: Serialize>(
        &self,
        kind: &str,
        key: &str,
        data: &D,
        parent_id: Option<i64>,
    ) -> Result<CacheEntry> {
        let data = serde_json::to_string(data)
            .map_err(|e| Error::InvalidArgument(format!("cache data is not JSON: {e}")))?;
        let kind = kind.to_owned();
        let key = key.to_owned();
        let now = Utc::now();

        self.with_conn(move |conn| {
            conn.prepare_cached(
                "INSERT INTO cache (kind, key, parent_id, data, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?5)
         ON CONFLICT(kind, key) DO UPDATE
         SET parent_id = excluded.parent_id, data = excluded.data, updated_at = excluded.updated_at",
            )?
            .execute(params![kind, key, parent_id, data, now])?;

            conn.prepare_cached(&format!(
                "SELECT {ENTRY_COLUMNS} FROM cache WHERE kind = ?1 AND key = ?2"
            ))?
            .query_row(params![kind, key], CacheEntry::from_row)
        })
        .await
    }

    /// Fetch `(kind, key)`. With a `ttl`, rows whose `updated_at` is older
    /// than the ttl are reported as absent but left in place.
    pub async fn get(&self, kind: &str, key: &str, ttl: Option<Duration>) -> Result<Option<CacheEntry>> {
        let kind = kind.to_owned();
        let key = key.to_owned();
        let entry = self
            .with_conn(move |conn| {
                conn.prepare_cached(&format!(
                    "SELECT {ENTRY_COLUMNS} FROM cache WHERE kind = ?1 AND key = ?2"
                ))?
                .query_row(params![kind, key], CacheEntry::from_row)
                .optional()
            })
            .await?;

        match (entry, ttl) {
            (Some(entry), Some(ttl)) if !ttl.is_zero() => {
                let age = Utc::now().signed_duration_since(entry.updated_at);
                if age.to_std().unwrap_or(Duration::ZERO) > ttl {
                    Ok(None)
                } else {
                    Ok(Some(entry))
                }
            }
            (entry, _) => Ok(entry),
        }
    }

    /// Remove `(kind, key)`, reporting whether a row existed.
    pub async fn delete(&self, kind: &str, key: &str) -> Result<bool> {
        let kind = kind.to_owned();
        let key = key.to_owned();
        self.with_conn(move |conn| {
            let deleted = conn
                .prepare_cached("DELETE FROM cache WHERE kind = ?1 AND key = ?2")?
                .execute(params![kind, key])?;
            Ok(deleted > 0)
        })
        .await
    }

    pub async fn get_by_id(&self, id: i64) -> Result<Option<CacheEntry>> {
        self.with_conn(move |conn| {
            conn.prepare_cached(&format!("SELECT {ENTRY_COLUMNS} FROM cache WHERE id = ?1"))?
                .query_row(params![id], CacheEntry::from_row)
                .optional()
        })
        .await
    }

    /// List entries of a kind, newest first, optionally filtered on fields of
    /// the JSON payload. Filter keys must match the safe identifier pattern;
    /// values are always bound, never interpolated.
    pub async fn list_entries(
        &self,
        kind: &str,
        limit: u32,
        filters: &[(String, JsonValue)],
    ) -> Result<Vec<CacheEntry>> {
        for (field, _) in filters {
            if !safe_field_pattern().is_match(field) {
                return Err(Error::InvalidArgument(format!(
                    "invalid filter field name: {field:?}"
                )));
            }
        }

        let mut query = format!("SELECT {ENTRY_COLUMNS} FROM cache WHERE kind = ?");
        for (field, _) in filters {
            query.push_str(&format!(" AND json_extract(data, '$.{field}') = ?"));
        }
        query.push_str(" ORDER BY created_at DESC LIMIT ?");

        let mut bound: Vec<SqlValue> = Vec::with_capacity(filters.len() + 2);
        bound.push(SqlValue::Text(kind.to_owned()));
        for (_, value) in filters {
            bound.push(bind_json_value(value));
        }
        bound.push(SqlValue::Integer(i64::from(limit)));

        self.with_conn(move |conn| {
            conn.prepare_cached(&query)?
                .query_map(params_from_iter(bound), CacheEntry::from_row)?
                .collect()
        })
        .await
    }

    /// Walk `parent_id` edges upward from `(kind, key)`, excluding the row
    /// itself: the immediate parent comes first, the root last. Bounded by
    /// `limit` to survive a corrupted graph with a cycle.
    pub async fn get_ancestors(
        &self,
        kind: &str,
        key: &str,
        limit: Option<u32>,
    ) -> Result<Vec<CacheEntry>> {
        let kind = kind.to_owned();
        let key = key.to_owned();
        let limit = limit.unwrap_or(DEFAULT_TRAVERSAL_LIMIT);
        self.with_conn(move |conn| {
            conn.prepare_cached(
                "WITH RECURSIVE ancestor_chain(id, kind, key, parent_id, data, created_at, updated_at, depth) AS
           (
             SELECT id, kind, key, parent_id, data, created_at, updated_at, 0
             FROM cache WHERE kind = ?1 AND key = ?2
             UNION ALL
             SELECT c.id, c.kind, c.key, c.parent_id, c.data, c.created_at, c.updated_at, ac.depth + 1
             FROM cache c INNER JOIN ancestor_chain ac ON c.id = ac.parent_id
             WHERE ac.depth < ?3
           )
         SELECT id, kind, key, parent_id, data, created_at, updated_at
         FROM ancestor_chain WHERE depth > 0 ORDER BY depth",
            )?
            .query_map(params![kind, key, limit], CacheEntry::from_row)?
            .collect()
        })
        .await
    }

    /// The transitive closure of rows below `(kind, parent_key)`, bounded by
    /// `limit`.
    pub async fn get_children(
        &self,
        kind: &str,
        parent_key: &str,
        limit: Option<u32>,
    ) -> Result<Vec<CacheEntry>> {
        let parent = match self.get(kind, parent_key, None).await? {
            Some(parent) => parent,
            None => return Ok(vec![]),
        };

        let limit = limit.unwrap_or(DEFAULT_TRAVERSAL_LIMIT);
        self.with_conn(move |conn| {
            conn.prepare_cached(
                "WITH RECURSIVE child_chain(id, kind, key, parent_id, data, created_at, updated_at) AS (
           SELECT id, kind, key, parent_id, data, created_at, updated_at
           FROM cache WHERE parent_id = ?1
           UNION ALL
           SELECT c.id, c.kind, c.key, c.parent_id, c.data, c.created_at, c.updated_at
           FROM cache c INNER JOIN child_chain cc ON c.parent_id = cc.id
         )
         SELECT id, kind, key, parent_id, data, created_at, updated_at FROM child_chain LIMIT ?2",
            )?
            .query_map(params![parent.id, limit], CacheEntry::from_row)?
            .collect()
        })
        .await
    }

    /// Delete rows whose `created_at` is older than the retention cutoff,
    /// returning how many were removed.
    pub async fn retain(&self) -> Result<usize> {
        if self.retention_days <= 0 {
            return Ok(0);
        }
        let cutoff = Utc::now() - chrono::Duration::days(self.retention_days);
        self.with_conn(move |conn| {
            conn.prepare_cached("DELETE FROM cache WHERE created_at < ?1")?
                .execute(params![cutoff])
        })
        .await
    }
}

fn bind_json_value(value: &JsonValue) -> SqlValue {
    match value {
        JsonValue::Null => SqlValue::Null,
        JsonValue::Bool(b) => SqlValue::Integer(i64::from(*b)),
        JsonValue::Number(n) => match n.as_i64() {
            Some(i) => SqlValue::Integer(i),
            None => SqlValue::Real(n.as_f64().unwrap_or_default()),
        },
        JsonValue::String(s) => SqlValue::Text(s.clone()),
        // Arrays/objects compare against json_extract's serialized form.
        other => SqlValue::Text(other.to_string()),
    }
}

fn persistence(err: rusqlite::Error) -> Error {
    Error::Persistence(err.to_string())
}

fn join_error(err: tokio::task::JoinError) -> Error {
    Error::Persistence(format!("cache worker task failed: {err}"))
}
