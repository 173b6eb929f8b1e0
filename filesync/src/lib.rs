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

use std::collections::{BTreeSet, HashSet};
use std::hash::{Hash, Hasher};
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use itertools::Itertools;
use parking_lot::Mutex;
use regex::Regex;
use rusqlite::{params, Connection, OptionalExtension, Row};
use tokio::sync::Semaphore;
use uuid::Uuid;

use protocol::{Error, Result};
use remote::Client;

const UPLOAD_CONCURRENCY: usize = 10;

/// Synced directory states are revalidated against the server after this
/// long, in case blobs were evicted remotely.
const REVALIDATION_INTERVAL: Duration = Duration::from_secs(24 * 60 * 60);

const SCHEMA: &str = "
  CREATE TABLE IF NOT EXISTS files (
    id INTEGER PRIMARY KEY,
    path TEXT UNIQUE NOT NULL,
    symlink_to TEXT,
    size INTEGER NOT NULL,
    mtime INTEGER NOT NULL,
    ino INTEGER NOT NULL,
    mode INTEGER NOT NULL,
    sha256 TEXT NOT NULL,
    uuid TEXT NOT NULL,
    created_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP NOT NULL,
    updated_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP NOT NULL
  );
  CREATE INDEX IF NOT EXISTS idx_files_sha256 ON files(sha256);

  CREATE TABLE IF NOT EXISTS directory_state (
    id INTEGER PRIMARY KEY,
    uuid TEXT NOT NULL,
    name TEXT,
    destination TEXT NOT NULL,
    created_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP NOT NULL,
    updated_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP NOT NULL
  );

  CREATE UNIQUE INDEX IF NOT EXISTS idx_directory_state_uuid ON directory_state(uuid);

  CREATE TABLE IF NOT EXISTS directory_state_file (
    id INTEGER PRIMARY KEY,
    state_id INTEGER NOT NULL REFERENCES directory_state(id) ON DELETE CASCADE,
    uuid TEXT NOT NULL,
    target_path TEXT NOT NULL,
    target_mode INTEGER NOT NULL,
    UNIQUE(state_id, target_path)
  );
";

///
/// A snapshot of a local regular file, as last seen or uploaded.
///
/// Identity (equality and hashing) is `(path, size, mtime_ns, ino, mode)`:
/// the remote attachment is an *output* of uploading, not part of deciding
/// whether the local file changed. When reconciling local and synced sets,
/// the "unchanged" subset must always be drawn from the synced side, which
/// is the only side carrying uuids.
///
#[derive(Clone, Debug)]
pub struct FileState {
    pub path: PathBuf,
    pub size: u64,
    pub mtime_ns: i64,
    pub ino: u64,
    pub mode: u32,
    pub sha256: Option<String>,
    pub uuid: Option<String>,
}

impl PartialEq for FileState {
    fn eq(&self, other: &FileState) -> bool {
        self.path == other.path
            && self.size == other.size
            && self.mtime_ns == other.mtime_ns
            && self.ino == other.ino
            && self.mode == other.mode
    }
}

impl Eq for FileState {}

impl Hash for FileState {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.path.hash(state);
        self.size.hash(state);
        self.mtime_ns.hash(state);
        self.ino.hash(state);
        self.mode.hash(state);
    }
}

impl FileState {
    pub fn from_path(path: &Path) -> std::io::Result<FileState> {
        let metadata = path.metadata()?;
        Ok(FileState {
            path: path.to_owned(),
            size: metadata.len(),
            mtime_ns: metadata.mtime() * 1_000_000_000 + metadata.mtime_nsec(),
            ino: metadata.ino(),
            mode: metadata.mode(),
            sha256: None,
            uuid: None,
        })
    }

    fn from_row(row: &Row<'_>) -> rusqlite::Result<FileState> {
        Ok(FileState {
            path: PathBuf::from(row.get::<_, String>("path")?),
            size: row.get::<_, i64>("size")? as u64,
            mtime_ns: row.get("mtime")?,
            ino: row.get::<_, i64>("ino")? as u64,
            mode: row.get::<_, i64>("mode")? as u32,
            sha256: row.get("sha256")?,
            uuid: row.get("uuid")?,
        })
    }
}

/// A durable record of a local subtree having been uploaded and mapped to a
/// destination inside a future instance.
#[derive(Clone, Debug, PartialEq)]
pub struct DirectoryState {
    pub id: i64,
    pub uuid: String,
    pub name: Option<String>,
    pub destination: String,
    pub updated_at: Option<DateTime<Utc>>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct DirectoryStateFile {
    pub file_uuid: String,
    pub target_path: String,
    pub target_mode: u32,
}

///
/// The incremental uploader: turns a local directory plus exclude patterns
/// into a directory state, uploading only blobs the remote does not already
/// have, and revalidating the state periodically against server-side
/// eviction.
///
#[derive(Clone)]
pub struct FileCache {
    conn: Arc<Mutex<Connection>>,
    retention_days: i64,
    upload_semaphore: Arc<Semaphore>,
    sync_lock: Arc<tokio::sync::Mutex<()>>,
}

impl FileCache {
    pub async fn open(db_path: &Path, retention_days: i64) -> Result<FileCache> {
        if let Some(parent) = db_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let db_path = db_path.to_owned();
        let conn = tokio::task::spawn_blocking(move || -> Result<Connection> {
            let conn = Connection::open(&db_path)
                .map_err(|e| Error::Persistence(format!("failed to open {db_path:?}: {e}")))?;
            conn.pragma_update(None, "journal_mode", "WAL")
                .map_err(persistence)?;
            conn.pragma_update(None, "foreign_keys", "ON")
                .map_err(persistence)?;
            conn.execute_batch(SCHEMA).map_err(persistence)?;

            // Migration for pre-`updated_at` layouts. SQLite disallows
            // CURRENT_TIMESTAMP defaults in ALTER TABLE, so the column is
            // nullable and NULL means "never validated".
            for table in ["files", "directory_state"] {
                let columns: Vec<String> = conn
                    .prepare(&format!("PRAGMA table_info({table})"))
                    .map_err(persistence)?
                    .query_map([], |row| row.get::<_, String>(1))
                    .map_err(persistence)?
                    .collect::<rusqlite::Result<_>>()
                    .map_err(persistence)?;
                if !columns.iter().any(|c| c == "updated_at") {
                    conn.execute(
                        &format!("ALTER TABLE {table} ADD COLUMN updated_at TIMESTAMP"),
                        [],
                    )
                    .map_err(persistence)?;
                }
            }

            Ok(conn)
        })
        .await
        .map_err(join_error)??;

        Ok(FileCache {
            conn: Arc::new(Mutex::new(conn)),
            retention_days,
            upload_semaphore: Arc::new(Semaphore::new(UPLOAD_CONCURRENCY)),
            sync_lock: Arc::new(tokio::sync::Mutex::new(())),
        })
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

    async fn with_conn_mut<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> rusqlite::Result<T> + Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = conn.lock();
            f(&mut conn).map_err(persistence)
        })
        .await
        .map_err(join_error)?
    }

    /// Walk `root` and return the set of regular files under it, skipping
    /// anything matched by an exclude pattern. Patterns are shell-style
    /// globs (`*` and `?`), case-insensitive, matched against the path
    /// relative to `root`.
    pub fn traverse_directory_files(
        root: &Path,
        excludes: &BTreeSet<String>,
    ) -> Result<HashSet<FileState>> {
        let patterns = excludes
            .iter()
            .map(|p| compile_exclude(p))
            .collect::<Result<Vec<Regex>>>()?;

        let mut result = HashSet::new();
        for entry in walkdir::WalkDir::new(root) {
            let entry =
                entry.map_err(|e| Error::Persistence(format!("failed to walk {root:?}: {e}")))?;
            let relative = entry
                .path()
                .strip_prefix(root)
                .unwrap_or_else(|_| entry.path());
            let relative = relative.to_string_lossy();
            if patterns.iter().any(|p| p.is_match(&relative)) {
                continue;
            }
            // Symlinks and non-regular files are not synced.
            if entry.file_type().is_file() {
                result.insert(FileState::from_path(entry.path())?);
            }
        }
        Ok(result)
    }

    /// The files currently recorded for a directory state, with their
    /// remote attachments populated.
    pub async fn get_synced_directory_files(&self, state_id: i64) -> Result<HashSet<FileState>> {
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare_cached(
                "SELECT f.* FROM directory_state ds
         JOIN directory_state_file dsf ON ds.id = dsf.state_id
         JOIN files f ON dsf.uuid = f.uuid
         WHERE ds.id = ?1",
            )?;
            let rows = stmt.query_map(params![state_id], FileState::from_row)?;
            rows.collect()
        })
        .await
    }

    async fn upload_file(&self, client: &Client, state: &FileState) -> Result<FileState> {
        let response = {
            let _permit = self
                .upload_semaphore
                .acquire()
                .await
                .map_err(|_| Error::Persistence("upload semaphore closed".to_owned()))?;
            client.upload_path(&state.path).await?
        };

        let path_str = state.path.to_string_lossy().into_owned();
        let state = state.clone();
        let now = Utc::now();
        self.with_conn(move |conn| {
            conn.prepare_cached(
                "INSERT INTO files (path, size, mtime, ino, mode, sha256, uuid, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?8)
         ON CONFLICT (path) DO UPDATE SET
           size = excluded.size,
           mtime = excluded.mtime,
           ino = excluded.ino,
           mode = excluded.mode,
           sha256 = excluded.sha256,
           uuid = excluded.uuid,
           updated_at = excluded.updated_at",
            )?
            .execute(params![
                path_str,
                state.size as i64,
                state.mtime_ns,
                state.ino as i64,
                i64::from(state.mode),
                response.sha256,
                response.uuid,
                now,
            ])?;

            // Query by unique path: lastrowid is unreliable with ON CONFLICT.
            conn.prepare_cached("SELECT * FROM files WHERE path = ?1")?
                .query_row(params![path_str], FileState::from_row)
        })
        .await
    }

    async fn upload_all(
        &self,
        client: &Client,
        files: impl IntoIterator<Item = FileState>,
    ) -> Result<Vec<FileState>> {
        futures::future::try_join_all(
            files
                .into_iter()
                .map(|state| async move { self.upload_file(client, &state).await }),
        )
        .await
    }

    async fn needs_revalidation(&self, state_id: i64) -> Result<bool> {
        let updated_at: Option<Option<DateTime<Utc>>> = self
            .with_conn(move |conn| {
                conn.prepare_cached("SELECT updated_at FROM directory_state WHERE id = ?1")?
                    .query_row(params![state_id], |row| row.get(0))
                    .optional()
            })
            .await?;

        Ok(match updated_at {
            // Unknown state or a migrated NULL row: revalidate now.
            None | Some(None) => true,
            Some(Some(updated_at)) => {
                let age = Utc::now().signed_duration_since(updated_at);
                age.to_std().unwrap_or(Duration::ZERO) > REVALIDATION_INTERVAL
            }
        })
    }

    async fn touch_directory_state(&self, state_id: i64) -> Result<()> {
        let now = Utc::now();
        self.with_conn(move |conn| {
            conn.prepare_cached("UPDATE directory_state SET updated_at = ?1 WHERE id = ?2")?
                .execute(params![now, state_id])
                .map(|_| ())
        })
        .await
    }

    /// Ask the server whether each synced blob still exists; re-upload the
    /// ones it no longer has, invalidating their response-cache entries
    /// first so the re-upload actually hits the network.
    async fn revalidate_files(
        &self,
        client: &Client,
        state_id: i64,
        synced_files: &HashSet<FileState>,
        root: &Path,
        destination: &str,
    ) -> Result<()> {
        if synced_files.is_empty() {
            return self.touch_directory_state(state_id).await;
        }

        let with_hash: Vec<&FileState> =
            synced_files.iter().filter(|f| f.sha256.is_some()).collect();
        let checks = futures::future::try_join_all(with_hash.iter().map(|state| {
            let sha256 = state.sha256.clone().unwrap_or_default();
            async move {
                let exists = client.check_file_exists_by_hash(&sha256).await?;
                Ok::<_, Error>((*state, exists))
            }
        }))
        .await?;

        let stale: Vec<&FileState> = checks
            .into_iter()
            .filter_map(|(state, exists)| if exists { None } else { Some(state) })
            .collect();

        if !stale.is_empty() {
            log::info!(
                "Revalidation found {} stale blobs for directory state {state_id}, re-uploading",
                stale.len()
            );
            for state in &stale {
                if let Some(sha256) = &state.sha256 {
                    client.cache().delete("file_by_hash", sha256).await?;
                }
                if let Some(uuid) = &state.uuid {
                    client.cache().delete("file_exists_by_uuid", uuid).await?;
                }
            }

            let uploaded = self
                .upload_all(client, stale.into_iter().cloned())
                .await?;

            for state in uploaded {
                let target_path = target_path_for(&state, root, destination)?;
                let uuid = state.uuid.clone().ok_or_else(|| {
                    Error::Persistence("re-uploaded file has no remote attachment".to_owned())
                })?;
                self.with_conn(move |conn| {
                    conn.prepare_cached(
                        "UPDATE directory_state_file SET uuid = ?1
             WHERE state_id = ?2 AND target_path = ?3",
                    )?
                    .execute(params![uuid, state_id, target_path])
                    .map(|_| ())
                })
                .await?;
            }
        }

        self.touch_directory_state(state_id).await
    }

    async fn update_synced_directory(
        &self,
        client: &Client,
        state_id: i64,
        local_files: HashSet<FileState>,
        synced_files: HashSet<FileState>,
        root: &Path,
        destination: &str,
    ) -> Result<i64> {
        let _guard = self.sync_lock.lock().await;

        // New or modified local files.
        let to_upload: Vec<FileState> = local_files
            .difference(&synced_files)
            .cloned()
            .collect();
        let uploaded = self.upload_all(client, to_upload).await?;

        // Unchanged files must come from the synced set, which carries the
        // uuids; the local side of the intersection has uuid=None.
        let non_changed: Vec<FileState> = synced_files
            .iter()
            .filter(|f| local_files.contains(f))
            .cloned()
            .collect();

        let mut rows = Vec::with_capacity(uploaded.len() + non_changed.len());
        for state in uploaded.into_iter().chain(non_changed) {
            let target_path = target_path_for(&state, root, destination)?;
            let uuid = state.uuid.clone().ok_or_else(|| {
                Error::Persistence(format!("synced file {:?} has no remote uuid", state.path))
            })?;
            rows.push((uuid, target_path, i64::from(state.mode)));
        }

        let now = Utc::now();
        self.with_conn_mut(move |conn| {
            let tx = conn.transaction()?;
            tx.execute(
                "DELETE FROM directory_state_file WHERE state_id = ?1",
                params![state_id],
            )?;
            for (uuid, target_path, mode) in &rows {
                tx.execute(
                    "INSERT INTO directory_state_file (state_id, uuid, target_path, target_mode)
           VALUES (?1, ?2, ?3, ?4)",
                    params![state_id, uuid, target_path, mode],
                )?;
            }
            tx.execute(
                "UPDATE directory_state SET updated_at = ?1 WHERE id = ?2",
                params![now, state_id],
            )?;
            tx.commit()
        })
        .await?;

        Ok(state_id)
    }

    async fn sync_new_directory(
        &self,
        client: &Client,
        local_files: HashSet<FileState>,
        path_uuid: &str,
        root: &Path,
        destination: &str,
        name: Option<&str>,
    ) -> Result<i64> {
        let _guard = self.sync_lock.lock().await;

        let path_uuid = path_uuid.to_owned();
        let name = name.map(str::to_owned);
        let destination_owned = destination.to_owned();
        let now = Utc::now();
        let state_id = self
            .with_conn(move |conn| {
                conn.prepare_cached(
                    "INSERT INTO directory_state (uuid, name, destination, created_at, updated_at)
           VALUES (?1, ?2, ?3, ?4, ?4)",
                )?
                .execute(params![path_uuid, name, destination_owned, now])?;
                Ok(conn.last_insert_rowid())
            })
            .await?;

        let uploaded = self.upload_all(client, local_files).await?;

        let mut rows = Vec::with_capacity(uploaded.len());
        for state in uploaded {
            let target_path = target_path_for(&state, root, destination)?;
            let uuid = state.uuid.clone().ok_or_else(|| {
                Error::Persistence(format!("uploaded file {:?} has no remote uuid", state.path))
            })?;
            rows.push((uuid, target_path, i64::from(state.mode)));
        }

        self.with_conn_mut(move |conn| {
            let tx = conn.transaction()?;
            for (uuid, target_path, mode) in &rows {
                tx.execute(
                    "INSERT INTO directory_state_file (state_id, uuid, target_path, target_mode)
           VALUES (?1, ?2, ?3, ?4)",
                    params![state_id, uuid, target_path, mode],
                )?;
            }
            tx.commit()
        })
        .await?;

        Ok(state_id)
    }

    /// Materialize a directory state for `(path, destination, excludes)`,
    /// uploading whatever the remote is missing. The state id is stable
    /// across calls for the same triple.
    pub async fn sync_directory(
        &self,
        client: &Client,
        path: &Path,
        destination: &str,
        excludes: &[String],
        name: Option<&str>,
    ) -> Result<i64> {
        if !path.is_absolute() {
            return Err(Error::InvalidArgument(format!(
                "source must be an absolute path, got: {}",
                path.display()
            )));
        }
        let path = tokio::fs::canonicalize(path).await.map_err(|e| {
            Error::InvalidArgument(format!("source path {} is not usable: {e}", path.display()))
        })?;

        let destination = destination.trim_end_matches('/').to_owned();
        let excludes: BTreeSet<String> = excludes.iter().cloned().collect();

        // The state identity is derived from the path, the destination and
        // the sorted exclude set: different excludes mean a different state.
        let path_url = format!(
            "file://{}?dest={}&{}",
            path.display(),
            destination,
            excludes.iter().join("&"),
        );
        let path_uuid = Uuid::new_v5(&Uuid::NAMESPACE_URL, path_url.as_bytes()).to_string();

        let local_files = {
            let path = path.clone();
            let excludes = excludes.clone();
            tokio::task::spawn_blocking(move || Self::traverse_directory_files(&path, &excludes))
                .await
                .map_err(join_error)??
        };

        let state_id: Option<i64> = {
            let path_uuid = path_uuid.clone();
            self.with_conn(move |conn| {
                conn.prepare_cached("SELECT id FROM directory_state WHERE uuid = ?1")?
                    .query_row(params![path_uuid], |row| row.get(0))
                    .optional()
            })
            .await?
        };

        match state_id {
            Some(state_id) => {
                let mut synced_files = self.get_synced_directory_files(state_id).await?;

                if self.needs_revalidation(state_id).await? {
                    self.revalidate_files(client, state_id, &synced_files, &path, &destination)
                        .await?;
                    synced_files = self.get_synced_directory_files(state_id).await?;
                }

                if local_files == synced_files {
                    return Ok(state_id);
                }

                self.update_synced_directory(
                    client,
                    state_id,
                    local_files,
                    synced_files,
                    &path,
                    &destination,
                )
                .await
            }
            None => {
                self.sync_new_directory(client, local_files, &path_uuid, &path, &destination, name)
                    .await
            }
        }
    }

    pub async fn get_directory_state(&self, state_id: i64) -> Result<Option<DirectoryState>> {
        self.with_conn(move |conn| {
            conn.prepare_cached(
                "SELECT id, uuid, name, destination, updated_at FROM directory_state WHERE id = ?1",
            )?
            .query_row(params![state_id], |row| {
                Ok(DirectoryState {
                    id: row.get(0)?,
                    uuid: row.get(1)?,
                    name: row.get(2)?,
                    destination: row.get(3)?,
                    updated_at: row.get(4)?,
                })
            })
            .optional()
        })
        .await
    }

    pub async fn get_directory_state_files(
        &self,
        state_id: i64,
    ) -> Result<Vec<DirectoryStateFile>> {
        self.with_conn(move |conn| {
            conn.prepare_cached(
                "SELECT uuid, target_path, target_mode
         FROM directory_state_file WHERE state_id = ?1",
            )?
            .query_map(params![state_id], |row| {
                Ok(DirectoryStateFile {
                    file_uuid: row.get(0)?,
                    target_path: row.get(1)?,
                    target_mode: row.get::<_, i64>(2)? as u32,
                })
            })?
            .collect()
        })
        .await
    }

    /// Delete records older than the retention cutoff. Unlike the general
    /// cache this has no background timer; the broker calls it at startup.
    pub async fn retain(&self) -> Result<()> {
        if self.retention_days <= 0 {
            return Ok(());
        }
        let cutoff = Utc::now() - chrono::Duration::days(self.retention_days);
        self.with_conn(move |conn| {
            conn.execute("DELETE FROM files WHERE created_at < ?1", params![cutoff])?;
            conn.execute(
                "DELETE FROM directory_state WHERE created_at < ?1",
                params![cutoff],
            )?;
            Ok(())
        })
        .await
    }
}

fn target_path_for(state: &FileState, root: &Path, destination: &str) -> Result<String> {
    let relative = state.path.strip_prefix(root).map_err(|_| {
        Error::Persistence(format!(
            "file {:?} is not under the sync root {root:?}",
            state.path
        ))
    })?;
    Ok(format!("{destination}/{}", relative.display()))
}

/// Translate a shell-style exclude pattern (`*`, `?`) into an anchored,
/// case-insensitive regex.
fn compile_exclude(pattern: &str) -> Result<Regex> {
    let mut translated = String::from("(?i)^");
    for ch in pattern.chars() {
        match ch {
            '*' => translated.push_str(".*"),
            '?' => translated.push('.'),
            other => translated.push_str(&regex::escape(&other.to_string())),
        }
    }
    Regex::new(&translated)
        .map_err(|e| Error::InvalidArgument(format!("invalid exclude pattern {pattern:?}: {e}")))
}

fn persistence(err: rusqlite::Error) -> Error {
    Error::Persistence(err.to_string())
}

fn join_error(err: tokio::task::JoinError) -> Error {
    Error::Persistence(format!("file cache worker task failed: {err}"))
}

#[cfg(test)]
mod tests;
