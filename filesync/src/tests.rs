// Copyright 2025 Vessel project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::collections::{BTreeSet, HashMap};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::body::Bytes;
use axum::http::StatusCode;
use axum::routing::head;
use axum::{Json, Router};
use chrono::Utc;
use rusqlite::params;
use serde_json::json;
use tempfile::TempDir;

use cache::Cache;
use protocol::Error;
use remote::{Client, RemoteOptions};

use crate::{FileCache, FileState};

struct StubFiles {
    posts: AtomicU32,
    lookups: AtomicU32,
    heads: AtomicU32,
    /// Status returned for HEAD existence probes: 200 or 404.
    head_status: AtomicU32,
    upload_counter: AtomicU32,
}

impl StubFiles {
    fn new() -> StubFiles {
        StubFiles {
            posts: AtomicU32::new(0),
            lookups: AtomicU32::new(0),
            heads: AtomicU32::new(0),
            head_status: AtomicU32::new(200),
            upload_counter: AtomicU32::new(0),
        }
    }
}

fn files_router(state: Arc<StubFiles>) -> Router {
    let head_state = state.clone();
    let lookup_state = state.clone();
    let post_state = state;

    Router::new().route(
        "/v1/files",
        head(move || {
            let state = head_state.clone();
            async move {
                state.heads.fetch_add(1, Ordering::SeqCst);
                StatusCode::from_u16(state.head_status.load(Ordering::SeqCst) as u16).unwrap()
            }
        })
        .get(move || {
            let state = lookup_state.clone();
            async move {
                state.lookups.fetch_add(1, Ordering::SeqCst);
                (StatusCode::NOT_FOUND, Json(json!({"error": "not found"})))
            }
        })
        .post(move |body: Bytes| {
            let state = post_state.clone();
            async move {
                state.posts.fetch_add(1, Ordering::SeqCst);
                let n = state.upload_counter.fetch_add(1, Ordering::SeqCst);
                let digest = hashing::Digest::of_bytes(&body);
                Json(json!({
                    "uuid": format!("file-{n}"),
                    "sha256": digest.hash.to_hex(),
                }))
            }
        }),
    )
}

fn serve(router: Router) -> SocketAddr {
    let bind_addr = "127.0.0.1:0".parse::<SocketAddr>().unwrap();
    let listener = std::net::TcpListener::bind(bind_addr).unwrap();
    listener.set_nonblocking(true).unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        axum_server::from_tcp(listener)
            .serve(router.into_make_service())
            .await
            .unwrap();
    });

    addr
}

async fn test_env(dir: &TempDir) -> (Client, Cache, FileCache, Arc<StubFiles>) {
    let stub = Arc::new(StubFiles::new());
    let addr = serve(files_router(stub.clone()));

    let cache = Cache::open(&dir.path().join("cache.db"), 120)
        .await
        .unwrap();
    let mut options = RemoteOptions::new(format!("http://{addr}"), "test-token");
    options.retry_time = Duration::from_millis(10);
    let client = Client::new(options, cache.clone()).unwrap();
    let file_cache = FileCache::open(&dir.path().join("filesync.db"), 120)
        .await
        .unwrap();

    (client, cache, file_cache, stub)
}

fn write_tree(root: &Path, files: &[(&str, &str)]) {
    for (relative, content) in files {
        let path = root.join(relative);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, content).unwrap();
    }
}

async fn state_file_map(file_cache: &FileCache, state_id: i64) -> HashMap<String, String> {
    file_cache
        .get_directory_state_files(state_id)
        .await
        .unwrap()
        .into_iter()
        .map(|f| (f.target_path, f.file_uuid))
        .collect()
}

async fn backdate_state(file_cache: &FileCache, state_id: i64, hours: i64) {
    let at = Utc::now() - chrono::Duration::hours(hours);
    file_cache
        .with_conn(move |conn| {
            conn.execute(
                "UPDATE directory_state SET updated_at = ?1 WHERE id = ?2",
                params![at, state_id],
            )
            .map(|_| ())
        })
        .await
        .unwrap();
}

#[tokio::test]
async fn repeated_sync_is_idempotent() {
    let dir = TempDir::new().unwrap();
    let (client, cache, file_cache, stub) = test_env(&dir).await;
    let project = dir.path().join("proj");
    write_tree(
        &project,
        &[("a.txt", "alpha"), ("b.txt", "beta"), ("sub/c.txt", "gamma")],
    );

    let first = file_cache
        .sync_directory(&client, &project, "/app", &[], None)
        .await
        .unwrap();
    assert_eq!(stub.posts.load(Ordering::SeqCst), 3);

    let second = file_cache
        .sync_directory(&client, &project, "/app", &[], None)
        .await
        .unwrap();
    assert_eq!(second, first);
    // Nothing changed locally, so the second sync uploads nothing.
    assert_eq!(stub.posts.load(Ordering::SeqCst), 3);

    client.close().await;
    cache.close().await;
}

#[tokio::test]
async fn different_excludes_yield_different_states() {
    let dir = TempDir::new().unwrap();
    let (client, cache, file_cache, _stub) = test_env(&dir).await;
    let project = dir.path().join("proj");
    write_tree(
        &project,
        &[("main.py", "print()"), ("cached.pyc", "\x00"), ("sub/util.py", "pass")],
    );

    let all = file_cache
        .sync_directory(&client, &project, "/app", &[], None)
        .await
        .unwrap();
    let filtered = file_cache
        .sync_directory(&client, &project, "/app", &["*.pyc".to_owned()], None)
        .await
        .unwrap();
    assert_ne!(all, filtered);

    let files = state_file_map(&file_cache, filtered).await;
    assert_eq!(files.len(), 2);
    assert!(files.contains_key("/app/main.py"));
    assert!(files.contains_key("/app/sub/util.py"));
    assert!(!files.keys().any(|path| path.ends_with(".pyc")));

    client.close().await;
    cache.close().await;
}

#[tokio::test]
async fn adding_a_file_preserves_existing_uuids() {
    let dir = TempDir::new().unwrap();
    let (client, cache, file_cache, stub) = test_env(&dir).await;
    let project = dir.path().join("proj");
    write_tree(&project, &[("a.txt", "alpha"), ("b.txt", "beta")]);

    let state_id = file_cache
        .sync_directory(&client, &project, "/app", &[], None)
        .await
        .unwrap();
    let before = state_file_map(&file_cache, state_id).await;
    assert_eq!(before.len(), 2);
    assert_eq!(stub.posts.load(Ordering::SeqCst), 2);

    write_tree(&project, &[("c.txt", "gamma")]);
    let same_id = file_cache
        .sync_directory(&client, &project, "/app", &[], None)
        .await
        .unwrap();
    assert_eq!(same_id, state_id);
    assert_eq!(stub.posts.load(Ordering::SeqCst), 3);

    let after = state_file_map(&file_cache, state_id).await;
    assert_eq!(after.len(), 3);
    // Previously-synced files keep their original remote uuids.
    for (target_path, uuid) in &before {
        assert_eq!(after.get(target_path), Some(uuid));
    }
    assert!(after.contains_key("/app/c.txt"));

    client.close().await;
    cache.close().await;
}

#[tokio::test]
async fn modified_file_is_reuploaded() {
    let dir = TempDir::new().unwrap();
    let (client, cache, file_cache, stub) = test_env(&dir).await;
    let project = dir.path().join("proj");
    write_tree(&project, &[("a.txt", "alpha"), ("b.txt", "beta")]);

    let state_id = file_cache
        .sync_directory(&client, &project, "/app", &[], None)
        .await
        .unwrap();
    let before = state_file_map(&file_cache, state_id).await;

    write_tree(&project, &[("b.txt", "beta but modified")]);
    file_cache
        .sync_directory(&client, &project, "/app", &[], None)
        .await
        .unwrap();
    assert_eq!(stub.posts.load(Ordering::SeqCst), 3);

    let after = state_file_map(&file_cache, state_id).await;
    assert_eq!(after.get("/app/a.txt"), before.get("/app/a.txt"));
    assert_ne!(after.get("/app/b.txt"), before.get("/app/b.txt"));

    client.close().await;
    cache.close().await;
}

#[tokio::test]
async fn revalidation_reuploads_evicted_blobs() {
    let dir = TempDir::new().unwrap();
    let (client, cache, file_cache, stub) = test_env(&dir).await;
    let project = dir.path().join("proj");
    write_tree(
        &project,
        &[("a.txt", "alpha"), ("b.txt", "beta"), ("sub/c.txt", "gamma")],
    );

    let state_id = file_cache
        .sync_directory(&client, &project, "/app", &[], None)
        .await
        .unwrap();
    let before = state_file_map(&file_cache, state_id).await;
    assert_eq!(stub.posts.load(Ordering::SeqCst), 3);

    // A day later the server has evicted everything.
    backdate_state(&file_cache, state_id, 25).await;
    stub.head_status.store(404, Ordering::SeqCst);

    let same_id = file_cache
        .sync_directory(&client, &project, "/app", &[], None)
        .await
        .unwrap();
    assert_eq!(same_id, state_id);
    assert_eq!(stub.heads.load(Ordering::SeqCst), 3);
    // Each file was re-uploaded, which is only possible if the stale
    // `file_by_hash` entries were invalidated before the re-upload.
    assert_eq!(stub.posts.load(Ordering::SeqCst), 6);

    let after = state_file_map(&file_cache, state_id).await;
    assert_eq!(after.len(), 3);
    for (target_path, uuid) in &before {
        assert_ne!(after.get(target_path), Some(uuid));
        // The eviction also dropped the per-uuid existence marker.
        assert!(cache
            .get("file_exists_by_uuid", uuid, None)
            .await
            .unwrap()
            .is_none());
    }

    client.close().await;
    cache.close().await;
}

#[tokio::test]
async fn revalidation_preserves_confirmed_blobs() {
    let dir = TempDir::new().unwrap();
    let (client, cache, file_cache, stub) = test_env(&dir).await;
    let project = dir.path().join("proj");
    write_tree(&project, &[("a.txt", "alpha"), ("b.txt", "beta")]);

    let state_id = file_cache
        .sync_directory(&client, &project, "/app", &[], None)
        .await
        .unwrap();
    let before = state_file_map(&file_cache, state_id).await;

    backdate_state(&file_cache, state_id, 25).await;

    file_cache
        .sync_directory(&client, &project, "/app", &[], None)
        .await
        .unwrap();
    assert_eq!(stub.heads.load(Ordering::SeqCst), 2);
    assert_eq!(stub.posts.load(Ordering::SeqCst), 2);
    assert_eq!(state_file_map(&file_cache, state_id).await, before);

    // The revalidation touched updated_at, so the next sync stays local.
    file_cache
        .sync_directory(&client, &project, "/app", &[], None)
        .await
        .unwrap();
    assert_eq!(stub.heads.load(Ordering::SeqCst), 2);

    client.close().await;
    cache.close().await;
}

#[tokio::test]
async fn relative_source_path_is_rejected() {
    let dir = TempDir::new().unwrap();
    let (client, cache, file_cache, _stub) = test_env(&dir).await;

    let err = file_cache
        .sync_directory(&client, Path::new("relative/dir"), "/app", &[], None)
        .await
        .unwrap_err();
    match err {
        Error::InvalidArgument(msg) => assert!(msg.contains("absolute")),
        other => panic!("expected InvalidArgument, got {other:?}"),
    }

    let err = file_cache
        .sync_directory(&client, &dir.path().join("does-not-exist"), "/app", &[], None)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::InvalidArgument(_)));

    client.close().await;
    cache.close().await;
}

#[test]
fn traversal_applies_globs_and_skips_symlinks() {
    let dir = TempDir::new().unwrap();
    let root = dir.path().join("proj");
    write_tree(
        &root,
        &[
            ("keep.txt", "keep"),
            ("skip.PYC", "skip"),
            ("data.pyc", "skip"),
            ("__pycache__/mod.pyc", "skip"),
            ("sub/keep.py", "keep"),
        ],
    );
    std::os::unix::fs::symlink(root.join("keep.txt"), root.join("link.txt")).unwrap();

    let excludes: BTreeSet<String> = ["*.pyc".to_owned(), "__pycache__".to_owned()]
        .into_iter()
        .collect();
    let files = FileCache::traverse_directory_files(&root, &excludes).unwrap();

    let mut paths: Vec<PathBuf> = files
        .iter()
        .map(|f| f.path.strip_prefix(&root).unwrap().to_owned())
        .collect();
    paths.sort();
    assert_eq!(
        paths,
        vec![PathBuf::from("keep.txt"), PathBuf::from("sub/keep.py")]
    );
}

#[test]
fn file_state_identity_ignores_remote_attachment() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("x.txt");
    std::fs::write(&path, "content").unwrap();

    let plain = FileState::from_path(&path).unwrap();
    let mut attached = plain.clone();
    attached.sha256 = Some("cafe".repeat(16));
    attached.uuid = Some("file-1".to_owned());

    assert_eq!(plain, attached);

    let local: std::collections::HashSet<FileState> = [plain].into_iter().collect();
    assert!(local.contains(&attached));
}

#[tokio::test]
async fn legacy_schema_gains_nullable_updated_at() {
    let dir = TempDir::new().unwrap();
    let db_path = dir.path().join("filesync.db");

    // A database from before the updated_at column existed.
    {
        let conn = rusqlite::Connection::open(&db_path).unwrap();
        conn.execute_batch(
            "CREATE TABLE files (
           id INTEGER PRIMARY KEY,
           path TEXT UNIQUE NOT NULL,
           symlink_to TEXT,
           size INTEGER NOT NULL,
           mtime INTEGER NOT NULL,
           ino INTEGER NOT NULL,
           mode INTEGER NOT NULL,
           sha256 TEXT NOT NULL,
           uuid TEXT NOT NULL,
           created_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP NOT NULL
         );
         CREATE TABLE directory_state (
           id INTEGER PRIMARY KEY,
           uuid TEXT NOT NULL,
           name TEXT,
           destination TEXT NOT NULL,
           created_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP NOT NULL
         );
         CREATE UNIQUE INDEX idx_directory_state_uuid ON directory_state(uuid);
         CREATE TABLE directory_state_file (
           id INTEGER PRIMARY KEY,
           state_id INTEGER NOT NULL REFERENCES directory_state(id) ON DELETE CASCADE,
           uuid TEXT NOT NULL,
           target_path TEXT NOT NULL,
           target_mode INTEGER NOT NULL,
           UNIQUE(state_id, target_path)
         );
         INSERT INTO directory_state (uuid, name, destination)
         VALUES ('legacy-uuid', NULL, '/app');",
        )
        .unwrap();
    }

    let file_cache = FileCache::open(&db_path, 120).await.unwrap();
    let state = file_cache.get_directory_state(1).await.unwrap().unwrap();
    assert_eq!(state.uuid, "legacy-uuid");
    // The migrated row has NULL updated_at, which means "revalidate now".
    assert_eq!(state.updated_at, None);
    assert!(file_cache.needs_revalidation(1).await.unwrap());
}

#[tokio::test]
async fn directory_state_accessors() {
    let dir = TempDir::new().unwrap();
    let (client, cache, file_cache, _stub) = test_env(&dir).await;
    let project = dir.path().join("proj");
    write_tree(&project, &[("bin/tool", "#!/bin/sh\n")]);

    // Trailing slash on the destination is normalized away.
    let state_id = file_cache
        .sync_directory(&client, &project, "/opt/tools/", &[], Some("tools"))
        .await
        .unwrap();

    let state = file_cache
        .get_directory_state(state_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(state.name.as_deref(), Some("tools"));
    assert_eq!(state.destination, "/opt/tools");
    assert!(state.updated_at.is_some());

    let files = file_cache.get_directory_state_files(state_id).await.unwrap();
    assert_eq!(files.len(), 1);
    assert_eq!(files[0].target_path, "/opt/tools/bin/tool");
    assert!(!files[0].file_uuid.is_empty());

    assert!(file_cache
        .get_directory_state(state_id + 100)
        .await
        .unwrap()
        .is_none());

    client.close().await;
    cache.close().await;
}

#[tokio::test]
async fn retain_deletes_old_states_and_files() {
    let dir = TempDir::new().unwrap();
    let (client, cache, file_cache, _stub) = test_env(&dir).await;
    let project = dir.path().join("proj");
    write_tree(&project, &[("a.txt", "alpha")]);

    let state_id = file_cache
        .sync_directory(&client, &project, "/app", &[], None)
        .await
        .unwrap();

    let ancient = Utc::now() - chrono::Duration::days(365);
    file_cache
        .with_conn(move |conn| {
            conn.execute(
                "UPDATE directory_state SET created_at = ?1",
                params![ancient],
            )?;
            conn.execute("UPDATE files SET created_at = ?1", params![ancient])
                .map(|_| ())
        })
        .await
        .unwrap();

    file_cache.retain().await.unwrap();

    assert!(file_cache
        .get_directory_state(state_id)
        .await
        .unwrap()
        .is_none());
    assert!(file_cache
        .get_directory_state_files(state_id)
        .await
        .unwrap()
        .is_empty());
    assert!(file_cache
        .get_synced_directory_files(state_id)
        .await
        .unwrap()
        .is_empty());

    client.close().await;
    cache.close().await;
}
