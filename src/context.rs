// Copyright 2025 Vessel project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::path::{Path, PathBuf};

use cache::Cache;
use filesync::FileCache;
use protocol::Result;
use remote::{Client, RemoteOptions};

/// Construction parameters for a [`BrokerContext`].
#[derive(Clone, Debug)]
pub struct BrokerOptions {
    pub remote: RemoteOptions,
    pub cache_db: PathBuf,
    pub files_db: PathBuf,
    /// Cached rows older than this many days are pruned; `<= 0` disables.
    pub retention_days: i64,
}

impl BrokerOptions {
    pub fn new(
        url: impl Into<String>,
        token: impl Into<String>,
        state_dir: &Path,
    ) -> BrokerOptions {
        BrokerOptions {
            remote: RemoteOptions::new(url, token),
            cache_db: state_dir.join("cache.db"),
            files_db: state_dir.join("filesync.db"),
            retention_days: 60,
        }
    }
}

///
/// Owns every shared resource of the broker: the remote client (and its
/// HTTP connection pool), the general cache and the file cache. Tool
/// functions receive it by reference instead of reaching into process-wide
/// slots, and `close` tears the pieces down in dependency order.
///
pub struct BrokerContext {
    client: Client,
    cache: Cache,
    file_cache: FileCache,
}

impl BrokerContext {
    pub async fn new(options: BrokerOptions) -> Result<BrokerContext> {
        let cache = Cache::open(&options.cache_db, options.retention_days).await?;
        let client = Client::new(options.remote, cache.clone())?;
        let file_cache = FileCache::open(&options.files_db, options.retention_days).await?;
        // The file cache has no background sweep; prune it once at startup.
        file_cache.retain().await?;

        Ok(BrokerContext {
            client,
            cache,
            file_cache,
        })
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    pub fn cache(&self) -> &Cache {
        &self.cache
    }

    pub fn file_cache(&self) -> &FileCache {
        &self.file_cache
    }

    /// Shut down in order: pollers and tracked remote operations first,
    /// then the caches and their background tasks.
    pub async fn close(&self) {
        self.client.close().await;
        self.cache.close().await;
    }
}
