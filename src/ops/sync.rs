// Copyright 2025 Vessel project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::path::Path;

use protocol::Result;

use crate::context::BrokerContext;

/// Sync a local directory to the remote service for later injection into
/// instances. Only changed blobs are uploaded; the returned directory state
/// id is stable for the same `(source, destination, excludes)` triple and
/// is what `run` takes to mount the files.
pub async fn rsync(
    ctx: &BrokerContext,
    source: &Path,
    destination: &str,
    excludes: &[String],
) -> Result<i64> {
    ctx.file_cache()
        .sync_directory(ctx.client(), source, destination, excludes, None)
        .await
}
