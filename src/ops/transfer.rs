// Copyright 2025 Vessel project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::path::{Path, PathBuf};

use base64::Engine;
use bytes::Bytes;
use serde::Serialize;

use protocol::{Error, FileResponse, Result};

use crate::context::BrokerContext;
use crate::downloads::write_stream_to_file;

/// Content for a single-file upload.
#[derive(Clone, Debug)]
pub enum UploadSource<'a> {
    /// Read (and hash) a local file.
    Path(&'a Path),
    /// Literal text content.
    Text(&'a str),
    /// Base64-encoded binary content.
    Base64(&'a str),
}

/// Upload one file and return its remote identity, for passing to `run`'s
/// file injections. Directory trees are better served by `rsync`, which
/// caches per-file state.
pub async fn upload(ctx: &BrokerContext, source: UploadSource<'_>) -> Result<FileResponse> {
    match source {
        UploadSource::Path(path) => {
            if !path.is_absolute() {
                return Err(Error::InvalidArgument(format!(
                    "upload path must be absolute, got: {}",
                    path.display()
                )));
            }
            ctx.client().upload_path(path).await
        }
        UploadSource::Text(content) => {
            ctx.client()
                .upload_file(Bytes::from(content.as_bytes().to_vec()))
                .await
        }
        UploadSource::Base64(content) => {
            let decoded = base64::engine::general_purpose::STANDARD
                .decode(content)
                .map_err(|e| Error::InvalidArgument(format!("invalid base64 content: {e}")))?;
            ctx.client().upload_file(Bytes::from(decoded)).await
        }
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct DownloadOutput {
    pub success: bool,
    pub image: String,
    pub path: String,
    pub destination: PathBuf,
    pub size: u64,
    pub executable: bool,
}

/// Download a file out of an image snapshot to the local filesystem,
/// atomically: the destination either keeps its previous content or holds
/// the complete download.
pub async fn download(
    ctx: &BrokerContext,
    image: &str,
    path: &str,
    destination: &Path,
    executable: bool,
) -> Result<DownloadOutput> {
    let image_uuid = ctx.client().resolve_image(image).await?;

    if !destination.is_absolute() {
        return Err(Error::InvalidArgument(format!(
            "destination must be an absolute path, got: {}",
            destination.display()
        )));
    }
    if let Some(parent) = destination.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }

    let stream = ctx.client().stream_file(&image_uuid, path).await?;
    let size = write_stream_to_file(destination, stream).await?;

    if executable {
        use std::os::unix::fs::PermissionsExt;
        tokio::fs::set_permissions(destination, std::fs::Permissions::from_mode(0o755)).await?;
    }

    Ok(DownloadOutput {
        success: true,
        image: image_uuid,
        path: path.to_owned(),
        destination: destination.to_owned(),
        size,
        executable,
    })
}
