// Copyright 2025 Vessel project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use base64::Engine;
use serde::Serialize;
use serde_json::Value as JsonValue;

use protocol::{Image, Result};
use remote::ImageFilters;

use crate::context::BrokerContext;

/// List available images, optionally filtered.
pub async fn list_images(ctx: &BrokerContext, filters: ImageFilters) -> Result<Vec<Image>> {
    ctx.client().list_images(filters).await
}

/// Look an image up by UUID or `tag:<name>`.
pub async fn get_image(ctx: &BrokerContext, image: &str) -> Result<Image> {
    match image.strip_prefix("tag:") {
        Some(tag) => ctx.client().get_image_by_tag(tag).await,
        None => ctx.client().get_image(image).await,
    }
}

/// Set or (with `tag: None`) remove an image's tag.
pub async fn set_tag(ctx: &BrokerContext, image_uuid: &str, tag: Option<&str>) -> Result<Image> {
    match tag {
        Some(tag) => ctx.client().tag_image(image_uuid, tag).await,
        None => ctx.client().untag_image(image_uuid).await,
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct FileEntry {
    pub name: String,
    pub path: String,
    #[serde(rename = "type")]
    pub entry_type: String,
    pub size: u64,
    pub mode: Option<String>,
    /// Target, for symlinks.
    pub target: Option<String>,
}

#[derive(Clone, Debug, Serialize)]
pub struct ListFilesOutput {
    pub path: String,
    pub count: usize,
    pub files: Vec<FileEntry>,
}

/// List files in an image directory without spawning an instance.
pub async fn list_files(ctx: &BrokerContext, image: &str, path: &str) -> Result<ListFilesOutput> {
    let image_uuid = ctx.client().resolve_image(image).await?;

    let mut path = if path.starts_with('/') {
        path.to_owned()
    } else {
        format!("/{path}")
    };
    if path == "/." {
        path = "/".to_owned();
    }

    let listing = ctx.client().list_directory(&image_uuid, &path).await?;

    let files = listing
        .files
        .iter()
        .map(|f| {
            let entry_type = if f.is_symlink {
                "symlink"
            } else if f.is_dir {
                "directory"
            } else {
                "file"
            };
            FileEntry {
                name: f
                    .path
                    .rsplit('/')
                    .next()
                    .unwrap_or(f.path.as_str())
                    .to_owned(),
                path: f.path.clone(),
                entry_type: entry_type.to_owned(),
                size: f.size.unwrap_or(0),
                mode: f.mode.map(|mode| format!("0o{mode:o}")),
                target: if f.is_symlink {
                    f.symlink_to.clone().filter(|t| !t.is_empty())
                } else {
                    None
                },
            }
        })
        .collect::<Vec<_>>();

    Ok(ListFilesOutput {
        path: listing.path,
        count: files.len(),
        files,
    })
}

#[derive(Clone, Debug, Serialize)]
pub struct ReadFileOutput {
    pub path: String,
    pub content: String,
    pub encoding: String,
    pub bytes_size: usize,
}

/// Read a file out of an image snapshot. Text comes back as UTF-8; binary
/// content is base64-encoded.
pub async fn read_file(ctx: &BrokerContext, image: &str, path: &str) -> Result<ReadFileOutput> {
    let image_uuid = ctx.client().resolve_image(image).await?;
    let content = ctx.client().read_file(&image_uuid, path).await?;

    let (content_str, encoding) = match String::from_utf8(content.clone()) {
        Ok(text) => (text, "utf-8"),
        Err(_) => (
            base64::engine::general_purpose::STANDARD.encode(&content),
            "base64",
        ),
    };

    Ok(ReadFileOutput {
        path: path.to_owned(),
        content: content_str,
        encoding: encoding.to_owned(),
        bytes_size: content.len(),
    })
}

/// The lineage neighborhood of an image: its parent chain, its transitive
/// children, and whatever metadata the broker stored when the image was
/// produced.
#[derive(Clone, Debug, Serialize)]
pub struct LineageReport {
    pub image: String,
    pub parent: Option<String>,
    pub children: Vec<String>,
    pub ancestors: Vec<String>,
    pub root: Option<String>,
    pub depth: usize,
    pub is_known: bool,
    pub data: Option<JsonValue>,
}

/// Assemble the lineage report for an image from the general cache.
pub async fn image_lineage(ctx: &BrokerContext, image: &str) -> Result<LineageReport> {
    let entry = ctx.cache().get("image", image, None).await?;
    let ancestors = ctx.cache().get_ancestors("image", image, None).await?;
    let children = ctx.cache().get_children("image", image, None).await?;

    // The root is the last ancestor, or the image itself if it has none.
    let root = ancestors
        .last()
        .map(|a| a.key.clone())
        .or_else(|| entry.as_ref().map(|e| e.key.clone()));

    Ok(LineageReport {
        image: image.to_owned(),
        parent: entry
            .as_ref()
            .and_then(|e| e.data_str("parent_image"))
            .map(str::to_owned),
        children: children.into_iter().map(|c| c.key).collect(),
        depth: ancestors.len(),
        ancestors: ancestors.into_iter().map(|a| a.key).collect(),
        root,
        is_known: entry.is_some(),
        data: entry.map(|e| e.data),
    })
}
