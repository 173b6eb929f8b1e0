// Copyright 2025 Vessel project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::collections::BTreeMap;
use std::fmt;

use base64::Engine;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Error;

/// Status vocabulary of the remote service. The strings on the wire are
/// exact and case-significant.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OperationStatus {
    Pending,
    Executing,
    Success,
    Failed,
    Cancelled,
}

impl OperationStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OperationStatus::Success | OperationStatus::Failed | OperationStatus::Cancelled
        )
    }
}

impl fmt::Display for OperationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            OperationStatus::Pending => "PENDING",
            OperationStatus::Executing => "EXECUTING",
            OperationStatus::Success => "SUCCESS",
            OperationStatus::Failed => "FAILED",
            OperationStatus::Cancelled => "CANCELLED",
        };
        f.write_str(s)
    }
}

#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    Instance,
    ImageImport,
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            OperationKind::Instance => "instance",
            OperationKind::ImageImport => "image_import",
        };
        f.write_str(s)
    }
}

/// An immutable filesystem snapshot, optionally aliased by a mutable tag.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Image {
    pub uuid: String,
    #[serde(default)]
    pub tag: Option<String>,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ImageListResponse {
    pub images: Vec<Image>,
}

/// Response to an upload or a lookup on `/files`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FileResponse {
    pub uuid: String,
    pub sha256: String,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct DirectoryEntry {
    pub path: String,
    #[serde(default)]
    pub size: Option<u64>,
    #[serde(default)]
    pub owner: Option<u32>,
    #[serde(default)]
    pub group: Option<u32>,
    #[serde(default)]
    pub mode: Option<u32>,
    #[serde(default)]
    pub mtime: Option<i64>,
    #[serde(default)]
    pub is_dir: bool,
    #[serde(default)]
    pub is_regular: bool,
    #[serde(default)]
    pub is_symlink: bool,
    #[serde(default)]
    pub is_socket: bool,
    #[serde(default)]
    pub is_fifo: bool,
    #[serde(default)]
    pub symlink_to: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DirectoryList {
    pub path: String,
    pub files: Vec<DirectoryEntry>,
}

/// A small in-band byte stream (stdin, stdout, stderr). Binary payloads are
/// carried base64-encoded; text stays as-is.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Stream {
    pub value: String,
    #[serde(default = "Stream::default_encoding")]
    pub encoding: String,
    #[serde(default)]
    pub truncated: bool,
}

impl Stream {
    fn default_encoding() -> String {
        "ascii".to_owned()
    }

    pub fn empty() -> Stream {
        Stream {
            value: String::new(),
            encoding: Self::default_encoding(),
            truncated: false,
        }
    }

    pub fn from_bytes(bytes: &[u8]) -> Stream {
        Stream {
            value: base64::engine::general_purpose::STANDARD.encode(bytes),
            encoding: "base64".to_owned(),
            truncated: false,
        }
    }

    pub fn decoded(&self) -> Result<Vec<u8>, Error> {
        if self.encoding == "base64" {
            base64::engine::general_purpose::STANDARD
                .decode(&self.value)
                .map_err(|e| Error::Protocol(format!("invalid base64 stream: {e}")))
        } else {
            Ok(self.value.clone().into_bytes())
        }
    }
}

/// A file to place into an instance before the command runs. `mode` is an
/// octal string such as "0o755", matching the service's wire format.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct InstanceFileSpec {
    pub uuid: String,
    pub mode: String,
}

/// Spawn metadata for `POST /instances`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct InstanceSpec {
    pub command: String,
    pub image: String,
    pub shell: bool,
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub cwd: String,
    pub timeout: u64,
    pub hostname: String,
    pub disposable: bool,
    pub stdin: Stream,
    pub truncate_output_at: u64,
    pub files: BTreeMap<String, InstanceFileSpec>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ImageCredentials {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ImageRegistry {
    pub url: String,
    #[serde(default)]
    pub credentials: ImageCredentials,
}

/// Body of `POST /images/import`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ImportImageRequest {
    pub registry: ImageRegistry,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tag: Option<String>,
    pub timeout: u64,
}

/// `202 Accepted` body for instance spawns and image imports. Some server
/// builds omit the uuid and only send a `Location` header.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct SpawnResponse {
    #[serde(default)]
    pub uuid: Option<String>,
}

impl SpawnResponse {
    /// The operation id carried in the body, treating an empty string the
    /// same as an absent field.
    pub fn operation_id(&self) -> Option<&str> {
        self.uuid.as_deref().filter(|id| !id.is_empty())
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct InstanceState {
    #[serde(default)]
    pub exit_code: Option<i64>,
    #[serde(default)]
    pub pid: Option<i64>,
    #[serde(default)]
    pub timed_out: Option<bool>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct InstanceResources {
    #[serde(default)]
    pub elapsed_time: Option<f64>,
}

/// The run outcome nested under an instance operation's metadata.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct InstanceResult {
    #[serde(default)]
    pub state: Option<InstanceState>,
    #[serde(default)]
    pub stdout: Option<Stream>,
    #[serde(default)]
    pub stderr: Option<Stream>,
    #[serde(default)]
    pub resources: Option<InstanceResources>,
}

/// Submission metadata echoed back by the service. Instance and import
/// operations populate disjoint subsets, so every field is optional and
/// unknown shapes still decode.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct OperationMetadata {
    #[serde(default)]
    pub command: Option<String>,
    #[serde(default)]
    pub image: Option<String>,
    #[serde(default)]
    pub registry: Option<ImageRegistry>,
    #[serde(default)]
    pub tag: Option<String>,
    #[serde(default)]
    pub timeout: Option<u64>,
    #[serde(default)]
    pub result: Option<InstanceResult>,
}

/// The image a terminal operation produced, if any.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct OperationResult {
    #[serde(default)]
    pub image: Option<String>,
    #[serde(default)]
    pub tag: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct OperationResponse {
    pub uuid: String,
    pub kind: OperationKind,
    pub status: OperationStatus,
    #[serde(default)]
    pub metadata: Option<OperationMetadata>,
    #[serde(default)]
    pub result: Option<OperationResult>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
}

impl OperationResponse {
    pub fn result_image(&self) -> Option<&str> {
        self.result.as_ref().and_then(|r| r.image.as_deref())
    }

    pub fn result_tag(&self) -> Option<&str> {
        self.result.as_ref().and_then(|r| r.tag.as_deref())
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct OperationSummary {
    pub uuid: String,
    pub kind: OperationKind,
    pub status: OperationStatus,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct OperationListResponse {
    pub operations: Vec<OperationSummary>,
}
