// Copyright 2025 Vessel project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

//! The broker's operation vocabulary: the functions a protocol adapter
//! exposes to a coding agent. Each takes the [`BrokerContext`] by
//! reference and returns typed, serializable output.

mod images;
mod import;
mod operations;
mod registry;
mod run;
mod sync;
mod transfer;

pub use images::{
    get_image, image_lineage, list_files, list_images, read_file, set_tag, FileEntry,
    LineageReport, ListFilesOutput, ReadFileOutput,
};
pub use import::import_image;
pub use operations::{
    cancel_operation, get_operation, list_operations, wait_operations, CancelOperationOutput,
    WaitMode, WaitOperationsOutput,
};
pub use registry::{
    registry_auth, registry_token_obtain, RegistryAuthOutput, RegistryTokenObtainOutput,
};
pub use run::{run, RunOptions};
pub use sync::rsync;
pub use transfer::{download, upload, DownloadOutput, UploadSource};

use protocol::OperationResponse;
use serde::Serialize;

/// What a submission-style operation hands back: either the terminal
/// response (when the caller waited) or just the operation id to poll.
#[derive(Clone, Debug, Serialize)]
#[serde(untagged)]
pub enum OperationOutcome {
    Completed(Box<OperationResponse>),
    Submitted { operation_id: String },
}

impl OperationOutcome {
    pub fn operation_response(&self) -> Option<&OperationResponse> {
        match self {
            OperationOutcome::Completed(response) => Some(response),
            OperationOutcome::Submitted { .. } => None,
        }
    }
}
