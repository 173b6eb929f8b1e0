// Copyright 2025 Vessel project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use serde_json::json;

use cache::Cache;
use protocol::{OperationKind, OperationResponse, OperationStatus, Result};

use crate::operations::OperationContext;

/// Record a parent/child lineage edge for a terminal operation.
///
/// Instance runs that produced a new image get an edge from their input
/// image; imports become parentless roots. A run whose result image equals
/// its input image was a no-op and leaves no trace.
pub(crate) async fn record(
    cache: &Cache,
    operation_id: &str,
    kind: OperationKind,
    op: &OperationResponse,
    context: &OperationContext,
) -> Result<()> {
    if op.status != OperationStatus::Success {
        return Ok(());
    }

    match kind {
        OperationKind::Instance => {
            let (Some(input_image), Some(result_image)) =
                (context.input_image.as_deref(), op.result_image())
            else {
                return Ok(());
            };
            if input_image == result_image {
                return Ok(());
            }

            let parent_id = cache
                .get("image", input_image, None)
                .await?
                .map(|entry| entry.id);
            cache
                .put(
                    "image",
                    result_image,
                    &json!({
                        "parent_image": input_image,
                        "operation_id": operation_id,
                        "command": context.command,
                    }),
                    parent_id,
                )
                .await?;
        }
        OperationKind::ImageImport => {
            let Some(result_image) = op.result_image() else {
                return Ok(());
            };
            cache
                .put(
                    "image",
                    result_image,
                    &json!({
                        "operation_id": operation_id,
                        "registry_url": context.registry_url,
                        "tag": op.result_tag(),
                        "is_import": true,
                    }),
                    None,
                )
                .await?;
        }
    }
    Ok(())
}
