// Copyright 2025 Vessel project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use futures::future::{self, FutureExt};
use serde::Serialize;

use protocol::{
    Error, OperationKind, OperationResponse, OperationStatus, OperationSummary, Result,
};
use remote::OperationFilters;

use crate::context::BrokerContext;

/// A point-in-time snapshot of an operation, without blocking on
/// completion.
pub async fn get_operation(ctx: &BrokerContext, operation_id: &str) -> Result<OperationResponse> {
    ctx.client().get_operation(operation_id).await
}

/// List operations, optionally filtered by status, kind or age.
pub async fn list_operations(
    ctx: &BrokerContext,
    filters: OperationFilters,
) -> Result<Vec<OperationSummary>> {
    ctx.client().list_operations(filters).await
}

#[derive(Clone, Debug, Serialize)]
pub struct CancelOperationOutput {
    pub cancelled: bool,
    pub operation_id: String,
}

/// Cancel a running operation.
pub async fn cancel_operation(
    ctx: &BrokerContext,
    operation_id: &str,
) -> Result<CancelOperationOutput> {
    let status = ctx.client().cancel_operation(operation_id).await?;
    Ok(CancelOperationOutput {
        cancelled: status == OperationStatus::Cancelled,
        operation_id: operation_id.to_owned(),
    })
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum WaitMode {
    /// Wait for every operation to finish.
    All,
    /// Return after the first completion and cancel the rest.
    Any,
}

#[derive(Clone, Debug, Serialize)]
pub struct WaitOperationsOutput {
    pub results: BTreeMap<String, OperationResponse>,
    pub completed: Vec<String>,
    pub cancelled: Vec<String>,
    pub timed_out: bool,
}

/// Wait for multiple operations, each bounded by `timeout`.
///
/// Failures (including timeouts) surface as synthetic FAILED responses so
/// one bad operation doesn't hide the others' results. In `Any` mode the
/// losers are cancelled best-effort.
pub async fn wait_operations(
    ctx: &BrokerContext,
    operation_ids: &[String],
    timeout: Duration,
    mode: WaitMode,
) -> Result<WaitOperationsOutput> {
    let unique_ids: BTreeSet<String> = operation_ids.iter().cloned().collect();

    let mut results: BTreeMap<String, OperationResponse> = BTreeMap::new();
    let mut timed_out = false;

    let record =
        |results: &mut BTreeMap<String, OperationResponse>,
         timed_out: &mut bool,
         id: String,
         outcome: Result<OperationResponse>| {
            match outcome {
                Ok(response) => {
                    results.insert(id, response);
                }
                Err(err) => {
                    if matches!(err, Error::Timeout { .. }) {
                        *timed_out = true;
                    }
                    results.insert(
                        id.clone(),
                        OperationResponse {
                            uuid: id,
                            kind: OperationKind::Instance,
                            status: OperationStatus::Failed,
                            metadata: None,
                            result: None,
                            error: Some(err.to_string()),
                            created_at: None,
                        },
                    );
                }
            }
        };

    match mode {
        WaitMode::All => {
            let waits = unique_ids.iter().map(|id| {
                let id = id.clone();
                async move {
                    let outcome = ctx.client().wait_for_operation(&id, Some(timeout)).await;
                    (id, outcome)
                }
            });
            for (id, outcome) in future::join_all(waits).await {
                record(&mut results, &mut timed_out, id, outcome);
            }
        }
        WaitMode::Any => {
            let waits = unique_ids
                .iter()
                .map(|id| {
                    let id = id.clone();
                    async move {
                        let outcome = ctx.client().wait_for_operation(&id, Some(timeout)).await;
                        (id, outcome)
                    }
                    .boxed()
                })
                .collect::<Vec<_>>();

            if !waits.is_empty() {
                let ((id, outcome), _, rest) = future::select_all(waits).await;
                drop(rest);
                record(&mut results, &mut timed_out, id, outcome);

                // Cancel the operations we abandoned.
                let losers = unique_ids.iter().filter(|id| !results.contains_key(*id));
                future::join_all(losers.map(|id| {
                    let id = id.clone();
                    async move {
                        if let Err(e) = ctx.client().cancel_operation(&id).await {
                            log::debug!("Failed to cancel abandoned operation {id}: {e}");
                        }
                    }
                }))
                .await;
            }
        }
    }

    let completed: Vec<String> = results.keys().cloned().collect();
    let cancelled: Vec<String> = operation_ids
        .iter()
        .filter(|id| !results.contains_key(*id))
        .cloned()
        .collect();

    Ok(WaitOperationsOutput {
        results,
        completed,
        cancelled,
        timed_out,
    })
}
