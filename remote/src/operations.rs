// Copyright 2025 Vessel project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::collections::BTreeMap;
use std::time::Duration;

use reqwest::header::{HeaderMap, LOCATION};
use reqwest::Method;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use protocol::{
    Error, ImageCredentials, ImageRegistry, ImportImageRequest, InstanceFileSpec, InstanceSpec,
    OperationKind, OperationListResponse, OperationResponse, OperationStatus, OperationSummary,
    Result, SpawnResponse, Stream,
};

use crate::lineage;
use crate::{Client, RequestBody};

/// Broadcasts a poller's terminal result (or error) to any number of
/// waiters.
pub(crate) type ResultReceiver = watch::Receiver<Option<Result<OperationResponse>>>;

/// A tracked long-running operation: the background poller plus a channel
/// its terminal result is published on.
pub(crate) struct OperationHandle {
    #[allow(dead_code)]
    pub(crate) kind: OperationKind,
    pub(crate) join: JoinHandle<()>,
    pub(crate) result_rx: ResultReceiver,
}

/// Issues a best-effort remote cancel from a detached task if still armed
/// when dropped. A waiter arms one around its suspension, so any way of
/// abandoning the wait (a `max_wait` expiry, an outer timeout, losing a
/// select race) cancels the remote operation without tearing down the
/// shared poller or other waiters.
struct RemoteCancelGuard {
    client: Option<Client>,
    operation_id: String,
}

impl RemoteCancelGuard {
    fn new(client: Client, operation_id: &str) -> RemoteCancelGuard {
        RemoteCancelGuard {
            client: Some(client),
            operation_id: operation_id.to_owned(),
        }
    }

    /// The wait concluded on its own; no cancel should fire.
    fn disarm(&mut self) {
        self.client = None;
    }
}

impl Drop for RemoteCancelGuard {
    fn drop(&mut self) {
        let Some(client) = self.client.take() else {
            return;
        };
        let id = std::mem::take(&mut self.operation_id);
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                if let Err(e) = client.cancel_operation(&id).await {
                    log::debug!("Best-effort cancel of {id} failed: {e}");
                }
            });
        }
    }
}

/// Submission-time metadata, kept in memory until the poller records
/// lineage for the terminal operation.
#[derive(Clone, Debug, Default)]
pub(crate) struct OperationContext {
    pub(crate) input_image: Option<String>,
    pub(crate) command: Option<String>,
    pub(crate) registry_url: Option<String>,
    #[allow(dead_code)]
    pub(crate) tag: Option<String>,
}

/// Spawn metadata for a command run, with the service's defaults filled in.
#[derive(Clone, Debug)]
pub struct SpawnOptions {
    pub command: String,
    pub image: String,
    pub shell: bool,
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub cwd: String,
    pub timeout: u64,
    pub hostname: String,
    pub disposable: bool,
    pub stdin: Option<String>,
    pub files: BTreeMap<String, InstanceFileSpec>,
    pub truncate_output_at: u64,
}

impl SpawnOptions {
    pub fn new(command: impl Into<String>, image: impl Into<String>) -> SpawnOptions {
        SpawnOptions {
            command: command.into(),
            image: image.into(),
            shell: true,
            args: vec![],
            env: BTreeMap::new(),
            cwd: "/root".to_owned(),
            timeout: 30,
            hostname: "linuxkit".to_owned(),
            disposable: false,
            stdin: None,
            files: BTreeMap::new(),
            truncate_output_at: 1048576,
        }
    }
}

/// Query filters for `GET /operations`.
#[derive(Clone, Debug)]
pub struct OperationFilters {
    pub limit: u32,
    pub offset: u32,
    pub status: Option<OperationStatus>,
    pub kind: Option<OperationKind>,
    pub since: Option<String>,
    pub until: Option<String>,
}

impl Default for OperationFilters {
    fn default() -> OperationFilters {
        OperationFilters {
            limit: 100,
            offset: 0,
            status: None,
            kind: None,
            since: None,
            until: None,
        }
    }
}

fn operation_id_from(body: &SpawnResponse, headers: &HeaderMap) -> Option<String> {
    if let Some(id) = body.operation_id() {
        return Some(id.to_owned());
    }
    // Fall back to the Location header: ".../operations/{id}".
    headers
        .get(LOCATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|location| location.rsplit('/').next())
        .filter(|id| !id.is_empty())
        .map(str::to_owned)
}

impl Client {
    /// Submit an image import. Returns the operation id and starts a
    /// background poller for it.
    pub async fn import_image(
        &self,
        registry_url: &str,
        tag: Option<&str>,
        username: Option<&str>,
        password: Option<&str>,
        timeout: u64,
    ) -> Result<String> {
        let credentials = match (username, password) {
            (Some(username), Some(password)) => ImageCredentials {
                username: Some(username.to_owned()),
                password: Some(password.to_owned()),
            },
            _ => ImageCredentials::default(),
        };

        let request = ImportImageRequest {
            registry: ImageRegistry {
                url: registry_url.to_owned(),
                credentials,
            },
            tag: tag.map(str::to_owned),
            timeout,
        };

        let (body, headers): (SpawnResponse, HeaderMap) = self
            .request_with_headers(
                Method::POST,
                "/images/import",
                &[],
                RequestBody::Json(serde_json::to_value(&request)?),
            )
            .await?;

        let operation_id = operation_id_from(&body, &headers).ok_or_else(|| {
            Error::Protocol("no operation ID returned from import request".to_owned())
        })?;

        self.track_operation(
            &operation_id,
            OperationKind::ImageImport,
            OperationContext {
                registry_url: Some(registry_url.to_owned()),
                tag: tag.map(str::to_owned),
                ..OperationContext::default()
            },
        );
        log::info!("Importing image {registry_url} -> operation {operation_id}");
        Ok(operation_id)
    }

    /// Spawn an instance run. Returns the operation id and starts a
    /// background poller for it.
    pub async fn spawn_instance(&self, options: SpawnOptions) -> Result<String> {
        let stdin = match &options.stdin {
            Some(text) => Stream::from_bytes(text.as_bytes()),
            None => Stream::empty(),
        };
        let spec = InstanceSpec {
            command: options.command.clone(),
            image: options.image.clone(),
            shell: options.shell,
            args: options.args,
            env: options.env,
            cwd: options.cwd,
            timeout: options.timeout,
            hostname: options.hostname,
            disposable: options.disposable,
            stdin,
            truncate_output_at: options.truncate_output_at,
            files: options.files,
        };

        let (body, headers): (SpawnResponse, HeaderMap) = self
            .request_with_headers(
                Method::POST,
                "/instances",
                &[],
                RequestBody::Json(serde_json::to_value(&spec)?),
            )
            .await?;

        let operation_id = operation_id_from(&body, &headers).ok_or_else(|| {
            Error::Protocol("no operation ID returned from spawn_instance".to_owned())
        })?;

        self.track_operation(
            &operation_id,
            OperationKind::Instance,
            OperationContext {
                input_image: Some(options.image.clone()),
                command: Some(options.command.clone()),
                ..OperationContext::default()
            },
        );
        log::debug!(
            "Spawning instance: image={} command={:?} -> operation {operation_id}",
            options.image,
            truncate_for_log(&options.command),
        );
        Ok(operation_id)
    }

    pub async fn list_operations(
        &self,
        filters: OperationFilters,
    ) -> Result<Vec<OperationSummary>> {
        let mut query: Vec<(&str, String)> = vec![
            ("limit", filters.limit.to_string()),
            ("offset", filters.offset.to_string()),
        ];
        if let Some(status) = filters.status {
            query.push(("status", status.to_string()));
        }
        if let Some(kind) = filters.kind {
            query.push(("kind", kind.to_string()));
        }
        if let Some(since) = &filters.since {
            query.push(("since", since.clone()));
        }
        if let Some(until) = &filters.until {
            query.push(("until", until.clone()));
        }

        let response: OperationListResponse = self
            .request(Method::GET, "/operations", &query, RequestBody::Empty)
            .await?;
        Ok(response.operations)
    }

    async fn fetch_operation(&self, operation_id: &str) -> Result<OperationResponse> {
        let response: OperationResponse = self
            .request(
                Method::GET,
                &format!("/operations/{operation_id}"),
                &[],
                RequestBody::Empty,
            )
            .await?;
        self.inner
            .cache
            .put("operation", operation_id, &response, None)
            .await?;
        Ok(response)
    }

    /// A snapshot of the operation without blocking on completion:
    /// cache-first, fetching (and caching) on a miss.
    pub async fn get_operation(&self, operation_id: &str) -> Result<OperationResponse> {
        if let Some(entry) = self.inner.cache.get("operation", operation_id, None).await? {
            return entry.data_as();
        }
        self.fetch_operation(operation_id).await
    }

    /// Cancel the operation remotely, returning early if it already reached
    /// a terminal status.
    pub async fn cancel_operation(&self, operation_id: &str) -> Result<OperationStatus> {
        let current = self.get_operation(operation_id).await?;
        if current.status.is_terminal() {
            return Ok(current.status);
        }
        self.stream_request(
            Method::DELETE,
            &format!("/operations/{operation_id}"),
            &[],
            RequestBody::Empty,
        )
        .await?;
        log::info!("Cancelled operation {operation_id}");
        Ok(OperationStatus::Cancelled)
    }

    /// Wait for the operation to reach a terminal status.
    ///
    /// The poller is shared: a waiter that gives up never tears down the
    /// poller or other waiters. Any abandoned wait cancels the remote
    /// operation best-effort from a detached task, whether the caller's
    /// `max_wait` expired (the caller then gets `Timeout`) or the returned
    /// future itself was dropped mid-wait.
    pub async fn wait_for_operation(
        &self,
        operation_id: &str,
        max_wait: Option<Duration>,
    ) -> Result<OperationResponse> {
        let existing = {
            let tracked = self.inner.tracked.lock();
            tracked.get(operation_id).map(|h| h.result_rx.clone())
        };

        let mut rx = match existing {
            Some(rx) => rx,
            None => {
                let op = self.get_operation(operation_id).await?;
                if op.status.is_terminal() {
                    return Ok(op);
                }
                self.track_operation(operation_id, op.kind, OperationContext::default())
            }
        };

        // Armed for the whole suspension: dropping this frame (from here on)
        // fires the best-effort remote cancel.
        let mut cancel_guard = RemoteCancelGuard::new(self.clone(), operation_id);

        let wait = rx.wait_for(|result| result.is_some());
        let outcome = match max_wait {
            Some(deadline) => match tokio::time::timeout(deadline, wait).await {
                Ok(outcome) => outcome,
                // The guard stays armed, so returning issues the cancel.
                Err(_) => {
                    return Err(Error::Timeout {
                        operation_id: operation_id.to_owned(),
                        max_wait: deadline,
                    });
                }
            },
            None => wait.await,
        };
        cancel_guard.disarm();

        match outcome {
            Ok(result) => result.clone().unwrap_or_else(|| {
                Err(Error::Protocol(format!(
                    "operation {operation_id} completed without a result"
                )))
            }),
            // The sender is only dropped when the client shuts down.
            Err(_) => Err(Error::Protocol(format!(
                "poller for operation {operation_id} was torn down before completion"
            ))),
        }
    }

    pub fn is_tracked(&self, operation_id: &str) -> bool {
        self.inner.tracked.lock().contains_key(operation_id)
    }

    pub(crate) fn track_operation(
        &self,
        operation_id: &str,
        kind: OperationKind,
        context: OperationContext,
    ) -> ResultReceiver {
        let mut tracked = self.inner.tracked.lock();
        if let Some(handle) = tracked.get(operation_id) {
            return handle.result_rx.clone();
        }

        log::debug!("Tracking operation {operation_id} (kind={kind})");
        let (tx, rx) = watch::channel(None);
        let client = self.clone();
        let id = operation_id.to_owned();
        let join = tokio::spawn(async move {
            let result = client.poll_until_complete(&id, kind, &context).await;
            client.inner.tracked.lock().remove(&id);
            let _ = tx.send(Some(result));
        });

        tracked.insert(
            operation_id.to_owned(),
            OperationHandle {
                kind,
                join,
                result_rx: rx.clone(),
            },
        );
        rx
    }

    async fn poll_until_complete(
        &self,
        operation_id: &str,
        kind: OperationKind,
        context: &OperationContext,
    ) -> Result<OperationResponse> {
        let _permit = self
            .inner
            .poll_semaphore
            .acquire()
            .await
            .map_err(|_| Error::Protocol("poll semaphore closed".to_owned()))?;

        loop {
            let result = self.fetch_operation(operation_id).await?;
            if result.status.is_terminal() {
                log::debug!("Operation {operation_id} completed: {}", result.status);
                if let Err(e) =
                    lineage::record(&self.inner.cache, operation_id, kind, &result, context).await
                {
                    log::warn!("Failed to record lineage for {operation_id}: {e}");
                }
                return Ok(result);
            }
            log::debug!("Operation {operation_id} still {}", result.status);
            tokio::time::sleep(self.inner.options.poll_interval).await;
        }
    }

    /// Cancel the operation remotely if it has not reached a terminal
    /// status yet, swallowing failures.
    async fn try_cancel_incomplete(&self, operation_id: &str) {
        match self.get_operation(operation_id).await {
            Ok(op) if !op.status.is_terminal() => {
                if let Err(e) = self.cancel_operation(operation_id).await {
                    log::debug!("Failed to cancel operation {operation_id}: {e}");
                }
            }
            Ok(_) => {}
            Err(e) => log::debug!("Failed to inspect operation {operation_id}: {e}"),
        }
    }

    /// Best-effort cancellation of every tracked operation, swallowing
    /// individual failures.
    pub async fn cancel_incomplete_operations(&self) {
        let ids: Vec<String> = self.inner.tracked.lock().keys().cloned().collect();
        futures::future::join_all(ids.iter().map(|id| self.try_cancel_incomplete(id))).await;
    }

    /// Shut the client down: stop every poller, attempt remote cancellation
    /// of every tracked operation, and clear the tracking map. The
    /// connection pool closes when the last clone drops.
    pub async fn close(&self) {
        let handles: Vec<(String, OperationHandle)> = {
            let mut tracked = self.inner.tracked.lock();
            tracked.drain().collect()
        };
        if handles.is_empty() {
            return;
        }

        log::info!("Cancelling {} tracked operations", handles.len());
        for (_, handle) in &handles {
            handle.join.abort();
        }

        futures::future::join_all(
            handles.iter().map(|(id, _)| self.try_cancel_incomplete(id)),
        )
        .await;

        for (_, handle) in handles {
            let _ = handle.join.await;
        }
    }
}

fn truncate_for_log(command: &str) -> String {
    if command.chars().count() > 50 {
        format!("{}...", command.chars().take(50).collect::<String>())
    } else {
        command.to_owned()
    }
}
