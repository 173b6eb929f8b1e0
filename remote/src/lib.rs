// Copyright 2025 Vessel project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

#![deny(warnings)]
// Enable all clippy lints except for many of the pedantic ones. It's a shame this needs to be copied and pasted across crates, but there doesn't appear to be a way to include inner attributes from a common source.
#![deny(
    clippy::all,
    clippy::default_trait_access,
    clippy::expl_impl_clone_on_copy,
    clippy::if_not_else,
    clippy::needless_continue,
    clippy::unseparated_literal_suffix,
    clippy::used_underscore_binding
)]
// It is often more clear to show that nothing is being moved.
#![allow(clippy::match_ref_pats)]
// Subjective style.
#![allow(
    clippy::len_without_is_empty,
    clippy::redundant_field_names,
    clippy::too_many_arguments
)]
// Default isn't as big a deal as people seem to think it is.
#![allow(clippy::new_without_default, clippy::new_ret_no_self)]
// Arc<Mutex> can be more clear than needing to grok Orderings:
#![allow(clippy::mutex_atomic)]

use std::collections::HashMap;
use std::path::Path;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use futures::{Stream, StreamExt};
use parking_lot::Mutex;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_LENGTH, CONTENT_TYPE};
use reqwest::{Method, StatusCode};
use serde::de::DeserializeOwned;
use serde_json::json;
use tokio::sync::Semaphore;

use cache::Cache;
use hashing::Digest;
use protocol::{
    DirectoryList, Error, FileResponse, Image, ImageListResponse, Result,
};

mod lineage;
mod operations;

pub use operations::{OperationFilters, SpawnOptions};

use operations::OperationHandle;

/// Bound on concurrently polling operation trackers.
const POLL_CONCURRENCY: usize = 10;

/// A stream of response body chunks, with transport errors mapped into the
/// broker's error vocabulary.
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes>> + Send>>;

/// Connection parameters for the remote service.
#[derive(Clone, Debug)]
pub struct RemoteOptions {
    pub base_url: String,
    pub token: String,
    pub timeout: Duration,
    pub poll_interval: Duration,
    pub retry_time: Duration,
    pub retry_count: usize,
    pub payload_limit: usize,
}

impl RemoteOptions {
    pub fn new(base_url: impl Into<String>, token: impl Into<String>) -> RemoteOptions {
        RemoteOptions {
            base_url: base_url.into(),
            token: token.into(),
            timeout: Duration::from_secs(30),
            poll_interval: Duration::from_secs(1),
            retry_time: Duration::from_secs(2),
            retry_count: 5,
            payload_limit: 64 * 1024,
        }
    }
}

pub(crate) struct ClientInner {
    pub(crate) base_url: String,
    pub(crate) http: reqwest::Client,
    pub(crate) cache: Cache,
    pub(crate) options: RemoteOptions,
    pub(crate) poll_semaphore: Semaphore,
    pub(crate) tracked: Mutex<HashMap<String, OperationHandle>>,
}

///
/// Typed HTTP access to the remote execution service: structured and
/// streaming requests, content-addressed uploads coalesced through the
/// general cache, and in-memory tracking of long-running operations with
/// bounded-concurrency polling.
///
/// Cloning is cheap; all clones share one connection pool, one cache handle
/// and one tracking map.
///
#[derive(Clone)]
pub struct Client {
    pub(crate) inner: Arc<ClientInner>,
}

pub(crate) enum RequestBody {
    Empty,
    Json(serde_json::Value),
    Octets(Bytes),
}

/// One dispatch attempt. 5xx is the only retryable outcome; 4xx carries the
/// extracted error message and is permanent.
enum AttemptError {
    Retryable { status: u16, message: String },
    Permanent(Error),
}

pub(crate) struct StreamResponse {
    pub(crate) status: StatusCode,
    pub(crate) headers: HeaderMap,
    pub(crate) stream: Pin<Box<dyn Stream<Item = reqwest::Result<Bytes>> + Send>>,
}

impl Client {
    pub fn new(options: RemoteOptions, cache: Cache) -> Result<Client> {
        let mut headers = HeaderMap::new();
        let bearer = HeaderValue::from_str(&format!("Bearer {}", options.token))
            .map_err(|_| Error::InvalidArgument("API token is not a valid header value".to_owned()))?;
        headers.insert(AUTHORIZATION, bearer);

        let user_agent = format!(
            "vessel-broker/{} rust/2021 {}",
            env!("CARGO_PKG_VERSION"),
            std::env::consts::OS,
        );

        let http = reqwest::Client::builder()
            .user_agent(user_agent)
            .default_headers(headers)
            .timeout(options.timeout)
            .build()
            .map_err(|e| Error::Protocol(format!("failed to construct HTTP client: {e}")))?;

        let base_url = format!("{}/v1", options.base_url.trim_end_matches('/'));

        Ok(Client {
            inner: Arc::new(ClientInner {
                base_url,
                http,
                cache,
                options,
                poll_semaphore: Semaphore::new(POLL_CONCURRENCY),
                tracked: Mutex::new(HashMap::new()),
            }),
        })
    }

    pub fn cache(&self) -> &Cache {
        &self.inner.cache
    }

    //
    // Request dispatch.
    //

    async fn attempt_request(
        &self,
        method: &Method,
        url: &str,
        query: &[(&str, String)],
        body: &RequestBody,
    ) -> std::result::Result<StreamResponse, AttemptError> {
        let mut request = self.inner.http.request(method.clone(), url);
        if !query.is_empty() {
            request = request.query(query);
        }
        request = match body {
            RequestBody::Empty => request,
            RequestBody::Json(value) => request.json(value),
            RequestBody::Octets(bytes) => request
                .header(CONTENT_TYPE, "application/octet-stream")
                .body(bytes.clone()),
        };

        let response = request.send().await.map_err(|e| {
            AttemptError::Permanent(Error::Protocol(format!("request to {url} failed: {e}")))
        })?;

        let status = response.status();
        if status.is_server_error() {
            return Err(AttemptError::Retryable {
                status: status.as_u16(),
                message: format!("server error from {url}"),
            });
        }
        if status.is_client_error() {
            let limit = self.inner.options.payload_limit;
            let body = response.bytes().await.unwrap_or_default();
            let body = &body[..body.len().min(limit)];
            let message = match serde_json::from_slice::<serde_json::Value>(body) {
                Ok(value) => value
                    .get("error")
                    .and_then(serde_json::Value::as_str)
                    .map(str::to_owned)
                    .unwrap_or_else(|| String::from_utf8_lossy(body).into_owned()),
                Err(_) => String::from_utf8_lossy(body).into_owned(),
            };
            return Err(AttemptError::Permanent(Error::Remote {
                status: status.as_u16(),
                message,
            }));
        }

        Ok(StreamResponse {
            status,
            headers: response.headers().clone(),
            stream: Box::pin(response.bytes_stream()),
        })
    }

    /// Perform an HTTP request and return the streaming response. 4xx fails
    /// with the JSON-extracted error message and is not retried; 5xx sleeps
    /// and retries up to the configured attempt count.
    pub(crate) async fn stream_request(
        &self,
        method: Method,
        path: &str,
        query: &[(&str, String)],
        body: RequestBody,
    ) -> Result<StreamResponse> {
        let url = format!("{}/{}", self.inner.base_url, path.trim_start_matches('/'));
        log::debug!("{method} {path} (streaming)");

        let mut last_server_error = None;
        for attempt in 0..self.inner.options.retry_count {
            match self.attempt_request(&method, &url, query, &body).await {
                Ok(response) => {
                    log::debug!("{method} {path} -> {} (streaming)", response.status);
                    return Ok(response);
                }
                Err(AttemptError::Permanent(err)) => {
                    log::debug!("{method} {path} -> {err}");
                    return Err(err);
                }
                Err(AttemptError::Retryable { status, message }) => {
                    log::debug!(
                        "{method} {path} -> {status}: server error, retrying (attempt {}/{})...",
                        attempt + 1,
                        self.inner.options.retry_count,
                    );
                    last_server_error = Some(Error::Remote { status, message });
                    tokio::time::sleep(self.inner.options.retry_time).await;
                }
            }
        }

        Err(last_server_error
            .unwrap_or_else(|| Error::Protocol(format!("no attempts made for {url}"))))
    }

    /// Decode a structured response from a bounded buffer, so an adversarial
    /// remote cannot balloon the broker's memory.
    async fn read_structured<T: DeserializeOwned>(&self, response: StreamResponse) -> Result<T> {
        let limit = self.inner.options.payload_limit;
        if let Some(length) = content_length(&response.headers) {
            if length > limit {
                return Err(Error::Protocol(format!(
                    "response too large ({length} bytes) for structured decoding"
                )));
            }
        }

        let mut buf = BytesMut::new();
        let mut stream = response.stream;
        while let Some(chunk) = stream.next().await {
            let chunk = chunk
                .map_err(|e| Error::Protocol(format!("error reading response body: {e}")))?;
            if buf.len() + chunk.len() > limit {
                return Err(Error::Protocol(format!(
                    "response exceeded the {limit} byte payload limit"
                )));
            }
            buf.extend_from_slice(&chunk);
        }

        serde_json::from_slice(&buf).map_err(|e| Error::Protocol(format!("invalid JSON: {e}")))
    }

    pub(crate) async fn request<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        query: &[(&str, String)],
        body: RequestBody,
    ) -> Result<T> {
        let response = self.stream_request(method, path, query, body).await?;
        self.read_structured(response).await
    }

    /// As `request`, but also hands back the response headers for callers
    /// that need them (operation submissions read `Location`).
    pub(crate) async fn request_with_headers<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        query: &[(&str, String)],
        body: RequestBody,
    ) -> Result<(T, HeaderMap)> {
        let response = self.stream_request(method, path, query, body).await?;
        let headers = response.headers.clone();
        let body = self.read_structured(response).await?;
        Ok((body, headers))
    }

    /// HEAD the given path, reporting the status code. 4xx statuses are
    /// reported rather than raised so existence probes can treat them as
    /// absence.
    pub(crate) async fn head_request(&self, path: &str, query: &[(&str, String)]) -> Result<u16> {
        match self
            .stream_request(Method::HEAD, path, query, RequestBody::Empty)
            .await
        {
            Ok(response) => Ok(response.status.as_u16()),
            Err(Error::Remote { status, .. }) if (400..500).contains(&status) => Ok(status),
            Err(err) => Err(err),
        }
    }

    async fn collect_body(&self, response: StreamResponse) -> Result<Vec<u8>> {
        let mut buf = Vec::new();
        let mut stream = response.stream;
        while let Some(chunk) = stream.next().await {
            let chunk = chunk
                .map_err(|e| Error::Protocol(format!("error reading response body: {e}")))?;
            buf.extend_from_slice(&chunk);
        }
        Ok(buf)
    }

    //
    // Images.
    //

    pub async fn list_images(&self, filters: ImageFilters) -> Result<Vec<Image>> {
        let mut query: Vec<(&str, String)> = vec![
            ("limit", filters.limit.to_string()),
            ("offset", filters.offset.to_string()),
        ];
        if let Some(tagged) = filters.tagged {
            query.push(("tagged", if tagged { "1" } else { "0" }.to_owned()));
        }
        if let Some(prefix) = &filters.tag_prefix {
            // Strip trailing separators; the backend validates tag format strictly.
            let prefix = prefix.trim_end_matches([':', '/', '.']);
            if !prefix.is_empty() {
                query.push(("tag", prefix.to_owned()));
            }
        }
        if let Some(since) = &filters.since {
            query.push(("since", since.clone()));
        }
        if let Some(until) = &filters.until {
            query.push(("until", until.clone()));
        }

        let response: ImageListResponse = self
            .request(Method::GET, "/images", &query, RequestBody::Empty)
            .await?;
        Ok(response.images)
    }

    pub async fn tag_image(&self, image_uuid: &str, tag: &str) -> Result<Image> {
        self.request(
            Method::PATCH,
            &format!("/images/{image_uuid}/tag"),
            &[],
            RequestBody::Json(json!({"tag": tag})),
        )
        .await
    }

    pub async fn untag_image(&self, image_uuid: &str) -> Result<Image> {
        self.request(
            Method::DELETE,
            &format!("/images/{image_uuid}/tag"),
            &[],
            RequestBody::Empty,
        )
        .await
    }

    pub async fn get_image_by_tag(&self, tag: &str) -> Result<Image> {
        self.request(
            Method::GET,
            "/inspect/",
            &[("tag", tag.to_owned())],
            RequestBody::Empty,
        )
        .await
    }

    pub async fn get_image(&self, image_uuid: &str) -> Result<Image> {
        self.request(
            Method::GET,
            &format!("/inspect/{image_uuid}/"),
            &[],
            RequestBody::Empty,
        )
        .await
    }

    /// Resolve an image reference to a UUID. References are either a UUID or
    /// `tag:<name>`, URL-decoded first.
    pub async fn resolve_image(&self, image: &str) -> Result<String> {
        let image = urlencoding::decode(image)
            .map_err(|e| Error::InvalidArgument(format!("undecodable image reference: {e}")))?
            .into_owned();
        if let Some(tag) = image.strip_prefix("tag:") {
            let img = self.get_image_by_tag(tag).await?;
            return Ok(img.uuid);
        }
        uuid::Uuid::parse_str(&image).map_err(|_| {
            Error::InvalidArgument(format!(
                "invalid image reference: {image:?}. Use UUID or 'tag:name' format."
            ))
        })?;
        Ok(image)
    }

    //
    // Inspecting image contents. Snapshots are immutable, so these cache
    // without a TTL.
    //

    pub async fn list_directory(&self, image_uuid: &str, path: &str) -> Result<DirectoryList> {
        let path = format!("/{}", path.trim_start_matches('/'));
        let cache_key = format!("{image_uuid}:{path}");

        if let Some(entry) = self.inner.cache.get("list_dir", &cache_key, None).await? {
            return entry.data_as();
        }

        let listing: DirectoryList = self
            .request(
                Method::GET,
                &format!("/inspect/{image_uuid}/list"),
                &[("path", path)],
                RequestBody::Empty,
            )
            .await?;

        self.inner
            .cache
            .put("list_dir", &cache_key, &listing, None)
            .await?;
        Ok(listing)
    }

    /// List a directory in the backend's `ls -l`-style text format.
    pub async fn list_directory_text(&self, image_uuid: &str, path: &str) -> Result<String> {
        let path = format!("/{}", path.trim_start_matches('/'));
        let cache_key = format!("{image_uuid}:{path}:text");

        if let Some(entry) = self
            .inner
            .cache
            .get("list_dir_text", &cache_key, None)
            .await?
        {
            return Ok(entry.data_str("text").unwrap_or_default().to_owned());
        }

        let response = self
            .stream_request(
                Method::GET,
                &format!("/inspect/{image_uuid}/list"),
                &[("path", path), ("text", String::new())],
                RequestBody::Empty,
            )
            .await?;
        let body = self.collect_body(response).await?;
        let text = String::from_utf8_lossy(&body).into_owned();

        self.inner
            .cache
            .put("list_dir_text", &cache_key, &json!({"text": text}), None)
            .await?;
        Ok(text)
    }

    pub async fn read_file(&self, image_uuid: &str, path: &str) -> Result<Vec<u8>> {
        use base64::Engine;

        let cache_key = format!("{image_uuid}:{path}");
        if let Some(entry) = self.inner.cache.get("read_file", &cache_key, None).await? {
            let content = entry.data_str("content").unwrap_or_default();
            return base64::engine::general_purpose::STANDARD
                .decode(content)
                .map_err(|e| Error::Persistence(format!("corrupt cached file content: {e}")));
        }

        let path = format!("/{}", path.trim_start_matches('/'));
        let response = self
            .stream_request(
                Method::GET,
                &format!("/inspect/{image_uuid}/download"),
                &[("path", path)],
                RequestBody::Empty,
            )
            .await?;
        let content = self.collect_body(response).await?;

        let encoded = base64::engine::general_purpose::STANDARD.encode(&content);
        self.inner
            .cache
            .put("read_file", &cache_key, &json!({"content": encoded}), None)
            .await?;
        Ok(content)
    }

    /// Stream a file out of an image. Bypasses the cache: the caller owns
    /// the sink and back-pressure.
    pub async fn stream_file(&self, image_uuid: &str, path: &str) -> Result<ByteStream> {
        let response = self
            .stream_request(
                Method::GET,
                &format!("/inspect/{image_uuid}/download"),
                &[("path", path.to_owned())],
                RequestBody::Empty,
            )
            .await?;
        Ok(Box::pin(response.stream.map(|chunk| {
            chunk.map_err(|e| Error::Protocol(format!("error reading download stream: {e}")))
        })))
    }

    pub async fn file_exists(&self, image_uuid: &str, path: &str) -> Result<bool> {
        let cache_key = format!("{image_uuid}:{path}");
        if let Some(entry) = self.inner.cache.get("file_exists", &cache_key, None).await? {
            return Ok(entry.data_bool("exists"));
        }

        let exists = matches!(
            self.head_request(
                &format!("/inspect/{image_uuid}/download"),
                &[("path", path.to_owned())],
            )
            .await,
            Ok(200)
        );

        self.inner
            .cache
            .put("file_exists", &cache_key, &json!({"exists": exists}), None)
            .await?;
        Ok(exists)
    }

    //
    // Content-addressed uploads.
    //

    /// Upload file content, coalescing duplicates: identical bytes are only
    /// ever POSTed once, and the resulting `(uuid, sha256)` pair is served
    /// from the cache afterwards.
    pub async fn upload_file(&self, content: Bytes) -> Result<FileResponse> {
        let digest = Digest::of_bytes(&content);
        self.upload_with_digest(content, digest).await
    }

    /// Upload a local file, hashing while reading it off disk.
    pub async fn upload_path(&self, path: &Path) -> Result<FileResponse> {
        let path = path.to_owned();
        let (digest, content) = tokio::task::spawn_blocking(move || {
            let mut file = std::fs::File::open(&path)?;
            let mut buf = Vec::new();
            let digest = hashing::sync_copy_and_hash(&mut file, &mut buf)?;
            Ok::<_, std::io::Error>((digest, buf))
        })
        .await
        .map_err(|e| Error::Persistence(format!("upload read task failed: {e}")))??;

        self.upload_with_digest(Bytes::from(content), digest).await
    }

    async fn upload_with_digest(&self, content: Bytes, digest: Digest) -> Result<FileResponse> {
        let sha256 = digest.hash.to_hex();

        if let Some(existing) = self.get_file_by_hash(&sha256).await? {
            log::debug!(
                "File already exists: uuid={} sha256={}...",
                existing.uuid,
                &sha256[..16]
            );
            return Ok(existing);
        }

        log::debug!(
            "Uploading file ({} bytes, sha256={}...)",
            digest.size_bytes,
            &sha256[..16]
        );
        let response: FileResponse = self
            .request(Method::POST, "/files", &[], RequestBody::Octets(content))
            .await?;

        self.inner
            .cache
            .put("file_by_hash", &sha256, &response, None)
            .await?;

        log::debug!(
            "Uploaded file: uuid={} sha256={}...",
            response.uuid,
            &response.sha256[..16.min(response.sha256.len())]
        );
        Ok(response)
    }

    /// Look up a blob by content hash. 404 is cached as a "not found"
    /// sentinel so repeated lookups stay off the network.
    pub async fn get_file_by_hash(&self, sha256: &str) -> Result<Option<FileResponse>> {
        if let Some(entry) = self.inner.cache.get("file_by_hash", sha256, None).await? {
            if entry.data_bool("not_found") {
                return Ok(None);
            }
            return Ok(Some(entry.data_as()?));
        }

        match self
            .request::<FileResponse>(
                Method::GET,
                "/files",
                &[("sha256", sha256.to_owned())],
                RequestBody::Empty,
            )
            .await
        {
            Ok(response) => {
                self.inner
                    .cache
                    .put("file_by_hash", sha256, &response, None)
                    .await?;
                Ok(Some(response))
            }
            Err(Error::Remote { status: 404, .. }) => {
                self.inner
                    .cache
                    .put("file_by_hash", sha256, &json!({"not_found": true}), None)
                    .await?;
                Ok(None)
            }
            Err(err) => Err(err),
        }
    }

    /// Check whether an uploaded blob still exists, by UUID. File identities
    /// are immutable, so the answer is cached without a TTL.
    pub async fn check_file_exists(&self, file_uuid: &str) -> Result<bool> {
        if let Some(entry) = self
            .inner
            .cache
            .get("file_exists_by_uuid", file_uuid, None)
            .await?
        {
            return Ok(entry.data_bool("exists"));
        }

        let exists = matches!(
            self.head_request("/files", &[("uuid", file_uuid.to_owned())])
                .await,
            Ok(200)
        );

        self.inner
            .cache
            .put(
                "file_exists_by_uuid",
                file_uuid,
                &json!({"exists": exists}),
                None,
            )
            .await?;
        Ok(exists)
    }

    /// Ask the server whether it still has a blob with this hash. Used by
    /// revalidation, so deliberately uncached: the point is to detect
    /// server-side eviction.
    pub async fn check_file_exists_by_hash(&self, sha256: &str) -> Result<bool> {
        Ok(matches!(
            self.head_request("/files", &[("sha256", sha256.to_owned())])
                .await?,
            200
        ))
    }
}

/// Query filters for `GET /images`.
#[derive(Clone, Debug)]
pub struct ImageFilters {
    pub limit: u32,
    pub offset: u32,
    pub tagged: Option<bool>,
    pub tag_prefix: Option<String>,
    pub since: Option<String>,
    pub until: Option<String>,
}

impl Default for ImageFilters {
    fn default() -> ImageFilters {
        ImageFilters {
            limit: 100,
            offset: 0,
            tagged: None,
            tag_prefix: None,
            since: None,
            until: None,
        }
    }
}

fn content_length(headers: &HeaderMap) -> Option<usize> {
    headers
        .get(CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse().ok())
}
