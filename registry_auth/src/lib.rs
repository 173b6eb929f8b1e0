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

use std::sync::OnceLock;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use protocol::{Error, Result};

/// Registries we can point users at for PAT creation.
const KNOWN_REGISTRIES: &[(&str, &str)] = &[
    (
        "docker.io",
        "https://app.docker.com/settings/personal-access-tokens",
    ),
    ("ghcr.io", "https://github.com/settings/tokens?type=beta"),
    (
        "registry.gitlab.com",
        "https://gitlab.com/-/user_settings/personal_access_tokens",
    ),
    ("gcr.io", "https://console.cloud.google.com/apis/credentials"),
    (
        "us.gcr.io",
        "https://console.cloud.google.com/apis/credentials",
    ),
    (
        "eu.gcr.io",
        "https://console.cloud.google.com/apis/credentials",
    ),
    (
        "asia.gcr.io",
        "https://console.cloud.google.com/apis/credentials",
    ),
];

/// Some registries use a different hostname for API calls.
const REGISTRY_API_HOSTS: &[(&str, &str)] = &[("docker.io", "registry-1.docker.io")];

fn realm_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r#"realm="([^"]+)""#).unwrap())
}

fn service_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r#"service="([^"]+)""#).unwrap())
}

/// Token endpoint discovered from a registry's `/v2/` response.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AuthEndpoint {
    /// Token endpoint URL.
    pub realm: String,
    /// Service name to pass along with token requests.
    pub service: String,
}

/// Stored registry credentials, kept in the general cache under
/// `(registry_token, <hostname>)`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RegistryToken {
    pub registry: String,
    pub username: String,
    pub token: String,
    #[serde(default = "RegistryToken::default_scopes")]
    pub scopes: Vec<String>,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
}

impl RegistryToken {
    fn default_scopes() -> Vec<String> {
        vec!["pull".to_owned()]
    }

    pub fn new(registry: &str, username: &str, token: &str) -> RegistryToken {
        RegistryToken {
            registry: registry.to_owned(),
            username: username.to_owned(),
            token: token.to_owned(),
            scopes: Self::default_scopes(),
            created_at: Utc::now(),
        }
    }
}

///
/// OCI registry authentication: derive the registry hostname from a
/// user-supplied URL, discover the token endpoint via `WWW-Authenticate`,
/// validate stored credentials and mint scoped bearer tokens.
///
pub struct RegistryAuth {
    registry: String,
    api_base: String,
    http: reqwest::Client,
    endpoint: Mutex<Option<AuthEndpoint>>,
}

impl RegistryAuth {
    /// Derive the registry from an image URL.
    ///
    /// `oci://` is transparently rewritten to `docker://` (same protocol),
    /// and a bare image name defaults to docker.io.
    pub fn from_url(registry_url: &str) -> Result<RegistryAuth> {
        let registry_url = rewrite_oci_scheme(registry_url);

        let registry = if registry_url.contains("://") {
            let parsed = url::Url::parse(&registry_url).map_err(|e| {
                Error::InvalidArgument(format!("unparseable registry URL {registry_url:?}: {e}"))
            })?;
            parsed.host_str().unwrap_or("docker.io").to_owned()
        } else {
            // A bare image name implicitly lives on Docker Hub.
            "docker.io".to_owned()
        };

        Ok(Self::for_registry(&registry))
    }

    fn for_registry(registry: &str) -> RegistryAuth {
        let api_host = REGISTRY_API_HOSTS
            .iter()
            .find(|(host, _)| *host == registry)
            .map(|(_, api)| *api)
            .unwrap_or(registry);
        RegistryAuth {
            registry: registry.to_owned(),
            api_base: format!("https://{api_host}"),
            http: reqwest::Client::new(),
            endpoint: Mutex::new(None),
        }
    }

    #[cfg(test)]
    fn with_api_base(registry: &str, api_base: &str) -> RegistryAuth {
        RegistryAuth {
            registry: registry.to_owned(),
            api_base: api_base.trim_end_matches('/').to_owned(),
            http: reqwest::Client::new(),
            endpoint: Mutex::new(None),
        }
    }

    pub fn registry(&self) -> &str {
        &self.registry
    }

    /// The PAT creation page for this registry, if it's one we know about.
    pub fn pat_url(&self) -> Option<&'static str> {
        KNOWN_REGISTRIES
            .iter()
            .find(|(host, _)| *host == self.registry)
            .map(|(_, url)| *url)
    }

    pub fn is_known(&self) -> bool {
        self.pat_url().is_some()
    }

    /// Discover the token endpoint from the registry's `/v2/` response,
    /// caching the result for the lifetime of this instance.
    pub async fn discover_endpoint(&self) -> Result<AuthEndpoint> {
        let mut cached = self.endpoint.lock().await;
        if let Some(endpoint) = cached.as_ref() {
            return Ok(endpoint.clone());
        }

        let v2_url = format!("{}/v2/", self.api_base);
        let response = self.http.get(&v2_url).send().await.map_err(|e| {
            Error::Protocol(format!("failed to reach registry {}: {e}", self.registry))
        })?;

        let endpoint = if response.status() == reqwest::StatusCode::UNAUTHORIZED {
            www_authenticate_header(response.headers()).and_then(parse_www_authenticate)
        } else if response.status().is_success() {
            // Some registries return 200 on the bare /v2/; the catalog
            // endpoint still demands auth and reveals the realm.
            let catalog_url = format!("{}/v2/_catalog", self.api_base);
            let catalog = self.http.get(&catalog_url).send().await.map_err(|e| {
                Error::Protocol(format!("failed to reach registry {}: {e}", self.registry))
            })?;
            if catalog.status() == reqwest::StatusCode::UNAUTHORIZED {
                www_authenticate_header(catalog.headers()).and_then(parse_www_authenticate)
            } else {
                None
            }
        } else {
            None
        };

        match endpoint {
            Some(endpoint) => {
                log::debug!(
                    "Discovered auth endpoint for {}: realm={} service={}",
                    self.registry,
                    endpoint.realm,
                    endpoint.service
                );
                *cached = Some(endpoint.clone());
                Ok(endpoint)
            }
            None => Err(Error::Protocol(format!(
                "could not discover auth endpoint for registry {}",
                self.registry
            ))),
        }
    }

    /// Check a stored credential by requesting a token from the realm. Any
    /// 200 means the credential is usable.
    pub async fn validate_token(&self, username: &str, token: &str) -> Result<bool> {
        let endpoint = match self.discover_endpoint().await {
            Ok(endpoint) => endpoint,
            Err(_) => return Ok(false),
        };

        let response = self
            .http
            .get(&endpoint.realm)
            .query(&[("service", endpoint.service.as_str())])
            .basic_auth(username, Some(token))
            .send()
            .await
            .map_err(|e| Error::Protocol(format!("token validation request failed: {e}")))?;
        Ok(response.status() == reqwest::StatusCode::OK)
    }

    /// Exchange a stored PAT for a scoped registry bearer token (e.g. scope
    /// `repository:myorg/myimage:pull`). None if the registry refused.
    pub async fn get_bearer_token(
        &self,
        username: &str,
        token: &str,
        scope: &str,
    ) -> Result<Option<String>> {
        let endpoint = self.discover_endpoint().await?;

        let response = self
            .http
            .get(&endpoint.realm)
            .query(&[
                ("service", endpoint.service.as_str()),
                ("scope", scope),
            ])
            .basic_auth(username, Some(token))
            .send()
            .await
            .map_err(|e| Error::Protocol(format!("token exchange request failed: {e}")))?;

        if response.status() != reqwest::StatusCode::OK {
            return Ok(None);
        }

        let body: serde_json::Value = response
            .json()
            .await
            .map_err(|e| Error::Protocol(format!("invalid token response: {e}")))?;
        Ok(body
            .get("token")
            .and_then(serde_json::Value::as_str)
            .map(str::to_owned))
    }
}

/// Normalize a registry URL to the `docker://` scheme, defaulting bare
/// image names to docker.io.
pub fn normalize_registry_url(registry_url: &str) -> String {
    let registry_url = rewrite_oci_scheme(registry_url);
    if registry_url.contains("://") {
        registry_url
    } else {
        format!("docker://docker.io/{registry_url}")
    }
}

fn rewrite_oci_scheme(registry_url: &str) -> String {
    match registry_url.strip_prefix("oci://") {
        Some(rest) => format!("docker://{rest}"),
        None => registry_url.to_owned(),
    }
}

fn www_authenticate_header(headers: &reqwest::header::HeaderMap) -> Option<&str> {
    headers
        .get(reqwest::header::WWW_AUTHENTICATE)
        .and_then(|v| v.to_str().ok())
}

/// Parse a `WWW-Authenticate` header of the shape
/// `Bearer realm="https://auth.docker.io/token",service="registry.docker.io"`.
fn parse_www_authenticate(header: &str) -> Option<AuthEndpoint> {
    if !header.starts_with("Bearer ") {
        return None;
    }

    let realm = realm_pattern().captures(header)?.get(1)?.as_str().to_owned();
    let service = service_pattern()
        .captures(header)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_owned())
        .unwrap_or_default();

    Some(AuthEndpoint { realm, service })
}

#[cfg(test)]
mod tests;
