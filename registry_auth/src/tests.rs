// Copyright 2025 Vessel project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::collections::HashMap;
use std::net::SocketAddr;

use axum::extract::Query;
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use base64::Engine;
use serde_json::json;

use protocol::Error;

use crate::{
    normalize_registry_url, parse_www_authenticate, AuthEndpoint, RegistryAuth, RegistryToken,
};

fn serve(router: Router) -> SocketAddr {
    let bind_addr = "127.0.0.1:0".parse::<SocketAddr>().unwrap();
    let listener = std::net::TcpListener::bind(bind_addr).unwrap();
    listener.set_nonblocking(true).unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        axum_server::from_tcp(listener)
            .serve(router.into_make_service())
            .await
            .unwrap();
    });

    addr
}

fn basic_auth_value(username: &str, password: &str) -> String {
    format!(
        "Basic {}",
        base64::engine::general_purpose::STANDARD.encode(format!("{username}:{password}"))
    )
}

/// A registry stub whose /v2/ demands bearer auth and whose /token realm
/// accepts exactly one credential pair.
fn registry_router(addr_holder: std::sync::Arc<std::sync::OnceLock<SocketAddr>>) -> Router {
    Router::new()
        .route(
            "/v2/",
            get(move || {
                let holder = addr_holder.clone();
                async move {
                    let addr = holder.get().unwrap();
                    (
                        StatusCode::UNAUTHORIZED,
                        [(
                            header::WWW_AUTHENTICATE,
                            format!(
                                "Bearer realm=\"http://{addr}/token\",service=\"registry.test\""
                            ),
                        )],
                    )
                }
            }),
        )
        .route(
            "/token",
            get(
                |Query(params): Query<HashMap<String, String>>, headers: HeaderMap| async move {
                    assert_eq!(
                        params.get("service").map(String::as_str),
                        Some("registry.test")
                    );
                    let authorization = headers
                        .get(header::AUTHORIZATION)
                        .and_then(|v| v.to_str().ok())
                        .unwrap_or_default();
                    if authorization == basic_auth_value("alice", "s3cret") {
                        Json(json!({"token": "bearer-xyz"})).into_response()
                    } else {
                        StatusCode::UNAUTHORIZED.into_response()
                    }
                },
            ),
        )
}

fn stub_registry() -> (RegistryAuth, SocketAddr) {
    let holder = std::sync::Arc::new(std::sync::OnceLock::new());
    let addr = serve(registry_router(holder.clone()));
    holder.set(addr).unwrap();
    let auth = RegistryAuth::with_api_base("registry.test", &format!("http://{addr}"));
    (auth, addr)
}

#[test]
fn from_url_extracts_the_registry_host() {
    for (url, registry) in [
        ("docker://ghcr.io/org/image:tag", "ghcr.io"),
        ("oci://registry.gitlab.com/org/img", "registry.gitlab.com"),
        ("docker://docker.io/library/python:3.11-slim", "docker.io"),
        ("myorg/myimage:latest", "docker.io"),
        ("alpine", "docker.io"),
    ] {
        let auth = RegistryAuth::from_url(url).unwrap();
        assert_eq!(auth.registry(), registry, "for {url}");
    }
}

#[test]
fn docker_io_uses_the_registry_1_api_host() {
    let auth = RegistryAuth::from_url("docker://docker.io/library/alpine").unwrap();
    assert_eq!(auth.api_base, "https://registry-1.docker.io");

    let auth = RegistryAuth::from_url("docker://ghcr.io/org/image").unwrap();
    assert_eq!(auth.api_base, "https://ghcr.io");
}

#[test]
fn known_registries_have_pat_pages() {
    let auth = RegistryAuth::from_url("alpine").unwrap();
    assert!(auth.is_known());
    assert_eq!(
        auth.pat_url(),
        Some("https://app.docker.com/settings/personal-access-tokens")
    );

    let auth = RegistryAuth::from_url("docker://registry.example.com/img").unwrap();
    assert!(!auth.is_known());
    assert_eq!(auth.pat_url(), None);
}

#[test]
fn normalize_registry_url_cases() {
    assert_eq!(
        normalize_registry_url("oci://ghcr.io/org/img"),
        "docker://ghcr.io/org/img"
    );
    assert_eq!(
        normalize_registry_url("alpine"),
        "docker://docker.io/alpine"
    );
    assert_eq!(
        normalize_registry_url("docker://docker.io/library/alpine"),
        "docker://docker.io/library/alpine"
    );
}

#[test]
fn parse_www_authenticate_extracts_realm_and_service() {
    let endpoint = parse_www_authenticate(
        "Bearer realm=\"https://auth.docker.io/token\",service=\"registry.docker.io\"",
    )
    .unwrap();
    assert_eq!(
        endpoint,
        AuthEndpoint {
            realm: "https://auth.docker.io/token".to_owned(),
            service: "registry.docker.io".to_owned(),
        }
    );

    // Service is optional.
    let endpoint = parse_www_authenticate("Bearer realm=\"https://auth.example.com/t\"").unwrap();
    assert_eq!(endpoint.realm, "https://auth.example.com/t");
    assert_eq!(endpoint.service, "");

    // Non-bearer schemes and missing realms are rejected.
    assert!(parse_www_authenticate("Basic realm=\"x\"").is_none());
    assert!(parse_www_authenticate("Bearer service=\"x\"").is_none());
}

#[tokio::test]
async fn discovers_endpoint_from_401() {
    let (auth, addr) = stub_registry();

    let endpoint = auth.discover_endpoint().await.unwrap();
    assert_eq!(endpoint.realm, format!("http://{addr}/token"));
    assert_eq!(endpoint.service, "registry.test");

    // Cached for the lifetime of the instance.
    let again = auth.discover_endpoint().await.unwrap();
    assert_eq!(again, endpoint);
}

#[tokio::test]
async fn discovers_endpoint_via_catalog_fallback() {
    let holder = std::sync::Arc::new(std::sync::OnceLock::<SocketAddr>::new());
    let for_catalog = holder.clone();

    let router = Router::new()
        .route("/v2/", get(|| async { StatusCode::OK }))
        .route(
            "/v2/_catalog",
            get(move || {
                let holder = for_catalog.clone();
                async move {
                    let addr = holder.get().unwrap();
                    (
                        StatusCode::UNAUTHORIZED,
                        [(
                            header::WWW_AUTHENTICATE,
                            format!("Bearer realm=\"http://{addr}/token\",service=\"cat\""),
                        )],
                    )
                }
            }),
        );
    let addr = serve(router);
    holder.set(addr).unwrap();

    let auth = RegistryAuth::with_api_base("registry.test", &format!("http://{addr}"));
    let endpoint = auth.discover_endpoint().await.unwrap();
    assert_eq!(endpoint.service, "cat");
}

#[tokio::test]
async fn discovery_failure_is_a_protocol_error() {
    let router = Router::new().route("/v2/", get(|| async { StatusCode::OK }));
    let addr = serve(router);

    let auth = RegistryAuth::with_api_base("registry.test", &format!("http://{addr}"));
    let err = auth.discover_endpoint().await.unwrap_err();
    match err {
        Error::Protocol(msg) => assert!(msg.contains("registry.test")),
        other => panic!("expected Protocol error, got {other:?}"),
    }
}

#[tokio::test]
async fn validate_token_round_trip() {
    let (auth, _addr) = stub_registry();

    assert!(auth.validate_token("alice", "s3cret").await.unwrap());
    assert!(!auth.validate_token("alice", "wrong").await.unwrap());
    assert!(!auth.validate_token("mallory", "s3cret").await.unwrap());
}

#[tokio::test]
async fn validate_token_is_false_when_discovery_fails() {
    let router = Router::new().route("/v2/", get(|| async { StatusCode::OK }));
    let addr = serve(router);

    let auth = RegistryAuth::with_api_base("registry.test", &format!("http://{addr}"));
    assert!(!auth.validate_token("alice", "s3cret").await.unwrap());
}

#[tokio::test]
async fn get_bearer_token_exchanges_credentials() {
    let (auth, _addr) = stub_registry();

    let token = auth
        .get_bearer_token("alice", "s3cret", "repository:org/img:pull")
        .await
        .unwrap();
    assert_eq!(token.as_deref(), Some("bearer-xyz"));

    let denied = auth
        .get_bearer_token("alice", "wrong", "repository:org/img:pull")
        .await
        .unwrap();
    assert_eq!(denied, None);
}

#[test]
fn registry_token_serde_defaults() {
    let token = RegistryToken::new("docker.io", "alice", "tok");
    assert_eq!(token.scopes, vec!["pull".to_owned()]);

    let decoded: RegistryToken = serde_json::from_value(json!({
        "registry": "ghcr.io",
        "username": "bob",
        "token": "t",
    }))
    .unwrap();
    assert_eq!(decoded.scopes, vec!["pull".to_owned()]);
}
