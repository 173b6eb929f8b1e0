// Copyright 2025 Vessel project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use serde::Serialize;

use protocol::Result;
use registry_auth::{RegistryAuth, RegistryToken};

use crate::context::BrokerContext;

#[derive(Clone, Debug, Serialize)]
pub struct RegistryTokenObtainOutput {
    pub registry: String,
    pub known: bool,
    pub url: Option<String>,
    pub message: String,
}

/// Point the user at the PAT creation page for a registry. Opening a
/// browser is the protocol adapter's business; this op only resolves the
/// registry and its token page.
pub async fn registry_token_obtain(registry_url: &str) -> Result<RegistryTokenObtainOutput> {
    let auth = RegistryAuth::from_url(registry_url)?;

    if !auth.is_known() {
        return Ok(RegistryTokenObtainOutput {
            registry: auth.registry().to_owned(),
            known: false,
            url: None,
            message: format!(
                "Unknown registry '{}'. Please consult the registry documentation for token creation.",
                auth.registry()
            ),
        });
    }

    let pat_url = auth.pat_url().unwrap_or_default();
    Ok(RegistryTokenObtainOutput {
        registry: auth.registry().to_owned(),
        known: true,
        url: Some(pat_url.to_owned()),
        message: format!(
            "Create a read-only PAT at {pat_url}, then store it with registry_auth \
       (registry_url={registry_url:?}, username=..., token=...)."
        ),
    })
}

#[derive(Clone, Debug, Serialize)]
pub struct RegistryAuthOutput {
    pub success: bool,
    pub registry: String,
    pub message: String,
}

/// Validate a registry credential against the registry's token endpoint
/// and, if usable, store it for later imports.
pub async fn registry_auth(
    ctx: &BrokerContext,
    registry_url: &str,
    username: &str,
    token: &str,
) -> Result<RegistryAuthOutput> {
    let auth = RegistryAuth::from_url(registry_url)?;

    if !auth.validate_token(username, token).await? {
        return Ok(RegistryAuthOutput {
            success: false,
            registry: auth.registry().to_owned(),
            message: format!(
                "Invalid credentials for '{}'. Please verify your username and PAT.",
                auth.registry()
            ),
        });
    }

    let stored = RegistryToken::new(auth.registry(), username, token);
    ctx.cache()
        .put("registry_token", auth.registry(), &stored, None)
        .await?;

    Ok(RegistryAuthOutput {
        success: true,
        registry: auth.registry().to_owned(),
        message: format!(
            "Authenticated with '{}' as '{username}' successfully.",
            auth.registry()
        ),
    })
}
