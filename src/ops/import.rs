// Copyright 2025 Vessel project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use protocol::{Error, Result};
use registry_auth::{RegistryAuth, RegistryToken};

use crate::context::BrokerContext;
use crate::ops::OperationOutcome;

const IMPORT_TIMEOUT_SECONDS: u64 = 300;

/// Import an OCI image from a registry.
///
/// Stored credentials for the registry are revalidated before use and
/// dropped if they stopped working. Without usable credentials the import
/// fails unless the caller explicitly opted into (rate-limited) anonymous
/// access.
pub async fn import_image(
    ctx: &BrokerContext,
    registry_url: &str,
    tag: Option<&str>,
    wait: bool,
    allow_anonymous: bool,
) -> Result<OperationOutcome> {
    let auth = RegistryAuth::from_url(registry_url)?;

    let mut username: Option<String> = None;
    let mut password: Option<String> = None;

    if let Some(entry) = ctx
        .cache()
        .get("registry_token", auth.registry(), None)
        .await?
    {
        let stored: RegistryToken = entry.data_as()?;

        // Tokens expire; revalidate before trusting the cache.
        if auth.validate_token(&stored.username, &stored.token).await? {
            username = Some(stored.username);
            password = Some(stored.token);
        } else {
            log::info!(
                "Stored credentials for '{}' no longer validate, dropping them",
                auth.registry()
            );
            ctx.cache()
                .delete("registry_token", auth.registry())
                .await?;
        }
    }

    if username.is_none() && !allow_anonymous {
        return Err(Error::RegistryAuthentication {
            registry: auth.registry().to_owned(),
        });
    }

    let operation_id = ctx
        .client()
        .import_image(
            registry_url,
            tag,
            username.as_deref(),
            password.as_deref(),
            IMPORT_TIMEOUT_SECONDS,
        )
        .await?;

    if wait {
        let response = ctx.client().wait_for_operation(&operation_id, None).await?;
        Ok(OperationOutcome::Completed(Box::new(response)))
    } else {
        Ok(OperationOutcome::Submitted { operation_id })
    }
}
