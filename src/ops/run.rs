// Copyright 2025 Vessel project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::collections::BTreeMap;

use protocol::{Error, InstanceFileSpec, Result};
use remote::SpawnOptions;

use crate::context::BrokerContext;
use crate::ops::OperationOutcome;

/// Parameters for running a command in a fresh instance.
#[derive(Clone, Debug)]
pub struct RunOptions {
    pub command: String,
    pub image: String,
    pub shell: bool,
    pub env: BTreeMap<String, String>,
    pub cwd: String,
    pub timeout: u64,
    /// A disposable run discards the instance's filesystem; a
    /// non-disposable one produces a derived image.
    pub disposable: bool,
    pub stdin: Option<String>,
    /// A previously-synced directory state to inject before the command.
    pub directory_state_id: Option<i64>,
    /// Extra `target path -> uploaded file uuid` injections.
    pub files: BTreeMap<String, String>,
    pub wait: bool,
    pub truncate_output_at: u64,
}

impl RunOptions {
    pub fn new(command: impl Into<String>, image: impl Into<String>) -> RunOptions {
        RunOptions {
            command: command.into(),
            image: image.into(),
            shell: true,
            env: BTreeMap::new(),
            cwd: "/root".to_owned(),
            timeout: 30,
            disposable: true,
            stdin: None,
            directory_state_id: None,
            files: BTreeMap::new(),
            wait: true,
            truncate_output_at: 8000,
        }
    }
}

/// Execute a command in an isolated instance, optionally injecting synced
/// files first and optionally waiting for the terminal result. Lineage for
/// non-disposable runs is recorded by the client's poller.
pub async fn run(ctx: &BrokerContext, options: RunOptions) -> Result<OperationOutcome> {
    let image_uuid = ctx.client().resolve_image(&options.image).await?;

    let mut spawn_files: BTreeMap<String, InstanceFileSpec> = BTreeMap::new();

    if let Some(state_id) = options.directory_state_id {
        let state = ctx.file_cache().get_directory_state(state_id).await?;
        if state.is_none() {
            return Err(Error::InvalidArgument(format!(
                "directory state not found: {state_id}"
            )));
        }

        let state_files = ctx.file_cache().get_directory_state_files(state_id).await?;
        if state_files.is_empty() {
            return Err(Error::InvalidArgument(format!(
                "directory state has no files: {state_id}"
            )));
        }

        for file in state_files {
            spawn_files.insert(
                file.target_path,
                InstanceFileSpec {
                    uuid: file.file_uuid,
                    mode: format!("0o{:o}", file.target_mode),
                },
            );
        }
    }

    for (target_path, file_uuid) in &options.files {
        spawn_files.insert(
            target_path.clone(),
            InstanceFileSpec {
                uuid: file_uuid.clone(),
                mode: "0o644".to_owned(),
            },
        );
    }

    let mut spawn = SpawnOptions::new(options.command, image_uuid);
    spawn.shell = options.shell;
    spawn.env = options.env;
    spawn.cwd = options.cwd;
    spawn.timeout = options.timeout;
    spawn.disposable = options.disposable;
    spawn.stdin = options.stdin;
    spawn.files = spawn_files;
    spawn.truncate_output_at = options.truncate_output_at;

    let operation_id = ctx.client().spawn_instance(spawn).await?;

    if options.wait {
        let response = ctx.client().wait_for_operation(&operation_id, None).await?;
        Ok(OperationOutcome::Completed(Box::new(response)))
    } else {
        Ok(OperationOutcome::Submitted { operation_id })
    }
}
