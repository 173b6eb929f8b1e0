// Copyright 2025 Vessel project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::fmt;
use std::time::Duration;

pub type Result<T> = std::result::Result<T, Error>;

/// The error vocabulary shared by the broker's components.
///
/// Only 5xx responses are ever retried, and only inside the remote client;
/// everything else is reported to the caller as one of these.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Error {
    /// The caller violated a precondition: a relative path, an unsafe filter
    /// key, a malformed image reference.
    InvalidArgument(String),

    /// SQL or local-disk I/O failed.
    Persistence(String),

    /// The remote service sent something we cannot accept: an over-limit or
    /// malformed payload, or a submission without an operation id.
    Protocol(String),

    /// HTTP 4xx from the remote service, with the extracted error message.
    Remote { status: u16, message: String },

    /// No usable credentials for a registry, and the caller did not opt into
    /// anonymous access.
    RegistryAuthentication { registry: String },

    /// `wait_for_operation` exceeded its deadline. The remote operation has
    /// been cancelled best-effort as a side effect.
    Timeout {
        operation_id: String,
        max_wait: Duration,
    },
}

impl Error {
    /// The HTTP status for remote errors, e.g. to let callers special-case 404.
    pub fn remote_status(&self) -> Option<u16> {
        match self {
            Error::Remote { status, .. } => Some(*status),
            _ => None,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::InvalidArgument(msg) => write!(f, "invalid argument: {msg}"),
            Error::Persistence(msg) => write!(f, "persistence error: {msg}"),
            Error::Protocol(msg) => write!(f, "protocol error: {msg}"),
            Error::Remote { status, message } => {
                write!(f, "remote service returned {status}: {message}")
            }
            Error::RegistryAuthentication { registry } => {
                write!(
                    f,
                    "not authenticated with '{registry}': obtain a token for it and store it \
           with registry_auth, or opt into anonymous access"
                )
            }
            Error::Timeout {
                operation_id,
                max_wait,
            } => {
                write!(
                    f,
                    "operation {operation_id} timed out after {:.1}s",
                    max_wait.as_secs_f64()
                )
            }
        }
    }
}

impl std::error::Error for Error {}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Error {
        Error::Protocol(format!("invalid JSON: {err}"))
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Error {
        Error::Persistence(err.to_string())
    }
}
