// Copyright 2025 Vessel project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::io::Write;
use std::path::Path;
use std::time::Duration;

use bytes::Bytes;
use futures::{Stream, StreamExt};
use tempfile::NamedTempFile;
use tokio::sync::mpsc;

use protocol::{Error, Result};

/// Chunks buffered between the async producer and the blocking writer.
const QUEUE_CAPACITY: usize = 16;

/// How long the producer waits for queue capacity before re-checking. The
/// writer draining the queue is what actually makes progress; this bound
/// exists only as defense in depth against a wedged writer thread.
const QUEUE_SEND_TIMEOUT: Duration = Duration::from_secs(1);

///
/// Write a stream of byte chunks to `destination` atomically.
///
/// The chunks pass through a bounded queue to a blocking writer on a worker
/// thread, which writes a `.download-*.tmp` sibling of the destination.
/// Only a fully-written file is renamed into place: on any error, both the
/// temp file and a pre-existing destination are left exactly as they were
/// (the former deleted, the latter untouched).
///
/// Returns the total number of bytes written.
///
pub async fn write_stream_to_file<S>(destination: &Path, mut stream: S) -> Result<u64>
where
    S: Stream<Item = Result<Bytes>> + Unpin,
{
    let parent = destination.parent().ok_or_else(|| {
        Error::InvalidArgument(format!(
            "download destination {} has no parent directory",
            destination.display()
        ))
    })?;

    let tmp = tempfile::Builder::new()
        .prefix(".download-")
        .suffix(".tmp")
        .tempfile_in(parent)?;

    let (tx, mut rx) = mpsc::channel::<Bytes>(QUEUE_CAPACITY);
    let writer = tokio::task::spawn_blocking(move || -> std::io::Result<(NamedTempFile, u64)> {
        let mut tmp = tmp;
        let mut total = 0_u64;
        while let Some(chunk) = rx.blocking_recv() {
            tmp.as_file_mut().write_all(&chunk)?;
            total += chunk.len() as u64;
        }
        tmp.as_file_mut().flush()?;
        Ok((tmp, total))
    });

    let mut stream_error = None;
    'produce: while let Some(chunk) = stream.next().await {
        let chunk = match chunk {
            Ok(chunk) => chunk,
            Err(err) => {
                stream_error = Some(err);
                break;
            }
        };

        let permit = loop {
            match tokio::time::timeout(QUEUE_SEND_TIMEOUT, tx.reserve()).await {
                Ok(Ok(permit)) => break permit,
                // The writer is gone; its error is surfaced below.
                Ok(Err(_)) => break 'produce,
                // Circuit breaker expired with the queue still full: keep
                // waiting for the writer rather than deadlocking silently.
                Err(_) => {}
            }
        };
        permit.send(chunk);
    }
    drop(tx);

    let writer_result = writer
        .await
        .map_err(|e| Error::Persistence(format!("download writer task failed: {e}")))?;

    match (stream_error, writer_result) {
        (Some(err), result) => {
            // Dropping the temp file (if the writer finished) unlinks it;
            // the caller sees the original stream error.
            drop(result);
            Err(err)
        }
        (None, Err(io_err)) => Err(Error::Persistence(format!(
            "failed to write {}: {io_err}",
            destination.display()
        ))),
        (None, Ok((tmp, total))) => {
            tmp.persist(destination).map_err(|e| {
                Error::Persistence(format!(
                    "failed to move download into place at {}: {}",
                    destination.display(),
                    e.error
                ))
            })?;
            Ok(total)
        }
    }
}
