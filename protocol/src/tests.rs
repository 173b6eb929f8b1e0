// Copyright 2025 Vessel project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::time::Duration;

use crate::{
    Error, OperationKind, OperationResponse, OperationStatus, SpawnResponse, Stream,
};

#[test]
fn status_round_trip() {
    for (status, wire) in [
        (OperationStatus::Pending, "\"PENDING\""),
        (OperationStatus::Executing, "\"EXECUTING\""),
        (OperationStatus::Success, "\"SUCCESS\""),
        (OperationStatus::Failed, "\"FAILED\""),
        (OperationStatus::Cancelled, "\"CANCELLED\""),
    ] {
        assert_eq!(serde_json::to_string(&status).unwrap(), wire);
        assert_eq!(
            serde_json::from_str::<OperationStatus>(wire).unwrap(),
            status
        );
    }
}

#[test]
fn terminal_statuses() {
    assert!(!OperationStatus::Pending.is_terminal());
    assert!(!OperationStatus::Executing.is_terminal());
    assert!(OperationStatus::Success.is_terminal());
    assert!(OperationStatus::Failed.is_terminal());
    assert!(OperationStatus::Cancelled.is_terminal());
}

#[test]
fn operation_kind_wire_names() {
    assert_eq!(
        serde_json::to_string(&OperationKind::ImageImport).unwrap(),
        "\"image_import\""
    );
    assert_eq!(
        serde_json::from_str::<OperationKind>("\"instance\"").unwrap(),
        OperationKind::Instance
    );
}

#[test]
fn operation_response_with_instance_metadata() {
    let raw = serde_json::json!({
        "uuid": "op-123",
        "kind": "instance",
        "status": "SUCCESS",
        "metadata": {
            "command": "echo hello",
            "image": "img-1",
            "result": {
                "state": {"exit_code": 0, "pid": 1, "timed_out": false},
                "stdout": {"value": "hello", "encoding": "ascii"},
                "stderr": {"value": "", "encoding": "ascii"},
                "resources": {"elapsed_time": 1.5},
            },
        },
        "result": {"image": "img-result", "tag": null},
    });

    let op: OperationResponse = serde_json::from_value(raw).unwrap();
    assert_eq!(op.status, OperationStatus::Success);
    let metadata = op.metadata.as_ref().unwrap();
    assert_eq!(metadata.command.as_deref(), Some("echo hello"));
    let result = metadata.result.as_ref().unwrap();
    assert_eq!(result.state.as_ref().unwrap().exit_code, Some(0));
    assert_eq!(result.stdout.as_ref().unwrap().value, "hello");
    assert_eq!(op.result_image(), Some("img-result"));
    assert_eq!(op.result_tag(), None);
}

#[test]
fn operation_response_with_import_metadata() {
    let raw = serde_json::json!({
        "uuid": "op-456",
        "kind": "image_import",
        "status": "SUCCESS",
        "metadata": {
            "registry": {"url": "docker://test"},
            "tag": "imported:v1",
            "timeout": 300,
        },
        "result": {"image": "img-imported", "tag": "imported:v1"},
    });

    let op: OperationResponse = serde_json::from_value(raw).unwrap();
    assert_eq!(op.kind, OperationKind::ImageImport);
    assert_eq!(
        op.metadata.as_ref().unwrap().registry.as_ref().unwrap().url,
        "docker://test"
    );
    assert_eq!(op.result_tag(), Some("imported:v1"));
}

#[test]
fn operation_response_requires_identity_fields() {
    let err = serde_json::from_value::<OperationResponse>(serde_json::json!({"invalid": "data"}))
        .map(|_| ())
        .unwrap_err();
    assert!(err.to_string().contains("missing field"));
}

#[test]
fn spawn_response_empty_uuid_is_absent() {
    let body: SpawnResponse = serde_json::from_str("{\"uuid\": \"\"}").unwrap();
    assert_eq!(body.operation_id(), None);

    let body: SpawnResponse = serde_json::from_str("{}").unwrap();
    assert_eq!(body.operation_id(), None);

    let body: SpawnResponse = serde_json::from_str("{\"uuid\": \"op-1\"}").unwrap();
    assert_eq!(body.operation_id(), Some("op-1"));
}

#[test]
fn stream_base64_round_trip() {
    let stream = Stream::from_bytes(b"\x00\x01binary");
    assert_eq!(stream.encoding, "base64");
    assert_eq!(stream.decoded().unwrap(), b"\x00\x01binary");

    let text = Stream {
        value: "hello".to_owned(),
        encoding: "ascii".to_owned(),
        truncated: false,
    };
    assert_eq!(text.decoded().unwrap(), b"hello");
}

#[test]
fn stream_encoding_defaults_on_decode() {
    let stream: Stream = serde_json::from_str("{\"value\": \"plain\"}").unwrap();
    assert_eq!(stream.encoding, "ascii");
    assert!(!stream.truncated);
}

#[test]
fn error_display() {
    let err = Error::Remote {
        status: 404,
        message: "no such image".to_owned(),
    };
    assert_eq!(err.remote_status(), Some(404));
    assert_eq!(err.to_string(), "remote service returned 404: no such image");

    let err = Error::Timeout {
        operation_id: "op-1".to_owned(),
        max_wait: Duration::from_secs(30),
    };
    assert_eq!(err.to_string(), "operation op-1 timed out after 30.0s");
}
