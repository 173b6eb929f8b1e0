// Copyright 2025 Vessel project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).
use crate::{Digest, Fingerprint, FINGERPRINT_SIZE};
use serde_test::{assert_tokens, Token};

// sha256 of b"hello world", as the remote service would report it.
const HELLO_WORLD_SHA256: &str =
    "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9";

#[test]
fn content_hash_round_trips_through_hex() {
    let digest = Digest::of_bytes(b"hello world");
    let hex = digest.hash.to_hex();
    assert_eq!(hex, HELLO_WORLD_SHA256);
    assert_eq!(Fingerprint::from_hex_string(&hex).unwrap(), digest.hash);
}

#[test]
fn hex_keys_are_lowercase_and_fixed_width() {
    // Upload coalescing uses the hex form as a cache key, so it has to be
    // stable: always lowercase, always 64 characters.
    let hex = Digest::of_bytes(b"cache key material").hash.to_hex();
    assert_eq!(hex.len(), FINGERPRINT_SIZE * 2);
    assert_eq!(hex, hex.to_lowercase());
}

#[test]
fn parsing_accepts_mixed_case() {
    let upper = HELLO_WORLD_SHA256.to_uppercase();
    assert_eq!(
        Fingerprint::from_hex_string(&upper).unwrap().to_hex(),
        HELLO_WORLD_SHA256
    );
}

#[test]
fn malformed_hashes_are_rejected() {
    let too_long = format!("{HELLO_WORLD_SHA256}00");
    let non_hex = "g".repeat(FINGERPRINT_SIZE * 2);
    for bad in ["", "b94d27b9", too_long.as_str(), non_hex.as_str()] {
        Fingerprint::from_hex_string(bad)
            .expect_err(&format!("{bad:?} should not parse as a fingerprint"));
    }
}

#[test]
fn from_str_parses_server_reported_hashes() {
    let fingerprint: Fingerprint = HELLO_WORLD_SHA256.parse().unwrap();
    assert_eq!(fingerprint, Digest::of_bytes(b"hello world").hash);

    let fingerprint = Fingerprint::try_from(HELLO_WORLD_SHA256).unwrap();
    assert_eq!(fingerprint, Digest::of_bytes(b"hello world").hash);
}

#[test]
fn display_matches_the_wire_form() {
    let fingerprint = Digest::of_bytes(b"hello world").hash;
    assert_eq!(format!("{fingerprint}"), HELLO_WORLD_SHA256);
    assert_eq!(
        format!("{fingerprint:?}"),
        format!("Fingerprint<{HELLO_WORLD_SHA256}>")
    );
}

#[test]
fn raw_bytes_round_trip() {
    let digest = Digest::of_bytes(b"raw attachment");
    let restored = Fingerprint::from_bytes_unsafe(digest.hash.as_bytes());
    assert_eq!(restored, digest.hash);
}

#[test]
fn serde_uses_the_hex_string_form() {
    // Fingerprints embedded in cached JSON payloads are stored as their
    // hex string, not as byte arrays.
    let fingerprint = Fingerprint::from_hex_string(HELLO_WORLD_SHA256).unwrap();
    assert_tokens(&fingerprint, &[Token::Str(HELLO_WORLD_SHA256)]);
}
