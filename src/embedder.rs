//! Single-file wrapper format: a runnable host image with an encrypted
//! payload appended as a trailer.
//!
//! Trailer layout: `marker || key_hash(64 hex) || payload_size(8, LE) ||
//! envelope`. The host image's length is unknown a priori, so extraction
//! scans for the **last** marker occurrence from the end of the file — a
//! host whose own bytes happen to contain the marker earlier must not
//! confuse it.

use log::{debug, warn};
use sha2::{Digest, Sha256};

use crate::crypto::{self, derive_key};
use crate::error::{ProtectError, Result};

pub const TRAILER_MARKER: &[u8] = b"HWBIND_EMBEDDED_V1";
const KEY_HASH_LEN: usize = 64;
const SIZE_FIELD_LEN: usize = 8;

/// SHA-256 of the secret, hex-rendered — the trailer's verification hash.
pub fn key_hash(secret: &str) -> String {
    hex::encode(Sha256::digest(secret.as_bytes()))
}

/// Extracted trailer: the verification hash and the envelope bytes.
pub struct EmbeddedPayload<'a> {
    pub key_hash: &'a str,
    pub envelope: &'a [u8],
}

/// Builds a wrapper file: the host image followed by the trailer carrying
/// the payload encrypted under `secret`.
pub fn create_embedded(host_image: &[u8], payload: &[u8], secret: &str) -> Vec<u8> {
    let envelope = crypto::encrypt(payload, &derive_key(secret));
    let hash = key_hash(secret);

    let mut out = Vec::with_capacity(
        host_image.len() + TRAILER_MARKER.len() + KEY_HASH_LEN + SIZE_FIELD_LEN + envelope.len(),
    );
    out.extend_from_slice(host_image);
    out.extend_from_slice(TRAILER_MARKER);
    out.extend_from_slice(hash.as_bytes());
    out.extend_from_slice(&(envelope.len() as u64).to_le_bytes());
    out.extend_from_slice(&envelope);
    out
}

/// Locates the trailer (last marker occurrence) and validates its frame.
pub fn extract(image: &[u8]) -> Result<EmbeddedPayload<'_>> {
    let marker_pos = image
        .windows(TRAILER_MARKER.len())
        .rposition(|w| w == TRAILER_MARKER)
        .ok_or(ProtectError::Format("no embedded-payload marker"))?;
    debug!("embedded-payload marker at offset {marker_pos}");

    let hash_start = marker_pos + TRAILER_MARKER.len();
    let size_start = hash_start + KEY_HASH_LEN;
    let data_start = size_start + SIZE_FIELD_LEN;
    if image.len() < data_start {
        return Err(ProtectError::Format("trailer truncated before payload"));
    }

    let key_hash = std::str::from_utf8(&image[hash_start..size_start])
        .map_err(|_| ProtectError::Format("trailer key hash is not text"))?;

    let mut size_bytes = [0u8; SIZE_FIELD_LEN];
    size_bytes.copy_from_slice(&image[size_start..data_start]);
    let payload_size = u64::from_le_bytes(size_bytes) as usize;

    let envelope = image
        .get(data_start..data_start + payload_size)
        .ok_or(ProtectError::Format("payload extends beyond file"))?;

    Ok(EmbeddedPayload { key_hash, envelope })
}

/// Verifies the machine binding via the trailer's key hash and decrypts
/// the embedded executable.
pub fn unwrap_embedded(image: &[u8], secret: &str) -> Result<Vec<u8>> {
    let payload = extract(image)?;
    let current = key_hash(secret);
    if payload.key_hash != current {
        warn!(
            "embedded key hash {}… does not match this machine",
            &payload.key_hash[..payload.key_hash.len().min(16)]
        );
        return Err(ProtectError::Authorization);
    }
    crypto::decrypt_executable(payload.envelope, &derive_key(secret))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn host_with_decoy() -> Vec<u8> {
        // A fake host image that embeds the marker bytes in its middle —
        // extraction must skip past it to the real trailer.
        let mut host = b"MZ".to_vec();
        host.extend_from_slice(&[0x90; 300]);
        host.extend_from_slice(TRAILER_MARKER);
        host.extend_from_slice(&[0xCC; 200]);
        host
    }

    #[test]
    fn round_trip_through_wrapper() {
        let payload = {
            let mut p = b"MZ".to_vec();
            p.extend_from_slice(&[0xAB; 500]);
            p
        };
        let wrapper = create_embedded(&host_with_decoy(), &payload, "secret phrase");
        let out = unwrap_embedded(&wrapper, "secret phrase").unwrap();
        assert_eq!(out, payload);
    }

    #[test]
    fn finds_last_marker_not_first() {
        let host = host_with_decoy();
        let wrapper = create_embedded(&host, b"MZ payload", "k");
        let extracted = extract(&wrapper).unwrap();
        // The decoy marker sits well before the host image ends; the real
        // one starts exactly at the host boundary.
        assert_eq!(extracted.key_hash, key_hash("k"));
        let marker_pos = wrapper
            .windows(TRAILER_MARKER.len())
            .rposition(|w| w == TRAILER_MARKER)
            .unwrap();
        assert_eq!(marker_pos, host.len());
    }

    #[test]
    fn wrong_secret_is_an_authorization_failure() {
        let wrapper = create_embedded(&host_with_decoy(), b"MZ payload", "right");
        assert!(matches!(
            unwrap_embedded(&wrapper, "wrong"),
            Err(ProtectError::Authorization)
        ));
    }

    #[test]
    fn missing_marker_is_a_format_failure() {
        let image = vec![0u8; 4096];
        assert!(matches!(
            extract(&image),
            Err(ProtectError::Format(_))
        ));
    }

    #[test]
    fn truncated_trailer_is_a_format_failure() {
        let wrapper = create_embedded(&host_with_decoy(), b"MZ payload", "k");
        let cut = wrapper.len() - 4;
        assert!(matches!(
            extract(&wrapper[..cut]),
            Err(ProtectError::Format(_))
        ));
    }
}
