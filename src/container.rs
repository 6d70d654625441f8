//! Protected container: binds an encryption envelope to one machine.
//!
//! Layout: `magic(8) || fingerprint_len(4, LE) || fingerprint || envelope`.
//! Opening fails closed — the embedded fingerprint is compared against the
//! fresh one before any cipher work happens, so a mismatch never reveals
//! whether the ciphertext itself was well-formed.

use log::debug;

use crate::error::{ProtectError, Result};
use crate::pe::{read_u32, write_u32};

pub const CONTAINER_MAGIC: &[u8; 8] = b"HWBOUND1";
const LEN_FIELD_SIZE: usize = 4;
/// Sanity cap on the fingerprint length field.
const MAX_FINGERPRINT_LEN: u32 = 256;

/// Wraps an envelope with the container header for the given fingerprint.
pub fn seal(envelope: &[u8], fingerprint: &str) -> Vec<u8> {
    let fp = fingerprint.as_bytes();
    let mut out = Vec::with_capacity(CONTAINER_MAGIC.len() + LEN_FIELD_SIZE + fp.len() + envelope.len());
    out.extend_from_slice(CONTAINER_MAGIC);
    let mut len_field = [0u8; LEN_FIELD_SIZE];
    write_u32(&mut len_field, 0, fp.len() as u32);
    out.extend_from_slice(&len_field);
    out.extend_from_slice(fp);
    out.extend_from_slice(envelope);
    out
}

/// Validates the header and the machine binding, returning the envelope
/// bytes. The fingerprint check runs before anything touches the
/// ciphertext; a mismatch is an authorization failure, distinct from a
/// decryption (integrity) failure.
pub fn open<'a>(container: &'a [u8], current_fingerprint: &str) -> Result<&'a [u8]> {
    let magic_len = CONTAINER_MAGIC.len();
    if container.len() < magic_len + LEN_FIELD_SIZE {
        return Err(ProtectError::Format("container too small for its header"));
    }
    if &container[..magic_len] != CONTAINER_MAGIC {
        return Err(ProtectError::Format("missing container magic"));
    }
    let fp_len = read_u32(container, magic_len)?;
    if fp_len == 0 || fp_len > MAX_FINGERPRINT_LEN {
        return Err(ProtectError::Format("implausible fingerprint length"));
    }
    let header_len = magic_len + LEN_FIELD_SIZE + fp_len as usize;
    if container.len() < header_len {
        return Err(ProtectError::Format("container truncated inside header"));
    }
    let embedded = std::str::from_utf8(&container[magic_len + LEN_FIELD_SIZE..header_len])
        .map_err(|_| ProtectError::Format("fingerprint field is not text"))?;

    if embedded != current_fingerprint {
        debug!(
            "container bound to {}…, this machine is {}…",
            &embedded[..embedded.len().min(16)],
            &current_fingerprint[..current_fingerprint.len().min(16)]
        );
        return Err(ProtectError::Authorization);
    }

    Ok(&container[header_len..])
}
