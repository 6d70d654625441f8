//! Top-level protection flows: encrypt/decrypt files under a secret,
//! machine-bound protected containers, and the gated decrypt-and-execute
//! sequences.

use std::fs;
use std::path::Path;

use log::{info, warn};

use crate::anti_debug::ensure_untampered;
use crate::container;
use crate::crypto::{decrypt_executable, derive_key, encrypt};
use crate::embedder;
use crate::error::{ProtectError, Result};
use crate::fingerprint::generate_fingerprint;
use crate::pe::looks_like_executable;
use crate::runner;

/// Compares a caller-supplied fingerprint against a fresh one for this
/// machine.
pub fn verify_hardware_key(key_to_verify: &str) -> bool {
    match generate_fingerprint() {
        Ok(current) => !current.is_empty() && key_to_verify == current,
        Err(e) => {
            warn!("could not compute fingerprint for verification: {e}");
            false
        }
    }
}

/// Encrypts a file into a plain `IV || ciphertext` envelope under a
/// secret string (a password or a fingerprint).
pub fn encrypt_file<P: AsRef<Path>>(input: P, output: P, secret: &str) -> Result<()> {
    let data = fs::read(&input)?;
    if data.is_empty() {
        return Err(ProtectError::Format("input file is empty"));
    }
    if !looks_like_executable(&data) {
        warn!(
            "{} does not start with the executable magic; encrypting anyway",
            input.as_ref().display()
        );
    }
    let envelope = encrypt(&data, &derive_key(secret));
    fs::write(&output, envelope)?;
    info!(
        "encrypted {} -> {}",
        input.as_ref().display(),
        output.as_ref().display()
    );
    Ok(())
}

/// Decrypts a plain envelope file back to an executable image on disk.
pub fn decrypt_file<P: AsRef<Path>>(input: P, output: P, secret: &str) -> Result<()> {
    let envelope = fs::read(&input)?;
    let plain = decrypt_executable(&envelope, &derive_key(secret))?;
    fs::write(&output, plain)?;
    info!(
        "decrypted {} -> {}",
        input.as_ref().display(),
        output.as_ref().display()
    );
    Ok(())
}

/// Encrypts a file into a machine-bound protected container for the given
/// fingerprint.
pub fn protect_file<P: AsRef<Path>>(input: P, output: P, fingerprint: &str) -> Result<()> {
    let data = fs::read(&input)?;
    if data.is_empty() {
        return Err(ProtectError::Format("input file is empty"));
    }
    if !looks_like_executable(&data) {
        warn!(
            "{} does not start with the executable magic; protecting anyway",
            input.as_ref().display()
        );
    }
    let envelope = encrypt(&data, &derive_key(fingerprint));
    let sealed = container::seal(&envelope, fingerprint);
    fs::write(&output, sealed)?;
    info!(
        "protected {} -> {} ({} bytes)",
        input.as_ref().display(),
        output.as_ref().display(),
        fs::metadata(&output)?.len()
    );
    Ok(())
}

/// Encrypts a file into a container bound to *this* machine.
pub fn protect_file_for_this_machine<P: AsRef<Path>>(input: P, output: P) -> Result<()> {
    let fingerprint = generate_fingerprint()?;
    protect_file(input, output, &fingerprint)
}

/// The protected execution sequence: anti-tamper gate, container open
/// (fingerprint check before any cipher work), in-memory decryption, and
/// execution without the plaintext touching disk.
pub fn execute_protected<P: AsRef<Path>>(path: P, args: &[String]) -> Result<i32> {
    ensure_untampered()?;

    let sealed = fs::read(&path)?;
    let current = generate_fingerprint()?;
    let envelope = container::open(&sealed, &current)?;
    let image = decrypt_executable(envelope, &derive_key(&current))?;
    if !looks_like_executable(&image) {
        return Err(ProtectError::Integrity);
    }
    info!("authorized for this machine, executing from memory");
    runner::execute_from_memory(&image, args)
}

/// Decrypts a plain envelope to a temporary file, runs it, waits, and
/// removes the file — the caller opted into a disk-visible run.
pub fn decrypt_and_run<P: AsRef<Path>>(path: P, secret: &str, args: &[String]) -> Result<i32> {
    ensure_untampered()?;
    let envelope = fs::read(&path)?;
    let image = decrypt_executable(&envelope, &derive_key(secret))?;
    runner::execute_via_temp_file(&image, args)
}

/// Same as [`decrypt_and_run`], keyed by this machine's fingerprint.
pub fn decrypt_and_run_with_hardware_key<P: AsRef<Path>>(path: P, args: &[String]) -> Result<i32> {
    let fingerprint = generate_fingerprint()?;
    decrypt_and_run(path, &fingerprint, args)
}

/// Builds a single-file wrapper: host program bytes with the encrypted
/// payload appended as a trailer bound to the given secret.
pub fn embed_file<P: AsRef<Path>>(host: P, payload: P, output: P, secret: &str) -> Result<()> {
    let host_image = fs::read(&host)?;
    let payload_data = fs::read(&payload)?;
    if payload_data.is_empty() {
        return Err(ProtectError::Format("payload file is empty"));
    }
    let combined = embedder::create_embedded(&host_image, &payload_data, secret);
    fs::write(&output, combined)?;
    info!(
        "embedded {} into {} -> {}",
        payload.as_ref().display(),
        host.as_ref().display(),
        output.as_ref().display()
    );
    Ok(())
}

/// Runs the payload embedded in a wrapper file after the key-hash gate
/// passes for this machine.
pub fn run_embedded<P: AsRef<Path>>(path: P, args: &[String]) -> Result<i32> {
    ensure_untampered()?;
    let wrapper = fs::read(&path)?;
    let fingerprint = generate_fingerprint()?;
    let image = embedder::unwrap_embedded(&wrapper, &fingerprint)?;
    runner::execute_from_memory(&image, args)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn fake_exe() -> Vec<u8> {
        let mut data = b"MZ".to_vec();
        data.extend(std::iter::repeat(0x90).take(1022));
        data
    }

    #[test]
    fn file_envelope_round_trip() {
        let dir = tempdir().unwrap();
        let input = dir.path().join("payload.exe");
        let encrypted = dir.path().join("payload.enc");
        let restored = dir.path().join("restored.exe");
        fs::write(&input, fake_exe()).unwrap();

        encrypt_file(&input, &encrypted, "a password").unwrap();
        assert_ne!(fs::read(&encrypted).unwrap(), fake_exe());
        decrypt_file(&encrypted, &restored, "a password").unwrap();
        assert_eq!(fs::read(&restored).unwrap(), fake_exe());
    }

    #[test]
    fn wrong_secret_fails_file_decryption() {
        let dir = tempdir().unwrap();
        let input = dir.path().join("payload.exe");
        let encrypted = dir.path().join("payload.enc");
        let restored = dir.path().join("restored.exe");
        fs::write(&input, fake_exe()).unwrap();

        encrypt_file(&input, &encrypted, "right").unwrap();
        let err = decrypt_file(&encrypted, &restored, "wrong").unwrap_err();
        assert!(matches!(err, ProtectError::Integrity));
        assert!(!restored.exists());
    }

    #[test]
    fn empty_input_is_rejected() {
        let dir = tempdir().unwrap();
        let input = dir.path().join("empty.exe");
        let output = dir.path().join("out.enc");
        fs::write(&input, b"").unwrap();
        assert!(matches!(
            encrypt_file(&input, &output, "k"),
            Err(ProtectError::Format(_))
        ));
    }

    #[test]
    fn container_flow_rejects_other_machines() {
        let dir = tempdir().unwrap();
        let input = dir.path().join("payload.exe");
        let sealed = dir.path().join("payload.bound");
        fs::write(&input, fake_exe()).unwrap();

        let other = "f".repeat(64);
        protect_file(&input, &sealed, &other).unwrap();

        // Executing requires this machine's fingerprint to equal the
        // sealed one, which it cannot.
        match execute_protected(&sealed, &[]) {
            Err(ProtectError::Authorization) | Err(ProtectError::Fingerprint(_)) => {}
            other => panic!("expected authorization failure, got {other:?}"),
        }
    }

    #[test]
    fn verify_hardware_key_rejects_foreign_keys() {
        assert!(!verify_hardware_key(&"0".repeat(64)));
    }
}
