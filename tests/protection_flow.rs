//! End-to-end protection scenarios over the portable engine surface.

mod common;

use common::one_kib_payload;
use hw_protector::container;
use hw_protector::crypto::{decrypt_executable, derive_key, encrypt};
use hw_protector::embedder;
use hw_protector::error::ProtectError;
use hw_protector::fingerprint::fingerprint_from_parts;

fn fingerprint_a() -> String {
    fingerprint_from_parts("BOARD-AAAA", "DISK-1111", "CPU-2222")
}

fn fingerprint_b() -> String {
    fingerprint_from_parts("BOARD-BBBB", "DISK-3333", "CPU-4444")
}

#[test]
fn one_kib_executable_round_trips_under_a_fingerprint() {
    let payload = one_kib_payload();
    let fp = fingerprint_a();
    assert_eq!(fp.len(), 64);

    let key = derive_key(&fp);
    let envelope = encrypt(&payload, &key);
    let restored = decrypt_executable(&envelope, &key).unwrap();
    assert_eq!(restored, payload);
}

#[test]
fn decryption_under_a_different_fingerprint_fails() {
    let payload = one_kib_payload();
    let envelope = encrypt(&payload, &derive_key(&fingerprint_a()));
    let err = decrypt_executable(&envelope, &derive_key(&fingerprint_b())).unwrap_err();
    assert!(matches!(err, ProtectError::Integrity));
}

#[test]
fn container_binds_the_envelope_to_one_machine() {
    let payload = one_kib_payload();
    let fp_a = fingerprint_a();
    let fp_b = fingerprint_b();

    let envelope = encrypt(&payload, &derive_key(&fp_a));
    let sealed = container::seal(&envelope, &fp_a);

    // Right machine: envelope comes back out and decrypts.
    let opened = container::open(&sealed, &fp_a).unwrap();
    let restored = decrypt_executable(opened, &derive_key(&fp_a)).unwrap();
    assert_eq!(restored, payload);

    // Wrong machine: authorization failure before any cipher work, even
    // though the ciphertext itself is intact and decryptable.
    assert!(matches!(
        container::open(&sealed, &fp_b),
        Err(ProtectError::Authorization)
    ));
}

#[test]
fn wrapper_file_carries_and_releases_its_payload() {
    let payload = one_kib_payload();
    let fp = fingerprint_a();

    // The host's own bytes include a decoy marker; the trailer scan must
    // latch onto the appended one.
    let mut host = b"MZ".to_vec();
    host.extend_from_slice(&[0x90; 700]);
    host.extend_from_slice(embedder::TRAILER_MARKER);
    host.extend_from_slice(&[0x90; 300]);

    let wrapper = embedder::create_embedded(&host, &payload, &fp);
    assert!(wrapper.len() > host.len() + payload.len());

    let restored = embedder::unwrap_embedded(&wrapper, &fp).unwrap();
    assert_eq!(restored, payload);

    assert!(matches!(
        embedder::unwrap_embedded(&wrapper, &fingerprint_b()),
        Err(ProtectError::Authorization)
    ));
}

#[test]
fn protected_file_flow_over_the_filesystem() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("app.exe");
    let bound = dir.path().join("app.bound");
    std::fs::write(&input, one_kib_payload()).unwrap();

    let fp = fingerprint_a();
    hw_protector::protector::protect_file(&input, &bound, &fp).unwrap();

    let sealed = std::fs::read(&bound).unwrap();
    let envelope = container::open(&sealed, &fp).unwrap();
    let restored = decrypt_executable(envelope, &derive_key(&fp)).unwrap();
    assert_eq!(restored, one_kib_payload());
}
