//! Envelope codec: symmetric encryption of byte payloads under a key
//! derived from a secret string.
//!
//! The envelope is `IV(16) || ciphertext` for both cipher paths — there is
//! no algorithm selector byte. Encryption prefers AES-256-CBC with PKCS#7
//! padding and falls back to a repeating-key XOR stream if the cipher
//! cannot be constructed; decryption therefore has to disambiguate by
//! attempting the strong path first and validating the produced content,
//! then trying the fallback. The validator is payload-type-aware (the
//! executable entry point sniffs for `MZ`), which keeps the format
//! byte-compatible at the cost of only being correct for payloads the
//! caller can recognize.

use aes::cipher::{block_padding::Pkcs7, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use log::warn;
use rand::rngs::{OsRng, SmallRng};
use rand::{RngCore, SeedableRng};
use sha2::{Digest, Sha256};

use crate::error::{ProtectError, Result};
use crate::pe::looks_like_executable;

pub const KEY_LEN: usize = 32;
pub const IV_LEN: usize = 16;

pub type Key = [u8; KEY_LEN];

type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;

/// Derives a 32-byte key from a secret string with a single SHA-256 pass.
/// Deterministic by contract; no iteration count (brute-force resistance
/// is out of scope for this format).
pub fn derive_key(secret: &str) -> Key {
    Sha256::digest(secret.as_bytes()).into()
}

/// Where an IV came from. The time-seeded generator is a deliberately
/// weaker, named fallback for environments where the OS random source is
/// unavailable — it is never used while the primary source works.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IvSource {
    OsRandom,
    TimeSeeded,
}

impl IvSource {
    pub fn generate(self) -> [u8; IV_LEN] {
        let mut iv = [0u8; IV_LEN];
        match self {
            IvSource::OsRandom => OsRng.fill_bytes(&mut iv),
            IvSource::TimeSeeded => {
                let nanos = std::time::SystemTime::now()
                    .duration_since(std::time::UNIX_EPOCH)
                    .map(|d| d.as_nanos() as u64)
                    .unwrap_or(0);
                let mut rng = SmallRng::seed_from_u64(nanos ^ u64::from(std::process::id()));
                rng.fill_bytes(&mut iv);
            }
        }
        iv
    }
}

/// Fresh 16-byte IV, one per encryption operation.
pub fn fresh_iv() -> [u8; IV_LEN] {
    let mut iv = [0u8; IV_LEN];
    match OsRng.try_fill_bytes(&mut iv) {
        Ok(()) => iv,
        Err(e) => {
            warn!("OS random source unavailable ({e}), using time-seeded IV generator");
            IvSource::TimeSeeded.generate()
        }
    }
}

/// Repeating-key XOR stream, self-inverting: applying it twice with the
/// same key restores the input.
pub struct XorStream<'k> {
    key: &'k [u8],
    pos: usize,
}

impl<'k> XorStream<'k> {
    pub fn new(key: &'k [u8]) -> Self {
        XorStream { key, pos: 0 }
    }

    pub fn apply_keystream(&mut self, data: &mut [u8]) {
        for byte in data.iter_mut() {
            *byte ^= self.key[self.pos % self.key.len()];
            self.pos += 1;
        }
    }
}

fn xor_transform(data: &[u8], key: &Key) -> Vec<u8> {
    let mut out = data.to_vec();
    XorStream::new(key).apply_keystream(&mut out);
    out
}

fn aes_encrypt(plaintext: &[u8], key: &Key, iv: &[u8; IV_LEN]) -> Result<Vec<u8>> {
    let cipher = Aes256CbcEnc::new_from_slices(key, iv)
        .map_err(|_| ProtectError::Format("bad cipher parameters"))?;
    Ok(cipher.encrypt_padded_vec_mut::<Pkcs7>(plaintext))
}

fn aes_decrypt(ciphertext: &[u8], key: &Key, iv: &[u8; IV_LEN]) -> Result<Vec<u8>> {
    let cipher = Aes256CbcDec::new_from_slices(key, iv)
        .map_err(|_| ProtectError::Format("bad cipher parameters"))?;
    cipher
        .decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
        .map_err(|_| ProtectError::Integrity)
}

/// Encrypts a payload into an `IV || ciphertext` envelope. A fresh IV is
/// generated for every call; if the strong cipher cannot be constructed
/// the payload is XOR-folded against the repeating key instead, under the
/// identical container layout.
pub fn encrypt(plaintext: &[u8], key: &Key) -> Vec<u8> {
    let iv = fresh_iv();
    let body = match aes_encrypt(plaintext, key, &iv) {
        Ok(ciphertext) => ciphertext,
        Err(e) => {
            warn!("strong cipher unavailable ({e}), falling back to keystream cipher");
            xor_transform(plaintext, key)
        }
    };
    let mut envelope = Vec::with_capacity(IV_LEN + body.len());
    envelope.extend_from_slice(&iv);
    envelope.extend_from_slice(&body);
    envelope
}

/// Decrypts an envelope, disambiguating the cipher path by validating the
/// produced content: AES-CBC first, then the XOR fallback. Fails with an
/// integrity error when neither path yields content the validator accepts.
pub fn decrypt_with<F>(envelope: &[u8], key: &Key, validate: F) -> Result<Vec<u8>>
where
    F: Fn(&[u8]) -> bool,
{
    if envelope.len() < IV_LEN {
        return Err(ProtectError::Integrity);
    }
    let mut iv = [0u8; IV_LEN];
    iv.copy_from_slice(&envelope[..IV_LEN]);
    let body = &envelope[IV_LEN..];

    if let Ok(plaintext) = aes_decrypt(body, key, &iv) {
        if validate(&plaintext) {
            return Ok(plaintext);
        }
    }

    let plaintext = xor_transform(body, key);
    if validate(&plaintext) {
        return Ok(plaintext);
    }

    Err(ProtectError::Integrity)
}

/// Envelope decryption for executable payloads: the validator is the
/// two-byte `MZ` sniff.
pub fn decrypt_executable(envelope: &[u8], key: &Key) -> Result<Vec<u8>> {
    decrypt_with(envelope, key, looks_like_executable)
}
