//! Symmetric primitives behind the certificate formats.
//!
//! Intention:
//! * Derive fixed-size keys and nonces from short secrets with HKDF-SHA256.
//! * Encrypt the 14-byte metadata encryption key with AES-256-CTR keyed by the
//!   certificate secret key and an IV derived from a 2-byte salt.
//! * Encrypt device metadata with AES-256-GCM under keys derived from the
//!   metadata encryption key and the secret key.
//! * Tag the metadata encryption key with HMAC-SHA256 so the verifier can tell
//!   a correct trial decryption from noise.

use crate::constants::{
    AES_CTR_IV_LEN, AES_GCM_KEY_LEN, AES_GCM_NONCE_LEN, AUTHENTICATION_TOKEN_HASH_LEN,
    METADATA_KEY_TAG_LEN,
};
use crate::error::{CertificateError, Result};
use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::aes::Aes256;
use aes_gcm::{Aes256Gcm, Nonce};
use ctr::cipher::{KeyIvInit, StreamCipher};
use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use rand::{Rng, RngCore};
use sha2::{Digest, Sha256};

type Aes256Ctr = ctr::Ctr128BE<Aes256>;
type HmacSha256 = Hmac<Sha256>;

/* -------------------------------------------------------------------------
 * Randomness
 * ---------------------------------------------------------------------- */

pub fn random_bytes(len: usize) -> Vec<u8> {
    let mut out = vec![0u8; len];
    rand::thread_rng().fill_bytes(&mut out);
    out
}

/// Uniform value in `[0, upper)`; returns 0 when `upper` is 0.
pub fn random_below(upper: u64) -> u64 {
    if upper == 0 {
        return 0;
    }
    rand::thread_rng().gen_range(0..upper)
}

/* -------------------------------------------------------------------------
 * Hashing and key derivation
 * ---------------------------------------------------------------------- */

pub fn sha256(data: &[u8]) -> Vec<u8> {
    Sha256::digest(data).to_vec()
}

/// HKDF-SHA256 with no salt and empty info, producing `len` bytes.
pub fn derive_key(ikm: &[u8], len: usize) -> Result<Vec<u8>> {
    let hk = Hkdf::<Sha256>::new(None, ikm);
    let mut okm = vec![0u8; len];
    hk.expand(&[], &mut okm)?;
    Ok(okm)
}

/// 6-byte hash of an authentication token keyed by a certificate secret key.
pub fn hash_authentication_token(secret_key: &[u8], token: &[u8]) -> Result<Vec<u8>> {
    let hk = Hkdf::<Sha256>::new(Some(secret_key), token);
    let mut okm = vec![0u8; AUTHENTICATION_TOKEN_HASH_LEN];
    hk.expand(&[], &mut okm)?;
    Ok(okm)
}

/* -------------------------------------------------------------------------
 * Metadata encryption key (AES-256-CTR)
 * ---------------------------------------------------------------------- */

/// CTR mode is symmetric, so the same call both encrypts and decrypts.
pub fn apply_metadata_key_cipher(secret_key: &[u8], salt: &[u8], data: &[u8]) -> Result<Vec<u8>> {
    let iv = derive_key(salt, AES_CTR_IV_LEN)?;
    let mut cipher = Aes256Ctr::new_from_slices(secret_key, &iv).map_err(|e| {
        CertificateError::Encryption(format!("AES-CTR init failed: {e}"))
    })?;
    let mut buf = data.to_vec();
    cipher.apply_keystream(&mut buf);
    Ok(buf)
}

/* -------------------------------------------------------------------------
 * Metadata (AES-256-GCM)
 * ---------------------------------------------------------------------- */

fn metadata_cipher(metadata_encryption_key: &[u8]) -> Result<Aes256Gcm> {
    let key = derive_key(metadata_encryption_key, AES_GCM_KEY_LEN)?;
    Aes256Gcm::new_from_slice(&key)
        .map_err(|e| CertificateError::Encryption(format!("AES init failed: {e}")))
}

pub fn encrypt_metadata(
    metadata_encryption_key: &[u8],
    secret_key: &[u8],
    plaintext: &[u8],
) -> Result<Vec<u8>> {
    let cipher = metadata_cipher(metadata_encryption_key)?;
    let nonce = derive_key(secret_key, AES_GCM_NONCE_LEN)?;
    cipher
        .encrypt(Nonce::from_slice(&nonce), plaintext)
        .map_err(|e| CertificateError::Encryption(format!("AES-GCM encrypt failed: {e}")))
}

pub fn decrypt_metadata(
    metadata_encryption_key: &[u8],
    secret_key: &[u8],
    ciphertext: &[u8],
) -> Result<Vec<u8>> {
    let cipher = metadata_cipher(metadata_encryption_key)?;
    let nonce = derive_key(secret_key, AES_GCM_NONCE_LEN)?;
    cipher
        .decrypt(Nonce::from_slice(&nonce), ciphertext)
        .map_err(|e| CertificateError::Decryption(format!("AES-GCM decrypt failed: {e}")))
}

/* -------------------------------------------------------------------------
 * Metadata key tag (HMAC-SHA256, all-zero key)
 * ---------------------------------------------------------------------- */

fn tag_mac() -> Result<HmacSha256> {
    <HmacSha256 as Mac>::new_from_slice(&[0u8; METADATA_KEY_TAG_LEN])
        .map_err(|e| CertificateError::Encryption(format!("HMAC init failed: {e}")))
}

pub fn compute_metadata_key_tag(metadata_encryption_key: &[u8]) -> Result<Vec<u8>> {
    let mut mac = tag_mac()?;
    mac.update(metadata_encryption_key);
    Ok(mac.finalize().into_bytes().to_vec())
}

/// Constant-time comparison of the tag against the recovered key.
pub fn verify_metadata_key_tag(metadata_encryption_key: &[u8], tag: &[u8]) -> bool {
    match tag_mac() {
        Ok(mut mac) => {
            mac.update(metadata_encryption_key);
            mac.verify_slice(tag).is_ok()
        }
        Err(_) => false,
    }
}
