//! Local-device certificates and their persisted record form.
//!
//! A [`PrivateCertificate`] owns the secret material the device proves
//! possession of: an ECDSA key pair, a 32-byte secret key and a 14-byte
//! metadata encryption key. Its [`PublicCertificate`] projection is what gets
//! uploaded for contacts to download.

use std::collections::BTreeSet;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use prost::Message;
use serde::{Deserialize, Serialize};

use crate::constants::{
    MAX_SALTS, MAX_SALT_GENERATION_RETRIES, MAX_VALIDITY_BOUND_OFFSET,
    METADATA_ENCRYPTION_KEY_LEN, SALT_LEN, SECRET_KEY_LEN, VALIDITY_PERIOD,
};
use crate::crypto;
use crate::encrypted_metadata_key::EncryptedMetadataKey;
use crate::error::{CertificateError, Result};
use crate::key_pair::EcdsaKeyPair;
use crate::proto::{DeviceVisibility, EncryptedMetadata, PublicCertificate, Timestamp};
use crate::validity::{from_unix_nanos, to_unix_nanos};

pub type Salt = [u8; SALT_LEN];

#[derive(Debug, Clone)]
pub struct PrivateCertificate {
    visibility: DeviceVisibility,
    not_before: SystemTime,
    not_after: SystemTime,
    key_pair: EcdsaKeyPair,
    secret_key: Vec<u8>,
    metadata_encryption_key: Vec<u8>,
    id: Vec<u8>,
    unencrypted_metadata: EncryptedMetadata,
    consumed_salts: BTreeSet<Salt>,
}

impl PrivateCertificate {
    /// Generate a certificate with fresh key material valid for
    /// [`VALIDITY_PERIOD`] starting at `not_before`.
    pub fn new(
        visibility: DeviceVisibility,
        not_before: SystemTime,
        unencrypted_metadata: EncryptedMetadata,
    ) -> Self {
        let secret_key = crypto::random_bytes(SECRET_KEY_LEN);
        let id = crypto::sha256(&secret_key);
        Self {
            visibility,
            not_before,
            not_after: not_before + VALIDITY_PERIOD,
            key_pair: EcdsaKeyPair::generate(),
            secret_key,
            metadata_encryption_key: crypto::random_bytes(METADATA_ENCRYPTION_KEY_LEN),
            id,
            unencrypted_metadata,
            consumed_salts: BTreeSet::new(),
        }
    }

    pub fn visibility(&self) -> DeviceVisibility {
        self.visibility
    }

    pub fn not_before(&self) -> SystemTime {
        self.not_before
    }

    pub fn not_after(&self) -> SystemTime {
        self.not_after
    }

    pub fn id(&self) -> &[u8] {
        &self.id
    }

    pub fn secret_key(&self) -> &[u8] {
        &self.secret_key
    }

    pub fn metadata_encryption_key(&self) -> &[u8] {
        &self.metadata_encryption_key
    }

    pub fn unencrypted_metadata(&self) -> &EncryptedMetadata {
        &self.unencrypted_metadata
    }

    pub fn consumed_salts(&self) -> &BTreeSet<Salt> {
        &self.consumed_salts
    }

    pub fn public_key_der(&self) -> Result<Vec<u8>> {
        self.key_pair.public_key_der()
    }

    /// Encrypt the metadata encryption key under a salt never used before by
    /// this certificate. Returns `None` once the salt budget is exhausted.
    ///
    /// The consumed salt is recorded on `self`; callers persist the
    /// certificate afterwards.
    pub fn encrypt_metadata_key(&mut self) -> Option<EncryptedMetadataKey> {
        let salt = self.generate_unused_salt()?;
        let encrypted_key =
            crypto::apply_metadata_key_cipher(&self.secret_key, &salt, &self.metadata_encryption_key)
                .ok()?;
        Some(EncryptedMetadataKey::new(salt.to_vec(), encrypted_key))
    }

    fn generate_unused_salt(&mut self) -> Option<Salt> {
        if self.consumed_salts.len() >= MAX_SALTS {
            return None;
        }
        for _ in 0..MAX_SALT_GENERATION_RETRIES {
            let bytes = crypto::random_bytes(SALT_LEN);
            let salt: Salt = [bytes[0], bytes[1]];
            if self.consumed_salts.insert(salt) {
                return Some(salt);
            }
        }
        None
    }

    /// DER ECDSA signature, `None` if signing fails.
    pub fn sign(&self, payload: &[u8]) -> Option<Vec<u8>> {
        self.key_pair.sign(payload).ok()
    }

    pub fn hash_authentication_token(&self, token: &[u8]) -> Vec<u8> {
        crypto::hash_authentication_token(&self.secret_key, token).unwrap_or_default()
    }

    /// Public projection with independently jittered validity bounds.
    pub fn to_public_certificate(&self) -> Option<PublicCertificate> {
        let max_offset = MAX_VALIDITY_BOUND_OFFSET.as_nanos() as u64;
        let not_before_offset = Duration::from_nanos(crypto::random_below(max_offset));
        let not_after_offset = Duration::from_nanos(crypto::random_below(max_offset));
        self.to_public_certificate_with_offsets(not_before_offset, not_after_offset)
    }

    /// Public projection with caller-chosen offsets; `start = not_before - not_before_offset`
    /// and `end = not_after + not_after_offset`.
    pub fn to_public_certificate_with_offsets(
        &self,
        not_before_offset: Duration,
        not_after_offset: Duration,
    ) -> Option<PublicCertificate> {
        let public_key = self.key_pair.public_key_der().ok()?;
        let encrypted_metadata_bytes = crypto::encrypt_metadata(
            &self.metadata_encryption_key,
            &self.secret_key,
            &self.unencrypted_metadata.encode_to_vec(),
        )
        .ok()?;
        let tag = crypto::compute_metadata_key_tag(&self.metadata_encryption_key).ok()?;

        let start = self
            .not_before
            .checked_sub(not_before_offset)
            .unwrap_or(UNIX_EPOCH);
        let end = self.not_after + not_after_offset;

        Some(PublicCertificate {
            secret_id: self.id.clone(),
            secret_key: self.secret_key.clone(),
            public_key,
            start_time: Some(Timestamp::from_system_time_secs(start)),
            end_time: Some(Timestamp::from_system_time_secs(end)),
            for_selected_contacts: self.visibility == DeviceVisibility::SelectedContacts,
            metadata_encryption_key: self.metadata_encryption_key.clone(),
            encrypted_metadata_bytes,
            metadata_encryption_key_tag: tag,
            for_self_share: self.visibility == DeviceVisibility::SelfShare,
        })
    }

    pub fn to_certificate_data(&self) -> Result<PrivateCertificateData> {
        Ok(PrivateCertificateData {
            visibility: self.visibility as i32,
            not_before_nanos: to_unix_nanos(self.not_before),
            not_after_nanos: to_unix_nanos(self.not_after),
            key_pair: URL_SAFE_NO_PAD.encode(self.key_pair.private_key_der()?),
            secret_key: URL_SAFE_NO_PAD.encode(&self.secret_key),
            metadata_encryption_key: URL_SAFE_NO_PAD.encode(&self.metadata_encryption_key),
            id: URL_SAFE_NO_PAD.encode(&self.id),
            unencrypted_metadata: URL_SAFE_NO_PAD.encode(self.unencrypted_metadata.encode_to_vec()),
            consumed_salts: salts_to_hex(&self.consumed_salts),
        })
    }

    pub fn from_certificate_data(data: &PrivateCertificateData) -> Result<Self> {
        let visibility = DeviceVisibility::try_from(data.visibility).map_err(|_| {
            CertificateError::Serialization(format!("unknown visibility {}", data.visibility))
        })?;
        let key_pair =
            EcdsaKeyPair::from_private_key_der(&URL_SAFE_NO_PAD.decode(&data.key_pair)?)?;
        let secret_key = decode_exact(&data.secret_key, "secret_key", SECRET_KEY_LEN)?;
        let metadata_encryption_key = decode_exact(
            &data.metadata_encryption_key,
            "metadata_encryption_key",
            METADATA_ENCRYPTION_KEY_LEN,
        )?;
        let id = URL_SAFE_NO_PAD.decode(&data.id)?;
        let unencrypted_metadata =
            EncryptedMetadata::decode(URL_SAFE_NO_PAD.decode(&data.unencrypted_metadata)?.as_slice())?;

        Ok(Self {
            visibility,
            not_before: from_unix_nanos(data.not_before_nanos),
            not_after: from_unix_nanos(data.not_after_nanos),
            key_pair,
            secret_key,
            metadata_encryption_key,
            id,
            unencrypted_metadata,
            consumed_salts: salts_from_hex(&data.consumed_salts)?,
        })
    }
}

/// Persisted record of a private certificate. Byte fields are base64url
/// without padding; consumed salts are concatenated hex.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrivateCertificateData {
    pub visibility: i32,
    pub not_before_nanos: i64,
    pub not_after_nanos: i64,
    pub key_pair: String,
    pub secret_key: String,
    pub metadata_encryption_key: String,
    pub id: String,
    pub unencrypted_metadata: String,
    pub consumed_salts: String,
}

fn decode_exact(encoded: &str, field: &'static str, expected: usize) -> Result<Vec<u8>> {
    let bytes = URL_SAFE_NO_PAD.decode(encoded)?;
    if bytes.len() != expected {
        return Err(CertificateError::InvalidLength {
            field,
            expected,
            actual: bytes.len(),
        });
    }
    Ok(bytes)
}

fn salts_to_hex(salts: &BTreeSet<Salt>) -> String {
    salts.iter().map(hex::encode).collect()
}

fn salts_from_hex(encoded: &str) -> Result<BTreeSet<Salt>> {
    let bytes = hex::decode(encoded)?;
    if bytes.len() % SALT_LEN != 0 {
        return Err(CertificateError::InvalidLength {
            field: "consumed_salts",
            expected: (bytes.len() / SALT_LEN + 1) * SALT_LEN,
            actual: bytes.len(),
        });
    }
    Ok(bytes
        .chunks_exact(SALT_LEN)
        .map(|chunk| [chunk[0], chunk[1]])
        .collect())
}
