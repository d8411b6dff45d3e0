//! Verifier-side view of a peer's public certificate.

use std::time::SystemTime;

use prost::Message;

use crate::constants::{CERTIFICATE_ID_LEN, METADATA_KEY_TAG_LEN, SECRET_KEY_LEN};
use crate::crypto;
use crate::encrypted_metadata_key::EncryptedMetadataKey;
use crate::key_pair;
use crate::proto::{EncryptedMetadata, PublicCertificate};

/// A peer certificate that was matched against an advertised
/// [`EncryptedMetadataKey`] and whose metadata decrypted cleanly.
#[derive(Debug, Clone, PartialEq)]
pub struct DecryptedPublicCertificate {
    id: Vec<u8>,
    not_before: SystemTime,
    not_after: SystemTime,
    secret_key: Vec<u8>,
    public_key: Vec<u8>,
    unencrypted_metadata: EncryptedMetadata,
    for_self_share: bool,
}

impl DecryptedPublicCertificate {
    /// Trial-decrypt `public_certificate` with `encrypted_metadata_key`.
    ///
    /// Returns `None` when the key does not belong to this certificate or the
    /// certificate is malformed. Failures are silent because callers try many
    /// certificates in turn.
    pub fn decrypt(
        public_certificate: &PublicCertificate,
        encrypted_metadata_key: &EncryptedMetadataKey,
    ) -> Option<Self> {
        let not_before = public_certificate.start_time?.to_system_time();
        let not_after = public_certificate.end_time?.to_system_time();
        if not_before >= not_after
            || public_certificate.public_key.is_empty()
            || public_certificate.secret_key.len() != SECRET_KEY_LEN
            || public_certificate.secret_id.len() != CERTIFICATE_ID_LEN
            || public_certificate.encrypted_metadata_bytes.is_empty()
            || public_certificate.metadata_encryption_key_tag.len() != METADATA_KEY_TAG_LEN
        {
            return None;
        }

        let metadata_encryption_key = crypto::apply_metadata_key_cipher(
            &public_certificate.secret_key,
            encrypted_metadata_key.salt(),
            encrypted_metadata_key.encrypted_key(),
        )
        .ok()?;
        if !crypto::verify_metadata_key_tag(
            &metadata_encryption_key,
            &public_certificate.metadata_encryption_key_tag,
        ) {
            return None;
        }

        let metadata_bytes = crypto::decrypt_metadata(
            &metadata_encryption_key,
            &public_certificate.secret_key,
            &public_certificate.encrypted_metadata_bytes,
        )
        .ok()?;
        let unencrypted_metadata = EncryptedMetadata::decode(metadata_bytes.as_slice()).ok()?;

        Some(Self {
            id: public_certificate.secret_id.clone(),
            not_before,
            not_after,
            secret_key: public_certificate.secret_key.clone(),
            public_key: public_certificate.public_key.clone(),
            unencrypted_metadata,
            for_self_share: public_certificate.for_self_share,
        })
    }

    pub fn id(&self) -> &[u8] {
        &self.id
    }

    pub fn not_before(&self) -> SystemTime {
        self.not_before
    }

    pub fn not_after(&self) -> SystemTime {
        self.not_after
    }

    pub fn public_key(&self) -> &[u8] {
        &self.public_key
    }

    pub fn unencrypted_metadata(&self) -> &EncryptedMetadata {
        &self.unencrypted_metadata
    }

    pub fn for_self_share(&self) -> bool {
        self.for_self_share
    }

    /// Verify a DER signature with the certificate's public key. Never panics
    /// on malformed input.
    pub fn verify_signature(&self, payload: &[u8], signature: &[u8]) -> bool {
        key_pair::verify_signature(&self.public_key, payload, signature)
    }

    pub fn hash_authentication_token(&self, token: &[u8]) -> Vec<u8> {
        crypto::hash_authentication_token(&self.secret_key, token).unwrap_or_default()
    }
}
