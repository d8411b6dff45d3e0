//! ECDSA P-256 signing keys for private certificates.

use p256::ecdsa::signature::{Signer, Verifier};
use p256::ecdsa::{Signature, SigningKey, VerifyingKey};
use pkcs8::{DecodePrivateKey, DecodePublicKey, EncodePrivateKey, EncodePublicKey};

use crate::error::{CertificateError, Result};

/// ECDSA P-256 key pair owned by a private certificate
#[derive(Debug, Clone)]
pub struct EcdsaKeyPair {
    signing_key: SigningKey,
    verifying_key: VerifyingKey,
}

impl EcdsaKeyPair {
    /// Generate a new ECDSA P-256 key pair
    pub fn generate() -> Self {
        Self::from_signing_key(SigningKey::random(&mut rand::thread_rng()))
    }

    pub fn from_signing_key(signing_key: SigningKey) -> Self {
        let verifying_key = VerifyingKey::from(&signing_key);
        Self {
            signing_key,
            verifying_key,
        }
    }

    /// Restore from a PKCS#8 DER private key
    pub fn from_private_key_der(der: &[u8]) -> Result<Self> {
        let signing_key = SigningKey::from_pkcs8_der(der).map_err(|e| {
            CertificateError::InvalidKeyFormat(format!("PKCS#8 decoding error: {e}"))
        })?;
        Ok(Self::from_signing_key(signing_key))
    }

    /// Get private key in PKCS#8 DER format
    pub fn private_key_der(&self) -> Result<Vec<u8>> {
        self.signing_key
            .to_pkcs8_der()
            .map(|der| der.as_bytes().to_vec())
            .map_err(|e| CertificateError::InvalidKeyFormat(format!("PKCS#8 encoding error: {e}")))
    }

    /// Get public key as SubjectPublicKeyInfo DER
    pub fn public_key_der(&self) -> Result<Vec<u8>> {
        self.verifying_key
            .to_public_key_der()
            .map(|der| der.as_bytes().to_vec())
            .map_err(|e| {
                CertificateError::InvalidKeyFormat(format!("Public key DER encoding error: {e}"))
            })
    }

    /// DER-encoded ECDSA-SHA256 signature over `payload`
    pub fn sign(&self, payload: &[u8]) -> Result<Vec<u8>> {
        let signature: Signature = self
            .signing_key
            .try_sign(payload)
            .map_err(|e| CertificateError::Signature(format!("signing failed: {e}")))?;
        Ok(signature.to_der().as_bytes().to_vec())
    }
}

/// Verify a DER signature against an SPKI DER public key. Malformed input
/// yields `false`.
pub fn verify_signature(public_key_der: &[u8], payload: &[u8], signature_der: &[u8]) -> bool {
    let Ok(verifying_key) = VerifyingKey::from_public_key_der(public_key_der) else {
        return false;
    };
    let Ok(signature) = Signature::from_der(signature_der) else {
        return false;
    };
    verifying_key.verify(payload, &signature).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signature_verifies_with_exported_public_key() {
        let key_pair = EcdsaKeyPair::generate();
        let public_key = key_pair.public_key_der().unwrap();
        let signature = key_pair.sign(b"payload").unwrap();

        assert!(verify_signature(&public_key, b"payload", &signature));
        assert!(!verify_signature(&public_key, b"other payload", &signature));
    }

    #[test]
    fn malformed_inputs_do_not_verify() {
        let key_pair = EcdsaKeyPair::generate();
        let public_key = key_pair.public_key_der().unwrap();
        let signature = key_pair.sign(b"payload").unwrap();

        assert!(!verify_signature(b"not a key", b"payload", &signature));
        assert!(!verify_signature(&public_key, b"payload", &[0u8; 72]));
        assert!(!verify_signature(&[], b"payload", &[]));
    }

    #[test]
    fn private_key_der_restores_same_identity() {
        let key_pair = EcdsaKeyPair::generate();
        let restored =
            EcdsaKeyPair::from_private_key_der(&key_pair.private_key_der().unwrap()).unwrap();
        assert_eq!(
            key_pair.public_key_der().unwrap(),
            restored.public_key_der().unwrap()
        );
        assert!(EcdsaKeyPair::from_private_key_der(b"garbage").is_err());
    }
}
