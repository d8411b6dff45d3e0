/// A salted, encrypted metadata encryption key as broadcast in advertisements.
///
/// The receiver uses it to find, by trial decryption, the public certificate
/// that produced it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EncryptedMetadataKey {
    salt: Vec<u8>,
    encrypted_key: Vec<u8>,
}

impl EncryptedMetadataKey {
    pub fn new(salt: Vec<u8>, encrypted_key: Vec<u8>) -> Self {
        Self {
            salt,
            encrypted_key,
        }
    }

    pub fn salt(&self) -> &[u8] {
        &self.salt
    }

    pub fn encrypted_key(&self) -> &[u8] {
        &self.encrypted_key
    }
}
