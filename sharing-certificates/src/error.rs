use thiserror::Error;

/// Error types for the sharing-certificates crate
#[derive(Error, Debug)]
pub enum CertificateError {
    #[error("Encryption error: {0}")]
    Encryption(String),

    #[error("Decryption error: {0}")]
    Decryption(String),

    #[error("Signature error: {0}")]
    Signature(String),

    #[error("Invalid key format: {0}")]
    InvalidKeyFormat(String),

    #[error("Invalid length for {field}: expected {expected}, got {actual}")]
    InvalidLength {
        field: &'static str,
        expected: usize,
        actual: usize,
    },

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Storage corrupted: {0}")]
    StorageCorrupted(String),

    #[error("RPC error: {0}")]
    Rpc(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Channel closed: {0}")]
    ChannelClosed(String),
}

impl From<hkdf::InvalidLength> for CertificateError {
    fn from(err: hkdf::InvalidLength) -> Self {
        CertificateError::Encryption(format!("HKDF error: {err}"))
    }
}

impl From<prost::DecodeError> for CertificateError {
    fn from(err: prost::DecodeError) -> Self {
        CertificateError::Serialization(format!("protobuf decode error: {err}"))
    }
}

impl From<base64::DecodeError> for CertificateError {
    fn from(err: base64::DecodeError) -> Self {
        CertificateError::Serialization(format!("base64 decode error: {err}"))
    }
}

impl From<hex::FromHexError> for CertificateError {
    fn from(err: hex::FromHexError) -> Self {
        CertificateError::Serialization(format!("hex decode error: {err}"))
    }
}

impl From<serde_json::Error> for CertificateError {
    fn from(err: serde_json::Error) -> Self {
        CertificateError::Serialization(format!("json error: {err}"))
    }
}

/// Result type for sharing-certificates operations
pub type Result<T> = std::result::Result<T, CertificateError>;
