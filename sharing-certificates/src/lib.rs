//! Sharing Certificates – public API facade
//!
//! Short-lived certificates that let two nearby devices authenticate each
//! other without exposing a stable identifier:
//! - [`PrivateCertificate`] / [`DecryptedPublicCertificate`]: the local and
//!   remote halves of a certificate
//! - [`storage`]: persistence with expiry bookkeeping and corruption recovery
//! - [`manager`]: rotation, upload and download on recurring schedules
//! - [`verification`]: the paired-key exchange run on each new connection

pub mod clock;
pub mod config;
pub mod constants;
pub mod crypto;
pub mod decrypted_public_certificate;
pub mod encrypted_metadata_key;
pub mod error;
pub mod key_pair;
pub mod manager;
pub mod private_certificate;
pub mod proto;
pub mod scheduling;
pub mod storage;
pub mod validity;
pub mod verification;

pub use error::{CertificateError, Result};

pub use clock::{Clock, FakeClock, SystemClock};
pub use config::{CertificateManagerConfig, VerificationConfig};

pub use decrypted_public_certificate::DecryptedPublicCertificate;
pub use encrypted_metadata_key::EncryptedMetadataKey;
pub use private_certificate::{PrivateCertificate, PrivateCertificateData};

pub use manager::{
    CertificateManager, CertificateManagerDeps, CertificateManagerImpl,
    CertificateManagerObserver,
};
pub use storage::{CertificateStorage, CertificateStorageImpl};

pub use verification::{
    merge_results, PairedKeyVerificationResult, PairedKeyVerificationRunner, ShareTarget,
    VisibilitySettings,
};
