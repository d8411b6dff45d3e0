//! Certificate persistence.
//!
//! Private certificates live in the preference store and are read and
//! written synchronously. Public certificates live in a
//! [`PublicCertificateDatabase`]; their expiration times are mirrored in a
//! sorted index persisted in the preference store so expiry can be scheduled
//! without loading every row.

use async_trait::async_trait;
use std::time::SystemTime;

use crate::error::Result;
use crate::private_certificate::PrivateCertificate;
use crate::proto::{DeviceVisibility, PublicCertificate};

pub mod certificate_storage;
pub mod database;
pub mod preferences;

pub use certificate_storage::CertificateStorageImpl;
pub use database::{
    FilePublicCertificateDatabase, InMemoryPublicCertificateDatabase, InitStatus,
    PublicCertificateDatabase,
};
pub use preferences::{
    FilePreferenceStore, FilePreferenceStoreConfig, InMemoryPreferenceStore, PreferenceStore,
};

/// Preference keys owned by the certificate stack.
pub mod prefs {
    pub const PRIVATE_CERTIFICATES: &str = "sharing.certificates.private_certificates";
    pub const PUBLIC_CERTIFICATE_EXPIRATIONS: &str =
        "sharing.certificates.public_certificate_expirations";
    pub const SCHEDULER_PRIVATE_CERTIFICATE_EXPIRATION: &str =
        "sharing.scheduler.private_certificate_expiration";
    pub const SCHEDULER_PUBLIC_CERTIFICATE_EXPIRATION: &str =
        "sharing.scheduler.public_certificate_expiration";
    pub const SCHEDULER_UPLOAD_LOCAL_DEVICE_CERTIFICATES: &str =
        "sharing.scheduler.upload_local_device_certificates";
    pub const SCHEDULER_DOWNLOAD_PUBLIC_CERTIFICATES: &str =
        "sharing.scheduler.download_public_certificates";
}

#[async_trait]
pub trait CertificateStorage: Send + Sync {
    /// All stored private certificates. An error means a record could not be
    /// decoded, which callers treat as corruption.
    fn get_private_certificates(&self) -> Result<Vec<PrivateCertificate>>;

    fn replace_private_certificates(&self, certificates: &[PrivateCertificate]) -> Result<()>;

    /// Overwrite the record with the same id; no-op when absent.
    fn update_private_certificate(&self, certificate: &PrivateCertificate) -> Result<()>;

    fn remove_expired_private_certificates(&self, now: SystemTime) -> Result<()>;

    fn clear_private_certificates(&self) -> Result<()>;

    fn clear_private_certificates_of_visibility(&self, visibility: DeviceVisibility)
        -> Result<()>;

    /// Earliest `not_after` among private certificates.
    fn next_private_certificate_expiration_time(&self) -> Option<SystemTime>;

    /// Ids of stored public certificates, soonest to expire first.
    fn get_public_certificate_ids(&self) -> Vec<Vec<u8>>;

    /// Earliest public certificate `end_time`, without tolerance.
    fn next_public_certificate_expiration_time(&self) -> Option<SystemTime>;

    async fn get_public_certificates(&self) -> Result<Vec<PublicCertificate>>;

    async fn add_public_certificates(&self, certificates: Vec<PublicCertificate>) -> Result<()>;

    async fn replace_public_certificates(&self, certificates: Vec<PublicCertificate>)
        -> Result<()>;

    async fn remove_expired_public_certificates(&self, now: SystemTime) -> Result<()>;

    async fn clear_public_certificates(&self) -> Result<()>;
}
