//! Certificate rotation, upload and download, plus the certificate-backed
//! crypto operations used while authenticating peers.
//!
//! [`CertificateManagerImpl`] runs all of its work on one serial worker task.
//! Four recurring tasks feed that worker:
//! - private certificate refresh (expiration driven)
//! - public certificate expiry (expiration driven)
//! - local certificate upload (on demand)
//! - public certificate download (periodic)

use async_trait::async_trait;
use std::sync::{Arc, RwLock, Weak};

use crate::decrypted_public_certificate::DecryptedPublicCertificate;
use crate::encrypted_metadata_key::EncryptedMetadataKey;
use crate::private_certificate::PrivateCertificate;
use crate::proto::{DeviceVisibility, PublicCertificate};

pub mod certificate_manager_impl;
pub mod fake;
pub mod providers;
pub mod rpc;

pub use certificate_manager_impl::{CertificateManagerImpl, CertificateManagerDeps};
pub use fake::FakeCertificateManager;
pub use providers::{
    build_metadata, Account, AccountManager, FakeAccountManager, FakeLocalDeviceDataProvider,
    LocalDeviceDataProvider,
};
pub use rpc::{CertificateRpcClient, FakeRpcClient};

/// Names of the manager's recurring tasks.
pub mod task_names {
    pub const PRIVATE_CERTIFICATE_EXPIRATION: &str = "private-certificate-expiration";
    pub const PUBLIC_CERTIFICATE_EXPIRATION: &str = "public-certificate-expiration";
    pub const UPLOAD_LOCAL_DEVICE_CERTIFICATES: &str = "upload-local-device-certificates";
    pub const DOWNLOAD_PUBLIC_CERTIFICATES: &str = "download-public-certificates";
}

/// Visibilities that get their own private certificates. Everyone-visibility
/// devices reuse the all-contacts certificates.
pub const GENERATED_VISIBILITIES: [DeviceVisibility; 3] = [
    DeviceVisibility::AllContacts,
    DeviceVisibility::SelectedContacts,
    DeviceVisibility::SelfShare,
];

/// Visibility whose certificates back `visibility`, `None` when the device
/// should not be identifiable at all.
pub fn certificate_visibility(visibility: DeviceVisibility) -> Option<DeviceVisibility> {
    match visibility {
        DeviceVisibility::Everyone => Some(DeviceVisibility::AllContacts),
        DeviceVisibility::Hidden | DeviceVisibility::Unspecified => None,
        other => Some(other),
    }
}

pub trait CertificateManagerObserver: Send + Sync {
    fn on_public_certificates_downloaded(&self);
    fn on_private_certificates_changed(&self);
}

/// Weakly held observers; dropped observers are pruned on notify.
#[derive(Default)]
pub struct ObserverList {
    observers: RwLock<Vec<Weak<dyn CertificateManagerObserver>>>,
}

impl ObserverList {
    pub fn add(&self, observer: &Arc<dyn CertificateManagerObserver>) {
        if let Ok(mut observers) = self.observers.write() {
            observers.push(Arc::downgrade(observer));
        }
    }

    pub fn remove(&self, observer: &Arc<dyn CertificateManagerObserver>) {
        if let Ok(mut observers) = self.observers.write() {
            let target = Arc::downgrade(observer);
            observers.retain(|existing| !existing.ptr_eq(&target));
        }
    }

    pub fn notify(&self, event: impl Fn(&dyn CertificateManagerObserver)) {
        let live: Vec<_> = match self.observers.write() {
            Ok(mut observers) => {
                observers.retain(|o| o.strong_count() > 0);
                observers.iter().filter_map(Weak::upgrade).collect()
            }
            Err(_) => return,
        };
        for observer in live {
            event(observer.as_ref());
        }
    }
}

#[async_trait]
pub trait CertificateManager: Send + Sync {
    /// Enable the recurring tasks. Idempotent.
    async fn start(&self);
    /// Disable the recurring tasks. Idempotent.
    async fn stop(&self);
    async fn is_running(&self) -> bool;

    /// First stored certificate for `visibility` whose validity window
    /// contains now. No tolerance is applied.
    async fn get_valid_private_certificate(
        &self,
        visibility: DeviceVisibility,
    ) -> Option<PrivateCertificate>;

    /// Encrypt the metadata key of the current certificate, persisting the
    /// consumed salt.
    async fn encrypt_private_certificate_metadata_key(
        &self,
        visibility: DeviceVisibility,
    ) -> Option<EncryptedMetadataKey>;

    async fn sign_with_private_certificate(
        &self,
        visibility: DeviceVisibility,
        payload: &[u8],
    ) -> Option<Vec<u8>>;

    async fn hash_authentication_token_with_private_certificate(
        &self,
        visibility: DeviceVisibility,
        token: &[u8],
    ) -> Option<Vec<u8>>;

    /// Trial-decrypt stored public certificates with `encrypted_metadata_key`.
    async fn get_decrypted_public_certificate(
        &self,
        encrypted_metadata_key: EncryptedMetadataKey,
    ) -> Option<DecryptedPublicCertificate>;

    async fn private_certificates_as_public_certificates(
        &self,
        visibility: DeviceVisibility,
    ) -> Vec<PublicCertificate>;

    /// Request a download as soon as possible.
    async fn download_public_certificates(&self);

    async fn clear_public_certificates(&self) -> bool;

    /// Contacts or the allowlist changed since the last upload.
    async fn on_contacts_uploaded(&self, did_contacts_change_since_last_upload: bool);

    async fn on_local_device_data_changed(
        &self,
        did_device_name_change: bool,
        did_full_name_change: bool,
        did_icon_change: bool,
    );

    /// Human-readable listing of stored certificate ids.
    async fn dump(&self) -> String;

    fn add_observer(&self, observer: &Arc<dyn CertificateManagerObserver>);
    fn remove_observer(&self, observer: &Arc<dyn CertificateManagerObserver>);
}
