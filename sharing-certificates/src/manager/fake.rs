//! In-memory [`CertificateManager`] for exercising certificate consumers.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use super::{certificate_visibility, CertificateManager, CertificateManagerObserver, ObserverList};
use crate::decrypted_public_certificate::DecryptedPublicCertificate;
use crate::encrypted_metadata_key::EncryptedMetadataKey;
use crate::private_certificate::PrivateCertificate;
use crate::proto::{DeviceVisibility, PublicCertificate};

/// Holds one private certificate per visibility and a fixed set of
/// decryptable public certificates. No scheduling, no storage.
#[derive(Default)]
pub struct FakeCertificateManager {
    private_certificates: Mutex<HashMap<DeviceVisibility, PrivateCertificate>>,
    public_certificates: Mutex<Vec<PublicCertificate>>,
    running: AtomicBool,
    download_requests: AtomicUsize,
    observers: ObserverList,
}

impl FakeCertificateManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store `certificate` as the current one for its visibility.
    pub fn set_private_certificate(&self, certificate: PrivateCertificate) {
        if let Ok(mut certificates) = self.private_certificates.lock() {
            certificates.insert(certificate.visibility(), certificate);
        }
    }

    pub fn add_public_certificate(&self, certificate: PublicCertificate) {
        if let Ok(mut certificates) = self.public_certificates.lock() {
            certificates.push(certificate);
        }
    }

    pub fn download_request_count(&self) -> usize {
        self.download_requests.load(Ordering::SeqCst)
    }

    /// Fire `on_private_certificates_changed` on every observer.
    pub fn notify_private_certificates_changed(&self) {
        self.observers
            .notify(|observer| observer.on_private_certificates_changed());
    }

    fn certificate_for(&self, visibility: DeviceVisibility) -> Option<PrivateCertificate> {
        let visibility = certificate_visibility(visibility)?;
        self.private_certificates
            .lock()
            .ok()?
            .get(&visibility)
            .cloned()
    }
}

#[async_trait]
impl CertificateManager for FakeCertificateManager {
    async fn start(&self) {
        self.running.store(true, Ordering::SeqCst);
    }

    async fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    async fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    async fn get_valid_private_certificate(
        &self,
        visibility: DeviceVisibility,
    ) -> Option<PrivateCertificate> {
        self.certificate_for(visibility)
    }

    async fn encrypt_private_certificate_metadata_key(
        &self,
        visibility: DeviceVisibility,
    ) -> Option<EncryptedMetadataKey> {
        let visibility = certificate_visibility(visibility)?;
        let mut certificates = self.private_certificates.lock().ok()?;
        certificates.get_mut(&visibility)?.encrypt_metadata_key()
    }

    async fn sign_with_private_certificate(
        &self,
        visibility: DeviceVisibility,
        payload: &[u8],
    ) -> Option<Vec<u8>> {
        self.certificate_for(visibility)?.sign(payload)
    }

    async fn hash_authentication_token_with_private_certificate(
        &self,
        visibility: DeviceVisibility,
        token: &[u8],
    ) -> Option<Vec<u8>> {
        self.certificate_for(visibility)
            .map(|certificate| certificate.hash_authentication_token(token))
    }

    async fn get_decrypted_public_certificate(
        &self,
        encrypted_metadata_key: EncryptedMetadataKey,
    ) -> Option<DecryptedPublicCertificate> {
        self.public_certificates
            .lock()
            .ok()?
            .iter()
            .find_map(|cert| DecryptedPublicCertificate::decrypt(cert, &encrypted_metadata_key))
    }

    async fn private_certificates_as_public_certificates(
        &self,
        visibility: DeviceVisibility,
    ) -> Vec<PublicCertificate> {
        self.certificate_for(visibility)
            .and_then(|certificate| certificate.to_public_certificate())
            .into_iter()
            .collect()
    }

    async fn download_public_certificates(&self) {
        self.download_requests.fetch_add(1, Ordering::SeqCst);
    }

    async fn clear_public_certificates(&self) -> bool {
        match self.public_certificates.lock() {
            Ok(mut certificates) => {
                certificates.clear();
                true
            }
            Err(_) => false,
        }
    }

    async fn on_contacts_uploaded(&self, did_contacts_change_since_last_upload: bool) {
        if did_contacts_change_since_last_upload {
            self.notify_private_certificates_changed();
        }
    }

    async fn on_local_device_data_changed(
        &self,
        did_device_name_change: bool,
        did_full_name_change: bool,
        did_icon_change: bool,
    ) {
        if did_device_name_change || did_full_name_change || did_icon_change {
            self.notify_private_certificates_changed();
        }
    }

    async fn dump(&self) -> String {
        let private = self
            .private_certificates
            .lock()
            .map(|c| c.len())
            .unwrap_or_default();
        let public = self
            .public_certificates
            .lock()
            .map(|c| c.len())
            .unwrap_or_default();
        format!("Fake certificate manager: {private} private, {public} public")
    }

    fn add_observer(&self, observer: &Arc<dyn CertificateManagerObserver>) {
        self.observers.add(observer);
    }

    fn remove_observer(&self, observer: &Arc<dyn CertificateManagerObserver>) {
        self.observers.remove(observer);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proto::EncryptedMetadata;
    use std::time::SystemTime;

    fn certificate(visibility: DeviceVisibility) -> PrivateCertificate {
        PrivateCertificate::new(
            visibility,
            SystemTime::now(),
            EncryptedMetadata {
                device_name: Some("Fake".into()),
                bluetooth_mac_address: Some(vec![1; 6]),
                ..Default::default()
            },
        )
    }

    #[tokio::test]
    async fn fake_resolves_everyone_to_all_contacts() {
        let manager = FakeCertificateManager::new();
        let cert = certificate(DeviceVisibility::AllContacts);
        let id = cert.id().to_vec();
        manager.set_private_certificate(cert);

        let found = manager
            .get_valid_private_certificate(DeviceVisibility::Everyone)
            .await
            .unwrap();
        assert_eq!(found.id(), id.as_slice());
        assert!(manager
            .get_valid_private_certificate(DeviceVisibility::Hidden)
            .await
            .is_none());
    }

    #[tokio::test]
    async fn fake_decrypts_added_public_certificates() {
        let manager = FakeCertificateManager::new();
        let mut peer = certificate(DeviceVisibility::SelfShare);
        let key = peer.encrypt_metadata_key().unwrap();
        manager.add_public_certificate(peer.to_public_certificate().unwrap());

        let decrypted = manager.get_decrypted_public_certificate(key.clone()).await.unwrap();
        assert!(decrypted.for_self_share());
        assert!(manager.clear_public_certificates().await);
        assert!(manager.get_decrypted_public_certificate(key).await.is_none());
    }
}
