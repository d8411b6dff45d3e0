//! End-to-End Certificate Exchange Tests
//!
//! Two devices generate their private certificates, publish them to a shared
//! in-memory certificate service, download each other's public certificates
//! and finally authenticate each other over an in-memory connection with the
//! paired-key verification protocol. Everything below the RPC seam is the
//! production code.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use prost::Message;
use sharing_certificates::manager::{
    task_names, CertificateRpcClient, FakeAccountManager, FakeLocalDeviceDataProvider,
};
use sharing_certificates::proto::{
    DeviceVisibility, OsType, PublicCertificate, PublishDeviceRequest, PublishDeviceResponse,
    QuerySharedCredentialsRequest, QuerySharedCredentialsResponse, SharedCredential,
    SharedCredentialDataType,
};
use sharing_certificates::scheduling::FakeRecurringTaskFactory;
use sharing_certificates::storage::{InMemoryPreferenceStore, InMemoryPublicCertificateDatabase};
use sharing_certificates::verification::InMemoryConnection;
use sharing_certificates::{
    CertificateManager, CertificateManagerConfig, CertificateManagerDeps, CertificateManagerImpl,
    CertificateStorage, CertificateStorageImpl, PairedKeyVerificationResult,
    PairedKeyVerificationRunner, ShareTarget, SystemClock, VisibilitySettings,
};
use sharing_common::{Component, Logger};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

const PAGE_SIZE: usize = 4;
const WAIT: Duration = Duration::from_secs(5);

fn create_test_logger(device: &str) -> Arc<Logger> {
    sharing_common::init_test_logging();
    Arc::new(Logger::new_root(Component::Custom("Sharing"), device))
}

/// Keeps the certificates each device published and serves everybody
/// else's as shared credentials, `PAGE_SIZE` per page.
#[derive(Default)]
struct InMemoryCertificateService {
    published: Mutex<BTreeMap<String, Vec<PublicCertificate>>>,
}

struct ServiceClient {
    service: Arc<InMemoryCertificateService>,
}

#[async_trait]
impl CertificateRpcClient for ServiceClient {
    async fn publish_device(
        &self,
        request: PublishDeviceRequest,
    ) -> sharing_certificates::Result<PublishDeviceResponse> {
        self.service
            .published
            .lock()
            .map_err(|_| sharing_certificates::CertificateError::Rpc("poisoned".into()))?
            .insert(request.name, request.public_certificates);
        Ok(PublishDeviceResponse::default())
    }

    async fn query_shared_credentials(
        &self,
        request: QuerySharedCredentialsRequest,
    ) -> sharing_certificates::Result<QuerySharedCredentialsResponse> {
        let published = self
            .service
            .published
            .lock()
            .map_err(|_| sharing_certificates::CertificateError::Rpc("poisoned".into()))?;
        let credentials: Vec<SharedCredential> = published
            .iter()
            .filter(|(name, _)| **name != request.name)
            .flat_map(|(_, certificates)| certificates.iter())
            .enumerate()
            .map(|(i, certificate)| SharedCredential {
                id: i as i64,
                data: certificate.encode_to_vec(),
                data_type: SharedCredentialDataType::PublicCertificate as i32,
            })
            .collect();

        let start: usize = request
            .page_token
            .as_deref()
            .map(|token| token.parse::<usize>())
            .transpose()
            .map_err(|_| sharing_certificates::CertificateError::Rpc("bad page token".into()))?
            .unwrap_or(0);
        let end = (start + PAGE_SIZE).min(credentials.len());
        let next_page_token = if end < credentials.len() {
            end.to_string()
        } else {
            String::new()
        };
        Ok(QuerySharedCredentialsResponse {
            shared_credentials: credentials[start..end].to_vec(),
            next_page_token,
        })
    }
}

struct Device {
    manager: Arc<CertificateManagerImpl>,
    storage: Arc<CertificateStorageImpl>,
    tasks: Arc<FakeRecurringTaskFactory>,
}

impl Device {
    async fn new(id: &str, name: &str, service: &Arc<InMemoryCertificateService>) -> Self {
        let logger = create_test_logger(id);
        let storage = Arc::new(CertificateStorageImpl::new(
            Arc::new(InMemoryPreferenceStore::new()),
            Arc::new(InMemoryPublicCertificateDatabase::new()),
            logger.clone(),
        ));
        let tasks = Arc::new(FakeRecurringTaskFactory::new());
        let manager = Arc::new(CertificateManagerImpl::new(
            CertificateManagerDeps {
                storage: storage.clone(),
                rpc_client: Arc::new(ServiceClient {
                    service: service.clone(),
                }),
                local_device: Arc::new(FakeLocalDeviceDataProvider::new(id, name)),
                account_manager: Arc::new(FakeAccountManager::signed_in(&format!(
                    "{id}@example.org"
                ))),
                task_factory: tasks.clone(),
                clock: Arc::new(SystemClock),
            },
            CertificateManagerConfig::default(),
            logger,
        ));
        manager.start().await;
        Self {
            manager,
            storage,
            tasks,
        }
    }

    async fn run_task(&self, name: &str) -> Result<bool> {
        let task = self
            .tasks
            .task(name)
            .ok_or_else(|| anyhow!("task {name} was never created"))?;
        task.fire();
        task.next_result(WAIT)
            .await
            .ok_or_else(|| anyhow!("task {name} reported no result"))
    }
}

#[tokio::test]
async fn test_devices_exchange_certificates_and_verify() -> Result<()> {
    let service = Arc::new(InMemoryCertificateService::default());
    let alpha = Device::new("alpha", "Alpha Phone", &service).await;
    let beta = Device::new("beta", "Beta Laptop", &service).await;

    // ==========================================
    // Both devices rotate and publish
    // ==========================================
    println!("🔐 Generating and publishing private certificates");
    for device in [&alpha, &beta] {
        assert!(device.run_task(task_names::PRIVATE_CERTIFICATE_EXPIRATION).await?);
        assert_eq!(device.storage.get_private_certificates()?.len(), 9);
        assert!(device.run_task(task_names::UPLOAD_LOCAL_DEVICE_CERTIFICATES).await?);
    }

    // ==========================================
    // Both devices download, over several pages
    // ==========================================
    println!("📥 Downloading public certificates");
    for device in [&alpha, &beta] {
        assert!(device.run_task(task_names::DOWNLOAD_PUBLIC_CERTIFICATES).await?);
        assert_eq!(device.storage.get_public_certificate_ids().len(), 9);
    }

    // ==========================================
    // Advertisement: beta resolves alpha from its encrypted metadata key
    // ==========================================
    println!("📡 Resolving advertised metadata keys");
    let alpha_key = alpha
        .manager
        .encrypt_private_certificate_metadata_key(DeviceVisibility::AllContacts)
        .await
        .ok_or_else(|| anyhow!("alpha has no all-contacts certificate"))?;
    let alpha_seen_by_beta = beta
        .manager
        .get_decrypted_public_certificate(alpha_key)
        .await
        .ok_or_else(|| anyhow!("beta could not decrypt alpha's certificate"))?;
    assert_eq!(
        alpha_seen_by_beta.unencrypted_metadata().device_name.as_deref(),
        Some("Alpha Phone")
    );

    let beta_key = beta
        .manager
        .encrypt_private_certificate_metadata_key(DeviceVisibility::AllContacts)
        .await
        .ok_or_else(|| anyhow!("beta has no all-contacts certificate"))?;
    let beta_seen_by_alpha = alpha
        .manager
        .get_decrypted_public_certificate(beta_key)
        .await
        .ok_or_else(|| anyhow!("alpha could not decrypt beta's certificate"))?;

    // ==========================================
    // Connection: paired-key verification in both directions
    // ==========================================
    println!("🤝 Running paired-key verification");
    let token = b"connection-auth-token".to_vec();
    let (alpha_end, beta_end) = InMemoryConnection::pair();
    let sender = PairedKeyVerificationRunner::builder(
        ShareTarget {
            id: 2,
            device_name: "Beta Laptop".into(),
            is_incoming: false,
            is_known: true,
        },
        token.clone(),
        Arc::new(alpha_end),
        alpha.manager.clone(),
        VisibilitySettings::new(DeviceVisibility::AllContacts),
        create_test_logger("alpha"),
    )
    .with_peer_certificate(Some(beta_seen_by_alpha))
    .with_local_os_type(OsType::Android)
    .build();
    let receiver = PairedKeyVerificationRunner::builder(
        ShareTarget {
            id: 1,
            device_name: "Alpha Phone".into(),
            is_incoming: true,
            is_known: true,
        },
        token,
        Arc::new(beta_end),
        beta.manager.clone(),
        VisibilitySettings::new(DeviceVisibility::AllContacts),
        create_test_logger("beta"),
    )
    .with_peer_certificate(Some(alpha_seen_by_beta))
    .with_restrict_to_contacts(true)
    .with_local_os_type(OsType::MacOs)
    .build();

    let (sent, received) = tokio::join!(sender.run(), receiver.run());
    assert_eq!(sent, (PairedKeyVerificationResult::Success, OsType::MacOs));
    assert_eq!(received, (PairedKeyVerificationResult::Success, OsType::Android));
    println!("   ✅ Both devices verified each other");

    let dump = alpha.manager.dump().await;
    assert!(dump.contains("Total count: 9"));
    Ok(())
}

#[tokio::test]
async fn test_regenerated_certificates_invalidate_old_advertisements() -> Result<()> {
    let service = Arc::new(InMemoryCertificateService::default());
    let alpha = Device::new("alpha", "Alpha Phone", &service).await;
    let beta = Device::new("beta", "Beta Laptop", &service).await;

    assert!(alpha.run_task(task_names::PRIVATE_CERTIFICATE_EXPIRATION).await?);
    assert!(alpha.run_task(task_names::UPLOAD_LOCAL_DEVICE_CERTIFICATES).await?);
    assert!(beta.run_task(task_names::DOWNLOAD_PUBLIC_CERTIFICATES).await?);

    let old_key = alpha
        .manager
        .encrypt_private_certificate_metadata_key(DeviceVisibility::SelfShare)
        .await
        .ok_or_else(|| anyhow!("no self-share certificate"))?;
    let decrypted = beta
        .manager
        .get_decrypted_public_certificate(old_key.clone())
        .await
        .ok_or_else(|| anyhow!("old key should resolve before rotation"))?;
    assert!(decrypted.for_self_share());

    // The device name change wipes alpha's certificates; beta's copy of the
    // old ones still resolves the old key until it re-downloads.
    alpha
        .manager
        .on_local_device_data_changed(true, false, false)
        .await;
    assert!(alpha.run_task(task_names::PRIVATE_CERTIFICATE_EXPIRATION).await?);
    assert!(alpha.run_task(task_names::UPLOAD_LOCAL_DEVICE_CERTIFICATES).await?);

    assert!(beta.manager.clear_public_certificates().await);
    assert!(beta.run_task(task_names::DOWNLOAD_PUBLIC_CERTIFICATES).await?);
    assert!(beta
        .manager
        .get_decrypted_public_certificate(old_key)
        .await
        .is_none());
    Ok(())
}
