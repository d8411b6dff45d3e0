use async_trait::async_trait;
use prost::Message;
use sharing_common::hex_id::short_hex;
use sharing_common::{log_debug, log_error, log_info, log_warn, Component, Logger};
use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::{mpsc, oneshot};

use super::providers::{build_metadata, AccountManager, LocalDeviceDataProvider};
use super::rpc::CertificateRpcClient;
use super::{
    certificate_visibility, task_names, CertificateManager, CertificateManagerObserver,
    ObserverList, GENERATED_VISIBILITIES,
};
use crate::clock::Clock;
use crate::config::CertificateManagerConfig;
use crate::constants::{NUM_PRIVATE_CERTIFICATES, VALIDITY_BOUND_TOLERANCE};
use crate::decrypted_public_certificate::DecryptedPublicCertificate;
use crate::encrypted_metadata_key::EncryptedMetadataKey;
use crate::error::{CertificateError, Result};
use crate::private_certificate::PrivateCertificate;
use crate::proto::{
    DeviceVisibility, PublicCertificate, PublishDeviceRequest, QuerySharedCredentialsRequest,
    SharedCredentialDataType,
};
use crate::scheduling::{RecurringTask, RecurringTaskFactory, ScheduleKind, TaskCallback};
use crate::storage::{prefs, CertificateStorage};
use crate::validity::is_within_validity_period;

/// Number of private certificates kept at steady state.
pub fn expected_private_certificate_count() -> usize {
    GENERATED_VISIBILITIES.len() * NUM_PRIVATE_CERTIFICATES
}

/// Collaborators injected into [`CertificateManagerImpl`].
pub struct CertificateManagerDeps {
    pub storage: Arc<dyn CertificateStorage>,
    pub rpc_client: Arc<dyn CertificateRpcClient>,
    pub local_device: Arc<dyn LocalDeviceDataProvider>,
    pub account_manager: Arc<dyn AccountManager>,
    pub task_factory: Arc<dyn RecurringTaskFactory>,
    pub clock: Arc<dyn Clock>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ManagerTask {
    RefreshPrivateCertificates,
    RemoveExpiredPublicCertificates,
    UploadLocalDeviceCertificates,
    DownloadPublicCertificates,
}

enum ManagerCommand {
    Start {
        reply_to: oneshot::Sender<()>,
    },
    Stop {
        reply_to: oneshot::Sender<()>,
    },
    GetValidPrivateCertificate {
        visibility: DeviceVisibility,
        reply_to: oneshot::Sender<Option<PrivateCertificate>>,
    },
    EncryptMetadataKey {
        visibility: DeviceVisibility,
        reply_to: oneshot::Sender<Option<EncryptedMetadataKey>>,
    },
    Sign {
        visibility: DeviceVisibility,
        payload: Vec<u8>,
        reply_to: oneshot::Sender<Option<Vec<u8>>>,
    },
    HashAuthenticationToken {
        visibility: DeviceVisibility,
        token: Vec<u8>,
        reply_to: oneshot::Sender<Option<Vec<u8>>>,
    },
    GetDecryptedPublicCertificate {
        encrypted_metadata_key: EncryptedMetadataKey,
        reply_to: oneshot::Sender<Option<DecryptedPublicCertificate>>,
    },
    PrivateCertificatesAsPublic {
        visibility: DeviceVisibility,
        reply_to: oneshot::Sender<Vec<PublicCertificate>>,
    },
    DownloadNow,
    ClearPublicCertificates {
        reply_to: oneshot::Sender<bool>,
    },
    RegenerateIfChanged {
        changed: bool,
        reason: &'static str,
    },
    Dump {
        reply_to: oneshot::Sender<String>,
    },
    RunTask(ManagerTask),
}

struct ManagerTasks {
    private_certificate_expiration: Arc<dyn RecurringTask>,
    public_certificate_expiration: Arc<dyn RecurringTask>,
    upload_local_device_certificates: Arc<dyn RecurringTask>,
    download_public_certificates: Arc<dyn RecurringTask>,
}

impl ManagerTasks {
    fn all(&self) -> [&Arc<dyn RecurringTask>; 4] {
        [
            &self.private_certificate_expiration,
            &self.public_certificate_expiration,
            &self.upload_local_device_certificates,
            &self.download_public_certificates,
        ]
    }

    fn for_task(&self, task: ManagerTask) -> &Arc<dyn RecurringTask> {
        match task {
            ManagerTask::RefreshPrivateCertificates => &self.private_certificate_expiration,
            ManagerTask::RemoveExpiredPublicCertificates => &self.public_certificate_expiration,
            ManagerTask::UploadLocalDeviceCertificates => &self.upload_local_device_certificates,
            ManagerTask::DownloadPublicCertificates => &self.download_public_certificates,
        }
    }
}

/// Production [`CertificateManager`].
///
/// Every operation is a command processed in order by one worker task, so
/// rotation, upload, download and salt bookkeeping never touch storage
/// concurrently. Dropping the manager closes the command channel, which ends
/// the worker and cancels its recurring tasks.
pub struct CertificateManagerImpl {
    command_tx: mpsc::UnboundedSender<ManagerCommand>,
    observers: Arc<ObserverList>,
    running: Arc<AtomicBool>,
    logger: Arc<Logger>,
}

impl CertificateManagerImpl {
    /// Build the manager and spawn its worker. Must be called within a tokio
    /// runtime.
    pub fn new(
        deps: CertificateManagerDeps,
        config: CertificateManagerConfig,
        logger: Arc<Logger>,
    ) -> Self {
        let logger = Arc::new(logger.with_component(Component::Manager));
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let observers = Arc::new(ObserverList::default());
        let running = Arc::new(AtomicBool::new(false));

        let trigger = |task: ManagerTask| -> TaskCallback {
            let weak_tx = command_tx.downgrade();
            Arc::new(move || {
                if let Some(tx) = weak_tx.upgrade() {
                    let _ = tx.send(ManagerCommand::RunTask(task));
                }
            })
        };

        let private_storage = deps.storage.clone();
        let public_storage = deps.storage.clone();
        let factory = deps.task_factory.as_ref();
        let tasks = ManagerTasks {
            private_certificate_expiration: factory.create(
                task_names::PRIVATE_CERTIFICATE_EXPIRATION,
                prefs::SCHEDULER_PRIVATE_CERTIFICATE_EXPIRATION,
                ScheduleKind::Expiration(Arc::new(move || {
                    next_private_certificate_expiration_time(private_storage.as_ref())
                })),
                trigger(ManagerTask::RefreshPrivateCertificates),
            ),
            public_certificate_expiration: factory.create(
                task_names::PUBLIC_CERTIFICATE_EXPIRATION,
                prefs::SCHEDULER_PUBLIC_CERTIFICATE_EXPIRATION,
                ScheduleKind::Expiration(Arc::new(move || {
                    next_public_certificate_expiration_time(public_storage.as_ref())
                })),
                trigger(ManagerTask::RemoveExpiredPublicCertificates),
            ),
            upload_local_device_certificates: factory.create(
                task_names::UPLOAD_LOCAL_DEVICE_CERTIFICATES,
                prefs::SCHEDULER_UPLOAD_LOCAL_DEVICE_CERTIFICATES,
                ScheduleKind::OnDemand,
                trigger(ManagerTask::UploadLocalDeviceCertificates),
            ),
            download_public_certificates: factory.create(
                task_names::DOWNLOAD_PUBLIC_CERTIFICATES,
                prefs::SCHEDULER_DOWNLOAD_PUBLIC_CERTIFICATES,
                ScheduleKind::Periodic(config.download_period),
                trigger(ManagerTask::DownloadPublicCertificates),
            ),
        };

        let worker = ManagerWorker {
            storage: deps.storage,
            rpc_client: deps.rpc_client,
            local_device: deps.local_device,
            account_manager: deps.account_manager,
            clock: deps.clock,
            config,
            tasks,
            observers: observers.clone(),
            running: running.clone(),
            logger: logger.clone(),
        };
        tokio::spawn(worker.run(command_rx));

        Self {
            command_tx,
            observers,
            running,
            logger,
        }
    }

    async fn request<T>(
        &self,
        make_command: impl FnOnce(oneshot::Sender<T>) -> ManagerCommand,
    ) -> Result<T> {
        let (reply_to, reply) = oneshot::channel();
        self.command_tx
            .send(make_command(reply_to))
            .map_err(|_| CertificateError::ChannelClosed("manager worker stopped".into()))?;
        reply
            .await
            .map_err(|_| CertificateError::ChannelClosed("manager worker dropped reply".into()))
    }

    fn post(&self, command: ManagerCommand) {
        if self.command_tx.send(command).is_err() {
            log_error!(self.logger, "Manager worker is gone; command dropped");
        }
    }

    /// Collapse a worker failure into the contract's `None`.
    fn settle<T>(&self, result: Result<Option<T>>) -> Option<T> {
        result.unwrap_or_else(|e| {
            log_error!(self.logger, "Manager request failed: {e}");
            None
        })
    }
}

#[async_trait]
impl CertificateManager for CertificateManagerImpl {
    async fn start(&self) {
        if let Err(e) = self.request(|reply_to| ManagerCommand::Start { reply_to }).await {
            log_error!(self.logger, "Failed to start manager: {e}");
        }
    }

    async fn stop(&self) {
        if let Err(e) = self.request(|reply_to| ManagerCommand::Stop { reply_to }).await {
            log_error!(self.logger, "Failed to stop manager: {e}");
        }
    }

    async fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    async fn get_valid_private_certificate(
        &self,
        visibility: DeviceVisibility,
    ) -> Option<PrivateCertificate> {
        let result = self
            .request(|reply_to| ManagerCommand::GetValidPrivateCertificate {
                visibility,
                reply_to,
            })
            .await;
        self.settle(result)
    }

    async fn encrypt_private_certificate_metadata_key(
        &self,
        visibility: DeviceVisibility,
    ) -> Option<EncryptedMetadataKey> {
        let result = self
            .request(|reply_to| ManagerCommand::EncryptMetadataKey {
                visibility,
                reply_to,
            })
            .await;
        self.settle(result)
    }

    async fn sign_with_private_certificate(
        &self,
        visibility: DeviceVisibility,
        payload: &[u8],
    ) -> Option<Vec<u8>> {
        let result = self
            .request(|reply_to| ManagerCommand::Sign {
                visibility,
                payload: payload.to_vec(),
                reply_to,
            })
            .await;
        self.settle(result)
    }

    async fn hash_authentication_token_with_private_certificate(
        &self,
        visibility: DeviceVisibility,
        token: &[u8],
    ) -> Option<Vec<u8>> {
        let result = self
            .request(|reply_to| ManagerCommand::HashAuthenticationToken {
                visibility,
                token: token.to_vec(),
                reply_to,
            })
            .await;
        self.settle(result)
    }

    async fn get_decrypted_public_certificate(
        &self,
        encrypted_metadata_key: EncryptedMetadataKey,
    ) -> Option<DecryptedPublicCertificate> {
        let result = self
            .request(|reply_to| ManagerCommand::GetDecryptedPublicCertificate {
                encrypted_metadata_key,
                reply_to,
            })
            .await;
        self.settle(result)
    }

    async fn private_certificates_as_public_certificates(
        &self,
        visibility: DeviceVisibility,
    ) -> Vec<PublicCertificate> {
        self.request(|reply_to| ManagerCommand::PrivateCertificatesAsPublic {
            visibility,
            reply_to,
        })
        .await
        .unwrap_or_default()
    }

    async fn download_public_certificates(&self) {
        self.post(ManagerCommand::DownloadNow);
    }

    async fn clear_public_certificates(&self) -> bool {
        self.request(|reply_to| ManagerCommand::ClearPublicCertificates { reply_to })
            .await
            .unwrap_or(false)
    }

    async fn on_contacts_uploaded(&self, did_contacts_change_since_last_upload: bool) {
        self.post(ManagerCommand::RegenerateIfChanged {
            changed: did_contacts_change_since_last_upload,
            reason: "contacts changed",
        });
    }

    async fn on_local_device_data_changed(
        &self,
        did_device_name_change: bool,
        did_full_name_change: bool,
        did_icon_change: bool,
    ) {
        self.post(ManagerCommand::RegenerateIfChanged {
            changed: did_device_name_change || did_full_name_change || did_icon_change,
            reason: "local device data changed",
        });
    }

    async fn dump(&self) -> String {
        self.request(|reply_to| ManagerCommand::Dump { reply_to })
            .await
            .unwrap_or_default()
    }

    fn add_observer(&self, observer: &Arc<dyn CertificateManagerObserver>) {
        self.observers.add(observer);
    }

    fn remove_observer(&self, observer: &Arc<dyn CertificateManagerObserver>) {
        self.observers.remove(observer);
    }
}

/// Missing certificates count as already expired so the refresh runs at once.
fn next_private_certificate_expiration_time(storage: &dyn CertificateStorage) -> Option<SystemTime> {
    match storage.get_private_certificates() {
        Ok(certificates) if certificates.len() >= expected_private_certificate_count() => {
            storage.next_private_certificate_expiration_time()
        }
        _ => Some(UNIX_EPOCH),
    }
}

/// Public certificates are kept until the clock-skew tolerance has passed.
fn next_public_certificate_expiration_time(storage: &dyn CertificateStorage) -> Option<SystemTime> {
    storage
        .next_public_certificate_expiration_time()
        .map(|expiration| expiration + VALIDITY_BOUND_TOLERANCE)
}

struct ManagerWorker {
    storage: Arc<dyn CertificateStorage>,
    rpc_client: Arc<dyn CertificateRpcClient>,
    local_device: Arc<dyn LocalDeviceDataProvider>,
    account_manager: Arc<dyn AccountManager>,
    clock: Arc<dyn Clock>,
    config: CertificateManagerConfig,
    tasks: ManagerTasks,
    observers: Arc<ObserverList>,
    running: Arc<AtomicBool>,
    logger: Arc<Logger>,
}

impl ManagerWorker {
    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<ManagerCommand>) {
        log_debug!(self.logger, "Manager worker started");
        while let Some(command) = commands.recv().await {
            self.handle_command(command).await;
        }
        for task in self.tasks.all() {
            task.stop();
        }
        log_debug!(self.logger, "Manager worker stopped");
    }

    async fn handle_command(&mut self, command: ManagerCommand) {
        match command {
            ManagerCommand::Start { reply_to } => {
                self.start();
                let _ = reply_to.send(());
            }
            ManagerCommand::Stop { reply_to } => {
                self.stop();
                let _ = reply_to.send(());
            }
            ManagerCommand::GetValidPrivateCertificate {
                visibility,
                reply_to,
            } => {
                let _ = reply_to.send(self.get_valid_private_certificate(visibility));
            }
            ManagerCommand::EncryptMetadataKey {
                visibility,
                reply_to,
            } => {
                let _ = reply_to.send(self.encrypt_metadata_key(visibility));
            }
            ManagerCommand::Sign {
                visibility,
                payload,
                reply_to,
            } => {
                let signature = self
                    .get_valid_private_certificate(visibility)
                    .and_then(|cert| cert.sign(&payload));
                let _ = reply_to.send(signature);
            }
            ManagerCommand::HashAuthenticationToken {
                visibility,
                token,
                reply_to,
            } => {
                let hash = self
                    .get_valid_private_certificate(visibility)
                    .map(|cert| cert.hash_authentication_token(&token));
                let _ = reply_to.send(hash);
            }
            ManagerCommand::GetDecryptedPublicCertificate {
                encrypted_metadata_key,
                reply_to,
            } => {
                let decrypted = self
                    .get_decrypted_public_certificate(&encrypted_metadata_key)
                    .await;
                let _ = reply_to.send(decrypted);
            }
            ManagerCommand::PrivateCertificatesAsPublic {
                visibility,
                reply_to,
            } => {
                let _ = reply_to.send(self.private_certificates_as_public(visibility));
            }
            ManagerCommand::DownloadNow => {
                self.tasks.download_public_certificates.make_immediate_request();
            }
            ManagerCommand::ClearPublicCertificates { reply_to } => {
                let cleared = match self.storage.clear_public_certificates().await {
                    Ok(()) => true,
                    Err(e) => {
                        log_error!(self.logger, "Failed to clear public certificates: {e}");
                        false
                    }
                };
                self.tasks.public_certificate_expiration.reschedule();
                let _ = reply_to.send(cleared);
            }
            ManagerCommand::RegenerateIfChanged { changed, reason } => {
                if changed {
                    log_info!(self.logger, "Regenerating private certificates: {reason}");
                    self.clear_private_certificates();
                    self.tasks.private_certificate_expiration.make_immediate_request();
                }
            }
            ManagerCommand::Dump { reply_to } => {
                let _ = reply_to.send(self.dump());
            }
            ManagerCommand::RunTask(task) => self.run_task(task).await,
        }
    }

    fn start(&mut self) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        log_info!(self.logger, "Starting certificate manager");
        for task in self.tasks.all() {
            task.start();
        }
    }

    fn stop(&mut self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        log_info!(self.logger, "Stopping certificate manager");
        for task in self.tasks.all() {
            task.stop();
        }
    }

    async fn run_task(&mut self, task: ManagerTask) {
        if !self.running.load(Ordering::SeqCst) {
            log_warn!(self.logger, "Ignoring {:?}; manager is not running", task);
            return;
        }
        let success = match task {
            ManagerTask::RefreshPrivateCertificates => {
                self.refresh_private_certificates(true)
            }
            ManagerTask::RemoveExpiredPublicCertificates => {
                self.remove_expired_public_certificates().await
            }
            ManagerTask::UploadLocalDeviceCertificates => {
                self.upload_local_device_certificates().await
            }
            ManagerTask::DownloadPublicCertificates => self.download_public_certificates().await,
        };
        self.tasks.for_task(task).handle_result(success);
    }

    fn load_private_certificates(&self) -> Option<Vec<PrivateCertificate>> {
        match self.storage.get_private_certificates() {
            Ok(certificates) => Some(certificates),
            Err(e) => {
                log_error!(
                    self.logger,
                    "Private certificates are unreadable, wiping them: {e}"
                );
                self.clear_private_certificates();
                self.tasks.private_certificate_expiration.make_immediate_request();
                None
            }
        }
    }

    fn clear_private_certificates(&self) {
        if let Err(e) = self.storage.clear_private_certificates() {
            log_error!(self.logger, "Failed to clear private certificates: {e}");
        }
    }

    fn get_valid_private_certificate(
        &self,
        visibility: DeviceVisibility,
    ) -> Option<PrivateCertificate> {
        let Some(certificate_visibility) = certificate_visibility(visibility) else {
            log_debug!(self.logger, "No certificate for visibility {:?}", visibility);
            return None;
        };
        let now = self.clock.now();
        let found = self
            .load_private_certificates()?
            .into_iter()
            .find(|cert| {
                cert.visibility() == certificate_visibility
                    && is_within_validity_period(now, cert.not_before(), cert.not_after(), false)
            });
        if found.is_none() {
            log_warn!(
                self.logger,
                "No valid private certificate found with visibility {:?}",
                certificate_visibility
            );
            self.tasks.private_certificate_expiration.make_immediate_request();
        }
        found
    }

    fn encrypt_metadata_key(&self, visibility: DeviceVisibility) -> Option<EncryptedMetadataKey> {
        let mut certificate = self.get_valid_private_certificate(visibility)?;
        let encrypted_key = certificate.encrypt_metadata_key();
        if encrypted_key.is_none() {
            log_warn!(
                self.logger,
                "Failed to encrypt metadata key for certificate {}",
                short_hex(certificate.id())
            );
            return None;
        }
        if let Err(e) = self.storage.update_private_certificate(&certificate) {
            log_error!(self.logger, "Failed to persist consumed salt: {e}");
            return None;
        }
        encrypted_key
    }

    fn private_certificates_as_public(&self, visibility: DeviceVisibility) -> Vec<PublicCertificate> {
        let Some(certificate_visibility) = certificate_visibility(visibility) else {
            return Vec::new();
        };
        self.load_private_certificates()
            .unwrap_or_default()
            .iter()
            .filter(|cert| cert.visibility() == certificate_visibility)
            .filter_map(PrivateCertificate::to_public_certificate)
            .collect()
    }

    async fn get_decrypted_public_certificate(
        &self,
        encrypted_metadata_key: &EncryptedMetadataKey,
    ) -> Option<DecryptedPublicCertificate> {
        let certificates = match self.storage.get_public_certificates().await {
            Ok(certificates) => certificates,
            Err(e) => {
                log_error!(self.logger, "Failed to read public certificates: {e}");
                return None;
            }
        };
        let decrypted = certificates
            .iter()
            .find_map(|cert| DecryptedPublicCertificate::decrypt(cert, encrypted_metadata_key));
        match &decrypted {
            Some(cert) => log_debug!(
                self.logger,
                "Decrypted public certificate {}",
                short_hex(cert.id())
            ),
            None => log_debug!(
                self.logger,
                "Metadata key did not decrypt any of {} public certificates",
                certificates.len()
            ),
        }
        decrypted
    }

    /// Drop expired certificates and top every generated visibility back up
    /// to [`NUM_PRIVATE_CERTIFICATES`], chaining validity windows.
    fn refresh_private_certificates(&mut self, request_upload: bool) -> bool {
        let now = self.clock.now();
        if let Err(e) = self.storage.remove_expired_private_certificates(now) {
            log_warn!(self.logger, "Failed to remove expired private certificates: {e}");
        }
        let mut certificates = self.load_private_certificates().unwrap_or_default();
        if certificates.len() == expected_private_certificate_count() {
            log_debug!(self.logger, "All private certificates are still valid");
            return true;
        }

        let mut slots: BTreeMap<DeviceVisibility, (usize, SystemTime)> = GENERATED_VISIBILITIES
            .iter()
            .map(|visibility| (*visibility, (0, now)))
            .collect();
        for cert in &certificates {
            if let Some((count, latest_not_after)) = slots.get_mut(&cert.visibility()) {
                *count += 1;
                *latest_not_after = (*latest_not_after).max(cert.not_after());
            }
        }

        let account = self.account_manager.current_account();
        let Some(metadata) = build_metadata(self.local_device.as_ref(), account.as_ref()) else {
            log_warn!(
                self.logger,
                "Failed to create private certificates; cannot build metadata"
            );
            return false;
        };

        let mut created = 0;
        for (visibility, (count, latest_not_after)) in slots.iter_mut() {
            while *count < NUM_PRIVATE_CERTIFICATES {
                let cert = PrivateCertificate::new(*visibility, *latest_not_after, metadata.clone());
                *latest_not_after = cert.not_after();
                *count += 1;
                certificates.push(cert);
                created += 1;
            }
        }

        if let Err(e) = self.storage.replace_private_certificates(&certificates) {
            log_error!(self.logger, "Failed to store private certificates: {e}");
            return false;
        }
        log_info!(self.logger, "Created {} private certificates", created);
        self.observers
            .notify(|observer| observer.on_private_certificates_changed());

        if request_upload {
            self.tasks
                .upload_local_device_certificates
                .make_immediate_request();
        }
        true
    }

    async fn remove_expired_public_certificates(&self) -> bool {
        match self
            .storage
            .remove_expired_public_certificates(self.clock.now())
            .await
        {
            Ok(()) => true,
            Err(e) => {
                log_error!(self.logger, "Failed to remove expired public certificates: {e}");
                false
            }
        }
    }

    async fn upload_local_device_certificates(&mut self) -> bool {
        if self.account_manager.current_account().is_none() {
            log_warn!(self.logger, "Skipping certificate upload; no signed-in account");
            return true;
        }

        let Some(contacts_removed) = self.publish_device(false).await else {
            return false;
        };
        if !contacts_removed {
            return true;
        }

        log_info!(
            self.logger,
            "Contacts were removed; regenerating private certificates before publishing again"
        );
        self.clear_private_certificates();
        let refreshed = self.refresh_private_certificates(false);
        self.tasks
            .private_certificate_expiration
            .handle_result(refreshed);
        if !refreshed {
            return false;
        }
        self.publish_device(true).await.is_some()
    }

    /// Publish all private certificates as public ones. Returns whether the
    /// service reported removed contacts, `None` on failure.
    async fn publish_device(&self, force_update_contacts: bool) -> Option<bool> {
        let public_certificates: Vec<PublicCertificate> = self
            .load_private_certificates()?
            .iter()
            .filter_map(PrivateCertificate::to_public_certificate)
            .collect();
        log_info!(
            self.logger,
            "Uploading {} local device certificates",
            public_certificates.len()
        );

        let request = PublishDeviceRequest {
            name: self.config.device_resource_name(&self.local_device.id()),
            public_certificates,
            force_update_contacts,
        };
        match self.rpc_client.publish_device(request).await {
            Ok(response) => Some(response.contacts_removed()),
            Err(e) => {
                log_warn!(self.logger, "Failed to publish device: {e}");
                None
            }
        }
    }

    async fn download_public_certificates(&self) -> bool {
        if self.account_manager.current_account().is_none() {
            log_warn!(self.logger, "Skipping certificate download; no signed-in account");
            return true;
        }

        let certificates = match self.fetch_public_certificates().await {
            Ok(certificates) => certificates,
            Err(e) => {
                log_error!(self.logger, "Failed to download public certificates: {e}");
                return false;
            }
        };
        if let Err(e) = self.storage.add_public_certificates(certificates).await {
            log_error!(self.logger, "Failed to store downloaded certificates: {e}");
            return false;
        }

        self.observers
            .notify(|observer| observer.on_public_certificates_downloaded());
        self.tasks.public_certificate_expiration.reschedule();
        true
    }

    /// Page through shared credentials, keeping public certificates only.
    async fn fetch_public_certificates(&self) -> Result<Vec<PublicCertificate>> {
        let name = self.config.device_resource_name(&self.local_device.id());
        let mut certificates = Vec::new();
        let mut page_token: Option<String> = None;
        let mut page = 0usize;

        loop {
            log_debug!(self.logger, "Downloading page {}", page);
            page += 1;
            let response = self
                .rpc_client
                .query_shared_credentials(QuerySharedCredentialsRequest {
                    name: name.clone(),
                    page_token: page_token.take(),
                })
                .await?;

            for credential in response.shared_credentials {
                if credential.data_type != SharedCredentialDataType::PublicCertificate as i32 {
                    continue;
                }
                match PublicCertificate::decode(credential.data.as_slice()) {
                    Ok(certificate) => certificates.push(certificate),
                    Err(e) => log_warn!(
                        self.logger,
                        "Skipping undecodable credential {}: {e}",
                        credential.id
                    ),
                }
            }

            if response.next_page_token.is_empty() {
                break;
            }
            page_token = Some(response.next_page_token);
        }

        log_info!(
            self.logger,
            "Downloaded {} public certificates",
            certificates.len()
        );
        Ok(certificates)
    }

    fn dump(&self) -> String {
        let mut out = String::new();
        let public_ids = self.storage.get_public_certificate_ids();
        let _ = writeln!(out, "Public certificates");
        let _ = writeln!(out, "  Total count: {}", public_ids.len());
        for id in &public_ids {
            let _ = writeln!(out, "  {}", hex::encode(id));
        }

        let _ = writeln!(out, "Private certificates");
        match self.storage.get_private_certificates() {
            Ok(certificates) => {
                let _ = writeln!(out, "  Total count: {}", certificates.len());
                for cert in &certificates {
                    let _ = writeln!(
                        out,
                        "  {} {:?}",
                        hex::encode(cert.id()),
                        cert.visibility()
                    );
                }
            }
            Err(_) => {
                let _ = writeln!(out, "  Total count: 0");
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FakeClock;
    use crate::manager::{FakeAccountManager, FakeLocalDeviceDataProvider, FakeRpcClient};
    use crate::proto::{
        ContactUpdate, PublishDeviceResponse, QuerySharedCredentialsResponse, SharedCredential,
    };
    use crate::scheduling::FakeRecurringTaskFactory;
    use crate::storage::{
        CertificateStorageImpl, InMemoryPreferenceStore, InMemoryPublicCertificateDatabase,
        PreferenceStore,
    };
    use std::time::Duration;

    const WAIT: Duration = Duration::from_secs(2);

    struct Harness {
        manager: CertificateManagerImpl,
        storage: Arc<CertificateStorageImpl>,
        preferences: Arc<InMemoryPreferenceStore>,
        rpc: Arc<FakeRpcClient>,
        device: Arc<FakeLocalDeviceDataProvider>,
        accounts: Arc<FakeAccountManager>,
        tasks: Arc<FakeRecurringTaskFactory>,
        clock: Arc<FakeClock>,
    }

    impl Harness {
        fn task(&self, name: &str) -> Arc<crate::scheduling::FakeRecurringTask> {
            self.tasks.task(name).unwrap()
        }

        async fn run(&self, name: &str) -> bool {
            let task = self.task(name);
            task.fire();
            task.next_result(WAIT).await.unwrap()
        }
    }

    fn now() -> SystemTime {
        UNIX_EPOCH + Duration::from_secs(1_700_000_000)
    }

    async fn harness() -> Harness {
        let logger = Arc::new(Logger::new_root(Component::System, "manager-test"));
        let preferences = Arc::new(InMemoryPreferenceStore::new());
        let storage = Arc::new(CertificateStorageImpl::new(
            preferences.clone(),
            Arc::new(InMemoryPublicCertificateDatabase::new()),
            logger.clone(),
        ));
        let rpc = Arc::new(FakeRpcClient::new());
        let device = Arc::new(FakeLocalDeviceDataProvider::new("device-1", "Pixel"));
        let accounts = Arc::new(FakeAccountManager::signed_in("ada@example.org"));
        let tasks = Arc::new(FakeRecurringTaskFactory::new());
        let clock = Arc::new(FakeClock::new(now()));

        let manager = CertificateManagerImpl::new(
            CertificateManagerDeps {
                storage: storage.clone(),
                rpc_client: rpc.clone(),
                local_device: device.clone(),
                account_manager: accounts.clone(),
                task_factory: tasks.clone(),
                clock: clock.clone(),
            },
            CertificateManagerConfig::default(),
            logger,
        );
        manager.start().await;
        Harness {
            manager,
            storage,
            preferences,
            rpc,
            device,
            accounts,
            tasks,
            clock,
        }
    }

    #[tokio::test]
    async fn refresh_creates_contiguous_certificates_per_visibility() {
        let h = harness().await;
        assert_eq!(
            next_private_certificate_expiration_time(h.storage.as_ref()),
            Some(UNIX_EPOCH)
        );

        assert!(h.run(task_names::PRIVATE_CERTIFICATE_EXPIRATION).await);
        let certificates = h.storage.get_private_certificates().unwrap();
        assert_eq!(certificates.len(), expected_private_certificate_count());

        for visibility in GENERATED_VISIBILITIES {
            let mut windows: Vec<_> = certificates
                .iter()
                .filter(|c| c.visibility() == visibility)
                .map(|c| (c.not_before(), c.not_after()))
                .collect();
            windows.sort();
            assert_eq!(windows.len(), NUM_PRIVATE_CERTIFICATES);
            assert_eq!(windows[0].0, now());
            for pair in windows.windows(2) {
                assert_eq!(pair[0].1, pair[1].0);
            }
        }
        assert_eq!(
            h.task(task_names::UPLOAD_LOCAL_DEVICE_CERTIFICATES)
                .immediate_request_count(),
            1
        );

        // A second refresh with a full set is a no-op.
        assert!(h.run(task_names::PRIVATE_CERTIFICATE_EXPIRATION).await);
        let again = h.storage.get_private_certificates().unwrap();
        assert_eq!(again.len(), certificates.len());
        assert_eq!(again[0].id(), certificates[0].id());
    }

    #[tokio::test]
    async fn refresh_replaces_only_expired_certificates() {
        let h = harness().await;
        assert!(h.run(task_names::PRIVATE_CERTIFICATE_EXPIRATION).await);
        let before = h.storage.get_private_certificates().unwrap();

        h.clock.set(now() + crate::constants::VALIDITY_PERIOD);
        assert!(h.run(task_names::PRIVATE_CERTIFICATE_EXPIRATION).await);
        let after = h.storage.get_private_certificates().unwrap();
        assert_eq!(after.len(), expected_private_certificate_count());

        let latest_before = before.iter().map(|c| c.not_after()).max().unwrap();
        let new_certs: Vec<_> = after
            .iter()
            .filter(|c| !before.iter().any(|b| b.id() == c.id()))
            .collect();
        assert_eq!(new_certs.len(), GENERATED_VISIBILITIES.len());
        for cert in new_certs {
            assert_eq!(cert.not_before(), latest_before);
        }
    }

    #[tokio::test]
    async fn refresh_fails_without_bluetooth_address() {
        let h = harness().await;
        h.device.set_bluetooth_mac_address(None);
        assert!(!h.run(task_names::PRIVATE_CERTIFICATE_EXPIRATION).await);
        assert!(h.storage.get_private_certificates().unwrap().is_empty());
    }

    #[tokio::test]
    async fn crypto_operations_use_valid_certificate() {
        let h = harness().await;
        assert!(h.run(task_names::PRIVATE_CERTIFICATE_EXPIRATION).await);

        assert!(h
            .manager
            .get_valid_private_certificate(DeviceVisibility::Hidden)
            .await
            .is_none());
        let everyone = h
            .manager
            .get_valid_private_certificate(DeviceVisibility::Everyone)
            .await
            .unwrap();
        assert_eq!(everyone.visibility(), DeviceVisibility::AllContacts);

        let key = h
            .manager
            .encrypt_private_certificate_metadata_key(DeviceVisibility::AllContacts)
            .await
            .unwrap();
        let stored = h
            .storage
            .get_private_certificates()
            .unwrap()
            .into_iter()
            .find(|c| c.id() == everyone.id())
            .unwrap();
        assert_eq!(stored.consumed_salts().len(), 1);
        assert!(stored.consumed_salts().iter().any(|s| s.as_slice() == key.salt()));

        let hash = h
            .manager
            .hash_authentication_token_with_private_certificate(DeviceVisibility::Everyone, b"t")
            .await
            .unwrap();
        assert_eq!(hash, everyone.hash_authentication_token(b"t"));
        assert!(h
            .manager
            .sign_with_private_certificate(DeviceVisibility::SelfShare, b"payload")
            .await
            .is_some());
        assert_eq!(
            h.manager
                .private_certificates_as_public_certificates(DeviceVisibility::SelfShare)
                .await
                .len(),
            NUM_PRIVATE_CERTIFICATES
        );
    }

    #[tokio::test]
    async fn missing_certificate_requests_refresh() {
        let h = harness().await;
        assert!(h
            .manager
            .sign_with_private_certificate(DeviceVisibility::AllContacts, b"payload")
            .await
            .is_none());
        assert!(
            h.task(task_names::PRIVATE_CERTIFICATE_EXPIRATION)
                .immediate_request_count()
                >= 1
        );
    }

    #[tokio::test]
    async fn unreadable_private_certificates_are_wiped_and_rebuilt() {
        let h = harness().await;
        assert!(h.run(task_names::PRIVATE_CERTIFICATE_EXPIRATION).await);
        h.preferences
            .set(
                prefs::PRIVATE_CERTIFICATES,
                serde_json::json!([{"visibility": 2}]),
            )
            .unwrap();

        assert!(h
            .manager
            .get_valid_private_certificate(DeviceVisibility::AllContacts)
            .await
            .is_none());
        assert!(h.preferences.get(prefs::PRIVATE_CERTIFICATES).is_none());
        assert!(h.storage.get_private_certificates().unwrap().is_empty());
        assert!(
            h.task(task_names::PRIVATE_CERTIFICATE_EXPIRATION)
                .immediate_request_count()
                >= 1
        );

        assert!(h.run(task_names::PRIVATE_CERTIFICATE_EXPIRATION).await);
        assert_eq!(
            h.storage.get_private_certificates().unwrap().len(),
            expected_private_certificate_count()
        );
        assert!(h
            .manager
            .get_valid_private_certificate(DeviceVisibility::AllContacts)
            .await
            .is_some());
    }

    #[tokio::test]
    async fn upload_publishes_all_certificates() {
        let h = harness().await;
        assert!(h.run(task_names::PRIVATE_CERTIFICATE_EXPIRATION).await);
        assert!(h.run(task_names::UPLOAD_LOCAL_DEVICE_CERTIFICATES).await);

        let requests = h.rpc.publish_requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].name, "devices/device-1");
        assert_eq!(
            requests[0].public_certificates.len(),
            expected_private_certificate_count()
        );
        assert!(!requests[0].force_update_contacts);
    }

    #[tokio::test]
    async fn removed_contacts_regenerate_and_publish_again() {
        let h = harness().await;
        assert!(h.run(task_names::PRIVATE_CERTIFICATE_EXPIRATION).await);
        let before = h.storage.get_private_certificates().unwrap();

        h.rpc.push_publish_response(Ok(PublishDeviceResponse {
            contact_updates: vec![ContactUpdate::Removed as i32],
        }));
        assert!(h.run(task_names::UPLOAD_LOCAL_DEVICE_CERTIFICATES).await);

        let requests = h.rpc.publish_requests();
        assert_eq!(requests.len(), 2);
        assert!(requests[1].force_update_contacts);
        let after = h.storage.get_private_certificates().unwrap();
        assert_eq!(after.len(), before.len());
        assert!(after.iter().all(|c| before.iter().all(|b| b.id() != c.id())));
    }

    #[tokio::test]
    async fn upload_and_download_skip_without_account() {
        let h = harness().await;
        h.accounts.sign_out();
        assert!(h.run(task_names::UPLOAD_LOCAL_DEVICE_CERTIFICATES).await);
        assert!(h.run(task_names::DOWNLOAD_PUBLIC_CERTIFICATES).await);
        assert!(h.rpc.publish_requests().is_empty());
        assert!(h.rpc.query_requests().is_empty());
    }

    #[tokio::test]
    async fn download_pages_and_filters_credentials() {
        let h = harness().await;
        let mut peer = PrivateCertificate::new(
            DeviceVisibility::AllContacts,
            now(),
            crate::proto::EncryptedMetadata {
                device_name: Some("Peer".into()),
                bluetooth_mac_address: Some(vec![9; 6]),
                ..Default::default()
            },
        );
        let key = peer.encrypt_metadata_key().unwrap();
        let public = peer.to_public_certificate().unwrap();

        h.rpc.push_query_response(Ok(QuerySharedCredentialsResponse {
            shared_credentials: vec![SharedCredential {
                id: 1,
                data: vec![1, 2, 3],
                data_type: SharedCredentialDataType::DeviceContactsHash as i32,
            }],
            next_page_token: "page-2".into(),
        }));
        h.rpc.push_query_response(Ok(QuerySharedCredentialsResponse {
            shared_credentials: vec![SharedCredential {
                id: 2,
                data: public.encode_to_vec(),
                data_type: SharedCredentialDataType::PublicCertificate as i32,
            }],
            next_page_token: String::new(),
        }));

        assert!(h.run(task_names::DOWNLOAD_PUBLIC_CERTIFICATES).await);
        let requests = h.rpc.query_requests();
        assert_eq!(requests.len(), 2);
        assert_eq!(requests[0].name, "devices/device-1");
        assert!(requests[0].page_token.is_none());
        assert_eq!(requests[1].page_token.as_deref(), Some("page-2"));
        assert_eq!(h.storage.get_public_certificate_ids(), vec![peer.id().to_vec()]);
        assert!(
            h.task(task_names::PUBLIC_CERTIFICATE_EXPIRATION)
                .reschedule_count()
                >= 1
        );

        let decrypted = h.manager.get_decrypted_public_certificate(key).await.unwrap();
        assert_eq!(decrypted.id(), peer.id());
        assert!(h.manager.dump().await.contains(&hex::encode(peer.id())));

        assert!(h.manager.clear_public_certificates().await);
        assert!(h.storage.get_public_certificate_ids().is_empty());
    }

    #[tokio::test]
    async fn failed_download_page_fails_attempt() {
        let h = harness().await;
        h.rpc.push_query_response(Ok(QuerySharedCredentialsResponse {
            shared_credentials: Vec::new(),
            next_page_token: "more".into(),
        }));
        h.rpc
            .push_query_response(Err(CertificateError::Rpc("unavailable".into())));
        assert!(!h.run(task_names::DOWNLOAD_PUBLIC_CERTIFICATES).await);
    }

    #[tokio::test]
    async fn stopped_manager_ignores_tasks() {
        let h = harness().await;
        h.manager.stop().await;
        assert!(!h.manager.is_running().await);
        let upload = h.task(task_names::UPLOAD_LOCAL_DEVICE_CERTIFICATES);
        assert!(!upload.is_running());
        upload.fire();
        assert!(upload.next_result(Duration::from_millis(100)).await.is_none());
        assert!(h.rpc.publish_requests().is_empty());
    }

    #[tokio::test]
    async fn device_data_change_clears_private_certificates() {
        let h = harness().await;
        assert!(h.run(task_names::PRIVATE_CERTIFICATE_EXPIRATION).await);

        h.manager.on_local_device_data_changed(false, false, false).await;
        h.manager.on_contacts_uploaded(false).await;
        // Round trip through the queue so the posted commands are processed.
        h.manager.dump().await;
        assert_eq!(
            h.storage.get_private_certificates().unwrap().len(),
            expected_private_certificate_count()
        );

        h.manager.on_local_device_data_changed(true, false, false).await;
        h.manager.dump().await;
        assert!(h.storage.get_private_certificates().unwrap().is_empty());
        assert!(
            h.task(task_names::PRIVATE_CERTIFICATE_EXPIRATION)
                .immediate_request_count()
                >= 1
        );
    }
}
