use async_trait::async_trait;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use serde_json::{Map, Value};
use sharing_common::hex_id::short_hex;
use sharing_common::{log_debug, log_error, log_info, log_warn, Component, Logger};
use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};
use std::time::SystemTime;
use tokio::sync::Mutex;

use super::database::{InitStatus, PublicCertificateDatabase};
use super::preferences::PreferenceStore;
use super::{prefs, CertificateStorage};
use crate::constants::STORAGE_MAX_INIT_ATTEMPTS;
use crate::error::{CertificateError, Result};
use crate::private_certificate::{PrivateCertificate, PrivateCertificateData};
use crate::proto::{DeviceVisibility, PublicCertificate};
use crate::validity::{from_unix_nanos, is_expired, to_unix_nanos};

/// `(certificate id, end_time)` pairs, kept sorted by `end_time`.
pub type ExpirationList = Vec<(Vec<u8>, SystemTime)>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageInitState {
    Uninitialized,
    Initialized,
    Failed,
}

struct InitProgress {
    state: StorageInitState,
    attempts: u32,
}

/// [`CertificateStorage`] over a preference store and a public certificate
/// database.
///
/// The database is opened lazily by the first public-certificate operation.
/// Concurrent operations wait on the same initialization, so nothing touches
/// the database before it is ready. A corrupt database is destroyed (losing
/// its rows and the expiration index) and opened again, bounded by
/// `max_init_attempts`; after that every public operation fails.
pub struct CertificateStorageImpl {
    preferences: Arc<dyn PreferenceStore>,
    database: Arc<dyn PublicCertificateDatabase>,
    init: Mutex<InitProgress>,
    max_init_attempts: u32,
    expirations: RwLock<ExpirationList>,
    logger: Arc<Logger>,
}

impl CertificateStorageImpl {
    pub fn new(
        preferences: Arc<dyn PreferenceStore>,
        database: Arc<dyn PublicCertificateDatabase>,
        logger: Arc<Logger>,
    ) -> Self {
        Self::with_max_init_attempts(preferences, database, logger, STORAGE_MAX_INIT_ATTEMPTS)
    }

    pub fn with_max_init_attempts(
        preferences: Arc<dyn PreferenceStore>,
        database: Arc<dyn PublicCertificateDatabase>,
        logger: Arc<Logger>,
        max_init_attempts: u32,
    ) -> Self {
        let logger = Arc::new(logger.with_component(Component::Storage));
        let expirations = load_expirations(preferences.as_ref(), &logger);
        Self {
            preferences,
            database,
            init: Mutex::new(InitProgress {
                state: StorageInitState::Uninitialized,
                attempts: 0,
            }),
            max_init_attempts,
            expirations: RwLock::new(expirations),
            logger,
        }
    }

    pub async fn init_state(&self) -> StorageInitState {
        self.init.lock().await.state
    }

    /// Open the database if needed. Callers that arrive while another caller
    /// is initializing wait for its outcome.
    pub async fn ensure_initialized(&self) -> Result<()> {
        let mut progress = self.init.lock().await;
        match progress.state {
            StorageInitState::Initialized => return Ok(()),
            StorageInitState::Failed => {
                return Err(CertificateError::Storage(
                    "public certificate database failed to initialize".into(),
                ))
            }
            StorageInitState::Uninitialized => {}
        }

        loop {
            progress.attempts += 1;
            if progress.attempts > self.max_init_attempts {
                progress.state = StorageInitState::Failed;
                log_error!(
                    self.logger,
                    "Public certificate database initialization failed after {} attempts",
                    self.max_init_attempts
                );
                return Err(CertificateError::Storage(
                    "public certificate database failed to initialize".into(),
                ));
            }

            log_debug!(
                self.logger,
                "Initializing public certificate database, attempt {}",
                progress.attempts
            );
            match self.database.initialize().await {
                InitStatus::Ok => {
                    progress.state = StorageInitState::Initialized;
                    progress.attempts = 0;
                    log_debug!(self.logger, "Public certificate database initialized");
                    return Ok(());
                }
                InitStatus::Error => {
                    log_warn!(self.logger, "Public certificate database init error, retrying");
                }
                InitStatus::Corrupt => {
                    log_error!(
                        self.logger,
                        "Public certificate database corrupt. Erasing and initializing new database."
                    );
                    if let Err(e) = self.database.destroy().await {
                        log_error!(self.logger, "Failed to destroy public certificate database: {e}");
                        progress.state = StorageInitState::Failed;
                        return Err(e);
                    }
                    self.replace_expirations(Vec::new())?;
                }
            }
        }
    }

    fn read_private_records(&self) -> Result<Vec<PrivateCertificateData>> {
        match self.preferences.get(prefs::PRIVATE_CERTIFICATES) {
            None | Some(Value::Null) => Ok(Vec::new()),
            Some(value) => Ok(serde_json::from_value(value)?),
        }
    }

    fn write_private_certificates(&self, certificates: &[PrivateCertificate]) -> Result<()> {
        let records = certificates
            .iter()
            .map(PrivateCertificate::to_certificate_data)
            .collect::<Result<Vec<_>>>()?;
        self.preferences
            .set(prefs::PRIVATE_CERTIFICATES, serde_json::to_value(records)?)
    }

    fn expirations_snapshot(&self) -> ExpirationList {
        self.expirations
            .read()
            .map(|list| list.clone())
            .unwrap_or_default()
    }

    /// Swap in a new index and persist it.
    fn replace_expirations(&self, list: ExpirationList) -> Result<()> {
        let value = expirations_to_value(&list);
        {
            let mut guard = self
                .expirations
                .write()
                .map_err(|_| CertificateError::Storage("expiration index lock poisoned".into()))?;
            *guard = list;
        }
        self.preferences
            .set(prefs::PUBLIC_CERTIFICATE_EXPIRATIONS, value)
    }
}

#[async_trait]
impl CertificateStorage for CertificateStorageImpl {
    fn get_private_certificates(&self) -> Result<Vec<PrivateCertificate>> {
        self.read_private_records()?
            .iter()
            .map(PrivateCertificate::from_certificate_data)
            .collect()
    }

    fn replace_private_certificates(&self, certificates: &[PrivateCertificate]) -> Result<()> {
        self.write_private_certificates(certificates)
    }

    fn update_private_certificate(&self, certificate: &PrivateCertificate) -> Result<()> {
        let mut certificates = self.get_private_certificates()?;
        let Some(existing) = certificates
            .iter_mut()
            .find(|existing| existing.id() == certificate.id())
        else {
            log_debug!(
                self.logger,
                "No private certificate with id {} to update",
                short_hex(certificate.id())
            );
            return Ok(());
        };
        *existing = certificate.clone();
        self.write_private_certificates(&certificates)
    }

    fn remove_expired_private_certificates(&self, now: SystemTime) -> Result<()> {
        let mut certificates = self.get_private_certificates()?;
        let before = certificates.len();
        certificates.retain(|cert| !is_expired(now, cert.not_after(), false));
        if certificates.len() != before {
            log_info!(
                self.logger,
                "Removed {} expired private certificates",
                before - certificates.len()
            );
        }
        self.write_private_certificates(&certificates)
    }

    fn clear_private_certificates(&self) -> Result<()> {
        self.preferences.remove(prefs::PRIVATE_CERTIFICATES)
    }

    fn clear_private_certificates_of_visibility(
        &self,
        visibility: DeviceVisibility,
    ) -> Result<()> {
        let mut certificates = self.get_private_certificates()?;
        certificates.retain(|cert| cert.visibility() != visibility);
        self.write_private_certificates(&certificates)
    }

    fn next_private_certificate_expiration_time(&self) -> Option<SystemTime> {
        self.get_private_certificates()
            .ok()?
            .iter()
            .map(PrivateCertificate::not_after)
            .min()
    }

    fn get_public_certificate_ids(&self) -> Vec<Vec<u8>> {
        self.expirations_snapshot()
            .into_iter()
            .map(|(id, _)| id)
            .collect()
    }

    fn next_public_certificate_expiration_time(&self) -> Option<SystemTime> {
        self.expirations
            .read()
            .ok()?
            .first()
            .map(|(_, expiration)| *expiration)
    }

    async fn get_public_certificates(&self) -> Result<Vec<PublicCertificate>> {
        self.ensure_initialized().await?;
        self.database.load_all().await
    }

    async fn add_public_certificates(&self, certificates: Vec<PublicCertificate>) -> Result<()> {
        self.ensure_initialized().await?;
        let new_expirations = expirations_of(&certificates);
        log_debug!(self.logger, "Adding {} public certificates", certificates.len());
        self.database.add_certificates(certificates).await?;
        let merged = merge_expirations(&self.expirations_snapshot(), &new_expirations);
        self.replace_expirations(merged)
    }

    async fn replace_public_certificates(
        &self,
        certificates: Vec<PublicCertificate>,
    ) -> Result<()> {
        self.ensure_initialized().await?;
        let mut new_expirations = expirations_of(&certificates);
        sort_by_expiration(&mut new_expirations);
        self.database.clear().await?;
        self.replace_expirations(Vec::new())?;
        log_debug!(self.logger, "Inserting {} public certificates", certificates.len());
        self.database.add_certificates(certificates).await?;
        self.replace_expirations(new_expirations)
    }

    async fn remove_expired_public_certificates(&self, now: SystemTime) -> Result<()> {
        self.ensure_initialized().await?;
        let ids_to_remove: Vec<Vec<u8>> = self
            .expirations_snapshot()
            .into_iter()
            .take_while(|(_, expiration)| is_expired(now, *expiration, true))
            .map(|(id, _)| id)
            .collect();
        if ids_to_remove.is_empty() {
            return Ok(());
        }

        log_info!(
            self.logger,
            "Removing {} expired public certificates",
            ids_to_remove.len()
        );
        self.database.remove_certificates(ids_to_remove.clone()).await?;
        let mut remaining = self.expirations_snapshot();
        remaining.retain(|(id, _)| !ids_to_remove.contains(id));
        self.replace_expirations(remaining)
    }

    async fn clear_public_certificates(&self) -> Result<()> {
        self.ensure_initialized().await?;
        self.database.clear().await?;
        self.replace_expirations(Vec::new())
    }
}

fn expirations_of(certificates: &[PublicCertificate]) -> ExpirationList {
    certificates
        .iter()
        .map(|cert| {
            let end = cert.end_time.unwrap_or_default().to_system_time();
            (cert.secret_id.clone(), end)
        })
        .collect()
}

fn sort_by_expiration(list: &mut ExpirationList) {
    list.sort_by(|a, b| a.1.cmp(&b.1));
}

/// Union of both lists keyed by id; entries from `new` win.
pub fn merge_expirations(old: &ExpirationList, new: &ExpirationList) -> ExpirationList {
    let mut merged: BTreeMap<Vec<u8>, SystemTime> = new.iter().cloned().collect();
    for (id, expiration) in old {
        merged.entry(id.clone()).or_insert(*expiration);
    }
    let mut list: ExpirationList = merged.into_iter().collect();
    sort_by_expiration(&mut list);
    list
}

fn expirations_to_value(list: &ExpirationList) -> Value {
    let map: Map<String, Value> = list
        .iter()
        .map(|(id, expiration)| {
            (
                URL_SAFE_NO_PAD.encode(id),
                Value::String(to_unix_nanos(*expiration).to_string()),
            )
        })
        .collect();
    Value::Object(map)
}

fn load_expirations(preferences: &dyn PreferenceStore, logger: &Logger) -> ExpirationList {
    let Some(Value::Object(map)) = preferences.get(prefs::PUBLIC_CERTIFICATE_EXPIRATIONS) else {
        return Vec::new();
    };

    let mut list = ExpirationList::with_capacity(map.len());
    for (encoded_id, value) in map {
        let id = URL_SAFE_NO_PAD.decode(encoded_id.as_bytes()).ok();
        let nanos = value.as_str().and_then(|s| s.parse::<i64>().ok());
        match (id, nanos) {
            (Some(id), Some(nanos)) => list.push((id, from_unix_nanos(nanos))),
            _ => {
                log_error!(logger, "Failed to decode public certificate expiration index");
                return Vec::new();
            }
        }
    }
    sort_by_expiration(&mut list);
    list
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::VALIDITY_BOUND_TOLERANCE;
    use crate::proto::{EncryptedMetadata, Timestamp};
    use crate::storage::{InMemoryPreferenceStore, InMemoryPublicCertificateDatabase};
    use std::time::{Duration, UNIX_EPOCH};

    fn logger() -> Arc<Logger> {
        Arc::new(Logger::new_root(Component::System, "storage-test"))
    }

    fn public_certificate(id: u8, end_secs: i64) -> PublicCertificate {
        PublicCertificate {
            secret_id: vec![id; 32],
            end_time: Some(Timestamp {
                seconds: end_secs,
                nanos: 0,
            }),
            ..Default::default()
        }
    }

    fn storage_with(
        db: Arc<InMemoryPublicCertificateDatabase>,
    ) -> (CertificateStorageImpl, Arc<InMemoryPreferenceStore>) {
        let prefs = Arc::new(InMemoryPreferenceStore::new());
        (CertificateStorageImpl::new(prefs.clone(), db, logger()), prefs)
    }

    fn private_certificate(visibility: DeviceVisibility, start_secs: u64) -> PrivateCertificate {
        PrivateCertificate::new(
            visibility,
            UNIX_EPOCH + Duration::from_secs(start_secs),
            EncryptedMetadata {
                device_name: Some("device".into()),
                bluetooth_mac_address: Some(vec![1; 6]),
                ..Default::default()
            },
        )
    }

    #[test]
    fn merge_prefers_new_entries_and_sorts() {
        let t = |s| UNIX_EPOCH + Duration::from_secs(s);
        let old = vec![(vec![1], t(10)), (vec![2], t(30))];
        let new = vec![(vec![2], t(5)), (vec![3], t(20))];
        let merged = merge_expirations(&old, &new);
        assert_eq!(
            merged,
            vec![(vec![2], t(5)), (vec![1], t(10)), (vec![3], t(20))]
        );
    }

    #[tokio::test]
    async fn expiration_index_is_sorted_and_persisted() {
        let db = Arc::new(InMemoryPublicCertificateDatabase::new());
        let (storage, prefs) = storage_with(db.clone());

        storage
            .add_public_certificates(vec![public_certificate(1, 300), public_certificate(2, 100)])
            .await
            .unwrap();
        storage
            .add_public_certificates(vec![public_certificate(3, 200)])
            .await
            .unwrap();

        assert_eq!(
            storage.get_public_certificate_ids(),
            vec![vec![2; 32], vec![3; 32], vec![1; 32]]
        );
        assert_eq!(
            storage.next_public_certificate_expiration_time(),
            Some(UNIX_EPOCH + Duration::from_secs(100))
        );

        let reloaded = CertificateStorageImpl::new(prefs, db, logger());
        assert_eq!(
            reloaded.get_public_certificate_ids(),
            storage.get_public_certificate_ids()
        );
    }

    #[tokio::test]
    async fn expired_public_certificates_use_tolerance() {
        let db = Arc::new(InMemoryPublicCertificateDatabase::new());
        let (storage, _) = storage_with(db.clone());
        storage
            .add_public_certificates(vec![
                public_certificate(1, 1_000),
                public_certificate(2, 2_000),
                public_certificate(3, 3_000),
            ])
            .await
            .unwrap();

        let end_two = UNIX_EPOCH + Duration::from_secs(2_000);
        storage
            .remove_expired_public_certificates(
                end_two + VALIDITY_BOUND_TOLERANCE - Duration::from_nanos(1),
            )
            .await
            .unwrap();
        assert_eq!(storage.get_public_certificate_ids(), vec![vec![2; 32], vec![3; 32]]);

        storage
            .remove_expired_public_certificates(end_two + VALIDITY_BOUND_TOLERANCE)
            .await
            .unwrap();
        assert_eq!(storage.get_public_certificate_ids(), vec![vec![3; 32]]);
        assert_eq!(db.len(), 1);
    }

    #[tokio::test]
    async fn replace_and_clear_public_certificates() {
        let db = Arc::new(InMemoryPublicCertificateDatabase::new());
        let (storage, _) = storage_with(db.clone());
        storage
            .add_public_certificates(vec![public_certificate(1, 100)])
            .await
            .unwrap();
        storage
            .replace_public_certificates(vec![public_certificate(2, 50), public_certificate(3, 10)])
            .await
            .unwrap();
        assert_eq!(storage.get_public_certificate_ids(), vec![vec![3; 32], vec![2; 32]]);
        assert_eq!(storage.get_public_certificates().await.unwrap().len(), 2);

        storage.clear_public_certificates().await.unwrap();
        assert!(storage.get_public_certificate_ids().is_empty());
        assert!(db.is_empty());
    }

    #[tokio::test]
    async fn corrupt_database_is_destroyed_and_reinitialized() {
        let db = Arc::new(InMemoryPublicCertificateDatabase::new());
        let (storage, _) = storage_with(db.clone());
        storage
            .add_public_certificates(vec![public_certificate(1, 100)])
            .await
            .unwrap();

        // A fresh storage over the same backends sees a corrupt database.
        let prefs = Arc::new(InMemoryPreferenceStore::new());
        let storage = CertificateStorageImpl::new(prefs, db.clone(), logger());
        db.script_init_results([InitStatus::Corrupt]);
        assert!(storage.get_public_certificates().await.unwrap().is_empty());
        assert_eq!(db.destroy_count(), 1);
        assert_eq!(storage.init_state().await, StorageInitState::Initialized);
    }

    #[tokio::test]
    async fn initialization_gives_up_after_bounded_attempts() {
        let db = Arc::new(InMemoryPublicCertificateDatabase::new());
        db.script_init_results([InitStatus::Error, InitStatus::Error, InitStatus::Error]);
        let (storage, _) = storage_with(db);

        assert!(storage.get_public_certificates().await.is_err());
        assert_eq!(storage.init_state().await, StorageInitState::Failed);
        assert!(storage
            .add_public_certificates(vec![public_certificate(1, 1)])
            .await
            .is_err());
    }

    #[tokio::test]
    async fn transient_errors_are_retried() {
        let db = Arc::new(InMemoryPublicCertificateDatabase::new());
        db.script_init_results([InitStatus::Error, InitStatus::Error]);
        let (storage, _) = storage_with(db);
        assert!(storage.get_public_certificates().await.is_ok());
        assert_eq!(storage.init_state().await, StorageInitState::Initialized);
    }

    #[tokio::test]
    async fn failed_destroy_marks_storage_failed() {
        let db = Arc::new(InMemoryPublicCertificateDatabase::new());
        db.script_init_results([InitStatus::Corrupt]);
        db.set_fail_destroy(true);
        let (storage, _) = storage_with(db);
        assert!(storage.clear_public_certificates().await.is_err());
        assert_eq!(storage.init_state().await, StorageInitState::Failed);
    }

    #[test]
    fn private_certificates_update_and_expire() {
        let db = Arc::new(InMemoryPublicCertificateDatabase::new());
        let (storage, _) = storage_with(db);

        let first = private_certificate(DeviceVisibility::AllContacts, 1_000);
        let second = private_certificate(DeviceVisibility::SelfShare, 500_000);
        storage
            .replace_private_certificates(&[first.clone(), second.clone()])
            .unwrap();
        assert_eq!(
            storage.next_private_certificate_expiration_time(),
            Some(first.not_after())
        );

        let mut updated = first.clone();
        updated.encrypt_metadata_key().unwrap();
        storage.update_private_certificate(&updated).unwrap();
        let stored = storage.get_private_certificates().unwrap();
        assert_eq!(stored[0].consumed_salts().len(), 1);

        let stranger = private_certificate(DeviceVisibility::AllContacts, 1_000);
        storage.update_private_certificate(&stranger).unwrap();
        assert_eq!(storage.get_private_certificates().unwrap().len(), 2);

        storage
            .remove_expired_private_certificates(first.not_after())
            .unwrap();
        let remaining = storage.get_private_certificates().unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].id(), second.id());
    }

    #[test]
    fn private_certificates_clear_by_visibility() {
        let db = Arc::new(InMemoryPublicCertificateDatabase::new());
        let (storage, _) = storage_with(db);
        storage
            .replace_private_certificates(&[
                private_certificate(DeviceVisibility::AllContacts, 0),
                private_certificate(DeviceVisibility::SelfShare, 0),
            ])
            .unwrap();

        storage
            .clear_private_certificates_of_visibility(DeviceVisibility::SelfShare)
            .unwrap();
        let remaining = storage.get_private_certificates().unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].visibility(), DeviceVisibility::AllContacts);

        storage.clear_private_certificates().unwrap();
        assert!(storage.get_private_certificates().unwrap().is_empty());
        assert!(storage.next_private_certificate_expiration_time().is_none());
    }

    #[test]
    fn corrupt_private_record_is_reported() {
        let db = Arc::new(InMemoryPublicCertificateDatabase::new());
        let (storage, prefs) = storage_with(db);
        prefs
            .set(
                prefs::PRIVATE_CERTIFICATES,
                serde_json::json!([{"visibility": 2}]),
            )
            .unwrap();
        assert!(storage.get_private_certificates().is_err());
    }
}
