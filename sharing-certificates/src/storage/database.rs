//! Row storage for downloaded public certificates, keyed by `secret_id`.

use async_trait::async_trait;
use prost::Message;
use std::collections::{BTreeMap, VecDeque};
use std::io::ErrorKind;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use crate::error::{CertificateError, Result};
use crate::proto::PublicCertificate;

/// Outcome of opening the database.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitStatus {
    Ok,
    /// Transient failure; initialization may be retried.
    Error,
    /// The backing data is unreadable and must be destroyed.
    Corrupt,
}

#[async_trait]
pub trait PublicCertificateDatabase: Send + Sync {
    async fn initialize(&self) -> InitStatus;
    /// Erase all data, including anything unreadable.
    async fn destroy(&self) -> Result<()>;
    async fn load_all(&self) -> Result<Vec<PublicCertificate>>;
    /// Insert or overwrite by `secret_id`.
    async fn add_certificates(&self, certificates: Vec<PublicCertificate>) -> Result<()>;
    async fn remove_certificates(&self, ids: Vec<Vec<u8>>) -> Result<()>;
    async fn clear(&self) -> Result<()>;
}

type Rows = BTreeMap<Vec<u8>, PublicCertificate>;

fn upsert(rows: &mut Rows, certificates: Vec<PublicCertificate>) {
    for certificate in certificates {
        rows.insert(certificate.secret_id.clone(), certificate);
    }
}

/* -------------------------------------------------------------------------
 * In-memory database with scripted failures
 * ---------------------------------------------------------------------- */

/// In-memory database. Initialization results can be scripted and
/// operations can be made to fail, to exercise storage recovery paths.
#[derive(Default)]
pub struct InMemoryPublicCertificateDatabase {
    rows: Mutex<Rows>,
    init_results: Mutex<VecDeque<InitStatus>>,
    fail_operations: AtomicBool,
    fail_destroy: AtomicBool,
    destroy_count: Mutex<usize>,
}

impl InMemoryPublicCertificateDatabase {
    pub fn new() -> Self {
        Self::default()
    }

    /// Results returned by the next `initialize` calls, in order. Once
    /// exhausted, initialization succeeds.
    pub fn script_init_results(&self, results: impl IntoIterator<Item = InitStatus>) {
        if let Ok(mut queue) = self.init_results.lock() {
            queue.extend(results);
        }
    }

    pub fn set_fail_operations(&self, fail: bool) {
        self.fail_operations.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_destroy(&self, fail: bool) {
        self.fail_destroy.store(fail, Ordering::SeqCst);
    }

    pub fn destroy_count(&self) -> usize {
        self.destroy_count.lock().map(|c| *c).unwrap_or(0)
    }

    pub fn len(&self) -> usize {
        self.rows.lock().map(|rows| rows.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn rows(&self) -> Result<std::sync::MutexGuard<'_, Rows>> {
        if self.fail_operations.load(Ordering::SeqCst) {
            return Err(CertificateError::Storage("scripted database failure".into()));
        }
        self.rows
            .lock()
            .map_err(|_| CertificateError::Storage("database lock poisoned".into()))
    }
}

#[async_trait]
impl PublicCertificateDatabase for InMemoryPublicCertificateDatabase {
    async fn initialize(&self) -> InitStatus {
        self.init_results
            .lock()
            .ok()
            .and_then(|mut queue| queue.pop_front())
            .unwrap_or(InitStatus::Ok)
    }

    async fn destroy(&self) -> Result<()> {
        if self.fail_destroy.load(Ordering::SeqCst) {
            return Err(CertificateError::Storage("scripted destroy failure".into()));
        }
        if let Ok(mut count) = self.destroy_count.lock() {
            *count += 1;
        }
        self.rows
            .lock()
            .map_err(|_| CertificateError::Storage("database lock poisoned".into()))?
            .clear();
        Ok(())
    }

    async fn load_all(&self) -> Result<Vec<PublicCertificate>> {
        Ok(self.rows()?.values().cloned().collect())
    }

    async fn add_certificates(&self, certificates: Vec<PublicCertificate>) -> Result<()> {
        let mut rows = self.rows()?;
        upsert(&mut rows, certificates);
        Ok(())
    }

    async fn remove_certificates(&self, ids: Vec<Vec<u8>>) -> Result<()> {
        let mut rows = self.rows()?;
        for id in ids {
            rows.remove(&id);
        }
        Ok(())
    }

    async fn clear(&self) -> Result<()> {
        self.rows()?.clear();
        Ok(())
    }
}

/* -------------------------------------------------------------------------
 * File-backed database
 * ---------------------------------------------------------------------- */

/// Stores all rows in one file of length-delimited `PublicCertificate`
/// messages. Rows are cached in memory once the file has been read.
pub struct FilePublicCertificateDatabase {
    path: PathBuf,
    rows: tokio::sync::Mutex<Option<Rows>>,
}

impl FilePublicCertificateDatabase {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            rows: tokio::sync::Mutex::new(None),
        }
    }

    fn decode_rows(bytes: &[u8]) -> Result<Rows> {
        let mut rows = Rows::new();
        let mut buf = bytes;
        while !buf.is_empty() {
            let certificate = PublicCertificate::decode_length_delimited(&mut buf)?;
            rows.insert(certificate.secret_id.clone(), certificate);
        }
        Ok(rows)
    }

    async fn write_rows(&self, rows: &Rows) -> Result<()> {
        let mut bytes = Vec::new();
        for certificate in rows.values() {
            certificate
                .encode_length_delimited(&mut bytes)
                .map_err(|e| CertificateError::Serialization(e.to_string()))?;
        }
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let tmp_path = self.path.with_extension("tmp");
        tokio::fs::write(&tmp_path, &bytes).await?;
        tokio::fs::rename(&tmp_path, &self.path).await?;
        Ok(())
    }

    /// Apply `mutate` to the cached rows and write them back.
    async fn update(&self, mutate: impl FnOnce(&mut Rows) + Send) -> Result<()> {
        let mut guard = self.rows.lock().await;
        let rows = guard
            .as_mut()
            .ok_or_else(|| CertificateError::Storage("database not initialized".into()))?;
        mutate(rows);
        self.write_rows(rows).await
    }
}

#[async_trait]
impl PublicCertificateDatabase for FilePublicCertificateDatabase {
    async fn initialize(&self) -> InitStatus {
        let bytes = match tokio::fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => Vec::new(),
            Err(_) => return InitStatus::Error,
        };
        match Self::decode_rows(&bytes) {
            Ok(rows) => {
                *self.rows.lock().await = Some(rows);
                InitStatus::Ok
            }
            Err(_) => InitStatus::Corrupt,
        }
    }

    async fn destroy(&self) -> Result<()> {
        let mut guard = self.rows.lock().await;
        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        *guard = None;
        Ok(())
    }

    async fn load_all(&self) -> Result<Vec<PublicCertificate>> {
        let guard = self.rows.lock().await;
        guard
            .as_ref()
            .map(|rows| rows.values().cloned().collect())
            .ok_or_else(|| CertificateError::Storage("database not initialized".into()))
    }

    async fn add_certificates(&self, certificates: Vec<PublicCertificate>) -> Result<()> {
        self.update(move |rows| upsert(rows, certificates)).await
    }

    async fn remove_certificates(&self, ids: Vec<Vec<u8>>) -> Result<()> {
        self.update(move |rows| {
            for id in ids {
                rows.remove(&id);
            }
        })
        .await
    }

    async fn clear(&self) -> Result<()> {
        self.update(|rows| rows.clear()).await
    }
}
