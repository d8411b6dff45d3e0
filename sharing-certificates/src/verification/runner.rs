use prost::Message;
use sharing_common::{log_debug, log_info, log_warn, Component, Logger};
use std::sync::{Arc, Weak};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use super::connection::FrameConnection;
use super::frames_reader::IncomingFramesReader;
use super::{merge_results, PairedKeyVerificationResult, ShareTarget, VisibilitySettings};
use crate::clock::{Clock, SystemClock};
use crate::config::VerificationConfig;
use crate::constants::{
    AUTHENTICATION_TOKEN_HASH_LEN, RANDOM_SIGNATURE_LEN, RECEIVER_VERIFICATION_PREFIX,
    RELAX_AFTER_SET_VISIBILITY_TIMEOUT, SENDER_VERIFICATION_PREFIX,
};
use crate::crypto;
use crate::decrypted_public_certificate::DecryptedPublicCertificate;
use crate::manager::CertificateManager;
use crate::proto::{
    DeviceVisibility, Frame, OsType, PairedKeyEncryptionFrame, PairedKeyResultFrame,
    PairedKeyStatus, V1Frame, V1FrameType,
};

type Outcome = (PairedKeyVerificationResult, OsType);

/// Configures a [`PairedKeyVerificationRunner`].
pub struct PairedKeyVerificationRunnerBuilder {
    share_target: ShareTarget,
    token: Vec<u8>,
    connection: Arc<dyn FrameConnection>,
    certificate_manager: Arc<dyn CertificateManager>,
    visibility: VisibilitySettings,
    peer_certificate: Option<DecryptedPublicCertificate>,
    restrict_to_contacts: bool,
    frames_reader: Option<Arc<IncomingFramesReader>>,
    clock: Arc<dyn Clock>,
    local_os_type: OsType,
    config: VerificationConfig,
    logger: Arc<Logger>,
}

impl PairedKeyVerificationRunnerBuilder {
    /// Certificate the peer advertised, if it resolved to one we downloaded.
    pub fn with_peer_certificate(mut self, certificate: Option<DecryptedPublicCertificate>) -> Self {
        self.peer_certificate = certificate;
        self
    }

    pub fn with_restrict_to_contacts(mut self, restrict: bool) -> Self {
        self.restrict_to_contacts = restrict;
        self
    }

    /// Share a reader with other users of the same connection.
    pub fn with_frames_reader(mut self, reader: Arc<IncomingFramesReader>) -> Self {
        self.frames_reader = Some(reader);
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_local_os_type(mut self, os_type: OsType) -> Self {
        self.local_os_type = os_type;
        self
    }

    pub fn with_config(mut self, config: VerificationConfig) -> Self {
        self.config = config;
        self
    }

    pub fn build(self) -> Arc<PairedKeyVerificationRunner> {
        let (local_prefix, remote_prefix) = if self.share_target.is_incoming {
            (RECEIVER_VERIFICATION_PREFIX, SENDER_VERIFICATION_PREFIX)
        } else {
            (SENDER_VERIFICATION_PREFIX, RECEIVER_VERIFICATION_PREFIX)
        };
        let frames_reader = self.frames_reader.unwrap_or_else(|| {
            Arc::new(IncomingFramesReader::new(
                self.connection.clone(),
                self.logger.clone(),
            ))
        });
        let (released, _) = watch::channel(());

        Arc::new(PairedKeyVerificationRunner {
            inner: Arc::new(RunnerInner {
                share_target: self.share_target,
                token: self.token,
                connection: self.connection,
                certificate_manager: self.certificate_manager,
                visibility: self.visibility,
                peer_certificate: self.peer_certificate,
                restrict_to_contacts: self.restrict_to_contacts,
                frames_reader,
                clock: self.clock,
                local_os_type: self.local_os_type,
                config: self.config,
                local_prefix,
                remote_prefix,
                logger: self.logger,
            }),
            released,
        })
    }
}

/// Single-use driver of the paired-key exchange for one connection.
///
/// Each side sends a `PairedKeyEncryption` frame proving ownership of its
/// private certificate, checks the peer's frame, sends its verdict in a
/// `PairedKeyResult` frame and merges in the peer's verdict. Any read
/// timeout or malformed frame ends the run with [`PairedKeyVerificationResult::Fail`].
pub struct PairedKeyVerificationRunner {
    inner: Arc<RunnerInner>,
    released: watch::Sender<()>,
}

impl PairedKeyVerificationRunner {
    pub fn builder(
        share_target: ShareTarget,
        token: Vec<u8>,
        connection: Arc<dyn FrameConnection>,
        certificate_manager: Arc<dyn CertificateManager>,
        visibility: VisibilitySettings,
        logger: Arc<Logger>,
    ) -> PairedKeyVerificationRunnerBuilder {
        PairedKeyVerificationRunnerBuilder {
            share_target,
            token,
            connection,
            certificate_manager,
            visibility,
            peer_certificate: None,
            restrict_to_contacts: false,
            frames_reader: None,
            clock: Arc::new(SystemClock),
            local_os_type: OsType::UnknownOsType,
            config: VerificationConfig::default(),
            logger: Arc::new(logger.with_component(Component::Verification)),
        }
    }

    /// Run the exchange to completion; returns the merged result and the
    /// OS type the peer reported.
    pub async fn run(&self) -> (PairedKeyVerificationResult, OsType) {
        self.inner.run().await
    }

    /// Run on a background task. The task keeps only a weak handle on the
    /// runner: dropping the runner abandons the exchange and `callback` is
    /// never invoked.
    pub fn spawn<F>(self: &Arc<Self>, callback: F) -> JoinHandle<()>
    where
        F: FnOnce(PairedKeyVerificationResult, OsType) + Send + 'static,
    {
        let runner: Weak<Self> = Arc::downgrade(self);
        let inner = self.inner.clone();
        let mut released = self.released.subscribe();

        tokio::spawn(async move {
            let outcome = tokio::select! {
                outcome = inner.run() => outcome,
                _ = released.changed() => {
                    log_warn!(inner.logger, "Verification runner released before completion");
                    return;
                }
            };
            if runner.upgrade().is_none() {
                log_warn!(inner.logger, "Verification runner released before completion");
                return;
            }
            callback(outcome.0, outcome.1);
        })
    }
}

struct RunnerInner {
    share_target: ShareTarget,
    token: Vec<u8>,
    connection: Arc<dyn FrameConnection>,
    certificate_manager: Arc<dyn CertificateManager>,
    visibility: VisibilitySettings,
    peer_certificate: Option<DecryptedPublicCertificate>,
    restrict_to_contacts: bool,
    frames_reader: Arc<IncomingFramesReader>,
    clock: Arc<dyn Clock>,
    local_os_type: OsType,
    config: VerificationConfig,
    local_prefix: u8,
    remote_prefix: u8,
    logger: Arc<Logger>,
}

impl RunnerInner {
    async fn run(&self) -> Outcome {
        let failed = (PairedKeyVerificationResult::Fail, OsType::UnknownOsType);

        if let Err(e) = self.send_paired_key_encryption_frame().await {
            log_warn!(self.logger, "Failed to send paired key encryption frame: {e}");
            return failed;
        }

        let Some(encryption) = self
            .read(V1FrameType::PairedKeyEncryption)
            .await
            .and_then(|frame| frame.paired_key_encryption)
        else {
            log_warn!(self.logger, "Failed to read remote paired key encryption frame");
            return failed;
        };

        let Some(identity_result) = self.verify_remote_identity(&encryption).await else {
            log_info!(
                self.logger,
                "Only contacts are allowed; rejecting unknown share target {}",
                self.share_target.id
            );
            let _ = self
                .send_paired_key_result_frame(PairedKeyVerificationResult::Fail)
                .await;
            return failed;
        };
        log_debug!(
            self.logger,
            "Remote public certificate verification result {:?}",
            identity_result
        );

        let signature_result = self.verify_paired_key_encryption_frame(&encryption);
        log_debug!(
            self.logger,
            "Paired key encryption verification result {:?}",
            signature_result
        );

        let local_result = merge_results(&[identity_result, signature_result]);
        if let Err(e) = self.send_paired_key_result_frame(local_result).await {
            log_warn!(self.logger, "Failed to send paired key result frame: {e}");
            return failed;
        }

        let Some(result_frame) = self
            .read(V1FrameType::PairedKeyResult)
            .await
            .and_then(|frame| frame.paired_key_result)
        else {
            log_warn!(self.logger, "Failed to read remote paired key result frame");
            return failed;
        };

        let remote_result = result_frame
            .status
            .and_then(|s| PairedKeyStatus::try_from(s).ok())
            .map(PairedKeyVerificationResult::from)
            .unwrap_or(PairedKeyVerificationResult::Unknown);
        let combined = merge_results(&[identity_result, signature_result, remote_result]);
        let os_type = result_frame
            .os_type
            .and_then(|t| OsType::try_from(t).ok())
            .unwrap_or(OsType::UnknownOsType);

        log_info!(
            self.logger,
            "Paired key verification with {} finished: {:?}",
            self.share_target.id,
            combined
        );
        (combined, os_type)
    }

    async fn read(&self, frame_type: V1FrameType) -> Option<V1Frame> {
        self.frames_reader
            .read_frame(frame_type, self.config.read_frame_timeout)
            .await
    }

    /// The visibility changed recently enough that the peer may still hold
    /// certificates for the previous one.
    fn is_visibility_recently_changed(&self) -> bool {
        let since_change = self
            .clock
            .now()
            .duration_since(self.visibility.last_visibility_timestamp)
            .unwrap_or_default();
        self.share_target.is_known && since_change < RELAX_AFTER_SET_VISIBILITY_TIMEOUT
    }

    fn relax_restrict_to_contacts(&self) -> bool {
        self.is_visibility_recently_changed()
            || (self.share_target.is_incoming
                && self.visibility.visibility == DeviceVisibility::Everyone)
    }

    fn prefixed_token(&self, prefix: u8) -> Vec<u8> {
        let mut data = Vec::with_capacity(self.token.len() + 1);
        data.push(prefix);
        data.extend_from_slice(&self.token);
        data
    }

    async fn send_paired_key_encryption_frame(&self) -> crate::error::Result<()> {
        let payload = self.prefixed_token(self.local_prefix);
        let signed_data = self
            .certificate_manager
            .sign_with_private_certificate(signing_visibility(self.visibility.visibility), &payload)
            .await
            .filter(|signature| !signature.is_empty())
            .unwrap_or_else(|| crypto::random_bytes(RANDOM_SIGNATURE_LEN));

        let optional_signed_data = if self.is_visibility_recently_changed() {
            log_info!(
                self.logger,
                "Also signing the authentication token with the previous visibility's certificate"
            );
            self.certificate_manager
                .sign_with_private_certificate(
                    signing_visibility(self.visibility.last_visibility),
                    &payload,
                )
                .await
        } else {
            None
        };

        let secret_id_hash = self
            .peer_certificate
            .as_ref()
            .map(|cert| cert.hash_authentication_token(&self.token))
            .filter(|hash| !hash.is_empty())
            .unwrap_or_else(|| crypto::random_bytes(AUTHENTICATION_TOKEN_HASH_LEN));

        let frame = Frame::v1(V1Frame {
            r#type: Some(V1FrameType::PairedKeyEncryption as i32),
            paired_key_encryption: Some(PairedKeyEncryptionFrame {
                signed_data: Some(signed_data),
                secret_id_hash: Some(secret_id_hash),
                optional_signed_data,
            }),
            ..Default::default()
        });
        self.connection.write(frame.encode_to_vec()).await
    }

    async fn send_paired_key_result_frame(
        &self,
        result: PairedKeyVerificationResult,
    ) -> crate::error::Result<()> {
        let frame = Frame::v1(V1Frame {
            r#type: Some(V1FrameType::PairedKeyResult as i32),
            paired_key_result: Some(PairedKeyResultFrame {
                status: Some(PairedKeyStatus::from(result) as i32),
                os_type: Some(self.local_os_type as i32),
            }),
            ..Default::default()
        });
        self.connection.write(frame.encode_to_vec()).await
    }

    /// Did the peer hash the token with one of our certificates? `None`
    /// means the peer must be rejected outright.
    async fn verify_remote_identity(
        &self,
        frame: &PairedKeyEncryptionFrame,
    ) -> Option<PairedKeyVerificationResult> {
        let result = self
            .verify_identity_with_visibility(self.visibility.visibility, frame)
            .await;
        if result == PairedKeyVerificationResult::Success {
            return Some(result);
        }

        let relax = self.relax_restrict_to_contacts();
        if self.restrict_to_contacts && !relax {
            return None;
        }
        if relax && self.visibility.last_visibility != self.visibility.visibility {
            return Some(
                self.verify_identity_with_visibility(self.visibility.last_visibility, frame)
                    .await,
            );
        }
        Some(result)
    }

    async fn verify_identity_with_visibility(
        &self,
        visibility: DeviceVisibility,
        frame: &PairedKeyEncryptionFrame,
    ) -> PairedKeyVerificationResult {
        let expected = self
            .certificate_manager
            .hash_authentication_token_with_private_certificate(visibility, &self.token)
            .await;
        match (expected, frame.secret_id_hash.as_ref()) {
            (Some(expected), Some(received)) if expected == *received => {
                PairedKeyVerificationResult::Success
            }
            _ => PairedKeyVerificationResult::Unable,
        }
    }

    /// Check the peer's signature against the certificate we resolved for it.
    fn verify_paired_key_encryption_frame(
        &self,
        frame: &PairedKeyEncryptionFrame,
    ) -> PairedKeyVerificationResult {
        let Some(certificate) = &self.peer_certificate else {
            log_debug!(self.logger, "No peer certificate; signature cannot be checked");
            return PairedKeyVerificationResult::Unable;
        };

        let payload = self.prefixed_token(self.remote_prefix);
        let verifies = |signature: &Option<Vec<u8>>| {
            signature
                .as_ref()
                .is_some_and(|s| certificate.verify_signature(&payload, s))
        };

        if !verifies(&frame.signed_data) {
            if frame.optional_signed_data.is_none() {
                log_warn!(self.logger, "Peer signature did not verify");
                return PairedKeyVerificationResult::Fail;
            }
            if !verifies(&frame.optional_signed_data) {
                log_warn!(self.logger, "Neither peer signature verified");
                return PairedKeyVerificationResult::Fail;
            }
            log_info!(self.logger, "Peer verified with its previous visibility's signature");
        }

        if !self.share_target.is_known {
            log_info!(self.logger, "Peer signature verified but peer is not a known contact");
            return PairedKeyVerificationResult::Unable;
        }
        PairedKeyVerificationResult::Success
    }
}

/// Everyone-visibility devices sign with their all-contacts certificate.
fn signing_visibility(visibility: DeviceVisibility) -> DeviceVisibility {
    match visibility {
        DeviceVisibility::Everyone => DeviceVisibility::AllContacts,
        other => other,
    }
}
