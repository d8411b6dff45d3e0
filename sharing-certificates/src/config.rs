//! Tunables for the certificate manager and the verification runner.
//!
//! Durations are serialized as integer milliseconds so configs stay readable
//! in JSON.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::constants::{
    DEFAULT_READ_FRAME_TIMEOUT, DEVICE_ID_PREFIX, PUBLIC_CERTIFICATE_DOWNLOAD_PERIOD,
    SCHEDULER_BASE_RETRY_DELAY, SCHEDULER_MAX_RETRY_DELAY,
};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CertificateManagerConfig {
    /// Prepended to the local device id to form the remote resource name.
    pub device_id_prefix: String,
    #[serde(with = "duration_millis")]
    pub download_period: Duration,
    #[serde(with = "duration_millis")]
    pub scheduler_base_retry_delay: Duration,
    #[serde(with = "duration_millis")]
    pub scheduler_max_retry_delay: Duration,
}

impl Default for CertificateManagerConfig {
    fn default() -> Self {
        Self {
            device_id_prefix: DEVICE_ID_PREFIX.to_string(),
            download_period: PUBLIC_CERTIFICATE_DOWNLOAD_PERIOD,
            scheduler_base_retry_delay: SCHEDULER_BASE_RETRY_DELAY,
            scheduler_max_retry_delay: SCHEDULER_MAX_RETRY_DELAY,
        }
    }
}

impl CertificateManagerConfig {
    pub fn with_download_period(mut self, period: Duration) -> Self {
        self.download_period = period;
        self
    }

    pub fn with_retry_delays(mut self, base: Duration, max: Duration) -> Self {
        self.scheduler_base_retry_delay = base;
        self.scheduler_max_retry_delay = max;
        self
    }

    pub fn device_resource_name(&self, device_id: &str) -> String {
        format!("{}{}", self.device_id_prefix, device_id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct VerificationConfig {
    #[serde(with = "duration_millis")]
    pub read_frame_timeout: Duration,
}

impl Default for VerificationConfig {
    fn default() -> Self {
        Self {
            read_frame_timeout: DEFAULT_READ_FRAME_TIMEOUT,
        }
    }
}

mod duration_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}
