//! Protocol constants shared by certificate generation, storage and verification.

use std::time::Duration;

const HOUR: u64 = 60 * 60;
const MINUTE: u64 = 60;

/// Lifetime of a private certificate: `not_after - not_before`.
pub const VALIDITY_PERIOD: Duration = Duration::from_secs(72 * HOUR);

/// Upper bound (exclusive) of the random jitter applied to public certificate bounds.
pub const MAX_VALIDITY_BOUND_OFFSET: Duration = Duration::from_secs(2 * HOUR);

/// Clock-skew tolerance applied to public certificate validity checks.
pub const VALIDITY_BOUND_TOLERANCE: Duration = Duration::from_secs(30 * MINUTE);

/// Certificates kept per generated visibility.
pub const NUM_PRIVATE_CERTIFICATES: usize = 3;

/// Half of the 16-bit salt space.
pub const MAX_SALTS: usize = 32768;

pub const MAX_SALT_GENERATION_RETRIES: usize = 128;

pub const PUBLIC_CERTIFICATE_DOWNLOAD_PERIOD: Duration = Duration::from_secs(12 * HOUR);

/// Window after a visibility change during which the previous visibility is still honored.
pub const RELAX_AFTER_SET_VISIBILITY_TIMEOUT: Duration = Duration::from_secs(15 * MINUTE);

pub const SECRET_KEY_LEN: usize = 32;
pub const CERTIFICATE_ID_LEN: usize = 32;
pub const METADATA_ENCRYPTION_KEY_LEN: usize = 14;
pub const SALT_LEN: usize = 2;
pub const METADATA_KEY_TAG_LEN: usize = 32;
pub const AUTHENTICATION_TOKEN_HASH_LEN: usize = 6;
pub const BLUETOOTH_MAC_ADDRESS_LEN: usize = 6;

/// AES-256-GCM key and nonce sizes.
pub const AES_GCM_KEY_LEN: usize = 32;
pub const AES_GCM_NONCE_LEN: usize = 12;

/// AES-CTR initial counter block size.
pub const AES_CTR_IV_LEN: usize = 16;

/// Size of the random filler sent when no signature can be produced.
pub const RANDOM_SIGNATURE_LEN: usize = 72;

/// Role prefixes prepended to the shared token before signing.
pub const SENDER_VERIFICATION_PREFIX: u8 = 0x01;
pub const RECEIVER_VERIFICATION_PREFIX: u8 = 0x02;

pub const STORAGE_MAX_INIT_ATTEMPTS: u32 = 3;

pub const SCHEDULER_BASE_RETRY_DELAY: Duration = Duration::from_secs(5);
pub const SCHEDULER_MAX_RETRY_DELAY: Duration = Duration::from_secs(HOUR);

pub const DEFAULT_READ_FRAME_TIMEOUT: Duration = Duration::from_secs(15);

pub const DEVICE_ID_PREFIX: &str = "devices/";
