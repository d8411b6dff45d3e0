// INTENTION: Wire and storage messages exchanged with peers and with the
// remote certificate service. Messages are declared by hand with prost's
// derive so no build script or .proto compilation is needed.

use prost::{Enumeration, Message};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/* -------------------------------------------------------------------------
 * Shared resources
 * ---------------------------------------------------------------------- */

/// Who is allowed to discover and authenticate the local device.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Enumeration)]
#[repr(i32)]
pub enum DeviceVisibility {
    Unspecified = 0,
    Everyone = 1,
    AllContacts = 2,
    SelectedContacts = 3,
    Hidden = 4,
    SelfShare = 5,
}

/// Seconds/nanos since the unix epoch.
#[derive(Clone, Copy, PartialEq, Eq, Message)]
pub struct Timestamp {
    #[prost(int64, tag = "1")]
    pub seconds: i64,
    #[prost(int32, tag = "2")]
    pub nanos: i32,
}

impl Timestamp {
    /// Second-resolution timestamp; sub-second precision is dropped.
    pub fn from_system_time_secs(time: SystemTime) -> Self {
        let seconds = match time.duration_since(UNIX_EPOCH) {
            Ok(d) => d.as_secs() as i64,
            Err(e) => -(e.duration().as_secs_f64().ceil() as i64),
        };
        Self { seconds, nanos: 0 }
    }

    pub fn to_system_time(&self) -> SystemTime {
        let nanos = Duration::from_nanos(self.nanos.max(0) as u64);
        if self.seconds >= 0 {
            UNIX_EPOCH + Duration::from_secs(self.seconds as u64) + nanos
        } else {
            UNIX_EPOCH - Duration::from_secs(self.seconds.unsigned_abs()) + nanos
        }
    }
}

/// Device metadata carried encrypted inside public certificates.
#[derive(Clone, PartialEq, Message)]
pub struct EncryptedMetadata {
    #[prost(string, optional, tag = "1")]
    pub device_name: Option<String>,
    #[prost(string, optional, tag = "2")]
    pub full_name: Option<String>,
    #[prost(string, optional, tag = "3")]
    pub icon_url: Option<String>,
    #[prost(bytes = "vec", optional, tag = "4")]
    pub bluetooth_mac_address: Option<Vec<u8>>,
    #[prost(string, optional, tag = "6")]
    pub account_name: Option<String>,
    #[prost(int32, optional, tag = "7")]
    pub vendor_id: Option<i32>,
}

/// Public view of a private certificate, uploaded to and downloaded from the
/// certificate service.
#[derive(Clone, PartialEq, Message)]
pub struct PublicCertificate {
    #[prost(bytes = "vec", tag = "1")]
    pub secret_id: Vec<u8>,
    #[prost(bytes = "vec", tag = "2")]
    pub secret_key: Vec<u8>,
    #[prost(bytes = "vec", tag = "3")]
    pub public_key: Vec<u8>,
    #[prost(message, optional, tag = "4")]
    pub start_time: Option<Timestamp>,
    #[prost(message, optional, tag = "5")]
    pub end_time: Option<Timestamp>,
    #[prost(bool, tag = "6")]
    pub for_selected_contacts: bool,
    #[prost(bytes = "vec", tag = "7")]
    pub metadata_encryption_key: Vec<u8>,
    #[prost(bytes = "vec", tag = "8")]
    pub encrypted_metadata_bytes: Vec<u8>,
    #[prost(bytes = "vec", tag = "9")]
    pub metadata_encryption_key_tag: Vec<u8>,
    #[prost(bool, tag = "10")]
    pub for_self_share: bool,
}

/* -------------------------------------------------------------------------
 * Connection frames
 * ---------------------------------------------------------------------- */

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Enumeration)]
#[repr(i32)]
pub enum FrameVersion {
    UnknownVersion = 0,
    V1 = 1,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Enumeration)]
#[repr(i32)]
pub enum V1FrameType {
    UnknownFrameType = 0,
    Introduction = 1,
    Response = 2,
    PairedKeyEncryption = 3,
    PairedKeyResult = 4,
    CertificateInfo = 5,
    Cancel = 6,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Enumeration)]
#[repr(i32)]
pub enum PairedKeyStatus {
    Unknown = 0,
    Success = 1,
    Fail = 2,
    Unable = 3,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Enumeration)]
#[repr(i32)]
pub enum OsType {
    UnknownOsType = 0,
    Android = 1,
    ChromeOs = 2,
    Ios = 3,
    Windows = 4,
    MacOs = 5,
}

#[derive(Clone, PartialEq, Message)]
pub struct Frame {
    #[prost(enumeration = "FrameVersion", optional, tag = "1")]
    pub version: Option<i32>,
    #[prost(message, optional, tag = "2")]
    pub v1: Option<V1Frame>,
}

#[derive(Clone, PartialEq, Message)]
pub struct V1Frame {
    #[prost(enumeration = "V1FrameType", optional, tag = "1")]
    pub r#type: Option<i32>,
    #[prost(message, optional, tag = "4")]
    pub paired_key_encryption: Option<PairedKeyEncryptionFrame>,
    #[prost(message, optional, tag = "5")]
    pub paired_key_result: Option<PairedKeyResultFrame>,
}

#[derive(Clone, PartialEq, Message)]
pub struct PairedKeyEncryptionFrame {
    #[prost(bytes = "vec", optional, tag = "1")]
    pub signed_data: Option<Vec<u8>>,
    #[prost(bytes = "vec", optional, tag = "2")]
    pub secret_id_hash: Option<Vec<u8>>,
    #[prost(bytes = "vec", optional, tag = "3")]
    pub optional_signed_data: Option<Vec<u8>>,
}

#[derive(Clone, PartialEq, Message)]
pub struct PairedKeyResultFrame {
    #[prost(enumeration = "PairedKeyStatus", optional, tag = "1")]
    pub status: Option<i32>,
    #[prost(enumeration = "OsType", optional, tag = "2")]
    pub os_type: Option<i32>,
}

impl Frame {
    /// Wraps a V1 frame in the versioned envelope.
    pub fn v1(frame: V1Frame) -> Self {
        Self {
            version: Some(FrameVersion::V1 as i32),
            v1: Some(frame),
        }
    }
}

impl V1Frame {
    pub fn frame_type(&self) -> V1FrameType {
        self.r#type
            .and_then(|t| V1FrameType::try_from(t).ok())
            .unwrap_or(V1FrameType::UnknownFrameType)
    }
}

/* -------------------------------------------------------------------------
 * Certificate service messages
 * ---------------------------------------------------------------------- */

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Enumeration)]
#[repr(i32)]
pub enum ContactUpdate {
    Unspecified = 0,
    Added = 1,
    Removed = 2,
}

#[derive(Clone, PartialEq, Message)]
pub struct PublishDeviceRequest {
    /// Resource name, `devices/<device id>`.
    #[prost(string, tag = "1")]
    pub name: String,
    #[prost(message, repeated, tag = "2")]
    pub public_certificates: Vec<PublicCertificate>,
    #[prost(bool, tag = "3")]
    pub force_update_contacts: bool,
}

#[derive(Clone, PartialEq, Message)]
pub struct PublishDeviceResponse {
    #[prost(enumeration = "ContactUpdate", repeated, tag = "1")]
    pub contact_updates: Vec<i32>,
}

impl PublishDeviceResponse {
    pub fn contacts_removed(&self) -> bool {
        self.contact_updates
            .iter()
            .any(|u| *u == ContactUpdate::Removed as i32)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Enumeration)]
#[repr(i32)]
pub enum SharedCredentialDataType {
    Unspecified = 0,
    PublicCertificate = 1,
    DeviceContactsHash = 2,
}

#[derive(Clone, PartialEq, Message)]
pub struct SharedCredential {
    #[prost(int64, tag = "1")]
    pub id: i64,
    #[prost(bytes = "vec", tag = "2")]
    pub data: Vec<u8>,
    #[prost(enumeration = "SharedCredentialDataType", tag = "3")]
    pub data_type: i32,
}

#[derive(Clone, PartialEq, Message)]
pub struct QuerySharedCredentialsRequest {
    #[prost(string, tag = "1")]
    pub name: String,
    #[prost(string, optional, tag = "2")]
    pub page_token: Option<String>,
}

#[derive(Clone, PartialEq, Message)]
pub struct QuerySharedCredentialsResponse {
    #[prost(message, repeated, tag = "1")]
    pub shared_credentials: Vec<SharedCredential>,
    #[prost(string, tag = "2")]
    pub next_page_token: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn v1_frame_type_defaults_to_unknown() {
        let frame = V1Frame::default();
        assert_eq!(frame.frame_type(), V1FrameType::UnknownFrameType);

        let frame = V1Frame {
            r#type: Some(42),
            ..Default::default()
        };
        assert_eq!(frame.frame_type(), V1FrameType::UnknownFrameType);
    }

    #[test]
    fn contacts_removed_is_detected_among_updates() {
        let response = PublishDeviceResponse {
            contact_updates: vec![ContactUpdate::Added as i32, ContactUpdate::Removed as i32],
        };
        assert!(response.contacts_removed());
        assert!(!PublishDeviceResponse::default().contacts_removed());
    }

    #[test]
    fn timestamp_truncates_to_seconds() {
        let time = UNIX_EPOCH + Duration::from_millis(1_700_000_000_750);
        let ts = Timestamp::from_system_time_secs(time);
        assert_eq!(ts.seconds, 1_700_000_000);
        assert_eq!(ts.nanos, 0);
        assert_eq!(
            ts.to_system_time(),
            UNIX_EPOCH + Duration::from_secs(1_700_000_000)
        );
    }

    #[test]
    fn encryption_frame_survives_encoding() {
        let frame = Frame::v1(V1Frame {
            r#type: Some(V1FrameType::PairedKeyEncryption as i32),
            paired_key_encryption: Some(PairedKeyEncryptionFrame {
                signed_data: Some(vec![1, 2, 3]),
                secret_id_hash: Some(vec![4; 6]),
                optional_signed_data: None,
            }),
            paired_key_result: None,
        });
        let decoded = Frame::decode(frame.encode_to_vec().as_slice()).unwrap();
        let v1 = decoded.v1.unwrap();
        assert_eq!(v1.frame_type(), V1FrameType::PairedKeyEncryption);
        assert!(v1
            .paired_key_encryption
            .unwrap()
            .optional_signed_data
            .is_none());
    }
}
