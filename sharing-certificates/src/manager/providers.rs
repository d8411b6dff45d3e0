//! Sources of the local device and account data that go into certificate
//! metadata.

use std::sync::RwLock;

use crate::constants::BLUETOOTH_MAC_ADDRESS_LEN;
use crate::proto::EncryptedMetadata;

/// The signed-in account, if any.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Account {
    pub email: String,
    pub display_name: Option<String>,
    pub picture_url: Option<String>,
}

pub trait AccountManager: Send + Sync {
    fn current_account(&self) -> Option<Account>;
}

pub trait LocalDeviceDataProvider: Send + Sync {
    /// Stable device id used in remote resource names.
    fn id(&self) -> String;
    fn device_name(&self) -> String;
    fn full_name(&self) -> Option<String>;
    fn icon_url(&self) -> Option<String>;
    fn vendor_id(&self) -> i32;
    /// Bluetooth adapter address, `None` when the adapter is unavailable.
    fn bluetooth_mac_address(&self) -> Option<Vec<u8>>;
}

/// Metadata shared by every certificate generated in one refresh.
///
/// Fails without a device name or a 6-byte Bluetooth address; the profile
/// fields are included only when an account is signed in.
pub fn build_metadata(
    device: &dyn LocalDeviceDataProvider,
    account: Option<&Account>,
) -> Option<EncryptedMetadata> {
    let device_name = device.device_name();
    if device_name.is_empty() {
        return None;
    }
    let bluetooth_mac_address = device
        .bluetooth_mac_address()
        .filter(|address| address.len() == BLUETOOTH_MAC_ADDRESS_LEN)?;

    let (full_name, icon_url, account_name) = match account {
        Some(account) => (
            device.full_name(),
            device.icon_url(),
            Some(account.email.clone()),
        ),
        None => (None, None, None),
    };

    Some(EncryptedMetadata {
        device_name: Some(device_name),
        full_name,
        icon_url,
        bluetooth_mac_address: Some(bluetooth_mac_address),
        account_name,
        vendor_id: Some(device.vendor_id()),
    })
}

#[derive(Debug, Clone)]
struct DeviceData {
    id: String,
    device_name: String,
    full_name: Option<String>,
    icon_url: Option<String>,
    vendor_id: i32,
    bluetooth_mac_address: Option<Vec<u8>>,
}

/// Settable device data for tests.
pub struct FakeLocalDeviceDataProvider {
    data: RwLock<DeviceData>,
}

impl FakeLocalDeviceDataProvider {
    pub fn new(id: &str, device_name: &str) -> Self {
        Self {
            data: RwLock::new(DeviceData {
                id: id.to_string(),
                device_name: device_name.to_string(),
                full_name: None,
                icon_url: None,
                vendor_id: 0,
                bluetooth_mac_address: Some(vec![0x11, 0x22, 0x33, 0x44, 0x55, 0x66]),
            }),
        }
    }

    fn update(&self, f: impl FnOnce(&mut DeviceData)) {
        if let Ok(mut data) = self.data.write() {
            f(&mut data);
        }
    }

    pub fn set_device_name(&self, name: &str) {
        self.update(|d| d.device_name = name.to_string());
    }

    pub fn set_full_name(&self, name: Option<&str>) {
        self.update(|d| d.full_name = name.map(str::to_string));
    }

    pub fn set_icon_url(&self, url: Option<&str>) {
        self.update(|d| d.icon_url = url.map(str::to_string));
    }

    pub fn set_bluetooth_mac_address(&self, address: Option<Vec<u8>>) {
        self.update(|d| d.bluetooth_mac_address = address);
    }

    fn read<T>(&self, f: impl FnOnce(&DeviceData) -> T) -> Option<T> {
        self.data.read().ok().map(|d| f(&d))
    }
}

impl LocalDeviceDataProvider for FakeLocalDeviceDataProvider {
    fn id(&self) -> String {
        self.read(|d| d.id.clone()).unwrap_or_default()
    }

    fn device_name(&self) -> String {
        self.read(|d| d.device_name.clone()).unwrap_or_default()
    }

    fn full_name(&self) -> Option<String> {
        self.read(|d| d.full_name.clone()).flatten()
    }

    fn icon_url(&self) -> Option<String> {
        self.read(|d| d.icon_url.clone()).flatten()
    }

    fn vendor_id(&self) -> i32 {
        self.read(|d| d.vendor_id).unwrap_or_default()
    }

    fn bluetooth_mac_address(&self) -> Option<Vec<u8>> {
        self.read(|d| d.bluetooth_mac_address.clone()).flatten()
    }
}

#[derive(Default)]
pub struct FakeAccountManager {
    account: RwLock<Option<Account>>,
}

impl FakeAccountManager {
    pub fn signed_in(email: &str) -> Self {
        let manager = Self::default();
        manager.sign_in(email);
        manager
    }

    pub fn sign_in(&self, email: &str) {
        if let Ok(mut account) = self.account.write() {
            *account = Some(Account {
                email: email.to_string(),
                display_name: None,
                picture_url: None,
            });
        }
    }

    pub fn sign_out(&self) {
        if let Ok(mut account) = self.account.write() {
            *account = None;
        }
    }
}

impl AccountManager for FakeAccountManager {
    fn current_account(&self) -> Option<Account> {
        self.account.read().ok()?.clone()
    }
}
