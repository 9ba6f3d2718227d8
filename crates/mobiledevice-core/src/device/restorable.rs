//! Devices in DFU, recovery or restore mode.

use std::ffi::c_int;
use std::fmt;
use std::sync::Arc;

use serde::Serialize;
use tracing::warn;

use super::DeviceCalls;
use crate::error::Result;
use crate::handle::RestorableDeviceHandle;

/// Boot state of a restorable device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum RestorableDeviceState {
    Dfu,
    Recovery,
    RestoreOs,
    BootedOs,
    Unknown,
}

impl RestorableDeviceState {
    pub fn from_raw(raw: c_int) -> Self {
        match raw {
            0 => Self::Dfu,
            1 => Self::Recovery,
            2 => Self::RestoreOs,
            4 => Self::BootedOs,
            5 => Self::Unknown,
            other => {
                warn!(state = other, "Unmapped restorable device state");
                Self::Unknown
            }
        }
    }

    pub fn to_raw(self) -> c_int {
        match self {
            Self::Dfu => 0,
            Self::Recovery => 1,
            Self::RestoreOs => 2,
            Self::BootedOs => 4,
            Self::Unknown => 5,
        }
    }
}

impl fmt::Display for RestorableDeviceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Dfu => "DFU",
            Self::Recovery => "Recovery",
            Self::RestoreOs => "RestoreOS",
            Self::BootedOs => "BootedOS",
            Self::Unknown => "Unknown",
        };
        f.write_str(name)
    }
}

/// Everything the getters report, read in one go.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RestorableDeviceInfo {
    pub board_config: Option<String>,
    pub product_string: Option<String>,
    pub serial_number: Option<String>,
    pub friendly_name: Option<String>,
    pub board_id: i32,
    pub chip_id: i32,
    pub device_class: i32,
    pub ecid: u64,
    pub location_id: i32,
    pub product_type: i32,
    pub state: RestorableDeviceState,
}

/// A restorable device reported by a notification.
///
/// The native layer owns the object; the handle is valid while the device
/// stays attached.
#[derive(Clone)]
pub struct RestorableDevice {
    calls: Arc<dyn DeviceCalls>,
    handle: RestorableDeviceHandle,
}

impl RestorableDevice {
    pub fn new(calls: Arc<dyn DeviceCalls>, handle: RestorableDeviceHandle) -> Self {
        Self { calls, handle }
    }

    pub fn handle(&self) -> RestorableDeviceHandle {
        self.handle
    }

    pub fn board_config(&self) -> Result<Option<String>> {
        self.calls.restorable_board_config(self.handle)
    }

    pub fn product_string(&self) -> Result<Option<String>> {
        self.calls.restorable_product_string(self.handle)
    }

    pub fn serial_number(&self) -> Result<Option<String>> {
        self.calls.restorable_serial_number(self.handle)
    }

    pub fn friendly_name(&self) -> Result<Option<String>> {
        self.calls.restorable_friendly_name(self.handle)
    }

    pub fn board_id(&self) -> i32 {
        self.calls.restorable_board_id(self.handle)
    }

    pub fn chip_id(&self) -> i32 {
        self.calls.restorable_chip_id(self.handle)
    }

    pub fn device_class(&self) -> i32 {
        self.calls.restorable_device_class(self.handle)
    }

    pub fn ecid(&self) -> u64 {
        self.calls.restorable_ecid(self.handle)
    }

    pub fn location_id(&self) -> i32 {
        self.calls.restorable_location_id(self.handle)
    }

    pub fn product_type(&self) -> i32 {
        self.calls.restorable_product_type(self.handle)
    }

    pub fn state(&self) -> RestorableDeviceState {
        self.calls.restorable_state(self.handle)
    }

    pub fn info(&self) -> Result<RestorableDeviceInfo> {
        Ok(RestorableDeviceInfo {
            board_config: self.board_config()?,
            product_string: self.product_string()?,
            serial_number: self.serial_number()?,
            friendly_name: self.friendly_name()?,
            board_id: self.board_id(),
            chip_id: self.chip_id(),
            device_class: self.device_class(),
            ecid: self.ecid(),
            location_id: self.location_id(),
            product_type: self.product_type(),
            state: self.state(),
        })
    }
}

impl fmt::Debug for RestorableDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("RestorableDevice").field(&self.handle).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{MockDeviceCalls, MockRestorable};

    #[test]
    fn test_state_roundtrip() {
        for state in [
            RestorableDeviceState::Dfu,
            RestorableDeviceState::Recovery,
            RestorableDeviceState::RestoreOs,
            RestorableDeviceState::BootedOs,
            RestorableDeviceState::Unknown,
        ] {
            assert_eq!(RestorableDeviceState::from_raw(state.to_raw()), state);
        }
    }

    #[test]
    fn test_unmapped_state_is_unknown() {
        assert_eq!(RestorableDeviceState::from_raw(3), RestorableDeviceState::Unknown);
        assert_eq!(RestorableDeviceState::from_raw(-1), RestorableDeviceState::Unknown);
    }

    #[test]
    fn test_info_snapshot() {
        let mock = MockDeviceCalls::new();
        let handle = mock.add_restorable_device(MockRestorable {
            serial_number: Some("F2LXK0ABCDEF".into()),
            ecid: 0x001A_2B3C_4D5E,
            chip_id: 0x8030,
            state: RestorableDeviceState::Recovery.to_raw(),
            ..Default::default()
        });
        let device = RestorableDevice::new(Arc::new(mock), handle);

        let info = device.info().unwrap();
        assert_eq!(info.serial_number.as_deref(), Some("F2LXK0ABCDEF"));
        assert_eq!(info.ecid, 0x001A_2B3C_4D5E);
        assert_eq!(info.chip_id, 0x8030);
        assert_eq!(info.state, RestorableDeviceState::Recovery);
        assert_eq!(info.state.to_string(), "Recovery");
    }
}
