//! Device call table.
//!
//! [`DeviceCalls`] has one method per native device-management entry point.
//! [`NativeDeviceCalls`] is the implementation over the resolved symbols;
//! [`crate::mock::MockDeviceCalls`] stands in for it in tests. Callers normally
//! go through the guards ([`Device`], [`Session`], [`ServiceConnection`]) which
//! pair every acquisition with its release.

mod native;
mod progress;
mod restorable;
mod session;

use std::ffi::c_void;
use std::path::Path;

use plist::{Dictionary, Value};

use crate::error::Result;
use crate::ffi::{DeviceNotificationCallback, RestorableNotificationCallback};
use crate::handle::{
    AfcConnectionHandle, DeviceHandle, RestorableDeviceHandle, ServiceConnectionHandle,
};

pub use native::NativeDeviceCalls;
pub use progress::{Progress, ProgressReceiver, ProgressSink, progress_channel};
pub(crate) use progress::native_callback;
pub use restorable::{RestorableDevice, RestorableDeviceInfo, RestorableDeviceState};
pub use session::{Device, ServiceConnection, Session};

/// Opaque context handed to a notification registration and returned
/// unchanged with every callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NotificationContext(usize);

impl NotificationContext {
    pub fn new(value: usize) -> Self {
        Self(value)
    }

    pub fn from_ptr(ptr: *mut c_void) -> Self {
        Self(ptr.addr())
    }

    pub fn as_ptr(&self) -> *mut c_void {
        std::ptr::without_provenance_mut(self.0)
    }

    pub fn value(&self) -> usize {
        self.0
    }
}

/// Token for an active device notification subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NativeSubscription(*mut c_void);

// Only ever passed back to the native layer.
unsafe impl Send for NativeSubscription {}
unsafe impl Sync for NativeSubscription {}

impl NativeSubscription {
    pub fn from_raw(ptr: *mut c_void) -> Option<Self> {
        (!ptr.is_null()).then_some(Self(ptr))
    }

    pub fn as_ptr(&self) -> *mut c_void {
        self.0
    }
}

/// Registration id for restorable-device notifications.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RestorableRegistration(pub i32);

/// Typed device-management call table.
///
/// Handles passed in must have come from the same table. Status codes are
/// translated before they are returned; no method exposes a raw code.
pub trait DeviceCalls: Send + Sync {
    // Connections and sessions.
    fn connect(&self, device: DeviceHandle) -> Result<()>;
    fn disconnect(&self, device: DeviceHandle) -> Result<()>;
    fn pair(&self, device: DeviceHandle) -> Result<()>;
    fn is_paired(&self, device: DeviceHandle) -> bool;
    fn validate_pairing(&self, device: DeviceHandle) -> Result<()>;
    fn start_session(&self, device: DeviceHandle) -> Result<()>;
    /// Plain native stop. [`Device::stop_session`] is the idempotent wrapper.
    fn stop_session(&self, device: DeviceHandle) -> Result<()>;

    /// Reference counting. Use [`Device`] rather than calling these directly.
    fn retain(&self, device: DeviceHandle);
    fn release(&self, device: DeviceHandle);

    // Properties.
    fn copy_device_identifier(&self, device: DeviceHandle) -> Result<String>;
    fn copy_value(
        &self,
        device: DeviceHandle,
        domain: Option<&str>,
        name: &str,
    ) -> Result<Option<Value>>;

    /// Attached devices. Each handle carries one retain owned by the caller.
    fn list_devices(&self) -> Result<Vec<DeviceHandle>>;

    // Notifications.
    fn notification_subscribe(
        &self,
        callback: DeviceNotificationCallback,
        context: NotificationContext,
    ) -> Result<NativeSubscription>;
    fn notification_unsubscribe(&self, subscription: NativeSubscription) -> Result<()>;

    // Service connections.
    fn service_socket(&self, connection: ServiceConnectionHandle) -> Result<i32>;
    fn service_is_secure(&self, connection: ServiceConnectionHandle) -> bool;
    fn service_send(&self, connection: ServiceConnectionHandle, data: &[u8]) -> Result<usize>;
    fn service_receive(&self, connection: ServiceConnectionHandle, buf: &mut [u8])
    -> Result<usize>;
    fn service_send_message(&self, connection: ServiceConnectionHandle, message: &Value)
    -> Result<()>;
    fn service_receive_message(&self, connection: ServiceConnectionHandle) -> Result<Value>;
    fn service_invalidate(&self, connection: ServiceConnectionHandle) -> Result<()>;
    /// Invalidate the connection and drop the caller's reference to it.
    fn service_release(&self, connection: ServiceConnectionHandle);

    // Secure services.
    fn start_service(
        &self,
        device: DeviceHandle,
        name: &str,
        options: Option<&Dictionary>,
    ) -> Result<ServiceConnectionHandle>;
    fn transfer_path(
        &self,
        device: DeviceHandle,
        path: &Path,
        options: &Dictionary,
        progress: Option<&ProgressSink>,
    ) -> Result<()>;
    fn install_application(
        &self,
        device: DeviceHandle,
        path: &Path,
        options: &Dictionary,
        progress: Option<&ProgressSink>,
    ) -> Result<()>;
    fn uninstall_application(
        &self,
        device: DeviceHandle,
        bundle_id: &str,
        progress: Option<&ProgressSink>,
    ) -> Result<()>;
    fn lookup_applications(
        &self,
        device: DeviceHandle,
        options: Option<&Dictionary>,
    ) -> Result<Dictionary>;
    fn create_house_arrest_service(
        &self,
        device: DeviceHandle,
        bundle_id: &str,
    ) -> Result<AfcConnectionHandle>;
    fn mount_image(
        &self,
        device: DeviceHandle,
        image: &Path,
        options: &Dictionary,
        progress: Option<&ProgressSink>,
    ) -> Result<()>;

    // Restorable devices.
    fn restorable_register(
        &self,
        callback: RestorableNotificationCallback,
        context: NotificationContext,
    ) -> Result<RestorableRegistration>;
    fn restorable_unregister(&self, registration: RestorableRegistration) -> Result<()>;
    fn restorable_board_config(&self, device: RestorableDeviceHandle) -> Result<Option<String>>;
    fn restorable_product_string(&self, device: RestorableDeviceHandle) -> Result<Option<String>>;
    fn restorable_serial_number(&self, device: RestorableDeviceHandle) -> Result<Option<String>>;
    fn restorable_friendly_name(&self, device: RestorableDeviceHandle) -> Result<Option<String>>;
    fn restorable_board_id(&self, device: RestorableDeviceHandle) -> i32;
    fn restorable_chip_id(&self, device: RestorableDeviceHandle) -> i32;
    fn restorable_device_class(&self, device: RestorableDeviceHandle) -> i32;
    fn restorable_ecid(&self, device: RestorableDeviceHandle) -> u64;
    fn restorable_location_id(&self, device: RestorableDeviceHandle) -> i32;
    fn restorable_product_type(&self, device: RestorableDeviceHandle) -> i32;
    fn restorable_state(&self, device: RestorableDeviceHandle) -> RestorableDeviceState;

    // Diagnostics.
    fn initialize(&self);
    fn set_log_level(&self, level: i32);
    /// Native description of a device status code.
    fn describe_status(&self, code: i32) -> String;
}
