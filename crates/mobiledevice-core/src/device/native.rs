//! Device call table backed by the resolved native entry points.

use std::ffi::{c_int, c_void};
use std::path::Path;
use std::ptr;

use plist::{Dictionary, Value};
use tracing::{debug, instrument, warn};

use super::native_callback;
use super::{
    DeviceCalls, NativeSubscription, NotificationContext, ProgressSink, RestorableDeviceState,
    RestorableRegistration,
};
use crate::cf;
use crate::error::{BindingError, Result, Status, check, description_or_fallback};
use crate::ffi::{
    CFTypeRef, DeviceNotificationCallback, PROPERTY_LIST_XML_FORMAT, RawDeviceCalls,
    RestorableNotificationCallback,
};
use crate::handle::{
    AfcConnectionHandle, DeviceHandle, Handle, HandleKind, RestorableDeviceHandle,
    ServiceConnectionHandle,
};

/// Returned by the raw service I/O calls on failure (`-1` as `size_t`).
const IO_FAILURE: usize = usize::MAX;

/// [`DeviceCalls`] over [`RawDeviceCalls`].
///
/// Every handle this type receives must have been produced by the same native
/// library; the safety of each call rests on that.
#[derive(Debug, Clone, Copy)]
pub struct NativeDeviceCalls {
    raw: RawDeviceCalls,
}

impl NativeDeviceCalls {
    pub fn new(raw: RawDeviceCalls) -> Self {
        Self { raw }
    }

    pub fn raw(&self) -> &RawDeviceCalls {
        &self.raw
    }

    fn check(&self, code: c_int, operation: &'static str) -> Result<()> {
        check(Status::device(code), operation, |c| self.describe_status(c))
    }

    fn io_result(&self, count: usize, operation: &'static str) -> Result<usize> {
        if count == IO_FAILURE {
            return Err(BindingError::Native {
                operation,
                status: Status::device(-1),
                description: "service connection I/O failed".into(),
            });
        }
        Ok(count)
    }

    fn handle_from<K: HandleKind>(ptr: CFTypeRef, operation: &'static str) -> Result<Handle<K>> {
        // SAFETY: `ptr` was just produced by the native call named `operation`.
        unsafe { Handle::from_raw(ptr) }.ok_or(BindingError::NullResult(operation))
    }

    fn progress_call(
        &self,
        operation: &'static str,
        progress: Option<&ProgressSink>,
        call: impl FnOnce(Option<crate::ffi::ProgressCallback>, *mut c_void) -> c_int,
    ) -> Result<()> {
        let (callback, context) = native_callback(progress);
        let code = call(callback, context);
        self.check(code, operation)
    }
}

// SAFETY (every `unsafe` call through `self.raw` below): each entry point was
// bound by name against the signature declared in `ffi`, and the library stays
// mapped for the life of the process. Handles are non-null values the native
// layer issued; CF arguments are owned locals that outlive the call; out
// pointers are initialised locals.
impl DeviceCalls for NativeDeviceCalls {
    #[instrument(level = "debug", skip(self))]
    fn connect(&self, device: DeviceHandle) -> Result<()> {
        let code = unsafe { (self.raw.connect)(device.as_ptr()) };
        self.check(code, "AMDeviceConnect")
    }

    #[instrument(level = "debug", skip(self))]
    fn disconnect(&self, device: DeviceHandle) -> Result<()> {
        let code = unsafe { (self.raw.disconnect)(device.as_ptr()) };
        self.check(code, "AMDeviceDisconnect")
    }

    #[instrument(level = "debug", skip(self))]
    fn pair(&self, device: DeviceHandle) -> Result<()> {
        let code = unsafe { (self.raw.pair)(device.as_ptr()) };
        self.check(code, "AMDevicePair")
    }

    fn is_paired(&self, device: DeviceHandle) -> bool {
        unsafe { (self.raw.is_paired)(device.as_ptr()) != 0 }
    }

    #[instrument(level = "debug", skip(self))]
    fn validate_pairing(&self, device: DeviceHandle) -> Result<()> {
        let code = unsafe { (self.raw.validate_pairing)(device.as_ptr()) };
        self.check(code, "AMDeviceValidatePairing")
    }

    #[instrument(level = "debug", skip(self))]
    fn start_session(&self, device: DeviceHandle) -> Result<()> {
        let code = unsafe { (self.raw.start_session)(device.as_ptr()) };
        self.check(code, "AMDeviceStartSession")
    }

    #[instrument(level = "debug", skip(self))]
    fn stop_session(&self, device: DeviceHandle) -> Result<()> {
        let code = unsafe { (self.raw.stop_session)(device.as_ptr()) };
        self.check(code, "AMDeviceStopSession")
    }

    fn retain(&self, device: DeviceHandle) {
        unsafe { (self.raw.retain)(device.as_ptr()) }
    }

    fn release(&self, device: DeviceHandle) {
        unsafe { (self.raw.release)(device.as_ptr()) }
    }

    fn copy_device_identifier(&self, device: DeviceHandle) -> Result<String> {
        let ptr = unsafe { (self.raw.copy_device_identifier)(device.as_ptr()) };
        // SAFETY: "Copy" functions return a +1 reference.
        unsafe { cf::take_string(ptr) }?.ok_or(BindingError::NullResult("AMDeviceCopyDeviceIdentifier"))
    }

    #[instrument(level = "debug", skip(self))]
    fn copy_value(
        &self,
        device: DeviceHandle,
        domain: Option<&str>,
        name: &str,
    ) -> Result<Option<Value>> {
        let domain = domain.map(cf::string).transpose()?;
        let name = cf::string(name)?;
        let ptr = unsafe {
            (self.raw.copy_value)(
                device.as_ptr(),
                domain.as_ref().map_or(ptr::null(), |d| d.as_ptr()),
                name.as_ptr(),
            )
        };
        // SAFETY: "Copy" functions return a +1 reference.
        unsafe { cf::take_value(ptr) }
    }

    #[instrument(level = "debug", skip(self))]
    fn list_devices(&self) -> Result<Vec<DeviceHandle>> {
        let array = unsafe { (self.raw.create_device_list)() };
        if array.is_null() {
            return Err(BindingError::NullResult("AMDCreateDeviceList"));
        }
        let mut devices = Vec::new();
        // SAFETY: "Create" functions return a +1 array. Each element is
        // retained before the array (and its references) is released.
        unsafe {
            cf::take_array_with(array, |element| {
                if let Some(handle) = DeviceHandle::from_raw(element) {
                    (self.raw.retain)(element);
                    devices.push(handle);
                }
            })?;
        }
        debug!(count = devices.len(), "Enumerated devices");
        Ok(devices)
    }

    fn notification_subscribe(
        &self,
        callback: DeviceNotificationCallback,
        context: NotificationContext,
    ) -> Result<NativeSubscription> {
        let mut subscription = ptr::null_mut();
        let code = unsafe {
            (self.raw.notification_subscribe)(callback, 0, 0, context.as_ptr(), &mut subscription)
        };
        self.check(code, "AMDeviceNotificationSubscribe")?;
        NativeSubscription::from_raw(subscription)
            .ok_or(BindingError::NullResult("AMDeviceNotificationSubscribe"))
    }

    fn notification_unsubscribe(&self, subscription: NativeSubscription) -> Result<()> {
        let code = unsafe { (self.raw.notification_unsubscribe)(subscription.as_ptr()) };
        self.check(code, "AMDeviceNotificationUnsubscribe")
    }

    fn service_socket(&self, connection: ServiceConnectionHandle) -> Result<i32> {
        let socket = unsafe { (self.raw.service_get_socket)(connection.as_ptr()) };
        if socket < 0 {
            return Err(BindingError::NullResult("AMDServiceConnectionGetSocket"));
        }
        Ok(socket)
    }

    fn service_is_secure(&self, connection: ServiceConnectionHandle) -> bool {
        unsafe { (self.raw.service_get_secure_io_context)(connection.as_ptr()) != 0 }
    }

    #[instrument(level = "trace", skip(self, data), fields(len = data.len()))]
    fn service_send(&self, connection: ServiceConnectionHandle, data: &[u8]) -> Result<usize> {
        let sent = unsafe {
            (self.raw.service_send)(connection.as_ptr(), data.as_ptr().cast(), data.len())
        };
        self.io_result(sent, "AMDServiceConnectionSend")
    }

    #[instrument(level = "trace", skip(self, buf), fields(max_len = buf.len()))]
    fn service_receive(
        &self,
        connection: ServiceConnectionHandle,
        buf: &mut [u8],
    ) -> Result<usize> {
        let received = unsafe {
            (self.raw.service_receive)(connection.as_ptr(), buf.as_mut_ptr().cast(), buf.len())
        };
        self.io_result(received, "AMDServiceConnectionReceive")
    }

    fn service_send_message(
        &self,
        connection: ServiceConnectionHandle,
        message: &Value,
    ) -> Result<()> {
        let message = cf::property_list(message)?;
        let code = unsafe {
            (self.raw.service_send_message)(
                connection.as_ptr(),
                message.as_ptr(),
                PROPERTY_LIST_XML_FORMAT,
                ptr::null_mut(),
                ptr::null(),
                ptr::null(),
            )
        };
        self.check(code, "AMDServiceConnectionSendMessage")
    }

    fn service_receive_message(&self, connection: ServiceConnectionHandle) -> Result<Value> {
        let mut message = ptr::null();
        let mut format = 0;
        let code = unsafe {
            (self.raw.service_receive_message)(
                connection.as_ptr(),
                &mut message,
                &mut format,
                ptr::null_mut(),
                ptr::null_mut(),
                ptr::null_mut(),
            )
        };
        // Take ownership before checking so a message is never leaked.
        let value = unsafe { cf::take_value(message) };
        self.check(code, "AMDServiceConnectionReceiveMessage")?;
        value?.ok_or(BindingError::NullResult("AMDServiceConnectionReceiveMessage"))
    }

    fn service_invalidate(&self, connection: ServiceConnectionHandle) -> Result<()> {
        let code = unsafe { (self.raw.service_invalidate)(connection.as_ptr()) };
        self.check(code, "AMDServiceConnectionInvalidate")
    }

    fn service_release(&self, connection: ServiceConnectionHandle) {
        if let Err(e) = self.service_invalidate(connection) {
            warn!(error = %e, "Invalidating service connection failed");
        }
        // SAFETY: the connection was returned with a +1 reference we own.
        if let Err(e) = unsafe { cf::release(connection.as_ptr()) } {
            warn!(connection = %connection, error = %e, "Releasing service connection failed");
        }
    }

    #[instrument(level = "debug", skip(self, options))]
    fn start_service(
        &self,
        device: DeviceHandle,
        name: &str,
        options: Option<&Dictionary>,
    ) -> Result<ServiceConnectionHandle> {
        let name = cf::string(name)?;
        let options = cf::optional_dictionary(options)?;
        let mut service = ptr::null();
        let code = unsafe {
            (self.raw.secure_start_service)(
                device.as_ptr(),
                name.as_ptr(),
                options.as_ref().map_or(ptr::null(), |o| o.as_ptr()),
                &mut service,
            )
        };
        self.check(code, "AMDeviceSecureStartService")?;
        Self::handle_from(service, "AMDeviceSecureStartService")
    }

    #[instrument(level = "info", skip(self, options, progress))]
    fn transfer_path(
        &self,
        device: DeviceHandle,
        path: &Path,
        options: &Dictionary,
        progress: Option<&ProgressSink>,
    ) -> Result<()> {
        let url = cf::url(path, path.is_dir())?;
        let options = cf::dictionary(options)?;
        self.progress_call("AMDeviceSecureTransferPath", progress, |callback, context| unsafe {
            (self.raw.secure_transfer_path)(
                0,
                device.as_ptr(),
                url.as_ptr(),
                options.as_ptr(),
                callback,
                context,
            )
        })
    }

    #[instrument(level = "info", skip(self, options, progress))]
    fn install_application(
        &self,
        device: DeviceHandle,
        path: &Path,
        options: &Dictionary,
        progress: Option<&ProgressSink>,
    ) -> Result<()> {
        let url = cf::url(path, path.is_dir())?;
        let options = cf::dictionary(options)?;
        self.progress_call("AMDeviceSecureInstallApplication", progress, |callback, context| unsafe {
            (self.raw.secure_install_application)(
                0,
                device.as_ptr(),
                url.as_ptr(),
                options.as_ptr(),
                callback,
                context,
            )
        })
    }

    #[instrument(level = "info", skip(self, progress))]
    fn uninstall_application(
        &self,
        device: DeviceHandle,
        bundle_id: &str,
        progress: Option<&ProgressSink>,
    ) -> Result<()> {
        let bundle_id = cf::string(bundle_id)?;
        self.progress_call("AMDeviceSecureUninstallApplication", progress, |callback, context| unsafe {
            (self.raw.secure_uninstall_application)(
                0,
                device.as_ptr(),
                bundle_id.as_ptr(),
                0,
                callback,
                context,
            )
        })
    }

    #[instrument(level = "debug", skip(self, options))]
    fn lookup_applications(
        &self,
        device: DeviceHandle,
        options: Option<&Dictionary>,
    ) -> Result<Dictionary> {
        let options = cf::optional_dictionary(options)?;
        let mut attributes = ptr::null();
        let code = unsafe {
            (self.raw.lookup_applications)(
                device.as_ptr(),
                options.as_ref().map_or(ptr::null(), |o| o.as_ptr()),
                &mut attributes,
            )
        };
        let value = unsafe { cf::take_value(attributes) };
        self.check(code, "AMDeviceLookupApplications")?;
        match value? {
            Some(Value::Dictionary(applications)) => Ok(applications),
            Some(_) => Err(BindingError::PropertyList(
                "application lookup did not return a dictionary".into(),
            )),
            None => Ok(Dictionary::new()),
        }
    }

    #[instrument(level = "debug", skip(self))]
    fn create_house_arrest_service(
        &self,
        device: DeviceHandle,
        bundle_id: &str,
    ) -> Result<AfcConnectionHandle> {
        let bundle_id = cf::string(bundle_id)?;
        let mut connection = ptr::null();
        let code = unsafe {
            (self.raw.create_house_arrest_service)(
                device.as_ptr(),
                bundle_id.as_ptr(),
                ptr::null_mut(),
                &mut connection,
            )
        };
        self.check(code, "AMDeviceCreateHouseArrestService")?;
        Self::handle_from(connection, "AMDeviceCreateHouseArrestService")
    }

    #[instrument(level = "info", skip(self, options, progress))]
    fn mount_image(
        &self,
        device: DeviceHandle,
        image: &Path,
        options: &Dictionary,
        progress: Option<&ProgressSink>,
    ) -> Result<()> {
        let image = cf::string(&image.to_string_lossy())?;
        let options = cf::dictionary(options)?;
        self.progress_call("AMDeviceMountImage", progress, |callback, context| unsafe {
            (self.raw.mount_image)(
                device.as_ptr(),
                image.as_ptr(),
                options.as_ptr(),
                callback,
                context,
            )
        })
    }

    fn restorable_register(
        &self,
        callback: RestorableNotificationCallback,
        context: NotificationContext,
    ) -> Result<RestorableRegistration> {
        let id = unsafe { (self.raw.restorable_register)(callback, context.as_ptr(), 0, 0) };
        Ok(RestorableRegistration(id))
    }

    fn restorable_unregister(&self, registration: RestorableRegistration) -> Result<()> {
        let code = unsafe { (self.raw.restorable_unregister)(registration.0) };
        self.check(code, "AMRestorableDeviceUnregisterForNotifications")
    }

    fn restorable_board_config(&self, device: RestorableDeviceHandle) -> Result<Option<String>> {
        unsafe { cf::take_string((self.raw.restorable_copy_board_config)(device.as_ptr())) }
    }

    fn restorable_product_string(&self, device: RestorableDeviceHandle) -> Result<Option<String>> {
        unsafe { cf::take_string((self.raw.restorable_copy_product_string)(device.as_ptr())) }
    }

    fn restorable_serial_number(&self, device: RestorableDeviceHandle) -> Result<Option<String>> {
        unsafe { cf::take_string((self.raw.restorable_copy_serial_number)(device.as_ptr())) }
    }

    fn restorable_friendly_name(&self, device: RestorableDeviceHandle) -> Result<Option<String>> {
        unsafe { cf::take_string((self.raw.restorable_copy_user_friendly_name)(device.as_ptr())) }
    }

    fn restorable_board_id(&self, device: RestorableDeviceHandle) -> i32 {
        unsafe { (self.raw.restorable_get_board_id)(device.as_ptr()) }
    }

    fn restorable_chip_id(&self, device: RestorableDeviceHandle) -> i32 {
        unsafe { (self.raw.restorable_get_chip_id)(device.as_ptr()) }
    }

    fn restorable_device_class(&self, device: RestorableDeviceHandle) -> i32 {
        unsafe { (self.raw.restorable_get_device_class)(device.as_ptr()) }
    }

    fn restorable_ecid(&self, device: RestorableDeviceHandle) -> u64 {
        u64::from(unsafe { (self.raw.restorable_get_ecid)(device.as_ptr()) })
    }

    fn restorable_location_id(&self, device: RestorableDeviceHandle) -> i32 {
        unsafe { (self.raw.restorable_get_location_id)(device.as_ptr()) }
    }

    fn restorable_product_type(&self, device: RestorableDeviceHandle) -> i32 {
        unsafe { (self.raw.restorable_get_product_type)(device.as_ptr()) }
    }

    fn restorable_state(&self, device: RestorableDeviceHandle) -> RestorableDeviceState {
        RestorableDeviceState::from_raw(unsafe { (self.raw.restorable_get_state)(device.as_ptr()) })
    }

    fn initialize(&self) {
        unsafe { (self.raw.initialize)() }
    }

    fn set_log_level(&self, level: i32) {
        unsafe { (self.raw.set_log_level)(level) }
    }

    fn describe_status(&self, code: i32) -> String {
        match unsafe { cf::take_string((self.raw.copy_error_text)(code)) } {
            Ok(text) => description_or_fallback(text),
            Err(e) => {
                warn!(code, error = %e, "Could not read native error text");
                description_or_fallback(None)
            }
        }
    }
}
