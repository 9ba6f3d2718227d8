//! In-memory fakes of both call tables.
//!
//! They behave like a small, well-mannered device: handles are numbered,
//! every call is logged under its native symbol name, and any call can be made
//! to fail once with [`MockDeviceCalls::fail_next`] /
//! [`MockFileConduit::fail_next`]. Releasing or closing a handle twice panics,
//! which is how the tests catch leaks and double frees.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::ffi::c_int;
use std::io::SeekFrom;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use plist::{Dictionary, Value};

use crate::afc::{DirectoryEntry, FileConduitCalls, ReadMode};
use crate::device::{
    DeviceCalls, NativeSubscription, NotificationContext, ProgressSink, RestorableDeviceState,
    RestorableRegistration,
};
use crate::error::{BindingError, Result, Status, check, codes};
use crate::ffi::{AmDeviceNotification, DeviceNotificationCallback, RestorableNotificationCallback};
use crate::handle::{
    AfcConnectionHandle, DeviceHandle, DirectoryHandle, FileHandle, Handle, HandleKind,
    OperationHandle, RestorableDeviceHandle, ServiceConnectionHandle,
};
use crate::sync::IgnorePoison;

fn numbered<K: HandleKind>(next: &mut usize) -> Handle<K> {
    *next += 0x10;
    // SAFETY: fake handles are only ever passed back to the fake that made them.
    unsafe { Handle::from_addr(*next) }.expect("fake handle addresses start above zero")
}

/// Log `operation`, then fail if a fault is queued for it.
fn enter(
    log: &mut Vec<&'static str>,
    faults: &mut HashMap<&'static str, VecDeque<i32>>,
    operation: &'static str,
) -> Option<i32> {
    log.push(operation);
    faults.get_mut(operation).and_then(VecDeque::pop_front)
}

// ---------------------------------------------------------------------------
// Device table
// ---------------------------------------------------------------------------

/// Properties of a fake restorable device.
#[derive(Debug, Clone, Default)]
pub struct MockRestorable {
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
    /// Raw native state value.
    pub state: c_int,
}

struct MockDevice {
    identifier: String,
    retains: usize,
    connected: bool,
    session: bool,
    paired: bool,
    values: HashMap<(Option<String>, String), Value>,
}

struct MockSubscription {
    token: usize,
    callback: DeviceNotificationCallback,
    context: NotificationContext,
    active: bool,
}

struct MockRegistration {
    id: i32,
    callback: RestorableNotificationCallback,
    context: NotificationContext,
    active: bool,
}

#[derive(Default)]
struct DeviceState {
    next_addr: usize,
    devices: BTreeMap<usize, MockDevice>,
    restorables: HashMap<usize, MockRestorable>,
    services: HashSet<usize>,
    subscriptions: Vec<MockSubscription>,
    registrations: Vec<MockRegistration>,
    faults: HashMap<&'static str, VecDeque<i32>>,
    log: Vec<&'static str>,
    installed: Vec<String>,
    inbox: VecDeque<u8>,
    messages: VecDeque<Value>,
    sent: Vec<u8>,
    sent_messages: Vec<Value>,
    file_conduit: Option<MockFileConduit>,
}

impl DeviceState {
    fn enter(&mut self, operation: &'static str) -> Result<()> {
        match enter(&mut self.log, &mut self.faults, operation) {
            Some(code) => device_failure(operation, code),
            None => Ok(()),
        }
    }

    fn device(&mut self, handle: DeviceHandle, operation: &'static str) -> Result<&mut MockDevice> {
        match self.devices.get_mut(&handle.addr()) {
            Some(device) => Ok(device),
            None => device_failure(operation, codes::AMD_NOT_FOUND),
        }
    }

    fn in_session(&mut self, handle: DeviceHandle, operation: &'static str) -> Result<&mut MockDevice> {
        let device = self.device(handle, operation)?;
        if !device.session {
            return device_failure(operation, codes::AMD_SESSION_INACTIVE);
        }
        Ok(device)
    }
}

fn describe_device(code: i32) -> String {
    format!("mock device error 0x{:08X}", code as u32)
}

fn device_failure<T>(operation: &'static str, code: i32) -> Result<T> {
    check(Status::device(code), operation, describe_device)?;
    Err(BindingError::NullResult(operation))
}

/// Fake [`DeviceCalls`].
#[derive(Clone, Default)]
pub struct MockDeviceCalls {
    state: Arc<Mutex<DeviceState>>,
}

impl MockDeviceCalls {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, DeviceState> {
        self.state.lock_ignore_poison()
    }

    /// Attach a paired device. The fake keeps its own reference; the handle
    /// starts with no caller-held retains.
    pub fn add_device(&self, identifier: &str) -> DeviceHandle {
        let mut state = self.lock();
        let handle = numbered(&mut state.next_addr);
        state.devices.insert(
            handle.addr(),
            MockDevice {
                identifier: identifier.to_string(),
                retains: 0,
                connected: false,
                session: false,
                paired: true,
                values: HashMap::new(),
            },
        );
        handle
    }

    pub fn add_restorable_device(&self, device: MockRestorable) -> RestorableDeviceHandle {
        let mut state = self.lock();
        let handle = numbered(&mut state.next_addr);
        state.restorables.insert(handle.addr(), device);
        handle
    }

    /// Route house-arrest connections to `afc`.
    pub fn attach_file_conduit(&self, afc: &MockFileConduit) {
        self.lock().file_conduit = Some(afc.clone());
    }

    pub fn set_paired(&self, device: DeviceHandle, paired: bool) {
        if let Some(d) = self.lock().devices.get_mut(&device.addr()) {
            d.paired = paired;
        }
    }

    pub fn set_value(&self, device: DeviceHandle, domain: Option<&str>, name: &str, value: Value) {
        if let Some(d) = self.lock().devices.get_mut(&device.addr()) {
            d.values
                .insert((domain.map(str::to_string), name.to_string()), value);
        }
    }

    /// Make the next call to `operation` fail with `code`.
    pub fn fail_next(&self, operation: &'static str, code: i32) {
        self.lock()
            .faults
            .entry(operation)
            .or_default()
            .push_back(code);
    }

    /// Every call so far, by native symbol name.
    pub fn calls(&self) -> Vec<&'static str> {
        self.lock().log.clone()
    }

    /// Retains held by callers.
    pub fn retain_count(&self, device: DeviceHandle) -> usize {
        self.lock()
            .devices
            .get(&device.addr())
            .map_or(0, |d| d.retains)
    }

    pub fn is_connected(&self, device: DeviceHandle) -> bool {
        self.lock()
            .devices
            .get(&device.addr())
            .is_some_and(|d| d.connected)
    }

    pub fn has_session(&self, device: DeviceHandle) -> bool {
        self.lock()
            .devices
            .get(&device.addr())
            .is_some_and(|d| d.session)
    }

    pub fn open_services(&self) -> usize {
        self.lock().services.len()
    }

    pub fn queue_service_bytes(&self, bytes: &[u8]) {
        self.lock().inbox.extend(bytes);
    }

    pub fn queue_service_message(&self, message: Value) {
        self.lock().messages.push_back(message);
    }

    pub fn sent_bytes(&self) -> Vec<u8> {
        self.lock().sent.clone()
    }

    pub fn sent_messages(&self) -> Vec<Value> {
        self.lock().sent_messages.clone()
    }

    pub fn installed_applications(&self) -> Vec<String> {
        self.lock().installed.clone()
    }

    /// Native subscriptions and registrations not yet removed.
    pub fn active_subscriptions(&self) -> usize {
        let state = self.lock();
        state.subscriptions.iter().filter(|s| s.active).count()
            + state.registrations.iter().filter(|r| r.active).count()
    }

    /// Invoke every active device callback, as the native run loop would.
    pub fn fire_device_event(&self, device: DeviceHandle, status: c_int) {
        self.fire_device(device, status, false);
    }

    /// Invoke every device callback ever registered, including removed ones.
    /// Models a callback that was already in flight when unsubscribe ran.
    pub fn fire_stale_device_event(&self, device: DeviceHandle, status: c_int) {
        self.fire_device(device, status, true);
    }

    fn fire_device(&self, device: DeviceHandle, status: c_int, include_inactive: bool) {
        let targets: Vec<_> = self
            .lock()
            .subscriptions
            .iter()
            .filter(|s| s.active || include_inactive)
            .map(|s| (s.callback, s.context))
            .collect();
        let notification = AmDeviceNotification {
            device: device.as_ptr(),
            status,
        };
        for (callback, context) in targets {
            // SAFETY: the callback was registered through `notification_subscribe`.
            unsafe { callback(&notification, context.as_ptr()) };
        }
    }

    /// Invoke every active restorable-device callback.
    pub fn fire_restorable_event(&self, device: RestorableDeviceHandle, status: c_int) {
        let targets: Vec<_> = self
            .lock()
            .registrations
            .iter()
            .filter(|r| r.active)
            .map(|r| (r.callback, r.context))
            .collect();
        for (callback, context) in targets {
            // SAFETY: the callback was registered through `restorable_register`.
            unsafe { callback(device.as_ptr(), status, context.as_ptr()) };
        }
    }

    fn restorable<T>(&self, device: RestorableDeviceHandle, read: impl FnOnce(&MockRestorable) -> T) -> T
    where
        T: Default,
    {
        self.lock()
            .restorables
            .get(&device.addr())
            .map(read)
            .unwrap_or_default()
    }

    /// Report progress the way the native layer does where CoreFoundation
    /// exists: through the callback and context handed to the call.
    fn emit(progress: Option<&ProgressSink>, status: &str, percent: u64) {
        let Some(sink) = progress else {
            return;
        };
        let mut payload = Dictionary::new();
        payload.insert("Status".into(), Value::String(status.into()));
        payload.insert("PercentComplete".into(), Value::Integer(percent.into()));
        if !through_native_callback(sink, &payload) {
            sink.emit(payload);
        }
    }
}

#[cfg(target_os = "macos")]
fn through_native_callback(sink: &ProgressSink, payload: &Dictionary) -> bool {
    let Ok(object) = crate::cf::dictionary(payload) else {
        return false;
    };
    let (Some(callback), context) = crate::device::native_callback(Some(sink)) else {
        return false;
    };
    // SAFETY: `context` points at `sink` and `object` outlives the call.
    unsafe { callback(object.as_ptr(), context) };
    true
}

#[cfg(not(target_os = "macos"))]
fn through_native_callback(_sink: &ProgressSink, _payload: &Dictionary) -> bool {
    false
}

impl std::fmt::Debug for MockDeviceCalls {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.lock();
        f.debug_struct("MockDeviceCalls")
            .field("devices", &state.devices.len())
            .field("calls", &state.log.len())
            .finish()
    }
}

impl DeviceCalls for MockDeviceCalls {
    fn connect(&self, device: DeviceHandle) -> Result<()> {
        let mut state = self.lock();
        state.enter("AMDeviceConnect")?;
        state.device(device, "AMDeviceConnect")?.connected = true;
        Ok(())
    }

    fn disconnect(&self, device: DeviceHandle) -> Result<()> {
        let mut state = self.lock();
        state.enter("AMDeviceDisconnect")?;
        let d = state.device(device, "AMDeviceDisconnect")?;
        d.connected = false;
        d.session = false;
        Ok(())
    }

    fn pair(&self, device: DeviceHandle) -> Result<()> {
        let mut state = self.lock();
        state.enter("AMDevicePair")?;
        state.device(device, "AMDevicePair")?.paired = true;
        Ok(())
    }

    fn is_paired(&self, device: DeviceHandle) -> bool {
        let mut state = self.lock();
        state.log.push("AMDeviceIsPaired");
        state.devices.get(&device.addr()).is_some_and(|d| d.paired)
    }

    fn validate_pairing(&self, device: DeviceHandle) -> Result<()> {
        let mut state = self.lock();
        state.enter("AMDeviceValidatePairing")?;
        if !state.device(device, "AMDeviceValidatePairing")?.paired {
            return device_failure("AMDeviceValidatePairing", codes::AMD_PERMISSION);
        }
        Ok(())
    }

    fn start_session(&self, device: DeviceHandle) -> Result<()> {
        let mut state = self.lock();
        state.enter("AMDeviceStartSession")?;
        let d = state.device(device, "AMDeviceStartSession")?;
        if !d.connected {
            return device_failure("AMDeviceStartSession", codes::AMD_NOT_CONNECTED);
        }
        if d.session {
            return device_failure("AMDeviceStartSession", codes::AMD_SESSION_ACTIVE);
        }
        d.session = true;
        Ok(())
    }

    fn stop_session(&self, device: DeviceHandle) -> Result<()> {
        let mut state = self.lock();
        state.enter("AMDeviceStopSession")?;
        let d = state.device(device, "AMDeviceStopSession")?;
        if !d.session {
            return device_failure("AMDeviceStopSession", codes::AMD_SESSION_INACTIVE);
        }
        d.session = false;
        Ok(())
    }

    fn retain(&self, device: DeviceHandle) {
        let mut state = self.lock();
        state.log.push("AMDeviceRetain");
        if let Some(d) = state.devices.get_mut(&device.addr()) {
            d.retains += 1;
        }
    }

    fn release(&self, device: DeviceHandle) {
        let mut state = self.lock();
        state.log.push("AMDeviceRelease");
        match state.devices.get_mut(&device.addr()) {
            Some(d) if d.retains > 0 => d.retains -= 1,
            _ => panic!("{device:?} released more often than retained"),
        }
    }

    fn copy_device_identifier(&self, device: DeviceHandle) -> Result<String> {
        let mut state = self.lock();
        state.enter("AMDeviceCopyDeviceIdentifier")?;
        Ok(state
            .device(device, "AMDeviceCopyDeviceIdentifier")?
            .identifier
            .clone())
    }

    fn copy_value(
        &self,
        device: DeviceHandle,
        domain: Option<&str>,
        name: &str,
    ) -> Result<Option<Value>> {
        let mut state = self.lock();
        state.enter("AMDeviceCopyValue")?;
        let d = state.in_session(device, "AMDeviceCopyValue")?;
        Ok(d
            .values
            .get(&(domain.map(str::to_string), name.to_string()))
            .cloned())
    }

    fn list_devices(&self) -> Result<Vec<DeviceHandle>> {
        let mut state = self.lock();
        state.enter("AMDCreateDeviceList")?;
        let mut handles = Vec::new();
        for (addr, device) in state.devices.iter_mut() {
            device.retains += 1;
            // SAFETY: the address names a fake device.
            handles.extend(unsafe { DeviceHandle::from_addr(*addr) });
        }
        Ok(handles)
    }

    fn notification_subscribe(
        &self,
        callback: DeviceNotificationCallback,
        context: NotificationContext,
    ) -> Result<NativeSubscription> {
        let mut state = self.lock();
        state.enter("AMDeviceNotificationSubscribe")?;
        state.next_addr += 0x10;
        let token = state.next_addr;
        state.subscriptions.push(MockSubscription {
            token,
            callback,
            context,
            active: true,
        });
        NativeSubscription::from_raw(std::ptr::without_provenance_mut(token))
            .ok_or(BindingError::NullResult("AMDeviceNotificationSubscribe"))
    }

    fn notification_unsubscribe(&self, subscription: NativeSubscription) -> Result<()> {
        let mut state = self.lock();
        state.enter("AMDeviceNotificationUnsubscribe")?;
        let token = subscription.as_ptr().addr();
        match state
            .subscriptions
            .iter_mut()
            .find(|s| s.token == token && s.active)
        {
            Some(s) => s.active = false,
            None => panic!("subscription {token:#x} unsubscribed twice"),
        }
        Ok(())
    }

    fn service_socket(&self, connection: ServiceConnectionHandle) -> Result<i32> {
        let mut state = self.lock();
        state.enter("AMDServiceConnectionGetSocket")?;
        if !state.services.contains(&connection.addr()) {
            return Err(BindingError::NullResult("AMDServiceConnectionGetSocket"));
        }
        Ok(3)
    }

    fn service_is_secure(&self, _connection: ServiceConnectionHandle) -> bool {
        self.lock().log.push("AMDServiceConnectionGetSecureIOContext");
        false
    }

    fn service_send(&self, _connection: ServiceConnectionHandle, data: &[u8]) -> Result<usize> {
        let mut state = self.lock();
        state.enter("AMDServiceConnectionSend")?;
        state.sent.extend_from_slice(data);
        Ok(data.len())
    }

    fn service_receive(
        &self,
        _connection: ServiceConnectionHandle,
        buf: &mut [u8],
    ) -> Result<usize> {
        let mut state = self.lock();
        state.enter("AMDServiceConnectionReceive")?;
        let n = buf.len().min(state.inbox.len());
        for (slot, byte) in buf.iter_mut().zip(state.inbox.drain(..n)) {
            *slot = byte;
        }
        Ok(n)
    }

    fn service_send_message(
        &self,
        _connection: ServiceConnectionHandle,
        message: &Value,
    ) -> Result<()> {
        let mut state = self.lock();
        state.enter("AMDServiceConnectionSendMessage")?;
        state.sent_messages.push(message.clone());
        Ok(())
    }

    fn service_receive_message(&self, _connection: ServiceConnectionHandle) -> Result<Value> {
        let mut state = self.lock();
        state.enter("AMDServiceConnectionReceiveMessage")?;
        match state.messages.pop_front() {
            Some(message) => Ok(message),
            None => device_failure("AMDServiceConnectionReceiveMessage", codes::AMD_TIMEOUT),
        }
    }

    fn service_invalidate(&self, connection: ServiceConnectionHandle) -> Result<()> {
        let mut state = self.lock();
        state.enter("AMDServiceConnectionInvalidate")?;
        if !state.services.contains(&connection.addr()) {
            return device_failure("AMDServiceConnectionInvalidate", codes::AMD_NOT_FOUND);
        }
        Ok(())
    }

    fn service_release(&self, connection: ServiceConnectionHandle) {
        let mut state = self.lock();
        state.log.push("AMDServiceConnectionInvalidate");
        if !state.services.remove(&connection.addr()) {
            panic!("{connection:?} released twice");
        }
    }

    fn start_service(
        &self,
        device: DeviceHandle,
        _name: &str,
        _options: Option<&Dictionary>,
    ) -> Result<ServiceConnectionHandle> {
        let mut state = self.lock();
        state.enter("AMDeviceSecureStartService")?;
        state.in_session(device, "AMDeviceSecureStartService")?;
        let handle: ServiceConnectionHandle = numbered(&mut state.next_addr);
        state.services.insert(handle.addr());
        Ok(handle)
    }

    fn transfer_path(
        &self,
        device: DeviceHandle,
        _path: &Path,
        _options: &Dictionary,
        progress: Option<&ProgressSink>,
    ) -> Result<()> {
        {
            let mut state = self.lock();
            state.enter("AMDeviceSecureTransferPath")?;
            state.in_session(device, "AMDeviceSecureTransferPath")?;
        }
        Self::emit(progress, "CopyingFile", 50);
        Self::emit(progress, "Complete", 100);
        Ok(())
    }

    fn install_application(
        &self,
        device: DeviceHandle,
        path: &Path,
        options: &Dictionary,
        progress: Option<&ProgressSink>,
    ) -> Result<()> {
        {
            let mut state = self.lock();
            state.enter("AMDeviceSecureInstallApplication")?;
            state.in_session(device, "AMDeviceSecureInstallApplication")?;
            let bundle_id = options
                .get("CFBundleIdentifier")
                .and_then(Value::as_string)
                .map(str::to_string)
                .or_else(|| path.file_stem().map(|s| s.to_string_lossy().into_owned()))
                .unwrap_or_default();
            state.installed.push(bundle_id);
        }
        Self::emit(progress, "InstallingApplication", 60);
        Self::emit(progress, "Complete", 100);
        Ok(())
    }

    fn uninstall_application(
        &self,
        device: DeviceHandle,
        bundle_id: &str,
        progress: Option<&ProgressSink>,
    ) -> Result<()> {
        {
            let mut state = self.lock();
            state.enter("AMDeviceSecureUninstallApplication")?;
            state.in_session(device, "AMDeviceSecureUninstallApplication")?;
            let before = state.installed.len();
            state.installed.retain(|id| id != bundle_id);
            if state.installed.len() == before {
                return device_failure("AMDeviceSecureUninstallApplication", codes::AMD_NOT_FOUND);
            }
        }
        Self::emit(progress, "Complete", 100);
        Ok(())
    }

    fn lookup_applications(
        &self,
        device: DeviceHandle,
        _options: Option<&Dictionary>,
    ) -> Result<Dictionary> {
        let mut state = self.lock();
        state.enter("AMDeviceLookupApplications")?;
        state.in_session(device, "AMDeviceLookupApplications")?;
        let mut applications = Dictionary::new();
        for bundle_id in &state.installed {
            let mut info = Dictionary::new();
            info.insert("CFBundleIdentifier".into(), Value::String(bundle_id.clone()));
            applications.insert(bundle_id.clone(), Value::Dictionary(info));
        }
        Ok(applications)
    }

    fn create_house_arrest_service(
        &self,
        device: DeviceHandle,
        bundle_id: &str,
    ) -> Result<AfcConnectionHandle> {
        let afc = {
            let mut state = self.lock();
            state.enter("AMDeviceCreateHouseArrestService")?;
            state.in_session(device, "AMDeviceCreateHouseArrestService")?;
            if !state.installed.iter().any(|id| id == bundle_id) {
                return device_failure("AMDeviceCreateHouseArrestService", codes::AMD_NOT_FOUND);
            }
            state.file_conduit.clone()
        };
        match afc {
            Some(afc) => Ok(afc.open_connection()),
            None => device_failure("AMDeviceCreateHouseArrestService", codes::AMD_NOT_FOUND),
        }
    }

    fn mount_image(
        &self,
        device: DeviceHandle,
        _image: &Path,
        _options: &Dictionary,
        progress: Option<&ProgressSink>,
    ) -> Result<()> {
        {
            let mut state = self.lock();
            state.enter("AMDeviceMountImage")?;
            state.in_session(device, "AMDeviceMountImage")?;
        }
        Self::emit(progress, "LookingUpImage", 20);
        Self::emit(progress, "Complete", 100);
        Ok(())
    }

    fn restorable_register(
        &self,
        callback: RestorableNotificationCallback,
        context: NotificationContext,
    ) -> Result<RestorableRegistration> {
        let mut state = self.lock();
        state.enter("AMRestorableDeviceRegisterForNotifications")?;
        let id = state.registrations.len() as i32 + 1;
        state.registrations.push(MockRegistration {
            id,
            callback,
            context,
            active: true,
        });
        Ok(RestorableRegistration(id))
    }

    fn restorable_unregister(&self, registration: RestorableRegistration) -> Result<()> {
        let mut state = self.lock();
        state.enter("AMRestorableDeviceUnregisterForNotifications")?;
        match state
            .registrations
            .iter_mut()
            .find(|r| r.id == registration.0 && r.active)
        {
            Some(r) => r.active = false,
            None => panic!("restorable registration {} removed twice", registration.0),
        }
        Ok(())
    }

    fn restorable_board_config(&self, device: RestorableDeviceHandle) -> Result<Option<String>> {
        Ok(self.restorable(device, |d| d.board_config.clone()))
    }

    fn restorable_product_string(&self, device: RestorableDeviceHandle) -> Result<Option<String>> {
        Ok(self.restorable(device, |d| d.product_string.clone()))
    }

    fn restorable_serial_number(&self, device: RestorableDeviceHandle) -> Result<Option<String>> {
        Ok(self.restorable(device, |d| d.serial_number.clone()))
    }

    fn restorable_friendly_name(&self, device: RestorableDeviceHandle) -> Result<Option<String>> {
        Ok(self.restorable(device, |d| d.friendly_name.clone()))
    }

    fn restorable_board_id(&self, device: RestorableDeviceHandle) -> i32 {
        self.restorable(device, |d| d.board_id)
    }

    fn restorable_chip_id(&self, device: RestorableDeviceHandle) -> i32 {
        self.restorable(device, |d| d.chip_id)
    }

    fn restorable_device_class(&self, device: RestorableDeviceHandle) -> i32 {
        self.restorable(device, |d| d.device_class)
    }

    fn restorable_ecid(&self, device: RestorableDeviceHandle) -> u64 {
        self.restorable(device, |d| d.ecid)
    }

    fn restorable_location_id(&self, device: RestorableDeviceHandle) -> i32 {
        self.restorable(device, |d| d.location_id)
    }

    fn restorable_product_type(&self, device: RestorableDeviceHandle) -> i32 {
        self.restorable(device, |d| d.product_type)
    }

    fn restorable_state(&self, device: RestorableDeviceHandle) -> RestorableDeviceState {
        let raw = self
            .lock()
            .restorables
            .get(&device.addr())
            .map_or(RestorableDeviceState::Unknown.to_raw(), |d| d.state);
        RestorableDeviceState::from_raw(raw)
    }

    fn initialize(&self) {
        self.lock().log.push("_InitializeMobileDevice");
    }

    fn set_log_level(&self, _level: i32) {
        self.lock().log.push("AMDSetLogLevel");
    }

    fn describe_status(&self, code: i32) -> String {
        describe_device(code)
    }
}

// ---------------------------------------------------------------------------
// File conduit
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
enum Node {
    File(Vec<u8>),
    Directory,
}

struct OpenFile {
    path: String,
    position: u64,
    mode: ReadMode,
}

struct OpenDirectory {
    entries: Vec<String>,
    next: usize,
}

struct MockOperation {
    path: String,
    status: Option<i32>,
}

struct AfcState {
    next_addr: usize,
    nodes: BTreeMap<String, Node>,
    connections: HashSet<usize>,
    files: HashMap<usize, OpenFile>,
    directories: HashMap<usize, OpenDirectory>,
    operations: HashMap<usize, MockOperation>,
    faults: HashMap<&'static str, VecDeque<i32>>,
    log: Vec<&'static str>,
    max_chunk: Option<usize>,
    last_error: Option<(&'static str, i32)>,
}

impl Default for AfcState {
    fn default() -> Self {
        let mut nodes = BTreeMap::new();
        nodes.insert("/".to_string(), Node::Directory);
        Self {
            next_addr: 0x8000,
            nodes,
            connections: HashSet::new(),
            files: HashMap::new(),
            directories: HashMap::new(),
            operations: HashMap::new(),
            faults: HashMap::new(),
            log: Vec::new(),
            max_chunk: None,
            last_error: None,
        }
    }
}

fn normalize(path: &str) -> String {
    let trimmed = path.trim_end_matches('/');
    if trimmed.is_empty() {
        "/".to_string()
    } else if trimmed.starts_with('/') {
        trimmed.to_string()
    } else {
        format!("/{trimmed}")
    }
}

fn parent(path: &str) -> Option<String> {
    if path == "/" {
        return None;
    }
    match path.rsplit_once('/') {
        Some(("", _)) => Some("/".to_string()),
        Some((parent, _)) => Some(parent.to_string()),
        None => None,
    }
}

fn is_within(path: &str, root: &str) -> bool {
    path == root || root == "/" || path.starts_with(&format!("{root}/"))
}

fn describe_afc(code: i32) -> String {
    format!("mock afc error {code}")
}

impl AfcState {
    fn fail<T>(&mut self, operation: &'static str, code: i32) -> Result<T> {
        self.last_error = Some((operation, code));
        check(Status::file_conduit(code), operation, describe_afc)?;
        Err(BindingError::NullResult(operation))
    }

    fn enter(&mut self, operation: &'static str) -> Result<()> {
        match enter(&mut self.log, &mut self.faults, operation) {
            Some(code) => self.fail(operation, code),
            None => Ok(()),
        }
    }

    fn connection(&mut self, connection: AfcConnectionHandle, operation: &'static str) -> Result<()> {
        if self.connections.contains(&connection.addr()) {
            Ok(())
        } else {
            self.fail(operation, codes::AFC_NOT_CONNECTED)
        }
    }

    fn ensure_directories(&mut self, path: &str) {
        let mut missing = Vec::new();
        let mut current = parent(path);
        while let Some(dir) = current {
            if self.nodes.contains_key(&dir) {
                break;
            }
            current = parent(&dir);
            missing.push(dir);
        }
        for dir in missing {
            self.nodes.insert(dir, Node::Directory);
        }
    }

    fn children(&self, dir: &str) -> Vec<String> {
        self.nodes
            .keys()
            .filter(|key| key.as_str() != dir && parent(key).as_deref() == Some(dir))
            .filter_map(|key| key.rsplit('/').next().map(str::to_string))
            .collect()
    }

    fn parent_is_directory(&self, path: &str) -> bool {
        parent(path).is_some_and(|p| matches!(self.nodes.get(&p), Some(Node::Directory)))
    }

    fn remove_tree(&mut self, root: &str) -> bool {
        let doomed: Vec<String> = self
            .nodes
            .keys()
            .filter(|key| key.as_str() != "/" && is_within(key, root))
            .cloned()
            .collect();
        for key in &doomed {
            self.nodes.remove(key);
        }
        !doomed.is_empty()
    }

    fn file_mut(&mut self, file: FileHandle, operation: &'static str) -> Result<&mut OpenFile> {
        if !self.files.contains_key(&file.addr()) {
            return self.fail(operation, codes::AFC_INVALID_ARGUMENT);
        }
        self.files
            .get_mut(&file.addr())
            .ok_or(BindingError::NullResult(operation))
    }
}

/// Fake [`FileConduitCalls`] over an in-memory file tree.
#[derive(Clone, Default)]
pub struct MockFileConduit {
    state: Arc<Mutex<AfcState>>,
}

impl MockFileConduit {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, AfcState> {
        self.state.lock_ignore_poison()
    }

    /// An open connection handle, as a service would hand out.
    pub fn open_connection(&self) -> AfcConnectionHandle {
        let mut state = self.lock();
        let handle: AfcConnectionHandle = numbered(&mut state.next_addr);
        state.connections.insert(handle.addr());
        handle
    }

    /// Create a file, and any missing parent directories.
    pub fn insert_file(&self, path: &str, contents: &[u8]) {
        let path = normalize(path);
        let mut state = self.lock();
        state.ensure_directories(&path);
        state.nodes.insert(path, Node::File(contents.to_vec()));
    }

    pub fn insert_directory(&self, path: &str) {
        let path = normalize(path);
        let mut state = self.lock();
        state.ensure_directories(&path);
        state.nodes.insert(path, Node::Directory);
    }

    pub fn exists(&self, path: &str) -> bool {
        self.lock().nodes.contains_key(&normalize(path))
    }

    pub fn file_contents(&self, path: &str) -> Option<Vec<u8>> {
        match self.lock().nodes.get(&normalize(path)) {
            Some(Node::File(data)) => Some(data.clone()),
            _ => None,
        }
    }

    /// Cap every read at `n` bytes, to produce short reads.
    pub fn set_max_chunk(&self, n: usize) {
        self.lock().max_chunk = Some(n);
    }

    pub fn fail_next(&self, operation: &'static str, code: i32) {
        self.lock()
            .faults
            .entry(operation)
            .or_default()
            .push_back(code);
    }

    pub fn calls(&self) -> Vec<&'static str> {
        self.lock().log.clone()
    }

    /// Connections, files, directories and operations not yet released.
    pub fn open_handles(&self) -> usize {
        let state = self.lock();
        state.connections.len() + state.files.len() + state.directories.len() + state.operations.len()
    }
}

impl std::fmt::Debug for MockFileConduit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.lock();
        f.debug_struct("MockFileConduit")
            .field("nodes", &state.nodes.len())
            .field("calls", &state.log.len())
            .finish()
    }
}

impl FileConduitCalls for MockFileConduit {
    fn connection_create(&self, _socket: i32) -> Result<AfcConnectionHandle> {
        self.lock().enter("AFCConnectionCreate")?;
        Ok(self.open_connection())
    }

    fn connection_open(
        &self,
        _service: ServiceConnectionHandle,
        _io_timeout: Duration,
    ) -> Result<AfcConnectionHandle> {
        self.lock().enter("AFCConnectionOpen")?;
        Ok(self.open_connection())
    }

    fn connection_close(&self, connection: AfcConnectionHandle) -> Result<()> {
        let mut state = self.lock();
        state.log.push("AFCConnectionClose");
        if !state.connections.remove(&connection.addr()) {
            panic!("{connection:?} closed twice");
        }
        Ok(())
    }

    fn set_secure_context(&self, _service: ServiceConnectionHandle) -> Result<()> {
        self.lock().enter("AFCConnectionSetSecureContext")
    }

    fn directory_open(
        &self,
        connection: AfcConnectionHandle,
        path: &str,
    ) -> Result<DirectoryHandle> {
        const OP: &str = "AFCDirectoryOpen";
        let mut state = self.lock();
        state.enter(OP)?;
        state.connection(connection, OP)?;
        let path = normalize(path);
        match state.nodes.get(&path) {
            Some(Node::Directory) => {}
            Some(Node::File(_)) => return state.fail(OP, codes::AFC_INVALID_ARGUMENT),
            None => return state.fail(OP, codes::AFC_NOT_FOUND),
        }
        let mut entries = vec![".".to_string(), "..".to_string()];
        entries.extend(state.children(&path));
        let handle: DirectoryHandle = numbered(&mut state.next_addr);
        state
            .directories
            .insert(handle.addr(), OpenDirectory { entries, next: 0 });
        Ok(handle)
    }

    fn directory_read(
        &self,
        connection: AfcConnectionHandle,
        directory: DirectoryHandle,
    ) -> Result<DirectoryEntry> {
        const OP: &str = "AFCDirectoryRead";
        let mut state = self.lock();
        state.enter(OP)?;
        state.connection(connection, OP)?;
        let Some(dir) = state.directories.get_mut(&directory.addr()) else {
            return state.fail(OP, codes::AFC_INVALID_ARGUMENT);
        };
        match dir.entries.get(dir.next).cloned() {
            Some(name) => {
                dir.next += 1;
                Ok(DirectoryEntry::Name(name))
            }
            None => Ok(DirectoryEntry::End),
        }
    }

    fn directory_close(
        &self,
        _connection: AfcConnectionHandle,
        directory: DirectoryHandle,
    ) -> Result<()> {
        let mut state = self.lock();
        state.log.push("AFCDirectoryClose");
        if state.directories.remove(&directory.addr()).is_none() {
            panic!("{directory:?} closed twice");
        }
        Ok(())
    }

    fn directory_create(&self, connection: AfcConnectionHandle, path: &str) -> Result<()> {
        const OP: &str = "AFCDirectoryCreate";
        let mut state = self.lock();
        state.enter(OP)?;
        state.connection(connection, OP)?;
        let path = normalize(path);
        if state.nodes.contains_key(&path) {
            return state.fail(OP, codes::AFC_EXISTS);
        }
        if !state.parent_is_directory(&path) {
            return state.fail(OP, codes::AFC_NOT_FOUND);
        }
        state.nodes.insert(path, Node::Directory);
        Ok(())
    }

    fn file_open(
        &self,
        connection: AfcConnectionHandle,
        path: &str,
        mode: ReadMode,
    ) -> Result<FileHandle> {
        const OP: &str = "AFCFileRefOpen";
        let mut state = self.lock();
        state.enter(OP)?;
        state.connection(connection, OP)?;
        let path = normalize(path);
        match (state.nodes.get(&path), mode) {
            (Some(Node::Directory), _) => return state.fail(OP, codes::AFC_IS_DIRECTORY),
            (None, ReadMode::ReadOnly) => return state.fail(OP, codes::AFC_NOT_FOUND),
            (_, ReadMode::CreateReadWrite) => {
                if !state.parent_is_directory(&path) {
                    return state.fail(OP, codes::AFC_NOT_FOUND);
                }
                state.nodes.insert(path.clone(), Node::File(Vec::new()));
            }
            (Some(Node::File(_)), ReadMode::ReadOnly) => {}
        }
        let handle: FileHandle = numbered(&mut state.next_addr);
        state.files.insert(
            handle.addr(),
            OpenFile {
                path,
                position: 0,
                mode,
            },
        );
        Ok(handle)
    }

    fn file_close(&self, _connection: AfcConnectionHandle, file: FileHandle) -> Result<()> {
        let mut state = self.lock();
        state.log.push("AFCFileRefClose");
        if state.files.remove(&file.addr()).is_none() {
            panic!("{file:?} closed twice");
        }
        Ok(())
    }

    fn file_seek(
        &self,
        connection: AfcConnectionHandle,
        file: FileHandle,
        pos: SeekFrom,
    ) -> Result<()> {
        const OP: &str = "AFCFileRefSeek";
        let mut state = self.lock();
        state.enter(OP)?;
        state.connection(connection, OP)?;
        let (path, position) = {
            let open = state.file_mut(file, OP)?;
            (open.path.clone(), open.position)
        };
        let len = match state.nodes.get(&path) {
            Some(Node::File(data)) => data.len() as i64,
            _ => 0,
        };
        let target = match pos {
            SeekFrom::Start(n) => i64::try_from(n).unwrap_or(i64::MAX),
            SeekFrom::Current(d) => position as i64 + d,
            SeekFrom::End(d) => len + d,
        };
        if target < 0 {
            return state.fail(OP, codes::AFC_INVALID_ARGUMENT);
        }
        state.file_mut(file, OP)?.position = target as u64;
        Ok(())
    }

    fn file_tell(&self, connection: AfcConnectionHandle, file: FileHandle) -> Result<u64> {
        const OP: &str = "AFCFileRefTell";
        let mut state = self.lock();
        state.enter(OP)?;
        state.connection(connection, OP)?;
        Ok(state.file_mut(file, OP)?.position)
    }

    fn file_read(
        &self,
        connection: AfcConnectionHandle,
        file: FileHandle,
        buf: &mut [u8],
    ) -> Result<usize> {
        const OP: &str = "AFCFileRefRead";
        let mut state = self.lock();
        state.enter(OP)?;
        state.connection(connection, OP)?;
        let max_chunk = state.max_chunk.unwrap_or(usize::MAX);
        let (path, position) = {
            let open = state.file_mut(file, OP)?;
            (open.path.clone(), open.position as usize)
        };
        let n = match state.nodes.get(&path) {
            Some(Node::File(data)) => {
                let available = data.len().saturating_sub(position);
                let n = buf.len().min(available).min(max_chunk);
                buf[..n].copy_from_slice(&data[position..position + n]);
                n
            }
            _ => return state.fail(OP, codes::AFC_NOT_FOUND),
        };
        state.file_mut(file, OP)?.position += n as u64;
        Ok(n)
    }

    fn file_write(
        &self,
        connection: AfcConnectionHandle,
        file: FileHandle,
        data: &[u8],
    ) -> Result<()> {
        const OP: &str = "AFCFileRefWrite";
        let mut state = self.lock();
        state.enter(OP)?;
        state.connection(connection, OP)?;
        let (path, position, mode) = {
            let open = state.file_mut(file, OP)?;
            (open.path.clone(), open.position as usize, open.mode)
        };
        if mode == ReadMode::ReadOnly {
            return state.fail(OP, codes::AFC_PERMISSION);
        }
        match state.nodes.get_mut(&path) {
            Some(Node::File(contents)) => {
                if contents.len() < position + data.len() {
                    contents.resize(position + data.len(), 0);
                }
                contents[position..position + data.len()].copy_from_slice(data);
            }
            _ => return state.fail(OP, codes::AFC_NOT_FOUND),
        }
        state.file_mut(file, OP)?.position += data.len() as u64;
        Ok(())
    }

    fn rename_path(&self, connection: AfcConnectionHandle, from: &str, to: &str) -> Result<()> {
        const OP: &str = "AFCRenamePath";
        let mut state = self.lock();
        state.enter(OP)?;
        state.connection(connection, OP)?;
        let (from, to) = (normalize(from), normalize(to));
        if !state.nodes.contains_key(&from) {
            return state.fail(OP, codes::AFC_NOT_FOUND);
        }
        if !state.parent_is_directory(&to) {
            return state.fail(OP, codes::AFC_NOT_FOUND);
        }
        let moved: Vec<(String, Node)> = state
            .nodes
            .iter()
            .filter(|(key, _)| is_within(key, &from))
            .map(|(key, node)| (format!("{to}{}", &key[from.len()..]), node.clone()))
            .collect();
        state.remove_tree(&from);
        state.nodes.extend(moved);
        Ok(())
    }

    fn remove_path(&self, connection: AfcConnectionHandle, path: &str) -> Result<()> {
        const OP: &str = "AFCRemovePath";
        let mut state = self.lock();
        state.enter(OP)?;
        state.connection(connection, OP)?;
        let path = normalize(path);
        match state.nodes.get(&path) {
            None => return state.fail(OP, codes::AFC_NOT_FOUND),
            Some(Node::Directory) if !state.children(&path).is_empty() => {
                return state.fail(OP, codes::AFC_INVALID_ARGUMENT);
            }
            Some(_) => {}
        }
        state.nodes.remove(&path);
        Ok(())
    }

    fn operation_remove_path_and_contents(&self, path: &str) -> Result<OperationHandle> {
        let mut state = self.lock();
        state.enter("AFCOperationCreateRemovePathAndContents")?;
        let handle: OperationHandle = numbered(&mut state.next_addr);
        state.operations.insert(
            handle.addr(),
            MockOperation {
                path: normalize(path),
                status: None,
            },
        );
        Ok(handle)
    }

    fn process_operation(
        &self,
        connection: AfcConnectionHandle,
        operation: OperationHandle,
    ) -> Result<()> {
        const OP: &str = "AFCConnectionProcessOperation";
        let mut state = self.lock();
        state.enter(OP)?;
        state.connection(connection, OP)?;
        let Some(path) = state.operations.get(&operation.addr()).map(|op| op.path.clone()) else {
            return state.fail(OP, codes::AFC_INVALID_ARGUMENT);
        };
        let status = if path != "/" && state.remove_tree(&path) {
            codes::SUCCESS
        } else {
            codes::AFC_NOT_FOUND
        };
        if let Some(op) = state.operations.get_mut(&operation.addr()) {
            op.status = Some(status);
        }
        Ok(())
    }

    fn operation_result_status(&self, operation: OperationHandle) -> Status {
        let status = self
            .lock()
            .operations
            .get(&operation.addr())
            .and_then(|op| op.status)
            .unwrap_or(codes::AFC_UNKNOWN);
        Status::file_conduit(status)
    }

    fn operation_result_object(&self, operation: OperationHandle) -> Result<Option<Value>> {
        let state = self.lock();
        Ok(state.operations.get(&operation.addr()).map(|op| {
            let mut result = Dictionary::new();
            result.insert("Path".into(), Value::String(op.path.clone()));
            Value::Dictionary(result)
        }))
    }

    fn operation_release(&self, operation: OperationHandle) {
        let mut state = self.lock();
        state.log.push("AFCOperationRelease");
        if state.operations.remove(&operation.addr()).is_none() {
            panic!("{operation:?} released twice");
        }
    }

    fn describe_status(&self, code: i32) -> String {
        describe_afc(code)
    }

    fn last_error_info(&self, connection: AfcConnectionHandle) -> Result<Option<Dictionary>> {
        const OP: &str = "AFCConnectionCopyLastErrorInfo";
        let mut state = self.lock();
        state.log.push(OP);
        state.connection(connection, OP)?;
        Ok(state.last_error.map(|(operation, code)| {
            let mut info = Dictionary::new();
            info.insert("Operation".into(), Value::String(operation.into()));
            info.insert("Code".into(), Value::Integer(i64::from(code).into()));
            info.insert("Description".into(), Value::String(describe_afc(code)));
            info
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fault_injection_fires_once() {
        let mock = MockDeviceCalls::new();
        let device = mock.add_device("udid");
        mock.fail_next("AMDeviceConnect", codes::AMD_TIMEOUT);
        assert!(mock.connect(device).is_err());
        assert!(mock.connect(device).is_ok());
        assert_eq!(mock.calls(), vec!["AMDeviceConnect", "AMDeviceConnect"]);
    }

    #[test]
    #[should_panic(expected = "released more often than retained")]
    fn test_double_release_panics() {
        let mock = MockDeviceCalls::new();
        let device = mock.add_device("udid");
        mock.retain(device);
        mock.release(device);
        mock.release(device);
    }

    #[test]
    fn test_tree_helpers() {
        assert_eq!(normalize("a/b/"), "/a/b");
        assert_eq!(normalize(""), "/");
        assert_eq!(parent("/a/b").as_deref(), Some("/a"));
        assert_eq!(parent("/a").as_deref(), Some("/"));
        assert_eq!(parent("/"), None);
        assert!(is_within("/a/b", "/a"));
        assert!(!is_within("/ab", "/a"));
    }

    #[test]
    fn test_last_error_info_reports_failure() {
        let afc = MockFileConduit::new();
        let conn = afc.open_connection();
        assert_eq!(afc.last_error_info(conn).unwrap(), None);
        assert!(afc.remove_path(conn, "/missing").is_err());
        let info = afc.last_error_info(conn).unwrap().unwrap();
        assert_eq!(
            info.get("Operation").and_then(Value::as_string),
            Some("AFCRemovePath")
        );
        afc.connection_close(conn).unwrap();
    }
}
