//! Scoped guards over device handles.

use std::io;
use std::path::Path;
use std::sync::Arc;

use plist::{Dictionary, Value};
use tracing::{debug, info, instrument, warn};

use super::{DeviceCalls, ProgressSink};
use crate::afc::{AfcConnection, FileConduitCalls};
use crate::error::{BindingError, Result, codes};
use crate::handle::{DeviceHandle, ServiceConnectionHandle};

/// An attached device.
///
/// Owns one retain on the native object. Dropping it stops any active
/// session, disconnects and releases, in that order.
pub struct Device {
    calls: Arc<dyn DeviceCalls>,
    handle: DeviceHandle,
    connected: bool,
    session_active: bool,
}

impl Device {
    /// Take ownership of a handle that already carries a retain.
    pub fn adopt(calls: Arc<dyn DeviceCalls>, handle: DeviceHandle) -> Self {
        Self {
            calls,
            handle,
            connected: false,
            session_active: false,
        }
    }

    /// Retain `handle` and wrap it, e.g. a handle borrowed from a notification.
    pub fn retain(calls: Arc<dyn DeviceCalls>, handle: DeviceHandle) -> Self {
        calls.retain(handle);
        Self::adopt(calls, handle)
    }

    /// Every currently attached device.
    pub fn list(calls: &Arc<dyn DeviceCalls>) -> Result<Vec<Device>> {
        let handles = calls.list_devices()?;
        Ok(handles
            .into_iter()
            .map(|handle| Self::adopt(Arc::clone(calls), handle))
            .collect())
    }

    pub fn handle(&self) -> DeviceHandle {
        self.handle
    }

    pub fn calls(&self) -> &Arc<dyn DeviceCalls> {
        &self.calls
    }

    /// The device's unique identifier (UDID).
    pub fn identifier(&self) -> Result<String> {
        self.calls.copy_device_identifier(self.handle)
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    pub fn has_session(&self) -> bool {
        self.session_active
    }

    #[instrument(level = "debug", skip(self), fields(device = %self.handle))]
    pub fn connect(&mut self) -> Result<()> {
        if self.connected {
            return Ok(());
        }
        self.calls.connect(self.handle)?;
        self.connected = true;
        Ok(())
    }

    /// Stop any session, then disconnect. A disconnected device is left alone.
    #[instrument(level = "debug", skip(self), fields(device = %self.handle))]
    pub fn disconnect(&mut self) -> Result<()> {
        if !self.connected {
            return Ok(());
        }
        if let Err(e) = self.stop_session() {
            warn!(error = %e, "Stopping session before disconnect failed");
        }
        self.calls.disconnect(self.handle)?;
        self.connected = false;
        Ok(())
    }

    pub fn is_paired(&self) -> bool {
        self.calls.is_paired(self.handle)
    }

    pub fn pair(&mut self) -> Result<()> {
        self.require_connected()?;
        self.calls.pair(self.handle)
    }

    pub fn validate_pairing(&mut self) -> Result<()> {
        self.require_connected()?;
        self.calls.validate_pairing(self.handle)
    }

    /// Start a session on a connected, paired device.
    ///
    /// The session ends when the returned guard is dropped.
    #[instrument(level = "debug", skip(self), fields(device = %self.handle))]
    pub fn start_session(&mut self) -> Result<Session<'_>> {
        self.require_connected()?;
        if !self.session_active {
            if !self.calls.is_paired(self.handle) {
                return Err(BindingError::NotPaired);
            }
            self.calls.start_session(self.handle)?;
            self.session_active = true;
        } else {
            debug!("Session already active; reusing it");
        }
        Ok(Session { device: self })
    }

    /// Stop the active session. Without one this is a successful no-op.
    pub fn stop_session(&mut self) -> Result<()> {
        if !self.session_active {
            return Ok(());
        }
        self.session_active = false;
        match self.calls.stop_session(self.handle) {
            Err(e) if e.status().is_some_and(|s| s.code() == codes::AMD_SESSION_INACTIVE) => {
                debug!("Native session was already inactive");
                Ok(())
            }
            other => other,
        }
    }

    fn require_connected(&self) -> Result<()> {
        if self.connected {
            Ok(())
        } else {
            Err(BindingError::NotConnected)
        }
    }
}

impl std::fmt::Debug for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Device")
            .field("handle", &self.handle)
            .field("connected", &self.connected)
            .field("session_active", &self.session_active)
            .finish()
    }
}

impl Drop for Device {
    fn drop(&mut self) {
        if let Err(e) = self.stop_session() {
            warn!(device = %self.handle, error = %e, "Failed to stop session on drop");
        }
        if self.connected {
            if let Err(e) = self.calls.disconnect(self.handle) {
                warn!(device = %self.handle, error = %e, "Failed to disconnect on drop");
            }
            self.connected = false;
        }
        self.calls.release(self.handle);
    }
}

/// An active session. Property reads and secure services live here.
pub struct Session<'d> {
    device: &'d mut Device,
}

impl Session<'_> {
    pub fn device(&self) -> &Device {
        self.device
    }

    /// Read one value, optionally scoped to a domain.
    pub fn copy_value(&self, domain: Option<&str>, name: &str) -> Result<Option<Value>> {
        self.device.calls.copy_value(self.device.handle, domain, name)
    }

    #[instrument(level = "info", skip(self, options), fields(device = %self.device.handle))]
    pub fn start_service(
        &self,
        name: &str,
        options: Option<&Dictionary>,
    ) -> Result<ServiceConnection> {
        let handle = self.device.calls.start_service(self.device.handle, name, options)?;
        info!(service = name, connection = %handle, "Service started");
        Ok(ServiceConnection {
            calls: Arc::clone(&self.device.calls),
            handle,
        })
    }

    pub fn transfer_path(
        &self,
        path: &Path,
        options: &Dictionary,
        progress: Option<&ProgressSink>,
    ) -> Result<()> {
        self.device
            .calls
            .transfer_path(self.device.handle, path, options, progress)
    }

    pub fn install_application(
        &self,
        path: &Path,
        options: &Dictionary,
        progress: Option<&ProgressSink>,
    ) -> Result<()> {
        self.device
            .calls
            .install_application(self.device.handle, path, options, progress)
    }

    pub fn uninstall_application(
        &self,
        bundle_id: &str,
        progress: Option<&ProgressSink>,
    ) -> Result<()> {
        self.device
            .calls
            .uninstall_application(self.device.handle, bundle_id, progress)
    }

    pub fn lookup_applications(&self, options: Option<&Dictionary>) -> Result<Dictionary> {
        self.device
            .calls
            .lookup_applications(self.device.handle, options)
    }

    pub fn mount_image(
        &self,
        image: &Path,
        options: &Dictionary,
        progress: Option<&ProgressSink>,
    ) -> Result<()> {
        self.device
            .calls
            .mount_image(self.device.handle, image, options, progress)
    }

    /// File conduit into an application's container.
    pub fn house_arrest(
        &self,
        bundle_id: &str,
        afc: Arc<dyn FileConduitCalls>,
    ) -> Result<AfcConnection> {
        let handle = self
            .device
            .calls
            .create_house_arrest_service(self.device.handle, bundle_id)?;
        Ok(AfcConnection::adopt(afc, handle))
    }

    /// Stop the session now and report the outcome.
    pub fn end(self) -> Result<()> {
        self.device.stop_session()
    }
}

impl Drop for Session<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.device.stop_session() {
            warn!(device = %self.device.handle, error = %e, "Failed to stop session");
        }
    }
}

/// A connection to a device service. Invalidated and released on drop.
///
/// Outlives the session it was started in.
pub struct ServiceConnection {
    calls: Arc<dyn DeviceCalls>,
    handle: ServiceConnectionHandle,
}

impl ServiceConnection {
    pub fn handle(&self) -> ServiceConnectionHandle {
        self.handle
    }

    pub fn socket(&self) -> Result<i32> {
        self.calls.service_socket(self.handle)
    }

    pub fn is_secure(&self) -> bool {
        self.calls.service_is_secure(self.handle)
    }

    pub fn send(&self, data: &[u8]) -> Result<usize> {
        self.calls.service_send(self.handle, data)
    }

    pub fn receive(&self, buf: &mut [u8]) -> Result<usize> {
        self.calls.service_receive(self.handle, buf)
    }

    pub fn send_message(&self, message: &Value) -> Result<()> {
        self.calls.service_send_message(self.handle, message)
    }

    pub fn receive_message(&self) -> Result<Value> {
        self.calls.service_receive_message(self.handle)
    }
}

impl io::Read for ServiceConnection {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        Ok(self.receive(buf)?)
    }
}

impl io::Write for ServiceConnection {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        Ok(self.send(buf)?)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl std::fmt::Debug for ServiceConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("ServiceConnection").field(&self.handle).finish()
    }
}

impl Drop for ServiceConnection {
    fn drop(&mut self) {
        self.calls.service_release(self.handle);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StatusKind;
    use crate::mock::MockDeviceCalls;

    fn setup() -> (MockDeviceCalls, Arc<dyn DeviceCalls>, DeviceHandle) {
        let mock = MockDeviceCalls::new();
        let handle = mock.add_device("00008030-001A2B3C4D5E6F70");
        let calls: Arc<dyn DeviceCalls> = Arc::new(mock.clone());
        (mock, calls, handle)
    }

    #[test]
    fn test_list_and_drop_balances_retains() {
        let (mock, calls, handle) = setup();
        let devices = Device::list(&calls).unwrap();
        assert_eq!(devices.len(), 1);
        assert_eq!(mock.retain_count(handle), 1);
        assert_eq!(devices[0].identifier().unwrap(), "00008030-001A2B3C4D5E6F70");
        drop(devices);
        assert_eq!(mock.retain_count(handle), 0);
    }

    #[test]
    fn test_session_requires_connection() {
        let (_mock, calls, handle) = setup();
        let mut device = Device::retain(calls, handle);
        assert!(matches!(device.start_session(), Err(BindingError::NotConnected)));
    }

    #[test]
    fn test_session_requires_pairing() {
        let (mock, calls, handle) = setup();
        mock.set_paired(handle, false);
        let mut device = Device::retain(calls, handle);
        device.connect().unwrap();
        assert!(matches!(device.start_session(), Err(BindingError::NotPaired)));
        assert!(!mock.has_session(handle));
    }

    #[test]
    fn test_session_stops_on_drop() {
        let (mock, calls, handle) = setup();
        mock.set_value(handle, None, "DeviceName", Value::String("Test iPhone".into()));
        let mut device = Device::retain(calls, handle);
        device.connect().unwrap();
        {
            let session = device.start_session().unwrap();
            assert!(mock.has_session(handle));
            let name = session.copy_value(None, "DeviceName").unwrap();
            assert_eq!(name, Some(Value::String("Test iPhone".into())));
        }
        assert!(!mock.has_session(handle));
        assert!(!device.has_session());
    }

    #[test]
    fn test_stop_session_without_session_is_noop() {
        let (mock, calls, handle) = setup();
        let mut device = Device::retain(calls, handle);
        device.connect().unwrap();
        device.stop_session().unwrap();
        device.stop_session().unwrap();
        assert!(!mock.calls().contains(&"AMDeviceStopSession"));
    }

    #[test]
    fn test_native_session_inactive_is_success() {
        let (mock, calls, handle) = setup();
        let mut device = Device::retain(calls, handle);
        device.connect().unwrap();
        let session = device.start_session().unwrap();
        mock.fail_next("AMDeviceStopSession", codes::AMD_SESSION_INACTIVE);
        session.end().unwrap();
    }

    #[test]
    fn test_drop_tears_down_in_order() {
        let (mock, calls, handle) = setup();
        let mut device = Device::retain(calls, handle);
        device.connect().unwrap();
        std::mem::forget(device.start_session().unwrap());
        drop(device);

        let log = mock.calls();
        let tail: Vec<_> = log.iter().rev().take(3).rev().copied().collect();
        assert_eq!(
            tail,
            vec!["AMDeviceStopSession", "AMDeviceDisconnect", "AMDeviceRelease"]
        );
        assert_eq!(mock.retain_count(handle), 0);
        assert!(!mock.is_connected(handle));
    }

    #[test]
    fn test_failed_connect_surfaces_status() {
        let (mock, calls, handle) = setup();
        mock.fail_next("AMDeviceConnect", codes::AMD_TIMEOUT);
        let mut device = Device::retain(calls, handle);
        let err = device.connect().unwrap_err();
        assert_eq!(err.kind(), Some(StatusKind::Timeout));
        assert!(!device.is_connected());
    }

    #[test]
    fn test_service_connection_released_on_drop() {
        let (mock, calls, handle) = setup();
        let mut device = Device::retain(calls, handle);
        device.connect().unwrap();
        let session = device.start_session().unwrap();
        let mut service = session.start_service("com.apple.afc", None).unwrap();
        drop(session);

        mock.queue_service_bytes(b"pong");
        assert_eq!(service.send(b"ping").unwrap(), 4);
        let mut buf = [0u8; 8];
        let n = io::Read::read(&mut service, &mut buf).unwrap();
        assert_eq!(&buf[..n], b"pong");
        assert_eq!(mock.sent_bytes(), b"ping");
        assert_eq!(mock.open_services(), 1);
        drop(service);
        assert_eq!(mock.open_services(), 0);
    }

    #[test]
    fn test_service_messages() {
        let (mock, calls, handle) = setup();
        let mut device = Device::retain(calls, handle);
        device.connect().unwrap();
        let session = device.start_session().unwrap();
        let service = session
            .start_service("com.apple.mobile.installation_proxy", None)
            .unwrap();

        let mut request = Dictionary::new();
        request.insert("Command".into(), "Browse".into());
        service.send_message(&Value::Dictionary(request.clone())).unwrap();
        assert_eq!(mock.sent_messages(), vec![Value::Dictionary(request)]);

        let mut reply = Dictionary::new();
        reply.insert("Status".into(), "Complete".into());
        mock.queue_service_message(Value::Dictionary(reply.clone()));
        assert_eq!(service.receive_message().unwrap(), Value::Dictionary(reply));

        let err = service.receive_message().unwrap_err();
        assert_eq!(err.kind(), Some(StatusKind::Timeout));
    }

    #[test]
    fn test_install_reports_progress() {
        let (mock, calls, handle) = setup();
        let mut device = Device::retain(calls, handle);
        device.connect().unwrap();
        let session = device.start_session().unwrap();

        let (sink, receiver) = super::super::progress_channel();
        let mut options = Dictionary::new();
        options.insert("CFBundleIdentifier".into(), "com.example.app".into());
        session
            .install_application(Path::new("/tmp/Example.app"), &options, Some(&sink))
            .unwrap();

        let reports: Vec<_> = receiver.try_iter().collect();
        assert!(!reports.is_empty());
        assert_eq!(reports.last().unwrap().status(), Some("Complete"));
        assert!(mock.installed_applications().contains(&"com.example.app".to_string()));
    }
}
