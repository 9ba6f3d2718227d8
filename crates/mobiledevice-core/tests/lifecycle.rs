//! End-to-end flows over the fakes, with a fault injected at every step.

mod common;

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use mobiledevice_core::error::{Result, codes};
use mobiledevice_core::{
    AfcConnection, Category, Device, DeviceCalls, Event, FileConduitCalls, MockDeviceCalls,
    MockFileConduit, NotificationDispatcher, ReadMode,
};
use plist::{Dictionary, Value};

const BUNDLE: &str = "com.example.notes";

struct Fixture {
    device_mock: MockDeviceCalls,
    afc_mock: MockFileConduit,
    device_calls: Arc<dyn DeviceCalls>,
    afc_calls: Arc<dyn FileConduitCalls>,
}

impl Fixture {
    fn new() -> Self {
        common::init_tracing();
        let device_mock = MockDeviceCalls::new();
        let afc_mock = MockFileConduit::new();
        device_mock.attach_file_conduit(&afc_mock);
        device_mock.add_device("00008101-000A1B2C3D4E5F60");
        afc_mock.insert_file("/Documents/notes.txt", b"remember the milk");
        Self {
            device_calls: Arc::new(device_mock.clone()),
            afc_calls: Arc::new(afc_mock.clone()),
            device_mock,
            afc_mock,
        }
    }
}

/// Install an app, then read and rewrite a file in its container.
fn scenario(fixture: &Fixture) -> Result<Vec<u8>> {
    let mut devices = Device::list(&fixture.device_calls)?;
    let device = &mut devices[0];
    device.connect()?;
    let session = device.start_session()?;

    let mut options = Dictionary::new();
    options.insert("CFBundleIdentifier".into(), Value::String(BUNDLE.into()));
    session.install_application(Path::new("/tmp/Notes.app"), &options, None)?;

    let afc = session.house_arrest(BUNDLE, Arc::clone(&fixture.afc_calls))?;
    let contents = afc.read_file("/Documents/notes.txt")?;
    afc.write_file("/Documents/notes.txt", b"done")?;
    afc.create_directory("/Documents/archive")?;
    afc.rename("/Documents/notes.txt", "/Documents/archive/notes.txt")?;
    let outcome = afc.remove_path_and_contents("/Documents/archive")?;
    assert!(outcome.status.is_success());
    afc.close()?;
    session.end()?;
    device.disconnect()?;
    Ok(contents)
}

#[test]
fn test_happy_path() {
    let fixture = Fixture::new();
    let contents = scenario(&fixture).unwrap();
    assert_eq!(contents, b"remember the milk");
    assert!(!fixture.afc_mock.exists("/Documents/archive"));
    assert_eq!(fixture.afc_mock.open_handles(), 0);
}

#[test]
fn test_no_leaks_under_fault_injection() {
    let operations = [
        ("AMDCreateDeviceList", codes::AMD_TIMEOUT),
        ("AMDeviceConnect", codes::AMD_NOT_CONNECTED),
        ("AMDeviceStartSession", codes::AMD_PERMISSION),
        ("AMDeviceSecureInstallApplication", codes::AMD_INVALID_ARGUMENT),
        ("AMDeviceCreateHouseArrestService", codes::AMD_NOT_FOUND),
        ("AMDeviceStopSession", codes::AMD_TIMEOUT),
        ("AMDeviceDisconnect", codes::AMD_TIMEOUT),
        ("AFCFileRefOpen", codes::AFC_PERMISSION),
        ("AFCFileRefRead", codes::AFC_IO),
        ("AFCFileRefWrite", codes::AFC_IO),
        ("AFCDirectoryCreate", codes::AFC_EXISTS),
        ("AFCRenamePath", codes::AFC_NOT_FOUND),
        ("AFCOperationCreateRemovePathAndContents", codes::AFC_IO),
        ("AFCConnectionProcessOperation", codes::AFC_TIMEOUT),
    ];

    for (operation, code) in operations {
        let fixture = Fixture::new();
        let handle = fixture.device_mock.add_device("second");
        fixture.device_mock.fail_next(operation, code);
        let result = scenario(&fixture);

        assert!(result.is_err(), "{operation} fault was not surfaced");
        assert_eq!(
            fixture.afc_mock.open_handles(),
            0,
            "file conduit handles leaked after {operation} failed"
        );
        assert_eq!(fixture.device_mock.retain_count(handle), 0);
        assert_eq!(fixture.device_mock.open_services(), 0);
        let reached = fixture.device_mock.calls().contains(&operation)
            || fixture.afc_mock.calls().contains(&operation);
        assert!(reached, "{operation} was never reached");
    }
}

#[test]
fn test_device_guard_balances_after_failures() {
    let fixture = Fixture::new();
    {
        let mut devices = Device::list(&fixture.device_calls).unwrap();
        let device = &mut devices[0];
        fixture
            .device_mock
            .fail_next("AMDeviceStartSession", codes::AMD_TIMEOUT);
        device.connect().unwrap();
        assert!(device.start_session().is_err());
        assert!(!device.has_session());
        let session = device.start_session().unwrap();
        assert!(session.device().has_session());
    }
    assert!(fixture.device_mock.calls().ends_with(&[
        "AMDeviceStopSession",
        "AMDeviceDisconnect",
        "AMDeviceRelease"
    ]));
}

#[test]
fn test_afc_connection_over_service() {
    let fixture = Fixture::new();
    let mut devices = Device::list(&fixture.device_calls).unwrap();
    let device = &mut devices[0];
    device.connect().unwrap();
    let session = device.start_session().unwrap();
    let service = session.start_service("com.apple.afc", None).unwrap();
    drop(session);

    let afc = AfcConnection::open(
        Arc::clone(&fixture.afc_calls),
        &service,
        Duration::from_secs(10),
    )
    .unwrap();
    let mut file = afc
        .open_file("/Documents/notes.txt", ReadMode::ReadOnly)
        .unwrap();
    let mut buf = [0u8; 8];
    assert_eq!(file.read(&mut buf).unwrap().len(), 8);
    drop(file);
    drop(afc);
    drop(service);
    assert_eq!(fixture.afc_mock.open_handles(), 0);
    assert_eq!(fixture.device_mock.open_services(), 0);
}

#[test]
fn test_events_reach_channel_subscribers() {
    let fixture = Fixture::new();
    let dispatcher = NotificationDispatcher::new(Arc::clone(&fixture.device_calls));
    let (id, events) = dispatcher.subscribe_channel(Category::Device).unwrap();

    let handle = fixture.device_mock.add_device("hotplugged");
    fixture
        .device_mock
        .fire_device_event(handle, mobiledevice_core::ffi::notification::CONNECTED);
    assert_eq!(events.try_recv().unwrap(), Event::DeviceConnected(handle));

    let device = Device::retain(Arc::clone(&fixture.device_calls), handle);
    assert_eq!(device.identifier().unwrap(), "hotplugged");
    drop(device);
    assert_eq!(fixture.device_mock.retain_count(handle), 0);

    dispatcher.unsubscribe(id).unwrap();
    fixture
        .device_mock
        .fire_stale_device_event(handle, mobiledevice_core::ffi::notification::DISCONNECTED);
    assert!(events.try_recv().is_err());
}
