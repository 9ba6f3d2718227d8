//! Drives the native file-conduit table through C-ABI fakes.
//!
//! Only entry points that pass plain C types are exercised, so these run on
//! every platform.

mod common;

use std::collections::HashMap;
use std::ffi::{CStr, c_char, c_int, c_void};
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use mobiledevice_core::error::codes;
use mobiledevice_core::ffi::CFTypeRef;
use mobiledevice_core::{
    AfcConnection, AfcConnectionHandle, BindingError, CallTables, ReadMode, ReadOutcome,
    StatusKind, SymbolSource,
};

const FAKE_FILE: usize = 0x40;
const FAKE_DIRECTORY: usize = 0x50;
const CONTENTS: &[u8] = b"abc";
static ENTRIES: [&CStr; 3] = [c".", c"..", c"Media"];

static SERIAL: Mutex<()> = Mutex::new(());
static OPEN_CALLS: AtomicUsize = AtomicUsize::new(0);
static LAST_MODE: AtomicU64 = AtomicU64::new(0);
static READ_OFFSET: AtomicUsize = AtomicUsize::new(0);
static NEXT_ENTRY: AtomicUsize = AtomicUsize::new(0);
static CLOSED: AtomicUsize = AtomicUsize::new(0);

extern "C" fn never_called() {}

unsafe extern "C" fn file_open(
    _conn: CFTypeRef,
    _path: *const c_char,
    mode: u64,
    out: *mut CFTypeRef,
) -> c_int {
    OPEN_CALLS.fetch_add(1, Ordering::SeqCst);
    LAST_MODE.store(mode, Ordering::SeqCst);
    unsafe { *out = ptr::without_provenance(FAKE_FILE) };
    0
}

unsafe extern "C" fn file_read(
    _conn: CFTypeRef,
    _file: CFTypeRef,
    buf: *mut c_void,
    len: *mut u64,
) -> c_int {
    let offset = READ_OFFSET.load(Ordering::SeqCst);
    let remaining = &CONTENTS[offset..];
    let n = remaining.len().min(unsafe { *len } as usize);
    unsafe {
        ptr::copy_nonoverlapping(remaining.as_ptr(), buf.cast::<u8>(), n);
        *len = n as u64;
    }
    READ_OFFSET.fetch_add(n, Ordering::SeqCst);
    0
}

unsafe extern "C" fn file_close(_conn: CFTypeRef, _file: CFTypeRef) -> c_int {
    CLOSED.fetch_add(1, Ordering::SeqCst);
    0
}

unsafe extern "C" fn directory_open(
    _conn: CFTypeRef,
    _path: *const c_char,
    out: *mut CFTypeRef,
) -> c_int {
    unsafe { *out = ptr::without_provenance(FAKE_DIRECTORY) };
    0
}

unsafe extern "C" fn directory_read(
    _conn: CFTypeRef,
    _dir: CFTypeRef,
    out: *mut *mut c_char,
) -> c_int {
    let index = NEXT_ENTRY.fetch_add(1, Ordering::SeqCst);
    let entry = ENTRIES
        .get(index)
        .map_or(ptr::null_mut(), |name| name.as_ptr().cast_mut());
    unsafe { *out = entry };
    0
}

unsafe extern "C" fn directory_close(_conn: CFTypeRef, _dir: CFTypeRef) -> c_int {
    CLOSED.fetch_add(1, Ordering::SeqCst);
    0
}

unsafe extern "C" fn remove_path(_conn: CFTypeRef, _path: *const c_char) -> c_int {
    codes::AFC_NOT_FOUND
}

unsafe extern "C" fn connection_close(_conn: CFTypeRef) -> c_int {
    CLOSED.fetch_add(1, Ordering::SeqCst);
    0
}

const FAKE_LIST: usize = 0x60;

unsafe extern "C" fn create_device_list() -> CFTypeRef {
    ptr::without_provenance(FAKE_LIST)
}

unsafe extern "C" fn copy_device_identifier(_device: CFTypeRef) -> CFTypeRef {
    ptr::without_provenance(FAKE_LIST)
}

unsafe extern "C" fn error_string(code: c_int) -> *const c_char {
    match code {
        codes::AFC_NOT_FOUND => c"Object not found".as_ptr(),
        _ => ptr::null(),
    }
}

struct FakeLibrary {
    overrides: HashMap<&'static str, *mut c_void>,
}

impl FakeLibrary {
    fn new() -> Self {
        let overrides: [(&'static str, *mut c_void); 11] = [
            ("AFCFileRefOpen", file_open as *const () as *mut c_void),
            ("AFCFileRefRead", file_read as *const () as *mut c_void),
            ("AFCFileRefClose", file_close as *const () as *mut c_void),
            ("AFCDirectoryOpen", directory_open as *const () as *mut c_void),
            ("AFCDirectoryRead", directory_read as *const () as *mut c_void),
            ("AFCDirectoryClose", directory_close as *const () as *mut c_void),
            ("AFCRemovePath", remove_path as *const () as *mut c_void),
            ("AFCConnectionClose", connection_close as *const () as *mut c_void),
            ("AFCErrorString", error_string as *const () as *mut c_void),
            ("AMDCreateDeviceList", create_device_list as *const () as *mut c_void),
            (
                "AMDeviceCopyDeviceIdentifier",
                copy_device_identifier as *const () as *mut c_void,
            ),
        ];
        Self {
            overrides: overrides.into_iter().collect(),
        }
    }
}

impl SymbolSource for FakeLibrary {
    fn lookup(&self, symbol: &str) -> Option<NonNull<c_void>> {
        let address = self
            .overrides
            .get(symbol)
            .copied()
            .unwrap_or(never_called as *const () as *mut c_void);
        NonNull::new(address)
    }
}

fn setup() -> (MutexGuard<'static, ()>, CallTables) {
    common::init_tracing();
    let guard = SERIAL.lock().unwrap_or_else(|e| e.into_inner());
    OPEN_CALLS.store(0, Ordering::SeqCst);
    LAST_MODE.store(0, Ordering::SeqCst);
    READ_OFFSET.store(0, Ordering::SeqCst);
    NEXT_ENTRY.store(0, Ordering::SeqCst);
    CLOSED.store(0, Ordering::SeqCst);
    // SAFETY: the tests only reach the entry points overridden above, each of
    // which has the declared signature.
    let tables = unsafe { CallTables::from_source(&FakeLibrary::new()) }.unwrap();
    (guard, tables)
}

fn connection(tables: &CallTables) -> AfcConnection {
    // SAFETY: the fake library accepts any connection value.
    let handle = unsafe { AfcConnectionHandle::from_addr(0x30) }.unwrap();
    AfcConnection::adopt(Arc::clone(tables.afc()), handle)
}

#[test]
fn test_unsupported_mode_is_rejected_before_native_call() {
    let (_guard, tables) = setup();
    let conn = connection(&tables);
    for mode in [0, 2, 4, 7] {
        let err = conn.open_file_raw("/var/mobile/Media/test", mode).unwrap_err();
        assert!(matches!(err, BindingError::UnsupportedReadMode { mode: m } if m == mode));
    }
    assert_eq!(OPEN_CALLS.load(Ordering::SeqCst), 0);
}

#[test]
fn test_mode_is_passed_through() {
    let (_guard, tables) = setup();
    let conn = connection(&tables);
    let file = conn.open_file_raw("/a", 3).unwrap();
    assert_eq!(LAST_MODE.load(Ordering::SeqCst), ReadMode::CreateReadWrite.as_raw());
    assert_eq!(file.handle().addr(), FAKE_FILE);
}

#[test]
fn test_short_read_then_end_of_file() {
    let (_guard, tables) = setup();
    let conn = connection(&tables);
    let mut file = conn.open_file("/a", ReadMode::ReadOnly).unwrap();

    let mut buf = [0u8; 16];
    assert_eq!(file.read(&mut buf).unwrap(), ReadOutcome::Short(3));
    assert_eq!(&buf[..3], CONTENTS);
    assert_eq!(file.read(&mut buf).unwrap(), ReadOutcome::EndOfFile);

    drop(file);
    assert_eq!(CLOSED.load(Ordering::SeqCst), 1);
}

#[test]
fn test_directory_iteration_terminates_on_null_entry() {
    let (_guard, tables) = setup();
    let conn = connection(&tables);
    let names = conn.list_directory("/").unwrap();
    assert_eq!(names, vec!["Media"]);
    assert_eq!(CLOSED.load(Ordering::SeqCst), 1);
}

#[test]
fn test_native_failure_carries_description() {
    let (_guard, tables) = setup();
    let conn = connection(&tables);
    let err = conn.remove("/missing").unwrap_err();
    assert_eq!(err.kind(), Some(StatusKind::NotFound));
    assert!(err.to_string().contains("Object not found"));

    assert_eq!(tables.afc().describe_status(codes::AFC_IO), "unknown native error");
}

#[test]
fn test_connection_closed_on_drop() {
    let (_guard, tables) = setup();
    drop(connection(&tables));
    assert_eq!(CLOSED.load(Ordering::SeqCst), 1);
}

#[cfg(not(target_os = "macos"))]
#[test]
fn test_device_list_without_core_foundation_fails() {
    let (_guard, tables) = setup();
    let err = tables.device().list_devices().unwrap_err();
    assert!(matches!(err, BindingError::Unsupported(_)));

    // SAFETY: the fake library accepts any device value.
    let device = unsafe { mobiledevice_core::DeviceHandle::from_addr(0x70) }.unwrap();
    let err = tables.device().copy_device_identifier(device).unwrap_err();
    assert!(matches!(err, BindingError::Unsupported(_)));
}
