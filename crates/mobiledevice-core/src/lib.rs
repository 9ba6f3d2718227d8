//! mobiledevice-core: runtime binding to the native MobileDevice library.
//!
//! The native device-management library ships without headers or an import
//! library. This crate loads it at runtime, binds every entry point it needs
//! into two typed call tables, and routes its notifications to Rust observers.
//!
//! # Architecture
//!
//! The crate is organized into layers:
//!
//! - **Resolver**: library loading and all-or-nothing symbol binding
//! - **FFI**: raw C signatures, callback shapes and the raw call tables
//! - **Device**: typed device call table plus `Device` / `Session` / `ServiceConnection` guards
//! - **AFC**: typed file-conduit call table plus connection, file and directory guards
//! - **Notify**: subscription registry and event dispatch
//! - **Error**: native status translation
//! - **Mock**: in-memory fakes of both call tables for tests
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use mobiledevice_core::{BindingConfig, Category, Device, NotificationDispatcher, TracingObserver};
//!
//! let tables = mobiledevice_core::resolve_with_config(&BindingConfig::default())?;
//!
//! let dispatcher = NotificationDispatcher::new(tables.device().clone());
//! dispatcher.subscribe(Category::Device, Arc::new(TracingObserver))?;
//!
//! for mut device in Device::list(tables.device())? {
//!     device.connect()?;
//!     let session = device.start_session()?;
//!     let version = session.copy_value(None, "ProductVersion")?;
//!     println!("{}: {:?}", session.device().identifier()?, version);
//! }
//! # Ok::<(), mobiledevice_core::BindingError>(())
//! ```

pub mod afc;
mod cf;
pub mod config;
pub mod device;
pub mod error;
pub mod ffi;
pub mod handle;
pub mod mock;
pub mod notify;
pub mod resolver;
mod sync;

// Re-exports for convenience
pub use afc::{
    AfcConnection, AfcDirectory, AfcFile, AfcOperation, DirectoryEntry, FileConduitCalls,
    NativeFileConduit, OperationOutcome, ReadMode, ReadOutcome,
};
pub use config::BindingConfig;
pub use device::{
    Device, DeviceCalls, NativeDeviceCalls, Progress, ProgressReceiver, ProgressSink,
    RestorableDevice, RestorableDeviceInfo, RestorableDeviceState, ServiceConnection, Session,
    progress_channel,
};
pub use error::{BindingError, ResolutionError, Status, StatusDomain, StatusKind};
pub use handle::{
    AfcConnectionHandle, DeviceHandle, DirectoryHandle, FileHandle, Handle, OperationHandle,
    RestorableDeviceHandle, ServiceConnectionHandle,
};
pub use mock::{MockDeviceCalls, MockFileConduit, MockRestorable};
pub use notify::{
    Category, ChannelObserver, Event, EventObserver, NotificationDispatcher, NullObserver,
    SubscriptionId, SubscriptionState, TracingObserver,
};
pub use resolver::{CallTables, LibraryLocator, LoadedLibrary, SymbolSource, resolve, resolve_with_config};
