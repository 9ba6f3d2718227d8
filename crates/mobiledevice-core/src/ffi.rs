//! Raw ABI of the native device library.
//!
//! Everything here mirrors the C declarations: opaque references are plain
//! pointers, statuses are `c_int`. Nothing in this module is safe to call
//! directly; the typed call tables in [`crate::device`] and [`crate::afc`] are
//! the only users.

use std::ffi::{c_char, c_int, c_ulong, c_void};
use std::fmt;

use crate::resolver::SymbolSource;

pub type CFTypeRef = *const c_void;
pub type CFStringRef = *const c_void;
pub type CFDictionaryRef = *const c_void;
pub type CFArrayRef = *const c_void;
pub type CFURLRef = *const c_void;
pub type CFPropertyListRef = *const c_void;
pub type CFPropertyListFormat = isize;

pub type AmDeviceRef = CFTypeRef;
pub type AmRestorableDeviceRef = CFTypeRef;
pub type AfcConnectionRef = CFTypeRef;
pub type AfcOperationRef = CFTypeRef;
pub type NotificationSubscriptionRef = *mut c_void;

/// `kCFPropertyListXMLFormat_v1_0`, the format service messages are sent in.
pub const PROPERTY_LIST_XML_FORMAT: CFPropertyListFormat = 100;

/// Payload of a device notification callback.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct AmDeviceNotification {
    pub device: AmDeviceRef,
    pub status: c_int,
}

/// Device notification status values.
pub mod notification {
    use std::ffi::c_int;

    pub const CONNECTED: c_int = 1;
    pub const DISCONNECTED: c_int = 2;
    pub const UNSUBSCRIBED: c_int = 3;
    pub const PAIRED: c_int = 4;

    pub const RESTORABLE_CONNECTED: c_int = 0;
    pub const RESTORABLE_DISCONNECTED: c_int = 1;
}

pub type ProgressCallback = unsafe extern "C" fn(progress: CFDictionaryRef, context: *mut c_void);

pub type DeviceNotificationCallback =
    unsafe extern "C" fn(notification: *const AmDeviceNotification, context: *mut c_void);

pub type RestorableNotificationCallback =
    unsafe extern "C" fn(device: AmRestorableDeviceRef, status: c_int, context: *mut c_void);

pub type AfcNotificationCallback =
    unsafe extern "C" fn(connection: *mut c_void, arg: *mut c_void, operation: *mut c_void);

/// Declares a table of entry points together with the symbol each one binds to.
///
/// The generated `bind` looks up every symbol before deciding, so a failure
/// names all missing symbols at once.
macro_rules! call_table {
    (
        $(#[$meta:meta])*
        pub struct $name:ident {
            $( $field:ident : $symbol:literal => $ty:ty, )*
        }
    ) => {
        $(#[$meta])*
        #[derive(Clone, Copy)]
        pub struct $name {
            $( pub $field: $ty, )*
        }

        impl $name {
            /// Every symbol bound by this table, in declaration order.
            pub const SYMBOLS: &'static [&'static str] = &[$($symbol),*];

            /// Resolve every entry point from `source`.
            ///
            /// # Safety
            ///
            /// Each address returned by `source` must point to a function with
            /// the signature declared for that symbol.
            pub unsafe fn bind(source: &dyn SymbolSource) -> Result<Self, Vec<&'static str>> {
                let mut missing = Vec::new();
                $(
                    let $field = source.lookup($symbol);
                    if $field.is_none() {
                        missing.push($symbol);
                    }
                )*
                match ($($field,)*) {
                    ($(Some($field),)*) => Ok(Self {
                        $(
                            $field: unsafe {
                                std::mem::transmute::<*mut c_void, $ty>($field.as_ptr())
                            },
                        )*
                    }),
                    _ => Err(missing),
                }
            }

            /// Addresses of all entry points, paired with their symbols.
            pub fn entries(&self) -> Vec<(&'static str, *const c_void)> {
                vec![$( ($symbol, self.$field as *const c_void), )*]
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.debug_struct(stringify!($name))
                    .field("entries", &Self::SYMBOLS.len())
                    .finish()
            }
        }
    };
}

call_table! {
    /// Device management entry points.
    pub struct RawDeviceCalls {
        connect: "AMDeviceConnect" => unsafe extern "C" fn(AmDeviceRef) -> c_int,
        disconnect: "AMDeviceDisconnect" => unsafe extern "C" fn(AmDeviceRef) -> c_int,
        is_paired: "AMDeviceIsPaired" => unsafe extern "C" fn(AmDeviceRef) -> c_int,
        pair: "AMDevicePair" => unsafe extern "C" fn(AmDeviceRef) -> c_int,
        start_session: "AMDeviceStartSession" => unsafe extern "C" fn(AmDeviceRef) -> c_int,
        stop_session: "AMDeviceStopSession" => unsafe extern "C" fn(AmDeviceRef) -> c_int,
        validate_pairing: "AMDeviceValidatePairing" => unsafe extern "C" fn(AmDeviceRef) -> c_int,

        retain: "AMDeviceRetain" => unsafe extern "C" fn(AmDeviceRef),
        release: "AMDeviceRelease" => unsafe extern "C" fn(AmDeviceRef),

        copy_device_identifier: "AMDeviceCopyDeviceIdentifier"
            => unsafe extern "C" fn(AmDeviceRef) -> CFStringRef,
        copy_value: "AMDeviceCopyValue"
            => unsafe extern "C" fn(AmDeviceRef, CFStringRef, CFStringRef) -> CFTypeRef,

        create_device_list: "AMDCreateDeviceList" => unsafe extern "C" fn() -> CFArrayRef,
        notification_subscribe: "AMDeviceNotificationSubscribe"
            => unsafe extern "C" fn(
                DeviceNotificationCallback,
                c_int,
                c_int,
                *mut c_void,
                *mut NotificationSubscriptionRef,
            ) -> c_int,
        notification_unsubscribe: "AMDeviceNotificationUnsubscribe"
            => unsafe extern "C" fn(NotificationSubscriptionRef) -> c_int,

        service_get_socket: "AMDServiceConnectionGetSocket" => unsafe extern "C" fn(CFTypeRef) -> c_int,
        service_invalidate: "AMDServiceConnectionInvalidate" => unsafe extern "C" fn(CFTypeRef) -> c_int,
        service_receive: "AMDServiceConnectionReceive"
            => unsafe extern "C" fn(CFTypeRef, *mut c_void, usize) -> usize,
        service_receive_message: "AMDServiceConnectionReceiveMessage"
            => unsafe extern "C" fn(
                CFTypeRef,
                *mut CFPropertyListRef,
                *mut CFPropertyListFormat,
                *mut c_void,
                *mut c_void,
                *mut c_void,
            ) -> c_int,
        service_send: "AMDServiceConnectionSend"
            => unsafe extern "C" fn(CFTypeRef, *const c_void, usize) -> usize,
        service_send_message: "AMDServiceConnectionSendMessage"
            => unsafe extern "C" fn(
                CFTypeRef,
                CFPropertyListRef,
                CFPropertyListFormat,
                *mut c_void,
                *const c_void,
                *const c_void,
            ) -> c_int,
        service_get_secure_io_context: "AMDServiceConnectionGetSecureIOContext"
            => unsafe extern "C" fn(CFTypeRef) -> c_int,

        secure_start_service: "AMDeviceSecureStartService"
            => unsafe extern "C" fn(AmDeviceRef, CFStringRef, CFDictionaryRef, *mut CFTypeRef) -> c_int,
        secure_transfer_path: "AMDeviceSecureTransferPath"
            => unsafe extern "C" fn(
                c_int,
                AmDeviceRef,
                CFURLRef,
                CFDictionaryRef,
                Option<ProgressCallback>,
                *mut c_void,
            ) -> c_int,
        secure_install_application: "AMDeviceSecureInstallApplication"
            => unsafe extern "C" fn(
                c_int,
                AmDeviceRef,
                CFURLRef,
                CFDictionaryRef,
                Option<ProgressCallback>,
                *mut c_void,
            ) -> c_int,
        secure_uninstall_application: "AMDeviceSecureUninstallApplication"
            => unsafe extern "C" fn(
                c_int,
                AmDeviceRef,
                CFStringRef,
                c_int,
                Option<ProgressCallback>,
                *mut c_void,
            ) -> c_int,
        lookup_applications: "AMDeviceLookupApplications"
            => unsafe extern "C" fn(AmDeviceRef, CFDictionaryRef, *mut CFDictionaryRef) -> c_int,
        create_house_arrest_service: "AMDeviceCreateHouseArrestService"
            => unsafe extern "C" fn(AmDeviceRef, CFStringRef, *mut c_void, *mut AfcConnectionRef) -> c_int,

        mount_image: "AMDeviceMountImage"
            => unsafe extern "C" fn(
                AmDeviceRef,
                CFStringRef,
                CFDictionaryRef,
                Option<ProgressCallback>,
                *mut c_void,
            ) -> c_int,

        restorable_register: "AMRestorableDeviceRegisterForNotifications"
            => unsafe extern "C" fn(RestorableNotificationCallback, *mut c_void, c_int, c_int) -> c_int,
        restorable_unregister: "AMRestorableDeviceUnregisterForNotifications"
            => unsafe extern "C" fn(c_int) -> c_int,

        restorable_copy_board_config: "AMRestorableDeviceCopyBoardConfig"
            => unsafe extern "C" fn(AmRestorableDeviceRef) -> CFStringRef,
        restorable_copy_product_string: "AMRestorableDeviceCopyProductString"
            => unsafe extern "C" fn(AmRestorableDeviceRef) -> CFStringRef,
        restorable_copy_serial_number: "AMRestorableDeviceCopySerialNumber"
            => unsafe extern "C" fn(AmRestorableDeviceRef) -> CFStringRef,
        restorable_copy_user_friendly_name: "AMRestorableDeviceCopyUserFriendlyName"
            => unsafe extern "C" fn(AmRestorableDeviceRef) -> CFStringRef,
        restorable_get_board_id: "AMRestorableDeviceGetBoardID"
            => unsafe extern "C" fn(AmRestorableDeviceRef) -> c_int,
        restorable_get_chip_id: "AMRestorableDeviceGetChipID"
            => unsafe extern "C" fn(AmRestorableDeviceRef) -> c_int,
        restorable_get_device_class: "AMRestorableDeviceGetDeviceClass"
            => unsafe extern "C" fn(AmRestorableDeviceRef) -> c_int,
        restorable_get_ecid: "AMRestorableDeviceGetECID"
            => unsafe extern "C" fn(AmRestorableDeviceRef) -> c_ulong,
        restorable_get_location_id: "AMRestorableDeviceGetLocationID"
            => unsafe extern "C" fn(AmRestorableDeviceRef) -> c_int,
        restorable_get_product_type: "AMRestorableDeviceGetProductType"
            => unsafe extern "C" fn(AmRestorableDeviceRef) -> c_int,
        restorable_get_state: "AMRestorableDeviceGetState"
            => unsafe extern "C" fn(AmRestorableDeviceRef) -> c_int,

        initialize: "_InitializeMobileDevice" => unsafe extern "C" fn(),
        set_log_level: "AMDSetLogLevel" => unsafe extern "C" fn(i32),
        copy_error_text: "AMDCopyErrorText" => unsafe extern "C" fn(c_int) -> CFStringRef,
    }
}

call_table! {
    /// Apple File Conduit entry points.
    pub struct RawAfcCalls {
        connection_create: "AFCConnectionCreate"
            => unsafe extern "C" fn(
                *mut c_void,
                c_int,
                *mut c_void,
                Option<AfcNotificationCallback>,
                *mut c_void,
            ) -> AfcConnectionRef,
        connection_open: "AFCConnectionOpen"
            => unsafe extern "C" fn(CFTypeRef, u32, *mut CFTypeRef) -> c_int,
        connection_close: "AFCConnectionClose" => unsafe extern "C" fn(AfcConnectionRef) -> c_int,
        set_secure_context: "AFCConnectionSetSecureContext" => unsafe extern "C" fn(CFTypeRef) -> c_int,

        directory_open: "AFCDirectoryOpen"
            => unsafe extern "C" fn(AfcConnectionRef, *const c_char, *mut CFTypeRef) -> c_int,
        directory_read: "AFCDirectoryRead"
            => unsafe extern "C" fn(AfcConnectionRef, CFTypeRef, *mut *mut c_char) -> c_int,
        directory_close: "AFCDirectoryClose"
            => unsafe extern "C" fn(AfcConnectionRef, CFTypeRef) -> c_int,
        directory_create: "AFCDirectoryCreate"
            => unsafe extern "C" fn(AfcConnectionRef, *const c_char) -> c_int,
        file_open: "AFCFileRefOpen"
            => unsafe extern "C" fn(AfcConnectionRef, *const c_char, u64, *mut CFTypeRef) -> c_int,
        file_close: "AFCFileRefClose" => unsafe extern "C" fn(AfcConnectionRef, CFTypeRef) -> c_int,
        file_seek: "AFCFileRefSeek"
            => unsafe extern "C" fn(AfcConnectionRef, CFTypeRef, i64, u64) -> c_int,
        file_tell: "AFCFileRefTell"
            => unsafe extern "C" fn(AfcConnectionRef, CFTypeRef, *mut u64) -> c_int,
        file_read: "AFCFileRefRead"
            => unsafe extern "C" fn(AfcConnectionRef, CFTypeRef, *mut c_void, *mut u64) -> c_int,
        file_write: "AFCFileRefWrite"
            => unsafe extern "C" fn(AfcConnectionRef, CFTypeRef, *const c_void, u64) -> c_int,
        rename_path: "AFCRenamePath"
            => unsafe extern "C" fn(AfcConnectionRef, *const c_char, *const c_char) -> c_int,
        remove_path: "AFCRemovePath"
            => unsafe extern "C" fn(AfcConnectionRef, *const c_char) -> c_int,

        process_operation: "AFCConnectionProcessOperation"
            => unsafe extern "C" fn(AfcConnectionRef, AfcOperationRef) -> c_int,
        operation_get_result_status: "AFCOperationGetResultStatus"
            => unsafe extern "C" fn(AfcOperationRef) -> c_int,
        operation_create_remove_path_and_contents: "AFCOperationCreateRemovePathAndContents"
            => unsafe extern "C" fn(CFTypeRef, CFStringRef, *mut c_void) -> AfcOperationRef,
        operation_get_result_object: "AFCOperationGetResultObject"
            => unsafe extern "C" fn(AfcOperationRef) -> CFTypeRef,

        error_string: "AFCErrorString" => unsafe extern "C" fn(c_int) -> *const c_char,
        connection_copy_last_error_info: "AFCConnectionCopyLastErrorInfo"
            => unsafe extern "C" fn(AfcConnectionRef) -> CFDictionaryRef,
    }
}
