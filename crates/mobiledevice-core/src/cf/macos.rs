use std::ffi::c_void;
use std::io::Cursor;
use std::path::Path;

use core_foundation::base::{CFType, TCFType};
use core_foundation::data::CFData;
use core_foundation::propertylist::{create_data, create_with_data};
use core_foundation::string::CFString;
use core_foundation::url::CFURL;
use core_foundation_sys::array::{CFArrayGetCount, CFArrayGetValueAtIndex, CFArrayRef};
use core_foundation_sys::base::CFRelease;
use core_foundation_sys::propertylist::{
    kCFPropertyListBinaryFormat_v1_0, kCFPropertyListImmutable,
};
use core_foundation_sys::string::CFStringRef;

use crate::error::{BindingError, Result};
use crate::ffi::CFTypeRef;

/// A CoreFoundation object this crate created and releases on drop.
pub(crate) struct OwnedCf(CFType);

impl OwnedCf {
    pub(crate) fn as_ptr(&self) -> CFTypeRef {
        self.0.as_CFTypeRef()
    }
}

pub(crate) fn string(value: &str) -> Result<OwnedCf> {
    Ok(OwnedCf(CFString::new(value).into_CFType()))
}

pub(crate) fn url(path: &Path, is_directory: bool) -> Result<OwnedCf> {
    CFURL::from_path(path, is_directory)
        .map(|url| OwnedCf(url.into_CFType()))
        .ok_or_else(|| BindingError::PropertyList(format!("not a file URL: {}", path.display())))
}

pub(crate) fn property_list(value: &plist::Value) -> Result<OwnedCf> {
    let mut encoded = Vec::new();
    value
        .to_writer_binary(&mut encoded)
        .map_err(|e| BindingError::PropertyList(e.to_string()))?;
    let (ptr, _format) = create_with_data(CFData::from_buffer(&encoded), kCFPropertyListImmutable)
        .map_err(|e| BindingError::PropertyList(e.description().to_string()))?;
    // SAFETY: create_with_data follows the create rule.
    Ok(OwnedCf(unsafe { CFType::wrap_under_create_rule(ptr) }))
}

fn decode(ptr: *const c_void) -> Result<plist::Value> {
    let data = create_data(ptr, kCFPropertyListBinaryFormat_v1_0)
        .map_err(|e| BindingError::PropertyList(e.description().to_string()))?;
    plist::Value::from_reader(Cursor::new(data.bytes()))
        .map_err(|e| BindingError::PropertyList(e.to_string()))
}

/// Convert a string the caller owns (create rule) and release it.
///
/// # Safety
///
/// `ptr` must be null or a CFString with a +1 retain owned by the caller.
pub(crate) unsafe fn take_string(ptr: CFTypeRef) -> Result<Option<String>> {
    if ptr.is_null() {
        return Ok(None);
    }
    // SAFETY: guaranteed by the caller.
    let string = unsafe { CFString::wrap_under_create_rule(ptr as CFStringRef) };
    Ok(Some(string.to_string()))
}

/// Convert a property list the caller owns (create rule) and release it.
///
/// # Safety
///
/// `ptr` must be null or a property-list object with a +1 retain owned by the caller.
pub(crate) unsafe fn take_value(ptr: CFTypeRef) -> Result<Option<plist::Value>> {
    if ptr.is_null() {
        return Ok(None);
    }
    // SAFETY: guaranteed by the caller; the wrapper releases on drop.
    let owned = unsafe { CFType::wrap_under_create_rule(ptr) };
    decode(owned.as_CFTypeRef()).map(Some)
}

/// Convert a property list owned by someone else (get rule).
///
/// # Safety
///
/// `ptr` must be null or a property-list object that stays alive for this call.
pub(crate) unsafe fn borrow_value(ptr: CFTypeRef) -> Result<Option<plist::Value>> {
    if ptr.is_null() {
        return Ok(None);
    }
    decode(ptr).map(Some)
}

/// Visit every element of an owned array, then release the array.
///
/// # Safety
///
/// `ptr` must be null or a CFArray with a +1 retain owned by the caller.
pub(crate) unsafe fn take_array_with(
    ptr: CFTypeRef,
    mut visit: impl FnMut(CFTypeRef),
) -> Result<()> {
    if ptr.is_null() {
        return Ok(());
    }
    let array = ptr as CFArrayRef;
    // SAFETY: `array` is a live CFArray per the caller's contract.
    unsafe {
        let count = CFArrayGetCount(array);
        for index in 0..count {
            visit(CFArrayGetValueAtIndex(array, index));
        }
        CFRelease(ptr);
    }
    Ok(())
}

/// Release a CoreFoundation object.
///
/// # Safety
///
/// `ptr` must be null or carry a retain owned by the caller.
pub(crate) unsafe fn release(ptr: CFTypeRef) -> Result<()> {
    if !ptr.is_null() {
        // SAFETY: guaranteed by the caller.
        unsafe { CFRelease(ptr) };
    }
    Ok(())
}
