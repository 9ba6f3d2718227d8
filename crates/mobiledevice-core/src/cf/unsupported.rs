use std::convert::Infallible;
use std::path::Path;

use tracing::error;

use crate::error::{BindingError, Result};
use crate::ffi::CFTypeRef;

const CORE_FOUNDATION: &str = "CoreFoundation marshalling";

/// Never constructed on this platform.
pub(crate) struct OwnedCf(Infallible);

impl OwnedCf {
    pub(crate) fn as_ptr(&self) -> CFTypeRef {
        match self.0 {}
    }
}

/// A native object reached us but cannot be read or released here.
fn stranded(ptr: CFTypeRef) -> BindingError {
    error!(object = ?ptr, "Native CoreFoundation object left unreleased");
    BindingError::Unsupported(CORE_FOUNDATION)
}

pub(crate) fn string(_value: &str) -> Result<OwnedCf> {
    Err(BindingError::Unsupported(CORE_FOUNDATION))
}

pub(crate) fn url(_path: &Path, _is_directory: bool) -> Result<OwnedCf> {
    Err(BindingError::Unsupported(CORE_FOUNDATION))
}

pub(crate) fn property_list(_value: &plist::Value) -> Result<OwnedCf> {
    Err(BindingError::Unsupported(CORE_FOUNDATION))
}

/// # Safety
///
/// Never dereferences `ptr`; the signature matches the macOS implementation.
pub(crate) unsafe fn take_string(ptr: CFTypeRef) -> Result<Option<String>> {
    if ptr.is_null() {
        return Ok(None);
    }
    Err(stranded(ptr))
}

/// # Safety
///
/// Never dereferences `ptr`; the signature matches the macOS implementation.
pub(crate) unsafe fn take_value(ptr: CFTypeRef) -> Result<Option<plist::Value>> {
    if ptr.is_null() {
        return Ok(None);
    }
    Err(stranded(ptr))
}

/// # Safety
///
/// Never dereferences `ptr`; the signature matches the macOS implementation.
pub(crate) unsafe fn borrow_value(ptr: CFTypeRef) -> Result<Option<plist::Value>> {
    if ptr.is_null() {
        return Ok(None);
    }
    Err(BindingError::Unsupported(CORE_FOUNDATION))
}

/// # Safety
///
/// Never dereferences `ptr`; the signature matches the macOS implementation.
pub(crate) unsafe fn take_array_with(ptr: CFTypeRef, _visit: impl FnMut(CFTypeRef)) -> Result<()> {
    if ptr.is_null() {
        return Ok(());
    }
    Err(stranded(ptr))
}

/// # Safety
///
/// Never dereferences `ptr`; the signature matches the macOS implementation.
pub(crate) unsafe fn release(ptr: CFTypeRef) -> Result<()> {
    if ptr.is_null() {
        return Ok(());
    }
    Err(stranded(ptr))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn object() -> CFTypeRef {
        std::ptr::without_provenance(0x1000)
    }

    #[test]
    fn test_null_objects_are_fine() {
        unsafe {
            assert_eq!(take_string(std::ptr::null()).unwrap(), None);
            assert_eq!(take_value(std::ptr::null()).unwrap(), None);
            assert!(take_array_with(std::ptr::null(), |_| {}).is_ok());
            assert!(release(std::ptr::null()).is_ok());
        }
    }

    #[test]
    fn test_live_objects_are_reported_unsupported() {
        let mut visited = 0;
        unsafe {
            assert!(matches!(take_string(object()), Err(BindingError::Unsupported(_))));
            assert!(matches!(take_value(object()), Err(BindingError::Unsupported(_))));
            assert!(matches!(borrow_value(object()), Err(BindingError::Unsupported(_))));
            assert!(matches!(
                take_array_with(object(), |_| visited += 1),
                Err(BindingError::Unsupported(_))
            ));
            assert!(matches!(release(object()), Err(BindingError::Unsupported(_))));
        }
        assert_eq!(visited, 0);
    }
}
