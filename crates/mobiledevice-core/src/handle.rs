//! Opaque native handles.
//!
//! A handle is an address the native layer gave us. It is never dereferenced
//! here, only passed back. The kind parameter keeps a file cursor from being
//! handed to a directory call.

use std::ffi::c_void;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::marker::PhantomData;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::error::{BindingError, Result};

/// Marker types for handle kinds.
pub mod kind {
    macro_rules! handle_kinds {
        ($($name:ident => $label:literal),* $(,)?) => {
            $(
                #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
                pub enum $name {}

                impl super::HandleKind for $name {
                    const LABEL: &'static str = $label;
                }
            )*
        };
    }

    handle_kinds! {
        Device => "device",
        RestorableDevice => "restorable device",
        ServiceConnection => "service connection",
        AfcConnection => "afc connection",
        Directory => "directory",
        File => "file",
        Operation => "operation",
    }
}

pub trait HandleKind: 'static {
    const LABEL: &'static str;
}

/// A non-null native object reference of kind `K`.
pub struct Handle<K: HandleKind> {
    ptr: NonNull<c_void>,
    _kind: PhantomData<fn() -> K>,
}

// The pointer is an identifier only. Thread-safety of the object it names is
// enforced by the guards that own it.
unsafe impl<K: HandleKind> Send for Handle<K> {}
unsafe impl<K: HandleKind> Sync for Handle<K> {}

impl<K: HandleKind> Handle<K> {
    /// Wrap a pointer returned by the native layer. Null yields `None`.
    ///
    /// # Safety
    ///
    /// `ptr` must name a live native object of kind `K`, or the handle must
    /// never reach the native library (fakes).
    pub unsafe fn from_raw(ptr: *const c_void) -> Option<Self> {
        NonNull::new(ptr.cast_mut()).map(|ptr| Self {
            ptr,
            _kind: PhantomData,
        })
    }

    /// Build a handle from a plain address. Used by fakes, which hand out
    /// numbered handles that nothing ever dereferences.
    ///
    /// # Safety
    ///
    /// Same contract as [`Handle::from_raw`].
    pub unsafe fn from_addr(addr: usize) -> Option<Self> {
        unsafe { Self::from_raw(std::ptr::without_provenance(addr)) }
    }

    pub fn as_ptr(&self) -> *const c_void {
        self.ptr.as_ptr()
    }

    pub fn addr(&self) -> usize {
        self.ptr.as_ptr().addr()
    }

    pub fn kind_label(&self) -> &'static str {
        K::LABEL
    }
}

impl<K: HandleKind> Clone for Handle<K> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<K: HandleKind> Copy for Handle<K> {}

impl<K: HandleKind> PartialEq for Handle<K> {
    fn eq(&self, other: &Self) -> bool {
        self.ptr == other.ptr
    }
}

impl<K: HandleKind> Eq for Handle<K> {}

impl<K: HandleKind> Hash for Handle<K> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.ptr.hash(state);
    }
}

impl<K: HandleKind> fmt::Debug for Handle<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{:#x}", K::LABEL, self.addr())
    }
}

impl<K: HandleKind> fmt::Display for Handle<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.addr())
    }
}

pub type DeviceHandle = Handle<kind::Device>;
pub type RestorableDeviceHandle = Handle<kind::RestorableDevice>;
pub type ServiceConnectionHandle = Handle<kind::ServiceConnection>;
pub type AfcConnectionHandle = Handle<kind::AfcConnection>;
pub type DirectoryHandle = Handle<kind::Directory>;
pub type FileHandle = Handle<kind::File>;
pub type OperationHandle = Handle<kind::Operation>;

/// Marks a handle as in use for the duration of one native call.
///
/// A second caller gets [`BindingError::HandleBusy`] instead of waiting.
#[derive(Debug, Default)]
pub(crate) struct InUse {
    busy: AtomicBool,
}

impl InUse {
    pub(crate) fn claim(&self, kind: &'static str) -> Result<InUseGuard<'_>> {
        if self
            .busy
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            tracing::warn!(kind, "Concurrent use of a native handle rejected");
            return Err(BindingError::HandleBusy { kind });
        }
        Ok(InUseGuard { flag: &self.busy })
    }

    /// Wait out the current holder. For teardown calls, which cannot fail.
    pub(crate) fn claim_for_teardown(&self) -> InUseGuard<'_> {
        while self
            .busy
            .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            std::thread::yield_now();
        }
        InUseGuard { flag: &self.busy }
    }
}

pub(crate) struct InUseGuard<'a> {
    flag: &'a AtomicBool,
}

impl Drop for InUseGuard<'_> {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_null_is_rejected() {
        unsafe {
            assert!(DeviceHandle::from_raw(std::ptr::null()).is_none());
            assert!(FileHandle::from_addr(0).is_none());
        }
    }

    #[test]
    fn test_handle_identity() {
        let a = unsafe { FileHandle::from_addr(0x40) }.unwrap();
        let b = unsafe { FileHandle::from_addr(0x40) }.unwrap();
        assert_eq!(a, b);
        assert_eq!(a.addr(), 0x40);
        assert_eq!(format!("{:?}", a), "file@0x40");
    }

    #[test]
    fn test_in_use_claim_is_exclusive() {
        let flag = InUse::default();
        let guard = flag.claim("file").unwrap();
        assert!(matches!(
            flag.claim("file"),
            Err(BindingError::HandleBusy { kind: "file" })
        ));
        drop(guard);
        assert!(flag.claim("file").is_ok());
    }
}
