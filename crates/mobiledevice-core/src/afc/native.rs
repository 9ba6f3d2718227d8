//! File-conduit call table backed by the resolved native entry points.

use std::ffi::{CStr, CString, c_int};
use std::io::SeekFrom;
use std::ptr;
use std::time::Duration;

use plist::{Dictionary, Value};
use tracing::{instrument, trace, warn};

use super::{DirectoryEntry, FileConduitCalls, ReadMode};
use crate::cf;
use crate::error::{BindingError, Result, Status, check, codes, description_or_fallback};
use crate::ffi::{CFTypeRef, RawAfcCalls};
use crate::handle::{
    AfcConnectionHandle, DirectoryHandle, FileHandle, Handle, HandleKind, OperationHandle,
    ServiceConnectionHandle,
};

const SEEK_SET: u64 = 0;
const SEEK_CUR: u64 = 1;
const SEEK_END: u64 = 2;

/// [`FileConduitCalls`] over [`RawAfcCalls`].
#[derive(Debug, Clone, Copy)]
pub struct NativeFileConduit {
    raw: RawAfcCalls,
}

impl NativeFileConduit {
    pub fn new(raw: RawAfcCalls) -> Self {
        Self { raw }
    }

    pub fn raw(&self) -> &RawAfcCalls {
        &self.raw
    }

    fn check(&self, code: c_int, operation: &'static str) -> Result<()> {
        check(Status::file_conduit(code), operation, |c| self.describe_status(c))
    }

    fn handle_from<K: HandleKind>(ptr: CFTypeRef, operation: &'static str) -> Result<Handle<K>> {
        // SAFETY: `ptr` was just produced by the native call named `operation`.
        unsafe { Handle::from_raw(ptr) }.ok_or(BindingError::NullResult(operation))
    }
}

// SAFETY (every `unsafe` call through `self.raw` below): each entry point was
// bound by name against the signature declared in `ffi`, and the library stays
// mapped for the life of the process. Handles are non-null values the native
// layer issued; path arguments are `CString` locals that outlive the call;
// buffers and out pointers are live locals sized as passed.
impl FileConduitCalls for NativeFileConduit {
    fn connection_create(&self, socket: i32) -> Result<AfcConnectionHandle> {
        let connection = unsafe {
            (self.raw.connection_create)(
                ptr::null_mut(),
                socket,
                ptr::null_mut(),
                None,
                ptr::null_mut(),
            )
        };
        Self::handle_from(connection, "AFCConnectionCreate")
    }

    #[instrument(level = "debug", skip(self))]
    fn connection_open(
        &self,
        service: ServiceConnectionHandle,
        io_timeout: Duration,
    ) -> Result<AfcConnectionHandle> {
        let timeout = u32::try_from(io_timeout.as_secs()).unwrap_or(u32::MAX);
        let mut connection = ptr::null();
        let code = unsafe { (self.raw.connection_open)(service.as_ptr(), timeout, &mut connection) };
        self.check(code, "AFCConnectionOpen")?;
        Self::handle_from(connection, "AFCConnectionOpen")
    }

    #[instrument(level = "debug", skip(self))]
    fn connection_close(&self, connection: AfcConnectionHandle) -> Result<()> {
        let code = unsafe { (self.raw.connection_close)(connection.as_ptr()) };
        self.check(code, "AFCConnectionClose")
    }

    fn set_secure_context(&self, service: ServiceConnectionHandle) -> Result<()> {
        let code = unsafe { (self.raw.set_secure_context)(service.as_ptr()) };
        self.check(code, "AFCConnectionSetSecureContext")
    }

    #[instrument(level = "debug", skip(self))]
    fn directory_open(
        &self,
        connection: AfcConnectionHandle,
        path: &str,
    ) -> Result<DirectoryHandle> {
        let path = CString::new(path)?;
        let mut directory = ptr::null();
        let code = unsafe {
            (self.raw.directory_open)(connection.as_ptr(), path.as_ptr(), &mut directory)
        };
        self.check(code, "AFCDirectoryOpen")?;
        Self::handle_from(directory, "AFCDirectoryOpen")
    }

    fn directory_read(
        &self,
        connection: AfcConnectionHandle,
        directory: DirectoryHandle,
    ) -> Result<DirectoryEntry> {
        let mut entry = ptr::null_mut();
        let code = unsafe {
            (self.raw.directory_read)(connection.as_ptr(), directory.as_ptr(), &mut entry)
        };
        if code == codes::AFC_END_OF_DATA {
            return Ok(DirectoryEntry::End);
        }
        self.check(code, "AFCDirectoryRead")?;
        if entry.is_null() {
            return Ok(DirectoryEntry::End);
        }
        // SAFETY: the entry is a NUL-terminated string owned by the directory
        // handle, valid until the next read or close.
        let name = unsafe { CStr::from_ptr(entry) }.to_string_lossy().into_owned();
        Ok(DirectoryEntry::Name(name))
    }

    fn directory_close(
        &self,
        connection: AfcConnectionHandle,
        directory: DirectoryHandle,
    ) -> Result<()> {
        let code = unsafe { (self.raw.directory_close)(connection.as_ptr(), directory.as_ptr()) };
        self.check(code, "AFCDirectoryClose")
    }

    #[instrument(level = "debug", skip(self))]
    fn directory_create(&self, connection: AfcConnectionHandle, path: &str) -> Result<()> {
        let path = CString::new(path)?;
        let code = unsafe { (self.raw.directory_create)(connection.as_ptr(), path.as_ptr()) };
        self.check(code, "AFCDirectoryCreate")
    }

    #[instrument(level = "debug", skip(self))]
    fn file_open(
        &self,
        connection: AfcConnectionHandle,
        path: &str,
        mode: ReadMode,
    ) -> Result<FileHandle> {
        let path = CString::new(path)?;
        let mut file = ptr::null();
        let code = unsafe {
            (self.raw.file_open)(connection.as_ptr(), path.as_ptr(), mode.as_raw(), &mut file)
        };
        self.check(code, "AFCFileRefOpen")?;
        Self::handle_from(file, "AFCFileRefOpen")
    }

    fn file_close(&self, connection: AfcConnectionHandle, file: FileHandle) -> Result<()> {
        let code = unsafe { (self.raw.file_close)(connection.as_ptr(), file.as_ptr()) };
        self.check(code, "AFCFileRefClose")
    }

    fn file_seek(
        &self,
        connection: AfcConnectionHandle,
        file: FileHandle,
        pos: SeekFrom,
    ) -> Result<()> {
        let (offset, whence) = match pos {
            SeekFrom::Start(n) => (i64::try_from(n).unwrap_or(i64::MAX), SEEK_SET),
            SeekFrom::Current(n) => (n, SEEK_CUR),
            SeekFrom::End(n) => (n, SEEK_END),
        };
        let code =
            unsafe { (self.raw.file_seek)(connection.as_ptr(), file.as_ptr(), offset, whence) };
        self.check(code, "AFCFileRefSeek")
    }

    fn file_tell(&self, connection: AfcConnectionHandle, file: FileHandle) -> Result<u64> {
        let mut position = 0u64;
        let code =
            unsafe { (self.raw.file_tell)(connection.as_ptr(), file.as_ptr(), &mut position) };
        self.check(code, "AFCFileRefTell")?;
        Ok(position)
    }

    #[instrument(level = "trace", skip(self, buf), fields(max_len = buf.len()))]
    fn file_read(
        &self,
        connection: AfcConnectionHandle,
        file: FileHandle,
        buf: &mut [u8],
    ) -> Result<usize> {
        let mut length = buf.len() as u64;
        let code = unsafe {
            (self.raw.file_read)(
                connection.as_ptr(),
                file.as_ptr(),
                buf.as_mut_ptr().cast(),
                &mut length,
            )
        };
        self.check(code, "AFCFileRefRead")?;
        // Never trust a count larger than the buffer.
        let read = usize::try_from(length).unwrap_or(usize::MAX).min(buf.len());
        trace!(read, "File read");
        Ok(read)
    }

    #[instrument(level = "trace", skip(self, data), fields(len = data.len()))]
    fn file_write(
        &self,
        connection: AfcConnectionHandle,
        file: FileHandle,
        data: &[u8],
    ) -> Result<()> {
        let code = unsafe {
            (self.raw.file_write)(
                connection.as_ptr(),
                file.as_ptr(),
                data.as_ptr().cast(),
                data.len() as u64,
            )
        };
        self.check(code, "AFCFileRefWrite")
    }

    #[instrument(level = "debug", skip(self))]
    fn rename_path(&self, connection: AfcConnectionHandle, from: &str, to: &str) -> Result<()> {
        let from = CString::new(from)?;
        let to = CString::new(to)?;
        let code =
            unsafe { (self.raw.rename_path)(connection.as_ptr(), from.as_ptr(), to.as_ptr()) };
        self.check(code, "AFCRenamePath")
    }

    #[instrument(level = "debug", skip(self))]
    fn remove_path(&self, connection: AfcConnectionHandle, path: &str) -> Result<()> {
        let path = CString::new(path)?;
        let code = unsafe { (self.raw.remove_path)(connection.as_ptr(), path.as_ptr()) };
        self.check(code, "AFCRemovePath")
    }

    fn operation_remove_path_and_contents(&self, path: &str) -> Result<OperationHandle> {
        let path = cf::string(path)?;
        let operation = unsafe {
            (self.raw.operation_create_remove_path_and_contents)(
                ptr::null(),
                path.as_ptr(),
                ptr::null_mut(),
            )
        };
        Self::handle_from(operation, "AFCOperationCreateRemovePathAndContents")
    }

    #[instrument(level = "debug", skip(self))]
    fn process_operation(
        &self,
        connection: AfcConnectionHandle,
        operation: OperationHandle,
    ) -> Result<()> {
        let code =
            unsafe { (self.raw.process_operation)(connection.as_ptr(), operation.as_ptr()) };
        self.check(code, "AFCConnectionProcessOperation")
    }

    fn operation_result_status(&self, operation: OperationHandle) -> Status {
        Status::file_conduit(unsafe { (self.raw.operation_get_result_status)(operation.as_ptr()) })
    }

    fn operation_result_object(&self, operation: OperationHandle) -> Result<Option<Value>> {
        let object = unsafe { (self.raw.operation_get_result_object)(operation.as_ptr()) };
        // SAFETY: "Get" rule; the operation keeps the object alive.
        unsafe { cf::borrow_value(object) }
    }

    fn operation_release(&self, operation: OperationHandle) {
        // SAFETY: operations are created with a +1 reference owned by the guard.
        if let Err(e) = unsafe { cf::release(operation.as_ptr()) } {
            warn!(operation = %operation, error = %e, "Releasing operation failed");
        }
    }

    fn describe_status(&self, code: i32) -> String {
        let text = unsafe { (self.raw.error_string)(code) };
        if text.is_null() {
            return description_or_fallback(None);
        }
        // SAFETY: the library returns a static NUL-terminated string.
        let text = unsafe { CStr::from_ptr(text) }.to_string_lossy().into_owned();
        description_or_fallback(Some(text))
    }

    fn last_error_info(&self, connection: AfcConnectionHandle) -> Result<Option<Dictionary>> {
        let info = unsafe { (self.raw.connection_copy_last_error_info)(connection.as_ptr()) };
        // SAFETY: "Copy" rule; we own the returned dictionary.
        match unsafe { cf::take_value(info) }? {
            Some(Value::Dictionary(info)) => Ok(Some(info)),
            Some(_) => Err(BindingError::PropertyList(
                "last error info is not a dictionary".into(),
            )),
            None => Ok(None),
        }
    }
}
