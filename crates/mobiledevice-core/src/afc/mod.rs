//! File-conduit call table.
//!
//! [`FileConduitCalls`] mirrors the native AFC entry points one to one.
//! The guards in [`connection`] own the handles: [`AfcConnection`],
//! [`AfcFile`], [`AfcDirectory`] and [`AfcOperation`] each release theirs on
//! drop, on every path.

mod connection;
mod native;

use std::io::SeekFrom;
use std::time::Duration;

use plist::{Dictionary, Value};

use crate::error::{BindingError, Result, Status};
use crate::handle::{
    AfcConnectionHandle, DirectoryHandle, FileHandle, OperationHandle, ServiceConnectionHandle,
};

pub use connection::{
    AfcConnection, AfcDirectory, AfcFile, AfcOperation, OperationOutcome, ReadOutcome,
};
pub use native::NativeFileConduit;

/// Mode for opening a remote file. Only these two are supported.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u64)]
pub enum ReadMode {
    ReadOnly = 1,
    CreateReadWrite = 3,
}

impl ReadMode {
    pub fn as_raw(self) -> u64 {
        self as u64
    }
}

impl TryFrom<u64> for ReadMode {
    type Error = BindingError;

    fn try_from(mode: u64) -> Result<Self> {
        match mode {
            1 => Ok(ReadMode::ReadOnly),
            3 => Ok(ReadMode::CreateReadWrite),
            mode => Err(BindingError::UnsupportedReadMode { mode }),
        }
    }
}

/// One step of a directory listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DirectoryEntry {
    Name(String),
    End,
}

/// Typed file-conduit call table.
///
/// Paths are remote, `/`-separated and relative to the conduit's root.
pub trait FileConduitCalls: Send + Sync {
    // Connections.
    fn connection_create(&self, socket: i32) -> Result<AfcConnectionHandle>;
    fn connection_open(
        &self,
        service: ServiceConnectionHandle,
        io_timeout: Duration,
    ) -> Result<AfcConnectionHandle>;
    fn connection_close(&self, connection: AfcConnectionHandle) -> Result<()>;
    fn set_secure_context(&self, service: ServiceConnectionHandle) -> Result<()>;

    // Directories.
    fn directory_open(&self, connection: AfcConnectionHandle, path: &str)
    -> Result<DirectoryHandle>;
    fn directory_read(
        &self,
        connection: AfcConnectionHandle,
        directory: DirectoryHandle,
    ) -> Result<DirectoryEntry>;
    fn directory_close(
        &self,
        connection: AfcConnectionHandle,
        directory: DirectoryHandle,
    ) -> Result<()>;
    fn directory_create(&self, connection: AfcConnectionHandle, path: &str) -> Result<()>;

    // Files.
    fn file_open(
        &self,
        connection: AfcConnectionHandle,
        path: &str,
        mode: ReadMode,
    ) -> Result<FileHandle>;
    fn file_close(&self, connection: AfcConnectionHandle, file: FileHandle) -> Result<()>;
    fn file_seek(&self, connection: AfcConnectionHandle, file: FileHandle, pos: SeekFrom)
    -> Result<()>;
    fn file_tell(&self, connection: AfcConnectionHandle, file: FileHandle) -> Result<u64>;
    /// Bytes actually read. Fewer than `buf.len()` is not an error; zero means end of file.
    fn file_read(
        &self,
        connection: AfcConnectionHandle,
        file: FileHandle,
        buf: &mut [u8],
    ) -> Result<usize>;
    fn file_write(&self, connection: AfcConnectionHandle, file: FileHandle, data: &[u8])
    -> Result<()>;

    // Paths.
    fn rename_path(&self, connection: AfcConnectionHandle, from: &str, to: &str) -> Result<()>;
    fn remove_path(&self, connection: AfcConnectionHandle, path: &str) -> Result<()>;

    // Operations.
    fn operation_remove_path_and_contents(&self, path: &str) -> Result<OperationHandle>;
    fn process_operation(
        &self,
        connection: AfcConnectionHandle,
        operation: OperationHandle,
    ) -> Result<()>;
    fn operation_result_status(&self, operation: OperationHandle) -> Status;
    fn operation_result_object(&self, operation: OperationHandle) -> Result<Option<Value>>;
    fn operation_release(&self, operation: OperationHandle);

    // Diagnostics.
    fn describe_status(&self, code: i32) -> String;
    fn last_error_info(&self, connection: AfcConnectionHandle) -> Result<Option<Dictionary>>;
}
