//! Owning guards for file-conduit handles.

use std::io::{self, SeekFrom};
use std::sync::Arc;
use std::time::Duration;

use plist::{Dictionary, Value};
use tracing::{debug, instrument, warn};

use super::{DirectoryEntry, FileConduitCalls, ReadMode};
use crate::device::ServiceConnection;
use crate::error::{Result, Status};
use crate::handle::{AfcConnectionHandle, DirectoryHandle, FileHandle, InUse, OperationHandle};

const CONNECTION: &str = "afc connection";
const READ_CHUNK: usize = 64 * 1024;

/// An open file-conduit connection. Closed on drop.
///
/// Every call that goes through the connection, including reads and writes
/// on its files and directories, claims it first. Two threads at once get
/// [`crate::BindingError::HandleBusy`] rather than being queued. Closing a
/// file or directory on drop waits for the claim instead.
pub struct AfcConnection {
    calls: Arc<dyn FileConduitCalls>,
    handle: AfcConnectionHandle,
    in_use: InUse,
    closed: bool,
}

impl AfcConnection {
    /// Open a conduit over a started service connection.
    pub fn open(
        calls: Arc<dyn FileConduitCalls>,
        service: &ServiceConnection,
        io_timeout: Duration,
    ) -> Result<Self> {
        let handle = calls.connection_open(service.handle(), io_timeout)?;
        Ok(Self::adopt(calls, handle))
    }

    /// Wrap a conduit over a raw service socket.
    pub fn create_from_socket(calls: Arc<dyn FileConduitCalls>, socket: i32) -> Result<Self> {
        let handle = calls.connection_create(socket)?;
        Ok(Self::adopt(calls, handle))
    }

    /// Take ownership of an already-open connection handle.
    pub fn adopt(calls: Arc<dyn FileConduitCalls>, handle: AfcConnectionHandle) -> Self {
        Self {
            calls,
            handle,
            in_use: InUse::default(),
            closed: false,
        }
    }

    pub fn handle(&self) -> AfcConnectionHandle {
        self.handle
    }

    pub fn open_file(&self, path: &str, mode: ReadMode) -> Result<AfcFile<'_>> {
        let _claim = self.in_use.claim(CONNECTION)?;
        let handle = self.calls.file_open(self.handle, path, mode)?;
        Ok(AfcFile {
            connection: self,
            handle,
            closed: false,
        })
    }

    /// Open with a raw mode value. Anything other than the supported modes
    /// fails before reaching the native layer.
    pub fn open_file_raw(&self, path: &str, mode: u64) -> Result<AfcFile<'_>> {
        let mode = ReadMode::try_from(mode)?;
        self.open_file(path, mode)
    }

    pub fn open_directory(&self, path: &str) -> Result<AfcDirectory<'_>> {
        let _claim = self.in_use.claim(CONNECTION)?;
        let handle = self.calls.directory_open(self.handle, path)?;
        Ok(AfcDirectory {
            connection: self,
            handle,
            finished: false,
            closed: false,
        })
    }

    /// Names in `path`, without `.` and `..`.
    pub fn list_directory(&self, path: &str) -> Result<Vec<String>> {
        self.open_directory(path)?
            .filter(|entry| !matches!(entry.as_deref(), Ok(".") | Ok("..")))
            .collect()
    }

    /// Read a whole remote file.
    #[instrument(level = "debug", skip(self))]
    pub fn read_file(&self, path: &str) -> Result<Vec<u8>> {
        let mut file = self.open_file(path, ReadMode::ReadOnly)?;
        let mut contents = Vec::new();
        let mut chunk = vec![0u8; READ_CHUNK];
        loop {
            match file.read(&mut chunk)? {
                ReadOutcome::Filled(n) | ReadOutcome::Short(n) => {
                    contents.extend_from_slice(&chunk[..n])
                }
                ReadOutcome::EndOfFile => break,
            }
        }
        file.close()?;
        debug!(len = contents.len(), "Remote file read");
        Ok(contents)
    }

    /// Create or replace a remote file with `data`.
    #[instrument(level = "debug", skip(self, data), fields(len = data.len()))]
    pub fn write_file(&self, path: &str, data: &[u8]) -> Result<()> {
        let mut file = self.open_file(path, ReadMode::CreateReadWrite)?;
        file.write(data)?;
        file.close()
    }

    pub fn create_directory(&self, path: &str) -> Result<()> {
        let _claim = self.in_use.claim(CONNECTION)?;
        self.calls.directory_create(self.handle, path)
    }

    pub fn rename(&self, from: &str, to: &str) -> Result<()> {
        let _claim = self.in_use.claim(CONNECTION)?;
        self.calls.rename_path(self.handle, from, to)
    }

    /// Remove a file or an empty directory.
    pub fn remove(&self, path: &str) -> Result<()> {
        let _claim = self.in_use.claim(CONNECTION)?;
        self.calls.remove_path(self.handle, path)
    }

    /// Remove `path` recursively as a single conduit operation.
    #[instrument(level = "debug", skip(self))]
    pub fn remove_path_and_contents(&self, path: &str) -> Result<OperationOutcome> {
        let mut operation = AfcOperation::remove_path_and_contents(self, path)?;
        operation.process()?;
        Ok(OperationOutcome {
            status: operation.status(),
            result: operation.result_object()?,
        })
    }

    /// Structured details of the most recent failure on this connection.
    pub fn last_error_info(&self) -> Result<Option<Dictionary>> {
        let _claim = self.in_use.claim(CONNECTION)?;
        self.calls.last_error_info(self.handle)
    }

    /// Close now and report the outcome.
    pub fn close(mut self) -> Result<()> {
        self.closed = true;
        self.calls.connection_close(self.handle)
    }
}

impl std::fmt::Debug for AfcConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("AfcConnection").field(&self.handle).finish()
    }
}

impl Drop for AfcConnection {
    fn drop(&mut self) {
        if self.closed {
            return;
        }
        if let Err(e) = self.calls.connection_close(self.handle) {
            warn!(connection = %self.handle, error = %e, "Failed to close file conduit");
        }
    }
}

/// Result of a single file read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadOutcome {
    /// The whole buffer was filled.
    Filled(usize),
    /// Fewer bytes than requested. Not an error; more may follow.
    Short(usize),
    EndOfFile,
}

impl ReadOutcome {
    pub fn len(&self) -> usize {
        match self {
            ReadOutcome::Filled(n) | ReadOutcome::Short(n) => *n,
            ReadOutcome::EndOfFile => 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// An open remote file. Closed on drop.
pub struct AfcFile<'c> {
    connection: &'c AfcConnection,
    handle: FileHandle,
    closed: bool,
}

impl AfcFile<'_> {
    pub fn handle(&self) -> FileHandle {
        self.handle
    }

    pub fn read(&mut self, buf: &mut [u8]) -> Result<ReadOutcome> {
        if buf.is_empty() {
            return Ok(ReadOutcome::Filled(0));
        }
        let conn = self.connection;
        let _claim = conn.in_use.claim(CONNECTION)?;
        let n = conn.calls.file_read(conn.handle, self.handle, buf)?;
        Ok(match n {
            0 => ReadOutcome::EndOfFile,
            n if n == buf.len() => ReadOutcome::Filled(n),
            n => ReadOutcome::Short(n),
        })
    }

    pub fn write(&mut self, data: &[u8]) -> Result<()> {
        let conn = self.connection;
        let _claim = conn.in_use.claim(CONNECTION)?;
        conn.calls.file_write(conn.handle, self.handle, data)
    }

    pub fn seek(&mut self, pos: SeekFrom) -> Result<()> {
        let conn = self.connection;
        let _claim = conn.in_use.claim(CONNECTION)?;
        conn.calls.file_seek(conn.handle, self.handle, pos)
    }

    pub fn tell(&mut self) -> Result<u64> {
        let conn = self.connection;
        let _claim = conn.in_use.claim(CONNECTION)?;
        conn.calls.file_tell(conn.handle, self.handle)
    }

    pub fn close(mut self) -> Result<()> {
        let conn = self.connection;
        let _claim = conn.in_use.claim(CONNECTION)?;
        self.closed = true;
        conn.calls.file_close(conn.handle, self.handle)
    }
}

impl io::Read for AfcFile<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        Ok(AfcFile::read(self, buf)?.len())
    }
}

impl io::Write for AfcFile<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        AfcFile::write(self, buf)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl io::Seek for AfcFile<'_> {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        AfcFile::seek(self, pos)?;
        Ok(self.tell()?)
    }
}

impl std::fmt::Debug for AfcFile<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("AfcFile").field(&self.handle).finish()
    }
}

impl Drop for AfcFile<'_> {
    fn drop(&mut self) {
        if self.closed {
            return;
        }
        let conn = self.connection;
        let _claim = conn.in_use.claim_for_teardown();
        if let Err(e) = conn.calls.file_close(conn.handle, self.handle) {
            warn!(file = %self.handle, error = %e, "Failed to close remote file");
        }
    }
}

/// An open remote directory. Iterates entry names and stops for good at the
/// end or at the first error.
pub struct AfcDirectory<'c> {
    connection: &'c AfcConnection,
    handle: DirectoryHandle,
    finished: bool,
    closed: bool,
}

impl AfcDirectory<'_> {
    pub fn handle(&self) -> DirectoryHandle {
        self.handle
    }

    pub fn next_entry(&mut self) -> Result<DirectoryEntry> {
        if self.finished {
            return Ok(DirectoryEntry::End);
        }
        let conn = self.connection;
        let _claim = conn.in_use.claim(CONNECTION)?;
        let entry = conn.calls.directory_read(conn.handle, self.handle);
        if !matches!(entry, Ok(DirectoryEntry::Name(_))) {
            self.finished = true;
        }
        entry
    }

    pub fn close(mut self) -> Result<()> {
        let conn = self.connection;
        let _claim = conn.in_use.claim(CONNECTION)?;
        self.closed = true;
        conn.calls.directory_close(conn.handle, self.handle)
    }
}

impl Iterator for AfcDirectory<'_> {
    type Item = Result<String>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }
        match self.next_entry() {
            Ok(DirectoryEntry::Name(name)) => Some(Ok(name)),
            Ok(DirectoryEntry::End) => None,
            Err(e) => Some(Err(e)),
        }
    }
}

impl std::iter::FusedIterator for AfcDirectory<'_> {}

impl Drop for AfcDirectory<'_> {
    fn drop(&mut self) {
        if self.closed {
            return;
        }
        let conn = self.connection;
        let _claim = conn.in_use.claim_for_teardown();
        if let Err(e) = conn.calls.directory_close(conn.handle, self.handle) {
            warn!(directory = %self.handle, error = %e, "Failed to close remote directory");
        }
    }
}

/// Status and result object of a processed operation.
#[derive(Debug, Clone, PartialEq)]
pub struct OperationOutcome {
    pub status: Status,
    pub result: Option<Value>,
}

/// A queued conduit operation. Released on drop.
pub struct AfcOperation<'c> {
    connection: &'c AfcConnection,
    handle: OperationHandle,
}

impl<'c> AfcOperation<'c> {
    pub fn remove_path_and_contents(connection: &'c AfcConnection, path: &str) -> Result<Self> {
        let handle = connection.calls.operation_remove_path_and_contents(path)?;
        Ok(Self { connection, handle })
    }

    pub fn handle(&self) -> OperationHandle {
        self.handle
    }

    pub fn process(&mut self) -> Result<()> {
        let conn = self.connection;
        let _claim = conn.in_use.claim(CONNECTION)?;
        conn.calls.process_operation(conn.handle, self.handle)
    }

    pub fn status(&self) -> Status {
        self.connection.calls.operation_result_status(self.handle)
    }

    pub fn result_object(&self) -> Result<Option<Value>> {
        self.connection.calls.operation_result_object(self.handle)
    }
}

impl Drop for AfcOperation<'_> {
    fn drop(&mut self) {
        self.connection.calls.operation_release(self.handle);
    }
}
