//! Status translation and error types.
//!
//! Native calls report failure as a plain integer. The device library uses the
//! `0xE80000xx` family, the file conduit uses small positive integers. Both are
//! translated into a [`Status`] before anything leaves this crate.

use std::fmt;
use std::path::PathBuf;

use thiserror::Error;

/// Text used when the native error lookup has nothing to say about a code.
pub const UNKNOWN_ERROR_TEXT: &str = "unknown native error";

/// Raw status codes the binding layer reacts to.
pub mod codes {
    pub const SUCCESS: i32 = 0;

    // Device library (0xE80000xx).
    pub const AMD_BAD_HEADER: i32 = 0xE800_0002_u32 as i32;
    pub const AMD_UNKNOWN_PACKET: i32 = 0xE800_0006_u32 as i32;
    pub const AMD_INVALID_ARGUMENT: i32 = 0xE800_0007_u32 as i32;
    pub const AMD_NOT_FOUND: i32 = 0xE800_0008_u32 as i32;
    pub const AMD_PERMISSION: i32 = 0xE800_000A_u32 as i32;
    pub const AMD_NOT_CONNECTED: i32 = 0xE800_000B_u32 as i32;
    pub const AMD_TIMEOUT: i32 = 0xE800_000C_u32 as i32;
    pub const AMD_FILE_EXISTS: i32 = 0xE800_0010_u32 as i32;
    pub const AMD_INVALID_RESPONSE: i32 = 0xE800_0013_u32 as i32;
    pub const AMD_SESSION_ACTIVE: i32 = 0xE800_001D_u32 as i32;
    pub const AMD_SESSION_INACTIVE: i32 = 0xE800_001E_u32 as i32;

    // File conduit.
    pub const AFC_UNKNOWN: i32 = 1;
    pub const AFC_HEADER_INVALID: i32 = 2;
    pub const AFC_READ: i32 = 4;
    pub const AFC_UNKNOWN_PACKET: i32 = 6;
    pub const AFC_INVALID_ARGUMENT: i32 = 7;
    pub const AFC_NOT_FOUND: i32 = 8;
    pub const AFC_IS_DIRECTORY: i32 = 9;
    pub const AFC_PERMISSION: i32 = 10;
    pub const AFC_NOT_CONNECTED: i32 = 11;
    pub const AFC_TIMEOUT: i32 = 12;
    pub const AFC_TOO_MUCH_DATA: i32 = 13;
    pub const AFC_END_OF_DATA: i32 = 14;
    pub const AFC_EXISTS: i32 = 16;
    pub const AFC_IO: i32 = 20;
}

/// Which native component produced a status code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StatusDomain {
    Device,
    FileConduit,
}

impl fmt::Display for StatusDomain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StatusDomain::Device => write!(f, "device"),
            StatusDomain::FileConduit => write!(f, "afc"),
        }
    }
}

/// Structured classification of a native status code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StatusKind {
    Success,
    Timeout,
    NotFound,
    PermissionDenied,
    AlreadyExists,
    InvalidArgument,
    ProtocolError,
    Unknown(i32),
}

impl fmt::Display for StatusKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StatusKind::Success => write!(f, "success"),
            StatusKind::Timeout => write!(f, "timeout"),
            StatusKind::NotFound => write!(f, "not found"),
            StatusKind::PermissionDenied => write!(f, "permission denied"),
            StatusKind::AlreadyExists => write!(f, "already exists"),
            StatusKind::InvalidArgument => write!(f, "invalid argument"),
            StatusKind::ProtocolError => write!(f, "protocol error"),
            StatusKind::Unknown(code) => write!(f, "unknown status 0x{:08X}", *code as u32),
        }
    }
}

/// A translated native status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Status {
    code: i32,
    domain: StatusDomain,
    kind: StatusKind,
}

impl Status {
    /// Translate a status returned by the device library.
    pub fn device(code: i32) -> Self {
        let kind = match code {
            codes::SUCCESS => StatusKind::Success,
            codes::AMD_TIMEOUT => StatusKind::Timeout,
            codes::AMD_NOT_FOUND => StatusKind::NotFound,
            codes::AMD_PERMISSION => StatusKind::PermissionDenied,
            codes::AMD_FILE_EXISTS => StatusKind::AlreadyExists,
            codes::AMD_INVALID_ARGUMENT => StatusKind::InvalidArgument,
            codes::AMD_BAD_HEADER | codes::AMD_UNKNOWN_PACKET | codes::AMD_INVALID_RESPONSE => {
                StatusKind::ProtocolError
            }
            other => StatusKind::Unknown(other),
        };
        Self {
            code,
            domain: StatusDomain::Device,
            kind,
        }
    }

    /// Translate a status returned by the file conduit.
    pub fn file_conduit(code: i32) -> Self {
        let kind = match code {
            codes::SUCCESS => StatusKind::Success,
            codes::AFC_TIMEOUT => StatusKind::Timeout,
            codes::AFC_NOT_FOUND => StatusKind::NotFound,
            codes::AFC_PERMISSION => StatusKind::PermissionDenied,
            codes::AFC_EXISTS => StatusKind::AlreadyExists,
            codes::AFC_INVALID_ARGUMENT => StatusKind::InvalidArgument,
            codes::AFC_HEADER_INVALID | codes::AFC_UNKNOWN_PACKET | codes::AFC_TOO_MUCH_DATA => {
                StatusKind::ProtocolError
            }
            other => StatusKind::Unknown(other),
        };
        Self {
            code,
            domain: StatusDomain::FileConduit,
            kind,
        }
    }

    pub fn is_success(&self) -> bool {
        self.kind == StatusKind::Success
    }

    pub fn kind(&self) -> StatusKind {
        self.kind
    }

    pub fn domain(&self) -> StatusDomain {
        self.domain
    }

    /// The native code, for diagnostics only.
    pub fn code(&self) -> i32 {
        self.code
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} (0x{:08X})",
            self.domain, self.kind, self.code as u32
        )
    }
}

/// Failure to produce the call tables.
#[derive(Error, Debug)]
pub enum ResolutionError {
    #[error("native library not found; searched: {}", display_paths(.searched))]
    LibraryNotFound { searched: Vec<PathBuf> },

    #[error("failed to load native library: {}", display_failures(.failures))]
    LoadFailed { failures: Vec<(PathBuf, String)> },

    #[error("{} unresolved symbol(s): {}", .missing.len(), .missing.join(", "))]
    MissingSymbols { missing: Vec<&'static str> },
}

fn display_failures(failures: &[(PathBuf, String)]) -> String {
    failures
        .iter()
        .map(|(path, message)| format!("{}: {message}", path.display()))
        .collect::<Vec<_>>()
        .join("; ")
}

fn display_paths(paths: &[PathBuf]) -> String {
    paths
        .iter()
        .map(|p| p.display().to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

/// Errors surfaced by the call tables and the guards built on them.
#[derive(Error, Debug)]
pub enum BindingError {
    #[error("{operation} failed: {description} [{status}]")]
    Native {
        operation: &'static str,
        status: Status,
        description: String,
    },

    #[error("unsupported file open mode 0x{mode:X}")]
    UnsupportedReadMode { mode: u64 },

    #[error("{kind} handle is already in use")]
    HandleBusy { kind: &'static str },

    #[error("device is not connected")]
    NotConnected,

    #[error("device is not paired")]
    NotPaired,

    #[error("native layer returned nothing for {0}")]
    NullResult(&'static str),

    #[error("subscription {0} is not active")]
    NotSubscribed(u64),

    #[error("subscription {id} failed: {source}")]
    SubscribeFailed {
        id: u64,
        #[source]
        source: Box<BindingError>,
    },

    #[error("argument contains an interior NUL byte")]
    InteriorNul(#[from] std::ffi::NulError),

    #[error("{0} is not supported on this platform")]
    Unsupported(&'static str),

    #[error("property list conversion failed: {0}")]
    PropertyList(String),

    #[error(transparent)]
    Resolution(#[from] ResolutionError),
}

impl BindingError {
    /// The translated status, for errors that came from a native call.
    pub fn status(&self) -> Option<Status> {
        match self {
            BindingError::Native { status, .. } => Some(*status),
            BindingError::SubscribeFailed { source, .. } => source.status(),
            _ => None,
        }
    }

    pub fn kind(&self) -> Option<StatusKind> {
        self.status().map(|s| s.kind())
    }
}

impl From<BindingError> for std::io::Error {
    fn from(err: BindingError) -> Self {
        use std::io::ErrorKind;
        let kind = match err.kind() {
            Some(StatusKind::NotFound) => ErrorKind::NotFound,
            Some(StatusKind::PermissionDenied) => ErrorKind::PermissionDenied,
            Some(StatusKind::AlreadyExists) => ErrorKind::AlreadyExists,
            Some(StatusKind::Timeout) => ErrorKind::TimedOut,
            Some(StatusKind::InvalidArgument) => ErrorKind::InvalidInput,
            _ => match err {
                BindingError::UnsupportedReadMode { .. } => ErrorKind::InvalidInput,
                BindingError::HandleBusy { .. } => ErrorKind::WouldBlock,
                _ => ErrorKind::Other,
            },
        };
        std::io::Error::new(kind, err)
    }
}

pub type Result<T, E = BindingError> = std::result::Result<T, E>;

/// Turn a native status into `Ok(())` or a [`BindingError::Native`].
///
/// `describe` is only consulted on failure.
pub(crate) fn check(
    status: Status,
    operation: &'static str,
    describe: impl FnOnce(i32) -> String,
) -> Result<()> {
    if status.is_success() {
        return Ok(());
    }
    let description = describe(status.code());
    tracing::debug!(operation, status = %status, %description, "Native call failed");
    Err(BindingError::Native {
        operation,
        status,
        description,
    })
}

/// Pick the native description, or the fixed fallback when it is empty.
pub(crate) fn description_or_fallback(text: Option<String>) -> String {
    match text {
        Some(t) if !t.trim().is_empty() => t,
        _ => UNKNOWN_ERROR_TEXT.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_codes() {
        assert!(Status::device(0).is_success());
        assert_eq!(Status::device(codes::AMD_TIMEOUT).kind(), StatusKind::Timeout);
        assert_eq!(Status::device(codes::AMD_NOT_FOUND).kind(), StatusKind::NotFound);
        assert_eq!(
            Status::device(codes::AMD_PERMISSION).kind(),
            StatusKind::PermissionDenied
        );
        assert_eq!(
            Status::device(codes::AMD_INVALID_RESPONSE).kind(),
            StatusKind::ProtocolError
        );
        assert_eq!(
            Status::device(codes::AMD_SESSION_INACTIVE).kind(),
            StatusKind::Unknown(codes::AMD_SESSION_INACTIVE)
        );
    }

    #[test]
    fn test_afc_codes() {
        assert!(Status::file_conduit(0).is_success());
        assert_eq!(Status::file_conduit(8).kind(), StatusKind::NotFound);
        assert_eq!(Status::file_conduit(16).kind(), StatusKind::AlreadyExists);
        assert_eq!(Status::file_conduit(7).kind(), StatusKind::InvalidArgument);
        assert_eq!(Status::file_conduit(99).kind(), StatusKind::Unknown(99));
    }

    #[test]
    fn test_same_code_differs_by_domain() {
        // 7 is "invalid argument" for AFC but meaningless for the device library.
        assert_eq!(Status::file_conduit(7).kind(), StatusKind::InvalidArgument);
        assert_eq!(Status::device(7).kind(), StatusKind::Unknown(7));
    }

    #[test]
    fn test_check_carries_description() {
        let err = check(Status::file_conduit(8), "AFCFileRefOpen", |_| "Object not found".into())
            .unwrap_err();
        assert_eq!(err.kind(), Some(StatusKind::NotFound));
        let text = err.to_string();
        assert!(text.contains("AFCFileRefOpen"));
        assert!(text.contains("Object not found"));

        assert!(check(Status::file_conduit(0), "AFCFileRefOpen", |_| unreachable!()).is_ok());
    }

    #[test]
    fn test_description_fallback() {
        assert_eq!(description_or_fallback(None), UNKNOWN_ERROR_TEXT);
        assert_eq!(description_or_fallback(Some("  ".into())), UNKNOWN_ERROR_TEXT);
        assert_eq!(description_or_fallback(Some("Busy".into())), "Busy");
    }

    #[test]
    fn test_missing_symbols_lists_every_name() {
        let err = ResolutionError::MissingSymbols {
            missing: vec!["AMDeviceConnect", "AFCFileRefRead"],
        };
        let text = err.to_string();
        assert!(text.starts_with("2 unresolved"));
        assert!(text.contains("AMDeviceConnect"));
        assert!(text.contains("AFCFileRefRead"));
    }
}
