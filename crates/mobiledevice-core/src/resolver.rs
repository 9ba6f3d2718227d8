//! Native library loading and symbol resolution.
//!
//! The library is loaded at most once per process. Resolution is
//! all-or-nothing: either both call tables are fully bound, or the caller gets
//! the complete list of symbols that could not be found.

use std::ffi::c_void;
use std::fmt;
use std::path::{Path, PathBuf};
use std::ptr::NonNull;
use std::sync::{Arc, Mutex};

use libloading::Library;
use tracing::{debug, info, instrument, warn};

use crate::afc::{FileConduitCalls, NativeFileConduit};
use crate::config::BindingConfig;
use crate::device::{DeviceCalls, NativeDeviceCalls};
use crate::error::ResolutionError;
use crate::ffi::{RawAfcCalls, RawDeviceCalls};
use crate::sync::IgnorePoison;

#[cfg(target_os = "macos")]
const DEFAULT_CANDIDATES: &[&str] =
    &["/System/Library/PrivateFrameworks/MobileDevice.framework/Versions/A/MobileDevice"];

#[cfg(target_os = "windows")]
const DEFAULT_CANDIDATES: &[&str] = &[
    r"C:\Program Files\Common Files\Apple\Mobile Device Support\MobileDevice.dll",
    r"C:\Program Files (x86)\Common Files\Apple\Mobile Device Support\MobileDevice.dll",
];

#[cfg(not(any(target_os = "macos", target_os = "windows")))]
const DEFAULT_CANDIDATES: &[&str] = &[];

/// Where to find the native library.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LibraryLocator {
    /// Load exactly this file.
    Path(PathBuf),
    /// Try the platform's well-known install locations in order.
    SystemDefault,
}

impl LibraryLocator {
    pub fn candidates(&self) -> Vec<PathBuf> {
        match self {
            LibraryLocator::Path(path) => vec![path.clone()],
            LibraryLocator::SystemDefault => DEFAULT_CANDIDATES.iter().map(PathBuf::from).collect(),
        }
    }
}

/// Anything that can map a symbol name to an address.
pub trait SymbolSource {
    fn lookup(&self, symbol: &str) -> Option<NonNull<c_void>>;
}

/// A native library mapped into the process.
pub struct LoadedLibrary {
    path: PathBuf,
    library: Library,
}

impl LoadedLibrary {
    #[instrument(level = "info")]
    pub fn open(locator: &LibraryLocator) -> Result<Self, ResolutionError> {
        let skip_absent = *locator == LibraryLocator::SystemDefault;
        Self::open_first(&locator.candidates(), skip_absent)
    }

    /// Load the first candidate that opens. Every failed attempt is reported.
    fn open_first(candidates: &[PathBuf], skip_absent: bool) -> Result<Self, ResolutionError> {
        let mut failures = Vec::new();
        for candidate in candidates {
            if skip_absent && !candidate.exists() {
                debug!(path = %candidate.display(), "Candidate not present");
                continue;
            }
            // SAFETY: loading runs the library's initialisers. The native
            // library is a system component trusted by the host.
            match unsafe { Library::new(candidate) } {
                Ok(library) => {
                    info!(path = %candidate.display(), "Loaded native library");
                    return Ok(Self {
                        path: candidate.clone(),
                        library,
                    });
                }
                Err(e) => {
                    warn!(path = %candidate.display(), error = %e, "Candidate failed to load");
                    failures.push((candidate.clone(), e.to_string()));
                }
            }
        }
        if failures.is_empty() {
            Err(ResolutionError::LibraryNotFound {
                searched: candidates.to_vec(),
            })
        } else {
            Err(ResolutionError::LoadFailed { failures })
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl SymbolSource for LoadedLibrary {
    fn lookup(&self, symbol: &str) -> Option<NonNull<c_void>> {
        // SAFETY: the symbol is read as an address only; it is reinterpreted
        // as a function pointer by the call table that declared its type.
        let address = unsafe { self.library.get::<*mut c_void>(symbol.as_bytes()) }.ok()?;
        NonNull::new(*address)
    }
}

impl fmt::Debug for LoadedLibrary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoadedLibrary")
            .field("path", &self.path)
            .finish()
    }
}

/// The two call tables, immutable once built.
pub struct CallTables {
    device: Arc<dyn DeviceCalls>,
    afc: Arc<dyn FileConduitCalls>,
    library: Option<LoadedLibrary>,
}

impl CallTables {
    /// Bind both tables from `source`.
    ///
    /// # Safety
    ///
    /// Every address `source` returns must be a function with the signature
    /// declared for that symbol in [`crate::ffi`].
    pub unsafe fn from_source(source: &dyn SymbolSource) -> Result<Self, ResolutionError> {
        // SAFETY: forwarded to the caller.
        let device = unsafe { RawDeviceCalls::bind(source) };
        let afc = unsafe { RawAfcCalls::bind(source) };
        match (device, afc) {
            (Ok(device), Ok(afc)) => Ok(Self {
                device: Arc::new(NativeDeviceCalls::new(device)),
                afc: Arc::new(NativeFileConduit::new(afc)),
                library: None,
            }),
            (device, afc) => {
                let mut missing = device.err().unwrap_or_default();
                missing.extend(afc.err().unwrap_or_default());
                warn!(count = missing.len(), "Unresolved native symbols");
                Err(ResolutionError::MissingSymbols { missing })
            }
        }
    }

    /// Tables backed by something other than the native library, e.g. the fakes in [`crate::mock`].
    pub fn from_parts(device: Arc<dyn DeviceCalls>, afc: Arc<dyn FileConduitCalls>) -> Self {
        Self {
            device,
            afc,
            library: None,
        }
    }

    pub fn device(&self) -> &Arc<dyn DeviceCalls> {
        &self.device
    }

    pub fn afc(&self) -> &Arc<dyn FileConduitCalls> {
        &self.afc
    }

    /// Path of the library the tables were bound from, if any.
    pub fn library_path(&self) -> Option<&Path> {
        self.library.as_ref().map(LoadedLibrary::path)
    }
}

impl fmt::Debug for CallTables {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallTables")
            .field("library", &self.library)
            .finish_non_exhaustive()
    }
}

static PROCESS_TABLES: Mutex<Option<&'static CallTables>> = Mutex::new(None);

/// Load the native library and bind both call tables, once per process.
///
/// Later calls return the same tables. A locator that differs from the one
/// used first is ignored.
pub fn resolve(locator: &LibraryLocator) -> Result<&'static CallTables, ResolutionError> {
    resolve_inner(locator, |_| {})
}

/// Like [`resolve`], then apply the initialisation options from `config` on first load.
pub fn resolve_with_config(config: &BindingConfig) -> Result<&'static CallTables, ResolutionError> {
    resolve_inner(&config.locator(), |tables| {
        if config.initialize_on_load {
            tables.device.initialize();
        }
        if let Some(level) = config.native_log_level {
            tables.device.set_log_level(level);
        }
    })
}

fn resolve_inner(
    locator: &LibraryLocator,
    on_first_load: impl FnOnce(&CallTables),
) -> Result<&'static CallTables, ResolutionError> {
    let mut slot = PROCESS_TABLES.lock_ignore_poison();
    if let Some(tables) = *slot {
        if let LibraryLocator::Path(requested) = locator
            && tables.library_path() != Some(requested.as_path())
        {
            warn!(
                requested = %requested.display(),
                "Native library already loaded from another path; reusing it"
            );
        }
        return Ok(tables);
    }

    let library = LoadedLibrary::open(locator)?;
    // SAFETY: the symbols come from the native library whose ABI `ffi` mirrors.
    let mut tables = unsafe { CallTables::from_source(&library) }?;
    info!(
        path = %library.path().display(),
        device_symbols = RawDeviceCalls::SYMBOLS.len(),
        afc_symbols = RawAfcCalls::SYMBOLS.len(),
        "Call tables resolved"
    );
    tables.library = Some(library);

    let tables: &'static CallTables = Box::leak(Box::new(tables));
    on_first_load(tables);
    *slot = Some(tables);
    Ok(tables)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_explicit_path_is_sole_candidate() {
        let locator = LibraryLocator::Path(PathBuf::from("/tmp/libfake.dylib"));
        assert_eq!(locator.candidates(), vec![PathBuf::from("/tmp/libfake.dylib")]);
    }

    #[test]
    fn test_missing_explicit_library_fails_to_load() {
        let locator = LibraryLocator::Path(PathBuf::from("/nonexistent/MobileDevice"));
        let err = LoadedLibrary::open(&locator).unwrap_err();
        assert!(matches!(err, ResolutionError::LoadFailed { .. }));
    }

    #[test]
    fn test_every_failing_candidate_is_tried_and_reported() {
        let dir = tempfile::tempdir().unwrap();
        let first = dir.path().join("MobileDevice-a");
        let second = dir.path().join("MobileDevice-b");
        std::fs::write(&first, b"not a library").unwrap();
        std::fs::write(&second, b"not a library either").unwrap();
        let absent = dir.path().join("absent");

        let candidates = vec![absent, first.clone(), second.clone()];
        let err = LoadedLibrary::open_first(&candidates, true).unwrap_err();
        let ResolutionError::LoadFailed { failures } = &err else {
            panic!("expected load failures, got {err}");
        };
        let tried: Vec<_> = failures.iter().map(|(path, _)| path.clone()).collect();
        assert_eq!(tried, vec![first.clone(), second.clone()]);
        let message = err.to_string();
        assert!(message.contains(&first.display().to_string()));
        assert!(message.contains(&second.display().to_string()));
    }

    #[cfg(not(any(target_os = "macos", target_os = "windows")))]
    #[test]
    fn test_no_system_default_on_this_platform() {
        let err = LoadedLibrary::open(&LibraryLocator::SystemDefault).unwrap_err();
        assert!(matches!(err, ResolutionError::LibraryNotFound { ref searched } if searched.is_empty()));
    }
}
