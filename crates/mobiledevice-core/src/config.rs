//! Binding configuration.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::resolver::LibraryLocator;

/// Configuration for loading and initialising the native library.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BindingConfig {
    /// Explicit path to the native library. Unset searches the platform defaults.
    pub library_path: Option<PathBuf>,
    /// Run the library's initialiser right after the symbols are bound.
    pub initialize_on_load: bool,
    /// Verbosity handed to the native logger.
    pub native_log_level: Option<i32>,
    /// I/O timeout for file conduit connections, in seconds.
    pub afc_io_timeout_secs: u32,
}

impl Default for BindingConfig {
    fn default() -> Self {
        Self {
            library_path: None,
            initialize_on_load: true,
            native_log_level: None,
            afc_io_timeout_secs: 10,
        }
    }
}

impl BindingConfig {
    /// Load configuration from a TOML file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: BindingConfig = toml::from_str(&content)?;
        Ok(config)
    }

    /// Save configuration to a TOML file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn locator(&self) -> LibraryLocator {
        match &self.library_path {
            Some(path) => LibraryLocator::Path(path.clone()),
            None => LibraryLocator::SystemDefault,
        }
    }

    pub fn afc_io_timeout(&self) -> Duration {
        Duration::from_secs(u64::from(self.afc_io_timeout_secs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roundtrip_through_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("binding.toml");

        let config = BindingConfig {
            library_path: Some(PathBuf::from("/opt/lib/MobileDevice")),
            initialize_on_load: false,
            native_log_level: Some(7),
            afc_io_timeout_secs: 30,
        };
        config.save_to_file(&path).unwrap();

        let loaded = BindingConfig::load_from_file(&path).unwrap();
        assert_eq!(loaded, config);
        assert_eq!(loaded.afc_io_timeout(), Duration::from_secs(30));
    }

    #[test]
    fn test_missing_keys_use_defaults() {
        let config: BindingConfig = toml::from_str("native_log_level = 3").unwrap();
        assert_eq!(config.native_log_level, Some(3));
        assert!(config.initialize_on_load);
        assert_eq!(config.afc_io_timeout_secs, 10);
        assert_eq!(config.locator(), LibraryLocator::SystemDefault);
    }
}
