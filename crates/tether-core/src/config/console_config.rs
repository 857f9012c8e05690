use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use super::defaults;
use crate::error::{ConsoleError, Result};
use crate::features::audio::SUPPORTED_BITRATES;

/// Console configuration
///
/// Loadable from a JSON file; missing fields fall back to defaults.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ConsoleConfig {
    /// How long request/response features wait before giving up
    pub request_timeout_secs: u64,

    /// Sample rate new audio capture sessions start with
    pub default_bitrate: u32,

    /// Root of the per-client download directories
    pub download_root: PathBuf,
}

impl Default for ConsoleConfig {
    fn default() -> Self {
        Self {
            request_timeout_secs: defaults::DEFAULT_REQUEST_TIMEOUT_SECS,
            default_bitrate: defaults::DEFAULT_AUDIO_BITRATE,
            download_root: dirs::data_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join(defaults::DEFAULT_DOWNLOAD_SUBDIR),
        }
    }
}

impl ConsoleConfig {
    /// Create a new configuration with defaults
    pub fn new() -> Self {
        Self::default()
    }

    /// Load and validate a JSON configuration file
    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&raw)?;
        config.validate()?;
        tracing::debug!("Loaded configuration from {}", path.display());
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.request_timeout_secs == 0 {
            return Err(ConsoleError::Config(
                "request_timeout_secs must be greater than zero".to_string(),
            ));
        }
        if !SUPPORTED_BITRATES.contains(&self.default_bitrate) {
            return Err(ConsoleError::Config(format!(
                "default_bitrate {} is not a supported sample rate",
                self.default_bitrate
            )));
        }
        Ok(())
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout_secs = timeout.as_secs().max(1);
        self
    }

    pub fn with_default_bitrate(mut self, bitrate: u32) -> Self {
        self.default_bitrate = bitrate;
        self
    }

    pub fn with_download_root(mut self, root: PathBuf) -> Self {
        self.download_root = root;
        self
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    /// Download directory for one client, named after its display name
    pub fn download_directory_for(&self, display_name: &str) -> PathBuf {
        let name: String = display_name
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                    c
                } else {
                    '_'
                }
            })
            .collect();

        let name = name.trim_matches('.');
        if name.is_empty() {
            self.download_root.join("unnamed")
        } else {
            self.download_root.join(name)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = ConsoleConfig::default();
        assert_eq!(config.request_timeout(), Duration::from_secs(30));
        assert_eq!(config.default_bitrate, 44_100);
        assert!(config.download_root.ends_with("tether/clients"));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_file_fills_missing_fields() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, r#"{{"request_timeout_secs": 5, "download_root": "/tmp/tether"}}"#).unwrap();

        let config = ConsoleConfig::from_file(file.path()).unwrap();
        assert_eq!(config.request_timeout_secs, 5);
        assert_eq!(config.default_bitrate, 44_100);
        assert_eq!(config.download_root, PathBuf::from("/tmp/tether"));
    }

    #[test]
    fn test_from_file_rejects_bad_bitrate() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, r#"{{"default_bitrate": 12345}}"#).unwrap();

        let err = ConsoleConfig::from_file(file.path()).unwrap_err();
        assert!(matches!(err, ConsoleError::Config(_)));
    }

    #[test]
    fn test_from_file_bad_json() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "not json").unwrap();

        let err = ConsoleConfig::from_file(file.path()).unwrap_err();
        assert!(matches!(err, ConsoleError::Serialization(_)));
    }

    #[test]
    fn test_download_directory_is_sanitised() {
        let config = ConsoleConfig::new().with_download_root(PathBuf::from("/data"));
        assert_eq!(
            config.download_directory_for("WORKSTATION-7"),
            PathBuf::from("/data/WORKSTATION-7")
        );
        assert_eq!(
            config.download_directory_for("../evil/name"),
            PathBuf::from("/data/_evil_name")
        );
        assert_eq!(config.download_directory_for(""), PathBuf::from("/data/unnamed"));
    }

    #[test]
    fn test_builders() {
        let config = ConsoleConfig::new()
            .with_request_timeout(Duration::from_millis(10))
            .with_default_bitrate(8000);
        assert_eq!(config.request_timeout_secs, 1);
        assert_eq!(config.default_bitrate, 8000);
    }
}
