//! Manager configuration
//!
//! This module contains all configuration options for the download manager.

use crate::error::{ManagerError, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Main configuration for the download manager
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManagerConfig {
    /// Default directory for downloads whose request leaves it unset
    pub download_dir: PathBuf,

    /// Maximum simultaneous active transfers
    pub max_concurrent: usize,

    /// Chunk granularity for throttled writes, in bytes
    pub chunk_size: usize,

    /// Minimum interval between progress persists, in milliseconds
    pub progress_interval_ms: u64,

    /// Base delay for linear retry backoff, in seconds
    pub retry_delay_base_secs: u64,

    /// Global download speed limit in KB/s (0 = unlimited)
    pub limit_kbps: u64,

    /// Default user agent
    pub user_agent: String,

    /// Database path for queue persistence (None = in-memory store only)
    pub database_path: Option<PathBuf>,

    /// HTTP configuration
    pub http: HttpConfig,
}

/// HTTP-specific configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpConfig {
    /// Connection timeout in seconds
    pub connect_timeout: u64,

    /// Read timeout in seconds
    pub read_timeout: u64,

    /// Maximum redirects to follow
    pub max_redirects: usize,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            download_dir: dirs::download_dir().unwrap_or_else(|| PathBuf::from(".")),
            max_concurrent: 3,
            chunk_size: 8 * 1024,
            progress_interval_ms: 1000,
            retry_delay_base_secs: 30,
            limit_kbps: 0,
            user_agent: format!("fetchq/{}", env!("CARGO_PKG_VERSION")),
            database_path: None,
            http: HttpConfig::default(),
        }
    }
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            connect_timeout: 30,
            read_timeout: 30,
            max_redirects: 10,
        }
    }
}

impl ManagerConfig {
    /// Create a new config with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the default download directory
    pub fn download_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.download_dir = path.into();
        self
    }

    /// Set the maximum simultaneous active transfers
    pub fn max_concurrent(mut self, max: usize) -> Self {
        self.max_concurrent = max;
        self
    }

    /// Set the global download speed limit in KB/s (0 = unlimited)
    pub fn limit_kbps(mut self, kbps: u64) -> Self {
        self.limit_kbps = kbps;
        self
    }

    /// Set the base delay for linear retry backoff
    pub fn retry_delay_base_secs(mut self, secs: u64) -> Self {
        self.retry_delay_base_secs = secs;
        self
    }

    /// Set the user agent
    pub fn user_agent(mut self, ua: impl Into<String>) -> Self {
        self.user_agent = ua.into();
        self
    }

    /// Set the database path for queue persistence
    pub fn database_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.database_path = Some(path.into());
        self
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if !self.download_dir.exists() {
            return Err(ManagerError::invalid_input(
                "download_dir",
                format!("Directory does not exist: {:?}", self.download_dir),
            ));
        }

        if !self.download_dir.is_dir() {
            return Err(ManagerError::invalid_input(
                "download_dir",
                format!("Path is not a directory: {:?}", self.download_dir),
            ));
        }

        if self.max_concurrent == 0 {
            return Err(ManagerError::invalid_input(
                "max_concurrent",
                "Must be at least 1",
            ));
        }

        if self.chunk_size == 0 {
            return Err(ManagerError::invalid_input(
                "chunk_size",
                "Must be at least 1",
            ));
        }

        if self.progress_interval_ms == 0 {
            return Err(ManagerError::invalid_input(
                "progress_interval_ms",
                "Must be at least 1",
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_default_config() {
        let config = ManagerConfig::default();
        assert_eq!(config.max_concurrent, 3);
        assert_eq!(config.chunk_size, 8192);
        assert_eq!(config.retry_delay_base_secs, 30);
        assert_eq!(config.http.connect_timeout, 30);
        assert_eq!(config.http.read_timeout, 30);
    }

    #[test]
    fn test_config_builder() {
        let config = ManagerConfig::new()
            .max_concurrent(5)
            .limit_kbps(256)
            .retry_delay_base_secs(10);

        assert_eq!(config.max_concurrent, 5);
        assert_eq!(config.limit_kbps, 256);
        assert_eq!(config.retry_delay_base_secs, 10);
    }

    #[test]
    fn test_config_validation() {
        let dir = tempdir().unwrap();
        let config = ManagerConfig::new().download_dir(dir.path());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_invalid_download_dir() {
        let config = ManagerConfig::new().download_dir("/nonexistent/path/12345");
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_zero_concurrency_rejected() {
        let dir = tempdir().unwrap();
        let config = ManagerConfig::new().download_dir(dir.path()).max_concurrent(0);
        assert!(config.validate().is_err());
    }
}
