//! Server configuration, validation and TOML loading.
//!
//! The broker consumes a [`ServerConfig`] from its caller. All paths and
//! numeric parameters are validated against platform limits before any
//! resource is created, so an oversized socket path is a configuration
//! error rather than a failed `bind(2)`.
//!
//! # Usage
//!
//! ```rust,no_run
//! use ivshmem_common::config::{ConfigLoader, ConfigError, ServerConfig};
//! use std::path::Path;
//!
//! fn main() -> Result<(), ConfigError> {
//!     let config = ServerConfig::load(Path::new("/etc/ivshmem/server.toml"))?;
//!     config.validate()?;
//!     println!("listening on {}", config.socket_path.display());
//!     Ok(())
//! }
//! ```

use crate::consts::{
    DEFAULT_N_VECTORS, DEFAULT_SHM_PATH, DEFAULT_SHM_SIZE, DEFAULT_SOCKET_PATH,
    MAX_REGION_SIZE, MAX_VECTORS, SHM_PATH_MAX, SOCKET_PATH_MAX,
};
use serde::{Deserialize, Deserializer};
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Error type for configuration loading and validation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    /// Configuration file not found at specified path.
    #[error("Configuration file not found")]
    FileNotFound,

    /// TOML parsing failed.
    #[error("Failed to parse configuration: {0}")]
    ParseError(String),

    /// A path parameter is empty.
    #[error("{field} cannot be empty")]
    EmptyPath {
        /// Name of the offending field.
        field: &'static str,
    },

    /// A path parameter contains an interior NUL byte.
    #[error("{field} contains a NUL byte")]
    NulInPath {
        /// Name of the offending field.
        field: &'static str,
    },

    /// Socket path does not fit into `sockaddr_un.sun_path`.
    #[error("socket path is {len} bytes long (max {max})")]
    SocketPathTooLong {
        /// Actual length in bytes.
        len: usize,
        /// Maximum accepted length.
        max: usize,
    },

    /// Backing-store path exceeds `PATH_MAX`.
    #[error("shm path is {len} bytes long (max {max})")]
    ShmPathTooLong {
        /// Actual length in bytes.
        len: usize,
        /// Maximum accepted length.
        max: usize,
    },

    /// Vector count outside the supported range.
    #[error("invalid number of vectors: {count} (max {max})")]
    InvalidVectorCount {
        /// Requested count.
        count: u32,
        /// Maximum accepted count.
        max: u32,
    },

    /// Region size outside `1..=MAX_REGION_SIZE`.
    #[error("invalid shm size: {size} bytes (must be 1 byte to 1 GiB)")]
    InvalidSize {
        /// Requested size in bytes.
        size: u64,
    },

    /// A human-readable size string could not be parsed.
    #[error("invalid size string: {0:?}")]
    InvalidSizeString(String),
}

/// Runtime parameters of one broker instance.
///
/// # TOML Example
///
/// ```toml
/// socket_path = "/run/ivshmem/socket"
/// shm_path = "/dev/hugepages/ivshmem"
/// shm_size = "2M"
/// n_vectors = 4
/// verbose = true
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServerConfig {
    /// Path of the listening Unix socket.
    pub socket_path: PathBuf,

    /// POSIX shared memory name or backing file path.
    pub shm_path: PathBuf,

    /// Requested region size in bytes (rounded up to a power of two).
    #[serde(deserialize_with = "deserialize_size")]
    pub shm_size: u64,

    /// Number of interrupt vectors handed out per peer.
    pub n_vectors: u32,

    /// Emit protocol chatter through the log sink.
    pub verbose: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            socket_path: PathBuf::from(DEFAULT_SOCKET_PATH),
            shm_path: PathBuf::from(DEFAULT_SHM_PATH),
            shm_size: DEFAULT_SHM_SIZE,
            n_vectors: DEFAULT_N_VECTORS,
            verbose: false,
        }
    }
}

impl ServerConfig {
    /// Validate the configuration against platform limits.
    ///
    /// # Errors
    ///
    /// - `EmptyPath` / `NulInPath` for unusable paths
    /// - `SocketPathTooLong` if the socket path does not fit `sun_path`
    /// - `ShmPathTooLong` if the backing path exceeds `PATH_MAX`
    /// - `InvalidVectorCount` if `n_vectors > MAX_VECTORS`
    /// - `InvalidSize` if `shm_size` is zero or above 1 GiB
    pub fn validate(&self) -> Result<(), ConfigError> {
        check_path(&self.socket_path, "socket_path")?;
        let len = self.socket_path.as_os_str().len();
        if len > SOCKET_PATH_MAX {
            return Err(ConfigError::SocketPathTooLong {
                len,
                max: SOCKET_PATH_MAX,
            });
        }

        check_path(&self.shm_path, "shm_path")?;
        let len = self.shm_path.as_os_str().len();
        if len > SHM_PATH_MAX {
            return Err(ConfigError::ShmPathTooLong {
                len,
                max: SHM_PATH_MAX,
            });
        }

        if self.n_vectors > MAX_VECTORS {
            return Err(ConfigError::InvalidVectorCount {
                count: self.n_vectors,
                max: MAX_VECTORS,
            });
        }

        if self.shm_size == 0 || self.shm_size > MAX_REGION_SIZE {
            return Err(ConfigError::InvalidSize {
                size: self.shm_size,
            });
        }

        Ok(())
    }
}

fn check_path(path: &Path, field: &'static str) -> Result<(), ConfigError> {
    let bytes = path.as_os_str().as_bytes();
    if bytes.is_empty() {
        return Err(ConfigError::EmptyPath { field });
    }
    if bytes.contains(&0) {
        return Err(ConfigError::NulInPath { field });
    }
    Ok(())
}

/// Parse a human-readable size such as `4096`, `64k`, `4M`, `1GiB`.
///
/// Suffixes are binary multiples and case-insensitive; a trailing `B` or
/// `iB` is accepted.
///
/// # Errors
///
/// Returns `ConfigError::InvalidSizeString` for empty input, unknown
/// suffixes, or values that overflow `u64`.
pub fn parse_size(input: &str) -> Result<u64, ConfigError> {
    let invalid = || ConfigError::InvalidSizeString(input.to_string());
    let trimmed = input.trim();

    let digits_end = trimmed
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(trimmed.len());
    let (digits, suffix) = trimmed.split_at(digits_end);
    if digits.is_empty() {
        return Err(invalid());
    }
    let value: u64 = digits.parse().map_err(|_| invalid())?;

    let shift = match suffix.trim().to_ascii_lowercase().as_str() {
        "" | "b" => 0,
        "k" | "kb" | "kib" => 10,
        "m" | "mb" | "mib" => 20,
        "g" | "gb" | "gib" => 30,
        "t" | "tb" | "tib" => 40,
        _ => return Err(invalid()),
    };

    value.checked_mul(1u64 << shift).ok_or_else(invalid)
}

fn deserialize_size<'de, D>(deserializer: D) -> Result<u64, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum RawSize {
        Bytes(u64),
        Text(String),
    }

    match RawSize::deserialize(deserializer)? {
        RawSize::Bytes(bytes) => Ok(bytes),
        RawSize::Text(text) => parse_size(&text).map_err(serde::de::Error::custom),
    }
}

/// Trait for loading configuration from TOML files.
///
/// # Contract
///
/// - Returns `ConfigError::FileNotFound` if the file does not exist
/// - Returns `ConfigError::ParseError` if TOML syntax is invalid
pub trait ConfigLoader: Sized + serde::de::DeserializeOwned {
    /// Load configuration from a TOML file.
    fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                ConfigError::FileNotFound
            } else {
                ConfigError::ParseError(e.to_string())
            }
        })?;
        Self::from_toml(&content)
    }

    /// Parse configuration from a TOML string.
    fn from_toml(content: &str) -> Result<Self, ConfigError> {
        toml::from_str(content).map_err(|e| ConfigError::ParseError(e.to_string()))
    }
}

impl ConfigLoader for ServerConfig {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        let config = ServerConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.n_vectors, 1);
        assert_eq!(config.shm_size, 4 * 1024 * 1024);
        assert!(!config.verbose);
    }

    #[test]
    fn parse_size_suffixes() {
        assert_eq!(parse_size("4096").unwrap(), 4096);
        assert_eq!(parse_size("64k").unwrap(), 64 * 1024);
        assert_eq!(parse_size("4M").unwrap(), 4 * 1024 * 1024);
        assert_eq!(parse_size("1GiB").unwrap(), 1 << 30);
        assert_eq!(parse_size(" 2 mb ").unwrap(), 2 << 20);
        assert_eq!(parse_size("512B").unwrap(), 512);
    }

    #[test]
    fn parse_size_rejects_garbage() {
        assert!(parse_size("").is_err());
        assert!(parse_size("M").is_err());
        assert!(parse_size("12X").is_err());
        assert!(parse_size("-4").is_err());
        assert!(parse_size("99999999999999999999").is_err());
        assert!(parse_size("16777216T").is_err());
    }

    #[test]
    fn socket_path_too_long() {
        let config = ServerConfig {
            socket_path: PathBuf::from(format!("/tmp/{}", "s".repeat(200))),
            ..ServerConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::SocketPathTooLong { max: 107, .. })
        ));
    }

    #[test]
    fn socket_path_at_limit_is_accepted() {
        let config = ServerConfig {
            socket_path: PathBuf::from("s".repeat(SOCKET_PATH_MAX)),
            ..ServerConfig::default()
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn shm_path_too_long() {
        let config = ServerConfig {
            shm_path: PathBuf::from("x".repeat(SHM_PATH_MAX + 1)),
            ..ServerConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::ShmPathTooLong { .. })
        ));
    }

    #[test]
    fn empty_paths_rejected() {
        let config = ServerConfig {
            shm_path: PathBuf::new(),
            ..ServerConfig::default()
        };
        assert_eq!(
            config.validate(),
            Err(ConfigError::EmptyPath { field: "shm_path" })
        );
    }

    #[test]
    fn vector_count_bounds() {
        let mut config = ServerConfig {
            n_vectors: 0,
            ..ServerConfig::default()
        };
        assert!(config.validate().is_ok());

        config.n_vectors = MAX_VECTORS;
        assert!(config.validate().is_ok());

        config.n_vectors = MAX_VECTORS + 1;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidVectorCount { count: 65, max: 64 })
        ));
    }

    #[test]
    fn size_bounds() {
        let mut config = ServerConfig {
            shm_size: 0,
            ..ServerConfig::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::InvalidSize { size: 0 })));

        config.shm_size = MAX_REGION_SIZE;
        assert!(config.validate().is_ok());

        config.shm_size = MAX_REGION_SIZE + 1;
        assert!(config.validate().is_err());
    }

    #[test]
    fn toml_accepts_size_strings_and_integers() {
        let config = ServerConfig::from_toml(
            r#"
socket_path = "/tmp/ivshmem_test_socket"
shm_path = "ivshmem_test"
shm_size = "2M"
n_vectors = 4
verbose = true
"#,
        )
        .unwrap();
        assert_eq!(config.shm_size, 2 * 1024 * 1024);
        assert_eq!(config.n_vectors, 4);
        assert!(config.verbose);

        let config = ServerConfig::from_toml("shm_size = 8192").unwrap();
        assert_eq!(config.shm_size, 8192);
        assert_eq!(config.socket_path, PathBuf::from(DEFAULT_SOCKET_PATH));
    }

    #[test]
    fn toml_rejects_unknown_fields() {
        let result = ServerConfig::from_toml("listen_backlog = 10");
        assert!(matches!(result, Err(ConfigError::ParseError(_))));
    }
}
