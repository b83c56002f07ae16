//! Startup error types for the broker.
//!
//! Only startup can fail the server as a whole. Accept, handshake and
//! broadcast failures are reported through the event sink instead.

use crate::region::RegionError;
use ivshmem_common::config::ConfigError;
use std::path::PathBuf;
use thiserror::Error;

/// Errors that abort server startup.
#[derive(Error, Debug)]
pub enum ServerError {
    /// Configuration rejected before anything was created.
    #[error("Invalid configuration: {0}")]
    Config(#[from] ConfigError),

    /// Backing store could not be created or sized.
    #[error("Shared memory setup failed: {0}")]
    Region(#[from] RegionError),

    /// Listening socket could not be created, bound or configured.
    #[error("Cannot listen on {}: {source}", path.display())]
    Listen {
        /// Socket path.
        path: PathBuf,
        /// Source IO error
        #[source]
        source: std::io::Error,
    },
}

/// Result type for server startup.
pub type ServerResult<T> = Result<T, ServerError>;
