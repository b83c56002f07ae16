//! ivshmem Common Library
//!
//! This crate provides the constants, configuration surface and wire
//! message primitives shared by the ivshmem broker and its clients.
//!
//! # Module Structure
//!
//! - [`consts`] - Protocol constants, limits and default paths
//! - [`config`] - Server configuration, validation and TOML loading
//! - [`wire`] - Protocol messages and descriptor passing over Unix sockets
//! - [`prelude`] - Common re-exports for convenience
//!
//! # Usage
//!
//! ```rust
//! use ivshmem_common::config::ServerConfig;
//! use ivshmem_common::consts::IVSHMEM_PROTOCOL_VERSION;
//!
//! let config = ServerConfig::default();
//! assert!(config.validate().is_ok());
//! assert_eq!(IVSHMEM_PROTOCOL_VERSION, 0);
//! ```

#![deny(missing_docs)]

pub mod config;
pub mod consts;
pub mod prelude;
pub mod wire;
