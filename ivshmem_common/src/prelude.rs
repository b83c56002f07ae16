//! Common re-exports for convenience.
//!
//! ```rust
//! use ivshmem_common::prelude::*;
//! ```

pub use crate::config::{ConfigError, ConfigLoader, ServerConfig, parse_size};
pub use crate::consts::*;
pub use crate::wire::{Message, MessageTransport, ReceivedMessage, WireError, recv_message};
