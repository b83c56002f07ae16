//! # ivshmem Server Library
//!
//! Brokers one shared memory region and a set of doorbell (eventfd)
//! vectors among independent client processes connected over a Unix
//! socket. Every client receives the region descriptor, its own identity,
//! and one descriptor per vector for every connected peer, so clients can
//! map the same memory and interrupt each other without a relay.
//!
//! # Module Structure
//!
//! - [`region`] - Backing store creation and power-of-two sizing
//! - [`peer`] - Peers, vectors and the insertion-ordered registry
//! - [`protocol`] - Handshake, broadcast and teardown sequences
//! - [`acceptor`] - Listening socket and connection accept
//! - [`multiplexer`] - Watch set / readiness dispatch and a `poll(2)` driver
//! - [`events`] - Injected event sink (tracing-backed by default)
//! - [`server`] - Server lifecycle tying everything together
//! - [`dump`] - Operator-facing peer listing
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                       ivshmem_server                             │
//! │  ┌─────────────┐    ┌──────────────┐    ┌─────────────────────┐  │
//! │  │  Acceptor   │───►│  Protocol    │◄──►│   Peer Registry     │  │
//! │  │ (listener)  │    │  Engine      │    │ (ids, eventfds)     │  │
//! │  └──────▲──────┘    └──────┬───────┘    └─────────────────────┘  │
//! │         │                  │ SCM_RIGHTS                          │
//! │  ┌──────┴──────┐    ┌──────▼───────┐                             │
//! │  │ Multiplexer │    │ SharedRegion │                             │
//! │  │ (dispatch)  │    │ (shm / file) │                             │
//! │  └─────────────┘    └──────────────┘                             │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```rust,no_run
//! use ivshmem_common::config::ServerConfig;
//! use ivshmem_server::{IvshmemServer, TracingSink, poll_ready};
//! use std::time::Duration;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = ServerConfig::default();
//! let mut server = IvshmemServer::start(config, Box::new(TracingSink::new(false)))?;
//! loop {
//!     let ready = poll_ready(&server.watch_set(), Some(Duration::from_millis(500)))?;
//!     server.dispatch(&ready);
//! }
//! # }
//! ```

#![deny(missing_docs)]

pub mod acceptor;
pub mod dump;
pub mod error;
pub mod events;
pub mod multiplexer;
pub mod peer;
pub mod protocol;
pub mod region;
pub mod server;

pub use crate::dump::{PeerDump, ServerDump};
pub use crate::error::{ServerError, ServerResult};
pub use crate::events::{CollectingSink, EventSink, ServerEvent, TracingSink};
pub use crate::multiplexer::{DispatchSummary, ReadySet, poll_ready};
pub use crate::peer::{Peer, PeerId, PeerRegistry};
pub use crate::region::{RegionBacking, SharedRegion, create_region};
pub use crate::server::IvshmemServer;
