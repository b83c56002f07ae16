//! Event sink injected into the server.
//!
//! The server never logs directly. Every noteworthy step is described as a
//! [`ServerEvent`] and handed to the [`EventSink`] passed at construction.
//! [`TracingSink`] forwards to `tracing`; [`CollectingSink`] keeps events in
//! memory for embedding and tests.

use parking_lot::Mutex;
use std::os::fd::RawFd;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::peer::PeerId;

/// Something the server did or failed to do.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerEvent {
    /// Region and listening socket are ready.
    Started {
        /// Listening socket path.
        socket_path: PathBuf,
        /// Backing store path.
        shm_path: PathBuf,
        /// Size the region was actually set to.
        region_size: u64,
        /// Vectors per peer.
        n_vectors: u32,
    },
    /// A raw connection was accepted.
    Accepted {
        /// Descriptor of the new connection.
        fd: RawFd,
    },
    /// Accept failed (including no pending connection).
    AcceptFailed {
        /// Error description.
        reason: String,
    },
    /// A handshake aborted; the connection was dropped.
    HandshakeFailed {
        /// Error description.
        reason: String,
    },
    /// A peer completed its handshake and was registered.
    PeerAdded {
        /// Identity assigned to the peer.
        id: PeerId,
        /// Number of vectors created for it.
        vectors: usize,
    },
    /// A peer disconnected and was torn down.
    PeerRemoved {
        /// Identity of the departed peer.
        id: PeerId,
        /// Remaining registered peers.
        remaining: usize,
    },
    /// A notification to a bystander peer could not be delivered.
    BroadcastFailed {
        /// Peer that missed the message.
        recipient: PeerId,
        /// Subject id of the lost message.
        subject: PeerId,
        /// Error description.
        reason: String,
    },
    /// Shutdown started; `peers` are released without notification.
    ShuttingDown {
        /// Peers still registered.
        peers: usize,
    },
    /// The listening socket path could not be removed.
    SocketCleanupFailed {
        /// Socket path.
        path: PathBuf,
        /// Error description.
        reason: String,
    },
}

/// Destination for server events.
pub trait EventSink {
    /// Record one event.
    fn record(&self, event: &ServerEvent);
}

impl<S: EventSink + ?Sized> EventSink for Arc<S> {
    fn record(&self, event: &ServerEvent) {
        (**self).record(event);
    }
}

/// Forwards events to `tracing`.
///
/// Protocol chatter is emitted at `debug` only when `verbose` is set;
/// membership changes go to `info`, failures to `warn`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingSink {
    verbose: bool,
}

impl TracingSink {
    /// Create a sink; `verbose` enables per-connection chatter.
    pub const fn new(verbose: bool) -> Self {
        Self { verbose }
    }
}

impl EventSink for TracingSink {
    fn record(&self, event: &ServerEvent) {
        match event {
            ServerEvent::Started {
                socket_path,
                shm_path,
                region_size,
                n_vectors,
            } => info!(
                "listening on {} (shm {}, {} bytes, {} vectors)",
                socket_path.display(),
                shm_path.display(),
                region_size,
                n_vectors
            ),
            ServerEvent::Accepted { fd } => {
                if self.verbose {
                    debug!("accept()={}", fd);
                }
            }
            ServerEvent::AcceptFailed { reason } => {
                if self.verbose {
                    debug!("cannot accept(): {}", reason);
                }
            }
            ServerEvent::HandshakeFailed { reason } => warn!("new peer rejected: {}", reason),
            ServerEvent::PeerAdded { id, vectors } => {
                info!("new peer id = {} ({} vectors)", id, vectors)
            }
            ServerEvent::PeerRemoved { id, remaining } => {
                info!("free peer {} ({} remaining)", id, remaining)
            }
            ServerEvent::BroadcastFailed {
                recipient,
                subject,
                reason,
            } => warn!(
                "peer {} missed notification about {}: {}",
                recipient, subject, reason
            ),
            ServerEvent::ShuttingDown { peers } => info!("close server ({} peers)", peers),
            ServerEvent::SocketCleanupFailed { path, reason } => {
                warn!("cannot remove {}: {}", path.display(), reason)
            }
        }
    }
}

/// Keeps every event in memory.
#[derive(Debug, Default)]
pub struct CollectingSink {
    events: Mutex<Vec<ServerEvent>>,
}

impl CollectingSink {
    /// Create an empty sink.
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of the recorded events.
    pub fn events(&self) -> Vec<ServerEvent> {
        self.events.lock().clone()
    }

    /// Remove and return the recorded events.
    pub fn take(&self) -> Vec<ServerEvent> {
        std::mem::take(&mut *self.events.lock())
    }
}

impl EventSink for CollectingSink {
    fn record(&self, event: &ServerEvent) {
        self.events.lock().push(event.clone());
    }
}
