//! Handshake, broadcast and teardown sequences.
//!
//! ## Handshake (one new connection)
//!
//! 1. version
//! 2. assign-id (identity allocated here)
//! 3. region descriptor
//! 4. create `n_vectors` eventfds
//! 5. every registered peer gets vector-add for each new vector
//! 6. the newcomer gets vector-add for every vector of every registered peer
//! 7. the newcomer gets vector-add for each of its own vectors
//! 8. the newcomer is registered
//!
//! Steps 1-4 abort the newcomer on failure; everything created so far is
//! dropped. Steps 5-7 only report failures to the event sink.
//!
//! ## Teardown (one departed peer)
//!
//! Close the connection, remove from the registry, send peer-removed to
//! every remaining peer, close the departed peer's vectors.

use ivshmem_common::wire::{Message, MessageTransport, WireError};
use std::os::fd::{AsFd, BorrowedFd};
use std::os::unix::net::UnixStream;
use thiserror::Error;

use crate::events::{EventSink, ServerEvent};
use crate::peer::{Peer, PeerId, PeerRegistry, create_vectors};

/// Handshake failures. Only the new connection is affected.
#[derive(Error, Debug)]
pub enum HandshakeError {
    /// Step 1.
    #[error("cannot send version: {0}")]
    SendVersion(#[source] WireError),

    /// Step 2.
    #[error("cannot send peer id {id}: {source}")]
    SendPeerId {
        /// Identity that was allocated.
        id: PeerId,
        /// Send failure.
        #[source]
        source: WireError,
    },

    /// Step 3.
    #[error("cannot send shm fd to peer {id}: {source}")]
    SendRegion {
        /// Identity that was allocated.
        id: PeerId,
        /// Send failure.
        #[source]
        source: WireError,
    },

    /// Step 4.
    #[error("cannot create eventfd for peer {id}: {source}")]
    CreateVector {
        /// Identity that was allocated.
        id: PeerId,
        /// Creation failure.
        #[source]
        source: std::io::Error,
    },

    /// Registry refused the identity.
    #[error("peer id {id} already registered")]
    DuplicateIdentity {
        /// Conflicting identity.
        id: PeerId,
    },
}

/// Runs the protocol against a registry.
///
/// Borrows the server state for the duration of one operation.
pub struct ProtocolEngine<'a> {
    registry: &'a mut PeerRegistry,
    region: BorrowedFd<'a>,
    n_vectors: u32,
    sink: &'a dyn EventSink,
}

impl<'a> ProtocolEngine<'a> {
    /// Bind an engine to the registry, region descriptor and sink.
    pub fn new(
        registry: &'a mut PeerRegistry,
        region: BorrowedFd<'a>,
        n_vectors: u32,
        sink: &'a dyn EventSink,
    ) -> Self {
        Self {
            registry,
            region,
            n_vectors,
            sink,
        }
    }

    /// Run the handshake on a freshly accepted connection.
    ///
    /// On success the peer is registered and its identity returned. On
    /// failure the connection and any created vectors are closed and the
    /// registry is unchanged (apart from the allocation counter).
    pub fn handshake(&mut self, conn: UnixStream) -> Result<PeerId, HandshakeError> {
        conn.send_message(&Message::version())
            .map_err(HandshakeError::SendVersion)?;

        let id = self.registry.next_unused_identity();
        conn.send_message(&Message::assign_id(id))
            .map_err(|source| HandshakeError::SendPeerId { id, source })?;

        conn.send_message(&Message::region(self.region))
            .map_err(|source| HandshakeError::SendRegion { id, source })?;

        let vectors = create_vectors(self.n_vectors)
            .map_err(|source| HandshakeError::CreateVector { id, source })?;

        // Announce the newcomer to everyone already registered.
        for other in self.registry.iter() {
            for vector in &vectors {
                self.notify(other.id(), other.connection(), &Message::vector_add(id, vector.as_fd()));
            }
        }

        // Announce everyone already registered to the newcomer.
        for other in self.registry.iter() {
            for vector in other.vectors() {
                self.notify(id, &conn, &Message::vector_add(other.id(), vector.as_fd()));
            }
        }

        for vector in &vectors {
            self.notify(id, &conn, &Message::vector_add(id, vector.as_fd()));
        }

        let count = vectors.len();
        self.registry
            .insert(Peer::new(id, conn, vectors))
            .map_err(|peer| HandshakeError::DuplicateIdentity { id: peer.id() })?;
        self.sink.record(&ServerEvent::PeerAdded { id, vectors: count });
        Ok(id)
    }

    /// Tear down the peer holding `id`.
    ///
    /// Returns `false` without side effects if no such peer is registered.
    pub fn teardown(&mut self, id: PeerId) -> bool {
        let Some(peer) = self.registry.remove(id) else {
            return false;
        };
        let (id, conn, vectors) = peer.into_parts();
        drop(conn);

        for other in self.registry.iter() {
            self.notify(other.id(), other.connection(), &Message::peer_removed(id));
        }

        drop(vectors);
        self.sink.record(&ServerEvent::PeerRemoved {
            id,
            remaining: self.registry.len(),
        });
        true
    }

    /// Release every peer without notifying anyone. Returns how many.
    pub fn release_all(&mut self) -> usize {
        let peers = self.registry.drain();
        let count = peers.len();
        drop(peers);
        count
    }

    /// Best-effort delivery; failures only reach the sink.
    fn notify(&self, recipient: PeerId, conn: &UnixStream, message: &Message<'_>) {
        if let Err(e) = conn.send_message(message) {
            self.sink.record(&ServerEvent::BroadcastFailed {
                recipient,
                subject: message.subject,
                reason: e.to_string(),
            });
        }
    }
}
