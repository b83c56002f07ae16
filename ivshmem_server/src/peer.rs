//! Peers and the peer registry.
//!
//! A [`Peer`] owns its connection and its vector eventfds; dropping it
//! closes all of them. The [`PeerRegistry`] keeps peers in connection order
//! (broadcast order is observable by clients) with side indexes for lookup
//! by identity and by connection descriptor.

use nix::sys::eventfd::{EfdFlags, EventFd};
use std::collections::{BTreeMap, HashMap};
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::os::unix::net::UnixStream;

/// Peer identity as carried on the wire.
pub type PeerId = i64;

/// One registered client session.
#[derive(Debug)]
pub struct Peer {
    id: PeerId,
    conn: UnixStream,
    vectors: Vec<OwnedFd>,
}

impl Peer {
    /// Assemble a peer from a completed handshake.
    pub fn new(id: PeerId, conn: UnixStream, vectors: Vec<OwnedFd>) -> Self {
        Self { id, conn, vectors }
    }

    /// Identity of this peer.
    pub fn id(&self) -> PeerId {
        self.id
    }

    /// Connection to the client.
    pub fn connection(&self) -> &UnixStream {
        &self.conn
    }

    /// Raw descriptor of the connection, as watched by the multiplexer.
    pub fn connection_fd(&self) -> RawFd {
        self.conn.as_raw_fd()
    }

    /// The peer's vectors, in vector order.
    pub fn vectors(&self) -> &[OwnedFd] {
        &self.vectors
    }

    /// Split into connection and vectors so they can be released separately.
    pub fn into_parts(self) -> (PeerId, UnixStream, Vec<OwnedFd>) {
        (self.id, self.conn, self.vectors)
    }
}

/// Create one vector (an eventfd with a zero counter).
pub fn create_vector() -> std::io::Result<OwnedFd> {
    let fd = EventFd::from_value_and_flags(0, EfdFlags::EFD_CLOEXEC)?;
    Ok(OwnedFd::from(fd))
}

/// Create `count` vectors. On failure the ones already created are closed.
pub fn create_vectors(count: u32) -> std::io::Result<Vec<OwnedFd>> {
    (0..count).map(|_| create_vector()).collect()
}

/// Connection-ordered collection of registered peers.
#[derive(Debug, Default)]
pub struct PeerRegistry {
    /// Peers keyed by insertion sequence number.
    peers: BTreeMap<u64, Peer>,
    by_id: HashMap<PeerId, u64>,
    by_conn: HashMap<RawFd, PeerId>,
    next_seq: u64,
    /// Identity allocation counter.
    next_id: PeerId,
}

impl PeerRegistry {
    /// Create an empty registry whose first identity is 0.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of registered peers.
    pub fn len(&self) -> usize {
        self.peers.len()
    }

    /// True when no peer is registered.
    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    /// True if `id` is held by a registered peer.
    pub fn contains(&self, id: PeerId) -> bool {
        self.by_id.contains_key(&id)
    }

    /// Find a peer by identity.
    pub fn lookup_by_identity(&self, id: PeerId) -> Option<&Peer> {
        self.by_id.get(&id).and_then(|seq| self.peers.get(seq))
    }

    /// Find a peer by its connection descriptor.
    pub fn lookup_by_connection(&self, fd: RawFd) -> Option<&Peer> {
        self.by_conn
            .get(&fd)
            .and_then(|id| self.lookup_by_identity(*id))
    }

    /// Append `peer`. Gives the peer back if its identity is already held.
    pub fn insert(&mut self, peer: Peer) -> Result<(), Peer> {
        if self.contains(peer.id) {
            return Err(peer);
        }
        let seq = self.next_seq;
        self.next_seq += 1;
        self.by_id.insert(peer.id, seq);
        self.by_conn.insert(peer.connection_fd(), peer.id);
        self.peers.insert(seq, peer);
        Ok(())
    }

    /// Remove the peer holding `id`; the others keep their order.
    pub fn remove(&mut self, id: PeerId) -> Option<Peer> {
        let seq = self.by_id.remove(&id)?;
        let peer = self.peers.remove(&seq)?;
        self.by_conn.remove(&peer.connection_fd());
        Some(peer)
    }

    /// Peers in connection order.
    pub fn iter(&self) -> impl Iterator<Item = &Peer> + '_ {
        self.peers.values()
    }

    /// Identities in connection order, detached from the registry.
    pub fn ids(&self) -> Vec<PeerId> {
        self.iter().map(Peer::id).collect()
    }

    /// Remove every peer, returning them in connection order.
    pub fn drain(&mut self) -> Vec<Peer> {
        self.by_id.clear();
        self.by_conn.clear();
        std::mem::take(&mut self.peers).into_values().collect()
    }

    /// Allocate an identity.
    ///
    /// Starting at the counter, skips identities held by registered peers.
    /// The counter moves past the returned value even if the caller never
    /// registers it. Identities of departed peers are only protected while
    /// they are registered.
    pub fn next_unused_identity(&mut self) -> PeerId {
        while self.contains(self.next_id) {
            self.next_id = advance(self.next_id);
        }
        let id = self.next_id;
        self.next_id = advance(id);
        id
    }
}

/// Identities stay non-negative; -1 is the region sentinel.
fn advance(id: PeerId) -> PeerId {
    if id == PeerId::MAX { 0 } else { id + 1 }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer(registry: &mut PeerRegistry, vectors: u32) -> (Peer, UnixStream) {
        let (server_end, client_end) = UnixStream::pair().unwrap();
        let id = registry.next_unused_identity();
        (
            Peer::new(id, server_end, create_vectors(vectors).unwrap()),
            client_end,
        )
    }

    #[test]
    fn identities_start_at_zero_and_advance() {
        let mut registry = PeerRegistry::new();
        assert_eq!(registry.next_unused_identity(), 0);
        assert_eq!(registry.next_unused_identity(), 1);
        assert_eq!(registry.next_unused_identity(), 2);
    }

    #[test]
    fn insertion_order_is_preserved_across_removal() {
        let mut registry = PeerRegistry::new();
        let mut clients = Vec::new();
        for _ in 0..4 {
            let (p, c) = peer(&mut registry, 1);
            registry.insert(p).unwrap();
            clients.push(c);
        }
        assert_eq!(registry.ids(), vec![0, 1, 2, 3]);

        let removed = registry.remove(1).unwrap();
        assert_eq!(removed.id(), 1);
        assert_eq!(registry.ids(), vec![0, 2, 3]);
        assert!(registry.remove(1).is_none());

        let (p, c) = peer(&mut registry, 1);
        assert_eq!(p.id(), 4);
        registry.insert(p).unwrap();
        clients.push(c);
        assert_eq!(registry.ids(), vec![0, 2, 3, 4]);
    }

    #[test]
    fn lookups_follow_removal() {
        let mut registry = PeerRegistry::new();
        let (p, _c) = peer(&mut registry, 2);
        let fd = p.connection_fd();
        registry.insert(p).unwrap();

        assert_eq!(registry.lookup_by_identity(0).unwrap().vectors().len(), 2);
        assert_eq!(registry.lookup_by_connection(fd).unwrap().id(), 0);

        registry.remove(0);
        assert!(registry.lookup_by_identity(0).is_none());
        assert!(registry.lookup_by_connection(fd).is_none());
        assert!(registry.is_empty());
    }

    #[test]
    fn allocation_skips_registered_identities() {
        let mut registry = PeerRegistry::new();
        let (server_end, _client) = UnixStream::pair().unwrap();
        // A peer holding id 2 before the counter gets there.
        registry.insert(Peer::new(2, server_end, Vec::new())).unwrap();

        assert_eq!(registry.next_unused_identity(), 0);
        assert_eq!(registry.next_unused_identity(), 1);
        assert_eq!(registry.next_unused_identity(), 3);
    }

    #[test]
    fn duplicate_identity_is_refused() {
        let mut registry = PeerRegistry::new();
        let (a, _ca) = UnixStream::pair().unwrap();
        let (b, _cb) = UnixStream::pair().unwrap();
        registry.insert(Peer::new(5, a, Vec::new())).unwrap();
        let refused = registry.insert(Peer::new(5, b, Vec::new())).unwrap_err();
        assert_eq!(refused.id(), 5);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn counter_wraps_to_zero() {
        let mut registry = PeerRegistry {
            next_id: PeerId::MAX,
            ..PeerRegistry::default()
        };
        assert_eq!(registry.next_unused_identity(), PeerId::MAX);
        assert_eq!(registry.next_unused_identity(), 0);
    }

    #[test]
    fn drain_returns_connection_order() {
        let mut registry = PeerRegistry::new();
        let mut clients = Vec::new();
        for _ in 0..3 {
            let (p, c) = peer(&mut registry, 0);
            registry.insert(p).unwrap();
            clients.push(c);
        }
        let drained: Vec<PeerId> = registry.drain().iter().map(Peer::id).collect();
        assert_eq!(drained, vec![0, 1, 2]);
        assert!(registry.is_empty());
        assert!(registry.lookup_by_identity(0).is_none());
    }

    #[test]
    fn vectors_are_distinct_eventfds() {
        let vectors = create_vectors(3).unwrap();
        assert_eq!(vectors.len(), 3);
        let raw: std::collections::HashSet<RawFd> =
            vectors.iter().map(|fd| fd.as_raw_fd()).collect();
        assert_eq!(raw.len(), 3);
        assert!(create_vectors(0).unwrap().is_empty());
    }

    #[test]
    fn vector_is_cloexec_with_zero_counter() {
        use nix::fcntl::{FcntlArg, FdFlag, fcntl};
        use std::io::{Read, Write};

        let vector = create_vector().unwrap();
        let flags = FdFlag::from_bits_truncate(
            fcntl(vector.as_raw_fd(), FcntlArg::F_GETFD).unwrap(),
        );
        assert!(flags.contains(FdFlag::FD_CLOEXEC));

        // One ring on a fresh vector reads back as exactly one.
        let mut doorbell = std::fs::File::from(vector);
        doorbell.write_all(&1u64.to_ne_bytes()).unwrap();
        let mut counter = [0u8; 8];
        doorbell.read_exact(&mut counter).unwrap();
        assert_eq!(u64::from_ne_bytes(counter), 1);
    }
}
