//! Readiness-driven dispatch.
//!
//! The caller owns the wait: it asks [`IvshmemServer::watch_set`] which
//! descriptors to watch, blocks on them (see [`poll_ready`] for a `poll(2)`
//! driver), and hands the ready descriptors back to
//! [`IvshmemServer::dispatch`].

use nix::errno::Errno;
use nix::poll::{PollFd, PollFlags, PollTimeout, poll};
use std::collections::BTreeSet;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, RawFd};
use std::time::Duration;

use crate::acceptor::accept_one;
use crate::events::ServerEvent;
use crate::peer::PeerId;
use crate::server::IvshmemServer;

/// Descriptors reported ready by one wait.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReadySet {
    fds: BTreeSet<RawFd>,
}

impl ReadySet {
    /// Empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark `fd` ready.
    pub fn insert(&mut self, fd: RawFd) {
        self.fds.insert(fd);
    }

    /// True if `fd` was reported ready.
    pub fn contains(&self, fd: RawFd) -> bool {
        self.fds.contains(&fd)
    }

    /// True if nothing is ready.
    pub fn is_empty(&self) -> bool {
        self.fds.is_empty()
    }

    /// Number of ready descriptors.
    pub fn len(&self) -> usize {
        self.fds.len()
    }
}

impl FromIterator<RawFd> for ReadySet {
    fn from_iter<I: IntoIterator<Item = RawFd>>(iter: I) -> Self {
        Self {
            fds: iter.into_iter().collect(),
        }
    }
}

/// What one dispatch call changed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DispatchSummary {
    /// Identity registered by this call, if a handshake completed.
    pub accepted: Option<PeerId>,
    /// Identities torn down by this call, in registry order.
    pub removed: Vec<PeerId>,
}

impl DispatchSummary {
    /// True if peer membership changed.
    pub fn changed(&self) -> bool {
        self.accepted.is_some() || !self.removed.is_empty()
    }
}

impl IvshmemServer {
    /// Descriptors to wait on: the listener, then every peer connection in
    /// registry order.
    pub fn watch_set(&self) -> Vec<BorrowedFd<'_>> {
        std::iter::once(self.listener().as_fd())
            .chain(self.registry().iter().map(|peer| peer.connection().as_fd()))
            .collect()
    }

    /// React to one readiness snapshot.
    ///
    /// A ready listener triggers accept + handshake. Any readiness on a peer
    /// connection tears that peer down, whether it is a hangup or data.
    /// Peers are taken from a snapshot made before the accept, so a peer
    /// registered by this call is never torn down by it.
    pub fn dispatch(&mut self, ready: &ReadySet) -> DispatchSummary {
        let snapshot: Vec<(PeerId, RawFd)> = self
            .registry()
            .iter()
            .map(|peer| (peer.id(), peer.connection_fd()))
            .collect();

        let mut summary = DispatchSummary::default();

        if ready.contains(self.listener_fd()) {
            summary.accepted = self.handle_new_connection();
        }

        for (id, fd) in snapshot {
            if ready.contains(fd) && self.engine().teardown(id) {
                summary.removed.push(id);
            }
        }

        summary
    }

    fn handle_new_connection(&mut self) -> Option<PeerId> {
        let conn = match accept_one(self.listener()) {
            Ok(conn) => conn,
            Err(e) => {
                self.sink().record(&ServerEvent::AcceptFailed {
                    reason: e.to_string(),
                });
                return None;
            }
        };
        self.sink().record(&ServerEvent::Accepted {
            fd: conn.as_raw_fd(),
        });

        match self.engine().handshake(conn) {
            Ok(id) => Some(id),
            Err(e) => {
                self.sink().record(&ServerEvent::HandshakeFailed {
                    reason: e.to_string(),
                });
                None
            }
        }
    }
}

/// Wait with `poll(2)` until one of `fds` is readable, hung up or in
/// error, or until `timeout` expires (`None` waits forever).
///
/// Returns an empty set on timeout or when interrupted by a signal.
pub fn poll_ready(fds: &[BorrowedFd<'_>], timeout: Option<Duration>) -> std::io::Result<ReadySet> {
    let mut pollfds: Vec<PollFd<'_>> = fds
        .iter()
        .map(|fd| PollFd::new(*fd, PollFlags::POLLIN))
        .collect();
    let timeout = match timeout {
        Some(t) => {
            let ms = i32::try_from(t.as_millis()).unwrap_or(i32::MAX);
            PollTimeout::try_from(ms).map_err(|_| std::io::Error::from(Errno::EINVAL))?
        }
        None => PollTimeout::NONE,
    };

    match poll(&mut pollfds, timeout) {
        Ok(_) => {}
        Err(Errno::EINTR) => return Ok(ReadySet::new()),
        Err(e) => return Err(e.into()),
    }

    Ok(fds
        .iter()
        .zip(&pollfds)
        .filter(|(_, p)| p.revents().is_some_and(|r| !r.is_empty()))
        .map(|(fd, _)| fd.as_raw_fd())
        .collect())
}
