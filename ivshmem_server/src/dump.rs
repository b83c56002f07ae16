//! Operator-facing peer listing.

use serde::Serialize;
use std::fmt;
use std::os::fd::RawFd;
use std::path::PathBuf;

use crate::peer::PeerId;

/// One registered peer and the raw numbers of its vector descriptors.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PeerDump {
    /// Peer identity.
    pub id: PeerId,
    /// Vector descriptors, in vector order.
    pub vectors: Vec<RawFd>,
}

/// Snapshot of the server state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ServerDump {
    /// Listening socket path.
    pub socket_path: PathBuf,
    /// Region backing path.
    pub shm_path: PathBuf,
    /// Actual region size in bytes.
    pub region_size: u64,
    /// Vectors per peer.
    pub n_vectors: u32,
    /// Peers in connection order.
    pub peers: Vec<PeerDump>,
}

impl ServerDump {
    /// Serialize as a single JSON object.
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

impl fmt::Display for ServerDump {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for peer in &self.peers {
            writeln!(f, "peer_id = {}", peer.id)?;
            for (vector, fd) in peer.vectors.iter().enumerate() {
                writeln!(f, "  vector {vector} is enabled (fd={fd})")?;
            }
        }
        Ok(())
    }
}
