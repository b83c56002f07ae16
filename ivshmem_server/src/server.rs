//! Server lifecycle.
//!
//! `IvshmemServer` owns the region, the listening socket and the peer
//! registry for the lifetime of one instance. Startup is all-or-nothing;
//! shutdown releases every peer without notifying the others, removes the
//! socket path, then closes the listener and the region.

use ivshmem_common::config::ServerConfig;
use std::io::ErrorKind;
use std::os::fd::{AsFd, AsRawFd, RawFd};
use std::os::unix::net::UnixListener;

use crate::acceptor::bind_listener;
use crate::dump::{PeerDump, ServerDump};
use crate::error::{ServerError, ServerResult};
use crate::events::{EventSink, ServerEvent};
use crate::peer::PeerRegistry;
use crate::protocol::ProtocolEngine;
use crate::region::{SharedRegion, create_region};

/// One running broker instance.
pub struct IvshmemServer {
    config: ServerConfig,
    region: SharedRegion,
    listener: UnixListener,
    registry: PeerRegistry,
    sink: Box<dyn EventSink>,
    closed: bool,
}

impl IvshmemServer {
    /// Validate `config`, create the region and bind the listening socket.
    ///
    /// # Errors
    /// - `ServerError::Config` if validation fails (nothing is created)
    /// - `ServerError::Region` if the backing store cannot be opened or sized
    /// - `ServerError::Listen` if the socket cannot be bound; the region
    ///   descriptor is closed before returning
    pub fn start(config: ServerConfig, sink: Box<dyn EventSink>) -> ServerResult<Self> {
        config.validate()?;

        let region = create_region(&config.shm_path, config.shm_size)?;
        let listener = bind_listener(&config.socket_path).map_err(|source| ServerError::Listen {
            path: config.socket_path.clone(),
            source,
        })?;

        sink.record(&ServerEvent::Started {
            socket_path: config.socket_path.clone(),
            shm_path: config.shm_path.clone(),
            region_size: region.size(),
            n_vectors: config.n_vectors,
        });

        Ok(Self {
            config,
            region,
            listener,
            registry: PeerRegistry::new(),
            sink,
            closed: false,
        })
    }

    /// Configuration this instance was started with.
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// The shared region.
    pub fn region(&self) -> &SharedRegion {
        &self.region
    }

    /// Registered peers.
    pub fn registry(&self) -> &PeerRegistry {
        &self.registry
    }

    /// Number of registered peers.
    pub fn peer_count(&self) -> usize {
        self.registry.len()
    }

    /// Descriptor of the listening socket.
    pub fn listener_fd(&self) -> RawFd {
        self.listener.as_raw_fd()
    }

    pub(crate) fn listener(&self) -> &UnixListener {
        &self.listener
    }

    pub(crate) fn sink(&self) -> &dyn EventSink {
        self.sink.as_ref()
    }

    pub(crate) fn engine(&mut self) -> ProtocolEngine<'_> {
        ProtocolEngine::new(
            &mut self.registry,
            self.region.as_fd(),
            self.config.n_vectors,
            self.sink.as_ref(),
        )
    }

    /// Operator-facing listing of peers and their vector descriptors.
    pub fn dump(&self) -> ServerDump {
        ServerDump {
            socket_path: self.config.socket_path.clone(),
            shm_path: self.config.shm_path.clone(),
            region_size: self.region.size(),
            n_vectors: self.config.n_vectors,
            peers: self
                .registry
                .iter()
                .map(|peer| PeerDump {
                    id: peer.id(),
                    vectors: peer.vectors().iter().map(|fd| fd.as_raw_fd()).collect(),
                })
                .collect(),
        }
    }

    /// Stop the server, releasing every resource.
    pub fn shutdown(mut self) {
        self.close();
    }

    fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;

        self.sink.record(&ServerEvent::ShuttingDown {
            peers: self.registry.len(),
        });
        self.engine().release_all();

        if let Err(e) = std::fs::remove_file(&self.config.socket_path) {
            if e.kind() != ErrorKind::NotFound {
                self.sink.record(&ServerEvent::SocketCleanupFailed {
                    path: self.config.socket_path.clone(),
                    reason: e.to_string(),
                });
            }
        }
    }
}

impl Drop for IvshmemServer {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::CollectingSink;
    use std::path::PathBuf;
    use std::sync::Arc;

    fn config_in(dir: &tempfile::TempDir) -> ServerConfig {
        ServerConfig {
            socket_path: dir.path().join("sock"),
            shm_path: dir.path().join("shm"),
            shm_size: 4096,
            n_vectors: 2,
            verbose: true,
        }
    }

    #[test]
    fn start_creates_socket_and_region() {
        let dir = tempfile::tempdir().unwrap();
        let sink = Arc::new(CollectingSink::new());
        let server = IvshmemServer::start(config_in(&dir), Box::new(sink.clone())).unwrap();

        assert!(dir.path().join("sock").exists());
        assert_eq!(server.region().size(), 4096);
        assert_eq!(server.peer_count(), 0);
        let watch: Vec<RawFd> = server.watch_set().iter().map(|fd| fd.as_raw_fd()).collect();
        assert_eq!(watch, vec![server.listener_fd()]);
        assert!(matches!(
            sink.events()[0],
            ServerEvent::Started { region_size: 4096, n_vectors: 2, .. }
        ));
    }

    #[test]
    fn shutdown_removes_socket_path() {
        let dir = tempfile::tempdir().unwrap();
        let sink = Arc::new(CollectingSink::new());
        let server = IvshmemServer::start(config_in(&dir), Box::new(sink.clone())).unwrap();
        server.shutdown();

        assert!(!dir.path().join("sock").exists());
        assert_eq!(sink.events().last(), Some(&ServerEvent::ShuttingDown { peers: 0 }));
    }

    #[test]
    fn drop_also_cleans_up_once() {
        let dir = tempfile::tempdir().unwrap();
        let sink = Arc::new(CollectingSink::new());
        {
            let _server = IvshmemServer::start(config_in(&dir), Box::new(sink.clone())).unwrap();
        }
        assert!(!dir.path().join("sock").exists());
        let shutdowns = sink
            .events()
            .iter()
            .filter(|e| matches!(e, ServerEvent::ShuttingDown { .. }))
            .count();
        assert_eq!(shutdowns, 1);
    }

    #[test]
    fn invalid_config_creates_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = config_in(&dir);
        config.n_vectors = 1000;
        let result = IvshmemServer::start(config, Box::new(CollectingSink::new()));
        assert!(matches!(result, Err(ServerError::Config(_))));
        assert!(!dir.path().join("shm").exists());
        assert!(!dir.path().join("sock").exists());
    }

    #[test]
    fn socket_in_use_fails_startup() {
        let dir = tempfile::tempdir().unwrap();
        let first = IvshmemServer::start(config_in(&dir), Box::new(CollectingSink::new())).unwrap();

        let mut config = config_in(&dir);
        config.shm_path = dir.path().join("shm2");
        let result = IvshmemServer::start(config, Box::new(CollectingSink::new()));
        assert!(matches!(result, Err(ServerError::Listen { .. })));

        // The failed start must not remove the socket of the running one.
        assert!(dir.path().join("sock").exists());
        drop(first);
    }

    #[test]
    fn region_failure_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = config_in(&dir);
        config.shm_path = PathBuf::from("/nonexistent_dir_ivshmem/shm");
        let result = IvshmemServer::start(config, Box::new(CollectingSink::new()));
        assert!(matches!(result, Err(ServerError::Region(_))));
        assert!(!dir.path().join("sock").exists());
    }
}
