//! Listening socket and connection accept.

use std::io::ErrorKind;
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::Path;
use thiserror::Error;

/// Accept failures. Never fatal to the server.
#[derive(Error, Debug)]
pub enum AcceptError {
    /// Listener was reported ready but no connection was pending.
    #[error("no pending connection")]
    NoPendingConnection,

    /// `accept(2)` or socket configuration failed.
    #[error("accept failed: {0}")]
    Io(#[from] std::io::Error),
}

/// Bind a non-blocking listening socket at `path`.
///
/// An existing file at `path` is an error; the caller owns cleanup of
/// stale sockets.
pub fn bind_listener(path: &Path) -> std::io::Result<UnixListener> {
    let listener = UnixListener::bind(path)?;
    listener.set_nonblocking(true)?;
    Ok(listener)
}

/// Accept exactly one pending connection and make it non-blocking.
pub fn accept_one(listener: &UnixListener) -> Result<UnixStream, AcceptError> {
    match listener.accept() {
        Ok((stream, _addr)) => {
            stream.set_nonblocking(true)?;
            Ok(stream)
        }
        Err(e) if e.kind() == ErrorKind::WouldBlock => Err(AcceptError::NoPendingConnection),
        Err(e) => Err(AcceptError::Io(e)),
    }
}
