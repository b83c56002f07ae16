//! Protocol messages and descriptor passing.
//!
//! Every message on an ivshmem connection is one native-endian `i64`
//! (the *subject id*), optionally paired with exactly one open descriptor
//! carried as `SCM_RIGHTS` ancillary data. Messages carry no tag; their
//! meaning follows from their position in the stream:
//!
//! | Message        | subject id                  | descriptor      |
//! |----------------|-----------------------------|-----------------|
//! | version        | `IVSHMEM_PROTOCOL_VERSION`  | none            |
//! | assign-id      | the receiver's own id       | none            |
//! | region         | `REGION_SENTINEL_ID` (-1)   | shared memory   |
//! | vector-add     | id of the vector's owner    | one eventfd     |
//! | peer-removed   | id of the departed peer     | none            |
//!
//! The transport-specific part lives in [`MessageTransport`] and
//! [`recv_message`]; nothing else in the workspace touches `sendmsg(2)`.

use crate::consts::{IVSHMEM_PROTOCOL_VERSION, MESSAGE_SIZE, REGION_SENTINEL_ID};
use nix::sys::socket::{ControlMessage, ControlMessageOwned, MsgFlags, recvmsg, sendmsg};
use static_assertions::const_assert_eq;
use std::io::{IoSlice, IoSliceMut};
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};
use thiserror::Error;

const_assert_eq!(MESSAGE_SIZE, core::mem::size_of::<i64>());

/// Errors raised while sending or receiving protocol messages.
#[derive(Debug, Error)]
pub enum WireError {
    /// `sendmsg(2)` failed (including `EAGAIN` on a full non-blocking socket).
    #[error("cannot send message (subject {subject}): {source}")]
    Send {
        /// Subject id of the message that was not delivered.
        subject: i64,
        /// Underlying errno.
        #[source]
        source: nix::Error,
    },

    /// `recvmsg(2)` failed.
    #[error("cannot receive message: {0}")]
    Receive(#[source] nix::Error),

    /// The kernel transferred fewer bytes than one message.
    #[error("short message: {len} of 8 bytes")]
    ShortMessage {
        /// Number of bytes actually transferred.
        len: usize,
    },

    /// More than one descriptor arrived with a single message.
    #[error("expected at most one descriptor, got {count}")]
    UnexpectedDescriptorCount {
        /// Number of descriptors received.
        count: usize,
    },

    /// The peer closed the connection.
    #[error("connection closed by peer")]
    Disconnected,
}

/// One outgoing protocol message.
///
/// The descriptor is borrowed: the kernel duplicates it into the receiving
/// process, the sender keeps ownership of its own copy.
#[derive(Debug, Clone, Copy)]
pub struct Message<'fd> {
    /// Subject id field.
    pub subject: i64,
    /// Optional attached descriptor.
    pub descriptor: Option<BorrowedFd<'fd>>,
}

impl<'fd> Message<'fd> {
    /// Protocol version announcement, first message on every connection.
    pub const fn version() -> Self {
        Self {
            subject: IVSHMEM_PROTOCOL_VERSION,
            descriptor: None,
        }
    }

    /// Tells a new peer its own identity.
    pub const fn assign_id(id: i64) -> Self {
        Self {
            subject: id,
            descriptor: None,
        }
    }

    /// Hands out the shared memory region.
    pub const fn region(fd: BorrowedFd<'fd>) -> Self {
        Self {
            subject: REGION_SENTINEL_ID,
            descriptor: Some(fd),
        }
    }

    /// Announces one vector (eventfd) owned by peer `owner`.
    pub const fn vector_add(owner: i64, fd: BorrowedFd<'fd>) -> Self {
        Self {
            subject: owner,
            descriptor: Some(fd),
        }
    }

    /// Announces that peer `id` has left.
    pub const fn peer_removed(id: i64) -> Self {
        Self {
            subject: id,
            descriptor: None,
        }
    }
}

/// A message read from a connection, with ownership of any received descriptor.
#[derive(Debug)]
pub struct ReceivedMessage {
    /// Subject id field.
    pub subject: i64,
    /// Descriptor installed in this process, if one was attached.
    pub descriptor: Option<OwnedFd>,
}

impl ReceivedMessage {
    /// True when no descriptor was attached.
    pub fn is_bare(&self) -> bool {
        self.descriptor.is_none()
    }
}

/// Sends protocol messages over a connected Unix stream socket.
pub trait MessageTransport {
    /// Send one message, attaching its descriptor (if any) as `SCM_RIGHTS`.
    ///
    /// Never blocks on a non-blocking socket: a full send buffer surfaces as
    /// `WireError::Send` with `EAGAIN`.
    fn send_message(&self, message: &Message<'_>) -> Result<(), WireError>;
}

impl<T: AsFd> MessageTransport for T {
    fn send_message(&self, message: &Message<'_>) -> Result<(), WireError> {
        let payload = message.subject.to_ne_bytes();
        let iov = [IoSlice::new(&payload)];
        let fds = message.descriptor.map(|fd| [fd.as_raw_fd()]);
        let cmsg = fds.as_ref().map(|fds| ControlMessage::ScmRights(&fds[..]));

        let sent = sendmsg::<()>(
            self.as_fd().as_raw_fd(),
            &iov,
            cmsg.as_slice(),
            MsgFlags::MSG_NOSIGNAL,
            None,
        )
        .map_err(|source| WireError::Send {
            subject: message.subject,
            source,
        })?;

        if sent != MESSAGE_SIZE {
            return Err(WireError::ShortMessage { len: sent });
        }
        Ok(())
    }
}

/// Receive one message from `conn`.
///
/// Received descriptors are marked close-on-exec and owned by the caller.
pub fn recv_message<T: AsFd>(conn: &T) -> Result<ReceivedMessage, WireError> {
    let mut payload = [0u8; MESSAGE_SIZE];
    let mut cmsg_buffer = nix::cmsg_space!([RawFd; 1]);

    let (len, descriptors) = {
        let mut iov = [IoSliceMut::new(&mut payload)];
        let msg = recvmsg::<()>(
            conn.as_fd().as_raw_fd(),
            &mut iov,
            Some(&mut cmsg_buffer),
            MsgFlags::MSG_CMSG_CLOEXEC,
        )
        .map_err(WireError::Receive)?;

        let mut descriptors = Vec::new();
        // Truncated control data (ENOBUFS) means descriptors were dropped.
        for cmsg in msg.cmsgs().map_err(WireError::Receive)? {
            if let ControlMessageOwned::ScmRights(fds) = cmsg {
                // SAFETY: SCM_RIGHTS installs fresh descriptors owned by us.
                descriptors.extend(fds.into_iter().map(|fd| unsafe { OwnedFd::from_raw_fd(fd) }));
            }
        }
        (msg.bytes, descriptors)
    };

    if len == 0 && descriptors.is_empty() {
        return Err(WireError::Disconnected);
    }
    if len != MESSAGE_SIZE {
        return Err(WireError::ShortMessage { len });
    }
    if descriptors.len() > 1 {
        return Err(WireError::UnexpectedDescriptorCount {
            count: descriptors.len(),
        });
    }

    Ok(ReceivedMessage {
        subject: i64::from_ne_bytes(payload),
        descriptor: descriptors.into_iter().next(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;
    use std::io::{Read, Seek, SeekFrom, Write};
    use std::os::unix::fs::MetadataExt;
    use std::os::unix::net::UnixStream;

    #[test]
    fn bare_messages_roundtrip_subject() {
        let (a, b) = UnixStream::pair().unwrap();
        a.send_message(&Message::version()).unwrap();
        a.send_message(&Message::assign_id(7)).unwrap();
        a.send_message(&Message::peer_removed(3)).unwrap();

        let version = recv_message(&b).unwrap();
        assert_eq!(version.subject, IVSHMEM_PROTOCOL_VERSION);
        assert!(version.is_bare());

        assert_eq!(recv_message(&b).unwrap().subject, 7);
        assert_eq!(recv_message(&b).unwrap().subject, 3);
    }

    #[test]
    fn attached_descriptor_refers_to_same_file() {
        let (a, b) = UnixStream::pair().unwrap();
        let mut file = tempfile::tempfile().unwrap();
        file.write_all(b"doorbell").unwrap();

        a.send_message(&Message::region(file.as_fd())).unwrap();

        let msg = recv_message(&b).unwrap();
        assert_eq!(msg.subject, REGION_SENTINEL_ID);
        let mut received = File::from(msg.descriptor.expect("descriptor"));

        assert_eq!(
            received.metadata().unwrap().ino(),
            file.metadata().unwrap().ino()
        );
        received.seek(SeekFrom::Start(0)).unwrap();
        let mut text = String::new();
        received.read_to_string(&mut text).unwrap();
        assert_eq!(text, "doorbell");
    }

    #[test]
    fn sender_keeps_its_copy() {
        let (a, b) = UnixStream::pair().unwrap();
        let file = tempfile::tempfile().unwrap();
        a.send_message(&Message::vector_add(2, file.as_fd())).unwrap();
        let msg = recv_message(&b).unwrap();
        assert_eq!(msg.subject, 2);
        assert_ne!(
            msg.descriptor.as_ref().unwrap().as_raw_fd(),
            file.as_raw_fd()
        );
        // Our own descriptor is still valid after the transfer.
        assert!(file.metadata().is_ok());
    }

    #[test]
    fn closed_peer_reports_disconnect() {
        let (a, b) = UnixStream::pair().unwrap();
        drop(a);
        assert!(matches!(recv_message(&b), Err(WireError::Disconnected)));
    }

    #[test]
    fn send_to_closed_peer_fails_without_sigpipe() {
        let (a, b) = UnixStream::pair().unwrap();
        drop(b);
        let err = a.send_message(&Message::version()).unwrap_err();
        assert!(matches!(err, WireError::Send { subject: 0, .. }));
    }

    #[test]
    fn full_nonblocking_socket_fails_instead_of_blocking() {
        let (a, _b) = UnixStream::pair().unwrap();
        a.set_nonblocking(true).unwrap();

        let mut result = Ok(());
        for _ in 0..1_000_000 {
            result = a.send_message(&Message::peer_removed(1));
            if result.is_err() {
                break;
            }
        }
        match result {
            Err(WireError::Send { source, .. }) => assert_eq!(source, nix::Error::EAGAIN),
            other => panic!("expected EAGAIN, got {other:?}"),
        }
    }
}
