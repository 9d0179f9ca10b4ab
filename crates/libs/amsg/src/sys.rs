//! Raw `SOCK_SEQPACKET` operations.
//!
//! Descriptors handed out by the kernel (`accept4`, `SCM_RIGHTS`) arrive as
//! `OwnedFd` straight from rustix, so nothing here touches raw integers.

use crate::error::AmsgError;
use crate::wire::{Flags, Header, HEADER_LEN};
use rustix::io::Errno;
use rustix::net::{
    self, AddressFamily, RecvAncillaryBuffer, RecvAncillaryMessage, RecvFlags, ReturnFlags,
    SendAncillaryBuffer, SendAncillaryMessage, SendFlags, Shutdown, SocketAddrUnix, SocketFlags,
    SocketType,
};
use std::io::{IoSlice, IoSliceMut};
use std::mem::MaybeUninit;
use std::os::fd::{BorrowedFd, OwnedFd};
use std::path::Path;

pub(crate) struct Frame {
    pub(crate) header: Header,
    pub(crate) payload: Vec<u8>,
    pub(crate) reply_fd: Option<OwnedFd>,
}

pub(crate) enum Recv {
    Frame(Frame),
    WouldBlock,
    /// A malformed datagram was consumed and discarded. The socket is still usable.
    Dropped(AmsgError),
}

pub(crate) fn listener(path: &Path, backlog: i32) -> Result<OwnedFd, AmsgError> {
    let fd = net::socket_with(
        AddressFamily::UNIX,
        SocketType::SEQPACKET,
        SocketFlags::CLOEXEC | SocketFlags::NONBLOCK,
        None,
    )?;
    let addr = SocketAddrUnix::new(path)?;
    net::bind(&fd, &addr)?;
    net::listen(&fd, backlog)?;
    Ok(fd)
}

pub(crate) fn connect(path: &Path) -> Result<OwnedFd, AmsgError> {
    let fd = net::socket_with(AddressFamily::UNIX, SocketType::SEQPACKET, SocketFlags::CLOEXEC, None)?;
    let addr = SocketAddrUnix::new(path)?;
    net::connect(&fd, &addr)?;
    Ok(fd)
}

pub(crate) fn pair() -> Result<(OwnedFd, OwnedFd), AmsgError> {
    let fds =
        net::socketpair(AddressFamily::UNIX, SocketType::SEQPACKET, SocketFlags::CLOEXEC, None)?;
    Ok(fds)
}

/// Accepts one pending connection. `Ok(None)` when nothing is queued.
pub(crate) fn accept(listener: BorrowedFd<'_>) -> Result<Option<OwnedFd>, AmsgError> {
    match net::accept_with(listener, SocketFlags::CLOEXEC) {
        Ok(fd) => Ok(Some(fd)),
        Err(Errno::AGAIN) | Err(Errno::INTR) | Err(Errno::CONNABORTED) => Ok(None),
        Err(err) => Err(err.into()),
    }
}

pub(crate) fn send_frame(
    fd: BorrowedFd<'_>,
    header: &Header,
    payload: &[u8],
    pass_fd: Option<BorrowedFd<'_>>,
) -> Result<(), AmsgError> {
    let head = header.to_bytes();
    let iov = [IoSlice::new(&head), IoSlice::new(payload)];
    let mut space = [MaybeUninit::<u8>::uninit(); rustix::cmsg_space!(ScmRights(1))];
    let passed = pass_fd.map(|fd| [fd]);
    loop {
        let mut control = SendAncillaryBuffer::new(&mut space);
        if let Some(fds) = passed.as_ref() {
            if !control.push(SendAncillaryMessage::ScmRights(fds)) {
                return Err(AmsgError::Socket);
            }
        }
        match net::sendmsg(fd, &iov, &mut control, SendFlags::NOSIGNAL) {
            Ok(sent) if sent == header.total_len() => return Ok(()),
            Ok(_) => return Err(AmsgError::MsgTruncated),
            Err(Errno::INTR) => continue,
            Err(err) => return Err(err.into()),
        }
    }
}

/// Reads one datagram without blocking.
///
/// The header is peeked first so the size check happens before the payload
/// buffer exists. A zero-length read is an orderly shutdown and a short header
/// is treated as a broken peer; both come back as `Err`.
pub(crate) fn recv_frame(fd: BorrowedFd<'_>) -> Result<Recv, AmsgError> {
    let mut head = [0u8; HEADER_LEN];
    let peeked = match net::recv(fd, &mut head, RecvFlags::PEEK | RecvFlags::DONTWAIT) {
        Ok((n, _)) => n,
        Err(Errno::AGAIN) | Err(Errno::INTR) => return Ok(Recv::WouldBlock),
        Err(err) => return Err(err.into()),
    };
    if peeked == 0 {
        return Err(AmsgError::Disconnected);
    }
    if peeked < HEADER_LEN {
        discard(fd);
        return Err(AmsgError::DataCorrupt);
    }
    let header = match Header::from_bytes(&head) {
        Ok(header) => header,
        Err(err) => {
            discard(fd);
            return Ok(Recv::Dropped(err));
        }
    };

    let mut buf = vec![0u8; header.total_len()];
    let mut space = [MaybeUninit::<u8>::uninit(); rustix::cmsg_space!(ScmRights(1))];
    let mut control = RecvAncillaryBuffer::new(&mut space);
    let msg = {
        let mut iov = [IoSliceMut::new(&mut buf)];
        match net::recvmsg(fd, &mut iov, &mut control, RecvFlags::DONTWAIT | RecvFlags::CMSG_CLOEXEC)
        {
            Ok(msg) => msg,
            Err(Errno::AGAIN) | Err(Errno::INTR) => return Ok(Recv::WouldBlock),
            Err(err) => return Err(err.into()),
        }
    };
    let mut fds = Vec::new();
    for cmsg in control.drain() {
        if let RecvAncillaryMessage::ScmRights(received) = cmsg {
            fds.extend(received);
        }
    }
    let truncated = msg.flags.intersects(ReturnFlags::TRUNC | ReturnFlags::CTRUNC);
    if truncated || msg.bytes != header.total_len() {
        return Ok(Recv::Dropped(AmsgError::DataCorrupt));
    }

    let mut fds = fds.into_iter();
    let reply_fd = fds.next();
    let is_sync_request =
        header.flags.contains(Flags::SYNC) && !header.flags.contains(Flags::RESPONSE);
    if is_sync_request && reply_fd.is_none() {
        return Ok(Recv::Dropped(AmsgError::Socket));
    }
    buf.drain(..HEADER_LEN);
    Ok(Recv::Frame(Frame { header, payload: buf, reply_fd }))
}

pub(crate) fn shutdown(fd: BorrowedFd<'_>) {
    let _ = net::shutdown(fd, Shutdown::Both);
}

/// Consumes the datagram at the head of the queue. Any descriptors riding
/// on it are closed by the kernel.
fn discard(fd: BorrowedFd<'_>) {
    let mut byte = [0u8; 1];
    let _ = net::recv(fd, &mut byte, RecvFlags::DONTWAIT);
}

#[cfg(test)]
mod tests {
    use super::{pair, recv_frame, send_frame, Recv};
    use crate::error::AmsgError;
    use crate::wire::{Flags, Header};
    use rustix::net::{send, SendFlags};
    use std::os::fd::AsFd;

    #[test]
    fn frame_passes_descriptor_alongside_sync_request() {
        let (a, b) = pair().expect("pair");
        let (reply_ours, reply_theirs) = pair().expect("reply pair");
        let header = Header {
            flags: Flags::SYNC | Flags::RESPONSE_REQUESTED,
            interface: 7,
            msg_type: 1,
            seq: 3,
            payload_len: 4,
        };
        send_frame(a.as_fd(), &header, b"ping", Some(reply_theirs.as_fd())).expect("send");
        drop(reply_theirs);

        let Recv::Frame(frame) = recv_frame(b.as_fd()).expect("recv") else {
            panic!("expected a frame");
        };
        assert_eq!(frame.header, header);
        assert_eq!(frame.payload, b"ping");
        let reply_fd = frame.reply_fd.expect("descriptor received");

        let reply = Header { flags: Flags::RESPONSE | Flags::SYNC, payload_len: 0, ..header };
        send_frame(reply_fd.as_fd(), &reply, &[], None).expect("reply");
        let Recv::Frame(frame) = recv_frame(reply_ours.as_fd()).expect("recv reply") else {
            panic!("expected reply frame");
        };
        assert_eq!(frame.header.seq, 3);
    }

    #[test]
    fn empty_queue_reports_would_block() {
        let (_a, b) = pair().expect("pair");
        assert!(matches!(recv_frame(b.as_fd()), Ok(Recv::WouldBlock)));
    }

    #[test]
    fn length_mismatch_is_dropped_as_corrupt() {
        let (a, b) = pair().expect("pair");
        let header = Header {
            flags: Flags::NONE,
            interface: 1,
            msg_type: 1,
            seq: 1,
            payload_len: 10,
        };
        let mut bytes = header.to_bytes().to_vec();
        bytes.extend_from_slice(b"abc");
        send(&a, &bytes, SendFlags::empty()).expect("raw send");

        assert!(matches!(recv_frame(b.as_fd()), Ok(Recv::Dropped(AmsgError::DataCorrupt))));
        assert!(matches!(recv_frame(b.as_fd()), Ok(Recv::WouldBlock)));
    }

    #[test]
    fn short_header_is_fatal() {
        let (a, b) = pair().expect("pair");
        send(&a, &[0x5f, 0xa0, 0x10], SendFlags::empty()).expect("raw send");
        assert!(matches!(recv_frame(b.as_fd()), Err(AmsgError::DataCorrupt)));
    }

    #[test]
    fn closed_peer_reads_as_disconnect() {
        let (a, b) = pair().expect("pair");
        drop(a);
        assert!(matches!(recv_frame(b.as_fd()), Err(AmsgError::Disconnected)));
    }

    #[test]
    fn sync_request_without_descriptor_is_rejected() {
        let (a, b) = pair().expect("pair");
        let header = Header {
            flags: Flags::SYNC | Flags::RESPONSE_REQUESTED,
            interface: 2,
            msg_type: 1,
            seq: 9,
            payload_len: 0,
        };
        send_frame(a.as_fd(), &header, &[], None).expect("send");
        assert!(matches!(recv_frame(b.as_fd()), Ok(Recv::Dropped(AmsgError::Socket))));
    }
}
