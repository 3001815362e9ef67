use crate::peer::{Layer, Mortality, Peer};
use log::{debug, error, log_enabled, warn, Level};
use ringws::{IoErr, IoResult};

/// What a TCP-layer pass concluded about the peer's slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TcpOutcome {
    /// A live peer was promoted to its next layer; dispatch again.
    Promoted,
    /// The shutdown sequence is waiting on the peer; keep the slot.
    Pending,
    /// The socket is closed; the caller must free the slot.
    Freed,
}

/// Plain `read` on the peer's socket.
pub fn read_tcp(peer: &mut Peer, rbuf: &mut [u8]) -> IoResult<usize> {
    // SAFETY: rbuf is a live, writable buffer of the given length.
    let ret = unsafe { libc::read(peer.fd, rbuf.as_mut_ptr().cast(), rbuf.len()) };
    if ret > 0 {
        return Ok(ret as usize);
    }
    if ret == 0 {
        debug!("read({}) returned 0: orderly shutdown from peer", peer.fd);
        return Err(IoErr::ClosePeer);
    }
    let err = std::io::Error::last_os_error();
    match err.raw_os_error() {
        Some(libc::EAGAIN) | Some(libc::EINTR) => {
            peer.is_writing = false;
            Err(IoErr::Again)
        }
        _ => {
            warn!("read({}, rbuf, {}) failed: {}", peer.fd, rbuf.len(), err);
            Err(IoErr::ClosePeer)
        }
    }
}

/// Plain `write` of the `[old_wsize..]` suffix of `wbuf`.
///
/// Returns `Ok` only once the entire buffer is out; a short or blocked write
/// records the blocked direction and how far it got, and the caller must
/// retry with the byte-identical buffer.
pub fn write_tcp(peer: &mut Peer, wbuf: &[u8]) -> IoResult {
    debug_assert!(peer.old_wsize < wbuf.len(), "nothing left to write");
    let remaining = &wbuf[peer.old_wsize..];
    // SAFETY: remaining is a live buffer of the given length.
    let ret = unsafe { libc::write(peer.fd, remaining.as_ptr().cast(), remaining.len()) };
    if ret > 0 {
        let wsize = ret as usize;
        if wsize == remaining.len() {
            peer.old_wsize = 0;
            return Ok(());
        }
        peer.old_wsize += wsize;
        peer.is_writing = true;
        return Err(IoErr::Again);
    }
    let err = std::io::Error::last_os_error();
    match err.raw_os_error() {
        Some(libc::EAGAIN) | Some(libc::EINTR) => {
            peer.is_writing = true;
            Err(IoErr::Again)
        }
        _ => {
            warn!(
                "write({}, wbuf + {}, {}) failed: {}",
                peer.fd,
                peer.old_wsize,
                remaining.len(),
                err
            );
            Err(IoErr::ClosePeer)
        }
    }
}

/// Sends our FIN with `shutdown(SHUT_WR)` and advances the mortality state.
///
/// A failure here means the kernel's view of the socket no longer matches
/// ours, which is not a per-peer problem.
pub fn write_bidirectional_shutdown(peer: &mut Peer) -> IoResult {
    // SAFETY: plain syscall on an owned fd.
    if unsafe { libc::shutdown(peer.fd, libc::SHUT_WR) } == -1 {
        error!(
            "shutdown({}, SHUT_WR) failed: {}",
            peer.fd,
            std::io::Error::last_os_error()
        );
        return Err(IoErr::Fatal);
    }
    peer.mortality = Mortality::ShutdownRead;
    Ok(())
}

/// Drains and discards incoming bytes until the peer's FIN arrives.
///
/// The layer has dropped below Ws by the time this runs, so whatever the
/// peer still sends is unusable; it is read into the scratch buffer and
/// overwritten by the next pass.
fn read_bidirectional_shutdown(peer: &mut Peer, rbuf: &mut [u8]) -> IoResult {
    loop {
        // SAFETY: rbuf is a live, writable buffer of the given length.
        let ret = unsafe { libc::read(peer.fd, rbuf.as_mut_ptr().cast(), rbuf.len()) };
        if ret > 0 {
            if log_enabled!(Level::Debug) {
                debug!("discarded {} bytes from closing peer fd {}", ret, peer.fd);
            }
            continue;
        }
        if ret == 0 {
            peer.mortality = Mortality::Dead;
            return Err(IoErr::ClosePeer);
        }
        let err = std::io::Error::last_os_error();
        return match err.raw_os_error() {
            Some(libc::EAGAIN) | Some(libc::EINTR) => {
                peer.is_writing = false;
                Err(IoErr::Again)
            }
            _ => {
                warn!("read({}) during shutdown failed: {}", peer.fd, err);
                peer.mortality = Mortality::Dead;
                Err(IoErr::ClosePeer)
            }
        };
    }
}

/// The TCP-layer dispatcher: promotes brand-new peers to their first real
/// layer, and walks dying peers through the bidirectional shutdown.
///
/// Each shutdown step falls through to the next on success, so a peer whose
/// FIN already arrived is freed within a single call.
pub fn handle_tcp(peer: &mut Peer, rbuf: &mut [u8]) -> IoResult<TcpOutcome> {
    if peer.mortality == Mortality::Live {
        peer.layer = if peer.is_encrypted {
            Layer::Tls
        } else {
            Layer::Http
        };
        return Ok(TcpOutcome::Promoted);
    }

    if peer.mortality == Mortality::ShutdownWrite {
        write_bidirectional_shutdown(peer)?;
    }
    if peer.mortality == Mortality::ShutdownRead {
        match read_bidirectional_shutdown(peer, rbuf) {
            Err(IoErr::Again) => return Ok(TcpOutcome::Pending),
            Err(IoErr::Fatal) => return Err(IoErr::Fatal),
            _ => {}
        }
    }

    // Mortality::Dead. Closing the only descriptor of this file description
    // also removes it from every epoll interest list, so no explicit
    // EPOLL_CTL_DEL is needed (man 7 epoll, Q&A 6).
    // SAFETY: plain syscall on an owned fd, closed exactly once.
    if unsafe { libc::close(peer.fd) } == -1 {
        warn!(
            "close({}) failed: {}",
            peer.fd,
            std::io::Error::last_os_error()
        );
    }
    Ok(TcpOutcome::Freed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::io::RawFd;

    /// Nonblocking AF_UNIX socketpair standing in for a TCP connection.
    fn pair() -> (RawFd, RawFd) {
        let mut fds = [0; 2];
        let ret = unsafe {
            libc::socketpair(
                libc::AF_UNIX,
                libc::SOCK_STREAM | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
                0,
                fds.as_mut_ptr(),
            )
        };
        assert_eq!(ret, 0);
        (fds[0], fds[1])
    }

    fn close_fd(fd: RawFd) {
        unsafe { libc::close(fd) };
    }

    fn send_all(fd: RawFd, bytes: &[u8]) {
        let ret = unsafe { libc::write(fd, bytes.as_ptr().cast(), bytes.len()) };
        assert_eq!(ret as usize, bytes.len());
    }

    #[test]
    fn test_read_tcp_returns_bytes_then_again() {
        let (ours, theirs) = pair();
        let mut peer = Peer::new(ours, false);
        let mut rbuf = [0u8; 64];

        send_all(theirs, b"ping");
        assert_eq!(read_tcp(&mut peer, &mut rbuf).unwrap(), 4);
        assert_eq!(&rbuf[..4], b"ping");

        peer.is_writing = true;
        assert_eq!(read_tcp(&mut peer, &mut rbuf), Err(IoErr::Again));
        assert!(!peer.is_writing);

        close_fd(ours);
        close_fd(theirs);
    }

    #[test]
    fn test_read_tcp_close_on_fin() {
        let (ours, theirs) = pair();
        let mut peer = Peer::new(ours, false);
        let mut rbuf = [0u8; 64];

        close_fd(theirs);
        assert_eq!(read_tcp(&mut peer, &mut rbuf), Err(IoErr::ClosePeer));
        close_fd(ours);
    }

    #[test]
    fn test_write_tcp_retries_identical_suffix() {
        let (ours, theirs) = pair();
        let mut peer = Peer::new(ours, false);

        // Shrink the send buffer so a large write goes partial.
        let size: libc::c_int = 4096;
        unsafe {
            libc::setsockopt(
                ours,
                libc::SOL_SOCKET,
                libc::SO_SNDBUF,
                std::ptr::addr_of!(size).cast(),
                std::mem::size_of::<libc::c_int>() as libc::socklen_t,
            );
        }

        let wbuf = vec![0x42u8; 1 << 20];
        let mut wrote = 0usize;
        loop {
            match write_tcp(&mut peer, &wbuf) {
                Ok(()) => {
                    wrote = wbuf.len();
                    break;
                }
                Err(IoErr::Again) => {
                    assert!(peer.is_writing);
                    // Retry must pick up exactly where the last one stopped.
                    assert!(peer.old_wsize > wrote || peer.old_wsize == wrote);
                    wrote = peer.old_wsize;
                    // Drain the other end so the retry can make progress.
                    let mut sink = [0u8; 65536];
                    loop {
                        let n = unsafe {
                            libc::read(theirs, sink.as_mut_ptr().cast(), sink.len())
                        };
                        if n <= 0 {
                            break;
                        }
                    }
                }
                Err(other) => panic!("unexpected write outcome: {other:?}"),
            }
        }
        assert_eq!(wrote, wbuf.len());
        assert_eq!(peer.old_wsize, 0);

        close_fd(ours);
        close_fd(theirs);
    }

    #[test]
    fn test_mortality_walk_to_freed_slot() {
        let (ours, theirs) = pair();
        let mut peer = Peer::new(ours, false);
        let mut rbuf = [0u8; 64];

        // A FIN arrives mid-connection.
        close_fd(theirs);
        assert_eq!(read_tcp(&mut peer, &mut rbuf), Err(IoErr::ClosePeer));
        peer.mortality = Mortality::ShutdownWrite;

        // One TCP pass: SHUT_WR succeeds, the pending FIN completes the
        // read side, the socket is closed and the slot is free.
        assert_eq!(handle_tcp(&mut peer, &mut rbuf).unwrap(), TcpOutcome::Freed);
        assert_eq!(peer.mortality, Mortality::Dead);
    }

    #[test]
    fn test_shutdown_read_waits_for_fin() {
        let (ours, theirs) = pair();
        let mut peer = Peer::new(ours, false);
        let mut rbuf = [0u8; 64];

        peer.mortality = Mortality::ShutdownWrite;
        // The peer is still there: our FIN goes out, theirs has not arrived.
        assert_eq!(
            handle_tcp(&mut peer, &mut rbuf).unwrap(),
            TcpOutcome::Pending
        );
        assert_eq!(peer.mortality, Mortality::ShutdownRead);

        // Late bytes from the peer are discarded, then its FIN lands.
        send_all(theirs, b"too late");
        close_fd(theirs);
        assert_eq!(handle_tcp(&mut peer, &mut rbuf).unwrap(), TcpOutcome::Freed);
        assert_eq!(peer.mortality, Mortality::Dead);
    }

    #[test]
    fn test_live_peer_promotes_by_encryption() {
        let (ours, theirs) = pair();
        let mut rbuf = [0u8; 8];

        let mut plain = Peer::new(ours, false);
        assert_eq!(
            handle_tcp(&mut plain, &mut rbuf).unwrap(),
            TcpOutcome::Promoted
        );
        assert_eq!(plain.layer, Layer::Http);

        let mut enc = Peer::new(theirs, true);
        assert_eq!(
            handle_tcp(&mut enc, &mut rbuf).unwrap(),
            TcpOutcome::Promoted
        );
        assert_eq!(enc.layer, Layer::Tls);

        close_fd(ours);
        close_fd(theirs);
    }
}
