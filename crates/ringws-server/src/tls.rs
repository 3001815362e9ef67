use crate::peer::{Layer, Peer};
use crate::tcp::{read_tcp, write_tcp};
use log::{debug, warn};
use ringws::{IoErr, IoResult};
use std::io::{self, BufReader, Read, Write};
use std::os::unix::io::RawFd;
use std::sync::Arc;

/// `io::Read`/`io::Write` over a raw non-blocking fd, for feeding rustls.
struct FdIo(RawFd);

impl Read for FdIo {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        // SAFETY: buf is a live, writable buffer of the given length.
        let ret = unsafe { libc::read(self.0, buf.as_mut_ptr().cast(), buf.len()) };
        if ret >= 0 {
            Ok(ret as usize)
        } else {
            Err(io::Error::last_os_error())
        }
    }
}

impl Write for FdIo {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        // SAFETY: buf is a live buffer of the given length.
        let ret = unsafe { libc::write(self.0, buf.as_ptr().cast(), buf.len()) };
        if ret >= 0 {
            Ok(ret as usize)
        } else {
            Err(io::Error::last_os_error())
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Reads decrypted bytes for an established session, mapping the TLS
/// library's want-read to `Again` with the matching direction bookkeeping.
fn read_tls_plain(peer: &mut Peer, buf: &mut [u8]) -> IoResult<usize> {
    loop {
        let conn = peer.tls.as_mut().expect("tls session missing");
        match conn.reader().read(buf) {
            Ok(0) => {
                debug!("fd {}: close_notify from peer", peer.fd);
                return Err(IoErr::ClosePeer);
            }
            Ok(n) => return Ok(n),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
            Err(e) => {
                warn!("fd {}: tls plaintext read failed: {}", peer.fd, e);
                return Err(IoErr::ClosePeer);
            }
        }
        pump_tls_reads(peer)?;
    }
}

/// Writes the `[old_wsize..]` suffix of `wbuf` through the session, with the
/// same complete-write contract as `write_tcp`: callers must retry with the
/// byte-identical buffer, so the session always resumes from the same
/// plaintext.
fn write_tls_plain(peer: &mut Peer, wbuf: &[u8]) -> IoResult {
    debug_assert!(peer.old_wsize <= wbuf.len());
    if peer.old_wsize < wbuf.len() {
        let conn = peer.tls.as_mut().expect("tls session missing");
        match conn.writer().write(&wbuf[peer.old_wsize..]) {
            Ok(n) => peer.old_wsize += n,
            Err(e) => {
                warn!("fd {}: tls plaintext write failed: {}", peer.fd, e);
                return Err(IoErr::ClosePeer);
            }
        }
    }
    flush_tls_writes(peer)?;
    if peer.old_wsize < wbuf.len() {
        // The session throttled the plaintext; resume from the same buffer.
        peer.is_writing = true;
        return Err(IoErr::Again);
    }
    peer.old_wsize = 0;
    Ok(())
}

/// Pushes buffered TLS records out to the socket until the session has
/// nothing more to send.
fn flush_tls_writes(peer: &mut Peer) -> IoResult {
    let fd = peer.fd;
    let Some(conn) = peer.tls.as_mut() else {
        return Ok(());
    };
    while conn.wants_write() {
        match conn.write_tls(&mut FdIo(fd)) {
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                peer.is_writing = true;
                return Err(IoErr::Again);
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => {
                warn!("fd {}: tls record write failed: {}", peer.fd, e);
                return Err(IoErr::ClosePeer);
            }
        }
    }
    Ok(())
}

/// Pulls TLS records from the socket into the session and processes them.
fn pump_tls_reads(peer: &mut Peer) -> IoResult {
    let fd = peer.fd;
    let conn = peer.tls.as_mut().expect("tls session missing");
    match conn.read_tls(&mut FdIo(fd)) {
        Ok(0) => {
            debug!("fd {}: EOF under a TLS session", peer.fd);
            Err(IoErr::ClosePeer)
        }
        Ok(_) => match conn.process_new_packets() {
            Ok(_) => Ok(()),
            Err(e) => {
                warn!("fd {}: tls protocol error: {}", peer.fd, e);
                // Best effort: the session has queued a fatal alert.
                let _ = conn.write_tls(&mut FdIo(fd));
                Err(IoErr::ClosePeer)
            }
        },
        Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
            peer.is_writing = false;
            Err(IoErr::Again)
        }
        Err(e) if e.kind() == io::ErrorKind::Interrupted => Ok(()),
        Err(e) => {
            warn!("fd {}: tls record read failed: {}", peer.fd, e);
            Err(IoErr::ClosePeer)
        }
    }
}

/// The TLS-layer dispatcher: creates the session on first entry and drives
/// the handshake; once it completes, the peer climbs to the HTTP layer.
pub fn handle_tls(peer: &mut Peer, tls_config: &Arc<rustls::ServerConfig>) -> IoResult {
    if peer.tls.is_none() {
        match rustls::ServerConnection::new(Arc::clone(tls_config)) {
            Ok(conn) => peer.tls = Some(Box::new(conn)),
            Err(e) => {
                warn!("fd {}: tls session setup failed: {}", peer.fd, e);
                return Err(IoErr::ClosePeer);
            }
        }
    }
    loop {
        flush_tls_writes(peer)?;
        let conn = peer.tls.as_mut().expect("tls session missing");
        if !conn.is_handshaking() {
            peer.layer = Layer::Http;
            return Ok(());
        }
        if conn.wants_read() {
            pump_tls_reads(peer)?;
        }
    }
}

/// Queues a close_notify alert and tries to flush it. Called when the close
/// sequence starts on an encrypted peer; failures don't matter anymore.
pub fn queue_close_notify(peer: &mut Peer) {
    let fd = peer.fd;
    if let Some(conn) = peer.tls.as_mut() {
        conn.send_close_notify();
        let _ = conn.write_tls(&mut FdIo(fd));
    }
}

/// Reads decrypted or plain bytes, whichever this peer's transport carries.
pub fn read_transport(peer: &mut Peer, buf: &mut [u8]) -> IoResult<usize> {
    if peer.tls.is_some() {
        read_tls_plain(peer, buf)
    } else {
        read_tcp(peer, buf)
    }
}

/// Writes through the peer's transport with the complete-write contract of
/// `write_tcp`.
pub fn write_transport(peer: &mut Peer, buf: &[u8]) -> IoResult {
    if peer.tls.is_some() {
        write_tls_plain(peer, buf)
    } else {
        write_tcp(peer, buf)
    }
}

/// Sends `bytes` through the peer's transport, parking whatever would block
/// in the peer's pending buffer. Parked bytes go out on the next writable
/// event; the pending buffer is stable, so write retries resume over the
/// identical prefix.
pub fn send_or_park(peer: &mut Peer, bytes: &[u8]) -> IoResult {
    if !peer.pending_out.is_empty() {
        peer.pending_out.extend_from_slice(bytes);
        return match flush_pending(peer) {
            Err(IoErr::Again) => Ok(()),
            other => other,
        };
    }
    match write_transport(peer, bytes) {
        Ok(()) => Ok(()),
        Err(IoErr::Again) => {
            peer.pending_out.extend_from_slice(bytes);
            Ok(())
        }
        Err(e) => Err(e),
    }
}

/// Retries the peer's parked outbound bytes. `Again` means some still
/// remain; `Ok` means the buffer drained completely.
pub fn flush_pending(peer: &mut Peer) -> IoResult {
    if peer.pending_out.is_empty() {
        return Ok(());
    }
    let parked = std::mem::take(&mut peer.pending_out);
    match write_transport(peer, &parked) {
        Ok(()) => Ok(()),
        Err(e) => {
            peer.pending_out = parked;
            Err(e)
        }
    }
}

/// Loads the certificate chain and private key for encrypted listeners.
pub fn load_tls_config(cert_path: &str, key_path: &str) -> IoResult<Arc<rustls::ServerConfig>> {
    let certs = (|| -> io::Result<Vec<_>> {
        let mut reader = BufReader::new(std::fs::File::open(cert_path)?);
        rustls_pemfile::certs(&mut reader).collect()
    })()
    .map_err(|e| {
        warn!("failed to read certificate chain {cert_path}: {e}");
        IoErr::Fatal
    })?;

    let key = (|| -> io::Result<_> {
        let mut reader = BufReader::new(std::fs::File::open(key_path)?);
        rustls_pemfile::private_key(&mut reader)
    })()
    .map_err(|e| {
        warn!("failed to read private key {key_path}: {e}");
        IoErr::Fatal
    })?
    .ok_or_else(|| {
        warn!("no private key found in {key_path}");
        IoErr::Fatal
    })?;

    let config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| {
            warn!("tls config rejected: {e}");
            IoErr::Fatal
        })?;
    Ok(Arc::new(config))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fd_io_round_trip() {
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

        let mut a = FdIo(fds[0]);
        let mut b = FdIo(fds[1]);
        assert_eq!(a.write(b"abc").unwrap(), 3);
        let mut buf = [0u8; 8];
        assert_eq!(b.read(&mut buf).unwrap(), 3);
        assert_eq!(&buf[..3], b"abc");

        // Empty non-blocking socket surfaces WouldBlock, which the layer
        // maps to the would-block result kind.
        let err = b.read(&mut buf).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::WouldBlock);

        unsafe {
            libc::close(fds[0]);
            libc::close(fds[1]);
        }
    }

    #[test]
    fn test_missing_cert_files_are_fatal() {
        assert_eq!(
            load_tls_config("/nonexistent/cert.pem", "/nonexistent/key.pem").err(),
            Some(IoErr::Fatal)
        );
    }
}
