use crate::http::{handle_http, Endpoint};
use crate::peer::{Layer, Mortality, Peer};
use crate::tcp::{handle_tcp, TcpOutcome};
use crate::tls::{flush_pending, handle_tls, queue_close_notify};
use crate::ws::handle_ws;
use log::{debug, error, warn};
use ringws::record::{
    decode_outbound, write_inbound_header, EventKind, OutboundKind, INBOUND_HEADER_SIZE,
};
use ringws::{IoErr, IoResult, RingConsumer, RingProducer, RingUpdateQueue, WakePort};
use slab::Slab;
use std::net::TcpListener;
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::Arc;

/// epoll token of the shared listening socket.
const TOKEN_LISTENER: u64 = u64::MAX;
/// epoll token of this worker's own eventfd doorbell.
const TOKEN_WAKE: u64 = u64::MAX - 1;

/// Socket read scratch, reused across peers within one readiness epoch.
const READ_BUF_SIZE: usize = 1 << 16;

/// How many readiness events one `epoll_wait` may hand back.
const EPOLL_BATCH: usize = 256;

/// The worker side of the inbound rings: publishes lifecycle and message
/// events toward the apps, one producer per app, updates batched on the
/// worker's queue.
pub struct InboundPublisher<'a> {
    pub inbound: &'a mut [RingProducer],
    pub queue: &'a mut RingUpdateQueue,
    pub app_wakes: &'a [Arc<WakePort>],
}

impl InboundPublisher<'_> {
    /// Publishes one event record to `app_i`'s ring and queues the cursor
    /// update (with wake) for the end-of-batch flush.
    pub fn publish(
        &mut self,
        app_i: usize,
        kind: EventKind,
        peer_i: u32,
        payload: &[u8],
    ) -> IoResult {
        let producer = &mut self.inbound[app_i];
        let size = INBOUND_HEADER_SIZE + payload.len();
        let region = producer.reserve(size);
        write_inbound_header(region, kind, peer_i);
        region[INBOUND_HEADER_SIZE..].copy_from_slice(payload);
        producer.commit(size);

        let shared = Arc::clone(producer.shared());
        let cursor = producer.writer_pos();
        self.queue
            .enqueue_writer(&shared, cursor, &self.app_wakes[app_i])
    }
}

/// One socket I/O thread: owns its epoll set, its peers, the producing half
/// of every inbound ring toward the apps, and the consuming half of every
/// outbound ring from the apps.
pub struct Worker {
    worker_i: u32,
    epoll_fd: RawFd,
    listener: TcpListener,
    peers: Slab<Peer>,
    inbound: Vec<RingProducer>,
    outbound: Vec<RingConsumer>,
    queue: RingUpdateQueue,
    app_wakes: Vec<Arc<WakePort>>,
    wake: Arc<WakePort>,
    endpoints: Arc<Vec<Endpoint>>,
    tls_config: Option<Arc<rustls::ServerConfig>>,
    max_ws_msg_size: usize,
    rbuf: Vec<u8>,
}

fn epoll_add(epoll_fd: RawFd, fd: RawFd, token: u64, events: u32) -> IoResult {
    let mut event = libc::epoll_event { events, u64: token };
    // SAFETY: event is a valid epoll_event for the duration of the call.
    if unsafe { libc::epoll_ctl(epoll_fd, libc::EPOLL_CTL_ADD, fd, &mut event) } == -1 {
        error!(
            "epoll_ctl(ADD, {}) failed: {}",
            fd,
            std::io::Error::last_os_error()
        );
        return Err(IoErr::Fatal);
    }
    Ok(())
}

impl Worker {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        worker_i: u32,
        listener: TcpListener,
        inbound: Vec<RingProducer>,
        outbound: Vec<RingConsumer>,
        update_queue_size: usize,
        app_wakes: Vec<Arc<WakePort>>,
        wake: Arc<WakePort>,
        endpoints: Arc<Vec<Endpoint>>,
        tls_config: Option<Arc<rustls::ServerConfig>>,
        max_ws_msg_size: usize,
    ) -> IoResult<Self> {
        // SAFETY: plain syscall.
        let epoll_fd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if epoll_fd == -1 {
            error!(
                "epoll_create1 failed: {}",
                std::io::Error::last_os_error()
            );
            return Err(IoErr::Fatal);
        }
        listener.set_nonblocking(true).map_err(|e| {
            error!("failed to make listener non-blocking: {e}");
            IoErr::Fatal
        })?;
        epoll_add(
            epoll_fd,
            listener.as_raw_fd(),
            TOKEN_LISTENER,
            libc::EPOLLIN as u32,
        )?;
        epoll_add(
            epoll_fd,
            wake.eventfd.as_raw_fd(),
            TOKEN_WAKE,
            libc::EPOLLIN as u32,
        )?;
        Ok(Self {
            worker_i,
            epoll_fd,
            listener,
            peers: Slab::new(),
            inbound,
            outbound,
            queue: RingUpdateQueue::new(update_queue_size),
            app_wakes,
            wake,
            endpoints,
            tls_config,
            max_ws_msg_size,
            rbuf: vec![0; READ_BUF_SIZE],
        })
    }

    /// The worker's readiness loop. Only returns on a fatal error.
    pub fn run(mut self) -> IoResult {
        debug!("worker {} entering its readiness loop", self.worker_i);
        let mut events = [libc::epoll_event { events: 0, u64: 0 }; EPOLL_BATCH];
        loop {
            self.drain_outbound()?;
            // End of batch: publish every cursor moved this epoch.
            self.queue.flush()?;

            let timeout = self.park_timeout();
            // SAFETY: events is a live array of EPOLL_BATCH entries.
            let n = unsafe {
                libc::epoll_wait(
                    self.epoll_fd,
                    events.as_mut_ptr(),
                    EPOLL_BATCH as i32,
                    timeout,
                )
            };
            self.wake.sleep.cancel_park();
            if n == -1 {
                let err = std::io::Error::last_os_error();
                if err.raw_os_error() == Some(libc::EINTR) {
                    continue;
                }
                error!("epoll_wait failed: {err}");
                return Err(IoErr::Fatal);
            }

            for event in &events[..n as usize] {
                match event.u64 {
                    TOKEN_LISTENER => self.accept_new()?,
                    TOKEN_WAKE => self.wake.eventfd.drain()?,
                    token => {
                        let peer_i = token as usize;
                        // The slot may have died earlier in this very batch.
                        if self.peers.contains(peer_i) {
                            self.drive_peer(peer_i)?;
                        }
                    }
                }
            }
        }
    }

    /// The park protocol around `epoll_wait`: advertise the sleep, then
    /// re-check the rings to close the lost-wakeup window. Block only if
    /// they are still empty.
    fn park_timeout(&mut self) -> i32 {
        self.wake.sleep.prepare_park();
        if self.outbound.iter().any(|c| !c.is_empty()) {
            self.wake.sleep.cancel_park();
            0
        } else {
            -1
        }
    }

    /// Accepts until the listener would block. Peers enter at the TCP layer
    /// and are promoted on their first readiness event.
    fn accept_new(&mut self) -> IoResult {
        loop {
            // SAFETY: plain syscall; we pass no address buffers.
            let fd = unsafe {
                libc::accept4(
                    self.listener.as_raw_fd(),
                    std::ptr::null_mut(),
                    std::ptr::null_mut(),
                    libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
                )
            };
            if fd == -1 {
                let err = std::io::Error::last_os_error();
                return match err.raw_os_error() {
                    Some(libc::EAGAIN) => Ok(()),
                    // Another worker won the race, or the peer gave up
                    // before we got here.
                    Some(libc::EINTR) | Some(libc::ECONNABORTED) => continue,
                    _ => {
                        warn!("accept4 failed: {err}");
                        Ok(())
                    }
                };
            }
            let peer_i = self.peers.insert(Peer::new(fd, self.tls_config.is_some()));
            epoll_add(
                self.epoll_fd,
                fd,
                peer_i as u64,
                (libc::EPOLLIN | libc::EPOLLOUT | libc::EPOLLET | libc::EPOLLRDHUP) as u32,
            )?;
            debug!(
                "worker {} accepted fd {} into slot {}",
                self.worker_i, fd, peer_i
            );
        }
    }

    /// Dispatches one ready peer through its current layer until it blocks,
    /// dies, or finishes its setup/teardown transitions.
    fn drive_peer(&mut self, peer_i: usize) -> IoResult {
        let Self {
            peers,
            inbound,
            outbound: _,
            queue,
            app_wakes,
            endpoints,
            tls_config,
            max_ws_msg_size,
            rbuf,
            ..
        } = self;
        let mut publisher = InboundPublisher {
            inbound,
            queue,
            app_wakes,
        };

        loop {
            let Some(peer) = peers.get_mut(peer_i) else {
                return Ok(());
            };

            // Parked outbound bytes go first: the readiness that woke us may
            // be the write side reopening. A dying peer's parked bytes are
            // abandoned; the shutdown sequence owns the socket now.
            if peer.mortality == Mortality::Live {
                match flush_pending(peer) {
                    Ok(()) | Err(IoErr::Again) => {}
                    Err(IoErr::ClosePeer) => {
                        escalate(peer, &mut publisher, peer_i)?;
                        continue;
                    }
                    Err(IoErr::Fatal) => return Err(IoErr::Fatal),
                }
            }

            let result = match peer.layer {
                Layer::Tcp => match handle_tcp(peer, rbuf)? {
                    TcpOutcome::Promoted => continue,
                    TcpOutcome::Pending => return Ok(()),
                    TcpOutcome::Freed => {
                        peers.remove(peer_i);
                        return Ok(());
                    }
                },
                Layer::Tls => {
                    let config = tls_config
                        .as_ref()
                        .expect("encrypted peer on a worker without TLS config");
                    handle_tls(peer, config)
                }
                Layer::Http => match handle_http(peer, rbuf, endpoints) {
                    Ok(app_i) => {
                        peer.app_knows = true;
                        let slot = peer_i as u32;
                        publisher.publish(app_i, EventKind::Open, slot, &[])?;
                        continue;
                    }
                    Err(e) => Err(e),
                },
                Layer::Ws => handle_ws(peer, peer_i as u32, rbuf, &mut publisher, *max_ws_msg_size),
            };

            match result {
                Ok(()) => continue,
                Err(IoErr::Again) => return Ok(()),
                Err(IoErr::ClosePeer) => {
                    escalate(peer, &mut publisher, peer_i)?;
                    // Loop: the TCP layer walks the shutdown right away.
                }
                Err(IoErr::Fatal) => return Err(IoErr::Fatal),
            }
        }
    }

    /// Drains every app's outbound ring, resolving each record's addressing
    /// against this worker's peer table and writing frames out.
    fn drain_outbound(&mut self) -> IoResult {
        let Self {
            worker_i,
            peers,
            inbound,
            outbound,
            queue,
            app_wakes,
            rbuf,
            ..
        } = self;

        let mut dying: Vec<usize> = Vec::new();
        for consumer in outbound.iter_mut() {
            let mut drained = false;
            while let Some(record) = consumer.next_record() {
                drained = true;
                let Some(msg) = decode_outbound(record) else {
                    error!("worker {worker_i}: malformed outbound record");
                    return Err(IoErr::Fatal);
                };
                match msg.kind {
                    OutboundKind::Single | OutboundKind::Array => {
                        for recipient in msg.recipients() {
                            let slot = recipient as usize;
                            match peers.get_mut(slot) {
                                Some(peer) if peer.is_ws_live() => {
                                    deliver_frame(peer, msg.frame, slot, &mut dying);
                                }
                                _ => {
                                    // The peer died between the app's send
                                    // and this drain; nothing to deliver to.
                                    debug!(
                                        "worker {worker_i}: dropping frame for dead slot {slot}"
                                    );
                                }
                            }
                        }
                    }
                    OutboundKind::Every => {
                        for (slot, peer) in peers.iter_mut() {
                            if peer.is_ws_live() {
                                deliver_frame(peer, msg.frame, slot, &mut dying);
                            }
                        }
                    }
                    OutboundKind::EveryExceptSingle | OutboundKind::EveryExceptArray => {
                        for (slot, peer) in peers.iter_mut() {
                            if peer.is_ws_live() && !msg.lists(slot as u32) {
                                deliver_frame(peer, msg.frame, slot, &mut dying);
                            }
                        }
                    }
                }
            }
            if drained {
                let shared = Arc::clone(consumer.shared());
                queue.enqueue_reader(&shared, consumer.reader_pos())?;
            }
        }

        // Walk the teardown of peers whose sockets failed mid-delivery.
        let mut publisher = InboundPublisher {
            inbound,
            queue,
            app_wakes,
        };
        for peer_i in dying {
            let Some(peer) = peers.get_mut(peer_i) else {
                continue;
            };
            escalate(peer, &mut publisher, peer_i)?;
            if handle_tcp(peer, rbuf)? == TcpOutcome::Freed {
                peers.remove(peer_i);
            }
        }
        Ok(())
    }
}

/// Writes one framed message to a peer, marking it dying on a socket
/// failure. Would-block outcomes were already absorbed by parking.
fn deliver_frame(peer: &mut Peer, frame: &[u8], slot: usize, dying: &mut Vec<usize>) {
    if let Err(e) = crate::tls::send_or_park(peer, frame) {
        debug!("slot {slot}: outbound write failed ({e}), closing");
        // Stop addressing it within this drain; the teardown follows.
        peer.mortality = Mortality::ShutdownWrite;
        peer.layer = Layer::Tcp;
        dying.push(slot);
    }
}

/// Escalates a peer's mortality: the app gets its close event (once), TLS
/// peers get a close_notify, and the layer drops to TCP so remaining bytes
/// are drained and discarded by the shutdown reads.
fn escalate(peer: &mut Peer, publisher: &mut InboundPublisher<'_>, peer_i: usize) -> IoResult {
    if peer.mortality == Mortality::Live {
        peer.mortality = Mortality::ShutdownWrite;
    }
    if peer.app_knows {
        peer.app_knows = false;
        publisher.publish(peer.app_i, EventKind::Close, peer_i as u32, &[])?;
    }
    if peer.tls.is_some() {
        queue_close_notify(peer);
    }
    peer.layer = Layer::Tcp;
    Ok(())
}

impl Drop for Worker {
    fn drop(&mut self) {
        for (_, peer) in &self.peers {
            // SAFETY: each peer fd is owned by this worker and closed once.
            unsafe { libc::close(peer.fd) };
        }
        // SAFETY: epoll fd owned by this worker.
        unsafe { libc::close(self.epoll_fd) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ringws::ring::ring;

    fn publisher_fixture() -> (Vec<RingProducer>, Vec<RingConsumer>, RingUpdateQueue, Vec<Arc<WakePort>>)
    {
        let (producer, consumer) = ring(4096, 2, 64);
        (
            vec![producer],
            vec![consumer],
            RingUpdateQueue::new(8),
            vec![Arc::new(WakePort::new(true).unwrap())],
        )
    }

    #[test]
    fn test_publisher_emits_decodable_events() {
        let (mut inbound, mut consumers, mut queue, app_wakes) = publisher_fixture();
        {
            let mut publisher = InboundPublisher {
                inbound: &mut inbound,
                queue: &mut queue,
                app_wakes: &app_wakes,
            };
            publisher
                .publish(0, EventKind::Text, 7, b"hi")
                .unwrap();
            publisher.queue.flush().unwrap();
        }

        let record = consumers[0].next_record().unwrap();
        let event = ringws::record::decode_inbound(record).unwrap();
        assert_eq!(event.kind, EventKind::Text);
        assert_eq!(event.peer_i, 7);
        assert_eq!(event.payload, b"hi");
    }

    #[test]
    fn test_escalate_reports_close_exactly_once() {
        let (mut inbound, mut consumers, mut queue, app_wakes) = publisher_fixture();
        let mut peer = Peer::new(-1, false);
        peer.layer = Layer::Ws;
        peer.app_knows = true;

        {
            let mut publisher = InboundPublisher {
                inbound: &mut inbound,
                queue: &mut queue,
                app_wakes: &app_wakes,
            };
            escalate(&mut peer, &mut publisher, 3).unwrap();
            assert_eq!(peer.mortality, Mortality::ShutdownWrite);
            assert_eq!(peer.layer, Layer::Tcp);

            // A second escalation must not emit another close event.
            escalate(&mut peer, &mut publisher, 3).unwrap();
            publisher.queue.flush().unwrap();
        }

        let record = consumers[0].next_record().unwrap();
        let event = ringws::record::decode_inbound(record).unwrap();
        assert_eq!(event.kind, EventKind::Close);
        assert_eq!(event.peer_i, 3);
        assert!(consumers[0].next_record().is_none());
    }
}
