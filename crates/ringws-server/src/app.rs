use log::{debug, error};
use ringws::record::{
    decode_inbound, outbound_record_size, write_outbound_header, write_ws_header, EventKind,
    OutboundKind,
};
use ringws::{
    monotonic_ms, ClientId, Config, IoErr, IoResult, RingConsumer, RingProducer, RingUpdateQueue,
    WakePort,
};
use std::sync::Arc;

/// User callbacks of one app. Each app runs on its own thread; the runtime
/// hands every callback a context wired to the current peer and to every
/// worker's outbound ring.
pub trait AppHandler: Send {
    /// A peer completed its handshake on this app's endpoint.
    fn on_open(&mut self, ctx: &mut AppCtx<'_>) -> IoResult {
        let _ = ctx;
        Ok(())
    }

    /// A complete message arrived. `is_utf8` distinguishes text from binary.
    fn on_message(&mut self, ctx: &mut AppCtx<'_>, payload: &[u8], is_utf8: bool) -> IoResult;

    /// The peer is gone. Its client id must not be addressed again.
    fn on_close(&mut self, ctx: &mut AppCtx<'_>) -> IoResult {
        let _ = ctx;
        Ok(())
    }
}

/// What a callback sees: the peer the current event came from, the scratch
/// buffer, and the send primitives.
///
/// A message is built as zero or more scratch appends followed by exactly
/// one send primitive; every primitive appends the scratch bytes, then its
/// `payload` argument, frames the result once per target worker ring, and
/// resets the scratch. An oversize send is fatal and leaves the scratch
/// untouched.
pub struct AppCtx<'a> {
    outbound: &'a mut [RingProducer],
    queue: &'a mut RingUpdateQueue,
    worker_wakes: &'a [Arc<WakePort>],
    scratch: &'a mut Vec<u8>,
    conf: &'a Config,
    cur_worker: u32,
    cur_peer: u32,
}

impl AppCtx<'_> {
    /// The client the current event came from.
    #[inline]
    pub fn cur_client(&self) -> ClientId {
        ClientId::pack(self.cur_worker, self.cur_peer)
    }

    /// Monotonic milliseconds, for app-level timeout bookkeeping.
    pub fn now_ms(&self) -> IoResult<u64> {
        monotonic_ms()
    }

    // -------------------------------------------------------------------
    // Scratch buffer appenders
    // -------------------------------------------------------------------

    /// Grows the scratch so `incr` more bytes fit, scaled by the configured
    /// growth factor so repeated appends stay amortized.
    fn grow_scratch(&mut self, incr: usize) {
        let needed = self.scratch.len() + incr;
        if needed > self.scratch.capacity() {
            let target = self.conf.realloc_multiplier * needed;
            self.scratch.reserve_exact(target - self.scratch.len());
        }
    }

    /// Appends raw bytes to the scratch buffer.
    pub fn w_bytes(&mut self, bytes: &[u8]) {
        self.grow_scratch(bytes.len());
        self.scratch.extend_from_slice(bytes);
    }

    /// Appends a `u8`.
    pub fn w_u8(&mut self, v: u8) {
        self.grow_scratch(1);
        self.scratch.push(v);
    }

    /// Appends a `u16` in host byte order.
    pub fn w_u16(&mut self, v: u16) {
        self.w_bytes(&v.to_ne_bytes());
    }

    /// Appends a `u32` in host byte order.
    pub fn w_u32(&mut self, v: u32) {
        self.w_bytes(&v.to_ne_bytes());
    }

    /// Appends a `u64` in host byte order.
    pub fn w_u64(&mut self, v: u64) {
        self.w_bytes(&v.to_ne_bytes());
    }

    /// Appends a `u16` in network byte order.
    pub fn w_u16_hton(&mut self, v: u16) {
        self.w_bytes(&v.to_be_bytes());
    }

    /// Appends a `u32` in network byte order.
    pub fn w_u32_hton(&mut self, v: u32) {
        self.w_bytes(&v.to_be_bytes());
    }

    /// Appends a `u64` in network byte order.
    pub fn w_u64_hton(&mut self, v: u64) {
        self.w_bytes(&v.to_be_bytes());
    }

    /// Appends an `i8`.
    pub fn w_i8(&mut self, v: i8) {
        self.w_u8(v as u8);
    }

    /// Appends an `i16` in host byte order.
    pub fn w_i16(&mut self, v: i16) {
        self.w_u16(v as u16);
    }

    /// Appends an `i32` in host byte order.
    pub fn w_i32(&mut self, v: i32) {
        self.w_u32(v as u32);
    }

    /// Appends an `i64` in host byte order.
    pub fn w_i64(&mut self, v: i64) {
        self.w_u64(v as u64);
    }

    // -------------------------------------------------------------------
    // Send primitives
    // -------------------------------------------------------------------

    /// Sends to one client.
    pub fn to_single(&mut self, is_utf8: bool, client: ClientId, payload: &[u8]) -> IoResult {
        self.send(
            client.worker_i() as usize,
            OutboundKind::Single,
            &[client.peer_i()],
            is_utf8,
            payload,
        )?;
        self.scratch.clear();
        Ok(())
    }

    /// Sends to a set of clients, partitioned per worker.
    pub fn to_multi(&mut self, is_utf8: bool, clients: &[ClientId], payload: &[u8]) -> IoResult {
        for worker_i in 0..self.conf.worker_c {
            let peers: Vec<u32> = clients
                .iter()
                .filter(|c| c.worker_i() as usize == worker_i)
                .map(|c| c.peer_i())
                .collect();
            match peers.len() {
                0 => {}
                1 => self.send(worker_i, OutboundKind::Single, &peers, is_utf8, payload)?,
                _ => self.send(worker_i, OutboundKind::Array, &peers, is_utf8, payload)?,
            }
        }
        self.scratch.clear();
        Ok(())
    }

    /// Sends to the client the current event came from.
    pub fn to_cur(&mut self, is_utf8: bool, payload: &[u8]) -> IoResult {
        self.to_single(is_utf8, self.cur_client(), payload)
    }

    /// Sends to every connected client of every worker.
    pub fn to_every(&mut self, is_utf8: bool, payload: &[u8]) -> IoResult {
        for worker_i in 0..self.conf.worker_c {
            self.send(worker_i, OutboundKind::Every, &[], is_utf8, payload)?;
        }
        self.scratch.clear();
        Ok(())
    }

    /// Sends to everyone except one client.
    pub fn to_every_except_single(
        &mut self,
        is_utf8: bool,
        except: ClientId,
        payload: &[u8],
    ) -> IoResult {
        for worker_i in 0..self.conf.worker_c {
            if worker_i == except.worker_i() as usize {
                self.send(
                    worker_i,
                    OutboundKind::EveryExceptSingle,
                    &[except.peer_i()],
                    is_utf8,
                    payload,
                )?;
            } else {
                self.send(worker_i, OutboundKind::Every, &[], is_utf8, payload)?;
            }
        }
        self.scratch.clear();
        Ok(())
    }

    /// Sends to everyone except a set of clients.
    pub fn to_every_except_multi(
        &mut self,
        is_utf8: bool,
        except: &[ClientId],
        payload: &[u8],
    ) -> IoResult {
        for worker_i in 0..self.conf.worker_c {
            let peers: Vec<u32> = except
                .iter()
                .filter(|c| c.worker_i() as usize == worker_i)
                .map(|c| c.peer_i())
                .collect();
            match peers.len() {
                0 => self.send(worker_i, OutboundKind::Every, &[], is_utf8, payload)?,
                1 => self.send(
                    worker_i,
                    OutboundKind::EveryExceptSingle,
                    &peers,
                    is_utf8,
                    payload,
                )?,
                _ => self.send(
                    worker_i,
                    OutboundKind::EveryExceptArray,
                    &peers,
                    is_utf8,
                    payload,
                )?,
            }
        }
        self.scratch.clear();
        Ok(())
    }

    /// Sends to everyone except the client the current event came from.
    pub fn to_every_except_cur(&mut self, is_utf8: bool, payload: &[u8]) -> IoResult {
        self.to_every_except_single(is_utf8, self.cur_client(), payload)
    }

    /// Frames `scratch ++ payload` once into one worker's outbound ring.
    ///
    /// The scratch is deliberately left alone here — the per-kind wrappers
    /// clear it after all per-worker sends of one logical message, and an
    /// oversize send must leave it inspectable.
    fn send(
        &mut self,
        worker_i: usize,
        kind: OutboundKind,
        recipients: &[u32],
        is_utf8: bool,
        payload: &[u8],
    ) -> IoResult {
        let payload_size = self.scratch.len() + payload.len();
        if payload_size > self.conf.max_ws_msg_size {
            error!(
                "send of {} bytes exceeds max_ws_msg_size {}",
                payload_size, self.conf.max_ws_msg_size
            );
            return Err(IoErr::Fatal);
        }

        let record_size = outbound_record_size(kind, recipients.len(), payload_size);
        let producer = &mut self.outbound[worker_i];
        let region = producer.reserve(record_size);
        let mut at = write_outbound_header(region, kind, recipients);
        at += write_ws_header(&mut region[at..], is_utf8, payload_size);
        region[at..at + self.scratch.len()].copy_from_slice(self.scratch);
        at += self.scratch.len();
        region[at..at + payload.len()].copy_from_slice(payload);
        producer.commit(record_size);

        let shared = Arc::clone(producer.shared());
        let cursor = producer.writer_pos();
        self.queue
            .enqueue_writer(&shared, cursor, &self.worker_wakes[worker_i])
    }
}

/// One app thread: consumes the inbound rings of every worker round-robin
/// and runs the user callbacks.
pub struct AppRuntime {
    name: String,
    inbound: Vec<RingConsumer>,
    outbound: Vec<RingProducer>,
    queue: RingUpdateQueue,
    worker_wakes: Vec<Arc<WakePort>>,
    wake: Arc<WakePort>,
    scratch: Vec<u8>,
    conf: Arc<Config>,
}

impl AppRuntime {
    pub fn new(
        name: String,
        inbound: Vec<RingConsumer>,
        outbound: Vec<RingProducer>,
        worker_wakes: Vec<Arc<WakePort>>,
        wake: Arc<WakePort>,
        conf: Arc<Config>,
    ) -> Self {
        let queue = RingUpdateQueue::new(conf.update_queue_size);
        Self {
            name,
            inbound,
            outbound,
            queue,
            worker_wakes,
            wake,
            scratch: Vec::new(),
            conf,
        }
    }

    /// The app's drain loop. Every pass visits every worker's ring, so no
    /// ring can be starved while another has data. Only returns on a fatal
    /// error.
    pub fn run(mut self, handler: &mut dyn AppHandler) -> IoResult {
        debug!("app {} entering its drain loop", self.name);
        loop {
            loop {
                let drained = self.drain_pass(handler)?;
                if drained == 0 {
                    break;
                }
            }

            // Park protocol: advertise the sleep, re-check every ring, and
            // only then block on the doorbell.
            self.wake.sleep.prepare_park();
            if self.inbound.iter().any(|c| !c.is_empty()) {
                self.wake.sleep.cancel_park();
                continue;
            }
            self.wake.eventfd.wait()?;
            self.wake.sleep.cancel_park();
        }
    }

    /// One round-robin pass over all worker rings. Returns the number of
    /// events dispatched.
    fn drain_pass(&mut self, handler: &mut dyn AppHandler) -> IoResult<usize> {
        let Self {
            inbound,
            outbound,
            queue,
            worker_wakes,
            scratch,
            conf,
            ..
        } = self;

        let mut dispatched = 0;
        for (worker_i, consumer) in inbound.iter_mut().enumerate() {
            let mut drained = false;
            while let Some(record) = consumer.next_record() {
                drained = true;
                dispatched += 1;
                let Some(event) = decode_inbound(record) else {
                    error!("malformed inbound event record");
                    return Err(IoErr::Fatal);
                };

                let mut ctx = AppCtx {
                    outbound: outbound.as_mut_slice(),
                    queue: &mut *queue,
                    worker_wakes: worker_wakes.as_slice(),
                    scratch: &mut *scratch,
                    conf: &**conf,
                    cur_worker: worker_i as u32,
                    cur_peer: event.peer_i,
                };
                match event.kind {
                    EventKind::Open => handler.on_open(&mut ctx)?,
                    EventKind::Text => handler.on_message(&mut ctx, event.payload, true)?,
                    EventKind::Binary => handler.on_message(&mut ctx, event.payload, false)?,
                    EventKind::Close => handler.on_close(&mut ctx)?,
                }
                // The callback returned: flush its cursor updates and wakes.
                queue.flush()?;
            }
            if drained {
                let shared = Arc::clone(consumer.shared());
                queue.enqueue_reader(&shared, consumer.reader_pos())?;
            }
        }
        queue.flush()?;
        Ok(dispatched)
    }
}
