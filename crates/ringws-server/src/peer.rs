use std::os::unix::io::RawFd;

/// The protocol currently driving a peer's bytes.
///
/// A peer climbs Tcp → Tls (encrypted listeners only) → Http → Ws during
/// setup, and drops back to Tcp once its close sequence starts, at which
/// point incoming bytes are drained and discarded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Layer {
    Tcp,
    Tls,
    Http,
    Ws,
}

/// A peer's closure state. Transitions run strictly forward:
///
/// ```text
/// Live ── peer-initiated close or error ──► ShutdownWrite
/// ShutdownWrite ── shutdown(SHUT_WR) succeeded ──► ShutdownRead
/// ShutdownRead ── read() returned 0 ──► Dead
/// Dead ── fd closed, slot freed
/// ```
///
/// `ShutdownWrite` and `ShutdownRead` are handled in one pass: the write
/// step falls through to the read step on success, so a peer whose FIN has
/// already arrived dies on a single readiness event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Mortality {
    Live,
    ShutdownWrite,
    ShutdownRead,
    Dead,
}

/// One connected client and every scrap of its connection state.
///
/// Owned by exactly one worker; peers never migrate between workers, so
/// none of this is shared.
pub struct Peer {
    pub fd: RawFd,
    pub is_encrypted: bool,
    pub layer: Layer,
    pub mortality: Mortality,
    /// Direction of the last would-block result, for edge-triggered
    /// readiness bookkeeping: `true` means a write is what blocked.
    pub is_writing: bool,
    /// Bytes of the current outbound buffer already written. A retry must
    /// present the identical buffer so that a TLS write can resume with the
    /// same plaintext; only the `[old_wsize..]` suffix is submitted.
    pub old_wsize: usize,
    /// TLS session, present on encrypted listeners from the Tls layer on.
    pub tls: Option<Box<rustls::ServerConnection>>,
    /// The app that owns this peer's endpoint. Meaningful from the HTTP
    /// upgrade on.
    pub app_i: usize,
    /// True once the owning app has seen the open event and must therefore
    /// see a close event when the peer dies.
    pub app_knows: bool,
    /// Accumulated request bytes while at the Http layer.
    pub http_buf: Vec<u8>,
    /// Received-but-unparsed frame bytes while at the Ws layer.
    pub ws_buf: Vec<u8>,
    /// Reassembly buffer for a fragmented message in progress.
    pub frag_msg: Vec<u8>,
    /// Text/binary flag of the fragmented message in progress.
    pub frag_is_utf8: bool,
    /// True while a fragmented message is being reassembled.
    pub frag_open: bool,
    /// Outbound bytes accepted but not yet written to the socket. Stable
    /// across write retries; `old_wsize` indexes into it.
    pub pending_out: Vec<u8>,
}

impl Peer {
    pub fn new(fd: RawFd, is_encrypted: bool) -> Self {
        Self {
            fd,
            is_encrypted,
            layer: Layer::Tcp,
            mortality: Mortality::Live,
            is_writing: false,
            old_wsize: 0,
            tls: None,
            app_i: 0,
            app_knows: false,
            http_buf: Vec::new(),
            ws_buf: Vec::new(),
            frag_msg: Vec::new(),
            frag_is_utf8: false,
            frag_open: false,
            pending_out: Vec::new(),
        }
    }

    /// True once the peer has completed its WebSocket handshake and is not
    /// on its way out — the population addressed by the broadcast kinds.
    #[inline]
    pub fn is_ws_live(&self) -> bool {
        self.layer == Layer::Ws && self.mortality == Mortality::Live
    }
}
