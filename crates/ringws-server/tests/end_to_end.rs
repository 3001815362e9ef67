//! Full-pipeline tests: a real client socket through accept, upgrade,
//! framing, the rings, an app callback, and back.

use ringws_server::{AppCtx, AppHandler, IoResult, Server, ServerConfig};
use std::io::{ErrorKind, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::time::Duration;

/// Starts a server with one app on an ephemeral port.
fn start_server(handler: impl AppHandler + 'static) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let conf = ServerConfig {
        listen: addr.to_string(),
        ..ServerConfig::default()
    };
    let mut server = Server::new(conf);
    server.register_app("test", "/test", handler);
    std::thread::spawn(move || {
        let _ = server.run_with_listener(listener);
    });
    addr
}

/// A deliberately tiny WebSocket client: enough protocol to talk to the
/// server under test, nothing more.
struct Client {
    stream: TcpStream,
}

impl Client {
    fn connect(addr: SocketAddr) -> Self {
        let stream = TcpStream::connect(addr).unwrap();
        stream
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        stream.set_nodelay(true).unwrap();
        let mut client = Self { stream };

        client
            .stream
            .write_all(
                b"GET /test HTTP/1.1\r\n\
                  Host: localhost\r\n\
                  Upgrade: websocket\r\n\
                  Connection: Upgrade\r\n\
                  Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\
                  Sec-WebSocket-Version: 13\r\n\r\n",
            )
            .unwrap();

        let response = client.read_until_headers_end();
        assert!(
            response.starts_with("HTTP/1.1 101"),
            "unexpected upgrade response: {response}"
        );
        assert!(
            response.contains("s3pPLMBiTxaQ9kYGzzhZRbK+xOo="),
            "wrong accept hash in: {response}"
        );
        client
    }

    fn read_until_headers_end(&mut self) -> String {
        let mut response = Vec::new();
        let mut byte = [0u8; 1];
        while !response.ends_with(b"\r\n\r\n") {
            self.stream.read_exact(&mut byte).unwrap();
            response.push(byte[0]);
        }
        String::from_utf8(response).unwrap()
    }

    fn send_frame(&mut self, opcode: u8, payload: &[u8]) {
        assert!(payload.len() <= 125, "test client keeps frames small");
        let mask = [0x37u8, 0xFA, 0x21, 0x3D];
        let mut frame = vec![0x80 | opcode, 0x80 | payload.len() as u8];
        frame.extend_from_slice(&mask);
        frame.extend(payload.iter().enumerate().map(|(i, b)| b ^ mask[i % 4]));
        self.stream.write_all(&frame).unwrap();
    }

    fn send_text(&mut self, payload: &[u8]) {
        self.send_frame(0x1, payload);
    }

    /// Reads one small unmasked server frame, returning (first byte, payload).
    fn read_frame(&mut self) -> (u8, Vec<u8>) {
        let mut header = [0u8; 2];
        self.stream.read_exact(&mut header).unwrap();
        assert_eq!(header[1] & 0x80, 0, "server frames must be unmasked");
        let len = (header[1] & 0x7F) as usize;
        assert!(len < 126, "test client keeps frames small");
        let mut payload = vec![0u8; len];
        self.stream.read_exact(&mut payload).unwrap();
        (header[0], payload)
    }

    /// Reads raw bytes, for asserting exact wire output.
    fn read_exact_bytes(&mut self, n: usize) -> Vec<u8> {
        let mut bytes = vec![0u8; n];
        self.stream.read_exact(&mut bytes).unwrap();
        bytes
    }

    fn expect_silence(&mut self) {
        self.stream
            .set_read_timeout(Some(Duration::from_millis(300)))
            .unwrap();
        let mut byte = [0u8; 1];
        match self.stream.read(&mut byte) {
            Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {}
            other => panic!("expected nothing to read, got {other:?}"),
        }
        self.stream
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
    }
}

struct YoApp;

impl AppHandler for YoApp {
    fn on_message(&mut self, ctx: &mut AppCtx<'_>, payload: &[u8], is_utf8: bool) -> IoResult {
        assert!(is_utf8);
        assert_eq!(payload, b"hi");
        ctx.to_cur(true, b"yo")
    }
}

#[test]
fn test_text_round_trip_is_bit_exact() {
    let addr = start_server(YoApp);
    let mut client = Client::connect(addr);

    client.send_text(b"hi");
    // The reply frame, byte for byte.
    assert_eq!(client.read_exact_bytes(4), [0x81, 0x02, 0x79, 0x6F]);
}

struct EchoApp;

impl AppHandler for EchoApp {
    fn on_message(&mut self, ctx: &mut AppCtx<'_>, payload: &[u8], is_utf8: bool) -> IoResult {
        ctx.to_cur(is_utf8, payload)
    }
}

#[test]
fn test_binary_and_fragmented_messages_survive() {
    let addr = start_server(EchoApp);
    let mut client = Client::connect(addr);

    // Binary round trip.
    client.send_frame(0x2, &[0, 159, 146, 150]);
    let (first, payload) = client.read_frame();
    assert_eq!(first, 0x82);
    assert_eq!(payload, [0, 159, 146, 150]);

    // A text message in three fragments comes back reassembled.
    let mask = [1u8, 2, 3, 4];
    let parts: [(&[u8], u8, bool); 3] =
        [(b"fra", 0x1, false), (b"gmen", 0x0, false), (b"ted", 0x0, true)];
    for (part, opcode, fin) in parts {
        let mut frame = vec![
            if fin { 0x80 } else { 0x00 } | opcode,
            0x80 | part.len() as u8,
        ];
        frame.extend_from_slice(&mask);
        frame.extend(part.iter().enumerate().map(|(i, b)| b ^ mask[i % 4]));
        client.stream.write_all(&frame).unwrap();
    }
    let (first, payload) = client.read_frame();
    assert_eq!(first, 0x81);
    assert_eq!(payload, b"fragmented");
}

#[test]
fn test_ping_answered_with_pong() {
    let addr = start_server(EchoApp);
    let mut client = Client::connect(addr);

    client.send_frame(0x9, b"tick");
    let (first, payload) = client.read_frame();
    assert_eq!(first, 0x8A);
    assert_eq!(payload, b"tick");
}

#[test]
fn test_close_handshake_and_orderly_teardown() {
    let addr = start_server(EchoApp);
    let mut client = Client::connect(addr);

    client.send_frame(0x8, &1000u16.to_be_bytes());
    let (first, payload) = client.read_frame();
    assert_eq!(first, 0x88);
    assert_eq!(payload, 1000u16.to_be_bytes());

    // The server walks its bidirectional shutdown; the socket reaches EOF.
    let mut rest = Vec::new();
    client.stream.read_to_end(&mut rest).unwrap();
    assert!(rest.is_empty());
}

struct BroadcastApp;

impl AppHandler for BroadcastApp {
    fn on_message(&mut self, ctx: &mut AppCtx<'_>, payload: &[u8], is_utf8: bool) -> IoResult {
        ctx.to_every(is_utf8, payload)
    }
}

#[test]
fn test_to_every_reaches_all_clients() {
    let addr = start_server(BroadcastApp);
    let mut sender = Client::connect(addr);
    let mut other = Client::connect(addr);

    sender.send_text(b"x");
    assert_eq!(sender.read_exact_bytes(3), [0x81, 0x01, b'x']);
    assert_eq!(other.read_exact_bytes(3), [0x81, 0x01, b'x']);
}

struct GossipApp;

impl AppHandler for GossipApp {
    fn on_message(&mut self, ctx: &mut AppCtx<'_>, payload: &[u8], is_utf8: bool) -> IoResult {
        ctx.to_every_except_cur(is_utf8, payload)
    }
}

#[test]
fn test_to_every_except_cur_skips_the_sender() {
    let addr = start_server(GossipApp);
    let mut sender = Client::connect(addr);
    let mut other = Client::connect(addr);

    sender.send_text(b"psst");
    let (first, payload) = other.read_frame();
    assert_eq!(first, 0x81);
    assert_eq!(payload, b"psst");
    sender.expect_silence();
}

struct ScratchApp;

impl AppHandler for ScratchApp {
    fn on_message(&mut self, ctx: &mut AppCtx<'_>, _payload: &[u8], _is_utf8: bool) -> IoResult {
        // A header built with the typed appenders, then the payload bytes.
        ctx.w_u8(0x01);
        ctx.w_u16_hton(0xBEEF);
        ctx.to_cur(false, b"tail")
    }
}

#[test]
fn test_scratch_appends_precede_payload_on_the_wire() {
    let addr = start_server(ScratchApp);
    let mut client = Client::connect(addr);

    client.send_text(b"go");
    let (first, payload) = client.read_frame();
    assert_eq!(first, 0x82);
    assert_eq!(payload, [0x01, 0xBE, 0xEF, b't', b'a', b'i', b'l']);
}

#[test]
fn test_unknown_path_is_rejected() {
    let addr = start_server(EchoApp);
    let mut stream = TcpStream::connect(addr).unwrap();
    stream
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();
    stream
        .write_all(
            b"GET /nowhere HTTP/1.1\r\n\
              Host: localhost\r\n\
              Upgrade: websocket\r\n\
              Connection: Upgrade\r\n\
              Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\
              Sec-WebSocket-Version: 13\r\n\r\n",
        )
        .unwrap();
    let mut response = String::new();
    stream.read_to_string(&mut response).unwrap();
    assert!(response.starts_with("HTTP/1.1 404"), "got: {response}");
}
