use crate::peer::{Layer, Peer};
use crate::tls::{read_transport, send_or_park};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use log::{debug, warn};
use ringws::{IoErr, IoResult};
use sha1::{Digest, Sha1};

/// The fixed GUID every WebSocket accept hash mixes in (RFC 6455 §1.3).
const WS_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// Upper bound on a buffered upgrade request.
const MAX_REQUEST_SIZE: usize = 8192;

/// One served URL path and the app that owns peers connecting to it.
#[derive(Debug, Clone)]
pub struct Endpoint {
    pub path: String,
    pub app_i: usize,
}

/// `Sec-WebSocket-Accept` for a client's `Sec-WebSocket-Key`: the base64 of
/// the SHA-1 over the key concatenated with the protocol GUID, bit-exact.
pub fn accept_key(client_key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(client_key.as_bytes());
    hasher.update(WS_GUID.as_bytes());
    BASE64.encode(hasher.finalize())
}

/// Outcome of validating a complete upgrade request: the owning app and the
/// computed accept hash, or the HTTP status to reject with.
fn validate_upgrade(
    req: &httparse::Request<'_, '_>,
    endpoints: &[Endpoint],
) -> Result<(usize, String), u16> {
    if req.method != Some("GET") {
        return Err(405);
    }
    let path = req.path.ok_or(400u16)?;
    let app_i = endpoints
        .iter()
        .find(|e| e.path == path)
        .map(|e| e.app_i)
        .ok_or(404u16)?;

    let mut upgrade_ok = false;
    let mut connection_ok = false;
    let mut version_ok = false;
    let mut key = None;
    for header in req.headers.iter() {
        let value = std::str::from_utf8(header.value).map_err(|_| 400u16)?;
        if header.name.eq_ignore_ascii_case("upgrade") {
            upgrade_ok = value.to_ascii_lowercase().contains("websocket");
        } else if header.name.eq_ignore_ascii_case("connection") {
            connection_ok = value.to_ascii_lowercase().contains("upgrade");
        } else if header.name.eq_ignore_ascii_case("sec-websocket-version") {
            version_ok = value.trim() == "13";
        } else if header.name.eq_ignore_ascii_case("sec-websocket-key") {
            key = Some(value.trim().to_owned());
        }
    }
    if !upgrade_ok || !connection_ok {
        return Err(400);
    }
    if !version_ok {
        return Err(426);
    }
    let key = key.ok_or(400u16)?;
    Ok((app_i, accept_key(&key)))
}

fn status_line(status: u16) -> &'static str {
    match status {
        404 => "404 Not Found",
        405 => "405 Method Not Allowed",
        426 => "426 Upgrade Required",
        _ => "400 Bad Request",
    }
}

/// Writes a minimal rejection response; the peer is closed right after.
fn reject(peer: &mut Peer, status: u16) -> IoErr {
    let response = format!(
        "HTTP/1.1 {}\r\nConnection: close\r\nContent-Length: 0\r\n\r\n",
        status_line(status)
    );
    // The mortality sequence follows regardless of whether this lands.
    let _ = send_or_park(peer, response.as_bytes());
    IoErr::ClosePeer
}

/// The HTTP-layer dispatcher: accumulates one upgrade request, answers it
/// with a 101 carrying the accept hash, and promotes the peer to the
/// WebSocket layer.
///
/// Returns the owning app's index on upgrade; the caller reports the open
/// event. Bytes the client sent past the request (an eager first frame) are
/// handed to the WebSocket layer untouched.
pub fn handle_http(
    peer: &mut Peer,
    rbuf: &mut [u8],
    endpoints: &[Endpoint],
) -> IoResult<usize> {
    loop {
        let n = read_transport(peer, rbuf)?;
        peer.http_buf.extend_from_slice(&rbuf[..n]);

        let mut headers = [httparse::EMPTY_HEADER; 32];
        let mut req = httparse::Request::new(&mut headers);
        let verdict = match req.parse(&peer.http_buf) {
            Ok(httparse::Status::Complete(body_start)) => {
                validate_upgrade(&req, endpoints).map(|ok| (ok, body_start))
            }
            Ok(httparse::Status::Partial) => {
                if peer.http_buf.len() > MAX_REQUEST_SIZE {
                    warn!("fd {}: upgrade request exceeds {MAX_REQUEST_SIZE} bytes", peer.fd);
                    Err(400)
                } else {
                    continue;
                }
            }
            Err(e) => {
                debug!("fd {}: unparseable upgrade request: {}", peer.fd, e);
                Err(400)
            }
        };

        return match verdict {
            Ok(((app_i, accept), body_start)) => {
                let response = format!(
                    "HTTP/1.1 101 Switching Protocols\r\n\
                     Upgrade: websocket\r\n\
                     Connection: Upgrade\r\n\
                     Sec-WebSocket-Accept: {accept}\r\n\r\n"
                );
                send_or_park(peer, response.as_bytes())?;
                // An eager client may have sent its first frames behind the
                // request; they belong to the next layer.
                let leftover = peer.http_buf.split_off(body_start);
                peer.ws_buf = leftover;
                peer.http_buf = Vec::new();
                peer.layer = Layer::Ws;
                peer.app_i = app_i;
                Ok(app_i)
            }
            Err(status) => Err(reject(peer, status)),
        };
    }
}
