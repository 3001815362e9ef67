use crate::peer::Peer;
use crate::tls::{read_transport, send_or_park};
use crate::worker::InboundPublisher;
use log::{debug, warn};
use ringws::endian::{read_u16_be, read_u64_be, write_u16_be};
use ringws::record::EventKind;
use ringws::{IoErr, IoResult};

const OP_CONTINUATION: u8 = 0x0;
const OP_TEXT: u8 = 0x1;
const OP_BINARY: u8 = 0x2;
const OP_CLOSE: u8 = 0x8;
const OP_PING: u8 = 0x9;
const OP_PONG: u8 = 0xA;

// Close status codes sent on our own initiative.
const CLOSE_NORMAL: u16 = 1000;
const CLOSE_PROTOCOL_ERROR: u16 = 1002;
const CLOSE_INVALID_PAYLOAD: u16 = 1007;
const CLOSE_TOO_BIG: u16 = 1009;

/// One parsed client frame, unmasked.
struct Frame {
    fin: bool,
    opcode: u8,
    payload: Vec<u8>,
}

/// Parses one frame from `buf`. `Ok(None)` means the frame is still
/// incomplete; a protocol violation yields the close code to fail with.
fn parse_frame(buf: &[u8], max_payload: usize) -> Result<Option<(Frame, usize)>, u16> {
    if buf.len() < 2 {
        return Ok(None);
    }
    let fin = buf[0] & 0x80 != 0;
    if buf[0] & 0x70 != 0 {
        // Reserved bits are only valid under negotiated extensions, and
        // none are offered.
        return Err(CLOSE_PROTOCOL_ERROR);
    }
    let opcode = buf[0] & 0x0F;
    let masked = buf[1] & 0x80 != 0;
    if !masked {
        // Client frames must be masked (RFC 6455 §5.1).
        return Err(CLOSE_PROTOCOL_ERROR);
    }

    let mut at = 2;
    let payload_len = match buf[1] & 0x7F {
        126 => {
            if buf.len() < at + 2 {
                return Ok(None);
            }
            let len = read_u16_be(&buf[at..]) as usize;
            at += 2;
            len
        }
        127 => {
            if buf.len() < at + 8 {
                return Ok(None);
            }
            let len = read_u64_be(&buf[at..]);
            at += 8;
            if len > usize::MAX as u64 {
                return Err(CLOSE_TOO_BIG);
            }
            len as usize
        }
        len => len as usize,
    };

    let is_control = opcode & 0x8 != 0;
    if is_control && (!fin || payload_len > 125) {
        return Err(CLOSE_PROTOCOL_ERROR);
    }
    if !is_control && payload_len > max_payload {
        return Err(CLOSE_TOO_BIG);
    }

    if buf.len() < at + 4 + payload_len {
        return Ok(None);
    }
    let mask: [u8; 4] = [buf[at], buf[at + 1], buf[at + 2], buf[at + 3]];
    at += 4;
    let mut payload = buf[at..at + payload_len].to_vec();
    for (i, byte) in payload.iter_mut().enumerate() {
        *byte ^= mask[i % 4];
    }
    at += payload_len;

    Ok(Some((
        Frame {
            fin,
            opcode,
            payload,
        },
        at,
    )))
}

/// Writes an unmasked close frame with the given status code.
fn send_close(peer: &mut Peer, code: u16) -> IoResult {
    let mut frame = [0u8; 4];
    frame[0] = 0x88;
    frame[1] = 2;
    write_u16_be(&mut frame[2..], code);
    send_or_park(peer, &frame)
}

/// Fails the connection: best-effort close frame, then the mortality
/// sequence takes over.
fn fail(peer: &mut Peer, code: u16) -> IoErr {
    debug!("fd {}: failing websocket connection with {}", peer.fd, code);
    let _ = send_close(peer, code);
    IoErr::ClosePeer
}

/// The WebSocket-layer dispatcher: unmasks and reassembles client frames,
/// answers control frames, and publishes every complete message to the
/// owning app's inbound ring.
pub fn handle_ws(
    peer: &mut Peer,
    peer_i: u32,
    rbuf: &mut [u8],
    publisher: &mut InboundPublisher<'_>,
    max_ws_msg_size: usize,
) -> IoResult {
    loop {
        // Parse everything buffered before reading again; the upgrade may
        // have left an eager client's first frames here.
        let mut consumed = 0;
        let mut verdict = Ok(());
        while let Some((frame, frame_size)) =
            match parse_frame(&peer.ws_buf[consumed..], max_ws_msg_size) {
                Ok(step) => step,
                Err(code) => {
                    verdict = Err(code);
                    None
                }
            }
        {
            consumed += frame_size;
            if let Err(code) = dispatch_frame(peer, peer_i, frame, publisher, max_ws_msg_size)? {
                verdict = Err(code);
                break;
            }
        }
        peer.ws_buf.drain(..consumed);
        if let Err(code) = verdict {
            return Err(fail(peer, code));
        }

        let n = read_transport(peer, rbuf)?;
        peer.ws_buf.extend_from_slice(&rbuf[..n]);
    }
}

/// Handles one parsed frame. The outer `IoResult` carries transport
/// failures; the inner result carries a protocol failure's close code.
fn dispatch_frame(
    peer: &mut Peer,
    peer_i: u32,
    frame: Frame,
    publisher: &mut InboundPublisher<'_>,
    max_ws_msg_size: usize,
) -> IoResult<Result<(), u16>> {
    match frame.opcode {
        OP_TEXT | OP_BINARY => {
            if peer.frag_open {
                return Ok(Err(CLOSE_PROTOCOL_ERROR));
            }
            let is_utf8 = frame.opcode == OP_TEXT;
            if frame.fin {
                return deliver(peer, peer_i, is_utf8, &frame.payload, publisher);
            }
            peer.frag_open = true;
            peer.frag_is_utf8 = is_utf8;
            peer.frag_msg = frame.payload;
            Ok(Ok(()))
        }
        OP_CONTINUATION => {
            if !peer.frag_open {
                return Ok(Err(CLOSE_PROTOCOL_ERROR));
            }
            if peer.frag_msg.len() + frame.payload.len() > max_ws_msg_size {
                return Ok(Err(CLOSE_TOO_BIG));
            }
            peer.frag_msg.extend_from_slice(&frame.payload);
            if !frame.fin {
                return Ok(Ok(()));
            }
            peer.frag_open = false;
            let message = std::mem::take(&mut peer.frag_msg);
            let is_utf8 = peer.frag_is_utf8;
            deliver(peer, peer_i, is_utf8, &message, publisher)
        }
        OP_PING => {
            let mut pong = Vec::with_capacity(2 + frame.payload.len());
            pong.push(0x80 | OP_PONG);
            pong.push(frame.payload.len() as u8);
            pong.extend_from_slice(&frame.payload);
            send_or_park(peer, &pong)?;
            Ok(Ok(()))
        }
        OP_PONG => Ok(Ok(())),
        OP_CLOSE => {
            let code = match frame.payload.len() {
                0 => CLOSE_NORMAL,
                1 => return Ok(Err(CLOSE_PROTOCOL_ERROR)),
                _ => read_u16_be(&frame.payload),
            };
            debug!("fd {}: close frame from peer, code {}", peer.fd, code);
            send_close(peer, code)?;
            Err(IoErr::ClosePeer)
        }
        other => {
            warn!("fd {}: unknown websocket opcode {:#x}", peer.fd, other);
            Ok(Err(CLOSE_PROTOCOL_ERROR))
        }
    }
}

/// Publishes one complete message to the owning app.
fn deliver(
    peer: &mut Peer,
    peer_i: u32,
    is_utf8: bool,
    payload: &[u8],
    publisher: &mut InboundPublisher<'_>,
) -> IoResult<Result<(), u16>> {
    let kind = if is_utf8 {
        if std::str::from_utf8(payload).is_err() {
            return Ok(Err(CLOSE_INVALID_PAYLOAD));
        }
        EventKind::Text
    } else {
        EventKind::Binary
    };
    publisher.publish(peer.app_i, kind, peer_i, payload)?;
    Ok(Ok(()))
}
