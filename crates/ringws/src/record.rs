//! The record layouts carried on the rings.
//!
//! Both layouts are process-internal but must stay stable between the app
//! and worker sides:
//!
//! Outbound (app → worker), one record per target ring:
//!
//! ```text
//! kind:u8 | [recipient_c:u32 if kind ∈ {Array, EveryExceptArray}]
//!         | recipient_i:u32 × (1 for the Single kinds, recipient_c for the
//!           Array kinds, 0 for Every)
//!         | 0x81|0x82 | ws_length (1/3/9 bytes, big-endian extended forms)
//!         | payload
//! ```
//!
//! Inbound (worker → app): `kind:u8 | peer_i:u32 | payload`; the source
//! worker is implied by which ring the record arrived on.
//!
//! Recipient ids and `recipient_c` are host-endian; only the WebSocket
//! extended lengths are network order, because those bytes go to the wire
//! verbatim.

use crate::endian::{read_u32_ne, write_u16_be, write_u32_ne, write_u64_be};

/// Addressing mode of an outbound record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum OutboundKind {
    /// Deliver to the one listed recipient.
    Single = 0,
    /// Deliver to each of the listed recipients.
    Array = 1,
    /// Deliver to every live WebSocket peer of the target worker.
    Every = 2,
    /// Deliver to every peer except the one listed.
    EveryExceptSingle = 3,
    /// Deliver to every peer except those listed.
    EveryExceptArray = 4,
}

impl OutboundKind {
    pub fn from_u8(b: u8) -> Option<Self> {
        match b {
            0 => Some(Self::Single),
            1 => Some(Self::Array),
            2 => Some(Self::Every),
            3 => Some(Self::EveryExceptSingle),
            4 => Some(Self::EveryExceptArray),
            _ => None,
        }
    }

    /// Whether the recipient list is prefixed with an explicit count.
    #[inline]
    pub fn has_count(self) -> bool {
        matches!(self, Self::Array | Self::EveryExceptArray)
    }
}

/// Lifecycle and message events delivered to apps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum EventKind {
    /// A peer completed the WebSocket handshake on this app's endpoint.
    Open = 0,
    /// A complete text message (payload is valid UTF-8).
    Text = 1,
    /// A complete binary message.
    Binary = 2,
    /// The peer is gone; its client id must not be addressed anymore.
    Close = 3,
}

impl EventKind {
    pub fn from_u8(b: u8) -> Option<Self> {
        match b {
            0 => Some(Self::Open),
            1 => Some(Self::Text),
            2 => Some(Self::Binary),
            3 => Some(Self::Close),
            _ => None,
        }
    }
}

// -----------------------------------------------------------------------
// WebSocket server-frame header
// -----------------------------------------------------------------------

/// Size of a server-to-client frame header for the given payload size:
/// opcode byte plus the 1-, 3- or 9-byte length encoding.
#[inline]
pub fn ws_header_size(payload_size: usize) -> usize {
    if payload_size > u16::MAX as usize {
        10
    } else if payload_size > 125 {
        4
    } else {
        2
    }
}

/// Writes an unfragmented, unmasked server frame header into `dst` and
/// returns the header size. `dst` must hold at least `ws_header_size` bytes.
pub fn write_ws_header(dst: &mut [u8], is_utf8: bool, payload_size: usize) -> usize {
    dst[0] = if is_utf8 { 0x81 } else { 0x82 };
    if payload_size > u16::MAX as usize {
        dst[1] = 127;
        write_u64_be(&mut dst[2..], payload_size as u64);
        10
    } else if payload_size > 125 {
        dst[1] = 126;
        write_u16_be(&mut dst[2..], payload_size as u16);
        4
    } else {
        dst[1] = payload_size as u8;
        2
    }
}

// -----------------------------------------------------------------------
// Outbound records
// -----------------------------------------------------------------------

/// Byte size of a full outbound record: routing header plus framed message.
#[inline]
pub fn outbound_record_size(kind: OutboundKind, recipient_c: usize, payload_size: usize) -> usize {
    let count_prefix = if kind.has_count() { 4 } else { 0 };
    1 + count_prefix + 4 * recipient_c + ws_header_size(payload_size) + payload_size
}

/// A decoded outbound record, borrowing from its ring region.
#[derive(Debug)]
pub struct OutboundMsg<'a> {
    pub kind: OutboundKind,
    /// Recipient ids, host-endian, possibly unaligned.
    recipients: &'a [u8],
    /// The framed WebSocket message, ready for the wire.
    pub frame: &'a [u8],
}

impl<'a> OutboundMsg<'a> {
    #[inline]
    pub fn recipient_c(&self) -> usize {
        self.recipients.len() / 4
    }

    /// Iterates the recipient slot indexes.
    pub fn recipients(&self) -> impl Iterator<Item = u32> + '_ {
        self.recipients.chunks_exact(4).map(read_u32_ne)
    }

    /// True if `peer_i` appears in the recipient list. Used to evaluate the
    /// "everyone except" kinds.
    pub fn lists(&self, peer_i: u32) -> bool {
        self.recipients().any(|r| r == peer_i)
    }
}

/// Decodes an outbound record. Returns `None` on a malformed record, which
/// can only mean in-process corruption and is treated as fatal by callers.
pub fn decode_outbound(record: &[u8]) -> Option<OutboundMsg<'_>> {
    let (&kind_byte, rest) = record.split_first()?;
    let kind = OutboundKind::from_u8(kind_byte)?;
    let (recipient_c, rest) = match kind {
        OutboundKind::Single | OutboundKind::EveryExceptSingle => (1, rest),
        OutboundKind::Every => (0, rest),
        OutboundKind::Array | OutboundKind::EveryExceptArray => {
            if rest.len() < 4 {
                return None;
            }
            (read_u32_ne(rest) as usize, &rest[4..])
        }
    };
    if rest.len() < 4 * recipient_c {
        return None;
    }
    let (recipients, frame) = rest.split_at(4 * recipient_c);
    if frame.len() < 2 {
        return None;
    }
    Some(OutboundMsg {
        kind,
        recipients,
        frame,
    })
}

/// Writes the routing header of an outbound record and returns its size.
pub fn write_outbound_header(dst: &mut [u8], kind: OutboundKind, recipients: &[u32]) -> usize {
    dst[0] = kind as u8;
    let mut at = 1;
    if kind.has_count() {
        write_u32_ne(&mut dst[at..], recipients.len() as u32);
        at += 4;
    }
    for &recipient in recipients {
        write_u32_ne(&mut dst[at..], recipient);
        at += 4;
    }
    at
}

// -----------------------------------------------------------------------
// Inbound records
// -----------------------------------------------------------------------

/// Routing-header size of an inbound event record.
pub const INBOUND_HEADER_SIZE: usize = 5;

/// A decoded inbound event, borrowing its payload from the ring region.
#[derive(Debug, PartialEq, Eq)]
pub struct InboundEvent<'a> {
    pub kind: EventKind,
    pub peer_i: u32,
    pub payload: &'a [u8],
}

/// Writes an inbound event header into `dst`.
pub fn write_inbound_header(dst: &mut [u8], kind: EventKind, peer_i: u32) {
    dst[0] = kind as u8;
    write_u32_ne(&mut dst[1..], peer_i);
}

/// Decodes an inbound event record. `None` means in-process corruption.
pub fn decode_inbound(record: &[u8]) -> Option<InboundEvent<'_>> {
    if record.len() < INBOUND_HEADER_SIZE {
        return None;
    }
    Some(InboundEvent {
        kind: EventKind::from_u8(record[0])?,
        peer_i: read_u32_ne(&record[1..]),
        payload: &record[INBOUND_HEADER_SIZE..],
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ws_header_bands() {
        assert_eq!(ws_header_size(0), 2);
        assert_eq!(ws_header_size(125), 2);
        assert_eq!(ws_header_size(126), 4);
        assert_eq!(ws_header_size(65535), 4);
        assert_eq!(ws_header_size(65536), 10);
    }

    #[test]
    fn test_write_ws_header_text_small() {
        let mut dst = [0u8; 10];
        let n = write_ws_header(&mut dst, true, 2);
        assert_eq!(&dst[..n], &[0x81, 0x02]);
    }

    #[test]
    fn test_write_ws_header_binary_extended() {
        let mut dst = [0u8; 10];
        let n = write_ws_header(&mut dst, false, 300);
        assert_eq!(&dst[..n], &[0x82, 126, 0x01, 0x2C]);

        let n = write_ws_header(&mut dst, false, 70_000);
        assert_eq!(&dst[..2], &[0x82, 127]);
        assert_eq!(n, 10);
        assert_eq!(crate::endian::read_u64_be(&dst[2..]), 70_000);
    }

    #[test]
    fn test_outbound_single_round_trip() {
        // Kind byte, one recipient, then the frame bytes.
        let mut record = Vec::new();
        let mut header = [0u8; 64];
        let n = write_outbound_header(&mut header, OutboundKind::Single, &[7]);
        record.extend_from_slice(&header[..n]);
        let mut ws = [0u8; 10];
        let n = write_ws_header(&mut ws, false, 2);
        record.extend_from_slice(&ws[..n]);
        record.extend_from_slice(b"AB");

        let msg = decode_outbound(&record).unwrap();
        assert_eq!(msg.kind, OutboundKind::Single);
        assert_eq!(msg.recipients().collect::<Vec<_>>(), vec![7]);
        assert_eq!(msg.frame, &[0x82, 0x02, b'A', b'B']);
    }

    #[test]
    fn test_outbound_array_carries_count() {
        let mut record = Vec::new();
        let mut header = [0u8; 64];
        let n = write_outbound_header(&mut header, OutboundKind::EveryExceptArray, &[3, 9, 12]);
        record.extend_from_slice(&header[..n]);
        let mut ws = [0u8; 10];
        let n = write_ws_header(&mut ws, true, 1);
        record.extend_from_slice(&ws[..n]);
        record.push(b'x');

        assert_eq!(record[0], 4);
        assert_eq!(read_u32_ne(&record[1..]), 3);

        let msg = decode_outbound(&record).unwrap();
        assert_eq!(msg.recipient_c(), 3);
        assert!(msg.lists(9));
        assert!(!msg.lists(7));
        assert_eq!(msg.frame, &[0x81, 0x01, b'x']);
    }

    #[test]
    fn test_outbound_every_has_no_recipients() {
        let record = [OutboundKind::Every as u8, 0x81, 0x01, b'x'];
        let msg = decode_outbound(&record).unwrap();
        assert_eq!(msg.recipient_c(), 0);
        assert_eq!(msg.frame, &[0x81, 0x01, b'x']);
    }

    #[test]
    fn test_outbound_rejects_garbage() {
        assert!(decode_outbound(&[]).is_none());
        assert!(decode_outbound(&[99, 0x81, 0x00]).is_none());
        // Array kind whose count exceeds the record.
        assert!(decode_outbound(&[1, 255, 0, 0, 0]).is_none());
    }

    #[test]
    fn test_outbound_record_size_matches_encoding() {
        for (kind, recipients, payload) in [
            (OutboundKind::Single, vec![5u32], 3usize),
            (OutboundKind::Array, vec![1, 2, 3], 200),
            (OutboundKind::Every, vec![], 70_000),
            (OutboundKind::EveryExceptSingle, vec![8], 125),
        ] {
            let mut record = vec![0u8; outbound_record_size(kind, recipients.len(), payload)];
            let mut at = write_outbound_header(&mut record, kind, &recipients);
            let mut ws = [0u8; 10];
            let n = write_ws_header(&mut ws, true, payload);
            record[at..at + n].copy_from_slice(&ws[..n]);
            at += n;
            assert_eq!(record.len() - at, payload);
        }
    }

    #[test]
    fn test_inbound_round_trip() {
        let mut record = vec![0u8; INBOUND_HEADER_SIZE];
        write_inbound_header(&mut record, EventKind::Text, 42);
        record.extend_from_slice(b"hi");

        let event = decode_inbound(&record).unwrap();
        assert_eq!(event.kind, EventKind::Text);
        assert_eq!(event.peer_i, 42);
        assert_eq!(event.payload, b"hi");
    }

    #[test]
    fn test_inbound_rejects_short_or_unknown() {
        assert!(decode_inbound(&[0, 0]).is_none());
        assert!(decode_inbound(&[9, 0, 0, 0, 0]).is_none());
    }
}
