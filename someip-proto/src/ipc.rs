//! Wire format for the routing manager's local inter-process channel: the
//! frames a client-role process exchanges with the host-role process that
//! owns the routing manager over a local stream socket, once it's no longer
//! just a function call away. Same tag-plus-length-plus-payload shape as
//! [`crate::header::SomeIpHeader`], scaled down to what a local command
//! channel actually needs.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::CodecError;

/// `type(1) + client(2) + size(4)`.
pub const HEADER_LEN: usize = 1 + 2 + 4;

/// One command/event code on the local routing channel. Mirrors the
/// registration handshake and the subset of routing-manager operations that
/// cross a process boundary; unknown codes are rejected rather than given a
/// silent fallback, since a local peer speaking a code we don't recognize
/// is a bug, not a tolerable wire variation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum CommandCode {
    AssignClient = 0x01,
    AssignClientAck = 0x02,
    RegisterApplication = 0x03,
    DeregisterApplication = 0x04,
    RegisteredAck = 0x05,
    RoutingInfo = 0x06,
    Ping = 0x07,
    Pong = 0x08,
    OfferService = 0x10,
    StopOfferService = 0x11,
    RequestService = 0x12,
    ReleaseService = 0x13,
    Send = 0x14,
    Notify = 0x15,
    Subscribe = 0x16,
    Unsubscribe = 0x17,
    CreateEventgroup = 0x18,
    AddEventToEventgroup = 0x19,
    RegisterClient = 0x1a,
    UnregisterClient = 0x1b,
}

impl CommandCode {
    pub fn from_u8(v: u8) -> Option<Self> {
        use CommandCode::*;
        Some(match v {
            0x01 => AssignClient,
            0x02 => AssignClientAck,
            0x03 => RegisterApplication,
            0x04 => DeregisterApplication,
            0x05 => RegisteredAck,
            0x06 => RoutingInfo,
            0x07 => Ping,
            0x08 => Pong,
            0x10 => OfferService,
            0x11 => StopOfferService,
            0x12 => RequestService,
            0x13 => ReleaseService,
            0x14 => Send,
            0x15 => Notify,
            0x16 => Subscribe,
            0x17 => Unsubscribe,
            0x18 => CreateEventgroup,
            0x19 => AddEventToEventgroup,
            0x1a => RegisterClient,
            0x1b => UnregisterClient,
            _ => return None,
        })
    }
}

/// One frame on the local routing channel: a command/event code, the
/// `ClientId` it's addressed to or from (`0` before a client has been
/// assigned one), and an opaque payload the `someip` crate's IPC layer
/// encodes/decodes according to `code`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandFrame {
    pub code: CommandCode,
    pub client: u16,
    pub payload: Bytes,
}

impl CommandFrame {
    pub fn encode(&self, out: &mut BytesMut) {
        out.put_u8(self.code as u8);
        out.put_u16(self.client);
        out.put_u32(self.payload.len() as u32);
        out.extend_from_slice(&self.payload);
    }

    /// Reads the `size` field out of a header-only prefix, so a stream
    /// reader knows how many more bytes to buffer before calling
    /// [`Self::decode`]. Returns `None` if fewer than [`HEADER_LEN`] bytes
    /// are available yet.
    pub fn peek_payload_len(header: &[u8]) -> Option<u32> {
        if header.len() < HEADER_LEN {
            return None;
        }
        Some(u32::from_be_bytes([header[3], header[4], header[5], header[6]]))
    }

    pub fn decode(buf: &mut impl Buf) -> Result<Self, CodecError> {
        if buf.remaining() < HEADER_LEN {
            return Err(CodecError::Truncated {
                needed: HEADER_LEN,
                have: buf.remaining(),
            });
        }
        let code_byte = buf.get_u8();
        let client = buf.get_u16();
        let len = buf.get_u32() as usize;
        if buf.remaining() < len {
            return Err(CodecError::Truncated {
                needed: len,
                have: buf.remaining(),
            });
        }
        let code = CommandCode::from_u8(code_byte).ok_or(CodecError::UnknownCommandCode(code_byte))?;
        let payload = buf.copy_to_bytes(len);
        Ok(Self { code, client, payload })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_encode_decode() {
        let frame = CommandFrame {
            code: CommandCode::OfferService,
            client: 0x0042,
            payload: Bytes::from_static(b"payload"),
        };
        let mut buf = BytesMut::new();
        frame.encode(&mut buf);
        assert_eq!(CommandFrame::peek_payload_len(&buf), Some(7));
        let mut frozen = buf.freeze();
        let decoded = CommandFrame::decode(&mut frozen).unwrap();
        assert_eq!(decoded, frame);
    }

    #[test]
    fn decode_rejects_unknown_code() {
        let mut buf = BytesMut::new();
        buf.put_u8(0xff);
        buf.put_u16(1);
        buf.put_u32(0);
        let mut frozen = buf.freeze();
        assert_eq!(CommandFrame::decode(&mut frozen), Err(CodecError::UnknownCommandCode(0xff)));
    }

    #[test]
    fn decode_reports_truncated_payload() {
        let mut buf = BytesMut::new();
        buf.put_u8(CommandCode::Ping as u8);
        buf.put_u16(1);
        buf.put_u32(10);
        buf.extend_from_slice(b"short");
        let mut frozen = buf.freeze();
        assert!(matches!(CommandFrame::decode(&mut frozen), Err(CodecError::Truncated { .. })));
    }
}
