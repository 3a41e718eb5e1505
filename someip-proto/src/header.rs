//! The fixed 16-byte SOME/IP PDU header: service, method, length,
//! client, session, protocol/interface version, message type, return code.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::CodecError;
use crate::primitive::{ClientId, MethodId, ServiceId, SessionId};

/// Length of the fixed header, in bytes.
pub const HEADER_LEN: usize = 16;
/// The only protocol version this crate speaks.
pub const PROTOCOL_VERSION: u8 = 0x01;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    Request = 0x00,
    RequestNoReturn = 0x01,
    Notification = 0x02,
    Request2 = 0x03,
    Response = 0x80,
    Error = 0x81,
    TpRequest = 0x20,
    TpRequestNoReturn = 0x21,
    TpNotification = 0x22,
    TpResponse = 0xa0,
    TpError = 0xa1,
}

impl MessageType {
    pub fn from_u8(v: u8) -> Option<Self> {
        use MessageType::*;
        Some(match v {
            0x00 => Request,
            0x01 => RequestNoReturn,
            0x02 => Notification,
            0x03 => Request2,
            0x80 => Response,
            0x81 => Error,
            0x20 => TpRequest,
            0x21 => TpRequestNoReturn,
            0x22 => TpNotification,
            0xa0 => TpResponse,
            0xa1 => TpError,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ReturnCode {
    Ok = 0x00,
    NotOk = 0x01,
    UnknownService = 0x02,
    UnknownMethod = 0x03,
    NotReady = 0x04,
    NotReachable = 0x05,
    Timeout = 0x06,
    WrongProtocolVersion = 0x07,
    WrongInterfaceVersion = 0x08,
    MalformedMessage = 0x09,
    WrongMessageType = 0x0a,
}

impl ReturnCode {
    pub fn from_u8(v: u8) -> Option<Self> {
        use ReturnCode::*;
        Some(match v {
            0x00 => Ok,
            0x01 => NotOk,
            0x02 => UnknownService,
            0x03 => UnknownMethod,
            0x04 => NotReady,
            0x05 => NotReachable,
            0x06 => Timeout,
            0x07 => WrongProtocolVersion,
            0x08 => WrongInterfaceVersion,
            0x09 => MalformedMessage,
            0x0a => WrongMessageType,
            _ => return None,
        })
    }
}

/// The 16-byte SOME/IP PDU header, without payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SomeIpHeader {
    pub service: ServiceId,
    pub method: MethodId,
    /// Wire `length` field: `8 + payload.len()` (client, session, version
    /// fields, message type, return code, plus payload).
    pub length: u32,
    pub client: ClientId,
    pub session: SessionId,
    pub interface_version: u8,
    pub message_type: MessageType,
    pub return_code: ReturnCode,
}

impl SomeIpHeader {
    /// Total PDU size (header + payload) this header declares.
    pub fn total_len(&self) -> usize {
        HEADER_LEN - 8 + self.length as usize
    }

    pub fn payload_len(&self) -> usize {
        self.length as usize - 8
    }

    pub fn encode(&self, out: &mut BytesMut) {
        out.put_u16(self.service.get());
        out.put_u16(self.method.get());
        out.put_u32(self.length);
        out.put_u16(self.client.get());
        out.put_u16(self.session.get());
        out.put_u8(PROTOCOL_VERSION);
        out.put_u8(self.interface_version);
        out.put_u8(self.message_type as u8);
        out.put_u8(self.return_code as u8);
    }

    pub fn decode(buf: &mut impl Buf) -> Result<Self, CodecError> {
        if buf.remaining() < HEADER_LEN {
            return Err(CodecError::Truncated {
                needed: HEADER_LEN,
                have: buf.remaining(),
            });
        }
        let service = ServiceId(buf.get_u16());
        let method = MethodId(buf.get_u16());
        let length = buf.get_u32();
        let client = ClientId(buf.get_u16());
        let session = SessionId(buf.get_u16());
        let protocol_version = buf.get_u8();
        let interface_version = buf.get_u8();
        let message_type_raw = buf.get_u8();
        let return_code_raw = buf.get_u8();

        if protocol_version != PROTOCOL_VERSION {
            return Err(CodecError::UnsupportedProtocolVersion(protocol_version));
        }
        if length < 8 {
            return Err(CodecError::InconsistentLength(length));
        }
        let message_type = MessageType::from_u8(message_type_raw)
            .unwrap_or(MessageType::Error);
        let return_code =
            ReturnCode::from_u8(return_code_raw).unwrap_or(ReturnCode::MalformedMessage);

        Ok(Self {
            service,
            method,
            length,
            client,
            session,
            interface_version,
            message_type,
            return_code,
        })
    }
}

/// Encode a full PDU (header + payload) into a fresh buffer.
pub fn encode_pdu(header: &SomeIpHeader, payload: &[u8]) -> Bytes {
    let mut out = BytesMut::with_capacity(HEADER_LEN + payload.len());
    let mut header = *header;
    header.length = 8 + payload.len() as u32;
    header.encode(&mut out);
    out.extend_from_slice(payload);
    out.freeze()
}

/// Peek at the declared total message length (`length + 8`) at the start
/// of `buf`: read the 4-byte length at offset 4. Returns `None` if fewer
/// than 8 bytes are available.
pub fn peek_total_message_len(buf: &[u8]) -> Option<usize> {
    if buf.len() < 8 {
        return None;
    }
    let length = u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]);
    Some(HEADER_LEN - 8 + length as usize)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> SomeIpHeader {
        SomeIpHeader {
            service: ServiceId(0x1234),
            method: MethodId(0x5678),
            length: 8,
            client: ClientId(0x0001),
            session: SessionId(0x0002),
            interface_version: 1,
            message_type: MessageType::Request,
            return_code: ReturnCode::Ok,
        }
    }

    #[test]
    fn round_trips() {
        let h = sample();
        let mut buf = BytesMut::new();
        h.encode(&mut buf);
        assert_eq!(buf.len(), HEADER_LEN);
        let mut slice = &buf[..];
        let decoded = SomeIpHeader::decode(&mut slice).unwrap();
        assert_eq!(decoded, h);
    }

    #[test]
    fn rejects_wrong_protocol_version() {
        let mut buf = BytesMut::new();
        sample().encode(&mut buf);
        buf[8] = 0x02;
        let mut slice = &buf[..];
        assert_eq!(
            SomeIpHeader::decode(&mut slice),
            Err(CodecError::UnsupportedProtocolVersion(0x02))
        );
    }

    #[test]
    fn encode_pdu_sets_length_from_payload() {
        let payload = [1u8, 2, 3, 4];
        let pdu = encode_pdu(&sample(), &payload);
        assert_eq!(pdu.len(), HEADER_LEN + payload.len());
        let total = peek_total_message_len(&pdu).unwrap();
        assert_eq!(total, pdu.len());
    }

    #[test]
    fn peek_total_message_len_needs_eight_bytes() {
        assert_eq!(peek_total_message_len(&[0u8; 7]), None);
    }
}
