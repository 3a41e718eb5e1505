//! SD options: variable-length records referenced by entries, mostly
//! carrying a transport endpoint or multicast address.

use std::net::{Ipv4Addr, Ipv6Addr};

use bytes::{Buf, BufMut};

use crate::error::CodecError;
use crate::primitive::{ClientId, Reliability};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LayerFourProtocol {
    Tcp,
    Udp,
}

impl LayerFourProtocol {
    fn to_wire(self) -> u8 {
        match self {
            LayerFourProtocol::Tcp => 0x06,
            LayerFourProtocol::Udp => 0x11,
        }
    }

    fn from_wire(v: u8) -> Result<Self, CodecError> {
        match v {
            0x06 => Ok(LayerFourProtocol::Tcp),
            0x11 => Ok(LayerFourProtocol::Udp),
            other => Err(CodecError::InvalidLayerFourProtocol(other)),
        }
    }

    pub fn reliability(self) -> Reliability {
        match self {
            LayerFourProtocol::Tcp => Reliability::Reliable,
            LayerFourProtocol::Udp => Reliability::Unreliable,
        }
    }

    pub fn from_reliability(r: Reliability) -> Self {
        match r {
            Reliability::Reliable => LayerFourProtocol::Tcp,
            Reliability::Unreliable => LayerFourProtocol::Udp,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Option_ {
    Ip4Endpoint {
        address: Ipv4Addr,
        proto: LayerFourProtocol,
        port: u16,
    },
    Ip6Endpoint {
        address: Ipv6Addr,
        proto: LayerFourProtocol,
        port: u16,
    },
    Ip4Multicast {
        address: Ipv4Addr,
        port: u16,
    },
    Ip6Multicast {
        address: Ipv6Addr,
        port: u16,
    },
    /// Configuration string option: a run of `key\0value\0`-terminated
    /// pairs. Carried opaquely; nothing in this crate interprets it.
    Configuration(Vec<u8>),
    /// Selective-event option: attached to an eventgroup entry, names the
    /// subset of client ids that are meant to receive that subscribe-ack
    /// (and, transitively, updates for the selective event it covers).
    Selective(Vec<ClientId>),
}

const TYPE_CONFIGURATION: u8 = 0x01;
const TYPE_IP4_ENDPOINT: u8 = 0x04;
const TYPE_IP6_ENDPOINT: u8 = 0x06;
const TYPE_IP4_MULTICAST: u8 = 0x14;
const TYPE_IP6_MULTICAST: u8 = 0x16;
const TYPE_SELECTIVE: u8 = 0x30;

impl Option_ {
    /// Encode as `length(2) | type(1) | reserved(1) | payload`, where
    /// `length` counts everything after itself.
    pub fn encode(&self, out: &mut impl BufMut) {
        match self {
            Option_::Ip4Endpoint { address, proto, port } => {
                out.put_u16(9);
                out.put_u8(TYPE_IP4_ENDPOINT);
                out.put_u8(0);
                out.put_slice(&address.octets());
                out.put_u8(0);
                out.put_u8(proto.to_wire());
                out.put_u16(*port);
            }
            Option_::Ip6Endpoint { address, proto, port } => {
                out.put_u16(21);
                out.put_u8(TYPE_IP6_ENDPOINT);
                out.put_u8(0);
                out.put_slice(&address.octets());
                out.put_u8(0);
                out.put_u8(proto.to_wire());
                out.put_u16(*port);
            }
            Option_::Ip4Multicast { address, port } => {
                out.put_u16(9);
                out.put_u8(TYPE_IP4_MULTICAST);
                out.put_u8(0);
                out.put_slice(&address.octets());
                out.put_u8(0);
                out.put_u8(LayerFourProtocol::Udp.to_wire());
                out.put_u16(*port);
            }
            Option_::Ip6Multicast { address, port } => {
                out.put_u16(21);
                out.put_u8(TYPE_IP6_MULTICAST);
                out.put_u8(0);
                out.put_slice(&address.octets());
                out.put_u8(0);
                out.put_u8(LayerFourProtocol::Udp.to_wire());
                out.put_u16(*port);
            }
            Option_::Configuration(bytes) => {
                out.put_u16(1 + bytes.len() as u16);
                out.put_u8(TYPE_CONFIGURATION);
                out.put_u8(0);
                out.put_slice(bytes);
            }
            Option_::Selective(clients) => {
                out.put_u16(1 + 2 * clients.len() as u16);
                out.put_u8(TYPE_SELECTIVE);
                out.put_u8(0);
                for client in clients {
                    out.put_u16(client.0);
                }
            }
        }
    }

    pub fn decode(buf: &mut impl Buf) -> Result<Self, CodecError> {
        if buf.remaining() < 3 {
            return Err(CodecError::Truncated {
                needed: 3,
                have: buf.remaining(),
            });
        }
        let length = buf.get_u16() as usize;
        if buf.remaining() < length {
            return Err(CodecError::Truncated {
                needed: length,
                have: buf.remaining(),
            });
        }
        let ty = buf.get_u8();
        let _reserved = buf.get_u8();
        let payload_len = length - 2;

        match ty {
            TYPE_IP4_ENDPOINT | TYPE_IP4_MULTICAST => {
                if payload_len != 7 {
                    return Err(CodecError::Truncated {
                        needed: 7,
                        have: payload_len,
                    });
                }
                let mut octets = [0u8; 4];
                buf.copy_to_slice(&mut octets);
                let _reserved = buf.get_u8();
                let proto = LayerFourProtocol::from_wire(buf.get_u8())?;
                let port = buf.get_u16();
                let address = Ipv4Addr::from(octets);
                Ok(if ty == TYPE_IP4_ENDPOINT {
                    Option_::Ip4Endpoint { address, proto, port }
                } else {
                    Option_::Ip4Multicast { address, port }
                })
            }
            TYPE_IP6_ENDPOINT | TYPE_IP6_MULTICAST => {
                if payload_len != 19 {
                    return Err(CodecError::Truncated {
                        needed: 19,
                        have: payload_len,
                    });
                }
                let mut octets = [0u8; 16];
                buf.copy_to_slice(&mut octets);
                let _reserved = buf.get_u8();
                let proto = LayerFourProtocol::from_wire(buf.get_u8())?;
                let port = buf.get_u16();
                let address = Ipv6Addr::from(octets);
                Ok(if ty == TYPE_IP6_ENDPOINT {
                    Option_::Ip6Endpoint { address, proto, port }
                } else {
                    Option_::Ip6Multicast { address, port }
                })
            }
            TYPE_CONFIGURATION => {
                let mut bytes = vec![0u8; payload_len];
                buf.copy_to_slice(&mut bytes);
                Ok(Option_::Configuration(bytes))
            }
            TYPE_SELECTIVE => {
                if payload_len % 2 != 0 {
                    return Err(CodecError::Truncated {
                        needed: payload_len + 1,
                        have: payload_len,
                    });
                }
                let mut clients = Vec::with_capacity(payload_len / 2);
                for _ in 0..payload_len / 2 {
                    clients.push(ClientId(buf.get_u16()));
                }
                Ok(Option_::Selective(clients))
            }
            other => {
                // Skip unknown option payloads rather than failing the
                // whole message: unknown options must be ignorable.
                buf.advance(payload_len);
                Err(CodecError::UnknownOptionType(other))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;

    #[test]
    fn ip4_endpoint_round_trips() {
        let opt = Option_::Ip4Endpoint {
            address: Ipv4Addr::new(192, 0, 2, 1),
            proto: LayerFourProtocol::Udp,
            port: 30501,
        };
        let mut buf = BytesMut::new();
        opt.encode(&mut buf);
        let mut slice = &buf[..];
        assert_eq!(Option_::decode(&mut slice).unwrap(), opt);
    }

    #[test]
    fn ip6_multicast_round_trips() {
        let opt = Option_::Ip6Multicast {
            address: Ipv6Addr::new(0xff02, 0, 0, 0, 0, 0, 0, 1),
            port: 30490,
        };
        let mut buf = BytesMut::new();
        opt.encode(&mut buf);
        let mut slice = &buf[..];
        assert_eq!(Option_::decode(&mut slice).unwrap(), opt);
    }

    #[test]
    fn selective_option_round_trips_client_list() {
        let opt = Option_::Selective(vec![ClientId(0x0001), ClientId(0x0002), ClientId(0xbeef)]);
        let mut buf = BytesMut::new();
        opt.encode(&mut buf);
        let mut slice = &buf[..];
        assert_eq!(Option_::decode(&mut slice).unwrap(), opt);
    }

    #[test]
    fn unknown_option_type_is_reported_but_skippable() {
        let mut buf = BytesMut::new();
        buf.put_u16(3);
        buf.put_u8(0x7f);
        buf.put_u8(0);
        buf.put_slice(b"xx");
        let mut slice = &buf[..];
        assert_eq!(Option_::decode(&mut slice), Err(CodecError::UnknownOptionType(0x7f)));
        assert_eq!(slice.remaining(), 0, "payload was skipped so later options stay aligned");
    }
}
