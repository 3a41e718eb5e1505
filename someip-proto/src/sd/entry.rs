//! SD entries: 16-byte records referencing 0, 1, or 2 options by
//! index, carrying either a service (find/offer) or an eventgroup
//! (subscribe/subscribe-ack) action.

use bytes::{Buf, BufMut};

use crate::error::CodecError;
use crate::primitive::{EventgroupId, InstanceId, MajorVersion, MinorVersion, ServiceId, Ttl};

pub const ENTRY_LEN: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceEntryType {
    Find,
    Offer,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventgroupEntryType {
    Subscribe,
    SubscribeAck,
}

/// Which options (by index into the SD message's option array) an entry
/// references, and how many of each run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct OptionRefs {
    pub index1: u8,
    pub count1: u8,
    pub index2: u8,
    pub count2: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServiceEntry {
    pub kind: ServiceEntryType,
    pub options: OptionRefs,
    pub service: ServiceId,
    pub instance: InstanceId,
    pub major: MajorVersion,
    pub ttl: Ttl,
    pub minor: MinorVersion,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventgroupEntry {
    pub kind: EventgroupEntryType,
    pub options: OptionRefs,
    pub service: ServiceId,
    pub instance: InstanceId,
    pub major: MajorVersion,
    pub ttl: Ttl,
    /// Counter distinguishing multiple subscriptions to the same
    /// eventgroup carried in separate entries within one message.
    pub counter: u8,
    pub eventgroup: EventgroupId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Entry {
    Service(ServiceEntry),
    Eventgroup(EventgroupEntry),
}

impl Entry {
    pub fn encode(&self, out: &mut impl BufMut) {
        match self {
            Entry::Service(e) => {
                let ty = match e.kind {
                    ServiceEntryType::Find => 0x00,
                    ServiceEntryType::Offer => 0x01,
                };
                out.put_u8(ty);
                out.put_u8(e.options.index1);
                out.put_u8(e.options.index2);
                out.put_u8((e.options.count1 << 4) | (e.options.count2 & 0x0f));
                out.put_u16(e.service.get());
                out.put_u16(e.instance.get());
                out.put_u8(e.major.0);
                put_u24(out, e.ttl.0.min(Ttl::MAX_WIRE));
                out.put_u32(e.minor.0);
            }
            Entry::Eventgroup(e) => {
                let ty = match e.kind {
                    EventgroupEntryType::Subscribe => 0x06,
                    EventgroupEntryType::SubscribeAck => 0x07,
                };
                out.put_u8(ty);
                out.put_u8(e.options.index1);
                out.put_u8(e.options.index2);
                out.put_u8((e.options.count1 << 4) | (e.options.count2 & 0x0f));
                out.put_u16(e.service.get());
                out.put_u16(e.instance.get());
                out.put_u8(e.major.0);
                put_u24(out, e.ttl.0.min(Ttl::MAX_WIRE));
                out.put_u8(0); // reserved
                out.put_u8(e.counter & 0x0f);
                out.put_u16(e.eventgroup.get());
            }
        }
    }

    pub fn decode(buf: &mut impl Buf) -> Result<Self, CodecError> {
        if buf.remaining() < ENTRY_LEN {
            return Err(CodecError::Truncated {
                needed: ENTRY_LEN,
                have: buf.remaining(),
            });
        }
        let ty = buf.get_u8();
        let index1 = buf.get_u8();
        let index2 = buf.get_u8();
        let counts = buf.get_u8();
        let options = OptionRefs {
            index1,
            index2,
            count1: counts >> 4,
            count2: counts & 0x0f,
        };
        let service = ServiceId(buf.get_u16());
        let instance = InstanceId(buf.get_u16());
        let major = MajorVersion(buf.get_u8());
        let ttl = Ttl(get_u24(buf));

        match ty {
            0x00 | 0x01 => {
                let minor = MinorVersion(buf.get_u32());
                Ok(Entry::Service(ServiceEntry {
                    kind: if ty == 0x00 {
                        ServiceEntryType::Find
                    } else {
                        ServiceEntryType::Offer
                    },
                    options,
                    service,
                    instance,
                    major,
                    ttl,
                    minor,
                }))
            }
            0x06 | 0x07 => {
                let _reserved = buf.get_u8();
                let counter = buf.get_u8() & 0x0f;
                let eventgroup = EventgroupId(buf.get_u16());
                Ok(Entry::Eventgroup(EventgroupEntry {
                    kind: if ty == 0x06 {
                        EventgroupEntryType::Subscribe
                    } else {
                        EventgroupEntryType::SubscribeAck
                    },
                    options,
                    service,
                    instance,
                    major,
                    ttl,
                    counter,
                    eventgroup,
                }))
            }
            other => Err(CodecError::UnknownEntryType(other)),
        }
    }
}

fn put_u24(out: &mut impl BufMut, value: u32) {
    out.put_u8((value >> 16) as u8);
    out.put_u8((value >> 8) as u8);
    out.put_u8(value as u8);
}

fn get_u24(buf: &mut impl Buf) -> u32 {
    let a = buf.get_u8() as u32;
    let b = buf.get_u8() as u32;
    let c = buf.get_u8() as u32;
    (a << 16) | (b << 8) | c
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;

    #[test]
    fn service_entry_round_trips() {
        let entry = Entry::Service(ServiceEntry {
            kind: ServiceEntryType::Offer,
            options: OptionRefs {
                index1: 0,
                count1: 1,
                index2: 0,
                count2: 0,
            },
            service: ServiceId(0x1234),
            instance: InstanceId(0x0001),
            major: MajorVersion(1),
            ttl: Ttl(3),
            minor: MinorVersion::ANY,
        });
        let mut buf = BytesMut::new();
        entry.encode(&mut buf);
        assert_eq!(buf.len(), ENTRY_LEN);
        let mut slice = &buf[..];
        assert_eq!(Entry::decode(&mut slice).unwrap(), entry);
    }

    #[test]
    fn eventgroup_entry_round_trips() {
        let entry = Entry::Eventgroup(EventgroupEntry {
            kind: EventgroupEntryType::Subscribe,
            options: OptionRefs {
                index1: 0,
                count1: 1,
                index2: 0,
                count2: 0,
            },
            service: ServiceId(0x1234),
            instance: InstanceId(0x0001),
            major: MajorVersion(1),
            ttl: Ttl(3),
            counter: 0,
            eventgroup: EventgroupId(0x0001),
        });
        let mut buf = BytesMut::new();
        entry.encode(&mut buf);
        assert_eq!(buf.len(), ENTRY_LEN);
        let mut slice = &buf[..];
        assert_eq!(Entry::decode(&mut slice).unwrap(), entry);
    }

    #[test]
    fn unknown_entry_type_is_rejected() {
        let mut buf = BytesMut::new();
        buf.put_u8(0x42);
        buf.put_bytes(0, ENTRY_LEN - 1);
        let mut slice = &buf[..];
        assert_eq!(Entry::decode(&mut slice), Err(CodecError::UnknownEntryType(0x42)));
    }
}
