//! The full SD message: flags, entries, and options, plus the few
//! cross-entry interpretation rules that only make sense at the message
//! level (resolving an entry's referenced options, and recognizing the
//! stop+start composite messages used to refresh a subscription or offer
//! without a gap).

use bytes::{Buf, BufMut, Bytes, BytesMut};

use super::entry::{Entry, EventgroupEntry, EventgroupEntryType, ServiceEntry, ServiceEntryType, ENTRY_LEN};
use super::header::{decode_header, encode_header, SdFlags};
use super::option::Option_;
use crate::error::CodecError;

#[derive(Debug, Clone, Default)]
pub struct SdMessage {
    pub flags: SdFlags,
    pub entries: Vec<Entry>,
    pub options: Vec<Option_>,
}

impl SdMessage {
    pub fn new(flags: SdFlags) -> Self {
        Self {
            flags,
            entries: Vec::new(),
            options: Vec::new(),
        }
    }

    pub fn encode(&self) -> Bytes {
        let mut out = BytesMut::new();
        encode_header(&mut out, self.flags);

        out.put_u32(self.entries.len() as u32 * ENTRY_LEN as u32);
        for entry in &self.entries {
            entry.encode(&mut out);
        }

        let options_start = out.len();
        out.put_u32(0); // patched below
        for option in &self.options {
            option.encode(&mut out);
        }
        let options_len = (out.len() - options_start - 4) as u32;
        out[options_start..options_start + 4].copy_from_slice(&options_len.to_be_bytes());

        out.freeze()
    }

    pub fn decode(mut buf: &[u8]) -> Result<Self, CodecError> {
        let flags = decode_header(&mut buf)?;

        if buf.remaining() < 4 {
            return Err(CodecError::Truncated {
                needed: 4,
                have: buf.remaining(),
            });
        }
        let entries_len = buf.get_u32() as usize;
        if buf.remaining() < entries_len {
            return Err(CodecError::Truncated {
                needed: entries_len,
                have: buf.remaining(),
            });
        }
        let mut entries_buf = &buf[..entries_len];
        buf.advance(entries_len);
        let mut entries = Vec::new();
        while entries_buf.has_remaining() {
            entries.push(Entry::decode(&mut entries_buf)?);
        }

        if buf.remaining() < 4 {
            return Err(CodecError::Truncated {
                needed: 4,
                have: buf.remaining(),
            });
        }
        let options_len = buf.get_u32() as usize;
        if buf.remaining() < options_len {
            return Err(CodecError::Truncated {
                needed: options_len,
                have: buf.remaining(),
            });
        }
        let mut options_buf = &buf[..options_len];
        buf.advance(options_len);
        let mut options = Vec::new();
        while options_buf.has_remaining() {
            match Option_::decode(&mut options_buf) {
                Ok(opt) => options.push(opt),
                // An unknown-but-skippable option still needs a slot so
                // that later entries' option indices stay aligned.
                Err(CodecError::UnknownOptionType(_)) => {
                    options.push(Option_::Configuration(Vec::new()))
                }
                Err(e) => return Err(e),
            }
        }

        for entry in &entries {
            let refs = match entry {
                Entry::Service(e) => e.options,
                Entry::Eventgroup(e) => e.options,
            };
            let used = refs.count1 as usize + refs.count2 as usize;
            if used > 0 {
                let max_index = if refs.count2 > 0 {
                    refs.index2
                } else {
                    refs.index1
                } as usize;
                if max_index >= options.len() {
                    return Err(CodecError::OptionIndexOutOfRange {
                        index: max_index as u8,
                        available: options.len(),
                    });
                }
            }
        }

        Ok(Self {
            flags,
            entries,
            options,
        })
    }

    /// Options an entry references, resolved by index. Skips options a
    /// prior decode pass
    /// replaced with an empty placeholder for an unrecognized type.
    pub fn resolve_options(&self, entry: &Entry) -> Vec<&Option_> {
        let refs = match entry {
            Entry::Service(e) => e.options,
            Entry::Eventgroup(e) => e.options,
        };
        let mut out = Vec::new();
        for i in 0..refs.count1 {
            if let Some(opt) = self.options.get(refs.index1 as usize + i as usize) {
                out.push(opt);
            }
        }
        for i in 0..refs.count2 {
            if let Some(opt) = self.options.get(refs.index2 as usize + i as usize) {
                out.push(opt);
            }
        }
        out
    }

    /// True if this message carries both a stop (`ttl == 0`) and a start
    /// (`ttl > 0`) service entry for the same `(service, instance)` — the
    /// "stopoffer+offer" composite used to refresh an offer without a gap
    /// where a subscriber could consider it gone.
    pub fn has_stop_start_service_pair(&self, service: crate::ServiceId, instance: crate::InstanceId) -> bool {
        has_pair(self.entries.iter().filter_map(|e| match e {
            Entry::Service(s) if s.service == service && s.instance == instance => Some(s.ttl.is_stop()),
            _ => None,
        }))
    }

    /// Same composite check for subscribe/subscribe-ack eventgroup entries.
    pub fn has_stop_start_eventgroup_pair(
        &self,
        service: crate::ServiceId,
        instance: crate::InstanceId,
        eventgroup: crate::EventgroupId,
    ) -> bool {
        has_pair(self.entries.iter().filter_map(|e| match e {
            Entry::Eventgroup(eg)
                if eg.kind == EventgroupEntryType::Subscribe
                    && eg.service == service
                    && eg.instance == instance
                    && eg.eventgroup == eventgroup =>
            {
                Some(eg.ttl.is_stop())
            }
            _ => None,
        }))
    }
}

fn has_pair(flags: impl Iterator<Item = bool>) -> bool {
    let (mut saw_stop, mut saw_start) = (false, false);
    for is_stop in flags {
        if is_stop {
            saw_stop = true;
        } else {
            saw_start = true;
        }
    }
    saw_stop && saw_start
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sd::entry::OptionRefs;
    use crate::{EventgroupId, InstanceId, MajorVersion, MinorVersion, ServiceId, Ttl};
    use std::net::Ipv4Addr;

    fn offer(ttl: Ttl) -> Entry {
        Entry::Service(ServiceEntry {
            kind: ServiceEntryType::Offer,
            options: OptionRefs {
                index1: 0,
                count1: 1,
                index2: 0,
                count2: 0,
            },
            service: ServiceId(1),
            instance: InstanceId(1),
            major: MajorVersion(1),
            ttl,
            minor: MinorVersion::ANY,
        })
    }

    #[test]
    fn message_with_entries_and_options_round_trips() {
        let mut msg = SdMessage::new(SdFlags {
            reboot: true,
            unicast: true,
            explicit_initial_data_control: false,
        });
        msg.entries.push(offer(Ttl(3)));
        msg.options.push(Option_::Ip4Endpoint {
            address: Ipv4Addr::new(192, 0, 2, 5),
            proto: crate::sd::option::LayerFourProtocol::Udp,
            port: 30501,
        });

        let encoded = msg.encode();
        let decoded = SdMessage::decode(&encoded).unwrap();
        assert_eq!(decoded.flags, msg.flags);
        assert_eq!(decoded.entries, msg.entries);
        assert_eq!(decoded.options.len(), 1);
    }

    #[test]
    fn detects_stopoffer_offer_composite() {
        let mut msg = SdMessage::new(SdFlags::default());
        msg.entries.push(offer(Ttl::STOP));
        msg.entries.push(offer(Ttl(3)));
        assert!(msg.has_stop_start_service_pair(ServiceId(1), InstanceId(1)));
    }

    #[test]
    fn single_offer_is_not_a_composite() {
        let mut msg = SdMessage::new(SdFlags::default());
        msg.entries.push(offer(Ttl(3)));
        assert!(!msg.has_stop_start_service_pair(ServiceId(1), InstanceId(1)));
    }

    #[test]
    fn out_of_range_option_index_is_rejected() {
        let mut msg = SdMessage::new(SdFlags::default());
        msg.entries.push(Entry::Eventgroup(EventgroupEntry {
            kind: EventgroupEntryType::Subscribe,
            options: OptionRefs {
                index1: 5,
                count1: 1,
                index2: 0,
                count2: 0,
            },
            service: ServiceId(1),
            instance: InstanceId(1),
            major: MajorVersion(1),
            ttl: Ttl(3),
            counter: 0,
            eventgroup: EventgroupId(1),
        }));
        let encoded = msg.encode();
        assert!(matches!(
            SdMessage::decode(&encoded),
            Err(CodecError::OptionIndexOutOfRange { .. })
        ));
    }
}
