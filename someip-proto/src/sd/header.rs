//! The SD payload envelope: flags followed by a length-prefixed run
//! of entries and a length-prefixed run of options. Carried as the payload
//! of a SOME/IP PDU addressed to `(SD_SERVICE, SD_METHOD)`.

use bytes::{Buf, BufMut};

use crate::error::CodecError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SdFlags {
    pub reboot: bool,
    pub unicast: bool,
    /// Explicit-initial-data-control, vsomeip's `ISSERVICE_DISCOVERY`-less
    /// extension bit; carried through unchanged by this codec.
    pub explicit_initial_data_control: bool,
}

impl SdFlags {
    pub fn encode(self) -> u8 {
        let mut byte = 0u8;
        if self.reboot {
            byte |= 0x80;
        }
        if self.unicast {
            byte |= 0x40;
        }
        if self.explicit_initial_data_control {
            byte |= 0x20;
        }
        byte
    }

    pub fn decode(byte: u8) -> Self {
        Self {
            reboot: byte & 0x80 != 0,
            unicast: byte & 0x40 != 0,
            explicit_initial_data_control: byte & 0x20 != 0,
        }
    }
}

pub(super) fn encode_header(out: &mut impl BufMut, flags: SdFlags) {
    out.put_u8(flags.encode());
    out.put_u8(0);
    out.put_u8(0);
    out.put_u8(0);
}

pub(super) fn decode_header(buf: &mut impl Buf) -> Result<SdFlags, CodecError> {
    if buf.remaining() < 4 {
        return Err(CodecError::Truncated {
            needed: 4,
            have: buf.remaining(),
        });
    }
    let flags = SdFlags::decode(buf.get_u8());
    buf.advance(3);
    Ok(flags)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_round_trip() {
        let flags = SdFlags {
            reboot: true,
            unicast: false,
            explicit_initial_data_control: true,
        };
        assert_eq!(SdFlags::decode(flags.encode()), flags);
    }
}
