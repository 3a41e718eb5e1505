//! Error taxonomy for the sans-IO layer. Protocol-level errors:
//! malformed headers, truncated SD messages, invalid option combinations.

use thiserror::Error;

/// Malformed-message / wire-decode errors. The owning endpoint logs and
/// drops the offending PDU (TCP: resync on the magic cookie if enabled;
/// UDP: discard the datagram) rather than propagating this further.
#[derive(Debug, Error, PartialEq, Eq, Clone)]
#[non_exhaustive]
pub enum CodecError {
    #[error("buffer too short: need at least {needed} bytes, have {have}")]
    Truncated { needed: usize, have: usize },

    #[error("someip header declares protocol version {0:#04x}, expected 0x01")]
    UnsupportedProtocolVersion(u8),

    #[error("someip length field {0} is inconsistent with the buffer size")]
    InconsistentLength(u32),

    #[error("message exceeds the configured maximum size of {max} bytes")]
    TooLarge { max: usize },

    #[error("unknown SD entry type {0:#04x}")]
    UnknownEntryType(u8),

    #[error("unknown SD option type {0:#04x}")]
    UnknownOptionType(u8),

    #[error("SD entry references option index {index} but only {available} options are present")]
    OptionIndexOutOfRange { index: u8, available: usize },

    #[error("subscribe entry carries two endpoint options of the same layer-4 protocol")]
    DuplicateEndpointOptionProtocol,

    #[error("endpoint option layer-4 protocol must be TCP or UDP, got {0:#04x}")]
    InvalidLayerFourProtocol(u8),

    #[error("malformed magic cookie resync point")]
    MagicCookieResync,

    #[error("unknown local routing-channel command code {0:#04x}")]
    UnknownCommandCode(u8),
}

/// Invalid configuration values, rejected at construction time rather than
/// discovered later as a silent misbehavior.
#[derive(Debug, Error, PartialEq, Eq, Clone)]
#[non_exhaustive]
pub enum ConfigError {
    #[error("sd_initial_delay_min ({min:?}) must not exceed sd_initial_delay_max ({max:?})")]
    InitialDelayRangeInverted {
        min: std::time::Duration,
        max: std::time::Duration,
    },

    #[error("ttl factor must be at least 1, got {0}")]
    ZeroTtlFactor(u32),
}
