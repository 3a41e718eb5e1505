//! Configuration values consumed by the state machines in this crate:
//! service-discovery timers and TTL scaling factors.

use std::time::Duration;

use crate::error::ConfigError;

/// Timers governing the offer/find repetition phase machine,
/// grounded on vsomeip's `INITIAL_DELAY_MIN`/`..._MAX`/`REPETITIONS_BASE_DELAY`/
/// `REPETITIONS_MAX`/`CYCLIC_OFFER_DELAY` configuration knobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SdTimers {
    pub initial_delay_min: Duration,
    pub initial_delay_max: Duration,
    pub repetitions_base_delay: Duration,
    pub repetitions_max: u32,
    pub cyclic_offer_delay: Duration,
    pub ttl_factor_offers: u32,
    pub ttl_factor_subscriptions: u32,
}

impl SdTimers {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.initial_delay_min > self.initial_delay_max {
            return Err(ConfigError::InitialDelayRangeInverted {
                min: self.initial_delay_min,
                max: self.initial_delay_max,
            });
        }
        if self.ttl_factor_offers == 0 {
            return Err(ConfigError::ZeroTtlFactor(self.ttl_factor_offers));
        }
        if self.ttl_factor_subscriptions == 0 {
            return Err(ConfigError::ZeroTtlFactor(self.ttl_factor_subscriptions));
        }
        Ok(())
    }
}

impl Default for SdTimers {
    fn default() -> Self {
        Self {
            initial_delay_min: Duration::from_millis(10),
            initial_delay_max: Duration::from_millis(100),
            repetitions_base_delay: Duration::from_millis(200),
            repetitions_max: 3,
            cyclic_offer_delay: Duration::from_secs(2),
            ttl_factor_offers: 1,
            ttl_factor_subscriptions: 1,
        }
    }
}

/// Per-direction TTL scaling applied when a wire TTL is installed as a
/// local expiry timer. The wire always carries the unscaled TTL; factors
/// are a purely local multiplier applied once on receipt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TtlFactors {
    pub offers: u32,
    pub subscriptions: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_inverted_initial_delay_range() {
        let mut timers = SdTimers::default();
        timers.initial_delay_min = Duration::from_millis(200);
        timers.initial_delay_max = Duration::from_millis(100);
        assert!(matches!(
            timers.validate(),
            Err(ConfigError::InitialDelayRangeInverted { .. })
        ));
    }

    #[test]
    fn rejects_zero_ttl_factor() {
        let mut timers = SdTimers::default();
        timers.ttl_factor_offers = 0;
        assert!(matches!(timers.validate(), Err(ConfigError::ZeroTtlFactor(0))));
    }
}
