//! The service-discovery offer/find repetition-phase state machine:
//! an entity starts in `InitialWait`, repeats with exponential backoff
//! during `Repetition`, and settles into steady-state `Main` sending.

use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Waiting out the randomized `[initial_delay_min, initial_delay_max]`
    /// window before the first send.
    InitialWait,
    /// Repeating with a doubling `base_delay`, up to `max_repetitions`
    /// times (`0` meaning the repetition phase is skipped entirely).
    Repetition { sent: u32 },
    /// Steady state: sends every `cyclic_offer_delay`, forever, until
    /// stopped.
    Main,
}

impl Phase {
    /// Advance from the current phase given the repetition configuration,
    /// returning the next phase and the delay to wait before the next send.
    pub fn advance(self, max_repetitions: u32, base_delay: Duration) -> (Phase, Duration) {
        match self {
            Phase::InitialWait => {
                if max_repetitions == 0 {
                    (Phase::Main, base_delay)
                } else {
                    (Phase::Repetition { sent: 1 }, base_delay)
                }
            }
            Phase::Repetition { sent } => {
                if sent >= max_repetitions {
                    (Phase::Main, base_delay)
                } else {
                    let delay = base_delay.saturating_mul(1 << sent.min(16));
                    (Phase::Repetition { sent: sent + 1 }, delay)
                }
            }
            Phase::Main => (Phase::Main, base_delay),
        }
    }

    pub fn is_main(self) -> bool {
        matches!(self, Phase::Main)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn repetition_delay_doubles_until_main() {
        let base = Duration::from_millis(50);
        let (p1, d1) = Phase::InitialWait.advance(3, base);
        assert_eq!(p1, Phase::Repetition { sent: 1 });
        assert_eq!(d1, base);

        let (p2, d2) = p1.advance(3, base);
        assert_eq!(p2, Phase::Repetition { sent: 2 });
        assert_eq!(d2, base * 2);

        let (p3, d3) = p2.advance(3, base);
        assert_eq!(p3, Phase::Repetition { sent: 3 });
        assert_eq!(d3, base * 4);

        let (p4, _) = p3.advance(3, base);
        assert_eq!(p4, Phase::Main);
    }

    #[test]
    fn zero_repetitions_skips_straight_to_main() {
        let (phase, _) = Phase::InitialWait.advance(0, Duration::from_millis(10));
        assert_eq!(phase, Phase::Main);
    }
}
