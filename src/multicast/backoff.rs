use std::time::Duration;

/// Retransmission schedule of a reliable sender: the interval doubles after every round and
///  starts over at the base interval once doubling would exceed the ceiling.
///
/// The schedule is shared by all in-flight messages of a sender rather than tracked per message.
#[derive(Debug, Clone)]
pub struct Backoff {
    current: Duration,

    config_base: Duration,
    config_ceiling: Duration,
}

impl Backoff {
    pub fn new(base: Duration, ceiling: Duration) -> Backoff {
        assert!(!base.is_zero());
        assert!(ceiling >= base);

        Backoff {
            current: base,
            config_base: base,
            config_ceiling: ceiling,
        }
    }

    #[must_use]
    pub fn next_interval(&mut self) -> Duration {
        let result = self.current;

        let doubled = self.current.saturating_mul(2);
        self.current = if doubled > self.config_ceiling {
            self.config_base
        }
        else {
            doubled
        };

        result
    }

    pub fn reset(&mut self) {
        self.current = self.config_base;
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    fn ms(millis: u64) -> Duration {
        Duration::from_millis(millis)
    }

    #[rstest]
    #[case::initial(200, 200, 4000, 200, 400)]
    #[case::doubling(400, 200, 4000, 400, 800)]
    #[case::reaching_ceiling(2000, 200, 4000, 2000, 4000)]
    #[case::at_ceiling(4000, 200, 4000, 4000, 200)]
    #[case::would_exceed(3000, 200, 4000, 3000, 200)]
    #[case::base_equals_ceiling(100, 100, 100, 100, 100)]
    fn test_next_interval(
        #[case] current: u64,
        #[case] base: u64,
        #[case] ceiling: u64,
        #[case] expected_result: u64,
        #[case] expected_current: u64,
    ) {
        let mut backoff = Backoff {
            current: ms(current),
            config_base: ms(base),
            config_ceiling: ms(ceiling),
        };

        assert_eq!(backoff.next_interval(), ms(expected_result));
        assert_eq!(backoff.current, ms(expected_current));
    }

    #[test]
    fn test_full_cycle() {
        let mut backoff = Backoff::new(ms(200), ms(1000));
        let intervals = (0..6).map(|_| backoff.next_interval()).collect::<Vec<_>>();
        assert_eq!(intervals, vec![ms(200), ms(400), ms(800), ms(200), ms(400), ms(800)]);
    }

    #[test]
    fn test_reset() {
        let mut backoff = Backoff::new(ms(200), ms(4000));
        let _ = backoff.next_interval();
        let _ = backoff.next_interval();
        backoff.reset();
        assert_eq!(backoff.next_interval(), ms(200));
    }
}
