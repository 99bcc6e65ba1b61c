use std::marker::PhantomData;
use std::time::Duration;

use tracing::warn;

use crate::config::MulticastConfig;
use crate::messaging::wire::RecordKind;
use crate::util::random::{Random, RngRandom};

/// Artificial message loss and reply delay, for exercising the protocol's retransmission and
///  reordering paths on a well-behaved network.
pub struct FaultInjector<R: Random = RngRandom> {
    drop_rate: f64,
    message_delay: Duration,
    delay_probability: f64,
    _random: PhantomData<fn() -> R>,
}

impl<R: Random> FaultInjector<R> {
    pub fn new(config: &MulticastConfig) -> FaultInjector<R> {
        FaultInjector {
            drop_rate: config.drop_rate,
            message_delay: config.message_delay,
            delay_probability: config.delay_probability,
            _random: PhantomData,
        }
    }

    /// Decides whether an incoming record is discarded before it is processed
    pub fn should_drop(&self, kind: RecordKind) -> bool {
        if self.drop_rate <= 0.0 {
            return false;
        }

        let drop = R::next_probability() < self.drop_rate;
        if drop {
            warn!("dropping incoming {:?} record", kind);
        }
        drop
    }

    pub async fn maybe_delay(&self, kind: RecordKind) {
        if self.message_delay.is_zero() {
            return;
        }

        if R::next_probability() < self.delay_probability {
            warn!("delaying {:?} reply by {:?}", kind, self.message_delay);
            tokio::time::sleep(self.message_delay).await;
        }
    }
}
