use std::time::Duration;

use anyhow::bail;

pub const DEFAULT_PROBE_PORT: u16 = 10000;
pub const DEFAULT_MULTICAST_PORT: u16 = 10001;
pub const DEFAULT_HEARTBEAT_PORT: u16 = 10002;

#[derive(Debug, Clone)]
pub struct MulticastConfig {
    /// well-known port of the multicast protocol's datagram socket on every peer
    pub multicast_port: u16,
    /// port of the readiness barrier's probing socket
    pub probe_port: u16,
    /// port of the failure detector's heartbeat socket
    pub heartbeat_port: u16,

    /// first sleep between two retransmission rounds of a reliable sender
    pub retransmit_base_interval: Duration,
    /// the retransmission interval doubles after every round and falls back to the base
    ///  interval once it would exceed this ceiling
    pub retransmit_max_interval: Duration,

    /// probability in `[0.0, 1.0]` of discarding an incoming record before processing it
    pub drop_rate: f64,
    /// artificial delay before replying with an Ack or SeqAck
    pub message_delay: Duration,
    /// probability in `[0.0, 1.0]` that a reply is delayed by `message_delay`
    pub delay_probability: f64,

    pub probe_interval: Duration,

    pub heartbeat_interval: Duration,
    /// number of consecutive heartbeat intervals without a heartbeat that a peer survives
    pub heartbeat_misses_before_failure: u32,

    pub record_channel_capacity: usize,
}

impl Default for MulticastConfig {
    fn default() -> Self {
        MulticastConfig::new(0.0, Duration::ZERO)
    }
}

impl MulticastConfig {
    pub fn new(drop_rate: f64, message_delay: Duration) -> MulticastConfig {
        MulticastConfig {
            multicast_port: DEFAULT_MULTICAST_PORT,
            probe_port: DEFAULT_PROBE_PORT,
            heartbeat_port: DEFAULT_HEARTBEAT_PORT,
            retransmit_base_interval: Duration::from_millis(200),
            retransmit_max_interval: Duration::from_secs(4),
            drop_rate,
            message_delay,
            delay_probability: 0.5,
            probe_interval: Duration::from_secs(1),
            heartbeat_interval: Duration::from_secs(1),
            heartbeat_misses_before_failure: 2,
            record_channel_capacity: 1024,
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if !(0.0..=1.0).contains(&self.drop_rate) {
            bail!("drop rate must be between 0 and 1, was {}", self.drop_rate);
        }
        if !(0.0..=1.0).contains(&self.delay_probability) {
            bail!("delay probability must be between 0 and 1, was {}", self.delay_probability);
        }
        if self.retransmit_base_interval.is_zero() {
            bail!("retransmission base interval must be positive");
        }
        if self.retransmit_max_interval < self.retransmit_base_interval {
            bail!("retransmission ceiling {:?} is below the base interval {:?}", self.retransmit_max_interval, self.retransmit_base_interval);
        }
        if self.record_channel_capacity == 0 {
            bail!("record channel capacity must be positive");
        }
        Ok(())
    }
}
