//! Group membership collaborators of the multicast service: a start-up barrier on the probe port
//!  and a heartbeat failure detector on the heartbeat port.

pub mod failure_detector;
pub mod readiness;
