//! Utilities for testing code built on the multicast service. They are used for testing the
//!  crate itself, but they are also exported for the integration tests and application testing,
//!  which is why they are part of the crate's regular (non-#[cfg(test)]) code.

pub mod network;
pub mod node;
pub mod transport;
