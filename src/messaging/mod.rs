pub mod control;
pub mod roster;
pub mod transport;
pub mod wire;
