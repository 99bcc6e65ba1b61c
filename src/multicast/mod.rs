pub mod backoff;
pub mod fault;
pub mod hold_back_queue;
pub mod reliable_sender;
pub mod sequencer;
pub mod service;
