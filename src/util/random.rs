use rand::Rng;
#[cfg(test)] use std::sync::Mutex;


#[cfg(test)]
/// automock expectations for static methods are global - hold this lock to avoid races
pub static MOCK_RANDOM_MUTEX: Mutex<()> = Mutex::new(());

/// Source of randomness for fault injection, abstracted so that tests can force outcomes
#[cfg_attr(test, mockall::automock)]
pub trait Random: Send + Sync + 'static {
    /// uniformly distributed in `[0.0, 1.0)`
    fn next_probability() -> f64;
}

pub struct RngRandom {}
impl Random for RngRandom {
    fn next_probability() -> f64 {
        rand::rng().random_range(0.0..1.0)
    }
}
