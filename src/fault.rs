use rand::Rng;
use std::time::Duration;

/// Probabilistic failure and latency injection for durability paths.
///
/// WAL appends, snapshot writes, and replication sends take an injector plus
/// their own knobs (delay, fail probability) from the node configuration.
/// With the default zero knobs every call is a no-op.
#[derive(Debug, Default, Clone)]
pub struct FaultInjector;

impl FaultInjector {
    pub fn new() -> Self {
        FaultInjector
    }

    /// Rolls the dice; `probability` of 0.0 never fails, 1.0 always fails.
    pub fn should_fail(&self, probability: f64) -> bool {
        if probability <= 0.0 {
            return false;
        }
        if probability >= 1.0 {
            return true;
        }
        rand::thread_rng().gen_bool(probability)
    }

    /// Sleeps for `delay` when non-zero.
    pub fn maybe_delay(&self, delay: Duration) {
        if !delay.is_zero() {
            std::thread::sleep(delay);
        }
    }
}
