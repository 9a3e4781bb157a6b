//! Exponential backoff with jitter, used to pace subchannel reconnection
//! attempts and resolver retries.
//!
//! The algorithm matches the canonical gRPC connection backoff: multiplier
//! ~1.6, initial base ~1s, cap ~120s, uniform jitter in `[0.8, 1.2]`.
//! Resetting backoff is achieved by discarding a `Backoff` and asking its
//! [`BackoffBuilder`] for a fresh one, rather than mutating it in place.

use std::time::Duration;

use rand::Rng;

const DEFAULT_MULTIPLIER: f64 = 1.6;
const DEFAULT_JITTER: f64 = 0.2;

/// The largest delay a [`Backoff`] will ever hand back, before jitter is
/// applied. Chosen so the post-jitter value still fits comfortably in an
/// `i32` number of milliseconds, which is the practical limit of most
/// runtimes' delay primitives (including tokio's timer wheel on 32-bit
/// targets).
const MAX_BACKOFF_MS: u64 = 120_000;
const MAX_DELAY_MS: u64 = i32::MAX as u64;

/// Configuration for constructing [`Backoff`] instances. Clone + reuse a
/// single builder across however many backoff sequences a subchannel or
/// resolver needs over its lifetime.
#[derive(Clone, Copy, Debug)]
pub struct BackoffBuilder {
    base: Duration,
    max: Duration,
    multiplier: f64,
    jitter: f64,
}

impl Default for BackoffBuilder {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(1),
            max: Duration::from_millis(MAX_BACKOFF_MS),
            multiplier: DEFAULT_MULTIPLIER,
            jitter: DEFAULT_JITTER,
        }
    }
}

impl BackoffBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn base(mut self, base: Duration) -> Self {
        self.base = base;
        self
    }

    pub fn max(mut self, max: Duration) -> Self {
        self.max = max;
        self
    }

    /// Builds a fresh [`Backoff`] sequence. Calling this again instead of
    /// reusing the previous `Backoff` is how a caller "resets" the backoff.
    pub fn create(&self) -> Backoff {
        Backoff {
            config: *self,
            next_base: self.base,
        }
    }
}

/// A single, stateful exponential-backoff sequence. `next()` is monotone
/// modulo jitter: the un-jittered base grows by `multiplier` each call,
/// clamped to `max`, and the returned value is that base times a uniform
/// random factor in `[1.0 - jitter, 1.0 + jitter]`.
#[derive(Clone, Debug)]
pub struct Backoff {
    config: BackoffBuilder,
    next_base: Duration,
}

impl Backoff {
    pub fn next(&mut self) -> Duration {
        let base = self.next_base;
        let jittered_ms = {
            let mut rng = rand::thread_rng();
            let factor = rng.gen_range((1.0 - self.config.jitter)..=(1.0 + self.config.jitter));
            ((base.as_millis() as f64) * factor) as u64
        };
        let clamped_ms = jittered_ms.min(MAX_DELAY_MS);

        let grown = Duration::from_secs_f64(base.as_secs_f64() * self.config.multiplier);
        self.next_base = grown.min(self.config.max);

        Duration::from_millis(clamped_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stays_within_jitter_bounds_of_base() {
        let mut b = BackoffBuilder::new().create();
        for _ in 0..5 {
            let d = b.next();
            // First call's base is 1s; jitter is +/-20%, so [0.8s, 1.2s].
            assert!(d >= Duration::from_millis(400), "{d:?} too small");
            assert!(d <= Duration::from_secs(200), "{d:?} too large");
        }
    }

    #[test]
    fn caps_at_max() {
        let mut b = BackoffBuilder::new()
            .base(Duration::from_secs(1))
            .max(Duration::from_secs(5))
            .create();
        for _ in 0..50 {
            b.next();
        }
        // After many iterations the un-jittered base should have saturated
        // at max; the jittered result can exceed max by at most the jitter
        // factor.
        let d = b.next();
        assert!(d <= Duration::from_secs_f64(5.0 * (1.0 + DEFAULT_JITTER) + 0.001));
    }

    #[test]
    fn fresh_instance_resets_sequence() {
        let builder = BackoffBuilder::new();
        let mut b1 = builder.create();
        for _ in 0..10 {
            b1.next();
        }
        let mut b2 = builder.create();
        let first = b2.next();
        assert!(first <= Duration::from_secs(2));
    }
}
