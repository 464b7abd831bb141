//! Configuration surface consumed by the [`TaskRelay`](crate::relay::TaskRelay)

use std::time::Duration;

/// Tunables for one relay instance
///
/// The defaults are safe starting points; the one relationship worth
/// reviewing per deployment is `lock_ttl` vs. `timeout` (see
/// [`RelayOptions::lock_ttl`]).
#[derive(Debug, Clone)]
pub struct RelayOptions {
    /// Logical namespace shared by all senders and receivers of one RPC contract.
    ///
    /// Realized as two physical channels: `out:{topic}` carries task envelopes,
    /// `inc:{topic}` carries result envelopes.
    pub topic: String,

    /// Per-call deadline after which a pending send resolves as timed out
    pub timeout: Duration,

    /// Sampling interval of the circuit breaker
    pub circuit_check_interval: Duration,

    /// Number of timeouts within one sampling window above which the circuit opens
    pub timeout_threshold: u32,

    /// Interval of the forced resubscription, `None` disables the timer entirely.
    ///
    /// Pub/sub subscriptions can silently stop delivering without raising a
    /// connection error; tearing the subscription down periodically bounds how
    /// long such a dead subscription goes unnoticed. Every transport instance
    /// adds its own random jitter so a fleet does not resubscribe in lockstep.
    pub resubscribe_interval: Option<Duration>,

    /// Time-to-live of the per-task processing lock.
    ///
    /// Must comfortably exceed the expected processing time of a single task: if
    /// the lock expires while the claiming receiver is still mid-processing, a
    /// redelivered copy of the task can legitimately be claimed by a second
    /// receiver and the task ends up processed twice. The relay logs a warning
    /// when this value does not exceed `timeout`.
    pub lock_ttl: Duration,

    /// Time-to-live of the long-lived lockability marker keys
    pub lockability_ttl: Duration,
}

impl RelayOptions {
    /// Creates options for the given topic with default tunables
    pub fn new<T: Into<String>>(topic: T) -> Self {
        Self {
            topic: topic.into(),
            timeout: Duration::from_millis(1000),
            circuit_check_interval: Duration::from_millis(2000),
            timeout_threshold: 5,
            resubscribe_interval: Some(Duration::from_secs(300)),
            lock_ttl: Duration::from_secs(8),
            lockability_ttl: Duration::from_secs(30 * 60),
        }
    }
}

impl Default for RelayOptions {
    fn default() -> Self {
        Self::new("tasks")
    }
}
