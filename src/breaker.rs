//! Sampling-window failure governor for the sending side
//!
//! Counts timeouts observed in the current window and is sampled on a fixed
//! interval by its owning relay. The circuit opens when one window exceeds the
//! threshold and closes again unconditionally at the next sample boundary
//! whose window stays at or under it; there is no half-open probe state.
//! State is local to one relay instance, every sender protects itself based on
//! its own observed timeout rate.

use log::info;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

/// Process-local circuit breaker fed by send timeouts
pub struct CircuitBreaker {
    timeouts: AtomicU32,
    open: AtomicBool,
    threshold: u32,
}

impl CircuitBreaker {
    /// Creates a closed breaker tripping above the given per-window timeout count
    pub fn new(threshold: u32) -> Self {
        Self {
            timeouts: AtomicU32::new(0),
            open: AtomicBool::new(false),
            threshold,
        }
    }

    /// Records one observed send timeout in the current window
    ///
    /// Timeouts are the only trigger; application errors returned by a
    /// receiver are a healthy response and do not count.
    pub fn record_timeout(&self) {
        self.timeouts.fetch_add(1, Ordering::SeqCst);
    }

    /// Whether new sends are currently rejected
    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    /// Closes the current window and transitions the circuit accordingly
    ///
    /// Called on the owning relay's sampling interval. The counter is reset
    /// unconditionally, regardless of the transition taken.
    pub fn sample(&self) {
        let count = self.timeouts.swap(0, Ordering::SeqCst);

        if count > self.threshold {
            if !self.open.swap(true, Ordering::SeqCst) {
                info!(
                    "circuit breaker tripped, circuit open ({} timeouts > threshold {})",
                    count, self.threshold
                );
            }
        } else if self.open.swap(false, Ordering::SeqCst) {
            info!("circuit closed again");
        }
    }
}
