//! Request/response RPC on top of a broadcast pub/sub transport.
//!
//! The underlying store only offers fire-and-forget broadcast delivery: a published
//! message reaches zero, one, or many subscribers and no acknowledgement ever flows
//! back. This crate layers awaitable request/response calls on top of that by
//! combining four pieces:
//!
//! 1. A [`ChannelTransport`](transport::ChannelTransport) which keeps one publish and
//!    one subscribe connection per logical channel alive, periodically forcing a
//!    resubscription to bound the staleness window of silently dead subscriptions.
//! 2. A [`TaskLock`](lock::TaskLock) which turns "may be processed by many receivers"
//!    into "processed by at most one" using atomic set-if-absent keys with a TTL.
//! 3. A [`CircuitBreaker`](breaker::CircuitBreaker) which stops new sends when the
//!    recently observed timeout rate exceeds a threshold.
//! 4. The [`TaskRelay`](relay::TaskRelay) correlation engine which ties them together
//!    into a duplex protocol across two channels per topic.
//!
//! The store itself is abstracted behind the [`storage`] traits. A Redis
//! implementation is provided for production use and an in-memory one for tests.

#![deny(missing_docs)]

pub mod breaker;
pub mod config;
pub mod envelope;
pub mod lock;
pub mod metrics;
pub mod relay;
pub mod storage;
pub mod transport;

pub use config::RelayOptions;
pub use envelope::TaskPayload;
pub use relay::{RelayError, SendError, TaskHandler, TaskRelay};
pub use transport::TransportError;

/// Generic error type
pub type BoxedError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Result with no value and a [`BoxedError`]
pub type EmptyResult = Result<(), BoxedError>;
