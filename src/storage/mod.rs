//! Abstractions over the shared key-value / pub-sub store
//!
//! The relay only ever talks to the store through these two traits. Every
//! key-value operation is required to be atomic per call; pub/sub delivery is
//! broadcast with zero-to-many semantics and no acknowledgements.

mod memory;
mod redis;

pub use self::redis::RedisStore;
pub use memory::MemoryStore;

use crate::{BoxedError, EmptyResult};
use async_trait::async_trait;
use futures::stream::BoxStream;
use std::time::Duration;

/// Message delivered by a subscription
///
/// Carries the originating channel name so consumers sharing a connection can
/// filter out messages destined for other channels.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreMessage {
    /// Channel the message was published on
    pub channel: String,
    /// Raw message content
    pub payload: String,
}

/// Atomic single-key operations of the shared store
#[async_trait]
pub trait KeyValueStore: Send + Sync + 'static {
    /// Sets `key` to `value` only if the key does not exist, returning whether it was set
    async fn set_if_absent(&self, key: &str, value: &str) -> Result<bool, BoxedError>;

    /// Attaches a time-to-live to an existing key
    async fn set_expiry(&self, key: &str, ttl: Duration) -> EmptyResult;

    /// Returns whether the key currently exists
    async fn exists(&self, key: &str) -> Result<bool, BoxedError>;

    /// Removes the key
    async fn delete(&self, key: &str) -> EmptyResult;

    /// Reads the value of a key, if present
    async fn get(&self, key: &str) -> Result<Option<String>, BoxedError>;

    /// Unconditionally sets the key
    async fn set(&self, key: &str, value: &str) -> EmptyResult;
}

/// Broadcast pub/sub operations of the shared store
#[async_trait]
pub trait PubSubBackend: Send + Sync + 'static {
    /// Publishes a message on a channel, fire-and-forget
    async fn publish(&self, channel: &str, message: &str) -> EmptyResult;

    /// Opens a fresh subscription to a channel and streams its deliveries
    ///
    /// The stream ends when the underlying connection is lost; recovery is the
    /// caller's concern (see [`ChannelTransport`](crate::transport::ChannelTransport)).
    async fn subscribe(&self, channel: &str) -> Result<BoxStream<'static, StoreMessage>, BoxedError>;
}
