//! Redis implementation of the store traits
//!
//! Commands and publishes share one lazily created multiplexed connection.
//! Every subscription gets a dedicated connection since a Redis connection in
//! subscriber mode cannot issue regular commands.

use super::{KeyValueStore, PubSubBackend, StoreMessage};
use crate::{BoxedError, EmptyResult};
use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use log::warn;
use redis::aio::MultiplexedConnection;
use redis::{AsyncCommands, Client};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Mutex;

#[derive(Error, Debug)]
enum RedisStoreError {
    #[error("cannot set an expiry on missing key {0}")]
    ExpiryOnMissingKey(String),
}

/// Store implementation backed by a Redis server
pub struct RedisStore {
    client: Client,
    connection: Mutex<Option<MultiplexedConnection>>,
}

impl RedisStore {
    /// Creates a new instance connecting to the given URL
    ///
    /// No connection is opened until the first operation requires one.
    pub fn new(url: &str) -> Result<Self, BoxedError> {
        Ok(Self {
            client: Client::open(url)?,
            connection: Mutex::new(None),
        })
    }

    /// Returns the shared command connection, creating it on first use
    async fn connection(&self) -> Result<MultiplexedConnection, BoxedError> {
        let mut guard = self.connection.lock().await;

        match guard.as_ref() {
            Some(con) => Ok(con.clone()),
            None => {
                let con = self.client.get_multiplexed_tokio_connection().await?;
                guard.replace(con.clone());
                Ok(con)
            }
        }
    }
}

#[async_trait]
impl KeyValueStore for RedisStore {
    async fn set_if_absent(&self, key: &str, value: &str) -> Result<bool, BoxedError> {
        let mut con = self.connection().await?;
        Ok(con.set_nx(key, value).await?)
    }

    async fn set_expiry(&self, key: &str, ttl: Duration) -> EmptyResult {
        let mut con = self.connection().await?;
        let applied: bool = con.pexpire(key, ttl_millis(ttl)).await?;

        if applied {
            Ok(())
        } else {
            Err(RedisStoreError::ExpiryOnMissingKey(key.to_owned()).into())
        }
    }

    async fn exists(&self, key: &str) -> Result<bool, BoxedError> {
        let mut con = self.connection().await?;
        Ok(con.exists(key).await?)
    }

    async fn delete(&self, key: &str) -> EmptyResult {
        let mut con = self.connection().await?;
        con.del::<_, ()>(key).await?;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>, BoxedError> {
        let mut con = self.connection().await?;
        Ok(con.get(key).await?)
    }

    async fn set(&self, key: &str, value: &str) -> EmptyResult {
        let mut con = self.connection().await?;
        con.set::<_, _, ()>(key, value).await?;
        Ok(())
    }
}

/// Millisecond TTL argument for `PEXPIRE`
///
/// A zero TTL deletes the key immediately while still reporting success, so
/// the shortest expiry handed to the server is one millisecond.
fn ttl_millis(ttl: Duration) -> usize {
    (ttl.as_millis() as usize).max(1)
}

#[async_trait]
impl PubSubBackend for RedisStore {
    async fn publish(&self, channel: &str, message: &str) -> EmptyResult {
        let mut con = self.connection().await?;
        con.publish::<_, _, ()>(channel, message).await?;
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<BoxStream<'static, StoreMessage>, BoxedError> {
        let mut pubsub = self.client.get_async_connection().await?.into_pubsub();
        pubsub.subscribe(channel).await?;

        let stream = pubsub
            .into_on_message()
            .filter_map(|msg| async move {
                let channel = msg.get_channel_name().to_owned();

                match msg.get_payload::<String>() {
                    Ok(payload) => Some(StoreMessage { channel, payload }),
                    Err(e) => {
                        warn!("dropping non-text message on channel {}: {}", channel, e);
                        None
                    }
                }
            })
            .boxed();

        Ok(stream)
    }
}
