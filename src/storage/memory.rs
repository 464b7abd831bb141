//! In-memory implementation of the store traits
//!
//! Single-process stand-in for a real store, used by the test-suite and handy
//! for local development. Key operations take a plain mutex which makes every
//! single-key operation atomic, matching the contract of the real store.
//! Expiries are enforced lazily on access.

use super::{KeyValueStore, PubSubBackend, StoreMessage};
use crate::{BoxedError, EmptyResult};
use async_trait::async_trait;
use futures::stream::{unfold, BoxStream};
use futures::StreamExt;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::Instant;

const CHANNEL_CAPACITY: usize = 1024;

struct Entry {
    value: String,
    expires_at: Option<Instant>,
}

impl Entry {
    fn expired(&self) -> bool {
        match self.expires_at {
            Some(deadline) => deadline <= Instant::now(),
            None => false,
        }
    }
}

/// Store implementation keeping everything in process memory
#[derive(Default)]
pub struct MemoryStore {
    keys: Mutex<HashMap<String, Entry>>,
    channels: Mutex<HashMap<String, broadcast::Sender<StoreMessage>>>,
    published: AtomicUsize,
}

impl MemoryStore {
    /// Creates an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of messages published so far, over all channels
    pub fn published_count(&self) -> usize {
        self.published.load(Ordering::SeqCst)
    }

    /// Removes the key if its expiry has elapsed
    fn purge_expired(keys: &mut HashMap<String, Entry>, key: &str) {
        if keys.get(key).map(Entry::expired).unwrap_or(false) {
            keys.remove(key);
        }
    }

    fn sender(&self, channel: &str) -> broadcast::Sender<StoreMessage> {
        self.channels
            .lock()
            .unwrap()
            .entry(channel.to_owned())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .clone()
    }
}

#[async_trait]
impl KeyValueStore for MemoryStore {
    async fn set_if_absent(&self, key: &str, value: &str) -> Result<bool, BoxedError> {
        let mut keys = self.keys.lock().unwrap();
        Self::purge_expired(&mut keys, key);

        if keys.contains_key(key) {
            Ok(false)
        } else {
            keys.insert(
                key.to_owned(),
                Entry {
                    value: value.to_owned(),
                    expires_at: None,
                },
            );
            Ok(true)
        }
    }

    async fn set_expiry(&self, key: &str, ttl: Duration) -> EmptyResult {
        let mut keys = self.keys.lock().unwrap();
        Self::purge_expired(&mut keys, key);

        match keys.get_mut(key) {
            Some(entry) => {
                entry.expires_at = Some(Instant::now() + ttl);
                Ok(())
            }
            None => Err(format!("cannot set an expiry on missing key {}", key).into()),
        }
    }

    async fn exists(&self, key: &str) -> Result<bool, BoxedError> {
        let mut keys = self.keys.lock().unwrap();
        Self::purge_expired(&mut keys, key);
        Ok(keys.contains_key(key))
    }

    async fn delete(&self, key: &str) -> EmptyResult {
        self.keys.lock().unwrap().remove(key);
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>, BoxedError> {
        let mut keys = self.keys.lock().unwrap();
        Self::purge_expired(&mut keys, key);
        Ok(keys.get(key).map(|entry| entry.value.clone()))
    }

    async fn set(&self, key: &str, value: &str) -> EmptyResult {
        self.keys.lock().unwrap().insert(
            key.to_owned(),
            Entry {
                value: value.to_owned(),
                expires_at: None,
            },
        );
        Ok(())
    }
}

#[async_trait]
impl PubSubBackend for MemoryStore {
    async fn publish(&self, channel: &str, message: &str) -> EmptyResult {
        self.published.fetch_add(1, Ordering::SeqCst);

        // A send error only means there is no subscriber, which matches the
        // zero-to-many delivery contract.
        self.sender(channel)
            .send(StoreMessage {
                channel: channel.to_owned(),
                payload: message.to_owned(),
            })
            .ok();

        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<BoxStream<'static, StoreMessage>, BoxedError> {
        let rx = self.sender(channel).subscribe();

        let stream = unfold(rx, |mut rx| async move {
            loop {
                match rx.recv().await {
                    Ok(message) => return Some((message, rx)),
                    // A lagging subscriber simply loses messages, like a slow
                    // consumer on a real broker would.
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        });

        Ok(stream.boxed())
    }
}

#[cfg(test)]
mod does {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::sync::Arc;

    #[tokio::test]
    async fn set_only_if_absent() {
        let store = MemoryStore::new();

        assert!(store.set_if_absent("key", "1").await.unwrap());
        assert!(!store.set_if_absent("key", "2").await.unwrap());
        assert_eq!(store.get("key").await.unwrap(), Some("1".into()));
    }

    #[tokio::test]
    async fn grant_exactly_one_concurrent_setnx() {
        let store = Arc::new(MemoryStore::new());

        let attempts = (0..16).map(|_| {
            let store = store.clone();
            tokio::spawn(async move { store.set_if_absent("contended", "x").await.unwrap() })
        });

        let granted = futures::future::join_all(attempts)
            .await
            .into_iter()
            .filter(|result| *result.as_ref().unwrap())
            .count();

        assert_eq!(granted, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn expire_keys_lazily() {
        let store = MemoryStore::new();
        store.set("key", "value").await.unwrap();
        store
            .set_expiry("key", Duration::from_millis(100))
            .await
            .unwrap();

        assert!(store.exists("key").await.unwrap());

        tokio::time::sleep(Duration::from_millis(150)).await;

        assert!(!store.exists("key").await.unwrap());
        assert_eq!(store.get("key").await.unwrap(), None);
        assert!(store.set_if_absent("key", "again").await.unwrap());
    }

    #[tokio::test]
    async fn refuse_expiry_on_missing_key() {
        let store = MemoryStore::new();
        assert!(store.set_expiry("ghost", Duration::from_secs(1)).await.is_err());
    }

    #[tokio::test]
    async fn broadcast_to_all_subscribers() {
        let store = MemoryStore::new();
        let mut first = store.subscribe("channel").await.unwrap();
        let mut second = store.subscribe("channel").await.unwrap();

        store.publish("channel", "hello").await.unwrap();

        let expected = StoreMessage {
            channel: "channel".into(),
            payload: "hello".into(),
        };
        assert_eq!(first.next().await, Some(expected.clone()));
        assert_eq!(second.next().await, Some(expected));
    }

    #[tokio::test]
    async fn deliver_to_nobody_without_error() {
        let store = MemoryStore::new();
        store.publish("empty", "hello").await.unwrap();
        assert_eq!(store.published_count(), 1);
    }
}
