//! In-memory backing store for protocol tests
//!
//! A shared data map with millisecond TTLs plus a subscriber registry, so the
//! full lock-or-wait protocol runs without a Redis server. Several store
//! handles can share one backend to simulate multiple processes. Expiry uses
//! `tokio::time::Instant`, so paused-clock tests control it deterministically.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;

use crate::error::BoxError;
use crate::store::{CommandStore, MessageHandler, PipelineOp, SubscriberStore};

struct MockEntry {
    value: String,
    expires_at: Option<Instant>,
}

impl MockEntry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.map_or(true, |deadline| deadline > now)
    }
}

#[derive(Default)]
struct MockSubscription {
    channels: HashSet<String>,
    handler: Option<MessageHandler>,
}

#[derive(Default)]
struct MockState {
    data: HashMap<String, MockEntry>,
    subscriptions: HashMap<u64, MockSubscription>,
    next_subscriber: u64,
}

impl MockState {
    fn live_value(&mut self, key: &str) -> Option<String> {
        let now = Instant::now();
        if let Some(entry) = self.data.get(key) {
            if entry.is_live(now) {
                return Some(entry.value.clone());
            }
            self.data.remove(key);
        }
        None
    }

    fn store(&mut self, key: &str, value: &str, ttl_ms: u64) {
        self.data.insert(
            key.to_owned(),
            MockEntry {
                value: value.to_owned(),
                expires_at: Some(Instant::now() + Duration::from_millis(ttl_ms)),
            },
        );
    }

    fn listeners(&self, channel: &str) -> Vec<MessageHandler> {
        self.subscriptions
            .values()
            .filter(|sub| sub.channels.contains(channel))
            .filter_map(|sub| sub.handler.clone())
            .collect()
    }
}

/// Shared in-memory backend. Create one per test; hand out one store pair
/// per simulated process.
#[derive(Clone, Default)]
pub(crate) struct MockBackend {
    state: Arc<Mutex<MockState>>,
}

impl MockBackend {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Command-side handle.
    pub(crate) fn command_store(&self) -> MockStore {
        self.handle()
    }

    /// Subscription-side handle with its own subscriber slot.
    pub(crate) fn subscriber_store(&self) -> MockStore {
        self.handle()
    }

    fn handle(&self) -> MockStore {
        let id = {
            let mut state = self.state.lock().unwrap();
            let id = state.next_subscriber;
            state.next_subscriber += 1;
            state.subscriptions.insert(id, MockSubscription::default());
            id
        };
        MockStore {
            state: Arc::clone(&self.state),
            id,
        }
    }

    /// Live value currently stored under `key`, if any.
    pub(crate) fn stored_value(&self, key: &str) -> Option<String> {
        self.state.lock().unwrap().live_value(key)
    }

    /// Whether any subscriber is currently subscribed to `channel`.
    pub(crate) fn has_subscriber(&self, channel: &str) -> bool {
        !self.state.lock().unwrap().listeners(channel).is_empty()
    }
}

/// One client handle onto a [`MockBackend`]; implements both sides of the
/// facade so a test can use it as command store, subscriber store, or both.
pub(crate) struct MockStore {
    state: Arc<Mutex<MockState>>,
    id: u64,
}

impl MockStore {
    fn dispatch(&self, channel: &str, payload: &str) {
        let listeners = self.state.lock().unwrap().listeners(channel);
        for handler in listeners {
            handler(channel.to_owned(), payload.to_owned());
        }
    }
}

#[async_trait]
impl CommandStore for MockStore {
    async fn get(&self, key: &str) -> Result<Option<String>, BoxError> {
        Ok(self.state.lock().unwrap().live_value(key))
    }

    async fn set_px(&self, key: &str, value: &str, ttl_ms: u64) -> Result<(), BoxError> {
        self.state.lock().unwrap().store(key, value, ttl_ms);
        Ok(())
    }

    async fn set_nx_px(&self, key: &str, value: &str, ttl_ms: u64) -> Result<bool, BoxError> {
        let mut state = self.state.lock().unwrap();
        if state.live_value(key).is_some() {
            return Ok(false);
        }
        state.store(key, value, ttl_ms);
        Ok(true)
    }

    async fn del(&self, key: &str) -> Result<u64, BoxError> {
        let mut state = self.state.lock().unwrap();
        let removed = state.live_value(key).is_some() && state.data.remove(key).is_some();
        Ok(removed as u64)
    }

    async fn publish(&self, channel: &str, payload: &str) -> Result<(), BoxError> {
        self.dispatch(channel, payload);
        Ok(())
    }

    async fn pipeline(&self, ops: Vec<PipelineOp>) -> Result<(), BoxError> {
        // Apply data ops under one lock, then dispatch publishes in order.
        let mut publishes = Vec::new();
        {
            let mut state = self.state.lock().unwrap();
            for op in &ops {
                match op {
                    PipelineOp::SetPx { key, value, ttl_ms } => state.store(key, value, *ttl_ms),
                    PipelineOp::Publish { channel, payload } => {
                        publishes.push((channel.clone(), payload.clone()));
                    }
                    PipelineOp::Del { key } => {
                        state.data.remove(key);
                    }
                }
            }
        }
        for (channel, payload) in publishes {
            self.dispatch(&channel, &payload);
        }
        Ok(())
    }

    async fn quit(&self) -> Result<(), BoxError> {
        Ok(())
    }
}

#[async_trait]
impl SubscriberStore for MockStore {
    async fn subscribe(&self, channel: &str) -> Result<(), BoxError> {
        let mut state = self.state.lock().unwrap();
        match state.subscriptions.get_mut(&self.id) {
            Some(sub) => {
                sub.channels.insert(channel.to_owned());
                Ok(())
            }
            None => Err("subscription client is closed".into()),
        }
    }

    async fn unsubscribe(&self, channel: &str) -> Result<(), BoxError> {
        let mut state = self.state.lock().unwrap();
        if let Some(sub) = state.subscriptions.get_mut(&self.id) {
            sub.channels.remove(channel);
        }
        Ok(())
    }

    fn on_message(&self, handler: MessageHandler) {
        let mut state = self.state.lock().unwrap();
        if let Some(sub) = state.subscriptions.get_mut(&self.id) {
            sub.handler = Some(handler);
        }
    }

    async fn quit(&self) -> Result<(), BoxError> {
        self.state.lock().unwrap().subscriptions.remove(&self.id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn entries_expire_after_their_ttl() {
        let backend = MockBackend::new();
        let store = backend.command_store();

        store.set_px("k", "v", 100).await.unwrap();
        assert_eq!(store.get("k").await.unwrap().as_deref(), Some("v"));

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(store.get("k").await.unwrap(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn set_nx_respects_live_entries_only() {
        let backend = MockBackend::new();
        let store = backend.command_store();

        assert!(store.set_nx_px("k", "a", 100).await.unwrap());
        assert!(!store.set_nx_px("k", "b", 100).await.unwrap());

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(store.set_nx_px("k", "c", 100).await.unwrap());
    }

    #[tokio::test]
    async fn publish_reaches_all_subscribed_handles() {
        let backend = MockBackend::new();
        let publisher = backend.command_store();

        let seen: Arc<Mutex<Vec<(String, String)>>> = Arc::new(Mutex::new(Vec::new()));
        for _ in 0..2 {
            let sub = backend.subscriber_store();
            let seen = Arc::clone(&seen);
            sub.on_message(Arc::new(move |channel, payload| {
                seen.lock().unwrap().push((channel, payload));
            }));
            sub.subscribe("c").await.unwrap();
        }

        publisher.publish("c", "hello").await.unwrap();
        assert_eq!(seen.lock().unwrap().len(), 2);
    }
}
