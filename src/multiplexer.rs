//! One-shot subscription multiplexer
//!
//! Amortizes a single upstream channel subscription over any number of local
//! waiters. The first inbound message on a channel is decoded once and
//! delivered to every waiter; each waiter completes exactly once, whether by
//! message, decode failure, subscribe failure or its own timeout.
//!
//! Registry lifecycle per channel:
//! - created by the first local waiter (which also subscribes upstream)
//! - grown by concurrent waiters (no second upstream subscription)
//! - destroyed by the first inbound message, by the last waiter timing out,
//!   or by an upstream subscribe failure with no concurrent joiners
//!
//! Completion is a `oneshot` per waiter, so a message racing a timeout can
//! never complete the same waiter twice.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{oneshot, Mutex};
use tracing::debug;

use crate::config::{DecodeFn, ErrorHandler};
use crate::memolock::Cacheable;
use crate::store::SubscriberStore;

/// Terminal outcome of a wait, other than a decoded value.
#[derive(Debug, Clone)]
pub enum WaitError {
    /// No message arrived before the waiter's timer fired.
    Timeout,
    /// The channel payload failed to decode; every waiter on the channel
    /// observes this.
    Decode(String),
    /// Entering the upstream subscription failed for this waiter.
    Subscribe(String),
}

impl std::fmt::Display for WaitError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WaitError::Timeout => write!(f, "timed out waiting for channel message"),
            WaitError::Decode(e) => write!(f, "failed to decode channel message: {}", e),
            WaitError::Subscribe(e) => write!(f, "failed to subscribe: {}", e),
        }
    }
}

struct ChannelEntry<V> {
    /// Decoder supplied by the waiter that created the entry.
    decode: DecodeFn<V>,
    waiters: HashMap<u64, oneshot::Sender<Result<V, WaitError>>>,
}

/// Fans one upstream subscription per channel out to local waiters.
pub struct Multiplexer<V, S> {
    subscriber: Arc<S>,
    channels: Mutex<HashMap<String, ChannelEntry<V>>>,
    next_waiter_id: AtomicU64,
    error_handler: ErrorHandler,
}

impl<V, S> Multiplexer<V, S>
where
    V: Cacheable,
    S: SubscriberStore,
{
    pub fn new(subscriber: Arc<S>, error_handler: ErrorHandler) -> Self {
        Self {
            subscriber,
            channels: Mutex::new(HashMap::new()),
            next_waiter_id: AtomicU64::new(0),
            error_handler,
        }
    }

    /// Route the subscription client's inbound stream into [`Self::on_message`].
    pub fn register(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        self.subscriber.on_message(Arc::new(move |channel, payload| {
            if let Some(mux) = weak.upgrade() {
                tokio::spawn(async move { mux.on_message(channel, payload).await });
            }
        }));
    }

    /// Wait for the next message on `channel`, decoded with `decode`.
    ///
    /// Joins the channel's existing registry entry if one exists; otherwise
    /// creates it and enters the upstream subscription. Resolves with the
    /// decoded message, or with [`WaitError::Timeout`] after `timeout`.
    pub async fn subscribe_once(
        &self,
        channel: &str,
        timeout: Duration,
        decode: DecodeFn<V>,
    ) -> Result<V, WaitError> {
        let (tx, rx) = oneshot::channel();
        let waiter_id = self.next_waiter_id.fetch_add(1, Ordering::Relaxed);

        let needs_subscribe = {
            let mut channels = self.channels.lock().await;
            match channels.entry(channel.to_owned()) {
                Entry::Occupied(mut entry) => {
                    entry.get_mut().waiters.insert(waiter_id, tx);
                    false
                }
                Entry::Vacant(slot) => {
                    let mut waiters = HashMap::new();
                    waiters.insert(waiter_id, tx);
                    slot.insert(ChannelEntry { decode, waiters });
                    true
                }
            }
        };

        if needs_subscribe {
            if let Err(err) = self.subscriber.subscribe(channel).await {
                // Keep the entry alive if other waiters joined while the
                // subscribe was in flight; they time out on their own.
                let mut channels = self.channels.lock().await;
                if let Some(entry) = channels.get_mut(channel) {
                    entry.waiters.remove(&waiter_id);
                    if entry.waiters.is_empty() {
                        channels.remove(channel);
                    }
                }
                return Err(WaitError::Subscribe(err.to_string()));
            }
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(outcome)) => outcome,
            // Entry dropped without a message, e.g. on disconnect; recover
            // the same way as a timeout.
            Ok(Err(_)) => Err(WaitError::Timeout),
            Err(_) => {
                self.abandon(channel, waiter_id).await;
                Err(WaitError::Timeout)
            }
        }
    }

    /// Deliver an inbound message to every waiter currently registered on
    /// `channel`, then release the upstream subscription.
    ///
    /// The registry entry is removed before any waiter resumes, so a waiter
    /// that immediately re-subscribes starts a fresh epoch, and its upstream
    /// SUBSCRIBE is ordered after this epoch's UNSUBSCRIBE.
    pub async fn on_message(&self, channel: String, payload: String) {
        let entry = self.channels.lock().await.remove(&channel);
        let Some(entry) = entry else {
            debug!("no local waiters for channel {}", channel);
            return;
        };

        self.release_channel(&channel).await;

        let outcome = match (entry.decode)(&payload) {
            Ok(value) => Ok(value),
            Err(err) => Err(WaitError::Decode(err.to_string())),
        };
        for (_, tx) in entry.waiters {
            let _ = tx.send(match &outcome {
                Ok(value) => Ok(value.clone()),
                Err(err) => Err(err.clone()),
            });
        }
    }

    /// Drop every registered waiter. Pending `subscribe_once` calls resolve
    /// as timeouts.
    pub async fn clear(&self) {
        self.channels.lock().await.clear();
    }

    /// Remove a timed-out waiter; release the channel when it was the last.
    async fn abandon(&self, channel: &str, waiter_id: u64) {
        let release = {
            let mut channels = self.channels.lock().await;
            match channels.get_mut(channel) {
                Some(entry) => {
                    entry.waiters.remove(&waiter_id);
                    if entry.waiters.is_empty() {
                        channels.remove(channel);
                        true
                    } else {
                        false
                    }
                }
                None => false,
            }
        };
        if release {
            self.release_channel(channel).await;
        }
    }

    async fn release_channel(&self, channel: &str) {
        if let Err(err) = self.subscriber.unsubscribe(channel).await {
            (self.error_handler)(err.as_ref());
        }
    }
}
