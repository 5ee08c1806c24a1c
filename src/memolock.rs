//! Distributed memoization lock
//!
//! Coordinates concurrent `get` calls across processes sharing a backing
//! store so that at most one fetch per key is in flight at a time. The
//! caller that wins the lock runs the fetch and broadcasts the encoded
//! result; everyone else waits on the key's done channel and receives the
//! value without fetching.
//!
//! Shared state per key, all in the backing store:
//! - `<key>`: the encoded value, TTL = the call's `ttl`
//! - `<key>:lock`: the sentinel `"locked"`, TTL = `lock_timeout`
//! - `<key>_done`: the pub/sub channel carrying the encoded value once
//!
//! This is not a strongly consistent distributed lock. If the lock sentinel
//! expires mid-fetch (crash, slow fetch), a second fetcher may run; the
//! guarantee is that duplicate work is avoided in normal operation and that
//! every caller eventually gets a value or an error.

use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::debug;

use crate::config::{ErrorHandler, GetOptions, MemolockConfig, default_error_handler};
use crate::error::{BoxError, MemolockError};
use crate::multiplexer::{Multiplexer, WaitError};
use crate::store::{
    CommandStore, PipelineOp, RedisCommandStore, RedisSubscriber, SubscriberStore,
};

/// Fixed value stored under the lock sentinel key.
const LOCK_SENTINEL: &str = "locked";

/// Trait for values that can go through the default JSON codec
pub trait Cacheable: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {}
impl<T> Cacheable for T where T: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {}

fn lock_key(key: &str) -> String {
    format!("{}:lock", key)
}

fn done_channel(key: &str) -> String {
    format!("{}_done", key)
}

struct MemolockInner<V, C, S>
where
    V: Cacheable,
    C: CommandStore,
    S: SubscriberStore,
{
    commands: Arc<C>,
    subscriber: Arc<S>,
    mux: Arc<Multiplexer<V, S>>,
    /// Keys this process has locked or is waiting on. Suppresses redundant
    /// `SET NX` attempts when local callers race for the same key; advisory
    /// and eventually consistent.
    locked_locally: Mutex<HashSet<String>>,
    config: MemolockConfig,
    error_handler: ErrorHandler,
}

/// Memoization-lock cache over a shared backing store.
///
/// Cheap to clone; clones share the same clients and in-process state.
pub struct Memolock<V, C = RedisCommandStore, S = RedisSubscriber>
where
    V: Cacheable,
    C: CommandStore,
    S: SubscriberStore,
{
    inner: Arc<MemolockInner<V, C, S>>,
}

impl<V, C, S> Clone for Memolock<V, C, S>
where
    V: Cacheable,
    C: CommandStore,
    S: SubscriberStore,
{
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<V: Cacheable> Memolock<V> {
    /// Connect both backing store clients from one Redis URL.
    ///
    /// Two connections are made: a command connection and a dedicated
    /// subscribe-mode connection. Redis refuses regular commands on a
    /// subscribed client, so they are never shared.
    pub async fn connect(url: &str, config: MemolockConfig) -> Result<Self, MemolockError> {
        let client = redis::Client::open(url)?;
        let commands = RedisCommandStore::connect(client.clone()).await?;
        let subscriber = RedisSubscriber::connect(client).await?;
        Ok(Self::new(commands, subscriber, config))
    }
}

impl<V, C, S> Memolock<V, C, S>
where
    V: Cacheable,
    C: CommandStore,
    S: SubscriberStore,
{
    /// Build a cache over an already-connected pair of store clients.
    pub fn new(commands: C, subscriber: S, config: MemolockConfig) -> Self {
        Self::with_error_handler(commands, subscriber, config, default_error_handler())
    }

    /// Like [`Self::new`], with a custom sink for best-effort cleanup
    /// failures (lock release after a failed fetch, unsubscribe errors,
    /// pipeline errors on a disconnected store).
    pub fn with_error_handler(
        commands: C,
        subscriber: S,
        config: MemolockConfig,
        error_handler: ErrorHandler,
    ) -> Self {
        let commands = Arc::new(commands);
        let subscriber = Arc::new(subscriber);
        let mux = Arc::new(Multiplexer::new(
            Arc::clone(&subscriber),
            Arc::clone(&error_handler),
        ));
        mux.register();
        Self {
            inner: Arc::new(MemolockInner {
                commands,
                subscriber,
                mux,
                locked_locally: Mutex::new(HashSet::new()),
                config,
                error_handler,
            }),
        }
    }

    /// Read-through get with fetch deduplication across processes.
    ///
    /// On a cache hit the decoded value is returned directly. On a miss,
    /// exactly one caller (across all processes sharing the store) acquires
    /// `<key>:lock` and runs `fetch`; it stores and publishes the encoded
    /// result and returns its in-memory value. Every other caller waits on
    /// `<key>_done` for up to `lock_timeout` per attempt, restarting the
    /// whole sequence on timeout, and gives up after `max_attempts` total
    /// attempts with [`MemolockError::NeverUnlocked`].
    ///
    /// `fetch` is invoked at most once per attempt, and only by the caller
    /// holding the lock.
    pub async fn get<F, Fut>(
        &self,
        key: &str,
        opts: &GetOptions<V>,
        fetch: F,
    ) -> Result<V, MemolockError>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<V, BoxError>>,
    {
        let max_attempts = opts
            .max_attempts
            .unwrap_or(self.inner.config.max_attempts)
            .max(1);
        let mut attempt = 0u32;

        loop {
            if !opts.force_refresh {
                if let Some(raw) = self
                    .inner
                    .commands
                    .get(key)
                    .await
                    .map_err(MemolockError::Store)?
                {
                    debug!("cache hit for key {}", key);
                    return (opts.decode_fn())(&raw).map_err(MemolockError::Decode);
                }
                debug!("cache miss for key {}", key);
            }

            match self.acquire_or_wait(key, opts, &fetch).await? {
                Some(value) => return Ok(value),
                None => {
                    attempt += 1;
                    if attempt >= max_attempts {
                        return Err(MemolockError::NeverUnlocked);
                    }
                    debug!("retrying get for key {} (attempt {})", key, attempt + 1);
                }
            }
        }
    }

    /// One lock-or-wait round. `Ok(None)` means the wait timed out and the
    /// caller should restart from the cache read.
    async fn acquire_or_wait<F, Fut>(
        &self,
        key: &str,
        opts: &GetOptions<V>,
        fetch: &F,
    ) -> Result<Option<V>, MemolockError>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<V, BoxError>>,
    {
        let lock_timeout = opts.lock_timeout.unwrap_or(self.inner.config.lock_timeout);
        let lock_key = lock_key(key);

        // A key already locked or waited on by this process never races a
        // second SET NX from here; the new caller just joins the waiters.
        let locked_here = self.inner.locked_locally.lock().await.contains(key);
        let acquired = if locked_here {
            false
        } else {
            self.inner
                .commands
                .set_nx_px(&lock_key, LOCK_SENTINEL, lock_timeout.as_millis() as u64)
                .await
                .map_err(MemolockError::Store)?
        };
        self.inner
            .locked_locally
            .lock()
            .await
            .insert(key.to_owned());

        if acquired {
            debug!("lock acquired for key {}", key);
            let result = self.fetch_and_publish(key, &lock_key, opts, fetch).await;
            self.release_local(key).await;
            result.map(Some)
        } else {
            debug!("key {} locked elsewhere, waiting on done channel", key);
            let outcome = self
                .inner
                .mux
                .subscribe_once(&done_channel(key), lock_timeout, opts.decode_fn())
                .await;
            self.release_local(key).await;
            match outcome {
                Ok(value) => Ok(Some(value)),
                Err(WaitError::Timeout) => Ok(None),
                Err(WaitError::Decode(e)) => Err(MemolockError::Decode(e.into())),
                Err(WaitError::Subscribe(e)) => Err(MemolockError::Store(e.into())),
            }
        }
    }

    /// Fetcher branch: run the fetch, then store, notify and unlock in one
    /// pipelined batch. The caller gets the in-memory value back without a
    /// round-trip through the codec.
    async fn fetch_and_publish<F, Fut>(
        &self,
        key: &str,
        lock_key: &str,
        opts: &GetOptions<V>,
        fetch: &F,
    ) -> Result<V, MemolockError>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<V, BoxError>>,
    {
        let value = match fetch().await {
            Ok(value) => value,
            Err(err) => {
                self.release_lock_best_effort(lock_key).await;
                return Err(MemolockError::Fetch(err));
            }
        };

        let encoded = match encode_value(opts, &value) {
            Ok(encoded) => encoded,
            Err(err) => {
                self.release_lock_best_effort(lock_key).await;
                return Err(err);
            }
        };

        let ttl_ms = opts.resolve_ttl_ms(&value);
        let mut ops = Vec::with_capacity(3);
        if opts.should_cache(&value) && ttl_ms > 0 {
            ops.push(PipelineOp::SetPx {
                key: key.to_owned(),
                value: encoded.clone(),
                ttl_ms,
            });
        }
        ops.push(PipelineOp::Publish {
            channel: done_channel(key),
            payload: encoded,
        });
        ops.push(PipelineOp::Del {
            key: lock_key.to_owned(),
        });

        // Waiters recover from a failed batch through timeout-and-retry, and
        // the lock sentinel expires on its own; the fetched value is still
        // good for this caller.
        if let Err(err) = self.inner.commands.pipeline(ops).await {
            (self.inner.error_handler)(err.as_ref());
        }
        Ok(value)
    }

    /// Warm the cache for a key without going through the lock protocol.
    ///
    /// This races concurrent `get`s on the same key: an in-flight fetch that
    /// completes after this call overwrites the value (last write to the
    /// store wins). Use it for cache warming, not for values that must stick.
    pub async fn set(&self, key: &str, value: &V, opts: &GetOptions<V>) -> Result<(), MemolockError> {
        let encoded = encode_value(opts, value)?;
        let ttl_ms = opts.resolve_ttl_ms(value);
        if ttl_ms == 0 {
            debug!("skipping set for key {}: zero ttl", key);
            return Ok(());
        }
        self.inner
            .commands
            .set_px(key, &encoded, ttl_ms)
            .await
            .map_err(MemolockError::Store)
    }

    /// Drop the cached value, returning how many keys were removed.
    ///
    /// Does not touch the lock sentinel and does not notify waiters; a
    /// concurrent fetch may repopulate the key immediately.
    pub async fn delete(&self, key: &str) -> Result<u64, MemolockError> {
        self.inner
            .commands
            .del(key)
            .await
            .map_err(MemolockError::Store)
    }

    /// Close both store clients and drop all in-process waiters. Pending
    /// waits resolve as timeouts; close errors go to the error handler.
    pub async fn disconnect(&self) {
        let (commands, subscriber) = tokio::join!(
            self.inner.commands.quit(),
            self.inner.subscriber.quit(),
        );
        for err in [commands.err(), subscriber.err()].into_iter().flatten() {
            (self.inner.error_handler)(err.as_ref());
        }
        self.inner.mux.clear().await;
        self.inner.locked_locally.lock().await.clear();
    }

    async fn release_local(&self, key: &str) {
        self.inner.locked_locally.lock().await.remove(key);
    }

    async fn release_lock_best_effort(&self, lock_key: &str) {
        if let Err(err) = self.inner.commands.del(lock_key).await {
            (self.inner.error_handler)(err.as_ref());
        }
    }
}

/// Encode a value for storage and publication. An encoder producing empty
/// output stores the literal `"null"` so a later read still sees a non-empty
/// cached value.
fn encode_value<V: Cacheable>(opts: &GetOptions<V>, value: &V) -> Result<String, MemolockError> {
    let encoded = (opts.encode_fn())(value).map_err(MemolockError::Encode)?;
    if encoded.is_empty() {
        Ok("null".to_owned())
    } else {
        Ok(encoded)
    }
}
