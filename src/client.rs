//! Typed client surface
//!
//! Binds a key derivation and a fetch function to the cache once, so call
//! sites work with their own argument type instead of raw string keys.

use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;

use crate::config::GetOptions;
use crate::error::{BoxError, MemolockError};
use crate::memolock::{Cacheable, Memolock};
use crate::store::{CommandStore, RedisCommandStore, RedisSubscriber, SubscriberStore};

/// Trait for fetching the expensive resource behind the cache.
///
/// Implementations can use a database, HTTP, or any other data source.
#[async_trait]
pub trait Fetcher<A>: Send + Sync + 'static {
    /// The cached value type.
    type Value: Cacheable;

    /// Fetch the value for the given argument.
    async fn fetch(&self, arg: &A) -> Result<Self::Value, BoxError>;
}

/// Trait mapping a typed argument to its string cache key.
pub trait KeyMapper<A>: Send + Sync + 'static {
    fn cache_key(&self, arg: &A) -> String;
}

impl<A, F> KeyMapper<A> for F
where
    F: Fn(&A) -> String + Send + Sync + 'static,
{
    fn cache_key(&self, arg: &A) -> String {
        self(arg)
    }
}

/// Typed handle over a [`Memolock`] cache.
///
/// `get` derives the key, then runs the full lock-or-wait protocol with the
/// bound fetcher. `set` and `delete` operate on the derived key directly.
pub struct MemolockClient<A, F, K, C = RedisCommandStore, S = RedisSubscriber>
where
    A: Send + Sync,
    F: Fetcher<A>,
    K: KeyMapper<A>,
    C: CommandStore,
    S: SubscriberStore,
{
    cache: Memolock<F::Value, C, S>,
    fetcher: Arc<F>,
    keys: Arc<K>,
    defaults: GetOptions<F::Value>,
    _arg: PhantomData<fn(&A)>,
}

impl<A, F, K, C, S> Clone for MemolockClient<A, F, K, C, S>
where
    A: Send + Sync,
    F: Fetcher<A>,
    K: KeyMapper<A>,
    C: CommandStore,
    S: SubscriberStore,
{
    fn clone(&self) -> Self {
        Self {
            cache: self.cache.clone(),
            fetcher: Arc::clone(&self.fetcher),
            keys: Arc::clone(&self.keys),
            defaults: self.defaults.clone(),
            _arg: PhantomData,
        }
    }
}

impl<A, F, K, C, S> MemolockClient<A, F, K, C, S>
where
    A: Send + Sync,
    F: Fetcher<A>,
    K: KeyMapper<A>,
    C: CommandStore,
    S: SubscriberStore,
{
    /// Bind a fetcher and key mapping to a cache with per-client default
    /// options.
    pub fn new(
        cache: Memolock<F::Value, C, S>,
        fetcher: F,
        keys: K,
        defaults: GetOptions<F::Value>,
    ) -> Self {
        Self {
            cache,
            fetcher: Arc::new(fetcher),
            keys: Arc::new(keys),
            defaults,
            _arg: PhantomData,
        }
    }

    /// Get the value for `arg` with the client's default options.
    pub async fn get(&self, arg: &A) -> Result<F::Value, MemolockError> {
        self.get_with(arg, &self.defaults).await
    }

    /// Get the value for `arg`, overriding the client defaults for this call.
    pub async fn get_with(
        &self,
        arg: &A,
        opts: &GetOptions<F::Value>,
    ) -> Result<F::Value, MemolockError> {
        let key = self.keys.cache_key(arg);
        self.cache.get(&key, opts, || self.fetcher.fetch(arg)).await
    }

    /// Drop the cached value for `arg`; returns how many keys were removed.
    pub async fn delete(&self, arg: &A) -> Result<u64, MemolockError> {
        self.cache.delete(&self.keys.cache_key(arg)).await
    }

    /// Warm the cache for `arg` without going through the lock protocol.
    /// Races concurrent `get`s exactly like [`Memolock::set`].
    pub async fn set(&self, arg: &A, value: &F::Value) -> Result<(), MemolockError> {
        self.cache
            .set(&self.keys.cache_key(arg), value, &self.defaults)
            .await
    }

    /// Close the underlying cache clients.
    pub async fn disconnect(&self) {
        self.cache.disconnect().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MemolockConfig;
    use crate::testutil::MockBackend;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct UserFetcher {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Fetcher<u64> for UserFetcher {
        type Value = String;

        async fn fetch(&self, arg: &u64) -> Result<String, BoxError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(format!("user-{}", arg))
        }
    }

    fn client(
        backend: &MockBackend,
    ) -> MemolockClient<u64, UserFetcher, fn(&u64) -> String, crate::testutil::MockStore, crate::testutil::MockStore>
    {
        let cache = Memolock::new(
            backend.command_store(),
            backend.subscriber_store(),
            MemolockConfig::default(),
        );
        MemolockClient::new(
            cache,
            UserFetcher {
                calls: AtomicUsize::new(0),
            },
            (|id: &u64| format!("user:{}", id)) as fn(&u64) -> String,
            GetOptions::ttl_ms(60_000),
        )
    }

    #[tokio::test]
    async fn get_derives_the_key_and_caches_under_it() {
        let backend = MockBackend::new();
        let client = client(&backend);

        let value = client.get(&42).await.unwrap();
        assert_eq!(value, "user-42");
        assert_eq!(
            backend.stored_value("user:42").as_deref(),
            Some("\"user-42\"")
        );

        // Second call is a cache hit; the fetcher is not consulted.
        let value = client.get(&42).await.unwrap();
        assert_eq!(value, "user-42");
        assert_eq!(client.fetcher.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn delete_invalidates_and_reports_count() {
        let backend = MockBackend::new();
        let client = client(&backend);

        client.get(&7).await.unwrap();
        assert_eq!(client.delete(&7).await.unwrap(), 1);
        assert_eq!(client.delete(&7).await.unwrap(), 0);

        client.get(&7).await.unwrap();
        assert_eq!(client.fetcher.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn set_warms_the_cache_without_fetching() {
        let backend = MockBackend::new();
        let client = client(&backend);

        client.set(&9, &"warmed".to_owned()).await.unwrap();
        assert_eq!(client.get(&9).await.unwrap(), "warmed");
        assert_eq!(client.fetcher.calls.load(Ordering::SeqCst), 0);
    }
}
