//! Memolock configuration
//!
//! Two layers of configuration:
//! - [`MemolockConfig`]: per-instance defaults (lock timeout, attempt cap)
//! - [`GetOptions`]: per-call options (TTL, codec, cache predicate, overrides)

use std::sync::Arc;
use std::time::Duration;

use tracing::error;

use crate::error::BoxError;
use crate::memolock::Cacheable;

/// Encoder from a value to the string payload stored and published.
pub type EncodeFn<V> = Arc<dyn Fn(&V) -> Result<String, BoxError> + Send + Sync>;

/// Decoder from a stored or published payload back to a value.
pub type DecodeFn<V> = Arc<dyn Fn(&str) -> Result<V, BoxError> + Send + Sync>;

/// Sink for best-effort cleanup failures. Never called on the main request
/// path; callers see those errors as `MemolockError` instead.
pub type ErrorHandler = Arc<dyn Fn(&(dyn std::error::Error + Send + Sync)) + Send + Sync>;

/// Default error handler: log and move on.
pub(crate) fn default_error_handler() -> ErrorHandler {
    Arc::new(|err: &(dyn std::error::Error + Send + Sync)| {
        error!("memolock cleanup error: {}", err)
    })
}

/// Per-instance defaults for the lock protocol
#[derive(Debug, Clone)]
pub struct MemolockConfig {
    /// TTL of the lock sentinel and timeout of each waiter subscription
    pub lock_timeout: Duration,
    /// Total attempts before `get` gives up waiting for an unlock
    pub max_attempts: u32,
}

impl Default for MemolockConfig {
    fn default() -> Self {
        Self {
            lock_timeout: Duration::from_millis(1000),
            max_attempts: 3,
        }
    }
}

/// Cache TTL for a value: a constant, or derived from the value itself.
///
/// A resolved TTL of 0 skips the `SET` for that value; the computed value is
/// still published to waiters and the lock is still released.
pub enum TtlSpec<V> {
    /// Fixed TTL in milliseconds
    Millis(u64),
    /// TTL computed from the fetched value, in milliseconds
    PerValue(Arc<dyn Fn(&V) -> u64 + Send + Sync>),
}

impl<V> Clone for TtlSpec<V> {
    fn clone(&self) -> Self {
        match self {
            TtlSpec::Millis(ms) => TtlSpec::Millis(*ms),
            TtlSpec::PerValue(f) => TtlSpec::PerValue(Arc::clone(f)),
        }
    }
}

impl<V> TtlSpec<V> {
    pub(crate) fn resolve(&self, value: &V) -> u64 {
        match self {
            TtlSpec::Millis(ms) => *ms,
            TtlSpec::PerValue(f) => f(value),
        }
    }
}

impl<V> std::fmt::Debug for TtlSpec<V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TtlSpec::Millis(ms) => f.debug_tuple("Millis").field(ms).finish(),
            TtlSpec::PerValue(_) => f.debug_tuple("PerValue").finish(),
        }
    }
}

/// Per-call options for `get` and `set`.
///
/// Only the TTL is required; everything else takes the documented default
/// (JSON codec, always cache, instance-level lock timeout and attempt cap).
pub struct GetOptions<V> {
    pub(crate) ttl: TtlSpec<V>,
    pub(crate) lock_timeout: Option<Duration>,
    pub(crate) max_attempts: Option<u32>,
    pub(crate) force_refresh: bool,
    pub(crate) encode: Option<EncodeFn<V>>,
    pub(crate) decode: Option<DecodeFn<V>>,
    pub(crate) cache_if: Option<Arc<dyn Fn(&V) -> bool + Send + Sync>>,
}

impl<V> Clone for GetOptions<V> {
    fn clone(&self) -> Self {
        Self {
            ttl: self.ttl.clone(),
            lock_timeout: self.lock_timeout,
            max_attempts: self.max_attempts,
            force_refresh: self.force_refresh,
            encode: self.encode.clone(),
            decode: self.decode.clone(),
            cache_if: self.cache_if.clone(),
        }
    }
}

impl<V: Cacheable> GetOptions<V> {
    /// Options with a fixed cache TTL in milliseconds.
    pub fn ttl_ms(ttl_ms: u64) -> Self {
        Self::with_ttl(TtlSpec::Millis(ttl_ms))
    }

    /// Options with a TTL computed from the fetched value.
    pub fn ttl_of(f: impl Fn(&V) -> u64 + Send + Sync + 'static) -> Self {
        Self::with_ttl(TtlSpec::PerValue(Arc::new(f)))
    }

    fn with_ttl(ttl: TtlSpec<V>) -> Self {
        Self {
            ttl,
            lock_timeout: None,
            max_attempts: None,
            force_refresh: false,
            encode: None,
            decode: None,
            cache_if: None,
        }
    }

    /// Override the instance-level lock timeout for this call.
    pub fn lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = Some(timeout);
        self
    }

    /// Override the instance-level attempt cap for this call.
    pub fn max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = Some(attempts);
        self
    }

    /// Skip the initial cache read; still participate in the lock protocol.
    pub fn force_refresh(mut self, force: bool) -> Self {
        self.force_refresh = force;
        self
    }

    /// Replace the default JSON encoder.
    pub fn encode_with(mut self, f: impl Fn(&V) -> Result<String, BoxError> + Send + Sync + 'static) -> Self {
        self.encode = Some(Arc::new(f));
        self
    }

    /// Replace the default JSON decoder.
    pub fn decode_with(mut self, f: impl Fn(&str) -> Result<V, BoxError> + Send + Sync + 'static) -> Self {
        self.decode = Some(Arc::new(f));
        self
    }

    /// Only store the value when the predicate holds; waiters are notified
    /// either way.
    pub fn cache_if(mut self, f: impl Fn(&V) -> bool + Send + Sync + 'static) -> Self {
        self.cache_if = Some(Arc::new(f));
        self
    }

    pub(crate) fn encode_fn(&self) -> EncodeFn<V> {
        self.encode.clone().unwrap_or_else(|| {
            Arc::new(|value: &V| serde_json::to_string(value).map_err(|e| Box::new(e) as BoxError))
        })
    }

    pub(crate) fn decode_fn(&self) -> DecodeFn<V> {
        self.decode.clone().unwrap_or_else(|| {
            Arc::new(|raw: &str| serde_json::from_str::<V>(raw).map_err(|e| Box::new(e) as BoxError))
        })
    }

    pub(crate) fn resolve_ttl_ms(&self, value: &V) -> u64 {
        self.ttl.resolve(value)
    }

    pub(crate) fn should_cache(&self, value: &V) -> bool {
        match &self.cache_if {
            Some(predicate) => predicate(value),
            None => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_protocol_documentation() {
        let config = MemolockConfig::default();
        assert_eq!(config.lock_timeout, Duration::from_millis(1000));
        assert_eq!(config.max_attempts, 3);
    }

    #[test]
    fn ttl_resolves_per_value() {
        let opts: GetOptions<u64> = GetOptions::ttl_of(|v| v * 10);
        assert_eq!(opts.resolve_ttl_ms(&7), 70);

        let fixed: GetOptions<u64> = GetOptions::ttl_ms(5000);
        assert_eq!(fixed.resolve_ttl_ms(&7), 5000);
    }

    #[test]
    fn cache_if_defaults_to_true() {
        let opts: GetOptions<i64> = GetOptions::ttl_ms(100);
        assert!(opts.should_cache(&-3));

        let gated = opts.cache_if(|v| *v >= 0);
        assert!(!gated.should_cache(&-3));
        assert!(gated.should_cache(&3));
    }
}
