//! Memolock error types

/// Boxed error used at the pluggable seams (backing store, fetchers, codecs).
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Errors surfaced by `get`, `set` and `delete`.
///
/// Best-effort cleanup failures (releasing a lock after a failed fetch,
/// unsubscribing a drained channel, pipelining against a disconnected store)
/// are never surfaced here; they go to the configured error handler.
#[derive(Debug, thiserror::Error)]
pub enum MemolockError {
    /// A backing store command on the main request path failed.
    #[error("Backing store error: {0}")]
    Store(#[source] BoxError),

    /// Encoding a fetched value for storage failed.
    #[error("Encode error: {0}")]
    Encode(#[source] BoxError),

    /// Decoding a cached value or a published payload failed.
    #[error("Decode error: {0}")]
    Decode(#[source] BoxError),

    /// The user-supplied fetch failed. The original error is preserved and
    /// this variant displays as that error.
    #[error(transparent)]
    Fetch(BoxError),

    /// Every allowed attempt timed out waiting for the unlock notification.
    #[error("Never received message that key was unlocked.")]
    NeverUnlocked,
}

impl From<redis::RedisError> for MemolockError {
    fn from(err: redis::RedisError) -> Self {
        MemolockError::Store(Box::new(err))
    }
}
