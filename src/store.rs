//! Backing store facade
//!
//! The narrow interface the lock protocol depends on, and its Redis
//! implementation. Two logically distinct clients are required:
//! - a command client for GET/SET/DEL/PUBLISH/PIPELINE
//! - a subscription client that is only ever in subscribe mode
//!
//! Redis refuses regular commands on a connection that has entered subscribe
//! mode, so the two sides never share a connection. [`RedisCommandStore`]
//! wraps a `ConnectionManager`; [`RedisSubscriber`] owns a dedicated pub/sub
//! connection inside a background hub task driven by control messages.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use redis::aio::{ConnectionManager, PubSubSink, PubSubStream};
use redis::AsyncCommands;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, warn};

use crate::error::BoxError;

/// Process-wide inbound handler for the subscription client: `(channel, payload)`.
pub type MessageHandler = Arc<dyn Fn(String, String) + Send + Sync>;

/// One step of a pipelined batch. Submission order is preserved; the backing
/// store is not required to execute the batch atomically.
#[derive(Debug, Clone)]
pub enum PipelineOp {
    /// `SET key value PX ttl_ms`
    SetPx {
        key: String,
        value: String,
        ttl_ms: u64,
    },
    /// `PUBLISH channel payload`
    Publish { channel: String, payload: String },
    /// `DEL key`
    Del { key: String },
}

/// Typed command operations the coordinator needs.
#[async_trait]
pub trait CommandStore: Send + Sync + 'static {
    /// Read a value; `None` when the key is absent.
    async fn get(&self, key: &str) -> Result<Option<String>, BoxError>;

    /// Store a value with a TTL in milliseconds.
    async fn set_px(&self, key: &str, value: &str, ttl_ms: u64) -> Result<(), BoxError>;

    /// Store a value with a TTL only if the key is absent. Returns whether
    /// the key was set, i.e. whether the lock was acquired.
    async fn set_nx_px(&self, key: &str, value: &str, ttl_ms: u64) -> Result<bool, BoxError>;

    /// Delete a key, returning the number of keys removed.
    async fn del(&self, key: &str) -> Result<u64, BoxError>;

    /// Publish a payload on a channel.
    async fn publish(&self, channel: &str, payload: &str) -> Result<(), BoxError>;

    /// Dispatch a batch of operations in submission order.
    async fn pipeline(&self, ops: Vec<PipelineOp>) -> Result<(), BoxError>;

    /// Close the client. Closing an already-closed client is not an error.
    async fn quit(&self) -> Result<(), BoxError>;
}

/// Subscription operations, backed by a client that only subscribes.
#[async_trait]
pub trait SubscriberStore: Send + Sync + 'static {
    /// Enter a channel subscription upstream.
    async fn subscribe(&self, channel: &str) -> Result<(), BoxError>;

    /// Leave a channel subscription upstream, best-effort.
    async fn unsubscribe(&self, channel: &str) -> Result<(), BoxError>;

    /// Register the process-wide handler for inbound messages. Subsequent
    /// registrations replace the handler.
    fn on_message(&self, handler: MessageHandler);

    /// Close the client. Closing an already-closed client is not an error.
    async fn quit(&self) -> Result<(), BoxError>;
}

/// Command client over a pooled, auto-reconnecting Redis connection.
#[derive(Clone)]
pub struct RedisCommandStore {
    conn: ConnectionManager,
}

impl RedisCommandStore {
    /// Connect the command side of the dual-client pair.
    pub async fn connect(client: redis::Client) -> Result<Self, redis::RedisError> {
        let conn = ConnectionManager::new(client).await?;
        Ok(Self { conn })
    }
}

#[async_trait]
impl CommandStore for RedisCommandStore {
    async fn get(&self, key: &str) -> Result<Option<String>, BoxError> {
        let mut conn = self.conn.clone();
        let value: Option<String> = conn.get(key).await?;
        Ok(value)
    }

    async fn set_px(&self, key: &str, value: &str, ttl_ms: u64) -> Result<(), BoxError> {
        let mut conn = self.conn.clone();
        redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("PX")
            .arg(ttl_ms)
            .query_async::<()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn set_nx_px(&self, key: &str, value: &str, ttl_ms: u64) -> Result<bool, BoxError> {
        let mut conn = self.conn.clone();
        // Nil reply means the key already existed and nothing was set.
        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("NX")
            .arg("PX")
            .arg(ttl_ms)
            .query_async(&mut conn)
            .await?;
        Ok(reply.is_some())
    }

    async fn del(&self, key: &str) -> Result<u64, BoxError> {
        let mut conn = self.conn.clone();
        let removed: u64 = conn.del(key).await?;
        Ok(removed)
    }

    async fn publish(&self, channel: &str, payload: &str) -> Result<(), BoxError> {
        let mut conn = self.conn.clone();
        conn.publish::<_, _, ()>(channel, payload).await?;
        Ok(())
    }

    async fn pipeline(&self, ops: Vec<PipelineOp>) -> Result<(), BoxError> {
        let mut conn = self.conn.clone();
        let mut pipe = redis::pipe();
        for op in &ops {
            match op {
                PipelineOp::SetPx { key, value, ttl_ms } => {
                    pipe.cmd("SET")
                        .arg(key)
                        .arg(value)
                        .arg("PX")
                        .arg(*ttl_ms)
                        .ignore();
                }
                PipelineOp::Publish { channel, payload } => {
                    pipe.cmd("PUBLISH").arg(channel).arg(payload).ignore();
                }
                PipelineOp::Del { key } => {
                    pipe.cmd("DEL").arg(key).ignore();
                }
            }
        }
        pipe.query_async::<()>(&mut conn).await?;
        Ok(())
    }

    async fn quit(&self) -> Result<(), BoxError> {
        // ConnectionManager has no explicit quit; the connection closes when
        // the last clone is dropped.
        Ok(())
    }
}

enum HubCmd {
    Register {
        handler: MessageHandler,
    },
    Subscribe {
        channel: String,
        ack: oneshot::Sender<Result<(), redis::RedisError>>,
    },
    Unsubscribe {
        channel: String,
    },
    Quit,
}

/// Subscription client: a background hub task owning one subscribe-mode
/// connection, driven by control messages.
///
/// Control messages are processed in submission order, so an `unsubscribe`
/// issued before a later `subscribe` on the same channel cannot cancel it.
pub struct RedisSubscriber {
    tx: mpsc::UnboundedSender<HubCmd>,
}

impl RedisSubscriber {
    /// Connect the subscription side of the dual-client pair and spawn the
    /// hub task.
    pub async fn connect(client: redis::Client) -> Result<Self, redis::RedisError> {
        let pubsub = client.get_async_pubsub().await?;
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(run_hub(client, pubsub, rx));
        Ok(Self { tx })
    }
}

#[async_trait]
impl SubscriberStore for RedisSubscriber {
    async fn subscribe(&self, channel: &str) -> Result<(), BoxError> {
        let (ack_tx, ack_rx) = oneshot::channel();
        self.tx
            .send(HubCmd::Subscribe {
                channel: channel.to_owned(),
                ack: ack_tx,
            })
            .map_err(|_| "subscription client is closed")?;
        match ack_rx.await {
            Ok(result) => Ok(result?),
            Err(_) => Err("subscription client is closed".into()),
        }
    }

    async fn unsubscribe(&self, channel: &str) -> Result<(), BoxError> {
        self.tx
            .send(HubCmd::Unsubscribe {
                channel: channel.to_owned(),
            })
            .map_err(|_| "subscription client is closed")?;
        Ok(())
    }

    fn on_message(&self, handler: MessageHandler) {
        let _ = self.tx.send(HubCmd::Register { handler });
    }

    async fn quit(&self) -> Result<(), BoxError> {
        let _ = self.tx.send(HubCmd::Quit);
        Ok(())
    }
}

async fn run_hub(
    client: redis::Client,
    pubsub: redis::aio::PubSub,
    mut rx: mpsc::UnboundedReceiver<HubCmd>,
) {
    let (mut sink, mut stream) = pubsub.split();
    let mut handler: Option<MessageHandler> = None;
    let mut subscribed: HashSet<String> = HashSet::new();

    loop {
        tokio::select! {
            cmd = rx.recv() => match cmd {
                Some(HubCmd::Register { handler: h }) => handler = Some(h),
                Some(HubCmd::Subscribe { channel, ack }) => {
                    let result = sink.subscribe(&channel).await;
                    if result.is_ok() {
                        debug!("subscribed to channel {}", channel);
                        subscribed.insert(channel);
                    }
                    let _ = ack.send(result);
                }
                Some(HubCmd::Unsubscribe { channel }) => {
                    subscribed.remove(&channel);
                    if let Err(e) = sink.unsubscribe(&channel).await {
                        warn!("unsubscribe from channel {} failed: {}", channel, e);
                    }
                }
                Some(HubCmd::Quit) | None => break,
            },
            msg = stream.next() => match msg {
                Some(msg) => {
                    let channel = msg.get_channel_name().to_owned();
                    match msg.get_payload::<String>() {
                        Ok(payload) => match &handler {
                            Some(handler) => handler(channel, payload),
                            None => debug!("dropping message on channel {}: no handler registered", channel),
                        },
                        Err(e) => warn!("failed to decode payload on channel {}: {}", channel, e),
                    }
                }
                None => match reconnect(&client, &subscribed).await {
                    Some((new_sink, new_stream)) => {
                        sink = new_sink;
                        stream = new_stream;
                    }
                    None => {
                        error!("pub/sub connection lost and could not be re-established");
                        break;
                    }
                },
            }
        }
    }
    debug!("pub/sub hub stopped");
}

/// Re-establish the subscribe-mode connection and restore every channel
/// subscription. Waiters that missed a publish during the gap recover through
/// their own timeout-and-retry.
async fn reconnect(
    client: &redis::Client,
    subscribed: &HashSet<String>,
) -> Option<(PubSubSink, PubSubStream)> {
    let mut delay = Duration::from_millis(100);
    for attempt in 1..=5u32 {
        match client.get_async_pubsub().await {
            Ok(pubsub) => {
                let (mut sink, stream) = pubsub.split();
                let mut restored = true;
                for channel in subscribed {
                    if let Err(e) = sink.subscribe(channel).await {
                        warn!("re-subscribe to channel {} failed: {}", channel, e);
                        restored = false;
                        break;
                    }
                }
                if restored {
                    debug!("pub/sub connection re-established ({} channels)", subscribed.len());
                    return Some((sink, stream));
                }
            }
            Err(e) => warn!("pub/sub reconnect attempt {} failed: {}", attempt, e),
        }
        tokio::time::sleep(delay).await;
        delay = (delay * 2).min(Duration::from_secs(2));
    }
    None
}
