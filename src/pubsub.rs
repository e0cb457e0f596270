//! The publisher/subscriber bridge: pulls raw messages off an external
//! queue, resolves destinations, and dispatches to each one.
//!
//! Grounded on the original source's `message.go`
//! (`MessageResolver`/`MessagePublisher`/`MessageSubscriber` plus its
//! in-memory reference queue), translated from Go's callback-driven
//! `Subscribe(ctx, f)` into a pull-based `Subscriber::recv`, and backed by
//! `tokio::sync::broadcast` for the reference queue — the same channel
//! primitive the teacher stack already carries for pub/sub fan-out.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use tokio::sync::broadcast;
use tracing::warn;

use crate::dispatcher::Dispatcher;
use crate::error::Result;

/// One message pulled off the queue, not yet resolved to a destination.
#[derive(Debug, Clone)]
pub struct RawMessage {
    pub id: Option<String>,
    pub payload: Vec<u8>,
    pub timestamp_millis: u128,
}

impl RawMessage {
    pub fn new(id: Option<String>, payload: Vec<u8>) -> Self {
        let timestamp_millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis();
        Self {
            id,
            payload,
            timestamp_millis,
        }
    }
}

/// Resolves a raw message to zero or more destination client IDs.
/// Caller-supplied: message-to-destination logic is out of scope for the
/// fabric itself.
#[async_trait]
pub trait Resolver: Send + Sync + 'static {
    async fn resolve(&self, msg: &RawMessage) -> Result<Vec<String>>;
}

#[async_trait]
pub trait Publisher: Send + Sync + 'static {
    async fn publish(&self, msg: RawMessage) -> Result<()>;
}

#[async_trait]
pub trait Subscriber: Send + 'static {
    /// Pull the next message. `Ok(None)` means the queue has closed and
    /// the bridge loop should stop.
    async fn recv(&mut self) -> Result<Option<RawMessage>>;
}

/// In-memory reference queue, suitable for tests and single-node use.
/// The original source's own doc comment calls an in-memory MQ
/// "nonsensical" for production, and that's still true here — use a real
/// broker for anything that needs to survive a restart.
#[derive(Clone)]
pub struct InMemoryQueue {
    tx: broadcast::Sender<RawMessage>,
}

impl InMemoryQueue {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> InMemorySubscriber {
        InMemorySubscriber(self.tx.subscribe())
    }
}

#[async_trait]
impl Publisher for InMemoryQueue {
    async fn publish(&self, msg: RawMessage) -> Result<()> {
        // No receivers is not an error: a queue with nobody subscribed yet
        // simply drops the message, matching the non-durable,
        // best-effort delivery model.
        let _ = self.tx.send(msg);
        Ok(())
    }
}

pub struct InMemorySubscriber(broadcast::Receiver<RawMessage>);

#[async_trait]
impl Subscriber for InMemorySubscriber {
    async fn recv(&mut self) -> Result<Option<RawMessage>> {
        loop {
            match self.0.recv().await {
                Ok(msg) => return Ok(Some(msg)),
                // A slow subscriber missed some messages; no ordering or
                // durability guarantee is made, so skip ahead rather than
                // fail the whole bridge.
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => return Ok(None),
            }
        }
    }
}

/// The public send facade: publishes to the queue rather than dispatching
/// directly, so through-queue traffic stays symmetric across every node in
/// the cluster.
#[derive(Clone)]
pub struct Facade {
    publisher: Arc<dyn Publisher>,
}

impl Facade {
    pub fn new(publisher: Arc<dyn Publisher>) -> Self {
        Self { publisher }
    }

    pub async fn send(&self, id: Option<String>, payload: Vec<u8>) -> Result<()> {
        self.publisher.publish(RawMessage::new(id, payload)).await
    }
}

/// Drives one subscriber: for each message, resolve destinations and
/// dispatch to each. Runs until the subscriber reports the queue closed.
/// Intended to be spawned as the process-wide subscriber loop task.
pub async fn run(
    mut subscriber: Box<dyn Subscriber>,
    resolver: Arc<dyn Resolver>,
    dispatcher: Dispatcher,
) {
    loop {
        let msg = match subscriber.recv().await {
            Ok(Some(msg)) => msg,
            Ok(None) => break,
            Err(err) => {
                warn!(%err, "subscriber queue error, stopping bridge");
                break;
            }
        };

        let destinations = match resolver.resolve(&msg).await {
            Ok(destinations) => destinations,
            Err(err) => {
                warn!(%err, "destination resolution failed, dropping message");
                continue;
            }
        };

        for id in destinations {
            if let Err(err) = dispatcher.send(&id, &msg.payload).await {
                warn!(id, %err, "dispatch failed for resolved destination");
            }
        }
    }
}
