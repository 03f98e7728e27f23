//! Publish/subscribe over interchangeable transports.
//!
//! Producers and consumers only see [`Transport`], [`Subscription`] and
//! [`Delivery`]. The durable SQLite broker and the in-process channel are
//! drop-in replacements for each other: both deliver at-least-once per
//! consumer group, and both redeliver a nacked envelope to the same group.

pub mod in_memory;
pub mod sqlite;

use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error};

use crate::context::Ctx;
use crate::envelope::{Envelope, EnvelopeFactory, EventPayload};
use crate::error::Result;

pub use in_memory::InMemoryTransport;
pub use sqlite::SqliteTransport;

#[async_trait]
pub trait Transport: Send + Sync {
    /// Publish an envelope. Errors are always surfaced, never swallowed.
    async fn publish(&self, topic: &str, envelope: &Envelope) -> Result<()>;

    /// Join `consumer_group` on `topic`. A group seen for the first time starts
    /// from the oldest envelope the transport still retains.
    async fn subscribe(&self, topic: &str, consumer_group: &str) -> Result<Subscription>;

    /// Stop background delivery work and flush anything buffered.
    async fn close(&self) -> Result<()>;
}

/// Settles one delivery with its transport.
#[async_trait]
pub trait Acker: Send + Sync {
    async fn ack(self: Box<Self>) -> Result<()>;
    async fn nack(self: Box<Self>) -> Result<()>;
}

/// One envelope handed to one consumer group member.
pub struct Delivery {
    pub envelope: Envelope,
    /// 1 on first delivery, incremented on each redelivery
    pub delivery_count: u32,
    acker: Box<dyn Acker>,
}

impl Delivery {
    pub fn new(envelope: Envelope, delivery_count: u32, acker: Box<dyn Acker>) -> Self {
        Self { envelope, delivery_count, acker }
    }

    pub async fn ack(self) -> Result<()> {
        self.acker.ack().await
    }

    /// Hand the envelope back for redelivery to the same group.
    pub async fn nack(self) -> Result<()> {
        self.acker.nack().await
    }
}

impl std::fmt::Debug for Delivery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Delivery")
            .field("envelope_id", &self.envelope.id)
            .field("event_type", &self.envelope.event_type)
            .field("delivery_count", &self.delivery_count)
            .finish()
    }
}

/// Stream of deliveries for one (topic, consumer group) membership.
pub struct Subscription {
    topic: String,
    consumer_group: String,
    rx: mpsc::Receiver<Delivery>,
}

impl Subscription {
    pub fn new(topic: &str, consumer_group: &str, rx: mpsc::Receiver<Delivery>) -> Self {
        Self {
            topic: topic.to_string(),
            consumer_group: consumer_group.to_string(),
            rx,
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn consumer_group(&self) -> &str {
        &self.consumer_group
    }

    /// Next delivery, or `None` once the transport has shut down.
    pub async fn next(&mut self) -> Option<Delivery> {
        self.rx.recv().await
    }
}

/// Wraps payloads into envelopes and publishes them on their kind's topic.
#[derive(Clone)]
pub struct EventPublisher {
    transport: Arc<dyn Transport>,
    factory: EnvelopeFactory,
}

impl EventPublisher {
    pub fn new(transport: Arc<dyn Transport>, factory: EnvelopeFactory) -> Self {
        Self { transport, factory }
    }

    pub fn factory(&self) -> &EnvelopeFactory {
        &self.factory
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    pub async fn publish<P: EventPayload>(&self, ctx: &Ctx, payload: &P) -> Result<Envelope> {
        let envelope = self.factory.wrap(payload)?;
        let topic = self.factory.topic(P::KIND);
        match ctx.run(self.transport.publish(&topic, &envelope)).await {
            Ok(()) => {
                debug!(topic = %topic, envelope_id = %envelope.id, "Published envelope");
                crate::observability::record_publish(&topic, true);
                Ok(envelope)
            }
            Err(e) => {
                error!(topic = %topic, envelope_id = %envelope.id, error = %e, "Publish failed");
                crate::observability::record_publish(&topic, false);
                Err(e)
            }
        }
    }
}
