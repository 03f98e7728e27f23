use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::{Acker, Delivery, Subscription, Transport};
use crate::envelope::Envelope;
use crate::error::{PipelineError, Result};

pub const DEFAULT_CHANNEL_CAPACITY: usize = 256;
pub const DEFAULT_HISTORY_LIMIT: usize = 1024;

/// In-process, buffered channel transport for local and single-node runs.
///
/// Nothing survives the process. Each consumer group gets every envelope
/// published after it subscribed; members of one group compete round-robin.
/// A nacked delivery goes back to its group. A group subscribing late gets
/// only the retained tail of the topic: the last `history_limit` envelopes.
#[derive(Clone)]
pub struct InMemoryTransport {
    inner: Arc<Inner>,
}

struct Inner {
    topics: Mutex<HashMap<String, TopicState>>,
    capacity: usize,
    history_limit: usize,
    closed: AtomicBool,
}

#[derive(Default)]
struct TopicState {
    history: VecDeque<Envelope>,
    groups: HashMap<String, GroupState>,
}

#[derive(Default)]
struct GroupState {
    members: Vec<mpsc::Sender<Delivery>>,
    next: usize,
    // envelopes waiting for a live member
    parked: VecDeque<(Envelope, u32)>,
}

impl GroupState {
    fn pick(&mut self) -> Option<mpsc::Sender<Delivery>> {
        self.members.retain(|tx| !tx.is_closed());
        if self.members.is_empty() {
            return None;
        }
        let tx = self.members[self.next % self.members.len()].clone();
        self.next = self.next.wrapping_add(1);
        Some(tx)
    }
}

impl Default for InMemoryTransport {
    fn default() -> Self {
        Self::new(DEFAULT_CHANNEL_CAPACITY)
    }
}

impl InMemoryTransport {
    pub fn new(capacity: usize) -> Self {
        Self::with_history_limit(capacity, DEFAULT_HISTORY_LIMIT)
    }

    /// Keep at most `limit` envelopes per topic for late groups; 0 keeps none.
    pub fn with_history_limit(capacity: usize, limit: usize) -> Self {
        Self {
            inner: Arc::new(Inner {
                topics: Mutex::new(HashMap::new()),
                capacity: capacity.max(1),
                history_limit: limit,
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// The retained tail of `topic`, in publish order.
    pub fn published(&self, topic: &str) -> Vec<Envelope> {
        self.inner
            .lock()
            .map(|topics| {
                topics
                    .get(topic)
                    .map(|t| t.history.iter().cloned().collect())
                    .unwrap_or_default()
            })
            .unwrap_or_default()
    }
}

impl Inner {
    fn lock(&self) -> Result<MutexGuard<'_, HashMap<String, TopicState>>> {
        self.topics
            .lock()
            .map_err(|_| PipelineError::transport("in-memory transport state poisoned"))
    }

    async fn deliver(self: &Arc<Self>, topic: &str, group: &str, envelope: Envelope, count: u32) -> Result<()> {
        let sender = {
            let mut topics = self.lock()?;
            let group_state = topics
                .entry(topic.to_string())
                .or_default()
                .groups
                .entry(group.to_string())
                .or_default();
            match group_state.pick() {
                Some(tx) => tx,
                None => {
                    group_state.parked.push_back((envelope, count));
                    return Ok(());
                }
            }
        };

        let acker = InMemoryAcker {
            inner: Arc::clone(self),
            topic: topic.to_string(),
            group: group.to_string(),
            envelope: envelope.clone(),
            delivery_count: count,
        };
        if let Err(returned) = sender.send(Delivery::new(envelope, count, Box::new(acker))).await {
            // member went away between pick and send
            let delivery = returned.0;
            let mut topics = self.lock()?;
            if let Some(group_state) = topics.get_mut(topic).and_then(|t| t.groups.get_mut(group)) {
                group_state.parked.push_back((delivery.envelope, count));
            }
        }
        Ok(())
    }
}

#[async_trait]
impl Transport for InMemoryTransport {
    async fn publish(&self, topic: &str, envelope: &Envelope) -> Result<()> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(PipelineError::transport("in-memory transport is closed"));
        }

        let groups: Vec<String> = {
            let mut topics = self.inner.lock()?;
            let state = topics.entry(topic.to_string()).or_default();
            if self.inner.history_limit > 0 {
                if state.history.len() >= self.inner.history_limit {
                    state.history.pop_front();
                }
                state.history.push_back(envelope.clone());
            }
            state.groups.keys().cloned().collect()
        };

        for group in groups {
            self.inner.deliver(topic, &group, envelope.clone(), 1).await?;
        }
        debug!(topic = %topic, envelope_id = %envelope.id, "In-memory publish");
        Ok(())
    }

    async fn subscribe(&self, topic: &str, consumer_group: &str) -> Result<Subscription> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(PipelineError::transport("in-memory transport is closed"));
        }

        let (tx, rx) = mpsc::channel(self.inner.capacity);
        let backlog: Vec<(Envelope, u32)> = {
            let mut topics = self.inner.lock()?;
            let state = topics.entry(topic.to_string()).or_default();
            let is_new_group = !state.groups.contains_key(consumer_group);
            let history: Vec<Envelope> = if is_new_group {
                state.history.iter().cloned().collect()
            } else {
                Vec::new()
            };
            let group_state = state.groups.entry(consumer_group.to_string()).or_default();
            group_state.parked.extend(history.into_iter().map(|e| (e, 1)));
            group_state.members.push(tx);
            group_state.parked.drain(..).collect()
        };

        if !backlog.is_empty() {
            debug!(topic = %topic, group = %consumer_group, backlog = backlog.len(), "Replaying backlog");
            let inner = Arc::clone(&self.inner);
            let topic = topic.to_string();
            let group = consumer_group.to_string();
            tokio::spawn(async move {
                for (envelope, count) in backlog {
                    if let Err(e) = inner.deliver(&topic, &group, envelope, count).await {
                        warn!(topic = %topic, group = %group, error = %e, "Backlog replay failed");
                        break;
                    }
                }
            });
        }

        Ok(Subscription::new(topic, consumer_group, rx))
    }

    async fn close(&self) -> Result<()> {
        self.inner.closed.store(true, Ordering::SeqCst);
        let mut topics = self.inner.lock()?;
        for state in topics.values_mut() {
            for group in state.groups.values_mut() {
                group.members.clear();
            }
        }
        Ok(())
    }
}

struct InMemoryAcker {
    inner: Arc<Inner>,
    topic: String,
    group: String,
    envelope: Envelope,
    delivery_count: u32,
}

#[async_trait]
impl Acker for InMemoryAcker {
    async fn ack(self: Box<Self>) -> Result<()> {
        Ok(())
    }

    async fn nack(self: Box<Self>) -> Result<()> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Ok(());
        }
        let InMemoryAcker { inner, topic, group, envelope, delivery_count } = *self;
        // resend off the consumer's task so a full channel cannot stall it
        tokio::spawn(async move {
            if let Err(e) = inner.deliver(&topic, &group, envelope, delivery_count + 1).await {
                warn!(topic = %topic, group = %group, error = %e, "Redelivery failed");
            }
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::{ConcertCreated, EnvelopeFactory};
    use std::time::Duration;

    fn envelope(count: usize) -> Envelope {
        EnvelopeFactory::new("gigs", "test")
            .wrap(&ConcertCreated {
                artist_id: "A".to_string(),
                artist_name: "Artist A".to_string(),
                concert_count: count,
            })
            .unwrap()
    }

    async fn next(sub: &mut Subscription) -> Delivery {
        tokio::time::timeout(Duration::from_secs(2), sub.next())
            .await
            .expect("timed out waiting for delivery")
            .expect("subscription closed")
    }

    #[tokio::test]
    async fn each_group_receives_every_envelope() {
        let transport = InMemoryTransport::default();
        let mut notify = transport.subscribe("t", "notify").await.unwrap();
        let mut audit = transport.subscribe("t", "audit").await.unwrap();

        let env = envelope(1);
        transport.publish("t", &env).await.unwrap();

        assert_eq!(next(&mut notify).await.envelope, env);
        assert_eq!(next(&mut audit).await.envelope, env);
    }

    #[tokio::test]
    async fn nack_redelivers_to_same_group_with_higher_count() {
        let transport = InMemoryTransport::default();
        let mut sub = transport.subscribe("t", "g").await.unwrap();
        transport.publish("t", &envelope(1)).await.unwrap();

        let first = next(&mut sub).await;
        assert_eq!(first.delivery_count, 1);
        let id = first.envelope.id;
        first.nack().await.unwrap();

        let second = next(&mut sub).await;
        assert_eq!(second.envelope.id, id);
        assert_eq!(second.delivery_count, 2);
        second.ack().await.unwrap();
    }

    #[tokio::test]
    async fn new_group_replays_topic_history() {
        let transport = InMemoryTransport::default();
        transport.publish("t", &envelope(1)).await.unwrap();
        transport.publish("t", &envelope(2)).await.unwrap();

        let mut late = transport.subscribe("t", "late").await.unwrap();
        let a: ConcertCreated = next(&mut late).await.envelope.decode().unwrap();
        let b: ConcertCreated = next(&mut late).await.envelope.decode().unwrap();
        assert_eq!((a.concert_count, b.concert_count), (1, 2));
        assert_eq!(transport.published("t").len(), 2);
    }

    #[tokio::test]
    async fn history_keeps_only_the_newest_envelopes() {
        let transport = InMemoryTransport::with_history_limit(16, 2);
        for count in 1..=5 {
            transport.publish("t", &envelope(count)).await.unwrap();
        }

        let retained: Vec<usize> = transport
            .published("t")
            .iter()
            .map(|e| e.decode::<ConcertCreated>().unwrap().concert_count)
            .collect();
        assert_eq!(retained, vec![4, 5]);

        let mut late = transport.subscribe("t", "late").await.unwrap();
        let first: ConcertCreated = next(&mut late).await.envelope.decode().unwrap();
        let second: ConcertCreated = next(&mut late).await.envelope.decode().unwrap();
        assert_eq!((first.concert_count, second.concert_count), (4, 5));
        assert!(tokio::time::timeout(Duration::from_millis(100), late.next()).await.is_err());
    }

    #[tokio::test]
    async fn zero_history_limit_still_delivers_to_existing_groups() {
        let transport = InMemoryTransport::with_history_limit(16, 0);
        let mut early = transport.subscribe("t", "early").await.unwrap();
        transport.publish("t", &envelope(1)).await.unwrap();

        assert_eq!(next(&mut early).await.delivery_count, 1);
        assert!(transport.published("t").is_empty());
    }

    #[tokio::test]
    async fn members_of_one_group_compete() {
        let transport = InMemoryTransport::default();
        let mut first = transport.subscribe("t", "g").await.unwrap();
        let mut second = transport.subscribe("t", "g").await.unwrap();

        transport.publish("t", &envelope(1)).await.unwrap();
        transport.publish("t", &envelope(2)).await.unwrap();

        let a = next(&mut first).await;
        let b = next(&mut second).await;
        assert_ne!(a.envelope.id, b.envelope.id);
    }

    #[tokio::test]
    async fn publish_after_close_is_an_error() {
        let transport = InMemoryTransport::default();
        transport.close().await.unwrap();
        assert!(transport.publish("t", &envelope(1)).await.is_err());
    }
}
