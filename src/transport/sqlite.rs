use async_trait::async_trait;
use chrono::Utc;
use rusqlite::{params, TransactionBehavior};
use std::path::Path;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{Acker, Delivery, Subscription, Transport};
use crate::db::Database;
use crate::envelope::Envelope;
use crate::error::{PipelineError, Result};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS messages (
    seq           INTEGER PRIMARY KEY AUTOINCREMENT,
    topic         TEXT NOT NULL,
    envelope_id   TEXT NOT NULL,
    body          TEXT NOT NULL,
    published_at  INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_messages_topic_seq ON messages (topic, seq);
CREATE TABLE IF NOT EXISTS deliveries (
    topic           TEXT NOT NULL,
    consumer_group  TEXT NOT NULL,
    seq             INTEGER NOT NULL,
    state           TEXT NOT NULL,
    attempts        INTEGER NOT NULL DEFAULT 0,
    visible_at      INTEGER NOT NULL DEFAULT 0,
    PRIMARY KEY (topic, consumer_group, seq)
);
CREATE INDEX IF NOT EXISTS idx_deliveries_claim
    ON deliveries (topic, consumer_group, state, visible_at);
"#;

#[derive(Debug, Clone)]
pub struct SqliteTransportConfig {
    /// An unacked delivery becomes visible to the group again after this long
    pub ack_timeout: Duration,
    pub poll_interval: Duration,
    pub channel_capacity: usize,
}

impl Default for SqliteTransportConfig {
    fn default() -> Self {
        Self {
            ack_timeout: Duration::from_secs(60),
            poll_interval: Duration::from_millis(250),
            channel_capacity: 64,
        }
    }
}

/// Durable, acknowledgement-based broker on a local SQLite file.
///
/// Messages are an append-only table; each consumer group tracks its own
/// delivery rows. Nacked or timed-out deliveries are claimed again, so
/// envelopes survive restarts until acked.
#[derive(Clone)]
pub struct SqliteTransport {
    db: Database,
    config: SqliteTransportConfig,
    closed: CancellationToken,
}

struct Claimed {
    seq: i64,
    attempts: u32,
    body: String,
}

impl SqliteTransport {
    /// Open the broker file under `data_root`.
    pub fn open_at_root<P: AsRef<Path>>(data_root: P, config: SqliteTransportConfig) -> Result<Self> {
        let path = data_root.as_ref().join("broker").join("broker.db");
        Self::open(&path, config)
    }

    pub fn open(path: &Path, config: SqliteTransportConfig) -> Result<Self> {
        let db = Database::open(path, SCHEMA)?;
        Ok(Self {
            db,
            config,
            closed: CancellationToken::new(),
        })
    }

    /// Deliveries for a group that are neither acked nor in flight.
    pub async fn backlog(&self, topic: &str, consumer_group: &str) -> Result<u64> {
        let topic = topic.to_string();
        let group = consumer_group.to_string();
        self.db
            .call(move |conn| {
                let known: i64 = conn.query_row(
                    "SELECT COUNT(*) FROM deliveries WHERE topic = ?1 AND consumer_group = ?2 AND state <> 'acked'",
                    params![topic, group],
                    |row| row.get(0),
                )?;
                let unseen: i64 = conn.query_row(
                    "SELECT COUNT(*) FROM messages WHERE topic = ?1 AND seq > COALESCE(
                        (SELECT MAX(seq) FROM deliveries WHERE topic = ?1 AND consumer_group = ?2), 0)",
                    params![topic, group],
                    |row| row.get(0),
                )?;
                Ok((known + unseen) as u64)
            })
            .await
    }

    async fn claim(&self, topic: &str, group: &str, limit: usize) -> Result<Vec<Claimed>> {
        let topic = topic.to_string();
        let group = group.to_string();
        let ack_timeout_ms = self.config.ack_timeout.as_millis() as i64;
        self.db
            .call(move |conn| {
                let now = Utc::now().timestamp_millis();
                let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

                // enrol messages this group has not seen yet
                tx.execute(
                    "INSERT OR IGNORE INTO deliveries (topic, consumer_group, seq, state, attempts, visible_at)
                     SELECT m.topic, ?2, m.seq, 'ready', 0, 0 FROM messages m
                     WHERE m.topic = ?1 AND m.seq > COALESCE(
                        (SELECT MAX(seq) FROM deliveries WHERE topic = ?1 AND consumer_group = ?2), 0)",
                    params![topic, group],
                )?;

                let mut claimed = Vec::new();
                {
                    let mut stmt = tx.prepare(
                        "SELECT d.seq, d.attempts, m.body FROM deliveries d
                         JOIN messages m ON m.seq = d.seq
                         WHERE d.topic = ?1 AND d.consumer_group = ?2
                           AND d.state IN ('ready', 'inflight') AND d.visible_at <= ?3
                         ORDER BY d.seq LIMIT ?4",
                    )?;
                    let rows = stmt.query_map(params![topic, group, now, limit as i64], |row| {
                        Ok(Claimed {
                            seq: row.get(0)?,
                            attempts: row.get::<_, i64>(1)? as u32 + 1,
                            body: row.get(2)?,
                        })
                    })?;
                    for row in rows {
                        claimed.push(row?);
                    }
                }

                for c in &claimed {
                    tx.execute(
                        "UPDATE deliveries SET state = 'inflight', attempts = ?4, visible_at = ?5
                         WHERE topic = ?1 AND consumer_group = ?2 AND seq = ?3",
                        params![topic, group, c.seq, c.attempts as i64, now + ack_timeout_ms],
                    )?;
                }
                tx.commit()?;
                Ok(claimed)
            })
            .await
    }

    async fn settle(&self, topic: &str, group: &str, seq: i64, state: &'static str) -> Result<()> {
        let topic = topic.to_string();
        let group = group.to_string();
        self.db
            .call(move |conn| {
                conn.execute(
                    "UPDATE deliveries SET state = ?4, visible_at = 0
                     WHERE topic = ?1 AND consumer_group = ?2 AND seq = ?3 AND state = 'inflight'",
                    params![topic, group, seq, state],
                )?;
                Ok(())
            })
            .await
    }

    async fn poll_loop(self, topic: String, group: String, tx: mpsc::Sender<Delivery>) {
        debug!(topic = %topic, group = %group, "Starting broker poll loop");
        loop {
            if self.closed.is_cancelled() || tx.is_closed() {
                break;
            }

            let room = tx.capacity();
            let claimed = if room == 0 {
                Vec::new()
            } else {
                match self.claim(&topic, &group, room).await {
                    Ok(claimed) => claimed,
                    Err(e) => {
                        warn!(topic = %topic, group = %group, error = %e, "Claim failed; backing off");
                        Vec::new()
                    }
                }
            };

            let idle = claimed.is_empty();
            for c in claimed {
                let envelope = match Envelope::from_json(&c.body) {
                    Ok(envelope) => envelope,
                    Err(e) => {
                        // never decodable, so never deliverable; retire it
                        error!(topic = %topic, seq = c.seq, error = %e, "Undecodable message; acking");
                        if let Err(e) = self.settle(&topic, &group, c.seq, "acked").await {
                            warn!(topic = %topic, seq = c.seq, error = %e, "Failed to retire message");
                        }
                        continue;
                    }
                };
                let acker = SqliteAcker {
                    transport: self.clone(),
                    topic: topic.clone(),
                    group: group.clone(),
                    seq: c.seq,
                };
                if tx.send(Delivery::new(envelope, c.attempts, Box::new(acker))).await.is_err() {
                    // subscriber gone; the claim times out and is redelivered
                    break;
                }
            }

            if idle {
                tokio::select! {
                    _ = self.closed.cancelled() => break,
                    _ = tx.closed() => break,
                    _ = tokio::time::sleep(self.config.poll_interval) => {}
                }
            }
        }
        debug!(topic = %topic, group = %group, "Broker poll loop stopped");
    }
}

#[async_trait]
impl Transport for SqliteTransport {
    async fn publish(&self, topic: &str, envelope: &Envelope) -> Result<()> {
        if self.closed.is_cancelled() {
            return Err(PipelineError::transport("broker is closed"));
        }
        let topic = topic.to_string();
        let envelope_id = envelope.id.to_string();
        let body = envelope.to_json()?;
        self.db
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO messages (topic, envelope_id, body, published_at) VALUES (?1, ?2, ?3, ?4)",
                    params![topic, envelope_id, body, Utc::now().timestamp_millis()],
                )?;
                Ok(())
            })
            .await
    }

    async fn subscribe(&self, topic: &str, consumer_group: &str) -> Result<Subscription> {
        if self.closed.is_cancelled() {
            return Err(PipelineError::transport("broker is closed"));
        }
        let (tx, rx) = mpsc::channel(self.config.channel_capacity.max(1));
        tokio::spawn(self.clone().poll_loop(topic.to_string(), consumer_group.to_string(), tx));
        info!(topic = %topic, group = %consumer_group, "Subscribed to broker topic");
        Ok(Subscription::new(topic, consumer_group, rx))
    }

    async fn close(&self) -> Result<()> {
        self.closed.cancel();
        self.db.checkpoint().await
    }
}

struct SqliteAcker {
    transport: SqliteTransport,
    topic: String,
    group: String,
    seq: i64,
}

#[async_trait]
impl Acker for SqliteAcker {
    async fn ack(self: Box<Self>) -> Result<()> {
        self.transport.settle(&self.topic, &self.group, self.seq, "acked").await
    }

    async fn nack(self: Box<Self>) -> Result<()> {
        self.transport.settle(&self.topic, &self.group, self.seq, "ready").await
    }
}
