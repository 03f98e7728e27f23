//! Dispatch router: binds named handlers to event kinds and transport
//! subscriptions.
//!
//! Every handler invocation is wrapped, outermost first, in panic recovery,
//! retry with exponential backoff, and dead-letter forwarding. A delivery is
//! acked when its handler succeeds, when it was dead-lettered, or when it
//! carries an event kind the handler does not accept. It is nacked when the
//! run is cancelled mid-handler or when the dead-letter publish itself fails.

use async_trait::async_trait;
use futures_util::FutureExt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use crate::constants::*;
use crate::context::Ctx;
use crate::envelope::{self, Envelope, EventKind};
use crate::error::{PipelineError, Result};
use crate::observability;
use crate::transport::{Delivery, Subscription, Transport};

/// A handler sees one envelope. `Ok` acks; `Err` triggers a retry.
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, ctx: &Ctx, envelope: &Envelope) -> Result<()>;
}

/// Adapts an async closure into an [`EventHandler`].
pub struct FnHandler<F>(F);

#[async_trait]
impl<F, Fut> EventHandler for FnHandler<F>
where
    F: Fn(Ctx, Envelope) -> Fut + Send + Sync,
    Fut: Future<Output = Result<()>> + Send,
{
    async fn handle(&self, ctx: &Ctx, envelope: &Envelope) -> Result<()> {
        (self.0)(ctx.clone(), envelope.clone()).await
    }
}

pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn EventHandler>
where
    F: Fn(Ctx, Envelope) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    Arc::new(FnHandler(f))
}

#[derive(Debug, Clone)]
pub struct RouterConfig {
    /// Total handler invocations per delivery, first one included
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub backoff_multiplier: f64,
    pub poison_topic: String,
    /// How long in-flight handlers may keep running after shutdown is requested
    pub shutdown_grace: Duration,
    /// Concurrent deliveries per handler registration
    pub max_in_flight: usize,
}

impl RouterConfig {
    pub fn for_namespace(namespace: &str) -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            initial_backoff: Duration::from_millis(DEFAULT_INITIAL_BACKOFF_MS),
            backoff_multiplier: DEFAULT_BACKOFF_MULTIPLIER,
            poison_topic: envelope::poison_topic(namespace),
            shutdown_grace: Duration::from_secs(DEFAULT_SHUTDOWN_GRACE_SECS),
            max_in_flight: DEFAULT_MAX_IN_FLIGHT,
        }
    }
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self::for_namespace(DEFAULT_NAMESPACE)
    }
}

struct Registration {
    name: String,
    kind: EventKind,
    topic: String,
    consumer_group: String,
    handler: Arc<dyn EventHandler>,
}

struct Shared {
    transport: Arc<dyn Transport>,
    config: RouterConfig,
    /// Parent of every handler context; cancelled once the grace period runs out
    abort: CancellationToken,
}

/// How a delivery ended, as recorded in metrics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Settlement {
    Acked,
    Nacked,
    DeadLettered,
    Skipped,
}

impl Settlement {
    fn as_str(&self) -> &'static str {
        match self {
            Settlement::Acked => "acked",
            Settlement::Nacked => "nacked",
            Settlement::DeadLettered => "dead_lettered",
            Settlement::Skipped => "skipped",
        }
    }
}

pub struct Router {
    transport: Arc<dyn Transport>,
    config: RouterConfig,
    registrations: Vec<Arc<Registration>>,
}

impl Router {
    pub fn new(transport: Arc<dyn Transport>, config: RouterConfig) -> Self {
        Self {
            transport,
            config,
            registrations: Vec::new(),
        }
    }

    pub fn add_handler(
        &mut self,
        name: &str,
        kind: EventKind,
        topic: &str,
        consumer_group: &str,
        handler: Arc<dyn EventHandler>,
    ) -> &mut Self {
        self.registrations.push(Arc::new(Registration {
            name: name.to_string(),
            kind,
            topic: topic.to_string(),
            consumer_group: consumer_group.to_string(),
            handler,
        }));
        self
    }

    pub fn handler_names(&self) -> Vec<&str> {
        self.registrations.iter().map(|r| r.name.as_str()).collect()
    }

    pub fn config(&self) -> &RouterConfig {
        &self.config
    }

    /// Consume until `shutdown` fires or every subscription ends.
    ///
    /// On shutdown no new deliveries are taken; in-flight handlers get the
    /// configured grace period, after which their contexts are cancelled.
    pub async fn run(self, shutdown: CancellationToken) -> Result<()> {
        if self.registrations.is_empty() {
            return Err(PipelineError::Config("router has no handlers".to_string()));
        }

        let mut subscriptions = Vec::with_capacity(self.registrations.len());
        for reg in &self.registrations {
            let sub = self.transport.subscribe(&reg.topic, &reg.consumer_group).await?;
            info!(
                handler = %reg.name,
                topic = %reg.topic,
                group = %reg.consumer_group,
                "Handler subscribed"
            );
            subscriptions.push((Arc::clone(reg), sub));
        }

        let shared = Arc::new(Shared {
            transport: Arc::clone(&self.transport),
            config: self.config,
            abort: CancellationToken::new(),
        });
        let tracker = TaskTracker::new();

        let loops: Vec<_> = subscriptions
            .into_iter()
            .map(|(reg, sub)| {
                tokio::spawn(consume(
                    Arc::clone(&shared),
                    reg,
                    sub,
                    tracker.clone(),
                    shutdown.clone(),
                ))
            })
            .collect();

        tokio::select! {
            _ = shutdown.cancelled() => info!("Router shutdown requested"),
            _ = futures_util::future::join_all(loops) => info!("All router subscriptions ended"),
        }

        tracker.close();
        let grace = shared.config.shutdown_grace;
        if tokio::time::timeout(grace, tracker.wait()).await.is_err() {
            warn!(
                in_flight = tracker.len(),
                "Grace period of {:?} exceeded; cancelling in-flight handlers", grace
            );
            shared.abort.cancel();
            tracker.wait().await;
        }
        info!("Router stopped");
        Ok(())
    }
}

async fn consume(
    shared: Arc<Shared>,
    reg: Arc<Registration>,
    mut sub: Subscription,
    tracker: TaskTracker,
    shutdown: CancellationToken,
) {
    let permits = Arc::new(Semaphore::new(shared.config.max_in_flight.max(1)));
    loop {
        let permit = tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            permit = Arc::clone(&permits).acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => break,
            },
        };
        let delivery = tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            delivery = sub.next() => match delivery {
                Some(delivery) => delivery,
                None => {
                    debug!(handler = %reg.name, "Subscription closed");
                    break;
                }
            },
        };
        let shared = Arc::clone(&shared);
        let reg = Arc::clone(&reg);
        tracker.spawn(async move {
            process_delivery(&shared, &reg, delivery).await;
            drop(permit);
        });
    }
}

async fn process_delivery(shared: &Shared, reg: &Registration, delivery: Delivery) {
    let started = Instant::now();
    let ctx = Ctx::new(shared.abort.child_token());
    let envelope = delivery.envelope.clone();

    if envelope.kind() != Some(reg.kind) {
        warn!(
            handler = %reg.name,
            event_type = %envelope.event_type,
            envelope_id = %envelope.id,
            "Envelope kind does not match handler; skipping"
        );
        settle(reg, delivery, Settlement::Skipped, started).await;
        return;
    }

    let settlement = match invoke_with_retry(shared, reg, &ctx, &envelope).await {
        Ok(()) => Settlement::Acked,
        Err(e) if e.is_cancelled() => {
            warn!(handler = %reg.name, envelope_id = %envelope.id, "Handler cancelled; returning envelope");
            Settlement::Nacked
        }
        Err(e) => {
            error!(
                handler = %reg.name,
                event_type = %envelope.event_type,
                envelope_id = %envelope.id,
                delivery_count = delivery.delivery_count,
                error = %e,
                "Retries exhausted; dead-lettering envelope"
            );
            match shared.transport.publish(&shared.config.poison_topic, &envelope).await {
                Ok(()) => {
                    observability::record_dead_letter(&reg.name);
                    Settlement::DeadLettered
                }
                Err(publish_err) => {
                    error!(
                        handler = %reg.name,
                        envelope_id = %envelope.id,
                        poison_topic = %shared.config.poison_topic,
                        error = %publish_err,
                        "Dead-letter publish failed; returning envelope"
                    );
                    Settlement::Nacked
                }
            }
        }
    };
    settle(reg, delivery, settlement, started).await;
}

async fn settle(reg: &Registration, delivery: Delivery, settlement: Settlement, started: Instant) {
    let envelope_id = delivery.envelope.id;
    let res = match settlement {
        Settlement::Nacked => delivery.nack().await,
        _ => delivery.ack().await,
    };
    if let Err(e) = res {
        warn!(handler = %reg.name, envelope_id = %envelope_id, error = %e, "Failed to settle delivery");
    }
    observability::record_delivery(&reg.name, settlement.as_str(), started.elapsed());
}

async fn invoke_with_retry(shared: &Shared, reg: &Registration, ctx: &Ctx, envelope: &Envelope) -> Result<()> {
    let max_attempts = shared.config.max_attempts.max(1);
    let mut backoff = shared.config.initial_backoff;
    let mut attempt = 1;
    loop {
        match invoke_once(reg, ctx, envelope).await {
            Ok(()) => return Ok(()),
            Err(e) if e.is_cancelled() || attempt >= max_attempts => return Err(e),
            Err(e) => {
                warn!(
                    handler = %reg.name,
                    envelope_id = %envelope.id,
                    attempt,
                    max_attempts,
                    error = %e,
                    "Handler failed; retrying in {:?}", backoff
                );
                observability::record_retry(&reg.name);
                ctx.run(async {
                    tokio::time::sleep(backoff).await;
                    Ok::<(), PipelineError>(())
                })
                .await?;
                backoff = backoff.mul_f64(shared.config.backoff_multiplier);
                attempt += 1;
            }
        }
    }
}

async fn invoke_once(reg: &Registration, ctx: &Ctx, envelope: &Envelope) -> Result<()> {
    match AssertUnwindSafe(reg.handler.handle(ctx, envelope)).catch_unwind().await {
        Ok(res) => res,
        Err(panic) => {
            let message = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "non-string panic payload".to_string());
            error!(handler = %reg.name, envelope_id = %envelope.id, "Handler panicked: {}", message);
            Err(PipelineError::HandlerPanicked(message))
        }
    }
}

/// Outcome of a dead-letter replay pass.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReplayReport {
    pub replayed: usize,
    /// Envelopes whose type maps to no known topic; nacked back onto the poison topic
    pub unroutable: usize,
}

/// Republish dead-lettered envelopes, unchanged, to their original topic.
///
/// Topics share the envelope type name, so the type is the route back. The
/// pass ends once the poison topic stays quiet for `idle`. Unroutable
/// envelopes are held until then and nacked after the subscription is
/// dropped, so they wait on the poison topic for the next pass on either
/// transport.
pub async fn replay_dead_letters(
    ctx: &Ctx,
    transport: &dyn Transport,
    poison_topic: &str,
    idle: Duration,
) -> Result<ReplayReport> {
    let mut sub = transport.subscribe(poison_topic, DEAD_LETTER_REPLAY_GROUP).await?;
    let mut report = ReplayReport::default();
    let mut held = Vec::new();
    let outcome = replay_pass(ctx, transport, &mut sub, idle, &mut report, &mut held).await;

    drop(sub);
    for delivery in held {
        delivery.nack().await?;
    }
    outcome?;
    info!(replayed = report.replayed, unroutable = report.unroutable, "Dead-letter replay finished");
    Ok(report)
}

async fn replay_pass(
    ctx: &Ctx,
    transport: &dyn Transport,
    sub: &mut Subscription,
    idle: Duration,
    report: &mut ReplayReport,
    held: &mut Vec<Delivery>,
) -> Result<()> {
    loop {
        let waited = ctx
            .run(async { Ok::<_, PipelineError>(tokio::time::timeout(idle, sub.next()).await) })
            .await?;
        let delivery = match waited {
            Ok(Some(delivery)) => delivery,
            Ok(None) | Err(_) => return Ok(()),
        };
        let envelope = delivery.envelope.clone();
        if envelope.kind().is_none() {
            warn!(envelope_id = %envelope.id, event_type = %envelope.event_type, "Unroutable dead letter");
            report.unroutable += 1;
            held.push(delivery);
            continue;
        }
        match ctx.run(transport.publish(&envelope.event_type, &envelope)).await {
            Ok(()) => {
                delivery.ack().await?;
                info!(envelope_id = %envelope.id, topic = %envelope.event_type, "Replayed dead letter");
                report.replayed += 1;
            }
            Err(e) => {
                delivery.nack().await?;
                return Err(e);
            }
        }
    }
}
