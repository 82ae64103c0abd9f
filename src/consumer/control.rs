//! Consumer loop: receive, process, settle, re-attach on drop.

use std::sync::Arc;
use std::time::{Duration, Instant};

use opentelemetry::KeyValue;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, info, warn};

use super::backoff::Backoff;
use super::processor::{DeliveryContext, Processor};
use crate::error::{Error, Result};
use crate::event::{Envelope, Payload};
use crate::log::{Delivery, EventLog, NackAction, RecordedEvent, Subscription};
use crate::telemetry::delivery::{outcome_label, record_outcome, start_delivery_span};
use crate::telemetry::metrics;

/// Subscription group used when none is configured.
pub const DEFAULT_GROUP: &str = "analytics-group";

/// Configuration for the consumer.
#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    /// Persistent subscription group to attach to.
    pub group: String,
    /// First re-attach delay after a drop.
    pub initial_backoff: Duration,
    /// Ceiling for the re-attach delay.
    pub max_backoff: Duration,
    /// How long an in-flight event may keep processing after shutdown.
    pub drain_timeout: Duration,
    /// First pause before taking a retried event again. Doubles per
    /// consecutive retry, capped at `max_backoff`.
    pub retry_delay: Duration,
    /// Park an event once it has been retried this many times. `None`
    /// leaves the decision to the processor.
    pub max_retries: Option<u32>,
}

impl ConsumerConfig {
    pub fn new(group: impl Into<String>) -> Self {
        Self {
            group: group.into(),
            ..Self::default()
        }
    }
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            group: DEFAULT_GROUP.to_string(),
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(30),
            drain_timeout: Duration::from_secs(10),
            retry_delay: Duration::from_millis(100),
            max_retries: None,
        }
    }
}

/// How a delivery gets settled.
enum Verdict {
    Ack,
    Nack(NackAction, String),
}

/// Long-running consumer of one persistent subscription group.
///
/// Owns its subscription handle exclusively. Decode failures and unknown
/// event types are parked; processor errors are nacked for retry; success
/// is acked.
pub struct Consumer {
    log: Arc<dyn EventLog>,
    config: ConsumerConfig,
    subscription: Box<dyn Subscription>,
}

impl Consumer {
    /// Attach to the configured group. An error here is a startup failure.
    pub async fn start(log: Arc<dyn EventLog>, config: ConsumerConfig) -> Result<Self> {
        let subscription = log.attach_subscription(&config.group).await?;
        info!(group = %config.group, "attached to persistent subscription");
        Ok(Self {
            log,
            config,
            subscription,
        })
    }

    /// Run until `cancel` fires.
    ///
    /// On cancellation the loop stops pulling deliveries, lets an in-flight
    /// processor finish within the drain timeout, and detaches.
    pub async fn run<P: Processor + ?Sized>(mut self, processor: &P, cancel: CancellationToken) {
        let group = self.config.group.clone();
        let mut backoff = Backoff::new(self.config.initial_backoff, self.config.max_backoff);
        let mut retry_backoff = Backoff::new(self.config.retry_delay, self.config.max_backoff);
        info!(%group, "subscription consumer started");

        loop {
            let delivery = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                delivery = self.subscription.recv() => delivery,
            };

            let reason = match delivery {
                Delivery::Event {
                    record,
                    retry_count,
                } => match self.deliver(processor, &record, retry_count, &cancel).await {
                    Ok(Some(NackAction::Retry)) => {
                        let delay = retry_backoff.next_delay();
                        tokio::select! {
                            _ = cancel.cancelled() => break,
                            _ = tokio::time::sleep(delay) => continue,
                        }
                    }
                    Ok(_) => {
                        retry_backoff.reset();
                        continue;
                    }
                    Err(e) => format!("settlement failed: {e}"),
                },
                Delivery::Dropped { reason } => reason,
            };

            warn!(%group, %reason, "subscription dropped");
            match reattach(self.log.as_ref(), &self.config.group, &mut backoff, &cancel).await {
                Some(subscription) => self.subscription = subscription,
                None => break,
            }
        }

        info!(%group, "subscription consumer stopped");
    }

    /// Process one delivery and settle it. Returns the nack action used,
    /// `None` for an ack.
    async fn deliver<P: Processor + ?Sized>(
        &mut self,
        processor: &P,
        record: &RecordedEvent,
        retry_count: u32,
        cancel: &CancellationToken,
    ) -> Result<Option<NackAction>> {
        let span = start_delivery_span(&self.config.group, record, retry_count);
        let verdict = judge(&self.config, processor, record, retry_count, cancel)
            .instrument(span.clone())
            .await;

        let (settled, action) = match verdict {
            Verdict::Ack => (self.subscription.ack(record).await, None),
            Verdict::Nack(action, reason) => (
                self.subscription.nack(record, action, &reason).await,
                Some(action),
            ),
        };

        let outcome = outcome_label(action);
        record_outcome(&span, outcome);
        metrics::deliveries().add(
            1,
            &[
                KeyValue::new("group", self.config.group.clone()),
                KeyValue::new("outcome", outcome),
            ],
        );
        settled.map(|()| action)
    }
}

/// Decide how to settle a delivery: decode, screen, run the processor.
async fn judge<P: Processor + ?Sized>(
    config: &ConsumerConfig,
    processor: &P,
    record: &RecordedEvent,
    retry_count: u32,
    cancel: &CancellationToken,
) -> Verdict {
    let envelope = match serde_json::from_slice::<Envelope>(&record.data) {
        Ok(envelope) => envelope,
        Err(e) => {
            warn!("undecodable event, parking: {e}");
            return Verdict::Nack(NackAction::Park, format!("decode failed: {e}"));
        }
    };
    if let Payload::Unknown { kind, .. } = &envelope.payload {
        warn!(%kind, "unhandled event type, parking");
        return Verdict::Nack(NackAction::Park, format!("unhandled event type {kind}"));
    }

    let delivery = DeliveryContext {
        event_id: record.event_id,
        position: record.position,
        retry_count,
    };
    let started = Instant::now();
    let processing = processor.process(&envelope, &delivery);
    tokio::pin!(processing);
    let result = tokio::select! {
        result = &mut processing => Some(result),
        _ = cancel.cancelled() => {
            info!("shutdown requested, draining in-flight event");
            tokio::time::timeout(config.drain_timeout, &mut processing).await.ok()
        }
    };
    metrics::processing_duration_ms().record(
        started.elapsed().as_secs_f64() * 1000.0,
        &[KeyValue::new("group", config.group.clone())],
    );

    match result {
        Some(Ok(())) => Verdict::Ack,
        Some(Err(Error::Poison(reason))) => {
            warn!(%reason, "processor gave up on event, parking");
            Verdict::Nack(NackAction::Park, format!("processor gave up: {reason}"))
        }
        Some(Err(e)) if config.max_retries.is_some_and(|max| retry_count >= max) => {
            warn!(retry_count, "retries exhausted, parking: {e}");
            Verdict::Nack(NackAction::Park, format!("retries exhausted: {e}"))
        }
        Some(Err(e)) => {
            warn!(retry_count, "processor failed, requesting redelivery: {e}");
            Verdict::Nack(NackAction::Retry, e.to_string())
        }
        None => {
            warn!("drain timeout elapsed, requesting redelivery");
            Verdict::Nack(
                NackAction::Retry,
                "shutdown before processing finished".to_string(),
            )
        }
    }
}

/// Re-attach with backoff until it works or `cancel` fires.
async fn reattach(
    log: &dyn EventLog,
    group: &str,
    backoff: &mut Backoff,
    cancel: &CancellationToken,
) -> Option<Box<dyn Subscription>> {
    loop {
        let delay = backoff.next_delay();
        info!(group, delay_ms = delay.as_millis() as u64, "re-attaching subscription");
        tokio::select! {
            _ = cancel.cancelled() => return None,
            _ = tokio::time::sleep(delay) => {}
        }

        match log.attach_subscription(group).await {
            Ok(subscription) => {
                backoff.reset();
                metrics::subscription_reconnects().add(
                    1,
                    &[
                        KeyValue::new("group", group.to_string()),
                        KeyValue::new("result", "ok"),
                    ],
                );
                info!(group, "subscription re-attached");
                return Some(subscription);
            }
            Err(e) => {
                metrics::subscription_reconnects().add(
                    1,
                    &[
                        KeyValue::new("group", group.to_string()),
                        KeyValue::new("result", "error"),
                    ],
                );
                warn!(group, "re-attach failed: {e}");
            }
        }
    }
}
