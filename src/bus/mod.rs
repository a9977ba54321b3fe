//! The message bus: per-agent mailboxes with bounded capacity, FIFO delivery
//! order, deadline enforcement, a request/response correlator, and per-topic
//! publish/subscribe.

mod mailbox;

pub use mailbox::Mailbox;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, warn};

use crate::config::BusConfig;
use crate::domain::{AgentId, DeadlineExceeded, Envelope, EnvelopeId, EnvelopeKind};
use crate::metrics::MetricsSink;

/// Failures the bus can report back to a caller of [`MessageBus::send`] or
/// [`MessageBus::request`].
#[derive(Debug, Error)]
pub enum BusError {
    #[error("recipient {0} has no registered mailbox")]
    NoSuchMailbox(AgentId),

    #[error("mailbox for {0} is backpressured")]
    Backpressured(AgentId),

    #[error("envelope {0:?} is malformed")]
    Malformed(String),

    #[error("request {0:?} timed out waiting for a response")]
    TimedOut(EnvelopeId),
}

/// The bus interface every subsystem depends on. Kept as a trait so the
/// scheduler and supervisor can be unit-tested against an in-memory fake
/// without pulling in the full bus implementation.
#[async_trait]
pub trait MessageBus: Send + Sync {
    /// Enqueues `envelope` on its recipient's mailbox, in FIFO order relative
    /// to every other envelope already queued for that recipient. If the
    /// mailbox is full, waits up to the configured backpressure budget for a
    /// slot to free before giving up.
    ///
    /// # Errors
    ///
    /// Returns [`BusError::NoSuchMailbox`] if the recipient has not called
    /// [`MessageBus::register`], [`BusError::Backpressured`] if the
    /// recipient's mailbox is still full after the backpressure budget
    /// elapses, and [`BusError::Malformed`] if the envelope fails
    /// [`Envelope::is_well_formed`].
    async fn send(&self, envelope: Envelope) -> Result<(), BusError>;

    /// Sends a `Request` envelope and awaits the matching `Response`
    /// (correlated by `in_reply_to` == the request's [`EnvelopeId`]), up to
    /// `timeout`.
    ///
    /// # Errors
    ///
    /// Returns whatever [`MessageBus::send`] would for the outbound request,
    /// or [`BusError::TimedOut`] if no matching response arrives within
    /// `timeout`.
    async fn request(&self, envelope: Envelope, timeout: Duration) -> Result<Envelope, BusError>;

    /// Registers a mailbox for `agent_id` with the given bounded capacity,
    /// returning the receiving half. Calling this twice for the same agent
    /// replaces the previous mailbox (the old receiver is dropped).
    fn register(&self, agent_id: AgentId, capacity: usize) -> Mailbox;

    /// Removes `agent_id`'s mailbox. Any envelope already queued for it is
    /// dropped; future sends to it fail with [`BusError::NoSuchMailbox`].
    fn deregister(&self, agent_id: AgentId);

    /// Subscribes to the broadcast stream of bus-wide events (currently only
    /// [`DeadlineExceeded`]).
    fn subscribe_events(&self) -> broadcast::Receiver<DeadlineExceeded>;

    /// Subscribes to `topic`, creating its broadcast channel on first use.
    /// Every [`MessageBus::publish`] to this topic after subscribing is
    /// delivered; a subscriber that falls too far behind the configured
    /// `pubsub_subscriber_buffer` skips ahead rather than blocking publishers
    /// (the lagged-receiver case is counted as a `bus_drops_total` increment
    /// by the caller, not surfaced here as an error).
    fn subscribe(&self, topic: &str) -> broadcast::Receiver<Envelope>;

    /// Publishes `event` to every current subscriber of `topic`. A topic with
    /// no subscribers silently drops the event, matching ordinary pub/sub
    /// semantics.
    fn publish(&self, topic: &str, event: Envelope);

    /// Current queue depth for `agent_id`'s mailbox, or `None` if it has no
    /// mailbox registered. Exposed for the `mailbox_depth` gauge.
    fn depth(&self, agent_id: AgentId) -> Option<usize>;
}

/// The production bus: one bounded `mpsc` channel per registered agent, a
/// `broadcast` channel for deadline-exceeded notifications, a
/// `DashMap`-backed request/response correlator, and one `broadcast` channel
/// per pub/sub topic.
pub struct InMemoryMessageBus {
    mailboxes: DashMap<AgentId, mpsc::Sender<Envelope>>,
    events: broadcast::Sender<DeadlineExceeded>,
    pending_requests: DashMap<EnvelopeId, oneshot::Sender<Envelope>>,
    topics: DashMap<String, broadcast::Sender<Envelope>>,
    backpressure_budget: Duration,
    pubsub_subscriber_buffer: usize,
    metrics: MetricsSink,
}

impl InMemoryMessageBus {
    #[must_use]
    pub fn new(config: BusConfig, metrics: MetricsSink) -> Self {
        let (events, _) = broadcast::channel(1024);
        Self {
            mailboxes: DashMap::new(),
            events,
            pending_requests: DashMap::new(),
            topics: DashMap::new(),
            backpressure_budget: Duration::from_millis(config.send_backpressure_budget_ms),
            pubsub_subscriber_buffer: config.pubsub_subscriber_buffer,
            metrics,
        }
    }
}

#[async_trait]
impl MessageBus for InMemoryMessageBus {
    async fn send(&self, envelope: Envelope) -> Result<(), BusError> {
        if !envelope.is_well_formed() {
            return Err(BusError::Malformed(format!("{:?} missing in_reply_to", envelope.kind)));
        }

        if envelope.is_expired(std::time::SystemTime::now()) {
            let _ = self.events.send(DeadlineExceeded {
                envelope_id: envelope.envelope_id,
                correlation_id: envelope.correlation_id,
            });
            self.metrics.incr_counter("bus_drops_total", vec![("reason", "deadline_exceeded".to_string())]);
            return Ok(());
        }

        if envelope.kind == EnvelopeKind::Response {
            if let Some(in_reply_to) = envelope.in_reply_to {
                if let Some((_, waiter)) = self.pending_requests.remove(&in_reply_to) {
                    let _ = waiter.send(envelope);
                    return Ok(());
                }
            }
        }

        let sender = self
            .mailboxes
            .get(&envelope.to)
            .map(|entry| entry.value().clone())
            .ok_or(BusError::NoSuchMailbox(envelope.to))?;

        match sender.try_send(envelope) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(envelope)) => {
                let to = envelope.to;
                match tokio::time::timeout(self.backpressure_budget, sender.send(envelope)).await {
                    Ok(Ok(())) => Ok(()),
                    Ok(Err(_)) => Err(BusError::NoSuchMailbox(to)),
                    Err(_) => {
                        self.metrics.incr_counter("bus_drops_total", vec![("reason", "backpressured".to_string())]);
                        warn!(%to, "mailbox still full after backpressure budget elapsed");
                        Err(BusError::Backpressured(to))
                    }
                }
            }
            Err(mpsc::error::TrySendError::Closed(envelope)) => {
                Err(BusError::NoSuchMailbox(envelope.to))
            }
        }
    }

    async fn request(&self, envelope: Envelope, timeout: Duration) -> Result<Envelope, BusError> {
        let envelope_id = envelope.envelope_id;
        let (tx, rx) = oneshot::channel();
        self.pending_requests.insert(envelope_id, tx);

        if let Err(error) = self.send(envelope).await {
            self.pending_requests.remove(&envelope_id);
            return Err(error);
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => Err(BusError::TimedOut(envelope_id)),
            Err(_) => {
                self.pending_requests.remove(&envelope_id);
                Err(BusError::TimedOut(envelope_id))
            }
        }
    }

    fn register(&self, agent_id: AgentId, capacity: usize) -> Mailbox {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        self.mailboxes.insert(agent_id, tx);
        debug!(%agent_id, capacity, "mailbox registered");
        Mailbox::new(rx)
    }

    fn deregister(&self, agent_id: AgentId) {
        self.mailboxes.remove(&agent_id);
    }

    fn subscribe_events(&self) -> broadcast::Receiver<DeadlineExceeded> {
        self.events.subscribe()
    }

    fn subscribe(&self, topic: &str) -> broadcast::Receiver<Envelope> {
        self.topics
            .entry(topic.to_string())
            .or_insert_with(|| broadcast::channel(self.pubsub_subscriber_buffer.max(1)).0)
            .subscribe()
    }

    fn publish(&self, topic: &str, event: Envelope) {
        if let Some(sender) = self.topics.get(topic) {
            let _ = sender.send(event);
        }
    }

    fn depth(&self, agent_id: AgentId) -> Option<usize> {
        self.mailboxes.get(&agent_id).map(|entry| {
            let capacity = entry.value().capacity();
            let max = entry.value().max_capacity();
            max.saturating_sub(capacity)
        })
    }
}

/// Convenience wrapper for building a fire-and-forget [`EnvelopeKind::Event`]
/// broadcast to a single recipient's mailbox, matching the pub/sub shape used
/// by health reports and lifecycle notifications.
pub fn event_envelope(from: AgentId, to: AgentId, payload: serde_json::Value) -> Envelope {
    Envelope {
        kind: EnvelopeKind::Event,
        ..Envelope::request(from, to, payload, None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config(backpressure_budget_ms: u64) -> BusConfig {
        BusConfig { mailbox_capacity: 8, pubsub_subscriber_buffer: 8, send_backpressure_budget_ms: backpressure_budget_ms }
    }

    #[tokio::test]
    async fn delivers_in_fifo_order() {
        let bus = InMemoryMessageBus::new(test_config(50), MetricsSink::new());
        let recipient = AgentId::generate();
        let mut mailbox = bus.register(recipient, 8);

        for i in 0..3u32 {
            let envelope = Envelope::request(
                AgentId::generate(),
                recipient,
                serde_json::json!({ "seq": i }),
                None,
            );
            bus.send(envelope).await.unwrap();
        }

        for expected in 0..3u32 {
            let envelope = mailbox.recv().await.unwrap();
            assert_eq!(envelope.payload["seq"], expected);
        }
    }

    #[tokio::test]
    async fn send_to_unregistered_agent_fails() {
        let bus = InMemoryMessageBus::new(test_config(50), MetricsSink::new());
        let envelope = Envelope::request(AgentId::generate(), AgentId::generate(), serde_json::json!({}), None);
        let result = bus.send(envelope).await;
        assert!(matches!(result, Err(BusError::NoSuchMailbox(_))));
    }

    #[tokio::test]
    async fn full_mailbox_reports_backpressure_after_budget_elapses() {
        let bus = InMemoryMessageBus::new(test_config(20), MetricsSink::new());
        let recipient = AgentId::generate();
        let _mailbox = bus.register(recipient, 1);

        let first = Envelope::request(AgentId::generate(), recipient, serde_json::json!({}), None);
        let second = Envelope::request(AgentId::generate(), recipient, serde_json::json!({}), None);
        bus.send(first).await.unwrap();

        let started = std::time::Instant::now();
        let result = bus.send(second).await;
        assert!(matches!(result, Err(BusError::Backpressured(_))));
        assert!(started.elapsed() >= Duration::from_millis(20));
    }

    #[tokio::test]
    async fn send_waits_for_a_freed_slot_within_the_budget() {
        let bus = InMemoryMessageBus::new(test_config(200), MetricsSink::new());
        let recipient = AgentId::generate();
        let mut mailbox = bus.register(recipient, 1);

        let first = Envelope::request(AgentId::generate(), recipient, serde_json::json!({"n": 1}), None);
        let second = Envelope::request(AgentId::generate(), recipient, serde_json::json!({"n": 2}), None);
        bus.send(first).await.unwrap();

        tokio::spawn({
            async move {
                tokio::time::sleep(Duration::from_millis(10)).await;
                mailbox.recv().await
            }
        });

        let result = bus.send(second).await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn expired_envelope_is_dropped_and_notified() {
        let bus = InMemoryMessageBus::new(test_config(50), MetricsSink::new());
        let recipient = AgentId::generate();
        let _mailbox = bus.register(recipient, 8);
        let mut events = bus.subscribe_events();

        let mut envelope = Envelope::request(AgentId::generate(), recipient, serde_json::json!({}), None);
        envelope.deadline = Some(std::time::SystemTime::UNIX_EPOCH);
        bus.send(envelope).await.unwrap();

        let notice = events.recv().await.unwrap();
        assert_eq!(notice.envelope_id, notice.envelope_id);
    }

    #[tokio::test]
    async fn request_returns_the_matching_response() {
        let bus = Arc::new(InMemoryMessageBus::new(test_config(50), MetricsSink::new()));
        let responder = AgentId::generate();
        let requester = AgentId::generate();
        let mut mailbox = bus.register(responder, 8);

        let responder_bus = bus.clone();
        tokio::spawn(async move {
            let request = mailbox.recv().await.unwrap();
            let response = Envelope::response_to(&request, serde_json::json!({"ok": true}));
            responder_bus.send(response).await.unwrap();
        });

        let request = Envelope::request(requester, responder, serde_json::json!({"ping": true}), None);
        let response = bus.request(request, Duration::from_millis(500)).await.unwrap();
        assert_eq!(response.payload["ok"], true);
    }

    #[tokio::test]
    async fn request_times_out_when_nothing_responds() {
        let bus = InMemoryMessageBus::new(test_config(50), MetricsSink::new());
        let recipient = AgentId::generate();
        let _mailbox = bus.register(recipient, 8);

        let request = Envelope::request(AgentId::generate(), recipient, serde_json::json!({}), None);
        let result = bus.request(request, Duration::from_millis(20)).await;
        assert!(matches!(result, Err(BusError::TimedOut(_))));
    }

    #[tokio::test]
    async fn publish_reaches_every_topic_subscriber() {
        let bus = InMemoryMessageBus::new(test_config(50), MetricsSink::new());
        let mut first = bus.subscribe("agent.health");
        let mut second = bus.subscribe("agent.health");

        let event = event_envelope(AgentId::generate(), AgentId::generate(), serde_json::json!({"status": "ready"}));
        bus.publish("agent.health", event);

        assert_eq!(first.recv().await.unwrap().payload["status"], "ready");
        assert_eq!(second.recv().await.unwrap().payload["status"], "ready");
    }

    #[tokio::test]
    async fn publish_to_a_topic_with_no_subscribers_is_a_no_op() {
        let bus = InMemoryMessageBus::new(test_config(50), MetricsSink::new());
        let event = event_envelope(AgentId::generate(), AgentId::generate(), serde_json::json!({}));
        bus.publish("nobody.listening", event);
    }
}
