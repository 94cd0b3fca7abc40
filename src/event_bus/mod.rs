//! Event bus: named-channel pub/sub for CAPTCHA/HITL lifecycle events,
//! backed by a real broadcast channel over a closed event-type set.

use std::collections::HashSet;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast;
use tokio::time::timeout as tokio_timeout;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::StreamExt;

/// Closed CAPTCHA/HITL event taxonomy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    TaskCreated,
    TaskAssigned,
    TaskSolving,
    Solved,
    Failed,
    Unsolvable,
    Expired,
    SessionCached,
    SessionInvalidated,
    HitlRequired,
    TicketStored,
}

/// `{type, payload, timestamp}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    #[serde(rename = "type")]
    pub kind: EventKind,
    pub domain: String,
    pub payload: Value,
    pub timestamp: DateTime<Utc>,
}

impl Event {
    pub fn new(kind: EventKind, domain: impl Into<String>, payload: Value) -> Self {
        Self {
            kind,
            domain: domain.into(),
            payload,
            timestamp: Utc::now(),
        }
    }
}

/// Channel capacity for the underlying broadcast queue. A slow subscriber
/// that falls this far behind drops the oldest events (broadcast semantics);
/// acceptable here since every consumer either polls promptly (`wait_for`)
/// or treats the bus as best-effort notification, never the source of truth
/// (the Ticket Store and Task Manager are).
const CHANNEL_CAPACITY: usize = 1024;

/// A single named channel. Channels are created lazily on first publish or
/// subscribe and live for the process lifetime, mirroring a Redis pub/sub
/// channel's "always there, nobody owns creation" semantics.
pub struct EventBus {
    sender: broadcast::Sender<Event>,
}

impl EventBus {
    pub fn new() -> Self {
        let (sender, _receiver) = broadcast::channel(CHANNEL_CAPACITY);
        Self { sender }
    }

    pub fn publish(&self, event: Event) {
        log::debug!("event_bus: publish {:?} domain={}", event.kind, event.domain);
        // No subscribers is not an error; the event is simply unobserved.
        let _ = self.sender.send(event);
    }

    pub fn publish_kind(&self, kind: EventKind, domain: impl Into<String>, payload: Value) {
        self.publish(Event::new(kind, domain, payload));
    }

    /// Raw subscription: every event published on this bus, unfiltered.
    pub fn subscribe(&self) -> impl tokio_stream::Stream<Item = Result<Event, BroadcastStreamRecvError>> {
        BroadcastStream::new(self.sender.subscribe())
    }

    /// Subscription filtered to one domain and, optionally, a set of event
    /// kinds. Filtering happens client-side over the raw broadcast stream
    /// rather than maintaining a separate channel per filter.
    pub fn subscribe_filtered(
        &self,
        domain: impl Into<String>,
        event_types: Option<HashSet<EventKind>>,
    ) -> impl tokio_stream::Stream<Item = Event> {
        let domain = domain.into();
        BroadcastStream::new(self.sender.subscribe()).filter_map(move |item| match item {
            Ok(event) if event.domain == domain => match &event_types {
                Some(kinds) if !kinds.contains(&event.kind) => None,
                _ => Some(event),
            },
            Ok(_) => None,
            Err(_lagged) => None,
        })
    }

    /// Worker-side rendezvous: block until a matching event arrives on this
    /// domain or `timeout` elapses. Used by `CaptchaTaskManager::wait_for_solution`.
    pub async fn wait_for<F>(&self, domain: impl Into<String>, predicate: F, timeout_duration: Duration) -> Option<Event>
    where
        F: Fn(&Event) -> bool,
    {
        let mut stream = Box::pin(self.subscribe_filtered(domain, None));
        let wait = async {
            while let Some(event) = stream.next().await {
                if predicate(&event) {
                    return Some(event);
                }
            }
            None
        };

        tokio_timeout(timeout_duration, wait).await.unwrap_or(None)
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn subscriber_sees_published_event() {
        let bus = EventBus::new();
        let mut stream = Box::pin(bus.subscribe_filtered("example.com", None));
        bus.publish_kind(EventKind::TaskCreated, "example.com", json!({"task_uuid": "t1"}));

        let event = stream.next().await.expect("event should arrive");
        assert_eq!(event.kind, EventKind::TaskCreated);
        assert_eq!(event.domain, "example.com");
    }

    #[tokio::test]
    async fn filtered_subscription_ignores_other_domains() {
        let bus = EventBus::new();
        let mut stream = Box::pin(bus.subscribe_filtered("a.com", None));
        bus.publish_kind(EventKind::Solved, "b.com", json!({}));
        bus.publish_kind(EventKind::Solved, "a.com", json!({}));

        let event = stream.next().await.expect("event should arrive");
        assert_eq!(event.domain, "a.com");
    }

    #[tokio::test]
    async fn filtered_subscription_honors_event_type_set() {
        let bus = EventBus::new();
        let mut kinds = HashSet::new();
        kinds.insert(EventKind::Solved);
        let mut stream = Box::pin(bus.subscribe_filtered("a.com", Some(kinds)));

        bus.publish_kind(EventKind::TaskCreated, "a.com", json!({}));
        bus.publish_kind(EventKind::Solved, "a.com", json!({}));

        let event = stream.next().await.expect("event should arrive");
        assert_eq!(event.kind, EventKind::Solved);
    }

    #[tokio::test]
    async fn wait_for_returns_none_on_timeout() {
        let bus = EventBus::new();
        let result = bus.wait_for("idle.com", |_| true, Duration::from_millis(20)).await;
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn wait_for_resolves_on_matching_event() {
        let bus = EventBus::new();
        let bus_clone_sender = bus.sender.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(5)).await;
            let _ = bus_clone_sender.send(Event::new(EventKind::Solved, "a.com", json!({})));
        });

        let result = bus
            .wait_for("a.com", |event| event.kind == EventKind::Solved, Duration::from_millis(200))
            .await;
        assert!(result.is_some());
    }
}
