//! Shared append-only event stream
//!
//! A small in-process broker with bounded, length-trimmed topics and named
//! consumer groups. Each group keeps a durable cursor: entries delivered to a
//! group stay in its pending list until acknowledged, and a reader created
//! after a crash drains the pending backlog before tailing new entries
//! (at-least-once delivery, FIFO per topic, no cross-topic ordering).
//!
//! Topics are signal channels, not audit logs: once a topic exceeds its
//! maximum length the oldest entries are trimmed. Pending entries keep their
//! own copies, so trimming never loses an unacknowledged delivery.

use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use tokio::sync::Notify;
use tracing::debug;

/// Topic carrying "please schedule this project" wake-up hints
pub const TOPIC_DEPLOYMENT_REQUESTS: &str = "deployment.requests";
/// Topic carrying normalized container lifecycle facts
pub const TOPIC_CONTAINER_LIFECYCLE: &str = "container.lifecycle";
/// Topic carrying project-level lifecycle facts for downstream services
pub const TOPIC_PROJECT_LIFECYCLE: &str = "project.lifecycle";

pub type EntryId = u64;

/// An immutable fact published once onto a topic.
///
/// Payload fields are flat key/value pairs for compatibility with
/// streaming-log field APIs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamEvent {
    pub kind: String,
    pub project_id: String,
    pub deployment_id: String,
    pub request_id: String,
    pub fields: Vec<(String, String)>,
}

impl StreamEvent {
    pub fn new(kind: impl Into<String>, project_id: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            project_id: project_id.into(),
            deployment_id: String::new(),
            request_id: String::new(),
            fields: Vec::new(),
        }
    }

    pub fn with_deployment(mut self, deployment_id: impl Into<String>) -> Self {
        self.deployment_id = deployment_id.into();
        self
    }

    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = request_id.into();
        self
    }

    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.fields.push((key.into(), value.into()));
        self
    }

    pub fn field(&self, key: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }
}

/// One delivered entry: topic-scoped monotonic id plus the event
#[derive(Debug, Clone)]
pub struct StreamEntry {
    pub id: EntryId,
    pub event: StreamEvent,
}

struct Group {
    /// Highest entry id handed to this group
    delivered_up_to: EntryId,
    /// Delivered but not yet acknowledged, in delivery order
    pending: BTreeMap<EntryId, StreamEntry>,
}

struct Topic {
    entries: VecDeque<StreamEntry>,
    next_id: EntryId,
    groups: std::collections::HashMap<String, Group>,
}

struct TopicState {
    inner: Mutex<Topic>,
    notify: Notify,
}

/// The in-process broker; shared by handle across components
pub struct EventStream {
    topics: DashMap<String, Arc<TopicState>>,
    max_len: usize,
}

impl EventStream {
    pub fn new(max_len: usize) -> Self {
        Self {
            topics: DashMap::new(),
            max_len,
        }
    }

    fn topic(&self, name: &str) -> Arc<TopicState> {
        self.topics
            .entry(name.to_string())
            .or_insert_with(|| {
                Arc::new(TopicState {
                    inner: Mutex::new(Topic {
                        entries: VecDeque::new(),
                        next_id: 1,
                        groups: std::collections::HashMap::new(),
                    }),
                    notify: Notify::new(),
                })
            })
            .clone()
    }

    /// Append an event, trimming the topic to its maximum length
    pub fn publish(&self, topic_name: &str, event: StreamEvent) -> EntryId {
        let state = self.topic(topic_name);
        let id = {
            let mut topic = state.inner.lock();
            let id = topic.next_id;
            topic.next_id += 1;
            topic.entries.push_back(StreamEntry {
                id,
                event: event.clone(),
            });
            while topic.entries.len() > self.max_len {
                topic.entries.pop_front();
            }
            id
        };
        debug!(topic = topic_name, id, kind = %event.kind, "Event published");
        state.notify.notify_waiters();
        id
    }

    /// Acknowledge an entry for a consumer group; acknowledged entries are
    /// never redelivered
    pub fn ack(&self, topic_name: &str, group_name: &str, id: EntryId) {
        let state = self.topic(topic_name);
        let mut topic = state.inner.lock();
        if let Some(group) = topic.groups.get_mut(group_name) {
            group.pending.remove(&id);
        }
    }

    /// Number of delivered-but-unacknowledged entries for a group
    pub fn pending_count(&self, topic_name: &str, group_name: &str) -> usize {
        let state = self.topic(topic_name);
        let topic = state.inner.lock();
        topic
            .groups
            .get(group_name)
            .map(|g| g.pending.len())
            .unwrap_or(0)
    }

    /// Current topic length (after trimming)
    pub fn len(&self, topic_name: &str) -> usize {
        let state = self.topic(topic_name);
        let len = state.inner.lock().entries.len();
        len
    }

    /// Create a reader for a consumer group.
    ///
    /// The reader first drains the group's pending backlog (crash recovery),
    /// then tails new entries.
    pub fn reader(self: &Arc<Self>, topic_name: &str, group_name: &str) -> GroupReader {
        let state = self.topic(topic_name);
        let backlog = {
            let mut topic = state.inner.lock();
            let group = topic
                .groups
                .entry(group_name.to_string())
                .or_insert_with(|| Group {
                    delivered_up_to: 0,
                    pending: BTreeMap::new(),
                });
            group.pending.values().cloned().collect::<VecDeque<_>>()
        };
        GroupReader {
            state,
            group_name: group_name.to_string(),
            backlog,
        }
    }
}

/// A consumer-group cursor over one topic
pub struct GroupReader {
    state: Arc<TopicState>,
    group_name: String,
    backlog: VecDeque<StreamEntry>,
}

impl GroupReader {
    /// Next entry for this group: previously-unacknowledged backlog first,
    /// then new entries, blocking until one arrives
    pub async fn next(&mut self) -> StreamEntry {
        if let Some(entry) = self.backlog.pop_front() {
            return entry;
        }
        loop {
            let notified = self.state.notify.notified();
            if let Some(entry) = self.try_deliver() {
                return entry;
            }
            notified.await;
        }
    }

    fn try_deliver(&self) -> Option<StreamEntry> {
        let mut topic = self.state.inner.lock();
        let delivered_up_to = topic
            .groups
            .get(&self.group_name)
            .map(|g| g.delivered_up_to)
            .unwrap_or(0);
        let entry = topic
            .entries
            .iter()
            .find(|e| e.id > delivered_up_to)
            .cloned()?;
        let group = topic
            .groups
            .entry(self.group_name.clone())
            .or_insert_with(|| Group {
                delivered_up_to: 0,
                pending: BTreeMap::new(),
            });
        group.delivered_up_to = entry.id;
        group.pending.insert(entry.id, entry.clone());
        Some(entry)
    }

    /// Acknowledge a processed entry
    pub fn ack(&self, id: EntryId) {
        let mut topic = self.state.inner.lock();
        if let Some(group) = topic.groups.get_mut(&self.group_name) {
            group.pending.remove(&id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn event(kind: &str, n: u32) -> StreamEvent {
        StreamEvent::new(kind, format!("proj-{}", n)).with_deployment(format!("dep-{}", n))
    }

    #[tokio::test]
    async fn test_publish_and_read_in_order() {
        let stream = Arc::new(EventStream::new(100));
        stream.publish("t", event("A", 1));
        stream.publish("t", event("B", 2));

        let mut reader = stream.reader("t", "g");
        let first = reader.next().await;
        let second = reader.next().await;
        assert_eq!(first.event.kind, "A");
        assert_eq!(second.event.kind, "B");
        assert!(first.id < second.id);
    }

    #[tokio::test]
    async fn test_acked_entries_not_redelivered() {
        let stream = Arc::new(EventStream::new(100));
        stream.publish("t", event("A", 1));
        stream.publish("t", event("B", 2));

        let mut reader = stream.reader("t", "g");
        let first = reader.next().await;
        reader.ack(first.id);
        drop(reader);

        // Simulated restart: only the unacked entry comes back
        let mut reader = stream.reader("t", "g");
        let redelivered = reader.next().await;
        assert_eq!(redelivered.event.kind, "B");
        assert_eq!(stream.pending_count("t", "g"), 1);
    }

    #[tokio::test]
    async fn test_unacked_redelivered_once_on_restart() {
        let stream = Arc::new(EventStream::new(100));
        stream.publish("t", event("A", 1));

        let mut reader = stream.reader("t", "g");
        let delivered = reader.next().await;
        // Crash before ack
        drop(reader);

        let mut reader = stream.reader("t", "g");
        let redelivered = reader.next().await;
        assert_eq!(redelivered.id, delivered.id);
        reader.ack(redelivered.id);

        drop(reader);
        let reader = stream.reader("t", "g");
        assert!(reader.backlog.is_empty());
        assert_eq!(stream.pending_count("t", "g"), 0);
    }

    #[tokio::test]
    async fn test_blocking_read_wakes_on_publish() {
        let stream = Arc::new(EventStream::new(100));
        let mut reader = stream.reader("t", "g");

        let publisher = Arc::clone(&stream);
        let handle = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            publisher.publish("t", event("late", 1));
        });

        let entry = tokio::time::timeout(Duration::from_secs(2), reader.next())
            .await
            .expect("reader should wake on publish");
        assert_eq!(entry.event.kind, "late");
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_topic_trimmed_to_max_len() {
        let stream = Arc::new(EventStream::new(3));
        for n in 0..10 {
            stream.publish("t", event("E", n));
        }
        assert_eq!(stream.len("t"), 3);

        // A new group only sees what survived trimming
        let mut reader = stream.reader("t", "g");
        let first = reader.next().await;
        assert_eq!(first.event.project_id, "proj-7");
    }

    #[tokio::test]
    async fn test_independent_groups() {
        let stream = Arc::new(EventStream::new(100));
        stream.publish("t", event("A", 1));

        let mut g1 = stream.reader("t", "group-1");
        let mut g2 = stream.reader("t", "group-2");
        let e1 = g1.next().await;
        let e2 = g2.next().await;
        assert_eq!(e1.id, e2.id);

        g1.ack(e1.id);
        assert_eq!(stream.pending_count("t", "group-1"), 0);
        assert_eq!(stream.pending_count("t", "group-2"), 1);
    }

    #[test]
    fn test_event_fields() {
        let event = StreamEvent::new("DEPLOYMENT_REQUESTED", "proj-1")
            .with_deployment("dep-1")
            .with_request_id("req-9")
            .with_field("domain", "app.example.com");
        assert_eq!(event.field("domain"), Some("app.example.com"));
        assert_eq!(event.field("missing"), None);
        assert_eq!(event.request_id, "req-9");
    }
}
