//! Wake-up event publisher
//!
//! When the edge finds a dynamic project's upstream dead it asks for the
//! project to be scheduled by publishing a "deployment requested" hint onto
//! the shared stream. The per-route cache flag guarantees at most one event
//! per cold period; losers of the flag race get a no-op outcome. Downstream
//! consumers must treat duplicates as idempotent anyway.

use crate::cache::{ProjectRoute, RoutingCache};
use crate::stream::{EntryId, EventStream, StreamEvent, TOPIC_DEPLOYMENT_REQUESTS};
use std::sync::Arc;
use tracing::{debug, info};

/// Event kind published for a cold dynamic project
pub const KIND_DEPLOYMENT_REQUESTED: &str = "DEPLOYMENT_REQUESTED";

/// Outcome of a wake-up publish attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WakeupOutcome {
    /// First request this cold period; event published
    Published(EntryId),
    /// A wake-up is already pending for this route
    AlreadyRequested,
}

pub struct WakeupPublisher {
    stream: Arc<EventStream>,
    cache: Arc<RoutingCache>,
}

impl WakeupPublisher {
    pub fn new(stream: Arc<EventStream>, cache: Arc<RoutingCache>) -> Self {
        Self { stream, cache }
    }

    /// Publish at most one deployment-requested event per cold period
    pub fn publish(&self, route: &ProjectRoute, request_id: &str) -> WakeupOutcome {
        if !self.cache.mark_deployment_requested(&route.domain) {
            debug!(
                domain = %route.domain,
                project_id = %route.project_id,
                "Wake-up already requested this cold period"
            );
            return WakeupOutcome::AlreadyRequested;
        }

        let event = StreamEvent::new(KIND_DEPLOYMENT_REQUESTED, route.project_id.clone())
            .with_request_id(request_id)
            .with_field("domain", route.domain.clone())
            .with_field("project_type", route.project_type.to_string());
        let id = self.stream.publish(TOPIC_DEPLOYMENT_REQUESTS, event);

        info!(
            domain = %route.domain,
            project_id = %route.project_id,
            entry_id = id,
            "Wake-up event published"
        );
        WakeupOutcome::Published(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lifecycle::ProjectType;
    use std::time::Duration;

    fn setup() -> (Arc<EventStream>, Arc<RoutingCache>, WakeupPublisher, ProjectRoute) {
        let stream = Arc::new(EventStream::new(100));
        let cache = Arc::new(RoutingCache::new(Duration::from_secs(60)));
        let route = ProjectRoute {
            domain: "app.example.com".to_string(),
            project_id: "proj-1".to_string(),
            project_type: ProjectType::Dynamic,
        };
        cache.insert(route.clone());
        let publisher = WakeupPublisher::new(Arc::clone(&stream), Arc::clone(&cache));
        (stream, cache, publisher, route)
    }

    #[test]
    fn test_first_publish_wins() {
        let (stream, _cache, publisher, route) = setup();

        assert!(matches!(
            publisher.publish(&route, "req-1"),
            WakeupOutcome::Published(_)
        ));
        assert_eq!(
            publisher.publish(&route, "req-2"),
            WakeupOutcome::AlreadyRequested
        );
        assert_eq!(stream.len(TOPIC_DEPLOYMENT_REQUESTS), 1);
    }

    #[tokio::test]
    async fn test_published_event_shape() {
        let (stream, _cache, publisher, route) = setup();
        publisher.publish(&route, "req-1");

        let mut reader = stream.reader(TOPIC_DEPLOYMENT_REQUESTS, "scheduler");
        let entry = reader.next().await;
        assert_eq!(entry.event.kind, KIND_DEPLOYMENT_REQUESTED);
        assert_eq!(entry.event.project_id, "proj-1");
        assert_eq!(entry.event.request_id, "req-1");
        assert_eq!(entry.event.field("domain"), Some("app.example.com"));
        assert_eq!(entry.event.field("project_type"), Some("DYNAMIC"));
    }

    #[test]
    fn test_concurrent_publishes_single_event() {
        let (stream, _cache, publisher, route) = setup();
        let publisher = Arc::new(publisher);

        let mut handles = Vec::new();
        for n in 0..12 {
            let publisher = Arc::clone(&publisher);
            let route = route.clone();
            handles.push(std::thread::spawn(move || {
                publisher.publish(&route, &format!("req-{}", n))
            }));
        }

        let published = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|o| matches!(o, WakeupOutcome::Published(_)))
            .count();
        assert_eq!(published, 1);
        assert_eq!(stream.len(TOPIC_DEPLOYMENT_REQUESTS), 1);
    }

    #[test]
    fn test_expired_entry_suppresses_publish() {
        // Route no longer cached (expired): nothing to gate on, no event
        let stream = Arc::new(EventStream::new(100));
        let cache = Arc::new(RoutingCache::new(Duration::from_millis(0)));
        let route = ProjectRoute {
            domain: "app.example.com".to_string(),
            project_id: "proj-1".to_string(),
            project_type: ProjectType::Dynamic,
        };
        cache.insert(route.clone());
        let publisher = WakeupPublisher::new(Arc::clone(&stream), cache);

        assert_eq!(
            publisher.publish(&route, "req-1"),
            WakeupOutcome::AlreadyRequested
        );
        assert_eq!(stream.len(TOPIC_DEPLOYMENT_REQUESTS), 0);
    }
}
