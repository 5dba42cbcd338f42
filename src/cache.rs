//! In-process routing cache
//!
//! Maps inbound domains to project routing facts with a bounded freshness
//! window. Entries are populated on cache miss from the project directory and
//! expire after a fixed TTL; a periodic sweep evicts stale entries. The cache
//! is constructed once at startup and passed by handle, never a global.

use crate::lifecycle::ProjectType;
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

/// Routing facts for one domain, as resolved from the project directory
#[derive(Debug, Clone)]
pub struct ProjectRoute {
    pub domain: String,
    pub project_id: String,
    pub project_type: ProjectType,
}

struct CacheEntry {
    route: ProjectRoute,
    /// Set once per cold period when a wake-up event is published;
    /// cleared implicitly by entry expiry
    deployment_requested: AtomicBool,
    inserted_at: Instant,
}

/// Process-wide domain -> route cache with TTL expiry
pub struct RoutingCache {
    entries: DashMap<String, Arc<CacheEntry>>,
    ttl: Duration,
}

impl RoutingCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            ttl,
        }
    }

    /// Look up an unexpired route for a domain
    pub fn get(&self, domain: &str) -> Option<ProjectRoute> {
        let entry = self.entries.get(domain)?;
        if entry.inserted_at.elapsed() >= self.ttl {
            drop(entry);
            self.entries.remove(domain);
            return None;
        }
        Some(entry.route.clone())
    }

    /// Insert a freshly resolved route, resetting the wake-up flag
    pub fn insert(&self, route: ProjectRoute) {
        let domain = route.domain.clone();
        self.entries.insert(
            domain,
            Arc::new(CacheEntry {
                route,
                deployment_requested: AtomicBool::new(false),
                inserted_at: Instant::now(),
            }),
        );
    }

    /// Flip the deployment-requested flag for a domain.
    ///
    /// Returns true only for the first caller per entry lifetime; concurrent
    /// callers race on a compare-and-set so at most one wins. Returns false
    /// when the entry is missing or expired (no flag to flip).
    pub fn mark_deployment_requested(&self, domain: &str) -> bool {
        match self.entries.get(domain) {
            Some(entry) if entry.inserted_at.elapsed() < self.ttl => entry
                .deployment_requested
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_ok(),
            _ => false,
        }
    }

    /// Whether a wake-up has already been requested for this domain
    pub fn deployment_requested(&self, domain: &str) -> bool {
        self.entries
            .get(domain)
            .map(|e| e.deployment_requested.load(Ordering::Acquire))
            .unwrap_or(false)
    }

    /// Evict expired entries; called periodically from the sweep loop
    pub fn sweep(&self) -> usize {
        let before = self.entries.len();
        self.entries
            .retain(|_, entry| entry.inserted_at.elapsed() < self.ttl);
        let evicted = before - self.entries.len();
        if evicted > 0 {
            debug!(evicted, remaining = self.entries.len(), "Routing cache swept");
        }
        evicted
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn route(domain: &str, project_type: ProjectType) -> ProjectRoute {
        ProjectRoute {
            domain: domain.to_string(),
            project_id: format!("proj-{}", domain),
            project_type,
        }
    }

    #[test]
    fn test_insert_and_get() {
        let cache = RoutingCache::new(Duration::from_secs(60));
        cache.insert(route("app.example.com", ProjectType::Dynamic));

        let found = cache.get("app.example.com").unwrap();
        assert_eq!(found.project_id, "proj-app.example.com");
        assert_eq!(found.project_type, ProjectType::Dynamic);
        assert!(cache.get("other.example.com").is_none());
    }

    #[test]
    fn test_expired_entry_not_returned() {
        let cache = RoutingCache::new(Duration::from_millis(0));
        cache.insert(route("app.example.com", ProjectType::Static));
        assert!(cache.get("app.example.com").is_none());
    }

    #[test]
    fn test_mark_deployment_requested_once() {
        let cache = RoutingCache::new(Duration::from_secs(60));
        cache.insert(route("app.example.com", ProjectType::Dynamic));

        assert!(cache.mark_deployment_requested("app.example.com"));
        assert!(!cache.mark_deployment_requested("app.example.com"));
        assert!(cache.deployment_requested("app.example.com"));
    }

    #[test]
    fn test_mark_missing_domain_is_noop() {
        let cache = RoutingCache::new(Duration::from_secs(60));
        assert!(!cache.mark_deployment_requested("nowhere.example.com"));
    }

    #[test]
    fn test_reinsert_resets_flag() {
        let cache = RoutingCache::new(Duration::from_secs(60));
        cache.insert(route("app.example.com", ProjectType::Dynamic));
        assert!(cache.mark_deployment_requested("app.example.com"));

        // Fresh directory resolution replaces the entry; new cold period
        cache.insert(route("app.example.com", ProjectType::Dynamic));
        assert!(!cache.deployment_requested("app.example.com"));
        assert!(cache.mark_deployment_requested("app.example.com"));
    }

    #[test]
    fn test_sweep_evicts_expired() {
        let cache = RoutingCache::new(Duration::from_millis(0));
        cache.insert(route("a.example.com", ProjectType::Static));
        cache.insert(route("b.example.com", ProjectType::Dynamic));
        assert_eq!(cache.len(), 2);

        let evicted = cache.sweep();
        assert_eq!(evicted, 2);
        assert!(cache.is_empty());
    }

    #[test]
    fn test_concurrent_mark_single_winner() {
        let cache = Arc::new(RoutingCache::new(Duration::from_secs(60)));
        cache.insert(route("app.example.com", ProjectType::Dynamic));

        let mut handles = Vec::new();
        for _ in 0..16 {
            let cache = Arc::clone(&cache);
            handles.push(std::thread::spawn(move || {
                cache.mark_deployment_requested("app.example.com")
            }));
        }

        let winners = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|&won| won)
            .count();
        assert_eq!(winners, 1);
    }
}
