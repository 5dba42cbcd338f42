//! Fire-and-forget ingress notification
//!
//! When the edge establishes an upstream connection for a dynamic project it
//! tells the orchestrator "this deployment just saw traffic" so idle-reaping
//! stays accurate. The call is best-effort: it runs detached from the client
//! response and its failures are logged, never surfaced.

use anyhow::Context;
use serde::Serialize;
use std::time::Duration;
use tracing::debug;

#[derive(Debug, Serialize)]
struct IngressReport<'a> {
    project_id: &'a str,
    domain: &'a str,
    request_id: &'a str,
}

/// Client for the orchestrator's internal ingress endpoint
pub struct IngressNotifier {
    client: reqwest::Client,
    endpoint: String,
}

impl IngressNotifier {
    pub fn new(orchestrator_base: &str, timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to build ingress HTTP client")?;
        Ok(Self {
            client,
            endpoint: format!(
                "{}/internal/ingressed",
                orchestrator_base.trim_end_matches('/')
            ),
        })
    }

    /// Report observed traffic for a project's domain
    pub async fn notify(
        &self,
        project_id: &str,
        domain: &str,
        request_id: &str,
    ) -> anyhow::Result<()> {
        let report = IngressReport {
            project_id,
            domain,
            request_id,
        };
        let response = self
            .client
            .post(&self.endpoint)
            .json(&report)
            .send()
            .await
            .context("Failed to send ingress notification")?;

        if !response.status().is_success() {
            anyhow::bail!("Ingress endpoint returned {}", response.status());
        }

        debug!(project_id, domain, request_id, "Ingress notification sent");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_built_from_base() {
        let notifier =
            IngressNotifier::new("http://127.0.0.1:7000/", Duration::from_secs(1)).unwrap();
        assert_eq!(notifier.endpoint, "http://127.0.0.1:7000/internal/ingressed");
    }

    #[test]
    fn test_report_serialization() {
        let report = IngressReport {
            project_id: "p-1",
            domain: "app.example.com",
            request_id: "req-1",
        };
        let json = serde_json::to_string(&report).unwrap();
        assert!(json.contains("\"project_id\":\"p-1\""));
        assert!(json.contains("\"domain\":\"app.example.com\""));
    }
}
