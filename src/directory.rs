//! Project directory client
//!
//! Resolves a public domain to project routing facts by calling the
//! project-management service. Used by the edge on routing-cache miss only;
//! results are cached by the caller.

use crate::cache::ProjectRoute;
use crate::lifecycle::ProjectType;
use anyhow::Context;
use serde::Deserialize;
use std::time::Duration;
use tracing::debug;

/// Errors from a directory lookup.
///
/// "Domain not found" is not an error; it maps to `Ok(None)` and a
/// user-facing 404. This enum covers the lookup itself failing.
#[derive(Debug)]
pub enum DirectoryError {
    /// Transport-level failure reaching the directory service
    Transport(reqwest::Error),
    /// The directory answered with an unexpected status
    BadStatus(reqwest::StatusCode),
    /// The directory answered 2xx with an undecodable body
    BadPayload(String),
}

impl std::fmt::Display for DirectoryError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DirectoryError::Transport(e) => write!(f, "Directory unreachable: {}", e),
            DirectoryError::BadStatus(s) => write!(f, "Directory returned {}", s),
            DirectoryError::BadPayload(e) => write!(f, "Directory payload invalid: {}", e),
        }
    }
}

impl std::error::Error for DirectoryError {}

#[derive(Debug, Deserialize)]
struct ProjectFacts {
    project_id: String,
    project_type: ProjectType,
}

/// HTTP client for the project-management collaborator
pub struct ProjectDirectoryClient {
    client: reqwest::Client,
    base_url: String,
}

impl ProjectDirectoryClient {
    pub fn new(base_url: &str, timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to build directory HTTP client")?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    /// Resolve a domain to project facts; `Ok(None)` means the domain is not
    /// registered anywhere
    pub async fn resolve(&self, domain: &str) -> Result<Option<ProjectRoute>, DirectoryError> {
        let url = format!("{}/internal/projects/by-domain/{}", self.base_url, domain);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(DirectoryError::Transport)?;

        match response.status() {
            reqwest::StatusCode::NOT_FOUND => {
                debug!(domain, "Domain not present in project directory");
                Ok(None)
            }
            status if status.is_success() => {
                let facts: ProjectFacts = response
                    .json()
                    .await
                    .map_err(|e| DirectoryError::BadPayload(e.to_string()))?;
                debug!(
                    domain,
                    project_id = %facts.project_id,
                    project_type = %facts.project_type,
                    "Domain resolved"
                );
                Ok(Some(ProjectRoute {
                    domain: domain.to_string(),
                    project_id: facts.project_id,
                    project_type: facts.project_type,
                }))
            }
            status => Err(DirectoryError::BadStatus(status)),
        }
    }
}
