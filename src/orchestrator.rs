//! Orchestrator: scheduling handoff and webhook receiver
//!
//! Containers report lifecycle progress by calling back with the signed
//! tokens they were handed at scheduling time. The signature and expiry are
//! the entire auth mechanism for that path: a valid token proves the report
//! was authorized, and an expired lifecycle token *is* the phase timeout --
//! the deployment is forced to TERMINATED without any separate watchdog.
//!
//! The HTTP surface is a small hyper service on its own port: the
//! container-facing webhook route plus edge/scheduler-internal routes.

use crate::lifecycle::{DeploymentStatus, ProjectType, SchedulingIds, WebhookAction};
use crate::records::{RecordStore, StoreError};
use crate::stream::{EventStream, StreamEvent, TOPIC_CONTAINER_LIFECYCLE, TOPIC_PROJECT_LIFECYCLE};
use crate::token::{TokenError, TokenIssuer};
use chrono::Utc;
use http_body_util::{BodyExt, Full};
use hyper::body::Bytes;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Normalized event kind for container lifecycle facts
pub const KIND_CONTAINER_STATE_CHANGED: &str = "CONTAINER_STATE_CHANGED";
/// Event kind published when a deployment is handed to the scheduler
pub const KIND_DEPLOYMENT_SCHEDULED: &str = "DEPLOYMENT_SCHEDULED";

/// Discriminator accompanying a webhook callback
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WebhookKind {
    /// Out-of-band traffic-observed signal; touches `last_ingressed_at` only
    TrafficDetected,
    /// A lifecycle transition report
    StateChanged,
}

impl std::str::FromStr for WebhookKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s.to_uppercase().as_str() {
            "TRAFFIC_DETECTED" => Ok(WebhookKind::TrafficDetected),
            "STATE_CHANGED" => Ok(WebhookKind::StateChanged),
            _ => anyhow::bail!("Unknown webhook kind: {}", s),
        }
    }
}

/// What the receiver did with a callback
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WebhookDisposition {
    /// Status transition validated and persisted
    Applied(DeploymentStatus),
    /// Traffic signal recorded against an existing record
    IngressRecorded,
    /// Traffic signal for a deployment with no record; dropped
    IngressIgnored,
    /// Expired lifecycle token: the deployment was forced to TERMINATED
    ExpiredTerminated,
    /// Expired token with nothing to do (ingress token, or already terminal)
    ExpiredIgnored,
    /// Bad signature or malformed token; no state touched
    RejectedInvalidToken,
    /// The reported transition would regress the state machine
    RejectedTransition {
        current: DeploymentStatus,
        reported: DeploymentStatus,
    },
    /// Token action and report kind do not agree
    RejectedMismatch,
    /// The record store failed
    StoreFailed,
}

/// The packet handed to the container scheduler for one deployment
#[derive(Debug, Serialize)]
pub struct ScheduledDeployment {
    pub project_id: String,
    pub deployment_id: String,
    pub project_type: ProjectType,
    pub container_id: String,
    pub build_id: String,
    pub runtime_id: String,
    /// One signed token per reportable action
    pub tokens: Vec<(WebhookAction, String)>,
}

pub struct Orchestrator {
    store: Arc<RecordStore>,
    stream: Arc<EventStream>,
    issuer: TokenIssuer,
}

impl Orchestrator {
    pub fn new(store: Arc<RecordStore>, stream: Arc<EventStream>, issuer: TokenIssuer) -> Self {
        Self {
            store,
            stream,
            issuer,
        }
    }

    /// Prepare one scheduling attempt: derive the attempt-scoped identifiers,
    /// record the deployment as PROVISIONING, and mint one token per
    /// lifecycle transition (tokens are never reissued).
    pub fn schedule(
        &self,
        project_id: &str,
        deployment_id: &str,
        project_type: ProjectType,
    ) -> anyhow::Result<ScheduledDeployment> {
        let scheduled_at = Utc::now().timestamp();
        let ids = SchedulingIds::derive(deployment_id, scheduled_at);

        self.store
            .apply_status(
                project_id,
                deployment_id,
                project_type,
                DeploymentStatus::Provisioning,
            )
            .map_err(|e| anyhow::anyhow!("Failed to record scheduled deployment: {}", e))?;

        let mut tokens = Vec::with_capacity(WebhookAction::ALL.len());
        for action in WebhookAction::ALL {
            let token = self.issuer.issue(
                action,
                project_id,
                deployment_id,
                &ids.container_id,
                &ids.build_id,
                &ids.runtime_id,
                project_type,
            )?;
            tokens.push((action, token));
        }

        self.stream.publish(
            TOPIC_PROJECT_LIFECYCLE,
            StreamEvent::new(KIND_DEPLOYMENT_SCHEDULED, project_id)
                .with_deployment(deployment_id)
                .with_field("container_id", ids.container_id.clone()),
        );

        info!(
            project_id,
            deployment_id,
            container_id = %ids.container_id,
            "Deployment scheduled"
        );

        Ok(ScheduledDeployment {
            project_id: project_id.to_string(),
            deployment_id: deployment_id.to_string(),
            project_type,
            container_id: ids.container_id,
            build_id: ids.build_id,
            runtime_id: ids.runtime_id,
            tokens,
        })
    }

    /// Verify and apply one container callback
    pub fn handle_webhook(&self, token: &str, kind: WebhookKind) -> WebhookDisposition {
        let claims = match self.issuer.verify(token) {
            Ok(claims) => claims,
            Err(TokenError::Invalid(e)) => {
                // Bad signature: reject silently, log only
                warn!(error = %e, "Webhook token rejected");
                return WebhookDisposition::RejectedInvalidToken;
            }
            Err(TokenError::Expired(claims)) => {
                return self.handle_expired(&claims);
            }
        };

        match kind {
            WebhookKind::TrafficDetected => {
                if claims.action != WebhookAction::Ingressed {
                    warn!(
                        action = %claims.action,
                        deployment_id = %claims.deployment_id,
                        "Traffic report with a non-ingress token"
                    );
                    return WebhookDisposition::RejectedMismatch;
                }
                match self
                    .store
                    .record_ingress(&claims.project_id, &claims.deployment_id)
                {
                    Ok(true) => {
                        debug!(deployment_id = %claims.deployment_id, "Ingress recorded");
                        WebhookDisposition::IngressRecorded
                    }
                    Ok(false) => WebhookDisposition::IngressIgnored,
                    Err(e) => {
                        error!(error = %e, "Failed to record ingress");
                        WebhookDisposition::StoreFailed
                    }
                }
            }
            WebhookKind::StateChanged => {
                let Some(status) = claims.action.as_status() else {
                    warn!(
                        deployment_id = %claims.deployment_id,
                        "State report with an ingress token"
                    );
                    return WebhookDisposition::RejectedMismatch;
                };
                match self.store.apply_status(
                    &claims.project_id,
                    &claims.deployment_id,
                    claims.project_type,
                    status,
                ) {
                    Ok(record) => {
                        info!(
                            project_id = %claims.project_id,
                            deployment_id = %claims.deployment_id,
                            status = %record.status,
                            "Deployment status updated"
                        );
                        self.publish_state_changed(
                            &claims.project_id,
                            &claims.deployment_id,
                            &claims.container_id,
                            claims.project_type,
                            status,
                            None,
                        );
                        WebhookDisposition::Applied(status)
                    }
                    Err(StoreError::IllegalTransition { current, reported }) => {
                        // Stale or reordered report; observable, never applied
                        warn!(
                            project_id = %claims.project_id,
                            deployment_id = %claims.deployment_id,
                            current = %current,
                            reported = %reported,
                            "Rejected regressive status transition"
                        );
                        WebhookDisposition::RejectedTransition { current, reported }
                    }
                    Err(e) => {
                        error!(error = %e, "Failed to apply status");
                        WebhookDisposition::StoreFailed
                    }
                }
            }
        }
    }

    /// The expiry-as-timeout path: a lifecycle token that ran out before use
    /// means the container never reported that phase in time. Convert the
    /// silence into an explicit terminal state.
    fn handle_expired(&self, claims: &crate::token::TokenClaims) -> WebhookDisposition {
        if !claims.action.is_lifecycle() {
            debug!(
                deployment_id = %claims.deployment_id,
                "Expired ingress token ignored"
            );
            return WebhookDisposition::ExpiredIgnored;
        }

        warn!(
            project_id = %claims.project_id,
            deployment_id = %claims.deployment_id,
            action = %claims.action,
            "Lifecycle token expired; terminating deployment"
        );

        match self.store.force_terminate(
            &claims.project_id,
            &claims.deployment_id,
            claims.project_type,
        ) {
            Ok((_, true)) => {
                self.publish_state_changed(
                    &claims.project_id,
                    &claims.deployment_id,
                    &claims.container_id,
                    claims.project_type,
                    DeploymentStatus::Terminated,
                    Some("TOKEN_EXPIRED"),
                );
                WebhookDisposition::ExpiredTerminated
            }
            Ok((_, false)) => WebhookDisposition::ExpiredIgnored,
            Err(e) => {
                error!(error = %e, "Failed to terminate expired deployment");
                WebhookDisposition::StoreFailed
            }
        }
    }

    fn publish_state_changed(
        &self,
        project_id: &str,
        deployment_id: &str,
        container_id: &str,
        project_type: ProjectType,
        status: DeploymentStatus,
        reason: Option<&str>,
    ) {
        let mut event = StreamEvent::new(KIND_CONTAINER_STATE_CHANGED, project_id)
            .with_deployment(deployment_id)
            .with_field("status", status.as_str())
            .with_field("project_type", project_type.to_string())
            .with_field("container_id", container_id);
        if let Some(reason) = reason {
            event = event.with_field("reason", reason);
        }
        self.stream.publish(TOPIC_CONTAINER_LIFECYCLE, event);
    }

    /// Resolve a project's active deployment and touch its ingress
    /// timestamp. Used by the edge, which knows the project but not the
    /// deployment; no-op when the project has no live record.
    pub fn record_project_ingress(&self, project_id: &str) -> anyhow::Result<bool> {
        let records = self
            .store
            .latest_for_project(project_id)
            .map_err(|e| anyhow::anyhow!("Failed to query records: {}", e))?;
        let Some(active) = records.iter().find(|r| !r.status.is_terminal()) else {
            return Ok(false);
        };
        self.store
            .record_ingress(project_id, &active.deployment_id)
            .map_err(|e| anyhow::anyhow!("Failed to record ingress: {}", e))
    }
}

// ---------------------------------------------------------------------------
// HTTP surface

#[derive(Debug, Deserialize)]
struct WebhookRequest {
    kind: String,
    /// Callers may send the token in the body instead of the
    /// Authorization header
    #[serde(default)]
    token: Option<String>,
}

/// Pull the token out of an `Authorization: Bearer ...` header
fn extract_bearer(req: &Request<hyper::body::Incoming>) -> Option<String> {
    req.headers()
        .get(hyper::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(String::from)
}

#[derive(Debug, Deserialize)]
struct ScheduleRequest {
    project_id: String,
    deployment_id: String,
    project_type: String,
}

#[derive(Debug, Deserialize)]
struct IngressRequest {
    project_id: String,
    #[serde(default)]
    domain: String,
    #[serde(default)]
    request_id: String,
}

fn response(status: StatusCode, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .body(Full::new(body.into()))
        .expect("valid response with StatusCode enum")
}

fn json_response(status: StatusCode, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .header("content-type", "application/json")
        .body(Full::new(body.into()))
        .expect("valid response with StatusCode enum and static header")
}

/// Orchestrator API server: container webhooks plus internal routes
pub struct OrchestratorServer {
    bind_addr: SocketAddr,
    orchestrator: Arc<Orchestrator>,
    shutdown_rx: watch::Receiver<bool>,
}

impl OrchestratorServer {
    pub fn new(
        bind_addr: SocketAddr,
        orchestrator: Arc<Orchestrator>,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        Self {
            bind_addr,
            orchestrator,
            shutdown_rx,
        }
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let listener = TcpListener::bind(self.bind_addr).await?;
        info!(addr = %self.bind_addr, "Orchestrator server listening");

        let mut shutdown_rx = self.shutdown_rx.clone();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let orchestrator = Arc::clone(&self.orchestrator);
                            tokio::spawn(async move {
                                let io = TokioIo::new(stream);
                                let service = service_fn(move |req| {
                                    let orchestrator = Arc::clone(&orchestrator);
                                    async move { handle_request(req, orchestrator).await }
                                });
                                if let Err(e) = AutoBuilder::new(TokioExecutor::new())
                                    .serve_connection(io, service)
                                    .await
                                {
                                    debug!(addr = %addr, error = %e, "Orchestrator connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept orchestrator connection");
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("Orchestrator server shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }
}

async fn handle_request(
    req: Request<hyper::body::Incoming>,
    orchestrator: Arc<Orchestrator>,
) -> Result<Response<Full<Bytes>>, hyper::Error> {
    let path = req.uri().path().to_string();
    let method = req.method().clone();

    debug!(%method, %path, "Orchestrator request");

    let response = match (&method, path.as_str()) {
        (&Method::GET, "/healthz") => response(StatusCode::OK, "ok"),

        (&Method::POST, "/hooks/lifecycle") => {
            let bearer = extract_bearer(&req);
            let body = req.collect().await?.to_bytes();
            handle_webhook_request(&orchestrator, bearer, &body)
        }

        (&Method::POST, "/internal/schedule") => {
            let body = req.collect().await?.to_bytes();
            handle_schedule_request(&orchestrator, &body)
        }

        (&Method::POST, "/internal/ingressed") => {
            let body = req.collect().await?.to_bytes();
            handle_ingress_request(&orchestrator, &body)
        }

        _ => response(StatusCode::NOT_FOUND, "not found"),
    };

    Ok(response)
}

fn handle_webhook_request(
    orchestrator: &Orchestrator,
    bearer: Option<String>,
    body: &[u8],
) -> Response<Full<Bytes>> {
    let request: WebhookRequest = match serde_json::from_slice(body) {
        Ok(r) => r,
        Err(e) => return response(StatusCode::BAD_REQUEST, format!("invalid body: {}", e)),
    };
    let kind = match WebhookKind::from_str(&request.kind) {
        Ok(k) => k,
        Err(e) => return response(StatusCode::BAD_REQUEST, e.to_string()),
    };
    let Some(token) = bearer.or(request.token) else {
        return response(StatusCode::UNAUTHORIZED, "missing token");
    };

    let disposition = orchestrator.handle_webhook(&token, kind);
    let (status, body) = match &disposition {
        WebhookDisposition::Applied(s) => (
            StatusCode::OK,
            serde_json::json!({ "applied": true, "status": s.as_str() }),
        ),
        WebhookDisposition::IngressRecorded => {
            (StatusCode::OK, serde_json::json!({ "applied": true }))
        }
        WebhookDisposition::IngressIgnored | WebhookDisposition::ExpiredIgnored => {
            (StatusCode::OK, serde_json::json!({ "applied": false }))
        }
        WebhookDisposition::ExpiredTerminated => (
            StatusCode::GONE,
            serde_json::json!({ "applied": true, "status": "TERMINATED", "reason": "TOKEN_EXPIRED" }),
        ),
        WebhookDisposition::RejectedInvalidToken => (
            StatusCode::UNAUTHORIZED,
            serde_json::json!({ "error": "invalid token" }),
        ),
        WebhookDisposition::RejectedTransition { current, reported } => (
            StatusCode::CONFLICT,
            serde_json::json!({
                "error": "illegal transition",
                "current": current.as_str(),
                "reported": reported.as_str(),
            }),
        ),
        WebhookDisposition::RejectedMismatch => (
            StatusCode::BAD_REQUEST,
            serde_json::json!({ "error": "token action does not match report kind" }),
        ),
        WebhookDisposition::StoreFailed => (
            StatusCode::INTERNAL_SERVER_ERROR,
            serde_json::json!({ "error": "store failure" }),
        ),
    };
    json_response(status, body.to_string())
}

fn handle_schedule_request(orchestrator: &Orchestrator, body: &[u8]) -> Response<Full<Bytes>> {
    let request: ScheduleRequest = match serde_json::from_slice(body) {
        Ok(r) => r,
        Err(e) => return response(StatusCode::BAD_REQUEST, format!("invalid body: {}", e)),
    };
    let project_type = match ProjectType::from_str(&request.project_type) {
        Ok(t) => t,
        Err(e) => return response(StatusCode::BAD_REQUEST, e.to_string()),
    };

    match orchestrator.schedule(&request.project_id, &request.deployment_id, project_type) {
        Ok(scheduled) => match serde_json::to_string(&scheduled) {
            Ok(json) => json_response(StatusCode::OK, json),
            Err(e) => {
                error!(error = %e, "Failed to serialize scheduling packet");
                response(StatusCode::INTERNAL_SERVER_ERROR, "serialization failure")
            }
        },
        Err(e) => {
            error!(error = %e, "Scheduling failed");
            response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
        }
    }
}

fn handle_ingress_request(orchestrator: &Orchestrator, body: &[u8]) -> Response<Full<Bytes>> {
    let request: IngressRequest = match serde_json::from_slice(body) {
        Ok(r) => r,
        Err(e) => return response(StatusCode::BAD_REQUEST, format!("invalid body: {}", e)),
    };

    match orchestrator.record_project_ingress(&request.project_id) {
        Ok(recorded) => {
            debug!(
                project_id = %request.project_id,
                domain = %request.domain,
                request_id = %request.request_id,
                recorded,
                "Ingress report handled"
            );
            json_response(
                StatusCode::OK,
                serde_json::json!({ "recorded": recorded }).to_string(),
            )
        }
        Err(e) => {
            error!(error = %e, "Failed to handle ingress report");
            response(StatusCode::INTERNAL_SERVER_ERROR, "store failure")
        }
    }
}
