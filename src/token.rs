//! Signed, time-boxed lifecycle webhook tokens
//!
//! Each token is a capability: "permission to report transition X for
//! deployment D". It is minted once at scheduling time, handed to the
//! container out-of-band, and never reissued. The expiry doubles as the
//! phase's timeout budget, so verification distinguishes an expired token
//! (claims recovered, handled as an implicit timeout) from an invalid one
//! (rejected outright).

use crate::lifecycle::{ProjectType, WebhookAction};
use chrono::{Duration, Utc};
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};

/// Claims embedded in a lifecycle webhook token
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenClaims {
    pub action: WebhookAction,
    pub project_id: String,
    pub deployment_id: String,
    pub container_id: String,
    pub build_id: String,
    pub runtime_id: String,
    pub project_type: ProjectType,
    pub iat: i64,
    pub exp: i64,
}

/// Per-action expiry budgets, in seconds.
///
/// Provisioning-phase tokens are short: missing the window means the phase
/// failed. Retrospective signals (TERMINATED/FAILED/INGRESSED) are idle
/// reports, not gates, and get a long window.
#[derive(Debug, Clone, Deserialize)]
pub struct TokenTtls {
    #[serde(default = "default_provisioning_ttl")]
    pub provisioning_secs: i64,
    #[serde(default = "default_running_ttl")]
    pub running_secs: i64,
    #[serde(default = "default_production_ttl")]
    pub production_secs: i64,
    #[serde(default = "default_retrospective_ttl")]
    pub retrospective_secs: i64,
}

fn default_provisioning_ttl() -> i64 {
    10 * 60
}

fn default_running_ttl() -> i64 {
    10 * 60
}

fn default_production_ttl() -> i64 {
    20 * 60
}

fn default_retrospective_ttl() -> i64 {
    30 * 24 * 60 * 60
}

impl Default for TokenTtls {
    fn default() -> Self {
        Self {
            provisioning_secs: default_provisioning_ttl(),
            running_secs: default_running_ttl(),
            production_secs: default_production_ttl(),
            retrospective_secs: default_retrospective_ttl(),
        }
    }
}

impl TokenTtls {
    pub fn for_action(&self, action: WebhookAction) -> i64 {
        match action {
            WebhookAction::Provisioning => self.provisioning_secs,
            WebhookAction::Running => self.running_secs,
            WebhookAction::Production => self.production_secs,
            WebhookAction::Failed
            | WebhookAction::Terminated
            | WebhookAction::Ingressed => self.retrospective_secs,
        }
    }
}

/// Verification outcome that did not yield usable claims
#[derive(Debug)]
pub enum TokenError {
    /// Signature is valid but the token is past its expiry; carries the
    /// decoded claims so the caller can react to the timeout
    Expired(Box<TokenClaims>),
    /// Bad signature or malformed token; no claims recoverable
    Invalid(jsonwebtoken::errors::Error),
}

impl std::fmt::Display for TokenError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TokenError::Expired(claims) => write!(
                f,
                "Token expired for action {} on deployment {}",
                claims.action, claims.deployment_id
            ),
            TokenError::Invalid(e) => write!(f, "Invalid token: {}", e),
        }
    }
}

impl std::error::Error for TokenError {}

/// Mints and verifies lifecycle webhook tokens
#[derive(Clone)]
pub struct TokenIssuer {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    ttls: TokenTtls,
}

impl TokenIssuer {
    pub fn new(secret: &str, ttls: TokenTtls) -> Self {
        Self {
            encoding_key: EncodingKey::from_secret(secret.as_bytes()),
            decoding_key: DecodingKey::from_secret(secret.as_bytes()),
            ttls,
        }
    }

    /// Mint one token for (deployment, action), expiring per the action's
    /// budget
    #[allow(clippy::too_many_arguments)]
    pub fn issue(
        &self,
        action: WebhookAction,
        project_id: &str,
        deployment_id: &str,
        container_id: &str,
        build_id: &str,
        runtime_id: &str,
        project_type: ProjectType,
    ) -> Result<String, jsonwebtoken::errors::Error> {
        let now = Utc::now();
        let exp = now + Duration::seconds(self.ttls.for_action(action));
        let claims = TokenClaims {
            action,
            project_id: project_id.to_string(),
            deployment_id: deployment_id.to_string(),
            container_id: container_id.to_string(),
            build_id: build_id.to_string(),
            runtime_id: runtime_id.to_string(),
            project_type,
            iat: now.timestamp(),
            exp: exp.timestamp(),
        };
        encode(&Header::default(), &claims, &self.encoding_key)
    }

    /// Verify signature and expiry.
    ///
    /// An expired-but-authentic token yields `TokenError::Expired` with the
    /// claims re-decoded under the same signature check; anything else is
    /// `TokenError::Invalid`.
    pub fn verify(&self, token: &str) -> Result<TokenClaims, TokenError> {
        let validation = Validation::default();
        match decode::<TokenClaims>(token, &self.decoding_key, &validation) {
            Ok(data) => Ok(data.claims),
            Err(err)
                if matches!(
                    err.kind(),
                    jsonwebtoken::errors::ErrorKind::ExpiredSignature
                ) =>
            {
                let mut lenient = Validation::default();
                lenient.validate_exp = false;
                match decode::<TokenClaims>(token, &self.decoding_key, &lenient) {
                    Ok(data) => Err(TokenError::Expired(Box::new(data.claims))),
                    Err(err) => Err(TokenError::Invalid(err)),
                }
            }
            Err(err) => Err(TokenError::Invalid(err)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn issuer() -> TokenIssuer {
        TokenIssuer::new("test-secret-for-lifecycle-tokens", TokenTtls::default())
    }

    fn issue(issuer: &TokenIssuer, action: WebhookAction) -> String {
        issuer
            .issue(
                action,
                "proj-1",
                "dep-1",
                "ctr-dep-1-1700000000",
                "bld-dep-1-1700000000",
                "rt-dep-1-1700000000",
                ProjectType::Dynamic,
            )
            .unwrap()
    }

    #[test]
    fn test_issue_and_verify() {
        let issuer = issuer();
        let token = issue(&issuer, WebhookAction::Running);

        let claims = issuer.verify(&token).unwrap();
        assert_eq!(claims.action, WebhookAction::Running);
        assert_eq!(claims.project_id, "proj-1");
        assert_eq!(claims.deployment_id, "dep-1");
        assert_eq!(claims.container_id, "ctr-dep-1-1700000000");
        assert_eq!(claims.project_type, ProjectType::Dynamic);
    }

    #[test]
    fn test_per_action_expiry_budgets() {
        let ttls = TokenTtls::default();
        assert_eq!(ttls.for_action(WebhookAction::Provisioning), 600);
        assert_eq!(ttls.for_action(WebhookAction::Running), 600);
        assert_eq!(ttls.for_action(WebhookAction::Production), 1200);
        assert_eq!(ttls.for_action(WebhookAction::Terminated), 2_592_000);
        assert_eq!(ttls.for_action(WebhookAction::Ingressed), 2_592_000);
    }

    #[test]
    fn test_wrong_secret_is_invalid_not_expired() {
        let issuer_a = issuer();
        let issuer_b = TokenIssuer::new("a-different-secret", TokenTtls::default());
        let token = issue(&issuer_a, WebhookAction::Provisioning);

        match issuer_b.verify(&token) {
            Err(TokenError::Invalid(_)) => {}
            other => panic!("expected Invalid, got {:?}", other.map(|c| c.action)),
        }
    }

    #[test]
    fn test_garbage_token_invalid() {
        match issuer().verify("not.a.token") {
            Err(TokenError::Invalid(_)) => {}
            other => panic!("expected Invalid, got {:?}", other.map(|c| c.action)),
        }
    }

    #[test]
    fn test_expired_token_yields_claims() {
        // Negative TTL backdates the expiry past jsonwebtoken's default leeway
        let ttls = TokenTtls {
            provisioning_secs: -120,
            ..TokenTtls::default()
        };
        let issuer = TokenIssuer::new("test-secret-for-lifecycle-tokens", ttls);
        let token = issue(&issuer, WebhookAction::Provisioning);

        match issuer.verify(&token) {
            Err(TokenError::Expired(claims)) => {
                assert_eq!(claims.action, WebhookAction::Provisioning);
                assert_eq!(claims.deployment_id, "dep-1");
            }
            other => panic!("expected Expired, got {:?}", other.map(|c| c.action)),
        }
    }

    #[test]
    fn test_expired_with_wrong_secret_still_invalid() {
        let ttls = TokenTtls {
            provisioning_secs: -120,
            ..TokenTtls::default()
        };
        let issuer_a = TokenIssuer::new("secret-a", ttls.clone());
        let issuer_b = TokenIssuer::new("secret-b", ttls);
        let token = issue(&issuer_a, WebhookAction::Provisioning);

        match issuer_b.verify(&token) {
            Err(TokenError::Invalid(_)) => {}
            other => panic!("expected Invalid, got {:?}", other.map(|c| c.action)),
        }
    }
}
