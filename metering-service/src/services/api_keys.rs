//! API-key verification.
//!
//! Key issuance lives in the auth service; this module only resolves a
//! presented key to its tenant and scopes.

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::json;
use service_core::error::AppError;
use service_core::observability::TracedClientExt;
use service_core::utils::signature::sha256_hex;
use std::collections::HashMap;
use std::time::Duration;
use uuid::Uuid;

pub const SCOPE_USAGE_WRITE: &str = "usage:write";
pub const SCOPE_USAGE_READ: &str = "usage:read";
pub const SCOPE_BILLING_ADMIN: &str = "billing:admin";

/// Identity behind a verified API key.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ApiKeyPrincipal {
    pub key_id: String,
    pub tenant_id: Uuid,
    #[serde(default)]
    pub scopes: Vec<String>,
}

impl ApiKeyPrincipal {
    /// Exact match, `*`, or a `prefix:*` grant.
    pub fn has_scope(&self, required: &str) -> bool {
        self.scopes.iter().any(|granted| {
            if granted == "*" || granted == required {
                return true;
            }
            match granted.strip_suffix('*') {
                Some(prefix) => required.starts_with(prefix),
                None => false,
            }
        })
    }

    pub fn require_scope(&self, required: &str) -> Result<(), AppError> {
        if self.has_scope(required) {
            return Ok(());
        }
        tracing::warn!(
            key_id = %self.key_id,
            required_scope = %required,
            granted_scopes = ?self.scopes,
            "Insufficient scopes"
        );
        Err(AppError::Forbidden(anyhow::anyhow!(
            "Insufficient scopes. Required: {}",
            required
        )))
    }
}

#[async_trait]
pub trait ApiKeyVerifier: Send + Sync {
    /// `Ok(None)` for unknown or revoked keys.
    async fn verify(&self, api_key: &str) -> Result<Option<ApiKeyPrincipal>, AppError>;
}

/// Verifies keys against the auth service's `/api-keys/verify` endpoint.
#[derive(Clone)]
pub struct AuthServiceKeyVerifier {
    client: Client,
    endpoint: String,
    timeout: Duration,
}

impl AuthServiceKeyVerifier {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            endpoint: endpoint.into(),
            timeout: Duration::from_secs(5),
        }
    }
}

#[async_trait]
impl ApiKeyVerifier for AuthServiceKeyVerifier {
    async fn verify(&self, api_key: &str) -> Result<Option<ApiKeyPrincipal>, AppError> {
        let url = format!("{}/api-keys/verify", self.endpoint.trim_end_matches('/'));

        let response = self
            .client
            .traced_post(&url)
            .timeout(self.timeout)
            .json(&json!({ "apiKey": api_key }))
            .send()
            .await
            .map_err(|e| {
                tracing::error!(error = %e, "API key verification request failed");
                AppError::BadGateway("API key verification unavailable".to_string())
            })?;

        match response.status() {
            StatusCode::UNAUTHORIZED | StatusCode::NOT_FOUND => Ok(None),
            status if status.is_success() => {
                let principal = response.json::<ApiKeyPrincipal>().await.map_err(|e| {
                    AppError::BadGateway(format!("Invalid API key verification response: {}", e))
                })?;
                Ok(Some(principal))
            }
            status => {
                tracing::error!(status = %status, "API key verification returned an error");
                Err(AppError::BadGateway(format!(
                    "API key verification returned {}",
                    status
                )))
            }
        }
    }
}

/// In-process key table keyed by SHA-256 digest, so raw keys are not held.
#[derive(Clone, Default)]
pub struct StaticKeyVerifier {
    keys: HashMap<String, ApiKeyPrincipal>,
}

impl StaticKeyVerifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_key(mut self, raw_key: &str, tenant_id: Uuid, scopes: &[&str]) -> Self {
        let digest = sha256_hex(raw_key.as_bytes());
        let principal = ApiKeyPrincipal {
            key_id: digest[..12].to_string(),
            tenant_id,
            scopes: scopes.iter().map(|s| s.to_string()).collect(),
        };
        self.keys.insert(digest, principal);
        self
    }

    /// Parse `raw_key:tenant_id:scope|scope` entries separated by `;`.
    pub fn parse(entries: &str) -> Result<Self, AppError> {
        let mut verifier = Self::new();
        for entry in entries.split(';').map(str::trim).filter(|e| !e.is_empty()) {
            let mut parts = entry.splitn(3, ':');
            let (Some(key), Some(tenant), Some(scopes)) = (parts.next(), parts.next(), parts.next())
            else {
                return Err(AppError::ConfigError(anyhow::anyhow!(
                    "Malformed static API key entry"
                )));
            };
            let tenant_id = Uuid::parse_str(tenant).map_err(|e| {
                AppError::ConfigError(anyhow::anyhow!("Invalid tenant id in API key entry: {}", e))
            })?;
            let scopes: Vec<&str> = scopes.split('|').filter(|s| !s.is_empty()).collect();
            verifier = verifier.with_key(key, tenant_id, &scopes);
        }
        Ok(verifier)
    }
}

#[async_trait]
impl ApiKeyVerifier for StaticKeyVerifier {
    async fn verify(&self, api_key: &str) -> Result<Option<ApiKeyPrincipal>, AppError> {
        Ok(self.keys.get(&sha256_hex(api_key.as_bytes())).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn principal(scopes: &[&str]) -> ApiKeyPrincipal {
        ApiKeyPrincipal {
            key_id: "key".to_string(),
            tenant_id: Uuid::nil(),
            scopes: scopes.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[test]
    fn test_scope_matching() {
        assert!(principal(&["usage:write"]).has_scope("usage:write"));
        assert!(principal(&["usage:*"]).has_scope("usage:read"));
        assert!(principal(&["*"]).has_scope("billing:admin"));
        assert!(!principal(&["usage:read"]).has_scope("usage:write"));
        assert!(!principal(&["usage:*"]).has_scope("billing:admin"));
        assert!(!principal(&[]).has_scope("usage:read"));
    }

    #[test]
    fn test_require_scope_is_forbidden() {
        let err = principal(&["usage:read"])
            .require_scope(SCOPE_USAGE_WRITE)
            .unwrap_err();
        assert!(matches!(err, AppError::Forbidden(_)));
    }

    #[tokio::test]
    async fn test_static_verifier_parses_entries() {
        let tenant = Uuid::new_v4();
        let verifier =
            StaticKeyVerifier::parse(&format!("sk_live_a:{}:usage:write|usage:read", tenant))
                .unwrap();

        let found = verifier.verify("sk_live_a").await.unwrap().unwrap();
        assert_eq!(found.tenant_id, tenant);
        assert_eq!(found.scopes, vec!["usage:write", "usage:read"]);
        assert!(verifier.verify("sk_live_b").await.unwrap().is_none());
    }

    #[test]
    fn test_static_verifier_rejects_malformed_entry() {
        assert!(StaticKeyVerifier::parse("just-a-key").is_err());
        assert!(StaticKeyVerifier::parse("k:not-a-uuid:usage:write").is_err());
    }

    #[tokio::test]
    async fn test_auth_service_verifier() {
        let server = MockServer::start().await;
        let tenant = Uuid::new_v4();
        Mock::given(method("POST"))
            .and(path("/api-keys/verify"))
            .and(body_json(json!({ "apiKey": "good" })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "keyId": "k1",
                "tenantId": tenant,
                "scopes": ["usage:write"]
            })))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/api-keys/verify"))
            .and(body_json(json!({ "apiKey": "bad" })))
            .respond_with(ResponseTemplate::new(401))
            .mount(&server)
            .await;

        let verifier = AuthServiceKeyVerifier::new(server.uri());
        let found = verifier.verify("good").await.unwrap().unwrap();
        assert_eq!(found.tenant_id, tenant);
        assert!(verifier.verify("bad").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_auth_service_outage_is_bad_gateway() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let verifier = AuthServiceKeyVerifier::new(server.uri());
        let err = verifier.verify("any").await.unwrap_err();
        assert!(matches!(err, AppError::BadGateway(_)));
    }
}
