//! Bearer-token verification against the identity service.
//!
//! The bearer prefix is checked locally before any network traffic. Well-formed
//! tokens are introspected with `POST {validate_path} {"token": ...}` through
//! the identity service's circuit breaker, with bounded retries since
//! introspection has no side effects.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::breaker::BreakerRegistry;
use crate::discovery::{target_url, ServiceDiscovery};
use crate::metrics::IDENTITY_CALLS;
use crate::resilience::{self, Outcome, RetryPolicy};
use crate::role::Role;

/// Breaker key for introspection calls, kept apart from the breaker of the
/// identity service's own proxied routes.
pub const IDENTITY_DEPENDENCY: &str = "identity-service";

/// Caller identity, built fresh for each request and never cached.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Identity {
    pub subject_id: String,
    pub email: String,
    /// `None` when the identity service reported a user type outside the known set.
    pub role: Option<Role>,
    pub valid: bool,
}

impl Identity {
    pub fn invalid() -> Self {
        Self {
            subject_id: String::new(),
            email: String::new(),
            role: None,
            valid: false,
        }
    }
}

/// Body returned by the identity service's validate endpoint.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidateResponse {
    pub valid: bool,
    #[serde(default)]
    pub user_id: Option<serde_json::Value>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub user_type: Option<String>,
}

impl From<ValidateResponse> for Identity {
    fn from(body: ValidateResponse) -> Self {
        if !body.valid {
            return Identity::invalid();
        }
        let role = body.user_type.as_deref().and_then(|t| match t.parse::<Role>() {
            Ok(role) => Some(role),
            Err(e) => {
                tracing::warn!(error = %e, "identity service returned an unknown user type");
                None
            }
        });
        let subject_id = match body.user_id {
            Some(serde_json::Value::String(s)) => s,
            Some(serde_json::Value::Null) | None => String::new(),
            Some(other) => other.to_string(),
        };
        Identity {
            subject_id,
            email: body.email.unwrap_or_default(),
            role,
            valid: true,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum VerifyError {
    #[error("missing or malformed bearer token")]
    Unauthenticated,

    #[error("identity service unavailable: {0}")]
    Unavailable(String),
}

/// Extract the token from an `Authorization: Bearer <token>` header value.
pub fn bearer_token(header: Option<&str>) -> Result<&str, VerifyError> {
    header
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|token| !token.is_empty())
        .ok_or(VerifyError::Unauthenticated)
}

pub struct TokenVerifier {
    client: reqwest::Client,
    discovery: Arc<dyn ServiceDiscovery>,
    breakers: Arc<BreakerRegistry>,
    service: String,
    validate_path: String,
    policy: RetryPolicy,
}

impl TokenVerifier {
    pub fn new(
        client: reqwest::Client,
        discovery: Arc<dyn ServiceDiscovery>,
        breakers: Arc<BreakerRegistry>,
        service: String,
        validate_path: String,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            client,
            discovery,
            breakers,
            service,
            validate_path,
            policy,
        }
    }

    /// Verify the raw `Authorization` header value.
    ///
    /// An invalid token yields `Ok(Identity { valid: false, .. })`; only a
    /// malformed header or an unreachable identity service is an error.
    pub async fn verify(&self, authorization: Option<&str>) -> Result<Identity, VerifyError> {
        let token = bearer_token(authorization)?;
        let identity = self.introspect(token).await;

        let label = match &identity {
            Ok(id) if id.valid => "valid",
            Ok(_) => "invalid",
            Err(_) => "unavailable",
        };
        IDENTITY_CALLS.with_label_values(&[label]).inc();
        identity
    }

    async fn introspect(&self, token: &str) -> Result<Identity, VerifyError> {
        let base = self.discovery.resolve(&self.service).ok_or_else(|| {
            VerifyError::Unavailable(format!("service '{}' is not registered", self.service))
        })?;
        let url = target_url(&base, &self.validate_path, None);
        let payload = serde_json::json!({ "token": token });
        let breaker = self.breakers.get(IDENTITY_DEPENDENCY);

        let answer = resilience::call(&breaker, &self.policy, true, || {
            let request = self.client.post(&url).json(&payload);
            async move {
                let response = match request.send().await {
                    Ok(r) => r,
                    Err(e) => return Outcome::Transient(e.to_string()),
                };
                let status = response.status();
                if status.is_server_error() {
                    return Outcome::Transient(format!("identity service returned {status}"));
                }
                if !status.is_success() {
                    // The service answered and turned the token down.
                    return Outcome::Success(None);
                }
                match response.json::<ValidateResponse>().await {
                    Ok(body) => Outcome::Success(Some(body)),
                    Err(e) => Outcome::Fatal(format!("invalid validate response: {e}")),
                }
            }
        })
        .await
        .map_err(|e| VerifyError::Unavailable(e.to_string()))?;

        Ok(answer.map(Identity::from).unwrap_or_else(Identity::invalid))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bearer_token_extraction() {
        assert_eq!(bearer_token(Some("Bearer abc.def")).unwrap(), "abc.def");
        assert!(bearer_token(None).is_err());
        assert!(bearer_token(Some("abc.def")).is_err());
        assert!(bearer_token(Some("Basic dXNlcjpwYXNz")).is_err());
        assert!(bearer_token(Some("Bearer ")).is_err());
        assert!(bearer_token(Some("bearer abc")).is_err());
    }

    #[test]
    fn test_identity_from_valid_response() {
        let body: ValidateResponse = serde_json::from_value(serde_json::json!({
            "valid": true,
            "userId": 42,
            "email": "driver@example.com",
            "userType": "DRIVER"
        }))
        .unwrap();
        let identity = Identity::from(body);
        assert_eq!(
            identity,
            Identity {
                subject_id: "42".to_string(),
                email: "driver@example.com".to_string(),
                role: Some(Role::Driver),
                valid: true,
            }
        );
    }

    #[test]
    fn test_identity_from_invalid_response() {
        let body: ValidateResponse =
            serde_json::from_value(serde_json::json!({ "valid": false })).unwrap();
        assert_eq!(Identity::from(body), Identity::invalid());
    }

    #[test]
    fn test_unknown_user_type_keeps_identity_without_role() {
        let body: ValidateResponse = serde_json::from_value(serde_json::json!({
            "valid": true,
            "userId": "u-1",
            "email": "x@example.com",
            "userType": "DISPATCHER"
        }))
        .unwrap();
        let identity = Identity::from(body);
        assert!(identity.valid);
        assert_eq!(identity.subject_id, "u-1");
        assert_eq!(identity.role, None);
    }
}
