//! Failure taxonomy and the canonical error envelope.
//!
//! Every failure the gateway itself produces is rendered as an
//! [`ErrorEnvelope`]; responses proxied from a backend are never rewritten.

use actix_web::http::StatusCode;
use actix_web::{HttpResponse, ResponseError};
use serde::Serialize;
use std::fmt;

use crate::middleware::DispatchStage;
use crate::resilience::CallError;
use crate::rewrite::RewriteError;
use crate::role::{RequiredRole, Role};

pub const SERVICE_NAME: &str = "api-gateway";

/// Client-visible failure classes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    NotFound,
    Unauthenticated,
    Forbidden,
    ServiceUnavailable,
    GatewayTimeout,
    InternalError,
}

impl FailureKind {
    pub fn status(self) -> StatusCode {
        match self {
            FailureKind::NotFound => StatusCode::NOT_FOUND,
            FailureKind::Unauthenticated => StatusCode::UNAUTHORIZED,
            FailureKind::Forbidden => StatusCode::FORBIDDEN,
            FailureKind::ServiceUnavailable => StatusCode::SERVICE_UNAVAILABLE,
            FailureKind::GatewayTimeout => StatusCode::GATEWAY_TIMEOUT,
            FailureKind::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn message(self) -> &'static str {
        match self {
            FailureKind::NotFound => "Resource not found",
            FailureKind::Unauthenticated => "Missing or invalid credentials",
            FailureKind::Forbidden => "Insufficient role",
            FailureKind::ServiceUnavailable => "Dependency temporarily unavailable",
            FailureKind::GatewayTimeout => "Upstream did not respond in time",
            FailureKind::InternalError => "Internal gateway error",
        }
    }
}

/// Internal failure, carrying detail for logs. Clients only ever see the
/// [`FailureKind`] it maps to.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("no route matches the request path")]
    NoRoute,

    #[error("missing or malformed bearer token")]
    MissingCredentials,

    #[error("identity service rejected the token")]
    InvalidToken,

    #[error("role {role:?} does not satisfy {required}")]
    Forbidden {
        required: RequiredRole,
        role: Option<Role>,
    },

    #[error("identity service unavailable: {0}")]
    IdentityUnavailable(String),

    #[error(transparent)]
    Rewrite(#[from] RewriteError),

    #[error("service '{0}' has no registered address")]
    Unresolved(String),

    #[error("upstream '{service}' failed: {source}")]
    Upstream {
        service: String,
        #[source]
        source: CallError,
    },

    #[error("request exceeded the overall timeout")]
    RequestTimeout,

    #[error("internal error: {0}")]
    Internal(String),
}

impl GatewayError {
    pub fn kind(&self) -> FailureKind {
        match self {
            GatewayError::NoRoute => FailureKind::NotFound,
            GatewayError::MissingCredentials | GatewayError::InvalidToken => {
                FailureKind::Unauthenticated
            }
            GatewayError::Forbidden { .. } => FailureKind::Forbidden,
            GatewayError::IdentityUnavailable(_) | GatewayError::Unresolved(_) => {
                FailureKind::ServiceUnavailable
            }
            GatewayError::Upstream { source, .. } => match source {
                CallError::Timeout => FailureKind::GatewayTimeout,
                CallError::CircuitOpen | CallError::Transport(_) => {
                    FailureKind::ServiceUnavailable
                }
                CallError::Fatal(_) => FailureKind::InternalError,
            },
            GatewayError::RequestTimeout => FailureKind::GatewayTimeout,
            GatewayError::Rewrite(_) | GatewayError::Internal(_) => FailureKind::InternalError,
        }
    }
}

/// JSON body of every gateway-generated error response.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorEnvelope {
    pub timestamp: String,
    pub status: u16,
    pub error: String,
    pub message: String,
    pub path: String,
    pub service: String,
}

impl ErrorEnvelope {
    pub fn new(kind: FailureKind, path: &str) -> Self {
        let status = kind.status();
        Self {
            timestamp: chrono::Utc::now().to_rfc3339(),
            status: status.as_u16(),
            error: status.canonical_reason().unwrap_or("Error").to_string(),
            message: kind.message().to_string(),
            path: path.to_string(),
            service: SERVICE_NAME.to_string(),
        }
    }

    pub fn into_response(self) -> HttpResponse {
        let status = StatusCode::from_u16(self.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        HttpResponse::build(status)
            .content_type("application/json")
            .json(self)
    }
}

/// A failed request together with the context needed to log and render it.
#[derive(Debug)]
pub struct RequestFailure {
    pub error: GatewayError,
    pub method: String,
    pub path: String,
    pub route: Option<String>,
    pub stage: DispatchStage,
}

impl fmt::Display for RequestFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} failed while {}: {}", self.method, self.path, self.stage, self.error)
    }
}

impl ResponseError for RequestFailure {
    fn status_code(&self) -> StatusCode {
        self.error.kind().status()
    }

    fn error_response(&self) -> HttpResponse {
        let kind = self.error.kind();
        let route = self.route.as_deref().unwrap_or("-");
        if kind.status().is_server_error() {
            tracing::error!(
                method = %self.method,
                path = %self.path,
                route,
                stage = %self.stage,
                kind = ?kind,
                error = %self.error,
                "gateway request failed"
            );
        } else {
            tracing::warn!(
                method = %self.method,
                path = %self.path,
                route,
                stage = %self.stage,
                kind = ?kind,
                error = %self.error,
                "gateway request rejected"
            );
        }
        ErrorEnvelope::new(kind, &self.path).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failure_table() {
        let cases = [
            (FailureKind::NotFound, 404, "Resource not found"),
            (FailureKind::Unauthenticated, 401, "Missing or invalid credentials"),
            (FailureKind::Forbidden, 403, "Insufficient role"),
            (FailureKind::ServiceUnavailable, 503, "Dependency temporarily unavailable"),
            (FailureKind::GatewayTimeout, 504, "Upstream did not respond in time"),
            (FailureKind::InternalError, 500, "Internal gateway error"),
        ];
        for (kind, status, message) in cases {
            assert_eq!(kind.status().as_u16(), status);
            assert_eq!(kind.message(), message);
        }
    }

    #[test]
    fn test_error_classification() {
        assert_eq!(GatewayError::NoRoute.kind(), FailureKind::NotFound);
        assert_eq!(GatewayError::InvalidToken.kind(), FailureKind::Unauthenticated);
        assert_eq!(
            GatewayError::IdentityUnavailable("down".into()).kind(),
            FailureKind::ServiceUnavailable
        );
        assert_eq!(
            GatewayError::Upstream {
                service: "orders-service".into(),
                source: CallError::Timeout,
            }
            .kind(),
            FailureKind::GatewayTimeout
        );
        assert_eq!(
            GatewayError::Upstream {
                service: "orders-service".into(),
                source: CallError::CircuitOpen,
            }
            .kind(),
            FailureKind::ServiceUnavailable
        );
        let mismatch = RewriteError::Mismatch {
            path: "/api/admin/orders".into(),
            pattern: "/api/admin/orders/(?<segment>.*)".into(),
        };
        assert_eq!(GatewayError::from(mismatch).kind(), FailureKind::InternalError);
    }

    #[test]
    fn test_envelope_shape() {
        let envelope = ErrorEnvelope::new(FailureKind::NotFound, "/api/unknown/x");
        let json = serde_json::to_value(&envelope).unwrap();
        let obj = json.as_object().unwrap();
        assert_eq!(obj.len(), 6);
        assert_eq!(json["status"], 404);
        assert_eq!(json["error"], "Not Found");
        assert_eq!(json["message"], "Resource not found");
        assert_eq!(json["path"], "/api/unknown/x");
        assert_eq!(json["service"], "api-gateway");
        assert!(chrono::DateTime::parse_from_rfc3339(json["timestamp"].as_str().unwrap()).is_ok());
    }

    #[test]
    fn test_request_failure_renders_envelope() {
        let failure = RequestFailure {
            error: GatewayError::Forbidden {
                required: RequiredRole::Admin,
                role: Some(Role::Driver),
            },
            method: "GET".into(),
            path: "/api/admin/tracking/7".into(),
            route: Some("admin-tracking".into()),
            stage: DispatchStage::Authorizing,
        };
        let response = failure.error_response();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        assert_eq!(
            response.headers().get("content-type").unwrap(),
            "application/json"
        );
    }
}
