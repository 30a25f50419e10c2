use actix_web::{web, HttpRequest, HttpResponse};
use serde_json::{Map, Value};

use crate::error::{ErrorEnvelope, FailureKind, SERVICE_NAME};
use crate::metrics::metrics_output;
use crate::route_table::RouteDefinition;
use crate::state::AppState;

/// GET /api/gateway/health
pub async fn health(state: web::Data<AppState>) -> HttpResponse {
    let dependencies: Map<String, Value> = state
        .breakers
        .snapshot()
        .into_iter()
        .map(|(name, circuit)| (name, Value::String(circuit.to_string())))
        .collect();

    HttpResponse::Ok().json(serde_json::json!({
        "status": "UP",
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "service": SERVICE_NAME,
        "version": env!("CARGO_PKG_VERSION"),
        "dependencies": dependencies,
    }))
}

/// GET /api/gateway/info - routes as currently loaded
pub async fn info(state: web::Data<AppState>) -> HttpResponse {
    let routes: Vec<RouteDefinition> = state
        .routes()
        .rules()
        .iter()
        .map(|rule| rule.definition())
        .collect();

    HttpResponse::Ok().json(serde_json::json!({
        "name": SERVICE_NAME,
        "description": "Authentication and routing gateway for the logistics services",
        "version": env!("CARGO_PKG_VERSION"),
        "routes": routes,
    }))
}

/// Constant-time byte comparison that does not leak input lengths.
/// Both inputs are hashed to fixed-length digests before comparison.
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    use sha2::{Digest, Sha256};
    let ha = Sha256::digest(a);
    let hb = Sha256::digest(b);
    let mut result = 0u8;
    for (x, y) in ha.iter().zip(hb.iter()) {
        result |= x ^ y;
    }
    result == 0
}

/// GET /metrics - Prometheus metrics endpoint (optionally auth-gated)
pub async fn metrics(req: HttpRequest, state: web::Data<AppState>) -> HttpResponse {
    if let Some(ref expected_token) = state.config.metrics_token {
        let authorized = req
            .headers()
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "))
            .map(|token| constant_time_eq(token.as_bytes(), expected_token.as_bytes()))
            .unwrap_or(false);

        if !authorized {
            tracing::warn!(path = %req.path(), "metrics scrape rejected");
            return ErrorEnvelope::new(FailureKind::Unauthenticated, req.path()).into_response();
        }
    }

    HttpResponse::Ok()
        .content_type("text/plain; version=0.0.4")
        .body(metrics_output())
}

pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.route("/api/gateway/health", web::get().to(health))
        .route("/api/gateway/info", web::get().to(info))
        .route("/metrics", web::get().to(metrics));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_constant_time_eq() {
        assert!(constant_time_eq(b"secret", b"secret"));
        assert!(!constant_time_eq(b"secret", b"secreT"));
        assert!(!constant_time_eq(b"secret", b"secret-longer"));
    }
}
