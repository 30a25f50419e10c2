//! Reverse-proxy leg of a request.
//!
//! Builds the backend request from the inbound one and sends it through the
//! target service's breaker. The backend's answer is streamed back as-is.

use std::time::Instant;

use actix_web::http::header::HeaderMap;
use actix_web::http::StatusCode;
use actix_web::HttpResponse;
use bytes::Bytes;
use futures::TryStreamExt;
use reqwest::header::{HeaderName, HeaderValue};

use crate::error::GatewayError;
use crate::identity::Identity;
use crate::metrics::UPSTREAM_LATENCY;
use crate::resilience::{self, Outcome};
use crate::state::AppState;

/// Hop-by-hop headers, never forwarded in either direction
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Headers to strip from client request before proxying
const HEADERS_TO_STRIP: &[&str] = &[
    "host",
    "content-length", // Will be recalculated
    // Identity headers are only ever set by the gateway
    "x-user-id",
    "x-user-email",
    "x-user-type",
    // Rebuilt below
    "x-forwarded-for",
    "x-forwarded-host",
    "x-forwarded-proto",
];

pub const USER_ID_HEADER: &str = "x-user-id";
pub const USER_EMAIL_HEADER: &str = "x-user-email";
pub const USER_TYPE_HEADER: &str = "x-user-type";

/// Client connection details appended as `X-Forwarded-*`.
#[derive(Debug, Clone, Default)]
pub struct ForwardedFor {
    pub peer: Option<String>,
    pub host: Option<String>,
    pub proto: String,
}

/// A request ready to be sent to a backend.
pub struct Upstream<'a> {
    pub service: &'a str,
    pub method: reqwest::Method,
    pub url: String,
    pub headers: reqwest::header::HeaderMap,
    pub body: Bytes,
}

fn is_stripped(name: &str) -> bool {
    HOP_BY_HOP.contains(&name) || HEADERS_TO_STRIP.contains(&name)
}

/// Methods that may be sent more than once without changing the outcome.
pub fn is_idempotent(method: &reqwest::Method) -> bool {
    matches!(
        *method,
        reqwest::Method::GET
            | reqwest::Method::HEAD
            | reqwest::Method::OPTIONS
            | reqwest::Method::PUT
            | reqwest::Method::DELETE
    )
}

/// Build the backend request headers from the inbound ones.
pub fn outbound_headers(
    inbound: &HeaderMap,
    identity: Option<&Identity>,
    forwarded: &ForwardedFor,
) -> reqwest::header::HeaderMap {
    let mut headers = reqwest::header::HeaderMap::new();

    for (name, value) in inbound.iter() {
        if is_stripped(name.as_str()) {
            continue;
        }
        if let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(name.as_str().as_bytes()),
            HeaderValue::from_bytes(value.as_bytes()),
        ) {
            headers.append(name, value);
        }
    }

    if let Some(identity) = identity {
        insert(&mut headers, USER_ID_HEADER, &identity.subject_id);
        insert(&mut headers, USER_EMAIL_HEADER, &identity.email);
        if let Some(role) = identity.role {
            insert(&mut headers, USER_TYPE_HEADER, role.as_str());
        }
    }

    let prior_for = inbound
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty());
    let chain = match (prior_for, forwarded.peer.as_deref()) {
        (Some(prior), Some(peer)) => Some(format!("{prior}, {peer}")),
        (Some(prior), None) => Some(prior.to_string()),
        (None, Some(peer)) => Some(peer.to_string()),
        (None, None) => None,
    };
    if let Some(chain) = chain {
        insert(&mut headers, "x-forwarded-for", &chain);
    }
    if let Some(host) = &forwarded.host {
        insert(&mut headers, "x-forwarded-host", host);
    }
    insert(&mut headers, "x-forwarded-proto", &forwarded.proto);

    headers
}

fn insert(headers: &mut reqwest::header::HeaderMap, name: &'static str, value: &str) {
    match HeaderValue::from_str(value) {
        Ok(value) => {
            headers.insert(HeaderName::from_static(name), value);
        }
        Err(_) => tracing::warn!(header = name, "dropping header with invalid value"),
    }
}

/// Send the request through the service's breaker and stream the answer back.
///
/// Backend 5xx answers are returned to the client as-is but still count as
/// failures for the breaker.
pub async fn forward(state: &AppState, upstream: Upstream<'_>) -> Result<HttpResponse, GatewayError> {
    let breaker = state.breakers.get(upstream.service);
    let policy = state.config.backend_policy();
    let retryable = is_idempotent(&upstream.method);
    let started = Instant::now();

    let response = resilience::call(&breaker, &policy, retryable, || {
        let mut builder = state
            .http_client
            .request(upstream.method.clone(), &upstream.url)
            .headers(upstream.headers.clone());
        if !upstream.body.is_empty() {
            builder = builder.body(upstream.body.clone());
        }
        async move {
            match builder.send().await {
                Ok(response) if response.status().is_server_error() => {
                    Outcome::Unhealthy(response)
                }
                Ok(response) => Outcome::Success(response),
                Err(e) => Outcome::Transient(e.to_string()),
            }
        }
    })
    .await
    .map_err(|source| GatewayError::Upstream {
        service: upstream.service.to_string(),
        source,
    })?;

    UPSTREAM_LATENCY
        .with_label_values(&[upstream.service])
        .observe(started.elapsed().as_secs_f64());

    Ok(stream_back(upstream.service, response))
}

fn stream_back(service: &str, response: reqwest::Response) -> HttpResponse {
    let status =
        StatusCode::from_u16(response.status().as_u16()).unwrap_or(StatusCode::BAD_GATEWAY);
    let mut builder = HttpResponse::build(status);

    for (name, value) in response.headers().iter() {
        let name = name.as_str();
        // The gateway's CORS middleware is the sole authority for CORS headers.
        if HOP_BY_HOP.contains(&name)
            || name == "content-length"
            || name.starts_with("access-control-")
        {
            continue;
        }
        builder.append_header((name, value.as_bytes()));
    }

    let service = service.to_string();
    let body = response.bytes_stream().inspect_err(move |e| {
        tracing::error!(service = %service, error = %e, "backend body stream failed");
    });
    builder.streaming(body)
}
