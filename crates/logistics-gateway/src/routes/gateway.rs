//! The request dispatcher.
//!
//! Every request not claimed by an observability endpoint lands here and is
//! walked through match → filter chain → resolve → forward. Whatever happens,
//! exactly one response leaves: the backend's, or an error envelope.

use actix_web::{web, HttpRequest, HttpResponse};
use bytes::{Bytes, BytesMut};
use futures::StreamExt;

use crate::discovery::target_url;
use crate::error::{GatewayError, RequestFailure};
use crate::metrics::REQUESTS_TOTAL;
use crate::middleware::{DispatchStage, RequestContext};
use crate::proxy::{self, ForwardedFor, Upstream};
use crate::route_table::RouteRule;
use crate::state::AppState;

const UNMATCHED: &str = "unmatched";

/// Reject paths that would escape the matched prefix once normalized by a
/// backend. Checked against the decoded form.
fn has_traversal(path: &str) -> bool {
    let decoded = urlencoding::decode(path).unwrap_or(std::borrow::Cow::Borrowed(path));
    decoded.split('/').any(|segment| segment == "..") || decoded.contains('\0')
}

/// Collect the inbound body, refusing anything past `limit`.
async fn read_body(payload: &mut web::Payload, limit: usize) -> Result<Bytes, GatewayError> {
    let mut body = BytesMut::new();
    while let Some(chunk) = payload.next().await {
        let chunk =
            chunk.map_err(|e| GatewayError::Internal(format!("failed to read body: {e}")))?;
        if body.len() + chunk.len() > limit {
            return Err(GatewayError::Internal(format!(
                "request body exceeds {limit} bytes"
            )));
        }
        body.extend_from_slice(&chunk);
    }
    Ok(body.freeze())
}

/// Default service handler.
///
/// The body is only read once the caller is authorized, and under the
/// overall request timeout.
pub async fn dispatch(
    req: HttpRequest,
    payload: web::Payload,
    state: web::Data<AppState>,
) -> Result<HttpResponse, RequestFailure> {
    let method = req.method().as_str().to_string();
    let path = req.path().to_string();

    let rule = if has_traversal(&path) {
        None
    } else {
        state.routes().find(&path)
    };
    let Some(rule) = rule else {
        return Err(record(RequestFailure {
            error: GatewayError::NoRoute,
            method,
            path,
            route: None,
            stage: DispatchStage::Matching,
        }));
    };

    let mut ctx = RequestContext::new(
        &method,
        &path,
        Some(req.query_string()),
        req.headers().clone(),
    );

    let traversal = traverse(&req, &state, rule, &mut ctx, payload);
    let result = match tokio::time::timeout(state.config.request_timeout, traversal).await {
        Ok(result) => result,
        Err(_) => Err(GatewayError::RequestTimeout),
    };

    match result {
        Ok(response) => {
            tracing::debug!(
                method = %method,
                path = %path,
                route = %rule.id,
                status = response.status().as_u16(),
                "request forwarded"
            );
            REQUESTS_TOTAL
                .with_label_values(&[rule.id.as_str(), response.status().as_str()])
                .inc();
            Ok(response)
        }
        Err(error) => Err(record(RequestFailure {
            error,
            method,
            path,
            route: Some(rule.id.clone()),
            stage: ctx.stage,
        })),
    }
}

async fn traverse(
    req: &HttpRequest,
    state: &AppState,
    rule: &RouteRule,
    ctx: &mut RequestContext,
    mut payload: web::Payload,
) -> Result<HttpResponse, GatewayError> {
    let chain = state
        .chain(&rule.id)
        .ok_or_else(|| GatewayError::Internal(format!("no filter chain for route '{}'", rule.id)))?;
    chain.run(ctx).await?;

    ctx.stage = DispatchStage::Resolving;
    let base = state
        .discovery
        .resolve(&rule.target_service)
        .ok_or_else(|| GatewayError::Unresolved(rule.target_service.clone()))?;
    let url = target_url(&base, &ctx.path, ctx.query.as_deref());

    ctx.stage = DispatchStage::Forwarding;
    let body = read_body(&mut payload, state.config.max_body_bytes).await?;
    let method = reqwest::Method::from_bytes(ctx.method.as_bytes())
        .map_err(|e| GatewayError::Internal(format!("unsupported method: {e}")))?;
    let forwarded = {
        let conn = req.connection_info();
        ForwardedFor {
            peer: req.peer_addr().map(|addr| addr.ip().to_string()),
            host: Some(conn.host().to_string()),
            proto: conn.scheme().to_string(),
        }
    };
    let headers = proxy::outbound_headers(&ctx.headers, ctx.identity.as_ref(), &forwarded);

    tracing::debug!(
        route = %rule.id,
        service = %rule.target_service,
        url = %url,
        "forwarding request"
    );
    proxy::forward(
        state,
        Upstream {
            service: &rule.target_service,
            method,
            url,
            headers,
            body,
        },
    )
    .await
}

fn record(failure: RequestFailure) -> RequestFailure {
    let status = failure.error.kind().status();
    REQUESTS_TOTAL
        .with_label_values(&[failure.route.as_deref().unwrap_or(UNMATCHED), status.as_str()])
        .inc();
    failure
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_traversal_detection() {
        assert!(has_traversal("/api/orders/../admin/orders/1"));
        assert!(has_traversal("/api/orders/%2e%2e/admin"));
        assert!(!has_traversal("/api/orders/1..2"));
        assert!(!has_traversal("/api/orders/42/status"));
    }
}
