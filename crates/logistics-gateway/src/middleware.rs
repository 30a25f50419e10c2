//! Per-route filter chain.
//!
//! Each route gets an ordered list of filters built from its rule. Filters
//! run against a mutable [`RequestContext`]; returning `Ok(())` hands the
//! request to the next filter, an error ends the request.

use std::fmt;
use std::sync::Arc;

use actix_web::http::header::{HeaderMap, AUTHORIZATION};
use futures::future::BoxFuture;

use crate::error::GatewayError;
use crate::identity::{Identity, TokenVerifier, VerifyError};
use crate::rewrite::PathRewrite;
use crate::role::{satisfies, RequiredRole};
use crate::route_table::RouteRule;

/// Where a request is in its traversal; reported in failure logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchStage {
    Matching,
    Authenticating,
    Authorizing,
    Rewriting,
    Resolving,
    Forwarding,
}

impl fmt::Display for DispatchStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DispatchStage::Matching => "matching",
            DispatchStage::Authenticating => "authenticating",
            DispatchStage::Authorizing => "authorizing",
            DispatchStage::Rewriting => "rewriting",
            DispatchStage::Resolving => "resolving",
            DispatchStage::Forwarding => "forwarding",
        };
        f.write_str(s)
    }
}

/// Mutable state of one in-flight request.
pub struct RequestContext {
    pub method: String,
    /// Path to forward; starts as the inbound path and may be rewritten.
    pub path: String,
    pub query: Option<String>,
    pub headers: HeaderMap,
    pub identity: Option<Identity>,
    pub stage: DispatchStage,
}

impl RequestContext {
    pub fn new(method: &str, path: &str, query: Option<&str>, headers: HeaderMap) -> Self {
        Self {
            method: method.to_string(),
            path: path.to_string(),
            query: query.filter(|q| !q.is_empty()).map(str::to_string),
            headers,
            identity: None,
            stage: DispatchStage::Matching,
        }
    }
}

pub trait GatewayFilter: Send + Sync {
    fn name(&self) -> &'static str;

    fn apply<'a>(&'a self, ctx: &'a mut RequestContext) -> BoxFuture<'a, Result<(), GatewayError>>;
}

/// Authenticates the caller and enforces the route's required role.
pub struct AuthFilter {
    verifier: Arc<TokenVerifier>,
    required: RequiredRole,
}

impl AuthFilter {
    pub fn new(verifier: Arc<TokenVerifier>, required: RequiredRole) -> Self {
        Self { verifier, required }
    }
}

impl GatewayFilter for AuthFilter {
    fn name(&self) -> &'static str {
        "authentication"
    }

    fn apply<'a>(&'a self, ctx: &'a mut RequestContext) -> BoxFuture<'a, Result<(), GatewayError>> {
        Box::pin(async move {
            ctx.stage = DispatchStage::Authenticating;
            let header = match ctx.headers.get(AUTHORIZATION) {
                Some(value) => Some(
                    value
                        .to_str()
                        .map_err(|_| GatewayError::MissingCredentials)?
                        .to_string(),
                ),
                None => None,
            };

            let identity = self
                .verifier
                .verify(header.as_deref())
                .await
                .map_err(|e| match e {
                    VerifyError::Unauthenticated => GatewayError::MissingCredentials,
                    VerifyError::Unavailable(reason) => GatewayError::IdentityUnavailable(reason),
                })?;
            if !identity.valid {
                return Err(GatewayError::InvalidToken);
            }

            ctx.stage = DispatchStage::Authorizing;
            let allowed = identity
                .role
                .map(|role| satisfies(self.required, role))
                .unwrap_or(false);
            if !allowed {
                return Err(GatewayError::Forbidden {
                    required: self.required,
                    role: identity.role,
                });
            }

            ctx.identity = Some(identity);
            Ok(())
        })
    }
}

/// Rewrites the forwarded path. The query string is held separately in the
/// context and is never touched.
pub struct RewriteFilter {
    rewrite: PathRewrite,
}

impl RewriteFilter {
    pub fn new(rewrite: PathRewrite) -> Self {
        Self { rewrite }
    }
}

impl GatewayFilter for RewriteFilter {
    fn name(&self) -> &'static str {
        "rewrite-path"
    }

    fn apply<'a>(&'a self, ctx: &'a mut RequestContext) -> BoxFuture<'a, Result<(), GatewayError>> {
        Box::pin(async move {
            ctx.stage = DispatchStage::Rewriting;
            let rewritten = self.rewrite.apply(&ctx.path)?;
            tracing::debug!(from = %ctx.path, to = %rewritten, "path rewritten");
            ctx.path = rewritten;
            Ok(())
        })
    }
}

/// Ordered filters for one route.
#[derive(Clone, Default)]
pub struct FilterChain {
    filters: Vec<Arc<dyn GatewayFilter>>,
}

impl FilterChain {
    /// Authentication (when the route requires a role) runs before rewriting.
    pub fn for_route(rule: &RouteRule, verifier: &Arc<TokenVerifier>) -> Self {
        let mut filters: Vec<Arc<dyn GatewayFilter>> = Vec::new();
        if let Some(required) = rule.required_role {
            filters.push(Arc::new(AuthFilter::new(Arc::clone(verifier), required)));
        }
        if let Some(rewrite) = &rule.rewrite {
            filters.push(Arc::new(RewriteFilter::new(rewrite.clone())));
        }
        Self { filters }
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.filters.iter().map(|f| f.name()).collect()
    }

    pub async fn run(&self, ctx: &mut RequestContext) -> Result<(), GatewayError> {
        for filter in &self.filters {
            filter.apply(ctx).await?;
        }
        Ok(())
    }
}
