//! Ordered route table.
//!
//! Rules are matched in declaration order and the first match wins, so a more
//! specific prefix (e.g. `/api/admin/orders/**`) must be declared before any
//! broader rule that would otherwise shadow it.

use serde::{Deserialize, Serialize};

use crate::rewrite::{PathRewrite, RewriteError};
use crate::role::RequiredRole;

/// Route rule as written in the routes file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RouteDefinition {
    pub id: String,
    pub path: String,
    pub service: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub required_role: Option<RequiredRole>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rewrite: Option<RewriteDefinition>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RewriteDefinition {
    pub pattern: String,
    pub replacement: String,
}

#[derive(Debug, thiserror::Error)]
pub enum RouteConfigError {
    #[error("route '{id}': invalid path pattern '{pattern}': {reason}")]
    InvalidPattern {
        id: String,
        pattern: String,
        reason: &'static str,
    },

    #[error("route '{id}': {source}")]
    InvalidRewrite {
        id: String,
        #[source]
        source: RewriteError,
    },

    #[error("route '{0}': target service must not be empty")]
    MissingService(String),

    #[error("duplicate route id: {0}")]
    DuplicateId(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    /// Segment containing `*`, matched character-wise within one segment.
    Wildcard(String),
    /// Trailing `**`: zero or more remaining segments.
    Rest,
}

/// Glob pattern over `/`-separated path segments.
#[derive(Debug, Clone)]
pub struct PathPattern {
    raw: String,
    segments: Vec<Segment>,
}

impl PathPattern {
    pub fn parse(raw: &str) -> Result<Self, &'static str> {
        if !raw.starts_with('/') {
            return Err("pattern must start with '/'");
        }
        let parts: Vec<&str> = raw[1..].split('/').collect();
        let last = parts.len() - 1;
        let mut segments = Vec::with_capacity(parts.len());
        for (i, part) in parts.iter().enumerate() {
            if part.contains("**") {
                if *part != "**" || i != last {
                    return Err("'**' is only allowed as the final segment");
                }
                segments.push(Segment::Rest);
            } else if part.contains('*') {
                segments.push(Segment::Wildcard(part.to_string()));
            } else {
                segments.push(Segment::Literal(part.to_string()));
            }
        }
        Ok(Self {
            raw: raw.to_string(),
            segments,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    pub fn matches(&self, path: &str) -> bool {
        let Some(rest) = path.strip_prefix('/') else {
            return false;
        };
        let parts: Vec<&str> = rest.split('/').collect();

        for (i, segment) in self.segments.iter().enumerate() {
            match segment {
                Segment::Rest => return true,
                Segment::Literal(lit) => match parts.get(i) {
                    Some(part) if part == lit => {}
                    _ => return false,
                },
                Segment::Wildcard(glob) => match parts.get(i) {
                    Some(part) if !part.is_empty() && wildcard_match(glob, part) => {}
                    _ => return false,
                },
            }
        }
        parts.len() == self.segments.len()
    }
}

/// `*` matches any run of characters inside a single segment.
fn wildcard_match(glob: &str, text: &str) -> bool {
    let pieces: Vec<&str> = glob.split('*').collect();
    let last = pieces.len() - 1;
    let mut cursor = 0;
    for (i, piece) in pieces.iter().enumerate() {
        if i == 0 {
            if !text.starts_with(piece) {
                return false;
            }
            cursor = piece.len();
        } else if i == last {
            return text.len() >= cursor + piece.len() && text.ends_with(piece);
        } else {
            match text[cursor..].find(piece) {
                Some(idx) => cursor += idx + piece.len(),
                None => return false,
            }
        }
    }
    cursor == text.len()
}

/// A compiled route rule. Immutable once loaded.
#[derive(Debug, Clone)]
pub struct RouteRule {
    pub id: String,
    pub pattern: PathPattern,
    pub target_service: String,
    pub required_role: Option<RequiredRole>,
    pub rewrite: Option<PathRewrite>,
}

impl RouteRule {
    pub fn compile(def: &RouteDefinition) -> Result<Self, RouteConfigError> {
        let pattern =
            PathPattern::parse(&def.path).map_err(|reason| RouteConfigError::InvalidPattern {
                id: def.id.clone(),
                pattern: def.path.clone(),
                reason,
            })?;
        if def.service.trim().is_empty() {
            return Err(RouteConfigError::MissingService(def.id.clone()));
        }
        let rewrite = def
            .rewrite
            .as_ref()
            .map(|rw| PathRewrite::new(&rw.pattern, &rw.replacement))
            .transpose()
            .map_err(|source| RouteConfigError::InvalidRewrite {
                id: def.id.clone(),
                source,
            })?;
        Ok(Self {
            id: def.id.clone(),
            pattern,
            target_service: def.service.trim().to_string(),
            required_role: def.required_role,
            rewrite,
        })
    }

    pub fn is_public(&self) -> bool {
        self.required_role.is_none()
    }

    /// Definition view of this rule, as reported on the info endpoint.
    pub fn definition(&self) -> RouteDefinition {
        RouteDefinition {
            id: self.id.clone(),
            path: self.pattern.as_str().to_string(),
            service: self.target_service.clone(),
            required_role: self.required_role,
            rewrite: self.rewrite.as_ref().map(|rw| RewriteDefinition {
                pattern: rw.pattern().to_string(),
                replacement: rw.replacement().to_string(),
            }),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct RouteTable {
    rules: Vec<RouteRule>,
}

impl RouteTable {
    pub fn from_definitions(defs: &[RouteDefinition]) -> Result<Self, RouteConfigError> {
        let mut rules: Vec<RouteRule> = Vec::with_capacity(defs.len());
        for def in defs {
            if rules.iter().any(|r| r.id == def.id) {
                return Err(RouteConfigError::DuplicateId(def.id.clone()));
            }
            rules.push(RouteRule::compile(def)?);
        }
        Ok(Self { rules })
    }

    /// First rule whose pattern matches `path`, in declaration order.
    pub fn find(&self, path: &str) -> Option<&RouteRule> {
        self.rules.iter().find(|rule| rule.pattern.matches(path))
    }

    pub fn rules(&self) -> &[RouteRule] {
        &self.rules
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

fn route(
    id: &str,
    path: &str,
    service: &str,
    required_role: Option<RequiredRole>,
    rewrite: Option<(&str, &str)>,
) -> RouteDefinition {
    RouteDefinition {
        id: id.to_string(),
        path: path.to_string(),
        service: service.to_string(),
        required_role,
        rewrite: rewrite.map(|(pattern, replacement)| RewriteDefinition {
            pattern: pattern.to_string(),
            replacement: replacement.to_string(),
        }),
    }
}

/// Route table used when no routes file is configured.
pub fn default_definitions() -> Vec<RouteDefinition> {
    use RequiredRole::{Admin, Driver, User};

    vec![
        route("auth-service", "/api/auth/**", "auth-service", None, None),
        route("orders-service", "/api/orders/**", "orders-service", Some(User), None),
        route("tracking-service", "/api/tracking/**", "tracking-service", Some(User), None),
        route(
            "admin-orders",
            "/api/admin/orders/**",
            "orders-service",
            Some(Admin),
            Some(("/api/admin/orders(?<segment>/.*)?", "/api/orders${segment}")),
        ),
        route(
            "admin-tracking",
            "/api/admin/tracking/**",
            "tracking-service",
            Some(Admin),
            Some(("/api/admin/tracking(?<segment>/.*)?", "/api/tracking${segment}")),
        ),
        route(
            "driver-orders",
            "/api/driver/orders/**",
            "orders-service",
            Some(Driver),
            Some(("/api/driver/orders(?<segment>/.*)?", "/api/orders${segment}")),
        ),
        route(
            "driver-tracking",
            "/api/driver/tracking/**",
            "tracking-service",
            Some(Driver),
            Some(("/api/driver/tracking(?<segment>/.*)?", "/api/tracking${segment}")),
        ),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pattern(raw: &str) -> PathPattern {
        PathPattern::parse(raw).unwrap()
    }

    #[test]
    fn test_trailing_double_star() {
        let p = pattern("/api/orders/**");
        assert!(p.matches("/api/orders"));
        assert!(p.matches("/api/orders/"));
        assert!(p.matches("/api/orders/7"));
        assert!(p.matches("/api/orders/7/status"));
        assert!(!p.matches("/api/ordersx/7"));
        assert!(!p.matches("/api/tracking/7"));
    }

    #[test]
    fn test_single_segment_wildcard() {
        let p = pattern("/api/*/health");
        assert!(p.matches("/api/orders/health"));
        assert!(!p.matches("/api/health"));
        assert!(!p.matches("/api/orders/7/health"));
        assert!(!p.matches("/api//health"));

        let p = pattern("/files/*.json");
        assert!(p.matches("/files/report.json"));
        assert!(!p.matches("/files/report.xml"));
    }

    #[test]
    fn test_literal_pattern_is_exact() {
        let p = pattern("/api/gateway/health");
        assert!(p.matches("/api/gateway/health"));
        assert!(!p.matches("/api/gateway/health/x"));
        assert!(!p.matches("/api/gateway"));
    }

    #[test]
    fn test_invalid_patterns() {
        assert!(PathPattern::parse("api/orders").is_err());
        assert!(PathPattern::parse("/api/**/orders").is_err());
        assert!(PathPattern::parse("/api/orders**").is_err());
    }

    #[test]
    fn test_wildcard_match() {
        assert!(wildcard_match("*", "anything"));
        assert!(wildcard_match("a*c", "abbbc"));
        assert!(wildcard_match("a*b*c", "axxbyyc"));
        assert!(!wildcard_match("a*c", "abbb"));
        assert!(!wildcard_match("ab*ba", "aba"));
    }

    #[test]
    fn test_default_table_routes() {
        let table = RouteTable::from_definitions(&default_definitions()).unwrap();
        assert_eq!(table.len(), 7);

        assert_eq!(table.find("/api/auth/login").unwrap().id, "auth-service");
        assert!(table.find("/api/auth/login").unwrap().is_public());
        assert_eq!(table.find("/api/orders/7").unwrap().id, "orders-service");
        assert_eq!(table.find("/api/admin/tracking/7").unwrap().id, "admin-tracking");
        assert_eq!(
            table.find("/api/driver/orders/1/accept").unwrap().target_service,
            "orders-service"
        );
        assert!(table.find("/api/unknown/x").is_none());
    }

    #[test]
    fn test_default_rewrites_cover_every_matched_path() {
        let table = RouteTable::from_definitions(&default_definitions()).unwrap();
        let cases = [
            ("/api/admin/orders", "/api/orders"),
            ("/api/admin/orders/", "/api/orders/"),
            ("/api/admin/orders/42/status", "/api/orders/42/status"),
            ("/api/admin/tracking", "/api/tracking"),
            ("/api/driver/orders/1/accept", "/api/orders/1/accept"),
            ("/api/driver/tracking", "/api/tracking"),
        ];
        for (path, expected) in cases {
            let rule = table.find(path).unwrap();
            let rewrite = rule.rewrite.as_ref().unwrap();
            assert_eq!(rewrite.apply(path).unwrap(), expected, "rewriting {path}");
        }
    }

    #[test]
    fn test_first_match_wins() {
        let defs = vec![
            route("general", "/api/**", "catch-all", None, None),
            route("orders", "/api/orders/**", "orders-service", Some(RequiredRole::User), None),
        ];
        let table = RouteTable::from_definitions(&defs).unwrap();
        // The broader rule is declared first and shadows the specific one.
        assert_eq!(table.find("/api/orders/7").unwrap().id, "general");
    }

    #[test]
    fn test_duplicate_ids_rejected() {
        let defs = vec![
            route("orders", "/api/orders/**", "orders-service", None, None),
            route("orders", "/api/orders2/**", "orders-service", None, None),
        ];
        assert!(matches!(
            RouteTable::from_definitions(&defs),
            Err(RouteConfigError::DuplicateId(_))
        ));
    }

    #[test]
    fn test_routes_file_format() {
        let json = r#"[
            {"id": "orders", "path": "/api/orders/**", "service": "orders-service", "requiredRole": "USER"},
            {"id": "admin", "path": "/api/admin/orders/**", "service": "orders-service",
             "requiredRole": "ADMIN",
             "rewrite": {"pattern": "/api/admin/orders/(?<segment>.*)", "replacement": "/api/orders/${segment}"}}
        ]"#;
        let defs: Vec<RouteDefinition> = serde_json::from_str(json).unwrap();
        let table = RouteTable::from_definitions(&defs).unwrap();
        let admin = table.find("/api/admin/orders/3").unwrap();
        assert_eq!(admin.required_role, Some(RequiredRole::Admin));
        assert_eq!(
            admin.rewrite.as_ref().unwrap().apply("/api/admin/orders/3").unwrap(),
            "/api/orders/3"
        );
    }

    #[test]
    fn test_unknown_role_in_routes_file_rejected() {
        let json = r#"[{"id": "x", "path": "/x/**", "service": "s", "requiredRole": "ROOT"}]"#;
        assert!(serde_json::from_str::<Vec<RouteDefinition>>(json).is_err());
    }
}
