use std::env;
use std::str::FromStr;
use std::time::Duration;

use crate::breaker::BreakerConfig;
use crate::discovery::{DiscoveryError, ServiceDiscovery, StaticDiscovery};
use crate::resilience::RetryPolicy;
use crate::route_table::{default_definitions, RouteConfigError, RouteDefinition, RouteTable};

const DEFAULT_PORT: u16 = 8080;
const DEFAULT_SERVICE_URLS: &str = "auth-service=http://localhost:8081,\
                                    orders-service=http://localhost:8082,\
                                    tracking-service=http://localhost:8083";
const DEFAULT_IDENTITY_SERVICE: &str = "auth-service";
const DEFAULT_VALIDATE_PATH: &str = "/api/auth/validate";
const DEFAULT_IDENTITY_TIMEOUT_MS: u64 = 3_000;
const DEFAULT_BACKEND_TIMEOUT_MS: u64 = 10_000;
const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 30_000;
const DEFAULT_RETRY_MAX: u32 = 2;
const DEFAULT_RETRY_BACKOFF_MS: u64 = 100;
const MAX_RETRY_MAX: u32 = 10;
const DEFAULT_MAX_BODY_BYTES: usize = 10 * 1024 * 1024;

#[derive(Clone)]
pub struct GatewayConfig {
    /// Server port
    pub port: u16,
    /// Compiled route table, in declaration order
    pub routes: RouteTable,
    /// Logical service name → base URL
    pub discovery: StaticDiscovery,
    /// Logical name of the identity service
    pub identity_service: String,
    /// Introspection endpoint path on the identity service
    pub identity_validate_path: String,
    /// Bound on one introspection call
    pub identity_timeout: Duration,
    /// Bound on one backend call, until response headers arrive
    pub backend_timeout: Duration,
    /// Bound on the whole dispatch of one request
    pub request_timeout: Duration,
    /// Retries after the first attempt
    pub max_retries: u32,
    pub retry_backoff: Duration,
    pub breaker: BreakerConfig,
    /// CORS allowed origins
    pub allowed_origins: Vec<String>,
    /// Inbound body limit
    pub max_body_bytes: usize,
    /// Bearer token required for /metrics endpoint (None = public)
    pub metrics_token: Option<String>,
}

impl std::fmt::Debug for GatewayConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GatewayConfig")
            .field("port", &self.port)
            .field("routes", &self.routes.len())
            .field("services", &self.discovery.services())
            .field("identity_service", &self.identity_service)
            .field("identity_validate_path", &self.identity_validate_path)
            .field("identity_timeout", &self.identity_timeout)
            .field("backend_timeout", &self.backend_timeout)
            .field("request_timeout", &self.request_timeout)
            .field("max_retries", &self.max_retries)
            .field("retry_backoff", &self.retry_backoff)
            .field("breaker", &self.breaker)
            .field("allowed_origins", &self.allowed_origins)
            .field("max_body_bytes", &self.max_body_bytes)
            .field(
                "metrics_token",
                &self.metrics_token.as_ref().map(|_| "[REDACTED]"),
            )
            .finish()
    }
}

impl GatewayConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build the configuration from any variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let port = parse_or(&var, "PORT", DEFAULT_PORT)?;

        // Optional: routes file, otherwise the built-in table
        let definitions = match var("ROUTES_FILE") {
            Some(path) => load_routes_file(&path)?,
            None => default_definitions(),
        };
        let routes = RouteTable::from_definitions(&definitions)?;

        let discovery = StaticDiscovery::parse(
            &var("SERVICE_URLS").unwrap_or_else(|| DEFAULT_SERVICE_URLS.to_string()),
        )?;

        let identity_service =
            var("IDENTITY_SERVICE").unwrap_or_else(|| DEFAULT_IDENTITY_SERVICE.to_string());
        let identity_validate_path =
            var("IDENTITY_VALIDATE_PATH").unwrap_or_else(|| DEFAULT_VALIDATE_PATH.to_string());
        if !identity_validate_path.starts_with('/') {
            return Err(ConfigError::Invalid {
                var: "IDENTITY_VALIDATE_PATH",
                reason: "must start with '/'".to_string(),
            });
        }

        let identity_timeout = millis(parse_or(
            &var,
            "IDENTITY_TIMEOUT_MS",
            DEFAULT_IDENTITY_TIMEOUT_MS,
        )?);
        let backend_timeout = millis(parse_or(
            &var,
            "BACKEND_TIMEOUT_MS",
            DEFAULT_BACKEND_TIMEOUT_MS,
        )?);
        let request_timeout = millis(parse_or(
            &var,
            "REQUEST_TIMEOUT_MS",
            DEFAULT_REQUEST_TIMEOUT_MS,
        )?);
        let max_retries = parse_or(&var, "RETRY_MAX", DEFAULT_RETRY_MAX)?;
        if max_retries > MAX_RETRY_MAX {
            return Err(ConfigError::Invalid {
                var: "RETRY_MAX",
                reason: format!("must be at most {MAX_RETRY_MAX}"),
            });
        }
        let retry_backoff = millis(parse_or(&var, "RETRY_BACKOFF_MS", DEFAULT_RETRY_BACKOFF_MS)?);

        let defaults = BreakerConfig::default();
        let breaker = BreakerConfig {
            failure_threshold: parse_or(
                &var,
                "BREAKER_FAILURE_THRESHOLD",
                defaults.failure_threshold,
            )?,
            failure_rate: parse_or(&var, "BREAKER_FAILURE_RATE", defaults.failure_rate)?,
            window_size: parse_or(&var, "BREAKER_WINDOW_SIZE", defaults.window_size)?,
            minimum_calls: parse_or(&var, "BREAKER_MIN_CALLS", defaults.minimum_calls)?,
            cooldown: Duration::from_secs(parse_or(
                &var,
                "BREAKER_COOLDOWN_SECS",
                defaults.cooldown.as_secs(),
            )?),
        };
        if breaker.failure_threshold == 0 {
            return Err(ConfigError::Invalid {
                var: "BREAKER_FAILURE_THRESHOLD",
                reason: "must be at least 1".to_string(),
            });
        }
        if !(breaker.failure_rate > 0.0 && breaker.failure_rate <= 1.0) {
            return Err(ConfigError::Invalid {
                var: "BREAKER_FAILURE_RATE",
                reason: "must be in (0, 1]".to_string(),
            });
        }
        if breaker.window_size == 0 {
            return Err(ConfigError::Invalid {
                var: "BREAKER_WINDOW_SIZE",
                reason: "must be at least 1".to_string(),
            });
        }
        // The rate trigger needs a window at least as large as the minimum
        if breaker.minimum_calls > breaker.window_size {
            return Err(ConfigError::Invalid {
                var: "BREAKER_MIN_CALLS",
                reason: format!(
                    "must not exceed BREAKER_WINDOW_SIZE ({})",
                    breaker.window_size
                ),
            });
        }

        let allowed_origins: Vec<String> = var("ALLOWED_ORIGINS")
            .map(|s| {
                s.split(',')
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .collect()
            })
            .unwrap_or_else(|| vec!["*".to_string()]);

        let max_body_bytes = parse_or(&var, "MAX_BODY_BYTES", DEFAULT_MAX_BODY_BYTES)?;

        let metrics_token = var("METRICS_TOKEN");
        if metrics_token.is_none() {
            tracing::warn!("METRICS_TOKEN not set, /metrics endpoint is publicly accessible");
        }

        for rule in routes.rules() {
            if discovery.resolve(&rule.target_service).is_none() {
                tracing::warn!(
                    route = %rule.id,
                    service = %rule.target_service,
                    "route targets a service missing from SERVICE_URLS; requests will get 503"
                );
            }
        }
        if discovery.resolve(&identity_service).is_none() {
            tracing::warn!(
                service = %identity_service,
                "identity service missing from SERVICE_URLS; protected routes will get 503"
            );
        }

        Ok(Self {
            port,
            routes,
            discovery,
            identity_service,
            identity_validate_path,
            identity_timeout,
            backend_timeout,
            request_timeout,
            max_retries,
            retry_backoff,
            breaker,
            allowed_origins,
            max_body_bytes,
            metrics_token,
        })
    }

    pub fn identity_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries,
            backoff: self.retry_backoff,
            call_timeout: self.identity_timeout,
        }
    }

    pub fn backend_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries,
            backoff: self.retry_backoff,
            call_timeout: self.backend_timeout,
        }
    }
}

fn millis(ms: u64) -> Duration {
    Duration::from_millis(ms)
}

fn parse_or<T, F>(var: &F, key: &'static str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    F: Fn(&str) -> Option<String>,
{
    match var(key) {
        Some(raw) => raw.trim().parse().map_err(|_| ConfigError::Invalid {
            var: key,
            reason: format!("cannot parse '{raw}'"),
        }),
        None => Ok(default),
    }
}

/// Read a JSON routes file: an array of route definitions.
pub fn load_routes_file(path: &str) -> Result<Vec<RouteDefinition>, ConfigError> {
    let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::RoutesFile {
        path: path.to_string(),
        source,
    })?;
    serde_json::from_str(&raw).map_err(|source| ConfigError::RoutesParse {
        path: path.to_string(),
        source,
    })
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value for {var}: {reason}")]
    Invalid { var: &'static str, reason: String },

    #[error("cannot read routes file {path}: {source}")]
    RoutesFile {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("cannot parse routes file {path}: {source}")]
    RoutesParse {
        path: String,
        #[source]
        source: serde_json::Error,
    },

    #[error(transparent)]
    Routes(#[from] RouteConfigError),

    #[error(transparent)]
    Discovery(#[from] DiscoveryError),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config_from(vars: &[(&str, &str)]) -> Result<GatewayConfig, ConfigError> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        GatewayConfig::from_lookup(|key| map.get(key).cloned())
    }

    #[test]
    fn test_defaults() {
        let config = config_from(&[]).unwrap();
        assert_eq!(config.port, 8080);
        assert_eq!(config.routes.len(), 7);
        assert_eq!(config.identity_service, "auth-service");
        assert_eq!(config.identity_validate_path, "/api/auth/validate");
        assert_eq!(config.max_retries, 2);
        assert_eq!(config.breaker.failure_threshold, 5);
        assert_eq!(config.allowed_origins, vec!["*"]);
        assert!(config.discovery.resolve("orders-service").is_some());
    }

    #[test]
    fn test_overrides() {
        let config = config_from(&[
            ("PORT", "9000"),
            ("SERVICE_URLS", "auth-service=http://auth:1,orders-service=http://orders:2"),
            ("RETRY_MAX", "0"),
            ("BREAKER_FAILURE_THRESHOLD", "3"),
            ("BREAKER_COOLDOWN_SECS", "5"),
            ("IDENTITY_TIMEOUT_MS", "250"),
            ("ALLOWED_ORIGINS", "http://localhost:3000, http://localhost:5173"),
            ("METRICS_TOKEN", "secret"),
        ])
        .unwrap();
        assert_eq!(config.port, 9000);
        assert_eq!(config.max_retries, 0);
        assert_eq!(config.breaker.failure_threshold, 3);
        assert_eq!(config.breaker.cooldown, Duration::from_secs(5));
        assert_eq!(config.identity_policy().call_timeout, Duration::from_millis(250));
        assert_eq!(config.allowed_origins.len(), 2);
        assert!(config.discovery.resolve("tracking-service").is_none());
        assert!(!format!("{config:?}").contains("secret"));
    }

    #[test]
    fn test_invalid_values_rejected() {
        assert!(matches!(
            config_from(&[("PORT", "http")]),
            Err(ConfigError::Invalid { var: "PORT", .. })
        ));
        assert!(matches!(
            config_from(&[("BREAKER_FAILURE_RATE", "1.5")]),
            Err(ConfigError::Invalid { .. })
        ));
        assert!(matches!(
            config_from(&[("RETRY_MAX", "4294967295")]),
            Err(ConfigError::Invalid { var: "RETRY_MAX", .. })
        ));
        assert!(matches!(
            config_from(&[("RETRY_MAX", "11")]),
            Err(ConfigError::Invalid { var: "RETRY_MAX", .. })
        ));
        assert!(matches!(
            config_from(&[("BREAKER_WINDOW_SIZE", "5"), ("BREAKER_MIN_CALLS", "10")]),
            Err(ConfigError::Invalid { var: "BREAKER_MIN_CALLS", .. })
        ));
        assert!(config_from(&[("RETRY_MAX", "10"), ("BREAKER_WINDOW_SIZE", "10")]).is_ok());
        assert!(matches!(
            config_from(&[("SERVICE_URLS", "orders-service")]),
            Err(ConfigError::Discovery(_))
        ));
        assert!(matches!(
            config_from(&[("ROUTES_FILE", "/nonexistent/routes.json")]),
            Err(ConfigError::RoutesFile { .. })
        ));
    }

    #[test]
    fn test_routes_file_is_loaded() {
        let path = std::env::temp_dir().join(format!("gateway-routes-{}.json", std::process::id()));
        std::fs::write(
            &path,
            r#"[{"id": "catch-all", "path": "/**", "service": "orders-service"}]"#,
        )
        .unwrap();
        let config = config_from(&[("ROUTES_FILE", path.to_str().unwrap())]).unwrap();
        std::fs::remove_file(&path).ok();

        assert_eq!(config.routes.len(), 1);
        assert_eq!(config.routes.find("/anything/at/all").unwrap().id, "catch-all");
    }

    #[test]
    fn test_bad_rewrite_in_routes_file_rejected() {
        let path =
            std::env::temp_dir().join(format!("gateway-bad-routes-{}.json", std::process::id()));
        std::fs::write(
            &path,
            r#"[{"id": "x", "path": "/x/**", "service": "s",
                 "rewrite": {"pattern": "/x/(?<segment>.*", "replacement": "/${segment}"}}]"#,
        )
        .unwrap();
        let result = config_from(&[("ROUTES_FILE", path.to_str().unwrap())]);
        std::fs::remove_file(&path).ok();
        assert!(matches!(result, Err(ConfigError::Routes(_))));
    }
}
