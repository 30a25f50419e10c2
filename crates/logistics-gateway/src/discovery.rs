//! Logical service name to base URL resolution.

use std::collections::HashMap;

use url::Url;

/// Resolves a logical service name to a base URL.
///
/// Implementations decide how instances are picked; the gateway only needs
/// one address per call.
pub trait ServiceDiscovery: Send + Sync {
    fn resolve(&self, service: &str) -> Option<Url>;

    /// Names this resolver knows about, for diagnostics.
    fn services(&self) -> Vec<String> {
        Vec::new()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DiscoveryError {
    #[error("invalid service entry '{0}', expected name=url")]
    InvalidEntry(String),

    #[error("invalid URL for service '{service}': {url}")]
    InvalidUrl { service: String, url: String },
}

/// Fixed name → URL map, typically loaded from `SERVICE_URLS`.
#[derive(Debug, Clone, Default)]
pub struct StaticDiscovery {
    services: HashMap<String, Url>,
}

impl StaticDiscovery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_service(mut self, name: &str, url: Url) -> Self {
        self.services.insert(name.to_string(), url);
        self
    }

    /// Parse `name=url,name=url`.
    pub fn parse(spec: &str) -> Result<Self, DiscoveryError> {
        let mut services = HashMap::new();
        for entry in spec.split(',').map(str::trim).filter(|e| !e.is_empty()) {
            let (name, raw_url) = entry
                .split_once('=')
                .ok_or_else(|| DiscoveryError::InvalidEntry(entry.to_string()))?;
            let name = name.trim();
            let raw_url = raw_url.trim();
            if name.is_empty() {
                return Err(DiscoveryError::InvalidEntry(entry.to_string()));
            }
            let url = Url::parse(raw_url)
                .ok()
                .filter(|u| matches!(u.scheme(), "http" | "https") && u.host().is_some())
                .ok_or_else(|| DiscoveryError::InvalidUrl {
                    service: name.to_string(),
                    url: raw_url.to_string(),
                })?;
            services.insert(name.to_string(), url);
        }
        Ok(Self { services })
    }
}

impl ServiceDiscovery for StaticDiscovery {
    fn resolve(&self, service: &str) -> Option<Url> {
        self.services.get(service).cloned()
    }

    fn services(&self) -> Vec<String> {
        let mut names: Vec<String> = self.services.keys().cloned().collect();
        names.sort();
        names
    }
}

/// Join a resolved base URL with a request path and optional query string.
///
/// Any path already present on the base URL is kept as a prefix.
pub fn target_url(base: &Url, path: &str, query: Option<&str>) -> String {
    let base = base.as_str().trim_end_matches('/');
    match query {
        Some(q) if !q.is_empty() => format!("{base}{path}?{q}"),
        _ => format!("{base}{path}"),
    }
}
