use std::collections::HashMap;
use std::sync::Arc;

use crate::breaker::BreakerRegistry;
use crate::config::GatewayConfig;
use crate::discovery::ServiceDiscovery;
use crate::identity::TokenVerifier;
use crate::metrics::register_metrics;
use crate::middleware::FilterChain;
use crate::route_table::RouteTable;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<GatewayConfig>,
    pub discovery: Arc<dyn ServiceDiscovery>,
    pub breakers: Arc<BreakerRegistry>,
    pub verifier: Arc<TokenVerifier>,
    pub http_client: reqwest::Client,
    /// Filter chain per route id
    chains: Arc<HashMap<String, FilterChain>>,
}

impl AppState {
    pub fn new(config: GatewayConfig) -> Result<Self, reqwest::Error> {
        let discovery = Arc::new(config.discovery.clone());
        Self::with_discovery(config, discovery)
    }

    /// Build state around an explicit resolver.
    pub fn with_discovery(
        config: GatewayConfig,
        discovery: Arc<dyn ServiceDiscovery>,
    ) -> Result<Self, reqwest::Error> {
        register_metrics();

        // Per-attempt bounds are applied by the caller; a client-wide timeout
        // would also cut off long streamed bodies.
        let http_client = reqwest::Client::builder()
            .connect_timeout(config.backend_timeout)
            .redirect(reqwest::redirect::Policy::none())
            .build()?;

        let breakers = Arc::new(BreakerRegistry::new(config.breaker.clone()));
        let verifier = Arc::new(TokenVerifier::new(
            http_client.clone(),
            Arc::clone(&discovery),
            Arc::clone(&breakers),
            config.identity_service.clone(),
            config.identity_validate_path.clone(),
            config.identity_policy(),
        ));

        let chains = config
            .routes
            .rules()
            .iter()
            .map(|rule| (rule.id.clone(), FilterChain::for_route(rule, &verifier)))
            .collect();

        Ok(Self {
            config: Arc::new(config),
            discovery,
            breakers,
            verifier,
            http_client,
            chains: Arc::new(chains),
        })
    }

    pub fn routes(&self) -> &RouteTable {
        &self.config.routes
    }

    pub fn chain(&self, route_id: &str) -> Option<&FilterChain> {
        self.chains.get(route_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_every_route_has_a_chain() {
        let config = GatewayConfig::from_lookup(|_| None).unwrap();
        let state = AppState::new(config).unwrap();
        for rule in state.routes().rules() {
            assert!(state.chain(&rule.id).is_some(), "no chain for {}", rule.id);
        }
        assert_eq!(
            state.chain("admin-orders").unwrap().names(),
            vec!["authentication", "rewrite-path"]
        );
        assert!(state.chain("auth-service").unwrap().names().is_empty());
    }
}
