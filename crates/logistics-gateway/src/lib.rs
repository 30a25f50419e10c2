pub mod breaker;
pub mod config;
pub mod cors;
pub mod discovery;
pub mod error;
pub mod identity;
pub mod metrics;
pub mod middleware;
pub mod proxy;
pub mod resilience;
pub mod rewrite;
pub mod role;
pub mod route_table;
pub mod routes;
pub mod state;

pub use config::GatewayConfig;
pub use error::GatewayError;
pub use state::AppState;
