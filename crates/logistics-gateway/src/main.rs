use actix_web::{middleware::Logger, web, App, HttpServer};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use logistics_gateway::{
    config::GatewayConfig, metrics::register_metrics, routes, state::AppState,
};

#[tokio::main]
async fn main() -> std::io::Result<()> {
    // Load .env file if present
    dotenvy::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,actix_web=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let config = match GatewayConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            tracing::error!(error = %e, "invalid configuration");
            std::process::exit(1);
        }
    };
    let port = config.port;
    let allowed_origins = config.allowed_origins.clone();

    tracing::info!("Starting logistics-gateway on port {}", port);
    for rule in config.routes.rules() {
        tracing::info!(
            route = %rule.id,
            path = %rule.pattern.as_str(),
            service = %rule.target_service,
            role = rule.required_role.map(|r| r.as_str()).unwrap_or("public"),
            "route loaded"
        );
    }
    tracing::debug!(?config, "configuration");

    // Register Prometheus metrics
    register_metrics();

    let state = AppState::new(config).map_err(std::io::Error::other)?;
    let state_data = web::Data::new(state);

    HttpServer::new(move || {
        let cors = logistics_gateway::cors::build_cors(&allowed_origins);

        App::new()
            .app_data(state_data.clone())
            .wrap(Logger::default())
            .wrap(cors)
            .configure(routes::health::configure)
            // Everything that is not an observability endpoint is dispatched
            .default_service(web::to(routes::dispatch))
    })
    .bind(("0.0.0.0", port))?
    .run()
    .await
}
