//! CORS configuration for the gateway.

use actix_cors::Cors;

/// Build the CORS middleware from allowed origins.
///
/// `*` admits any origin, matching the permissive policy the backends were
/// originally deployed behind.
pub fn build_cors(allowed_origins: &[String]) -> Cors {
    let allowed = allowed_origins.to_vec();
    Cors::default()
        .allowed_origin_fn(move |origin, _req_head| {
            let origin_str = origin.to_str().unwrap_or("");
            allowed.iter().any(|a| a == "*" || a == origin_str)
        })
        .allow_any_method()
        .allow_any_header()
        .supports_credentials()
        .max_age(3600)
}
