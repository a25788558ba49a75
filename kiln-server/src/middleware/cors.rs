use tower_http::cors::{Any, CorsLayer};

/// Permissive CORS, restrictable via `CORS_ALLOWED_ORIGINS` (comma
/// separated). Local inference UIs are the common caller.
pub fn cors_layer() -> CorsLayer {
    let origins = std::env::var("CORS_ALLOWED_ORIGINS").ok();
    match origins {
        Some(origins_str) => {
            let origins: Vec<axum::http::HeaderValue> = origins_str
                .split(',')
                .filter_map(|s| s.trim().parse().ok())
                .collect();
            if origins.is_empty() {
                CorsLayer::new()
                    .allow_origin(Any)
                    .allow_headers(Any)
                    .allow_methods(Any)
            } else {
                CorsLayer::new()
                    .allow_origin(origins)
                    .allow_headers(Any)
                    .allow_methods(Any)
            }
        }
        None => CorsLayer::new()
            .allow_origin(Any)
            .allow_headers(Any)
            .allow_methods(Any),
    }
}
