//! Axum router construction.
//!
//! [`build`] assembles the application router:
//! - health / metrics routes,
//! - OpenAI-compatible `/v1` routes,
//! - CORS and per-request trace middleware,
//! - optional Swagger UI (disable with `ENABLE_SWAGGER=false`).

pub mod doc;
mod health;
mod v1;

use std::sync::Arc;

use axum::{middleware, Router};
use tower::ServiceBuilder;
use utoipa_swagger_ui::SwaggerUi;

use crate::middleware::{cors, trace};
use crate::state::AppState;

/// Build the complete Axum [`Router`] for the application.
pub fn build(state: Arc<AppState>) -> Router {
    let mut app = Router::new()
        .merge(health::router())
        .nest("/v1", v1::router());

    if state.config.enable_swagger {
        app = app.merge(
            SwaggerUi::new("/swagger-ui").url("/api-docs/openapi.json", doc::get_docs()),
        );
    }

    app.layer(
        ServiceBuilder::new()
            .layer(cors::cors_layer())
            .layer(middleware::from_fn(trace::trace_middleware)),
    )
    .with_state(state)
}
