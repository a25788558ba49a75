//! Deprecated legacy completion endpoint.

use std::sync::Arc;

use axum::routing::post;
use axum::Router;
use utoipa::OpenApi;

use crate::error::ServerError;
use crate::state::AppState;

#[derive(OpenApi)]
#[openapi(paths(completions))]
pub struct CompletionsApi;

pub fn router() -> Router<Arc<AppState>> {
    Router::new().route("/completions", post(completions))
}

/// `POST /v1/completions` – gone since serving v2.
#[utoipa::path(
    post,
    path = "/v1/completions",
    tag = "chat",
    responses((status = 400, description = "Endpoint deprecated"))
)]
pub async fn completions() -> ServerError {
    ServerError::bad_request(
        "The /v1/completions endpoint is deprecated. Please use /v1/chat/completions instead.",
        "endpoint_deprecated",
    )
}
