//! OpenAI-compatible `/v1` routes.

mod chat;
mod completions;

use std::sync::Arc;

use axum::Router;
use utoipa::OpenApi;

use crate::state::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .merge(chat::router())
        .merge(completions::router())
}

pub fn api_docs() -> utoipa::openapi::OpenApi {
    let mut docs = chat::ChatApi::openapi();
    docs.merge(completions::CompletionsApi::openapi());
    docs
}
