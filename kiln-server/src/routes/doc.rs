use utoipa::OpenApi;

use crate::routes::{health, v1};

#[derive(OpenApi)]
#[openapi(info(
    title = "kiln-server",
    description = "OpenAI-compatible serving layer for local LLM inference",
    version = "0.2.0",
))]
pub struct ApiDoc;

pub fn get_docs() -> utoipa::openapi::OpenApi {
    let mut root = ApiDoc::openapi();
    root.merge(v1::api_docs());
    root.merge(health::HealthApi::openapi());
    root
}
