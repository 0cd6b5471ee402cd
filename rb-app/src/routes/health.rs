use axum::Json;
use axum::routing::get;

/// Kept byte-identical to the payload existing monitors already match on.
const GREETING: &str = "Hello, this is the FastAPI application";

pub fn router() -> axum::Router {
    axum::Router::new()
        .route("/", get(get_root))
        .route("/health", get(get_health))
}

#[tracing::instrument(level = "debug", skip_all)]
async fn get_root() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "message": GREETING }))
}

#[tracing::instrument(level = "debug", skip_all)]
async fn get_health() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "healthy" }))
}
