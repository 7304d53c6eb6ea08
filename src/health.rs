use axum::Json;
use serde::Serialize;

#[derive(Serialize)]
pub struct LivenessResponse {
    pub status: &'static str,
}

/// Liveness probe for the launching CLI; exempt from the POST-only rule.
pub async fn liveness() -> Json<LivenessResponse> {
    Json(LivenessResponse { status: "ok" })
}
